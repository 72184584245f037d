//! DSvn FS Administration CLI

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dsvn_fs::format::CURRENT_FORMAT;
use dsvn_fs::{FsService, FsStore, NodeKind, PackOutcome, StoreConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dsvn-fsadmin")]
#[command(author = "DSvn Contributors")]
#[command(version = "0.1.0")]
#[command(about = "DSvn revision store administration tool")]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new store
    Create {
        path: PathBuf,
        #[arg(long, default_value = "1000")]
        shard_size: u64,
        #[arg(long, default_value_t = CURRENT_FORMAT)]
        format: u32,
        /// Compress packed revision properties
        #[arg(long)]
        compress_revprops: bool,
    },

    /// Show store format, UUID and youngest revision
    Info { path: PathBuf },

    /// Pack complete shards
    Pack {
        path: PathBuf,
        /// Pack only this shard
        #[arg(short, long)]
        shard: Option<u64>,
        /// Stop after this many seconds, leaving remaining shards loose
        #[arg(long)]
        timeout: Option<u64>,
        /// Keep running, packing every N seconds
        #[arg(long)]
        watch: Option<u64>,
    },

    /// Check revision checksums, representations and revision properties
    Verify {
        path: PathBuf,
        #[arg(short, long)]
        start: Option<u64>,
        #[arg(short, long)]
        end: Option<u64>,
    },

    /// Print a file as of a revision
    Cat {
        path: PathBuf,
        file: String,
        #[arg(short, long)]
        revision: Option<u64>,
    },

    /// List a directory as of a revision
    Ls {
        path: PathBuf,
        #[arg(default_value = "/")]
        dir: String,
        #[arg(short, long)]
        revision: Option<u64>,
    },

    /// Read or change revision properties
    Revprop {
        #[command(subcommand)]
        command: RevpropCommands,
    },
}

#[derive(Subcommand, Debug)]
enum RevpropCommands {
    /// Print one property, or all of them when no name is given
    Get {
        path: PathBuf,
        revision: u64,
        name: Option<String>,
    },

    /// Set a property; without a value the property is deleted
    Set {
        path: PathBuf,
        revision: u64,
        name: String,
        value: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = if cli.debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();

    match cli.command {
        Commands::Create {
            path,
            shard_size,
            format,
            compress_revprops,
        } => {
            let config = StoreConfig::default()
                .with_shard_size(shard_size)
                .with_compressed_revprops(compress_revprops);
            let store = FsStore::create_with_format(&path, config, format)
                .with_context(|| format!("creating store at {}", path.display()))?;
            println!("Store created (UUID: {})", store.uuid());
        }

        Commands::Info { path } => {
            let store = open(&path)?;
            let format = store.format();
            println!("Path: {}", path.display());
            println!("UUID: {}", store.uuid());
            println!("Format: {}", format.version());
            println!("Shard size: {}", format.shard_size());
            println!("Youngest revision: {}", store.youngest()?);
            let complete = format.complete_shards(store.youngest()?);
            println!("Complete shards: {}", complete);
        }

        Commands::Pack {
            path,
            shard,
            timeout,
            watch,
        } => {
            let store = open(&path)?;
            if let Some(interval) = watch {
                let service = FsService::new(store);
                let task = service.spawn_pack_task(Duration::from_secs(interval.max(1)));
                tokio::signal::ctrl_c().await?;
                task.abort();
                return Ok(());
            }
            match shard {
                Some(shard) => {
                    let outcome = store.pack_shard(shard)?;
                    let revprops = if store.format().supports_packed_revprops() {
                        Some(store.pack_revprops_shard(shard)?)
                    } else {
                        None
                    };
                    println!("Shard {}: {}", shard, describe(outcome));
                    if let Some(outcome) = revprops {
                        println!("Shard {} revprops: {}", shard, describe(outcome));
                    }
                }
                None => {
                    let summary = match timeout {
                        Some(secs) => store.pack_until(Instant::now() + Duration::from_secs(secs))?,
                        None => store.pack()?,
                    };
                    if summary.busy {
                        bail!("another packer is running");
                    }
                    println!(
                        "Packed {} content shard(s) {:?}, {} revprop shard(s) {:?}",
                        summary.content_shards.len(),
                        summary.content_shards,
                        summary.revprop_shards.len(),
                        summary.revprop_shards
                    );
                    if let Some(shard) = summary.aborted {
                        println!("Timed out at shard {}; it and later shards stay loose", shard);
                    }
                }
            }
        }

        Commands::Verify { path, start, end } => {
            let store = open(&path)?;
            let end = end.unwrap_or(store.youngest()?);
            let start = start.unwrap_or(0);
            let report = store.verify(start..=end)?;
            println!(
                "Verified r{}..=r{}: {} revision(s), {} representation(s)",
                start, end, report.revisions, report.representations
            );
        }

        Commands::Cat {
            path,
            file,
            revision,
        } => {
            let store = open(&path)?;
            let rev = match revision {
                Some(rev) => rev,
                None => store.youngest()?,
            };
            std::io::stdout().write_all(&store.read_file(rev, &file)?)?;
        }

        Commands::Ls {
            path,
            dir,
            revision,
        } => {
            let store = open(&path)?;
            let rev = match revision {
                Some(rev) => rev,
                None => store.youngest()?,
            };
            for entry in store.list_dir(rev, &dir)? {
                match entry.kind {
                    NodeKind::Dir => println!("{}/", entry.name),
                    NodeKind::File => println!("{}", entry.name),
                }
            }
        }

        Commands::Revprop { command } => match command {
            RevpropCommands::Get {
                path,
                revision,
                name: Some(name),
            } => {
                let store = open(&path)?;
                match store.read_revision_property(revision, &name)? {
                    Some(value) => std::io::stdout().write_all(&value)?,
                    None => bail!("r{} has no property {:?}", revision, name),
                }
            }
            RevpropCommands::Get {
                path,
                revision,
                name: None,
            } => {
                let store = open(&path)?;
                for (name, value) in store.read_all_properties(revision)?.iter() {
                    println!("{}: {}", name, String::from_utf8_lossy(value));
                }
            }
            RevpropCommands::Set {
                path,
                revision,
                name,
                value,
            } => {
                let store = open(&path)?;
                store.write_revision_property(revision, &name, value.as_deref().map(str::as_bytes))?;
            }
        },
    }

    Ok(())
}

fn open(path: &Path) -> Result<FsStore> {
    FsStore::open(path).with_context(|| format!("opening store at {}", path.display()))
}

fn describe(outcome: PackOutcome) -> &'static str {
    match outcome {
        PackOutcome::Packed => "packed",
        PackOutcome::AlreadyPacked => "already packed",
        PackOutcome::Busy => "skipped, another packer is running",
    }
}
