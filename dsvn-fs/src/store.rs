//! Revision store
//!
//! Layout on disk:
//! ```text
//! {root}/
//!   format                  format version and shard size
//!   config.json             encoding and packing tunables
//!   uuid                    store UUID
//!   current                 youngest revision number (text)
//!   write-lock, pack-lock   advisory lock files
//!   revs/                   revision files, loose or packed per shard
//!   revprops/               revision properties, loose or packed per shard
//!   txns/                   scratch space for commits in progress
//! ```

use crate::checksum::Checksum;
use crate::config::{StoreConfig, DEFAULT_SHARD_SIZE};
use crate::error::{FsError, Result};
use crate::format::{FormatDescriptor, CURRENT_FORMAT, FORMAT_FILE};
use crate::fsutil;
use crate::layout::{ShardLayout, Track};
use crate::lock::{LockFile, WRITE_LOCK_FILE};
use crate::packer::{PackOutcome, PackSummary, Packer};
use crate::properties::{svn_props, PropertySet};
use crate::rep::{RepHandle, RepReader};
use crate::revision::{
    self, decode_listing, normalize_path, CommitBuilder, DirEntry, NodeKind, NodeRecord,
    RevisionRoot, Trailer, Txn,
};
use crate::revprops::RevpropStore;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

pub const CURRENT_FILE: &str = "current";
pub const UUID_FILE: &str = "uuid";
pub const TXNS_DIR: &str = "txns";

/// Summary of one revision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionInfo {
    pub revision: u64,
    pub author: Option<String>,
    pub message: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
    /// SHA-256 of the revision file body
    pub checksum: Checksum,
}

/// What a verify pass looked at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    pub revisions: u64,
    pub representations: u64,
}

pub struct FsStore {
    root: PathBuf,
    uuid: Uuid,
    config: StoreConfig,
    layout: ShardLayout,
    youngest: AtomicU64,
}

impl FsStore {
    /// Create a store at the current format
    pub fn create(root: &Path, config: StoreConfig) -> Result<Self> {
        Self::create_with_format(root, config, CURRENT_FORMAT)
    }

    /// Create a store at an older format version
    pub fn create_with_format(root: &Path, mut config: StoreConfig, version: u32) -> Result<Self> {
        if root.join(FORMAT_FILE).exists() {
            return Err(FsError::AlreadyExists(root.display().to_string()));
        }
        let shard_size = config.shard_size.unwrap_or(DEFAULT_SHARD_SIZE);
        let format = FormatDescriptor::new(version, shard_size)?;
        config.shard_size = Some(shard_size);

        for dir in [Track::Revs.dir_name(), Track::Revprops.dir_name(), TXNS_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        let write_lock = LockFile::acquire(&root.join(WRITE_LOCK_FILE))?;
        config.save(root)?;
        fsutil::write_atomic(&root.join(UUID_FILE), Uuid::new_v4().to_string().as_bytes())?;

        let layout = ShardLayout::new(root, format, None)?;
        let builder = CommitBuilder::new(&layout, &config);
        let initial = builder.prepare(Txn::new(0, RevisionRoot::default()))?;
        let bytes = builder.finish(initial, 0, None)?;
        fsutil::write_atomic_in(&root.join(TXNS_DIR), &layout.loose_path(Track::Revs, 0), &bytes)?;

        let mut props = PropertySet::new();
        props.set(svn_props::DATE, now_rfc3339());
        RevpropStore::new(&layout, &config).write_loose(0, &props)?;
        fsutil::write_atomic(&root.join(CURRENT_FILE), b"0\n")?;

        // The format file goes last: without it the directory is not a store
        format.save(root)?;
        drop(write_lock);
        info!(
            "Created store at {:?} (format {}, shard size {})",
            root, version, shard_size
        );
        Self::open_with_config(root, config)
    }

    /// Open an existing store with its saved configuration
    pub fn open(root: &Path) -> Result<Self> {
        let config = StoreConfig::load(root)?;
        Self::open_with_config(root, config)
    }

    /// Open an existing store. A shard size in `config` must match the store's.
    pub fn open_with_config(root: &Path, config: StoreConfig) -> Result<Self> {
        let format = FormatDescriptor::load(root)?;
        let layout = ShardLayout::new(root, format, config.shard_size)?;

        let uuid_text = fs::read_to_string(root.join(UUID_FILE))?;
        let uuid = Uuid::parse_str(uuid_text.trim())
            .map_err(|e| FsError::Corrupt(format!("bad store uuid {:?}: {}", uuid_text.trim(), e)))?;
        let youngest = read_current(root)?;

        Ok(Self {
            root: root.to_path_buf(),
            uuid,
            config,
            layout,
            youngest: AtomicU64::new(youngest),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn uuid(&self) -> &Uuid {
        &self.uuid
    }

    pub fn format(&self) -> &FormatDescriptor {
        self.layout.format()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Youngest committed revision, as recorded in `current`
    pub fn youngest(&self) -> Result<u64> {
        let youngest = read_current(&self.root)?;
        self.youngest.fetch_max(youngest, Ordering::AcqRel);
        Ok(self.youngest.load(Ordering::Acquire))
    }

    /// Start a transaction against the youngest revision
    pub fn begin_txn(&self) -> Result<Txn> {
        let youngest = self.youngest()?;
        Ok(Txn::new(youngest, self.revision_root(youngest)?))
    }

    /// Commit `txn` with the given revision properties; returns the new revision.
    /// `svn:date` is filled in when absent.
    pub fn commit_revision(&self, txn: Txn, props: PropertySet) -> Result<u64> {
        let builder = CommitBuilder::new(&self.layout, &self.config);
        let prepared = builder.prepare(txn)?;

        let _write_lock = LockFile::acquire(&self.root.join(WRITE_LOCK_FILE))?;
        let txns_dir = self.root.join(TXNS_DIR);
        self.discard_orphans(&txns_dir)?;

        let youngest = self.youngest()?;
        let rev = youngest + 1;
        let newer = if prepared.base_revision() != youngest {
            Some(self.revision_root(youngest)?)
        } else {
            None
        };
        let bytes = builder.finish(prepared, rev, newer.as_ref())?;
        fsutil::write_atomic_in(&txns_dir, &self.layout.loose_path(Track::Revs, rev), &bytes)?;

        let mut props = props;
        if !props.contains(svn_props::DATE) {
            props.set(svn_props::DATE, now_rfc3339());
        }
        RevpropStore::new(&self.layout, &self.config).write_loose(rev, &props)?;

        // Until `current` moves the new revision does not exist
        fsutil::write_atomic_in(&txns_dir, &self.root.join(CURRENT_FILE), format!("{}\n", rev).as_bytes())?;
        self.youngest.fetch_max(rev, Ordering::AcqRel);

        info!("Committed r{} ({} bytes)", rev, bytes.len());
        Ok(rev)
    }

    /// Expanded content of a representation
    pub fn read_representation(&self, handle: RepHandle) -> Result<Vec<u8>> {
        self.check_revision(handle.revision)?;
        RepReader::new(&self.layout).load(handle)
    }

    /// Node map of `rev`
    pub fn revision_root(&self, rev: u64) -> Result<RevisionRoot> {
        self.check_revision(rev)?;
        revision::load_root(&self.layout, rev)
    }

    /// Record of the node at `path` in `rev`
    pub fn node(&self, rev: u64, path: &str) -> Result<NodeRecord> {
        let normalized = normalize_path(path)?;
        self.revision_root(rev)?
            .get(&normalized)
            .copied()
            .ok_or_else(|| FsError::PathNotFound {
                rev,
                path: format!("/{}", normalized),
            })
    }

    pub fn read_file(&self, rev: u64, path: &str) -> Result<Vec<u8>> {
        let node = self.node(rev, path)?;
        if node.kind != NodeKind::File {
            return Err(FsError::NotAFile(path.to_string()));
        }
        self.read_representation(node.content)
    }

    pub fn list_dir(&self, rev: u64, path: &str) -> Result<Vec<DirEntry>> {
        let node = self.node(rev, path)?;
        if node.kind != NodeKind::Dir {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        decode_listing(&self.read_representation(node.content)?)
    }

    pub fn node_props(&self, rev: u64, path: &str) -> Result<PropertySet> {
        match self.node(rev, path)?.props {
            Some(handle) => PropertySet::from_bytes(&self.read_representation(handle)?),
            None => Ok(PropertySet::new()),
        }
    }

    pub fn revision_info(&self, rev: u64) -> Result<RevisionInfo> {
        let props = self.read_all_properties(rev)?;
        let trailer = self.layout.read_revision(rev, Trailer::read)?;
        Ok(RevisionInfo {
            revision: rev,
            author: props.get_str(svn_props::AUTHOR).map(str::to_string),
            message: props.get_str(svn_props::LOG).map(str::to_string),
            timestamp: props
                .get_str(svn_props::DATE)
                .and_then(|d| DateTime::parse_from_rfc3339(d).ok())
                .map(|d| d.with_timezone(&Utc)),
            checksum: trailer.checksum,
        })
    }

    pub fn read_revision_property(&self, rev: u64, name: &str) -> Result<Option<Vec<u8>>> {
        self.check_revision(rev)?;
        RevpropStore::new(&self.layout, &self.config).get(rev, name)
    }

    pub fn read_all_properties(&self, rev: u64) -> Result<PropertySet> {
        self.check_revision(rev)?;
        RevpropStore::new(&self.layout, &self.config).get_all(rev)
    }

    /// Set a revision property, or delete it with `None`
    pub fn write_revision_property(&self, rev: u64, name: &str, value: Option<&[u8]>) -> Result<()> {
        self.check_revision(rev)?;
        let write_lock = LockFile::acquire(&self.root.join(WRITE_LOCK_FILE))?;
        RevpropStore::new(&self.layout, &self.config).set(rev, name, value, &write_lock)
    }

    pub fn pack_shard(&self, shard: u64) -> Result<PackOutcome> {
        self.packer(None).pack_shard(shard, self.youngest()?)
    }

    pub fn pack_revprops_shard(&self, shard: u64) -> Result<PackOutcome> {
        self.packer(None).pack_revprops_shard(shard, self.youngest()?)
    }

    /// Pack every complete shard
    pub fn pack(&self) -> Result<PackSummary> {
        self.packer(None).pack_all(self.youngest()?)
    }

    /// Pack every complete shard until `deadline`; `aborted` in the summary
    /// names the shard left loose when time ran out
    pub fn pack_until(&self, deadline: Instant) -> Result<PackSummary> {
        self.packer(Some(deadline)).pack_all(self.youngest()?)
    }

    /// Check trailers, representations and revision properties of `range`
    pub fn verify(&self, range: RangeInclusive<u64>) -> Result<VerifyReport> {
        let mut report = VerifyReport::default();
        let reader = RepReader::new(&self.layout);
        for rev in range {
            self.check_revision(rev)?;
            let bytes = self.layout.read_revision(rev, |location| location.read_all())?;
            revision::verify_revision_bytes(rev, &bytes)?;

            let root = revision::load_root(&self.layout, rev)?;
            for (_, node) in root.nodes() {
                for handle in std::iter::once(node.content).chain(node.props) {
                    if handle.revision == rev {
                        reader.load(handle)?;
                        report.representations += 1;
                    }
                }
            }
            self.read_all_properties(rev)?;
            report.revisions += 1;
        }
        Ok(report)
    }

    fn packer(&self, deadline: Option<Instant>) -> Packer<'_> {
        Packer::new(&self.layout, &self.config).with_deadline(deadline)
    }

    fn check_revision(&self, rev: u64) -> Result<()> {
        if rev > self.youngest.load(Ordering::Acquire) && rev > self.youngest()? {
            return Err(FsError::NoSuchRevision(rev));
        }
        Ok(())
    }

    /// Remove temporaries of commits that died before renaming them.
    /// Only called with the write lock held.
    fn discard_orphans(&self, txns_dir: &Path) -> Result<()> {
        let entries = match fs::read_dir(txns_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            warn!("Removing orphaned commit temporary {:?}", path);
            fsutil::remove_if_exists(&path)?;
        }
        Ok(())
    }
}

fn read_current(root: &Path) -> Result<u64> {
    let text = fs::read_to_string(root.join(CURRENT_FILE))?;
    text.trim()
        .parse::<u64>()
        .map_err(|_| FsError::Corrupt(format!("bad current file {:?}", text)))
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
