//! Shard layout
//!
//! Maps a revision number to where its bytes currently live:
//!
//! ```text
//! {root}/
//!   revs/{shard}/{rev}              loose revision file
//!   revs/{shard}.pack/pack          packed shard
//!   revs/{shard}.pack/manifest      offsets of members inside `pack`
//!   revprops/{shard}/{rev}          loose revision properties
//!   revprops/{shard}.pack/pack      packed revprops, manifest embedded
//!   revprops/{shard}.pack/manifest  marker written after the pack
//! ```
//!
//! A shard counts as packed once its manifest exists. Packing publishes the
//! manifest before it removes the loose files, so a reader that resolved a
//! loose location and then finds the file gone simply resolves again.

use crate::error::{FsError, Result};
use crate::format::FormatDescriptor;
use crate::manifest::Manifest;
use lru::LruCache;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

pub const PACK_FILE: &str = "pack";
pub const MANIFEST_FILE: &str = "manifest";

const PACKED_SHARD_CACHE: usize = 64;
const RESOLVE_ATTEMPTS: usize = 4;

/// The two independently packed storage tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Track {
    Revs,
    Revprops,
}

impl Track {
    pub fn dir_name(&self) -> &'static str {
        match self {
            Track::Revs => "revs",
            Track::Revprops => "revprops",
        }
    }
}

/// Physical location of one revision's data
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Loose(PathBuf),
    Packed {
        pack: PathBuf,
        offset: u64,
        length: u64,
    },
}

impl Location {
    /// Length of the revision's data
    pub fn len(&self) -> Result<u64> {
        match self {
            Location::Loose(path) => Ok(fs::metadata(path)?.len()),
            Location::Packed { length, .. } => Ok(*length),
        }
    }

    /// Open the revision's data positioned `offset` bytes in.
    /// Returns the file and the number of bytes left in the revision.
    pub fn open_at(&self, offset: u64) -> Result<(File, u64)> {
        let (mut file, start, length) = match self {
            Location::Loose(path) => {
                let file = File::open(path)?;
                let length = file.metadata()?.len();
                (file, 0, length)
            }
            Location::Packed {
                pack,
                offset: start,
                length,
            } => (File::open(pack)?, *start, *length),
        };
        if offset > length {
            return Err(FsError::Corrupt(format!(
                "offset {} beyond end of revision data ({} bytes)",
                offset, length
            )));
        }
        file.seek(SeekFrom::Start(start + offset))?;
        Ok((file, length - offset))
    }

    /// Read the whole revision
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let (file, remaining) = self.open_at(0)?;
        let mut buf = Vec::with_capacity(remaining as usize);
        file.take(remaining).read_to_end(&mut buf)?;
        if buf.len() as u64 != remaining {
            return Err(FsError::Corrupt(format!(
                "revision data truncated: {} of {} bytes",
                buf.len(),
                remaining
            )));
        }
        Ok(buf)
    }
}

/// Parsed manifest of a packed content shard. Packed is terminal for content,
/// so these can be cached; a loose answer never is.
#[derive(Debug)]
struct PackedShard {
    manifest: Manifest,
    pack_len: u64,
}

/// Resolves revision numbers to loose files or pack members
pub struct ShardLayout {
    root: PathBuf,
    format: FormatDescriptor,
    packed: Mutex<LruCache<u64, Arc<PackedShard>>>,
}

impl ShardLayout {
    /// Create a layout for the store at `root`. A requested shard size that
    /// contradicts the format descriptor is refused.
    pub fn new(
        root: &Path,
        format: FormatDescriptor,
        requested_shard_size: Option<u64>,
    ) -> Result<Self> {
        if let Some(requested) = requested_shard_size {
            if requested != format.shard_size() {
                return Err(FsError::FormatMismatch(format!(
                    "requested shard size {} but store uses {}",
                    requested,
                    format.shard_size()
                )));
            }
        }
        let capacity = NonZeroUsize::new(PACKED_SHARD_CACHE).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            root: root.to_path_buf(),
            format,
            packed: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn format(&self) -> &FormatDescriptor {
        &self.format
    }

    pub fn track_dir(&self, track: Track) -> PathBuf {
        self.root.join(track.dir_name())
    }

    /// Directory of loose files for `shard`
    pub fn shard_dir(&self, track: Track, shard: u64) -> PathBuf {
        self.track_dir(track).join(shard.to_string())
    }

    pub fn pack_dir(&self, track: Track, shard: u64) -> PathBuf {
        self.track_dir(track).join(format!("{}.pack", shard))
    }

    pub fn pack_path(&self, track: Track, shard: u64) -> PathBuf {
        self.pack_dir(track, shard).join(PACK_FILE)
    }

    pub fn manifest_path(&self, track: Track, shard: u64) -> PathBuf {
        self.pack_dir(track, shard).join(MANIFEST_FILE)
    }

    pub fn loose_path(&self, track: Track, rev: u64) -> PathBuf {
        self.shard_dir(track, self.format.shard_of(rev))
            .join(rev.to_string())
    }

    /// Probe whether `shard` of `track` is packed
    pub fn is_packed(&self, track: Track, shard: u64) -> bool {
        if track == Track::Revs && self.cache().contains(&shard) {
            return true;
        }
        self.manifest_path(track, shard).exists()
    }

    /// Where the content of `rev` lives right now
    pub fn locate(&self, rev: u64) -> Result<Location> {
        let shard = self.format.shard_of(rev);
        if let Some(packed) = self.packed_shard(shard)? {
            let (offset, length) = packed
                .manifest
                .member_range(rev, packed.pack_len)
                .ok_or_else(|| {
                    FsError::Corrupt(format!("r{} missing from manifest of shard {}", rev, shard))
                })?;
            return Ok(Location::Packed {
                pack: self.pack_path(Track::Revs, shard),
                offset,
                length,
            });
        }
        Ok(Location::Loose(self.loose_path(Track::Revs, rev)))
    }

    /// Run `read` against the current location of `rev`, resolving again when
    /// a concurrent pack moved the loose file away.
    pub fn read_revision<T>(&self, rev: u64, mut read: impl FnMut(&Location) -> Result<T>) -> Result<T> {
        self.resolve(
            || format!("r{}", rev),
            FsError::is_not_found,
            || {
                let location = self.locate(rev)?;
                read(&location)
            },
        )
    }

    /// Retry `attempt` while it fails with an error `retryable` accepts.
    /// This is the only place that tolerates the loose/packed race.
    pub(crate) fn resolve<T>(
        &self,
        what: impl Fn() -> String,
        retryable: impl Fn(&FsError) -> bool,
        mut attempt: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut tries = 1;
        loop {
            match attempt() {
                Err(e) if tries < RESOLVE_ATTEMPTS && retryable(&e) => {
                    debug!("{} changed location while reading ({}), resolving again", what(), e);
                    tries += 1;
                    std::thread::yield_now();
                }
                other => return other,
            }
        }
    }

    fn packed_shard(&self, shard: u64) -> Result<Option<Arc<PackedShard>>> {
        let cached = self.cache().get(&shard).cloned();
        if cached.is_some() {
            return Ok(cached);
        }

        let text = match fs::read_to_string(self.manifest_path(Track::Revs, shard)) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let manifest = Manifest::parse(&text)?;
        let pack_len = fs::metadata(self.pack_path(Track::Revs, shard))?.len();

        let packed = Arc::new(PackedShard { manifest, pack_len });
        self.cache().put(shard, packed.clone());
        Ok(Some(packed))
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<u64, Arc<PackedShard>>> {
        self.packed.lock().unwrap_or_else(|e| e.into_inner())
    }
}
