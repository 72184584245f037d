//! Shard packing
//!
//! Packing a shard concatenates its loose member files into one `pack` file
//! with a `manifest` of member offsets, then removes the loose files:
//!
//! 1. stream members into `pack.tmp`, verifying each revision's trailer
//! 2. write `manifest.tmp`, fsync both
//! 3. rename `pack`, then `manifest` (the manifest marks the shard packed)
//! 4. remove the loose shard directory
//!
//! A crash before step 3 leaves only temporaries, which the next attempt
//! discards. A crash between 3 and 4 leaves loose leftovers, which the next
//! attempt removes without copying anything again.

use crate::checksum::Checksum;
use crate::config::StoreConfig;
use crate::error::{FsError, Result};
use crate::fsutil;
use crate::layout::{ShardLayout, Track, MANIFEST_FILE, PACK_FILE};
use crate::lock::{LockFile, PACK_LOCK_FILE, WRITE_LOCK_FILE};
use crate::manifest::Manifest;
use crate::properties::PropertySet;
use crate::revision::{Trailer, TRAILER_LEN};
use crate::revprops::{publish_pack, PackMode, RevpropPack};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

const COPY_BUFFER: usize = 64 * 1024;

/// Result of a pack request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackOutcome {
    Packed,
    AlreadyPacked,
    /// Another packer holds the pack lock
    Busy,
}

/// What a full pack pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackSummary {
    pub content_shards: Vec<u64>,
    pub revprop_shards: Vec<u64>,
    pub busy: bool,
    /// Shard that was left loose when the deadline passed
    pub aborted: Option<u64>,
}

impl PackSummary {
    pub fn is_empty(&self) -> bool {
        self.content_shards.is_empty() && self.revprop_shards.is_empty()
    }
}

pub struct Packer<'a> {
    layout: &'a ShardLayout,
    config: &'a StoreConfig,
    deadline: Option<Instant>,
}

impl<'a> Packer<'a> {
    pub fn new(layout: &'a ShardLayout, config: &'a StoreConfig) -> Self {
        Self {
            layout,
            config,
            deadline: None,
        }
    }

    /// Give up, leaving shards loose, once `deadline` passes
    pub fn with_deadline(mut self, deadline: Option<Instant>) -> Self {
        self.deadline = deadline;
        self
    }

    /// Pack the content of `shard`, given the youngest committed revision
    pub fn pack_shard(&self, shard: u64, youngest: u64) -> Result<PackOutcome> {
        let Some(_pack_lock) = self.try_pack_lock()? else {
            return Ok(PackOutcome::Busy);
        };
        self.pack_content_locked(shard, youngest)
    }

    /// Pack the revision properties of `shard`
    pub fn pack_revprops_shard(&self, shard: u64, youngest: u64) -> Result<PackOutcome> {
        let Some(_pack_lock) = self.try_pack_lock()? else {
            return Ok(PackOutcome::Busy);
        };
        self.pack_revprops_locked(shard, youngest)
    }

    /// Pack every complete shard, content first, oldest first. Passing the
    /// deadline ends the pass early; the summary still lists what was packed.
    pub fn pack_all(&self, youngest: u64) -> Result<PackSummary> {
        let mut summary = PackSummary::default();
        let Some(_pack_lock) = self.try_pack_lock()? else {
            summary.busy = true;
            return Ok(summary);
        };

        match self.pack_all_locked(youngest, &mut summary) {
            Ok(()) => {}
            Err(FsError::PackAborted { shard }) => {
                info!(
                    "Pack deadline reached at shard {} after {} content and {} revprop shard(s)",
                    shard,
                    summary.content_shards.len(),
                    summary.revprop_shards.len()
                );
                summary.aborted = Some(shard);
            }
            Err(e) => return Err(e),
        }
        Ok(summary)
    }

    fn pack_all_locked(&self, youngest: u64, summary: &mut PackSummary) -> Result<()> {
        let format = self.layout.format();
        let complete = format.complete_shards(youngest);
        if format.supports_packing() {
            for shard in 0..complete {
                if self.pack_content_locked(shard, youngest)? == PackOutcome::Packed {
                    summary.content_shards.push(shard);
                }
            }
        }
        if format.supports_packed_revprops() {
            for shard in 0..complete {
                if self.pack_revprops_locked(shard, youngest)? == PackOutcome::Packed {
                    summary.revprop_shards.push(shard);
                }
            }
        }
        Ok(())
    }

    fn try_pack_lock(&self) -> Result<Option<LockFile>> {
        LockFile::try_acquire(&self.layout.root().join(PACK_LOCK_FILE))
    }

    fn check_ready(&self, shard: u64, youngest: u64) -> Result<(u64, u64)> {
        match self.layout.format().shard_bounds(shard) {
            Some((first, last)) if last <= youngest => Ok((first, last)),
            _ => Err(FsError::IncompleteShard { shard, youngest }),
        }
    }

    fn check_deadline(&self, shard: u64) -> Result<()> {
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(FsError::PackAborted { shard }),
            _ => Ok(()),
        }
    }

    fn pack_content_locked(&self, shard: u64, youngest: u64) -> Result<PackOutcome> {
        let format = self.layout.format();
        if !format.supports_packing() {
            return Err(FsError::FormatMismatch(format!(
                "format {} does not support packing",
                format.version()
            )));
        }
        let (first, last) = self.check_ready(shard, youngest)?;

        if self.layout.is_packed(Track::Revs, shard) {
            self.remove_leftovers(Track::Revs, shard)?;
            return Ok(PackOutcome::AlreadyPacked);
        }
        for rev in first..=last {
            if !self.layout.loose_path(Track::Revs, rev).exists() {
                return Err(FsError::IncompleteShard { shard, youngest });
            }
        }

        let pack_dir = self.layout.pack_dir(Track::Revs, shard);
        fs::create_dir_all(&pack_dir)?;
        discard_stale_temporaries(&pack_dir)?;

        let pack_path = pack_dir.join(PACK_FILE);
        let manifest_path = pack_dir.join(MANIFEST_FILE);
        let pack_tmp = fsutil::temp_path(&pack_path);
        let manifest_tmp = fsutil::temp_path(&manifest_path);

        let written = (|| -> Result<u64> {
            let mut pack = File::create(&pack_tmp)?;
            let mut manifest = Manifest::new();
            let mut offset = 0u64;
            for rev in first..=last {
                self.check_deadline(shard)?;
                manifest.push(rev, offset)?;
                offset += copy_verified(&self.layout.loose_path(Track::Revs, rev), rev, &mut pack)?;
            }
            pack.sync_all()?;

            let mut file = File::create(&manifest_tmp)?;
            file.write_all(manifest.to_text().as_bytes())?;
            file.sync_all()?;
            Ok(offset)
        })();

        let pack_len = match written {
            Ok(len) => len,
            Err(e) => {
                if matches!(e, FsError::ChecksumMismatch { .. }) {
                    warn!("Not packing shard {}: {}", shard, e);
                }
                fsutil::remove_if_exists(&pack_tmp)?;
                fsutil::remove_if_exists(&manifest_tmp)?;
                return Err(e);
            }
        };

        fs::rename(&pack_tmp, &pack_path)?;
        fs::rename(&manifest_tmp, &manifest_path)?;
        fsutil::sync_dir(&pack_dir)?;

        self.remove_loose_dir(Track::Revs, shard)?;
        info!(
            "Packed shard {} (r{}..=r{}, {} bytes)",
            shard, first, last, pack_len
        );
        Ok(PackOutcome::Packed)
    }

    fn pack_revprops_locked(&self, shard: u64, youngest: u64) -> Result<PackOutcome> {
        let format = self.layout.format();
        if !format.supports_packed_revprops() {
            return Err(FsError::FormatMismatch(format!(
                "format {} does not support packed revision properties",
                format.version()
            )));
        }
        let (first, last) = self.check_ready(shard, youngest)?;
        let _write_lock = LockFile::acquire(&self.layout.root().join(WRITE_LOCK_FILE))?;

        if self.layout.is_packed(Track::Revprops, shard) {
            self.remove_leftovers(Track::Revprops, shard)?;
            return Ok(PackOutcome::AlreadyPacked);
        }

        let mut members = Vec::with_capacity((last - first + 1) as usize);
        for rev in first..=last {
            self.check_deadline(shard)?;
            let bytes = match fs::read(self.layout.loose_path(Track::Revprops, rev)) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(FsError::IncompleteShard { shard, youngest });
                }
                Err(e) => return Err(e.into()),
            };
            PropertySet::from_bytes(&bytes)
                .map_err(|e| FsError::Corrupt(format!("revprops of r{}: {}", rev, e)))?;
            members.push(bytes);
        }

        let mode = if self.config.compress_packed_revprops {
            PackMode::Zstd
        } else {
            PackMode::Plain
        };
        let (pack, manifest) =
            RevpropPack::build(first, &members, mode)?.encode(self.config.compression_level)?;

        let pack_dir = self.layout.pack_dir(Track::Revprops, shard);
        fs::create_dir_all(&pack_dir)?;
        discard_stale_temporaries(&pack_dir)?;
        self.check_deadline(shard)?;
        publish_pack(&pack_dir, &pack, &manifest)?;

        self.remove_loose_dir(Track::Revprops, shard)?;
        info!(
            "Packed revprops of shard {} ({:?}, {} bytes)",
            shard,
            mode,
            pack.len()
        );
        Ok(PackOutcome::Packed)
    }

    fn remove_leftovers(&self, track: Track, shard: u64) -> Result<()> {
        if self.layout.shard_dir(track, shard).exists() {
            warn!(
                "Removing loose {} of already packed shard {}",
                track.dir_name(),
                shard
            );
            self.remove_loose_dir(track, shard)?;
        }
        Ok(())
    }

    fn remove_loose_dir(&self, track: Track, shard: u64) -> Result<()> {
        match fs::remove_dir_all(self.layout.shard_dir(track, shard)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        fsutil::sync_dir(&self.layout.track_dir(track))?;
        Ok(())
    }
}

/// Drop temporaries left by an interrupted attempt
fn discard_stale_temporaries(pack_dir: &Path) -> Result<()> {
    for entry in fs::read_dir(pack_dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") && fsutil::remove_if_exists(&path)? {
            warn!("Discarded stale {:?}", path);
        }
    }
    Ok(())
}

/// Append the loose revision at `path` to `out`, checking it against its
/// trailer on the way. Returns the number of bytes copied.
fn copy_verified(path: &Path, rev: u64, out: &mut impl Write) -> Result<u64> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < TRAILER_LEN as u64 {
        return Err(FsError::Corrupt(format!("r{} is shorter than its trailer", rev)));
    }

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; COPY_BUFFER];
    let mut remaining = len - TRAILER_LEN as u64;
    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = file.read(&mut buf[..want])?;
        if n == 0 {
            return Err(FsError::Corrupt(format!("r{} truncated while packing", rev)));
        }
        hasher.update(&buf[..n]);
        out.write_all(&buf[..n])?;
        remaining -= n as u64;
    }

    let mut tail = [0u8; TRAILER_LEN];
    file.read_exact(&mut tail)?;
    let trailer = Trailer::parse(&tail)?;
    let actual = Checksum::new(hasher.finalize().into());
    if actual != trailer.checksum {
        return Err(FsError::checksum_mismatch(format!("r{}", rev), &trailer.checksum, &actual));
    }
    out.write_all(&tail)?;
    Ok(len)
}
