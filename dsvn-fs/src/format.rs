//! On-disk format descriptor
//!
//! The `format` file at the store root records the format version and the
//! shard size:
//!
//! ```text
//! format 3
//! layout sharded 1000
//! ```
//!
//! It is read once when a store is opened and never changes afterwards.

use crate::error::{FsError, Result};
use crate::fsutil;
use std::fs;
use std::path::Path;

pub const FORMAT_FILE: &str = "format";

/// Oldest readable format: sharded loose revisions, plain and delta representations
pub const MIN_FORMAT: u32 = 1;
/// First format that allows packing revision shards
pub const PACKING_FORMAT: u32 = 2;
/// First format with compressed representations and packed revision properties
pub const COMPRESSION_FORMAT: u32 = 3;
/// Format written by new stores
pub const CURRENT_FORMAT: u32 = COMPRESSION_FORMAT;

/// Format version and shard size of an open store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatDescriptor {
    version: u32,
    shard_size: u64,
}

impl FormatDescriptor {
    pub fn new(version: u32, shard_size: u64) -> Result<Self> {
        if !(MIN_FORMAT..=CURRENT_FORMAT).contains(&version) {
            return Err(unsupported_version(version));
        }
        if shard_size == 0 {
            return Err(FsError::FormatMismatch(
                "shard size must be positive".to_string(),
            ));
        }
        Ok(Self {
            version,
            shard_size,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn shard_size(&self) -> u64 {
        self.shard_size
    }

    pub fn supports_packing(&self) -> bool {
        self.version >= PACKING_FORMAT
    }

    pub fn supports_compressed_reps(&self) -> bool {
        self.version >= COMPRESSION_FORMAT
    }

    pub fn supports_packed_revprops(&self) -> bool {
        self.version >= COMPRESSION_FORMAT
    }

    /// Shard holding `rev`
    pub fn shard_of(&self, rev: u64) -> u64 {
        rev / self.shard_size
    }

    /// First and last revision of `shard`, or `None` when the shard lies past
    /// the largest revision number
    pub fn shard_bounds(&self, shard: u64) -> Option<(u64, u64)> {
        let first = shard.checked_mul(self.shard_size)?;
        let last = first.checked_add(self.shard_size - 1)?;
        Some((first, last))
    }

    /// Number of shards whose every member is at or below `youngest`
    pub fn complete_shards(&self, youngest: u64) -> u64 {
        (youngest + 1) / self.shard_size
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut lines = text.lines();

        let version = lines
            .next()
            .and_then(|l| l.strip_prefix("format "))
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| FsError::FormatMismatch(format!("bad format line in {:?}", text)))?;

        let shard_size = lines
            .next()
            .and_then(|l| l.strip_prefix("layout sharded "))
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| FsError::FormatMismatch(format!("bad layout line in {:?}", text)))?;

        Self::new(version, shard_size)
    }

    pub fn to_text(&self) -> String {
        format!("format {}\nlayout sharded {}\n", self.version, self.shard_size)
    }

    /// Read the descriptor of the store at `root`
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(FORMAT_FILE);
        let text = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::FormatMismatch(format!("no format file at {:?}", path))
            } else {
                FsError::Io(e)
            }
        })?;
        Self::parse(&text)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        fsutil::write_atomic(&root.join(FORMAT_FILE), self.to_text().as_bytes())?;
        Ok(())
    }
}

fn unsupported_version(version: u32) -> FsError {
    FsError::FormatMismatch(format!(
        "unsupported format {} (supported {}..={})",
        version, MIN_FORMAT, CURRENT_FORMAT
    ))
}
