//! Pack manifests
//!
//! A manifest lists, for each member revision of a packed shard, the byte
//! offset at which that revision starts inside the pack:
//!
//! ```text
//! 10 0
//! 11 1873
//! 12 2410
//! ```
//!
//! A member's length is the next member's offset minus its own; the last
//! member runs to the end of the packed data.

use crate::error::{FsError, Result};

/// Manifest entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    pub revision: u64,
    pub offset: u64,
}

/// Ordered offset index of a pack
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the next member. Revisions must be consecutive and offsets non-decreasing.
    pub fn push(&mut self, revision: u64, offset: u64) -> Result<()> {
        if let Some(last) = self.entries.last() {
            if revision != last.revision + 1 {
                return Err(FsError::Corrupt(format!(
                    "manifest revision r{} does not follow r{}",
                    revision, last.revision
                )));
            }
            if offset < last.offset {
                return Err(FsError::Corrupt(format!(
                    "manifest offset {} for r{} precedes {}",
                    offset, revision, last.offset
                )));
            }
        }
        self.entries.push(ManifestEntry { revision, offset });
        Ok(())
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn first_revision(&self) -> Option<u64> {
        self.entries.first().map(|e| e.revision)
    }

    /// Offset and length of `revision` given the total length of the packed data
    pub fn member_range(&self, revision: u64, total_len: u64) -> Option<(u64, u64)> {
        let first = self.first_revision()?;
        let index = usize::try_from(revision.checked_sub(first)?).ok()?;
        let entry = self.entries.get(index)?;
        let end = self
            .entries
            .get(index + 1)
            .map(|next| next.offset)
            .unwrap_or(total_len);
        if end < entry.offset {
            return None;
        }
        Some((entry.offset, end - entry.offset))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut manifest = Manifest::new();
        for (lineno, line) in text.lines().enumerate() {
            let mut fields = line.split(' ');
            let parsed = match (fields.next(), fields.next(), fields.next()) {
                (Some(rev), Some(offset), None) => rev.parse::<u64>().ok().zip(offset.parse::<u64>().ok()),
                _ => None,
            };
            let (revision, offset) = parsed.ok_or_else(|| {
                FsError::Corrupt(format!("malformed manifest line {}: {:?}", lineno + 1, line))
            })?;
            manifest.push(revision, offset)?;
        }
        Ok(manifest)
    }

    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.entries.len() * 12);
        for entry in &self.entries {
            out.push_str(&format!("{} {}\n", entry.revision, entry.offset));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let mut m = Manifest::new();
        m.push(10, 0).unwrap();
        m.push(11, 100).unwrap();
        m.push(12, 250).unwrap();
        m
    }

    #[test]
    fn test_manifest_member_ranges() {
        let m = sample();
        assert_eq!(m.member_range(10, 400), Some((0, 100)));
        assert_eq!(m.member_range(11, 400), Some((100, 150)));
        assert_eq!(m.member_range(12, 400), Some((250, 150)));
        assert_eq!(m.member_range(9, 400), None);
        assert_eq!(m.member_range(13, 400), None);
    }

    #[test]
    fn test_manifest_text_roundtrip() {
        let m = sample();
        let text = m.to_text();
        assert_eq!(text, "10 0\n11 100\n12 250\n");
        assert_eq!(Manifest::parse(&text).unwrap(), m);
    }

    #[test]
    fn test_manifest_rejects_gaps_and_garbage() {
        assert!(Manifest::parse("0 0\n2 10\n").is_err());
        assert!(Manifest::parse("0 10\n1 5\n").is_err());
        assert!(Manifest::parse("0 x\n").is_err());
        assert!(Manifest::parse("0 1 2\n").is_err());
    }

    #[test]
    fn test_manifest_empty_members_allowed() {
        let m = Manifest::parse("0 0\n1 0\n2 7\n").unwrap();
        assert_eq!(m.member_range(0, 9), Some((0, 0)));
        assert_eq!(m.member_range(2, 9), Some((7, 2)));
    }
}
