//! Revision property store
//!
//! Loose: `revprops/<shard>/<rev>` holds one serialized [`PropertySet`],
//! replaced wholesale on every change.
//!
//! Packed: `revprops/<shard>.pack/pack` is self-contained. A tag line names
//! the body encoding, the length of the embedded manifest and the SHA-256 of
//! everything after the tag line:
//!
//! ```text
//! ZSTD 24 5d41402abc4b2a76b9719d911017c592...\n
//! <manifest text>
//! <zstd of the concatenated serialized sets>
//! ```
//!
//! Manifest offsets index the uncompressed body. Readers take offsets only
//! from the pack, so replacing the pack is a single rename. The sibling
//! `manifest` file marks the shard packed and is published after the pack.

use crate::checksum::Checksum;
use crate::config::StoreConfig;
use crate::error::{FsError, Result};
use crate::fsutil;
use crate::layout::{ShardLayout, Track};
use crate::lock::LockFile;
use crate::manifest::Manifest;
use crate::properties::PropertySet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Body encoding of a revprop pack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackMode {
    Plain,
    Zstd,
}

impl PackMode {
    fn tag(&self) -> &'static str {
        match self {
            PackMode::Plain => "PLAIN",
            PackMode::Zstd => "ZSTD",
        }
    }
}

/// Decoded revprop pack
#[derive(Debug)]
pub struct RevpropPack {
    mode: PackMode,
    manifest: Manifest,
    body: Vec<u8>,
}

impl RevpropPack {
    /// Assemble a pack from consecutive serialized sets starting at `first_rev`
    pub fn build(first_rev: u64, members: &[Vec<u8>], mode: PackMode) -> Result<Self> {
        let mut manifest = Manifest::new();
        let mut body = Vec::with_capacity(members.iter().map(Vec::len).sum());
        for (i, member) in members.iter().enumerate() {
            manifest.push(first_rev + i as u64, body.len() as u64)?;
            body.extend_from_slice(member);
        }
        Ok(Self {
            mode,
            manifest,
            body,
        })
    }

    /// Decode a pack file
    pub fn decode(pack: &[u8]) -> Result<Self> {
        let newline = pack
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| FsError::Corrupt("revprop pack has no tag line".to_string()))?;
        let tag = std::str::from_utf8(&pack[..newline])
            .map_err(|_| FsError::Corrupt("revprop pack tag is not text".to_string()))?;
        let bad_tag = || FsError::Corrupt(format!("bad revprop pack tag {:?}", tag));

        let mut fields = tag.split(' ');
        let mode = match fields.next() {
            Some("PLAIN") => PackMode::Plain,
            Some("ZSTD") => PackMode::Zstd,
            _ => return Err(FsError::Corrupt(format!("unknown revprop pack tag {:?}", tag))),
        };
        let manifest_len = fields
            .next()
            .and_then(|n| n.parse::<usize>().ok())
            .ok_or_else(bad_tag)?;
        let recorded = fields
            .next()
            .and_then(|sha| Checksum::from_hex(sha).ok())
            .ok_or_else(bad_tag)?;
        if fields.next().is_some() {
            return Err(bad_tag());
        }

        let rest = &pack[newline + 1..];
        let actual = Checksum::of(rest);
        if recorded != actual {
            return Err(FsError::checksum_mismatch("revprop pack", &recorded, &actual));
        }
        if manifest_len > rest.len() {
            return Err(FsError::Corrupt(format!(
                "revprop manifest of {} bytes in a pack of {}",
                manifest_len,
                rest.len()
            )));
        }
        let (manifest_bytes, stored) = rest.split_at(manifest_len);
        let manifest_text = std::str::from_utf8(manifest_bytes)
            .map_err(|_| FsError::Corrupt("revprop manifest is not text".to_string()))?;

        let body = match mode {
            PackMode::Plain => stored.to_vec(),
            PackMode::Zstd => zstd::decode_all(stored)
                .map_err(|e| FsError::undecodable("revprop pack body", &recorded, e))?,
        };

        Ok(Self {
            mode,
            manifest: Manifest::parse(manifest_text)?,
            body,
        })
    }

    pub fn mode(&self) -> PackMode {
        self.mode
    }

    /// Serialized set of `rev`
    pub fn member(&self, rev: u64) -> Result<&[u8]> {
        let (offset, len) = self
            .manifest
            .member_range(rev, self.body.len() as u64)
            .ok_or_else(|| FsError::Corrupt(format!("r{} missing from revprop manifest", rev)))?;
        Ok(&self.body[offset as usize..(offset + len) as usize])
    }

    /// Serialized sets of every member, in order
    pub fn members(&self) -> Result<Vec<Vec<u8>>> {
        self.manifest
            .entries()
            .iter()
            .map(|e| self.member(e.revision).map(<[u8]>::to_vec))
            .collect()
    }

    /// Pack file bytes and manifest text
    pub fn encode(&self, compression_level: i32) -> Result<(Vec<u8>, String)> {
        let manifest_text = self.manifest.to_text();
        let mut rest = manifest_text.clone().into_bytes();
        match self.mode {
            PackMode::Plain => rest.extend_from_slice(&self.body),
            PackMode::Zstd => rest.extend(zstd::encode_all(&self.body[..], compression_level)?),
        }
        let mut pack = format!(
            "{} {} {}\n",
            self.mode.tag(),
            manifest_text.len(),
            Checksum::of(&rest)
        )
        .into_bytes();
        pack.extend(rest);
        Ok((pack, manifest_text))
    }
}

/// Publish `pack`, then the `manifest` marker, inside `pack_dir`.
/// Until the marker lands the shard still reads as loose.
pub(crate) fn publish_pack(pack_dir: &Path, pack: &[u8], manifest: &str) -> Result<()> {
    fs::create_dir_all(pack_dir)?;
    fsutil::write_atomic(&pack_dir.join(crate::layout::PACK_FILE), pack)?;
    fsutil::write_atomic(&pack_dir.join(crate::layout::MANIFEST_FILE), manifest.as_bytes())?;
    Ok(())
}

/// Reads and writes revision properties on either track
pub struct RevpropStore<'a> {
    layout: &'a ShardLayout,
    config: &'a StoreConfig,
}

impl<'a> RevpropStore<'a> {
    pub fn new(layout: &'a ShardLayout, config: &'a StoreConfig) -> Self {
        Self { layout, config }
    }

    /// Every property of `rev`
    pub fn get_all(&self, rev: u64) -> Result<PropertySet> {
        self.layout.resolve(
            || format!("revprops of r{}", rev),
            FsError::is_not_found,
            || self.read_once(rev),
        )
    }

    pub fn get(&self, rev: u64, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.get_all(rev)?.get(name).cloned())
    }

    /// Set or, with `None`, delete one property. The caller holds the write lock.
    pub fn set(&self, rev: u64, name: &str, value: Option<&[u8]>, _write_lock: &LockFile) -> Result<()> {
        let mut props = self.get_all(rev)?;
        match value {
            Some(value) => props.set(name, value.to_vec()),
            None => {
                if props.remove(name).is_none() {
                    return Ok(());
                }
            }
        }

        let shard = self.layout.format().shard_of(rev);
        if self.layout.is_packed(Track::Revprops, shard) {
            self.rewrite_packed(shard, rev, &props)
        } else {
            self.write_loose(rev, &props)
        }
    }

    /// Write the complete set of a loose revision
    pub fn write_loose(&self, rev: u64, props: &PropertySet) -> Result<()> {
        fsutil::write_atomic(&self.layout.loose_path(Track::Revprops, rev), &props.to_bytes()?)?;
        Ok(())
    }

    fn read_once(&self, rev: u64) -> Result<PropertySet> {
        let shard = self.layout.format().shard_of(rev);
        if self.layout.is_packed(Track::Revprops, shard) {
            let pack = self.read_pack(shard)?;
            PropertySet::from_bytes(pack.member(rev)?)
        } else {
            let bytes = fs::read(self.layout.loose_path(Track::Revprops, rev))?;
            PropertySet::from_bytes(&bytes)
        }
    }

    fn read_pack(&self, shard: u64) -> Result<RevpropPack> {
        let pack = fs::read(self.layout.pack_path(Track::Revprops, shard))?;
        RevpropPack::decode(&pack)
    }

    fn rewrite_packed(&self, shard: u64, rev: u64, props: &PropertySet) -> Result<()> {
        let existing = self.read_pack(shard)?;
        let (first, _) = self
            .layout
            .format()
            .shard_bounds(shard)
            .ok_or_else(|| FsError::Corrupt(format!("revprop shard {} out of range", shard)))?;

        let mut members = existing.members()?;
        let index = (rev - first) as usize;
        let slot = members
            .get_mut(index)
            .ok_or_else(|| FsError::Corrupt(format!("r{} missing from revprop pack {}", rev, shard)))?;
        *slot = props.to_bytes()?;

        // Keep the pack's own encoding, whatever the config says now
        let rebuilt = RevpropPack::build(first, &members, existing.mode())?;
        let (pack, _) = rebuilt.encode(self.config.compression_level)?;
        // The marker stays as published; offsets travel inside the pack
        fsutil::write_atomic(&self.layout.pack_path(Track::Revprops, shard), &pack)?;
        debug!("rewrote revprop pack {} for r{}", shard, rev);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::FormatDescriptor;
    use crate::lock::WRITE_LOCK_FILE;
    use tempfile::TempDir;

    struct Fixture {
        _tmp: TempDir,
        layout: ShardLayout,
        config: StoreConfig,
        lock: LockFile,
    }

    fn fixture() -> Fixture {
        let tmp = TempDir::new().unwrap();
        let layout = ShardLayout::new(tmp.path(), FormatDescriptor::new(3, 4).unwrap(), None).unwrap();
        let lock = LockFile::acquire(&tmp.path().join(WRITE_LOCK_FILE)).unwrap();
        Fixture {
            _tmp: tmp,
            layout,
            config: StoreConfig::default(),
            lock,
        }
    }

    fn numbered(rev: u64) -> PropertySet {
        let mut props = PropertySet::new();
        props.set("svn:log", format!("log {}", rev));
        props
    }

    fn pack_shard(fx: &Fixture, shard: u64, mode: PackMode) {
        let (first, last) = fx.layout.format().shard_bounds(shard).unwrap();
        let members: Vec<Vec<u8>> = (first..=last).map(|r| numbered(r).to_bytes().unwrap()).collect();
        let (pack, manifest) = RevpropPack::build(first, &members, mode).unwrap().encode(3).unwrap();
        publish_pack(&fx.layout.pack_dir(Track::Revprops, shard), &pack, &manifest).unwrap();
    }

    #[test]
    fn test_loose_set_get_delete() {
        let fx = fixture();
        let store = RevpropStore::new(&fx.layout, &fx.config);
        store.write_loose(2, &numbered(2)).unwrap();

        store.set(2, "svn:author", Some(b"sally"), &fx.lock).unwrap();
        assert_eq!(store.get(2, "svn:author").unwrap(), Some(b"sally".to_vec()));
        assert_eq!(store.get(2, "svn:log").unwrap(), Some(b"log 2".to_vec()));

        store.set(2, "svn:author", None, &fx.lock).unwrap();
        assert_eq!(store.get(2, "svn:author").unwrap(), None);
        // Deleting an absent property is a no-op
        store.set(2, "missing", None, &fx.lock).unwrap();
    }

    #[test]
    fn test_packed_reads_both_modes() {
        for mode in [PackMode::Plain, PackMode::Zstd] {
            let fx = fixture();
            pack_shard(&fx, 1, mode);
            let store = RevpropStore::new(&fx.layout, &fx.config);
            for rev in 4..8 {
                assert_eq!(store.get_all(rev).unwrap(), numbered(rev));
            }
        }
    }

    #[test]
    fn test_set_on_packed_keeps_mode() {
        let fx = fixture();
        pack_shard(&fx, 0, PackMode::Zstd);
        let store = RevpropStore::new(&fx.layout, &fx.config);

        let big = "lorem ipsum ".repeat(1000);
        store.set(1, "note", Some(big.as_bytes()), &fx.lock).unwrap();

        let pack = fs::read(fx.layout.pack_path(Track::Revprops, 0)).unwrap();
        assert!(pack.starts_with(b"ZSTD "));
        assert!(pack.len() < big.len());
        assert_eq!(store.get(1, "note").unwrap(), Some(big.into_bytes()));
        assert_eq!(store.get_all(2).unwrap(), numbered(2));
        // pack and manifest only, no temporaries
        assert_eq!(fs::read_dir(fx.layout.pack_dir(Track::Revprops, 0)).unwrap().count(), 2);
    }

    #[test]
    fn test_damaged_pack_is_detected() {
        let members = vec![numbered(0).to_bytes().unwrap(), numbered(1).to_bytes().unwrap()];
        let (mut pack, _) = RevpropPack::build(0, &members, PackMode::Plain)
            .unwrap()
            .encode(3)
            .unwrap();
        assert_eq!(RevpropPack::decode(&pack).unwrap().member(1).unwrap(), &members[1][..]);

        let last = pack.len() - 1;
        pack[last] ^= 0x01;
        let err = RevpropPack::decode(&pack).unwrap_err();
        assert!(matches!(err, FsError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_rewrite_ignores_stale_marker() {
        let fx = fixture();
        pack_shard(&fx, 0, PackMode::Plain);
        let marker = fx.layout.manifest_path(Track::Revprops, 0);
        let published = fs::read(&marker).unwrap();
        let store = RevpropStore::new(&fx.layout, &fx.config);

        store.set(1, "svn:log", Some("x".repeat(300).as_bytes()), &fx.lock).unwrap();
        assert_eq!(fs::read(&marker).unwrap(), published);
        assert_eq!(store.get(1, "svn:log").unwrap(), Some("x".repeat(300).into_bytes()));
        assert_eq!(store.get_all(2).unwrap(), numbered(2));
        assert_eq!(store.get_all(3).unwrap(), numbered(3));
    }

    #[test]
    fn test_pack_rejects_unknown_tag() {
        let err = RevpropPack::decode(b"LZ4 4 00\nbody").unwrap_err();
        assert!(matches!(err, FsError::Corrupt(_)));
    }
}
