//! Representation codec
//!
//! Every stored piece of content (file text, directory listing, node property
//! list) is a representation: one header line followed by the stored body.
//!
//! ```text
//! PLAIN <expanded> <stored> <sha256>
//! PLAIN-COMPRESSED <expanded> <stored> <sha256>
//! DELTA <expanded> <stored> <sha256> <base-rev> <base-offset> <base-sha256>
//! DELTA <expanded> <stored> <sha256>            (legacy, read-only)
//! ```
//!
//! The legacy four-field `DELTA` form has no base; its body is self-compressed
//! and is read exactly like `PLAIN-COMPRESSED`. New representations never use it.

use crate::checksum::Checksum;
use crate::config::StoreConfig;
use crate::delta::{self, DeltaEncoder};
use crate::error::{FsError, Result};
use crate::format::FormatDescriptor;
use crate::layout::ShardLayout;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{BufRead, BufReader, Read};
use tracing::debug;

/// Longest header line a reader accepts
const MAX_HEADER_LEN: u64 = 512;

/// Hops a reader follows before declaring a chain corrupt. Independent of
/// `max_delta_chain`, which only limits what writers create.
const READ_CHAIN_LIMIT: usize = 1024;

/// Address of a representation: its revision and byte offset within that
/// revision's data. Valid whether the revision is loose or packed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RepHandle {
    pub revision: u64,
    pub offset: u64,
}

impl RepHandle {
    pub fn new(revision: u64, offset: u64) -> Self {
        Self { revision, offset }
    }
}

impl fmt::Display for RepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}@{}", self.revision, self.offset)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepKind {
    Plain,
    Compressed,
    Delta {
        base: RepHandle,
        base_checksum: Checksum,
    },
    /// Historical base-less delta, decoded as compressed data
    LegacySelfDelta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepHeader {
    pub kind: RepKind,
    pub expanded_size: u64,
    pub stored_size: u64,
    pub checksum: Checksum,
}

impl RepHeader {
    /// Parse a header line, with or without its trailing newline
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.strip_suffix('\n').unwrap_or(line);
        let fields: Vec<&str> = line.split(' ').collect();
        let bad = || FsError::Corrupt(format!("malformed representation header {:?}", line));

        let (expanded_size, stored_size, checksum) = match fields.get(1..4) {
            Some([expanded, stored, sha]) => (
                expanded.parse::<u64>().map_err(|_| bad())?,
                stored.parse::<u64>().map_err(|_| bad())?,
                Checksum::from_hex(sha).map_err(|_| bad())?,
            ),
            _ => return Err(bad()),
        };

        let kind = match (fields[0], &fields[4..]) {
            ("PLAIN", []) => RepKind::Plain,
            ("PLAIN-COMPRESSED", []) => RepKind::Compressed,
            ("DELTA", []) => RepKind::LegacySelfDelta,
            ("DELTA", [rev, offset, sha]) => RepKind::Delta {
                base: RepHandle::new(
                    rev.parse().map_err(|_| bad())?,
                    offset.parse().map_err(|_| bad())?,
                ),
                base_checksum: Checksum::from_hex(sha).map_err(|_| bad())?,
            },
            _ => return Err(bad()),
        };

        Ok(Self {
            kind,
            expanded_size,
            stored_size,
            checksum,
        })
    }

    /// Header line including the terminating newline
    pub fn to_line(&self) -> String {
        let common = format!("{} {} {}", self.expanded_size, self.stored_size, self.checksum);
        match &self.kind {
            RepKind::Plain => format!("PLAIN {}\n", common),
            RepKind::Compressed => format!("PLAIN-COMPRESSED {}\n", common),
            RepKind::LegacySelfDelta => format!("DELTA {}\n", common),
            RepKind::Delta {
                base,
                base_checksum,
            } => format!(
                "DELTA {} {} {} {}\n",
                common, base.revision, base.offset, base_checksum
            ),
        }
    }
}

/// What a representation holds; decides which deltification switch applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    File,
    Directory,
    Properties,
}

/// Encoding choices available to a writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodingPolicy {
    deltify: bool,
    delta_min_size: usize,
    max_delta_chain: u32,
    compress: bool,
    compression_level: i32,
}

impl EncodingPolicy {
    pub fn new(config: &StoreConfig, format: &FormatDescriptor, class: ContentClass) -> Self {
        let deltify = match class {
            ContentClass::File => true,
            ContentClass::Directory => config.enable_dir_deltification,
            ContentClass::Properties => config.enable_props_deltification,
        };
        Self {
            deltify: deltify && config.max_delta_chain > 0,
            delta_min_size: config.delta_min_size,
            max_delta_chain: config.max_delta_chain,
            compress: config.compress_representations && format.supports_compressed_reps(),
            compression_level: config.compression_level,
        }
    }

    /// Always `PLAIN`
    pub fn plain() -> Self {
        Self {
            deltify: false,
            delta_min_size: 0,
            max_delta_chain: 0,
            compress: false,
            compression_level: 0,
        }
    }
}

/// Prior representation of the same content, candidate for sharing or deltas
#[derive(Debug, Clone, Copy)]
pub struct DeltaBase<'a> {
    pub handle: RepHandle,
    pub checksum: Checksum,
    pub data: &'a [u8],
    /// Delta hops below `handle`
    pub chain_length: u32,
}

/// A representation ready to be appended to a revision file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedRep {
    pub header: RepHeader,
    pub body: Vec<u8>,
}

impl EncodedRep {
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.header.to_line().as_bytes());
        out.extend_from_slice(&self.body);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.write_to(&mut out);
        out
    }
}

/// Result of storing content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoredRep {
    /// Identical to the base; reuse its handle
    Shared(RepHandle),
    New(EncodedRep),
}

/// Store `data`, reusing `base` outright when it holds the same bytes
pub fn store(data: &[u8], policy: &EncodingPolicy, base: Option<&DeltaBase<'_>>) -> Result<StoredRep> {
    let checksum = Checksum::of(data);
    if let Some(base) = base {
        if base.checksum == checksum && base.data.len() == data.len() {
            debug!("content identical to {}, sharing", base.handle);
            return Ok(StoredRep::Shared(base.handle));
        }
    }
    encode_with_checksum(data, checksum, policy, base).map(StoredRep::New)
}

/// Encode `data` as a new representation
pub fn encode(data: &[u8], policy: &EncodingPolicy, base: Option<&DeltaBase<'_>>) -> Result<EncodedRep> {
    encode_with_checksum(data, Checksum::of(data), policy, base)
}

fn encode_with_checksum(
    data: &[u8],
    checksum: Checksum,
    policy: &EncodingPolicy,
    base: Option<&DeltaBase<'_>>,
) -> Result<EncodedRep> {
    let expanded_size = data.len() as u64;

    if let Some(base) = base.filter(|b| {
        policy.deltify && data.len() >= policy.delta_min_size && b.chain_length < policy.max_delta_chain
    }) {
        let body = DeltaEncoder::new().encode(base.data, data).encode();
        if body.len() < data.len() {
            debug!(
                "storing {} bytes as delta against {} ({} bytes)",
                expanded_size,
                base.handle,
                body.len()
            );
            return Ok(EncodedRep {
                header: RepHeader {
                    kind: RepKind::Delta {
                        base: base.handle,
                        base_checksum: base.checksum,
                    },
                    expanded_size,
                    stored_size: body.len() as u64,
                    checksum,
                },
                body,
            });
        }
    }

    if policy.compress {
        let compressed = zstd::encode_all(data, policy.compression_level)?;
        if compressed.len() < data.len() {
            debug!("storing {} bytes compressed to {}", expanded_size, compressed.len());
            return Ok(EncodedRep {
                header: RepHeader {
                    kind: RepKind::Compressed,
                    expanded_size,
                    stored_size: compressed.len() as u64,
                    checksum,
                },
                body: compressed,
            });
        }
    }

    Ok(EncodedRep {
        header: RepHeader {
            kind: RepKind::Plain,
            expanded_size,
            stored_size: expanded_size,
            checksum,
        },
        body: data.to_vec(),
    })
}

/// Expand a stored body. `base` must be the expanded base for `DELTA`.
/// The result is verified against the header's size and checksum.
pub fn decode(header: &RepHeader, body: &[u8], base: Option<&[u8]>, context: &str) -> Result<Vec<u8>> {
    let data = match &header.kind {
        RepKind::Plain => body.to_vec(),
        RepKind::Compressed | RepKind::LegacySelfDelta => zstd::decode_all(body)
            .map_err(|e| FsError::undecodable(context, &header.checksum, e))?,
        RepKind::Delta { base: handle, .. } => {
            let base = base.ok_or_else(|| {
                FsError::Corrupt(format!("{}: delta base {} not supplied", context, handle))
            })?;
            delta::apply(base, body).map_err(|e| FsError::undecodable(context, &header.checksum, e))?
        }
    };

    if data.len() as u64 != header.expanded_size {
        return Err(FsError::undecodable(
            context,
            &header.checksum,
            format!("expanded to {} bytes, header says {}", data.len(), header.expanded_size),
        ));
    }
    let actual = Checksum::of(&data);
    if actual != header.checksum {
        return Err(FsError::checksum_mismatch(context, &header.checksum, &actual));
    }
    Ok(data)
}

/// Reads representations out of stored revisions
pub struct RepReader<'a> {
    layout: &'a ShardLayout,
}

impl<'a> RepReader<'a> {
    pub fn new(layout: &'a ShardLayout) -> Self {
        Self { layout }
    }

    pub fn read_header(&self, handle: RepHandle) -> Result<RepHeader> {
        self.layout.read_revision(handle.revision, |location| {
            let (file, remaining) = location.open_at(handle.offset)?;
            let mut reader = BufReader::new(file.take(remaining));
            read_header_line(&mut reader, handle)
        })
    }

    /// Header and stored body, without expanding
    pub fn read_raw(&self, handle: RepHandle) -> Result<(RepHeader, Vec<u8>)> {
        self.layout.read_revision(handle.revision, |location| {
            let (file, remaining) = location.open_at(handle.offset)?;
            let mut reader = BufReader::new(file.take(remaining));
            let header = read_header_line(&mut reader, handle)?;

            let mut body = Vec::new();
            reader.by_ref().take(header.stored_size).read_to_end(&mut body)?;
            if body.len() as u64 != header.stored_size {
                return Err(FsError::Corrupt(format!(
                    "representation {} truncated: {} of {} bytes",
                    handle,
                    body.len(),
                    header.stored_size
                )));
            }
            Ok((header, body))
        })
    }

    /// Expanded, checksum-verified content of `handle`
    pub fn load(&self, handle: RepHandle) -> Result<Vec<u8>> {
        let mut chain = Vec::new();
        let mut next = handle;
        loop {
            let (header, body) = self.read_raw(next)?;
            let base = match header.kind {
                RepKind::Delta { base, .. } => Some(base),
                _ => None,
            };
            chain.push((next, header, body));
            match base {
                Some(base) => {
                    if base >= next {
                        return Err(FsError::Corrupt(format!(
                            "representation {} deltas against later {}",
                            next, base
                        )));
                    }
                    if chain.len() > READ_CHAIN_LIMIT {
                        return Err(FsError::Corrupt(format!(
                            "delta chain from {} exceeds {} hops",
                            handle, READ_CHAIN_LIMIT
                        )));
                    }
                    next = base;
                }
                None => break,
            }
        }

        let mut expanded: Option<(Vec<u8>, Checksum)> = None;
        for (at, header, body) in chain.into_iter().rev() {
            let context = format!("representation {}", at);
            if let (RepKind::Delta { base_checksum, .. }, Some((_, base_sum))) = (&header.kind, &expanded) {
                if base_checksum != base_sum {
                    return Err(FsError::checksum_mismatch(
                        format!("base of {}", context),
                        base_checksum,
                        base_sum,
                    ));
                }
            }
            let base = expanded.as_ref().map(|(data, _)| data.as_slice());
            let data = decode(&header, &body, base, &context)?;
            expanded = Some((data, header.checksum));
        }

        expanded
            .map(|(data, _)| data)
            .ok_or_else(|| FsError::Corrupt(format!("empty delta chain for {}", handle)))
    }

    /// Number of delta hops from `handle` to its self-contained base
    pub fn chain_length(&self, handle: RepHandle) -> Result<u32> {
        let mut hops = 0u32;
        let mut next = handle;
        while let RepKind::Delta { base, .. } = self.read_header(next)?.kind {
            if base >= next || hops as usize >= READ_CHAIN_LIMIT {
                return Err(FsError::Corrupt(format!("unterminated delta chain from {}", handle)));
            }
            hops += 1;
            next = base;
        }
        Ok(hops)
    }
}

fn read_header_line(reader: &mut impl BufRead, handle: RepHandle) -> Result<RepHeader> {
    let mut line = Vec::new();
    reader.take(MAX_HEADER_LEN).read_until(b'\n', &mut line)?;
    if line.last() != Some(&b'\n') {
        return Err(FsError::Corrupt(format!(
            "representation {} has no header line",
            handle
        )));
    }
    let text = std::str::from_utf8(&line)
        .map_err(|_| FsError::Corrupt(format!("representation {} header is not text", handle)))?;
    RepHeader::parse(text)
}
