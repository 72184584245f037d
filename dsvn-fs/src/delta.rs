//! Binary delta codec
//!
//! A delta rebuilds a target buffer from a source buffer with two
//! instructions: copy a range of the source, or insert literal bytes.
//!
//! Wire format (all integers LEB128 varints):
//!
//! ```text
//! source_len target_len { 0x00 offset len | 0x01 len bytes... }*
//! ```

use std::collections::HashMap;
use thiserror::Error;

const OP_COPY: u8 = 0;
const OP_INSERT: u8 = 1;

/// Default length of the blocks indexed from the source
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Cap on the output buffer reserved up front from an untrusted header
const MAX_PREALLOC: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeltaError {
    #[error("delta truncated")]
    Truncated,

    #[error("varint overflows 64 bits")]
    VarintOverflow,

    #[error("unknown delta instruction 0x{0:02x}")]
    UnknownOp(u8),

    #[error("copy of {len} bytes at {offset} exceeds source of {source_len} bytes")]
    CopyOutOfRange {
        offset: u64,
        len: u64,
        source_len: u64,
    },

    #[error("delta expects a {expected}-byte source, got {actual}")]
    SourceLength { expected: u64, actual: u64 },

    #[error("delta produced {actual} bytes, expected {expected}")]
    TargetLength { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeltaInstruction {
    Copy { offset: u64, len: u64 },
    Insert(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    source_len: u64,
    target_len: u64,
    instructions: Vec<DeltaInstruction>,
}

impl Delta {
    pub fn source_len(&self) -> u64 {
        self.source_len
    }

    pub fn target_len(&self) -> u64 {
        self.target_len
    }

    pub fn instructions(&self) -> &[DeltaInstruction] {
        &self.instructions
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_varint(&mut out, self.source_len);
        write_varint(&mut out, self.target_len);
        for instruction in &self.instructions {
            match instruction {
                DeltaInstruction::Copy { offset, len } => {
                    out.push(OP_COPY);
                    write_varint(&mut out, *offset);
                    write_varint(&mut out, *len);
                }
                DeltaInstruction::Insert(data) => {
                    out.push(OP_INSERT);
                    write_varint(&mut out, data.len() as u64);
                    out.extend_from_slice(data);
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DeltaError> {
        let mut pos = 0;
        let source_len = read_varint(bytes, &mut pos)?;
        let target_len = read_varint(bytes, &mut pos)?;
        let mut instructions = Vec::new();

        while pos < bytes.len() {
            let op = bytes[pos];
            pos += 1;
            match op {
                OP_COPY => {
                    let offset = read_varint(bytes, &mut pos)?;
                    let len = read_varint(bytes, &mut pos)?;
                    instructions.push(DeltaInstruction::Copy { offset, len });
                }
                OP_INSERT => {
                    let len = read_varint(bytes, &mut pos)?;
                    let end = usize::try_from(len)
                        .ok()
                        .and_then(|len| pos.checked_add(len))
                        .filter(|end| *end <= bytes.len())
                        .ok_or(DeltaError::Truncated)?;
                    instructions.push(DeltaInstruction::Insert(bytes[pos..end].to_vec()));
                    pos = end;
                }
                other => return Err(DeltaError::UnknownOp(other)),
            }
        }

        Ok(Self {
            source_len,
            target_len,
            instructions,
        })
    }

    /// Rebuild the target from `source`
    pub fn apply(&self, source: &[u8]) -> Result<Vec<u8>, DeltaError> {
        if source.len() as u64 != self.source_len {
            return Err(DeltaError::SourceLength {
                expected: self.source_len,
                actual: source.len() as u64,
            });
        }

        let mut out = Vec::with_capacity(self.target_len.min(MAX_PREALLOC) as usize);
        for instruction in &self.instructions {
            match instruction {
                DeltaInstruction::Copy { offset, len } => {
                    let range = offset
                        .checked_add(*len)
                        .filter(|end| *end <= self.source_len)
                        .map(|end| *offset as usize..end as usize)
                        .ok_or(DeltaError::CopyOutOfRange {
                            offset: *offset,
                            len: *len,
                            source_len: self.source_len,
                        })?;
                    out.extend_from_slice(&source[range]);
                }
                DeltaInstruction::Insert(data) => out.extend_from_slice(data),
            }
            if out.len() as u64 > self.target_len {
                break;
            }
        }

        if out.len() as u64 != self.target_len {
            return Err(DeltaError::TargetLength {
                expected: self.target_len,
                actual: out.len() as u64,
            });
        }
        Ok(out)
    }
}

/// Decode `delta` and apply it to `source`
pub fn apply(source: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    Delta::decode(delta)?.apply(source)
}

/// Builds deltas by indexing fixed-size source blocks and extending matches
/// found in the target in both directions.
#[derive(Debug, Clone)]
pub struct DeltaEncoder {
    block_size: usize,
}

impl Default for DeltaEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeltaEncoder {
    pub fn new() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }

    pub fn encode(&self, source: &[u8], target: &[u8]) -> Delta {
        let block = self.block_size;
        let mut instructions = Vec::new();

        let mut index: HashMap<&[u8], usize> = HashMap::new();
        if source.len() >= block {
            for start in (0..=source.len() - block).step_by(block) {
                index.entry(&source[start..start + block]).or_insert(start);
            }
        }

        // Start of target bytes not yet covered by an instruction
        let mut pending = 0;
        let mut pos = 0;
        while !index.is_empty() && pos + block <= target.len() {
            let Some(&found) = index.get(&target[pos..pos + block]) else {
                pos += 1;
                continue;
            };

            let mut src_start = found;
            let mut tgt_start = pos;
            while tgt_start > pending && src_start > 0 && source[src_start - 1] == target[tgt_start - 1] {
                src_start -= 1;
                tgt_start -= 1;
            }

            let mut src_end = found + block;
            let mut tgt_end = pos + block;
            while src_end < source.len() && tgt_end < target.len() && source[src_end] == target[tgt_end] {
                src_end += 1;
                tgt_end += 1;
            }

            if tgt_start > pending {
                instructions.push(DeltaInstruction::Insert(target[pending..tgt_start].to_vec()));
            }
            instructions.push(DeltaInstruction::Copy {
                offset: src_start as u64,
                len: (src_end - src_start) as u64,
            });
            pending = tgt_end;
            pos = tgt_end;
        }

        if pending < target.len() {
            instructions.push(DeltaInstruction::Insert(target[pending..].to_vec()));
        }

        Delta {
            source_len: source.len() as u64,
            target_len: target.len() as u64,
            instructions,
        }
    }
}

fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn read_varint(bytes: &[u8], pos: &mut usize) -> Result<u64, DeltaError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*pos).ok_or(DeltaError::Truncated)?;
        *pos += 1;
        if shift >= 64 || (shift == 63 && byte & 0x7f > 1) {
            return Err(DeltaError::VarintOverflow);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}
