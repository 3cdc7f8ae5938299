//! Binary signature, delta and patch
//!
//! This is the rsync algorithm in its in-memory form:
//!
//! 1. [`signature`] splits a basis into fixed-size blocks and records a weak
//!    rolling checksum plus a truncated SHA-256 strong hash for each.
//! 2. [`delta`] slides a window over new content, looks the window's weak sum
//!    up in the signature, confirms with the strong hash, and emits either a
//!    copy of a basis range or literal bytes.
//! 3. [`patch`] replays the operations against the basis.
//!
//! The law every caller relies on:
//!
//! ```rust
//! use retrace::delta::{delta, patch, signature};
//!
//! # fn main() -> retrace::Result<()> {
//! let old = b"the quick brown fox jumps over the lazy dog".repeat(40);
//! let mut new = old.clone();
//! new.splice(100..104, b"CAT!".iter().copied());
//!
//! let sig = signature(&old, 64);
//! let d = delta(&sig, &new);
//! assert_eq!(patch(&old, &d)?, new);
//! # Ok(())
//! # }
//! ```
//!
//! Deltas are serialized with bincode for storage as increments.

use crate::error::{Result, RetraceError};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Block size for basis files up to `DEFAULT_BLOCK_SIZE²` bytes
pub const DEFAULT_BLOCK_SIZE: usize = 700;

/// Upper bound for derived block sizes
pub const MAX_BLOCK_SIZE: usize = 1 << 17;

/// Bytes of SHA-256 kept per block
const STRONG_LEN: usize = 16;

/// Pick a block size for a basis of `len` bytes
///
/// Small files get [`DEFAULT_BLOCK_SIZE`]; larger ones get roughly the square
/// root of their size, rounded down to a multiple of 8 and clamped to
/// [`MAX_BLOCK_SIZE`].
pub fn block_size_for(len: u64) -> usize {
    let default = DEFAULT_BLOCK_SIZE as u64;
    if len <= default * default {
        return DEFAULT_BLOCK_SIZE;
    }
    let root = (len as f64).sqrt() as u64;
    let rounded = (root & !7).max(default);
    (rounded as usize).min(MAX_BLOCK_SIZE)
}

/// Adler-style weak checksum that can slide one byte at a time
///
/// `s1` accumulates the byte sum and `s2` the prefix sums; the digest keeps
/// the low 16 bits of each.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollingChecksum {
    s1: u32,
    s2: u32,
    len: usize,
}

impl RollingChecksum {
    /// Creates a new rolling checksum with zeroed state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum of a whole window
    pub fn of(window: &[u8]) -> Self {
        let mut sum = Self::new();
        sum.update(window);
        sum
    }

    /// Append bytes to the window
    pub fn update(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            self.s1 = self.s1.wrapping_add(u32::from(byte));
            self.s2 = self.s2.wrapping_add(self.s1);
        }
        self.len += bytes.len();
    }

    /// Slide the window: drop `outgoing` from the front, append `incoming`
    pub fn roll(&mut self, outgoing: u8, incoming: u8) {
        let out = u32::from(outgoing);
        self.s1 = self.s1.wrapping_sub(out).wrapping_add(u32::from(incoming));
        self.s2 = self
            .s2
            .wrapping_sub((self.len as u32).wrapping_mul(out))
            .wrapping_add(self.s1);
    }

    /// Shrink the window by dropping `outgoing` from the front
    pub fn roll_out(&mut self, outgoing: u8) {
        let out = u32::from(outgoing);
        self.s1 = self.s1.wrapping_sub(out);
        self.s2 = self.s2.wrapping_sub((self.len as u32).wrapping_mul(out));
        self.len = self.len.saturating_sub(1);
    }

    /// Number of bytes in the window
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the window is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 32-bit digest: low 16 bits of `s1`, low 16 bits of `s2` shifted up
    pub fn digest(&self) -> u32 {
        (self.s1 & 0xffff) | ((self.s2 & 0xffff) << 16)
    }
}

fn strong_hash(block: &[u8]) -> [u8; STRONG_LEN] {
    let digest = Sha256::digest(block);
    let mut out = [0u8; STRONG_LEN];
    out.copy_from_slice(&digest[..STRONG_LEN]);
    out
}

/// Checksums of one basis block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignature {
    /// Rolling checksum digest
    pub weak: u32,
    /// Truncated SHA-256
    pub strong: [u8; STRONG_LEN],
}

/// Block checksums of a basis
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// Block length (the last block may be shorter)
    pub block_size: usize,
    /// Length of the basis
    pub basis_len: u64,
    /// One entry per block, in order
    pub blocks: Vec<BlockSignature>,
}

impl Signature {
    fn block_len(&self, block: usize) -> usize {
        let start = block * self.block_size;
        (self.basis_len as usize - start).min(self.block_size)
    }
}

/// Compute the signature of `content` with blocks of `block_size` bytes
///
/// A `block_size` of zero is treated as one.
pub fn signature(content: &[u8], block_size: usize) -> Signature {
    let block_size = block_size.max(1);
    let blocks = content
        .chunks(block_size)
        .map(|block| BlockSignature {
            weak: RollingChecksum::of(block).digest(),
            strong: strong_hash(block),
        })
        .collect();
    Signature {
        block_size,
        basis_len: content.len() as u64,
        blocks,
    }
}

/// One delta instruction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaOp {
    /// Copy `len` bytes of the basis starting at `offset`
    Copy {
        /// Start in the basis
        offset: u64,
        /// Number of bytes
        len: u64,
    },
    /// Emit these bytes
    Literal(Vec<u8>),
}

/// Instructions that turn a basis into a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Length the basis must have
    pub basis_len: u64,
    /// Length of the reconstructed target
    pub target_len: u64,
    /// Operations in output order
    pub ops: Vec<DeltaOp>,
}

impl Delta {
    /// Serialize for storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serde::encode_to_vec(self, bincode::config::standard())?)
    }

    /// Deserialize a stored delta
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (delta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
        Ok(delta)
    }

    /// Bytes of literal data carried by this delta
    pub fn literal_bytes(&self) -> u64 {
        self.ops
            .iter()
            .map(|op| match op {
                DeltaOp::Literal(bytes) => bytes.len() as u64,
                DeltaOp::Copy { .. } => 0,
            })
            .sum()
    }

    fn push_copy(&mut self, offset: u64, len: u64) {
        if let Some(DeltaOp::Copy {
            offset: prev_offset,
            len: prev_len,
        }) = self.ops.last_mut()
        {
            if *prev_offset + *prev_len == offset {
                *prev_len += len;
                return;
            }
        }
        self.ops.push(DeltaOp::Copy { offset, len });
    }

    fn push_literal(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if let Some(DeltaOp::Literal(prev)) = self.ops.last_mut() {
            prev.extend_from_slice(bytes);
            return;
        }
        self.ops.push(DeltaOp::Literal(bytes.to_vec()));
    }
}

/// Compute the delta that turns the basis described by `sig` into `new`
pub fn delta(sig: &Signature, new: &[u8]) -> Delta {
    let mut out = Delta {
        basis_len: sig.basis_len,
        target_len: new.len() as u64,
        ops: Vec::new(),
    };
    if sig.blocks.is_empty() || new.is_empty() {
        out.push_literal(new);
        return out;
    }

    let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::new();
    for (block, entry) in sig.blocks.iter().enumerate() {
        by_weak.entry(entry.weak).or_default().push(block);
    }

    let block_size = sig.block_size;
    let mut pos = 0usize;
    let mut literal_start = 0usize;
    let mut window: Option<RollingChecksum> = None;

    while pos < new.len() {
        let end = (pos + block_size).min(new.len());
        let sum = *window.get_or_insert_with(|| RollingChecksum::of(&new[pos..end]));

        let mut matched = None;
        if let Some(candidates) = by_weak.get(&sum.digest()) {
            let strong = strong_hash(&new[pos..end]);
            matched = candidates.iter().copied().find(|&block| {
                sig.block_len(block) == end - pos && sig.blocks[block].strong == strong
            });
        }

        match matched {
            Some(block) => {
                out.push_literal(&new[literal_start..pos]);
                out.push_copy((block * block_size) as u64, (end - pos) as u64);
                pos = end;
                literal_start = pos;
                window = None;
            }
            None => {
                if let Some(sum) = window.as_mut() {
                    if end < new.len() {
                        sum.roll(new[pos], new[end]);
                    } else {
                        sum.roll_out(new[pos]);
                    }
                }
                pos += 1;
            }
        }
    }
    out.push_literal(&new[literal_start..]);
    out
}

/// Apply `delta` to `old`
///
/// # Errors
///
/// - [`RetraceError::InvalidDelta`] if `old` is not the basis the delta was
///   computed against, or the operations are out of range
pub fn patch(old: &[u8], delta: &Delta) -> Result<Vec<u8>> {
    if old.len() as u64 != delta.basis_len {
        return Err(RetraceError::InvalidDelta(format!(
            "basis is {} bytes, delta expects {}",
            old.len(),
            delta.basis_len
        )));
    }
    // target_len comes from storage; only trust it as far as the ops can reach
    let reachable = (old.len() as u64).saturating_add(delta.literal_bytes());
    let mut out = Vec::with_capacity(delta.target_len.min(reachable) as usize);
    for op in &delta.ops {
        match op {
            DeltaOp::Copy { offset, len } => {
                let start = *offset as usize;
                let end = offset
                    .checked_add(*len)
                    .map(|e| e as usize)
                    .filter(|&e| e <= old.len())
                    .ok_or_else(|| {
                        RetraceError::InvalidDelta(format!(
                            "copy {}+{} outside basis of {} bytes",
                            offset,
                            len,
                            old.len()
                        ))
                    })?;
                out.extend_from_slice(&old[start..end]);
            }
            DeltaOp::Literal(bytes) => out.extend_from_slice(bytes),
        }
        if out.len() as u64 > delta.target_len {
            return Err(RetraceError::InvalidDelta(format!(
                "ops run past the promised {} bytes",
                delta.target_len
            )));
        }
    }
    if out.len() as u64 != delta.target_len {
        return Err(RetraceError::InvalidDelta(format!(
            "patched {} bytes, delta promises {}",
            out.len(),
            delta.target_len
        )));
    }
    Ok(out)
}
