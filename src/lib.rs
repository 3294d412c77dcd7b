//! # gdiff
//!
//! Streaming binary deltas in the GDIFF format.
//!
//! `gdiff` computes a delta between a source and a target, encodes it as a
//! GDIFF stream of copy and literal records, applies such a stream to the
//! source to rebuild the target, and merges two chained deltas A→B and B→C
//! into A→C without materializing B.
//!
//! ## Quick Start
//!
//! ```
//! use gdiff::{encode, decode};
//!
//! let source = b"Hello, World! Hello, World! Hello, World!";
//! let target = b"Hello, World! Hello, Rust! Hello, World!";
//!
//! let delta = encode(source, target).unwrap();
//! let recovered = decode(&delta, source).unwrap();
//! assert_eq!(recovered, target);
//! ```
//!
//! ## Algorithm Details
//!
//! 1. The source is cut into blocks of `chunk_size` bytes (16 by default) and
//!    every complete block is indexed under a rolling weak checksum.
//! 2. The target is read once, front to back. The checksum of the next
//!    `chunk_size` bytes is rolled forward one byte at a time and looked up.
//! 3. Hits are verified and extended byte by byte; a match of at least one
//!    block becomes a copy, everything else literal bytes.
//! 4. Instructions go to an [`InstructionSink`]: the [`GDiffWriter`] for
//!    persistence, a [`DebugWriter`] for inspection, or your own.
//!
//! ## Streaming
//!
//! Sources are anything implementing [`SeekableSource`] and are always read
//! at absolute offsets; targets and patches are plain [`std::io::Read`]ers.
//! [`Delta`], [`apply`], [`convert`] and [`merge`] work on those directly, so
//! inputs never have to fit in memory.
//!
//! The in-memory helpers in this module wrap them for byte slices.
//!
//! ## Logging
//!
//! The library emits [`tracing`] events and never installs a subscriber.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod buffer;
mod checksum;
mod delta;
mod error;
mod merger;
pub mod opcode;
mod patcher;
mod rolling;
mod sink;
mod source;
mod writer;

pub use checksum::{ChecksumIndex, ChecksumTable, DUPLICATE_CHAIN_LIMIT, WindowHash};
pub use delta::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_PROBES, Delta, DeltaOptions, DeltaStats, LONGEST_POSSIBLE_MATCH,
    PROGRESS_STEP, Progress,
};
pub use error::{DeltaError, Result};
pub use merger::{
    DEFAULT_INDEX_INTERVAL, DEFAULT_MAX_ATTEMPTS, IndexEntry, IndexOptions, PatchIndex, merge,
};
pub use opcode::Mode;
pub use patcher::{Command, GDiffReader, apply, convert};
pub use rolling::{PRIMARY_SEED, SECONDARY_SEED, WeakChecksum};
pub use sink::{DebugWriter, Instruction, InstructionCollector, InstructionSink};
pub use source::{ReadSeekSource, SeekableSource, SliceSource, SourceCursor};
pub use writer::{GDiffWriter, LITERAL_CHUNK, WriterOptions, WriterStats, ZeroRunOptions};

/// Computes the delta from `source` to `target` with default settings.
///
/// # Errors
///
/// In-memory encoding only fails on invalid options, which the defaults are
/// not. The `Result` keeps the signature in line with [`encode_with`].
///
/// # Examples
///
/// ```
/// use gdiff::encode;
///
/// let source = b"The quick brown fox jumps over the lazy dog";
/// let target = b"The quick brown cat jumps over the lazy dog";
///
/// let delta = encode(source, target).unwrap();
/// assert_eq!(&delta[..4], &[0xd1, 0xff, 0xd1, 0xff]);
/// ```
pub fn encode(source: &[u8], target: &[u8]) -> Result<Vec<u8>> {
    encode_with(source, target, &DeltaOptions::default(), WriterOptions::default())
}

/// Computes the delta from `source` to `target` with explicit settings.
///
/// # Errors
///
/// Returns [`DeltaError::InvalidConfig`] if `options` or `writer` hold out
/// of range values.
///
/// # Examples
///
/// ```
/// use gdiff::{decode, encode_with, DeltaOptions, WriterOptions};
///
/// let source = vec![7u8; 4096];
/// let mut target = source.clone();
/// target[2000] = 8;
///
/// let options = DeltaOptions::new().chunk_size(32).duplicate_checksum(true);
/// let delta = encode_with(&source, &target, &options, WriterOptions::new().differential(true)).unwrap();
/// assert_eq!(decode(&delta, &source).unwrap(), target);
/// ```
pub fn encode_with(
    source: &[u8],
    target: &[u8],
    options: &DeltaOptions,
    writer: WriterOptions,
) -> Result<Vec<u8>> {
    let mut delta = Delta::with_options(options.clone())?;
    let mut writer = GDiffWriter::with_options(Vec::with_capacity(target.len() / 4 + 16), writer)?;
    delta.compute(&mut SliceSource::new(source), target, &mut writer)?;
    Ok(writer.into_inner())
}

/// Applies `delta` to `source` and returns the reconstructed target.
///
/// # Errors
///
/// Returns a format error ([`DeltaError::is_format_error`]) if `delta` is
/// malformed or truncated, and [`DeltaError::UnexpectedEndOfSource`] if it
/// copies past the end of `source`.
///
/// # Examples
///
/// ```
/// use gdiff::{decode, encode};
///
/// let source = b"Hello, World!";
/// let target = b"Hello, Rust!";
///
/// let delta = encode(source, target).unwrap();
/// assert_eq!(decode(&delta, source).unwrap(), target);
/// assert!(decode(&delta[..delta.len() - 1], source).is_err());
/// ```
pub fn decode(delta: &[u8], source: &[u8]) -> Result<Vec<u8>> {
    let mut output = Vec::with_capacity(delta.len().max(source.len()));
    apply(&mut SliceSource::new(source), delta, &mut output)?;
    Ok(output)
}

/// Merges `first` (A→B) and `second` (B→C) into a delta A→C.
///
/// # Errors
///
/// Fails with a format error if either delta is malformed, or with
/// [`DeltaError::RangeOutOfBounds`] if `second` copies past the end of B.
///
/// # Examples
///
/// ```
/// use gdiff::{decode, encode, merge_bytes, WriterOptions};
///
/// let a = b"version one of the document, with some text".to_vec();
/// let b = b"version two of the document, with some text".to_vec();
/// let c = b"version two of the document, with more text".to_vec();
///
/// let ab = encode(&a, &b).unwrap();
/// let bc = encode(&b, &c).unwrap();
/// let ac = merge_bytes(&ab, &bc, WriterOptions::default()).unwrap();
/// assert_eq!(decode(&ac, &a).unwrap(), c);
/// ```
pub fn merge_bytes(first: &[u8], second: &[u8], writer: WriterOptions) -> Result<Vec<u8>> {
    let mut writer = GDiffWriter::with_options(Vec::new(), writer)?;
    merge(
        &mut SliceSource::new(first),
        second,
        &mut writer,
        &IndexOptions::default(),
    )?;
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zeros_then_hello_wire_bytes() {
        let source = vec![0u8; 1000];
        let mut target = source.clone();
        target.extend_from_slice(b"HELLO");

        let delta = encode(&source, &target).unwrap();
        assert_eq!(
            delta,
            [
                0xd1, 0xff, 0xd1, 0xff, 0x04, // preamble
                0xfa, 0x00, 0x00, 0x03, 0xe8, // COPY_USHORT_USHORT 0, 1000
                0x05, b'H', b'E', b'L', b'L', b'O', // literal run
                0x00, // EOF
            ]
        );
        assert_eq!(decode(&delta, &source).unwrap(), target);
    }

    #[test]
    fn test_encode_decode_identical() {
        let data = b"Same data on both sides, long enough for a block";
        let delta = encode(data, data).unwrap();
        assert_eq!(decode(&delta, data).unwrap(), data);
        assert!(delta.len() < 16);
    }

    #[test]
    fn test_encode_decode_empty() {
        let delta = encode(b"Some base data", b"").unwrap();
        assert_eq!(delta, [0xd1, 0xff, 0xd1, 0xff, 0x04, 0x00]);
        assert!(decode(&delta, b"Some base data").unwrap().is_empty());

        let delta = encode(b"", b"new").unwrap();
        assert_eq!(decode(&delta, b"").unwrap(), b"new");
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn test_encode_decode_large() {
        let source: Vec<u8> = (0..100_000).map(|i| (i % 256) as u8).collect();
        let mut target = source.clone();
        for i in (0..target.len()).step_by(488) {
            target[i] = target[i].wrapping_add(1);
        }

        let delta = encode(&source, &target).unwrap();
        assert_eq!(decode(&delta, &source).unwrap(), target);
        assert!(delta.len() < target.len() / 4);
    }

    #[test]
    fn test_merge_bytes_differential_output() {
        let a = b"alpha beta gamma delta epsilon zeta eta theta".to_vec();
        let b = b"alpha beta GAMMA delta epsilon zeta eta theta iota".to_vec();
        let c = b"beta GAMMA delta epsilon zeta eta theta iota kappa".to_vec();

        let ab = encode_with(&a, &b, &DeltaOptions::new().chunk_size(4), WriterOptions::default())
            .unwrap();
        let bc = encode_with(&b, &c, &DeltaOptions::new().chunk_size(4), WriterOptions::default())
            .unwrap();
        let ac = merge_bytes(&ab, &bc, WriterOptions::new().differential(true)).unwrap();
        assert_eq!(ac[4], 0x05);
        assert_eq!(decode(&ac, &a).unwrap(), c);
    }
}
