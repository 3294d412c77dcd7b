//! Error types for delta computation, patching and merging.

use std::io;

use thiserror::Error;

/// Result type for gdiff operations.
pub type Result<T> = std::result::Result<T, DeltaError>;

/// Errors that can occur while computing, applying or merging deltas.
#[derive(Debug, Error)]
pub enum DeltaError {
    /// A read, seek or write on an underlying source or sink failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stream does not start with the GDIFF magic and a known version flag.
    #[error("Invalid delta: magic string not found")]
    InvalidMagic,

    /// An opcode byte that has no meaning in the stream's mode.
    #[error("Invalid delta: unknown opcode {opcode:#04x} at byte {position}")]
    UnknownOpcode {
        /// The offending opcode byte.
        opcode: u8,
        /// Wire offset of the opcode.
        position: u64,
    },

    /// The wire stream ended before a record or the EOF marker was complete.
    #[error("Unexpected end of delta data")]
    UnexpectedEndOfData,

    /// A copy reached past the end of the source.
    #[error("Unexpected end of source: {missing} bytes missing at offset {offset}")]
    UnexpectedEndOfSource {
        /// Absolute source offset the copy started at.
        offset: u64,
        /// Number of bytes that could not be read.
        missing: u64,
    },

    /// A differential offset resolved outside the addressable range.
    #[error("Invalid delta: offset delta {delta} from base {base} is out of range")]
    InvalidOffset {
        /// Previous absolute copy offset.
        base: u64,
        /// Signed delta read from the wire.
        delta: i64,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// An input is larger than the supported length.
    #[error("Input of {len} bytes exceeds the limit of {max} bytes")]
    SizeLimit {
        /// Actual length.
        len: u64,
        /// Maximum supported length.
        max: u64,
    },

    /// A patch index query extends past the reconstructed length of its delta.
    #[error("Range {offset}+{length} exceeds the {available} bytes described by the delta")]
    RangeOutOfBounds {
        /// Start of the requested range.
        offset: u64,
        /// Length of the requested range.
        length: u64,
        /// Reconstructed length of the indexed delta.
        available: u64,
    },

    /// Building a patch index ran out of memory on every attempt.
    #[error("Patch index gave up after {attempts} attempts (interval {interval})")]
    IndexExhausted {
        /// Number of builds attempted.
        attempts: u32,
        /// Sampling interval of the last attempt.
        interval: usize,
    },

    /// An instruction was added to a sink after it was closed.
    #[error("Instruction added after the stream was closed")]
    SinkClosed,

    /// A persisted checksum snapshot is malformed.
    #[error("Invalid checksum snapshot: {0}")]
    InvalidSnapshot(String),
}

impl DeltaError {
    /// Maps an `UnexpectedEof` I/O error to [`DeltaError::UnexpectedEndOfData`].
    ///
    /// Wire decoding reads through `std::io`, so a truncated stream surfaces
    /// as an I/O error first.
    pub(crate) fn from_wire(err: io::Error) -> Self {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            DeltaError::UnexpectedEndOfData
        } else {
            DeltaError::Io(err)
        }
    }

    /// Returns true for errors caused by a malformed or truncated delta.
    pub fn is_format_error(&self) -> bool {
        matches!(
            self,
            DeltaError::InvalidMagic
                | DeltaError::UnknownOpcode { .. }
                | DeltaError::UnexpectedEndOfData
                | DeltaError::InvalidOffset { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_maps_to_end_of_data() {
        let err = DeltaError::from_wire(io::Error::from(io::ErrorKind::UnexpectedEof));
        assert!(matches!(err, DeltaError::UnexpectedEndOfData));
        assert!(err.is_format_error());

        let err = DeltaError::from_wire(io::Error::from(io::ErrorKind::PermissionDenied));
        assert!(matches!(err, DeltaError::Io(_)));
        assert!(!err.is_format_error());
    }

    #[test]
    fn test_display_mentions_opcode() {
        let err = DeltaError::UnknownOpcode {
            opcode: 0xf5,
            position: 12,
        };
        assert_eq!(
            err.to_string(),
            "Invalid delta: unknown opcode 0xf5 at byte 12"
        );
    }
}
