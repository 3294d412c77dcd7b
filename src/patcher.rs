//! Reading GDIFF streams: decoding, applying and converting.

use std::io::{self, Read, Write};

use crate::error::{DeltaError, Result};
use crate::opcode::{self, Mode, OffsetState, Record};
use crate::sink::{Instruction, InstructionSink};
use crate::source::SeekableSource;

/// Buffer size used when moving copy and literal payloads.
const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// A decoded record with its copy offset resolved to an absolute position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Copy `length` bytes from absolute source `offset`.
    Copy {
        /// Absolute source offset.
        offset: u64,
        /// Number of bytes.
        length: u32,
    },
    /// A literal run of `length` bytes; read the payload with
    /// [`GDiffReader::read_literal`].
    Literal {
        /// Payload length.
        length: u32,
    },
}

impl Command {
    /// Number of output bytes this command produces.
    pub fn output_len(&self) -> u64 {
        match *self {
            Command::Copy { length, .. } | Command::Literal { length } => u64::from(length),
        }
    }
}

/// Sequential decoder for a GDIFF stream.
///
/// Literal payloads that the caller does not read are skipped when the next
/// command is requested.
pub struct GDiffReader<R> {
    reader: R,
    offsets: OffsetState,
    position: u64,
    pending: u64,
    finished: bool,
}

impl<R: Read> GDiffReader<R> {
    /// Reads and validates the preamble.
    pub fn new(mut reader: R) -> Result<Self> {
        let mode = opcode::read_header(&mut reader)?;
        Ok(Self {
            reader,
            offsets: OffsetState::new(mode),
            position: opcode::HEADER_LEN,
            pending: 0,
            finished: false,
        })
    }

    /// Returns the stream mode.
    pub fn mode(&self) -> Mode {
        self.offsets.mode()
    }

    /// Wire offset of the next unread byte.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Returns true once the EOF marker was read.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Decodes the next command, or `None` at the EOF marker.
    ///
    /// A stream that ends without the marker fails with
    /// [`DeltaError::UnexpectedEndOfData`].
    pub fn next_command(&mut self) -> Result<Option<Command>> {
        if self.finished {
            return Ok(None);
        }
        self.skip_pending()?;

        let mode = self.mode();
        let (record, header_len) = opcode::read_record(&mut self.reader, mode, self.position)?;
        self.position += header_len as u64;

        match record {
            Record::Eof => {
                self.finished = true;
                Ok(None)
            }
            Record::Literal { length } => {
                self.pending = u64::from(length);
                Ok(Some(Command::Literal { length }))
            }
            Record::Copy { value, length } => {
                let offset = self.offsets.decode(value)?;
                Ok(Some(Command::Copy { offset, length }))
            }
        }
    }

    /// Reads payload bytes of the current literal run into `buf`.
    ///
    /// `buf` must not be longer than what remains of the run.
    pub fn read_literal(&mut self, buf: &mut [u8]) -> Result<()> {
        if buf.len() as u64 > self.pending {
            return Err(DeltaError::InvalidConfig(format!(
                "requested {} literal bytes but only {} remain in the run",
                buf.len(),
                self.pending
            )));
        }
        self.reader
            .read_exact(buf)
            .map_err(DeltaError::from_wire)?;
        self.pending -= buf.len() as u64;
        self.position += buf.len() as u64;
        Ok(())
    }

    /// Decodes the next instruction with its literal payload, or `None` at EOF.
    pub fn next_instruction(&mut self) -> Result<Option<Instruction>> {
        match self.next_command()? {
            None => Ok(None),
            Some(Command::Copy { offset, length }) => Ok(Some(Instruction::Copy { offset, length })),
            Some(Command::Literal { length }) => {
                // The length comes off the wire; grow with the data actually read.
                let mut bytes = Vec::new();
                let read = (&mut self.reader)
                    .take(u64::from(length))
                    .read_to_end(&mut bytes)
                    .map_err(DeltaError::from_wire)? as u64;
                self.pending -= read;
                self.position += read;
                if read < u64::from(length) {
                    return Err(DeltaError::UnexpectedEndOfData);
                }
                Ok(Some(Instruction::Literal(bytes)))
            }
        }
    }

    /// Consumes the reader and returns the underlying stream.
    pub fn into_inner(self) -> R {
        self.reader
    }

    fn skip_pending(&mut self) -> Result<()> {
        if self.pending == 0 {
            return Ok(());
        }
        let skipped = io::copy(&mut (&mut self.reader).take(self.pending), &mut io::sink())?;
        self.position += skipped;
        if skipped < self.pending {
            return Err(DeltaError::UnexpectedEndOfData);
        }
        self.pending = 0;
        Ok(())
    }
}

/// Applies `patch` to `source`, writing the reconstructed target to `output`.
///
/// Returns the number of bytes written. Copies read the source at absolute
/// offsets. Bytes already written when an error surfaces are not rolled back.
///
/// # Examples
///
/// ```
/// use gdiff::{apply, encode, SliceSource};
///
/// let source = b"The quick brown fox jumps over the lazy dog";
/// let target = b"The quick brown cat jumps over the lazy dog";
/// let patch = encode(source, target).unwrap();
///
/// let mut output = Vec::new();
/// apply(&mut SliceSource::new(&source[..]), &patch[..], &mut output).unwrap();
/// assert_eq!(output, target);
/// ```
pub fn apply<S, R, W>(source: &mut S, patch: R, mut output: W) -> Result<u64>
where
    S: SeekableSource + ?Sized,
    R: Read,
    W: Write,
{
    let mut reader = GDiffReader::new(patch)?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    tracing::debug!(
        source_len = source.len(),
        mode = ?reader.mode(),
        "patch: applying"
    );

    while let Some(command) = reader.next_command()? {
        match command {
            Command::Copy { offset, length } => {
                let mut done = 0u64;
                let length = u64::from(length);
                while done < length {
                    let n = (length - done).min(COPY_BUFFER_SIZE as u64) as usize;
                    source.read_exact_at(offset + done, &mut buf[..n])?;
                    output.write_all(&buf[..n])?;
                    done += n as u64;
                }
                total += length;
            }
            Command::Literal { length } => {
                let mut remaining = length as usize;
                while remaining > 0 {
                    let n = remaining.min(COPY_BUFFER_SIZE);
                    reader.read_literal(&mut buf[..n])?;
                    output.write_all(&buf[..n])?;
                    remaining -= n;
                }
                total += u64::from(length);
            }
        }
    }
    output.flush()?;

    tracing::debug!(written = total, "patch: applied");
    Ok(total)
}

/// Re-emits the instructions of `patch` into `sink`, then closes the sink.
///
/// Returns the target length the patch describes. Feeding a
/// [`GDiffWriter`](crate::GDiffWriter) switches a patch between normal and
/// differential mode; feeding a [`DebugWriter`](crate::DebugWriter) dumps it.
pub fn convert<R, K>(patch: R, sink: &mut K) -> Result<u64>
where
    R: Read,
    K: InstructionSink + ?Sized,
{
    let mut reader = GDiffReader::new(patch)?;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;

    while let Some(command) = reader.next_command()? {
        match command {
            Command::Copy { offset, length } => {
                sink.add_copy(offset, length)?;
                total += u64::from(length);
            }
            Command::Literal { length } => {
                let mut remaining = length as usize;
                while remaining > 0 {
                    let n = remaining.min(COPY_BUFFER_SIZE);
                    reader.read_literal(&mut buf[..n])?;
                    sink.add_literal(&buf[..n])?;
                    remaining -= n;
                }
                total += u64::from(length);
            }
        }
    }
    sink.close()?;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::InstructionCollector;
    use crate::source::SliceSource;
    use crate::writer::{GDiffWriter, WriterOptions};

    #[test]
    fn test_oversized_literal_length_is_truncation() {
        let mut patch = vec![0xd1, 0xff, 0xd1, 0xff, 0x04, opcode::DATA_INT];
        patch.extend_from_slice(&u32::MAX.to_be_bytes());
        patch.extend_from_slice(b"ab");

        let mut reader = GDiffReader::new(&patch[..]).unwrap();
        assert!(matches!(
            reader.next_instruction(),
            Err(DeltaError::UnexpectedEndOfData)
        ));
        assert_eq!(reader.position(), patch.len() as u64);
    }

    fn patch_with(options: WriterOptions, build: impl FnOnce(&mut GDiffWriter<Vec<u8>>)) -> Vec<u8> {
        let mut writer = GDiffWriter::with_options(Vec::new(), options).unwrap();
        build(&mut writer);
        writer.close().unwrap();
        writer.into_inner()
    }

    #[test]
    fn test_apply_copies_and_literals() {
        let patch = patch_with(WriterOptions::default(), |w| {
            w.add_copy(4, 5).unwrap();
            w.add_literal(b" and ").unwrap();
            w.add_copy(0, 3).unwrap();
        });

        let mut source = SliceSource::new(&b"abc quick"[..]);
        let mut output = Vec::new();
        let written = apply(&mut source, &patch[..], &mut output).unwrap();
        assert_eq!(written, 13);
        assert_eq!(output, b"quick and abc");
    }

    #[test]
    fn test_apply_differential_patch() {
        let patch = patch_with(WriterOptions::new().differential(true), |w| {
            w.add_copy(6, 3).unwrap();
            w.add_copy(0, 3).unwrap();
            w.add_copy(3, 3).unwrap();
        });

        let mut output = Vec::new();
        apply(&mut SliceSource::new(&b"abcdefghi"[..]), &patch[..], &mut output).unwrap();
        assert_eq!(output, b"ghiabcdef");
    }

    #[test]
    fn test_missing_eof_is_an_error() {
        let mut patch = patch_with(WriterOptions::default(), |w| {
            w.add_literal(b"data").unwrap();
        });
        assert_eq!(patch.pop(), Some(opcode::EOF));

        let mut output = Vec::new();
        let err = apply(&mut SliceSource::new(&b""[..]), &patch[..], &mut output).unwrap_err();
        assert!(matches!(err, DeltaError::UnexpectedEndOfData));
        assert_eq!(output, b"data");
    }

    #[test]
    fn test_truncated_literal_is_an_error() {
        let patch = [0xd1, 0xff, 0xd1, 0xff, 0x04, 5, b'a', b'b'];
        let err = apply(&mut SliceSource::new(&b""[..]), &patch[..], Vec::new()).unwrap_err();
        assert!(matches!(err, DeltaError::UnexpectedEndOfData));
    }

    #[test]
    fn test_copy_past_source_end() {
        let patch = patch_with(WriterOptions::default(), |w| {
            w.add_copy(2, 10).unwrap();
        });
        let err = apply(&mut SliceSource::new(&b"short"[..]), &patch[..], Vec::new()).unwrap_err();
        assert!(matches!(
            err,
            DeltaError::UnexpectedEndOfSource {
                offset: 2,
                missing: 7
            }
        ));
    }

    #[test]
    fn test_bad_magic() {
        let err = apply(&mut SliceSource::new(&b""[..]), &b"PK\x03\x04\x00"[..], Vec::new())
            .unwrap_err();
        assert!(matches!(err, DeltaError::InvalidMagic));
    }

    #[test]
    fn test_reader_skips_unread_literals() {
        let patch = patch_with(WriterOptions::default(), |w| {
            w.add_literal(b"skipped").unwrap();
            w.add_copy(1, 2).unwrap();
        });

        let mut reader = GDiffReader::new(&patch[..]).unwrap();
        assert_eq!(
            reader.next_command().unwrap(),
            Some(Command::Literal { length: 7 })
        );
        assert_eq!(
            reader.next_command().unwrap(),
            Some(Command::Copy {
                offset: 1,
                length: 2
            })
        );
        assert_eq!(reader.next_command().unwrap(), None);
        assert!(reader.is_finished());
        assert_eq!(reader.position(), patch.len() as u64);
    }

    #[test]
    fn test_convert_to_differential_and_back() {
        let original = patch_with(WriterOptions::default(), |w| {
            w.add_copy(40_000, 20).unwrap();
            w.add_literal(b"xyz").unwrap();
            w.add_copy(40_030, 20).unwrap();
        });

        let mut differential =
            GDiffWriter::with_options(Vec::new(), WriterOptions::new().differential(true)).unwrap();
        assert_eq!(convert(&original[..], &mut differential).unwrap(), 43);
        let differential = differential.into_inner();
        assert_eq!(differential[4], 0x05);
        assert!(differential.len() < original.len());

        let mut collector = InstructionCollector::new();
        convert(&differential[..], &mut collector).unwrap();
        assert!(collector.is_closed());
        assert_eq!(
            collector.into_instructions(),
            vec![
                Instruction::Copy {
                    offset: 40_000,
                    length: 20
                },
                Instruction::Literal(b"xyz".to_vec()),
                Instruction::Copy {
                    offset: 40_030,
                    length: 20
                },
            ]
        );
    }
}
