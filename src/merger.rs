//! Composing two deltas without materializing the intermediate file.
//!
//! Given a first delta A→B and a second delta B→C, every copy in the second
//! delta names a range of B. A [`PatchIndex`] over the first delta answers
//! "which instructions produce B[o..o+l)?" by jumping to a sampled record
//! near `o` and decoding forward, so the merged delta A→C is produced in one
//! pass over the second delta.

use std::io::Read;

use crate::error::{DeltaError, Result};
use crate::opcode::{self, Mode, OffsetState, Record};
use crate::patcher::{Command, GDiffReader};
use crate::sink::{Instruction, InstructionCollector, InstructionSink};
use crate::source::{SeekableSource, SourceCursor};

/// Default number of records between two index samples.
pub const DEFAULT_INDEX_INTERVAL: usize = 200;

/// Default number of index builds before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

const LITERAL_BUFFER_SIZE: usize = 64 * 1024;

/// Patch index configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexOptions {
    /// Records between two samples.
    pub interval: usize,
    /// Largest number of samples kept; exceeding it coarsens the interval.
    pub max_entries: Option<usize>,
    /// Builds attempted before [`DeltaError::IndexExhausted`].
    pub max_attempts: u32,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INDEX_INTERVAL,
            max_entries: None,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl IndexOptions {
    /// Sets the sampling interval.
    #[must_use]
    pub fn interval(mut self, interval: usize) -> Self {
        self.interval = interval;
        self
    }

    /// Caps the number of samples.
    #[must_use]
    pub fn max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries);
        self
    }

    /// Sets the number of build attempts.
    #[must_use]
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }
}

/// One sampled record of the indexed delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Output offset the record starts at.
    pub target_offset: u64,
    /// Wire offset of the record's opcode.
    pub wire_offset: u64,
    /// Differential offset base in effect before the record.
    pub base_offset: u64,
}

/// Why a single build attempt stopped.
enum BuildFailure {
    /// Sample storage ran out; retry with a coarser interval.
    Exhausted,
    Fatal(DeltaError),
}

impl From<DeltaError> for BuildFailure {
    fn from(err: DeltaError) -> Self {
        BuildFailure::Fatal(err)
    }
}

/// Sparse seek index over an encoded delta.
#[derive(Debug, Clone)]
pub struct PatchIndex {
    entries: Vec<IndexEntry>,
    interval: usize,
    target_len: u64,
    mode: Mode,
}

impl PatchIndex {
    /// Decodes `delta` once and samples every `interval`-th record.
    ///
    /// If samples cannot be stored (allocation failure or more than
    /// `max_entries`), the interval is doubled and the build restarts, up to
    /// `max_attempts` builds in total.
    pub fn build<S>(delta: &mut S, options: &IndexOptions) -> Result<Self>
    where
        S: SeekableSource + ?Sized,
    {
        if options.interval == 0 || options.max_attempts == 0 {
            return Err(DeltaError::InvalidConfig(
                "index interval and attempts must be positive".to_string(),
            ));
        }

        let mut interval = options.interval;
        for attempt in 1..=options.max_attempts {
            match Self::build_once(delta, interval, options.max_entries) {
                Ok(index) => {
                    tracing::debug!(
                        entries = index.entries.len(),
                        interval,
                        target_len = index.target_len,
                        "patch index: built"
                    );
                    return Ok(index);
                }
                Err(BuildFailure::Exhausted) => {
                    let coarser = interval.saturating_mul(2);
                    tracing::warn!(
                        attempt,
                        interval,
                        next_interval = coarser,
                        "patch index: out of sample space, coarsening"
                    );
                    if attempt == options.max_attempts {
                        return Err(DeltaError::IndexExhausted {
                            attempts: attempt,
                            interval,
                        });
                    }
                    interval = coarser;
                }
                Err(BuildFailure::Fatal(err)) => return Err(err),
            }
        }
        Err(DeltaError::IndexExhausted {
            attempts: options.max_attempts,
            interval,
        })
    }

    fn build_once<S>(
        delta: &mut S,
        interval: usize,
        max_entries: Option<usize>,
    ) -> std::result::Result<Self, BuildFailure>
    where
        S: SeekableSource + ?Sized,
    {
        let mut cursor = SourceCursor::new(delta, 0);
        let mode = opcode::read_header(&mut cursor)?;
        let delta_len = cursor.source_len();

        let mut entries: Vec<IndexEntry> = Vec::new();
        let mut offsets = OffsetState::new(mode);
        let mut target_offset = 0u64;
        let mut wire_offset = opcode::HEADER_LEN;
        let mut records = 0usize;

        loop {
            let entry = IndexEntry {
                target_offset,
                wire_offset,
                base_offset: offsets.current(),
            };
            let (record, header_len) = opcode::read_record(&mut cursor, mode, wire_offset)?;

            let duplicate = entries
                .last()
                .is_some_and(|last| last.target_offset == target_offset);
            if records % interval == 0 && !duplicate {
                if max_entries.is_some_and(|max| entries.len() >= max)
                    || entries.try_reserve(1).is_err()
                {
                    return Err(BuildFailure::Exhausted);
                }
                tracing::trace!(target_offset, wire_offset, "patch index: sample");
                entries.push(entry);
            }
            records += 1;
            wire_offset += header_len as u64;

            match record {
                Record::Eof => break,
                Record::Literal { length } => {
                    wire_offset += u64::from(length);
                    if wire_offset > delta_len {
                        return Err(DeltaError::UnexpectedEndOfData.into());
                    }
                    cursor.set_position(wire_offset);
                }
                Record::Copy { value, .. } => {
                    offsets.decode(value)?;
                }
            }
            target_offset += record.output_len();
        }

        Ok(Self {
            entries,
            interval,
            target_len: target_offset,
            mode,
        })
    }

    /// Returns the sampling interval the index was built with.
    pub fn interval(&self) -> usize {
        self.interval
    }

    /// Returns the sampled records.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Length of the output the indexed delta reconstructs.
    pub fn target_len(&self) -> u64 {
        self.target_len
    }

    /// Returns the mode of the indexed delta.
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns the instructions producing output range `[offset, offset + length)`.
    pub fn resolve<S>(&self, delta: &mut S, offset: u64, length: u64) -> Result<Vec<Instruction>>
    where
        S: SeekableSource + ?Sized,
    {
        let mut collector = InstructionCollector::new();
        self.resolve_into(delta, offset, length, &mut collector)?;
        Ok(collector.into_instructions())
    }

    /// Streams the instructions producing `[offset, offset + length)` into `sink`.
    ///
    /// Copies are trimmed to the range and keep their offsets into the
    /// indexed delta's source; literal bytes are read from the delta.
    pub fn resolve_into<S, K>(&self, delta: &mut S, offset: u64, length: u64, sink: &mut K) -> Result<()>
    where
        S: SeekableSource + ?Sized,
        K: InstructionSink + ?Sized,
    {
        let end = offset
            .checked_add(length)
            .filter(|&end| end <= self.target_len)
            .ok_or(DeltaError::RangeOutOfBounds {
                offset,
                length,
                available: self.target_len,
            })?;
        if length == 0 {
            return Ok(());
        }

        let slot = self
            .entries
            .partition_point(|entry| entry.target_offset <= offset)
            .saturating_sub(1);
        let start = self.entries.get(slot).ok_or(DeltaError::UnexpectedEndOfData)?;

        let mut cursor = SourceCursor::new(delta, start.wire_offset);
        let mut offsets = OffsetState::with_base(self.mode, start.base_offset);
        let mut position = start.target_offset;
        let mut buf = Vec::new();

        while position < end {
            let wire_offset = cursor.position();
            let (record, _) = opcode::read_record(&mut cursor, self.mode, wire_offset)?;
            let record_end = position + record.output_len();
            let from = position.max(offset);
            let to = record_end.min(end);

            match record {
                Record::Eof => return Err(DeltaError::UnexpectedEndOfData),
                Record::Literal { length } => {
                    let payload = cursor.position();
                    if from < to {
                        cursor.set_position(payload + (from - position));
                        let mut remaining = (to - from) as usize;
                        buf.resize(remaining.min(LITERAL_BUFFER_SIZE), 0);
                        while remaining > 0 {
                            let n = remaining.min(buf.len());
                            cursor
                                .read_exact(&mut buf[..n])
                                .map_err(DeltaError::from_wire)?;
                            sink.add_literal(&buf[..n])?;
                            remaining -= n;
                        }
                    }
                    cursor.set_position(payload + u64::from(length));
                }
                Record::Copy { value, .. } => {
                    let base = offsets.decode(value)?;
                    if from < to {
                        sink.add_copy(base + (from - position), (to - from) as u32)?;
                    }
                }
            }
            position = record_end;
        }
        Ok(())
    }
}

/// Merges `first` (A→B) and `second` (B→C) into one delta A→C written to `sink`.
///
/// `first` is random-access; `second` is read sequentially. The index over
/// `first` is only built once `second` contains a copy. Returns the length
/// of C. The sink is closed at the end.
pub fn merge<S, R, K>(first: &mut S, second: R, sink: &mut K, options: &IndexOptions) -> Result<u64>
where
    S: SeekableSource + ?Sized,
    R: Read,
    K: InstructionSink + ?Sized,
{
    let mut reader = GDiffReader::new(second)?;
    let mut index: Option<PatchIndex> = None;
    let mut buf = vec![0u8; LITERAL_BUFFER_SIZE];
    let mut total = 0u64;

    tracing::debug!(first_len = first.len(), "merge: starting");

    while let Some(command) = reader.next_command()? {
        match command {
            Command::Literal { length } => {
                let mut remaining = length as usize;
                while remaining > 0 {
                    let n = remaining.min(buf.len());
                    reader.read_literal(&mut buf[..n])?;
                    sink.add_literal(&buf[..n])?;
                    remaining -= n;
                }
            }
            Command::Copy { offset, length } => {
                if index.is_none() {
                    index = Some(PatchIndex::build(&mut *first, options)?);
                }
                if let Some(index) = index.as_ref() {
                    index.resolve_into(&mut *first, offset, u64::from(length), &mut *sink)?;
                }
            }
        }
        total += command.output_len();
    }

    tracing::debug!(
        target_len = total,
        interval = index.as_ref().map(PatchIndex::interval),
        "merge: done"
    );
    sink.close()?;
    Ok(total)
}
