//! Delta computation: the rolling-checksum match engine.

use std::fmt;
use std::io::{self, Read, Write};

use crate::buffer::{TargetWindow, window_capacity};
use crate::checksum::{ChecksumTable, WindowHash};
use crate::error::{DeltaError, Result};
use crate::sink::InstructionSink;
use crate::source::SeekableSource;

/// Default block size.
pub const DEFAULT_CHUNK_SIZE: usize = 16;

/// Longest match emitted as a single copy.
pub const LONGEST_POSSIBLE_MATCH: usize = i16::MAX as usize - 4;

/// Default number of candidate blocks verified per position.
pub const DEFAULT_MAX_PROBES: usize = 8;

/// Target bytes between two progress reports.
pub const PROGRESS_STEP: u64 = 1024 * 1024;

/// Largest source read while extending a match.
const MATCH_CHUNK: usize = 4096;

/// Configuration of a [`Delta`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaOptions {
    /// Block size; also the shortest copy emitted.
    pub chunk_size: usize,
    /// Keep the checksum table for the next computation.
    pub keep_source: bool,
    /// Never reference source bytes at or after the current target position.
    pub autocode: bool,
    /// Trust checksum hits without comparing bytes.
    pub accept_hash: bool,
    /// Confirm every hit with a second, independent checksum.
    pub duplicate_checksum: bool,
    /// Candidate blocks verified per target position.
    pub max_probes: usize,
}

impl Default for DeltaOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            keep_source: false,
            autocode: false,
            accept_hash: false,
            duplicate_checksum: false,
            max_probes: DEFAULT_MAX_PROBES,
        }
    }
}

impl DeltaOptions {
    /// Returns the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the block size.
    #[must_use]
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Sets whether the checksum table is retained.
    #[must_use]
    pub fn keep_source(mut self, keep: bool) -> Self {
        self.keep_source = keep;
        self
    }

    /// Sets autocode mode.
    #[must_use]
    pub fn autocode(mut self, autocode: bool) -> Self {
        self.autocode = autocode;
        self
    }

    /// Sets blind acceptance of checksum hits.
    #[must_use]
    pub fn accept_hash(mut self, accept: bool) -> Self {
        self.accept_hash = accept;
        self
    }

    /// Sets duplicate-checksum mode.
    #[must_use]
    pub fn duplicate_checksum(mut self, duplicate: bool) -> Self {
        self.duplicate_checksum = duplicate;
        self
    }

    /// Sets the number of candidates verified per position.
    #[must_use]
    pub fn max_probes(mut self, probes: usize) -> Self {
        self.max_probes = probes;
        self
    }

    /// Checks that every value is in range.
    pub fn validate(&self) -> Result<()> {
        validate_chunk_size(self.chunk_size)?;
        if self.max_probes == 0 {
            return Err(DeltaError::InvalidConfig(
                "at least one probe per position is required".to_string(),
            ));
        }
        Ok(())
    }
}

fn validate_chunk_size(size: usize) -> Result<()> {
    if size == 0 || size > LONGEST_POSSIBLE_MATCH {
        return Err(DeltaError::InvalidConfig(format!(
            "chunk size must be within 1..={LONGEST_POSSIBLE_MATCH}, got {size}"
        )));
    }
    Ok(())
}

/// Progress report passed to the callback set with [`Delta::set_progress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Progress {
    /// Target bytes processed so far.
    pub processed: u64,
    /// Target bytes represented by copies so far.
    pub found: u64,
}

/// Summary of one computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeltaStats {
    /// Target bytes processed.
    pub processed: u64,
    /// Target bytes represented by copies.
    pub copied: u64,
    /// Target bytes emitted as literals.
    pub literal_bytes: u64,
    /// Number of copies emitted.
    pub copies: u64,
}

type ProgressFn = Box<dyn FnMut(Progress) + Send>;

/// Computes deltas between a seekable source and a sequential target.
///
/// The target is read once, front to back. At each position the checksum of
/// the next `chunk_size` bytes is looked up in the source's block index; hits
/// are verified and extended byte by byte, and a match of at least one block
/// becomes a copy. Everything else becomes literal bytes.
///
/// # Examples
///
/// ```
/// use gdiff::{Delta, GDiffWriter, SliceSource};
///
/// let source = vec![0u8; 1000];
/// let mut target = source.clone();
/// target.extend_from_slice(b"HELLO");
///
/// let mut writer = GDiffWriter::new(Vec::new()).unwrap();
/// let stats = Delta::new()
///     .compute(&mut SliceSource::new(&source), &target[..], &mut writer)
///     .unwrap();
/// assert_eq!(stats.copied, 1000);
/// assert_eq!(stats.literal_bytes, 5);
/// ```
pub struct Delta {
    options: DeltaOptions,
    table: Option<ChecksumTable>,
    progress: Option<ProgressFn>,
}

impl fmt::Debug for Delta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delta")
            .field("options", &self.options)
            .field("has_source", &self.table.is_some())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Default for Delta {
    fn default() -> Self {
        Self::new()
    }
}

impl Delta {
    /// Creates an engine with default options.
    pub fn new() -> Self {
        Self {
            options: DeltaOptions::default(),
            table: None,
            progress: None,
        }
    }

    /// Creates an engine with the given options.
    pub fn with_options(options: DeltaOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self {
            options,
            table: None,
            progress: None,
        })
    }

    /// Returns the current options.
    pub fn options(&self) -> &DeltaOptions {
        &self.options
    }

    /// Returns the block size.
    pub fn chunk_size(&self) -> usize {
        self.options.chunk_size
    }

    /// Changes the block size. A retained table is cleared if it differs.
    pub fn set_chunk_size(&mut self, size: usize) -> Result<()> {
        validate_chunk_size(size)?;
        if size != self.options.chunk_size {
            self.options.chunk_size = size;
            if let Some(table) = self.table.as_mut() {
                table.set_block_size(size)?;
            }
        }
        Ok(())
    }

    /// Retains the checksum table between computations.
    pub fn set_keep_source(&mut self, keep: bool) {
        self.options.keep_source = keep;
        if !keep {
            self.table = None;
        }
    }

    /// Enables autocode mode.
    pub fn set_autocode(&mut self, autocode: bool) {
        self.options.autocode = autocode;
    }

    /// Enables blind acceptance of checksum hits.
    pub fn set_accept_hash(&mut self, accept: bool) {
        self.options.accept_hash = accept;
    }

    /// Enables duplicate-checksum mode. A retained table is dropped if it differs.
    pub fn set_duplicate_checksum(&mut self, duplicate: bool) {
        if duplicate != self.options.duplicate_checksum {
            self.options.duplicate_checksum = duplicate;
            self.table = None;
        }
    }

    /// Installs a progress callback, called every [`PROGRESS_STEP`] target bytes.
    pub fn set_progress<F>(&mut self, callback: F)
    where
        F: FnMut(Progress) + Send + 'static,
    {
        self.progress = Some(Box::new(callback));
    }

    /// Drops a retained checksum table.
    pub fn clear_source(&mut self) {
        self.table = None;
    }

    /// Returns true if a checksum table is retained.
    pub fn has_source(&self) -> bool {
        self.table.is_some()
    }

    /// Returns the retained checksum table, if any.
    pub fn checksum_table(&self) -> Option<&ChecksumTable> {
        self.table.as_ref()
    }

    /// Computes the delta of `target` against `source` and closes `sink`.
    pub fn compute<S, R, K>(&mut self, source: &mut S, target: R, sink: &mut K) -> Result<DeltaStats>
    where
        S: SeekableSource + ?Sized,
        R: Read,
        K: InstructionSink + ?Sized,
    {
        let stats = self.compute_segment(source, target, sink, 0, 0)?;
        sink.close()?;
        Ok(stats)
    }

    /// Computes the delta of one target segment without closing `sink`.
    ///
    /// `source` holds the reference bytes starting at `source_offset`, and
    /// `target` yields the target bytes starting at `target_offset`. Copies
    /// are emitted at `source_offset` plus the offset within `source`; the
    /// target offset only matters in autocode mode.
    pub fn compute_segment<S, R, K>(
        &mut self,
        source: &mut S,
        target: R,
        sink: &mut K,
        source_offset: u64,
        target_offset: u64,
    ) -> Result<DeltaStats>
    where
        S: SeekableSource + ?Sized,
        R: Read,
        K: InstructionSink + ?Sized,
    {
        self.options.validate()?;
        let options = &self.options;
        let block = options.chunk_size;

        let reusable = options.keep_source
            && self.table.as_ref().is_some_and(|table| {
                table.block_size() == block && table.is_duplicate() == options.duplicate_checksum
            });
        let mut table = match self.table.take() {
            Some(table) if reusable => table,
            _ => ChecksumTable::new(block, options.duplicate_checksum)?,
        };
        if table.is_empty() {
            table.build(source)?;
        }

        tracing::debug!(
            chunk_size = block,
            source_len = source.len(),
            source_offset,
            target_offset,
            autocode = options.autocode,
            "delta: computing"
        );

        let mut matcher = Matcher {
            table: &table,
            options,
            source,
            source_offset,
            target_offset,
            buf: vec![0u8; MATCH_CHUNK],
        };
        let result = matcher.run(target, sink, &mut self.progress);

        if self.options.keep_source {
            self.table = Some(table);
        }
        let stats = result?;
        sink.flush()?;

        tracing::debug!(
            processed = stats.processed,
            copied = stats.copied,
            copies = stats.copies,
            literal_bytes = stats.literal_bytes,
            "delta: done"
        );
        Ok(stats)
    }

    /// Persists the retained checksum table.
    pub fn write_checksums<W: Write>(&self, writer: &mut W) -> Result<()> {
        let table = self.table.as_ref().ok_or_else(|| {
            DeltaError::InvalidConfig("no checksum table to write; enable keep_source".to_string())
        })?;
        table.write_snapshot(writer)
    }

    /// Loads a checksum table written by [`write_checksums`](Self::write_checksums).
    ///
    /// Turns on `keep_source` and adopts the table's block size and
    /// checksum mode. The source passed to the next computation must hold
    /// the bytes the table was built from.
    pub fn read_checksums<R: Read>(&mut self, reader: &mut R) -> Result<()> {
        let table = ChecksumTable::read_snapshot(reader)?;
        validate_chunk_size(table.block_size())?;
        self.options.chunk_size = table.block_size();
        self.options.duplicate_checksum = table.is_duplicate();
        self.options.keep_source = true;
        self.table = Some(table);
        Ok(())
    }
}

/// State of one computation over the source side.
struct Matcher<'a, S: ?Sized> {
    table: &'a ChecksumTable,
    options: &'a DeltaOptions,
    source: &'a mut S,
    source_offset: u64,
    target_offset: u64,
    buf: Vec<u8>,
}

impl<S: SeekableSource + ?Sized> Matcher<'_, S> {
    fn run<R, K>(
        &mut self,
        target: R,
        sink: &mut K,
        progress: &mut Option<ProgressFn>,
    ) -> Result<DeltaStats>
    where
        R: Read,
        K: InstructionSink + ?Sized,
    {
        let block = self.table.block_size();
        let mut window = TargetWindow::with_capacity(target, window_capacity(block));
        let mut hash: Option<WindowHash> = None;
        let mut continuation: Option<u64> = None;
        let mut stats = DeltaStats::default();
        let mut next_report = PROGRESS_STEP;

        loop {
            let available = window.fill(block)?;
            if available < block {
                // Too short for a block: the rest is literal.
                if available > 0 {
                    sink.add_literal(window.window(available))?;
                    window.advance(available);
                    stats.literal_bytes += available as u64;
                }
                break;
            }

            let current = match hash {
                Some(current) => current,
                None => self.table.hash(window.window(block)),
            };

            match self.best_match(&mut window, current, continuation)? {
                Some((offset, length)) => {
                    let absolute = self.source_offset + offset;
                    tracing::trace!(offset = absolute, length, "delta: copy");
                    sink.add_copy(absolute, length as u32)?;
                    window.advance(length);
                    hash = None;
                    continuation = Some(offset + length as u64);
                    stats.copied += length as u64;
                    stats.copies += 1;
                }
                None => {
                    let outgoing = window.byte_at(0);
                    hash = if window.fill(block + 1)? > block {
                        Some(self.table.roll(current, outgoing, window.byte_at(block)))
                    } else {
                        None
                    };
                    sink.add_data(outgoing)?;
                    window.advance(1);
                    continuation = None;
                    stats.literal_bytes += 1;
                }
            }

            if window.position() >= next_report {
                if let Some(callback) = progress.as_mut() {
                    callback(Progress {
                        processed: window.position(),
                        found: stats.copied,
                    });
                }
                while next_report <= window.position() {
                    next_report += PROGRESS_STEP;
                }
            }
        }

        stats.processed = window.position();
        Ok(stats)
    }

    /// Verifies the candidates for the window at the cursor and returns the
    /// longest match of at least one block, as (source offset, length).
    fn best_match<R: Read>(
        &mut self,
        window: &mut TargetWindow<R>,
        hash: WindowHash,
        continuation: Option<u64>,
    ) -> Result<Option<(u64, usize)>> {
        let block = self.table.block_size();
        let done = window.position();
        let table = self.table;

        // Without byte verification only indexed blocks can be trusted.
        let continuation = continuation
            .filter(|&offset| !self.options.accept_hash || table.contains(hash, offset));

        let mut best: Option<(u64, usize)> = None;
        let mut probes = 0usize;

        if let Some(offset) = continuation {
            if self.fits_autocode(offset, done) {
                probes += 1;
                let length = self.match_length(window, offset)?;
                if length >= block {
                    best = Some((offset, length));
                }
            }
        }

        for offset in table.candidates(hash) {
            if probes >= self.options.max_probes
                || best.is_some_and(|(_, length)| length >= LONGEST_POSSIBLE_MATCH)
            {
                break;
            }
            if Some(offset) == continuation {
                continue;
            }
            // Chains are in block order, so every later candidate fails too.
            if !self.fits_autocode(offset, done) {
                break;
            }
            probes += 1;
            let length = self.match_length(window, offset)?;
            if length >= block && best.is_none_or(|(_, longest)| length > longest) {
                best = Some((offset, length));
            }
        }

        Ok(best)
    }

    #[inline]
    fn fits_autocode(&self, offset: u64, done: u64) -> bool {
        !self.options.autocode || self.source_offset + offset < done + self.target_offset
    }

    fn match_length<R: Read>(&mut self, window: &mut TargetWindow<R>, offset: u64) -> Result<usize> {
        if self.options.accept_hash {
            Ok(self.table.block_size())
        } else {
            self.longest_match(window, offset)
        }
    }

    /// Compares source bytes from `offset` with target bytes from the cursor.
    fn longest_match<R: Read>(&mut self, window: &mut TargetWindow<R>, offset: u64) -> Result<usize> {
        let block = self.table.block_size();
        let mut matched = 0usize;

        while matched < LONGEST_POSSIBLE_MATCH {
            let step = matched.max(block).min(MATCH_CHUNK);
            let want = (matched + step).min(LONGEST_POSSIBLE_MATCH);
            let available = window.fill(want)?.min(want);
            if available <= matched {
                break;
            }

            let span = available - matched;
            let n = read_some(self.source, offset + matched as u64, &mut self.buf[..span])?;
            if n == 0 {
                break;
            }

            let target = &window.window(matched + n)[matched..];
            let common = common_prefix(&self.buf[..n], target);
            matched += common;
            if common < n {
                break;
            }
        }

        Ok(matched)
    }
}

fn read_some<S: SeekableSource + ?Sized>(source: &mut S, pos: u64, buf: &mut [u8]) -> Result<usize> {
    loop {
        match source.read_at(pos, buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        }
    }
}

#[inline]
fn load8(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(word)
}

/// Length of the common prefix of two byte slices.
fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    let max_len = a.len().min(b.len());
    let mut len = 0;

    #[cfg(feature = "simd")]
    {
        use wide::u8x16;

        // 16 bytes at a time with SIMD
        while len + 16 <= max_len {
            let mut a_lanes = [0u8; 16];
            let mut b_lanes = [0u8; 16];
            a_lanes.copy_from_slice(&a[len..len + 16]);
            b_lanes.copy_from_slice(&b[len..len + 16]);
            if u8x16::new(a_lanes) != u8x16::new(b_lanes) {
                break;
            }
            len += 16;
        }
    }

    while len + 8 <= max_len {
        if load8(&a[len..]) != load8(&b[len..]) {
            break;
        }
        len += 8;
    }

    while len < max_len && a[len] == b[len] {
        len += 1;
    }

    len
}
