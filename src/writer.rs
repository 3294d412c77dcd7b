//! GDIFF stream writer.

use std::io::Write;

use crate::error::{DeltaError, Result};
use crate::opcode::{self, Mode, OffsetState, OffsetWidth};
use crate::sink::InstructionSink;

/// Largest literal run buffered before it is written out.
pub const LITERAL_CHUNK: usize = i16::MAX as usize;

/// Settings for lossy zero-run substitution.
///
/// When most of the recent output came from copies, literal runs of at least
/// `min_block` bytes are written as zeros. The consumer must be able to
/// restore those bytes by other means.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZeroRunOptions {
    /// Shortest literal run that is substituted.
    pub min_block: usize,
    /// Copy ratio of the trailing window at or above which runs are substituted.
    pub ratio: f64,
    /// Length of the trailing window, in output bytes.
    pub window: u64,
}

impl Default for ZeroRunOptions {
    fn default() -> Self {
        Self {
            min_block: 10,
            ratio: 0.9,
            window: 1024 * 1024,
        }
    }
}

/// Writer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WriterOptions {
    /// Encode copy offsets as deltas from the previous copy.
    pub differential: bool,
    /// Do not write the preamble.
    pub skip_header: bool,
    /// Do not write the EOF marker on close.
    pub skip_eof: bool,
    /// Enables zero-run substitution.
    pub zero_runs: Option<ZeroRunOptions>,
}

impl WriterOptions {
    /// Returns the default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets differential offset encoding.
    #[must_use]
    pub fn differential(mut self, differential: bool) -> Self {
        self.differential = differential;
        self
    }

    /// Sets whether the preamble is skipped.
    #[must_use]
    pub fn skip_header(mut self, skip: bool) -> Self {
        self.skip_header = skip;
        self
    }

    /// Sets whether the EOF marker is skipped.
    #[must_use]
    pub fn skip_eof(mut self, skip: bool) -> Self {
        self.skip_eof = skip;
        self
    }

    /// Enables zero-run substitution.
    #[must_use]
    pub fn zero_runs(mut self, zero_runs: ZeroRunOptions) -> Self {
        self.zero_runs = Some(zero_runs);
        self
    }

    /// Returns the stream mode these options produce.
    pub fn mode(&self) -> Mode {
        if self.differential {
            Mode::Differential
        } else {
            Mode::Normal
        }
    }
}

/// Counters kept by [`GDiffWriter`].
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WriterStats {
    /// Bytes written to the output, preamble included.
    pub written: u64,
    /// Length of the target the stream reconstructs.
    pub total_length: u64,
    /// Fraction of the trailing window that came from copies.
    pub win_ratio: f64,
    /// Copies with a one-byte offset field.
    pub byte_copies: u64,
    /// Copies with a two-byte offset field.
    pub short_copies: u64,
    /// Copies with a four-byte offset field.
    pub int_copies: u64,
    /// Copies with an eight-byte offset field.
    pub long_copies: u64,
}

/// An [`InstructionSink`] that serializes to the GDIFF wire format.
///
/// Literal bytes are buffered and written as one record when a copy arrives,
/// when [`LITERAL_CHUNK`] bytes have accumulated, or on flush.
///
/// # Examples
///
/// ```
/// use gdiff::{GDiffWriter, InstructionSink};
///
/// let mut writer = GDiffWriter::new(Vec::new()).unwrap();
/// writer.add_copy(0, 100).unwrap();
/// writer.add_literal(b"new").unwrap();
/// writer.close().unwrap();
///
/// let bytes = writer.into_inner();
/// assert_eq!(&bytes[..5], &[0xd1, 0xff, 0xd1, 0xff, 0x04]);
/// assert_eq!(bytes.last(), Some(&0));
/// ```
pub struct GDiffWriter<W: Write> {
    output: W,
    options: WriterOptions,
    offsets: OffsetState,
    pending: Vec<u8>,
    stats: WriterStats,
    closed: bool,
}

impl<W: Write> GDiffWriter<W> {
    /// Creates a writer with default options and writes the preamble.
    pub fn new(output: W) -> Result<Self> {
        Self::with_options(output, WriterOptions::default())
    }

    /// Creates a writer and writes the preamble unless `skip_header` is set.
    pub fn with_options(mut output: W, options: WriterOptions) -> Result<Self> {
        if let Some(zero_runs) = options.zero_runs {
            if zero_runs.window == 0 || !(0.0..=1.0).contains(&zero_runs.ratio) {
                return Err(DeltaError::InvalidConfig(format!(
                    "zero-run window must be positive and ratio within 0..=1 (got {} and {})",
                    zero_runs.window, zero_runs.ratio
                )));
            }
        }

        let mode = options.mode();
        let mut stats = WriterStats::default();
        if !options.skip_header {
            opcode::write_header(&mut output, mode)?;
            stats.written = opcode::HEADER_LEN;
        }

        Ok(Self {
            output,
            options,
            offsets: OffsetState::new(mode),
            pending: Vec::new(),
            stats,
            closed: false,
        })
    }

    /// Returns the stream mode.
    pub fn mode(&self) -> Mode {
        self.offsets.mode()
    }

    /// Returns the writer counters.
    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Bytes written to the output so far.
    pub fn written(&self) -> u64 {
        self.stats.written
    }

    /// Returns a reference to the output.
    pub fn get_ref(&self) -> &W {
        &self.output
    }

    /// Consumes the writer and returns the output.
    ///
    /// Pending literal bytes are lost unless the writer was flushed or closed.
    pub fn into_inner(self) -> W {
        self.output
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(DeltaError::SinkClosed);
        }
        Ok(())
    }

    fn decay_ratio(&mut self, bytes: usize) {
        let window = self.ratio_window() as f64;
        self.stats.win_ratio *= ((window - 1.0) / window).powf(bytes as f64);
    }

    fn ratio_window(&self) -> u64 {
        self.options
            .zero_runs
            .map_or(ZeroRunOptions::default().window, |z| z.window)
    }

    fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }

        if let Some(zero_runs) = self.options.zero_runs {
            if self.pending.len() >= zero_runs.min_block && self.stats.win_ratio >= zero_runs.ratio
            {
                tracing::trace!(
                    len = self.pending.len(),
                    ratio = self.stats.win_ratio,
                    "writer: zeroing literal run"
                );
                self.pending.fill(0);
            }
        }

        let mode = self.mode();
        let header = opcode::write_literal_header(&mut self.output, self.pending.len(), mode)?;
        self.output.write_all(&self.pending)?;
        self.stats.written += (header + self.pending.len()) as u64;
        self.pending.clear();
        Ok(())
    }
}

impl<W: Write> std::fmt::Debug for GDiffWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GDiffWriter")
            .field("options", &self.options)
            .field("pending", &self.pending.len())
            .field("stats", &self.stats)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<W: Write> InstructionSink for GDiffWriter<W> {
    fn add_copy(&mut self, offset: u64, length: u32) -> Result<()> {
        self.ensure_open()?;
        self.write_pending()?;
        if length == 0 {
            return Ok(());
        }

        let window = self.ratio_window();
        let len = u64::from(length);
        self.stats.win_ratio = (self.stats.win_ratio * (window - window.min(len)) as f64
            + len as f64)
            / window as f64;
        self.stats.win_ratio = self.stats.win_ratio.min(1.0);

        let value = self.offsets.encode(offset);
        match OffsetWidth::select(value, self.mode()) {
            OffsetWidth::Byte => self.stats.byte_copies += 1,
            OffsetWidth::Short => self.stats.short_copies += 1,
            OffsetWidth::Int => self.stats.int_copies += 1,
            OffsetWidth::Long => self.stats.long_copies += 1,
        }
        let mode = self.mode();
        let written = opcode::write_copy(&mut self.output, value, length, mode)?;
        self.stats.written += written as u64;
        self.stats.total_length += len;
        Ok(())
    }

    fn add_data(&mut self, byte: u8) -> Result<()> {
        self.ensure_open()?;
        self.decay_ratio(1);
        self.pending.push(byte);
        self.stats.total_length += 1;
        if self.pending.len() >= LITERAL_CHUNK {
            self.write_pending()?;
        }
        Ok(())
    }

    fn add_literal(&mut self, mut bytes: &[u8]) -> Result<()> {
        self.ensure_open()?;
        while !bytes.is_empty() {
            let take = bytes.len().min(LITERAL_CHUNK - self.pending.len());
            self.decay_ratio(take);
            self.pending.extend_from_slice(&bytes[..take]);
            self.stats.total_length += take as u64;
            bytes = &bytes[take..];
            if self.pending.len() >= LITERAL_CHUNK {
                self.write_pending()?;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.write_pending()?;
        self.output.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.write_pending()?;
        if !self.options.skip_eof {
            self.output.write_all(&[opcode::EOF])?;
            self.stats.written += 1;
        }
        self.output.flush()?;
        self.closed = true;
        tracing::debug!(
            written = self.stats.written,
            total_length = self.stats.total_length,
            "writer: closed"
        );
        Ok(())
    }
}
