//! Instruction streams and their destinations.

use std::io::Write;

use crate::error::Result;

/// One delta instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Copy `length` bytes starting at `offset` in the source.
    Copy {
        /// Absolute source offset.
        offset: u64,
        /// Number of bytes.
        length: u32,
    },
    /// Append these bytes verbatim.
    Literal(Vec<u8>),
}

impl Instruction {
    /// Number of output bytes this instruction produces.
    pub fn len(&self) -> u64 {
        match self {
            Instruction::Copy { length, .. } => u64::from(*length),
            Instruction::Literal(bytes) => bytes.len() as u64,
        }
    }

    /// Returns true if the instruction produces no output.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Destination for a stream of copy and literal instructions.
///
/// The match engine, the converter and the merger only talk to this trait.
/// A sink is finished with [`close`](Self::close); a sink that is only
/// [`flush`](Self::flush)ed may receive further instructions.
pub trait InstructionSink {
    /// Appends a copy of `length` bytes from source `offset`.
    fn add_copy(&mut self, offset: u64, length: u32) -> Result<()>;

    /// Appends one literal byte.
    fn add_data(&mut self, byte: u8) -> Result<()>;

    /// Appends a run of literal bytes.
    fn add_literal(&mut self, bytes: &[u8]) -> Result<()> {
        for &byte in bytes {
            self.add_data(byte)?;
        }
        Ok(())
    }

    /// Pushes buffered instructions downstream.
    fn flush(&mut self) -> Result<()>;

    /// Flushes and terminates the stream.
    fn close(&mut self) -> Result<()>;
}

impl<K: InstructionSink + ?Sized> InstructionSink for &mut K {
    fn add_copy(&mut self, offset: u64, length: u32) -> Result<()> {
        (**self).add_copy(offset, length)
    }

    fn add_data(&mut self, byte: u8) -> Result<()> {
        (**self).add_data(byte)
    }

    fn add_literal(&mut self, bytes: &[u8]) -> Result<()> {
        (**self).add_literal(bytes)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }
}

/// Collects instructions in memory, merging adjacent literal bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstructionCollector {
    instructions: Vec<Instruction>,
    closed: bool,
}

impl InstructionCollector {
    /// Creates an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the collected instructions.
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Consumes the collector and returns the instructions.
    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }

    /// Returns true once [`close`](InstructionSink::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Total output length described by the collected instructions.
    pub fn output_len(&self) -> u64 {
        self.instructions.iter().map(Instruction::len).sum()
    }
}

impl InstructionSink for InstructionCollector {
    fn add_copy(&mut self, offset: u64, length: u32) -> Result<()> {
        self.instructions.push(Instruction::Copy { offset, length });
        Ok(())
    }

    fn add_data(&mut self, byte: u8) -> Result<()> {
        self.add_literal(&[byte])
    }

    fn add_literal(&mut self, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        match self.instructions.last_mut() {
            Some(Instruction::Literal(run)) => run.extend_from_slice(bytes),
            _ => self.instructions.push(Instruction::Literal(bytes.to_vec())),
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Renders instructions as text, one line per instruction.
///
/// Copies print as `COPY offset, length`. Literal runs print as
/// `DATA length` followed by a line with printable ASCII as-is and every
/// other byte as two hex digits.
pub struct DebugWriter<W: Write> {
    output: W,
    pending: Vec<u8>,
}

impl<W: Write> DebugWriter<W> {
    /// Creates a writer rendering into `output`.
    pub fn new(output: W) -> Self {
        Self {
            output,
            pending: Vec::new(),
        }
    }

    /// Consumes the writer and returns the output.
    pub fn into_inner(self) -> W {
        self.output
    }

    fn write_pending(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        writeln!(self.output, "DATA {}", self.pending.len())?;
        let mut line = String::with_capacity(self.pending.len() * 2);
        for &byte in &self.pending {
            if byte.is_ascii_graphic() || byte == b' ' {
                line.push(byte as char);
            } else {
                line.push_str(&format!("{byte:02x}"));
            }
        }
        writeln!(self.output, "{line}")?;
        self.pending.clear();
        Ok(())
    }
}

impl<W: Write> InstructionSink for DebugWriter<W> {
    fn add_copy(&mut self, offset: u64, length: u32) -> Result<()> {
        self.write_pending()?;
        writeln!(self.output, "COPY {offset}, {length}")?;
        Ok(())
    }

    fn add_data(&mut self, byte: u8) -> Result<()> {
        self.pending.push(byte);
        Ok(())
    }

    fn add_literal(&mut self, bytes: &[u8]) -> Result<()> {
        self.pending.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.write_pending()?;
        self.output.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collector_merges_literals() {
        let mut sink = InstructionCollector::new();
        sink.add_data(b'a').unwrap();
        sink.add_literal(b"bc").unwrap();
        sink.add_copy(10, 20).unwrap();
        sink.add_literal(b"").unwrap();
        sink.add_data(b'd').unwrap();
        sink.close().unwrap();

        assert!(sink.is_closed());
        assert_eq!(sink.output_len(), 24);
        assert_eq!(
            sink.into_instructions(),
            vec![
                Instruction::Literal(b"abc".to_vec()),
                Instruction::Copy {
                    offset: 10,
                    length: 20
                },
                Instruction::Literal(b"d".to_vec()),
            ]
        );
    }

    #[test]
    fn test_debug_writer_output() {
        let mut sink = DebugWriter::new(Vec::new());
        sink.add_copy(0, 1000).unwrap();
        sink.add_literal(b"HI \n").unwrap();
        sink.close().unwrap();

        let text = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(text, "COPY 0, 1000\nDATA 4\nHI 0a\n");
    }

    #[test]
    fn test_sink_through_mutable_reference() {
        fn emit<K: InstructionSink>(mut sink: K) {
            sink.add_copy(1, 2).unwrap();
            sink.close().unwrap();
        }

        let mut collector = InstructionCollector::new();
        emit(&mut collector);
        assert!(collector.is_closed());
        assert_eq!(collector.instructions().len(), 1);
    }
}
