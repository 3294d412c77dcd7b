//! GDIFF wire format: preamble, opcodes and record encoding.
//!
//! A stream starts with `d1 ff d1 ff` and a version byte (`04` normal,
//! `05` differential). Each record starts with one opcode byte:
//!
//! | opcode | meaning |
//! |---|---|
//! | `00` | end of stream |
//! | `01..=data_max` | literal run of that many bytes |
//! | `f7` | literal run, `u16` length |
//! | `f8` | literal run, `i32` length |
//! | `f4..=f6` | copy, 8-bit offset, 8/16/32-bit length (differential only) |
//! | `f9..=fb` | copy, 16-bit offset, 8/16/32-bit length |
//! | `fc..=fe` | copy, 32-bit offset, 8/16/32-bit length |
//! | `ff` | copy, 64-bit offset, 32-bit length |
//!
//! `data_max` is 246 in normal mode and 243 in differential mode, where
//! `f4..=f6` are taken by the one-byte-offset copies. All integers are
//! big-endian. In differential mode every copy offset is a signed delta from
//! the previous copy's absolute offset.

use std::io::{self, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{DeltaError, Result};

/// Magic bytes opening every stream.
pub const MAGIC: [u8; 4] = [0xd1, 0xff, 0xd1, 0xff];
/// Version byte of a stream with absolute copy offsets.
pub const VERSION: u8 = 0x04;
/// Version byte of a stream with differential copy offsets.
pub const VERSION_DIFFERENTIAL: u8 = 0x05;
/// Length of the preamble.
pub const HEADER_LEN: u64 = 5;

/// End of stream.
pub const EOF: u8 = 0;
/// Longest literal run encoded in the opcode, normal mode.
pub const DATA_MAX: u8 = 246;
/// Longest literal run encoded in the opcode, differential mode.
pub const DIFFERENTIAL_DATA_MAX: u8 = 243;
/// Literal run with a `u16` length.
pub const DATA_USHORT: u8 = 247;
/// Literal run with a 32-bit length.
pub const DATA_INT: u8 = 248;
/// Copy with 8-bit offset and 8-bit length.
pub const COPY_UBYTE_UBYTE: u8 = 244;
/// Copy with 8-bit offset and 16-bit length.
pub const COPY_UBYTE_USHORT: u8 = 245;
/// Copy with 8-bit offset and 32-bit length.
pub const COPY_UBYTE_INT: u8 = 246;
/// Copy with 16-bit offset and 8-bit length.
pub const COPY_USHORT_UBYTE: u8 = 249;
/// Copy with 16-bit offset and 16-bit length.
pub const COPY_USHORT_USHORT: u8 = 250;
/// Copy with 16-bit offset and 32-bit length.
pub const COPY_USHORT_INT: u8 = 251;
/// Copy with 32-bit offset and 8-bit length.
pub const COPY_INT_UBYTE: u8 = 252;
/// Copy with 32-bit offset and 16-bit length.
pub const COPY_INT_USHORT: u8 = 253;
/// Copy with 32-bit offset and 32-bit length.
pub const COPY_INT_INT: u8 = 254;
/// Copy with 64-bit offset and 32-bit length.
pub const COPY_LONG_INT: u8 = 255;

/// Offset encoding of a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Copy offsets are absolute and unsigned.
    #[default]
    Normal,
    /// Copy offsets are signed deltas from the previous copy.
    Differential,
}

impl Mode {
    /// Returns the version byte written after the magic.
    pub fn flag(self) -> u8 {
        match self {
            Mode::Normal => VERSION,
            Mode::Differential => VERSION_DIFFERENTIAL,
        }
    }

    /// Parses a version byte.
    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            VERSION => Some(Mode::Normal),
            VERSION_DIFFERENTIAL => Some(Mode::Differential),
            _ => None,
        }
    }

    /// Largest literal length encoded in the opcode byte itself.
    #[inline]
    pub fn data_max(self) -> u8 {
        match self {
            Mode::Normal => DATA_MAX,
            Mode::Differential => DIFFERENTIAL_DATA_MAX,
        }
    }
}

/// Writes the preamble.
pub fn write_header<W: Write + ?Sized>(writer: &mut W, mode: Mode) -> io::Result<()> {
    writer.write_all(&MAGIC)?;
    writer.write_u8(mode.flag())
}

/// Reads and validates the preamble.
pub fn read_header<R: Read + ?Sized>(reader: &mut R) -> Result<Mode> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header).map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            DeltaError::InvalidMagic
        } else {
            DeltaError::Io(err)
        }
    })?;
    if header[..4] != MAGIC {
        return Err(DeltaError::InvalidMagic);
    }
    Mode::from_flag(header[4]).ok_or(DeltaError::InvalidMagic)
}

/// Width of a copy's offset field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetWidth {
    /// `i8`, differential mode only.
    Byte,
    /// 16 bits.
    Short,
    /// 32 bits.
    Int,
    /// `i64`.
    Long,
}

impl OffsetWidth {
    /// Narrowest width for an offset field holding `value`.
    pub fn select(value: i64, mode: Mode) -> Self {
        let magnitude = value.unsigned_abs();
        if magnitude > i32::MAX as u64 {
            OffsetWidth::Long
        } else if mode == Mode::Differential && magnitude < 128 {
            OffsetWidth::Byte
        } else if magnitude < 32768 {
            OffsetWidth::Short
        } else {
            OffsetWidth::Int
        }
    }

    fn bytes(self) -> usize {
        match self {
            OffsetWidth::Byte => 1,
            OffsetWidth::Short => 2,
            OffsetWidth::Int => 4,
            OffsetWidth::Long => 8,
        }
    }
}

/// Width of a copy's length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthWidth {
    /// `u8`.
    Byte,
    /// `u16`.
    Short,
    /// 32 bits.
    Int,
}

impl LengthWidth {
    /// Narrowest width for a copy length.
    pub fn select(length: u32) -> Self {
        if length < 256 {
            LengthWidth::Byte
        } else if length > 32767 {
            LengthWidth::Int
        } else {
            LengthWidth::Short
        }
    }

    fn bytes(self) -> usize {
        match self {
            LengthWidth::Byte => 1,
            LengthWidth::Short => 2,
            LengthWidth::Int => 4,
        }
    }
}

/// Returns the opcode for a copy whose offset field holds `value`.
pub fn copy_opcode(value: i64, length: u32, mode: Mode) -> u8 {
    let base = match OffsetWidth::select(value, mode) {
        OffsetWidth::Long => return COPY_LONG_INT,
        OffsetWidth::Byte => COPY_UBYTE_UBYTE,
        OffsetWidth::Short => COPY_USHORT_UBYTE,
        OffsetWidth::Int => COPY_INT_UBYTE,
    };
    match LengthWidth::select(length) {
        LengthWidth::Byte => base,
        LengthWidth::Short => base + 1,
        LengthWidth::Int => base + 2,
    }
}

/// Returns the opcode for a literal run, or `None` for an empty run.
pub fn literal_opcode(length: usize, mode: Mode) -> Option<u8> {
    if length == 0 {
        None
    } else if length <= mode.data_max() as usize {
        Some(length as u8)
    } else if length <= u16::MAX as usize {
        Some(DATA_USHORT)
    } else {
        Some(DATA_INT)
    }
}

/// Writes a copy record and returns its encoded length.
///
/// `value` is the offset field as stored: absolute in normal mode, the
/// signed delta in differential mode.
pub fn write_copy<W: Write + ?Sized>(
    writer: &mut W,
    value: i64,
    length: u32,
    mode: Mode,
) -> io::Result<usize> {
    let opcode = copy_opcode(value, length, mode);
    writer.write_u8(opcode)?;

    let offset_width = OffsetWidth::select(value, mode);
    match offset_width {
        OffsetWidth::Byte => writer.write_i8(value as i8)?,
        OffsetWidth::Short => writer.write_i16::<BigEndian>(value as i16)?,
        OffsetWidth::Int => writer.write_i32::<BigEndian>(value as i32)?,
        OffsetWidth::Long => writer.write_i64::<BigEndian>(value)?,
    }

    // The long form always carries a 32-bit length.
    let length_width = if offset_width == OffsetWidth::Long {
        LengthWidth::Int
    } else {
        LengthWidth::select(length)
    };
    match length_width {
        LengthWidth::Byte => writer.write_u8(length as u8)?,
        LengthWidth::Short => writer.write_u16::<BigEndian>(length as u16)?,
        LengthWidth::Int => writer.write_u32::<BigEndian>(length)?,
    }

    Ok(1 + offset_width.bytes() + length_width.bytes())
}

/// Writes the opcode and length prefix of a literal run.
///
/// Returns the prefix length; zero for an empty run, which writes nothing.
pub fn write_literal_header<W: Write + ?Sized>(
    writer: &mut W,
    length: usize,
    mode: Mode,
) -> io::Result<usize> {
    match literal_opcode(length, mode) {
        None => Ok(0),
        Some(DATA_USHORT) => {
            writer.write_u8(DATA_USHORT)?;
            writer.write_u16::<BigEndian>(length as u16)?;
            Ok(3)
        }
        Some(DATA_INT) => {
            writer.write_u8(DATA_INT)?;
            writer.write_u32::<BigEndian>(length as u32)?;
            Ok(5)
        }
        Some(opcode) => {
            writer.write_u8(opcode)?;
            Ok(1)
        }
    }
}

/// One decoded record, without the literal payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Record {
    /// End of stream.
    Eof,
    /// A literal run of `length` bytes follows the record header.
    Literal {
        /// Payload length.
        length: u32,
    },
    /// Copy `length` bytes; `value` is the offset field as stored.
    Copy {
        /// Offset field, absolute or differential depending on the mode.
        value: i64,
        /// Number of bytes to copy.
        length: u32,
    },
}

impl Record {
    /// Number of output bytes this record produces.
    #[inline]
    pub fn output_len(&self) -> u64 {
        match *self {
            Record::Eof => 0,
            Record::Literal { length } | Record::Copy { length, .. } => u64::from(length),
        }
    }
}

/// Reads one record header.
///
/// Returns the record and the number of header bytes consumed; a literal's
/// payload is left in the reader. `position` is the wire offset of the
/// opcode, used in error reports.
pub fn read_record<R: Read + ?Sized>(
    reader: &mut R,
    mode: Mode,
    position: u64,
) -> Result<(Record, usize)> {
    read_record_inner(reader, mode).map_err(|err| match err {
        RecordError::Wire(err) => DeltaError::from_wire(err),
        RecordError::Unknown(opcode) => DeltaError::UnknownOpcode { opcode, position },
    })
}

enum RecordError {
    Wire(io::Error),
    Unknown(u8),
}

impl From<io::Error> for RecordError {
    fn from(err: io::Error) -> Self {
        RecordError::Wire(err)
    }
}

fn read_record_inner<R: Read + ?Sized>(
    reader: &mut R,
    mode: Mode,
) -> std::result::Result<(Record, usize), RecordError> {
    let opcode = reader.read_u8()?;
    let differential = mode == Mode::Differential;

    let (offset_width, length_width) = match opcode {
        EOF => return Ok((Record::Eof, 1)),
        op if op <= mode.data_max() => {
            return Ok((
                Record::Literal {
                    length: u32::from(op),
                },
                1,
            ));
        }
        DATA_USHORT => {
            let length = u32::from(reader.read_u16::<BigEndian>()?);
            return Ok((Record::Literal { length }, 3));
        }
        DATA_INT => {
            let length = reader.read_u32::<BigEndian>()?;
            return Ok((Record::Literal { length }, 5));
        }
        COPY_UBYTE_UBYTE => (OffsetWidth::Byte, LengthWidth::Byte),
        COPY_UBYTE_USHORT => (OffsetWidth::Byte, LengthWidth::Short),
        COPY_UBYTE_INT => (OffsetWidth::Byte, LengthWidth::Int),
        COPY_USHORT_UBYTE => (OffsetWidth::Short, LengthWidth::Byte),
        COPY_USHORT_USHORT => (OffsetWidth::Short, LengthWidth::Short),
        COPY_USHORT_INT => (OffsetWidth::Short, LengthWidth::Int),
        COPY_INT_UBYTE => (OffsetWidth::Int, LengthWidth::Byte),
        COPY_INT_USHORT => (OffsetWidth::Int, LengthWidth::Short),
        COPY_INT_INT => (OffsetWidth::Int, LengthWidth::Int),
        COPY_LONG_INT => (OffsetWidth::Long, LengthWidth::Int),
        other => return Err(RecordError::Unknown(other)),
    };

    let value = match (offset_width, differential) {
        (OffsetWidth::Byte, true) => i64::from(reader.read_i8()?),
        (OffsetWidth::Byte, false) => i64::from(reader.read_u8()?),
        (OffsetWidth::Short, true) => i64::from(reader.read_i16::<BigEndian>()?),
        (OffsetWidth::Short, false) => i64::from(reader.read_u16::<BigEndian>()?),
        (OffsetWidth::Int, true) => i64::from(reader.read_i32::<BigEndian>()?),
        (OffsetWidth::Int, false) => i64::from(reader.read_u32::<BigEndian>()?),
        (OffsetWidth::Long, _) => reader.read_i64::<BigEndian>()?,
    };
    let length = match length_width {
        LengthWidth::Byte => u32::from(reader.read_u8()?),
        LengthWidth::Short => u32::from(reader.read_u16::<BigEndian>()?),
        LengthWidth::Int => reader.read_u32::<BigEndian>()?,
    };

    Ok((
        Record::Copy { value, length },
        1 + offset_width.bytes() + length_width.bytes(),
    ))
}

/// Tracks the previous copy offset for differential encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OffsetState {
    mode: Mode,
    current: u64,
}

impl OffsetState {
    /// Starts at delta base 0.
    pub fn new(mode: Mode) -> Self {
        Self::with_base(mode, 0)
    }

    /// Resumes from a known delta base.
    pub fn with_base(mode: Mode, current: u64) -> Self {
        Self { mode, current }
    }

    /// Returns the stream mode.
    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns the absolute offset of the previous copy.
    #[inline]
    pub fn current(&self) -> u64 {
        self.current
    }

    /// Turns an absolute offset into the value stored on the wire.
    pub fn encode(&mut self, absolute: u64) -> i64 {
        match self.mode {
            Mode::Normal => absolute as i64,
            Mode::Differential => {
                let value = absolute.wrapping_sub(self.current) as i64;
                self.current = absolute;
                value
            }
        }
    }

    /// Turns a stored offset value back into an absolute offset.
    pub fn decode(&mut self, value: i64) -> Result<u64> {
        match self.mode {
            Mode::Normal => u64::try_from(value).map_err(|_| DeltaError::InvalidOffset {
                base: 0,
                delta: value,
            }),
            Mode::Differential => {
                let absolute = self.current.checked_add_signed(value).ok_or(
                    DeltaError::InvalidOffset {
                        base: self.current,
                        delta: value,
                    },
                )?;
                self.current = absolute;
                Ok(absolute)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header() {
        let mut bytes = Vec::new();
        write_header(&mut bytes, Mode::Differential).unwrap();
        assert_eq!(bytes, [0xd1, 0xff, 0xd1, 0xff, 0x05]);
        assert_eq!(read_header(&mut &bytes[..]).unwrap(), Mode::Differential);

        assert!(matches!(
            read_header(&mut &[0xd1, 0xff, 0xd1, 0xff, 0x06][..]),
            Err(DeltaError::InvalidMagic)
        ));
        assert!(matches!(
            read_header(&mut &[0xd1, 0xff, 0xd1][..]),
            Err(DeltaError::InvalidMagic)
        ));
        assert!(matches!(
            read_header(&mut &b"GDIFF"[..]),
            Err(DeltaError::InvalidMagic)
        ));
    }

    #[test]
    fn test_literal_opcode_boundaries() {
        assert_eq!(literal_opcode(0, Mode::Normal), None);
        assert_eq!(literal_opcode(1, Mode::Normal), Some(1));
        assert_eq!(literal_opcode(246, Mode::Normal), Some(246));
        assert_eq!(literal_opcode(247, Mode::Normal), Some(DATA_USHORT));
        assert_eq!(literal_opcode(65535, Mode::Normal), Some(DATA_USHORT));
        assert_eq!(literal_opcode(65536, Mode::Normal), Some(DATA_INT));

        assert_eq!(literal_opcode(243, Mode::Differential), Some(243));
        assert_eq!(literal_opcode(244, Mode::Differential), Some(DATA_USHORT));
        assert_eq!(literal_opcode(246, Mode::Differential), Some(DATA_USHORT));
    }

    #[test]
    fn test_copy_opcode_normal_mode() {
        let m = Mode::Normal;
        assert_eq!(copy_opcode(0, 0, m), COPY_USHORT_UBYTE);
        assert_eq!(copy_opcode(127, 255, m), COPY_USHORT_UBYTE);
        assert_eq!(copy_opcode(32767, 256, m), COPY_USHORT_USHORT);
        assert_eq!(copy_opcode(32767, 32767, m), COPY_USHORT_USHORT);
        assert_eq!(copy_opcode(32768, 32768, m), COPY_INT_INT);
        assert_eq!(copy_opcode(32768, 0, m), COPY_INT_UBYTE);
        assert_eq!(copy_opcode(i32::MAX as i64, 300, m), COPY_INT_USHORT);
        assert_eq!(copy_opcode(i32::MAX as i64 + 1, 1, m), COPY_LONG_INT);
    }

    #[test]
    fn test_copy_opcode_differential_mode() {
        let m = Mode::Differential;
        assert_eq!(copy_opcode(0, 0, m), COPY_UBYTE_UBYTE);
        assert_eq!(copy_opcode(127, 255, m), COPY_UBYTE_UBYTE);
        assert_eq!(copy_opcode(-127, 256, m), COPY_UBYTE_USHORT);
        assert_eq!(copy_opcode(127, 32768, m), COPY_UBYTE_INT);
        assert_eq!(copy_opcode(128, 10, m), COPY_USHORT_UBYTE);
        assert_eq!(copy_opcode(-128, 10, m), COPY_USHORT_UBYTE);
        assert_eq!(copy_opcode(32767, 32767, m), COPY_USHORT_USHORT);
        assert_eq!(copy_opcode(-32768, 32767, m), COPY_INT_USHORT);
        assert_eq!(copy_opcode(32768, 32768, m), COPY_INT_INT);
        assert_eq!(copy_opcode(i32::MAX as i64, 0, m), COPY_INT_UBYTE);
        assert_eq!(copy_opcode(-(i32::MAX as i64) - 1, 0, m), COPY_LONG_INT);
    }

    #[test]
    fn test_write_copy_layout() {
        let mut bytes = Vec::new();
        let n = write_copy(&mut bytes, 1000, 300, Mode::Normal).unwrap();
        assert_eq!(n, 5);
        assert_eq!(bytes, [COPY_USHORT_USHORT, 0x03, 0xe8, 0x01, 0x2c]);

        bytes.clear();
        let n = write_copy(&mut bytes, -2, 16, Mode::Differential).unwrap();
        assert_eq!(n, 3);
        assert_eq!(bytes, [COPY_UBYTE_UBYTE, 0xfe, 16]);

        bytes.clear();
        let n = write_copy(&mut bytes, 1 << 40, 5, Mode::Normal).unwrap();
        assert_eq!(n, 13);
        assert_eq!(bytes[0], COPY_LONG_INT);
        assert_eq!(&bytes[9..], &[0, 0, 0, 5]);
    }

    #[test]
    fn test_read_record_decodes_each_family() {
        let mut bytes = Vec::new();
        write_literal_header(&mut bytes, 3, Mode::Normal).unwrap();
        bytes.extend_from_slice(b"abc");
        write_literal_header(&mut bytes, 1000, Mode::Normal).unwrap();
        write_copy(&mut bytes, 70_000, 40_000, Mode::Normal).unwrap();
        bytes.push(EOF);

        let mut reader = &bytes[..];
        assert_eq!(
            read_record(&mut reader, Mode::Normal, 0).unwrap(),
            (Record::Literal { length: 3 }, 1)
        );
        reader = &reader[3..];
        assert_eq!(
            read_record(&mut reader, Mode::Normal, 4).unwrap(),
            (Record::Literal { length: 1000 }, 3)
        );
        assert_eq!(
            read_record(&mut reader, Mode::Normal, 7).unwrap(),
            (
                Record::Copy {
                    value: 70_000,
                    length: 40_000
                },
                9
            )
        );
        assert_eq!(
            read_record(&mut reader, Mode::Normal, 16).unwrap(),
            (Record::Eof, 1)
        );
        assert!(matches!(
            read_record(&mut reader, Mode::Normal, 17),
            Err(DeltaError::UnexpectedEndOfData)
        ));
    }

    #[test]
    fn test_ubyte_opcodes_depend_on_mode() {
        let bytes = [COPY_UBYTE_UBYTE, 0xff, 20];
        assert_eq!(
            read_record(&mut &bytes[..], Mode::Differential, 0).unwrap(),
            (
                Record::Copy {
                    value: -1,
                    length: 20
                },
                3
            )
        );
        assert_eq!(
            read_record(&mut &bytes[..], Mode::Normal, 0).unwrap(),
            (Record::Literal { length: 244 }, 1)
        );
    }

    #[test]
    fn test_truncated_copy_is_end_of_data() {
        let bytes = [COPY_INT_INT, 0, 0];
        assert!(matches!(
            read_record(&mut &bytes[..], Mode::Normal, 0),
            Err(DeltaError::UnexpectedEndOfData)
        ));
    }

    #[test]
    fn test_offset_state() {
        let mut writer = OffsetState::new(Mode::Differential);
        let mut reader = OffsetState::new(Mode::Differential);
        for absolute in [100u64, 40, 40, 1 << 33, 7] {
            let value = writer.encode(absolute);
            assert_eq!(reader.decode(value).unwrap(), absolute);
        }
        assert_eq!(writer.encode(10), 3);

        let mut reader = OffsetState::new(Mode::Differential);
        assert!(matches!(
            reader.decode(-1),
            Err(DeltaError::InvalidOffset { base: 0, delta: -1 })
        ));

        let mut normal = OffsetState::new(Mode::Normal);
        assert_eq!(normal.encode(55), 55);
        assert_eq!(normal.decode(55).unwrap(), 55);
        assert_eq!(normal.current(), 0);
    }
}
