//! Stream cursor: bounded, non-owning views into one shared backing buffer.
//!
//! A [`Stream`] is `(buffer, start, end, pos)`. Sub-streams created with
//! [`Stream::substream`] or [`Stream::slice`] share the same `Rc<[u8]>`; the only
//! freshly allocated buffers are transform outputs ([`Stream::derived`]).
//!
//! Integer reads follow the field's endianness; bit reads keep a small accumulator
//! that is discarded (byte-aligned) as soon as a byte-level read happens.

use crate::diag::ErrorKind;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;
use std::ops::Deref;
use std::rc::Rc;

/// Byte order for multi-byte integers, floats and bit fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// Location of a node or field inside a backing buffer.
///
/// `derived` is set when the buffer is a transform output rather than the document itself;
/// offsets are then relative to that output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ByteRange {
    pub offset: usize,
    pub len: usize,
    pub derived: bool,
}

impl ByteRange {
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// A read-only view of bytes in a shared buffer.
#[derive(Clone)]
pub struct Bytes {
    buf: Rc<[u8]>,
    start: usize,
    len: usize,
    derived: bool,
}

impl Bytes {
    pub fn from_vec(v: Vec<u8>) -> Self {
        let len = v.len();
        Bytes { buf: Rc::from(v), start: 0, len, derived: true }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    /// Absolute offset of the first byte in the backing buffer.
    pub fn offset(&self) -> usize {
        self.start
    }

    /// True when the bytes live outside the document buffer (transform output, literal).
    pub fn is_derived(&self) -> bool {
        self.derived
    }

    /// Stream over exactly these bytes, sharing the buffer.
    pub fn to_stream(&self) -> Stream {
        Stream {
            buf: self.buf.clone(),
            start: self.start,
            end: self.start + self.len,
            pos: self.start,
            bits: BitState::default(),
            derived: self.derived,
        }
    }
}

impl Deref for Bytes {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl PartialEq for Bytes {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl fmt::Debug for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bytes({})", hex(self.as_slice()))
    }
}

/// Lowercase hex, space separated; long inputs are elided after 32 bytes.
pub fn hex(b: &[u8]) -> String {
    let mut s = b
        .iter()
        .take(32)
        .map(|x| format!("{:02x}", x))
        .collect::<Vec<_>>()
        .join(" ");
    if b.len() > 32 {
        s.push_str(&format!(" .. ({} bytes)", b.len()));
    }
    s
}

/// Bit accumulator for `bN` fields.
#[derive(Clone, Copy, Debug, Default)]
struct BitState {
    bits: u128,
    left: u8,
    endian: Option<Endian>,
}

#[derive(Clone)]
pub struct Stream {
    buf: Rc<[u8]>,
    start: usize,
    end: usize,
    pos: usize,
    bits: BitState,
    derived: bool,
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("pos", &self.pos)
            .field("derived", &self.derived)
            .finish()
    }
}

impl Stream {
    /// Stream over a whole document buffer.
    pub fn new(data: impl Into<Rc<[u8]>>) -> Self {
        let buf: Rc<[u8]> = data.into();
        let end = buf.len();
        Stream { buf, start: 0, end, pos: 0, bits: BitState::default(), derived: false }
    }

    /// Stream over a freshly produced buffer (transform output).
    pub fn derived(data: Vec<u8>) -> Self {
        let mut s = Stream::new(data);
        s.derived = true;
        s
    }

    pub fn is_derived(&self) -> bool {
        self.derived
    }

    /// Size of this view in bytes.
    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Position relative to the start of this view.
    pub fn pos(&self) -> usize {
        self.pos - self.start
    }

    /// Position in the backing buffer.
    pub fn absolute_pos(&self) -> usize {
        self.pos
    }

    /// Offset of this view's first byte in the backing buffer.
    pub fn base(&self) -> usize {
        self.start
    }

    pub fn remaining(&self) -> usize {
        self.end - self.pos
    }

    pub fn is_eof(&self) -> bool {
        self.pos >= self.end && self.bits.left == 0
    }

    pub fn same_buffer(&self, other: &Stream) -> bool {
        Rc::ptr_eq(&self.buf, &other.buf)
    }

    /// Range `[from, to)` expressed as absolute offsets in the backing buffer.
    pub fn range(&self, from: usize, to: usize) -> ByteRange {
        ByteRange { offset: from, len: to.saturating_sub(from), derived: self.derived }
    }

    pub fn seek(&mut self, pos: usize) -> Result<(), ErrorKind> {
        if pos > self.size() {
            return Err(ErrorKind::OutOfBounds {
                offset: self.pos as u64,
                needed: pos as u64,
                available: self.size() as u64,
            });
        }
        self.align_to_byte();
        self.pos = self.start + pos;
        Ok(())
    }

    /// Skip `n` bytes (bounds checked).
    pub fn skip(&mut self, n: usize) -> Result<(), ErrorKind> {
        self.ensure(n)?;
        self.align_to_byte();
        self.pos += n;
        Ok(())
    }

    /// New view `[offset, offset + len)` relative to this view; does not move the cursor.
    pub fn slice(&self, offset: usize, len: usize) -> Result<Stream, ErrorKind> {
        let end = offset.checked_add(len).filter(|&e| e <= self.size()).ok_or(
            ErrorKind::OutOfBounds {
                offset: (self.start + offset.min(self.size())) as u64,
                needed: len as u64,
                available: self.size().saturating_sub(offset) as u64,
            },
        )?;
        Ok(Stream {
            buf: self.buf.clone(),
            start: self.start + offset,
            end: self.start + end,
            pos: self.start + offset,
            bits: BitState::default(),
            derived: self.derived,
        })
    }

    /// Consume `n` bytes and return them as a bounded view.
    pub fn substream(&mut self, n: usize) -> Result<Stream, ErrorKind> {
        self.align_to_byte();
        let sub = self.slice(self.pos(), n)?;
        self.pos += n;
        Ok(sub)
    }

    pub fn align_to_byte(&mut self) {
        self.bits = BitState::default();
    }

    fn ensure(&self, n: usize) -> Result<(), ErrorKind> {
        if n > self.remaining() {
            return Err(ErrorKind::OutOfBounds {
                offset: self.pos as u64,
                needed: n as u64,
                available: self.remaining() as u64,
            });
        }
        Ok(())
    }

    /// Read `n` bytes as a view; fails `OutOfBounds` without consuming anything on a short read.
    pub fn read_bytes(&mut self, n: usize) -> Result<Bytes, ErrorKind> {
        self.align_to_byte();
        self.ensure(n)?;
        let b = Bytes { buf: self.buf.clone(), start: self.pos, len: n, derived: self.derived };
        self.pos += n;
        Ok(b)
    }

    pub fn read_bytes_full(&mut self) -> Bytes {
        self.align_to_byte();
        let b = Bytes { buf: self.buf.clone(), start: self.pos, len: self.remaining(), derived: self.derived };
        self.pos = self.end;
        b
    }

    /// Read up to `term`. `include` keeps the terminator in the result, `consume` moves past it.
    /// Hitting the end of the view is an error only when `eos_error` is set.
    pub fn read_bytes_term(
        &mut self,
        term: u8,
        include: bool,
        consume: bool,
        eos_error: bool,
    ) -> Result<Bytes, ErrorKind> {
        self.align_to_byte();
        let hay = &self.buf[self.pos..self.end];
        match hay.iter().position(|&b| b == term) {
            Some(i) => {
                let len = if include { i + 1 } else { i };
                let b = Bytes { buf: self.buf.clone(), start: self.pos, len, derived: self.derived };
                self.pos += if consume { i + 1 } else { i };
                Ok(b)
            }
            None if eos_error => Err(ErrorKind::OutOfBounds {
                offset: self.end as u64,
                needed: 1,
                available: 0,
            }),
            None => Ok(self.read_bytes_full()),
        }
    }

    pub fn read_u8(&mut self) -> Result<u8, ErrorKind> {
        Ok(self.read_bytes(1)?[0])
    }

    /// Read an integer of width 1, 2, 4 or 8 bytes.
    pub fn read_int(&mut self, width: u8, signed: bool, endian: Endian) -> Result<i128, ErrorKind> {
        let b = self.read_bytes(width as usize)?;
        let v: i128 = match (width, signed, endian) {
            (1, false, _) => b[0] as i128,
            (1, true, _) => b[0] as i8 as i128,
            (2, false, Endian::Big) => BigEndian::read_u16(&b) as i128,
            (2, false, Endian::Little) => LittleEndian::read_u16(&b) as i128,
            (2, true, Endian::Big) => BigEndian::read_i16(&b) as i128,
            (2, true, Endian::Little) => LittleEndian::read_i16(&b) as i128,
            (4, false, Endian::Big) => BigEndian::read_u32(&b) as i128,
            (4, false, Endian::Little) => LittleEndian::read_u32(&b) as i128,
            (4, true, Endian::Big) => BigEndian::read_i32(&b) as i128,
            (4, true, Endian::Little) => LittleEndian::read_i32(&b) as i128,
            (8, false, Endian::Big) => BigEndian::read_u64(&b) as i128,
            (8, false, Endian::Little) => LittleEndian::read_u64(&b) as i128,
            (8, true, Endian::Big) => BigEndian::read_i64(&b) as i128,
            (8, true, Endian::Little) => LittleEndian::read_i64(&b) as i128,
            _ => return Err(ErrorKind::Grammar(format!("unsupported integer width {}", width))),
        };
        Ok(v)
    }

    pub fn read_float(&mut self, width: u8, endian: Endian) -> Result<f64, ErrorKind> {
        let b = self.read_bytes(width as usize)?;
        Ok(match (width, endian) {
            (4, Endian::Big) => BigEndian::read_f32(&b) as f64,
            (4, Endian::Little) => LittleEndian::read_f32(&b) as f64,
            (8, Endian::Big) => BigEndian::read_f64(&b),
            (8, Endian::Little) => LittleEndian::read_f64(&b),
            _ => return Err(ErrorKind::Grammar(format!("unsupported float width {}", width))),
        })
    }

    /// Read an `n`-bit unsigned field (1..=64). Big-endian bit order takes bits from the most
    /// significant end of each byte, little-endian from the least significant end.
    pub fn read_bits(&mut self, n: u8, endian: Endian) -> Result<u64, ErrorKind> {
        if n == 0 || n > 64 {
            return Err(ErrorKind::Grammar(format!("bit field width {} out of range 1..=64", n)));
        }
        if self.bits.endian.is_some_and(|e| e != endian) {
            self.bits = BitState::default();
        }
        self.bits.endian = Some(endian);
        let n32 = n as u32;
        if (self.bits.left as u32) < n32 {
            let needed_bits = n32 - self.bits.left as u32;
            let bytes = needed_bits.div_ceil(8) as usize;
            self.ensure(bytes)?;
            let chunk = &self.buf[self.pos..self.pos + bytes];
            for (i, &b) in chunk.iter().enumerate() {
                match endian {
                    Endian::Big => self.bits.bits = (self.bits.bits << 8) | b as u128,
                    Endian::Little => {
                        self.bits.bits |= (b as u128) << (self.bits.left as u32 + 8 * i as u32)
                    }
                }
            }
            self.pos += bytes;
            self.bits.left += (bytes * 8) as u8;
        }
        let mask: u128 = (1u128 << n32) - 1;
        let v = match endian {
            Endian::Big => {
                let shift = self.bits.left as u32 - n32;
                let v = (self.bits.bits >> shift) & mask;
                self.bits.left -= n;
                self.bits.bits &= (1u128 << self.bits.left) - 1;
                v
            }
            Endian::Little => {
                let v = self.bits.bits & mask;
                self.bits.bits >>= n32;
                self.bits.left -= n;
                v
            }
        };
        Ok(v as u64)
    }
}
