use std::io::{ErrorKind, Read};

use byteorder::ByteOrder as _;

use crate::io::{reverse_byte, BitOrder, BitWidth, ByteOrder, StreamError, StreamResult};

/// A bit-granular reader over a byte source.
///
/// Tracks a bit-accurate cursor: single bits come out of an internal 8-bit
/// buffer refilled from the source, while byte-aligned reads bypass it. The
/// byte counter counts bytes moved out of the source into use and can be
/// reset externally. A one-byte lookahead backs `has_available_data` without
/// consuming anything.
pub struct BitReader<'a> {
    src: &'a mut dyn Read,
    bit_order: BitOrder,
    peeked: Option<u8>,
    bit_buffer: u8,
    bits_in_buffer: u8,
    counter: u64,
}

impl<'a> BitReader<'a> {
    pub fn new(src: &'a mut dyn Read, bit_order: BitOrder) -> Self {
        Self {
            src,
            bit_order,
            peeked: None,
            bit_buffer: 0,
            bits_in_buffer: 0,
            counter: 0,
        }
    }

    pub fn bit_order(&self) -> BitOrder {
        self.bit_order
    }

    /// Bytes fully consumed from the source so far.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Set the byte counter to zero and discard any partial bit buffer.
    pub fn reset_counter(&mut self) {
        self.counter = 0;
        self.bit_buffer = 0;
        self.bits_in_buffer = 0;
    }

    /// True if at least one more bit or byte can be read.
    pub fn has_available_data(&mut self) -> StreamResult<bool> {
        if self.bits_in_buffer > 0 || self.peeked.is_some() {
            return Ok(true);
        }
        self.peeked = self.read_raw()?;
        Ok(self.peeked.is_some())
    }

    fn read_raw(&mut self) -> StreamResult<Option<u8>> {
        let mut buf = [0u8; 1];
        loop {
            match self.src.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(StreamError::Transport(e)),
            }
        }
    }

    /// Take the next source byte, counting it. Bit order is applied here so
    /// every consumer sees bytes the same way.
    fn pull_byte(&mut self) -> StreamResult<u8> {
        let raw = match self.peeked.take() {
            Some(b) => b,
            None => self.read_raw()?.ok_or(StreamError::EndOfStream)?,
        };
        self.counter += 1;
        Ok(match self.bit_order {
            BitOrder::Lsb0 => raw,
            BitOrder::Msb0 => reverse_byte(raw),
        })
    }

    fn read_bits(&mut self, width: u8) -> StreamResult<u8> {
        let mut result: u16 = 0;
        let mut got: u8 = 0;
        while got < width {
            if self.bits_in_buffer == 0 {
                self.bit_buffer = self.pull_byte()?;
                self.bits_in_buffer = 8;
            }
            let take = (width - got).min(self.bits_in_buffer);
            let chunk = self.bit_buffer & ((1u16 << take) - 1) as u8;
            result |= (chunk as u16) << got;
            self.bit_buffer >>= take;
            self.bits_in_buffer -= take;
            got += take;
        }
        Ok(result as u8)
    }

    /// Read the next `width` bits packed into the low bits of a byte.
    pub fn read_bit_field(&mut self, width: BitWidth) -> StreamResult<u8> {
        self.read_bits(width.bits())
    }

    /// Read 8 bits as an unsigned byte value.
    pub fn read_byte(&mut self) -> StreamResult<i32> {
        if self.bits_in_buffer == 0 {
            Ok(self.pull_byte()? as i32)
        } else {
            Ok(self.read_bits(8)? as i32)
        }
    }

    /// Read 8 bits; true iff any bit is set.
    pub fn read_boolean(&mut self) -> StreamResult<bool> {
        Ok(self.read_byte()? != 0)
    }

    fn read_exact_bytes<const N: usize>(&mut self) -> StreamResult<[u8; N]> {
        let mut buf = [0u8; N];
        for b in buf.iter_mut() {
            *b = self.read_byte()? as u8;
        }
        Ok(buf)
    }

    pub fn read_short(&mut self, byte_order: ByteOrder) -> StreamResult<i16> {
        let buf = self.read_exact_bytes::<2>()?;
        Ok(match byte_order {
            ByteOrder::BigEndian => byteorder::BigEndian::read_i16(&buf),
            ByteOrder::LittleEndian => byteorder::LittleEndian::read_i16(&buf),
        })
    }

    pub fn read_unsigned_short(&mut self, byte_order: ByteOrder) -> StreamResult<u16> {
        let buf = self.read_exact_bytes::<2>()?;
        Ok(match byte_order {
            ByteOrder::BigEndian => byteorder::BigEndian::read_u16(&buf),
            ByteOrder::LittleEndian => byteorder::LittleEndian::read_u16(&buf),
        })
    }

    pub fn read_int(&mut self, byte_order: ByteOrder) -> StreamResult<i32> {
        let buf = self.read_exact_bytes::<4>()?;
        Ok(match byte_order {
            ByteOrder::BigEndian => byteorder::BigEndian::read_i32(&buf),
            ByteOrder::LittleEndian => byteorder::LittleEndian::read_i32(&buf),
        })
    }

    pub fn read_long(&mut self, byte_order: ByteOrder) -> StreamResult<i64> {
        let buf = self.read_exact_bytes::<8>()?;
        Ok(match byte_order {
            ByteOrder::BigEndian => byteorder::BigEndian::read_i64(&buf),
            ByteOrder::LittleEndian => byteorder::LittleEndian::read_i64(&buf),
        })
    }

    /// Read a bit-field array. A negative count means "until end of stream",
    /// stopping only at whole-element boundaries.
    pub fn read_bit_array(&mut self, count: i32, width: BitWidth) -> StreamResult<Vec<u8>> {
        if count < 0 {
            let mut out = Vec::new();
            while self.has_available_data()? {
                out.push(self.read_bit_field(width)?);
            }
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(count as usize);
            for _ in 0..count {
                out.push(self.read_bit_field(width)?);
            }
            Ok(out)
        }
    }

    pub fn read_bool_array(&mut self, count: i32) -> StreamResult<Vec<bool>> {
        if count < 0 {
            let mut out = Vec::new();
            while self.has_available_data()? {
                out.push(self.read_boolean()?);
            }
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(count as usize);
            for _ in 0..count {
                out.push(self.read_boolean()?);
            }
            Ok(out)
        }
    }

    /// Read a byte array. Little-endian order reverses the whole array.
    pub fn read_byte_array(&mut self, count: i32, byte_order: ByteOrder) -> StreamResult<Vec<u8>> {
        let mut out = if count < 0 {
            let mut v = Vec::new();
            while self.has_available_data()? {
                v.push(self.read_byte()? as u8);
            }
            v
        } else {
            let mut v = Vec::with_capacity(count as usize);
            for _ in 0..count {
                v.push(self.read_byte()? as u8);
            }
            v
        };
        if byte_order == ByteOrder::LittleEndian {
            out.reverse();
        }
        Ok(out)
    }

    pub fn read_short_array(&mut self, count: i32, byte_order: ByteOrder) -> StreamResult<Vec<i16>> {
        if count < 0 {
            let mut out = Vec::new();
            while self.has_available_data()? {
                out.push(self.read_short(byte_order)?);
            }
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(count as usize);
            for _ in 0..count {
                out.push(self.read_short(byte_order)?);
            }
            Ok(out)
        }
    }

    pub fn read_ushort_array(&mut self, count: i32, byte_order: ByteOrder) -> StreamResult<Vec<u16>> {
        if count < 0 {
            let mut out = Vec::new();
            while self.has_available_data()? {
                out.push(self.read_unsigned_short(byte_order)?);
            }
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(count as usize);
            for _ in 0..count {
                out.push(self.read_unsigned_short(byte_order)?);
            }
            Ok(out)
        }
    }

    pub fn read_int_array(&mut self, count: i32, byte_order: ByteOrder) -> StreamResult<Vec<i32>> {
        if count < 0 {
            let mut out = Vec::new();
            while self.has_available_data()? {
                out.push(self.read_int(byte_order)?);
            }
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(count as usize);
            for _ in 0..count {
                out.push(self.read_int(byte_order)?);
            }
            Ok(out)
        }
    }

    pub fn read_long_array(&mut self, count: i32, byte_order: ByteOrder) -> StreamResult<Vec<i64>> {
        if count < 0 {
            let mut out = Vec::new();
            while self.has_available_data()? {
                out.push(self.read_long(byte_order)?);
            }
            Ok(out)
        } else {
            let mut out = Vec::with_capacity(count as usize);
            for _ in 0..count {
                out.push(self.read_long(byte_order)?);
            }
            Ok(out)
        }
    }

    /// Advance to the next multiple of `alignment` bytes. Any partial bit
    /// buffer is discarded even when the cursor is already aligned.
    pub fn align(&mut self, alignment: i32) -> StreamResult<()> {
        self.bit_buffer = 0;
        self.bits_in_buffer = 0;
        if alignment > 1 {
            while self.counter % alignment as u64 != 0 {
                self.pull_byte()?;
            }
        }
        Ok(())
    }

    /// Skip up to `count` bytes, returning how many were actually skipped.
    /// Discards any partial bit buffer.
    pub fn skip(&mut self, count: i64) -> StreamResult<u64> {
        self.bit_buffer = 0;
        self.bits_in_buffer = 0;
        let mut skipped = 0u64;
        while (skipped as i64) < count {
            if !self.has_available_data()? {
                break;
            }
            self.pull_byte()?;
            skipped += 1;
        }
        Ok(skipped)
    }
}
