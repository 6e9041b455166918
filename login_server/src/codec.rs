//! Packet body primitives shared by both protocols.
//!
//! Every field is little-endian: `C` byte, `H` 16-bit, `D` 32-bit, `Q` 64-bit, `S` UTF-16LE
//! text closed by a zero code unit, `B` raw bytes. Bodies start with a one byte opcode.

use byteorder::{ByteOrder, LittleEndian};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("packet underflow: needed {needed} bytes but only {remaining} remain")]
    Underflow { needed: usize, remaining: usize },
    #[error("string field is not terminated")]
    UnterminatedString,
}

pub struct PacketReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    fn take(&mut self, needed: usize) -> Result<&'a [u8], CodecError> {
        let remaining = self.remaining();
        if remaining < needed {
            return Err(CodecError::Underflow { needed, remaining });
        }
        let slice = &self.data[self.position..self.position + needed];
        self.position += needed;
        Ok(slice)
    }

    pub fn read_c(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_h(&mut self) -> Result<u16, CodecError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn read_d(&mut self) -> Result<i32, CodecError> {
        Ok(LittleEndian::read_i32(self.take(4)?))
    }

    pub fn read_q(&mut self) -> Result<i64, CodecError> {
        Ok(LittleEndian::read_i64(self.take(8)?))
    }

    pub fn read_b(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len)
    }

    pub fn read_s(&mut self) -> Result<String, CodecError> {
        let mut units = Vec::new();
        loop {
            if self.remaining() < 2 {
                return Err(CodecError::UnterminatedString);
            }
            let unit = LittleEndian::read_u16(self.take(2)?);
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        Ok(String::from_utf16_lossy(&units))
    }
}

/// Builds an outbound packet body, opcode first.
pub struct PacketWriter {
    buf: Vec<u8>,
}

impl PacketWriter {
    pub fn new(opcode: u8) -> Self {
        Self { buf: vec![opcode] }
    }

    pub fn write_c(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn write_h(&mut self, value: u16) -> &mut Self {
        let mut raw = [0u8; 2];
        LittleEndian::write_u16(&mut raw, value);
        self.buf.extend_from_slice(&raw);
        self
    }

    pub fn write_d(&mut self, value: i32) -> &mut Self {
        let mut raw = [0u8; 4];
        LittleEndian::write_i32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
        self
    }

    pub fn write_q(&mut self, value: i64) -> &mut Self {
        let mut raw = [0u8; 8];
        LittleEndian::write_i64(&mut raw, value);
        self.buf.extend_from_slice(&raw);
        self
    }

    pub fn write_s(&mut self, value: &str) -> &mut Self {
        for unit in value.encode_utf16() {
            self.write_h(unit);
        }
        self.write_h(0)
    }

    pub fn write_b(&mut self, value: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(value);
        self
    }

    /// Takes the finished body, leaving the writer empty.
    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}
