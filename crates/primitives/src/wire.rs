//! Primitive big-endian wire codec.
//!
//! Every network frame and every canonical block serialization is built from
//! these helpers.  Multi-byte integers are big-endian; amounts keep the
//! legacy little-endian layout.

use thiserror::Error;

use crate::{amount::Amount, buf::{Buf32, Buf64, Buf96}};

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("unexpected end of input at offset {0}")]
    UnexpectedEnd(usize),

    #[error("unknown {0} tag {1}")]
    UnknownTag(&'static str, u8),

    #[error("{0} length {1} out of bounds (max {2})")]
    LengthOutOfBounds(&'static str, usize, usize),

    #[error("trailing {0} bytes after message")]
    TrailingBytes(usize),
}

/// Append-only byte sink for encoding.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_be_bytes());
    }

    pub fn put_amount(&mut self, v: Amount) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_buf32(&mut self, v: &Buf32) {
        self.put_bytes(v.as_slice());
    }

    pub fn put_buf64(&mut self, v: &Buf64) {
        self.put_bytes(v.as_slice());
    }

    pub fn put_buf96(&mut self, v: &Buf96) {
        self.put_bytes(v.as_slice());
    }
}

/// Cursor over a received frame.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Fails if any input is left unconsumed.
    pub fn finish(self) -> Result<(), CodecError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::UnexpectedEnd(self.pos));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn get_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    /// Reads the next byte without consuming it.
    pub fn peek_u8(&self) -> Result<u8, CodecError> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(CodecError::UnexpectedEnd(self.pos))
    }

    pub fn get_u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_be_bytes(arr))
    }

    pub fn get_amount(&mut self) -> Result<Amount, CodecError> {
        let b = self.take(16)?;
        let mut arr = [0u8; 16];
        arr.copy_from_slice(b);
        Ok(Amount::from_le_bytes(arr))
    }

    pub fn get_buf32(&mut self) -> Result<Buf32, CodecError> {
        let b = self.take(32)?;
        Ok(Buf32::try_from(b).expect("wire: 32 bytes"))
    }

    pub fn get_buf64(&mut self) -> Result<Buf64, CodecError> {
        let b = self.take(64)?;
        Ok(Buf64::try_from(b).expect("wire: 64 bytes"))
    }

    pub fn get_buf96(&mut self) -> Result<Buf96, CodecError> {
        let b = self.take(96)?;
        Ok(Buf96::try_from(b).expect("wire: 96 bytes"))
    }
}

/// Canonical wire encoding.  `Serialize → Deserialize → Serialize` must be
/// the identity for every implementor.
pub trait WireEncode {
    fn encode(&self, w: &mut WireWriter);

    fn to_wire(&self) -> Vec<u8> {
        let mut w = WireWriter::new();
        self.encode(&mut w);
        w.into_bytes()
    }
}

pub trait WireDecode: Sized {
    fn decode(r: &mut WireReader<'_>) -> Result<Self, CodecError>;

    fn from_wire(buf: &[u8]) -> Result<Self, CodecError> {
        let mut r = WireReader::new(buf);
        let v = Self::decode(&mut r)?;
        r.finish()?;
        Ok(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_reader_bounds() {
        let mut r = WireReader::new(&[1, 2, 3]);
        assert_eq!(r.get_u16().unwrap(), 0x0102);
        assert!(matches!(r.get_u32(), Err(CodecError::UnexpectedEnd(2))));
    }

    #[test]
    fn test_trailing_rejected() {
        let r = WireReader::new(&[0]);
        assert!(matches!(r.finish(), Err(CodecError::TrailingBytes(1))));
    }

    #[test]
    fn test_amount_little_endian() {
        let mut w = WireWriter::new();
        w.put_amount(Amount::new(0x0102));
        let bytes = w.into_bytes();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(bytes[1], 0x01);
        let mut r = WireReader::new(&bytes);
        assert_eq!(r.get_amount().unwrap(), Amount::new(0x0102));
    }
}
