//! Blake2b-256 digests over canonical serializations.

use blake2::{Blake2b, Digest};
use digest::consts::U32;

use crate::{amount::Amount, buf::Buf32};

type Blake2b256 = Blake2b<U32>;

/// Computes the blake2b-256 digest of a byte slice.
pub fn blake2b(buf: &[u8]) -> Buf32 {
    let mut hasher = Blake2b256::new();
    hasher.update(buf);
    let arr: [u8; 32] = hasher.finalize().into();
    Buf32::from(arr)
}

/// Incremental blake2b-256 stream for hashing message fields in their
/// declared order.  Multi-byte integers are folded in big-endian, matching
/// the wire representation, except amounts which stay little-endian.
pub struct HashStream(Blake2b256);

impl HashStream {
    pub fn new() -> Self {
        Self(Blake2b256::new())
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.0.update(bytes);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.write(&[v])
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.write(&v.to_be_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.write(&v.to_be_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.write(&v.to_be_bytes())
    }

    pub fn write_amount(&mut self, v: Amount) -> &mut Self {
        self.write(&v.to_le_bytes())
    }

    pub fn write_buf(&mut self, v: &Buf32) -> &mut Self {
        self.write(v.as_slice())
    }

    pub fn finish(self) -> Buf32 {
        let arr: [u8; 32] = self.0.finalize().into();
        Buf32::from(arr)
    }
}

impl Default for HashStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Anything with a canonical content digest.  Equal values must produce
/// equal digests.
pub trait ContentDigest {
    /// Streams all participating fields in declared order.
    fn write_digest(&self, stream: &mut HashStream);

    /// The blake2b-256 digest of the content.
    fn digest(&self) -> Buf32 {
        let mut stream = HashStream::new();
        self.write_digest(&mut stream);
        stream.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stream_matches_oneshot() {
        let mut stream = HashStream::new();
        stream.write(b"abc").write(b"def");
        assert_eq!(stream.finish(), blake2b(b"abcdef"));
    }

    #[test]
    fn test_int_endianness() {
        let mut stream = HashStream::new();
        stream.write_u32(0x01020304);
        assert_eq!(stream.finish(), blake2b(&[1, 2, 3, 4]));

        let mut stream = HashStream::new();
        stream.write_amount(Amount::new(1));
        let mut expect = [0u8; 16];
        expect[0] = 1;
        assert_eq!(stream.finish(), blake2b(&expect));
    }
}
