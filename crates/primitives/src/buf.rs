use crate::macros::internal::impl_buf_common;

// 32-byte buf, used for account addresses, block hashes and token ids
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf32(pub [u8; 32]);

// 48-byte buf, used for compressed BLS public keys
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf48(pub [u8; 48]);

// 64-byte buf, used for ed25519 signatures
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf64(pub [u8; 64]);

// 96-byte buf, used for compressed BLS signatures
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Buf96(pub [u8; 96]);

impl_buf_common!(Buf32, 32);
impl_buf_common!(Buf48, 48);
impl_buf_common!(Buf64, 64);
impl_buf_common!(Buf96, 96);

impl Buf32 {
    /// The low 64 bits interpreted as a cheap fingerprint, used by the
    /// propagation filter.
    pub fn cheap_hash(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(b)
    }

    /// A second independent cheap fingerprint from the next 64 bits.
    pub fn cheap_hash_alt(&self) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[8..16]);
        u64::from_le_bytes(b)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cheap_hashes_independent() {
        let mut raw = [0u8; 32];
        raw[..8].copy_from_slice(&7u64.to_le_bytes());
        raw[8..16].copy_from_slice(&9u64.to_le_bytes());
        let buf = Buf32::new(raw);
        assert_eq!(buf.cheap_hash(), 7);
        assert_eq!(buf.cheap_hash_alt(), 9);
    }

    #[test]
    fn test_display_truncates() {
        let buf = Buf32::new([0xab; 32]);
        assert_eq!(format!("{buf}"), "ababab..ababab");
        assert_eq!(format!("{buf:?}").len(), 64);
    }
}
