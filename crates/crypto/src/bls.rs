//! BLS share signatures and committee aggregation (min-pk, signatures in
//! G2, 96 bytes compressed).  The aggregate carries a delegate bitmap so a
//! verifier can reconstruct the participating key set from the elected
//! committee.

use blst::min_pk::{AggregatePublicKey, AggregateSignature, PublicKey, SecretKey, Signature};
use blst::BLST_ERROR;
use conclave_primitives::prelude::*;

use crate::CryptoError;

/// Domain separation tag for all consensus round signatures.
const DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_NUL_";

/// A single delegate's signature share, compressed.
pub type DelegateSig = Buf96;

/// A committee member's BLS public key, kept alongside its compressed form.
#[derive(Clone)]
pub struct BlsPubKey {
    key: PublicKey,
    compressed: [u8; 48],
}

impl BlsPubKey {
    pub fn from_bytes(bytes: &[u8; 48]) -> Result<Self, CryptoError> {
        let key = PublicKey::uncompress(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self {
            key,
            compressed: *bytes,
        })
    }

    pub fn compressed(&self) -> &[u8; 48] {
        &self.compressed
    }
}

impl std::fmt::Debug for BlsPubKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BlsPubKey({:02x}{:02x}{:02x}..)",
            self.compressed[0], self.compressed[1], self.compressed[2]
        )
    }
}

/// A delegate's BLS signing identity.
pub struct BlsKeyPair {
    secret: SecretKey,
    public: BlsPubKey,
}

impl BlsKeyPair {
    /// Derives a key pair from at least 32 bytes of key material.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::key_gen(seed, &[]).map_err(|_| CryptoError::InvalidSecretKey)?;
        let pk = secret.sk_to_pk();
        let public = BlsPubKey {
            compressed: pk.compress(),
            key: pk,
        };
        Ok(Self { secret, public })
    }

    pub fn public(&self) -> &BlsPubKey {
        &self.public
    }

    /// Signs a round digest, producing this delegate's share.
    pub fn sign(&self, digest: &Buf32) -> DelegateSig {
        let sig = self.secret.sign(digest.as_slice(), DST, &[]);
        Buf96::from(sig.compress())
    }
}

/// Verifies one delegate's share against its committee key.
pub fn verify_share(digest: &Buf32, sig: &DelegateSig, key: &BlsPubKey) -> bool {
    let Ok(sig) = Signature::uncompress(sig.as_slice()) else {
        return false;
    };
    sig.verify(true, digest.as_slice(), DST, &[], &key.key, true) == BLST_ERROR::BLST_SUCCESS
}

/// Aggregates the collected shares into one signature plus the bitmap of
/// contributing delegates.  Shares must already be individually validated;
/// aggregation fails only on malformed share bytes.
pub fn aggregate_shares(
    shares: &[(DelegateId, DelegateSig)],
) -> Result<(u32, Buf96), CryptoError> {
    if shares.is_empty() {
        return Err(CryptoError::EmptyAggregation);
    }

    let mut bitmap = 0u32;
    let mut sigs = Vec::with_capacity(shares.len());
    for (id, share) in shares {
        if *id as usize >= NUM_DELEGATES {
            return Err(CryptoError::DelegateOutOfRange(*id));
        }
        bitmap |= 1u32 << id;
        sigs.push(
            Signature::uncompress(share.as_slice()).map_err(|_| CryptoError::InvalidSignature)?,
        );
    }

    let refs: Vec<&Signature> = sigs.iter().collect();
    let agg = AggregateSignature::aggregate(&refs, true)
        .map_err(|_| CryptoError::InvalidSignature)?;

    Ok((bitmap, Buf96::from(agg.to_signature().compress())))
}

/// Verifies an aggregate signature against the subset of the committee
/// marked in the bitmap.
pub fn verify_aggregate(
    digest: &Buf32,
    bitmap: u32,
    sig: &Buf96,
    committee: &[BlsPubKey],
) -> bool {
    if bitmap == 0 {
        return false;
    }

    let mut keys = Vec::new();
    for (idx, key) in committee.iter().enumerate() {
        if bitmap & (1u32 << idx) != 0 {
            keys.push(&key.key);
        }
    }
    // Bitmap bits beyond the committee make the signature unverifiable.
    if keys.len() != bitmap.count_ones() as usize {
        return false;
    }

    let Ok(agg_pk) = AggregatePublicKey::aggregate(&keys, true) else {
        return false;
    };
    let Ok(sig) = Signature::uncompress(sig.as_slice()) else {
        return false;
    };

    let pk = agg_pk.to_public_key();
    sig.verify(true, digest.as_slice(), DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
}

#[cfg(test)]
mod test {
    use super::*;

    fn keypair(seed: u8) -> BlsKeyPair {
        BlsKeyPair::from_seed(&[seed; 32]).unwrap()
    }

    #[test]
    fn test_share_roundtrip() {
        let pair = keypair(1);
        let digest = blake2b(b"round");
        let share = pair.sign(&digest);
        assert!(verify_share(&digest, &share, pair.public()));
        assert!(!verify_share(&blake2b(b"other"), &share, pair.public()));
    }

    #[test]
    fn test_aggregate_verifies_under_bitmap() {
        let pairs: Vec<_> = (1u8..=4).map(keypair).collect();
        let committee: Vec<_> = pairs.iter().map(|p| p.public().clone()).collect();
        let digest = blake2b(b"round");

        // delegates 0, 2 and 3 sign
        let shares = vec![
            (0u8, pairs[0].sign(&digest)),
            (2u8, pairs[2].sign(&digest)),
            (3u8, pairs[3].sign(&digest)),
        ];
        let (bitmap, agg) = aggregate_shares(&shares).unwrap();
        assert_eq!(bitmap, 0b1101);
        assert!(verify_aggregate(&digest, bitmap, &agg, &committee));

        // wrong subset fails
        assert!(!verify_aggregate(&digest, 0b0111, &agg, &committee));
        // wrong digest fails
        assert!(!verify_aggregate(&blake2b(b"other"), bitmap, &agg, &committee));
    }

    #[test]
    fn test_aggregate_rejects_out_of_range() {
        let pair = keypair(1);
        let digest = blake2b(b"round");
        let res = aggregate_shares(&[(32u8, pair.sign(&digest))]);
        assert!(matches!(res, Err(CryptoError::DelegateOutOfRange(32))));
    }
}
