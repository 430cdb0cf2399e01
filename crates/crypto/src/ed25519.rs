//! Per-account detached signatures.  An account address is the ed25519
//! public key of its owner; signatures always cover a blake2b-256 content
//! digest, never the raw serialization.

use conclave_primitives::prelude::*;
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};

use crate::CryptoError;

/// An account signing key held by a wallet or test harness.
pub struct AccountKeyPair {
    signing: SigningKey,
}

impl AccountKeyPair {
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// The account address derived from this key.
    pub fn account(&self) -> Buf32 {
        Buf32::from(self.signing.verifying_key().to_bytes())
    }

    pub fn sign(&self, digest: &Buf32) -> Buf64 {
        sign_digest(&self.signing, digest)
    }
}

/// The account address of a verifying key.
pub fn account_of(key: &VerifyingKey) -> Buf32 {
    Buf32::from(key.to_bytes())
}

pub fn sign_digest(key: &SigningKey, digest: &Buf32) -> Buf64 {
    let sig = key.sign(digest.as_slice());
    Buf64::from(sig.to_bytes())
}

/// Verifies an account signature over a content digest.  Returns an error
/// for malformed key bytes so protocol errors are distinguishable from a
/// plain bad signature.
pub fn validate_account_sig(
    account: &Buf32,
    digest: &Buf32,
    sig: &Buf64,
) -> Result<bool, CryptoError> {
    let key = VerifyingKey::from_bytes(account.as_bytes())
        .map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(sig.as_bytes());
    Ok(key.verify(digest.as_slice(), &sig).is_ok())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sign_verify() {
        let pair = AccountKeyPair::from_seed(&[7u8; 32]);
        let digest = blake2b(b"payload");
        let sig = pair.sign(&digest);

        assert!(validate_account_sig(&pair.account(), &digest, &sig).unwrap());

        let other = blake2b(b"other");
        assert!(!validate_account_sig(&pair.account(), &other, &sig).unwrap());
    }

    #[test]
    fn test_wrong_account_rejected() {
        let pair = AccountKeyPair::from_seed(&[7u8; 32]);
        let other = AccountKeyPair::from_seed(&[8u8; 32]);
        let digest = blake2b(b"payload");
        let sig = pair.sign(&digest);
        assert!(!validate_account_sig(&other.account(), &digest, &sig).unwrap_or(false));
    }
}
