//! Signature primitives: ed25519 per-account signatures over blake2b-256
//! digests, and BLS share/aggregate signatures for the delegate committee.

pub mod bls;
pub mod ed25519;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,

    #[error("invalid signature bytes")]
    InvalidSignature,

    #[error("invalid secret key bytes")]
    InvalidSecretKey,

    #[error("nothing to aggregate")]
    EmptyAggregation,

    #[error("delegate index {0} out of committee range")]
    DelegateOutOfRange(u8),
}

pub use bls::{BlsKeyPair, BlsPubKey, DelegateSig};
pub use ed25519::{account_of, sign_digest, validate_account_sig, AccountKeyPair};
