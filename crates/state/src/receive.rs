//! Receive-side ghost records.
//!
//! A send produces a synthetic receive linked into the destination's
//! receive chain; the chain is kept in causal order by timestamp, then
//! hash.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(
    Clone, Debug, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct ReceiveRecord {
    /// Destination account.
    pub account: Buf32,
    /// Predecessor on the receive chain (zero for the opening receive).
    pub previous: Buf32,
    /// Hash of the send being received.
    pub send_hash: Buf32,
    pub amount: Amount,
    pub fee: Amount,
    /// Timestamp of the sealing request block.
    pub timestamp: u64,
}

impl ReceiveRecord {
    /// Whether `self` precedes `other` in receive-chain order.
    pub fn precedes(&self, other: &ReceiveRecord) -> bool {
        if self.timestamp != other.timestamp {
            return self.timestamp < other.timestamp;
        }
        self.digest() < other.digest()
    }
}

impl ContentDigest for ReceiveRecord {
    fn write_digest(&self, stream: &mut HashStream) {
        stream
            .write_buf(&self.account)
            .write_buf(&self.previous)
            .write_buf(&self.send_hash)
            .write_amount(self.amount)
            .write_amount(self.fee)
            .write_u64(self.timestamp);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_order_by_timestamp_then_hash() {
        let a = ReceiveRecord {
            account: Buf32::zero(),
            previous: Buf32::zero(),
            send_hash: Buf32::new([1; 32]),
            amount: Amount::new(1),
            fee: Amount::ZERO,
            timestamp: 10,
        };
        let mut b = a.clone();
        b.timestamp = 20;
        assert!(a.precedes(&b));
        assert!(!b.precedes(&a));

        b.timestamp = 10;
        b.send_hash = Buf32::new([2; 32]);
        // Tie broken by digest, one strict direction.
        assert_ne!(a.precedes(&b), b.precedes(&a));
    }
}
