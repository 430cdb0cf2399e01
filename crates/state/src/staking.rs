//! Staking and voting-power records.
//!
//! Voting power is epoch-delayed: writes always land on `next`, and the
//! first observer in a later epoch copies `next` into `current`.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use serde::{Deserialize, Serialize};

/// One epoch's view of a representative's power.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct VotingPowerSnapshot {
    pub self_stake: Amount,
    pub locked_proxied: Amount,
    pub unlocked_proxied: Amount,
}

impl VotingPowerSnapshot {
    pub fn is_zero(&self) -> bool {
        self.self_stake.is_zero()
            && self.locked_proxied.is_zero()
            && self.unlocked_proxied.is_zero()
    }
}

/// Current and next-epoch power for one representative.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct VotingPowerInfo {
    pub current: VotingPowerSnapshot,
    pub next: VotingPowerSnapshot,
    pub epoch_modified: u32,
}

impl VotingPowerInfo {
    /// Rolls `next` into `current` the first time the record is observed in
    /// a later epoch.  Returns whether a transition happened.
    pub fn transition_if_necessary(&mut self, epoch: u32) -> bool {
        if epoch > self.epoch_modified {
            self.current = self.next;
            self.epoch_modified = epoch;
            true
        } else {
            false
        }
    }

    /// The weight quorum computations see in `epoch`: self stake plus
    /// locked proxy at par plus unlocked proxy at the dilution factor.
    pub fn current_power(&mut self, epoch: u32) -> Amount {
        self.transition_if_necessary(epoch);
        let diluted = self.current.unlocked_proxied.raw() * DILUTION_FACTOR / 100;
        Amount::new(self.current.self_stake.raw() + self.current.locked_proxied.raw() + diluted)
    }
}

/// Funds locked behind a representative, keyed by `(origin, target)`.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct StakedFunds {
    pub origin: Buf32,
    pub target: Buf32,
    pub amount: Amount,
    pub liability: Buf32,
}

/// Funds in their thawing period, keyed by `(origin, expiration)`.
/// A frozen fund has `expiration_epoch == 0` until explicitly unfrozen.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct ThawingFunds {
    pub origin: Buf32,
    pub target: Buf32,
    pub amount: Amount,
    pub expiration_epoch: u32,
    pub liability: Buf32,
}

impl ThawingFunds {
    pub fn is_frozen(&self) -> bool {
        self.expiration_epoch == 0
    }

    /// Eligible for pruning at the start of the expiration epoch, not
    /// before.
    pub fn is_expired(&self, current_epoch: u32) -> bool {
        !self.is_frozen() && current_epoch >= self.expiration_epoch
    }
}

/// Accounting mirror of a staked or thawing record.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct Liability {
    pub source: Buf32,
    pub target: Buf32,
    pub amount: Amount,
    pub expiration_epoch: u32,
}

impl Liability {
    /// Liability ids are content-derived so the mirror of a fund is
    /// addressable without a separate counter.
    pub fn id(&self) -> Buf32 {
        let mut stream = HashStream::new();
        stream
            .write_buf(&self.source)
            .write_buf(&self.target)
            .write_amount(self.amount)
            .write_u32(self.expiration_epoch);
        stream.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_lazy_transition() {
        let mut info = VotingPowerInfo::default();
        info.next.self_stake = Amount::new(100);
        info.epoch_modified = 5;

        // Same epoch: next not yet visible.
        assert!(!info.transition_if_necessary(5));
        assert_eq!(info.current.self_stake, Amount::ZERO);

        // Strictly later epoch: next becomes current.
        assert!(info.transition_if_necessary(6));
        assert_eq!(info.current.self_stake, Amount::new(100));
        assert_eq!(info.epoch_modified, 6);
    }

    #[test]
    fn test_dilution() {
        let mut info = VotingPowerInfo::default();
        info.next = VotingPowerSnapshot {
            self_stake: Amount::new(100),
            locked_proxied: Amount::new(40),
            unlocked_proxied: Amount::new(200),
        };
        info.epoch_modified = 1;
        // 100 + 40 + 200 * 25%.
        assert_eq!(info.current_power(2), Amount::new(190));
    }

    #[test]
    fn test_thawing_expiry_boundary() {
        let fund = ThawingFunds {
            origin: Buf32::zero(),
            target: Buf32::zero(),
            amount: Amount::new(1),
            expiration_epoch: 10 + THAWING_PERIOD,
            liability: Buf32::zero(),
        };
        assert!(!fund.is_expired(10 + THAWING_PERIOD - 1));
        assert!(fund.is_expired(10 + THAWING_PERIOD));
    }

    #[test]
    fn test_frozen_never_expires() {
        let mut fund = ThawingFunds {
            origin: Buf32::zero(),
            target: Buf32::zero(),
            amount: Amount::new(1),
            expiration_epoch: 0,
            liability: Buf32::zero(),
        };
        assert!(fund.is_frozen());
        assert!(!fund.is_expired(u32::MAX));
        fund.expiration_epoch = 1;
        assert!(fund.is_expired(1));
    }
}
