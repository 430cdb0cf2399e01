//! Weighted two-thirds quorum over the elected committee.
//!
//! Thresholds are ceilings of `2/3` of the vote and stake totals.  The
//! boundary is inclusive exactly when the division had a remainder: an
//! exact two-thirds with zero remainder requires strict excess.

use conclave_primitives::prelude::*;
use conclave_state::block::DelegateEntry;

#[derive(Copy, Clone, Debug, Default)]
pub struct DelegateWeight {
    pub vote: u128,
    pub stake: u128,
}

#[derive(Clone, Debug)]
pub struct QuorumTracker {
    weights: [DelegateWeight; NUM_DELEGATES],
    vote_total: u128,
    stake_total: u128,
    vote_quorum: u128,
    stake_quorum: u128,
    vote_rounded: bool,
    stake_rounded: bool,
}

fn ceil_with_remainder(n: u128, d: u128) -> (u128, bool) {
    let q = n / d;
    let rounded = n % d != 0;
    (q + rounded as u128, rounded)
}

impl QuorumTracker {
    pub fn from_committee(committee: &[DelegateEntry; NUM_DELEGATES]) -> Self {
        let mut weights = [DelegateWeight::default(); NUM_DELEGATES];
        let mut vote_total = 0u128;
        let mut stake_total = 0u128;
        for (idx, entry) in committee.iter().enumerate() {
            weights[idx] = DelegateWeight {
                vote: entry.vote.raw(),
                stake: entry.stake.raw(),
            };
            vote_total += entry.vote.raw();
            stake_total += entry.stake.raw();
        }

        let (vote_quorum, vote_rounded) = ceil_with_remainder(2 * vote_total, 3);
        let (stake_quorum, stake_rounded) = ceil_with_remainder(2 * stake_total, 3);

        Self {
            weights,
            vote_total,
            stake_total,
            vote_quorum,
            stake_quorum,
            vote_rounded,
            stake_rounded,
        }
    }

    pub fn weight_of(&self, delegate: DelegateId) -> DelegateWeight {
        self.weights[delegate as usize]
    }

    pub fn totals(&self) -> (u128, u128) {
        (self.vote_total, self.stake_total)
    }

    /// Whether accumulated `(vote, stake)` weight reaches quorum on both
    /// axes.
    pub fn reached(&self, vote: u128, stake: u128) -> bool {
        let vote_ok = if self.vote_rounded {
            vote >= self.vote_quorum
        } else {
            vote > self.vote_quorum
        };
        let stake_ok = if self.stake_rounded {
            stake >= self.stake_quorum
        } else {
            stake > self.stake_quorum
        };
        vote_ok && stake_ok
    }

    /// Whether `(vote, stake)` crosses one third of the totals, the
    /// rejection threshold.
    pub fn third_crossed(&self, vote: u128, stake: u128) -> bool {
        3 * vote >= self.vote_total || 3 * stake >= self.stake_total
    }
}

#[cfg(test)]
mod test {
    use conclave_primitives::amount::Amount;

    use super::*;

    fn uniform_committee(vote: u128, stake: u128) -> [DelegateEntry; NUM_DELEGATES] {
        let mut committee = [DelegateEntry::default(); NUM_DELEGATES];
        for (i, entry) in committee.iter_mut().enumerate() {
            entry.account = conclave_primitives::buf::Buf32::new([i as u8 + 1; 32]);
            entry.vote = Amount::new(vote);
            entry.stake = Amount::new(stake);
        }
        committee
    }

    #[test]
    fn test_quorum_boundary_with_remainder() {
        // 32 delegates of weight 1: 2V = 64, 64 mod 3 = 1, so 22 suffices.
        let tracker = QuorumTracker::from_committee(&uniform_committee(1, 1));
        assert!(!tracker.reached(21, 21));
        assert!(tracker.reached(22, 22));
    }

    #[test]
    fn test_exact_two_thirds_requires_strict_excess() {
        // Weight 3 each: 2V = 192, divisible by 3, quorum point 64 must be
        // strictly exceeded.
        let tracker = QuorumTracker::from_committee(&uniform_committee(3, 3));
        assert!(!tracker.reached(64, 64));
        assert!(tracker.reached(65, 65));
    }

    #[test]
    fn test_both_axes_required() {
        let tracker = QuorumTracker::from_committee(&uniform_committee(1, 3));
        // Vote reaches, stake does not.
        assert!(!tracker.reached(22, 64));
        assert!(tracker.reached(22, 65));
    }

    #[test]
    fn test_third_threshold() {
        let tracker = QuorumTracker::from_committee(&uniform_committee(1, 1));
        assert!(!tracker.third_crossed(10, 10));
        assert!(tracker.third_crossed(11, 0));
    }
}
