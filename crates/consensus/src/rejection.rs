//! Primary-side rejection bookkeeping for request rounds.
//!
//! Each batch slot accumulates rejection weight and indirect support (the
//! rejecting delegates that still approved it).  When the round fails, the
//! surviving requests are partitioned into re-proposal batches by their
//! supporting-delegate sets, merging sets related by containment.

use std::collections::BTreeSet;

use conclave_primitives::prelude::*;

use crate::quorum::QuorumTracker;

#[derive(Clone, Debug, Default)]
struct SlotSupport {
    reject_vote: u128,
    reject_stake: u128,
    support_vote: u128,
    support_stake: u128,
    /// Rejecting delegates that approved this slot.
    supporting: BTreeSet<DelegateId>,
    dropped: bool,
}

pub struct RejectionTracker {
    slots: Vec<SlotSupport>,
    new_epoch_count: u32,
}

impl RejectionTracker {
    pub fn new(batch_len: usize) -> Self {
        Self {
            slots: vec![SlotSupport::default(); batch_len],
            new_epoch_count: 0,
        }
    }

    pub fn record_new_epoch(&mut self) {
        self.new_epoch_count += 1;
    }

    /// Whether enough delegates cited `NewEpoch` to hand the queue over to
    /// the incoming primary.
    pub fn new_epoch_handover(&self) -> bool {
        3 * self.new_epoch_count >= NUM_DELEGATES as u32
    }

    /// Folds in one `ContainsInvalidRequest` rejection bitmap.
    pub fn on_batch_rejection(
        &mut self,
        from: DelegateId,
        quorum: &QuorumTracker,
        rejection_map: &[bool],
    ) {
        let weight = quorum.weight_of(from);
        for (index, slot) in self.slots.iter_mut().enumerate() {
            let rejected = rejection_map.get(index).copied().unwrap_or(false);
            if rejected {
                slot.reject_vote += weight.vote;
                slot.reject_stake += weight.stake;
                if quorum.third_crossed(slot.reject_vote, slot.reject_stake) {
                    slot.dropped = true;
                }
            } else {
                slot.support_vote += weight.vote;
                slot.support_stake += weight.stake;
                slot.supporting.insert(from);
            }
        }
    }

    /// Whether every slot is already resolved (dropped, or indirect support
    /// plus the prepare weight reaches quorum) so the round can be recut
    /// without waiting for the stragglers.
    pub fn all_slots_resolved(&self, prepare: (u128, u128), quorum: &QuorumTracker) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        self.slots.iter().all(|slot| {
            slot.dropped
                || quorum.reached(
                    prepare.0 + slot.support_vote,
                    prepare.1 + slot.support_stake,
                )
        })
    }

    /// Cuts the surviving slots into re-proposal batches.  Slots supported
    /// by identical delegate sets share a batch; a set containing another
    /// is folded onto the smaller set.
    pub fn partition(&self, prepare: (u128, u128), quorum: &QuorumTracker) -> Vec<Vec<usize>> {
        // (supporting set, slot indexes)
        let mut subsets: Vec<(BTreeSet<DelegateId>, Vec<usize>)> = Vec::new();

        for (index, slot) in self.slots.iter().enumerate() {
            if slot.dropped {
                continue;
            }
            let vote = prepare.0 + slot.support_vote;
            let stake = prepare.1 + slot.support_stake;
            if !quorum.reached(vote, stake) {
                // The acceptors together cannot post-commit it.
                continue;
            }

            match subsets.iter_mut().find(|(set, _)| *set == slot.supporting) {
                Some((_, indexes)) => indexes.push(index),
                None => subsets.push((slot.supporting.clone(), vec![index])),
            }
        }

        // Merge sets related by containment; the merged batch keeps the
        // smaller (more constrained) set.
        let mut a = 0;
        while a < subsets.len() {
            let mut b = a + 1;
            while b < subsets.len() {
                let a_contains_b = subsets[b].0.is_subset(&subsets[a].0);
                let b_contains_a = subsets[a].0.is_subset(&subsets[b].0);

                if subsets[a].0.len() > subsets[b].0.len() && a_contains_b {
                    let (set, mut indexes) = subsets.remove(b);
                    subsets[a].0 = set;
                    subsets[a].1.append(&mut indexes);
                } else if b_contains_a {
                    let (_, mut indexes) = subsets.remove(b);
                    subsets[a].1.append(&mut indexes);
                } else {
                    b += 1;
                }
            }
            a += 1;
        }

        subsets
            .into_iter()
            .map(|(_, mut indexes)| {
                indexes.sort_unstable();
                indexes
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use conclave_primitives::amount::Amount;
    use conclave_state::block::DelegateEntry;

    use super::*;

    fn tracker_committee() -> QuorumTracker {
        let mut entries = [DelegateEntry::default(); NUM_DELEGATES];
        for entry in entries.iter_mut() {
            entry.vote = Amount::new(1);
            entry.stake = Amount::new(1);
        }
        QuorumTracker::from_committee(&entries)
    }

    #[test]
    fn test_partition_by_support_sets() {
        // Backups 0 and 1 each reject one request and approve the rest;
        // the other 29 backups (plus the primary) approved everything via
        // plain prepares.
        let quorum = tracker_committee();
        let mut tracker = RejectionTracker::new(3);

        tracker.on_batch_rejection(0, &quorum, &[true, false, false]);
        tracker.on_batch_rejection(1, &quorum, &[false, true, false]);

        // Primary + 29 prepare-senders.
        let prepare = (30u128, 30u128);
        let batches = tracker.partition(prepare, &quorum);

        // Slot 2 (approved by both rejectors) folds onto slot 0's batch,
        // whose support set {1} is contained in {0, 1}.
        assert_eq!(batches, vec![vec![0, 2], vec![1]]);
    }

    #[test]
    fn test_third_rejection_drops_slot() {
        let quorum = tracker_committee();
        let mut tracker = RejectionTracker::new(1);

        // Eleven rejections cross one third of 32.
        for delegate in 0..11 {
            tracker.on_batch_rejection(delegate, &quorum, &[true]);
        }
        let batches = tracker.partition((21, 21), &quorum);
        assert!(batches.is_empty());
    }

    #[test]
    fn test_insufficient_support_is_dropped() {
        let quorum = tracker_committee();
        let mut tracker = RejectionTracker::new(1);
        tracker.on_batch_rejection(0, &quorum, &[true]);

        // Prepare weight alone cannot reach quorum.
        let batches = tracker.partition((5, 5), &quorum);
        assert!(batches.is_empty());
    }

    #[test]
    fn test_new_epoch_handover_threshold() {
        let mut tracker = RejectionTracker::new(0);
        for _ in 0..10 {
            tracker.record_new_epoch();
        }
        assert!(!tracker.new_epoch_handover());
        tracker.record_new_epoch();
        assert!(tracker.new_epoch_handover());
    }
}
