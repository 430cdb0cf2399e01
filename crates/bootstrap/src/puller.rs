//! Work queue of missing chain ranges relative to the local tips.

use std::collections::VecDeque;

use conclave_primitives::prelude::*;
use conclave_state::tips::TipSet;
use conclave_wire::PullRequestMsg;
use parking_lot::Mutex;
use tracing::*;

/// Retries before a pull unit is abandoned.
const MAX_PULL_ATTEMPTS: u32 = 3;

#[derive(Clone, Debug)]
pub struct PendingPull {
    pub msg: PullRequestMsg,
    pub attempts: u32,
}

pub struct Puller {
    pending: Mutex<VecDeque<PendingPull>>,
    inflight: Mutex<usize>,
}

impl Default for Puller {
    fn default() -> Self {
        Self::new()
    }
}

impl Puller {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(VecDeque::new()),
            inflight: Mutex::new(0),
        }
    }

    /// Enumerates the pulls needed to advance from `local` to `remote`.
    /// Epoch chain first so committee rotations verify, then micro, then
    /// the per-delegate request chains.
    pub fn plan(&self, local: &TipSet, remote: &TipSet) {
        let mut pending = self.pending.lock();

        if remote.eb_tip != local.eb_tip {
            pending.push_back(PendingPull {
                msg: PullRequestMsg {
                    kind: ConsensusKind::Epoch,
                    delegate: 0,
                    from: local.eb_tip,
                    to: remote.eb_tip,
                },
                attempts: 0,
            });
        }
        if remote.mb_tip != local.mb_tip {
            pending.push_back(PendingPull {
                msg: PullRequestMsg {
                    kind: ConsensusKind::MicroBlock,
                    delegate: 0,
                    from: local.mb_tip,
                    to: remote.mb_tip,
                },
                attempts: 0,
            });
        }
        for delegate in 0..NUM_DELEGATES {
            let local_tip = local.rb_tips[delegate];
            let remote_tip = remote.rb_tips[delegate];
            if remote_tip != local_tip && !remote_tip.is_zero() {
                pending.push_back(PendingPull {
                    msg: PullRequestMsg {
                        kind: ConsensusKind::Request,
                        delegate: delegate as DelegateId,
                        from: local_tip,
                        to: remote_tip,
                    },
                    attempts: 0,
                });
            }
        }

        debug!(pulls = pending.len(), "planned bootstrap pulls");
    }

    pub fn take(&self) -> Option<PendingPull> {
        let pull = self.pending.lock().pop_front();
        if pull.is_some() {
            *self.inflight.lock() += 1;
        }
        pull
    }

    /// Marks an in-flight pull finished.
    pub fn complete(&self) {
        let mut inflight = self.inflight.lock();
        *inflight = inflight.saturating_sub(1);
    }

    /// Puts a failed pull back, unless its retries are spent.
    pub fn requeue(&self, mut pull: PendingPull) {
        self.complete();
        pull.attempts += 1;
        if pull.attempts >= MAX_PULL_ATTEMPTS {
            warn!(?pull.msg, attempts = pull.attempts, "abandoning pull");
            return;
        }
        self.pending.lock().push_back(pull);
    }

    pub fn all_done(&self) -> bool {
        self.pending.lock().is_empty() && *self.inflight.lock() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_plan_enumerates_gaps() {
        let puller = Puller::new();
        let local = TipSet::default();
        let mut remote = TipSet::default();
        remote.eb_tip = Buf32::new([1; 32]);
        remote.rb_tips[5] = Buf32::new([2; 32]);
        remote.rb_tips[9] = Buf32::new([3; 32]);

        puller.plan(&local, &remote);
        assert_eq!(puller.pending_len(), 3);

        let first = puller.take().unwrap();
        assert_eq!(first.msg.kind, ConsensusKind::Epoch);
        assert!(!puller.all_done());
    }

    #[test]
    fn test_requeue_caps_attempts() {
        let puller = Puller::new();
        let mut remote = TipSet::default();
        remote.mb_tip = Buf32::new([1; 32]);
        puller.plan(&TipSet::default(), &remote);

        for _ in 0..MAX_PULL_ATTEMPTS {
            let pull = puller.take().unwrap();
            puller.requeue(pull);
        }
        // Third failure abandons the unit.
        assert!(puller.all_done());
    }
}
