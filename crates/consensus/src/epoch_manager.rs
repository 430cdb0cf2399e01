//! Epoch transition choreography.
//!
//! On the closing `last_micro_block` post-commit the incoming consensus
//! stack is stood up next to the retiring one; delegates serving in both
//! committees keep one identity bound to both until the retiring stack
//! drains.  The retiring request primary forwards its queue when a third of
//! the committee already rejects with `NewEpoch`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conclave_primitives::prelude::*;
use conclave_state::block::{DelegateEntry, RequestBlock};
use parking_lot::Mutex;
use tracing::*;

use crate::manager::ConsensusManager;

/// Window the retiring stack stays alive to drain trailing rounds.
const RETIRE_DRAIN_WINDOW: Duration = Duration::from_secs(10);

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum EpochTransitionState {
    None,
    Connecting,
    EpochTransitionStart,
    EpochStart,
}

/// Builds and retires per-epoch consensus stacks; the node provides the
/// wiring.
pub trait EpochTransitionHooks: Send + Sync {
    /// Stands up netio and consensus for the elected committee, in parallel
    /// with the retiring stack.
    fn build_next_stack(
        &self,
        next_epoch: u32,
        committee: [DelegateEntry; NUM_DELEGATES],
    ) -> anyhow::Result<()>;

    /// Tears down the retired stack after the drain window.
    fn retire_stack(&self, epoch: u32);
}

pub struct EpochManager {
    state: Mutex<EpochTransitionState>,
    current_epoch: AtomicU32,
    next_epoch: AtomicU32,
    enabled: bool,
    hooks: Arc<dyn EpochTransitionHooks>,
}

impl EpochManager {
    pub fn new(current_epoch: u32, enabled: bool, hooks: Arc<dyn EpochTransitionHooks>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(EpochTransitionState::None),
            current_epoch: AtomicU32::new(current_epoch),
            next_epoch: AtomicU32::new(current_epoch),
            enabled,
            hooks,
        })
    }

    pub fn state(&self) -> EpochTransitionState {
        *self.state.lock()
    }

    pub fn current_epoch(&self) -> u32 {
        self.current_epoch.load(Ordering::Acquire)
    }

    pub fn next_epoch(&self) -> u32 {
        self.next_epoch.load(Ordering::Acquire)
    }

    /// Entered while the new stack's channels come up.
    pub fn on_connecting(&self) {
        *self.state.lock() = EpochTransitionState::Connecting;
    }

    /// The closing micro block post-committed: start the transition and
    /// stand the incoming stack up beside the retiring one.
    pub fn on_last_micro_block(
        self: &Arc<Self>,
        closing_epoch: u32,
        elected: [DelegateEntry; NUM_DELEGATES],
    ) {
        if !self.enabled {
            debug!(closing_epoch, "epoch transition disabled");
            return;
        }

        let next = closing_epoch + 1;
        {
            let mut state = self.state.lock();
            if *state == EpochTransitionState::EpochTransitionStart {
                warn!(closing_epoch, "transition already in progress");
                return;
            }
            *state = EpochTransitionState::EpochTransitionStart;
        }
        self.next_epoch.store(next, Ordering::Release);

        info!(closing_epoch, next, "epoch transition start");
        if let Err(e) = self.hooks.build_next_stack(next, elected) {
            error!(err = %e, "failed to stand up next consensus stack");
        }
    }

    /// The epoch block post-committed: the incoming committee is live.  The
    /// retiring stack drains trailing request rounds, then goes away.
    pub fn on_epoch_block_applied(self: &Arc<Self>, sealed_epoch: u32) {
        let retiring = self.current_epoch.swap(sealed_epoch + 1, Ordering::AcqRel);
        *self.state.lock() = EpochTransitionState::EpochStart;
        info!(sealed_epoch, retiring, "epoch started");

        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(RETIRE_DRAIN_WINDOW).await;
            this.hooks.retire_stack(retiring);
            *this.state.lock() = EpochTransitionState::None;
        });
    }

    /// Forwards the retiring primary's pending batches to the incoming
    /// stack once a third of the committee rejects with `NewEpoch`.
    pub fn forward_request_queue(
        &self,
        retiring: &Arc<ConsensusManager<RequestBlock>>,
        incoming: &Arc<ConsensusManager<RequestBlock>>,
    ) {
        if !retiring.handover_requested() {
            return;
        }
        let mut forwarded = 0usize;
        for mut proposal in retiring.drain_queue() {
            proposal.prefix.epoch_number = incoming.epoch_number();
            forwarded += proposal.requests.len();
            incoming.queue_proposal(proposal);
        }
        info!(forwarded, "forwarded retiring primary queue");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NoopHooks;

    impl EpochTransitionHooks for NoopHooks {
        fn build_next_stack(
            &self,
            _next_epoch: u32,
            _committee: [DelegateEntry; NUM_DELEGATES],
        ) -> anyhow::Result<()> {
            Ok(())
        }

        fn retire_stack(&self, _epoch: u32) {}
    }

    #[tokio::test]
    async fn test_transition_states() {
        let manager = EpochManager::new(4, true, Arc::new(NoopHooks));
        assert_eq!(manager.state(), EpochTransitionState::None);

        manager.on_last_micro_block(4, [DelegateEntry::default(); NUM_DELEGATES]);
        assert_eq!(manager.state(), EpochTransitionState::EpochTransitionStart);
        assert_eq!(manager.next_epoch(), 5);

        manager.on_epoch_block_applied(4);
        assert_eq!(manager.state(), EpochTransitionState::EpochStart);
        assert_eq!(manager.current_epoch(), 5);
    }

    #[tokio::test]
    async fn test_disabled_transition_is_inert() {
        let manager = EpochManager::new(1, false, Arc::new(NoopHooks));
        manager.on_last_micro_block(1, [DelegateEntry::default(); NUM_DELEGATES]);
        assert_eq!(manager.state(), EpochTransitionState::None);
    }
}
