//! A backup delegate's round state machine for one remote primary.

use conclave_primitives::prelude::*;
use conclave_state::block::AggSignature;
use tracing::*;

use crate::proposal::Proposal;
use crate::state::RoundState;

/// What the backup should send next, decided by the manager after
/// validation.
#[derive(Debug)]
pub enum BackupStep<P> {
    /// Reply with a Prepare over the stored digest.
    SendPrepare { digest: Buf32 },
    /// Reply with a Commit over the post-prepare digest.
    SendCommit { digest: Buf32 },
    /// Round sealed: apply the proposal.
    Apply { proposal: P },
    /// Message dropped.
    Ignored,
}

/// Per-remote-primary bookkeeping.
pub struct BackupRound<P: Proposal> {
    remote: DelegateId,
    state: RoundState,
    cur_pre_prepare: Option<P>,
    cur_pre_prepare_hash: Buf32,
    /// Prepare-quorum aggregate from the post-prepare; seals the block.
    prepare_agg: Option<AggSignature>,
    cur_post_prepare_hash: Option<Buf32>,
}

impl<P: Proposal> BackupRound<P> {
    pub fn new(remote: DelegateId) -> Self {
        Self {
            remote,
            state: RoundState::Void,
            cur_pre_prepare: None,
            cur_pre_prepare_hash: Buf32::zero(),
            prepare_agg: None,
            cur_post_prepare_hash: None,
        }
    }

    pub fn prepare_agg(&self) -> Option<AggSignature> {
        self.prepare_agg
    }

    pub fn post_prepare_hash(&self) -> Option<Buf32> {
        self.cur_post_prepare_hash
    }

    /// Records the verified prepare aggregate and its round digest.
    pub fn store_prepare_agg(&mut self, agg: AggSignature, post_prepare_hash: Buf32) {
        self.prepare_agg = Some(agg);
        self.cur_post_prepare_hash = Some(post_prepare_hash);
    }

    pub fn remote(&self) -> DelegateId {
        self.remote
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn pre_prepare_hash(&self) -> Buf32 {
        self.cur_pre_prepare_hash
    }

    /// Accepts a semantically valid pre-prepare.
    pub fn on_pre_prepare(&mut self, proposal: P) -> BackupStep<P> {
        if !matches!(self.state, RoundState::Void | RoundState::PostCommit) {
            // A new pre-prepare supersedes a stalled round with this
            // primary.
            debug!(remote = self.remote, state = %self.state, "pre-prepare in unexpected state");
        }
        let digest = proposal.digest();
        self.cur_pre_prepare_hash = digest;
        self.cur_pre_prepare = Some(proposal);
        self.state = RoundState::Prepare;
        BackupStep::SendPrepare { digest }
    }

    /// Rejection path: remember nothing, stay out of the round.
    pub fn on_pre_prepare_rejected(&mut self) {
        self.cur_pre_prepare = None;
        self.cur_pre_prepare_hash = Buf32::zero();
        self.prepare_agg = None;
        self.cur_post_prepare_hash = None;
        self.state = RoundState::Void;
    }

    /// Accepts a post-prepare whose aggregate the manager verified.
    pub fn on_post_prepare(&mut self, post_prepare_hash: Buf32) -> BackupStep<P> {
        if self.state != RoundState::Prepare {
            trace!(remote = self.remote, state = %self.state, "disregarding post-prepare");
            return BackupStep::Ignored;
        }
        self.state = RoundState::Commit;
        BackupStep::SendCommit {
            digest: post_prepare_hash,
        }
    }

    /// Accepts a post-commit whose aggregate the manager verified; hands
    /// the sealed proposal back for application.
    pub fn on_post_commit(&mut self) -> BackupStep<P> {
        if self.state != RoundState::Commit {
            trace!(remote = self.remote, state = %self.state, "post-commit in unexpected state");
        }
        let Some(proposal) = self.cur_pre_prepare.take() else {
            return BackupStep::Ignored;
        };
        self.cur_pre_prepare_hash = Buf32::zero();
        self.cur_post_prepare_hash = None;
        self.state = RoundState::Void;
        BackupStep::Apply { proposal }
    }
}

#[cfg(test)]
mod test {
    use conclave_state::block::RequestBlock;

    use super::*;

    #[test]
    fn test_full_backup_flow() {
        let mut round: BackupRound<RequestBlock> = BackupRound::new(3);
        let mut block = RequestBlock::default();
        block.prefix.primary_delegate = 3;
        let digest = Proposal::digest(&block);

        match round.on_pre_prepare(block) {
            BackupStep::SendPrepare { digest: d } => assert_eq!(d, digest),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(round.state(), RoundState::Prepare);

        let pp_hash = Buf32::new([7; 32]);
        match round.on_post_prepare(pp_hash) {
            BackupStep::SendCommit { digest: d } => assert_eq!(d, pp_hash),
            other => panic!("unexpected {other:?}"),
        }

        match round.on_post_commit() {
            BackupStep::Apply { proposal } => {
                assert_eq!(Proposal::digest(&proposal), digest)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(round.state(), RoundState::Void);
    }

    #[test]
    fn test_post_prepare_out_of_state_ignored() {
        let mut round: BackupRound<RequestBlock> = BackupRound::new(1);
        assert!(matches!(
            round.on_post_prepare(Buf32::zero()),
            BackupStep::Ignored
        ));
    }
}
