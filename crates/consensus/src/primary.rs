//! The primary delegate's round state machine.
//!
//! Pure state: signature shares are assumed validated by the caller, and
//! aggregation happens outside.  Methods report what crossed a threshold;
//! the async manager performs the sends, timers and persistence effects.

use conclave_crypto::DelegateSig;
use conclave_primitives::prelude::*;
use tracing::*;

use crate::quorum::QuorumTracker;
use crate::state::RoundState;

/// What a message accumulation step produced.
#[derive(Debug, Eq, PartialEq)]
pub enum Accumulated {
    /// Counted, no threshold crossed.
    Pending,
    /// Quorum reached: aggregate the returned shares and advance.
    Quorum(Vec<(DelegateId, DelegateSig)>),
    /// Dropped: out-of-state, duplicate, or unknown sender.
    Ignored,
}

/// Round bookkeeping on the primary for one consensus type.
pub struct PrimaryRound {
    delegate_id: DelegateId,
    state: RoundState,
    quorum: QuorumTracker,

    /// Digest of the outstanding pre-prepare.
    pre_prepare_hash: Buf32,
    /// Digest of the post-prepare, once built.
    post_prepare_hash: Buf32,
    /// This primary's share over the pre-prepare digest.
    own_share: DelegateSig,

    prepare_vote: u128,
    prepare_stake: u128,
    /// Bitmap of delegates counted this phase; keeps accumulation
    /// idempotent.
    counted: u32,
    responded: u32,
    shares: Vec<(DelegateId, DelegateSig)>,
}

impl PrimaryRound {
    pub fn new(delegate_id: DelegateId, quorum: QuorumTracker) -> Self {
        Self {
            delegate_id,
            state: RoundState::Initializing,
            quorum,
            pre_prepare_hash: Buf32::zero(),
            post_prepare_hash: Buf32::zero(),
            own_share: DelegateSig::zero(),
            prepare_vote: 0,
            prepare_stake: 0,
            counted: 0,
            responded: 0,
            shares: Vec::new(),
        }
    }

    pub fn state(&self) -> RoundState {
        self.state
    }

    pub fn set_state(&mut self, state: RoundState) {
        self.state = state;
    }

    pub fn quorum(&self) -> &QuorumTracker {
        &self.quorum
    }

    pub fn pre_prepare_hash(&self) -> Buf32 {
        self.pre_prepare_hash
    }

    pub fn post_prepare_hash(&self) -> Buf32 {
        self.post_prepare_hash
    }

    pub fn ready_for_consensus(&self) -> bool {
        matches!(self.state, RoundState::Void | RoundState::PostCommit)
    }

    /// Count of peers that answered this phase, self excluded.
    pub fn all_delegates_responded(&self) -> bool {
        self.responded as usize == NUM_DELEGATES - 1
    }

    pub fn prepare_weight(&self) -> (u128, u128) {
        (self.prepare_vote, self.prepare_stake)
    }

    /// Begins a round for an already-built proposal digest.
    pub fn initiate(&mut self, pre_prepare_hash: Buf32, own_share: DelegateSig) {
        self.pre_prepare_hash = pre_prepare_hash;
        self.post_prepare_hash = Buf32::zero();
        self.own_share = own_share;
        self.reset_phase();
        self.state = RoundState::PrePrepare;
        debug!(digest = %pre_prepare_hash, "consensus initiated");
    }

    fn reset_phase(&mut self) {
        let own = self.quorum.weight_of(self.delegate_id);
        self.prepare_vote = own.vote;
        self.prepare_stake = own.stake;
        self.counted = 0;
        self.responded = 0;
        self.shares.clear();
    }

    fn accumulate(&mut self, from: DelegateId, share: DelegateSig) -> Accumulated {
        let bit = 1u32 << from;
        if self.counted & bit != 0 {
            // Already counted: idempotent no-op.
            return Accumulated::Ignored;
        }
        self.counted |= bit;
        self.responded += 1;

        let weight = self.quorum.weight_of(from);
        self.prepare_vote += weight.vote;
        self.prepare_stake += weight.stake;
        self.shares.push((from, share));

        if self.quorum.reached(self.prepare_vote, self.prepare_stake) {
            let mut shares = std::mem::take(&mut self.shares);
            shares.push((self.delegate_id, self.own_share));
            Accumulated::Quorum(shares)
        } else {
            Accumulated::Pending
        }
    }

    /// Feeds a validated Prepare.  On quorum the caller aggregates the
    /// returned shares into the post-prepare and calls
    /// [`Self::advance_post_prepare`].
    pub fn on_prepare(&mut self, from: DelegateId, share: DelegateSig) -> Accumulated {
        if self.state != RoundState::PrePrepare {
            trace!(%from, state = ?self.state, "disregarding prepare");
            return Accumulated::Ignored;
        }
        self.accumulate(from, share)
    }

    /// Feeds a validated Commit over the post-prepare digest.
    pub fn on_commit(&mut self, from: DelegateId, share: DelegateSig) -> Accumulated {
        if self.state != RoundState::PostPrepare {
            trace!(%from, state = ?self.state, "disregarding commit");
            return Accumulated::Ignored;
        }
        self.accumulate(from, share)
    }

    /// Records a rejection response (not aggregated, but counted toward
    /// all-responded).
    pub fn on_rejection_counted(&mut self, from: DelegateId) {
        let bit = 1u32 << from;
        if self.counted & bit == 0 {
            self.counted |= bit;
            self.responded += 1;
        }
    }

    /// Advances into PostPrepare; the own commit share covers the
    /// post-prepare digest.
    pub fn advance_post_prepare(&mut self, post_prepare_hash: Buf32, own_commit_share: DelegateSig) {
        self.post_prepare_hash = post_prepare_hash;
        self.own_share = own_commit_share;
        self.reset_phase();
        self.state = RoundState::PostPrepare;
    }

    /// Seals the round.
    pub fn advance_post_commit(&mut self) {
        self.reset_phase();
        self.state = RoundState::PostCommit;
    }

    /// Round forfeited on timeout.
    pub fn recall(&mut self) {
        warn!(digest = %self.pre_prepare_hash, "round timed out, recalling");
        self.state = RoundState::Recall;
    }
}

#[cfg(test)]
mod test {
    use conclave_primitives::amount::Amount;
    use conclave_state::block::DelegateEntry;

    use super::*;

    fn committee() -> QuorumTracker {
        let mut entries = [DelegateEntry::default(); NUM_DELEGATES];
        for entry in entries.iter_mut() {
            entry.vote = Amount::new(1);
            entry.stake = Amount::new(1);
        }
        QuorumTracker::from_committee(&entries)
    }

    fn share(n: u8) -> DelegateSig {
        DelegateSig::new([n; 96])
    }

    #[test]
    fn test_prepare_quorum_at_boundary() {
        let mut round = PrimaryRound::new(0, committee());
        round.initiate(Buf32::new([1; 32]), share(0));

        // Own weight 1; 64 mod 3 != 0 so 22 total suffices: 21 peers.
        for peer in 1..21 {
            assert_eq!(round.on_prepare(peer, share(peer as u8)), Accumulated::Pending);
        }
        match round.on_prepare(21, share(21)) {
            Accumulated::Quorum(shares) => {
                // 21 peers plus own share.
                assert_eq!(shares.len(), 22);
            }
            other => panic!("expected quorum, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_prepare_is_idempotent() {
        let mut round = PrimaryRound::new(0, committee());
        round.initiate(Buf32::new([1; 32]), share(0));

        assert_eq!(round.on_prepare(5, share(5)), Accumulated::Pending);
        let (vote, stake) = round.prepare_weight();
        assert_eq!(round.on_prepare(5, share(5)), Accumulated::Ignored);
        assert_eq!(round.prepare_weight(), (vote, stake));
    }

    #[test]
    fn test_out_of_state_messages_dropped() {
        let mut round = PrimaryRound::new(0, committee());
        round.initiate(Buf32::new([1; 32]), share(0));
        // Commit while awaiting prepares is ignored.
        assert_eq!(round.on_commit(3, share(3)), Accumulated::Ignored);
    }

    #[test]
    fn test_phase_reset_between_prepare_and_commit() {
        let mut round = PrimaryRound::new(0, committee());
        round.initiate(Buf32::new([1; 32]), share(0));
        for peer in 1..=21 {
            round.on_prepare(peer, share(peer as u8));
        }
        round.advance_post_prepare(Buf32::new([2; 32]), share(0));

        // Weights restart from own weight.
        assert_eq!(round.prepare_weight(), (1, 1));
        for peer in 1..21 {
            assert_eq!(round.on_commit(peer, share(peer as u8)), Accumulated::Pending);
        }
        assert!(matches!(round.on_commit(21, share(21)), Accumulated::Quorum(_)));
    }
}
