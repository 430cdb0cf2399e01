//! Round orchestration for one consensus type: the primary machine for the
//! chain this delegate owns, and one backup machine per remote primary.
//!
//! The manager owns the IO: it validates shares and aggregates against the
//! committee, drives the pure round state under one mutex, schedules the
//! ticketed timers, and hands sealed blocks to persistence and gossip.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use conclave_crypto::bls::{
    aggregate_shares, verify_aggregate, verify_share, BlsKeyPair, BlsPubKey,
};
use conclave_crypto::DelegateSig;
use conclave_primitives::prelude::*;
use conclave_state::block::{AggSignature, Block, DelegateEntry};
use conclave_wire::{
    CommitMsg, ConsensusMessage, PostCommitMsg, PostPrepareMsg, PrePrepareMsg, PrepareMsg,
    RejectionMsg, RejectionReason,
};
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tracing::*;

use crate::backup::{BackupRound, BackupStep};
use crate::primary::{Accumulated, PrimaryRound};
use crate::proposal::Proposal;
use crate::quorum::QuorumTracker;
use crate::rejection::RejectionTracker;
use crate::state::RoundState;

/// Outbound message transport over the delegate mesh.
pub trait ConsensusSink: Send + Sync {
    fn send_to(&self, target: DelegateId, frame: Vec<u8>);
    fn broadcast(&self, frame: Vec<u8>);
}

/// Persistence hooks for one proposal type.
pub trait ProposalDriver<P>: Send + Sync {
    /// Refreshes chain-position fields (sequence, previous, timestamp)
    /// right before a proposal enters a round.
    fn prepare_for_round(&self, proposal: &mut P);

    /// Semantic validation of a remote pre-prepare.  On failure returns the
    /// rejection reason and, for batches, the per-slot map.
    fn validate(&self, proposal: &P) -> Result<(), (RejectionReason, Vec<bool>)>;

    /// Applies a sealed proposal.
    fn apply(&self, proposal: &P) -> anyhow::Result<()>;
}

struct PrimaryState<P: Proposal> {
    round: PrimaryRound,
    /// Proposal the outstanding round is sealing.
    current: Option<P>,
    /// Batches queued for future rounds.
    queue: VecDeque<P>,
    /// Rejection bookkeeping for the outstanding round.
    rejections: Option<RejectionTracker>,
    /// Aggregate collected at prepare quorum; becomes the block seal.
    prepare_agg: Option<AggSignature>,
    /// Advances on every (re)arm; a stale fire is a no-op.
    timer_ticket: u64,
}

pub struct ConsensusManager<P: Proposal> {
    delegate_id: DelegateId,
    epoch_number: u32,
    committee: [DelegateEntry; NUM_DELEGATES],
    committee_keys: Vec<Option<BlsPubKey>>,
    quorum: QuorumTracker,
    keypair: Arc<BlsKeyPair>,

    primary: Mutex<PrimaryState<P>>,
    backups: Mutex<HashMap<DelegateId, BackupRound<P>>>,
    ticket_counter: AtomicU64,

    sink: Arc<dyn ConsensusSink>,
    driver: Arc<dyn ProposalDriver<P>>,

    /// Sealed blocks fan out to subscribers (gossip, notification bridge).
    sealed_tx: broadcast::Sender<Arc<Block>>,
    /// Set when a third of the committee rejected with `NewEpoch`.
    handover: AtomicBool,
    handover_notify: Notify,
}

impl<P: Proposal> ConsensusManager<P> {
    pub fn new(
        delegate_id: DelegateId,
        epoch_number: u32,
        committee: [DelegateEntry; NUM_DELEGATES],
        keypair: Arc<BlsKeyPair>,
        sink: Arc<dyn ConsensusSink>,
        driver: Arc<dyn ProposalDriver<P>>,
    ) -> Arc<Self> {
        let committee_keys = committee
            .iter()
            .map(|entry| BlsPubKey::from_bytes(entry.bls_key.as_bytes()).ok())
            .collect();
        let quorum = QuorumTracker::from_committee(&committee);
        let (sealed_tx, _) = broadcast::channel(256);

        let mut backups = HashMap::new();
        for id in 0..NUM_DELEGATES as DelegateId {
            if id != delegate_id {
                backups.insert(id, BackupRound::new(id));
            }
        }

        Arc::new(Self {
            delegate_id,
            epoch_number,
            committee,
            committee_keys,
            quorum: quorum.clone(),
            keypair,
            primary: Mutex::new(PrimaryState {
                round: PrimaryRound::new(delegate_id, quorum),
                current: None,
                queue: VecDeque::new(),
                rejections: None,
                prepare_agg: None,
                timer_ticket: 0,
            }),
            backups: Mutex::new(backups),
            ticket_counter: AtomicU64::new(0),
            sink,
            driver,
            sealed_tx,
            handover: AtomicBool::new(false),
            handover_notify: Notify::new(),
        })
    }

    pub fn delegate_id(&self) -> DelegateId {
        self.delegate_id
    }

    pub fn epoch_number(&self) -> u32 {
        self.epoch_number
    }

    pub fn committee(&self) -> &[DelegateEntry; NUM_DELEGATES] {
        &self.committee
    }

    pub fn subscribe_sealed(&self) -> broadcast::Receiver<Arc<Block>> {
        self.sealed_tx.subscribe()
    }

    pub fn round_state(&self) -> RoundState {
        self.primary.lock().round.state()
    }

    /// Leaves `Initializing` once enough channels are bound.
    pub fn on_delegates_connected(self: &Arc<Self>) {
        {
            let mut primary = self.primary.lock();
            if primary.round.state() == RoundState::Initializing {
                primary.round.set_state(RoundState::Void);
            }
        }
        self.try_initiate();
    }

    /// Whether the retiring primary should forward its queue.
    pub fn handover_requested(&self) -> bool {
        self.handover.load(Ordering::Acquire)
    }

    pub async fn wait_handover(&self) {
        while !self.handover_requested() {
            self.handover_notify.notified().await;
        }
    }

    /// Strips the queued proposals, for forwarding to the incoming primary.
    pub fn drain_queue(&self) -> Vec<P> {
        self.primary.lock().queue.drain(..).collect()
    }

    fn key_of(&self, delegate: DelegateId) -> Option<&BlsPubKey> {
        self.committee_keys
            .get(delegate as usize)
            .and_then(|k| k.as_ref())
    }

    fn post_prepare_digest(pre_prepare_hash: &Buf32, agg: &AggSignature) -> Buf32 {
        let mut stream = HashStream::new();
        stream
            .write_buf(pre_prepare_hash)
            .write_u32(agg.map)
            .write(agg.sig.as_slice());
        stream.finish()
    }

    /// Queues a proposal and starts a round if the machine is idle.
    pub fn queue_proposal(self: &Arc<Self>, proposal: P) {
        self.primary.lock().queue.push_back(proposal);
        self.try_initiate();
    }

    pub fn queue_len(&self) -> usize {
        self.primary.lock().queue.len()
    }

    /// Starts the next round when the machine is idle and work is queued.
    pub fn try_initiate(self: &Arc<Self>) {
        let frame = {
            let mut primary = self.primary.lock();
            if !primary.round.ready_for_consensus() {
                return;
            }
            let Some(mut proposal) = primary.queue.pop_front() else {
                return;
            };

            self.driver.prepare_for_round(&mut proposal);
            let digest = proposal.digest();
            let own_share = self.keypair.sign(&digest);
            primary.round.initiate(digest, own_share);
            primary.rejections = Some(RejectionTracker::new(Self::batch_len(&proposal)));
            primary.prepare_agg = None;

            let msg = ConsensusMessage::PrePrepare(PrePrepareMsg {
                block: proposal.clone().into_block(),
                signature: own_share,
            });
            primary.current = Some(proposal);
            primary.timer_ticket = self.arm_timer(PRIMARY_TIMEOUT);
            msg.encode_frame(P::KIND)
        };

        self.sink.broadcast(frame);
    }

    fn batch_len(proposal: &P) -> usize {
        match proposal.clone().into_block() {
            Block::Request(rb) => rb.requests.len(),
            _ => 0,
        }
    }

    /// Arms the round timer; returns the ticket a fire must match.
    fn arm_timer(self: &Arc<Self>, after: std::time::Duration) -> u64 {
        let ticket = self.ticket_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let this = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(manager) = this.upgrade() {
                manager.on_timer_fired(ticket);
            }
        });
        ticket
    }

    fn cancel_timer(&self, primary: &mut PrimaryState<P>) {
        primary.timer_ticket = self.ticket_counter.fetch_add(1, Ordering::AcqRel) + 1;
    }

    fn on_timer_fired(self: &Arc<Self>, ticket: u64) {
        let mut primary = self.primary.lock();
        if primary.timer_ticket != ticket {
            // Cancelled; late fire is a no-op.
            return;
        }
        match primary.round.state() {
            RoundState::PrePrepare | RoundState::PostPrepare => {
                primary.round.recall();
                // The forfeited proposal goes back to the queue front.
                if let Some(proposal) = primary.current.take() {
                    primary.queue.push_front(proposal);
                }
                primary.timer_ticket = self.arm_timer(RECALL_TIMEOUT);
            }
            RoundState::Recall => {
                primary.round.set_state(RoundState::Void);
                drop(primary);
                self.try_initiate();
            }
            _ => {}
        }
    }

    /// Entry point for every framed message arriving from peer `from`.
    pub fn on_message(self: &Arc<Self>, from: DelegateId, msg: ConsensusMessage) {
        match msg {
            ConsensusMessage::PrePrepare(m) => self.on_pre_prepare(from, m),
            ConsensusMessage::Prepare(m) => self.on_prepare(from, m),
            ConsensusMessage::PostPrepare(m) => self.on_post_prepare(from, m),
            ConsensusMessage::Commit(m) => self.on_commit(from, m),
            ConsensusMessage::PostCommit(m) => self.on_post_commit(from, m),
            ConsensusMessage::Rejection(m) => self.on_rejection(from, m),
            other => {
                trace!(kind = ?other.message_type(), %from, "unhandled message kind");
            }
        }
    }

    // Backup path -----------------------------------------------------

    fn on_pre_prepare(self: &Arc<Self>, from: DelegateId, msg: PrePrepareMsg) {
        let Some(proposal) = P::from_block(msg.block) else {
            warn!(%from, "pre-prepare with mismatched block kind");
            return;
        };

        if proposal.primary_delegate() != from {
            warn!(%from, claimed = proposal.primary_delegate(), "pre-prepare from unexpected primary");
            return;
        }

        let digest = proposal.digest();
        let Some(key) = self.key_of(from) else {
            return;
        };
        if !verify_share(&digest, &msg.signature, key) {
            self.send_rejection(from, digest, RejectionReason::BadSignature, Vec::new());
            return;
        }

        if proposal.epoch_number() != self.epoch_number {
            let reason = if proposal.epoch_number() == self.epoch_number + 1 {
                RejectionReason::NewEpoch
            } else {
                RejectionReason::InvalidEpoch
            };
            self.send_rejection(from, digest, reason, Vec::new());
            return;
        }

        match self.driver.validate(&proposal) {
            Ok(()) => {
                let reply = {
                    let mut backups = self.backups.lock();
                    let round = backups
                        .entry(from)
                        .or_insert_with(|| BackupRound::new(from));
                    match round.on_pre_prepare(proposal) {
                        BackupStep::SendPrepare { digest } => {
                            let share = self.keypair.sign(&digest);
                            Some(ConsensusMessage::Prepare(PrepareMsg {
                                previous: digest,
                                signature: share,
                            }))
                        }
                        _ => None,
                    }
                };
                if let Some(reply) = reply {
                    self.sink.send_to(from, reply.encode_frame(P::KIND));
                }
            }
            Err((reason, map)) => {
                debug!(%from, ?reason, "rejecting pre-prepare");
                if let Some(round) = self.backups.lock().get_mut(&from) {
                    round.on_pre_prepare_rejected();
                }
                self.send_rejection(from, digest, reason, map);
            }
        }
    }

    fn send_rejection(
        &self,
        to: DelegateId,
        digest: Buf32,
        reason: RejectionReason,
        rejection_map: Vec<bool>,
    ) {
        let share = self.keypair.sign(&digest);
        let msg = ConsensusMessage::Rejection(RejectionMsg {
            previous: digest,
            reason,
            rejection_map,
            signature: share,
        });
        self.sink.send_to(to, msg.encode_frame(P::KIND));
    }

    fn on_post_prepare(self: &Arc<Self>, from: DelegateId, msg: PostPrepareMsg) {
        let step = {
            let mut backups = self.backups.lock();
            let Some(round) = backups.get_mut(&from) else {
                return;
            };
            if msg.previous != round.pre_prepare_hash() {
                trace!(%from, "post-prepare for unknown round");
                return;
            }
            if !self.verify_committee_aggregate(&msg.previous, &msg.agg) {
                warn!(%from, "post-prepare aggregate failed verification");
                return;
            }
            let pp_digest = Self::post_prepare_digest(&msg.previous, &msg.agg);
            round.store_prepare_agg(msg.agg, pp_digest);
            round.on_post_prepare(pp_digest)
        };

        if let BackupStep::SendCommit { digest } = step {
            let share = self.keypair.sign(&digest);
            let reply = ConsensusMessage::Commit(CommitMsg {
                previous: digest,
                signature: share,
            });
            self.sink.send_to(from, reply.encode_frame(P::KIND));
        }
    }

    fn on_post_commit(self: &Arc<Self>, from: DelegateId, msg: PostCommitMsg) {
        let sealed = {
            let mut backups = self.backups.lock();
            let Some(round) = backups.get_mut(&from) else {
                return;
            };
            let Some(pp_digest) = round.post_prepare_hash() else {
                trace!(%from, "post-commit without post-prepare");
                return;
            };
            if msg.previous != pp_digest {
                trace!(%from, "post-commit for unknown round");
                return;
            }
            if !self.verify_committee_aggregate(&pp_digest, &msg.agg) {
                warn!(%from, "post-commit aggregate failed verification");
                return;
            }
            let seal = round.prepare_agg();
            match round.on_post_commit() {
                BackupStep::Apply { mut proposal } => {
                    if let Some(agg) = seal {
                        proposal.seal(agg);
                    }
                    Some(proposal)
                }
                _ => None,
            }
        };

        if let Some(proposal) = sealed {
            self.finish_sealed(proposal);
        }
    }

    /// Verifies a round aggregate against the committee subset in the
    /// bitmap and checks the weighted quorum of the subset.
    fn verify_committee_aggregate(&self, digest: &Buf32, agg: &AggSignature) -> bool {
        let mut vote = 0u128;
        let mut stake = 0u128;
        let mut resolved = Vec::with_capacity(NUM_DELEGATES);
        for idx in 0..NUM_DELEGATES {
            let marked = agg.map & (1u32 << idx) != 0;
            let key = self.committee_keys[idx].clone();
            if marked {
                if key.is_none() {
                    return false;
                }
                let w = self.quorum.weight_of(idx as DelegateId);
                vote += w.vote;
                stake += w.stake;
            }
            resolved.push(key);
        }
        if !self.quorum.reached(vote, stake) {
            return false;
        }

        // Unmarked slots may lack keys; pad them with any present key, the
        // verifier only reads marked positions.
        let Some(pad) = resolved.iter().flatten().next().cloned() else {
            return false;
        };
        let committee: Vec<BlsPubKey> = resolved
            .into_iter()
            .map(|k| k.unwrap_or_else(|| pad.clone()))
            .collect();
        verify_aggregate(digest, agg.map, &agg.sig, &committee)
    }

    // Primary path ----------------------------------------------------

    fn on_prepare(self: &Arc<Self>, from: DelegateId, msg: PrepareMsg) {
        let outcome = {
            let mut primary = self.primary.lock();
            if msg.previous != primary.round.pre_prepare_hash() {
                trace!(%from, "prepare for stale round");
                return;
            }
            let Some(key) = self.key_of(from) else { return };
            if !verify_share(&msg.previous, &msg.signature, key) {
                warn!(%from, "invalid prepare share");
                return;
            }
            primary.round.on_prepare(from, msg.signature)
        };

        if let Accumulated::Quorum(shares) = outcome {
            self.reach_post_prepare(shares);
        }
    }

    fn reach_post_prepare(self: &Arc<Self>, shares: Vec<(DelegateId, DelegateSig)>) {
        let frame = {
            let mut primary = self.primary.lock();
            let Ok((map, sig)) = aggregate_shares(&shares) else {
                error!("failed to aggregate prepare shares after quorum");
                return;
            };
            let agg = AggSignature::new(map, sig);
            let pre_prepare_hash = primary.round.pre_prepare_hash();
            let pp_digest = Self::post_prepare_digest(&pre_prepare_hash, &agg);
            let own_commit = self.keypair.sign(&pp_digest);

            primary.prepare_agg = Some(agg);
            primary.round.advance_post_prepare(pp_digest, own_commit);
            primary.timer_ticket = self.arm_timer(PRIMARY_TIMEOUT);

            ConsensusMessage::PostPrepare(PostPrepareMsg {
                previous: pre_prepare_hash,
                agg,
            })
            .encode_frame(P::KIND)
        };
        self.sink.broadcast(frame);
    }

    fn on_commit(self: &Arc<Self>, from: DelegateId, msg: CommitMsg) {
        let outcome = {
            let mut primary = self.primary.lock();
            if msg.previous != primary.round.post_prepare_hash() {
                trace!(%from, "commit for stale round");
                return;
            }
            let Some(key) = self.key_of(from) else { return };
            if !verify_share(&msg.previous, &msg.signature, key) {
                warn!(%from, "invalid commit share");
                return;
            }
            primary.round.on_commit(from, msg.signature)
        };

        if let Accumulated::Quorum(shares) = outcome {
            self.reach_post_commit(shares);
        }
    }

    fn reach_post_commit(self: &Arc<Self>, shares: Vec<(DelegateId, DelegateSig)>) {
        let (frame, sealed) = {
            let mut primary = self.primary.lock();
            let Ok((map, sig)) = aggregate_shares(&shares) else {
                error!("failed to aggregate commit shares after quorum");
                return;
            };
            let commit_agg = AggSignature::new(map, sig);
            let pp_digest = primary.round.post_prepare_hash();

            self.cancel_timer(&mut primary);
            primary.round.advance_post_commit();
            primary.round.set_state(RoundState::Void);

            let Some(mut proposal) = primary.current.take() else {
                return;
            };
            // The block seal is the prepare-phase aggregate: it verifies
            // over the block digest.
            let seal = primary.prepare_agg.take().unwrap_or(commit_agg);
            proposal.seal(seal);

            let msg = ConsensusMessage::PostCommit(PostCommitMsg {
                previous: pp_digest,
                agg: commit_agg,
            });
            (msg.encode_frame(P::KIND), proposal)
        };

        self.sink.broadcast(frame);
        self.finish_sealed(sealed);
        self.try_initiate();
    }

    /// Applies and announces a sealed proposal; both roles converge here.
    fn finish_sealed(self: &Arc<Self>, proposal: P) {
        let block = Arc::new(proposal.clone().into_block());
        if let Err(e) = self.driver.apply(&proposal) {
            error!(err = %e, "failed to apply sealed block");
            return;
        }
        let _ = self.sealed_tx.send(block);
    }

    // Rejection path --------------------------------------------------

    fn on_rejection(self: &Arc<Self>, from: DelegateId, msg: RejectionMsg) {
        let recut = {
            let mut primary = self.primary.lock();
            if primary.round.state() != RoundState::PrePrepare {
                trace!(%from, "rejection outside pre-prepare");
                return;
            }
            if msg.previous != primary.round.pre_prepare_hash() {
                return;
            }
            let Some(key) = self.key_of(from) else { return };
            if !verify_share(&msg.previous, &msg.signature, key) {
                warn!(%from, "invalid rejection share");
                return;
            }

            primary.round.on_rejection_counted(from);
            if let Some(tracker) = primary.rejections.as_mut() {
                match msg.reason {
                    RejectionReason::ContainsInvalidRequest => {
                        tracker.on_batch_rejection(from, &self.quorum, &msg.rejection_map);
                    }
                    RejectionReason::NewEpoch => tracker.record_new_epoch(),
                    _ => {}
                }
            }

            let prepare = primary.round.prepare_weight();
            primary.round.all_delegates_responded()
                || primary
                    .rejections
                    .as_ref()
                    .map(|t| t.all_slots_resolved(prepare, &self.quorum))
                    .unwrap_or(false)
        };

        if recut {
            self.on_pre_prepare_rejected();
        }
    }

    /// The round cannot complete as proposed: recut the batch by support
    /// sets and queue the re-proposals, or hand over to the incoming epoch.
    fn on_pre_prepare_rejected(self: &Arc<Self>) {
        let handover;
        {
            let mut primary = self.primary.lock();
            self.cancel_timer(&mut primary);

            let tracker = primary.rejections.take();
            let current = primary.current.take();

            handover = tracker
                .as_ref()
                .map(|t| t.new_epoch_handover())
                .unwrap_or(false);

            if !handover {
                if let (Some(tracker), Some(current)) = (tracker, current) {
                    let prepare = primary.round.prepare_weight();
                    let batches = tracker.partition(prepare, &self.quorum);
                    for proposal in current.recut(&batches).into_iter().rev() {
                        primary.queue.push_front(proposal);
                    }
                }
            } else if let Some(current) = current {
                // The incoming primary will sequence it.
                primary.queue.push_front(current);
            }

            primary.round.set_state(RoundState::Void);
        }

        if handover {
            info!("third of committee reports new epoch, handing queue over");
            self.handover.store(true, Ordering::Release);
            self.handover_notify.notify_waiters();
        } else {
            self.try_initiate();
        }
    }
}
