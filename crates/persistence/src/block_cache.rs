//! Cache of p2p-delivered post-committed blocks whose predecessors have not
//! landed yet.
//!
//! Blocks are held per epoch, ordered, and drained in dependency order:
//! request chains round-robin across delegates, then micro blocks in
//! sequence, then the epoch block.  Aggregate signatures are verified on
//! admission; content is re-validated just before application.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use conclave_primitives::prelude::*;
use conclave_state::block::{Block, EpochBlock, MicroBlock, RequestBlock};
use conclave_state::process::ValidationStatus;
use parking_lot::Mutex;
use tracing::*;

use crate::epoch::EpochPersistence;
use crate::micro::MicroPersistence;
use crate::request::RequestPersistence;

/// Verifies a sealed block's aggregate signature against the committee of
/// its epoch.  The node wires this to the crypto layer and delegate table;
/// tests may accept everything.
pub trait AggVerifier: Send + Sync {
    fn verify_block(&self, block: &Block) -> bool;
}

/// Per-epoch slot in the cache.
struct CachedEpoch {
    epoch_num: u32,
    eb: Option<EpochBlock>,
    mbs: VecDeque<MicroBlock>,
    rbs: [VecDeque<RequestBlock>; NUM_DELEGATES],
}

impl CachedEpoch {
    fn new(epoch_num: u32) -> Self {
        Self {
            epoch_num,
            eb: None,
            mbs: VecDeque::new(),
            rbs: std::array::from_fn(|_| VecDeque::new()),
        }
    }
}

struct CacheState {
    /// Oldest epoch first.
    epochs: VecDeque<CachedEpoch>,
    cached_blocks: HashSet<Buf32>,
}

pub struct BlockCache {
    state: Mutex<CacheState>,
    rb_handler: Arc<RequestPersistence>,
    mb_handler: Arc<MicroPersistence>,
    eb_handler: Arc<EpochPersistence>,
    verifier: Arc<dyn AggVerifier>,
}

impl BlockCache {
    pub fn new(
        rb_handler: Arc<RequestPersistence>,
        mb_handler: Arc<MicroPersistence>,
        eb_handler: Arc<EpochPersistence>,
        verifier: Arc<dyn AggVerifier>,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState {
                epochs: VecDeque::new(),
                cached_blocks: HashSet::new(),
            }),
            rb_handler,
            mb_handler,
            eb_handler,
            verifier,
        }
    }

    pub fn is_block_cached(&self, hash: &Buf32) -> bool {
        self.state.lock().cached_blocks.contains(hash)
    }

    pub fn add(&self, block: Block) -> bool {
        match block {
            Block::Request(rb) => self.add_rb(rb),
            Block::Micro(mb) => self.add_mb(mb),
            Block::Epoch(eb) => self.add_eb(eb),
        }
    }

    /// Index of the epoch slot for `epoch_num`, creating it in order.
    fn epoch_slot(state: &mut CacheState, epoch_num: u32) -> usize {
        if let Some(pos) = state.epochs.iter().position(|e| e.epoch_num == epoch_num) {
            return pos;
        }
        let pos = state
            .epochs
            .iter()
            .position(|e| e.epoch_num > epoch_num)
            .unwrap_or(state.epochs.len());
        state.epochs.insert(pos, CachedEpoch::new(epoch_num));
        pos
    }

    pub fn add_rb(&self, block: RequestBlock) -> bool {
        let hash = block.digest();
        if !self.verifier.verify_block(&Block::Request(block.clone())) {
            trace!(%hash, "request block failed aggregate verification");
            return false;
        }

        let delegate = block.delegate() as usize;
        let unblocks = {
            let mut state = self.state.lock();
            if self.rb_handler.block_exists(&hash) || !state.cached_blocks.insert(hash) {
                return true;
            }

            let slot = Self::epoch_slot(&mut state, block.epoch_number());
            let list = &mut state.epochs[slot].rbs[delegate];
            let pos = list
                .iter()
                .position(|b| b.sequence() >= block.sequence())
                .unwrap_or(list.len());
            if list.get(pos).map(|b| b.sequence()) == Some(block.sequence()) {
                // duplicate sequence
                state.cached_blocks.remove(&hash);
                return true;
            }
            let at_head = pos == 0;
            list.insert(pos, block);
            at_head
        };

        if unblocks {
            self.validate(delegate as DelegateId);
        }
        true
    }

    pub fn add_mb(&self, block: MicroBlock) -> bool {
        let hash = block.digest();
        if !self.verifier.verify_block(&Block::Micro(block.clone())) {
            trace!(%hash, "micro block failed aggregate verification");
            return false;
        }

        let unblocks = {
            let mut state = self.state.lock();
            if self.mb_handler.block_exists(&hash) || !state.cached_blocks.insert(hash) {
                return true;
            }

            let is_new_epoch = !state
                .epochs
                .iter()
                .any(|e| e.epoch_num == block.epoch_number());
            let slot = Self::epoch_slot(&mut state, block.epoch_number());
            let list = &mut state.epochs[slot].mbs;
            let pos = list
                .iter()
                .position(|b| b.sequence() >= block.sequence())
                .unwrap_or(list.len());
            if list.get(pos).map(|b| b.sequence()) == Some(block.sequence()) {
                state.cached_blocks.remove(&hash);
                return true;
            }
            let at_head = pos == 0;
            list.insert(pos, block);
            at_head || is_new_epoch
        };

        if unblocks {
            self.validate(0);
        }
        true
    }

    pub fn add_eb(&self, block: EpochBlock) -> bool {
        let hash = block.digest();
        if !self.verifier.verify_block(&Block::Epoch(block.clone())) {
            trace!(%hash, "epoch block failed aggregate verification");
            return false;
        }

        {
            let mut state = self.state.lock();
            if self.eb_handler.block_exists(&hash) || !state.cached_blocks.insert(hash) {
                return true;
            }
            let slot = Self::epoch_slot(&mut state, block.epoch_number());
            if state.epochs[slot].eb.is_some() {
                state.cached_blocks.remove(&hash);
                return true;
            }
            state.epochs[slot].eb = Some(block);
        }

        // An epoch block can always complete an epoch.
        self.validate(0);
        true
    }

    /// Drains the cache oldest-epoch first, applying everything whose
    /// predecessors have landed.
    pub fn validate(&self, start_delegate: DelegateId) {
        let mut state = self.state.lock();
        let mut epoch_idx = 0;

        while epoch_idx < state.epochs.len() {
            self.drain_request_chains(&mut state, epoch_idx, start_delegate);
            let (last_mb, mbs_empty) = self.drain_micro_chain(&mut state, epoch_idx);

            let mut epoch_done = false;
            if last_mb || mbs_empty {
                epoch_done = self.try_finish_epoch(&mut state, epoch_idx);
            }

            if epoch_done {
                epoch_idx = 0;
                continue;
            }

            // Two-tip overlap: during the first minutes of a new epoch both
            // the retiring and the incoming primaries fill their first
            // micro intervals; neither epoch has MBs or an EB yet, and we
            // must not treat the older one as stuck.
            let overlap = state.epochs.len() == 2
                && epoch_idx == 0
                && state.epochs[0].eb.is_none()
                && state.epochs[0].mbs.is_empty()
                && state.epochs[1].mbs.is_empty();
            if overlap {
                epoch_idx += 1;
            } else {
                break;
            }
        }

        // Completed epochs leave empty shells behind.
        while let Some(front) = state.epochs.front() {
            let empty = front.eb.is_none()
                && front.mbs.is_empty()
                && front.rbs.iter().all(|l| l.is_empty());
            if empty && state.epochs.len() > 1 {
                state.epochs.pop_front();
            } else {
                break;
            }
        }
    }

    /// Round-robins the delegate request chains, popping heads while they
    /// validate; a failed validation is assumed to be a gap and yields the
    /// turn.  Stops after a full lap without progress.
    fn drain_request_chains(
        &self,
        state: &mut CacheState,
        epoch_idx: usize,
        start_delegate: DelegateId,
    ) {
        let mut delegate = start_delegate as usize % NUM_DELEGATES;
        let mut no_progress = 0;

        while no_progress < NUM_DELEGATES {
            loop {
                let Some(front) = state.epochs[epoch_idx].rbs[delegate].front() else {
                    no_progress += 1;
                    delegate = (delegate + 1) % NUM_DELEGATES;
                    break;
                };

                let mut status = ValidationStatus::default();
                if self.rb_handler.verify_content(front, &mut status) {
                    let block = state.epochs[epoch_idx].rbs[delegate]
                        .pop_front()
                        .expect("cache: checked front");
                    let hash = block.digest();
                    match self.rb_handler.apply_updates(&block) {
                        Ok(_) => {
                            state.cached_blocks.remove(&hash);
                            no_progress = 0;
                        }
                        Err(e) => {
                            crate::errors::halt_if_fatal(&e);
                            error!(%hash, err = %e, "failed to apply cached request block");
                            state.cached_blocks.remove(&hash);
                        }
                    }
                } else {
                    trace!(
                        delegate,
                        reason = ?status.reason,
                        "cached request chain stalled, assuming gap"
                    );
                    no_progress += 1;
                    delegate = (delegate + 1) % NUM_DELEGATES;
                    break;
                }
            }
        }
    }

    fn drain_micro_chain(&self, state: &mut CacheState, epoch_idx: usize) -> (bool, bool) {
        let mbs_empty = state.epochs[epoch_idx].mbs.is_empty();
        let mut last_mb = false;

        while let Some(front) = state.epochs[epoch_idx].mbs.front() {
            let mut status = ValidationStatus::default();
            if !self.mb_handler.verify_content(front, &mut status) {
                trace!(reason = ?status.reason, "cached micro chain stalled");
                break;
            }
            let block = state.epochs[epoch_idx]
                .mbs
                .pop_front()
                .expect("cache: checked front");
            let hash = block.digest();
            last_mb = block.last_micro_block;
            match self.mb_handler.apply_updates(&block) {
                Ok(_) => {
                    state.cached_blocks.remove(&hash);
                }
                Err(e) => {
                    crate::errors::halt_if_fatal(&e);
                    error!(%hash, err = %e, "failed to apply cached micro block");
                    state.cached_blocks.remove(&hash);
                }
            }
        }

        (last_mb, mbs_empty)
    }

    /// Attempts the epoch block; on success the epoch leaves the cache.
    fn try_finish_epoch(&self, state: &mut CacheState, epoch_idx: usize) -> bool {
        let Some(eb) = &state.epochs[epoch_idx].eb else {
            return false;
        };

        let mut status = ValidationStatus::default();
        if !self.eb_handler.verify_content(eb, &mut status) {
            trace!(reason = ?status.reason, "cached epoch block not ready");
            return false;
        }

        let eb = state.epochs[epoch_idx].eb.take().expect("cache: checked eb");
        let hash = eb.digest();
        match self.eb_handler.apply_updates(&eb) {
            Ok(_) => {
                state.cached_blocks.remove(&hash);
                state.epochs.remove(epoch_idx);
                true
            }
            Err(e) => {
                crate::errors::halt_if_fatal(&e);
                error!(%hash, err = %e, "failed to apply cached epoch block");
                state.cached_blocks.remove(&hash);
                false
            }
        }
    }
}
