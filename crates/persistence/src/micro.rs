//! Micro block construction, validation and application.
//!
//! The cut-off rule: a micro block only covers request blocks stamped
//! before `previous_mb.timestamp + MICROBLOCK_PROPOSAL_TIME`.  The
//! genesis-adjacent micro block has no trustworthy base timestamp and
//! re-bases on the minimum observed request-block timestamp instead.

use std::sync::Arc;

use conclave_db::{LedgerDb, LedgerTxn};
use conclave_primitives::prelude::*;
use conclave_state::block::MicroBlock;
use conclave_state::process::{ProcessResult, ValidationStatus};
use tracing::*;

use crate::elections;
use crate::errors::{PersistResult, PersistenceError};

/// Epoch number of the genesis epoch block.
pub const GENESIS_EPOCH: u32 = 0;

pub struct MicroPersistence {
    db: Arc<LedgerDb>,
}

impl MicroPersistence {
    pub fn new(db: Arc<LedgerDb>) -> Self {
        Self { db }
    }

    /// Walks one delegate's request chain from `start` back to (but not
    /// including) `end`, yielding `(timestamp, hash)` pairs.
    fn chain_entries(
        txn: &mut LedgerTxn<'_>,
        start: &Buf32,
        end: &Buf32,
    ) -> PersistResult<Vec<(u64, Buf32)>> {
        let mut entries = Vec::new();
        let mut cursor = *start;
        while !cursor.is_zero() && cursor != *end {
            let Some(block) = txn.request_block_get(&cursor)? else {
                warn!(hash = %cursor, "request chain walk hit missing block");
                break;
            };
            entries.push((block.prefix.timestamp, cursor));
            cursor = block.prefix.previous;
        }
        Ok(entries)
    }

    /// Selects per-delegate tips with the cut-off taken from the previous
    /// micro block's timestamp.
    fn tips_fast(
        txn: &mut LedgerTxn<'_>,
        start: &[Buf32; NUM_DELEGATES],
        end: &[Buf32; NUM_DELEGATES],
        base_timestamp: u64,
    ) -> PersistResult<[Buf32; NUM_DELEGATES]> {
        let cutoff = base_timestamp + MICROBLOCK_PROPOSAL_TIME.as_millis() as u64;
        let mut tips = [Buf32::zero(); NUM_DELEGATES];
        for delegate in 0..NUM_DELEGATES {
            for (timestamp, hash) in
                Self::chain_entries(txn, &start[delegate], &end[delegate])?
            {
                if timestamp < cutoff && tips[delegate].is_zero() {
                    tips[delegate] = hash;
                }
            }
            if tips[delegate].is_zero() {
                tips[delegate] = end[delegate];
            }
        }
        Ok(tips)
    }

    /// Genesis-adjacent fallback: re-bases the cut-off on the minimum
    /// observed request-block timestamp.
    fn tips_slow(
        txn: &mut LedgerTxn<'_>,
        start: &[Buf32; NUM_DELEGATES],
        end: &[Buf32; NUM_DELEGATES],
    ) -> PersistResult<[Buf32; NUM_DELEGATES]> {
        let mut per_delegate: Vec<Vec<(u64, Buf32)>> = Vec::with_capacity(NUM_DELEGATES);
        let mut min_timestamp = unix_time_ms() + CLOCK_DRIFT.as_millis() as u64;
        for delegate in 0..NUM_DELEGATES {
            let entries = Self::chain_entries(txn, &start[delegate], &end[delegate])?;
            if let Some(min) = entries.iter().map(|(t, _)| *t).min() {
                min_timestamp = min_timestamp.min(min);
            }
            per_delegate.push(entries);
        }

        let cutoff = min_timestamp + MICROBLOCK_PROPOSAL_TIME.as_millis() as u64;
        let mut tips = [Buf32::zero(); NUM_DELEGATES];
        for (delegate, entries) in per_delegate.iter().enumerate() {
            for (timestamp, hash) in entries {
                if *timestamp < cutoff && tips[delegate].is_zero() {
                    tips[delegate] = *hash;
                }
            }
            if tips[delegate].is_zero() {
                tips[delegate] = end[delegate];
            }
        }
        Ok(tips)
    }

    /// Builds the next micro block over the current store state.
    pub fn build(
        &self,
        delegate: DelegateId,
        last_micro_block: bool,
    ) -> PersistResult<MicroBlock> {
        let mut txn = self.db.begin();

        let prev_hash = txn
            .mb_tip_get()?
            .ok_or_else(|| PersistenceError::Fatal("no micro block tip".into()))?;
        let prev = txn
            .micro_block_get(&prev_hash)?
            .ok_or_else(|| PersistenceError::Fatal(format!("missing micro block {prev_hash}")))?;

        let mut start = [Buf32::zero(); NUM_DELEGATES];
        for d in 0..NUM_DELEGATES {
            if let Some(tip) = txn.rb_tip_get(d as DelegateId)? {
                start[d] = tip;
            }
        }

        let tips = if prev.epoch_number() == GENESIS_EPOCH {
            Self::tips_slow(&mut txn, &start, &prev.tips)?
        } else {
            Self::tips_fast(&mut txn, &start, &prev.tips, prev.prefix.timestamp)?
        };

        // First micro block of a new epoch follows the one the latest epoch
        // block points at.
        let first_of_epoch = match txn.eb_tip_get()? {
            Some(eb_hash) => txn
                .epoch_block_get(&eb_hash)?
                .map(|eb| eb.micro_block_tip == prev_hash)
                .unwrap_or(false),
            None => false,
        };

        let mut block = MicroBlock::default();
        block.prefix.primary_delegate = delegate;
        block.prefix.epoch_number = if first_of_epoch {
            prev.epoch_number() + 1
        } else {
            prev.epoch_number()
        };
        block.prefix.sequence = if first_of_epoch { 0 } else { prev.sequence() + 1 };
        block.prefix.previous = prev_hash;
        block.prefix.timestamp = unix_time_ms();
        block.last_micro_block = last_micro_block;
        block.tips = tips;

        Ok(block)
    }

    /// Structural validation against the stored chains.
    pub fn verify_content(&self, block: &MicroBlock, status: &mut ValidationStatus) -> bool {
        let mut txn = self.db.begin();

        let Ok(Some(prev_hash)) = txn.mb_tip_get() else {
            status.reason = Some(ProcessResult::GapPrevious);
            return false;
        };
        if block.prefix.previous != prev_hash {
            status.reason = Some(ProcessResult::GapPrevious);
            return false;
        }
        let Ok(Some(prev)) = txn.micro_block_get(&prev_hash) else {
            status.reason = Some(ProcessResult::GapPrevious);
            return false;
        };

        // Epoch advances exactly when the predecessor closed its epoch.
        let expect_new_epoch = prev.last_micro_block;
        if expect_new_epoch {
            if block.epoch_number() != prev.epoch_number() + 1 {
                status.reason = Some(ProcessResult::InvalidEpoch);
                return false;
            }
            if block.sequence() != 0 {
                status.reason = Some(ProcessResult::WrongSequenceNumber);
                return false;
            }
        } else {
            if block.epoch_number() != prev.epoch_number() {
                status.reason = Some(ProcessResult::InvalidEpoch);
                return false;
            }
            if block.sequence() != prev.sequence() + 1 {
                status.reason = Some(ProcessResult::WrongSequenceNumber);
                return false;
            }
        }

        // Every referenced tip must already be committed locally.
        for tip in &block.tips {
            if !tip.is_zero() && !txn.request_block_exists(tip) {
                status.reason = Some(ProcessResult::GapPrevious);
                return false;
            }
        }

        true
    }

    pub fn block_exists(&self, hash: &Buf32) -> bool {
        self.db.begin().micro_block_exists(hash)
    }

    /// Applies a post-committed micro block.
    pub fn apply_updates(&self, block: &MicroBlock) -> PersistResult<Buf32> {
        let hash = block.digest();
        let mut txn = self.db.begin();

        if txn.micro_block_exists(&hash) {
            debug!(%hash, "micro block already applied");
            return Ok(hash);
        }

        if !block.prefix.previous.is_zero() {
            let mut prev = txn
                .micro_block_get(&block.prefix.previous)?
                .ok_or(PersistenceError::MissingPredecessor(block.prefix.previous))?;
            prev.next = hash;
            txn.micro_block_put(&block.prefix.previous, &prev)?;
        }

        txn.micro_block_put(&hash, block)?;
        txn.mb_tip_put(&hash)?;

        if block.last_micro_block {
            // Votes arriving after the closing proposal no longer count.
            elections::mark_dead_period(&mut txn, block.epoch_number())?;
        }

        txn.commit()?;
        info!(%hash, epoch = block.epoch_number(), sequence = block.sequence(), last = block.last_micro_block, "applied micro block");
        Ok(hash)
    }
}
