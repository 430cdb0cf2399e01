//! Epoch block construction, validation and application.

use std::sync::Arc;

use conclave_db::{LedgerDb, LedgerTxn};
use conclave_primitives::prelude::*;
use conclave_state::block::{DelegateEntry, EpochBlock};
use conclave_state::process::{ProcessResult, ValidationStatus};
use tracing::*;

use crate::elections;
use crate::errors::{PersistResult, PersistenceError};
use crate::rewards;

pub struct EpochPersistence {
    db: Arc<LedgerDb>,
}

impl EpochPersistence {
    pub fn new(db: Arc<LedgerDb>) -> Self {
        Self { db }
    }

    fn current_eb(
        txn: &mut LedgerTxn<'_>,
    ) -> PersistResult<(Buf32, EpochBlock)> {
        let hash = txn
            .eb_tip_get()?
            .ok_or_else(|| PersistenceError::Fatal("no epoch block tip".into()))?;
        let block = txn
            .epoch_block_get(&hash)?
            .ok_or_else(|| PersistenceError::Fatal(format!("missing epoch block {hash}")))?;
        Ok((hash, block))
    }

    /// Builds the epoch block closing the current epoch: the committee is
    /// the election outcome, the micro tip is the closing `last_micro_block`.
    pub fn build(&self, delegate: DelegateId) -> PersistResult<EpochBlock> {
        let mut txn = self.db.begin();
        let (prev_hash, prev) = Self::current_eb(&mut txn)?;

        let mb_tip = txn
            .mb_tip_get()?
            .ok_or_else(|| PersistenceError::Fatal("no micro block tip".into()))?;

        let delegates = elections::election_results(&mut txn, &prev.delegates)?;

        let mut block = EpochBlock::default();
        block.prefix.primary_delegate = delegate;
        block.prefix.epoch_number = prev.epoch_number() + 1;
        block.prefix.sequence = prev.epoch_number() + 1;
        block.prefix.previous = prev_hash;
        block.prefix.timestamp = unix_time_ms();
        block.micro_block_tip = mb_tip;
        block.delegates = delegates;
        Ok(block)
    }

    /// Structural validation against the stored chains and the election
    /// outcome.
    pub fn verify_content(&self, block: &EpochBlock, status: &mut ValidationStatus) -> bool {
        let mut txn = self.db.begin();

        let Ok(Some(prev_hash)) = txn.eb_tip_get() else {
            status.reason = Some(ProcessResult::GapPrevious);
            return false;
        };
        if block.prefix.previous != prev_hash {
            status.reason = Some(ProcessResult::GapPrevious);
            return false;
        }
        let Ok(Some(prev)) = txn.epoch_block_get(&prev_hash) else {
            status.reason = Some(ProcessResult::GapPrevious);
            return false;
        };

        if block.epoch_number() != prev.epoch_number() + 1 {
            status.reason = Some(ProcessResult::InvalidEpoch);
            return false;
        }

        // The sealed micro tip must be our tip, and must close its epoch.
        match txn.mb_tip_get() {
            Ok(Some(mb_tip)) if block.micro_block_tip == mb_tip => {}
            _ => {
                status.reason = Some(ProcessResult::GapPrevious);
                return false;
            }
        }
        match txn.micro_block_get(&block.micro_block_tip) {
            Ok(Some(mb)) if mb.last_micro_block => {}
            _ => {
                status.reason = Some(ProcessResult::InvalidRequest);
                return false;
            }
        }

        let Ok(expected) = elections::election_results(&mut txn, &prev.delegates) else {
            status.reason = Some(ProcessResult::InvalidRequest);
            return false;
        };
        if !committees_equal(&expected, &block.delegates) {
            status.reason = Some(ProcessResult::InvalidRequest);
            return false;
        }

        true
    }

    pub fn block_exists(&self, hash: &Buf32) -> bool {
        self.db.begin().epoch_block_exists(hash)
    }

    /// Applies a post-committed epoch block: seals the committee, accrues
    /// rewards and resets election state.
    pub fn apply_updates(&self, block: &EpochBlock) -> PersistResult<Buf32> {
        let hash = block.digest();
        let mut txn = self.db.begin();

        if txn.epoch_block_exists(&hash) {
            debug!(%hash, "epoch block already applied");
            return Ok(hash);
        }

        if !block.prefix.previous.is_zero() {
            let mut prev = txn
                .epoch_block_get(&block.prefix.previous)?
                .ok_or(PersistenceError::MissingPredecessor(block.prefix.previous))?;
            prev.next = hash;
            txn.epoch_block_put(&block.prefix.previous, &prev)?;
        }

        txn.epoch_block_put(&hash, block)?;
        txn.eb_tip_put(&hash)?;

        rewards::record_epoch_rewards(&mut txn, block)?;
        elections::conclude_election(&mut txn)?;

        txn.commit()?;
        info!(%hash, epoch = block.epoch_number(), "applied epoch block");
        Ok(hash)
    }
}

fn committees_equal(
    a: &[DelegateEntry; NUM_DELEGATES],
    b: &[DelegateEntry; NUM_DELEGATES],
) -> bool {
    a.iter()
        .zip(b.iter())
        .all(|(x, y)| x.account == y.account && x.vote == y.vote && x.stake == y.stake)
}
