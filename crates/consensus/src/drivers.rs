//! Persistence-backed [`ProposalDriver`] implementations for the three
//! chain types.

use std::sync::Arc;

use conclave_db::LedgerDb;
use conclave_persistence::{EpochPersistence, MicroPersistence, RequestPersistence};
use conclave_primitives::prelude::*;
use conclave_state::block::{EpochBlock, MicroBlock, RequestBlock};
use conclave_state::process::{ProcessResult, ValidationStatus};
use conclave_wire::RejectionReason;
use tracing::*;

use crate::manager::ProposalDriver;

fn reason_of(status: &ValidationStatus) -> RejectionReason {
    match status.reason {
        Some(ProcessResult::GapPrevious) => RejectionReason::InvalidPreviousHash,
        Some(ProcessResult::InvalidEpoch) => RejectionReason::InvalidEpoch,
        Some(ProcessResult::WrongSequenceNumber) => RejectionReason::WrongSequenceNumber,
        Some(ProcessResult::ClockDrift) => RejectionReason::ClockDrift,
        Some(_) => RejectionReason::ContainsInvalidRequest,
        None => RejectionReason::Void,
    }
}

pub struct RequestDriver {
    db: Arc<LedgerDb>,
    persistence: Arc<RequestPersistence>,
    delegate_id: DelegateId,
}

impl RequestDriver {
    pub fn new(
        db: Arc<LedgerDb>,
        persistence: Arc<RequestPersistence>,
        delegate_id: DelegateId,
    ) -> Self {
        Self {
            db,
            persistence,
            delegate_id,
        }
    }
}

impl ProposalDriver<RequestBlock> for RequestDriver {
    fn prepare_for_round(&self, proposal: &mut RequestBlock) {
        let mut txn = self.db.begin();
        let tip = txn.rb_tip_get(self.delegate_id).ok().flatten();

        match tip {
            Some(tip_hash) => {
                let same_epoch = txn
                    .request_block_get(&tip_hash)
                    .ok()
                    .flatten()
                    .map(|prev| {
                        proposal.prefix.sequence = prev.sequence() + 1;
                        prev.epoch_number() == proposal.epoch_number()
                    })
                    .unwrap_or(false);
                if same_epoch {
                    proposal.prefix.previous = tip_hash;
                } else {
                    // Epoch-first block restarts the chain linkage.
                    proposal.prefix.previous = Buf32::zero();
                    proposal.prefix.sequence = 0;
                }
            }
            None => {
                proposal.prefix.previous = Buf32::zero();
                proposal.prefix.sequence = 0;
            }
        }
        proposal.prefix.timestamp = unix_time_ms();
    }

    fn validate(
        &self,
        proposal: &RequestBlock,
    ) -> Result<(), (RejectionReason, Vec<bool>)> {
        // Clock sanity before any semantic work.
        let now = unix_time_ms();
        let drift = CLOCK_DRIFT.as_millis() as u64;
        if proposal.prefix.timestamp > now + drift {
            return Err((RejectionReason::ClockDrift, Vec::new()));
        }

        let mut status = ValidationStatus::default();
        if self.persistence.validate_pre_prepare(proposal, &mut status) {
            return Ok(());
        }

        let mut map = vec![false; proposal.requests.len()];
        for (index, code) in &status.requests {
            trace!(index, %code, "request slot rejected");
            if let Some(slot) = map.get_mut(*index) {
                *slot = true;
            }
        }
        Err((RejectionReason::ContainsInvalidRequest, map))
    }

    fn apply(&self, proposal: &RequestBlock) -> anyhow::Result<()> {
        self.persistence.apply_updates(proposal).map_err(|e| {
            conclave_persistence::halt_if_fatal(&e);
            e
        })?;
        Ok(())
    }
}

pub struct MicroDriver {
    persistence: Arc<MicroPersistence>,
}

impl MicroDriver {
    pub fn new(persistence: Arc<MicroPersistence>) -> Self {
        Self { persistence }
    }
}

impl ProposalDriver<MicroBlock> for MicroDriver {
    fn prepare_for_round(&self, _proposal: &mut MicroBlock) {
        // Built against current state right before queueing.
    }

    fn validate(&self, proposal: &MicroBlock) -> Result<(), (RejectionReason, Vec<bool>)> {
        let mut status = ValidationStatus::default();
        if self.persistence.verify_content(proposal, &mut status) {
            Ok(())
        } else {
            Err((reason_of(&status), Vec::new()))
        }
    }

    fn apply(&self, proposal: &MicroBlock) -> anyhow::Result<()> {
        self.persistence.apply_updates(proposal).map_err(|e| {
            conclave_persistence::halt_if_fatal(&e);
            e
        })?;
        Ok(())
    }
}

pub struct EpochDriver {
    persistence: Arc<EpochPersistence>,
}

impl EpochDriver {
    pub fn new(persistence: Arc<EpochPersistence>) -> Self {
        Self { persistence }
    }
}

impl ProposalDriver<EpochBlock> for EpochDriver {
    fn prepare_for_round(&self, _proposal: &mut EpochBlock) {}

    fn validate(&self, proposal: &EpochBlock) -> Result<(), (RejectionReason, Vec<bool>)> {
        let mut status = ValidationStatus::default();
        if self.persistence.verify_content(proposal, &mut status) {
            Ok(())
        } else {
            Err((reason_of(&status), Vec::new()))
        }
    }

    fn apply(&self, proposal: &EpochBlock) -> anyhow::Result<()> {
        self.persistence.apply_updates(proposal).map_err(|e| {
            conclave_persistence::halt_if_fatal(&e);
            e
        })?;
        Ok(())
    }
}
