//! Validation and application of request blocks.
//!
//! `validate_request` runs the ordered semantic checks and returns the
//! first failing code.  `apply_updates` runs the full pipeline inside one
//! store transaction: persist the block and its requests, back-patch the
//! predecessor, then apply each request to the account model.

use std::sync::Arc;

use conclave_db::{LedgerDb, LedgerTxn, StoredRequest};
use conclave_primitives::prelude::*;
use conclave_state::prelude::*;
use parking_lot::Mutex;
use tracing::*;

use crate::elections;
use crate::errors::{PersistResult, PersistenceError};
use crate::reservations::Reservations;
use crate::rewards;
use crate::staking_ops;
use crate::token;

type Check = Result<(), ProcessResult>;

/// Persistence manager for the request-block chain.
pub struct RequestPersistence {
    db: Arc<LedgerDb>,
    reservations: Arc<Reservations>,
    /// Serializes simultaneous receives to the same account.
    destination_mutex: Mutex<()>,
}

impl RequestPersistence {
    pub fn new(db: Arc<LedgerDb>, reservations: Arc<Reservations>) -> Self {
        Self {
            db,
            reservations,
            destination_mutex: Mutex::new(()),
        }
    }

    pub fn db(&self) -> &Arc<LedgerDb> {
        &self.db
    }

    /// The portion of the balance a request moves out of the account, on
    /// top of its fee.
    fn spend_amount(payload: &RequestPayload) -> Amount {
        match payload {
            RequestPayload::Send { amount, .. } => *amount,
            RequestPayload::Stake { amount } => *amount,
            RequestPayload::Proxy {
                amount, lock: true, ..
            } => *amount,
            _ => Amount::ZERO,
        }
    }

    /// Ordered semantic checks for a single request.  Returns the first
    /// failing code; `allow_duplicates` admits the request currently at the
    /// account head (re-validation of sealed batches).
    pub fn validate_request(
        &self,
        txn: &mut LedgerTxn<'_>,
        request: &Request,
        current_epoch: u32,
        allow_duplicates: bool,
    ) -> Check {
        let hash = request.digest();

        if request.origin.is_zero() {
            return Err(ProcessResult::OpenedBurnAccount);
        }

        if request.fee < MIN_TRANSACTION_FEE {
            return Err(ProcessResult::InsufficientFee);
        }

        let account_lock = self.reservations.account_lock(&request.origin);
        let _guard = account_lock.lock();

        let Some(mut info) = txn
            .account_get(&request.origin)
            .map_err(|_| ProcessResult::InvalidRequest)?
        else {
            // Accounts are opened only by receiving, never by sending.
            return Err(ProcessResult::UnknownSourceAccount);
        };

        if request.previous.is_zero() && info.block_count > 0 {
            return Err(ProcessResult::Fork);
        }

        if info.block_count > 0 && !txn.request_exists(&request.previous) {
            debug!(previous = %request.previous, head = %info.head, "gap in source chain");
            return Err(ProcessResult::GapPrevious);
        }

        if request.previous != info.head {
            // A duplicate of the request currently at the head is tolerated
            // when re-validating sealed batches.
            return if hash == info.head {
                if allow_duplicates {
                    Ok(())
                } else {
                    Err(ProcessResult::Old)
                }
            } else {
                Err(ProcessResult::Fork)
            };
        }

        if txn.request_exists(&hash) {
            return Err(ProcessResult::Old);
        }

        // Reservation: set when free, honor an unexpired conflicting one,
        // refresh an expired one.
        if info.reservation.is_zero() {
            info.reservation = hash;
            info.reservation_epoch = current_epoch;
            txn.account_put(&request.origin, &info)
                .map_err(|_| ProcessResult::InvalidRequest)?;
        } else if info.reservation != hash {
            if current_epoch < info.reservation_epoch + RESERVATION_PERIOD {
                return Err(ProcessResult::AlreadyReserved);
            }
            info.reservation = hash;
            info.reservation_epoch = current_epoch;
            txn.account_put(&request.origin, &info)
                .map_err(|_| ProcessResult::InvalidRequest)?;
        }

        let spend = Self::spend_amount(&request.payload);
        let total = spend
            .checked_add(request.fee)
            .ok_or(ProcessResult::InsufficientBalance)?;
        if total > info.balance {
            return Err(ProcessResult::InsufficientBalance);
        }

        self.validate_payload(txn, request, &info, current_epoch)
    }

    fn validate_payload(
        &self,
        txn: &mut LedgerTxn<'_>,
        request: &Request,
        info: &AccountInfo,
        current_epoch: u32,
    ) -> Check {
        match &request.payload {
            RequestPayload::Send { .. } => Ok(()),
            RequestPayload::TokenSend { .. }
            | RequestPayload::Issuance { .. }
            | RequestPayload::Revoke { .. }
            | RequestPayload::AdjustFee { .. }
            | RequestPayload::UpdateController { .. } => {
                token::validate(txn, request, info)
            }
            RequestPayload::ElectionVote { .. }
            | RequestPayload::AnnounceCandidacy { .. }
            | RequestPayload::RenounceCandidacy
            | RequestPayload::StartRepresenting { .. }
            | RequestPayload::StopRepresenting => {
                elections::validate(txn, request, current_epoch)
            }
            RequestPayload::Stake { .. }
            | RequestPayload::Unstake
            | RequestPayload::Proxy { .. } => staking_ops::validate(txn, request, current_epoch),
            RequestPayload::Claim { .. } => rewards::validate(txn, request),
        }
    }

    /// Validates every request of a proposed batch, recording per-slot
    /// failures.  Returns whether the whole batch is acceptable.
    pub fn validate_pre_prepare(
        &self,
        block: &RequestBlock,
        status: &mut ValidationStatus,
    ) -> bool {
        let mut txn = self.db.begin();
        let mut valid = true;
        for (index, request) in block.requests.iter().enumerate() {
            if let Err(code) =
                self.validate_request(&mut txn, request, block.epoch_number(), false)
            {
                status.record(index, code);
                valid = false;
            }
        }
        // Validation-time reservations are kept only when the whole batch
        // passes; a rejected proposal must not pin its sources.
        if valid {
            txn.commit().ok();
        }
        valid
    }

    /// Structural re-validation driven by the block cache: chain linkage
    /// first, then content with duplicates allowed.
    pub fn verify_content(&self, block: &RequestBlock, status: &mut ValidationStatus) -> bool {
        let mut txn = self.db.begin();
        let tip = txn.rb_tip_get(block.delegate()).ok().flatten();

        match tip {
            Some(tip_hash) => {
                if block.prefix.previous != tip_hash {
                    // Epoch-first blocks restart linkage from zero.
                    if !block.prefix.previous.is_zero() {
                        status.reason = Some(ProcessResult::GapPrevious);
                        return false;
                    }
                }
            }
            None => {
                if !block.prefix.previous.is_zero() {
                    status.reason = Some(ProcessResult::GapPrevious);
                    return false;
                }
            }
        }

        let mut valid = true;
        for (index, request) in block.requests.iter().enumerate() {
            if let Err(code) =
                self.validate_request(&mut txn, request, block.epoch_number(), true)
            {
                status.record(index, code);
                valid = false;
            }
        }
        valid
    }

    pub fn block_exists(&self, hash: &Buf32) -> bool {
        self.db.begin().request_block_exists(hash)
    }

    /// Applies a post-committed request block.  Idempotent: re-applying a
    /// stored block is a no-op.
    pub fn apply_updates(&self, block: &RequestBlock) -> PersistResult<Buf32> {
        let hash = block.digest();
        let mut txn = self.db.begin();

        if txn.request_block_exists(&hash) {
            debug!(%hash, "request block already applied");
            return Ok(hash);
        }

        self.store_batch_message(&mut txn, block, &hash)?;
        self.apply_batch_message(&mut txn, block)?;
        txn.commit().map_err(PersistenceError::Db)?;

        info!(%hash, delegate = block.delegate(), count = block.request_count(), "applied request block");
        Ok(hash)
    }

    /// Persists the block, back-patches the predecessor's `next`, stores
    /// each request under its locator and advances the delegate tip.
    fn store_batch_message(
        &self,
        txn: &mut LedgerTxn<'_>,
        block: &RequestBlock,
        hash: &Buf32,
    ) -> PersistResult<()> {
        if !block.prefix.previous.is_zero() {
            let mut prev = txn
                .request_block_get(&block.prefix.previous)?
                .ok_or(PersistenceError::MissingPredecessor(block.prefix.previous))?;
            prev.next = *hash;
            txn.request_block_put(&block.prefix.previous, &prev)?;
        }

        txn.request_block_put(hash, block)?;

        for (index, request) in block.requests.iter().enumerate() {
            let req_hash = request.digest();
            txn.request_put(
                &req_hash,
                &StoredRequest::new(request.clone(), *hash, index as u16),
            )?;

            // Back-patch the source chain's previous request.
            if !request.previous.is_zero() {
                if let Some(mut prev_entry) = txn.request_get(&request.previous)? {
                    prev_entry.request.next = req_hash;
                    txn.request_put(&request.previous, &prev_entry)?;
                }
            }
        }

        txn.rb_tip_put(block.delegate(), hash)?;
        Ok(())
    }

    fn apply_batch_message(
        &self,
        txn: &mut LedgerTxn<'_>,
        block: &RequestBlock,
    ) -> PersistResult<()> {
        for request in &block.requests {
            self.apply_request(txn, request, block.prefix.timestamp, block.epoch_number())?;
            self.reservations.release(&request.origin);
        }
        Ok(())
    }

    fn apply_request(
        &self,
        txn: &mut LedgerTxn<'_>,
        request: &Request,
        timestamp: u64,
        epoch: u32,
    ) -> PersistResult<()> {
        if self.update_source_state(txn, request, epoch)? {
            // Suspected duplicate; the source chain already moved past it.
            return Ok(());
        }

        match &request.payload {
            RequestPayload::Send { to, amount } => {
                self.update_destination_state(txn, request, to, *amount, timestamp)?;
            }
            RequestPayload::TokenSend { .. }
            | RequestPayload::Issuance { .. }
            | RequestPayload::Revoke { .. }
            | RequestPayload::AdjustFee { .. }
            | RequestPayload::UpdateController { .. } => {
                token::apply(txn, request, epoch)?;
            }
            RequestPayload::ElectionVote { .. }
            | RequestPayload::AnnounceCandidacy { .. }
            | RequestPayload::RenounceCandidacy
            | RequestPayload::StartRepresenting { .. }
            | RequestPayload::StopRepresenting => {
                elections::apply(txn, request, epoch)?;
            }
            RequestPayload::Stake { .. }
            | RequestPayload::Unstake
            | RequestPayload::Proxy { .. } => {
                staking_ops::apply(txn, request, epoch)?;
            }
            RequestPayload::Claim { .. } => {
                rewards::apply(txn, request)?;
            }
        }

        Ok(())
    }

    /// Debits the source account and advances its chain.  Returns `true`
    /// when the request looks like an already-applied duplicate.
    fn update_source_state(
        &self,
        txn: &mut LedgerTxn<'_>,
        request: &Request,
        epoch: u32,
    ) -> PersistResult<bool> {
        let hash = request.digest();
        let Some(mut info) = txn.account_get(&request.origin)? else {
            warn!(origin = %request.origin, "source account vanished while applying");
            return Ok(true);
        };

        if request.previous != info.head {
            info!(
                previous = %request.previous,
                head = %info.head,
                "previous does not match head, suspected duplicate"
            );
            return Ok(true);
        }

        let spend = Self::spend_amount(&request.payload)
            .checked_add(request.fee)
            .and_then(|total| info.balance.checked_sub(total))
            .ok_or_else(|| {
                PersistenceError::Fatal(format!("balance underflow applying {hash}"))
            })?;

        info.balance = spend;
        info.block_count += 1;
        info.head = hash;
        info.modified = timestamp_secs();

        if matches!(
            request.payload,
            RequestPayload::Stake { .. }
                | RequestPayload::Unstake
                | RequestPayload::Proxy { .. }
        ) {
            info.staking_subchain_head = hash;
        }

        if info.reservation == hash {
            info.clear_reservation();
        }

        // Expired thawing funds return to balance whenever the account is
        // touched.
        staking_ops::prune_thawing(txn, &request.origin, &mut info, epoch)?;

        txn.account_put(&request.origin, &info)?;
        Ok(false)
    }

    /// Credits the destination, synthesizing the receive ghost record.
    fn update_destination_state(
        &self,
        txn: &mut LedgerTxn<'_>,
        request: &Request,
        to: &Buf32,
        amount: Amount,
        timestamp: u64,
    ) -> PersistResult<()> {
        // Serializes simultaneous receives for the same account.
        let _guard = self.destination_mutex.lock();

        let existing = txn.account_get(to)?;
        let mut info = existing.clone().unwrap_or_default();

        let receive = ReceiveRecord {
            account: *to,
            previous: info.receive_head,
            send_hash: request.digest(),
            amount,
            fee: request.fee,
            timestamp,
        };
        let receive_hash = receive.digest();

        if existing.is_none() {
            info.open_block = receive_hash;
        }

        info.receive_count += 1;
        info.balance += amount;
        info.modified = timestamp_secs();

        let advanced_head = self.place_receive(txn, receive)?;
        if advanced_head {
            info.receive_head = receive_hash;
        }

        txn.account_put(to, &info)?;
        Ok(())
    }

    /// Inserts a receive into the destination chain in causal order
    /// (timestamp, then hash).  Returns whether the record became the new
    /// chain head.
    fn place_receive(
        &self,
        txn: &mut LedgerTxn<'_>,
        mut receive: ReceiveRecord,
    ) -> PersistResult<bool> {
        let hash = receive.digest();
        let mut advanced_head = true;

        if let Some(cur) = txn.receive_get(&receive.previous)? {
            let mut cur = cur;
            let mut cur_hash = receive.previous;
            let mut prev: Option<(Buf32, ReceiveRecord)> = None;

            // Walk back over records that causally follow the new one.
            while receive.precedes(&cur) {
                prev = Some((cur_hash, cur.clone()));
                match txn.receive_get(&cur.previous)? {
                    Some(older) => {
                        cur_hash = cur.previous;
                        cur = older;
                    }
                    None => break,
                }
            }

            if let Some((prev_hash, mut prev_rec)) = prev {
                // Splice between `prev` and its old predecessor; the chain
                // head stays where it was.
                receive.previous = prev_rec.previous;
                prev_rec.previous = hash;
                txn.receive_put(&prev_hash, &prev_rec)?;
                advanced_head = false;
            }
        }

        txn.receive_put(&hash, &receive)?;
        Ok(advanced_head)
    }
}

fn timestamp_secs() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
