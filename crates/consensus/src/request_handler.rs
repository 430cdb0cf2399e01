//! Entry point for client-submitted requests: signature and semantic
//! validation, designated-delegate mapping, optional buffering, and batch
//! assembly for the request-block primary.

use std::sync::Arc;

use conclave_crypto::ed25519::validate_account_sig;
use conclave_persistence::RequestPersistence;
use conclave_primitives::prelude::*;
use conclave_state::block::RequestBlock;
use conclave_state::process::{ProcessResult, ProcessReturn};
use conclave_state::request::Request;
use parking_lot::Mutex;
use tracing::*;

use crate::manager::ConsensusManager;
use crate::state::RoundState;

/// The committee seat that batches requests for an account chain: the low
/// five bits of the previous hash, or of the account for fresh chains.
pub fn designated_delegate(request: &Request) -> DelegateId {
    let indicator = if request.previous.is_zero() {
        &request.origin
    } else {
        &request.previous
    };
    indicator.as_bytes()[31] & ((1 << DELEGATE_ID_MASK_BITS) - 1)
}

pub struct RequestHandler {
    persistence: Arc<RequestPersistence>,
    manager: Arc<ConsensusManager<RequestBlock>>,
    /// Requests held back while a client streams a benchmark batch.
    buffer: Mutex<Vec<Request>>,
    /// Requests accumulating toward the next proposed batch.
    batch: Mutex<Vec<Request>>,
}

impl RequestHandler {
    pub fn new(
        persistence: Arc<RequestPersistence>,
        manager: Arc<ConsensusManager<RequestBlock>>,
    ) -> Self {
        Self {
            persistence,
            manager,
            buffer: Mutex::new(Vec::new()),
            batch: Mutex::new(Vec::new()),
        }
    }

    pub fn manager(&self) -> &Arc<ConsensusManager<RequestBlock>> {
        &self.manager
    }

    /// Submission entry: validates and queues one request.
    pub fn on_send_request(&self, request: Request, should_buffer: bool) -> ProcessReturn {
        let hash = request.digest();

        if self.manager.round_state() == RoundState::Initializing {
            return ProcessReturn::failed(ProcessResult::Initializing);
        }

        if !validate_account_sig(&request.origin, &hash, &request.signature).unwrap_or(false) {
            info!(origin = %request.origin, %hash, "bad request signature");
            return ProcessReturn::failed(ProcessResult::BadSignature);
        }

        // A chain mapped to a vacated committee seat cannot make progress
        // this epoch.
        let seat = designated_delegate(&request);
        if self.manager.committee()[seat as usize].account.is_zero() {
            return ProcessReturn::failed(ProcessResult::InvalidCandidate);
        }

        if should_buffer {
            self.buffer.lock().push(request);
            return ProcessReturn::progress(hash);
        }

        {
            let db = self.persistence.db().clone();
            let mut txn = db.begin();
            if let Err(code) = self.persistence.validate_request(
                &mut txn,
                &request,
                self.manager.epoch_number(),
                false,
            ) {
                return ProcessReturn::new(code, hash);
            }
            // Keep the reservation taken during validation.
            if txn.commit().is_err() {
                return ProcessReturn::failed(ProcessResult::InvalidRequest);
            }
        }

        self.queue_validated(request);
        ProcessReturn::progress(hash)
    }

    /// Flushes the benchmark buffer into consensus.
    pub fn buffer_complete(&self) -> ProcessReturn {
        let buffered: Vec<Request> = std::mem::take(&mut *self.buffer.lock());
        debug!(count = buffered.len(), "buffered requests released");
        for request in buffered {
            let _ = self.on_send_request(request, false);
        }
        ProcessReturn::failed(ProcessResult::BufferingDone)
    }

    fn queue_validated(&self, request: Request) {
        let ready = {
            let mut batch = self.batch.lock();
            batch.push(request);
            batch.len() >= CONSENSUS_BATCH_SIZE || self.manager.queue_len() == 0
        };
        if ready {
            self.flush();
        }
    }

    /// Seals the accumulating batch into a proposal.  Chain-position fields
    /// are refreshed by the driver when the round actually starts.
    pub fn flush(&self) {
        let requests: Vec<Request> = std::mem::take(&mut *self.batch.lock());
        if requests.is_empty() {
            return;
        }

        let mut block = RequestBlock::default();
        block.prefix.primary_delegate = self.manager.delegate_id();
        block.prefix.epoch_number = self.manager.epoch_number();
        block.requests = requests;
        self.manager.queue_proposal(block);
    }
}

#[cfg(test)]
mod test {
    use conclave_primitives::amount::Amount;
    use conclave_state::request::RequestPayload;

    use super::*;

    #[test]
    fn test_designated_delegate_masks_low_bits() {
        let mut origin = Buf32::zero();
        origin.0[31] = 0b1110_1101;
        let req = Request::new(
            origin,
            Buf32::zero(),
            Amount::ZERO,
            0,
            RequestPayload::Unstake,
        );
        // previous is zero: the account picks the seat.
        assert_eq!(designated_delegate(&req), 0b0_1101);

        let mut prev = Buf32::zero();
        prev.0[31] = 0x3f;
        let req = Request::new(origin, prev, Amount::ZERO, 1, RequestPayload::Unstake);
        assert_eq!(designated_delegate(&req), 0x1f);
    }
}
