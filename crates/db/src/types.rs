//! Auxiliary stored value types.

use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use conclave_state::request::Request;

/// A request at rest, with the locator of the sealing request block.
#[derive(Clone, Debug, Eq, PartialEq, BorshDeserialize, BorshSerialize)]
pub struct StoredRequest {
    pub request: Request,
    /// Hash of the request block holding this request.
    pub rb_hash: Buf32,
    /// Slot index within that block.
    pub index: u16,
}

impl StoredRequest {
    pub fn new(request: Request, rb_hash: Buf32, index: u16) -> Self {
        Self {
            request,
            rb_hash,
            index,
        }
    }
}
