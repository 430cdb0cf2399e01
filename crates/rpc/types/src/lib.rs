//! Types crossing the RPC and websocket façades.

use conclave_primitives::prelude::*;
use conclave_state::block::Block;
use conclave_state::process::ProcessReturn;
use serde::{Deserialize, Serialize};

/// Result of a request submission, with the textual code form.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SubmitResponse {
    pub result: String,
    pub hash: Buf32,
}

impl From<ProcessReturn> for SubmitResponse {
    fn from(ret: ProcessReturn) -> Self {
        Self {
            result: ret.code.to_string(),
            hash: ret.hash,
        }
    }
}

/// Websocket subscription filter.  Subscribers only ever see post-committed
/// blocks.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ConfirmationFilter {
    #[serde(default)]
    pub include_request_block: bool,
    #[serde(default)]
    pub include_micro_block: bool,
    #[serde(default)]
    pub include_epoch_block: bool,
    /// When set, request blocks must touch one of these accounts.
    #[serde(default)]
    pub accounts: Option<Vec<Buf32>>,
}

impl ConfirmationFilter {
    pub fn matches(&self, block: &Block) -> bool {
        match block {
            Block::Request(rb) => {
                if !self.include_request_block {
                    return false;
                }
                match &self.accounts {
                    None => true,
                    Some(allow) => rb.requests.iter().any(|req| {
                        allow.contains(&req.origin)
                            || matches!(
                                &req.payload,
                                conclave_state::request::RequestPayload::Send { to, .. }
                                    if allow.contains(to)
                            )
                    }),
                }
            }
            Block::Micro(_) => self.include_micro_block,
            Block::Epoch(_) => self.include_epoch_block,
        }
    }
}

/// A confirmation event pushed to websocket subscribers.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ConfirmationNotification {
    pub topic: String,
    pub hash: Buf32,
    pub block: Block,
}

impl ConfirmationNotification {
    pub fn new(block: Block) -> Self {
        Self {
            topic: "confirmation".into(),
            hash: block.digest(),
            block,
        }
    }
}

#[cfg(test)]
mod test {
    use conclave_state::block::{MicroBlock, RequestBlock};
    use conclave_state::request::{Request, RequestPayload};

    use super::*;

    #[test]
    fn test_filter_by_kind() {
        let filter = ConfirmationFilter {
            include_micro_block: true,
            ..Default::default()
        };
        assert!(filter.matches(&Block::Micro(MicroBlock::default())));
        assert!(!filter.matches(&Block::Request(RequestBlock::default())));
    }

    #[test]
    fn test_account_allow_list() {
        let watched = Buf32::new([7; 32]);
        let filter = ConfirmationFilter {
            include_request_block: true,
            accounts: Some(vec![watched]),
            ..Default::default()
        };

        let mut rb = RequestBlock::default();
        assert!(!filter.matches(&Block::Request(rb.clone())));

        rb.requests.push(Request::new(
            Buf32::new([1; 32]),
            Buf32::zero(),
            Amount::ZERO,
            0,
            RequestPayload::Send {
                to: watched,
                amount: Amount::new(1),
            },
        ));
        assert!(filter.matches(&Block::Request(rb)));
    }
}
