//! Consensus traffic over the gossip overlay: post-committed blocks and
//! client-submitted requests, wrapped in the p2p headers and deduplicated
//! through the propagation store.

use std::sync::Arc;

use conclave_state::block::Block;
use conclave_state::request::Request;
use conclave_wire::p2p::{self, P2pAppType, P2pConsensusHeader, P2pHeader, P2P_VERSION};
use conclave_wire::{ConsensusMessage, Prequel, PREQUEL_SIZE};
use tracing::*;

use crate::interface::P2pInterface;
use crate::propagate::{PropagateMessage, PropagateStore};

/// Receives gossip payloads that survived dedup and parsing.
pub trait GossipHandler: Send + Sync {
    /// A sealed block from the overlay; ordering is the receiver's problem.
    fn on_post_committed_block(&self, block: Block);

    /// A user request forwarded through the overlay.
    fn on_request(&self, request: Request);
}

pub struct ConsensusP2p {
    interface: Arc<dyn P2pInterface>,
    store: PropagateStore,
    handler: Arc<dyn GossipHandler>,
}

impl ConsensusP2p {
    pub fn new(interface: Arc<dyn P2pInterface>, handler: Arc<dyn GossipHandler>) -> Self {
        Self {
            interface,
            store: PropagateStore::default(),
            handler,
        }
    }

    pub fn store(&self) -> &PropagateStore {
        &self.store
    }

    fn wrap_frame(epoch_number: u32, app_type: P2pAppType, inner: &[u8]) -> Vec<u8> {
        p2p::wrap(
            &P2pHeader {
                version: P2P_VERSION,
                app_type,
            },
            &P2pConsensusHeader::broadcast(epoch_number),
            inner,
        )
    }

    /// Gossips a sealed block to the overlay.
    pub fn propagate_block(&self, block: &Block) -> bool {
        let inner =
            ConsensusMessage::PostCommittedBlock(block.clone()).encode_frame(block.kind());
        let bytes = Self::wrap_frame(block.epoch_number(), P2pAppType::Consensus, &inner);

        let msg = PropagateMessage::new(bytes);
        if !self.store.insert(msg.clone()) {
            trace!(hash = %msg.hash, "block already propagated");
            return false;
        }
        self.interface.propagate_message(&msg.bytes, true)
    }

    /// Receive callback handed to the overlay.  Returns whether the payload
    /// was accepted.
    pub fn on_receive(&self, bytes: &[u8]) -> bool {
        let msg = PropagateMessage::new(bytes.to_vec());
        if !self.store.insert(msg) {
            // Seen before, don't re-flood.
            return true;
        }

        let Ok((header, _consensus_header, inner)) = p2p::unwrap(bytes) else {
            debug!("malformed p2p wrapper");
            return false;
        };

        if inner.len() < PREQUEL_SIZE {
            return false;
        }
        let Ok(prequel) = Prequel::decode(inner[..PREQUEL_SIZE].try_into().expect("p2p: prequel len"))
        else {
            return false;
        };
        let Ok(msg) = ConsensusMessage::decode_frame(&prequel, &inner[PREQUEL_SIZE..]) else {
            return false;
        };

        match (header.app_type, msg) {
            (P2pAppType::Consensus, ConsensusMessage::PostCommittedBlock(block)) => {
                self.handler.on_post_committed_block(block);
                true
            }
            (P2pAppType::Request, ConsensusMessage::PostCommittedBlock(_)) => false,
            (P2pAppType::Request, other) => {
                // Requests ride in pre-prepare frames with a single slot.
                if let ConsensusMessage::PrePrepare(pp) = other {
                    if let Block::Request(rb) = pp.block {
                        for request in rb.requests {
                            self.handler.on_request(request);
                        }
                        return true;
                    }
                }
                false
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod test {
    use conclave_state::block::RequestBlock;
    use parking_lot::Mutex;

    use super::*;
    use crate::interface::MemP2p;

    #[derive(Default)]
    struct Capture {
        blocks: Mutex<Vec<Block>>,
    }

    impl GossipHandler for Capture {
        fn on_post_committed_block(&self, block: Block) {
            self.blocks.lock().push(block);
        }

        fn on_request(&self, _request: Request) {}
    }

    #[test]
    fn test_propagate_then_receive_dedups() {
        let overlay = Arc::new(MemP2p::default());
        let capture = Arc::new(Capture::default());
        let p2p = ConsensusP2p::new(overlay.clone(), capture.clone());

        let block = Block::Request(RequestBlock::default());
        assert!(p2p.propagate_block(&block));
        // Re-propagation of the same block is suppressed.
        assert!(!p2p.propagate_block(&block));

        let sent = overlay.sent.lock().clone();
        assert_eq!(sent.len(), 1);

        // Our own gossip echoed back is absorbed without re-handling.
        assert!(p2p.on_receive(&sent[0]));
        assert!(capture.blocks.lock().is_empty());
    }

    #[test]
    fn test_receive_foreign_block() {
        let overlay = Arc::new(MemP2p::default());
        let capture = Arc::new(Capture::default());
        let p2p = ConsensusP2p::new(overlay, capture.clone());

        let mut rb = RequestBlock::default();
        rb.prefix.primary_delegate = 9;
        let inner = ConsensusMessage::PostCommittedBlock(Block::Request(rb.clone()))
            .encode_frame(conclave_primitives::params::ConsensusKind::Request);
        let bytes = ConsensusP2p::wrap_frame(3, P2pAppType::Consensus, &inner);

        assert!(p2p.on_receive(&bytes));
        assert_eq!(capture.blocks.lock().len(), 1);
    }
}
