//! Adapters between the transport, the consensus machines and the gossip
//! overlay.

use std::sync::Arc;

use conclave_consensus::{ConsensusManager, ConsensusSink, RequestHandler};
use conclave_netio::{MessageDispatch, NetIoManager};
use conclave_p2p::GossipHandler;
use conclave_persistence::BlockCache;
use conclave_primitives::prelude::*;
use conclave_state::block::{Block, EpochBlock, MicroBlock, RequestBlock};
use conclave_wire::ConsensusMessage;
use parking_lot::RwLock;
use tracing::*;

/// One epoch's consensus machines.
pub struct ConsensusStack {
    pub epoch_number: u32,
    pub request: Arc<ConsensusManager<RequestBlock>>,
    pub micro: Arc<ConsensusManager<MicroBlock>>,
    pub epoch: Arc<ConsensusManager<EpochBlock>>,
    pub request_handler: Arc<RequestHandler>,
}

/// The live stacks: the current one, plus the incoming one during the
/// dual-epoch overlap.
#[derive(Default)]
pub struct NodeStacks {
    pub current: RwLock<Option<Arc<ConsensusStack>>>,
    pub next: RwLock<Option<Arc<ConsensusStack>>>,
}

impl NodeStacks {
    pub fn current(&self) -> Option<Arc<ConsensusStack>> {
        self.current.read().clone()
    }

    /// Promotes the incoming stack once its epoch block is applied.
    pub fn promote_next(&self) {
        if let Some(next) = self.next.write().take() {
            info!(epoch = next.epoch_number, "promoting incoming consensus stack");
            *self.current.write() = Some(next);
        }
    }
}

/// Routes decoded mesh frames to the machines of the live stacks.  During
/// the overlap both stacks see the frame; stale-round filtering drops the
/// mismatches.
pub struct StackRouter {
    pub stacks: Arc<NodeStacks>,
}

impl MessageDispatch for StackRouter {
    fn on_message(&self, remote: DelegateId, kind: ConsensusKind, msg: ConsensusMessage) {
        let targets = [self.stacks.current(), self.stacks.next.read().clone()];
        for stack in targets.into_iter().flatten() {
            match kind {
                ConsensusKind::Request => stack.request.on_message(remote, msg.clone()),
                ConsensusKind::MicroBlock => stack.micro.on_message(remote, msg.clone()),
                ConsensusKind::Epoch => stack.epoch.on_message(remote, msg.clone()),
            }
        }
    }
}

/// [`ConsensusSink`] over the delegate mesh.
pub struct MeshSink(pub Arc<NetIoManager>);

impl ConsensusSink for MeshSink {
    fn send_to(&self, target: DelegateId, frame: Vec<u8>) {
        self.0.send_to(target, frame);
    }

    fn broadcast(&self, frame: Vec<u8>) {
        self.0.broadcast(frame);
    }
}

/// Gossip receive path: blocks go through the cache, requests through the
/// submission entry of the current stack.
pub struct GossipBridge {
    pub cache: Arc<BlockCache>,
    pub stacks: Arc<NodeStacks>,
}

impl GossipHandler for GossipBridge {
    fn on_post_committed_block(&self, block: Block) {
        if !self.cache.add(block) {
            debug!("gossiped block failed admission");
        }
    }

    fn on_request(&self, request: conclave_state::request::Request) {
        if let Some(stack) = self.stacks.current() {
            let ret = stack.request_handler.on_send_request(request, false);
            trace!(code = %ret.code, "gossiped request absorbed");
        }
    }
}
