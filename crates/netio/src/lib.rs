//! Delegate-mesh networking: one framed TCP channel per peer, heartbeats,
//! reconnection, and dispatch into the consensus machines.

pub mod channel;
pub mod manager;

use conclave_primitives::params::{ConsensusKind, DelegateId};
use conclave_wire::ConsensusMessage;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire: {0}")]
    Wire(#[from] conclave_wire::WireProtocolError),

    #[error("connection to delegate {0} closed")]
    ChannelClosed(DelegateId),

    #[error("unknown peer address {0}")]
    UnknownPeer(std::net::IpAddr),
}

/// Receives every decoded frame from the mesh; the node routes it to the
/// consensus machine keyed by `(remote, kind)`.
pub trait MessageDispatch: Send + Sync {
    fn on_message(&self, remote: DelegateId, kind: ConsensusKind, msg: ConsensusMessage);
}

pub use manager::NetIoManager;
