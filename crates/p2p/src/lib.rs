//! Gossip-side plumbing: the propagation store, the overlay contract, and
//! the consensus receive/propagate paths.

pub mod consensus_p2p;
pub mod interface;
pub mod propagate;

pub use consensus_p2p::{ConsensusP2p, GossipHandler};
pub use interface::{MemP2p, P2pInterface, PeerSession};
pub use propagate::{PropagateMessage, PropagateStore};
