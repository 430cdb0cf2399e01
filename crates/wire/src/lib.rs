//! Wire protocol: prequel framing and typed message (de)serialization for
//! the delegate mesh, bootstrap sessions and the gossip overlay.

pub mod messages;
pub mod p2p;
pub mod prequel;

use conclave_primitives::wire::CodecError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireProtocolError {
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("unknown message type {0}")]
    UnknownMessageType(u8),

    #[error("unknown consensus kind {0}")]
    UnknownConsensusKind(u8),

    #[error("unknown p2p app type {0}")]
    UnknownAppType(u8),

    #[error("payload size {0} exceeds limit")]
    OversizedPayload(u32),

    #[error("declared payload size {declared} but got {actual} bytes")]
    PayloadSizeMismatch { declared: u32, actual: usize },

    #[error(transparent)]
    Codec(#[from] CodecError),
}

pub use messages::{
    CommitMsg, ConsensusMessage, KeyAdvertisementMsg, PostCommitMsg, PostPrepareMsg,
    PrePrepareMsg, PrepareMsg, PullRequestMsg, PullResponseMsg, RejectionMsg, RejectionReason,
};
pub use prequel::{MessageType, Prequel, MAX_PAYLOAD_SIZE, PREQUEL_SIZE, WIRE_VERSION};
