//! Three-phase consensus: primary and backup round machines for the
//! request, micro and epoch chains, batch assembly with rejection recuts,
//! and epoch transition choreography.

pub mod backup;
pub mod drivers;
pub mod epoch_manager;
pub mod manager;
pub mod primary;
pub mod proposal;
pub mod quorum;
pub mod rejection;
pub mod request_handler;
pub mod state;

pub use drivers::{EpochDriver, MicroDriver, RequestDriver};
pub use epoch_manager::{EpochManager, EpochTransitionHooks, EpochTransitionState};
pub use manager::{ConsensusManager, ConsensusSink, ProposalDriver};
pub use proposal::Proposal;
pub use quorum::QuorumTracker;
pub use request_handler::{designated_delegate, RequestHandler};
pub use state::RoundState;
