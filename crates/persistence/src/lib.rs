//! Validation and application of sealed blocks to the ledger state, plus
//! the cache that re-orders p2p-delivered blocks into dependency order.

pub mod block_cache;
pub mod elections;
pub mod epoch;
pub mod errors;
pub mod genesis;
pub mod micro;
pub mod request;
pub mod reservations;
pub mod rewards;
pub mod staking_ops;
pub mod token;
pub mod voting_power;

pub use block_cache::{AggVerifier, BlockCache};
pub use epoch::EpochPersistence;
pub use errors::{halt_if_fatal, PersistResult, PersistenceError};
pub use micro::MicroPersistence;
pub use request::RequestPersistence;
pub use reservations::Reservations;
