//! Catch-up synchronization: tip exchange with peers and parallel pull of
//! missing chain history, driven through the block cache.

pub mod attempt;
pub mod client;
pub mod puller;
pub mod server;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("net: {0}")]
    Net(#[from] conclave_netio::NetError),

    #[error("db: {0}")]
    Db(#[from] conclave_db::DbError),

    #[error("peer sent unexpected message")]
    UnexpectedMessage,

    #[error("pull timed out")]
    PullTimeout,

    #[error("no peers available")]
    NoPeers,

    #[error("attempt stopped")]
    Stopped,
}

pub use attempt::BootstrapAttempt;
pub use client::BootstrapClient;
pub use puller::Puller;
pub use server::BootstrapServer;
