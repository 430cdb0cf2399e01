use conclave_db::DbError;
use conclave_primitives::buf::Buf32;
use thiserror::Error;

pub type PersistResult<T> = Result<T, PersistenceError>;

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("db: {0}")]
    Db(#[from] DbError),

    /// Applying a post-committed block hit an inconsistency that cannot be
    /// recovered in-process.  The executor translates this into process
    /// termination; restart-from-disk is the safe recovery path.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("missing predecessor {0} while applying block")]
    MissingPredecessor(Buf32),
}

impl PersistenceError {
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Fatal(_) => true,
            Self::Db(e) => e.is_fatal(),
            Self::MissingPredecessor(_) => false,
        }
    }
}

/// Halts the process on an unrecoverable store failure.  A half-applied
/// post-committed block would desynchronize this node from the committee;
/// restart-from-disk is the safe recovery path.
pub fn halt_if_fatal(err: &PersistenceError) {
    if err.is_fatal() {
        tracing::error!(%err, "unrecoverable persistence failure, halting");
        std::process::abort();
    }
}
