use thiserror::Error;

/// Simple result type used across the database interface.
pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("codec failure in space {0}: {1}")]
    Codec(&'static str, String),

    #[error("missing entry in space {0}")]
    Missing(&'static str),

    #[error("schema version {0} unsupported (expected {1})")]
    SchemaVersion(u32, u32),

    /// Unrecoverable engine failure mid-transaction.  Partial application of
    /// a post-committed block would desynchronize the node, so the top level
    /// translates this into process termination.
    #[error("fatal store failure: {0}")]
    Fatal(String),

    #[error("{0}")]
    Other(String),
}

impl DbError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

impl From<std::io::Error> for DbError {
    fn from(value: std::io::Error) -> Self {
        Self::Other(value.to_string())
    }
}
