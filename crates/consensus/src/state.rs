//! Round phases shared by the primary and backup machines.

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RoundState {
    /// No round outstanding.
    Void,
    /// Primary: pre-prepare broadcast, collecting prepares.
    PrePrepare,
    /// Backup: prepare sent, awaiting post-prepare.
    Prepare,
    /// Primary: post-prepare broadcast, collecting commits.
    PostPrepare,
    /// Backup: commit sent, awaiting post-commit.
    Commit,
    /// Round sealed.
    PostCommit,
    /// Round forfeited on timeout.
    Recall,
    /// Pre-quorum connectivity at startup.
    Initializing,
}

impl RoundState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Void => "void",
            Self::PrePrepare => "pre_prepare",
            Self::Prepare => "prepare",
            Self::PostPrepare => "post_prepare",
            Self::Commit => "commit",
            Self::PostCommit => "post_commit",
            Self::Recall => "recall",
            Self::Initializing => "initializing",
        }
    }
}

impl std::fmt::Display for RoundState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
