//! Result codes surfaced to request submitters.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use serde::{Deserialize, Serialize};

/// Outcome of validating or applying a request.  The textual form is what
/// RPC responses carry.
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ProcessResult {
    Progress,
    InsufficientFee,
    BadSignature,
    Fork,
    GapPrevious,
    Old,
    AlreadyReserved,
    InsufficientBalance,
    InvalidCandidate,
    DeadPeriodVote,
    NotARep,
    PendingRep,
    OldRep,
    AlreadyVoted,
    OpenedBurnAccount,
    UnknownSourceAccount,
    BufferingDone,
    Initializing,
    RevertImmutability,
    Immutable,
    Redundant,
    InvalidTokenAmount,
    UntrustedSender,
    FrozenAccount,
    NotWhitelisted,
    InsufficientTokenBalance,
    InvalidRequest,
    WrongSequenceNumber,
    InvalidPreviousHash,
    InvalidEpoch,
    ClockDrift,
}

impl ProcessResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::InsufficientFee => "insufficient_fee",
            Self::BadSignature => "bad_signature",
            Self::Fork => "fork",
            Self::GapPrevious => "gap_previous",
            Self::Old => "old",
            Self::AlreadyReserved => "already_reserved",
            Self::InsufficientBalance => "insufficient_balance",
            Self::InvalidCandidate => "invalid_candidate",
            Self::DeadPeriodVote => "dead_period_vote",
            Self::NotARep => "not_a_rep",
            Self::PendingRep => "pending_rep",
            Self::OldRep => "old_rep",
            Self::AlreadyVoted => "already_voted",
            Self::OpenedBurnAccount => "opened_burn_account",
            Self::UnknownSourceAccount => "unknown_source_account",
            Self::BufferingDone => "buffering_done",
            Self::Initializing => "initializing",
            Self::RevertImmutability => "revert_immutability",
            Self::Immutable => "immutable",
            Self::Redundant => "redundant",
            Self::InvalidTokenAmount => "invalid_token_amount",
            Self::UntrustedSender => "untrusted_sender",
            Self::FrozenAccount => "frozen_account",
            Self::NotWhitelisted => "not_whitelisted",
            Self::InsufficientTokenBalance => "insufficient_token_balance",
            Self::InvalidRequest => "invalid_request",
            Self::WrongSequenceNumber => "wrong_sequence_number",
            Self::InvalidPreviousHash => "invalid_previous_hash",
            Self::InvalidEpoch => "invalid_epoch",
            Self::ClockDrift => "clock_drift",
        }
    }

    pub fn is_progress(&self) -> bool {
        matches!(self, Self::Progress)
    }
}

impl std::fmt::Display for ProcessResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the submission API returns for one request.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Deserialize, Serialize)]
pub struct ProcessReturn {
    pub code: ProcessResult,
    pub hash: Buf32,
}

impl ProcessReturn {
    pub fn new(code: ProcessResult, hash: Buf32) -> Self {
        Self { code, hash }
    }

    pub fn progress(hash: Buf32) -> Self {
        Self::new(ProcessResult::Progress, hash)
    }

    pub fn failed(code: ProcessResult) -> Self {
        Self::new(code, Buf32::zero())
    }
}

/// Per-request outcomes attached to a pre-prepare validation pass.
#[derive(Clone, Debug, Default)]
pub struct ValidationStatus {
    /// Overall reason when the batch is rejected.
    pub reason: Option<ProcessResult>,
    /// `(slot index, code)` for each failing request.
    pub requests: Vec<(usize, ProcessResult)>,
}

impl ValidationStatus {
    pub fn record(&mut self, index: usize, code: ProcessResult) {
        self.requests.push((index, code));
        self.reason.get_or_insert(ProcessResult::InvalidRequest);
    }

    pub fn is_clean(&self) -> bool {
        self.reason.is_none() && self.requests.is_empty()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_textual_codes() {
        assert_eq!(ProcessResult::GapPrevious.to_string(), "gap_previous");
        assert_eq!(
            serde_json::to_string(&ProcessResult::AlreadyReserved).unwrap(),
            "\"already_reserved\""
        );
    }
}
