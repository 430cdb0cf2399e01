//! Governance records backing delegate elections and epoch rewards.

use arbitrary::Arbitrary;
use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use serde::{Deserialize, Serialize};

/// A standing candidate for the delegate committee.
#[derive(
    Clone, Debug, Default, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct CandidacyInfo {
    pub stake: Amount,
    pub bls_key: Buf48,
    /// Weighted votes accumulated in the current election.
    pub votes_received: Amount,
    /// Epoch the candidacy was announced in.
    pub announced_epoch: u32,
    pub active: bool,
}

/// A representative accepting proxied stake.
#[derive(
    Clone, Debug, Default, Eq, PartialEq, Arbitrary, BorshDeserialize, BorshSerialize, Deserialize, Serialize,
)]
pub struct RepInfo {
    pub stake: Amount,
    /// Hash of the rep's latest governance request.
    pub rep_action_head: Buf32,
    /// Epoch the account started representing.
    pub active_since: u32,
    pub active: bool,
    /// Set once the rep has cast its vote in the current election.
    pub voted_epoch: u32,
}

impl RepInfo {
    pub fn has_voted(&self, epoch: u32) -> bool {
        self.voted_epoch == epoch
    }
}

/// Per-delegate reward accrued in one epoch, keyed `(account, epoch)`.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct RewardInfo {
    pub total: Amount,
    pub remaining: Amount,
    pub claimed: bool,
}

/// Network-wide reward pool for one epoch.
#[derive(
    Copy,
    Clone,
    Debug,
    Default,
    Eq,
    PartialEq,
    Arbitrary,
    BorshDeserialize,
    BorshSerialize,
    Deserialize,
    Serialize,
)]
pub struct GlobalRewardInfo {
    pub total_reward: Amount,
    pub total_stake: Amount,
    pub remaining: Amount,
}
