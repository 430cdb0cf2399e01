//! The named key-spaces every conforming storage engine must expose.

/// On-disk schema version recorded in the `meta` space.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Space {
    /// RB hash → request block.
    RequestBlock,
    /// MB hash → micro block.
    MicroBlock,
    /// EB hash → epoch block.
    EpochBlock,
    /// Delegate index → RB hash.
    RequestBlockTip,
    /// Singleton → MB hash.
    MicroBlockTip,
    /// Singleton → EB hash.
    EpochBlockTip,
    /// Account → user account.
    Account,
    /// Token id → token account.
    TokenAccount,
    /// Receive hash → receive ghost record.
    Receive,
    /// Request hash → request + locator.
    Request,
    /// (origin, target) → staked funds.
    Staking,
    /// (origin, expiration) → thawing funds.
    Thawing,
    /// Liability id → liability.
    Liability,
    /// Rep account → voting power info.
    VotingPower,
    /// Candidate account → candidacy record.
    Candidacy,
    /// Rep account → representative record.
    Representative,
    /// (account, epoch) → reward record.
    Reward,
    /// Epoch → global reward record.
    GlobalReward,
    /// Name → opaque peer DB blob.
    P2p,
    /// Schema metadata.
    Meta,
}

impl Space {
    pub const ALL: [Space; 20] = [
        Space::RequestBlock,
        Space::MicroBlock,
        Space::EpochBlock,
        Space::RequestBlockTip,
        Space::MicroBlockTip,
        Space::EpochBlockTip,
        Space::Account,
        Space::TokenAccount,
        Space::Receive,
        Space::Request,
        Space::Staking,
        Space::Thawing,
        Space::Liability,
        Space::VotingPower,
        Space::Candidacy,
        Space::Representative,
        Space::Reward,
        Space::GlobalReward,
        Space::P2p,
        Space::Meta,
    ];

    pub const fn name(&self) -> &'static str {
        match self {
            Space::RequestBlock => "rb",
            Space::MicroBlock => "mb",
            Space::EpochBlock => "eb",
            Space::RequestBlockTip => "rb_tip",
            Space::MicroBlockTip => "mb_tip",
            Space::EpochBlockTip => "eb_tip",
            Space::Account => "account",
            Space::TokenAccount => "token_account",
            Space::Receive => "receive",
            Space::Request => "request",
            Space::Staking => "staking",
            Space::Thawing => "thawing",
            Space::Liability => "liability",
            Space::VotingPower => "voting_power",
            Space::Candidacy => "candidacy",
            Space::Representative => "representative",
            Space::Reward => "reward",
            Space::GlobalReward => "global_reward",
            Space::P2p => "p2p",
            Space::Meta => "meta",
        }
    }
}
