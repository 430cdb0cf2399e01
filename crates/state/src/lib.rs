//! On-chain data model: blocks, requests, accounts, staking and governance
//! records, and the result codes the submission API returns.

pub mod account;
pub mod block;
pub mod governance;
pub mod process;
pub mod receive;
pub mod request;
pub mod staking;
pub mod tips;

pub mod prelude {
    pub use crate::{
        account::{AccountInfo, TokenAccount, TokenEntry, TokenSetting},
        block::{AggSignature, Block, BlockPrefix, DelegateEntry, EpochBlock, MicroBlock, RequestBlock},
        governance::{CandidacyInfo, GlobalRewardInfo, RepInfo, RewardInfo},
        process::{ProcessResult, ProcessReturn, ValidationStatus},
        receive::ReceiveRecord,
        request::{ControllerAction, ControllerInfo, Request, RequestKind, RequestPayload, TokenFeeType},
        staking::{Liability, StakedFunds, ThawingFunds, VotingPowerInfo, VotingPowerSnapshot},
        tips::TipSet,
    };
}
