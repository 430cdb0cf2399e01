//! Epoch rewards: accrual at epoch close and redemption through `Claim`.

use conclave_db::LedgerTxn;
use conclave_primitives::prelude::*;
use conclave_state::block::EpochBlock;
use conclave_state::governance::{GlobalRewardInfo, RewardInfo};
use conclave_state::process::ProcessResult;
use conclave_state::request::{Request, RequestPayload};
use tracing::*;

use crate::errors::{PersistResult, PersistenceError};

type Check = Result<(), ProcessResult>;

/// Reward accrued per epoch, in basis points of a delegate's stake.
const EPOCH_REWARD_BPS: u128 = 50;

pub fn validate(txn: &mut LedgerTxn<'_>, request: &Request) -> Check {
    let RequestPayload::Claim { epoch } = &request.payload else {
        return Ok(());
    };
    let reward = txn
        .reward_get(&request.origin, *epoch)
        .map_err(|_| ProcessResult::InvalidRequest)?
        .ok_or(ProcessResult::Redundant)?;
    if reward.claimed || reward.remaining.is_zero() {
        return Err(ProcessResult::Redundant);
    }
    Ok(())
}

pub fn apply(txn: &mut LedgerTxn<'_>, request: &Request) -> PersistResult<()> {
    let RequestPayload::Claim { epoch } = &request.payload else {
        return Ok(());
    };
    let origin = request.origin;

    let mut reward = txn
        .reward_get(&origin, *epoch)?
        .ok_or_else(|| PersistenceError::Fatal(format!("claim without reward for {origin}")))?;

    let mut info = txn
        .account_get(&origin)?
        .ok_or_else(|| PersistenceError::Fatal(format!("claimant {origin} vanished")))?;
    info.balance += reward.remaining;
    txn.account_put(&origin, &info)?;

    if let Some(mut global) = txn.global_reward_get(*epoch)? {
        global.remaining = global.remaining.saturating_sub(reward.remaining);
        txn.global_reward_put(*epoch, &global)?;
    }

    debug!(%origin, epoch = *epoch, amount = %reward.remaining, "reward claimed");
    reward.remaining = Amount::ZERO;
    reward.claimed = true;
    txn.reward_put(&origin, *epoch, &reward)?;
    Ok(())
}

/// Accrues the closing epoch's rewards from the sealed committee table.
pub fn record_epoch_rewards(txn: &mut LedgerTxn<'_>, eb: &EpochBlock) -> PersistResult<()> {
    let closing_epoch = eb.epoch_number();
    let mut total = Amount::ZERO;
    let mut total_stake = Amount::ZERO;

    for entry in &eb.delegates {
        if entry.account.is_zero() {
            continue;
        }
        let accrued = Amount::new(entry.stake.raw() * EPOCH_REWARD_BPS / 10_000);
        total += accrued;
        total_stake += entry.stake;
        txn.reward_put(
            &entry.account,
            closing_epoch,
            &RewardInfo {
                total: accrued,
                remaining: accrued,
                claimed: false,
            },
        )?;
    }

    txn.global_reward_put(
        closing_epoch,
        &GlobalRewardInfo {
            total_reward: total,
            total_stake,
            remaining: total,
        },
    )?;
    Ok(())
}
