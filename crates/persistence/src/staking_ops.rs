//! Stake, unstake and proxy semantics: staked/thawing fund records, their
//! liability mirrors, and the voting-power effects.

use conclave_db::LedgerTxn;
use conclave_primitives::prelude::*;
use conclave_state::account::AccountInfo;
use conclave_state::process::ProcessResult;
use conclave_state::request::{Request, RequestPayload};
use conclave_state::staking::{Liability, StakedFunds, ThawingFunds};
use tracing::*;

use crate::errors::{PersistResult, PersistenceError};
use crate::voting_power;

type Check = Result<(), ProcessResult>;

pub fn validate(txn: &mut LedgerTxn<'_>, request: &Request, _current_epoch: u32) -> Check {
    match &request.payload {
        RequestPayload::Stake { amount } => {
            if amount.is_zero() {
                return Err(ProcessResult::InvalidRequest);
            }
            Ok(())
        }
        RequestPayload::Unstake => {
            let held = txn
                .staking_get(&request.origin, &request.origin)
                .map_err(|_| ProcessResult::InvalidRequest)?;
            if held.is_none() {
                return Err(ProcessResult::Redundant);
            }
            Ok(())
        }
        RequestPayload::Proxy { rep, amount, lock } => {
            if *rep == request.origin {
                return Err(ProcessResult::InvalidRequest);
            }
            let rep_rec = txn.rep_get(rep).map_err(|_| ProcessResult::InvalidRequest)?;
            if !rep_rec.map(|r| r.active).unwrap_or(false) {
                return Err(ProcessResult::NotARep);
            }
            if !lock {
                // Unlocked proxy pledges spendable balance without moving
                // it; the pledge cannot exceed what is there.
                let info = txn
                    .account_get(&request.origin)
                    .map_err(|_| ProcessResult::InvalidRequest)?
                    .ok_or(ProcessResult::UnknownSourceAccount)?;
                if *amount > info.balance {
                    return Err(ProcessResult::InsufficientBalance);
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Applies a staking-family request.
pub fn apply(
    txn: &mut LedgerTxn<'_>,
    request: &Request,
    epoch: u32,
) -> PersistResult<()> {
    match &request.payload {
        RequestPayload::Stake { amount } => apply_stake(txn, request, *amount, epoch),
        RequestPayload::Unstake => apply_unstake(txn, request, epoch),
        RequestPayload::Proxy { rep, amount, lock } => {
            apply_proxy(txn, request, rep, *amount, *lock, epoch)
        }
        _ => Ok(()),
    }
}

fn put_liability(txn: &mut LedgerTxn<'_>, liability: &Liability) -> PersistResult<Buf32> {
    let id = liability.id();
    txn.liability_put(&id, liability)?;
    Ok(id)
}

fn apply_stake(
    txn: &mut LedgerTxn<'_>,
    request: &Request,
    amount: Amount,
    epoch: u32,
) -> PersistResult<()> {
    let origin = request.origin;
    let existing = txn.staking_get(&origin, &origin)?;
    if let Some(old) = &existing {
        txn.liability_del(&old.liability);
    }
    let prior = existing.map(|f| f.amount).unwrap_or(Amount::ZERO);

    let liability = Liability {
        source: origin,
        target: origin,
        amount: prior + amount,
        expiration_epoch: 0,
    };
    let liability_id = put_liability(txn, &liability)?;

    txn.staking_put(&StakedFunds {
        origin,
        target: origin,
        amount: prior + amount,
        liability: liability_id,
    })?;

    voting_power::add_self_stake(txn, &origin, amount, epoch)?;
    debug!(%origin, %amount, "staked");
    Ok(())
}

fn apply_unstake(txn: &mut LedgerTxn<'_>, request: &Request, epoch: u32) -> PersistResult<()> {
    let origin = request.origin;
    let funds = txn
        .staking_get(&origin, &origin)?
        .ok_or_else(|| PersistenceError::Fatal(format!("unstake without stake for {origin}")))?;

    txn.staking_del(&origin, &origin);
    txn.liability_del(&funds.liability);

    let expiration = epoch + THAWING_PERIOD;
    thaw(txn, origin, origin, funds.amount, expiration)?;

    voting_power::subtract_self_stake(txn, &origin, funds.amount, epoch)?;
    debug!(%origin, amount = %funds.amount, %expiration, "unstaked into thawing");
    Ok(())
}

fn apply_proxy(
    txn: &mut LedgerTxn<'_>,
    request: &Request,
    rep: &Buf32,
    amount: Amount,
    lock: bool,
    epoch: u32,
) -> PersistResult<()> {
    let origin = request.origin;

    undo_prior_proxy(txn, request, epoch)?;

    if lock {
        let liability = Liability {
            source: origin,
            target: *rep,
            amount,
            expiration_epoch: 0,
        };
        let liability_id = put_liability(txn, &liability)?;
        txn.staking_put(&StakedFunds {
            origin,
            target: *rep,
            amount,
            liability: liability_id,
        })?;
        voting_power::add_locked_proxied(txn, rep, amount, epoch)?;
    } else {
        voting_power::add_unlocked_proxied(txn, rep, amount, epoch)?;
    }

    debug!(%origin, %rep, %amount, %lock, "proxied");
    Ok(())
}

/// Unwinds the proxy recorded by the previous staking-subchain request, if
/// any.  The superseded locked proxy starts thawing rather than returning
/// to balance directly.
fn undo_prior_proxy(
    txn: &mut LedgerTxn<'_>,
    request: &Request,
    epoch: u32,
) -> PersistResult<()> {
    let origin = request.origin;
    // The subchain head was advanced to this request by the source-side
    // update; the superseded action is reachable through `prior_staking`.
    let Some(prior_hash) = prior_staking_request(txn, request)? else {
        return Ok(());
    };
    let Some(entry) = txn.request_get(&prior_hash)? else {
        return Ok(());
    };

    if let RequestPayload::Proxy {
        rep: old_rep,
        amount: old_amount,
        lock: old_lock,
    } = entry.request.payload
    {
        if old_lock {
            if let Some(funds) = txn.staking_get(&origin, &old_rep)? {
                txn.staking_del(&origin, &old_rep);
                txn.liability_del(&funds.liability);
                thaw(txn, origin, old_rep, funds.amount, epoch + THAWING_PERIOD)?;
            }
            voting_power::subtract_locked_proxied(txn, &old_rep, old_amount, epoch)?;
        } else {
            voting_power::subtract_unlocked_proxied(txn, &old_rep, old_amount, epoch)?;
        }
    }

    Ok(())
}

/// Creates or merges a thawing record at `(origin, expiration)`.
fn thaw(
    txn: &mut LedgerTxn<'_>,
    origin: Buf32,
    target: Buf32,
    amount: Amount,
    expiration: u32,
) -> PersistResult<()> {
    let mut total = amount;
    if let Some(existing) = txn.thawing_get(&origin, expiration)? {
        total += existing.amount;
        txn.liability_del(&existing.liability);
    }

    let liability = Liability {
        source: origin,
        target,
        amount: total,
        expiration_epoch: expiration,
    };
    let liability_id = put_liability(txn, &liability)?;
    txn.thawing_put(&ThawingFunds {
        origin,
        target,
        amount: total,
        expiration_epoch: expiration,
        liability: liability_id,
    })?;
    Ok(())
}

/// The staking-subchain predecessor of an in-flight staking request.
fn prior_staking_request(
    txn: &mut LedgerTxn<'_>,
    request: &Request,
) -> PersistResult<Option<Buf32>> {
    let hash = request.digest();
    let Some(info) = txn.account_get(&request.origin)? else {
        return Ok(None);
    };
    if info.staking_subchain_head.is_zero() || info.staking_subchain_head == hash {
        // Walk one step back through the stored copy of this request when
        // the head already points at it.
        if info.staking_subchain_head == hash {
            if let Some(entry) = txn.request_get(&hash)? {
                let prev = subchain_prev_of(txn, &entry.request)?;
                return Ok(prev);
            }
        }
        return Ok(None);
    }
    Ok(Some(info.staking_subchain_head))
}

fn subchain_prev_of(
    txn: &mut LedgerTxn<'_>,
    request: &Request,
) -> PersistResult<Option<Buf32>> {
    // Follow source-chain previous pointers until the next staking-family
    // request.
    let mut cursor = request.previous;
    while !cursor.is_zero() {
        let Some(entry) = txn.request_get(&cursor)? else {
            return Ok(None);
        };
        if matches!(
            entry.request.payload,
            RequestPayload::Stake { .. } | RequestPayload::Unstake | RequestPayload::Proxy { .. }
        ) {
            return Ok(Some(cursor));
        }
        cursor = entry.request.previous;
    }
    Ok(None)
}

/// Returns expired thawing funds to the account balance.  Runs every time
/// the source account is touched by an apply.
pub fn prune_thawing(
    txn: &mut LedgerTxn<'_>,
    origin: &Buf32,
    info: &mut AccountInfo,
    current_epoch: u32,
) -> PersistResult<()> {
    let funds = txn.thawing_scan(origin)?;
    for fund in funds {
        if fund.is_expired(current_epoch) {
            info.balance += fund.amount;
            txn.thawing_del(origin, fund.expiration_epoch);
            txn.liability_del(&fund.liability);
            debug!(%origin, amount = %fund.amount, "thawing funds matured");
        }
    }
    Ok(())
}
