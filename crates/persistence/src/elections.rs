//! Governance requests: representatives, candidacies and election votes,
//! plus the per-epoch election tally.

use conclave_db::{LedgerTxn, Space};
use conclave_primitives::prelude::*;
use conclave_state::block::DelegateEntry;
use conclave_state::governance::{CandidacyInfo, RepInfo};
use conclave_state::process::ProcessResult;
use conclave_state::request::{Request, RequestPayload};
use tracing::*;

use crate::errors::PersistResult;
use crate::voting_power;

type Check = Result<(), ProcessResult>;

/// Most votes one ballot may spread across candidates.
pub const MAX_VOTES: u32 = 8;

/// Minimum announced stake to enter the candidate pool.
pub const MIN_DELEGATE_STAKE: Amount = Amount(1);

const DEAD_PERIOD_KEY: &[u8] = b"dead_period_epoch";

/// Marks the dead period of `epoch`: votes arriving after the final micro
/// block proposal no longer count.
pub fn mark_dead_period(txn: &mut LedgerTxn<'_>, epoch: u32) -> PersistResult<()> {
    txn.put(Space::Meta, DEAD_PERIOD_KEY, &epoch)?;
    Ok(())
}

fn in_dead_period(txn: &mut LedgerTxn<'_>, epoch: u32) -> bool {
    txn.get::<u32>(Space::Meta, DEAD_PERIOD_KEY)
        .ok()
        .flatten()
        .map(|marked| marked == epoch)
        .unwrap_or(false)
}

pub fn validate(txn: &mut LedgerTxn<'_>, request: &Request, current_epoch: u32) -> Check {
    let origin = &request.origin;
    match &request.payload {
        RequestPayload::StartRepresenting { stake } => {
            if stake.is_zero() {
                return Err(ProcessResult::InvalidRequest);
            }
            let existing = txn.rep_get(origin).map_err(|_| ProcessResult::InvalidRequest)?;
            if existing.map(|r| r.active).unwrap_or(false) {
                return Err(ProcessResult::Redundant);
            }
            Ok(())
        }
        RequestPayload::StopRepresenting => {
            let rep = txn
                .rep_get(origin)
                .map_err(|_| ProcessResult::InvalidRequest)?
                .ok_or(ProcessResult::NotARep)?;
            if !rep.active {
                return Err(ProcessResult::OldRep);
            }
            // Representation only becomes effective at the next epoch
            // boundary; stopping within the start epoch is premature.
            if rep.active_since == current_epoch {
                return Err(ProcessResult::PendingRep);
            }
            Ok(())
        }
        RequestPayload::AnnounceCandidacy { stake, .. } => {
            let rep = txn.rep_get(origin).map_err(|_| ProcessResult::InvalidRequest)?;
            if !rep.map(|r| r.active).unwrap_or(false) {
                return Err(ProcessResult::NotARep);
            }
            if *stake < MIN_DELEGATE_STAKE {
                return Err(ProcessResult::InvalidCandidate);
            }
            let existing = txn
                .candidacy_get(origin)
                .map_err(|_| ProcessResult::InvalidRequest)?;
            if existing.map(|c| c.active).unwrap_or(false) {
                return Err(ProcessResult::Redundant);
            }
            Ok(())
        }
        RequestPayload::RenounceCandidacy => {
            let existing = txn
                .candidacy_get(origin)
                .map_err(|_| ProcessResult::InvalidRequest)?;
            if !existing.map(|c| c.active).unwrap_or(false) {
                return Err(ProcessResult::InvalidCandidate);
            }
            Ok(())
        }
        RequestPayload::ElectionVote { votes } => {
            let rep = txn
                .rep_get(origin)
                .map_err(|_| ProcessResult::InvalidRequest)?
                .ok_or(ProcessResult::NotARep)?;
            if !rep.active {
                return Err(ProcessResult::OldRep);
            }
            if rep.has_voted(current_epoch) {
                return Err(ProcessResult::AlreadyVoted);
            }
            if in_dead_period(txn, current_epoch) {
                return Err(ProcessResult::DeadPeriodVote);
            }

            let total: u32 = votes.iter().map(|(_, n)| *n as u32).sum();
            if votes.is_empty() || total > MAX_VOTES {
                return Err(ProcessResult::InvalidRequest);
            }
            for (candidate, _) in votes {
                let cand = txn
                    .candidacy_get(candidate)
                    .map_err(|_| ProcessResult::InvalidRequest)?;
                if !cand.map(|c| c.active).unwrap_or(false) {
                    return Err(ProcessResult::InvalidCandidate);
                }
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub fn apply(txn: &mut LedgerTxn<'_>, request: &Request, epoch: u32) -> PersistResult<()> {
    let origin = request.origin;
    match &request.payload {
        RequestPayload::StartRepresenting { stake } => {
            let mut rep = txn.rep_get(&origin)?.unwrap_or_default();
            rep.stake = *stake;
            rep.rep_action_head = request.digest();
            rep.active_since = epoch;
            rep.active = true;
            txn.rep_put(&origin, &rep)?;
        }
        RequestPayload::StopRepresenting => {
            if let Some(mut rep) = txn.rep_get(&origin)? {
                rep.active = false;
                rep.rep_action_head = request.digest();
                txn.rep_put(&origin, &rep)?;
            }
        }
        RequestPayload::AnnounceCandidacy { stake, bls_key } => {
            txn.candidacy_put(
                &origin,
                &CandidacyInfo {
                    stake: *stake,
                    bls_key: *bls_key,
                    votes_received: Amount::ZERO,
                    announced_epoch: epoch,
                    active: true,
                },
            )?;
        }
        RequestPayload::RenounceCandidacy => {
            if let Some(mut cand) = txn.candidacy_get(&origin)? {
                cand.active = false;
                txn.candidacy_put(&origin, &cand)?;
            }
        }
        RequestPayload::ElectionVote { votes } => {
            let power = voting_power::current_power(txn, &origin, epoch)?;
            for (candidate, count) in votes {
                if let Some(mut cand) = txn.candidacy_get(candidate)? {
                    let weighted = power.raw() * (*count as u128);
                    cand.votes_received += Amount::new(weighted);
                    txn.candidacy_put(candidate, &cand)?;
                }
            }
            let mut rep = txn.rep_get(&origin)?.unwrap_or_default();
            rep.voted_epoch = epoch;
            txn.rep_put(&origin, &rep)?;
            debug!(%origin, %power, ballots = votes.len(), "vote recorded");
        }
        _ => {}
    }
    Ok(())
}

/// The elected committee for the epoch after `epoch`: the top candidates by
/// weighted votes, ties broken by account, padded from the incumbent set
/// when the pool is short.
pub fn election_results(
    txn: &mut LedgerTxn<'_>,
    incumbents: &[DelegateEntry; NUM_DELEGATES],
) -> PersistResult<[DelegateEntry; NUM_DELEGATES]> {
    let mut candidates = txn.candidacy_scan()?;
    candidates.retain(|(_, c)| c.active);
    candidates.sort_by(|(acct_a, a), (acct_b, b)| {
        b.votes_received
            .cmp(&a.votes_received)
            .then_with(|| acct_a.cmp(acct_b))
    });

    let mut elected = [DelegateEntry::default(); NUM_DELEGATES];
    let mut filled = 0;
    for (account, cand) in candidates.into_iter().take(NUM_DELEGATES) {
        elected[filled] = DelegateEntry {
            account,
            bls_key: cand.bls_key,
            vote: cand.votes_received,
            stake: cand.stake,
            starting_term: 0,
        };
        filled += 1;
    }

    // Too few candidates: incumbents keep their seats, terms bumped.
    let mut incumbent_iter = incumbents.iter();
    while filled < NUM_DELEGATES {
        let Some(seat) = incumbent_iter.next() else {
            break;
        };
        if elected[..filled].iter().any(|e| e.account == seat.account) {
            continue;
        }
        let mut entry = *seat;
        entry.starting_term = entry.starting_term.saturating_add(1);
        elected[filled] = entry;
        filled += 1;
    }

    Ok(elected)
}

/// Resets per-election state after an epoch block seals the new committee.
pub fn conclude_election(txn: &mut LedgerTxn<'_>) -> PersistResult<()> {
    let candidates = txn.candidacy_scan()?;
    for (account, mut cand) in candidates {
        if !cand.active {
            txn.candidacy_del(&account);
            continue;
        }
        cand.votes_received = Amount::ZERO;
        txn.candidacy_put(&account, &cand)?;
    }
    Ok(())
}
