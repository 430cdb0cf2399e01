//! Voting-power bookkeeping with the one-epoch visibility delay.
//!
//! Writes always land on the `next` snapshot; the first observer in a
//! strictly later epoch rolls `next` into `current`.  Records whose power
//! drops to zero are pruned unless the account is still a representative.

use conclave_db::LedgerTxn;
use conclave_primitives::prelude::*;
use conclave_state::staking::{VotingPowerInfo, VotingPowerSnapshot};

use crate::errors::{PersistResult, PersistenceError};

fn modify(
    txn: &mut LedgerTxn<'_>,
    rep: &Buf32,
    epoch: u32,
    create_missing: bool,
    f: impl FnOnce(&mut VotingPowerSnapshot) -> Option<()>,
) -> PersistResult<()> {
    let mut info = match txn.voting_power_get(rep)? {
        Some(info) => info,
        None if create_missing => VotingPowerInfo::default(),
        None => {
            return Err(PersistenceError::Fatal(format!(
                "voting power record missing for rep {rep}"
            )))
        }
    };

    info.transition_if_necessary(epoch);
    f(&mut info.next).ok_or_else(|| {
        PersistenceError::Fatal(format!("voting power underflow for rep {rep}"))
    })?;
    info.epoch_modified = epoch;

    store_or_prune(txn, rep, info)
}

/// Persists the record, or prunes it when its next-epoch power is zero and
/// the account is no longer a rep.
pub fn store_or_prune(
    txn: &mut LedgerTxn<'_>,
    rep: &Buf32,
    info: VotingPowerInfo,
) -> PersistResult<()> {
    // Check next rather than current: once next is zero the record may
    // never be touched again.
    if info.next.is_zero() {
        let still_rep = txn.rep_get(rep)?.map(|r| r.active).unwrap_or(false);
        if !still_rep {
            txn.voting_power_del(rep);
            return Ok(());
        }
    }
    txn.voting_power_put(rep, &info)?;
    Ok(())
}

pub fn add_self_stake(
    txn: &mut LedgerTxn<'_>,
    rep: &Buf32,
    amount: Amount,
    epoch: u32,
) -> PersistResult<()> {
    modify(txn, rep, epoch, true, |s| {
        s.self_stake = s.self_stake.checked_add(amount)?;
        Some(())
    })
}

pub fn subtract_self_stake(
    txn: &mut LedgerTxn<'_>,
    rep: &Buf32,
    amount: Amount,
    epoch: u32,
) -> PersistResult<()> {
    modify(txn, rep, epoch, false, |s| {
        s.self_stake = s.self_stake.checked_sub(amount)?;
        Some(())
    })
}

pub fn add_locked_proxied(
    txn: &mut LedgerTxn<'_>,
    rep: &Buf32,
    amount: Amount,
    epoch: u32,
) -> PersistResult<()> {
    modify(txn, rep, epoch, true, |s| {
        s.locked_proxied = s.locked_proxied.checked_add(amount)?;
        Some(())
    })
}

pub fn subtract_locked_proxied(
    txn: &mut LedgerTxn<'_>,
    rep: &Buf32,
    amount: Amount,
    epoch: u32,
) -> PersistResult<()> {
    modify(txn, rep, epoch, false, |s| {
        s.locked_proxied = s.locked_proxied.checked_sub(amount)?;
        Some(())
    })
}

pub fn add_unlocked_proxied(
    txn: &mut LedgerTxn<'_>,
    rep: &Buf32,
    amount: Amount,
    epoch: u32,
) -> PersistResult<()> {
    modify(txn, rep, epoch, true, |s| {
        s.unlocked_proxied = s.unlocked_proxied.checked_add(amount)?;
        Some(())
    })
}

pub fn subtract_unlocked_proxied(
    txn: &mut LedgerTxn<'_>,
    rep: &Buf32,
    amount: Amount,
    epoch: u32,
) -> PersistResult<()> {
    modify(txn, rep, epoch, false, |s| {
        s.unlocked_proxied = s.unlocked_proxied.checked_sub(amount)?;
        Some(())
    })
}

/// The power quorum computations see for `rep` in `epoch`.  Performs and
/// persists the lazy transition as a side effect.
pub fn current_power(txn: &mut LedgerTxn<'_>, rep: &Buf32, epoch: u32) -> PersistResult<Amount> {
    let Some(mut info) = txn.voting_power_get(rep)? else {
        return Ok(Amount::ZERO);
    };
    let power = info.current_power(epoch);
    txn.voting_power_put(rep, &info)?;
    Ok(power)
}

#[cfg(test)]
mod test {
    use conclave_db::LedgerDb;
    use conclave_state::governance::RepInfo;

    use super::*;

    #[test]
    fn test_delayed_visibility() {
        let db = LedgerDb::open();
        let rep = Buf32::new([1; 32]);
        let mut txn = db.begin();

        add_self_stake(&mut txn, &rep, Amount::new(100), 5).unwrap();
        // Same epoch: not yet visible.
        assert_eq!(current_power(&mut txn, &rep, 5).unwrap(), Amount::ZERO);
        // Next epoch: visible.
        assert_eq!(current_power(&mut txn, &rep, 6).unwrap(), Amount::new(100));
    }

    #[test]
    fn test_prune_when_zero_and_not_rep() {
        let db = LedgerDb::open();
        let rep = Buf32::new([1; 32]);
        let mut txn = db.begin();

        add_self_stake(&mut txn, &rep, Amount::new(10), 1).unwrap();
        subtract_self_stake(&mut txn, &rep, Amount::new(10), 1).unwrap();
        assert!(txn.voting_power_get(&rep).unwrap().is_none());
    }

    #[test]
    fn test_kept_while_still_rep() {
        let db = LedgerDb::open();
        let rep = Buf32::new([1; 32]);
        let mut txn = db.begin();
        let mut rep_info = RepInfo::default();
        rep_info.active = true;
        txn.rep_put(&rep, &rep_info).unwrap();

        add_self_stake(&mut txn, &rep, Amount::new(10), 1).unwrap();
        subtract_self_stake(&mut txn, &rep, Amount::new(10), 1).unwrap();
        assert!(txn.voting_power_get(&rep).unwrap().is_some());
    }

    #[test]
    fn test_underflow_is_fatal() {
        let db = LedgerDb::open();
        let rep = Buf32::new([1; 32]);
        let mut txn = db.begin();
        add_self_stake(&mut txn, &rep, Amount::new(5), 1).unwrap();
        let res = subtract_self_stake(&mut txn, &rep, Amount::new(6), 1);
        assert!(matches!(res, Err(PersistenceError::Fatal(_))));
    }
}
