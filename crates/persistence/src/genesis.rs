//! Ledger genesis: the epoch-zero committee, the root micro block and the
//! initially funded accounts.

use std::sync::Arc;

use conclave_db::LedgerDb;
use conclave_primitives::prelude::*;
use conclave_state::account::AccountInfo;
use conclave_state::block::{DelegateEntry, EpochBlock, MicroBlock};

use crate::errors::PersistResult;
use crate::micro::GENESIS_EPOCH;

/// One pre-funded account at genesis.
#[derive(Clone, Debug)]
pub struct GenesisAccount {
    pub account: Buf32,
    pub balance: Amount,
}

/// Whether the store still needs genesis.
pub fn needs_genesis(db: &LedgerDb) -> bool {
    db.begin().eb_tip_get().ok().flatten().is_none()
}

/// Seeds the store: genesis epoch block carrying the initial committee, the
/// root micro block it points at, and the funded accounts.
pub fn init_genesis(
    db: &Arc<LedgerDb>,
    committee: [DelegateEntry; NUM_DELEGATES],
    accounts: &[GenesisAccount],
) -> PersistResult<()> {
    let mut txn = db.begin();

    let mut mb = MicroBlock::default();
    mb.prefix.epoch_number = GENESIS_EPOCH;
    mb.prefix.timestamp = unix_time_ms();
    // The root micro block closes epoch zero so the first proposed micro
    // block starts epoch one at sequence zero.
    mb.last_micro_block = true;
    let mb_hash = mb.digest();

    let mut eb = EpochBlock::default();
    eb.prefix.epoch_number = GENESIS_EPOCH;
    eb.prefix.timestamp = mb.prefix.timestamp;
    eb.micro_block_tip = mb_hash;
    eb.delegates = committee;
    let eb_hash = eb.digest();

    txn.micro_block_put(&mb_hash, &mb)?;
    txn.mb_tip_put(&mb_hash)?;
    txn.epoch_block_put(&eb_hash, &eb)?;
    txn.eb_tip_put(&eb_hash)?;

    for seed in accounts {
        let mut info = AccountInfo::default();
        info.balance = seed.balance;
        txn.account_put(&seed.account, &info)?;
    }

    txn.commit()?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_genesis_idempotence_marker() {
        let db = Arc::new(LedgerDb::open());
        assert!(needs_genesis(&db));
        init_genesis(
            &db,
            [DelegateEntry::default(); NUM_DELEGATES],
            &[GenesisAccount {
                account: Buf32::new([1; 32]),
                balance: Amount::new(1000),
            }],
        )
        .unwrap();
        assert!(!needs_genesis(&db));

        let mut txn = db.begin();
        let info = txn.account_get(&Buf32::new([1; 32])).unwrap().unwrap();
        assert_eq!(info.balance, Amount::new(1000));
    }
}
