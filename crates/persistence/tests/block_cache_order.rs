//! Block cache dependency ordering over the in-memory store.

use std::sync::Arc;

use conclave_db::LedgerDb;
use conclave_persistence::genesis::{init_genesis, GenesisAccount};
use conclave_persistence::{
    AggVerifier, BlockCache, EpochPersistence, MicroPersistence, RequestPersistence, Reservations,
};
use conclave_primitives::prelude::*;
use conclave_state::block::{Block, RequestBlock};

struct AcceptAll;

impl AggVerifier for AcceptAll {
    fn verify_block(&self, _block: &Block) -> bool {
        true
    }
}

fn setup() -> (Arc<LedgerDb>, BlockCache) {
    let db = Arc::new(LedgerDb::open());
    init_genesis(
        &db,
        [Default::default(); NUM_DELEGATES],
        &[GenesisAccount {
            account: Buf32::new([0xaa; 32]),
            balance: Amount::new(MIN_TRANSACTION_FEE.raw() * 100),
        }],
    )
    .unwrap();

    let rb = Arc::new(RequestPersistence::new(
        db.clone(),
        Arc::new(Reservations::new()),
    ));
    let mb = Arc::new(MicroPersistence::new(db.clone()));
    let eb = Arc::new(EpochPersistence::new(db.clone()));
    let cache = BlockCache::new(rb, mb, eb, Arc::new(AcceptAll));
    (db, cache)
}

fn empty_rb(delegate: u8, sequence: u32, previous: Buf32) -> RequestBlock {
    let mut block = RequestBlock::default();
    block.prefix.primary_delegate = delegate;
    block.prefix.epoch_number = 1;
    block.prefix.sequence = sequence;
    block.prefix.previous = previous;
    block.prefix.timestamp = 1_000 + sequence as u64;
    block
}

#[test]
fn out_of_order_request_blocks_apply_once_gap_fills() {
    let (db, cache) = setup();

    let rb0 = empty_rb(4, 0, Buf32::zero());
    let rb1 = empty_rb(4, 1, rb0.digest());
    let rb1_hash = rb1.digest();

    // Successor first: parks in the cache, nothing applied.
    assert!(cache.add_rb(rb1));
    assert!(cache.is_block_cached(&rb1_hash));
    {
        let mut txn = db.begin();
        assert!(txn.rb_tip_get(4).unwrap().is_none());
    }

    // Predecessor arrives: both drain in order.
    assert!(cache.add_rb(rb0.clone()));
    assert!(!cache.is_block_cached(&rb1_hash));

    let mut txn = db.begin();
    assert_eq!(txn.rb_tip_get(4).unwrap().unwrap(), rb1_hash);
    // next pointer back-patched on the first block
    let stored = txn.request_block_get(&rb0.digest()).unwrap().unwrap();
    assert_eq!(stored.next, rb1_hash);
}

#[test]
fn duplicate_and_known_blocks_are_absorbed() {
    let (_db, cache) = setup();

    let rb0 = empty_rb(2, 0, Buf32::zero());
    assert!(cache.add_rb(rb0.clone()));
    // Applied immediately, so a re-add is recognized as known.
    assert!(cache.add_rb(rb0.clone()));
    assert!(!cache.is_block_cached(&rb0.digest()));
}

#[test]
fn chains_from_different_delegates_drain_independently() {
    let (db, cache) = setup();

    // Delegate 7's chain has a gap that must not block delegate 9.
    let d7_0 = empty_rb(7, 0, Buf32::zero());
    let d7_1 = empty_rb(7, 1, d7_0.digest());
    let d9_0 = empty_rb(9, 0, Buf32::zero());

    assert!(cache.add_rb(d7_1.clone()));
    assert!(cache.add_rb(d9_0.clone()));

    let mut txn = db.begin();
    assert!(txn.rb_tip_get(7).unwrap().is_none());
    assert_eq!(txn.rb_tip_get(9).unwrap().unwrap(), d9_0.digest());
    drop(txn);

    assert!(cache.add_rb(d7_0));
    let mut txn = db.begin();
    assert_eq!(txn.rb_tip_get(7).unwrap().unwrap(), d7_1.digest());
}
