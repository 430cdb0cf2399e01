//! End-to-end request scenarios over the in-memory store.

use std::sync::Arc;

use conclave_db::LedgerDb;
use conclave_persistence::genesis::{init_genesis, GenesisAccount};
use conclave_persistence::{RequestPersistence, Reservations};
use conclave_primitives::prelude::*;
use conclave_state::prelude::*;

const FEE: Amount = MIN_TRANSACTION_FEE;

fn funded(balance: Amount) -> (Arc<LedgerDb>, RequestPersistence, Buf32) {
    let db = Arc::new(LedgerDb::open());
    let account = Buf32::new([0xaa; 32]);
    init_genesis(
        &db,
        [DelegateEntry::default(); NUM_DELEGATES],
        &[GenesisAccount { account, balance }],
    )
    .unwrap();
    let persistence = RequestPersistence::new(db.clone(), Arc::new(Reservations::new()));
    (db, persistence, account)
}

fn send(origin: Buf32, previous: Buf32, sequence: u32, to: Buf32, amount: Amount) -> Request {
    Request::new(
        origin,
        previous,
        FEE,
        sequence,
        RequestPayload::Send { to, amount },
    )
}

fn seal(delegate: u8, epoch: u32, sequence: u32, previous: Buf32, requests: Vec<Request>) -> RequestBlock {
    let mut block = RequestBlock::default();
    block.prefix.primary_delegate = delegate;
    block.prefix.epoch_number = epoch;
    block.prefix.sequence = sequence;
    block.prefix.previous = previous;
    block.prefix.timestamp = 1_000;
    block.requests = requests;
    block
}

#[test]
fn send_happy_path() {
    let big = Amount::new(FEE.raw() * 100);
    let (db, persistence, a) = funded(big);
    let b = Buf32::new([0xbb; 32]);
    let amount = Amount::new(FEE.raw() * 10);

    let req = send(a, Buf32::zero(), 0, b, amount);
    let req_hash = req.digest();

    {
        let mut txn = db.begin();
        assert!(persistence.validate_request(&mut txn, &req, 1, false).is_ok());
    }

    let block = seal(0, 1, 0, Buf32::zero(), vec![req]);
    persistence.apply_updates(&block).unwrap();

    let mut txn = db.begin();
    let a_info = txn.account_get(&a).unwrap().unwrap();
    assert_eq!(a_info.balance, big - amount - FEE);
    assert_eq!(a_info.block_count, 1);
    assert_eq!(a_info.head, req_hash);
    assert!(a_info.reservation.is_zero());

    let b_info = txn.account_get(&b).unwrap().unwrap();
    assert_eq!(b_info.balance, amount);
    assert_eq!(b_info.receive_count, 1);
    assert_eq!(b_info.open_block, b_info.receive_head);

    let receive = txn.receive_get(&b_info.receive_head).unwrap().unwrap();
    assert_eq!(receive.send_hash, req_hash);
    assert_eq!(receive.amount, amount);

    // tip advanced and next back-patch left alone for the chain head
    assert_eq!(txn.rb_tip_get(0).unwrap().unwrap(), block.digest());
}

#[test]
fn fork_rejected_after_head_advance() {
    let big = Amount::new(FEE.raw() * 100);
    let (db, persistence, a) = funded(big);
    let b = Buf32::new([0xbb; 32]);

    let first = send(a, Buf32::zero(), 0, b, Amount::new(FEE.raw()));
    let block = seal(0, 1, 0, Buf32::zero(), vec![first]);
    persistence.apply_updates(&block).unwrap();

    // Same previous as the applied request: the chain has moved on.
    let stale = send(a, Buf32::zero(), 1, b, Amount::new(FEE.raw()));
    let mut txn = db.begin();
    assert_eq!(
        persistence.validate_request(&mut txn, &stale, 1, false),
        Err(ProcessResult::Fork)
    );
}

#[test]
fn duplicate_allowed_when_revalidating() {
    let big = Amount::new(FEE.raw() * 100);
    let (db, persistence, a) = funded(big);
    let b = Buf32::new([0xbb; 32]);

    let req = send(a, Buf32::zero(), 0, b, Amount::new(FEE.raw()));
    let block = seal(0, 1, 0, Buf32::zero(), vec![req.clone()]);
    persistence.apply_updates(&block).unwrap();

    let mut txn = db.begin();
    // Plain resubmission is old...
    assert_eq!(
        persistence.validate_request(&mut txn, &req, 1, false),
        Err(ProcessResult::Old)
    );
    // ...but batch re-validation admits the head duplicate.
    assert!(persistence.validate_request(&mut txn, &req, 1, true).is_ok());
}

#[test]
fn reapply_is_noop() {
    let big = Amount::new(FEE.raw() * 100);
    let (db, persistence, a) = funded(big);
    let b = Buf32::new([0xbb; 32]);

    let req = send(a, Buf32::zero(), 0, b, Amount::new(FEE.raw()));
    let block = seal(0, 1, 0, Buf32::zero(), vec![req]);
    persistence.apply_updates(&block).unwrap();

    let balance_after = {
        let mut txn = db.begin();
        txn.account_get(&a).unwrap().unwrap().balance
    };

    persistence.apply_updates(&block).unwrap();
    let mut txn = db.begin();
    assert_eq!(txn.account_get(&a).unwrap().unwrap().balance, balance_after);
}

#[test]
fn reservation_blocks_conflicting_send() {
    let big = Amount::new(FEE.raw() * 100);
    let (db, persistence, a) = funded(big);
    let b = Buf32::new([0xbb; 32]);
    let c = Buf32::new([0xcc; 32]);

    let first = send(a, Buf32::zero(), 0, b, Amount::new(FEE.raw()));
    let second = send(a, Buf32::zero(), 0, c, Amount::new(FEE.raw() * 2));

    let mut txn = db.begin();
    assert!(persistence.validate_request(&mut txn, &first, 5, false).is_ok());
    assert_eq!(
        persistence.validate_request(&mut txn, &second, 5, false),
        Err(ProcessResult::AlreadyReserved)
    );

    // The reservation expires after RESERVATION_PERIOD epochs.
    assert!(persistence
        .validate_request(&mut txn, &second, 5 + RESERVATION_PERIOD, false)
        .is_ok());
}

#[test]
fn basic_rejection_codes() {
    let big = Amount::new(FEE.raw() * 100);
    let (db, persistence, a) = funded(big);
    let b = Buf32::new([0xbb; 32]);
    let mut txn = db.begin();

    // burn origin
    let req = send(Buf32::zero(), Buf32::zero(), 0, b, Amount::new(1));
    assert_eq!(
        persistence.validate_request(&mut txn, &req, 1, false),
        Err(ProcessResult::OpenedBurnAccount)
    );

    // fee too small
    let mut req = send(a, Buf32::zero(), 0, b, Amount::new(1));
    req.fee = Amount::new(1);
    assert_eq!(
        persistence.validate_request(&mut txn, &req, 1, false),
        Err(ProcessResult::InsufficientFee)
    );

    // unknown source
    let req = send(b, Buf32::zero(), 0, a, Amount::new(1));
    assert_eq!(
        persistence.validate_request(&mut txn, &req, 1, false),
        Err(ProcessResult::UnknownSourceAccount)
    );

    // overdraw
    let req = send(a, Buf32::zero(), 0, b, big);
    assert_eq!(
        persistence.validate_request(&mut txn, &req, 1, false),
        Err(ProcessResult::InsufficientBalance)
    );
}

#[test]
fn source_chain_next_backpatched() {
    let big = Amount::new(FEE.raw() * 100);
    let (db, persistence, a) = funded(big);
    let b = Buf32::new([0xbb; 32]);

    let first = send(a, Buf32::zero(), 0, b, Amount::new(FEE.raw()));
    let first_hash = first.digest();
    let block0 = seal(0, 1, 0, Buf32::zero(), vec![first]);
    let block0_hash = persistence.apply_updates(&block0).unwrap();

    let second = send(a, first_hash, 1, b, Amount::new(FEE.raw()));
    let second_hash = second.digest();
    let block1 = seal(0, 1, 1, block0_hash, vec![second]);
    persistence.apply_updates(&block1).unwrap();

    let mut txn = db.begin();
    // request-level next
    let stored_first = txn.request_get(&first_hash).unwrap().unwrap();
    assert_eq!(stored_first.request.next, second_hash);
    // block-level next
    let stored_block0 = txn.request_block_get(&block0_hash).unwrap().unwrap();
    assert_eq!(stored_block0.next, block1.digest());
}

#[test]
fn receives_keep_causal_order() {
    let big = Amount::new(FEE.raw() * 1000);
    let (db, persistence, a) = funded(big);
    let dest = Buf32::new([0xdd; 32]);

    // Two sends sealed in blocks whose timestamps arrive out of order.
    let first = send(a, Buf32::zero(), 0, dest, Amount::new(FEE.raw()));
    let first_hash = first.digest();
    let mut late_block = seal(0, 1, 0, Buf32::zero(), vec![first]);
    late_block.prefix.timestamp = 9_000;
    let late_hash = persistence.apply_updates(&late_block).unwrap();

    let second = send(a, first_hash, 1, dest, Amount::new(FEE.raw()));
    let mut early_block = seal(0, 1, 1, late_hash, vec![second]);
    early_block.prefix.timestamp = 1_000;
    persistence.apply_updates(&early_block).unwrap();

    let mut txn = db.begin();
    let info = txn.account_get(&dest).unwrap().unwrap();
    assert_eq!(info.receive_count, 2);
    assert_eq!(info.balance, Amount::new(FEE.raw() * 2));

    // Head still the first (later-stamped) receive; the earlier-stamped one
    // was spliced behind it.
    let head = txn.receive_get(&info.receive_head).unwrap().unwrap();
    assert_eq!(head.timestamp, 9_000);
    let spliced = txn.receive_get(&head.previous).unwrap().unwrap();
    assert_eq!(spliced.timestamp, 1_000);
}
