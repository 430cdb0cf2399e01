//! Full three-phase round between a primary and a backup, with the rest of
//! the committee simulated by signature shares.

use std::collections::VecDeque;
use std::sync::Arc;

use conclave_consensus::{ConsensusManager, ConsensusSink, RequestDriver, RoundState};
use conclave_crypto::bls::BlsKeyPair;
use conclave_db::LedgerDb;
use conclave_persistence::genesis::init_genesis;
use conclave_persistence::{RequestPersistence, Reservations};
use conclave_primitives::prelude::*;
use conclave_state::block::{DelegateEntry, RequestBlock};
use conclave_wire::{ConsensusMessage, PrepareMsg, Prequel, PREQUEL_SIZE};
use parking_lot::Mutex;

struct QueueSink {
    frames: Mutex<VecDeque<(Option<DelegateId>, Vec<u8>)>>,
}

impl QueueSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            frames: Mutex::new(VecDeque::new()),
        })
    }

    fn pop(&self) -> (Option<DelegateId>, ConsensusMessage) {
        let (target, frame) = self
            .frames
            .lock()
            .pop_front()
            .expect("expected an outbound frame");
        let prequel = Prequel::decode(frame[..PREQUEL_SIZE].try_into().unwrap()).unwrap();
        let msg = ConsensusMessage::decode_frame(&prequel, &frame[PREQUEL_SIZE..]).unwrap();
        (target, msg)
    }
}

impl ConsensusSink for QueueSink {
    fn send_to(&self, target: DelegateId, frame: Vec<u8>) {
        self.frames.lock().push_back((Some(target), frame));
    }

    fn broadcast(&self, frame: Vec<u8>) {
        self.frames.lock().push_back((None, frame));
    }
}

fn committee_keys() -> Vec<BlsKeyPair> {
    (0..NUM_DELEGATES)
        .map(|idx| {
            let mut seed = [0x77u8; 32];
            seed[0] = idx as u8 + 1;
            BlsKeyPair::from_seed(&seed).unwrap()
        })
        .collect()
}

fn committee_of(keys: &[BlsKeyPair]) -> [DelegateEntry; NUM_DELEGATES] {
    let mut committee = [DelegateEntry::default(); NUM_DELEGATES];
    for (idx, entry) in committee.iter_mut().enumerate() {
        let mut account = Buf32::zero();
        account.0[31] = idx as u8 + 1;
        entry.account = account;
        entry.bls_key = Buf48::new(*keys[idx].public().compressed());
        entry.vote = Amount::new(1);
        entry.stake = Amount::new(1);
    }
    committee
}

fn node(
    delegate: DelegateId,
    keys: &[BlsKeyPair],
    sink: Arc<QueueSink>,
) -> (Arc<LedgerDb>, Arc<ConsensusManager<RequestBlock>>) {
    let committee = committee_of(keys);
    let db = Arc::new(LedgerDb::open());
    init_genesis(&db, committee.clone(), &[]).unwrap();

    let persistence = Arc::new(RequestPersistence::new(
        db.clone(),
        Arc::new(Reservations::new()),
    ));
    let driver = Arc::new(RequestDriver::new(db.clone(), persistence, delegate));

    let mut seed = [0x77u8; 32];
    seed[0] = delegate + 1;
    let keypair = Arc::new(BlsKeyPair::from_seed(&seed).unwrap());

    let manager = ConsensusManager::new(delegate, 1, committee, keypair, sink, driver);
    manager.on_delegates_connected();
    (db, manager)
}

#[tokio::test]
async fn empty_round_reaches_post_commit_on_both_roles() {
    let keys = committee_keys();
    let primary_sink = QueueSink::new();
    let backup_sink = QueueSink::new();

    let (primary_db, primary) = node(0, &keys, primary_sink.clone());
    let (backup_db, backup) = node(1, &keys, backup_sink.clone());

    // Primary proposes an empty batch.
    let mut proposal = RequestBlock::default();
    proposal.prefix.primary_delegate = 0;
    proposal.prefix.epoch_number = 1;
    primary.queue_proposal(proposal);
    assert_eq!(primary.round_state(), RoundState::PrePrepare);

    // Backup validates the pre-prepare and answers with a prepare.
    let (target, pre_prepare) = primary_sink.pop();
    assert!(target.is_none());
    backup.on_message(0, pre_prepare);
    let (target, prepare_msg) = backup_sink.pop();
    assert_eq!(target, Some(0));

    let ConsensusMessage::Prepare(prepare) = prepare_msg.clone() else {
        panic!("expected prepare, got {prepare_msg:?}");
    };

    // The backup plus twenty simulated peers cross the 22-weight quorum.
    primary.on_message(1, prepare_msg);
    for peer in 2u8..22 {
        let share = keys[peer as usize].sign(&prepare.previous);
        primary.on_message(
            peer,
            ConsensusMessage::Prepare(PrepareMsg {
                previous: prepare.previous,
                signature: share,
            }),
        );
    }
    assert_eq!(primary.round_state(), RoundState::PostPrepare);

    // Post-prepare goes out; the backup commits.
    let (_, post_prepare) = primary_sink.pop();
    backup.on_message(0, post_prepare);
    let (target, commit_msg) = backup_sink.pop();
    assert_eq!(target, Some(0));
    let ConsensusMessage::Commit(commit) = commit_msg.clone() else {
        panic!("expected commit, got {commit_msg:?}");
    };

    primary.on_message(1, commit_msg);
    for peer in 2u8..22 {
        let share = keys[peer as usize].sign(&commit.previous);
        primary.on_message(
            peer,
            ConsensusMessage::Commit(conclave_wire::CommitMsg {
                previous: commit.previous,
                signature: share,
            }),
        );
    }

    // The primary sealed and applied the block.
    assert_eq!(primary.round_state(), RoundState::Void);
    {
        let mut txn = primary_db.begin();
        assert!(txn.rb_tip_get(0).unwrap().is_some());
    }

    // The post-commit lands on the backup, which applies the same block.
    let (_, post_commit) = primary_sink.pop();
    backup.on_message(0, post_commit);
    let mut primary_txn = primary_db.begin();
    let mut backup_txn = backup_db.begin();
    assert_eq!(
        backup_txn.rb_tip_get(0).unwrap(),
        primary_txn.rb_tip_get(0).unwrap()
    );

    // The sealed block's aggregate verifies over its digest (popcount at
    // quorum).
    let tip = primary_txn.rb_tip_get(0).unwrap().unwrap();
    let sealed = primary_txn.request_block_get(&tip).unwrap().unwrap();
    assert!(sealed.signature.popcount() >= 22);
}
