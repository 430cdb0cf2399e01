//! Construction helpers: dev genesis, aggregate verification against the
//! sealed committee, and per-epoch stack assembly.

use std::sync::Arc;

use conclave_consensus::{
    ConsensusManager, ConsensusSink, EpochDriver, MicroDriver, RequestDriver, RequestHandler,
};
use conclave_crypto::bls::{verify_aggregate, BlsKeyPair, BlsPubKey};
use conclave_db::LedgerDb;
use conclave_persistence::genesis::{init_genesis, GenesisAccount};
use conclave_persistence::{
    AggVerifier, EpochPersistence, MicroPersistence, RequestPersistence, Reservations,
};
use conclave_primitives::prelude::*;
use conclave_state::block::{Block, DelegateEntry};
use parking_lot::RwLock;
use tracing::*;

use crate::network::ConsensusStack;

/// Deterministic devnet identity for a committee seat.  Production key
/// material comes from the external identity manager.
pub fn dev_bls_keypair(delegate: DelegateId) -> BlsKeyPair {
    let mut seed = [0x51u8; 32];
    seed[0] = delegate + 1;
    BlsKeyPair::from_seed(&seed).expect("init: dev bls key")
}

/// A devnet committee with equal weights, plus one funded faucet account.
pub fn dev_genesis(db: &Arc<LedgerDb>, faucet: Buf32) -> anyhow::Result<()> {
    let mut committee = [DelegateEntry::default(); NUM_DELEGATES];
    for (idx, entry) in committee.iter_mut().enumerate() {
        let keys = dev_bls_keypair(idx as DelegateId);
        let mut account = Buf32::zero();
        account.0[31] = idx as u8 + 1;
        entry.account = account;
        entry.bls_key = Buf48::new(*keys.public().compressed());
        entry.vote = Amount::new(1);
        entry.stake = Amount::new(1);
    }

    init_genesis(
        db,
        committee,
        &[GenesisAccount {
            account: faucet,
            balance: Amount::new(MIN_TRANSACTION_FEE.raw() * 1_000_000),
        }],
    )?;
    info!("seeded devnet genesis");
    Ok(())
}

/// Verifies sealed-block aggregates against the committee the node
/// currently trusts; the key set swaps on epoch rotation.
pub struct CommitteeVerifier {
    keys: RwLock<Vec<Option<BlsPubKey>>>,
}

impl CommitteeVerifier {
    pub fn new(committee: &[DelegateEntry; NUM_DELEGATES]) -> Arc<Self> {
        let verifier = Arc::new(Self {
            keys: RwLock::new(Vec::new()),
        });
        verifier.rotate(committee);
        verifier
    }

    pub fn rotate(&self, committee: &[DelegateEntry; NUM_DELEGATES]) {
        let keys = committee
            .iter()
            .map(|entry| BlsPubKey::from_bytes(entry.bls_key.as_bytes()).ok())
            .collect();
        *self.keys.write() = keys;
    }
}

impl AggVerifier for CommitteeVerifier {
    fn verify_block(&self, block: &Block) -> bool {
        let (digest, agg) = match block {
            Block::Request(b) => (b.digest(), b.signature),
            Block::Micro(b) => (b.digest(), b.signature),
            Block::Epoch(b) => (b.digest(), b.signature),
        };

        let keys = self.keys.read();
        let Some(pad) = keys.iter().flatten().next().cloned() else {
            return false;
        };
        for idx in 0..NUM_DELEGATES {
            if agg.map & (1u32 << idx) != 0 && keys.get(idx).map(|k| k.is_none()).unwrap_or(true)
            {
                return false;
            }
        }
        let committee: Vec<BlsPubKey> = keys
            .iter()
            .map(|k| k.clone().unwrap_or_else(|| pad.clone()))
            .collect();
        verify_aggregate(&digest, agg.map, &agg.sig, &committee)
    }
}

/// Persistence handles shared by every stack.
#[derive(Clone)]
pub struct PersistenceHandles {
    pub request: Arc<RequestPersistence>,
    pub micro: Arc<MicroPersistence>,
    pub epoch: Arc<EpochPersistence>,
}

pub fn build_persistence(db: &Arc<LedgerDb>) -> PersistenceHandles {
    let reservations = Arc::new(Reservations::new());
    PersistenceHandles {
        request: Arc::new(RequestPersistence::new(db.clone(), reservations)),
        micro: Arc::new(MicroPersistence::new(db.clone())),
        epoch: Arc::new(EpochPersistence::new(db.clone())),
    }
}

/// Assembles the consensus machines for one epoch's committee.
pub fn build_stack(
    db: &Arc<LedgerDb>,
    persistence: &PersistenceHandles,
    delegate_id: DelegateId,
    epoch_number: u32,
    committee: [DelegateEntry; NUM_DELEGATES],
    keypair: Arc<BlsKeyPair>,
    sink: Arc<dyn ConsensusSink>,
) -> Arc<ConsensusStack> {
    let request_driver = Arc::new(RequestDriver::new(
        db.clone(),
        persistence.request.clone(),
        delegate_id,
    ));
    let micro_driver = Arc::new(MicroDriver::new(persistence.micro.clone()));
    let epoch_driver = Arc::new(EpochDriver::new(persistence.epoch.clone()));

    let request = ConsensusManager::new(
        delegate_id,
        epoch_number,
        committee.clone(),
        keypair.clone(),
        sink.clone(),
        request_driver,
    );
    let micro = ConsensusManager::new(
        delegate_id,
        epoch_number,
        committee.clone(),
        keypair.clone(),
        sink.clone(),
        micro_driver,
    );
    let epoch = ConsensusManager::new(
        delegate_id,
        epoch_number,
        committee,
        keypair,
        sink,
        epoch_driver,
    );

    let request_handler = Arc::new(RequestHandler::new(
        persistence.request.clone(),
        request.clone(),
    ));

    Arc::new(ConsensusStack {
        epoch_number,
        request,
        micro,
        epoch,
        request_handler,
    })
}

/// The committee sealed by the latest epoch block.
pub fn current_committee(
    db: &Arc<LedgerDb>,
) -> anyhow::Result<(u32, [DelegateEntry; NUM_DELEGATES])> {
    let mut txn = db.begin();
    let eb_hash = txn
        .eb_tip_get()?
        .ok_or_else(|| anyhow::anyhow!("no epoch tip, genesis missing"))?;
    let eb = txn
        .epoch_block_get(&eb_hash)?
        .ok_or_else(|| anyhow::anyhow!("missing epoch block {eb_hash}"))?;
    Ok((eb.epoch_number(), eb.delegates))
}
