//! In-memory reference implementation of the storage contract.
//!
//! The production engine (an LMDB-style environment) is an external
//! collaborator; it must provide exactly this shape: `begin()` returning a
//! read-write transaction over the named spaces, atomic `commit()`, and
//! key-ordered iteration.  A transaction holds the single-writer lock for
//! its lifetime; dropping it without committing discards its writes.

use std::collections::{BTreeMap, HashMap};

use borsh::{BorshDeserialize, BorshSerialize};
use conclave_primitives::prelude::*;
use parking_lot::{Mutex, MutexGuard};

use crate::errors::{DbError, DbResult};
use crate::spaces::{Space, SCHEMA_VERSION};
use crate::types::StoredRequest;

type SpaceMap = BTreeMap<Vec<u8>, Vec<u8>>;

#[derive(Default)]
struct Spaces {
    maps: HashMap<Space, SpaceMap>,
}

impl Spaces {
    fn space(&self, space: Space) -> Option<&SpaceMap> {
        self.maps.get(&space)
    }

    fn space_mut(&mut self, space: Space) -> &mut SpaceMap {
        self.maps.entry(space).or_default()
    }
}

/// The in-memory ledger store.
pub struct LedgerDb {
    spaces: Mutex<Spaces>,
}

impl Default for LedgerDb {
    fn default() -> Self {
        Self::open()
    }
}

impl LedgerDb {
    /// Opens a fresh store with the current schema version stamped.
    pub fn open() -> Self {
        let db = Self {
            spaces: Mutex::new(Spaces::default()),
        };
        {
            let mut txn = db.begin();
            txn.put(Space::Meta, b"version", &SCHEMA_VERSION)
                .expect("db: stamp version");
            txn.commit().expect("db: stamp version");
        }
        db
    }

    /// Starts a read-write transaction.  Holds the writer lock until the
    /// transaction commits or is dropped.
    pub fn begin(&self) -> LedgerTxn<'_> {
        LedgerTxn {
            guard: self.spaces.lock(),
            writes: HashMap::new(),
        }
    }

    pub fn schema_version(&self) -> DbResult<u32> {
        let mut txn = self.begin();
        txn.get::<u32>(Space::Meta, b"version")?
            .ok_or(DbError::Missing("meta"))
    }
}

/// A read-write transaction.  Writes are buffered and applied atomically on
/// `commit`; reads observe the buffered writes.
pub struct LedgerTxn<'db> {
    guard: MutexGuard<'db, Spaces>,
    writes: HashMap<Space, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl<'db> LedgerTxn<'db> {
    pub fn raw_get(&self, space: Space, key: &[u8]) -> Option<Vec<u8>> {
        if let Some(pending) = self.writes.get(&space).and_then(|m| m.get(key)) {
            return pending.clone();
        }
        self.guard.space(space).and_then(|m| m.get(key)).cloned()
    }

    pub fn raw_put(&mut self, space: Space, key: Vec<u8>, value: Vec<u8>) {
        self.writes.entry(space).or_default().insert(key, Some(value));
    }

    pub fn raw_del(&mut self, space: Space, key: &[u8]) {
        self.writes
            .entry(space)
            .or_default()
            .insert(key.to_vec(), None);
    }

    pub fn exists(&self, space: Space, key: &[u8]) -> bool {
        self.raw_get(space, key).is_some()
    }

    /// Key-ordered scan of a space restricted to a key prefix, merged over
    /// the transaction's own writes.
    pub fn scan_prefix(&self, space: Space, prefix: &[u8]) -> Vec<(Vec<u8>, Vec<u8>)> {
        let mut merged: BTreeMap<Vec<u8>, Option<Vec<u8>>> = BTreeMap::new();
        if let Some(m) = self.guard.space(space) {
            for (k, v) in m.range(prefix.to_vec()..) {
                if !k.starts_with(prefix) {
                    break;
                }
                merged.insert(k.clone(), Some(v.clone()));
            }
        }
        if let Some(m) = self.writes.get(&space) {
            for (k, v) in m {
                if k.starts_with(prefix) {
                    merged.insert(k.clone(), v.clone());
                }
            }
        }
        merged
            .into_iter()
            .filter_map(|(k, v)| v.map(|v| (k, v)))
            .collect()
    }

    pub fn get<T: BorshDeserialize>(&mut self, space: Space, key: &[u8]) -> DbResult<Option<T>> {
        match self.raw_get(space, key) {
            None => Ok(None),
            Some(bytes) => T::try_from_slice(&bytes)
                .map(Some)
                .map_err(|e| DbError::Codec(space.name(), e.to_string())),
        }
    }

    pub fn put<T: BorshSerialize>(
        &mut self,
        space: Space,
        key: &[u8],
        value: &T,
    ) -> DbResult<()> {
        let bytes =
            borsh::to_vec(value).map_err(|e| DbError::Codec(space.name(), e.to_string()))?;
        self.raw_put(space, key.to_vec(), bytes);
        Ok(())
    }

    pub fn del(&mut self, space: Space, key: &[u8]) {
        self.raw_del(space, key);
    }

    /// Atomically applies all buffered writes.
    pub fn commit(mut self) -> DbResult<()> {
        let writes = std::mem::take(&mut self.writes);
        for (space, entries) in writes {
            let map = self.guard.space_mut(space);
            for (k, v) in entries {
                match v {
                    Some(v) => {
                        map.insert(k, v);
                    }
                    None => {
                        map.remove(&k);
                    }
                }
            }
        }
        Ok(())
    }
}

// Domain accessors.  Key layouts: plain 32-byte hashes/accounts; composite
// keys concatenate fixed-width parts with multi-byte integers big-endian so
// the scan order is meaningful.
impl<'db> LedgerTxn<'db> {
    pub fn request_block_get(&mut self, hash: &Buf32) -> DbResult<Option<conclave_state::block::RequestBlock>> {
        self.get(Space::RequestBlock, hash.as_slice())
    }

    pub fn request_block_put(&mut self, hash: &Buf32, block: &conclave_state::block::RequestBlock) -> DbResult<()> {
        self.put(Space::RequestBlock, hash.as_slice(), block)
    }

    pub fn request_block_exists(&self, hash: &Buf32) -> bool {
        self.exists(Space::RequestBlock, hash.as_slice())
    }

    pub fn micro_block_get(&mut self, hash: &Buf32) -> DbResult<Option<conclave_state::block::MicroBlock>> {
        self.get(Space::MicroBlock, hash.as_slice())
    }

    pub fn micro_block_put(&mut self, hash: &Buf32, block: &conclave_state::block::MicroBlock) -> DbResult<()> {
        self.put(Space::MicroBlock, hash.as_slice(), block)
    }

    pub fn micro_block_exists(&self, hash: &Buf32) -> bool {
        self.exists(Space::MicroBlock, hash.as_slice())
    }

    pub fn epoch_block_get(&mut self, hash: &Buf32) -> DbResult<Option<conclave_state::block::EpochBlock>> {
        self.get(Space::EpochBlock, hash.as_slice())
    }

    pub fn epoch_block_put(&mut self, hash: &Buf32, block: &conclave_state::block::EpochBlock) -> DbResult<()> {
        self.put(Space::EpochBlock, hash.as_slice(), block)
    }

    pub fn epoch_block_exists(&self, hash: &Buf32) -> bool {
        self.exists(Space::EpochBlock, hash.as_slice())
    }

    pub fn rb_tip_get(&mut self, delegate: DelegateId) -> DbResult<Option<Buf32>> {
        self.get(Space::RequestBlockTip, &[delegate])
    }

    pub fn rb_tip_put(&mut self, delegate: DelegateId, hash: &Buf32) -> DbResult<()> {
        self.put(Space::RequestBlockTip, &[delegate], hash)
    }

    pub fn mb_tip_get(&mut self) -> DbResult<Option<Buf32>> {
        self.get(Space::MicroBlockTip, b"tip")
    }

    pub fn mb_tip_put(&mut self, hash: &Buf32) -> DbResult<()> {
        self.put(Space::MicroBlockTip, b"tip", hash)
    }

    pub fn eb_tip_get(&mut self) -> DbResult<Option<Buf32>> {
        self.get(Space::EpochBlockTip, b"tip")
    }

    pub fn eb_tip_put(&mut self, hash: &Buf32) -> DbResult<()> {
        self.put(Space::EpochBlockTip, b"tip", hash)
    }

    pub fn account_get(&mut self, account: &Buf32) -> DbResult<Option<conclave_state::account::AccountInfo>> {
        self.get(Space::Account, account.as_slice())
    }

    pub fn account_put(&mut self, account: &Buf32, info: &conclave_state::account::AccountInfo) -> DbResult<()> {
        self.put(Space::Account, account.as_slice(), info)
    }

    pub fn token_account_get(&mut self, token: &Buf32) -> DbResult<Option<conclave_state::account::TokenAccount>> {
        self.get(Space::TokenAccount, token.as_slice())
    }

    pub fn token_account_put(&mut self, token: &Buf32, info: &conclave_state::account::TokenAccount) -> DbResult<()> {
        self.put(Space::TokenAccount, token.as_slice(), info)
    }

    pub fn receive_get(&mut self, hash: &Buf32) -> DbResult<Option<conclave_state::receive::ReceiveRecord>> {
        self.get(Space::Receive, hash.as_slice())
    }

    pub fn receive_put(&mut self, hash: &Buf32, rec: &conclave_state::receive::ReceiveRecord) -> DbResult<()> {
        self.put(Space::Receive, hash.as_slice(), rec)
    }

    pub fn request_get(&mut self, hash: &Buf32) -> DbResult<Option<StoredRequest>> {
        self.get(Space::Request, hash.as_slice())
    }

    pub fn request_put(&mut self, hash: &Buf32, entry: &StoredRequest) -> DbResult<()> {
        self.put(Space::Request, hash.as_slice(), entry)
    }

    pub fn request_exists(&self, hash: &Buf32) -> bool {
        self.exists(Space::Request, hash.as_slice())
    }

    fn staking_key(origin: &Buf32, target: &Buf32) -> Vec<u8> {
        let mut key = Vec::with_capacity(64);
        key.extend_from_slice(origin.as_slice());
        key.extend_from_slice(target.as_slice());
        key
    }

    pub fn staking_get(&mut self, origin: &Buf32, target: &Buf32) -> DbResult<Option<conclave_state::staking::StakedFunds>> {
        self.get(Space::Staking, &Self::staking_key(origin, target))
    }

    pub fn staking_put(&mut self, funds: &conclave_state::staking::StakedFunds) -> DbResult<()> {
        self.put(
            Space::Staking,
            &Self::staking_key(&funds.origin, &funds.target),
            funds,
        )
    }

    pub fn staking_del(&mut self, origin: &Buf32, target: &Buf32) {
        self.del(Space::Staking, &Self::staking_key(origin, target));
    }

    /// All stakes placed by `origin`, in target order.
    pub fn staking_scan(&mut self, origin: &Buf32) -> DbResult<Vec<conclave_state::staking::StakedFunds>> {
        self.scan_prefix(Space::Staking, origin.as_slice())
            .into_iter()
            .map(|(_, v)| {
                conclave_state::staking::StakedFunds::try_from_slice(&v)
                    .map_err(|e| DbError::Codec("staking", e.to_string()))
            })
            .collect()
    }

    fn thawing_key(origin: &Buf32, expiration: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(36);
        key.extend_from_slice(origin.as_slice());
        key.extend_from_slice(&expiration.to_be_bytes());
        key
    }

    pub fn thawing_get(&mut self, origin: &Buf32, expiration: u32) -> DbResult<Option<conclave_state::staking::ThawingFunds>> {
        self.get(Space::Thawing, &Self::thawing_key(origin, expiration))
    }

    pub fn thawing_put(&mut self, funds: &conclave_state::staking::ThawingFunds) -> DbResult<()> {
        self.put(
            Space::Thawing,
            &Self::thawing_key(&funds.origin, funds.expiration_epoch),
            funds,
        )
    }

    pub fn thawing_del(&mut self, origin: &Buf32, expiration: u32) {
        self.del(Space::Thawing, &Self::thawing_key(origin, expiration));
    }

    /// All thawing funds of `origin`, in expiration order (frozen funds
    /// first, at expiration 0).
    pub fn thawing_scan(&mut self, origin: &Buf32) -> DbResult<Vec<conclave_state::staking::ThawingFunds>> {
        self.scan_prefix(Space::Thawing, origin.as_slice())
            .into_iter()
            .map(|(_, v)| {
                conclave_state::staking::ThawingFunds::try_from_slice(&v)
                    .map_err(|e| DbError::Codec("thawing", e.to_string()))
            })
            .collect()
    }

    pub fn liability_get(&mut self, id: &Buf32) -> DbResult<Option<conclave_state::staking::Liability>> {
        self.get(Space::Liability, id.as_slice())
    }

    pub fn liability_put(&mut self, id: &Buf32, liability: &conclave_state::staking::Liability) -> DbResult<()> {
        self.put(Space::Liability, id.as_slice(), liability)
    }

    pub fn liability_del(&mut self, id: &Buf32) {
        self.del(Space::Liability, id.as_slice());
    }

    pub fn voting_power_get(&mut self, rep: &Buf32) -> DbResult<Option<conclave_state::staking::VotingPowerInfo>> {
        self.get(Space::VotingPower, rep.as_slice())
    }

    pub fn voting_power_put(&mut self, rep: &Buf32, info: &conclave_state::staking::VotingPowerInfo) -> DbResult<()> {
        self.put(Space::VotingPower, rep.as_slice(), info)
    }

    pub fn voting_power_del(&mut self, rep: &Buf32) {
        self.del(Space::VotingPower, rep.as_slice());
    }

    pub fn candidacy_get(&mut self, account: &Buf32) -> DbResult<Option<conclave_state::governance::CandidacyInfo>> {
        self.get(Space::Candidacy, account.as_slice())
    }

    pub fn candidacy_put(&mut self, account: &Buf32, info: &conclave_state::governance::CandidacyInfo) -> DbResult<()> {
        self.put(Space::Candidacy, account.as_slice(), info)
    }

    pub fn candidacy_del(&mut self, account: &Buf32) {
        self.del(Space::Candidacy, account.as_slice());
    }

    pub fn candidacy_scan(&mut self) -> DbResult<Vec<(Buf32, conclave_state::governance::CandidacyInfo)>> {
        self.scan_prefix(Space::Candidacy, &[])
            .into_iter()
            .map(|(k, v)| {
                let account = Buf32::try_from(k.as_slice())
                    .map_err(|_| DbError::Codec("candidacy", "bad key".into()))?;
                let info = conclave_state::governance::CandidacyInfo::try_from_slice(&v)
                    .map_err(|e| DbError::Codec("candidacy", e.to_string()))?;
                Ok((account, info))
            })
            .collect()
    }

    pub fn rep_get(&mut self, rep: &Buf32) -> DbResult<Option<conclave_state::governance::RepInfo>> {
        self.get(Space::Representative, rep.as_slice())
    }

    pub fn rep_put(&mut self, rep: &Buf32, info: &conclave_state::governance::RepInfo) -> DbResult<()> {
        self.put(Space::Representative, rep.as_slice(), info)
    }

    pub fn rep_del(&mut self, rep: &Buf32) {
        self.del(Space::Representative, rep.as_slice());
    }

    fn reward_key(account: &Buf32, epoch: u32) -> Vec<u8> {
        let mut key = Vec::with_capacity(36);
        key.extend_from_slice(account.as_slice());
        key.extend_from_slice(&epoch.to_be_bytes());
        key
    }

    pub fn reward_get(&mut self, account: &Buf32, epoch: u32) -> DbResult<Option<conclave_state::governance::RewardInfo>> {
        self.get(Space::Reward, &Self::reward_key(account, epoch))
    }

    pub fn reward_put(&mut self, account: &Buf32, epoch: u32, info: &conclave_state::governance::RewardInfo) -> DbResult<()> {
        self.put(Space::Reward, &Self::reward_key(account, epoch), info)
    }

    pub fn global_reward_get(&mut self, epoch: u32) -> DbResult<Option<conclave_state::governance::GlobalRewardInfo>> {
        self.get(Space::GlobalReward, &epoch.to_be_bytes())
    }

    pub fn global_reward_put(&mut self, epoch: u32, info: &conclave_state::governance::GlobalRewardInfo) -> DbResult<()> {
        self.put(Space::GlobalReward, &epoch.to_be_bytes(), info)
    }

    pub fn p2p_blob_get(&mut self, name: &str) -> DbResult<Option<Vec<u8>>> {
        Ok(self.raw_get(Space::P2p, name.as_bytes()))
    }

    pub fn p2p_blob_put(&mut self, name: &str, blob: Vec<u8>) {
        self.raw_put(Space::P2p, name.as_bytes().to_vec(), blob);
    }
}

#[cfg(test)]
mod test {
    use conclave_state::account::AccountInfo;

    use super::*;

    #[test]
    fn test_uncommitted_writes_discarded() {
        let db = LedgerDb::open();
        let account = Buf32::new([1; 32]);
        {
            let mut txn = db.begin();
            txn.account_put(&account, &AccountInfo::default()).unwrap();
            // dropped without commit
        }
        let mut txn = db.begin();
        assert!(txn.account_get(&account).unwrap().is_none());
    }

    #[test]
    fn test_txn_reads_own_writes() {
        let db = LedgerDb::open();
        let account = Buf32::new([1; 32]);
        let mut txn = db.begin();
        let mut info = AccountInfo::default();
        info.block_count = 3;
        txn.account_put(&account, &info).unwrap();
        assert_eq!(txn.account_get(&account).unwrap().unwrap().block_count, 3);
        txn.commit().unwrap();

        let mut txn = db.begin();
        assert_eq!(txn.account_get(&account).unwrap().unwrap().block_count, 3);
    }

    #[test]
    fn test_scan_order_and_delete_overlay() {
        let db = LedgerDb::open();
        let mut txn = db.begin();
        for i in [3u8, 1, 2] {
            txn.raw_put(Space::Meta, vec![b'k', i], vec![i]);
        }
        txn.commit().unwrap();

        let mut txn = db.begin();
        txn.raw_del(Space::Meta, &[b'k', 2]);
        let keys: Vec<_> = txn
            .scan_prefix(Space::Meta, b"k")
            .into_iter()
            .map(|(k, _)| k[1])
            .collect();
        assert_eq!(keys, vec![1, 3]);
    }

    #[test]
    fn test_schema_version_stamped() {
        let db = LedgerDb::open();
        assert_eq!(db.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_thawing_scan_orders_by_expiration() {
        use conclave_state::staking::ThawingFunds;
        let db = LedgerDb::open();
        let origin = Buf32::new([7; 32]);
        let mut txn = db.begin();
        for exp in [44u32, 0, 43] {
            txn.thawing_put(&ThawingFunds {
                origin,
                target: origin,
                amount: conclave_primitives::amount::Amount::new(exp as u128),
                expiration_epoch: exp,
                liability: Buf32::zero(),
            })
            .unwrap();
        }
        txn.commit().unwrap();

        let mut txn = db.begin();
        let expirations: Vec<_> = txn
            .thawing_scan(&origin)
            .unwrap()
            .into_iter()
            .map(|f| f.expiration_epoch)
            .collect();
        assert_eq!(expirations, vec![0, 43, 44]);
    }
}
