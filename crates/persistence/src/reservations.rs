//! Per-account scoped locks serializing reservation checks.

use std::collections::HashMap;
use std::sync::Arc;

use conclave_primitives::buf::Buf32;
use parking_lot::Mutex;

/// Hands out one lock per account so concurrent validations of the same
/// send source serialize, while unrelated accounts proceed in parallel.
#[derive(Default)]
pub struct Reservations {
    locks: Mutex<HashMap<Buf32, Arc<Mutex<()>>>>,
}

impl Reservations {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scoped lock for an account.  Callers hold the returned guard's
    /// lock for the duration of the reservation check.
    pub fn account_lock(&self, account: &Buf32) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.entry(*account).or_default().clone()
    }

    /// Drops the lock entry once an account has no in-flight checks.
    pub fn release(&self, account: &Buf32) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(account) {
            // Strong count 1 means only the map holds it.
            if Arc::strong_count(lock) == 1 {
                locks.remove(account);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_same_account_same_lock() {
        let res = Reservations::new();
        let account = Buf32::new([1; 32]);
        let a = res.account_lock(&account);
        let b = res.account_lock(&account);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_release_prunes_idle() {
        let res = Reservations::new();
        let account = Buf32::new([1; 32]);
        {
            let _guard = res.account_lock(&account);
        }
        res.release(&account);
        assert!(res.locks.lock().is_empty());
    }
}
