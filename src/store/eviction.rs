//! Eviction facade (§4.2, "memory manager" external collaborator): which
//! storeKeys are safe to unload, and what unloading one actually clears.
//!
//! Grounded on the teacher's `storage::impls::default_record_store` eviction
//! sweep, which orders candidates by last-touched time and skips anything
//! with pending writes. The host-side memory manager itself is out of scope
//! (same boundary as the run-loop, §5) -- this module only answers "can I"
//! and "do it", exactly the two calls [`super::Store`] exposes publicly.

use crate::ids::StoreKey;
use crate::status::Status;

use super::Store;

/// Every storeKey eligible for eviction, ordered oldest-`last_access` first,
/// truncated to `config.eviction_batch_size` if set.
pub(crate) fn candidates(store: &Store) -> Vec<StoreKey> {
    let inner = store.inner.borrow();
    let mut keys: Vec<StoreKey> =
        inner.status.keys().copied().filter(|sk| is_eligible(&inner, *sk)).collect();
    keys.sort_by_key(|sk| inner.last_access.get(sk).copied().unwrap_or(i64::MIN));
    if let Some(limit) = inner.config.eviction_batch_size {
        keys.truncate(limit);
    }
    keys
}

fn is_eligible(inner: &super::StoreInner, sk: StoreKey) -> bool {
    let Some(status) = inner.status.get(&sk).copied() else { return false };
    if status.is(Status::NEW | Status::DIRTY | Status::COMMITTING | Status::LOADING) {
        return false;
    }
    if !status.is(Status::READY) {
        return false;
    }
    if let Some(weak) = inner.record_instances.get(&sk) {
        if weak.strong_count() > 0 {
            return false;
        }
    }
    true
}

/// Whether a single storeKey may be unloaded right now (same rule
/// [`candidates`] filters by, exposed for one-off checks).
pub(crate) fn may_unload(store: &Store, sk: StoreKey) -> bool {
    is_eligible(&store.inner.borrow(), sk)
}

/// Drops a storeKey's in-memory data/status bookkeeping, keeping only the
/// id <-> storeKey mapping so a later `getRecord` resolves to the same
/// identity instead of minting a duplicate.
pub(crate) fn unload(store: &Store, sk: StoreKey) {
    let mut inner = store.inner.borrow_mut();
    inner.data.remove(&sk);
    inner.changed.remove(&sk);
    inner.committed.remove(&sk);
    inner.rollback.remove(&sk);
    inner.last_access.remove(&sk);
    inner.record_instances.remove(&sk);
    inner.status.insert(sk, Status::EMPTY);
}
