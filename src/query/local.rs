//! `LocalQuery` (§4.4): a live view over every `READY` record of a type in
//! an account, filtered and sorted client-side. No round-trip to the
//! source is ever needed beyond the records the store already has.
//!
//! Grounded on the same "holds a handle back to the shared store,
//! recomputes on demand" shape [`crate::record::Record`] borrows from
//! `Store` itself (see `store/mod.rs`'s header), wired to
//! [`crate::notify::ObserverRegistry`] the same way `QueryNotifier`
//! (`core-rust/src/traits.rs`) tells a subscriber "something in your scope
//! changed" without saying what.

use std::cell::RefCell;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use serde_json::Value as JsonValue;

use crate::ids::{AccountId, StoreKey, TypeId};
use crate::notify::{TypeEvent, TypeObserver};
use crate::status::Status;
use crate::store::Store;

type Predicate = Box<dyn Fn(&HashMap<String, JsonValue>) -> bool>;
type Comparator = Box<dyn Fn(&HashMap<String, JsonValue>, &HashMap<String, JsonValue>) -> Ordering>;

struct Inner {
    results: Vec<StoreKey>,
    status: Status,
    destroyed: bool,
}

/// A client-computed, live-updating result set (§4.4). Holds no ownership
/// over the records it lists -- only their storeKeys.
pub struct LocalQuery {
    store: Store,
    type_id: TypeId,
    account_id: AccountId,
    where_: Option<Predicate>,
    sort: Option<Comparator>,
    inner: RefCell<Inner>,
}

impl LocalQuery {
    /// Builds and immediately computes a new query, registering it against
    /// the store's per-type change stream.
    #[must_use]
    pub fn new(
        store: Store,
        type_id: TypeId,
        account_id: AccountId,
        where_: Option<Predicate>,
        sort: Option<Comparator>,
    ) -> Rc<Self> {
        let query = Rc::new_cyclic(|weak: &Weak<LocalQuery>| {
            let observer: Weak<dyn TypeObserver> = weak.clone();
            store.register_observer(type_id, observer);
            LocalQuery {
                store,
                type_id,
                account_id,
                where_,
                sort,
                inner: RefCell::new(Inner { results: Vec::new(), status: Status::EMPTY, destroyed: false }),
            }
        });
        query.fetch(true);
        query
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    #[must_use]
    pub fn account_id(&self) -> &AccountId {
        &self.account_id
    }

    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.inner.borrow().status.is(Status::OBSOLETE)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }

    /// Recomputes the result set by rescanning the store's id index,
    /// filtering `READY` records through `where_`, then sorting. A no-op
    /// (returning `false`) unless `force` or the query is currently
    /// `OBSOLETE`. Full recompute rather than incremental maintenance,
    /// which §4.4 allows.
    pub fn fetch(&self, force: bool) -> bool {
        {
            let inner = self.inner.borrow();
            if inner.destroyed {
                return false;
            }
            if !force && inner.status.is(Status::READY) && !inner.status.is(Status::OBSOLETE) {
                return false;
            }
        }
        let mut keys = self.store.get_all(&self.account_id, self.type_id);
        if let Some(where_) = &self.where_ {
            keys.retain(|sk| where_(&self.store.get_data(*sk)));
        }
        if let Some(sort) = &self.sort {
            keys.sort_by(|a, b| sort(&self.store.get_data(*a), &self.store.get_data(*b)));
        }
        let mut inner = self.inner.borrow_mut();
        inner.results = keys;
        inner.status = Status::READY;
        true
    }

    #[must_use]
    pub fn results(&self) -> Vec<StoreKey> {
        self.inner.borrow().results.clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().results.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<StoreKey> {
        self.inner.borrow().results.get(index).copied()
    }

    /// Deregisters this query. The store only ever held a `Weak` reference
    /// (§3.4 invariant 7), so this just stops `fetch` from doing anything
    /// further -- dropping the last `Rc<LocalQuery>` is what actually frees
    /// it.
    pub fn destroy(&self) {
        self.inner.borrow_mut().destroyed = true;
    }
}

impl TypeObserver for LocalQuery {
    fn on_type_event(&self, event: &TypeEvent) {
        let relevant = match event {
            TypeEvent::Changed(keys) => keys
                .iter()
                .any(|sk| self.store.get_account_id_from_store_key(*sk).as_ref() == Some(&self.account_id)),
            TypeEvent::ServerStateChanged(account) => account == &self.account_id,
        };
        if relevant {
            let mut inner = self.inner.borrow_mut();
            inner.status = inner.status | Status::OBSOLETE;
        }
    }
}
