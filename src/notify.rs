//! Per-type change notification fan-out.
//!
//! Generalises the teacher's [`crate::store`]-adjacent `QueryNotifier`
//! trait (`core-rust/src/traits.rs`) from "every write" to the richer event
//! shape §6.2 calls for: plain local/bulk record changes, and the separate
//! `typeId + ':server:' + accountId` server-invalidation channel that tells
//! remote queries to refresh even when no local record data changed.
//!
//! Observers are held weakly (`Weak<dyn TypeObserver>`) so that a
//! [`crate::query::local::LocalQuery`] or
//! [`crate::query::windowed::WindowedQuery`] can be dropped by the
//! application without the store needing an explicit `removeQuery` call to
//! avoid a reference-count leak -- dead entries are pruned the next time the
//! type fires.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Weak;

use crate::ids::{AccountId, StoreKey, TypeId};

/// A notification fired for a registered [`TypeId`].
#[derive(Debug, Clone)]
pub enum TypeEvent {
    /// One or more storeKeys of this type changed (create/update/destroy,
    /// including bulk upserts from `sourceDidFetchRecords`).
    Changed(Vec<StoreKey>),
    /// The server reported a new state token for `account`; queries should
    /// treat their cached results as possibly stale even if no local record
    /// changed.
    ServerStateChanged(AccountId),
}

/// Observer of a single registered type's change stream.
pub trait TypeObserver {
    /// Called with every event fired for the type this observer registered
    /// against.
    fn on_type_event(&self, event: &TypeEvent);
}

/// Per-`TypeId` fan-out registry, owned by the [`crate::store::Store`].
#[derive(Default)]
pub struct ObserverRegistry {
    by_type: RefCell<HashMap<TypeId, Vec<Weak<dyn TypeObserver>>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` against `type_id`. The registry does not keep
    /// `observer` alive; the caller's `Rc` is the owning reference.
    pub fn register(&self, type_id: TypeId, observer: Weak<dyn TypeObserver>) {
        self.by_type.borrow_mut().entry(type_id).or_default().push(observer);
    }

    /// Fires `event` to every live observer registered against `type_id`,
    /// pruning any that have been dropped.
    pub fn fire(&self, type_id: TypeId, event: &TypeEvent) {
        let mut by_type = self.by_type.borrow_mut();
        let Some(observers) = by_type.get_mut(&type_id) else {
            return;
        };
        observers.retain(|weak| {
            if let Some(observer) = weak.upgrade() {
                observer.on_type_event(event);
                true
            } else {
                false
            }
        });
    }

    /// Number of currently-live observers for `type_id` (used by tests and
    /// by `optimiseFetching`-style liveness checks).
    #[must_use]
    pub fn live_count(&self, type_id: TypeId) -> usize {
        self.by_type
            .borrow()
            .get(&type_id)
            .map(|v| v.iter().filter(|w| w.strong_count() > 0).count())
            .unwrap_or(0)
    }
}
