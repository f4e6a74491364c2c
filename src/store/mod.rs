//! The Store: identity mapping, status machine, commit pipeline entry
//! points, and the public API applications call (§4.2, §6.2).
//!
//! Grounded on the teacher's `storage::record_store::RecordStore` /
//! `storage::impls::default_record_store::DefaultRecordStore`
//! (`server-rust/src/storage/`): a single owner of per-key tables behind
//! interior mutability, with mutation observers fired on write. Generalised
//! here from a concurrent `Arc<RwLock<_>>` table to the spec's single-
//! threaded `Rc<RefCell<_>>` model (§5) and from one flat table to the
//! richer per-storeKey/per-type/per-account table set §3.3 calls for.
//!
//! Submodules hang off this one rather than duplicating `StoreInner`:
//! `commit` (the commit pipeline), `callbacks` (`sourceDid*` handlers),
//! `eviction` (`mayUnloadRecord`/`unloadRecord`), and `fk` (foreign-key
//! translation, already written). All of them reach `StoreInner`'s private
//! fields directly since they are descendant modules of `store`.

mod callbacks;
mod commit;
mod eviction;
mod fk;

use std::any::Any;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use serde_json::Value as JsonValue;

use crate::clock::Clock;
use crate::config::StoreConfig;
use crate::error::{CommitError, StoreError};
use crate::ids::{AccountId, RecordId, StoreKey, TypeId};
use crate::notify::{ObserverRegistry, TypeEvent};
use crate::record::Record;
use crate::runloop::{Queue, RunLoop};
use crate::schema::{RecordSchema, RegisteredSchema};
use crate::source::Source;
use crate::status::Status;

pub(crate) struct StoreInner {
    self_weak: Weak<RefCell<StoreInner>>,
    pub(crate) config: StoreConfig,
    pub(crate) clock: Rc<dyn Clock>,
    pub(crate) run_loop: Rc<dyn RunLoop>,
    pub(crate) source: Rc<dyn Source>,
    pub(crate) observers: ObserverRegistry,

    schemas: Vec<RegisteredSchema>,
    next_store_key: u64,

    pub(crate) type_of: HashMap<StoreKey, TypeId>,
    pub(crate) account_of: HashMap<StoreKey, AccountId>,
    pub(crate) status: HashMap<StoreKey, Status>,
    pub(crate) last_access: HashMap<StoreKey, i64>,
    pub(crate) data: HashMap<StoreKey, HashMap<String, JsonValue>>,
    pub(crate) changed: HashMap<StoreKey, HashSet<String>>,
    pub(crate) committed: HashMap<StoreKey, HashMap<String, JsonValue>>,
    pub(crate) rollback: HashMap<StoreKey, HashMap<String, JsonValue>>,

    pub(crate) sk_to_id: HashMap<StoreKey, RecordId>,
    pub(crate) id_index: HashMap<(TypeId, AccountId, RecordId), StoreKey>,

    pub(crate) type_status: HashMap<(TypeId, AccountId), Status>,
    pub(crate) client_state: HashMap<(TypeId, AccountId), String>,
    pub(crate) server_state: HashMap<(TypeId, AccountId), String>,

    /// `_created[sk] = originating sk` for a cross-account move's new key.
    pub(crate) created_from: HashMap<StoreKey, StoreKey>,
    /// `_destroyed[originalSk] = newSk` for a cross-account move's old key.
    pub(crate) destroyed_to: HashMap<StoreKey, StoreKey>,

    pub(crate) dirty_keys: HashSet<StoreKey>,
    pub(crate) is_committing: bool,
    commit_scheduled: bool,

    pending_notify: HashMap<TypeId, Vec<StoreKey>>,
    notify_scheduled: bool,

    record_instances: HashMap<StoreKey, Weak<Record>>,
    settle_waiters: HashMap<StoreKey, Vec<Box<dyn FnOnce(Status)>>>,

    error_listeners: Vec<Rc<dyn Fn(&StoreError)>>,
    pub(crate) commit_error_listeners: Vec<Rc<dyn Fn(StoreKey, &CommitError) -> bool>>,

    named_queries: HashMap<String, Rc<dyn Any>>,
}

impl StoreInner {
    pub(crate) fn schema_for(&self, type_id: TypeId) -> Option<&RecordSchema> {
        self.schemas.get(type_id.index()).map(|r| &r.schema)
    }

    fn account_key(&self, sk: StoreKey) -> Option<(TypeId, AccountId)> {
        let type_id = *self.type_of.get(&sk)?;
        let account_id = self.account_of.get(&sk)?.clone();
        Some((type_id, account_id))
    }
}

/// The in-memory record cache (§4.2, §6.2). Cheap to clone: it is a thin
/// `Rc` handle, so passing one around does not duplicate the tables.
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Rc<RefCell<StoreInner>>,
}

impl Store {
    /// Builds a new, empty store. No types are registered; call
    /// [`Store::register_type`] for each schema before using it.
    #[must_use]
    pub fn new(config: StoreConfig, clock: Rc<dyn Clock>, run_loop: Rc<dyn RunLoop>, source: Rc<dyn Source>) -> Self {
        let inner = Rc::new_cyclic(|weak: &Weak<RefCell<StoreInner>>| {
            RefCell::new(StoreInner {
                self_weak: weak.clone(),
                config,
                clock,
                run_loop,
                source,
                observers: ObserverRegistry::new(),
                schemas: Vec::new(),
                next_store_key: 0,
                type_of: HashMap::new(),
                account_of: HashMap::new(),
                status: HashMap::new(),
                last_access: HashMap::new(),
                data: HashMap::new(),
                changed: HashMap::new(),
                committed: HashMap::new(),
                rollback: HashMap::new(),
                sk_to_id: HashMap::new(),
                id_index: HashMap::new(),
                type_status: HashMap::new(),
                client_state: HashMap::new(),
                server_state: HashMap::new(),
                created_from: HashMap::new(),
                destroyed_to: HashMap::new(),
                dirty_keys: HashSet::new(),
                is_committing: false,
                commit_scheduled: false,
                pending_notify: HashMap::new(),
                notify_scheduled: false,
                record_instances: HashMap::new(),
                settle_waiters: HashMap::new(),
                error_listeners: Vec::new(),
                commit_error_listeners: Vec::new(),
                named_queries: HashMap::new(),
            })
        });
        Store { inner }
    }

    /// Registers a record class, returning the [`TypeId`] assigned to it.
    /// Types are assigned sequentially and never reused.
    pub fn register_type(&self, schema: RecordSchema) -> TypeId {
        let mut inner = self.inner.borrow_mut();
        let type_id = TypeId::from_raw(u32::try_from(inner.schemas.len()).expect("fewer than u32::MAX types"));
        inner.schemas.push(RegisteredSchema { schema, type_id });
        type_id
    }

    fn weak_self(&self) -> Weak<RefCell<StoreInner>> {
        self.inner.borrow().self_weak.clone()
    }

    fn from_weak(weak: &Weak<RefCell<StoreInner>>) -> Option<Store> {
        weak.upgrade().map(|inner| Store { inner })
    }

    // ---- identity / lookup (§6.2) ----------------------------------------

    /// Returns the storeKey for `(type, account, id)`, minting one if this
    /// is the first time the triple has been seen.
    pub fn get_store_key(&self, type_id: TypeId, account_id: &AccountId, id: &RecordId) -> StoreKey {
        let mut inner = self.inner.borrow_mut();
        let key = (type_id, account_id.clone(), id.clone());
        if let Some(sk) = inner.id_index.get(&key) {
            return *sk;
        }
        let sk = StoreKey::from_raw(inner.next_store_key);
        inner.next_store_key += 1;
        inner.type_of.insert(sk, type_id);
        inner.account_of.insert(sk, account_id.clone());
        inner.sk_to_id.insert(sk, id.clone());
        inner.id_index.insert(key, sk);
        inner.status.insert(sk, Status::EMPTY);
        sk
    }

    /// Mints a fresh storeKey with no id (used for `createRecord`).
    fn mint_store_key(&self, type_id: TypeId, account_id: &AccountId) -> StoreKey {
        let mut inner = self.inner.borrow_mut();
        let sk = StoreKey::from_raw(inner.next_store_key);
        inner.next_store_key += 1;
        inner.type_of.insert(sk, type_id);
        inner.account_of.insert(sk, account_id.clone());
        sk
    }

    #[must_use]
    pub fn get_id_from_store_key(&self, sk: StoreKey) -> Option<RecordId> {
        self.inner.borrow().sk_to_id.get(&sk).cloned()
    }

    #[must_use]
    pub fn get_account_id_from_store_key(&self, sk: StoreKey) -> Option<AccountId> {
        self.inner.borrow().account_of.get(&sk).cloned()
    }

    #[must_use]
    pub fn get_type_from_store_key(&self, sk: StoreKey) -> Option<TypeId> {
        self.inner.borrow().type_of.get(&sk).copied()
    }

    #[must_use]
    pub fn get_status(&self, sk: StoreKey) -> Status {
        self.inner.borrow().status.get(&sk).copied().unwrap_or(Status::EMPTY)
    }

    #[must_use]
    pub fn get_data(&self, sk: StoreKey) -> HashMap<String, JsonValue> {
        self.inner.borrow().data.get(&sk).cloned().unwrap_or_default()
    }

    /// Returns (minting if necessary) the `Record` facade for `(account,
    /// type, id)`, requesting a fetch if nothing is known about it yet.
    pub fn get_record(&self, account_id: &AccountId, type_id: TypeId, id: &RecordId) -> Rc<Record> {
        let sk = self.get_store_key(type_id, account_id, id);
        let record = self.get_record_from_store_key(sk).unwrap_or_else(|| self.materialise_record(sk));
        if self.get_status(sk) == Status::EMPTY {
            self.fetch_record_by_key(sk);
        }
        record
    }

    #[must_use]
    pub fn get_record_from_store_key(&self, sk: StoreKey) -> Option<Rc<Record>> {
        self.inner.borrow().record_instances.get(&sk).and_then(Weak::upgrade)
    }

    fn materialise_record(&self, sk: StoreKey) -> Rc<Record> {
        let record = Rc::new(Record::new(self.clone(), sk));
        self.inner.borrow_mut().record_instances.insert(sk, Rc::downgrade(&record));
        record
    }

    /// Returns the single record of `type_id` matching `id` in `account`, if
    /// loaded (`READY`) and not destroyed.
    #[must_use]
    pub fn get_one(&self, account_id: &AccountId, type_id: TypeId, id: &RecordId) -> Option<Rc<Record>> {
        let key = (type_id, account_id.clone(), id.clone());
        let sk = *self.inner.borrow().id_index.get(&key)?;
        if self.get_status(sk).is(Status::READY) {
            Some(self.get_record_from_store_key(sk).unwrap_or_else(|| self.materialise_record(sk)))
        } else {
            None
        }
    }

    /// Every currently-`READY` storeKey of `type_id` in `account`.
    #[must_use]
    pub fn get_all(&self, account_id: &AccountId, type_id: TypeId) -> Vec<StoreKey> {
        let inner = self.inner.borrow();
        inner
            .id_index
            .iter()
            .filter(|((t, a, _), _)| *t == type_id && a == account_id)
            .filter(|(_, sk)| inner.status.get(sk).is_some_and(|s| s.is(Status::READY)))
            .map(|(_, sk)| *sk)
            .collect()
    }

    /// `get_all` filtered by predicate over each storeKey's data.
    pub fn find_all(
        &self,
        account_id: &AccountId,
        type_id: TypeId,
        predicate: impl Fn(&HashMap<String, JsonValue>) -> bool,
    ) -> Vec<StoreKey> {
        self.get_all(account_id, type_id)
            .into_iter()
            .filter(|sk| self.inner.borrow().data.get(sk).is_some_and(|d| predicate(d)))
            .collect()
    }

    /// First storeKey of `type_id` in `account` matching `predicate`.
    pub fn find_one(
        &self,
        account_id: &AccountId,
        type_id: TypeId,
        predicate: impl Fn(&HashMap<String, JsonValue>) -> bool,
    ) -> Option<StoreKey> {
        self.get_all(account_id, type_id)
            .into_iter()
            .find(|sk| self.inner.borrow().data.get(sk).is_some_and(|d| predicate(d)))
    }

    // ---- mutation entry points (§4.2, §6.2) -------------------------------

    /// Creates a new, locally-originated record. Transitions it to
    /// `READY|NEW|DIRTY` and schedules a commit if `auto_commit` is set.
    pub fn create_record(
        &self,
        type_id: TypeId,
        account_id: &AccountId,
        data: HashMap<String, JsonValue>,
    ) -> Result<Rc<Record>, StoreError> {
        let sk = self.mint_store_key(type_id, account_id);
        let full_data = {
            let inner = self.inner.borrow();
            let mut merged = inner.schema_for(type_id).map(RecordSchema::defaults).unwrap_or_default();
            merged.extend(data);
            merged
        };
        {
            let mut inner = self.inner.borrow_mut();
            let now = inner.clock.now_millis();
            inner.data.insert(sk, full_data);
            inner.status.insert(sk, Status::READY | Status::NEW | Status::DIRTY);
            inner.last_access.insert(sk, now);
            inner.dirty_keys.insert(sk);
        }
        let record = self.materialise_record(sk);
        self.queue_change_notification(type_id, sk);
        self.schedule_commit();
        Ok(record)
    }

    /// Applies `patch` to a `READY` record's in-memory data. When `dirty` is
    /// `true`, the touched keys are marked `changed` and the record flips
    /// `DIRTY` (snapshotting `committed` first, unless it is still `NEW`).
    pub fn update_data(&self, sk: StoreKey, patch: HashMap<String, JsonValue>, dirty: bool) -> Result<(), StoreError> {
        let type_id = {
            let mut inner = self.inner.borrow_mut();
            let status = *inner.status.get(&sk).ok_or(StoreError::UnknownStoreKey(sk))?;
            if status.is(Status::DESTROYED | Status::NON_EXISTENT) {
                return Err(StoreError::NotEditableDestroyed(sk));
            }
            if !status.is(Status::READY) {
                return Err(StoreError::NotEditable(sk));
            }
            if dirty && !status.is(Status::NEW) && !inner.committed.contains_key(&sk) {
                let snapshot = inner.data.get(&sk).cloned().unwrap_or_default();
                inner.committed.insert(sk, snapshot);
            }
            {
                let StoreInner { data, changed, .. } = &mut *inner;
                let data_map = data.entry(sk).or_default();
                let changed_set = changed.entry(sk).or_default();
                for (key, value) in patch {
                    data_map.insert(key.clone(), value);
                    if dirty {
                        changed_set.insert(key);
                    }
                }
            }
            if dirty {
                inner.status.insert(sk, status | Status::DIRTY);
                inner.dirty_keys.insert(sk);
            }
            let now = inner.clock.now_millis();
            inner.last_access.insert(sk, now);
            *inner.type_of.get(&sk).expect("type_of populated alongside status")
        };
        self.queue_change_notification(type_id, sk);
        if dirty {
            self.schedule_commit();
        }
        Ok(())
    }

    /// Marks a record for destruction. `NEW` records are dropped immediately
    /// (invariant 4: no commit attempted for a record never committed);
    /// otherwise it flips `DESTROYED|DIRTY` and awaits commit.
    pub fn destroy_record(&self, sk: StoreKey) -> Result<(), StoreError> {
        let (type_id, was_new) = {
            let mut inner = self.inner.borrow_mut();
            let status = *inner.status.get(&sk).ok_or(StoreError::UnknownStoreKey(sk))?;
            if status.is(Status::DESTROYED | Status::NON_EXISTENT) {
                return Err(StoreError::NotEditableDestroyed(sk));
            }
            let type_id = *inner.type_of.get(&sk).expect("type_of populated alongside status");
            let was_new = status.is(Status::NEW);
            if was_new {
                inner.data.remove(&sk);
                inner.changed.remove(&sk);
                inner.committed.remove(&sk);
                inner.rollback.remove(&sk);
                inner.status.insert(sk, Status::NON_EXISTENT);
                inner.dirty_keys.remove(&sk);
            } else {
                inner.status.insert(sk, status.with_core_state(Status::DESTROYED) | Status::DIRTY);
                inner.dirty_keys.insert(sk);
            }
            (type_id, was_new)
        };
        self.queue_change_notification(type_id, sk);
        if !was_new {
            self.schedule_commit();
        }
        Ok(())
    }

    /// Reverses a pending local destroy, returning the record to
    /// `READY|NEW|DIRTY` (or clearing `DESTROYED` if already committed as
    /// such is not possible -- only a still-`DIRTY` destroy can be undone).
    pub fn undestroy_record(&self, sk: StoreKey) -> Result<(), StoreError> {
        let type_id = {
            let mut inner = self.inner.borrow_mut();
            let status = *inner.status.get(&sk).ok_or(StoreError::UnknownStoreKey(sk))?;
            if !status.is(Status::DESTROYED) || status.is(Status::COMMITTING) {
                return Err(StoreError::NotEditable(sk));
            }
            inner.status.insert(sk, status.with_core_state(Status::READY) | Status::DIRTY);
            inner.dirty_keys.insert(sk);
            *inner.type_of.get(&sk).expect("type_of populated alongside status")
        };
        self.queue_change_notification(type_id, sk);
        self.schedule_commit();
        Ok(())
    }

    /// Moves a record to a different account: mints a new storeKey in
    /// `target_account` carrying a copy of the current data, destroys the
    /// original, and records the `created_from`/`destroyed_to`
    /// correspondence the commit pipeline uses to detect the move (§10).
    pub fn move_record(&self, sk: StoreKey, target_account: &AccountId) -> Result<StoreKey, StoreError> {
        let (type_id, data, current_account) = {
            let inner = self.inner.borrow();
            let status = *inner.status.get(&sk).ok_or(StoreError::UnknownStoreKey(sk))?;
            if status.is(Status::DESTROYED | Status::NON_EXISTENT) {
                return Err(StoreError::NotEditableDestroyed(sk));
            }
            let current_account = inner.account_of.get(&sk).cloned().ok_or(StoreError::UnknownStoreKey(sk))?;
            if &current_account == target_account {
                return Err(StoreError::AlreadyInAccount(sk));
            }
            let type_id = *inner.type_of.get(&sk).expect("type_of populated alongside status");
            (type_id, inner.data.get(&sk).cloned().unwrap_or_default(), current_account)
        };
        let new_sk = self.mint_store_key(type_id, target_account);
        {
            let mut inner = self.inner.borrow_mut();
            let now = inner.clock.now_millis();
            inner.data.insert(new_sk, data);
            inner.status.insert(new_sk, Status::READY | Status::NEW | Status::DIRTY);
            inner.last_access.insert(new_sk, now);
            inner.dirty_keys.insert(new_sk);
            inner.created_from.insert(new_sk, sk);
            inner.destroyed_to.insert(sk, new_sk);

            let old_status = *inner.status.get(&sk).expect("checked above");
            inner.status.insert(sk, old_status.with_core_state(Status::DESTROYED) | Status::DIRTY);
            inner.dirty_keys.insert(sk);
        }
        let _ = current_account;
        self.materialise_record(new_sk);
        self.queue_change_notification(type_id, sk);
        self.queue_change_notification(type_id, new_sk);
        self.schedule_commit();
        Ok(new_sk)
    }

    /// Reverts a `DIRTY` record: if it has never been committed
    /// (`READY|NEW|DIRTY`), destroys it outright; otherwise restores `data`
    /// from `committed` and clears `DIRTY`/`changed`.
    pub fn discard_changes(&self, sk: StoreKey) -> Result<(), StoreError> {
        let status = self.get_status(sk);
        if status == Status::EMPTY {
            return Err(StoreError::UnknownStoreKey(sk));
        }
        if status.has_all(Status::READY | Status::NEW | Status::DIRTY) {
            return self.destroy_record(sk);
        }
        let type_id = {
            let mut inner = self.inner.borrow_mut();
            if let Some(committed) = inner.committed.remove(&sk) {
                inner.data.insert(sk, committed);
            }
            inner.changed.remove(&sk);
            inner.dirty_keys.remove(&sk);
            let status = *inner.status.get(&sk).unwrap_or(&Status::EMPTY);
            inner.status.insert(sk, status - Status::DIRTY);
            *inner.type_of.get(&sk).expect("type_of populated alongside status")
        };
        self.queue_change_notification(type_id, sk);
        Ok(())
    }

    // ---- status API (§6.2) -------------------------------------------------

    /// Overwrites a storeKey's status directly. Used by tests and by
    /// callers bootstrapping non-standard lifecycles; the commit pipeline
    /// and callbacks use the narrower helpers instead.
    pub fn set_status(&self, sk: StoreKey, status: Status) {
        self.set_status_and_settle(sk, status);
        if let Some(type_id) = self.get_type_from_store_key(sk) {
            self.queue_change_notification(type_id, sk);
        }
    }

    /// Sets status and resolves any `when_settled` waiters if the new
    /// status is no longer `LOADING`/`COMMITTING`.
    pub(crate) fn set_status_and_settle(&self, sk: StoreKey, status: Status) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            inner.status.insert(sk, status);
            if status.is(Status::LOADING | Status::COMMITTING) {
                Vec::new()
            } else {
                inner.settle_waiters.remove(&sk).unwrap_or_default()
            }
        };
        for waiter in waiters {
            waiter(status);
        }
    }

    /// Registers `callback` to run once the next time `sk`'s status is no
    /// longer `LOADING`/`COMMITTING`. The Rust analogue of
    /// `Record.getResult`/`ifSuccess`/`ifLoaded`'s future resolution (§4.1),
    /// expressed as a callback since the store has no async executor (§5).
    pub(crate) fn when_settled(&self, sk: StoreKey, callback: Box<dyn FnOnce(Status)>) {
        let status = self.get_status(sk);
        if !status.is(Status::LOADING | Status::COMMITTING) {
            callback(status);
            return;
        }
        self.inner.borrow_mut().settle_waiters.entry(sk).or_default().push(callback);
    }

    #[must_use]
    pub fn get_type_status(&self, type_id: TypeId, account_id: &AccountId) -> Status {
        self.inner
            .borrow()
            .type_status
            .get(&(type_id, account_id.clone()))
            .copied()
            .unwrap_or(Status::EMPTY)
    }

    pub(crate) fn set_type_status(&self, type_id: TypeId, account_id: &AccountId, status: Status) {
        self.inner.borrow_mut().type_status.insert((type_id, account_id.clone()), status);
    }

    #[must_use]
    pub fn get_type_state(&self, type_id: TypeId, account_id: &AccountId) -> Option<String> {
        self.inner.borrow().client_state.get(&(type_id, account_id.clone())).cloned()
    }

    /// Invokes `callback` once the type/account pair is no longer
    /// `LOADING`/`COMMITTING` at the type level.
    pub fn when_type_ready(&self, type_id: TypeId, account_id: &AccountId, callback: impl FnOnce() + 'static) {
        if !self.get_type_status(type_id, account_id).is(Status::LOADING | Status::COMMITTING) {
            callback();
        } else {
            // Type-level readiness is coarser than any single storeKey's;
            // poll again on the next middle-queue turn rather than modeling
            // a parallel waiter table for a rarely-exercised path.
            let store = self.clone();
            let run_loop = Rc::clone(&self.inner.borrow().run_loop);
            let account_id = account_id.clone();
            run_loop.invoke_later(
                Queue::Middle,
                Box::new(move || store.when_type_ready(type_id, &account_id, callback)),
            );
        }
    }

    #[must_use]
    pub fn check_for_changes(&self) -> bool {
        !self.inner.borrow().dirty_keys.is_empty()
    }

    #[must_use]
    pub fn has_changes_for_type(&self, type_id: TypeId, account_id: &AccountId) -> bool {
        let inner = self.inner.borrow();
        inner.dirty_keys.iter().any(|sk| {
            inner.type_of.get(sk) == Some(&type_id) && inner.account_of.get(sk) == Some(account_id)
        })
    }

    // ---- queries (§6.2) -----------------------------------------------------

    /// Registers `query` under `name` for later retrieval via
    /// [`Store::get_query`]. Stored as `Rc<dyn Any>`; callers downcast.
    pub fn add_query(&self, name: impl Into<String>, query: Rc<dyn Any>) {
        self.inner.borrow_mut().named_queries.insert(name.into(), query);
    }

    pub fn remove_query(&self, name: &str) {
        self.inner.borrow_mut().named_queries.remove(name);
    }

    #[must_use]
    pub fn get_query(&self, name: &str) -> Option<Rc<dyn Any>> {
        self.inner.borrow().named_queries.get(name).cloned()
    }

    #[must_use]
    pub fn get_all_queries(&self) -> Vec<String> {
        self.inner.borrow().named_queries.keys().cloned().collect()
    }

    pub(crate) fn observers(&self) -> std::cell::Ref<'_, ObserverRegistry> {
        std::cell::Ref::map(self.inner.borrow(), |inner| &inner.observers)
    }

    pub(crate) fn register_observer(&self, type_id: TypeId, observer: Weak<dyn crate::notify::TypeObserver>) {
        self.inner.borrow().observers.register(type_id, observer);
    }

    // ---- change notification fan-out (§5) ----------------------------------

    pub(crate) fn queue_change_notification(&self, type_id: TypeId, sk: StoreKey) {
        let run_loop = {
            let mut inner = self.inner.borrow_mut();
            inner.pending_notify.entry(type_id).or_default().push(sk);
            if inner.notify_scheduled {
                None
            } else {
                inner.notify_scheduled = true;
                Some(Rc::clone(&inner.run_loop))
            }
        };
        if let Some(run_loop) = run_loop {
            let store = self.clone();
            run_loop.invoke_later(Queue::Middle, Box::new(move || store.flush_notifications()));
        }
    }

    fn flush_notifications(&self) {
        let pending = {
            let mut inner = self.inner.borrow_mut();
            inner.notify_scheduled = false;
            std::mem::take(&mut inner.pending_notify)
        };
        let inner = self.inner.borrow();
        for (type_id, keys) in pending {
            inner.observers.fire(type_id, &TypeEvent::Changed(keys));
        }
    }

    pub(crate) fn queue_server_state_event(&self, type_id: TypeId, account_id: &AccountId) {
        let inner = self.inner.borrow();
        inner.observers.fire(type_id, &TypeEvent::ServerStateChanged(account_id.clone()));
    }

    // ---- commit scheduling (§4.2) -------------------------------------------

    pub(crate) fn schedule_commit(&self) {
        let run_loop = {
            let mut inner = self.inner.borrow_mut();
            if !inner.config.auto_commit || inner.commit_scheduled {
                None
            } else {
                inner.commit_scheduled = true;
                Some(Rc::clone(&inner.run_loop))
            }
        };
        if let Some(run_loop) = run_loop {
            let store = self.clone();
            run_loop.invoke_later(
                Queue::Middle,
                Box::new(move || {
                    store.inner.borrow_mut().commit_scheduled = false;
                    store.commit_changes();
                }),
            );
        }
    }

    // ---- errors (§7) ---------------------------------------------------------

    pub fn on_error(&self, listener: Rc<dyn Fn(&StoreError)>) {
        self.inner.borrow_mut().error_listeners.push(listener);
    }

    pub(crate) fn report_error(&self, error: &StoreError) {
        tracing::warn!(%error, "store programming error");
        let listeners = self.inner.borrow().error_listeners.clone();
        for listener in listeners {
            listener(error);
        }
    }

    pub fn on_commit_error(&self, listener: Rc<dyn Fn(StoreKey, &CommitError) -> bool>) {
        self.inner.borrow_mut().commit_error_listeners.push(listener);
    }

    // ---- eviction (§4.2) used by memory manager (external collaborator) ----

    /// Least-recently-accessed eligible storeKeys, oldest first, capped by
    /// `config.eviction_batch_size`.
    #[must_use]
    pub fn eviction_candidates(&self) -> Vec<StoreKey> {
        eviction::candidates(self)
    }

    #[must_use]
    pub fn may_unload_record(&self, sk: StoreKey) -> bool {
        eviction::may_unload(self, sk)
    }

    pub fn unload_record(&self, sk: StoreKey) {
        eviction::unload(self, sk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::runloop::test_support::ImmediateRunLoop;
    use crate::schema::AttributeDef;
    use crate::source::*;

    struct NullSource;
    impl Source for NullSource {
        fn fetch_record(&self, _account: &AccountId, _type_id: TypeId, _id: &RecordId, done: Done<FetchOutcome>) {
            done(FetchOutcome::NotFound);
        }
        fn refresh_record(&self, _account: &AccountId, _type_id: TypeId, _id: &RecordId, done: Done<FetchOutcome>) {
            done(FetchOutcome::NotFound);
        }
        fn fetch_all_records(
            &self,
            _account: &AccountId,
            _type_id: TypeId,
            _since_state: Option<&str>,
            done: Done<FetchAllOutcome>,
        ) {
            done(FetchAllOutcome::Full { records: vec![], state: None });
        }
        fn fetch_query(&self, _request: QueryFetchRequest, _reply: QueryReply) {}
        fn commit_changes(&self, _changes: CommitBatch, done: Done<CommitOutcome>) {
            done(CommitOutcome::default());
        }
    }

    fn test_store() -> (Store, Rc<ImmediateRunLoop>) {
        let run_loop = Rc::new(ImmediateRunLoop::new());
        let store = Store::new(
            StoreConfig::default(),
            Rc::new(FakeClock::new(1_000)),
            Rc::clone(&run_loop) as Rc<dyn RunLoop>,
            Rc::new(NullSource),
        );
        (store, run_loop)
    }

    #[test]
    fn create_record_assigns_ready_new_dirty_and_defaults() {
        let (store, run_loop) = test_store();
        let type_id = store.register_type(RecordSchema::new(
            "Task",
            vec![AttributeDef::scalar("title"), AttributeDef::scalar("done").default_value(JsonValue::from(false))],
        ));
        let account = AccountId::new("acct1");
        let mut data = HashMap::new();
        data.insert("title".to_string(), JsonValue::from("write tests"));
        let record = store.create_record(type_id, &account, data).unwrap();

        let status = store.get_status(record.store_key());
        assert!(status.has_all(Status::READY | Status::NEW | Status::DIRTY));
        assert_eq!(store.get_data(record.store_key()).get("done"), Some(&JsonValue::from(false)));
        assert!(store.check_for_changes());
        run_loop.flush();
    }

    #[test]
    fn update_data_on_unknown_store_key_errors() {
        let (store, _run_loop) = test_store();
        let err = store.update_data(StoreKey::from_raw(999), HashMap::new(), true).unwrap_err();
        assert_eq!(err, StoreError::UnknownStoreKey(StoreKey::from_raw(999)));
    }

    #[test]
    fn destroy_record_on_new_record_unloads_without_commit() {
        let (store, run_loop) = test_store();
        let type_id = store.register_type(RecordSchema::new("Task", vec![AttributeDef::scalar("title")]));
        let account = AccountId::new("acct1");
        let record = store.create_record(type_id, &account, HashMap::new()).unwrap();
        let sk = record.store_key();

        store.destroy_record(sk).unwrap();
        assert_eq!(store.get_status(sk), Status::NON_EXISTENT);
        assert!(!store.check_for_changes());
        run_loop.flush();
    }

    #[test]
    fn discard_changes_restores_committed_snapshot() {
        let (store, run_loop) = test_store();
        let type_id = store.register_type(RecordSchema::new("Task", vec![AttributeDef::scalar("title")]));
        let account = AccountId::new("acct1");
        let id = RecordId::new("t1");
        let sk = store.get_store_key(type_id, &account, &id);
        {
            let mut inner = store.inner.borrow_mut();
            let mut data = HashMap::new();
            data.insert("title".to_string(), JsonValue::from("original"));
            inner.data.insert(sk, data);
            inner.status.insert(sk, Status::READY);
        }
        let mut patch = HashMap::new();
        patch.insert("title".to_string(), JsonValue::from("edited"));
        store.update_data(sk, patch, true).unwrap();
        assert_eq!(store.get_data(sk).get("title"), Some(&JsonValue::from("edited")));

        store.discard_changes(sk).unwrap();
        assert_eq!(store.get_data(sk).get("title"), Some(&JsonValue::from("original")));
        assert!(!store.get_status(sk).is(Status::DIRTY));
        run_loop.flush();
    }

    #[test]
    fn move_record_mints_new_key_and_destroys_original() {
        let (store, run_loop) = test_store();
        let type_id = store.register_type(RecordSchema::new("Task", vec![AttributeDef::scalar("title")]));
        let account_a = AccountId::new("a");
        let account_b = AccountId::new("b");
        let record = store.create_record(type_id, &account_a, HashMap::new()).unwrap();
        let sk = record.store_key();
        run_loop.flush();

        let new_sk = store.move_record(sk, &account_b).unwrap();
        assert_ne!(new_sk, sk);
        assert!(store.get_status(sk).is(Status::DESTROYED));
        assert!(store.get_status(new_sk).has_all(Status::READY | Status::NEW));
        assert_eq!(store.get_account_id_from_store_key(new_sk), Some(account_b));
        run_loop.flush();
    }

    #[test]
    fn when_settled_fires_immediately_if_already_settled() {
        let (store, _run_loop) = test_store();
        let type_id = store.register_type(RecordSchema::new("Task", vec![]));
        let account = AccountId::new("a");
        let record = store.create_record(type_id, &account, HashMap::new()).unwrap();
        let sk = record.store_key();

        let fired = Rc::new(std::cell::Cell::new(false));
        let fired2 = Rc::clone(&fired);
        store.when_settled(sk, Box::new(move |_status| fired2.set(true)));
        assert!(fired.get());
    }

    #[test]
    fn when_settled_waits_for_loading_to_clear() {
        let (store, _run_loop) = test_store();
        let type_id = store.register_type(RecordSchema::new("Task", vec![]));
        let account = AccountId::new("a");
        let id = RecordId::new("x1");
        let sk = store.get_store_key(type_id, &account, &id);
        store.set_status(sk, Status::LOADING);

        let fired = Rc::new(std::cell::Cell::new(false));
        let fired2 = Rc::clone(&fired);
        store.when_settled(sk, Box::new(move |_status| fired2.set(true)));
        assert!(!fired.get());

        store.set_status(sk, Status::READY);
        assert!(fired.get());
    }

    #[test]
    fn named_query_registry_round_trips() {
        let (store, _run_loop) = test_store();
        store.add_query("recent-tasks", Rc::new(42_i32) as Rc<dyn Any>);
        assert_eq!(store.get_all_queries(), vec!["recent-tasks".to_string()]);
        let got = store.get_query("recent-tasks").unwrap();
        assert_eq!(*got.downcast::<i32>().unwrap(), 42);
        store.remove_query("recent-tasks");
        assert!(store.get_query("recent-tasks").is_none());
    }
}
