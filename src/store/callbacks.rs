//! `sourceDid*` handlers (§4.2, §4.3): everything the `Source` reports back
//! advances the state machine through this module.
//!
//! Grounded on the teacher's `storage::mutation_observer` dispatch
//! (`server-rust/src/storage/mutation_observer.rs`), which likewise turns a
//! backend's reported outcome into store-table updates plus a fan-out
//! notification. Kept in a dedicated module from `commit.rs` because the
//! commit pipeline only *produces* requests; everything here only
//! *consumes* replies, matching the request/reply asymmetry in §4.2's table.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde_json::Value as JsonValue;

use crate::error::{CommitError, CommitPhase};
use crate::ids::{AccountId, RecordId, StoreKey, TypeId};
use crate::schema::AttributeKind;
use crate::source::{CreateResult, DestroyResult, FetchAllOutcome, FetchOutcome, RecordPayload, UpdateResult};
use crate::status::Status;

use super::Store;

impl Store {
    /// Translates a wire payload's reference attributes (ids) into their
    /// in-memory form (storeKeys), minting storeKeys for ids not yet seen.
    /// Never holds a `StoreInner` borrow across the minting call.
    pub(crate) fn translate_ingress_for(
        &self,
        type_id: TypeId,
        account_id: &AccountId,
        raw: &HashMap<String, JsonValue>,
    ) -> HashMap<String, JsonValue> {
        let ref_attrs: Vec<(String, AttributeKind, Option<TypeId>)> = {
            let inner = self.inner.borrow();
            inner
                .schema_for(type_id)
                .map(|s| s.reference_attributes().into_iter().map(|(k, kind, t)| (k.to_string(), kind, t)).collect())
                .unwrap_or_default()
        };
        let mut out = raw.clone();
        for (prop, kind, target) in ref_attrs {
            if target.is_none() {
                continue;
            }
            let Some(value) = raw.get(&prop) else { continue };
            match kind {
                AttributeKind::Scalar => {}
                AttributeKind::ToOne => {
                    if let Some(idstr) = value.as_str() {
                        let sk = self.get_store_key(type_id, account_id, &RecordId::new(idstr));
                        out.insert(prop, JsonValue::from(sk.raw()));
                    }
                }
                AttributeKind::ToManyList | AttributeKind::ToManySet => {
                    if let Some(arr) = value.as_array() {
                        let ids: Vec<JsonValue> = arr
                            .iter()
                            .filter_map(JsonValue::as_str)
                            .map(|idstr| {
                                JsonValue::from(self.get_store_key(type_id, account_id, &RecordId::new(idstr)).raw())
                            })
                            .collect();
                        out.insert(prop, JsonValue::Array(ids));
                    }
                }
            }
        }
        out
    }

    // ---- single-record fetch (getRecord auto-load, Record::fetch) --------

    /// Entry point for loading a single record: no-op for states where a
    /// fetch makes no sense (`NEW`, `DESTROYED`, `NON_EXISTENT`, already
    /// `LOADING`).
    pub(crate) fn fetch_record_by_key(&self, sk: StoreKey) {
        let status = self.get_status(sk);
        if status.is(Status::NEW | Status::DESTROYED | Status::NON_EXISTENT | Status::LOADING) {
            return;
        }
        self.ensure_loading(sk);
    }

    fn ensure_loading(&self, sk: StoreKey) {
        let Some(type_id) = self.get_type_from_store_key(sk) else { return };
        let Some(account_id) = self.get_account_id_from_store_key(sk) else { return };
        let Some(id) = self.get_id_from_store_key(sk) else { return };

        let status = self.get_status(sk);
        self.set_status_and_settle(sk, status | Status::LOADING);

        let source = Rc::clone(&self.inner.borrow().source);
        let store = self.clone();
        source.fetch_record(&account_id, type_id, &id, Box::new(move |outcome| store.handle_fetch_outcome(sk, outcome)));
    }

    fn handle_fetch_outcome(&self, sk: StoreKey, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Found(payload) => {
                let Some(type_id) = self.get_type_from_store_key(sk) else { return };
                let Some(account_id) = self.get_account_id_from_store_key(sk) else { return };
                let translated = self.translate_ingress_for(type_id, &account_id, &payload.data);
                {
                    let mut inner = self.inner.borrow_mut();
                    let now = inner.clock.now_millis();
                    inner.data.insert(sk, translated);
                    inner.last_access.insert(sk, now);
                }
                self.set_status_and_settle(sk, Status::READY);
                self.queue_change_notification(type_id, sk);
            }
            FetchOutcome::NotFound => self.source_could_not_find_record(sk),
            FetchOutcome::Failed(message) => {
                tracing::warn!(%sk, %message, "fetch_record failed");
                let status = self.get_status(sk) - Status::LOADING;
                self.set_status_and_settle(sk, status);
            }
        }
    }

    /// `sourceCouldNotFindRecords`, single-record case (§4.2, §7).
    pub(crate) fn source_could_not_find_record(&self, sk: StoreKey) {
        let was_loaded = self.get_status(sk).is(Status::READY);
        let next = if was_loaded { Status::DESTROYED } else { Status::NON_EXISTENT };
        self.set_status_and_settle(sk, next);
        if was_loaded {
            self.unload_record(sk);
        }
        if let Some(type_id) = self.get_type_from_store_key(sk) {
            self.queue_change_notification(type_id, sk);
        }
    }

    // ---- bulk fetch (sourceDidFetchRecords / sourceDidFetchUpdates) ------

    /// Requests every record of `(type_id, account_id)`, incremental from
    /// the last-known client state when the source supports it.
    pub fn fetch_all(&self, type_id: TypeId, account_id: &AccountId) {
        let since_state = self.get_type_state(type_id, account_id);
        let status = self.get_type_status(type_id, account_id);
        self.set_type_status(type_id, account_id, status | Status::LOADING);

        let source = Rc::clone(&self.inner.borrow().source);
        let store = self.clone();
        let type_id_c = type_id;
        let account_id_c = account_id.clone();
        source.fetch_all_records(
            account_id,
            type_id,
            since_state.as_deref(),
            Box::new(move |outcome| store.handle_fetch_all_outcome(type_id_c, &account_id_c, outcome)),
        );
    }

    fn handle_fetch_all_outcome(&self, type_id: TypeId, account_id: &AccountId, outcome: FetchAllOutcome) {
        match outcome {
            FetchAllOutcome::Full { records, state } => {
                self.source_did_fetch_records(type_id, account_id, records, state, true);
            }
            FetchAllOutcome::Delta { changed, destroyed, old_state, new_state } => {
                self.source_did_fetch_updates(type_id, account_id, changed, destroyed, old_state, new_state);
            }
            FetchAllOutcome::Failed(message) => {
                tracing::warn!(%type_id, %message, "fetch_all_records failed");
                let status = self.get_type_status(type_id, account_id) - Status::LOADING;
                self.set_type_status(type_id, account_id, status);
            }
        }
    }

    /// `sourceDidFetchRecords` (§4.2). `is_all` means the response is a
    /// complete snapshot: any currently-`READY` record of this type/account
    /// missing from it is treated as remotely destroyed, but only within
    /// the same account (§10's mixed-account open question -- records
    /// belonging to a different account are never touched here since
    /// `get_all`/the id-index scan is already account-scoped).
    pub(crate) fn source_did_fetch_records(
        &self,
        type_id: TypeId,
        account_id: &AccountId,
        records: Vec<RecordPayload>,
        state: Option<String>,
        is_all: bool,
    ) {
        let mut seen = HashSet::new();
        for payload in records {
            let sk = self.get_store_key(type_id, account_id, &payload.id);
            seen.insert(sk);
            let status = self.get_status(sk);
            if status.is(Status::DIRTY) {
                // Local edits win; reconciliation is the partial-update /
                // rebase path's job, not a full snapshot's.
                self.queue_change_notification(type_id, sk);
                continue;
            }
            let translated = self.translate_ingress_for(type_id, account_id, &payload.data);
            let next = if status.is(Status::COMMITTING) { status | Status::OBSOLETE } else { Status::READY };
            {
                let mut inner = self.inner.borrow_mut();
                let now = inner.clock.now_millis();
                inner.data.insert(sk, translated);
                inner.last_access.insert(sk, now);
            }
            self.set_status_and_settle(sk, next);
            self.queue_change_notification(type_id, sk);
        }

        if is_all {
            let stale: Vec<StoreKey> = {
                let inner = self.inner.borrow();
                inner
                    .id_index
                    .iter()
                    .filter(|((t, a, _), _)| *t == type_id && a == account_id)
                    .filter(|(_, sk)| !seen.contains(sk))
                    .filter(|(_, sk)| inner.status.get(sk).is_some_and(|s| s.is(Status::READY)))
                    .map(|(_, sk)| *sk)
                    .collect()
            };
            for sk in stale {
                self.destroy_remotely(sk);
            }
        }

        if let Some(state) = state {
            self.inner.borrow_mut().client_state.insert((type_id, account_id.clone()), state);
        }
        let status = self.get_type_status(type_id, account_id) - Status::LOADING;
        self.set_type_status(type_id, account_id, status);
        self.queue_server_state_event(type_id, account_id);
    }

    /// `sourceDidFetchPartialRecords` (§4.2): per-record patches, with
    /// rebase-vs-overwrite policy for `DIRTY` records.
    pub(crate) fn source_did_fetch_partial_records(
        &self,
        type_id: TypeId,
        account_id: &AccountId,
        updates: Vec<RecordPayload>,
    ) {
        let rebase_conflicts = self.inner.borrow().config.rebase_conflicts;
        for payload in updates {
            let sk = self.get_store_key(type_id, account_id, &payload.id);
            let translated = self.translate_ingress_for(type_id, account_id, &payload.data);
            let status = self.get_status(sk);
            if status.is(Status::COMMITTING) {
                self.set_status_and_settle(sk, status | Status::OBSOLETE);
            } else if status.is(Status::DIRTY) && rebase_conflicts {
                self.rebase_update(sk, translated);
            } else {
                let next = status - Status::DIRTY;
                {
                    let mut inner = self.inner.borrow_mut();
                    inner.data.entry(sk).or_default().extend(translated);
                    inner.changed.remove(&sk);
                    inner.committed.remove(&sk);
                    inner.status.insert(sk, next);
                }
                self.set_status_and_settle(sk, next);
            }
            self.queue_change_notification(type_id, sk);
        }
    }

    /// Rebase policy (§4.2): keep the client's edited keys, adopt the
    /// server's value for everything else, and recompute `changed` against
    /// the new committed baseline. Clears `DIRTY` if nothing remains
    /// genuinely different.
    fn rebase_update(&self, sk: StoreKey, incoming: HashMap<String, JsonValue>) {
        let mut inner = self.inner.borrow_mut();
        let changed_keys = inner.changed.get(&sk).cloned().unwrap_or_default();
        let current = inner.data.get(&sk).cloned().unwrap_or_default();

        let mut new_committed = inner.committed.get(&sk).cloned().unwrap_or_default();
        new_committed.extend(incoming.clone());

        let mut new_data = incoming;
        for key in &changed_keys {
            if let Some(value) = current.get(key) {
                new_data.insert(key.clone(), value.clone());
            }
        }

        let still_changed: HashSet<String> =
            changed_keys.into_iter().filter(|key| new_data.get(key) != new_committed.get(key)).collect();

        let status = inner.status.get(&sk).copied().unwrap_or(Status::EMPTY);
        let next = if still_changed.is_empty() {
            inner.committed.remove(&sk);
            status - Status::DIRTY
        } else {
            inner.committed.insert(sk, new_committed);
            status
        };
        inner.data.insert(sk, new_data);
        inner.changed.insert(sk, still_changed);
        inner.status.insert(sk, next);
        drop(inner);
        self.set_status_and_settle(sk, next);
    }

    /// `sourceDidFetchUpdates` (§4.2, §4.3): applies an incremental delta if
    /// our client state matches `old_state`, else defers to state
    /// reconciliation.
    pub(crate) fn source_did_fetch_updates(
        &self,
        type_id: TypeId,
        account_id: &AccountId,
        changed: Vec<RecordPayload>,
        destroyed: Vec<RecordId>,
        old_state: Option<String>,
        new_state: Option<String>,
    ) {
        let client_state = self.get_type_state(type_id, account_id);
        if client_state != old_state {
            if let Some(new_state) = new_state {
                self.source_state_did_change(type_id, account_id, new_state);
            }
            return;
        }

        for sk in changed.iter().map(|p| self.get_store_key(type_id, account_id, &p.id)) {
            let status = self.get_status(sk);
            self.set_status_and_settle(sk, status | Status::OBSOLETE);
        }
        self.source_did_fetch_partial_records(type_id, account_id, changed);

        for id in destroyed {
            let sk = self.get_store_key(type_id, account_id, &id);
            self.destroy_remotely(sk);
        }

        if let Some(new_state) = new_state {
            self.inner.borrow_mut().client_state.insert((type_id, account_id.clone()), new_state);
        }
        let status = self.get_type_status(type_id, account_id) - Status::LOADING;
        self.set_type_status(type_id, account_id, status);
    }

    /// `sourceDidDestroyRecords`, single-storeKey case. Guards against
    /// stomping an id that has since been reassigned: only destroys if the
    /// id -> storeKey mapping still points at this exact storeKey.
    fn destroy_remotely(&self, sk: StoreKey) {
        let Some(type_id) = self.get_type_from_store_key(sk) else { return };
        let Some(id) = self.get_id_from_store_key(sk) else { return };
        let Some(account_id) = self.get_account_id_from_store_key(sk) else { return };
        let still_current = self.inner.borrow().id_index.get(&(type_id, account_id, id)).copied() == Some(sk);
        if !still_current {
            return;
        }
        let status = self.get_status(sk);
        let next = status.with_core_state(Status::DESTROYED);
        self.set_status_and_settle(sk, next);
        self.unload_record(sk);
        self.queue_change_notification(type_id, sk);
    }

    // ---- type-level state reconciliation (§4.3) ---------------------------

    /// `sourceStateDidChange`: records the server's reported state and, once
    /// the type is no longer `LOADING`/`COMMITTING`, checks whether a
    /// refetch is needed.
    pub(crate) fn source_state_did_change(&self, type_id: TypeId, account_id: &AccountId, new_state: String) {
        self.inner.borrow_mut().server_state.insert((type_id, account_id.clone()), new_state);
        if self.get_type_status(type_id, account_id).is(Status::LOADING | Status::COMMITTING) {
            return;
        }
        self.check_server_state(type_id, account_id);
    }

    /// Refetches `(type_id, account_id)` if the server's last-reported
    /// state no longer matches what the client has assimilated. State
    /// tokens are compared only by equality (§4.3) -- never ordered.
    pub(crate) fn check_server_state(&self, type_id: TypeId, account_id: &AccountId) {
        let server_state = self.inner.borrow().server_state.get(&(type_id, account_id.clone())).cloned();
        let client_state = self.get_type_state(type_id, account_id);
        if server_state.is_some() && server_state != client_state {
            self.queue_server_state_event(type_id, account_id);
            self.fetch_all(type_id, account_id);
        }
    }

    // ---- commit outcome (invoked from commit.rs) --------------------------

    pub(crate) fn apply_commit_outcome(&self, outcome: crate::source::CommitOutcome) {
        for result in outcome.created {
            self.handle_create_result(result);
        }
        for result in outcome.updated {
            self.handle_update_result(result);
        }
        for result in outcome.destroyed {
            self.handle_destroy_result(result);
        }

        let (auto_commit, more_changes) = {
            let mut inner = self.inner.borrow_mut();
            inner.is_committing = false;
            for status in inner.type_status.values_mut() {
                *status = *status - Status::COMMITTING;
            }
            (inner.config.auto_commit, !inner.dirty_keys.is_empty())
        };
        if auto_commit && more_changes {
            self.schedule_commit();
        }
    }

    fn handle_create_result(&self, result: CreateResult) {
        match result {
            CreateResult::Created { store_key, id, server_data } => {
                let Some(type_id) = self.get_type_from_store_key(store_key) else { return };
                let Some(account_id) = self.get_account_id_from_store_key(store_key) else { return };
                let translated = self.translate_ingress_for(type_id, &account_id, &server_data);
                let next = {
                    let mut inner = self.inner.borrow_mut();
                    inner.sk_to_id.insert(store_key, id.clone());
                    inner.id_index.insert((type_id, account_id, id), store_key);
                    inner.data.entry(store_key).or_default().extend(translated);
                    let status = inner.status.get(&store_key).copied().unwrap_or(Status::EMPTY);
                    let next = status - Status::COMMITTING - Status::NEW;
                    inner.status.insert(store_key, next);
                    next
                };
                self.set_status_and_settle(store_key, next);
                self.queue_change_notification(type_id, store_key);
            }
            CreateResult::Failed { store_key, permanent, message } => {
                self.handle_commit_failure(store_key, CommitPhase::Create, permanent, message);
            }
        }
    }

    fn handle_update_result(&self, result: UpdateResult) {
        match result {
            UpdateResult::Committed { store_key } => {
                let next = {
                    let mut inner = self.inner.borrow_mut();
                    inner.rollback.remove(&store_key);
                    let status = inner.status.get(&store_key).copied().unwrap_or(Status::EMPTY);
                    let next = status - Status::COMMITTING;
                    inner.status.insert(store_key, next);
                    next
                };
                self.set_status_and_settle(store_key, next);
                if let Some(type_id) = self.get_type_from_store_key(store_key) {
                    self.queue_change_notification(type_id, store_key);
                }
            }
            UpdateResult::Failed { store_key, permanent, message } => {
                self.handle_commit_failure(store_key, CommitPhase::Update, permanent, message);
            }
        }
    }

    fn handle_destroy_result(&self, result: DestroyResult) {
        match result {
            DestroyResult::Committed { store_key } => {
                if self.get_status(store_key).is(Status::DESTROYED) {
                    self.unload_record(store_key);
                } else {
                    let next = {
                        let mut inner = self.inner.borrow_mut();
                        let status = inner.status.get(&store_key).copied().unwrap_or(Status::EMPTY);
                        let next = (status - Status::COMMITTING) | Status::DIRTY;
                        inner.status.insert(store_key, next);
                        inner.dirty_keys.insert(store_key);
                        next
                    };
                    self.set_status_and_settle(store_key, next);
                }
                if let Some(type_id) = self.get_type_from_store_key(store_key) {
                    self.queue_change_notification(type_id, store_key);
                }
            }
            DestroyResult::Failed { store_key, permanent, message } => {
                self.handle_commit_failure(store_key, CommitPhase::Destroy, permanent, message);
            }
        }
    }

    /// §7's permanent/transient commit-failure recovery policy. Listeners
    /// registered via [`Store::on_commit_error`] may return `true` to
    /// prevent the default revert (`record:commit:error`'s
    /// `preventDefault`).
    fn handle_commit_failure(&self, store_key: StoreKey, phase: CommitPhase, permanent: bool, message: String) {
        let error = CommitError { phase, is_permanent: permanent, message };
        tracing::warn!(%store_key, phase = ?error.phase, permanent, "commit entry failed");

        let listeners = self.inner.borrow().commit_error_listeners.clone();
        let prevented = listeners.iter().any(|listener| listener(store_key, &error));
        if prevented {
            tracing::warn!(%store_key, "commit error revert prevented by listener");
            let status = self.get_status(store_key) - Status::COMMITTING;
            self.set_status_and_settle(store_key, status);
            if let Some(type_id) = self.get_type_from_store_key(store_key) {
                self.queue_change_notification(type_id, store_key);
            }
            return;
        }

        let next = if !permanent {
            let status = self.get_status(store_key) - Status::COMMITTING;
            let next = status | Status::DIRTY | if error.phase == CommitPhase::Create { Status::NEW } else { Status::EMPTY };
            self.inner.borrow_mut().dirty_keys.insert(store_key);
            next
        } else {
            match error.phase {
                CommitPhase::Create => {
                    let mut inner = self.inner.borrow_mut();
                    inner.data.remove(&store_key);
                    inner.changed.remove(&store_key);
                    inner.rollback.remove(&store_key);
                    Status::NON_EXISTENT
                }
                CommitPhase::Update => {
                    let mut inner = self.inner.borrow_mut();
                    if let Some(rollback) = inner.rollback.remove(&store_key) {
                        inner.data.insert(store_key, rollback);
                    }
                    inner.changed.remove(&store_key);
                    let status = inner.status.get(&store_key).copied().unwrap_or(Status::EMPTY);
                    status - Status::COMMITTING - Status::DIRTY
                }
                CommitPhase::Destroy => {
                    self.inner.borrow_mut().dirty_keys.insert(store_key);
                    let status = self.get_status(store_key);
                    (status.with_core_state(Status::READY) - Status::COMMITTING) | Status::DIRTY
                }
            }
        };
        self.set_status_and_settle(store_key, next);
        if let Some(type_id) = self.get_type_from_store_key(store_key) {
            self.queue_change_notification(type_id, store_key);
        }
    }
}
