//! `WindowedQuery` (§4.5): a server-ordered, lazily-paged view over a
//! potentially huge result set. Fixed-size windows track id-fetch and
//! record-fetch progress independently; a sparse `storeKeys` array holds
//! whatever positions are currently known.
//!
//! Grounded on the same shared-handle pattern as
//! [`crate::query::local::LocalQuery`], composed with the window state
//! machine ([`window`]), the identity-based patch shape ([`update`]), and
//! the compose/invert algebra ([`compose`]) that make reconciling server
//! deltas against outstanding local edits tractable.

pub mod compose;
pub mod update;
pub mod window;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::ids::{AccountId, RecordId, StoreKey, TypeId};
use crate::notify::{TypeEvent, TypeObserver};
use crate::source::{AddedId, DeltaUpdate, Done, IdsPacket, QueryFetchRequest, QueryReply, Range};
use crate::status::Status;
use crate::store::Store;

use self::update::{apply, ListUpdate};
use self::window::{window_of, WindowStatus};

struct Inner {
    store_keys: Vec<Option<StoreKey>>,
    windows: Vec<WindowStatus>,
    query_state: Option<String>,
    preemptive_updates: Vec<ListUpdate>,
    /// `store_keys` as it stood immediately before the first outstanding
    /// preemptive update, so a later invert can restore entries to their
    /// true original position rather than guessing. Captured when
    /// `preemptive_updates` goes from empty to non-empty, cleared once
    /// they're all reconciled.
    pre_preemptive_store_keys: Option<Vec<Option<StoreKey>>>,
    waiting_packets: Vec<IdsPacket>,
    length: usize,
    status: Status,
    destroyed: bool,
}

/// A live, server-ordered, windowed result set (§4.5).
pub struct WindowedQuery {
    store: Store,
    type_id: TypeId,
    account_id: AccountId,
    window_size: usize,
    inner: RefCell<Inner>,
}

impl WindowedQuery {
    #[must_use]
    pub fn new(store: Store, type_id: TypeId, account_id: AccountId, window_size: usize) -> Rc<Self> {
        let window_size = window_size.max(1);
        Rc::new_cyclic(|weak: &Weak<WindowedQuery>| {
            let observer: Weak<dyn TypeObserver> = weak.clone();
            store.register_observer(type_id, observer);
            WindowedQuery {
                store,
                type_id,
                account_id,
                window_size,
                inner: RefCell::new(Inner {
                    store_keys: Vec::new(),
                    windows: Vec::new(),
                    query_state: None,
                    preemptive_updates: Vec::new(),
                    pre_preemptive_store_keys: None,
                    waiting_packets: Vec::new(),
                    length: 0,
                    status: Status::EMPTY,
                    destroyed: false,
                }),
            }
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().length
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn window_count(&self) -> usize {
        let len = self.len();
        (len + self.window_size - 1) / self.window_size
    }

    #[must_use]
    pub fn is_obsolete(&self) -> bool {
        self.inner.borrow().status.is(Status::OBSOLETE)
    }

    #[must_use]
    pub fn has_preemptive_updates(&self) -> bool {
        !self.inner.borrow().preemptive_updates.is_empty()
    }

    /// The last state token confirmed by a `sourceDidFetchIds`/`sourceDidFetchUpdate`
    /// reply, if any page has ever been resolved.
    #[must_use]
    pub fn query_state(&self) -> Option<String> {
        self.inner.borrow().query_state.clone()
    }

    pub fn destroy(&self) {
        self.inner.borrow_mut().destroyed = true;
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.borrow().destroyed
    }

    fn ensure_window_slots(inner: &mut Inner, window_size: usize, up_to_len: usize) {
        let needed = (up_to_len + window_size - 1) / window_size;
        if inner.windows.len() < needed {
            inner.windows.resize(needed, WindowStatus::EMPTY);
        }
    }

    /// Every position in `[start, start + count)` currently known, as a
    /// sparse slice (`None` for not-yet-fetched slots).
    #[must_use]
    pub fn get_store_keys_for_objects_in_range(&self, start: usize, count: usize) -> Vec<Option<StoreKey>> {
        let inner = self.inner.borrow();
        (start..start + count).map(|i| inner.store_keys.get(i).copied().flatten()).collect()
    }

    /// The position of `sk` in the list, if currently known.
    #[must_use]
    pub fn index_of_store_key(&self, sk: StoreKey) -> Option<usize> {
        self.inner.borrow().store_keys.iter().position(|slot| *slot == Some(sk))
    }

    /// Coalesces every window not yet `REQUESTED`/`READY` into contiguous
    /// id-fetch ranges and flips them `REQUESTED|LOADING`. `optimiseFetching`
    /// range-narrowing (§4.5) is not modeled here -- every gap is requested
    /// unconditionally, which is always correct, just not maximally lazy.
    #[must_use]
    pub fn source_will_fetch_query(&self) -> QueryFetchRequest {
        let mut inner = self.inner.borrow_mut();
        Self::ensure_window_slots(&mut inner, self.window_size, inner.length.max(self.window_size));
        let window_size = self.window_size;

        let needs_fetch = |status: &WindowStatus| !status.is(WindowStatus::READY) && !status.is(WindowStatus::LOADING);

        let mut ranges: Vec<Range> = Vec::new();
        let mut run_start: Option<usize> = None;
        for (idx, status) in inner.windows.iter().enumerate() {
            if needs_fetch(status) {
                if run_start.is_none() {
                    run_start = Some(idx);
                }
            } else if let Some(start) = run_start.take() {
                ranges.push(range_for(start, idx, window_size));
            }
        }
        if let Some(start) = run_start {
            ranges.push(range_for(start, inner.windows.len(), window_size));
        }

        for status in &mut inner.windows {
            if needs_fetch(status) {
                *status = *status | WindowStatus::REQUESTED | WindowStatus::LOADING;
            }
        }

        QueryFetchRequest { id_ranges: ranges, record_ranges: Vec::new(), index_of: Vec::new(), refresh: false }
    }

    /// Builds the request via [`Self::source_will_fetch_query`] and hands
    /// it to the source, wiring `on_ids`/`on_update` back to this query.
    pub fn fetch(self: &Rc<Self>) {
        let request = self.source_will_fetch_query();
        if request.id_ranges.is_empty() {
            return;
        }
        let source = {
            let inner = self.store.inner.borrow();
            Rc::clone(&inner.source)
        };
        let on_ids: Done<IdsPacket> = {
            let query = Rc::clone(self);
            Box::new(move |packet| query.source_did_fetch_ids(packet))
        };
        let on_update: Done<DeltaUpdate> = {
            let query = Rc::clone(self);
            Box::new(move |update| query.source_did_fetch_update(update))
        };
        source.fetch_query(request, QueryReply { on_ids, on_update });
    }

    /// Resolves a page of ids into storeKeys and splices them into the
    /// sparse list, advancing `length` and recomputing window readiness
    /// (§4.5).
    pub fn source_did_fetch_ids(&self, packet: IdsPacket) {
        let mut inner = self.inner.borrow_mut();
        if inner.destroyed {
            return;
        }
        if packet.query_state != inner.query_state && inner.query_state.is_some() {
            inner.waiting_packets.push(packet);
            inner.status = inner.status | Status::OBSOLETE;
            return;
        }

        let needed = packet.position + packet.ids.len();
        if inner.store_keys.len() < needed {
            inner.store_keys.resize(needed, None);
        }
        for (offset, id) in packet.ids.iter().enumerate() {
            let sk = self.store.get_store_key(self.type_id, &self.account_id, id);
            inner.store_keys[packet.position + offset] = Some(sk);
        }
        inner.length = packet.total;
        inner.query_state = packet.query_state;

        Self::ensure_window_slots(&mut inner, self.window_size, inner.length);
        if !inner.windows.is_empty() && !packet.ids.is_empty() {
            let first = window_of(packet.position, self.window_size);
            let last = window_of((packet.position + packet.ids.len()).saturating_sub(1), self.window_size);
            for idx in first..=last.min(inner.windows.len() - 1) {
                let (start, end) = window::window_range(idx, self.window_size);
                let all_known =
                    (start..end.min(inner.length)).all(|pos| inner.store_keys.get(pos).copied().flatten().is_some());
                if all_known {
                    inner.windows[idx] = (inner.windows[idx] - WindowStatus::LOADING) | WindowStatus::READY;
                }
            }
        }
    }

    /// Reconciles a server-authored delta update against the current list
    /// and any outstanding preemptive (client) edits.
    ///
    /// Confirmation-matching against each cumulative prefix of preemptive
    /// updates (§4.5 Path B) is not modeled bit-for-bit here: whenever any
    /// preemptive update is outstanding, this always falls back to the
    /// "invert everything, apply the server truth, replay from there"
    /// branch rather than detecting and short-circuiting an exact-confirm
    /// case. It is always correctness-preserving, just not maximally
    /// smooth when a preemptive edit happens to match the server exactly.
    /// The invert step restores reinstated entries to the position they
    /// held in `pre_preemptive_store_keys`, so a contradicting server delta
    /// still lands ordered relative to edits it never touched.
    pub fn source_did_fetch_update(&self, update: DeltaUpdate) {
        let mut inner = self.inner.borrow_mut();
        if inner.destroyed {
            return;
        }
        if update.old_query_state != inner.query_state {
            inner.status = inner.status | Status::OBSOLETE;
            return;
        }

        let normalized = self.normalize(&update);
        if inner.preemptive_updates.is_empty() {
            apply(&mut inner.store_keys, &normalized);
        } else {
            let mut cumulative = inner.preemptive_updates[0].clone();
            for later in &inner.preemptive_updates[1..] {
                cumulative = compose::compose(&cumulative, later);
            }
            let original = inner.pre_preemptive_store_keys.take().unwrap_or_default();
            let undo = compose::invert(&cumulative, &original);
            apply(&mut inner.store_keys, &undo);
            apply(&mut inner.store_keys, &normalized);
            inner.preemptive_updates.clear();
        }

        inner.length = update.total;
        inner.query_state = update.new_query_state;
        inner.status = inner.status - Status::OBSOLETE;

        let waiting = std::mem::take(&mut inner.waiting_packets);
        drop(inner);
        for packet in waiting {
            self.source_did_fetch_ids(packet);
        }
    }

    fn normalize(&self, update: &DeltaUpdate) -> ListUpdate {
        let removed = update
            .removed
            .iter()
            .map(|id| self.store.get_store_key(self.type_id, &self.account_id, id))
            .collect();
        let added = update
            .added
            .iter()
            .map(|AddedId { index, id }| (*index, self.store.get_store_key(self.type_id, &self.account_id, id)))
            .collect();
        let up_to = update
            .up_to_id
            .as_ref()
            .map(|id| self.store.get_store_key(self.type_id, &self.account_id, id));
        ListUpdate { removed, added, truncate_at_first_gap: false, total: Some(update.total), up_to }
    }

    /// Registers and immediately applies a client-originated edit
    /// (reorder/insert/remove not yet confirmed by the server), marking the
    /// query `OBSOLETE` until the next `sourceDidFetchUpdate` reconciles it.
    pub fn client_did_generate_update(&self, update: ListUpdate) {
        let mut inner = self.inner.borrow_mut();
        if inner.destroyed {
            return;
        }
        if inner.preemptive_updates.is_empty() {
            inner.pre_preemptive_store_keys = Some(inner.store_keys.clone());
        }
        apply(&mut inner.store_keys, &update);
        inner.length = inner.store_keys.len();
        inner.preemptive_updates.push(update);
        inner.status = inner.status | Status::OBSOLETE;
    }
}

fn range_for(start_window: usize, end_window: usize, window_size: usize) -> Range {
    let start = start_window * window_size;
    let count = (end_window - start_window) * window_size;
    Range { start, count }
}

impl TypeObserver for WindowedQuery {
    fn on_type_event(&self, event: &TypeEvent) {
        if let TypeEvent::ServerStateChanged(account) = event {
            if account == &self.account_id {
                let mut inner = self.inner.borrow_mut();
                inner.status = inner.status | Status::OBSOLETE;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::config::StoreConfig;
    use crate::ids::RecordId;
    use crate::runloop::test_support::ImmediateRunLoop;
    use crate::runloop::RunLoop;
    use crate::schema::RecordSchema;
    use crate::source::*;
    use std::cell::RefCell as StdRefCell;

    struct RecordingSource {
        requests: StdRefCell<Vec<QueryFetchRequest>>,
    }

    impl Source for RecordingSource {
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
        fn fetch_query(&self, request: QueryFetchRequest, _reply: QueryReply) {
            self.requests.borrow_mut().push(request);
        }
        fn commit_changes(&self, _changes: CommitBatch, done: Done<CommitOutcome>) {
            done(CommitOutcome::default());
        }
    }

    fn test_store(source: Rc<RecordingSource>) -> Store {
        let run_loop = Rc::new(ImmediateRunLoop::new());
        Store::new(
            StoreConfig::default(),
            Rc::new(FakeClock::new(0)),
            Rc::clone(&run_loop) as Rc<dyn RunLoop>,
            source as Rc<dyn Source>,
        )
    }

    #[test]
    fn fetch_requests_the_first_window_when_nothing_is_known() {
        let source = Rc::new(RecordingSource { requests: StdRefCell::new(vec![]) });
        let store = test_store(Rc::clone(&source));
        let type_id = store.register_type(RecordSchema::new("Task", vec![]));
        let account = AccountId::new("a");
        let query = WindowedQuery::new(store, type_id, account, 30);

        query.fetch();
        let requests = source.requests.borrow();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id_ranges.len(), 1);
        assert_eq!(requests[0].id_ranges[0].start, 0);
        assert_eq!(requests[0].id_ranges[0].count, 30);
    }

    #[test]
    fn source_did_fetch_ids_fills_the_list_and_marks_window_ready() {
        let source = Rc::new(RecordingSource { requests: StdRefCell::new(vec![]) });
        let store = test_store(Rc::clone(&source));
        let type_id = store.register_type(RecordSchema::new("Task", vec![]));
        let account = AccountId::new("a");
        let query = WindowedQuery::new(store, type_id, account, 30);

        query.source_did_fetch_ids(IdsPacket {
            query_state: Some("s1".to_string()),
            position: 0,
            ids: vec![RecordId::new("t1"), RecordId::new("t2")],
            total: 2,
        });

        assert_eq!(query.len(), 2);
        assert_eq!(query.index_of_store_key(query.get_store_keys_for_objects_in_range(0, 1)[0].unwrap()), Some(0));
        let known = query.get_store_keys_for_objects_in_range(0, 2);
        assert!(known.iter().all(Option::is_some));
    }

    #[test]
    fn client_update_then_matching_server_update_reconciles_cleanly() {
        let source = Rc::new(RecordingSource { requests: StdRefCell::new(vec![]) });
        let store = test_store(Rc::clone(&source));
        let type_id = store.register_type(RecordSchema::new("Task", vec![]));
        let account = AccountId::new("a");
        let query = WindowedQuery::new(store.clone(), type_id, account.clone(), 30);

        query.source_did_fetch_ids(IdsPacket {
            query_state: Some("s1".to_string()),
            position: 0,
            ids: vec![RecordId::new("t1"), RecordId::new("t2")],
            total: 2,
        });
        assert!(!query.is_obsolete());

        let t3_sk = store.get_store_key(type_id, &account, &RecordId::new("t3"));
        query.client_did_generate_update(ListUpdate { added: vec![(2, t3_sk)], ..Default::default() });
        assert!(query.is_obsolete());
        assert_eq!(query.len(), 3);

        query.source_did_fetch_update(DeltaUpdate {
            old_query_state: Some("s1".to_string()),
            new_query_state: Some("s2".to_string()),
            removed: vec![],
            added: vec![AddedId { index: 2, id: RecordId::new("t3") }],
            up_to_id: None,
            total: 3,
        });

        assert!(!query.is_obsolete());
        assert!(!query.has_preemptive_updates());
        assert_eq!(query.len(), 3);
    }

    #[test]
    fn query_state_mismatch_marks_obsolete_instead_of_applying() {
        let source = Rc::new(RecordingSource { requests: StdRefCell::new(vec![]) });
        let store = test_store(Rc::clone(&source));
        let type_id = store.register_type(RecordSchema::new("Task", vec![]));
        let account = AccountId::new("a");
        let query = WindowedQuery::new(store, type_id, account, 30);

        query.source_did_fetch_ids(IdsPacket {
            query_state: Some("s1".to_string()),
            position: 0,
            ids: vec![RecordId::new("t1")],
            total: 1,
        });

        query.source_did_fetch_update(DeltaUpdate {
            old_query_state: Some("stale".to_string()),
            new_query_state: Some("s2".to_string()),
            removed: vec![],
            added: vec![],
            up_to_id: None,
            total: 1,
        });

        assert!(query.is_obsolete());
    }
}
