//! The commit pipeline (§4.2): partitions dirty/new/destroyed storeKeys
//! into per-(type, account) change entries and hands them to the `Source`.
//!
//! Grounded on the teacher's `storage::engine` commit/flush path
//! (`server-rust/src/storage/engine.rs`), which likewise batches pending
//! mutations before handing them to a single external callback. The whole
//! object graph is single-threaded (§5), so unlike the teacher's concurrent
//! flush this is one global `is_committing` gate rather than a per-shard
//! lock -- §3.4 invariant 5 only asks for one commit in flight at a time.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde_json::Value as JsonValue;

use crate::ids::{AccountId, StoreKey, TypeId};
use crate::schema::RecordSchema;
use crate::source::{ChangeEntry, CommitBatch, CreateEntry, DestroyEntry, MoveEntry, UpdateEntry};
use crate::status::Status;

use super::{fk, Store};

fn filter_client_settable(schema: &RecordSchema, data: &HashMap<String, JsonValue>) -> HashMap<String, JsonValue> {
    let settable: HashSet<&str> = schema.client_settable().into_iter().collect();
    data.iter()
        .filter(|(k, _)| settable.contains(k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

impl Store {
    /// Builds a batch from every currently-dirty storeKey and hands it to
    /// the source. A no-op if a commit is already in flight (it will run
    /// again once the current one's `done` fires and, if more dirty
    /// storeKeys remain, reschedules itself) or if nothing is dirty.
    pub fn commit_changes(&self) {
        if self.inner.borrow().is_committing {
            return;
        }
        let (batch, touched) = self.build_commit_batch();
        if touched.is_empty() {
            return;
        }
        tracing::debug!(entries = batch.entries.len(), storekeys = touched.len(), "commit_changes");

        let source = {
            let mut inner = self.inner.borrow_mut();
            inner.is_committing = true;
            Rc::clone(&inner.source)
        };
        let store = self.clone();
        source.commit_changes(batch, Box::new(move |outcome| store.apply_commit_outcome(outcome)));
    }

    fn build_commit_batch(&self) -> (CommitBatch, Vec<StoreKey>) {
        let mut inner = self.inner.borrow_mut();
        let dirty: Vec<StoreKey> = inner.dirty_keys.iter().copied().collect();
        let mut per_pair: HashMap<(TypeId, AccountId), ChangeEntry> = HashMap::new();
        let mut touched = Vec::new();

        for sk in dirty {
            let Some(status) = inner.status.get(&sk).copied() else { continue };
            let Some(type_id) = inner.type_of.get(&sk).copied() else { continue };
            let Some(account_id) = inner.account_of.get(&sk).cloned() else { continue };

            if status.is(Status::DESTROYED) {
                // Skip the old side of a move: its new storeKey will be
                // emitted as a `moveFromAccount` entry instead (§10).
                if let Some(&new_sk) = inner.destroyed_to.get(&sk) {
                    if inner.created_from.get(&new_sk) == Some(&sk) {
                        touched.push(sk);
                        continue;
                    }
                }
                if let Some(id) = inner.sk_to_id.get(&sk).cloned() {
                    per_pair
                        .entry((type_id, account_id))
                        .or_default()
                        .destroy
                        .push(DestroyEntry { store_key: sk, id });
                }
                touched.push(sk);
                continue;
            }

            if status.is(Status::NEW) {
                let data = inner.data.get(&sk).cloned().unwrap_or_default();
                let schema = inner.schema_for(type_id);
                let filtered = schema.map(|s| filter_client_settable(s, &data)).unwrap_or(data);
                let translated = schema
                    .map(|s| fk::translate_egress(s, &filtered, |rsk| inner.sk_to_id.get(&rsk).cloned()))
                    .unwrap_or(filtered);

                if let Some(&origin_sk) = inner.created_from.get(&sk) {
                    if let Some(origin_id) = inner.sk_to_id.get(&origin_sk).cloned() {
                        let origin_account =
                            inner.account_of.get(&origin_sk).cloned().unwrap_or_else(|| account_id.clone());
                        per_pair
                            .entry((type_id, account_id))
                            .or_default()
                            .move_from_account
                            .entry(origin_account)
                            .or_default()
                            .push(MoveEntry { store_key: sk, copy_from_id: origin_id, data: translated });
                        touched.push(sk);
                        continue;
                    }
                }
                per_pair.entry((type_id, account_id)).or_default().create.push(CreateEntry {
                    store_key: sk,
                    data: translated,
                });
                touched.push(sk);
                continue;
            }

            // Plain update: only changed, syncable keys.
            let schema = inner.schema_for(type_id);
            let changed_keys: Vec<String> = inner
                .changed
                .get(&sk)
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter(|k| schema.and_then(|s| s.attribute(k)).is_none_or(|a| !a.no_sync))
                .collect();
            if changed_keys.is_empty() {
                inner.status.insert(sk, status - Status::DIRTY);
                inner.changed.remove(&sk);
                touched.push(sk);
                continue;
            }
            let Some(id) = inner.sk_to_id.get(&sk).cloned() else { continue };
            let data = inner.data.get(&sk).cloned().unwrap_or_default();
            let mut changes = HashMap::new();
            for key in &changed_keys {
                if let Some(value) = data.get(key) {
                    changes.insert(key.clone(), value.clone());
                }
            }
            let translated = schema
                .map(|s| fk::translate_egress(s, &changes, |rsk| inner.sk_to_id.get(&rsk).cloned()))
                .unwrap_or(changes);

            if let Some(committed) = inner.committed.remove(&sk) {
                inner.rollback.insert(sk, committed);
            }
            per_pair.entry((type_id, account_id)).or_default().update.push(UpdateEntry {
                store_key: sk,
                id,
                changes: translated,
            });
            touched.push(sk);
        }

        for sk in &touched {
            let status = inner.status.get(sk).copied().unwrap_or(Status::EMPTY);
            inner.status.insert(*sk, (status - Status::DIRTY) | Status::COMMITTING);
        }
        let touched_set: HashSet<StoreKey> = touched.iter().copied().collect();
        inner.dirty_keys.retain(|sk| !touched_set.contains(sk));

        for (type_id, account_id) in per_pair.keys().cloned().collect::<Vec<_>>() {
            let current = inner.type_status.get(&(type_id, account_id.clone())).copied().unwrap_or(Status::EMPTY);
            inner.type_status.insert((type_id, account_id), current | Status::COMMITTING);
        }

        let entries = per_pair.into_iter().map(|((t, a), entry)| (t, a, entry)).collect();
        (CommitBatch { entries }, touched)
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
    use crate::schema::AttributeDef;
    use crate::source::*;
    use std::cell::RefCell as StdRefCell;

    struct RecordingSource {
        seen: StdRefCell<Vec<CommitBatch>>,
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
        fn fetch_query(&self, _request: QueryFetchRequest, _reply: QueryReply) {}
        fn commit_changes(&self, changes: CommitBatch, done: Done<CommitOutcome>) {
            let created = changes
                .entries
                .iter()
                .flat_map(|(_, _, e)| e.create.iter())
                .map(|c| CreateResult::Created {
                    store_key: c.store_key,
                    id: RecordId::new(format!("srv-{}", c.store_key.raw())),
                    server_data: HashMap::new(),
                })
                .collect();
            self.seen.borrow_mut().push(changes);
            done(CommitOutcome { created, updated: vec![], destroyed: vec![] });
        }
    }

    #[test]
    fn create_commit_sends_single_entry_with_client_settable_data_only() {
        let run_loop = Rc::new(ImmediateRunLoop::new());
        let source = Rc::new(RecordingSource { seen: StdRefCell::new(vec![]) });
        let store = crate::store::Store::new(
            StoreConfig::default(),
            Rc::new(FakeClock::new(0)),
            Rc::clone(&run_loop) as Rc<dyn RunLoop>,
            Rc::clone(&source) as Rc<dyn Source>,
        );
        let type_id = store.register_type(RecordSchema::new(
            "Task",
            vec![AttributeDef::scalar("name"), AttributeDef::scalar("computed").no_sync()],
        ));
        let account = AccountId::new("p");
        let mut data = HashMap::new();
        data.insert("name".to_string(), JsonValue::from("a"));
        data.insert("computed".to_string(), JsonValue::from("server-only"));
        let record = store.create_record(type_id, &account, data).unwrap();
        let sk = record.store_key();

        run_loop.flush();

        let seen = source.seen.borrow();
        assert_eq!(seen.len(), 1);
        let (_, _, entry) = &seen[0].entries[0];
        assert_eq!(entry.create.len(), 1);
        assert_eq!(entry.create[0].store_key, sk);
        assert_eq!(entry.create[0].data.get("name"), Some(&JsonValue::from("a")));
        assert!(!entry.create[0].data.contains_key("computed"));

        assert_eq!(store.get_id_from_store_key(sk), Some(RecordId::new(format!("srv-{}", sk.raw()))));
        let status = store.get_status(sk);
        assert!(status.is(Status::READY));
        assert!(!status.is(Status::NEW));
        assert!(!status.is(Status::COMMITTING));
    }
}
