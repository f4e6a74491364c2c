//! Source contract (§6.1): the external collaborator that performs I/O.
//!
//! The `Source` trait never touches the store's internal maps directly --
//! every method accepts a typed outcome and a `done` callback. The *caller*
//! (always [`crate::store::Store`]) builds that callback; invoking it is how
//! the source "replies" with e.g. `sourceDidCommitCreate`. This keeps the
//! trait itself a pure wire-protocol seam, the way the teacher's
//! `RecordStore`/`MapDataStore` traits stay ignorant of mutation-observer
//! wiring (`storage/record_store.rs`).
//!
//! Because the whole graph is single-threaded (§5), `done` is a plain
//! `Box<dyn FnOnce(T)>` rather than an `async fn` -- there is no executor to
//! suspend on.

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::ids::{AccountId, RecordId, StoreKey, TypeId};

/// A one-shot reply callback.
pub type Done<T> = Box<dyn FnOnce(T)>;

/// Wire-shaped record data: primary key plus the attribute hash, as the
/// source would deliver it (still using ids, not storeKeys, for references --
/// translation to storeKeys happens in the store on ingress).
#[derive(Debug, Clone)]
pub struct RecordPayload {
    pub id: RecordId,
    pub data: HashMap<String, JsonValue>,
}

/// Outcome of `fetch_record`/`refresh_record`.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The record was found; full data follows.
    Found(RecordPayload),
    /// `sourceCouldNotFindRecords` case: the source confirms absence.
    NotFound,
    /// Transport/server error; the store leaves the record `LOADING` cleared
    /// but otherwise unchanged so a caller can retry.
    Failed(String),
}

/// Outcome of `fetch_all_records`. A source may answer either with a full
/// snapshot (`sourceDidFetchRecords`) or, if it supports incremental
/// fetching from `since_state`, with a delta (`sourceDidFetchUpdates`).
#[derive(Debug, Clone)]
pub enum FetchAllOutcome {
    /// Full snapshot of every record of this type/account.
    Full {
        records: Vec<RecordPayload>,
        state: Option<String>,
    },
    /// Incremental delta since `old_state`.
    Delta {
        changed: Vec<RecordPayload>,
        destroyed: Vec<RecordId>,
        old_state: Option<String>,
        new_state: Option<String>,
    },
    Failed(String),
}

/// A page of ids for a `WindowedQuery`, as delivered by `sourceDidFetchIds`.
#[derive(Debug, Clone)]
pub struct IdsPacket {
    pub query_state: Option<String>,
    pub position: usize,
    pub ids: Vec<RecordId>,
    pub total: usize,
}

/// A single insertion in a [`DeltaUpdate`].
#[derive(Debug, Clone)]
pub struct AddedId {
    pub index: usize,
    pub id: RecordId,
}

/// A server-authored patch to a windowed query's result set
/// (`sourceDidFetchUpdate`).
#[derive(Debug, Clone)]
pub struct DeltaUpdate {
    pub old_query_state: Option<String>,
    pub new_query_state: Option<String>,
    pub removed: Vec<RecordId>,
    pub added: Vec<AddedId>,
    /// If set, the list is truncated to just after the last occurrence of
    /// this id (§4.5, apply-update step 1).
    pub up_to_id: Option<RecordId>,
    pub total: usize,
}

/// A contiguous range request, `[start, start + count)`.
#[derive(Debug, Clone, Copy)]
pub struct Range {
    pub start: usize,
    pub count: usize,
}

/// The payload `sourceWillFetchQuery` builds for the source to act on.
#[derive(Debug, Clone, Default)]
pub struct QueryFetchRequest {
    pub id_ranges: Vec<Range>,
    pub record_ranges: Vec<Range>,
    pub index_of: Vec<RecordId>,
    pub refresh: bool,
}

/// Reply channel for `fetch_query`: a source calls `on_ids` any number of
/// times and `on_update` at most once per `fetch_query` invocation, in
/// whichever order its transport delivers them.
pub struct QueryReply {
    pub on_ids: Done<IdsPacket>,
    pub on_update: Done<DeltaUpdate>,
}

/// A single record to create, with client-settable attributes only
/// (`noSync` attributes already filtered out per §4.2).
#[derive(Debug, Clone)]
pub struct CreateEntry {
    pub store_key: StoreKey,
    pub data: HashMap<String, JsonValue>,
}

/// A single record to update: only the changed, syncable keys.
#[derive(Debug, Clone)]
pub struct UpdateEntry {
    pub store_key: StoreKey,
    pub id: RecordId,
    pub changes: HashMap<String, JsonValue>,
}

/// A record created by copying an existing one from another account
/// (`moveFromAccount`, §4.2/§10).
#[derive(Debug, Clone)]
pub struct MoveEntry {
    pub store_key: StoreKey,
    pub copy_from_id: RecordId,
    pub data: HashMap<String, JsonValue>,
}

/// A single record to destroy.
#[derive(Debug, Clone)]
pub struct DestroyEntry {
    pub store_key: StoreKey,
    pub id: RecordId,
}

/// Per-(type, account) bundle submitted to the source in a single commit
/// (§4.2).
#[derive(Debug, Clone, Default)]
pub struct ChangeEntry {
    pub create: Vec<CreateEntry>,
    pub update: Vec<UpdateEntry>,
    pub move_from_account: HashMap<AccountId, Vec<MoveEntry>>,
    pub destroy: Vec<DestroyEntry>,
    pub state: Option<String>,
}

impl ChangeEntry {
    /// Whether this entry carries any work at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.create.is_empty()
            && self.update.is_empty()
            && self.move_from_account.values().all(Vec::is_empty)
            && self.destroy.is_empty()
    }
}

/// A batch of [`ChangeEntry`] values, one per (type, account) pair touched by
/// this commit.
#[derive(Debug, Clone)]
pub struct CommitBatch {
    pub entries: Vec<(TypeId, AccountId, ChangeEntry)>,
}

/// Result for a single created record.
#[derive(Debug, Clone)]
pub enum CreateResult {
    Created {
        store_key: StoreKey,
        id: RecordId,
        server_data: HashMap<String, JsonValue>,
    },
    Failed {
        store_key: StoreKey,
        permanent: bool,
        message: String,
    },
}

/// Result for a single updated record.
#[derive(Debug, Clone)]
pub enum UpdateResult {
    Committed { store_key: StoreKey },
    Failed {
        store_key: StoreKey,
        permanent: bool,
        message: String,
    },
}

/// Result for a single destroyed record.
#[derive(Debug, Clone)]
pub enum DestroyResult {
    Committed { store_key: StoreKey },
    Failed {
        store_key: StoreKey,
        permanent: bool,
        message: String,
    },
}

/// Outcome of an entire `commit_changes` call.
#[derive(Debug, Clone, Default)]
pub struct CommitOutcome {
    pub created: Vec<CreateResult>,
    pub updated: Vec<UpdateResult>,
    pub destroyed: Vec<DestroyResult>,
}

/// External collaborator performing I/O against the remote source (§6.1).
///
/// All asynchrony is expressed through `done`/`reply` callbacks rather than
/// `async fn`: the run-loop (not an executor) drives continuations (§5).
pub trait Source {
    fn fetch_record(&self, account: &AccountId, type_id: TypeId, id: &RecordId, done: Done<FetchOutcome>);

    fn refresh_record(&self, account: &AccountId, type_id: TypeId, id: &RecordId, done: Done<FetchOutcome>);

    fn fetch_all_records(
        &self,
        account: &AccountId,
        type_id: TypeId,
        since_state: Option<&str>,
        done: Done<FetchAllOutcome>,
    );

    fn fetch_query(&self, request: QueryFetchRequest, reply: QueryReply);

    fn commit_changes(&self, changes: CommitBatch, done: Done<CommitOutcome>);
}
