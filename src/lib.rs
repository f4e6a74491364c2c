//! An in-memory, observable record store mediating between an application
//! and a remote JSON/HTTP-shaped data source.
//!
//! - **Status** ([`status`]): the bitmask lifecycle every storeKey carries.
//! - **Identity** ([`ids`]): `StoreKey`/`RecordId`/`AccountId`/`TypeId`.
//! - **Schema** ([`schema`]): `RecordSchema`/`AttributeDef`/`Validator`.
//! - **Store** ([`store`]): the commit pipeline, identity tables, and
//!   `sourceDid*` callback handling.
//! - **Record** ([`record`]): a thin storeKey-scoped facade over `Store`.
//! - **Query** ([`query`]): `LocalQuery` (client-filtered live views) and
//!   `WindowedQuery` (server-ordered, lazily-paged result sets).
//! - **Source** ([`source`]): the external I/O collaborator contract.
//! - **Config/Clock/RunLoop/Notify/Error**: the ambient plumbing the above
//!   modules are built on.

pub mod clock;
pub mod config;
pub mod error;
pub mod ids;
pub mod notify;
pub mod query;
pub mod record;
pub mod runloop;
pub mod schema;
pub mod source;
pub mod status;
pub mod store;

pub use clock::{Clock, SystemClock};
pub use config::StoreConfig;
pub use error::{CommitError, CommitPhase, StoreError, ValidationError};
pub use ids::{AccountId, RecordId, StoreKey, TypeId};
pub use query::{LocalQuery, WindowedQuery};
pub use record::Record;
pub use runloop::{Queue, RunLoop};
pub use schema::{AttributeDef, AttributeKind, RecordSchema, Validator};
pub use source::Source;
pub use status::Status;
pub use store::Store;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::test_support::FakeClock;
    use crate::runloop::test_support::ImmediateRunLoop;
    use crate::source::*;
    use std::collections::HashMap;
    use std::rc::Rc;

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

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    /// Verifies all re-exports are accessible from the crate root and a
    /// minimal end-to-end create-then-read works.
    #[test]
    fn reexports_and_basic_flow() {
        let run_loop = Rc::new(ImmediateRunLoop::new());
        let store = Store::new(
            StoreConfig::default(),
            Rc::new(FakeClock::new(0)) as Rc<dyn Clock>,
            Rc::clone(&run_loop) as Rc<dyn RunLoop>,
            Rc::new(NullSource) as Rc<dyn Source>,
        );
        let type_id = store.register_type(RecordSchema::new("Task", vec![AttributeDef::scalar("title")]));
        let account = AccountId::new("acct1");
        let mut data = HashMap::new();
        data.insert("title".to_string(), serde_json::json!("write docs"));
        let record = store.create_record(type_id, &account, data).unwrap();

        assert!(record.is(Status::READY | Status::NEW | Status::DIRTY));
        assert_eq!(record.get("title"), Some(serde_json::json!("write docs")));
        run_loop.flush();
    }
}
