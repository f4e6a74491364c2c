//! The `Record` facade: a thin, storeKey-scoped view onto [`crate::store::Store`]
//! (§4.1).
//!
//! Grounded on the same shared-ownership idiom `Store` itself borrows from
//! the teacher (`storage::record_store::RecordStore`, see `store/mod.rs`'s
//! header): a `Record` holds an `Rc` clone of the store it came from rather
//! than copying data out of it. A `Record` never holds a `RefCell` borrow
//! across calls -- every accessor goes through [`Store`]'s own borrow-scoped
//! methods.
//!
//! §4.1's `getResult`/`ifSuccess`/`ifLoaded` futures have no async executor
//! to resolve against here (§5); [`Record::when_settled`] is their callback-
//! based equivalent, built directly on [`Store::when_settled`].

use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::error::{StoreError, ValidationError};
use crate::ids::{AccountId, RecordId, StoreKey, TypeId};
use crate::status::Status;
use crate::store::Store;

/// A handle to one storeKey's data and lifecycle state. Cheap to construct;
/// [`Store::get_record`]/[`Store::get_record_from_store_key`] cache and
/// reuse the same `Rc<Record>` for a given storeKey for as long as anyone
/// holds it (this is what makes a storeKey eviction-ineligible, §4.2).
pub struct Record {
    store: Store,
    store_key: StoreKey,
}

impl Record {
    pub(crate) fn new(store: Store, store_key: StoreKey) -> Self {
        Record { store, store_key }
    }

    #[must_use]
    pub fn store_key(&self) -> StoreKey {
        self.store_key
    }

    #[must_use]
    pub fn status(&self) -> Status {
        self.store.get_status(self.store_key)
    }

    /// Whether every bit in `mask` is currently set (e.g.
    /// `record.is(Status::READY | Status::DIRTY)`).
    #[must_use]
    pub fn is(&self, mask: Status) -> bool {
        self.status().has_all(mask)
    }

    #[must_use]
    pub fn type_id(&self) -> Option<TypeId> {
        self.store.get_type_from_store_key(self.store_key)
    }

    #[must_use]
    pub fn account_id(&self) -> Option<AccountId> {
        self.store.get_account_id_from_store_key(self.store_key)
    }

    /// The source-assigned id, or `None` for a record still `NEW`.
    #[must_use]
    pub fn id(&self) -> Option<RecordId> {
        self.store.get_id_from_store_key(self.store_key)
    }

    /// A single attribute's current value.
    #[must_use]
    pub fn get(&self, property_key: &str) -> Option<JsonValue> {
        self.store.get_data(self.store_key).get(property_key).cloned()
    }

    #[must_use]
    pub fn get_all(&self) -> HashMap<String, JsonValue> {
        self.store.get_data(self.store_key)
    }

    /// Sets a single attribute and marks the record `DIRTY`.
    pub fn set(&self, property_key: impl Into<String>, value: JsonValue) -> Result<(), StoreError> {
        let mut patch = HashMap::new();
        patch.insert(property_key.into(), value);
        self.update(patch)
    }

    /// Applies `patch` and marks the record `DIRTY`.
    pub fn update(&self, patch: HashMap<String, JsonValue>) -> Result<(), StoreError> {
        self.store.update_data(self.store_key, patch, true)
    }

    /// Reverts any uncommitted edits (§4.2).
    pub fn discard_changes(&self) -> Result<(), StoreError> {
        self.store.discard_changes(self.store_key)
    }

    /// Marks the record for destruction (§4.2).
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.store.destroy_record(self.store_key)
    }

    /// Reverses a pending local destroy (§4.2).
    pub fn undestroy(&self) -> Result<(), StoreError> {
        self.store.undestroy_record(self.store_key)
    }

    /// Moves this record to a different account (§10).
    pub fn move_to(&self, target_account: &AccountId) -> Result<StoreKey, StoreError> {
        self.store.move_record(self.store_key, target_account)
    }

    /// Requests a fresh fetch if the record isn't already `LOADING` or in a
    /// terminal state that makes fetching meaningless (`NEW`, `DESTROYED`,
    /// `NON_EXISTENT`).
    pub fn fetch(&self) {
        self.store.fetch_record_by_key(self.store_key);
    }

    /// Runs `callback` once this record's status is no longer `LOADING`/
    /// `COMMITTING` -- the callback analogue of `getResult`'s resolved
    /// future (§4.1).
    pub fn when_settled(&self, callback: impl FnOnce(Status) + 'static) {
        self.store.when_settled(self.store_key, Box::new(callback));
    }

    /// Every attribute currently failing its declared validator.
    #[must_use]
    pub fn errors(&self) -> Vec<ValidationError> {
        let Some(type_id) = self.type_id() else { return Vec::new() };
        let data = self.get_all();
        let inner = self.store.inner.borrow();
        let Some(schema) = inner.schema_for(type_id) else { return Vec::new() };
        schema
            .attributes
            .iter()
            .filter_map(|attr| {
                let validator = attr.validator.as_ref()?;
                let value = data.get(&attr.property_key).unwrap_or(&attr.default);
                validator.validate(value, &attr.property_key).map(|message| ValidationError {
                    attribute: attr.property_key.clone(),
                    message,
                })
            })
            .collect()
    }

    /// A single attribute's validation failure, if any.
    #[must_use]
    pub fn error_for_attribute(&self, property_key: &str) -> Option<ValidationError> {
        self.errors().into_iter().find(|e| e.attribute == property_key)
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors().is_empty()
    }
}
