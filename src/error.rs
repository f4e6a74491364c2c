//! Error taxonomy.
//!
//! Follows the teacher's split between a `thiserror`-derived enum for
//! programming errors the store can statically name (`service/operation.rs`'s
//! `OperationError`/`ClassifyError`) and small dedicated structs for the
//! data-dependent cases (validation, commit failures) that the JS original
//! represents as plain objects rather than an exception hierarchy.

use crate::ids::{StoreKey, TypeId};

/// Programming errors: the caller asked the store to do something the state
/// machine forbids. Per §7, these are reported and the mutation is a no-op —
/// they are never allowed to panic the store.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum StoreError {
    /// `createRecord` called for a storeKey that already has a core state.
    #[error("storeKey {0} already exists")]
    AlreadyExists(StoreKey),

    /// A mutation was attempted on a storeKey with no core state assigned.
    #[error("storeKey {0} is not yet ready to write")]
    NotEditable(StoreKey),

    /// Lookup against a storeKey the store has never minted.
    #[error("unknown storeKey {0}")]
    UnknownStoreKey(StoreKey),

    /// Lookup against a `TypeId` the store has never registered.
    #[error("unknown type {0}")]
    UnknownType(TypeId),

    /// `commitChanges` invoked while a commit for this (type, account) is
    /// already in flight; violates invariant 5 (at most one commit per
    /// storeKey in flight).
    #[error("a commit is already in flight for this type/account pair")]
    AlreadyCommitting,

    /// `destroyRecord`/`updateData` called on a storeKey that is already
    /// `DESTROYED` or `NON_EXISTENT`.
    #[error("storeKey {0} is destroyed or non-existent")]
    NotEditableDestroyed(StoreKey),

    /// `moveRecord` targeted the account the record already belongs to.
    #[error("storeKey {0} is already in the target account")]
    AlreadyInAccount(StoreKey),
}

/// Validation failure for a single attribute. Surfaced via
/// `Record::error_for_attribute`; never blocks a write, only `is_valid`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Property key of the offending attribute.
    pub attribute: String,
    /// Human-readable description of the failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.attribute, self.message)
    }
}

/// Which commit phase a [`CommitError`] occurred during.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitPhase {
    /// `sourceDidNotCreate`.
    Create,
    /// `sourceDidNotUpdate`.
    Update,
    /// `sourceDidNotDestroy`.
    Destroy,
}

/// Error reported by the `Source` for a commit entry that did not succeed.
///
/// Carried separately from [`StoreError`] because the recovery policy (§7)
/// depends on both `phase` and `is_permanent`, not on a single discriminant.
#[derive(Debug, Clone)]
pub struct CommitError {
    /// Which commit phase failed.
    pub phase: CommitPhase,
    /// `true` if the source has determined retrying will never succeed.
    pub is_permanent: bool,
    /// Source-supplied human-readable description.
    pub message: String,
}

impl std::fmt::Display for CommitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?} commit {} failed: {}",
            self.phase,
            if self.is_permanent { "permanently" } else { "transiently" },
            self.message
        )
    }
}
