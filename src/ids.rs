//! Identity types: storeKey, account id, record id, and type id.
//!
//! Mirrors the teacher's newtype-over-primitive style for opaque handles
//! (e.g. `topgun_core::hlc::Timestamp` wrapping its fields), but kept as
//! single-field wrappers since each of these ids has no internal structure.

use std::fmt;
use std::rc::Rc;

/// Opaque, process-unique token minted for every (account, type, id) tuple
/// the store has ever seen. Stable for the life of the process.
///
/// Records not yet persisted have a `StoreKey` but no [`RecordId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StoreKey(u64);

impl StoreKey {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        StoreKey(raw)
    }

    /// Raw numeric value, exposed for diagnostics and stable hashing into
    /// external indexes (e.g. a `WindowedQuery`'s sparse position array).
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sk{}", self.0)
    }
}

/// Source-assigned primary key. Cheaply cloneable (`Rc<str>`) since the same
/// id is threaded through many per-type maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordId(Rc<str>);

impl RecordId {
    /// Wraps any string-like value as a `RecordId`.
    pub fn new(id: impl AsRef<str>) -> Self {
        RecordId(Rc::from(id.as_ref()))
    }

    /// Borrows the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        RecordId::new(s)
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        RecordId::new(s)
    }
}

/// Partitioning dimension: every record belongs to exactly one account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AccountId(Rc<str>);

impl AccountId {
    /// Wraps any string-like value as an `AccountId`.
    pub fn new(id: impl AsRef<str>) -> Self {
        AccountId(Rc::from(id.as_ref()))
    }

    /// Borrows the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(s: &str) -> Self {
        AccountId::new(s)
    }
}

impl From<String> for AccountId {
    fn from(s: String) -> Self {
        AccountId::new(s)
    }
}

/// Interned identifier for a registered [`crate::schema::RecordSchema`].
///
/// Assigned sequentially by [`crate::store::Store::register_type`]; index
/// into the store's schema table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(u32);

impl TypeId {
    pub(crate) const fn from_raw(raw: u32) -> Self {
        TypeId(raw)
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type{}", self.0)
    }
}
