//! Status bitmask for a storeKey's lifecycle position.
//!
//! Kept as a single machine word rather than an enum-per-flag: the core
//! states (`EMPTY`/`READY`/`DESTROYED`/`NON_EXISTENT`) are mutually exclusive
//! by convention, but the remaining bits (`LOADING`, `COMMITTING`, `NEW`,
//! `DIRTY`, `OBSOLETE`) are orthogonal flags that can be composed freely with
//! any core state. Breaking this into a Rust enum would lose that structure.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not, Sub};

/// Bitmask describing a storeKey's current lifecycle position.
///
/// All predicates are bit-tests; see [`Status::is`] and the `const` bit
/// values below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Status(u32);

impl Status {
    /// No info known about this storeKey yet.
    pub const EMPTY: Status = Status(0);
    /// Data is loaded in memory.
    pub const READY: Status = Status(1 << 0);
    /// Record destroyed (locally and/or remotely).
    pub const DESTROYED: Status = Status(1 << 1);
    /// Server confirmed the record does not exist.
    pub const NON_EXISTENT: Status = Status(1 << 2);
    /// A fetch is in flight.
    pub const LOADING: Status = Status(1 << 3);
    /// A commit is in flight.
    pub const COMMITTING: Status = Status(1 << 4);
    /// Not yet created at the source.
    pub const NEW: Status = Status(1 << 5);
    /// Local changes not yet committed.
    pub const DIRTY: Status = Status(1 << 6);
    /// Server may have newer data than what is loaded.
    pub const OBSOLETE: Status = Status(1 << 7);

    /// Mask covering the mutually-exclusive core states.
    pub const CORE_STATE_MASK: Status =
        Status(Self::EMPTY.0 | Self::READY.0 | Self::DESTROYED.0 | Self::NON_EXISTENT.0);

    /// Constructs a `Status` from a raw bit pattern.
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Status(bits)
    }

    /// Returns the raw bit pattern.
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Tests whether any bit in `mask` is set.
    #[must_use]
    pub const fn is(self, mask: Status) -> bool {
        (self.0 & mask.0) != 0
    }

    /// Tests whether every bit in `mask` is set.
    #[must_use]
    pub const fn has_all(self, mask: Status) -> bool {
        (self.0 & mask.0) == mask.0
    }

    /// Returns the core state (`EMPTY`/`READY`/`DESTROYED`/`NON_EXISTENT`) alone,
    /// stripping any composable flags.
    #[must_use]
    pub const fn core_state(self) -> Status {
        Status(self.0 & Self::CORE_STATE_MASK.0)
    }

    /// Replaces the core state while preserving composable flags.
    #[must_use]
    pub const fn with_core_state(self, core: Status) -> Status {
        Status((self.0 & !Self::CORE_STATE_MASK.0) | (core.0 & Self::CORE_STATE_MASK.0))
    }
}

impl BitOr for Status {
    type Output = Status;
    fn bitor(self, rhs: Status) -> Status {
        Status(self.0 | rhs.0)
    }
}

impl BitOrAssign for Status {
    fn bitor_assign(&mut self, rhs: Status) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for Status {
    type Output = Status;
    fn bitand(self, rhs: Status) -> Status {
        Status(self.0 & rhs.0)
    }
}

impl Not for Status {
    type Output = Status;
    fn not(self) -> Status {
        Status(!self.0)
    }
}

/// `a - b` clears every bit set in `b` from `a`.
impl Sub for Status {
    type Output = Status;
    fn sub(self, rhs: Status) -> Status {
        Status(self.0 & !rhs.0)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        let named = [
            (Status::READY, "READY"),
            (Status::DESTROYED, "DESTROYED"),
            (Status::NON_EXISTENT, "NON_EXISTENT"),
            (Status::LOADING, "LOADING"),
            (Status::COMMITTING, "COMMITTING"),
            (Status::NEW, "NEW"),
            (Status::DIRTY, "DIRTY"),
            (Status::OBSOLETE, "OBSOLETE"),
        ];
        for (bit, name) in named {
            if self.is(bit) {
                parts.push(name);
            }
        }
        if parts.is_empty() {
            write!(f, "EMPTY")
        } else {
            write!(f, "{}", parts.join("|"))
        }
    }
}
