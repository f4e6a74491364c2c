//! Run-loop contract (external collaborator; §5, §A).
//!
//! The store never runs its own event loop -- it defers work onto named
//! queues that some host-provided scheduler drains on its own turns. This
//! module specifies only the contract, following the instruction that the
//! run-loop's scheduling primitives themselves are out of scope; what's
//! specified is the shape a caller must provide.
//!
//! The trait is intentionally not `Send`/`Sync`-bound: the whole object graph
//! is single-threaded and cooperatively scheduled (§5), so there is nothing
//! to synchronise and no reason to pay for atomics here.

/// Named queues a run-loop drains in a fixed order each turn.
///
/// `middle` is where the store schedules coalesced commits and type/range
/// notification fan-out, so that callers observing `before` never see a
/// partially-applied mutation batch (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Queue {
    /// Runs before any mutation fan-out; reserved for host bookkeeping.
    Before,
    /// Coalesced commits and change notifications run here.
    Middle,
    /// View-layer rendering, external to this crate.
    Render,
    /// Cleanup / telemetry, runs last.
    After,
}

/// Contract a host scheduler must provide.
///
/// Implementations are expected to run queued callbacks in `Before, Middle,
/// Render, After` order, draining each queue fully (including callbacks
/// enqueued by earlier callbacks in the same queue) before moving to the
/// next, and to do so on a single cooperative thread.
pub trait RunLoop {
    /// Schedules `callback` to run the next time `queue` is drained.
    fn invoke_later(&self, queue: Queue, callback: Box<dyn FnOnce()>);

    /// Schedules `callback` to run after at least `delay_ms` have elapsed,
    /// landing on the `middle` queue of whichever turn that falls in.
    fn invoke_after_delay(&self, delay_ms: u32, callback: Box<dyn FnOnce()>);
}
