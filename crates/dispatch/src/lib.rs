//! Admission control for resolution jobs: a stable multi-level FIFO queue,
//! and a dispatcher which starts jobs in (priority, insertion) order while
//! enforcing per-priority caps on the number running concurrently.
//!
//! Everything here is single-threaded. Jobs are started synchronously and
//! may reenter the dispatcher from within `start`, including finishing
//! themselves; all entry points tolerate that.

mod dispatcher;
mod queue;

pub use dispatcher::{Job, Limits, PrioritizedDispatcher};
pub use queue::{Handle, Priority, PriorityQueue};
