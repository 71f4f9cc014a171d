//! Foundational runtime utilities for the Ember VM.
//!
//! This crate provides the pieces of the runtime that are shared across
//! threads and consulted from performance-critical paths:
//!
//! - [`conc_table`]: a concurrent, GC-aware open-addressing hash table with
//!   lock-free readers and serialized writers, used for domain-wide
//!   type/method caches.
//! - [`reclaim`]: epoch-based deferred reclamation protecting readers of
//!   swappable data structures from concurrent frees.
//! - [`gc`]: the root-registration facade the table uses to cooperate with
//!   a moving collector without implementing one.

pub mod conc_table;
pub mod gc;
pub mod reclaim;

pub use conc_table::{ConcurrentWordTable, TOMBSTONE};
pub use gc::{GcPolicy, NullRegistrar, RootRegistrar};
pub use reclaim::{EpochGuard, ReclaimDomain};
