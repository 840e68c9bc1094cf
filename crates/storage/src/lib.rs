//! Storage engine interface and the MVCC layer built on it.
//!
//! An [`Engine`] stores two kinds of data: raw, unversioned records for
//! replica-local bookkeeping (raft log, hard state, replica state) and
//! versioned records for everything reads observe at a timestamp. The
//! [`mvcc`] functions maintain [`MvccStats`] deltas incrementally as they
//! write; [`mvcc::compute_stats_for_range`] recomputes them from scratch.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod codec;
mod engine;
mod error;
pub mod mvcc;
mod stats;

pub use engine::{Engine, Version};
pub use error::{StorageError, StorageResult};
pub use stats::MvccStats;
