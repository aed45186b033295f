//! Replicated log: driver task around the raft library, storage
//! profiles, and the async handle the rest of the agent talks to.

pub mod handle;
pub mod node;
mod segment;
pub mod storage;

use std::time::Duration;

use crate::error::Result;

/// Timeout for command application and transport operations.
pub const RAFT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout for the write barrier a fresh leader issues before its first
/// reconciliation sweep.
pub const BARRIER_WRITE_TIMEOUT: Duration = Duration::from_secs(120);

/// Entries kept in the in-memory write-through cache ahead of the
/// durable log; reads past the cache fall back to the WAL.
pub const RAFT_LOG_CACHE_SIZE: u64 = 512;

/// Snapshots retained on disk.
pub const RAFT_SNAPSHOT_RETAIN: usize = 3;

/// Deterministic state machine driven by committed log entries.
///
/// Apply is called exactly once per committed entry, in index order, on
/// the driver task. Errors from apply reach only the local submitter.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, index: u64, data: &[u8]) -> Result<()>;

    /// Serializes the full state. Must not block applies longer than the
    /// brief exclusive section needed to take a consistent view.
    fn snapshot(&self) -> Result<Vec<u8>>;

    /// Atomically replaces the state from a snapshot.
    fn restore(&mut self, last_index: u64, last_term: u64, data: &[u8]) -> Result<()>;
}
