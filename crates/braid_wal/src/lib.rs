//! Write-ahead log primitives for the shard replication engine.
//!
//! This crate owns the log entry identity model, the `Wal` trait that the
//! replication engine drives, an in-memory reference implementation, and the
//! age-based retention trimmer.

pub mod clock;
pub mod log;
pub mod trimmer;

pub use clock::{Clock, SystemClock};
pub use log::{EntryId, LogEntry, MemoryWal, Wal};
pub use trimmer::{Trimmer, TrimmerOptions, DEFAULT_CHECK_INTERVAL, DEFAULT_RETENTION};
