//! Log entry identity and the per-shard write-ahead log contract.
//!
//! A shard replica owns exactly one log. Offsets are contiguous between the
//! first and last entry, and an entry is immutable for as long as it is
//! present. Truncation removes a suffix, trimming removes a prefix.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Mutex;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

/// Identifier of a log entry: a `(term, offset)` pair ordered
/// lexicographically. `(0, 0)` is the sentinel for "no entry".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct EntryId {
    pub term: u64,
    pub offset: u64,
}

impl EntryId {
    /// The "no entry" sentinel.
    pub const ZERO: EntryId = EntryId { term: 0, offset: 0 };

    pub const fn new(term: u64, offset: u64) -> Self {
        Self { term, offset }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.term, self.offset)
    }
}

/// One immutable log record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub entry_id: EntryId,
    pub timestamp_ms: u64,
    pub value: Vec<u8>,
}

/// Durable append-only log for one shard replica.
///
/// Implementations must persist an entry before `append` returns. The
/// replication engine is the only writer; the retention trimmer is the only
/// other caller, and it only reads and trims.
pub trait Wal: Send + Sync + 'static {
    /// Append `entry` at the tail and return its offset.
    fn append(&self, entry: LogEntry) -> anyhow::Result<u64>;

    /// Entry at `offset`, or `None` when outside the retained range.
    fn read(&self, offset: u64) -> anyhow::Result<Option<LogEntry>>;

    /// All entries at `offset` and above, in offset order.
    fn read_from(&self, offset: u64) -> anyhow::Result<Vec<LogEntry>>;

    /// Remove entries with id strictly greater than `id` and return the new
    /// head id (`EntryId::ZERO` when the log becomes empty).
    fn truncate_to(&self, id: EntryId) -> anyhow::Result<EntryId>;

    /// Discard the prefix up to and including `offset`.
    fn trim(&self, offset: u64) -> anyhow::Result<()>;

    /// Offset of the oldest retained entry.
    fn first_offset(&self) -> Option<u64>;

    /// Offset of the newest entry.
    fn last_offset(&self) -> Option<u64>;

    /// Greatest entry id present, or `EntryId::ZERO` when empty.
    fn head_entry_id(&self) -> EntryId;

    /// Replace the whole log with `entries` (snapshot install).
    fn reset(&self, entries: Vec<LogEntry>) -> anyhow::Result<()>;
}

/// In-memory `Wal` used by tests and embedded deployments.
#[derive(Default)]
pub struct MemoryWal {
    inner: Mutex<VecDeque<LogEntry>>,
}

impl MemoryWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("wal lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every retained entry, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.inner
            .lock()
            .expect("wal lock poisoned")
            .iter()
            .cloned()
            .collect()
    }
}

fn check_contiguous(entries: &VecDeque<LogEntry>) -> anyhow::Result<()> {
    for pair in entries.iter().zip(entries.iter().skip(1)) {
        let (prev, next) = (pair.0.entry_id, pair.1.entry_id);
        if next.offset != prev.offset + 1 || next <= prev {
            bail!("log not contiguous: {prev} followed by {next}");
        }
    }
    Ok(())
}

impl Wal for MemoryWal {
    fn append(&self, entry: LogEntry) -> anyhow::Result<u64> {
        let mut entries = self.inner.lock().expect("wal lock poisoned");
        if let Some(last) = entries.back() {
            let head = last.entry_id;
            let id = entry.entry_id;
            if id.offset != head.offset + 1 {
                bail!("append at offset {} after head {head}", id.offset);
            }
            if id <= head {
                bail!("append of {id} does not advance head {head}");
            }
        }
        let offset = entry.entry_id.offset;
        entries.push_back(entry);
        Ok(offset)
    }

    fn read(&self, offset: u64) -> anyhow::Result<Option<LogEntry>> {
        let entries = self.inner.lock().expect("wal lock poisoned");
        let Some(first) = entries.front().map(|e| e.entry_id.offset) else {
            return Ok(None);
        };
        if offset < first {
            return Ok(None);
        }
        Ok(entries.get((offset - first) as usize).cloned())
    }

    fn read_from(&self, offset: u64) -> anyhow::Result<Vec<LogEntry>> {
        let entries = self.inner.lock().expect("wal lock poisoned");
        let Some(first) = entries.front().map(|e| e.entry_id.offset) else {
            return Ok(Vec::new());
        };
        let skip = offset.saturating_sub(first) as usize;
        Ok(entries.iter().skip(skip).cloned().collect())
    }

    fn truncate_to(&self, id: EntryId) -> anyhow::Result<EntryId> {
        let mut entries = self.inner.lock().expect("wal lock poisoned");
        while let Some(last) = entries.back() {
            if last.entry_id > id {
                entries.pop_back();
            } else {
                break;
            }
        }
        Ok(entries.back().map(|e| e.entry_id).unwrap_or(EntryId::ZERO))
    }

    fn trim(&self, offset: u64) -> anyhow::Result<()> {
        let mut entries = self.inner.lock().expect("wal lock poisoned");
        while let Some(first) = entries.front() {
            if first.entry_id.offset <= offset {
                entries.pop_front();
            } else {
                break;
            }
        }
        Ok(())
    }

    fn first_offset(&self) -> Option<u64> {
        self.inner
            .lock()
            .expect("wal lock poisoned")
            .front()
            .map(|e| e.entry_id.offset)
    }

    fn last_offset(&self) -> Option<u64> {
        self.inner
            .lock()
            .expect("wal lock poisoned")
            .back()
            .map(|e| e.entry_id.offset)
    }

    fn head_entry_id(&self) -> EntryId {
        self.inner
            .lock()
            .expect("wal lock poisoned")
            .back()
            .map(|e| e.entry_id)
            .unwrap_or(EntryId::ZERO)
    }

    fn reset(&self, new_entries: Vec<LogEntry>) -> anyhow::Result<()> {
        let replacement: VecDeque<LogEntry> = new_entries.into();
        check_contiguous(&replacement).context("snapshot install rejected")?;
        let mut entries = self.inner.lock().expect("wal lock poisoned");
        *entries = replacement;
        Ok(())
    }
}
