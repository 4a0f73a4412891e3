//! Age-based WAL retention.
//!
//! A trimmer periodically drops the log prefix whose entries are older than
//! the configured retention. The newest expired entry is located by binary
//! search over the timestamps embedded in the entries; timestamps are
//! non-decreasing in offset for entries produced by a single leader, and
//! weakly monotonic across leader changes, which is enough for the search to
//! return a defensible bound on the expired prefix.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::oneshot;

use crate::clock::Clock;
use crate::log::Wal;

pub const DEFAULT_RETENTION: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Retention settings for one shard WAL.
#[derive(Clone, Copy, Debug)]
pub struct TrimmerOptions {
    /// How long entries are retained. Zero applies the default.
    pub retention: Duration,
    /// How often expiry is evaluated.
    pub check_interval: Duration,
}

impl Default for TrimmerOptions {
    fn default() -> Self {
        Self {
            retention: DEFAULT_RETENTION,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// Handle for a running retention task. Dropping the handle without calling
/// [`Trimmer::close`] aborts the task.
pub struct Trimmer {
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: tokio::task::JoinHandle<()>,
}

impl Trimmer {
    /// Spawn the retention task for `wal`.
    pub fn spawn(
        shard: u64,
        wal: Arc<dyn Wal>,
        clock: Arc<dyn Clock>,
        options: TrimmerOptions,
    ) -> Trimmer {
        let retention = if options.retention.is_zero() {
            DEFAULT_RETENTION
        } else {
            options.retention
        };
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(options.check_interval);
            // The first tick of a tokio interval fires immediately; skip it so
            // freshly appended entries are not evaluated at startup.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = trim_once(wal.as_ref(), clock.as_ref(), retention) {
                            tracing::warn!(error = ?err, shard, "failed to trim the wal");
                        }
                    }
                    _ = &mut shutdown_rx => return,
                }
            }
        });

        Trimmer {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Stop the retention task and wait for it to exit.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
    }
}

impl Drop for Trimmer {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some() {
            self.task.abort();
        }
    }
}

/// Evaluate retention once and trim any expired prefix.
fn trim_once(wal: &dyn Wal, clock: &dyn Clock, retention: Duration) -> anyhow::Result<()> {
    let (Some(first), Some(last)) = (wal.first_offset(), wal.last_offset()) else {
        return Ok(());
    };

    let cutoff = clock
        .now_millis()
        .saturating_sub(retention.as_millis().min(u128::from(u64::MAX)) as u64);

    // If the oldest entry has not expired there is nothing to do.
    if timestamp_at(wal, first)? > cutoff {
        return Ok(());
    }

    let trim_offset =
        newest_expired_offset(wal, first, last, cutoff).context("failed to perform binary search")?;
    wal.trim(trim_offset).context("failed to trim wal")?;

    tracing::debug!(
        trimmed_offset = trim_offset,
        first_offset = ?wal.first_offset(),
        last_offset = ?wal.last_offset(),
        "trimmed the wal"
    );
    Ok(())
}

/// Binary search, in offset space, for the largest offset whose entry
/// timestamp is at or before `cutoff`. The caller has already checked that
/// the entry at `first` is expired.
fn newest_expired_offset(
    wal: &dyn Wal,
    mut first: u64,
    mut last: u64,
    cutoff: u64,
) -> anyhow::Result<u64> {
    while first < last {
        // Take the ceiling so adjacent offsets cannot loop forever.
        let mid = (first + last + 1) / 2;
        if timestamp_at(wal, mid)? > cutoff {
            last = mid - 1;
        } else {
            first = mid;
        }
    }
    Ok(first)
}

fn timestamp_at(wal: &dyn Wal, offset: u64) -> anyhow::Result<u64> {
    let entry = wal
        .read(offset)?
        .with_context(|| format!("missing wal entry at offset {offset}"))?;
    Ok(entry.timestamp_ms)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use super::*;
    use crate::log::{EntryId, LogEntry, MemoryWal};

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn new(now: u64) -> Self {
            Self(AtomicU64::new(now))
        }

        fn advance(&self, millis: u64) {
            self.0.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn wal_with(timestamps: &[u64]) -> MemoryWal {
        let wal = MemoryWal::new();
        for (i, ts) in timestamps.iter().enumerate() {
            wal.append(LogEntry {
                entry_id: EntryId::new(1, i as u64 + 1),
                timestamp_ms: *ts,
                value: Vec::new(),
            })
            .unwrap();
        }
        wal
    }

    #[test]
    fn empty_log_is_a_no_op() {
        let wal = MemoryWal::new();
        let clock = ManualClock::new(1_000_000);
        trim_once(&wal, &clock, Duration::from_secs(1)).unwrap();
        assert!(wal.is_empty());
    }

    #[test]
    fn unexpired_head_short_circuits() {
        let wal = wal_with(&[900, 950, 990]);
        let clock = ManualClock::new(1_000);
        trim_once(&wal, &clock, Duration::from_millis(500)).unwrap();
        assert_eq!(wal.first_offset(), Some(1));
    }

    #[test]
    fn trims_exactly_the_expired_prefix() {
        let wal = wal_with(&[100, 200, 300, 400, 500]);
        let clock = ManualClock::new(1_000);
        // Cutoff at 350: offsets 1..=3 expired.
        trim_once(&wal, &clock, Duration::from_millis(650)).unwrap();
        assert_eq!(wal.first_offset(), Some(4));
        assert_eq!(wal.last_offset(), Some(5));
    }

    #[test]
    fn trims_whole_log_when_everything_expired() {
        let wal = wal_with(&[100, 200, 300]);
        let clock = ManualClock::new(10_000);
        trim_once(&wal, &clock, Duration::from_millis(500)).unwrap();
        assert!(wal.is_empty());
    }

    #[test]
    fn single_entry_log() {
        let wal = wal_with(&[100]);
        let clock = ManualClock::new(1_000);
        trim_once(&wal, &clock, Duration::from_millis(500)).unwrap();
        assert!(wal.is_empty());

        let wal = wal_with(&[900]);
        trim_once(&wal, &clock, Duration::from_millis(500)).unwrap();
        assert_eq!(wal.first_offset(), Some(1));
    }

    #[test]
    fn repeated_evaluation_follows_the_clock() {
        let wal = wal_with(&[100, 200, 300]);
        let clock = ManualClock::new(550);
        let retention = Duration::from_millis(300);

        // Cutoff 250: first two entries expired.
        trim_once(&wal, &clock, retention).unwrap();
        assert_eq!(wal.first_offset(), Some(3));

        clock.advance(100);
        trim_once(&wal, &clock, retention).unwrap();
        assert!(wal.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn trimmer_task_runs_on_the_check_interval() {
        let wal = Arc::new(wal_with(&[100, 200]));
        let clock = Arc::new(ManualClock::new(10_000));
        let trimmer = Trimmer::spawn(
            1,
            wal.clone(),
            clock,
            TrimmerOptions {
                retention: Duration::from_millis(500),
                check_interval: Duration::from_secs(60),
            },
        );

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(wal.is_empty());
        trimmer.close().await;
    }
}
