//! In-memory state for a single shard replica.
//!
//! This module holds the replica's protocol state and the cursor/commit
//! arithmetic. It is kept separate from the event loop so that quorum and
//! commit decisions stay testable as ordinary sequential code.

use std::collections::BTreeMap;

use braid_wal::EntryId;
use tokio::sync::oneshot;

use crate::types::{CursorStatus, NodeId, ReplicaStatus, ShardId};

/// Leader-side record tracking one follower's replication progress.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cursor {
    pub(crate) status: CursorStatus,
    /// Highest entry handed to the follower's send pipeline.
    pub(crate) last_pushed: EntryId,
    /// Highest entry the follower has acknowledged.
    pub(crate) last_confirmed: EntryId,
}

impl Cursor {
    pub(crate) fn attached(at: EntryId) -> Cursor {
        Cursor {
            status: CursorStatus::Attached,
            last_pushed: at,
            last_confirmed: at,
        }
    }

    pub(crate) fn pending_truncate() -> Cursor {
        Cursor {
            status: CursorStatus::PendingTruncate,
            last_pushed: EntryId::ZERO,
            last_confirmed: EntryId::ZERO,
        }
    }
}

/// Mutable protocol state owned by the replica's event loop.
pub(crate) struct ReplicaState {
    pub(crate) shard: ShardId,
    pub(crate) node_id: NodeId,
    pub(crate) status: ReplicaStatus,
    pub(crate) term: u64,
    pub(crate) leader: Option<NodeId>,
    pub(crate) rep_factor: u32,
    pub(crate) head_index: EntryId,
    pub(crate) commit_index: EntryId,
    pub(crate) cursors: BTreeMap<NodeId, Cursor>,
    pub(crate) reconfig_in_progress: bool,
    /// Client writes awaiting commit, keyed by the entry they produced.
    pub(crate) write_waiters: BTreeMap<EntryId, oneshot::Sender<anyhow::Result<EntryId>>>,
}

impl ReplicaState {
    pub(crate) fn new(shard: ShardId, node_id: NodeId) -> ReplicaState {
        ReplicaState {
            shard,
            node_id,
            status: ReplicaStatus::NotMember,
            term: 0,
            leader: None,
            rep_factor: 0,
            head_index: EntryId::ZERO,
            commit_index: EntryId::ZERO,
            cursors: BTreeMap::new(),
            reconfig_in_progress: false,
            write_waiters: BTreeMap::new(),
        }
    }

    /// Advance the commit index from current cursor state. Commits never
    /// regress, and only an entry of the current term can be committed
    /// directly; older entries commit transitively underneath it.
    ///
    /// Returns true when the commit index moved.
    pub(crate) fn advance_commit_index(&mut self) -> bool {
        let candidate = quorum_confirmed_index(&self.cursors, self.rep_factor, self.head_index);
        if candidate.term == self.term && candidate > self.commit_index {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    /// Resolve every pending write at or below the commit index.
    pub(crate) fn resolve_committed_writes(&mut self) {
        while let Some((id, waiter)) = self.write_waiters.pop_first() {
            if id > self.commit_index {
                self.write_waiters.insert(id, waiter);
                break;
            }
            let _ = waiter.send(Ok(id));
        }
    }

    /// Fail every pending write. Used when leadership is lost: the entries
    /// may still commit under a later leader, so callers see an unknown
    /// outcome, not a definite loss.
    pub(crate) fn fail_pending_writes(&mut self, reason: &str) {
        for (_, waiter) in std::mem::take(&mut self.write_waiters) {
            let _ = waiter.send(Err(anyhow::anyhow!("{reason}")));
        }
    }
}

/// Greatest entry id acknowledged by enough attached cursors for quorum.
///
/// The threshold is `rep_factor / 2` follower acknowledgements: the leader
/// holds every entry it pushed, so together they form a majority of the
/// ensemble. Cursors that are pending truncation or removal do not count.
pub(crate) fn quorum_confirmed_index(
    cursors: &BTreeMap<NodeId, Cursor>,
    rep_factor: u32,
    head_index: EntryId,
) -> EntryId {
    let needed = (rep_factor / 2) as usize;
    if needed == 0 {
        // Single-replica ensemble: the leader's own log is the quorum.
        return head_index;
    }
    let mut confirmed: Vec<EntryId> = cursors
        .values()
        .filter(|c| c.status == CursorStatus::Attached)
        .map(|c| c.last_confirmed)
        .collect();
    if confirmed.len() < needed {
        return EntryId::ZERO;
    }
    confirmed.sort_unstable_by(|a, b| b.cmp(a));
    confirmed[needed - 1].min(head_index)
}

/// Whether removing `old_node`'s cursor keeps the committed prefix covered
/// by a quorum at the contracted replication factor.
pub(crate) fn contract_keeps_commit(
    cursors: &BTreeMap<NodeId, Cursor>,
    old_node: NodeId,
    new_rep_factor: u32,
    head_index: EntryId,
    commit_index: EntryId,
) -> bool {
    let mut remaining = cursors.clone();
    remaining.remove(&old_node);
    quorum_confirmed_index(&remaining, new_rep_factor, head_index) >= commit_index
}
