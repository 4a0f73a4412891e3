//! Storage-node state machine for one shard replica.
//!
//! Every protocol event for a replica flows through a single mailbox task,
//! so the handlers below run as ordinary sequential code. Client writes are
//! injected into the same mailbox as coordinator commands and peer
//! replication traffic. Sends to peers go through one pipeline task per
//! follower, which keeps per-peer deliveries ordered and keeps a slow peer
//! from ever blocking the event loop.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use braid_wal::{Clock, EntryId, LogEntry, Wal};
use tokio::sync::{mpsc, oneshot};

use crate::state::{contract_keeps_commit, Cursor, ReplicaState};
use crate::types::{
    AddEntryCode, AddEntryRequest, AddEntryResponse, AddFollowerRequest, BecomeLeaderRequest,
    BecomeLeaderResponse, CommitReconfigRequest, CommitReconfigResponse, CursorStatus,
    NewTermRequest, NewTermResponse, NodeId, PrepareReconfigRequest, PrepareReconfigResponse,
    ReconfigOp, ReplicaOptions, ReplicaSnapshot, ReplicaStatus, ShardId, SnapshotRequest,
    SnapshotResponse, Transport, TruncateRequest, TruncateResponse,
};

/// Point-in-time view of a replica, for observability and tests.
#[derive(Clone, Debug)]
pub struct ReplicaInfo {
    pub shard: ShardId,
    pub node_id: NodeId,
    pub status: ReplicaStatus,
    pub term: u64,
    pub leader: Option<NodeId>,
    pub rep_factor: u32,
    pub head_index: EntryId,
    pub commit_index: EntryId,
    pub reconfig_in_progress: bool,
    pub cursors: BTreeMap<NodeId, CursorInfo>,
}

/// Cursor view exposed through [`ReplicaInfo`].
#[derive(Clone, Copy, Debug)]
pub struct CursorInfo {
    pub status: CursorStatus,
    pub last_pushed: EntryId,
    pub last_confirmed: EntryId,
}

enum Event {
    NewTerm {
        request: NewTermRequest,
        reply: oneshot::Sender<NewTermResponse>,
    },
    BecomeLeader {
        request: BecomeLeaderRequest,
        reply: oneshot::Sender<BecomeLeaderResponse>,
    },
    AddFollower {
        request: AddFollowerRequest,
    },
    Truncate {
        request: TruncateRequest,
        reply: oneshot::Sender<TruncateResponse>,
    },
    AddEntry {
        request: AddEntryRequest,
        reply: oneshot::Sender<AddEntryResponse>,
    },
    Snapshot {
        request: SnapshotRequest,
        reply: oneshot::Sender<SnapshotResponse>,
    },
    PrepareReconfig {
        request: PrepareReconfigRequest,
        reply: oneshot::Sender<PrepareReconfigResponse>,
    },
    CommitReconfig {
        request: CommitReconfigRequest,
        reply: oneshot::Sender<CommitReconfigResponse>,
    },
    Write {
        value: Vec<u8>,
        reply: oneshot::Sender<anyhow::Result<EntryId>>,
    },
    TruncateAcked {
        follower: NodeId,
        response: TruncateResponse,
    },
    EntryAcked {
        follower: NodeId,
        response: AddEntryResponse,
    },
    Inspect {
        reply: oneshot::Sender<ReplicaInfo>,
    },
}

/// Spawns shard replicas.
pub struct Replica;

impl Replica {
    /// Spawn the event loop for one shard replica and return its handle.
    pub fn spawn(
        shard: ShardId,
        node_id: NodeId,
        wal: Arc<dyn Wal>,
        clock: Arc<dyn Clock>,
        transport: Arc<dyn Transport>,
        options: ReplicaOptions,
    ) -> ReplicaHandle {
        let (events_tx, events_rx) = mpsc::channel(options.mailbox_capacity);
        // A restarted replica recovers its head from the log it owns; the
        // term and status are re-learned from the next fencing round.
        let mut state = ReplicaState::new(shard, node_id);
        state.head_index = wal.head_entry_id();
        let worker = ReplicaWorker {
            state,
            wal,
            clock,
            transport,
            options,
            senders: HashMap::new(),
            events: events_tx.downgrade(),
        };
        tokio::spawn(worker.run(events_rx));
        ReplicaHandle {
            shard,
            node_id,
            write_timeout: options.write_timeout,
            events: events_tx,
        }
    }
}

/// Handle for submitting protocol events to a shard replica.
///
/// Request methods resolve with the replica's response, or with an error
/// when the replica ignored the request (stale term, wrong status) or has
/// stopped. Callers treat an error as "no response" and retry if they need
/// an answer.
#[derive(Clone)]
pub struct ReplicaHandle {
    shard: ShardId,
    node_id: NodeId,
    write_timeout: Duration,
    events: mpsc::Sender<Event>,
}

impl ReplicaHandle {
    pub fn shard(&self) -> ShardId {
        self.shard
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> Event,
    ) -> anyhow::Result<R> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(build(reply))
            .await
            .map_err(|_| anyhow!("shard replica stopped"))?;
        rx.await.map_err(|_| anyhow!("request not accepted"))
    }

    pub async fn new_term(&self, request: NewTermRequest) -> anyhow::Result<NewTermResponse> {
        self.request(|reply| Event::NewTerm { request, reply }).await
    }

    pub async fn become_leader(
        &self,
        request: BecomeLeaderRequest,
    ) -> anyhow::Result<BecomeLeaderResponse> {
        self.request(|reply| Event::BecomeLeader { request, reply })
            .await
    }

    pub async fn add_follower(&self, request: AddFollowerRequest) -> anyhow::Result<()> {
        self.events
            .send(Event::AddFollower { request })
            .await
            .map_err(|_| anyhow!("shard replica stopped"))
    }

    pub async fn truncate(&self, request: TruncateRequest) -> anyhow::Result<TruncateResponse> {
        self.request(|reply| Event::Truncate { request, reply })
            .await
    }

    pub async fn add_entry(&self, request: AddEntryRequest) -> anyhow::Result<AddEntryResponse> {
        self.request(|reply| Event::AddEntry { request, reply })
            .await
    }

    pub async fn install_snapshot(
        &self,
        request: SnapshotRequest,
    ) -> anyhow::Result<SnapshotResponse> {
        self.request(|reply| Event::Snapshot { request, reply })
            .await
    }

    pub async fn prepare_reconfig(
        &self,
        request: PrepareReconfigRequest,
    ) -> anyhow::Result<PrepareReconfigResponse> {
        self.request(|reply| Event::PrepareReconfig { request, reply })
            .await
    }

    pub async fn commit_reconfig(
        &self,
        request: CommitReconfigRequest,
    ) -> anyhow::Result<CommitReconfigResponse> {
        self.request(|reply| Event::CommitReconfig { request, reply })
            .await
    }

    /// Submit a value to the shard. Resolves once the entry is committed.
    ///
    /// A timeout or a leadership change resolves the write as an error with
    /// an unknown outcome: the entry may still commit later.
    pub async fn write(&self, value: Vec<u8>) -> anyhow::Result<EntryId> {
        let (reply, rx) = oneshot::channel();
        self.events
            .send(Event::Write { value, reply })
            .await
            .map_err(|_| anyhow!("shard replica stopped"))?;
        match tokio::time::timeout(self.write_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(anyhow!("write dropped; outcome unknown")),
            Err(_) => Err(anyhow!(
                "write timed out after {:?}; outcome unknown",
                self.write_timeout
            )),
        }
    }

    /// Snapshot the replica's protocol state.
    pub async fn info(&self) -> anyhow::Result<ReplicaInfo> {
        self.request(|reply| Event::Inspect { reply }).await
    }
}

enum PeerCommand {
    Truncate(TruncateRequest),
    Entry(AddEntryRequest),
}

/// Outbound pipeline toward one follower: one request in flight at a time,
/// retried until a response arrives, responses fed back into the replica
/// mailbox. Dropping the pipeline aborts it.
struct PeerSender {
    commands: mpsc::UnboundedSender<PeerCommand>,
    task: tokio::task::JoinHandle<()>,
}

impl Drop for PeerSender {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn spawn_peer_sender(
    transport: Arc<dyn Transport>,
    follower: NodeId,
    events: mpsc::Sender<Event>,
    retry_interval: Duration,
) -> PeerSender {
    let (commands, mut rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            match command {
                PeerCommand::Truncate(request) => {
                    let response = loop {
                        match transport.truncate(follower, request.clone()).await {
                            Ok(response) => break response,
                            Err(err) => {
                                tracing::debug!(
                                    error = ?err,
                                    follower,
                                    "truncate delivery failed; retrying"
                                );
                                tokio::time::sleep(retry_interval).await;
                            }
                        }
                    };
                    if events
                        .send(Event::TruncateAcked { follower, response })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
                PeerCommand::Entry(request) => {
                    let response = loop {
                        match transport.add_entry(follower, request.clone()).await {
                            Ok(response) => break response,
                            Err(err) => {
                                tracing::debug!(
                                    error = ?err,
                                    follower,
                                    entry = %request.entry.entry_id,
                                    "append delivery failed; retrying"
                                );
                                tokio::time::sleep(retry_interval).await;
                            }
                        }
                    };
                    if events
                        .send(Event::EntryAcked { follower, response })
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            }
        }
    });
    PeerSender { commands, task }
}

struct ReplicaWorker {
    state: ReplicaState,
    wal: Arc<dyn Wal>,
    clock: Arc<dyn Clock>,
    transport: Arc<dyn Transport>,
    options: ReplicaOptions,
    senders: HashMap<NodeId, PeerSender>,
    events: mpsc::WeakSender<Event>,
}

impl ReplicaWorker {
    async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            if let Err(err) = self.handle_event(event) {
                // Unexpected conditions terminate the replica; recovery is
                // a restart plus an election.
                tracing::error!(
                    error = ?err,
                    shard = self.state.shard,
                    node = self.state.node_id,
                    "shard replica terminating"
                );
                break;
            }
        }
        self.state.fail_pending_writes("shard replica stopped");
    }

    fn handle_event(&mut self, event: Event) -> anyhow::Result<()> {
        match event {
            Event::NewTerm { request, reply } => self.handle_new_term(request, reply),
            Event::BecomeLeader { request, reply } => self.handle_become_leader(request, reply),
            Event::AddFollower { request } => self.handle_add_follower(request),
            Event::Truncate { request, reply } => self.handle_truncate(request, reply),
            Event::AddEntry { request, reply } => self.handle_add_entry(request, reply),
            Event::Snapshot { request, reply } => self.handle_snapshot(request, reply),
            Event::PrepareReconfig { request, reply } => {
                self.handle_prepare_reconfig(request, reply)
            }
            Event::CommitReconfig { request, reply } => {
                self.handle_commit_reconfig(request, reply)
            }
            Event::Write { value, reply } => self.handle_write(value, reply),
            Event::TruncateAcked { follower, response } => {
                self.handle_truncate_acked(follower, response)
            }
            Event::EntryAcked { follower, response } => {
                self.handle_entry_acked(follower, response)
            }
            Event::Inspect { reply } => {
                let _ = reply.send(self.info());
                Ok(())
            }
        }
    }

    fn info(&self) -> ReplicaInfo {
        ReplicaInfo {
            shard: self.state.shard,
            node_id: self.state.node_id,
            status: self.state.status,
            term: self.state.term,
            leader: self.state.leader,
            rep_factor: self.state.rep_factor,
            head_index: self.state.head_index,
            commit_index: self.state.commit_index,
            reconfig_in_progress: self.state.reconfig_in_progress,
            cursors: self
                .state
                .cursors
                .iter()
                .map(|(node, cursor)| {
                    (
                        *node,
                        CursorInfo {
                            status: cursor.status,
                            last_pushed: cursor.last_pushed,
                            last_confirmed: cursor.last_confirmed,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Drop all replication machinery and fail pending writes. Used on
    /// fencing, abdication, and snapshot install.
    fn clear_replication(&mut self, reason: &str) {
        self.state.cursors.clear();
        self.senders.clear();
        self.state.reconfig_in_progress = false;
        self.state.fail_pending_writes(reason);
    }

    fn handle_new_term(
        &mut self,
        request: NewTermRequest,
        reply: oneshot::Sender<NewTermResponse>,
    ) -> anyhow::Result<()> {
        if request.term < self.state.term {
            tracing::debug!(
                shard = self.state.shard,
                node = self.state.node_id,
                term = self.state.term,
                request_term = request.term,
                "ignoring stale fencing request"
            );
            return Ok(());
        }
        // A duplicate at the current term is only re-answered while still
        // fenced; once this node is leader or follower for the term, the
        // retry is from a round that already completed.
        if request.term == self.state.term && self.state.status != ReplicaStatus::Fenced {
            return Ok(());
        }

        self.state.term = request.term;
        self.state.status = ReplicaStatus::Fenced;
        self.state.leader = None;
        self.clear_replication("fenced by a new term");

        tracing::info!(
            shard = self.state.shard,
            node = self.state.node_id,
            term = request.term,
            operator = request.operator_id,
            head = %self.state.head_index,
            "fenced"
        );
        let _ = reply.send(NewTermResponse {
            term: request.term,
            head_index: self.state.head_index,
        });
        Ok(())
    }

    fn handle_become_leader(
        &mut self,
        request: BecomeLeaderRequest,
        reply: oneshot::Sender<BecomeLeaderResponse>,
    ) -> anyhow::Result<()> {
        if request.term != self.state.term {
            return Ok(());
        }
        match self.state.status {
            ReplicaStatus::Leader => {
                // Duplicate promotion; cursors are already live.
                let _ = reply.send(BecomeLeaderResponse { term: request.term });
                return Ok(());
            }
            ReplicaStatus::Fenced => {}
            _ => return Ok(()),
        }

        self.state.status = ReplicaStatus::Leader;
        self.state.leader = Some(self.state.node_id);
        self.state.rep_factor = request.rep_factor;
        for (follower, head) in &request.follower_map {
            if *follower == self.state.node_id {
                continue;
            }
            self.install_cursor(*follower, *head)?;
        }
        tracing::info!(
            shard = self.state.shard,
            node = self.state.node_id,
            term = request.term,
            rep_factor = request.rep_factor,
            followers = request.follower_map.len(),
            "became leader"
        );
        let _ = reply.send(BecomeLeaderResponse { term: request.term });
        if self.state.advance_commit_index() {
            self.state.resolve_committed_writes();
        }
        Ok(())
    }

    fn handle_add_follower(&mut self, request: AddFollowerRequest) -> anyhow::Result<()> {
        if request.term != self.state.term
            || self.state.status != ReplicaStatus::Leader
            || request.follower == self.state.node_id
            || self.state.cursors.contains_key(&request.follower)
        {
            return Ok(());
        }
        tracing::info!(
            shard = self.state.shard,
            term = self.state.term,
            follower = request.follower,
            head = %request.follower_head_index,
            "attaching late follower"
        );
        self.install_cursor(request.follower, request.follower_head_index)
    }

    /// Set up the cursor for `follower`, whose head was `follower_head` when
    /// it was fenced. A follower whose head lies on this leader's log is
    /// attached directly; anything else must truncate first.
    fn install_cursor(&mut self, follower: NodeId, follower_head: EntryId) -> anyhow::Result<()> {
        let head = self.state.head_index;
        let matches_log = follower_head.is_zero()
            || (follower_head.term == head.term && follower_head.offset <= head.offset);
        if matches_log {
            self.state
                .cursors
                .insert(follower, Cursor::attached(follower_head));
            self.ensure_sender(follower)?;
            self.send_pending_entries(follower)
        } else {
            let safe_point = self.latest_entry_at_or_below_term(follower_head.term)?;
            self.state
                .cursors
                .insert(follower, Cursor::pending_truncate());
            self.ensure_sender(follower)?;
            let request = TruncateRequest {
                shard: self.state.shard,
                term: self.state.term,
                leader: self.state.node_id,
                head_index: safe_point,
            };
            if let Some(sender) = self.senders.get(&follower) {
                let _ = sender.commands.send(PeerCommand::Truncate(request));
            }
            Ok(())
        }
    }

    /// Greatest entry id in the local log with term at or below `term`.
    /// Entry terms are non-decreasing in offset, so the scan walks back from
    /// the tail.
    fn latest_entry_at_or_below_term(&self, term: u64) -> anyhow::Result<EntryId> {
        let (Some(first), Some(last)) = (self.wal.first_offset(), self.wal.last_offset()) else {
            return Ok(EntryId::ZERO);
        };
        let mut offset = last;
        loop {
            let Some(entry) = self.wal.read(offset)? else {
                break;
            };
            if entry.entry_id.term <= term {
                return Ok(entry.entry_id);
            }
            if offset == first {
                break;
            }
            offset -= 1;
        }
        Ok(EntryId::ZERO)
    }

    fn ensure_sender(&mut self, follower: NodeId) -> anyhow::Result<()> {
        if self.senders.contains_key(&follower) {
            return Ok(());
        }
        let events = self
            .events
            .upgrade()
            .context("replica mailbox closed")?;
        let sender = spawn_peer_sender(
            self.transport.clone(),
            follower,
            events,
            self.options.send_retry_interval,
        );
        self.senders.insert(follower, sender);
        Ok(())
    }

    /// Queue every entry above the cursor's push point into the follower's
    /// pipeline. `last_pushed` advances at enqueue time; the pipeline task
    /// owns delivery.
    fn send_pending_entries(&mut self, follower: NodeId) -> anyhow::Result<()> {
        let head = self.state.head_index;
        let commit = self.state.commit_index;
        let shard = self.state.shard;
        let term = self.state.term;
        let leader = self.state.node_id;
        let Some(cursor) = self.state.cursors.get_mut(&follower) else {
            return Ok(());
        };
        if cursor.status != CursorStatus::Attached {
            return Ok(());
        }
        while cursor.last_pushed < head {
            let next_offset = if cursor.last_pushed.is_zero() {
                match self.wal.first_offset() {
                    Some(first) => first,
                    None => break,
                }
            } else {
                cursor.last_pushed.offset + 1
            };
            let Some(entry) = self.wal.read(next_offset)? else {
                break;
            };
            cursor.last_pushed = entry.entry_id;
            let request = AddEntryRequest {
                shard,
                term,
                leader,
                entry,
                commit_index: commit,
            };
            let Some(sender) = self.senders.get(&follower) else {
                break;
            };
            if sender.commands.send(PeerCommand::Entry(request)).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn handle_truncate(
        &mut self,
        request: TruncateRequest,
        reply: oneshot::Sender<TruncateResponse>,
    ) -> anyhow::Result<()> {
        if request.term != self.state.term {
            return Ok(());
        }
        // Fenced is the normal case; Follower covers a redelivered request
        // whose first response was lost.
        if !matches!(
            self.state.status,
            ReplicaStatus::Fenced | ReplicaStatus::Follower
        ) {
            return Ok(());
        }

        let head = self.wal.truncate_to(request.head_index)?;
        self.state.head_index = head;
        self.state.status = ReplicaStatus::Follower;
        self.state.leader = Some(request.leader);
        tracing::info!(
            shard = self.state.shard,
            node = self.state.node_id,
            term = request.term,
            head = %head,
            "truncated log for leader"
        );
        let _ = reply.send(TruncateResponse {
            term: request.term,
            head_index: head,
        });
        Ok(())
    }

    fn handle_truncate_acked(
        &mut self,
        follower: NodeId,
        response: TruncateResponse,
    ) -> anyhow::Result<()> {
        // Acks carry the term the request was sent under, which can lag the
        // leader's term when a reconfiguration bumped it mid-reign. Acks
        // from an earlier reign cannot reach us: fencing drops the
        // pipelines that would deliver them.
        if self.state.status != ReplicaStatus::Leader || response.term > self.state.term {
            return Ok(());
        }
        let Some(cursor) = self.state.cursors.get_mut(&follower) else {
            return Ok(());
        };
        if cursor.status != CursorStatus::PendingTruncate {
            return Ok(());
        }
        *cursor = Cursor::attached(response.head_index);
        self.send_pending_entries(follower)?;
        if self.state.advance_commit_index() {
            self.state.resolve_committed_writes();
        }
        Ok(())
    }

    fn handle_write(
        &mut self,
        value: Vec<u8>,
        reply: oneshot::Sender<anyhow::Result<EntryId>>,
    ) -> anyhow::Result<()> {
        if self.state.status != ReplicaStatus::Leader {
            let _ = reply.send(Err(anyhow!(
                "node {} is not the leader of shard {}",
                self.state.node_id,
                self.state.shard
            )));
            return Ok(());
        }

        let entry_id = EntryId::new(self.state.term, self.state.head_index.offset + 1);
        let entry = LogEntry {
            entry_id,
            timestamp_ms: self.clock.now_millis(),
            value,
        };
        self.wal.append(entry).context("wal append failed")?;
        self.state.head_index = entry_id;
        self.state.write_waiters.insert(entry_id, reply);

        let followers: Vec<NodeId> = self
            .state
            .cursors
            .iter()
            .filter(|(_, c)| c.status == CursorStatus::Attached)
            .map(|(node, _)| *node)
            .collect();
        for follower in followers {
            self.send_pending_entries(follower)?;
        }
        if self.state.advance_commit_index() {
            self.state.resolve_committed_writes();
        }
        Ok(())
    }

    fn handle_add_entry(
        &mut self,
        request: AddEntryRequest,
        reply: oneshot::Sender<AddEntryResponse>,
    ) -> anyhow::Result<()> {
        if request.term < self.state.term {
            let _ = reply.send(AddEntryResponse {
                term: self.state.term,
                code: AddEntryCode::InvalidTerm,
                entry_id: request.entry.entry_id,
            });
            return Ok(());
        }
        if !matches!(
            self.state.status,
            ReplicaStatus::Fenced | ReplicaStatus::Follower
        ) {
            tracing::warn!(
                shard = self.state.shard,
                node = self.state.node_id,
                status = ?self.state.status,
                "ignoring append outside the follower path"
            );
            return Ok(());
        }

        // The leader's term can move ahead of ours without a fencing round
        // (reconfiguration bumps it on the data path); adopt it.
        self.state.term = request.term;
        self.state.status = ReplicaStatus::Follower;
        self.state.leader = Some(request.leader);

        let entry_id = request.entry.entry_id;
        let head = self.state.head_index;
        if entry_id.offset <= head.offset && !head.is_zero() {
            // Duplicate delivery: the entry must already be present and
            // identical, or already trimmed away.
            if let Some(existing) = self.wal.read(entry_id.offset)? {
                if existing.entry_id != entry_id {
                    bail!(
                        "divergent append {entry_id} over existing {}",
                        existing.entry_id
                    );
                }
            }
        } else if head.is_zero() || entry_id.offset == head.offset + 1 {
            self.wal.append(request.entry.clone())?;
            self.state.head_index = entry_id;
        } else {
            bail!("append gap: {entry_id} after head {head}");
        }

        let commit = self
            .state
            .commit_index
            .max(request.commit_index)
            .min(self.state.head_index);
        self.state.commit_index = commit;

        let _ = reply.send(AddEntryResponse {
            term: request.term,
            code: AddEntryCode::Ok,
            entry_id,
        });
        Ok(())
    }

    fn handle_entry_acked(
        &mut self,
        follower: NodeId,
        response: AddEntryResponse,
    ) -> anyhow::Result<()> {
        if response.code == AddEntryCode::InvalidTerm {
            if self.state.status == ReplicaStatus::Leader && response.term > self.state.term {
                tracing::warn!(
                    shard = self.state.shard,
                    node = self.state.node_id,
                    term = self.state.term,
                    follower,
                    follower_term = response.term,
                    "abdicating: follower is in a newer term"
                );
                self.state.status = ReplicaStatus::Fenced;
                self.state.leader = None;
                self.clear_replication("leadership lost to a newer term");
            }
            return Ok(());
        }

        // As with truncate acks, a confirmation from earlier in this reign
        // (before a reconfiguration bumped the term) still proves the
        // follower stored the entry.
        if self.state.status != ReplicaStatus::Leader || response.term > self.state.term {
            return Ok(());
        }
        let Some(cursor) = self.state.cursors.get_mut(&follower) else {
            return Ok(());
        };
        if cursor.status != CursorStatus::Attached {
            return Ok(());
        }
        if response.entry_id > cursor.last_confirmed {
            cursor.last_confirmed = response.entry_id;
        }
        if self.state.advance_commit_index() {
            self.state.resolve_committed_writes();
        }
        Ok(())
    }

    fn handle_snapshot(
        &mut self,
        request: SnapshotRequest,
        reply: oneshot::Sender<SnapshotResponse>,
    ) -> anyhow::Result<()> {
        if request.term < self.state.term {
            return Ok(());
        }
        if request.term == self.state.term && self.state.status != ReplicaStatus::Fenced {
            // Duplicate install after this node already joined the term; a
            // re-install could discard entries replicated since.
            let _ = reply.send(SnapshotResponse {
                term: self.state.term,
                head_index: self.state.head_index,
            });
            return Ok(());
        }

        self.wal
            .reset(request.snapshot.entries)
            .context("snapshot install failed")?;
        self.state.term = request.term;
        self.state.status = ReplicaStatus::Fenced;
        self.state.leader = None;
        self.clear_replication("reset by snapshot install");
        self.state.head_index = request.snapshot.head_index;
        self.state.commit_index = request.snapshot.commit_index;

        tracing::info!(
            shard = self.state.shard,
            node = self.state.node_id,
            term = request.term,
            head = %self.state.head_index,
            commit = %self.state.commit_index,
            operator = request.operator_id,
            "installed snapshot"
        );
        let _ = reply.send(SnapshotResponse {
            term: request.term,
            head_index: self.state.head_index,
        });
        Ok(())
    }

    fn handle_prepare_reconfig(
        &mut self,
        request: PrepareReconfigRequest,
        reply: oneshot::Sender<PrepareReconfigResponse>,
    ) -> anyhow::Result<()> {
        if matches!(request.op, ReconfigOp::NodeSwap | ReconfigOp::Contract)
            && request.old_node.is_none()
        {
            tracing::warn!(op = ?request.op, "rejecting reconfiguration without an outgoing node");
            return Ok(());
        }

        let duplicate = request.term == self.state.term
            && self.state.status == ReplicaStatus::Leader
            && self.state.reconfig_in_progress;
        if !duplicate {
            if request.term <= self.state.term
                || self.state.status != ReplicaStatus::Leader
                || self.state.reconfig_in_progress
            {
                return Ok(());
            }
            self.state.term = request.term;
            self.state.reconfig_in_progress = true;
            if let Some(old_node) = request.old_node {
                if matches!(request.op, ReconfigOp::NodeSwap | ReconfigOp::Contract) {
                    if let Some(cursor) = self.state.cursors.get_mut(&old_node) {
                        cursor.status = CursorStatus::PendingRemoval;
                    }
                    // Stop pushing to the outgoing node.
                    self.senders.remove(&old_node);
                }
            }
            tracing::info!(
                shard = self.state.shard,
                term = request.term,
                op = ?request.op,
                old_node = ?request.old_node,
                operator = request.operator_id,
                "prepared reconfiguration"
            );
        }

        let snapshot = match request.op {
            ReconfigOp::NodeSwap | ReconfigOp::Expand => {
                let first = self.wal.first_offset().unwrap_or(0);
                Some(ReplicaSnapshot {
                    entries: self.wal.read_from(first)?,
                    head_index: self.state.head_index,
                    commit_index: self.state.commit_index,
                })
            }
            ReconfigOp::Contract => None,
        };
        let _ = reply.send(PrepareReconfigResponse {
            op: request.op,
            term: request.term,
            snapshot,
        });
        Ok(())
    }

    fn handle_commit_reconfig(
        &mut self,
        request: CommitReconfigRequest,
        reply: oneshot::Sender<CommitReconfigResponse>,
    ) -> anyhow::Result<()> {
        if request.term != self.state.term || self.state.status != ReplicaStatus::Leader {
            return Ok(());
        }
        if !self.state.reconfig_in_progress {
            if self.commit_already_applied(&request) {
                let _ = reply.send(CommitReconfigResponse {
                    op: request.op,
                    term: request.term,
                    accepted: true,
                });
            }
            return Ok(());
        }

        let accepted = match request.op {
            ReconfigOp::NodeSwap => {
                let (Some(old_node), Some(new_node), Some(head)) =
                    (request.old_node, request.new_node, request.head_index)
                else {
                    tracing::warn!("rejecting malformed node-swap commit");
                    return Ok(());
                };
                if self.cursor_status(old_node) != Some(CursorStatus::PendingRemoval)
                    || self.state.cursors.contains_key(&new_node)
                {
                    return Ok(());
                }
                self.state.cursors.remove(&old_node);
                self.senders.remove(&old_node);
                self.attach_new_member(new_node, head, request.rep_factor)?;
                true
            }
            ReconfigOp::Expand => {
                let (Some(new_node), Some(head)) = (request.new_node, request.head_index) else {
                    tracing::warn!("rejecting malformed expand commit");
                    return Ok(());
                };
                if self.state.cursors.contains_key(&new_node) {
                    return Ok(());
                }
                self.attach_new_member(new_node, head, request.rep_factor)?;
                true
            }
            ReconfigOp::Contract => {
                let Some(old_node) = request.old_node else {
                    tracing::warn!("rejecting malformed contract commit");
                    return Ok(());
                };
                if self.cursor_status(old_node) != Some(CursorStatus::PendingRemoval) {
                    return Ok(());
                }
                if contract_keeps_commit(
                    &self.state.cursors,
                    old_node,
                    request.rep_factor,
                    self.state.head_index,
                    self.state.commit_index,
                ) {
                    self.state.cursors.remove(&old_node);
                    self.senders.remove(&old_node);
                    self.state.rep_factor = request.rep_factor;
                    self.state.reconfig_in_progress = false;
                    true
                } else {
                    tracing::info!(
                        shard = self.state.shard,
                        term = self.state.term,
                        old_node,
                        commit = %self.state.commit_index,
                        "deferring contract: committed prefix would lose quorum"
                    );
                    false
                }
            }
        };

        if accepted {
            if self.state.advance_commit_index() {
                self.state.resolve_committed_writes();
            }
            tracing::info!(
                shard = self.state.shard,
                term = self.state.term,
                op = ?request.op,
                rep_factor = self.state.rep_factor,
                "committed reconfiguration"
            );
        }
        let _ = reply.send(CommitReconfigResponse {
            op: request.op,
            term: request.term,
            accepted,
        });
        Ok(())
    }

    fn cursor_status(&self, node: NodeId) -> Option<CursorStatus> {
        self.state.cursors.get(&node).map(|c| c.status)
    }

    fn attach_new_member(
        &mut self,
        new_node: NodeId,
        head: EntryId,
        rep_factor: u32,
    ) -> anyhow::Result<()> {
        self.state.cursors.insert(new_node, Cursor::attached(head));
        self.state.rep_factor = rep_factor;
        self.state.reconfig_in_progress = false;
        self.ensure_sender(new_node)?;
        self.send_pending_entries(new_node)
    }

    /// Whether a duplicate commit request matches state this leader has
    /// already applied, so a lost response can be re-acknowledged.
    fn commit_already_applied(&self, request: &CommitReconfigRequest) -> bool {
        if self.state.rep_factor != request.rep_factor {
            return false;
        }
        let old_gone = request
            .old_node
            .map_or(true, |node| !self.state.cursors.contains_key(&node));
        let new_present = request
            .new_node
            .map_or(true, |node| self.state.cursors.contains_key(&node));
        old_gone && new_present
    }
}
