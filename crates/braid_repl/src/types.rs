//! Shared types for the replication engine.
//!
//! These are the wire message shapes exchanged between the coordinator and
//! storage nodes, the transport seam they travel through, and the tuning
//! knobs for the engine. Protocol outcomes are values on the response types,
//! never errors.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use braid_wal::{EntryId, LogEntry};
use serde::{Deserialize, Serialize};

/// Logical node identifier within a shard ensemble.
pub type NodeId = u64;
/// Logical shard identifier.
pub type ShardId = u64;

/// Ensemble change operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconfigOp {
    NodeSwap,
    Expand,
    Contract,
}

/// Lifecycle status of a shard replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicaStatus {
    NotMember,
    Fenced,
    Follower,
    Leader,
}

/// Leader-side cursor state for one follower. A follower with no cursor at
/// all is "not present".
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CursorStatus {
    PendingTruncate,
    Attached,
    PendingRemoval,
}

/// Fence a node into a new term.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTermRequest {
    pub shard: ShardId,
    pub operator_id: u64,
    pub term: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewTermResponse {
    pub term: u64,
    pub head_index: EntryId,
}

/// Promote a fenced node to leader with the head indexes its followers
/// reported while being fenced.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BecomeLeaderRequest {
    pub shard: ShardId,
    pub operator_id: u64,
    pub term: u64,
    pub rep_factor: u32,
    pub follower_map: BTreeMap<NodeId, EntryId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BecomeLeaderResponse {
    pub term: u64,
}

/// Hand a late fencing responder to the current leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddFollowerRequest {
    pub shard: ShardId,
    pub operator_id: u64,
    pub term: u64,
    pub follower: NodeId,
    pub follower_head_index: EntryId,
}

/// Ask a diverged follower to cut its log back to `head_index`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TruncateRequest {
    pub shard: ShardId,
    pub term: u64,
    pub leader: NodeId,
    pub head_index: EntryId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TruncateResponse {
    pub term: u64,
    pub head_index: EntryId,
}

/// Replicate one log entry to a follower. Deliveries toward a single peer
/// are issued one at a time, in offset order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddEntryRequest {
    pub shard: ShardId,
    pub term: u64,
    pub leader: NodeId,
    pub entry: LogEntry,
    pub commit_index: EntryId,
}

/// Outcome code of a follower append.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddEntryCode {
    Ok,
    InvalidTerm,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AddEntryResponse {
    pub term: u64,
    pub code: AddEntryCode,
    pub entry_id: EntryId,
}

/// Log contents shipped to a node that joins an ensemble.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub entries: Vec<LogEntry>,
    pub head_index: EntryId,
    pub commit_index: EntryId,
}

/// First phase of an ensemble change, addressed to the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareReconfigRequest {
    pub shard: ShardId,
    pub operator_id: u64,
    pub op: ReconfigOp,
    pub term: u64,
    pub old_node: Option<NodeId>,
}

/// The snapshot payload is present for NodeSwap and Expand, absent for
/// Contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareReconfigResponse {
    pub op: ReconfigOp,
    pub term: u64,
    pub snapshot: Option<ReplicaSnapshot>,
}

/// Install a log snapshot on an incoming node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRequest {
    pub shard: ShardId,
    pub operator_id: u64,
    pub term: u64,
    pub snapshot: ReplicaSnapshot,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
    pub head_index: EntryId,
}

/// Second phase of an ensemble change, addressed to the leader.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitReconfigRequest {
    pub shard: ShardId,
    pub operator_id: u64,
    pub op: ReconfigOp,
    pub term: u64,
    pub rep_factor: u32,
    pub old_node: Option<NodeId>,
    pub new_node: Option<NodeId>,
    pub head_index: Option<EntryId>,
}

/// `accepted` is false when a Contract commit would regress the commit
/// index; the coordinator retries until replication catches up.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitReconfigResponse {
    pub op: ReconfigOp,
    pub term: u64,
    pub accepted: bool,
}

/// Transport for coordinator and replication traffic.
///
/// The engine is transport-agnostic; implementations can be backed by gRPC,
/// in-memory channels, or test harnesses. Delivery is at-least-once: callers
/// retry until they observe a response and node handlers tolerate duplicate
/// requests. An error means "no response"; it never encodes a protocol
/// outcome.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn new_term(
        &self,
        target: NodeId,
        request: NewTermRequest,
    ) -> anyhow::Result<NewTermResponse>;

    async fn become_leader(
        &self,
        target: NodeId,
        request: BecomeLeaderRequest,
    ) -> anyhow::Result<BecomeLeaderResponse>;

    /// Fire-and-forget: an acknowledgement only means the message was
    /// delivered, not that it was acted on.
    async fn add_follower(&self, target: NodeId, request: AddFollowerRequest)
        -> anyhow::Result<()>;

    async fn truncate(
        &self,
        target: NodeId,
        request: TruncateRequest,
    ) -> anyhow::Result<TruncateResponse>;

    async fn add_entry(
        &self,
        target: NodeId,
        request: AddEntryRequest,
    ) -> anyhow::Result<AddEntryResponse>;

    async fn send_snapshot(
        &self,
        target: NodeId,
        request: SnapshotRequest,
    ) -> anyhow::Result<SnapshotResponse>;

    async fn prepare_reconfig(
        &self,
        target: NodeId,
        request: PrepareReconfigRequest,
    ) -> anyhow::Result<PrepareReconfigResponse>;

    async fn commit_reconfig(
        &self,
        target: NodeId,
        request: CommitReconfigRequest,
    ) -> anyhow::Result<CommitReconfigResponse>;
}

/// Tuning for a shard replica.
#[derive(Clone, Copy, Debug)]
pub struct ReplicaOptions {
    /// Capacity of the replica event mailbox.
    pub mailbox_capacity: usize,
    /// Delay before a failed peer send is retried.
    pub send_retry_interval: Duration,
    /// How long a client write waits for its commit before the pending
    /// handle resolves as failed. The outcome of a timed-out write is
    /// unknown: it may still commit.
    pub write_timeout: Duration,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            mailbox_capacity: 1024,
            send_retry_interval: Duration::from_millis(100),
            write_timeout: Duration::from_secs(30),
        }
    }
}

/// Tuning for the per-shard coordinator driver.
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorOptions {
    /// Identity stamped on control-plane messages.
    pub operator_id: u64,
    /// Capacity of the command mailbox.
    pub mailbox_capacity: usize,
    /// Delay between fencing retries toward an unresponsive node.
    pub fence_retry_interval: Duration,
    /// Delay between control RPC retries.
    pub rpc_retry_interval: Duration,
    /// Delay before an unsafe Contract commit is attempted again.
    pub contract_retry_interval: Duration,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            operator_id: 1,
            mailbox_capacity: 64,
            fence_retry_interval: Duration::from_millis(200),
            rpc_retry_interval: Duration::from_millis(200),
            contract_retry_interval: Duration::from_millis(500),
        }
    }
}

/// Batching surface consumed by the client layer in front of the engine.
/// The engine itself only reads `request_timeout`.
#[derive(Clone, Copy, Debug)]
pub struct ClientOptions {
    /// How long the batcher waits before sending a partial batch. Zero
    /// disables lingering.
    pub batch_linger: Duration,
    /// Requests per batch before it is flushed. One disables batching.
    pub max_requests_per_batch: usize,
    /// End-to-end deadline for a batched request.
    pub request_timeout: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            batch_linger: Duration::from_millis(5),
            max_requests_per_batch: 1000,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientOptions {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_requests_per_batch == 0 {
            bail!("max_requests_per_batch must be greater than zero");
        }
        if self.request_timeout.is_zero() {
            bail!("request_timeout must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_options_defaults_are_valid() {
        ClientOptions::default().validate().unwrap();
    }

    #[test]
    fn client_options_reject_zero_batch_size() {
        let options = ClientOptions {
            max_requests_per_batch: 0,
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }
}
