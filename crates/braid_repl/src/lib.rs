//! Shard replication engine for a horizontally scaled key-value store.
//!
//! The engine has three moving parts per shard: a coordinator that drives
//! leader election and two-phase ensemble reconfiguration against a
//! versioned metadata store, a storage-node state machine that replicates a
//! write-ahead log from the leader to its followers, and the transport seam
//! that carries their messages. Client-facing RPC, shard routing, and the
//! on-disk log format live outside this crate.

pub mod coordinator;
pub mod metadata;
pub mod replica;
mod state;
pub mod types;

pub use coordinator::{Coordinator, CoordinatorHandle, ReconfigCommand};
pub use metadata::{
    CasOutcome, MemoryMetadataStore, Metadata, MetadataStore, ReconfigMeta, ReconfigPhase,
    ShardStatus,
};
pub use replica::{CursorInfo, Replica, ReplicaHandle, ReplicaInfo};
pub use types::{
    AddEntryCode, AddEntryRequest, AddEntryResponse, AddFollowerRequest, BecomeLeaderRequest,
    BecomeLeaderResponse, ClientOptions, CommitReconfigRequest, CommitReconfigResponse,
    CoordinatorOptions, CursorStatus, NewTermRequest, NewTermResponse, NodeId,
    PrepareReconfigRequest, PrepareReconfigResponse, ReconfigOp, ReplicaOptions, ReplicaSnapshot,
    ReplicaStatus, ShardId, SnapshotRequest, SnapshotResponse, Transport, TruncateRequest,
    TruncateResponse,
};
