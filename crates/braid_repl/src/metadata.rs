//! Per-shard replication metadata and the versioned store guarding it.
//!
//! The metadata document is the single source of truth for shard membership
//! and leadership. Every update is a compare-and-swap against the version
//! observed at read time; losing the CAS aborts the attempt that issued it.

use std::collections::{BTreeSet, HashMap};

use anyhow::Context;
use async_trait::async_trait;
use braid_wal::EntryId;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::types::{NodeId, ReconfigOp, ShardId};

/// Lifecycle status of a shard's metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardStatus {
    SteadyState,
    Election,
    Reconfiguration,
}

/// Phase of a two-phase ensemble change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReconfigPhase {
    Prepare,
    Commit,
}

/// Progress of an in-flight ensemble change, persisted so that any
/// coordinator can resume or abandon it after a restart.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigMeta {
    pub op: ReconfigOp,
    pub phase: ReconfigPhase,
    pub term: u64,
    pub target_rep_factor: u32,
    pub old_node: Option<NodeId>,
    pub new_node: Option<NodeId>,
    /// Head reported by the incoming node after snapshot install; recorded
    /// at the transition to the Commit phase.
    pub new_node_head_index: Option<EntryId>,
}

/// Replication metadata for one shard.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub shard_status: ShardStatus,
    pub term: u64,
    pub ensemble: BTreeSet<NodeId>,
    pub rep_factor: u32,
    pub leader: Option<NodeId>,
    pub reconfig: Option<ReconfigMeta>,
}

impl Metadata {
    /// Initial document for a freshly provisioned shard: no leader yet, so
    /// the shard starts in Election status and the first coordinator to see
    /// it runs the bootstrap election.
    pub fn bootstrap(ensemble: BTreeSet<NodeId>) -> Metadata {
        let rep_factor = ensemble.len() as u32;
        Metadata {
            shard_status: ShardStatus::Election,
            term: 0,
            ensemble,
            rep_factor,
            leader: None,
            reconfig: None,
        }
    }
}

/// Outcome of a conditional metadata update.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CasOutcome {
    /// The update applied; the stored version is now `version`.
    Applied { version: u64 },
    /// The expected version no longer matches; the caller must reload.
    VersionMismatch,
}

/// Linearizable, versioned register holding one `Metadata` document per
/// shard. `expected_version: None` creates the document and fails if it
/// already exists.
#[async_trait]
pub trait MetadataStore: Send + Sync + 'static {
    async fn get(&self, shard: ShardId) -> anyhow::Result<Option<(Metadata, u64)>>;

    async fn cas(
        &self,
        shard: ShardId,
        expected_version: Option<u64>,
        value: &Metadata,
    ) -> anyhow::Result<CasOutcome>;
}

/// In-memory metadata store. Documents are held serialized, so the codec
/// path is the same one a remote store implementation would exercise.
#[derive(Default)]
pub struct MemoryMetadataStore {
    shards: Mutex<HashMap<ShardId, (Vec<u8>, u64)>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn get(&self, shard: ShardId) -> anyhow::Result<Option<(Metadata, u64)>> {
        let shards = self.shards.lock().await;
        let Some((raw, version)) = shards.get(&shard) else {
            return Ok(None);
        };
        let metadata =
            serde_json::from_slice(raw).context("failed to decode shard metadata")?;
        Ok(Some((metadata, *version)))
    }

    async fn cas(
        &self,
        shard: ShardId,
        expected_version: Option<u64>,
        value: &Metadata,
    ) -> anyhow::Result<CasOutcome> {
        let raw = serde_json::to_vec(value).context("failed to encode shard metadata")?;
        let mut shards = self.shards.lock().await;
        let current = shards.get(&shard).map(|(_, version)| *version);
        match (current, expected_version) {
            (None, None) => {
                shards.insert(shard, (raw, 0));
                Ok(CasOutcome::Applied { version: 0 })
            }
            (Some(version), Some(expected)) if version == expected => {
                shards.insert(shard, (raw, expected + 1));
                Ok(CasOutcome::Applied {
                    version: expected + 1,
                })
            }
            _ => Ok(CasOutcome::VersionMismatch),
        }
    }
}
