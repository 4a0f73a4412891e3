#![allow(dead_code)]
//! Shared in-memory cluster harness for replication tests.
//!
//! The fabric delivers requests straight into replica mailboxes and can
//! cut individual nodes off (delivery errors, so callers retry) or
//! duplicate append deliveries to exercise the at-least-once tolerance.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use braid_repl::{
    AddEntryRequest, AddEntryResponse, AddFollowerRequest, BecomeLeaderRequest,
    BecomeLeaderResponse, CommitReconfigRequest, CommitReconfigResponse, Coordinator,
    CoordinatorHandle, CoordinatorOptions, MemoryMetadataStore, Metadata, MetadataStore,
    NewTermRequest, NewTermResponse, NodeId, PrepareReconfigRequest, PrepareReconfigResponse,
    Replica, ReplicaHandle, ReplicaInfo, ReplicaOptions, ShardStatus, SnapshotRequest,
    SnapshotResponse, Transport, TruncateRequest, TruncateResponse,
};
use braid_wal::{LogEntry, MemoryWal, SystemClock};

pub const SHARD: u64 = 1;
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// In-memory message fabric routing requests to registered replicas.
#[derive(Default)]
pub struct InMemoryFabric {
    replicas: RwLock<HashMap<NodeId, ReplicaHandle>>,
    unreachable: RwLock<HashSet<NodeId>>,
    duplicate_appends: AtomicBool,
}

impl InMemoryFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, handle: ReplicaHandle) {
        self.replicas
            .write()
            .unwrap()
            .insert(handle.node_id(), handle);
    }

    /// Cut a node off: every delivery toward it fails until healed.
    pub fn partition(&self, node: NodeId) {
        self.unreachable.write().unwrap().insert(node);
    }

    pub fn heal(&self, node: NodeId) {
        self.unreachable.write().unwrap().remove(&node);
    }

    pub fn deregister(&self, node: NodeId) {
        self.replicas.write().unwrap().remove(&node);
    }

    /// Deliver every append twice, exercising idempotent follower appends.
    pub fn set_duplicate_appends(&self, enabled: bool) {
        self.duplicate_appends.store(enabled, Ordering::SeqCst);
    }

    fn replica(&self, target: NodeId) -> anyhow::Result<ReplicaHandle> {
        if self.unreachable.read().unwrap().contains(&target) {
            bail!("node {target} unreachable");
        }
        match self.replicas.read().unwrap().get(&target) {
            Some(handle) => Ok(handle.clone()),
            None => bail!("unknown node {target}"),
        }
    }
}

#[async_trait]
impl Transport for InMemoryFabric {
    async fn new_term(
        &self,
        target: NodeId,
        request: NewTermRequest,
    ) -> anyhow::Result<NewTermResponse> {
        self.replica(target)?.new_term(request).await
    }

    async fn become_leader(
        &self,
        target: NodeId,
        request: BecomeLeaderRequest,
    ) -> anyhow::Result<BecomeLeaderResponse> {
        self.replica(target)?.become_leader(request).await
    }

    async fn add_follower(
        &self,
        target: NodeId,
        request: AddFollowerRequest,
    ) -> anyhow::Result<()> {
        self.replica(target)?.add_follower(request).await
    }

    async fn truncate(
        &self,
        target: NodeId,
        request: TruncateRequest,
    ) -> anyhow::Result<TruncateResponse> {
        self.replica(target)?.truncate(request).await
    }

    async fn add_entry(
        &self,
        target: NodeId,
        request: AddEntryRequest,
    ) -> anyhow::Result<AddEntryResponse> {
        let replica = self.replica(target)?;
        if self.duplicate_appends.load(Ordering::SeqCst) {
            let _ = replica.add_entry(request.clone()).await;
        }
        replica.add_entry(request).await
    }

    async fn send_snapshot(
        &self,
        target: NodeId,
        request: SnapshotRequest,
    ) -> anyhow::Result<SnapshotResponse> {
        self.replica(target)?.install_snapshot(request).await
    }

    async fn prepare_reconfig(
        &self,
        target: NodeId,
        request: PrepareReconfigRequest,
    ) -> anyhow::Result<PrepareReconfigResponse> {
        self.replica(target)?.prepare_reconfig(request).await
    }

    async fn commit_reconfig(
        &self,
        target: NodeId,
        request: CommitReconfigRequest,
    ) -> anyhow::Result<CommitReconfigResponse> {
        self.replica(target)?.commit_reconfig(request).await
    }
}

/// One shard's worth of replicas, metadata, and a coordinator.
pub struct Cluster {
    pub fabric: Arc<InMemoryFabric>,
    pub store: Arc<MemoryMetadataStore>,
    coordinator: Option<CoordinatorHandle>,
    pub replicas: BTreeMap<NodeId, ReplicaHandle>,
    pub wals: BTreeMap<NodeId, Arc<MemoryWal>>,
}

pub fn replica_options() -> ReplicaOptions {
    ReplicaOptions {
        send_retry_interval: Duration::from_millis(25),
        write_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

pub fn coordinator_options() -> CoordinatorOptions {
    CoordinatorOptions {
        fence_retry_interval: Duration::from_millis(25),
        rpc_retry_interval: Duration::from_millis(25),
        contract_retry_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

impl Cluster {
    /// Bootstrap metadata for `nodes`, spawn their replicas, and start a
    /// coordinator (which immediately runs the bootstrap election).
    pub async fn start(nodes: &[NodeId]) -> Cluster {
        let mut cluster = Cluster::start_without_coordinator(nodes).await;
        cluster.spawn_coordinator();
        cluster
    }

    /// As [`Cluster::start`], but leave the coordinator out so tests can
    /// drive the control plane by hand first.
    pub async fn start_without_coordinator(nodes: &[NodeId]) -> Cluster {
        init_tracing();
        let fabric = InMemoryFabric::new();
        let store = Arc::new(MemoryMetadataStore::new());
        let ensemble: BTreeSet<NodeId> = nodes.iter().copied().collect();
        store
            .cas(SHARD, None, &Metadata::bootstrap(ensemble))
            .await
            .expect("bootstrap metadata");

        let mut cluster = Cluster {
            fabric,
            store,
            coordinator: None,
            replicas: BTreeMap::new(),
            wals: BTreeMap::new(),
        };
        for node in nodes {
            cluster.add_node(*node);
        }
        cluster
    }

    /// Spawn a replica that is not (yet) part of the ensemble.
    pub fn add_node(&mut self, node: NodeId) {
        let wal = Arc::new(MemoryWal::new());
        let handle = Replica::spawn(
            SHARD,
            node,
            wal.clone(),
            Arc::new(SystemClock),
            self.fabric.clone(),
            replica_options(),
        );
        self.fabric.register(handle.clone());
        self.replicas.insert(node, handle);
        self.wals.insert(node, wal);
    }

    /// Spawn a (new) coordinator against the shared store and fabric, as a
    /// restarted operator process would.
    pub fn spawn_coordinator(&mut self) {
        self.coordinator = Some(Coordinator::spawn(
            SHARD,
            self.store.clone(),
            self.fabric.clone(),
            coordinator_options(),
        ));
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        self.coordinator.as_ref().expect("coordinator not started")
    }

    /// Stop a node's replica outright: its event loop and send pipelines
    /// die, and deliveries toward it fail until it is restarted.
    pub fn crash_node(&mut self, node: NodeId) {
        self.fabric.deregister(node);
        self.replicas.remove(&node);
    }

    /// Restart a crashed node on its surviving WAL. It comes back with no
    /// term or membership; the next fencing round picks it up.
    pub fn restart_node(&mut self, node: NodeId) {
        let wal = self.wals.get(&node).cloned().expect("unknown node");
        let handle = Replica::spawn(
            SHARD,
            node,
            wal,
            Arc::new(SystemClock),
            self.fabric.clone(),
            replica_options(),
        );
        self.fabric.register(handle.clone());
        self.replicas.insert(node, handle);
    }

    pub fn replica(&self, node: NodeId) -> &ReplicaHandle {
        self.replicas.get(&node).expect("unknown node")
    }

    pub fn wal_entries(&self, node: NodeId) -> Vec<LogEntry> {
        self.wals.get(&node).expect("unknown node").entries()
    }

    pub async fn metadata(&self) -> (Metadata, u64) {
        self.store
            .get(SHARD)
            .await
            .expect("metadata store")
            .expect("shard metadata")
    }

    pub async fn info(&self, node: NodeId) -> ReplicaInfo {
        self.replica(node).info().await.expect("replica info")
    }

    /// Wait until the shard metadata is steady at `term`.
    pub async fn await_steady_term(&self, term: u64) -> Metadata {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let (metadata, _) = self.metadata().await;
            if metadata.shard_status == ShardStatus::SteadyState && metadata.term == term {
                return metadata;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("shard never reached steady state at term {term}: {metadata:?}");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Wait until `predicate` holds for the node's replica state.
    pub async fn wait_for(
        &self,
        node: NodeId,
        what: &str,
        predicate: impl Fn(&ReplicaInfo) -> bool,
    ) -> ReplicaInfo {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let info = self.info(node).await;
            if predicate(&info) {
                return info;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("node {node} never reached {what}: {info:?}");
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Assert that every node in `nodes` holds an identical log.
    pub fn assert_logs_identical(&self, nodes: &[NodeId]) {
        let reference = self.wal_entries(nodes[0]);
        for node in &nodes[1..] {
            assert_eq!(
                self.wal_entries(*node),
                reference,
                "log of node {node} diverges from node {}",
                nodes[0]
            );
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Values of all entries in a log, for readable assertions.
pub fn values(entries: &[LogEntry]) -> Vec<String> {
    entries
        .iter()
        .map(|e| String::from_utf8_lossy(&e.value).into_owned())
        .collect()
}
