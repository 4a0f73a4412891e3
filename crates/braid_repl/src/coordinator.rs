//! Per-shard coordinator: leader election and ensemble reconfiguration.
//!
//! The coordinator keeps no durable state of its own. Every step is recorded
//! in the metadata store with a compare-and-swap before the corresponding
//! control messages go out, so a coordinator restart can always resume from
//! the document: an Election status or a prepare-phase reconfiguration is
//! resolved by a fresh election, a commit-phase reconfiguration is driven
//! forward to completion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use braid_wal::EntryId;
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesUnordered, StreamExt};
use tokio::sync::{mpsc, oneshot};

use crate::metadata::{CasOutcome, Metadata, MetadataStore, ReconfigMeta, ReconfigPhase, ShardStatus};
use crate::types::{
    AddFollowerRequest, BecomeLeaderRequest, CommitReconfigRequest, CoordinatorOptions,
    NewTermRequest, NewTermResponse, NodeId, PrepareReconfigRequest, ReconfigOp, ShardId,
    SnapshotRequest, Transport,
};

/// Operator-requested ensemble change.
#[derive(Clone, Copy, Debug)]
pub enum ReconfigCommand {
    /// Replace `old_node` with `new_node` at the same replication factor.
    NodeSwap { old_node: NodeId, new_node: NodeId },
    /// Add `new_node`, growing the replication factor by one.
    Expand { new_node: NodeId },
    /// Remove `old_node`, shrinking the replication factor by one.
    Contract { old_node: NodeId },
}

enum Command {
    StartElection {
        reply: oneshot::Sender<anyhow::Result<NodeId>>,
    },
    Reconfigure {
        change: ReconfigCommand,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
}

/// Spawns per-shard coordinator drivers.
pub struct Coordinator;

impl Coordinator {
    pub fn spawn(
        shard: ShardId,
        store: Arc<dyn MetadataStore>,
        transport: Arc<dyn Transport>,
        options: CoordinatorOptions,
    ) -> CoordinatorHandle {
        let (commands_tx, commands_rx) = mpsc::channel(options.mailbox_capacity);
        let worker = CoordinatorWorker {
            shard,
            store,
            transport,
            options,
            fences: FuturesUnordered::new(),
            fence_term: 0,
            leader: None,
            final_ensemble: BTreeSet::new(),
        };
        tokio::spawn(worker.run(commands_rx));
        CoordinatorHandle {
            commands: commands_tx,
        }
    }
}

/// Handle for submitting operator commands to a shard coordinator. Commands
/// are processed one at a time.
#[derive(Clone)]
pub struct CoordinatorHandle {
    commands: mpsc::Sender<Command>,
}

impl CoordinatorHandle {
    /// Force a new election. Unconditional: the current term is fenced off
    /// and replication stops until a leader is re-established.
    pub async fn start_election(&self) -> anyhow::Result<NodeId> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::StartElection { reply })
            .await
            .map_err(|_| anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow!("coordinator stopped"))?
    }

    /// Run an ensemble change. Only valid from steady state with no other
    /// reconfiguration in flight.
    pub async fn reconfigure(&self, change: ReconfigCommand) -> anyhow::Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Reconfigure { change, reply })
            .await
            .map_err(|_| anyhow!("coordinator stopped"))?;
        rx.await.map_err(|_| anyhow!("coordinator stopped"))?
    }
}

type FenceFuture = BoxFuture<'static, (NodeId, NewTermResponse)>;

struct CoordinatorWorker {
    shard: ShardId,
    store: Arc<dyn MetadataStore>,
    transport: Arc<dyn Transport>,
    options: CoordinatorOptions,
    /// Outstanding fencing requests from the most recent election. Kept
    /// after the election completes so that late responders can still be
    /// handed to the leader as followers.
    fences: FuturesUnordered<FenceFuture>,
    fence_term: u64,
    leader: Option<NodeId>,
    final_ensemble: BTreeSet<NodeId>,
}

enum Wake {
    Command(Option<Command>),
    LateResponder(NodeId, NewTermResponse),
}

impl CoordinatorWorker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        if let Err(err) = self.recover().await {
            tracing::warn!(error = ?err, shard = self.shard, "startup recovery failed");
        }
        loop {
            let wake = if self.fences.is_empty() {
                Wake::Command(commands.recv().await)
            } else {
                tokio::select! {
                    command = commands.recv() => Wake::Command(command),
                    next = self.fences.next() => match next {
                        Some((node, response)) => Wake::LateResponder(node, response),
                        None => continue,
                    },
                }
            };
            match wake {
                Wake::Command(None) => break,
                Wake::Command(Some(Command::StartElection { reply })) => {
                    let result = self.run_election().await;
                    if let Err(err) = &result {
                        tracing::warn!(error = ?err, shard = self.shard, "election failed");
                    }
                    let _ = reply.send(result);
                }
                Wake::Command(Some(Command::Reconfigure { change, reply })) => {
                    let result = self.run_reconfigure(change).await;
                    if let Err(err) = &result {
                        tracing::warn!(error = ?err, shard = self.shard, "reconfiguration failed");
                    }
                    let _ = reply.send(result);
                }
                Wake::LateResponder(node, response) => {
                    self.forward_late_responder(node, response).await;
                }
            }
        }
    }

    async fn load(&self) -> anyhow::Result<(Metadata, u64)> {
        self.store
            .get(self.shard)
            .await?
            .with_context(|| format!("no metadata for shard {}", self.shard))
    }

    /// Bail out when another coordinator has moved the shard past `term`.
    async fn ensure_current(&self, term: u64) -> anyhow::Result<()> {
        let (metadata, _) = self.load().await?;
        if metadata.term != term {
            bail!(
                "operation at term {term} superseded by term {}",
                metadata.term
            );
        }
        Ok(())
    }

    async fn recover(&mut self) -> anyhow::Result<()> {
        let Some((metadata, _)) = self.store.get(self.shard).await? else {
            tracing::debug!(shard = self.shard, "no metadata yet; nothing to recover");
            return Ok(());
        };
        match metadata.shard_status {
            ShardStatus::SteadyState => Ok(()),
            ShardStatus::Election => {
                tracing::info!(shard = self.shard, "resuming interrupted election");
                self.run_election().await.map(|_| ())
            }
            ShardStatus::Reconfiguration => {
                let reconfig = metadata
                    .reconfig
                    .as_ref()
                    .context("reconfiguration status without a progress record")?;
                match reconfig.phase {
                    ReconfigPhase::Commit => {
                        tracing::info!(
                            shard = self.shard,
                            op = ?reconfig.op,
                            "resuming commit-phase reconfiguration"
                        );
                        self.resume_commit().await
                    }
                    ReconfigPhase::Prepare => {
                        // Nothing downstream can have taken effect yet; a
                        // fresh election re-establishes steady state.
                        tracing::info!(
                            shard = self.shard,
                            op = ?reconfig.op,
                            "abandoning prepare-phase reconfiguration"
                        );
                        self.run_election().await.map(|_| ())
                    }
                }
            }
        }
    }

    async fn run_election(&mut self) -> anyhow::Result<NodeId> {
        loop {
            let (metadata, version) = self.load().await?;
            let new_term = metadata.term + 1;
            let fencing = fencing_ensemble(&metadata);
            let election = Metadata {
                shard_status: ShardStatus::Election,
                term: new_term,
                ensemble: metadata.ensemble.clone(),
                rep_factor: metadata.rep_factor,
                leader: None,
                reconfig: metadata
                    .reconfig
                    .clone()
                    .filter(|r| r.phase == ReconfigPhase::Commit),
            };
            match self.store.cas(self.shard, Some(version), &election).await? {
                CasOutcome::Applied { version } => {
                    return self.complete_election(election, version, fencing).await;
                }
                CasOutcome::VersionMismatch => {
                    tracing::debug!(
                        shard = self.shard,
                        term = new_term,
                        "metadata moved; restarting election attempt"
                    );
                }
            }
        }
    }

    async fn complete_election(
        &mut self,
        election: Metadata,
        version: u64,
        fencing: BTreeSet<NodeId>,
    ) -> anyhow::Result<NodeId> {
        let term = election.term;
        self.leader = None;
        self.fence_term = term;
        self.final_ensemble = final_ensemble(&election);

        // Fence every reachable node; each request retries until answered
        // or until a later election drops the whole set.
        self.fences = FuturesUnordered::new();
        for node in fencing.iter().copied() {
            self.fences.push(self.fence_node(node, term));
        }

        let quorum = fencing.len() / 2 + 1;
        let mut responses: BTreeMap<NodeId, EntryId> = BTreeMap::new();
        loop {
            if responses.len() >= quorum
                && responses
                    .keys()
                    .any(|node| self.final_ensemble.contains(node))
            {
                break;
            }
            let Some((node, response)) = self.fences.next().await else {
                // Fences only resolve with a response, and draining a
                // non-empty set means every node responded, which always
                // passes the checks above. Only an empty fencing ensemble
                // lands here.
                bail!("no quorum available for term {term}");
            };
            tracing::debug!(
                shard = self.shard,
                term,
                node,
                head = %response.head_index,
                "fenced node"
            );
            responses.insert(node, response.head_index);
        }

        let (leader, leader_head) = choose_leader(&responses, &self.final_ensemble)
            .context("no electable node responded")?;
        let follower_map: BTreeMap<NodeId, EntryId> = responses
            .iter()
            .filter(|(node, _)| **node != leader && self.final_ensemble.contains(*node))
            .map(|(node, head)| (*node, *head))
            .collect();

        let request = BecomeLeaderRequest {
            shard: self.shard,
            operator_id: self.options.operator_id,
            term,
            rep_factor: self.final_ensemble.len() as u32,
            follower_map,
        };
        loop {
            match self.transport.become_leader(leader, request.clone()).await {
                Ok(response) if response.term == term => break,
                Ok(response) => bail!("unexpected become-leader response term {}", response.term),
                Err(err) => {
                    tracing::debug!(
                        error = ?err,
                        shard = self.shard,
                        term,
                        leader,
                        "become-leader not answered; retrying"
                    );
                    tokio::time::sleep(self.options.rpc_retry_interval).await;
                    self.ensure_current(term).await?;
                }
            }
        }

        let steady = Metadata {
            shard_status: ShardStatus::SteadyState,
            term,
            ensemble: self.final_ensemble.clone(),
            rep_factor: self.final_ensemble.len() as u32,
            leader: Some(leader),
            reconfig: None,
        };
        match self.store.cas(self.shard, Some(version), &steady).await? {
            CasOutcome::Applied { .. } => {
                self.leader = Some(leader);
                tracing::info!(
                    shard = self.shard,
                    term,
                    leader,
                    head = %leader_head,
                    ensemble = ?self.final_ensemble,
                    "election completed"
                );
                Ok(leader)
            }
            CasOutcome::VersionMismatch => bail!("election for term {term} superseded"),
        }
    }

    fn fence_node(&self, node: NodeId, term: u64) -> FenceFuture {
        let transport = self.transport.clone();
        let request = NewTermRequest {
            shard: self.shard,
            operator_id: self.options.operator_id,
            term,
        };
        let retry_interval = self.options.fence_retry_interval;
        Box::pin(async move {
            loop {
                match transport.new_term(node, request.clone()).await {
                    Ok(response) => return (node, response),
                    Err(err) => {
                        tracing::debug!(
                            error = ?err,
                            node,
                            term,
                            "fencing not answered; retrying"
                        );
                        tokio::time::sleep(retry_interval).await;
                    }
                }
            }
        })
    }

    /// A fencing response that arrived after the election completed: hand
    /// the node to the current leader as a follower.
    async fn forward_late_responder(&self, node: NodeId, response: NewTermResponse) {
        if response.term != self.fence_term {
            return;
        }
        let Some(leader) = self.leader else {
            return;
        };
        if node == leader || !self.final_ensemble.contains(&node) {
            return;
        }
        let request = AddFollowerRequest {
            shard: self.shard,
            operator_id: self.options.operator_id,
            term: self.fence_term,
            follower: node,
            follower_head_index: response.head_index,
        };
        tracing::info!(
            shard = self.shard,
            term = self.fence_term,
            follower = node,
            head = %response.head_index,
            "forwarding late fencing responder to the leader"
        );
        loop {
            match self.transport.add_follower(leader, request.clone()).await {
                Ok(()) => return,
                Err(err) => {
                    tracing::debug!(
                        error = ?err,
                        shard = self.shard,
                        leader,
                        "add-follower delivery failed; retrying"
                    );
                    tokio::time::sleep(self.options.rpc_retry_interval).await;
                    if self.ensure_current(self.fence_term).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn run_reconfigure(&mut self, change: ReconfigCommand) -> anyhow::Result<()> {
        let (metadata, version) = self.load().await?;
        let reconfig = plan_reconfigure(&metadata, &change)?;
        let leader = metadata.leader.context("shard has no leader")?;
        let term = reconfig.term;

        let mut document = metadata.clone();
        document.shard_status = ShardStatus::Reconfiguration;
        document.term = term;
        document.reconfig = Some(reconfig.clone());
        let version = match self.store.cas(self.shard, Some(version), &document).await? {
            CasOutcome::Applied { version } => version,
            CasOutcome::VersionMismatch => bail!("metadata changed; retry the reconfiguration"),
        };
        tracing::info!(
            shard = self.shard,
            term,
            op = ?reconfig.op,
            old_node = ?reconfig.old_node,
            new_node = ?reconfig.new_node,
            "starting reconfiguration"
        );

        let prepare = PrepareReconfigRequest {
            shard: self.shard,
            operator_id: self.options.operator_id,
            op: reconfig.op,
            term,
            old_node: reconfig.old_node,
        };
        let prepared = loop {
            match self.transport.prepare_reconfig(leader, prepare.clone()).await {
                Ok(response) => break response,
                Err(err) => {
                    tracing::debug!(
                        error = ?err,
                        shard = self.shard,
                        term,
                        "prepare not answered; retrying"
                    );
                    tokio::time::sleep(self.options.rpc_retry_interval).await;
                    self.ensure_current(term).await?;
                }
            }
        };

        let (document, version) = match reconfig.op {
            ReconfigOp::NodeSwap | ReconfigOp::Expand => {
                let snapshot = prepared
                    .snapshot
                    .context("prepare response missing a snapshot")?;
                let new_node = reconfig
                    .new_node
                    .context("membership change without an incoming node")?;
                let install = SnapshotRequest {
                    shard: self.shard,
                    operator_id: self.options.operator_id,
                    term,
                    snapshot,
                };
                let installed = loop {
                    match self.transport.send_snapshot(new_node, install.clone()).await {
                        Ok(response) => break response,
                        Err(err) => {
                            tracing::debug!(
                                error = ?err,
                                shard = self.shard,
                                term,
                                new_node,
                                "snapshot not answered; retrying"
                            );
                            tokio::time::sleep(self.options.rpc_retry_interval).await;
                            self.ensure_current(term).await?;
                        }
                    }
                };

                let mut committed = reconfig.clone();
                committed.phase = ReconfigPhase::Commit;
                committed.new_node_head_index = Some(installed.head_index);
                let mut document = document;
                document.reconfig = Some(committed);
                match self.store.cas(self.shard, Some(version), &document).await? {
                    CasOutcome::Applied { version } => (document, version),
                    CasOutcome::VersionMismatch => bail!("reconfiguration superseded"),
                }
            }
            ReconfigOp::Contract => {
                let mut committed = reconfig.clone();
                committed.phase = ReconfigPhase::Commit;
                let mut document = document;
                document.reconfig = Some(committed);
                match self.store.cas(self.shard, Some(version), &document).await? {
                    CasOutcome::Applied { version } => (document, version),
                    CasOutcome::VersionMismatch => bail!("reconfiguration superseded"),
                }
            }
        };

        self.finish_commit(document, version).await
    }

    /// A coordinator restart found a commit-phase reconfiguration; drive it
    /// to completion.
    async fn resume_commit(&mut self) -> anyhow::Result<()> {
        let (metadata, version) = self.load().await?;
        if metadata.shard_status != ShardStatus::Reconfiguration {
            return Ok(());
        }
        match metadata.reconfig.as_ref().map(|r| r.phase) {
            Some(ReconfigPhase::Commit) => self.finish_commit(metadata, version).await,
            _ => Ok(()),
        }
    }

    /// Send the commit to the leader (retrying an unsafe Contract until it
    /// is accepted) and publish the post-change metadata.
    async fn finish_commit(&mut self, metadata: Metadata, version: u64) -> anyhow::Result<()> {
        let reconfig = metadata
            .reconfig
            .clone()
            .context("commit without a progress record")?;
        let leader = metadata.leader.context("commit without a leader")?;
        let term = reconfig.term;

        let request = CommitReconfigRequest {
            shard: self.shard,
            operator_id: self.options.operator_id,
            op: reconfig.op,
            term,
            rep_factor: reconfig.target_rep_factor,
            old_node: reconfig.old_node,
            new_node: reconfig.new_node,
            head_index: reconfig.new_node_head_index,
        };
        loop {
            let response = loop {
                match self.transport.commit_reconfig(leader, request.clone()).await {
                    Ok(response) => break response,
                    Err(err) => {
                        tracing::debug!(
                            error = ?err,
                            shard = self.shard,
                            term,
                            "commit not answered; retrying"
                        );
                        tokio::time::sleep(self.options.rpc_retry_interval).await;
                        self.ensure_current(term).await?;
                    }
                }
            };
            if response.accepted {
                break;
            }
            // Only Contract can be refused: removing the node right now
            // would regress the commit index. Wait for replication.
            tracing::info!(
                shard = self.shard,
                term,
                "contract deferred until replication catches up"
            );
            tokio::time::sleep(self.options.contract_retry_interval).await;
            self.ensure_current(term).await?;
        }

        let mut steady = metadata.clone();
        steady.shard_status = ShardStatus::SteadyState;
        steady.ensemble = apply_ensemble_change(&metadata.ensemble, &reconfig);
        steady.rep_factor = reconfig.target_rep_factor;
        steady.reconfig = None;
        match self.store.cas(self.shard, Some(version), &steady).await? {
            CasOutcome::Applied { .. } => {
                tracing::info!(
                    shard = self.shard,
                    term,
                    op = ?reconfig.op,
                    ensemble = ?steady.ensemble,
                    rep_factor = steady.rep_factor,
                    "reconfiguration completed"
                );
                Ok(())
            }
            CasOutcome::VersionMismatch => bail!("reconfiguration superseded"),
        }
    }
}

/// Nodes that must be fenced for an election. A commit-phase NodeSwap or
/// Expand may already have installed the incoming node in a majority, so it
/// is fenced along with the recorded ensemble; leaving it out risks electing
/// two leaders.
fn fencing_ensemble(metadata: &Metadata) -> BTreeSet<NodeId> {
    let mut nodes = metadata.ensemble.clone();
    if let Some(reconfig) = &metadata.reconfig {
        if reconfig.phase == ReconfigPhase::Commit
            && matches!(reconfig.op, ReconfigOp::NodeSwap | ReconfigOp::Expand)
        {
            if let Some(new_node) = reconfig.new_node {
                nodes.insert(new_node);
            }
        }
    }
    nodes
}

/// Ensemble the election publishes. A preserved commit-phase NodeSwap or
/// Expand is applied as part of the election; an interrupted Contract is
/// simply dropped (the outgoing node stays a member).
fn final_ensemble(metadata: &Metadata) -> BTreeSet<NodeId> {
    let mut nodes = metadata.ensemble.clone();
    if let Some(reconfig) = &metadata.reconfig {
        if reconfig.phase == ReconfigPhase::Commit {
            match reconfig.op {
                ReconfigOp::NodeSwap => {
                    if let Some(old_node) = reconfig.old_node {
                        nodes.remove(&old_node);
                    }
                    if let Some(new_node) = reconfig.new_node {
                        nodes.insert(new_node);
                    }
                }
                ReconfigOp::Expand => {
                    if let Some(new_node) = reconfig.new_node {
                        nodes.insert(new_node);
                    }
                }
                ReconfigOp::Contract => {}
            }
        }
    }
    nodes
}

/// Pick the leader among the responders that belong to the final ensemble:
/// greatest head index, ties broken by the lowest node id.
fn choose_leader(
    responses: &BTreeMap<NodeId, EntryId>,
    ensemble: &BTreeSet<NodeId>,
) -> Option<(NodeId, EntryId)> {
    responses
        .iter()
        .filter(|(node, _)| ensemble.contains(*node))
        .max_by(|(a_node, a_head), (b_node, b_head)| {
            a_head.cmp(b_head).then_with(|| b_node.cmp(a_node))
        })
        .map(|(node, head)| (*node, *head))
}

/// Validate an operator request against current metadata and lay out the
/// prepare-phase progress record.
fn plan_reconfigure(metadata: &Metadata, change: &ReconfigCommand) -> anyhow::Result<ReconfigMeta> {
    if metadata.shard_status != ShardStatus::SteadyState {
        bail!("shard is not in steady state");
    }
    if metadata.reconfig.is_some() {
        bail!("a reconfiguration is already in progress");
    }
    let leader = metadata.leader.context("shard has no leader")?;
    let term = metadata.term + 1;

    match *change {
        ReconfigCommand::NodeSwap { old_node, new_node } => {
            if old_node == leader {
                bail!("cannot swap out the leader");
            }
            if !metadata.ensemble.contains(&old_node) {
                bail!("node {old_node} is not in the ensemble");
            }
            if metadata.ensemble.contains(&new_node) {
                bail!("node {new_node} is already in the ensemble");
            }
            Ok(ReconfigMeta {
                op: ReconfigOp::NodeSwap,
                phase: ReconfigPhase::Prepare,
                term,
                target_rep_factor: metadata.rep_factor,
                old_node: Some(old_node),
                new_node: Some(new_node),
                new_node_head_index: None,
            })
        }
        ReconfigCommand::Expand { new_node } => {
            if metadata.ensemble.contains(&new_node) {
                bail!("node {new_node} is already in the ensemble");
            }
            Ok(ReconfigMeta {
                op: ReconfigOp::Expand,
                phase: ReconfigPhase::Prepare,
                term,
                target_rep_factor: metadata.rep_factor + 1,
                old_node: None,
                new_node: Some(new_node),
                new_node_head_index: None,
            })
        }
        ReconfigCommand::Contract { old_node } => {
            if old_node == leader {
                bail!("cannot contract away the leader");
            }
            if !metadata.ensemble.contains(&old_node) {
                bail!("node {old_node} is not in the ensemble");
            }
            if metadata.rep_factor <= 3 {
                bail!("replication factor would drop below the minimum of 3");
            }
            Ok(ReconfigMeta {
                op: ReconfigOp::Contract,
                phase: ReconfigPhase::Prepare,
                term,
                target_rep_factor: metadata.rep_factor - 1,
                old_node: Some(old_node),
                new_node: None,
                new_node_head_index: None,
            })
        }
    }
}

/// Membership after a committed change.
fn apply_ensemble_change(ensemble: &BTreeSet<NodeId>, reconfig: &ReconfigMeta) -> BTreeSet<NodeId> {
    let mut nodes = ensemble.clone();
    match reconfig.op {
        ReconfigOp::NodeSwap => {
            if let Some(old_node) = reconfig.old_node {
                nodes.remove(&old_node);
            }
            if let Some(new_node) = reconfig.new_node {
                nodes.insert(new_node);
            }
        }
        ReconfigOp::Expand => {
            if let Some(new_node) = reconfig.new_node {
                nodes.insert(new_node);
            }
        }
        ReconfigOp::Contract => {
            if let Some(old_node) = reconfig.old_node {
                nodes.remove(&old_node);
            }
        }
    }
    nodes
}
