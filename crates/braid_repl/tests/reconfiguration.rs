//! Two-phase ensemble changes: expand, node swap, contract.

mod common;

use std::time::Duration;

use braid_repl::{CursorStatus, ReconfigCommand, ReplicaStatus, ShardStatus};
use braid_wal::EntryId;
use common::{values, Cluster};

#[tokio::test]
async fn expand_adds_a_member_through_snapshot_and_commit() {
    let mut cluster = Cluster::start(&[1, 2, 3]).await;
    cluster.add_node(4);
    cluster.await_steady_term(1).await;

    for value in [b"v1".to_vec(), b"v2".to_vec(), b"v3".to_vec()] {
        cluster.replica(1).write(value).await.unwrap();
    }

    cluster
        .coordinator()
        .reconfigure(ReconfigCommand::Expand { new_node: 4 })
        .await
        .unwrap();

    let metadata = cluster.await_steady_term(2).await;
    assert_eq!(
        metadata.ensemble.iter().copied().collect::<Vec<_>>(),
        vec![1, 2, 3, 4]
    );
    assert_eq!(metadata.rep_factor, 4);
    assert_eq!(metadata.leader, Some(1));
    assert!(metadata.reconfig.is_none());

    // The incoming node holds exactly the snapshot it was sent.
    let incoming = cluster.info(4).await;
    assert_eq!(incoming.head_index, EntryId::new(1, 3));
    assert_eq!(incoming.commit_index, EntryId::new(1, 3));
    assert_eq!(values(&cluster.wal_entries(4)), vec!["v1", "v2", "v3"]);

    let leader = cluster.info(1).await;
    assert_eq!(leader.rep_factor, 4);
    assert_eq!(
        leader.cursors.get(&4).map(|c| c.status),
        Some(CursorStatus::Attached)
    );
    assert!(!leader.reconfig_in_progress);

    // New writes need two follower acks now and reach the new member.
    cluster.replica(1).write(b"v4".to_vec()).await.unwrap();
    cluster
        .wait_for(4, "post-expand write", |info| {
            info.status == ReplicaStatus::Follower && info.head_index == EntryId::new(2, 4)
        })
        .await;
    for node in [2, 3] {
        cluster
            .wait_for(node, "post-expand write", |info| {
                info.head_index == EntryId::new(2, 4)
            })
            .await;
    }
    cluster.assert_logs_identical(&[1, 2, 3, 4]);
}

#[tokio::test]
async fn node_swap_replaces_a_member() {
    let mut cluster = Cluster::start(&[1, 2, 3]).await;
    cluster.add_node(4);
    cluster.await_steady_term(1).await;

    cluster.replica(1).write(b"v1".to_vec()).await.unwrap();
    cluster.replica(1).write(b"v2".to_vec()).await.unwrap();
    cluster
        .wait_for(3, "pre-swap replication", |info| {
            info.head_index == EntryId::new(1, 2)
        })
        .await;

    cluster
        .coordinator()
        .reconfigure(ReconfigCommand::NodeSwap {
            old_node: 3,
            new_node: 4,
        })
        .await
        .unwrap();

    let metadata = cluster.await_steady_term(2).await;
    assert_eq!(
        metadata.ensemble.iter().copied().collect::<Vec<_>>(),
        vec![1, 2, 4]
    );
    assert_eq!(metadata.rep_factor, 3);

    let leader = cluster.info(1).await;
    assert_eq!(
        leader.cursors.keys().copied().collect::<Vec<_>>(),
        vec![2, 4]
    );

    // Replication continues to the new membership only.
    cluster.replica(1).write(b"v3".to_vec()).await.unwrap();
    for node in [2, 4] {
        cluster
            .wait_for(node, "post-swap write", |info| {
                info.head_index == EntryId::new(2, 3)
            })
            .await;
    }
    cluster.assert_logs_identical(&[1, 2, 4]);

    // The outgoing node is frozen where it was.
    let outgoing = cluster.info(3).await;
    assert_eq!(outgoing.term, 1);
    assert_eq!(outgoing.head_index, EntryId::new(1, 2));
}

#[tokio::test]
async fn contract_is_deferred_until_replication_catches_up() {
    let cluster = Cluster::start(&[1, 2, 3, 4, 5]).await;
    cluster.await_steady_term(1).await;

    cluster.replica(1).write(b"v1".to_vec()).await.unwrap();
    cluster.replica(1).write(b"v2".to_vec()).await.unwrap();
    cluster
        .wait_for(1, "all followers confirmed", |info| {
            info.cursors
                .values()
                .all(|c| c.last_confirmed == EntryId::new(1, 2))
        })
        .await;

    // Two followers fall behind; the next write still commits through the
    // remaining pair.
    cluster.fabric.partition(4);
    cluster.fabric.partition(5);
    cluster.replica(1).write(b"v3".to_vec()).await.unwrap();
    assert_eq!(cluster.info(1).await.commit_index, EntryId::new(1, 3));

    // Contracting away a follower that confirmed v3 would leave the
    // committed prefix short of a quorum, so the commit is refused and the
    // coordinator keeps retrying.
    let coordinator = cluster.coordinator().clone();
    let contract =
        tokio::spawn(async move { coordinator.reconfigure(ReconfigCommand::Contract { old_node: 3 }).await });

    cluster
        .wait_for(1, "outgoing cursor deactivated", |info| {
            info.cursors.get(&3).map(|c| c.status) == Some(CursorStatus::PendingRemoval)
        })
        .await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!contract.is_finished(), "contract must wait for catch-up");
    let (metadata, _) = cluster.metadata().await;
    assert_eq!(metadata.shard_status, ShardStatus::Reconfiguration);

    // Once the stragglers catch up, the removal is safe and goes through.
    cluster.fabric.heal(4);
    cluster.fabric.heal(5);
    contract.await.unwrap().unwrap();

    let metadata = cluster.await_steady_term(2).await;
    assert_eq!(
        metadata.ensemble.iter().copied().collect::<Vec<_>>(),
        vec![1, 2, 4, 5]
    );
    assert_eq!(metadata.rep_factor, 4);

    let leader = cluster.info(1).await;
    assert!(!leader.cursors.contains_key(&3));
    assert_eq!(leader.rep_factor, 4);
    assert!(!leader.reconfig_in_progress);

    // Commits keep flowing at the contracted quorum size.
    cluster.replica(1).write(b"v4".to_vec()).await.unwrap();
    for node in [2, 4, 5] {
        cluster
            .wait_for(node, "post-contract write", |info| {
                info.head_index == EntryId::new(2, 4)
            })
            .await;
    }
    cluster.assert_logs_identical(&[1, 2, 4, 5]);
}

#[tokio::test]
async fn contract_commits_immediately_when_the_prefix_stays_covered() {
    let cluster = Cluster::start(&[1, 2, 3, 4]).await;
    cluster.await_steady_term(1).await;

    cluster.replica(1).write(b"v1".to_vec()).await.unwrap();
    cluster
        .wait_for(1, "all followers confirmed", |info| {
            info.cursors
                .values()
                .all(|c| c.last_confirmed == EntryId::new(1, 1))
        })
        .await;

    cluster
        .coordinator()
        .reconfigure(ReconfigCommand::Contract { old_node: 4 })
        .await
        .unwrap();

    let metadata = cluster.await_steady_term(2).await;
    assert_eq!(
        metadata.ensemble.iter().copied().collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(metadata.rep_factor, 3);
    assert_eq!(cluster.info(1).await.commit_index, EntryId::new(1, 1));
}
