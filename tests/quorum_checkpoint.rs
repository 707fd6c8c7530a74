mod support;

use replicore::{
    CommitRule, DirectRouter, LogCache, LogCacheConfig, OpId, OpType, PeerSpec, QueueNotification,
    RaftConfig, ReplicateMsg, ReplicationQueue, RpcError, RulePredicate, UpdateResponse,
};
use std::sync::Arc;
use std::time::Instant;
use support::Cluster;
use uuid::Uuid;

struct Ring {
    queue: ReplicationQueue,
    peers: Vec<(Uuid, &'static str)>,
}

/// A leader-mode queue over voters laid out as `(region, count)` with the
/// leader as the first voter of the first region, plus the declared voter
/// distribution.
fn ring(layout: &[(&'static str, usize)], rule: CommitRule) -> Ring {
    let now = Instant::now();
    let mut peers = Vec::new();
    let mut specs = Vec::new();
    for (region, count) in layout {
        for i in 0..*count {
            let uuid = Uuid::new_v4();
            peers.push((uuid, *region));
            specs.push(PeerSpec::voter(
                uuid,
                format!("{region}-{i}:7000"),
                Some(region),
            ));
        }
    }
    let mut config = RaftConfig::new(specs, rule);
    for (region, count) in layout {
        config.voter_distribution.insert(region.to_string(), *count);
    }
    let local = config.peers[0].clone();
    let reader: Arc<dyn replicore::LogReader> = replicore::InMemoryLog::new();
    let cache = LogCache::new(LogCacheConfig::default(), reader);
    let mut queue = ReplicationQueue::new(
        "group-quorum",
        local,
        cache,
        Arc::new(DirectRouter),
        OpId::GENESIS,
        0,
        now,
    );
    queue.set_leader_mode(0, 7, config, now);
    Ring { queue, peers }
}

fn ack(queue: &mut ReplicationQueue, uuid: Uuid, id: OpId) {
    let outcome: Result<UpdateResponse, RpcError> = Ok(UpdateResponse {
        responder_uuid: uuid,
        responder_term: 7,
        last_received: id,
        last_received_current_leader: id,
        last_committed_index: 0,
        error: None,
    });
    queue.response_from_peer(&uuid, &outcome, Instant::now());
}

#[test]
fn single_region_dynamic_commits_on_the_leader_region_majority() {
    // Voter distribution r1:3, r2:2, r3:2; the leader sits in r1.
    let mut ring = ring(
        &[("r1", 3), ("r2", 2), ("r3", 2)],
        CommitRule::SingleRegionDynamic,
    );
    let now = Instant::now();
    let op = ReplicateMsg::new(OpId::new(7, 1), OpType::Data, b"payload".to_vec());
    ring.queue.append_operation(op).unwrap();
    ring.queue
        .local_peer_append_finished(OpId::new(7, 1), now);
    assert_eq!(ring.queue.committed_index(), 0);

    // A second r1 voter suffices: two of three in the leader's region.
    let (second_r1, _) = ring.peers[1];
    ack(&mut ring.queue, second_r1, OpId::new(7, 1));
    assert_eq!(ring.queue.committed_index(), 1);

    // No remote region has the op yet.
    assert_eq!(ring.queue.region_durable_index(), 0);

    // The first r2 ack makes the op region-durable.
    let (r2_voter, _) = ring.peers[3];
    ack(&mut ring.queue, r2_voter, OpId::new(7, 1));
    assert_eq!(ring.queue.region_durable_index(), 1);

    let notifications = ring.queue.take_notifications();
    assert!(notifications
        .iter()
        .any(|n| matches!(n, QueueNotification::CommitIndexAdvanced(1))));
}

#[test]
fn static_conjunction_needs_every_predicate() {
    let rule = CommitRule::StaticConjunction(vec![
        RulePredicate {
            regions: vec!["r1".into()],
            regions_subset_size: 1,
        },
        RulePredicate {
            regions: vec!["r2".into()],
            regions_subset_size: 1,
        },
    ]);
    let mut ring = ring(&[("r1", 2), ("r2", 2)], rule);
    let now = Instant::now();
    let op = ReplicateMsg::new(OpId::new(7, 1), OpType::Data, b"x".to_vec());
    ring.queue.append_operation(op).unwrap();
    ring.queue
        .local_peer_append_finished(OpId::new(7, 1), now);

    // The r1 majority alone satisfies only the first predicate.
    let (r1_partner, _) = ring.peers[1];
    ack(&mut ring.queue, r1_partner, OpId::new(7, 1));
    assert_eq!(ring.queue.committed_index(), 0);

    // Both r2 voters complete the conjunction.
    let (r2_a, _) = ring.peers[2];
    let (r2_b, _) = ring.peers[3];
    ack(&mut ring.queue, r2_a, OpId::new(7, 1));
    assert_eq!(ring.queue.committed_index(), 0, "r2 majority is 2 of 2");
    ack(&mut ring.queue, r2_b, OpId::new(7, 1));
    assert_eq!(ring.queue.committed_index(), 1);
}

#[test]
fn static_disjunction_commits_on_the_first_satisfied_predicate() {
    let rule = CommitRule::StaticDisjunction(vec![
        RulePredicate {
            regions: vec!["r1".into()],
            regions_subset_size: 1,
        },
        RulePredicate {
            regions: vec!["r2".into(), "r3".into()],
            regions_subset_size: 2,
        },
    ]);
    let mut ring = ring(&[("r1", 2), ("r2", 1), ("r3", 1)], rule);
    let now = Instant::now();
    let op = ReplicateMsg::new(OpId::new(7, 1), OpType::Data, b"x".to_vec());
    ring.queue.append_operation(op).unwrap();
    ring.queue
        .local_peer_append_finished(OpId::new(7, 1), now);

    // The leader's own region majority satisfies the first predicate.
    let (r1_partner, _) = ring.peers[1];
    ack(&mut ring.queue, r1_partner, OpId::new(7, 1));
    assert_eq!(ring.queue.committed_index(), 1);
}

#[test]
fn flexible_cluster_elects_and_commits_within_the_leader_region() {
    // Two voters in r1, one in r2, single-region-dynamic commits.
    let cluster = Cluster::new(
        &[Some("r1"), Some("r1"), Some("r2")],
        CommitRule::SingleRegionDynamic,
    )
    .expect("cluster");
    cluster.elect(0);
    let leader = cluster.replica(0);
    cluster.pump(0);
    assert_eq!(leader.committed_index(), 1);

    // With r2 unreachable, the r1 majority still commits new operations.
    cluster.transport.partition(cluster.uuids[2]);
    let now = Instant::now();
    leader.replicate(b"regional".to_vec(), now).unwrap();
    cluster.pump(0);
    assert_eq!(leader.committed_index(), 2);
    let before_heal = leader.queue_snapshot().region_durable_index;
    assert!(before_heal < 2, "no other region holds the op yet");

    // Healing r2 advances the region-durable watermark.
    cluster.transport.heal(cluster.uuids[2]);
    cluster.pump(0);
    assert_eq!(leader.queue_snapshot().region_durable_index, 2);
}
