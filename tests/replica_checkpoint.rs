mod support;

use replicore::{
    ChangeConfigRequest, CommitRule, ConfigChangeOp, ConsensusError, DirectRouter, ElectionMode,
    InMemoryLog, LogCacheConfig, Membership, MetadataStore, OpId, OpType, PeerSpec,
    PersistentVarsStore, RaftConfig, RaftRole, Replica, ReplicaOptions, ReplicateMsg,
    UpdateRequest,
};
use std::sync::Arc;
use std::time::Instant;
use support::{Cluster, LoopbackTransport, RecordingObserver};
use tempfile::TempDir;
use uuid::Uuid;

fn classic(count: usize) -> Cluster {
    let regions: Vec<Option<&str>> = (0..count).map(|_| None).collect();
    Cluster::new(&regions, CommitRule::ClassicMajority).expect("cluster")
}

#[test]
fn single_voter_elects_itself_and_commits_the_noop() {
    let cluster = classic(1);
    let replica = cluster.replica(0);

    // Startup alone is enough: leader of term 1 with the no-op committed.
    assert!(replica.is_leader());
    assert_eq!(replica.current_term(), 1);
    assert_eq!(replica.leader_uuid(), Some(replica.local_uuid()));

    let snapshot = replica.consensus_state();
    assert_eq!(snapshot.last_appended, OpId::new(1, 1));
    assert_eq!(snapshot.committed_index, 1);
    assert_eq!(snapshot.role, RaftRole::Leader);
}

#[test]
fn three_voter_happy_path_commits_at_majority() {
    let cluster = classic(3);
    cluster.elect(0);
    let leader = cluster.replica(0);
    let now = Instant::now();

    // Stage: C partitioned, so only the leader and B make up the quorum.
    cluster.transport.partition(cluster.uuids[2]);
    for payload in [b"op-a".to_vec(), b"op-b".to_vec(), b"op-c".to_vec()] {
        leader.replicate(payload, now).unwrap();
    }
    cluster.pump(0);

    // Majority (leader + B) carries everything: committed advances to the
    // tail even though C has nothing.
    let snapshot = leader.queue_snapshot();
    assert_eq!(snapshot.last_appended.index, 4);
    assert_eq!(leader.committed_index(), 4);
    assert!(snapshot.all_replicated_index < 4);

    // C heals and catches up; the all-replicated watermark follows.
    cluster.transport.heal(cluster.uuids[2]);
    cluster.pump(0);
    assert_eq!(leader.queue_snapshot().all_replicated_index, 4);
    assert_eq!(cluster.replica(2).committed_index(), 4);
    assert_eq!(
        cluster.replica(1).consensus_state().last_appended,
        cluster.replica(2).consensus_state().last_appended
    );
}

#[test]
fn two_voters_with_one_down_cannot_commit() {
    let cluster = classic(2);
    cluster.elect(0);
    let leader = cluster.replica(0);
    cluster.pump(0);
    assert_eq!(leader.committed_index(), 1, "no-op commits while both are up");

    cluster.transport.partition(cluster.uuids[1]);
    let now = Instant::now();
    leader.replicate(b"stranded-1".to_vec(), now).unwrap();
    leader.replicate(b"stranded-2".to_vec(), now).unwrap();
    cluster.pump(0);

    // The pending set grows but nothing new commits.
    let snapshot = leader.consensus_state();
    assert_eq!(snapshot.last_appended, OpId::new(1, 3));
    assert_eq!(snapshot.committed_index, 1);
}

#[test]
fn log_matching_conflict_truncates_the_divergent_suffix() {
    let cluster = classic(3);
    cluster.elect(0);
    let leader = cluster.replica(0);
    let now = Instant::now();
    leader.replicate(b"one".to_vec(), now).unwrap();
    leader.replicate(b"two".to_vec(), now).unwrap();
    cluster.pump(0);
    assert_eq!(cluster.replica(2).committed_index(), 3);

    // A rogue leader of term 5 feeds C two uncommitted entries that the
    // rest of the cluster never sees.
    let rogue = Uuid::new_v4();
    let follower = cluster.replica(2);
    let response = follower.update(
        &UpdateRequest {
            group_id: "group-checkpoint".into(),
            caller_uuid: rogue,
            caller_term: 5,
            dest_uuid: follower.local_uuid(),
            preceding_op: OpId::new(1, 3),
            ops: vec![
                ReplicateMsg::new(OpId::new(5, 4), OpType::Data, b"ghost-4".to_vec()),
                ReplicateMsg::new(OpId::new(5, 5), OpType::Data, b"ghost-5".to_vec()),
            ],
            committed_index: 3,
            all_replicated_index: 3,
            region_durable_index: 0,
            safe_timestamp: None,
        },
        Instant::now(),
    );
    assert!(response.is_success());
    assert_eq!(response.last_received, OpId::new(5, 5));

    // With A unreachable, B's first attempt is cancelled by C's higher
    // term, which B adopts.
    let new_leader = cluster.replica(1);
    let now = Instant::now();
    cluster.transport.partition(cluster.uuids[0]);
    new_leader
        .start_election(ElectionMode::NormalElection, now)
        .unwrap();
    assert!(!new_leader.is_leader());
    assert_eq!(new_leader.current_term(), 5);

    // The retry wins term 6 with A's vote; C still refuses because it just
    // heard from its (rogue) leader.
    cluster.transport.heal(cluster.uuids[0]);
    new_leader
        .start_election(ElectionMode::NormalElection, now)
        .unwrap();
    assert!(new_leader.is_leader());
    assert_eq!(new_leader.current_term(), 6);
    assert_eq!(
        new_leader.consensus_state().last_appended,
        OpId::new(6, 4),
        "term-opening no-op lands at index 4"
    );

    // Replication overwrites C's ghost entries and converges everyone.
    cluster.pump(1);
    let c_state = cluster.replica(2).consensus_state();
    assert_eq!(c_state.last_appended, OpId::new(6, 4));
    assert_eq!(c_state.committed_index, 4);
    assert_eq!(new_leader.committed_index(), 4);
}

#[test]
fn duplicate_update_requests_are_idempotent() {
    let dir = TempDir::new().unwrap();
    let transport = LoopbackTransport::new();
    let local = Uuid::new_v4();
    let leader = Uuid::new_v4();
    let config = RaftConfig::new(
        vec![
            PeerSpec::voter(local, "a:1", None),
            PeerSpec::voter(leader, "b:1", None),
        ],
        CommitRule::ClassicMajority,
    );
    let replica = Replica::new(
        ReplicaOptions {
            group_id: "group-checkpoint".into(),
            ..ReplicaOptions::default()
        },
        config.peer(&local).unwrap().clone(),
        config,
        MetadataStore::new(dir.path().join("meta.json")),
        PersistentVarsStore::new(dir.path().join("vars.json")),
        InMemoryLog::new(),
        LogCacheConfig::default(),
        Arc::new(transport),
        Arc::new(DirectRouter),
        Instant::now(),
    )
    .unwrap();
    replica.start(Instant::now()).unwrap();

    let request = UpdateRequest {
        group_id: "group-checkpoint".into(),
        caller_uuid: leader,
        caller_term: 1,
        dest_uuid: local,
        preceding_op: OpId::GENESIS,
        ops: vec![
            ReplicateMsg::new(OpId::new(1, 1), OpType::Data, b"first".to_vec()),
            ReplicateMsg::new(OpId::new(1, 2), OpType::Data, b"second".to_vec()),
        ],
        committed_index: 1,
        all_replicated_index: 0,
        region_durable_index: 0,
        safe_timestamp: None,
    };
    let first = replica.update(&request, Instant::now());
    assert!(first.is_success());
    assert_eq!(first.last_received, OpId::new(1, 2));
    assert_eq!(first.last_committed_index, 1);

    let replay = replica.update(&request, Instant::now());
    assert!(replay.is_success());
    assert_eq!(replay.last_received, first.last_received);
    assert_eq!(replay.last_committed_index, first.last_committed_index);
    assert_eq!(replica.consensus_state().last_appended, OpId::new(1, 2));
}

#[test]
fn graceful_transfer_hands_leadership_to_the_target() {
    let cluster = classic(3);
    cluster.elect(0);
    let old_leader = cluster.replica(0);
    let successor = cluster.replica(1).clone();
    let now = Instant::now();
    for i in 0..3 {
        old_leader.replicate(format!("op-{}", i).into_bytes(), now).unwrap();
    }
    cluster.pump(0);
    let committed = old_leader.committed_index();

    let observer = RecordingObserver::new();
    observer.forward_elections_to(successor.clone());
    old_leader.register_observer(observer.clone());

    old_leader
        .transfer_leadership(Some(successor.local_uuid()), None, now)
        .unwrap();

    // New rounds are refused for the duration of the transfer.
    let err = old_leader.replicate(b"rejected".to_vec(), now).unwrap_err();
    assert!(matches!(err, ConsensusError::ServiceUnavailable(_)));

    // Replication continues; once the target has caught up it is told to
    // start an election and wins the next term.
    cluster.pump(0);
    assert_eq!(
        observer.election_nominations.lock().as_slice(),
        &[successor.local_uuid()]
    );
    assert!(successor.is_leader());
    assert_eq!(successor.current_term(), 2);
    assert!(!old_leader.is_leader());
    assert_eq!(
        successor.consensus_state().last_appended,
        OpId::new(2, committed + 1),
        "the new leader opens its term with a no-op"
    );
}

#[test]
fn cancelling_a_transfer_restores_the_leader() {
    let cluster = classic(3);
    cluster.elect(0);
    let leader = cluster.replica(0);
    let now = Instant::now();
    cluster.transport.partition(cluster.uuids[1]);
    cluster.transport.partition(cluster.uuids[2]);

    leader
        .transfer_leadership(Some(cluster.uuids[1]), None, now)
        .unwrap();
    assert!(leader.replicate(b"blocked".to_vec(), now).is_err());

    leader.cancel_transfer().unwrap();
    assert!(leader.replicate(b"accepted".to_vec(), now).is_ok());
    assert!(matches!(
        leader.cancel_transfer(),
        Err(ConsensusError::IllegalState(_))
    ));
}

#[test]
fn config_change_adds_a_peer_and_commits_through_the_log() {
    let cluster = classic(3);
    cluster.elect(0);
    let leader = cluster.replica(0);
    cluster.pump(0);
    let now = Instant::now();

    let newcomer = PeerSpec::non_voter(Uuid::new_v4(), "learner:7000", None);
    let cas = leader.committed_config().opid_index;
    leader
        .change_config(
            ChangeConfigRequest {
                op: ConfigChangeOp::AddPeer(newcomer.clone()),
                cas_config_opid_index: cas,
            },
            now,
        )
        .unwrap();
    assert!(leader.pending_config().is_some());

    // A second change is rejected while the first is in flight.
    let err = leader
        .change_config(
            ChangeConfigRequest {
                op: ConfigChangeOp::RemovePeer(cluster.uuids[2]),
                cas_config_opid_index: None,
            },
            now,
        )
        .unwrap_err();
    assert!(matches!(err, ConsensusError::PendingConfigChange { .. }));

    cluster.pump(0);
    assert!(leader.pending_config().is_none());
    let committed = leader.committed_config();
    assert!(committed.is_member(&newcomer.uuid));
    assert!(!committed.is_voter(&newcomer.uuid));
}

#[test]
fn leader_cannot_remove_or_demote_itself() {
    let cluster = classic(3);
    cluster.elect(0);
    cluster.pump(0);
    let leader = cluster.replica(0);
    let now = Instant::now();

    let err = leader
        .change_config(
            ChangeConfigRequest {
                op: ConfigChangeOp::RemovePeer(leader.local_uuid()),
                cas_config_opid_index: None,
            },
            now,
        )
        .unwrap_err();
    assert!(matches!(err, ConsensusError::InvalidConfig(_)));

    let err = leader
        .change_config(
            ChangeConfigRequest {
                op: ConfigChangeOp::SetMembership {
                    uuid: leader.local_uuid(),
                    membership: Membership::NonVoter,
                },
                cas_config_opid_index: None,
            },
            now,
        )
        .unwrap_err();
    assert!(matches!(err, ConsensusError::InvalidConfig(_)));
}

#[test]
fn stale_cas_index_fails_the_config_change() {
    let cluster = classic(3);
    cluster.elect(0);
    cluster.pump(0);
    let leader = cluster.replica(0);

    let err = leader
        .change_config(
            ChangeConfigRequest {
                op: ConfigChangeOp::RemovePeer(cluster.uuids[2]),
                cas_config_opid_index: Some(9_999),
            },
            Instant::now(),
        )
        .unwrap_err();
    assert!(matches!(err, ConsensusError::CasFailed { .. }));
}

#[test]
fn replicate_outside_leadership_is_rejected() {
    let cluster = classic(3);
    cluster.elect(0);
    let follower = cluster.replica(1);
    let err = follower
        .replicate(b"misdirected".to_vec(), Instant::now())
        .unwrap_err();
    assert!(matches!(err, ConsensusError::IllegalState(_)));
}

#[test]
fn memory_pressure_rejects_follower_batches() {
    let cluster = classic(3);
    cluster.elect(0);
    cluster.pump(0);
    let follower = cluster.replica(1);
    follower.set_memory_pressure_fn(|| true);

    let leader = cluster.replica(0);
    let now = Instant::now();
    leader.replicate(b"pressured".to_vec(), now).unwrap();
    cluster.pump(0);

    // The follower refused the batch; only the healthy peer carries it.
    assert!(cluster.replica(1).consensus_state().last_appended.index < 2);
    assert_eq!(cluster.replica(2).consensus_state().last_appended.index, 2);
}
