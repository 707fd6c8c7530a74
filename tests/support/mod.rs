//! Shared harness: an in-memory cluster wiring replicas together through
//! a loopback transport, with per-peer partitioning.

use parking_lot::Mutex;
use replicore::{
    CommitRule, ConsensusError, DirectRouter, InMemoryLog, LogCacheConfig, MetadataStore,
    PeerClient, PeerClientFactory, PeerSpec, PersistentVarsStore, QueueObserver, RaftConfig,
    Replica, ReplicaOptions, RpcError, TransferContext, UpdateRequest, UpdateResponse,
    VoteRequest, VoteResponse,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tempfile::TempDir;
use uuid::Uuid;

#[derive(Default)]
struct Fabric {
    replicas: HashMap<Uuid, Arc<Replica>>,
    partitioned: HashSet<Uuid>,
}

/// Delivers requests straight into the destination replica's public
/// operations. Partitioned peers time out in both directions.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    fabric: Arc<Mutex<Fabric>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, replica: Arc<Replica>) {
        self.fabric
            .lock()
            .replicas
            .insert(replica.local_uuid(), replica);
    }

    pub fn partition(&self, uuid: Uuid) {
        self.fabric.lock().partitioned.insert(uuid);
    }

    pub fn heal(&self, uuid: Uuid) {
        self.fabric.lock().partitioned.remove(&uuid);
    }

    fn reach(&self, dest: &Uuid) -> Result<Arc<Replica>, RpcError> {
        let fabric = self.fabric.lock();
        if fabric.partitioned.contains(dest) {
            return Err(RpcError::Timeout(*dest));
        }
        fabric
            .replicas
            .get(dest)
            .cloned()
            .ok_or(RpcError::NoClient(*dest))
    }
}

struct LoopbackClient {
    transport: LoopbackTransport,
    dest: Uuid,
}

impl PeerClient for LoopbackClient {
    fn update(
        &self,
        request: &UpdateRequest,
        _deadline: Instant,
    ) -> Result<UpdateResponse, RpcError> {
        let replica = self.transport.reach(&self.dest)?;
        Ok(replica.update(request, Instant::now()))
    }

    fn request_vote(
        &self,
        request: &VoteRequest,
        _deadline: Instant,
    ) -> Result<VoteResponse, RpcError> {
        let replica = self.transport.reach(&self.dest)?;
        Ok(replica.request_vote(request, Instant::now()))
    }
}

impl PeerClientFactory for LoopbackTransport {
    fn client_for(&self, peer: &PeerSpec) -> Result<Arc<dyn PeerClient>, RpcError> {
        Ok(Arc::new(LoopbackClient {
            transport: self.clone(),
            dest: peer.uuid,
        }))
    }
}

/// Records queue notifications for assertions and optionally forwards
/// start-election signals to the nominated successor.
#[derive(Default)]
pub struct RecordingObserver {
    pub commit_indexes: Mutex<Vec<u64>>,
    pub term_changes: Mutex<Vec<u64>>,
    pub failed_peers: Mutex<Vec<Uuid>>,
    pub promotable_peers: Mutex<Vec<Uuid>>,
    pub election_nominations: Mutex<Vec<Uuid>>,
    pub successor: Mutex<Option<Arc<Replica>>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn forward_elections_to(&self, replica: Arc<Replica>) {
        *self.successor.lock() = Some(replica);
    }
}

impl QueueObserver for RecordingObserver {
    fn on_commit_index_advanced(&self, committed_index: u64) {
        self.commit_indexes.lock().push(committed_index);
    }

    fn on_term_changed(&self, term: u64) {
        self.term_changes.lock().push(term);
    }

    fn on_peer_failed(&self, uuid: Uuid, _term: u64, _reason: &str) {
        self.failed_peers.lock().push(uuid);
    }

    fn on_peer_to_promote(&self, uuid: Uuid) {
        self.promotable_peers.lock().push(uuid);
    }

    fn on_peer_to_start_election(&self, uuid: Uuid, _transfer: Option<TransferContext>) {
        self.election_nominations.lock().push(uuid);
        let successor = self.successor.lock().clone();
        if let Some(replica) = successor {
            if replica.local_uuid() == uuid {
                let _ = replica.start_election(
                    replicore::ElectionMode::ElectEvenIfLeaderIsAlive,
                    Instant::now(),
                );
            }
        }
    }

    fn on_peer_health_changed(&self) {}
}

pub struct Cluster {
    pub transport: LoopbackTransport,
    pub replicas: Vec<Arc<Replica>>,
    pub uuids: Vec<Uuid>,
    _dirs: Vec<TempDir>,
}

impl Cluster {
    /// Builds and starts a cluster of `regions.len()` voters, one per
    /// listed region (`None` regions give a classic-majority layout).
    pub fn new(regions: &[Option<&str>], commit_rule: CommitRule) -> Result<Self, ConsensusError> {
        let uuids: Vec<Uuid> = regions.iter().map(|_| Uuid::new_v4()).collect();
        let peers: Vec<PeerSpec> = uuids
            .iter()
            .zip(regions)
            .enumerate()
            .map(|(i, (uuid, region))| PeerSpec::voter(*uuid, format!("peer-{}:7000", i), *region))
            .collect();
        let config = RaftConfig::new(peers, commit_rule);
        Self::from_config(config, &uuids)
    }

    pub fn from_config(config: RaftConfig, uuids: &[Uuid]) -> Result<Self, ConsensusError> {
        let transport = LoopbackTransport::new();
        let mut replicas = Vec::new();
        let mut dirs = Vec::new();
        let now = Instant::now();
        for uuid in uuids {
            let dir = TempDir::new().expect("tempdir");
            let options = ReplicaOptions {
                group_id: "group-checkpoint".into(),
                pre_elections: false,
                ..ReplicaOptions::default()
            };
            let local = config
                .peer(uuid)
                .cloned()
                .expect("uuid must be in the config");
            let replica = Replica::new(
                options,
                local,
                config.clone(),
                MetadataStore::new(dir.path().join("consensus-meta.json")),
                PersistentVarsStore::new(dir.path().join("persistent-vars.json")),
                InMemoryLog::new(),
                LogCacheConfig::default(),
                Arc::new(transport.clone()),
                Arc::new(DirectRouter),
                now,
            )?;
            transport.register(replica.clone());
            replicas.push(replica);
            dirs.push(dir);
        }
        for replica in &replicas {
            replica.start(now)?;
        }
        Ok(Self {
            transport,
            replicas,
            uuids: uuids.to_vec(),
            _dirs: dirs,
        })
    }

    pub fn replica(&self, index: usize) -> &Arc<Replica> {
        &self.replicas[index]
    }

    /// Elects `index` by starting a real election and pumping one round of
    /// exchanges so followers learn the outcome.
    pub fn elect(&self, index: usize) {
        let now = Instant::now();
        self.replicas[index]
            .start_election(replicore::ElectionMode::NormalElection, now)
            .expect("election start");
        assert!(self.replicas[index].is_leader(), "election not won");
        self.pump(index);
    }

    /// Runs leader exchanges with every peer until the cluster stops
    /// making progress, bounded so a wedged cluster fails fast instead of
    /// hanging the test.
    pub fn pump(&self, leader: usize) {
        let replica = &self.replicas[leader];
        let mut settled = false;
        for _ in 0..64 {
            let now = Instant::now();
            if !replica.is_leader() {
                return;
            }
            for uuid in &self.uuids {
                if *uuid == replica.local_uuid() {
                    continue;
                }
                let _ = replica.run_peer_exchange(uuid, now);
            }
            replica.tick(now);
            if settled {
                break;
            }
            let snapshot = replica.queue_snapshot();
            // One extra round after convergence carries the final committed
            // index out to the followers.
            settled = snapshot.all_replicated_index == snapshot.last_appended.index;
        }
    }
}
