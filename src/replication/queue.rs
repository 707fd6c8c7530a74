use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::consensus::config::{PeerSpec, RaftConfig};
use crate::consensus::{OpId, ReplicateMsg};
use crate::error::ConsensusError;
use crate::replication::cache::{CacheError, LogCache};
use crate::replication::quorum::{
    compute_majority_watermark, compute_region_durable_index, VoterProgress,
};
use crate::replication::router::Router;
use crate::rpc::{PeerStatus, RpcError, UpdateRequest, UpdateResponse};
use crate::timeouts;

/// How far behind the committed index a promotable non-voter may be while
/// still counting as caught up.
const PROMOTION_MAX_OPS_BEHIND: u64 = 100;

/// A follower that has not been heard from for this long is reported
/// failed.
const PEER_FAILURE_THRESHOLD: Duration = Duration::from_secs(300);

/// Overall health of a tracked peer, derived from its exchange history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Failed,
    /// Failed and unable to catch up from our log; needs a full copy.
    FailedUnrecoverable,
}

/// Replication bookkeeping for one peer.
#[derive(Debug, Clone)]
pub struct TrackedPeer {
    pub spec: PeerSpec,
    /// Next log index to send. Never below 1.
    pub next_index: u64,
    /// Last operation the peer acknowledged. Drives watermark movement.
    pub last_received: OpId,
    pub last_known_committed_index: u64,
    pub last_exchange_status: PeerStatus,
    pub last_communication_time: Instant,
    pub wal_catchup_possible: bool,
    pub last_overall_health_status: HealthStatus,
    last_seen_term: u64,
}

impl TrackedPeer {
    fn new(spec: PeerSpec, next_index: u64, now: Instant) -> Self {
        Self {
            spec,
            next_index: next_index.max(1),
            last_received: OpId::GENESIS,
            last_known_committed_index: 0,
            last_exchange_status: PeerStatus::New,
            last_communication_time: now,
            wal_catchup_possible: true,
            last_overall_health_status: HealthStatus::Unknown,
            last_seen_term: 0,
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.spec.uuid
    }

    /// Terms observed from a peer only ever increase.
    fn check_monotonic_terms(&mut self, term: u64) {
        assert!(
            term >= self.last_seen_term,
            "peer {} term went backwards: {} -> {}",
            self.spec.uuid,
            self.last_seen_term,
            term
        );
        self.last_seen_term = term;
    }

    fn health(&self, now: Instant) -> HealthStatus {
        if !self.wal_catchup_possible
            || self.last_exchange_status == PeerStatus::ReplicaFailed
        {
            return HealthStatus::FailedUnrecoverable;
        }
        if self.last_exchange_status == PeerStatus::New {
            return HealthStatus::Unknown;
        }
        if now.saturating_duration_since(self.last_communication_time) > PEER_FAILURE_THRESHOLD {
            return HealthStatus::Failed;
        }
        match self.last_exchange_status {
            PeerStatus::Ok | PeerStatus::LmpMismatch => HealthStatus::Healthy,
            _ => HealthStatus::Failed,
        }
    }
}

/// Why and for whom a leadership transfer is in progress; handed back with
/// the start-election notification.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub original_start_time: Instant,
    pub original_uuid: Uuid,
    pub is_origin_dead_promotion: bool,
}

/// Notifications the queue emits. They are buffered inside the queue and
/// must be drained and dispatched by the owner after releasing the queue
/// lock; observer code never runs under it.
#[derive(Debug, Clone)]
pub enum QueueNotification {
    CommitIndexAdvanced(u64),
    TermChanged(u64),
    PeerFailed {
        uuid: Uuid,
        term: u64,
        reason: String,
    },
    PeerToPromote(Uuid),
    PeerToStartElection {
        uuid: Uuid,
        transfer: Option<TransferContext>,
    },
    PeerHealthChanged,
}

/// The queue-to-replica notification surface. All methods are invoked
/// outside the queue lock; implementations may re-enter the replica but
/// must not call back into the queue.
pub trait QueueObserver: Send + Sync {
    fn on_commit_index_advanced(&self, committed_index: u64);
    fn on_term_changed(&self, term: u64);
    fn on_peer_failed(&self, uuid: Uuid, term: u64, reason: &str);
    fn on_peer_to_promote(&self, uuid: Uuid);
    fn on_peer_to_start_election(&self, uuid: Uuid, transfer: Option<TransferContext>);
    fn on_peer_health_changed(&self);
}

/// Dispatches drained notifications to an observer, in order.
pub fn dispatch_notifications(observer: &dyn QueueObserver, notifications: Vec<QueueNotification>) {
    for notification in notifications {
        match notification {
            QueueNotification::CommitIndexAdvanced(index) => {
                observer.on_commit_index_advanced(index)
            }
            QueueNotification::TermChanged(term) => observer.on_term_changed(term),
            QueueNotification::PeerFailed { uuid, term, reason } => {
                observer.on_peer_failed(uuid, term, &reason)
            }
            QueueNotification::PeerToPromote(uuid) => observer.on_peer_to_promote(uuid),
            QueueNotification::PeerToStartElection { uuid, transfer } => {
                observer.on_peer_to_start_election(uuid, transfer)
            }
            QueueNotification::PeerHealthChanged => observer.on_peer_health_changed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueueMode {
    Leader,
    NonLeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueLifecycle {
    Open,
    Closed,
}

/// What to do for a peer: ship a batch via `next_hop`, or tell it to fetch
/// a full replica copy because our log no longer reaches back far enough.
#[derive(Debug)]
pub enum PeerRequest {
    NeedsCopy,
    Update { request: UpdateRequest, next_hop: Uuid },
}

/// Diagnostic snapshot of the queue's indexes and mode.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub all_replicated_index: u64,
    pub majority_replicated_index: u64,
    pub committed_index: u64,
    pub region_durable_index: u64,
    pub last_idx_appended_to_leader: u64,
    pub last_appended: OpId,
    pub current_term: u64,
    pub first_index_in_current_term: Option<u64>,
    pub majority_size: usize,
    pub mode: QueueMode,
    pub tracked_peers: usize,
}

struct QueueState {
    all_replicated_index: u64,
    majority_replicated_index: u64,
    committed_index: u64,
    region_durable_index: u64,
    last_idx_appended_to_leader: u64,
    last_appended: OpId,
    current_term: u64,
    first_index_in_current_term: Option<u64>,
    majority_size: usize,
    mode: QueueMode,
    lifecycle: QueueLifecycle,
    active_config: Option<RaftConfig>,
}

type SuccessorFilter = Box<dyn Fn(&PeerSpec) -> bool + Send + Sync>;

/// Tracks per-peer progress, owns the log cache, computes the replication
/// watermarks under the active commit rule, and buffers observer
/// notifications. The owner serializes access (this is the queue lock) and
/// drains notifications after releasing it.
pub struct ReplicationQueue {
    group_id: String,
    local_uuid: Uuid,
    peers: HashMap<Uuid, TrackedPeer>,
    state: QueueState,
    cache: LogCache,
    router: Arc<dyn Router>,
    notifications: Vec<QueueNotification>,
    adjust_voter_distribution: bool,
    successor_watch_in_progress: bool,
    designated_successor: Option<Uuid>,
    successor_filter: Option<SuccessorFilter>,
    transfer_context: Option<TransferContext>,
    successor_notified: bool,
    proxy_failure_threshold: Duration,
    proxy_failure_threshold_lag: u64,
}

impl ReplicationQueue {
    pub fn new(
        group_id: impl Into<String>,
        local_peer: PeerSpec,
        cache: LogCache,
        router: Arc<dyn Router>,
        last_appended: OpId,
        committed_index: u64,
        now: Instant,
    ) -> Self {
        let local_uuid = local_peer.uuid;
        let mut local = TrackedPeer::new(local_peer, last_appended.index + 1, now);
        local.last_received = last_appended;
        local.last_known_committed_index = committed_index;
        let mut peers = HashMap::new();
        peers.insert(local_uuid, local);
        Self {
            group_id: group_id.into(),
            local_uuid,
            peers,
            state: QueueState {
                all_replicated_index: 0,
                majority_replicated_index: 0,
                committed_index,
                region_durable_index: 0,
                last_idx_appended_to_leader: 0,
                last_appended,
                current_term: last_appended.term,
                first_index_in_current_term: None,
                majority_size: 0,
                mode: QueueMode::NonLeader,
                lifecycle: QueueLifecycle::Open,
                active_config: None,
            },
            cache,
            router,
            notifications: Vec::new(),
            adjust_voter_distribution: true,
            successor_watch_in_progress: false,
            designated_successor: None,
            successor_filter: None,
            transfer_context: None,
            successor_notified: false,
            proxy_failure_threshold: timeouts::PROXY_FAILURE_THRESHOLD,
            proxy_failure_threshold_lag: timeouts::PROXY_FAILURE_THRESHOLD_LAG,
        }
    }

    /// Switches to LEADER semantics: track exactly the peers of
    /// `active_config`, reset the majority size, and start advancing
    /// watermarks and emitting notifications.
    pub fn set_leader_mode(
        &mut self,
        committed_index: u64,
        current_term: u64,
        active_config: RaftConfig,
        now: Instant,
    ) {
        assert_eq!(
            self.state.lifecycle,
            QueueLifecycle::Open,
            "queue is closed"
        );
        assert!(
            current_term >= self.state.current_term,
            "leader term {} behind queue term {}",
            current_term,
            self.state.current_term
        );
        assert!(
            committed_index >= self.state.committed_index,
            "leader mode committed index regression"
        );
        info!(
            "event=queue_leader_mode group={} term={} committed_index={} voters={}",
            self.group_id,
            current_term,
            committed_index,
            active_config.voter_count()
        );
        self.state.mode = QueueMode::Leader;
        self.state.current_term = current_term;
        self.state.committed_index = committed_index;
        self.state.majority_replicated_index = committed_index;
        self.state.first_index_in_current_term = None;
        self.state.majority_size = active_config.majority_size();

        // Drain prior per-peer state and rebuild from the config.
        let local = self
            .peers
            .remove(&self.local_uuid)
            .expect("local peer must be tracked");
        self.peers.clear();
        self.peers.insert(self.local_uuid, local);
        let peer_specs: Vec<PeerSpec> = active_config
            .peers
            .iter()
            .filter(|spec| spec.uuid != self.local_uuid)
            .cloned()
            .collect();
        self.state.active_config = Some(active_config);
        for spec in peer_specs {
            self.track_peer(spec, now);
        }
        self.check_peers_in_active_config();
    }

    /// Switches to NON_LEADER semantics. Watermark advancement and observer
    /// notifications stop, but peers stay tracked so the cache keeps the
    /// operations they still need.
    pub fn set_non_leader_mode(&mut self, active_config: RaftConfig) {
        info!(
            "event=queue_non_leader_mode group={} term={}",
            self.group_id, self.state.current_term
        );
        self.state.mode = QueueMode::NonLeader;
        self.state.majority_size = 0;
        self.state.active_config = Some(active_config);
        self.end_watch_for_successor();
    }

    pub fn track_peer(&mut self, spec: PeerSpec, now: Instant) {
        assert_eq!(self.state.lifecycle, QueueLifecycle::Open, "queue is closed");
        let uuid = spec.uuid;
        let next_index = self.state.last_appended.index + 1;
        self.peers
            .entry(uuid)
            .or_insert_with(|| TrackedPeer::new(spec, next_index, now));
        self.check_peers_in_active_config();
    }

    pub fn untrack_peer(&mut self, uuid: &Uuid) {
        self.peers.remove(uuid);
    }

    pub fn find_peer(&self, uuid: &Uuid) -> Option<&TrackedPeer> {
        self.peers.get(uuid)
    }

    pub fn tracked_peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Appends an operation for replication. Ids must strictly follow the
    /// previous append with a contiguous index.
    pub fn append_operation(&mut self, msg: Arc<ReplicateMsg>) -> Result<(), ConsensusError> {
        if self.state.lifecycle != QueueLifecycle::Open {
            return Err(ConsensusError::IllegalState("queue is closed".into()));
        }
        let id = msg.id();
        if !(id > self.state.last_appended && id.index == self.state.last_appended.index + 1) {
            return Err(ConsensusError::IllegalState(format!(
                "append {} does not follow {}",
                id, self.state.last_appended
            )));
        }
        if id.term > self.state.current_term {
            self.state.current_term = id.term;
            self.state.first_index_in_current_term = None;
        }
        if id.term == self.state.current_term && self.state.first_index_in_current_term.is_none() {
            self.state.first_index_in_current_term = Some(id.index);
        }
        self.state.last_appended = id;
        self.cache.append(msg);
        Ok(())
    }

    /// Called when the local log reports the operation durable. The local
    /// peer's acknowledgement participates in quorums like any other.
    pub fn local_peer_append_finished(&mut self, id: OpId, now: Instant) {
        let local_uuid = self.local_uuid;
        if let Some(local) = self.peers.get_mut(&local_uuid) {
            if id > local.last_received {
                local.last_received = id;
                local.next_index = id.index + 1;
                local.last_exchange_status = PeerStatus::Ok;
                local.last_communication_time = now;
            }
        }
        if self.state.mode == QueueMode::Leader {
            self.advance_watermarks();
        }
    }

    /// Truncates the queue and cache after `index`; `new_last_appended` is
    /// the id now at the log tail.
    pub fn truncate_after(&mut self, index: u64, new_last_appended: OpId) {
        assert_eq!(new_last_appended.index, index, "truncation tail mismatch");
        self.cache.truncate_after(index);
        self.state.last_appended = new_last_appended;
        if let Some(first) = self.state.first_index_in_current_term {
            if first > index {
                self.state.first_index_in_current_term = None;
            }
        }
        let local_uuid = self.local_uuid;
        if let Some(local) = self.peers.get_mut(&local_uuid) {
            if local.last_received.index > index {
                local.last_received = new_last_appended;
                local.next_index = index + 1;
            }
        }
    }

    /// Assembles the next request for `uuid`: a batch read from the cache
    /// starting at `next_index - 1`, the current watermarks, and the next
    /// routing hop. Peers whose required start precedes our log get a
    /// needs-copy signal instead.
    pub fn build_request_for(
        &mut self,
        uuid: &Uuid,
        max_bytes: usize,
        safe_timestamp: Option<u64>,
        now: Instant,
    ) -> Result<PeerRequest, ConsensusError> {
        if self.state.mode != QueueMode::Leader || self.state.lifecycle != QueueLifecycle::Open {
            return Err(ConsensusError::IllegalState(
                "queue is not in leader mode".into(),
            ));
        }
        let Some(peer) = self.peers.get(uuid) else {
            return Err(ConsensusError::IllegalState(format!(
                "peer {} is not tracked",
                uuid
            )));
        };
        let from_idx = peer.next_index - 1;
        let range = match self.cache.read_range(from_idx, max_bytes) {
            Ok(range) => range,
            Err(CacheError::Missing(_)) => {
                let peer = self.peers.get_mut(uuid).expect("peer checked above");
                peer.wal_catchup_possible = false;
                warn!(
                    "event=peer_needs_copy group={} peer={} next_index={}",
                    self.group_id, uuid, peer.next_index
                );
                return Ok(PeerRequest::NeedsCopy);
            }
            Err(err @ CacheError::Codec(_)) => {
                return Err(ConsensusError::Corruption(err.to_string()));
            }
        };
        if range.ops.is_empty() && peer.next_index <= self.state.last_appended.index {
            // The range the peer needs was evicted from both the cache and
            // the log tail we can reach.
            let peer = self.peers.get_mut(uuid).expect("peer checked above");
            peer.wal_catchup_possible = false;
            warn!(
                "event=peer_needs_copy group={} peer={} next_index={}",
                self.group_id, uuid, peer.next_index
            );
            return Ok(PeerRequest::NeedsCopy);
        }
        let mut next_hop = self.router.next_hop(&self.local_uuid, uuid);
        if next_hop != *uuid && self.has_proxy_peer_failed(&next_hop, uuid, now) {
            debug!(
                "event=proxy_unhealthy group={} proxy={} dest={}",
                self.group_id, next_hop, uuid
            );
            next_hop = *uuid;
        }
        Ok(PeerRequest::Update {
            request: UpdateRequest {
                group_id: self.group_id.clone(),
                caller_uuid: self.local_uuid,
                caller_term: self.state.current_term,
                dest_uuid: *uuid,
                preceding_op: range.preceding_id,
                ops: range.ops,
                committed_index: self.state.committed_index,
                all_replicated_index: self.state.all_replicated_index,
                region_durable_index: self.state.region_durable_index,
                safe_timestamp,
            },
            next_hop,
        })
    }

    /// Digests a peer's response (or transport failure). Returns true when
    /// the peer has more operations waiting and the next request should go
    /// out immediately.
    pub fn response_from_peer(
        &mut self,
        uuid: &Uuid,
        outcome: &Result<UpdateResponse, RpcError>,
        now: Instant,
    ) -> bool {
        let Some(peer) = self.peers.get_mut(uuid) else {
            warn!(
                "event=response_from_untracked_peer group={} peer={}",
                self.group_id, uuid
            );
            return false;
        };
        let previous_health = peer.last_overall_health_status;
        let previous_status = peer.last_exchange_status;
        let status = PeerStatus::classify(outcome);
        peer.last_exchange_status = status;
        peer.last_communication_time = now;

        let mut became_caught_up = false;
        match (status, outcome) {
            (PeerStatus::Ok, Ok(response)) => {
                peer.check_monotonic_terms(response.responder_term);
                let was_behind = peer.last_received.index + PROMOTION_MAX_OPS_BEHIND
                    < self.state.committed_index;
                peer.last_received = response.last_received;
                peer.next_index = response.last_received.index + 1;
                peer.last_known_committed_index = response.last_committed_index;
                peer.wal_catchup_possible = true;
                let now_caught_up = peer.last_received.index + PROMOTION_MAX_OPS_BEHIND
                    >= self.state.committed_index;
                became_caught_up =
                    now_caught_up && (was_behind || previous_status == PeerStatus::New);
            }
            (PeerStatus::LmpMismatch, Ok(response)) => {
                peer.check_monotonic_terms(response.responder_term);
                let backoff = response.last_received.index + 1;
                peer.next_index = peer.next_index.saturating_sub(1).min(backoff).max(1);
                peer.last_known_committed_index = response.last_committed_index;
                debug!(
                    "event=peer_lmp_mismatch group={} peer={} next_index={}",
                    self.group_id, uuid, peer.next_index
                );
            }
            (PeerStatus::InvalidTerm, Ok(response)) => {
                let term = response.responder_term;
                peer.check_monotonic_terms(term);
                warn!(
                    "event=peer_reported_higher_term group={} peer={} term={}",
                    self.group_id, uuid, term
                );
                if self.state.mode == QueueMode::Leader {
                    self.notifications.push(QueueNotification::TermChanged(term));
                }
            }
            _ => {
                // Transient failure: indexes untouched, status recorded.
            }
        }

        if self.state.mode != QueueMode::Leader || self.state.lifecycle != QueueLifecycle::Open {
            return false;
        }

        if status == PeerStatus::Ok {
            self.advance_watermarks();
            self.promote_if_needed(uuid, became_caught_up);
            self.transfer_leadership_if_needed(uuid);
        }

        let peer = self.peers.get(uuid).expect("peer still tracked");
        let health = peer.health(now);
        if health != previous_health {
            if let Some(peer) = self.peers.get_mut(uuid) {
                peer.last_overall_health_status = health;
            }
            if matches!(
                health,
                HealthStatus::Failed | HealthStatus::FailedUnrecoverable
            ) {
                self.notifications.push(QueueNotification::PeerFailed {
                    uuid: *uuid,
                    term: self.state.current_term,
                    reason: format!("peer health transitioned to {:?}", health),
                });
            }
            self.notifications.push(QueueNotification::PeerHealthChanged);
        }

        let peer = self.peers.get(uuid).expect("peer still tracked");
        status == PeerStatus::Ok && peer.last_received.index < self.state.last_appended.index
    }

    /// Follower mode: adopt the watermarks the leader shipped with its
    /// request. Each index is monotone.
    pub fn update_follower_watermarks(
        &mut self,
        committed_index: u64,
        all_replicated_index: u64,
        region_durable_index: u64,
    ) {
        self.state.committed_index = self.state.committed_index.max(committed_index);
        self.state.all_replicated_index =
            self.state.all_replicated_index.max(all_replicated_index);
        self.state.region_durable_index =
            self.state.region_durable_index.max(region_durable_index);
        let durable = self
            .peers
            .get(&self.local_uuid)
            .map(|local| local.last_received.index)
            .unwrap_or(0);
        self.cache
            .evict_below(self.state.all_replicated_index.min(durable));
    }

    /// Follower lag bookkeeping; not valid in leader mode.
    pub fn update_last_index_appended_to_leader(&mut self, last_idx: u64) {
        debug_assert!(self.state.mode == QueueMode::NonLeader);
        self.state.last_idx_appended_to_leader = last_idx;
    }

    /// Starts watching for a caught-up successor. With a target, only that
    /// peer qualifies; otherwise the first voter passing `filter` (or any
    /// voter) does. When one qualifies, a start-election notification
    /// carrying `transfer_context` is emitted once.
    pub fn begin_watch_for_successor(
        &mut self,
        target: Option<Uuid>,
        filter: Option<SuccessorFilter>,
        transfer_context: TransferContext,
    ) {
        self.successor_watch_in_progress = true;
        self.designated_successor = target;
        self.successor_filter = filter;
        self.transfer_context = Some(transfer_context);
        self.successor_notified = false;
    }

    pub fn end_watch_for_successor(&mut self) {
        self.successor_watch_in_progress = false;
        self.designated_successor = None;
        self.successor_filter = None;
        self.transfer_context = None;
    }

    pub fn successor_notified(&self) -> bool {
        self.successor_notified
    }

    /// Health of every tracked peer. Only meaningful on the leader.
    pub fn health_report(&self, now: Instant) -> Result<HashMap<Uuid, HealthStatus>, ConsensusError> {
        if self.state.mode != QueueMode::Leader {
            return Err(ConsensusError::IllegalState(
                "health reports are only available in leader mode".into(),
            ));
        }
        Ok(self
            .peers
            .iter()
            .map(|(uuid, peer)| (*uuid, peer.health(now)))
            .collect())
    }

    /// Applies a new voter distribution between requests. This is the only
    /// way the distribution changes while the queue is live.
    pub fn update_voter_distribution(&mut self, distribution: std::collections::BTreeMap<String, usize>) {
        if let Some(config) = self.state.active_config.as_mut() {
            config.voter_distribution = distribution;
        }
    }

    pub fn set_adjust_voter_distribution(&mut self, adjust: bool) {
        self.adjust_voter_distribution = adjust;
    }

    pub fn close(&mut self) {
        self.state.lifecycle = QueueLifecycle::Closed;
    }

    pub fn is_closed(&self) -> bool {
        self.state.lifecycle == QueueLifecycle::Closed
    }

    pub fn mode(&self) -> QueueMode {
        self.state.mode
    }

    pub fn committed_index(&self) -> u64 {
        self.state.committed_index
    }

    pub fn all_replicated_index(&self) -> u64 {
        self.state.all_replicated_index
    }

    pub fn majority_replicated_index(&self) -> u64 {
        self.state.majority_replicated_index
    }

    pub fn region_durable_index(&self) -> u64 {
        self.state.region_durable_index
    }

    pub fn last_appended(&self) -> OpId {
        self.state.last_appended
    }

    pub fn is_committed_index_in_current_term(&self) -> bool {
        match self.state.first_index_in_current_term {
            Some(first) => self.state.committed_index >= first,
            None => false,
        }
    }

    pub fn cache(&self) -> &LogCache {
        &self.cache
    }

    /// Drains buffered notifications; the caller dispatches them after
    /// releasing its lock on the queue.
    pub fn take_notifications(&mut self) -> Vec<QueueNotification> {
        std::mem::take(&mut self.notifications)
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        QueueSnapshot {
            all_replicated_index: self.state.all_replicated_index,
            majority_replicated_index: self.state.majority_replicated_index,
            committed_index: self.state.committed_index,
            region_durable_index: self.state.region_durable_index,
            last_idx_appended_to_leader: self.state.last_idx_appended_to_leader,
            last_appended: self.state.last_appended,
            current_term: self.state.current_term,
            first_index_in_current_term: self.state.first_index_in_current_term,
            majority_size: self.state.majority_size,
            mode: self.state.mode,
            tracked_peers: self.peers.len(),
        }
    }

    fn check_peers_in_active_config(&self) {
        if self.state.mode != QueueMode::Leader {
            return;
        }
        let config = self
            .state
            .active_config
            .as_ref()
            .expect("leader mode requires an active config");
        for uuid in self.peers.keys() {
            assert!(
                config.is_member(uuid),
                "tracked peer {} is not in the active config",
                uuid
            );
        }
    }

    fn leader_region(&self) -> Option<String> {
        self.state
            .active_config
            .as_ref()
            .and_then(|config| config.region_of(&self.local_uuid))
            .map(str::to_string)
    }

    /// Recomputes every watermark after some peer's progress moved. Only
    /// runs in leader mode.
    fn advance_watermarks(&mut self) {
        let config = self
            .state
            .active_config
            .as_ref()
            .expect("leader mode requires an active config");
        let leader_region = self.leader_region();

        let all_replicated = self
            .peers
            .values()
            .map(|peer| peer.last_received.index)
            .min()
            .unwrap_or(0);
        self.state.all_replicated_index = self.state.all_replicated_index.max(all_replicated);

        let all_progress: Vec<VoterProgress> = self
            .peers
            .values()
            .map(|peer| VoterProgress::new(peer.spec.region.as_deref(), peer.last_received.index))
            .collect();
        self.state.region_durable_index = compute_region_durable_index(
            leader_region.as_deref(),
            &all_progress,
            self.state.region_durable_index,
        );

        let voter_progress: Vec<VoterProgress> = self
            .peers
            .values()
            .filter(|peer| config.is_voter(&peer.spec.uuid))
            .map(|peer| VoterProgress::new(peer.spec.region.as_deref(), peer.last_received.index))
            .collect();
        let distribution = if self.adjust_voter_distribution {
            config.adjusted_voter_distribution()
        } else {
            config.effective_voter_distribution()
        };
        self.state.majority_replicated_index = compute_majority_watermark(
            &config.commit_rule,
            &distribution,
            leader_region.as_deref(),
            &voter_progress,
            self.state.majority_replicated_index,
        );

        // Leader completeness: nothing from a prior term commits until an
        // operation of the current term is majority-replicated; then all
        // earlier indexes commit transitively.
        let committable = match self.state.first_index_in_current_term {
            Some(first) if self.state.majority_replicated_index >= first => {
                self.state.majority_replicated_index
            }
            _ => self.state.committed_index,
        };
        if committable > self.state.committed_index {
            self.state.committed_index = committable;
            info!(
                "event=commit_index_advance group={} committed_index={} term={}",
                self.group_id, committable, self.state.current_term
            );
            self.notifications
                .push(QueueNotification::CommitIndexAdvanced(committable));
        }

        let durable = self
            .peers
            .get(&self.local_uuid)
            .map(|local| local.last_received.index)
            .unwrap_or(0);
        self.cache
            .evict_below(self.state.all_replicated_index.min(durable));
    }

    /// A promotable non-voter that has caught up to within
    /// [`PROMOTION_MAX_OPS_BEHIND`] of the committed index is reported
    /// ready for promotion.
    fn promote_if_needed(&mut self, uuid: &Uuid, became_caught_up: bool) {
        let Some(peer) = self.peers.get(uuid) else {
            return;
        };
        if !became_caught_up
            || peer.spec.is_voter()
            || !peer.spec.promote_when_caught_up
        {
            return;
        }
        if peer.last_received.index + PROMOTION_MAX_OPS_BEHIND >= self.state.committed_index {
            info!(
                "event=peer_ready_for_promotion group={} peer={}",
                self.group_id, uuid
            );
            self.notifications
                .push(QueueNotification::PeerToPromote(*uuid));
        }
    }

    /// During a successor watch, a qualifying voter that has fully caught
    /// up to the leader's last appended op triggers the start-election
    /// notification, exactly once.
    fn transfer_leadership_if_needed(&mut self, uuid: &Uuid) {
        if !self.successor_watch_in_progress || self.successor_notified {
            return;
        }
        let Some(peer) = self.peers.get(uuid) else {
            return;
        };
        if !peer.spec.is_voter() {
            return;
        }
        match self.designated_successor {
            Some(target) if target != *uuid => return,
            None => {
                if let Some(filter) = &self.successor_filter {
                    if !filter(&peer.spec) {
                        return;
                    }
                }
            }
            _ => {}
        }
        if peer.last_received.index < self.state.last_appended.index {
            return;
        }
        info!(
            "event=successor_caught_up group={} peer={} last_appended={}",
            self.group_id, uuid, self.state.last_appended
        );
        self.successor_notified = true;
        self.notifications
            .push(QueueNotification::PeerToStartElection {
                uuid: *uuid,
                transfer: self.transfer_context.clone(),
            });
    }

    /// A proxy is unfit when it has been silent too long or lags its
    /// destination by too many operations.
    fn has_proxy_peer_failed(&self, proxy: &Uuid, dest: &Uuid, now: Instant) -> bool {
        let (Some(proxy), Some(dest)) = (self.peers.get(proxy), self.peers.get(dest)) else {
            return true;
        };
        let silent = now.saturating_duration_since(proxy.last_communication_time)
            > self.proxy_failure_threshold;
        let lagging = dest
            .last_received
            .index
            .saturating_sub(proxy.last_received.index)
            > self.proxy_failure_threshold_lag;
        silent || lagging
    }
}
