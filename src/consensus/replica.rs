use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::consensus::config::{Membership, PeerSpec, RaftConfig};
use crate::consensus::metadata::{MetadataStore, PersistentVars, PersistentVarsStore};
use crate::consensus::pending::{PendingRound, PendingRounds, RoundResult};
use crate::consensus::state::{FlushMode, RaftRole, ReplicaLifecycle, ReplicaState};
use crate::consensus::{OpId, OpType, ReplicateMsg};
use crate::election::{
    ElectionDriver, ElectionMode, ElectionOutcome, ElectionVote, FailureDetector,
    FlexiblePolicies, FlexibleVoteCounter, MajorityVoteCounter, VoteCounter, VoteInfo,
};
use crate::error::ConsensusError;
use crate::replication::cache::{LogCache, LogCacheConfig, LogReader};
use crate::replication::pipeline::LeaderPipeline;
use crate::replication::queue::{
    dispatch_notifications, PeerRequest, QueueMode, QueueNotification, QueueObserver,
    QueueSnapshot, ReplicationQueue, TransferContext,
};
use crate::replication::router::Router;
use crate::rpc::{
    PeerClientFactory, RpcError, UpdateError, UpdateRequest, UpdateResponse, VoteDenialReason,
    VoteRequest, VoteResponse,
};
use crate::timeouts;
use crate::wal::OperationLog;

/// How long the follower update path waits on one durability poll before
/// snoozing the failure detector again.
const DURABILITY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Tuning for a replica. Defaults follow the timeouts module.
#[derive(Debug, Clone)]
pub struct ReplicaOptions {
    pub group_id: String,
    /// Payload budget for a single peer request.
    pub max_batch_bytes: usize,
    pub heartbeat_interval: Duration,
    pub rpc_deadline: Duration,
    /// Run a pre-election before bumping the term for a real one.
    pub pre_elections: bool,
    /// Raise declared regional voter counts to the live membership.
    pub adjust_voter_distribution: bool,
    pub flexible_policies: FlexiblePolicies,
    /// How long a leadership transfer may run before it is abandoned.
    pub transfer_period: Duration,
    pub detector_seed: u64,
}

impl Default for ReplicaOptions {
    fn default() -> Self {
        Self {
            group_id: String::new(),
            max_batch_bytes: 1024 * 1024,
            heartbeat_interval: timeouts::HEARTBEAT_INTERVAL,
            rpc_deadline: timeouts::RPC_DEADLINE,
            pre_elections: true,
            adjust_voter_distribution: true,
            flexible_policies: FlexiblePolicies::default(),
            transfer_period: Duration::from_secs(30),
            detector_seed: 0,
        }
    }
}

/// Diagnostic snapshot of the replica's consensus state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConsensusStateSnapshot {
    pub current_term: u64,
    pub leader_uuid: Option<Uuid>,
    pub role: RaftRole,
    pub lifecycle: ReplicaLifecycle,
    pub committed_index: u64,
    pub last_appended: OpId,
    pub committed_config: RaftConfig,
    pub pending_config: Option<RaftConfig>,
}

/// One membership edit applied to the committed configuration.
#[derive(Debug, Clone)]
pub enum ConfigChangeOp {
    AddPeer(PeerSpec),
    RemovePeer(Uuid),
    SetMembership { uuid: Uuid, membership: Membership },
}

#[derive(Debug, Clone)]
pub struct ChangeConfigRequest {
    pub op: ConfigChangeOp,
    /// The committed config's opid index the caller bargained for.
    pub cas_config_opid_index: Option<u64>,
}

struct ElectionState {
    driver: ElectionDriver,
    outcome_slot: Arc<Mutex<Option<ElectionOutcome>>>,
}

struct ReplicaInner {
    state: ReplicaState,
    pending: PendingRounds,
    vars: PersistentVars,
    vars_store: PersistentVarsStore,
    detector: FailureDetector,
    pipeline: LeaderPipeline,
    election: Option<ElectionState>,
    /// Last op received from the leader of the current term.
    last_received_cur_leader: OpId,
    last_leader_contact: Option<Instant>,
    transfer_deadline: Option<Instant>,
    withhold_votes: bool,
}

type MemoryPressureFn = Box<dyn Fn() -> bool + Send + Sync>;

/// A single consensus participant: owns the replica state machine and the
/// pending rounds (under the replica lock), the replication queue (under
/// the queue lock), and the election machinery. The follower update path
/// and vote reception serialize on the update lock, taken before the
/// replica lock; the queue lock is innermost and queue notifications are
/// always dispatched after it is released.
pub struct Replica {
    options: ReplicaOptions,
    local_uuid: Uuid,
    update_lock: Mutex<()>,
    inner: Mutex<ReplicaInner>,
    queue: Mutex<ReplicationQueue>,
    log: Arc<dyn OperationLog>,
    clients: Arc<dyn PeerClientFactory>,
    observers: Mutex<Vec<Arc<dyn QueueObserver>>>,
    memory_pressure: Mutex<Option<MemoryPressureFn>>,
}

impl Replica {
    #[allow(clippy::too_many_arguments)]
    pub fn new<L: OperationLog + 'static>(
        options: ReplicaOptions,
        local_peer: PeerSpec,
        initial_config: RaftConfig,
        metadata_store: MetadataStore,
        vars_store: PersistentVarsStore,
        log: Arc<L>,
        cache_config: LogCacheConfig,
        clients: Arc<dyn PeerClientFactory>,
        router: Arc<dyn Router>,
        now: Instant,
    ) -> Result<Arc<Self>, ConsensusError> {
        initial_config.validate()?;
        let state = ReplicaState::open(local_peer.uuid, metadata_store, initial_config)?;
        let vars = vars_store
            .load_or_default()
            .map_err(|err| ConsensusError::IllegalState(err.to_string()))?;
        let last_appended = log.last_appended();
        let reader: Arc<dyn LogReader> = log.clone();
        let cache = LogCache::new(cache_config, reader);
        let queue = ReplicationQueue::new(
            options.group_id.clone(),
            local_peer.clone(),
            cache,
            router,
            last_appended,
            0,
            now,
        );
        let detector = FailureDetector::new(options.detector_seed);
        let pipeline = LeaderPipeline::with_heartbeat_interval(options.heartbeat_interval);
        Ok(Arc::new(Self {
            options,
            local_uuid: local_peer.uuid,
            update_lock: Mutex::new(()),
            inner: Mutex::new(ReplicaInner {
                state,
                pending: PendingRounds::new(last_appended, 0),
                vars,
                vars_store,
                detector,
                pipeline,
                election: None,
                last_received_cur_leader: OpId::GENESIS,
                last_leader_contact: None,
                transfer_deadline: None,
                withhold_votes: false,
            }),
            queue: Mutex::new(queue),
            log,
            clients,
            observers: Mutex::new(Vec::new()),
            memory_pressure: Mutex::new(None),
        }))
    }

    pub fn local_uuid(&self) -> Uuid {
        self.local_uuid
    }

    pub fn register_observer(&self, observer: Arc<dyn QueueObserver>) {
        self.observers.lock().push(observer);
    }

    /// Install a hook consulted before admitting follower batches; when it
    /// reports pressure the whole request is rejected as unavailable.
    pub fn set_memory_pressure_fn(&self, hook: impl Fn() -> bool + Send + Sync + 'static) {
        *self.memory_pressure.lock() = Some(Box::new(hook));
    }

    /// Test hook mirroring an operator "quarantine" switch: deny all vote
    /// requests while set.
    pub fn set_withhold_votes(&self, withhold: bool) {
        self.inner.lock().withhold_votes = withhold;
    }

    pub fn set_allow_start_election(&self, allow: bool) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();
        inner.vars.allow_start_election = allow;
        let vars = inner.vars.clone();
        inner
            .vars_store
            .persist(&vars)
            .map_err(|err| ConsensusError::IllegalState(err.to_string()))
    }

    pub fn set_rpc_token(&self, token: Option<String>) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();
        inner.vars.rpc_token = token;
        let vars = inner.vars.clone();
        inner
            .vars_store
            .persist(&vars)
            .map_err(|err| ConsensusError::IllegalState(err.to_string()))
    }

    /// Brings the replica to RUNNING. A single-voter configuration elects
    /// itself immediately.
    pub fn start(&self, now: Instant) -> Result<(), ConsensusError> {
        let single_voter = {
            let mut inner = self.inner.lock();
            inner.state.transition(ReplicaLifecycle::Initialized);
            inner.state.transition(ReplicaLifecycle::Running);
            let config = inner.state.active_config();
            let is_voter = config.is_voter(&self.local_uuid);
            let single = is_voter && config.voter_count() == 1;
            if is_voter && !single {
                inner.detector.enable(now);
            }
            single
        };
        if single_voter {
            self.start_election(ElectionMode::NormalElection, now)?;
        }
        Ok(())
    }

    pub fn stop(&self) {
        let mut inner = self.inner.lock();
        if let Some(mut election) = inner.election.take() {
            election.driver.cancel("replica stopping");
        }
        inner.detector.disable();
        inner.state.transition(ReplicaLifecycle::Stopping);
        inner.state.transition(ReplicaLifecycle::Stopped);
        self.queue.lock().close();
    }

    pub fn shutdown(&self) {
        let mut inner = self.inner.lock();
        inner.state.transition(ReplicaLifecycle::Shutdown);
    }

    pub fn consensus_state(&self) -> ConsensusStateSnapshot {
        let inner = self.inner.lock();
        let queue = self.queue.lock();
        ConsensusStateSnapshot {
            current_term: inner.state.current_term(),
            leader_uuid: inner.state.leader_uuid(),
            role: inner.state.role(),
            lifecycle: inner.state.lifecycle(),
            committed_index: inner.pending.committed_index(),
            last_appended: inner.pending.last_admitted(),
            committed_config: inner.state.committed_config().clone(),
            pending_config: inner.state.pending_config().cloned(),
        }
    }

    pub fn committed_config(&self) -> RaftConfig {
        self.inner.lock().state.committed_config().clone()
    }

    pub fn pending_config(&self) -> Option<RaftConfig> {
        self.inner.lock().state.pending_config().cloned()
    }

    pub fn current_term(&self) -> u64 {
        self.inner.lock().state.current_term()
    }

    pub fn leader_uuid(&self) -> Option<Uuid> {
        self.inner.lock().state.leader_uuid()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.lock().state.is_leader()
    }

    pub fn committed_index(&self) -> u64 {
        self.inner.lock().pending.committed_index()
    }

    pub fn queue_snapshot(&self) -> QueueSnapshot {
        self.queue.lock().snapshot()
    }

    /// Per-peer health as the leader sees it.
    pub fn peer_health_report(
        &self,
        now: Instant,
    ) -> Result<std::collections::HashMap<Uuid, crate::replication::HealthStatus>, ConsensusError>
    {
        self.queue.lock().health_report(now)
    }

    /// Applies a new region-to-voter-count map to the live queue. Handled
    /// between requests; never mid-response.
    pub fn update_voter_distribution(
        &self,
        distribution: std::collections::BTreeMap<String, usize>,
    ) {
        self.queue.lock().update_voter_distribution(distribution);
    }

    pub fn set_adjust_voter_distribution(&self, adjust: bool) {
        self.queue.lock().set_adjust_voter_distribution(adjust);
    }

    pub fn clear_removed_peers(&self) -> Result<(), ConsensusError> {
        self.inner
            .lock()
            .state
            .clear_removed_peers()
            .map_err(ConsensusError::from)
    }

    pub fn delete_from_removed_peers(&self, uuids: &[Uuid]) -> Result<(), ConsensusError> {
        self.inner
            .lock()
            .state
            .delete_from_removed_peers(uuids)
            .map_err(ConsensusError::from)
    }

    // ---------------------------------------------------------------
    // Leader path
    // ---------------------------------------------------------------

    /// Admits a client operation for replication. Leader only.
    pub fn replicate(&self, payload: Vec<u8>, now: Instant) -> Result<OpId, ConsensusError> {
        self.replicate_round(OpType::Data, payload, None, now)
    }

    /// As [`Replica::replicate`], with a completion callback fired when the
    /// round commits or aborts. Callbacks must not call back into the
    /// replica.
    pub fn replicate_with_callback(
        &self,
        payload: Vec<u8>,
        callback: impl FnOnce(RoundResult) + Send + 'static,
        now: Instant,
    ) -> Result<OpId, ConsensusError> {
        self.replicate_round(OpType::Data, payload, Some(Box::new(callback)), now)
    }

    fn replicate_round(
        &self,
        op_type: OpType,
        payload: Vec<u8>,
        callback: Option<Box<dyn FnOnce(RoundResult) + Send>>,
        now: Instant,
    ) -> Result<OpId, ConsensusError> {
        let (id, notifications) = {
            let mut inner = self.inner.lock();
            inner.state.check_running()?;
            if !inner.state.is_leader() {
                return Err(ConsensusError::IllegalState("replica is not the leader".into()));
            }
            if inner.transfer_deadline.is_some() && op_type != OpType::NoOp {
                return Err(ConsensusError::ServiceUnavailable(
                    "leadership transfer in progress".into(),
                ));
            }
            let term = inner.state.current_term();
            let id = OpId::new(term, inner.pending.last_admitted().index + 1);
            let msg = ReplicateMsg::new(id, op_type, payload);
            let round = match callback {
                Some(callback) => PendingRound::with_callback(msg.clone(), term, callback),
                None => PendingRound::new(msg.clone(), term),
            };
            inner
                .pending
                .admit(round)
                .map_err(|err| ConsensusError::IllegalState(err.to_string()))?;
            self.queue.lock().append_operation(msg.clone())?;
            self.log
                .append(&[msg])
                .map_err(|err| ConsensusError::ServiceUnavailable(err.to_string()))?;
            let notifications = if self
                .log
                .wait_durable(id, Duration::ZERO)
                .unwrap_or(false)
            {
                let mut queue = self.queue.lock();
                queue.local_peer_append_finished(id, now);
                queue.take_notifications()
            } else {
                Vec::new()
            };
            (id, notifications)
        };
        self.process_notifications(notifications, now);
        Ok(id)
    }

    /// One replication exchange with `peer`: build, send, digest. Returns
    /// whether more operations are already waiting for it.
    pub fn run_peer_exchange(&self, peer: &Uuid, now: Instant) -> Result<bool, ConsensusError> {
        {
            let mut inner = self.inner.lock();
            if !inner.state.is_leader() {
                return Err(ConsensusError::IllegalState("replica is not the leader".into()));
            }
            if !inner.pipeline.is_tracked(peer) {
                return Err(ConsensusError::IllegalState(format!(
                    "peer {} has no replication slot",
                    peer
                )));
            }
            if inner.pipeline.has_request_in_flight(peer) {
                return Ok(false);
            }
            inner.pipeline.begin_request(peer, now);
        }

        let built = self
            .queue
            .lock()
            .build_request_for(peer, self.options.max_batch_bytes, None, now);
        let (request, next_hop) = match built {
            Ok(PeerRequest::Update { request, next_hop }) => (request, next_hop),
            Ok(PeerRequest::NeedsCopy) => {
                self.inner.lock().pipeline.complete_request(peer, false);
                return Ok(false);
            }
            Err(err) => {
                self.inner.lock().pipeline.complete_request(peer, false);
                return Err(err);
            }
        };

        let hop_spec = self.inner.lock().state.active_config().peer(&next_hop).cloned();
        let outcome = match hop_spec {
            Some(spec) => match self.clients.client_for(&spec) {
                Ok(client) => client.update(&request, now + self.options.rpc_deadline),
                Err(err) => Err(err),
            },
            None => Err(RpcError::NoClient(next_hop)),
        };

        let (more, notifications) = {
            let mut queue = self.queue.lock();
            let more = queue.response_from_peer(peer, &outcome, now);
            (more, queue.take_notifications())
        };
        self.inner.lock().pipeline.complete_request(peer, more);
        self.process_notifications(notifications, now);
        Ok(more)
    }

    /// Drives timers and the leader pipeline: local durability
    /// acknowledgement, transfer expiry, failure-detector expiry, and one
    /// exchange for every peer that is due.
    pub fn tick(&self, now: Instant) {
        // Local durability feeds the local peer's quorum vote.
        let last = self.inner.lock().pending.last_admitted();
        if !last.is_genesis() && self.log.wait_durable(last, Duration::ZERO).unwrap_or(false) {
            let notifications = {
                let mut queue = self.queue.lock();
                queue.local_peer_append_finished(last, now);
                queue.take_notifications()
            };
            self.process_notifications(notifications, now);
        }

        // Abandon an overdue leadership transfer.
        let transfer_expired = {
            let mut inner = self.inner.lock();
            match inner.transfer_deadline {
                Some(deadline) if now >= deadline => {
                    inner.transfer_deadline = None;
                    true
                }
                _ => false,
            }
        };
        if transfer_expired {
            warn!(
                "event=leadership_transfer_expired group={}",
                self.options.group_id
            );
            self.queue.lock().end_watch_for_successor();
        }

        // Failure detector: a single-flight election task per expiry.
        let fired = self.inner.lock().detector.poll(now);
        if fired {
            let mode = if self.options.pre_elections {
                ElectionMode::PreElection
            } else {
                ElectionMode::NormalElection
            };
            info!(
                "event=failure_detector_expired group={} mode={:?}",
                self.options.group_id, mode
            );
            if let Err(err) = self.start_election(mode, now) {
                debug!(
                    "event=election_start_rejected group={} error={}",
                    self.options.group_id, err
                );
            }
            self.inner.lock().detector.rearm(now);
        }

        // Leader exchanges.
        let due = {
            let inner = self.inner.lock();
            if inner.state.is_leader() {
                inner.pipeline.due_peers(now)
            } else {
                Vec::new()
            }
        };
        for peer in due {
            if let Err(err) = self.run_peer_exchange(&peer, now) {
                debug!(
                    "event=peer_exchange_failed group={} peer={} error={}",
                    self.options.group_id, peer, err
                );
            }
        }
    }

    // ---------------------------------------------------------------
    // Follower update path
    // ---------------------------------------------------------------

    /// Applies a replication request from a leader.
    pub fn update(&self, request: &UpdateRequest, now: Instant) -> UpdateResponse {
        let _update_guard = self.update_lock.lock();
        let mut inner = self.inner.lock();

        if request.group_id != self.options.group_id {
            return self.update_error(&inner, UpdateError::ReplicaNotFound);
        }
        if !inner.state.is_running() {
            return self.update_error(&inner, UpdateError::ReplicaFailed);
        }

        // Step 1-2: term checks.
        let current = inner.state.current_term();
        if request.caller_term < current {
            debug!(
                "event=update_rejected group={} reason=stale_term caller_term={} current_term={}",
                self.options.group_id, request.caller_term, current
            );
            return self.update_error(&inner, UpdateError::InvalidTerm);
        }
        if request.caller_term > current {
            let was_leader = inner.state.is_leader();
            if inner.state.advance_term(request.caller_term, FlushMode::Flush).is_err() {
                return self.update_error(&inner, UpdateError::ServiceUnavailable);
            }
            inner.last_received_cur_leader = OpId::GENESIS;
            if was_leader {
                self.become_follower_locked(&mut inner, now);
            }
        }

        // Step 3: the leader is alive.
        inner.detector.snooze(now, None);
        inner.last_leader_contact = Some(now);

        // Step 4: bind the leader identity. A second leader in the same
        // term is a protocol violation, not an error to recover from.
        match inner.state.leader_uuid() {
            None => {
                if inner.state.set_leader(request.caller_uuid).is_err() {
                    return self.update_error(&inner, UpdateError::ServiceUnavailable);
                }
            }
            Some(existing) => {
                assert_eq!(
                    existing, request.caller_uuid,
                    "two leaders acknowledged in term {}",
                    inner.state.current_term()
                );
            }
        }
        // An accepted update from a live leader moots any election we were
        // running.
        if let Some(mut election) = inner.election.take() {
            election.driver.cancel("discovered an active leader");
        }
        {
            let mut queue = self.queue.lock();
            if queue.mode() == QueueMode::Leader {
                queue.set_non_leader_mode(inner.state.active_config().clone());
            }
        }

        // Memory pressure gate, before any admission work.
        if let Some(pressure) = self.memory_pressure.lock().as_ref() {
            if pressure() {
                warn!(
                    "event=update_rejected group={} reason=memory_pressure",
                    self.options.group_id
                );
                return self.update_error(&inner, UpdateError::ServiceUnavailable);
            }
        }

        // Step 5: deduplicate the already-known prefix.
        let committed = inner.pending.committed_index();
        let mut preceding = request.preceding_op;
        let mut start = 0;
        for op in &request.ops {
            let id = op.id();
            let duplicate = id.index <= committed
                || inner
                    .pending
                    .get(id.index)
                    .map(|round| round.id() == id)
                    .unwrap_or(false);
            if duplicate {
                preceding = id;
                start += 1;
            } else {
                break;
            }
        }
        let new_ops = &request.ops[start..];

        // Step 6: log matching at the effective preceding op.
        let last_admitted = inner.pending.last_admitted();
        if preceding.index > last_admitted.index {
            debug!(
                "event=update_rejected group={} reason=missing_preceding preceding={} last={}",
                self.options.group_id, preceding, last_admitted
            );
            return self.update_error(&inner, UpdateError::PrecedingEntryDidntMatch);
        }
        if preceding.index > committed {
            let matches = inner
                .pending
                .get(preceding.index)
                .map(|round| round.id() == preceding)
                .unwrap_or(false);
            if !matches {
                self.truncate_divergent_suffix(&mut inner, preceding.index - 1);
                warn!(
                    "event=log_matching_conflict group={} preceding={} truncated_after={}",
                    self.options.group_id,
                    preceding,
                    preceding.index - 1
                );
                return self.update_error(&inner, UpdateError::PrecedingEntryDidntMatch);
            }
        }
        // A pending suffix past the matched preceding op that the leader is
        // about to overwrite is divergent; drop it before admitting.
        if !new_ops.is_empty() && inner.pending.last_admitted().index > preceding.index {
            self.truncate_divergent_suffix(&mut inner, preceding.index);
        }

        // Step 7: early commit below everything this request touches.
        let early = inner
            .pending
            .last_admitted()
            .index
            .min(preceding.index)
            .min(request.committed_index);
        inner.pending.advance_committed_to(early);
        self.commit_pending_config_if_reached(&mut inner, early, now);

        // Step 8: checksum validation, then admission and local append.
        for op in new_ops {
            if !op.verify_checksum() {
                warn!(
                    "event=update_rejected group={} reason=checksum_mismatch id={}",
                    self.options.group_id,
                    op.id()
                );
                return self.update_error(&inner, UpdateError::Corruption);
            }
        }
        if !new_ops.is_empty() {
            {
                let mut queue = self.queue.lock();
                for op in new_ops {
                    if inner
                        .pending
                        .admit(PendingRound::new(op.clone(), op.id().term))
                        .is_err()
                    {
                        return self.update_error(&inner, UpdateError::CannotPrepare);
                    }
                    if queue.append_operation(op.clone()).is_err() {
                        return self.update_error(&inner, UpdateError::CannotPrepare);
                    }
                    if op.op_type() == OpType::ChangeConfig {
                        self.adopt_config_from_op(&mut inner, op);
                    }
                }
            }
            if self.log.append(new_ops).is_err() {
                return self.update_error(&inner, UpdateError::ServiceUnavailable);
            }
        }
        let target = inner.pending.last_admitted();
        inner.last_received_cur_leader = target;

        // Step 9: wait out the durability barrier, snoozing the detector so
        // our own fsync latency does not trigger an election.
        drop(inner);
        loop {
            match self.log.wait_durable(target, DURABILITY_POLL_INTERVAL) {
                Ok(true) => break,
                Ok(false) => {
                    let mut inner = self.inner.lock();
                    inner.detector.snooze(Instant::now(), None);
                }
                Err(err) => {
                    let inner = self.inner.lock();
                    warn!(
                        "event=durable_append_failed group={} error={}",
                        self.options.group_id, err
                    );
                    return self.update_error(&inner, UpdateError::ServiceUnavailable);
                }
            }
        }
        let mut inner = self.inner.lock();

        // Step 10: final commit advance and follower watermarks.
        let final_commit = request.committed_index.min(target.index);
        inner.pending.advance_committed_to(final_commit);
        self.commit_pending_config_if_reached(&mut inner, final_commit, now);
        {
            let mut queue = self.queue.lock();
            queue.local_peer_append_finished(target, now);
            queue.update_follower_watermarks(
                final_commit,
                request.all_replicated_index,
                request.region_durable_index,
            );
            queue.update_last_index_appended_to_leader(
                request.preceding_op.index + request.ops.len() as u64,
            );
        }

        // Step 11: respond with our log position.
        UpdateResponse {
            responder_uuid: self.local_uuid,
            responder_term: inner.state.current_term(),
            last_received: self.log.last_appended(),
            last_received_current_leader: inner.last_received_cur_leader,
            last_committed_index: inner.pending.committed_index(),
            error: None,
        }
    }

    fn update_error(&self, inner: &ReplicaInner, error: UpdateError) -> UpdateResponse {
        UpdateResponse {
            responder_uuid: self.local_uuid,
            responder_term: inner.state.current_term(),
            last_received: self.log.last_appended(),
            last_received_current_leader: inner.last_received_cur_leader,
            last_committed_index: inner.pending.committed_index(),
            error: Some(error),
        }
    }

    /// Aborts pending rounds past `boundary`, truncates the log and the
    /// queue, and reverts a pending config sitting above the cut.
    fn truncate_divergent_suffix(&self, inner: &mut ReplicaInner, boundary: u64) {
        inner.pending.abort_after(boundary);
        if self.log.truncate_after(boundary).is_err() {
            panic!("log truncation at index {} failed", boundary);
        }
        let new_tail = self.log.last_appended();
        inner.pending.reset_last_admitted(new_tail);
        if inner.last_received_cur_leader.index > boundary {
            inner.last_received_cur_leader = new_tail;
        }
        self.queue.lock().truncate_after(boundary, new_tail);
        let revert = inner
            .state
            .pending_config()
            .and_then(|config| config.opid_index)
            .map(|index| index > boundary)
            .unwrap_or(false);
        if revert {
            let _ = inner.state.clear_pending_config();
        }
    }

    /// A config-change op arriving on the follower path becomes the active
    /// (pending) configuration immediately.
    fn adopt_config_from_op(&self, inner: &mut ReplicaInner, op: &Arc<ReplicateMsg>) {
        match serde_json::from_slice::<RaftConfig>(op.payload()) {
            Ok(mut config) => {
                config.opid_index = Some(op.id().index);
                if let Err(err) = inner.state.set_pending_config(config, true) {
                    warn!(
                        "event=config_adopt_failed group={} id={} error={}",
                        self.options.group_id,
                        op.id(),
                        err
                    );
                }
            }
            Err(err) => warn!(
                "event=config_decode_failed group={} id={} error={}",
                self.options.group_id,
                op.id(),
                err
            ),
        }
    }

    fn commit_pending_config_if_reached(
        &self,
        inner: &mut ReplicaInner,
        committed_index: u64,
        now: Instant,
    ) {
        let reached = inner
            .state
            .pending_config()
            .and_then(|config| config.opid_index)
            .map(|index| index <= committed_index)
            .unwrap_or(false);
        if !reached {
            return;
        }
        let config = inner
            .state
            .pending_config()
            .cloned()
            .expect("pending config checked above");
        if let Err(err) = inner.state.commit_pending_config(config, false) {
            warn!(
                "event=config_commit_failed group={} error={}",
                self.options.group_id, err
            );
            return;
        }
        self.refresh_after_config_change(inner, now);
    }

    /// Re-derives queue tracking, pipeline slots and detector state from
    /// the active configuration.
    fn refresh_after_config_change(&self, inner: &mut ReplicaInner, now: Instant) {
        let config = inner.state.active_config().clone();
        if inner.state.is_leader() {
            let term = inner.state.current_term();
            let committed = inner.pending.committed_index();
            inner.pipeline.reset(
                config
                    .peers
                    .iter()
                    .filter(|peer| peer.uuid != self.local_uuid)
                    .map(|peer| peer.uuid),
            );
            self.queue.lock().set_leader_mode(committed, term, config, now);
        } else {
            let is_voter = config.is_voter(&self.local_uuid);
            if is_voter && !inner.state.is_leader() {
                if !inner.detector.is_enabled() {
                    inner.detector.enable(now);
                }
            } else {
                inner.detector.disable();
            }
            self.queue.lock().set_non_leader_mode(config);
        }
    }

    // ---------------------------------------------------------------
    // Voting path
    // ---------------------------------------------------------------

    /// Answers a vote solicitation. Competing updates and votes serialize
    /// on the update lock; rather than block a candidate behind a long
    /// append, a contended lock denies with a busy signal.
    pub fn request_vote(&self, request: &VoteRequest, now: Instant) -> VoteResponse {
        let Some(_guard) = self.update_lock.try_lock() else {
            let inner = self.inner.lock();
            return self.vote_denied(&inner, VoteDenialReason::Busy);
        };
        let mut inner = self.inner.lock();

        if !inner.state.is_running() || request.group_id != self.options.group_id {
            return self.vote_denied(&inner, VoteDenialReason::Busy);
        }
        if inner.withhold_votes {
            return self.vote_denied(&inner, VoteDenialReason::Withheld);
        }
        if let Some(expected) = &inner.vars.rpc_token {
            if request.rpc_token.as_deref() != Some(expected.as_str()) {
                warn!(
                    "event=vote_denied group={} reason=token_mismatch candidate={}",
                    self.options.group_id, request.candidate_uuid
                );
                return self.vote_denied(&inner, VoteDenialReason::Withheld);
            }
        }

        let candidate = request.candidate_uuid;
        if inner.state.removed_peers().contains(&candidate) {
            let mut response = self.vote_denied(&inner, VoteDenialReason::CandidateNotInConfig);
            response.is_candidate_removed = true;
            return response;
        }
        if !inner.state.active_config().is_voter(&candidate) {
            return self.vote_denied(&inner, VoteDenialReason::CandidateNotInConfig);
        }
        if !inner.state.active_config().is_voter(&self.local_uuid) {
            return self.vote_denied(&inner, VoteDenialReason::Withheld);
        }

        if request.candidate_term < inner.state.current_term() {
            return self.vote_denied(&inner, VoteDenialReason::InvalidTerm);
        }

        // A live leader makes any election, pre or real, disruptive. Being
        // the leader counts as having heard from one.
        let leader_alive = inner.state.is_leader()
            || (inner.state.leader_uuid().is_some()
                && inner
                    .last_leader_contact
                    .map(|at| now.saturating_duration_since(at) < timeouts::ELECTION_TIMEOUT_MIN)
                    .unwrap_or(false));
        if leader_alive && !request.ignore_live_leader {
            return self.vote_denied(&inner, VoteDenialReason::LeaderIsAlive);
        }

        if request.candidate_term > inner.state.current_term() && !request.is_pre_election {
            let was_leader = inner.state.is_leader();
            // The vote write just below subsumes the flush.
            if inner
                .state
                .advance_term(request.candidate_term, FlushMode::SkipFlush)
                .is_err()
            {
                return self.vote_denied(&inner, VoteDenialReason::Busy);
            }
            if was_leader {
                self.become_follower_locked(&mut inner, now);
            }
        }

        if !request.is_pre_election {
            match inner.state.voted_for() {
                Some(existing) if existing != candidate => {
                    let response = self.vote_denied(&inner, VoteDenialReason::AlreadyVoted);
                    self.flush_vote_state(&mut inner);
                    return response;
                }
                _ => {}
            }
        }

        let local_last = inner.pending.last_admitted();
        if request.last_received < local_last {
            info!(
                "event=vote_denied group={} reason=stale_log candidate={} candidate_last={} local_last={}",
                self.options.group_id, candidate, request.last_received, local_last
            );
            let response = self.vote_denied(&inner, VoteDenialReason::LastOpIdTooOld);
            self.flush_vote_state(&mut inner);
            return response;
        }

        if !request.is_pre_election && inner.state.voted_for().is_none() {
            if inner.state.record_vote(candidate).is_err() {
                return self.vote_denied(&inner, VoteDenialReason::Busy);
            }
        }
        // Granting a vote resets our patience with the current leader.
        inner.detector.snooze(now, None);
        info!(
            "event=vote_granted group={} candidate={} term={} pre_election={}",
            self.options.group_id,
            candidate,
            request.candidate_term,
            request.is_pre_election
        );
        let mut response = VoteResponse::granted(self.local_uuid, inner.state.current_term());
        self.attach_vote_context(&inner, &mut response);
        response
    }

    fn vote_denied(&self, inner: &ReplicaInner, reason: VoteDenialReason) -> VoteResponse {
        let mut response =
            VoteResponse::denied(self.local_uuid, inner.state.current_term(), reason);
        self.attach_vote_context(inner, &mut response);
        response
    }

    fn attach_vote_context(&self, inner: &ReplicaInner, response: &mut VoteResponse) {
        let meta = inner.state.metadata();
        response.last_known_leader = meta.last_known_leader;
        response.previous_vote_history = meta.previous_vote_history.clone();
        response.last_pruned_term = meta.last_pruned_term;
    }

    fn flush_vote_state(&self, inner: &mut ReplicaInner) {
        if let Err(err) = inner.state.flush_if_pending() {
            warn!(
                "event=metadata_flush_failed group={} error={}",
                self.options.group_id, err
            );
        }
    }

    // ---------------------------------------------------------------
    // Elections
    // ---------------------------------------------------------------

    /// Starts a pre-election or a real election for `current_term + 1`.
    pub fn start_election(&self, mode: ElectionMode, now: Instant) -> Result<(), ConsensusError> {
        let (voters, outcome) = {
            let mut inner = self.inner.lock();
            inner.state.check_running()?;
            if !inner.vars.allow_start_election {
                return Err(ConsensusError::IllegalState(
                    "starting elections is administratively disabled".into(),
                ));
            }
            if inner.state.is_leader() {
                return Err(ConsensusError::IllegalState("replica is already the leader".into()));
            }
            let config = inner.state.active_config().clone();
            if !config.is_voter(&self.local_uuid) {
                return Err(ConsensusError::IllegalState(
                    "only voters may start elections".into(),
                ));
            }
            if config.commit_rule.is_flexible() && !config.voter_distribution.is_empty() {
                let region = config.region_of(&self.local_uuid).unwrap_or("");
                if !config.voter_distribution.contains_key(region) {
                    return Err(ConsensusError::IllegalState(format!(
                        "local region {:?} is not in the voter distribution",
                        region
                    )));
                }
            }

            if let Some(mut stale) = inner.election.take() {
                stale.driver.cancel("superseded by a newer election");
            }

            let candidate_term = inner.state.current_term() + 1;
            if !mode.is_pre_election() {
                inner.state.advance_term(candidate_term, FlushMode::SkipFlush)?;
                inner.state.record_vote(self.local_uuid)?;
            }

            let own_info = VoteInfo {
                vote: ElectionVote::Granted,
                last_known_leader: inner.state.metadata().last_known_leader,
                previous_vote_history: inner.state.metadata().previous_vote_history.clone(),
                last_pruned_term: inner.state.metadata().last_pruned_term,
                is_candidate_removed: false,
            };
            let mut counter: Box<dyn VoteCounter> = if config.commit_rule.is_flexible()
                && !config.effective_voter_distribution().is_empty()
            {
                Box::new(FlexibleVoteCounter::new(
                    self.local_uuid,
                    candidate_term,
                    inner.state.metadata().last_known_leader,
                    &config,
                    self.options.adjust_voter_distribution,
                    self.options.flexible_policies.clone(),
                    now,
                ))
            } else {
                Box::new(MajorityVoteCounter::new(
                    config.voter_count(),
                    config.majority_size(),
                ))
            };
            counter
                .register_vote(self.local_uuid, own_info)
                .map_err(|err| ConsensusError::IllegalState(err.to_string()))?;

            let request = VoteRequest {
                group_id: self.options.group_id.clone(),
                candidate_uuid: self.local_uuid,
                candidate_term,
                dest_uuid: self.local_uuid,
                last_received: inner.pending.last_admitted(),
                is_pre_election: mode.is_pre_election(),
                ignore_live_leader: matches!(mode, ElectionMode::ElectEvenIfLeaderIsAlive),
                rpc_token: inner.vars.rpc_token.clone(),
            };
            let voters: Vec<PeerSpec> = config
                .voters()
                .filter(|peer| peer.uuid != self.local_uuid)
                .cloned()
                .collect();

            let slot: Arc<Mutex<Option<ElectionOutcome>>> = Arc::new(Mutex::new(None));
            let sink = slot.clone();
            let mut driver = ElectionDriver::new(
                request,
                counter,
                voters.iter().map(|peer| peer.uuid),
                move |outcome| {
                    *sink.lock() = Some(outcome.clone());
                },
            );
            driver.start(now);
            let outcome = slot.lock().take();
            inner.election = Some(ElectionState {
                driver,
                outcome_slot: slot,
            });
            (voters, outcome)
        };

        if let Some(outcome) = outcome {
            self.handle_election_outcome(outcome, now);
            return Ok(());
        }

        // Solicit every other voter. Responses to an election that has
        // since been superseded are ignored inside the handler.
        let request_template = {
            let inner = self.inner.lock();
            inner
                .election
                .as_ref()
                .map(|election| election.driver.request().clone())
        };
        let Some(request_template) = request_template else {
            return Ok(());
        };
        for voter in voters {
            let mut request = request_template.clone();
            request.dest_uuid = voter.uuid;
            let outcome = match self.clients.client_for(&voter) {
                Ok(client) => client.request_vote(&request, now + self.options.rpc_deadline),
                Err(err) => Err(err),
            };
            self.handle_vote_response(voter.uuid, request.candidate_term, outcome, now);
        }
        Ok(())
    }

    /// Feeds one voter's response into the active election, if it is still
    /// the one the response belongs to.
    pub fn handle_vote_response(
        &self,
        voter: Uuid,
        candidate_term: u64,
        outcome: Result<VoteResponse, RpcError>,
        now: Instant,
    ) {
        let decided = {
            let mut inner = self.inner.lock();
            let Some(election) = inner.election.as_mut() else {
                return;
            };
            if election.driver.election_term() != candidate_term {
                return;
            }
            election.driver.record_response(voter, &outcome, now);
            let decided = election.outcome_slot.lock().take();
            decided
        };
        if let Some(outcome) = decided {
            self.handle_election_outcome(outcome, now);
        }
    }

    fn handle_election_outcome(&self, outcome: ElectionOutcome, now: Instant) {
        enum Next {
            StartRealElection,
            BecomeLeader,
            Nothing,
        }
        let next = {
            let mut inner = self.inner.lock();
            inner.election = None;
            match (outcome.is_pre_election, outcome.decision) {
                (true, ElectionVote::Granted) => Next::StartRealElection,
                (false, ElectionVote::Granted) => {
                    if outcome.candidate_term == inner.state.current_term() {
                        Next::BecomeLeader
                    } else {
                        // The world moved on while votes were in flight.
                        Next::Nothing
                    }
                }
                (_, ElectionVote::Denied) => {
                    info!(
                        "event=election_lost group={} term={} pre_election={} reason={}",
                        self.options.group_id,
                        outcome.candidate_term,
                        outcome.is_pre_election,
                        outcome.message
                    );
                    inner.state.record_failed_election();
                    if outcome.highest_voter_term > inner.state.current_term() {
                        let _ = inner
                            .state
                            .advance_term(outcome.highest_voter_term, FlushMode::Flush);
                    }
                    // Back off harder the longer the group goes without a
                    // stable leader.
                    let failed = inner.state.failed_elections_since_stable_leader().min(8);
                    inner
                        .detector
                        .snooze(now, Some(timeouts::ELECTION_TIMEOUT_MIN * failed as u32));
                    Next::Nothing
                }
            }
        };
        match next {
            Next::StartRealElection => {
                if let Err(err) = self.start_election(ElectionMode::NormalElection, now) {
                    warn!(
                        "event=real_election_start_failed group={} error={}",
                        self.options.group_id, err
                    );
                }
            }
            Next::BecomeLeader => {
                if let Err(err) = self.become_leader(now) {
                    warn!(
                        "event=become_leader_failed group={} error={}",
                        self.options.group_id, err
                    );
                }
            }
            Next::Nothing => {}
        }
    }

    /// Assumes leadership: leader mode on the queue, fresh pipeline slots,
    /// failure detector off, and the term-opening no-op.
    fn become_leader(&self, now: Instant) -> Result<(), ConsensusError> {
        {
            let mut inner = self.inner.lock();
            inner.state.set_leader(self.local_uuid)?;
            inner.detector.disable();
            inner.transfer_deadline = None;
            let term = inner.state.current_term();
            let committed = inner.pending.committed_index();
            let config = inner.state.active_config().clone();
            inner.pipeline.reset(
                config
                    .peers
                    .iter()
                    .filter(|peer| peer.uuid != self.local_uuid)
                    .map(|peer| peer.uuid),
            );
            self.queue.lock().set_leader_mode(committed, term, config, now);
            info!(
                "event=became_leader group={} term={} committed_index={}",
                self.options.group_id, term, committed
            );
        }
        // The no-op makes prior-term entries committable once it commits.
        self.replicate_round(OpType::NoOp, Vec::new(), None, now)?;
        Ok(())
    }

    fn handle_term_change(&self, term: u64, now: Instant) {
        let mut inner = self.inner.lock();
        if term > inner.state.current_term() {
            if let Err(err) = inner.state.advance_term(term, FlushMode::Flush) {
                warn!(
                    "event=term_advance_failed group={} term={} error={}",
                    self.options.group_id, term, err
                );
                return;
            }
        }
        self.become_follower_locked(&mut inner, now);
    }

    fn become_follower_locked(&self, inner: &mut ReplicaInner, now: Instant) {
        if let Some(mut election) = inner.election.take() {
            election.driver.cancel("stepping down");
        }
        if inner.state.is_leader() {
            inner.state.clear_leader();
        }
        inner.transfer_deadline = None;
        let config = inner.state.active_config().clone();
        if config.is_voter(&self.local_uuid) {
            inner.detector.enable(now);
        } else {
            inner.detector.disable();
        }
        let mut queue = self.queue.lock();
        if queue.mode() == QueueMode::Leader {
            queue.set_non_leader_mode(config);
        }
    }

    // ---------------------------------------------------------------
    // Leadership controls
    // ---------------------------------------------------------------

    /// Relinquishes leadership without electing a successor.
    pub fn step_down(&self, now: Instant) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();
        inner.state.check_running()?;
        if !inner.state.is_leader() {
            return Err(ConsensusError::IllegalState("replica is not the leader".into()));
        }
        info!(
            "event=step_down group={} term={}",
            self.options.group_id,
            inner.state.current_term()
        );
        self.become_follower_locked(&mut inner, now);
        Ok(())
    }

    /// Initiates a graceful transfer: stop admitting rounds, keep
    /// replicating, and tell the successor to start an election the moment
    /// it has caught up.
    pub fn transfer_leadership(
        &self,
        target: Option<Uuid>,
        filter: Option<Box<dyn Fn(&PeerSpec) -> bool + Send + Sync>>,
        now: Instant,
    ) -> Result<(), ConsensusError> {
        {
            let mut inner = self.inner.lock();
            inner.state.check_running()?;
            if !inner.state.is_leader() {
                return Err(ConsensusError::IllegalState("replica is not the leader".into()));
            }
            if let Some(target) = target {
                if target == self.local_uuid {
                    return Err(ConsensusError::InvalidConfig(
                        "cannot transfer leadership to self".into(),
                    ));
                }
                if !inner.state.active_config().is_voter(&target) {
                    return Err(ConsensusError::InvalidConfig(format!(
                        "transfer target {} is not a voter",
                        target
                    )));
                }
            }
            if inner.transfer_deadline.is_some() {
                return Err(ConsensusError::ServiceUnavailable(
                    "a leadership transfer is already in progress".into(),
                ));
            }
            inner.transfer_deadline = Some(now + self.options.transfer_period);
        }
        info!(
            "event=leadership_transfer_started group={} target={:?}",
            self.options.group_id, target
        );
        self.queue.lock().begin_watch_for_successor(
            target,
            filter,
            TransferContext {
                original_start_time: now,
                original_uuid: self.local_uuid,
                is_origin_dead_promotion: false,
            },
        );
        Ok(())
    }

    pub fn cancel_transfer(&self) -> Result<(), ConsensusError> {
        let mut inner = self.inner.lock();
        if inner.transfer_deadline.take().is_none() {
            return Err(ConsensusError::IllegalState(
                "no leadership transfer in progress".into(),
            ));
        }
        self.queue.lock().end_watch_for_successor();
        Ok(())
    }

    // ---------------------------------------------------------------
    // Configuration changes
    // ---------------------------------------------------------------

    pub fn change_config(
        &self,
        request: ChangeConfigRequest,
        now: Instant,
    ) -> Result<OpId, ConsensusError> {
        self.apply_config_ops(vec![request.op], request.cas_config_opid_index, now)
    }

    /// Applies several edits as one configuration change. The combined
    /// change must still flip at most one voter's status.
    pub fn bulk_change_config(
        &self,
        ops: Vec<ConfigChangeOp>,
        cas_config_opid_index: Option<u64>,
        now: Instant,
    ) -> Result<OpId, ConsensusError> {
        self.apply_config_ops(ops, cas_config_opid_index, now)
    }

    /// Forces a configuration, bypassing the single-pending-change rule.
    /// Last resort for recovering a group that lost its majority.
    pub fn unsafe_change_config(
        &self,
        mut new_config: RaftConfig,
        now: Instant,
    ) -> Result<(), ConsensusError> {
        new_config.validate()?;
        let mut inner = self.inner.lock();
        inner.state.check_running()?;
        warn!(
            "event=unsafe_config_change group={} voters={}",
            self.options.group_id,
            new_config.voter_count()
        );
        if inner.state.is_leader() {
            let id = OpId::new(
                inner.state.current_term(),
                inner.pending.last_admitted().index + 1,
            );
            new_config.opid_index = Some(id.index);
            inner.state.set_pending_config(new_config.clone(), true)?;
            self.refresh_after_config_change(&mut inner, now);
            drop(inner);
            let payload = serde_json::to_vec(&new_config)
                .map_err(|err| ConsensusError::IllegalState(err.to_string()))?;
            self.replicate_round(OpType::ChangeConfig, payload, None, now)?;
            Ok(())
        } else {
            inner.state.set_pending_config(new_config, true)?;
            self.refresh_after_config_change(&mut inner, now);
            Ok(())
        }
    }

    fn apply_config_ops(
        &self,
        ops: Vec<ConfigChangeOp>,
        cas_config_opid_index: Option<u64>,
        now: Instant,
    ) -> Result<OpId, ConsensusError> {
        let payload = {
            let mut inner = self.inner.lock();
            inner.state.check_running()?;
            if !inner.state.is_leader() {
                return Err(ConsensusError::IllegalState("replica is not the leader".into()));
            }
            // Log continuity: nothing is known committed in this term yet,
            // so membership must not change.
            if !self.queue.lock().is_committed_index_in_current_term() {
                return Err(ConsensusError::IllegalState(
                    "no operation committed in the current term yet".into(),
                ));
            }
            if inner.state.has_pending_config() {
                return Err(ConsensusError::PendingConfigChange {
                    opid_index: inner
                        .state
                        .pending_config()
                        .and_then(|config| config.opid_index),
                });
            }
            let committed = inner.state.committed_config().clone();
            if let Some(expected) = cas_config_opid_index {
                if committed.opid_index != Some(expected) {
                    return Err(ConsensusError::CasFailed {
                        expected,
                        actual: committed.opid_index,
                    });
                }
            }

            let mut new_config = committed.clone();
            for op in ops {
                self.apply_one_config_op(&mut new_config, op)?;
            }
            if committed.voter_status_changes(&new_config) > 1 {
                return Err(ConsensusError::InvalidConfig(
                    "a configuration change may alter at most one voter".into(),
                ));
            }
            let id = OpId::new(
                inner.state.current_term(),
                inner.pending.last_admitted().index + 1,
            );
            new_config.opid_index = Some(id.index);
            new_config.validate()?;
            inner.state.set_pending_config(new_config.clone(), false)?;
            self.refresh_after_config_change(&mut inner, now);
            serde_json::to_vec(&new_config)
                .map_err(|err| ConsensusError::IllegalState(err.to_string()))?
        };
        self.replicate_round(OpType::ChangeConfig, payload, None, now)
    }

    fn apply_one_config_op(
        &self,
        config: &mut RaftConfig,
        op: ConfigChangeOp,
    ) -> Result<(), ConsensusError> {
        match op {
            ConfigChangeOp::AddPeer(spec) => {
                if config.is_member(&spec.uuid) {
                    return Err(ConsensusError::InvalidConfig(format!(
                        "peer {} is already a member",
                        spec.uuid
                    )));
                }
                config.peers.push(spec);
            }
            ConfigChangeOp::RemovePeer(uuid) => {
                if uuid == self.local_uuid {
                    return Err(ConsensusError::InvalidConfig(
                        "the leader cannot remove itself".into(),
                    ));
                }
                if !config.remove_peer(&uuid) {
                    return Err(ConsensusError::InvalidConfig(format!(
                        "peer {} is not a member",
                        uuid
                    )));
                }
            }
            ConfigChangeOp::SetMembership { uuid, membership } => {
                if uuid == self.local_uuid && membership == Membership::NonVoter {
                    return Err(ConsensusError::InvalidConfig(
                        "the leader cannot demote itself".into(),
                    ));
                }
                match config.peer_mut(&uuid) {
                    Some(peer) => peer.membership = membership,
                    None => {
                        return Err(ConsensusError::InvalidConfig(format!(
                            "peer {} is not a member",
                            uuid
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Queue notification handling
    // ---------------------------------------------------------------

    fn process_notifications(&self, notifications: Vec<QueueNotification>, now: Instant) {
        if notifications.is_empty() {
            return;
        }
        for notification in &notifications {
            match notification {
                QueueNotification::CommitIndexAdvanced(index) => {
                    let mut inner = self.inner.lock();
                    inner.pending.advance_committed_to(*index);
                    self.commit_pending_config_if_reached(&mut inner, *index, now);
                }
                QueueNotification::TermChanged(term) => {
                    self.handle_term_change(*term, now);
                }
                QueueNotification::PeerToPromote(uuid) => {
                    let request = ChangeConfigRequest {
                        op: ConfigChangeOp::SetMembership {
                            uuid: *uuid,
                            membership: Membership::Voter,
                        },
                        cas_config_opid_index: None,
                    };
                    if let Err(err) = self.change_config(request, now) {
                        debug!(
                            "event=auto_promotion_deferred group={} peer={} error={}",
                            self.options.group_id, uuid, err
                        );
                    }
                }
                QueueNotification::PeerFailed { uuid, term, reason } => {
                    warn!(
                        "event=peer_failed group={} peer={} term={} reason={}",
                        self.options.group_id, uuid, term, reason
                    );
                }
                QueueNotification::PeerToStartElection { uuid, .. } => {
                    info!(
                        "event=successor_ready group={} peer={}",
                        self.options.group_id, uuid
                    );
                }
                QueueNotification::PeerHealthChanged => {}
            }
        }
        let observers = self.observers.lock().clone();
        for observer in observers {
            dispatch_notifications(observer.as_ref(), notifications.clone());
        }
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("group_id", &self.options.group_id)
            .field("local_uuid", &self.local_uuid)
            .finish()
    }
}
