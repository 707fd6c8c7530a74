use log::{info, warn};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::consensus::config::RaftConfig;
use crate::consensus::metadata::{
    ConsensusMetadata, LastKnownLeader, MetadataError, MetadataStore,
};
use crate::error::ConsensusError;

/// Lifecycle of a replica. Only the transitions listed in
/// [`ReplicaLifecycle::can_transition_to`] are legal; anything else is an
/// internal bug and panics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReplicaLifecycle {
    New,
    Initialized,
    Running,
    Stopping,
    Stopped,
    Shutdown,
}

impl ReplicaLifecycle {
    fn can_transition_to(self, next: ReplicaLifecycle) -> bool {
        use ReplicaLifecycle::*;
        matches!(
            (self, next),
            (New, Initialized)
                | (Initialized, Running)
                | (Initialized, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Stopped, Shutdown)
        )
    }
}

/// Role a replica currently plays in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RaftRole {
    Leader,
    Follower,
    /// A non-voter replicating the log but not participating in quorums.
    Learner,
    /// Not a member of the active configuration.
    NonParticipant,
}

/// Controls whether a term advance flushes metadata immediately or leaves
/// the flush to a follow-up durable write that subsumes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Flush,
    SkipFlush,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("term {attempted} does not exceed current term {current}")]
    IllegalTerm { current: u64, attempted: u64 },
    #[error(transparent)]
    Metadata(#[from] MetadataError),
}

impl From<StateError> for ConsensusError {
    fn from(err: StateError) -> Self {
        ConsensusError::IllegalState(err.to_string())
    }
}

/// Owns term, vote, configuration, leader identity and lifecycle. All
/// mutation happens through these methods, under the replica lock held by
/// the caller; durable metadata writes complete before a change is
/// observable.
pub struct ReplicaState {
    local_uuid: Uuid,
    lifecycle: ReplicaLifecycle,
    meta: ConsensusMetadata,
    store: MetadataStore,
    leader_uuid: Option<Uuid>,
    /// True while this replica runs the leader pipeline.
    is_leader: bool,
    failed_elections_since_stable_leader: u64,
    /// Dirty when `SkipFlush` deferred a metadata write.
    flush_pending: bool,
}

impl ReplicaState {
    /// Loads existing metadata from `store`, or seeds it with
    /// `initial_config` on first start.
    pub fn open(
        local_uuid: Uuid,
        store: MetadataStore,
        initial_config: RaftConfig,
    ) -> Result<Self, StateError> {
        let meta = if store.exists() {
            store.load()?
        } else {
            let meta = ConsensusMetadata::new(initial_config);
            store.persist(&meta)?;
            meta
        };
        Ok(Self {
            local_uuid,
            lifecycle: ReplicaLifecycle::New,
            meta,
            store,
            leader_uuid: None,
            is_leader: false,
            failed_elections_since_stable_leader: 0,
            flush_pending: false,
        })
    }

    pub fn local_uuid(&self) -> Uuid {
        self.local_uuid
    }

    pub fn lifecycle(&self) -> ReplicaLifecycle {
        self.lifecycle
    }

    pub fn transition(&mut self, next: ReplicaLifecycle) {
        assert!(
            self.lifecycle.can_transition_to(next),
            "illegal lifecycle transition {:?} -> {:?}",
            self.lifecycle,
            next
        );
        info!(
            "event=lifecycle_transition from={:?} to={:?}",
            self.lifecycle, next
        );
        self.lifecycle = next;
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == ReplicaLifecycle::Running
    }

    pub fn check_running(&self) -> Result<(), ConsensusError> {
        if self.is_running() {
            Ok(())
        } else {
            Err(ConsensusError::IllegalState(format!(
                "replica is {:?}",
                self.lifecycle
            )))
        }
    }

    pub fn current_term(&self) -> u64 {
        self.meta.current_term
    }

    pub fn voted_for(&self) -> Option<Uuid> {
        self.meta.voted_for
    }

    pub fn leader_uuid(&self) -> Option<Uuid> {
        self.leader_uuid
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader
    }

    pub fn role(&self) -> RaftRole {
        let config = self.active_config();
        match config.peer(&self.local_uuid) {
            None => RaftRole::NonParticipant,
            Some(peer) if !peer.is_voter() => RaftRole::Learner,
            Some(_) if self.is_leader => RaftRole::Leader,
            Some(_) => RaftRole::Follower,
        }
    }

    pub fn last_known_leader(&self) -> Option<LastKnownLeader> {
        self.meta.last_known_leader
    }

    pub fn metadata(&self) -> &ConsensusMetadata {
        &self.meta
    }

    pub fn failed_elections_since_stable_leader(&self) -> u64 {
        self.failed_elections_since_stable_leader
    }

    pub fn record_failed_election(&mut self) {
        self.failed_elections_since_stable_leader += 1;
    }

    /// Advances the current term, clearing the vote and the leader. Fails
    /// unless `new_term` strictly exceeds the current term. With
    /// `FlushMode::Flush` the metadata is durable before this returns; with
    /// `SkipFlush` the caller promises a follow-up durable write.
    pub fn advance_term(&mut self, new_term: u64, flush: FlushMode) -> Result<(), StateError> {
        if new_term <= self.meta.current_term {
            return Err(StateError::IllegalTerm {
                current: self.meta.current_term,
                attempted: new_term,
            });
        }
        info!(
            "event=term_advance from={} to={} was_leader={}",
            self.meta.current_term, new_term, self.is_leader
        );
        self.is_leader = false;
        self.meta.current_term = new_term;
        self.meta.voted_for = None;
        self.leader_uuid = None;
        match flush {
            FlushMode::Flush => {
                self.store.persist(&self.meta)?;
                self.flush_pending = false;
            }
            FlushMode::SkipFlush => self.flush_pending = true,
        }
        Ok(())
    }

    /// Records a vote for `candidate` in the current term. The vote and its
    /// history entry are durable before this returns.
    pub fn record_vote(&mut self, candidate: Uuid) -> Result<(), StateError> {
        assert!(
            self.meta.voted_for.is_none(),
            "vote already cast in term {}",
            self.meta.current_term
        );
        self.meta.voted_for = Some(candidate);
        self.meta
            .record_vote_history(self.meta.current_term, candidate);
        self.store.persist(&self.meta)?;
        self.flush_pending = false;
        info!(
            "event=vote_recorded term={} candidate={}",
            self.meta.current_term, candidate
        );
        Ok(())
    }

    /// Marks `uuid` as the leader of the current term and resets the failed
    /// election counter.
    pub fn set_leader(&mut self, uuid: Uuid) -> Result<(), StateError> {
        self.leader_uuid = Some(uuid);
        self.is_leader = uuid == self.local_uuid;
        self.failed_elections_since_stable_leader = 0;
        let changed = self.meta.observe_leader(self.meta.current_term, uuid);
        if changed || self.flush_pending {
            self.store.persist(&self.meta)?;
            self.flush_pending = false;
        }
        info!(
            "event=leader_set term={} leader={} local={}",
            self.meta.current_term, uuid, self.is_leader
        );
        Ok(())
    }

    pub fn clear_leader(&mut self) {
        if self.leader_uuid.is_some() {
            info!(
                "event=leader_cleared term={} was={:?}",
                self.meta.current_term, self.leader_uuid
            );
        }
        self.leader_uuid = None;
        self.is_leader = false;
    }

    /// Persists any metadata change deferred by a `SkipFlush` term advance
    /// whose promised follow-up write never happened.
    pub fn flush_if_pending(&mut self) -> Result<(), StateError> {
        if self.flush_pending {
            self.store.persist(&self.meta)?;
            self.flush_pending = false;
        }
        Ok(())
    }

    pub fn committed_config(&self) -> &RaftConfig {
        &self.meta.committed_config
    }

    pub fn pending_config(&self) -> Option<&RaftConfig> {
        self.meta.pending_config.as_ref()
    }

    pub fn has_pending_config(&self) -> bool {
        self.meta.pending_config.is_some()
    }

    /// The pending config when one exists, else the committed config.
    pub fn active_config(&self) -> &RaftConfig {
        self.meta
            .pending_config
            .as_ref()
            .unwrap_or(&self.meta.committed_config)
    }

    /// Installs a pending configuration. Fails when one already exists
    /// unless `unsafe_override` is set, and always validates structure.
    pub fn set_pending_config(
        &mut self,
        config: RaftConfig,
        unsafe_override: bool,
    ) -> Result<(), ConsensusError> {
        if self.meta.pending_config.is_some() && !unsafe_override {
            return Err(ConsensusError::PendingConfigChange {
                opid_index: self
                    .meta
                    .pending_config
                    .as_ref()
                    .and_then(|config| config.opid_index),
            });
        }
        config.validate()?;
        info!(
            "event=pending_config_set opid_index={:?} unsafe={}",
            config.opid_index, unsafe_override
        );
        self.meta.pending_config = Some(config);
        self.store
            .persist(&self.meta)
            .map_err(|err| ConsensusError::IllegalState(err.to_string()))?;
        Ok(())
    }

    /// Drops the pending configuration, reverting the active config to the
    /// committed one. Used when a config-change round aborts.
    pub fn clear_pending_config(&mut self) -> Result<(), ConsensusError> {
        if self.meta.pending_config.take().is_some() {
            warn!("event=pending_config_cleared");
            self.store
                .persist(&self.meta)
                .map_err(|err| ConsensusError::IllegalState(err.to_string()))?;
        }
        Ok(())
    }

    /// Promotes `config` to committed. It must equal the currently pending
    /// config unless `unsafe_override` allows replacing state wholesale.
    pub fn commit_pending_config(
        &mut self,
        config: RaftConfig,
        unsafe_override: bool,
    ) -> Result<(), ConsensusError> {
        match &self.meta.pending_config {
            Some(pending) if *pending == config || unsafe_override => {}
            Some(pending) => {
                panic!(
                    "committing config at opid_index {:?} but pending is at {:?}",
                    config.opid_index, pending.opid_index
                );
            }
            None => return Err(ConsensusError::NoConfigChangePending),
        }
        // Peers dropped by the new config are remembered so their future
        // vote requests can be answered with a removal hint.
        for peer in &self.meta.committed_config.peers {
            if !config.is_member(&peer.uuid) && !self.meta.removed_peers.contains(&peer.uuid) {
                self.meta.removed_peers.push(peer.uuid);
            }
        }
        self.meta.removed_peers.retain(|uuid| !config.is_member(uuid));
        info!(
            "event=config_committed opid_index={:?} voters={}",
            config.opid_index,
            config.voter_count()
        );
        self.meta.committed_config = config;
        self.meta.pending_config = None;
        self.store
            .persist(&self.meta)
            .map_err(|err| ConsensusError::IllegalState(err.to_string()))?;
        Ok(())
    }

    pub fn removed_peers(&self) -> &[Uuid] {
        &self.meta.removed_peers
    }

    pub fn clear_removed_peers(&mut self) -> Result<(), StateError> {
        self.meta.removed_peers.clear();
        self.store.persist(&self.meta)?;
        Ok(())
    }

    pub fn delete_from_removed_peers(&mut self, uuids: &[Uuid]) -> Result<(), StateError> {
        self.meta.removed_peers.retain(|uuid| !uuids.contains(uuid));
        self.store.persist(&self.meta)?;
        Ok(())
    }
}

impl std::fmt::Debug for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicaState")
            .field("local_uuid", &self.local_uuid)
            .field("lifecycle", &self.lifecycle)
            .field("term", &self.meta.current_term)
            .field("leader", &self.leader_uuid)
            .field("role", &self.role())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::config::{CommitRule, PeerSpec};
    use tempfile::TempDir;

    fn state(tmp: &TempDir, local: Uuid) -> ReplicaState {
        let config = RaftConfig::new(
            vec![
                PeerSpec::voter(local, "a:1", Some("r1")),
                PeerSpec::voter(Uuid::new_v4(), "b:1", Some("r1")),
            ],
            CommitRule::ClassicMajority,
        );
        ReplicaState::open(
            local,
            MetadataStore::new(tmp.path().join("meta.json")),
            config,
        )
        .unwrap()
    }

    #[test]
    fn term_advance_clears_vote_and_leader() {
        let tmp = TempDir::new().unwrap();
        let local = Uuid::new_v4();
        let mut state = state(&tmp, local);
        state.advance_term(1, FlushMode::Flush).unwrap();
        state.record_vote(local).unwrap();
        state.set_leader(local).unwrap();
        assert!(state.is_leader());

        state.advance_term(2, FlushMode::Flush).unwrap();
        assert_eq!(state.current_term(), 2);
        assert_eq!(state.voted_for(), None);
        assert_eq!(state.leader_uuid(), None);
        assert!(!state.is_leader());

        let err = state.advance_term(2, FlushMode::Flush).unwrap_err();
        assert!(matches!(err, StateError::IllegalTerm { .. }));
    }

    #[test]
    fn durable_term_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let local = Uuid::new_v4();
        {
            let mut state = state(&tmp, local);
            state.advance_term(9, FlushMode::Flush).unwrap();
            state.record_vote(local).unwrap();
        }
        let reopened = state(&tmp, local);
        assert_eq!(reopened.current_term(), 9);
        assert_eq!(reopened.voted_for(), Some(local));
    }

    #[test]
    #[should_panic(expected = "illegal lifecycle transition")]
    fn illegal_lifecycle_transition_panics() {
        let tmp = TempDir::new().unwrap();
        let mut state = state(&tmp, Uuid::new_v4());
        state.transition(ReplicaLifecycle::Running);
    }

    #[test]
    fn pending_config_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let local = Uuid::new_v4();
        let mut state = state(&tmp, local);

        let mut next = state.committed_config().clone();
        next.peers
            .push(PeerSpec::voter(Uuid::new_v4(), "c:1", Some("r2")));
        next.opid_index = Some(4);

        state.set_pending_config(next.clone(), false).unwrap();
        assert_eq!(state.active_config(), &next);

        let err = state
            .set_pending_config(next.clone(), false)
            .unwrap_err();
        assert!(matches!(err, ConsensusError::PendingConfigChange { .. }));

        state.commit_pending_config(next.clone(), false).unwrap();
        assert_eq!(state.committed_config(), &next);
        assert!(state.pending_config().is_none());
    }

    #[test]
    fn removing_a_peer_records_it() {
        let tmp = TempDir::new().unwrap();
        let local = Uuid::new_v4();
        let mut state = state(&tmp, local);
        let evicted = state.committed_config().peers[1].uuid;

        let mut next = state.committed_config().clone();
        next.remove_peer(&evicted);
        next.opid_index = Some(2);
        state.set_pending_config(next.clone(), false).unwrap();
        state.commit_pending_config(next, false).unwrap();
        assert_eq!(state.removed_peers(), &[evicted]);

        state.delete_from_removed_peers(&[evicted]).unwrap();
        assert!(state.removed_peers().is_empty());
    }

    #[test]
    fn role_follows_config_membership() {
        let tmp = TempDir::new().unwrap();
        let local = Uuid::new_v4();
        let mut state = state(&tmp, local);
        assert_eq!(state.role(), RaftRole::Follower);
        state.advance_term(1, FlushMode::Flush).unwrap();
        state.set_leader(local).unwrap();
        assert_eq!(state.role(), RaftRole::Leader);
    }
}
