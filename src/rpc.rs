//! Request and response types exchanged between replicas, plus the
//! classification of exchange outcomes used for per-peer bookkeeping.
//! Wire encoding is the transport's concern, not ours.

use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

use crate::consensus::config::PeerSpec;
use crate::consensus::metadata::{LastKnownLeader, PreviousVote};
use crate::consensus::{OpId, ReplicateMsg};

/// Replication update from a leader to a follower.
#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub group_id: String,
    pub caller_uuid: Uuid,
    pub caller_term: u64,
    pub dest_uuid: Uuid,
    /// Id of the operation immediately before `ops`. The follower must hold
    /// a matching entry or reject with a log-matching error.
    pub preceding_op: OpId,
    pub ops: Vec<Arc<ReplicateMsg>>,
    pub committed_index: u64,
    pub all_replicated_index: u64,
    pub region_durable_index: u64,
    /// Leader-supplied safe timestamp for consumers that order reads.
    pub safe_timestamp: Option<u64>,
}

impl UpdateRequest {
    pub fn is_heartbeat(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Errors a follower reports inside an otherwise well-formed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateError {
    /// Caller's term is behind; the response's `responder_term` is newer.
    InvalidTerm,
    /// Log-matching failed at `preceding_op`.
    PrecedingEntryDidntMatch,
    /// No operation in the batch could be admitted.
    CannotPrepare,
    /// Soft overload; the caller should retry later.
    ServiceUnavailable,
    /// The replica exists but is in a failed state.
    ReplicaFailed,
    /// No replica with the requested group id on the responder.
    ReplicaNotFound,
    /// Payload checksum mismatch.
    Corruption,
}

/// Follower response to an [`UpdateRequest`].
#[derive(Debug, Clone)]
pub struct UpdateResponse {
    pub responder_uuid: Uuid,
    pub responder_term: u64,
    /// Last op in the responder's log, regardless of which leader sent it.
    pub last_received: OpId,
    /// Last op received from the *current* leader. Trails `last_received`
    /// until divergent entries from older leaders are resolved.
    pub last_received_current_leader: OpId,
    pub last_committed_index: u64,
    pub error: Option<UpdateError>,
}

impl UpdateResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Vote solicitation sent during a pre-election or a real election.
#[derive(Debug, Clone)]
pub struct VoteRequest {
    pub group_id: String,
    pub candidate_uuid: Uuid,
    pub candidate_term: u64,
    pub dest_uuid: Uuid,
    /// Candidate's last log entry, for the up-to-date check.
    pub last_received: OpId,
    pub is_pre_election: bool,
    /// Bypass the leader-is-alive check; set for leadership transfers.
    pub ignore_live_leader: bool,
    pub rpc_token: Option<String>,
}

/// Why a voter denied a vote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteDenialReason {
    InvalidTerm,
    AlreadyVoted,
    LeaderIsAlive,
    LastOpIdTooOld,
    Busy,
    Withheld,
    CandidateNotInConfig,
}

/// Voter response, carrying the context the flexible counter feeds on.
#[derive(Debug, Clone)]
pub struct VoteResponse {
    pub responder_uuid: Uuid,
    pub responder_term: u64,
    pub vote_granted: bool,
    pub denial_reason: Option<VoteDenialReason>,
    pub last_known_leader: Option<LastKnownLeader>,
    pub previous_vote_history: Vec<PreviousVote>,
    pub last_pruned_term: u64,
    /// The responder believes the candidate was removed from the config.
    pub is_candidate_removed: bool,
}

impl VoteResponse {
    pub fn granted(responder_uuid: Uuid, responder_term: u64) -> Self {
        Self {
            responder_uuid,
            responder_term,
            vote_granted: true,
            denial_reason: None,
            last_known_leader: None,
            previous_vote_history: Vec::new(),
            last_pruned_term: 0,
            is_candidate_removed: false,
        }
    }

    pub fn denied(responder_uuid: Uuid, responder_term: u64, reason: VoteDenialReason) -> Self {
        Self {
            responder_uuid,
            responder_term,
            vote_granted: false,
            denial_reason: Some(reason),
            last_known_leader: None,
            previous_vote_history: Vec::new(),
            last_pruned_term: 0,
            is_candidate_removed: false,
        }
    }
}

/// Transport-layer failure reaching a peer.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("request to {0} timed out")]
    Timeout(Uuid),
    #[error("network error reaching {peer}: {detail}")]
    Network { peer: Uuid, detail: String },
    #[error("no client for peer {0}")]
    NoClient(Uuid),
}

/// Last known outcome of an exchange with a tracked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// No round of communication yet.
    New,
    Ok,
    /// Remote error outside the more specific buckets.
    RemoteError,
    /// Network failure or timeout before a response arrived.
    RpcLayerError,
    ReplicaFailed,
    ReplicaNotFound,
    /// The responder's term is newer than ours.
    InvalidTerm,
    CannotPrepare,
    /// The responder's log diverged at `preceding_op`.
    LmpMismatch,
}

impl PeerStatus {
    pub fn classify(outcome: &Result<UpdateResponse, RpcError>) -> PeerStatus {
        match outcome {
            Err(_) => PeerStatus::RpcLayerError,
            Ok(response) => match &response.error {
                None => PeerStatus::Ok,
                Some(UpdateError::InvalidTerm) => PeerStatus::InvalidTerm,
                Some(UpdateError::PrecedingEntryDidntMatch) => PeerStatus::LmpMismatch,
                Some(UpdateError::CannotPrepare) => PeerStatus::CannotPrepare,
                Some(UpdateError::ReplicaFailed) => PeerStatus::ReplicaFailed,
                Some(UpdateError::ReplicaNotFound) => PeerStatus::ReplicaNotFound,
                Some(UpdateError::ServiceUnavailable) | Some(UpdateError::Corruption) => {
                    PeerStatus::RemoteError
                }
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerStatus::New => "NEW",
            PeerStatus::Ok => "OK",
            PeerStatus::RemoteError => "REMOTE_ERROR",
            PeerStatus::RpcLayerError => "RPC_LAYER_ERROR",
            PeerStatus::ReplicaFailed => "REPLICA_FAILED",
            PeerStatus::ReplicaNotFound => "REPLICA_NOT_FOUND",
            PeerStatus::InvalidTerm => "INVALID_TERM",
            PeerStatus::CannotPrepare => "CANNOT_PREPARE",
            PeerStatus::LmpMismatch => "LMP_MISMATCH",
        }
    }
}

/// A per-peer handle supplied by the embedding transport. Calls block until
/// the response arrives or the deadline passes; the engine drives them from
/// its own worker threads and never assumes a particular wire format.
pub trait PeerClient: Send + Sync {
    fn update(&self, request: &UpdateRequest, deadline: Instant)
        -> Result<UpdateResponse, RpcError>;

    fn request_vote(
        &self,
        request: &VoteRequest,
        deadline: Instant,
    ) -> Result<VoteResponse, RpcError>;
}

/// Factory producing per-peer handles.
pub trait PeerClientFactory: Send + Sync {
    fn client_for(&self, peer: &PeerSpec) -> Result<Arc<dyn PeerClient>, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matrix() {
        let uuid = Uuid::new_v4();
        let ok = UpdateResponse {
            responder_uuid: uuid,
            responder_term: 1,
            last_received: OpId::new(1, 1),
            last_received_current_leader: OpId::new(1, 1),
            last_committed_index: 0,
            error: None,
        };
        assert_eq!(PeerStatus::classify(&Ok(ok.clone())), PeerStatus::Ok);

        let mut mismatch = ok.clone();
        mismatch.error = Some(UpdateError::PrecedingEntryDidntMatch);
        assert_eq!(
            PeerStatus::classify(&Ok(mismatch)),
            PeerStatus::LmpMismatch
        );

        let mut stale = ok;
        stale.error = Some(UpdateError::InvalidTerm);
        assert_eq!(PeerStatus::classify(&Ok(stale)), PeerStatus::InvalidTerm);

        assert_eq!(
            PeerStatus::classify(&Err(RpcError::Timeout(uuid))),
            PeerStatus::RpcLayerError
        );
    }
}
