use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced to callers of the consensus engine. Where a request was
/// rejected because of a stale term, the current term rides along so the
/// caller can retarget to a newer leader.
#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("request term {request_term} is behind current term {current_term}")]
    InvalidTerm {
        request_term: u64,
        current_term: u64,
    },
    #[error("already voted for {candidate} in term {term}")]
    AlreadyVoted { term: u64, candidate: Uuid },
    #[error("rejecting vote request: leader {leader} is alive in term {term}")]
    LeaderIsAlive { term: u64, leader: Uuid },
    #[error("candidate log is stale: candidate has {candidate_last}, local last is {local_last}")]
    LastOpIdTooOld {
        candidate_last: crate::consensus::OpId,
        local_last: crate::consensus::OpId,
    },
    #[error("consensus is busy processing a competing request")]
    ConsensusBusy,
    #[error("vote withheld: {reason}")]
    VoteWithheld { reason: String },
    #[error("candidate {candidate} is not a voter in the active configuration")]
    CandidateNotInConfig { candidate: Uuid },
    #[error("preceding entry did not match: local last received is {last_received}")]
    PrecedingEntryDidntMatch {
        last_received: crate::consensus::OpId,
    },
    #[error("could not prepare any operation in the batch")]
    CannotPrepare,
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("config change CAS failed: expected opid index {expected}, committed config has {actual:?}")]
    CasFailed { expected: u64, actual: Option<u64> },
    #[error("no configuration change is pending")]
    NoConfigChangePending,
    #[error("a configuration change is already pending at opid index {opid_index:?}")]
    PendingConfigChange { opid_index: Option<u64> },
    #[error("illegal state: {0}")]
    IllegalState(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("payload corruption: {0}")]
    Corruption(String),
}

impl ConsensusError {
    /// Whether a caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsensusError::ConsensusBusy | ConsensusError::ServiceUnavailable(_)
        )
    }
}
