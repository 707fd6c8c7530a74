use std::collections::HashMap;
use std::time::Instant;
use thiserror::Error;
use uuid::Uuid;

use crate::consensus::metadata::{LastKnownLeader, PreviousVote};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionVote {
    Granted,
    Denied,
}

/// One voter's response as fed to a counter, with the context the flexible
/// counter mines: the voter's view of the last leader, its vote history and
/// how much of that history has been pruned.
#[derive(Debug, Clone)]
pub struct VoteInfo {
    pub vote: ElectionVote,
    pub last_known_leader: Option<LastKnownLeader>,
    pub previous_vote_history: Vec<PreviousVote>,
    pub last_pruned_term: u64,
    pub is_candidate_removed: bool,
}

impl VoteInfo {
    pub fn granted() -> Self {
        Self {
            vote: ElectionVote::Granted,
            last_known_leader: None,
            previous_vote_history: Vec::new(),
            last_pruned_term: 0,
            is_candidate_removed: false,
        }
    }

    pub fn denied() -> Self {
        Self {
            vote: ElectionVote::Denied,
            last_known_leader: None,
            previous_vote_history: Vec::new(),
            last_pruned_term: 0,
            is_candidate_removed: false,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VoteError {
    #[error("voter {voter} voted a different way twice in the same election")]
    ChangedVote { voter: Uuid },
    #[error("vote from {voter} would exceed the expected {expected} voters")]
    TooManyVotes { voter: Uuid, expected: usize },
    #[error("voter {voter} is not in the configuration")]
    UnknownVoter { voter: Uuid },
}

/// Vote aggregation for one election. Implementations differ in how they
/// decide; registration semantics are shared: duplicates are ignored,
/// changed votes are an error.
pub trait VoteCounter: Send {
    /// Registers a vote. Returns true when this exact vote was already
    /// registered (a harmless duplicate).
    fn register_vote(&mut self, voter: Uuid, info: VoteInfo) -> Result<bool, VoteError>;

    /// Whether the outcome is final given the votes so far. `now` matters
    /// to counters with time-dependent fallback paths.
    fn is_decided(&self, now: Instant) -> bool;

    /// The decision, once [`VoteCounter::is_decided`] holds.
    fn decision(&self, now: Instant) -> Option<ElectionVote>;

    fn votes_counted(&self) -> usize;

    fn are_all_votes_in(&self) -> bool;

    /// True when some denial indicated the candidate was removed from the
    /// configuration.
    fn is_candidate_removed(&self) -> bool;
}

/// Classic majority counting: granted at `majority_size` yes votes, denied
/// once enough no votes make that unreachable.
#[derive(Debug)]
pub struct MajorityVoteCounter {
    num_voters: usize,
    majority_size: usize,
    votes: HashMap<Uuid, VoteInfo>,
    yes_votes: usize,
    no_votes: usize,
    candidate_removed: bool,
}

impl MajorityVoteCounter {
    pub fn new(num_voters: usize, majority_size: usize) -> Self {
        assert!(num_voters > 0);
        assert!(majority_size > 0 && majority_size <= num_voters);
        Self {
            num_voters,
            majority_size,
            votes: HashMap::new(),
            yes_votes: 0,
            no_votes: 0,
            candidate_removed: false,
        }
    }

    pub fn yes_votes(&self) -> usize {
        self.yes_votes
    }

    pub fn no_votes(&self) -> usize {
        self.no_votes
    }
}

impl VoteCounter for MajorityVoteCounter {
    fn register_vote(&mut self, voter: Uuid, info: VoteInfo) -> Result<bool, VoteError> {
        if let Some(prior) = self.votes.get(&voter) {
            if prior.vote != info.vote {
                return Err(VoteError::ChangedVote { voter });
            }
            return Ok(true);
        }
        if self.votes.len() == self.num_voters {
            return Err(VoteError::TooManyVotes {
                voter,
                expected: self.num_voters,
            });
        }
        match info.vote {
            ElectionVote::Granted => self.yes_votes += 1,
            ElectionVote::Denied => {
                self.no_votes += 1;
                self.candidate_removed = self.candidate_removed || info.is_candidate_removed;
            }
        }
        self.votes.insert(voter, info);
        Ok(false)
    }

    fn is_decided(&self, _now: Instant) -> bool {
        self.yes_votes >= self.majority_size
            || self.no_votes > self.num_voters - self.majority_size
    }

    fn decision(&self, _now: Instant) -> Option<ElectionVote> {
        if self.yes_votes >= self.majority_size {
            Some(ElectionVote::Granted)
        } else if self.no_votes > self.num_voters - self.majority_size {
            Some(ElectionVote::Denied)
        } else {
            None
        }
    }

    fn votes_counted(&self) -> usize {
        self.yes_votes + self.no_votes
    }

    fn are_all_votes_in(&self) -> bool {
        self.votes_counted() == self.num_voters
    }

    fn is_candidate_removed(&self) -> bool {
        self.candidate_removed
    }
}
