use log::{info, warn};
use std::collections::HashSet;
use std::time::Instant;
use uuid::Uuid;

use crate::election::counter::{ElectionVote, VoteCounter, VoteInfo};
use crate::rpc::{RpcError, VoteRequest, VoteResponse};

/// What kind of election to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionMode {
    /// Gather votes for `current_term + 1` without persisting anything;
    /// a granted pre-election is followed by a real one.
    PreElection,
    /// A real election: term advances and the self-vote persists first.
    NormalElection,
    /// A real election that asks voters to ignore a live leader; used for
    /// leadership transfer.
    ElectEvenIfLeaderIsAlive,
}

impl ElectionMode {
    pub fn is_pre_election(&self) -> bool {
        matches!(self, ElectionMode::PreElection)
    }
}

/// The outcome of one election, delivered to the decision callback exactly
/// once.
#[derive(Debug, Clone)]
pub struct ElectionOutcome {
    pub candidate_term: u64,
    pub is_pre_election: bool,
    pub decision: ElectionVote,
    /// Highest term any voter reported; on a higher-term denial the
    /// replica advances to it.
    pub highest_voter_term: u64,
    pub message: String,
    pub is_candidate_removed: bool,
}

type DecisionCallback = Box<dyn FnMut(&ElectionOutcome) + Send>;

/// Runs a single election: aggregates responses through a vote counter and
/// delivers the decision exactly once. The driver owns no I/O; the replica
/// dispatches the prepared vote requests and routes responses (or
/// transport errors) back via [`ElectionDriver::record_response`].
pub struct ElectionDriver {
    request: VoteRequest,
    counter: Box<dyn VoteCounter>,
    expected_voters: HashSet<Uuid>,
    highest_voter_term: u64,
    outcome: Option<ElectionOutcome>,
    responded: bool,
    callback: DecisionCallback,
}

impl ElectionDriver {
    /// `counter` must already hold the candidate's self-vote;
    /// `other_voters` are the peers that will be solicited.
    pub fn new(
        request: VoteRequest,
        counter: Box<dyn VoteCounter>,
        other_voters: impl IntoIterator<Item = Uuid>,
        callback: impl FnMut(&ElectionOutcome) + Send + 'static,
    ) -> Self {
        assert!(
            counter.votes_counted() >= 1,
            "candidate must vote for itself before soliciting peers"
        );
        Self {
            request,
            counter,
            expected_voters: other_voters.into_iter().collect(),
            highest_voter_term: 0,
            outcome: None,
            responded: false,
            callback: Box::new(callback),
        }
    }

    pub fn request(&self) -> &VoteRequest {
        &self.request
    }

    pub fn election_term(&self) -> u64 {
        self.request.candidate_term
    }

    pub fn is_pre_election(&self) -> bool {
        self.request.is_pre_election
    }

    /// Builds the request to send to one voter.
    pub fn request_for(&self, voter: &Uuid) -> VoteRequest {
        let mut request = self.request.clone();
        request.dest_uuid = *voter;
        request
    }

    pub fn voters_to_solicit(&self) -> Vec<Uuid> {
        self.expected_voters.iter().copied().collect()
    }

    /// Checks for a decision with only the votes registered so far. Called
    /// right after construction so a single-voter configuration decides
    /// without any RPCs.
    pub fn start(&mut self, now: Instant) {
        info!(
            "event=election_started term={} pre_election={} voters_to_solicit={}",
            self.election_term(),
            self.is_pre_election(),
            self.expected_voters.len()
        );
        self.check_for_decision(now);
    }

    /// Feeds one voter's response (or transport failure) into the counter.
    /// RPC errors count as denials with no responder-term adjustment.
    pub fn record_response(
        &mut self,
        voter: Uuid,
        outcome: &Result<VoteResponse, RpcError>,
        now: Instant,
    ) {
        if !self.expected_voters.contains(&voter) {
            warn!(
                "event=vote_from_unexpected_peer term={} voter={}",
                self.election_term(),
                voter
            );
            return;
        }
        match outcome {
            Err(err) => {
                warn!(
                    "event=vote_rpc_error term={} voter={} error={}",
                    self.election_term(),
                    voter,
                    err
                );
                self.register(voter, VoteInfo::denied());
            }
            Ok(response) if response.responder_uuid != voter => {
                // The peer answering is not who we addressed; our view of
                // the config is inconsistent, so the vote cannot count.
                warn!(
                    "event=vote_responder_mismatch term={} expected={} actual={}",
                    self.election_term(),
                    voter,
                    response.responder_uuid
                );
                self.register(voter, VoteInfo::denied());
            }
            Ok(response) => {
                self.highest_voter_term = self.highest_voter_term.max(response.responder_term);
                if !response.vote_granted && response.responder_term > self.election_term() {
                    self.cancel_with_higher_term(response);
                } else {
                    let info = VoteInfo {
                        vote: if response.vote_granted {
                            ElectionVote::Granted
                        } else {
                            ElectionVote::Denied
                        },
                        last_known_leader: response.last_known_leader,
                        previous_vote_history: response.previous_vote_history.clone(),
                        last_pruned_term: response.last_pruned_term,
                        is_candidate_removed: response.is_candidate_removed,
                    };
                    self.register(voter, info);
                }
            }
        }
        self.check_for_decision(now);
    }

    /// Cancels the election, delivering a denial if none was delivered
    /// yet. Used when the replica leaves the candidate role.
    pub fn cancel(&mut self, reason: &str) {
        if self.outcome.is_none() {
            self.outcome = Some(ElectionOutcome {
                candidate_term: self.election_term(),
                is_pre_election: self.is_pre_election(),
                decision: ElectionVote::Denied,
                highest_voter_term: self.highest_voter_term,
                message: format!("election cancelled: {}", reason),
                is_candidate_removed: false,
            });
        }
        self.respond_if_decided();
    }

    pub fn has_responded(&self) -> bool {
        self.responded
    }

    fn register(&mut self, voter: Uuid, info: VoteInfo) {
        match self.counter.register_vote(voter, info) {
            Ok(true) => warn!(
                "event=duplicate_vote term={} voter={}",
                self.election_term(),
                voter
            ),
            Ok(false) => {}
            Err(err) => warn!(
                "event=vote_rejected term={} voter={} error={}",
                self.election_term(),
                voter,
                err
            ),
        }
    }

    /// A voter with a higher term invalidates the election outright; the
    /// replica uses `highest_voter_term` to advance.
    fn cancel_with_higher_term(&mut self, response: &VoteResponse) {
        if self.outcome.is_none() {
            info!(
                "event=election_cancelled_by_higher_term term={} responder_term={}",
                self.election_term(),
                response.responder_term
            );
            self.outcome = Some(ElectionOutcome {
                candidate_term: self.election_term(),
                is_pre_election: self.is_pre_election(),
                decision: ElectionVote::Denied,
                highest_voter_term: response.responder_term,
                message: format!(
                    "vote denied by {} with higher term {}",
                    response.responder_uuid, response.responder_term
                ),
                is_candidate_removed: response.is_candidate_removed,
            });
        }
    }

    fn check_for_decision(&mut self, now: Instant) {
        if self.outcome.is_none() && self.counter.is_decided(now) {
            let decision = self
                .counter
                .decision(now)
                .expect("decided counter yields a decision");
            info!(
                "event=election_decided term={} pre_election={} granted={}",
                self.election_term(),
                self.is_pre_election(),
                decision == ElectionVote::Granted
            );
            self.outcome = Some(ElectionOutcome {
                candidate_term: self.election_term(),
                is_pre_election: self.is_pre_election(),
                decision,
                highest_voter_term: self.highest_voter_term,
                message: match decision {
                    ElectionVote::Granted => "achieved required quorum".to_string(),
                    ElectionVote::Denied => "could not achieve required quorum".to_string(),
                },
                is_candidate_removed: self.counter.is_candidate_removed(),
            });
        }
        self.respond_if_decided();
    }

    fn respond_if_decided(&mut self) {
        if self.responded {
            return;
        }
        if let Some(outcome) = self.outcome.clone() {
            self.responded = true;
            (self.callback)(&outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::election::counter::MajorityVoteCounter;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn vote_request(candidate: Uuid, term: u64, pre: bool) -> VoteRequest {
        VoteRequest {
            group_id: "group-1".into(),
            candidate_uuid: candidate,
            candidate_term: term,
            dest_uuid: candidate,
            last_received: crate::consensus::OpId::new(1, 1),
            is_pre_election: pre,
            ignore_live_leader: false,
            rpc_token: None,
        }
    }

    fn self_voted_counter(num_voters: usize) -> Box<dyn VoteCounter> {
        let mut counter = MajorityVoteCounter::new(num_voters, num_voters / 2 + 1);
        counter
            .register_vote(Uuid::new_v4(), VoteInfo::granted())
            .unwrap();
        Box::new(counter)
    }

    fn driver_with_outcomes(
        num_voters: usize,
        voters: Vec<Uuid>,
    ) -> (ElectionDriver, Arc<Mutex<Vec<ElectionOutcome>>>) {
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let sink = outcomes.clone();
        let candidate = Uuid::new_v4();
        let driver = ElectionDriver::new(
            vote_request(candidate, 3, false),
            self_voted_counter(num_voters),
            voters,
            move |outcome| sink.lock().unwrap().push(outcome.clone()),
        );
        (driver, outcomes)
    }

    #[test]
    fn single_voter_decides_at_start() {
        let (mut driver, outcomes) = driver_with_outcomes(1, Vec::new());
        driver.start(Instant::now());
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].decision, ElectionVote::Granted);
    }

    #[test]
    fn majority_grant_delivers_once() {
        let voters: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let (mut driver, outcomes) = driver_with_outcomes(3, voters.clone());
        let now = Instant::now();
        driver.start(now);
        assert!(outcomes.lock().unwrap().is_empty());

        driver.record_response(
            voters[0],
            &Ok(VoteResponse::granted(voters[0], 3)),
            now,
        );
        driver.record_response(
            voters[1],
            &Ok(VoteResponse::granted(voters[1], 3)),
            now,
        );
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1, "decision fires exactly once");
        assert_eq!(outcomes[0].decision, ElectionVote::Granted);
    }

    #[test]
    fn rpc_error_counts_as_denial() {
        let voters: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let (mut driver, outcomes) = driver_with_outcomes(3, voters.clone());
        let now = Instant::now();
        driver.start(now);
        driver.record_response(voters[0], &Err(RpcError::Timeout(voters[0])), now);
        driver.record_response(voters[1], &Err(RpcError::Timeout(voters[1])), now);
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].decision, ElectionVote::Denied);
        // A timed-out vote must not adjust the responder term.
        assert_eq!(outcomes[0].highest_voter_term, 0);
    }

    #[test]
    fn higher_term_response_cancels_election() {
        let voters: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let (mut driver, outcomes) = driver_with_outcomes(3, voters.clone());
        let now = Instant::now();
        driver.start(now);
        driver.record_response(
            voters[0],
            &Ok(VoteResponse::denied(
                voters[0],
                9,
                crate::rpc::VoteDenialReason::InvalidTerm,
            )),
            now,
        );
        let outcomes = outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].decision, ElectionVote::Denied);
        assert_eq!(outcomes[0].highest_voter_term, 9);
    }

    #[test]
    fn responder_uuid_mismatch_is_a_denial() {
        let voters: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let (mut driver, _outcomes) = driver_with_outcomes(3, voters.clone());
        let now = Instant::now();
        driver.start(now);
        let impostor = Uuid::new_v4();
        driver.record_response(voters[0], &Ok(VoteResponse::granted(impostor, 3)), now);
        assert!(!driver.has_responded());
    }

    #[test]
    fn cancel_delivers_denial_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter_fired = fired.clone();
        let candidate = Uuid::new_v4();
        let voter = Uuid::new_v4();
        let mut driver = ElectionDriver::new(
            vote_request(candidate, 4, true),
            self_voted_counter(3),
            [voter],
            move |outcome| {
                assert_eq!(outcome.decision, ElectionVote::Denied);
                counter_fired.fetch_add(1, Ordering::SeqCst);
            },
        );
        driver.start(Instant::now());
        driver.cancel("stepping down");
        driver.cancel("stepping down again");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }
}
