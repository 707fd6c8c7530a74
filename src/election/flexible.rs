use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::consensus::config::{majority_size, CommitRule, RaftConfig, RulePredicate};
use crate::consensus::metadata::LastKnownLeader;
use crate::election::counter::{ElectionVote, VoteCounter, VoteError, VoteInfo};
use crate::timeouts;

/// Bound on the history-walk iterations. The algorithm terminates on its
/// own; the cap guards against future bugs.
const HISTORY_ITERATION_CAP: usize = 64;

/// Knobs governing the flexible decision procedure.
#[derive(Debug, Clone)]
pub struct FlexiblePolicies {
    /// Merge the last-known-leader reported by each voter into our own.
    pub crowdsource_last_known_leader: bool,
    /// Additionally require majorities in a majority of regions.
    pub strict_leader_election_quorum: bool,
    /// Always require a majority in the candidate's own region.
    pub include_candidate_region: bool,
    /// How long to wait for the pessimistic quorum before consulting vote
    /// histories.
    pub pessimistic_quorum_wait: Duration,
}

impl Default for FlexiblePolicies {
    fn default() -> Self {
        Self {
            crowdsource_last_known_leader: true,
            strict_leader_election_quorum: false,
            include_candidate_region: true,
            pessimistic_quorum_wait: timeouts::PESSIMISTIC_QUORUM_WAIT,
        }
    }
}

/// `(satisfied, satisfaction_possible)` for some quorum condition.
type QuorumState = (bool, bool);

enum NextLeaders {
    Detected {
        regions: BTreeSet<String>,
        next_term: u64,
    },
    AllIntermediateTermsScanned {
        regions: BTreeSet<String>,
    },
    WaitingForMoreVotes,
    Error,
}

/// Region-aware vote counting for flexible quorums. The decision runs
/// against the active commit rule: static rules use the complement of each
/// data predicate, the dynamic rule reasons about the last known leader's
/// region, falling back to reconstructing leadership history from the
/// voters' persisted vote records.
pub struct FlexibleVoteCounter {
    candidate_uuid: Uuid,
    election_term: u64,
    last_known_leader: Option<LastKnownLeader>,
    commit_rule: CommitRule,
    policies: FlexiblePolicies,
    created_at: Instant,
    voter_distribution: BTreeMap<String, usize>,
    uuid_to_region: HashMap<Uuid, String>,
    num_voters: usize,
    votes: HashMap<Uuid, VoteInfo>,
    yes_count: BTreeMap<String, usize>,
    no_count: BTreeMap<String, usize>,
    last_pruned: HashMap<Uuid, u64>,
    candidate_removed: bool,
}

impl FlexibleVoteCounter {
    pub fn new(
        candidate_uuid: Uuid,
        election_term: u64,
        last_known_leader: Option<LastKnownLeader>,
        config: &RaftConfig,
        adjust_voter_distribution: bool,
        policies: FlexiblePolicies,
        created_at: Instant,
    ) -> Self {
        // The declared distribution can lag membership changes; unless an
        // unsafe change forces the declared counts, raise each region to
        // its live voter count.
        let voter_distribution = if adjust_voter_distribution {
            config.adjusted_voter_distribution()
        } else {
            config.effective_voter_distribution()
        };
        let uuid_to_region: HashMap<Uuid, String> = config
            .voters()
            .filter_map(|peer| {
                peer.region
                    .as_ref()
                    .map(|region| (peer.uuid, region.clone()))
            })
            .collect();
        let mut yes_count = BTreeMap::new();
        let mut no_count = BTreeMap::new();
        for (region, count) in &voter_distribution {
            if adjust_voter_distribution && *count == 0 {
                continue;
            }
            yes_count.insert(region.clone(), 0);
            no_count.insert(region.clone(), 0);
        }
        let num_voters = uuid_to_region.len();
        assert!(num_voters > 0, "flexible counter needs at least one voter");
        Self {
            candidate_uuid,
            election_term,
            last_known_leader,
            commit_rule: config.commit_rule.clone(),
            policies,
            created_at,
            voter_distribution,
            uuid_to_region,
            num_voters,
            votes: HashMap::new(),
            yes_count,
            no_count,
            last_pruned: HashMap::new(),
            candidate_removed: false,
        }
    }

    fn region_of(&self, uuid: &Uuid) -> Option<&str> {
        self.uuid_to_region.get(uuid).map(String::as_str)
    }

    /// Regional vote math for one region. An empty or unknown region can
    /// never be satisfied.
    fn majority_in_region(&self, region: &str) -> QuorumState {
        let Some(&total) = self.voter_distribution.get(region) else {
            return (false, false);
        };
        if total == 0 {
            return (false, false);
        }
        let yes = self.yes_count.get(region).copied().unwrap_or(0);
        let no = self.no_count.get(region).copied().unwrap_or(0);
        let needed = majority_size(total);
        let satisfied = yes >= needed;
        let possible = satisfied || no + needed <= total;
        (satisfied, possible)
    }

    fn majority_in_all_regions<'a>(
        &self,
        regions: impl IntoIterator<Item = &'a str>,
    ) -> QuorumState {
        let mut satisfied = true;
        let mut possible = true;
        for region in regions {
            let state = self.majority_in_region(region);
            satisfied = satisfied && state.0;
            possible = possible && state.1;
        }
        (satisfied, possible)
    }

    /// Majorities in every region of the voter distribution. The most
    /// comprehensive quorum; sufficient regardless of leadership history.
    fn pessimistic_quorum(&self) -> QuorumState {
        self.majority_in_all_regions(self.voter_distribution.keys().map(String::as_str))
    }

    fn majority_in_majority_of_regions(&self) -> QuorumState {
        let num_regions = self.voter_distribution.len();
        let needed = majority_size(num_regions);
        let mut satisfied = 0;
        let mut possible = 0;
        for region in self.voter_distribution.keys() {
            let state = self.majority_in_region(region);
            if state.0 {
                satisfied += 1;
            }
            if state.1 {
                possible += 1;
            }
        }
        (satisfied >= needed, possible >= needed)
    }

    /// Static modes. A data quorum predicate requiring S of R regions is
    /// intersected by any election quorum holding majorities in
    /// `R + 1 - S` of those regions; every predicate must be intersected.
    fn static_quorum(&self, predicates: &[RulePredicate]) -> QuorumState {
        let mut satisfied = true;
        let mut possible = true;
        for predicate in predicates {
            let needed = predicate.regions.len() + 1 - predicate.regions_subset_size;
            let mut regions_satisfied = 0;
            let mut regions_impossible = 0;
            for region in &predicate.regions {
                let state = self.majority_in_region(region);
                if state.0 {
                    regions_satisfied += 1;
                }
                if !state.1 {
                    regions_impossible += 1;
                }
            }
            if regions_satisfied < needed {
                satisfied = false;
            }
            if predicate.regions.len() - regions_impossible < needed {
                possible = false;
            }
        }
        (satisfied, possible)
    }

    /// The last known leader after crowdsourcing voter reports.
    fn effective_last_known_leader(&self) -> Option<LastKnownLeader> {
        let mut best = self.last_known_leader;
        if self.policies.crowdsource_last_known_leader {
            for info in self.votes.values() {
                if let Some(reported) = info.last_known_leader {
                    // Term 0 reports carry no leader knowledge.
                    if reported.election_term == 0 {
                        continue;
                    }
                    if best
                        .map(|current| reported.election_term > current.election_term)
                        .unwrap_or(true)
                    {
                        best = Some(reported);
                    }
                }
            }
        }
        best
    }

    /// Combines the core region requirement with the configured policies.
    fn are_majorities_satisfied(
        &self,
        leader_regions: &BTreeSet<String>,
        candidate_region: &str,
    ) -> QuorumState {
        let mut result = self.majority_in_all_regions(leader_regions.iter().map(String::as_str));
        if self.policies.strict_leader_election_quorum {
            let strict = self.majority_in_majority_of_regions();
            result = (result.0 && strict.0, result.1 && strict.1);
        }
        if self.policies.include_candidate_region
            && !leader_regions.contains(candidate_region)
        {
            let candidate = self.majority_in_region(candidate_region);
            result = (result.0 && candidate.0, result.1 && candidate.1);
        }
        result
    }

    fn votes_remaining_in_region(&self, region: &str) -> usize {
        let total = self.voter_distribution.get(region).copied().unwrap_or(0);
        let yes = self.yes_count.get(region).copied().unwrap_or(0);
        let no = self.no_count.get(region).copied().unwrap_or(0);
        total.saturating_sub(yes + no)
    }

    /// Voters per region whose history no longer reaches back to `term`.
    fn regional_pruned_counts(&self, term: u64) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (uuid, pruned) in &self.last_pruned {
            if *pruned > term {
                if let Some(region) = self.region_of(uuid) {
                    *counts.entry(region.to_string()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn regional_unpruned_counts(&self, term: u64) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for (uuid, pruned) in &self.last_pruned {
            if *pruned <= term {
                if let Some(region) = self.region_of(uuid) {
                    *counts.entry(region.to_string()).or_insert(0) += 1;
                }
            }
        }
        counts
    }

    fn historical_majority_in_region(
        &self,
        region: &str,
        votes_received: usize,
        pruned_count: usize,
    ) -> QuorumState {
        let Some(&total) = self.voter_distribution.get(region) else {
            return (false, false);
        };
        let needed = majority_size(total);
        let remaining = self.votes_remaining_in_region(region);
        let satisfied = votes_received >= needed;
        let possible = votes_received + remaining + pruned_count >= needed;
        (satisfied, possible)
    }

    /// Whether the history walk has enough information: a majority of votes
    /// registered in every candidate leader region, with unpruned histories
    /// on a majority of each region's voters.
    fn enough_votes_with_sufficient_histories(
        &self,
        term: u64,
        leader_regions: &BTreeSet<String>,
    ) -> bool {
        for region in leader_regions {
            let total = self.voter_distribution.get(region).copied().unwrap_or(0);
            if self.votes_remaining_in_region(region) >= majority_size(total) {
                debug!(
                    "event=vote_history_waiting region={} reason=votes_outstanding",
                    region
                );
                return false;
            }
        }
        let unpruned = self.regional_unpruned_counts(term);
        for region in leader_regions {
            let total = self.voter_distribution.get(region).copied().unwrap_or(0);
            if unpruned.get(region).copied().unwrap_or(0) < majority_size(total) {
                debug!(
                    "event=vote_history_waiting region={} reason=history_pruned",
                    region
                );
                return false;
            }
        }
        true
    }

    /// Collates, for every voter in a potential leader region, its first
    /// vote after `term`: a map from `(candidate, term)` to the voters that
    /// cast it, grouped by region. Also returns the minimum such term.
    #[allow(clippy::type_complexity)]
    fn collate_votes_after(
        &self,
        term: u64,
        leader_regions: &BTreeSet<String>,
    ) -> (
        BTreeMap<(Uuid, u64), BTreeMap<String, BTreeSet<Uuid>>>,
        Option<u64>,
    ) {
        let mut collation: BTreeMap<(Uuid, u64), BTreeMap<String, BTreeSet<Uuid>>> =
            BTreeMap::new();
        let mut min_term = None;
        for (uuid, info) in &self.votes {
            let Some(region) = self.region_of(uuid) else {
                continue;
            };
            if !leader_regions.contains(region) {
                continue;
            }
            let Some(entry) = info
                .previous_vote_history
                .iter()
                .find(|vote| vote.election_term > term)
            else {
                continue;
            };
            min_term = Some(match min_term {
                Some(current) if current <= entry.election_term => current,
                _ => entry.election_term,
            });
            collation
                .entry((entry.candidate, entry.election_term))
                .or_default()
                .entry(region.to_string())
                .or_default()
                .insert(*uuid);
        }
        (collation, min_term)
    }

    /// Finds the set of regions from which a leader could have been elected
    /// in some term after `term`, walking the collated vote histories.
    fn potential_next_leaders(&self, term: u64, leader_regions: &BTreeSet<String>) -> NextLeaders {
        if !self.enough_votes_with_sufficient_histories(term, leader_regions) {
            return NextLeaders::WaitingForMoreVotes;
        }

        let (mut collation, mut min_term) = self.collate_votes_after(term, leader_regions);
        let mut next_leader_regions = leader_regions.clone();
        let mut iterations = 0;

        while let Some(current_term) = min_term {
            if collation.is_empty()
                || current_term >= self.election_term
                || iterations >= HISTORY_ITERATION_CAP
            {
                break;
            }
            iterations += 1;

            let pruned_counts = self.regional_pruned_counts(current_term);
            let mut potential_leader_uuids: BTreeSet<Uuid> = BTreeSet::new();

            for ((candidate, vote_term), region_to_voters) in &collation {
                if *vote_term != current_term {
                    continue;
                }
                for leader_region in leader_regions {
                    let votes_received = region_to_voters
                        .get(leader_region)
                        .map(BTreeSet::len)
                        .unwrap_or(0);
                    let pruned = pruned_counts.get(leader_region).copied().unwrap_or(0);
                    let state =
                        self.historical_majority_in_region(leader_region, votes_received, pruned);
                    if state.0 {
                        // This candidate demonstrably could have won here;
                        // the old region stops being a required successor.
                        next_leader_regions.remove(leader_region);
                        potential_leader_uuids.insert(*candidate);
                    } else if state.1 {
                        potential_leader_uuids.insert(*candidate);
                    }
                }
            }

            if !potential_leader_uuids.is_empty() {
                for uuid in &potential_leader_uuids {
                    match self.region_of(uuid) {
                        Some(region) => {
                            next_leader_regions.insert(region.to_string());
                        }
                        None => {
                            // Exploring a region outside the configuration
                            // means the analysis cannot conclude.
                            warn!(
                                "event=vote_history_unknown_leader candidate={}",
                                uuid
                            );
                            return NextLeaders::Error;
                        }
                    }
                }
                return NextLeaders::Detected {
                    regions: next_leader_regions,
                    next_term: current_term,
                };
            }

            let (next_collation, next_min) = self.collate_votes_after(current_term, leader_regions);
            collation = next_collation;
            min_term = next_min;
        }

        NextLeaders::AllIntermediateTermsScanned {
            regions: next_leader_regions,
        }
    }

    /// Walks leadership history from the last known leader's term upward,
    /// restricting the set of regions a later leader could have come from,
    /// until the current election term is reached or the analysis stalls.
    fn election_result_from_voting_history(
        &self,
        last_known_leader: LastKnownLeader,
        last_known_leader_region: &str,
        candidate_region: &str,
    ) -> QuorumState {
        let mut term = last_known_leader.election_term;
        let mut next_regions: BTreeSet<String> =
            BTreeSet::from([last_known_leader_region.to_string()]);
        let mut explored: BTreeSet<String> = next_regions.clone();
        let mut iterations = 0;

        while explored.len() < self.voter_distribution.len()
            && iterations < HISTORY_ITERATION_CAP
        {
            iterations += 1;
            match self.potential_next_leaders(term, &next_regions) {
                NextLeaders::Detected { regions, next_term } => {
                    debug_assert!(next_term > term);
                    term = next_term;
                    next_regions = regions;
                    explored.extend(next_regions.iter().cloned());
                }
                NextLeaders::AllIntermediateTermsScanned { regions } => {
                    info!(
                        "event=vote_history_scanned election_term={} regions={}",
                        self.election_term,
                        regions.len()
                    );
                    return self.are_majorities_satisfied(&regions, candidate_region);
                }
                NextLeaders::Error | NextLeaders::WaitingForMoreVotes => {
                    return (false, true);
                }
            }
        }

        // Converged to the most pessimistic quorum without a verdict.
        (false, true)
    }

    fn dynamic_quorum(&self, now: Instant) -> QuorumState {
        let last_known_leader = self.effective_last_known_leader();

        // A leader at or above our term means this election already lost.
        if let Some(leader) = last_known_leader {
            if self.election_term <= leader.election_term {
                info!(
                    "event=election_lost_via_crowdsourcing election_term={} leader_term={}",
                    self.election_term, leader.election_term
                );
                return (false, false);
            }
        }

        let leader_region = last_known_leader
            .as_ref()
            .and_then(|leader| self.region_of(&leader.uuid))
            .map(str::to_string);

        let pessimistic = self.pessimistic_quorum();
        let Some(leader_region) = leader_region else {
            // Without leader knowledge (bootstrap, or the leader has left
            // the ring) only the pessimistic quorum can decide.
            return pessimistic;
        };
        if pessimistic.0 {
            return pessimistic;
        }

        let candidate_region = self
            .region_of(&self.candidate_uuid)
            .map(str::to_string)
            .unwrap_or_default();
        let leader = last_known_leader.expect("leader region implies a leader");

        if self.election_term == leader.election_term + 1 {
            // Directly-following term: intersecting the last leader's
            // region guarantees the longest log.
            let regions = BTreeSet::from([leader_region]);
            return self.are_majorities_satisfied(&regions, &candidate_region);
        }

        // Discontinuous terms. Give the pessimistic quorum a grace window
        // before the history walk.
        if pessimistic.1
            && now.saturating_duration_since(self.created_at) < self.policies.pessimistic_quorum_wait
        {
            return pessimistic;
        }

        self.election_result_from_voting_history(leader, &leader_region, &candidate_region)
    }

    fn quorum_state(&self, now: Instant) -> QuorumState {
        match &self.commit_rule {
            CommitRule::StaticConjunction(predicates)
            | CommitRule::StaticDisjunction(predicates) => self.static_quorum(predicates),
            _ => self.dynamic_quorum(now),
        }
    }
}

impl VoteCounter for FlexibleVoteCounter {
    fn register_vote(&mut self, voter: Uuid, mut info: VoteInfo) -> Result<bool, VoteError> {
        if let Some(prior) = self.votes.get(&voter) {
            if prior.vote != info.vote {
                return Err(VoteError::ChangedVote { voter });
            }
            return Ok(true);
        }
        let Some(region) = self.uuid_to_region.get(&voter).cloned() else {
            return Err(VoteError::UnknownVoter { voter });
        };
        if self.votes.len() == self.num_voters {
            return Err(VoteError::TooManyVotes {
                voter,
                expected: self.num_voters,
            });
        }
        match info.vote {
            ElectionVote::Granted => {
                *self.yes_count.entry(region).or_insert(0) += 1;
            }
            ElectionVote::Denied => {
                *self.no_count.entry(region).or_insert(0) += 1;
                self.candidate_removed = self.candidate_removed || info.is_candidate_removed;
            }
        }
        info.previous_vote_history
            .sort_by_key(|vote| vote.election_term);
        self.last_pruned.insert(voter, info.last_pruned_term);
        self.votes.insert(voter, info);
        Ok(false)
    }

    fn is_decided(&self, now: Instant) -> bool {
        let state = self.quorum_state(now);
        state.0 || !state.1
    }

    fn decision(&self, now: Instant) -> Option<ElectionVote> {
        let state = self.quorum_state(now);
        if state.0 {
            Some(ElectionVote::Granted)
        } else if !state.1 {
            Some(ElectionVote::Denied)
        } else {
            None
        }
    }

    fn votes_counted(&self) -> usize {
        self.votes.len()
    }

    fn are_all_votes_in(&self) -> bool {
        self.votes.len() == self.num_voters
    }

    fn is_candidate_removed(&self) -> bool {
        self.candidate_removed
    }
}
