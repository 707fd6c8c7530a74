use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::ConsensusError;

/// Whether a peer participates in elections and commit quorums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    Voter,
    NonVoter,
}

/// A single peer in a replication group configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSpec {
    /// Permanent identity; survives address changes.
    pub uuid: Uuid,
    pub address: String,
    /// Region (or abstract quorum id) used by flexible quorum rules.
    #[serde(default)]
    pub region: Option<String>,
    pub membership: Membership,
    /// Hint that this non-voter should be promoted once caught up.
    #[serde(default)]
    pub promote_when_caught_up: bool,
    /// Hint that this peer is slated for replacement.
    #[serde(default)]
    pub replace: bool,
}

impl PeerSpec {
    pub fn voter(uuid: Uuid, address: impl Into<String>, region: Option<&str>) -> Self {
        Self {
            uuid,
            address: address.into(),
            region: region.map(str::to_string),
            membership: Membership::Voter,
            promote_when_caught_up: false,
            replace: false,
        }
    }

    pub fn non_voter(uuid: Uuid, address: impl Into<String>, region: Option<&str>) -> Self {
        Self {
            uuid,
            address: address.into(),
            region: region.map(str::to_string),
            membership: Membership::NonVoter,
            promote_when_caught_up: false,
            replace: false,
        }
    }

    pub fn is_voter(&self) -> bool {
        self.membership == Membership::Voter
    }
}

/// One predicate of a static commit rule: at least `regions_subset_size` of
/// `regions` must each hold a regional majority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RulePredicate {
    pub regions: Vec<String>,
    pub regions_subset_size: usize,
}

/// How the leader decides an index is committed. Variants carry their own
/// data; watermark computation dispatches on the tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommitRule {
    /// Strict majority of all voters.
    ClassicMajority,
    /// Every predicate must be satisfied.
    StaticConjunction(Vec<RulePredicate>),
    /// At least one predicate must be satisfied.
    StaticDisjunction(Vec<RulePredicate>),
    /// A regional majority within the leader's own region suffices.
    SingleRegionDynamic,
}

impl CommitRule {
    pub fn is_static(&self) -> bool {
        matches!(
            self,
            CommitRule::StaticConjunction(_) | CommitRule::StaticDisjunction(_)
        )
    }

    pub fn is_flexible(&self) -> bool {
        !matches!(self, CommitRule::ClassicMajority)
    }
}

/// Size of a strict majority among `num_voters` voters.
pub fn majority_size(num_voters: usize) -> usize {
    num_voters / 2 + 1
}

/// A replication group configuration: an ordered set of peers, the commit
/// rule, and the expected voter count per region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftConfig {
    pub peers: Vec<PeerSpec>,
    pub commit_rule: CommitRule,
    /// Region to expected voter count. May lag the actual membership across
    /// configuration changes.
    #[serde(default)]
    pub voter_distribution: BTreeMap<String, usize>,
    /// Log index at which this configuration was committed, if known.
    #[serde(default)]
    pub opid_index: Option<u64>,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            commit_rule: CommitRule::ClassicMajority,
            voter_distribution: BTreeMap::new(),
            opid_index: None,
        }
    }
}

impl RaftConfig {
    pub fn new(peers: Vec<PeerSpec>, commit_rule: CommitRule) -> Self {
        Self {
            peers,
            commit_rule,
            voter_distribution: BTreeMap::new(),
            opid_index: None,
        }
    }

    pub fn peer(&self, uuid: &Uuid) -> Option<&PeerSpec> {
        self.peers.iter().find(|peer| peer.uuid == *uuid)
    }

    pub fn peer_mut(&mut self, uuid: &Uuid) -> Option<&mut PeerSpec> {
        self.peers.iter_mut().find(|peer| peer.uuid == *uuid)
    }

    pub fn is_member(&self, uuid: &Uuid) -> bool {
        self.peer(uuid).is_some()
    }

    pub fn is_voter(&self, uuid: &Uuid) -> bool {
        self.peer(uuid).map(PeerSpec::is_voter).unwrap_or(false)
    }

    pub fn voters(&self) -> impl Iterator<Item = &PeerSpec> {
        self.peers.iter().filter(|peer| peer.is_voter())
    }

    pub fn voter_count(&self) -> usize {
        self.voters().count()
    }

    pub fn majority_size(&self) -> usize {
        majority_size(self.voter_count())
    }

    pub fn region_of(&self, uuid: &Uuid) -> Option<&str> {
        self.peer(uuid).and_then(|peer| peer.region.as_deref())
    }

    pub fn remove_peer(&mut self, uuid: &Uuid) -> bool {
        let before = self.peers.len();
        self.peers.retain(|peer| peer.uuid != *uuid);
        self.peers.len() != before
    }

    /// Counts voters per region in the current membership.
    pub fn actual_voter_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for peer in self.voters() {
            if let Some(region) = &peer.region {
                *counts.entry(region.clone()).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Returns the voter distribution raised to at least the actual voter
    /// count per region. The declared distribution can lag membership
    /// changes, so regions with more live voters than declared are adjusted
    /// upward; regions declared but emptied keep their declared count only
    /// if still present in membership.
    pub fn adjusted_voter_distribution(&self) -> BTreeMap<String, usize> {
        let actual = self.actual_voter_counts();
        let mut adjusted = self.voter_distribution.clone();
        adjusted.retain(|_, expected| *expected > 0);
        for (region, count) in actual {
            let entry = adjusted.entry(region).or_insert(0);
            if count > *entry {
                *entry = count;
            }
        }
        adjusted
    }

    /// The distribution used by flexible quorum math: the declared one when
    /// present, otherwise the actual membership counts.
    pub fn effective_voter_distribution(&self) -> BTreeMap<String, usize> {
        if self.voter_distribution.is_empty() {
            self.actual_voter_counts()
        } else {
            self.voter_distribution.clone()
        }
    }

    /// Structural validation: unique ids, non-empty addresses, at least one
    /// voter, flexible rules require regions on every voter, static rules
    /// require well-formed predicates.
    pub fn validate(&self) -> Result<(), ConsensusError> {
        if self.peers.is_empty() {
            return Err(ConsensusError::InvalidConfig(
                "configuration has no peers".into(),
            ));
        }
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.address.is_empty() {
                return Err(ConsensusError::InvalidConfig(format!(
                    "peer {} has an empty address",
                    peer.uuid
                )));
            }
            if self.peers[..i].iter().any(|other| other.uuid == peer.uuid) {
                return Err(ConsensusError::InvalidConfig(format!(
                    "duplicate peer {}",
                    peer.uuid
                )));
            }
        }
        if self.voter_count() == 0 {
            return Err(ConsensusError::InvalidConfig(
                "configuration has no voters".into(),
            ));
        }
        if self.commit_rule.is_flexible() {
            for peer in self.voters() {
                if peer.region.as_deref().unwrap_or("").is_empty() {
                    return Err(ConsensusError::InvalidConfig(format!(
                        "voter {} has no region but the commit rule is region-based",
                        peer.uuid
                    )));
                }
            }
        }
        match &self.commit_rule {
            CommitRule::StaticConjunction(predicates)
            | CommitRule::StaticDisjunction(predicates) => {
                if predicates.is_empty() {
                    return Err(ConsensusError::InvalidConfig(
                        "static commit rule has no predicates".into(),
                    ));
                }
                for predicate in predicates {
                    if predicate.regions.is_empty()
                        || predicate.regions_subset_size == 0
                        || predicate.regions_subset_size > predicate.regions.len()
                    {
                        return Err(ConsensusError::InvalidConfig(format!(
                            "predicate requires {} of {} regions",
                            predicate.regions_subset_size,
                            predicate.regions.len()
                        )));
                    }
                }
            }
            CommitRule::ClassicMajority | CommitRule::SingleRegionDynamic => {}
        }
        Ok(())
    }

    /// Counts how many peers changed voter status between two configs.
    /// Additions, removals, promotions and demotions of voters count;
    /// non-voter churn does not.
    pub fn voter_status_changes(&self, other: &RaftConfig) -> usize {
        let mut changes = 0;
        for peer in &self.peers {
            if peer.is_voter() != other.is_voter(&peer.uuid) {
                changes += 1;
            }
        }
        for peer in &other.peers {
            if peer.is_voter() && self.peer(&peer.uuid).is_none() {
                changes += 1;
            }
        }
        changes
    }
}

impl fmt::Display for RaftConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "config(voters={}, peers={}, rule={:?}, opid_index={:?})",
            self.voter_count(),
            self.peers.len(),
            self.commit_rule,
            self.opid_index
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voter(region: &str) -> PeerSpec {
        PeerSpec::voter(Uuid::new_v4(), "host:7000", Some(region))
    }

    #[test]
    fn majority_sizes() {
        assert_eq!(majority_size(1), 1);
        assert_eq!(majority_size(2), 2);
        assert_eq!(majority_size(3), 2);
        assert_eq!(majority_size(5), 3);
    }

    #[test]
    fn validation_rejects_duplicates_and_empty_configs() {
        let config = RaftConfig::new(Vec::new(), CommitRule::ClassicMajority);
        assert!(config.validate().is_err());

        let peer = voter("r1");
        let config = RaftConfig::new(vec![peer.clone(), peer], CommitRule::ClassicMajority);
        assert!(matches!(
            config.validate(),
            Err(ConsensusError::InvalidConfig(_))
        ));
    }

    #[test]
    fn flexible_rule_requires_regions() {
        let mut peer = voter("r1");
        peer.region = None;
        let config = RaftConfig::new(vec![peer], CommitRule::SingleRegionDynamic);
        assert!(config.validate().is_err());
    }

    #[test]
    fn adjusted_distribution_takes_max_of_declared_and_actual() {
        let mut config = RaftConfig::new(
            vec![voter("r1"), voter("r1"), voter("r2")],
            CommitRule::SingleRegionDynamic,
        );
        config.voter_distribution.insert("r1".into(), 1);
        config.voter_distribution.insert("r2".into(), 3);
        let adjusted = config.adjusted_voter_distribution();
        assert_eq!(adjusted.get("r1"), Some(&2));
        assert_eq!(adjusted.get("r2"), Some(&3));
    }

    #[test]
    fn voter_status_change_counting() {
        let a = voter("r1");
        let b = voter("r1");
        let c = voter("r2");
        let old = RaftConfig::new(vec![a.clone(), b.clone()], CommitRule::ClassicMajority);
        let mut new = RaftConfig::new(
            vec![a.clone(), b.clone(), c.clone()],
            CommitRule::ClassicMajority,
        );
        assert_eq!(old.voter_status_changes(&new), 1);
        new.remove_peer(&b.uuid);
        assert_eq!(old.voter_status_changes(&new), 2);
    }

    #[test]
    fn predicate_validation() {
        let config = RaftConfig::new(
            vec![voter("r1")],
            CommitRule::StaticDisjunction(vec![RulePredicate {
                regions: vec!["r1".into()],
                regions_subset_size: 2,
            }]),
        );
        assert!(config.validate().is_err());
    }
}
