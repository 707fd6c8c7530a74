//! Watermark computation under the configured commit rule. Given one log
//! index per tracked voter, these routines find the highest index that the
//! rule considers replicated to a sufficient quorum. Watermarks only ever
//! advance; callers pass the current value and get back `max(current, new)`.

use log::debug;
use std::collections::BTreeMap;

use crate::consensus::config::{majority_size, CommitRule, RulePredicate};

/// Replication progress of one voter, as fed to the commit-rule engine.
#[derive(Debug, Clone)]
pub struct VoterProgress {
    pub region: Option<String>,
    pub index: u64,
}

impl VoterProgress {
    pub fn new(region: Option<&str>, index: u64) -> Self {
        Self {
            region: region.map(str::to_string),
            index,
        }
    }
}

/// Computes the majority-replicated watermark under `rule`.
///
/// `voter_distribution` is the expected voter count per region (already
/// adjusted for membership drift by the caller). A flexible rule with no
/// distribution degrades to classic majority. A voter without a region
/// contributes to no regional count; a region listed by a predicate but
/// absent from the distribution is unsatisfiable.
pub fn compute_majority_watermark(
    rule: &CommitRule,
    voter_distribution: &BTreeMap<String, usize>,
    leader_region: Option<&str>,
    voters: &[VoterProgress],
    current: u64,
) -> u64 {
    let computed = match rule {
        CommitRule::ClassicMajority => classic_watermark(voters),
        _ if voter_distribution.is_empty() => classic_watermark(voters),
        CommitRule::StaticConjunction(predicates) => {
            static_watermark(predicates, voter_distribution, voters, true)
        }
        CommitRule::StaticDisjunction(predicates) => {
            static_watermark(predicates, voter_distribution, voters, false)
        }
        CommitRule::SingleRegionDynamic => match leader_region {
            Some(region) => regional_watermark(region, voter_distribution, voters),
            None => 0,
        },
    };
    if computed > current {
        debug!(
            "event=majority_watermark_advance from={} to={}",
            current, computed
        );
    }
    computed.max(current)
}

/// The highest index durably present in at least one region other than the
/// leader's. Peers without a region never contribute.
pub fn compute_region_durable_index(
    leader_region: Option<&str>,
    peers: &[VoterProgress],
    current: u64,
) -> u64 {
    peers
        .iter()
        .filter(|peer| {
            peer.region
                .as_deref()
                .map(|region| Some(region) != leader_region)
                .unwrap_or(false)
        })
        .map(|peer| peer.index)
        .max()
        .unwrap_or(0)
        .max(current)
}

fn classic_watermark(voters: &[VoterProgress]) -> u64 {
    let needed = majority_size(voters.len());
    kth_largest(voters.iter().map(|voter| voter.index), needed)
}

/// The highest index at which `region` holds a regional majority. The
/// expected voter count comes from the distribution; voters the region has
/// not reported (or has lost) count as stuck at index 0.
fn regional_watermark(
    region: &str,
    voter_distribution: &BTreeMap<String, usize>,
    voters: &[VoterProgress],
) -> u64 {
    let Some(&expected) = voter_distribution.get(region) else {
        return 0;
    };
    if expected == 0 {
        return 0;
    }
    let needed = majority_size(expected);
    kth_largest(
        voters
            .iter()
            .filter(|voter| voter.region.as_deref() == Some(region))
            .map(|voter| voter.index),
        needed,
    )
}

/// A predicate's watermark is the highest index at which at least
/// `regions_subset_size` of its regions hold regional majorities; a
/// conjunction takes the minimum across predicates, a disjunction the
/// maximum.
fn static_watermark(
    predicates: &[RulePredicate],
    voter_distribution: &BTreeMap<String, usize>,
    voters: &[VoterProgress],
    conjunction: bool,
) -> u64 {
    let per_predicate = predicates.iter().map(|predicate| {
        kth_largest(
            predicate
                .regions
                .iter()
                .map(|region| regional_watermark(region, voter_distribution, voters)),
            predicate.regions_subset_size,
        )
    });
    if conjunction {
        per_predicate.min().unwrap_or(0)
    } else {
        per_predicate.max().unwrap_or(0)
    }
}

/// The k-th largest of `values`, or 0 when fewer than `k` exist. This is
/// the highest threshold that at least `k` of the values reach.
fn kth_largest(values: impl Iterator<Item = u64>, k: usize) -> u64 {
    debug_assert!(k > 0);
    let mut sorted: Vec<u64> = values.collect();
    if sorted.len() < k {
        return 0;
    }
    sorted.sort_unstable_by(|a, b| b.cmp(a));
    sorted[k - 1]
}
