use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

use crate::consensus::config::RaftConfig;

/// Upper bound on the persisted vote history. Older entries are pruned and
/// `last_pruned_term` advances past them.
pub const VOTE_HISTORY_LIMIT: usize = 128;

/// A vote cast in a past term, kept so the flexible vote counter can
/// reconstruct which regions could have elected a leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviousVote {
    pub election_term: u64,
    pub candidate: Uuid,
}

/// The most recent leader this replica acknowledged, by election term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastKnownLeader {
    pub election_term: u64,
    pub uuid: Uuid,
}

/// Consensus metadata persisted before any of it becomes observable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusMetadata {
    pub current_term: u64,
    pub voted_for: Option<Uuid>,
    pub committed_config: RaftConfig,
    #[serde(default)]
    pub pending_config: Option<RaftConfig>,
    #[serde(default)]
    pub last_known_leader: Option<LastKnownLeader>,
    #[serde(default)]
    pub previous_vote_history: Vec<PreviousVote>,
    #[serde(default)]
    pub last_pruned_term: u64,
    #[serde(default)]
    pub removed_peers: Vec<Uuid>,
}

impl ConsensusMetadata {
    pub fn new(committed_config: RaftConfig) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            committed_config,
            pending_config: None,
            last_known_leader: None,
            previous_vote_history: Vec::new(),
            last_pruned_term: 0,
            removed_peers: Vec::new(),
        }
    }

    /// Appends a vote to the bounded history, pruning the oldest entries
    /// when the limit is exceeded.
    pub fn record_vote_history(&mut self, election_term: u64, candidate: Uuid) {
        self.previous_vote_history.push(PreviousVote {
            election_term,
            candidate,
        });
        while self.previous_vote_history.len() > VOTE_HISTORY_LIMIT {
            let pruned = self.previous_vote_history.remove(0);
            self.last_pruned_term = self.last_pruned_term.max(pruned.election_term);
        }
    }

    /// Merges a newer last-known-leader observation; older terms are ignored.
    pub fn observe_leader(&mut self, election_term: u64, uuid: Uuid) -> bool {
        match self.last_known_leader {
            Some(existing) if existing.election_term >= election_term => false,
            _ => {
                self.last_known_leader = Some(LastKnownLeader {
                    election_term,
                    uuid,
                });
                true
            }
        }
    }
}

/// Flags persisted independently of the consensus metadata record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistentVars {
    pub allow_start_election: bool,
    #[serde(default)]
    pub rpc_token: Option<String>,
}

impl Default for PersistentVars {
    fn default() -> Self {
        Self {
            allow_start_election: true,
            rpc_token: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("no consensus metadata at {0}")]
    NotFound(PathBuf),
}

/// JSON-backed store for the consensus metadata record. Writes go to a
/// `.tmp` sibling, are fsynced, then renamed over the live file so a crash
/// never leaves a torn record.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    path: PathBuf,
}

impl MetadataStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<ConsensusMetadata, MetadataError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Err(MetadataError::NotFound(self.path.clone()))
            }
            Err(err) => Err(MetadataError::Io(err)),
        }
    }

    pub fn persist(&self, metadata: &ConsensusMetadata) -> Result<(), MetadataError> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(metadata)?)
    }
}

/// Store for the independent persistent-vars record, with the same
/// durability guarantee as the metadata store.
#[derive(Debug, Clone)]
pub struct PersistentVarsStore {
    path: PathBuf,
}

impl PersistentVarsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn load_or_default(&self) -> Result<PersistentVars, MetadataError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(PersistentVars::default()),
            Err(err) => Err(MetadataError::Io(err)),
        }
    }

    pub fn persist(&self, vars: &PersistentVars) -> Result<(), MetadataError> {
        write_atomic(&self.path, &serde_json::to_vec_pretty(vars)?)
    }
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), MetadataError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(payload)?;
    file.sync_all()?;
    fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::config::{CommitRule, PeerSpec};
    use tempfile::TempDir;

    fn config() -> RaftConfig {
        RaftConfig::new(
            vec![PeerSpec::voter(Uuid::new_v4(), "a:1", Some("r1"))],
            CommitRule::ClassicMajority,
        )
    }

    #[test]
    fn metadata_round_trips_through_disk() {
        let tmp = TempDir::new().unwrap();
        let store = MetadataStore::new(tmp.path().join("consensus-meta.json"));
        assert!(matches!(store.load(), Err(MetadataError::NotFound(_))));

        let mut meta = ConsensusMetadata::new(config());
        meta.current_term = 7;
        meta.voted_for = Some(Uuid::new_v4());
        store.persist(&meta).unwrap();
        assert_eq!(store.load().unwrap(), meta);
    }

    #[test]
    fn vote_history_is_bounded() {
        let mut meta = ConsensusMetadata::new(config());
        let candidate = Uuid::new_v4();
        for term in 1..=(VOTE_HISTORY_LIMIT as u64 + 10) {
            meta.record_vote_history(term, candidate);
        }
        assert_eq!(meta.previous_vote_history.len(), VOTE_HISTORY_LIMIT);
        assert_eq!(meta.last_pruned_term, 10);
        assert_eq!(meta.previous_vote_history[0].election_term, 11);
    }

    #[test]
    fn observe_leader_is_monotone_in_term() {
        let mut meta = ConsensusMetadata::new(config());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        assert!(meta.observe_leader(3, first));
        assert!(!meta.observe_leader(2, second));
        assert!(!meta.observe_leader(3, second));
        assert!(meta.observe_leader(4, second));
        assert_eq!(meta.last_known_leader.unwrap().uuid, second);
    }

    #[test]
    fn persistent_vars_default_and_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = PersistentVarsStore::new(tmp.path().join("persistent-vars.json"));
        let vars = store.load_or_default().unwrap();
        assert!(vars.allow_start_election);

        let updated = PersistentVars {
            allow_start_election: false,
            rpc_token: Some("token".into()),
        };
        store.persist(&updated).unwrap();
        assert_eq!(store.load_or_default().unwrap(), updated);
    }
}
