//! Core library entrypoint for the replicore consensus engine: a
//! Raft-family replication core with flexible, region-aware quorum rules.
//! A leader orders operations and streams them to followers; once an
//! operation is durable on a sufficient quorum it is committed and handed
//! to the consumer. Leadership rotates via (pre-)elections and graceful
//! transfers.
#![deny(unreachable_pub)]
#![deny(unused_must_use)]

pub mod consensus;
pub mod election;
pub mod error;
pub mod replication;
pub mod rpc;
pub mod timeouts;
pub mod wal;

pub use consensus::config::{
    majority_size, CommitRule, Membership, PeerSpec, RaftConfig, RulePredicate,
};
pub use consensus::metadata::{
    ConsensusMetadata, LastKnownLeader, MetadataError, MetadataStore, PersistentVars,
    PersistentVarsStore, PreviousVote, VOTE_HISTORY_LIMIT,
};
pub use consensus::pending::{PendingError, PendingRound, PendingRounds, RoundResult};
pub use consensus::replica::{
    ChangeConfigRequest, ConfigChangeOp, ConsensusStateSnapshot, Replica, ReplicaOptions,
};
pub use consensus::state::{
    FlushMode, RaftRole, ReplicaLifecycle, ReplicaState, StateError,
};
pub use consensus::{OpId, OpType, ReplicateMsg};
pub use election::{
    ElectionDriver, ElectionMode, ElectionOutcome, ElectionVote, FailureDetector,
    FlexiblePolicies, FlexibleVoteCounter, MajorityVoteCounter, VoteCounter, VoteError, VoteInfo,
};
pub use error::ConsensusError;
pub use replication::{
    dispatch_notifications, CacheCodec, DirectRouter, HealthStatus, LeaderPipeline, LogCache,
    LogCacheConfig, LogReader, PeerRequest, QueueMode, QueueNotification, QueueObserver,
    QueueSnapshot, ReplicationQueue, Router, TableRouter, TrackedPeer, TransferContext,
};
pub use rpc::{
    PeerClient, PeerClientFactory, PeerStatus, RpcError, UpdateError, UpdateRequest,
    UpdateResponse, VoteDenialReason, VoteRequest, VoteResponse,
};
pub use wal::{InMemoryLog, LogError, OperationLog};
