//! The leader-side replication machinery: the log cache, the per-peer
//! progress queue with its watermark engine, the dispatch pipeline and the
//! routing interface.

pub mod cache;
pub mod pipeline;
pub mod queue;
pub mod quorum;
pub mod router;

pub use cache::{CacheCodec, LogCache, LogCacheConfig, LogReader};
pub use pipeline::LeaderPipeline;
pub use queue::{
    dispatch_notifications, HealthStatus, PeerRequest, QueueMode, QueueNotification,
    QueueObserver, QueueSnapshot, ReplicationQueue, TrackedPeer, TransferContext,
};
pub use quorum::{compute_majority_watermark, compute_region_durable_index, VoterProgress};
pub use router::{DirectRouter, Router, TableRouter};
