//! Centralized timing policies for the replication core.
//!
//! Keeping these values in one place makes it clear which parts of the
//! system share behaviour (heartbeat cadence, election windows, proxy
//! health thresholds) and gives us a single knob to turn.

use std::time::Duration;

/// Interval at which the leader sends empty updates to idle followers.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(500);

/// Bounds of the randomized failure-detector window. A follower that hears
/// nothing from a leader for a duration drawn from this window starts an
/// election.
pub const ELECTION_TIMEOUT_MIN: Duration = Duration::from_millis(1_500);
pub const ELECTION_TIMEOUT_MAX: Duration = Duration::from_millis(3_000);

/// Deadline applied to a single replication or vote RPC.
pub const RPC_DEADLINE: Duration = Duration::from_secs(1);

/// How long the flexible vote counter waits for the pessimistic quorum to
/// fill in before falling back to voting-history reconstruction.
pub const PESSIMISTIC_QUORUM_WAIT: Duration = Duration::from_secs(10);

/// A proxy peer that has not been heard from for this long is unhealthy.
pub const PROXY_FAILURE_THRESHOLD: Duration = Duration::from_secs(30);

/// A proxy peer lagging its destination by more than this many operations
/// is unhealthy.
pub const PROXY_FAILURE_THRESHOLD_LAG: u64 = 1_000;

/// Upper bound on a blocking log-cache read while assembling a request.
pub const CACHE_BLOCKING_READ_TIMEOUT: Duration = Duration::from_millis(250);
