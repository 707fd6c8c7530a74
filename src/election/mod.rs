//! Elections: vote counting (classic and flexible), the single-election
//! driver, and the leader-failure detector.

pub mod counter;
pub mod detector;
pub mod driver;
pub mod flexible;

pub use counter::{ElectionVote, MajorityVoteCounter, VoteCounter, VoteError, VoteInfo};
pub use detector::FailureDetector;
pub use driver::{ElectionDriver, ElectionMode, ElectionOutcome};
pub use flexible::{FlexiblePolicies, FlexibleVoteCounter};
