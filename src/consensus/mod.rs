//! The replica-side consensus state: operation identifiers, shared
//! messages, configurations, durable metadata, pending rounds and the
//! replica state machine itself.

pub mod config;
pub mod message;
pub mod metadata;
pub mod opid;
pub mod pending;
pub mod replica;
pub mod state;

pub use message::{OpType, ReplicateMsg};
pub use opid::OpId;
