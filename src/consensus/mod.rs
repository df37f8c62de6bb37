//! Replica-level consensus coordination.
//!
//! This module contains:
//! - [`opid`] - operation identifiers
//! - [`operation`] - replicated operations and their lifecycle
//! - [`membership`] - peers, member kinds, and configurations
//! - [`meta`] - durable consensus metadata
//! - [`queue`] - the pending operations queue
//! - [`retryable`] - retryable-request deduplication
//! - [`lease`] - leader lease records and status evaluation
//! - [`leader_cache`] - lock-free leadership snapshot
//! - [`replica_state`] - the locked state coordinator

pub mod leader_cache;
pub mod lease;
pub mod membership;
pub mod meta;
pub mod operation;
pub mod opid;
pub mod queue;
pub mod replica_state;
pub mod retryable;
