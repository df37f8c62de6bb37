//! Clustor - replica state coordination for Raft-based tablet replication.
//!
//! Clustor is the per-replica consensus core of a distributed tablet store.
//! Each tablet is one Raft group; this crate owns a replica's view of that
//! group: it sequences operations into the log, tracks commit progress,
//! enforces role and configuration transitions, and implements the dual
//! leader-lease mechanism (a coarse monotonic-time lease and a hybrid-time
//! lease) that keeps up-to-date reads and writes safe across leadership
//! changes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                   Consensus module (RPC layer)                  │
//! │        appends │ vote requests │ majority acknowledgements      │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Replica State Coordinator                    │
//! │   term/vote │ pending queue │ commit tracking │ leader leases   │
//! └─────────────────────────────────────────────────────────────────┘
//!                    │                          │
//! ┌──────────────────────────────┐ ┌──────────────────────────────┐
//! │     Consensus Metadata       │ │        Apply Pipeline        │
//! │   (term, vote, config) disk  │ │  committed ops, in order     │
//! └──────────────────────────────┘ └──────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - configuration parsing and validation
//! - [`core::error`] - error taxonomy
//! - [`core::time`] - monotonic and physical time primitives
//!
//! ## Consensus
//! - [`consensus::replica_state`] - the locked state coordinator
//! - [`consensus::meta`] - durable consensus metadata
//! - [`consensus::queue`] - pending operations queue
//! - [`consensus::retryable`] - retryable-request deduplication
//! - [`consensus::lease`] - leader leases and status evaluation
//! - [`consensus::leader_cache`] - lock-free leadership snapshot
//!
//! ## Operations
//! - [`ops::status`] - operator status dump
//!
//! # Key Invariants
//!
//! - **Index contiguity**: the pending queue is ascending and contiguous,
//!   one index past the commit watermark.
//! - **Commit monotonicity**: the committed op id never moves backwards.
//! - **Own-term commit rule**: a leader only advances the commit index
//!   through entries of its own term.
//! - **Vote durability**: a vote persists before it leaves the process, at
//!   most one per term.
//! - **Lease monotonicity**: predecessor lease records only advance, up to
//!   the one-way reset once expiry is observed.

// Core infrastructure
pub mod core;

// Consensus coordination
pub mod consensus;

// Operations and diagnostics
pub mod ops;

// Re-exports for convenience
pub use self::core::{config, error, time};
pub use consensus::{
    leader_cache, lease, membership, meta, operation, opid, queue, replica_state, retryable,
};
pub use ops::status;
