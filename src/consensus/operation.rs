//! Replicated operations and their lifecycle.
//!
//! An operation is an application payload bound to an op id once it enters
//! the log, with a replication status and a completion callback that fires
//! exactly once, on commit or on abort, never both.

use crate::consensus::membership::RaftConfig;
use crate::consensus::opid::OpId;
use crate::core::error::ConsensusResult;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identity a client attaches to a write so retries can be deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryableRequestId {
    /// Stable id of the issuing client.
    pub client_id: String,
    /// Client-assigned sequence number of this request.
    pub request_id: i64,
    /// Lowest request id the client still has in flight. Everything below
    /// it can be garbage collected from the dedup window.
    pub min_running_request_id: i64,
}

/// Payload kinds the coordinator replicates.
///
/// The coordinator treats kinds uniformly except where noted: configuration
/// changes interact with the pending configuration, split requests record
/// the split op id, and writes may carry a retryable-request id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OperationPayload {
    /// A regular client write.
    Write {
        body: Bytes,
        #[serde(default)]
        request_id: Option<RetryableRequestId>,
    },
    /// The no-op a new leader replicates to commit its term.
    NoOp,
    /// A membership change to the given configuration.
    ConfigChange { new_config: RaftConfig },
    /// A request to split this Raft group.
    SplitRequest { child_group_ids: Vec<String> },
    /// A cooperative leadership transfer.
    LeaderChange { new_leader_uuid: String },
    /// Catalog mutation scoped to a namespace.
    Namespace { body: Bytes },
    /// Catalog mutation scoped to a table.
    Table { body: Bytes },
    /// Catalog mutation scoped to a tablet.
    Tablet { body: Bytes },
}

impl OperationPayload {
    /// Short name of the payload kind, for logs and status dumps.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::NoOp => "no_op",
            Self::ConfigChange { .. } => "config_change",
            Self::SplitRequest { .. } => "split_request",
            Self::LeaderChange { .. } => "leader_change",
            Self::Namespace { .. } => "namespace",
            Self::Table { .. } => "table",
            Self::Tablet { .. } => "tablet",
        }
    }

    /// Whether this is a configuration change.
    pub fn is_config_change(&self) -> bool {
        matches!(self, Self::ConfigChange { .. })
    }

    /// Whether this is a split request.
    pub fn is_split_request(&self) -> bool {
        matches!(self, Self::SplitRequest { .. })
    }

    /// The retryable-request id carried by a write, if any.
    pub fn retryable_request_id(&self) -> Option<&RetryableRequestId> {
        match self {
            Self::Write { request_id, .. } => request_id.as_ref(),
            _ => None,
        }
    }

    /// The write body, if this is a write.
    pub fn write_body(&self) -> Option<&Bytes> {
        match self {
            Self::Write { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// Where an operation stands in its replication lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationStatus {
    /// Created, not yet sequenced into the log.
    Prepared,
    /// Appended to the local log with an op id assigned.
    Appended,
    /// Acknowledged by a voter majority.
    ReplicatedToMajority,
    /// Committed; surfaced to the apply pipeline.
    Committed,
    /// Aborted before commit.
    Aborted,
}

/// Callback fired exactly once when an operation commits or aborts.
pub type CompletionCallback = Box<dyn FnOnce(ConsensusResult<OpId>) + Send>;

/// One in-flight operation, shared between the coordinator and its callers.
///
/// Rounds are held behind [`Arc`] so the completion callback fires exactly
/// once regardless of which holder outlives the operation.
pub struct ConsensusRound {
    payload: OperationPayload,
    bound_id: Mutex<Option<OpId>>,
    status: Mutex<ReplicationStatus>,
    callback: Mutex<Option<CompletionCallback>>,
}

/// Shared handle to a round.
pub type ConsensusRoundRef = Arc<ConsensusRound>;

impl ConsensusRound {
    /// A round with no completion callback.
    pub fn new(payload: OperationPayload) -> ConsensusRoundRef {
        Arc::new(Self {
            payload,
            bound_id: Mutex::new(None),
            status: Mutex::new(ReplicationStatus::Prepared),
            callback: Mutex::new(None),
        })
    }

    /// A round that fires `callback` on commit or abort.
    pub fn with_callback(payload: OperationPayload, callback: CompletionCallback) -> ConsensusRoundRef {
        Arc::new(Self {
            payload,
            bound_id: Mutex::new(None),
            status: Mutex::new(ReplicationStatus::Prepared),
            callback: Mutex::new(Some(callback)),
        })
    }

    /// The payload.
    pub fn payload(&self) -> &OperationPayload {
        &self.payload
    }

    /// Bind the op id assigned at append time and mark the round appended.
    pub fn bind_id(&self, id: OpId) {
        let mut bound = self.bound_id.lock();
        debug_assert!(bound.is_none(), "round id bound twice");
        *bound = Some(id);
        *self.status.lock() = ReplicationStatus::Appended;
    }

    /// The op id, once bound.
    pub fn id(&self) -> Option<OpId> {
        *self.bound_id.lock()
    }

    /// Current replication status.
    pub fn status(&self) -> ReplicationStatus {
        *self.status.lock()
    }

    /// Mark the round as acknowledged by a majority.
    pub fn set_majority_replicated(&self) {
        let mut status = self.status.lock();
        if *status == ReplicationStatus::Appended {
            *status = ReplicationStatus::ReplicatedToMajority;
        }
    }

    /// Resolve the round and fire its callback.
    ///
    /// The callback runs at most once; later resolutions are ignored. The
    /// callback must only dispatch work (to the apply pipeline or a worker);
    /// it must not call back into the coordinator.
    pub fn complete(&self, result: ConsensusResult<OpId>) {
        {
            let mut status = self.status.lock();
            match *status {
                ReplicationStatus::Committed | ReplicationStatus::Aborted => return,
                _ => {
                    *status = if result.is_ok() {
                        ReplicationStatus::Committed
                    } else {
                        ReplicationStatus::Aborted
                    };
                }
            }
        }
        if let Some(callback) = self.callback.lock().take() {
            callback(result);
        }
    }
}

impl std::fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsensusRound")
            .field("kind", &self.payload.kind_name())
            .field("id", &self.id())
            .field("status", &self.status())
            .finish()
    }
}
