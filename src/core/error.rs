//! Error types for the consensus coordination core.
//!
//! Every guarded entry point and state transition surfaces one of these
//! conditions. Precondition and argument failures leave in-memory state
//! untouched; durable-store failures roll the triggering transition back
//! before propagating.

use crate::consensus::opid::OpId;
use crate::consensus::membership::PeerRole;
use thiserror::Error;

/// Error conditions of the replica state coordinator.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// A guarded entry point was called in the wrong state or role.
    ///
    /// The caller is expected to retry after the state changes, or to abort
    /// its higher-level operation. Carries the replica's current role so
    /// client libraries can redirect to the believed leader.
    #[error("illegal state: {message} (role: {role})")]
    IllegalState { message: String, role: PeerRole },

    /// A malformed op id, a non-monotonic index, a term regression on
    /// append, or an ill-formed configuration.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    /// An idempotent vote or configuration change was detected. Recovered
    /// locally; callers observing this have already succeeded.
    #[error("already present: {message}")]
    AlreadyPresent { message: String },

    /// A duplicate retryable client request within the dedup window.
    /// Carries the op id under which the original request was sequenced.
    #[error("duplicate request {request_id} from client {client_id}, original op {original_op_id}")]
    DuplicateRequest {
        client_id: String,
        request_id: i64,
        original_op_id: OpId,
    },

    /// A lease check failed: leadership cannot be proven at this time.
    #[error("leader lease expired or not yet acquired: {message}")]
    Expired { message: String },

    /// The operation was aborted before commit (log truncation, shutdown).
    #[error("operation {op_id} aborted: {message}")]
    Aborted { op_id: OpId, message: String },

    /// A durable-store write failed during a state transition. The
    /// transition has been rolled back; the caller is expected to step down.
    #[error("fatal: {message}: {cause}")]
    Fatal {
        message: String,
        cause: anyhow::Error,
    },
}

impl ConsensusError {
    /// An `IllegalState` with the given message and the replica's role.
    pub fn illegal_state(message: impl Into<String>, role: PeerRole) -> Self {
        Self::IllegalState {
            message: message.into(),
            role,
        }
    }

    /// An `InvalidArgument` with the given message.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// An `AlreadyPresent` with the given message.
    pub fn already_present(message: impl Into<String>) -> Self {
        Self::AlreadyPresent {
            message: message.into(),
        }
    }

    /// An `Expired` with the given message.
    pub fn expired(message: impl Into<String>) -> Self {
        Self::Expired {
            message: message.into(),
        }
    }

    /// An `Aborted` for the given op.
    pub fn aborted(op_id: OpId, message: impl Into<String>) -> Self {
        Self::Aborted {
            op_id,
            message: message.into(),
        }
    }

    /// A `Fatal` wrapping a durable-store failure.
    pub fn fatal(message: impl Into<String>, cause: anyhow::Error) -> Self {
        Self::Fatal {
            message: message.into(),
            cause,
        }
    }

    /// Whether the caller may treat this as success (idempotent recovery).
    pub fn is_recovered(&self) -> bool {
        matches!(self, Self::AlreadyPresent { .. })
    }

    /// Whether the caller should retry after the replica's state changes.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::IllegalState { .. } | Self::Expired { .. })
    }

    /// Whether the higher layer is expected to step down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal { .. })
    }
}

/// Result type using [`ConsensusError`].
pub type ConsensusResult<T> = Result<T, ConsensusError>;
