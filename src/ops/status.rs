//! Operator-visible consensus status.
//!
//! A read-only snapshot of one replica's consensus state, serialized for
//! admin endpoints. Captured under the coordinator lock so the fields are
//! mutually consistent.

use crate::consensus::lease::LeaderStatus;
use crate::consensus::membership::{PeerRole, RaftConfig};
use crate::consensus::opid::OpId;
use crate::consensus::replica_state::{LifecycleState, ReplicaGuard, ReplicaState};
use serde::{Deserialize, Serialize};

/// Snapshot of a replica's consensus state for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusStatusDump {
    /// Raft group this replica belongs to.
    pub group_id: String,
    /// Uuid of the local peer.
    pub peer_uuid: String,
    /// Lifecycle state.
    pub lifecycle: LifecycleState,
    /// Current role.
    pub role: PeerRole,
    /// Current term.
    pub term: i64,
    /// Leader uuid, if known.
    pub leader_uuid: Option<String>,
    /// Last entry written to the local log.
    pub last_received_op_id: OpId,
    /// Commit watermark.
    pub last_committed_op_id: OpId,
    /// Pending configuration, if a change is in flight.
    pub pending_config: Option<RaftConfig>,
    /// Leadership readiness.
    pub leader_status: LeaderStatus,
    /// Remaining predecessor lease in milliseconds, when tracked.
    pub remaining_old_leader_lease_ms: u64,
    /// Whether the post-election no-op has committed.
    pub leader_no_op_committed: bool,
    /// Operations appended but not yet committed.
    pub num_pending_operations: usize,
    /// Tracked retryable requests (running + replicated).
    pub num_retryable_requests: usize,
    /// On-disk size of the consensus metadata, in bytes.
    pub metadata_on_disk_size: u64,
}

impl ConsensusStatusDump {
    /// Capture a snapshot from a locked guard.
    pub fn capture(replica: &ReplicaState, guard: &mut ReplicaGuard<'_>) -> Self {
        let leader_state = guard.leader_lease_status(&mut None);
        let counts = guard.retryable_requests_counts();
        Self {
            group_id: replica.options().group_id.clone(),
            peer_uuid: guard.peer_uuid().to_string(),
            lifecycle: guard.lifecycle(),
            role: guard.active_role(),
            term: guard.current_term(),
            leader_uuid: if guard.leader_uuid().is_empty() {
                None
            } else {
                Some(guard.leader_uuid().to_string())
            },
            last_received_op_id: guard.last_received_op_id(),
            last_committed_op_id: guard.last_committed_op_id(),
            pending_config: guard.pending_config().cloned(),
            leader_status: leader_state.status,
            remaining_old_leader_lease_ms: leader_state.remaining_old_leader_lease.as_millis()
                as u64,
            leader_no_op_committed: guard.leader_no_op_committed(),
            num_pending_operations: guard.num_pending_operations(),
            num_retryable_requests: counts.running + counts.replicated,
            metadata_on_disk_size: guard.on_disk_size(),
        }
    }

    /// Capture a snapshot, taking the read lock.
    pub fn from_replica(replica: &ReplicaState) -> Self {
        let mut guard = replica.lock_for_read();
        Self::capture(replica, &mut guard)
    }

    /// Serialize for an admin endpoint.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
