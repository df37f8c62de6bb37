//! The replica state coordinator.
//!
//! One [`ReplicaState`] per Raft group replica coordinates every state
//! transition: sequencing operations into the pending queue, advancing the
//! commit index, enforcing role and configuration transitions, recording
//! votes durably, and tracking both leader leases.
//!
//! All mutations happen under a single mutex, entered through the
//! `lock_for_*` methods. Each entry point checks that the replica is in a
//! state fit for the requested operation and hands back a [`ReplicaGuard`]
//! on success; the guard exposes the locked state and releases the mutex on
//! every exit path. Read-mostly callers use the lock-free leader-state
//! cache via [`ReplicaState::leader_state`] instead of taking the lock.
//!
//! Completion callbacks and the applied-ops tracker run while the lock is
//! held and must only dispatch work; they must not call back into the
//! coordinator.

use crate::consensus::leader_cache::LeaderStateCache;
use crate::consensus::lease::{
    CoarseTimeLease, LeaderState, LeaderStatus, LeaseResetFlags, MajorityReplicatedData,
    PhysicalComponentLease,
};
use crate::consensus::membership::{PeerRole, RaftConfig};
use crate::consensus::meta::ConsensusMetadata;
use crate::consensus::operation::{ConsensusRoundRef, OperationPayload};
use crate::consensus::opid::OpId;
use crate::consensus::queue::PendingOperations;
use crate::consensus::retryable::{RetryableRequests, RetryableRequestsCounts};
use crate::core::config::ConsensusOptions;
use crate::core::error::{ConsensusError, ConsensusResult};
use crate::core::time::{CoarseTimePoint, MicrosTime};
use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Lifecycle of a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Built but not yet started.
    Initialized,
    /// Accepting requests (from clients if leader, from the leader if
    /// follower).
    Running,
    /// Shutdown initiated; draining in-flight operations.
    ShuttingDown,
    /// Terminal. No further requests are accepted.
    ShutDown,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Initialized => "initialized",
            Self::Running => "running",
            Self::ShuttingDown => "shutting_down",
            Self::ShutDown => "shut_down",
        };
        write!(f, "{name}")
    }
}

/// External collaborators of the coordinator.
///
/// Both callbacks run with the coordinator lock held and must only dispatch
/// work to the apply pipeline or a worker; re-entering the coordinator
/// deadlocks.
pub struct ReplicaStateContext {
    /// Receives committed op ids in strictly ascending order, one batch per
    /// commit advance.
    pub applied_ops_tracker: Box<dyn Fn(&[OpId]) + Send + Sync>,
    /// Invoked when the entry a pending election waits on commits.
    pub election_trigger: Box<dyn Fn(OpId) + Send + Sync>,
}

impl ReplicaStateContext {
    /// A context that ignores both notifications, for tests that do not
    /// observe them.
    pub fn noop() -> Self {
        Self {
            applied_ops_tracker: Box::new(|_| {}),
            election_trigger: Box::new(|_| {}),
        }
    }
}

struct ReplicaStateInner {
    lifecycle: LifecycleState,
    cmeta: ConsensusMetadata,
    pending: PendingOperations,
    retryable_requests: RetryableRequests,

    /// Index of the next operation a leader generates.
    next_index: i64,
    last_received_op_id: OpId,
    /// Same as `last_received_op_id` but only counting entries sent by the
    /// current leader; reset to minimum on every term advancement.
    last_received_op_id_current_leader: OpId,
    last_committed_op_id: OpId,

    /// Id of the split operation requesting to split this group. Set when
    /// the split entry is appended, cleared on abort, unchanged on apply.
    split_op_id: Option<OpId>,
    /// If set, a leader election fires once this op id commits locally.
    pending_election_op_id: Option<OpId>,

    old_leader_lease: CoarseTimeLease,
    old_leader_ht_lease: PhysicalComponentLease,
    /// Leader only: latest majority-replicated coarse lease expiration.
    majority_replicated_lease_expiration: CoarseTimePoint,

    /// Whether the post-election no-op of the current leadership has
    /// committed.
    leader_no_op_committed: bool,

    context: ReplicaStateContext,
}

/// The locked state machine coordinating one replica.
pub struct ReplicaState {
    options: ConsensusOptions,
    inner: Mutex<ReplicaStateInner>,
    cond: Condvar,
    /// Leader only: latest majority-replicated hybrid-time lease
    /// expiration, readable without the lock.
    majority_replicated_ht_lease_expiration: AtomicU64,
    leader_state_cache: LeaderStateCache,
}

/// Scoped access to the locked replica state.
///
/// Obtained from one of the `lock_for_*` entry points; the mutex is
/// released when the guard drops, on every exit path.
pub struct ReplicaGuard<'a> {
    shared: &'a ReplicaState,
    inner: MutexGuard<'a, ReplicaStateInner>,
}

impl ReplicaState {
    /// Build a coordinator around recovered metadata.
    ///
    /// `split_op_id` carries the split operation recovered from the log, if
    /// this group has one pending.
    pub fn new(
        options: ConsensusOptions,
        cmeta: ConsensusMetadata,
        retryable_requests: RetryableRequests,
        split_op_id: Option<OpId>,
        context: ReplicaStateContext,
    ) -> Self {
        let last_committed = OpId::MIN;
        Self {
            options,
            inner: Mutex::new(ReplicaStateInner {
                lifecycle: LifecycleState::Initialized,
                cmeta,
                pending: PendingOperations::new(),
                retryable_requests,
                next_index: 1,
                last_received_op_id: OpId::MIN,
                last_received_op_id_current_leader: OpId::MIN,
                last_committed_op_id: last_committed,
                split_op_id,
                pending_election_op_id: None,
                old_leader_lease: CoarseTimeLease::none(),
                old_leader_ht_lease: PhysicalComponentLease::none(),
                majority_replicated_lease_expiration: CoarseTimePoint::MIN,
                leader_no_op_committed: false,
                context,
            }),
            cond: Condvar::new(),
            majority_replicated_ht_lease_expiration: AtomicU64::new(PhysicalComponentLease::NONE),
            leader_state_cache: LeaderStateCache::new(),
        }
    }

    /// Options this replica was built with.
    pub fn options(&self) -> &ConsensusOptions {
        &self.options
    }

    fn guard(&self) -> ReplicaGuard<'_> {
        ReplicaGuard {
            shared: self,
            inner: self.inner.lock(),
        }
    }

    /// Lock in preparation for [`ReplicaGuard::start`]. Requires the
    /// replica to be freshly initialized.
    pub fn lock_for_start(&self) -> ConsensusResult<ReplicaGuard<'_>> {
        let guard = self.guard();
        if guard.inner.lifecycle != LifecycleState::Initialized {
            return Err(guard.illegal_state(format!(
                "cannot start in state {}",
                guard.inner.lifecycle
            )));
        }
        Ok(guard)
    }

    /// Lock for appending `payload` as leader. Requires a running leader,
    /// and no pending configuration if the payload is a config change.
    pub fn lock_for_replicate(&self, payload: &OperationPayload) -> ConsensusResult<ReplicaGuard<'_>> {
        let guard = self.guard();
        guard.check_running()?;
        let role = guard.inner.cmeta.active_role();
        if role != PeerRole::Leader {
            return Err(guard.illegal_state("replicate requires leadership"));
        }
        if payload.is_config_change() {
            guard.check_no_config_change_pending()?;
        }
        Ok(guard)
    }

    /// Lock for applying an update from the leader. Requires a running
    /// follower or learner.
    pub fn lock_for_update(&self) -> ConsensusResult<ReplicaGuard<'_>> {
        let guard = self.guard();
        guard.check_running()?;
        let role = guard.inner.cmeta.active_role();
        if !matches!(role, PeerRole::Follower | PeerRole::Learner) {
            return Err(guard.illegal_state("update requires follower or learner role"));
        }
        Ok(guard)
    }

    /// Lock for advancing the majority-replicated watermark. Requires a
    /// running leader.
    pub fn lock_for_majority_replicated_index_update(&self) -> ConsensusResult<ReplicaGuard<'_>> {
        let guard = self.guard();
        guard.check_running()?;
        if guard.inner.cmeta.active_role() != PeerRole::Leader {
            return Err(guard.illegal_state("majority-replicated update requires leadership"));
        }
        Ok(guard)
    }

    /// Lock for a configuration change. Requires a running replica with no
    /// configuration change already in flight.
    pub fn lock_for_config_change(&self) -> ConsensusResult<ReplicaGuard<'_>> {
        let guard = self.guard();
        guard.check_running()?;
        guard.check_no_config_change_pending()?;
        Ok(guard)
    }

    /// Begin shutdown: transitions a running replica to the quiescing
    /// state. Idempotent; later calls observe the transition already made.
    pub fn lock_for_shutdown(&self) -> ReplicaGuard<'_> {
        let mut guard = self.guard();
        if matches!(
            guard.inner.lifecycle,
            LifecycleState::Initialized | LifecycleState::Running
        ) {
            guard.inner.lifecycle = LifecycleState::ShuttingDown;
            tracing::info!(
                group = %self.options.group_id,
                peer = %guard.inner.cmeta.peer_uuid(),
                "consensus shutting down"
            );
            guard.refresh_leader_state_cache(&mut None);
        }
        guard
    }

    /// Lock for a state read. No state check.
    pub fn lock_for_read(&self) -> ReplicaGuard<'_> {
        self.guard()
    }

    /// Leadership snapshot for hot read paths.
    ///
    /// Served from the packed cache while its validity horizon holds;
    /// otherwise recomputed under the lock. With `allow_stale`, the cached
    /// word is decoded even past its horizon.
    pub fn leader_state(&self, allow_stale: bool) -> LeaderState {
        let now = CoarseTimePoint::now();
        if allow_stale {
            let (status, extra) = self.leader_state_cache.load_ignoring_validity();
            return Self::unpack_leader_state(status, extra);
        }
        if let Some((status, extra)) = self.leader_state_cache.load(now) {
            return Self::unpack_leader_state(status, extra);
        }
        let mut guard = self.lock_for_read();
        guard.refresh_leader_state_cache(&mut Some(now))
    }

    fn unpack_leader_state(status: LeaderStatus, extra: u64) -> LeaderState {
        match status {
            LeaderStatus::LeaderAndReady => LeaderState {
                status,
                term: extra as i64,
                remaining_old_leader_lease: Duration::ZERO,
            },
            LeaderStatus::LeaderButOldLeaderMayHaveLease => LeaderState {
                status,
                term: 0,
                remaining_old_leader_lease: Duration::from_micros(extra),
            },
            _ => LeaderState {
                status,
                term: 0,
                remaining_old_leader_lease: Duration::ZERO,
            },
        }
    }

    /// Checks that this replica is the active leader and both lease
    /// conditions hold: the predecessor's leases have passed and our own
    /// majority-replicated lease is valid.
    pub fn check_is_active_leader_and_has_lease(&self) -> ConsensusResult<()> {
        let mut guard = self.lock_for_read();
        let state = guard.leader_lease_status(&mut None);
        guard.check_leader_state_ready(&state)
    }

    /// The majority-replicated hybrid-time lease expiration, waiting until
    /// it reaches `min_allowed` or `deadline` passes.
    ///
    /// This is the coordinator's only blocking call. Returns zero on
    /// timeout.
    pub fn majority_replicated_ht_lease_expiration(
        &self,
        min_allowed: MicrosTime,
        deadline: CoarseTimePoint,
    ) -> MicrosTime {
        let result = self
            .majority_replicated_ht_lease_expiration
            .load(Ordering::Acquire);
        if result >= min_allowed {
            return result;
        }

        let mut inner = self.inner.lock();
        loop {
            let result = self
                .majority_replicated_ht_lease_expiration
                .load(Ordering::Acquire);
            if result >= min_allowed {
                return result;
            }
            if deadline == CoarseTimePoint::MAX {
                self.cond.wait(&mut inner);
            } else if self
                .cond
                .wait_until(&mut inner, deadline.to_instant())
                .timed_out()
            {
                let result = self
                    .majority_replicated_ht_lease_expiration
                    .load(Ordering::Acquire);
                return if result >= min_allowed { result } else { 0 };
            }
        }
    }

    /// Cancel every pending operation during shutdown, aborting from the
    /// highest index down. Requires the quiescing phase to have begun.
    pub fn cancel_pending_operations(&self) -> ConsensusResult<()> {
        let mut guard = self.guard();
        if guard.inner.lifecycle != LifecycleState::ShuttingDown {
            return Err(guard.illegal_state("can only cancel pending operations while shutting down"));
        }
        let back = guard.inner.last_committed_op_id.index;
        let aborted = guard.abort_pending_after_index(back, "replica is shutting down");
        if aborted > 0 {
            tracing::info!(
                group = %self.options.group_id,
                peer = %guard.inner.cmeta.peer_uuid(),
                aborted,
                "cancelled pending operations for shutdown"
            );
        }
        Ok(())
    }
}

impl<'a> ReplicaGuard<'a> {
    fn illegal_state(&self, message: impl Into<String>) -> ConsensusError {
        ConsensusError::illegal_state(message, self.inner.cmeta.active_role())
    }

    fn check_running(&self) -> ConsensusResult<()> {
        if self.inner.lifecycle != LifecycleState::Running {
            return Err(self.illegal_state(format!(
                "replica not running (state: {})",
                self.inner.lifecycle
            )));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Readers
    // ------------------------------------------------------------------

    /// Current lifecycle state.
    pub fn lifecycle(&self) -> LifecycleState {
        self.inner.lifecycle
    }

    /// Uuid of the local peer.
    pub fn peer_uuid(&self) -> &str {
        self.inner.cmeta.peer_uuid()
    }

    /// Latest term this replica has seen.
    pub fn current_term(&self) -> i64 {
        self.inner.cmeta.current_term()
    }

    /// Role the replica currently plays.
    pub fn active_role(&self) -> PeerRole {
        self.inner.cmeta.active_role()
    }

    /// Uuid of the current term's leader; empty when unknown.
    pub fn leader_uuid(&self) -> &str {
        self.inner.cmeta.leader_uuid()
    }

    /// The committed configuration.
    pub fn committed_config(&self) -> &RaftConfig {
        self.inner.cmeta.committed_config()
    }

    /// The pending configuration, if a change is in flight.
    pub fn pending_config(&self) -> Option<&RaftConfig> {
        self.inner.cmeta.pending_config()
    }

    /// The active configuration: pending if present, else committed.
    pub fn active_config(&self) -> &RaftConfig {
        self.inner.cmeta.active_config()
    }

    /// Whether a configuration change is in flight.
    pub fn is_config_change_pending(&self) -> bool {
        self.inner.cmeta.has_pending_config()
    }

    /// `Ok` when no configuration change is in flight.
    pub fn check_no_config_change_pending(&self) -> ConsensusResult<()> {
        if self.inner.cmeta.has_pending_config() {
            return Err(self.illegal_state("a configuration change is already pending"));
        }
        Ok(())
    }

    /// Whether a vote was cast in the current term.
    pub fn has_voted_current_term(&self) -> bool {
        self.inner.cmeta.has_voted_current_term()
    }

    /// The vote cast in the current term, if any.
    pub fn voted_for_current_term(&self) -> Option<&str> {
        self.inner.cmeta.voted_for()
    }

    /// Id of the last entry written to the local log.
    pub fn last_received_op_id(&self) -> OpId {
        self.inner.last_received_op_id
    }

    /// Id of the last entry received from the current leader.
    pub fn last_received_op_id_current_leader(&self) -> OpId {
        self.inner.last_received_op_id_current_leader
    }

    /// Watermark below which all operations are committed.
    pub fn last_committed_op_id(&self) -> OpId {
        self.inner.last_committed_op_id
    }

    /// Id of the split operation requesting to split this group, if any.
    pub fn split_op_id(&self) -> Option<OpId> {
        self.inner.split_op_id
    }

    /// Op id a pending election waits on, if any.
    pub fn pending_election_op_id(&self) -> Option<OpId> {
        self.inner.pending_election_op_id
    }

    /// Number of pending operations.
    pub fn num_pending_operations(&self) -> usize {
        self.inner.pending.len()
    }

    /// Op id at the front of the pending queue, if any.
    pub fn first_pending_op_id(&self) -> Option<OpId> {
        self.inner.pending.front_op_id()
    }

    /// Id of the latest pending operation, or the minimum if none.
    pub fn last_pending_op_id(&self) -> OpId {
        self.inner.pending.back_op_id().unwrap_or(OpId::MIN)
    }

    /// The pending round at `index`, if the queue holds it.
    pub fn pending_op_by_index(&self, index: i64) -> Option<ConsensusRoundRef> {
        self.inner.pending.by_index(index).cloned()
    }

    /// Whether an entry of the current term has committed.
    pub fn are_committed_and_current_terms_same(&self) -> bool {
        self.inner.last_committed_op_id.term == self.inner.cmeta.current_term()
    }

    /// Whether the post-election no-op of the current leadership committed.
    pub fn leader_no_op_committed(&self) -> bool {
        self.inner.leader_no_op_committed
    }

    /// On-disk size of the consensus metadata, in bytes.
    pub fn on_disk_size(&self) -> u64 {
        self.inner.cmeta.on_disk_size()
    }

    /// Tracked retryable-request counts.
    pub fn retryable_requests_counts(&self) -> RetryableRequestsCounts {
        self.inner.retryable_requests.counts()
    }

    /// Minimum op id a tracked retryable request still references; the
    /// log-GC floor.
    pub fn min_retryable_request_op_id(&self) -> OpId {
        self.inner.retryable_requests.min_op_id()
    }

    /// The predecessor's coarse lease record.
    pub fn old_leader_lease(&self) -> &CoarseTimeLease {
        &self.inner.old_leader_lease
    }

    /// The predecessor's hybrid-time lease record.
    pub fn old_leader_ht_lease(&self) -> &PhysicalComponentLease {
        &self.inner.old_leader_ht_lease
    }

    /// Whether an operation is in this replica's log: committed, or
    /// matching a pending entry. The second value reports a pending entry
    /// at the same index under a different term.
    pub fn is_op_committed_or_pending(&self, op_id: OpId) -> (bool, bool) {
        if op_id.index <= self.inner.last_committed_op_id.index {
            return (true, false);
        }
        if op_id.index > self.inner.last_received_op_id.index {
            return (false, false);
        }
        match self.inner.pending.by_index(op_id.index) {
            None => (false, false),
            Some(round) => match round.id() {
                Some(id) if id.term == op_id.term => (true, false),
                Some(_) => (false, true),
                None => (false, false),
            },
        }
    }

    /// One-line summary for logs and debugging.
    pub fn summary(&self) -> String {
        format!(
            "Replica: {} State: {} Role: {} Term: {} Received: {} Committed: {} Leader: {}",
            self.inner.cmeta.peer_uuid(),
            self.inner.lifecycle,
            self.inner.cmeta.active_role(),
            self.inner.cmeta.current_term(),
            self.inner.last_received_op_id,
            self.inner.last_committed_op_id,
            if self.inner.cmeta.has_leader() {
                self.inner.cmeta.leader_uuid()
            } else {
                "<none>"
            },
        )
    }

    /// Log the pending queue, for diagnostics.
    pub fn dump_pending_operations(&self) {
        tracing::info!(
            group = %self.shared.options.group_id,
            peer = %self.inner.cmeta.peer_uuid(),
            pending = self.inner.pending.len(),
            "dumping pending operations"
        );
        for round in self.inner.pending.iter() {
            tracing::info!(op = ?round, "pending");
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle transitions
    // ------------------------------------------------------------------

    /// Seed the committed index from persisted metadata. Only legal before
    /// the replica starts and before any commit has been observed.
    pub fn init_committed_op_id(&mut self, committed_op_id: OpId) -> ConsensusResult<()> {
        if self.inner.lifecycle != LifecycleState::Initialized {
            return Err(self.illegal_state("committed index may only be seeded before start"));
        }
        if !self.inner.last_committed_op_id.is_min() || !self.inner.pending.is_empty() {
            return Err(self.illegal_state("committed index already initialized"));
        }
        self.inner.last_committed_op_id = committed_op_id;
        self.inner.cmeta.set_last_committed_op_id(committed_op_id);
        Ok(())
    }

    /// Transition to running, with `last_in_wal` as the last entry the log
    /// recovered.
    pub fn start(&mut self, last_in_wal: OpId) -> ConsensusResult<()> {
        if self.inner.lifecycle != LifecycleState::Initialized {
            return Err(self.illegal_state(format!(
                "cannot start in state {}",
                self.inner.lifecycle
            )));
        }
        self.inner.last_received_op_id = last_in_wal;
        self.inner.next_index = last_in_wal.index + 1;
        self.inner.lifecycle = LifecycleState::Running;
        tracing::info!(
            group = %self.shared.options.group_id,
            peer = %self.inner.cmeta.peer_uuid(),
            last_in_wal = %last_in_wal,
            committed = %self.inner.last_committed_op_id,
            "replica running"
        );
        self.refresh_leader_state_cache(&mut None);
        Ok(())
    }

    /// Complete shutdown after the quiescing phase drained. Terminal.
    pub fn complete_shutdown(&mut self) -> ConsensusResult<()> {
        if self.inner.lifecycle != LifecycleState::ShuttingDown {
            return Err(self.illegal_state("shutdown must begin with the quiescing phase"));
        }
        debug_assert!(self.inner.pending.is_empty(), "shutdown with pending operations");
        self.inner.lifecycle = LifecycleState::ShutDown;
        tracing::info!(
            group = %self.shared.options.group_id,
            peer = %self.inner.cmeta.peer_uuid(),
            "replica shut down"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // Term, vote, leader
    // ------------------------------------------------------------------

    /// Advance to `new_term`. Clears the vote, the known leader, and the
    /// current-leader receive baseline, then persists. Fails with
    /// `IllegalState` when the term does not increase; a persistence
    /// failure rolls the transition back and surfaces as `Fatal`.
    pub fn set_current_term(&mut self, new_term: i64) -> ConsensusResult<()> {
        let inner = &mut *self.inner;
        if new_term <= inner.cmeta.current_term() {
            return Err(ConsensusError::illegal_state(
                format!(
                    "cannot change term {} to a term that is lower than or equal to it: {}",
                    inner.cmeta.current_term(),
                    new_term
                ),
                inner.cmeta.active_role(),
            ));
        }

        let prior_term = inner.cmeta.current_term();
        let prior_vote = inner.cmeta.voted_for().map(str::to_string);
        let prior_leader = inner.cmeta.leader_uuid().to_string();
        let prior_candidate = inner.cmeta.is_candidate();
        let prior_baseline = inner.last_received_op_id_current_leader;
        let prior_no_op = inner.leader_no_op_committed;

        inner.cmeta.set_current_term(new_term);
        inner.cmeta.set_voted_for(None);
        inner.cmeta.clear_leader();
        inner.cmeta.set_candidate(false);
        inner.last_received_op_id_current_leader = OpId::MIN;
        inner.leader_no_op_committed = false;

        if let Err(err) = inner.cmeta.flush() {
            inner.cmeta.set_current_term(prior_term);
            inner.cmeta.set_voted_for(prior_vote);
            inner.cmeta.set_leader_uuid(prior_leader);
            inner.cmeta.set_candidate(prior_candidate);
            inner.last_received_op_id_current_leader = prior_baseline;
            inner.leader_no_op_committed = prior_no_op;
            return Err(ConsensusError::fatal("failed to persist term change", err));
        }

        tracing::info!(
            group = %self.shared.options.group_id,
            peer = %self.inner.cmeta.peer_uuid(),
            term = new_term,
            "advanced to new term"
        );
        self.refresh_leader_state_cache(&mut None);
        Ok(())
    }

    /// Record a vote for the current term and persist it before returning.
    /// Voting twice for the same uuid is idempotent; voting for a second
    /// uuid fails. A persistence failure rolls the vote back.
    pub fn set_voted_for_current_term(&mut self, uuid: &str) -> ConsensusResult<()> {
        let inner = &mut *self.inner;
        if let Some(existing) = inner.cmeta.voted_for() {
            if existing == uuid {
                return Ok(());
            }
            return Err(ConsensusError::illegal_state(
                format!(
                    "already voted for {} in term {}",
                    existing,
                    inner.cmeta.current_term()
                ),
                inner.cmeta.active_role(),
            ));
        }

        inner.cmeta.set_voted_for(Some(uuid.to_string()));
        if let Err(err) = inner.cmeta.flush() {
            inner.cmeta.set_voted_for(None);
            return Err(ConsensusError::fatal("failed to persist vote", err));
        }
        tracing::info!(
            group = %self.shared.options.group_id,
            peer = %self.inner.cmeta.peer_uuid(),
            term = self.inner.cmeta.current_term(),
            voted_for = uuid,
            "vote recorded"
        );
        Ok(())
    }

    /// Record the current term's leader.
    pub fn set_leader_uuid(&mut self, uuid: &str) {
        self.inner.cmeta.set_leader_uuid(uuid);
        tracing::debug!(
            group = %self.shared.options.group_id,
            peer = %self.inner.cmeta.peer_uuid(),
            leader = uuid,
            "leader updated"
        );
        self.refresh_leader_state_cache(&mut None);
    }

    /// Forget the current leader.
    pub fn clear_leader_uuid(&mut self) {
        self.inner.cmeta.clear_leader();
        self.refresh_leader_state_cache(&mut None);
    }

    /// Mark or clear candidacy for the current term.
    pub fn set_candidate(&mut self, candidate: bool) {
        if candidate {
            self.inner.cmeta.clear_leader();
        }
        self.inner.cmeta.set_candidate(candidate);
        self.refresh_leader_state_cache(&mut None);
    }

    /// Record whether the post-election no-op has committed.
    pub fn set_leader_no_op_committed(&mut self, value: bool) {
        self.inner.leader_no_op_committed = value;
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Set `new_config` as pending commit. Does not persist; committing the
    /// change operation promotes and persists it.
    pub fn set_pending_config(&mut self, new_config: RaftConfig) -> ConsensusResult<()> {
        new_config.validate()?;
        self.check_no_config_change_pending()?;
        self.inner.cmeta.set_pending_config(new_config);
        self.refresh_leader_state_cache(&mut None);
        Ok(())
    }

    /// Drop the pending configuration (change operation aborted).
    pub fn clear_pending_config(&mut self) {
        self.inner.cmeta.clear_pending_config();
        self.refresh_leader_state_cache(&mut None);
    }

    /// Promote `new_config` to committed and persist it. Requires the
    /// pending configuration to match, or - with no pending change - to be
    /// an idempotent repeat of the committed one. A persistence failure
    /// restores the previous configurations.
    pub fn set_committed_config(&mut self, new_config: RaftConfig) -> ConsensusResult<()> {
        new_config.validate()?;
        let inner = &mut *self.inner;
        match inner.cmeta.pending_config() {
            None => {
                if inner.cmeta.committed_config() == &new_config {
                    // Idempotent repeat of an already-committed change.
                    return Ok(());
                }
                return Err(ConsensusError::illegal_state(
                    "no pending configuration to commit",
                    inner.cmeta.active_role(),
                ));
            }
            Some(pending) if pending != &new_config => {
                return Err(ConsensusError::invalid_argument(
                    "committed configuration differs from the pending one",
                ));
            }
            Some(_) => {}
        }

        let prior_committed = inner.cmeta.committed_config().clone();
        let prior_pending = inner.cmeta.pending_config().cloned();
        inner.cmeta.set_committed_config(new_config);
        if let Err(err) = inner.cmeta.flush() {
            inner.cmeta.set_committed_config(prior_committed);
            if let Some(pending) = prior_pending {
                inner.cmeta.set_pending_config(pending);
            }
            return Err(ConsensusError::fatal(
                "failed to persist committed configuration",
                err,
            ));
        }
        tracing::info!(
            group = %self.shared.options.group_id,
            peer = %self.inner.cmeta.peer_uuid(),
            config = %self.inner.cmeta.committed_config(),
            "configuration committed"
        );
        self.refresh_leader_state_cache(&mut None);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operation sequencing
    // ------------------------------------------------------------------

    /// The id for the next operation this leader generates.
    pub fn new_op_id(&mut self) -> OpId {
        let id = OpId::new(self.inner.cmeta.current_term(), self.inner.next_index);
        self.inner.next_index += 1;
        id
    }

    /// Return an issued id after the operation failed before entering the
    /// queue, so indices within the term stay contiguous.
    pub fn cancel_issued_op_id(&mut self, id: OpId) -> ConsensusResult<()> {
        if id.index != self.inner.next_index - 1 {
            return Err(ConsensusError::invalid_argument(format!(
                "cannot return op id {}; next index is {}",
                id, self.inner.next_index
            )));
        }
        self.inner.next_index -= 1;
        Ok(())
    }

    /// Append `round` to the pending queue.
    ///
    /// The round's id must directly follow the last received id, its term
    /// must not regress, a config change requires no pending
    /// configuration, and a retryable request id must not duplicate one in
    /// the dedup window. On acceptance the last received id advances and
    /// the payload's side records (pending configuration, split op id,
    /// retryable registration) are updated.
    pub fn add_pending_operation(&mut self, round: ConsensusRoundRef) -> ConsensusResult<()> {
        if self.inner.lifecycle != LifecycleState::Running {
            return Err(self.illegal_state(format!(
                "cannot accept operations in state {}",
                self.inner.lifecycle
            )));
        }
        let id = round
            .id()
            .ok_or_else(|| ConsensusError::invalid_argument("operation has no bound op id"))?;

        if id.index != self.inner.last_received_op_id.index + 1 {
            return Err(ConsensusError::invalid_argument(format!(
                "operation index {} does not follow last received {}",
                id, self.inner.last_received_op_id
            )));
        }
        let current_term = self.inner.cmeta.current_term();
        if id.term < current_term {
            return Err(ConsensusError::invalid_argument(format!(
                "operation term {} behind current term {}",
                id.term, current_term
            )));
        }
        debug_assert_eq!(
            id.term, current_term,
            "append paths advance the term before accepting entries"
        );

        match round.payload() {
            OperationPayload::ConfigChange { new_config } => {
                self.check_no_config_change_pending()?;
                new_config.validate()?;
                let mut pending = new_config.clone();
                pending.config_op_id = id;
                self.inner.cmeta.set_pending_config(pending);
            }
            OperationPayload::SplitRequest { .. } => {
                if let Some(existing) = self.inner.split_op_id {
                    return Err(self.illegal_state(format!(
                        "split already requested by operation {existing}"
                    )));
                }
                self.inner.split_op_id = Some(id);
            }
            _ => {
                // Registration rejects duplicate client requests before any
                // state is touched.
                self.inner.retryable_requests.register(&round)?;
            }
        }

        self.inner.pending.push_back(round);
        self.inner.last_received_op_id = id;
        if self.inner.next_index <= id.index {
            self.inner.next_index = id.index + 1;
        }
        Ok(())
    }

    /// Update the last received op id from a leader append. Monotonic
    /// within a term; a term advance resets the comparison.
    pub fn update_last_received_op_id(&mut self, op_id: OpId) -> ConsensusResult<()> {
        let last = self.inner.last_received_op_id;
        if op_id.term < last.term || (op_id.term == last.term && op_id.index < last.index) {
            return Err(ConsensusError::invalid_argument(format!(
                "last received op id cannot move back from {last} to {op_id}"
            )));
        }
        self.inner.last_received_op_id = op_id;
        self.inner.last_received_op_id_current_leader = op_id;
        self.inner.next_index = op_id.index + 1;
        Ok(())
    }

    /// Update the current-leader receive baseline only.
    pub fn update_last_received_op_id_current_leader(&mut self, op_id: OpId) -> ConsensusResult<()> {
        let last = self.inner.last_received_op_id_current_leader;
        if op_id < last {
            return Err(ConsensusError::invalid_argument(format!(
                "current-leader baseline cannot move back from {last} to {op_id}"
            )));
        }
        self.inner.last_received_op_id_current_leader = op_id;
        Ok(())
    }

    /// Abort pending operations after, but not including, `index`.
    ///
    /// Aborts run in descending index order, unwinding speculative state;
    /// each aborted operation is unregistered from the dedup window and its
    /// callback fires with an abort status. The last received id falls back
    /// to the kept tail, or to the committed id if everything was aborted.
    pub fn abort_ops_after(&mut self, index: i64) -> ConsensusResult<()> {
        let aborted = self.abort_pending_after_index(index, "aborted by new leader");
        let inner = &mut *self.inner;
        inner.last_received_op_id = inner
            .pending
            .back_op_id()
            .unwrap_or(inner.last_committed_op_id);
        inner.next_index = inner.last_received_op_id.index + 1;
        if aborted > 0 {
            tracing::info!(
                group = %self.shared.options.group_id,
                peer = %inner.cmeta.peer_uuid(),
                after_index = index,
                aborted,
                last_received = %inner.last_received_op_id,
                "aborted operations after index"
            );
        }
        Ok(())
    }

    /// Abort everything above `index`, firing callbacks in descending
    /// order. Returns the number of aborted operations.
    fn abort_pending_after_index(&mut self, index: i64, reason: &str) -> usize {
        let inner = &mut *self.inner;
        let removed = inner.pending.truncate_after(index);
        for round in &removed {
            let id = round.id().expect("queued round has a bound id");
            inner.retryable_requests.mark_aborted(round);
            if inner.split_op_id == Some(id) {
                inner.split_op_id = None;
            }
            if round.payload().is_config_change()
                && inner.cmeta.pending_config().map(|c| c.config_op_id) == Some(id)
            {
                inner.cmeta.clear_pending_config();
            }
            round.complete(Err(ConsensusError::aborted(id, reason)));
        }
        removed.len()
    }

    /// Age out retryable-request entries whose window has passed.
    pub fn cleanup_retryable_requests(&mut self) {
        let now = self.inner.retryable_requests.clock().now();
        self.inner.retryable_requests.cleanup(now);
    }

    /// Make `op_id` uninitialized again after a split abort.
    pub fn reset_split_op_id(&mut self) {
        self.inner.split_op_id = None;
    }

    /// Record that an election should fire once `op_id` commits locally.
    pub fn set_pending_election_op_id(&mut self, op_id: OpId) {
        self.inner.pending_election_op_id = Some(op_id);
    }

    /// Drop the pending-election trigger.
    pub fn clear_pending_election_op_id(&mut self) {
        self.inner.pending_election_op_id = None;
    }

    // ------------------------------------------------------------------
    // Commit tracking
    // ------------------------------------------------------------------

    /// Advance the commit index from a majority-replicated watermark.
    ///
    /// Leader side: chooses the greatest pending op id that is at most
    /// `majority_replicated` *and* carries the current term - a leader
    /// never commits through an entry of an earlier term - then advances
    /// the committed id. Returns the committed id and whether it changed.
    pub fn update_majority_replicated(
        &mut self,
        majority_replicated: OpId,
    ) -> ConsensusResult<(OpId, bool)> {
        for round in self.inner.pending.iter() {
            match round.id() {
                Some(id) if id <= majority_replicated => round.set_majority_replicated(),
                _ => break,
            }
        }

        let current_term = self.inner.cmeta.current_term();
        let mut target = None;
        for round in self.inner.pending.iter() {
            let Some(id) = round.id() else { break };
            if id > majority_replicated {
                break;
            }
            if id.term == current_term {
                target = Some(id);
            }
        }

        let Some(target) = target else {
            return Ok((self.inner.last_committed_op_id, false));
        };
        let changed = self.advance_committed_op_id(target, false)?;
        Ok((self.inner.last_committed_op_id, changed))
    }

    /// Advance the committed op id to `committed_op_id`, applying pending
    /// operations in ascending order.
    ///
    /// A no-op when the index does not advance. With `could_stop`, the
    /// advance tolerates stopping early when the local log has not yet
    /// received everything the leader committed.
    pub fn advance_committed_op_id(
        &mut self,
        committed_op_id: OpId,
        could_stop: bool,
    ) -> ConsensusResult<bool> {
        if committed_op_id.index <= self.inner.last_committed_op_id.index {
            debug_assert!(
                committed_op_id.index == self.inner.last_committed_op_id.index
                    || committed_op_id <= self.inner.last_committed_op_id,
                "commit index regression: {} behind {}",
                committed_op_id,
                self.inner.last_committed_op_id
            );
            return Ok(false);
        }

        let prior_committed = self.inner.last_committed_op_id;
        let mut applied_op_ids = Vec::new();
        let mut completed = Vec::new();

        loop {
            let Some(front) = self.inner.pending.front_op_id() else {
                break;
            };
            if front.index > committed_op_id.index {
                break;
            }
            debug_assert_eq!(
                front.index,
                self.inner.last_committed_op_id.index + 1,
                "pending queue not contiguous with committed id"
            );

            // Promote a pending configuration before its change operation
            // completes, so the new membership is durable by the time the
            // callback observes the commit.
            let is_matching_config_change = self
                .inner
                .cmeta
                .pending_config()
                .map(|c| c.config_op_id == front)
                .unwrap_or(false);
            if is_matching_config_change {
                let new_config = self
                    .inner
                    .cmeta
                    .pending_config()
                    .cloned()
                    .expect("pending config present");
                if let Err(err) = self.promote_pending_config(new_config) {
                    // Stop in front of the configuration entry: earlier
                    // operations stay committed, this entry and everything
                    // after stay pending.
                    self.finish_commit_advance(prior_committed, &applied_op_ids, completed);
                    return Err(err);
                }
            }

            let round = self
                .inner
                .pending
                .pop_through(front.index)
                .pop()
                .expect("front round present");
            self.inner.retryable_requests.mark_replicated(&round);
            self.inner.last_committed_op_id = front;
            self.inner.cmeta.set_last_committed_op_id(front);
            applied_op_ids.push(front);
            completed.push(round);

            if self.inner.pending_election_op_id == Some(front) {
                self.inner.pending_election_op_id = None;
                tracing::info!(
                    group = %self.shared.options.group_id,
                    peer = %self.inner.cmeta.peer_uuid(),
                    op_id = %front,
                    "pending election trigger committed; starting election"
                );
                (self.inner.context.election_trigger)(front);
            }
        }

        if self.inner.last_committed_op_id.index < committed_op_id.index {
            debug_assert!(
                could_stop,
                "commit advance to {} stopped at {} with could_stop unset",
                committed_op_id, self.inner.last_committed_op_id
            );
            tracing::debug!(
                group = %self.shared.options.group_id,
                peer = %self.inner.cmeta.peer_uuid(),
                requested = %committed_op_id,
                reached = %self.inner.last_committed_op_id,
                "commit advance stopped before requested id"
            );
        }

        let changed = self.inner.last_committed_op_id != prior_committed;
        self.finish_commit_advance(prior_committed, &applied_op_ids, completed);
        Ok(changed)
    }

    fn promote_pending_config(&mut self, new_config: RaftConfig) -> ConsensusResult<()> {
        // The committed record keeps the change op id it was introduced by.
        let inner = &mut *self.inner;
        let prior_committed = inner.cmeta.committed_config().clone();
        let prior_pending = inner.cmeta.pending_config().cloned();
        inner.cmeta.set_committed_config(new_config);
        if let Err(err) = inner.cmeta.flush() {
            inner.cmeta.set_committed_config(prior_committed);
            if let Some(pending) = prior_pending {
                inner.cmeta.set_pending_config(pending);
            }
            return Err(ConsensusError::fatal(
                "failed to persist configuration promotion",
                err,
            ));
        }
        tracing::info!(
            group = %self.shared.options.group_id,
            peer = %self.inner.cmeta.peer_uuid(),
            config = %self.inner.cmeta.committed_config(),
            "pending configuration promoted to committed"
        );
        Ok(())
    }

    /// Dispatch the results of a commit advance: the ordered applied-ops
    /// batch, then each round's completion, in ascending op id order.
    fn finish_commit_advance(
        &mut self,
        prior_committed: OpId,
        applied_op_ids: &[OpId],
        completed: Vec<ConsensusRoundRef>,
    ) {
        if applied_op_ids.is_empty() {
            return;
        }
        debug_assert!(self.inner.last_committed_op_id >= prior_committed);
        (self.inner.context.applied_ops_tracker)(applied_op_ids);
        for round in completed {
            let id = round.id().expect("completed round has a bound id");
            round.complete(Ok(id));
        }
        self.refresh_leader_state_cache(&mut None);
    }

    // ------------------------------------------------------------------
    // Leases
    // ------------------------------------------------------------------

    /// Fold a leader message's lease projections into the predecessor
    /// records while not the leader. Both records only advance.
    pub fn update_old_leader_lease(
        &mut self,
        lease: Option<CoarseTimeLease>,
        ht_lease: Option<PhysicalComponentLease>,
    ) {
        let inner = &mut *self.inner;
        if let Some(lease) = lease {
            inner
                .old_leader_lease
                .extend_to(&lease.holder_uuid, lease.expiration);
        }
        if let Some(ht_lease) = ht_lease {
            inner
                .old_leader_ht_lease
                .extend_to(&ht_lease.holder_uuid, ht_lease.expiration);
        }
        self.refresh_leader_state_cache(&mut None);
    }

    /// Record the leader's own majority-replicated lease expirations, with
    /// independent one-way resets of the predecessor records as directed by
    /// `flags`. Wakes any hybrid-time lease waiters.
    pub fn set_majority_replicated_lease_expiration(
        &mut self,
        data: &MajorityReplicatedData,
        flags: LeaseResetFlags,
    ) {
        let inner = &mut *self.inner;
        inner.majority_replicated_lease_expiration = data.leader_lease_expiration;
        self.shared
            .majority_replicated_ht_lease_expiration
            .store(data.ht_lease_expiration, Ordering::Release);
        if flags.reset_old_leader_lease {
            inner.old_leader_lease.reset();
        }
        if flags.reset_old_leader_ht_lease {
            inner.old_leader_ht_lease.reset();
        }
        self.shared.cond.notify_all();
        self.refresh_leader_state_cache(&mut None);
    }

    /// Remaining duration of the predecessor's coarse lease.
    ///
    /// Once the lease is observed expired the record resets to "none", the
    /// one permitted decrease, so later evaluations skip the clock read.
    /// `now` is an in/out cache of the current time: filled on first use,
    /// reused if the caller already read the clock.
    pub fn remaining_old_leader_lease_duration(
        &mut self,
        now: &mut Option<CoarseTimePoint>,
    ) -> Duration {
        if self.inner.old_leader_lease.is_none() {
            return Duration::ZERO;
        }
        let at = *now.get_or_insert_with(CoarseTimePoint::now);
        if self.inner.old_leader_lease.expired_at(at) {
            self.inner.old_leader_lease.reset();
            return Duration::ZERO;
        }
        self.inner.old_leader_lease.remaining_at(at)
    }

    /// Whether the leader's own majority-replicated coarse lease has
    /// lapsed (or was never established).
    pub fn majority_replicated_leader_lease_expired(
        &self,
        now: &mut Option<CoarseTimePoint>,
    ) -> bool {
        if self.inner.majority_replicated_lease_expiration == CoarseTimePoint::MIN {
            return true;
        }
        let at = *now.get_or_insert_with(CoarseTimePoint::now);
        at >= self.inner.majority_replicated_lease_expiration
    }

    /// Whether the leader's own majority-replicated hybrid-time lease has
    /// lapsed at physical time `micros`.
    pub fn majority_replicated_ht_lease_expired_at(&self, micros: MicrosTime) -> bool {
        let expiration = self
            .shared
            .majority_replicated_ht_lease_expiration
            .load(Ordering::Acquire);
        expiration == PhysicalComponentLease::NONE || micros >= expiration
    }

    /// Evaluate leadership against the coarse leases.
    ///
    /// `now` is the in/out time cache described on
    /// [`Self::remaining_old_leader_lease_duration`].
    pub fn leader_lease_status(&mut self, now: &mut Option<CoarseTimePoint>) -> LeaderState {
        if self.inner.cmeta.active_role() != PeerRole::Leader {
            return LeaderState::not_leader(self.inner.cmeta.has_leader());
        }
        let term = self.inner.cmeta.current_term();

        let remaining = self.remaining_old_leader_lease_duration(now);
        if remaining > Duration::ZERO {
            return LeaderState {
                status: LeaderStatus::LeaderButOldLeaderMayHaveLease,
                term,
                remaining_old_leader_lease: remaining,
            };
        }
        if self.majority_replicated_leader_lease_expired(now) {
            return LeaderState {
                status: LeaderStatus::LeaderButOldLeaderLeaseNotYetExpired,
                term,
                remaining_old_leader_lease: Duration::ZERO,
            };
        }
        LeaderState {
            status: LeaderStatus::LeaderAndReady,
            term,
            remaining_old_leader_lease: Duration::ZERO,
        }
    }

    /// Evaluate leadership against the hybrid-time leases at physical time
    /// `micros`.
    pub fn hybrid_time_lease_status_at(&mut self, micros: MicrosTime) -> LeaderState {
        if self.inner.cmeta.active_role() != PeerRole::Leader {
            return LeaderState::not_leader(self.inner.cmeta.has_leader());
        }
        let term = self.inner.cmeta.current_term();

        if !self.inner.old_leader_ht_lease.expired_at(micros) {
            return LeaderState {
                status: LeaderStatus::LeaderButOldLeaderMayHaveLease,
                term,
                remaining_old_leader_lease: Duration::ZERO,
            };
        }
        if self.majority_replicated_ht_lease_expired_at(micros) {
            return LeaderState {
                status: LeaderStatus::LeaderButOldLeaderLeaseNotYetExpired,
                term,
                remaining_old_leader_lease: Duration::ZERO,
            };
        }
        LeaderState {
            status: LeaderStatus::LeaderAndReady,
            term,
            remaining_old_leader_lease: Duration::ZERO,
        }
    }

    /// Map a leadership evaluation to a result callers can act on.
    pub fn check_leader_state_ready(&self, state: &LeaderState) -> ConsensusResult<()> {
        match state.status {
            LeaderStatus::LeaderAndReady => Ok(()),
            LeaderStatus::NoLeader | LeaderStatus::NotLeader => {
                Err(self.illegal_state("not the leader"))
            }
            LeaderStatus::LeaderButOldLeaderMayHaveLease => {
                Err(ConsensusError::expired(format!(
                    "previous leader may still hold a lease for {:?}",
                    state.remaining_old_leader_lease
                )))
            }
            LeaderStatus::LeaderButOldLeaderLeaseNotYetExpired => Err(ConsensusError::expired(
                "majority-replicated leader lease not yet valid",
            )),
        }
    }

    /// Recompute the packed leadership snapshot. Called whenever leadership
    /// or lease state changes; returns the freshly computed state.
    pub fn refresh_leader_state_cache(&mut self, now: &mut Option<CoarseTimePoint>) -> LeaderState {
        let state = self.leader_lease_status(now);
        let (extra, valid_until) = match state.status {
            LeaderStatus::LeaderAndReady => (
                state.term as u64,
                self.inner.majority_replicated_lease_expiration,
            ),
            // Clamped so the packed word's high bits cannot overflow.
            LeaderStatus::LeaderButOldLeaderMayHaveLease => (
                state
                    .remaining_old_leader_lease
                    .as_micros()
                    .min((u64::MAX >> 3) as u128) as u64,
                self.inner.old_leader_lease.expiration,
            ),
            // Not yet provable: stays stale so every read rechecks.
            LeaderStatus::LeaderButOldLeaderLeaseNotYetExpired => {
                (0, now.unwrap_or_else(CoarseTimePoint::now))
            }
            // Non-leader states stay valid until leadership changes, which
            // itself refreshes the cache under the lock.
            LeaderStatus::NoLeader | LeaderStatus::NotLeader => (0, CoarseTimePoint::MAX),
        };
        self.shared
            .leader_state_cache
            .store(state.status, extra, valid_until);
        state
    }
}
