//! Common test utilities.
//!
//! Shared builders for integration tests. Import with `mod common;` in
//! test files.
#![allow(dead_code)]

use clustor::consensus::meta::{
    ConsensusMetadata, DurableConsensusState, InMemoryMetadataStorage, MetadataStorage,
};
use clustor::consensus::operation::{
    ConsensusRound, ConsensusRoundRef, OperationPayload, RetryableRequestId,
};
use clustor::consensus::opid::OpId;
use clustor::consensus::membership::{RaftConfig, RaftPeer};
use clustor::consensus::replica_state::{ReplicaState, ReplicaStateContext};
use clustor::consensus::retryable::RetryableRequests;
use clustor::core::config::ConsensusOptions;
use clustor::core::error::ConsensusResult;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A three-voter configuration over peers `a`, `b`, `c`.
pub fn three_voter_config() -> RaftConfig {
    RaftConfig::new(vec![
        RaftPeer::voter("a", "host-a:7100"),
        RaftPeer::voter("b", "host-b:7100"),
        RaftPeer::voter("c", "host-c:7100"),
    ])
}

/// Metadata storage shared with the test so persisted state is observable
/// from outside the coordinator (including inside callbacks).
#[derive(Clone, Default)]
pub struct SharedStorage {
    inner: Arc<Mutex<InMemoryMetadataStorage>>,
}

impl SharedStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next persist fail, to exercise rollback paths.
    pub fn fail_next_persist(&self) {
        self.inner.lock().unwrap().fail_next_persist();
    }

    /// The last successfully persisted record.
    pub fn persisted(&self) -> Option<DurableConsensusState> {
        self.inner.lock().unwrap().persisted().cloned()
    }
}

impl MetadataStorage for SharedStorage {
    fn persist(&mut self, state: &DurableConsensusState) -> anyhow::Result<()> {
        self.inner.lock().unwrap().persist(state)
    }

    fn on_disk_size(&self) -> u64 {
        self.inner.lock().unwrap().on_disk_size()
    }
}

/// Events observed through collaborator callbacks.
#[derive(Clone, Default)]
pub struct Observed {
    /// Applied-op batches, in dispatch order.
    pub applied: Arc<Mutex<Vec<Vec<OpId>>>>,
    /// Pending-election triggers that fired.
    pub elections: Arc<Mutex<Vec<OpId>>>,
}

impl Observed {
    pub fn new() -> Self {
        Self::default()
    }

    /// All applied op ids, flattened across batches.
    pub fn applied_flat(&self) -> Vec<OpId> {
        self.applied.lock().unwrap().iter().flatten().copied().collect()
    }
}

/// A replica under test plus the hooks observing it.
pub struct TestReplica {
    pub replica: ReplicaState,
    pub storage: SharedStorage,
    pub observed: Observed,
}

/// Build a replica for `peer` over the three-voter config.
pub fn replica(peer: &str) -> TestReplica {
    replica_with_config(peer, three_voter_config())
}

/// Build a replica for `peer` over `config`.
pub fn replica_with_config(peer: &str, config: RaftConfig) -> TestReplica {
    let storage = SharedStorage::new();
    let observed = Observed::new();
    let cmeta =
        ConsensusMetadata::create(Box::new(storage.clone()), peer, config).expect("bootstrap");

    let applied = Arc::clone(&observed.applied);
    let elections = Arc::clone(&observed.elections);
    let context = ReplicaStateContext {
        applied_ops_tracker: Box::new(move |ids| {
            applied.lock().unwrap().push(ids.to_vec());
        }),
        election_trigger: Box::new(move |id| {
            elections.lock().unwrap().push(id);
        }),
    };

    let replica = ReplicaState::new(
        ConsensusOptions::for_group("tablet-0001"),
        cmeta,
        RetryableRequests::new(Duration::from_secs(660), Duration::from_secs(300)),
        None,
        context,
    );
    TestReplica {
        replica,
        storage,
        observed,
    }
}

/// Start a replica with the given last entry in the WAL.
pub fn start_replica(replica: &ReplicaState, last_in_wal: OpId) {
    let mut guard = replica.lock_for_start().expect("lock for start");
    guard.start(last_in_wal).expect("start");
}

/// Promote `peer` to leader of `term` on its own replica.
pub fn become_leader(replica: &ReplicaState, term: i64) {
    let mut guard = replica.lock_for_read();
    guard.set_current_term(term).expect("term advance");
    guard.set_candidate(true);
    let own_uuid = guard.peer_uuid().to_string();
    guard.set_leader_uuid(&own_uuid);
}

/// Make the replica a follower of `leader` in `term`.
pub fn become_follower(replica: &ReplicaState, term: i64, leader: &str) {
    let mut guard = replica.lock_for_read();
    if term > guard.current_term() {
        guard.set_current_term(term).expect("term advance");
    }
    guard.set_leader_uuid(leader);
}

/// A bound no-op round at the given id.
pub fn noop_round(term: i64, index: i64) -> ConsensusRoundRef {
    let round = ConsensusRound::new(OperationPayload::NoOp);
    round.bind_id(OpId::new(term, index));
    round
}

/// A bound write round at the given id.
pub fn write_round(term: i64, index: i64) -> ConsensusRoundRef {
    let round = ConsensusRound::new(OperationPayload::Write {
        body: Bytes::from_static(b"row"),
        request_id: None,
    });
    round.bind_id(OpId::new(term, index));
    round
}

/// A bound write round carrying a retryable-request id.
pub fn retryable_write_round(
    term: i64,
    index: i64,
    client: &str,
    request_id: i64,
) -> ConsensusRoundRef {
    let round = ConsensusRound::new(OperationPayload::Write {
        body: Bytes::from_static(b"row"),
        request_id: Some(RetryableRequestId {
            client_id: client.to_string(),
            request_id,
            min_running_request_id: 0,
        }),
    });
    round.bind_id(OpId::new(term, index));
    round
}

/// A bound round whose completion outcome is recorded into `outcomes` as
/// `Ok(id)` or `Err(id)`.
pub fn tracked_round(
    payload: OperationPayload,
    id: OpId,
    outcomes: Arc<Mutex<Vec<ConsensusResult<OpId>>>>,
) -> ConsensusRoundRef {
    let round = ConsensusRound::with_callback(
        payload,
        Box::new(move |result| {
            outcomes.lock().unwrap().push(result);
        }),
    );
    round.bind_id(id);
    round
}

/// Append `rounds` on the leader path.
pub fn leader_append(replica: &ReplicaState, rounds: &[ConsensusRoundRef]) {
    for round in rounds {
        let mut guard = replica
            .lock_for_replicate(round.payload())
            .expect("lock for replicate");
        guard.add_pending_operation(Arc::clone(round)).expect("append");
    }
}

/// Append `rounds` on the follower path.
pub fn follower_append(replica: &ReplicaState, rounds: &[ConsensusRoundRef]) {
    for round in rounds {
        let mut guard = replica.lock_for_update().expect("lock for update");
        guard.add_pending_operation(Arc::clone(round)).expect("append");
    }
}
