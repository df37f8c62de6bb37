//! Retryable-request deduplication.
//!
//! Clients may attach a `(client_id, request_id)` pair to writes. The filter
//! keeps a bounded-time window of recently observed ids per client and
//! rejects duplicate appends, handing back the op id under which the
//! original request was sequenced. Entries age out on the restart-safe
//! monotonic clock, so stored deadlines remain meaningful across a process
//! restart.

use crate::consensus::operation::ConsensusRoundRef;
use crate::consensus::opid::OpId;
use crate::core::error::{ConsensusError, ConsensusResult};
use crate::core::time::{RestartSafeClock, RestartSafeTimePoint};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hasher;
use std::time::Duration;

/// Tracked-request counts, for test introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryableRequestsCounts {
    /// Requests appended but not yet replicated.
    pub running: usize,
    /// Replicated requests still inside the retention window.
    pub replicated: usize,
}

#[derive(Debug)]
struct RunningRequest {
    op_id: OpId,
    deadline: RestartSafeTimePoint,
}

#[derive(Debug)]
struct ReplicatedRequest {
    op_id: OpId,
    response_digest: u64,
    expires_at: RestartSafeTimePoint,
}

#[derive(Default)]
struct ClientRequests {
    running: BTreeMap<i64, RunningRequest>,
    replicated: BTreeMap<i64, ReplicatedRequest>,
}

impl ClientRequests {
    fn is_empty(&self) -> bool {
        self.running.is_empty() && self.replicated.is_empty()
    }

    /// Drop everything the client has declared no longer in flight.
    fn gc_below(&mut self, min_running_request_id: i64) {
        self.running = self.running.split_off(&min_running_request_id);
        self.replicated = self.replicated.split_off(&min_running_request_id);
    }
}

/// Duplicate-write suppression over a bounded time window.
pub struct RetryableRequests {
    clients: HashMap<String, ClientRequests>,
    clock: RestartSafeClock,
    request_timeout: Duration,
    replicated_retention: Duration,
}

impl RetryableRequests {
    /// A filter with the given windows and a fresh clock.
    pub fn new(request_timeout: Duration, replicated_retention: Duration) -> Self {
        Self::with_clock(request_timeout, replicated_retention, RestartSafeClock::new())
    }

    /// A filter whose clock was re-anchored from a previous incarnation.
    pub fn with_clock(
        request_timeout: Duration,
        replicated_retention: Duration,
        clock: RestartSafeClock,
    ) -> Self {
        Self {
            clients: HashMap::new(),
            clock,
            request_timeout,
            replicated_retention,
        }
    }

    /// The filter's restart-safe clock.
    pub fn clock(&self) -> &RestartSafeClock {
        &self.clock
    }

    /// Track `round` if it carries a retryable-request id.
    ///
    /// Returns `Ok(true)` if the request is now tracked, `Ok(false)` if the
    /// round carries no request id, and [`ConsensusError::DuplicateRequest`]
    /// if the id was already observed inside the window. The round's op id
    /// must already be bound.
    pub fn register(&mut self, round: &ConsensusRoundRef) -> ConsensusResult<bool> {
        let Some(request) = round.payload().retryable_request_id() else {
            return Ok(false);
        };
        let op_id = round
            .id()
            .ok_or_else(|| ConsensusError::invalid_argument("round has no bound op id"))?;

        let client = self.clients.entry(request.client_id.clone()).or_default();
        client.gc_below(request.min_running_request_id);

        let original = client
            .running
            .get(&request.request_id)
            .map(|r| r.op_id)
            .or_else(|| client.replicated.get(&request.request_id).map(|r| r.op_id));
        if let Some(original_op_id) = original {
            return Err(ConsensusError::DuplicateRequest {
                client_id: request.client_id.clone(),
                request_id: request.request_id,
                original_op_id,
            });
        }

        let deadline = self.clock.now().add(self.request_timeout);
        client
            .running
            .insert(request.request_id, RunningRequest { op_id, deadline });
        Ok(true)
    }

    /// Move a request to the replicated window when its round commits.
    pub fn mark_replicated(&mut self, round: &ConsensusRoundRef) {
        let Some(request) = round.payload().retryable_request_id() else {
            return;
        };
        let Some(client) = self.clients.get_mut(&request.client_id) else {
            return;
        };
        if let Some(running) = client.running.remove(&request.request_id) {
            let response_digest = round
                .payload()
                .write_body()
                .map(|body| digest(body))
                .unwrap_or(0);
            client.replicated.insert(
                request.request_id,
                ReplicatedRequest {
                    op_id: running.op_id,
                    response_digest,
                    expires_at: self.clock.now().add(self.replicated_retention),
                },
            );
        }
    }

    /// Forget a request whose round was aborted, so the client may retry.
    pub fn mark_aborted(&mut self, round: &ConsensusRoundRef) {
        let Some(request) = round.payload().retryable_request_id() else {
            return;
        };
        if let Some(client) = self.clients.get_mut(&request.client_id) {
            client.running.remove(&request.request_id);
            if client.is_empty() {
                self.clients.remove(&request.client_id);
            }
        }
    }

    /// Drop entries whose window has passed as of `now`.
    pub fn cleanup(&mut self, now: RestartSafeTimePoint) {
        for client in self.clients.values_mut() {
            client.running.retain(|_, r| !now.reached(r.deadline));
            client.replicated.retain(|_, r| !now.reached(r.expires_at));
        }
        self.clients.retain(|_, c| !c.is_empty());
    }

    /// The minimum op id still referenced by a tracked request, used as a
    /// log-GC floor. Replicated entries count too: their log segments are
    /// what rebuilds the dedup window after a restart, so they must outlive
    /// the retention period. [`OpId::MAX`] when nothing is tracked.
    pub fn min_op_id(&self) -> OpId {
        self.clients
            .values()
            .flat_map(|c| {
                c.running
                    .values()
                    .map(|r| r.op_id)
                    .chain(c.replicated.values().map(|r| r.op_id))
            })
            .min()
            .unwrap_or(OpId::MAX)
    }

    /// The response digest recorded for a replicated request, if retained.
    pub fn replicated_digest(&self, client_id: &str, request_id: i64) -> Option<u64> {
        self.clients
            .get(client_id)
            .and_then(|c| c.replicated.get(&request_id))
            .map(|r| r.response_digest)
    }

    /// Current tracked-request counts.
    pub fn counts(&self) -> RetryableRequestsCounts {
        RetryableRequestsCounts {
            running: self.clients.values().map(|c| c.running.len()).sum(),
            replicated: self.clients.values().map(|c| c.replicated.len()).sum(),
        }
    }
}

/// XXH64 digest of a response body.
fn digest(body: &[u8]) -> u64 {
    let mut hasher = twox_hash::XxHash64::with_seed(0);
    hasher.write(body);
    hasher.finish()
}
