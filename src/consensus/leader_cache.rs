//! Lock-free leadership snapshot for hot read paths.
//!
//! Query-path callers test leadership far more often than it changes. The
//! cache packs `(status, extra)` into one atomic word - status in the low
//! three bits, extra in the high bits - published together with a
//! monotonic validity horizon as one indivisible snapshot: a sequence
//! stamp brackets every refresh, and readers that observe a refresh in
//! flight (or a torn pairing of word and horizon) reject the snapshot and
//! fall back to a locked recomputation. A ready status can therefore never
//! be seen with a horizon it was not published with.
//!
//! Writers refresh under the coordinator lock whenever leadership or lease
//! state changes, so refreshes are serialized; readers never take the
//! lock on the fast path.
//!
//! The meaning of `extra` depends on the status: the leader term for
//! [`LeaderStatus::LeaderAndReady`], the remaining predecessor lease in
//! microseconds for [`LeaderStatus::LeaderButOldLeaderMayHaveLease`], zero
//! otherwise.

use crate::consensus::lease::LeaderStatus;
use crate::core::time::CoarseTimePoint;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const STATUS_BITS: u32 = 3;
const STATUS_MASK: u64 = (1 << STATUS_BITS) - 1;

/// How many times a reader retries an unstable snapshot before falling
/// back to the locked refresh path.
const READ_ATTEMPTS: usize = 3;

/// Packed `(status, extra, valid_until)` leadership snapshot.
pub struct LeaderStateCache {
    /// Sequence stamp; odd while a refresh is in flight.
    seq: AtomicU64,
    packed: AtomicU64,
    valid_until_micros: AtomicI64,
}

impl LeaderStateCache {
    /// A cache that is immediately stale, forcing the first reader through
    /// the locked refresh path.
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            packed: AtomicU64::new(LeaderStatus::NoLeader as u64),
            valid_until_micros: AtomicI64::new(CoarseTimePoint::MIN.micros()),
        }
    }

    /// Refresh the snapshot. Callers hold the coordinator lock, so
    /// refreshes are serialized; the sequence stamp makes the word and its
    /// horizon visible to readers as one unit.
    pub fn store(&self, status: LeaderStatus, extra: u64, valid_until: CoarseTimePoint) {
        debug_assert_eq!(
            extra << STATUS_BITS >> STATUS_BITS,
            extra,
            "cache extra value overflows the high bits"
        );
        let packed = status as u64 | (extra << STATUS_BITS);
        self.seq.fetch_add(1, Ordering::AcqRel);
        self.packed.store(packed, Ordering::Release);
        self.valid_until_micros
            .store(valid_until.micros(), Ordering::Release);
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// The snapshot, if still valid at `now`. `None` means the snapshot is
    /// stale or a refresh raced the read; the caller must recompute under
    /// the lock.
    pub fn load(&self, now: CoarseTimePoint) -> Option<(LeaderStatus, u64)> {
        for _ in 0..READ_ATTEMPTS {
            let stamp = self.seq.load(Ordering::Acquire);
            if stamp & 1 == 1 {
                // Refresh in flight.
                continue;
            }
            let packed = self.packed.load(Ordering::Acquire);
            let valid_until = self.valid_until_micros.load(Ordering::Acquire);
            if self.seq.load(Ordering::Acquire) != stamp {
                // Torn read; the word and horizon may not pair up.
                continue;
            }
            if now.micros() >= valid_until {
                return None;
            }
            return Some(Self::decode(packed));
        }
        None
    }

    /// The packed word regardless of the validity horizon, for callers
    /// that tolerate staleness. The word itself is one atomic, so status
    /// and extra always pair up.
    pub fn load_ignoring_validity(&self) -> (LeaderStatus, u64) {
        Self::decode(self.packed.load(Ordering::Acquire))
    }

    fn decode(packed: u64) -> (LeaderStatus, u64) {
        let status =
            LeaderStatus::from_bits((packed & STATUS_MASK) as u8).unwrap_or(LeaderStatus::NoLeader);
        (status, packed >> STATUS_BITS)
    }
}

impl Default for LeaderStateCache {
    fn default() -> Self {
        Self::new()
    }
}
