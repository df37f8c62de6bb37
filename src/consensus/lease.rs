//! Leader lease records and leadership status evaluation.
//!
//! Two independent leases protect reads and writes across leadership
//! changes:
//! - [`CoarseTimeLease`]: a coarse monotonic-time interval during which a
//!   leader is guaranteed unique, used to serve linearizable reads and to
//!   delay a new leader before it accepts writes.
//! - [`PhysicalComponentLease`]: a physical-microsecond bound on the hybrid
//!   time a leader may assign, so a successor always assigns strictly
//!   greater hybrid times.
//!
//! Each lease exists in two forms: the "old leader may still hold" form a
//! follower or candidate accumulates from leader messages, and the
//! "majority replicated" form the current leader advances as peers
//! acknowledge extensions.

use crate::consensus::opid::OpId;
use crate::core::time::{CoarseTimePoint, MicrosTime};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A coarse monotonic-time lease held by `holder_uuid` until `expiration`.
///
/// `expiration == CoarseTimePoint::MIN` means "no lease tracked".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoarseTimeLease {
    /// Peer the lease was issued to.
    pub holder_uuid: String,
    /// Monotonic expiration point.
    pub expiration: CoarseTimePoint,
}

impl CoarseTimeLease {
    /// The empty lease.
    pub fn none() -> Self {
        Self {
            holder_uuid: String::new(),
            expiration: CoarseTimePoint::MIN,
        }
    }

    /// Whether no lease is tracked.
    pub fn is_none(&self) -> bool {
        self.expiration == CoarseTimePoint::MIN
    }

    /// One-way reset back to "no lease".
    pub fn reset(&mut self) {
        *self = Self::none();
    }

    /// Advance to `expiration` for `holder` if it extends the record.
    /// The expiration never decreases.
    pub fn extend_to(&mut self, holder: &str, expiration: CoarseTimePoint) {
        if expiration > self.expiration {
            self.holder_uuid = holder.to_string();
            self.expiration = expiration;
        }
    }

    /// Whether the lease has expired at `now` (an empty lease has).
    pub fn expired_at(&self, now: CoarseTimePoint) -> bool {
        now >= self.expiration
    }

    /// Time left at `now`; zero if expired or untracked.
    pub fn remaining_at(&self, now: CoarseTimePoint) -> Duration {
        if self.is_none() {
            return Duration::ZERO;
        }
        now.until(self.expiration)
    }
}

/// A hybrid-time lease: a physical-microsecond bound held by `holder_uuid`.
///
/// `expiration == PhysicalComponentLease::NONE` means "no lease tracked".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalComponentLease {
    /// Peer the lease was issued to.
    pub holder_uuid: String,
    /// Physical microsecond bound.
    pub expiration: MicrosTime,
}

impl PhysicalComponentLease {
    /// The "no lease" expiration value.
    pub const NONE: MicrosTime = 0;

    /// The empty lease.
    pub fn none() -> Self {
        Self {
            holder_uuid: String::new(),
            expiration: Self::NONE,
        }
    }

    /// Whether no lease is tracked.
    pub fn is_none(&self) -> bool {
        self.expiration == Self::NONE
    }

    /// One-way reset back to "no lease".
    pub fn reset(&mut self) {
        *self = Self::none();
    }

    /// Advance to `expiration` for `holder` if it extends the record.
    pub fn extend_to(&mut self, holder: &str, expiration: MicrosTime) {
        if expiration > self.expiration {
            self.holder_uuid = holder.to_string();
            self.expiration = expiration;
        }
    }

    /// Whether the bound has passed at physical time `micros`.
    pub fn expired_at(&self, micros: MicrosTime) -> bool {
        micros >= self.expiration
    }
}

/// Leadership readiness as seen by one evaluation.
///
/// The discriminants feed the packed leader-state cache and must fit in
/// three bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LeaderStatus {
    /// This replica is not the leader and knows of no leader.
    NoLeader = 0,
    /// Another peer is believed to lead the current term.
    NotLeader = 1,
    /// This replica leads, but cannot yet prove lease uniqueness: its own
    /// majority-replicated lease is missing or lapsed, or the predecessor's
    /// hybrid-time bound is still outstanding.
    LeaderButOldLeaderLeaseNotYetExpired = 2,
    /// This replica leads, but a tracked predecessor lease is still
    /// outstanding; the remaining duration is known.
    LeaderButOldLeaderMayHaveLease = 3,
    /// This replica leads and both lease conditions hold.
    LeaderAndReady = 4,
}

impl LeaderStatus {
    /// Decode from the low bits of a packed cache word.
    pub fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::NoLeader,
            1 => Self::NotLeader,
            2 => Self::LeaderButOldLeaderLeaseNotYetExpired,
            3 => Self::LeaderButOldLeaderMayHaveLease,
            4 => Self::LeaderAndReady,
            _ => return None,
        })
    }

    /// Whether the replica believes itself leader in this status.
    pub fn is_leader(self) -> bool {
        !matches!(self, Self::NoLeader | Self::NotLeader)
    }

    /// Whether up-to-date reads and writes are safe.
    pub fn ready(self) -> bool {
        matches!(self, Self::LeaderAndReady)
    }
}

impl std::fmt::Display for LeaderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::NoLeader => "no_leader",
            Self::NotLeader => "not_leader",
            Self::LeaderButOldLeaderLeaseNotYetExpired => "leader_lease_not_yet_acquired",
            Self::LeaderButOldLeaderMayHaveLease => "leader_old_leader_may_have_lease",
            Self::LeaderAndReady => "leader_and_ready",
        };
        write!(f, "{name}")
    }
}

/// The full result of a leadership evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderState {
    /// Readiness classification.
    pub status: LeaderStatus,
    /// Leader term when `status.is_leader()`, zero otherwise.
    pub term: i64,
    /// Remaining predecessor lease when the status is
    /// [`LeaderStatus::LeaderButOldLeaderMayHaveLease`], zero otherwise.
    pub remaining_old_leader_lease: Duration,
}

impl LeaderState {
    /// A non-leader state.
    pub fn not_leader(known_leader: bool) -> Self {
        Self {
            status: if known_leader {
                LeaderStatus::NotLeader
            } else {
                LeaderStatus::NoLeader
            },
            term: 0,
            remaining_old_leader_lease: Duration::ZERO,
        }
    }
}

/// Watermark data a leader learns when a heartbeat majority-replicates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MajorityReplicatedData {
    /// Highest op id acknowledged by a majority.
    pub op_id: OpId,
    /// New expiration of the leader's own coarse lease.
    pub leader_lease_expiration: CoarseTimePoint,
    /// New expiration of the leader's own hybrid-time lease.
    pub ht_lease_expiration: MicrosTime,
}

/// Independent one-way resets applied together with a majority-replicated
/// lease update, typically on the first update of a new term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LeaseResetFlags {
    /// Clear the predecessor's coarse lease record.
    pub reset_old_leader_lease: bool,
    /// Clear the predecessor's hybrid-time lease record.
    pub reset_old_leader_ht_lease: bool,
}

impl LeaseResetFlags {
    /// Reset neither record.
    pub const NONE: LeaseResetFlags = LeaseResetFlags {
        reset_old_leader_lease: false,
        reset_old_leader_ht_lease: false,
    };

    /// Reset both records.
    pub const BOTH: LeaseResetFlags = LeaseResetFlags {
        reset_old_leader_lease: true,
        reset_old_leader_ht_lease: true,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coarse_lease_only_advances() {
        let mut lease = CoarseTimeLease::none();
        lease.extend_to("x", CoarseTimePoint::from_micros(500_000));
        lease.extend_to("y", CoarseTimePoint::from_micros(400_000));
        assert_eq!(lease.holder_uuid, "x");
        assert_eq!(lease.expiration, CoarseTimePoint::from_micros(500_000));

        lease.extend_to("y", CoarseTimePoint::from_micros(600_000));
        assert_eq!(lease.holder_uuid, "y");
    }

    #[test]
    fn coarse_lease_remaining() {
        let mut lease = CoarseTimeLease::none();
        assert_eq!(lease.remaining_at(CoarseTimePoint::from_micros(0)), Duration::ZERO);

        lease.extend_to("x", CoarseTimePoint::from_micros(500_000));
        assert_eq!(
            lease.remaining_at(CoarseTimePoint::from_micros(100_000)),
            Duration::from_micros(400_000)
        );
        assert!(lease.expired_at(CoarseTimePoint::from_micros(500_000)));
    }

    #[test]
    fn ht_lease_none_is_expired() {
        let lease = PhysicalComponentLease::none();
        assert!(lease.expired_at(0));
        assert!(lease.expired_at(1));
    }

    #[test]
    fn status_bits_roundtrip() {
        for status in [
            LeaderStatus::NoLeader,
            LeaderStatus::NotLeader,
            LeaderStatus::LeaderButOldLeaderLeaseNotYetExpired,
            LeaderStatus::LeaderButOldLeaderMayHaveLease,
            LeaderStatus::LeaderAndReady,
        ] {
            assert_eq!(LeaderStatus::from_bits(status as u8), Some(status));
        }
        assert_eq!(LeaderStatus::from_bits(7), None);
    }
}
