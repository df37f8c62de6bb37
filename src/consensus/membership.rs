//! Raft group membership: peers, member kinds, and configurations.
//!
//! A configuration is an ordered set of peer records plus the op id of the
//! change that introduced it. The "active" configuration of a replica is the
//! pending one when a membership change is in flight, otherwise the
//! committed one.

use crate::consensus::opid::OpId;
use crate::core::error::{ConsensusError, ConsensusResult};
use serde::{Deserialize, Serialize};

/// Participation kind of a configuration member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberKind {
    /// Full voting member; counts toward majorities.
    Voter,
    /// Replicates but does not vote (catching up toward voter).
    NonVoter,
    /// Replicates for read scale-out; never promoted, never votes.
    Observer,
}

impl MemberKind {
    /// Whether this member counts toward a voter majority.
    pub const fn is_voter(self) -> bool {
        matches!(self, Self::Voter)
    }
}

/// Role a replica currently plays in its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    Follower,
    Candidate,
    Leader,
    /// Non-voting member (non-voter or observer kind).
    Learner,
    /// Not a member of the active configuration.
    NonParticipant,
}

impl std::fmt::Display for PeerRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Follower => write!(f, "follower"),
            Self::Candidate => write!(f, "candidate"),
            Self::Leader => write!(f, "leader"),
            Self::Learner => write!(f, "learner"),
            Self::NonParticipant => write!(f, "non_participant"),
        }
    }
}

/// One member of a Raft configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftPeer {
    /// Permanent uuid of the peer.
    pub uuid: String,
    /// Host:port the peer serves consensus traffic on.
    pub address: String,
    /// Participation kind.
    pub member_kind: MemberKind,
}

impl RaftPeer {
    /// A voting peer.
    pub fn voter(uuid: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            address: address.into(),
            member_kind: MemberKind::Voter,
        }
    }

    /// A non-voting peer.
    pub fn non_voter(uuid: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            address: address.into(),
            member_kind: MemberKind::NonVoter,
        }
    }

    /// An observer peer.
    pub fn observer(uuid: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            address: address.into(),
            member_kind: MemberKind::Observer,
        }
    }
}

/// An ordered set of peers forming one Raft configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RaftConfig {
    /// Members, in the order the change operation listed them.
    pub peers: Vec<RaftPeer>,
    /// Op id of the configuration-change operation that produced this
    /// configuration. [`OpId::MIN`] for a bootstrap configuration.
    pub config_op_id: OpId,
}

impl RaftConfig {
    /// A configuration from the given peers, with no change op recorded.
    pub fn new(peers: Vec<RaftPeer>) -> Self {
        Self {
            peers,
            config_op_id: OpId::MIN,
        }
    }

    /// Checks that the configuration is well-formed: at least one voter so
    /// a voter majority is defined, and no duplicate uuids.
    pub fn validate(&self) -> ConsensusResult<()> {
        if !self.peers.iter().any(|p| p.member_kind.is_voter()) {
            return Err(ConsensusError::invalid_argument(
                "configuration has no voters; majority undefined",
            ));
        }
        for (i, peer) in self.peers.iter().enumerate() {
            if peer.uuid.is_empty() {
                return Err(ConsensusError::invalid_argument(
                    "configuration member with empty uuid",
                ));
            }
            if self.peers[..i].iter().any(|p| p.uuid == peer.uuid) {
                return Err(ConsensusError::invalid_argument(format!(
                    "duplicate member {} in configuration",
                    peer.uuid
                )));
            }
        }
        Ok(())
    }

    /// Member record for `uuid`, if present.
    pub fn peer(&self, uuid: &str) -> Option<&RaftPeer> {
        self.peers.iter().find(|p| p.uuid == uuid)
    }

    /// Whether `uuid` is a member of any kind.
    pub fn contains(&self, uuid: &str) -> bool {
        self.peer(uuid).is_some()
    }

    /// Whether `uuid` is a voting member.
    pub fn is_voter(&self, uuid: &str) -> bool {
        self.peer(uuid)
            .map(|p| p.member_kind.is_voter())
            .unwrap_or(false)
    }

    /// Number of voting members.
    pub fn voter_count(&self) -> usize {
        self.peers.iter().filter(|p| p.member_kind.is_voter()).count()
    }

    /// Size of a voter majority.
    pub fn majority_size(&self) -> usize {
        self.voter_count() / 2 + 1
    }

    /// Role `uuid` plays under this configuration given the known leader.
    /// Candidacy is an overlay the coordinator tracks separately.
    pub fn role_of(&self, uuid: &str, leader_uuid: &str) -> PeerRole {
        match self.peer(uuid) {
            None => PeerRole::NonParticipant,
            Some(peer) if !peer.member_kind.is_voter() => PeerRole::Learner,
            Some(_) if uuid == leader_uuid => PeerRole::Leader,
            Some(_) => PeerRole::Follower,
        }
    }
}

impl std::fmt::Display for RaftConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[")?;
        for (i, peer) in self.peers.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}({:?})", peer.uuid, peer.member_kind)?;
        }
        write!(f, "] @{}", self.config_op_id)
    }
}
