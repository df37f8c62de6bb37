//! Durable consensus metadata.
//!
//! The metadata record holds the fields Raft requires to survive a crash:
//! the current term, the vote cast in that term, the committed
//! configuration, and the last committed op id. A successful
//! [`ConsensusMetadata::flush`] guarantees the record survives a crash; the
//! coordinator treats any flush failure as fatal to the transition that
//! triggered it.
//!
//! The pending configuration and the leader uuid are memory-only: a replica
//! that restarts re-learns them from the log and from the next leader
//! heartbeat.

use crate::consensus::membership::{PeerRole, RaftConfig};
use crate::consensus::opid::OpId;
use crate::core::error::{ConsensusError, ConsensusResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The crash-durable portion of a replica's consensus state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableConsensusState {
    /// Latest term this replica has seen.
    pub current_term: i64,
    /// Vote cast in `current_term`, if any.
    pub voted_for: Option<String>,
    /// Last committed configuration.
    pub committed_config: RaftConfig,
    /// Last committed op id at the time of the flush.
    pub last_committed_op_id: OpId,
}

impl DurableConsensusState {
    /// Initial state for a fresh replica with the given bootstrap config.
    pub fn bootstrap(committed_config: RaftConfig) -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            committed_config,
            last_committed_op_id: OpId::MIN,
        }
    }
}

/// Backing store for the durable record.
pub trait MetadataStorage: Send {
    /// Persist `state` so it survives a crash. Returning `Ok` is the
    /// durability point.
    fn persist(&mut self, state: &DurableConsensusState) -> Result<()>;

    /// Size of the record on disk, in bytes.
    fn on_disk_size(&self) -> u64;
}

/// File-backed metadata storage: one bincode record, replaced atomically by
/// writing a temporary file and renaming it over the target.
pub struct FileMetadataStorage {
    path: PathBuf,
    on_disk_size: u64,
}

impl FileMetadataStorage {
    /// Open storage at `path`, recovering the persisted record if present.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Option<DurableConsensusState>)> {
        let path = path.as_ref().to_path_buf();
        let recovered = match std::fs::read(&path) {
            Ok(raw) => {
                let state = bincode::deserialize(&raw).with_context(|| {
                    format!("corrupt consensus metadata at {}", path.display())
                })?;
                Some(state)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read {}", path.display()))
            }
        };
        let on_disk_size = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok((Self { path, on_disk_size }, recovered))
    }
}

impl MetadataStorage for FileMetadataStorage {
    fn persist(&mut self, state: &DurableConsensusState) -> Result<()> {
        let raw = bincode::serialize(state).context("failed to encode consensus metadata")?;
        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &raw)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        self.on_disk_size = raw.len() as u64;
        Ok(())
    }

    fn on_disk_size(&self) -> u64 {
        self.on_disk_size
    }
}

/// In-memory metadata storage for tests, with flush fail-injection so
/// rollback paths are exercisable.
#[derive(Default)]
pub struct InMemoryMetadataStorage {
    persisted: Option<DurableConsensusState>,
    size: u64,
    fail_next_persist: bool,
}

impl InMemoryMetadataStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage seeded with a previously "persisted" record.
    pub fn with_state(state: DurableConsensusState) -> Self {
        Self {
            persisted: Some(state),
            size: 0,
            fail_next_persist: false,
        }
    }

    /// Make the next `persist` call fail.
    pub fn fail_next_persist(&mut self) {
        self.fail_next_persist = true;
    }

    /// The last successfully persisted record.
    pub fn persisted(&self) -> Option<&DurableConsensusState> {
        self.persisted.as_ref()
    }
}

impl MetadataStorage for InMemoryMetadataStorage {
    fn persist(&mut self, state: &DurableConsensusState) -> Result<()> {
        if self.fail_next_persist {
            self.fail_next_persist = false;
            anyhow::bail!("injected metadata persist failure");
        }
        self.size = bincode::serialized_size(state).unwrap_or(0);
        self.persisted = Some(state.clone());
        Ok(())
    }

    fn on_disk_size(&self) -> u64 {
        self.size
    }
}

/// In-memory view of the consensus metadata plus its backing store.
///
/// Setters mutate memory only; [`ConsensusMetadata::flush`] makes the
/// durable fields crash-safe. Callers sequence "mutate, flush, roll back on
/// failure" themselves so multi-field transitions stay atomic.
pub struct ConsensusMetadata {
    peer_uuid: String,
    storage: Box<dyn MetadataStorage>,

    current_term: i64,
    voted_for: Option<String>,
    committed_config: RaftConfig,
    last_committed_op_id: OpId,

    // Memory-only.
    pending_config: Option<RaftConfig>,
    leader_uuid: String,
    candidate: bool,
}

impl ConsensusMetadata {
    /// Metadata for a fresh replica; persists the bootstrap record.
    pub fn create(
        mut storage: Box<dyn MetadataStorage>,
        peer_uuid: impl Into<String>,
        committed_config: RaftConfig,
    ) -> ConsensusResult<Self> {
        committed_config.validate()?;
        let state = DurableConsensusState::bootstrap(committed_config);
        storage
            .persist(&state)
            .map_err(|err| ConsensusError::fatal("failed to persist bootstrap metadata", err))?;
        Ok(Self::from_state(storage, peer_uuid.into(), state))
    }

    /// Metadata recovered from a persisted record.
    pub fn load(
        storage: Box<dyn MetadataStorage>,
        peer_uuid: impl Into<String>,
        state: DurableConsensusState,
    ) -> Self {
        Self::from_state(storage, peer_uuid.into(), state)
    }

    fn from_state(
        storage: Box<dyn MetadataStorage>,
        peer_uuid: String,
        state: DurableConsensusState,
    ) -> Self {
        Self {
            peer_uuid,
            storage,
            current_term: state.current_term,
            voted_for: state.voted_for,
            committed_config: state.committed_config,
            last_committed_op_id: state.last_committed_op_id,
            pending_config: None,
            leader_uuid: String::new(),
            candidate: false,
        }
    }

    /// Uuid of the local peer.
    pub fn peer_uuid(&self) -> &str {
        &self.peer_uuid
    }

    /// Latest term this replica has seen.
    pub fn current_term(&self) -> i64 {
        self.current_term
    }

    /// Set the current term (memory only; flush to persist).
    pub fn set_current_term(&mut self, term: i64) {
        self.current_term = term;
    }

    /// Whether a vote was cast in the current term.
    pub fn has_voted_current_term(&self) -> bool {
        self.voted_for.is_some()
    }

    /// The vote cast in the current term, if any.
    pub fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    /// Record a vote (memory only; flush to persist).
    pub fn set_voted_for(&mut self, uuid: Option<String>) {
        self.voted_for = uuid;
    }

    /// The committed configuration.
    pub fn committed_config(&self) -> &RaftConfig {
        &self.committed_config
    }

    /// Replace the committed configuration and clear the pending one
    /// (memory only; flush to persist).
    pub fn set_committed_config(&mut self, config: RaftConfig) {
        self.committed_config = config;
        self.pending_config = None;
    }

    /// The pending configuration, if a change is in flight.
    pub fn pending_config(&self) -> Option<&RaftConfig> {
        self.pending_config.as_ref()
    }

    /// Whether a configuration change is in flight.
    pub fn has_pending_config(&self) -> bool {
        self.pending_config.is_some()
    }

    /// Set the pending configuration.
    pub fn set_pending_config(&mut self, config: RaftConfig) {
        self.pending_config = Some(config);
    }

    /// Drop the pending configuration.
    pub fn clear_pending_config(&mut self) {
        self.pending_config = None;
    }

    /// The active configuration: pending if present, else committed.
    pub fn active_config(&self) -> &RaftConfig {
        self.pending_config.as_ref().unwrap_or(&self.committed_config)
    }

    /// Last committed op id recorded for recovery.
    pub fn last_committed_op_id(&self) -> OpId {
        self.last_committed_op_id
    }

    /// Update the recovery commit point (memory only; flush to persist).
    pub fn set_last_committed_op_id(&mut self, op_id: OpId) {
        self.last_committed_op_id = op_id;
    }

    /// Uuid of the current term's leader; empty when unknown.
    pub fn leader_uuid(&self) -> &str {
        &self.leader_uuid
    }

    /// Whether a leader is known for the current term.
    pub fn has_leader(&self) -> bool {
        !self.leader_uuid.is_empty()
    }

    /// Record the current term's leader. Clears candidacy.
    pub fn set_leader_uuid(&mut self, uuid: impl Into<String>) {
        self.leader_uuid = uuid.into();
        self.candidate = false;
    }

    /// Forget the current leader.
    pub fn clear_leader(&mut self) {
        self.leader_uuid.clear();
    }

    /// Mark or clear candidacy for the current term.
    pub fn set_candidate(&mut self, candidate: bool) {
        self.candidate = candidate;
    }

    /// Whether an election is in flight for the current term.
    pub fn is_candidate(&self) -> bool {
        self.candidate
    }

    /// The role the local peer currently plays.
    ///
    /// Derived from the active configuration and the known leader, with
    /// candidacy overlaid while an election is in flight.
    pub fn active_role(&self) -> PeerRole {
        let role = self
            .active_config()
            .role_of(&self.peer_uuid, &self.leader_uuid);
        if self.candidate && role == PeerRole::Follower {
            PeerRole::Candidate
        } else {
            role
        }
    }

    /// A snapshot of the durable fields.
    pub fn durable_state(&self) -> DurableConsensusState {
        DurableConsensusState {
            current_term: self.current_term,
            voted_for: self.voted_for.clone(),
            committed_config: self.committed_config.clone(),
            last_committed_op_id: self.last_committed_op_id,
        }
    }

    /// Persist the durable fields. On success the record survives crash.
    pub fn flush(&mut self) -> Result<()> {
        let state = self.durable_state();
        self.storage.persist(&state)
    }

    /// Size of the persisted record on disk.
    pub fn on_disk_size(&self) -> u64 {
        self.storage.on_disk_size()
    }
}
