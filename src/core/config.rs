//! Configuration for the consensus coordination core.
//!
//! Options are loaded from a TOML section with per-field defaults, then
//! validated before a replica is built. Timing knobs are expressed in the
//! unit their consumers use.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Options for one consensus group replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusOptions {
    /// Identifier of the Raft group (tablet) this replica belongs to.
    pub group_id: String,

    /// Duration of the coarse leader lease granted by followers.
    #[serde(default = "default_leader_lease_duration_ms")]
    pub leader_lease_duration_ms: u64,

    /// Duration of the hybrid-time leader lease granted by followers.
    #[serde(default = "default_ht_lease_duration_ms")]
    pub ht_lease_duration_ms: u64,

    /// How long a not-yet-replicated retryable request stays tracked before
    /// it is considered lost.
    #[serde(default = "default_retryable_request_timeout_secs")]
    pub retryable_request_timeout_secs: u64,

    /// How long replicated retryable requests are retained for duplicate
    /// detection after completion.
    #[serde(default = "default_retryable_request_retention_secs")]
    pub retryable_request_retention_secs: u64,
}

fn default_leader_lease_duration_ms() -> u64 {
    2_000
}

fn default_ht_lease_duration_ms() -> u64 {
    2_000
}

fn default_retryable_request_timeout_secs() -> u64 {
    660
}

fn default_retryable_request_retention_secs() -> u64 {
    300
}

impl ConsensusOptions {
    /// Options with defaults for the given group.
    pub fn for_group(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            leader_lease_duration_ms: default_leader_lease_duration_ms(),
            ht_lease_duration_ms: default_ht_lease_duration_ms(),
            retryable_request_timeout_secs: default_retryable_request_timeout_secs(),
            retryable_request_retention_secs: default_retryable_request_retention_secs(),
        }
    }

    /// Load options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let options: Self = toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        options.validate()?;
        Ok(options)
    }

    /// Validate the options.
    pub fn validate(&self) -> Result<()> {
        if self.group_id.is_empty() {
            bail!("group_id must not be empty");
        }
        if self.leader_lease_duration_ms == 0 {
            bail!("leader_lease_duration_ms must be > 0");
        }
        if self.ht_lease_duration_ms == 0 {
            bail!("ht_lease_duration_ms must be > 0");
        }
        if self.retryable_request_timeout_secs == 0 {
            bail!("retryable_request_timeout_secs must be > 0");
        }
        if self.retryable_request_retention_secs == 0 {
            bail!("retryable_request_retention_secs must be > 0");
        }
        Ok(())
    }

    /// Coarse leader lease duration.
    pub fn leader_lease_duration(&self) -> Duration {
        Duration::from_millis(self.leader_lease_duration_ms)
    }

    /// Hybrid-time leader lease duration.
    pub fn ht_lease_duration(&self) -> Duration {
        Duration::from_millis(self.ht_lease_duration_ms)
    }

    /// Tracking window for not-yet-replicated retryable requests.
    pub fn retryable_request_timeout(&self) -> Duration {
        Duration::from_secs(self.retryable_request_timeout_secs)
    }

    /// Retention window for replicated retryable requests.
    pub fn retryable_request_retention(&self) -> Duration {
        Duration::from_secs(self.retryable_request_retention_secs)
    }
}
