//! Engine configuration

use gridstore_core::TenantId;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// How commits reach the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum PersistenceMode {
    /// Grid only; nothing durable.
    None,
    /// Write-through: commits save to the disk store synchronously. Meant
    /// for development and small deployments.
    Load,
    /// Write-behind: commits append persistence-log entries; the persister
    /// drains them in the background.
    WriteBehind,
}

/// Database tuning and policy.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Persistence policy.
    pub persistence: PersistenceMode,
    /// Oldest the watermark may get, with log entries pending, before the
    /// node declares itself stalled.
    #[serde(default = "default_max_persistence_delay", with = "duration_secs")]
    pub max_persistence_delay: Duration,
    /// Where emergency backups land.
    pub backup_directory: PathBuf,
    /// Wait for cluster locks (cold start).
    #[serde(default = "default_lock_timeout", with = "duration_secs")]
    pub lock_timeout: Duration,
    /// Tenants to initialize units for.
    #[serde(default = "default_tenants")]
    pub tenants: Vec<TenantId>,
}

fn default_max_persistence_delay() -> Duration {
    Duration::from_secs(24 * 3600)
}

fn default_lock_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_tenants() -> Vec<TenantId> {
    vec![0]
}

mod duration_secs {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            persistence: PersistenceMode::WriteBehind,
            max_persistence_delay: default_max_persistence_delay(),
            backup_directory: PathBuf::from("gridstore_backup"),
            lock_timeout: default_lock_timeout(),
            tenants: default_tenants(),
        }
    }
}

impl DatabaseConfig {
    /// Set the persistence policy.
    pub fn with_persistence(mut self, mode: PersistenceMode) -> Self {
        self.persistence = mode;
        self
    }

    /// Set the stall threshold.
    pub fn with_max_persistence_delay(mut self, delay: Duration) -> Self {
        self.max_persistence_delay = delay;
        self
    }

    /// Set the emergency backup directory.
    pub fn with_backup_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.backup_directory = dir.into();
        self
    }

    /// Set the cluster lock wait.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Set the tenant list.
    pub fn with_tenants(mut self, tenants: Vec<TenantId>) -> Self {
        self.tenants = tenants;
        self
    }

    /// Write-behind with a short lock wait, single tenant.
    pub fn for_testing() -> Self {
        DatabaseConfig::default().with_lock_timeout(Duration::from_secs(1))
    }
}
