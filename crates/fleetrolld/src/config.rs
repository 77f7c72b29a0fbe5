//! fleetrolld.toml configuration parser.
//!
//! Every section is optional; a missing file means all defaults.
//!
//! ```toml
//! org_id = "00000000-0000-0000-0000-000000000000"
//!
//! [store]
//! path = "/var/lib/fleetroll/fleetroll.redb"
//!
//! [reconciler]
//! device_selection_interval_secs = 120
//! disruption_allowance_interval_secs = 120
//!
//! [log]
//! filter = "info,fleetroll=debug"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, bail};
use serde::{Deserialize, Serialize};

use fleetroll_rollout::{DISRUPTION_ALLOWANCE_INTERVAL, ROLLOUT_DEVICE_SELECTION_INTERVAL};
use fleetroll_state::NULL_ORG_ID;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Organization whose fleets are reconciled.
    pub org_id: String,
    pub store: StoreConfig,
    pub reconciler: ReconcilerConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerConfig {
    pub device_selection_interval_secs: u64,
    pub disruption_allowance_interval_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// Default `EnvFilter` directives; `RUST_LOG` takes precedence.
    pub filter: String,
    pub json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            org_id: NULL_ORG_ID.to_string(),
            store: StoreConfig::default(),
            reconciler: ReconcilerConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/fleetroll/fleetroll.redb"),
        }
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            device_selection_interval_secs: ROLLOUT_DEVICE_SELECTION_INTERVAL.as_secs(),
            disruption_allowance_interval_secs: DISRUPTION_ALLOWANCE_INTERVAL.as_secs(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info,fleetroll=debug".to_string(),
            json: false,
        }
    }
}

impl ReconcilerConfig {
    pub fn device_selection_interval(&self) -> Duration {
        Duration::from_secs(self.device_selection_interval_secs)
    }

    pub fn disruption_allowance_interval(&self) -> Duration {
        Duration::from_secs(self.disruption_allowance_interval_secs)
    }
}

impl DaemonConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config {}", path.display()))
    }

    /// Load `path` when given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: DaemonConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.reconciler.device_selection_interval_secs == 0 {
            bail!("reconciler.device_selection_interval_secs must be positive");
        }
        if self.reconciler.disruption_allowance_interval_secs == 0 {
            bail!("reconciler.disruption_allowance_interval_secs must be positive");
        }
        if self.org_id.is_empty() {
            bail!("org_id must not be empty");
        }
        Ok(())
    }
}
