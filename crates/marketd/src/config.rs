//! Daemon configuration.
//!
//! A single TOML file with the engine settings under `[market]` and the
//! ledger connection under `[ledger]`:
//!
//! ```toml
//! state_dir = "/var/lib/marketd"
//! snapshot_interval_secs = 30
//! log_format = "json"
//!
//! [market]
//! escrow_address = "EEEE..."
//! required_confirmations = 3
//!
//! [ledger]
//! backend = "rpc"
//! rpc_url = "http://127.0.0.1:8545"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use job_market::MarketConfig;
use ledger_gateway::{InMemoryLedger, LedgerGateway, RpcLedger};
use serde::{Deserialize, Serialize};

/// Which ledger implementation to talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// In-process simulated ledger, for development.
    #[default]
    Memory,
    /// JSON-RPC ledger node.
    Rpc,
}

/// Ledger connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Backend to use.
    pub backend: LedgerBackend,
    /// JSON-RPC endpoint, required for the `rpc` backend.
    pub rpc_url: Option<String>,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::Memory,
            rpc_url: None,
            request_timeout_secs: ledger_gateway::rpc::DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the state snapshot.
    pub state_dir: PathBuf,
    /// Seconds between snapshots.
    pub snapshot_interval_secs: u64,
    /// Log output format.
    pub log_format: LogFormat,
    /// Engine settings.
    pub market: MarketConfig,
    /// Ledger connection.
    pub ledger: LedgerConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/marketd"),
            snapshot_interval_secs: 30,
            log_format: LogFormat::Pretty,
            market: MarketConfig::default(),
            ledger: LedgerConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as TOML.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).context("failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("failed to write config file {}", path.display()))?;
        Ok(())
    }

    /// Check every setting.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.market.validate()?;
        if self.snapshot_interval_secs == 0 {
            bail!("snapshot_interval_secs must be greater than 0");
        }
        if self.ledger.request_timeout_secs == 0 {
            bail!("ledger.request_timeout_secs must be greater than 0");
        }
        if self.ledger.backend == LedgerBackend::Rpc {
            match self.ledger.rpc_url.as_deref() {
                Some(url) if url.starts_with("http://") || url.starts_with("https://") => {}
                Some(url) => bail!("ledger.rpc_url must be an http(s) URL, got {url}"),
                None => bail!("ledger.rpc_url is required for the rpc backend"),
            }
        }
        Ok(())
    }

    /// Seconds between snapshots as a duration.
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }

    /// Build the configured ledger gateway.
    pub fn gateway(&self) -> anyhow::Result<Arc<dyn LedgerGateway>> {
        match self.ledger.backend {
            LedgerBackend::Memory => Ok(Arc::new(InMemoryLedger::new())),
            LedgerBackend::Rpc => {
                let Some(url) = self.ledger.rpc_url.as_deref() else {
                    bail!("ledger.rpc_url is required for the rpc backend");
                };
                let ledger = RpcLedger::new(
                    url,
                    Duration::from_secs(self.ledger.request_timeout_secs),
                )?;
                Ok(Arc::new(ledger))
            }
        }
    }
}
