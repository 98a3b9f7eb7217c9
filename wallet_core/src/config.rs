//! Wallet configuration with TOML file support.

use serde::{Deserialize, Serialize};
use umbra_types::{NetworkId, NetworkParams};
use umbra_utils::{try_init_logging, LogFormat};

use crate::WalletError;

/// Configuration for a wallet.
///
/// Can be loaded from a TOML file via [`WalletConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WalletConfig {
    /// Which network the wallet belongs to.
    #[serde(default = "default_network")]
    pub network: NetworkId,

    /// Daemon JSON-RPC base URL.
    #[serde(default = "default_daemon_address")]
    pub daemon_address: String,

    /// Per-request timeout for daemon calls.
    #[serde(default = "default_daemon_timeout_secs")]
    pub daemon_timeout_secs: u64,

    /// Argon2id iterations for the key file and cache.
    #[serde(default = "default_kdf_rounds")]
    pub kdf_rounds: u32,

    /// Priority used when a transfer asks for priority 0.
    #[serde(default)]
    pub default_priority: u32,

    /// Drop to the lowest priority when the pool has no backlog.
    #[serde(default = "default_true")]
    pub auto_low_priority: bool,

    #[serde(default = "default_subaddress_lookahead_major")]
    pub subaddress_lookahead_major: u32,

    #[serde(default = "default_subaddress_lookahead_minor")]
    pub subaddress_lookahead_minor: u32,

    /// Blocks below this height are fetched as hashes only and never scanned.
    #[serde(default)]
    pub refresh_from_block_height: u64,

    /// Pick decoys for pre-fork outputs from pre-fork outputs only.
    #[serde(default)]
    pub segregate_pre_fork_outputs: bool,

    #[serde(default)]
    pub key_reuse_mitigation: bool,

    /// Overrides the network's segregation fork height when non-zero.
    #[serde(default)]
    pub segregation_height: u64,

    /// Outputs above this amount are never selected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ignore_outputs_above: Option<u64>,

    /// Outputs below this amount are never selected.
    #[serde(default)]
    pub ignore_outputs_below: u64,

    /// Combine destinations paying the same address into one output.
    #[serde(default)]
    pub merge_destinations: bool,

    /// Attempts per block pull before a transport failure is returned.
    #[serde(default = "default_max_refresh_retries")]
    pub max_refresh_retries: u32,

    /// Scanner threads; 0 lets the pool pick one per core.
    #[serde(default)]
    pub worker_threads: usize,

    #[serde(default)]
    pub log_format: LogFormat,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_network() -> NetworkId {
    NetworkId::Mainnet
}

fn default_daemon_address() -> String {
    format!("http://127.0.0.1:{}", NetworkId::Mainnet.default_rpc_port())
}

fn default_daemon_timeout_secs() -> u64 {
    30
}

fn default_kdf_rounds() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_subaddress_lookahead_major() -> u32 {
    50
}

fn default_subaddress_lookahead_minor() -> u32 {
    200
}

fn default_max_refresh_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl WalletConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, WalletError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| WalletError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, WalletError> {
        toml::from_str(s).map_err(|e| WalletError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> Result<String, WalletError> {
        toml::to_string_pretty(self).map_err(|e| WalletError::Config(e.to_string()))
    }

    /// Upper selection bound, unbounded when unset.
    pub fn outputs_above_limit(&self) -> u64 {
        self.ignore_outputs_above.unwrap_or(u64::MAX)
    }

    /// Network parameters with this config's overrides applied.
    pub fn network_params(&self) -> NetworkParams {
        let mut params = NetworkParams::for_network(self.network);
        if self.segregation_height != 0 {
            params.segregation_fork_height = self.segregation_height;
        }
        params
    }

    /// Install the global log subscriber described by this config.
    pub fn init_logging(&self) -> Result<(), WalletError> {
        try_init_logging(self.log_format, &self.log_level)
            .map_err(|e| WalletError::Config(e.to_string()))
    }

    /// Defaults for the local development network.
    pub fn dev() -> Self {
        Self {
            network: NetworkId::Dev,
            daemon_address: format!("http://127.0.0.1:{}", NetworkId::Dev.default_rpc_port()),
            ..Self::default()
        }
    }
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            daemon_address: default_daemon_address(),
            daemon_timeout_secs: default_daemon_timeout_secs(),
            kdf_rounds: default_kdf_rounds(),
            default_priority: 0,
            auto_low_priority: default_true(),
            subaddress_lookahead_major: default_subaddress_lookahead_major(),
            subaddress_lookahead_minor: default_subaddress_lookahead_minor(),
            refresh_from_block_height: 0,
            segregate_pre_fork_outputs: false,
            key_reuse_mitigation: false,
            segregation_height: 0,
            ignore_outputs_above: None,
            ignore_outputs_below: 0,
            merge_destinations: false,
            max_refresh_retries: default_max_refresh_retries(),
            worker_threads: 0,
            log_format: LogFormat::Human,
            log_level: default_log_level(),
        }
    }
}
