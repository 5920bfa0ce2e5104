use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ethers::types::Address;
use eyre::{eyre, WrapErr};

use crate::types::Namespace;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn required(key: &str) -> eyre::Result<String> {
    env::var(key).map_err(|_| eyre!("missing required environment variable {key}"))
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .or_else(|| env::var("PORT").ok().and_then(|p| p.parse().ok()))
                .unwrap_or(8080),
        }
    }
}

impl ServerConfig {
    /// Get the socket address string
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Retry policy for transient L1, L2 and DA failures
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Attempts per call before the error is surfaced
    pub max_attempts: u32,
    /// Base backoff duration
    pub base_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: env_or("RETRY_MAX_ATTEMPTS", 5),
            base_backoff: Duration::from_millis(env_or("RETRY_BASE_BACKOFF_MS", 500)),
            max_backoff: Duration::from_millis(env_or("RETRY_MAX_BACKOFF_MS", 30_000)),
        }
    }
}

impl RetryConfig {
    /// Calculate backoff duration for a given attempt (exponential backoff)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_millis() as u64;
        let backoff = base.saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(backoff.min(self.max_backoff.as_millis() as u64))
    }
}

/// Sync engine options
#[derive(Debug, Clone)]
pub struct RollupConfig {
    pub l1_poll_delay: Duration,
    pub l2_poll_delay: Duration,
    /// Number of L2 blocks per bundle
    pub bundle_size: u64,
    /// Persist the DA pointer of every committed header
    pub store_da_pointers: bool,
    /// Persist every committed header in full
    pub store_headers: bool,
    /// Emit a partial bundle when the L2 loop is cancelled
    pub flush_on_shutdown: bool,
    /// Bundling starts at the block after this one on a fresh state
    pub genesis_l2_height: u64,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            l1_poll_delay: Duration::from_millis(env_or("L1_POLL_DELAY_MS", 15_000)),
            l2_poll_delay: Duration::from_millis(env_or("L2_POLL_DELAY_MS", 2_000)),
            bundle_size: env_or("BUNDLE_SIZE", 100),
            store_da_pointers: env_or("STORE_DA_POINTERS", true),
            store_headers: env_or("STORE_HEADERS", true),
            flush_on_shutdown: env_or("FLUSH_ON_SHUTDOWN", false),
            genesis_l2_height: env_or("GENESIS_L2_HEIGHT", 0),
        }
    }
}

impl RollupConfig {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.bundle_size == 0 {
            return Err(eyre!("bundle size must be at least one block"));
        }
        Ok(())
    }
}

/// Where the sync state is persisted
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: env::var("STORE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rollup-state.json")),
        }
    }
}

/// Settlement chain endpoint and contracts
#[derive(Debug, Clone)]
pub struct L1Config {
    pub rpc_url: String,
    pub canonical_state_chain: Address,
    pub da_oracle: Address,
    pub chain_id: u64,
    /// How long to wait for a defense transaction to be mined
    pub submit_timeout: Duration,
}

impl L1Config {
    pub fn from_env() -> eyre::Result<Self> {
        Ok(Self {
            rpc_url: required("L1_RPC")?,
            canonical_state_chain: required("CANONICAL_STATE_CHAIN")?
                .parse()
                .wrap_err("invalid CANONICAL_STATE_CHAIN address")?,
            da_oracle: required("DA_ORACLE")?
                .parse()
                .wrap_err("invalid DA_ORACLE address")?,
            chain_id: required("L1_CHAIN_ID")?
                .parse()
                .wrap_err("invalid L1_CHAIN_ID")?,
            submit_timeout: Duration::from_secs(env_or("SUBMIT_TIMEOUT_SECS", 120)),
        })
    }
}

/// Rollup execution chain endpoint
#[derive(Debug, Clone)]
pub struct L2Config {
    pub rpc_url: String,
}

impl L2Config {
    pub fn from_env() -> eyre::Result<Self> {
        Ok(Self {
            rpc_url: required("L2_RPC")?,
        })
    }
}

/// DA node endpoint
#[derive(Debug, Clone)]
pub struct DaConfig {
    pub endpoint: String,
    pub auth_token: Option<String>,
    pub namespace: Namespace,
    pub request_timeout: Duration,
}

impl DaConfig {
    pub fn from_env() -> eyre::Result<Self> {
        Ok(Self {
            endpoint: required("DA_RPC")?,
            auth_token: env::var("DA_AUTH_TOKEN").ok().filter(|t| !t.is_empty()),
            namespace: required("DA_NAMESPACE")?
                .parse()
                .map_err(|e| eyre!("invalid DA_NAMESPACE: {e}"))?,
            request_timeout: Duration::from_secs(env_or("DA_REQUEST_TIMEOUT_SECS", 30)),
        })
    }
}

/// Main application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub retry: RetryConfig,
    pub rollup: RollupConfig,
    pub store: StoreConfig,
    pub l1: L1Config,
    pub l2: L2Config,
    pub da: DaConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> eyre::Result<Self> {
        let config = Self {
            server: ServerConfig::default(),
            retry: RetryConfig::default(),
            rollup: RollupConfig::default(),
            store: StoreConfig::default(),
            l1: L1Config::from_env()?,
            l2: L2Config::from_env()?,
            da: DaConfig::from_env()?,
        };
        config.rollup.validate()?;
        Ok(config)
    }
}
