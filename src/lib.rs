//! Rollup DA Defender - keep an L2 rollup's data available and defend it on L1
//!
//! This library follows the headers a rollup commits to its settlement chain,
//! bundles L2 blocks onto a data availability network, and proves on L1 that
//! a committed datum really was published.

pub mod bundler;
pub mod codec;
pub mod config;
pub mod da;
pub mod defender;
pub mod error;
pub mod l1;
pub mod l2;
pub mod retry;
pub mod rollup;
pub mod store;
pub mod types;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types
pub use bundler::Bundler;
pub use config::{Config, RetryConfig, RollupConfig, ServerConfig};
pub use da::{CelestiaClient, DaClient, DaProof};
pub use defender::{DefenseOutcome, Defender, DefenderOpts};
pub use error::{Error, ErrorClass, Result};
pub use l1::{EthereumL1, L1Chain, TxSigner, WalletSigner};
pub use l2::{EthereumL2, L2Chain};
pub use rollup::Rollup;
pub use store::{JsonFileStore, MemoryStore, StateStore, SyncState};
pub use types::{
    BlockInfo, CanonicalHeader, DaPointer, DatumKind, ElementIndex, RollupInfo, SubmissionStatus,
};

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

/// Combined state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub rollup: Arc<Rollup>,
    pub defender: Arc<Defender>,
    /// Parent of every request's token, cancelled on shutdown.
    pub cancel_token: CancellationToken,
}
