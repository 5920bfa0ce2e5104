use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::H256;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;

use crate::error::{Error, Result};
use crate::types::{CanonicalHeader, DaPointer};

/// Persisted cursor state of the sync engine.
///
/// `last_l1_height` and `last_header_hash` are written only by the L1 loop;
/// `last_l2_height`, `last_l2_hash` and `last_bundle_hash` only by the L2
/// loop. Both loops touch `bundles`: the L2 loop adds, the L1 loop prunes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    /// Index of the last committed header accepted from L1.
    pub last_l1_height: Option<u64>,
    /// Hash of that header; the next one must name it as parent.
    pub last_header_hash: Option<H256>,
    /// End of that header's block range.
    #[serde(default)]
    pub last_committed_l2_height: Option<u64>,
    /// Last L2 block covered by an emitted bundle.
    pub last_l2_height: u64,
    /// Hash of that block; the next bundled block must name it as parent.
    #[serde(default)]
    pub last_l2_hash: Option<H256>,
    pub last_bundle_hash: Option<H256>,
    /// Committed header archive, keyed by hash. Kept when `store_headers`.
    #[serde(default)]
    pub headers: BTreeMap<H256, CanonicalHeader>,
    /// L1 index to header hash, for every archived header.
    #[serde(default)]
    pub header_index: BTreeMap<u64, H256>,
    /// DA pointer per committed header. Kept when `store_da_pointers`.
    #[serde(default)]
    pub pointers: BTreeMap<H256, DaPointer>,
    /// Bundles assembled locally and not yet covered by a committed header,
    /// keyed by hash. Kept when `store_headers`.
    #[serde(default)]
    pub bundles: BTreeMap<H256, CanonicalHeader>,
    pub updated_at: Option<String>,
}

impl SyncState {
    /// State for a fresh start: bundling resumes right after `genesis_l2_height`.
    pub fn genesis(genesis_l2_height: u64) -> Self {
        Self {
            last_l2_height: genesis_l2_height,
            ..Default::default()
        }
    }

    /// Next L1 index to look at.
    pub fn next_l1_height(&self) -> u64 {
        self.last_l1_height.map(|h| h + 1).unwrap_or(0)
    }

    pub fn next_l2_height(&self) -> u64 {
        self.last_l2_height + 1
    }

    pub fn touch(&mut self) {
        self.updated_at = Some(chrono::Utc::now().to_rfc3339());
    }
}

/// Durable home for `SyncState`.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<SyncState>>;

    /// Returns once the state is durable.
    async fn save(&self, state: &SyncState) -> Result<()>;
}

/// Stores the state as a JSON document, replaced atomically on every save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        tmp.into()
    }
}

fn store_error(what: &str, e: impl std::fmt::Display) -> Error {
    Error::Store(format!("{what}: {e}"))
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self) -> Result<Option<SyncState>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(store_error("read", e)),
        };
        let state = serde_json::from_slice(&data).map_err(|e| store_error("parse", e))?;
        Ok(Some(state))
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        let data = serde_json::to_vec_pretty(state).map_err(|e| store_error("encode", e))?;
        let tmp = self.tmp_path();

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| store_error("create", e))?;
        file.write_all(&data)
            .await
            .map_err(|e| store_error("write", e))?;
        file.sync_all().await.map_err(|e| store_error("sync", e))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| store_error("rename", e))?;
        Ok(())
    }
}

/// Volatile store, mostly for tests.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<SyncState>>,
    saves: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: SyncState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
            saves: AtomicUsize::new(0),
        }
    }

    pub fn snapshot(&self) -> Option<SyncState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<SyncState>> {
        Ok(self.snapshot())
    }

    async fn save(&self, state: &SyncState) -> Result<()> {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(state.clone());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
