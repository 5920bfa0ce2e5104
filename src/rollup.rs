//! Sync engine: follows committed headers on L1, bundles L2 blocks onto the
//! DA layer, and answers queries from the persisted state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ethers::types::H256;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::bundler::Bundler;
use crate::config::{RetryConfig, RollupConfig};
use crate::da::DaClient;
use crate::error::{Error, Result};
use crate::l1::L1Chain;
use crate::l2::L2Chain;
use crate::retry::retry_with_backoff;
use crate::store::{StateStore, SyncState};
use crate::types::{BlockInfo, BlockRef, CanonicalHeader, HeaderRef, RollupInfo};

pub struct Rollup {
    l1: Arc<dyn L1Chain>,
    l2: Arc<dyn L2Chain>,
    da: Arc<dyn DaClient>,
    store: Arc<dyn StateStore>,
    opts: RollupConfig,
    retry: RetryConfig,
    state: RwLock<SyncState>,
    /// Serializes snapshots handed to the store so saves land in order.
    persist_lock: Mutex<()>,
    /// Set once an L1 poll has caught up with the head. Bundles are only
    /// sealed after that, so they link to the current committed chain.
    l1_synced: AtomicBool,
}

impl Rollup {
    /// Loads the persisted state, or starts from genesis when there is none.
    pub async fn open(
        l1: Arc<dyn L1Chain>,
        l2: Arc<dyn L2Chain>,
        da: Arc<dyn DaClient>,
        store: Arc<dyn StateStore>,
        opts: RollupConfig,
        retry: RetryConfig,
    ) -> Result<Self> {
        let state = match store.load().await? {
            Some(state) => {
                tracing::info!(
                    last_l1_height = ?state.last_l1_height,
                    last_l2_height = state.last_l2_height,
                    "Resuming from persisted state"
                );
                state
            }
            None => {
                tracing::info!(
                    genesis_l2_height = opts.genesis_l2_height,
                    "No persisted state, starting from genesis"
                );
                SyncState::genesis(opts.genesis_l2_height)
            }
        };

        Ok(Self {
            l1,
            l2,
            da,
            store,
            opts,
            retry,
            state: RwLock::new(state),
            persist_lock: Mutex::new(()),
            l1_synced: AtomicBool::new(false),
        })
    }

    fn read_state(&self) -> RwLockReadGuard<'_, SyncState> {
        match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => {
                tracing::error!("RwLock poisoned in read_state, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, SyncState> {
        match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => {
                tracing::error!("RwLock poisoned in write_state, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn snapshot(&self) -> SyncState {
        self.read_state().clone()
    }

    pub fn l1_synced(&self) -> bool {
        self.l1_synced.load(Ordering::SeqCst)
    }

    async fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let snapshot = self.snapshot();
        self.store.save(&snapshot).await
    }

    /// Polls L1 every `l1_poll_delay` until cancelled.
    ///
    /// Transient failures abort one iteration; consistency violations stop
    /// the loop and are returned.
    pub async fn run_l1_loop(&self, cancel_token: &CancellationToken) -> Result<()> {
        tracing::info!(
            loop_name = "l1",
            next_index = self.read_state().next_l1_height(),
            poll_ms = self.opts.l1_poll_delay.as_millis() as u64,
            "Starting L1 commitment poller"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.opts.l1_poll_delay) => {}
                _ = cancel_token.cancelled() => break,
            }

            match self.poll_l1(cancel_token).await {
                Ok(0) => tracing::debug!(loop_name = "l1", "No new commitments"),
                Ok(accepted) => tracing::info!(
                    loop_name = "l1",
                    accepted = accepted,
                    last_index = ?self.read_state().last_l1_height,
                    "Committed headers accepted"
                ),
                Err(Error::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!(loop_name = "l1", error = %e, "Halting L1 poller");
                    return Err(e);
                }
                Err(e) => tracing::warn!(loop_name = "l1", error = %e, "L1 iteration aborted"),
            }
        }

        tracing::info!(loop_name = "l1", "L1 poller shutting down");
        Ok(())
    }

    /// Accepts every committed header between the cursor and the L1 head, in
    /// order. Returns how many were accepted.
    pub async fn poll_l1(&self, cancel_token: &CancellationToken) -> Result<usize> {
        let latest = retry_with_backoff("l1.latest_height", &self.retry, cancel_token, || {
            self.l1.get_latest_committed_height()
        })
        .await
        .into_result()?;

        let mut next = self.read_state().next_l1_height();
        let mut accepted = 0;
        let outcome = loop {
            if next > latest {
                break Ok(());
            }
            let fetched = retry_with_backoff("l1.header", &self.retry, cancel_token, || {
                self.l1.get_committed_header(HeaderRef::Index(next))
            })
            .await
            .into_result();

            let header = match fetched {
                Ok(header) => header,
                Err(e) => break Err(e),
            };
            if let Err(e) = self.accept_committed(next, header) {
                break Err(e);
            }
            accepted += 1;
            next += 1;
        };

        if accepted > 0 {
            self.persist().await?;
        }
        outcome?;
        self.l1_synced.store(true, Ordering::SeqCst);
        Ok(accepted)
    }

    fn accept_committed(&self, index: u64, header: CanonicalHeader) -> Result<()> {
        let mut state = self.write_state();

        if index != state.next_l1_height() {
            return Err(Error::ChainDivergence {
                index,
                reason: format!("expected index {}", state.next_l1_height()),
            });
        }
        if let Some(last) = state.last_header_hash {
            if header.parent_hash != last {
                return Err(Error::ChainDivergence {
                    index,
                    reason: format!(
                        "parent {:?} does not match last accepted header {last:?}",
                        header.parent_hash
                    ),
                });
            }
        }
        if let Some(prev_end) = state.last_committed_l2_height {
            if header.block_range_start <= prev_end {
                return Err(Error::ChainDivergence {
                    index,
                    reason: format!(
                        "range {}-{} overlaps previous end {prev_end}",
                        header.block_range_start, header.block_range_end
                    ),
                });
            }
        }

        let hash = header.hash();
        let committed_end = header.block_range_end;
        tracing::debug!(
            index = index,
            hash = ?hash,
            start = header.block_range_start,
            end = header.block_range_end,
            "Committed header accepted"
        );

        state.last_l1_height = Some(index);
        state.last_header_hash = Some(hash);
        state.last_committed_l2_height = Some(committed_end);
        if self.opts.store_da_pointers {
            state.pointers.insert(hash, header.da_pointer);
        }
        if self.opts.store_headers {
            state.header_index.insert(index, hash);
            state.headers.insert(hash, header);
        }
        state
            .bundles
            .retain(|_, bundle| bundle.block_range_end > committed_end);
        state.touch();
        Ok(())
    }

    fn new_bundler(&self) -> Bundler {
        let state = self.read_state();
        Bundler::new(
            self.da.clone(),
            self.opts.bundle_size,
            state.next_l2_height(),
            state.last_l2_hash,
        )
    }

    /// Header the next bundle links to: the last emitted bundle, else the
    /// last committed header, else zero.
    fn bundle_parent(&self) -> H256 {
        let state = self.read_state();
        state
            .last_bundle_hash
            .or(state.last_header_hash)
            .unwrap_or_default()
    }

    /// Bundles L2 blocks every `l2_poll_delay` until cancelled.
    ///
    /// Pending blocks are not persisted; after a restart they are fetched
    /// again from the last bundled height.
    pub async fn run_l2_loop(&self, cancel_token: &CancellationToken) -> Result<()> {
        let bundler = self.new_bundler();
        tracing::info!(
            loop_name = "l2",
            next_height = bundler.next_height(),
            bundle_size = self.opts.bundle_size,
            poll_ms = self.opts.l2_poll_delay.as_millis() as u64,
            "Starting L2 bundler"
        );
        let bundler = Mutex::new(bundler);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.opts.l2_poll_delay) => {}
                _ = cancel_token.cancelled() => break,
            }

            match self.poll_l2(&bundler, cancel_token).await {
                Ok(emitted) if emitted.is_empty() => {
                    tracing::debug!(loop_name = "l2", "No bundle ready")
                }
                Ok(emitted) => tracing::info!(
                    loop_name = "l2",
                    bundles = emitted.len(),
                    last_l2_height = self.read_state().last_l2_height,
                    "Bundles published"
                ),
                Err(Error::Cancelled) => break,
                Err(e) if e.is_fatal() => {
                    tracing::error!(loop_name = "l2", error = %e, "Halting L2 bundler");
                    return Err(e);
                }
                Err(e) => tracing::warn!(loop_name = "l2", error = %e, "L2 iteration aborted"),
            }
        }

        if self.opts.flush_on_shutdown {
            if self.l1_synced() {
                let mut bundler = bundler.lock().await;
                if let Some(header) = bundler.flush(self.bundle_parent()).await? {
                    self.record_bundle(&header, bundler.last_block_hash());
                    self.persist().await?;
                }
            } else {
                tracing::warn!(loop_name = "l2", "L1 never synced, pending blocks not flushed");
            }
        }

        tracing::info!(loop_name = "l2", "L2 bundler shutting down");
        Ok(())
    }

    /// Pulls every available L2 block into the bundler and publishes each
    /// bundle as soon as it is full. Returns the headers emitted.
    ///
    /// Nothing is sealed before the first successful L1 poll; until then the
    /// bundler just holds a full bundle.
    pub async fn poll_l2(
        &self,
        bundler: &Mutex<Bundler>,
        cancel_token: &CancellationToken,
    ) -> Result<Vec<CanonicalHeader>> {
        let latest = retry_with_backoff("l2.latest_height", &self.retry, cancel_token, || {
            self.l2.get_latest_height()
        })
        .await
        .into_result()?;

        let mut emitted = Vec::new();
        loop {
            if bundler.lock().await.is_full() {
                if !self.l1_synced() {
                    tracing::debug!(loop_name = "l2", "Waiting for L1 sync before sealing");
                    break;
                }
                let sealed = retry_with_backoff("da.publish", &self.retry, cancel_token, || async move {
                    let parent = self.bundle_parent();
                    bundler.lock().await.seal(parent).await
                })
                .await
                .into_result()?;

                if let Some(header) = sealed {
                    let last_block_hash = bundler.lock().await.last_block_hash();
                    self.record_bundle(&header, last_block_hash);
                    self.persist().await?;
                    emitted.push(header);
                }
                continue;
            }

            let next = bundler.lock().await.next_height();
            if next > latest {
                break;
            }

            let block = retry_with_backoff("l2.block", &self.retry, cancel_token, || {
                self.l2.get_block(BlockRef::Number(next))
            })
            .await
            .into_result()
            .map_err(|e| match e {
                Error::BlockNotFound(reason) => Error::MissingBlock {
                    height: next,
                    reason,
                },
                other => other,
            })?;
            bundler.lock().await.push(block)?;
        }

        Ok(emitted)
    }

    fn record_bundle(&self, header: &CanonicalHeader, last_block_hash: Option<H256>) {
        let hash = header.hash();
        tracing::info!(
            loop_name = "l2",
            bundle = ?hash,
            start = header.block_range_start,
            end = header.block_range_end,
            da_height = header.da_pointer.height,
            "Bundle assembled"
        );

        let mut state = self.write_state();
        state.last_l2_height = header.block_range_end;
        state.last_l2_hash = last_block_hash;
        state.last_bundle_hash = Some(hash);
        let committed = state
            .last_committed_l2_height
            .is_some_and(|end| header.block_range_end <= end);
        if self.opts.store_headers && !committed {
            state.bundles.insert(hash, header.clone());
        }
        state.touch();
    }

    pub fn get_info(&self) -> RollupInfo {
        let state = self.read_state();
        RollupInfo {
            latest_l1_height: state.last_l1_height,
            latest_l2_height: state.last_l2_height,
            last_committed_header_hash: state.last_header_hash,
            last_bundle_hash: state.last_bundle_hash,
            updated_at: state.updated_at.clone(),
        }
    }

    /// Looks a header up by hash: the local archive first, then L1.
    pub async fn get_block_info(&self, hash: H256) -> Result<BlockInfo> {
        if let Some(info) = self.local_block_info(hash) {
            return Ok(info);
        }
        let header = self.l1.get_committed_header(HeaderRef::Hash(hash)).await?;
        Ok(BlockInfo {
            hash,
            header,
            committed: true,
        })
    }

    pub async fn get_block_info_by_index(&self, index: u64) -> Result<BlockInfo> {
        let archived = self.read_state().header_index.get(&index).copied();
        if let Some(info) = archived.and_then(|hash| self.local_block_info(hash)) {
            return Ok(info);
        }
        let header = self.l1.get_committed_header(HeaderRef::Index(index)).await?;
        Ok(BlockInfo {
            hash: header.hash(),
            header,
            committed: true,
        })
    }

    fn local_block_info(&self, hash: H256) -> Option<BlockInfo> {
        let state = self.read_state();
        if let Some(header) = state.headers.get(&hash) {
            return Some(BlockInfo {
                hash,
                header: header.clone(),
                committed: true,
            });
        }
        state.bundles.get(&hash).map(|header| BlockInfo {
            hash,
            header: header.clone(),
            committed: false,
        })
    }
}
