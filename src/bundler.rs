use std::sync::Arc;

use ethers::types::H256;

use crate::codec;
use crate::da::DaClient;
use crate::error::{Error, Result};
use crate::types::{CanonicalHeader, L2Block};

/// Accumulates contiguous L2 blocks and turns every `bundle_size` of them
/// into a published blob plus its `CanonicalHeader`.
///
/// The header a bundle links to is supplied when it is sealed, so it always
/// reflects the latest committed state.
pub struct Bundler {
    da: Arc<dyn DaClient>,
    bundle_size: u64,
    /// Height of `pending[0]`, or of the next block when empty.
    start_height: u64,
    /// Hash of the last block already bundled, if known.
    last_block_hash: Option<H256>,
    pending: Vec<L2Block>,
}

impl Bundler {
    pub fn new(
        da: Arc<dyn DaClient>,
        bundle_size: u64,
        next_height: u64,
        last_block_hash: Option<H256>,
    ) -> Self {
        Self {
            da,
            bundle_size: bundle_size.max(1),
            start_height: next_height,
            last_block_hash,
            pending: Vec::new(),
        }
    }

    /// Height the next pushed block must have.
    pub fn next_height(&self) -> u64 {
        self.start_height + self.pending.len() as u64
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_block_hash(&self) -> Option<H256> {
        self.last_block_hash
    }

    pub fn is_full(&self) -> bool {
        self.pending.len() as u64 >= self.bundle_size
    }

    /// Appends the next block. Gaps and broken parent links are fatal: the
    /// L2 node is serving inconsistent data and nothing is skipped.
    ///
    /// The first block after a sealed bundle must link to that bundle's last
    /// block.
    pub fn push(&mut self, block: L2Block) -> Result<()> {
        let expected = self.next_height();
        if block.number() != expected {
            return Err(Error::NonContiguousBlocks {
                expected,
                found: block.number(),
            });
        }
        let parent = self
            .pending
            .last()
            .map(|prev| prev.hash)
            .or(self.last_block_hash);
        if let Some(parent) = parent {
            if block.header.parent_hash != parent {
                return Err(Error::NonContiguousBlocks {
                    expected,
                    found: block.number(),
                });
            }
        }
        self.pending.push(block);
        Ok(())
    }

    /// Emits a full bundle linked to `parent_hash`, if one is ready.
    pub async fn seal(&mut self, parent_hash: H256) -> Result<Option<CanonicalHeader>> {
        if !self.is_full() {
            return Ok(None);
        }
        self.emit(self.bundle_size as usize, parent_hash)
            .await
            .map(Some)
    }

    /// Emits whatever is pending, even a partial bundle.
    pub async fn flush(&mut self, parent_hash: H256) -> Result<Option<CanonicalHeader>> {
        if self.pending.is_empty() {
            return Ok(None);
        }
        let count = self.pending.len().min(self.bundle_size as usize);
        self.emit(count, parent_hash).await.map(Some)
    }

    /// Publishes the first `count` pending blocks. State only changes once
    /// the DA layer accepted the blob, so a failed call can simply be retried.
    async fn emit(&mut self, count: usize, parent_hash: H256) -> Result<CanonicalHeader> {
        let blocks = &self.pending[..count];
        let last = &blocks[count - 1];

        let blob = codec::encode_bundle_blob(blocks);
        let da_pointer = self.da.publish(blob).await?;

        let header = CanonicalHeader {
            parent_hash,
            block_range_start: self.start_height,
            block_range_end: last.number(),
            l2_state_root: last.header.state_root,
            da_pointer,
            timestamp: last.header.timestamp,
        };

        self.last_block_hash = Some(last.hash);
        self.pending.drain(..count);
        self.start_height += count as u64;

        tracing::debug!(
            start = header.block_range_start,
            end = header.block_range_end,
            da_height = header.da_pointer.height,
            "Bundle sealed"
        );
        Ok(header)
    }
}
