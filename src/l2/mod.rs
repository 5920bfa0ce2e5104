use async_trait::async_trait;
use ethers::providers::{Http, Middleware, Provider, ProviderError};
use ethers::types::{Block, BlockId, BlockNumber, Transaction, H256};

use crate::error::{Error, Result};
use crate::types::{BlockRef, L2Block, L2Header, L2Transaction};

/// Read-only view of the rollup execution chain.
#[async_trait]
pub trait L2Chain: Send + Sync {
    async fn get_block(&self, at: BlockRef) -> Result<L2Block>;

    async fn get_latest_height(&self) -> Result<u64>;

    async fn get_transaction(&self, hash: H256) -> Result<L2Transaction>;
}

/// L2 execution node reached over Ethereum JSON-RPC.
pub struct EthereumL2 {
    provider: Provider<Http>,
}

impl EthereumL2 {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let provider = Provider::<Http>::try_from(rpc_url)
            .map_err(|e| Error::RpcUnavailable(format!("invalid L2 rpc url: {e}")))?;
        Ok(Self { provider })
    }
}

fn unavailable(e: ProviderError) -> Error {
    Error::RpcUnavailable(format!("L2: {e}"))
}

fn to_l2_transaction(tx: &Transaction, block_number: u64) -> L2Transaction {
    L2Transaction {
        hash: tx.hash,
        block_number,
        index: tx.transaction_index.map(|i| i.as_u32()).unwrap_or_default(),
        raw: tx.rlp(),
    }
}

/// Converts a node block into the engine's view. Pending blocks (no number
/// or hash yet) are treated as absent.
fn to_l2_block(block: Block<Transaction>, at: BlockRef) -> Result<L2Block> {
    let (Some(number), Some(hash)) = (block.number, block.hash) else {
        return Err(Error::BlockNotFound(format!("{at} is still pending")));
    };
    let number = number.as_u64();

    let transactions = block
        .transactions
        .iter()
        .map(|tx| to_l2_transaction(tx, number))
        .collect();

    let header = L2Header {
        parent_hash: block.parent_hash,
        uncles_hash: block.uncles_hash,
        coinbase: block.author.unwrap_or_default(),
        state_root: block.state_root,
        transactions_root: block.transactions_root,
        receipts_root: block.receipts_root,
        logs_bloom: block.logs_bloom.unwrap_or_default(),
        difficulty: block.difficulty,
        number,
        gas_limit: block.gas_limit,
        gas_used: block.gas_used,
        timestamp: block.timestamp.as_u64(),
        extra_data: block.extra_data,
        mix_hash: block.mix_hash.unwrap_or_default(),
        nonce: block.nonce.unwrap_or_default(),
        base_fee_per_gas: block.base_fee_per_gas,
        withdrawals_root: block.withdrawals_root,
        blob_gas_used: block.blob_gas_used,
        excess_blob_gas: block.excess_blob_gas,
        parent_beacon_block_root: block.parent_beacon_block_root,
    };

    Ok(L2Block {
        hash,
        header,
        transactions,
    })
}

#[async_trait]
impl L2Chain for EthereumL2 {
    async fn get_block(&self, at: BlockRef) -> Result<L2Block> {
        let id: BlockId = match at {
            BlockRef::Number(n) => BlockNumber::Number(n.into()).into(),
            BlockRef::Hash(h) => h.into(),
        };

        let block = self
            .provider
            .get_block_with_txs(id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| Error::BlockNotFound(at.to_string()))?;

        to_l2_block(block, at)
    }

    async fn get_latest_height(&self) -> Result<u64> {
        let height = self
            .provider
            .get_block_number()
            .await
            .map_err(unavailable)?;
        Ok(height.as_u64())
    }

    async fn get_transaction(&self, hash: H256) -> Result<L2Transaction> {
        let tx = self
            .provider
            .get_transaction(hash)
            .await
            .map_err(unavailable)?
            .ok_or(Error::TransactionNotFound(hash))?;

        let block_number = tx
            .block_number
            .map(|n| n.as_u64())
            .ok_or(Error::TransactionNotFound(hash))?;
        Ok(to_l2_transaction(&tx, block_number))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Bytes, U64};

    #[test]
    fn test_pending_block_is_not_found() {
        let block = Block::<Transaction>::default();
        let err = to_l2_block(block, BlockRef::Number(5)).unwrap_err();
        assert!(matches!(err, Error::BlockNotFound(_)));
    }

    #[test]
    fn test_block_conversion_keeps_extra_data() {
        let block = Block::<Transaction> {
            number: Some(U64::from(12)),
            hash: Some(H256::repeat_byte(1)),
            extra_data: Bytes::from(vec![1, 2, 3]),
            transactions: vec![Transaction {
                hash: H256::repeat_byte(9),
                transaction_index: Some(U64::from(0)),
                ..Default::default()
            }],
            ..Default::default()
        };

        let converted = to_l2_block(block, BlockRef::Number(12)).unwrap();
        assert_eq!(converted.number(), 12);
        assert_eq!(converted.header.extra_data.as_ref(), &[1, 2, 3]);
        assert_eq!(converted.transactions.len(), 1);
        assert_eq!(converted.transactions[0].block_number, 12);
        assert_eq!(converted.transactions[0].hash, H256::repeat_byte(9));
    }
}
