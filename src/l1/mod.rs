//! Settlement chain adapter: reads committed headers from the canonical
//! state chain contract and submits defense transactions to the DA oracle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ethers::contract::{abigen, ContractError};
use ethers::providers::{Http, Middleware, Provider, ProviderError, RpcError};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, Bytes, H256, U256};

use crate::codec;
use crate::config::L1Config;
use crate::da::DaProof;
use crate::error::{Error, Result};
use crate::types::{
    CanonicalHeader, DefenseAux, ElementIndex, HeaderRef, SubmissionStatus, TxHandle,
};

abigen!(
    CanonicalStateChain,
    r#"[
        function chainHead() external view returns (uint256)
        function chain(uint256) external view returns (bytes32)
        function headers(bytes32) external view returns (bytes)
    ]"#
);

abigen!(
    DaOracle,
    r#"[
        function defendDataRootInclusion(bytes32 bundleHash, bytes32 datumHash, uint256 elementIndex, bytes proof) external
    ]"#
);

/// Capability to read commitments from and defend them on L1.
///
/// Implementations never retry. A `Timeout` from `submit_defense` means the
/// transaction may still land; call `submission_status` before resubmitting.
#[async_trait]
pub trait L1Chain: Send + Sync {
    async fn get_committed_header(&self, at: HeaderRef) -> Result<CanonicalHeader>;

    /// Index of the newest committed header.
    async fn get_latest_committed_height(&self) -> Result<u64>;

    async fn submit_defense(
        &self,
        target_bundle_hash: H256,
        proof: &DaProof,
        aux: DefenseAux,
    ) -> Result<TxHandle>;

    async fn submission_status(&self, tx_hash: H256) -> Result<SubmissionStatus>;
}

/// Turns an unsigned transaction into raw signed bytes.
#[async_trait]
pub trait TxSigner: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_transaction(&self, tx: &TypedTransaction) -> Result<Bytes>;
}

/// Signer backed by an in-memory key.
pub struct WalletSigner {
    wallet: LocalWallet,
}

impl WalletSigner {
    pub fn new(wallet: LocalWallet, chain_id: u64) -> Self {
        Self {
            wallet: wallet.with_chain_id(chain_id),
        }
    }
}

#[async_trait]
impl TxSigner for WalletSigner {
    fn address(&self) -> Address {
        self.wallet.address()
    }

    async fn sign_transaction(&self, tx: &TypedTransaction) -> Result<Bytes> {
        let signature = self
            .wallet
            .sign_transaction(tx)
            .await
            .map_err(|e| Error::SigningFailed(e.to_string()))?;
        Ok(tx.rlp_signed(&signature))
    }
}

/// Packs an element position into the oracle's `uint256` argument:
/// block index in the high word, `tx + 1` (or 0 for the header) in the low.
pub fn pack_element_index(element: ElementIndex) -> U256 {
    let low = element.tx.map(|tx| u64::from(tx) + 1).unwrap_or(0);
    (U256::from(element.block) << 64) | U256::from(low)
}

fn read_error<M: Middleware>(what: &str, e: ContractError<M>) -> Error {
    if e.is_revert() {
        Error::HeaderNotFound(format!("{what}: reverted"))
    } else {
        Error::RpcUnavailable(format!("L1 {what}: {e}"))
    }
}

/// Sorts a provider failure on the submission path. Node-side rejections are
/// definitive, transport failures are not.
fn submission_error(e: ProviderError) -> Error {
    match e.as_error_response() {
        Some(resp) if resp.message.contains("insufficient funds") => {
            Error::InsufficientFunds(resp.message.clone())
        }
        Some(resp) => Error::SubmissionFailed(resp.message.clone()),
        None => Error::RpcUnavailable(format!("L1: {e}")),
    }
}

pub struct EthereumL1 {
    provider: Arc<Provider<Http>>,
    chain: CanonicalStateChain<Provider<Http>>,
    oracle: DaOracle<Provider<Http>>,
    signer: Arc<dyn TxSigner>,
    chain_id: u64,
    submit_timeout: Duration,
}

impl EthereumL1 {
    pub fn new(config: &L1Config, signer: Arc<dyn TxSigner>) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| Error::RpcUnavailable(format!("invalid L1 rpc url: {e}")))?;
        let provider = Arc::new(provider);

        tracing::info!(
            canonical_state_chain = ?config.canonical_state_chain,
            da_oracle = ?config.da_oracle,
            signer = ?signer.address(),
            "Contract addresses loaded"
        );

        Ok(Self {
            chain: CanonicalStateChain::new(config.canonical_state_chain, provider.clone()),
            oracle: DaOracle::new(config.da_oracle, provider.clone()),
            provider,
            signer,
            chain_id: config.chain_id,
            submit_timeout: config.submit_timeout,
        })
    }

    async fn header_by_hash(&self, hash: H256) -> Result<CanonicalHeader> {
        let raw = self
            .chain
            .headers(hash.0)
            .call()
            .await
            .map_err(|e| read_error("headers", e))?;
        if raw.is_empty() {
            return Err(Error::HeaderNotFound(format!("{hash:?}")));
        }

        let header = codec::decode_header(&raw)?;
        if header.hash() != hash {
            return Err(Error::MalformedHeader(format!(
                "header stored under {hash:?} hashes to {:?}",
                header.hash()
            )));
        }
        Ok(header)
    }
}

#[async_trait]
impl L1Chain for EthereumL1 {
    async fn get_committed_header(&self, at: HeaderRef) -> Result<CanonicalHeader> {
        let hash = match at {
            HeaderRef::Hash(hash) => hash,
            HeaderRef::Index(index) => {
                let head = self.get_latest_committed_height().await?;
                if index > head {
                    return Err(Error::HeaderNotFound(at.to_string()));
                }
                let hash = self
                    .chain
                    .chain(U256::from(index))
                    .call()
                    .await
                    .map_err(|e| read_error("chain", e))?;
                H256(hash)
            }
        };

        if hash.is_zero() {
            return Err(Error::HeaderNotFound(at.to_string()));
        }
        self.header_by_hash(hash).await
    }

    async fn get_latest_committed_height(&self) -> Result<u64> {
        let head = self
            .chain
            .chain_head()
            .call()
            .await
            .map_err(|e| read_error("chainHead", e))?;
        if head > U256::from(u64::MAX) {
            return Err(Error::MalformedHeader(format!("chain head {head} out of range")));
        }
        Ok(head.as_u64())
    }

    async fn submit_defense(
        &self,
        target_bundle_hash: H256,
        proof: &DaProof,
        aux: DefenseAux,
    ) -> Result<TxHandle> {
        let call = self.oracle.defend_data_root_inclusion(
            target_bundle_hash.0,
            aux.datum.0,
            pack_element_index(aux.element),
            proof.encode()?,
        );

        let mut tx = call.tx;
        tx.set_from(self.signer.address());
        tx.set_chain_id(self.chain_id);
        self.provider
            .fill_transaction(&mut tx, None)
            .await
            .map_err(submission_error)?;

        let raw = self.signer.sign_transaction(&tx).await?;
        let pending = self
            .provider
            .send_raw_transaction(raw)
            .await
            .map_err(submission_error)?;
        let tx_hash = pending.tx_hash();

        tracing::info!(
            tx = ?tx_hash,
            bundle = ?target_bundle_hash,
            datum = ?aux.datum,
            "Defense transaction sent"
        );

        // From here on the transaction exists; any failure to observe it is
        // ambiguous and reported as a timeout.
        match tokio::time::timeout(self.submit_timeout, pending).await {
            Ok(Ok(Some(receipt))) if receipt.status == Some(1u64.into()) => {
                Ok(TxHandle { tx_hash })
            }
            Ok(Ok(Some(_))) => Err(Error::SubmissionFailed(format!(
                "defense transaction {tx_hash:?} reverted"
            ))),
            Ok(Ok(None)) | Ok(Err(_)) | Err(_) => Err(Error::Timeout { tx_hash }),
        }
    }

    async fn submission_status(&self, tx_hash: H256) -> Result<SubmissionStatus> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| Error::RpcUnavailable(format!("L1: {e}")))?;
        if let Some(receipt) = receipt {
            return Ok(SubmissionStatus::Included {
                block: receipt.block_number.map(|n| n.as_u64()).unwrap_or_default(),
                success: receipt.status == Some(1u64.into()),
            });
        }

        let tx = self
            .provider
            .get_transaction(tx_hash)
            .await
            .map_err(|e| Error::RpcUnavailable(format!("L1: {e}")))?;
        Ok(match tx {
            Some(_) => SubmissionStatus::Pending,
            None => SubmissionStatus::Unknown,
        })
    }
}
