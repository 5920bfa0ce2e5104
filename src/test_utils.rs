//! Fixtures and in-memory adapters shared by the unit tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use ethers::types::{Address, Bloom, Bytes, H256, H64, U256};

use crate::codec;
use crate::da::{build_element_proof, DaClient, DaProof};
use crate::error::{Error, Result};
use crate::l1::L1Chain;
use crate::l2::L2Chain;
use crate::types::{
    BlockRef, CanonicalHeader, DaPointer, DefenseAux, ElementIndex, HeaderRef, L2Block,
    L2Header, L2Transaction, Namespace, SubmissionStatus, TxHandle,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn test_namespace() -> Namespace {
    Namespace::v0(b"test").unwrap()
}

pub fn sample_pointer(height: u64) -> DaPointer {
    DaPointer {
        namespace: test_namespace(),
        height,
        commitment: codec::hash_bytes(&height.to_be_bytes()),
    }
}

pub fn sample_header(parent_hash: H256, start: u64, end: u64) -> CanonicalHeader {
    CanonicalHeader {
        parent_hash,
        block_range_start: start,
        block_range_end: end,
        l2_state_root: H256::from_low_u64_be(end),
        da_pointer: sample_pointer(1_000 + end),
        timestamp: 1_700_000_000 + end,
    }
}

/// `n` linked headers, the first covering only block 0, then four blocks each.
pub fn header_chain(n: usize) -> Vec<CanonicalHeader> {
    let mut headers: Vec<CanonicalHeader> = Vec::with_capacity(n);
    for i in 0..n as u64 {
        let header = match headers.last() {
            None => sample_header(H256::zero(), 0, 0),
            Some(prev) => sample_header(prev.hash(), 4 * i - 3, 4 * i),
        };
        headers.push(header);
    }
    headers
}

pub fn sample_tx(block_number: u64, index: u32) -> L2Transaction {
    let mut raw = vec![0x02, 0xf8];
    raw.extend_from_slice(&block_number.to_be_bytes());
    raw.extend_from_slice(&index.to_be_bytes());
    let raw = Bytes::from(raw);
    L2Transaction {
        hash: codec::hash_bytes(&raw),
        block_number,
        index,
        raw,
    }
}

pub fn sample_l2_header(number: u64, parent_hash: H256) -> L2Header {
    L2Header {
        parent_hash,
        uncles_hash: H256::repeat_byte(0x1d),
        coinbase: Address::repeat_byte(0xc0),
        state_root: H256::from_low_u64_be(0x5000 + number),
        transactions_root: H256::from_low_u64_be(0x7000 + number),
        receipts_root: H256::from_low_u64_be(0x9000 + number),
        logs_bloom: Bloom::zero(),
        difficulty: U256::zero(),
        number,
        gas_limit: U256::from(30_000_000u64),
        gas_used: U256::from(21_000u64),
        timestamp: 1_700_000_000 + 2 * number,
        extra_data: Bytes::from(vec![0xab; 8]),
        mix_hash: H256::zero(),
        nonce: H64::zero(),
        base_fee_per_gas: Some(U256::from(7u64)),
        withdrawals_root: None,
        blob_gas_used: None,
        excess_blob_gas: None,
        parent_beacon_block_root: None,
    }
}

/// Block whose hash is the keccak of its RLP header, as a node would report.
pub fn sample_block(number: u64, parent_hash: H256, tx_count: u32) -> L2Block {
    let header = sample_l2_header(number, parent_hash);
    L2Block {
        hash: codec::hash_bytes(&codec::encode_l2_header(&header)),
        header,
        transactions: (0..tx_count).map(|i| sample_tx(number, i)).collect(),
    }
}

/// Linked blocks `from..=to`, each carrying `tx_count` transactions.
pub fn chain_of_blocks(from: u64, to: u64, tx_count: u32) -> Vec<L2Block> {
    let mut parent = H256::from_low_u64_be(from.saturating_sub(1));
    let mut blocks = Vec::new();
    for number in from..=to {
        let block = sample_block(number, parent, tx_count);
        parent = block.hash;
        blocks.push(block);
    }
    blocks
}

/// DA network held in memory. Commitments are the keccak of the blob.
#[derive(Default)]
pub struct FakeDa {
    blobs: Mutex<HashMap<DaPointer, Bytes>>,
    next_height: AtomicU64,
    fail_publishes: AtomicU32,
    publishes: AtomicU32,
    /// When set, proofs are built over this blob instead of the stored one.
    proof_blob: Mutex<Option<Bytes>>,
}

impl FakeDa {
    pub fn new() -> Self {
        Self {
            next_height: AtomicU64::new(100),
            ..Default::default()
        }
    }

    /// The next `n` publishes fail with `DaUnavailable`.
    pub fn fail_next_publishes(&self, n: u32) {
        self.fail_publishes.store(n, Ordering::SeqCst);
    }

    pub fn publish_count(&self) -> u32 {
        self.publishes.load(Ordering::SeqCst)
    }

    pub fn blob(&self, pointer: &DaPointer) -> Option<Bytes> {
        lock(&self.blobs).get(pointer).cloned()
    }

    /// Answers later proof requests with proofs built over `blob`.
    pub fn serve_proofs_over(&self, blob: Bytes) {
        *lock(&self.proof_blob) = Some(blob);
    }
}

#[async_trait]
impl DaClient for FakeDa {
    async fn publish(&self, blob: Bytes) -> Result<DaPointer> {
        let failing = self
            .fail_publishes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::DaUnavailable("injected failure".into()));
        }

        let pointer = DaPointer {
            namespace: test_namespace(),
            height: self.next_height.fetch_add(1, Ordering::SeqCst),
            commitment: codec::hash_bytes(&blob),
        };
        lock(&self.blobs).insert(pointer, blob);
        self.publishes.fetch_add(1, Ordering::SeqCst);
        Ok(pointer)
    }

    async fn fetch(&self, pointer: &DaPointer) -> Result<Bytes> {
        self.blob(pointer)
            .ok_or_else(|| Error::DaNotFound(format!("{pointer:?}")))
    }

    async fn get_inclusion_proof(
        &self,
        pointer: &DaPointer,
        element: ElementIndex,
    ) -> Result<DaProof> {
        let forged = lock(&self.proof_blob).clone();
        let blob = match forged {
            Some(blob) => blob,
            None => self.fetch(pointer).await?,
        };
        build_element_proof(*pointer, &blob, element, serde_json::Value::Null)
    }
}

/// L2 node held in memory. Records every block number it is asked for.
#[derive(Default)]
pub struct FakeL2 {
    blocks: Mutex<BTreeMap<u64, L2Block>>,
    requested: Mutex<Vec<u64>>,
    fail_calls: AtomicU32,
}

impl FakeL2 {
    pub fn with_blocks(blocks: impl IntoIterator<Item = L2Block>) -> Self {
        let fake = Self::default();
        fake.extend(blocks);
        fake
    }

    pub fn extend(&self, blocks: impl IntoIterator<Item = L2Block>) {
        let mut map = lock(&self.blocks);
        for block in blocks {
            map.insert(block.number(), block);
        }
    }

    pub fn remove(&self, number: u64) {
        lock(&self.blocks).remove(&number);
    }

    pub fn requested(&self) -> Vec<u64> {
        lock(&self.requested).clone()
    }

    /// The next `n` calls fail with `RpcUnavailable`.
    pub fn fail_next_calls(&self, n: u32) {
        self.fail_calls.store(n, Ordering::SeqCst);
    }

    fn injected_failure(&self) -> Result<()> {
        match self
            .fail_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(_) => Err(Error::RpcUnavailable("injected failure".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl L2Chain for FakeL2 {
    async fn get_block(&self, at: BlockRef) -> Result<L2Block> {
        self.injected_failure()?;
        let blocks = lock(&self.blocks);
        let found = match at {
            BlockRef::Number(n) => {
                lock(&self.requested).push(n);
                blocks.get(&n).cloned()
            }
            BlockRef::Hash(h) => blocks.values().find(|b| b.hash == h).cloned(),
        };
        found.ok_or_else(|| Error::BlockNotFound(at.to_string()))
    }

    async fn get_latest_height(&self) -> Result<u64> {
        self.injected_failure()?;
        Ok(lock(&self.blocks)
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default())
    }

    async fn get_transaction(&self, hash: H256) -> Result<L2Transaction> {
        lock(&self.blocks)
            .values()
            .flat_map(|b| b.transactions.iter())
            .find(|tx| tx.hash == hash)
            .cloned()
            .ok_or(Error::TransactionNotFound(hash))
    }
}

/// Settlement chain held in memory.
pub struct FakeL1 {
    headers: Mutex<Vec<CanonicalHeader>>,
    requested: Mutex<Vec<HeaderRef>>,
    submissions: Mutex<Vec<(H256, DaProof, DefenseAux)>>,
    submit_error: Mutex<Option<Error>>,
    status: Mutex<SubmissionStatus>,
}

impl FakeL1 {
    pub fn new(headers: Vec<CanonicalHeader>) -> Self {
        Self {
            headers: Mutex::new(headers),
            requested: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            submit_error: Mutex::new(None),
            status: Mutex::new(SubmissionStatus::Unknown),
        }
    }

    pub fn push(&self, header: CanonicalHeader) {
        lock(&self.headers).push(header);
    }

    /// Index lookups made so far.
    pub fn requested_indices(&self) -> Vec<u64> {
        lock(&self.requested)
            .iter()
            .filter_map(|r| match r {
                HeaderRef::Index(i) => Some(*i),
                HeaderRef::Hash(_) => None,
            })
            .collect()
    }

    pub fn submissions(&self) -> Vec<(H256, DaProof, DefenseAux)> {
        lock(&self.submissions).clone()
    }

    /// Makes every later submission fail with `err` after being recorded.
    pub fn fail_submissions_with(&self, err: Error) {
        *lock(&self.submit_error) = Some(err);
    }

    pub fn set_status(&self, status: SubmissionStatus) {
        *lock(&self.status) = status;
    }
}

pub fn fake_tx_hash(bundle: H256, aux: &DefenseAux) -> H256 {
    let mut data = bundle.as_bytes().to_vec();
    data.extend_from_slice(aux.datum.as_bytes());
    codec::hash_bytes(&data)
}

#[async_trait]
impl L1Chain for FakeL1 {
    async fn get_committed_header(&self, at: HeaderRef) -> Result<CanonicalHeader> {
        lock(&self.requested).push(at);
        let headers = lock(&self.headers);
        let found = match at {
            HeaderRef::Index(i) => headers.get(i as usize).cloned(),
            HeaderRef::Hash(h) => headers.iter().find(|hd| hd.hash() == h).cloned(),
        };
        found.ok_or_else(|| Error::HeaderNotFound(at.to_string()))
    }

    async fn get_latest_committed_height(&self) -> Result<u64> {
        let len = lock(&self.headers).len() as u64;
        len.checked_sub(1)
            .ok_or_else(|| Error::HeaderNotFound("empty chain".into()))
    }

    async fn submit_defense(
        &self,
        target_bundle_hash: H256,
        proof: &DaProof,
        aux: DefenseAux,
    ) -> Result<TxHandle> {
        lock(&self.submissions).push((target_bundle_hash, proof.clone(), aux));
        if let Some(err) = lock(&self.submit_error).clone() {
            return Err(err);
        }
        Ok(TxHandle {
            tx_hash: fake_tx_hash(target_bundle_hash, &aux),
        })
    }

    async fn submission_status(&self, _tx_hash: H256) -> Result<SubmissionStatus> {
        Ok(*lock(&self.status))
    }
}
