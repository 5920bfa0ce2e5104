use std::fmt;
use std::str::FromStr;

use ethers::types::{Address, Bloom, Bytes, H256, H64, U256};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec;

/// Size of a DA-layer namespace: one version byte plus a 28 byte id.
pub const NAMESPACE_LEN: usize = 29;

/// Leading zero bytes of a version-0 namespace id.
const V0_ID_PREFIX_LEN: usize = 18;

/// DA-layer namespace, always held in its full 29 byte form.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Namespace([u8; NAMESPACE_LEN]);

impl Namespace {
    pub const fn from_bytes(bytes: [u8; NAMESPACE_LEN]) -> Self {
        Self(bytes)
    }

    /// Builds a version-0 namespace from a user id of at most 10 bytes.
    pub fn v0(id: &[u8]) -> Result<Self, String> {
        let max = NAMESPACE_LEN - 1 - V0_ID_PREFIX_LEN;
        if id.len() > max {
            return Err(format!("v0 namespace id is {} bytes, max {max}", id.len()));
        }
        let mut bytes = [0u8; NAMESPACE_LEN];
        bytes[NAMESPACE_LEN - id.len()..].copy_from_slice(id);
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; NAMESPACE_LEN] {
        &self.0
    }
}

impl FromStr for Namespace {
    type Err = String;

    /// Accepts a full 29 byte namespace or a short version-0 id, hex encoded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim_start_matches("0x")).map_err(|e| e.to_string())?;
        if raw.len() == NAMESPACE_LEN {
            let mut bytes = [0u8; NAMESPACE_LEN];
            bytes.copy_from_slice(&raw);
            return Ok(Self(bytes));
        }
        Self::v0(&raw)
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Namespace(0x{})", hex::encode(self.0))
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl Serialize for Namespace {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Namespace {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Locates a blob within the DA network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DaPointer {
    pub namespace: Namespace,
    /// DA-layer block height the blob was included at.
    pub height: u64,
    /// Blob commitment, unique within `height` and `namespace`.
    pub commitment: H256,
}

/// One committed rollup bundle as recorded on L1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalHeader {
    pub parent_hash: H256,
    /// First L2 block covered, inclusive.
    pub block_range_start: u64,
    /// Last L2 block covered, inclusive.
    pub block_range_end: u64,
    /// State root of the last block in the bundle.
    pub l2_state_root: H256,
    pub da_pointer: DaPointer,
    pub timestamp: u64,
}

impl CanonicalHeader {
    pub fn hash(&self) -> H256 {
        codec::header_hash(self)
    }

    pub fn block_count(&self) -> u64 {
        self.block_range_end - self.block_range_start + 1
    }

    pub fn covers(&self, l2_height: u64) -> bool {
        (self.block_range_start..=self.block_range_end).contains(&l2_height)
    }
}

/// Ethereum-style L2 header as served by the execution node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Header {
    pub parent_hash: H256,
    pub uncles_hash: H256,
    pub coinbase: Address,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub logs_bloom: Bloom,
    pub difficulty: U256,
    pub number: u64,
    pub gas_limit: U256,
    pub gas_used: U256,
    pub timestamp: u64,
    /// Mutable sequencer data. Cleared before canonical hashing.
    pub extra_data: Bytes,
    pub mix_hash: H256,
    pub nonce: H64,
    pub base_fee_per_gas: Option<U256>,
    pub withdrawals_root: Option<H256>,
    pub blob_gas_used: Option<U256>,
    pub excess_blob_gas: Option<U256>,
    pub parent_beacon_block_root: Option<H256>,
}

impl L2Header {
    /// Hash of the header with `extra_data` normalized to empty.
    pub fn canonical_hash(&self) -> H256 {
        codec::canonical_l2_header_hash(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Transaction {
    pub hash: H256,
    pub block_number: u64,
    pub index: u32,
    /// Signed transaction envelope.
    pub raw: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct L2Block {
    /// Hash reported by the L2 node, extra data included.
    pub hash: H256,
    pub header: L2Header,
    pub transactions: Vec<L2Transaction>,
}

impl L2Block {
    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Position of a datum inside a bundle: a block header, or one of its
/// transactions when `tx` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementIndex {
    pub block: u32,
    pub tx: Option<u32>,
}

impl ElementIndex {
    pub fn header(block: u32) -> Self {
        Self { block, tx: None }
    }

    pub fn transaction(block: u32, tx: u32) -> Self {
        Self { block, tx: Some(tx) }
    }

    pub fn is_header(&self) -> bool {
        self.tx.is_none()
    }
}

/// Which kind of datum a defense is allowed to resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatumKind {
    #[default]
    Any,
    Header,
    Transaction,
}

impl DatumKind {
    pub fn accepts(&self, element: &ElementIndex) -> bool {
        match self {
            DatumKind::Any => true,
            DatumKind::Header => element.is_header(),
            DatumKind::Transaction => !element.is_header(),
        }
    }
}

/// Lookup key for a committed header on L1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRef {
    Index(u64),
    Hash(H256),
}

/// Lookup key for an L2 block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRef {
    Number(u64),
    Hash(H256),
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockRef::Number(n) => write!(f, "#{n}"),
            BlockRef::Hash(h) => write!(f, "{h:?}"),
        }
    }
}

impl fmt::Display for HeaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderRef::Index(i) => write!(f, "index {i}"),
            HeaderRef::Hash(h) => write!(f, "{h:?}"),
        }
    }
}

/// Handle to a sent L1 transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxHandle {
    pub tx_hash: H256,
}

/// Outcome of re-querying a submitted transaction by hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SubmissionStatus {
    Pending,
    Included { block: u64, success: bool },
    Unknown,
}

/// Resolved position and datum handed to L1 alongside the proof.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefenseAux {
    pub datum: H256,
    pub element: ElementIndex,
}

/// Summary returned by the query surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupInfo {
    pub latest_l1_height: Option<u64>,
    pub latest_l2_height: u64,
    pub last_committed_header_hash: Option<H256>,
    pub last_bundle_hash: Option<H256>,
    pub updated_at: Option<String>,
}

/// Details of a single committed (or locally bundled) header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub hash: H256,
    pub header: CanonicalHeader,
    /// False for bundles assembled locally but not yet seen on L1.
    pub committed: bool,
}
