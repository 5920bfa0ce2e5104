//! Deterministic encodings shared by every hashing site.
//!
//! Committed headers use the settlement contract's ABI layout and are hashed
//! with keccak256. L2 headers are RLP encoded the Ethereum way, and their
//! canonical hash is always taken with `extra_data` cleared. Bundle blobs are
//! an RLP list of `[header, [raw tx, ...]]` items.

use ethers::abi::{self, ParamType, Token};
use ethers::types::{Bytes, H256, U256};
use ethers::utils::keccak256;
use ethers::utils::rlp::{DecoderError, Rlp, RlpStream};

use crate::error::{Error, Result};
use crate::types::{
    CanonicalHeader, DaPointer, ElementIndex, L2Block, L2Header, L2Transaction, Namespace,
    NAMESPACE_LEN,
};

/// Every header field is a static ABI type, one 32 byte word each.
pub const ENCODED_HEADER_LEN: usize = 8 * 32;

/// Number of mandatory fields in an Ethereum header list.
const BASE_HEADER_FIELDS: usize = 15;

fn header_params() -> [ParamType; 8] {
    [
        ParamType::FixedBytes(32),
        ParamType::Uint(64),
        ParamType::Uint(64),
        ParamType::FixedBytes(32),
        ParamType::FixedBytes(NAMESPACE_LEN),
        ParamType::Uint(64),
        ParamType::FixedBytes(32),
        ParamType::Uint(64),
    ]
}

pub fn encode_header(header: &CanonicalHeader) -> Bytes {
    abi::encode(&[
        Token::FixedBytes(header.parent_hash.as_bytes().to_vec()),
        Token::Uint(header.block_range_start.into()),
        Token::Uint(header.block_range_end.into()),
        Token::FixedBytes(header.l2_state_root.as_bytes().to_vec()),
        Token::FixedBytes(header.da_pointer.namespace.as_bytes().to_vec()),
        Token::Uint(header.da_pointer.height.into()),
        Token::FixedBytes(header.da_pointer.commitment.as_bytes().to_vec()),
        Token::Uint(header.timestamp.into()),
    ])
    .into()
}

/// Decodes an ABI encoded header.
///
/// Only the exact canonical encoding is accepted: dirty padding or trailing
/// bytes are rejected rather than normalized, so a header has one byte form.
pub fn decode_header(data: &[u8]) -> Result<CanonicalHeader> {
    if data.len() != ENCODED_HEADER_LEN {
        return Err(Error::MalformedHeader(format!(
            "expected {ENCODED_HEADER_LEN} bytes, got {}",
            data.len()
        )));
    }

    let tokens =
        abi::decode(&header_params(), data).map_err(|e| Error::MalformedHeader(e.to_string()))?;
    let mut tokens = tokens.into_iter();

    let parent_hash = H256(next_fixed(&mut tokens, "parentHash")?);
    let block_range_start = next_u64(&mut tokens, "blockRangeStart")?;
    let block_range_end = next_u64(&mut tokens, "blockRangeEnd")?;
    let l2_state_root = H256(next_fixed(&mut tokens, "l2StateRoot")?);
    let namespace = Namespace::from_bytes(next_fixed(&mut tokens, "namespace")?);
    let height = next_u64(&mut tokens, "daHeight")?;
    let commitment = H256(next_fixed(&mut tokens, "daCommitment")?);
    let timestamp = next_u64(&mut tokens, "timestamp")?;

    let header = CanonicalHeader {
        parent_hash,
        block_range_start,
        block_range_end,
        l2_state_root,
        da_pointer: DaPointer {
            namespace,
            height,
            commitment,
        },
        timestamp,
    };

    if header.block_range_start > header.block_range_end {
        return Err(Error::MalformedHeader(format!(
            "inverted block range {}-{}",
            header.block_range_start, header.block_range_end
        )));
    }

    if encode_header(&header).as_ref() != data {
        return Err(Error::MalformedHeader("non-canonical encoding".into()));
    }

    Ok(header)
}

fn next_fixed<const N: usize>(
    tokens: &mut impl Iterator<Item = Token>,
    field: &str,
) -> Result<[u8; N]> {
    match tokens.next() {
        Some(Token::FixedBytes(bytes)) if bytes.len() == N => {
            let mut out = [0u8; N];
            out.copy_from_slice(&bytes);
            Ok(out)
        }
        other => Err(Error::MalformedHeader(format!("{field}: unexpected {other:?}"))),
    }
}

fn next_u64(tokens: &mut impl Iterator<Item = Token>, field: &str) -> Result<u64> {
    match tokens.next() {
        Some(Token::Uint(v)) if v <= U256::from(u64::MAX) => Ok(v.as_u64()),
        other => Err(Error::MalformedHeader(format!("{field}: unexpected {other:?}"))),
    }
}

pub fn hash_bytes(data: &[u8]) -> H256 {
    H256(keccak256(data))
}

pub fn header_hash(header: &CanonicalHeader) -> H256 {
    hash_bytes(&encode_header(header))
}

fn append_l2_header(stream: &mut RlpStream, header: &L2Header, extra_data: &[u8]) {
    let optional = [
        header.base_fee_per_gas.is_some(),
        header.withdrawals_root.is_some(),
        header.blob_gas_used.is_some(),
        header.excess_blob_gas.is_some(),
        header.parent_beacon_block_root.is_some(),
    ]
    .iter()
    .filter(|present| **present)
    .count();

    stream.begin_list(BASE_HEADER_FIELDS + optional);
    stream.append(&header.parent_hash);
    stream.append(&header.uncles_hash);
    stream.append(&header.coinbase);
    stream.append(&header.state_root);
    stream.append(&header.transactions_root);
    stream.append(&header.receipts_root);
    stream.append(&header.logs_bloom);
    stream.append(&header.difficulty);
    stream.append(&header.number);
    stream.append(&header.gas_limit);
    stream.append(&header.gas_used);
    stream.append(&header.timestamp);
    stream.append(&extra_data.to_vec());
    stream.append(&header.mix_hash);
    stream.append(&header.nonce);

    if let Some(base_fee) = &header.base_fee_per_gas {
        stream.append(base_fee);
    }
    if let Some(root) = &header.withdrawals_root {
        stream.append(root);
    }
    if let Some(used) = &header.blob_gas_used {
        stream.append(used);
    }
    if let Some(excess) = &header.excess_blob_gas {
        stream.append(excess);
    }
    if let Some(root) = &header.parent_beacon_block_root {
        stream.append(root);
    }
}

/// RLP of the header as served, extra data included.
pub fn encode_l2_header(header: &L2Header) -> Bytes {
    let mut stream = RlpStream::new();
    append_l2_header(&mut stream, header, &header.extra_data);
    stream.out().freeze().into()
}

/// The hash every component uses to identify an L2 header.
pub fn canonical_l2_header_hash(header: &L2Header) -> H256 {
    let mut stream = RlpStream::new();
    append_l2_header(&mut stream, header, &[]);
    hash_bytes(&stream.out())
}

fn decode_l2_header(rlp: &Rlp<'_>) -> std::result::Result<L2Header, DecoderError> {
    let fields = rlp.item_count()?;
    if fields < BASE_HEADER_FIELDS {
        return Err(DecoderError::RlpIncorrectListLen);
    }
    let optional = |idx: usize| fields > idx;

    Ok(L2Header {
        parent_hash: rlp.val_at(0)?,
        uncles_hash: rlp.val_at(1)?,
        coinbase: rlp.val_at(2)?,
        state_root: rlp.val_at(3)?,
        transactions_root: rlp.val_at(4)?,
        receipts_root: rlp.val_at(5)?,
        logs_bloom: rlp.val_at(6)?,
        difficulty: rlp.val_at(7)?,
        number: rlp.val_at(8)?,
        gas_limit: rlp.val_at(9)?,
        gas_used: rlp.val_at(10)?,
        timestamp: rlp.val_at(11)?,
        extra_data: rlp.val_at::<Vec<u8>>(12)?.into(),
        mix_hash: rlp.val_at(13)?,
        nonce: rlp.val_at(14)?,
        base_fee_per_gas: if optional(15) { Some(rlp.val_at(15)?) } else { None },
        withdrawals_root: if optional(16) { Some(rlp.val_at(16)?) } else { None },
        blob_gas_used: if optional(17) { Some(rlp.val_at(17)?) } else { None },
        excess_blob_gas: if optional(18) { Some(rlp.val_at(18)?) } else { None },
        parent_beacon_block_root: if optional(19) { Some(rlp.val_at(19)?) } else { None },
    })
}

/// Serializes a run of blocks into the blob published to the DA network.
pub fn encode_bundle_blob(blocks: &[L2Block]) -> Bytes {
    let mut stream = RlpStream::new_list(blocks.len());
    for block in blocks {
        stream.begin_list(2);
        append_l2_header(&mut stream, &block.header, &block.header.extra_data);
        stream.begin_list(block.transactions.len());
        for tx in &block.transactions {
            stream.append(&tx.raw.to_vec());
        }
    }
    stream.out().freeze().into()
}

pub fn decode_bundle_blob(data: &[u8]) -> Result<Vec<L2Block>> {
    let malformed = |e: DecoderError| Error::MalformedBlob(e.to_string());

    let outer = Rlp::new(data);
    if !outer.is_list() {
        return Err(Error::MalformedBlob("blob is not an RLP list".into()));
    }

    let mut blocks = Vec::with_capacity(outer.item_count().map_err(malformed)?);
    for item in outer.iter() {
        let header_rlp = item.at(0).map_err(malformed)?;
        let header = decode_l2_header(&header_rlp).map_err(malformed)?;
        let hash = hash_bytes(header_rlp.as_raw());

        let mut transactions = Vec::new();
        for (index, tx) in item.at(1).map_err(malformed)?.iter().enumerate() {
            let raw: Bytes = tx.as_val::<Vec<u8>>().map_err(malformed)?.into();
            transactions.push(L2Transaction {
                hash: hash_bytes(&raw),
                block_number: header.number,
                index: index as u32,
                raw,
            });
        }

        blocks.push(L2Block {
            hash,
            header,
            transactions,
        });
    }

    Ok(blocks)
}

/// Every provable datum of a bundle, in blob order: each block's canonical
/// header hash followed by the hashes of its transactions.
pub fn bundle_elements(blocks: &[L2Block]) -> Vec<(ElementIndex, H256)> {
    let mut elements = Vec::new();
    for (b, block) in blocks.iter().enumerate() {
        elements.push((ElementIndex::header(b as u32), block.header.canonical_hash()));
        for (t, tx) in block.transactions.iter().enumerate() {
            elements.push((ElementIndex::transaction(b as u32, t as u32), tx.hash));
        }
    }
    elements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{sample_block, sample_header};

    #[test]
    fn test_header_round_trip() {
        let header = sample_header(H256::repeat_byte(7), 5, 8);
        let encoded = encode_header(&header);
        assert_eq!(encoded.len(), ENCODED_HEADER_LEN);
        assert_eq!(decode_header(&encoded).unwrap(), header);
    }

    #[test]
    fn test_header_hash_is_keccak_of_encoding() {
        let header = sample_header(H256::zero(), 1, 4);
        assert_eq!(header.hash(), H256(keccak256(encode_header(&header))));
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let encoded = encode_header(&sample_header(H256::zero(), 1, 4));
        let err = decode_header(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader(_)));
    }

    #[test]
    fn test_decode_rejects_dirty_padding() {
        let mut encoded = encode_header(&sample_header(H256::zero(), 1, 4)).to_vec();
        // The namespace word is bytes29; its last three bytes are padding.
        encoded[4 * 32 + 31] = 0xff;
        assert!(matches!(
            decode_header(&encoded),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_decode_rejects_inverted_range() {
        let mut header = sample_header(H256::zero(), 1, 4);
        header.block_range_start = 9;
        let encoded = encode_header(&header);
        assert!(matches!(
            decode_header(&encoded),
            Err(Error::MalformedHeader(_))
        ));
    }

    #[test]
    fn test_canonical_hash_ignores_extra_data() {
        let block = sample_block(3, H256::zero(), 0);
        let mut other = block.header.clone();
        other.extra_data = Bytes::from(vec![0xde, 0xad, 0xbe, 0xef]);

        assert_eq!(block.header.canonical_hash(), other.canonical_hash());
        // The raw hash does depend on it.
        assert_ne!(
            hash_bytes(&encode_l2_header(&block.header)),
            hash_bytes(&encode_l2_header(&other))
        );
    }

    #[test]
    fn test_canonical_hash_tracks_semantic_fields() {
        let block = sample_block(3, H256::zero(), 0);
        let mut other = block.header.clone();
        other.state_root = H256::repeat_byte(0x42);
        assert_ne!(block.header.canonical_hash(), other.canonical_hash());
    }

    #[test]
    fn test_bundle_blob_preserves_blocks() {
        let first = sample_block(1, H256::zero(), 2);
        let second = sample_block(2, first.hash, 1);
        let blob = encode_bundle_blob(&[first.clone(), second.clone()]);

        let decoded = decode_bundle_blob(&blob).unwrap();
        assert_eq!(decoded, vec![first, second]);
    }

    #[test]
    fn test_extra_data_and_raw_txs_are_byte_strings() {
        let mut block = sample_block(4, H256::zero(), 1);
        // Long enough to need the long-string RLP form.
        block.header.extra_data = Bytes::from(vec![0x5a; 60]);
        block.transactions[0].raw = Bytes::from(vec![0x02; 200]);

        let encoded = encode_l2_header(&block.header);
        let extra = Rlp::new(&encoded).at(12).unwrap();
        assert!(extra.is_data());
        assert_eq!(extra.data().unwrap(), &[0x5a; 60][..]);

        let mut cleared = block.header.clone();
        cleared.extra_data = Bytes::new();
        assert_eq!(
            block.header.canonical_hash(),
            hash_bytes(&encode_l2_header(&cleared))
        );

        let decoded = decode_bundle_blob(&encode_bundle_blob(&[block.clone()])).unwrap();
        assert_eq!(decoded[0].header.extra_data, block.header.extra_data);
        assert_eq!(decoded[0].transactions[0].raw, block.transactions[0].raw);
    }

    #[test]
    fn test_bundle_blob_rejects_garbage() {
        assert!(matches!(
            decode_bundle_blob(&[0x01, 0x02]),
            Err(Error::MalformedBlob(_))
        ));
    }

    #[test]
    fn test_bundle_elements_order() {
        let first = sample_block(1, H256::zero(), 2);
        let second = sample_block(2, first.hash, 0);
        let elements = bundle_elements(&[first.clone(), second.clone()]);

        assert_eq!(
            elements,
            vec![
                (ElementIndex::header(0), first.header.canonical_hash()),
                (ElementIndex::transaction(0, 0), first.transactions[0].hash),
                (ElementIndex::transaction(0, 1), first.transactions[1].hash),
                (ElementIndex::header(1), second.header.canonical_hash()),
            ]
        );
    }
}
