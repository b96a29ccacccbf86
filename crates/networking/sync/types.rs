//! Chain primitives moved around by the sync engine.
//!
//! Values arrive already decoded from the wire codec, the engine only needs
//! the fields that take part in validation and linkage.

use bytes::Bytes;
pub use ethereum_types::{BigEndianHash, H256, U256};
use sha3::{Digest, Keccak256};

/// keccak256 of the RLP encoding of an empty trie
pub const EMPTY_TRIE_HASH: H256 = H256([
    0x56, 0xe8, 0x1f, 0x17, 0x1b, 0xcc, 0x55, 0xa6, 0xff, 0x83, 0x45, 0xe6, 0x92, 0xc0, 0xf8, 0x6e,
    0x5b, 0x48, 0xe0, 0x1b, 0x99, 0x6c, 0xad, 0xc0, 0x01, 0x62, 0x2f, 0xb5, 0xe3, 0x63, 0xb4, 0x21,
]);

/// keccak256 of the RLP encoding of an empty list of ommers
pub const EMPTY_OMMERS_HASH: H256 = H256([
    0x1d, 0xcc, 0x4d, 0xe8, 0xde, 0xc7, 0x5d, 0x7a, 0xab, 0x85, 0xb5, 0x67, 0xb6, 0xcc, 0xd4, 0x1a,
    0xd3, 0x12, 0x45, 0x1b, 0x94, 0x8a, 0x74, 0x13, 0xf0, 0xa1, 0x42, 0xfd, 0x40, 0xd4, 0x93, 0x47,
]);

/// keccak256 of empty bytes, the code hash of accounts without code
pub const EMPTY_KECCAK_HASH: H256 = H256([
    0xc5, 0xd2, 0x46, 0x01, 0x86, 0xf7, 0x23, 0x3c, 0x92, 0x7e, 0x7d, 0xb2, 0xdc, 0xc7, 0x03, 0xc0,
    0xe5, 0x00, 0xb6, 0x53, 0xca, 0x82, 0x27, 0x3b, 0x7b, 0xfa, 0xd8, 0x04, 0x5d, 0x85, 0xa4, 0x70,
]);

/// Highest key of the account and storage hash spaces
pub const HASH_MAX: H256 = H256([0xFF; 32]);

pub fn keccak(data: impl AsRef<[u8]>) -> H256 {
    H256::from_slice(&Keccak256::digest(data.as_ref()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub parent_hash: H256,
    pub ommers_hash: H256,
    pub state_root: H256,
    pub transactions_root: H256,
    pub receipts_root: H256,
    pub number: u64,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub timestamp: u64,
    pub extra_data: Bytes,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            parent_hash: H256::zero(),
            ommers_hash: EMPTY_OMMERS_HASH,
            state_root: EMPTY_TRIE_HASH,
            transactions_root: EMPTY_TRIE_HASH,
            receipts_root: EMPTY_TRIE_HASH,
            number: 0,
            gas_limit: 0,
            gas_used: 0,
            timestamp: 0,
            extra_data: Bytes::new(),
        }
    }
}

impl BlockHeader {
    /// Identity hash of the header, the value children reference as `parent_hash`
    pub fn hash(&self) -> H256 {
        let mut hasher = Keccak256::new();
        hasher.update(self.parent_hash.as_bytes());
        hasher.update(self.ommers_hash.as_bytes());
        hasher.update(self.state_root.as_bytes());
        hasher.update(self.transactions_root.as_bytes());
        hasher.update(self.receipts_root.as_bytes());
        hasher.update(self.number.to_be_bytes());
        hasher.update(self.gas_limit.to_be_bytes());
        hasher.update(self.gas_used.to_be_bytes());
        hasher.update(self.timestamp.to_be_bytes());
        hasher.update(&self.extra_data);
        H256::from_slice(&hasher.finalize())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockBody {
    /// Encoded transactions, opaque to the sync engine
    pub transactions: Vec<Bytes>,
    pub ommers: Vec<BlockHeader>,
    pub withdrawals: Option<Vec<Bytes>>,
}

impl BlockBody {
    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.ommers.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub header: BlockHeader,
    pub body: BlockBody,
}

impl Block {
    pub fn new(header: BlockHeader, body: BlockBody) -> Self {
        Self { header, body }
    }

    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    pub fn number(&self) -> u64 {
        self.header.number
    }
}

/// Checks the body against the roots its header declares.
///
/// The trie roots themselves are recomputed on import, here we only reject
/// bodies that cannot possibly belong to the header: a non-empty root with
/// no payload, or an empty root with a payload.
pub fn validate_block_body(header: &BlockHeader, body: &BlockBody) -> Result<(), String> {
    let expects_transactions = header.transactions_root != EMPTY_TRIE_HASH;
    if expects_transactions == body.transactions.is_empty() {
        return Err(format!(
            "block {} declares transactions root {:#x} but body has {} transactions",
            header.number,
            header.transactions_root,
            body.transactions.len()
        ));
    }
    let expects_ommers = header.ommers_hash != EMPTY_OMMERS_HASH;
    if expects_ommers == body.ommers.is_empty() {
        return Err(format!(
            "block {} declares ommers hash {:#x} but body has {} ommers",
            header.number,
            header.ommers_hash,
            body.ommers.len()
        ));
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Receipt {
    pub tx_type: u8,
    pub succeeded: bool,
    pub cumulative_gas_used: u64,
    /// Encoded logs, opaque to the sync engine
    pub logs: Vec<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountState {
    pub nonce: u64,
    pub balance: U256,
    pub storage_root: H256,
    pub code_hash: H256,
}

impl Default for AccountState {
    fn default() -> Self {
        Self {
            nonce: 0,
            balance: U256::zero(),
            storage_root: EMPTY_TRIE_HASH,
            code_hash: EMPTY_KECCAK_HASH,
        }
    }
}

impl AccountState {
    pub fn has_storage(&self) -> bool {
        self.storage_root != EMPTY_TRIE_HASH
    }

    pub fn has_code(&self) -> bool {
        self.code_hash != EMPTY_KECCAK_HASH
    }
}

/// Returns the key right after `hash`, or `None` if `hash` is the top of the key space
pub fn next_hash(hash: H256) -> Option<H256> {
    let value = hash.into_uint();
    (value != U256::MAX).then(|| H256::from_uint(&(value + U256::one())))
}

/// Splits the key space `[start, limit]` into at most `chunks` contiguous spans.
/// The last span always ends at `limit`.
pub fn split_key_space(start: H256, limit: H256, chunks: usize) -> Vec<(H256, H256)> {
    let start_value = start.into_uint();
    let limit_value = limit.into_uint();
    if start_value > limit_value {
        return vec![];
    }
    let chunks = U256::from(chunks.max(1));
    let span = (limit_value - start_value) / chunks;

    let mut spans = vec![];
    let mut origin = start_value;
    loop {
        let end = if spans.len() + 1 >= chunks.as_usize() || span.is_zero() {
            limit_value
        } else {
            origin.saturating_add(span).min(limit_value)
        };
        spans.push((H256::from_uint(&origin), H256::from_uint(&end)));
        if end == limit_value {
            break;
        }
        origin = end + U256::one();
    }
    spans
}
