//! Decoded request and response payloads exchanged with peers.
//!
//! The byte framing of these messages belongs to the wire codec, the sync
//! engine only builds requests and consumes already decoded responses.

use bytes::Bytes;

use crate::types::{AccountState, BlockBody, BlockHeader, H256, Receipt, U256};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashOrNumber {
    Hash(H256),
    Number(u64),
}

impl From<H256> for HashOrNumber {
    fn from(value: H256) -> Self {
        Self::Hash(value)
    }
}

impl From<u64> for HashOrNumber {
    fn from(value: u64) -> Self {
        Self::Number(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    GetBlockHeaders {
        start: HashOrNumber,
        limit: u64,
        skip: u64,
        reverse: bool,
    },
    GetBlockBodies {
        hashes: Vec<H256>,
    },
    GetReceipts {
        hashes: Vec<H256>,
    },
    GetAccountRange {
        root: H256,
        origin: H256,
        limit: H256,
        response_bytes: u64,
    },
    GetStorageRanges {
        root: H256,
        accounts: Vec<H256>,
        origin: H256,
        limit: H256,
        response_bytes: u64,
    },
    GetByteCodes {
        hashes: Vec<H256>,
        response_bytes: u64,
    },
    GetTrieNodes {
        root: H256,
        hashes: Vec<H256>,
        response_bytes: u64,
    },
}

/// Request kinds, used to pick timeouts and to label logs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    BlockHeaders,
    BlockBodies,
    Receipts,
    AccountRange,
    StorageRanges,
    ByteCodes,
    TrieNodes,
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestKind::BlockHeaders => "GetBlockHeaders",
            RequestKind::BlockBodies => "GetBlockBodies",
            RequestKind::Receipts => "GetReceipts",
            RequestKind::AccountRange => "GetAccountRange",
            RequestKind::StorageRanges => "GetStorageRanges",
            RequestKind::ByteCodes => "GetByteCodes",
            RequestKind::TrieNodes => "GetTrieNodes",
        };
        f.write_str(name)
    }
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        match self {
            Request::GetBlockHeaders { .. } => RequestKind::BlockHeaders,
            Request::GetBlockBodies { .. } => RequestKind::BlockBodies,
            Request::GetReceipts { .. } => RequestKind::Receipts,
            Request::GetAccountRange { .. } => RequestKind::AccountRange,
            Request::GetStorageRanges { .. } => RequestKind::StorageRanges,
            Request::GetByteCodes { .. } => RequestKind::ByteCodes,
            Request::GetTrieNodes { .. } => RequestKind::TrieNodes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    BlockHeaders(Vec<BlockHeader>),
    BlockBodies(Vec<BlockBody>),
    Receipts(Vec<Vec<Receipt>>),
    AccountRange {
        accounts: Vec<(H256, AccountState)>,
        proof: Vec<Bytes>,
    },
    StorageRanges {
        slots: Vec<Vec<(H256, U256)>>,
        proof: Vec<Bytes>,
    },
    ByteCodes(Vec<Bytes>),
    TrieNodes(Vec<Bytes>),
}

impl Response {
    /// The request kind this response answers
    pub fn kind(&self) -> RequestKind {
        match self {
            Response::BlockHeaders(_) => RequestKind::BlockHeaders,
            Response::BlockBodies(_) => RequestKind::BlockBodies,
            Response::Receipts(_) => RequestKind::Receipts,
            Response::AccountRange { .. } => RequestKind::AccountRange,
            Response::StorageRanges { .. } => RequestKind::StorageRanges,
            Response::ByteCodes(_) => RequestKind::ByteCodes,
            Response::TrieNodes(_) => RequestKind::TrieNodes,
        }
    }
}
