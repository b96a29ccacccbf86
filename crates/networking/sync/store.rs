//! Storage collaborators consumed by the fetchers.
//!
//! The sync engine never touches the database directly: blocks and receipts
//! go through a [`ChainStore`], state leaves and trie nodes through a
//! [`StateStore`]. Both are implemented outside this crate.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::{AccountState, Block, BlockHeader, H256, Receipt, U256};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{0}")]
    Custom(String),
    #[error("Missing header for block {0}")]
    MissingHeader(u64),
}

#[async_trait]
pub trait ChainStore: Send + Sync + 'static {
    /// Number of the highest block stored locally
    async fn latest_block_number(&self) -> Result<u64, StoreError>;

    async fn block_header(&self, number: u64) -> Result<Option<BlockHeader>, StoreError>;

    /// Appends contiguous blocks to the chain and returns how many of them,
    /// counted from the first, were accepted.
    async fn put_blocks(&self, blocks: Vec<Block>) -> Result<usize, StoreError>;

    async fn put_receipts(&self, receipts: Vec<(H256, Vec<Receipt>)>) -> Result<(), StoreError>;
}

/// Downstream data of already stored accounts that is not complete locally.
/// Lets a restarted snap sync finish the work of accounts stored earlier.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingAccountData {
    /// `(account hash, storage root)` of accounts whose storage trie does not
    /// match their storage root yet
    pub storage: Vec<(H256, H256)>,
    /// Code hashes referenced by stored accounts without a stored bytecode
    pub codes: Vec<H256>,
}

impl MissingAccountData {
    pub fn is_empty(&self) -> bool {
        self.storage.is_empty() && self.codes.is_empty()
    }
}

#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    /// Root of the locally built state trie
    async fn state_root(&self) -> Result<H256, StoreError>;

    /// Highest account hash already stored, `None` if no account was stored yet
    async fn last_account_hash(&self) -> Result<Option<H256>, StoreError>;

    /// Verifies an account range against `root` and returns whether more
    /// accounts exist to the right of the last returned one.
    fn verify_account_range(
        &self,
        root: H256,
        origin: H256,
        accounts: &[(H256, AccountState)],
        proof: &[Bytes],
    ) -> Result<bool, String>;

    /// Verifies one storage range against `storage_root`, same contract as
    /// [`StateStore::verify_account_range`].
    fn verify_storage_range(
        &self,
        storage_root: H256,
        origin: H256,
        slots: &[(H256, U256)],
        proof: &[Bytes],
    ) -> Result<bool, String>;

    async fn put_accounts(&self, accounts: Vec<(H256, AccountState)>) -> Result<(), StoreError>;

    /// Storage tries and bytecodes still missing for the accounts stored so far
    async fn missing_account_data(&self) -> Result<MissingAccountData, StoreError>;

    async fn put_storage(
        &self,
        account_hash: H256,
        slots: Vec<(H256, U256)>,
    ) -> Result<(), StoreError>;

    async fn put_codes(&self, codes: Vec<(H256, Bytes)>) -> Result<(), StoreError>;

    async fn put_trie_nodes(&self, nodes: Vec<(H256, Bytes)>) -> Result<(), StoreError>;

    async fn has_trie_node(&self, hash: H256) -> Result<bool, StoreError>;

    /// Hashes referenced by `node` that are not stored locally yet
    async fn missing_children(&self, node: &Bytes) -> Result<Vec<H256>, StoreError>;
}
