//! Account ranges of the snap target state.
//!
//! The account hash space is split into contiguous chunks requested in
//! parallel. Results are stored in key order, so the stored accounts always
//! form a proven prefix and a restarted sync resumes right after the last
//! stored account. Storing accounts discovers the storage tries and bytecodes
//! to download next, which are fed to the other snap fetchers. On start, the
//! storage and code still missing for accounts stored earlier are fed as well.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::config::SyncConfig;
use crate::error::FetcherError;
use crate::peer::{Snap, SnapPeer};
use crate::store::{StateStore, StoreError};
use crate::types::{AccountState, H256, HASH_MAX, next_hash, split_key_space};

use super::bytecode::ByteCodeTask;
use super::progress::SnapProgress;
use super::storage::StorageTask;
use super::trie_node::TrieNodeTask;
use super::{FetcherKind, Job, JobHandler, StoreReport, TaskSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccountTask {
    pub origin: H256,
    pub limit: H256,
}

impl fmt::Display for AccountTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}..={:#x}", self.origin, self.limit)
    }
}

#[derive(Debug)]
pub struct AccountRange {
    pub accounts: Vec<(H256, AccountState)>,
    /// Whether the proof says more accounts exist past the last one
    pub more: bool,
}

/// Task feeds of the fetchers downstream of the account fetcher
#[derive(Debug)]
pub struct SnapFeeds {
    pub storage: TaskSender<StorageTask>,
    pub byte_codes: TaskSender<ByteCodeTask>,
    pub trie_nodes: TaskSender<TrieNodeTask>,
}

pub struct AccountFetcher<S: StateStore> {
    state: Arc<S>,
    progress: Arc<SnapProgress>,
    chunks: usize,
    response_bytes: u64,
    storage_batch: usize,
    code_batch: usize,
    /// Dropped once all accounts are stored, which lets the downstream fetchers finish
    feeds: Mutex<Option<SnapFeeds>>,
    seen_codes: Mutex<HashSet<H256>>,
}

impl<S: StateStore> AccountFetcher<S> {
    pub fn new(
        state: Arc<S>,
        progress: Arc<SnapProgress>,
        feeds: SnapFeeds,
        config: &SyncConfig,
    ) -> Self {
        Self {
            state,
            progress,
            chunks: config.account_range_chunks,
            response_bytes: config.max_response_bytes,
            storage_batch: config.storage_accounts_per_request,
            code_batch: config.byte_codes_per_request,
            feeds: Mutex::new(Some(feeds)),
            seen_codes: Mutex::new(HashSet::new()),
        }
    }

    fn feeds(&self) -> MutexGuard<'_, Option<SnapFeeds>> {
        self.feeds.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn storage_tasks(&self, accounts: &[(H256, H256)]) -> Vec<StorageTask> {
        accounts
            .chunks(self.storage_batch.max(1))
            .map(|accounts| StorageTask {
                accounts: accounts.to_vec(),
                origin: H256::zero(),
            })
            .collect()
    }

    /// Bytecode tasks for the code hashes not requested yet in this attempt
    fn code_tasks(&self, code_hashes: impl IntoIterator<Item = H256>) -> Vec<ByteCodeTask> {
        let new_codes: Vec<H256> = {
            let mut seen = self
                .seen_codes
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            code_hashes
                .into_iter()
                .filter(|code_hash| seen.insert(*code_hash))
                .collect()
        };
        new_codes
            .chunks(self.code_batch.max(1))
            .map(|hashes| ByteCodeTask {
                hashes: hashes.to_vec(),
            })
            .collect()
    }

    /// Storage and bytecode tasks for freshly stored accounts
    fn downstream_tasks(
        &self,
        accounts: &[(H256, AccountState)],
    ) -> (Vec<StorageTask>, Vec<ByteCodeTask>) {
        let with_storage: Vec<(H256, H256)> = accounts
            .iter()
            .filter(|(_, account)| account.has_storage())
            .map(|(hash, account)| (*hash, account.storage_root))
            .collect();
        let codes = accounts
            .iter()
            .filter(|(_, account)| account.has_code())
            .map(|(_, account)| account.code_hash);
        (self.storage_tasks(&with_storage), self.code_tasks(codes))
    }

    fn feed_downstream(&self, storage: Vec<StorageTask>, byte_codes: Vec<ByteCodeTask>) {
        if let Some(feeds) = self.feeds().as_ref() {
            // Downstream fetchers are only gone when the attempt is being torn down
            if feeds.storage.send(storage).is_err() || feeds.byte_codes.send(byte_codes).is_err()
            {
                debug!("Downstream snap fetcher stopped, dropping discovered tasks");
            }
        }
    }

    /// Re-feeds the storage and bytecodes that accounts stored by an earlier
    /// attempt still lack
    async fn feed_missing(&self) -> Result<(), StoreError> {
        let missing = self.state.missing_account_data().await?;
        if missing.is_empty() {
            return Ok(());
        }
        info!(
            storage_tries = missing.storage.len(),
            byte_codes = missing.codes.len(),
            "Resuming downstream snap work of stored accounts"
        );
        let storage = self.storage_tasks(&missing.storage);
        let byte_codes = self.code_tasks(missing.codes);
        self.feed_downstream(storage, byte_codes);
        Ok(())
    }
}

#[async_trait]
impl<S: StateStore> JobHandler for AccountFetcher<S> {
    type Task = AccountTask;
    type Response = AccountRange;
    type Output = Vec<(H256, AccountState)>;
    type Capability = Snap;

    const KIND: FetcherKind = FetcherKind::Account;

    async fn tasks(&self) -> Result<Vec<AccountTask>, StoreError> {
        self.feed_missing().await?;
        let start = match self.state.last_account_hash().await? {
            Some(last) => match next_hash(last) {
                Some(start) => start,
                // The whole key space is stored already
                None => return Ok(vec![]),
            },
            None => H256::zero(),
        };
        if !start.is_zero() {
            info!(start = ?start, "Resuming account download");
        }
        Ok(split_key_space(start, HASH_MAX, self.chunks)
            .into_iter()
            .map(|(origin, limit)| AccountTask { origin, limit })
            .collect())
    }

    async fn request(
        &self,
        job: &Job<AccountTask, Vec<(H256, AccountState)>>,
        peer: &SnapPeer,
    ) -> Result<AccountRange, FetcherError> {
        let origin = match job.partial.as_ref().and_then(|accounts| accounts.last()) {
            Some((last, _)) => match next_hash(*last) {
                Some(origin) => origin,
                None => {
                    return Ok(AccountRange {
                        accounts: vec![],
                        more: false,
                    });
                }
            },
            None => job.task.origin,
        };
        let root = self.progress.target().root;
        let (accounts, proof) = peer
            .account_range(root, origin, job.task.limit, self.response_bytes)
            .await?;
        if accounts.is_empty() && proof.is_empty() {
            return Err(FetcherError::EmptyResponse);
        }
        if accounts.first().is_some_and(|(hash, _)| *hash < origin)
            || accounts.windows(2).any(|pair| pair[0].0 >= pair[1].0)
        {
            return Err(FetcherError::InvalidResponse(
                "account hashes are not ascending from the origin".to_string(),
            ));
        }
        let more = self
            .state
            .verify_account_range(root, origin, &accounts, &proof)
            .map_err(FetcherError::InvalidResponse)?;
        debug!(peer = %peer.id(), accounts = accounts.len(), more, "Received account range");
        Ok(AccountRange { accounts, more })
    }

    fn process(
        &self,
        job: &mut Job<AccountTask, Vec<(H256, AccountState)>>,
        range: AccountRange,
    ) -> Result<Option<Vec<(H256, AccountState)>>, FetcherError> {
        let limit = job.task.limit;
        let reached_limit = range.accounts.last().is_some_and(|(hash, _)| *hash >= limit);
        let progressed = !range.accounts.is_empty();
        // Accounts past the limit belong to the next chunk
        let accounts = range
            .accounts
            .into_iter()
            .filter(|(hash, _)| *hash <= limit)
            .collect();
        job.merge(accounts);

        if !range.more || reached_limit {
            return Ok(Some(job.partial.take().unwrap_or_default()));
        }
        if !progressed {
            return Err(FetcherError::InvalidResponse(
                "proof claims more accounts but none were returned".to_string(),
            ));
        }
        Ok(None)
    }

    async fn store(
        &self,
        _task: &AccountTask,
        accounts: Vec<(H256, AccountState)>,
    ) -> Result<StoreReport<AccountTask>, StoreError> {
        let (storage, byte_codes) = self.downstream_tasks(&accounts);
        let items = accounts.len();
        self.state.put_accounts(accounts).await?;
        self.feed_downstream(storage, byte_codes);
        Ok(StoreReport::items(items))
    }

    async fn on_complete(&self) -> Result<(), StoreError> {
        let root = self.progress.target().root;
        let heal_root = !self.state.has_trie_node(root).await?;
        self.progress.mark_done(FetcherKind::Account);
        if let Some(feeds) = self.feeds().take() {
            if heal_root {
                info!(root = ?root, "State trie root missing locally, healing");
                let _ = feeds.trie_nodes.send(vec![TrieNodeTask { hashes: vec![root] }]);
            }
        }
        Ok(())
    }
}
