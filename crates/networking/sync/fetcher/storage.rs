//! Storage slots of the accounts discovered by the account fetcher.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::FetcherError;
use crate::peer::{Snap, SnapPeer};
use crate::store::{StateStore, StoreError};
use crate::types::{H256, HASH_MAX, U256, next_hash};

use super::progress::SnapProgress;
use super::{FetcherKind, Job, JobHandler, StoreReport};

/// A batch of accounts with their storage roots. `origin` applies to the
/// first account only, the rest are fetched from the start of their key space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageTask {
    pub accounts: Vec<(H256, H256)>,
    pub origin: H256,
}

impl fmt::Display for StorageTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.accounts.first() {
            Some((first, _)) => write!(
                f,
                "{} storage tries from account {first:#x}",
                self.accounts.len()
            ),
            None => write!(f, "no storage tries"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountStorage {
    pub account_hash: H256,
    pub slots: Vec<(H256, U256)>,
    /// False while the proof says more slots exist past the last one
    pub complete: bool,
}

pub struct StorageFetcher<S: StateStore> {
    state: Arc<S>,
    progress: Arc<SnapProgress>,
    response_bytes: u64,
}

impl<S: StateStore> StorageFetcher<S> {
    pub fn new(state: Arc<S>, progress: Arc<SnapProgress>, config: &SyncConfig) -> Self {
        Self {
            state,
            progress,
            response_bytes: config.max_response_bytes,
        }
    }
}

/// Accounts still to request and the slot to start the first one from
fn remaining(job: &Job<StorageTask, Vec<AccountStorage>>) -> (usize, H256) {
    match job.partial.as_ref().and_then(|received| received.last()) {
        Some(last) if !last.complete => {
            let origin = last
                .slots
                .last()
                .and_then(|(slot, _)| next_hash(*slot))
                .unwrap_or(HASH_MAX);
            (job.partial_len() - 1, origin)
        }
        Some(_) => (job.partial_len(), H256::zero()),
        None => (0, job.task.origin),
    }
}

fn is_ascending_from(slots: &[(H256, U256)], origin: H256) -> bool {
    slots.first().is_none_or(|(slot, _)| *slot >= origin)
        && slots.windows(2).all(|pair| pair[0].0 < pair[1].0)
}

#[async_trait]
impl<S: StateStore> JobHandler for StorageFetcher<S> {
    type Task = StorageTask;
    type Response = Vec<AccountStorage>;
    type Output = Vec<AccountStorage>;
    type Capability = Snap;

    const KIND: FetcherKind = FetcherKind::Storage;

    async fn tasks(&self) -> Result<Vec<StorageTask>, StoreError> {
        Ok(vec![])
    }

    async fn request(
        &self,
        job: &Job<StorageTask, Vec<AccountStorage>>,
        peer: &SnapPeer,
    ) -> Result<Vec<AccountStorage>, FetcherError> {
        let (skip, origin) = remaining(job);
        let accounts = &job.task.accounts[skip..];
        let root = self.progress.target().root;
        let (ranges, proof) = peer
            .storage_ranges(
                root,
                accounts.iter().map(|(hash, _)| *hash).collect(),
                origin,
                HASH_MAX,
                self.response_bytes,
            )
            .await?;
        if ranges.is_empty() {
            return Err(FetcherError::EmptyResponse);
        }
        if ranges.len() > accounts.len() {
            return Err(FetcherError::InvalidResponse(format!(
                "requested storage of {} accounts, got {}",
                accounts.len(),
                ranges.len()
            )));
        }

        let last = ranges.len() - 1;
        let mut received = Vec::with_capacity(ranges.len());
        for (i, (slots, (account_hash, storage_root))) in
            ranges.into_iter().zip(accounts.iter()).enumerate()
        {
            let range_origin = if i == 0 { origin } else { H256::zero() };
            if !is_ascending_from(&slots, range_origin) {
                return Err(FetcherError::InvalidResponse(format!(
                    "storage slots of account {account_hash:#x} are not ascending"
                )));
            }
            // Only the trailing range comes with a proof and may be incomplete
            let range_proof: &[Bytes] = if i == last { &proof } else { &[] };
            let more = self
                .state
                .verify_storage_range(*storage_root, range_origin, &slots, range_proof)
                .map_err(FetcherError::InvalidResponse)?;
            if more && slots.is_empty() {
                return Err(FetcherError::InvalidResponse(format!(
                    "proof claims more slots for account {account_hash:#x} but none were returned"
                )));
            }
            received.push(AccountStorage {
                account_hash: *account_hash,
                slots,
                complete: !more,
            });
        }
        debug!(peer = %peer.id(), accounts = received.len(), "Received storage ranges");
        Ok(received)
    }

    fn process(
        &self,
        job: &mut Job<StorageTask, Vec<AccountStorage>>,
        response: Vec<AccountStorage>,
    ) -> Result<Option<Vec<AccountStorage>>, FetcherError> {
        let expected = job.task.accounts.len();
        let partial = job.partial.get_or_insert_with(Vec::new);
        let mut response = response.into_iter();

        // A continued account extends the ranges received for it so far
        if let Some(last) = partial.last_mut().filter(|last| !last.complete) {
            if let Some(continued) = response.next() {
                if continued.account_hash != last.account_hash {
                    return Err(FetcherError::InvalidResponse(
                        "storage continuation for a different account".to_string(),
                    ));
                }
                last.slots.extend(continued.slots);
                last.complete = continued.complete;
            }
        }
        partial.extend(response);

        let done = partial.len() == expected && partial.last().is_some_and(|last| last.complete);
        if done {
            return Ok(job.partial.take());
        }
        Ok(None)
    }

    async fn store(
        &self,
        _task: &StorageTask,
        storages: Vec<AccountStorage>,
    ) -> Result<StoreReport<StorageTask>, StoreError> {
        let mut slots = 0;
        for storage in storages {
            slots += storage.slots.len();
            self.state
                .put_storage(storage.account_hash, storage.slots)
                .await?;
        }
        Ok(StoreReport::items(slots))
    }

    fn ordered(&self) -> bool {
        false
    }

    fn wait_for_feed(&self) -> bool {
        true
    }

    async fn on_complete(&self) -> Result<(), StoreError> {
        self.progress.mark_done(FetcherKind::Storage);
        Ok(())
    }
}
