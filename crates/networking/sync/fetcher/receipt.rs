//! Receipts for a range of blocks whose headers are already stored locally.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::FetcherError;
use crate::peer::{Eth, EthPeer};
use crate::store::{ChainStore, StoreError};
use crate::types::{BlockHeader, EMPTY_TRIE_HASH, H256, Receipt};

use super::block::{BlockTask, partition};
use super::{FetcherKind, Job, JobHandler, StoreReport};

/// Receipts of one block, keyed by the block hash
pub type BlockReceipts = (H256, Vec<Receipt>);

pub struct ReceiptFetcher<C: ChainStore> {
    chain: Arc<C>,
    first: u64,
    count: u64,
    max_per_request: u64,
}

impl<C: ChainStore> ReceiptFetcher<C> {
    pub fn new(chain: Arc<C>, first: u64, count: u64, max_per_request: u64) -> Self {
        Self {
            chain,
            first,
            count,
            max_per_request,
        }
    }

    async fn local_headers(
        &self,
        task: &BlockTask,
        from: u64,
        count: u64,
    ) -> Result<Vec<BlockHeader>, FetcherError> {
        let mut headers = Vec::with_capacity(count as usize);
        for number in from..from + count {
            let header = self
                .chain
                .block_header(number)
                .await
                .and_then(|header| header.ok_or(StoreError::MissingHeader(number)))
                .map_err(|source| FetcherError::Store {
                    kind: FetcherKind::Receipt,
                    task: task.to_string(),
                    source,
                })?;
            headers.push(header);
        }
        Ok(headers)
    }
}

/// A block with an empty receipts root has no receipts, any other block has some
fn validate_receipts(header: &BlockHeader, receipts: &[Receipt]) -> Result<(), FetcherError> {
    let expects_receipts = header.receipts_root != EMPTY_TRIE_HASH;
    if expects_receipts == receipts.is_empty() {
        return Err(FetcherError::InvalidResponse(format!(
            "block {} declares receipts root {:#x} but got {} receipts",
            header.number,
            header.receipts_root,
            receipts.len()
        )));
    }
    Ok(())
}

#[async_trait]
impl<C: ChainStore> JobHandler for ReceiptFetcher<C> {
    type Task = BlockTask;
    type Response = Vec<BlockReceipts>;
    type Output = Vec<BlockReceipts>;
    type Capability = Eth;

    const KIND: FetcherKind = FetcherKind::Receipt;

    async fn tasks(&self) -> Result<Vec<BlockTask>, StoreError> {
        Ok(partition(
            self.first,
            self.count,
            self.max_per_request,
            false,
        ))
    }

    async fn request(
        &self,
        job: &Job<BlockTask, Vec<BlockReceipts>>,
        peer: &EthPeer,
    ) -> Result<Vec<BlockReceipts>, FetcherError> {
        let received = job.partial_len() as u64;
        let from = job.task.first + received;
        let headers = self
            .local_headers(&job.task, from, job.task.count - received)
            .await?;
        let hashes: Vec<H256> = headers.iter().map(BlockHeader::hash).collect();

        let receipts = peer.receipts(hashes.clone()).await?;
        if receipts.is_empty() {
            return Err(FetcherError::EmptyResponse);
        }
        if receipts.len() > headers.len() {
            return Err(FetcherError::InvalidResponse(format!(
                "requested receipts of {} blocks, got {}",
                headers.len(),
                receipts.len()
            )));
        }
        for (header, block_receipts) in headers.iter().zip(receipts.iter()) {
            validate_receipts(header, block_receipts)?;
        }
        debug!(peer = %peer.id(), from, blocks = receipts.len(), "Received receipts");
        Ok(hashes.into_iter().zip(receipts).collect())
    }

    fn process(
        &self,
        job: &mut Job<BlockTask, Vec<BlockReceipts>>,
        receipts: Vec<BlockReceipts>,
    ) -> Result<Option<Vec<BlockReceipts>>, FetcherError> {
        let count = job.task.count as usize;
        if job.merge(receipts).len() >= count {
            return Ok(job.partial.take());
        }
        Ok(None)
    }

    async fn store(
        &self,
        _task: &BlockTask,
        receipts: Vec<BlockReceipts>,
    ) -> Result<StoreReport<BlockTask>, StoreError> {
        let items = receipts.len();
        self.chain.put_receipts(receipts).await?;
        Ok(StoreReport::items(items))
    }

    fn ordered(&self) -> bool {
        false
    }
}
