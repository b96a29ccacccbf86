//! Headers and bodies for a contiguous block range.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::FetcherError;
use crate::events::{EventSender, SyncEvent};
use crate::messages::HashOrNumber;
use crate::peer::{Eth, EthPeer};
use crate::store::{ChainStore, StoreError};
use crate::types::{Block, BlockHeader, validate_block_body};

use super::{FetcherKind, Job, JobHandler, StoreReport};

/// `count` blocks starting at `first`. In reverse tasks `first` is the
/// highest block and the range extends downwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTask {
    pub first: u64,
    pub count: u64,
    pub reverse: bool,
}

impl BlockTask {
    /// Number of the block at `offset` positions from `first`, in task direction
    pub fn number_at(&self, offset: u64) -> u64 {
        if self.reverse {
            self.first.saturating_sub(offset)
        } else {
            self.first.saturating_add(offset)
        }
    }

    /// Block right after the task, in task direction
    pub fn end(&self) -> u64 {
        self.number_at(self.count)
    }
}

impl fmt::Display for BlockTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.reverse {
            let last = self.number_at(self.count.saturating_sub(1));
            write!(f, "{}..={} (reverse)", self.first, last)
        } else {
            write!(f, "{}..{}", self.first, self.end())
        }
    }
}

/// Splits `count` blocks from `first` into tasks of at most `max_per_request` blocks
pub fn partition(first: u64, count: u64, max_per_request: u64, reverse: bool) -> Vec<BlockTask> {
    let max_per_request = max_per_request.max(1);
    // A reverse range cannot go below genesis
    let count = if reverse {
        count.min(first.saturating_add(1))
    } else {
        count
    };
    let mut tasks = vec![];
    let mut offset = 0;
    while offset < count {
        let task_count = max_per_request.min(count - offset);
        let task_first = if reverse {
            first - offset
        } else {
            first + offset
        };
        tasks.push(BlockTask {
            first: task_first,
            count: task_count,
            reverse,
        });
        offset += task_count;
    }
    tasks
}

/// Checks that `headers` are numbered from `start` in the requested direction
/// and chained by parent hash, also to `previous` (the last block already received).
pub fn validate_headers(
    start: u64,
    reverse: bool,
    headers: &[BlockHeader],
    previous: Option<&BlockHeader>,
) -> Result<(), FetcherError> {
    for (offset, header) in headers.iter().enumerate() {
        let expected = if reverse {
            start.checked_sub(offset as u64)
        } else {
            start.checked_add(offset as u64)
        };
        if expected != Some(header.number) {
            return Err(FetcherError::InvalidResponse(format!(
                "expected header {expected:?}, got {}",
                header.number
            )));
        }
    }
    let chained = |parent: &BlockHeader, child: &BlockHeader| child.parent_hash == parent.hash();
    let linked = previous
        .into_iter()
        .chain(headers.iter())
        .collect::<Vec<_>>()
        .windows(2)
        .all(|pair| {
            if reverse {
                chained(pair[1], pair[0])
            } else {
                chained(pair[0], pair[1])
            }
        });
    if !linked {
        return Err(FetcherError::InvalidResponse(
            "headers are not chained".to_string(),
        ));
    }
    Ok(())
}

pub struct BlockFetcher<C: ChainStore> {
    chain: Arc<C>,
    first: u64,
    count: u64,
    reverse: bool,
    max_per_request: u64,
    events: EventSender,
}

impl<C: ChainStore> BlockFetcher<C> {
    pub fn new(
        chain: Arc<C>,
        first: u64,
        count: u64,
        max_per_request: u64,
        events: EventSender,
    ) -> Self {
        Self {
            chain,
            first,
            count,
            reverse: false,
            max_per_request,
            events,
        }
    }

    /// Fetch from `first` downwards
    pub fn reverse(mut self) -> Self {
        self.reverse = true;
        self
    }
}

#[async_trait]
impl<C: ChainStore> JobHandler for BlockFetcher<C> {
    type Task = BlockTask;
    type Response = Vec<Block>;
    type Output = Vec<Block>;
    type Capability = Eth;

    const KIND: FetcherKind = FetcherKind::Block;

    async fn tasks(&self) -> Result<Vec<BlockTask>, StoreError> {
        Ok(partition(
            self.first,
            self.count,
            self.max_per_request,
            self.reverse,
        ))
    }

    async fn request(
        &self,
        job: &Job<BlockTask, Vec<Block>>,
        peer: &EthPeer,
    ) -> Result<Vec<Block>, FetcherError> {
        let task = job.task;
        let received = job.partial_len() as u64;
        let remaining = task.count - received;
        let start = task.number_at(received);

        let mut headers = peer
            .block_headers(HashOrNumber::Number(start), remaining, 0, task.reverse)
            .await?;
        if headers.is_empty() {
            return Err(FetcherError::EmptyResponse);
        }
        if headers.len() as u64 > remaining {
            return Err(FetcherError::InvalidResponse(format!(
                "requested {remaining} headers, got {}",
                headers.len()
            )));
        }
        let previous = job
            .partial
            .as_ref()
            .and_then(|blocks| blocks.last())
            .map(|block| &block.header);
        validate_headers(start, task.reverse, &headers, previous)?;

        let hashes = headers.iter().map(BlockHeader::hash).collect();
        let bodies = peer.block_bodies(hashes).await?;
        if bodies.is_empty() {
            return Err(FetcherError::EmptyResponse);
        }
        if bodies.len() > headers.len() {
            return Err(FetcherError::InvalidResponse(format!(
                "requested {} bodies, got {}",
                headers.len(),
                bodies.len()
            )));
        }
        // Peers may serve fewer bodies than headers, the rest is requested again
        headers.truncate(bodies.len());
        for (header, body) in headers.iter().zip(bodies.iter()) {
            validate_block_body(header, body).map_err(FetcherError::InvalidResponse)?;
        }

        debug!(
            peer = %peer.id(),
            start,
            headers = headers.len(),
            "Received block headers and bodies"
        );
        Ok(headers
            .into_iter()
            .zip(bodies)
            .map(|(header, body)| Block::new(header, body))
            .collect())
    }

    fn process(
        &self,
        job: &mut Job<BlockTask, Vec<Block>>,
        blocks: Vec<Block>,
    ) -> Result<Option<Vec<Block>>, FetcherError> {
        let count = job.task.count as usize;
        if job.merge(blocks).len() >= count {
            return Ok(job.partial.take());
        }
        Ok(None)
    }

    async fn store(
        &self,
        task: &BlockTask,
        blocks: Vec<Block>,
    ) -> Result<StoreReport<BlockTask>, StoreError> {
        let count = blocks.len();
        let first = blocks.first().map_or(task.first, Block::number);
        let accepted = self.chain.put_blocks(blocks).await?;
        if accepted < count {
            debug!(%task, count, accepted, "Chain accepted part of the block batch");
        }
        if accepted > 0 {
            self.events.emit(SyncEvent::FetchedBlocks {
                first,
                count: accepted,
            });
        }
        Ok(StoreReport::items(accepted))
    }
}
