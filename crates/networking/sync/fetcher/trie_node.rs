//! Heals the state trie by downloading missing nodes top down.
//!
//! Storing a node looks up which of its children are still missing locally
//! and queues them as follow up tasks, so the fetcher walks the trie until
//! every reachable node is present.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::FetcherError;
use crate::peer::{Snap, SnapPeer};
use crate::store::{StateStore, StoreError};
use crate::types::H256;

use super::bytecode::{match_by_hash, missing_hashes};
use super::progress::SnapProgress;
use super::{FetcherKind, Job, JobHandler, StoreReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrieNodeTask {
    pub hashes: Vec<H256>,
}

impl fmt::Display for TrieNodeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hashes.as_slice() {
            [single] => write!(f, "trie node {single:#x}"),
            hashes => write!(f, "{} trie nodes", hashes.len()),
        }
    }
}

pub struct TrieNodeFetcher<S: StateStore> {
    state: Arc<S>,
    progress: Arc<SnapProgress>,
    response_bytes: u64,
    batch: usize,
    /// Nodes already queued, a node may be referenced by many parents
    queued: Mutex<HashSet<H256>>,
}

impl<S: StateStore> TrieNodeFetcher<S> {
    pub fn new(state: Arc<S>, progress: Arc<SnapProgress>, config: &SyncConfig) -> Self {
        Self {
            state,
            progress,
            response_bytes: config.max_response_bytes,
            batch: config.trie_nodes_per_request,
            queued: Mutex::new(HashSet::new()),
        }
    }

    fn follow_up(&self, children: Vec<H256>) -> Vec<TrieNodeTask> {
        let fresh: Vec<H256> = {
            let mut queued = self.queued.lock().unwrap_or_else(PoisonError::into_inner);
            children
                .into_iter()
                .filter(|hash| queued.insert(*hash))
                .collect()
        };
        fresh
            .chunks(self.batch.max(1))
            .map(|hashes| TrieNodeTask {
                hashes: hashes.to_vec(),
            })
            .collect()
    }
}

#[async_trait]
impl<S: StateStore> JobHandler for TrieNodeFetcher<S> {
    type Task = TrieNodeTask;
    type Response = Vec<(H256, Bytes)>;
    type Output = Vec<(H256, Bytes)>;
    type Capability = Snap;

    const KIND: FetcherKind = FetcherKind::TrieNode;

    async fn tasks(&self) -> Result<Vec<TrieNodeTask>, StoreError> {
        Ok(vec![])
    }

    async fn request(
        &self,
        job: &Job<TrieNodeTask, Vec<(H256, Bytes)>>,
        peer: &SnapPeer,
    ) -> Result<Vec<(H256, Bytes)>, FetcherError> {
        let hashes = missing_hashes(&job.task.hashes, job.partial.as_ref());
        let root = self.progress.target().root;
        let nodes = peer
            .trie_nodes(root, hashes.clone(), self.response_bytes)
            .await?;
        if nodes.is_empty() {
            return Err(FetcherError::EmptyResponse);
        }
        let matched = match_by_hash(&hashes, nodes)?;
        debug!(peer = %peer.id(), requested = hashes.len(), received = matched.len(), "Received trie nodes");
        Ok(matched)
    }

    fn process(
        &self,
        job: &mut Job<TrieNodeTask, Vec<(H256, Bytes)>>,
        nodes: Vec<(H256, Bytes)>,
    ) -> Result<Option<Vec<(H256, Bytes)>>, FetcherError> {
        let expected = job.task.hashes.len();
        if job.merge(nodes).len() >= expected {
            return Ok(job.partial.take());
        }
        Ok(None)
    }

    async fn store(
        &self,
        _task: &TrieNodeTask,
        nodes: Vec<(H256, Bytes)>,
    ) -> Result<StoreReport<TrieNodeTask>, StoreError> {
        let mut children = Vec::new();
        for (_, node) in &nodes {
            children.extend(self.state.missing_children(node).await?);
        }
        let items = nodes.len();
        self.state.put_trie_nodes(nodes).await?;
        Ok(StoreReport {
            items,
            follow_up: self.follow_up(children),
        })
    }

    fn ordered(&self) -> bool {
        false
    }

    fn wait_for_feed(&self) -> bool {
        true
    }

    async fn on_complete(&self) -> Result<(), StoreError> {
        self.progress.mark_done(FetcherKind::TrieNode);
        Ok(())
    }
}
