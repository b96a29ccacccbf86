//! Snap sync: download the state of a recent block directly instead of
//! executing the chain.
//!
//! An attempt fixes the target block and runs the four state fetchers
//! against its root. The attempt is kept while the best head stays within
//! `snap_availability_depth` blocks of the target, as peers only serve
//! recent state. Once every fetcher reported done, the locally computed
//! state root must equal the target root.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, broadcast};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{FetcherError, SyncError};
use crate::events::SyncEvent;
use crate::fetcher::account::{AccountFetcher, SnapFeeds};
use crate::fetcher::bytecode::ByteCodeFetcher;
use crate::fetcher::progress::{SnapProgress, SnapTarget};
use crate::fetcher::storage::StorageFetcher;
use crate::fetcher::trie_node::TrieNodeFetcher;
use crate::fetcher::{Fetcher, FetcherHandle, FetcherSummary, JobHandler, TaskSender};
use crate::peer::{EthPeer, Peer};
use crate::peer_pool::PeerPool;
use crate::store::StateStore;
use crate::types::BlockHeader;

use super::{SyncCore, SyncMode, Synchronizer};

type FetcherTask = JoinHandle<Result<FetcherSummary, FetcherError>>;

struct SnapAttempt {
    progress: Arc<SnapProgress>,
    cancel: CancellationToken,
    fetchers: Vec<(FetcherHandle, FetcherTask)>,
}

impl SnapAttempt {
    fn target(&self) -> SnapTarget {
        self.progress.target()
    }

    fn is_errored(&self) -> bool {
        self.fetchers.iter().any(|(handle, _)| handle.is_errored())
    }

    /// Whether every fetcher returned
    fn is_finished(&self) -> bool {
        self.fetchers.is_empty()
    }

    /// Collects the fetchers that returned or failed, failing with the first error
    async fn reap(&mut self) -> Result<(), SyncError> {
        let mut result = Ok(());
        for (handle, join) in std::mem::take(&mut self.fetchers) {
            if result.is_err() || !(join.is_finished() || handle.is_errored()) {
                self.fetchers.push((handle, join));
                continue;
            }
            match join.await {
                Ok(Ok(summary)) => info!(
                    kind = %handle.kind(),
                    stored = summary.stored_results,
                    items = summary.stored_items,
                    failed_attempts = summary.failed_attempts,
                    "Snap fetcher finished"
                ),
                Ok(Err(error)) => result = Err(error.into()),
                Err(error) => result = Err(error.into()),
            }
        }
        result
    }

    /// Stops every fetcher and waits for stores in progress to complete
    async fn stop(self) {
        self.cancel.cancel();
        for (handle, join) in self.fetchers {
            if let Ok(Err(error)) = join.await {
                debug!(kind = %handle.kind(), %error, "Stopped snap fetcher had failed");
            }
        }
    }
}

pub struct SnapSynchronizer<S: StateStore> {
    core: SyncCore,
    state: Arc<S>,
    cancel: CancellationToken,
    attempt: Option<SnapAttempt>,
}

impl<S: StateStore> SnapSynchronizer<S> {
    pub fn new(pool: PeerPool, state: Arc<S>, config: SyncConfig) -> Self {
        Self {
            core: SyncCore::new(pool, config),
            state,
            cancel: CancellationToken::new(),
            attempt: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.core.events().subscribe()
    }

    pub fn target_height(&self) -> u64 {
        self.core.target_height()
    }

    pub fn set_force_sync(&self, force: bool) {
        self.core.set_force_sync(force);
    }

    /// Target of the running attempt
    pub fn snap_target(&self) -> Option<SnapTarget> {
        self.attempt.as_ref().map(SnapAttempt::target)
    }

    /// Checks the downloaded state once every fetcher is done. Returns
    /// `false` while some fetcher is still running. A root mismatch is an
    /// integrity failure and is never retried.
    pub async fn check_and_sync(&self, progress: &SnapProgress) -> Result<bool, SyncError> {
        if !progress.all_done() {
            return Ok(false);
        }
        let target = progress.target();
        let computed = self.state.state_root().await?;
        if computed != target.root {
            error!(
                height = target.height,
                expected = ?target.root,
                computed = ?computed,
                "State root mismatch after snap sync"
            );
            return Err(SyncError::StateRootMismatch {
                expected: target.root,
                computed,
            });
        }
        info!(height = target.height, root = ?target.root, "Snap sync complete");
        self.core.events().emit(SyncEvent::SyncComplete {
            height: target.height,
            root: target.root,
        });
        Ok(true)
    }

    fn spawn<H: JobHandler>(
        &self,
        handler: H,
        cancel: &CancellationToken,
        requests: &Arc<Semaphore>,
    ) -> ((FetcherHandle, FetcherTask), TaskSender<H::Task>) {
        let (fetcher, feed) = Fetcher::new(
            handler,
            self.core.pool().clone(),
            self.core.config().fetcher_config(),
        );
        let fetcher = fetcher
            .with_request_limit(requests.clone())
            .with_parent_cancel(cancel);
        let handle = fetcher.handle();
        ((handle, tokio::spawn(fetcher.run())), feed)
    }

    fn start_attempt(&self, target: SnapTarget) -> SnapAttempt {
        let config = self.core.config();
        let progress = Arc::new(SnapProgress::new(target));
        let cancel = self.cancel.child_token();
        // The four fetchers share one request budget
        let requests = Arc::new(Semaphore::new(config.max_requests));

        let (storage, storage_feed) = self.spawn(
            StorageFetcher::new(self.state.clone(), progress.clone(), config),
            &cancel,
            &requests,
        );
        let (byte_codes, byte_code_feed) = self.spawn(
            ByteCodeFetcher::new(self.state.clone(), progress.clone(), config),
            &cancel,
            &requests,
        );
        let (trie_nodes, trie_node_feed) = self.spawn(
            TrieNodeFetcher::new(self.state.clone(), progress.clone(), config),
            &cancel,
            &requests,
        );
        let feeds = SnapFeeds {
            storage: storage_feed,
            byte_codes: byte_code_feed,
            trie_nodes: trie_node_feed,
        };
        let (accounts, _) = self.spawn(
            AccountFetcher::new(self.state.clone(), progress.clone(), feeds, config),
            &cancel,
            &requests,
        );

        SnapAttempt {
            progress,
            cancel,
            fetchers: vec![accounts, storage, byte_codes, trie_nodes],
        }
    }

    async fn abandon(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.stop().await;
        }
    }

    /// One poll round. Returns the synced height once the state is complete.
    async fn poll(&mut self) -> Result<Option<u64>, SyncError> {
        if let Some(attempt) = self.attempt.as_mut() {
            attempt.reap().await?;
            if attempt.is_finished() {
                let progress = attempt.progress.clone();
                self.attempt = None;
                if self.check_and_sync(&progress).await? {
                    return Ok(Some(progress.target().height));
                }
                // Every fetcher returned without finishing, only happens when stopped
                debug!("Snap fetchers stopped before completion, restarting attempt");
            }
        }
        if let Some((peer, head)) = self.best().await {
            self.sync_with_peer(&peer, &head).await?;
        }
        Ok(None)
    }
}

#[async_trait]
impl<S: StateStore> Synchronizer for SnapSynchronizer<S> {
    const MODE: SyncMode = SyncMode::Snap;

    fn core(&self) -> &SyncCore {
        &self.core
    }

    /// Snap peers must also speak eth, the head is learned over eth
    fn syncable(&self, peer: &Peer) -> bool {
        peer.supports_eth() && peer.supports_snap()
    }

    async fn sync_with_peer(
        &mut self,
        peer: &EthPeer,
        head: &BlockHeader,
    ) -> Result<bool, SyncError> {
        let target_height = self.core.raise_target(head.number);
        let depth = self.core.config().snap_availability_depth;

        if let Some(attempt) = self.attempt.as_ref() {
            let current = attempt.target();
            if !attempt.is_errored() && head.number <= current.height.saturating_add(depth) {
                return Ok(false);
            }
            info!(
                peer = %peer.id(),
                current = current.height,
                head = head.number,
                "Snap target went stale, restarting against the new head"
            );
            self.abandon().await;
        }

        let target = SnapTarget {
            height: head.number,
            root: head.state_root,
            hash: head.hash(),
        };
        info!(peer = %peer.id(), height = target.height, root = ?target.root, "Starting snap sync attempt");
        self.core.events().emit(SyncEvent::SyncStarted {
            mode: Self::MODE,
            target_height,
        });
        self.attempt = Some(self.start_attempt(target));
        Ok(true)
    }

    async fn run(&mut self, cancel: CancellationToken) -> Result<u64, SyncError> {
        self.cancel = cancel.child_token();
        let mut interval = tokio::time::interval(self.core.config().poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abandon().await;
                    return Err(SyncError::Stopped);
                }
                _ = interval.tick() => {}
            }

            match self.poll().await {
                Ok(Some(height)) => return Ok(height),
                Ok(None) => {}
                Err(error) => {
                    self.core.events().emit(SyncEvent::error(Self::MODE, &error));
                    self.abandon().await;
                    if !error.is_recoverable() {
                        error!(%error, "Snap sync failed");
                        return Err(error);
                    }
                    warn!(%error, "Snap sync attempt failed, restarting");
                }
            }
        }
    }
}
