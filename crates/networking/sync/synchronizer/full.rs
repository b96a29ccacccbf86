//! Full sync: download every block from the local head up to the best peer's head.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{FetcherError, SyncError};
use crate::events::SyncEvent;
use crate::fetcher::block::{BlockFetcher, BlockTask, partition};
use crate::fetcher::{Fetcher, FetcherHandle, FetcherSummary, TaskSender};
use crate::peer::{EthPeer, Peer};
use crate::peer_pool::PeerPool;
use crate::store::ChainStore;
use crate::types::BlockHeader;

use super::{SyncCore, SyncMode, Synchronizer};

struct ActiveFetcher {
    handle: FetcherHandle,
    feed: TaskSender<BlockTask>,
    join: JoinHandle<Result<FetcherSummary, FetcherError>>,
    /// Highest block the fetcher was asked for
    target: u64,
}

impl ActiveFetcher {
    fn is_alive(&self) -> bool {
        !self.join.is_finished() && !self.handle.is_errored()
    }
}

pub struct FullSynchronizer<C: ChainStore> {
    core: SyncCore,
    chain: Arc<C>,
    cancel: CancellationToken,
    active: Option<ActiveFetcher>,
}

impl<C: ChainStore> FullSynchronizer<C> {
    pub fn new(pool: PeerPool, chain: Arc<C>, config: SyncConfig) -> Self {
        Self {
            core: SyncCore::new(pool, config),
            chain,
            cancel: CancellationToken::new(),
            active: None,
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

    /// Handle of the running block fetcher, if any
    pub fn fetcher(&self) -> Option<&FetcherHandle> {
        self.active.as_ref().map(|active| &active.handle)
    }

    fn spawn_fetcher(&self, first: u64, target: u64) -> ActiveFetcher {
        let config = self.core.config();
        let handler = BlockFetcher::new(
            self.chain.clone(),
            first,
            target - first + 1,
            config.max_blocks_per_request,
            self.core.events().clone(),
        );
        let (fetcher, feed) = Fetcher::new(handler, self.core.pool().clone(), config.fetcher_config());
        let fetcher = fetcher.with_parent_cancel(&self.cancel);
        ActiveFetcher {
            handle: fetcher.handle(),
            feed,
            join: tokio::spawn(fetcher.run()),
            target,
        }
    }

    /// Collects the fetcher once it returned or failed, propagating its error
    async fn reap(&mut self) -> Result<(), SyncError> {
        if !self
            .active
            .as_ref()
            .is_some_and(|active| active.join.is_finished() || active.handle.is_errored())
        {
            return Ok(());
        }
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let summary = active.join.await??;
        info!(
            target = active.target,
            batches = summary.stored_results,
            blocks = summary.stored_items,
            failed_attempts = summary.failed_attempts,
            "Block fetcher finished"
        );
        Ok(())
    }

    /// Stops the running fetcher and waits for a store in progress to complete
    async fn stop_fetcher(&mut self) {
        if let Some(active) = self.active.take() {
            active.handle.stop();
            if let Ok(Err(error)) = active.join.await {
                debug!(%error, "Stopped block fetcher had failed");
            }
        }
    }

    /// One poll round. Returns the final height once sync is complete.
    async fn poll(&mut self, settled: &mut bool) -> Result<Option<u64>, SyncError> {
        self.reap().await?;
        let Some((peer, head)) = self.best().await else {
            *settled = false;
            return Ok(None);
        };
        let previous_target = self.core.target_height();
        let started = self.sync_with_peer(&peer, &head).await?;

        let local = self.chain.latest_block_number().await?;
        let target = self.core.target_height();
        if started || self.active.is_some() || local < target || target > previous_target {
            *settled = false;
            return Ok(None);
        }
        // Require one more poll without a higher head before finishing
        if !*settled {
            *settled = true;
            return Ok(None);
        }

        let header = self
            .chain
            .block_header(local)
            .await?
            .ok_or(SyncError::NoTargetHeader(local))?;
        info!(height = local, root = ?header.state_root, "Full sync complete");
        self.core.events().emit(SyncEvent::SyncComplete {
            height: local,
            root: header.state_root,
        });
        Ok(Some(local))
    }
}

#[async_trait]
impl<C: ChainStore> Synchronizer for FullSynchronizer<C> {
    const MODE: SyncMode = SyncMode::Full;

    fn core(&self) -> &SyncCore {
        &self.core
    }

    fn syncable(&self, peer: &Peer) -> bool {
        peer.supports_eth()
    }

    async fn sync_with_peer(
        &mut self,
        peer: &EthPeer,
        head: &BlockHeader,
    ) -> Result<bool, SyncError> {
        self.reap().await?;
        let target = self.core.raise_target(head.number);
        let local = self.chain.latest_block_number().await?;
        if target <= local {
            return Ok(false);
        }

        if let Some(active) = self.active.as_mut().filter(|active| active.is_alive()) {
            if active.target >= target {
                return Ok(false);
            }
            let tasks = partition(
                active.target + 1,
                target - active.target,
                self.core.config().max_blocks_per_request,
                false,
            );
            // Fails once the fetcher drained its queue and stopped taking tasks
            if active.feed.send(tasks).is_ok() {
                info!(peer = %peer.id(), from = active.target + 1, target, "Extending block download");
                active.target = target;
                return Ok(true);
            }
        }

        self.stop_fetcher().await;
        // The local head may have moved while the previous fetcher stopped
        let local = self.chain.latest_block_number().await?;
        if target <= local {
            return Ok(false);
        }
        info!(peer = %peer.id(), from = local + 1, target, "Starting block download");
        self.core.events().emit(SyncEvent::SyncStarted {
            mode: Self::MODE,
            target_height: target,
        });
        self.active = Some(self.spawn_fetcher(local + 1, target));
        Ok(true)
    }

    async fn run(&mut self, cancel: CancellationToken) -> Result<u64, SyncError> {
        self.cancel = cancel.child_token();
        let mut interval = tokio::time::interval(self.core.config().poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut settled = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.stop_fetcher().await;
                    return Err(SyncError::Stopped);
                }
                _ = interval.tick() => {}
            }

            match self.poll(&mut settled).await {
                Ok(Some(height)) => return Ok(height),
                Ok(None) => {}
                Err(error) => {
                    self.core.events().emit(SyncEvent::error(Self::MODE, &error));
                    if !error.is_recoverable() {
                        error!(%error, "Full sync failed");
                        self.stop_fetcher().await;
                        return Err(error);
                    }
                    warn!(%error, "Full sync round failed, retrying");
                    settled = false;
                }
            }
        }
    }
}
