//! Sync strategies: which peers to sync from, up to which head, and the
//! lifecycle of the fetchers doing the work.

mod full;
mod snap;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::EventSender;
use crate::peer::{Eth, EthPeer, Peer, PeerCapability};
use crate::peer_pool::PeerPool;
use crate::types::BlockHeader;

pub use full::FullSynchronizer;
pub use snap::SnapSynchronizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Full,
    Snap,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => f.write_str("full"),
            SyncMode::Snap => f.write_str("snap"),
        }
    }
}

/// State shared by every strategy: the peer pool, the target height and
/// the minimum peers policy.
#[derive(Debug)]
pub struct SyncCore {
    pool: PeerPool,
    config: SyncConfig,
    events: EventSender,
    /// Never decreases during the lifetime of the synchronizer
    target_height: AtomicU64,
    force_sync: AtomicBool,
    created: Instant,
}

impl SyncCore {
    pub fn new(pool: PeerPool, config: SyncConfig) -> Self {
        Self {
            pool,
            config,
            events: EventSender::new(),
            target_height: AtomicU64::new(0),
            force_sync: AtomicBool::new(false),
            created: Instant::now(),
        }
    }

    pub fn pool(&self) -> &PeerPool {
        &self.pool
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn events(&self) -> &EventSender {
        &self.events
    }

    pub fn target_height(&self) -> u64 {
        self.target_height.load(Ordering::Acquire)
    }

    /// Raises the target to `height` if it is higher, returns the resulting target
    pub fn raise_target(&self, height: u64) -> u64 {
        let previous = self.target_height.fetch_max(height, Ordering::AcqRel);
        previous.max(height)
    }

    pub fn set_force_sync(&self, force: bool) {
        self.force_sync.store(force, Ordering::Release);
    }

    /// Whether sync may start with fewer than `min_peers` peers, either
    /// because it was requested or because waiting for peers timed out.
    pub fn is_forced(&self) -> bool {
        self.force_sync.load(Ordering::Acquire)
            || self.created.elapsed() >= self.config.force_sync_timeout()
    }

    /// Connected peer accepted by `syncable` with the highest confirmed head.
    /// Returns `None` while fewer than `min_peers` such peers are connected,
    /// unless sync is forced.
    ///
    /// Head queries do not claim the idle flag: leased peers are asked too.
    /// A lease makes job assignment exclusive, while a head query is one more
    /// request on the peer's connection, correlated by its own request id.
    pub async fn best(
        &self,
        syncable: impl Fn(&Peer) -> bool + Send + Sync,
    ) -> Option<(EthPeer, BlockHeader)> {
        let peers: Vec<Arc<Peer>> = self
            .pool
            .connected_peers()
            .into_iter()
            .filter(|peer| syncable(peer))
            .collect();
        if peers.len() < self.config.min_peers && !self.is_forced() {
            debug!(
                peers = peers.len(),
                min_peers = self.config.min_peers,
                "Not enough syncable peers"
            );
            return None;
        }

        let heads = join_all(
            peers
                .iter()
                .filter_map(Eth::handle)
                .map(|peer| async move {
                    match peer.latest().await {
                        Ok(Some(head)) => Some((peer, head)),
                        Ok(None) => {
                            trace!(peer = %peer.id(), "Peer did not serve its head");
                            None
                        }
                        Err(error) => {
                            trace!(peer = %peer.id(), %error, "Failed to fetch peer head");
                            None
                        }
                    }
                }),
        )
        .await;
        heads
            .into_iter()
            .flatten()
            .reduce(|best, candidate| {
                if candidate.1.number > best.1.number {
                    candidate
                } else {
                    best
                }
            })
    }
}

#[async_trait]
pub trait Synchronizer: Send + Sync {
    const MODE: SyncMode;

    fn core(&self) -> &SyncCore;

    /// Whether `peer` negotiated every protocol this strategy needs
    fn syncable(&self, peer: &Peer) -> bool;

    async fn best(&self) -> Option<(EthPeer, BlockHeader)> {
        self.core().best(|peer| self.syncable(peer)).await
    }

    /// Makes sure a fetch towards `head` is under way. Calling it again
    /// with a head the running fetch already covers does nothing. Returns
    /// whether fetchers were created or extended.
    async fn sync_with_peer(
        &mut self,
        peer: &EthPeer,
        head: &BlockHeader,
    ) -> Result<bool, SyncError>;

    /// Syncs until done, returning the height reached. Recoverable errors
    /// are reported as events and retried on the next poll.
    async fn run(&mut self, cancel: CancellationToken) -> Result<u64, SyncError>;
}
