//! The set of peers currently usable for sync.
//!
//! Peers are shared by every fetcher, possibly from different synchronizers,
//! so the only way to borrow one is [`PeerPool::idle`], which claims the peer's
//! idle flag with a compare-and-swap and hands out a [`PeerLease`].

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::seq::SliceRandom;
use tokio::sync::{Notify, futures::Notified, watch};
use tracing::debug;

use crate::peer::{Peer, PeerId};

#[derive(Debug)]
struct PeerPoolInner {
    peers: RwLock<BTreeMap<PeerId, Arc<Peer>>>,
    /// Woken when a peer is added or a lease is returned
    available: Notify,
    count: watch::Sender<usize>,
}

#[derive(Debug, Clone)]
pub struct PeerPool {
    inner: Arc<PeerPoolInner>,
}

impl Default for PeerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerPool {
    pub fn new() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            inner: Arc::new(PeerPoolInner {
                peers: RwLock::new(BTreeMap::new()),
                available: Notify::new(),
                count,
            }),
        }
    }

    /// Adds a peer, replacing (and disconnecting) a previous peer with the same id
    pub fn add(&self, peer: Arc<Peer>) {
        let id = peer.id();
        let previous = {
            let mut peers = self.write();
            let previous = peers.insert(id, peer);
            self.inner.count.send_replace(peers.len());
            previous
        };
        if let Some(previous) = previous {
            previous.disconnect();
        }
        debug!(peer = %id, "Peer added to sync pool");
        self.inner.available.notify_waiters();
    }

    pub fn remove(&self, id: &PeerId) -> Option<Arc<Peer>> {
        let mut peers = self.write();
        let removed = peers.remove(id);
        self.inner.count.send_replace(peers.len());
        removed
    }

    /// Removes the peer and fails the requests pending on it.
    /// Jobs bound to other peers are not affected.
    pub fn disconnect(&self, id: &PeerId) -> bool {
        match self.remove(id) {
            Some(peer) => {
                peer.disconnect();
                debug!(peer = %id, "Peer disconnected from sync pool");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.read().get(id).cloned()
    }

    pub fn connected_peers(&self) -> Vec<Arc<Peer>> {
        self.read()
            .values()
            .filter(|peer| peer.is_connected())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn idle_count(&self) -> usize {
        self.read()
            .values()
            .filter(|peer| peer.is_connected() && peer.is_idle())
            .count()
    }

    /// Claims a random idle connected peer satisfying `predicate`.
    ///
    /// The claim flips the peer's idle flag atomically, so concurrent callers
    /// never obtain the same peer. The peer is idle again once the lease drops.
    pub fn idle(&self, predicate: impl Fn(&Peer) -> bool) -> Option<PeerLease> {
        let mut candidates: Vec<Arc<Peer>> = self
            .read()
            .values()
            .filter(|peer| peer.is_idle() && peer.is_connected() && predicate(peer))
            .cloned()
            .collect();
        candidates.shuffle(&mut rand::thread_rng());
        candidates
            .into_iter()
            .find(|peer| peer.try_claim())
            .map(|peer| PeerLease {
                peer,
                pool: self.clone(),
            })
    }

    /// Resolves once a peer is added or returned to idle
    pub fn notified(&self) -> Notified<'_> {
        self.inner.available.notified()
    }

    pub fn peer_count(&self) -> watch::Receiver<usize> {
        self.inner.count.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<PeerId, Arc<Peer>>> {
        self.inner.peers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<PeerId, Arc<Peer>>> {
        self.inner.peers.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive borrow of a peer for one job attempt
#[derive(Debug)]
pub struct PeerLease {
    peer: Arc<Peer>,
    pool: PeerPool,
}

impl PeerLease {
    pub fn peer(&self) -> &Arc<Peer> {
        &self.peer
    }
}

impl Deref for PeerLease {
    type Target = Peer;

    fn deref(&self) -> &Peer {
        &self.peer
    }
}

impl Drop for PeerLease {
    fn drop(&mut self) {
        self.peer.release();
        self.pool.inner.available.notify_waiters();
    }
}
