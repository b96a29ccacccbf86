//! Remote peers as seen by the sync engine.
//!
//! A [`Peer`] is created by the networking layer once the handshake with a
//! remote node completes. It carries the negotiated capabilities, the
//! request channel and the idle flag the [`PeerPool`](crate::peer_pool::PeerPool)
//! claims atomically before lending the peer to a job.

mod capability;
mod connection;

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::types::{BlockHeader, H256};

pub use capability::{Eth, EthPeer, PeerCapability, Snap, SnapPeer};
pub use connection::{PeerConnection, PendingRequests, RequestChannel, RequestTimeouts};

/// Node id of the remote peer
pub type PeerId = H256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Eth(u8),
    Snap(u8),
}

impl Capability {
    pub const ETH_68: Capability = Capability::Eth(68);
    pub const ETH_69: Capability = Capability::Eth(69);
    pub const SNAP_1: Capability = Capability::Snap(1);
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Eth(version) => write!(f, "eth/{version}"),
            Capability::Snap(version) => write!(f, "snap/{version}"),
        }
    }
}

/// Best known head of a peer.
///
/// The hash comes from the status exchange or block announcements, the
/// header is fetched lazily the first time a synchronizer needs the height.
#[derive(Debug, Clone, Default)]
pub struct PeerHead {
    pub best_hash: H256,
    pub latest: Option<BlockHeader>,
}

#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    address: SocketAddr,
    capabilities: Vec<Capability>,
    connection: PeerConnection,
    idle: AtomicBool,
    head: Mutex<PeerHead>,
}

impl Peer {
    pub fn new(
        id: PeerId,
        address: SocketAddr,
        capabilities: Vec<Capability>,
        connection: PeerConnection,
        best_hash: H256,
    ) -> Self {
        Self {
            id,
            address,
            capabilities,
            connection,
            idle: AtomicBool::new(true),
            head: Mutex::new(PeerHead {
                best_hash,
                latest: None,
            }),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    pub fn connection(&self) -> &PeerConnection {
        &self.connection
    }

    pub fn supports_eth(&self) -> bool {
        self.capabilities
            .iter()
            .any(|capability| matches!(capability, Capability::Eth(_)))
    }

    pub fn supports_snap(&self) -> bool {
        self.capabilities
            .iter()
            .any(|capability| matches!(capability, Capability::Snap(_)))
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    pub fn is_connected(&self) -> bool {
        !self.connection.is_closed()
    }

    /// Flips the idle flag from true to false, returns whether this caller won the claim
    pub(crate) fn try_claim(&self) -> bool {
        self.idle
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release(&self) {
        self.idle.store(true, Ordering::Release);
    }

    pub fn head(&self) -> PeerHead {
        self.lock_head().clone()
    }

    pub fn best_hash(&self) -> H256 {
        self.lock_head().best_hash
    }

    /// Records a newly announced head. The cached header is dropped when the hash changes.
    pub fn set_best_hash(&self, best_hash: H256) {
        let mut head = self.lock_head();
        if head.best_hash != best_hash {
            head.best_hash = best_hash;
            head.latest = None;
        }
    }

    pub(crate) fn set_latest(&self, header: BlockHeader) {
        let mut head = self.lock_head();
        head.best_hash = header.hash();
        head.latest = Some(header);
    }

    /// Fails every pending request and any later one with `Disconnected`
    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    fn lock_head(&self) -> MutexGuard<'_, PeerHead> {
        self.head.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
