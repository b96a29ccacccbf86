//! Capability-sealed peer handles.
//!
//! A fetcher never talks to a bare [`Peer`]: it names a [`PeerCapability`]
//! and only receives the handle for peers that negotiated that protocol, so
//! an `eth` fetcher cannot issue snap requests and vice versa.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::RequestError;
use crate::messages::{HashOrNumber, Request, RequestKind, Response};
use crate::types::{AccountState, BlockBody, BlockHeader, H256, Receipt, U256};

use super::{Peer, PeerId};

pub trait PeerCapability: Send + Sync + 'static {
    type Handle: Clone + Send + Sync + 'static;

    fn supports(peer: &Peer) -> bool;

    fn handle(peer: &Arc<Peer>) -> Option<Self::Handle>;
}

/// Block exchange sub-protocol
#[derive(Debug)]
pub struct Eth;

/// State snapshot sub-protocol
#[derive(Debug)]
pub struct Snap;

impl PeerCapability for Eth {
    type Handle = EthPeer;

    fn supports(peer: &Peer) -> bool {
        peer.supports_eth()
    }

    fn handle(peer: &Arc<Peer>) -> Option<EthPeer> {
        Self::supports(peer).then(|| EthPeer(peer.clone()))
    }
}

impl PeerCapability for Snap {
    type Handle = SnapPeer;

    fn supports(peer: &Peer) -> bool {
        peer.supports_snap()
    }

    fn handle(peer: &Arc<Peer>) -> Option<SnapPeer> {
        Self::supports(peer).then(|| SnapPeer(peer.clone()))
    }
}

fn unexpected(peer: &Peer, expected: RequestKind) -> RequestError {
    RequestError::UnexpectedResponse {
        peer: peer.id(),
        expected,
    }
}

#[derive(Debug, Clone)]
pub struct EthPeer(Arc<Peer>);

impl EthPeer {
    pub fn id(&self) -> PeerId {
        self.0.id()
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.0
    }

    pub async fn block_headers(
        &self,
        start: HashOrNumber,
        limit: u64,
        skip: u64,
        reverse: bool,
    ) -> Result<Vec<BlockHeader>, RequestError> {
        let request = Request::GetBlockHeaders {
            start,
            limit,
            skip,
            reverse,
        };
        match self.0.connection().request(request).await? {
            Response::BlockHeaders(headers) => Ok(headers),
            _ => Err(unexpected(&self.0, RequestKind::BlockHeaders)),
        }
    }

    pub async fn block_bodies(&self, hashes: Vec<H256>) -> Result<Vec<BlockBody>, RequestError> {
        match self
            .0
            .connection()
            .request(Request::GetBlockBodies { hashes })
            .await?
        {
            Response::BlockBodies(bodies) => Ok(bodies),
            _ => Err(unexpected(&self.0, RequestKind::BlockBodies)),
        }
    }

    pub async fn receipts(&self, hashes: Vec<H256>) -> Result<Vec<Vec<Receipt>>, RequestError> {
        match self
            .0
            .connection()
            .request(Request::GetReceipts { hashes })
            .await?
        {
            Response::Receipts(receipts) => Ok(receipts),
            _ => Err(unexpected(&self.0, RequestKind::Receipts)),
        }
    }

    /// Header of the peer's best block.
    ///
    /// Cached until the peer announces a new head, otherwise fetched by the
    /// best hash. Returns `None` if the peer does not serve its own head.
    pub async fn latest(&self) -> Result<Option<BlockHeader>, RequestError> {
        let head = self.0.head();
        if let Some(latest) = head.latest {
            return Ok(Some(latest));
        }
        let headers = self
            .block_headers(HashOrNumber::Hash(head.best_hash), 1, 0, false)
            .await?;
        let latest = headers
            .into_iter()
            .next()
            .filter(|header| header.hash() == head.best_hash);
        if let Some(header) = &latest {
            self.0.set_latest(header.clone());
        }
        Ok(latest)
    }
}

#[derive(Debug, Clone)]
pub struct SnapPeer(Arc<Peer>);

impl SnapPeer {
    pub fn id(&self) -> PeerId {
        self.0.id()
    }

    pub fn peer(&self) -> &Arc<Peer> {
        &self.0
    }

    pub async fn account_range(
        &self,
        root: H256,
        origin: H256,
        limit: H256,
        response_bytes: u64,
    ) -> Result<(Vec<(H256, AccountState)>, Vec<Bytes>), RequestError> {
        let request = Request::GetAccountRange {
            root,
            origin,
            limit,
            response_bytes,
        };
        match self.0.connection().request(request).await? {
            Response::AccountRange { accounts, proof } => Ok((accounts, proof)),
            _ => Err(unexpected(&self.0, RequestKind::AccountRange)),
        }
    }

    pub async fn storage_ranges(
        &self,
        root: H256,
        accounts: Vec<H256>,
        origin: H256,
        limit: H256,
        response_bytes: u64,
    ) -> Result<(Vec<Vec<(H256, U256)>>, Vec<Bytes>), RequestError> {
        let request = Request::GetStorageRanges {
            root,
            accounts,
            origin,
            limit,
            response_bytes,
        };
        match self.0.connection().request(request).await? {
            Response::StorageRanges { slots, proof } => Ok((slots, proof)),
            _ => Err(unexpected(&self.0, RequestKind::StorageRanges)),
        }
    }

    pub async fn byte_codes(
        &self,
        hashes: Vec<H256>,
        response_bytes: u64,
    ) -> Result<Vec<Bytes>, RequestError> {
        let request = Request::GetByteCodes {
            hashes,
            response_bytes,
        };
        match self.0.connection().request(request).await? {
            Response::ByteCodes(codes) => Ok(codes),
            _ => Err(unexpected(&self.0, RequestKind::ByteCodes)),
        }
    }

    pub async fn trie_nodes(
        &self,
        root: H256,
        hashes: Vec<H256>,
        response_bytes: u64,
    ) -> Result<Vec<Bytes>, RequestError> {
        let request = Request::GetTrieNodes {
            root,
            hashes,
            response_bytes,
        };
        match self.0.connection().request(request).await? {
            Response::TrieNodes(nodes) => Ok(nodes),
            _ => Err(unexpected(&self.0, RequestKind::TrieNodes)),
        }
    }
}
