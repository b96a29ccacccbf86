//! Error types of the sync engine, one enum per layer.

use thiserror::Error;

use crate::fetcher::FetcherKind;
use crate::messages::RequestKind;
use crate::peer::PeerId;
use crate::types::H256;

pub use crate::store::StoreError;

/// Failure of a single wire exchange with one peer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("{kind} request {req_id} to peer {peer:#x} timed out")]
    Timeout {
        peer: PeerId,
        req_id: u64,
        kind: RequestKind,
    },
    #[error("Peer {0:#x} disconnected")]
    Disconnected(PeerId),
    #[error("Failed to send request to peer {0:#x}: {1}")]
    Send(PeerId, String),
    #[error("Unexpected response from peer {peer:#x}, expected {expected}")]
    UnexpectedResponse { peer: PeerId, expected: RequestKind },
    #[error("Request id {0} is already pending")]
    DuplicateRequestId(u64),
}

#[derive(Debug, Clone, Error)]
pub enum FetcherError {
    #[error(transparent)]
    Request(#[from] RequestError),
    /// The peer answered, but the payload failed validation
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Peer returned an empty response")]
    EmptyResponse,
    #[error(
        "{kind} fetcher gave up on task {task} after {attempts} failed attempts (last peer {peer:?}): {source}"
    )]
    RetriesExhausted {
        kind: FetcherKind,
        task: String,
        peer: Option<PeerId>,
        attempts: u32,
        source: Box<FetcherError>,
    },
    #[error("{kind} fetcher failed to store task {task}: {source}")]
    Store {
        kind: FetcherKind,
        task: String,
        source: StoreError,
    },
}

impl FetcherError {
    /// Whether another attempt may succeed. Local store failures will not go
    /// away by asking another peer.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, FetcherError::Store { .. })
    }

    pub fn context(&self) -> ErrorContext {
        match self {
            FetcherError::RetriesExhausted {
                kind, task, peer, ..
            } => ErrorContext {
                kind: Some(*kind),
                task: Some(task.clone()),
                peer: *peer,
            },
            FetcherError::Store { kind, task, .. } => ErrorContext {
                kind: Some(*kind),
                task: Some(task.clone()),
                peer: None,
            },
            FetcherError::Request(
                RequestError::Timeout { peer, .. }
                | RequestError::Disconnected(peer)
                | RequestError::Send(peer, _)
                | RequestError::UnexpectedResponse { peer, .. },
            ) => ErrorContext {
                peer: Some(*peer),
                ..Default::default()
            },
            _ => ErrorContext::default(),
        }
    }
}

/// Where an error happened, attached to sync error events
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub kind: Option<FetcherKind>,
    pub task: Option<String>,
    pub peer: Option<PeerId>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read sync config from environment: {0}")]
    Env(#[from] envy::Error),
    #[error("Invalid sync config: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fetcher(#[from] FetcherError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("State root mismatch after snap sync, expected {expected:#x}, computed {computed:#x}")]
    StateRootMismatch { expected: H256, computed: H256 },
    #[error("Missing local header for synced block {0}")]
    NoTargetHeader(u64),
    #[error(transparent)]
    JoinHandle(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Sync was stopped")]
    Stopped,
}

impl SyncError {
    pub fn is_recoverable(&self) -> bool {
        match self {
            SyncError::Fetcher(error) => error.is_recoverable(),
            SyncError::NoTargetHeader(_) => true,
            SyncError::Store(_)
            | SyncError::StateRootMismatch { .. }
            | SyncError::JoinHandle(_)
            | SyncError::Config(_)
            | SyncError::Stopped => false,
        }
    }

    pub fn context(&self) -> ErrorContext {
        match self {
            SyncError::Fetcher(error) => error.context(),
            _ => ErrorContext::default(),
        }
    }
}
