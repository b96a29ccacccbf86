//! Sync lifecycle events for external observers (metrics, logging, RPC).

use tokio::sync::broadcast;

use crate::error::{ErrorContext, SyncError};
use crate::fetcher::FetcherKind;
use crate::peer::PeerId;
use crate::synchronizer::SyncMode;
use crate::types::H256;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SyncStarted {
        mode: SyncMode,
        target_height: u64,
    },
    FetchedBlocks {
        first: u64,
        count: usize,
    },
    SyncError {
        mode: SyncMode,
        error: String,
        recoverable: bool,
        kind: Option<FetcherKind>,
        task: Option<String>,
        peer: Option<PeerId>,
    },
    SyncComplete {
        height: u64,
        root: H256,
    },
}

impl SyncEvent {
    pub fn error(mode: SyncMode, error: &SyncError) -> Self {
        let ErrorContext { kind, task, peer } = error.context();
        SyncEvent::SyncError {
            mode,
            error: error.to_string(),
            recoverable: error.is_recoverable(),
            kind,
            task,
            peer,
        }
    }
}

/// Cloneable emitter shared by the synchronizer and its fetchers.
/// Emitting never blocks and never fails, events without subscribers are dropped.
#[derive(Debug, Clone)]
pub struct EventSender {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventSender {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSender {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: SyncEvent) {
        // An error only means nobody is listening
        let _ = self.sender.send(event);
    }
}
