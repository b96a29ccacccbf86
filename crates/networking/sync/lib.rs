//! # ethrex Sync Engine
//!
//! Peer fan-out synchronization engine for the ethrex Ethereum client.
//!
//! ## Overview
//!
//! This crate turns many independent request/response exchanges with untrusted
//! peers into an ordered, verifiable and resumable local copy of chain data:
//! - **Job engine**: a generic [`fetcher::Fetcher`] that partitions work into tasks,
//!   assigns them to idle peers and drives a request → process → store pipeline
//! - **Concrete fetchers**: blocks, receipts, account ranges, storage ranges,
//!   bytecodes and trie nodes
//! - **Synchronizers**: full sync (replay every block) and snap sync (fetch the
//!   state of a fixed root directly)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        Synchronizers                          │
//! │  ┌──────────────────────┐        ┌──────────────────────────┐ │
//! │  │   FullSynchronizer   │        │     SnapSynchronizer     │ │
//! │  └──────────────────────┘        └──────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────┘
//!              │                                │
//!              ▼                                ▼
//! ┌─────────────────────┐  ┌──────────────────────────────────────┐
//! │    BlockFetcher     │  │ Account / Storage / ByteCode / Trie  │
//! └─────────────────────┘  └──────────────────────────────────────┘
//!              │        Fetcher (job engine)    │
//!              ▼                                ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │   PeerPool ── Peer ── PeerConnection ── RequestChannel        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`fetcher`] | Generic job engine and the per-kind fetchers |
//! | [`synchronizer`] | Full and snap synchronization strategies |
//! | [`peer`] | Peers, capability handles and request/response correlation |
//! | [`peer_pool`] | Set of usable peers and idle-peer selection |
//! | [`store`] | Chain and state store collaborators |
//! | [`events`] | Sync lifecycle events for external observers |
//! | [`config`] | Tunables, with environment overrides |
//!
//! ## Quick Start
//!
//! ```ignore
//! use ethrex_sync::{FullSynchronizer, PeerPool, SyncConfig};
//!
//! let pool = PeerPool::new();
//! let mut synchronizer = FullSynchronizer::new(pool.clone(), chain, SyncConfig::from_env()?);
//! let mut events = synchronizer.subscribe();
//!
//! // Peers are added by the networking layer once their handshake completes
//! pool.add(peer);
//!
//! let height = synchronizer.run(cancel_token).await?;
//! ```

pub mod config;
pub mod constants;
pub mod error;
pub mod events;
pub mod fetcher;
pub mod messages;
pub mod peer;
pub mod peer_pool;
pub mod store;
pub mod synchronizer;
pub mod types;

pub use config::SyncConfig;
pub use error::SyncError;
pub use events::{EventSender, SyncEvent};
pub use fetcher::{Fetcher, FetcherHandle, FetcherKind};
pub use peer::{Peer, PeerId};
pub use peer_pool::PeerPool;
pub use synchronizer::{FullSynchronizer, SnapSynchronizer, SyncMode, Synchronizer};
