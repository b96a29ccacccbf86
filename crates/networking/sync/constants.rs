//! Constants used throughout the sync engine.
//!
//! This module centralizes the default values of every tunable exposed by
//! [`SyncConfig`](crate::config::SyncConfig).

use std::time::Duration;

// ============================================================================
// Job Engine Constants
// ============================================================================

/// Maximum amount of jobs in flight for a single fetcher.
pub const MAX_JOBS_DEFAULT: usize = 16;

/// Maximum amount of wire requests in flight for a single fetcher.
pub const MAX_REQUESTS_DEFAULT: usize = 32;

/// Number of failed attempts a job may accumulate before the fetcher gives up.
pub const MAX_RETRIES_DEFAULT: u32 = 5;

/// Base delay before a failed job is scheduled again. It grows linearly with the attempt count.
pub const RETRY_BACKOFF_DEFAULT: Duration = Duration::from_millis(250);

/// Amount of finished results an ordered fetcher holds back while waiting for a lower task.
pub const MAX_BUFFERED_RESULTS_DEFAULT: usize = 64;

// ============================================================================
// Synchronizer Constants
// ============================================================================

/// Minimum amount of syncable peers before a best peer is picked.
pub const MIN_PEERS_DEFAULT: usize = 2;

/// The snap sync limit - number of blocks the head may move past the snap target
/// before the target is considered unavailable on peers.
pub const SNAP_AVAILABILITY_DEPTH_DEFAULT: u64 = 128;

/// Time after which sync starts even if fewer than `min_peers` peers are connected.
pub const FORCE_SYNC_TIMEOUT_DEFAULT: Duration = Duration::from_secs(60);

/// Interval between best peer polls while syncing.
pub const POLL_INTERVAL_DEFAULT: Duration = Duration::from_secs(1);

// ============================================================================
// Request Size Constants
// ============================================================================

/// Maximum number of blocks to request per request.
/// This magic number is not part of the protocol and is taken from geth.
/// See: https://github.com/ethereum/go-ethereum/blob/2585776aabbd4ae9b00050403b42afb0cee968ec/eth/downloader/downloader.go#L42-L43
pub const MAX_BLOCKS_PER_REQUEST_DEFAULT: u64 = 128;

/// Number of chunks to split the account hash space into for parallel downloading.
pub const ACCOUNT_RANGE_CHUNKS_DEFAULT: usize = 16;

/// Maximum number of accounts to request storage for in a single batch.
pub const STORAGE_ACCOUNTS_PER_REQUEST_DEFAULT: usize = 300;

/// Maximum number of bytecodes to request in a single peer request.
pub const BYTE_CODES_PER_REQUEST_DEFAULT: usize = 100;

/// Maximum size of a batch of trie nodes requested from a single peer.
pub const TRIE_NODES_PER_REQUEST_DEFAULT: usize = 500;

/// Maximum bytes expected in a snap protocol response.
/// This is sent to peers to indicate how much data we're willing to receive.
pub const MAX_RESPONSE_BYTES_DEFAULT: u64 = 512 * 1024;

// ============================================================================
// Peer/Network Constants
// ============================================================================

pub const HEADERS_TIMEOUT_DEFAULT: Duration = Duration::from_secs(8);
pub const BODIES_TIMEOUT_DEFAULT: Duration = Duration::from_secs(10);
pub const RECEIPTS_TIMEOUT_DEFAULT: Duration = Duration::from_secs(10);

/// Timeout for account, storage and bytecode requests.
pub const SNAP_TIMEOUT_DEFAULT: Duration = Duration::from_secs(15);

pub const TRIE_NODES_TIMEOUT_DEFAULT: Duration = Duration::from_secs(20);
