use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::*;
use crate::error::ConfigError;
use crate::fetcher::FetcherConfig;
use crate::peer::RequestTimeouts;

pub const SYNC_CONFIG_PREFIX: &str = "ETHREX_SYNC_";

/// Tunables of the sync engine.
///
/// Every field has a default, so any subset can be overridden through the
/// environment, e.g. `ETHREX_SYNC_MAX_JOBS=32`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_jobs: usize,
    pub max_requests: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_buffered_results: usize,
    pub min_peers: usize,
    pub snap_availability_depth: u64,
    pub force_sync_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub max_blocks_per_request: u64,
    pub account_range_chunks: usize,
    pub storage_accounts_per_request: usize,
    pub byte_codes_per_request: usize,
    pub trie_nodes_per_request: usize,
    pub max_response_bytes: u64,
    pub headers_timeout_ms: u64,
    pub bodies_timeout_ms: u64,
    pub receipts_timeout_ms: u64,
    pub snap_timeout_ms: u64,
    pub trie_nodes_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_jobs: MAX_JOBS_DEFAULT,
            max_requests: MAX_REQUESTS_DEFAULT,
            max_retries: MAX_RETRIES_DEFAULT,
            retry_backoff_ms: RETRY_BACKOFF_DEFAULT.as_millis() as u64,
            max_buffered_results: MAX_BUFFERED_RESULTS_DEFAULT,
            min_peers: MIN_PEERS_DEFAULT,
            snap_availability_depth: SNAP_AVAILABILITY_DEPTH_DEFAULT,
            force_sync_timeout_secs: FORCE_SYNC_TIMEOUT_DEFAULT.as_secs(),
            poll_interval_ms: POLL_INTERVAL_DEFAULT.as_millis() as u64,
            max_blocks_per_request: MAX_BLOCKS_PER_REQUEST_DEFAULT,
            account_range_chunks: ACCOUNT_RANGE_CHUNKS_DEFAULT,
            storage_accounts_per_request: STORAGE_ACCOUNTS_PER_REQUEST_DEFAULT,
            byte_codes_per_request: BYTE_CODES_PER_REQUEST_DEFAULT,
            trie_nodes_per_request: TRIE_NODES_PER_REQUEST_DEFAULT,
            max_response_bytes: MAX_RESPONSE_BYTES_DEFAULT,
            headers_timeout_ms: HEADERS_TIMEOUT_DEFAULT.as_millis() as u64,
            bodies_timeout_ms: BODIES_TIMEOUT_DEFAULT.as_millis() as u64,
            receipts_timeout_ms: RECEIPTS_TIMEOUT_DEFAULT.as_millis() as u64,
            snap_timeout_ms: SNAP_TIMEOUT_DEFAULT.as_millis() as u64,
            trie_nodes_timeout_ms: TRIE_NODES_TIMEOUT_DEFAULT.as_millis() as u64,
        }
    }
}

impl SyncConfig {
    /// Reads `ETHREX_SYNC_*` overrides on top of the defaults and validates the result
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = envy::prefixed(SYNC_CONFIG_PREFIX).from_env::<Self>()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let bounds = [
            ("max_jobs", self.max_jobs),
            ("max_requests", self.max_requests),
            ("max_buffered_results", self.max_buffered_results),
            ("account_range_chunks", self.account_range_chunks),
            ("storage_accounts_per_request", self.storage_accounts_per_request),
            ("byte_codes_per_request", self.byte_codes_per_request),
            ("trie_nodes_per_request", self.trie_nodes_per_request),
        ];
        if let Some((name, _)) = bounds.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be greater than zero")));
        }
        if self.max_blocks_per_request == 0 {
            return Err(ConfigError::Invalid(
                "max_blocks_per_request must be greater than zero".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn fetcher_config(&self) -> FetcherConfig {
        FetcherConfig {
            max_jobs: self.max_jobs,
            max_requests: self.max_requests,
            max_retries: self.max_retries,
            retry_backoff: Duration::from_millis(self.retry_backoff_ms),
            max_buffered_results: self.max_buffered_results,
            poll_interval: self.poll_interval(),
        }
    }

    pub fn request_timeouts(&self) -> RequestTimeouts {
        RequestTimeouts {
            headers: Duration::from_millis(self.headers_timeout_ms),
            bodies: Duration::from_millis(self.bodies_timeout_ms),
            receipts: Duration::from_millis(self.receipts_timeout_ms),
            snap: Duration::from_millis(self.snap_timeout_ms),
            trie_nodes: Duration::from_millis(self.trie_nodes_timeout_ms),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn force_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.force_sync_timeout_secs)
    }
}
