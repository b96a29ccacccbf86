//! Contract bytecodes by code hash.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::config::SyncConfig;
use crate::error::FetcherError;
use crate::peer::{Snap, SnapPeer};
use crate::store::{StateStore, StoreError};
use crate::types::{H256, keccak};

use super::progress::SnapProgress;
use super::{FetcherKind, Job, JobHandler, StoreReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteCodeTask {
    pub hashes: Vec<H256>,
}

impl fmt::Display for ByteCodeTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} bytecodes", self.hashes.len())
    }
}

/// Hashes of `requested` not yet present in `received`, in request order
pub(crate) fn missing_hashes<T>(requested: &[H256], received: Option<&Vec<(H256, T)>>) -> Vec<H256> {
    let received: HashSet<H256> = received
        .into_iter()
        .flatten()
        .map(|(hash, _)| *hash)
        .collect();
    requested
        .iter()
        .filter(|hash| !received.contains(*hash))
        .copied()
        .collect()
}

/// Pairs each returned blob with the requested hash it hashes to. Peers
/// answer in request order and may skip items, but never reorder them.
pub(crate) fn match_by_hash(
    requested: &[H256],
    blobs: Vec<Bytes>,
) -> Result<Vec<(H256, Bytes)>, FetcherError> {
    let mut pending = requested.iter();
    let mut matched = Vec::with_capacity(blobs.len());
    for blob in blobs {
        let hash = keccak(&blob);
        if !pending.any(|requested| *requested == hash) {
            return Err(FetcherError::InvalidResponse(format!(
                "unrequested or out of order item {hash:#x}"
            )));
        }
        matched.push((hash, blob));
    }
    Ok(matched)
}

pub struct ByteCodeFetcher<S: StateStore> {
    state: Arc<S>,
    progress: Arc<SnapProgress>,
    response_bytes: u64,
}

impl<S: StateStore> ByteCodeFetcher<S> {
    pub fn new(state: Arc<S>, progress: Arc<SnapProgress>, config: &SyncConfig) -> Self {
        Self {
            state,
            progress,
            response_bytes: config.max_response_bytes,
        }
    }
}

#[async_trait]
impl<S: StateStore> JobHandler for ByteCodeFetcher<S> {
    type Task = ByteCodeTask;
    type Response = Vec<(H256, Bytes)>;
    type Output = Vec<(H256, Bytes)>;
    type Capability = Snap;

    const KIND: FetcherKind = FetcherKind::ByteCode;

    async fn tasks(&self) -> Result<Vec<ByteCodeTask>, StoreError> {
        Ok(vec![])
    }

    async fn request(
        &self,
        job: &Job<ByteCodeTask, Vec<(H256, Bytes)>>,
        peer: &SnapPeer,
    ) -> Result<Vec<(H256, Bytes)>, FetcherError> {
        let hashes = missing_hashes(&job.task.hashes, job.partial.as_ref());
        let codes = peer.byte_codes(hashes.clone(), self.response_bytes).await?;
        if codes.is_empty() {
            return Err(FetcherError::EmptyResponse);
        }
        let matched = match_by_hash(&hashes, codes)?;
        debug!(peer = %peer.id(), requested = hashes.len(), received = matched.len(), "Received bytecodes");
        Ok(matched)
    }

    fn process(
        &self,
        job: &mut Job<ByteCodeTask, Vec<(H256, Bytes)>>,
        codes: Vec<(H256, Bytes)>,
    ) -> Result<Option<Vec<(H256, Bytes)>>, FetcherError> {
        let expected = job.task.hashes.len();
        if job.merge(codes).len() >= expected {
            return Ok(job.partial.take());
        }
        Ok(None)
    }

    async fn store(
        &self,
        _task: &ByteCodeTask,
        codes: Vec<(H256, Bytes)>,
    ) -> Result<StoreReport<ByteCodeTask>, StoreError> {
        let items = codes.len();
        self.state.put_codes(codes).await?;
        Ok(StoreReport::items(items))
    }

    fn ordered(&self) -> bool {
        false
    }

    fn wait_for_feed(&self) -> bool {
        true
    }

    async fn on_complete(&self) -> Result<(), StoreError> {
        self.progress.mark_done(FetcherKind::ByteCode);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_match_by_hash_in_request_order() {
        let codes: Vec<Bytes> = (0u8..4).map(|i| Bytes::from(vec![0x60, i])).collect();
        let hashes: Vec<H256> = codes.iter().map(keccak).collect();

        // Second item skipped by the peer
        let matched = match_by_hash(&hashes, vec![codes[0].clone(), codes[2].clone()])
            .expect("items are in request order");
        assert_eq!(matched, vec![(hashes[0], codes[0].clone()), (hashes[2], codes[2].clone())]);

        assert!(match_by_hash(&hashes, vec![codes[2].clone(), codes[0].clone()]).is_err());
        assert!(match_by_hash(&hashes[..2], vec![codes[3].clone()]).is_err());
    }

    #[test]
    fn test_missing_hashes_skips_received() {
        let hashes: Vec<H256> = (1..=4).map(H256::from_low_u64_be).collect();
        let received = vec![(hashes[1], Bytes::new()), (hashes[3], Bytes::new())];
        assert_eq!(
            missing_hashes(&hashes, Some(&received)),
            vec![hashes[0], hashes[2]]
        );
        assert_eq!(missing_hashes::<Bytes>(&hashes, None), hashes);
    }
}
