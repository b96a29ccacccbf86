use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::AbortHandle;
use tracing::{debug, trace};

use crate::constants::{
    BODIES_TIMEOUT_DEFAULT, HEADERS_TIMEOUT_DEFAULT, RECEIPTS_TIMEOUT_DEFAULT,
    SNAP_TIMEOUT_DEFAULT, TRIE_NODES_TIMEOUT_DEFAULT,
};
use crate::error::RequestError;
use crate::messages::{Request, RequestKind, Response};

use super::PeerId;

/// Outgoing half of a peer connection, implemented by the transport.
///
/// Responses are not returned here: the transport decodes them and hands
/// them to [`PeerConnection::on_response`] with the id the request was sent with.
pub trait RequestChannel: Send + Sync + Debug {
    fn send(&self, req_id: u64, request: Request) -> Result<(), RequestError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTimeouts {
    pub headers: Duration,
    pub bodies: Duration,
    pub receipts: Duration,
    /// Account ranges, storage ranges and bytecodes
    pub snap: Duration,
    pub trie_nodes: Duration,
}

impl Default for RequestTimeouts {
    fn default() -> Self {
        Self {
            headers: HEADERS_TIMEOUT_DEFAULT,
            bodies: BODIES_TIMEOUT_DEFAULT,
            receipts: RECEIPTS_TIMEOUT_DEFAULT,
            snap: SNAP_TIMEOUT_DEFAULT,
            trie_nodes: TRIE_NODES_TIMEOUT_DEFAULT,
        }
    }
}

impl RequestTimeouts {
    pub fn for_kind(&self, kind: RequestKind) -> Duration {
        match kind {
            RequestKind::BlockHeaders => self.headers,
            RequestKind::BlockBodies => self.bodies,
            RequestKind::Receipts => self.receipts,
            RequestKind::AccountRange | RequestKind::StorageRanges | RequestKind::ByteCodes => {
                self.snap
            }
            RequestKind::TrieNodes => self.trie_nodes,
        }
    }
}

type ResolverSender = oneshot::Sender<Result<Response, RequestError>>;

/// Pending request record. It is only ever used by value, after being
/// removed from the registry, so it fires at most once.
#[derive(Debug)]
struct RequestResolver {
    sender: ResolverSender,
    timeout: AbortHandle,
    kind: RequestKind,
}

impl RequestResolver {
    fn fire(self, result: Result<Response, RequestError>) {
        self.timeout.abort();
        // The requester may have given up already
        let _ = self.sender.send(result);
    }
}

/// Registry of the requests in flight on one connection, keyed by request id.
#[derive(Debug)]
pub struct PendingRequests {
    peer_id: PeerId,
    next_id: AtomicU64,
    resolvers: Mutex<HashMap<u64, RequestResolver>>,
}

impl PendingRequests {
    pub fn new(peer_id: PeerId) -> Arc<Self> {
        Arc::new(Self {
            peer_id,
            next_id: AtomicU64::new(1),
            resolvers: Mutex::new(HashMap::new()),
        })
    }

    pub fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a resolver for `req_id` and arms its timeout.
    /// Must be called from within a tokio runtime.
    pub fn register(
        self: &Arc<Self>,
        req_id: u64,
        kind: RequestKind,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<Response, RequestError>>, RequestError> {
        let mut resolvers = self.lock();
        if resolvers.contains_key(&req_id) {
            return Err(RequestError::DuplicateRequestId(req_id));
        }
        let (sender, receiver) = oneshot::channel();
        let registry: Weak<Self> = Arc::downgrade(self);
        let deadline = tokio::time::Instant::now() + timeout;
        // The timer can only reach the map after this insert releases the lock
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            if let Some(registry) = registry.upgrade() {
                registry.expire(req_id);
            }
        });
        resolvers.insert(
            req_id,
            RequestResolver {
                sender,
                timeout: timer.abort_handle(),
                kind,
            },
        );
        Ok(receiver)
    }

    /// Delivers a response. Returns false if no request with this id is pending,
    /// which is the case for late responses after a timeout.
    pub fn resolve(&self, req_id: u64, response: Response) -> bool {
        let Some(resolver) = self.take(req_id) else {
            debug!(peer = %self.peer_id, req_id, "Ignoring response for unknown request");
            return false;
        };
        if response.kind() != resolver.kind {
            let expected = resolver.kind;
            resolver.fire(Err(RequestError::UnexpectedResponse {
                peer: self.peer_id,
                expected,
            }));
        } else {
            resolver.fire(Ok(response));
        }
        true
    }

    pub fn reject(&self, req_id: u64, error: RequestError) -> bool {
        match self.take(req_id) {
            Some(resolver) => {
                resolver.fire(Err(error));
                true
            }
            None => false,
        }
    }

    /// Timeout path, fired by the timer armed in [`PendingRequests::register`]
    pub fn expire(&self, req_id: u64) -> bool {
        let Some(resolver) = self.take(req_id) else {
            return false;
        };
        trace!(peer = %self.peer_id, req_id, kind = %resolver.kind, "Request timed out");
        let kind = resolver.kind;
        resolver.fire(Err(RequestError::Timeout {
            peer: self.peer_id,
            req_id,
            kind,
        }));
        true
    }

    /// Drops the resolver without notifying anyone, used when the requester is gone
    fn cancel(&self, req_id: u64) {
        if let Some(resolver) = self.take(req_id) {
            resolver.timeout.abort();
        }
    }

    /// Rejects every pending request with `Disconnected`, returns how many were pending
    pub fn reject_all(&self) -> usize {
        let drained: Vec<RequestResolver> = self.lock().drain().map(|(_, r)| r).collect();
        let count = drained.len();
        for resolver in drained {
            resolver.fire(Err(RequestError::Disconnected(self.peer_id)));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removal is the consuming step: whoever takes the resolver is the only one who can fire it
    fn take(&self, req_id: u64) -> Option<RequestResolver> {
        self.lock().remove(&req_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, RequestResolver>> {
        self.resolvers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes the resolver if the awaiting request future is dropped early
struct CancelOnDrop<'a> {
    pending: &'a PendingRequests,
    req_id: u64,
}

impl Drop for CancelOnDrop<'_> {
    fn drop(&mut self) {
        self.pending.cancel(self.req_id);
    }
}

/// Request capability of one peer: correlates requests sent over the
/// [`RequestChannel`] with the responses the transport reports back.
#[derive(Debug)]
pub struct PeerConnection {
    peer_id: PeerId,
    channel: Arc<dyn RequestChannel>,
    pending: Arc<PendingRequests>,
    timeouts: RequestTimeouts,
    closed: AtomicBool,
}

impl PeerConnection {
    pub fn new(peer_id: PeerId, channel: Arc<dyn RequestChannel>, timeouts: RequestTimeouts) -> Self {
        Self::with_pending(channel, PendingRequests::new(peer_id), timeouts)
    }

    /// Builds a connection around an existing registry, so the transport can
    /// keep its own handle to deliver responses.
    pub fn with_pending(
        channel: Arc<dyn RequestChannel>,
        pending: Arc<PendingRequests>,
        timeouts: RequestTimeouts,
    ) -> Self {
        Self {
            peer_id: pending.peer_id,
            channel,
            pending,
            timeouts,
            closed: AtomicBool::new(false),
        }
    }

    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends `request` and waits for exactly one of: its response, its
    /// rejection or its timeout.
    pub async fn request(&self, request: Request) -> Result<Response, RequestError> {
        if self.is_closed() {
            return Err(RequestError::Disconnected(self.peer_id));
        }
        let kind = request.kind();
        let req_id = self.pending.next_request_id();
        let receiver = self
            .pending
            .register(req_id, kind, self.timeouts.for_kind(kind))?;
        let _guard = CancelOnDrop {
            pending: self.pending.as_ref(),
            req_id,
        };

        if let Err(error) = self.channel.send(req_id, request) {
            self.pending.reject(req_id, error.clone());
            return Err(error);
        }
        // A disconnect may have drained the registry before our insert
        if self.is_closed() {
            self.pending
                .reject(req_id, RequestError::Disconnected(self.peer_id));
        }

        match receiver.await {
            Ok(result) => result,
            Err(_) => Err(RequestError::Disconnected(self.peer_id)),
        }
    }

    pub fn on_response(&self, req_id: u64, response: Response) -> bool {
        self.pending.resolve(req_id, response)
    }

    pub fn disconnect(&self) {
        self.closed.store(true, Ordering::Release);
        let rejected = self.pending.reject_all();
        if rejected > 0 {
            debug!(peer = %self.peer_id, rejected, "Rejected pending requests on disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::H256;

    fn headers_response() -> Response {
        Response::BlockHeaders(vec![])
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_response_after_timeout_is_ignored() {
        let pending = PendingRequests::new(H256::repeat_byte(1));
        let timeout = Duration::from_millis(500);
        let receiver = pending
            .register(42, RequestKind::BlockHeaders, timeout)
            .expect("id 42 is free");

        tokio::time::advance(timeout).await;
        let result = receiver.await.expect("resolver fired");
        assert!(matches!(
            result,
            Err(RequestError::Timeout { req_id: 42, .. })
        ));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!pending.resolve(42, headers_response()));
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_before_timeout_disarms_timer() {
        let pending = PendingRequests::new(H256::repeat_byte(1));
        let receiver = pending
            .register(7, RequestKind::BlockHeaders, Duration::from_secs(1))
            .expect("id 7 is free");
        assert!(pending.resolve(7, headers_response()));
        assert!(matches!(receiver.await, Ok(Ok(Response::BlockHeaders(_)))));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(!pending.expire(7));
        assert!(!pending.reject(7, RequestError::Disconnected(H256::zero())));
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_rejected() {
        let pending = PendingRequests::new(H256::repeat_byte(1));
        let _receiver = pending
            .register(1, RequestKind::ByteCodes, Duration::from_secs(1))
            .expect("id 1 is free");
        assert_eq!(
            pending
                .register(1, RequestKind::ByteCodes, Duration::from_secs(1))
                .err(),
            Some(RequestError::DuplicateRequestId(1))
        );
    }

    #[tokio::test]
    async fn test_mismatched_response_kind() {
        let peer = H256::repeat_byte(1);
        let pending = PendingRequests::new(peer);
        let receiver = pending
            .register(3, RequestKind::BlockBodies, Duration::from_secs(1))
            .expect("id 3 is free");
        assert!(pending.resolve(3, headers_response()));
        assert_eq!(
            receiver.await.expect("resolver fired"),
            Err(RequestError::UnexpectedResponse {
                peer,
                expected: RequestKind::BlockBodies
            })
        );
    }

    #[tokio::test]
    async fn test_reject_all_fails_every_pending_request() {
        let peer = H256::repeat_byte(2);
        let pending = PendingRequests::new(peer);
        let first = pending
            .register(1, RequestKind::TrieNodes, Duration::from_secs(5))
            .expect("id 1 is free");
        let second = pending
            .register(2, RequestKind::AccountRange, Duration::from_secs(5))
            .expect("id 2 is free");
        assert_eq!(pending.reject_all(), 2);
        assert_eq!(first.await.ok(), Some(Err(RequestError::Disconnected(peer))));
        assert_eq!(second.await.ok(), Some(Err(RequestError::Disconnected(peer))));
        assert_eq!(pending.reject_all(), 0);
    }

    #[derive(Debug)]
    struct FailingChannel;

    impl RequestChannel for FailingChannel {
        fn send(&self, _req_id: u64, _request: Request) -> Result<(), RequestError> {
            Err(RequestError::Send(H256::zero(), "socket closed".to_string()))
        }
    }

    #[tokio::test]
    async fn test_send_failure_leaves_nothing_pending() {
        let connection = PeerConnection::new(
            H256::zero(),
            Arc::new(FailingChannel),
            RequestTimeouts::default(),
        );
        let result = connection
            .request(Request::GetBlockBodies { hashes: vec![] })
            .await;
        assert!(matches!(result, Err(RequestError::Send(..))));
        assert!(connection.pending().is_empty());
    }

    #[tokio::test]
    async fn test_requests_after_disconnect_fail_fast() {
        let connection = PeerConnection::new(
            H256::zero(),
            Arc::new(super::super::tests::NullChannel),
            RequestTimeouts::default(),
        );
        connection.disconnect();
        let result = connection
            .request(Request::GetBlockBodies { hashes: vec![] })
            .await;
        assert_eq!(result, Err(RequestError::Disconnected(H256::zero())));
    }

    #[tokio::test]
    async fn test_disconnect_rejects_in_flight_request() {
        let connection = Arc::new(PeerConnection::new(
            H256::zero(),
            Arc::new(super::super::tests::NullChannel),
            RequestTimeouts::default(),
        ));
        let requester = connection.clone();
        let request = tokio::spawn(async move {
            requester
                .request(Request::GetReceipts { hashes: vec![] })
                .await
        });
        while connection.pending().is_empty() {
            tokio::task::yield_now().await;
        }
        connection.disconnect();
        let result = request.await.expect("request task panicked");
        assert_eq!(result, Err(RequestError::Disconnected(H256::zero())));
    }
}
