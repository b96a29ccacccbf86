//! The job engine shared by every fetcher.
//!
//! A [`Fetcher`] owns a queue of tasks and turns them into stored results:
//!
//! ```text
//!  tasks() / feed ──► idle queue ──next()──► in flight ──request()──► process()
//!                        ▲                                              │
//!                        │         partial or failed                    │ complete
//!                        └──────────────────────────────────────────────┤
//!                                                                       ▼
//!                                                 held back (ordered) ► store()
//! ```
//!
//! The per-kind behaviour lives in a [`JobHandler`]. The engine takes care of
//! peer assignment, concurrency bounds, retries, partial results and the
//! order in which results reach the store.

mod job;

pub mod account;
pub mod block;
pub mod bytecode;
pub mod progress;
pub mod receipt;
pub mod storage;
pub mod trie_node;

use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{
    MAX_BUFFERED_RESULTS_DEFAULT, MAX_JOBS_DEFAULT, MAX_REQUESTS_DEFAULT, MAX_RETRIES_DEFAULT,
    POLL_INTERVAL_DEFAULT, RETRY_BACKOFF_DEFAULT,
};
use crate::error::FetcherError;
use crate::peer::{PeerCapability, PeerId};
use crate::peer_pool::{PeerLease, PeerPool};
use crate::store::StoreError;

pub use job::{Job, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetcherKind {
    Block,
    Receipt,
    Account,
    Storage,
    ByteCode,
    TrieNode,
}

impl Display for FetcherKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FetcherKind::Block => "block",
            FetcherKind::Receipt => "receipt",
            FetcherKind::Account => "account",
            FetcherKind::Storage => "storage",
            FetcherKind::ByteCode => "bytecode",
            FetcherKind::TrieNode => "trie node",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Bound of the in-flight job table
    pub max_jobs: usize,
    /// Bound of concurrent `request()` calls, see [`Fetcher::with_request_limit`]
    pub max_requests: usize,
    /// Failed attempts a job may be retried after before the fetcher gives up
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Finished results an ordered fetcher may hold back before it stops scheduling
    pub max_buffered_results: usize,
    pub poll_interval: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            max_jobs: MAX_JOBS_DEFAULT,
            max_requests: MAX_REQUESTS_DEFAULT,
            max_retries: MAX_RETRIES_DEFAULT,
            retry_backoff: RETRY_BACKOFF_DEFAULT,
            max_buffered_results: MAX_BUFFERED_RESULTS_DEFAULT,
            poll_interval: POLL_INTERVAL_DEFAULT,
        }
    }
}

/// Outcome of a successful `store()`
#[derive(Debug)]
pub struct StoreReport<T> {
    /// Items actually committed. May be lower than what was handed over.
    pub items: usize,
    /// New tasks discovered while storing, queued on the same fetcher
    pub follow_up: Vec<T>,
}

impl<T> StoreReport<T> {
    pub fn items(items: usize) -> Self {
        Self {
            items,
            follow_up: vec![],
        }
    }
}

type PeerHandle<H> = <<H as JobHandler>::Capability as PeerCapability>::Handle;

/// Per-kind hooks of a fetcher
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    type Task: Clone + Debug + Display + Send + Sync + 'static;
    type Response: Send + 'static;
    type Output: Debug + Send + Sync + 'static;
    type Capability: PeerCapability;

    const KIND: FetcherKind;

    /// Initial partition of the work
    async fn tasks(&self) -> Result<Vec<Self::Task>, StoreError>;

    /// Issues the wire requests for the part of the task not yet in `job.partial`
    async fn request(
        &self,
        job: &Job<Self::Task, Self::Output>,
        peer: &<Self::Capability as PeerCapability>::Handle,
    ) -> Result<Self::Response, FetcherError>;

    /// Merges `response` into the job. Returns the full result once the task
    /// is covered, `None` if another round is needed.
    fn process(
        &self,
        job: &mut Job<Self::Task, Self::Output>,
        response: Self::Response,
    ) -> Result<Option<Self::Output>, FetcherError>;

    async fn store(
        &self,
        task: &Self::Task,
        output: Self::Output,
    ) -> Result<StoreReport<Self::Task>, StoreError>;

    /// Whether results must reach `store()` in task order
    fn ordered(&self) -> bool {
        true
    }

    /// Whether the fetcher keeps running until its feed closes
    fn wait_for_feed(&self) -> bool {
        false
    }

    /// Called once, after the last result was stored
    async fn on_complete(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Feeds tasks into a running fetcher.
#[derive(Debug)]
pub struct TaskSender<T> {
    sender: mpsc::UnboundedSender<Vec<T>>,
}

impl<T> Clone for TaskSender<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<T> TaskSender<T> {
    /// Queues `tasks`, handing them back if the fetcher no longer accepts tasks
    pub fn send(&self, tasks: Vec<T>) -> Result<(), Vec<T>> {
        if tasks.is_empty() {
            return Ok(());
        }
        self.sender.send(tasks).map_err(|error| error.0)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

#[derive(Debug, Default)]
struct FetcherStatus {
    running: AtomicBool,
    errored: AtomicBool,
    stored_results: AtomicU64,
    stored_items: AtomicU64,
    failed_attempts: AtomicU64,
}

/// Control and observation side of a fetcher, usable from other tasks
#[derive(Debug, Clone)]
pub struct FetcherHandle {
    kind: FetcherKind,
    cancel: CancellationToken,
    status: Arc<FetcherStatus>,
}

impl FetcherHandle {
    pub fn kind(&self) -> FetcherKind {
        self.kind
    }

    /// Refuses any further scheduling round. A `store()` in progress completes.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_errored(&self) -> bool {
        self.status.errored.load(Ordering::Acquire)
    }

    pub fn is_running(&self) -> bool {
        self.status.running.load(Ordering::Acquire)
    }

    pub fn stored_results(&self) -> u64 {
        self.status.stored_results.load(Ordering::Relaxed)
    }

    pub fn stored_items(&self) -> u64 {
        self.status.stored_items.load(Ordering::Relaxed)
    }

    pub fn failed_attempts(&self) -> u64 {
        self.status.failed_attempts.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetcherSummary {
    pub stored_results: u64,
    pub stored_items: u64,
    pub failed_attempts: u64,
    pub stopped: bool,
}

struct Attempt<H: JobHandler> {
    job: Job<H::Task, H::Output>,
    lease: PeerLease,
    result: Result<H::Response, FetcherError>,
}

enum Wake<H: JobHandler> {
    Stopped,
    Completed(Attempt<H>),
    Fed(Vec<H::Task>),
    FeedClosed,
    Tick,
}

pub struct Fetcher<H: JobHandler> {
    handler: Arc<H>,
    pool: PeerPool,
    config: FetcherConfig,
    requests: Arc<Semaphore>,
    queue: BTreeMap<u64, Job<H::Task, H::Output>>,
    in_flight: FuturesUnordered<BoxFuture<'static, Attempt<H>>>,
    /// Finished results waiting for a lower index to be stored
    finished: BTreeMap<u64, (H::Task, H::Output)>,
    next_index: u64,
    next_store: u64,
    feed: mpsc::UnboundedReceiver<Vec<H::Task>>,
    feed_closed: bool,
    cancel: CancellationToken,
    status: Arc<FetcherStatus>,
}

impl<H: JobHandler> Fetcher<H> {
    pub fn new(handler: H, pool: PeerPool, config: FetcherConfig) -> (Self, TaskSender<H::Task>) {
        let (sender, feed) = mpsc::unbounded_channel();
        let requests = Arc::new(Semaphore::new(config.max_requests));
        let fetcher = Self {
            handler: Arc::new(handler),
            pool,
            config,
            requests,
            queue: BTreeMap::new(),
            in_flight: FuturesUnordered::new(),
            finished: BTreeMap::new(),
            next_index: 0,
            next_store: 0,
            feed,
            feed_closed: false,
            cancel: CancellationToken::new(),
            status: Arc::new(FetcherStatus::default()),
        };
        (fetcher, TaskSender { sender })
    }

    /// Shares a request budget with other fetchers instead of using a private one
    pub fn with_request_limit(mut self, requests: Arc<Semaphore>) -> Self {
        self.requests = requests;
        self
    }

    /// Stops this fetcher whenever `parent` is cancelled
    pub fn with_parent_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn handle(&self) -> FetcherHandle {
        FetcherHandle {
            kind: H::KIND,
            cancel: self.cancel.clone(),
            status: self.status.clone(),
        }
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    /// Runs until every task is stored, the fetcher is stopped or fails
    pub async fn run(mut self) -> Result<FetcherSummary, FetcherError> {
        self.status.running.store(true, Ordering::Release);
        let result = self.run_loop().await;
        self.status.running.store(false, Ordering::Release);
        if result.is_err() {
            self.status.errored.store(true, Ordering::Release);
        }
        result
    }

    async fn run_loop(&mut self) -> Result<FetcherSummary, FetcherError> {
        let tasks = self
            .handler
            .tasks()
            .await
            .map_err(|source| self.store_error("initial tasks".to_string(), source))?;
        info!(kind = %H::KIND, tasks = tasks.len(), "Starting fetcher");
        self.enqueue(tasks);

        loop {
            while let Ok(tasks) = self.feed.try_recv() {
                self.enqueue(tasks);
            }
            if self.cancel.is_cancelled() {
                return Ok(self.summary(true));
            }
            // Registered before the scheduling pass, so a lease released
            // during it still wakes the loop
            let pool = self.pool.clone();
            let released = pool.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            while self.next() {}

            if self.is_drained() {
                if !self.feed_closed {
                    if self.handler.wait_for_feed() {
                        // Wait for the producer to close the feed or send more
                    } else {
                        // Catch tasks sent right before the feed closes
                        self.feed.close();
                        self.feed_closed = true;
                        continue;
                    }
                } else {
                    self.handler
                        .on_complete()
                        .await
                        .map_err(|source| self.store_error("completion".to_string(), source))?;
                    let summary = self.summary(false);
                    info!(
                        kind = %H::KIND,
                        stored = summary.stored_results,
                        items = summary.stored_items,
                        failed_attempts = summary.failed_attempts,
                        "Fetcher completed"
                    );
                    return Ok(summary);
                }
            }

            let wake_at = self.next_wake();
            let wake = tokio::select! {
                _ = self.cancel.cancelled() => Wake::Stopped,
                Some(attempt) = self.in_flight.next(), if !self.in_flight.is_empty() => {
                    Wake::Completed(attempt)
                }
                tasks = self.feed.recv(), if !self.feed_closed => match tasks {
                    Some(tasks) => Wake::Fed(tasks),
                    None => Wake::FeedClosed,
                },
                _ = &mut released => Wake::Tick,
                _ = tokio::time::sleep_until(wake_at) => Wake::Tick,
            };

            match wake {
                Wake::Stopped => return Ok(self.summary(true)),
                Wake::Completed(attempt) => self.complete(attempt).await?,
                Wake::Fed(tasks) => self.enqueue(tasks),
                Wake::FeedClosed => self.feed_closed = true,
                Wake::Tick => {}
            }
        }
    }

    /// Schedules one job if a slot, a ready job, a request permit and an
    /// idle peer with the handler's capability are all available.
    pub fn next(&mut self) -> bool {
        if self.cancel.is_cancelled() || self.in_flight.len() >= self.config.max_jobs {
            return false;
        }
        let Some(index) = self.next_ready(Instant::now()) else {
            return false;
        };
        let Ok(permit) = self.requests.clone().try_acquire_owned() else {
            return false;
        };
        let Some(lease) = self
            .pool
            .idle(|peer| <H::Capability as PeerCapability>::supports(peer))
        else {
            return false;
        };
        let Some(peer) = <H::Capability as PeerCapability>::handle(lease.peer()) else {
            return false;
        };
        let Some(mut job) = self.queue.remove(&index) else {
            return false;
        };

        job.state = JobState::InFlight;
        job.peer = Some(lease.id());
        debug!(
            kind = %H::KIND,
            index = job.index,
            task = %job.task,
            peer = %lease.id(),
            attempt = job.attempts,
            "Dispatching job"
        );
        self.in_flight
            .push(Self::attempt(self.handler.clone(), job, lease, peer, permit));
        true
    }

    fn attempt(
        handler: Arc<H>,
        job: Job<H::Task, H::Output>,
        lease: PeerLease,
        peer: PeerHandle<H>,
        permit: OwnedSemaphorePermit,
    ) -> BoxFuture<'static, Attempt<H>> {
        Box::pin(async move {
            let result = handler.request(&job, &peer).await;
            drop(permit);
            Attempt { job, lease, result }
        })
    }

    fn enqueue(&mut self, tasks: Vec<H::Task>) {
        for task in tasks {
            let index = self.next_index;
            self.next_index += 1;
            self.queue.insert(index, Job::new(index, task));
        }
    }

    /// Lowest queued job that is ready. Once too many results are held
    /// back, only jobs below the held back ones may run.
    fn next_ready(&self, now: Instant) -> Option<u64> {
        let ceiling = match self.finished.first_key_value() {
            Some((lowest, _))
                if self.handler.ordered()
                    && self.finished.len() >= self.config.max_buffered_results =>
            {
                *lowest
            }
            _ => u64::MAX,
        };
        self.queue
            .values()
            .take_while(|job| job.index < ceiling)
            .find(|job| job.is_ready(now))
            .map(|job| job.index)
    }

    fn next_wake(&self) -> Instant {
        let poll = Instant::now() + self.config.poll_interval;
        self.queue
            .values()
            .map(|job| job.ready_at)
            .filter(|ready_at| *ready_at > Instant::now())
            .min()
            .map_or(poll, |ready_at| ready_at.min(poll))
    }

    fn is_drained(&self) -> bool {
        self.queue.is_empty() && self.in_flight.is_empty() && self.finished.is_empty()
    }

    async fn complete(&mut self, attempt: Attempt<H>) -> Result<(), FetcherError> {
        let Attempt {
            mut job,
            lease,
            result,
        } = attempt;
        let peer = lease.id();
        drop(lease);

        let processed = result.and_then(|response| self.handler.process(&mut job, response));
        match processed {
            Ok(Some(output)) => {
                job.state = JobState::Succeeded;
                debug!(kind = %H::KIND, index = job.index, task = %job.task, %peer, "Job succeeded");
                self.finish(job, output).await
            }
            Ok(None) => {
                debug!(
                    kind = %H::KIND,
                    index = job.index,
                    task = %job.task,
                    %peer,
                    "Partial result, requesting remainder"
                );
                job.state = JobState::Idle;
                job.ready_at = Instant::now();
                self.queue.insert(job.index, job);
                Ok(())
            }
            Err(error) => self.fail(job, peer, error),
        }
    }

    fn fail(
        &mut self,
        mut job: Job<H::Task, H::Output>,
        peer: PeerId,
        error: FetcherError,
    ) -> Result<(), FetcherError> {
        job.attempts += 1;
        job.state = JobState::Failed;
        self.status.failed_attempts.fetch_add(1, Ordering::Relaxed);

        if !error.is_recoverable() {
            error!(kind = %H::KIND, index = job.index, task = %job.task, %error, "Job failed");
            return Err(error);
        }
        if job.attempts > self.config.max_retries {
            error!(
                kind = %H::KIND,
                index = job.index,
                task = %job.task,
                %peer,
                attempts = job.attempts,
                %error,
                "Job failed too many times, giving up"
            );
            return Err(FetcherError::RetriesExhausted {
                kind: H::KIND,
                task: job.task.to_string(),
                peer: Some(peer),
                attempts: job.attempts,
                source: Box::new(error),
            });
        }

        warn!(
            kind = %H::KIND,
            index = job.index,
            task = %job.task,
            %peer,
            attempt = job.attempts,
            %error,
            "Job failed, rescheduling"
        );
        job.ready_at = Instant::now() + self.config.retry_backoff * job.attempts;
        self.queue.insert(job.index, job);
        Ok(())
    }

    async fn finish(
        &mut self,
        job: Job<H::Task, H::Output>,
        output: H::Output,
    ) -> Result<(), FetcherError> {
        if !self.handler.ordered() {
            return self.store(job.task, output).await;
        }
        self.finished.insert(job.index, (job.task, output));
        while let Some(entry) = self.finished.first_entry() {
            if *entry.key() != self.next_store {
                break;
            }
            let (task, output) = entry.remove();
            self.store(task, output).await?;
            self.next_store += 1;
        }
        Ok(())
    }

    async fn store(&mut self, task: H::Task, output: H::Output) -> Result<(), FetcherError> {
        match self.handler.store(&task, output).await {
            Ok(report) => {
                self.status.stored_results.fetch_add(1, Ordering::Relaxed);
                self.status
                    .stored_items
                    .fetch_add(report.items as u64, Ordering::Relaxed);
                self.enqueue(report.follow_up);
                Ok(())
            }
            Err(source) => {
                error!(kind = %H::KIND, task = %task, error = %source, "Failed to store result");
                Err(self.store_error(task.to_string(), source))
            }
        }
    }

    fn store_error(&self, task: String, source: StoreError) -> FetcherError {
        self.status.errored.store(true, Ordering::Release);
        FetcherError::Store {
            kind: H::KIND,
            task,
            source,
        }
    }

    fn summary(&self, stopped: bool) -> FetcherSummary {
        FetcherSummary {
            stored_results: self.status.stored_results.load(Ordering::Relaxed),
            stored_items: self.status.stored_items.load(Ordering::Relaxed),
            failed_attempts: self.status.failed_attempts.load(Ordering::Relaxed),
            stopped,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;
    use crate::error::RequestError;
    use crate::peer::tests::test_peer;
    use crate::peer::{Capability, Eth, EthPeer};
    use crate::types::H256;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct RangeTask {
        first: u64,
        count: u64,
    }

    impl Display for RangeTask {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}..{}", self.first, self.first + self.count)
        }
    }

    #[derive(Default)]
    struct Script {
        /// Maximum items served per request
        serve_at_most: Option<u64>,
        /// Requests that fail before any succeeds, per task start
        failures: HashMap<u64, u32>,
        always_fail: bool,
        /// Fail the first round that already has a partial result
        fail_once_with_partial: bool,
        fail_store: bool,
        /// Request latency per task start
        delays: HashMap<u64, Duration>,
    }

    #[derive(Default)]
    struct Record {
        requests: Vec<(u64, u64)>,
        stored: Vec<Vec<u64>>,
        in_flight: usize,
        max_in_flight: usize,
    }

    struct RangeHandler {
        tasks: Vec<RangeTask>,
        script: Script,
        ordered: bool,
        fed: bool,
        record: Arc<Mutex<Record>>,
    }

    impl RangeHandler {
        fn new(tasks: Vec<RangeTask>, script: Script) -> (Self, Arc<Mutex<Record>>) {
            let record = Arc::new(Mutex::new(Record::default()));
            let handler = Self {
                tasks,
                script,
                ordered: true,
                fed: false,
                record: record.clone(),
            };
            (handler, record)
        }
    }

    #[async_trait]
    impl JobHandler for RangeHandler {
        type Task = RangeTask;
        type Response = Vec<u64>;
        type Output = Vec<u64>;
        type Capability = Eth;

        const KIND: FetcherKind = FetcherKind::Block;

        async fn tasks(&self) -> Result<Vec<RangeTask>, StoreError> {
            Ok(self.tasks.clone())
        }

        async fn request(
            &self,
            job: &Job<RangeTask, Vec<u64>>,
            peer: &EthPeer,
        ) -> Result<Vec<u64>, FetcherError> {
            let first = job.task.first + job.partial_len() as u64;
            let count = job.task.count - job.partial_len() as u64;
            let delay = {
                let mut record = self.record.lock().expect("record lock");
                record.requests.push((first, count));
                record.in_flight += 1;
                record.max_in_flight = record.max_in_flight.max(record.in_flight);
                self.script.delays.get(&job.task.first).copied()
            };
            tokio::time::sleep(delay.unwrap_or(Duration::from_millis(1))).await;
            self.record.lock().expect("record lock").in_flight -= 1;

            let failures = self.script.failures.get(&job.task.first).copied();
            let fail_with_partial =
                self.script.fail_once_with_partial && job.partial_len() > 0 && job.attempts == 0;
            if self.script.always_fail
                || fail_with_partial
                || failures.is_some_and(|f| job.attempts < f)
            {
                return Err(RequestError::Timeout {
                    peer: peer.id(),
                    req_id: 1,
                    kind: crate::messages::RequestKind::BlockHeaders,
                }
                .into());
            }
            let served = self.script.serve_at_most.unwrap_or(count).min(count);
            Ok((first..first + served).collect())
        }

        fn process(
            &self,
            job: &mut Job<RangeTask, Vec<u64>>,
            response: Vec<u64>,
        ) -> Result<Option<Vec<u64>>, FetcherError> {
            if response.is_empty() {
                return Err(FetcherError::EmptyResponse);
            }
            let merged = job.merge(response);
            if merged.len() as u64 == job.task.count {
                return Ok(job.partial.take());
            }
            Ok(None)
        }

        async fn store(
            &self,
            _task: &RangeTask,
            output: Vec<u64>,
        ) -> Result<StoreReport<RangeTask>, StoreError> {
            if self.script.fail_store {
                return Err(StoreError::Custom("disk full".to_string()));
            }
            let items = output.len();
            self.record.lock().expect("record lock").stored.push(output);
            Ok(StoreReport::items(items))
        }

        fn ordered(&self) -> bool {
            self.ordered
        }

        fn wait_for_feed(&self) -> bool {
            self.fed
        }
    }

    fn pool_with_peers(count: u8) -> PeerPool {
        let pool = PeerPool::new();
        for byte in 1..=count {
            pool.add(Arc::new(test_peer(byte, vec![Capability::ETH_68])));
        }
        pool
    }

    fn ranges(count: u64, size: u64) -> Vec<RangeTask> {
        (0..count)
            .map(|i| RangeTask {
                first: i * size,
                count: size,
            })
            .collect()
    }

    fn config() -> FetcherConfig {
        FetcherConfig {
            max_retries: 2,
            retry_backoff: Duration::from_millis(10),
            poll_interval: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_ordered_store_despite_out_of_order_completion() {
        let script = Script {
            delays: HashMap::from([
                (0, Duration::from_millis(300)),
                (10, Duration::from_millis(200)),
                (20, Duration::from_millis(100)),
            ]),
            ..Default::default()
        };
        let (handler, record) = RangeHandler::new(ranges(4, 10), script);
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(4), config());
        let summary = fetcher.run().await.expect("fetcher completes");

        assert_eq!(summary.stored_results, 4);
        assert_eq!(summary.stored_items, 40);
        let stored = record.lock().expect("record lock").stored.clone();
        let firsts: Vec<u64> = stored.iter().map(|items| items[0]).collect();
        assert_eq!(firsts, vec![0, 10, 20, 30]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_result_requests_only_remainder() {
        let script = Script {
            serve_at_most: Some(3),
            ..Default::default()
        };
        let (handler, record) = RangeHandler::new(ranges(1, 10), script);
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(1), config());
        let summary = fetcher.run().await.expect("fetcher completes");

        let record = record.lock().expect("record lock");
        assert_eq!(record.requests, vec![(0, 10), (3, 7), (6, 4), (9, 1)]);
        assert_eq!(record.stored, vec![(0..10).collect::<Vec<u64>>()]);
        assert_eq!(summary.failed_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_jobs_are_retried() {
        let script = Script {
            failures: HashMap::from([(0, 2)]),
            ..Default::default()
        };
        let (handler, record) = RangeHandler::new(ranges(2, 10), script);
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(2), config());
        let summary = fetcher.run().await.expect("fetcher completes");

        assert_eq!(summary.failed_attempts, 2);
        assert_eq!(summary.stored_results, 2);
        let record = record.lock().expect("record lock");
        assert_eq!(record.stored[0], (0..10).collect::<Vec<u64>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_result_survives_failure() {
        let script = Script {
            serve_at_most: Some(5),
            fail_once_with_partial: true,
            ..Default::default()
        };
        let (handler, record) = RangeHandler::new(ranges(1, 10), script);
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(2), config());
        let summary = fetcher.run().await.expect("fetcher completes");

        assert_eq!(summary.failed_attempts, 1);
        let record = record.lock().expect("record lock");
        assert_eq!(record.requests, vec![(0, 10), (5, 5), (5, 5)]);
        assert_eq!(record.stored, vec![(0..10).collect::<Vec<u64>>()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhausted_marks_fetcher_errored() {
        let script = Script {
            always_fail: true,
            ..Default::default()
        };
        let (handler, record) = RangeHandler::new(ranges(1, 10), script);
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(1), config());
        let handle = fetcher.handle();
        let error = fetcher.run().await.expect_err("retries must run out");

        let FetcherError::RetriesExhausted {
            kind,
            task,
            attempts,
            peer,
            ..
        } = error
        else {
            panic!("unexpected error {error:?}");
        };
        assert_eq!(kind, FetcherKind::Block);
        assert_eq!(task, "0..10");
        assert_eq!(attempts, 3);
        assert_eq!(peer, Some(H256::repeat_byte(1)));
        assert!(handle.is_errored());
        assert!(!handle.is_running());
        assert_eq!(record.lock().expect("record lock").requests.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_failure_is_fatal() {
        let script = Script {
            fail_store: true,
            ..Default::default()
        };
        let (handler, record) = RangeHandler::new(ranges(3, 10), script);
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(1), config());
        let handle = fetcher.handle();
        let error = fetcher.run().await.expect_err("store failure is fatal");

        assert!(matches!(error, FetcherError::Store { .. }));
        assert!(!error.is_recoverable());
        assert!(handle.is_errored());
        assert!(record.lock().expect("record lock").stored.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_jobs_are_bounded() {
        let (handler, record) = RangeHandler::new(ranges(12, 4), Script::default());
        let config = FetcherConfig {
            max_jobs: 3,
            ..config()
        };
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(8), config);
        fetcher.run().await.expect("fetcher completes");

        let record = record.lock().expect("record lock");
        assert_eq!(record.max_in_flight, 3);
        assert_eq!(record.stored.len(), 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_request_limit() {
        let (handler, record) = RangeHandler::new(ranges(6, 4), Script::default());
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(6), config());
        let fetcher = fetcher.with_request_limit(Arc::new(Semaphore::new(2)));
        fetcher.run().await.expect("fetcher completes");
        assert_eq!(record.lock().expect("record lock").max_in_flight, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fed_fetcher_waits_for_feed_to_close() {
        let (mut handler, record) = RangeHandler::new(vec![], Script::default());
        handler.fed = true;
        handler.ordered = false;
        let (fetcher, feed) = Fetcher::new(handler, pool_with_peers(2), config());
        let handle = fetcher.handle();
        let run = tokio::spawn(fetcher.run());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handle.is_running());
        feed.send(ranges(3, 5)).expect("fetcher accepts tasks");
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(handle.is_running());
        drop(feed);

        let summary = run
            .await
            .expect("fetcher task panicked")
            .expect("fetcher completes");
        assert_eq!(summary.stored_results, 3);
        assert_eq!(record.lock().expect("record lock").stored.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_fetcher_schedules_nothing() {
        let (handler, record) = RangeHandler::new(ranges(4, 10), Script::default());
        let (fetcher, _feed) = Fetcher::new(handler, pool_with_peers(2), config());
        fetcher.handle().stop();
        let summary = fetcher.run().await.expect("stopping is not an error");
        assert!(summary.stopped);
        assert!(record.lock().expect("record lock").requests.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_for_capable_peer() {
        let (handler, record) = RangeHandler::new(ranges(1, 4), Script::default());
        let pool = PeerPool::new();
        pool.add(Arc::new(test_peer(1, vec![Capability::SNAP_1])));
        let (fetcher, _feed) = Fetcher::new(handler, pool.clone(), config());
        let run = tokio::spawn(fetcher.run());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(record.lock().expect("record lock").requests.is_empty());
        pool.add(Arc::new(test_peer(2, vec![Capability::ETH_68])));

        let summary = run
            .await
            .expect("fetcher task panicked")
            .expect("fetcher completes");
        assert_eq!(summary.stored_results, 1);
    }
}
