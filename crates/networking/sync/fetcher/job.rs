use tokio::time::Instant;

use crate::peer::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    InFlight,
    Succeeded,
    /// Last attempt failed, waiting in the queue for its retry
    Failed,
}

/// One task bound to the fetcher for its whole lifetime, plus whatever was
/// received for it so far.
#[derive(Debug)]
pub struct Job<T, O> {
    /// Position of the task in the order tasks were produced
    pub index: u64,
    pub task: T,
    /// Items received in earlier rounds, the next request only covers what is missing
    pub partial: Option<O>,
    /// Failed attempts so far. Rounds that made progress do not count.
    pub attempts: u32,
    pub state: JobState,
    /// Peer of the current or last attempt
    pub peer: Option<PeerId>,
    /// Earliest time the job may be scheduled again
    pub ready_at: Instant,
}

impl<T, O> Job<T, O> {
    pub fn new(index: u64, task: T) -> Self {
        Self {
            index,
            task,
            partial: None,
            attempts: 0,
            state: JobState::Idle,
            peer: None,
            ready_at: Instant::now(),
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        self.ready_at <= now
    }
}

impl<T, I> Job<T, Vec<I>> {
    /// Amount of items already received
    pub fn partial_len(&self) -> usize {
        self.partial.as_ref().map_or(0, Vec::len)
    }

    /// Appends `items` to the partial result and returns the merged result
    pub fn merge(&mut self, items: Vec<I>) -> &mut Vec<I> {
        let partial = self.partial.get_or_insert_with(Vec::new);
        partial.extend(items);
        partial
    }
}
