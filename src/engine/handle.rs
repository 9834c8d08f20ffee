//! Caller-side views of submitted requests.
//!
//! The tick loop owns every request; callers only see what it publishes.
//!
//! ```text
//!   caller thread                         engine thread
//!   ─────────────                         ─────────────
//!   Submitter::submit ──► Mutex<VecDeque> ──► drained at tick start
//!   RequestHandle::poll ◄── Mutex<Published> ◄── written after each tick
//!   RequestHandle::cancel ──► AtomicBool ──► honoured at next tick
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use crate::core::sequence::{Failure, FinishReason, RequestId, RequestState};
use crate::error::Result;

use super::llm::GenerationRequest;

/// State the engine publishes for one request.
#[derive(Debug, Clone)]
pub(crate) struct Published {
    pub(crate) tokens: Vec<u32>,
    pub(crate) state: RequestState,
    pub(crate) finish_reason: Option<FinishReason>,
    pub(crate) failure: Option<Failure>,
}

impl Default for Published {
    fn default() -> Self {
        Self {
            tokens: Vec::new(),
            state: RequestState::Queued,
            finish_reason: None,
            failure: None,
        }
    }
}

pub(crate) type SharedState = Arc<Mutex<Published>>;

/// Lock ignoring poison: the data is plain values, valid after any panic.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What changed since the last [`RequestHandle::poll`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestUpdate {
    /// Tokens produced since the previous poll.
    pub new_tokens: Vec<u32>,
    pub state: RequestState,
    pub finish_reason: Option<FinishReason>,
    /// Set for `Failed` and `Cancelled` requests.
    pub failure: Option<Failure>,
}

impl RequestUpdate {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Handle to one submitted request.
#[derive(Debug)]
pub struct RequestHandle {
    id: RequestId,
    shared: SharedState,
    cancel_flag: Arc<AtomicBool>,
    /// Tokens already returned by `poll`.
    cursor: usize,
}

impl RequestHandle {
    pub(crate) fn new(id: RequestId, shared: SharedState, cancel_flag: Arc<AtomicBool>) -> Self {
        Self {
            id,
            shared,
            cancel_flag,
            cursor: 0,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    /// New tokens and the current state. Never blocks on the tick loop for
    /// longer than one publish.
    pub fn poll(&mut self) -> RequestUpdate {
        let published = lock(&self.shared);
        let new_tokens = published.tokens[self.cursor.min(published.tokens.len())..].to_vec();
        self.cursor = published.tokens.len();
        RequestUpdate {
            new_tokens,
            state: published.state,
            finish_reason: published.finish_reason,
            failure: published.failure.clone(),
        }
    }

    /// Every token published so far.
    pub fn tokens(&self) -> Vec<u32> {
        lock(&self.shared).tokens.clone()
    }

    pub fn state(&self) -> RequestState {
        lock(&self.shared).state
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    /// Request cancellation. The request becomes `Cancelled` within one tick,
    /// keeping the tokens produced so far.
    pub fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::Release);
    }
}

/// A request accepted by a [`Submitter`], waiting for the next tick.
#[derive(Debug)]
pub(crate) struct Submission {
    pub(crate) id: RequestId,
    pub(crate) request: GenerationRequest,
    pub(crate) shared: SharedState,
    pub(crate) cancel_flag: Arc<AtomicBool>,
    /// Arrival time of the request; timeouts and latencies count from here.
    pub(crate) submitted_at: Instant,
}

/// Cloneable submission endpoint for other threads.
///
/// Prompt tokens are checked against the vocabulary when the next tick drains
/// the queue; a rejected submission shows up as a `Failed` handle.
#[derive(Debug, Clone)]
pub struct Submitter {
    queue: Arc<Mutex<VecDeque<Submission>>>,
    next_id: Arc<AtomicU64>,
}

impl Submitter {
    pub(crate) fn new(next_id: Arc<AtomicU64>) -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
            next_id,
        }
    }

    /// Queue a request for admission at the start of the next tick.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidRequest`] for an empty prompt or a zero token
    /// limit.
    pub fn submit(&self, request: GenerationRequest) -> Result<RequestHandle> {
        request.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = SharedState::default();
        let cancel_flag = Arc::new(AtomicBool::new(false));
        lock(&self.queue).push_back(Submission {
            id,
            request,
            shared: Arc::clone(&shared),
            cancel_flag: Arc::clone(&cancel_flag),
            submitted_at: Instant::now(),
        });
        Ok(RequestHandle::new(id, shared, cancel_flag))
    }

    pub(crate) fn drain(&self) -> Vec<Submission> {
        lock(&self.queue).drain(..).collect()
    }

    /// Submissions not yet drained.
    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_poll_returns_only_new_tokens() {
        let shared = SharedState::default();
        let mut handle = RequestHandle::new(1, Arc::clone(&shared), Arc::default());

        lock(&shared).tokens.extend([4, 5]);
        assert_eq!(handle.poll().new_tokens, vec![4, 5]);
        assert!(handle.poll().new_tokens.is_empty());

        {
            let mut p = lock(&shared);
            p.tokens.push(6);
            p.state = RequestState::Completed;
            p.finish_reason = Some(FinishReason::MaxTokens);
        }
        let update = handle.poll();
        assert_eq!(update.new_tokens, vec![6]);
        assert!(update.is_finished());
        assert_eq!(handle.tokens(), vec![4, 5, 6]);
    }

    #[test]
    fn test_cancel_sets_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        let handle = RequestHandle::new(1, SharedState::default(), Arc::clone(&flag));
        handle.cancel();
        assert!(flag.load(Ordering::Acquire));
    }

    #[test]
    fn test_submitter_assigns_ids_and_queues() {
        let submitter = Submitter::new(Arc::new(AtomicU64::new(10)));
        let other = submitter.clone();
        let a = submitter.submit(GenerationRequest::new(vec![1, 2])).unwrap();
        let b = other.submit(GenerationRequest::new(vec![3])).unwrap();

        assert_eq!((a.id(), b.id()), (10, 11));
        assert_eq!(submitter.pending(), 2);
        let drained = submitter.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, 10);
        assert_eq!(submitter.pending(), 0);
    }

    #[test]
    fn test_submitter_validates() {
        let submitter = Submitter::new(Arc::default());
        assert!(matches!(
            submitter.submit(GenerationRequest::new(Vec::new())),
            Err(Error::InvalidRequest(_))
        ));
    }
}
