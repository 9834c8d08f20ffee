//! Inference requests and their lifecycle.
//!
//! ```text
//!            Admit            PrefillDone
//!  Queued ──────────► Prefilling ──────────► Decoding
//!    ▲                    │  │                 │  │
//!    └──── Preempt ───────┘  │    Finish       │  └── Preempt ──► Queued
//!                            ├───────────────► Completed
//!      Cancel / Timeout      │                 │
//!  (any live state) ─────────┴───────────────► Cancelled
//!      Fail                                    │
//!  (any live state) ─────────────────────────► Failed
//! ```
//!
//! Transitions are a pure function of (state, event); the scheduler applies
//! them and records side data (finish reason, failure) on the [`Request`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::config::SamplingConfig;
use crate::core::kv_cache::SlotId;
use crate::error::{Error, ErrorKind, Result};

/// Unique identifier for a request.
pub type RequestId = u64;

/// Priority level for scheduling. Higher values are admitted first.
pub type Priority = i32;

/// Default priority for new requests.
pub const DEFAULT_PRIORITY: Priority = 0;

/// Lifecycle state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestState {
    /// Waiting for admission.
    Queued,
    /// Admitted; prompt is processed this tick.
    Prefilling,
    /// Generating one token per tick.
    Decoding,
    /// Generation finished normally.
    Completed,
    /// Cancelled by its owner or timed out.
    Cancelled,
    /// Failed with an error.
    Failed,
}

impl RequestState {
    /// Whether the request holds a cache slot and joins batches.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Prefilling | Self::Decoding)
    }

    /// Whether no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// Get the state name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Prefilling => "Prefilling",
            Self::Decoding => "Decoding",
            Self::Completed => "Completed",
            Self::Cancelled => "Cancelled",
            Self::Failed => "Failed",
        }
    }

    /// Apply an event, returning the next state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] if the event is not legal in
    /// this state. Terminal states accept no events.
    pub fn transition(self, event: &RequestEvent) -> Result<Self> {
        use RequestEvent as E;
        use RequestState as S;

        let next = match (self, event) {
            (S::Queued, E::Admit) => S::Prefilling,
            (S::Prefilling, E::PrefillDone) => S::Decoding,
            (S::Prefilling | S::Decoding, E::Finish(_)) => S::Completed,
            (S::Prefilling | S::Decoding, E::Preempt) => S::Queued,
            (S::Queued | S::Prefilling | S::Decoding, E::Cancel | E::Timeout) => S::Cancelled,
            (S::Queued | S::Prefilling | S::Decoding, E::Fail(_)) => S::Failed,
            _ => {
                return Err(Error::InvalidStateTransition {
                    from: self.as_str(),
                    to: event.target_name(),
                });
            }
        };
        Ok(next)
    }
}

/// Reason for normal completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// End-of-sequence token generated.
    EndOfSequence,
    /// Maximum token limit reached.
    MaxTokens,
    /// Stop sequence encountered.
    StopSequence,
}

/// Input to [`RequestState::transition`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestEvent {
    Admit,
    PrefillDone,
    Finish(FinishReason),
    Cancel,
    Timeout,
    Fail(ErrorKind),
    Preempt,
}

impl RequestEvent {
    fn target_name(&self) -> &'static str {
        match self {
            Self::Admit => "Prefilling",
            Self::PrefillDone => "Decoding",
            Self::Finish(_) => "Completed",
            Self::Cancel | Self::Timeout => "Cancelled",
            Self::Fail(_) => "Failed",
            Self::Preempt => "Queued",
        }
    }
}

/// Why a request ended without completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for Failure {
    fn from(error: &Error) -> Self {
        Self {
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// A single inference request.
///
/// # Example
///
/// ```
/// use nano_infer::core::sequence::{Request, RequestEvent, RequestState};
/// use nano_infer::SamplingConfig;
///
/// let mut req = Request::new(1, vec![1, 2, 3, 4], SamplingConfig::greedy(8));
/// assert_eq!(req.state(), RequestState::Queued);
///
/// req.apply(RequestEvent::Admit).unwrap();
/// req.append_token(5);
/// assert_eq!(req.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    id: RequestId,
    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    sampling: SamplingConfig,
    priority: Priority,
    /// Submission order, ties broken by lower value.
    arrival_seq: u64,
    arrival_time: Instant,
    timeout: Option<Duration>,
    max_steps: Option<usize>,
    steps: usize,
    state: RequestState,
    finish_reason: Option<FinishReason>,
    failure: Option<Failure>,
    cancel_flag: Arc<AtomicBool>,
    slot: Option<SlotId>,
    /// Tokens whose keys and values are in the slot.
    num_cached_tokens: usize,
    first_token_time: Option<Instant>,
    truncated_tokens: usize,
    preemptions: usize,
}

impl Request {
    /// Create a queued request.
    pub fn new(id: RequestId, prompt_token_ids: Vec<u32>, sampling: SamplingConfig) -> Self {
        Self {
            id,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            sampling,
            priority: DEFAULT_PRIORITY,
            arrival_seq: id,
            arrival_time: Instant::now(),
            timeout: None,
            max_steps: None,
            steps: 0,
            state: RequestState::Queued,
            finish_reason: None,
            failure: None,
            cancel_flag: Arc::new(AtomicBool::new(false)),
            slot: None,
            num_cached_tokens: 0,
            first_token_time: None,
            truncated_tokens: 0,
            preemptions: 0,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the wall-clock budget measured from arrival.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the maximum number of ticks the request may take part in.
    pub fn with_max_steps(mut self, max_steps: Option<usize>) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Share a cancellation flag with the request's owner.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = flag;
        self
    }

    /// Override the arrival time, e.g. with the moment the owner submitted.
    pub fn with_arrival_time(mut self, arrival_time: Instant) -> Self {
        self.arrival_time = arrival_time;
        self
    }

    /// Override the arrival order key.
    pub fn with_arrival_seq(mut self, arrival_seq: u64) -> Self {
        self.arrival_seq = arrival_seq;
        self
    }

    // ========== Getters ==========

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    /// Prompt followed by generated tokens.
    pub fn all_token_ids(&self) -> Vec<u32> {
        let mut tokens = self.prompt_token_ids.clone();
        tokens.extend(&self.output_token_ids);
        tokens
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn arrival_seq(&self) -> u64 {
        self.arrival_seq
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    pub fn cancel_flag(&self) -> &Arc<AtomicBool> {
        &self.cancel_flag
    }

    pub fn slot(&self) -> Option<SlotId> {
        self.slot
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn first_token_time(&self) -> Option<Instant> {
        self.first_token_time
    }

    /// Prompt tokens dropped from the front to fit the context window.
    pub fn truncated_tokens(&self) -> usize {
        self.truncated_tokens
    }

    /// Number of times the request was sent back to the queue.
    pub fn preemptions(&self) -> usize {
        self.preemptions
    }

    // ========== Length queries ==========

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    pub fn num_cached_tokens(&self) -> usize {
        self.num_cached_tokens
    }

    /// Tokens the next forward pass must feed for this request.
    ///
    /// During prefill this is every token not yet cached (the prompt, plus any
    /// output recomputed after preemption); during decode it is the last token.
    pub fn pending_tokens(&self) -> Vec<u32> {
        let all = self.all_token_ids();
        all[self.num_cached_tokens.min(all.len())..].to_vec()
    }

    /// Worst-case positions this request can occupy.
    pub fn max_total_len(&self) -> usize {
        self.prompt_len() + self.sampling.max_tokens
    }

    // ========== Token operations ==========

    /// Append a generated token, stamping time-to-first-token on the first.
    pub fn append_token(&mut self, token_id: u32) {
        if self.first_token_time.is_none() {
            self.first_token_time = Some(Instant::now());
        }
        self.output_token_ids.push(token_id);
    }

    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    /// Mark pending tokens as written to the cache.
    pub fn mark_cached(&mut self, num_tokens: usize) {
        self.num_cached_tokens = (self.num_cached_tokens + num_tokens).min(self.total_len());
    }

    /// Keep only the last `max_len` prompt tokens.
    pub fn truncate_prompt(&mut self, max_len: usize) {
        let len = self.prompt_len();
        if len > max_len {
            let dropped = len - max_len;
            self.prompt_token_ids.drain(..dropped);
            self.truncated_tokens += dropped;
        }
    }

    /// Check the stop conditions after a token was appended.
    ///
    /// End-of-sequence wins over a stop sequence, which wins over the token
    /// limit.
    pub fn check_stop(&self, eos_token_id: Option<u32>) -> Option<FinishReason> {
        let last = self.output_token_ids.last().copied()?;
        if eos_token_id == Some(last) {
            return Some(FinishReason::EndOfSequence);
        }
        if self
            .sampling
            .stop_sequences
            .iter()
            .any(|stop| !stop.is_empty() && self.output_token_ids.ends_with(stop))
        {
            return Some(FinishReason::StopSequence);
        }
        if self.output_len() >= self.sampling.max_tokens {
            return Some(FinishReason::MaxTokens);
        }
        None
    }

    // ========== Budgets ==========

    /// Whether the owner asked for cancellation.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_flag.load(Ordering::Acquire)
    }

    /// Whether the wall-clock budget has elapsed at `now`.
    pub fn is_timed_out(&self, now: Instant) -> bool {
        self.timeout
            .is_some_and(|t| now.saturating_duration_since(self.arrival_time) >= t)
    }

    /// Whether the step budget is used up.
    pub fn is_step_budget_exhausted(&self) -> bool {
        self.max_steps.is_some_and(|max| self.steps >= max)
    }

    /// Count one tick of participation in a batch.
    pub fn record_step(&mut self) {
        self.steps += 1;
    }

    // ========== State transitions ==========

    /// Apply a lifecycle event and record its side data.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] and leaves the request
    /// untouched if the event is illegal in the current state.
    pub fn apply(&mut self, event: RequestEvent) -> Result<()> {
        let next = self.state.transition(&event)?;
        match &event {
            RequestEvent::Finish(reason) => self.finish_reason = Some(*reason),
            RequestEvent::Cancel => self.failure = Some(Failure::from(&Error::Cancelled)),
            RequestEvent::Timeout => {
                let error = Error::Timeout(format!(
                    "{} steps, {:?} since arrival",
                    self.steps,
                    self.arrival_time.elapsed()
                ));
                self.failure = Some(Failure::from(&error));
            }
            RequestEvent::Preempt => {
                self.num_cached_tokens = 0;
                self.slot = None;
                self.preemptions += 1;
            }
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Move to `Failed`, recording the error's kind and message.
    pub fn fail(&mut self, error: &Error) -> Result<()> {
        self.apply(RequestEvent::Fail(error.kind()))?;
        self.failure = Some(Failure::from(error));
        Ok(())
    }

    pub(crate) fn set_slot(&mut self, slot: Option<SlotId>) {
        self.slot = slot;
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Request {}

impl std::hash::Hash for Request {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}
