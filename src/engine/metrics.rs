//! Per-tick and per-request counters.
//!
//! The engine fills these in; formatting and export belong to the caller.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::core::sequence::{Request, RequestId};

/// Counters for one [`Engine::step`](super::Engine::step).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepMetrics {
    /// 1-based tick number.
    pub step: u64,
    /// Requests in this tick's forward pass.
    pub batch_size: usize,
    pub num_prefill_tokens: usize,
    pub num_decode_tokens: usize,
    /// Tokens sampled this tick.
    pub tokens_generated: usize,
    pub elapsed: Duration,
    /// `tokens_generated` over `elapsed`.
    pub tokens_per_second: f64,
    /// Time to first token of every request that produced it this tick.
    pub time_to_first_token: Vec<(RequestId, Duration)>,
    pub cache_used_bytes: usize,
    /// Filled positions over capacity across live slots.
    pub cache_occupancy: f64,
    /// Requests still waiting for admission, undrained submissions included.
    pub queue_depth: usize,
    pub num_running: usize,
    /// Requests that reached a terminal state this tick.
    pub num_finished: usize,
    pub num_preempted: usize,
}

impl StepMetrics {
    pub(crate) fn finish(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
        let secs = elapsed.as_secs_f64();
        self.tokens_per_second = if secs > 0.0 {
            self.tokens_generated as f64 / secs
        } else {
            0.0
        };
    }
}

/// Summary of one finished request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestMetrics {
    pub request_id: RequestId,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
    /// Prompt tokens dropped by truncation.
    pub truncated_tokens: usize,
    /// Ticks the request took part in.
    pub steps: usize,
    pub preemptions: usize,
    /// From submission to the first sampled token.
    pub time_to_first_token: Option<Duration>,
    /// From submission to retirement.
    pub total_time: Duration,
}

impl RequestMetrics {
    pub fn from_request(request: &Request, now: Instant) -> Self {
        let arrival = request.arrival_time();
        Self {
            request_id: request.id(),
            prompt_tokens: request.prompt_len(),
            output_tokens: request.output_len(),
            truncated_tokens: request.truncated_tokens(),
            steps: request.steps(),
            preemptions: request.preemptions(),
            time_to_first_token: request
                .first_token_time()
                .map(|t| t.saturating_duration_since(arrival)),
            total_time: now.saturating_duration_since(arrival),
        }
    }
}
