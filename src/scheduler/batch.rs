//! Continuous batching scheduler.
//!
//! The scheduler owns every live request and the KV cache, and decides each
//! tick which requests join the shared forward pass.
//!
//! ## Scheduling Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                        Scheduler Flow                               │
//! └─────────────────────────────────────────────────────────────────────┘
//!
//!   add_request()                                   schedule()
//!        │                                              │
//!        ▼                                              ▼
//!   ┌─────────┐   admit (priority, arrival)      ┌─────────────┐
//!   │ Waiting │ ───────────────────────────────► │   Running   │
//!   │  Queue  │   while batch and budget allow   │ (admission  │
//!   └─────────┘                                  │   order)    │
//!        ▲                                       └─────────────┘
//!        │   preempt (memory pressure)                  │
//!        └──────────────────────────────────────────────┤
//!                                                       ▼
//!                                  Completed / Cancelled / Failed
//!                                       (slot released at once)
//! ```
//!
//! ## Example
//!
//! ```
//! use std::time::Instant;
//!
//! use nano_infer::core::kv_cache::KvLayout;
//! use nano_infer::core::sequence::Request;
//! use nano_infer::scheduler::Scheduler;
//! use nano_infer::{CacheConfig, ModelConfig, SamplingConfig, SchedulerConfig};
//!
//! let layout = KvLayout::from_model(&ModelConfig::tiny());
//! let mut scheduler = Scheduler::new(SchedulerConfig::default(), CacheConfig::default(), layout);
//!
//! scheduler.add_request(Request::new(1, vec![1, 2, 3, 4], SamplingConfig::greedy(8))).unwrap();
//! scheduler.add_request(Request::new(2, vec![5, 6, 7, 8], SamplingConfig::greedy(8))).unwrap();
//!
//! let outputs = scheduler.schedule(Instant::now());
//! assert_eq!(outputs.prefill_requests, vec![1, 2]);
//! assert_eq!(outputs.num_prefill_tokens, 8);
//! ```

use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::Ordering;
use std::time::Instant;

use log::{debug, warn};

use crate::config::{CacheConfig, OverflowPolicy, PressurePolicy, SchedulerConfig};
use crate::core::kv_cache::{KvCacheManager, KvLayout, SlotId};
use crate::core::sequence::{
    DEFAULT_PRIORITY, FinishReason, Priority, Request, RequestEvent, RequestId, RequestState,
};
use crate::error::{Error, Result};

/// Output of a scheduling step.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerOutputs {
    /// Requests processing their prompt this tick.
    pub prefill_requests: Vec<RequestId>,
    /// Requests generating one token this tick.
    pub decode_requests: Vec<RequestId>,
    /// Every scheduled request in admission order; the batch order.
    pub batch: Vec<RequestId>,
    /// Requests that reached a terminal state while scheduling.
    pub retired: Vec<RequestId>,
    /// Requests sent back to the queue under memory pressure.
    pub preempted: Vec<RequestId>,
    /// Total number of prefill tokens this tick.
    pub num_prefill_tokens: usize,
    /// Total number of decode tokens this tick.
    pub num_decode_tokens: usize,
}

impl SchedulerOutputs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if there is anything to run.
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn num_requests(&self) -> usize {
        self.batch.len()
    }

    pub fn num_tokens(&self) -> usize {
        self.num_prefill_tokens + self.num_decode_tokens
    }
}

/// Entry in the priority queue for scheduling.
///
/// Ordered by (priority DESC, arrival ASC).
#[derive(Debug, Clone)]
struct PriorityEntry {
    request_id: RequestId,
    priority: Priority,
    arrival_order: u64,
}

impl PartialEq for PriorityEntry {
    fn eq(&self, other: &Self) -> bool {
        self.request_id == other.request_id
    }
}

impl Eq for PriorityEntry {}

impl PartialOrd for PriorityEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PriorityEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then earlier arrival (lower order)
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => other.arrival_order.cmp(&self.arrival_order),
            ord => ord,
        }
    }
}

/// Continuous batching scheduler.
///
/// Requests move through [`RequestState`]:
/// - Queued: in the priority queue, waiting for a batch place
/// - Prefilling: admitted this tick, prompt goes through the model
/// - Decoding: one token per tick
/// - Completed / Cancelled / Failed: terminal, slot already released
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    cache_config: CacheConfig,
    cache: KvCacheManager,
    /// All requests not yet removed, terminal ones included.
    requests: HashMap<RequestId, Request>,
    waiting_queue: BinaryHeap<PriorityEntry>,
    /// Running request IDs in admission order.
    running_ids: Vec<RequestId>,
    arrival_counter: u64,
}

impl Scheduler {
    /// Create a new scheduler.
    ///
    /// # Arguments
    ///
    /// * `config` - Admission limits and ordering
    /// * `cache_config` - Slot capacity, budget and policies
    /// * `layout` - Per-position KV shape of the model
    pub fn new(config: SchedulerConfig, cache_config: CacheConfig, layout: KvLayout) -> Self {
        let cache = KvCacheManager::new(layout, &cache_config);
        Self {
            config,
            cache_config,
            cache,
            requests: HashMap::new(),
            waiting_queue: BinaryHeap::new(),
            running_ids: Vec::new(),
            arrival_counter: 0,
        }
    }

    /// Queue a new request. Its arrival order is assigned here.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for a duplicate ID or a request that
    /// is not `Queued`.
    pub fn add_request(&mut self, request: Request) -> Result<()> {
        let id = request.id();
        if self.requests.contains_key(&id) {
            return Err(Error::InvalidRequest(format!("request {id} already exists")));
        }
        if request.state() != RequestState::Queued {
            return Err(Error::InvalidRequest(format!(
                "request {id} is {}, expected Queued",
                request.state().as_str()
            )));
        }

        let request = request.with_arrival_seq(self.arrival_counter);
        self.arrival_counter += 1;
        let entry = self.queue_entry(&request);
        self.waiting_queue.push(entry);
        self.requests.insert(id, request);
        Ok(())
    }

    /// Remove a request, releasing its slot if it still holds one.
    pub fn remove_request(&mut self, id: RequestId) -> Option<Request> {
        let mut request = self.requests.remove(&id)?;
        self.release(id, request.slot());
        request.set_slot(None);
        Some(request)
    }

    pub fn request(&self, id: RequestId) -> Option<&Request> {
        self.requests.get(&id)
    }

    /// Ask for cancellation; honoured at the start of the next tick.
    pub fn cancel(&self, id: RequestId) -> Result<()> {
        let request = self.requests.get(&id).ok_or(Error::RequestNotFound(id))?;
        request.cancel_flag().store(true, Ordering::Release);
        Ok(())
    }

    /// Schedule the next tick.
    ///
    /// 1. Retire cancelled, timed-out and step-exhausted requests.
    /// 2. Admit queued requests while the batch and prefill budgets allow.
    /// 3. Reserve cache growth for every running request, applying the
    ///    pressure policy when the budget runs out.
    /// 4. Emit the batch in admission order.
    pub fn schedule(&mut self, now: Instant) -> SchedulerOutputs {
        let mut outputs = SchedulerOutputs::new();

        self.retire_expired(now, &mut outputs);
        self.schedule_prefill(&mut outputs);
        self.reserve_growth(&mut outputs);
        self.build_batch(&mut outputs);

        outputs
    }

    fn retire_expired(&mut self, now: Instant, outputs: &mut SchedulerOutputs) {
        let mut live: Vec<(u64, RequestId)> = self
            .requests
            .values()
            .filter(|r| !r.state().is_terminal())
            .map(|r| (r.arrival_seq(), r.id()))
            .collect();
        live.sort_unstable();

        for (_, id) in live {
            let Some(request) = self.requests.get(&id) else {
                continue;
            };
            let event = if request.is_cancel_requested() {
                RequestEvent::Cancel
            } else if request.is_timed_out(now) || request.is_step_budget_exhausted() {
                RequestEvent::Timeout
            } else {
                continue;
            };
            self.terminate(id, event, outputs);
        }
    }

    fn schedule_prefill(&mut self, outputs: &mut SchedulerOutputs) {
        let max_seqs = self.config.max_num_seqs;
        let max_prefill_tokens = self.config.max_prefill_tokens;
        let max_context = self.cache_config.max_context;
        let mut prefill_tokens = 0usize;
        let mut admitted = 0usize;

        while self.running_ids.len() < max_seqs {
            let Some(entry) = self.waiting_queue.pop() else {
                break;
            };
            let id = entry.request_id;

            // Check the request still exists and is waiting
            let request = match self.requests.get_mut(&id) {
                Some(r) if r.state() == RequestState::Queued => r,
                _ => continue,
            };

            if request.prompt_len() > max_context {
                if self.config.truncate_long_prompts {
                    let before = request.prompt_len();
                    request.truncate_prompt(max_context);
                    warn!(
                        "request {id}: prompt of {before} tokens truncated to its last {max_context}"
                    );
                } else {
                    let err = Error::PromptTooLong {
                        len: request.prompt_len(),
                        max_context,
                    };
                    warn!("request {id} rejected: {err}");
                    if request.fail(&err).is_ok() {
                        outputs.retired.push(id);
                    }
                    continue;
                }
            }

            let tokens = request.total_len() - request.num_cached_tokens();
            if admitted > 0 && prefill_tokens + tokens > max_prefill_tokens {
                self.waiting_queue.push(entry);
                break;
            }

            let reserve = match self.cache_config.pressure_policy {
                PressurePolicy::RefuseAdmission => request.max_total_len().max(tokens),
                PressurePolicy::EvictLeastRecent | PressurePolicy::PreemptLeastRecent => tokens,
            }
            .min(max_context);

            if !self.cache.can_fit(reserve) {
                if self.cache.num_active_slots() == 0 {
                    let err = Error::CacheOverflow(format!(
                        "request {id} needs {} bytes, more than the whole budget of {:?}",
                        self.cache.bytes_for(reserve),
                        self.cache.budget_bytes()
                    ));
                    warn!("request {id} rejected: {err}");
                    if request.fail(&err).is_ok() {
                        outputs.retired.push(id);
                    }
                    continue;
                }
                debug!("request {id} stays queued: cache budget exhausted");
                self.waiting_queue.push(entry);
                break;
            }

            let slot = match self.cache.allocate(id, max_context) {
                Ok(slot) => slot,
                Err(err) => {
                    warn!("request {id} rejected: {err}");
                    if request.fail(&err).is_ok() {
                        outputs.retired.push(id);
                    }
                    continue;
                }
            };
            if let Err(err) = self.cache.reserve(slot, reserve) {
                debug!("request {id} stays queued: {err}");
                let _ = self.cache.evict(slot);
                self.waiting_queue.push(entry);
                break;
            }
            if let Err(err) = request.apply(RequestEvent::Admit) {
                warn!("request {id} not admitted: {err}");
                let _ = self.cache.evict(slot);
                continue;
            }
            request.set_slot(Some(slot));
            debug!("admitted request {id} into slot {slot} ({tokens} prefill tokens)");

            self.running_ids.push(id);
            prefill_tokens += tokens;
            admitted += 1;
        }
    }

    fn reserve_growth(&mut self, outputs: &mut SchedulerOutputs) {
        let policy = self.cache_config.pressure_policy;

        for id in self.running_ids.clone() {
            loop {
                // Earlier iterations may have evicted or preempted this request
                let Some(request) = self.requests.get(&id) else {
                    break;
                };
                let Some(slot) = request.slot().filter(|_| request.state().is_running()) else {
                    break;
                };
                let pending = request.total_len() - request.num_cached_tokens();
                let (held, capacity) = match (self.cache.len(slot), self.cache.capacity(slot)) {
                    (Ok(held), Ok(capacity)) => (held, capacity),
                    (Err(err), _) | (_, Err(err)) => {
                        self.fail_with(id, &err, outputs);
                        break;
                    }
                };

                let needed = held + pending;
                if needed > capacity && self.cache.overflow_policy() == OverflowPolicy::Reject {
                    let err = Error::CacheOverflow(format!(
                        "request {id} needs {needed} positions, slot {slot} holds {capacity}"
                    ));
                    self.fail_with(id, &err, outputs);
                    break;
                }

                let Err(err) = self.cache.reserve(slot, needed) else {
                    break;
                };
                let victim = match policy {
                    PressurePolicy::RefuseAdmission => None,
                    PressurePolicy::EvictLeastRecent | PressurePolicy::PreemptLeastRecent => self
                        .cache
                        .least_recently_extended(&[slot])
                        .and_then(|s| self.cache.owner(s).ok()),
                };
                let Some(victim) = victim else {
                    self.fail_with(id, &err, outputs);
                    break;
                };
                if policy == PressurePolicy::PreemptLeastRecent {
                    self.preempt(victim, outputs);
                } else {
                    let err = Error::CacheOverflow(format!(
                        "evicted under memory pressure to make room for request {id}"
                    ));
                    self.fail_with(victim, &err, outputs);
                }
            }
        }
    }

    fn build_batch(&self, outputs: &mut SchedulerOutputs) {
        for &id in &self.running_ids {
            let Some(request) = self.requests.get(&id) else {
                continue;
            };
            let pending = request.total_len() - request.num_cached_tokens();
            match request.state() {
                RequestState::Prefilling => {
                    outputs.prefill_requests.push(id);
                    outputs.num_prefill_tokens += pending;
                }
                RequestState::Decoding => {
                    outputs.decode_requests.push(id);
                    outputs.num_decode_tokens += pending;
                }
                _ => continue,
            }
            outputs.batch.push(id);
        }
    }

    // ========== Step results ==========

    /// Record the token sampled for `id` after a forward pass.
    ///
    /// Marks the fed tokens as cached, moves a prefilling request to
    /// `Decoding`, appends the token and checks the stop conditions. A
    /// finished request releases its slot immediately.
    ///
    /// # Returns
    ///
    /// The finish reason if the request completed.
    pub fn complete_step(
        &mut self,
        id: RequestId,
        token: u32,
        eos_token_id: Option<u32>,
    ) -> Result<Option<FinishReason>> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(Error::RequestNotFound(id))?;
        if !request.state().is_running() {
            return Err(Error::InvalidStateTransition {
                from: request.state().as_str(),
                to: "Decoding",
            });
        }

        let fed = request.total_len() - request.num_cached_tokens();
        request.mark_cached(fed);
        request.record_step();
        if request.state() == RequestState::Prefilling {
            request.apply(RequestEvent::PrefillDone)?;
        }
        request.append_token(token);

        let Some(reason) = request.check_stop(eos_token_id) else {
            return Ok(None);
        };
        let slot = request.slot();
        request.apply(RequestEvent::Finish(reason))?;
        request.set_slot(None);
        let output_len = request.output_len();
        self.release(id, slot);
        debug!("request {id} completed ({reason:?}) after {output_len} tokens");
        Ok(Some(reason))
    }

    /// Fail one request with `error`, releasing its slot.
    pub fn fail_request(&mut self, id: RequestId, error: &Error) -> Result<()> {
        let request = self
            .requests
            .get_mut(&id)
            .ok_or(Error::RequestNotFound(id))?;
        let slot = request.slot();
        request.fail(error)?;
        request.set_slot(None);
        self.release(id, slot);
        warn!("request {id} failed: {error}");
        Ok(())
    }

    fn fail_with(&mut self, id: RequestId, error: &Error, outputs: &mut SchedulerOutputs) {
        match self.fail_request(id, error) {
            Ok(()) => outputs.retired.push(id),
            Err(err) => warn!("could not fail request {id}: {err}"),
        }
    }

    fn terminate(&mut self, id: RequestId, event: RequestEvent, outputs: &mut SchedulerOutputs) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        let slot = request.slot();
        let label = match event {
            RequestEvent::Cancel => "cancelled",
            _ => "timed out",
        };
        if let Err(err) = request.apply(event) {
            warn!("request {id} could not be retired: {err}");
            return;
        }
        request.set_slot(None);
        self.release(id, slot);
        warn!("request {id} {label}");
        outputs.retired.push(id);
    }

    fn preempt(&mut self, id: RequestId, outputs: &mut SchedulerOutputs) {
        let Some(request) = self.requests.get_mut(&id) else {
            return;
        };
        let slot = request.slot();
        if let Err(err) = request.apply(RequestEvent::Preempt) {
            warn!("request {id} could not be preempted: {err}");
            return;
        }
        self.release(id, slot);
        if let Some(request) = self.requests.get(&id) {
            let entry = self.queue_entry(request);
            self.waiting_queue.push(entry);
        }
        warn!("request {id} preempted under memory pressure");
        outputs.preempted.push(id);
    }

    fn release(&mut self, id: RequestId, slot: Option<SlotId>) {
        if let Some(slot) = slot
            && let Err(err) = self.cache.evict(slot)
        {
            warn!("request {id}: releasing slot {slot} failed: {err}");
        }
        self.running_ids.retain(|&r| r != id);
        self.waiting_queue.retain(|e| e.request_id != id);
    }

    fn queue_entry(&self, request: &Request) -> PriorityEntry {
        PriorityEntry {
            request_id: request.id(),
            priority: if self.config.enable_priority {
                request.priority()
            } else {
                DEFAULT_PRIORITY
            },
            arrival_order: request.arrival_seq(),
        }
    }

    // ========== Queries ==========

    /// Get number of waiting requests.
    pub fn num_waiting(&self) -> usize {
        self.waiting_queue.len()
    }

    /// Get number of running requests.
    pub fn num_running(&self) -> usize {
        self.running_ids.len()
    }

    /// Get all running request IDs, in admission order.
    pub fn running_request_ids(&self) -> &[RequestId] {
        &self.running_ids
    }

    /// Check if there are pending requests (waiting or running).
    pub fn has_pending_requests(&self) -> bool {
        !self.waiting_queue.is_empty() || !self.running_ids.is_empty()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn cache_config(&self) -> &CacheConfig {
        &self.cache_config
    }

    pub fn cache(&self) -> &KvCacheManager {
        &self.cache
    }

    /// Mutable cache access for the forward pass.
    pub fn cache_mut(&mut self) -> &mut KvCacheManager {
        &mut self.cache
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::{ModelConfig, SamplingConfig};
    use crate::error::ErrorKind;

    fn layout() -> KvLayout {
        KvLayout::from_model(&ModelConfig::tiny())
    }

    fn scheduler(max_num_seqs: usize) -> Scheduler {
        let config = SchedulerConfig {
            max_num_seqs,
            ..Default::default()
        };
        Scheduler::new(config, CacheConfig::default(), layout())
    }

    fn request(id: RequestId, prompt_len: usize, max_tokens: usize) -> Request {
        Request::new(id, (1..=prompt_len as u32).collect(), SamplingConfig::greedy(max_tokens))
    }

    /// Append the request's pending positions, as a forward pass would.
    fn feed(s: &mut Scheduler, id: RequestId) {
        let request = s.request(id).unwrap();
        let slot = request.slot().unwrap();
        let fed = request.total_len() - request.num_cached_tokens();
        let layout = *s.cache().layout();
        let zeros = vec![0.0; layout.kv_width()];
        for layer in 0..layout.num_layers {
            for _ in 0..fed {
                s.cache_mut().append(slot, layer, &zeros, &zeros).unwrap();
            }
        }
    }

    #[test]
    fn test_priority_entry_ordering() {
        let mut heap = BinaryHeap::new();
        heap.push(PriorityEntry { request_id: 1, priority: 0, arrival_order: 0 });
        heap.push(PriorityEntry { request_id: 2, priority: 5, arrival_order: 1 });
        heap.push(PriorityEntry { request_id: 3, priority: 0, arrival_order: 2 });
        heap.push(PriorityEntry { request_id: 4, priority: 5, arrival_order: 3 });

        let order: Vec<_> = std::iter::from_fn(|| heap.pop().map(|e| e.request_id)).collect();
        assert_eq!(order, vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let mut s = scheduler(4);
        s.add_request(request(1, 3, 4)).unwrap();
        assert!(matches!(
            s.add_request(request(1, 3, 4)),
            Err(Error::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_admission_respects_max_num_seqs() {
        let mut s = scheduler(2);
        for id in 1..=3 {
            s.add_request(request(id, 4, 8)).unwrap();
        }
        let out = s.schedule(Instant::now());
        assert_eq!(out.prefill_requests, vec![1, 2]);
        assert_eq!(out.batch, vec![1, 2]);
        assert_eq!(s.num_waiting(), 1);
        assert_eq!(s.cache().num_active_slots(), 2);
    }

    #[test]
    fn test_prefill_then_decode() {
        let mut s = scheduler(4);
        s.add_request(request(1, 4, 8)).unwrap();

        let out = s.schedule(Instant::now());
        assert_eq!(out.num_prefill_tokens, 4);
        assert_eq!(s.complete_step(1, 9, None).unwrap(), None);
        assert_eq!(s.request(1).unwrap().state(), RequestState::Decoding);

        let out = s.schedule(Instant::now());
        assert_eq!(out.decode_requests, vec![1]);
        assert_eq!(out.num_decode_tokens, 1);
        assert_eq!(s.request(1).unwrap().pending_tokens(), vec![9]);
    }

    #[test]
    fn test_completion_releases_slot() {
        let mut s = scheduler(4);
        s.add_request(request(1, 2, 1)).unwrap();
        s.schedule(Instant::now());

        let reason = s.complete_step(1, 5, None).unwrap();
        assert_eq!(reason, Some(FinishReason::MaxTokens));
        assert_eq!(s.request(1).unwrap().state(), RequestState::Completed);
        assert_eq!(s.cache().num_active_slots(), 0);
        assert_eq!(s.num_running(), 0);
        assert!(!s.has_pending_requests());
    }

    #[test]
    fn test_prefill_budget_first_admission_proceeds() {
        let config = SchedulerConfig {
            max_prefill_tokens: 4,
            ..Default::default()
        };
        let mut s = Scheduler::new(config, CacheConfig::default(), layout());
        s.add_request(request(1, 10, 4)).unwrap();
        s.add_request(request(2, 2, 4)).unwrap();

        let out = s.schedule(Instant::now());
        assert_eq!(out.prefill_requests, vec![1]);
        assert_eq!(s.num_waiting(), 1);
    }

    #[test]
    fn test_prompt_too_long_rejected() {
        let cache = CacheConfig {
            max_context: 8,
            ..Default::default()
        };
        let mut s = Scheduler::new(SchedulerConfig::default(), cache, layout());
        s.add_request(request(1, 9, 4)).unwrap();

        let out = s.schedule(Instant::now());
        assert_eq!(out.retired, vec![1]);
        let failure = s.request(1).unwrap().failure().unwrap();
        assert_eq!(failure.kind, ErrorKind::CacheOverflow);
    }

    #[test]
    fn test_prompt_truncated_when_enabled() {
        let config = SchedulerConfig {
            truncate_long_prompts: true,
            ..Default::default()
        };
        let cache = CacheConfig {
            max_context: 8,
            ..Default::default()
        };
        let mut s = Scheduler::new(config, cache, layout());
        s.add_request(request(1, 10, 4)).unwrap();

        let out = s.schedule(Instant::now());
        assert_eq!(out.prefill_requests, vec![1]);
        let r = s.request(1).unwrap();
        assert_eq!(r.prompt_token_ids(), &[3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(r.truncated_tokens(), 2);
    }

    #[test]
    fn test_cancel_takes_effect_next_tick() {
        let mut s = scheduler(4);
        s.add_request(request(1, 3, 8)).unwrap();
        s.schedule(Instant::now());
        s.complete_step(1, 4, None).unwrap();

        s.cancel(1).unwrap();
        let out = s.schedule(Instant::now());
        assert_eq!(out.retired, vec![1]);
        assert!(out.batch.is_empty());
        assert_eq!(s.request(1).unwrap().state(), RequestState::Cancelled);
        assert_eq!(s.request(1).unwrap().output_token_ids(), &[4]);
        assert_eq!(s.cache().num_active_slots(), 0);
    }

    #[test]
    fn test_cancel_queued_request() {
        let mut s = scheduler(1);
        s.add_request(request(1, 3, 8)).unwrap();
        s.add_request(request(2, 3, 8)).unwrap();
        s.schedule(Instant::now());

        s.cancel(2).unwrap();
        let out = s.schedule(Instant::now());
        assert_eq!(out.retired, vec![2]);
        assert_eq!(s.num_waiting(), 0);
    }

    #[test]
    fn test_timeout_and_step_budget() {
        let mut s = scheduler(4);
        s.add_request(request(1, 3, 8).with_timeout(Some(Duration::from_millis(5))))
            .unwrap();
        s.add_request(request(2, 3, 8).with_max_steps(Some(1))).unwrap();
        s.schedule(Instant::now());
        s.complete_step(1, 7, None).unwrap();
        s.complete_step(2, 7, None).unwrap();

        let later = Instant::now() + Duration::from_secs(1);
        let out = s.schedule(later);
        assert_eq!(out.retired, vec![1, 2]);
        for id in [1, 2] {
            let r = s.request(id).unwrap();
            assert_eq!(r.state(), RequestState::Cancelled);
            assert_eq!(r.failure().unwrap().kind, ErrorKind::Timeout);
        }
    }

    #[test]
    fn test_reject_overflow_fails_only_that_request() {
        let cache = CacheConfig {
            max_context: 4,
            ..Default::default()
        };
        let mut s = Scheduler::new(SchedulerConfig::default(), cache, layout());
        s.add_request(request(1, 4, 8)).unwrap();
        s.add_request(request(2, 1, 8)).unwrap();
        s.schedule(Instant::now());
        for id in [1, 2] {
            feed(&mut s, id);
            s.complete_step(id, 3, None).unwrap();
        }

        let out = s.schedule(Instant::now());
        assert_eq!(out.retired, vec![1]);
        assert_eq!(out.batch, vec![2]);
        assert_eq!(
            s.request(1).unwrap().failure().unwrap().kind,
            ErrorKind::CacheOverflow
        );
    }

    #[test]
    fn test_refuse_admission_keeps_request_queued() {
        let layout = layout();
        let budget = layout.bytes_per_position() * 16;
        let cache = CacheConfig {
            block_size: 16,
            memory_budget_bytes: Some(budget),
            pressure_policy: PressurePolicy::RefuseAdmission,
            ..Default::default()
        };
        let mut s = Scheduler::new(SchedulerConfig::default(), cache, layout);
        s.add_request(request(1, 4, 8)).unwrap();
        s.add_request(request(2, 4, 8)).unwrap();

        let out = s.schedule(Instant::now());
        assert_eq!(out.batch, vec![1]);
        assert_eq!(s.num_waiting(), 1);
        assert_eq!(s.request(2).unwrap().state(), RequestState::Queued);
    }

    #[test]
    fn test_preempt_least_recent_requeues() {
        let layout = layout();
        let budget = layout.bytes_per_position() * 4;
        let cache = CacheConfig {
            block_size: 2,
            memory_budget_bytes: Some(budget),
            pressure_policy: PressurePolicy::PreemptLeastRecent,
            ..Default::default()
        };
        let mut s = Scheduler::new(SchedulerConfig::default(), cache, layout);
        s.add_request(request(1, 2, 8)).unwrap();
        s.add_request(request(2, 2, 8)).unwrap();

        let out = s.schedule(Instant::now());
        assert_eq!(out.batch, vec![1, 2]);
        for id in [1, 2] {
            feed(&mut s, id);
            s.complete_step(id, 3, None).unwrap();
        }

        // Both slots need a third position; request 1 grows first and
        // pushes request 2 out
        let out = s.schedule(Instant::now());
        assert_eq!(out.preempted, vec![2]);
        assert_eq!(out.batch, vec![1]);
        let r = s.request(2).unwrap();
        assert_eq!(r.state(), RequestState::Queued);
        assert_eq!(r.preemptions(), 1);
        assert_eq!(r.pending_tokens(), vec![1, 2, 3]);
    }

    #[test]
    fn test_complete_step_unknown_request() {
        let mut s = scheduler(1);
        assert!(matches!(
            s.complete_step(42, 1, None),
            Err(Error::RequestNotFound(42))
        ));
    }
}
