//! Inference engine.
//!
//! The [`Engine`] drives one tick at a time:
//! - Scheduler for admission, budgets and cache pressure
//! - Model for one shared forward pass over every active request
//! - Sampler per request for token selection
//!
//! ## Engine Flow
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Engine::step                         │
//! └─────────────────────────────────────────────────────────────┘
//!          │
//!          ▼
//!   ┌──────────────┐   drain Submitter queue, validate, enqueue
//!   │  Admission   │
//!   └──────────────┘
//!          │
//!          ▼
//!   ┌──────────────┐   cancel / timeout / admit / reserve
//!   │  Scheduler   │
//!   └──────────────┘
//!          │  batch (admission order)
//!          ▼
//!   ┌──────────────┐   prefill and decode rows in one invocation
//!   │ forward_batch│
//!   └──────────────┘
//!          │  logits per request
//!          ▼
//!   ┌──────────────┐   non-finite ⇒ that request fails alone
//!   │   Sampler    │
//!   └──────────────┘
//!          │
//!          ▼
//!   ┌──────────────┐   stop checks, retire, publish to handles
//!   │   Publish    │
//!   └──────────────┘
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::handle::{RequestHandle, SharedState, Submission, Submitter, lock};
use super::metrics::{RequestMetrics, StepMetrics};
use super::sampler::Sampler;
use crate::config::{EngineConfig, ModelConfig, SamplingConfig};
use crate::core::kv_cache::KvLayout;
use crate::core::sequence::{
    DEFAULT_PRIORITY, Failure, FinishReason, Priority, Request, RequestId, RequestState,
};
use crate::core::tensor::TensorDescriptor;
use crate::error::{Error, Result};
use crate::kernels::KernelDispatcher;
use crate::model::{BatchEntry, CausalLm, ModelWeights, Transformer};
use crate::scheduler::{Scheduler, SchedulerOutputs};

/// Request for token generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Prompt token IDs.
    pub prompt_token_ids: Vec<u32>,
    /// Sampling configuration for this request.
    pub sampling_config: SamplingConfig,
    /// Priority (higher = more important).
    pub priority: Priority,
    /// Wall-clock budget from admission into the engine.
    pub timeout: Option<Duration>,
    /// Maximum ticks the request may take part in.
    pub max_steps: Option<usize>,
}

impl GenerationRequest {
    /// Create a new generation request with default settings.
    pub fn new(prompt_token_ids: Vec<u32>) -> Self {
        Self {
            prompt_token_ids,
            sampling_config: SamplingConfig::default(),
            priority: DEFAULT_PRIORITY,
            timeout: None,
            max_steps: None,
        }
    }

    /// Replace the whole sampling configuration.
    pub fn sampling(mut self, sampling_config: SamplingConfig) -> Self {
        self.sampling_config = sampling_config;
        self
    }

    /// Set the maximum tokens to generate.
    pub fn max_tokens(mut self, max_tokens: usize) -> Self {
        self.sampling_config.max_tokens = max_tokens;
        self
    }

    /// Set the temperature for sampling.
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.sampling_config.temperature = temperature;
        self
    }

    /// Set top-k sampling parameter.
    pub fn top_k(mut self, top_k: usize) -> Self {
        self.sampling_config.top_k = top_k;
        self
    }

    /// Set top-p (nucleus) sampling parameter.
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.sampling_config.top_p = top_p;
        self
    }

    /// Seed the sampler.
    pub fn seed(mut self, seed: u64) -> Self {
        self.sampling_config.seed = Some(seed);
        self
    }

    /// Add a token sequence that ends generation.
    pub fn stop_sequence(mut self, stop: Vec<u32>) -> Self {
        self.sampling_config.stop_sequences.push(stop);
        self
    }

    /// Set request priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = Some(max_steps);
        self
    }

    /// Check the parameters that do not depend on the model.
    pub fn validate(&self) -> Result<()> {
        if self.prompt_token_ids.is_empty() {
            return Err(Error::InvalidRequest("empty prompt".into()));
        }
        let s = &self.sampling_config;
        if s.max_tokens == 0 {
            return Err(Error::InvalidRequest("max_tokens must be at least 1".into()));
        }
        if !s.temperature.is_finite() {
            return Err(Error::InvalidRequest(format!(
                "temperature must be finite, got {}",
                s.temperature
            )));
        }
        if !(s.top_p > 0.0 && s.top_p <= 1.0) {
            return Err(Error::InvalidRequest(format!(
                "top_p must be in (0, 1], got {}",
                s.top_p
            )));
        }
        Ok(())
    }
}

/// Result of a finished request.
#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub request_id: RequestId,
    /// Prompt as processed (after any truncation).
    pub prompt_token_ids: Vec<u32>,
    /// Generated tokens; partial for failed or cancelled requests.
    pub output_token_ids: Vec<u32>,
    /// `Completed`, `Cancelled` or `Failed`.
    pub state: RequestState,
    pub finish_reason: Option<FinishReason>,
    pub failure: Option<Failure>,
    pub metrics: RequestMetrics,
}

impl GenerationOutput {
    fn from_request(request: &Request, now: Instant) -> Self {
        Self {
            request_id: request.id(),
            prompt_token_ids: request.prompt_token_ids().to_vec(),
            output_token_ids: request.output_token_ids().to_vec(),
            state: request.state(),
            finish_reason: request.finish_reason(),
            failure: request.failure().cloned(),
            metrics: RequestMetrics::from_request(request, now),
        }
    }

    pub fn is_completed(&self) -> bool {
        self.state == RequestState::Completed
    }
}

/// Result of one [`Engine::step`].
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// Requests that reached a terminal state this tick.
    pub finished: Vec<GenerationOutput>,
    pub metrics: StepMetrics,
}

/// Inference engine.
///
/// Owns the model and scheduler and runs the tick loop on the caller's
/// thread. Other threads submit through a [`Submitter`].
pub struct Engine<M: CausalLm = Transformer> {
    model: M,
    config: EngineConfig,
    scheduler: Scheduler,
    /// Sampler per live request.
    samplers: HashMap<RequestId, Sampler>,
    /// Published state per live request.
    published: HashMap<RequestId, SharedState>,
    submitter: Submitter,
    step_count: u64,
}

impl Engine<Transformer> {
    /// Build a [`Transformer`] from weight descriptors and wrap it.
    ///
    /// # Arguments
    ///
    /// * `model_config` - Architecture of the weights
    /// * `descriptors` - Tensors from the model-loading collaborator
    /// * `config` - Engine configuration
    pub fn from_descriptors(
        model_config: ModelConfig,
        descriptors: Vec<TensorDescriptor>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let kernels = KernelDispatcher::new(config.kernels.clone())?;
        let weights = ModelWeights::from_descriptors(descriptors)?;
        let model =
            Transformer::from_weights(model_config, weights, kernels, config.dequantize_at_load)?;
        Self::new(model, config)
    }
}

impl<M: CausalLm> Engine<M> {
    /// Create a new engine around a loaded model.
    pub fn new(model: M, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        model.config().validate()?;

        let layout = KvLayout::from_model(model.config());
        let scheduler = Scheduler::new(config.scheduler.clone(), config.cache.clone(), layout);
        info!(
            "engine ready: max {} seqs, context {}, cache budget {:?}, {:?} / {:?}",
            config.scheduler.max_num_seqs,
            config.cache.max_context,
            config.cache.memory_budget_bytes,
            config.cache.overflow_policy,
            config.cache.pressure_policy
        );

        Ok(Self {
            model,
            config,
            scheduler,
            samplers: HashMap::new(),
            published: HashMap::new(),
            submitter: Submitter::new(Arc::new(AtomicU64::new(1))),
            step_count: 0,
        })
    }

    /// Submit a request. It is admitted at the start of a later tick.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for an empty prompt, a zero token
    /// limit, unusable sampling parameters or out-of-vocabulary tokens.
    pub fn submit(&mut self, request: GenerationRequest) -> Result<RequestHandle> {
        check_vocab(&request.prompt_token_ids, self.model.config().vocab_size)?;
        self.submitter.submit(request)
    }

    /// A cloneable endpoint other threads can submit through.
    pub fn submitter(&self) -> Submitter {
        self.submitter.clone()
    }

    /// Run one tick.
    pub fn step(&mut self) -> StepOutput {
        let started = Instant::now();
        self.step_count += 1;
        let mut metrics = StepMetrics {
            step: self.step_count,
            ..Default::default()
        };

        let mut finished = self.drain_submissions(started);
        let outputs = self.scheduler.schedule(started);
        let mut finished_ids = outputs.retired.clone();

        if !outputs.is_empty() {
            self.run_batch(&outputs, &mut finished_ids, &mut metrics);
        }

        for &id in outputs
            .batch
            .iter()
            .chain(&outputs.retired)
            .chain(&outputs.preempted)
        {
            self.publish(id);
        }

        let now = Instant::now();
        for id in finished_ids {
            self.samplers.remove(&id);
            self.published.remove(&id);
            if let Some(request) = self.scheduler.remove_request(id) {
                finished.push(GenerationOutput::from_request(&request, now));
            }
        }

        metrics.batch_size = outputs.batch.len();
        metrics.num_prefill_tokens = outputs.num_prefill_tokens;
        metrics.num_decode_tokens = outputs.num_decode_tokens;
        metrics.num_preempted = outputs.preempted.len();
        metrics.num_finished = finished.len();
        metrics.cache_used_bytes = self.scheduler.cache().used_bytes();
        metrics.cache_occupancy = self.scheduler.cache().occupancy();
        metrics.queue_depth = self.scheduler.num_waiting() + self.submitter.pending();
        metrics.num_running = self.scheduler.num_running();
        metrics.finish(now.saturating_duration_since(started));

        debug!(
            "step {}: batch {} ({} prefill / {} decode tokens), {} generated, {:.1} tok/s, \
             cache {} bytes ({:.0}%), queue {}, finished {}",
            metrics.step,
            metrics.batch_size,
            metrics.num_prefill_tokens,
            metrics.num_decode_tokens,
            metrics.tokens_generated,
            metrics.tokens_per_second,
            metrics.cache_used_bytes,
            metrics.cache_occupancy * 100.0,
            metrics.queue_depth,
            metrics.num_finished
        );

        StepOutput { finished, metrics }
    }

    /// Admit everything submitted since the last tick.
    fn drain_submissions(&mut self, now: Instant) -> Vec<GenerationOutput> {
        let vocab_size = self.model.config().vocab_size;
        let mut rejected = Vec::new();

        for Submission {
            id,
            request,
            shared,
            cancel_flag,
            submitted_at,
        } in self.submitter.drain()
        {
            let sampler = Sampler::new(&request.sampling_config);
            let mut entry = Request::new(id, request.prompt_token_ids, request.sampling_config)
                .with_priority(request.priority)
                .with_timeout(request.timeout)
                .with_max_steps(request.max_steps)
                .with_cancel_flag(cancel_flag)
                .with_arrival_time(submitted_at);

            if let Err(err) = check_vocab(entry.prompt_token_ids(), vocab_size) {
                warn!("request {id} rejected: {err}");
                if entry.fail(&err).is_ok() {
                    write_published(&shared, &entry);
                    rejected.push(GenerationOutput::from_request(&entry, now));
                }
                continue;
            }
            if let Err(err) = self.scheduler.add_request(entry) {
                warn!("request {id} rejected: {err}");
                let mut published = lock(&shared);
                published.state = RequestState::Failed;
                published.failure = Some(Failure::from(&err));
                continue;
            }
            self.samplers.insert(id, sampler);
            self.published.insert(id, shared);
        }
        rejected
    }

    /// One shared forward pass over the batch, then sampling per request.
    fn run_batch(
        &mut self,
        outputs: &SchedulerOutputs,
        finished: &mut Vec<RequestId>,
        metrics: &mut StepMetrics,
    ) {
        let mut ids = Vec::with_capacity(outputs.batch.len());
        let mut entries = Vec::with_capacity(outputs.batch.len());
        for &id in &outputs.batch {
            if let Some(request) = self.scheduler.request(id)
                && let Some(slot) = request.slot()
            {
                ids.push(id);
                entries.push(BatchEntry {
                    slot,
                    tokens: request.pending_tokens(),
                });
            }
        }

        let result = self
            .model
            .forward_batch(self.scheduler.cache_mut(), &entries)
            .and_then(|logits| {
                if logits.len() == ids.len() {
                    Ok(logits)
                } else {
                    Err(Error::shape("forward_batch", &[ids.len()], &[logits.len()]))
                }
            });
        let logits = match result {
            Ok(logits) => logits,
            Err(err) => {
                // Requests already retired before the pass are unaffected
                warn!("forward pass over {} requests failed: {err}", ids.len());
                for &id in &ids {
                    if self.scheduler.fail_request(id, &err).is_ok() {
                        finished.push(id);
                    }
                }
                return;
            }
        };

        let eos = self.model.config().eos_token_id;
        for (id, row) in ids.iter().copied().zip(&logits) {
            let Some(sampler) = self.samplers.get_mut(&id) else {
                continue;
            };
            let token = match sampler.sample(row) {
                Ok(token) => token,
                Err(err) => {
                    if self.scheduler.fail_request(id, &err).is_ok() {
                        finished.push(id);
                    }
                    continue;
                }
            };

            let first = self
                .scheduler
                .request(id)
                .is_some_and(|r| r.first_token_time().is_none());
            match self.scheduler.complete_step(id, token, eos) {
                Ok(reason) => {
                    metrics.tokens_generated += 1;
                    if first && let Some(r) = self.scheduler.request(id) {
                        let ttft = r
                            .first_token_time()
                            .map(|t| t.saturating_duration_since(r.arrival_time()))
                            .unwrap_or_default();
                        metrics.time_to_first_token.push((id, ttft));
                    }
                    if reason.is_some() {
                        finished.push(id);
                    }
                }
                Err(err) => {
                    if self.scheduler.fail_request(id, &err).is_ok() {
                        finished.push(id);
                    }
                }
            }
        }
    }

    fn publish(&self, id: RequestId) {
        if let (Some(shared), Some(request)) = (self.published.get(&id), self.scheduler.request(id))
        {
            write_published(shared, request);
        }
    }

    /// Step until no request is queued, running or waiting to be drained.
    ///
    /// Returns every request that finished along the way.
    pub fn run_until_idle(&mut self) -> Vec<GenerationOutput> {
        let mut all_outputs = Vec::new();
        while self.has_pending_requests() {
            all_outputs.extend(self.step().finished);
        }
        all_outputs
    }

    /// Submit one request and run until it finishes.
    pub fn generate(&mut self, request: GenerationRequest) -> Result<GenerationOutput> {
        let id = self.submit(request)?.id();
        self.run_until_idle()
            .into_iter()
            .find(|o| o.request_id == id)
            .ok_or(Error::RequestNotFound(id))
    }

    /// Check if there are pending requests (submitted, waiting or running).
    pub fn has_pending_requests(&self) -> bool {
        self.scheduler.has_pending_requests() || self.submitter.pending() > 0
    }

    /// Get the number of pending requests.
    pub fn num_pending_requests(&self) -> usize {
        self.scheduler.num_waiting() + self.scheduler.num_running() + self.submitter.pending()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }
}

fn check_vocab(tokens: &[u32], vocab_size: usize) -> Result<()> {
    match tokens.iter().find(|&&t| t as usize >= vocab_size) {
        Some(t) => Err(Error::InvalidRequest(format!(
            "prompt token {t} outside vocabulary of {vocab_size}"
        ))),
        None => Ok(()),
    }
}

fn write_published(shared: &SharedState, request: &Request) {
    let mut published = lock(shared);
    let have = published.tokens.len();
    let output = request.output_token_ids();
    if output.len() > have {
        published.tokens.extend_from_slice(&output[have..]);
    }
    published.state = request.state();
    published.finish_reason = request.finish_reason();
    published.failure = request.failure().cloned();
}
