//! Continuous batching scheduler.
//!
//! The [`Scheduler`] owns every piece of mutable serving state: the sequence
//! table, the allocator and the executor. Exactly one thread drives it, one
//! [`Scheduler::step`] at a time, so none of that state needs a lock.
//!
//! ## One tick
//!
//! ```text
//! apply cancellations ─► compose plan ─► reserve decode pages (preempting
//!        │                                 if the pool is exhausted)
//!        ▼
//! allocate chains for ─► build fixed-shape ─► run kernel ─► apply results
//! picked admissions       batch                 │
//!                                               ▼ (failure)
//!                                     abort every row in the batch
//!        ▼
//! retire terminal sequences, free their chains, emit stream events
//! ```

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::config::{EngineConfig, SamplingConfig};
use crate::core::allocator::{CacheAllocator, PoolGauge, PoolUsage};
use crate::core::page::SlotHandle;
use crate::core::sequence::{FinishReason, RequestId, SequenceState, SequenceStatus};
use crate::engine::executor::{ForwardKernel, RowOutcome, StepExecutor};
use crate::engine::serving::StreamEvent;
use crate::error::{Error, ErrorKind, Result};
use crate::scheduler::batch::{BatchDescriptor, BatchEntry, Role};
use crate::scheduler::composer::{BatchComposer, BatchPlan, Candidate, CandidatePhase};

/// Counters accumulated over the scheduler's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerStats {
    pub steps: u64,
    pub admitted: u64,
    pub rejected: u64,
    pub prefill_tokens: u64,
    pub decode_tokens: u64,
    pub generated_tokens: u64,
    pub padding_rows: u64,
    pub completed: u64,
    pub aborted: u64,
    pub cancelled: u64,
    pub preemptions: u64,
    pub kernel_failures: u64,
    pub invariant_violations: u64,
}

/// What happened during one tick.
#[derive(Debug, Clone, Default)]
pub struct StepReport {
    pub step: u64,
    /// Real rows of the executed batch, in row order.
    pub rows: Vec<(RequestId, Role)>,
    pub token_width: usize,
    pub padding_rows: usize,
    pub kernel_failed: bool,
    /// Stream events produced this tick, in emission order.
    pub events: Vec<(RequestId, StreamEvent)>,
}

impl StepReport {
    /// Whether a batch reached the kernel.
    pub fn ran_batch(&self) -> bool {
        !self.rows.is_empty()
    }

    pub fn role_of(&self, request_id: RequestId) -> Option<Role> {
        self.rows
            .iter()
            .find(|(id, _)| *id == request_id)
            .map(|&(_, role)| role)
    }

    /// Tokens emitted for `request_id` this tick.
    pub fn tokens_for(&self, request_id: RequestId) -> Vec<u32> {
        self.events
            .iter()
            .filter_map(|(id, event)| match event {
                StreamEvent::Token(token) if *id == request_id => Some(*token),
                _ => None,
            })
            .collect()
    }

    /// Terminal event for `request_id`, if it was retired this tick.
    pub fn terminal_for(&self, request_id: RequestId) -> Option<StreamEvent> {
        self.events
            .iter()
            .find(|(id, event)| *id == request_id && event.is_terminal())
            .map(|&(_, event)| event)
    }
}

/// Drives admission, composition, execution and retirement.
pub struct Scheduler<K> {
    allocator: CacheAllocator,
    composer: BatchComposer,
    executor: StepExecutor<K>,
    eos_token_id: Option<u32>,
    /// Live sequences; removed on retirement.
    sequences: HashMap<RequestId, SequenceState>,
    /// Live request ids in admission order.
    active_ids: Vec<RequestId>,
    arrival_counter: u64,
    step_counter: u64,
    stats: SchedulerStats,
    /// Events not yet handed out.
    events: Vec<(RequestId, StreamEvent)>,
}

impl<K: ForwardKernel> Scheduler<K> {
    /// Create a scheduler over a fresh page pool.
    pub fn new(config: &EngineConfig, kernel: K) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            allocator: CacheAllocator::from_config(&config.cache),
            composer: BatchComposer::new(&config.scheduler, config.pad_token_id),
            executor: StepExecutor::new(kernel),
            eos_token_id: config.eos_token_id,
            sequences: HashMap::new(),
            active_ids: Vec::new(),
            arrival_counter: 0,
            step_counter: 0,
            stats: SchedulerStats::default(),
            events: Vec::new(),
        })
    }

    // ========== Admission ==========

    /// Queue a request.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidRequest`] for an empty prompt, a duplicate id or bad
    ///   sampling parameters.
    /// - [`Error::OversizedRequest`] if the prompt alone needs more pages than
    ///   a chain may hold.
    pub fn admit(
        &mut self,
        request_id: RequestId,
        prompt: Vec<u32>,
        sampling: SamplingConfig,
    ) -> Result<()> {
        if prompt.is_empty() {
            return Err(Error::InvalidRequest("prompt is empty".into()));
        }
        if self.sequences.contains_key(&request_id) {
            return Err(Error::InvalidRequest(format!(
                "duplicate request id {request_id}"
            )));
        }
        sampling.validate()?;

        let required_pages = self.allocator.pages_for(prompt.len());
        let max_pages = self.allocator.max_chain_pages();
        if required_pages > max_pages {
            self.stats.rejected += 1;
            warn!(
                request_id = %request_id,
                required_pages,
                max_pages,
                "rejecting oversized request"
            );
            return Err(Error::OversizedRequest {
                required_pages,
                max_pages,
            });
        }

        self.executor.register(request_id, &sampling);
        let seq = SequenceState::new(request_id, prompt, sampling, self.arrival_counter);
        self.arrival_counter += 1;
        info!(
            request_id = %request_id,
            prompt_len = seq.prompt_len(),
            max_tokens = seq.sampling().max_tokens,
            "admitted request"
        );
        self.sequences.insert(request_id, seq);
        self.active_ids.push(request_id);
        self.stats.admitted += 1;
        Ok(())
    }

    /// Ask for a request to stop; it takes effect at the start of the next tick.
    ///
    /// Returns `false` (and does nothing) for unknown or already finished
    /// requests.
    pub fn cancel(&mut self, request_id: RequestId) -> bool {
        match self.sequences.get_mut(&request_id) {
            Some(seq) if seq.status().is_active() => {
                seq.request_cancel();
                debug!(request_id = %request_id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    /// Abort every live request with `kind` and release their chains.
    pub fn abort_all(&mut self, kind: ErrorKind) -> Vec<(RequestId, StreamEvent)> {
        let ids = self.active_ids.clone();
        for request_id in ids {
            self.abort_sequence(request_id, kind);
        }
        self.retire();
        mem::take(&mut self.events)
    }

    /// Check that every page went back to the pool.
    pub fn teardown(&self) -> Result<()> {
        self.allocator.teardown()
    }

    // ========== Queries ==========

    /// No queued or in-flight work.
    pub fn is_idle(&self) -> bool {
        self.active_ids.is_empty()
    }

    pub fn num_active(&self) -> usize {
        self.active_ids.len()
    }

    /// Requests waiting for a chain.
    pub fn num_queued(&self) -> usize {
        self.count_status(SequenceStatus::Queued)
    }

    /// Requests holding a chain.
    pub fn num_running(&self) -> usize {
        self.count_status(SequenceStatus::Prefilling) + self.count_status(SequenceStatus::Decoding)
    }

    pub fn sequence(&self, request_id: RequestId) -> Option<&SequenceState> {
        self.sequences.get(&request_id)
    }

    pub fn stats(&self) -> &SchedulerStats {
        &self.stats
    }

    pub fn pool_usage(&self) -> PoolUsage {
        self.allocator.usage()
    }

    pub fn gauge(&self) -> Arc<PoolGauge> {
        self.allocator.gauge()
    }

    pub fn allocator(&self) -> &CacheAllocator {
        &self.allocator
    }

    pub fn kernel(&self) -> &K {
        self.executor.kernel()
    }

    // ========== Tick ==========

    /// Run one scheduling tick.
    ///
    /// Kernel failures and broken invariants abort the affected requests and
    /// are reported through the returned events, not as an `Err`.
    pub fn step(&mut self) -> Result<StepReport> {
        self.step_counter += 1;
        self.stats.steps += 1;
        let step = self.step_counter;

        self.apply_cancellations();

        let candidates = self.candidates();
        let mut plan = self
            .composer
            .compose(&candidates, self.allocator.num_free_pages());
        self.reserve_decode_capacity(&mut plan);
        self.allocate_admissions(&mut plan);
        let entries = self.build_entries(&plan);

        let mut report = StepReport {
            step,
            ..StepReport::default()
        };
        if !entries.is_empty() {
            let batch = self.composer.build(step, entries)?;
            report.rows = batch.summary();
            report.token_width = batch.token_width();
            report.padding_rows = batch.num_padding();
            self.stats.padding_rows += batch.num_padding() as u64;
            debug!(
                step,
                rows = batch.num_real(),
                padding = batch.num_padding(),
                token_width = batch.token_width(),
                prefill_tokens = batch.num_tokens(Role::Prefill),
                decode_tokens = batch.num_tokens(Role::Decode),
                "composed batch"
            );

            match self.executor.run(&batch) {
                Ok(outcomes) => self.apply_outcomes(&batch, &outcomes),
                Err(err) => {
                    report.kernel_failed = true;
                    self.fail_batch(&batch, &err);
                }
            }
        }

        self.retire();
        report.events = mem::take(&mut self.events);
        Ok(report)
    }

    fn apply_cancellations(&mut self) {
        let mut any = false;
        for seq in self.sequences.values_mut() {
            if seq.cancel_requested() && seq.status().is_active() {
                if let Err(err) = seq.cancel() {
                    error!(request_id = %seq.id(), error = %err, "failed to cancel sequence");
                    continue;
                }
                any = true;
            }
        }
        if any {
            self.retire();
        }
    }

    fn candidates(&self) -> Vec<Candidate> {
        self.active_ids
            .iter()
            .filter_map(|id| self.sequences.get(id))
            .filter_map(|seq| {
                let phase = match seq.status() {
                    SequenceStatus::Queued => CandidatePhase::Queued {
                        pages_needed: self.allocator.pages_for(seq.prefill_target()),
                        prefill_len: seq.num_tokens_to_prefill(),
                    },
                    SequenceStatus::Prefilling => CandidatePhase::Prefilling {
                        remaining: seq.num_tokens_to_prefill(),
                    },
                    SequenceStatus::Decoding => CandidatePhase::Decoding,
                    _ => return None,
                };
                Some(Candidate {
                    request_id: seq.id(),
                    arrival_order: seq.arrival_order(),
                    phase,
                })
            })
            .collect()
    }

    /// Make room for one more token in every planned decode row.
    ///
    /// On exhaustion the youngest chain holder is preempted, which may be the
    /// requester itself. A lone chain holder that cannot grow is finished.
    fn reserve_decode_capacity(&mut self, plan: &mut BatchPlan) {
        let mut pending: VecDeque<RequestId> = plan.decode.drain(..).collect();
        while let Some(request_id) = pending.pop_front() {
            loop {
                match self.grow_for_decode(request_id) {
                    Ok(()) => {
                        plan.decode.push(request_id);
                        break;
                    }
                    Err(Error::CapacityExhausted { requested, free }) => {
                        let (victim, holders) = self.preemption_victim();
                        match victim {
                            Some(victim) if victim != request_id || holders > 1 => {
                                warn!(
                                    request_id = %request_id,
                                    victim = %victim,
                                    requested,
                                    free,
                                    "KV cache exhausted, preempting"
                                );
                                self.preempt(victim);
                                pending.retain(|&id| id != victim);
                                plan.prefill.retain(|row| row.request_id != victim);
                                if victim == request_id {
                                    break;
                                }
                            }
                            _ => {
                                self.finish(request_id, FinishReason::ContextLimit);
                                break;
                            }
                        }
                    }
                    Err(Error::OversizedRequest { max_pages, .. }) => {
                        debug!(request_id = %request_id, max_pages, "chain limit reached");
                        self.finish(request_id, FinishReason::ContextLimit);
                        break;
                    }
                    Err(err) => {
                        self.abort_broken(request_id, &err);
                        break;
                    }
                }
            }
        }
    }

    fn grow_for_decode(&mut self, request_id: RequestId) -> Result<()> {
        let seq = self
            .sequences
            .get(&request_id)
            .ok_or(Error::SequenceNotFound(request_id))?;
        let slot = seq.slot().ok_or(Error::MissingSlot(request_id))?;
        // The last sampled token is written this step.
        let needed = seq.total_len();
        let reserved = self.allocator.chain(slot)?.reserved();
        if needed > reserved {
            self.allocator.extend(slot, needed - reserved)?;
        }
        Ok(())
    }

    /// Youngest sequence holding a chain, and how many hold one.
    fn preemption_victim(&self) -> (Option<RequestId>, usize) {
        let holders = self
            .active_ids
            .iter()
            .filter_map(|id| self.sequences.get(id))
            .filter(|seq| seq.slot().is_some());
        let mut count = 0;
        let mut youngest: Option<&SequenceState> = None;
        for seq in holders {
            count += 1;
            if youngest.map_or(true, |y| seq.arrival_order() > y.arrival_order()) {
                youngest = Some(seq);
            }
        }
        (youngest.map(SequenceState::id), count)
    }

    fn preempt(&mut self, request_id: RequestId) {
        let Some(seq) = self.sequences.get_mut(&request_id) else {
            return;
        };
        let slot = seq.take_slot();
        // Recompute must fit a single chain again.
        if self.allocator.fits_chain(seq.total_len()) {
            if let Err(err) = seq.requeue() {
                error!(request_id = %request_id, error = %err, "failed to requeue preempted sequence");
            }
            info!(
                request_id = %request_id,
                recompute_tokens = seq.prefill_target(),
                preemptions = seq.num_preemptions(),
                "preempted sequence"
            );
            self.stats.preemptions += 1;
        } else if let Err(err) = seq.complete(FinishReason::ContextLimit) {
            error!(request_id = %request_id, error = %err, "failed to complete sequence");
        }
        if let Some(slot) = slot {
            self.release_slot(request_id, slot);
        }
    }

    /// Allocate chains for picked admissions, in admission order.
    ///
    /// Once the per-tick attempt cap is spent on transient failures, every
    /// later admission waits for a future tick.
    fn allocate_admissions(&mut self, plan: &mut BatchPlan) {
        let max_failures = self.composer.max_admission_attempts();
        let mut failures = 0;
        let mut deferred = false;
        let mut confirmed = Vec::with_capacity(plan.prefill.len());
        for row in plan.prefill.drain(..) {
            if !row.needs_allocation {
                confirmed.push(row);
                continue;
            }
            if deferred {
                continue;
            }
            let Some(seq) = self.sequences.get_mut(&row.request_id) else {
                continue;
            };
            match self.allocator.allocate(row.request_id, seq.prefill_target()) {
                Ok(slot) => match seq.start_prefill(slot) {
                    Ok(()) => confirmed.push(row),
                    Err(err) => {
                        error!(request_id = %row.request_id, error = %err, "admission failed");
                        if let Err(err) = self.allocator.free(slot) {
                            error!(request_id = %row.request_id, error = %err, "failed to release slot chain");
                        }
                        self.abort_broken(row.request_id, &err);
                    }
                },
                Err(err) if err.is_transient() => {
                    debug!(request_id = %row.request_id, error = %err, "admission deferred");
                    failures += 1;
                    deferred = failures >= max_failures;
                }
                Err(err) => {
                    warn!(request_id = %row.request_id, error = %err, "admission rejected");
                    self.abort_sequence(row.request_id, err.kind());
                }
            }
        }
        plan.prefill = confirmed;
    }

    fn build_entries(&mut self, plan: &BatchPlan) -> Vec<BatchEntry> {
        let mut entries = Vec::with_capacity(plan.num_rows());
        for row in &plan.prefill {
            match self.prefill_entry(row.request_id, row.chunk_len) {
                Ok(entry) => entries.push(entry),
                Err(err) => self.abort_broken(row.request_id, &err),
            }
        }
        for &request_id in &plan.decode {
            match self.decode_entry(request_id) {
                Ok(entry) => entries.push(entry),
                Err(err) => self.abort_broken(request_id, &err),
            }
        }
        entries
    }

    fn prefill_entry(&self, request_id: RequestId, chunk_len: usize) -> Result<BatchEntry> {
        let seq = self
            .sequences
            .get(&request_id)
            .ok_or(Error::SequenceNotFound(request_id))?;
        let slot = seq.slot().ok_or(Error::MissingSlot(request_id))?;
        let (start, tokens) = seq.next_prefill_chunk(chunk_len);
        let slot_mapping = self.allocator.slot_mapping(slot, start, tokens.len())?;
        let samples_token = start + tokens.len() >= seq.prefill_target();
        Ok(BatchEntry {
            request_id,
            role: Role::Prefill,
            slot,
            start_position: start,
            tokens,
            slot_mapping,
            samples_token,
        })
    }

    fn decode_entry(&self, request_id: RequestId) -> Result<BatchEntry> {
        let seq = self
            .sequences
            .get(&request_id)
            .ok_or(Error::SequenceNotFound(request_id))?;
        let slot = seq.slot().ok_or(Error::MissingSlot(request_id))?;
        let position = seq.total_len().saturating_sub(1);
        let token = seq
            .token_at(position)
            .ok_or(Error::SequenceNotFound(request_id))?;
        let slot_mapping = self.allocator.slot_mapping(slot, position, 1)?;
        Ok(BatchEntry {
            request_id,
            role: Role::Decode,
            slot,
            start_position: position,
            tokens: vec![token],
            slot_mapping,
            samples_token: true,
        })
    }

    fn apply_outcomes(&mut self, batch: &BatchDescriptor, outcomes: &[RowOutcome]) {
        for ((_, entry), outcome) in batch.entries().zip(outcomes) {
            if let Err(err) = self.apply_row(entry, outcome) {
                self.abort_broken(entry.request_id, &err);
            }
        }
    }

    fn apply_row(&mut self, entry: &BatchEntry, outcome: &RowOutcome) -> Result<()> {
        self.allocator.advance(entry.slot, outcome.written)?;
        let seq = self
            .sequences
            .get_mut(&entry.request_id)
            .ok_or(Error::SequenceNotFound(entry.request_id))?;

        match entry.role {
            Role::Prefill => {
                seq.mark_prefilled(outcome.written);
                self.stats.prefill_tokens += outcome.written as u64;
                if seq.is_prefill_complete() {
                    seq.start_decode()?;
                }
            }
            Role::Decode => self.stats.decode_tokens += outcome.written as u64,
        }

        let Some(token) = outcome.next_token else {
            return Ok(());
        };
        if seq.is_stop_token(token, self.eos_token_id) {
            seq.complete(FinishReason::StopToken(token))?;
            return Ok(());
        }
        seq.append_token(token);
        self.stats.generated_tokens += 1;
        self.events.push((seq.id(), StreamEvent::Token(token)));
        if !seq.has_token_budget() {
            seq.complete(FinishReason::MaxTokens)?;
        }
        Ok(())
    }

    fn fail_batch(&mut self, batch: &BatchDescriptor, err: &Error) {
        self.stats.kernel_failures += 1;
        error!(
            step = batch.step(),
            rows = batch.num_real(),
            error = %err,
            "step failed, aborting batch"
        );
        let kind = err.kind();
        for (_, entry) in batch.entries() {
            self.abort_sequence(entry.request_id, kind);
        }
    }

    // ========== Retirement ==========

    fn finish(&mut self, request_id: RequestId, reason: FinishReason) {
        if let Some(seq) = self.sequences.get_mut(&request_id) {
            if let Err(err) = seq.complete(reason) {
                error!(request_id = %request_id, error = %err, "failed to complete sequence");
            }
        }
    }

    fn abort_sequence(&mut self, request_id: RequestId, kind: ErrorKind) {
        if let Some(seq) = self.sequences.get_mut(&request_id) {
            if seq.status().is_active() {
                if let Err(err) = seq.abort(kind) {
                    error!(request_id = %request_id, error = %err, "failed to abort sequence");
                }
            }
        }
    }

    /// Abort a request whose bookkeeping no longer adds up.
    fn abort_broken(&mut self, request_id: RequestId, err: &Error) {
        self.stats.invariant_violations += 1;
        error!(request_id = %request_id, error = %err, "invariant violated, aborting request");
        self.abort_sequence(request_id, ErrorKind::InvariantViolation);
    }

    fn release_slot(&mut self, request_id: RequestId, slot: SlotHandle) {
        if let Err(err) = self.allocator.free(slot) {
            self.stats.invariant_violations += 1;
            error!(request_id = %request_id, error = %err, "failed to release slot chain");
        }
    }

    /// Drop terminal sequences, free their chains and emit terminal events.
    fn retire(&mut self) {
        let mut still_active = Vec::with_capacity(self.active_ids.len());
        for request_id in mem::take(&mut self.active_ids) {
            let terminal = self
                .sequences
                .get(&request_id)
                .map_or(true, |seq| seq.status().is_terminal());
            if !terminal {
                still_active.push(request_id);
                continue;
            }
            let Some(mut seq) = self.sequences.remove(&request_id) else {
                continue;
            };
            if let Some(slot) = seq.take_slot() {
                self.release_slot(request_id, slot);
            }
            self.executor.release(request_id);

            let event = match seq.status() {
                SequenceStatus::Completed => {
                    self.stats.completed += 1;
                    StreamEvent::Completed(seq.finish_reason().unwrap_or(FinishReason::MaxTokens))
                }
                SequenceStatus::Aborted => {
                    self.stats.aborted += 1;
                    StreamEvent::Aborted(seq.abort_reason().unwrap_or(ErrorKind::Internal))
                }
                _ => {
                    self.stats.cancelled += 1;
                    StreamEvent::Cancelled
                }
            };
            info!(
                request_id = %request_id,
                status = seq.status().as_str(),
                generated = seq.output_len(),
                preemptions = seq.num_preemptions(),
                latency_ms = seq.arrival_time().elapsed().as_millis() as u64,
                "retired request"
            );
            self.events.push((request_id, event));
        }
        self.active_ids = still_active;
    }

    fn count_status(&self, status: SequenceStatus) -> usize {
        self.sequences
            .values()
            .filter(|seq| seq.status() == status)
            .count()
    }
}
