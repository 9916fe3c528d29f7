//! Per-request bookkeeping.
//!
//! A [`SequenceState`] tracks one admitted request: its prompt, the tokens
//! generated so far, the cache chain it borrows from the allocator, and where
//! it stands in its lifecycle. Only the scheduling loop mutates it.
//!
//! ```text
//!   Queued ──► Prefilling ──► Decoding ──► Completed
//!     ▲            │             │
//!     └────────────┴─────────────┘  (preempted: chain released, requeued)
//!
//!   any non-terminal state ──► Aborted | Cancelled
//! ```

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::config::SamplingConfig;
use crate::core::page::SlotHandle;
use crate::error::{Error, ErrorKind, Result};

/// Opaque request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Lifecycle status of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SequenceStatus {
    /// Admitted, waiting for a cache chain.
    Queued,
    /// Holding a chain and ingesting its prompt, possibly over several ticks.
    Prefilling,
    /// Emitting one token per tick.
    Decoding,
    /// A stop condition was met.
    Completed,
    /// Terminated by an error.
    Aborted,
    /// Terminated on request.
    Cancelled,
}

impl SequenceStatus {
    /// Holding (or waiting for) resources.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Prefilling | Self::Decoding)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Get the status name as a static string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "Queued",
            Self::Prefilling => "Prefilling",
            Self::Decoding => "Decoding",
            Self::Completed => "Completed",
            Self::Aborted => "Aborted",
            Self::Cancelled => "Cancelled",
        }
    }
}

/// Why a sequence completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// `max_tokens` tokens were emitted.
    MaxTokens,
    /// A stop token was sampled (not emitted).
    StopToken(u32),
    /// The cache chain reached its page limit.
    ContextLimit,
}

/// State of one admitted request.
///
/// # Example
///
/// ```
/// use nano_serve::config::SamplingConfig;
/// use nano_serve::core::sequence::{RequestId, SequenceState, SequenceStatus};
///
/// let mut seq = SequenceState::new(RequestId::new(1), vec![1, 2, 3, 4], SamplingConfig::greedy(8), 0);
/// assert_eq!(seq.status(), SequenceStatus::Queued);
/// assert_eq!(seq.prompt_len(), 4);
///
/// seq.append_token(5);
/// assert_eq!(seq.total_len(), 5);
/// ```
#[derive(Debug, Clone)]
pub struct SequenceState {
    id: RequestId,
    sampling: SamplingConfig,
    prompt_token_ids: Vec<u32>,
    output_token_ids: Vec<u32>,
    /// Borrowed chain; the allocator owns the pages.
    slot: Option<SlotHandle>,
    /// Tokens of the current prefill already written to the cache.
    prefill_cursor: usize,
    /// Tokens the current prefill must ingest: the prompt, or prompt plus
    /// prior output after a preemption.
    prefill_target: usize,
    status: SequenceStatus,
    /// Admission order, the FIFO tie-breaker.
    arrival_order: u64,
    arrival_time: Instant,
    cancel_requested: bool,
    num_preemptions: u32,
    finish_reason: Option<FinishReason>,
    abort_reason: Option<ErrorKind>,
}

impl SequenceState {
    pub fn new(
        id: RequestId,
        prompt_token_ids: Vec<u32>,
        sampling: SamplingConfig,
        arrival_order: u64,
    ) -> Self {
        let prefill_target = prompt_token_ids.len();
        Self {
            id,
            sampling,
            prompt_token_ids,
            output_token_ids: Vec::new(),
            slot: None,
            prefill_cursor: 0,
            prefill_target,
            status: SequenceStatus::Queued,
            arrival_order,
            arrival_time: Instant::now(),
            cancel_requested: false,
            num_preemptions: 0,
            finish_reason: None,
            abort_reason: None,
        }
    }

    // ========== Getters ==========

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn sampling(&self) -> &SamplingConfig {
        &self.sampling
    }

    pub fn prompt_token_ids(&self) -> &[u32] {
        &self.prompt_token_ids
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    pub fn slot(&self) -> Option<SlotHandle> {
        self.slot
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn arrival_order(&self) -> u64 {
        self.arrival_order
    }

    pub fn arrival_time(&self) -> Instant {
        self.arrival_time
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn num_preemptions(&self) -> u32 {
        self.num_preemptions
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finish_reason
    }

    pub fn abort_reason(&self) -> Option<ErrorKind> {
        self.abort_reason
    }

    // ========== Length queries ==========

    pub fn prompt_len(&self) -> usize {
        self.prompt_token_ids.len()
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    /// Prompt plus generated tokens.
    pub fn total_len(&self) -> usize {
        self.prompt_len() + self.output_len()
    }

    pub fn prefill_cursor(&self) -> usize {
        self.prefill_cursor
    }

    pub fn prefill_target(&self) -> usize {
        self.prefill_target
    }

    /// Tokens still to ingest before decoding can start.
    pub fn num_tokens_to_prefill(&self) -> usize {
        self.prefill_target.saturating_sub(self.prefill_cursor)
    }

    pub fn is_prefill_complete(&self) -> bool {
        self.prefill_cursor >= self.prefill_target
    }

    /// Whether another emitted token would still respect `max_tokens`.
    pub fn has_token_budget(&self) -> bool {
        self.output_len() < self.sampling.max_tokens
    }

    // ========== Token operations ==========

    /// Token at logical position `pos` (prompt first, then output).
    pub fn token_at(&self, pos: usize) -> Option<u32> {
        if pos < self.prompt_len() {
            self.prompt_token_ids.get(pos).copied()
        } else {
            self.output_token_ids.get(pos - self.prompt_len()).copied()
        }
    }

    /// Next prefill chunk: start position and tokens, at most `max_chunk` long.
    pub fn next_prefill_chunk(&self, max_chunk: usize) -> (usize, Vec<u32>) {
        let start = self.prefill_cursor;
        let end = (start + max_chunk).min(self.prefill_target);
        let tokens = (start..end).filter_map(|pos| self.token_at(pos)).collect();
        (start, tokens)
    }

    /// Last token, fed back as the next decode input.
    pub fn last_token_id(&self) -> Option<u32> {
        self.output_token_ids
            .last()
            .copied()
            .or_else(|| self.prompt_token_ids.last().copied())
    }

    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    pub fn mark_prefilled(&mut self, num_tokens: usize) {
        self.prefill_cursor = (self.prefill_cursor + num_tokens).min(self.prefill_target);
    }

    /// Whether `token_id` ends generation for this request.
    pub fn is_stop_token(&self, token_id: u32, eos_token_id: Option<u32>) -> bool {
        eos_token_id == Some(token_id) || self.sampling.stop_token_ids.contains(&token_id)
    }

    pub(crate) fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    // ========== State transitions ==========

    /// Queued -> Prefilling, borrowing `slot`.
    pub fn start_prefill(&mut self, slot: SlotHandle) -> Result<()> {
        match self.status {
            SequenceStatus::Queued => {
                self.slot = Some(slot);
                self.status = SequenceStatus::Prefilling;
                Ok(())
            }
            _ => Err(self.invalid_transition("Prefilling")),
        }
    }

    /// Prefilling -> Decoding, once the prompt is fully ingested.
    pub fn start_decode(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Prefilling if self.is_prefill_complete() => {
                self.status = SequenceStatus::Decoding;
                Ok(())
            }
            _ => Err(self.invalid_transition("Decoding")),
        }
    }

    /// Prefilling/Decoding -> Queued after the chain was reclaimed.
    ///
    /// Prompt and generated tokens are ingested again on re-admission.
    pub fn requeue(&mut self) -> Result<()> {
        match self.status {
            SequenceStatus::Prefilling | SequenceStatus::Decoding => {
                self.slot = None;
                self.prefill_cursor = 0;
                self.prefill_target = self.total_len();
                self.num_preemptions += 1;
                self.status = SequenceStatus::Queued;
                Ok(())
            }
            _ => Err(self.invalid_transition("Queued")),
        }
    }

    pub fn complete(&mut self, reason: FinishReason) -> Result<()> {
        match self.status {
            SequenceStatus::Prefilling | SequenceStatus::Decoding => {
                self.status = SequenceStatus::Completed;
                self.finish_reason = Some(reason);
                Ok(())
            }
            _ => Err(self.invalid_transition("Completed")),
        }
    }

    pub fn abort(&mut self, kind: ErrorKind) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition("Aborted"));
        }
        self.status = SequenceStatus::Aborted;
        self.abort_reason = Some(kind);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(self.invalid_transition("Cancelled"));
        }
        self.status = SequenceStatus::Cancelled;
        Ok(())
    }

    /// Detach the borrowed chain so the caller can release it.
    pub fn take_slot(&mut self) -> Option<SlotHandle> {
        self.slot.take()
    }

    fn invalid_transition(&self, to: &'static str) -> Error {
        Error::InvalidStateTransition {
            from: self.status.as_str(),
            to,
        }
    }
}
