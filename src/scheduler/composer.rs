//! Batch composition policy.
//!
//! Composition runs in two ordered phases per tick:
//!
//! 1. [`BatchComposer::compose`] picks rows from the active set given a hint
//!    of free pages. Newly picked queued requests are only *candidates*.
//! 2. The scheduler allocates chains for those candidates; only confirmed
//!    rows are passed to [`BatchComposer::build`], which pads them into a
//!    fixed-shape [`BatchDescriptor`].
//!
//! ## Row policy
//!
//! - Prefill work (continuing chunks first by age, then queued admissions) is
//!   favored for up to `prefill_quota` rows.
//! - Decode work fills the remaining rows in admission order.
//! - Rows decode leaves unused are back-filled with more prefill work.
//! - Ties always go to the earliest admission.

use crate::config::SchedulerConfig;
use crate::core::sequence::RequestId;
use crate::error::Result;
use crate::scheduler::batch::{BatchDescriptor, BatchEntry};

/// Readiness of one sequence from the composer's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePhase {
    /// Waiting for a chain of `pages_needed` pages to ingest `prefill_len` tokens.
    Queued {
        pages_needed: usize,
        prefill_len: usize,
    },
    /// Holding a chain with `remaining` prompt tokens left to ingest.
    Prefilling { remaining: usize },
    /// Ready to emit its next token.
    Decoding,
}

/// One schedulable sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub request_id: RequestId,
    pub arrival_order: u64,
    pub phase: CandidatePhase,
}

/// A planned prefill row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedPrefill {
    pub request_id: RequestId,
    /// Tokens to ingest this step.
    pub chunk_len: usize,
    /// Whether a chain must be allocated before the row is confirmed.
    pub needs_allocation: bool,
}

/// Rows picked for one step, before allocation is confirmed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchPlan {
    pub prefill: Vec<PlannedPrefill>,
    pub decode: Vec<RequestId>,
}

impl BatchPlan {
    pub fn num_rows(&self) -> usize {
        self.prefill.len() + self.decode.len()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    /// Queued requests that need a chain, in admission order.
    pub fn admissions(&self) -> impl Iterator<Item = &PlannedPrefill> {
        self.prefill.iter().filter(|p| p.needs_allocation)
    }
}

/// Builds per-step batches.
#[derive(Debug, Clone)]
pub struct BatchComposer {
    width: usize,
    prefill_quota: usize,
    max_prefill_chunk: usize,
    max_admission_attempts: usize,
    buckets: Vec<usize>,
    pad_token_id: u32,
}

impl BatchComposer {
    pub fn new(config: &SchedulerConfig, pad_token_id: u32) -> Self {
        Self {
            width: config.batch_width,
            prefill_quota: config.prefill_quota(),
            max_prefill_chunk: config.max_prefill_chunk,
            max_admission_attempts: config.max_admission_attempts_per_tick,
            buckets: config.resolved_buckets(),
            pad_token_id,
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn prefill_quota(&self) -> usize {
        self.prefill_quota
    }

    pub fn max_prefill_chunk(&self) -> usize {
        self.max_prefill_chunk
    }

    /// Failed admissions tolerated per tick before later arrivals wait.
    pub fn max_admission_attempts(&self) -> usize {
        self.max_admission_attempts
    }

    /// Pick the rows for the next step.
    ///
    /// `free_capacity_hint` is the number of free pages; queued candidates
    /// that could not possibly be allocated are not picked.
    pub fn compose(&self, active_set: &[Candidate], free_capacity_hint: usize) -> BatchPlan {
        let mut prefill: Vec<&Candidate> = active_set
            .iter()
            .filter(|c| c.phase != CandidatePhase::Decoding)
            .collect();
        prefill.sort_by_key(|c| c.arrival_order);

        let mut decode: Vec<&Candidate> = active_set
            .iter()
            .filter(|c| c.phase == CandidatePhase::Decoding)
            .collect();
        decode.sort_by_key(|c| c.arrival_order);

        let mut picker = PrefillPicker {
            pending: prefill.into_iter(),
            free_pages: free_capacity_hint,
            failed_attempts: 0,
            admission_blocked: false,
            max_attempts: self.max_admission_attempts,
            max_chunk: self.max_prefill_chunk,
        };
        let mut plan = BatchPlan::default();

        // Without competing decode work every row may go to prefill.
        let quota = if decode.is_empty() {
            self.width
        } else {
            self.prefill_quota
        };
        while plan.prefill.len() < quota {
            match picker.next() {
                Some(row) => plan.prefill.push(row),
                None => break,
            }
        }

        for candidate in decode {
            if plan.num_rows() >= self.width {
                break;
            }
            plan.decode.push(candidate.request_id);
        }

        while plan.num_rows() < self.width {
            match picker.next() {
                Some(row) => plan.prefill.push(row),
                None => break,
            }
        }

        plan
    }

    /// Smallest configured token width that fits `max_span` tokens.
    pub fn token_width_for(&self, max_span: usize) -> usize {
        self.buckets
            .iter()
            .copied()
            .find(|&bucket| bucket >= max_span)
            .unwrap_or(max_span)
            .max(1)
    }

    /// Pad confirmed rows into a fixed-shape batch.
    pub fn build(&self, step: u64, entries: Vec<BatchEntry>) -> Result<BatchDescriptor> {
        let max_span = entries.iter().map(BatchEntry::span_len).max().unwrap_or(1);
        let token_width = self.token_width_for(max_span);
        BatchDescriptor::new(step, self.width, token_width, self.pad_token_id, entries)
    }
}

/// Walks prefill candidates in admission order against the free-page hint.
///
/// Queued candidates that do not fit count as failed attempts; once
/// `max_attempts` have failed, no later arrival is admitted this tick.
struct PrefillPicker<'a> {
    pending: std::vec::IntoIter<&'a Candidate>,
    free_pages: usize,
    failed_attempts: usize,
    admission_blocked: bool,
    max_attempts: usize,
    max_chunk: usize,
}

impl PrefillPicker<'_> {
    fn next(&mut self) -> Option<PlannedPrefill> {
        for candidate in self.pending.by_ref() {
            match candidate.phase {
                CandidatePhase::Prefilling { remaining } => {
                    return Some(PlannedPrefill {
                        request_id: candidate.request_id,
                        chunk_len: remaining.min(self.max_chunk),
                        needs_allocation: false,
                    });
                }
                CandidatePhase::Queued {
                    pages_needed,
                    prefill_len,
                } => {
                    if self.admission_blocked {
                        continue;
                    }
                    if pages_needed > self.free_pages {
                        self.failed_attempts += 1;
                        if self.failed_attempts >= self.max_attempts {
                            self.admission_blocked = true;
                        }
                        continue;
                    }
                    self.free_pages -= pages_needed;
                    return Some(PlannedPrefill {
                        request_id: candidate.request_id,
                        chunk_len: prefill_len.min(self.max_chunk),
                        needs_allocation: true,
                    });
                }
                CandidatePhase::Decoding => {}
            }
        }
        None
    }
}
