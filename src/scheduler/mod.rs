//! Batch scheduling for continuous batching.
//!
//! This module handles:
//! - Fixed-shape batch descriptors with inert padding
//! - Prefill-favoring, FIFO batch composition
//! - The per-tick orchestration loop, including recompute preemption

pub mod batch;
pub mod composer;
pub mod orchestrator;

pub use batch::{BatchDescriptor, BatchEntry, BatchRow, Role, PAD_SLOT};
pub use composer::{BatchComposer, BatchPlan, Candidate, CandidatePhase, PlannedPrefill};
pub use orchestrator::{Scheduler, SchedulerStats, StepReport};
