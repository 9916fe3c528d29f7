//! nano-serve: a continuous-batching inference scheduler with a paged KV cache.
//!
//! This crate implements the serving core of an LLM engine:
//! - Paged KV cache allocation with slot chaining
//! - Continuous batching with chunked prefill into fixed-shape batches
//! - Recompute preemption under memory pressure
//! - A single-writer scheduling loop fed by an admission channel
//!
//! The numerical forward pass is abstracted behind [`ForwardKernel`].

pub mod config;
pub mod error;

pub mod core;
pub mod engine;
pub mod scheduler;

pub use config::{CacheConfig, EngineConfig, SamplingConfig, SchedulerConfig};
pub use crate::core::{CacheAllocator, FinishReason, KvCacheLayout, RequestId, SequenceStatus, SlotHandle};
pub use engine::{
    Engine, EngineHandle, ForwardKernel, KernelFailure, KernelOutput, Sampler, StreamEvent,
    SyntheticKernel, TokenStream,
};
pub use error::{Error, ErrorKind, Result};
pub use scheduler::{BatchDescriptor, Role, Scheduler, SchedulerStats, StepReport};
