//! Execution and serving.
//!
//! This module contains:
//! - StepExecutor and the ForwardKernel seam
//! - Sampler for token sampling
//! - Engine, EngineHandle and TokenStream for serving requests
//! - SyntheticKernel, a deterministic mock forward pass

pub mod executor;
pub mod sampler;
pub mod serving;
pub mod synthetic;

pub use executor::{ForwardKernel, KernelFailure, KernelOutput, RowOutcome, StepExecutor};
pub use sampler::Sampler;
pub use serving::{Engine, EngineHandle, StreamEvent, TokenStream};
pub use synthetic::SyntheticKernel;
