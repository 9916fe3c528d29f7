//! Step execution against the forward-pass kernel.
//!
//! The kernel is opaque: it receives a fixed-shape [`BatchDescriptor`], writes
//! the KV entries named by the batch's slot mapping into its own cache tensors,
//! and returns one row of next-token logits per batch row.
//!
//! A step is all-or-nothing. The kernel output is validated in full and every
//! sampling row is resolved before anything is handed back, so the scheduler
//! either applies a complete step or none of it.

use std::collections::HashMap;

use candle_core::{IndexOp, Tensor};
use thiserror::Error as ThisError;
use tracing::error;

use crate::config::SamplingConfig;
use crate::core::sequence::RequestId;
use crate::engine::sampler::Sampler;
use crate::error::{Error, Result};
use crate::scheduler::batch::{BatchDescriptor, Role};

/// Opaque hard error raised by the accelerator runtime.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
#[error("{0}")]
pub struct KernelFailure(pub String);

impl From<KernelFailure> for Error {
    fn from(failure: KernelFailure) -> Self {
        Error::KernelFailure(failure.0)
    }
}

/// Result of one forward pass.
#[derive(Debug, Clone)]
pub struct KernelOutput {
    /// Next-token logits, `[width, vocab_size]`. Padding rows are ignored.
    pub logits: Tensor,
    /// Tokens written into the cache per row; zero for padding rows.
    pub written: Vec<usize>,
}

/// The numerical forward pass.
///
/// Implementations own the KV cache tensors and the model weights; the core
/// only tells them which slots to read and write.
pub trait ForwardKernel: Send {
    fn forward(&mut self, batch: &BatchDescriptor) -> std::result::Result<KernelOutput, KernelFailure>;
}

impl<K: ForwardKernel + ?Sized> ForwardKernel for Box<K> {
    fn forward(&mut self, batch: &BatchDescriptor) -> std::result::Result<KernelOutput, KernelFailure> {
        (**self).forward(batch)
    }
}

/// What one real row produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowOutcome {
    pub request_id: RequestId,
    pub role: Role,
    /// Tokens written into the row's chain.
    pub written: usize,
    /// Sampled token, for rows that sample.
    pub next_token: Option<u32>,
}

/// Runs batches through a kernel and samples the results.
pub struct StepExecutor<K> {
    kernel: K,
    samplers: HashMap<RequestId, Sampler>,
}

impl<K: ForwardKernel> StepExecutor<K> {
    pub fn new(kernel: K) -> Self {
        Self {
            kernel,
            samplers: HashMap::new(),
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    /// Create the sampler for a newly admitted request.
    pub fn register(&mut self, request_id: RequestId, sampling: &SamplingConfig) {
        self.samplers.insert(request_id, Sampler::new(sampling));
    }

    /// Drop a retired request's sampler.
    pub fn release(&mut self, request_id: RequestId) {
        self.samplers.remove(&request_id);
    }

    pub fn num_registered(&self) -> usize {
        self.samplers.len()
    }

    /// Run one step.
    ///
    /// # Errors
    ///
    /// [`Error::KernelFailure`] if the kernel fails or returns output that
    /// does not match the batch. Nothing has been applied in that case.
    pub fn run(&mut self, batch: &BatchDescriptor) -> Result<Vec<RowOutcome>> {
        let output = self.kernel.forward(batch).map_err(|failure| {
            error!(step = batch.step(), error = %failure, "forward pass failed");
            Error::from(failure)
        })?;
        check_output(batch, &output)?;

        let mut outcomes = Vec::with_capacity(batch.num_real());
        for (row, entry) in batch.entries() {
            let next_token = if entry.samples_token {
                let sampler = self
                    .samplers
                    .get_mut(&entry.request_id)
                    .ok_or(Error::SequenceNotFound(entry.request_id))?;
                Some(sampler.sample(&output.logits.i(row)?)?)
            } else {
                None
            };
            outcomes.push(RowOutcome {
                request_id: entry.request_id,
                role: entry.role,
                written: output.written[row],
                next_token,
            });
        }
        Ok(outcomes)
    }
}

fn check_output(batch: &BatchDescriptor, output: &KernelOutput) -> Result<()> {
    let (rows, _vocab) = output
        .logits
        .dims2()
        .map_err(|e| Error::KernelFailure(format!("malformed logits: {e}")))?;
    if rows != batch.width() {
        return Err(Error::KernelFailure(format!(
            "kernel returned {rows} logit rows for a batch of width {}",
            batch.width()
        )));
    }
    if output.written.len() != batch.width() {
        return Err(Error::KernelFailure(format!(
            "kernel reported writes for {} rows, expected {}",
            output.written.len(),
            batch.width()
        )));
    }
    for (row, (batch_row, &written)) in batch.rows().iter().zip(&output.written).enumerate() {
        let expected = batch_row.entry().map_or(0, |entry| entry.span_len());
        if written != expected {
            return Err(Error::KernelFailure(format!(
                "row {row} wrote {written} tokens, expected {expected}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use candle_core::Device;

    use super::*;
    use crate::core::page::SlotHandle;
    use crate::scheduler::batch::BatchEntry;

    struct FixedKernel {
        logits: Vec<f32>,
        vocab: usize,
        written: Option<Vec<usize>>,
    }

    impl ForwardKernel for FixedKernel {
        fn forward(
            &mut self,
            batch: &BatchDescriptor,
        ) -> std::result::Result<KernelOutput, KernelFailure> {
            let logits = Tensor::from_vec(self.logits.clone(), (batch.width(), self.vocab), &Device::Cpu)
                .map_err(|e| KernelFailure(e.to_string()))?;
            let written = self.written.clone().unwrap_or_else(|| {
                batch
                    .rows()
                    .iter()
                    .map(|row| row.entry().map_or(0, |e| e.span_len()))
                    .collect()
            });
            Ok(KernelOutput { logits, written })
        }
    }

    fn batch() -> BatchDescriptor {
        let entries = vec![
            BatchEntry {
                request_id: RequestId::new(1),
                role: Role::Prefill,
                slot: SlotHandle::new(0),
                start_position: 0,
                tokens: vec![5, 6],
                slot_mapping: vec![0, 1],
                samples_token: false,
            },
            BatchEntry {
                request_id: RequestId::new(2),
                role: Role::Decode,
                slot: SlotHandle::new(1),
                start_position: 4,
                tokens: vec![7],
                slot_mapping: vec![20],
                samples_token: true,
            },
        ];
        BatchDescriptor::new(0, 3, 2, 0, entries).unwrap()
    }

    fn kernel(written: Option<Vec<usize>>) -> FixedKernel {
        FixedKernel {
            logits: vec![
                0.0, 9.0, 0.0, //
                0.0, 0.0, 9.0, //
                9.0, 0.0, 0.0,
            ],
            vocab: 3,
            written,
        }
    }

    #[test]
    fn test_samples_only_sampling_rows() {
        let mut executor = StepExecutor::new(kernel(None));
        executor.register(RequestId::new(1), &SamplingConfig::greedy(4));
        executor.register(RequestId::new(2), &SamplingConfig::greedy(4));

        let outcomes = executor.run(&batch()).unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].next_token, None);
        assert_eq!(outcomes[0].written, 2);
        assert_eq!(outcomes[1].next_token, Some(2));
    }

    #[test]
    fn test_padding_writes_are_rejected() {
        let mut executor = StepExecutor::new(kernel(Some(vec![2, 1, 1])));
        executor.register(RequestId::new(2), &SamplingConfig::greedy(4));
        assert!(matches!(
            executor.run(&batch()),
            Err(Error::KernelFailure(_))
        ));
    }

    #[test]
    fn test_missing_sampler_is_reported() {
        let mut executor = StepExecutor::new(kernel(None));
        assert!(matches!(
            executor.run(&batch()),
            Err(Error::SequenceNotFound(_))
        ));
    }
}
