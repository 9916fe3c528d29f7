//! Deterministic stand-in for a real forward pass.
//!
//! Every real row predicts `last input token + 1 (mod vocab)` with a one-hot
//! logit, so a greedy request with prompt `[.., t]` generates `t+1, t+2, ..`.
//! Used by the offline simulator and the test suite.

use std::thread;
use std::time::Duration;

use candle_core::{Device, Tensor};

use crate::engine::executor::{ForwardKernel, KernelFailure, KernelOutput};
use crate::scheduler::batch::BatchDescriptor;

const HOT_LOGIT: f32 = 10.0;

#[derive(Debug, Clone)]
pub struct SyntheticKernel {
    vocab_size: usize,
    fail_at_step: Option<u64>,
    latency: Option<Duration>,
    device: Device,
    calls: u64,
}

impl SyntheticKernel {
    pub fn new(vocab_size: usize) -> Self {
        Self {
            vocab_size: vocab_size.max(1),
            fail_at_step: None,
            latency: None,
            device: Device::Cpu,
            calls: 0,
        }
    }

    /// Fail the forward pass of scheduler step `step`.
    pub fn fail_at_step(mut self, step: u64) -> Self {
        self.fail_at_step = Some(step);
        self
    }

    /// Sleep for `latency` on every forward pass.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Number of forward passes attempted.
    pub fn calls(&self) -> u64 {
        self.calls
    }

    /// Token the kernel predicts after `token`.
    pub fn successor(&self, token: u32) -> u32 {
        ((token as usize + 1) % self.vocab_size) as u32
    }
}

impl ForwardKernel for SyntheticKernel {
    fn forward(&mut self, batch: &BatchDescriptor) -> Result<KernelOutput, KernelFailure> {
        self.calls += 1;
        if self.fail_at_step == Some(batch.step()) {
            return Err(KernelFailure(format!(
                "injected failure at step {}",
                batch.step()
            )));
        }
        if let Some(latency) = self.latency {
            thread::sleep(latency);
        }

        let mut logits = vec![0.0f32; batch.width() * self.vocab_size];
        let mut written = vec![0usize; batch.width()];
        for (row, entry) in batch.entries() {
            written[row] = entry.span_len();
            if let Some(&last) = entry.tokens.last() {
                logits[row * self.vocab_size + self.successor(last) as usize] = HOT_LOGIT;
            }
        }

        let logits = Tensor::from_vec(logits, (batch.width(), self.vocab_size), &self.device)
            .map_err(|e| KernelFailure(e.to_string()))?;
        Ok(KernelOutput { logits, written })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::page::SlotHandle;
    use crate::core::sequence::RequestId;
    use crate::scheduler::batch::{BatchEntry, Role};

    fn batch(step: u64) -> BatchDescriptor {
        let entry = BatchEntry {
            request_id: RequestId::new(1),
            role: Role::Decode,
            slot: SlotHandle::new(0),
            start_position: 3,
            tokens: vec![7],
            slot_mapping: vec![3],
            samples_token: true,
        };
        BatchDescriptor::new(step, 2, 1, 0, vec![entry]).unwrap()
    }

    #[test]
    fn test_one_hot_successor() {
        let mut kernel = SyntheticKernel::new(16);
        let output = kernel.forward(&batch(1)).unwrap();

        let rows: Vec<Vec<f32>> = output.logits.to_vec2().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][8], HOT_LOGIT);
        assert_eq!(rows[0].iter().filter(|&&v| v != 0.0).count(), 1);
        assert!(rows[1].iter().all(|&v| v == 0.0));
        assert_eq!(output.written, vec![1, 0]);
    }

    #[test]
    fn test_successor_wraps() {
        let kernel = SyntheticKernel::new(8);
        assert_eq!(kernel.successor(7), 0);
        assert_eq!(kernel.successor(3), 4);
    }

    #[test]
    fn test_injected_failure() {
        let mut kernel = SyntheticKernel::new(8).fail_at_step(2);
        assert!(kernel.forward(&batch(1)).is_ok());
        assert!(kernel.forward(&batch(2)).is_err());
        assert_eq!(kernel.calls(), 2);
    }
}
