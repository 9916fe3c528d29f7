//! Fixed-shape batch descriptors.
//!
//! Every accelerator step receives a batch of exactly `width` rows and
//! `token_width` columns. Real rows carry a prefill chunk or a single decode
//! token; the rest are padding rows, which are inert: they have an all-zero
//! attention mask, map to no cache slot, and their logits are never sampled.
//!
//! ```text
//!            token_width = 4
//!          ┌────┬────┬────┬────┐
//!  row 0   │ 17 │ 18 │ 19 │ 20 │  Prefill  req-3  positions 16..20
//!  row 1   │ 42 │ pad│ pad│ pad│  Decode   req-1  position 57
//!  row 2   │ pad│ pad│ pad│ pad│  Padding
//!          └────┴────┴────┴────┘
//! ```

use serde::{Deserialize, Serialize};

use crate::core::page::SlotHandle;
use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

/// Slot-mapping value for positions that must not be written.
pub const PAD_SLOT: i64 = -1;

/// What a real row does this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Prefill,
    Decode,
}

/// One real row of a batch.
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub request_id: RequestId,
    pub role: Role,
    /// Chain the row's KV is written into.
    pub slot: SlotHandle,
    /// Logical position of `tokens[0]` within the sequence.
    pub start_position: usize,
    /// Token span processed this step (unpadded).
    pub tokens: Vec<u32>,
    /// Global cache slot for each token of the span.
    pub slot_mapping: Vec<usize>,
    /// Whether the row's logits produce a new token: always for decode, and
    /// for the prefill chunk that finishes the prompt.
    pub samples_token: bool,
}

impl BatchEntry {
    pub fn span_len(&self) -> usize {
        self.tokens.len()
    }

    /// Tokens of context visible after this step.
    pub fn context_len(&self) -> usize {
        self.start_position + self.tokens.len()
    }
}

/// A batch row: real work or inert padding.
#[derive(Debug, Clone)]
pub enum BatchRow {
    Real(BatchEntry),
    Padding,
}

impl BatchRow {
    pub fn entry(&self) -> Option<&BatchEntry> {
        match self {
            Self::Real(entry) => Some(entry),
            Self::Padding => None,
        }
    }

    pub fn is_padding(&self) -> bool {
        matches!(self, Self::Padding)
    }
}

/// Per-step batch handed to the forward kernel.
#[derive(Debug, Clone)]
pub struct BatchDescriptor {
    step: u64,
    token_width: usize,
    pad_token_id: u32,
    rows: Vec<BatchRow>,
}

impl BatchDescriptor {
    /// Build a `width x token_width` batch, padding unused rows.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the entries do not fit the shape.
    pub fn new(
        step: u64,
        width: usize,
        token_width: usize,
        pad_token_id: u32,
        entries: Vec<BatchEntry>,
    ) -> Result<Self> {
        if entries.len() > width {
            return Err(Error::Config(format!(
                "{} entries exceed batch width {width}",
                entries.len()
            )));
        }
        if let Some(entry) = entries.iter().find(|e| e.span_len() > token_width) {
            return Err(Error::Config(format!(
                "span of {} tokens for {} exceeds token width {token_width}",
                entry.span_len(),
                entry.request_id
            )));
        }

        let mut rows: Vec<BatchRow> = entries.into_iter().map(BatchRow::Real).collect();
        rows.resize_with(width, || BatchRow::Padding);

        Ok(Self {
            step,
            token_width,
            pad_token_id,
            rows,
        })
    }

    /// Scheduler tick this batch belongs to.
    pub fn step(&self) -> u64 {
        self.step
    }

    /// Number of rows, real and padding.
    pub fn width(&self) -> usize {
        self.rows.len()
    }

    pub fn token_width(&self) -> usize {
        self.token_width
    }

    pub fn rows(&self) -> &[BatchRow] {
        &self.rows
    }

    /// Real rows with their row index.
    pub fn entries(&self) -> impl Iterator<Item = (usize, &BatchEntry)> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(idx, row)| row.entry().map(|entry| (idx, entry)))
    }

    pub fn num_real(&self) -> usize {
        self.rows.iter().filter(|row| !row.is_padding()).count()
    }

    pub fn num_padding(&self) -> usize {
        self.width() - self.num_real()
    }

    pub fn is_empty(&self) -> bool {
        self.num_real() == 0
    }

    pub fn contains(&self, request_id: RequestId) -> bool {
        self.entries().any(|(_, e)| e.request_id == request_id)
    }

    /// Real tokens processed by rows of `role`.
    pub fn num_tokens(&self, role: Role) -> usize {
        self.entries()
            .filter(|(_, e)| e.role == role)
            .map(|(_, e)| e.span_len())
            .sum()
    }

    /// `(request, role)` for each real row, in row order.
    pub fn summary(&self) -> Vec<(RequestId, Role)> {
        self.entries().map(|(_, e)| (e.request_id, e.role)).collect()
    }

    /// Row-major `width x token_width` token ids, padded with the pad token.
    pub fn input_ids(&self) -> Vec<u32> {
        self.fill(self.pad_token_id, |entry, col| entry.tokens[col])
    }

    /// Row-major position ids; padding positions are zero.
    pub fn positions(&self) -> Vec<u32> {
        self.fill(0, |entry, col| (entry.start_position + col) as u32)
    }

    /// Row-major mask: 1 for real tokens, 0 for padding.
    pub fn attention_mask(&self) -> Vec<u8> {
        self.fill(0, |_, _| 1)
    }

    /// Row-major global cache slots; [`PAD_SLOT`] where nothing is written.
    pub fn slot_mapping(&self) -> Vec<i64> {
        self.fill(PAD_SLOT, |entry, col| entry.slot_mapping[col] as i64)
    }

    /// Visible context length per row; zero for padding.
    pub fn context_lens(&self) -> Vec<usize> {
        self.rows
            .iter()
            .map(|row| row.entry().map_or(0, BatchEntry::context_len))
            .collect()
    }

    fn fill<T: Copy>(&self, pad: T, value: impl Fn(&BatchEntry, usize) -> T) -> Vec<T> {
        let mut out = Vec::with_capacity(self.width() * self.token_width);
        for row in &self.rows {
            for col in 0..self.token_width {
                match row.entry() {
                    Some(entry) if col < entry.span_len() => out.push(value(entry, col)),
                    _ => out.push(pad),
                }
            }
        }
        out
    }
}
