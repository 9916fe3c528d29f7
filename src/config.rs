//! Configuration types for nano-serve.
//!
//! The core consumes configuration but does not own where it comes from. All
//! structs derive serde so a server can load them from JSON; every field has
//! a default.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::kv_layout::KvCacheLayout;
use crate::core::page::DEFAULT_PAGE_SIZE;
use crate::error::{Error, Result};

/// Engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// KV cache pool sizing.
    pub cache: CacheConfig,
    /// Batch composition policy.
    pub scheduler: SchedulerConfig,
    /// Token id written into padded positions.
    pub pad_token_id: u32,
    /// End-of-sequence token, applied to every request.
    pub eos_token_id: Option<u32>,
}

impl EngineConfig {
    /// Load and validate a configuration from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    /// Parse and validate a configuration from a JSON string.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        self.cache.validate()?;
        self.scheduler.validate()
    }
}

/// KV cache pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Tokens per page.
    pub page_size: usize,
    /// Total pages in the pool.
    pub num_pages: usize,
    /// Upper bound on pages chained to one sequence (`None` = whole pool).
    pub max_chain_pages: Option<usize>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            num_pages: 1024,
            max_chain_pages: None,
        }
    }
}

impl CacheConfig {
    /// Size the pool to fit a device-memory budget.
    pub fn with_memory_budget(mut self, layout: &KvCacheLayout, budget_bytes: usize) -> Self {
        self.num_pages = layout.pages_for_budget(budget_bytes, self.page_size);
        self
    }

    /// Effective per-sequence chain limit.
    pub fn chain_limit(&self) -> usize {
        self.max_chain_pages
            .map_or(self.num_pages, |max| max.min(self.num_pages))
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(Error::Config("page_size must be positive".into()));
        }
        if self.num_pages == 0 {
            return Err(Error::Config("num_pages must be positive".into()));
        }
        if self.max_chain_pages == Some(0) {
            return Err(Error::Config("max_chain_pages must be positive".into()));
        }
        Ok(())
    }
}

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of sequences per accelerator step.
    pub batch_width: usize,
    /// Maximum prompt tokens one sequence ingests per step.
    pub max_prefill_chunk: usize,
    /// Fraction of the batch width reserved for prefill work when decode
    /// work competes for rows.
    pub prefill_fraction: f32,
    /// How many queued requests may attempt allocation per tick.
    pub max_admission_attempts_per_tick: usize,
    /// Allowed token widths for a step; empty means powers of two up to
    /// `max_prefill_chunk`.
    pub token_width_buckets: Vec<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_width: 8,
            max_prefill_chunk: 512,
            prefill_fraction: 0.25,
            max_admission_attempts_per_tick: 1,
            token_width_buckets: Vec::new(),
        }
    }
}

impl SchedulerConfig {
    /// Number of rows prefill candidates are favored for.
    pub fn prefill_quota(&self) -> usize {
        let raw = (self.batch_width as f32 * self.prefill_fraction).ceil() as usize;
        raw.min(self.batch_width)
    }

    /// Resolved token width buckets, ascending.
    pub fn resolved_buckets(&self) -> Vec<usize> {
        if !self.token_width_buckets.is_empty() {
            let mut buckets = self.token_width_buckets.clone();
            buckets.sort_unstable();
            buckets.dedup();
            return buckets;
        }

        let mut buckets = Vec::new();
        let mut width = 1;
        while width < self.max_prefill_chunk {
            buckets.push(width);
            width *= 2;
        }
        buckets.push(self.max_prefill_chunk);
        buckets
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_width == 0 {
            return Err(Error::Config("batch_width must be positive".into()));
        }
        if self.max_prefill_chunk == 0 {
            return Err(Error::Config("max_prefill_chunk must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.prefill_fraction) {
            return Err(Error::Config(format!(
                "prefill_fraction must be within [0, 1], got {}",
                self.prefill_fraction
            )));
        }
        if self.max_admission_attempts_per_tick == 0 {
            return Err(Error::Config(
                "max_admission_attempts_per_tick must be positive".into(),
            ));
        }
        if self.token_width_buckets.contains(&0) {
            return Err(Error::Config("token width buckets must be positive".into()));
        }
        if !self.token_width_buckets.is_empty()
            && self.token_width_buckets.iter().max() < Some(&self.max_prefill_chunk)
        {
            return Err(Error::Config(
                "largest token width bucket must cover max_prefill_chunk".into(),
            ));
        }
        Ok(())
    }
}

/// Sampling configuration, fixed for the lifetime of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for sampling (0.0 = greedy).
    pub temperature: f32,
    /// Top-k sampling (0 = disabled).
    pub top_k: usize,
    /// Top-p (nucleus) sampling (1.0 = disabled).
    pub top_p: f32,
    /// Maximum tokens to generate.
    pub max_tokens: usize,
    /// Tokens that end generation. They are not emitted.
    pub stop_token_ids: Vec<u32>,
    /// RNG seed; `None` draws from entropy.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 0,
            top_p: 1.0,
            max_tokens: 256,
            stop_token_ids: Vec::new(),
            seed: None,
        }
    }
}

impl SamplingConfig {
    /// Greedy decoding for up to `max_tokens` tokens.
    pub fn greedy(max_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            max_tokens,
            ..Self::default()
        }
    }

    /// Add a stop token.
    pub fn with_stop_token(mut self, token_id: u32) -> Self {
        self.stop_token_ids.push(token_id);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(Error::InvalidRequest("max_tokens must be positive".into()));
        }
        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(Error::InvalidRequest(format!(
                "temperature must be non-negative, got {}",
                self.temperature
            )));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(Error::InvalidRequest(format!(
                "top_p must be within (0, 1], got {}",
                self.top_p
            )));
        }
        Ok(())
    }
}
