//! Core bookkeeping for nano-serve.
//!
//! This module contains the fundamental building blocks:
//! - Pages and slot chains for the paged KV cache
//! - CacheAllocator for page allocation and the pool gauge
//! - KvCacheLayout for sizing the pool from a memory budget
//! - SequenceState for request tracking

pub mod allocator;
pub mod kv_layout;
pub mod page;
pub mod sequence;

pub use allocator::{CacheAllocator, PoolGauge, PoolUsage};
pub use kv_layout::KvCacheLayout;
pub use page::{compute_num_pages, PageId, SlotChain, SlotHandle, DEFAULT_PAGE_SIZE};
pub use sequence::{FinishReason, RequestId, SequenceState, SequenceStatus};
