//! KV cache allocator.
//!
//! The [`CacheAllocator`] owns a fixed pool of uniform pages and hands out
//! page chains to sequences, the way an operating system hands out physical
//! frames.
//!
//! ## Guarantees
//!
//! - **All-or-nothing**: a failed `allocate`/`extend` leaves the pool untouched.
//! - **Bounded usage**: pages in use never exceed the configured pool size.
//! - **Loud misuse**: freeing a handle twice yields [`Error::DoubleFree`];
//!   freeing a handle that was never issued yields [`Error::InvalidSlotHandle`].
//!
//! ## Example
//!
//! ```
//! use nano_serve::core::allocator::CacheAllocator;
//! use nano_serve::core::sequence::RequestId;
//!
//! let mut allocator = CacheAllocator::new(4, 16);
//!
//! let handle = allocator.allocate(RequestId::new(1), 20).unwrap();
//! assert_eq!(allocator.num_used_pages(), 2);
//!
//! allocator.free(handle).unwrap();
//! assert!(allocator.free(handle).is_err());
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::config::CacheConfig;
use crate::core::page::{compute_num_pages, PageId, SlotChain, SlotHandle};
use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolUsage {
    pub total_pages: usize,
    pub used_pages: usize,
    pub free_pages: usize,
}

impl PoolUsage {
    /// Fraction of the pool in use.
    pub fn utilization(&self) -> f64 {
        if self.total_pages == 0 {
            return 0.0;
        }
        self.used_pages as f64 / self.total_pages as f64
    }
}

/// Process-wide pool counter.
///
/// Written only by the allocator inside the scheduling loop; readable from any
/// thread so admission code can observe capacity pressure.
#[derive(Debug)]
pub struct PoolGauge {
    total: usize,
    used: AtomicUsize,
}

impl PoolGauge {
    fn new(total: usize) -> Self {
        Self {
            total,
            used: AtomicUsize::new(0),
        }
    }

    fn set_used(&self, used: usize) {
        self.used.store(used, Ordering::Release);
    }

    pub fn usage(&self) -> PoolUsage {
        let used = self.used.load(Ordering::Acquire);
        PoolUsage {
            total_pages: self.total,
            used_pages: used,
            free_pages: self.total - used,
        }
    }
}

/// Manages allocation and release of KV cache page chains.
#[derive(Debug)]
pub struct CacheAllocator {
    /// Live chains indexed by handle.
    chains: HashMap<SlotHandle, SlotChain>,
    /// Free page ids, first-fit from the front.
    free_list: VecDeque<PageId>,
    /// Number of tokens per page.
    page_size: usize,
    /// Total number of pages.
    num_pages: usize,
    /// Maximum pages a single chain may hold.
    max_chain_pages: usize,
    /// Next handle to issue; handles below this were issued at some point.
    next_handle: u64,
    gauge: Arc<PoolGauge>,
}

impl CacheAllocator {
    /// Create an allocator over `num_pages` pages of `page_size` tokens.
    pub fn new(num_pages: usize, page_size: usize) -> Self {
        Self {
            chains: HashMap::new(),
            free_list: (0..num_pages).collect(),
            page_size,
            num_pages,
            max_chain_pages: num_pages,
            next_handle: 0,
            gauge: Arc::new(PoolGauge::new(num_pages)),
        }
    }

    /// Create an allocator from the cache configuration.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.num_pages, config.page_size).with_max_chain_pages(config.chain_limit())
    }

    /// Cap the number of pages per chain (clamped to the pool size).
    pub fn with_max_chain_pages(mut self, max_chain_pages: usize) -> Self {
        self.max_chain_pages = max_chain_pages.min(self.num_pages);
        self
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn max_chain_pages(&self) -> usize {
        self.max_chain_pages
    }

    pub fn num_free_pages(&self) -> usize {
        self.free_list.len()
    }

    pub fn num_used_pages(&self) -> usize {
        self.num_pages - self.free_list.len()
    }

    /// Number of live chains.
    pub fn num_chains(&self) -> usize {
        self.chains.len()
    }

    /// Check if `num_pages` pages could be allocated right now.
    pub fn can_allocate(&self, num_pages: usize) -> bool {
        self.free_list.len() >= num_pages
    }

    /// Pages needed for `num_tokens` tokens.
    pub fn pages_for(&self, num_tokens: usize) -> usize {
        compute_num_pages(num_tokens, self.page_size)
    }

    /// Whether a chain of `num_tokens` tokens could ever exist in this pool.
    pub fn fits_chain(&self, num_tokens: usize) -> bool {
        self.pages_for(num_tokens) <= self.max_chain_pages
    }

    /// Shared occupancy counter.
    pub fn gauge(&self) -> Arc<PoolGauge> {
        Arc::clone(&self.gauge)
    }

    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            total_pages: self.num_pages,
            used_pages: self.num_used_pages(),
            free_pages: self.num_free_pages(),
        }
    }

    /// Allocate a chain sized for `requested_tokens`, rounded up to whole pages.
    ///
    /// # Errors
    ///
    /// - [`Error::OversizedRequest`] if the chain could never fit.
    /// - [`Error::CapacityExhausted`] if not enough pages are free right now.
    pub fn allocate(&mut self, owner: RequestId, requested_tokens: usize) -> Result<SlotHandle> {
        let pages_needed = self.pages_for(requested_tokens);
        self.check_chain_limit(pages_needed)?;
        self.check_free(pages_needed)?;

        let handle = SlotHandle::new(self.next_handle);
        self.next_handle += 1;

        let mut chain = SlotChain::new(handle, owner, self.page_size);
        for _ in 0..pages_needed {
            let page = self.pop_free_page()?;
            chain.push_page(page);
        }
        chain.set_reserved(requested_tokens);
        self.chains.insert(handle, chain);
        self.sync_gauge();

        debug!(
            request_id = %owner,
            handle = %handle,
            pages = pages_needed,
            free = self.free_list.len(),
            "allocated slot chain"
        );
        Ok(handle)
    }

    /// Grow a chain's reservation by `additional_tokens`, chaining new pages
    /// when the current ones are full.
    pub fn extend(&mut self, handle: SlotHandle, additional_tokens: usize) -> Result<()> {
        let (reserved, have) = {
            let chain = self.lookup(handle)?;
            (chain.reserved(), chain.num_pages())
        };
        let new_reserved = reserved + additional_tokens;
        let pages_needed = self.pages_for(new_reserved);
        self.check_chain_limit(pages_needed)?;

        let extra = pages_needed.saturating_sub(have);
        self.check_free(extra)?;

        let mut new_pages = Vec::with_capacity(extra);
        for _ in 0..extra {
            new_pages.push(self.pop_free_page()?);
        }

        let chain = self
            .chains
            .get_mut(&handle)
            .ok_or(Error::InvalidSlotHandle(handle))?;
        for page in new_pages {
            chain.push_page(page);
        }
        chain.set_reserved(new_reserved);
        self.sync_gauge();
        Ok(())
    }

    /// Record that `tokens` more tokens were written into the chain.
    pub fn advance(&mut self, handle: SlotHandle, tokens: usize) -> Result<()> {
        let missing = self.missing_handle_error(handle);
        let chain = self.chains.get_mut(&handle).ok_or(missing)?;
        if chain.filled() + tokens > chain.reserved() {
            return Err(Error::SlotOverflow {
                handle,
                filled: chain.filled(),
                additional: tokens,
                reserved: chain.reserved(),
            });
        }
        chain.advance(tokens);
        Ok(())
    }

    /// Return a chain's pages to the pool.
    ///
    /// Must be called exactly once per handle.
    ///
    /// # Returns
    ///
    /// Number of pages released.
    pub fn free(&mut self, handle: SlotHandle) -> Result<usize> {
        let chain = match self.chains.remove(&handle) {
            Some(chain) => chain,
            None => {
                let err = self.missing_handle_error(handle);
                error!(handle = %handle, error = %err, "rejected slot release");
                return Err(err);
            }
        };

        let released = chain.num_pages();
        self.free_list.extend(chain.pages().iter().copied());
        self.sync_gauge();

        debug!(
            request_id = %chain.owner(),
            handle = %handle,
            pages = released,
            free = self.free_list.len(),
            "freed slot chain"
        );
        Ok(released)
    }

    /// Look up a live chain.
    pub fn chain(&self, handle: SlotHandle) -> Result<&SlotChain> {
        self.lookup(handle)
    }

    /// Global cache slots for a token span of a chain.
    pub fn slot_mapping(&self, handle: SlotHandle, start: usize, len: usize) -> Result<Vec<usize>> {
        self.lookup(handle)?.slot_mapping(start, len)
    }

    /// Verify the pool is empty before the engine goes away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::LeakedPages`] if any chain is still live.
    pub fn teardown(&self) -> Result<()> {
        let used = self.num_used_pages();
        if used != 0 {
            error!(used, chains = self.chains.len(), "KV cache pages leaked at teardown");
            return Err(Error::LeakedPages(used));
        }
        debug!(pages = self.num_pages, "KV cache pool torn down clean");
        Ok(())
    }

    fn lookup(&self, handle: SlotHandle) -> Result<&SlotChain> {
        self.chains
            .get(&handle)
            .ok_or_else(|| self.missing_handle_error(handle))
    }

    fn missing_handle_error(&self, handle: SlotHandle) -> Error {
        if handle.as_u64() < self.next_handle {
            Error::DoubleFree(handle)
        } else {
            Error::InvalidSlotHandle(handle)
        }
    }

    fn check_chain_limit(&self, pages_needed: usize) -> Result<()> {
        if pages_needed > self.max_chain_pages {
            return Err(Error::OversizedRequest {
                required_pages: pages_needed,
                max_pages: self.max_chain_pages,
            });
        }
        Ok(())
    }

    fn check_free(&self, pages_needed: usize) -> Result<()> {
        if !self.can_allocate(pages_needed) {
            return Err(Error::CapacityExhausted {
                requested: pages_needed,
                free: self.free_list.len(),
            });
        }
        Ok(())
    }

    fn pop_free_page(&mut self) -> Result<PageId> {
        self.free_list.pop_front().ok_or(Error::CapacityExhausted {
            requested: 1,
            free: 0,
        })
    }

    fn sync_gauge(&self) {
        self.gauge.set_used(self.num_used_pages());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(n: u64) -> RequestId {
        RequestId::new(n)
    }

    #[test]
    fn test_allocator_creation() {
        let allocator = CacheAllocator::new(100, 16);
        assert_eq!(allocator.num_pages(), 100);
        assert_eq!(allocator.page_size(), 16);
        assert_eq!(allocator.num_free_pages(), 100);
        assert_eq!(allocator.num_used_pages(), 0);
        assert_eq!(allocator.max_chain_pages(), 100);
    }

    #[test]
    fn test_allocate_rounds_up_to_pages() {
        let mut allocator = CacheAllocator::new(10, 16);

        let handle = allocator.allocate(rid(1), 33).unwrap();
        let chain = allocator.chain(handle).unwrap();
        assert_eq!(chain.num_pages(), 3);
        assert_eq!(chain.reserved(), 33);
        assert_eq!(chain.filled(), 0);
        assert_eq!(allocator.num_used_pages(), 3);
    }

    #[test]
    fn test_exhaustion_has_no_side_effects() {
        let mut allocator = CacheAllocator::new(4, 16);
        allocator.allocate(rid(1), 48).unwrap();

        let err = allocator.allocate(rid(2), 32).unwrap_err();
        assert!(matches!(
            err,
            Error::CapacityExhausted {
                requested: 2,
                free: 1
            }
        ));
        assert_eq!(allocator.num_free_pages(), 1);
        assert_eq!(allocator.num_chains(), 1);
    }

    #[test]
    fn test_chain_limit_is_oversized() {
        let mut allocator = CacheAllocator::new(8, 16).with_max_chain_pages(3);
        let err = allocator.allocate(rid(1), 50).unwrap_err();
        assert!(matches!(
            err,
            Error::OversizedRequest {
                required_pages: 4,
                max_pages: 3
            }
        ));
        assert_eq!(allocator.num_free_pages(), 8);
    }

    #[test]
    fn test_extend_chains_new_page_at_boundary() {
        let mut allocator = CacheAllocator::new(4, 4);
        let handle = allocator.allocate(rid(1), 3).unwrap();
        assert_eq!(allocator.num_used_pages(), 1);

        allocator.extend(handle, 1).unwrap();
        assert_eq!(allocator.num_used_pages(), 1);

        allocator.extend(handle, 1).unwrap();
        assert_eq!(allocator.num_used_pages(), 2);
        assert_eq!(allocator.chain(handle).unwrap().reserved(), 5);
    }

    #[test]
    fn test_advance_respects_reservation() {
        let mut allocator = CacheAllocator::new(4, 4);
        let handle = allocator.allocate(rid(1), 5).unwrap();

        allocator.advance(handle, 4).unwrap();
        allocator.advance(handle, 1).unwrap();
        assert!(matches!(
            allocator.advance(handle, 1),
            Err(Error::SlotOverflow { .. })
        ));
    }

    #[test]
    fn test_double_free_and_invalid_handle() {
        let mut allocator = CacheAllocator::new(4, 16);
        let handle = allocator.allocate(rid(1), 16).unwrap();

        assert_eq!(allocator.free(handle).unwrap(), 1);
        assert!(matches!(allocator.free(handle), Err(Error::DoubleFree(_))));
        assert!(matches!(
            allocator.free(SlotHandle::new(99)),
            Err(Error::InvalidSlotHandle(_))
        ));
        assert_eq!(allocator.num_free_pages(), 4);
    }

    #[test]
    fn test_freed_pages_are_reusable() {
        let mut allocator = CacheAllocator::new(2, 16);
        let a = allocator.allocate(rid(1), 32).unwrap();
        assert!(allocator.allocate(rid(2), 1).is_err());

        allocator.free(a).unwrap();
        assert!(allocator.allocate(rid(2), 32).is_ok());
    }

    #[test]
    fn test_gauge_tracks_usage() {
        let mut allocator = CacheAllocator::new(8, 16);
        let gauge = allocator.gauge();

        let handle = allocator.allocate(rid(1), 40).unwrap();
        assert_eq!(gauge.usage().used_pages, 3);
        assert_eq!(gauge.usage().free_pages, 5);

        allocator.free(handle).unwrap();
        assert_eq!(gauge.usage().used_pages, 0);
    }

    #[test]
    fn test_teardown_detects_leaks() {
        let mut allocator = CacheAllocator::new(4, 16);
        let handle = allocator.allocate(rid(1), 10).unwrap();
        assert!(matches!(allocator.teardown(), Err(Error::LeakedPages(1))));

        allocator.free(handle).unwrap();
        assert!(allocator.teardown().is_ok());
    }
}
