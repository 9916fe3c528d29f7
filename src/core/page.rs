//! Page and slot-chain abstractions for the paged KV cache.
//!
//! The pool is split into uniform pages of `page_size` tokens. A sequence
//! never owns a resizable region; it owns an ordered chain of pages addressed
//! through an opaque [`SlotHandle`]. Because every page is the same size, any
//! freed page can satisfy any pending request for one page.

use std::fmt;

use crate::core::sequence::RequestId;
use crate::error::{Error, Result};

/// Default page size (tokens per page).
pub const DEFAULT_PAGE_SIZE: usize = 16;

/// Physical page index inside the pool.
pub type PageId = usize;

/// Opaque handle to a chain of pages owned by the allocator.
///
/// Handles are never reused, so a stale handle can always be told apart from
/// a live one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotHandle(u64);

impl SlotHandle {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value, for logging.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordered pages backing one sequence, plus its reservation and fill cursor.
///
/// Token at logical position `p` lives in page `pages[p / page_size]` at
/// offset `p % page_size`.
///
/// Invariant: `filled <= reserved <= pages.len() * page_size`.
#[derive(Debug, Clone)]
pub struct SlotChain {
    handle: SlotHandle,
    owner: RequestId,
    pages: Vec<PageId>,
    page_size: usize,
    reserved: usize,
    filled: usize,
}

impl SlotChain {
    pub(crate) fn new(handle: SlotHandle, owner: RequestId, page_size: usize) -> Self {
        Self {
            handle,
            owner,
            pages: Vec::new(),
            page_size,
            reserved: 0,
            filled: 0,
        }
    }

    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    /// Sequence holding this chain.
    pub fn owner(&self) -> RequestId {
        self.owner
    }

    /// Physical pages in logical order.
    pub fn pages(&self) -> &[PageId] {
        &self.pages
    }

    pub fn num_pages(&self) -> usize {
        self.pages.len()
    }

    /// Tokens the chain has been sized for.
    pub fn reserved(&self) -> usize {
        self.reserved
    }

    /// Tokens actually written to the cache.
    pub fn filled(&self) -> usize {
        self.filled
    }

    /// Physical capacity in tokens.
    pub fn capacity(&self) -> usize {
        self.pages.len() * self.page_size
    }

    pub(crate) fn push_page(&mut self, page: PageId) {
        self.pages.push(page);
    }

    pub(crate) fn set_reserved(&mut self, reserved: usize) {
        debug_assert!(reserved <= self.capacity());
        self.reserved = reserved;
    }

    pub(crate) fn advance(&mut self, tokens: usize) {
        self.filled += tokens;
    }

    /// Global cache slot indices for the token span `[start, start + len)`.
    ///
    /// Global slot = `page * page_size + offset`.
    pub fn slot_mapping(&self, start: usize, len: usize) -> Result<Vec<usize>> {
        let mut slots = Vec::with_capacity(len);
        for pos in start..start + len {
            let logical = pos / self.page_size;
            let page = self
                .pages
                .get(logical)
                .copied()
                .ok_or(Error::SlotOverflow {
                    handle: self.handle,
                    filled: start,
                    additional: len,
                    reserved: self.capacity(),
                })?;
            slots.push(page * self.page_size + pos % self.page_size);
        }
        Ok(slots)
    }
}

/// Number of pages needed to hold `num_tokens` tokens.
///
/// # Example
///
/// ```
/// use nano_serve::core::page::compute_num_pages;
///
/// assert_eq!(compute_num_pages(50, 16), 4);
/// assert_eq!(compute_num_pages(32, 16), 2);
/// assert_eq!(compute_num_pages(0, 16), 0);
/// ```
pub fn compute_num_pages(num_tokens: usize, page_size: usize) -> usize {
    num_tokens.div_ceil(page_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_with(pages: &[PageId], page_size: usize) -> SlotChain {
        let mut chain = SlotChain::new(SlotHandle::new(0), RequestId::new(1), page_size);
        for &page in pages {
            chain.push_page(page);
        }
        chain
    }

    #[test]
    fn test_chain_capacity() {
        let mut chain = chain_with(&[5, 12, 3], 16);
        assert_eq!(chain.num_pages(), 3);
        assert_eq!(chain.capacity(), 48);
        assert_eq!(chain.pages(), &[5, 12, 3]);

        chain.set_reserved(40);
        chain.advance(16);
        assert_eq!(chain.reserved(), 40);
        assert_eq!(chain.filled(), 16);
    }

    #[test]
    fn test_slot_mapping_crosses_pages() {
        let chain = chain_with(&[5, 12], 16);

        let slots = chain.slot_mapping(14, 4).unwrap();
        assert_eq!(slots, vec![5 * 16 + 14, 5 * 16 + 15, 12 * 16, 12 * 16 + 1]);
    }

    #[test]
    fn test_slot_mapping_out_of_range() {
        let chain = chain_with(&[0], 16);
        assert!(chain.slot_mapping(10, 10).is_err());
    }

    #[test]
    fn test_compute_num_pages() {
        assert_eq!(compute_num_pages(0, 16), 0);
        assert_eq!(compute_num_pages(1, 16), 1);
        assert_eq!(compute_num_pages(16, 16), 1);
        assert_eq!(compute_num_pages(17, 16), 2);
        assert_eq!(compute_num_pages(50, 16), 4);
        assert_eq!(compute_num_pages(100, 16), 7);
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(SlotHandle::new(7).to_string(), "#7");
    }
}
