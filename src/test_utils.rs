//! Test utilities: an instrumented upstream allocator for exercising arena
//! ownership and exhaustion paths.

use core::ptr::NonNull;
use std::sync::atomic::{AtomicIsize, Ordering};

use crate::alloc::{Allocator, GLOBAL};

const UNLIMITED: isize = isize::MAX;

/// Upstream allocator that tracks live blocks and bytes, and can be told to
/// start failing after a fixed number of further allocations. Frees always
/// succeed, so teardown stays clean even in exhaustion tests.
pub struct CountingAllocator {
    live_bytes: AtomicIsize,
    live_allocations: AtomicIsize,
    budget: AtomicIsize,
}

impl Default for CountingAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl CountingAllocator {
    pub fn new() -> Self {
        CountingAllocator {
            live_bytes: AtomicIsize::new(0),
            live_allocations: AtomicIsize::new(0),
            budget: AtomicIsize::new(UNLIMITED),
        }
    }

    /// Bytes currently held by live blocks.
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed).max(0) as usize
    }

    /// Number of live blocks.
    pub fn live_allocations(&self) -> usize {
        self.live_allocations.load(Ordering::Relaxed).max(0) as usize
    }

    /// Allows `n` more allocations or grows, then fails every subsequent
    /// one. Frees are unaffected.
    pub fn fail_after(&self, n: usize) {
        self.budget.store(n as isize, Ordering::Relaxed);
    }

    fn charge(&self) -> bool {
        let mut budget = self.budget.load(Ordering::Relaxed);
        loop {
            if budget == UNLIMITED {
                return true;
            }
            if budget == 0 {
                return false;
            }
            match self.budget.compare_exchange_weak(
                budget,
                budget - 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(b) => budget = b,
            }
        }
    }
}

impl Allocator for CountingAllocator {
    fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        if new_size == 0 {
            let freed = ptr.is_some();
            let result = GLOBAL.reallocate(ptr, old_size, 0);
            if freed {
                self.live_bytes
                    .fetch_sub(old_size as isize, Ordering::Relaxed);
                self.live_allocations.fetch_sub(1, Ordering::Relaxed);
            }
            return result;
        }
        if !self.charge() {
            return None;
        }
        let fresh = ptr.is_none();
        let result = GLOBAL.reallocate(ptr, old_size, new_size)?;
        self.live_bytes
            .fetch_add(new_size as isize - old_size as isize, Ordering::Relaxed);
        if fresh {
            self.live_allocations.fetch_add(1, Ordering::Relaxed);
        }
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_live_blocks() {
        let counting = CountingAllocator::new();
        let a = counting.reallocate(None, 0, 128).unwrap();
        let b = counting.reallocate(None, 0, 64).unwrap();
        assert_eq!(counting.live_bytes(), 192);
        assert_eq!(counting.live_allocations(), 2);
        counting.reallocate(Some(a), 128, 0);
        counting.reallocate(Some(b), 64, 0);
        assert_eq!(counting.live_bytes(), 0);
        assert_eq!(counting.live_allocations(), 0);
    }

    #[test]
    fn budget_exhausts_but_frees_still_work() {
        let counting = CountingAllocator::new();
        counting.fail_after(2);
        let a = counting.reallocate(None, 0, 16).unwrap();
        let b = counting.reallocate(None, 0, 16).unwrap();
        assert!(counting.reallocate(None, 0, 16).is_none());
        counting.reallocate(Some(a), 16, 0);
        counting.reallocate(Some(b), 16, 0);
        assert_eq!(counting.live_allocations(), 0);
    }

    #[test]
    fn grow_charges_budget() {
        let counting = CountingAllocator::new();
        let a = counting.reallocate(None, 0, 16).unwrap();
        counting.fail_after(0);
        assert!(counting.reallocate(Some(a), 16, 32).is_none());
        counting.reallocate(Some(a), 16, 0);
    }
}
