//! The upstream allocator capability.
//!
//! Everything the arena hands out ultimately comes from a single-operation
//! allocator: [`Allocator::reallocate`] with `realloc` semantics. A
//! `new_size` of zero frees, anything else allocates/grows/shrinks, and
//! failure is an explicit `None`, never a panic or a retry.
//!
//! [`SystemAllocator`] is the process-wide default. Custom allocators plug in
//! by implementing the one method, or by wrapping any
//! [`allocator_api2::alloc::Allocator`] in an [`ApiAllocator`].

use core::alloc::Layout;
use core::ptr::NonNull;

use allocator_api2::alloc::{Allocator as RawAllocator, Global};

/// Alignment guaranteed for every block obtained through [`Allocator`].
///
/// Keeping a single maximal alignment lets the capability stay size-based,
/// like `realloc`. 16 covers every field payload the runtime stores.
pub const MAX_ALIGN: usize = 16;

/// A `realloc`-shaped memory provider.
///
/// Contract:
/// - `new_size == 0` frees `ptr` unconditionally and returns `None`.
/// - otherwise returns the (possibly relocated) block of `new_size` bytes,
///   or `None` on failure.
/// - when `ptr` is `Some`, `old_size` must be the size it was allocated
///   with; implementations may bucket by it but must not require more.
/// - returned blocks are aligned to [`MAX_ALIGN`].
///
/// No synchronization is implied; callers serialize access themselves.
pub trait Allocator {
    fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>>;
}

fn layout_for(size: usize) -> Layout {
    Layout::from_size_align(size, MAX_ALIGN).unwrap()
}

fn realloc_with<A: RawAllocator + ?Sized>(
    alloc: &A,
    ptr: Option<NonNull<u8>>,
    old_size: usize,
    new_size: usize,
) -> Option<NonNull<u8>> {
    match (ptr, new_size) {
        (None, 0) => None,
        (Some(p), 0) => {
            unsafe { alloc.deallocate(p, layout_for(old_size)) };
            None
        }
        (None, n) => alloc.allocate(layout_for(n)).ok().map(NonNull::cast),
        (Some(p), n) if n >= old_size => unsafe {
            alloc
                .grow(p, layout_for(old_size), layout_for(n))
                .ok()
                .map(NonNull::cast)
        },
        (Some(p), n) => unsafe {
            alloc
                .shrink(p, layout_for(old_size), layout_for(n))
                .ok()
                .map(NonNull::cast)
        },
    }
}

/// The process-wide default allocator, backed by the global heap.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAllocator;

/// Shared instance of [`SystemAllocator`] for callers that just want memory.
pub static GLOBAL: SystemAllocator = SystemAllocator;

impl Allocator for SystemAllocator {
    fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        realloc_with(&Global, ptr, old_size, new_size)
    }
}

/// Adapter exposing any [`allocator_api2`] allocator through the
/// [`Allocator`] capability.
#[derive(Debug, Default, Clone, Copy)]
pub struct ApiAllocator<A>(pub A);

impl<A: RawAllocator> Allocator for ApiAllocator<A> {
    fn reallocate(
        &self,
        ptr: Option<NonNull<u8>>,
        old_size: usize,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        realloc_with(&self.0, ptr, old_size, new_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_free_roundtrip() {
        let p = GLOBAL.reallocate(None, 0, 64).unwrap();
        assert_eq!(p.as_ptr() as usize % MAX_ALIGN, 0);
        assert!(GLOBAL.reallocate(Some(p), 64, 0).is_none());
    }

    #[test]
    fn grow_preserves_contents() {
        let p = GLOBAL.reallocate(None, 0, 8).unwrap();
        unsafe {
            for i in 0..8 {
                p.as_ptr().add(i).write(i as u8);
            }
        }
        let q = GLOBAL.reallocate(Some(p), 8, 64).unwrap();
        for i in 0..8 {
            assert_eq!(unsafe { q.as_ptr().add(i).read() }, i as u8);
        }
        GLOBAL.reallocate(Some(q), 64, 0);
    }

    #[test]
    fn shrink_keeps_prefix() {
        let p = GLOBAL.reallocate(None, 0, 64).unwrap();
        unsafe { p.as_ptr().write(0xAB) };
        let q = GLOBAL.reallocate(Some(p), 64, 16).unwrap();
        assert_eq!(unsafe { q.as_ptr().read() }, 0xAB);
        GLOBAL.reallocate(Some(q), 16, 0);
    }

    #[test]
    fn free_null_is_noop() {
        assert!(GLOBAL.reallocate(None, 0, 0).is_none());
    }

    #[test]
    fn api_adapter_allocates() {
        let alloc = ApiAllocator(Global);
        let p = alloc.reallocate(None, 0, 32).unwrap();
        alloc.reallocate(Some(p), 32, 0);
    }
}
