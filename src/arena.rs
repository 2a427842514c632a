//! Arena allocation for message objects.
//!
//! An [`Arena`] batches many small allocations into a few large blocks
//! requested from an upstream [`Allocator`], and frees them all at once when
//! the arena is dropped. Parsing or building a single message allocates a
//! large number of short-lived sub-objects that die together, so bump
//! allocation with bulk free beats per-object bookkeeping by a wide margin.
//!
//! The arena is a non-generic type so that code using it does not bloat per
//! allocator; blocks are large and sporadic, so going through a
//! `&dyn Allocator` costs nothing measurable.
//!
//! Two arenas can be [fused](Arena::fuse) into one lifetime group: objects
//! allocated from either stay valid until every member of the group has been
//! dropped. This is how a submessage allocated on one arena can be attached
//! to a message owned by another.

use core::alloc::Layout;
use core::ptr::NonNull;
use std::cell::RefCell;
use std::rc::Rc;

use log::trace;

use crate::alloc::{Allocator, MAX_ALIGN};

/// One block obtained from an upstream allocator.
///
/// `owned` is false for a caller-supplied initial block, which is never
/// returned upstream.
struct Block<'a> {
    ptr: NonNull<u8>,
    cap: usize,
    upstream: &'a dyn Allocator,
    owned: bool,
}

impl Drop for Block<'_> {
    fn drop(&mut self) {
        if self.owned {
            self.upstream.reallocate(Some(self.ptr), self.cap, 0);
        }
    }
}

/// Node in a fusion group. Arenas in one group form a union-find forest;
/// all blocks of the group live at the root. Members hold an `Rc` chain up
/// to the root, so the blocks outlive every member.
struct GroupNode<'a> {
    parent: RefCell<Option<Rc<GroupNode<'a>>>>,
    blocks: RefCell<Vec<Block<'a>>>,
}

impl<'a> GroupNode<'a> {
    fn new() -> Rc<Self> {
        Rc::new(GroupNode {
            parent: RefCell::new(None),
            blocks: RefCell::new(Vec::new()),
        })
    }
}

fn find_root<'a>(node: &Rc<GroupNode<'a>>) -> Rc<GroupNode<'a>> {
    let mut root = Rc::clone(node);
    loop {
        let next = root.parent.borrow().clone();
        match next {
            Some(p) => root = p,
            None => break,
        }
    }
    // Path compression. Intermediate nodes hold no blocks (those moved to
    // the root when the groups merged), so repointing them is safe.
    let mut cur = Rc::clone(node);
    while !Rc::ptr_eq(&cur, &root) {
        let next = cur.parent.borrow().clone().unwrap();
        *cur.parent.borrow_mut() = Some(Rc::clone(&root));
        cur = next;
    }
    root
}

/// Bump-pointer allocator over a chain of fixed blocks.
///
/// Blocks are appended, never relocated, so previously returned pointers
/// stay valid for the lifetime of the arena's fusion group. All memory is
/// released in one pass on drop.
///
/// Not thread-safe: concurrent `alloc_raw`/`fuse` against the same arena is
/// a data race. The type is `!Send`/`!Sync` by construction.
pub struct Arena<'a> {
    upstream: &'a dyn Allocator,
    node: Rc<GroupNode<'a>>,
    cursor: *mut u8,
    end: *mut u8,
    last_block_size: usize,
}

impl<'a> Arena<'a> {
    const MIN_BLOCK: usize = 256;

    /// Creates an empty arena; the first allocation requests a block.
    pub fn new(upstream: &'a dyn Allocator) -> Self {
        Arena {
            upstream,
            node: GroupNode::new(),
            cursor: core::ptr::null_mut(),
            end: core::ptr::null_mut(),
            last_block_size: 0,
        }
    }

    /// Creates an arena that bumps through `initial` before asking the
    /// upstream allocator for anything. The initial block is borrowed, not
    /// owned; it is never passed back upstream.
    pub fn with_initial_block(initial: &'a mut [u8], upstream: &'a dyn Allocator) -> Self {
        let len = initial.len();
        let ptr = initial.as_mut_ptr();
        let arena = Arena {
            upstream,
            node: GroupNode::new(),
            cursor: ptr,
            end: unsafe { ptr.add(len) },
            last_block_size: len,
        };
        if let Some(nn) = NonNull::new(ptr) {
            arena.node.blocks.borrow_mut().push(Block {
                ptr: nn,
                cap: len,
                upstream,
                owned: false,
            });
        }
        arena
    }

    /// Allocates `layout.size()` bytes, bumping the active block's cursor.
    ///
    /// Returns `None` only when the upstream allocator fails. Never moves or
    /// invalidates prior allocations. `layout.align()` must not exceed
    /// [`MAX_ALIGN`].
    pub fn alloc_raw(&mut self, layout: Layout) -> Option<NonNull<u8>> {
        debug_assert!(layout.align() <= MAX_ALIGN, "over-aligned arena request");
        let size = layout.size();
        if size == 0 {
            return NonNull::new(layout.align() as *mut u8);
        }
        let align = layout.align();
        let aligned = (self.cursor as usize).checked_add(align - 1)? & !(align - 1);
        if aligned + size <= self.end as usize {
            self.cursor = (aligned + size) as *mut u8;
            return NonNull::new(aligned as *mut u8);
        }
        self.grow(size)?;
        // Fresh blocks are MAX_ALIGN aligned, which covers `align`.
        let start = self.cursor;
        self.cursor = unsafe { start.add(size) };
        NonNull::new(start)
    }

    /// Appends a block sized by the growth policy and points the cursor into
    /// it. The tail of the previous block is abandoned.
    fn grow(&mut self, min: usize) -> Option<()> {
        let size = min
            .max(self.last_block_size.saturating_mul(2))
            .max(Self::MIN_BLOCK);
        let ptr = self.upstream.reallocate(None, 0, size)?;
        trace!("arena: new block of {size} bytes (requested {min})");
        self.cursor = ptr.as_ptr();
        self.end = unsafe { ptr.as_ptr().add(size) };
        self.last_block_size = size;
        // Blocks belong to the group root so they survive as long as any
        // fused member does.
        find_root(&self.node).blocks.borrow_mut().push(Block {
            ptr,
            cap: size,
            upstream: self.upstream,
            owned: true,
        });
        Some(())
    }

    /// Merges this arena's lifetime group with `other`'s.
    ///
    /// Fusing is commutative and transitive: after `a.fuse(&b)` and
    /// `b.fuse(&c)`, memory allocated from any of the three stays valid
    /// until all three arenas are dropped. Fusing arenas that already share
    /// a group is a no-op. Each arena keeps allocating from its own cursor.
    pub fn fuse(&self, other: &Arena<'a>) {
        let ra = find_root(&self.node);
        let rb = find_root(&other.node);
        if Rc::ptr_eq(&ra, &rb) {
            return;
        }
        ra.blocks.borrow_mut().append(&mut rb.blocks.borrow_mut());
        *rb.parent.borrow_mut() = Some(ra);
    }

    /// Total bytes held by this arena's fusion group, counting full block
    /// capacities rather than bytes handed out.
    pub fn bytes_allocated(&self) -> usize {
        find_root(&self.node)
            .blocks
            .borrow()
            .iter()
            .map(|b| b.cap)
            .sum()
    }
}

impl core::fmt::Debug for Arena<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Arena")
            .field("bytes_allocated", &self.bytes_allocated())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::GLOBAL;
    use crate::test_utils::CountingAllocator;
    use proptest::prelude::*;

    fn layout(size: usize) -> Layout {
        Layout::from_size_align(size, 8).unwrap()
    }

    #[test]
    fn bulk_free_releases_everything() {
        let counting = CountingAllocator::new();
        {
            let mut arena = Arena::new(&counting);
            for i in 1..100usize {
                arena.alloc_raw(layout(i * 8)).unwrap();
            }
            assert!(counting.live_bytes() > 0);
        }
        assert_eq!(counting.live_bytes(), 0);
        assert_eq!(counting.live_allocations(), 0);
    }

    #[test]
    fn pointers_stable_across_block_boundary() {
        let mut arena = Arena::new(&GLOBAL);
        let mut ptrs = Vec::new();
        for i in 0..64 {
            let p = arena.alloc_raw(layout(128)).unwrap();
            unsafe { core::ptr::write_bytes(p.as_ptr(), i as u8, 128) };
            ptrs.push(p);
        }
        // Crossing several block boundaries must not perturb earlier data.
        for (i, p) in ptrs.iter().enumerate() {
            for off in 0..128 {
                assert_eq!(unsafe { p.as_ptr().add(off).read() }, i as u8);
            }
        }
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut arena = Arena::new(&GLOBAL);
        let mut spans: Vec<(usize, usize)> = Vec::new();
        for size in [8usize, 16, 8, 24, 504, 8, 4096, 8] {
            let p = arena.alloc_raw(layout(size)).unwrap();
            spans.push((p.as_ptr() as usize, size));
        }
        for (i, &(a, al)) in spans.iter().enumerate() {
            for &(b, bl) in &spans[i + 1..] {
                assert!(a + al <= b || b + bl <= a, "overlapping allocations");
            }
        }
    }

    #[test]
    fn initial_block_used_before_upstream() {
        let counting = CountingAllocator::new();
        let mut buf = [0u8; 1024];
        {
            let mut arena = Arena::with_initial_block(&mut buf, &counting);
            arena.alloc_raw(layout(256)).unwrap();
            assert_eq!(counting.live_bytes(), 0);
            arena.alloc_raw(layout(2048)).unwrap();
            assert!(counting.live_bytes() >= 2048);
        }
        assert_eq!(counting.live_bytes(), 0);
    }

    #[test]
    fn alloc_fails_when_upstream_fails() {
        let counting = CountingAllocator::new();
        counting.fail_after(1);
        let mut arena = Arena::new(&counting);
        assert!(arena.alloc_raw(layout(64)).is_some());
        assert!(arena.alloc_raw(layout(1 << 20)).is_none());
        // The arena stays usable for requests that still fit.
        assert!(arena.alloc_raw(layout(8)).is_some());
    }

    #[test]
    fn fuse_extends_lifetime() {
        let counting = CountingAllocator::new();
        let mut a = Arena::new(&counting);
        let b = Arena::new(&counting);
        let p = a.alloc_raw(layout(64)).unwrap();
        unsafe { p.as_ptr().write(0x5A) };
        a.fuse(&b);
        drop(a);
        // `b` keeps the fused group alive, so `p` still points at live data.
        assert_eq!(unsafe { p.as_ptr().read() }, 0x5A);
        assert!(counting.live_bytes() > 0);
        drop(b);
        assert_eq!(counting.live_bytes(), 0);
    }

    #[test]
    fn fuse_is_transitive() {
        let counting = CountingAllocator::new();
        let mut a = Arena::new(&counting);
        let b = Arena::new(&counting);
        let c = Arena::new(&counting);
        let p = a.alloc_raw(layout(32)).unwrap();
        unsafe { p.as_ptr().write(7) };
        a.fuse(&b);
        b.fuse(&c);
        drop(a);
        drop(b);
        assert_eq!(unsafe { p.as_ptr().read() }, 7);
        drop(c);
        assert_eq!(counting.live_bytes(), 0);
    }

    #[test]
    fn fuse_same_group_is_noop() {
        let counting = CountingAllocator::new();
        let mut a = Arena::new(&counting);
        let b = Arena::new(&counting);
        a.fuse(&b);
        a.fuse(&b);
        b.fuse(&a);
        a.alloc_raw(layout(16)).unwrap();
        drop(a);
        drop(b);
        assert_eq!(counting.live_bytes(), 0);
    }

    #[test]
    fn bytes_allocated_counts_group() {
        let counting = CountingAllocator::new();
        let mut a = Arena::new(&counting);
        let mut b = Arena::new(&counting);
        a.alloc_raw(layout(100)).unwrap();
        b.alloc_raw(layout(100)).unwrap();
        let total = a.bytes_allocated() + b.bytes_allocated();
        a.fuse(&b);
        assert_eq!(a.bytes_allocated(), total);
        assert_eq!(b.bytes_allocated(), total);
    }

    proptest! {
        #[test]
        fn prop_no_overlap_and_stable(sizes in prop::collection::vec(1usize..512, 1..64)) {
            let counting = CountingAllocator::new();
            {
                let mut arena = Arena::new(&counting);
                let mut spans = Vec::new();
                for (i, &s) in sizes.iter().enumerate() {
                    let sz = s.next_multiple_of(8);
                    let p = arena.alloc_raw(layout(sz)).unwrap();
                    unsafe { core::ptr::write_bytes(p.as_ptr(), i as u8, sz) };
                    spans.push((p.as_ptr() as usize, sz, i as u8));
                }
                for (i, &(a, al, tag)) in spans.iter().enumerate() {
                    for &(b, bl, _) in &spans[i + 1..] {
                        prop_assert!(a + al <= b || b + bl <= a);
                    }
                    for off in 0..al {
                        prop_assert_eq!(unsafe { *((a + off) as *const u8) }, tag);
                    }
                }
            }
            prop_assert_eq!(counting.live_bytes(), 0);
        }
    }
}
