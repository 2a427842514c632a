//! Raw message storage.
//!
//! A message instance is an opaque, zero-initialized byte region allocated
//! from an arena. The first words hold presence metadata (hasbit words, then
//! one case word per oneof), followed by internal slots for unknown bytes
//! and extensions, followed by field storage at descriptor-computed offsets.
//! [`Object`] is the untyped view all offset access goes through; the
//! reflection layer pairs it with a `MessageDescriptor` to make it safe.

use core::alloc::Layout;

use crate::arena::Arena;
use crate::containers::RawValue;
use crate::descriptor::Kind;

/// Opaque handle to message memory. Never constructed by value; only ever
/// referenced through pointers into arena blocks.
pub struct Object;

impl Object {
    /// Allocates `size` zeroed bytes from `arena`. `None` on exhaustion.
    pub(crate) fn create<'msg>(size: u32, arena: &mut Arena) -> Option<&'msg mut Object> {
        let layout = Layout::from_size_align(size as usize, 8).unwrap();
        let buffer = arena.alloc_raw(layout)?.as_ptr();
        unsafe {
            core::ptr::write_bytes(buffer, 0, size as usize);
            Some(&mut *(buffer as *mut Object))
        }
    }

    pub(crate) const fn ref_at<T>(&self, offset: usize) -> &T {
        unsafe { &*((self as *const Self as *const u8).add(offset) as *const T) }
    }

    pub(crate) fn ref_mut<T>(&mut self, offset: usize) -> &mut T {
        unsafe { &mut *((self as *mut Self as *mut u8).add(offset) as *mut T) }
    }

    pub(crate) fn get<T: Copy>(&self, offset: usize) -> T {
        *self.ref_at::<T>(offset)
    }

    pub(crate) fn put<T>(&mut self, offset: usize, val: T) {
        *self.ref_mut::<T>(offset) = val;
    }

    /// Zeroes `len` bytes at `offset`. Used to wipe a oneof union region so
    /// the next member never sees a stale payload.
    pub(crate) fn zero(&mut self, offset: usize, len: usize) {
        unsafe {
            core::ptr::write_bytes((self as *mut Self as *mut u8).add(offset), 0, len);
        }
    }

    pub(crate) const fn has_bit(&self, idx: u32) -> bool {
        let word = (idx / 32) as usize;
        let bit = idx % 32;
        (*self.ref_at::<u32>(word * 4)) & (1 << bit) != 0
    }

    pub(crate) fn set_has_bit(&mut self, idx: u32) {
        let word = (idx / 32) as usize;
        let bit = idx % 32;
        *self.ref_mut::<u32>(word * 4) |= 1 << bit;
    }

    pub(crate) fn clear_has_bit(&mut self, idx: u32) {
        let word = (idx / 32) as usize;
        let bit = idx % 32;
        *self.ref_mut::<u32>(word * 4) &= !(1 << bit);
    }
}

/// Field slot for a singular submessage: a nullable pointer into some arena
/// whose lifetime covers the owning message's arena (caller-guaranteed).
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageRef(pub(crate) *mut Object);

unsafe impl Send for MessageRef {}
unsafe impl Sync for MessageRef {}

impl MessageRef {
    pub(crate) const fn null() -> Self {
        MessageRef(core::ptr::null_mut())
    }

    pub(crate) const fn is_null(&self) -> bool {
        self.0.is_null()
    }
}

/// Stored extension value: field number, the kind it was stored under, and
/// the kind-erased payload. Kept in a per-message extension list; the
/// descriptor for the number comes from the pool at access time.
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ExtEntry {
    pub number: u32,
    pub kind: Kind,
    pub value: RawValue,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::GLOBAL;

    #[test]
    fn create_zeroes_memory() {
        let mut arena = Arena::new(&GLOBAL);
        let obj = Object::create(64, &mut arena).unwrap();
        for off in (0..64).step_by(8) {
            assert_eq!(obj.get::<u64>(off), 0);
        }
    }

    #[test]
    fn put_then_get() {
        let mut arena = Arena::new(&GLOBAL);
        let obj = Object::create(32, &mut arena).unwrap();
        obj.put::<i64>(8, -42);
        obj.put::<f32>(16, 1.5);
        assert_eq!(obj.get::<i64>(8), -42);
        assert_eq!(obj.get::<f32>(16), 1.5);
    }

    #[test]
    fn has_bits_are_independent() {
        let mut arena = Arena::new(&GLOBAL);
        let obj = Object::create(16, &mut arena).unwrap();
        obj.set_has_bit(0);
        obj.set_has_bit(33);
        assert!(obj.has_bit(0));
        assert!(!obj.has_bit(1));
        assert!(obj.has_bit(33));
        obj.clear_has_bit(0);
        assert!(!obj.has_bit(0));
        assert!(obj.has_bit(33));
    }

    #[test]
    fn zero_wipes_region() {
        let mut arena = Arena::new(&GLOBAL);
        let obj = Object::create(32, &mut arena).unwrap();
        obj.put::<u64>(8, u64::MAX);
        obj.put::<u64>(16, u64::MAX);
        obj.zero(8, 8);
        assert_eq!(obj.get::<u64>(8), 0);
        assert_eq!(obj.get::<u64>(16), u64::MAX);
    }
}
