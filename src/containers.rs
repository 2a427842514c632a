//! Arena-resident containers for message fields.
//!
//! - [`RepeatedField<T>`]: growable array backing repeated fields
//! - [`String`] / [`Bytes`]: UTF-8 and raw byte payloads
//! - [`MapField`]: flat key/value entry array backing map fields
//! - [`RawValue`]: kind-erased 16-byte payload used by maps and extensions
//!
//! None of these implement `Drop`: their memory belongs to an arena and is
//! reclaimed when the arena's fusion group dies. Every operation that can
//! grow storage takes the arena explicitly and reports failure as `false`
//! (or `None`) instead of panicking, so allocator exhaustion surfaces as a
//! value all the way up.

use core::alloc::Layout;
use core::fmt::Debug;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::arena::Arena;
use crate::descriptor::Kind;

#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct RawVec {
    ptr: *mut u8,
    cap: usize,
}

unsafe impl Send for RawVec {}
unsafe impl Sync for RawVec {}

impl RawVec {
    const fn new() -> Self {
        RawVec {
            ptr: core::ptr::null_mut(),
            cap: 0,
        }
    }

    /// Moves to a larger buffer, copying the live prefix. `new_cap == 0`
    /// means "double" (or 1 from empty). `None` on allocator exhaustion;
    /// the old buffer stays valid in that case.
    #[inline(never)]
    fn grow(mut self, new_cap: usize, layout: Layout, arena: &mut Arena) -> Option<Self> {
        assert!(layout.size() != 0, "capacity overflow");

        let new_cap = if new_cap == 0 {
            if self.cap == 0 { 4 } else { 2 * self.cap }
        } else {
            assert!(new_cap > self.cap);
            new_cap
        };
        let new_layout = Layout::from_size_align(layout.size() * new_cap, layout.align()).unwrap();
        assert!(new_layout.size() <= isize::MAX as usize, "allocation too large");

        let new_ptr = arena.alloc_raw(new_layout)?.as_ptr();
        if self.cap != 0 {
            unsafe { core::ptr::copy_nonoverlapping(self.ptr, new_ptr, layout.size() * self.cap) };
        }
        self.ptr = new_ptr;
        self.cap = new_cap;
        Some(self)
    }

    fn reserve(&mut self, new_cap: usize, layout: Layout, arena: &mut Arena) -> bool {
        if new_cap > self.cap {
            match self.grow(new_cap, layout, arena) {
                Some(buf) => *self = buf,
                None => return false,
            }
        }
        true
    }
}

/// A growable array whose storage lives in an arena.
///
/// The header is 24 bytes and sits inline in message memory; element storage
/// is reallocated out of the arena as the array grows. Old buffers are
/// abandoned to the arena rather than freed.
#[repr(C)]
pub struct RepeatedField<T> {
    buf: RawVec,
    len: usize,
    phantom: PhantomData<T>,
}

impl<T: PartialEq> PartialEq for RepeatedField<T> {
    fn eq(&self, other: &Self) -> bool {
        self.as_ref() == other.as_ref()
    }
}

impl<T: PartialEq> PartialEq<&[T]> for RepeatedField<T> {
    fn eq(&self, other: &&[T]) -> bool {
        self.as_ref() == *other
    }
}

impl<T: Eq> Eq for RepeatedField<T> {}

impl<T> Default for RepeatedField<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Debug> Debug for RepeatedField<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.as_ref().fmt(f)
    }
}

impl<T> RepeatedField<T> {
    const fn ptr(&self) -> *mut T {
        self.buf.ptr as *mut T
    }

    const fn cap(&self) -> usize {
        self.buf.cap
    }

    pub const fn new() -> Self {
        RepeatedField {
            buf: RawVec::new(),
            len: 0,
            phantom: PhantomData,
        }
    }

    pub fn from_slice(slice: &[T], arena: &mut Arena) -> Option<Self>
    where
        T: Copy,
    {
        let mut rf = Self::new();
        if rf.append(slice, arena) { Some(rf) } else { None }
    }

    pub const fn from_static(slice: &'static [T]) -> Self {
        RepeatedField {
            buf: RawVec {
                ptr: slice.as_ptr() as *mut u8,
                cap: slice.len(),
            },
            len: slice.len(),
            phantom: PhantomData,
        }
    }

    pub const fn slice(&self) -> &[T] {
        if self.cap() == 0 {
            &[]
        } else {
            unsafe { core::slice::from_raw_parts(self.ptr(), self.len) }
        }
    }

    pub fn slice_mut(&mut self) -> &mut [T] {
        if self.cap() == 0 {
            &mut []
        } else {
            unsafe { core::slice::from_raw_parts_mut(self.ptr(), self.len) }
        }
    }

    /// Appends `elem`, growing from the arena if full. `false` on allocator
    /// exhaustion; the array is unchanged in that case.
    #[inline]
    pub fn push(&mut self, elem: T, arena: &mut Arena) -> bool {
        let l = self.len;
        if l == self.cap() {
            match self.buf.grow(0, Layout::new::<T>(), arena) {
                Some(buf) => self.buf = buf,
                None => return false,
            }
        }
        unsafe { self.ptr().add(l).write(elem) };
        self.len = l + 1;
        true
    }

    /// Removes and returns the element at `index`, shifting the tail down.
    pub fn remove(&mut self, index: usize) -> T {
        let len = self.len;
        assert!(index < len, "index out of bounds");
        let len = len - 1;
        unsafe {
            let result = core::ptr::read(self.ptr().add(index));
            core::ptr::copy(
                self.ptr().add(index + 1),
                self.ptr().add(index),
                len - index,
            );
            self.len = len;
            result
        }
    }

    /// Drops all elements logically; storage stays with the arena.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn reserve(&mut self, new_cap: usize, arena: &mut Arena) -> bool {
        self.buf.reserve(new_cap, Layout::new::<T>(), arena)
    }

    pub fn assign(&mut self, slice: &[T], arena: &mut Arena) -> bool
    where
        T: Copy,
    {
        self.clear();
        self.append(slice, arena)
    }

    pub fn append(&mut self, slice: &[T], arena: &mut Arena) -> bool
    where
        T: Copy,
    {
        let old_len = self.len;
        if slice.is_empty() {
            return true;
        }
        if !self.reserve(old_len + slice.len(), arena) {
            return false;
        }
        unsafe {
            self.ptr()
                .add(old_len)
                .copy_from_nonoverlapping(slice.as_ptr(), slice.len());
        }
        self.len = old_len + slice.len();
        true
    }
}

impl<T> Deref for RepeatedField<T> {
    type Target = [T];
    fn deref(&self) -> &[T] {
        self.slice()
    }
}

impl<T> DerefMut for RepeatedField<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.slice_mut()
    }
}

pub type Bytes = RepeatedField<u8>;

/// UTF-8 string payload. Same layout as [`Bytes`], same arena discipline.
#[repr(C)]
#[derive(Default, PartialEq, Eq)]
pub struct String(Bytes);

impl core::fmt::Debug for String {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

impl String {
    pub const fn new() -> Self {
        String(RepeatedField::new())
    }

    pub fn from_str(s: &str, arena: &mut Arena) -> Option<Self> {
        RepeatedField::from_slice(s.as_bytes(), arena).map(String)
    }

    pub const fn from_static(s: &'static str) -> Self {
        String(RepeatedField::from_static(s.as_bytes()))
    }

    pub const fn as_str(&self) -> &str {
        // Only ever filled from &str, so the bytes are valid UTF-8.
        unsafe { core::str::from_utf8_unchecked(self.0.slice()) }
    }

    pub fn assign(&mut self, s: &str, arena: &mut Arena) -> bool {
        self.0.assign(s.as_bytes(), arena)
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }
}

impl Deref for String {
    type Target = str;
    fn deref(&self) -> &str {
        self.as_str()
    }
}

/// Kind-erased field payload: 64 value bits for inline scalars, a pointer
/// for arena-resident aux objects (string, bytes, submessage). The owning
/// field descriptor's declared [`Kind`] says which half is meaningful.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct RawValue {
    pub(crate) bits: u64,
    pub(crate) ptr: *mut u8,
}

unsafe impl Send for RawValue {}
unsafe impl Sync for RawValue {}

impl RawValue {
    pub(crate) const fn from_bits(bits: u64) -> Self {
        RawValue {
            bits,
            ptr: core::ptr::null_mut(),
        }
    }

    pub(crate) const fn from_ptr(ptr: *mut u8) -> Self {
        RawValue { bits: 0, ptr }
    }
}

impl Default for RawValue {
    fn default() -> Self {
        RawValue::from_bits(0)
    }
}

/// One key/value pair of a map field.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MapEntry {
    pub(crate) key: RawValue,
    pub(crate) value: RawValue,
}

/// Map field storage: a flat entry array with linear key lookup.
///
/// Maps in a single message are small in practice, and a flat array keeps
/// the whole container arena-resident with no hashing state. At most one
/// entry per key; insert replaces.
#[repr(C)]
#[derive(Default)]
pub struct MapField {
    entries: RepeatedField<MapEntry>,
}

/// Key equality under a declared key kind. Scalar keys compare by their 64
/// value bits; string keys compare contents through their arena pointers.
pub(crate) fn raw_key_eq(key_kind: Kind, a: RawValue, b: RawValue) -> bool {
    match key_kind {
        Kind::String | Kind::Bytes => {
            let sa = unsafe { &*(a.ptr as *const Bytes) };
            let sb = unsafe { &*(b.ptr as *const Bytes) };
            sa.slice() == sb.slice()
        }
        _ => a.bits == b.bits,
    }
}

impl MapField {
    pub const fn new() -> Self {
        MapField {
            entries: RepeatedField::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len
    }

    pub fn is_empty(&self) -> bool {
        self.entries.len == 0
    }

    pub(crate) fn entries(&self) -> &[MapEntry] {
        self.entries.slice()
    }

    pub(crate) fn entries_mut(&mut self) -> &mut [MapEntry] {
        self.entries.slice_mut()
    }

    pub(crate) fn find(&self, key_kind: Kind, key: RawValue) -> Option<&MapEntry> {
        self.entries
            .iter()
            .find(|e| raw_key_eq(key_kind, e.key, key))
    }

    /// Inserts or replaces. `Some(true)` if an existing key was replaced,
    /// `Some(false)` if a new entry was added, `None` on allocator
    /// exhaustion.
    pub(crate) fn insert(
        &mut self,
        key_kind: Kind,
        key: RawValue,
        value: RawValue,
        arena: &mut Arena,
    ) -> Option<bool> {
        if let Some(e) = self
            .entries
            .slice_mut()
            .iter_mut()
            .find(|e| raw_key_eq(key_kind, e.key, key))
        {
            e.value = value;
            return Some(true);
        }
        if self.entries.push(MapEntry { key, value }, arena) {
            Some(false)
        } else {
            None
        }
    }

    /// Removes the entry for `key`, if present.
    pub(crate) fn remove(&mut self, key_kind: Kind, key: RawValue) -> bool {
        let idx = self
            .entries
            .iter()
            .position(|e| raw_key_eq(key_kind, e.key, key));
        match idx {
            Some(i) => {
                self.entries.remove(i);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::GLOBAL;

    #[test]
    fn push_and_read() {
        let mut arena = Arena::new(&GLOBAL);
        let mut rf = RepeatedField::<i32>::new();
        for i in 0..100 {
            assert!(rf.push(i, &mut arena));
        }
        assert_eq!(rf.len(), 100);
        assert_eq!(rf[41], 41);
        rf.clear();
        assert!(rf.is_empty());
    }

    #[test]
    fn assign_replaces_contents() {
        let mut arena = Arena::new(&GLOBAL);
        let mut rf = RepeatedField::<u64>::new();
        assert!(rf.assign(&[1, 2, 3], &mut arena));
        assert!(rf.assign(&[9, 8], &mut arena));
        assert_eq!(&rf[..], &[9, 8]);
    }

    #[test]
    fn remove_shifts_tail() {
        let mut arena = Arena::new(&GLOBAL);
        let mut rf = RepeatedField::<u8>::new();
        rf.append(&[1, 2, 3, 4], &mut arena);
        assert_eq!(rf.remove(1), 2);
        assert_eq!(&rf[..], &[1, 3, 4]);
    }

    #[test]
    fn static_backing() {
        static WORDS: [u32; 3] = [7, 8, 9];
        let rf = RepeatedField::from_static(&WORDS);
        assert_eq!(&rf[..], &[7, 8, 9]);
    }

    #[test]
    fn string_roundtrip() {
        let mut arena = Arena::new(&GLOBAL);
        let mut s = String::from_str("hello", &mut arena).unwrap();
        assert_eq!(s.as_str(), "hello");
        assert!(s.assign("longer replacement text", &mut arena));
        assert_eq!(&*s, "longer replacement text");
        s.clear();
        assert_eq!(s.as_str(), "");
    }

    #[test]
    fn map_insert_replace_remove() {
        let mut arena = Arena::new(&GLOBAL);
        let mut map = MapField::new();
        let k1 = RawValue::from_bits(1);
        let k2 = RawValue::from_bits(2);
        assert_eq!(
            map.insert(Kind::Int32, k1, RawValue::from_bits(10), &mut arena),
            Some(false)
        );
        assert_eq!(
            map.insert(Kind::Int32, k2, RawValue::from_bits(20), &mut arena),
            Some(false)
        );
        assert_eq!(
            map.insert(Kind::Int32, k1, RawValue::from_bits(11), &mut arena),
            Some(true)
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map.find(Kind::Int32, k1).unwrap().value.bits, 11);
        assert!(map.remove(Kind::Int32, k2));
        assert!(!map.remove(Kind::Int32, k2));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn map_string_keys_compare_by_content() {
        let mut arena = Arena::new(&GLOBAL);
        let mut map = MapField::new();

        let make_key = |text: &str, arena: &mut Arena| -> RawValue {
            let s = String::from_str(text, arena).unwrap();
            let slot = arena
                .alloc_raw(Layout::new::<String>())
                .unwrap()
                .cast::<String>();
            unsafe { slot.as_ptr().write(s) };
            RawValue::from_ptr(slot.as_ptr() as *mut u8)
        };

        let ka = make_key("alpha", &mut arena);
        let ka2 = make_key("alpha", &mut arena);
        let kb = make_key("beta", &mut arena);
        map.insert(Kind::String, ka, RawValue::from_bits(1), &mut arena);
        // Distinct allocation, equal contents: replaces rather than adds.
        assert_eq!(
            map.insert(Kind::String, ka2, RawValue::from_bits(2), &mut arena),
            Some(true)
        );
        assert_eq!(
            map.insert(Kind::String, kb, RawValue::from_bits(3), &mut arena),
            Some(false)
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map.find(Kind::String, ka).unwrap().value.bits, 2);
    }

    #[test]
    fn push_fails_cleanly_on_oom() {
        use crate::test_utils::CountingAllocator;
        let counting = CountingAllocator::new();
        counting.fail_after(1);
        let mut arena = Arena::new(&counting);
        let mut rf = RepeatedField::<u64>::new();
        assert!(rf.push(1, &mut arena));
        // Fill far past the first block so the next grow needs upstream.
        let mut ok = true;
        for i in 0..100_000 {
            if !rf.push(i, &mut arena) {
                ok = false;
                break;
            }
        }
        assert!(!ok, "push should eventually fail with a failing upstream");
    }
}
