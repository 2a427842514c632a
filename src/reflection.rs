//! Schema-driven message access.
//!
//! This module provides dynamic access to messages without compile-time
//! knowledge of their schema. A [`DynMessageRef`] pairs raw message memory
//! with its [`MessageDescriptor`]; every read goes through the descriptor's
//! offsets, so the view is safe as long as object and descriptor match.
//!
//! # Key Types
//!
//! - [`DynMessageRef`]: read-only view for inspection
//! - [`DynMessage`]: mutable view for building and modifying
//! - [`Value`]: enum representing any field value
//!
//! Enum fields surface as [`Value::Int32`]; the runtime carries no enum
//! schema and treats enum values as open 32-bit integers.
//!
//! # Misuse is a panic
//!
//! Kind-mismatched writes, presence queries on fields without presence, and
//! out-of-range positional access are caller bugs and panic. Allocator
//! exhaustion is not a bug: every allocating operation reports it as
//! `false`/`None` and leaves the message observably unchanged.

use std::sync::{OnceLock, Weak};

use crate::arena::Arena;
use crate::base::{ExtEntry, MessageRef, Object};
use crate::containers::{Bytes, MapField, RawValue, RepeatedField, String as ArenaString};
use crate::descriptor::{FieldDescriptor, Kind, MessageDescriptor, OneofDescriptor};
use crate::pool::DescriptorPool;

/// Read-only view of a message.
///
/// # Lifetimes
///
/// - `'pool`: lifetime of the descriptor pool the schema lives in
/// - `'msg`: lifetime of the arena-resident message data
#[derive(Clone, Copy)]
pub struct DynMessageRef<'pool, 'msg> {
    pub(crate) object: &'msg Object,
    pub(crate) desc: &'pool MessageDescriptor,
}

/// Mutable view of a message.
///
/// Derefs to [`DynMessageRef`], so all read methods are available.
pub struct DynMessage<'pool, 'msg> {
    pub(crate) object: &'msg mut Object,
    pub(crate) desc: &'pool MessageDescriptor,
}

impl<'pool, 'msg> core::ops::Deref for DynMessage<'pool, 'msg> {
    type Target = DynMessageRef<'pool, 'msg>;

    fn deref(&self) -> &Self::Target {
        // Identical field layout, shared view borrowed from the mutable one.
        unsafe { &*(self as *const DynMessage<'pool, 'msg> as *const DynMessageRef<'pool, 'msg>) }
    }
}

impl core::fmt::Debug for DynMessageRef<'_, '_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut debug_struct = f.debug_struct(self.desc.full_name());
        for field in self.desc.fields() {
            if self.is_set(field) {
                debug_struct.field(field.name(), &self.get(field));
            }
        }
        debug_struct.finish()
    }
}

impl core::fmt::Debug for DynMessage<'_, '_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        self.as_ref().fmt(f)
    }
}

/// Resolves a linked sub-message descriptor without taking a new strong
/// reference. The pool that published the link holds a strong reference to
/// the target for all of `'pool`, so the pointee outlives the result.
fn linked<'pool>(slot: &'pool OnceLock<Weak<MessageDescriptor>>) -> Option<&'pool MessageDescriptor> {
    let weak = slot.get()?;
    Some(unsafe { &*weak.as_ptr() })
}

/// Converts a kind-erased payload back to a typed value. `sub` is the
/// payload's message descriptor and must be `Some` for `Kind::Message`.
unsafe fn raw_to_value<'pool, 'msg>(
    kind: Kind,
    sub: Option<&'pool MessageDescriptor>,
    raw: RawValue,
) -> Value<'pool, 'msg> {
    unsafe {
        match kind {
            Kind::Bool => Value::Bool(raw.bits != 0),
            Kind::Int32 | Kind::Enum => Value::Int32(raw.bits as u32 as i32),
            Kind::Int64 => Value::Int64(raw.bits as i64),
            Kind::UInt32 => Value::UInt32(raw.bits as u32),
            Kind::UInt64 => Value::UInt64(raw.bits),
            Kind::Float => Value::Float(f32::from_bits(raw.bits as u32)),
            Kind::Double => Value::Double(f64::from_bits(raw.bits)),
            Kind::String => Value::String((*(raw.ptr as *const ArenaString)).as_str()),
            Kind::Bytes => Value::Bytes((*(raw.ptr as *const Bytes)).slice()),
            Kind::Message => {
                if raw.ptr.is_null() {
                    Value::Message(None)
                } else {
                    Value::Message(Some(DynMessageRef {
                        object: &*(raw.ptr as *const Object),
                        desc: sub.expect("message payload without linked descriptor"),
                    }))
                }
            }
        }
    }
}

/// Converts a typed value to a kind-erased payload. String and bytes
/// payloads are copied into `arena`; `None` means allocator exhaustion.
/// Panics when the value does not match `kind`.
fn value_to_raw(kind: Kind, value: Value, arena: &mut Arena) -> Option<RawValue> {
    let raw = match (kind, value) {
        (Kind::Bool, Value::Bool(b)) => RawValue::from_bits(b as u64),
        (Kind::Int32 | Kind::Enum, Value::Int32(v)) => RawValue::from_bits(v as u32 as u64),
        (Kind::Int64, Value::Int64(v)) => RawValue::from_bits(v as u64),
        (Kind::UInt32, Value::UInt32(v)) => RawValue::from_bits(v as u64),
        (Kind::UInt64, Value::UInt64(v)) => RawValue::from_bits(v),
        (Kind::Float, Value::Float(v)) => RawValue::from_bits(v.to_bits() as u64),
        (Kind::Double, Value::Double(v)) => RawValue::from_bits(v.to_bits()),
        (Kind::String, Value::String(s)) => {
            let payload = ArenaString::from_str(s, arena)?;
            let slot = arena
                .alloc_raw(core::alloc::Layout::new::<ArenaString>())?
                .cast::<ArenaString>();
            unsafe { slot.as_ptr().write(payload) };
            RawValue::from_ptr(slot.as_ptr() as *mut u8)
        }
        (Kind::Bytes, Value::Bytes(b)) => {
            let payload = Bytes::from_slice(b, arena)?;
            let slot = arena
                .alloc_raw(core::alloc::Layout::new::<Bytes>())?
                .cast::<Bytes>();
            unsafe { slot.as_ptr().write(payload) };
            RawValue::from_ptr(slot.as_ptr() as *mut u8)
        }
        (Kind::Message, Value::Message(Some(m))) => {
            RawValue::from_ptr(m.object as *const Object as *mut u8)
        }
        (k, v) => panic!("value {v:?} does not match kind {k:?}"),
    };
    Some(raw)
}

impl<'pool, 'msg> DynMessageRef<'pool, 'msg> {
    pub fn descriptor(&self) -> &'pool MessageDescriptor {
        self.desc
    }

    fn unknown_slot(&self) -> &'msg Bytes {
        self.object.ref_at(self.desc.unknown_offset as usize)
    }

    fn ext_slot(&self) -> &'msg RepeatedField<ExtEntry> {
        self.object.ref_at(self.desc.ext_offset as usize)
    }

    fn sub_descriptor(&self, field: &'pool FieldDescriptor) -> &'pool MessageDescriptor {
        linked(&field.message_type).expect("message field without linked descriptor")
    }

    /// Whether `field` holds an observable value: set presence for fields
    /// that track it, a non-default payload for implicit scalars, and
    /// non-emptiness for containers.
    pub fn is_set(&self, field: &FieldDescriptor) -> bool {
        if field.is_extension() {
            return self
                .ext_slot()
                .iter()
                .any(|e| e.number == field.number() && e.kind == field.kind());
        }
        let off = field.offset as usize;
        if field.is_map() {
            return !self.object.ref_at::<MapField>(off).is_empty();
        }
        if field.is_repeated() {
            return !self.object.ref_at::<RepeatedField<u64>>(off).is_empty();
        }
        if let Some(oi) = field.containing_oneof_index() {
            let case_offset = self.desc.oneof(oi as usize).case_offset;
            return self.object.get::<u32>(case_offset as usize) == field.number();
        }
        match field.kind() {
            Kind::Message => !self.object.ref_at::<MessageRef>(off).is_null(),
            Kind::String | Kind::Bytes if field.hasbit.is_none() => {
                !self.object.ref_at::<Bytes>(off).is_empty()
            }
            _ => match field.hasbit {
                Some(hb) => self.object.has_bit(hb),
                // Implicit presence: any nonzero payload bit counts.
                None => match field.kind().scalar_width().unwrap() {
                    1 => self.object.get::<u8>(off) != 0,
                    4 => self.object.get::<u32>(off) != 0,
                    _ => self.object.get::<u64>(off) != 0,
                },
            },
        }
    }

    /// Explicit presence query. Panics when `field` does not track presence
    /// (repeated, map, or implicit scalar); use [`Self::is_set`] for those.
    pub fn has(&self, field: &FieldDescriptor) -> bool {
        assert!(
            field.has_presence() && !field.is_extension(),
            "field `{}` does not track presence",
            field.name()
        );
        self.is_set(field)
    }

    /// The set value of `field`, or `None` when it is unset (or, for
    /// containers, empty). Extension descriptors read their stored entry.
    pub fn get_field(&self, field: &'pool FieldDescriptor) -> Option<Value<'pool, 'msg>> {
        if field.is_extension() {
            return self.get_extension(field);
        }
        if self.is_set(field) {
            Some(self.get(field))
        } else {
            None
        }
    }

    /// The value of `field`, falling back to the kind's default when unset:
    /// zero for scalars, empty for strings and containers, absent for a
    /// sub-message.
    pub fn get(&self, field: &'pool FieldDescriptor) -> Value<'pool, 'msg> {
        assert!(!field.is_extension(), "extensions are read with get_extension");
        let off = field.offset as usize;
        if field.is_map() {
            return Value::Map(DynMapRef {
                raw: self.object.ref_at(off),
                field,
            });
        }
        if field.is_repeated() {
            return match field.kind() {
                Kind::Bool => Value::RepeatedBool(self.object.ref_at::<RepeatedField<bool>>(off)),
                Kind::Int32 | Kind::Enum => {
                    Value::RepeatedInt32(self.object.ref_at::<RepeatedField<i32>>(off))
                }
                Kind::Int64 => Value::RepeatedInt64(self.object.ref_at::<RepeatedField<i64>>(off)),
                Kind::UInt32 => {
                    Value::RepeatedUInt32(self.object.ref_at::<RepeatedField<u32>>(off))
                }
                Kind::UInt64 => {
                    Value::RepeatedUInt64(self.object.ref_at::<RepeatedField<u64>>(off))
                }
                Kind::Float => Value::RepeatedFloat(self.object.ref_at::<RepeatedField<f32>>(off)),
                Kind::Double => {
                    Value::RepeatedDouble(self.object.ref_at::<RepeatedField<f64>>(off))
                }
                Kind::String => {
                    Value::RepeatedString(self.object.ref_at::<RepeatedField<ArenaString>>(off))
                }
                Kind::Bytes => {
                    Value::RepeatedBytes(self.object.ref_at::<RepeatedField<Bytes>>(off))
                }
                Kind::Message => Value::RepeatedMessage(DynMessageArray {
                    objects: self.object.ref_at::<RepeatedField<MessageRef>>(off),
                    desc: self.sub_descriptor(field),
                }),
            };
        }
        // A oneof member only exposes its payload while it is the active
        // member; the union region may hold a sibling's bits otherwise.
        if !self.is_set(field) {
            return default_value(field.kind());
        }
        match field.kind() {
            Kind::Bool => Value::Bool(self.object.get::<u8>(off) != 0),
            Kind::Int32 | Kind::Enum => Value::Int32(self.object.get(off)),
            Kind::Int64 => Value::Int64(self.object.get(off)),
            Kind::UInt32 => Value::UInt32(self.object.get(off)),
            Kind::UInt64 => Value::UInt64(self.object.get(off)),
            Kind::Float => Value::Float(self.object.get(off)),
            Kind::Double => Value::Double(self.object.get(off)),
            Kind::String => Value::String(self.object.ref_at::<ArenaString>(off).as_str()),
            Kind::Bytes => Value::Bytes(self.object.ref_at::<Bytes>(off).slice()),
            Kind::Message => {
                let r = self.object.get::<MessageRef>(off);
                Value::Message(Some(DynMessageRef {
                    object: unsafe { &*r.0 },
                    desc: self.sub_descriptor(field),
                }))
            }
        }
    }

    /// The active member of `oneof`, or `None` when no member is set.
    pub fn which_oneof(&self, oneof: &OneofDescriptor) -> Option<&'pool FieldDescriptor> {
        let case = self.object.get::<u32>(oneof.case_offset as usize);
        if case == 0 {
            return None;
        }
        self.desc.field_by_number(case)
    }

    /// Advances `iter` to the next set field in ascending field-number
    /// order, declared fields and registered extensions merged into one
    /// stream. Extension entries whose stored kind disagrees with the
    /// registered descriptor, or whose number is unregistered, are skipped.
    /// Without a pool, only declared fields are yielded.
    pub fn next(
        &self,
        pool: Option<&'pool DescriptorPool>,
        iter: &mut FieldIter,
    ) -> Option<(&'pool FieldDescriptor, Value<'pool, 'msg>)> {
        loop {
            let mut declared = None;
            let mut p = iter.pos;
            while let Some(field) = self.desc.field_at_number_rank(p) {
                if self.is_set(field) {
                    declared = Some((p, field));
                    break;
                }
                p += 1;
            }

            let mut ext_number = None;
            if pool.is_some() {
                for e in self.ext_slot().iter() {
                    if e.number > iter.ext_mark && ext_number.is_none_or(|n| e.number < n) {
                        ext_number = Some(e.number);
                    }
                }
            }

            match (declared, ext_number) {
                (Some((p, field)), ext) if ext.is_none_or(|n| field.number() <= n) => {
                    iter.pos = p + 1;
                    return Some((field, self.get(field)));
                }
                (_, Some(number)) => {
                    iter.ext_mark = number;
                    let registered = pool
                        .and_then(|p| p.find_extension(self.desc.full_name(), number));
                    let Some(fd) = registered else {
                        continue;
                    };
                    let entry = self
                        .ext_slot()
                        .iter()
                        .find(|e| e.number == number)
                        .copied()
                        .unwrap();
                    if entry.kind != fd.kind() {
                        continue;
                    }
                    let sub = (fd.kind() == Kind::Message)
                        .then(|| linked(&fd.message_type))
                        .flatten();
                    return Some((fd, unsafe { raw_to_value(entry.kind, sub, entry.value) }));
                }
                (None, None) => return None,
                _ => unreachable!(),
            }
        }
    }

    /// The value stored for extension `field`, or `None` when absent or
    /// stored under a different kind than the descriptor declares.
    pub fn get_extension(&self, field: &'pool FieldDescriptor) -> Option<Value<'pool, 'msg>> {
        assert!(field.is_extension(), "field `{}` is not an extension", field.name());
        let entry = self
            .ext_slot()
            .iter()
            .find(|e| e.number == field.number() && e.kind == field.kind())?;
        let sub = (field.kind() == Kind::Message)
            .then(|| linked(&field.message_type))
            .flatten();
        Some(unsafe { raw_to_value(entry.kind, sub, entry.value) })
    }

    /// Raw bytes of fields that did not match the schema, in arrival order.
    pub fn unknown(&self) -> &'msg [u8] {
        self.unknown_slot().slice()
    }
}

fn default_value<'pool, 'msg>(kind: Kind) -> Value<'pool, 'msg> {
    match kind {
        Kind::Bool => Value::Bool(false),
        Kind::Int32 | Kind::Enum => Value::Int32(0),
        Kind::Int64 => Value::Int64(0),
        Kind::UInt32 => Value::UInt32(0),
        Kind::UInt64 => Value::UInt64(0),
        Kind::Float => Value::Float(0.0),
        Kind::Double => Value::Double(0.0),
        Kind::String => Value::String(""),
        Kind::Bytes => Value::Bytes(&[]),
        Kind::Message => Value::Message(None),
    }
}

enum Staged {
    W8(u8),
    W32(u32),
    W64(u64),
    Str(ArenaString),
    Byt(Bytes),
    Msg(MessageRef),
}

impl<'pool, 'msg> DynMessage<'pool, 'msg> {
    pub(crate) fn new(object: &'msg mut Object, desc: &'pool MessageDescriptor) -> Self {
        DynMessage { object, desc }
    }

    pub fn as_ref<'a>(&'a self) -> DynMessageRef<'pool, 'a> {
        DynMessageRef {
            object: self.object,
            desc: self.desc,
        }
    }

    fn unknown_slot_mut(&mut self) -> &mut Bytes {
        self.object.ref_mut(self.desc.unknown_offset as usize)
    }

    fn ext_slot_mut(&mut self) -> &mut RepeatedField<ExtEntry> {
        self.object.ref_mut(self.desc.ext_offset as usize)
    }

    /// Stores `value` into a singular field. String and bytes payloads are
    /// copied into `arena`. For a oneof member, the union is wiped and the
    /// member becomes active. Returns `false` on allocator exhaustion, with
    /// the message unchanged. Panics on a kind mismatch or a non-singular
    /// field.
    pub fn set_field(&mut self, field: &FieldDescriptor, value: Value, arena: &mut Arena) -> bool {
        assert!(
            !field.is_repeated() && !field.is_map(),
            "field `{}` is not singular; use mutable()",
            field.name()
        );
        assert!(!field.is_extension(), "extensions are set with set_extension");

        // Stage anything that can fail before touching message state.
        let staged = match (field.kind(), value) {
            (Kind::Bool, Value::Bool(b)) => Staged::W8(b as u8),
            (Kind::Int32 | Kind::Enum, Value::Int32(v)) => Staged::W32(v as u32),
            (Kind::UInt32, Value::UInt32(v)) => Staged::W32(v),
            (Kind::Float, Value::Float(v)) => Staged::W32(v.to_bits()),
            (Kind::Int64, Value::Int64(v)) => Staged::W64(v as u64),
            (Kind::UInt64, Value::UInt64(v)) => Staged::W64(v),
            (Kind::Double, Value::Double(v)) => Staged::W64(v.to_bits()),
            (Kind::String, Value::String(s)) => match ArenaString::from_str(s, arena) {
                Some(s) => Staged::Str(s),
                None => return false,
            },
            (Kind::Bytes, Value::Bytes(b)) => match Bytes::from_slice(b, arena) {
                Some(b) => Staged::Byt(b),
                None => return false,
            },
            (Kind::Message, Value::Message(Some(m))) => {
                Staged::Msg(MessageRef(m.object as *const Object as *mut Object))
            }
            (k, v) => panic!("cannot store {v:?} in field `{}` of kind {k:?}", field.name()),
        };

        let off = field.offset as usize;
        if let Some(oi) = field.containing_oneof_index() {
            let oneof = self.desc.oneof(oi as usize);
            self.object.zero(off, oneof.union_size as usize);
            self.object
                .put::<u32>(oneof.case_offset as usize, field.number());
        } else if let Some(hb) = field.hasbit {
            self.object.set_has_bit(hb);
        }
        match staged {
            Staged::W8(v) => self.object.put(off, v),
            Staged::W32(v) => self.object.put(off, v),
            Staged::W64(v) => self.object.put(off, v),
            Staged::Str(v) => *self.object.ref_mut::<ArenaString>(off) = v,
            Staged::Byt(v) => *self.object.ref_mut::<Bytes>(off) = v,
            Staged::Msg(v) => self.object.put(off, v),
        }
        true
    }

    /// Resets `field` to unset: presence is dropped and the payload reads
    /// as the kind's default afterwards. A oneof member only clears when it
    /// is the active member. Container storage stays with the arena.
    pub fn clear_field(&mut self, field: &FieldDescriptor) {
        assert!(!field.is_extension(), "extensions are cleared with clear_extension");
        let off = field.offset as usize;
        if field.is_map() {
            self.object.ref_mut::<MapField>(off).clear();
            return;
        }
        if field.is_repeated() {
            self.object.ref_mut::<RepeatedField<u64>>(off).clear();
            return;
        }
        if let Some(oi) = field.containing_oneof_index() {
            let oneof = self.desc.oneof(oi as usize);
            let case_offset = oneof.case_offset as usize;
            if self.object.get::<u32>(case_offset) == field.number() {
                self.object.zero(off, oneof.union_size as usize);
                self.object.put::<u32>(case_offset, 0);
            }
            return;
        }
        if let Some(hb) = field.hasbit {
            self.object.clear_has_bit(hb);
        }
        match field.kind() {
            Kind::Message => self.object.put(off, MessageRef::null()),
            Kind::String | Kind::Bytes => self.object.ref_mut::<Bytes>(off).clear(),
            k => self.object.zero(off, k.scalar_width().unwrap()),
        }
    }

    /// Resets every field, the unknown buffer, and all extensions. Arena
    /// storage the message referenced is abandoned, not freed.
    pub fn clear(&mut self) {
        unsafe {
            core::ptr::write_bytes(
                self.object as *mut Object as *mut u8,
                0,
                self.desc.instance_size() as usize,
            );
        }
    }

    /// Mutable access to a container or sub-message field. A null singular
    /// sub-message is allocated on first access (wiping and claiming the
    /// oneof union when the field is a member); without an arena the call
    /// is a probe and returns `None` instead of constructing. `None` also
    /// means allocator exhaustion. Array and map access never allocates
    /// and never fails. Panics for singular scalar fields; those go
    /// through [`Self::set_field`].
    pub fn mutable<'a>(
        &'a mut self,
        field: &'pool FieldDescriptor,
        arena: Option<&mut Arena>,
    ) -> Option<MutableValue<'pool, 'a>> {
        assert!(!field.is_extension(), "extensions are set with set_extension");
        let off = field.offset as usize;
        if field.is_map() {
            let sub = field
                .map_info()
                .and_then(|info| linked(&info.value_message));
            return Some(MutableValue::Map(DynMap {
                raw: self.object.ref_mut(off),
                field,
                value_desc: sub,
            }));
        }
        if field.is_repeated() {
            return Some(MutableValue::Array(DynArray {
                raw: self.object.ref_mut(off),
                field,
            }));
        }
        assert!(
            field.kind() == Kind::Message,
            "field `{}` is a singular scalar; use set_field()",
            field.name()
        );
        let sub = self.sub_descriptor(field);
        let active = match field.containing_oneof_index() {
            Some(oi) => {
                let case_offset = self.desc.oneof(oi as usize).case_offset as usize;
                self.object.get::<u32>(case_offset) == field.number()
            }
            None => true,
        };
        let current = self.object.get::<MessageRef>(off);
        let ptr = if active && !current.is_null() {
            current.0
        } else {
            let fresh = Object::create(sub.instance_size(), arena?)? as *mut Object;
            if let Some(oi) = field.containing_oneof_index() {
                let oneof = self.desc.oneof(oi as usize);
                self.object.zero(off, oneof.union_size as usize);
                self.object
                    .put::<u32>(oneof.case_offset as usize, field.number());
            }
            self.object.put(off, MessageRef(fresh));
            fresh
        };
        Some(MutableValue::Message(DynMessage {
            object: unsafe { &mut *ptr },
            desc: sub,
        }))
    }

    /// Appends raw bytes to the unknown-field buffer.
    pub fn add_unknown(&mut self, bytes: &[u8], arena: &mut Arena) -> bool {
        let off = self.desc.unknown_offset as usize;
        self.object.ref_mut::<Bytes>(off).append(bytes, arena)
    }

    /// Drops unknown bytes here and in reachable sub-messages, up to
    /// `max_depth` levels (this message is level one). Returns `true` when
    /// the whole reachable tree was covered; `false` when the depth ran out
    /// first. At depth zero nothing is touched. Extension sub-messages are
    /// resolved through `pool`.
    pub fn discard_unknown(&mut self, pool: &DescriptorPool, max_depth: usize) -> bool {
        if max_depth == 0 {
            return false;
        }
        self.unknown_slot_mut().clear();

        let mut complete = true;
        for i in 0..self.desc.fields().len() {
            let field = self.desc.field(i);
            // Map fields with message values carry Kind::Message too.
            if field.kind() != Kind::Message {
                continue;
            }
            let off = field.offset as usize;
            if field.is_map() {
                let sub = field
                    .map_info()
                    .and_then(|info| linked(&info.value_message));
                let Some(sub) = sub else { continue };
                let map = self.object.ref_mut::<MapField>(off) as *mut MapField;
                for entry in unsafe { &mut *map }.entries_mut() {
                    if !entry.value.ptr.is_null() {
                        let mut child = DynMessage {
                            object: unsafe { &mut *(entry.value.ptr as *mut Object) },
                            desc: sub,
                        };
                        complete &= child.discard_unknown(pool, max_depth - 1);
                    }
                }
            } else if field.is_repeated() {
                let sub = self.sub_descriptor(field);
                let arr = self.object.ref_mut::<RepeatedField<MessageRef>>(off)
                    as *mut RepeatedField<MessageRef>;
                for r in unsafe { &mut *arr }.slice_mut() {
                    let mut child = DynMessage {
                        object: unsafe { &mut *r.0 },
                        desc: sub,
                    };
                    complete &= child.discard_unknown(pool, max_depth - 1);
                }
            } else if self.as_ref().is_set(field) {
                let sub = self.sub_descriptor(field);
                let r = self.object.get::<MessageRef>(off);
                let mut child = DynMessage {
                    object: unsafe { &mut *r.0 },
                    desc: sub,
                };
                complete &= child.discard_unknown(pool, max_depth - 1);
            }
        }

        let name = self.desc.full_name().to_string();
        let ext = self.ext_slot_mut() as *mut RepeatedField<ExtEntry>;
        for entry in unsafe { &mut *ext }.slice_mut() {
            if entry.kind != Kind::Message || entry.value.ptr.is_null() {
                continue;
            }
            let Some(fd) = pool.find_extension(&name, entry.number) else {
                continue;
            };
            let Some(sub) = linked(&fd.message_type) else { continue };
            let mut child = DynMessage {
                object: unsafe { &mut *(entry.value.ptr as *mut Object) },
                desc: sub,
            };
            complete &= child.discard_unknown(pool, max_depth - 1);
        }
        complete
    }

    /// Stores an extension value, replacing any entry with the same number.
    /// Panics when `value` does not match the extension's kind.
    pub fn set_extension(
        &mut self,
        field: &FieldDescriptor,
        value: Value,
        arena: &mut Arena,
    ) -> bool {
        assert!(field.is_extension(), "field `{}` is not an extension", field.name());
        assert_eq!(
            field.extendee(),
            Some(self.desc.full_name()),
            "extension `{}` does not extend `{}`",
            field.name(),
            self.desc.full_name()
        );
        let Some(raw) = value_to_raw(field.kind(), value, arena) else {
            return false;
        };
        let number = field.number();
        let kind = field.kind();
        let slot = self.ext_slot_mut();
        if let Some(entry) = slot.slice_mut().iter_mut().find(|e| e.number == number) {
            entry.kind = kind;
            entry.value = raw;
            return true;
        }
        self.ext_slot_mut().push(
            ExtEntry {
                number,
                kind,
                value: raw,
            },
            arena,
        )
    }

    /// Removes the stored entry for extension `field`, if any.
    pub fn clear_extension(&mut self, field: &FieldDescriptor) -> bool {
        assert!(field.is_extension(), "field `{}` is not an extension", field.name());
        let number = field.number();
        let slot = self.ext_slot_mut();
        match slot.iter().position(|e| e.number == number) {
            Some(i) => {
                slot.remove(i);
                true
            }
            None => false,
        }
    }
}

/// Mutable handle returned by [`DynMessage::mutable`].
pub enum MutableValue<'pool, 'a> {
    Message(DynMessage<'pool, 'a>),
    Array(DynArray<'pool, 'a>),
    Map(DynMap<'pool, 'a>),
}

/// Mutable view of a repeated field. The element type is whatever the
/// field's kind dictates; values are checked against it at each call.
pub struct DynArray<'pool, 'a> {
    raw: &'a mut RepeatedField<u64>,
    field: &'pool FieldDescriptor,
}

impl<'pool> DynArray<'pool, '_> {
    /// The header layout is shared by every element type; only the element
    /// stride differs, and the caller picks `T` to match `self.field`.
    unsafe fn typed<T>(&mut self) -> &mut RepeatedField<T> {
        unsafe { &mut *(self.raw as *mut RepeatedField<u64> as *mut RepeatedField<T>) }
    }

    fn typed_ref<T>(&self) -> &RepeatedField<T> {
        unsafe { &*(self.raw as *const RepeatedField<u64> as *const RepeatedField<T>) }
    }

    pub fn len(&self) -> usize {
        self.typed_ref::<u8>().slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        unsafe { self.typed::<u8>() }.clear();
    }

    /// Appends `value`. `false` on allocator exhaustion; panics on a kind
    /// mismatch.
    pub fn push(&mut self, value: Value, arena: &mut Arena) -> bool {
        unsafe {
            match (self.field.kind(), value) {
                (Kind::Bool, Value::Bool(v)) => self.typed().push(v, arena),
                (Kind::Int32 | Kind::Enum, Value::Int32(v)) => self.typed().push(v, arena),
                (Kind::Int64, Value::Int64(v)) => self.typed().push(v, arena),
                (Kind::UInt32, Value::UInt32(v)) => self.typed().push(v, arena),
                (Kind::UInt64, Value::UInt64(v)) => self.typed().push(v, arena),
                (Kind::Float, Value::Float(v)) => self.typed().push(v, arena),
                (Kind::Double, Value::Double(v)) => self.typed().push(v, arena),
                (Kind::String, Value::String(s)) => match ArenaString::from_str(s, arena) {
                    Some(s) => self.typed().push(s, arena),
                    None => false,
                },
                (Kind::Bytes, Value::Bytes(b)) => match Bytes::from_slice(b, arena) {
                    Some(b) => self.typed().push(b, arena),
                    None => false,
                },
                (Kind::Message, Value::Message(Some(m))) => self
                    .typed()
                    .push(MessageRef(m.object as *const Object as *mut Object), arena),
                (k, v) => {
                    panic!("cannot append {v:?} to field `{}` of kind {k:?}", self.field.name())
                }
            }
        }
    }

    /// Appends a fresh, defaulted sub-message and returns it for filling
    /// in. `None` on allocator exhaustion; panics for non-message arrays.
    pub fn append_message<'b>(&'b mut self, arena: &mut Arena) -> Option<DynMessage<'pool, 'b>> {
        assert!(
            self.field.kind() == Kind::Message,
            "field `{}` is not a message array",
            self.field.name()
        );
        let sub = linked(&self.field.message_type).expect("message field without linked descriptor");
        let fresh = Object::create(sub.instance_size(), arena)? as *mut Object;
        if !unsafe { self.typed() }.push(MessageRef(fresh), arena) {
            return None;
        }
        Some(DynMessage {
            object: unsafe { &mut *fresh },
            desc: sub,
        })
    }

    /// The element at `index`; panics out of bounds or on unlinked message
    /// elements.
    pub fn get<'b>(&'b self, index: usize) -> Value<'pool, 'b> {
        assert!(index < self.len(), "index {index} out of bounds");
        match self.field.kind() {
            Kind::Bool => Value::Bool(self.typed_ref::<bool>()[index]),
            Kind::Int32 | Kind::Enum => Value::Int32(self.typed_ref::<i32>()[index]),
            Kind::Int64 => Value::Int64(self.typed_ref::<i64>()[index]),
            Kind::UInt32 => Value::UInt32(self.typed_ref::<u32>()[index]),
            Kind::UInt64 => Value::UInt64(self.typed_ref::<u64>()[index]),
            Kind::Float => Value::Float(self.typed_ref::<f32>()[index]),
            Kind::Double => Value::Double(self.typed_ref::<f64>()[index]),
            Kind::String => Value::String(self.typed_ref::<ArenaString>()[index].as_str()),
            Kind::Bytes => Value::Bytes(self.typed_ref::<Bytes>()[index].slice()),
            Kind::Message => Value::Message(Some(DynMessageRef {
                object: unsafe { &*self.typed_ref::<MessageRef>()[index].0 },
                desc: linked(&self.field.message_type)
                    .expect("message field without linked descriptor"),
            })),
        }
    }
}

/// Mutable view of a map field.
pub struct DynMap<'pool, 'a> {
    raw: &'a mut MapField,
    field: &'pool FieldDescriptor,
    value_desc: Option<&'pool MessageDescriptor>,
}

impl<'pool> DynMap<'pool, '_> {
    fn info(&self) -> &'pool crate::descriptor::MapInfo {
        self.field.map_info().expect("map view of non-map field")
    }

    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn clear(&mut self) {
        self.raw.clear();
    }

    /// Inserts or replaces. `Some(true)` replaced, `Some(false)` added,
    /// `None` allocator exhaustion. Panics when key or value does not match
    /// the declared kinds.
    pub fn insert(&mut self, key: Value, value: Value, arena: &mut Arena) -> Option<bool> {
        let info = self.info();
        let raw_key = value_to_raw(info.key_kind(), key, arena)?;
        let raw_value = value_to_raw(info.value_kind(), value, arena)?;
        self.raw.insert(info.key_kind(), raw_key, raw_value, arena)
    }

    /// The value stored for `key`, or `None`. String keys are copied into
    /// `arena` for the probe and compared by content.
    pub fn get<'b>(&'b self, key: Value, arena: &mut Arena) -> Option<Value<'pool, 'b>> {
        let info = self.info();
        let raw_key = value_to_raw(info.key_kind(), key, arena)?;
        let entry = self.raw.find(info.key_kind(), raw_key)?;
        Some(unsafe { raw_to_value(info.value_kind(), self.value_desc, entry.value) })
    }

    pub fn remove(&mut self, key: Value, arena: &mut Arena) -> bool {
        let info = self.info();
        match value_to_raw(info.key_kind(), key, arena) {
            Some(raw_key) => self.raw.remove(info.key_kind(), raw_key),
            None => false,
        }
    }

    pub fn iter<'b>(&'b self) -> impl Iterator<Item = (Value<'pool, 'b>, Value<'pool, 'b>)> {
        let info = self.info();
        let value_desc = self.value_desc;
        self.raw.entries().iter().map(move |e| unsafe {
            (
                raw_to_value(info.key_kind(), None, e.key),
                raw_to_value(info.value_kind(), value_desc, e.value),
            )
        })
    }
}

/// Read-only map view, surfaced by [`DynMessageRef::get`] as [`Value::Map`].
#[derive(Clone, Copy)]
pub struct DynMapRef<'pool, 'msg> {
    raw: &'msg MapField,
    field: &'pool FieldDescriptor,
}

impl<'pool, 'msg> DynMapRef<'pool, 'msg> {
    pub fn len(&self) -> usize {
        self.raw.len()
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Value<'pool, 'msg>, Value<'pool, 'msg>)> {
        let info = self.field.map_info().expect("map view of non-map field");
        let value_desc = linked(&info.value_message);
        self.raw.entries().iter().map(move |e| unsafe {
            (
                raw_to_value(info.key_kind(), None, e.key),
                raw_to_value(info.value_kind(), value_desc, e.value),
            )
        })
    }
}

impl core::fmt::Debug for DynMapRef<'_, '_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(k, v)| (format!("{k:?}"), v)))
            .finish()
    }
}

/// Read-only view of a repeated message field.
#[derive(Clone, Copy)]
pub struct DynMessageArray<'pool, 'msg> {
    objects: &'msg RepeatedField<MessageRef>,
    desc: &'pool MessageDescriptor,
}

impl<'pool, 'msg> DynMessageArray<'pool, 'msg> {
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, index: usize) -> DynMessageRef<'pool, 'msg> {
        DynMessageRef {
            object: unsafe { &*self.objects[index].0 },
            desc: self.desc,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = DynMessageRef<'pool, 'msg>> {
        let desc = self.desc;
        self.objects
            .slice()
            .iter()
            .map(move |r| DynMessageRef {
                object: unsafe { &*r.0 },
                desc,
            })
    }
}

impl core::fmt::Debug for DynMessageArray<'_, '_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Cursor for [`DynMessageRef::next`]. A fresh iterator restarts the walk.
#[derive(Default, Clone, Copy)]
pub struct FieldIter {
    pos: usize,
    ext_mark: u32,
}

impl FieldIter {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A dynamically typed field value.
///
/// Scalar variants carry the value; string, bytes, and repeated variants
/// borrow the arena-resident payload for `'msg`.
#[derive(Clone, Copy)]
pub enum Value<'pool, 'msg> {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(&'msg str),
    Bytes(&'msg [u8]),
    Message(Option<DynMessageRef<'pool, 'msg>>),
    RepeatedBool(&'msg [bool]),
    RepeatedInt32(&'msg [i32]),
    RepeatedInt64(&'msg [i64]),
    RepeatedUInt32(&'msg [u32]),
    RepeatedUInt64(&'msg [u64]),
    RepeatedFloat(&'msg [f32]),
    RepeatedDouble(&'msg [f64]),
    RepeatedString(&'msg [ArenaString]),
    RepeatedBytes(&'msg [Bytes]),
    RepeatedMessage(DynMessageArray<'pool, 'msg>),
    Map(DynMapRef<'pool, 'msg>),
}

impl core::fmt::Debug for Value<'_, '_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Value::Bool(v) => v.fmt(f),
            Value::Int32(v) => v.fmt(f),
            Value::Int64(v) => v.fmt(f),
            Value::UInt32(v) => v.fmt(f),
            Value::UInt64(v) => v.fmt(f),
            Value::Float(v) => v.fmt(f),
            Value::Double(v) => v.fmt(f),
            Value::String(v) => v.fmt(f),
            Value::Bytes(v) => v.fmt(f),
            Value::Message(Some(ref v)) => v.fmt(f),
            Value::Message(None) => f.write_str("<unset>"),
            Value::RepeatedBool(v) => v.fmt(f),
            Value::RepeatedInt32(v) => v.fmt(f),
            Value::RepeatedInt64(v) => v.fmt(f),
            Value::RepeatedUInt32(v) => v.fmt(f),
            Value::RepeatedUInt64(v) => v.fmt(f),
            Value::RepeatedFloat(v) => v.fmt(f),
            Value::RepeatedDouble(v) => v.fmt(f),
            Value::RepeatedString(v) => v.fmt(f),
            Value::RepeatedBytes(v) => v.fmt(f),
            Value::RepeatedMessage(ref v) => v.fmt(f),
            Value::Map(ref v) => v.fmt(f),
        }
    }
}
