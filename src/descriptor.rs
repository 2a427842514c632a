//! Immutable schema metadata.
//!
//! Descriptors are built once by the schema builder (see [`crate::builder`])
//! and never mutated after publication, so concurrent readers need no
//! synchronization. Back-references (field to enclosing oneof, field to
//! sub-message type) are plain lookup keys, never ownership: oneof links are
//! indices into the containing message, and sub-message links are `Weak`
//! handles whose strong side lives in the descriptor pool.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, Weak};

/// Declared storage kind of a field. Enum fields are stored and surfaced as
/// `i32`; cardinality (repeated/map) is carried by the field, not the kind.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash)]
pub enum Kind {
    Bool,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float,
    Double,
    Enum,
    String,
    Bytes,
    Message,
}

impl Kind {
    /// Byte width of the inline scalar payload; `None` for kinds stored as
    /// containers or pointers.
    pub(crate) const fn scalar_width(self) -> Option<usize> {
        match self {
            Kind::Bool => Some(1),
            Kind::Int32 | Kind::UInt32 | Kind::Float | Kind::Enum => Some(4),
            Kind::Int64 | Kind::UInt64 | Kind::Double => Some(8),
            Kind::String | Kind::Bytes | Kind::Message => None,
        }
    }

    /// Valid as a map key: integral and string kinds only.
    pub(crate) const fn valid_map_key(self) -> bool {
        matches!(
            self,
            Kind::Bool | Kind::Int32 | Kind::Int64 | Kind::UInt32 | Kind::UInt64 | Kind::String
        )
    }
}

/// Key/value declaration of a map field.
pub struct MapInfo {
    pub(crate) key: Kind,
    pub(crate) value: Kind,
    pub(crate) value_type_name: Option<Box<str>>,
    pub(crate) value_message: OnceLock<Weak<MessageDescriptor>>,
}

impl MapInfo {
    pub fn key_kind(&self) -> Kind {
        self.key
    }

    pub fn value_kind(&self) -> Kind {
        self.value
    }

    pub fn value_message_type(&self) -> Option<Arc<MessageDescriptor>> {
        self.value_message.get().and_then(Weak::upgrade)
    }
}

/// Immutable description of one field: number, name, declared kind,
/// cardinality, presence tracking, and frozen layout results.
pub struct FieldDescriptor {
    pub(crate) name: Box<str>,
    pub(crate) number: u32,
    pub(crate) kind: Kind,
    pub(crate) repeated: bool,
    pub(crate) map: Option<Box<MapInfo>>,
    pub(crate) explicit_presence: bool,
    pub(crate) oneof_index: Option<u16>,
    pub(crate) index: u16,
    pub(crate) is_extension: bool,
    pub(crate) extendee: Option<Box<str>>,
    pub(crate) type_name: Option<Box<str>>,
    pub(crate) message_type: OnceLock<Weak<MessageDescriptor>>,
    // Layout, frozen at build time.
    pub(crate) offset: u32,
    pub(crate) hasbit: Option<u32>,
}

impl FieldDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn is_repeated(&self) -> bool {
        self.repeated
    }

    pub fn is_map(&self) -> bool {
        self.map.is_some()
    }

    pub fn map_info(&self) -> Option<&MapInfo> {
        self.map.as_deref()
    }

    pub fn is_extension(&self) -> bool {
        self.is_extension
    }

    /// Full name of the message this extension extends.
    pub fn extendee(&self) -> Option<&str> {
        self.extendee.as_deref()
    }

    /// Index of the enclosing oneof within the containing message, if any.
    /// A lookup key, not ownership; resolve through
    /// [`MessageDescriptor::oneof`].
    pub fn containing_oneof_index(&self) -> Option<u16> {
        self.oneof_index
    }

    /// Declaration index within the containing message.
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Whether the field tracks presence explicitly: optional scalars with a
    /// hasbit, oneof members, and singular message fields. `has` and oneof
    /// case tracking are only meaningful for these.
    pub fn has_presence(&self) -> bool {
        if self.repeated || self.map.is_some() {
            return false;
        }
        self.explicit_presence || self.oneof_index.is_some() || self.kind == Kind::Message
    }

    /// Resolved sub-message type for `Kind::Message` fields. `None` until
    /// the schema is published or if the owning pool is gone.
    pub fn message_type(&self) -> Option<Arc<MessageDescriptor>> {
        self.message_type.get().and_then(Weak::upgrade)
    }
}

impl core::fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("number", &self.number)
            .field("kind", &self.kind)
            .field("repeated", &self.repeated)
            .field("map", &self.map.is_some())
            .finish()
    }
}

/// Ordered group of mutually exclusive member fields. At most one member
/// has presence at a time; the active member's field number lives in the
/// message's case word at `case_offset`.
pub struct OneofDescriptor {
    pub(crate) name: Box<str>,
    pub(crate) index: u16,
    pub(crate) fields: Vec<u16>,
    pub(crate) case_offset: u32,
    pub(crate) union_size: u32,
}

impl OneofDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Positional access to the i-th member's field index within the
    /// containing message. Metadata is fixed after construction, so an
    /// out-of-range index is a defect in the caller: this panics.
    pub fn at(&self, i: usize) -> usize {
        match self.fields.get(i) {
            Some(&idx) => idx as usize,
            None => panic!(
                "oneof `{}`: member index {} out of range ({} members)",
                self.name,
                i,
                self.fields.len()
            ),
        }
    }

    /// Member field indices in declaration order.
    pub fn field_indices(&self) -> &[u16] {
        &self.fields
    }
}

/// Immutable description of a message type: fields and oneofs in
/// declaration order, indexable by name and number, plus the frozen
/// storage layout shared by every instance.
pub struct MessageDescriptor {
    pub(crate) full_name: Box<str>,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) oneofs: Vec<OneofDescriptor>,
    pub(crate) by_name: HashMap<Box<str>, u16>,
    /// Sorted by field number; doubles as the ascending iteration order.
    pub(crate) by_number: Vec<(u32, u16)>,
    pub(crate) size: u32,
    pub(crate) hasbit_words: u32,
    pub(crate) unknown_offset: u32,
    pub(crate) ext_offset: u32,
}

impl MessageDescriptor {
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Positional field access; panics out of range (build-time-fixed
    /// metadata, same policy as [`OneofDescriptor::at`]).
    pub fn field(&self, i: usize) -> &FieldDescriptor {
        &self.fields[i]
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.by_name.get(name).map(|&i| &self.fields[i as usize])
    }

    pub fn field_by_number(&self, number: u32) -> Option<&FieldDescriptor> {
        self.by_number
            .binary_search_by_key(&number, |&(n, _)| n)
            .ok()
            .map(|pos| &self.fields[self.by_number[pos].1 as usize])
    }

    pub fn oneofs(&self) -> &[OneofDescriptor] {
        &self.oneofs
    }

    /// Positional oneof access; panics out of range.
    pub fn oneof(&self, i: usize) -> &OneofDescriptor {
        &self.oneofs[i]
    }

    pub fn oneof_by_name(&self, name: &str) -> Option<&OneofDescriptor> {
        self.oneofs.iter().find(|o| &*o.name == name)
    }

    /// The oneof enclosing `field`, if any.
    pub fn containing_oneof(&self, field: &FieldDescriptor) -> Option<&OneofDescriptor> {
        field.oneof_index.map(|i| &self.oneofs[i as usize])
    }

    /// Member field of `oneof` at position `i`.
    pub fn oneof_field(&self, oneof: &OneofDescriptor, i: usize) -> &FieldDescriptor {
        &self.fields[oneof.at(i)]
    }

    /// Fields in ascending field-number order.
    pub fn fields_by_number(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.by_number.iter().map(|&(_, i)| &self.fields[i as usize])
    }

    /// The field at position `rank` of the ascending field-number order.
    pub(crate) fn field_at_number_rank(&self, rank: usize) -> Option<&FieldDescriptor> {
        self.by_number
            .get(rank)
            .map(|&(_, i)| &self.fields[i as usize])
    }

    /// Instance storage size in bytes.
    pub fn instance_size(&self) -> u32 {
        self.size
    }
}

impl core::fmt::Debug for MessageDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MessageDescriptor")
            .field("full_name", &self.full_name)
            .field("fields", &self.fields.len())
            .field("oneofs", &self.oneofs.len())
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oneof_with_members(n: usize) -> OneofDescriptor {
        OneofDescriptor {
            name: "o".into(),
            index: 0,
            fields: (0..n as u16).collect(),
            case_offset: 0,
            union_size: 8,
        }
    }

    #[test]
    fn oneof_at_in_range() {
        let o = oneof_with_members(3);
        assert_eq!(o.at(0), 0);
        assert_eq!(o.at(2), 2);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn oneof_at_out_of_range_panics() {
        let o = oneof_with_members(2);
        o.at(2);
    }
}
