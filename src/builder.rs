//! Schema construction.
//!
//! Descriptors are built in a single pass from plain-data "proto" structs,
//! the hand-off format of the (out-of-scope) descriptor-proto parser. The
//! build is fail-fast and all-or-nothing: any collision or malformed input
//! aborts the whole file and nothing is published.
//!
//! Oneofs go through a two-phase protocol: a batch of empty oneofs is
//! created first ([`DefBuilder::oneofs_new_batch`]), members are inserted
//! one at a time while the fields are walked
//! ([`DefBuilder::oneof_insert`]), and a finalize pass
//! ([`DefBuilder::oneofs_finalize`]) validates every oneof is non-empty and
//! reports how many case-selector words the message layout must reserve.

use core::alloc::Layout;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use thiserror::Error;

use crate::base::{ExtEntry, MessageRef};
use crate::containers::{Bytes, MapField, RepeatedField, String as ArenaString};
use crate::descriptor::{FieldDescriptor, Kind, MapInfo, MessageDescriptor, OneofDescriptor};

/// Highest permitted field number (2^29 - 1).
pub const MAX_FIELD_NUMBER: u32 = 536_870_911;

/// A failed schema build. The whole file is rejected; no partially built
/// schema is ever observable.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("message `{name}` is already defined")]
    DuplicateMessage { name: String },
    #[error("field `{field}` has invalid number {number}")]
    InvalidFieldNumber { field: String, number: u32 },
    #[error("duplicate field number {number} in message `{message}`")]
    DuplicateFieldNumber { message: String, number: u32 },
    #[error("duplicate field name `{name}` in message `{message}`")]
    DuplicateFieldName { message: String, name: String },
    #[error("field `{field}` references oneof index {index}, which does not exist")]
    BadOneofIndex { field: String, index: u32 },
    #[error("field `{field}` cannot be a oneof member: members must be singular")]
    OneofMemberNotSingular { field: String },
    #[error("duplicate oneof name `{name}` in message `{message}`")]
    DuplicateOneofName { message: String, name: String },
    #[error("oneof `{oneof}` already has a member named `{name}`")]
    OneofMemberNameCollision { oneof: String, name: String },
    #[error("oneof `{oneof}` already has a member with number {number}")]
    OneofMemberNumberCollision { oneof: String, number: u32 },
    #[error("oneof `{name}` in message `{message}` has no members")]
    EmptyOneof { message: String, name: String },
    #[error("message field `{field}` is missing a type name")]
    MissingTypeName { field: String },
    #[error("field `{field}` references unknown type `{type_name}`")]
    UnresolvedType { field: String, type_name: String },
    #[error("map field `{field}` has a non-integral, non-string key kind")]
    InvalidMapKey { field: String },
    #[error("extension `{name}` must be a singular, non-map field")]
    InvalidExtension { name: String },
    #[error("extension `{name}` targets unknown message `{extendee}`")]
    UnknownExtendee { name: String, extendee: String },
    #[error("message `{extendee}` already has an extension with number {number}")]
    DuplicateExtension { extendee: String, number: u32 },
}

/// Cardinality and presence of a field declaration. `Optional` tracks
/// presence explicitly (hasbit); `Implicit` treats the type default as
/// absent, proto3 style.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum Label {
    #[default]
    Implicit,
    Optional,
    Repeated,
}

/// Map declaration attached to a [`FieldProto`].
#[derive(Clone, Debug)]
pub struct MapProto {
    pub key: Kind,
    pub value: Kind,
    pub value_type_name: Option<String>,
}

/// Field declaration, the builder's input for one field.
#[derive(Clone, Debug)]
pub struct FieldProto {
    pub name: String,
    pub number: u32,
    pub kind: Kind,
    pub label: Label,
    pub type_name: Option<String>,
    pub oneof_index: Option<u32>,
    pub map: Option<MapProto>,
}

impl FieldProto {
    fn base(name: &str, number: u32, kind: Kind, label: Label) -> Self {
        FieldProto {
            name: name.to_string(),
            number,
            kind,
            label,
            type_name: None,
            oneof_index: None,
            map: None,
        }
    }

    /// Singular field with implicit presence.
    pub fn scalar(name: &str, number: u32, kind: Kind) -> Self {
        Self::base(name, number, kind, Label::Implicit)
    }

    /// Singular field with explicit presence.
    pub fn optional(name: &str, number: u32, kind: Kind) -> Self {
        Self::base(name, number, kind, Label::Optional)
    }

    pub fn repeated(name: &str, number: u32, kind: Kind) -> Self {
        Self::base(name, number, kind, Label::Repeated)
    }

    /// Singular submessage field; `type_name` is the target's full name.
    pub fn message(name: &str, number: u32, type_name: &str) -> Self {
        let mut f = Self::base(name, number, Kind::Message, Label::Optional);
        f.type_name = Some(type_name.to_string());
        f
    }

    pub fn repeated_message(name: &str, number: u32, type_name: &str) -> Self {
        let mut f = Self::base(name, number, Kind::Message, Label::Repeated);
        f.type_name = Some(type_name.to_string());
        f
    }

    pub fn map(name: &str, number: u32, key: Kind, value: Kind) -> Self {
        let mut f = Self::base(name, number, value, Label::Repeated);
        f.map = Some(MapProto {
            key,
            value,
            value_type_name: None,
        });
        f
    }

    pub fn map_message(name: &str, number: u32, key: Kind, value_type_name: &str) -> Self {
        let mut f = Self::base(name, number, Kind::Message, Label::Repeated);
        f.map = Some(MapProto {
            key,
            value: Kind::Message,
            value_type_name: Some(value_type_name.to_string()),
        });
        f
    }

    /// Marks the field as a member of the oneof at `index`.
    pub fn in_oneof(mut self, index: u32) -> Self {
        self.oneof_index = Some(index);
        self
    }
}

/// Oneof declaration; members are the fields that reference it by index.
#[derive(Clone, Debug)]
pub struct OneofProto {
    pub name: String,
}

impl OneofProto {
    pub fn new(name: &str) -> Self {
        OneofProto {
            name: name.to_string(),
        }
    }
}

/// Message declaration.
#[derive(Clone, Debug, Default)]
pub struct MessageProto {
    pub name: String,
    pub fields: Vec<FieldProto>,
    pub oneofs: Vec<OneofProto>,
    pub nested: Vec<MessageProto>,
}

impl MessageProto {
    pub fn new(name: &str) -> Self {
        MessageProto {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn field(mut self, f: FieldProto) -> Self {
        self.fields.push(f);
        self
    }

    pub fn oneof(mut self, name: &str) -> Self {
        self.oneofs.push(OneofProto::new(name));
        self
    }

    pub fn nested(mut self, m: MessageProto) -> Self {
        self.nested.push(m);
        self
    }
}

/// File declaration: a package name and its top-level messages, published
/// atomically by [`crate::pool::DescriptorPool::add_file`].
#[derive(Clone, Debug, Default)]
pub struct FileProto {
    pub package: String,
    pub messages: Vec<MessageProto>,
}

impl FileProto {
    pub fn new(package: &str) -> Self {
        FileProto {
            package: package.to_string(),
            messages: Vec::new(),
        }
    }

    pub fn message(mut self, m: MessageProto) -> Self {
        self.messages.push(m);
        self
    }
}

/// A oneof under construction: members accumulate during the field walk,
/// then [`DefBuilder::oneofs_finalize`] freezes the batch.
pub(crate) struct OneofStage {
    name: String,
    index: u16,
    fields: Vec<u16>,
    member_names: HashSet<String>,
    member_numbers: HashSet<u32>,
}

/// Single-threaded build context for one message. Carries the message name
/// for error reporting; every failure propagates as [`BuildError`] and
/// aborts the enclosing file build.
pub(crate) struct DefBuilder {
    msg_name: String,
}

impl DefBuilder {
    pub(crate) fn new(msg_name: &str) -> Self {
        DefBuilder {
            msg_name: msg_name.to_string(),
        }
    }

    /// Allocates and initializes one staged oneof per proto. The batch
    /// either fully succeeds or the schema build aborts.
    pub(crate) fn oneofs_new_batch(
        &self,
        protos: &[OneofProto],
    ) -> Result<Vec<OneofStage>, BuildError> {
        let mut seen = HashSet::new();
        let mut staged = Vec::with_capacity(protos.len());
        for (i, p) in protos.iter().enumerate() {
            if !seen.insert(p.name.clone()) {
                return Err(BuildError::DuplicateOneofName {
                    message: self.msg_name.clone(),
                    name: p.name.clone(),
                });
            }
            staged.push(OneofStage {
                name: p.name.clone(),
                index: i as u16,
                fields: Vec::new(),
                member_names: HashSet::new(),
                member_numbers: HashSet::new(),
            });
        }
        Ok(staged)
    }

    /// Registers a field as a member of `oneof`. Rejects a member whose
    /// name or number collides with a sibling already registered.
    pub(crate) fn oneof_insert(
        &self,
        oneof: &mut OneofStage,
        field_index: u16,
        name: &str,
        number: u32,
    ) -> Result<(), BuildError> {
        if !oneof.member_names.insert(name.to_string()) {
            return Err(BuildError::OneofMemberNameCollision {
                oneof: oneof.name.clone(),
                name: name.to_string(),
            });
        }
        if !oneof.member_numbers.insert(number) {
            return Err(BuildError::OneofMemberNumberCollision {
                oneof: oneof.name.clone(),
                number,
            });
        }
        oneof.fields.push(field_index);
        Ok(())
    }

    /// Second pass, after every field is attached: validates each oneof has
    /// at least one member and returns the number of case-selector words
    /// the message layout must reserve.
    pub(crate) fn oneofs_finalize(&self, oneofs: &[OneofStage]) -> Result<usize, BuildError> {
        for o in oneofs {
            if o.fields.is_empty() {
                return Err(BuildError::EmptyOneof {
                    message: self.msg_name.clone(),
                    name: o.name.clone(),
                });
            }
        }
        Ok(oneofs.len())
    }
}

fn check_number(field: &str, number: u32) -> Result<(), BuildError> {
    let reserved = (19_000..=19_999).contains(&number);
    if number == 0 || number > MAX_FIELD_NUMBER || reserved {
        return Err(BuildError::InvalidFieldNumber {
            field: field.to_string(),
            number,
        });
    }
    Ok(())
}

/// Inline storage size of one field slot.
fn field_size(f: &FieldDescriptor) -> usize {
    if f.map.is_some() {
        core::mem::size_of::<MapField>()
    } else if f.repeated {
        // Header size is independent of the element type.
        core::mem::size_of::<RepeatedField<u64>>()
    } else {
        match f.kind {
            Kind::String | Kind::Bytes => core::mem::size_of::<ArenaString>(),
            Kind::Message => core::mem::size_of::<MessageRef>(),
            k => k.scalar_width().unwrap(),
        }
    }
}

fn field_align(f: &FieldDescriptor) -> usize {
    if f.map.is_some() || f.repeated {
        core::mem::align_of::<RepeatedField<u64>>()
    } else {
        match f.kind {
            Kind::String | Kind::Bytes => core::mem::align_of::<ArenaString>(),
            Kind::Message => core::mem::align_of::<MessageRef>(),
            k => k.scalar_width().unwrap().min(8),
        }
    }
}

/// Builds one message descriptor (layout included) from its proto. Nested
/// messages are handled by the pool, which walks the tree and assigns full
/// names; sub-message links stay unresolved until the pool's patch pass.
pub(crate) fn build_message(
    full_name: &str,
    proto: &MessageProto,
) -> Result<MessageDescriptor, BuildError> {
    let ctx = DefBuilder::new(full_name);
    let mut oneofs = ctx.oneofs_new_batch(&proto.oneofs)?;

    let mut fields: Vec<FieldDescriptor> = Vec::with_capacity(proto.fields.len());
    let mut numbers = HashSet::new();
    let mut names = HashSet::new();

    for (i, fp) in proto.fields.iter().enumerate() {
        check_number(&fp.name, fp.number)?;
        if !numbers.insert(fp.number) {
            return Err(BuildError::DuplicateFieldNumber {
                message: full_name.to_string(),
                number: fp.number,
            });
        }
        if !names.insert(fp.name.clone()) {
            return Err(BuildError::DuplicateFieldName {
                message: full_name.to_string(),
                name: fp.name.clone(),
            });
        }

        let map = match &fp.map {
            Some(mp) => {
                if !mp.key.valid_map_key() {
                    return Err(BuildError::InvalidMapKey {
                        field: fp.name.clone(),
                    });
                }
                if mp.value == Kind::Message && mp.value_type_name.is_none() {
                    return Err(BuildError::MissingTypeName {
                        field: fp.name.clone(),
                    });
                }
                Some(Box::new(MapInfo {
                    key: mp.key,
                    value: mp.value,
                    value_type_name: mp.value_type_name.as_deref().map(Box::from),
                    value_message: OnceLock::new(),
                }))
            }
            None => None,
        };

        let repeated = map.is_none() && fp.label == Label::Repeated;
        let kind = map.as_ref().map(|m| m.value).unwrap_or(fp.kind);

        if kind == Kind::Message && map.is_none() && fp.type_name.is_none() {
            return Err(BuildError::MissingTypeName {
                field: fp.name.clone(),
            });
        }

        let oneof_index = match fp.oneof_index {
            Some(oi) => {
                if oi as usize >= oneofs.len() {
                    return Err(BuildError::BadOneofIndex {
                        field: fp.name.clone(),
                        index: oi,
                    });
                }
                if repeated || map.is_some() {
                    return Err(BuildError::OneofMemberNotSingular {
                        field: fp.name.clone(),
                    });
                }
                ctx.oneof_insert(&mut oneofs[oi as usize], i as u16, &fp.name, fp.number)?;
                Some(oi as u16)
            }
            None => None,
        };

        fields.push(FieldDescriptor {
            name: Box::from(fp.name.as_str()),
            number: fp.number,
            kind,
            repeated,
            map,
            explicit_presence: fp.label == Label::Optional,
            oneof_index,
            index: i as u16,
            is_extension: false,
            extendee: None,
            type_name: fp.type_name.as_deref().map(Box::from),
            message_type: OnceLock::new(),
            offset: 0,
            hasbit: None,
        });
    }

    let case_words = ctx.oneofs_finalize(&oneofs)?;

    let (layout_info, oneof_descs) = compute_layout(&mut fields, &oneofs, case_words);

    let mut by_name = HashMap::with_capacity(fields.len());
    let mut by_number: Vec<(u32, u16)> = Vec::with_capacity(fields.len());
    for f in &fields {
        by_name.insert(f.name.clone(), f.index);
        by_number.push((f.number, f.index));
    }
    by_number.sort_unstable_by_key(|&(n, _)| n);

    Ok(MessageDescriptor {
        full_name: Box::from(full_name),
        fields,
        oneofs: oneof_descs,
        by_name,
        by_number,
        size: layout_info.size,
        hasbit_words: layout_info.hasbit_words,
        unknown_offset: layout_info.unknown_offset,
        ext_offset: layout_info.ext_offset,
    })
}

/// Builds an extension field descriptor for `extendee`. Extensions are
/// singular, explicitly present, and carry no layout (they live in the
/// per-message extension list rather than at a fixed offset).
pub(crate) fn build_extension(
    extendee: &str,
    proto: &FieldProto,
) -> Result<FieldDescriptor, BuildError> {
    check_number(&proto.name, proto.number)?;
    if proto.label == Label::Repeated || proto.map.is_some() || proto.oneof_index.is_some() {
        return Err(BuildError::InvalidExtension {
            name: proto.name.clone(),
        });
    }
    if proto.kind == Kind::Message && proto.type_name.is_none() {
        return Err(BuildError::MissingTypeName {
            field: proto.name.clone(),
        });
    }
    Ok(FieldDescriptor {
        name: Box::from(proto.name.as_str()),
        number: proto.number,
        kind: proto.kind,
        repeated: false,
        map: None,
        explicit_presence: true,
        oneof_index: None,
        index: 0,
        is_extension: true,
        extendee: Some(Box::from(extendee)),
        type_name: proto.type_name.as_deref().map(Box::from),
        message_type: OnceLock::new(),
        offset: 0,
        hasbit: None,
    })
}

struct LayoutInfo {
    size: u32,
    hasbit_words: u32,
    unknown_offset: u32,
    ext_offset: u32,
}

fn needs_hasbit(f: &FieldDescriptor) -> bool {
    !f.repeated
        && f.map.is_none()
        && f.kind != Kind::Message
        && f.oneof_index.is_none()
        && f.explicit_presence
}

/// Computes the instance layout: metadata words first (hasbits, then one
/// case word per oneof), the internal unknown/extension slots, then field
/// storage. Oneof members share a single union region sized and aligned to
/// the widest member. `Layout::extend` supplies the padding; `pad_to_align`
/// finishes the struct.
fn compute_layout(
    fields: &mut [FieldDescriptor],
    stages: &[OneofStage],
    case_words: usize,
) -> (LayoutInfo, Vec<OneofDescriptor>) {
    let hasbit_count = fields.iter().filter(|f| needs_hasbit(f)).count();
    let hasbit_words = hasbit_count.div_ceil(32);
    let metadata_size = (hasbit_words + case_words) * 4;

    let mut layout = Layout::from_size_align(metadata_size, 4).unwrap();
    let (next, unknown_offset) = layout.extend(Layout::new::<Bytes>()).unwrap();
    let (next, ext_offset) = next.extend(Layout::new::<RepeatedField<ExtEntry>>()).unwrap();
    layout = next;

    // Hasbit indices in declaration order.
    let mut hasbit_idx = 0u32;
    for f in fields.iter_mut() {
        if needs_hasbit(f) {
            f.hasbit = Some(hasbit_idx);
            hasbit_idx += 1;
        }
    }

    // Non-oneof fields get their own slots.
    for i in 0..fields.len() {
        if fields[i].oneof_index.is_some() {
            continue;
        }
        let slot = Layout::from_size_align(field_size(&fields[i]), field_align(&fields[i])).unwrap();
        let (next, offset) = layout.extend(slot).unwrap();
        fields[i].offset = offset as u32;
        layout = next;
    }

    // One union region per oneof, shared by all members.
    let mut oneof_descs = Vec::with_capacity(stages.len());
    for stage in stages {
        let mut union_size = 0usize;
        let mut union_align = 1usize;
        for &fi in &stage.fields {
            union_size = union_size.max(field_size(&fields[fi as usize]));
            union_align = union_align.max(field_align(&fields[fi as usize]));
        }
        let slot = Layout::from_size_align(union_size, union_align).unwrap();
        let (next, offset) = layout.extend(slot).unwrap();
        layout = next;
        for &fi in &stage.fields {
            fields[fi as usize].offset = offset as u32;
        }
        oneof_descs.push(OneofDescriptor {
            name: Box::from(stage.name.as_str()),
            index: stage.index,
            fields: stage.fields.clone(),
            case_offset: ((hasbit_words + stage.index as usize) * 4) as u32,
            union_size: union_size as u32,
        });
    }

    let layout = layout.pad_to_align();
    (
        LayoutInfo {
            size: layout.size().max(8) as u32,
            hasbit_words: hasbit_words as u32,
            unknown_offset: unknown_offset as u32,
            ext_offset: ext_offset as u32,
        },
        oneof_descs,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_message() -> MessageProto {
        MessageProto::new("Sample")
            .oneof("choice")
            .field(FieldProto::optional("id", 1, Kind::Int32))
            .field(FieldProto::scalar("count", 2, Kind::UInt64))
            .field(FieldProto::repeated("tags", 3, Kind::String))
            .field(FieldProto::scalar("num", 4, Kind::Int32).in_oneof(0))
            .field(FieldProto::scalar("text", 5, Kind::String).in_oneof(0))
            .field(FieldProto::map("attrs", 6, Kind::String, Kind::Int64))
    }

    #[test]
    fn builds_descriptor_with_layout() {
        let m = build_message("test.Sample", &sample_message()).unwrap();
        assert_eq!(m.full_name(), "test.Sample");
        assert_eq!(m.fields().len(), 6);
        assert_eq!(m.oneofs().len(), 1);
        assert!(m.instance_size() > 0);

        // One explicit-presence scalar: one hasbit word, then one case word.
        assert_eq!(m.hasbit_words, 1);
        assert_eq!(m.oneof(0).case_offset, 4);

        // Oneof members share a slot sized for the widest member (String).
        let num = m.field_by_name("num").unwrap();
        let text = m.field_by_name("text").unwrap();
        assert_eq!(num.offset, text.offset);
        assert_eq!(
            m.oneof(0).union_size as usize,
            core::mem::size_of::<ArenaString>()
        );

        // Distinct non-oneof fields never overlap.
        let id = m.field_by_name("id").unwrap();
        let count = m.field_by_name("count").unwrap();
        assert_ne!(id.offset, count.offset);
        assert_eq!(count.offset % 8, 0);
    }

    #[test]
    fn lookup_by_name_and_number() {
        let m = build_message("test.Sample", &sample_message()).unwrap();
        assert_eq!(m.field_by_name("count").unwrap().number(), 2);
        assert_eq!(m.field_by_number(3).unwrap().name(), "tags");
        assert!(m.field_by_number(99).is_none());
        assert!(m.field_by_name("missing").is_none());
    }

    #[test]
    fn number_order_is_ascending() {
        let proto = MessageProto::new("M")
            .field(FieldProto::scalar("c", 30, Kind::Int32))
            .field(FieldProto::scalar("a", 1, Kind::Int32))
            .field(FieldProto::scalar("b", 7, Kind::Int32));
        let m = build_message("M", &proto).unwrap();
        let numbers: Vec<u32> = m.fields_by_number().map(|f| f.number()).collect();
        assert_eq!(numbers, vec![1, 7, 30]);
    }

    #[test]
    fn rejects_duplicate_field_number() {
        let proto = MessageProto::new("M")
            .field(FieldProto::scalar("a", 1, Kind::Int32))
            .field(FieldProto::scalar("b", 1, Kind::Int32));
        assert!(matches!(
            build_message("M", &proto),
            Err(BuildError::DuplicateFieldNumber { number: 1, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_field_name() {
        let proto = MessageProto::new("M")
            .field(FieldProto::scalar("a", 1, Kind::Int32))
            .field(FieldProto::scalar("a", 2, Kind::Int32));
        assert!(matches!(
            build_message("M", &proto),
            Err(BuildError::DuplicateFieldName { .. })
        ));
    }

    #[test]
    fn rejects_bad_numbers() {
        for n in [0u32, 19_500, MAX_FIELD_NUMBER + 1] {
            let proto = MessageProto::new("M").field(FieldProto::scalar("a", n, Kind::Int32));
            assert!(matches!(
                build_message("M", &proto),
                Err(BuildError::InvalidFieldNumber { .. })
            ));
        }
    }

    #[test]
    fn rejects_empty_oneof() {
        let proto = MessageProto::new("M")
            .oneof("o")
            .field(FieldProto::scalar("a", 1, Kind::Int32));
        assert!(matches!(
            build_message("M", &proto),
            Err(BuildError::EmptyOneof { .. })
        ));
    }

    #[test]
    fn rejects_repeated_oneof_member() {
        let proto = MessageProto::new("M")
            .oneof("o")
            .field(FieldProto::repeated("a", 1, Kind::Int32).in_oneof(0));
        assert!(matches!(
            build_message("M", &proto),
            Err(BuildError::OneofMemberNotSingular { .. })
        ));
    }

    #[test]
    fn rejects_dangling_oneof_index() {
        let proto = MessageProto::new("M")
            .field(FieldProto::scalar("a", 1, Kind::Int32).in_oneof(3));
        assert!(matches!(
            build_message("M", &proto),
            Err(BuildError::BadOneofIndex { index: 3, .. })
        ));
    }

    #[test]
    fn rejects_message_field_without_type_name() {
        let proto = MessageProto::new("M")
            .field(FieldProto::base("m", 1, Kind::Message, Label::Optional));
        assert!(matches!(
            build_message("M", &proto),
            Err(BuildError::MissingTypeName { .. })
        ));
    }

    #[test]
    fn rejects_bad_map_key() {
        let proto =
            MessageProto::new("M").field(FieldProto::map("m", 1, Kind::Double, Kind::Int32));
        assert!(matches!(
            build_message("M", &proto),
            Err(BuildError::InvalidMapKey { .. })
        ));
    }

    #[test]
    fn oneof_insert_rejects_sibling_collisions() {
        let ctx = DefBuilder::new("M");
        let mut staged = ctx.oneofs_new_batch(&[OneofProto::new("o")]).unwrap();
        ctx.oneof_insert(&mut staged[0], 0, "a", 1).unwrap();
        assert!(matches!(
            ctx.oneof_insert(&mut staged[0], 1, "a", 2),
            Err(BuildError::OneofMemberNameCollision { .. })
        ));
        assert!(matches!(
            ctx.oneof_insert(&mut staged[0], 2, "b", 1),
            Err(BuildError::OneofMemberNumberCollision { .. })
        ));
        // The surviving member is still the only one registered.
        assert_eq!(staged[0].fields, vec![0]);
    }

    #[test]
    fn oneof_batch_rejects_duplicate_names() {
        let ctx = DefBuilder::new("M");
        assert!(matches!(
            ctx.oneofs_new_batch(&[OneofProto::new("o"), OneofProto::new("o")]),
            Err(BuildError::DuplicateOneofName { .. })
        ));
    }

    #[test]
    fn extension_must_be_singular() {
        let ext = FieldProto::repeated("e", 1000, Kind::Int32);
        assert!(matches!(
            build_extension("test.Sample", &ext),
            Err(BuildError::InvalidExtension { .. })
        ));
        let ok = FieldProto::optional("e", 1000, Kind::Int32);
        let fd = build_extension("test.Sample", &ok).unwrap();
        assert!(fd.is_extension());
        assert_eq!(fd.extendee(), Some("test.Sample"));
    }
}
