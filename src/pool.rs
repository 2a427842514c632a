//! Descriptor registry.
//!
//! A [`DescriptorPool`] owns every published [`MessageDescriptor`] and the
//! extension registry. Publication is atomic at file granularity: every
//! message in a [`FileProto`] builds, resolves, and links, or none of them
//! become visible. Once published, descriptors are immutable and shared by
//! reference for the life of the pool.

use std::collections::HashMap;
use std::sync::Arc;

use crate::arena::Arena;
use crate::base::Object;
use crate::builder::{self, BuildError, FieldProto, FileProto, MessageProto};
use crate::descriptor::{FieldDescriptor, Kind, MessageDescriptor};
use crate::reflection::DynMessage;

#[derive(Default)]
pub struct DescriptorPool {
    messages: Vec<Arc<MessageDescriptor>>,
    by_name: HashMap<Box<str>, usize>,
    extensions: HashMap<(Box<str>, u32), Arc<FieldDescriptor>>,
}

impl DescriptorPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and publishes every message in `file`, nested messages
    /// included. On any error the pool is left exactly as it was.
    pub fn add_file(&mut self, file: &FileProto) -> Result<(), BuildError> {
        let mut flat: Vec<(String, &MessageProto)> = Vec::new();
        for m in &file.messages {
            flatten(&file.package, m, &mut flat);
        }

        // Name collisions, against the pool and within the batch.
        let mut batch_names = HashMap::new();
        for (i, (name, _)) in flat.iter().enumerate() {
            if self.by_name.contains_key(name.as_str())
                || batch_names.insert(name.clone(), i).is_some()
            {
                return Err(BuildError::DuplicateMessage { name: name.clone() });
            }
        }

        let mut built = Vec::with_capacity(flat.len());
        for (name, proto) in &flat {
            built.push(Arc::new(builder::build_message(name, proto)?));
        }

        // Link sub-message references. Targets may live in this batch or
        // already in the pool; anything else fails the whole file.
        for msg in &built {
            for field in msg.fields() {
                if let Some(type_name) = field.type_name.as_deref() {
                    let target = self.lookup(&batch_names, &built, type_name).ok_or_else(|| {
                        BuildError::UnresolvedType {
                            field: field.name().to_string(),
                            type_name: type_name.to_string(),
                        }
                    })?;
                    let _ = field.message_type.set(Arc::downgrade(target));
                }
                if let Some(info) = field.map_info() {
                    if let Some(type_name) = info.value_type_name.as_deref() {
                        let target =
                            self.lookup(&batch_names, &built, type_name).ok_or_else(|| {
                                BuildError::UnresolvedType {
                                    field: field.name().to_string(),
                                    type_name: type_name.to_string(),
                                }
                            })?;
                        let _ = info.value_message.set(Arc::downgrade(target));
                    }
                }
            }
        }

        for msg in built {
            log::debug!(
                "published message `{}` ({} fields, {} bytes per instance)",
                msg.full_name(),
                msg.fields().len(),
                msg.instance_size()
            );
            self.by_name
                .insert(Box::from(msg.full_name()), self.messages.len());
            self.messages.push(msg);
        }
        Ok(())
    }

    fn lookup<'a>(
        &'a self,
        batch_names: &HashMap<String, usize>,
        built: &'a [Arc<MessageDescriptor>],
        name: &str,
    ) -> Option<&'a Arc<MessageDescriptor>> {
        if let Some(&i) = batch_names.get(name) {
            return Some(&built[i]);
        }
        self.by_name.get(name).map(|&i| &self.messages[i])
    }

    /// Registers an extension of `extendee`. Extensions must be singular
    /// and their number must be free: neither declared by the extendee nor
    /// claimed by a previously registered extension.
    pub fn register_extension(
        &mut self,
        extendee: &str,
        proto: &FieldProto,
    ) -> Result<Arc<FieldDescriptor>, BuildError> {
        let Some(extendee_desc) = self.find_message(extendee) else {
            return Err(BuildError::UnknownExtendee {
                name: proto.name.clone(),
                extendee: extendee.to_string(),
            });
        };
        let fd = builder::build_extension(extendee, proto)?;
        if extendee_desc.field_by_number(fd.number()).is_some() {
            return Err(BuildError::DuplicateFieldNumber {
                message: extendee.to_string(),
                number: fd.number(),
            });
        }
        if fd.kind() == Kind::Message {
            let type_name = fd.type_name.as_deref().unwrap();
            let target = self.by_name.get(type_name).map(|&i| &self.messages[i]).ok_or_else(
                || BuildError::UnresolvedType {
                    field: fd.name().to_string(),
                    type_name: type_name.to_string(),
                },
            )?;
            let _ = fd.message_type.set(Arc::downgrade(target));
        }
        let key = (Box::from(extendee), fd.number());
        if self.extensions.contains_key(&key) {
            return Err(BuildError::DuplicateExtension {
                extendee: extendee.to_string(),
                number: fd.number(),
            });
        }
        log::debug!("registered extension `{}` on `{}`", fd.name(), extendee);
        let fd = Arc::new(fd);
        self.extensions.insert(key, fd.clone());
        Ok(fd)
    }

    pub fn find_message(&self, full_name: &str) -> Option<&MessageDescriptor> {
        self.by_name.get(full_name).map(|&i| &*self.messages[i])
    }

    pub fn find_extension(&self, extendee: &str, number: u32) -> Option<&FieldDescriptor> {
        self.extensions
            .get(&(Box::from(extendee), number))
            .map(|fd| &**fd)
    }

    pub fn messages(&self) -> impl Iterator<Item = &MessageDescriptor> {
        self.messages.iter().map(|m| &**m)
    }

    /// Allocates a zeroed instance of `desc` in `arena` and wraps it for
    /// reflective access. Returns `None` when the arena is out of memory.
    pub fn new_message<'pool, 'msg>(
        &'pool self,
        desc: &'pool MessageDescriptor,
        arena: &mut Arena<'msg>,
    ) -> Option<DynMessage<'pool, 'msg>> {
        let object = Object::create(desc.instance_size(), arena)?;
        Some(DynMessage::new(object, desc))
    }
}

fn flatten<'a>(prefix: &str, proto: &'a MessageProto, out: &mut Vec<(String, &'a MessageProto)>) {
    let full_name = if prefix.is_empty() {
        proto.name.clone()
    } else {
        format!("{prefix}.{}", proto.name)
    };
    for nested in &proto.nested {
        flatten(&full_name, nested, out);
    }
    out.push((full_name, proto));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_file() -> FileProto {
        FileProto::new("demo").message(
            MessageProto::new("Node")
                .field(FieldProto::optional("value", 1, Kind::Int32))
                .field(FieldProto::repeated_message("children", 2, "demo.Node"))
                .nested(
                    MessageProto::new("Meta")
                        .field(FieldProto::scalar("tag", 1, Kind::String)),
                )
                .field(FieldProto::message("meta", 3, "demo.Node.Meta")),
        )
    }

    #[test]
    fn add_file_publishes_nested_and_links() {
        let mut pool = DescriptorPool::new();
        pool.add_file(&tree_file()).unwrap();

        let node = pool.find_message("demo.Node").unwrap();
        let meta = pool.find_message("demo.Node.Meta").unwrap();
        assert_eq!(meta.fields().len(), 1);

        // Self-reference and nested reference both resolve.
        let children = node.field_by_name("children").unwrap();
        assert_eq!(
            children.message_type().unwrap().full_name(),
            "demo.Node"
        );
        let meta_field = node.field_by_name("meta").unwrap();
        assert_eq!(
            meta_field.message_type().unwrap().full_name(),
            "demo.Node.Meta"
        );
    }

    #[test]
    fn add_file_is_atomic_on_unresolved_type() {
        let mut pool = DescriptorPool::new();
        let file = FileProto::new("demo")
            .message(MessageProto::new("Ok").field(FieldProto::scalar("a", 1, Kind::Int32)))
            .message(
                MessageProto::new("Bad")
                    .field(FieldProto::message("m", 1, "demo.DoesNotExist")),
            );
        assert!(matches!(
            pool.add_file(&file),
            Err(BuildError::UnresolvedType { .. })
        ));
        // Nothing from the failed file is visible.
        assert!(pool.find_message("demo.Ok").is_none());
        assert!(pool.find_message("demo.Bad").is_none());
    }

    #[test]
    fn add_file_rejects_duplicate_message() {
        let mut pool = DescriptorPool::new();
        pool.add_file(&tree_file()).unwrap();
        assert!(matches!(
            pool.add_file(&tree_file()),
            Err(BuildError::DuplicateMessage { .. })
        ));
    }

    #[test]
    fn cross_file_references_resolve() {
        let mut pool = DescriptorPool::new();
        pool.add_file(&tree_file()).unwrap();
        let other = FileProto::new("other")
            .message(MessageProto::new("Holder").field(FieldProto::message("n", 1, "demo.Node")));
        pool.add_file(&other).unwrap();
        let holder = pool.find_message("other.Holder").unwrap();
        assert_eq!(
            holder.field_by_name("n").unwrap().message_type().unwrap().full_name(),
            "demo.Node"
        );
    }

    #[test]
    fn extension_registry() {
        let mut pool = DescriptorPool::new();
        pool.add_file(&tree_file()).unwrap();

        let ext = FieldProto::optional("weight", 1000, Kind::Double);
        pool.register_extension("demo.Node", &ext).unwrap();
        let found = pool.find_extension("demo.Node", 1000).unwrap();
        assert!(found.is_extension());
        assert_eq!(found.extendee(), Some("demo.Node"));

        // Same (extendee, number) pair cannot be claimed twice.
        let again = FieldProto::optional("other", 1000, Kind::Int32);
        assert!(matches!(
            pool.register_extension("demo.Node", &again),
            Err(BuildError::DuplicateExtension { .. })
        ));
        // Unknown extendee is rejected up front.
        assert!(matches!(
            pool.register_extension("demo.Missing", &ext),
            Err(BuildError::UnknownExtendee { .. })
        ));
    }

    #[test]
    fn extension_cannot_shadow_declared_field_number() {
        let mut pool = DescriptorPool::new();
        pool.add_file(&tree_file()).unwrap();

        // demo.Node declares field number 1 ("value").
        let shadow = FieldProto::optional("shadow", 1, Kind::Int32);
        assert!(matches!(
            pool.register_extension("demo.Node", &shadow),
            Err(BuildError::DuplicateFieldNumber { number: 1, .. })
        ));
        assert!(pool.find_extension("demo.Node", 1).is_none());
    }

    #[test]
    fn extension_with_message_payload_links() {
        let mut pool = DescriptorPool::new();
        pool.add_file(&tree_file()).unwrap();
        let ext = FieldProto::message("extra", 1001, "demo.Node.Meta");
        let fd = pool.register_extension("demo.Node", &ext).unwrap();
        assert_eq!(fd.message_type().unwrap().full_name(), "demo.Node.Meta");
    }
}
