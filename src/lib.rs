//! In-memory message runtime: arena-allocated message storage, immutable
//! schema descriptors, and schema-driven reflective access.
//!
//! The crate is built around three pieces:
//!
//! - [`arena::Arena`]: bump allocation with bulk free and arena fusion, so a
//!   whole message tree shares one lifetime no matter which arena each node
//!   came from.
//! - [`pool::DescriptorPool`]: immutable schema metadata, published
//!   atomically per file and shared by reference afterwards.
//! - [`reflection::DynMessage`]: field access driven entirely by the
//!   descriptor, with presence semantics per field (explicit hasbits,
//!   implicit non-default, oneof case tracking).
//!
//! ```
//! use protodyn::alloc::GLOBAL;
//! use protodyn::arena::Arena;
//! use protodyn::builder::{FieldProto, FileProto, MessageProto};
//! use protodyn::descriptor::Kind;
//! use protodyn::pool::DescriptorPool;
//! use protodyn::reflection::Value;
//!
//! let file = FileProto::new("demo").message(
//!     MessageProto::new("Event")
//!         .field(FieldProto::optional("id", 1, Kind::Int32))
//!         .field(FieldProto::scalar("label", 2, Kind::String)),
//! );
//! let mut pool = DescriptorPool::new();
//! pool.add_file(&file).unwrap();
//!
//! let desc = pool.find_message("demo.Event").unwrap();
//! let mut arena = Arena::new(&GLOBAL);
//! let mut event = pool.new_message(desc, &mut arena).unwrap();
//! let id = desc.field_by_name("id").unwrap();
//! assert!(event.set_field(id, Value::Int32(7), &mut arena));
//! assert!(event.has(id));
//! ```

pub mod alloc;
pub mod arena;
pub mod base;
pub mod builder;
pub mod containers;
pub mod descriptor;
pub mod pool;
pub mod reflection;
pub mod test_utils;

pub use alloc::Allocator;
pub use arena::Arena;
pub use builder::{BuildError, FieldProto, FileProto, Label, MessageProto, OneofProto};
pub use descriptor::{FieldDescriptor, Kind, MessageDescriptor, OneofDescriptor};
pub use pool::DescriptorPool;
pub use reflection::{DynMessage, DynMessageRef, FieldIter, MutableValue, Value};
