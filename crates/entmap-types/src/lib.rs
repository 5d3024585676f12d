//! Storage-side types for entmap.
//!
//! This crate defines the shapes the storage layer speaks natively. Every
//! other entmap crate depends on `entmap-types`.
//!
//! # Key Types
//!
//! - [`Value`] -- Scalar leaf of an attribute tree
//! - [`Node`] -- Attribute tree: an indexed/unindexed leaf, a map, or a list
//! - [`Record`] -- A stored record: a key plus a root property map
//! - [`RawKey`] -- Hierarchical key (kind, id or name, optional parent chain)
//! - [`Key`] -- Typed wrapper around [`RawKey`]
//! - [`Blob`] -- Opaque byte payload

pub mod error;
pub mod key;
pub mod record;
pub mod value;

pub use error::TypeError;
pub use key::{Key, KeyId, RawKey};
pub use record::Record;
pub use value::{Blob, Node, Value};
