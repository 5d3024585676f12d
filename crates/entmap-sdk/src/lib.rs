//! Caller-facing mapper for entmap.
//!
//! Ties the translation engine to a datastore: entity registration,
//! `save`/`load`/`delete`, batched resolution of eager references and
//! query by polymorphic type. This is the main entry point for
//! applications embedding entmap.

pub mod config;
pub mod error;
pub mod loader;
pub mod mapper;

pub use config::MapperConfig;
pub use error::{MapperError, MapperResult};
pub use loader::{BatchLoader, LoadStats};
pub use mapper::Mapper;

// Re-export key types
pub use entmap_store::{Datastore, InMemoryDatastore};
pub use entmap_translate::{
    persist, Class, ClassBuilder, Entity, EntityMetadata, Field, HierarchyBuilder, Polymorphic,
    Ref, Registry, Subclass, TranslateConfig, TranslateError,
};
pub use entmap_types::{Key, Node, RawKey, Record, Value};
