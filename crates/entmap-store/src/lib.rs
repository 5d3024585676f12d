//! Record storage for entmap.
//!
//! The translation engine never performs I/O. This crate is the storage
//! collaborator it is written against: a keyed record store that returns
//! [`Record`](entmap_types::Record) attribute trees and completes incomplete
//! keys by allocating numeric ids.
//!
//! # Storage Backends
//!
//! All backends implement the [`Datastore`] trait:
//!
//! - [`InMemoryDatastore`] -- `HashMap`-based store for tests and embedding
//!
//! # Design Rules
//!
//! 1. A put with an incomplete key allocates an id; the completed key is returned.
//! 2. Allocated ids are unique within the store for its whole lifetime.
//! 3. Batch reads preserve request order; missing records are `None`.
//! 4. The store never interprets record contents.

pub mod error;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryDatastore;
pub use traits::Datastore;
