//! Cairn: an embedded object-storage engine.
//!
//! Three composable layers over pluggable key-value backends:
//! - a typed structured-object store with schema-declared properties and
//!   relations ([`ObjectStore`]);
//! - a binary blob store with separate data and metadata ([`RawStore`]);
//! - a secondary-index manager maintaining derived lookup tables
//!   ([`IndexManager`]).
//!
//! ## Crate layout
//! - `core`: the engine (values, type descriptors, schema, backends,
//!   stores, indexes).
//! - this facade re-exports the public surface and the `prelude`.

pub use cairn_core as core;

pub use cairn_core::{
    backend::{Backend, BackendError, Capability, DirectoryBackend, MemoryBackend},
    clock::Timestamp,
    error::StorageError,
    index::{IndexManager, IndexQuery, Indexer, Order},
    oid::Oid,
    raw::{RawClass, RawClassDescriptor, RawObject, RawStore},
    record::{Record, RefStub},
    schema::{ClassDescriptor, RelationDef, SchemaError},
    store::{Class, Object, ObjectStore, RelationHandle},
    types::Type,
    value::Value,
};

///
/// Prelude
///

pub mod prelude {
    pub use cairn_core::prelude::*;
}
