//! Core runtime for Cairn: typed stored objects, raw blob storage, and
//! secondary indexes layered over pluggable key-value backends.
//!
//! The engine is organized leaves-first:
//! - `value` / `types`: the primitive value tree and the type descriptors
//!   that validate, serialize, and deserialize it.
//! - `schema`: class descriptors binding attribute names to types,
//!   relations, and index declarations.
//! - `backend`: the narrow key-value contract the engine depends on, plus
//!   the bundled memory and directory backends.
//! - `store`: the object store with its identity cache, dirty tracking,
//!   scoped saves, and lazy relations.
//! - `raw`: blob storage with sibling data/meta records.
//! - `index`: derived reverse maps with incremental maintenance and rebuild.

pub mod backend;
pub mod clock;
pub mod error;
pub mod index;
pub mod oid;
pub mod raw;
pub mod record;
pub mod schema;
pub mod serialize;
pub mod store;
pub mod types;
pub mod value;

///
/// CONSTANTS
///

/// Attribute names that may never be declared as properties or relations.
///
/// These occupy fixed slots in every serialized record.
pub const RESERVED_ATTRIBUTES: [&str; 3] = ["type", "oid", "updates"];

/// Separator between the collection segment and the OID in storage keys.
pub const KEY_SEPARATOR: char = '/';

/// Suffix of the blob record of a stored raw.
pub const DATA_SUFFIX: &str = ".data";

/// Suffix of the metadata record of a stored raw.
pub const META_SUFFIX: &str = ".meta";

///
/// Prelude
///
/// Domain vocabulary only; backends and error plumbing are imported from
/// their modules directly.
///

pub mod prelude {
    pub use crate::{
        error::StorageError,
        index::{IndexManager, IndexQuery, Indexer, Order},
        oid::Oid,
        raw::{RawClass, RawClassDescriptor, RawObject, RawStore},
        record::{Record, RefStub},
        schema::{ClassDescriptor, RelationDef},
        store::{Class, Object, ObjectStore, RelationHandle},
        types::Type,
        value::Value,
    };
}
