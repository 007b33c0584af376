//! Secondary indexes: persisted reverse maps from derived keys to OID
//! lists, one bucket per `(class, index_name)`.
//!
//! The manager hooks object saves and removals to patch buckets
//! incrementally from the `(previous, new)` serialized forms; `rebuild`
//! drops and replays everything. Bucket mutations run under the manager's
//! own mutex, acquired strictly after the object store's lock; reads
//! release it before resolving objects, so queries never invert that
//! order.

mod indexer;
pub mod text;

pub use indexer::{Indexer, IndexerFn};

use crate::{
    backend::Backend,
    clock::Timestamp,
    error::StorageError,
    oid::Oid,
    record::Record,
    schema::ClassDescriptor,
    serialize,
    store::{Class, Object},
    KEY_SEPARATOR,
};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{Arc, Weak},
};
use tracing::{debug, warn};

/// Bucket recording the completion time of the last full rebuild.
const LAST_REBUILD_KEY: &str = "__index__/last_rebuild";

///
/// Order
///

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Order {
    Asc,
    Desc,
}

///
/// IndexShared
///

pub(crate) struct IndexShared {
    backend: Arc<dyn Backend>,
    state: Mutex<IndexState>,
}

struct IndexState {
    classes: BTreeMap<&'static str, Class>,
}

///
/// IndexManager
///
/// Maintains every declared index of the classes adopted into it. Each
/// logical index is persisted through the manager's backend under
/// `ClassName/index_name/encoded_key`.
///

#[derive(Clone)]
pub struct IndexManager {
    shared: Arc<IndexShared>,
}

impl IndexManager {
    #[must_use]
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_backend(Arc::new(backend))
    }

    #[must_use]
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            shared: Arc::new(IndexShared {
                backend,
                state: Mutex::new(IndexState {
                    classes: BTreeMap::new(),
                }),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<IndexShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn downgrade(&self) -> Weak<IndexShared> {
        Arc::downgrade(&self.shared)
    }

    /// Register a class and wire its store to notify this manager on save
    /// and removal.
    pub fn adopt(&self, class: &Class) {
        {
            let mut state = self.shared.state.lock();
            state.classes.insert(class.name(), class.clone());
        }
        class.store().attach_index_manager(self.downgrade());
    }

    /// Query handle for `(class, index_name)`.
    #[must_use]
    pub fn query(&self, class: Class, index: &'static str) -> IndexQuery {
        IndexQuery {
            manager: self.clone(),
            class,
            index,
        }
    }

    /// Completion time of the last full rebuild, if one ever ran.
    pub fn last_rebuild(&self) -> Result<Option<Timestamp>, StorageError> {
        let _state = self.shared.state.lock();
        match self
            .shared
            .backend
            .get(LAST_REBUILD_KEY)
            .map_err(|e| StorageError::backend(LAST_REBUILD_KEY, e))?
        {
            Some(bytes) => serialize::decode(&bytes)
                .map(Some)
                .map_err(|e| StorageError::backend(LAST_REBUILD_KEY, e.into())),
            None => Ok(None),
        }
    }

    /// Drop all buckets of the adopted classes and replay indexing over
    /// their stored objects. Returns the number of objects indexed.
    ///
    /// Not concurrent-safe with writers; callers must quiesce. Class scans
    /// happen before the manager locks, so the store-then-index lock order
    /// holds even here.
    pub fn rebuild(&self, sync: bool) -> Result<usize, StorageError> {
        let classes: Vec<Class> = {
            let state = self.shared.state.lock();
            state.classes.values().cloned().collect()
        };

        let mut snapshots: Vec<(Arc<ClassDescriptor>, Vec<Record>)> = Vec::new();
        for class in &classes {
            let mut records = Vec::new();
            for object in class.all()? {
                if let Some(record) = object?.record() {
                    records.push(record);
                }
            }
            snapshots.push((Arc::clone(class.descriptor()), records));
        }

        let state = self.shared.state.lock();
        for (descriptor, _) in &snapshots {
            for def in descriptor.indexes() {
                let prefix = bucket_prefix(descriptor.name(), def.name);
                let keys = self
                    .shared
                    .backend
                    .keys(&prefix)
                    .map_err(|e| StorageError::backend(&prefix, e))?;
                for key in keys {
                    self.shared
                        .backend
                        .remove(&key)
                        .map_err(|e| StorageError::backend(&key, e))?;
                }
            }
        }

        let mut indexed = 0;
        for (descriptor, records) in &snapshots {
            for record in records {
                for def in descriptor.indexes() {
                    for key in def.indexer.keys(def.name, record) {
                        self.bucket_insert(descriptor.name(), def.name, &key, &record.oid)?;
                    }
                }
                indexed += 1;
            }
        }

        let stamp = serialize::encode(&Timestamp::now())
            .map_err(|e| StorageError::backend(LAST_REBUILD_KEY, e.into()))?;
        self.shared
            .backend
            .update(LAST_REBUILD_KEY, &stamp)
            .map_err(|e| StorageError::backend(LAST_REBUILD_KEY, e))?;
        if sync {
            self.shared
                .backend
                .sync()
                .map_err(|e| StorageError::backend("<sync>", e))?;
        }
        drop(state);
        debug!(objects = indexed, "index rebuild complete");
        Ok(indexed)
    }

    // ------------------------------------------------------------------
    // store hooks
    // ------------------------------------------------------------------

    /// Diff the previous and new serialized forms and patch each declared
    /// index. The old key set is empty on first save.
    pub(crate) fn on_save(
        &self,
        descriptor: &ClassDescriptor,
        previous: Option<&Record>,
        new: &Record,
    ) -> Result<(), StorageError> {
        let _state = self.shared.state.lock();
        for def in descriptor.indexes() {
            let old_keys = previous
                .map(|r| def.indexer.keys(def.name, r))
                .unwrap_or_default();
            let new_keys = def.indexer.keys(def.name, new);
            for key in old_keys.difference(&new_keys) {
                self.bucket_remove(descriptor.name(), def.name, key, &new.oid)?;
            }
            for key in new_keys.difference(&old_keys) {
                self.bucket_insert(descriptor.name(), def.name, key, &new.oid)?;
            }
        }
        Ok(())
    }

    /// Drop the OID from every key of every index it appeared under.
    pub(crate) fn on_remove(
        &self,
        descriptor: &ClassDescriptor,
        record: &Record,
    ) -> Result<(), StorageError> {
        let _state = self.shared.state.lock();
        for def in descriptor.indexes() {
            for key in def.indexer.keys(def.name, record) {
                self.bucket_remove(descriptor.name(), def.name, &key, &record.oid)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // buckets
    // ------------------------------------------------------------------

    fn read_bucket(&self, key: &str) -> Result<Vec<Oid>, StorageError> {
        match self
            .shared
            .backend
            .get(key)
            .map_err(|e| StorageError::backend(key, e))?
        {
            Some(bytes) => {
                serialize::decode(&bytes).map_err(|e| StorageError::backend(key, e.into()))
            }
            None => Ok(Vec::new()),
        }
    }

    fn write_bucket(&self, key: &str, oids: &[Oid]) -> Result<(), StorageError> {
        if oids.is_empty() {
            return self
                .shared
                .backend
                .remove(key)
                .map_err(|e| StorageError::backend(key, e));
        }
        let bytes = serialize::encode(&oids).map_err(|e| StorageError::backend(key, e.into()))?;
        self.shared
            .backend
            .update(key, &bytes)
            .map_err(|e| StorageError::backend(key, e))
    }

    fn bucket_insert(
        &self,
        class: &str,
        index: &str,
        index_key: &str,
        oid: &Oid,
    ) -> Result<(), StorageError> {
        let key = bucket_key(class, index, index_key);
        let mut oids = self.read_bucket(&key)?;
        if !oids.contains(oid) {
            oids.push(oid.clone());
            self.write_bucket(&key, &oids)?;
        }
        Ok(())
    }

    fn bucket_remove(
        &self,
        class: &str,
        index: &str,
        index_key: &str,
        oid: &Oid,
    ) -> Result<(), StorageError> {
        let key = bucket_key(class, index, index_key);
        let mut oids = self.read_bucket(&key)?;
        let before = oids.len();
        oids.retain(|o| o != oid);
        if oids.len() == before {
            warn!(bucket = %key, oid = %oid, "index entry already absent");
            return Ok(());
        }
        self.write_bucket(&key, &oids)
    }

    fn bucket_oids(&self, class: &str, index: &str, index_key: &str) -> Result<Vec<Oid>, StorageError> {
        let _state = self.shared.state.lock();
        self.read_bucket(&bucket_key(class, index, index_key))
    }

    fn bucket_keys(&self, class: &str, index: &str) -> Result<Vec<String>, StorageError> {
        let _state = self.shared.state.lock();
        let prefix = bucket_prefix(class, index);
        let keys = self
            .shared
            .backend
            .keys(&prefix)
            .map_err(|e| StorageError::backend(&prefix, e))?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(unescape_key))
            .collect())
    }
}

///
/// IndexQuery
///
/// Read surface of one `(class, index_name)` bucket. Lookups preserve the
/// bucket's first-seen OID order; resolution happens lazily after the
/// manager's lock is released.
///

#[derive(Clone)]
pub struct IndexQuery {
    manager: IndexManager,
    class: Class,
    index: &'static str,
}

impl std::fmt::Debug for IndexQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexQuery")
            .field("class", &self.class)
            .field("index", &self.index)
            .finish()
    }
}

impl IndexQuery {
    /// Live objects indexed under `key`, in insertion order.
    pub fn get(&self, key: &str) -> Result<ResolveIter, StorageError> {
        Ok(ResolveIter {
            class: self.class.clone(),
            oids: self.oids(key)?.into_iter(),
        })
    }

    /// Raw OIDs indexed under `key`.
    pub fn oids(&self, key: &str) -> Result<Vec<Oid>, StorageError> {
        self.manager.bucket_oids(self.class.name(), self.index, key)
    }

    /// The nth object under `key`, or `NotFound`.
    pub fn one(&self, key: &str, index: usize) -> Result<Object, StorageError> {
        let oids = self.oids(key)?;
        let oid = oids.get(index).ok_or_else(|| {
            StorageError::not_found(format!(
                "{}.{}['{key}'][{index}]",
                self.class.name(),
                self.index
            ))
        })?;
        self.class.get(oid)
    }

    pub fn has(&self, key: &str) -> Result<bool, StorageError> {
        Ok(!self.oids(key)?.is_empty())
    }

    pub fn count(&self, key: &str) -> Result<usize, StorageError> {
        Ok(self.oids(key)?.len())
    }

    /// Every key of this bucket, decoded, in ascending order.
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.manager.bucket_keys(self.class.name(), self.index)
    }

    /// Paginated key iteration.
    pub fn list(
        &self,
        start: usize,
        end: Option<usize>,
        count: Option<usize>,
        order: Order,
    ) -> Result<Vec<String>, StorageError> {
        let mut keys = self.keys()?;
        if order == Order::Desc {
            keys.reverse();
        }
        let end = end
            .or_else(|| count.map(|c| start.saturating_add(c)))
            .unwrap_or(keys.len())
            .min(keys.len());
        Ok(keys.get(start..end).unwrap_or_default().to_vec())
    }
}

///
/// ResolveIter
///

pub struct ResolveIter {
    class: Class,
    oids: std::vec::IntoIter<Oid>,
}

impl Iterator for ResolveIter {
    type Item = Result<Object, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.oids.next().map(|oid| self.class.get(&oid))
    }
}

// ----------------------------------------------------------------------
// key encoding
// ----------------------------------------------------------------------

fn bucket_prefix(class: &str, index: &str) -> String {
    format!("{class}{KEY_SEPARATOR}{index}{KEY_SEPARATOR}")
}

fn bucket_key(class: &str, index: &str, index_key: &str) -> String {
    format!("{}{}", bucket_prefix(class, index), escape_key(index_key))
}

/// Escape separators so `keys(prefix)` scoping stays unambiguous.
fn escape_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for ch in key.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape_key(key: &str) -> String {
    key.replace("%2F", "/").replace("%25", "%")
}
