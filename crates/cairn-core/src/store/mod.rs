//! The object store: identity cache, dirty tracking, scoped saves.
//!
//! One reentrant lock per store covers the identity cache, the scope state,
//! and calls into the backend; public operations acquire it first and take
//! per-object locks second, never the other way around. Index updates take
//! the index manager's own lock after the store lock (see `index`).
//!
//! The identity cache is weak-valued: while any strong reference to an
//! object is held, lookups return that same instance; once the last handle
//! drops, the entry dies and a later lookup reloads an equal object.

mod object;
pub(crate) mod registry;
mod relation;

pub use object::Object;
pub use relation::{RelationHandle, RelationIter};

pub(crate) use object::ObjectShared;

use crate::{
    backend::Backend,
    clock::Timestamp,
    error::StorageError,
    index::{IndexManager, IndexQuery, IndexShared},
    oid::Oid,
    record::Record,
    schema::ClassDescriptor,
    serialize,
    value::Value,
};
use parking_lot::ReentrantMutex;
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap},
    sync::{Arc, Weak},
};
use tracing::warn;

///
/// StoreShared
///

pub(crate) struct StoreShared {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) state: ReentrantMutex<RefCell<StoreState>>,
}

pub(crate) struct StoreState {
    classes: HashMap<&'static str, Arc<ClassDescriptor>>,
    cache: HashMap<String, Weak<ObjectShared>>,
    scope: Option<Vec<Weak<ObjectShared>>>,
    indexes: Option<Weak<IndexShared>>,
}

///
/// ObjectStore
///
/// Hosts registered classes over one backend. Cheap to clone; all clones
/// share cache, scope, and lock.
///

#[derive(Clone)]
pub struct ObjectStore {
    pub(crate) shared: Arc<StoreShared>,
}

impl ObjectStore {
    #[must_use]
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_backend(Arc::new(backend))
    }

    #[must_use]
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            shared: Arc::new(StoreShared {
                backend,
                state: ReentrantMutex::new(RefCell::new(StoreState {
                    classes: HashMap::new(),
                    cache: HashMap::new(),
                    scope: None,
                    indexes: None,
                })),
            }),
        }
    }

    pub(crate) fn from_shared(shared: Arc<StoreShared>) -> Self {
        Self { shared }
    }

    /// Bind a class descriptor to this store, returning its handle.
    pub fn register(&self, descriptor: ClassDescriptor) -> Result<Class, StorageError> {
        let descriptor = Arc::new(descriptor);
        let guard = self.shared.state.lock();
        {
            let mut state = guard.borrow_mut();
            if state.classes.contains_key(descriptor.name()) {
                return Err(StorageError::AlreadyExists {
                    key: descriptor.name().to_owned(),
                });
            }
            state.classes.insert(descriptor.name(), Arc::clone(&descriptor));
        }
        registry::bind(&self.shared, &descriptor);
        Ok(Class::new(self.clone(), descriptor))
    }

    /// Handle for a previously registered class.
    pub fn class(&self, name: &str) -> Result<Class, StorageError> {
        let guard = self.shared.state.lock();
        let descriptor = guard
            .borrow()
            .classes
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotRegistered {
                class: name.to_owned(),
            })?;
        Ok(Class::new(self.clone(), descriptor))
    }

    /// Names of every registered class.
    #[must_use]
    pub fn classes(&self) -> Vec<&'static str> {
        let guard = self.shared.state.lock();
        let state = guard.borrow();
        let mut names: Vec<&'static str> = state.classes.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Run `f` inside a scoped save block: dirty objects touched within are
    /// saved exactly once on exit. If a save fails, objects saved before the
    /// failure stay saved and the error names the offending key.
    pub fn scoped<T>(&self, f: impl FnOnce() -> T) -> Result<T, StorageError> {
        let guard = self.shared.state.lock();
        {
            let mut state = guard.borrow_mut();
            if state.scope.is_some() {
                return Err(StorageError::unsupported("nested scoped save blocks"));
            }
            state.scope = Some(Vec::new());
        }
        // Clear the scope even if `f` unwinds.
        struct ClearScope<'a>(&'a ReentrantMutex<RefCell<StoreState>>);
        impl Drop for ClearScope<'_> {
            fn drop(&mut self) {
                self.0.lock().borrow_mut().scope = None;
            }
        }
        let clear = ClearScope(&self.shared.state);

        let result = f();

        let touched = guard.borrow_mut().scope.take().unwrap_or_default();
        drop(clear);

        for weak in touched {
            if let Some(shared) = weak.upgrade() {
                let object = Object::from_shared(shared);
                if object.is_dirty() {
                    object.save()?;
                }
            }
        }
        Ok(result)
    }

    /// Flush the backend.
    pub fn sync(&self) -> Result<(), StorageError> {
        let _guard = self.shared.state.lock();
        self.shared
            .backend
            .sync()
            .map_err(|e| StorageError::backend("<sync>", e))
    }

    /// Drop dead identity-cache entries.
    pub fn sweep(&self) {
        let guard = self.shared.state.lock();
        guard
            .borrow_mut()
            .cache
            .retain(|_, weak| weak.upgrade().is_some());
    }

    /// Dump every stored record, keyed by storage key. Development aid; this
    /// reads the whole backend.
    pub fn export(&self) -> Result<Value, StorageError> {
        let _guard = self.shared.state.lock();
        let mut out = BTreeMap::new();
        let keys = self
            .shared
            .backend
            .keys("")
            .map_err(|e| StorageError::backend("<keys>", e))?;
        for key in keys {
            let Some(bytes) = self
                .shared
                .backend
                .get(&key)
                .map_err(|e| StorageError::backend(&key, e))?
            else {
                continue;
            };
            let value: Value =
                serialize::decode(&bytes).map_err(|e| StorageError::backend(&key, e.into()))?;
            out.insert(key, value);
        }
        Ok(Value::Map(out))
    }

    pub(crate) fn backend(&self) -> &Arc<dyn Backend> {
        &self.shared.backend
    }

    pub(crate) fn attach_index_manager(&self, manager: Weak<IndexShared>) {
        let guard = self.shared.state.lock();
        guard.borrow_mut().indexes = Some(manager);
    }

    pub(crate) fn index_manager(&self) -> Option<IndexManager> {
        let guard = self.shared.state.lock();
        let weak = guard.borrow().indexes.clone()?;
        weak.upgrade().map(IndexManager::from_shared)
    }

    /// Record a mutation for the active scope, if any.
    pub(crate) fn track_touched(&self, object: &Arc<ObjectShared>) {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        if let Some(scope) = state.scope.as_mut() {
            let weak = Arc::downgrade(object);
            if !scope.iter().any(|w| Weak::ptr_eq(w, &weak)) {
                scope.push(weak);
            }
        }
    }

    pub(crate) fn cache_insert(&self, key: String, object: &Arc<ObjectShared>) {
        let guard = self.shared.state.lock();
        guard.borrow_mut().cache.insert(key, Arc::downgrade(object));
    }

    pub(crate) fn cache_remove(&self, key: &str) {
        let guard = self.shared.state.lock();
        guard.borrow_mut().cache.remove(key);
    }

    fn cache_probe(&self, key: &str) -> Option<Arc<ObjectShared>> {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        match state.cache.get(key).and_then(Weak::upgrade) {
            Some(shared) => Some(shared),
            None => {
                state.cache.remove(key);
                None
            }
        }
    }
}

///
/// Class
///
/// Per-class entry points of a store: lookup, iteration, creation, import.
///

#[derive(Clone)]
pub struct Class {
    store: ObjectStore,
    descriptor: Arc<ClassDescriptor>,
}

impl std::fmt::Debug for Class {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Class")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}

impl Class {
    pub(crate) fn new(store: ObjectStore, descriptor: Arc<ClassDescriptor>) -> Self {
        Self { store, descriptor }
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<ClassDescriptor> {
        &self.descriptor
    }

    #[must_use]
    pub fn store(&self) -> &ObjectStore {
        &self.store
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        self.descriptor.name()
    }

    /// New unsaved instance; its OID is allocated at first save.
    #[must_use]
    pub fn create(&self) -> Object {
        let shared = ObjectShared::fresh(self.store.clone(), Arc::clone(&self.descriptor), None);
        self.store.track_touched(&shared);
        Object::from_shared(shared)
    }

    /// The live instance for `oid`, from cache or backend.
    pub fn get(&self, oid: &Oid) -> Result<Object, StorageError> {
        let key = self.descriptor.storage_key(oid);
        let _guard = self.store.shared.state.lock();
        if let Some(shared) = self.store.cache_probe(&key) {
            return Ok(Object::from_shared(shared));
        }
        let bytes = self
            .store
            .backend()
            .get(&key)
            .map_err(|e| StorageError::backend(&key, e))?
            .ok_or_else(|| StorageError::not_found(&key))?;
        let record: Record =
            serialize::decode(&bytes).map_err(|e| StorageError::backend(&key, e.into()))?;
        let shared = self.materialize(record)?;
        self.store.cache_insert(key, &shared);
        Ok(Object::from_shared(shared))
    }

    pub fn has(&self, oid: &Oid) -> Result<bool, StorageError> {
        let key = self.descriptor.storage_key(oid);
        let _guard = self.store.shared.state.lock();
        if self.store.cache_probe(&key).is_some() {
            return Ok(true);
        }
        self.store
            .backend()
            .has(&key)
            .map_err(|e| StorageError::backend(&key, e))
    }

    /// The instance for `oid`, creating an unsaved one if missing.
    pub fn ensure(&self, oid: &Oid) -> Result<Object, StorageError> {
        let _guard = self.store.shared.state.lock();
        match self.get(oid) {
            Ok(object) => Ok(object),
            Err(err) if err.is_not_found() => {
                let shared = ObjectShared::fresh(
                    self.store.clone(),
                    Arc::clone(&self.descriptor),
                    Some(oid.clone()),
                );
                self.store
                    .cache_insert(self.descriptor.storage_key(oid), &shared);
                self.store.track_touched(&shared);
                Ok(Object::from_shared(shared))
            }
            Err(err) => Err(err),
        }
    }

    /// Storage keys of this class, optionally narrowed by an OID prefix.
    pub fn keys(&self, prefix: Option<&str>) -> Result<Vec<String>, StorageError> {
        let full = match prefix {
            Some(p) => format!("{}{p}", self.descriptor.storage_prefix()),
            None => self.descriptor.storage_prefix(),
        };
        let _guard = self.store.shared.state.lock();
        self.store
            .backend()
            .keys(&full)
            .map_err(|e| StorageError::backend(&full, e))
    }

    /// Lazy iteration over every stored object of this class, in key order.
    pub fn all(&self) -> Result<ObjectIter, StorageError> {
        Ok(ObjectIter {
            class: self.clone(),
            keys: self.keys(None)?.into_iter(),
            since: None,
        })
    }

    /// Like [`Class::all`], but only objects saved after `since`.
    pub fn all_since(&self, since: Timestamp) -> Result<ObjectIter, StorageError> {
        Ok(ObjectIter {
            class: self.clone(),
            keys: self.keys(None)?.into_iter(),
            since: Some(since),
        })
    }

    /// Window over the class in stable key order.
    pub fn list(
        &self,
        count: Option<usize>,
        start: usize,
        end: Option<usize>,
    ) -> Result<Vec<Object>, StorageError> {
        let keys = self.keys(None)?;
        let end = end
            .or_else(|| count.map(|c| start.saturating_add(c)))
            .unwrap_or(keys.len())
            .min(keys.len());
        let mut out = Vec::new();
        for key in keys.get(start..end).unwrap_or_default() {
            out.push(self.get(&oid_of(key, &self.descriptor)?)?);
        }
        Ok(out)
    }

    /// Number of stored objects of this class.
    pub fn count(&self) -> Result<usize, StorageError> {
        Ok(self.keys(None)?.len())
    }

    /// Build an instance from a primitive export. Validates; does not save.
    /// If the export carries an `oid` that is already stored, the stored
    /// object wins and is returned unchanged.
    pub fn import(&self, value: &Value) -> Result<Object, StorageError> {
        let Value::Map(entries) = value else {
            return Err(StorageError::invalid_value(
                "import",
                format!("expected a map, got {}", value.type_name()),
            ));
        };
        if let Some(ty) = entries.get("type").and_then(Value::as_str) {
            if ty != self.descriptor.name() {
                return Err(StorageError::invalid_value(
                    "type",
                    format!("expected '{}', got '{ty}'", self.descriptor.name()),
                ));
            }
        }
        let oid = match entries.get("oid").and_then(Value::as_str) {
            Some(s) => Some(
                Oid::parse(s).map_err(|e| StorageError::invalid_value("oid", e.to_string()))?,
            ),
            None => None,
        };

        let _guard = self.store.shared.state.lock();
        if let Some(oid) = &oid {
            match self.get(oid) {
                Ok(existing) => return Ok(existing),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }

        let shared =
            ObjectShared::fresh(self.store.clone(), Arc::clone(&self.descriptor), oid.clone());
        let object = Object::from_shared(Arc::clone(&shared));
        for (name, item) in entries {
            match name.as_str() {
                "type" | "oid" => {}
                "updates" => object.merge_updates(item)?,
                _ => object.set(name, item)?,
            }
        }
        if let Some(oid) = &oid {
            self.store
                .cache_insert(self.descriptor.storage_key(oid), &shared);
        }
        self.store.track_touched(&shared);
        Ok(object)
    }

    /// Query handle for a declared index; requires an attached manager.
    pub fn by(&self, index: &str) -> Result<IndexQuery, StorageError> {
        let Some(def) = self.descriptor.index(index) else {
            return Err(StorageError::UnknownProperty {
                class: self.descriptor.name().to_owned(),
                name: index.to_owned(),
            });
        };
        let manager = self.store.index_manager().ok_or_else(|| {
            StorageError::unsupported("index query without an attached index manager")
        })?;
        Ok(manager.query(self.clone(), def.name))
    }

    fn materialize(&self, record: Record) -> Result<Arc<ObjectShared>, StorageError> {
        let desc = &self.descriptor;
        let mut properties = BTreeMap::new();
        for (name, value) in &record.properties {
            match desc.property(name) {
                Some(ty) => {
                    properties.insert(name.clone(), ty.deserialize(value)?);
                }
                None => {
                    warn!(class = desc.name(), attr = %name, "dropping undeclared property");
                }
            }
        }
        let mut relations = BTreeMap::new();
        for (name, value) in &record.relations {
            if desc.relation(name).is_some() {
                relations.insert(name.clone(), value.stubs());
            } else {
                warn!(class = desc.name(), attr = %name, "dropping undeclared relation");
            }
        }
        Ok(ObjectShared::restored(
            self.store.clone(),
            Arc::clone(desc),
            record.oid,
            properties,
            relations,
            record.updates,
        ))
    }
}

///
/// ObjectIter
///
/// Lazily materializes objects; each pull touches the backend, and a
/// failing record surfaces on the pull that reads it.
///

pub struct ObjectIter {
    class: Class,
    keys: std::vec::IntoIter<String>,
    since: Option<Timestamp>,
}

impl Iterator for ObjectIter {
    type Item = Result<Object, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let key = self.keys.next()?;
            let oid = match oid_of(&key, &self.class.descriptor) {
                Ok(oid) => oid,
                Err(_) => {
                    warn!(key = %key, "skipping unparsable storage key");
                    continue;
                }
            };
            match self.class.get(&oid) {
                Ok(object) => {
                    if let Some(since) = self.since {
                        if object.update_time("oid") <= since {
                            continue;
                        }
                    }
                    return Some(Ok(object));
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

fn oid_of(key: &str, descriptor: &ClassDescriptor) -> Result<Oid, StorageError> {
    let prefix = descriptor.storage_prefix();
    let tail = key
        .strip_prefix(&prefix)
        .ok_or_else(|| StorageError::invalid_value("key", format!("key outside prefix: {key}")))?;
    Oid::parse(tail).map_err(|e| StorageError::invalid_value("key", e.to_string()))
}
