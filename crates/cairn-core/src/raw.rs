//! Raw blob storage: each stored raw is a pair of sibling records, an
//! opaque streamable `data` blob and a JSON-like `meta` record, kept under
//! `Collection/oid.data` and `Collection/oid.meta`. The two always move
//! together: removal deletes both.

use crate::{
    backend::{chunk_bytes, has_capability, Backend, Capability},
    clock::Timestamp,
    error::StorageError,
    oid::Oid,
    schema::{ClassDescriptor, SchemaError},
    serialize,
    types::Type,
    value::Value,
    DATA_SUFFIX, KEY_SEPARATOR, META_SUFFIX, RESERVED_ATTRIBUTES,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use parking_lot::{Mutex, ReentrantMutex};
use serde::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet, HashMap},
    path::PathBuf,
    sync::{Arc, Weak},
};
use tracing::debug;

///
/// RawClassDescriptor
///
/// Schema of a stored-raw class: a name, a collection prefix, and the
/// declared (typed) metadata attributes. Undeclared metadata keys are
/// allowed and stored as-is; declared ones are validated on write.
///

pub struct RawClassDescriptor {
    name: &'static str,
    collection: &'static str,
    attributes: BTreeMap<&'static str, Type>,
}

impl RawClassDescriptor {
    #[must_use]
    pub fn builder(name: &'static str) -> RawClassBuilder {
        RawClassBuilder {
            name,
            collection: None,
            attributes: Vec::new(),
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn collection(&self) -> &'static str {
        self.collection
    }

    #[must_use]
    pub fn attribute(&self, name: &str) -> Option<&Type> {
        self.attributes.get(name)
    }

    fn base_key(&self, oid: &Oid) -> String {
        format!("{}{}{}", self.collection, KEY_SEPARATOR, oid)
    }

    fn data_key(&self, oid: &Oid) -> String {
        format!("{}{DATA_SUFFIX}", self.base_key(oid))
    }

    fn meta_key(&self, oid: &Oid) -> String {
        format!("{}{META_SUFFIX}", self.base_key(oid))
    }

    fn prefix(&self) -> String {
        format!("{}{}", self.collection, KEY_SEPARATOR)
    }
}

///
/// RawClassBuilder
///

pub struct RawClassBuilder {
    name: &'static str,
    collection: Option<&'static str>,
    attributes: Vec<(&'static str, Type)>,
}

impl RawClassBuilder {
    #[must_use]
    pub const fn collection(mut self, collection: &'static str) -> Self {
        self.collection = Some(collection);
        self
    }

    #[must_use]
    pub fn attribute(mut self, name: &'static str, ty: Type) -> Self {
        self.attributes.push((name, ty));
        self
    }

    pub fn build(self) -> Result<RawClassDescriptor, SchemaError> {
        // Reuse the object-schema checks for names and reserved words.
        let probe = ClassDescriptor::builder(self.name);
        let probe = match self.collection {
            Some(c) => probe.collection(c),
            None => probe,
        };
        probe.build()?;

        let mut attributes = BTreeMap::new();
        for (name, ty) in self.attributes {
            if RESERVED_ATTRIBUTES.contains(&name) {
                return Err(SchemaError::ReservedAttribute {
                    name: name.to_owned(),
                });
            }
            if attributes.insert(name, ty).is_some() {
                return Err(SchemaError::DuplicateAttribute {
                    name: name.to_owned(),
                });
            }
        }
        Ok(RawClassDescriptor {
            name: self.name,
            collection: self.collection.unwrap_or(self.name),
            attributes,
        })
    }
}

///
/// RawRecord
///

#[derive(Serialize, Deserialize)]
struct RawRecord {
    #[serde(rename = "type")]
    class: String,
    oid: Oid,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    meta: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    updates: BTreeMap<String, Timestamp>,
}

///
/// RawStore
///

struct RawShared {
    backend: Arc<dyn Backend>,
    state: ReentrantMutex<RefCell<RawState>>,
}

struct RawState {
    classes: HashMap<&'static str, Arc<RawClassDescriptor>>,
    cache: HashMap<String, Weak<RawObjectShared>>,
}

#[derive(Clone)]
pub struct RawStore {
    shared: Arc<RawShared>,
}

impl RawStore {
    #[must_use]
    pub fn new(backend: impl Backend + 'static) -> Self {
        Self::with_backend(Arc::new(backend))
    }

    #[must_use]
    pub fn with_backend(backend: Arc<dyn Backend>) -> Self {
        Self {
            shared: Arc::new(RawShared {
                backend,
                state: ReentrantMutex::new(RefCell::new(RawState {
                    classes: HashMap::new(),
                    cache: HashMap::new(),
                })),
            }),
        }
    }

    pub fn register(&self, descriptor: RawClassDescriptor) -> Result<RawClass, StorageError> {
        let descriptor = Arc::new(descriptor);
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        if state.classes.contains_key(descriptor.name()) {
            return Err(StorageError::AlreadyExists {
                key: descriptor.name().to_owned(),
            });
        }
        state.classes.insert(descriptor.name(), Arc::clone(&descriptor));
        drop(state);
        Ok(RawClass {
            store: self.clone(),
            descriptor,
        })
    }

    pub fn class(&self, name: &str) -> Result<RawClass, StorageError> {
        let guard = self.shared.state.lock();
        let descriptor = guard
            .borrow()
            .classes
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotRegistered {
                class: name.to_owned(),
            })?;
        Ok(RawClass {
            store: self.clone(),
            descriptor,
        })
    }

    pub fn sync(&self) -> Result<(), StorageError> {
        let _guard = self.shared.state.lock();
        self.shared
            .backend
            .sync()
            .map_err(|e| StorageError::backend("<sync>", e))
    }

    /// Drop dead cache entries.
    pub fn sweep(&self) {
        let guard = self.shared.state.lock();
        guard
            .borrow_mut()
            .cache
            .retain(|_, weak| weak.upgrade().is_some());
    }

    fn cache_probe(&self, base_key: &str) -> Option<Arc<RawObjectShared>> {
        let guard = self.shared.state.lock();
        let mut state = guard.borrow_mut();
        match state.cache.get(base_key).and_then(Weak::upgrade) {
            Some(shared) => Some(shared),
            None => {
                state.cache.remove(base_key);
                None
            }
        }
    }

    fn cache_insert(&self, base_key: String, shared: &Arc<RawObjectShared>) {
        let guard = self.shared.state.lock();
        guard
            .borrow_mut()
            .cache
            .insert(base_key, Arc::downgrade(shared));
    }

    fn cache_remove(&self, base_key: &str) {
        let guard = self.shared.state.lock();
        guard.borrow_mut().cache.remove(base_key);
    }
}

///
/// RawClass
///

#[derive(Clone)]
pub struct RawClass {
    store: RawStore,
    descriptor: Arc<RawClassDescriptor>,
}

impl RawClass {
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.descriptor.name()
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<RawClassDescriptor> {
        &self.descriptor
    }

    /// New unsaved raw; OID allocated at first save.
    #[must_use]
    pub fn create(&self) -> RawObject {
        RawObject {
            shared: RawObjectShared::fresh(self.store.clone(), Arc::clone(&self.descriptor), None),
        }
    }

    pub fn get(&self, oid: &Oid) -> Result<RawObject, StorageError> {
        let base = self.descriptor.base_key(oid);
        let _guard = self.store.shared.state.lock();
        if let Some(shared) = self.store.cache_probe(&base) {
            return Ok(RawObject { shared });
        }

        let meta_key = self.descriptor.meta_key(oid);
        let data_key = self.descriptor.data_key(oid);
        let backend = &self.store.shared.backend;
        let meta_bytes = backend
            .get(&meta_key)
            .map_err(|e| StorageError::backend(&meta_key, e))?;
        if meta_bytes.is_none()
            && !backend
                .has(&data_key)
                .map_err(|e| StorageError::backend(&data_key, e))?
        {
            return Err(StorageError::not_found(base));
        }

        let record = match meta_bytes {
            Some(bytes) => serialize::decode::<RawRecord>(&bytes)
                .map_err(|e| StorageError::backend(&meta_key, e.into()))?,
            // Orphan data blob: synthesize an empty meta record for it.
            None => RawRecord {
                class: self.descriptor.name().to_owned(),
                oid: oid.clone(),
                meta: BTreeMap::new(),
                updates: BTreeMap::new(),
            },
        };

        let mut meta = BTreeMap::new();
        for (name, value) in &record.meta {
            let decoded = match self.descriptor.attribute(name) {
                Some(ty) => ty.deserialize(value)?,
                None => value.clone(),
            };
            meta.insert(name.clone(), decoded);
        }

        let shared = RawObjectShared::restored(
            self.store.clone(),
            Arc::clone(&self.descriptor),
            record.oid,
            meta,
            record.updates,
        );
        self.store.cache_insert(base, &shared);
        Ok(RawObject { shared })
    }

    pub fn has(&self, oid: &Oid) -> Result<bool, StorageError> {
        let base = self.descriptor.base_key(oid);
        let _guard = self.store.shared.state.lock();
        if self.store.cache_probe(&base).is_some() {
            return Ok(true);
        }
        let backend = &self.store.shared.backend;
        let meta_key = self.descriptor.meta_key(oid);
        if backend
            .has(&meta_key)
            .map_err(|e| StorageError::backend(&meta_key, e))?
        {
            return Ok(true);
        }
        let data_key = self.descriptor.data_key(oid);
        backend
            .has(&data_key)
            .map_err(|e| StorageError::backend(&data_key, e))
    }

    pub fn ensure(&self, oid: &Oid) -> Result<RawObject, StorageError> {
        let _guard = self.store.shared.state.lock();
        match self.get(oid) {
            Ok(raw) => Ok(raw),
            Err(err) if err.is_not_found() => {
                let shared = RawObjectShared::fresh(
                    self.store.clone(),
                    Arc::clone(&self.descriptor),
                    Some(oid.clone()),
                );
                self.store
                    .cache_insert(self.descriptor.base_key(oid), &shared);
                Ok(RawObject { shared })
            }
            Err(err) => Err(err),
        }
    }

    /// Distinct OIDs of this class, in key order.
    pub fn oids(&self) -> Result<Vec<Oid>, StorageError> {
        let prefix = self.descriptor.prefix();
        let _guard = self.store.shared.state.lock();
        let keys = self
            .store
            .shared
            .backend
            .keys(&prefix)
            .map_err(|e| StorageError::backend(&prefix, e))?;
        let mut out = BTreeSet::new();
        for key in keys {
            let base = key
                .strip_suffix(DATA_SUFFIX)
                .or_else(|| key.strip_suffix(META_SUFFIX));
            let Some(base) = base else { continue };
            if let Some(tail) = base.strip_prefix(&prefix) {
                if let Ok(oid) = Oid::parse(tail) {
                    out.insert(oid);
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    pub fn all(&self) -> Result<RawIter, StorageError> {
        Ok(RawIter {
            class: self.clone(),
            oids: self.oids()?.into_iter(),
        })
    }

    pub fn count(&self) -> Result<usize, StorageError> {
        Ok(self.oids()?.len())
    }

    pub fn list(
        &self,
        count: Option<usize>,
        start: usize,
        end: Option<usize>,
    ) -> Result<Vec<RawObject>, StorageError> {
        let oids = self.oids()?;
        let end = end
            .or_else(|| count.map(|c| start.saturating_add(c)))
            .unwrap_or(oids.len())
            .min(oids.len());
        let mut out = Vec::new();
        for oid in oids.get(start..end).unwrap_or_default() {
            out.push(self.get(oid)?);
        }
        Ok(out)
    }

    /// Build an instance from a primitive export, decoding an inline
    /// base64 `data` field if present. Storage wins for a known OID.
    pub fn import(&self, value: &Value) -> Result<RawObject, StorageError> {
        let Value::Map(entries) = value else {
            return Err(StorageError::invalid_value(
                "import",
                format!("expected a map, got {}", value.type_name()),
            ));
        };
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
            RawObjectShared::fresh(self.store.clone(), Arc::clone(&self.descriptor), oid.clone());
        let raw = RawObject { shared };
        for (name, item) in entries {
            match name.as_str() {
                "type" | "oid" | "updates" => {}
                "data" => {
                    let encoded = item.as_str().ok_or_else(|| {
                        StorageError::invalid_value("data", "expected base64 string")
                    })?;
                    let bytes = BASE64.decode(encoded).map_err(|e| {
                        StorageError::invalid_value("data", format!("bad base64: {e}"))
                    })?;
                    raw.set_data(bytes);
                }
                _ => raw.set_meta(name, item)?,
            }
        }
        if let Some(oid) = &oid {
            self.store
                .cache_insert(self.descriptor.base_key(oid), &raw.shared);
        }
        Ok(raw)
    }
}

///
/// RawIter
///

pub struct RawIter {
    class: RawClass,
    oids: std::vec::IntoIter<Oid>,
}

impl Iterator for RawIter {
    type Item = Result<RawObject, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.oids.next().map(|oid| self.class.get(&oid))
    }
}

///
/// RawObject
///

struct RawObjectShared {
    descriptor: Arc<RawClassDescriptor>,
    store: RawStore,
    state: Mutex<RawObjectState>,
}

struct RawObjectState {
    oid: Option<Oid>,
    meta: BTreeMap<String, Value>,
    updates: BTreeMap<String, Timestamp>,
    pending_data: Option<Vec<u8>>,
    data_changed: bool,
    dirty: bool,
    loaded: bool,
}

impl RawObjectShared {
    fn fresh(store: RawStore, descriptor: Arc<RawClassDescriptor>, oid: Option<Oid>) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            store,
            state: Mutex::new(RawObjectState {
                oid,
                meta: BTreeMap::new(),
                updates: BTreeMap::from([("oid".to_owned(), Timestamp::EPOCH)]),
                pending_data: None,
                data_changed: false,
                dirty: true,
                loaded: false,
            }),
        })
    }

    fn restored(
        store: RawStore,
        descriptor: Arc<RawClassDescriptor>,
        oid: Oid,
        meta: BTreeMap<String, Value>,
        mut updates: BTreeMap<String, Timestamp>,
    ) -> Arc<Self> {
        updates.entry("oid".to_owned()).or_insert(Timestamp::EPOCH);
        Arc::new(Self {
            descriptor,
            store,
            state: Mutex::new(RawObjectState {
                oid: Some(oid),
                meta,
                updates,
                pending_data: None,
                data_changed: false,
                dirty: false,
                loaded: true,
            }),
        })
    }
}

/// Lazily pulled chunks of a stored blob.
pub type DataChunks = Box<dyn Iterator<Item = Result<Vec<u8>, StorageError>> + Send>;

#[derive(Clone)]
pub struct RawObject {
    shared: Arc<RawObjectShared>,
}

impl RawObject {
    #[must_use]
    pub fn class_name(&self) -> &'static str {
        self.shared.descriptor.name()
    }

    #[must_use]
    pub fn oid(&self) -> Option<Oid> {
        self.shared.state.lock().oid.clone()
    }

    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    #[must_use]
    pub fn update_time(&self, attr: &str) -> Timestamp {
        self.shared
            .state
            .lock()
            .updates
            .get(attr)
            .copied()
            .unwrap_or(Timestamp::EPOCH)
    }

    // ------------------------------------------------------------------
    // metadata
    // ------------------------------------------------------------------

    #[must_use]
    pub fn meta(&self, name: &str) -> Option<Value> {
        self.shared.state.lock().meta.get(name).cloned()
    }

    #[must_use]
    pub fn meta_all(&self) -> BTreeMap<String, Value> {
        self.shared.state.lock().meta.clone()
    }

    /// Write one metadata field; declared attributes are validated.
    pub fn set_meta(&self, name: &str, value: &Value) -> Result<(), StorageError> {
        if RESERVED_ATTRIBUTES.contains(&name) || name == "data" {
            return Err(StorageError::ReservedProperty {
                name: name.to_owned(),
            });
        }
        let canonical = match self.shared.descriptor.attribute(name) {
            Some(ty) => ty.validate_at(name, value)?,
            None => value.clone(),
        };
        let mut state = self.shared.state.lock();
        state.meta.insert(name.to_owned(), canonical);
        stamp_raw(&mut state, "meta");
        state.dirty = true;
        Ok(())
    }

    /// Bulk metadata write.
    pub fn merge_meta(&self, values: &Value) -> Result<(), StorageError> {
        let Value::Map(entries) = values else {
            return Err(StorageError::invalid_value(
                "meta",
                format!("expected a map, got {}", values.type_name()),
            ));
        };
        for (name, value) in entries {
            self.set_meta(name, value)?;
        }
        Ok(())
    }

    pub fn clear_meta(&self) {
        let mut state = self.shared.state.lock();
        state.meta.clear();
        stamp_raw(&mut state, "meta");
        state.dirty = true;
    }

    // ------------------------------------------------------------------
    // data
    // ------------------------------------------------------------------

    /// Stage new blob content; written at the next save.
    pub fn set_data(&self, data: Vec<u8>) {
        let mut state = self.shared.state.lock();
        state.pending_data = Some(data);
        state.data_changed = true;
        stamp_raw(&mut state, "data");
        state.dirty = true;
    }

    /// Whether the blob was touched since load.
    #[must_use]
    pub fn has_data_changed(&self) -> bool {
        self.shared.state.lock().data_changed
    }

    /// Length of the staged blob, when one is held in memory.
    #[must_use]
    pub fn length(&self) -> Option<usize> {
        self.shared.state.lock().pending_data.as_ref().map(Vec::len)
    }

    /// Lazy chunked read of the blob. An empty or absent blob yields zero
    /// chunks.
    pub fn data(&self, chunk_size: usize) -> Result<DataChunks, StorageError> {
        if let Some(pending) = self.shared.state.lock().pending_data.clone() {
            let chunks = chunk_bytes(pending, chunk_size);
            return Ok(wrap_chunks(chunks, String::new()));
        }
        let Some(oid) = self.oid() else {
            return Ok(Box::new(std::iter::empty()));
        };
        let data_key = self.shared.descriptor.data_key(&oid);
        let _guard = self.shared.store.shared.state.lock();
        let backend = &self.shared.store.shared.backend;
        if !backend
            .has(&data_key)
            .map_err(|e| StorageError::backend(&data_key, e))?
        {
            return Ok(Box::new(std::iter::empty()));
        }
        let stream = backend
            .stream(&data_key, chunk_size)
            .map_err(|e| StorageError::backend(&data_key, e))?;
        Ok(wrap_chunks(stream, data_key))
    }

    /// Materialize the whole blob. Intended for small payloads.
    pub fn load_data(&self) -> Result<Vec<u8>, StorageError> {
        let mut out = Vec::new();
        for chunk in self.data(64 * 1024)? {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    /// Filesystem path of the blob; requires the backend to advertise the
    /// `Filesystem` capability.
    pub fn path(&self) -> Result<PathBuf, StorageError> {
        let backend = &self.shared.store.shared.backend;
        if !has_capability(backend.as_ref(), Capability::Filesystem) {
            return Err(StorageError::unsupported(
                "path() requires a backend with the Filesystem capability",
            ));
        }
        let oid = self.oid().ok_or_else(|| {
            StorageError::invalid_value("oid", "raw object has no oid yet; save it first")
        })?;
        let data_key = self.shared.descriptor.data_key(&oid);
        backend
            .path(&data_key)
            .map_err(|e| StorageError::backend(&data_key, e))
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Write the meta record, and the data record only when the blob was
    /// touched since load.
    pub fn save(&self) -> Result<(), StorageError> {
        let store = self.shared.store.clone();
        let _guard = store.shared.state.lock();

        let (oid, now, record, data, first) = {
            let mut state = self.shared.state.lock();
            if !state.dirty && !state.data_changed && state.loaded {
                return Ok(());
            }
            let (oid, first) = match &state.oid {
                Some(oid) => (oid.clone(), false),
                None => {
                    let oid = Oid::generate();
                    state.oid = Some(oid.clone());
                    (oid, true)
                }
            };
            let now = Timestamp::now();
            let mut meta = BTreeMap::new();
            for (name, value) in &state.meta {
                let serialized = self
                    .shared
                    .descriptor
                    .attribute(name)
                    .map_or_else(|| value.clone(), |ty| ty.serialize(value));
                meta.insert(name.clone(), serialized);
            }
            let mut updates = state.updates.clone();
            updates.insert("oid".to_owned(), now);
            let record = RawRecord {
                class: self.shared.descriptor.name().to_owned(),
                oid: oid.clone(),
                meta,
                updates,
            };
            let data = state.data_changed.then(|| state.pending_data.clone().unwrap_or_default());
            (oid, now, record, data, first)
        };

        if first {
            store.cache_insert(self.shared.descriptor.base_key(&oid), &self.shared);
        }

        let meta_key = self.shared.descriptor.meta_key(&oid);
        let bytes =
            serialize::encode(&record).map_err(|e| StorageError::backend(&meta_key, e.into()))?;
        store
            .shared
            .backend
            .update(&meta_key, &bytes)
            .map_err(|e| StorageError::backend(&meta_key, e))?;

        if let Some(data) = data {
            let data_key = self.shared.descriptor.data_key(&oid);
            store
                .shared
                .backend
                .update(&data_key, &data)
                .map_err(|e| StorageError::backend(&data_key, e))?;
        }

        {
            let mut state = self.shared.state.lock();
            state.updates.insert("oid".to_owned(), now);
            state.dirty = false;
            state.data_changed = false;
            state.pending_data = None;
            state.loaded = true;
        }
        debug!(class = self.class_name(), oid = %oid, "saved raw");
        Ok(())
    }

    /// Remove both sibling records. On backend failure the cache entry is
    /// left intact so the caller can retry.
    pub fn remove(&self) -> Result<(), StorageError> {
        let store = self.shared.store.clone();
        let _guard = store.shared.state.lock();
        let Some(oid) = self.oid() else {
            return Ok(());
        };
        let meta_key = self.shared.descriptor.meta_key(&oid);
        let data_key = self.shared.descriptor.data_key(&oid);
        store
            .shared
            .backend
            .remove(&meta_key)
            .map_err(|e| StorageError::backend(&meta_key, e))?;
        store
            .shared
            .backend
            .remove(&data_key)
            .map_err(|e| StorageError::backend(&data_key, e))?;
        store.cache_remove(&self.shared.descriptor.base_key(&oid));
        self.shared.state.lock().loaded = false;
        debug!(class = self.class_name(), oid = %oid, "removed raw");
        Ok(())
    }

    // ------------------------------------------------------------------
    // export
    // ------------------------------------------------------------------

    /// Primitive export: the `{oid, type}` stub at depth 0, metadata
    /// flattened in at depth 1 and above.
    #[must_use]
    pub fn export(&self, depth: u8) -> Value {
        Value::Map(self.export_fields(depth))
    }

    /// Export with the blob inlined base64-encoded. For small payloads and
    /// synchronization; large blobs should be streamed instead.
    pub fn export_with_data(&self) -> Result<Value, StorageError> {
        let mut out = self.export_fields(1);
        let data = self.load_data()?;
        out.insert("data".to_owned(), Value::Str(BASE64.encode(data)));
        Ok(Value::Map(out))
    }

    fn export_fields(&self, depth: u8) -> BTreeMap<String, Value> {
        let state = self.shared.state.lock();
        let mut out = BTreeMap::from([(
            "type".to_owned(),
            Value::Str(self.shared.descriptor.name().to_owned()),
        )]);
        if let Some(oid) = &state.oid {
            out.insert("oid".to_owned(), Value::Str(oid.as_str().to_owned()));
        }
        if depth > 0 {
            for (name, value) in &state.meta {
                let serialized = self
                    .shared
                    .descriptor
                    .attribute(name)
                    .map_or_else(|| value.clone(), |ty| ty.serialize(value));
                out.insert(name.clone(), serialized);
            }
        }
        out
    }
}

impl std::fmt::Debug for RawObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        match &state.oid {
            Some(oid) => write!(f, "<raw:{} {oid}>", self.class_name()),
            None => write!(f, "<raw:{} unsaved>", self.class_name()),
        }
    }
}

fn stamp_raw(state: &mut RawObjectState, attr: &str) {
    let now = Timestamp::now();
    let slot = state
        .updates
        .entry(attr.to_owned())
        .or_insert(Timestamp::EPOCH);
    *slot = (*slot).max(now);
}

fn wrap_chunks(
    chunks: crate::backend::ByteStream,
    key: String,
) -> DataChunks {
    Box::new(chunks.map(move |item| item.map_err(|e| StorageError::backend(&key, e))))
}
