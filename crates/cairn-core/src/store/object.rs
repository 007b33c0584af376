use crate::{
    clock::Timestamp,
    error::StorageError,
    oid::Oid,
    record::{Record, RefStub, RelationValue},
    schema::ClassDescriptor,
    serialize,
    store::{registry, ObjectStore, RelationHandle},
    value::Value,
    RESERVED_ATTRIBUTES,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    sync::Arc,
};
use tracing::{debug, warn};

///
/// ObjectShared
///

pub(crate) struct ObjectShared {
    pub(crate) descriptor: Arc<ClassDescriptor>,
    pub(crate) store: ObjectStore,
    pub(crate) state: Mutex<ObjectState>,
}

pub(crate) struct ObjectState {
    pub oid: Option<Oid>,
    pub properties: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, Vec<RefStub>>,
    pub updates: BTreeMap<String, Timestamp>,
    pub dirty: bool,
    pub loaded: bool,
}

impl ObjectShared {
    /// Fresh, unsaved instance. The `oid` update slot starts at zero so
    /// "never saved" is observable.
    pub(crate) fn fresh(
        store: ObjectStore,
        descriptor: Arc<ClassDescriptor>,
        oid: Option<Oid>,
    ) -> Arc<Self> {
        Arc::new(Self {
            descriptor,
            store,
            state: Mutex::new(ObjectState {
                oid,
                properties: BTreeMap::new(),
                relations: BTreeMap::new(),
                updates: BTreeMap::from([("oid".to_owned(), Timestamp::EPOCH)]),
                dirty: true,
                loaded: false,
            }),
        })
    }

    pub(crate) fn restored(
        store: ObjectStore,
        descriptor: Arc<ClassDescriptor>,
        oid: Oid,
        properties: BTreeMap<String, Value>,
        relations: BTreeMap<String, Vec<RefStub>>,
        mut updates: BTreeMap<String, Timestamp>,
    ) -> Arc<Self> {
        updates.entry("oid".to_owned()).or_insert(Timestamp::EPOCH);
        Arc::new(Self {
            descriptor,
            store,
            state: Mutex::new(ObjectState {
                oid: Some(oid),
                properties,
                relations,
                updates,
                dirty: false,
                loaded: true,
            }),
        })
    }
}

///
/// Object
///
/// Handle on one stored object. Clones share state; identity follows the
/// shared allocation, so two handles from the same cache entry compare
/// identical under [`Object::same_identity`].
///

#[derive(Clone)]
pub struct Object {
    pub(crate) shared: Arc<ObjectShared>,
}

impl Object {
    pub(crate) fn from_shared(shared: Arc<ObjectShared>) -> Self {
        Self { shared }
    }

    #[must_use]
    pub fn class_name(&self) -> &'static str {
        self.shared.descriptor.name()
    }

    #[must_use]
    pub fn oid(&self) -> Option<Oid> {
        self.shared.state.lock().oid.clone()
    }

    /// Whether two handles point at the same live instance.
    #[must_use]
    pub fn same_identity(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.shared.state.lock().dirty
    }

    /// Modification time of an attribute; `"oid"` is the last-save time.
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

    /// Reference stub for this object; requires an allocated OID.
    pub fn stub(&self) -> Result<RefStub, StorageError> {
        let state = self.shared.state.lock();
        let oid = state.oid.clone().ok_or_else(|| {
            StorageError::invalid_value("oid", "object has no oid yet; save it first")
        })?;
        Ok(RefStub::new(self.shared.descriptor.name(), oid))
    }

    // ------------------------------------------------------------------
    // attribute access
    // ------------------------------------------------------------------

    /// Validated assignment of one property or relation.
    pub fn set(&self, attr: &str, value: &Value) -> Result<(), StorageError> {
        if RESERVED_ATTRIBUTES.contains(&attr) {
            return Err(StorageError::ReservedProperty {
                name: attr.to_owned(),
            });
        }
        let descriptor = Arc::clone(&self.shared.descriptor);
        if let Some(ty) = descriptor.property(attr) {
            let canonical = ty.validate_at(attr, value)?;
            let _guard = self.shared.store.shared.state.lock();
            {
                let mut state = self.shared.state.lock();
                state.properties.insert(attr.to_owned(), canonical);
                stamp(&mut state, attr);
                state.dirty = true;
            }
            self.shared.store.track_touched(&self.shared);
            Ok(())
        } else if descriptor.relation(attr).is_some() {
            self.relation(attr)?.assign(value)
        } else {
            Err(StorageError::UnknownProperty {
                class: descriptor.name().to_owned(),
                name: attr.to_owned(),
            })
        }
    }

    /// Value of a property, if set.
    pub fn get(&self, attr: &str) -> Result<Option<Value>, StorageError> {
        let descriptor = &self.shared.descriptor;
        if descriptor.property(attr).is_some() {
            Ok(self.shared.state.lock().properties.get(attr).cloned())
        } else if descriptor.relation(attr).is_some() {
            Err(StorageError::invalid_value(
                attr,
                "attribute is a relation; use relation()",
            ))
        } else {
            Err(StorageError::UnknownProperty {
                class: descriptor.name().to_owned(),
                name: attr.to_owned(),
            })
        }
    }

    /// Handle on a declared relation.
    pub fn relation(&self, attr: &str) -> Result<RelationHandle, StorageError> {
        let descriptor = &self.shared.descriptor;
        descriptor.relation(attr).map_or_else(
            || {
                Err(StorageError::UnknownProperty {
                    class: descriptor.name().to_owned(),
                    name: attr.to_owned(),
                })
            },
            |def| Ok(RelationHandle::new(self.clone(), attr.to_owned(), def.clone())),
        )
    }

    /// Apply several validated assignments; stamps each attribute and marks
    /// dirty, but does not save.
    pub fn update(&self, values: &Value) -> Result<(), StorageError> {
        let Value::Map(entries) = values else {
            return Err(StorageError::invalid_value(
                "update",
                format!("expected a map, got {}", values.type_name()),
            ));
        };
        for (name, value) in entries {
            if name == "updates" {
                self.merge_updates(value)?;
            } else {
                self.set(name, value)?;
            }
        }
        Ok(())
    }

    /// Max-merge externally supplied update stamps.
    pub(crate) fn merge_updates(&self, value: &Value) -> Result<(), StorageError> {
        let Value::Map(entries) = value else {
            return Err(StorageError::invalid_value(
                "updates",
                format!("expected a map, got {}", value.type_name()),
            ));
        };
        let mut state = self.shared.state.lock();
        for (name, stamp) in entries {
            let Some(millis) = stamp.as_i64().filter(|n| *n >= 0) else {
                return Err(StorageError::invalid_value(
                    format!("updates.{name}"),
                    "expected a non-negative integer timestamp",
                ));
            };
            #[expect(clippy::cast_sign_loss)]
            let incoming = Timestamp::from_millis(millis as u64);
            let slot = state.updates.entry(name.clone()).or_insert(Timestamp::EPOCH);
            *slot = (*slot).max(incoming);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // lifecycle
    // ------------------------------------------------------------------

    /// Persist this object. Idempotent when clean; allocates the OID on
    /// first save; notifies the attached index manager with the previous
    /// and new serialized forms.
    pub fn save(&self) -> Result<(), StorageError> {
        let store = self.shared.store.clone();
        let _guard = store.shared.state.lock();

        let (key, oid, now, record, first_registration) = {
            let mut state = self.shared.state.lock();
            if !state.dirty && state.loaded {
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
            let mut record = snapshot_record(&self.shared.descriptor, &state, oid.clone());
            record.updates.insert("oid".to_owned(), now);
            let key = self.shared.descriptor.storage_key(&oid);
            (key, oid, now, record, first)
        };

        if first_registration {
            store.cache_insert(key.clone(), &self.shared);
        }

        let previous = match store
            .backend()
            .get(&key)
            .map_err(|e| StorageError::backend(&key, e))?
        {
            Some(bytes) => match serialize::decode::<Record>(&bytes) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(key = %key, %err, "stored record is undecodable; treating as absent");
                    None
                }
            },
            None => None,
        };

        let bytes =
            serialize::encode(&record).map_err(|e| StorageError::backend(&key, e.into()))?;
        let write = if previous.is_some() {
            store.backend().update(&key, &bytes)
        } else {
            store.backend().add(&key, &bytes)
        };
        write.map_err(|e| StorageError::backend(&key, e))?;

        if let Some(manager) = store.index_manager() {
            manager.on_save(&self.shared.descriptor, previous.as_ref(), &record)?;
        }

        {
            let mut state = self.shared.state.lock();
            state.updates.insert("oid".to_owned(), now);
            state.dirty = false;
            state.loaded = true;
        }
        debug!(class = self.class_name(), oid = %oid, "saved");
        Ok(())
    }

    /// Delete the backend record, drop every index entry, and invalidate
    /// the cache slot. On backend failure the cache entry stays so the
    /// caller can retry.
    pub fn remove(&self) -> Result<(), StorageError> {
        let store = self.shared.store.clone();
        let _guard = store.shared.state.lock();

        let Some(oid) = self.oid() else {
            return Ok(());
        };
        let key = self.shared.descriptor.storage_key(&oid);

        let previous = store
            .backend()
            .get(&key)
            .map_err(|e| StorageError::backend(&key, e))?
            .and_then(|bytes| serialize::decode::<Record>(&bytes).ok());

        store
            .backend()
            .remove(&key)
            .map_err(|e| StorageError::backend(&key, e))?;

        if let (Some(manager), Some(record)) = (store.index_manager(), previous.as_ref()) {
            manager.on_remove(&self.shared.descriptor, record)?;
        }

        store.cache_remove(&key);
        self.shared.state.lock().loaded = false;
        debug!(class = self.class_name(), oid = %oid, "removed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // export
    // ------------------------------------------------------------------

    /// Primitive export. Depth 0 is the bare `{oid, type}` stub; depth 1
    /// adds properties and relation stubs; depth 2 replaces relation stubs
    /// with their targets' depth-1 exports, degrading revisits and dangling
    /// references back to stubs.
    #[must_use]
    pub fn export(&self, depth: u8) -> Value {
        let mut visited = BTreeSet::new();
        self.export_inner(depth.min(2), &mut visited)
    }

    fn export_inner(&self, depth: u8, visited: &mut BTreeSet<String>) -> Value {
        let descriptor = Arc::clone(&self.shared.descriptor);
        let (oid, properties, relations) = {
            let state = self.shared.state.lock();
            let properties: Vec<(String, Value)> = descriptor
                .properties()
                .filter_map(|(name, ty)| {
                    state
                        .properties
                        .get(name)
                        .map(|v| (name.to_owned(), ty.serialize(v)))
                })
                .collect();
            let relations: Vec<(String, bool, Vec<RefStub>)> = descriptor
                .relations()
                .map(|(name, def)| {
                    (
                        name.to_owned(),
                        def.many,
                        state.relations.get(name).cloned().unwrap_or_default(),
                    )
                })
                .collect();
            (state.oid.clone(), properties, relations)
        };

        let mut out = BTreeMap::from([(
            "type".to_owned(),
            Value::Str(descriptor.name().to_owned()),
        )]);
        if let Some(oid) = &oid {
            out.insert("oid".to_owned(), Value::Str(oid.as_str().to_owned()));
        }
        if depth == 0 {
            return Value::Map(out);
        }
        if let Some(oid) = &oid {
            visited.insert(descriptor.storage_key(oid));
        }

        for (name, value) in properties {
            out.insert(name, value);
        }
        for (name, many, stubs) in relations {
            let exported: Vec<Value> = stubs
                .iter()
                .map(|stub| self.export_member(stub, depth, visited))
                .collect();
            let value = if many {
                Value::List(exported)
            } else {
                exported.into_iter().next().unwrap_or(Value::Null)
            };
            out.insert(name, value);
        }
        Value::Map(out)
    }

    fn export_member(&self, stub: &RefStub, depth: u8, visited: &mut BTreeSet<String>) -> Value {
        if depth < 2 {
            return stub.to_value();
        }
        let resolved = registry::resolve(&stub.class)
            .and_then(|class| {
                let key = class.descriptor().storage_key(&stub.oid);
                if visited.contains(&key) {
                    Err(StorageError::not_found(key))
                } else {
                    class.get(&stub.oid)
                }
            });
        match resolved {
            Ok(target) => target.export_inner(1, visited),
            Err(_) => stub.to_value(),
        }
    }

    /// Current serialized form, when an OID has been allocated.
    pub(crate) fn record(&self) -> Option<Record> {
        let state = self.shared.state.lock();
        let oid = state.oid.clone()?;
        Some(snapshot_record(&self.shared.descriptor, &state, oid))
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        match &state.oid {
            Some(oid) => write!(f, "<obj:{} {oid}>", self.class_name()),
            None => write!(f, "<obj:{} unsaved>", self.class_name()),
        }
    }
}

/// Serialize the in-memory state into its record form.
fn snapshot_record(descriptor: &ClassDescriptor, state: &ObjectState, oid: Oid) -> Record {
    let properties = state
        .properties
        .iter()
        .map(|(name, value)| {
            let serialized = descriptor
                .property(name)
                .map_or_else(|| value.clone(), |ty| ty.serialize(value));
            (name.clone(), serialized)
        })
        .collect();
    let relations = descriptor
        .relations()
        .filter_map(|(name, def)| {
            state.relations.get(name).map(|stubs| {
                let value = if def.many {
                    RelationValue::Many(stubs.clone())
                } else {
                    RelationValue::One(stubs.first().cloned())
                };
                (name.to_owned(), value)
            })
        })
        .collect();
    Record {
        class: descriptor.name().to_owned(),
        oid,
        properties,
        relations,
        updates: state.updates.clone(),
    }
}

/// Stamp an attribute mutation, keeping stamps monotonic per attribute.
pub(crate) fn stamp(state: &mut ObjectState, attr: &str) {
    let now = Timestamp::now();
    let slot = state
        .updates
        .entry(attr.to_owned())
        .or_insert(Timestamp::EPOCH);
    *slot = (*slot).max(now);
}
