use crate::{
    error::StorageError,
    oid::Oid,
    record::RefStub,
    schema::RelationDef,
    store::{object::stamp, registry, Object},
    value::Value,
};

///
/// RelationHandle
///
/// Live view of one relation slot: an ordered, duplicate-free list of
/// `(class, oid)` stubs on the owning object. Mutations validate the target
/// class, stamp the attribute, and flip the owner's dirty flag; resolution
/// materializes stubs through the target class's store on demand.
///

pub struct RelationHandle {
    object: Object,
    name: String,
    def: RelationDef,
}

impl RelationHandle {
    pub(crate) fn new(object: Object, name: String, def: RelationDef) -> Self {
        Self { object, name, def }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_many(&self) -> bool {
        self.def.many
    }

    #[must_use]
    pub const fn target_class(&self) -> &'static str {
        self.def.target
    }

    /// Current stubs, in insertion order.
    #[must_use]
    pub fn stubs(&self) -> Vec<RefStub> {
        let state = self.object.shared.state.lock();
        state.relations.get(&self.name).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let state = self.object.shared.state.lock();
        state.relations.get(&self.name).map_or(0, Vec::len)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn has(&self, oid: &Oid) -> bool {
        let state = self.object.shared.state.lock();
        state
            .relations
            .get(&self.name)
            .is_some_and(|stubs| stubs.iter().any(|s| &s.oid == oid))
    }

    /// Append a member. Duplicates are suppressed; singular relations
    /// refuse a second member.
    pub fn add(&self, target: &Object) -> Result<(), StorageError> {
        self.add_stub(target.stub()?)
    }

    pub fn add_stub(&self, stub: RefStub) -> Result<(), StorageError> {
        self.check_class(&stub)?;
        self.mutate(|stubs, many| {
            if stubs.iter().any(|s| s.oid == stub.oid) {
                return Ok(false);
            }
            if !many && !stubs.is_empty() {
                return Err(StorageError::invalid_value(
                    "relation",
                    "singular relation already has a member; use set",
                ));
            }
            stubs.push(stub.clone());
            Ok(true)
        })
    }

    /// Drop a member; no-op when absent.
    pub fn remove(&self, target: &Object) -> Result<(), StorageError> {
        self.remove_oid(&target.stub()?.oid)
    }

    pub fn remove_oid(&self, oid: &Oid) -> Result<(), StorageError> {
        self.mutate(|stubs, _| {
            let before = stubs.len();
            stubs.retain(|s| &s.oid != oid);
            Ok(stubs.len() != before)
        })
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        self.mutate(|stubs, _| {
            let had = !stubs.is_empty();
            stubs.clear();
            Ok(had)
        })
    }

    /// Replace the whole membership.
    pub fn set(&self, targets: &[&Object]) -> Result<(), StorageError> {
        let mut stubs = Vec::with_capacity(targets.len());
        for target in targets {
            let stub = target.stub()?;
            self.check_class(&stub)?;
            if !stubs.iter().any(|s: &RefStub| s.oid == stub.oid) {
                stubs.push(stub);
            }
        }
        if !self.def.many && stubs.len() > 1 {
            return Err(StorageError::invalid_value(
                &self.name,
                "singular relation accepts at most one member",
            ));
        }
        self.replace(stubs)
    }

    /// Assign from a primitive value: a stub map, a list of stub maps, or
    /// null. This is what `Object::set` and `import` route through.
    pub fn assign(&self, value: &Value) -> Result<(), StorageError> {
        let mut stubs = Vec::new();
        match value {
            Value::Null => {}
            Value::Map(_) => stubs.push(self.stub_from_value(value)?),
            Value::List(items) => {
                for item in items {
                    let stub = self.stub_from_value(item)?;
                    if !stubs.iter().any(|s: &RefStub| s.oid == stub.oid) {
                        stubs.push(stub);
                    }
                }
            }
            other => {
                return Err(StorageError::invalid_value(
                    &self.name,
                    format!("expected stub, stub list, or null, got {}", other.type_name()),
                ));
            }
        }
        if !self.def.many && stubs.len() > 1 {
            return Err(StorageError::invalid_value(
                &self.name,
                "singular relation accepts at most one member",
            ));
        }
        self.replace(stubs)
    }

    /// Resolve members to live objects, preserving order. A dangling stub
    /// surfaces as `NotFound` on the pull that touches it.
    #[must_use]
    pub fn iter(&self) -> RelationIter {
        RelationIter {
            stubs: self.stubs().into_iter(),
        }
    }

    /// The nth resolved member.
    pub fn one(&self, index: usize) -> Result<Object, StorageError> {
        self.stubs().get(index).map_or_else(
            || {
                Err(StorageError::not_found(format!(
                    "{}.{}[{index}]",
                    self.object.class_name(),
                    self.name
                )))
            },
            resolve_stub,
        )
    }

    fn check_class(&self, stub: &RefStub) -> Result<(), StorageError> {
        if stub.class == self.def.target {
            Ok(())
        } else {
            Err(StorageError::RelationTypeMismatch {
                relation: self.name.clone(),
                expected: self.def.target.to_owned(),
                got: stub.class.clone(),
            })
        }
    }

    fn stub_from_value(&self, value: &Value) -> Result<RefStub, StorageError> {
        let entries = value.as_map().ok_or_else(|| {
            StorageError::invalid_value(
                &self.name,
                format!("expected a {{type, oid}} stub, got {}", value.type_name()),
            )
        })?;
        let class = entries
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(self.def.target);
        let oid = entries
            .get("oid")
            .and_then(Value::as_str)
            .ok_or_else(|| StorageError::invalid_value(&self.name, "stub is missing 'oid'"))?;
        let stub = RefStub::new(
            class,
            Oid::parse(oid).map_err(|e| StorageError::invalid_value(&self.name, e.to_string()))?,
        );
        self.check_class(&stub)?;
        Ok(stub)
    }

    fn mutate(
        &self,
        f: impl FnOnce(&mut Vec<RefStub>, bool) -> Result<bool, StorageError>,
    ) -> Result<(), StorageError> {
        let store = self.object.shared.store.clone();
        let _guard = store.shared.state.lock();
        let changed = {
            let mut state = self.object.shared.state.lock();
            let stubs = state.relations.entry(self.name.clone()).or_default();
            let changed = f(stubs, self.def.many)?;
            if changed {
                stamp(&mut state, &self.name);
                state.dirty = true;
            }
            changed
        };
        if changed {
            store.track_touched(&self.object.shared);
        }
        Ok(())
    }

    fn replace(&self, stubs: Vec<RefStub>) -> Result<(), StorageError> {
        self.mutate(move |slot, _| {
            *slot = stubs;
            Ok(true)
        })
    }
}

///
/// RelationIter
///

pub struct RelationIter {
    stubs: std::vec::IntoIter<RefStub>,
}

impl Iterator for RelationIter {
    type Item = Result<Object, StorageError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.stubs.next().map(|stub| resolve_stub(&stub))
    }
}

fn resolve_stub(stub: &RefStub) -> Result<Object, StorageError> {
    registry::resolve(&stub.class)?.get(&stub.oid)
}
