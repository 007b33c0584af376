//! Process-wide class → store binding.
//!
//! Relation stubs name their target by class, so resolving one needs a way
//! from a class name to the store that hosts it. Stores bind their classes
//! here at registration time; the binding is a convenience mirror of the
//! explicit `Class` handles and holds the store only weakly.

use crate::{
    error::StorageError,
    schema::ClassDescriptor,
    store::{Class, ObjectStore, StoreShared},
};
use parking_lot::RwLock;
use std::{
    collections::HashMap,
    sync::{Arc, OnceLock, Weak},
};

struct Binding {
    store: Weak<StoreShared>,
    descriptor: Arc<ClassDescriptor>,
}

static BINDINGS: OnceLock<RwLock<HashMap<&'static str, Binding>>> = OnceLock::new();

fn bindings() -> &'static RwLock<HashMap<&'static str, Binding>> {
    BINDINGS.get_or_init(|| RwLock::new(HashMap::new()))
}

pub(crate) fn bind(store: &Arc<StoreShared>, descriptor: &Arc<ClassDescriptor>) {
    let mut map = bindings().write();
    let name = descriptor.name();
    if let Some(previous) = map.get(name) {
        if previous.store.upgrade().is_some_and(|s| !Arc::ptr_eq(&s, store)) {
            tracing::warn!(class = name, "rebinding class to a different store");
        }
    }
    map.insert(
        name,
        Binding {
            store: Arc::downgrade(store),
            descriptor: Arc::clone(descriptor),
        },
    );
}

/// Resolve a class name to a live `Class` handle.
pub(crate) fn resolve(name: &str) -> Result<Class, StorageError> {
    let map = bindings().read();
    let binding = map.get(name).ok_or_else(|| StorageError::NotRegistered {
        class: name.to_owned(),
    })?;
    let shared = binding
        .store
        .upgrade()
        .ok_or_else(|| StorageError::NotRegistered {
            class: name.to_owned(),
        })?;
    Ok(Class::new(
        ObjectStore::from_shared(shared),
        Arc::clone(&binding.descriptor),
    ))
}
