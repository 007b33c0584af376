//! Class descriptors: the registered schema for a model type.
//!
//! A descriptor binds attribute names to type descriptors, relation targets,
//! and index declarations. Descriptors are built once at startup through
//! [`ClassDescriptor::builder`] and bound to a store at registration time;
//! the store rejects writes that do not match them.

use crate::{index::Indexer, oid::Oid, types::Type, KEY_SEPARATOR, RESERVED_ATTRIBUTES};
use std::collections::BTreeMap;
use thiserror::Error as ThisError;

///
/// SchemaError
///

#[derive(Debug, ThisError)]
pub enum SchemaError {
    #[error("class name is empty")]
    EmptyClassName,

    #[error("invalid name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("'{name}' is a reserved attribute name")]
    ReservedAttribute { name: String },

    #[error("attribute '{name}' is declared more than once")]
    DuplicateAttribute { name: String },

    #[error("index '{name}' is declared more than once")]
    DuplicateIndex { name: String },

    #[error("range over non-numeric type {ty}")]
    NonNumericRange { ty: String },
}

///
/// RelationDef
///
/// A declared link to another class. `many` distinguishes plural relations
/// (ordered, duplicate-free stub lists) from singular ones (at most one
/// stub). The relation never owns the target object.
///

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationDef {
    pub target: &'static str,
    pub many: bool,
}

///
/// IndexDef
///

#[derive(Clone, Debug)]
pub struct IndexDef {
    pub name: &'static str,
    pub indexer: Indexer,
}

///
/// ClassDescriptor
///

#[derive(Clone, Debug)]
pub struct ClassDescriptor {
    name: &'static str,
    collection: &'static str,
    properties: BTreeMap<&'static str, Type>,
    relations: BTreeMap<&'static str, RelationDef>,
    indexes: Vec<IndexDef>,
}

impl ClassDescriptor {
    #[must_use]
    pub fn builder(name: &'static str) -> ClassBuilder {
        ClassBuilder {
            name,
            collection: None,
            properties: Vec::new(),
            relations: Vec::new(),
            indexes: Vec::new(),
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
    pub fn property(&self, name: &str) -> Option<&Type> {
        self.properties.get(name)
    }

    #[must_use]
    pub fn relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.get(name)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&'static str, &Type)> {
        self.properties.iter().map(|(k, v)| (*k, v))
    }

    pub fn relations(&self) -> impl Iterator<Item = (&'static str, &RelationDef)> {
        self.relations.iter().map(|(k, v)| (*k, v))
    }

    #[must_use]
    pub fn indexes(&self) -> &[IndexDef] {
        &self.indexes
    }

    #[must_use]
    pub fn index(&self, name: &str) -> Option<&IndexDef> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Backend key of an object of this class.
    #[must_use]
    pub fn storage_key(&self, oid: &Oid) -> String {
        format!("{}{}{}", self.collection, KEY_SEPARATOR, oid)
    }

    /// Prefix under which every object of this class is stored.
    #[must_use]
    pub fn storage_prefix(&self) -> String {
        format!("{}{}", self.collection, KEY_SEPARATOR)
    }

    #[must_use]
    pub fn declares(&self, attr: &str) -> bool {
        self.properties.contains_key(attr) || self.relations.contains_key(attr)
    }
}

///
/// ClassBuilder
///
/// Collects declarations and validates them as a whole in `build`, so
/// ordering of calls never matters.
///

pub struct ClassBuilder {
    name: &'static str,
    collection: Option<&'static str>,
    properties: Vec<(&'static str, Type)>,
    relations: Vec<(&'static str, RelationDef)>,
    indexes: Vec<IndexDef>,
}

impl ClassBuilder {
    /// Override the key-prefix; defaults to the class name.
    #[must_use]
    pub const fn collection(mut self, collection: &'static str) -> Self {
        self.collection = Some(collection);
        self
    }

    #[must_use]
    pub fn property(mut self, name: &'static str, ty: Type) -> Self {
        self.properties.push((name, ty));
        self
    }

    #[must_use]
    pub fn relation_one(mut self, name: &'static str, target: &'static str) -> Self {
        self.relations.push((name, RelationDef { target, many: false }));
        self
    }

    #[must_use]
    pub fn relation_many(mut self, name: &'static str, target: &'static str) -> Self {
        self.relations.push((name, RelationDef { target, many: true }));
        self
    }

    #[must_use]
    pub fn index(mut self, name: &'static str, indexer: Indexer) -> Self {
        self.indexes.push(IndexDef { name, indexer });
        self
    }

    pub fn build(self) -> Result<ClassDescriptor, SchemaError> {
        if self.name.is_empty() {
            return Err(SchemaError::EmptyClassName);
        }
        let collection = self.collection.unwrap_or(self.name);
        check_key_segment(self.name)?;
        check_key_segment(collection)?;

        let mut properties = BTreeMap::new();
        let mut relations = BTreeMap::new();

        for (name, ty) in self.properties {
            check_attribute(name)?;
            if properties.insert(name, ty).is_some() {
                return Err(SchemaError::DuplicateAttribute {
                    name: name.to_owned(),
                });
            }
        }
        for (name, def) in self.relations {
            check_attribute(name)?;
            if properties.contains_key(name) || relations.insert(name, def).is_some() {
                return Err(SchemaError::DuplicateAttribute {
                    name: name.to_owned(),
                });
            }
        }

        let mut seen = Vec::with_capacity(self.indexes.len());
        for def in &self.indexes {
            check_key_segment(def.name)?;
            if seen.contains(&def.name) {
                return Err(SchemaError::DuplicateIndex {
                    name: def.name.to_owned(),
                });
            }
            seen.push(def.name);
        }

        Ok(ClassDescriptor {
            name: self.name,
            collection,
            properties,
            relations,
            indexes: self.indexes,
        })
    }
}

fn check_attribute(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::InvalidName {
            name: name.to_owned(),
            reason: "empty".to_owned(),
        });
    }
    if RESERVED_ATTRIBUTES.contains(&name) {
        return Err(SchemaError::ReservedAttribute {
            name: name.to_owned(),
        });
    }
    Ok(())
}

fn check_key_segment(name: &str) -> Result<(), SchemaError> {
    if name.is_empty() {
        return Err(SchemaError::EmptyClassName);
    }
    if name.contains(KEY_SEPARATOR) || name.contains('.') {
        return Err(SchemaError::InvalidName {
            name: name.to_owned(),
            reason: "must not contain '/' or '.'".to_owned(),
        });
    }
    Ok(())
}
