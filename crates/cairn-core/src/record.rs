use crate::{clock::Timestamp, oid::Oid, value::Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

///
/// RefStub
///
/// The at-rest form of a relation member: `(class, oid)`. Stubs never own
/// the target object and are resolved on demand.
///

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RefStub {
    #[serde(rename = "type")]
    pub class: String,
    pub oid: Oid,
}

impl RefStub {
    #[must_use]
    pub fn new(class: impl Into<String>, oid: Oid) -> Self {
        Self {
            class: class.into(),
            oid,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Map(BTreeMap::from([
            ("type".to_owned(), Value::Str(self.class.clone())),
            ("oid".to_owned(), Value::Str(self.oid.as_str().to_owned())),
        ]))
    }
}

///
/// RelationValue
///
/// Serialized form of one relation slot: a single optional stub for
/// singular relations, an ordered stub list for plural ones.
///

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RelationValue {
    One(Option<RefStub>),
    Many(Vec<RefStub>),
}

impl RelationValue {
    #[must_use]
    pub fn stubs(&self) -> Vec<RefStub> {
        match self {
            Self::One(None) => Vec::new(),
            Self::One(Some(stub)) => vec![stub.clone()],
            Self::Many(stubs) => stubs.clone(),
        }
    }
}

///
/// Record
///
/// The full serialized form of a stored object:
/// `{type, oid, properties, relations, updates}`.
///
/// Unknown top-level fields are tolerated on decode so future revisions can
/// carry additional bookkeeping (e.g. a revision counter) without breaking
/// older readers.
///

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "type")]
    pub class: String,
    pub oid: Oid,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Value>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub relations: BTreeMap<String, RelationValue>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub updates: BTreeMap<String, Timestamp>,
}

impl Record {
    /// Value of a property or the stub list of a relation, as indexers see
    /// them.
    #[must_use]
    pub fn attr(&self, name: &str) -> Option<Value> {
        if let Some(value) = self.properties.get(name) {
            return Some(value.clone());
        }
        self.relations.get(name).map(|rel| {
            Value::List(rel.stubs().iter().map(RefStub::to_value).collect())
        })
    }

    /// Time of the most recent save, as recorded under `updates["oid"]`.
    #[must_use]
    pub fn update_time(&self) -> Timestamp {
        self.updates.get("oid").copied().unwrap_or(Timestamp::EPOCH)
    }
}
