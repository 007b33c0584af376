//! Type descriptors for stored-object properties.
//!
//! A descriptor is a closed sum of primitive, composite, and reference
//! shapes. Each exposes three operations:
//! - `validate`: coerce and canonicalize a value, or fail with the path of
//!   the offending node;
//! - `serialize`: map a validated value onto the wire-safe primitive tree;
//! - `deserialize`: the inverse; round-trip is an identity on validated
//!   values.


use crate::{error::StorageError, oid::Oid, schema::SchemaError, value::Value};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use std::collections::BTreeMap;
use time::{
    format_description::{well_known::Rfc3339, BorrowedFormatItem},
    macros::format_description,
    Date, OffsetDateTime, Time as TimeOfDay,
};

const DATE_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[year]-[month]-[day]");
const TIME_FORMAT: &[BorrowedFormatItem<'static>] = format_description!("[hour]:[minute]:[second]");

///
/// Type
///

#[derive(Clone, Debug, PartialEq)]
pub enum Type {
    Bool,
    Integer,
    Positive,
    Float,
    Number,
    String,
    Line,
    Email,
    Password,
    Url,
    Html,
    Markdown,
    RichText,
    Date,
    Time,
    DateTime,
    Binary,
    Any,
    List(Box<Type>),
    Tuple(Vec<Type>),
    OneOf(Vec<Type>),
    Map(BTreeMap<&'static str, Type>),
    Enum(Vec<&'static str>),
    Reference(&'static str),
    Range {
        lo: f64,
        hi: f64,
        ty: Box<Type>,
    },
}

impl Type {
    pub fn list(item: Self) -> Self {
        Self::List(Box::new(item))
    }

    pub fn tuple(items: impl IntoIterator<Item = Self>) -> Self {
        Self::Tuple(items.into_iter().collect())
    }

    pub fn one_of(alternatives: impl IntoIterator<Item = Self>) -> Self {
        Self::OneOf(alternatives.into_iter().collect())
    }

    pub fn map(fields: impl IntoIterator<Item = (&'static str, Self)>) -> Self {
        Self::Map(fields.into_iter().collect())
    }

    pub fn enumeration(labels: impl IntoIterator<Item = &'static str>) -> Self {
        Self::Enum(labels.into_iter().collect())
    }

    /// Inclusive numeric range over `ty`, which must itself be numeric.
    pub fn range(lo: f64, hi: f64, ty: Self) -> Result<Self, SchemaError> {
        if !matches!(ty, Self::Integer | Self::Positive | Self::Float | Self::Number) {
            return Err(SchemaError::NonNumericRange {
                ty: format!("{ty:?}"),
            });
        }
        Ok(Self::Range {
            lo,
            hi,
            ty: Box::new(ty),
        })
    }

    // ------------------------------------------------------------------
    // validate
    // ------------------------------------------------------------------

    /// Validate a value against this descriptor, returning the canonical
    /// form.
    pub fn validate(&self, value: &Value) -> Result<Value, StorageError> {
        self.validate_at("", value)
    }

    /// Validate with an explicit path prefix for error reporting.
    pub fn validate_at(&self, path: &str, value: &Value) -> Result<Value, StorageError> {
        match self {
            Self::Bool => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Str(s) if s.eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
                Value::Str(s) if s.eq_ignore_ascii_case("false") => Ok(Value::Bool(false)),
                other => Err(fail(path, format!("expected bool, got {}", other.type_name()))),
            },

            Self::Integer => integer_at(path, value),

            Self::Positive => {
                let canonical = integer_at(path, value)?;
                match canonical.as_i64() {
                    Some(n) if n >= 0 => Ok(canonical),
                    Some(n) => {
                        Err(fail(path, format!("expected non-negative integer, got {n}")))
                    }
                    None => Err(fail(path, "expected integer")),
                }
            }

            Self::Float => match value {
                Value::Float(f) => Ok(Value::Float(*f)),
                #[expect(clippy::cast_precision_loss)]
                Value::Int(n) => Ok(Value::Float(*n as f64)),
                Value::Str(s) => s
                    .parse::<f64>()
                    .map(Value::Float)
                    .map_err(|_| fail(path, format!("'{s}' is not a float"))),
                other => Err(fail(path, format!("expected float, got {}", other.type_name()))),
            },

            Self::Number => match value {
                Value::Int(n) => Ok(Value::Int(*n)),
                Value::Float(f) => Ok(Value::Float(*f)),
                Value::Str(s) => s
                    .parse::<i64>()
                    .map(Value::Int)
                    .or_else(|_| s.parse::<f64>().map(Value::Float))
                    .map_err(|_| fail(path, format!("'{s}' is not a number"))),
                other => Err(fail(path, format!("expected number, got {}", other.type_name()))),
            },

            Self::String | Self::Password | Self::Html | Self::Markdown | Self::RichText => {
                text_at(path, value).map(|s| Value::Str(s.to_owned()))
            }

            Self::Line => {
                let s = text_at(path, value)?;
                if s.contains('\n') || s.contains('\r') {
                    return Err(fail(path, "line must not contain newline characters"));
                }
                Ok(Value::Str(s.to_owned()))
            }

            Self::Email => {
                let s = text_at(path, value)?;
                validate_email(path, s)?;
                Ok(Value::Str(s.to_owned()))
            }

            Self::Url => {
                let s = text_at(path, value)?;
                if !(s.starts_with("http://") || s.starts_with("https://")) {
                    return Err(fail(
                        path,
                        format!("URL '{s}' must start with 'http://' or 'https://'"),
                    ));
                }
                Ok(Value::Str(s.to_owned()))
            }

            Self::Date => {
                let s = text_at(path, value)?;
                let date = Date::parse(s, DATE_FORMAT)
                    .map_err(|e| fail(path, format!("invalid date '{s}': {e}")))?;
                let canonical = date
                    .format(DATE_FORMAT)
                    .map_err(|e| fail(path, format!("date format error: {e}")))?;
                Ok(Value::Str(canonical))
            }

            Self::Time => {
                let s = text_at(path, value)?;
                let t = TimeOfDay::parse(s, TIME_FORMAT)
                    .map_err(|e| fail(path, format!("invalid time '{s}': {e}")))?;
                let canonical = t
                    .format(TIME_FORMAT)
                    .map_err(|e| fail(path, format!("time format error: {e}")))?;
                Ok(Value::Str(canonical))
            }

            Self::DateTime => {
                let s = text_at(path, value)?;
                let dt = OffsetDateTime::parse(s, &Rfc3339)
                    .map_err(|e| fail(path, format!("invalid datetime '{s}': {e}")))?;
                let canonical = dt
                    .format(&Rfc3339)
                    .map_err(|e| fail(path, format!("datetime format error: {e}")))?;
                Ok(Value::Str(canonical))
            }

            Self::Binary => match value {
                Value::Bytes(bytes) => Ok(Value::Bytes(bytes.clone())),
                Value::Str(s) => BASE64
                    .decode(s)
                    .map(Value::Bytes)
                    .map_err(|_| fail(path, "expected base64-encoded binary")),
                other => Err(fail(path, format!("expected bytes, got {}", other.type_name()))),
            },

            Self::Any => Ok(value.clone()),

            Self::List(item) => match value {
                Value::List(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for (i, v) in items.iter().enumerate() {
                        out.push(item.validate_at(&index_path(path, i), v)?);
                    }
                    Ok(Value::List(out))
                }
                other => Err(fail(path, format!("expected list, got {}", other.type_name()))),
            },

            Self::Tuple(items) => match value {
                Value::List(values) if values.len() == items.len() => {
                    let mut out = Vec::with_capacity(values.len());
                    for (i, (ty, v)) in items.iter().zip(values).enumerate() {
                        out.push(ty.validate_at(&index_path(path, i), v)?);
                    }
                    Ok(Value::List(out))
                }
                Value::List(values) => Err(fail(
                    path,
                    format!("expected {} elements, got {}", items.len(), values.len()),
                )),
                other => Err(fail(path, format!("expected tuple, got {}", other.type_name()))),
            },

            Self::OneOf(alternatives) => {
                for ty in alternatives {
                    if let Ok(v) = ty.validate_at(path, value) {
                        return Ok(v);
                    }
                }
                Err(fail(path, "no alternative matched"))
            }

            Self::Map(fields) => match value {
                Value::Map(entries) => {
                    let mut out = BTreeMap::new();
                    for (key, v) in entries {
                        let Some(ty) = fields.get(key.as_str()) else {
                            return Err(fail(
                                &child_path(path, key),
                                "key is not part of the declared map",
                            ));
                        };
                        out.insert(key.clone(), ty.validate_at(&child_path(path, key), v)?);
                    }
                    Ok(Value::Map(out))
                }
                other => Err(fail(path, format!("expected map, got {}", other.type_name()))),
            },

            Self::Enum(labels) => {
                let s = text_at(path, value)?;
                if labels.iter().any(|l| *l == s) {
                    Ok(Value::Str(s.to_owned()))
                } else {
                    Err(fail(path, format!("'{s}' is not one of {labels:?}")))
                }
            }

            Self::Reference(class) => validate_reference(path, class, value),

            Self::Range { lo, hi, ty } => {
                let canonical = ty.validate_at(path, value)?;
                let n = canonical
                    .as_f64()
                    .ok_or_else(|| fail(path, "range value is not numeric"))?;
                if n < *lo || n > *hi {
                    return Err(fail(path, format!("{n} is outside [{lo}, {hi}]")));
                }
                Ok(canonical)
            }
        }
    }

    // ------------------------------------------------------------------
    // serialize / deserialize
    // ------------------------------------------------------------------

    /// Map a validated value onto its wire-safe primitive form.
    #[must_use]
    pub fn serialize(&self, value: &Value) -> Value {
        match (self, value) {
            (Self::Binary, Value::Bytes(bytes)) => Value::Str(BASE64.encode(bytes)),
            (Self::List(item), Value::List(items)) => {
                Value::List(items.iter().map(|v| item.serialize(v)).collect())
            }
            (Self::Tuple(types), Value::List(items)) => Value::List(
                types
                    .iter()
                    .zip(items)
                    .map(|(ty, v)| ty.serialize(v))
                    .collect(),
            ),
            (Self::OneOf(alternatives), v) => alternatives
                .iter()
                .find(|ty| ty.validate(v).is_ok())
                .map_or_else(|| v.clone(), |ty| ty.serialize(v)),
            (Self::Map(fields), Value::Map(entries)) => Value::Map(
                entries
                    .iter()
                    .map(|(key, v)| {
                        let serialized = fields
                            .get(key.as_str())
                            .map_or_else(|| v.clone(), |ty| ty.serialize(v));
                        (key.clone(), serialized)
                    })
                    .collect(),
            ),
            (_, v) => v.clone(),
        }
    }

    /// Inverse of [`Type::serialize`].
    pub fn deserialize(&self, value: &Value) -> Result<Value, StorageError> {
        self.deserialize_at("", value)
    }

    fn deserialize_at(&self, path: &str, value: &Value) -> Result<Value, StorageError> {
        match (self, value) {
            (Self::Binary, Value::Str(s)) => BASE64
                .decode(s)
                .map(Value::Bytes)
                .map_err(|_| fail(path, "stored binary is not valid base64")),
            (Self::Binary, Value::Bytes(bytes)) => Ok(Value::Bytes(bytes.clone())),
            (Self::List(item), Value::List(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, v) in items.iter().enumerate() {
                    out.push(item.deserialize_at(&index_path(path, i), v)?);
                }
                Ok(Value::List(out))
            }
            (Self::Tuple(types), Value::List(items)) => {
                let mut out = Vec::with_capacity(items.len());
                for (i, (ty, v)) in types.iter().zip(items).enumerate() {
                    out.push(ty.deserialize_at(&index_path(path, i), v)?);
                }
                Ok(Value::List(out))
            }
            (Self::OneOf(alternatives), v) => {
                for ty in alternatives {
                    if let Ok(decoded) = ty.deserialize_at(path, v) {
                        if ty.validate_at(path, &decoded).is_ok() {
                            return Ok(decoded);
                        }
                    }
                }
                Ok(v.clone())
            }
            (Self::Map(fields), Value::Map(entries)) => {
                let mut out = BTreeMap::new();
                for (key, v) in entries {
                    let decoded = match fields.get(key.as_str()) {
                        Some(ty) => ty.deserialize_at(&child_path(path, key), v)?,
                        None => v.clone(),
                    };
                    out.insert(key.clone(), decoded);
                }
                Ok(Value::Map(out))
            }
            (_, v) => Ok(v.clone()),
        }
    }
}

// ----------------------------------------------------------------------
// helpers
// ----------------------------------------------------------------------

fn fail(path: &str, reason: impl Into<String>) -> StorageError {
    StorageError::InvalidValue {
        path: if path.is_empty() {
            "value".to_owned()
        } else {
            path.to_owned()
        },
        reason: reason.into(),
    }
}

fn child_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_owned()
    } else {
        format!("{path}.{key}")
    }
}

fn index_path(path: &str, i: usize) -> String {
    format!("{path}[{i}]")
}

fn text_at<'a>(path: &str, value: &'a Value) -> Result<&'a str, StorageError> {
    value
        .as_str()
        .ok_or_else(|| fail(path, format!("expected string, got {}", value.type_name())))
}

fn integer_at(path: &str, value: &Value) -> Result<Value, StorageError> {
    match value {
        Value::Int(n) => Ok(Value::Int(*n)),
        #[expect(clippy::cast_possible_truncation)]
        Value::Float(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
            Ok(Value::Int(*f as i64))
        }
        Value::Str(s) => s
            .parse::<i64>()
            .map(Value::Int)
            .map_err(|_| fail(path, format!("'{s}' is not an integer"))),
        other => Err(fail(path, format!("expected integer, got {}", other.type_name()))),
    }
}

/// Syntactic check only: one `@`, non-empty local part and domain, no
/// whitespace or control characters. Deliverability is out of scope.
fn validate_email(path: &str, s: &str) -> Result<(), StorageError> {
    let mut parts = s.split('@');
    let local = parts.next().unwrap_or_default();
    let domain = parts.next().unwrap_or_default();
    if parts.next().is_some() || local.is_empty() || domain.is_empty() {
        return Err(fail(path, format!("'{s}' is not a valid email address")));
    }
    if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(fail(path, format!("'{s}' contains whitespace")));
    }
    Ok(())
}

fn validate_reference(path: &str, class: &str, value: &Value) -> Result<Value, StorageError> {
    let Value::Map(entries) = value else {
        return Err(fail(
            path,
            format!("expected a {{type, oid}} reference, got {}", value.type_name()),
        ));
    };
    let ty = entries.get("type").and_then(Value::as_str);
    let oid = entries.get("oid").and_then(Value::as_str);
    match (ty, oid) {
        (Some(ty), Some(oid)) => {
            if ty != class {
                return Err(fail(
                    path,
                    format!("reference expects class '{class}', got '{ty}'"),
                ));
            }
            let oid = Oid::parse(oid).map_err(|e| fail(path, format!("bad reference oid: {e}")))?;
            Ok(Value::Map(BTreeMap::from([
                ("type".to_owned(), Value::Str(ty.to_owned())),
                ("oid".to_owned(), Value::Str(oid.as_str().to_owned())),
            ])))
        }
        _ => Err(fail(path, "reference requires 'type' and 'oid' fields")),
    }
}
