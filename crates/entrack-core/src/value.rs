//! Opaque scalar values.
//!
//! Identifiers, version tokens, natural-key components and snapshot
//! attributes all travel through the engine as [`Value`]. The engine never
//! interprets these beyond equality and hashing; their database meaning
//! belongs to the mapped-type descriptor.

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::error::{Error, UsageViolation};

/// A dynamically-typed scalar value.
///
/// This enum covers everything a surrogate identifier, optimistic-lock
/// version or persisted attribute snapshot can hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// NULL value
    Null,

    /// Boolean value
    Bool(bool),

    /// 32-bit signed integer
    Int(i32),

    /// 64-bit signed integer
    BigInt(i64),

    /// 64-bit floating point
    Double(f64),

    /// Arbitrary precision decimal (stored as string)
    Decimal(String),

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// Timestamp (microseconds since epoch)
    Timestamp(i64),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),

    /// JSON value
    Json(serde_json::Value),
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "NULL",
            Value::Bool(_) => "BOOLEAN",
            Value::Int(_) => "INTEGER",
            Value::BigInt(_) => "BIGINT",
            Value::Double(_) => "DOUBLE",
            Value::Decimal(_) => "DECIMAL",
            Value::Text(_) => "TEXT",
            Value::Bytes(_) => "BLOB",
            Value::Timestamp(_) => "TIMESTAMP",
            Value::Uuid(_) => "UUID",
            Value::Json(_) => "JSON",
        }
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            Value::Bool(v) => Some(if *v { 1 } else { 0 }),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            Value::Decimal(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::BigInt(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

/// Hash a slice of values into a single key hash.
///
/// The hash is tagged per variant so that, say, `Int(1)` and `BigInt(1)`
/// do not collide by accident. Floating-point values hash by bit pattern.
#[must_use]
pub fn hash_values(values: &[Value]) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    let mut hasher = DefaultHasher::new();
    for v in values {
        hash_value_into(v, &mut hasher);
    }
    hasher.finish()
}

fn hash_value_into(value: &Value, hasher: &mut impl Hasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Int(i) => {
            2u8.hash(hasher);
            i.hash(hasher);
        }
        Value::BigInt(i) => {
            3u8.hash(hasher);
            i.hash(hasher);
        }
        Value::Double(f) => {
            4u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Decimal(s) => {
            5u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Text(s) => {
            6u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            7u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Timestamp(ts) => {
            8u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            9u8.hash(hasher);
            u.hash(hasher);
        }
        Value::Json(j) => {
            10u8.hash(hasher);
            j.to_string().hash(hasher);
        }
    }
}

/// Database identity of one row: mapped-type name plus surrogate identifier.
///
/// Equality and hashing go through the precomputed identifier hash, never
/// through domain-object equality. The full identifier value is retained for
/// storage round-trips.
#[derive(Debug, Clone)]
pub struct EntityKey {
    entity: &'static str,
    id: Value,
    id_hash: u64,
}

impl EntityKey {
    /// Build a key for `entity` with the given identifier.
    ///
    /// # Errors
    ///
    /// Returns a usage error when the identifier is NULL; a row identity
    /// cannot be formed before an identifier has been assigned.
    pub fn new(entity: &'static str, id: Value) -> Result<Self, Error> {
        if id.is_null() {
            return Err(Error::Usage(UsageViolation::MissingIdentifier { entity }));
        }
        let id_hash = hash_values(std::slice::from_ref(&id));
        Ok(Self {
            entity,
            id,
            id_hash,
        })
    }

    /// The mapped-type name.
    #[must_use]
    pub const fn entity(&self) -> &'static str {
        self.entity
    }

    /// The surrogate identifier value.
    #[must_use]
    pub const fn id(&self) -> &Value {
        &self.id
    }

    /// The identifier hash used for map keying.
    #[must_use]
    pub const fn id_hash(&self) -> u64 {
        self.id_hash
    }
}

impl PartialEq for EntityKey {
    fn eq(&self, other: &Self) -> bool {
        self.entity == other.entity && self.id_hash == other.id_hash
    }
}

impl Eq for EntityKey {}

impl Hash for EntityKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.entity.hash(state);
        self.id_hash.hash(state);
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{:?}", self.entity, self.id)
    }
}
