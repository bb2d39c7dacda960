//! Scalar values held by entity properties.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A dynamically-typed scalar property value.
///
/// Equality is structural and floating point values compare by their bit
/// pattern, so every `Value` can participate in identity-map keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
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

    /// Text string
    Text(String),

    /// Binary data
    Bytes(Vec<u8>),

    /// UUID (as 16 bytes)
    Uuid([u8; 16]),
}

/// The declared kind of a property, used to type-check writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueKind {
    Bool,
    Int,
    BigInt,
    Double,
    Text,
    Bytes,
    Uuid,
}

impl ValueKind {
    /// Whether the tracker can hand out temporary placeholders of this kind.
    pub const fn supports_temporary_values(self) -> bool {
        matches!(
            self,
            ValueKind::Int | ValueKind::BigInt | ValueKind::Text | ValueKind::Uuid
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Bool => "BOOLEAN",
            ValueKind::Int => "INTEGER",
            ValueKind::BigInt => "BIGINT",
            ValueKind::Double => "DOUBLE",
            ValueKind::Text => "TEXT",
            ValueKind::Bytes => "BLOB",
            ValueKind::Uuid => "UUID",
        }
    }
}

impl Value {
    /// Check if this value is NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The kind of this value, or `None` for NULL.
    pub const fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(ValueKind::Bool),
            Value::Int(_) => Some(ValueKind::Int),
            Value::BigInt(_) => Some(ValueKind::BigInt),
            Value::Double(_) => Some(ValueKind::Double),
            Value::Text(_) => Some(ValueKind::Text),
            Value::Bytes(_) => Some(ValueKind::Bytes),
            Value::Uuid(_) => Some(ValueKind::Uuid),
        }
    }

    /// Get the type name of this value.
    pub const fn type_name(&self) -> &'static str {
        match self.kind() {
            Some(kind) => kind.name(),
            None => "NULL",
        }
    }

    /// Whether this value may be written to a property of `kind`.
    pub fn fits(&self, kind: ValueKind) -> bool {
        self.kind().is_none_or(|k| k == kind)
    }

    /// Try to convert this value to an i64.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(i64::from(*v)),
            Value::BigInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Try to get this value as a string reference.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    fn hash_tagged<H: Hasher>(&self, state: &mut H) {
        match self {
            Value::Null => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::BigInt(i) => {
                3u8.hash(state);
                i.hash(state);
            }
            Value::Double(f) => {
                4u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Text(s) => {
                5u8.hash(state);
                s.hash(state);
            }
            Value::Bytes(b) => {
                6u8.hash(state);
                b.hash(state);
            }
            Value::Uuid(u) => {
                7u8.hash(state);
                u.hash(state);
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Uuid(a), Value::Uuid(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.hash_tagged(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::BigInt(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::Text(s) => write!(f, "'{}'", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Uuid(u) => {
                for (i, byte) in u.iter().enumerate() {
                    if matches!(i, 4 | 6 | 8 | 10) {
                        write!(f, "-")?;
                    }
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
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

impl From<[u8; 16]> for Value {
    fn from(v: [u8; 16]) -> Self {
        Value::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

/// The ordered values of one key (primary, alternate, or foreign).
///
/// A composite key compares as the whole tuple. A key with any NULL
/// component addresses nothing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KeyValue(Vec<Value>);

impl KeyValue {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }

    /// True when every component is non-NULL.
    pub fn is_complete(&self) -> bool {
        !self.0.is_empty() && self.0.iter().all(|v| !v.is_null())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Value>> for KeyValue {
    fn from(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", v)?;
        }
        write!(f, ")")
    }
}
