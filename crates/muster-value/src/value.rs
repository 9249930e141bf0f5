//! The tagged value type

use bytes::Bytes;
use muster_primitives::ObjectId;
use std::fmt;
use std::sync::Arc;

/// A self-describing value.
///
/// Documents and arrays share their contents through `Arc`, and binary blobs
/// through `Bytes`, so cloning any value is cheap. Document field order is
/// preserved.
#[derive(Clone, Default, PartialEq)]
pub enum Value {
    /// No value at all; reading a missing document field yields this
    #[default]
    Undefined,
    /// Explicit null
    Null,
    /// Boolean
    Boolean(bool),
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit float
    Double(f64),
    /// UTF-8 string
    String(Arc<str>),
    /// 12-byte object id
    ObjectId(ObjectId),
    /// Opaque binary blob
    Binary(Bytes),
    /// Ordered key-value mapping
    Document(Arc<Vec<(String, Value)>>),
    /// Sequence of values
    Array(Arc<Vec<Value>>),
}

/// Shared sentinel so `get` can hand out a reference for missing fields.
static UNDEFINED: Value = Value::Undefined;

impl Value {
    /// Look up a document field; missing fields read as `Undefined`
    pub fn get(&self, name: &str) -> &Value {
        if let Value::Document(fields) = self {
            for (key, value) in fields.iter() {
                if key == name {
                    return value;
                }
            }
        }
        &UNDEFINED
    }

    /// Whether the value is neither undefined nor null
    pub fn has_value(&self) -> bool {
        !matches!(self, Value::Undefined | Value::Null)
    }

    /// Whether the value is undefined
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    /// Whether the value is null
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether the value is a boolean
    pub fn is_boolean(&self) -> bool {
        matches!(self, Value::Boolean(_))
    }

    /// Whether the value is an int32
    pub fn is_int32(&self) -> bool {
        matches!(self, Value::Int32(_))
    }

    /// Whether the value is a double
    pub fn is_double(&self) -> bool {
        matches!(self, Value::Double(_))
    }

    /// Whether the value is a string
    pub fn is_string(&self) -> bool {
        matches!(self, Value::String(_))
    }

    /// Whether the value is an object id
    pub fn is_object_id(&self) -> bool {
        matches!(self, Value::ObjectId(_))
    }

    /// Whether the value is binary
    pub fn is_binary(&self) -> bool {
        matches!(self, Value::Binary(_))
    }

    /// Whether the value is a document
    pub fn is_document(&self) -> bool {
        matches!(self, Value::Document(_))
    }

    /// Whether the value is an array
    pub fn is_array(&self) -> bool {
        matches!(self, Value::Array(_))
    }

    /// Read as boolean
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Read as int32; doubles with integral values convert
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(i) => Some(*i),
            Value::Double(d) if d.fract() == 0.0 => Some(*d as i32),
            _ => None,
        }
    }

    /// Read as double; int32 widens
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            Value::Int32(i) => Some(f64::from(*i)),
            _ => None,
        }
    }

    /// Read as string slice
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read as object id
    pub fn as_object_id(&self) -> Option<ObjectId> {
        match self {
            Value::ObjectId(id) => Some(*id),
            _ => None,
        }
    }

    /// Read as binary
    pub fn as_binary(&self) -> Option<&Bytes> {
        match self {
            Value::Binary(b) => Some(b),
            _ => None,
        }
    }

    /// Document fields, empty for non-documents
    pub fn fields(&self) -> &[(String, Value)] {
        match self {
            Value::Document(fields) => fields,
            _ => &[],
        }
    }

    /// Array items, empty for non-arrays
    pub fn items(&self) -> &[Value] {
        match self {
            Value::Array(items) => items,
            _ => &[],
        }
    }
}

/// Visit every object id reachable from `value`, including through nested
/// documents and arrays.
pub fn for_each_object_id(value: &Value, f: &mut dyn FnMut(ObjectId)) {
    match value {
        Value::ObjectId(id) => f(*id),
        Value::Document(fields) => {
            for (_, v) in fields.iter() {
                for_each_object_id(v, f);
            }
        }
        Value::Array(items) => {
            for v in items.iter() {
                for_each_object_id(v, f);
            }
        }
        _ => {}
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Int32(i) => write!(f, "{}", i),
            Value::Double(d) => write!(f, "{}", d),
            Value::String(s) => write!(f, "{:?}", s),
            Value::ObjectId(id) => write!(f, "{{{}}}", id),
            Value::Binary(b) => write!(f, "binary[{}]", b.len()),
            Value::Document(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {:?}", k, v)?;
                }
                write!(f, "}}")
            }
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{:?}", v)?;
                }
                write!(f, "]")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(Arc::from(v))
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(Arc::from(v.as_str()))
    }
}

impl From<ObjectId> for Value {
    fn from(v: ObjectId) -> Self {
        Value::ObjectId(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Binary(v)
    }
}
