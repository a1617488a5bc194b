use serde::Serialize;

/// Kind of backend call an Operation was issued as.
/// It determines how its position in the ResultSet is read back.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Kind {
    /// Execute a statement which returns no rows, yielding a completion tag.
    Exec,
    /// Query yielding any number of rows.
    Query,
    /// Query yielding (at most) a single row.
    QueryRow,
}

/// Operation is a single queued backend call: its kind, statement text,
/// and positional parameters. Operations are built by a Querier and are
/// immutable thereafter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Operation {
    kind: Kind,
    statement: String,
    params: Vec<Value>,
}

impl Operation {
    pub fn new(kind: Kind, statement: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            kind,
            statement: statement.into(),
            params,
        }
    }

    #[inline]
    pub fn kind(&self) -> Kind {
        self.kind
    }
    #[inline]
    pub fn statement(&self) -> &str {
        &self.statement
    }
    #[inline]
    pub fn params(&self) -> &[Value] {
        &self.params
    }
}

/// Value is an opaque positional parameter of an Operation.
/// Values are passed through to the backend as-is.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// NULL of the given type. Backends which bind typed parameters
    /// bind the NULL as that type.
    Null(#[serde(serialize_with = "serialize_null")] Type),
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
    Timestamp(chrono::DateTime<chrono::Utc>),
}

/// Type of a non-NULL Value.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Type {
    Bool,
    Int,
    Float,
    Text,
    Bytes,
    Json,
    Timestamp,
}

fn serialize_null<S: serde::Serializer>(_: &Type, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_none()
}

impl Value {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null(_))
    }
}

/// Rust types which convert into a Value of a known Type.
/// `Option<T>` of a Typed T converts None into a NULL of T's Type.
pub trait Typed: Into<Value> {
    const TYPE: Type;
}

macro_rules! typed {
    ($type:ident => $($t:ty),*) => {
        $(impl Typed for $t {
            const TYPE: Type = Type::$type;
        })*
    };
}
typed!(Bool => bool);
typed!(Int => i8, i16, i32, i64, isize, u8, u16, u32);
typed!(Float => f32, f64);
typed!(Text => &str, String);
typed!(Bytes => &[u8], Vec<u8>);
typed!(Json => serde_json::Value);
typed!(Timestamp => chrono::DateTime<chrono::Utc>);

// isize is at most 64 bits on every supported target.
macro_rules! from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for Value {
            fn from(v: $t) -> Self {
                Value::Int(v as i64)
            }
        })*
    };
}
from_int!(i8, i16, i32, i64, isize, u8, u16, u32);

// Unsigned 64-bit integers may not fit in an Int, and convert fallibly.
impl TryFrom<u64> for Value {
    type Error = std::num::TryFromIntError;

    fn try_from(v: u64) -> Result<Self, Self::Error> {
        i64::try_from(v).map(Value::Int)
    }
}
impl TryFrom<usize> for Value {
    type Error = std::num::TryFromIntError;

    fn try_from(v: usize) -> Result<Self, Self::Error> {
        i64::try_from(v).map(Value::Int)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}
impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(v as f64)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}
impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}
impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}
impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}
impl From<chrono::DateTime<chrono::Utc>> for Value {
    fn from(v: chrono::DateTime<chrono::Utc>) -> Self {
        Value::Timestamp(v)
    }
}
impl<T: Typed> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null(T::TYPE),
        }
    }
}

/// Build a `Vec<Value>` of positional parameters from expressions
/// convertible into Value. `u64` and `usize` convert fallibly,
/// and must be passed as an already-converted Value.
///
/// ```
/// use sql_batch::{Type, Value};
///
/// let count: usize = 3;
/// let params = sql_batch::params!["Joe", 42, None::<i64>, Value::try_from(count)?];
/// assert_eq!(params.len(), 4);
/// assert_eq!(params[2], Value::Null(Type::Int));
/// # Ok::<(), std::num::TryFromIntError>(())
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::Value>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::Value::from($value)),+]
    };
}
