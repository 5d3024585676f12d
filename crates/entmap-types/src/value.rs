use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::key::RawKey;
use crate::record::Record;

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

/// Opaque byte payload stored as a single leaf.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Blob(pub Vec<u8>);

impl Blob {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self(data.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Blob({} bytes)", self.0.len())
    }
}

// ---------------------------------------------------------------------------
// Value
// ---------------------------------------------------------------------------

/// A scalar leaf value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Integer(i64),
    Double(f64),
    String(String),
    Blob(Blob),
    Timestamp(DateTime<Utc>),
    Key(RawKey),
    /// A raw sub-record carried as an opaque value.
    Record(Box<Record>),
}

impl Value {
    /// Short name of the value type, for diagnostics.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Integer(_) => "integer",
            Self::Double(_) => "double",
            Self::String(_) => "string",
            Self::Blob(_) => "blob",
            Self::Timestamp(_) => "timestamp",
            Self::Key(_) => "key",
            Self::Record(_) => "record",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<RawKey> for Value {
    fn from(v: RawKey) -> Self {
        Self::Key(v)
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// An attribute tree node.
///
/// A node is either a scalar leaf tagged with its index flag, a map of
/// path segments to child nodes, or an ordered list of child nodes. Map
/// segments never contain `.`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Node {
    Leaf { value: Value, indexed: bool },
    Map(BTreeMap<String, Node>),
    List(Vec<Node>),
}

impl Node {
    /// An indexed leaf.
    pub fn indexed(value: impl Into<Value>) -> Self {
        Self::Leaf {
            value: value.into(),
            indexed: true,
        }
    }

    /// An unindexed leaf.
    pub fn unindexed(value: impl Into<Value>) -> Self {
        Self::Leaf {
            value: value.into(),
            indexed: false,
        }
    }

    /// A leaf with an explicit index flag.
    pub fn leaf(value: impl Into<Value>, indexed: bool) -> Self {
        Self::Leaf {
            value: value.into(),
            indexed,
        }
    }

    /// An explicit null leaf.
    pub fn null(indexed: bool) -> Self {
        Self::Leaf {
            value: Value::Null,
            indexed,
        }
    }

    pub fn empty_map() -> Self {
        Self::Map(BTreeMap::new())
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Self::Leaf { value, .. } => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Node>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Node]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    /// Returns `true` for a null leaf.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Leaf { value: Value::Null, .. })
    }

    /// The index flag of a leaf; `None` for maps and lists.
    pub fn is_indexed(&self) -> Option<bool> {
        match self {
            Self::Leaf { indexed, .. } => Some(*indexed),
            _ => None,
        }
    }

    /// Short description of the node shape, for diagnostics.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::Leaf { value, .. } => value.type_name(),
            Self::Map(_) => "map",
            Self::List(_) => "list",
        }
    }

    /// Structural equality that ignores index flags.
    pub fn same_values(&self, other: &Node) -> bool {
        match (self, other) {
            (Self::Leaf { value: a, .. }, Self::Leaf { value: b, .. }) => a == b,
            (Self::Map(a), Self::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .zip(b)
                        .all(|((ka, va), (kb, vb))| ka == kb && va.same_values(vb))
            }
            (Self::List(a), Self::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.same_values(y))
            }
            _ => false,
        }
    }

    /// Look up a descendant by dotted path (`"address.city"`).
    ///
    /// Lists are not traversed.
    pub fn lookup(&self, dotted: &str) -> Option<&Node> {
        let mut current = self;
        for segment in dotted.split('.') {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }
}
