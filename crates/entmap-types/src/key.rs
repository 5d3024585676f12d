use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// The identifying part of a key: a numeric id or a string name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyId {
    /// Numeric identifier, possibly allocated by the store.
    Id(i64),
    /// Caller-supplied string identifier.
    Name(String),
}

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Name(name) => write!(f, "{name:?}"),
        }
    }
}

/// Hierarchical record key: kind, identifier, and an optional parent chain.
///
/// A key without an identifier is *incomplete*; the store completes it by
/// allocating a numeric id on put.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RawKey {
    kind: String,
    id: Option<KeyId>,
    parent: Option<Box<RawKey>>,
}

impl RawKey {
    /// A complete key with a numeric id.
    pub fn with_id(kind: impl Into<String>, id: i64) -> Self {
        Self {
            kind: kind.into(),
            id: Some(KeyId::Id(id)),
            parent: None,
        }
    }

    /// A complete key with a string name.
    pub fn with_name(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: Some(KeyId::Name(name.into())),
            parent: None,
        }
    }

    /// An incomplete key awaiting id allocation.
    pub fn incomplete(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            parent: None,
        }
    }

    /// Build a key from its parts.
    pub fn from_parts(kind: impl Into<String>, id: Option<KeyId>, parent: Option<RawKey>) -> Self {
        Self {
            kind: kind.into(),
            id,
            parent: parent.map(Box::new),
        }
    }

    /// Return this key nested under `parent`.
    pub fn with_parent(mut self, parent: RawKey) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> Option<&KeyId> {
        self.id.as_ref()
    }

    /// The numeric id, if this key carries one.
    pub fn numeric_id(&self) -> Option<i64> {
        match self.id {
            Some(KeyId::Id(id)) => Some(id),
            _ => None,
        }
    }

    /// The string name, if this key carries one.
    pub fn name(&self) -> Option<&str> {
        match &self.id {
            Some(KeyId::Name(name)) => Some(name),
            _ => None,
        }
    }

    pub fn parent(&self) -> Option<&RawKey> {
        self.parent.as_deref()
    }

    /// Returns `true` if the key carries an identifier.
    pub fn is_complete(&self) -> bool {
        self.id.is_some()
    }

    /// Complete this key with an allocated numeric id.
    pub fn complete(mut self, id: i64) -> Self {
        self.id = Some(KeyId::Id(id));
        self
    }

    /// The top-most ancestor (the key itself when it has no parent).
    pub fn root(&self) -> &RawKey {
        let mut current = self;
        while let Some(parent) = current.parent() {
            current = parent;
        }
        current
    }

    /// All keys from the root ancestor down to this key.
    pub fn ancestry(&self) -> Vec<&RawKey> {
        let mut chain = vec![self];
        let mut current = self;
        while let Some(parent) = current.parent() {
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// Web-safe string encoding (hex of the JSON form).
    pub fn to_websafe(&self) -> String {
        // Serializing plain strings, integers and options cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(json)
    }

    /// Parse a key produced by [`RawKey::to_websafe`].
    pub fn from_websafe(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        let key: RawKey =
            serde_json::from_slice(&bytes).map_err(|e| TypeError::InvalidKey(e.to_string()))?;
        if key.kind.is_empty() {
            return Err(TypeError::InvalidKey("empty kind".into()));
        }
        Ok(key)
    }
}

impl fmt::Display for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(parent) = &self.parent {
            write!(f, "{parent}/")?;
        }
        match &self.id {
            Some(id) => write!(f, "{}({id})", self.kind),
            None => write!(f, "{}(?)", self.kind),
        }
    }
}

/// Typed key: a [`RawKey`] known to address a record of type `T`.
///
/// Equality, ordering and hashing are those of the raw key.
pub struct Key<T> {
    raw: RawKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    /// Wrap a raw key. The caller asserts the kind belongs to `T`.
    pub fn from_raw(raw: RawKey) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> &RawKey {
        &self.raw
    }

    pub fn into_raw(self) -> RawKey {
        self.raw
    }

    pub fn kind(&self) -> &str {
        self.raw.kind()
    }

    pub fn numeric_id(&self) -> Option<i64> {
        self.raw.numeric_id()
    }

    pub fn name(&self) -> Option<&str> {
        self.raw.name()
    }

    pub fn parent(&self) -> Option<&RawKey> {
        self.raw.parent()
    }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self {
        Self::from_raw(self.raw.clone())
    }
}

impl<T> PartialEq for Key<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T> Eq for Key<T> {}

impl<T> Hash for Key<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T> PartialOrd for Key<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Key<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.raw.cmp(&other.raw)
    }
}

impl<T> fmt::Debug for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", self.raw)
    }
}

impl<T> fmt::Display for Key<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl<T> From<Key<T>> for RawKey {
    fn from(key: Key<T>) -> Self {
        key.raw
    }
}
