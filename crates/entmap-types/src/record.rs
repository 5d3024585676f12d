use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::key::RawKey;
use crate::value::{Node, Value};

/// A stored record: a key plus a root property map.
///
/// The root of an attribute tree is always a map. Absence of a property,
/// not an empty marker, represents "nothing here".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RawKey,
    pub properties: BTreeMap<String, Node>,
}

impl Record {
    /// Create an empty record for `key`.
    pub fn new(key: RawKey) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
        }
    }

    /// Create a record from a key and a property map.
    pub fn with_properties(key: RawKey, properties: BTreeMap<String, Node>) -> Self {
        Self { key, properties }
    }

    pub fn kind(&self) -> &str {
        self.key.kind()
    }

    pub fn property(&self, name: &str) -> Option<&Node> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: impl Into<String>, node: Node) {
        self.properties.insert(name.into(), node);
    }

    pub fn remove_property(&mut self, name: &str) -> Option<Node> {
        self.properties.remove(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Look up a property by dotted path through embedded maps.
    pub fn lookup(&self, dotted: &str) -> Option<&Node> {
        let (head, rest) = match dotted.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (dotted, None),
        };
        let node = self.properties.get(head)?;
        match rest {
            Some(rest) => node.lookup(rest),
            None => Some(node),
        }
    }

    /// Returns `true` if any leaf under `dotted` (including list members)
    /// equals `value` and is indexed.
    pub fn index_contains(&self, dotted: &str, value: &Value) -> bool {
        fn scan(node: &Node, value: &Value) -> bool {
            match node {
                Node::Leaf { value: v, indexed } => *indexed && v == value,
                Node::List(items) => items.iter().any(|n| scan(n, value)),
                Node::Map(_) => false,
            }
        }
        self.lookup(dotted).is_some_and(|node| scan(node, value))
    }
}
