use std::any::{type_name, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A declaration attached to a field that changes how its type translates.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Annotation {
    /// Store the value as an opaque serialized blob.
    Serialized,
    /// Eagerly fetch references. An empty group list means "always".
    Load(Vec<String>),
    /// Free-form marker for custom factories.
    Custom(String),
}

/// Identity of a (type, annotation sequence) pair.
///
/// Two keys are equal iff the type and the annotation sequence match,
/// in order. The registry memoizes translators on this key.
#[derive(Clone)]
pub struct TypeKey {
    type_id: TypeId,
    type_name: &'static str,
    annotations: Vec<Annotation>,
}

impl TypeKey {
    pub fn of<T: 'static>() -> Self {
        Self::with_annotations::<T>(Vec::new())
    }

    pub fn with_annotations<T: 'static>(annotations: Vec<Annotation>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: type_name::<T>(),
            annotations,
        }
    }

    /// The key of another type carrying the same annotations.
    ///
    /// Structural translators use this for their component type.
    pub fn retarget<T: 'static>(&self) -> Self {
        Self::with_annotations::<T>(self.annotations.clone())
    }

    pub fn annotate(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// The type name without its module path or generic arguments.
    pub fn short_name(&self) -> &'static str {
        short_type_name(self.type_name)
    }

    pub fn annotations(&self) -> &[Annotation] {
        &self.annotations
    }

    pub fn has(&self, annotation: &Annotation) -> bool {
        self.annotations.contains(annotation)
    }

    pub fn has_custom(&self, marker: &str) -> bool {
        self.annotations
            .iter()
            .any(|a| matches!(a, Annotation::Custom(m) if m == marker))
    }

    /// The load groups of the first `Load` annotation, if any.
    pub fn load_groups(&self) -> Option<&[String]> {
        self.annotations.iter().find_map(|a| match a {
            Annotation::Load(groups) => Some(groups.as_slice()),
            _ => None,
        })
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id && self.annotations == other.annotations
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
        self.annotations.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.annotations.is_empty() {
            write!(f, "TypeKey({})", self.type_name)
        } else {
            write!(f, "TypeKey({} {:?})", self.type_name, self.annotations)
        }
    }
}

/// `a::b::Cat<x::Y>` -> `Cat`.
pub fn short_type_name(full: &'static str) -> &'static str {
    let head = full.split('<').next().unwrap_or(full);
    head.rsplit("::").next().unwrap_or(head)
}
