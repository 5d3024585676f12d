use std::fmt;
use std::sync::Arc;

use crate::error::TranslateError;

/// Immutable location in the object graph.
///
/// A path is a persistent linked list: `extend` and `previous` share the
/// prefix instead of copying it. Paths are used for diagnostics and for
/// indexing scope only, never to move data.
#[derive(Clone, Default)]
pub struct Path {
    last: Option<Arc<Segment>>,
}

struct Segment {
    name: String,
    parent: Path,
    depth: usize,
}

impl Path {
    /// The empty path at the root of a record.
    pub fn root() -> Self {
        Self { last: None }
    }

    /// A new path with `segment` appended.
    pub fn extend(&self, segment: impl Into<String>) -> Path {
        Path {
            last: Some(Arc::new(Segment {
                name: segment.into(),
                parent: self.clone(),
                depth: self.depth() + 1,
            })),
        }
    }

    /// The path without its last segment, or `None` at the root.
    pub fn previous(&self) -> Option<Path> {
        self.last.as_ref().map(|segment| segment.parent.clone())
    }

    /// The last segment, or `None` at the root.
    pub fn segment(&self) -> Option<&str> {
        self.last.as_ref().map(|segment| segment.name.as_str())
    }

    pub fn is_root(&self) -> bool {
        self.last.is_none()
    }

    pub fn depth(&self) -> usize {
        self.last.as_ref().map_or(0, |segment| segment.depth)
    }

    /// All segments, root first.
    pub fn segments(&self) -> Vec<&str> {
        let mut out = Vec::with_capacity(self.depth());
        let mut current = self;
        while let Some(segment) = &current.last {
            out.push(segment.name.as_str());
            current = &segment.parent;
        }
        out.reverse();
        out
    }

    /// An error carrying the full dotted path.
    pub fn illegal_state(&self, message: impl Into<String>) -> TranslateError {
        TranslateError::IllegalState {
            path: self.to_string(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            return write!(f, "(root)");
        }
        write!(f, "{}", self.segments().join("."))
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({self})")
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.depth() == other.depth() && self.segments() == other.segments()
    }
}

impl Eq for Path {}
