use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};

use entmap_types::{Key, Node, RawKey, Record, Value};

use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::entity::{Entity, EntityMetadata};
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::translator::{Persist, Shape, Translator};
use crate::type_key::TypeKey;

// ---------------------------------------------------------------------------
// Ref
// ---------------------------------------------------------------------------

/// A reference to another entity: its key plus, once a batch load has
/// resolved it, the loaded value.
///
/// Equality, ordering and hashing look at the key only. Clones share the
/// resolution cell.
pub struct Ref<T> {
    key: Key<T>,
    slot: Arc<OnceLock<Arc<T>>>,
}

impl<T> Ref<T> {
    pub fn new(key: Key<T>) -> Self {
        Self {
            key,
            slot: Arc::new(OnceLock::new()),
        }
    }

    /// A reference that is already resolved to `value`.
    pub fn resolved(key: Key<T>, value: T) -> Self {
        let slot = OnceLock::new();
        let _ = slot.set(Arc::new(value));
        Self {
            key,
            slot: Arc::new(slot),
        }
    }

    pub fn key(&self) -> &Key<T> {
        &self.key
    }

    pub fn raw(&self) -> &RawKey {
        self.key.raw()
    }

    /// The loaded value, or `None` while unresolved.
    pub fn get(&self) -> Option<&T> {
        self.slot.get().map(Arc::as_ref)
    }

    pub fn get_arc(&self) -> Option<Arc<T>> {
        self.slot.get().cloned()
    }

    pub fn is_loaded(&self) -> bool {
        self.slot.get().is_some()
    }
}

impl<T> From<Key<T>> for Ref<T> {
    fn from(key: Key<T>) -> Self {
        Self::new(key)
    }
}

impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<T> Eq for Ref<T> {}

impl<T> PartialOrd for Ref<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Ref<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

impl<T> Hash for Ref<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl<T> fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ref")
            .field("key", self.key.raw())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// RefTranslator
// ---------------------------------------------------------------------------

/// Stores a reference as its key. On load, records intent to fetch the
/// target when the field is eager in the active load groups.
pub struct RefTranslator<T> {
    /// Load groups of an eager field; `None` for a lazy one.
    eager: Option<Vec<String>>,
    _target: PhantomData<fn() -> T>,
}

impl<T: Entity> RefTranslator<T> {
    /// Kind check against the target, once its registration has finished.
    fn check_kind(
        &self,
        key: &RawKey,
        ctx: &LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        let Ok(metadata) = ctx.metadata::<T>() else {
            return Ok(());
        };
        if key.kind() != metadata.kind() {
            return Err(TranslateError::KindMismatch {
                path: path.to_string(),
                expected: metadata.kind().to_string(),
                found: key.kind().to_string(),
            });
        }
        Ok(())
    }
}

impl<T: Entity> Translator<Ref<T>> for RefTranslator<T> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Ref<T>>> {
        let key = match node {
            Node::Leaf {
                value: Value::Null, ..
            } => return Ok(None),
            Node::Leaf {
                value: Value::Key(key),
                ..
            } => key,
            other => {
                return Err(TranslateError::UnexpectedNode {
                    path: path.to_string(),
                    expected: "key",
                    found: other.describe(),
                })
            }
        };
        self.check_kind(key, ctx, path)?;
        let reference = Ref::new(Key::from_raw(key.clone()));
        if self.eager.as_deref().is_some_and(|groups| ctx.is_eager(groups)) {
            ctx.defer(PendingRef::new(&reference));
        }
        Ok(Some(reference))
    }

    fn save(
        &self,
        pojo: &Ref<T>,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        let key = pojo.raw().clone();
        if self.eager.is_some() {
            ctx.register_reference(path, key.clone());
        }
        Ok(Some(Node::leaf(Value::Key(key), index)))
    }
}

impl<T: Entity> Persist for Ref<T> {
    const SHAPE: Shape = Shape::Reference;

    fn create(
        cx: &mut CreateContext<'_>,
        key: &TypeKey,
        _path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<Self>>> {
        cx.require_entity::<T>()?;
        Ok(Arc::new(RefTranslator::<T> {
            eager: key.load_groups().map(<[String]>::to_vec),
            _target: PhantomData,
        }))
    }
}

// ---------------------------------------------------------------------------
// Deferred resolution
// ---------------------------------------------------------------------------

/// A resolved entity, type-erased for attachment into reference cells.
pub type Resolved = Arc<dyn Any + Send + Sync>;

/// An entity decoded by a batch loader, waiting for its after-load hooks.
pub trait DecodedEntity: Send {
    /// Run the after-load hooks and hand back the shared value.
    fn finish(self: Box<Self>) -> Resolved;
}

struct Decoded<T> {
    metadata: Arc<EntityMetadata<T>>,
    pojo: T,
}

impl<T: Send + Sync + 'static> DecodedEntity for Decoded<T> {
    fn finish(self: Box<Self>) -> Resolved {
        let Decoded { metadata, mut pojo } = *self;
        metadata.after_load(&mut pojo);
        Arc::new(pojo)
    }
}

trait RefBinding: Send + Sync {
    fn decode(
        &self,
        record: &Record,
        ctx: &mut LoadContext<'_>,
    ) -> TranslateResult<Box<dyn DecodedEntity>>;

    fn attach(&self, value: &Resolved) -> bool;
}

struct SlotBinding<T> {
    slot: Arc<OnceLock<Arc<T>>>,
}

impl<T: Entity> RefBinding for SlotBinding<T> {
    fn decode(
        &self,
        record: &Record,
        ctx: &mut LoadContext<'_>,
    ) -> TranslateResult<Box<dyn DecodedEntity>> {
        let metadata = ctx.metadata::<T>()?;
        let pojo = metadata.load(record, ctx)?;
        Ok(Box::new(Decoded { metadata, pojo }))
    }

    fn attach(&self, value: &Resolved) -> bool {
        match Arc::clone(value).downcast::<T>() {
            Ok(value) => {
                let _ = self.slot.set(value);
                true
            }
            Err(_) => false,
        }
    }
}

/// Intent to fetch one referenced entity after the current load pass.
///
/// Phase 1 of a load records these; the batch loader fetches the keys,
/// decodes the records through [`PendingRef::decode`] and finally
/// [`attach`](PendingRef::attach)es the finished values.
pub struct PendingRef {
    key: RawKey,
    binding: Box<dyn RefBinding>,
}

impl PendingRef {
    pub fn new<T: Entity>(reference: &Ref<T>) -> Self {
        Self {
            key: reference.raw().clone(),
            binding: Box::new(SlotBinding {
                slot: Arc::clone(&reference.slot),
            }),
        }
    }

    pub fn key(&self) -> &RawKey {
        &self.key
    }

    /// Decode the fetched record of the target. References found while
    /// decoding are deferred into `ctx`.
    pub fn decode(
        &self,
        record: &Record,
        ctx: &mut LoadContext<'_>,
    ) -> TranslateResult<Box<dyn DecodedEntity>> {
        self.binding.decode(record, ctx)
    }

    /// Store `value` in the reference cell. Returns `false` if the value is
    /// of another type.
    pub fn attach(&self, value: &Resolved) -> bool {
        self.binding.attach(value)
    }
}

impl fmt::Debug for PendingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRef").field("key", &self.key).finish()
    }
}
