use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use entmap_types::{Key, Node, RawKey};

use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::translator::{Persist, Shape, Translator};
use crate::type_key::TypeKey;

// ---------------------------------------------------------------------------
// MapKey
// ---------------------------------------------------------------------------

/// A map key that stringifies into a path segment.
///
/// `to_segment` returning `None` is a null key. Implement this trait to
/// plug in a custom stringifier.
pub trait MapKey: Sized + Send + Sync + 'static {
    fn to_segment(&self) -> Option<String>;

    fn from_segment(segment: &str) -> Result<Self, String>;
}

impl MapKey for String {
    fn to_segment(&self) -> Option<String> {
        Some(self.clone())
    }

    fn from_segment(segment: &str) -> Result<Self, String> {
        Ok(segment.to_string())
    }
}

macro_rules! integer_map_key {
    ($($ty:ty),+) => {
        $(
            impl MapKey for $ty {
                fn to_segment(&self) -> Option<String> {
                    Some(self.to_string())
                }

                fn from_segment(segment: &str) -> Result<Self, String> {
                    segment.parse().map_err(|e| format!("{segment:?}: {e}"))
                }
            }
        )+
    };
}

integer_map_key!(i8, i16, i32, i64, u8, u16, u32, u64);

/// Keys stringify through their web-safe encoding.
impl MapKey for RawKey {
    fn to_segment(&self) -> Option<String> {
        Some(self.to_websafe())
    }

    fn from_segment(segment: &str) -> Result<Self, String> {
        RawKey::from_websafe(segment).map_err(|e| e.to_string())
    }
}

impl<T: 'static> MapKey for Key<T> {
    fn to_segment(&self) -> Option<String> {
        Some(self.raw().to_websafe())
    }

    fn from_segment(segment: &str) -> Result<Self, String> {
        RawKey::from_segment(segment).map(Key::from_raw)
    }
}

impl<K: MapKey> MapKey for Option<K> {
    fn to_segment(&self) -> Option<String> {
        self.as_ref().and_then(K::to_segment)
    }

    fn from_segment(segment: &str) -> Result<Self, String> {
        K::from_segment(segment).map(Some)
    }
}

// ---------------------------------------------------------------------------
// MapLike
// ---------------------------------------------------------------------------

/// A keyed container the engine can clear and refill in place.
pub trait MapLike: Default + Send + Sync + 'static {
    type Key: MapKey;
    type Value: Persist;

    fn clear(&mut self);

    fn insert(&mut self, key: Self::Key, value: Self::Value);

    fn entries(&self) -> Box<dyn Iterator<Item = (&Self::Key, &Self::Value)> + '_>;

    fn for_each_value_mut(&mut self, f: &mut dyn FnMut(&mut Self::Value));

    fn len(&self) -> usize;
}

impl<K: MapKey + Ord, V: Persist> MapLike for BTreeMap<K, V> {
    type Key = K;
    type Value = V;

    fn clear(&mut self) {
        BTreeMap::clear(self);
    }

    fn insert(&mut self, key: K, value: V) {
        BTreeMap::insert(self, key, value);
    }

    fn entries(&self) -> Box<dyn Iterator<Item = (&K, &V)> + '_> {
        Box::new(self.iter())
    }

    fn for_each_value_mut(&mut self, f: &mut dyn FnMut(&mut V)) {
        self.values_mut().for_each(f);
    }

    fn len(&self) -> usize {
        BTreeMap::len(self)
    }
}

impl<K: MapKey + Eq + Hash, V: Persist> MapLike for HashMap<K, V> {
    type Key = K;
    type Value = V;

    fn clear(&mut self) {
        HashMap::clear(self);
    }

    fn insert(&mut self, key: K, value: V) {
        HashMap::insert(self, key, value);
    }

    fn entries(&self) -> Box<dyn Iterator<Item = (&K, &V)> + '_> {
        Box::new(self.iter())
    }

    fn for_each_value_mut(&mut self, f: &mut dyn FnMut(&mut V)) {
        self.values_mut().for_each(f);
    }

    fn len(&self) -> usize {
        HashMap::len(self)
    }
}

// ---------------------------------------------------------------------------
// MapTranslator
// ---------------------------------------------------------------------------

/// Translates a [`MapLike`] to a map node keyed by stringified keys.
///
/// Null keys and keys containing `.` fail the whole save. Empty maps are
/// omitted.
pub struct MapTranslator<M: MapLike> {
    value: Arc<dyn Translator<M::Value>>,
}

impl<M: MapLike> MapTranslator<M> {
    fn fill(
        &self,
        node: &Node,
        target: &mut M,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        let Some(entries) = node.as_map() else {
            return Err(TranslateError::UnexpectedNode {
                path: path.to_string(),
                expected: "map",
                found: node.describe(),
            });
        };
        for (segment, child) in entries {
            let key = M::Key::from_segment(segment).map_err(|detail| {
                TranslateError::InvalidValue {
                    path: path.to_string(),
                    detail: format!("bad map key: {detail}"),
                }
            })?;
            if let Some(value) = self.value.load(child, ctx, &path.extend(segment.as_str()))? {
                target.insert(key, value);
            }
        }
        Ok(())
    }
}

impl<M: MapLike> Translator<M> for MapTranslator<M> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<M>> {
        if node.is_null() {
            return Ok(None);
        }
        let mut fresh = M::default();
        self.fill(node, &mut fresh, ctx, path)?;
        Ok(Some(fresh))
    }

    fn load_into(
        &self,
        node: &Node,
        slot: &mut M,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        if node.is_null() {
            return Ok(());
        }
        slot.clear();
        self.fill(node, slot, ctx, path)
    }

    fn save(
        &self,
        pojo: &M,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        if pojo.len() == 0 {
            return Ok(None);
        }
        let mut out = BTreeMap::new();
        for (key, value) in pojo.entries() {
            let segment = key.to_segment().ok_or_else(|| TranslateError::NullMapKey {
                path: path.to_string(),
            })?;
            if segment.contains('.') {
                return Err(TranslateError::DottedMapKey {
                    path: path.to_string(),
                    key: segment,
                });
            }
            let child_path = path.extend(segment.as_str());
            if let Some(node) = self.value.save(value, index, ctx, &child_path)? {
                out.insert(segment, node);
            }
        }
        if out.is_empty() {
            return Ok(None);
        }
        Ok(Some(Node::Map(out)))
    }

    fn prepare_save(&self, pojo: &mut M) {
        pojo.for_each_value_mut(&mut |value| self.value.prepare_save(value));
    }

    fn after_load(&self, pojo: &mut M) {
        pojo.for_each_value_mut(&mut |value| self.value.after_load(value));
    }

    fn repeats_embedded(&self) -> bool {
        self.value.repeats_embedded()
    }
}

/// Built-in translator for a [`MapLike`] type.
pub fn map_translator<M: MapLike>(
    cx: &mut CreateContext<'_>,
    key: &TypeKey,
    path: &Path,
) -> TranslateResult<Arc<dyn Translator<M>>> {
    let value = cx.translator::<M::Value>(&key.retarget::<M::Value>(), path)?;
    Ok(Arc::new(MapTranslator::<M> { value }))
}

impl<K: MapKey + Ord, V: Persist> Persist for BTreeMap<K, V> {
    const SHAPE: Shape = Shape::Structural;

    fn create(
        cx: &mut CreateContext<'_>,
        key: &TypeKey,
        path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<Self>>> {
        map_translator::<Self>(cx, key, path)
    }
}

impl<K: MapKey + Eq + Hash, V: Persist> Persist for HashMap<K, V> {
    const SHAPE: Shape = Shape::Structural;

    fn create(
        cx: &mut CreateContext<'_>,
        key: &TypeKey,
        path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<Self>>> {
        map_translator::<Self>(cx, key, path)
    }
}
