use std::collections::{BTreeSet, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

use entmap_types::Node;

use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::translator::{Persist, Shape, Translator};
use crate::type_key::TypeKey;

// ---------------------------------------------------------------------------
// Collection
// ---------------------------------------------------------------------------

/// A growable container the engine can clear and refill in place.
///
/// Implemented for `Vec`, `VecDeque`, `BTreeSet` and `HashSet`. User types
/// implement it and opt in with `persist!(collection T)`; their instance
/// state (ordering, comparator flags) survives loads because the slot is
/// recycled rather than replaced.
pub trait Collection: Default + Send + Sync + 'static {
    type Item: Persist;

    fn clear(&mut self);

    fn insert(&mut self, item: Self::Item);

    fn items(&self) -> Box<dyn Iterator<Item = &Self::Item> + '_>;

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut Self::Item));

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Persist> Collection for Vec<T> {
    type Item = T;

    fn clear(&mut self) {
        Vec::clear(self);
    }

    fn insert(&mut self, item: T) {
        self.push(item);
    }

    fn items(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        Box::new(self.iter())
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut T)) {
        self.iter_mut().for_each(f);
    }

    fn len(&self) -> usize {
        Vec::len(self)
    }
}

impl<T: Persist> Collection for VecDeque<T> {
    type Item = T;

    fn clear(&mut self) {
        VecDeque::clear(self);
    }

    fn insert(&mut self, item: T) {
        self.push_back(item);
    }

    fn items(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        Box::new(self.iter())
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut T)) {
        self.iter_mut().for_each(f);
    }

    fn len(&self) -> usize {
        VecDeque::len(self)
    }
}

impl<T: Persist + Ord> Collection for BTreeSet<T> {
    type Item = T;

    fn clear(&mut self) {
        BTreeSet::clear(self);
    }

    fn insert(&mut self, item: T) {
        BTreeSet::insert(self, item);
    }

    fn items(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        Box::new(self.iter())
    }

    // Set members are immutable in place; hooks run on a drained copy.
    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut T)) {
        *self = std::mem::take(self)
            .into_iter()
            .map(|mut item| {
                f(&mut item);
                item
            })
            .collect();
    }

    fn len(&self) -> usize {
        BTreeSet::len(self)
    }
}

impl<T: Persist + Eq + Hash> Collection for HashSet<T> {
    type Item = T;

    fn clear(&mut self) {
        HashSet::clear(self);
    }

    fn insert(&mut self, item: T) {
        HashSet::insert(self, item);
    }

    fn items(&self) -> Box<dyn Iterator<Item = &T> + '_> {
        Box::new(self.iter())
    }

    fn for_each_mut(&mut self, f: &mut dyn FnMut(&mut T)) {
        *self = std::mem::take(self)
            .into_iter()
            .map(|mut item| {
                f(&mut item);
                item
            })
            .collect();
    }

    fn len(&self) -> usize {
        HashSet::len(self)
    }
}

// ---------------------------------------------------------------------------
// Element handling shared by collections and arrays
// ---------------------------------------------------------------------------

/// Build the element translator, rejecting a second axis of embedded
/// collections.
///
/// Class elements are checked again when the pass ends: a class reached
/// through a cycle still pending here may turn out to hold a collection.
fn element_translator<T: Persist>(
    cx: &mut CreateContext<'_>,
    key: &TypeKey,
    path: &Path,
) -> TranslateResult<Arc<dyn Translator<T>>> {
    let element = cx.translator::<T>(&key.retarget::<T>(), path)?;
    let embedded = T::SHAPE == Shape::Class;
    if element.repeats_embedded() || (embedded && element.is_pending()) {
        return Err(TranslateError::NestedEmbeddedCollection {
            path: path.to_string(),
        });
    }
    if embedded {
        cx.defer_embedded_collection(path, Arc::clone(&element));
    }
    Ok(element)
}

/// The list members of `node`. A lone value loads as a one-element list.
fn members(node: &Node) -> &[Node] {
    match node {
        Node::List(items) => items,
        other => std::slice::from_ref(other),
    }
}

fn save_elements<'a, T: 'a>(
    element: &dyn Translator<T>,
    items: impl Iterator<Item = &'a T>,
    index: bool,
    ctx: &mut SaveContext<'_>,
    path: &Path,
) -> TranslateResult<Option<Node>> {
    let mut out = Vec::new();
    for item in items {
        if let Some(node) = element.save(item, index, ctx, path)? {
            out.push(node);
        }
    }
    if out.is_empty() {
        return Ok(None);
    }
    Ok(Some(Node::List(out)))
}

// ---------------------------------------------------------------------------
// CollectionTranslator
// ---------------------------------------------------------------------------

/// Translates a [`Collection`] to a list node.
///
/// Empty collections are omitted. Elements that load as the skip signal
/// are dropped. An existing instance in the slot is cleared and refilled.
pub struct CollectionTranslator<C: Collection> {
    element: Arc<dyn Translator<C::Item>>,
    embedded: bool,
}

impl<C: Collection> CollectionTranslator<C> {
    fn fill(
        &self,
        node: &Node,
        target: &mut C,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        for member in members(node) {
            if let Some(item) = self.element.load(member, ctx, path)? {
                target.insert(item);
            }
        }
        Ok(())
    }
}

impl<C: Collection> Translator<C> for CollectionTranslator<C> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<C>> {
        if node.is_null() {
            return Ok(None);
        }
        let mut fresh = C::default();
        self.fill(node, &mut fresh, ctx, path)?;
        Ok(Some(fresh))
    }

    fn load_into(
        &self,
        node: &Node,
        slot: &mut C,
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
        pojo: &C,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        if pojo.is_empty() {
            return Ok(None);
        }
        save_elements(self.element.as_ref(), pojo.items(), index, ctx, path)
    }

    fn prepare_save(&self, pojo: &mut C) {
        pojo.for_each_mut(&mut |item| self.element.prepare_save(item));
    }

    fn after_load(&self, pojo: &mut C) {
        pojo.for_each_mut(&mut |item| self.element.after_load(item));
    }

    fn repeats_embedded(&self) -> bool {
        self.embedded
    }
}

/// Built-in translator for a [`Collection`] type.
pub fn collection_translator<C: Collection>(
    cx: &mut CreateContext<'_>,
    key: &TypeKey,
    path: &Path,
) -> TranslateResult<Arc<dyn Translator<C>>> {
    let element = element_translator::<C::Item>(cx, key, path)?;
    Ok(Arc::new(CollectionTranslator::<C> {
        element,
        embedded: <C::Item as Persist>::SHAPE == Shape::Class,
    }))
}

// ---------------------------------------------------------------------------
// ArrayTranslator
// ---------------------------------------------------------------------------

/// Translates a boxed slice. Arrays never recycle: each load allocates a
/// slice sized to the surviving elements.
pub struct ArrayTranslator<T> {
    element: Arc<dyn Translator<T>>,
    embedded: bool,
}

impl<T> Translator<Box<[T]>> for ArrayTranslator<T> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Box<[T]>>> {
        if node.is_null() {
            return Ok(None);
        }
        let mut out = Vec::new();
        for member in members(node) {
            if let Some(item) = self.element.load(member, ctx, path)? {
                out.push(item);
            }
        }
        Ok(Some(out.into_boxed_slice()))
    }

    fn save(
        &self,
        pojo: &Box<[T]>,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        if pojo.is_empty() {
            return Ok(None);
        }
        save_elements(self.element.as_ref(), pojo.iter(), index, ctx, path)
    }

    fn prepare_save(&self, pojo: &mut Box<[T]>) {
        pojo.iter_mut().for_each(|item| self.element.prepare_save(item));
    }

    fn after_load(&self, pojo: &mut Box<[T]>) {
        pojo.iter_mut().for_each(|item| self.element.after_load(item));
    }

    fn repeats_embedded(&self) -> bool {
        self.embedded
    }
}

// ---------------------------------------------------------------------------
// Built-in structural types
// ---------------------------------------------------------------------------

macro_rules! collection {
    ($ty:ident < T $(: $($bound:path),+)? >) => {
        impl<T: Persist $($(+ $bound)+)?> Persist for $ty<T> {
            const SHAPE: Shape = Shape::Structural;

            fn create(
                cx: &mut CreateContext<'_>,
                key: &TypeKey,
                path: &Path,
            ) -> TranslateResult<Arc<dyn Translator<Self>>> {
                collection_translator::<Self>(cx, key, path)
            }
        }
    };
}

collection!(Vec<T>);
collection!(VecDeque<T>);
collection!(BTreeSet<T: Ord>);
collection!(HashSet<T: Eq, Hash>);

impl<T: Persist> Persist for Box<[T]> {
    const SHAPE: Shape = Shape::Structural;

    fn create(
        cx: &mut CreateContext<'_>,
        key: &TypeKey,
        path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<Self>>> {
        let element = element_translator::<T>(cx, key, path)?;
        Ok(Arc::new(ArrayTranslator {
            element,
            embedded: T::SHAPE == Shape::Class,
        }))
    }
}
