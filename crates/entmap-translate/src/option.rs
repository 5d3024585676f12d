use std::sync::Arc;

use entmap_types::Node;

use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::error::TranslateResult;
use crate::path::Path;
use crate::translator::{Persist, Shape, Translator};
use crate::type_key::TypeKey;

// ---------------------------------------------------------------------------
// Option<T>
// ---------------------------------------------------------------------------

/// Null-aware wrapper.
///
/// A null node loads as `None`. `None` saves as an explicit null, except
/// for structural inner types, where it is omitted like an empty container.
pub struct OptionTranslator<T> {
    inner: Arc<dyn Translator<T>>,
    omit_none: bool,
}

impl<T> Translator<Option<T>> for OptionTranslator<T> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Option<T>>> {
        if node.is_null() {
            return Ok(Some(None));
        }
        Ok(self.inner.load(node, ctx, path)?.map(Some))
    }

    fn load_into(
        &self,
        node: &Node,
        slot: &mut Option<T>,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        if node.is_null() {
            *slot = None;
            return Ok(());
        }
        match slot {
            Some(existing) => self.inner.load_into(node, existing, ctx, path),
            None => {
                if let Some(value) = self.inner.load(node, ctx, path)? {
                    *slot = Some(value);
                }
                Ok(())
            }
        }
    }

    fn save(
        &self,
        pojo: &Option<T>,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        match pojo {
            Some(value) => self.inner.save(value, index, ctx, path),
            None if self.omit_none => Ok(None),
            None => Ok(Some(Node::null(index))),
        }
    }

    fn prepare_save(&self, pojo: &mut Option<T>) {
        if let Some(value) = pojo {
            self.inner.prepare_save(value);
        }
    }

    fn after_load(&self, pojo: &mut Option<T>) {
        if let Some(value) = pojo {
            self.inner.after_load(value);
        }
    }

    fn is_pending(&self) -> bool {
        self.inner.is_pending()
    }

    fn repeats_embedded(&self) -> bool {
        self.inner.repeats_embedded()
    }
}

impl<T: Persist> Persist for Option<T> {
    const SHAPE: Shape = T::SHAPE;

    fn create(
        cx: &mut CreateContext<'_>,
        key: &TypeKey,
        path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<Self>>> {
        let inner = cx.translator::<T>(&key.retarget::<T>(), path)?;
        Ok(Arc::new(OptionTranslator {
            inner,
            omit_none: T::SHAPE == Shape::Structural,
        }))
    }
}

// ---------------------------------------------------------------------------
// Box<T>
// ---------------------------------------------------------------------------

/// Transparent wrapper; lets recursive classes hold themselves.
pub struct BoxTranslator<T> {
    inner: Arc<dyn Translator<T>>,
}

impl<T> Translator<Box<T>> for BoxTranslator<T> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Box<T>>> {
        Ok(self.inner.load(node, ctx, path)?.map(Box::new))
    }

    fn load_into(
        &self,
        node: &Node,
        slot: &mut Box<T>,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        self.inner.load_into(node, slot.as_mut(), ctx, path)
    }

    fn save(
        &self,
        pojo: &Box<T>,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        self.inner.save(pojo.as_ref(), index, ctx, path)
    }

    fn prepare_save(&self, pojo: &mut Box<T>) {
        self.inner.prepare_save(pojo.as_mut());
    }

    fn after_load(&self, pojo: &mut Box<T>) {
        self.inner.after_load(pojo.as_mut());
    }

    fn is_pending(&self) -> bool {
        self.inner.is_pending()
    }

    fn repeats_embedded(&self) -> bool {
        self.inner.repeats_embedded()
    }
}

impl<T: Persist> Persist for Box<T> {
    const SHAPE: Shape = T::SHAPE;

    fn create(
        cx: &mut CreateContext<'_>,
        key: &TypeKey,
        path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<Self>>> {
        let inner = cx.translator::<T>(&key.retarget::<T>(), path)?;
        Ok(Arc::new(BoxTranslator { inner }))
    }
}
