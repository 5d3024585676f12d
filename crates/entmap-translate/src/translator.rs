use std::any::Any;
use std::sync::{Arc, OnceLock};

use entmap_types::Node;

use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::type_key::TypeKey;

// ---------------------------------------------------------------------------
// Translator
// ---------------------------------------------------------------------------

/// A stateless, bidirectional translation unit for one node of type `P`.
///
/// `Ok(None)` is the skip signal: on save it means "this node contributes
/// nothing", on load it means "leave the slot untouched". Translators are
/// shared across episodes and must not hold per-episode state.
pub trait Translator<P>: Send + Sync {
    /// Decode `node` into a fresh value.
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<P>>;

    /// Decode `node` into an existing slot.
    ///
    /// Containers override this to recycle the instance already held by
    /// the slot instead of replacing it.
    fn load_into(
        &self,
        node: &Node,
        slot: &mut P,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        if let Some(value) = self.load(node, ctx, path)? {
            *slot = value;
        }
        Ok(())
    }

    /// Encode `pojo`. `index` is the index flag inherited from the parent.
    fn save(
        &self,
        pojo: &P,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>>;

    /// Run before-save hooks of every class reachable from `pojo`.
    fn prepare_save(&self, _pojo: &mut P) {}

    /// Run after-load hooks of every class reachable from `pojo`.
    fn after_load(&self, _pojo: &mut P) {}

    /// `true` only for a placeholder whose construction has not finished.
    fn is_pending(&self) -> bool {
        false
    }

    /// `true` if values of this type contain a collection of embedded
    /// classes somewhere below them.
    fn repeats_embedded(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Persist
// ---------------------------------------------------------------------------

/// Which built-in band resolves a type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Shape {
    /// Leaf codecs.
    Scalar,
    /// Arrays, collections and maps. Built-ins win over normal factories.
    Structural,
    /// Embedded classes, entities and polymorphic hierarchies.
    Class,
    /// Cross-entity references.
    Reference,
    /// No built-in translator; only custom factories can resolve the type.
    Opaque,
}

/// A type the engine can translate.
///
/// Implemented for the scalar, structural and reference types the engine
/// knows, and for user classes through the [`persist!`](crate::persist)
/// macro. A bare `impl Persist for T {}` declares an opaque type that must
/// be handled by a registered factory.
pub trait Persist: Sized + Send + Sync + 'static {
    const SHAPE: Shape = Shape::Opaque;

    /// Build the built-in translator for this type.
    fn create(
        _cx: &mut CreateContext<'_>,
        key: &TypeKey,
        path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<Self>>> {
        Err(TranslateError::NoTranslator {
            type_name: key.type_name().to_string(),
            path: path.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Type erasure
// ---------------------------------------------------------------------------

/// A translator of unknown value type, as stored in the registry memo.
pub type ErasedTranslator = Arc<dyn Any + Send + Sync>;

pub fn erase<P: 'static>(translator: Arc<dyn Translator<P>>) -> ErasedTranslator {
    Arc::new(translator)
}

/// Recover the typed translator, or `None` if `erased` is for another type.
pub fn unerase<P: 'static>(erased: &ErasedTranslator) -> Option<Arc<dyn Translator<P>>> {
    erased.downcast_ref::<Arc<dyn Translator<P>>>().cloned()
}

// ---------------------------------------------------------------------------
// Pending placeholder
// ---------------------------------------------------------------------------

/// Memo entry inserted before a translator is built.
///
/// A recursive type that reaches itself during construction receives this
/// placeholder, which forwards to the real translator once it is filled.
pub(crate) struct Pending<P> {
    type_name: &'static str,
    cell: OnceLock<Arc<dyn Translator<P>>>,
}

impl<P> Pending<P> {
    pub(crate) fn new(type_name: &'static str) -> Self {
        Self {
            type_name,
            cell: OnceLock::new(),
        }
    }

    pub(crate) fn fill(&self, translator: Arc<dyn Translator<P>>) {
        let _ = self.cell.set(translator);
    }

    fn target(&self, path: &Path) -> TranslateResult<&Arc<dyn Translator<P>>> {
        self.cell.get().ok_or_else(|| {
            path.illegal_state(format!(
                "translator for {} used before construction finished",
                self.type_name
            ))
        })
    }
}

impl<P> Translator<P> for Pending<P> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<P>> {
        self.target(path)?.load(node, ctx, path)
    }

    fn load_into(
        &self,
        node: &Node,
        slot: &mut P,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        self.target(path)?.load_into(node, slot, ctx, path)
    }

    fn save(
        &self,
        pojo: &P,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        self.target(path)?.save(pojo, index, ctx, path)
    }

    fn prepare_save(&self, pojo: &mut P) {
        if let Some(target) = self.cell.get() {
            target.prepare_save(pojo);
        }
    }

    fn after_load(&self, pojo: &mut P) {
        if let Some(target) = self.cell.get() {
            target.after_load(pojo);
        }
    }

    fn is_pending(&self) -> bool {
        self.cell.get().is_none()
    }

    fn repeats_embedded(&self) -> bool {
        self.cell.get().is_some_and(|target| target.repeats_embedded())
    }
}
