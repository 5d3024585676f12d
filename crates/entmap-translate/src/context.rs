use std::any::TypeId;
use std::sync::Arc;

use entmap_types::RawKey;

use crate::config::TranslateConfig;
use crate::entity::{Entity, EntityMetadata};
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::polymorphic::Hierarchy;
use crate::reference::PendingRef;
use crate::registry::Registry;
use crate::translator::{Persist, Shape, Translator};
use crate::type_key::TypeKey;

// ---------------------------------------------------------------------------
// CreateContext
// ---------------------------------------------------------------------------

/// State of one registration pass.
///
/// The registry's creation lock is taken once when a pass starts; nested
/// translator construction goes through this context instead of locking
/// again. Memo entries, entities and hierarchies created during a failed
/// pass are rolled back.
pub struct CreateContext<'r> {
    registry: &'r Registry,
    entities_in_progress: Vec<TypeId>,
    created: Vec<TypeKey>,
    registered: Vec<TypeId>,
    hierarchies: Vec<TypeId>,
    embedded_collections: Vec<EmbeddedCollection>,
}

/// An embedded collection whose element class may only be complete once
/// the whole pass has finished.
struct EmbeddedCollection {
    path: String,
    repeats: Box<dyn Fn() -> bool>,
}

/// What a failed pass has to undo.
pub(crate) struct Rollback {
    pub created: Vec<TypeKey>,
    pub registered: Vec<TypeId>,
    pub hierarchies: Vec<TypeId>,
}

impl<'r> CreateContext<'r> {
    pub(crate) fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            entities_in_progress: Vec::new(),
            created: Vec::new(),
            registered: Vec::new(),
            hierarchies: Vec::new(),
            embedded_collections: Vec::new(),
        }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn config(&self) -> &'r TranslateConfig {
        self.registry.config()
    }

    /// The translator for `key`, built through the factory chain.
    pub fn translator<P: Persist>(
        &mut self,
        key: &TypeKey,
        path: &Path,
    ) -> TranslateResult<Arc<dyn Translator<P>>> {
        let registry = self.registry;
        registry.resolve(self, key, path, P::SHAPE, |cx| P::create(cx, key, path))
    }

    /// Like [`Self::translator`], with an explicit shape and built-in.
    ///
    /// Used for types whose built-in translator depends on the annotation
    /// rather than the type, such as serialized fields.
    pub fn translator_with<P, F>(
        &mut self,
        key: &TypeKey,
        path: &Path,
        shape: Shape,
        builtin: F,
    ) -> TranslateResult<Arc<dyn Translator<P>>>
    where
        P: Send + Sync + 'static,
        F: FnOnce(&mut CreateContext<'_>) -> TranslateResult<Arc<dyn Translator<P>>>,
    {
        let registry = self.registry;
        registry.resolve(self, key, path, shape, builtin)
    }

    /// Make sure entity `E` is registered, registering it in this pass if
    /// needed. An entity whose registration is already under way counts as
    /// registered.
    pub fn require_entity<E: Entity>(&mut self) -> TranslateResult<()> {
        if self.entities_in_progress.contains(&TypeId::of::<E>()) {
            return Ok(());
        }
        let registry = self.registry;
        registry.register_in::<E>(self).map(|_| ())
    }

    pub(crate) fn begin_entity(&mut self, id: TypeId) {
        self.entities_in_progress.push(id);
    }

    pub(crate) fn end_entity(&mut self, id: TypeId) {
        self.entities_in_progress.retain(|existing| *existing != id);
    }

    pub(crate) fn record_created(&mut self, key: TypeKey) {
        self.created.push(key);
    }

    pub(crate) fn record_registered(&mut self, id: TypeId) {
        self.registered.push(id);
    }

    pub(crate) fn record_hierarchy(&mut self, root: TypeId, hierarchy: Arc<Hierarchy>) {
        if self.registry.record_hierarchy(root, hierarchy) {
            self.hierarchies.push(root);
        }
    }

    /// Re-check the element of an embedded collection at the end of the
    /// pass, when classes that were still pending here are complete.
    pub(crate) fn defer_embedded_collection<T: 'static>(
        &mut self,
        path: &Path,
        element: Arc<dyn Translator<T>>,
    ) {
        self.embedded_collections.push(EmbeddedCollection {
            path: path.to_string(),
            repeats: Box::new(move || element.repeats_embedded()),
        });
    }

    pub(crate) fn check_embedded_collections(&mut self) -> TranslateResult<()> {
        for collection in self.embedded_collections.drain(..) {
            if (collection.repeats)() {
                return Err(TranslateError::NestedEmbeddedCollection {
                    path: collection.path,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn take_rollback(&mut self) -> Rollback {
        Rollback {
            created: std::mem::take(&mut self.created),
            registered: std::mem::take(&mut self.registered),
            hierarchies: std::mem::take(&mut self.hierarchies),
        }
    }
}

// ---------------------------------------------------------------------------
// LoadContext
// ---------------------------------------------------------------------------

/// Per-episode load state: active load groups and pending references.
pub struct LoadContext<'r> {
    registry: &'r Registry,
    groups: Vec<String>,
    pending: Vec<PendingRef>,
}

impl<'r> LoadContext<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self::with_groups(registry, Vec::new())
    }

    pub fn with_groups(registry: &'r Registry, groups: Vec<String>) -> Self {
        Self {
            registry,
            groups,
            pending: Vec::new(),
        }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn config(&self) -> &'r TranslateConfig {
        self.registry.config()
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    /// Whether a field eager in `groups` should be fetched in this episode.
    ///
    /// An empty list means the field is always eager.
    pub fn is_eager(&self, groups: &[String]) -> bool {
        groups.is_empty() || groups.iter().any(|g| self.groups.contains(g))
    }

    /// Metadata of a registered entity.
    pub fn metadata<E: Entity>(&self) -> TranslateResult<Arc<EntityMetadata<E>>> {
        self.registry.metadata::<E>()
    }

    /// Record intent to fetch a referenced entity after this pass.
    pub fn defer(&mut self, pending: PendingRef) {
        self.pending.push(pending);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drain the references recorded so far.
    pub fn take_pending(&mut self) -> Vec<PendingRef> {
        std::mem::take(&mut self.pending)
    }
}

// ---------------------------------------------------------------------------
// SaveContext
// ---------------------------------------------------------------------------

/// Per-episode save state.
///
/// Records the keys of eager reference fields so a caching save engine can
/// keep them current on the next load.
pub struct SaveContext<'r> {
    registry: &'r Registry,
    references: Vec<(String, RawKey)>,
}

impl<'r> SaveContext<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            references: Vec::new(),
        }
    }

    pub fn registry(&self) -> &'r Registry {
        self.registry
    }

    pub fn config(&self) -> &'r TranslateConfig {
        self.registry.config()
    }

    pub fn register_reference(&mut self, path: &Path, key: RawKey) {
        self.references.push((path.to_string(), key));
    }

    /// `(dotted path, key)` of every eager reference saved so far.
    pub fn references(&self) -> &[(String, RawKey)] {
        &self.references
    }

    pub fn take_references(&mut self) -> Vec<(String, RawKey)> {
        std::mem::take(&mut self.references)
    }
}
