use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use tracing::debug;

use crate::config::TranslateConfig;
use crate::context::{CreateContext, Rollback};
use crate::entity::{Entity, EntityMetadata};
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::polymorphic::Hierarchy;
use crate::translator::{
    erase, unerase, ErasedTranslator, Pending, Persist, Shape, Translator,
};
use crate::type_key::TypeKey;

// ---------------------------------------------------------------------------
// Factories
// ---------------------------------------------------------------------------

/// Priority band of a custom factory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FactoryBand {
    /// Tried first; overrides even the built-in collections and maps.
    Early,
    /// Tried after the built-in structural translators and before the
    /// built-in scalar, class and reference translators.
    Normal,
}

/// A custom source of translators.
///
/// Returning `None` passes the type on to the next factory in the chain.
/// A returned translator must be an erased `Arc<dyn Translator<P>>` for the
/// type named by `key`.
pub trait TranslatorFactory: Send + Sync {
    /// Human-readable factory name, for logs.
    fn name(&self) -> &str;

    fn create(
        &self,
        key: &TypeKey,
        cx: &mut CreateContext<'_>,
        path: &Path,
    ) -> Option<TranslateResult<ErasedTranslator>>;
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// The translator registry.
///
/// Built once with its factories, then shared. Translators are memoized per
/// [`TypeKey`]; entity metadata is memoized per type, so registering the
/// same entity twice returns the same `Arc`. Lookups are safe from any
/// number of threads; construction is serialized by a creation lock taken
/// once per registration pass.
pub struct Registry {
    config: TranslateConfig,
    early: Vec<Box<dyn TranslatorFactory>>,
    normal: Vec<Box<dyn TranslatorFactory>>,
    translators: RwLock<HashMap<TypeKey, ErasedTranslator>>,
    entities: RwLock<HashMap<TypeId, Arc<dyn Any + Send + Sync>>>,
    kinds: RwLock<HashMap<String, (TypeId, &'static str)>>,
    hierarchies: RwLock<HashMap<TypeId, Arc<Hierarchy>>>,
    creation: Mutex<()>,
}

impl Registry {
    /// Create a registry with the default configuration and no factories.
    pub fn new() -> Self {
        Self::with_config(TranslateConfig::default())
    }

    pub fn with_config(config: TranslateConfig) -> Self {
        Self {
            config,
            early: Vec::new(),
            normal: Vec::new(),
            translators: RwLock::new(HashMap::new()),
            entities: RwLock::new(HashMap::new()),
            kinds: RwLock::new(HashMap::new()),
            hierarchies: RwLock::new(HashMap::new()),
            creation: Mutex::new(()),
        }
    }

    /// Append a factory to the end of `band`.
    pub fn add_factory(&mut self, band: FactoryBand, factory: Box<dyn TranslatorFactory>) {
        debug!(factory = factory.name(), ?band, "added translator factory");
        match band {
            FactoryBand::Early => self.early.push(factory),
            FactoryBand::Normal => self.normal.push(factory),
        }
    }

    pub fn config(&self) -> &TranslateConfig {
        &self.config
    }

    /// Number of factories across both bands.
    pub fn factory_count(&self) -> usize {
        self.early.len() + self.normal.len()
    }

    /// Number of memoized translators.
    pub fn translator_count(&self) -> usize {
        self.translators.read().expect("lock poisoned").len()
    }

    // -- entities -----------------------------------------------------------

    /// Register entity `E`, building its metadata and every translator it
    /// needs. Configuration errors surface here.
    pub fn register<E: Entity>(&self) -> TranslateResult<Arc<EntityMetadata<E>>> {
        if let Some(existing) = self.lookup::<E>() {
            return Ok(existing);
        }
        self.with_pass(|cx| self.register_in::<E>(cx))
    }

    /// Metadata of an already registered entity.
    pub fn metadata<E: Entity>(&self) -> TranslateResult<Arc<EntityMetadata<E>>> {
        self.lookup::<E>().ok_or_else(|| TranslateError::NotRegistered {
            type_name: type_name::<E>().to_string(),
        })
    }

    pub fn is_registered<E: 'static>(&self) -> bool {
        self.entities
            .read()
            .expect("lock poisoned")
            .contains_key(&TypeId::of::<E>())
    }

    /// Name of the type registered under `kind`.
    pub fn kind_owner(&self, kind: &str) -> Option<&'static str> {
        let kinds = self.kinds.read().expect("lock poisoned");
        kinds.get(kind).map(|(_, owner)| *owner)
    }

    /// All registered kinds, sorted.
    pub fn kinds(&self) -> Vec<String> {
        let kinds = self.kinds.read().expect("lock poisoned");
        let mut out: Vec<String> = kinds.keys().cloned().collect();
        out.sort();
        out
    }

    fn lookup<E: Entity>(&self) -> Option<Arc<EntityMetadata<E>>> {
        let entities = self.entities.read().expect("lock poisoned");
        let erased = entities.get(&TypeId::of::<E>())?.clone();
        Arc::downcast::<EntityMetadata<E>>(erased).ok()
    }

    pub(crate) fn register_in<E: Entity>(
        &self,
        cx: &mut CreateContext<'_>,
    ) -> TranslateResult<Arc<EntityMetadata<E>>> {
        if let Some(existing) = self.lookup::<E>() {
            return Ok(existing);
        }
        let id = TypeId::of::<E>();
        cx.begin_entity(id);
        let codec = E::codec(cx, &Path::root());
        cx.end_entity(id);
        let metadata = Arc::new(EntityMetadata::new(codec?));

        {
            let mut kinds = self.kinds.write().expect("lock poisoned");
            if let Some((owner, owner_name)) = kinds.get(metadata.kind()) {
                if *owner != id {
                    return Err(TranslateError::DuplicateKind {
                        kind: metadata.kind().to_string(),
                        first: owner_name.to_string(),
                        second: type_name::<E>().to_string(),
                    });
                }
            }
            kinds.insert(metadata.kind().to_string(), (id, type_name::<E>()));
        }
        self.entities
            .write()
            .expect("lock poisoned")
            .insert(id, metadata.clone());
        cx.record_registered(id);

        debug!(kind = %metadata.kind(), type_name = type_name::<E>(), "registered entity");
        Ok(metadata)
    }

    // -- polymorphic hierarchies ---------------------------------------------

    /// Returns `true` when `root` had no hierarchy before.
    pub(crate) fn record_hierarchy(&self, root: TypeId, hierarchy: Arc<Hierarchy>) -> bool {
        self.hierarchies
            .write()
            .expect("lock poisoned")
            .insert(root, hierarchy)
            .is_none()
    }

    /// The discriminator table of polymorphic root `R`, once built.
    pub fn hierarchy<R: 'static>(&self) -> Option<Arc<Hierarchy>> {
        let hierarchies = self.hierarchies.read().expect("lock poisoned");
        hierarchies.get(&TypeId::of::<R>()).cloned()
    }

    /// The discriminator registered for class `V` in any hierarchy.
    pub fn discriminator_of<V: 'static>(&self) -> Option<String> {
        let hierarchies = self.hierarchies.read().expect("lock poisoned");
        hierarchies.values().find_map(|h| {
            h.variant_by_type(TypeId::of::<V>())
                .map(|v| v.discriminator.clone())
        })
    }

    // -- translators --------------------------------------------------------

    /// The translator for `P` without annotations.
    pub fn translator<P: Persist>(&self) -> TranslateResult<Arc<dyn Translator<P>>> {
        self.translator_for::<P>(&TypeKey::of::<P>())
    }

    /// The translator for `key`, which must name `P`.
    pub fn translator_for<P: Persist>(
        &self,
        key: &TypeKey,
    ) -> TranslateResult<Arc<dyn Translator<P>>> {
        if !key.is::<P>() {
            return Err(TranslateError::FactoryMismatch {
                type_name: key.type_name().to_string(),
            });
        }
        self.with_pass(|cx| cx.translator::<P>(key, &Path::root()))
    }

    /// Run one registration pass under the creation lock, rolling back
    /// everything it created if it fails.
    fn with_pass<T>(
        &self,
        pass: impl FnOnce(&mut CreateContext<'_>) -> TranslateResult<T>,
    ) -> TranslateResult<T> {
        let _guard = self.creation.lock().expect("lock poisoned");
        let mut cx = CreateContext::new(self);
        let result = pass(&mut cx).and_then(|value| {
            cx.check_embedded_collections()?;
            Ok(value)
        });
        if result.is_err() {
            self.rollback(&mut cx);
        }
        result
    }

    fn rollback(&self, cx: &mut CreateContext<'_>) {
        let Rollback {
            created,
            registered,
            hierarchies,
        } = cx.take_rollback();
        {
            let mut translators = self.translators.write().expect("lock poisoned");
            for key in &created {
                translators.remove(key);
            }
        }
        {
            let mut entities = self.entities.write().expect("lock poisoned");
            for id in &registered {
                entities.remove(id);
            }
        }
        self.kinds
            .write()
            .expect("lock poisoned")
            .retain(|_, (owner, _)| !registered.contains(owner));
        {
            let mut recorded = self.hierarchies.write().expect("lock poisoned");
            for root in &hierarchies {
                recorded.remove(root);
            }
        }
        debug!(
            translators = created.len(),
            entities = registered.len(),
            hierarchies = hierarchies.len(),
            "rolled back failed registration"
        );
    }

    fn cached(&self, key: &TypeKey) -> Option<ErasedTranslator> {
        self.translators
            .read()
            .expect("lock poisoned")
            .get(key)
            .cloned()
    }

    /// Memo lookup, then the factory chain: early factories, built-in
    /// structural translators, normal factories, remaining built-ins.
    pub(crate) fn resolve<P, F>(
        &self,
        cx: &mut CreateContext<'_>,
        key: &TypeKey,
        path: &Path,
        shape: Shape,
        builtin: F,
    ) -> TranslateResult<Arc<dyn Translator<P>>>
    where
        P: Send + Sync + 'static,
        F: FnOnce(&mut CreateContext<'_>) -> TranslateResult<Arc<dyn Translator<P>>>,
    {
        if let Some(erased) = self.cached(key) {
            return unerase::<P>(&erased).ok_or_else(|| TranslateError::FactoryMismatch {
                type_name: key.type_name().to_string(),
            });
        }

        let pending = Arc::new(Pending::<P>::new(key.type_name()));
        let placeholder: Arc<dyn Translator<P>> = pending.clone();
        self.translators
            .write()
            .expect("lock poisoned")
            .insert(key.clone(), erase(placeholder));
        cx.record_created(key.clone());

        match self.run_chain(cx, key, path, shape, builtin) {
            Ok(translator) => {
                pending.fill(Arc::clone(&translator));
                self.translators
                    .write()
                    .expect("lock poisoned")
                    .insert(key.clone(), erase(Arc::clone(&translator)));
                debug!(type_name = key.type_name(), path = %path, "created translator");
                Ok(translator)
            }
            Err(err) => {
                self.translators
                    .write()
                    .expect("lock poisoned")
                    .remove(key);
                Err(err)
            }
        }
    }

    fn run_chain<P, F>(
        &self,
        cx: &mut CreateContext<'_>,
        key: &TypeKey,
        path: &Path,
        shape: Shape,
        builtin: F,
    ) -> TranslateResult<Arc<dyn Translator<P>>>
    where
        P: Send + Sync + 'static,
        F: FnOnce(&mut CreateContext<'_>) -> TranslateResult<Arc<dyn Translator<P>>>,
    {
        for factory in &self.early {
            if let Some(result) = factory.create(key, cx, path) {
                return adopt::<P>(key, factory.name(), result?);
            }
        }
        if shape != Shape::Structural {
            for factory in &self.normal {
                if let Some(result) = factory.create(key, cx, path) {
                    return adopt::<P>(key, factory.name(), result?);
                }
            }
        }
        builtin(cx)
    }
}

fn adopt<P: 'static>(
    key: &TypeKey,
    factory: &str,
    erased: ErasedTranslator,
) -> TranslateResult<Arc<dyn Translator<P>>> {
    debug!(factory, type_name = key.type_name(), "factory claimed type");
    unerase::<P>(&erased).ok_or_else(|| TranslateError::FactoryMismatch {
        type_name: key.type_name().to_string(),
    })
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("factories", &self.factory_count())
            .field("translators", &self.translator_count())
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{LoadContext, SaveContext};
    use crate::leaf::{LeafTranslator, ValueCodec};
    use entmap_types::{Node, Value};

    /// Stores strings upper-cased.
    struct Shouting;

    impl ValueCodec<String> for Shouting {
        fn load_value(&self, value: &Value, path: &Path, _config: &TranslateConfig) -> TranslateResult<String> {
            match value {
                Value::String(s) => Ok(s.to_lowercase()),
                other => Err(TranslateError::UnexpectedNode {
                    path: path.to_string(),
                    expected: "string",
                    found: other.type_name(),
                }),
            }
        }

        fn save_value(&self, pojo: &String, _path: &Path, _config: &TranslateConfig) -> TranslateResult<Value> {
            Ok(Value::String(pojo.to_uppercase()))
        }
    }

    struct ShoutingFactory;

    impl TranslatorFactory for ShoutingFactory {
        fn name(&self) -> &str {
            "shouting"
        }

        fn create(
            &self,
            key: &TypeKey,
            _cx: &mut CreateContext<'_>,
            _path: &Path,
        ) -> Option<TranslateResult<ErasedTranslator>> {
            key.is::<String>().then(|| {
                let translator: Arc<dyn Translator<String>> =
                    Arc::new(LeafTranslator::<String, _>::new(Shouting));
                Ok(erase(translator))
            })
        }
    }

    /// Claims `Vec<i64>` and stores it as a comma-joined string.
    struct JoinedFactory;

    struct Joined;

    impl ValueCodec<Vec<i64>> for Joined {
        fn load_value(&self, value: &Value, path: &Path, _config: &TranslateConfig) -> TranslateResult<Vec<i64>> {
            let Value::String(s) = value else {
                return Err(path.illegal_state("expected joined string"));
            };
            s.split(',')
                .filter(|part| !part.is_empty())
                .map(|part| {
                    part.parse().map_err(|_| TranslateError::InvalidValue {
                        path: path.to_string(),
                        detail: part.to_string(),
                    })
                })
                .collect()
        }

        fn save_value(&self, pojo: &Vec<i64>, _path: &Path, _config: &TranslateConfig) -> TranslateResult<Value> {
            let parts: Vec<String> = pojo.iter().map(i64::to_string).collect();
            Ok(Value::String(parts.join(",")))
        }
    }

    impl TranslatorFactory for JoinedFactory {
        fn name(&self) -> &str {
            "joined"
        }

        fn create(
            &self,
            key: &TypeKey,
            _cx: &mut CreateContext<'_>,
            _path: &Path,
        ) -> Option<TranslateResult<ErasedTranslator>> {
            key.is::<Vec<i64>>().then(|| {
                let translator: Arc<dyn Translator<Vec<i64>>> =
                    Arc::new(LeafTranslator::<Vec<i64>, _>::new(Joined));
                Ok(erase(translator))
            })
        }
    }

    /// Claims `String` but hands back a translator for `i64`.
    struct LyingFactory;

    impl TranslatorFactory for LyingFactory {
        fn name(&self) -> &str {
            "lying"
        }

        fn create(
            &self,
            key: &TypeKey,
            cx: &mut CreateContext<'_>,
            path: &Path,
        ) -> Option<TranslateResult<ErasedTranslator>> {
            key.is::<String>().then(|| {
                cx.translator::<i64>(&TypeKey::of::<i64>(), path)
                    .map(erase)
            })
        }
    }

    struct Money;
    impl Persist for Money {}

    #[test]
    fn memoizes_per_type_key() {
        let registry = Registry::new();
        let a = registry.translator::<i64>().unwrap();
        let b = registry.translator::<i64>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let count = registry.translator_count();
        registry.translator::<String>().unwrap();
        assert_eq!(registry.translator_count(), count + 1);
    }

    #[test]
    fn opaque_type_without_factory_is_config_error() {
        let registry = Registry::new();
        let err = registry.translator::<Money>().err().unwrap();
        assert!(matches!(err, TranslateError::NoTranslator { .. }));
        assert_eq!(err.phase(), crate::error::Phase::Config);
        assert_eq!(registry.translator_count(), 0);
    }

    #[test]
    fn normal_factory_overrides_scalars() {
        let mut registry = Registry::new();
        registry.add_factory(FactoryBand::Normal, Box::new(ShoutingFactory));
        let translator = registry.translator::<String>().unwrap();
        let mut ctx = SaveContext::new(&registry);
        let node = translator
            .save(&"hello".to_string(), true, &mut ctx, &Path::root())
            .unwrap()
            .unwrap();
        assert_eq!(node, Node::indexed("HELLO"));
    }

    #[test]
    fn normal_factory_does_not_override_collections() {
        let mut registry = Registry::new();
        registry.add_factory(FactoryBand::Normal, Box::new(JoinedFactory));
        let translator = registry.translator::<Vec<i64>>().unwrap();
        let mut ctx = SaveContext::new(&registry);
        let node = translator
            .save(&vec![1, 2], false, &mut ctx, &Path::root())
            .unwrap()
            .unwrap();
        assert!(matches!(node, Node::List(_)));
    }

    #[test]
    fn early_factory_overrides_collections() {
        let mut registry = Registry::new();
        registry.add_factory(FactoryBand::Early, Box::new(JoinedFactory));
        let translator = registry.translator::<Vec<i64>>().unwrap();
        let mut save = SaveContext::new(&registry);
        let node = translator
            .save(&vec![1, 2, 3], false, &mut save, &Path::root())
            .unwrap()
            .unwrap();
        assert_eq!(node, Node::unindexed("1,2,3"));

        let mut load = LoadContext::new(&registry);
        let back = translator.load(&node, &mut load, &Path::root()).unwrap();
        assert_eq!(back, Some(vec![1, 2, 3]));
    }

    #[test]
    fn factory_type_mismatch_is_detected() {
        let mut registry = Registry::new();
        registry.add_factory(FactoryBand::Early, Box::new(LyingFactory));
        let err = registry.translator::<String>().err().unwrap();
        assert!(matches!(err, TranslateError::FactoryMismatch { .. }));
    }

    #[test]
    fn translator_for_rejects_foreign_key() {
        let registry = Registry::new();
        let err = registry
            .translator_for::<i64>(&TypeKey::of::<String>())
            .err()
            .unwrap();
        assert!(matches!(err, TranslateError::FactoryMismatch { .. }));
    }

    #[test]
    fn concurrent_lookups_share_translators() {
        let registry = Arc::new(Registry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.translator::<Vec<String>>().unwrap())
            })
            .collect();
        let translators: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for t in &translators[1..] {
            assert!(Arc::ptr_eq(&translators[0], t));
        }
    }

    #[test]
    fn debug_lists_counts() {
        let registry = Registry::new();
        let debug = format!("{registry:?}");
        assert!(debug.contains("Registry"));
        assert!(debug.contains("translators"));
    }
}
