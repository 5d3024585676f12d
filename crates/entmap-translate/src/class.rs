use std::any::type_name;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use entmap_types::{Key, KeyId, Node, RawKey, Value};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::error::{TranslateError, TranslateResult};
use crate::leaf::{LeafTranslator, SerializedCodec};
use crate::path::Path;
use crate::translator::{Persist, Shape, Translator};
use crate::type_key::{short_type_name, Annotation, TypeKey};

/// Property under which an embedded class with an id stores its key.
pub const KEY_PROPERTY: &str = "__key__";

const RESERVED_NAMES: &[&str] = &[KEY_PROPERTY, "^d", "^i"];

// ---------------------------------------------------------------------------
// Class
// ---------------------------------------------------------------------------

/// A struct translated member by member into a map node.
///
/// `describe` runs once per registration and declares everything the
/// populator needs: constructor, fields in declared order, class-level
/// index default, id and parent members, superclass population and
/// lifecycle hooks.
///
/// ```ignore
/// impl Class for Car {
///     fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
///         class.default_constructor().kind("Car").index();
///         class.id("id", |c| &c.id, |c| &mut c.id)?;
///         class.field("plate", |c| &c.plate, |c| &mut c.plate)?;
///         Ok(())
///     }
/// }
/// ```
pub trait Class: Persist {
    fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()>;
}

/// Lifecycle hook.
pub type Hook<P> = Arc<dyn Fn(&mut P) + Send + Sync>;

// ---------------------------------------------------------------------------
// Field options
// ---------------------------------------------------------------------------

enum IndexPolicy<F> {
    /// Class default, else the index flag of the enclosing node.
    Inherit,
    Fixed(bool),
    /// Decided per value at save time.
    When(fn(&F) -> bool),
}

impl<F> Clone for IndexPolicy<F> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<F> Copy for IndexPolicy<F> {}

/// Per-field options.
pub struct Field<F> {
    index: IndexPolicy<F>,
    conflicting: bool,
    aliases: Vec<String>,
    ignore_save_when: Option<fn(&F) -> bool>,
    ignore_load: bool,
    annotations: Vec<Annotation>,
}

impl<F> Field<F> {
    pub fn new() -> Self {
        Self {
            index: IndexPolicy::Inherit,
            conflicting: false,
            aliases: Vec::new(),
            ignore_save_when: None,
            ignore_load: false,
            annotations: Vec::new(),
        }
    }

    pub fn index(self) -> Self {
        self.with_index(IndexPolicy::Fixed(true))
    }

    pub fn unindex(self) -> Self {
        self.with_index(IndexPolicy::Fixed(false))
    }

    /// Index only the values for which `predicate` holds.
    pub fn index_when(self, predicate: fn(&F) -> bool) -> Self {
        self.with_index(IndexPolicy::When(predicate))
    }

    fn with_index(mut self, policy: IndexPolicy<F>) -> Self {
        if !matches!(self.index, IndexPolicy::Inherit) {
            self.conflicting = true;
        }
        self.index = policy;
        self
    }

    /// Also load the field from a legacy property name.
    pub fn alias(mut self, name: impl Into<String>) -> Self {
        self.aliases.push(name.into());
        self
    }

    /// Skip the field on save when `predicate` holds.
    pub fn ignore_save_when(mut self, predicate: fn(&F) -> bool) -> Self {
        self.ignore_save_when = Some(predicate);
        self
    }

    /// Never populate the field on load.
    pub fn ignore_load(mut self) -> Self {
        self.ignore_load = true;
        self
    }

    /// Fetch the referenced entity on every load.
    pub fn eager(self) -> Self {
        self.annotate(Annotation::Load(Vec::new()))
    }

    /// Fetch the referenced entity when any of `groups` is active.
    pub fn eager_in<I, S>(self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.annotate(Annotation::Load(groups.into_iter().map(Into::into).collect()))
    }

    pub fn annotate(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }
}

impl<F> Default for Field<F> {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// One persistable member of a class, bound to its translator.
pub(crate) trait PropertyTranslator<P>: Send + Sync {
    fn name(&self) -> &str;

    /// The property name followed by its legacy aliases.
    fn names(&self) -> Vec<&str>;

    fn save_into(
        &self,
        pojo: &P,
        index: bool,
        out: &mut BTreeMap<String, Node>,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<()>;

    fn load_from(
        &self,
        properties: &BTreeMap<String, Node>,
        pojo: &mut P,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()>;

    fn prepare_save(&self, pojo: &mut P);

    fn after_load(&self, pojo: &mut P);

    fn repeats_embedded(&self) -> bool;
}

struct FieldProperty<P, F> {
    name: String,
    aliases: Vec<String>,
    get: fn(&P) -> &F,
    get_mut: fn(&mut P) -> &mut F,
    translator: Arc<dyn Translator<F>>,
    index: IndexPolicy<F>,
    ignore_save_when: Option<fn(&F) -> bool>,
    ignore_load: bool,
}

impl<P, F> FieldProperty<P, F> {
    /// The node to load from, checking that aliases agree.
    fn present<'n>(
        &self,
        properties: &'n BTreeMap<String, Node>,
        path: &Path,
    ) -> TranslateResult<Option<&'n Node>> {
        let mut found: Option<(&str, &Node)> = None;
        let names = std::iter::once(&self.name).chain(&self.aliases);
        for name in names {
            let Some(node) = properties.get(name) else {
                continue;
            };
            match found {
                Some((first, existing)) if !existing.same_values(node) => {
                    return Err(TranslateError::ConflictingAliases {
                        path: path.to_string(),
                        first: first.to_string(),
                        second: name.clone(),
                    });
                }
                Some(_) => {}
                None => found = Some((name.as_str(), node)),
            }
        }
        Ok(found.map(|(_, node)| node))
    }
}

impl<P, F> PropertyTranslator<P> for FieldProperty<P, F>
where
    P: Send + Sync + 'static,
    F: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn names(&self) -> Vec<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.aliases.iter().map(String::as_str))
            .collect()
    }

    fn save_into(
        &self,
        pojo: &P,
        index: bool,
        out: &mut BTreeMap<String, Node>,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        let value = (self.get)(pojo);
        if self.ignore_save_when.is_some_and(|skip| skip(value)) {
            return Ok(());
        }
        let index = match self.index {
            IndexPolicy::Inherit => index,
            IndexPolicy::Fixed(flag) => flag,
            IndexPolicy::When(predicate) => predicate(value),
        };
        let child = path.extend(self.name.as_str());
        if let Some(node) = self.translator.save(value, index, ctx, &child)? {
            out.insert(self.name.clone(), node);
        }
        Ok(())
    }

    fn load_from(
        &self,
        properties: &BTreeMap<String, Node>,
        pojo: &mut P,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        if self.ignore_load {
            return Ok(());
        }
        let child = path.extend(self.name.as_str());
        match self.present(properties, &child)? {
            Some(node) => self.translator.load_into(node, (self.get_mut)(pojo), ctx, &child),
            None => Ok(()),
        }
    }

    fn prepare_save(&self, pojo: &mut P) {
        self.translator.prepare_save((self.get_mut)(pojo));
    }

    fn after_load(&self, pojo: &mut P) {
        self.translator.after_load((self.get_mut)(pojo));
    }

    fn repeats_embedded(&self) -> bool {
        self.translator.repeats_embedded()
    }
}

/// A superclass property seen through the accessor of the subclass.
struct Projected<P, B> {
    inner: Box<dyn PropertyTranslator<B>>,
    base_index: Option<bool>,
    get: fn(&P) -> &B,
    get_mut: fn(&mut P) -> &mut B,
}

impl<P, B> PropertyTranslator<P> for Projected<P, B>
where
    P: Send + Sync + 'static,
    B: Send + Sync + 'static,
{
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn names(&self) -> Vec<&str> {
        self.inner.names()
    }

    fn save_into(
        &self,
        pojo: &P,
        index: bool,
        out: &mut BTreeMap<String, Node>,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        let index = self.base_index.unwrap_or(index);
        self.inner.save_into((self.get)(pojo), index, out, ctx, path)
    }

    fn load_from(
        &self,
        properties: &BTreeMap<String, Node>,
        pojo: &mut P,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<()> {
        self.inner.load_from(properties, (self.get_mut)(pojo), ctx, path)
    }

    fn prepare_save(&self, pojo: &mut P) {
        self.inner.prepare_save((self.get_mut)(pojo));
    }

    fn after_load(&self, pojo: &mut P) {
        self.inner.after_load((self.get_mut)(pojo));
    }

    fn repeats_embedded(&self) -> bool {
        self.inner.repeats_embedded()
    }
}

// ---------------------------------------------------------------------------
// Id and parent members
// ---------------------------------------------------------------------------

/// A type usable as an entity identifier.
pub trait IdValue: Send + Sync + 'static {
    /// `true` if the id is a full key that carries its own parent.
    const CARRIES_PARENT: bool = false;

    /// The key id, or `None` for an id the datastore should generate.
    /// `path` locates the key in errors.
    fn key_id(&self, kind: &str, path: &Path) -> TranslateResult<Option<KeyId>>;

    /// Parent carried by the id itself.
    fn id_parent(&self) -> Option<RawKey> {
        None
    }

    fn from_key(key: &RawKey, path: &Path) -> TranslateResult<Self>
    where
        Self: Sized;
}

fn id_mismatch(key: &RawKey, expected: &str, path: &Path) -> TranslateError {
    TranslateError::TypeMismatch {
        path: path.to_string(),
        expected: expected.to_string(),
        found: key.id().map_or_else(|| "incomplete key".to_string(), |id| id.to_string()),
    }
}

/// A numeric id; `None` is generated by the datastore on save.
impl IdValue for Option<i64> {
    fn key_id(&self, _kind: &str, _path: &Path) -> TranslateResult<Option<KeyId>> {
        Ok(self.map(KeyId::Id))
    }

    fn from_key(key: &RawKey, path: &Path) -> TranslateResult<Self> {
        match key.id() {
            Some(KeyId::Id(id)) => Ok(Some(*id)),
            None => Ok(None),
            Some(KeyId::Name(_)) => Err(id_mismatch(key, "numeric id", path)),
        }
    }
}

impl IdValue for i64 {
    fn key_id(&self, _kind: &str, _path: &Path) -> TranslateResult<Option<KeyId>> {
        Ok(Some(KeyId::Id(*self)))
    }

    fn from_key(key: &RawKey, path: &Path) -> TranslateResult<Self> {
        key.numeric_id()
            .ok_or_else(|| id_mismatch(key, "numeric id", path))
    }
}

impl IdValue for String {
    fn key_id(&self, _kind: &str, _path: &Path) -> TranslateResult<Option<KeyId>> {
        Ok(Some(KeyId::Name(self.clone())))
    }

    fn from_key(key: &RawKey, path: &Path) -> TranslateResult<Self> {
        key.name()
            .map(str::to_string)
            .ok_or_else(|| id_mismatch(key, "string id", path))
    }
}

/// A caller-supplied string id; `None` at save time is an error.
impl IdValue for Option<String> {
    fn key_id(&self, kind: &str, path: &Path) -> TranslateResult<Option<KeyId>> {
        match self {
            Some(name) => Ok(Some(KeyId::Name(name.clone()))),
            None => Err(TranslateError::NullStringId {
                path: path.to_string(),
                kind: kind.to_string(),
            }),
        }
    }

    fn from_key(key: &RawKey, path: &Path) -> TranslateResult<Self> {
        String::from_key(key, path).map(Some)
    }
}

/// A full key as id. Its parent becomes the parent of the entity.
impl IdValue for RawKey {
    const CARRIES_PARENT: bool = true;

    fn key_id(&self, kind: &str, path: &Path) -> TranslateResult<Option<KeyId>> {
        if self.kind() != kind {
            return Err(TranslateError::KindMismatch {
                path: path.to_string(),
                expected: kind.to_string(),
                found: self.kind().to_string(),
            });
        }
        Ok(self.id().cloned())
    }

    fn id_parent(&self) -> Option<RawKey> {
        self.parent().cloned()
    }

    fn from_key(key: &RawKey, _path: &Path) -> TranslateResult<Self> {
        Ok(key.clone())
    }
}

/// A type usable as the parent member of an entity.
pub trait ParentValue: Send + Sync + 'static {
    fn parent_key(&self) -> Option<RawKey>;

    fn from_parent(parent: Option<&RawKey>, path: &Path) -> TranslateResult<Self>
    where
        Self: Sized;
}

fn missing_parent(path: &Path) -> TranslateError {
    TranslateError::TypeMismatch {
        path: path.to_string(),
        expected: "parent key".to_string(),
        found: "root key".to_string(),
    }
}

impl ParentValue for Option<RawKey> {
    fn parent_key(&self) -> Option<RawKey> {
        self.clone()
    }

    fn from_parent(parent: Option<&RawKey>, _path: &Path) -> TranslateResult<Self> {
        Ok(parent.cloned())
    }
}

impl ParentValue for RawKey {
    fn parent_key(&self) -> Option<RawKey> {
        Some(self.clone())
    }

    fn from_parent(parent: Option<&RawKey>, path: &Path) -> TranslateResult<Self> {
        parent.cloned().ok_or_else(|| missing_parent(path))
    }
}

impl<T: 'static> ParentValue for Option<Key<T>> {
    fn parent_key(&self) -> Option<RawKey> {
        self.as_ref().map(|key| key.raw().clone())
    }

    fn from_parent(parent: Option<&RawKey>, _path: &Path) -> TranslateResult<Self> {
        Ok(parent.cloned().map(Key::from_raw))
    }
}

impl<T: 'static> ParentValue for Key<T> {
    fn parent_key(&self) -> Option<RawKey> {
        Some(self.raw().clone())
    }

    fn from_parent(parent: Option<&RawKey>, path: &Path) -> TranslateResult<Self> {
        parent
            .cloned()
            .map(Key::from_raw)
            .ok_or_else(|| missing_parent(path))
    }
}

type KeyIdFn<P> = Arc<dyn Fn(&P, &str, &Path) -> TranslateResult<Option<KeyId>> + Send + Sync>;
type ParentFn<P> = Arc<dyn Fn(&P) -> Option<RawKey> + Send + Sync>;
type SetIdFn<P> = Arc<dyn Fn(&mut P, &RawKey, &Path) -> TranslateResult<()> + Send + Sync>;
type SetParentFn<P> =
    Arc<dyn Fn(&mut P, Option<&RawKey>, &Path) -> TranslateResult<()> + Send + Sync>;

struct IdBinding<P> {
    name: String,
    carries_parent: bool,
    key_id: KeyIdFn<P>,
    id_parent: ParentFn<P>,
    set: SetIdFn<P>,
}

impl<P: 'static> IdBinding<P> {
    fn new<I: IdValue>(name: &str, get: fn(&P) -> &I, get_mut: fn(&mut P) -> &mut I) -> Self {
        Self {
            name: name.to_string(),
            carries_parent: I::CARRIES_PARENT,
            key_id: Arc::new(move |pojo: &P, kind: &str, path: &Path| {
                get(pojo).key_id(kind, path)
            }),
            id_parent: Arc::new(move |pojo: &P| get(pojo).id_parent()),
            set: Arc::new(move |pojo: &mut P, key: &RawKey, path: &Path| {
                *get_mut(pojo) = I::from_key(key, path)?;
                Ok(())
            }),
        }
    }

    fn project<Q: 'static>(self, get: fn(&Q) -> &P, get_mut: fn(&mut Q) -> &mut P) -> IdBinding<Q> {
        let Self {
            name,
            carries_parent,
            key_id,
            id_parent,
            set,
        } = self;
        IdBinding {
            name,
            carries_parent,
            key_id: Arc::new(move |pojo: &Q, kind: &str, path: &Path| {
                key_id(get(pojo), kind, path)
            }),
            id_parent: Arc::new(move |pojo: &Q| id_parent(get(pojo))),
            set: Arc::new(move |pojo: &mut Q, key: &RawKey, path: &Path| {
                set(get_mut(pojo), key, path)
            }),
        }
    }
}

struct ParentBinding<P> {
    name: String,
    get: ParentFn<P>,
    set: SetParentFn<P>,
}

impl<P: 'static> ParentBinding<P> {
    fn new<K: ParentValue>(name: &str, get: fn(&P) -> &K, get_mut: fn(&mut P) -> &mut K) -> Self {
        Self {
            name: name.to_string(),
            get: Arc::new(move |pojo: &P| get(pojo).parent_key()),
            set: Arc::new(move |pojo: &mut P, parent: Option<&RawKey>, path: &Path| {
                *get_mut(pojo) = K::from_parent(parent, path)?;
                Ok(())
            }),
        }
    }

    fn project<Q: 'static>(
        self,
        get: fn(&Q) -> &P,
        get_mut: fn(&mut Q) -> &mut P,
    ) -> ParentBinding<Q> {
        let Self {
            name,
            get: inner_get,
            set,
        } = self;
        ParentBinding {
            name,
            get: Arc::new(move |pojo: &Q| inner_get(get(pojo))),
            set: Arc::new(move |pojo: &mut Q, parent: Option<&RawKey>, path: &Path| {
                set(get_mut(pojo), parent, path)
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// ClassBuilder
// ---------------------------------------------------------------------------

/// Declares the persistable shape of class `P`.
pub struct ClassBuilder<'c, 'r, P> {
    cx: &'c mut CreateContext<'r>,
    path: Path,
    type_name: &'static str,
    constructor: Option<fn() -> P>,
    kind: Option<String>,
    index_default: Option<bool>,
    conflicting_index: bool,
    properties: Vec<Box<dyn PropertyTranslator<P>>>,
    names: HashSet<String>,
    id: Option<IdBinding<P>>,
    parent: Option<ParentBinding<P>>,
    on_save: Vec<Hook<P>>,
    on_load: Vec<Hook<P>>,
}

/// Everything a builder collected, minus the constructor.
struct ClassParts<P> {
    kind: Option<String>,
    index_default: Option<bool>,
    conflicting_index: bool,
    properties: Vec<Box<dyn PropertyTranslator<P>>>,
    id: Option<IdBinding<P>>,
    parent: Option<ParentBinding<P>>,
    on_save: Vec<Hook<P>>,
    on_load: Vec<Hook<P>>,
}

impl<'c, 'r, P: Send + Sync + 'static> ClassBuilder<'c, 'r, P> {
    pub(crate) fn new(cx: &'c mut CreateContext<'r>, path: Path) -> Self {
        Self {
            cx,
            path,
            type_name: type_name::<P>(),
            constructor: None,
            kind: None,
            index_default: None,
            conflicting_index: false,
            properties: Vec::new(),
            names: HashSet::new(),
            id: None,
            parent: None,
            on_save: Vec::new(),
            on_load: Vec::new(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The registration pass, for building nested translators by hand.
    pub fn context(&mut self) -> &mut CreateContext<'r> {
        self.cx
    }

    pub fn constructor(&mut self, constructor: fn() -> P) -> &mut Self {
        self.constructor = Some(constructor);
        self
    }

    pub fn default_constructor(&mut self) -> &mut Self
    where
        P: Default,
    {
        self.constructor(P::default)
    }

    /// Kind name used when `P` is an entity. Defaults to the type's short
    /// name.
    pub fn kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = Some(kind.into());
        self
    }

    /// Index every field without its own index option.
    pub fn index(&mut self) -> &mut Self {
        self.set_index_default(true)
    }

    /// Leave every field without its own index option unindexed.
    pub fn unindex(&mut self) -> &mut Self {
        self.set_index_default(false)
    }

    fn set_index_default(&mut self, flag: bool) -> &mut Self {
        if self.index_default.is_some_and(|existing| existing != flag) {
            self.conflicting_index = true;
        }
        self.index_default = Some(flag);
        self
    }

    pub fn on_save(&mut self, hook: impl Fn(&mut P) + Send + Sync + 'static) -> &mut Self {
        self.on_save.push(Arc::new(hook));
        self
    }

    pub fn on_load(&mut self, hook: impl Fn(&mut P) + Send + Sync + 'static) -> &mut Self {
        self.on_load.push(Arc::new(hook));
        self
    }

    pub fn field<F: Persist>(
        &mut self,
        name: &str,
        get: fn(&P) -> &F,
        get_mut: fn(&mut P) -> &mut F,
    ) -> TranslateResult<&mut Self> {
        self.field_with(name, get, get_mut, Field::new())
    }

    pub fn field_with<F: Persist>(
        &mut self,
        name: &str,
        get: fn(&P) -> &F,
        get_mut: fn(&mut P) -> &mut F,
        options: Field<F>,
    ) -> TranslateResult<&mut Self> {
        self.check_field(name, &options)?;
        let key = TypeKey::with_annotations::<F>(options.annotations.clone());
        let translator = self.cx.translator::<F>(&key, &self.path.extend(name))?;
        self.push_field(name, get, get_mut, translator, options)
    }

    /// A field stored as an opaque JSON blob.
    pub fn serialized<F>(
        &mut self,
        name: &str,
        get: fn(&P) -> &F,
        get_mut: fn(&mut P) -> &mut F,
    ) -> TranslateResult<&mut Self>
    where
        F: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.serialized_with(name, get, get_mut, Field::new())
    }

    pub fn serialized_with<F>(
        &mut self,
        name: &str,
        get: fn(&P) -> &F,
        get_mut: fn(&mut P) -> &mut F,
        options: Field<F>,
    ) -> TranslateResult<&mut Self>
    where
        F: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        self.check_field(name, &options)?;
        let key = TypeKey::with_annotations::<F>(options.annotations.clone())
            .annotate(Annotation::Serialized);
        let translator = self.cx.translator_with::<F, _>(
            &key,
            &self.path.extend(name),
            Shape::Scalar,
            |_| {
                let translator: Arc<dyn Translator<F>> =
                    Arc::new(LeafTranslator::<F, _>::new(SerializedCodec::<F>::new()));
                Ok(translator)
            },
        )?;
        self.push_field(name, get, get_mut, translator, options)
    }

    /// The identifier member. Stored in the key, never as a property.
    pub fn id<I: IdValue>(
        &mut self,
        name: &str,
        get: fn(&P) -> &I,
        get_mut: fn(&mut P) -> &mut I,
    ) -> TranslateResult<&mut Self> {
        if let Some(existing) = &self.id {
            return Err(TranslateError::DuplicateId {
                type_name: self.type_name.to_string(),
                first: existing.name.clone(),
                second: name.to_string(),
            });
        }
        self.claim(name)?;
        self.id = Some(IdBinding::new(name, get, get_mut));
        Ok(self)
    }

    /// The parent-key member. Stored in the key, never as a property.
    pub fn parent<K: ParentValue>(
        &mut self,
        name: &str,
        get: fn(&P) -> &K,
        get_mut: fn(&mut P) -> &mut K,
    ) -> TranslateResult<&mut Self> {
        if let Some(existing) = &self.parent {
            return Err(TranslateError::DuplicateParent {
                type_name: self.type_name.to_string(),
                first: existing.name.clone(),
                second: name.to_string(),
            });
        }
        self.claim(name)?;
        self.parent = Some(ParentBinding::new(name, get, get_mut));
        Ok(self)
    }

    /// Populate superclass `B`, reached through the accessors, before the
    /// members of `P`. Its hooks run before those of `P`.
    pub fn extends<B: Class>(
        &mut self,
        get: fn(&P) -> &B,
        get_mut: fn(&mut P) -> &mut B,
    ) -> TranslateResult<&mut Self> {
        let mut base = ClassBuilder::<B>::new(&mut *self.cx, self.path.clone());
        B::describe(&mut base)?;
        let parts = base.into_parts();
        if parts.conflicting_index {
            return Err(TranslateError::ConflictingIndex {
                type_name: type_name::<B>().to_string(),
            });
        }

        let mut projected: Vec<Box<dyn PropertyTranslator<P>>> = Vec::new();
        for inner in parts.properties {
            for name in inner.names() {
                self.claim(name)?;
            }
            projected.push(Box::new(Projected {
                inner,
                base_index: parts.index_default,
                get,
                get_mut,
            }));
        }
        self.properties.splice(0..0, projected);

        if let Some(id) = parts.id {
            if let Some(existing) = &self.id {
                return Err(TranslateError::DuplicateId {
                    type_name: self.type_name.to_string(),
                    first: id.name,
                    second: existing.name.clone(),
                });
            }
            self.claim(&id.name)?;
            self.id = Some(id.project(get, get_mut));
        }
        if let Some(parent) = parts.parent {
            if let Some(existing) = &self.parent {
                return Err(TranslateError::DuplicateParent {
                    type_name: self.type_name.to_string(),
                    first: parent.name,
                    second: existing.name.clone(),
                });
            }
            self.claim(&parent.name)?;
            self.parent = Some(parent.project(get, get_mut));
        }
        if self.kind.is_none() {
            self.kind = parts.kind;
        }

        let project = |hook: Hook<B>| -> Hook<P> { Arc::new(move |pojo: &mut P| hook(get_mut(pojo))) };
        let on_save: Vec<Hook<P>> = parts.on_save.into_iter().map(&project).collect();
        let on_load: Vec<Hook<P>> = parts.on_load.into_iter().map(&project).collect();
        self.on_save.splice(0..0, on_save);
        self.on_load.splice(0..0, on_load);
        Ok(self)
    }

    fn check_field<F>(&self, name: &str, options: &Field<F>) -> TranslateResult<()> {
        if options.conflicting {
            return Err(TranslateError::ConflictingIndex {
                type_name: format!("{}.{name}", self.type_name),
            });
        }
        Ok(())
    }

    fn push_field<F: Send + Sync + 'static>(
        &mut self,
        name: &str,
        get: fn(&P) -> &F,
        get_mut: fn(&mut P) -> &mut F,
        translator: Arc<dyn Translator<F>>,
        options: Field<F>,
    ) -> TranslateResult<&mut Self> {
        self.claim(name)?;
        for alias in &options.aliases {
            self.claim(alias)?;
        }
        self.properties.push(Box::new(FieldProperty {
            name: name.to_string(),
            aliases: options.aliases,
            get,
            get_mut,
            translator,
            index: options.index,
            ignore_save_when: options.ignore_save_when,
            ignore_load: options.ignore_load,
        }));
        Ok(self)
    }

    /// Reserve a stored name for one member.
    fn claim(&mut self, name: &str) -> TranslateResult<()> {
        if name.is_empty() || name.contains('.') || RESERVED_NAMES.contains(&name) {
            return Err(TranslateError::InvalidPropertyName {
                type_name: self.type_name.to_string(),
                name: name.to_string(),
            });
        }
        if !self.names.insert(name.to_string()) {
            return Err(TranslateError::DuplicateProperty {
                type_name: self.type_name.to_string(),
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn into_parts(self) -> ClassParts<P> {
        ClassParts {
            kind: self.kind,
            index_default: self.index_default,
            conflicting_index: self.conflicting_index,
            properties: self.properties,
            id: self.id,
            parent: self.parent,
            on_save: self.on_save,
            on_load: self.on_load,
        }
    }

    pub(crate) fn finish(self) -> TranslateResult<ClassTranslator<P>> {
        let type_name = self.type_name;
        let constructor = self.constructor.ok_or_else(|| TranslateError::MissingConstructor {
            type_name: type_name.to_string(),
        })?;
        let parts = self.into_parts();
        if parts.conflicting_index {
            return Err(TranslateError::ConflictingIndex {
                type_name: type_name.to_string(),
            });
        }
        Ok(ClassTranslator {
            type_name,
            constructor,
            kind: parts
                .kind
                .unwrap_or_else(|| short_type_name(type_name).to_string()),
            index_default: parts.index_default,
            properties: parts.properties,
            id: parts.id,
            parent: parts.parent,
            on_save: parts.on_save,
            on_load: parts.on_load,
            visiting: AtomicBool::new(false),
        })
    }
}

// ---------------------------------------------------------------------------
// ClassTranslator
// ---------------------------------------------------------------------------

/// The populator: translates a class member by member.
pub struct ClassTranslator<P> {
    type_name: &'static str,
    constructor: fn() -> P,
    kind: String,
    index_default: Option<bool>,
    properties: Vec<Box<dyn PropertyTranslator<P>>>,
    id: Option<IdBinding<P>>,
    parent: Option<ParentBinding<P>>,
    on_save: Vec<Hook<P>>,
    on_load: Vec<Hook<P>>,
    /// Set while `repeats_embedded` walks this class, so recursive shapes
    /// terminate. Only walked during registration, under the creation lock.
    visiting: AtomicBool,
}

impl<P: Class> ClassTranslator<P> {
    /// Run `P::describe` and build the populator.
    pub fn build(cx: &mut CreateContext<'_>, path: &Path) -> TranslateResult<Self> {
        let mut builder = ClassBuilder::<P>::new(cx, path.clone());
        P::describe(&mut builder)?;
        builder.finish()
    }
}

impl<P: Send + Sync + 'static> ClassTranslator<P> {
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Stored property names in declared order, superclass members first.
    pub fn property_names(&self) -> Vec<&str> {
        self.properties.iter().map(|p| p.name()).collect()
    }

    pub fn id_name(&self) -> Option<&str> {
        self.id.as_ref().map(|id| id.name.as_str())
    }

    pub fn parent_name(&self) -> Option<&str> {
        self.parent.as_ref().map(|parent| parent.name.as_str())
    }

    pub fn construct(&self) -> P {
        (self.constructor)()
    }

    /// Translate every property of `pojo` into a property map.
    pub fn save_map(
        &self,
        pojo: &P,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<BTreeMap<String, Node>> {
        let index = self.index_default.unwrap_or(index);
        let mut out = BTreeMap::new();
        for property in &self.properties {
            property.save_into(pojo, index, &mut out, ctx, path)?;
        }
        Ok(out)
    }

    /// Construct a fresh instance and populate it from `properties`.
    /// Names no member claims are ignored.
    pub fn load_map(
        &self,
        properties: &BTreeMap<String, Node>,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<P> {
        let mut pojo = self.construct();
        for property in &self.properties {
            property.load_from(properties, &mut pojo, ctx, path)?;
        }
        Ok(pojo)
    }

    /// The key of `pojo` under `kind`; incomplete if the id is generated.
    ///
    /// Errors are reported at the key property below `path`.
    pub fn key_of(&self, pojo: &P, kind: &str, path: &Path) -> TranslateResult<RawKey> {
        let id = self.id.as_ref().ok_or_else(|| TranslateError::MissingId {
            type_name: self.type_name.to_string(),
        })?;
        let key_id = (id.key_id)(pojo, kind, &path.extend(KEY_PROPERTY))?;
        let parent = match &self.parent {
            Some(parent) => (parent.get)(pojo),
            None if id.carries_parent => (id.id_parent)(pojo),
            None => None,
        };
        Ok(RawKey::from_parts(kind, key_id, parent))
    }

    /// Write `key` back into the id and parent members.
    pub fn set_key(&self, pojo: &mut P, key: &RawKey, path: &Path) -> TranslateResult<()> {
        let id = self.id.as_ref().ok_or_else(|| TranslateError::MissingId {
            type_name: self.type_name.to_string(),
        })?;
        let at = path.extend(KEY_PROPERTY);
        match &self.parent {
            Some(parent) => (parent.set)(pojo, key.parent(), &at)?,
            None if key.parent().is_some() && !id.carries_parent => {
                return Err(TranslateError::UnexpectedParent {
                    path: at.to_string(),
                    kind: key.kind().to_string(),
                });
            }
            None => {}
        }
        (id.set)(pojo, key, &at)
    }

    pub(crate) fn save_embedded(
        &self,
        pojo: &P,
        kind: &str,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<BTreeMap<String, Node>> {
        let mut out = self.save_map(pojo, index, ctx, path)?;
        if self.id.is_some() {
            let key = self.key_of(pojo, kind, path)?;
            out.insert(KEY_PROPERTY.to_string(), Node::unindexed(Value::Key(key)));
        }
        Ok(out)
    }

    pub(crate) fn load_embedded(
        &self,
        properties: &BTreeMap<String, Node>,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<P> {
        let mut pojo = self.load_map(properties, ctx, path)?;
        if self.id.is_some() {
            if let Some(Value::Key(key)) = properties.get(KEY_PROPERTY).and_then(Node::as_value) {
                self.set_key(&mut pojo, key, path)?;
            }
        }
        Ok(pojo)
    }
}

fn expect_map<'n>(node: &'n Node, path: &Path) -> TranslateResult<&'n BTreeMap<String, Node>> {
    node.as_map().ok_or_else(|| TranslateError::UnexpectedNode {
        path: path.to_string(),
        expected: "map",
        found: node.describe(),
    })
}

impl<P: Send + Sync + 'static> Translator<P> for ClassTranslator<P> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<P>> {
        if node.is_null() {
            return Ok(None);
        }
        let properties = expect_map(node, path)?;
        self.load_embedded(properties, ctx, path).map(Some)
    }

    fn save(
        &self,
        pojo: &P,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        Ok(Some(Node::Map(self.save_embedded(pojo, &self.kind, index, ctx, path)?)))
    }

    fn prepare_save(&self, pojo: &mut P) {
        for hook in &self.on_save {
            hook(pojo);
        }
        for property in &self.properties {
            property.prepare_save(pojo);
        }
    }

    fn after_load(&self, pojo: &mut P) {
        for property in &self.properties {
            property.after_load(pojo);
        }
        for hook in &self.on_load {
            hook(pojo);
        }
    }

    fn repeats_embedded(&self) -> bool {
        if self.visiting.swap(true, Ordering::AcqRel) {
            return false;
        }
        let repeats = self.properties.iter().any(|p| p.repeats_embedded());
        self.visiting.store(false, Ordering::Release);
        repeats
    }
}

/// Built-in translator for an embedded class.
pub fn class_translator<P: Class>(
    cx: &mut CreateContext<'_>,
    path: &Path,
) -> TranslateResult<Arc<dyn Translator<P>>> {
    Ok(Arc::new(ClassTranslator::<P>::build(cx, path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Phase;
    use crate::registry::Registry;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Default, PartialEq)]
    struct Address {
        street: String,
        zip: Option<String>,
    }

    impl Class for Address {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("street", |a| &a.street, |a| &mut a.street)?;
            class.field("zip", |a| &a.zip, |a| &mut a.zip)?;
            Ok(())
        }
    }

    crate::persist!(embedded Address);

    #[derive(Debug, Default, PartialEq)]
    struct Person {
        name: String,
        nickname: String,
        age: i64,
        home: Address,
        tags: Vec<String>,
        notes: Vec<String>,
    }

    impl Class for Person {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor().index();
            class.field("name", |p| &p.name, |p| &mut p.name)?;
            class.field_with(
                "nickname",
                |p| &p.nickname,
                |p| &mut p.nickname,
                Field::new().unindex().alias("nick"),
            )?;
            class.field_with(
                "age",
                |p| &p.age,
                |p| &mut p.age,
                Field::new().index_when(|age: &i64| *age >= 18),
            )?;
            class.field("home", |p| &p.home, |p| &mut p.home)?;
            class.field("tags", |p| &p.tags, |p| &mut p.tags)?;
            class.field_with(
                "notes",
                |p| &p.notes,
                |p| &mut p.notes,
                Field::new().ignore_load(),
            )?;
            Ok(())
        }
    }

    crate::persist!(embedded Person);

    fn save<P: Persist>(registry: &Registry, value: &P) -> Node {
        let translator = registry.translator::<P>().unwrap();
        let mut ctx = SaveContext::new(registry);
        translator
            .save(value, false, &mut ctx, &Path::root())
            .unwrap()
            .unwrap()
    }

    fn load<P: Persist>(registry: &Registry, node: &Node) -> TranslateResult<Option<P>> {
        let translator = registry.translator::<P>()?;
        let mut ctx = LoadContext::new(registry);
        translator.load(node, &mut ctx, &Path::root())
    }

    fn map(entries: Vec<(&str, Node)>) -> Node {
        Node::Map(
            entries
                .into_iter()
                .map(|(name, node)| (name.to_string(), node))
                .collect(),
        )
    }

    fn sample() -> Person {
        Person {
            name: "Ada".into(),
            nickname: "countess".into(),
            age: 36,
            home: Address {
                street: "St James's Square".into(),
                zip: None,
            },
            tags: vec!["math".into()],
            notes: vec!["kept on save".into()],
        }
    }

    #[test]
    fn roundtrip_preserves_members() {
        let registry = Registry::new();
        let person = sample();
        let node = save(&registry, &person);
        let loaded: Person = load(&registry, &node).unwrap().unwrap();
        assert_eq!(loaded.name, person.name);
        assert_eq!(loaded.nickname, person.nickname);
        assert_eq!(loaded.age, person.age);
        assert_eq!(loaded.home, person.home);
        assert_eq!(loaded.tags, person.tags);
    }

    #[test]
    fn class_default_and_field_overrides_decide_indexing() {
        let registry = Registry::new();
        let mut person = sample();
        let node = save(&registry, &person);
        assert_eq!(node.lookup("name").and_then(Node::is_indexed), Some(true));
        assert_eq!(node.lookup("nickname").and_then(Node::is_indexed), Some(false));
        assert_eq!(node.lookup("age").and_then(Node::is_indexed), Some(true));
        // Address declares no default, so it inherits from Person.
        assert_eq!(node.lookup("home.street").and_then(Node::is_indexed), Some(true));

        person.age = 12;
        let node = save(&registry, &person);
        assert_eq!(node.lookup("age").and_then(Node::is_indexed), Some(false));
    }

    #[test]
    fn empty_collections_are_omitted_and_none_is_explicit() {
        let registry = Registry::new();
        let person = Person::default();
        let node = save(&registry, &person);
        let entries = node.as_map().unwrap();
        assert!(!entries.contains_key("tags"));
        assert!(!entries.contains_key("notes"));
        assert_eq!(node.lookup("home.zip"), Some(&Node::null(true)));

        let loaded: Person = load(&registry, &node).unwrap().unwrap();
        assert!(loaded.tags.is_empty());
    }

    #[test]
    fn ignore_load_keeps_constructor_value() {
        let registry = Registry::new();
        let node = save(&registry, &sample());
        assert!(node.lookup("notes").is_some());
        let loaded: Person = load(&registry, &node).unwrap().unwrap();
        assert!(loaded.notes.is_empty());
    }

    #[test]
    fn alias_loads_legacy_name() {
        let registry = Registry::new();
        let node = map(vec![("nick", Node::unindexed("old"))]);
        let loaded: Person = load(&registry, &node).unwrap().unwrap();
        assert_eq!(loaded.nickname, "old");
    }

    #[test]
    fn agreeing_aliases_are_fine() {
        let registry = Registry::new();
        let node = map(vec![
            ("nick", Node::unindexed("same")),
            ("nickname", Node::unindexed("same")),
        ]);
        let loaded: Person = load(&registry, &node).unwrap().unwrap();
        assert_eq!(loaded.nickname, "same");
    }

    #[test]
    fn aliases_agree_across_index_flags() {
        let registry = Registry::new();
        let node = map(vec![
            ("nick", Node::indexed("same")),
            ("nickname", Node::unindexed("same")),
        ]);
        let loaded: Person = load(&registry, &node).unwrap().unwrap();
        assert_eq!(loaded.nickname, "same");
    }

    #[test]
    fn conflicting_aliases_fail_load() {
        let registry = Registry::new();
        let node = map(vec![
            ("nick", Node::unindexed("old")),
            ("nickname", Node::unindexed("new")),
        ]);
        let err = load::<Person>(&registry, &node).unwrap_err();
        assert_eq!(err.phase(), Phase::Load);
        assert!(matches!(
            err,
            TranslateError::ConflictingAliases { ref path, .. } if path == "nickname"
        ));
    }

    #[test]
    fn unknown_properties_are_ignored() {
        let registry = Registry::new();
        let node = map(vec![("retired", Node::indexed(true)), ("name", Node::indexed("Bo"))]);
        let loaded: Person = load(&registry, &node).unwrap().unwrap();
        assert_eq!(loaded.name, "Bo");
    }

    #[test]
    fn wrong_node_shape_names_the_path() {
        let registry = Registry::new();
        let node = map(vec![("home", Node::indexed(5i64))]);
        let err = load::<Person>(&registry, &node).unwrap_err();
        assert!(matches!(
            err,
            TranslateError::UnexpectedNode { ref path, expected: "map", .. } if path == "home"
        ));
    }

    // -- registration errors -------------------------------------------------

    #[derive(Default)]
    struct NoCtor {
        value: i64,
    }

    impl Class for NoCtor {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.field("value", |n| &n.value, |n| &mut n.value)?;
            Ok(())
        }
    }

    crate::persist!(embedded NoCtor);

    #[derive(Default)]
    struct Torn;

    impl Class for Torn {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor().index().unindex();
            Ok(())
        }
    }

    crate::persist!(embedded Torn);

    #[derive(Default)]
    struct Twice {
        a: i64,
        b: i64,
    }

    impl Class for Twice {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("a", |t| &t.a, |t| &mut t.a)?;
            class.field_with("b", |t| &t.b, |t| &mut t.b, Field::new().alias("a"))?;
            Ok(())
        }
    }

    crate::persist!(embedded Twice);

    #[derive(Default)]
    struct Dotted {
        a: i64,
    }

    impl Class for Dotted {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("a.b", |d| &d.a, |d| &mut d.a)?;
            Ok(())
        }
    }

    crate::persist!(embedded Dotted);

    #[test]
    fn registration_errors_are_config_errors() {
        let registry = Registry::new();
        let err = registry.translator::<NoCtor>().err().unwrap();
        assert!(matches!(err, TranslateError::MissingConstructor { .. }));
        assert_eq!(err.phase(), Phase::Config);

        let err = registry.translator::<Torn>().err().unwrap();
        assert!(matches!(err, TranslateError::ConflictingIndex { .. }));

        let err = registry.translator::<Twice>().err().unwrap();
        assert!(matches!(err, TranslateError::DuplicateProperty { ref name, .. } if name == "a"));

        let err = registry.translator::<Dotted>().err().unwrap();
        assert!(matches!(err, TranslateError::InvalidPropertyName { .. }));
        assert_eq!(registry.translator_count(), 0);
    }

    // -- nesting -------------------------------------------------------------

    #[derive(Default)]
    struct Leg {
        length: i64,
    }

    impl Class for Leg {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("length", |l| &l.length, |l| &mut l.length)?;
            Ok(())
        }
    }

    crate::persist!(embedded Leg);

    #[derive(Default)]
    struct Table {
        legs: Vec<Leg>,
    }

    impl Class for Table {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("legs", |t| &t.legs, |t| &mut t.legs)?;
            Ok(())
        }
    }

    crate::persist!(embedded Table);

    #[derive(Default)]
    struct Room {
        tables: Vec<Table>,
    }

    impl Class for Room {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("tables", |r| &r.tables, |r| &mut r.tables)?;
            Ok(())
        }
    }

    crate::persist!(embedded Room);

    #[test]
    fn single_embedded_collection_is_allowed() {
        let registry = Registry::new();
        let table = Table {
            legs: vec![Leg { length: 3 }, Leg { length: 4 }],
        };
        let node = save(&registry, &table);
        let loaded: Table = load(&registry, &node).unwrap().unwrap();
        let lengths: Vec<i64> = loaded.legs.iter().map(|l| l.length).collect();
        assert_eq!(lengths, vec![3, 4]);
    }

    #[test]
    fn nested_embedded_collections_are_rejected() {
        let registry = Registry::new();
        let err = registry.translator::<Room>().err().unwrap();
        assert_eq!(err.phase(), Phase::Config);
        assert!(matches!(
            err,
            TranslateError::NestedEmbeddedCollection { ref path } if path == "tables"
        ));
    }

    #[derive(Debug)]
    struct Badge {
        key: RawKey,
    }

    impl Class for Badge {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.constructor(|| Badge {
                key: RawKey::with_id("Badge", 0),
            });
            class.id("key", |b| &b.key, |b| &mut b.key)?;
            Ok(())
        }
    }

    crate::persist!(embedded Badge);

    #[derive(Debug, Default)]
    struct Holder {
        badge: Option<Badge>,
    }

    impl Class for Holder {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("badge", |h| &h.badge, |h| &mut h.badge)?;
            Ok(())
        }
    }

    crate::persist!(embedded Holder);

    #[test]
    fn embedded_key_errors_name_the_nested_key() {
        let registry = Registry::new();
        let translator = registry.translator::<Holder>().unwrap();
        let holder = Holder {
            badge: Some(Badge {
                key: RawKey::with_id("Car", 1),
            }),
        };
        let mut ctx = SaveContext::new(&registry);
        let err = translator
            .save(&holder, false, &mut ctx, &Path::root())
            .unwrap_err();
        assert!(matches!(
            err,
            TranslateError::KindMismatch { ref path, ref expected, .. }
                if path == "badge.__key__" && expected == "Badge"
        ));

        let stored = RawKey::with_id("Badge", 2).with_parent(RawKey::with_id("Car", 1));
        let node = map(vec![(
            "badge",
            map(vec![("__key__", Node::unindexed(Value::Key(stored.clone())))]),
        )]);
        let loaded: Holder = load(&registry, &node).unwrap().unwrap();
        assert_eq!(loaded.badge.map(|b| b.key), Some(stored));
    }

    #[derive(Default)]
    struct Outer {
        inners: Vec<Inner>,
    }

    impl Class for Outer {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("inners", |o| &o.inners, |o| &mut o.inners)?;
            Ok(())
        }
    }

    crate::persist!(embedded Outer);

    #[derive(Default)]
    struct Inner {
        back: Option<Box<Outer>>,
    }

    impl Class for Inner {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("back", |i| &i.back, |i| &mut i.back)?;
            Ok(())
        }
    }

    crate::persist!(embedded Inner);

    #[test]
    fn collections_nested_through_a_cycle_are_rejected() {
        let registry = Registry::new();
        let err = registry.translator::<Outer>().err().unwrap();
        assert_eq!(err.phase(), Phase::Config);
        assert!(matches!(
            err,
            TranslateError::NestedEmbeddedCollection { ref path } if path == "inners"
        ));
        // Nothing from the failed pass stays memoized.
        let err = registry.translator::<Inner>().err().unwrap();
        assert!(matches!(err, TranslateError::NestedEmbeddedCollection { .. }));
        assert!(registry.translator::<Outer>().is_err());
    }

    #[derive(Default)]
    struct Link {
        label: String,
        next: Option<Box<Link>>,
    }

    impl Class for Link {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("label", |n| &n.label, |n| &mut n.label)?;
            class.field("next", |n| &n.next, |n| &mut n.next)?;
            Ok(())
        }
    }

    crate::persist!(embedded Link);

    #[test]
    fn self_referential_class_terminates() {
        let registry = Registry::new();
        let chain = Link {
            label: "a".into(),
            next: Some(Box::new(Link {
                label: "b".into(),
                next: None,
            })),
        };
        let node = save(&registry, &chain);
        assert_eq!(node.lookup("next.label"), Some(&Node::unindexed("b")));
        let loaded: Link = load(&registry, &node).unwrap().unwrap();
        let next = loaded.next.unwrap();
        assert_eq!(next.label, "b");
        assert!(next.next.is_none());
    }

    // -- superclass and hooks ------------------------------------------------

    static SAVE_ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
    static LOADS: AtomicUsize = AtomicUsize::new(0);

    #[derive(Debug, Default)]
    struct Stamped {
        created: String,
        touched: i64,
    }

    impl Class for Stamped {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor().unindex();
            class.field("created", |s| &s.created, |s| &mut s.created)?;
            class.field("touched", |s| &s.touched, |s| &mut s.touched)?;
            class.on_save(|s| {
                s.touched += 1;
                SAVE_ORDER.lock().unwrap().push("base");
            });
            Ok(())
        }
    }

    crate::persist!(embedded Stamped);

    #[derive(Debug, Default)]
    struct Document {
        stamp: Stamped,
        title: String,
        summary: String,
    }

    impl Class for Document {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor().index();
            class.on_save(|d| {
                d.summary = d.title.to_uppercase();
                SAVE_ORDER.lock().unwrap().push("doc");
            });
            class.on_load(|_| {
                LOADS.fetch_add(1, Ordering::SeqCst);
            });
            class.field("title", |d| &d.title, |d| &mut d.title)?;
            class.field("summary", |d| &d.summary, |d| &mut d.summary)?;
            class.extends(|d| &d.stamp, |d| &mut d.stamp)?;
            Ok(())
        }
    }

    crate::persist!(embedded Document);

    #[test]
    fn superclass_members_come_first_and_keep_their_default() {
        let registry = Registry::new();
        let translator = registry.translator::<Document>().unwrap();

        let mut doc = Document {
            title: "draft".into(),
            ..Document::default()
        };
        SAVE_ORDER.lock().unwrap().clear();
        translator.prepare_save(&mut doc);
        assert_eq!(*SAVE_ORDER.lock().unwrap(), vec!["base", "doc"]);
        assert_eq!(doc.summary, "DRAFT");
        assert_eq!(doc.stamp.touched, 1);

        let mut ctx = SaveContext::new(&registry);
        let node = translator
            .save(&doc, false, &mut ctx, &Path::root())
            .unwrap()
            .unwrap();
        let names: Vec<&str> = node.as_map().unwrap().keys().map(String::as_str).collect();
        assert_eq!(names, vec!["created", "summary", "title", "touched"]);
        assert_eq!(node.lookup("title").and_then(Node::is_indexed), Some(true));
        assert_eq!(node.lookup("touched").and_then(Node::is_indexed), Some(false));

        let before = LOADS.load(Ordering::SeqCst);
        let mut load_ctx = LoadContext::new(&registry);
        let mut loaded = translator
            .load(&node, &mut load_ctx, &Path::root())
            .unwrap()
            .unwrap();
        assert_eq!(LOADS.load(Ordering::SeqCst), before);
        translator.after_load(&mut loaded);
        assert_eq!(LOADS.load(Ordering::SeqCst), before + 1);
        assert_eq!(loaded.stamp.touched, 1);
        assert_eq!(loaded.summary, "DRAFT");
    }

    #[derive(Debug, Default, PartialEq, Serialize, serde::Deserialize)]
    struct Prefs {
        theme: String,
        sizes: Vec<u32>,
    }

    #[derive(Default)]
    struct Profile {
        prefs: Prefs,
    }

    impl Class for Profile {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor().index();
            class.serialized("prefs", |p| &p.prefs, |p| &mut p.prefs)?;
            Ok(())
        }
    }

    crate::persist!(embedded Profile);

    #[test]
    fn serialized_field_is_an_unindexed_blob() {
        let registry = Registry::new();
        let profile = Profile {
            prefs: Prefs {
                theme: "dark".into(),
                sizes: vec![12, 14],
            },
        };
        let node = save(&registry, &profile);
        let prefs = node.lookup("prefs").unwrap();
        assert_eq!(prefs.is_indexed(), Some(false));
        assert!(matches!(prefs.as_value(), Some(Value::Blob(_))));
        let loaded: Profile = load(&registry, &node).unwrap().unwrap();
        assert_eq!(loaded.prefs, profile.prefs);
    }
}
