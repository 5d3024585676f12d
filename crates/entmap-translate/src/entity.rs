use std::collections::BTreeMap;
use std::sync::Arc;

use entmap_types::{Node, RawKey, Record};
use tracing::debug;

use crate::class::{Class, ClassTranslator, KEY_PROPERTY};
use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::translator::{Persist, Translator};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A root-level class stored under its own key.
///
/// Implemented through `persist!(entity T)` for a [`Class`] and through
/// `persist!(polymorphic entity T)` for a polymorphic hierarchy.
pub trait Entity: Persist {
    fn codec(cx: &mut CreateContext<'_>, path: &Path) -> TranslateResult<Arc<dyn EntityCodec<Self>>>;
}

/// Key handling and property translation for one entity type.
pub trait EntityCodec<P>: Send + Sync {
    fn kind(&self) -> &str;

    fn id_name(&self) -> &str;

    fn parent_name(&self) -> Option<&str>;

    /// The key of `pojo`; incomplete while its id is still to be generated.
    fn key_of(&self, pojo: &P) -> TranslateResult<RawKey>;

    fn set_key(&self, pojo: &mut P, key: &RawKey) -> TranslateResult<()>;

    fn save_properties(
        &self,
        pojo: &P,
        ctx: &mut SaveContext<'_>,
    ) -> TranslateResult<BTreeMap<String, Node>>;

    fn load_properties(
        &self,
        properties: &BTreeMap<String, Node>,
        ctx: &mut LoadContext<'_>,
    ) -> TranslateResult<P>;

    fn prepare_save(&self, pojo: &mut P);

    fn after_load(&self, pojo: &mut P);
}

// ---------------------------------------------------------------------------
// EntityMetadata
// ---------------------------------------------------------------------------

/// Per-entity metadata, built once at registration.
pub struct EntityMetadata<P> {
    codec: Arc<dyn EntityCodec<P>>,
}

impl<P: Send + Sync + 'static> EntityMetadata<P> {
    pub fn new(codec: Arc<dyn EntityCodec<P>>) -> Self {
        Self { codec }
    }

    pub fn kind(&self) -> &str {
        self.codec.kind()
    }

    /// Name of the id member.
    pub fn id_name(&self) -> &str {
        self.codec.id_name()
    }

    /// Name of the parent member, if the entity declares one.
    pub fn parent_name(&self) -> Option<&str> {
        self.codec.parent_name()
    }

    pub fn key_of(&self, pojo: &P) -> TranslateResult<RawKey> {
        self.codec.key_of(pojo)
    }

    pub fn set_key(&self, pojo: &mut P, key: &RawKey) -> TranslateResult<()> {
        self.check_kind(key)?;
        self.codec.set_key(pojo, key)
    }

    /// Run the before-save hooks, then translate.
    pub fn save(&self, pojo: &mut P, ctx: &mut SaveContext<'_>) -> TranslateResult<Record> {
        self.prepare_save(pojo);
        self.to_record(pojo, ctx)
    }

    /// Translate without running hooks.
    pub fn to_record(&self, pojo: &P, ctx: &mut SaveContext<'_>) -> TranslateResult<Record> {
        let key = self.codec.key_of(pojo)?;
        let properties = self.codec.save_properties(pojo, ctx)?;
        Ok(Record::with_properties(key, properties))
    }

    /// Decode `record` into a fresh instance.
    ///
    /// After-load hooks do not run here: the caller runs
    /// [`Self::after_load`] once every deferred reference has settled.
    pub fn load(&self, record: &Record, ctx: &mut LoadContext<'_>) -> TranslateResult<P> {
        self.check_kind(&record.key)?;
        let mut pojo = self.codec.load_properties(&record.properties, ctx)?;
        self.codec.set_key(&mut pojo, &record.key)?;
        Ok(pojo)
    }

    pub fn prepare_save(&self, pojo: &mut P) {
        self.codec.prepare_save(pojo);
    }

    pub fn after_load(&self, pojo: &mut P) {
        self.codec.after_load(pojo);
    }

    fn check_kind(&self, key: &RawKey) -> TranslateResult<()> {
        if key.kind() != self.kind() {
            return Err(TranslateError::KindMismatch {
                path: KEY_PROPERTY.to_string(),
                expected: self.kind().to_string(),
                found: key.kind().to_string(),
            });
        }
        Ok(())
    }
}

impl<P> std::fmt::Debug for EntityMetadata<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityMetadata")
            .field("kind", &self.codec.kind())
            .field("id", &self.codec.id_name())
            .field("parent", &self.codec.parent_name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Class-backed codec
// ---------------------------------------------------------------------------

/// Entity codec of a plain [`Class`].
pub struct ClassCodec<P> {
    class: ClassTranslator<P>,
    id_name: String,
}

impl<P: Class> ClassCodec<P> {
    pub fn build(cx: &mut CreateContext<'_>, path: &Path) -> TranslateResult<Self> {
        let class = ClassTranslator::<P>::build(cx, path)?;
        let id_name = class
            .id_name()
            .ok_or_else(|| TranslateError::MissingId {
                type_name: class.type_name().to_string(),
            })?
            .to_string();
        debug!(
            kind = %class.kind(),
            id = %id_name,
            properties = class.property_names().len(),
            "built entity codec"
        );
        Ok(Self { class, id_name })
    }
}

impl<P: Class> EntityCodec<P> for ClassCodec<P> {
    fn kind(&self) -> &str {
        self.class.kind()
    }

    fn id_name(&self) -> &str {
        &self.id_name
    }

    fn parent_name(&self) -> Option<&str> {
        self.class.parent_name()
    }

    fn key_of(&self, pojo: &P) -> TranslateResult<RawKey> {
        self.class.key_of(pojo, self.class.kind(), &Path::root())
    }

    fn set_key(&self, pojo: &mut P, key: &RawKey) -> TranslateResult<()> {
        self.class.set_key(pojo, key, &Path::root())
    }

    fn save_properties(
        &self,
        pojo: &P,
        ctx: &mut SaveContext<'_>,
    ) -> TranslateResult<BTreeMap<String, Node>> {
        self.class.save_map(pojo, false, ctx, &Path::root())
    }

    fn load_properties(
        &self,
        properties: &BTreeMap<String, Node>,
        ctx: &mut LoadContext<'_>,
    ) -> TranslateResult<P> {
        self.class.load_map(properties, ctx, &Path::root())
    }

    fn prepare_save(&self, pojo: &mut P) {
        self.class.prepare_save(pojo);
    }

    fn after_load(&self, pojo: &mut P) {
        self.class.after_load(pojo);
    }
}

/// Built-in codec for an entity class.
pub fn class_codec<P: Class>(
    cx: &mut CreateContext<'_>,
    path: &Path,
) -> TranslateResult<Arc<dyn EntityCodec<P>>> {
    Ok(Arc::new(ClassCodec::<P>::build(cx, path)?))
}
