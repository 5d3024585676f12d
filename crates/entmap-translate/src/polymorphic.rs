use std::any::{type_name, TypeId};
use std::collections::BTreeMap;
use std::sync::Arc;

use entmap_types::{Node, RawKey, Value};
use tracing::debug;

use crate::class::{Class, ClassTranslator};
use crate::context::{CreateContext, LoadContext, SaveContext};
use crate::entity::EntityCodec;
use crate::error::{TranslateError, TranslateResult};
use crate::path::Path;
use crate::translator::{Persist, Translator};
use crate::type_key::short_type_name;

/// Property holding the exact discriminator of a stored variant.
pub const DISCRIMINATOR_PROPERTY: &str = "^d";

/// Property holding the indexed ancestor closure of a stored variant.
pub const DISCRIMINATOR_INDEX_PROPERTY: &str = "^i";

// ---------------------------------------------------------------------------
// Polymorphic
// ---------------------------------------------------------------------------

/// A closed hierarchy of classes stored under one kind, usually an enum
/// with one arm per class.
///
/// ```ignore
/// impl Polymorphic for Animal {
///     fn describe(h: &mut HierarchyBuilder<'_, '_, Self>) -> TranslateResult<()> {
///         h.base(Animal::Plain, Animal::plain, Animal::plain_mut)?;
///         h.variant(Subclass::new().index(), Animal::Mammal, Animal::mammal, Animal::mammal_mut)?;
///         h.variant(Subclass::new().extends::<Mammal>().index(), Animal::Cat, Animal::cat, Animal::cat_mut)?;
///         Ok(())
///     }
/// }
/// ```
pub trait Polymorphic: Persist {
    fn describe(hierarchy: &mut HierarchyBuilder<'_, '_, Self>) -> TranslateResult<()>;
}

/// Registration options of one subclass.
#[derive(Clone, Debug, Default)]
pub struct Subclass {
    name: Option<String>,
    parent: Option<(TypeId, &'static str)>,
    index: bool,
    aliases: Vec<String>,
}

impl Subclass {
    /// A subclass discriminated by its short type name.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Declare the registered variant `M` as the direct superclass. Without
    /// this the base class is the superclass.
    pub fn extends<M: 'static>(mut self) -> Self {
        self.parent = Some((TypeId::of::<M>(), type_name::<M>()));
        self
    }

    /// Add this discriminator to the index of itself and every descendant.
    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    /// Also load records stored under a former discriminator.
    pub fn also_load(mut self, alias: impl Into<String>) -> Self {
        self.aliases.push(alias.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Hierarchy
// ---------------------------------------------------------------------------

/// Registration record of one class in a hierarchy.
#[derive(Clone, Debug)]
pub struct VariantInfo {
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub discriminator: String,
    pub aliases: Vec<String>,
    /// Whether this class indexes its own discriminator.
    pub indexed: bool,
    /// Discriminators from the first subclass below the base down to this
    /// one. Empty for the base.
    pub ancestry: Vec<String>,
    /// Indexed subset of `ancestry`, stored under `^i`.
    pub index_set: Vec<String>,
}

/// Discriminator table of one polymorphic root. Entry 0 is the base.
#[derive(Debug)]
pub struct Hierarchy {
    root: &'static str,
    kind: String,
    entries: Vec<VariantInfo>,
}

impl Hierarchy {
    pub fn root(&self) -> &'static str {
        self.root
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn base(&self) -> &VariantInfo {
        &self.entries[0]
    }

    pub fn variants(&self) -> &[VariantInfo] {
        &self.entries
    }

    pub fn variant_by_type(&self, type_id: TypeId) -> Option<&VariantInfo> {
        self.entries.iter().find(|v| v.type_id == type_id)
    }

    /// Lookup by current discriminator or alias.
    pub fn variant_by_discriminator(&self, discriminator: &str) -> Option<&VariantInfo> {
        self.position(discriminator).map(|i| &self.entries[i])
    }

    fn position(&self, discriminator: &str) -> Option<usize> {
        self.entries.iter().position(|v| {
            v.discriminator == discriminator || v.aliases.iter().any(|a| a == discriminator)
        })
    }

    /// Whether a record stored as `stored` may be loaded as `requested`.
    pub fn is_compatible(&self, stored: &str, requested: TypeId) -> bool {
        let Some(wanted) = self.variant_by_type(requested) else {
            return false;
        };
        if wanted.type_id == self.base().type_id {
            return true;
        }
        self.variant_by_discriminator(stored)
            .is_some_and(|v| v.ancestry.contains(&wanted.discriminator))
    }
}

// ---------------------------------------------------------------------------
// Arms
// ---------------------------------------------------------------------------

/// Translation of one class of a hierarchy, seen through the root type.
trait Arm<R>: Send + Sync {
    fn matches(&self, root: &R) -> bool;

    fn class_name(&self) -> &'static str;

    fn has_id(&self) -> bool;

    fn id_name(&self) -> Option<&str>;

    fn parent_name(&self) -> Option<&str>;

    /// `embedded` names the kind an embedded entity is keyed under.
    fn save_map(
        &self,
        root: &R,
        index: bool,
        embedded: Option<&str>,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<BTreeMap<String, Node>>;

    fn load_map(
        &self,
        properties: &BTreeMap<String, Node>,
        embedded: bool,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<R>;

    fn key_of(&self, root: &R, kind: &str, path: &Path) -> TranslateResult<RawKey>;

    fn set_key(&self, root: &mut R, key: &RawKey, path: &Path) -> TranslateResult<()>;

    fn prepare_save(&self, root: &mut R);

    fn after_load(&self, root: &mut R);

    fn repeats_embedded(&self) -> bool;
}

struct ClassArm<R, V> {
    class: ClassTranslator<V>,
    wrap: fn(V) -> R,
    peek: fn(&R) -> Option<&V>,
    peek_mut: fn(&mut R) -> Option<&mut V>,
}

impl<R: 'static, V: Send + Sync + 'static> ClassArm<R, V> {
    fn unwrap<'a>(&self, root: &'a R, path: &Path) -> TranslateResult<&'a V> {
        (self.peek)(root).ok_or_else(|| self.not_this(path))
    }

    fn unwrap_mut<'a>(&self, root: &'a mut R, path: &Path) -> TranslateResult<&'a mut V> {
        (self.peek_mut)(root).ok_or_else(|| self.not_this(path))
    }

    fn not_this(&self, path: &Path) -> TranslateError {
        TranslateError::UnknownVariant {
            path: path.to_string(),
            type_name: type_name::<R>().to_string(),
        }
    }
}

impl<R, V> Arm<R> for ClassArm<R, V>
where
    R: Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn matches(&self, root: &R) -> bool {
        (self.peek)(root).is_some()
    }

    fn class_name(&self) -> &'static str {
        self.class.type_name()
    }

    fn has_id(&self) -> bool {
        self.class.id_name().is_some()
    }

    fn id_name(&self) -> Option<&str> {
        self.class.id_name()
    }

    fn parent_name(&self) -> Option<&str> {
        self.class.parent_name()
    }

    fn save_map(
        &self,
        root: &R,
        index: bool,
        embedded: Option<&str>,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<BTreeMap<String, Node>> {
        let value = self.unwrap(root, path)?;
        match embedded {
            Some(kind) => self.class.save_embedded(value, kind, index, ctx, path),
            None => self.class.save_map(value, index, ctx, path),
        }
    }

    fn load_map(
        &self,
        properties: &BTreeMap<String, Node>,
        embedded: bool,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<R> {
        let value = if embedded {
            self.class.load_embedded(properties, ctx, path)?
        } else {
            self.class.load_map(properties, ctx, path)?
        };
        Ok((self.wrap)(value))
    }

    fn key_of(&self, root: &R, kind: &str, path: &Path) -> TranslateResult<RawKey> {
        self.class.key_of(self.unwrap(root, path)?, kind, path)
    }

    fn set_key(&self, root: &mut R, key: &RawKey, path: &Path) -> TranslateResult<()> {
        let value = self.unwrap_mut(root, path)?;
        self.class.set_key(value, key, path)
    }

    fn prepare_save(&self, root: &mut R) {
        if let Some(value) = (self.peek_mut)(root) {
            self.class.prepare_save(value);
        }
    }

    fn after_load(&self, root: &mut R) {
        if let Some(value) = (self.peek_mut)(root) {
            self.class.after_load(value);
        }
    }

    fn repeats_embedded(&self) -> bool {
        self.class.repeats_embedded()
    }
}

// ---------------------------------------------------------------------------
// HierarchyBuilder
// ---------------------------------------------------------------------------

struct Declared {
    type_id: TypeId,
    type_name: &'static str,
    discriminator: String,
    aliases: Vec<String>,
    indexed: bool,
    parent: Option<(TypeId, &'static str)>,
}

/// Declares the classes of polymorphic root `R`.
pub struct HierarchyBuilder<'c, 'r, R> {
    cx: &'c mut CreateContext<'r>,
    path: Path,
    kind: Option<String>,
    base: Option<(Declared, Box<dyn Arm<R>>)>,
    variants: Vec<(Declared, Box<dyn Arm<R>>)>,
}

impl<'c, 'r, R: Send + Sync + 'static> HierarchyBuilder<'c, 'r, R> {
    fn new(cx: &'c mut CreateContext<'r>, path: Path) -> Self {
        Self {
            cx,
            path,
            kind: None,
            base: None,
            variants: Vec::new(),
        }
    }

    /// Kind name when `R` is an entity. Defaults to the short name of `R`.
    pub fn kind(&mut self, kind: impl Into<String>) -> &mut Self {
        self.kind = Some(kind.into());
        self
    }

    /// The base class. It is stored without a discriminator.
    pub fn base<B: Class>(
        &mut self,
        wrap: fn(B) -> R,
        peek: fn(&R) -> Option<&B>,
        peek_mut: fn(&mut R) -> Option<&mut B>,
    ) -> TranslateResult<&mut Self> {
        if self.base.is_some() {
            return Err(self.path.illegal_state(format!(
                "{} declares its base class twice",
                type_name::<R>()
            )));
        }
        let declared = Declared {
            type_id: TypeId::of::<B>(),
            type_name: type_name::<B>(),
            discriminator: short_type_name(type_name::<B>()).to_string(),
            aliases: Vec::new(),
            indexed: false,
            parent: None,
        };
        self.check_unique(&declared)?;
        let arm = self.arm::<B>(wrap, peek, peek_mut)?;
        self.base = Some((declared, arm));
        Ok(self)
    }

    /// A subclass, discriminated as `subclass` says.
    pub fn variant<V: Class>(
        &mut self,
        subclass: Subclass,
        wrap: fn(V) -> R,
        peek: fn(&R) -> Option<&V>,
        peek_mut: fn(&mut R) -> Option<&mut V>,
    ) -> TranslateResult<&mut Self> {
        let declared = Declared {
            type_id: TypeId::of::<V>(),
            type_name: type_name::<V>(),
            discriminator: subclass
                .name
                .unwrap_or_else(|| short_type_name(type_name::<V>()).to_string()),
            aliases: subclass.aliases,
            indexed: subclass.index,
            parent: subclass.parent,
        };
        self.check_unique(&declared)?;
        let arm = self.arm::<V>(wrap, peek, peek_mut)?;
        self.variants.push((declared, arm));
        Ok(self)
    }

    fn arm<V: Class>(
        &mut self,
        wrap: fn(V) -> R,
        peek: fn(&R) -> Option<&V>,
        peek_mut: fn(&mut R) -> Option<&mut V>,
    ) -> TranslateResult<Box<dyn Arm<R>>> {
        let class = ClassTranslator::<V>::build(self.cx, &self.path)?;
        Ok(Box::new(ClassArm {
            class,
            wrap,
            peek,
            peek_mut,
        }))
    }

    fn check_unique(&self, declared: &Declared) -> TranslateResult<()> {
        let taken = self
            .base
            .iter()
            .chain(&self.variants)
            .flat_map(|(d, _)| std::iter::once(&d.discriminator).chain(&d.aliases));
        let mut candidates = std::iter::once(&declared.discriminator).chain(&declared.aliases);
        let clash = candidates.find(|name| taken.clone().any(|t| t == *name));
        if let Some(name) = clash {
            return Err(TranslateError::DuplicateDiscriminator {
                type_name: type_name::<R>().to_string(),
                discriminator: name.clone(),
            });
        }
        Ok(())
    }

    /// Resolve ancestries in declaration order and build the table.
    fn finish(self) -> TranslateResult<(Hierarchy, Vec<Box<dyn Arm<R>>>)> {
        let root = type_name::<R>();
        let (base, base_arm) = self.base.ok_or_else(|| TranslateError::MissingBase {
            type_name: root.to_string(),
        })?;
        let mut entries = vec![VariantInfo {
            type_id: base.type_id,
            type_name: base.type_name,
            discriminator: base.discriminator,
            aliases: base.aliases,
            indexed: false,
            ancestry: Vec::new(),
            index_set: Vec::new(),
        }];
        let mut arms = vec![base_arm];

        for (declared, arm) in self.variants {
            let (mut ancestry, mut index_set) = match declared.parent {
                None => (Vec::new(), Vec::new()),
                Some((parent, _)) if parent == entries[0].type_id => (Vec::new(), Vec::new()),
                Some((parent, parent_name)) => {
                    let Some(info) = entries.iter().find(|v| v.type_id == parent) else {
                        return Err(TranslateError::UnknownParentDiscriminator {
                            type_name: declared.type_name.to_string(),
                            discriminator: declared.discriminator,
                            parent: short_type_name(parent_name).to_string(),
                        });
                    };
                    (info.ancestry.clone(), info.index_set.clone())
                }
            };
            ancestry.push(declared.discriminator.clone());
            if declared.indexed {
                index_set.push(declared.discriminator.clone());
            }
            debug!(
                root,
                discriminator = %declared.discriminator,
                index_set = ?index_set,
                "registered subclass"
            );
            entries.push(VariantInfo {
                type_id: declared.type_id,
                type_name: declared.type_name,
                discriminator: declared.discriminator,
                aliases: declared.aliases,
                indexed: declared.indexed,
                ancestry,
                index_set,
            });
            arms.push(arm);
        }

        let kind = self
            .kind
            .unwrap_or_else(|| short_type_name(root).to_string());
        Ok((
            Hierarchy {
                root,
                kind,
                entries,
            },
            arms,
        ))
    }
}

// ---------------------------------------------------------------------------
// PolymorphicTranslator
// ---------------------------------------------------------------------------

/// Selects the class of a value by discriminator.
pub struct PolymorphicTranslator<R> {
    hierarchy: Arc<Hierarchy>,
    arms: Vec<Box<dyn Arm<R>>>,
}

impl<R: Polymorphic> PolymorphicTranslator<R> {
    /// Run `R::describe` and record the discriminator table in the registry.
    pub fn build(cx: &mut CreateContext<'_>, path: &Path) -> TranslateResult<Self> {
        let mut builder = HierarchyBuilder::<R>::new(cx, path.clone());
        R::describe(&mut builder)?;
        let (hierarchy, arms) = builder.finish()?;
        let hierarchy = Arc::new(hierarchy);
        cx.record_hierarchy(TypeId::of::<R>(), Arc::clone(&hierarchy));
        Ok(Self { hierarchy, arms })
    }
}

impl<R: Send + Sync + 'static> PolymorphicTranslator<R> {
    pub fn hierarchy(&self) -> &Arc<Hierarchy> {
        &self.hierarchy
    }

    fn position_of(&self, pojo: &R, path: &Path) -> TranslateResult<usize> {
        self.arms
            .iter()
            .position(|arm| arm.matches(pojo))
            .ok_or_else(|| TranslateError::UnknownVariant {
                path: path.to_string(),
                type_name: type_name::<R>().to_string(),
            })
    }

    /// The arm named by the `^d` property; the base if there is none.
    fn position_in(
        &self,
        properties: &BTreeMap<String, Node>,
        path: &Path,
    ) -> TranslateResult<usize> {
        let Some(node) = properties.get(DISCRIMINATOR_PROPERTY) else {
            return Ok(0);
        };
        match node.as_value() {
            Some(Value::String(discriminator)) => self
                .hierarchy
                .position(discriminator)
                .ok_or_else(|| TranslateError::UnknownDiscriminator {
                    path: path.to_string(),
                    discriminator: discriminator.clone(),
                }),
            Some(Value::Null) => Ok(0),
            _ => Err(TranslateError::UnexpectedNode {
                path: path.extend(DISCRIMINATOR_PROPERTY).to_string(),
                expected: "discriminator string",
                found: node.describe(),
            }),
        }
    }

    pub(crate) fn save_properties(
        &self,
        pojo: &R,
        index: bool,
        embedded: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<BTreeMap<String, Node>> {
        let position = self.position_of(pojo, path)?;
        let keyed = embedded.then_some(self.hierarchy.kind());
        let mut out = self.arms[position].save_map(pojo, index, keyed, ctx, path)?;
        if position > 0 {
            let info = &self.hierarchy.entries[position];
            out.insert(
                DISCRIMINATOR_PROPERTY.to_string(),
                Node::unindexed(info.discriminator.as_str()),
            );
            if !info.index_set.is_empty() {
                let closure = info
                    .index_set
                    .iter()
                    .map(|d| Node::indexed(d.as_str()))
                    .collect();
                out.insert(DISCRIMINATOR_INDEX_PROPERTY.to_string(), Node::List(closure));
            }
        }
        Ok(out)
    }

    pub(crate) fn load_properties(
        &self,
        properties: &BTreeMap<String, Node>,
        embedded: bool,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<R> {
        let position = self.position_in(properties, path)?;
        self.arms[position].load_map(properties, embedded, ctx, path)
    }
}

impl<R: Send + Sync + 'static> Translator<R> for PolymorphicTranslator<R> {
    fn load(
        &self,
        node: &Node,
        ctx: &mut LoadContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<R>> {
        if node.is_null() {
            return Ok(None);
        }
        let properties = node.as_map().ok_or_else(|| TranslateError::UnexpectedNode {
            path: path.to_string(),
            expected: "map",
            found: node.describe(),
        })?;
        self.load_properties(properties, true, ctx, path).map(Some)
    }

    fn save(
        &self,
        pojo: &R,
        index: bool,
        ctx: &mut SaveContext<'_>,
        path: &Path,
    ) -> TranslateResult<Option<Node>> {
        let properties = self.save_properties(pojo, index, true, ctx, path)?;
        Ok(Some(Node::Map(properties)))
    }

    fn prepare_save(&self, pojo: &mut R) {
        if let Some(arm) = self.arms.iter().find(|arm| arm.matches(pojo)) {
            arm.prepare_save(pojo);
        }
    }

    fn after_load(&self, pojo: &mut R) {
        if let Some(arm) = self.arms.iter().find(|arm| arm.matches(pojo)) {
            arm.after_load(pojo);
        }
    }

    fn repeats_embedded(&self) -> bool {
        self.arms.iter().any(|arm| arm.repeats_embedded())
    }
}

/// Built-in translator for a polymorphic root used as an embedded value.
pub fn polymorphic_translator<R: Polymorphic>(
    cx: &mut CreateContext<'_>,
    path: &Path,
) -> TranslateResult<Arc<dyn Translator<R>>> {
    Ok(Arc::new(PolymorphicTranslator::<R>::build(cx, path)?))
}

// ---------------------------------------------------------------------------
// Polymorphic entities
// ---------------------------------------------------------------------------

/// Entity codec of a polymorphic hierarchy: every class shares the kind of
/// the root and must reach an id member.
pub struct PolymorphicCodec<R> {
    translator: PolymorphicTranslator<R>,
    id_name: String,
}

impl<R: Polymorphic> PolymorphicCodec<R> {
    pub fn build(cx: &mut CreateContext<'_>, path: &Path) -> TranslateResult<Self> {
        let translator = PolymorphicTranslator::<R>::build(cx, path)?;
        if let Some(arm) = translator.arms.iter().find(|arm| !arm.has_id()) {
            return Err(TranslateError::MissingId {
                type_name: arm.class_name().to_string(),
            });
        }
        let id_name = translator.arms[0].id_name().unwrap_or_default().to_string();
        Ok(Self {
            translator,
            id_name,
        })
    }
}

impl<R: Polymorphic> EntityCodec<R> for PolymorphicCodec<R> {
    fn kind(&self) -> &str {
        self.translator.hierarchy.kind()
    }

    fn id_name(&self) -> &str {
        &self.id_name
    }

    fn parent_name(&self) -> Option<&str> {
        self.translator.arms[0].parent_name()
    }

    fn key_of(&self, pojo: &R) -> TranslateResult<RawKey> {
        let root = Path::root();
        let position = self.translator.position_of(pojo, &root)?;
        self.translator.arms[position].key_of(pojo, self.kind(), &root)
    }

    fn set_key(&self, pojo: &mut R, key: &RawKey) -> TranslateResult<()> {
        let root = Path::root();
        let position = self.translator.position_of(pojo, &root)?;
        self.translator.arms[position].set_key(pojo, key, &root)
    }

    fn save_properties(
        &self,
        pojo: &R,
        ctx: &mut SaveContext<'_>,
    ) -> TranslateResult<BTreeMap<String, Node>> {
        self.translator
            .save_properties(pojo, false, false, ctx, &Path::root())
    }

    fn load_properties(
        &self,
        properties: &BTreeMap<String, Node>,
        ctx: &mut LoadContext<'_>,
    ) -> TranslateResult<R> {
        self.translator
            .load_properties(properties, false, ctx, &Path::root())
    }

    fn prepare_save(&self, pojo: &mut R) {
        self.translator.prepare_save(pojo);
    }

    fn after_load(&self, pojo: &mut R) {
        self.translator.after_load(pojo);
    }
}

/// Built-in codec for a polymorphic entity.
pub fn polymorphic_codec<R: Polymorphic>(
    cx: &mut CreateContext<'_>,
    path: &Path,
) -> TranslateResult<Arc<dyn EntityCodec<R>>> {
    Ok(Arc::new(PolymorphicCodec::<R>::build(cx, path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class::ClassBuilder;
    use crate::error::Phase;
    use crate::registry::Registry;
    use entmap_types::Record;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Creature {
        id: Option<i64>,
        name: String,
    }

    impl Class for Creature {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.id("id", |c| &c.id, |c| &mut c.id)?;
            class.field("name", |c| &c.name, |c| &mut c.name)?;
            Ok(())
        }
    }

    crate::persist!(embedded Creature);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Mammal {
        creature: Creature,
        fur: bool,
    }

    impl Class for Mammal {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.extends(|m| &m.creature, |m| &mut m.creature)?;
            class.field("fur", |m| &m.fur, |m| &mut m.fur)?;
            Ok(())
        }
    }

    crate::persist!(embedded Mammal);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Cat {
        mammal: Mammal,
        lives: i64,
    }

    impl Class for Cat {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.extends(|c| &c.mammal, |c| &mut c.mammal)?;
            class.field("lives", |c| &c.lives, |c| &mut c.lives)?;
            Ok(())
        }
    }

    crate::persist!(embedded Cat);

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Dog {
        mammal: Mammal,
    }

    impl Class for Dog {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.extends(|d| &d.mammal, |d| &mut d.mammal)?;
            Ok(())
        }
    }

    crate::persist!(embedded Dog);

    #[derive(Debug, Clone, PartialEq)]
    enum Animal {
        Plain(Creature),
        Mammal(Mammal),
        Cat(Cat),
        Dog(Dog),
    }

    impl Polymorphic for Animal {
        fn describe(h: &mut HierarchyBuilder<'_, '_, Self>) -> TranslateResult<()> {
            h.base(
                Animal::Plain,
                |a| match a {
                    Animal::Plain(c) => Some(c),
                    _ => None,
                },
                |a| match a {
                    Animal::Plain(c) => Some(c),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::new().index(),
                Animal::Mammal,
                |a| match a {
                    Animal::Mammal(m) => Some(m),
                    _ => None,
                },
                |a| match a {
                    Animal::Mammal(m) => Some(m),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::new().extends::<Mammal>().index().also_load("Kitty"),
                Animal::Cat,
                |a| match a {
                    Animal::Cat(c) => Some(c),
                    _ => None,
                },
                |a| match a {
                    Animal::Cat(c) => Some(c),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::named("Doggo").extends::<Mammal>(),
                Animal::Dog,
                |a| match a {
                    Animal::Dog(d) => Some(d),
                    _ => None,
                },
                |a| match a {
                    Animal::Dog(d) => Some(d),
                    _ => None,
                },
            )?;
            Ok(())
        }
    }

    crate::persist!(polymorphic entity Animal);

    fn cat() -> Animal {
        Animal::Cat(Cat {
            mammal: Mammal {
                creature: Creature {
                    id: Some(5),
                    name: "Tom".into(),
                },
                fur: true,
            },
            lives: 9,
        })
    }

    fn strings(node: &Node) -> Vec<&str> {
        node.as_list()
            .unwrap()
            .iter()
            .filter_map(|n| match n.as_value() {
                Some(Value::String(s)) => Some(s.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn indexed_ancestor_closure_is_stored() {
        let registry = Registry::new();
        let metadata = registry.register::<Animal>().unwrap();
        let mut ctx = SaveContext::new(&registry);
        let record = metadata.save(&mut cat(), &mut ctx).unwrap();

        assert_eq!(record.key, RawKey::with_id("Animal", 5));
        assert_eq!(record.property("^d"), Some(&Node::unindexed("Cat")));
        assert_eq!(strings(record.property("^i").unwrap()), vec!["Mammal", "Cat"]);
        assert!(record.index_contains("^i", &Value::from("Mammal")));
        assert!(!record.index_contains("^i", &Value::from("Doggo")));
    }

    #[test]
    fn base_and_unindexed_variants_store_no_index() {
        let registry = Registry::new();
        let metadata = registry.register::<Animal>().unwrap();
        let mut ctx = SaveContext::new(&registry);

        let mut plain = Animal::Plain(Creature {
            id: Some(1),
            name: "blob".into(),
        });
        let record = metadata.save(&mut plain, &mut ctx).unwrap();
        assert!(!record.has_property("^d"));
        assert!(!record.has_property("^i"));

        let mut dog = Animal::Dog(Dog {
            mammal: Mammal {
                creature: Creature {
                    id: Some(2),
                    name: "Rex".into(),
                },
                fur: true,
            },
        });
        let record = metadata.save(&mut dog, &mut ctx).unwrap();
        assert_eq!(record.property("^d"), Some(&Node::unindexed("Doggo")));
        // Dog itself is unindexed, so only Mammal is in its closure.
        assert_eq!(strings(record.property("^i").unwrap()), vec!["Mammal"]);
    }

    #[test]
    fn load_dispatches_on_discriminator() {
        let registry = Registry::new();
        let metadata = registry.register::<Animal>().unwrap();
        let mut ctx = SaveContext::new(&registry);
        let mut original = cat();
        let record = metadata.save(&mut original, &mut ctx).unwrap();

        let mut load = LoadContext::new(&registry);
        assert_eq!(metadata.load(&record, &mut load).unwrap(), original);

        let mut renamed = record.clone();
        renamed.set_property("^d", Node::unindexed("Kitty"));
        assert_eq!(metadata.load(&renamed, &mut load).unwrap(), original);
    }

    #[test]
    fn unknown_discriminator_fails_load() {
        let registry = Registry::new();
        let metadata = registry.register::<Animal>().unwrap();
        let mut record = Record::new(RawKey::with_id("Animal", 1));
        record.set_property("^d", Node::unindexed("Unicorn"));
        let mut load = LoadContext::new(&registry);
        let err = metadata.load(&record, &mut load).unwrap_err();
        assert_eq!(err.phase(), Phase::Load);
        assert!(matches!(
            err,
            TranslateError::UnknownDiscriminator { ref discriminator, .. } if discriminator == "Unicorn"
        ));
    }

    #[test]
    fn hierarchy_answers_compatibility() {
        let registry = Registry::new();
        registry.register::<Animal>().unwrap();
        let hierarchy = registry.hierarchy::<Animal>().unwrap();
        assert_eq!(hierarchy.kind(), "Animal");
        assert_eq!(hierarchy.base().discriminator, "Creature");
        assert!(hierarchy.is_compatible("Cat", TypeId::of::<Creature>()));
        assert!(hierarchy.is_compatible("Cat", TypeId::of::<Mammal>()));
        assert!(hierarchy.is_compatible("Kitty", TypeId::of::<Cat>()));
        assert!(!hierarchy.is_compatible("Cat", TypeId::of::<Dog>()));
        assert!(!hierarchy.is_compatible("Mammal", TypeId::of::<Cat>()));
        assert_eq!(registry.discriminator_of::<Dog>().as_deref(), Some("Doggo"));
    }

    #[test]
    fn embedded_polymorphic_value_roundtrips() {
        let registry = Registry::new();
        let translator = registry.translator::<Vec<Animal>>().unwrap();
        let zoo = vec![cat(), Animal::Plain(Creature::default())];
        let mut ctx = SaveContext::new(&registry);
        let node = translator
            .save(&zoo, false, &mut ctx, &Path::root())
            .unwrap()
            .unwrap();
        let mut load = LoadContext::new(&registry);
        let back = translator.load(&node, &mut load, &Path::root()).unwrap();
        assert_eq!(back, Some(zoo));
    }

    // -- registration errors -------------------------------------------------

    #[derive(Debug)]
    enum Clash {
        A(Creature),
        B(Mammal),
    }

    impl Polymorphic for Clash {
        fn describe(h: &mut HierarchyBuilder<'_, '_, Self>) -> TranslateResult<()> {
            h.base(
                Clash::A,
                |c| match c {
                    Clash::A(a) => Some(a),
                    _ => None,
                },
                |c| match c {
                    Clash::A(a) => Some(a),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::named("Creature"),
                Clash::B,
                |c| match c {
                    Clash::B(b) => Some(b),
                    _ => None,
                },
                |c| match c {
                    Clash::B(b) => Some(b),
                    _ => None,
                },
            )?;
            Ok(())
        }
    }

    crate::persist!(polymorphic Clash);

    #[derive(Debug)]
    enum Orphan {
        Cat(Cat),
    }

    impl Polymorphic for Orphan {
        fn describe(h: &mut HierarchyBuilder<'_, '_, Self>) -> TranslateResult<()> {
            h.variant(
                Subclass::new(),
                Orphan::Cat,
                |o| match o {
                    Orphan::Cat(c) => Some(c),
                },
                |o| match o {
                    Orphan::Cat(c) => Some(c),
                },
            )?;
            Ok(())
        }
    }

    crate::persist!(polymorphic Orphan);

    #[derive(Debug)]
    enum Lost {
        Base(Creature),
        Cat(Cat),
    }

    impl Polymorphic for Lost {
        fn describe(h: &mut HierarchyBuilder<'_, '_, Self>) -> TranslateResult<()> {
            h.base(
                Lost::Base,
                |l| match l {
                    Lost::Base(b) => Some(b),
                    _ => None,
                },
                |l| match l {
                    Lost::Base(b) => Some(b),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::new().extends::<Mammal>(),
                Lost::Cat,
                |l| match l {
                    Lost::Cat(c) => Some(c),
                    _ => None,
                },
                |l| match l {
                    Lost::Cat(c) => Some(c),
                    _ => None,
                },
            )?;
            Ok(())
        }
    }

    crate::persist!(polymorphic Lost);

    #[derive(Debug, Default)]
    struct Pebble {
        weight: i64,
    }

    impl Class for Pebble {
        fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
            class.default_constructor();
            class.field("weight", |p| &p.weight, |p| &mut p.weight)?;
            Ok(())
        }
    }

    crate::persist!(embedded Pebble);

    #[derive(Debug)]
    enum Stone {
        Base(Creature),
        Pebble(Pebble),
    }

    impl Polymorphic for Stone {
        fn describe(h: &mut HierarchyBuilder<'_, '_, Self>) -> TranslateResult<()> {
            h.base(
                Stone::Base,
                |s| match s {
                    Stone::Base(b) => Some(b),
                    _ => None,
                },
                |s| match s {
                    Stone::Base(b) => Some(b),
                    _ => None,
                },
            )?;
            h.variant(
                Subclass::new(),
                Stone::Pebble,
                |s| match s {
                    Stone::Pebble(p) => Some(p),
                    _ => None,
                },
                |s| match s {
                    Stone::Pebble(p) => Some(p),
                    _ => None,
                },
            )?;
            Ok(())
        }
    }

    crate::persist!(polymorphic entity Stone);

    #[test]
    fn failed_entity_registration_forgets_its_hierarchy() {
        let registry = Registry::new();
        let err = registry.register::<Stone>().err().unwrap();
        assert!(matches!(
            err,
            TranslateError::MissingId { ref type_name } if type_name.ends_with("Pebble")
        ));
        assert!(registry.hierarchy::<Stone>().is_none());
        assert_eq!(registry.discriminator_of::<Pebble>(), None);
    }

    #[test]
    fn hierarchy_errors_are_config_errors() {
        let registry = Registry::new();
        let err = registry.translator::<Clash>().err().unwrap();
        assert!(matches!(err, TranslateError::DuplicateDiscriminator { .. }));
        assert_eq!(err.phase(), Phase::Config);

        let err = registry.translator::<Orphan>().err().unwrap();
        assert!(matches!(err, TranslateError::MissingBase { .. }));

        let err = registry.translator::<Lost>().err().unwrap();
        assert!(matches!(
            err,
            TranslateError::UnknownParentDiscriminator { ref parent, .. } if parent == "Mammal"
        ));
    }
}
