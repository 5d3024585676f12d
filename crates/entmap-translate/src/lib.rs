//! Translation engine for entmap.
//!
//! Converts between application object graphs and the schema-less
//! attribute trees of [`entmap_types`]. Every persistable type resolves to a
//! [`Translator`] through the [`Registry`]'s factory chain; translators are
//! memoized per [`TypeKey`], so recursive types terminate.
//!
//! # Key Types
//!
//! - [`Registry`] -- Factory chain, translator memo, entity metadata and discriminator tables
//! - [`Translator`] -- Stateless bidirectional translation of one node; `Ok(None)` is the skip signal
//! - [`Persist`] -- Names the built-in translator band of a type
//! - [`Class`] / [`ClassBuilder`] -- Declares the members of an embedded class or entity
//! - [`Entity`] / [`EntityMetadata`] -- Key handling and record translation of a root class
//! - [`Polymorphic`] / [`Hierarchy`] -- Discriminated subclasses with an indexed ancestor closure
//! - [`Ref`] / [`PendingRef`] -- Cross-entity references resolved later by a batch loader
//!
//! # Declaring types
//!
//! ```ignore
//! #[derive(Default)]
//! struct Car { id: Option<i64>, plate: String }
//!
//! impl Class for Car {
//!     fn describe(class: &mut ClassBuilder<'_, '_, Self>) -> TranslateResult<()> {
//!         class.default_constructor();
//!         class.id("id", |c| &c.id, |c| &mut c.id)?;
//!         class.field("plate", |c| &c.plate, |c| &mut c.plate)?;
//!         Ok(())
//!     }
//! }
//!
//! entmap_translate::persist!(entity Car);
//! ```

pub mod class;
pub mod collection;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod leaf;
pub mod map;
pub mod option;
pub mod path;
pub mod polymorphic;
pub mod reference;
pub mod registry;
pub mod translator;
pub mod type_key;

pub use class::{Class, ClassBuilder, ClassTranslator, Field, IdValue, ParentValue, KEY_PROPERTY};
pub use collection::Collection;
pub use config::TranslateConfig;
pub use context::{CreateContext, LoadContext, SaveContext};
pub use entity::{Entity, EntityCodec, EntityMetadata};
pub use error::{Phase, TranslateError, TranslateResult};
pub use leaf::{EnumName, LeafTranslator, ValueCodec};
pub use map::{MapKey, MapLike};
pub use path::Path;
pub use polymorphic::{
    Hierarchy, HierarchyBuilder, Polymorphic, Subclass, VariantInfo, DISCRIMINATOR_INDEX_PROPERTY,
    DISCRIMINATOR_PROPERTY,
};
pub use reference::{DecodedEntity, PendingRef, Ref, Resolved};
pub use registry::{FactoryBand, Registry, TranslatorFactory};
pub use translator::{erase, unerase, ErasedTranslator, Persist, Shape, Translator};
pub use type_key::{Annotation, TypeKey};

/// Implement [`Persist`] (and [`Entity`] where asked) for a user type.
///
/// - `persist!(embedded T)` for a [`Class`] stored inside other classes.
/// - `persist!(entity T)` for a [`Class`] that is also a root entity.
/// - `persist!(enum T)` for an [`EnumName`] stored by name.
/// - `persist!(collection T)` for a custom [`Collection`].
/// - `persist!(polymorphic T)` for a [`Polymorphic`] root stored inside other classes.
/// - `persist!(polymorphic entity T)` for a [`Polymorphic`] root entity.
#[macro_export]
macro_rules! persist {
    (polymorphic entity $t:ty) => {
        $crate::persist!(polymorphic $t);

        impl $crate::Entity for $t {
            fn codec(
                cx: &mut $crate::CreateContext<'_>,
                path: &$crate::Path,
            ) -> $crate::TranslateResult<::std::sync::Arc<dyn $crate::EntityCodec<Self>>> {
                $crate::polymorphic::polymorphic_codec::<Self>(cx, path)
            }
        }
    };
    (polymorphic $t:ty) => {
        impl $crate::Persist for $t {
            const SHAPE: $crate::Shape = $crate::Shape::Class;

            fn create(
                cx: &mut $crate::CreateContext<'_>,
                _key: &$crate::TypeKey,
                path: &$crate::Path,
            ) -> $crate::TranslateResult<::std::sync::Arc<dyn $crate::Translator<Self>>> {
                $crate::polymorphic::polymorphic_translator::<Self>(cx, path)
            }
        }
    };
    (embedded $t:ty) => {
        impl $crate::Persist for $t {
            const SHAPE: $crate::Shape = $crate::Shape::Class;

            fn create(
                cx: &mut $crate::CreateContext<'_>,
                _key: &$crate::TypeKey,
                path: &$crate::Path,
            ) -> $crate::TranslateResult<::std::sync::Arc<dyn $crate::Translator<Self>>> {
                $crate::class::class_translator::<Self>(cx, path)
            }
        }
    };
    (entity $t:ty) => {
        $crate::persist!(embedded $t);

        impl $crate::Entity for $t {
            fn codec(
                cx: &mut $crate::CreateContext<'_>,
                path: &$crate::Path,
            ) -> $crate::TranslateResult<::std::sync::Arc<dyn $crate::EntityCodec<Self>>> {
                $crate::entity::class_codec::<Self>(cx, path)
            }
        }
    };
    (enum $t:ty) => {
        impl $crate::Persist for $t {
            const SHAPE: $crate::Shape = $crate::Shape::Scalar;

            fn create(
                _cx: &mut $crate::CreateContext<'_>,
                _key: &$crate::TypeKey,
                _path: &$crate::Path,
            ) -> $crate::TranslateResult<::std::sync::Arc<dyn $crate::Translator<Self>>> {
                $crate::leaf::enum_translator::<Self>()
            }
        }
    };
    (collection $t:ty) => {
        impl $crate::Persist for $t {
            const SHAPE: $crate::Shape = $crate::Shape::Structural;

            fn create(
                cx: &mut $crate::CreateContext<'_>,
                key: &$crate::TypeKey,
                path: &$crate::Path,
            ) -> $crate::TranslateResult<::std::sync::Arc<dyn $crate::Translator<Self>>> {
                $crate::collection::collection_translator::<Self>(cx, key, path)
            }
        }
    };
}
