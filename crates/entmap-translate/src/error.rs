use std::fmt;

/// When an error can surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Registration time. Fatal and never retried.
    Config,
    /// Translating an object graph into an attribute tree.
    Save,
    /// Translating an attribute tree into an object graph.
    Load,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config => write!(f, "config"),
            Self::Save => write!(f, "save"),
            Self::Load => write!(f, "load"),
        }
    }
}

/// Errors raised by the translation engine.
///
/// Data errors carry the dotted path of the offending node. The skip signal
/// is not an error: translators return `Ok(None)` for it.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    // -- configuration ------------------------------------------------------
    #[error("{type_name} has no constructor")]
    MissingConstructor { type_name: String },

    #[error("{type_name} declares no id property")]
    MissingId { type_name: String },

    #[error("{type_name} declares more than one id property: '{first}' and '{second}'")]
    DuplicateId {
        type_name: String,
        first: String,
        second: String,
    },

    #[error("{type_name} declares more than one parent property: '{first}' and '{second}'")]
    DuplicateParent {
        type_name: String,
        first: String,
        second: String,
    },

    #[error("{type_name} is declared both indexed and unindexed")]
    ConflictingIndex { type_name: String },

    #[error("{type_name} maps property '{name}' more than once")]
    DuplicateProperty { type_name: String, name: String },

    #[error("{type_name} declares invalid property name '{name}'")]
    InvalidPropertyName { type_name: String, name: String },

    #[error("no translator for {type_name} at {path}")]
    NoTranslator { type_name: String, path: String },

    #[error("factory produced a translator of the wrong type for {type_name}")]
    FactoryMismatch { type_name: String },

    #[error("embedded collections nested inside embedded collections at {path}")]
    NestedEmbeddedCollection { path: String },

    #[error("{type_name} registers discriminator '{discriminator}' more than once")]
    DuplicateDiscriminator {
        type_name: String,
        discriminator: String,
    },

    #[error("{type_name}: discriminator '{discriminator}' extends unknown '{parent}'")]
    UnknownParentDiscriminator {
        type_name: String,
        discriminator: String,
        parent: String,
    },

    #[error("{type_name} declares no base class")]
    MissingBase { type_name: String },

    #[error("kind '{kind}' is claimed by both {first} and {second}")]
    DuplicateKind {
        kind: String,
        first: String,
        second: String,
    },

    #[error("{type_name} is not a registered entity")]
    NotRegistered { type_name: String },

    #[error("illegal state at {path}: {message}")]
    IllegalState { path: String, message: String },

    // -- save ---------------------------------------------------------------
    #[error("null map key at {path}")]
    NullMapKey { path: String },

    #[error("map key '{key}' at {path} contains '.'")]
    DottedMapKey { path: String, key: String },

    #[error("{kind} has a null string id at {path}")]
    NullStringId { path: String, kind: String },

    #[error("value too large at {path}: {detail}")]
    ValueTooLarge { path: String, detail: String },

    #[error("serialization failed at {path}: {message}")]
    Serialization { path: String, message: String },

    #[error("value of {type_name} at {path} matches no registered variant")]
    UnknownVariant { path: String, type_name: String },

    // -- load ---------------------------------------------------------------
    #[error("conflicting values for '{first}' and its alias '{second}' at {path}")]
    ConflictingAliases {
        path: String,
        first: String,
        second: String,
    },

    #[error("unknown discriminator '{discriminator}' at {path}")]
    UnknownDiscriminator { path: String, discriminator: String },

    #[error("type mismatch at {path}: expected {expected}, found {found}")]
    TypeMismatch {
        path: String,
        expected: String,
        found: String,
    },

    #[error("{kind} declares no parent but the stored key at {path} has one")]
    UnexpectedParent { path: String, kind: String },

    #[error("unexpected node at {path}: expected {expected}, found {found}")]
    UnexpectedNode {
        path: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("unknown enum name '{name}' at {path}")]
    UnknownEnumName { path: String, name: String },

    #[error("invalid value at {path}: {detail}")]
    InvalidValue { path: String, detail: String },

    #[error("key kind mismatch at {path}: expected {expected}, found {found}")]
    KindMismatch {
        path: String,
        expected: String,
        found: String,
    },
}

impl TranslateError {
    /// Classify the error by the phase it belongs to.
    pub fn phase(&self) -> Phase {
        match self {
            Self::MissingConstructor { .. }
            | Self::MissingId { .. }
            | Self::DuplicateId { .. }
            | Self::DuplicateParent { .. }
            | Self::ConflictingIndex { .. }
            | Self::DuplicateProperty { .. }
            | Self::InvalidPropertyName { .. }
            | Self::NoTranslator { .. }
            | Self::FactoryMismatch { .. }
            | Self::NestedEmbeddedCollection { .. }
            | Self::DuplicateDiscriminator { .. }
            | Self::UnknownParentDiscriminator { .. }
            | Self::MissingBase { .. }
            | Self::DuplicateKind { .. }
            | Self::NotRegistered { .. }
            | Self::IllegalState { .. } => Phase::Config,
            Self::NullMapKey { .. }
            | Self::DottedMapKey { .. }
            | Self::NullStringId { .. }
            | Self::ValueTooLarge { .. }
            | Self::Serialization { .. }
            | Self::UnknownVariant { .. } => Phase::Save,
            Self::ConflictingAliases { .. }
            | Self::UnknownDiscriminator { .. }
            | Self::TypeMismatch { .. }
            | Self::UnexpectedParent { .. }
            | Self::UnexpectedNode { .. }
            | Self::UnknownEnumName { .. }
            | Self::InvalidValue { .. }
            | Self::KindMismatch { .. } => Phase::Load,
        }
    }

    /// The dotted path carried by the error, if any.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::NoTranslator { path, .. }
            | Self::NestedEmbeddedCollection { path }
            | Self::IllegalState { path, .. }
            | Self::NullMapKey { path }
            | Self::DottedMapKey { path, .. }
            | Self::ValueTooLarge { path, .. }
            | Self::Serialization { path, .. }
            | Self::UnknownVariant { path, .. }
            | Self::ConflictingAliases { path, .. }
            | Self::UnknownDiscriminator { path, .. }
            | Self::TypeMismatch { path, .. }
            | Self::UnexpectedNode { path, .. }
            | Self::UnknownEnumName { path, .. }
            | Self::InvalidValue { path, .. }
            | Self::NullStringId { path, .. }
            | Self::UnexpectedParent { path, .. }
            | Self::KindMismatch { path, .. } => Some(path),
            _ => None,
        }
    }
}

/// Convenience alias for translation results.
pub type TranslateResult<T> = Result<T, TranslateError>;
