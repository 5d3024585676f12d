use entmap_types::RawKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MapperError {
    #[error("translate error: {0}")]
    Translate(#[from] entmap_translate::TranslateError),

    #[error("store error: {0}")]
    Store(#[from] entmap_store::StoreError),

    #[error("{type_name} is not part of a registered polymorphic hierarchy")]
    UnknownVariant { type_name: String },

    #[error("entity {key} is stored as {found}, which is not a {expected}")]
    TypeMismatch {
        key: RawKey,
        expected: String,
        found: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type MapperResult<T> = Result<T, MapperError>;
