use entmap_types::RawKey;

/// Errors from datastore operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A write or delete addressed a key that has no identifier.
    #[error("key is incomplete: {0}")]
    IncompleteKey(RawKey),

    /// Id allocation could not find a free identifier.
    #[error("id space exhausted for kind {0}")]
    IdSpaceExhausted(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
