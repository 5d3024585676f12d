use serde::{Deserialize, Serialize};

/// Limits and coercion switches applied by the leaf translators.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranslateConfig {
    /// Strings longer than this many bytes are stored unindexed.
    pub max_indexed_string_bytes: usize,
    /// Largest string or blob a single leaf may hold.
    pub max_blob_bytes: usize,
    /// Whether numeric, boolean and timestamp translators accept text.
    pub parse_strings: bool,
}

impl Default for TranslateConfig {
    fn default() -> Self {
        Self {
            max_indexed_string_bytes: 1500,
            max_blob_bytes: 1_048_487,
            parse_strings: true,
        }
    }
}

impl TranslateConfig {
    /// A configuration that rejects text in non-string leaves.
    pub fn strict() -> Self {
        Self {
            parse_strings: false,
            ..Default::default()
        }
    }
}
