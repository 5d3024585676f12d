use serde::{Deserialize, Serialize};

use entmap_translate::TranslateConfig;

use crate::error::{MapperError, MapperResult};

/// Settings of a [`Mapper`](crate::Mapper).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    /// Load groups active when a load names none.
    pub default_groups: Vec<String>,
    /// Upper bound on reference fetch rounds per load.
    pub max_batch_rounds: usize,
    /// Leaf translator limits handed to the registry.
    pub translate: TranslateConfig,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            default_groups: Vec::new(),
            max_batch_rounds: 64,
            translate: TranslateConfig::default(),
        }
    }
}

impl MapperConfig {
    /// Parse a TOML document. Missing keys keep their defaults.
    ///
    /// ```toml
    /// default_groups = ["staff"]
    /// max_batch_rounds = 8
    ///
    /// [translate]
    /// parse_strings = false
    /// ```
    pub fn from_toml_str(source: &str) -> MapperResult<Self> {
        toml::from_str(source).map_err(|e| MapperError::Config(e.to_string()))
    }

    pub fn to_toml_string(&self) -> MapperResult<String> {
        toml::to_string(self).map_err(|e| MapperError::Config(e.to_string()))
    }

    pub fn with_groups<I, S>(mut self, groups: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.default_groups = groups.into_iter().map(Into::into).collect();
        self
    }
}
