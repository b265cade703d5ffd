//! Layer merging and lookups
//!
//! Layers are applied lowest rank first, so every later layer's keys
//! unconditionally override earlier ones. Layers of equal rank are applied in
//! the order they were declared.

use crate::{normalize_key, ConfigError, ConfigLayer, Result, KEY_SEPARATOR};
use std::collections::BTreeMap;
use tracing::debug;

/// Builds a [`ResolvedConfig`] from ordered layers
#[derive(Debug, Clone, Default)]
pub struct ConfigResolver {
    layers: Vec<ConfigLayer>,
}

impl ConfigResolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare another layer
    pub fn layer(mut self, layer: ConfigLayer) -> Self {
        self.layers.push(layer);
        self
    }

    /// Declared layers in declaration order
    pub fn layers(&self) -> &[ConfigLayer] {
        &self.layers
    }

    /// Load every layer and merge them
    ///
    /// Any missing required source or malformed document aborts resolution
    /// before a value is produced.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let mut loaded = Vec::with_capacity(self.layers.len());
        for (position, layer) in self.layers.iter().enumerate() {
            if let Some(l) = layer.load()? {
                debug!(layer = %l.name, rank = l.rank, keys = l.entries.len(), "loaded config layer");
                loaded.push((position, l));
            } else {
                debug!(layer = %layer.name(), "optional config layer absent");
            }
        }

        // Stable ordering: rank first, then declaration position
        loaded.sort_by_key(|(position, l)| (l.rank, *position));

        let mut resolved = ResolvedConfig::default();
        for (_, l) in loaded {
            for (key, value) in l.entries {
                resolved.origins.insert(key.clone(), l.name.clone());
                resolved.values.insert(key, value);
            }
        }
        Ok(resolved)
    }
}

/// The merged configuration
///
/// A flat map of canonical `SECTION__KEY` names to normalised values. It is
/// built once and only ever read afterwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedConfig {
    values: BTreeMap<String, String>,
    origins: BTreeMap<String, String>,
}

impl ResolvedConfig {
    /// Build directly from flat pairs; keys and values are normalised
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::default();
        for (k, v) in pairs {
            let key = normalize_key(k.as_ref());
            let value = crate::normalize_value(&key, v.as_ref());
            config.origins.insert(key.clone(), "inline".to_string());
            config.values.insert(key, value);
        }
        config
    }

    /// Exact lookup by canonical key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&normalize_key(key)).map(String::as_str)
    }

    /// Nested lookup: `(section, key)` resolves to `SECTION__KEY`
    pub fn nested(&self, section: &str, key: &str) -> Option<&str> {
        let canonical = normalize_key(&format!("{}{}{}", section, KEY_SEPARATOR, key));
        self.values.get(&canonical).map(String::as_str)
    }

    /// Nested lookup with a default
    pub fn nested_or<'a>(&'a self, section: &str, key: &str, default: &'a str) -> &'a str {
        self.nested(section, key).unwrap_or(default)
    }

    /// Top-level lookup
    ///
    /// Fails if a nested section with the same name exists, since a bare
    /// name must never silently pick one of the two.
    pub fn top(&self, key: &str) -> Result<Option<&str>> {
        let canonical = normalize_key(key);
        let section_prefix = format!("{}{}", canonical, KEY_SEPARATOR);
        if let Some((nested, _)) = self
            .values
            .range(section_prefix.clone()..)
            .next()
            .filter(|(k, _)| k.starts_with(&section_prefix))
        {
            return Err(ConfigError::AmbiguousKey {
                key: canonical,
                nested: nested.clone(),
            });
        }
        Ok(self.values.get(&canonical).map(String::as_str))
    }

    /// Top-level lookup with a default
    pub fn top_or<'a>(&'a self, key: &str, default: &'a str) -> Result<&'a str> {
        Ok(self.top(key)?.unwrap_or(default))
    }

    /// Nested boolean lookup; only `"true"`/`"false"` are accepted
    pub fn nested_bool(&self, section: &str, key: &str, default: bool) -> Result<bool> {
        match self.nested(section, key) {
            None => Ok(default),
            Some("true") => Ok(true),
            Some("false") => Ok(false),
            Some(other) => Err(ConfigError::InvalidValue {
                key: normalize_key(&format!("{}{}{}", section, KEY_SEPARATOR, key)),
                value: other.to_string(),
                expected: "a boolean",
            }),
        }
    }

    /// Nested TCP port lookup
    pub fn nested_port(&self, section: &str, key: &str, default: u16) -> Result<u16> {
        match self.nested(section, key) {
            None => Ok(default),
            Some(text) => text
                .trim()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConfigError::InvalidValue {
                    key: normalize_key(&format!("{}{}{}", section, KEY_SEPARATOR, key)),
                    value: text.to_string(),
                    expected: "a port number",
                }),
        }
    }

    /// The informational profile the configuration was generated from
    ///
    /// Recorded for display only; reconciliation never reads it.
    pub fn profile(&self) -> Option<&str> {
        self.values.get("PROFILE").map(String::as_str)
    }

    /// Name of the layer that supplied the winning value for `key`
    pub fn origin(&self, key: &str) -> Option<&str> {
        self.origins.get(&normalize_key(key)).map(String::as_str)
    }

    /// All entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Entries whose key starts with `SECTION__`, with the prefix stripped
    pub fn section(&self, section: &str) -> BTreeMap<String, String> {
        let prefix = format!("{}{}", normalize_key(section), KEY_SEPARATOR);
        self.values
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&prefix).map(|rest| (rest.to_string(), v.clone())))
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no entries
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
