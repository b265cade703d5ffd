//! Configuration layers and flattening
//!
//! A layer is one ordered configuration source. Loading a layer parses it as
//! YAML and flattens the nested mapping: `server: { stream_port: 1704 }`
//! becomes `SERVER__STREAM_PORT = "1704"`.

use crate::{normalize_key, normalize_segment, normalize_value, ConfigError, Result, KEY_SEPARATOR};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Rank of the base configuration document
pub const BASE_RANK: u32 = 10;
/// Rank of the generated override document
pub const GENERATED_RANK: u32 = 20;
/// Rank of CLI-supplied overrides
pub const CLI_RANK: u32 = 30;

/// Where a layer's content comes from
#[derive(Debug, Clone, PartialEq)]
pub enum LayerSource {
    /// A YAML file on disk
    File {
        /// Path to the document
        path: PathBuf,
        /// Whether a missing file is an error or an empty layer
        required: bool,
    },
    /// A YAML document held in memory
    Inline {
        /// Name used in diagnostics
        name: String,
        /// Document text
        document: String,
    },
    /// Already-flat key/value pairs (keys are normalised on load)
    Values {
        /// Name used in diagnostics
        name: String,
        /// The pairs
        values: BTreeMap<String, String>,
    },
}

/// One configuration source with its precedence rank
///
/// Immutable once built. Higher ranks win; equal ranks are ordered by the
/// position the layer was declared in.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigLayer {
    source: LayerSource,
    rank: u32,
}

/// A parsed and flattened layer
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedLayer {
    /// Name used in diagnostics and provenance
    pub name: String,
    /// Precedence rank
    pub rank: u32,
    /// Flattened entries
    pub entries: BTreeMap<String, String>,
}

impl ConfigLayer {
    /// Create a layer from any source
    pub fn new(source: LayerSource, rank: u32) -> Self {
        Self { source, rank }
    }

    /// The required base document
    pub fn base(path: impl Into<PathBuf>) -> Self {
        Self::new(
            LayerSource::File {
                path: path.into(),
                required: true,
            },
            BASE_RANK,
        )
    }

    /// The generated override document; absent until `init` has written it
    pub fn generated(path: impl Into<PathBuf>) -> Self {
        Self::new(
            LayerSource::File {
                path: path.into(),
                required: false,
            },
            GENERATED_RANK,
        )
    }

    /// An in-memory YAML document
    pub fn inline(name: impl Into<String>, document: impl Into<String>, rank: u32) -> Self {
        Self::new(
            LayerSource::Inline {
                name: name.into(),
                document: document.into(),
            },
            rank,
        )
    }

    /// Flat key/value pairs
    pub fn values(name: impl Into<String>, values: BTreeMap<String, String>, rank: u32) -> Self {
        Self::new(
            LayerSource::Values {
                name: name.into(),
                values,
            },
            rank,
        )
    }

    /// Precedence rank
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// The source description
    pub fn source(&self) -> &LayerSource {
        &self.source
    }

    /// Name used in diagnostics
    pub fn name(&self) -> String {
        match &self.source {
            LayerSource::File { path, .. } => path.display().to_string(),
            LayerSource::Inline { name, .. } | LayerSource::Values { name, .. } => name.clone(),
        }
    }

    /// Parse and flatten the layer
    ///
    /// Returns `Ok(None)` only for an optional file that does not exist.
    pub fn load(&self) -> Result<Option<LoadedLayer>> {
        let name = self.name();
        let entries = match &self.source {
            LayerSource::File { path, required } => match read_document(path, *required)? {
                Some(text) => flatten_document(&text, &name)?,
                None => return Ok(None),
            },
            LayerSource::Inline { document, .. } => flatten_document(document, &name)?,
            LayerSource::Values { values, .. } => values
                .iter()
                .map(|(k, v)| {
                    let key = normalize_key(k);
                    let value = normalize_value(&key, v);
                    (key, value)
                })
                .filter(|(k, _)| !k.is_empty())
                .collect(),
        };

        Ok(Some(LoadedLayer {
            name,
            rank: self.rank,
            entries,
        }))
    }
}

fn read_document(path: &Path, required: bool) -> Result<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if required {
                Err(ConfigError::SourceMissing {
                    path: path.to_path_buf(),
                })
            } else {
                Ok(None)
            }
        }
        Err(source) => Err(ConfigError::ReadError {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Parse a YAML document and flatten it into canonical keys
pub fn flatten_document(text: &str, origin: &str) -> Result<BTreeMap<String, String>> {
    let value: Value = serde_yaml::from_str(text).map_err(|e| ConfigError::Malformed {
        origin: origin.to_string(),
        reason: e.to_string(),
    })?;

    let mut out = BTreeMap::new();
    match value {
        Value::Mapping(map) => flatten_into(&map, "", &mut out, origin)?,
        // An empty document is an empty layer
        Value::Null => {}
        _ => {
            return Err(ConfigError::Malformed {
                origin: origin.to_string(),
                reason: "top level must be a mapping".to_string(),
            });
        }
    }
    Ok(out)
}

fn flatten_into(
    map: &Mapping,
    prefix: &str,
    out: &mut BTreeMap<String, String>,
    origin: &str,
) -> Result<()> {
    for (raw_key, value) in map {
        let segment = match raw_key {
            Value::String(s) => normalize_key(s),
            Value::Number(n) => normalize_segment(&n.to_string()),
            Value::Bool(b) => normalize_segment(&b.to_string()),
            _ => {
                return Err(ConfigError::Malformed {
                    origin: origin.to_string(),
                    reason: format!("unsupported key {:?} under '{}'", raw_key, prefix),
                });
            }
        };
        if segment.is_empty() {
            return Err(ConfigError::Malformed {
                origin: origin.to_string(),
                reason: format!("empty key under '{}'", prefix),
            });
        }

        let key = if prefix.is_empty() {
            segment
        } else {
            format!("{}{}{}", prefix, KEY_SEPARATOR, segment)
        };

        match value {
            Value::Mapping(nested) => flatten_into(nested, &key, out, origin)?,
            Value::Null => {}
            Value::Sequence(items) => {
                let mut parts = Vec::with_capacity(items.len());
                for item in items {
                    match scalar_text(&key, item) {
                        Some(text) => parts.push(text),
                        None => {
                            return Err(ConfigError::Malformed {
                                origin: origin.to_string(),
                                reason: format!("'{}' must be a list of scalars", key),
                            });
                        }
                    }
                }
                out.insert(key, parts.join(","));
            }
            other => match scalar_text(&key, other) {
                Some(text) => {
                    out.insert(key, text);
                }
                None => {
                    return Err(ConfigError::Malformed {
                        origin: origin.to_string(),
                        reason: format!("unsupported value for '{}'", key),
                    });
                }
            },
        }
    }
    Ok(())
}

fn scalar_text(key: &str, value: &Value) -> Option<String> {
    match value {
        Value::Bool(b) => Some(if *b { "true" } else { "false" }.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(normalize_value(key, s)),
        Value::Tagged(tagged) => scalar_text(key, &tagged.value),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flatten_nested_document() {
        let yaml = r#"
profile: living-room
server:
  stream_port: 1704
  fifo-path: /tmp/snapfifo
  http:
    enabled: True
client:
  name: "Kitchen"
  latency: 0
  tags: [a, b, 3]
  unused: ~
"#;
        let flat = flatten_document(yaml, "test").unwrap();
        assert_eq!(flat["PROFILE"], "living-room");
        assert_eq!(flat["SERVER__STREAM_PORT"], "1704");
        assert_eq!(flat["SERVER__FIFO_PATH"], "/tmp/snapfifo");
        assert_eq!(flat["SERVER__HTTP__ENABLED"], "true");
        assert_eq!(flat["CLIENT__NAME"], "Kitchen");
        assert_eq!(flat["CLIENT__LATENCY"], "0");
        assert_eq!(flat["CLIENT__TAGS"], "a,b,3");
        assert!(!flat.contains_key("CLIENT__UNUSED"));
    }

    #[test]
    fn test_boolean_spellings_normalised() {
        let yaml = "http_enabled: yes\nmute: 'On'\nc: false\nd: FALSE\nplayer: 'Off'\n";
        let flat = flatten_document(yaml, "test").unwrap();
        assert_eq!(flat["HTTP_ENABLED"], "true");
        assert_eq!(flat["MUTE"], "true");
        assert_eq!(flat["C"], "false");
        assert_eq!(flat["D"], "false");
        // A name that happens to spell a boolean stays as written
        assert_eq!(flat["PLAYER"], "Off");
    }

    #[test]
    fn test_dotted_keys_match_nested_keys() {
        let flat = flatten_document("server.stream_port: 1800\n", "test").unwrap();
        assert_eq!(flat["SERVER__STREAM_PORT"], "1800");
    }

    #[test]
    fn test_malformed_documents() {
        assert!(matches!(
            flatten_document("- just\n- a list\n", "test"),
            Err(ConfigError::Malformed { .. })
        ));
        assert!(matches!(
            flatten_document("server: [unclosed\n", "test"),
            Err(ConfigError::Malformed { .. })
        ));
        assert!(matches!(
            flatten_document("list:\n  - nested: map\n", "test"),
            Err(ConfigError::Malformed { .. })
        ));
    }

    #[test]
    fn test_optional_file_missing_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let layer = ConfigLayer::generated(dir.path().join("generated.yaml"));
        assert_eq!(layer.load().unwrap(), None);

        let layer = ConfigLayer::base(dir.path().join("config.yaml"));
        assert!(matches!(
            layer.load(),
            Err(ConfigError::SourceMissing { .. })
        ));
    }
}
