//! CLI override whitelist and the generated override document

use crate::layer::flatten_document;
use crate::{normalize_value, ConfigError, ConfigLayer, Result, CLI_RANK, KEY_SEPARATOR};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

/// The only keys the command line may override
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum OverrideKey {
    /// Address of the server a client connects to
    ServerHost,
    /// Display name of the client device
    DeviceName,
    /// Audio output device path
    SoundCard,
    /// Output level in percent
    OutputLevel,
}

impl OverrideKey {
    /// All whitelisted keys
    pub const ALL: [OverrideKey; 4] = [
        OverrideKey::ServerHost,
        OverrideKey::DeviceName,
        OverrideKey::SoundCard,
        OverrideKey::OutputLevel,
    ];

    /// Canonical configuration key this override sets
    pub fn canonical(&self) -> &'static str {
        match self {
            OverrideKey::ServerHost => "CLIENT__SERVER_HOST",
            OverrideKey::DeviceName => "CLIENT__NAME",
            OverrideKey::SoundCard => "CLIENT__SOUNDCARD",
            OverrideKey::OutputLevel => "CLIENT__VOLUME",
        }
    }

    /// Short name accepted on the command line
    pub fn flag(&self) -> &'static str {
        match self {
            OverrideKey::ServerHost => "server",
            OverrideKey::DeviceName => "name",
            OverrideKey::SoundCard => "device",
            OverrideKey::OutputLevel => "level",
        }
    }

    fn validate(&self, value: &str) -> Result<()> {
        if value.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: self.canonical().to_string(),
                value: value.to_string(),
                expected: "a non-empty value",
            });
        }
        if *self == OverrideKey::OutputLevel {
            match value.trim().parse::<u8>() {
                Ok(level) if level <= 100 => {}
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: self.canonical().to_string(),
                        value: value.to_string(),
                        expected: "a percentage between 0 and 100",
                    });
                }
            }
        }
        Ok(())
    }
}

impl FromStr for OverrideKey {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        OverrideKey::ALL
            .into_iter()
            .find(|k| k.flag() == wanted || k.canonical().eq_ignore_ascii_case(&wanted))
            .ok_or_else(|| ConfigError::UnknownOverride(s.to_string()))
    }
}

/// Validated CLI overrides, the highest-precedence layer
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    values: BTreeMap<OverrideKey, String>,
}

impl CliOverrides {
    /// No overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Set one override after validating its value
    pub fn set(&mut self, key: OverrideKey, value: impl Into<String>) -> Result<&mut Self> {
        let value = value.into();
        key.validate(&value)?;
        self.values.insert(key, value);
        Ok(self)
    }

    /// Set an override when a value is present
    pub fn set_opt(&mut self, key: OverrideKey, value: Option<&str>) -> Result<&mut Self> {
        if let Some(value) = value {
            self.set(key, value)?;
        }
        Ok(self)
    }

    /// Parse a `flag=value` pair
    pub fn set_pair(&mut self, pair: &str) -> Result<&mut Self> {
        let (flag, value) = pair
            .split_once('=')
            .ok_or_else(|| ConfigError::UnknownOverride(pair.to_string()))?;
        let key: OverrideKey = flag.parse()?;
        self.set(key, value)
    }

    /// Whether any override was supplied
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Canonical key/value pairs
    pub fn to_flat(&self) -> BTreeMap<String, String> {
        self.values
            .iter()
            .map(|(k, v)| (k.canonical().to_string(), normalize_value(k.canonical(), v)))
            .collect()
    }

    /// The overrides as a configuration layer
    pub fn to_layer(&self) -> ConfigLayer {
        ConfigLayer::values("command line", self.to_flat(), CLI_RANK)
    }
}

/// Write a flat canonical map as the nested generated override document
///
/// The document is written to a temporary file next to `path` and renamed
/// into place, so readers see either the old or the new document.
pub fn write_generated(path: &Path, values: &BTreeMap<String, String>) -> Result<()> {
    let document = Value::Mapping(nest(values));
    let text = serde_yaml::to_string(&document).map_err(|e| ConfigError::Malformed {
        origin: path.display().to_string(),
        reason: e.to_string(),
    })?;

    let write_err = |source: std::io::Error| ConfigError::WriteError {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(b"# Generated by snapfleet init; edits are kept on the next init.\n")
        .map_err(write_err)?;
    tmp.write_all(text.as_bytes()).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;

    info!(path = %path.display(), keys = values.len(), "wrote generated overrides");
    Ok(())
}

/// Merge `updates` into the existing generated document and rewrite it
pub fn update_generated(path: &Path, updates: &BTreeMap<String, String>) -> Result<BTreeMap<String, String>> {
    let mut merged = match std::fs::read_to_string(path) {
        Ok(text) => flatten_document(&text, &path.display().to_string())?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(source) => {
            return Err(ConfigError::ReadError {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    merged.extend(updates.iter().map(|(k, v)| (k.clone(), v.clone())));
    write_generated(path, &merged)?;
    Ok(merged)
}

fn nest(values: &BTreeMap<String, String>) -> Mapping {
    let mut root = Mapping::new();
    for (key, value) in values {
        let segments: Vec<String> = key
            .split(KEY_SEPARATOR)
            .map(|s| s.to_ascii_lowercase())
            .collect();
        insert_path(&mut root, &segments, value);
    }
    root
}

fn insert_path(map: &mut Mapping, segments: &[String], value: &str) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let key = Value::String(first.clone());
    if rest.is_empty() {
        map.insert(key, Value::String(value.to_string()));
        return;
    }
    let entry = map
        .entry(key)
        .or_insert_with(|| Value::Mapping(Mapping::new()));
    if !entry.is_mapping() {
        // A scalar and a section share a name; the section wins in the document
        *entry = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(child) = entry {
        insert_path(child, rest, value);
    }
}
