//! Template rendering with atomic, change-aware writes
//!
//! Templates are plain text with `{{UPPER_SNAKE}}` placeholders. A render
//! either substitutes every placeholder or fails before anything touches the
//! destination.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

const PLACEHOLDER: &str = r"\{\{([A-Z][A-Z0-9_]*)\}\}";

/// Template rendering errors
#[derive(Debug, Error)]
pub enum TemplateError {
    /// One or more placeholders have no bound value
    #[error("Undefined template variable(s) in {}: {}", template.display(), names.join(", "))]
    UndefinedVariable {
        /// Template being rendered
        template: PathBuf,
        /// Every unbound name, sorted
        names: Vec<String>,
    },

    /// The template source could not be read
    #[error("Failed to read template {}: {source}", path.display())]
    ReadFailed {
        /// Template path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The destination could not be written
    #[error("Failed to write {}: {source}", path.display())]
    WriteFailed {
        /// Destination path
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The placeholder pattern failed to compile
    #[error("Invalid placeholder pattern: {0}")]
    Pattern(#[from] regex::Error),
}

impl TemplateError {
    /// A copy-pasteable command that addresses the error, when one is known
    pub fn remediation(&self) -> Option<String> {
        match self {
            TemplateError::UndefinedVariable { names, .. } => names.first().map(|name| {
                let (section, key) = name.split_once("__").unwrap_or(("", name));
                format!(
                    "add '{}: {{ {}: <value> }}' to /etc/snapfleet/config.yaml",
                    section.to_ascii_lowercase(),
                    key.to_ascii_lowercase()
                )
            }),
            TemplateError::ReadFailed { .. } => Some("sudo snapfleet init".to_string()),
            TemplateError::WriteFailed { path, .. } => path
                .parent()
                .map(|dir| format!("sudo mkdir -p {}", dir.display())),
            TemplateError::Pattern(_) => None,
        }
    }
}

/// Result type for template operations
pub type Result<T> = std::result::Result<T, TemplateError>;

/// One file to render
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateJob {
    /// Template source
    pub template: PathBuf,
    /// Rendered file location
    pub destination: PathBuf,
    /// Variables that must be bound even if the template does not use them
    pub required: BTreeSet<String>,
}

impl TemplateJob {
    /// A job with no extra required variables
    pub fn new(template: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            template: template.into(),
            destination: destination.into(),
            required: BTreeSet::new(),
        }
    }

    /// Add required variables
    pub fn require<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(names.into_iter().map(Into::into));
        self
    }
}

/// What a change-aware render did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The destination already held the rendered bytes; nothing was written
    Unchanged,
    /// The destination was (re)written
    Changed,
}

impl RenderOutcome {
    /// Whether the destination was written
    pub fn changed(&self) -> bool {
        matches!(self, RenderOutcome::Changed)
    }
}

/// Names of every placeholder in `text`
pub fn placeholders(text: &str) -> Result<BTreeSet<String>> {
    let re = Regex::new(PLACEHOLDER)?;
    Ok(re
        .captures_iter(text)
        .map(|cap| cap[1].to_string())
        .collect())
}

/// Substitute every placeholder in `text`
///
/// All unbound names are collected and reported together; no partial output
/// is ever returned.
pub fn render(text: &str, vars: &BTreeMap<String, String>, origin: &Path) -> Result<String> {
    let re = Regex::new(PLACEHOLDER)?;
    let missing: BTreeSet<String> = re
        .captures_iter(text)
        .map(|cap| cap[1].to_string())
        .filter(|name| !vars.contains_key(name))
        .collect();
    if !missing.is_empty() {
        return Err(TemplateError::UndefinedVariable {
            template: origin.to_path_buf(),
            names: missing.into_iter().collect(),
        });
    }

    let rendered = re.replace_all(text, |cap: &regex::Captures<'_>| {
        vars.get(&cap[1]).cloned().unwrap_or_default()
    });
    Ok(rendered.into_owned())
}

/// Render a job's template into bytes without touching the destination
pub fn render_job(job: &TemplateJob, vars: &BTreeMap<String, String>) -> Result<String> {
    let missing: Vec<String> = job
        .required
        .iter()
        .filter(|name| !vars.contains_key(*name))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(TemplateError::UndefinedVariable {
            template: job.template.clone(),
            names: missing,
        });
    }

    let text = std::fs::read_to_string(&job.template).map_err(|source| {
        TemplateError::ReadFailed {
            path: job.template.clone(),
            source,
        }
    })?;
    render(&text, vars, &job.template)
}

/// Replace `path` with `bytes` via a temporary file in the same directory
///
/// Permissions of an existing destination are carried over. A crash at any
/// point leaves either the previous or the new content in place.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let write_err = |source: std::io::Error| TemplateError::WriteFailed {
        path: path.to_path_buf(),
        source,
    };
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir).map_err(write_err)?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    if let Ok(meta) = std::fs::metadata(path) {
        std::fs::set_permissions(tmp.path(), meta.permissions()).map_err(write_err)?;
    } else {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(tmp.path(), std::fs::Permissions::from_mode(0o644))
            .map_err(write_err)?;
    }
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Render a job and write it only if the bytes differ from the destination
pub fn render_if_changed(job: &TemplateJob, vars: &BTreeMap<String, String>) -> Result<RenderOutcome> {
    let rendered = render_job(job, vars)?;
    write_if_changed(&job.destination, rendered.as_bytes())
}

/// Write already rendered bytes only if they differ from `destination`
pub fn write_if_changed(destination: &Path, rendered: &[u8]) -> Result<RenderOutcome> {
    match std::fs::read(destination) {
        Ok(current) if current == rendered => {
            debug!(destination = %destination.display(), "template unchanged");
            return Ok(RenderOutcome::Unchanged);
        }
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(source) => {
            return Err(TemplateError::ReadFailed {
                path: destination.to_path_buf(),
                source,
            });
        }
    }

    write_atomic(destination, rendered)?;
    info!(destination = %destination.display(), "rendered template");
    Ok(RenderOutcome::Changed)
}

/// Templates shipped with the tool, by file name
pub const BUILTIN_TEMPLATES: [(&str, &str); 4] = [
    ("server.conf.tmpl", include_str!("../templates/server.conf.tmpl")),
    ("client.env.tmpl", include_str!("../templates/client.env.tmpl")),
    (
        "snapfleet-server.service.tmpl",
        include_str!("../templates/snapfleet-server.service.tmpl"),
    ),
    (
        "snapfleet-client.service.tmpl",
        include_str!("../templates/snapfleet-client.service.tmpl"),
    ),
];

/// Write any built-in template missing from `dir`; existing ones are kept
pub fn install_builtin_templates(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();
    for (name, body) in BUILTIN_TEMPLATES {
        let path = dir.join(name);
        if path.exists() {
            continue;
        }
        write_atomic(&path, body.as_bytes())?;
        written.push(path);
    }
    if !written.is_empty() {
        info!(dir = %dir.display(), count = written.len(), "installed built-in templates");
    }
    Ok(written)
}
