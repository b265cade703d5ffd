//! Integration tests for snapfleet-config

use snapfleet_config::{
    CliOverrides, ConfigError, ConfigLayer, ConfigResolver, OverrideKey, ResolvedConfig,
};
use std::fs;
use std::path::Path;

fn write(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    path
}

fn resolve(base: &Path, generated: &Path, overrides: &CliOverrides) -> ResolvedConfig {
    ConfigResolver::new()
        .layer(ConfigLayer::base(base))
        .layer(ConfigLayer::generated(generated))
        .layer(overrides.to_layer())
        .resolve()
        .unwrap()
}

#[test]
fn test_full_layer_stack() {
    let dir = tempfile::tempdir().unwrap();
    let base = write(
        dir.path(),
        "config.yaml",
        r#"
profile: default
server:
  stream_port: 1704
  control_port: 1705
  fifo_path: /tmp/snapfifo
client:
  server_host: 127.0.0.1
  name: Default
  soundcard: default
  volume: 100
  mute: no
"#,
    );
    let generated = write(
        dir.path(),
        "generated.yaml",
        r#"
profile: party
client:
  name: Living Room
  volume: 70
"#,
    );
    let mut overrides = CliOverrides::new();
    overrides.set(OverrideKey::OutputLevel, "35").unwrap();

    let config = resolve(&base, &generated, &overrides);

    // Only in base
    assert_eq!(config.nested("server", "stream_port"), Some("1704"));
    assert_eq!(config.nested("client", "mute"), Some("false"));
    // Base overridden by generated
    assert_eq!(config.nested("client", "name"), Some("Living Room"));
    assert_eq!(config.profile(), Some("party"));
    // Base and generated overridden by the command line
    assert_eq!(config.nested("client", "volume"), Some("35"));
    assert_eq!(config.origin("CLIENT__VOLUME"), Some("command line"));
}

#[test]
fn test_precedence_law_holds_for_every_shared_key() {
    let dir = tempfile::tempdir().unwrap();
    let layers = [
        ("a.yaml", 10, "x: 1\ny: 1\nz: 1\n"),
        ("b.yaml", 30, "x: 3\n"),
        ("c.yaml", 20, "x: 2\ny: 2\n"),
    ];
    let mut resolver = ConfigResolver::new();
    for (name, rank, body) in layers {
        let path = write(dir.path(), name, body);
        resolver = resolver.layer(ConfigLayer::new(
            snapfleet_config::LayerSource::File {
                path,
                required: true,
            },
            rank,
        ));
    }
    let config = resolver.resolve().unwrap();

    assert_eq!(config.top("x").unwrap(), Some("3"));
    assert_eq!(config.top("y").unwrap(), Some("2"));
    assert_eq!(config.top("z").unwrap(), Some("1"));
}

#[test]
fn test_missing_generated_document_is_tolerated() {
    let dir = tempfile::tempdir().unwrap();
    let base = write(dir.path(), "config.yaml", "client:\n  name: Solo\n");
    let config = resolve(&base, &dir.path().join("absent.yaml"), &CliOverrides::new());
    assert_eq!(config.nested("client", "name"), Some("Solo"));
}

#[test]
fn test_missing_base_document_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let err = ConfigResolver::new()
        .layer(ConfigLayer::base(dir.path().join("config.yaml")))
        .resolve()
        .unwrap_err();
    assert!(matches!(err, ConfigError::SourceMissing { .. }));
    assert!(err.remediation().is_some());
}

#[test]
fn test_malformed_generated_document_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let base = write(dir.path(), "config.yaml", "client:\n  name: Solo\n");
    let generated = write(dir.path(), "generated.yaml", "client: [broken\n");
    let err = ConfigResolver::new()
        .layer(ConfigLayer::base(&base))
        .layer(ConfigLayer::generated(&generated))
        .resolve()
        .unwrap_err();
    assert!(matches!(err, ConfigError::Malformed { .. }));
}
