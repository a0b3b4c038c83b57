//! Config error-message, atomic-write-safety, and init integration tests.
//! Storage: ~/.keysync/config.yaml

use assert_fs::prelude::*;
use keysync_core::{
    config, BackendKind, BackendResolver, ConfigError, Environment, EnvironmentName,
    RetryStrategyKind,
};
use predicates::prelude::predicate;
use rstest::rstest;
use std::fs;

fn write_config(home: &assert_fs::TempDir, yaml: &str) {
    let dir = home.path().join(".keysync");
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("config.yaml"), yaml).expect("write");
}

const MINIMAL: &str = "\
version: 1
region: us-east-1
created_at: 2024-01-01T00:00:00Z
updated_at: 2024-01-01T00:00:00Z
";

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_missing_config_returns_not_found() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
    assert!(err.to_string().contains("keysync init"));
}

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, ": : corrupt : yaml : !!!\n  - broken: [unclosed");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"));
}

#[test]
fn sync_defaults_apply_when_section_missing() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, MINIMAL);

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.sync.workers, 4);
    assert_eq!(loaded.sync.batch_size, 10);
    assert_eq!(loaded.sync.retry.strategy, RetryStrategyKind::Exponential);
    assert!(loaded.environments.is_empty());
}

#[rstest]
#[case("sync:\n  workers: 0\n", "workers")]
#[case("sync:\n  batch_size: 0\n", "batch_size")]
#[case(
    "environments:\n  - name: dev\n    path: \"  \"\n",
    "empty path"
)]
fn invalid_values_are_rejected_on_load(#[case] extra: &str, #[case] needle: &str) {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(&home, &format!("{MINIMAL}{extra}"));

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)), "got: {err}");
    assert!(err.to_string().contains(needle), "got: {err}");
}

#[test]
fn environments_parse_with_backend_and_files() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    write_config(
        &home,
        &format!(
            "{MINIMAL}environments:\n  - name: prod\n    backend: secrets_manager\n    path: app/prod\n    files: [.env, .env.prod]\n"
        ),
    );

    let loaded = config::load_at(home.path()).expect("load");
    let prod = loaded
        .environment(&EnvironmentName::from("prod"))
        .expect("prod env");
    assert_eq!(prod.backend, BackendKind::SecretsManager);
    assert_eq!(prod.files, vec![".env".to_string(), ".env.prod".to_string()]);

    let resolved = loaded
        .resolve_backend(&EnvironmentName::from("prod"))
        .expect("resolve");
    assert_eq!(resolved.base_path, "app/prod");
    assert_eq!(resolved.region, "us-east-1");
}

// ---------------------------------------------------------------------------
// 2. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn mid_write_crash_leaves_original_intact() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    config::init_at(home.path(), None).expect("init");

    let path = config::config_path_at(home.path());
    let original_bytes = fs::read(&path).expect("read original");

    // Simulate crash: .tmp written but process died before rename
    let tmp = path.with_file_name("config.yaml.tmp");
    fs::write(&tmp, b"CRASH - INCOMPLETE WRITE").expect("write crash tmp");

    let loaded = config::load_at(home.path()).expect("load after crash");
    assert_eq!(original_bytes, fs::read(&path).expect("read after crash"));
    assert_eq!(loaded.version, config::CONFIG_VERSION);
}

// ---------------------------------------------------------------------------
// 3. Init integration test
// ---------------------------------------------------------------------------

#[test]
fn init_creates_owner_only_config() {
    let home = assert_fs::TempDir::new().expect("home tempdir");
    config::init_at(home.path(), Some("eu-central-1".into())).expect("init");

    home.child(".keysync/config.yaml")
        .assert(predicate::path::exists());

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = config::config_path_at(home.path());
        let mode = fs::metadata(&path).expect("meta").permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "expected 0600, got {mode:o}");
    }
}

#[test]
fn upsert_replaces_existing_environment() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let mut cfg = config::init_at(home.path(), None).expect("init");
    let mut dev = Environment {
        name: EnvironmentName::from("dev"),
        backend: BackendKind::ParameterStore,
        path: "/app/dev".into(),
        region: None,
        files: vec![],
    };
    cfg.upsert_environment(dev.clone());
    dev.path = "/app/development".into();
    cfg.upsert_environment(dev);
    config::save_at(home.path(), &cfg).expect("save");

    let loaded = config::load_at(home.path()).expect("load");
    assert_eq!(loaded.environments.len(), 1);
    assert_eq!(loaded.environments[0].path, "/app/development");
}
