use std::io::Write;
use std::path::PathBuf;

use varflow_core::config::AppConfig;
use varflow_core::error::VarflowError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
script_dirs = ["etl", "reports"]
extensions = ["py", "pyw"]
workspace = "/tmp/varflow-test"

[executor]
interpreter = "python3.12"
extra_args = ["-X", "utf8"]
working_dir = "/srv/data"

[store]
snapshot_file = "/tmp/varflow-test/state/vars.db"

[scheduler]
tick_secs = 30
utc_offset_hours = -5
force_runs = true
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(
        config.script_dirs(),
        vec![PathBuf::from("etl"), PathBuf::from("reports")]
    );
    assert_eq!(config.engine.extensions, vec!["py", "pyw"]);
    assert_eq!(config.executor.interpreter, "python3.12");
    assert_eq!(config.executor.extra_args, vec!["-X", "utf8"]);
    assert_eq!(config.executor.working_dir.as_deref(), Some("/srv/data"));
    assert_eq!(
        config.snapshot_path(),
        PathBuf::from("/tmp/varflow-test/state/vars.db")
    );
    assert_eq!(
        config.schedule_path(),
        PathBuf::from("/tmp/varflow-test/schedule.json")
    );
    assert_eq!(config.scheduler.tick_secs, 30);
    assert_eq!(config.scheduler.utc_offset_hours, -5);
    assert!(config.scheduler.force_runs);
}

#[test]
fn test_load_minimal_config_uses_defaults() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[executor]\ninterpreter = \"python\"\n")
        .expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.executor.interpreter, "python");
    assert_eq!(config.engine.script_dirs, vec!["scripts"]);
    assert_eq!(config.scheduler.tick_secs, 60);
    assert!(!config.scheduler.force_runs);
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("VARFLOW_TEST_INTERP", "/opt/py/bin/python3");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[executor]\ninterpreter = \"${VARFLOW_TEST_INTERP}\"\n")
        .expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.executor.interpreter, "/opt/py/bin/python3");
    std::env::remove_var("VARFLOW_TEST_INTERP");
}

#[test]
fn test_missing_file_is_not_found() {
    let err = AppConfig::load(std::path::Path::new("/nonexistent/varflow.toml")).unwrap_err();
    assert!(matches!(err, VarflowError::ConfigNotFound(_)));
}

#[test]
fn test_invalid_values_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[scheduler]\nutc_offset_hours = 40\n")
        .expect("write toml");
    assert!(matches!(
        AppConfig::load(tmp.path()),
        Err(VarflowError::Config(_))
    ));

    let mut bad_syntax = tempfile::NamedTempFile::new().expect("create temp file");
    bad_syntax.write_all(b"[engine\n").expect("write toml");
    assert!(matches!(
        AppConfig::load(bad_syntax.path()),
        Err(VarflowError::Config(_))
    ));
}
