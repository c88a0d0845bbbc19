//! Integration tests for configuration management
//!
//! Loads full configuration files from disk and checks validation and
//! directory creation.

use shield_engine::audio::RedactionMode;
use shield_engine::config::Config;
use shield_engine::executor::ExecutorSettings;
use std::time::Duration;

fn write_config(dir: &std::path::Path, extra: &str) -> std::path::PathBuf {
    let toml = format!(
        r#"
[core]
output_dir = {out:?}
work_dir = {work:?}
audit_log = {audit:?}
log_level = "debug"

[llm]
base_url = "http://localhost:8000/v1/"
model = "local-model"
timeout_secs = 30

[executor]
max_retries = 3
max_replans = 1
stage_timeout_secs = 120

[generator]
tools_dir = {tools:?}
interpreter = "python3"
max_attempts = 2

[video]
detect_every = 2
max_predicted_frames = 45
detector_command = ["face-detect", "--json"]

[audio]
mode = "silence"
pad_ms = 200

[verification]
max_miss_ratio = 0.05
{extra}
"#,
        out = dir.join("out"),
        work = dir.join("work"),
        audit = dir.join("logs/audit.jsonl"),
        tools = dir.join("tools"),
        extra = extra,
    );
    let path = dir.join("shield.toml");
    std::fs::write(&path, toml).unwrap();
    path
}

#[test]
fn test_config_file_loads_every_section() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_from_path(&write_config(dir.path(), "")).unwrap();

    assert_eq!(config.core.log_level, "debug");
    assert_eq!(config.llm.model, "local-model");
    assert_eq!(config.generator.max_attempts, 2);
    assert_eq!(config.video.detect_every, 2);
    assert_eq!(config.video.max_predicted_frames, 45);
    assert_eq!(config.video.detector_command, vec!["face-detect", "--json"]);
    assert_eq!(config.audio.mode, RedactionMode::Silence);
    assert_eq!(config.audio.pad_ms, 200);
    assert_eq!(config.verification.max_miss_ratio, 0.05);
    // Untouched keys keep their defaults
    assert_eq!(config.verification.max_segment_secs, 15.0);
    assert!(config.generator.allowed_imports.iter().any(|m| m == "tool_api"));

    for sub in ["out", "work", "tools"] {
        assert!(dir.path().join(sub).is_dir(), "{} not created", sub);
    }
}

#[test]
fn test_executor_settings_follow_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load_from_path(&write_config(dir.path(), "")).unwrap();
    let settings = ExecutorSettings::from(&config);

    assert_eq!(settings.max_retries, 3);
    assert_eq!(settings.max_replans, 1);
    assert_eq!(settings.stage_timeout, Duration::from_secs(120));
    assert_eq!(settings.output_dir, dir.path().join("out"));
}

#[test]
fn test_invalid_values_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(dir.path(), "max_overlap_ratio = 2.0\n");
    assert!(Config::load_from_path(&path).is_err());

    let bad_level = dir.path().join("level.toml");
    std::fs::write(&bad_level, "[core]\nlog_level = \"loud\"\n").unwrap();
    assert!(Config::load_from_path(&bad_level).is_err());

    let unparseable = dir.path().join("broken.toml");
    std::fs::write(&unparseable, "[core\n").unwrap();
    assert!(Config::load_from_path(&unparseable).is_err());
}

#[test]
fn test_missing_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = Config::load_from_path(&dir.path().join("absent.toml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read config file"));
}
