use std::io::Write;

use council_core::config::AppConfig;
use council_core::error::CouncilError;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[server]
ws_url = "ws://council.local:8080/ws"
api_base = "http://council.local:8080"

[reconnect]
max_attempts = 8
base_delay_ms = 250

[heartbeat]
interval_secs = 15

[timer]
tick_interval_ms = 50
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.server.ws_url, "ws://council.local:8080/ws");
    assert_eq!(config.server.api_base, "http://council.local:8080");
    assert_eq!(config.reconnect.max_attempts, 8);
    assert_eq!(config.reconnect.base_delay_ms, 250);
    assert_eq!(config.heartbeat.interval_secs, 15);
    assert_eq!(config.timer.tick_interval_ms, 50);
}

#[test]
fn test_minimal_config_uses_defaults() {
    let toml_content = r#"
[server]
ws_url = "ws://localhost:8080/ws"
api_base = "http://localhost:8080"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.reconnect.max_attempts, 5);
    assert_eq!(config.reconnect.base_delay_ms, 1000);
    assert_eq!(config.heartbeat.interval_secs, 30);
    assert_eq!(config.timer.tick_interval_ms, 100);
}

#[test]
fn test_missing_server_section_is_rejected() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[reconnect]\nmax_attempts = 3\n")
        .expect("write toml");

    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(matches!(err, CouncilError::Config(_)));
}
