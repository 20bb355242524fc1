//! Configuration loading from files on disk.

use labctl::config::{LabConfig, LogFormat};
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_full_config() {
    let file = write_config(
        r#"
        [application]
        log_level = "debug"
        log_format = "json"

        [[instruments]]
        id = "stage"
        driver = "stage"
        device = "/dev/ttyUSB0"
        timeout_ms = 1500

        [[instruments]]
        id = "thermo"
        driver = "thermometer"
        device = "/dev/ttyUSB3"
        quiet = true
        enabled = false
        "#,
    );

    let config = LabConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.application.log_level, "debug");
    assert_eq!(config.application.log_format, LogFormat::Json);
    assert_eq!(config.instruments.len(), 2);

    let stage = config.instrument("stage").unwrap();
    assert_eq!(
        stage.options().timeout,
        Some(Duration::from_millis(1500))
    );
    assert!(stage.enabled);

    let enabled: Vec<_> = config.enabled_instruments().map(|i| i.id.as_str()).collect();
    assert_eq!(enabled, vec!["stage"]);
}

#[test]
fn test_missing_sections_use_defaults() {
    let file = write_config("");
    let config = LabConfig::load_from(file.path()).unwrap();
    assert_eq!(config.application.log_level, "info");
    assert_eq!(config.application.log_format, LogFormat::Compact);
    assert!(config.instruments.is_empty());
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = LabConfig::load_from(dir.path().join("absent.toml")).unwrap();
    assert!(config.instruments.is_empty());
}

#[test]
fn test_bad_driver_fails_validation() {
    let file = write_config(
        r#"
        [[instruments]]
        id = "beam"
        driver = "viper"
        device = "/dev/ttyUSB4"
        "#,
    );
    let config = LabConfig::load_from(file.path()).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_malformed_instrument_fails_to_load() {
    let file = write_config(
        r#"
        [[instruments]]
        id = "stage"
        "#,
    );
    assert!(LabConfig::load_from(file.path()).is_err());
}

#[test]
fn test_shipped_example_config_is_valid() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/config/labctl.toml");
    let config = LabConfig::load_from(path).unwrap();
    assert!(config.validate().is_ok());
    assert_eq!(config.enabled_instruments().count(), 3);
}
