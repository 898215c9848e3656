//! Broker configuration file tests.
//!
//! Covers `BrokerConfig` loading through the `ConfigLoader` blanket trait:
//! defaults for omitted sections, explicit values, parse failures and
//! missing files.

use shmb_common::config::{BrokerConfig, ConfigError, ConfigLoader, LogLevel};
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_empty_file_yields_defaults() {
    let file = write_config("");
    let config = BrokerConfig::load(file.path()).unwrap();
    assert_eq!(config.address, shmb_common::config::default_address());
    assert_eq!(config.shared.log_level, LogLevel::Info);
    assert!(config.validate().is_ok());
}

#[test]
fn test_explicit_values() {
    let file = write_config(
        r#"address = "127.0.0.1:31000"
ready_timeout_ms = 250

[shared]
log_level = "debug"
service_name = "shmb-test"
"#,
    );

    let config = BrokerConfig::load(file.path()).unwrap();
    assert_eq!(config.address.port(), 31000);
    assert_eq!(config.ready_timeout_ms, 250);
    assert_eq!(config.shared.log_level, LogLevel::Debug);
    assert_eq!(config.shared.service_name, "shmb-test");
}

#[test]
fn test_bad_address_is_parse_error() {
    let file = write_config(r#"address = "localhost""#);
    assert!(matches!(
        BrokerConfig::load(file.path()),
        Err(ConfigError::ParseError(_))
    ));
}

#[test]
fn test_missing_file() {
    assert!(matches!(
        BrokerConfig::load(Path::new("/nonexistent/shmb/config.toml")),
        Err(ConfigError::FileNotFound)
    ));
}

#[test]
fn test_resolve_validates() {
    let file = write_config("ready_timeout_ms = 0\n");
    assert!(matches!(
        BrokerConfig::resolve(Some(file.path())),
        Err(ConfigError::ValidationError(_))
    ));
}
