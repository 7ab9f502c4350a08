//! Config environment variable tests
//!
//! These tests verify that Config::from_env() correctly reads and applies
//! environment variable overrides. Config::from_env() also loads a .env file
//! via dotenvy, so these tests focus on override behavior.
//!
//! Tests use #[serial] to prevent race conditions with shared env vars.

use alpha_research::config::{Config, DatabaseConfig, LogFormat};
use alpha_research::error::AppError;
use alpha_research::expression::ExpressionValidator;
use serial_test::serial;
use std::env;
use std::time::Duration;

#[test]
#[serial]
fn test_config_from_env_loads_successfully() {
    let result = Config::from_env();
    assert!(result.is_ok(), "Config::from_env() should succeed with defaults");
}

#[test]
#[serial]
fn test_config_from_env_custom_database() {
    env::set_var("DATABASE_PATH", "/custom/research.db");
    env::set_var("DATABASE_MAX_CONNECTIONS", "10");
    env::set_var("DATABASE_BUSY_TIMEOUT_MS", "250");
    env::set_var("STORE_OPERATION_TIMEOUT_MS", "1500");

    let config = Config::from_env().unwrap();
    assert_eq!(config.database.path.to_str().unwrap(), "/custom/research.db");
    assert_eq!(config.database.max_connections, 10);
    assert_eq!(config.database.busy_timeout(), Duration::from_millis(250));
    assert_eq!(config.database.operation_timeout(), Duration::from_millis(1500));

    // Cleanup
    env::remove_var("DATABASE_PATH");
    env::remove_var("DATABASE_MAX_CONNECTIONS");
    env::remove_var("DATABASE_BUSY_TIMEOUT_MS");
    env::remove_var("STORE_OPERATION_TIMEOUT_MS");
}

#[test]
#[serial]
fn test_config_invalid_number_uses_default() {
    env::set_var("DATABASE_MAX_CONNECTIONS", "not-a-number");
    env::set_var("STORE_OPERATION_TIMEOUT_MS", "-1");

    let config = Config::from_env().unwrap();
    // Should fall back to defaults
    assert_eq!(config.database.max_connections, 5);
    assert_eq!(config.database.operation_timeout_ms, 30000);

    // Cleanup
    env::remove_var("DATABASE_MAX_CONNECTIONS");
    env::remove_var("STORE_OPERATION_TIMEOUT_MS");
}

#[test]
#[serial]
fn test_config_zero_connections_rejected() {
    env::set_var("DATABASE_MAX_CONNECTIONS", "0");

    let result = Config::from_env();
    assert!(matches!(result, Err(AppError::Config { .. })));

    // Cleanup
    env::remove_var("DATABASE_MAX_CONNECTIONS");
}

#[test]
#[serial]
fn test_config_from_env_json_log_format() {
    env::set_var("LOG_FORMAT", "JSON");
    env::set_var("LOG_LEVEL", "debug");

    let config = Config::from_env().unwrap();
    assert_eq!(config.logging.format, LogFormat::Json);
    assert_eq!(config.logging.level, "debug");

    // Cleanup
    env::remove_var("LOG_FORMAT");
    env::remove_var("LOG_LEVEL");
}

#[test]
#[serial]
fn test_config_from_env_validator() {
    env::set_var("VALIDATOR_STRICT_ARITY", "true");
    env::set_var("GRAMMAR_EXTRA_VARIABLES", "vwap, returns ,,");

    let config = Config::from_env().unwrap();
    assert!(config.validator.strict_arity);
    assert_eq!(config.validator.extra_variables, vec!["vwap", "returns"]);

    let validator = ExpressionValidator::from_config(&config.validator);
    assert!(validator.validate("SMA(vwap, 10) / returns").is_ok());
    // Strict arity from the environment.
    assert!(validator.validate("SMA(vwap)").is_err());

    // Cleanup
    env::remove_var("VALIDATOR_STRICT_ARITY");
    env::remove_var("GRAMMAR_EXTRA_VARIABLES");
}

#[test]
#[serial]
fn test_config_validator_defaults() {
    env::remove_var("VALIDATOR_STRICT_ARITY");
    env::remove_var("GRAMMAR_EXTRA_VARIABLES");

    let config = Config::from_env().unwrap();
    assert!(!config.validator.strict_arity);
    assert!(config.validator.extra_variables.is_empty());
}

#[test]
fn test_database_config_default() {
    let config = DatabaseConfig::default();
    assert_eq!(config.path.to_str().unwrap(), "./data/research.db");
    assert_eq!(config.max_connections, 5);
    assert_eq!(config.busy_timeout(), Duration::from_millis(5000));
    assert_eq!(config.operation_timeout(), Duration::from_millis(30000));
}
