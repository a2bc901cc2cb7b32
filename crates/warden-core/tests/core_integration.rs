#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;
use warden_core::*;

// ---------------------------------------------------------------------------
// 1. `?` conversions from the parsers the runtime depends on
// ---------------------------------------------------------------------------

fn parse_json(raw: &str) -> WardenResult<serde_json::Value> {
    Ok(serde_json::from_str(raw)?)
}

fn parse_toml(raw: &str) -> WardenResult<toml::Table> {
    Ok(toml::from_str(raw)?)
}

#[test]
fn json_errors_convert() {
    let err = parse_json("{not json").unwrap_err();
    assert!(matches!(err, WardenError::Json(_)));
    assert!(err.to_string().starts_with("JSON error"));
}

#[test]
fn toml_errors_convert() {
    let err = parse_toml("[breaker\nfailure_threshold = ").unwrap_err();
    assert!(matches!(err, WardenError::TomlParse(_)));
}

#[test]
fn io_errors_convert() {
    fn read() -> WardenResult<String> {
        Ok(std::fs::read_to_string("/definitely/not/here.toml")?)
    }
    assert!(matches!(read().unwrap_err(), WardenError::Io(_)));
}

// ---------------------------------------------------------------------------
// 2. Clocks behind a trait object
// ---------------------------------------------------------------------------

#[test]
fn manual_clock_through_trait_object() {
    let manual = Arc::new(ManualClock::new());
    let clock: Arc<dyn Clock> = manual.clone();

    let before = clock.now();
    manual.advance(Duration::from_secs(121));
    assert_eq!(clock.now().duration_since(before), Duration::from_secs(121));
}
