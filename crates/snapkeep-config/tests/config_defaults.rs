// crates/snapkeep-config/tests/config_defaults.rs
// =============================================================================
// Module: Config Defaults and Section Validation Tests
// Description: Validate default behavior and per-section invariants.
// Purpose: Ensure an empty config is valid and bad settings fail closed.
// =============================================================================

//! ## Overview
//! Config defaults and section validation tests for snapkeep-config.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use snapkeep_config::LogSinkKind;
use snapkeep_config::PublishTargetKind;
use snapkeep_core::EventLog;
use snapkeep_core::Level;
use snapkeep_core::SystemClock;
use snapkeep_store_sqlite::JournalMode;
use snapkeep_store_sqlite::SnapshotConfig;

mod common;

use common::assert_invalid;

type TestResult = Result<(), String>;

#[test]
fn empty_config_validates_with_documented_defaults() -> TestResult {
    let config = common::minimal_config().map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    if config.store.path != PathBuf::from("data/app.sqlite") {
        return Err(format!("unexpected store path {}", config.store.path.display()));
    }
    if config.store.journal_mode != JournalMode::Wal {
        return Err("store should default to WAL".to_string());
    }
    if config.publish.target != PublishTargetKind::Noop {
        return Err("publish target should default to noop".to_string());
    }
    let verifier = &config.verifier;
    if (verifier.writers, verifier.batch_size, verifier.duration_ms, verifier.interval_ms) != (4, 50, 10_000, 2_000) {
        return Err("verifier defaults drifted".to_string());
    }
    if config.backup.periodic_interval().is_some() {
        return Err("periodic backups should be off by default".to_string());
    }
    if config.logging.sink != LogSinkKind::Stderr || config.logging.level != Level::Info {
        return Err("logging should default to stderr at info".to_string());
    }
    Ok(())
}

#[test]
fn snapshot_section_maps_onto_engine_settings() -> TestResult {
    let config = common::config_from_toml(
        "[snapshot]\nmax_attempts = 7\nbase_backoff_ms = 5\nlock_wait_ms = 900\ncheckpoint = false\ncycle_timeout_ms = 1500\n",
    )
    .map_err(|err| err.to_string())?;
    let engine = &config.snapshot.engine;
    if (engine.max_attempts, engine.base_backoff_ms, engine.lock_wait_ms, engine.checkpoint) != (7, 5, 900, false) {
        return Err(format!("unexpected engine settings {engine:?}"));
    }
    if config.snapshot.cycle_timeout() != Duration::from_millis(1_500) {
        return Err("cycle timeout not applied".to_string());
    }
    Ok(())
}

#[test]
fn pool_idle_cap_cannot_exceed_open_cap() -> TestResult {
    let mut config = common::minimal_config().map_err(|err| err.to_string())?;
    config.store.pool_max_open = 2;
    config.store.pool_max_idle = 3;
    assert_invalid(config.validate(), "pool_max_idle")
}

#[test]
fn snapshot_attempts_must_be_positive() -> TestResult {
    let mut config = common::minimal_config().map_err(|err| err.to_string())?;
    config.snapshot.engine.max_attempts = 0;
    assert_invalid(config.validate(), "max_attempts")
}

#[test]
fn local_target_requires_path() -> TestResult {
    let mut config = common::minimal_config().map_err(|err| err.to_string())?;
    config.publish.target = PublishTargetKind::Local;
    assert_invalid(config.validate(), "publish.local_path")?;
    config.publish.local_path = Some(PathBuf::from("published/app.sqlite"));
    config.validate().map_err(|err| err.to_string())
}

#[test]
fn archive_target_builds_with_bounded_retention() -> TestResult {
    let mut config = common::config_from_toml("[publish]\ntarget = \"archive\"\narchive_keep = 3\n")
        .map_err(|err| err.to_string())?;
    config.validate().map_err(|err| err.to_string())?;
    let target = config
        .publish_target(Arc::new(SystemClock), &EventLog::noop())
        .map_err(|err| err.to_string())?;
    if target.kind() != "archive" {
        return Err(format!("unexpected target {}", target.kind()));
    }
    config.publish.archive_keep = 0;
    assert_invalid(config.validate(), "publish.archive_keep")
}

#[test]
fn default_snapshot_section_matches_engine_defaults() -> TestResult {
    let config = common::minimal_config().map_err(|err| err.to_string())?;
    if config.snapshot.engine != SnapshotConfig::default() {
        return Err(format!("snapshot defaults drifted: {:?}", config.snapshot.engine));
    }
    Ok(())
}

#[test]
fn remote_target_requires_object_store() -> TestResult {
    let mut config = common::minimal_config().map_err(|err| err.to_string())?;
    config.publish.target = PublishTargetKind::Remote;
    assert_invalid(config.validate(), "publish.object_store")
}

#[test]
fn remote_current_key_must_be_a_safe_key() -> TestResult {
    let mut config = common::config_from_toml(
        "[publish]\ntarget = \"remote\"\ncurrent_key = \"../app.sqlite\"\n\n[publish.object_store]\nprovider = \"s3\"\nbucket = \"snapshots\"\n",
    )
    .map_err(|err| err.to_string())?;
    assert_invalid(config.validate(), "publish.current_key")?;
    config.publish.current_key = "db/app.sqlite".to_string();
    config.validate().map_err(|err| err.to_string())
}

#[test]
fn plain_http_endpoint_requires_opt_in() -> TestResult {
    let config = common::config_from_toml(
        "[publish]\ntarget = \"remote\"\n\n[publish.object_store]\nprovider = \"s3\"\nbucket = \"snapshots\"\nendpoint = \"http://localhost:9000\"\n",
    )
    .map_err(|err| err.to_string())?;
    assert_invalid(config.validate(), "allow_http")
}

#[test]
fn verifier_bounds_are_enforced() -> TestResult {
    let mut config = common::minimal_config().map_err(|err| err.to_string())?;
    config.verifier.writers = 0;
    assert_invalid(config.validate(), "verifier.writers")?;
    config.verifier.writers = 65;
    assert_invalid(config.validate(), "verifier.writers")?;
    config.verifier.writers = 4;
    config.verifier.batch_size = 0;
    assert_invalid(config.validate(), "verifier.batch_size")?;
    config.verifier.batch_size = 50;
    config.verifier.interval_ms = 0;
    assert_invalid(config.validate(), "verifier.interval_ms")
}

#[test]
fn zero_periodic_interval_is_rejected() -> TestResult {
    let mut config = common::minimal_config().map_err(|err| err.to_string())?;
    config.backup.periodic_interval_ms = Some(0);
    assert_invalid(config.validate(), "backup.periodic_interval_ms")
}

#[test]
fn file_log_sink_requires_path() -> TestResult {
    let mut config = common::minimal_config().map_err(|err| err.to_string())?;
    config.logging.sink = LogSinkKind::File;
    assert_invalid(config.validate(), "logging.path")
}

#[test]
fn unknown_enum_values_fail_to_parse() -> TestResult {
    match common::config_from_toml("[publish]\ntarget = \"ftp\"\n") {
        Ok(_) => Err("expected parse failure".to_string()),
        Err(_) => Ok(()),
    }
}
