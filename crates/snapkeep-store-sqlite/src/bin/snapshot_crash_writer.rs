// crates/snapkeep-store-sqlite/src/bin/snapshot_crash_writer.rs
// ============================================================================
// Binary: Snapshot Crash Writer
// Description: Simulates a crash after a clone but before its install rename.
// Purpose: Support tests asserting the destination is never left torn.
// Dependencies: snapkeep-core, snapkeep-store-sqlite
// ============================================================================

//! ## Overview
//! Snapshot crash writer for crash-safety tests.

use std::env;
use std::io::Write;
use std::path::PathBuf;

use snapkeep_core::Deadline;
use snapkeep_core::EventLog;
use snapkeep_store_sqlite::SnapshotConfig;
use snapkeep_store_sqlite::SnapshotEngine;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = env::args().skip(1);
    let source = args.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing source path")
    })?;
    let dest = args.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing destination path")
    })?;

    let engine = SnapshotEngine::new(SnapshotConfig::default(), &EventLog::noop());
    let staged =
        engine.stage(&Deadline::none(), &PathBuf::from(source), &PathBuf::from(dest))?;
    let mut stdout = std::io::stdout();
    writeln!(stdout, "{}", staged.staging_path().display())?;
    stdout.flush()?;
    std::process::abort();
}
