// crates/snapkeep-config/src/lib.rs
// ============================================================================
// Module: Snapkeep Config Library
// Description: Canonical config model, validation, and component builders.
// Purpose: Single source of truth for snapkeep.toml semantics.
// Dependencies: snapkeep-core, snapkeep-publish, snapkeep-store-sqlite, serde, toml
// ============================================================================

//! ## Overview
//! `snapkeep-config` defines the `snapkeep.toml` model. It validates
//! fail-closed and builds the event log and publish target that the
//! verifier and the production lifecycle share.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod config;

// ============================================================================
// SECTION: Re-Exports
// ============================================================================

pub use config::*;
