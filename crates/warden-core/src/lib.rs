//! Core types and error definitions for the Warden runtime.
//!
//! This crate provides the foundational pieces shared across all Warden crates:
//! the unified error taxonomy and the clock abstraction every time-dependent
//! component reads from.
//!
//! # Main types
//!
//! - [`WardenError`] — Unified error enum for all Warden subsystems.
//! - [`WardenResult`] — Convenience alias for `Result<T, WardenError>`.
//! - [`Clock`] — Source of monotonic time, injectable for tests.
//! - [`SystemClock`] — Production clock backed by [`std::time::Instant`].
//! - [`ManualClock`] — Test clock that only moves when advanced.

/// Injectable monotonic time sources.
pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};

use std::time::Duration;

// --- Error types ---

/// Top-level error type for the Warden runtime.
///
/// Each variant corresponds to a class of failure the runtime can report.
#[derive(Debug, thiserror::Error)]
pub enum WardenError {
    /// Invalid or unreadable configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A workflow referenced a worker that was never registered.
    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    /// A workflow referenced an action the worker does not expose.
    #[error("Worker '{worker}' has no action '{action}'")]
    UnknownAction {
        /// Worker name.
        worker: String,
        /// Requested action name.
        action: String,
    },

    /// A worker with the same name is already registered.
    #[error("Worker already registered: {0}")]
    DuplicateWorker(String),

    /// The submitted workflow is malformed (duplicate ids, self-dependencies, ...).
    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(String),

    /// A worker action returned an error.
    #[error("Worker error: {0}")]
    Worker(String),

    /// The worker's circuit is open; the call was rejected without invoking it.
    #[error("Circuit open for worker '{worker}', retry in {remaining:?}")]
    CircuitOpen {
        /// Worker name.
        worker: String,
        /// Time left before the circuit admits a recovery probe.
        remaining: Duration,
    },

    /// An error from the orchestration engine itself.
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML parse error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WardenError {
    /// Creates a [`WardenError::Worker`] from any displayable error.
    pub fn worker(err: impl std::fmt::Display) -> Self {
        Self::Worker(err.to_string())
    }

    /// Returns `true` when the error was produced by circuit gating rather
    /// than by the worker itself.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// A convenience `Result` alias using [`WardenError`].
pub type WardenResult<T> = Result<T, WardenError>;
