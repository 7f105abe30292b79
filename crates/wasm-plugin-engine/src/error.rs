//! Error kinds for the plugin engine.
//!
//! The `load`/`start` surface is resilient: per-plugin failures are logged
//! and the batch continues, so `Archive` and `Manifest` errors mostly show
//! up in logs rather than return values. `Dispatch` errors propagate to the
//! caller of `call_hook`. Hooks waiting for an anchor that has not arrived
//! yet are not an error at all — they stay queued silently.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the plugin engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The extraction directory could not be created. Fatal at construction.
    #[error("failed to create extraction directory {path:?}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A single plugin archive failed to extract.
    #[error("failed to extract plugin archive {path:?}: {message}")]
    Archive { path: PathBuf, message: String },

    /// A plugin manifest failed to parse or validate.
    #[error("invalid plugin manifest ({origin}): {message}")]
    Manifest { origin: String, message: String },

    /// Sandbox construction failed. The plugin stays registered and
    /// uninstantiated; the next dispatch retries.
    #[error("failed to instantiate plugin {plugin}: {message}")]
    Instantiation { plugin: String, message: String },

    /// A guest function call failed.
    #[error("hook dispatch to guest function {func:?} failed: {message}")]
    Dispatch { func: String, message: String },

    /// `call_hook` targeted an id with no entry in the callable index.
    /// Non-fatal at the host-function boundary, where it maps to an empty
    /// response.
    #[error("no callable hook registered for id {0:?}")]
    UnknownHook(String),

    /// The engine's cancellation token fired.
    #[error("engine has been cancelled")]
    Cancelled,

    /// A blocking engine task panicked.
    #[error("engine task panicked: {0}")]
    Panicked(String),
}
