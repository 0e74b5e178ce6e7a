//! stemrelay - Real-time stem separation relay
//!
//! Browser clients stream interleaved PCM over a WebSocket; the relay cuts
//! it into fixed windows, separates each window with a pluggable engine and
//! streams normalized mono stems back.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

#[cfg(feature = "cli")]
pub mod cli;
pub mod client;
pub mod config;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod server;

// Engine seam
pub use engine::{BuiltinEngineFactory, EngineFactory, EngineHandle, EngineOptions, Separator};

// Pipeline
pub use pipeline::{AudioWindow, ProcessingScheduler, SampleWindower, StemPostProcessor};

// Server
pub use server::{RelayServer, ShutdownHandle};

// Error handling
pub use error::{RelayError, Result};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
