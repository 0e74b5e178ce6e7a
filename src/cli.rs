//! Command-line interface for stemrelay
//!
//! Provides argument parsing using clap derive macros.

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;
use std::time::Duration;

/// Real-time stem separation relay over WebSocket
#[derive(Parser, Debug)]
#[command(
    name = "stemrelay",
    version,
    about = "Real-time stem separation relay over WebSocket"
)]
pub struct Cli {
    /// Subcommand to execute (default: serve)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only log errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose output (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server
    Serve {
        /// Bind address (default: 127.0.0.1)
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// Listen port (default: 8765)
        #[arg(long, short = 'p', value_name = "PORT")]
        port: Option<u16>,

        /// Model used when a client does not name one
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,

        /// Inference window length. Examples: 100ms, 0.5s, 1s
        #[arg(long, short = 'w', value_name = "DURATION", value_parser = parse_duration)]
        window: Option<Duration>,
    },

    /// Separate a WAV file through a running server
    Separate {
        /// Input WAV file
        #[arg(long, short = 'i', value_name = "WAV")]
        input: PathBuf,

        /// Directory receiving one WAV file per stem
        #[arg(long, short = 'o', value_name = "DIR")]
        output_dir: PathBuf,

        /// Server URL (default: ws://<server.host>:<server.port>)
        #[arg(long, value_name = "URL")]
        url: Option<String>,

        /// Separation model
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,

        /// Audio sent per message
        #[arg(long, short = 'c', value_name = "DURATION", default_value = "250ms", value_parser = parse_duration)]
        chunk: Duration,
    },

    /// List available separation models
    Models,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

/// Configuration actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Print the effective configuration as TOML
    Dump,
    /// Print the default configuration file path
    Path,
}

/// Parse a duration string.
///
/// Supports any format accepted by `humantime` (`100ms`, `2s`, `1m30s`);
/// a bare number is taken as milliseconds.
fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    // Bare number → milliseconds
    let duration = match s.parse::<u64>() {
        Ok(ms) => Duration::from_millis(ms),
        Err(_) => humantime::parse_duration(s).map_err(|e| e.to_string())?,
    };
    if duration.is_zero() {
        return Err("duration must be greater than zero".to_string());
    }
    Ok(duration)
}
