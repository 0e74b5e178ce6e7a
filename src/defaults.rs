//! Default configuration constants for stemrelay.
//!
//! Shared between the config file schema, the CLI and the wire protocol so
//! the same fallback values apply everywhere.

/// Default bind address for the relay server.
pub const HOST: &str = "127.0.0.1";

/// Default WebSocket port.
pub const PORT: u16 = 8765;

/// Outbound messages buffered per connection before the drain loop waits.
pub const OUTBOUND_BUFFER: usize = 256;

/// Default inference window length in milliseconds.
///
/// 100ms keeps end-to-end latency well under a second while giving the
/// engine enough context per call.
pub const WINDOW_MS: u32 = 100;

/// Longest accepted window, in milliseconds.
pub const MAX_WINDOW_MS: u32 = 60_000;

/// Maximum windows queued per connection before new windows are dropped.
pub const MAX_QUEUED_WINDOWS: usize = 32;

/// Largest accepted `audio_data` payload, in samples (all channels).
pub const MAX_PAYLOAD_SAMPLES: usize = 1 << 20;

/// Highest sample rate a client may declare.
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Highest channel count a client may declare.
pub const MAX_CHANNELS: u16 = 32;

/// Sample rate assumed when an `audio_data` message omits it.
pub const SAMPLE_RATE: u32 = 44100;

/// Channel count assumed when an `audio_data` message omits it.
pub const CHANNELS: u16 = 2;

/// Default separation model.
pub const DEFAULT_MODEL: &str = "center-extract";

/// Size of the blocking worker pool shared by all connections.
pub const WORKERS: usize = 2;

/// Default engine aggressiveness when `configure` omits it.
pub const AGGRESSIVENESS: f32 = 0.1;

/// Peaks at or below this are treated as silence and never divided by.
pub const SILENCE_PEAK: f32 = 1e-5;

/// Scale applied to a stem before subtracting it from the mix.
pub const DERIVATION_SCALE: f32 = 0.8;

/// Headroom applied after normalizing a derived stem.
pub const DERIVED_HEADROOM: f32 = 0.9;

/// Scales of the synthetic four-stem copies of `instrumental`.
pub const BASS_SCALE: f32 = 0.7;
pub const DRUMS_SCALE: f32 = 0.8;
pub const OTHER_SCALE: f32 = 0.9;
