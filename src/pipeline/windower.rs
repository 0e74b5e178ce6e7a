//! Sample windower for a single connection.
//!
//! Accumulates interleaved PCM from `audio_data` messages of any size and
//! slices it into fixed-length windows for the separation engine:
//! - Fragmentation across messages is transparent
//! - The remainder after the last full window is kept for the next message
//! - A rejected payload leaves the buffer untouched
//! - The buffer never holds a full window after `ingest` returns, and the
//!   window size is bounded by the accepted sample rate and channel range

use crate::error::{RelayError, Result};
use crate::pipeline::types::AudioWindow;

/// Configuration for the windower.
#[derive(Debug, Clone)]
pub struct WindowerConfig {
    /// Window length in milliseconds.
    pub window_ms: u32,
    /// Largest accepted payload in samples (all channels).
    pub max_payload_samples: usize,
    /// Highest accepted sample rate in Hz.
    pub max_sample_rate: u32,
    /// Highest accepted channel count.
    pub max_channels: u16,
}

impl Default for WindowerConfig {
    fn default() -> Self {
        Self {
            window_ms: crate::defaults::WINDOW_MS,
            max_payload_samples: crate::defaults::MAX_PAYLOAD_SAMPLES,
            max_sample_rate: crate::defaults::MAX_SAMPLE_RATE,
            max_channels: crate::defaults::MAX_CHANNELS,
        }
    }
}

/// Format of the audio currently held in the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StreamFormat {
    sample_rate: u32,
    channels: u16,
}

/// Accumulates interleaved samples and emits fixed-size windows.
pub struct SampleWindower {
    config: WindowerConfig,
    /// Interleaved remainder, always a whole number of frames.
    buffer: Vec<f32>,
    /// Format of `buffer`; `None` before the first payload.
    format: Option<StreamFormat>,
    /// Sequence number of the next window.
    next_sequence: u64,
}

impl SampleWindower {
    /// Creates a new windower with default configuration.
    pub fn new() -> Self {
        Self::with_config(WindowerConfig::default())
    }

    /// Creates a new windower with custom configuration.
    pub fn with_config(config: WindowerConfig) -> Self {
        Self {
            config,
            buffer: Vec::new(),
            format: None,
            next_sequence: 0,
        }
    }

    /// Frames per window at the given sample rate (at least one).
    pub fn window_frames(&self, sample_rate: u32) -> usize {
        let frames = (sample_rate as u64 * self.config.window_ms as u64 + 500) / 1000;
        frames.max(1) as usize
    }

    /// Samples per window (all channels) for the given format.
    pub fn window_target_samples(&self, sample_rate: u32, channels: u16) -> usize {
        self.window_frames(sample_rate) * channels as usize
    }

    /// Number of buffered samples (all channels).
    pub fn buffered_samples(&self) -> usize {
        self.buffer.len()
    }

    /// Number of buffered frames.
    pub fn buffered_frames(&self) -> usize {
        match self.format {
            Some(format) => self.buffer.len() / format.channels as usize,
            None => 0,
        }
    }

    /// Appends a payload and returns every window it completes.
    ///
    /// # Errors
    /// Returns `RelayError::MalformedAudio` if the payload is not a whole
    /// number of frames, contains non-finite samples, exceeds the payload
    /// limit, or declares a sample rate or channel count outside
    /// `1..=max_sample_rate` / `1..=max_channels`. The buffer is left
    /// unmodified on error.
    pub fn ingest(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        channels: u16,
        timestamp: f64,
    ) -> Result<Vec<AudioWindow>> {
        self.validate(samples, sample_rate, channels)?;

        let format = StreamFormat {
            sample_rate,
            channels,
        };
        if self.format.is_some_and(|current| current != format) {
            if !self.buffer.is_empty() {
                log::debug!(
                    "Audio format changed to {} Hz x {}, discarding {} buffered samples",
                    sample_rate,
                    channels,
                    self.buffer.len()
                );
            }
            self.buffer.clear();
        }
        self.format = Some(format);

        self.buffer.extend_from_slice(samples);

        let target = self.window_target_samples(sample_rate, channels);
        let mut windows = Vec::with_capacity(self.buffer.len() / target);
        let mut offset = 0;
        while self.buffer.len() - offset >= target {
            let window_samples = self.buffer[offset..offset + target].to_vec();
            offset += target;
            windows.push(AudioWindow::new(
                window_samples,
                channels,
                sample_rate,
                timestamp,
                self.next_sequence,
            ));
            self.next_sequence += 1;
        }
        if offset > 0 {
            self.buffer.drain(..offset);
        }

        Ok(windows)
    }

    /// Drops any buffered remainder.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.format = None;
    }

    fn validate(&self, samples: &[f32], sample_rate: u32, channels: u16) -> Result<()> {
        if channels == 0 {
            return Err(RelayError::malformed_audio("channel count must be positive"));
        }
        if sample_rate == 0 {
            return Err(RelayError::malformed_audio("sample rate must be positive"));
        }
        if channels > self.config.max_channels {
            return Err(RelayError::malformed_audio(format!(
                "{} channels exceeds the limit of {}",
                channels, self.config.max_channels
            )));
        }
        if sample_rate > self.config.max_sample_rate {
            return Err(RelayError::malformed_audio(format!(
                "sample rate {} Hz exceeds the limit of {} Hz",
                sample_rate, self.config.max_sample_rate
            )));
        }
        if samples.len() > self.config.max_payload_samples {
            return Err(RelayError::malformed_audio(format!(
                "payload of {} samples exceeds the limit of {}",
                samples.len(),
                self.config.max_payload_samples
            )));
        }
        if samples.len() % channels as usize != 0 {
            return Err(RelayError::malformed_audio(format!(
                "{} samples is not a multiple of {} channels",
                samples.len(),
                channels
            )));
        }
        if let Some(index) = samples.iter().position(|s| !s.is_finite()) {
            return Err(RelayError::malformed_audio(format!(
                "non-finite sample at index {}",
                index
            )));
        }
        Ok(())
    }
}

impl Default for SampleWindower {
    fn default() -> Self {
        Self::new()
    }
}
