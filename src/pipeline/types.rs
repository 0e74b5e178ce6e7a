//! Data types flowing through the separation pipeline.

use std::collections::BTreeMap;

/// A fixed-size slice of interleaved audio handed to the engine as one unit.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioWindow {
    /// Interleaved samples, frame-major (frame outer, channel inner).
    pub samples: Vec<f32>,
    /// Number of interleaved channels.
    pub channels: u16,
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Client timestamp of the message that completed this window.
    pub timestamp: f64,
    /// Per-connection window counter, starting at 0.
    pub sequence: u64,
}

impl AudioWindow {
    /// Creates a new audio window.
    pub fn new(
        samples: Vec<f32>,
        channels: u16,
        sample_rate: u32,
        timestamp: f64,
        sequence: u64,
    ) -> Self {
        Self {
            samples,
            channels,
            sample_rate,
            timestamp,
            sequence,
        }
    }

    /// Iterates frames, each a slice of `channels` samples.
    pub fn frames(&self) -> std::slice::ChunksExact<'_, f32> {
        self.samples.chunks_exact(self.channels.max(1) as usize)
    }

    /// Averages all channels into a mono signal.
    pub fn downmix(&self) -> Vec<f32> {
        downmix_interleaved(&self.samples, self.channels as usize)
    }
}

/// Raw engine output for one stem: interleaved samples plus channel count.
#[derive(Debug, Clone, PartialEq)]
pub struct StemBuffer {
    pub samples: Vec<f32>,
    pub channels: usize,
}

impl StemBuffer {
    /// A single-channel buffer.
    pub fn mono(samples: Vec<f32>) -> Self {
        Self {
            samples,
            channels: 1,
        }
    }

    /// An interleaved multi-channel buffer.
    pub fn interleaved(samples: Vec<f32>, channels: usize) -> Self {
        Self { samples, channels }
    }

    /// Converts to mono by averaging channels; mono buffers pass through.
    pub fn into_mono(self) -> Vec<f32> {
        if self.channels <= 1 {
            self.samples
        } else {
            downmix_interleaved(&self.samples, self.channels)
        }
    }
}

/// Engine output keyed by stem name.
pub type StemMap = BTreeMap<String, StemBuffer>;

/// One normalized mono stem ready to be sent to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct StemResult {
    pub name: String,
    pub samples: Vec<f32>,
    pub timestamp: f64,
}

impl StemResult {
    /// Creates a new stem result.
    pub fn new(name: impl Into<String>, samples: Vec<f32>, timestamp: f64) -> Self {
        Self {
            name: name.into(),
            samples,
            timestamp,
        }
    }
}

fn downmix_interleaved(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let scale = 1.0 / channels as f32;
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}
