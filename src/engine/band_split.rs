//! Three-band crossover engine.
//!
//! Splits every channel with one-pole low-pass filters at 250 Hz and 4 kHz
//! into `low`, `mid` and `high` buses whose sum reconstructs the input.
//! Filter state carries over between windows of the same handle so window
//! boundaries do not click; it resets when the stream format changes.

use crate::engine::separator::{Separator, check_window_shape};
use crate::error::{RelayError, Result};
use crate::pipeline::types::{AudioWindow, StemBuffer, StemMap};
use std::f32::consts::PI;
use std::sync::Mutex;

const LOW_CROSSOVER_HZ: f32 = 250.0;
const HIGH_CROSSOVER_HZ: f32 = 4000.0;

#[derive(Debug, Default)]
struct FilterState {
    sample_rate: u32,
    channels: usize,
    low: Vec<f32>,
    high: Vec<f32>,
}

impl FilterState {
    fn prepare(&mut self, sample_rate: u32, channels: usize) {
        if self.sample_rate != sample_rate || self.channels != channels {
            self.sample_rate = sample_rate;
            self.channels = channels;
            self.low = vec![0.0; channels];
            self.high = vec![0.0; channels];
        }
    }
}

pub struct BandSplitSeparator {
    model_name: String,
    state: Mutex<FilterState>,
}

impl BandSplitSeparator {
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            state: Mutex::new(FilterState::default()),
        }
    }
}

/// One-pole smoothing coefficient for a cutoff frequency.
fn coefficient(cutoff_hz: f32, sample_rate: u32) -> f32 {
    let cutoff = cutoff_hz.min(sample_rate as f32 * 0.45);
    1.0 - (-2.0 * PI * cutoff / sample_rate as f32).exp()
}

impl Separator for BandSplitSeparator {
    fn separate(&self, window: &AudioWindow) -> Result<StemMap> {
        check_window_shape(window)?;
        let channels = window.channels as usize;
        let low_alpha = coefficient(LOW_CROSSOVER_HZ, window.sample_rate);
        let high_alpha = coefficient(HIGH_CROSSOVER_HZ, window.sample_rate);

        let mut state = self
            .state
            .lock()
            .map_err(|_| RelayError::engine_runtime("band-split filter state poisoned"))?;
        state.prepare(window.sample_rate, channels);

        let len = window.samples.len();
        let mut low = Vec::with_capacity(len);
        let mut mid = Vec::with_capacity(len);
        let mut high = Vec::with_capacity(len);

        for frame in window.frames() {
            for (ch, &x) in frame.iter().enumerate() {
                state.low[ch] += low_alpha * (x - state.low[ch]);
                state.high[ch] += high_alpha * (x - state.high[ch]);
                let lp_low = state.low[ch];
                let lp_high = state.high[ch];
                low.push(lp_low);
                mid.push(lp_high - lp_low);
                high.push(x - lp_high);
            }
        }

        let mut stems = StemMap::new();
        stems.insert("low".to_string(), StemBuffer::interleaved(low, channels));
        stems.insert("mid".to_string(), StemBuffer::interleaved(mid, channels));
        stems.insert("high".to_string(), StemBuffer::interleaved(high, channels));
        Ok(stems)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn bus_names(&self) -> Vec<String> {
        vec!["low".to_string(), "mid".to_string(), "high".to_string()]
    }
}
