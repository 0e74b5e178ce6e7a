//! Center-channel extraction engine.
//!
//! Lead vocals are usually panned to the center, so a frame whose energy
//! sits in the mid (L+R) component rather than the side (L−R) component is
//! kept as "vocals". The mask is soft: `mid² / (mid² + w·side²)`, where the
//! side weight `w` grows with `aggressiveness`. Mono input has no side
//! component and passes through unchanged.

use crate::engine::separator::{EngineOptions, Separator, check_window_shape};
use crate::error::Result;
use crate::pipeline::types::{AudioWindow, StemBuffer, StemMap};

const MIN_SIDE_WEIGHT: f32 = 0.5;
const MAX_SIDE_WEIGHT: f32 = 10.0;
const EPSILON: f32 = 1e-12;

/// Mask smoothing when latency is not a concern.
const OFFLINE_SMOOTHING: f32 = 0.9;

pub struct CenterExtractSeparator {
    model_name: String,
    side_weight: f32,
    smoothing: f32,
}

impl CenterExtractSeparator {
    pub fn new(model_name: &str, options: &EngineOptions) -> Self {
        let aggressiveness = options.clamped_aggressiveness();
        Self {
            model_name: model_name.to_string(),
            side_weight: MIN_SIDE_WEIGHT + (MAX_SIDE_WEIGHT - MIN_SIDE_WEIGHT) * aggressiveness,
            smoothing: if options.real_time {
                0.0
            } else {
                OFFLINE_SMOOTHING
            },
        }
    }

    fn mask(&self, left: f32, right: f32) -> f32 {
        let mid = 0.5 * (left + right);
        let side = 0.5 * (left - right);
        let mid_energy = mid * mid;
        let side_energy = side * side;
        if mid_energy + side_energy <= EPSILON {
            return 0.0;
        }
        mid_energy / (mid_energy + self.side_weight * side_energy + EPSILON)
    }
}

impl Separator for CenterExtractSeparator {
    fn separate(&self, window: &AudioWindow) -> Result<StemMap> {
        check_window_shape(window)?;
        let channels = window.channels as usize;

        let vocals = if channels == 1 {
            window.samples.clone()
        } else {
            let mut out = Vec::with_capacity(window.samples.len());
            let mut smoothed: Option<f32> = None;
            for frame in window.frames() {
                let raw = self.mask(frame[0], frame[1]);
                let mask = match smoothed {
                    Some(prev) => self.smoothing * prev + (1.0 - self.smoothing) * raw,
                    None => raw,
                };
                smoothed = Some(mask);
                out.extend(frame.iter().map(|s| s * mask));
            }
            out
        };

        let mut stems = StemMap::new();
        stems.insert(
            "vocals".to_string(),
            StemBuffer::interleaved(vocals, channels),
        );
        Ok(stems)
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn bus_names(&self) -> Vec<String> {
        vec!["vocals".to_string()]
    }
}
