//! Stem post-processing between the engine and the wire.
//!
//! Engines return any number of buses with any channel count. The client
//! protocol promises mono, peak-normalized stems and always carries at least
//! `vocals` and `instrumental`:
//!
//! 1. Every bus is downmixed to mono and non-finite samples are zeroed.
//! 2. Missing `vocals` / `instrumental` are derived from the mix:
//!    - vocals-like bus present: `instrumental = mix − vocals × 0.8`
//!    - component buses only: `instrumental = Σ buses`, then
//!      `vocals = mix − instrumental × 0.8`
//!    - nothing returned: both are silence of the mix's length
//! 3. Optionally `bass`, `drums` and `other` are added as scaled copies of
//!    `instrumental` (0.7 / 0.8 / 0.9). These are an approximation for
//!    four-stem clients talking to a two-bus engine, not acoustic
//!    separation, and after the final normalization they carry the same
//!    waveform as `instrumental`.
//! 4. Every emitted stem is peak-normalized to 1.0; silence is left as is.

use crate::defaults::{
    BASS_SCALE, DERIVATION_SCALE, DERIVED_HEADROOM, DRUMS_SCALE, OTHER_SCALE, SILENCE_PEAK,
};
use crate::pipeline::types::{AudioWindow, StemMap, StemResult};

pub const VOCALS: &str = "vocals";
pub const INSTRUMENTAL: &str = "instrumental";

/// Synthetic four-stem names and their scale relative to instrumental.
const SYNTHETIC_STEMS: &[(&str, f32)] = &[
    ("bass", BASS_SCALE),
    ("drums", DRUMS_SCALE),
    ("other", OTHER_SCALE),
];

/// Configuration for the post-processor.
#[derive(Debug, Clone)]
pub struct PostProcessorConfig {
    /// Add bass/drums/other as scaled copies of instrumental when missing.
    pub synthesize_stems: bool,
}

impl Default for PostProcessorConfig {
    fn default() -> Self {
        Self {
            synthesize_stems: true,
        }
    }
}

/// Turns raw engine output into client-safe mono stems.
#[derive(Debug, Clone, Default)]
pub struct StemPostProcessor {
    config: PostProcessorConfig,
}

impl StemPostProcessor {
    pub fn new(config: PostProcessorConfig) -> Self {
        Self { config }
    }

    /// Process one window's engine output.
    ///
    /// Output order is deterministic: `vocals`, `instrumental`, remaining
    /// engine buses by name, then synthetic stems.
    pub fn process(&self, raw: StemMap, mix: &AudioWindow) -> Vec<StemResult> {
        let mix_mono = mix.downmix();

        let mut buses: Vec<(String, Vec<f32>)> = raw
            .into_iter()
            .map(|(name, buffer)| {
                let mut mono = buffer.into_mono();
                sanitize(&mut mono);
                (name, mono)
            })
            .collect();

        let instrumental_bus = take_bus(&mut buses, |name| name == INSTRUMENTAL);
        let vocals_bus = take_bus(&mut buses, is_vocals_like);

        let (vocals, instrumental) = match (vocals_bus, instrumental_bus) {
            (Some(vocals), Some(instrumental)) => (vocals, instrumental),
            (Some(vocals), None) => {
                let mut instrumental = subtract_scaled(&mix_mono, &vocals, DERIVATION_SCALE);
                normalize_with_headroom(&mut instrumental);
                (vocals, instrumental)
            }
            (None, instrumental) => {
                let instrumental = instrumental.or_else(|| {
                    let mut summed = sum_buses(&buses)?;
                    normalize_with_headroom(&mut summed);
                    Some(summed)
                });
                match instrumental {
                    Some(instrumental) => {
                        let mut vocals =
                            subtract_scaled(&mix_mono, &instrumental, DERIVATION_SCALE);
                        normalize_with_headroom(&mut vocals);
                        (vocals, instrumental)
                    }
                    None => {
                        log::debug!("Engine returned no stems, emitting silence");
                        (vec![0.0; mix_mono.len()], vec![0.0; mix_mono.len()])
                    }
                }
            }
        };

        let mut stems: Vec<(String, Vec<f32>)> = Vec::with_capacity(buses.len() + 5);
        if self.config.synthesize_stems {
            for (name, scale) in SYNTHETIC_STEMS {
                if !buses.iter().any(|(bus, _)| bus == name) {
                    let copy = instrumental.iter().map(|s| s * scale).collect();
                    buses.push((name.to_string(), copy));
                }
            }
        }
        stems.push((VOCALS.to_string(), vocals));
        stems.push((INSTRUMENTAL.to_string(), instrumental));
        stems.extend(buses);

        stems
            .into_iter()
            .map(|(name, mut samples)| {
                peak_normalize(&mut samples);
                StemResult::new(name, samples, mix.timestamp)
            })
            .collect()
    }
}

/// Whether a bus name denotes a vocal stem (case-insensitive).
pub fn is_vocals_like(name: &str) -> bool {
    name.to_lowercase().contains("vocal")
}

/// Maximum absolute sample value.
pub fn peak(samples: &[f32]) -> f32 {
    samples.iter().fold(0.0f32, |acc, s| acc.max(s.abs()))
}

/// Scale so the peak is exactly 1.0; buffers at or below the silence
/// threshold are left unchanged. Returns the original peak.
pub fn peak_normalize(samples: &mut [f32]) -> f32 {
    let max = peak(samples);
    if max > SILENCE_PEAK {
        for s in samples.iter_mut() {
            *s /= max;
        }
    }
    max
}

fn normalize_with_headroom(samples: &mut [f32]) {
    let max = peak(samples);
    if max > SILENCE_PEAK {
        let gain = DERIVED_HEADROOM / max;
        for s in samples.iter_mut() {
            *s *= gain;
        }
    }
}

fn sanitize(samples: &mut [f32]) {
    for s in samples.iter_mut() {
        if !s.is_finite() {
            *s = 0.0;
        }
    }
}

/// `a − b × scale` over the shorter of the two.
fn subtract_scaled(a: &[f32], b: &[f32], scale: f32) -> Vec<f32> {
    a.iter().zip(b).map(|(x, y)| x - y * scale).collect()
}

/// Sample-wise sum over the shortest bus; `None` when there are no buses.
fn sum_buses(buses: &[(String, Vec<f32>)]) -> Option<Vec<f32>> {
    let len = buses.iter().map(|(_, s)| s.len()).min()?;
    let mut sum = vec![0.0f32; len];
    for (_, samples) in buses {
        for (acc, s) in sum.iter_mut().zip(samples) {
            *acc += s;
        }
    }
    Some(sum)
}

fn take_bus(
    buses: &mut Vec<(String, Vec<f32>)>,
    matches: impl Fn(&str) -> bool,
) -> Option<Vec<f32>> {
    let index = buses.iter().position(|(name, _)| matches(name))?;
    Some(buses.remove(index).1)
}
