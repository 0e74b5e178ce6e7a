use crate::defaults;
use crate::engine::catalog::ModelInfo;
use crate::error::{RelayError, Result};
use crate::pipeline::types::{AudioWindow, StemBuffer, StemMap};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Trait for source-separation engines.
///
/// The pipeline treats implementations as black boxes: latency and the set
/// of returned stem names and channel counts are unspecified and may vary
/// between calls.
pub trait Separator: Send + Sync {
    /// Split one window into named stems.
    ///
    /// # Errors
    /// Returns `RelayError::EngineRuntime` on shape mismatch or internal failure.
    fn separate(&self, window: &AudioWindow) -> Result<StemMap>;

    /// Get the name of the loaded model
    fn model_name(&self) -> &str;

    /// Names of the buses this engine usually returns.
    fn bus_names(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Implement Separator for Arc<T> to allow sharing across tasks.
impl<T: Separator> Separator for Arc<T> {
    fn separate(&self, window: &AudioWindow) -> Result<StemMap> {
        (**self).separate(window)
    }

    fn model_name(&self) -> &str {
        (**self).model_name()
    }

    fn bus_names(&self) -> Vec<String> {
        (**self).bus_names()
    }
}

/// A configured engine, shared by a connection and its queued windows.
pub type EngineHandle = Arc<dyn Separator>;

/// Options carried by a `configure` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineOptions {
    /// Requested model identifier; `None` selects the server default.
    pub model: Option<String>,
    /// Prefer low latency over quality.
    pub real_time: bool,
    /// Engine-specific separation strength in [0, 1].
    pub aggressiveness: f32,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            model: None,
            real_time: true,
            aggressiveness: defaults::AGGRESSIVENESS,
        }
    }
}

impl EngineOptions {
    /// Options requesting a specific model.
    pub fn for_model(model: &str) -> Self {
        Self {
            model: Some(model.to_string()),
            ..Default::default()
        }
    }

    /// Aggressiveness clamped to [0, 1]; non-finite values fall back to the default.
    pub fn clamped_aggressiveness(&self) -> f32 {
        if self.aggressiveness.is_finite() {
            self.aggressiveness.clamp(0.0, 1.0)
        } else {
            defaults::AGGRESSIVENESS
        }
    }
}

/// Creates engine handles from `configure` requests.
#[async_trait::async_trait]
pub trait EngineFactory: Send + Sync {
    /// Load or build an engine for the given options.
    ///
    /// # Errors
    /// Returns `RelayError::EngineConfig` if the model is unknown or cannot be loaded.
    async fn configure(&self, options: &EngineOptions) -> Result<EngineHandle>;

    /// Models this factory can load.
    fn models(&self) -> Vec<ModelInfo>;
}

/// Validates a window's shape before an engine touches it.
pub fn check_window_shape(window: &AudioWindow) -> Result<()> {
    if window.channels == 0 {
        return Err(RelayError::engine_runtime("window has zero channels"));
    }
    if window.samples.len() % window.channels as usize != 0 {
        return Err(RelayError::engine_runtime(format!(
            "window of {} samples does not divide into {} channels",
            window.samples.len(),
            window.channels
        )));
    }
    Ok(())
}

/// Mock separator for testing
#[derive(Debug, Clone)]
pub struct MockSeparator {
    model_name: String,
    stems: Vec<String>,
    should_fail: bool,
    delay: Option<Duration>,
}

impl MockSeparator {
    /// Create a mock that echoes the window as a single "vocals" bus
    pub fn new(model_name: &str) -> Self {
        Self {
            model_name: model_name.to_string(),
            stems: vec!["vocals".to_string()],
            should_fail: false,
            delay: None,
        }
    }

    /// Configure the stems returned; each is a copy of the input window
    pub fn with_stems(mut self, stems: &[&str]) -> Self {
        self.stems = stems.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Configure the mock to fail on separate
    pub fn with_failure(mut self) -> Self {
        self.should_fail = true;
        self
    }

    /// Sleep this long inside every call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

impl Separator for MockSeparator {
    fn separate(&self, window: &AudioWindow) -> Result<StemMap> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if self.should_fail {
            return Err(RelayError::engine_runtime("mock separation failure"));
        }
        check_window_shape(window)?;

        Ok(self
            .stems
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    StemBuffer::interleaved(window.samples.clone(), window.channels as usize),
                )
            })
            .collect())
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn bus_names(&self) -> Vec<String> {
        self.stems.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window() -> AudioWindow {
        AudioWindow::new(vec![0.5, -0.5, 0.25, -0.25], 2, 1000, 3.0, 0)
    }

    #[test]
    fn test_mock_separator_returns_configured_stems() {
        let separator = MockSeparator::new("mock").with_stems(&["low", "high"]);
        let stems = separator.separate(&window()).unwrap();

        let names: Vec<&str> = stems.keys().map(|k| k.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);
        assert_eq!(stems["low"].channels, 2);
        assert_eq!(stems["low"].samples, window().samples);
    }

    #[test]
    fn test_mock_separator_failure() {
        let separator = MockSeparator::new("mock").with_failure();
        match separator.separate(&window()) {
            Err(RelayError::EngineRuntime { message }) => {
                assert_eq!(message, "mock separation failure");
            }
            other => panic!("Expected EngineRuntime error, got {:?}", other),
        }
    }

    #[test]
    fn test_mock_separator_rejects_bad_shape() {
        let separator = MockSeparator::new("mock");
        let bad = AudioWindow::new(vec![0.0; 3], 2, 1000, 0.0, 0);
        assert!(separator.separate(&bad).is_err());
    }

    #[test]
    fn test_separator_trait_is_object_safe() {
        let handle: EngineHandle = Arc::new(MockSeparator::new("boxed"));
        assert_eq!(handle.model_name(), "boxed");
        assert_eq!(handle.bus_names(), vec!["vocals".to_string()]);
        assert!(handle.separate(&window()).is_ok());
    }

    #[test]
    fn test_engine_options_defaults() {
        let options = EngineOptions::default();
        assert_eq!(options.model, None);
        assert!(options.real_time);
        assert_eq!(options.aggressiveness, 0.1);
    }

    #[test]
    fn test_engine_options_camel_case_json() {
        let options: EngineOptions =
            serde_json::from_str(r#"{"model":"band-split","realTime":false}"#).unwrap();
        assert_eq!(options.model.as_deref(), Some("band-split"));
        assert!(!options.real_time);
        assert_eq!(options.aggressiveness, 0.1);
    }

    #[test]
    fn test_clamped_aggressiveness() {
        let mut options = EngineOptions::default();
        options.aggressiveness = 3.0;
        assert_eq!(options.clamped_aggressiveness(), 1.0);
        options.aggressiveness = -1.0;
        assert_eq!(options.clamped_aggressiveness(), 0.0);
        options.aggressiveness = f32::NAN;
        assert_eq!(options.clamped_aggressiveness(), 0.1);
    }
}
