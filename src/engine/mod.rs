//! Separation engine adapter.
//!
//! The pipeline only talks to engines through [`Separator`] and
//! [`EngineFactory`]. Model identifiers are resolved through the catalog to
//! a closed [`EngineKind`] once, when a connection is configured.

pub mod band_split;
pub mod catalog;
pub mod center_extract;
pub mod separator;

pub use catalog::{EngineKind, ModelInfo};
pub use separator::{EngineFactory, EngineHandle, EngineOptions, MockSeparator, Separator};

use crate::error::{RelayError, Result};
use band_split::BandSplitSeparator;
use center_extract::CenterExtractSeparator;
use std::sync::Arc;

/// Factory for the engines compiled into this crate.
#[derive(Debug, Clone)]
pub struct BuiltinEngineFactory {
    default_model: String,
}

impl BuiltinEngineFactory {
    /// Create a factory that falls back to `default_model` when a
    /// `configure` request names none.
    pub fn new(default_model: &str) -> Self {
        Self {
            default_model: default_model.to_string(),
        }
    }

    /// Build an engine synchronously.
    pub fn build(&self, options: &EngineOptions) -> Result<EngineHandle> {
        let requested = options
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.default_model);

        let model = catalog::resolve_name(requested).ok_or_else(|| {
            let available: Vec<&str> = catalog::list_models().iter().map(|m| m.name).collect();
            RelayError::EngineConfig {
                model: requested.to_string(),
                message: format!("unknown model. Available models: {}", available.join(", ")),
            }
        })?;

        if model.name != requested.trim() {
            log::info!("Resolved model alias '{}' to '{}'", requested, model.name);
        }

        let handle: EngineHandle = match model.kind {
            EngineKind::CenterExtract => {
                Arc::new(CenterExtractSeparator::new(model.name, options))
            }
            EngineKind::BandSplit => Arc::new(BandSplitSeparator::new(model.name)),
        };
        Ok(handle)
    }
}

impl Default for BuiltinEngineFactory {
    fn default() -> Self {
        Self::new(crate::defaults::DEFAULT_MODEL)
    }
}

#[async_trait::async_trait]
impl EngineFactory for BuiltinEngineFactory {
    async fn configure(&self, options: &EngineOptions) -> Result<EngineHandle> {
        self.build(options)
    }

    fn models(&self) -> Vec<ModelInfo> {
        catalog::list_models().to_vec()
    }
}
