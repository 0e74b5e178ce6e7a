//! Separation model catalog.
//!
//! Every model identifier a client may send is resolved here, once, to a
//! closed set of engine kinds. Identifiers used by older clients are kept
//! as aliases of the built-in engines.

use serde::Serialize;
use std::fmt;

/// Closed set of engine implementations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// Soft mid/side mask producing a single vocals bus.
    CenterExtract,
    /// Crossover filters producing low/mid/high component buses.
    BandSplit,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineKind::CenterExtract => write!(f, "center-extract"),
            EngineKind::BandSplit => write!(f, "band-split"),
        }
    }
}

/// Metadata for a separation model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    /// Model identifier sent in `configure`
    pub name: &'static str,
    /// Engine implementation backing this model
    pub kind: EngineKind,
    /// Buses the engine returns before post-processing
    pub buses: &'static [&'static str],
    /// One-line description
    pub description: &'static str,
}

/// Catalog of built-in models.
pub const MODELS: &[ModelInfo] = &[
    ModelInfo {
        name: "center-extract",
        kind: EngineKind::CenterExtract,
        buses: &["vocals"],
        description: "Center-panned vocal extraction with a soft mid/side mask",
    },
    ModelInfo {
        name: "band-split",
        kind: EngineKind::BandSplit,
        buses: &["low", "mid", "high"],
        description: "Three-band crossover (250 Hz / 4 kHz) component buses",
    },
];

/// Identifiers accepted for compatibility with existing clients.
const ALIASES: &[(&str, &str)] = &[
    ("htdemucs", "center-extract"),
    ("htdemucs_ft", "center-extract"),
    ("hdemucs_mmi", "center-extract"),
    ("music_stem_fast", "center-extract"),
    ("mdx", "band-split"),
    ("mdx_extra", "band-split"),
    ("music_stem_large", "band-split"),
    ("stem_separation", "band-split"),
];

/// Get model info by exact catalog name.
pub fn get_model(name: &str) -> Option<&'static ModelInfo> {
    MODELS.iter().find(|m| m.name == name)
}

/// Resolve a name or alias to its catalog entry.
///
/// Matching is exact after trimming; there is no substring matching.
pub fn resolve_name(name: &str) -> Option<&'static ModelInfo> {
    let name = name.trim();
    get_model(name).or_else(|| {
        ALIASES
            .iter()
            .find(|(alias, _)| *alias == name)
            .and_then(|(_, target)| get_model(target))
    })
}

/// List all catalog models.
pub fn list_models() -> &'static [ModelInfo] {
    MODELS
}

/// Aliases that resolve to the given model.
pub fn aliases_for(name: &str) -> Vec<&'static str> {
    ALIASES
        .iter()
        .filter(|(_, target)| *target == name)
        .map(|(alias, _)| *alias)
        .collect()
}
