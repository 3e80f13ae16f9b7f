use thiserror::Error;

/// Failure of a single backend call. Absorbed by the orchestrator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LayerError {
    #[error("layer `{layer}` unavailable: {reason}")]
    Unavailable { layer: String, reason: String },
    #[error("layer `{layer}` does not support `{op}`")]
    Unsupported { layer: String, op: &'static str },
    #[error("layer `{layer}` is read-only")]
    ReadOnly { layer: String },
}

impl LayerError {
    pub fn unavailable(layer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            layer: layer.into(),
            reason: reason.into(),
        }
    }
}

/// Conditions the orchestrator reports to its caller.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("at least one cache layer must be configured")]
    NoLayers,
    #[error("cache layer `{0}` registered twice")]
    DuplicateLayer(String),
    #[error("unknown cache layer `{0}`")]
    UnknownLayer(String),
    #[error("no writable cache layer for `{key}`")]
    NoWritableLayer { key: String },
    #[error("every writable layer rejected `{key}` ({} failures)", failures.len())]
    AllLayersRejected {
        key: String,
        failures: Vec<LayerError>,
    },
}
