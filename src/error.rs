use std::{fmt, path::PathBuf};

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = OcrError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Detector,
    Recognizer,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKind::Detector => f.write_str("detector"),
            ModelKind::Recognizer => f.write_str("recognizer"),
        }
    }
}

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("failed to load {model} model from {}: {source}", path.display())]
    Load {
        model: ModelKind,
        path: PathBuf,
        #[source]
        source: ort::Error,
    },

    #[error("{model} model does not match its contract: {reason}")]
    Contract { model: ModelKind, reason: String },

    #[error("failed to read character table {}: {source}", path.display())]
    Keys {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("rejected upload {name}: {reason}")]
    InputValidation { name: String, reason: String },

    #[error("failed to decode image {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: image::ImageError,
    },

    #[error("{model} inference failed: {source}")]
    Inference {
        model: ModelKind,
        #[source]
        source: BoxError,
    },

    #[error("{model} produced malformed output: {reason}")]
    MalformedOutput { model: ModelKind, reason: String },

    #[error("run superseded by a newer upload")]
    Superseded,
}

impl OcrError {
    pub fn inference(model: ModelKind, source: impl Into<BoxError>) -> Self {
        Self::Inference {
            model,
            source: source.into(),
        }
    }

    pub fn malformed(model: ModelKind, reason: impl Into<String>) -> Self {
        Self::MalformedOutput {
            model,
            reason: reason.into(),
        }
    }
}
