// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Error types for robustness evaluation

use thiserror::Error;

/// Errors raised by attack construction, model conversion, scoring and data loading
#[derive(Debug, Error)]
pub enum DefenderError {
    /// A parameter rejected at construction
    #[error("invalid parameter `{param}`: {reason}")]
    Validation { param: String, reason: String },

    /// No registered converter handles the model's underlying type
    #[error("no converter registered for model type `{0}`")]
    UnsupportedModel(String),

    /// A converter could not adapt or persist a model
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// Attack name not in the known set
    #[error("unknown attack `{0}` (expected one of: fgsm, bim, pgd, noise)")]
    UnknownAttack(String),

    #[error("length mismatch: {images} images but {labels} labels")]
    LengthMismatch { images: usize, labels: usize },

    #[error("empty input batch")]
    EmptyBatch,

    /// Classifier or tensor shape does not match what the caller expects
    #[error("shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Dataset directory missing, empty, or with no matching files
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    /// Workspace mount could not resolve a local path
    #[error("mount failed: {0}")]
    Mount(String),

    /// Checksum of a packaged artifact did not match the manifest
    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("download failed: {0}")]
    Download(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("image error: {0}")]
    Image(String),
}

impl DefenderError {
    pub fn validation(param: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            param: param.into(),
            reason: reason.into(),
        }
    }

    pub fn conversion(reason: impl Into<String>) -> Self {
        Self::Conversion(reason.into())
    }

    pub fn shape_mismatch(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            expected: expected.into(),
            actual: actual.into(),
        }
    }

    pub fn invalid_dataset(reason: impl Into<String>) -> Self {
        Self::InvalidDataset(reason.into())
    }

    pub fn mount(reason: impl Into<String>) -> Self {
        Self::Mount(reason.into())
    }

    /// True for the errors a caller would treat as bad input values
    pub fn is_value_error(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. }
                | Self::UnknownAttack(_)
                | Self::LengthMismatch { .. }
                | Self::EmptyBatch
                | Self::InvalidDataset(_)
                | Self::Mount(_)
        )
    }
}

impl From<serde_json::Error> for DefenderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<ndarray::ShapeError> for DefenderError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::ShapeMismatch {
            expected: "compatible array shape".to_string(),
            actual: err.to_string(),
        }
    }
}

impl From<image::ImageError> for DefenderError {
    fn from(err: image::ImageError) -> Self {
        Self::Image(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DefenderError>;
