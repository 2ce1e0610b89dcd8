// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Adversarial robustness scoring for packaged image classifiers
//!
//! This crate provides:
//! - A uniform classifier interface over torch- and tensorflow-style backends
//! - Packaged model loading and type-dispatched conversion
//! - Evasion attacks (FGSM, BIM, PGD, random noise) and a progressive epsilon search
//! - Robustness accuracy and half distortion scores
//! - Image dataset loading and workspace mounts
//! - Reproducible evaluation pipeline with seeded randomness

pub mod attacks;
pub mod backend;
pub mod classifier;
pub mod converter;
pub mod datasets;
pub mod defences;
pub mod error;
pub mod metrics;
pub mod mount;
pub mod nn;
pub mod package;
pub mod pipeline;
pub mod robustness;

pub use attacks::{AttackConfig, AttackName, EvasionAttack, Norm, ProgressiveAttack};
pub use backend::{TensorFlowClassifier, TorchClassifier};
pub use classifier::{Classifier, Preprocessing};
pub use converter::{create_classifier, select_converter, Converter, ConverterRegistry};
pub use datasets::{load_image_dataset, ImageDataset};
pub use error::{DefenderError, Result};
pub use metrics::{ConfusionMatrix, ScoreBand};
pub use mount::{mount_dataset, mount_model, MountGuard, Workspace};
pub use package::{load_model, ModelManifest, PackagedModel};
pub use pipeline::{EvaluationConfig, EvaluationPipeline, EvaluationResults};
pub use robustness::{half_distortion, robustness_accuracy, ScoreMetric};
