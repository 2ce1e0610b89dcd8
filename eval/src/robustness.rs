// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Robustness scores
//!
//! - [`robustness_accuracy`]: share of samples whose class survives an attack
//! - [`half_distortion`]: median budget needed to flip a sample

use crate::attacks::{AttackConfig, AttackName, EvasionAttack, ProgressiveAttack};
use crate::classifier::{check_input, predict_classes, Classifier};
use crate::error::{DefenderError, Result};
use crate::metrics;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reference classes: ground truth when given, otherwise the clean predictions
fn reference_labels(classifier: &dyn Classifier, images: &ArrayD<f32>, labels: Option<&[usize]>) -> Result<Vec<usize>> {
    check_input(classifier, images)?;
    let rows = images.shape()[0];
    if rows == 0 {
        return Err(DefenderError::EmptyBatch);
    }
    match labels {
        Some(labels) if labels.len() != rows => Err(DefenderError::LengthMismatch {
            images: rows,
            labels: labels.len(),
        }),
        Some(labels) => Ok(labels.to_vec()),
        None => predict_classes(classifier, images),
    }
}

/// Accuracy under the named attack with its stock parameters
///
/// Without `labels` this measures label preservation: the fraction of
/// samples whose adversarial prediction matches the clean one.
pub fn robustness_accuracy(
    classifier: &dyn Classifier,
    images: &ArrayD<f32>,
    labels: Option<&[usize]>,
    attack_name: &str,
) -> Result<f64> {
    let attack = attack_name.parse::<AttackName>()?.default_attack();
    robustness_accuracy_with(classifier, images, labels, attack.as_ref())
}

pub fn robustness_accuracy_with(
    classifier: &dyn Classifier,
    images: &ArrayD<f32>,
    labels: Option<&[usize]>,
    attack: &dyn EvasionAttack,
) -> Result<f64> {
    let reference = reference_labels(classifier, images, labels)?;
    let adversarial = attack.generate(classifier, images, Some(reference.as_slice()))?;
    let predicted = predict_classes(classifier, &adversarial)?;
    let score = metrics::accuracy(&predicted, &reference);
    tracing::debug!("{} robustness accuracy over {} samples: {:.4}", attack.name(), reference.len(), score);
    Ok(score)
}

/// Median minimal flipping budget under a progressive search with the named inner attack
///
/// Samples that never flip count as the largest budget tested.
pub fn half_distortion(
    classifier: &dyn Classifier,
    images: &ArrayD<f32>,
    labels: Option<&[usize]>,
    attack_name: &str,
) -> Result<f64> {
    let method = attack_name.parse::<AttackName>()?;
    let config = AttackConfig::builder().method(method.as_str()).build()?;
    half_distortion_with(classifier, images, labels, &config)
}

pub fn half_distortion_with(
    classifier: &dyn Classifier,
    images: &ArrayD<f32>,
    labels: Option<&[usize]>,
    config: &AttackConfig,
) -> Result<f64> {
    let reference = reference_labels(classifier, images, labels)?;
    let outcome = ProgressiveAttack::new(config.clone()).run(classifier, images, Some(reference.as_slice()))?;
    let distortions: Vec<f64> = outcome.censored_epsilons().into_iter().map(f64::from).collect();
    let score = metrics::median(&distortions).ok_or(DefenderError::EmptyBatch)?;
    tracing::debug!(
        "Half distortion over {} samples: {:.4} ({} flipped)",
        reference.len(),
        score,
        outcome.nb_flipped()
    );
    Ok(score)
}

/// Score reported per evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScoreMetric {
    RobustnessAccuracy,
    HalfDistortion,
}

impl ScoreMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RobustnessAccuracy => "robustness-accuracy",
            Self::HalfDistortion => "half-distortion",
        }
    }

    /// Score with `config.method()` as the attack
    ///
    /// Robustness accuracy runs that attack with its stock parameters; half
    /// distortion runs the full progressive search described by `config`.
    pub fn evaluate(
        &self,
        classifier: &dyn Classifier,
        images: &ArrayD<f32>,
        labels: Option<&[usize]>,
        config: &AttackConfig,
    ) -> Result<f64> {
        match self {
            Self::RobustnessAccuracy => robustness_accuracy(classifier, images, labels, config.method().as_str()),
            Self::HalfDistortion => half_distortion_with(classifier, images, labels, config),
        }
    }

    /// Label naming the attack parameters [`ScoreMetric::evaluate`] actually uses
    pub fn describe(&self, config: &AttackConfig) -> String {
        match self {
            Self::RobustnessAccuracy => format!("{} ({}, stock parameters)", self, config.method()),
            Self::HalfDistortion => format!("{} ({}, {} norm)", self, config.method(), config.norm()),
        }
    }
}

impl fmt::Display for ScoreMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScoreMetric {
    type Err = DefenderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().replace('_', "-").as_str() {
            "robustness-accuracy" | "accuracy" => Ok(Self::RobustnessAccuracy),
            "half-distortion" | "distortion" => Ok(Self::HalfDistortion),
            other => Err(DefenderError::validation(
                "metric",
                format!("unknown metric `{}` (expected robustness-accuracy or half-distortion)", other),
            )),
        }
    }
}
