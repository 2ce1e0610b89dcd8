// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evasion attacks against a [`Classifier`]
//!
//! - [`fgsm`]: single signed/normalised gradient step
//! - [`pgd`]: projected gradient descent and the basic iterative method
//! - [`noise`]: bounded uniform noise, gradient-free
//! - [`progressive`]: epsilon search wrapped around any of the above

pub mod fgsm;
pub mod noise;
pub mod pgd;
pub mod progressive;

use crate::classifier::{check_input, predict_classes, Classifier};
use crate::error::{DefenderError, Result};
use ndarray::{concatenate, ArrayD, Axis};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use fgsm::FastGradientMethod;
pub use noise::RandomNoise;
pub use pgd::ProjectedGradientDescent;
pub use progressive::{AttackConfig, AttackConfigBuilder, ProgressiveAttack, ProgressiveOutcome};

/// Perturbation norm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Norm {
    #[serde(rename = "1")]
    L1,
    #[serde(rename = "2")]
    L2,
    #[serde(rename = "inf")]
    Inf,
}

impl FromStr for Norm {
    type Err = DefenderError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "1" | "l1" => Ok(Self::L1),
            "2" | "l2" => Ok(Self::L2),
            "inf" | "linf" | "np.inf" => Ok(Self::Inf),
            other => Err(DefenderError::validation(
                "norm",
                format!("`{}` is not one of inf, 1, 2", other),
            )),
        }
    }
}

impl fmt::Display for Norm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::L1 => write!(f, "1"),
            Self::L2 => write!(f, "2"),
            Self::Inf => write!(f, "inf"),
        }
    }
}

/// Attacks selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttackName {
    Fgsm,
    Bim,
    Pgd,
    Noise,
}

impl AttackName {
    pub const ALL: [AttackName; 4] = [Self::Fgsm, Self::Bim, Self::Pgd, Self::Noise];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fgsm => "fgsm",
            Self::Bim => "bim",
            Self::Pgd => "pgd",
            Self::Noise => "noise",
        }
    }

    /// The attack with its stock parameters (L-inf, eps 0.3)
    pub fn default_attack(&self) -> Box<dyn EvasionAttack> {
        self.build(Norm::Inf, DEFAULT_EPS, DEFAULT_BATCH_SIZE, 0)
    }

    /// The attack at a given budget; iterative attacks step by a quarter of it
    pub fn build(&self, norm: Norm, eps: f32, batch_size: usize, seed: u64) -> Box<dyn EvasionAttack> {
        match self {
            Self::Fgsm => Box::new(FastGradientMethod {
                norm,
                eps,
                batch_size,
            }),
            Self::Bim => Box::new(ProjectedGradientDescent::basic_iterative(norm, eps, eps / 4.0, 10).with_batch_size(batch_size)),
            Self::Pgd => Box::new(
                ProjectedGradientDescent::new(norm, eps, eps / 4.0, 10)
                    .with_batch_size(batch_size)
                    .with_seed(seed),
            ),
            Self::Noise => Box::new(RandomNoise { norm, eps, seed }),
        }
    }
}

impl FromStr for AttackName {
    type Err = DefenderError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|name| name.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| DefenderError::UnknownAttack(s.to_string()))
    }
}

impl fmt::Display for AttackName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const DEFAULT_EPS: f32 = 0.3;
pub const DEFAULT_BATCH_SIZE: usize = 128;

/// Produces adversarial versions of a batch
///
/// `labels` are the classes to move away from; when absent the classifier's
/// own clean predictions are used.
pub trait EvasionAttack: Send + Sync {
    fn name(&self) -> &'static str;

    fn generate(&self, classifier: &dyn Classifier, x: &ArrayD<f32>, labels: Option<&[usize]>) -> Result<ArrayD<f32>>;
}

/// Labels to attack: the given ones, or the clean predictions
pub fn target_labels(classifier: &dyn Classifier, x: &ArrayD<f32>, labels: Option<&[usize]>) -> Result<Vec<usize>> {
    check_input(classifier, x)?;
    let rows = x.shape()[0];
    match labels {
        Some(labels) if labels.len() != rows => Err(DefenderError::LengthMismatch {
            images: rows,
            labels: labels.len(),
        }),
        Some(labels) => Ok(labels.to_vec()),
        None => predict_classes(classifier, x),
    }
}

pub(crate) fn check_epsilon(param: &str, value: f32) -> Result<()> {
    if !value.is_finite() || value < 0.0 {
        return Err(DefenderError::validation(
            param,
            format!("must be a finite non-negative number, got {}", value),
        ));
    }
    Ok(())
}

/// Run `f` over consecutive batches of `x` and stitch the outputs back together
pub(crate) fn in_batches<F>(x: &ArrayD<f32>, labels: &[usize], batch_size: usize, mut f: F) -> Result<ArrayD<f32>>
where
    F: FnMut(ArrayD<f32>, &[usize]) -> Result<ArrayD<f32>>,
{
    if batch_size == 0 {
        return Err(DefenderError::validation("batch_size", "must be positive"));
    }
    let rows = x.shape().first().copied().unwrap_or(0);
    if rows == 0 {
        return Ok(x.clone());
    }
    let outputs = x
        .axis_chunks_iter(Axis(0), batch_size)
        .zip(labels.chunks(batch_size))
        .map(|(batch, batch_labels)| f(batch.to_owned(), batch_labels))
        .collect::<Result<Vec<_>>>()?;
    let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

/// Per-sample step of length `step` along `grad` under `norm`
///
/// L-inf takes the sign; L1 and L2 divide by the gradient's norm. Samples
/// with a zero gradient do not move.
pub fn gradient_step(grad: &ArrayD<f32>, norm: Norm, step: f32) -> ArrayD<f32> {
    let mut out = grad.clone();
    for mut sample in out.axis_iter_mut(Axis(0)) {
        match norm {
            Norm::Inf => sample.mapv_inplace(|g| step * sign(g)),
            Norm::L1 | Norm::L2 => {
                let length = sample_norm(sample.iter().copied(), norm);
                if length > 0.0 {
                    sample.mapv_inplace(|g| step * g / length);
                } else {
                    sample.fill(0.0);
                }
            }
        }
    }
    out
}

/// Project each sample of `delta` onto the `eps` ball of `norm`
pub fn project(delta: &ArrayD<f32>, norm: Norm, eps: f32) -> ArrayD<f32> {
    let mut out = delta.clone();
    for mut sample in out.axis_iter_mut(Axis(0)) {
        match norm {
            Norm::Inf => sample.mapv_inplace(|d| d.clamp(-eps, eps)),
            Norm::L1 | Norm::L2 => {
                let length = sample_norm(sample.iter().copied(), norm);
                if length > eps && length > 0.0 {
                    let scale = eps / length;
                    sample.mapv_inplace(|d| d * scale);
                }
            }
        }
    }
    out
}

/// `x + delta`, clipped to the classifier's valid range
pub(crate) fn perturb(x: &ArrayD<f32>, delta: &ArrayD<f32>, clip_values: Option<(f32, f32)>) -> ArrayD<f32> {
    let mut out = x + delta;
    if let Some((lo, hi)) = clip_values {
        out.mapv_inplace(|v| v.clamp(lo, hi));
    }
    out
}

pub(crate) fn sample_norm(values: impl Iterator<Item = f32>, norm: Norm) -> f32 {
    match norm {
        Norm::L1 => values.map(f32::abs).sum(),
        Norm::L2 => values.map(|v| v * v).sum::<f32>().sqrt(),
        Norm::Inf => values.fold(0.0, |acc, v| acc.max(v.abs())),
    }
}

/// Largest per-sample norm of `a - b`
pub fn max_distance(a: &ArrayD<f32>, b: &ArrayD<f32>, norm: Norm) -> f32 {
    let diff = a - b;
    diff.axis_iter(Axis(0))
        .map(|sample| sample_norm(sample.iter().copied(), norm))
        .fold(0.0, f32::max)
}

fn sign(v: f32) -> f32 {
    if v > 0.0 {
        1.0
    } else if v < 0.0 {
        -1.0
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_norm_parsing() {
        assert_eq!("inf".parse::<Norm>().expect("inf"), Norm::Inf);
        assert_eq!("2".parse::<Norm>().expect("l2"), Norm::L2);
        assert_eq!("1".parse::<Norm>().expect("l1"), Norm::L1);
        let err = "zzz".parse::<Norm>().expect_err("invalid norm");
        assert!(matches!(err, DefenderError::Validation { ref param, .. } if param == "norm"));
    }

    #[test]
    fn test_attack_name_parsing() {
        assert_eq!("PGD".parse::<AttackName>().expect("pgd"), AttackName::Pgd);
        assert_eq!("fgsm".parse::<AttackName>().expect("fgsm"), AttackName::Fgsm);
        let err = "deepfool".parse::<AttackName>().expect_err("unknown");
        assert!(matches!(err, DefenderError::UnknownAttack(_)));
        assert!(err.is_value_error());
    }

    #[test]
    fn test_projection_stays_in_ball() {
        let delta = ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![3.0f32, -4.0, 0.0, 0.1, 0.1, 0.1]).expect("shape");
        for norm in [Norm::Inf, Norm::L1, Norm::L2] {
            let projected = project(&delta, norm, 0.5);
            for sample in projected.axis_iter(Axis(0)) {
                assert!(sample_norm(sample.iter().copied(), norm) <= 0.5 + 1e-5, "{} ball", norm);
            }
        }
        // already inside the L2 ball
        let inside = project(&delta, Norm::L2, 10.0);
        assert_eq!(inside, delta);
    }

    #[test]
    fn test_gradient_step_lengths() {
        let grad = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![3.0f32, -4.0, 0.0, 0.0]).expect("shape");
        let linf = gradient_step(&grad, Norm::Inf, 0.1);
        assert_eq!(linf.iter().copied().collect::<Vec<_>>(), vec![0.1, -0.1, 0.0, 0.0]);

        let l2 = gradient_step(&grad, Norm::L2, 1.0);
        assert!((l2[[0, 0]] - 0.6).abs() < 1e-6);
        assert!((l2[[0, 1]] + 0.8).abs() < 1e-6);
        assert_eq!(l2[[1, 0]], 0.0);
    }

    #[test]
    fn test_in_batches_preserves_order() {
        let x = ArrayD::from_shape_vec(IxDyn(&[5, 1]), vec![0.0f32, 1.0, 2.0, 3.0, 4.0]).expect("shape");
        let labels = [0usize; 5];
        let out = in_batches(&x, &labels, 2, |batch, _| Ok(batch.mapv(|v| v * 10.0))).expect("batches");
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![0.0, 10.0, 20.0, 30.0, 40.0]);
        assert!(in_batches(&x, &labels, 0, |batch, _| Ok(batch)).is_err());
    }
}
