// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Uniform classifier interface consumed by attacks and scorers

use crate::error::{DefenderError, Result};
use crate::nn;
use ndarray::{Array2, ArrayD};
use serde::{Deserialize, Serialize};
use std::any::Any;

/// A model adapted for prediction and gradient-based attacks
///
/// `predict` returns one probability row per input sample. `loss_gradient`
/// returns the cross-entropy gradient w.r.t. the raw (pre-normalisation)
/// inputs and has the same shape as `x`.
pub trait Classifier: Send + Sync {
    fn predict(&self, x: &ArrayD<f32>) -> Result<Array2<f32>>;

    fn loss_gradient(&self, x: &ArrayD<f32>, labels: &[usize]) -> Result<ArrayD<f32>>;

    fn nb_classes(&self) -> usize;

    /// Per-sample input shape, without the batch axis
    fn input_shape(&self) -> &[usize];

    /// Valid input range; attacks clip adversarial examples to it
    fn clip_values(&self) -> Option<(f32, f32)> {
        None
    }

    /// Name of the backend the classifier wraps
    fn framework(&self) -> &'static str;

    fn as_any(&self) -> &dyn Any;

    /// Concrete type name, used in dispatch errors
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// Input normalisation `(x - mean) / std` applied before the network
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Preprocessing {
    pub mean: f32,
    pub std: f32,
}

impl Default for Preprocessing {
    fn default() -> Self {
        Self { mean: 0.0, std: 1.0 }
    }
}

impl Preprocessing {
    pub fn new(mean: f32, std: f32) -> Result<Self> {
        if !std.is_finite() || std <= 0.0 || !mean.is_finite() {
            return Err(DefenderError::conversion(format!(
                "normalisation needs a finite mean and a positive std, got mean={} std={}",
                mean, std
            )));
        }
        Ok(Self { mean, std })
    }

    pub fn apply(&self, x: &Array2<f32>) -> Array2<f32> {
        x.mapv(|v| (v - self.mean) / self.std)
    }

    /// Chain rule through the normalisation
    pub fn backward(&self, grad: &Array2<f32>) -> Array2<f32> {
        grad.mapv(|g| g / self.std)
    }
}

/// Predict and check the row/column invariant of the probability matrix
pub fn checked_predict(classifier: &dyn Classifier, x: &ArrayD<f32>) -> Result<Array2<f32>> {
    let probs = classifier.predict(x)?;
    let rows = x.shape().first().copied().unwrap_or(0);
    if probs.nrows() != rows || probs.ncols() != classifier.nb_classes() {
        return Err(DefenderError::shape_mismatch(
            format!("({}, {})", rows, classifier.nb_classes()),
            format!("{:?}", probs.dim()),
        ));
    }
    Ok(probs)
}

/// Predicted class index for every sample
pub fn predict_classes(classifier: &dyn Classifier, x: &ArrayD<f32>) -> Result<Vec<usize>> {
    Ok(nn::argmax_rows(&checked_predict(classifier, x)?))
}

/// Check that `x` is a batch of the classifier's input shape
pub fn check_input(classifier: &dyn Classifier, x: &ArrayD<f32>) -> Result<()> {
    let expected = classifier.input_shape();
    if x.ndim() != expected.len() + 1 || &x.shape()[1..] != expected {
        return Err(DefenderError::shape_mismatch(
            format!("[N, {}]", join_dims(expected)),
            format!("{:?}", x.shape()),
        ));
    }
    Ok(())
}

pub(crate) fn join_dims(dims: &[usize]) -> String {
    dims.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
pub(crate) mod testing {
    //! Hand-rolled classifiers for attack and scorer tests

    use super::*;
    use ndarray::{Axis, IxDyn};

    /// Always predicts class 0 and has a zero gradient
    pub struct ConstantClassifier {
        pub input_shape: Vec<usize>,
        pub nb_classes: usize,
    }

    impl Classifier for ConstantClassifier {
        fn predict(&self, x: &ArrayD<f32>) -> Result<Array2<f32>> {
            let mut probs = Array2::zeros((x.shape()[0], self.nb_classes));
            probs.column_mut(0).fill(1.0);
            Ok(probs)
        }

        fn loss_gradient(&self, x: &ArrayD<f32>, _labels: &[usize]) -> Result<ArrayD<f32>> {
            Ok(ArrayD::zeros(IxDyn(x.shape())))
        }

        fn nb_classes(&self) -> usize {
            self.nb_classes
        }

        fn input_shape(&self) -> &[usize] {
            &self.input_shape
        }

        fn clip_values(&self) -> Option<(f32, f32)> {
            Some((0.0, 1.0))
        }

        fn framework(&self) -> &'static str {
            "constant"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    /// Two-class threshold on the mean of the features: class 1 when mean > threshold
    pub struct ThresholdClassifier {
        pub features: usize,
        pub threshold: f32,
    }

    impl ThresholdClassifier {
        fn means(&self, x: &ArrayD<f32>) -> Vec<f32> {
            x.axis_iter(Axis(0)).map(|row| row.mean().unwrap_or(0.0)).collect()
        }
    }

    impl Classifier for ThresholdClassifier {
        fn predict(&self, x: &ArrayD<f32>) -> Result<Array2<f32>> {
            let means = self.means(x);
            let mut probs = Array2::zeros((means.len(), 2));
            for (i, m) in means.iter().enumerate() {
                let p1 = 1.0 / (1.0 + (-(m - self.threshold) * 50.0).exp());
                probs[[i, 0]] = 1.0 - p1;
                probs[[i, 1]] = p1;
            }
            Ok(probs)
        }

        fn loss_gradient(&self, x: &ArrayD<f32>, labels: &[usize]) -> Result<ArrayD<f32>> {
            // d(loss)/dx pushes the mean away from the labelled side
            let mut grad = ArrayD::zeros(IxDyn(x.shape()));
            for (mut row, &label) in grad.axis_iter_mut(Axis(0)).zip(labels) {
                row.fill(if label == 1 { -1.0 } else { 1.0 });
            }
            Ok(grad)
        }

        fn nb_classes(&self) -> usize {
            2
        }

        fn input_shape(&self) -> &[usize] {
            std::slice::from_ref(&self.features)
        }

        fn clip_values(&self) -> Option<(f32, f32)> {
            Some((0.0, 1.0))
        }

        fn framework(&self) -> &'static str {
            "threshold"
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }
}
