// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Dense-layer numerics shared by the model backends
//!
//! Everything here works on row-major batches `(batch, features)`; image
//! tensors are flattened on the way in and restored on the way out.

use crate::error::{DefenderError, Result};
use ndarray::{Array1, Array2, ArrayD, Axis, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Fully connected layer with weights stored as `(out_features, in_features)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dense {
    pub weights: Array2<f32>,
    pub bias: Array1<f32>,
}

impl Dense {
    pub fn new(weights: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if weights.nrows() != bias.len() {
            return Err(DefenderError::shape_mismatch(
                format!("bias of length {}", weights.nrows()),
                format!("bias of length {}", bias.len()),
            ));
        }
        Ok(Self { weights, bias })
    }

    /// Uniform initialisation in `±1/sqrt(in_features)`
    pub fn random<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        let bound = 1.0 / (in_features.max(1) as f32).sqrt();
        let weights = Array2::from_shape_fn((out_features, in_features), |_| rng.gen_range(-bound..=bound));
        let bias = Array1::from_shape_fn(out_features, |_| rng.gen_range(-bound..=bound));
        Self { weights, bias }
    }

    pub fn in_features(&self) -> usize {
        self.weights.ncols()
    }

    pub fn out_features(&self) -> usize {
        self.weights.nrows()
    }

    pub fn forward(&self, x: &Array2<f32>) -> Array2<f32> {
        x.dot(&self.weights.t()) + &self.bias
    }

    /// Gradient w.r.t. the layer input given the gradient w.r.t. its output
    pub fn backward_input(&self, grad_out: &Array2<f32>) -> Array2<f32> {
        grad_out.dot(&self.weights)
    }
}

pub fn relu(x: &Array2<f32>) -> Array2<f32> {
    x.mapv(|v| v.max(0.0))
}

/// Masks `grad` where the pre-activation was not positive
pub fn relu_backward(grad: &Array2<f32>, pre_activation: &Array2<f32>) -> Array2<f32> {
    let mut out = grad.clone();
    out.zip_mut_with(pre_activation, |g, &p| {
        if p <= 0.0 {
            *g = 0.0;
        }
    });
    out
}

/// Row-wise numerically stable softmax
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.axis_iter_mut(Axis(0)) {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row.mapv_inplace(|v| v / sum);
        }
    }
    out
}

/// Gradient of per-sample cross-entropy w.r.t. the logits: `softmax - onehot`
pub fn cross_entropy_grad(logits: &Array2<f32>, labels: &[usize]) -> Result<Array2<f32>> {
    if logits.nrows() != labels.len() {
        return Err(DefenderError::LengthMismatch {
            images: logits.nrows(),
            labels: labels.len(),
        });
    }
    let nb_classes = logits.ncols();
    let mut grad = softmax(logits);
    for (mut row, &label) in grad.axis_iter_mut(Axis(0)).zip(labels) {
        if label >= nb_classes {
            return Err(DefenderError::shape_mismatch(
                format!("label < {}", nb_classes),
                format!("label {}", label),
            ));
        }
        row[label] -= 1.0;
    }
    Ok(grad)
}

/// Index of the largest entry of each row
pub fn argmax_rows(scores: &Array2<f32>) -> Vec<usize> {
    scores
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (idx, &v)| if v > best.1 { (idx, v) } else { best })
                .0
        })
        .collect()
}

/// Collapse every axis after the first into a feature axis
pub fn flatten(x: &ArrayD<f32>) -> Result<Array2<f32>> {
    let batch = x.shape().first().copied().unwrap_or(0);
    let features = if batch == 0 { x.shape()[1..].iter().product() } else { x.len() / batch };
    Ok(Array2::from_shape_vec((batch, features), x.iter().copied().collect())?)
}

/// Inverse of [`flatten`] for a known per-sample shape
pub fn unflatten(x: Array2<f32>, sample_shape: &[usize]) -> Result<ArrayD<f32>> {
    let mut shape = Vec::with_capacity(sample_shape.len() + 1);
    shape.push(x.nrows());
    shape.extend_from_slice(sample_shape);
    let data: Vec<f32> = x.iter().copied().collect();
    Ok(ArrayD::from_shape_vec(IxDyn(&shape), data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = array![[1.0f32, 2.0, 3.0], [1000.0, 0.0, -1000.0]];
        let probs = softmax(&logits);
        for row in probs.axis_iter(Axis(0)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        assert!(probs[[1, 0]] > 0.999);
    }

    #[test]
    fn test_cross_entropy_grad_rejects_bad_label() {
        let logits = array![[0.0f32, 0.0]];
        assert!(cross_entropy_grad(&logits, &[2]).is_err());
        assert!(cross_entropy_grad(&logits, &[0, 1]).is_err());
    }

    #[test]
    fn test_cross_entropy_grad_sign() {
        let logits = array![[0.0f32, 0.0]];
        let grad = cross_entropy_grad(&logits, &[1]).expect("valid label");
        assert!((grad[[0, 0]] - 0.5).abs() < 1e-6);
        assert!((grad[[0, 1]] + 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_dense_backward_matches_weights() {
        let layer = Dense::new(array![[1.0f32, 2.0], [3.0, 4.0], [5.0, 6.0]], array![0.0f32, 0.0, 0.0])
            .expect("consistent shapes");
        let out = layer.forward(&array![[1.0f32, 1.0]]);
        assert_eq!(out, array![[3.0f32, 7.0, 11.0]]);
        let grad = layer.backward_input(&array![[1.0f32, 0.0, 0.0]]);
        assert_eq!(grad, array![[1.0f32, 2.0]]);
    }

    #[test]
    fn test_flatten_roundtrip_shape() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[4, 2, 2, 3]));
        let flat = flatten(&x).expect("flatten");
        assert_eq!(flat.dim(), (4, 12));
        let back = unflatten(flat, &[2, 2, 3]).expect("unflatten");
        assert_eq!(back.shape(), &[4, 2, 2, 3]);
    }

    #[test]
    fn test_argmax_rows() {
        let scores = array![[0.1f32, 0.9], [0.7, 0.3]];
        assert_eq!(argmax_rows(&scores), vec![1, 0]);
    }
}
