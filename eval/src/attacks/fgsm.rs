// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Fast gradient method

use super::{check_epsilon, gradient_step, in_batches, perturb, target_labels, EvasionAttack, Norm, DEFAULT_BATCH_SIZE};
use crate::classifier::Classifier;
use crate::error::Result;
use ndarray::ArrayD;

/// One step of size `eps` along the loss gradient (sign step for L-inf)
#[derive(Debug, Clone, PartialEq)]
pub struct FastGradientMethod {
    pub norm: Norm,
    pub eps: f32,
    pub batch_size: usize,
}

impl FastGradientMethod {
    pub fn new(norm: Norm, eps: f32) -> Result<Self> {
        check_epsilon("eps", eps)?;
        Ok(Self {
            norm,
            eps,
            batch_size: DEFAULT_BATCH_SIZE,
        })
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }
}

impl EvasionAttack for FastGradientMethod {
    fn name(&self) -> &'static str {
        "fgsm"
    }

    fn generate(&self, classifier: &dyn Classifier, x: &ArrayD<f32>, labels: Option<&[usize]>) -> Result<ArrayD<f32>> {
        let labels = target_labels(classifier, x, labels)?;
        in_batches(x, &labels, self.batch_size, |batch, batch_labels| {
            let grad = classifier.loss_gradient(&batch, batch_labels)?;
            let delta = gradient_step(&grad, self.norm, self.eps);
            Ok(perturb(&batch, &delta, classifier.clip_values()))
        })
    }
}
