// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Projected gradient descent and the basic iterative method

use super::{
    check_epsilon, gradient_step, in_batches, perturb, project, target_labels, EvasionAttack, Norm, DEFAULT_BATCH_SIZE,
};
use crate::classifier::Classifier;
use crate::error::{DefenderError, Result};
use ndarray::ArrayD;
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

/// Iterated gradient steps of `eps_step`, projected back onto the `eps` ball
///
/// With `random_init` the search starts from a uniform point inside the
/// ball; without it this is the basic iterative method.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedGradientDescent {
    pub norm: Norm,
    pub eps: f32,
    pub eps_step: f32,
    pub max_iter: usize,
    pub random_init: bool,
    pub batch_size: usize,
    pub seed: u64,
}

impl ProjectedGradientDescent {
    pub fn new(norm: Norm, eps: f32, eps_step: f32, max_iter: usize) -> Self {
        Self {
            norm,
            eps,
            eps_step,
            max_iter,
            random_init: true,
            batch_size: DEFAULT_BATCH_SIZE,
            seed: 0,
        }
    }

    pub fn basic_iterative(norm: Norm, eps: f32, eps_step: f32, max_iter: usize) -> Self {
        Self {
            random_init: false,
            ..Self::new(norm, eps, eps_step, max_iter)
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    fn validate(&self) -> Result<()> {
        check_epsilon("eps", self.eps)?;
        check_epsilon("eps_step", self.eps_step)?;
        if self.max_iter == 0 {
            return Err(DefenderError::validation("max_iter", "must be positive"));
        }
        Ok(())
    }

    fn attack_batch(
        &self,
        classifier: &dyn Classifier,
        x: &ArrayD<f32>,
        labels: &[usize],
        rng: &mut ChaCha8Rng,
    ) -> Result<ArrayD<f32>> {
        let clip = classifier.clip_values();
        let mut adv = if self.random_init && self.eps > 0.0 {
            let uniform = Uniform::new_inclusive(-self.eps, self.eps);
            let noise = x.mapv(|_| uniform.sample(rng));
            perturb(x, &project(&noise, self.norm, self.eps), clip)
        } else {
            x.clone()
        };

        for _ in 0..self.max_iter {
            let grad = classifier.loss_gradient(&adv, labels)?;
            let stepped = &adv + &gradient_step(&grad, self.norm, self.eps_step);
            let delta = project(&(&stepped - x), self.norm, self.eps);
            adv = perturb(x, &delta, clip);
        }
        Ok(adv)
    }
}

impl EvasionAttack for ProjectedGradientDescent {
    fn name(&self) -> &'static str {
        if self.random_init {
            "pgd"
        } else {
            "bim"
        }
    }

    fn generate(&self, classifier: &dyn Classifier, x: &ArrayD<f32>, labels: Option<&[usize]>) -> Result<ArrayD<f32>> {
        self.validate()?;
        let labels = target_labels(classifier, x, labels)?;
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        in_batches(x, &labels, self.batch_size, |batch, batch_labels| {
            self.attack_batch(classifier, &batch, batch_labels, &mut rng)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attacks::max_distance;
    use crate::classifier::testing::{ConstantClassifier, ThresholdClassifier};
    use ndarray::IxDyn;

    #[test]
    fn test_perturbation_stays_in_ball() {
        let classifier = ThresholdClassifier {
            features: 6,
            threshold: 0.5,
        };
        let x = ArrayD::from_elem(IxDyn(&[4, 6]), 0.55f32);
        for norm in [Norm::Inf, Norm::L2, Norm::L1] {
            let attack = ProjectedGradientDescent::new(norm, 0.2, 0.05, 8).with_seed(3);
            let adv = attack.generate(&classifier, &x, None).expect("generate");
            assert!(max_distance(&adv, &x, norm) <= 0.2 + 1e-5, "{} ball", norm);
            assert!(adv.iter().all(|&v| (0.0..=1.0).contains(&v)));
        }
    }

    #[test]
    fn test_bim_is_deterministic_without_gradient() {
        let classifier = ConstantClassifier {
            input_shape: vec![3],
            nb_classes: 2,
        };
        let x = ArrayD::from_elem(IxDyn(&[2, 3]), 0.4f32);
        let attack = ProjectedGradientDescent::basic_iterative(Norm::Inf, 0.3, 0.1, 5);
        assert_eq!(attack.name(), "bim");
        assert_eq!(attack.generate(&classifier, &x, None).expect("generate"), x);
    }

    #[test]
    fn test_same_seed_same_result() {
        let classifier = ThresholdClassifier {
            features: 3,
            threshold: 0.5,
        };
        let x = ArrayD::from_elem(IxDyn(&[3, 3]), 0.7f32);
        let attack = ProjectedGradientDescent::new(Norm::L2, 0.3, 0.1, 3).with_seed(42);
        let a = attack.generate(&classifier, &x, None).expect("generate");
        let b = attack.generate(&classifier, &x, None).expect("generate");
        assert_eq!(a, b);
    }

    #[test]
    fn test_rejects_zero_iterations() {
        let classifier = ConstantClassifier {
            input_shape: vec![3],
            nb_classes: 2,
        };
        let x = ArrayD::from_elem(IxDyn(&[1, 3]), 0.4f32);
        let attack = ProjectedGradientDescent::new(Norm::Inf, 0.3, 0.1, 0);
        assert!(attack.generate(&classifier, &x, None).is_err());
    }
}
