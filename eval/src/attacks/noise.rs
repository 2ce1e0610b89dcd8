// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Bounded random noise, a gradient-free baseline attack

use super::{check_epsilon, perturb, project, target_labels, EvasionAttack, Norm};
use crate::classifier::Classifier;
use crate::error::Result;
use ndarray::ArrayD;
use rand::distributions::{Distribution, Uniform};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct RandomNoise {
    pub norm: Norm,
    pub eps: f32,
    pub seed: u64,
}

impl RandomNoise {
    pub fn new(norm: Norm, eps: f32, seed: u64) -> Result<Self> {
        check_epsilon("eps", eps)?;
        Ok(Self { norm, eps, seed })
    }
}

impl EvasionAttack for RandomNoise {
    fn name(&self) -> &'static str {
        "noise"
    }

    fn generate(&self, classifier: &dyn Classifier, x: &ArrayD<f32>, labels: Option<&[usize]>) -> Result<ArrayD<f32>> {
        check_epsilon("eps", self.eps)?;
        // labels are only validated; noise ignores them
        target_labels(classifier, x, labels)?;
        if self.eps == 0.0 {
            return Ok(x.clone());
        }
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        let uniform = Uniform::new_inclusive(-self.eps, self.eps);
        let noise = x.mapv(|_| uniform.sample(&mut rng));
        Ok(perturb(x, &project(&noise, self.norm, self.eps), classifier.clip_values()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attacks::max_distance;
    use crate::classifier::testing::ThresholdClassifier;
    use ndarray::IxDyn;

    #[test]
    fn test_noise_is_bounded() {
        let classifier = ThresholdClassifier {
            features: 8,
            threshold: 0.5,
        };
        let x = ArrayD::from_elem(IxDyn(&[10, 8]), 0.5f32);
        let attack = RandomNoise::new(Norm::Inf, 0.1, 7).expect("attack");
        let adv = attack.generate(&classifier, &x, None).expect("generate");
        assert!(max_distance(&adv, &x, Norm::Inf) <= 0.1 + 1e-6);
        assert_ne!(adv, x);
    }

    #[test]
    fn test_zero_noise_is_identity() {
        let classifier = ThresholdClassifier {
            features: 2,
            threshold: 0.5,
        };
        let x = ArrayD::from_elem(IxDyn(&[3, 2]), 0.2f32);
        let attack = RandomNoise::new(Norm::L2, 0.0, 7).expect("attack");
        assert_eq!(attack.generate(&classifier, &x, None).expect("generate"), x);
    }
}
