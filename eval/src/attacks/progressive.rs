// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Progressive epsilon search
//!
//! Starting at `eps_initial`, the inner attack is run on every sample that is
//! still classified as its reference label. Samples that flip keep that
//! perturbation and leave the working set; the budget then grows by
//! `eps_increase`. The search ends when the working set is empty, the budget
//! passes `eps_max`, `max_steps` rounds have run, or after a single round
//! when `eps_increase` is zero. Samples that never flip keep the perturbation
//! from the last round.

use super::{check_epsilon, target_labels, AttackName, EvasionAttack, Norm};
use crate::classifier::{predict_classes, Classifier};
use crate::error::{DefenderError, Result};
use ndarray::{ArrayD, Axis};
use serde::{Deserialize, Serialize};

/// Validated parameters of a [`ProgressiveAttack`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttackConfig {
    norm: Norm,
    eps_initial: f32,
    eps_increase: f32,
    batch_size: usize,
    eps_max: f32,
    max_steps: usize,
    method: AttackName,
    seed: u64,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            norm: Norm::Inf,
            eps_initial: 0.01,
            eps_increase: 0.01,
            batch_size: 128,
            eps_max: 1.0,
            max_steps: 100,
            method: AttackName::Pgd,
            seed: 42,
        }
    }
}

impl AttackConfig {
    /// Config with the four core parameters; the rest keep their defaults
    pub fn new(norm: &str, eps_initial: f32, eps_increase: f32, batch_size: usize) -> Result<Self> {
        Self::builder()
            .norm(norm)
            .eps_initial(eps_initial)
            .eps_increase(eps_increase)
            .batch_size(batch_size)
            .build()
    }

    pub fn builder() -> AttackConfigBuilder {
        AttackConfigBuilder::default()
    }

    pub fn norm(&self) -> Norm {
        self.norm
    }

    pub fn eps_initial(&self) -> f32 {
        self.eps_initial
    }

    pub fn eps_increase(&self) -> f32 {
        self.eps_increase
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn eps_max(&self) -> f32 {
        self.eps_max
    }

    pub fn max_steps(&self) -> usize {
        self.max_steps
    }

    pub fn method(&self) -> AttackName {
        self.method
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

/// Unvalidated parameters; [`AttackConfigBuilder::build`] checks them all at once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttackConfigBuilder {
    pub norm: String,
    pub eps_initial: f32,
    pub eps_increase: f32,
    pub batch_size: usize,
    pub eps_max: f32,
    pub max_steps: usize,
    pub method: String,
    pub seed: u64,
}

impl Default for AttackConfigBuilder {
    fn default() -> Self {
        let config = AttackConfig::default();
        Self {
            norm: config.norm.to_string(),
            eps_initial: config.eps_initial,
            eps_increase: config.eps_increase,
            batch_size: config.batch_size,
            eps_max: config.eps_max,
            max_steps: config.max_steps,
            method: config.method.to_string(),
            seed: config.seed,
        }
    }
}

impl AttackConfigBuilder {
    pub fn norm(mut self, norm: &str) -> Self {
        self.norm = norm.to_string();
        self
    }

    pub fn eps_initial(mut self, eps: f32) -> Self {
        self.eps_initial = eps;
        self
    }

    pub fn eps_increase(mut self, eps: f32) -> Self {
        self.eps_increase = eps;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn eps_max(mut self, eps: f32) -> Self {
        self.eps_max = eps;
        self
    }

    pub fn max_steps(mut self, steps: usize) -> Self {
        self.max_steps = steps;
        self
    }

    pub fn method(mut self, method: &str) -> Self {
        self.method = method.to_string();
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn build(&self) -> Result<AttackConfig> {
        let norm = self.norm.parse::<Norm>()?;
        check_epsilon("eps_initial", self.eps_initial)?;
        check_epsilon("eps_increase", self.eps_increase)?;
        if self.batch_size == 0 {
            return Err(DefenderError::validation("batch_size", "must be a positive integer"));
        }
        check_epsilon("eps_max", self.eps_max)?;
        if self.eps_max < self.eps_initial {
            return Err(DefenderError::validation(
                "eps_max",
                format!("{} is below eps_initial {}", self.eps_max, self.eps_initial),
            ));
        }
        if self.max_steps == 0 {
            return Err(DefenderError::validation("max_steps", "must be a positive integer"));
        }
        let method = self
            .method
            .parse::<AttackName>()
            .map_err(|_| DefenderError::validation("method", format!("unknown attack `{}`", self.method)))?;

        Ok(AttackConfig {
            norm,
            eps_initial: self.eps_initial,
            eps_increase: self.eps_increase,
            batch_size: self.batch_size,
            eps_max: self.eps_max,
            max_steps: self.max_steps,
            method,
            seed: self.seed,
        })
    }
}

/// Result of a progressive search
#[derive(Debug, Clone)]
pub struct ProgressiveOutcome {
    pub adversarial: ArrayD<f32>,
    /// Budget at which each sample first flipped; `Some(0.0)` if it was already misclassified
    pub epsilons: Vec<Option<f32>>,
    /// Largest budget the inner attack ran with
    pub max_epsilon: f32,
    pub steps: usize,
}

impl ProgressiveOutcome {
    pub fn nb_flipped(&self) -> usize {
        self.epsilons.iter().filter(|e| e.is_some()).count()
    }

    /// Per-sample distortion with unflipped samples censored at `max_epsilon`
    pub fn censored_epsilons(&self) -> Vec<f32> {
        self.epsilons.iter().map(|e| e.unwrap_or(self.max_epsilon)).collect()
    }
}

#[derive(Debug, Clone)]
pub struct ProgressiveAttack {
    config: AttackConfig,
}

impl ProgressiveAttack {
    pub fn new(config: AttackConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AttackConfig {
        &self.config
    }

    /// The inner attack run at budget `eps` in round `step`
    pub fn inner_attack(&self, eps: f32, step: usize) -> Box<dyn EvasionAttack> {
        self.config.method.build(
            self.config.norm,
            eps,
            self.config.batch_size,
            self.config.seed.wrapping_add(step as u64),
        )
    }

    /// Perturbed images, attacking the clean predictions
    pub fn generate(&self, classifier: &dyn Classifier, images: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        Ok(self.run(classifier, images, None)?.adversarial)
    }

    pub fn run(&self, classifier: &dyn Classifier, images: &ArrayD<f32>, labels: Option<&[usize]>) -> Result<ProgressiveOutcome> {
        let reference = target_labels(classifier, images, labels)?;
        let mut adversarial = images.clone();
        let mut epsilons: Vec<Option<f32>> = vec![None; reference.len()];

        if reference.is_empty() {
            return Ok(ProgressiveOutcome {
                adversarial,
                epsilons,
                max_epsilon: self.config.eps_initial,
                steps: 0,
            });
        }

        // samples the model already gets wrong need no perturbation
        let clean = predict_classes(classifier, images)?;
        for (idx, (predicted, expected)) in clean.iter().zip(&reference).enumerate() {
            if predicted != expected {
                epsilons[idx] = Some(0.0);
            }
        }
        let mut active: Vec<usize> = (0..reference.len()).filter(|&idx| epsilons[idx].is_none()).collect();

        let mut eps = self.config.eps_initial;
        let mut max_epsilon = eps;
        let mut steps = 0;

        while !active.is_empty() && steps < self.config.max_steps && eps <= self.config.eps_max {
            let subset = images.select(Axis(0), &active);
            let subset_labels: Vec<usize> = active.iter().map(|&idx| reference[idx]).collect();

            let attacked = self
                .inner_attack(eps, steps)
                .generate(classifier, &subset, Some(subset_labels.as_slice()))?;
            let predicted = predict_classes(classifier, &attacked)?;

            for (pos, &idx) in active.iter().enumerate() {
                adversarial.index_axis_mut(Axis(0), idx).assign(&attacked.index_axis(Axis(0), pos));
                if predicted[pos] != subset_labels[pos] {
                    epsilons[idx] = Some(eps);
                }
            }
            active.retain(|&idx| epsilons[idx].is_none());

            max_epsilon = eps;
            steps += 1;
            tracing::debug!("eps={:.4}: {} samples still unflipped", eps, active.len());

            if self.config.eps_increase == 0.0 {
                break;
            }
            eps = self.config.eps_initial + steps as f32 * self.config.eps_increase;
        }

        let outcome = ProgressiveOutcome {
            adversarial,
            epsilons,
            max_epsilon,
            steps,
        };
        tracing::debug!(
            "Progressive {} search: {}/{} flipped after {} rounds (max eps {:.4})",
            self.config.method,
            outcome.nb_flipped(),
            reference.len(),
            outcome.steps,
            outcome.max_epsilon
        );
        Ok(outcome)
    }
}

impl EvasionAttack for ProgressiveAttack {
    fn name(&self) -> &'static str {
        "progressive"
    }

    fn generate(&self, classifier: &dyn Classifier, x: &ArrayD<f32>, labels: Option<&[usize]>) -> Result<ArrayD<f32>> {
        Ok(self.run(classifier, x, labels)?.adversarial)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::testing::{ConstantClassifier, ThresholdClassifier};
    use ndarray::IxDyn;

    fn rows(means: &[f32], features: usize) -> ArrayD<f32> {
        let data = means.iter().flat_map(|&m| std::iter::repeat(m).take(features)).collect();
        ArrayD::from_shape_vec(IxDyn(&[means.len(), features]), data).expect("shape")
    }

    #[test]
    fn test_default_inner_attack_is_pgd() {
        let attack = ProgressiveAttack::new(AttackConfig::default());
        assert_eq!(attack.config().method(), AttackName::Pgd);
        assert_eq!(attack.inner_attack(0.1, 0).name(), "pgd");
    }

    #[test]
    fn test_invalid_parameters_rejected() {
        let cases = [
            AttackConfig::builder().norm("zzz"),
            AttackConfig::builder().eps_initial(f32::INFINITY),
            AttackConfig::builder().eps_initial(-1.0),
            AttackConfig::builder().eps_increase(f32::INFINITY),
            AttackConfig::builder().eps_increase(-1.0),
            AttackConfig::builder().eps_increase(f32::NAN),
            AttackConfig::builder().batch_size(0),
            AttackConfig::builder().max_steps(0),
            AttackConfig::builder().eps_initial(0.5).eps_max(0.1),
            AttackConfig::builder().method("deepfool"),
        ];
        for builder in cases {
            let err = builder.build().expect_err("invalid config");
            assert!(matches!(err, DefenderError::Validation { .. }), "{:?}", err);
            assert!(err.is_value_error());
        }
    }

    #[test]
    fn test_new_with_core_parameters() {
        let config = AttackConfig::new("2", 0.05, 0.02, 16).expect("config");
        assert_eq!(config.norm(), Norm::L2);
        assert_eq!(config.batch_size(), 16);
        assert_eq!(config.eps_max(), 1.0);
        assert!(AttackConfig::new("inf", 0.0, 0.0, 1).is_ok());
    }

    #[test]
    fn test_records_flip_epsilon_per_sample() {
        let classifier = ThresholdClassifier {
            features: 4,
            threshold: 0.5,
        };
        let images = rows(&[0.52, 0.63, 0.74], 4);
        let config = AttackConfig::builder()
            .method("fgsm")
            .eps_initial(0.05)
            .eps_increase(0.05)
            .build()
            .expect("config");

        let outcome = ProgressiveAttack::new(config).run(&classifier, &images, Some(&[1, 1, 1][..])).expect("run");
        let eps: Vec<f32> = outcome.epsilons.iter().map(|e| e.expect("flipped")).collect();
        assert!((eps[0] - 0.05).abs() < 1e-4);
        assert!((eps[1] - 0.15).abs() < 1e-4);
        assert!((eps[2] - 0.25).abs() < 1e-4);
        assert_eq!(outcome.steps, 5);
        assert_eq!(predict_classes(&classifier, &outcome.adversarial).expect("predict"), vec![0, 0, 0]);
    }

    #[test]
    fn test_unflipped_keep_last_perturbation() {
        let classifier = ThresholdClassifier {
            features: 2,
            threshold: 0.5,
        };
        let images = rows(&[0.9], 2);
        let config = AttackConfig::builder()
            .method("fgsm")
            .eps_initial(0.1)
            .eps_increase(0.1)
            .eps_max(0.2)
            .build()
            .expect("config");

        let outcome = ProgressiveAttack::new(config).run(&classifier, &images, None).expect("run");
        assert_eq!(outcome.epsilons, vec![None]);
        assert!((outcome.max_epsilon - 0.2).abs() < 1e-6);
        assert!(outcome.adversarial.iter().all(|&v| (v - 0.7).abs() < 1e-5));
        assert_eq!(outcome.censored_epsilons(), vec![outcome.max_epsilon]);
    }

    #[test]
    fn test_zero_increase_runs_once() {
        let classifier = ConstantClassifier {
            input_shape: vec![3],
            nb_classes: 2,
        };
        let images = ArrayD::from_elem(IxDyn(&[2, 3]), 0.5f32);
        let config = AttackConfig::new("inf", 0.1, 0.0, 8).expect("config");
        let outcome = ProgressiveAttack::new(config).run(&classifier, &images, None).expect("run");
        assert_eq!(outcome.steps, 1);
        assert_eq!(outcome.nb_flipped(), 0);
    }

    #[test]
    fn test_misclassified_samples_need_no_budget() {
        let classifier = ThresholdClassifier {
            features: 2,
            threshold: 0.5,
        };
        let images = rows(&[0.2, 0.8], 2);
        let config = AttackConfig::builder().method("fgsm").build().expect("config");
        let outcome = ProgressiveAttack::new(config)
            .run(&classifier, &images, Some(&[1, 0][..]))
            .expect("run");
        assert_eq!(outcome.epsilons, vec![Some(0.0), Some(0.0)]);
        assert_eq!(outcome.steps, 0);
        assert_eq!(outcome.adversarial, images);
    }

    #[test]
    fn test_generate_keeps_shape() {
        let classifier = ThresholdClassifier {
            features: 3,
            threshold: 0.5,
        };
        let images = rows(&[0.3, 0.6, 0.9, 0.1], 3);
        let attack = ProgressiveAttack::new(AttackConfig::new("2", 0.05, 0.1, 2).expect("config"));
        let adversarial = attack.generate(&classifier, &images).expect("generate");
        assert_eq!(adversarial.shape(), images.shape());
    }
}
