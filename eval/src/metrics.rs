// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Evaluation metrics for multi-class predictions and robustness scores
//!
//! Implements:
//! - Confusion matrix with per-class precision/recall
//! - Accuracy against a reference labelling
//! - Median (for half distortion)
//! - Mean/min/max bands over repeated scores

use serde::{Deserialize, Serialize};

/// Confusion matrix; rows are true classes, columns predicted classes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub counts: Vec<Vec<usize>>,
}

impl ConfusionMatrix {
    /// Build from predictions and ground truth; out-of-range classes are skipped
    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], nb_classes: usize) -> Self {
        let mut counts = vec![vec![0; nb_classes]; nb_classes];
        for (&pred, &truth) in predictions.iter().zip(ground_truth.iter()) {
            if pred < nb_classes && truth < nb_classes {
                counts[truth][pred] += 1;
            }
        }
        Self { counts }
    }

    pub fn nb_classes(&self) -> usize {
        self.counts.len()
    }

    /// Total number of samples
    pub fn total(&self) -> usize {
        self.counts.iter().flatten().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.nb_classes()).map(|c| self.counts[c][c]).sum()
    }

    pub fn accuracy(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.correct() as f64 / total as f64
    }

    /// Precision of class `c`: TP / predicted as `c`
    pub fn precision(&self, c: usize) -> f64 {
        let predicted: usize = self.counts.iter().map(|row| row[c]).sum();
        if predicted == 0 {
            return 0.0;
        }
        self.counts[c][c] as f64 / predicted as f64
    }

    /// Recall of class `c`: TP / truly `c`
    pub fn recall(&self, c: usize) -> f64 {
        let support: usize = self.counts[c].iter().sum();
        if support == 0 {
            return 0.0;
        }
        self.counts[c][c] as f64 / support as f64
    }

    pub fn support(&self, c: usize) -> usize {
        self.counts[c].iter().sum()
    }

    /// Mean of per-class recall over classes that occur
    pub fn balanced_accuracy(&self) -> f64 {
        let present: Vec<usize> = (0..self.nb_classes()).filter(|&c| self.support(c) > 0).collect();
        if present.is_empty() {
            return 0.0;
        }
        present.iter().map(|&c| self.recall(c)).sum::<f64>() / present.len() as f64
    }

    /// Format as a human-readable string
    pub fn format(&self, class_names: &[String]) -> String {
        let name = |c: usize| class_names.get(c).cloned().unwrap_or_else(|| c.to_string());
        let mut output = String::from("Confusion Matrix (rows: actual, columns: predicted)\n");
        output.push_str(&format!("{:>12}", ""));
        for c in 0..self.nb_classes() {
            output.push_str(&format!(" {:>10}", name(c)));
        }
        output.push('\n');
        for (c, row) in self.counts.iter().enumerate() {
            output.push_str(&format!("{:>12}", name(c)));
            for count in row {
                output.push_str(&format!(" {:>10}", count));
            }
            output.push('\n');
        }
        output
    }
}

/// Fraction of positions where `predictions` equals `reference`
pub fn accuracy(predictions: &[usize], reference: &[usize]) -> f64 {
    if reference.is_empty() {
        return 0.0;
    }
    let matching = predictions.iter().zip(reference.iter()).filter(|(p, r)| p == r).count();
    matching as f64 / reference.len() as f64
}

/// Median; even-length inputs average the two middle values
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

/// Summary of repeated scores at one grid point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreBand {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
}

impl ScoreBand {
    pub fn from_scores(scores: &[f64]) -> Option<Self> {
        if scores.is_empty() {
            return None;
        }
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        Some(Self { mean, min, max })
    }
}
