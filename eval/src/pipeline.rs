// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Reproducible robustness evaluation of a packaged image classifier
//!
//! Orchestrates:
//! - Dataset loading (image directory, workspace mount, or synthetic)
//! - Model loading and conversion to the classifier interface
//! - Clean accuracy, robustness accuracy and half distortion
//! - Score stability by number of samples
//! - Results serialization (JSON, Markdown, CSV)

use crate::attacks::{AttackConfig, AttackConfigBuilder};
use crate::classifier::{predict_classes, Classifier};
use crate::converter::load_classifier;
use crate::datasets::{discover_labels, load_image_dataset, ImageDataset};
use crate::metrics::{ConfusionMatrix, ScoreBand};
use crate::mount::{mount_dataset, mount_model, MountGuard, Workspace};
use crate::robustness::{half_distortion_with, robustness_accuracy, ScoreMetric};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration for the evaluation pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationConfig {
    /// Random seed for splits and sampling
    pub seed: u64,
    /// Dataset directory, or a dataset name when `workspace_url` is set;
    /// `None` generates a synthetic dataset
    pub dataset_path: Option<String>,
    /// Label subdirectories to load (empty = all)
    pub labels: Vec<String>,
    pub target_size: u32,
    pub file_format: String,
    /// Fraction of the dataset held out for scoring
    pub test_size: f64,
    pub synthetic_samples: usize,
    pub synthetic_classes: usize,
    /// Model package directory, or a model name when `workspace_url` is set
    pub model_path: Option<String>,
    pub workspace_url: Option<String>,
    /// Progressive search and inner attack
    pub attack: AttackConfigBuilder,
    /// Score tracked over the sample-size grid
    pub grid_metric: ScoreMetric,
    pub nb_intervals: usize,
    pub nb_repeats: usize,
    /// Output directory for results
    pub output_dir: String,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            dataset_path: None,
            labels: vec![],
            target_size: 224,
            file_format: "jpg".to_string(),
            test_size: 0.2,
            synthetic_samples: 200,
            synthetic_classes: 2,
            model_path: None,
            workspace_url: None,
            attack: AttackConfigBuilder::default(),
            grid_metric: ScoreMetric::HalfDistortion,
            nb_intervals: 10,
            nb_repeats: 3,
            output_dir: "eval/results".to_string(),
        }
    }
}

impl EvaluationConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    fn workspace(&self) -> Option<Workspace> {
        self.workspace_url.as_deref().map(Workspace::new)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetInfo {
    pub source: String,
    pub class_names: Vec<String>,
    pub image_size: usize,
    pub total_samples: usize,
    pub train_samples: usize,
    pub validation_samples: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub source: String,
    pub framework: String,
    pub nb_classes: usize,
    pub input_shape: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanMetrics {
    pub accuracy: f64,
    pub balanced_accuracy: f64,
    pub confusion_matrix: ConfusionMatrix,
}

/// Scores at one sample size, one per repeat
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridPoint {
    pub nb_samples: usize,
    pub scores: Vec<f64>,
    pub band: ScoreBand,
}

/// Complete evaluation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationResults {
    pub config: EvaluationConfig,
    pub dataset_info: DatasetInfo,
    pub model_info: ModelInfo,
    pub clean: CleanMetrics,
    pub robustness_accuracy: f64,
    pub half_distortion: f64,
    pub grid: Vec<GridPoint>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

/// Sample sizes from 10 (or fewer, for tiny sets) up to `total`, evenly spaced
pub fn sample_size_grid(total: usize, nb_intervals: usize) -> Vec<usize> {
    if total == 0 || nb_intervals == 0 {
        return vec![];
    }
    let start = 10.min(total);
    if nb_intervals == 1 {
        return vec![start];
    }
    let span = (total - start) as f64;
    (0..nb_intervals)
        .map(|i| start + (span * i as f64 / (nb_intervals - 1) as f64) as usize)
        .collect()
}

/// Main evaluation pipeline
pub struct EvaluationPipeline {
    config: EvaluationConfig,
    attack: AttackConfig,
}

impl EvaluationPipeline {
    pub fn new(config: EvaluationConfig) -> Result<Self> {
        let attack = config.attack.build().context("invalid attack configuration")?;
        if !(config.test_size > 0.0 && config.test_size < 1.0) {
            bail!("test_size must lie in (0, 1), got {}", config.test_size);
        }
        Ok(Self { config, attack })
    }

    pub fn config(&self) -> &EvaluationConfig {
        &self.config
    }

    fn load_dataset(&self, workspace: Option<&Workspace>) -> Result<(ImageDataset, String, Option<MountGuard>)> {
        let Some(name) = self.config.dataset_path.as_deref() else {
            tracing::info!(
                "Generating synthetic dataset: {} samples, {} classes, seed {}",
                self.config.synthetic_samples,
                self.config.synthetic_classes,
                self.config.seed
            );
            let dataset = ImageDataset::synthetic(
                self.config.synthetic_samples,
                self.config.target_size as usize,
                self.config.synthetic_classes,
                self.config.seed,
            );
            return Ok((dataset, "synthetic".to_string(), None));
        };

        let guard = mount_dataset(workspace, name).with_context(|| format!("mounting dataset {}", name))?;
        let labels = if self.config.labels.is_empty() {
            discover_labels(guard.path())?
        } else {
            self.config.labels.clone()
        };
        let dataset = load_image_dataset(guard.path(), &labels, self.config.target_size, &self.config.file_format)
            .with_context(|| format!("loading dataset from {}", guard.path().display()))?;
        Ok((dataset, name.to_string(), Some(guard)))
    }

    fn load_model(&self, workspace: Option<&Workspace>) -> Result<(Box<dyn Classifier>, String)> {
        let Some(name) = self.config.model_path.as_deref() else {
            bail!("no model given; set model_path");
        };
        let guard = mount_model(workspace, name).with_context(|| format!("mounting model {}", name))?;
        let classifier =
            load_classifier(guard.path()).with_context(|| format!("loading model package {}", guard.path().display()))?;
        tracing::info!(
            "Model loaded: {} framework, {} classes, input {:?}",
            classifier.framework(),
            classifier.nb_classes(),
            classifier.input_shape()
        );
        Ok((classifier, name.to_string()))
    }

    fn clean_metrics(classifier: &dyn Classifier, dataset: &ImageDataset) -> Result<CleanMetrics> {
        let predictions = predict_classes(classifier, &dataset.float_images())?;
        let matrix = ConfusionMatrix::from_predictions(&predictions, &dataset.labels_usize(), classifier.nb_classes());
        Ok(CleanMetrics {
            accuracy: matrix.accuracy(),
            balanced_accuracy: matrix.balanced_accuracy(),
            confusion_matrix: matrix,
        })
    }

    /// Repeated scores on random subsets of growing size
    pub fn score_by_samples(&self, classifier: &dyn Classifier, dataset: &ImageDataset) -> Result<Vec<GridPoint>> {
        let sizes = sample_size_grid(dataset.len(), self.config.nb_intervals);
        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        let mut scores = vec![Vec::with_capacity(self.config.nb_repeats); sizes.len()];

        let pb = ProgressBar::new((sizes.len() * self.config.nb_repeats) as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("{msg} [{bar:40.cyan/blue}] {pos}/{len} ({eta})") {
            pb.set_style(style.progress_chars("#>-"));
        }
        pb.set_message(self.config.grid_metric.as_str());

        for _ in 0..self.config.nb_repeats {
            for (idx, &nb_samples) in sizes.iter().enumerate() {
                let subset = dataset.sample(nb_samples, &mut rng)?;
                let labels = subset.labels_usize();
                let score = self.config.grid_metric.evaluate(
                    classifier,
                    &subset.float_images(),
                    Some(labels.as_slice()),
                    &self.attack,
                )?;
                scores[idx].push(score);
                pb.inc(1);
            }
        }
        pb.finish_and_clear();

        Ok(sizes
            .into_iter()
            .zip(scores)
            .filter_map(|(nb_samples, scores)| {
                ScoreBand::from_scores(&scores).map(|band| GridPoint {
                    nb_samples,
                    scores,
                    band,
                })
            })
            .collect())
    }

    /// Run the full evaluation pipeline
    pub fn run(&self) -> Result<EvaluationResults> {
        let workspace = self.config.workspace();

        // guards keep mounted files alive until scoring is done
        let (dataset, dataset_source, _dataset_guard) = self.load_dataset(workspace.as_ref())?;
        let (classifier, model_source) = self.load_model(workspace.as_ref())?;

        if dataset.class_names.len() > classifier.nb_classes() {
            bail!(
                "dataset has {} classes but the model predicts {}",
                dataset.class_names.len(),
                classifier.nb_classes()
            );
        }

        let (train, val) = dataset.split_train_val(self.config.test_size, self.config.seed)?;
        tracing::info!(
            "Dataset loaded: {} samples (train={}, val={})",
            dataset.len(),
            train.len(),
            val.len()
        );

        let dataset_info = DatasetInfo {
            source: dataset_source,
            class_names: dataset.class_names.clone(),
            image_size: dataset.image_size(),
            total_samples: dataset.len(),
            train_samples: train.len(),
            validation_samples: val.len(),
        };
        let model_info = ModelInfo {
            source: model_source,
            framework: classifier.framework().to_string(),
            nb_classes: classifier.nb_classes(),
            input_shape: classifier.input_shape().to_vec(),
        };

        let clean = Self::clean_metrics(classifier.as_ref(), &val)?;
        tracing::info!("Clean accuracy: {:.4}", clean.accuracy);

        let images = val.float_images();
        let labels = val.labels_usize();
        let robustness = robustness_accuracy(
            classifier.as_ref(),
            &images,
            Some(labels.as_slice()),
            self.attack.method().as_str(),
        )?;
        tracing::info!("Robustness accuracy ({}): {:.4}", self.attack.method(), robustness);

        let distortion = half_distortion_with(classifier.as_ref(), &images, Some(labels.as_slice()), &self.attack)?;
        tracing::info!("Half distortion ({}): {:.4}", self.attack.method(), distortion);

        let grid = self.score_by_samples(classifier.as_ref(), &val)?;

        Ok(EvaluationResults {
            config: self.config.clone(),
            dataset_info,
            model_info,
            clean,
            robustness_accuracy: robustness,
            half_distortion: distortion,
            grid,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    /// Save results to JSON file
    pub fn save_results(results: &EvaluationResults, output_path: &Path) -> Result<()> {
        std::fs::create_dir_all(output_path.parent().unwrap_or(Path::new(".")))?;
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(output_path, json)?;
        tracing::info!("Results saved to {}", output_path.display());
        Ok(())
    }

    /// Write the sample-size grid as CSV: one row per size, one column per repeat
    pub fn save_grid_csv(results: &EvaluationResults, output_path: &Path) -> Result<()> {
        std::fs::create_dir_all(output_path.parent().unwrap_or(Path::new(".")))?;
        let mut writer = csv::Writer::from_path(output_path)?;

        let nb_repeats = results.grid.first().map_or(0, |p| p.scores.len());
        let mut header = vec!["nb_samples".to_string(), "mean".to_string(), "min".to_string(), "max".to_string()];
        header.extend((0..nb_repeats).map(|i| format!("repeat_{}", i)));
        writer.write_record(&header)?;

        for point in &results.grid {
            let mut row = vec![
                point.nb_samples.to_string(),
                format!("{:.6}", point.band.mean),
                format!("{:.6}", point.band.min),
                format!("{:.6}", point.band.max),
            ];
            row.extend(point.scores.iter().map(|s| format!("{:.6}", s)));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        tracing::info!("Score grid saved to {}", output_path.display());
        Ok(())
    }

    /// Generate a markdown report
    pub fn generate_report(results: &EvaluationResults) -> String {
        let mut report = String::new();

        report.push_str("# Adversarial Robustness Evaluation Report\n\n");
        report.push_str(&format!("**Generated:** {}\n\n", results.timestamp.format("%Y-%m-%d %H:%M:%S UTC")));
        report.push_str(&format!("**Version:** {}\n\n", results.version));

        report.push_str("## Dataset\n\n");
        report.push_str(&format!("- **Source:** {}\n", results.dataset_info.source));
        report.push_str(&format!("- **Classes:** {}\n", results.dataset_info.class_names.join(", ")));
        report.push_str(&format!("- **Image Size:** {}\n", results.dataset_info.image_size));
        report.push_str(&format!(
            "- **Split Sizes:** Train={}, Val={}\n\n",
            results.dataset_info.train_samples, results.dataset_info.validation_samples
        ));

        report.push_str("## Model\n\n");
        report.push_str(&format!("- **Source:** {}\n", results.model_info.source));
        report.push_str(&format!("- **Framework:** {}\n", results.model_info.framework));
        report.push_str(&format!("- **Input Shape:** {:?}\n\n", results.model_info.input_shape));

        report.push_str("## Scores\n\n");
        report.push_str("| Metric | Value |\n");
        report.push_str("|--------|-------|\n");
        report.push_str(&format!("| Clean accuracy | {:.4} |\n", results.clean.accuracy));
        report.push_str(&format!("| Balanced accuracy | {:.4} |\n", results.clean.balanced_accuracy));
        report.push_str(&format!(
            "| Robustness accuracy ({}) | {:.4} |\n",
            results.config.attack.method, results.robustness_accuracy
        ));
        report.push_str(&format!(
            "| Half distortion ({}, {} norm) | {:.4} |\n\n",
            results.config.attack.method, results.config.attack.norm, results.half_distortion
        ));

        report.push_str("### Clean Predictions\n\n");
        report.push_str(&format!(
            "```\n{}```\n\n",
            results.clean.confusion_matrix.format(&results.dataset_info.class_names)
        ));

        if !results.grid.is_empty() {
            report.push_str(&format!("## {} by Number of Samples\n\n", results.config.grid_metric));
            report.push_str("| Samples | Mean | Min | Max |\n");
            report.push_str("|---------|------|-----|-----|\n");
            for point in &results.grid {
                report.push_str(&format!(
                    "| {} | {:.4} | {:.4} | {:.4} |\n",
                    point.nb_samples, point.band.mean, point.band.min, point.band.max
                ));
            }
            report.push('\n');
        }

        report.push_str("## Configuration\n\n");
        report.push_str(&format!(
            "```json\n{}\n```\n",
            serde_json::to_string_pretty(&results.config).unwrap_or_default()
        ));

        report
    }

    /// Write JSON, Markdown and CSV outputs under `output_dir`
    pub fn save_all(results: &EvaluationResults, output_dir: &Path) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(output_dir)?;
        let stem = format!("robustness_{}", results.timestamp.format("%Y%m%d_%H%M%S"));

        let json_path = output_dir.join(format!("{}.json", stem));
        Self::save_results(results, &json_path)?;

        let md_path = output_dir.join(format!("{}.md", stem));
        std::fs::write(&md_path, Self::generate_report(results))?;

        let csv_path = output_dir.join(format!("{}_grid.csv", stem));
        Self::save_grid_csv(results, &csv_path)?;

        Ok(vec![json_path, md_path, csv_path])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{TorchClassifier, TorchModule};
    use crate::converter::save_classifier;

    const IMAGE_SIZE: usize = 4;

    fn packaged_model(dir: &Path, nb_classes: usize) {
        let features = IMAGE_SIZE * IMAGE_SIZE * 3;
        let module = TorchModule::random(&[features, 8, nb_classes], 3).expect("module");
        let classifier = TorchClassifier::new(module, vec![IMAGE_SIZE, IMAGE_SIZE, 3])
            .expect("classifier")
            .with_clip_values(Some((0.0, 1.0)));
        save_classifier(&classifier, dir).expect("save");
    }

    fn config(model_dir: &Path) -> EvaluationConfig {
        EvaluationConfig {
            target_size: IMAGE_SIZE as u32,
            synthetic_samples: 60,
            model_path: Some(model_dir.to_string_lossy().into_owned()),
            attack: AttackConfig::builder().method("fgsm").eps_initial(0.05).eps_increase(0.05),
            nb_intervals: 3,
            nb_repeats: 2,
            ..EvaluationConfig::default()
        }
    }

    #[test]
    fn test_sample_size_grid() {
        assert_eq!(sample_size_grid(100, 4), vec![10, 40, 70, 100]);
        assert_eq!(sample_size_grid(5, 3), vec![5, 5, 5]);
        assert_eq!(sample_size_grid(50, 1), vec![10]);
        assert!(sample_size_grid(0, 3).is_empty());
    }

    #[test]
    fn test_pipeline_synthetic() {
        let model_dir = tempfile::tempdir().expect("tempdir");
        packaged_model(model_dir.path(), 2);

        let pipeline = EvaluationPipeline::new(config(model_dir.path())).expect("pipeline");
        let results = pipeline.run().expect("Pipeline should succeed");

        assert_eq!(results.dataset_info.validation_samples, 12);
        assert_eq!(results.model_info.framework, "pytorch");
        assert!((0.0..=1.0).contains(&results.clean.accuracy));
        assert!((0.0..=1.0).contains(&results.robustness_accuracy));
        assert!(results.half_distortion >= 0.0);
        assert_eq!(results.grid.len(), 3);
        assert_eq!(results.grid[0].nb_samples, 10);
        assert!(results.grid.iter().all(|p| p.scores.len() == 2));
    }

    #[test]
    fn test_pipeline_requires_model() {
        let pipeline = EvaluationPipeline::new(EvaluationConfig {
            synthetic_samples: 20,
            target_size: IMAGE_SIZE as u32,
            ..EvaluationConfig::default()
        })
        .expect("pipeline");
        assert!(pipeline.run().is_err());
    }

    #[test]
    fn test_pipeline_rejects_bad_attack() {
        let config = EvaluationConfig {
            attack: AttackConfig::builder().norm("3"),
            ..EvaluationConfig::default()
        };
        assert!(EvaluationPipeline::new(config).is_err());
    }

    #[test]
    fn test_too_many_dataset_classes() {
        let model_dir = tempfile::tempdir().expect("tempdir");
        packaged_model(model_dir.path(), 2);
        let config = EvaluationConfig {
            synthetic_classes: 3,
            ..config(model_dir.path())
        };
        let err = EvaluationPipeline::new(config).expect("pipeline").run().expect_err("class count");
        assert!(err.to_string().contains("3 classes"));
    }

    #[test]
    fn test_outputs_written() {
        let model_dir = tempfile::tempdir().expect("tempdir");
        packaged_model(model_dir.path(), 2);
        let results = EvaluationPipeline::new(config(model_dir.path()))
            .expect("pipeline")
            .run()
            .expect("run");

        let report = EvaluationPipeline::generate_report(&results);
        assert!(report.contains("Adversarial Robustness Evaluation Report"));
        assert!(report.contains("Half distortion"));
        assert!(report.contains("half-distortion by Number of Samples"));

        let out = tempfile::tempdir().expect("tempdir");
        let paths = EvaluationPipeline::save_all(&results, out.path()).expect("save");
        assert!(paths.iter().all(|p| p.is_file()));

        let csv = std::fs::read_to_string(&paths[2]).expect("csv");
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("nb_samples,mean,min,max,repeat_0,repeat_1"));
        assert_eq!(lines.count(), 3);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"seed": 7, "grid_metric": "robustness-accuracy", "attack": {"method": "bim", "norm": "2"}}"#,
        )
        .expect("write");

        let config = EvaluationConfig::from_file(&path).expect("config");
        assert_eq!(config.seed, 7);
        assert_eq!(config.grid_metric, ScoreMetric::RobustnessAccuracy);
        assert_eq!(config.attack.method, "bim");
        assert_eq!(config.attack.eps_initial, 0.01);
        assert_eq!(config.nb_repeats, 3);
    }
}
