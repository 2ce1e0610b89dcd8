// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Robustness evaluation CLI
//!
//! Usage:
//!   robustness-eval --model ./artifacts/cats_dogs --dataset ./data/cats_dogs --labels cat,dog
//!   robustness-eval --workspace https://store.example.org/aml --model cats_dogs --dataset cats_dogs
//!   robustness-eval --config eval.json

use anyhow::Result;
use clap::Parser;
use robustness_eval::pipeline::{EvaluationConfig, EvaluationPipeline};
use robustness_eval::robustness::ScoreMetric;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "robustness-eval")]
#[command(about = "Score the adversarial robustness of a packaged image classifier")]
#[command(version)]
struct Args {
    /// JSON config file; command-line flags override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Model package directory (or model name in the workspace)
    #[arg(short, long)]
    model: Option<String>,

    /// Dataset directory (or dataset name in the workspace); synthetic when omitted
    #[arg(short, long)]
    dataset: Option<String>,

    /// Artifact store holding models/ and datasets/
    #[arg(short, long)]
    workspace: Option<String>,

    /// Label subdirectories (comma-separated, empty = all)
    #[arg(short, long)]
    labels: Option<String>,

    /// Side length images are resized and cropped to
    #[arg(long)]
    target_size: Option<u32>,

    /// Inner attack (fgsm, bim, pgd, noise)
    #[arg(short, long)]
    attack: Option<String>,

    /// Attack norm (1, 2, inf)
    #[arg(long)]
    norm: Option<String>,

    /// Score tracked over the sample-size grid (robustness-accuracy, half-distortion)
    #[arg(long)]
    grid_metric: Option<ScoreMetric>,

    #[arg(long)]
    nb_intervals: Option<usize>,

    #[arg(long)]
    nb_repeats: Option<usize>,

    /// Random seed for reproducibility
    #[arg(short, long)]
    seed: Option<u64>,

    /// Output directory for results
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> Result<EvaluationConfig> {
        let mut config = match &self.config {
            Some(path) => EvaluationConfig::from_file(path)?,
            None => EvaluationConfig::default(),
        };

        if self.model.is_some() {
            config.model_path = self.model;
        }
        if self.dataset.is_some() {
            config.dataset_path = self.dataset;
        }
        if self.workspace.is_some() {
            config.workspace_url = self.workspace;
        }
        if let Some(labels) = self.labels {
            config.labels = labels
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(size) = self.target_size {
            config.target_size = size;
        }
        if let Some(attack) = self.attack {
            config.attack.method = attack;
        }
        if let Some(norm) = self.norm {
            config.attack.norm = norm;
        }
        if let Some(metric) = self.grid_metric {
            config.grid_metric = metric;
        }
        if let Some(nb_intervals) = self.nb_intervals {
            config.nb_intervals = nb_intervals;
        }
        if let Some(nb_repeats) = self.nb_repeats {
            config.nb_repeats = nb_repeats;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
            config.attack.seed = seed;
        }
        if let Some(output) = self.output {
            config.output_dir = output.to_string_lossy().to_string();
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Args::parse().into_config()?;

    tracing::info!("Adversarial Robustness Evaluation");
    tracing::info!("=================================");
    tracing::info!("Model: {}", config.model_path.as_deref().unwrap_or("-"));
    tracing::info!("Dataset: {}", config.dataset_path.as_deref().unwrap_or("synthetic"));
    tracing::info!("Attack: {} ({} norm)", config.attack.method, config.attack.norm);
    tracing::info!("Seed: {}", config.seed);

    let output_dir = PathBuf::from(&config.output_dir);
    let pipeline = EvaluationPipeline::new(config)?;
    let results = pipeline.run()?;

    println!("\n{}", "=".repeat(60));
    println!("ROBUSTNESS SUMMARY");
    println!("{}", "=".repeat(60));
    println!("{:<32} {:>12.4}", "Clean accuracy", results.clean.accuracy);
    println!("{:<32} {:>12.4}", "Balanced accuracy", results.clean.balanced_accuracy);
    println!(
        "{:<32} {:>12.4}",
        format!("Robustness accuracy ({})", results.config.attack.method),
        results.robustness_accuracy
    );
    println!(
        "{:<32} {:>12.4}",
        format!("Half distortion ({})", results.config.attack.method),
        results.half_distortion
    );

    if !results.grid.is_empty() {
        println!("\n{} by number of samples:", results.config.grid_metric);
        println!("{:-<60}", "");
        println!("{:>10} {:>12} {:>12} {:>12}", "Samples", "Mean", "Min", "Max");
        for point in &results.grid {
            println!(
                "{:>10} {:>12.4} {:>12.4} {:>12.4}",
                point.nb_samples, point.band.mean, point.band.min, point.band.max
            );
        }
        println!("{:-<60}", "");
    }

    let paths = EvaluationPipeline::save_all(&results, &output_dir)?;
    for path in paths {
        println!("Saved: {}", path.display());
    }

    println!("\nEvaluation complete!");
    Ok(())
}
