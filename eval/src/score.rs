// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Standalone scorer
//!
//! Computes one robustness score for a packaged model on a dataset

use anyhow::{Context, Result};
use clap::Parser;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use robustness_eval::attacks::{AttackConfig, AttackName};
use robustness_eval::classifier::predict_classes;
use robustness_eval::converter::load_classifier;
use robustness_eval::datasets::{discover_labels, load_image_dataset, ImageDataset};
use robustness_eval::metrics;
use robustness_eval::mount::{mount_dataset, mount_model, Workspace};
use robustness_eval::robustness::ScoreMetric;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "score-model")]
#[command(about = "Compute a single robustness score")]
#[command(version)]
struct Args {
    /// Model package directory (or model name in the workspace)
    #[arg(short, long, required_unless_present = "list")]
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

    #[arg(long, default_value_t = 224)]
    target_size: u32,

    #[arg(long, default_value = "jpg")]
    file_format: String,

    /// robustness-accuracy or half-distortion
    #[arg(long, default_value = "robustness-accuracy")]
    metric: ScoreMetric,

    /// Attack to run (fgsm, bim, pgd, noise)
    #[arg(short, long, default_value = "fgsm")]
    attack: String,

    /// Attack norm (1, 2, inf); half distortion only
    #[arg(long, default_value = "inf")]
    norm: String,

    /// Starting budget of the progressive search; half distortion only
    #[arg(long, default_value_t = 0.01)]
    eps_initial: f32,

    /// Budget added per progressive round; half distortion only
    #[arg(long, default_value_t = 0.01)]
    eps_increase: f32,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    /// Score a random subset of this many samples
    #[arg(long)]
    max_samples: Option<usize>,

    /// Score against the model's clean predictions instead of the dataset labels
    #[arg(long)]
    unlabelled: bool,

    /// Random seed
    #[arg(short, long, default_value_t = 42)]
    seed: u64,

    /// Number of samples for the synthetic dataset
    #[arg(short, long, default_value_t = 100)]
    num_samples: usize,

    /// List available attacks
    #[arg(long)]
    list: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    if args.list {
        println!("Available attacks:");
        println!("------------------");
        for attack in AttackName::ALL {
            println!("  {}", attack);
        }
        return Ok(());
    }

    let config = AttackConfig::builder()
        .method(&args.attack)
        .norm(&args.norm)
        .eps_initial(args.eps_initial)
        .eps_increase(args.eps_increase)
        .batch_size(args.batch_size)
        .seed(args.seed)
        .build()?;

    let workspace = args.workspace.as_deref().map(Workspace::new);
    let model_name = args.model.as_deref().context("--model is required")?;
    let classifier = {
        let guard = mount_model(workspace.as_ref(), model_name)?;
        load_classifier(guard.path()).with_context(|| format!("loading {}", model_name))?
    };

    let mut dataset = match args.dataset.as_deref() {
        Some(name) => {
            let guard = mount_dataset(workspace.as_ref(), name)?;
            let labels = match &args.labels {
                Some(labels) => labels.split(',').map(|s| s.trim().to_string()).collect(),
                None => discover_labels(guard.path())?,
            };
            load_image_dataset(guard.path(), &labels, args.target_size, &args.file_format)?
        }
        None => {
            tracing::info!("Generating synthetic dataset ({} samples, seed={})", args.num_samples, args.seed);
            ImageDataset::synthetic(
                args.num_samples,
                args.target_size as usize,
                classifier.nb_classes(),
                args.seed,
            )
        }
    };

    if let Some(max_samples) = args.max_samples {
        if max_samples < dataset.len() {
            dataset = dataset.sample(max_samples, &mut ChaCha8Rng::seed_from_u64(args.seed))?;
        }
    }

    let images = dataset.float_images();
    let labels = dataset.labels_usize();

    println!("\nModel: {} ({} classes)", model_name, classifier.nb_classes());
    println!("Dataset: {} samples, classes: {}", dataset.len(), dataset.class_names.join(", "));
    let clean = metrics::accuracy(&predict_classes(classifier.as_ref(), &images)?, &labels);
    println!("Clean accuracy: {:.4}", clean);

    let reference = if args.unlabelled { None } else { Some(labels.as_slice()) };
    let score = args.metric.evaluate(classifier.as_ref(), &images, reference, &config)?;

    println!("{}", "-".repeat(50));
    println!("{}: {:.4}", args.metric.describe(&config), score);
    Ok(())
}
