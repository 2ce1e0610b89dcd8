// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Image dataset loading and preprocessing for robustness evaluation
//!
//! A dataset directory holds one subdirectory per label:
//! ```text
//! <dir>/cat/cat.1.jpg
//! <dir>/dog/dog.1.jpg
//! ```

use crate::error::{DefenderError, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array1, Array4, ArrayD, Axis};
use rand::seq::index;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};

/// Square RGB images with integer labels
#[derive(Debug, Clone)]
pub struct ImageDataset {
    /// `(N, S, S, 3)` pixels
    pub images: Array4<u8>,
    /// `(N,)` indices into `class_names`
    pub labels: Array1<i64>,
    pub class_names: Vec<String>,
}

impl ImageDataset {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Side length of the square images
    pub fn image_size(&self) -> usize {
        self.images.shape()[1]
    }

    pub fn labels_usize(&self) -> Vec<usize> {
        self.labels.iter().map(|&l| l.max(0) as usize).collect()
    }

    /// Pixels scaled to `[0, 1]`
    pub fn float_images(&self) -> ArrayD<f32> {
        to_float_images(&self.images)
    }

    /// Rows at `indices`, in that order
    pub fn subset(&self, indices: &[usize]) -> Self {
        Self {
            images: self.images.select(Axis(0), indices),
            labels: self.labels.select(Axis(0), indices),
            class_names: self.class_names.clone(),
        }
    }

    /// `n` distinct samples drawn at random
    pub fn sample<R: Rng + ?Sized>(&self, n: usize, rng: &mut R) -> Result<Self> {
        if n > self.len() {
            return Err(DefenderError::invalid_dataset(format!(
                "cannot draw {} samples from a dataset of {}",
                n,
                self.len()
            )));
        }
        let indices = index::sample(rng, self.len(), n).into_vec();
        Ok(self.subset(&indices))
    }

    /// Shuffled split; the validation part gets `ceil(N * test_size)` samples
    pub fn split_train_val(&self, test_size: f64, seed: u64) -> Result<(Self, Self)> {
        if !(test_size > 0.0 && test_size < 1.0) {
            return Err(DefenderError::validation("test_size", format!("must lie in (0, 1), got {}", test_size)));
        }
        let mut indices: Vec<usize> = (0..self.len()).collect();
        indices.shuffle(&mut ChaCha8Rng::seed_from_u64(seed));

        let nb_val = ((self.len() as f64) * test_size).ceil() as usize;
        let (val, train) = indices.split_at(nb_val.min(self.len()));
        Ok((self.subset(train), self.subset(val)))
    }

    /// Random images whose brightness depends on the class, labels round-robin
    pub fn synthetic(size: usize, image_size: usize, nb_classes: usize, seed: u64) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let nb_classes = nb_classes.max(1);
        let labels: Array1<i64> = (0..size).map(|i| (i % nb_classes) as i64).collect();
        let step = 200 / nb_classes;

        let mut images = Array4::<u8>::zeros((size, image_size, image_size, 3));
        for (mut image, &label) in images.axis_iter_mut(Axis(0)).zip(labels.iter()) {
            let base = 20 + label as usize * step;
            image.mapv_inplace(|_| (base + rng.gen_range(0..step.max(1))).min(255) as u8);
        }

        Self {
            images,
            labels,
            class_names: (0..nb_classes).map(|c| format!("class_{}", c)).collect(),
        }
    }
}

/// `u8` pixels to `f32` in `[0, 1]`
pub fn to_float_images(images: &Array4<u8>) -> ArrayD<f32> {
    images.mapv(|v| f32::from(v) / 255.0).into_dyn()
}

/// Resize so the short side equals `target_size`, then centre-crop to a square
pub fn resize_and_crop_image(image: &RgbImage, target_size: u32) -> RgbImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 || target_size == 0 {
        return RgbImage::new(target_size, target_size);
    }
    let scale = target_size as f64 / width.min(height) as f64;
    let new_width = ((width as f64 * scale).round() as u32).max(target_size);
    let new_height = ((height as f64 * scale).round() as u32).max(target_size);

    let resized = imageops::resize(image, new_width, new_height, FilterType::Triangle);
    let left = (new_width - target_size) / 2;
    let top = (new_height - target_size) / 2;
    imageops::crop_imm(&resized, left, top, target_size, target_size).to_image()
}

/// Label subdirectories of `dir`, sorted
pub fn discover_labels(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Err(DefenderError::invalid_dataset(format!("{} is not a directory", dir.display())));
    }
    let mut labels = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            labels.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    labels.sort();
    Ok(labels)
}

fn matches_format(path: &Path, file_format: &str) -> bool {
    let wanted = file_format.trim_start_matches('.').to_lowercase();
    let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
        return false;
    };
    ext == wanted || (matches!(wanted.as_str(), "jpg" | "jpeg") && matches!(ext.as_str(), "jpg" | "jpeg"))
}

fn list_images(label_dir: &Path, file_format: &str) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(label_dir)? {
        let path = entry?.path();
        if path.is_file() && matches_format(&path, file_format) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load `<dir>/<label>/*.<file_format>` as `(N, S, S, 3)` images
///
/// Labels are indexed in alphabetical order regardless of the order given.
pub fn load_image_dataset(dir: &Path, labels: &[String], target_size: u32, file_format: &str) -> Result<ImageDataset> {
    if !dir.is_dir() {
        return Err(DefenderError::invalid_dataset(format!("{} is not a directory", dir.display())));
    }
    if labels.is_empty() {
        return Err(DefenderError::invalid_dataset("no labels given"));
    }
    let mut class_names = labels.to_vec();
    class_names.sort();
    class_names.dedup();

    let side = target_size as usize;
    let mut pixels = Vec::new();
    let mut targets = Vec::new();

    for (class_idx, label) in class_names.iter().enumerate() {
        let label_dir = dir.join(label);
        if !label_dir.is_dir() {
            return Err(DefenderError::invalid_dataset(format!(
                "missing label directory {}",
                label_dir.display()
            )));
        }
        let files = list_images(&label_dir, file_format)?;
        tracing::debug!("{}: {} {} files", label, files.len(), file_format);
        for path in files {
            let image = image::open(&path)
                .map_err(|e| DefenderError::Image(format!("{}: {}", path.display(), e)))?
                .to_rgb8();
            pixels.extend_from_slice(resize_and_crop_image(&image, target_size).as_raw());
            targets.push(class_idx as i64);
        }
    }

    if targets.is_empty() {
        return Err(DefenderError::invalid_dataset(format!(
            "no .{} images under {}",
            file_format.trim_start_matches('.'),
            dir.display()
        )));
    }

    let images = Array4::from_shape_vec((targets.len(), side, side, 3), pixels)?;
    tracing::info!(
        "Loaded {} images of {} classes from {}",
        targets.len(),
        class_names.len(),
        dir.display()
    );
    Ok(ImageDataset {
        images,
        labels: Array1::from(targets),
        class_names,
    })
}
