// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Preprocessing defences applied in front of a classifier
//!
//! Defences are persisted next to a packaged model as a gzip'd JSON list.
//! Gradients pass through them unchanged (straight-through estimate), so
//! gradient attacks still see a usable signal.

use crate::error::{DefenderError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array4, ArrayD, Ix4};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreprocessingDefence {
    /// Quantise inputs to `bit_depth` bits within `clip_values`
    FeatureSqueezing { clip_values: (f32, f32), bit_depth: u8 },
    /// Per-channel median filter over the spatial axes of NHWC batches
    SpatialSmoothing { window_size: usize },
}

impl PreprocessingDefence {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FeatureSqueezing { .. } => "feature_squeezing",
            Self::SpatialSmoothing { .. } => "spatial_smoothing",
        }
    }

    pub fn apply(&self, x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
        match self {
            Self::FeatureSqueezing { clip_values, bit_depth } => Ok(squeeze(x, *clip_values, *bit_depth)),
            Self::SpatialSmoothing { window_size } => smooth(x, *window_size),
        }
    }
}

/// Run `x` through every defence in order
pub fn apply_all(defences: &[PreprocessingDefence], x: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    let mut out = x.clone();
    for defence in defences {
        out = defence.apply(&out)?;
    }
    Ok(out)
}

fn squeeze(x: &ArrayD<f32>, (min, max): (f32, f32), bit_depth: u8) -> ArrayD<f32> {
    let span = max - min;
    if span <= 0.0 {
        return x.clone();
    }
    let levels = ((1u64 << bit_depth.clamp(1, 24)) - 1) as f32;
    x.mapv(|v| {
        let unit = ((v - min) / span).clamp(0.0, 1.0);
        (unit * levels).round() / levels * span + min
    })
}

fn smooth(x: &ArrayD<f32>, window_size: usize) -> Result<ArrayD<f32>> {
    if window_size <= 1 {
        return Ok(x.clone());
    }
    let input = x.view().into_dimensionality::<Ix4>().map_err(|_| {
        DefenderError::shape_mismatch("NHWC batch (4 axes)", format!("{:?}", x.shape()))
    })?;
    let (n, h, w, c) = input.dim();
    let half = window_size / 2;
    let mut window = Vec::with_capacity(window_size * window_size);

    let mut out = Array4::<f32>::zeros((n, h, w, c));
    for b in 0..n {
        for ch in 0..c {
            for i in 0..h {
                for j in 0..w {
                    window.clear();
                    for wi in i.saturating_sub(half)..(i + window_size - half).min(h) {
                        for wj in j.saturating_sub(half)..(j + window_size - half).min(w) {
                            window.push(input[[b, wi, wj, ch]]);
                        }
                    }
                    window.sort_by(|a, b| a.total_cmp(b));
                    out[[b, i, j, ch]] = window[window.len() / 2];
                }
            }
        }
    }
    Ok(out.into_dyn())
}

pub fn encode_defences(defences: &[PreprocessingDefence]) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(defences)?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    Ok(encoder.finish()?)
}

pub fn decode_defences(blob: &[u8]) -> Result<Vec<PreprocessingDefence>> {
    let mut json = Vec::new();
    GzDecoder::new(blob).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Write the defence blob and return its SHA-256 digest
pub fn write_defences(path: &Path, defences: &[PreprocessingDefence]) -> Result<String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let blob = encode_defences(defences)?;
    std::fs::write(path, &blob)?;
    Ok(sha256_hex(&blob))
}

/// Read a defence blob, checking its digest when one is recorded
pub fn read_defences(path: &Path, expected_sha256: Option<&str>) -> Result<Vec<PreprocessingDefence>> {
    let blob = std::fs::read(path)?;
    if let Some(expected) = expected_sha256 {
        let actual = sha256_hex(&blob);
        if actual != expected {
            return Err(DefenderError::Integrity {
                path: path.display().to_string(),
                expected: expected.to_string(),
                actual,
            });
        }
    }
    decode_defences(&blob)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;

    #[test]
    fn test_feature_squeezing_one_bit() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![0.1f32, 0.4, 0.6, 0.9]).expect("shape");
        let defence = PreprocessingDefence::FeatureSqueezing { clip_values: (0.0, 1.0), bit_depth: 1 };
        let out = defence.apply(&x).expect("squeeze");
        assert_eq!(out.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_spatial_smoothing_removes_spike() {
        let mut x = ArrayD::<f32>::zeros(IxDyn(&[1, 3, 3, 1]));
        x[[0, 1, 1, 0]] = 1.0;
        let out = PreprocessingDefence::SpatialSmoothing { window_size: 3 }.apply(&x).expect("smooth");
        assert_eq!(out[[0, 1, 1, 0]], 0.0);
    }

    #[test]
    fn test_spatial_smoothing_requires_nhwc() {
        let x = ArrayD::<f32>::zeros(IxDyn(&[2, 5]));
        assert!(PreprocessingDefence::SpatialSmoothing { window_size: 3 }.apply(&x).is_err());
    }

    #[test]
    fn test_blob_checksum_mismatch_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("data").join("preprocessing_defences.bin");
        let defences = vec![PreprocessingDefence::SpatialSmoothing { window_size: 3 }];
        let digest = write_defences(&path, &defences).expect("write");

        assert_eq!(read_defences(&path, Some(digest.as_str())).expect("read"), defences);
        let err = read_defences(&path, Some("00")).expect_err("checksum mismatch");
        assert!(matches!(err, DefenderError::Integrity { .. }));
    }
}
