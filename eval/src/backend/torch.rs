// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Sequential dense modules (linear layers with ReLU between them)

use super::Network;
use crate::error::{DefenderError, Result};
use crate::nn::{self, Dense};
use ndarray::{concatenate, Array2, Axis};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Feed-forward module; the last layer emits logits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorchModule {
    layers: Vec<Dense>,
}

impl TorchModule {
    pub fn new(layers: Vec<Dense>) -> Result<Self> {
        if layers.is_empty() {
            return Err(DefenderError::conversion("torch module has no layers"));
        }
        for (idx, layer) in layers.iter().enumerate() {
            if layer.bias.len() != layer.out_features() {
                return Err(DefenderError::conversion(format!(
                    "layer {} has {} outputs but a bias of length {}",
                    idx,
                    layer.out_features(),
                    layer.bias.len()
                )));
            }
        }
        for (idx, pair) in layers.windows(2).enumerate() {
            if pair[0].out_features() != pair[1].in_features() {
                return Err(DefenderError::conversion(format!(
                    "layer {} emits {} features but layer {} expects {}",
                    idx,
                    pair[0].out_features(),
                    idx + 1,
                    pair[1].in_features()
                )));
            }
        }
        Ok(Self { layers })
    }

    /// Randomly initialised module with the given layer widths (input first)
    pub fn random(widths: &[usize], seed: u64) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let layers = widths
            .windows(2)
            .map(|pair| Dense::random(pair[0], pair[1], &mut rng))
            .collect();
        Self::new(layers)
    }

    pub fn layers(&self) -> &[Dense] {
        &self.layers
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let module: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        // re-validate layer shapes on untrusted input
        Self::new(module.layers)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Forward pass keeping every pre-activation for the backward pass
    fn forward_cached(&self, x: &Array2<f32>) -> (Vec<Array2<f32>>, Array2<f32>) {
        let mut pre_activations = Vec::with_capacity(self.layers.len());
        let mut activation = x.clone();
        let last = self.layers.len() - 1;
        for (idx, layer) in self.layers.iter().enumerate() {
            let z = layer.forward(&activation);
            if idx < last {
                activation = nn::relu(&z);
            }
            pre_activations.push(z);
        }
        let logits = pre_activations.pop().unwrap_or_else(|| x.clone());
        (pre_activations, logits)
    }

    fn check_width(&self, x: &Array2<f32>) -> Result<()> {
        if x.ncols() != self.in_features() {
            return Err(DefenderError::shape_mismatch(
                format!("{} input features", self.in_features()),
                format!("{} input features", x.ncols()),
            ));
        }
        Ok(())
    }
}

impl Network for TorchModule {
    const FRAMEWORK: &'static str = "pytorch";

    fn in_features(&self) -> usize {
        self.layers.first().map_or(0, Dense::in_features)
    }

    fn out_features(&self) -> usize {
        self.layers.last().map_or(0, Dense::out_features)
    }

    fn logits(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_width(x)?;
        Ok(self.forward_cached(x).1)
    }

    fn input_gradient(&self, x: &Array2<f32>, grad_logits: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_width(x)?;
        let (hidden, _) = self.forward_cached(x);
        let mut grad = grad_logits.clone();
        for idx in (0..self.layers.len()).rev() {
            grad = self.layers[idx].backward_input(&grad);
            if idx > 0 {
                grad = nn::relu_backward(&grad, &hidden[idx - 1]);
            }
        }
        Ok(grad)
    }
}

/// Batched forward pass, optionally softmax-normalising each row
pub fn predict(module: &TorchModule, data: &Array2<f32>, batch_size: usize, normalize: bool) -> Result<Array2<f32>> {
    if batch_size == 0 {
        return Err(DefenderError::validation("batch_size", "must be positive"));
    }
    let outputs = data
        .axis_chunks_iter(Axis(0), batch_size)
        .map(|batch| {
            let logits = module.logits(&batch.to_owned())?;
            Ok(if normalize { nn::softmax(&logits) } else { logits })
        })
        .collect::<Result<Vec<_>>>()?;
    if outputs.is_empty() {
        return Ok(Array2::zeros((0, module.out_features())));
    }
    let views: Vec<_> = outputs.iter().map(|o| o.view()).collect();
    Ok(concatenate(Axis(0), &views)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_rejects_unchained_layers() {
        let a = Dense::new(Array2::zeros((4, 3)), ndarray::Array1::zeros(4)).expect("layer");
        let b = Dense::new(Array2::zeros((2, 5)), ndarray::Array1::zeros(2)).expect("layer");
        assert!(TorchModule::new(vec![a, b]).is_err());
        assert!(TorchModule::new(vec![]).is_err());
    }

    #[test]
    fn test_rejects_bias_width_mismatch() {
        let layer = Dense {
            weights: Array2::zeros((2, 4)),
            bias: ndarray::Array1::zeros(3),
        };
        let err = TorchModule::new(vec![layer]).expect_err("bad bias");
        assert!(matches!(err, DefenderError::Conversion(_)));
    }

    #[test]
    fn test_predict_batches_preserve_rows() {
        let module = TorchModule::random(&[3, 5, 3], 1).expect("module");
        let data = array![[1.0f32, 1.0, 1.0], [2.0, 2.0, 2.0], [3.0, 3.0, 3.0], [4.0, 4.0, 4.0]];

        let whole = predict(&module, &data, 10, false).expect("predict");
        let batched = predict(&module, &data, 3, false).expect("predict");
        assert_eq!(batched.dim(), (4, 3));
        for (a, b) in whole.iter().zip(batched.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_predict_normalizer() {
        let module = TorchModule::random(&[3, 3], 2).expect("module");
        let data = array![[1.0f32, 1.0, 1.0], [2.0, 2.0, 2.0]];
        let probs = predict(&module, &data, 10, true).expect("predict");
        for row in probs.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("model.json");
        let module = TorchModule::random(&[4, 2], 3).expect("module");
        module.save(&path).expect("save");
        let loaded = TorchModule::load(&path).expect("load");
        assert_eq!(loaded.layers().len(), 1);
        for (a, b) in loaded.layers()[0].weights.iter().zip(module.layers()[0].weights.iter()) {
            assert!((a - b).abs() < 1e-6);
        }
    }
}
