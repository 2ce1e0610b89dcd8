// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Model backends and the classifier adapter they share
//!
//! - [`torch`]: sequential dense modules stored as a JSON state dict
//! - [`tensorflow`]: frozen op graphs with named input and logits nodes

pub mod tensorflow;
pub mod torch;

use crate::classifier::{check_input, join_dims, Classifier, Preprocessing};
use crate::defences::{apply_all, PreprocessingDefence};
use crate::error::{DefenderError, Result};
use crate::nn;
use ndarray::{Array2, ArrayD};
use std::any::Any;

pub use tensorflow::{CustomVisionModel, FrozenGraph, GraphNode, GraphOp};
pub use torch::TorchModule;

/// A native network that maps flat feature rows to logits
pub trait Network: Send + Sync + 'static {
    const FRAMEWORK: &'static str;

    fn in_features(&self) -> usize;

    fn out_features(&self) -> usize;

    fn logits(&self, x: &Array2<f32>) -> Result<Array2<f32>>;

    /// Back-propagate `grad_logits` to the network input
    fn input_gradient(&self, x: &Array2<f32>, grad_logits: &Array2<f32>) -> Result<Array2<f32>>;
}

/// Classifier adapter over a backend network
///
/// Inputs go through the preprocessing defences, are flattened, normalised,
/// and fed to the network; probabilities are the softmax of its logits.
#[derive(Debug, Clone)]
pub struct NetworkClassifier<N> {
    network: N,
    input_shape: Vec<usize>,
    nb_classes: usize,
    preprocessing: Preprocessing,
    clip_values: Option<(f32, f32)>,
    defences: Vec<PreprocessingDefence>,
}

pub type TorchClassifier = NetworkClassifier<TorchModule>;
pub type TensorFlowClassifier = NetworkClassifier<FrozenGraph>;

impl<N: Network> NetworkClassifier<N> {
    pub fn new(network: N, input_shape: Vec<usize>) -> Result<Self> {
        let features: usize = input_shape.iter().product();
        if input_shape.is_empty() || features != network.in_features() {
            return Err(DefenderError::conversion(format!(
                "{} network takes {} features but input shape [{}] has {}",
                N::FRAMEWORK,
                network.in_features(),
                join_dims(&input_shape),
                features
            )));
        }
        let nb_classes = network.out_features();
        Ok(Self {
            network,
            input_shape,
            nb_classes,
            preprocessing: Preprocessing::default(),
            clip_values: None,
            defences: Vec::new(),
        })
    }

    pub fn with_preprocessing(mut self, preprocessing: Preprocessing) -> Self {
        self.preprocessing = preprocessing;
        self
    }

    pub fn with_clip_values(mut self, clip_values: Option<(f32, f32)>) -> Self {
        self.clip_values = clip_values;
        self
    }

    pub fn with_defences(mut self, defences: Vec<PreprocessingDefence>) -> Self {
        self.defences = defences;
        self
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn preprocessing(&self) -> Preprocessing {
        self.preprocessing
    }

    pub fn defences(&self) -> &[PreprocessingDefence] {
        &self.defences
    }

    fn network_input(&self, x: &ArrayD<f32>) -> Result<Array2<f32>> {
        check_input(self, x)?;
        let defended = apply_all(&self.defences, x)?;
        Ok(self.preprocessing.apply(&nn::flatten(&defended)?))
    }
}

impl<N: Network> Classifier for NetworkClassifier<N> {
    fn predict(&self, x: &ArrayD<f32>) -> Result<Array2<f32>> {
        let input = self.network_input(x)?;
        Ok(nn::softmax(&self.network.logits(&input)?))
    }

    fn loss_gradient(&self, x: &ArrayD<f32>, labels: &[usize]) -> Result<ArrayD<f32>> {
        let input = self.network_input(x)?;
        let logits = self.network.logits(&input)?;
        let grad_logits = nn::cross_entropy_grad(&logits, labels)?;
        let grad = self.network.input_gradient(&input, &grad_logits)?;
        nn::unflatten(self.preprocessing.backward(&grad), &self.input_shape)
    }

    fn nb_classes(&self) -> usize {
        self.nb_classes
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn clip_values(&self) -> Option<(f32, f32)> {
        self.clip_values
    }

    fn framework(&self) -> &'static str {
        N::FRAMEWORK
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
