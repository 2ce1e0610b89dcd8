// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Frozen op graphs with named input and logits nodes
//!
//! A graph is a list of nodes, each consuming the outputs of earlier nodes by
//! name. The classifier path runs from a `Placeholder` to the logits node and
//! must be a single chain; ops after the logits (e.g. a `Softmax` output
//! node) are ignored by the classifier.

use super::{Network, TensorFlowClassifier};
use crate::classifier::Classifier;
use crate::error::{DefenderError, Result};
use crate::nn;
use ndarray::{Array1, Array2, Array4, ArrayD};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op")]
pub enum GraphOp {
    /// Graph input; `shape` excludes the batch axis
    Placeholder { shape: Vec<usize> },
    /// `x · W` with `W` shaped `(in, out)`
    MatMul { weights: Array2<f32> },
    BiasAdd { bias: Array1<f32> },
    Relu,
    Identity,
    Softmax,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub op: GraphOp,
    #[serde(default)]
    pub inputs: Vec<String>,
}

impl GraphNode {
    pub fn new(name: &str, op: GraphOp, inputs: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            op,
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Names of all `Placeholder` nodes
pub fn graph_input_names(nodes: &[GraphNode]) -> Vec<String> {
    nodes
        .iter()
        .filter(|n| matches!(n.op, GraphOp::Placeholder { .. }))
        .map(|n| n.name.clone())
        .collect()
}

/// Names of nodes no other node consumes
pub fn graph_output_names(nodes: &[GraphNode]) -> Vec<String> {
    let consumed: HashSet<&str> = nodes.iter().flat_map(|n| n.inputs.iter().map(String::as_str)).collect();
    nodes
        .iter()
        .filter(|n| !consumed.contains(n.name.as_str()))
        .map(|n| n.name.clone())
        .collect()
}

/// A graph bound to an input node and a logits node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenGraph {
    nodes: Vec<GraphNode>,
    input_node: String,
    logits_node: String,
    #[serde(skip)]
    path: Vec<usize>,
    #[serde(skip)]
    in_features: usize,
    #[serde(skip)]
    out_features: usize,
}

impl FrozenGraph {
    pub fn new(nodes: Vec<GraphNode>, input_node: &str, logits_node: &str) -> Result<Self> {
        let mut graph = Self {
            nodes,
            input_node: input_node.to_string(),
            logits_node: logits_node.to_string(),
            path: Vec::new(),
            in_features: 0,
            out_features: 0,
        };
        graph.resolve()?;
        Ok(graph)
    }

    /// Walk back from the logits node to the input and infer feature widths
    fn resolve(&mut self) -> Result<()> {
        let index: HashMap<&str, usize> = self.nodes.iter().enumerate().map(|(i, n)| (n.name.as_str(), i)).collect();
        let lookup = |name: &str| {
            index
                .get(name)
                .copied()
                .ok_or_else(|| DefenderError::conversion(format!("graph has no node named `{}`", name)))
        };

        let mut path = vec![lookup(self.logits_node.as_str())?];
        loop {
            let node = &self.nodes[path[path.len() - 1]];
            if node.name == self.input_node {
                break;
            }
            match node.inputs.as_slice() {
                [single] => path.push(lookup(single.as_str())?),
                _ => {
                    return Err(DefenderError::conversion(format!(
                        "node `{}` must have exactly one input on the path to `{}`",
                        node.name, self.input_node
                    )))
                }
            }
            if path.len() > self.nodes.len() {
                return Err(DefenderError::conversion("graph contains a cycle"));
            }
        }
        path.reverse();

        let mut width = match &self.nodes[path[0]].op {
            GraphOp::Placeholder { shape } => shape.iter().product::<usize>(),
            _ => {
                return Err(DefenderError::conversion(format!(
                    "input node `{}` is not a placeholder",
                    self.input_node
                )))
            }
        };
        self.in_features = width;
        for &idx in &path[1..] {
            let node = &self.nodes[idx];
            match &node.op {
                GraphOp::MatMul { weights } => {
                    if weights.nrows() != width {
                        return Err(DefenderError::conversion(format!(
                            "`{}` expects {} features, receives {}",
                            node.name,
                            weights.nrows(),
                            width
                        )));
                    }
                    width = weights.ncols();
                }
                GraphOp::BiasAdd { bias } if bias.len() != width => {
                    return Err(DefenderError::conversion(format!(
                        "`{}` bias has {} entries for {} features",
                        node.name,
                        bias.len(),
                        width
                    )));
                }
                GraphOp::Softmax => {
                    return Err(DefenderError::conversion(format!(
                        "`{}` lies before the logits node; logits must be pre-softmax",
                        node.name
                    )));
                }
                GraphOp::Placeholder { .. } => {
                    return Err(DefenderError::conversion(format!("unexpected placeholder `{}`", node.name)));
                }
                _ => {}
            }
        }
        self.out_features = width;
        self.path = path;
        Ok(())
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn input_node(&self) -> &str {
        &self.input_node
    }

    pub fn logits_node(&self) -> &str {
        &self.logits_node
    }

    /// Per-sample input shape declared by the placeholder
    pub fn input_shape(&self) -> Vec<usize> {
        match self.path.first().map(|&i| &self.nodes[i].op) {
            Some(GraphOp::Placeholder { shape }) => shape.clone(),
            _ => Vec::new(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let graph: Self = serde_json::from_reader(std::io::BufReader::new(file))?;
        Self::new(graph.nodes, &graph.input_node, &graph.logits_node)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec(self)?)?;
        Ok(())
    }

    /// Dense graph `Placeholder -> (MatMul -> BiasAdd -> Relu)* -> MatMul -> BiasAdd -> Softmax`
    ///
    /// `widths[0]` must equal the product of `input_shape`.
    pub fn dense(input_shape: &[usize], widths: &[usize], seed: u64) -> Result<Self> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut nodes = vec![GraphNode::new(
            CustomVisionModel::INPUT_NODE,
            GraphOp::Placeholder { shape: input_shape.to_vec() },
            &[],
        )];
        let mut previous = CustomVisionModel::INPUT_NODE.to_string();
        let last = widths.len().saturating_sub(2);
        for (idx, pair) in widths.windows(2).enumerate() {
            let layer = nn::Dense::random(pair[0], pair[1], &mut rng);
            let matmul = format!("dense_{}/MatMul", idx);
            let bias_add = if idx == last {
                CustomVisionModel::LOGITS_NODE.to_string()
            } else {
                format!("dense_{}/BiasAdd", idx)
            };
            nodes.push(GraphNode::new(
                &matmul,
                GraphOp::MatMul { weights: layer.weights.t().to_owned() },
                &[previous.as_str()],
            ));
            nodes.push(GraphNode::new(&bias_add, GraphOp::BiasAdd { bias: layer.bias }, &[matmul.as_str()]));
            previous = bias_add;
            if idx != last {
                let relu = format!("dense_{}/Relu", idx);
                nodes.push(GraphNode::new(&relu, GraphOp::Relu, &[previous.as_str()]));
                previous = relu;
            }
        }
        nodes.push(GraphNode::new(CustomVisionModel::OUTPUT_NODE, GraphOp::Softmax, &[previous.as_str()]));
        Self::new(nodes, CustomVisionModel::INPUT_NODE, CustomVisionModel::LOGITS_NODE)
    }

    fn check_width(&self, x: &Array2<f32>) -> Result<()> {
        if x.ncols() != self.in_features {
            return Err(DefenderError::shape_mismatch(
                format!("{} input features", self.in_features),
                format!("{} input features", x.ncols()),
            ));
        }
        Ok(())
    }

    /// Activations at every node along the path, input first
    fn activations(&self, x: &Array2<f32>) -> Vec<Array2<f32>> {
        let mut acts = Vec::with_capacity(self.path.len());
        acts.push(x.clone());
        for &idx in &self.path[1..] {
            let a = &acts[acts.len() - 1];
            let next = match &self.nodes[idx].op {
                GraphOp::MatMul { weights } => a.dot(weights),
                GraphOp::BiasAdd { bias } => a + bias,
                GraphOp::Relu => nn::relu(a),
                GraphOp::Identity | GraphOp::Placeholder { .. } => a.clone(),
                GraphOp::Softmax => nn::softmax(a),
            };
            acts.push(next);
        }
        acts
    }
}

impl Network for FrozenGraph {
    const FRAMEWORK: &'static str = "tensorflow";

    fn in_features(&self) -> usize {
        self.in_features
    }

    fn out_features(&self) -> usize {
        self.out_features
    }

    fn logits(&self, x: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_width(x)?;
        let mut acts = self.activations(x);
        Ok(acts.pop().unwrap_or_else(|| x.clone()))
    }

    fn input_gradient(&self, x: &Array2<f32>, grad_logits: &Array2<f32>) -> Result<Array2<f32>> {
        self.check_width(x)?;
        let acts = self.activations(x);
        let mut grad = grad_logits.clone();
        for (pos, &idx) in self.path.iter().enumerate().skip(1).rev() {
            grad = match &self.nodes[idx].op {
                GraphOp::MatMul { weights } => grad.dot(&weights.t()),
                GraphOp::Relu => nn::relu_backward(&grad, &acts[pos - 1]),
                _ => grad,
            };
        }
        Ok(grad)
    }
}

/// An exported image classifier: `model.pb.json` graph plus `labels.txt`
///
/// Takes raw `u8` images and scales them to `[0, 1]` before prediction.
#[derive(Debug, Clone)]
pub struct CustomVisionModel {
    pub classifier: TensorFlowClassifier,
    pub labels: Vec<String>,
}

impl CustomVisionModel {
    pub const INPUT_NODE: &'static str = "Placeholder";
    pub const LOGITS_NODE: &'static str = "logits";
    pub const OUTPUT_NODE: &'static str = "model_outputs";
    pub const GRAPH_FILE: &'static str = "model.pb.json";
    pub const LABELS_FILE: &'static str = "labels.txt";

    pub fn load(model_dir: &Path) -> Result<Self> {
        let graph = FrozenGraph::load(&model_dir.join(Self::GRAPH_FILE))?;
        let labels: Vec<String> = std::fs::read_to_string(model_dir.join(Self::LABELS_FILE))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        if labels.len() != graph.out_features() {
            return Err(DefenderError::conversion(format!(
                "{} labels for a graph with {} outputs",
                labels.len(),
                graph.out_features()
            )));
        }
        let input_shape = graph.input_shape();
        let classifier = TensorFlowClassifier::new(graph, input_shape)?.with_clip_values(Some((0.0, 1.0)));
        tracing::debug!("Loaded CustomVision export from {} ({} classes)", model_dir.display(), labels.len());
        Ok(Self { classifier, labels })
    }

    pub fn save(&self, model_dir: &Path) -> Result<()> {
        self.classifier.network().save(&model_dir.join(Self::GRAPH_FILE))?;
        std::fs::write(model_dir.join(Self::LABELS_FILE), self.labels.join("\n"))?;
        Ok(())
    }

    pub fn predict(&self, images: &Array4<u8>) -> Result<Array2<f32>> {
        let scaled: ArrayD<f32> = images.mapv(|v| f32::from(v) / 255.0).into_dyn();
        self.classifier.predict(&scaled)
    }
}
