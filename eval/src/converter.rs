// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Converters from native and packaged models to [`Classifier`]s
//!
//! A converter is picked by the concrete type of the model object. Packaged
//! models are unwrapped to the native object they carry before the check, so
//! a package holding a [`TorchModule`] and a bare [`TorchClassifier`] both
//! resolve to the torch converter. The first registered match wins.

use crate::backend::{CustomVisionModel, FrozenGraph, Network, NetworkClassifier, TensorFlowClassifier, TorchClassifier, TorchModule};
use crate::classifier::{Classifier, Preprocessing};
use crate::defences::{write_defences, PreprocessingDefence};
use crate::error::{DefenderError, Result};
use crate::package::{
    load_model, Flavor, ModelManifest, ModelSignature, PackagedModel, TensorSpec, DATA_DIR, PREPROCESSING_DEFENCES_PATH,
};
use std::any::{Any, TypeId};
use std::path::Path;
use std::sync::OnceLock;

/// Torch flavour state file, relative to the package data directory
pub const TORCH_MODEL_FILE: &str = "model.json";

pub trait Converter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Concrete model types this converter accepts
    fn supported_types(&self) -> Vec<TypeId>;

    fn can_convert(&self, model: &dyn Any) -> bool {
        let target: &dyn Any = match model.downcast_ref::<PackagedModel>() {
            Some(packaged) => packaged.implementation(),
            None => model,
        };
        self.supported_types().contains(&target.type_id())
    }

    fn convert(&self, model: &PackagedModel) -> Result<Box<dyn Classifier>>;

    /// Write `classifier` as a package directory at `path`
    fn save(&self, classifier: &dyn Classifier, path: &Path) -> Result<()>;
}

pub struct TorchConverter;

impl Converter for TorchConverter {
    fn name(&self) -> &'static str {
        "pytorch"
    }

    fn supported_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<TorchModule>(), TypeId::of::<TorchClassifier>()]
    }

    fn convert(&self, model: &PackagedModel) -> Result<Box<dyn Classifier>> {
        if let Some(classifier) = model.downcast::<TorchClassifier>() {
            return Ok(Box::new(classifier.clone()));
        }
        let module = model
            .downcast::<TorchModule>()
            .ok_or_else(|| DefenderError::conversion(format!("{} is not a torch module", model.implementation_type())))?;
        let input_shape = signature_input_shape(model)
            .ok_or_else(|| DefenderError::conversion("pytorch package has no usable input signature"))?;
        Ok(Box::new(build_classifier(module.clone(), input_shape, model)?))
    }

    fn save(&self, classifier: &dyn Classifier, path: &Path) -> Result<()> {
        let torch = classifier
            .as_any()
            .downcast_ref::<TorchClassifier>()
            .ok_or_else(|| DefenderError::conversion(format!("{} is not a torch classifier", classifier.type_name())))?;
        torch.network().save(&path.join(DATA_DIR).join(TORCH_MODEL_FILE))?;
        write_package(
            path,
            Flavor::Pytorch {
                model_data: TORCH_MODEL_FILE.to_string(),
            },
            torch,
            torch.preprocessing(),
            torch.defences(),
        )
    }
}

pub struct TensorFlowConverter;

impl Converter for TensorFlowConverter {
    fn name(&self) -> &'static str {
        "tensorflow"
    }

    fn supported_types(&self) -> Vec<TypeId> {
        vec![TypeId::of::<FrozenGraph>(), TypeId::of::<TensorFlowClassifier>()]
    }

    fn convert(&self, model: &PackagedModel) -> Result<Box<dyn Classifier>> {
        if let Some(classifier) = model.downcast::<TensorFlowClassifier>() {
            return Ok(Box::new(classifier.clone()));
        }
        let graph = model
            .downcast::<FrozenGraph>()
            .ok_or_else(|| DefenderError::conversion(format!("{} is not a frozen graph", model.implementation_type())))?;
        // the placeholder carries a shape when the signature does not
        let input_shape = signature_input_shape(model)
            .or_else(|| Some(graph.input_shape()).filter(|shape| !shape.is_empty()))
            .ok_or_else(|| DefenderError::conversion("tensorflow package has no usable input shape"))?;
        Ok(Box::new(build_classifier(graph.clone(), input_shape, model)?))
    }

    fn save(&self, classifier: &dyn Classifier, path: &Path) -> Result<()> {
        let tf = classifier
            .as_any()
            .downcast_ref::<TensorFlowClassifier>()
            .ok_or_else(|| DefenderError::conversion(format!("{} is not a tensorflow classifier", classifier.type_name())))?;
        tf.network().save(&path.join(DATA_DIR).join(CustomVisionModel::GRAPH_FILE))?;
        write_package(
            path,
            Flavor::Tensorflow {
                graph_file: CustomVisionModel::GRAPH_FILE.to_string(),
            },
            tf,
            tf.preprocessing(),
            tf.defences(),
        )
    }
}

fn signature_input_shape(model: &PackagedModel) -> Option<Vec<usize>> {
    model
        .signature()
        .and_then(|sig| sig.inputs.first())
        .and_then(TensorSpec::sample_shape)
}

fn build_classifier<N: Network>(network: N, input_shape: Vec<usize>, model: &PackagedModel) -> Result<NetworkClassifier<N>> {
    let manifest = model.manifest();

    let declared_classes = manifest
        .signature
        .as_ref()
        .and_then(|sig| sig.outputs.first())
        .and_then(TensorSpec::sample_shape)
        .map(|shape| shape.iter().product::<usize>());
    if let Some(classes) = declared_classes {
        if classes != network.out_features() {
            return Err(DefenderError::conversion(format!(
                "signature declares {} outputs but the {} model emits {}",
                classes,
                N::FRAMEWORK,
                network.out_features()
            )));
        }
    }

    // manifests are deserialised without validation
    let preprocessing = Preprocessing::new(manifest.preprocessing.mean, manifest.preprocessing.std)?;

    Ok(NetworkClassifier::new(network, input_shape)?
        .with_preprocessing(preprocessing)
        .with_clip_values(manifest.clip_values)
        .with_defences(model.defences().to_vec()))
}

fn write_package(
    path: &Path,
    flavor: Flavor,
    classifier: &dyn Classifier,
    preprocessing: Preprocessing,
    defences: &[PreprocessingDefence],
) -> Result<()> {
    let digest = write_defences(&path.join(DATA_DIR).join(PREPROCESSING_DEFENCES_PATH), defences)?;

    let mut manifest = ModelManifest::new(flavor, Some(create_signature(classifier)));
    manifest.preprocessing = preprocessing;
    manifest.clip_values = classifier.clip_values();
    manifest.defences_path = Some(format!("{}/{}", DATA_DIR, PREPROCESSING_DEFENCES_PATH));
    manifest.defences_sha256 = Some(digest);
    manifest.write(path)?;

    tracing::info!(
        "Saved {} package to {} ({} defences)",
        manifest.flavor.name(),
        path.display(),
        defences.len()
    );
    Ok(())
}

/// Signature reconstructed from a classifier's input shape and class count
pub fn create_signature(classifier: &dyn Classifier) -> ModelSignature {
    ModelSignature {
        inputs: vec![TensorSpec::float32(classifier.input_shape())],
        outputs: vec![TensorSpec::float32(&[classifier.nb_classes()])],
    }
}

/// Ordered converter list; lookups return the first match
pub struct ConverterRegistry {
    converters: Vec<Box<dyn Converter>>,
}

impl Default for ConverterRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(TorchConverter)).register(Box::new(TensorFlowConverter));
        registry
    }
}

impl ConverterRegistry {
    pub fn empty() -> Self {
        Self { converters: Vec::new() }
    }

    pub fn register(&mut self, converter: Box<dyn Converter>) -> &mut Self {
        self.converters.push(converter);
        self
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.converters.iter().map(|c| c.name()).collect()
    }

    pub fn select<T: Any>(&self, model: &T) -> Result<&dyn Converter> {
        let any: &dyn Any = model;
        let type_name = match any.downcast_ref::<PackagedModel>() {
            Some(packaged) => packaged.implementation_type(),
            None => std::any::type_name::<T>(),
        };
        self.select_dyn(any, type_name)
    }

    /// Lookup for type-erased models; `type_name` only feeds the error
    pub fn select_dyn(&self, model: &dyn Any, type_name: &str) -> Result<&dyn Converter> {
        let converter = self
            .converters
            .iter()
            .find(|c| c.can_convert(model))
            .ok_or_else(|| DefenderError::UnsupportedModel(type_name.to_string()))?;
        tracing::debug!("Selected {} converter for {}", converter.name(), type_name);
        Ok(converter.as_ref())
    }
}

fn default_registry() -> &'static ConverterRegistry {
    static REGISTRY: OnceLock<ConverterRegistry> = OnceLock::new();
    REGISTRY.get_or_init(ConverterRegistry::default)
}

/// Converter for `model` from the default registry
pub fn select_converter<T: Any>(model: &T) -> Result<&'static dyn Converter> {
    default_registry().select(model)
}

/// Adapt a packaged model to the classifier interface
pub fn create_classifier(model: &PackagedModel) -> Result<Box<dyn Classifier>> {
    select_converter(model)?.convert(model)
}

/// Persist a classifier as a package directory
pub fn save_classifier(classifier: &dyn Classifier, path: &Path) -> Result<()> {
    default_registry()
        .select_dyn(classifier.as_any(), classifier.type_name())?
        .save(classifier, path)
}

/// Load a package directory straight into a classifier
pub fn load_classifier(path: &Path) -> Result<Box<dyn Classifier>> {
    create_classifier(&load_model(path)?)
}
