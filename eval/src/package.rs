// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Packaged model directories
//!
//! Layout:
//! ```text
//! <dir>/MLmodel                          manifest (JSON, readable as YAML)
//! <dir>/data/model.json                  pytorch flavour module
//! <dir>/data/model.pb.json               tensorflow flavour graph
//! <dir>/data/preprocessing_defences.bin  gzip'd defence list
//! ```

use crate::backend::{FrozenGraph, TorchModule};
use crate::classifier::Preprocessing;
use crate::defences::{read_defences, PreprocessingDefence};
use crate::error::{DefenderError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::path::{Component, Path, PathBuf};

pub const MANIFEST_FILE: &str = "MLmodel";
pub const DATA_DIR: &str = "data";
/// Defence blob location, relative to [`DATA_DIR`]
pub const PREPROCESSING_DEFENCES_PATH: &str = "preprocessing_defences.bin";

/// Tensor type and shape; `-1` marks a variable (batch) dimension
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSpec {
    pub dtype: String,
    pub shape: Vec<i64>,
}

impl TensorSpec {
    /// Batched float32 spec for a per-sample shape
    pub fn float32(sample_shape: &[usize]) -> Self {
        let mut shape = Vec::with_capacity(sample_shape.len() + 1);
        shape.push(-1);
        shape.extend(sample_shape.iter().map(|&d| d as i64));
        Self {
            dtype: "float32".to_string(),
            shape,
        }
    }

    /// Per-sample shape, if the spec is batched and every other dimension is fixed
    pub fn sample_shape(&self) -> Option<Vec<usize>> {
        match self.shape.split_first() {
            Some((&-1, rest)) if !rest.is_empty() && rest.iter().all(|&d| d > 0) => {
                Some(rest.iter().map(|&d| d as usize).collect())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSignature {
    pub inputs: Vec<TensorSpec>,
    pub outputs: Vec<TensorSpec>,
}

/// Backend section of the manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Flavor {
    Pytorch { model_data: String },
    Tensorflow { graph_file: String },
}

impl Flavor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pytorch { .. } => "pytorch",
            Self::Tensorflow { .. } => "tensorflow",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelManifest {
    pub artifact_path: String,
    pub flavor: Flavor,
    #[serde(default)]
    pub signature: Option<ModelSignature>,
    #[serde(default)]
    pub preprocessing: Preprocessing,
    #[serde(default)]
    pub clip_values: Option<(f32, f32)>,
    #[serde(default)]
    pub defences_path: Option<String>,
    #[serde(default)]
    pub defences_sha256: Option<String>,
    pub utc_time_created: DateTime<Utc>,
}

impl ModelManifest {
    pub fn new(flavor: Flavor, signature: Option<ModelSignature>) -> Self {
        Self {
            artifact_path: "model".to_string(),
            flavor,
            signature,
            preprocessing: Preprocessing::default(),
            clip_values: None,
            defences_path: None,
            defences_sha256: None,
            utc_time_created: Utc::now(),
        }
    }

    pub fn read(model_dir: &Path) -> Result<Self> {
        let path = model_dir.join(MANIFEST_FILE);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            DefenderError::conversion(format!("cannot read manifest {}: {}", path.display(), e))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, model_dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(model_dir)?;
        let path = model_dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(self)?)?;
        Ok(path)
    }
}

/// A loaded package: manifest plus the native model object it wraps
pub struct PackagedModel {
    root: Option<PathBuf>,
    manifest: ModelManifest,
    implementation: Box<dyn Any + Send + Sync>,
    implementation_type: &'static str,
    defences: Vec<PreprocessingDefence>,
}

impl std::fmt::Debug for PackagedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackagedModel")
            .field("root", &self.root)
            .field("flavor", &self.manifest.flavor.name())
            .field("implementation", &self.implementation_type)
            .field("defences", &self.defences.len())
            .finish()
    }
}

impl PackagedModel {
    /// Wrap an already-loaded native model
    pub fn from_parts<T: Any + Send + Sync>(
        manifest: ModelManifest,
        implementation: T,
        defences: Vec<PreprocessingDefence>,
    ) -> Self {
        Self {
            root: None,
            manifest,
            implementation: Box::new(implementation),
            implementation_type: std::any::type_name::<T>(),
            defences,
        }
    }

    pub fn load(model_dir: &Path) -> Result<Self> {
        let manifest = ModelManifest::read(model_dir)?;
        let data_dir = model_dir.join(DATA_DIR);

        let (implementation, implementation_type): (Box<dyn Any + Send + Sync>, _) = match &manifest.flavor {
            Flavor::Pytorch { model_data } => (
                Box::new(TorchModule::load(&package_file(&data_dir, model_data)?)?),
                std::any::type_name::<TorchModule>(),
            ),
            Flavor::Tensorflow { graph_file } => (
                Box::new(FrozenGraph::load(&package_file(&data_dir, graph_file)?)?),
                std::any::type_name::<FrozenGraph>(),
            ),
        };

        let defences = match &manifest.defences_path {
            Some(rel) => read_defences(&package_file(model_dir, rel)?, manifest.defences_sha256.as_deref())?,
            None => Vec::new(),
        };

        tracing::debug!(
            "Loaded {} package from {} ({} defences)",
            manifest.flavor.name(),
            model_dir.display(),
            defences.len()
        );

        Ok(Self {
            root: Some(model_dir.to_path_buf()),
            manifest,
            implementation,
            implementation_type,
            defences,
        })
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn manifest(&self) -> &ModelManifest {
        &self.manifest
    }

    pub fn signature(&self) -> Option<&ModelSignature> {
        self.manifest.signature.as_ref()
    }

    pub fn defences(&self) -> &[PreprocessingDefence] {
        &self.defences
    }

    pub fn implementation(&self) -> &(dyn Any + Send + Sync) {
        self.implementation.as_ref()
    }

    /// Type name of the wrapped native model
    pub fn implementation_type(&self) -> &'static str {
        self.implementation_type
    }

    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.implementation.downcast_ref::<T>()
    }
}

/// `base/relative`, refusing manifest paths that leave the package
fn package_file(base: &Path, relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    let inside = path.components().next().is_some() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !inside {
        return Err(DefenderError::conversion(format!(
            "manifest path `{}` must be relative to the package and free of `..`",
            relative
        )));
    }
    Ok(base.join(path))
}

/// Load a packaged model directory
pub fn load_model(model_dir: &Path) -> Result<PackagedModel> {
    PackagedModel::load(model_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_spec_sample_shape() {
        assert_eq!(TensorSpec::float32(&[224, 224, 3]).sample_shape(), Some(vec![224, 224, 3]));
        let unbatched = TensorSpec { dtype: "float32".to_string(), shape: vec![224, 224, 3] };
        assert_eq!(unbatched.sample_shape(), None);
        let dynamic = TensorSpec { dtype: "float32".to_string(), shape: vec![-1, -1, 3] };
        assert_eq!(dynamic.sample_shape(), None);
    }

    #[test]
    fn test_manifest_roundtrip_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signature = ModelSignature {
            inputs: vec![TensorSpec::float32(&[4])],
            outputs: vec![TensorSpec::float32(&[2])],
        };
        let manifest = ModelManifest::new(Flavor::Pytorch { model_data: "model.json".to_string() }, Some(signature));
        manifest.write(dir.path()).expect("write");

        let text = std::fs::read_to_string(dir.path().join(MANIFEST_FILE)).expect("manifest text");
        assert!(text.contains("\"name\": \"pytorch\""));
        assert_eq!(ModelManifest::read(dir.path()).expect("read"), manifest);
    }

    #[test]
    fn test_load_missing_manifest() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_model(dir.path()).expect_err("no manifest");
        assert!(matches!(err, DefenderError::Conversion(_)));
    }

    #[test]
    fn test_load_rejects_paths_outside_package() {
        let dir = tempfile::tempdir().expect("tempdir");
        TorchModule::random(&[4, 2], 1)
            .expect("module")
            .save(&dir.path().join(DATA_DIR).join("model.json"))
            .expect("save module");
        std::fs::write(dir.path().join("secret.bin"), b"not a defence blob").expect("write");

        let flavor = Flavor::Pytorch { model_data: "model.json".to_string() };
        for escaping in ["../secret.bin", "/etc/hostname"] {
            let mut manifest = ModelManifest::new(flavor.clone(), None);
            manifest.defences_path = Some(escaping.to_string());
            manifest.write(dir.path()).expect("write manifest");
            let err = load_model(dir.path()).err().expect("escaping defences path");
            assert!(matches!(err, DefenderError::Conversion(ref msg) if msg.contains(escaping)));
        }

        let manifest = ModelManifest::new(Flavor::Pytorch { model_data: "../model.json".to_string() }, None);
        manifest.write(dir.path()).expect("write manifest");
        assert!(matches!(load_model(dir.path()).err(), Some(DefenderError::Conversion(_))));
    }
}
