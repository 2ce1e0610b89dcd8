// SPDX-License-Identifier: AGPL-3.0-or-later
// SPDX-FileCopyrightText: 2024 Hyperpolymath

//! Workspace mounts for packaged models and datasets
//!
//! A workspace is an artifact store laid out as:
//! ```text
//! <base>/models/<name>.zip
//! <base>/models/<name>.zip.sha256      optional
//! <base>/datasets/<name>.tar.gz
//! <base>/datasets/<name>.tar.gz.sha256 optional
//! ```
//! `<base>` is an `http(s)://` URL, a `file://` URL or a local directory.
//! Mounted artifacts are extracted into a fresh temporary directory that is
//! removed when the [`MountGuard`] drops. Without a workspace the name is
//! taken as a local path and used in place.

use crate::error::{DefenderError, Result};
use indicatif::{ProgressBar, ProgressStyle};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Model,
    Dataset,
}

impl ArtifactKind {
    fn folder(&self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Dataset => "datasets",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            Self::Model => "zip",
            Self::Dataset => "tar.gz",
        }
    }
}

/// Remote (or local) artifact store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub base_url: String,
}

impl Workspace {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn artifact_url(&self, kind: ArtifactKind, name: &str) -> String {
        format!("{}/{}/{}.{}", self.base_url, kind.folder(), name, kind.extension())
    }

    fn is_remote(&self) -> bool {
        self.base_url.starts_with("http://") || self.base_url.starts_with("https://")
    }

    /// Copy `location` to `output_path`; `Ok(false)` if it does not exist
    fn fetch(&self, location: &str, output_path: &Path) -> Result<bool> {
        if self.is_remote() {
            return download_file(location, output_path);
        }
        let local = Path::new(location.strip_prefix("file://").unwrap_or(location));
        if !local.is_file() {
            return Ok(false);
        }
        std::fs::copy(local, output_path)?;
        Ok(true)
    }
}

/// A mounted artifact; temporary mounts are deleted on drop
#[derive(Debug)]
pub struct MountGuard {
    path: PathBuf,
    _tempdir: Option<TempDir>,
}

impl MountGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when the guard owns (and will delete) the mounted files
    pub fn is_temporary(&self) -> bool {
        self._tempdir.is_some()
    }
}

pub fn mount_model(workspace: Option<&Workspace>, name: &str) -> Result<MountGuard> {
    mount(workspace, name, ArtifactKind::Model)
}

pub fn mount_dataset(workspace: Option<&Workspace>, name: &str) -> Result<MountGuard> {
    mount(workspace, name, ArtifactKind::Dataset)
}

fn mount(workspace: Option<&Workspace>, name: &str, kind: ArtifactKind) -> Result<MountGuard> {
    let Some(workspace) = workspace else {
        let path = PathBuf::from(name);
        if !path.exists() {
            return Err(DefenderError::mount(format!(
                "no workspace given and {} is not a local path",
                name
            )));
        }
        tracing::debug!("Using local {:?} at {}", kind, path.display());
        return Ok(MountGuard { path, _tempdir: None });
    };

    check_artifact_name(name)?;
    let tempdir = tempfile::Builder::new().prefix("robustness-mount-").tempdir()?;
    let archive_path = tempdir.path().join(format!("artifact.{}", kind.extension()));
    let url = workspace.artifact_url(kind, name);

    tracing::info!("Mounting {} from {}", name, url);
    if !workspace.fetch(&url, &archive_path)? {
        return Err(DefenderError::mount(format!("{} not found in workspace", url)));
    }

    let checksum_path = tempdir.path().join("artifact.sha256");
    if workspace.fetch(&format!("{}.sha256", url), &checksum_path)? {
        let expected = std::fs::read_to_string(&checksum_path)?;
        let expected = expected.split_whitespace().next().unwrap_or_default();
        verify_sha256(&archive_path, expected)?;
    }

    let mount_dir = tempdir.path().join(name);
    std::fs::create_dir_all(&mount_dir)?;
    match kind {
        ArtifactKind::Model => extract_zip(&archive_path, &mount_dir)?,
        ArtifactKind::Dataset => extract_tar_gz(&archive_path, &mount_dir)?,
    }
    std::fs::remove_file(&archive_path)?;

    Ok(MountGuard {
        path: mount_dir,
        _tempdir: Some(tempdir),
    })
}

/// Workspace names must stay inside the mount directory
fn check_artifact_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let mut components = path.components().peekable();
    if components.peek().is_none() || !components.all(|c| matches!(c, Component::Normal(_))) {
        return Err(DefenderError::mount(format!(
            "invalid artifact name `{}`: expected a relative name without `..`",
            name
        )));
    }
    Ok(())
}

/// Download `url` to `output_path`; `Ok(false)` on 404
pub fn download_file(url: &str, output_path: &Path) -> Result<bool> {
    tracing::info!("Downloading from: {}", url);

    let mut response = reqwest::blocking::Client::builder()
        .timeout(std::time::Duration::from_secs(600))
        .build()
        .map_err(|e| DefenderError::Download(e.to_string()))?
        .get(url)
        .send()
        .map_err(|e| DefenderError::Download(format!("{}: {}", url, e)))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Ok(false);
    }
    if !response.status().is_success() {
        return Err(DefenderError::Download(format!("{} returned {}", url, response.status())));
    }

    let pb = ProgressBar::new(response.content_length().unwrap_or(0));
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({eta})")
    {
        pb.set_style(style.progress_chars("#>-"));
    }

    let mut file = File::create(output_path)?;
    let mut buffer = [0u8; 8192];
    loop {
        let read = response.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        file.write_all(&buffer[..read])?;
        pb.inc(read as u64);
    }

    pb.finish_with_message("Downloaded");
    Ok(true)
}

/// Check a file against a hex SHA-256 digest
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    let actual = hex::encode(hasher.finalize());
    if !actual.eq_ignore_ascii_case(expected.trim()) {
        tracing::warn!("Checksum mismatch: expected {}, got {}", expected, actual);
        return Err(DefenderError::Integrity {
            path: path.display().to_string(),
            expected: expected.to_string(),
            actual,
        });
    }
    tracing::debug!("Checksum verified: {}", actual);
    Ok(())
}

pub fn extract_zip(archive_path: &Path, output_dir: &Path) -> Result<()> {
    tracing::debug!("Extracting ZIP archive {}", archive_path.display());

    let file = File::open(archive_path)?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| DefenderError::mount(format!("bad zip archive: {}", e)))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|e| DefenderError::mount(format!("bad zip entry {}: {}", i, e)))?;
        // entries escaping the output directory are skipped
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!("Skipping unsafe zip entry {}", entry.name());
            continue;
        };
        let outpath = output_dir.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&outpath)?;
        } else {
            if let Some(parent) = outpath.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut outfile = File::create(&outpath)?;
            std::io::copy(&mut entry, &mut outfile)?;
        }
    }
    Ok(())
}

pub fn extract_tar_gz(archive_path: &Path, output_dir: &Path) -> Result<()> {
    tracing::debug!("Extracting TAR.GZ archive {}", archive_path.display());

    let file = File::open(archive_path)?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive.unpack(output_dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defences::sha256_hex;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn write_model_zip(path: &Path) {
        let file = File::create(path).expect("zip file");
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("MLmodel", options).expect("entry");
        zip.write_all(b"{}").expect("write");
        zip.start_file("data/model.json", options).expect("entry");
        zip.write_all(b"{\"layers\": []}").expect("write");
        zip.finish().expect("finish");
    }

    fn write_dataset_tar(path: &Path, source: &Path) {
        let file = File::create(path).expect("tar file");
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        builder.append_dir_all(".", source).expect("append");
        builder.into_inner().expect("tar").finish().expect("gzip");
    }

    #[test]
    fn test_local_path_without_workspace() {
        let dir = tempfile::tempdir().expect("tempdir");
        let name = dir.path().to_string_lossy().into_owned();
        {
            let guard = mount_model(None, &name).expect("mount");
            assert_eq!(guard.path(), dir.path());
            assert!(!guard.is_temporary());
        }
        assert!(dir.path().exists());
    }

    #[test]
    fn test_missing_name_without_workspace() {
        let err = mount_dataset(None, "cats_and_dogs_small").expect_err("not a path");
        assert!(matches!(err, DefenderError::Mount(_)));
        assert!(err.is_value_error());
    }

    #[test]
    fn test_workspace_model_mount_is_removed_on_drop() {
        let store = tempfile::tempdir().expect("store");
        std::fs::create_dir_all(store.path().join("models")).expect("models dir");
        let archive = store.path().join("models").join("cats_dogs.zip");
        write_model_zip(&archive);
        let digest = sha256_hex(&std::fs::read(&archive).expect("archive bytes"));
        std::fs::write(store.path().join("models").join("cats_dogs.zip.sha256"), format!("{}  cats_dogs.zip\n", digest))
            .expect("sidecar");

        let workspace = Workspace::new(format!("file://{}", store.path().display()));
        let mounted_path;
        {
            let guard = mount_model(Some(&workspace), "cats_dogs").expect("mount");
            mounted_path = guard.path().to_path_buf();
            assert!(guard.is_temporary());
            assert!(mounted_path.join("MLmodel").is_file());
            assert!(mounted_path.join("data").join("model.json").is_file());
        }
        assert!(!mounted_path.exists());
    }

    #[test]
    fn test_workspace_dataset_mount() {
        let source = tempfile::tempdir().expect("source");
        std::fs::create_dir_all(source.path().join("cat")).expect("cat dir");
        std::fs::write(source.path().join("cat").join("a.jpg"), b"not really a jpeg").expect("file");

        let store = tempfile::tempdir().expect("store");
        std::fs::create_dir_all(store.path().join("datasets")).expect("datasets dir");
        write_dataset_tar(&store.path().join("datasets").join("pets.tar.gz"), source.path());

        let workspace = Workspace::new(store.path().to_string_lossy().into_owned());
        let guard = mount_dataset(Some(&workspace), "pets").expect("mount");
        assert!(guard.path().join("cat").join("a.jpg").is_file());
    }

    #[test]
    fn test_workspace_checksum_mismatch() {
        let store = tempfile::tempdir().expect("store");
        std::fs::create_dir_all(store.path().join("models")).expect("models dir");
        write_model_zip(&store.path().join("models").join("m.zip"));
        std::fs::write(store.path().join("models").join("m.zip.sha256"), "deadbeef").expect("sidecar");

        let workspace = Workspace::new(store.path().to_string_lossy().into_owned());
        let err = mount_model(Some(&workspace), "m").expect_err("bad checksum");
        assert!(matches!(err, DefenderError::Integrity { .. }));
    }

    #[test]
    fn test_workspace_missing_artifact() {
        let store = tempfile::tempdir().expect("store");
        let workspace = Workspace::new(store.path().to_string_lossy().into_owned());
        let err = mount_model(Some(&workspace), "nothing").expect_err("missing");
        assert!(matches!(err, DefenderError::Mount(_)));
    }

    #[test]
    fn test_workspace_rejects_escaping_names() {
        let store = tempfile::tempdir().expect("store");
        std::fs::create_dir_all(store.path().join("models")).expect("models dir");
        write_model_zip(&store.path().join("evil.zip"));

        let workspace = Workspace::new(store.path().to_string_lossy().into_owned());
        for name in ["../evil", "/tmp/evil", "", "models/../../evil"] {
            let err = mount_model(Some(&workspace), name).expect_err("escaping name");
            assert!(matches!(err, DefenderError::Mount(_)), "{}: {:?}", name, err);
        }
    }

    #[test]
    fn test_artifact_url() {
        let workspace = Workspace::new("https://store.example.org/aml/");
        assert_eq!(
            workspace.artifact_url(ArtifactKind::Dataset, "pets"),
            "https://store.example.org/aml/datasets/pets.tar.gz"
        );
    }
}
