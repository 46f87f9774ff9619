//! Read side: locating per-package archives in unpacked aggregate bundles.
//!
//! An aggregate `<name>.tar` is unpacked with [`unpack_aggregate`], which
//! yields the path of its manifest (`<dest>/<name>/<name>.yaml`). Per-package
//! archives sit next to the manifest under `<recipe>/<variant-id-hex>/`.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use crate::cancel::CancelToken;
use crate::digest;
use crate::error::{BundleError, BundleResult};
use crate::manifest::Manifest;
use crate::run::ARCHIVE_FILE_NAME;
use crate::variant::VariantId;

/// Where a variant's archive lives and what it must hash to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEntry {
    /// Manifest path of the bundle the entry came from.
    pub bundle: PathBuf,
    /// Per-package `bundle.tgz`.
    pub archive: PathBuf,
    /// Expected lowercase hex SHA-256 of `archive`.
    pub digest: String,
}

impl ResolvedEntry {
    /// Recompute the archive digest and compare it with the manifest.
    pub fn verify(&self) -> BundleResult<()> {
        let actual =
            digest::sha256_file(&self.archive).map_err(|e| BundleError::io(&self.archive, e))?;
        if actual != self.digest {
            return Err(BundleError::DigestMismatch {
                path: self.archive.clone(),
                expected: self.digest.clone(),
                actual,
            });
        }
        Ok(())
    }

    /// Verify the archive, then extract it into `workspace`.
    pub fn unpack_into(&self, workspace: &Path, cancel: &CancelToken) -> BundleResult<()> {
        self.verify()?;
        cancel.check()?;

        let file = File::open(&self.archive).map_err(|e| BundleError::io(&self.archive, e))?;
        let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        archive.set_preserve_mtime(false);
        archive
            .unpack(workspace)
            .map_err(|e| BundleError::io(workspace, e))?;

        tracing::debug!(
            archive = %self.archive.display(),
            workspace = %workspace.display(),
            "unpacked bundled workspace"
        );
        Ok(())
    }
}

/// Resolves variant ids against a set of loaded bundles.
#[derive(Debug, Clone, Default)]
pub struct Unbundler {
    bundles: Vec<(PathBuf, Manifest)>,
}

impl Unbundler {
    /// Bundles are searched in the given order.
    pub fn new<I>(bundles: I) -> Self
    where
        I: IntoIterator<Item = (PathBuf, Manifest)>,
    {
        Self {
            bundles: bundles.into_iter().collect(),
        }
    }

    /// Load and append one bundle manifest.
    ///
    /// A malformed manifest fails only this call; bundles added earlier stay
    /// usable.
    pub fn add_bundle(&mut self, manifest_path: impl Into<PathBuf>) -> BundleResult<()> {
        let path = manifest_path.into();
        let manifest = Manifest::load(&path)?;
        self.bundles.push((path, manifest));
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// First entry for `variant` across all bundles, or `None`.
    pub fn get_from_bundle(&self, variant: &VariantId) -> Option<ResolvedEntry> {
        let hex = variant.to_hex();
        self.bundles.iter().find_map(|(bundle, manifest)| {
            let entry = manifest.get(&hex)?;
            let dir = bundle.parent().unwrap_or_else(|| Path::new(""));
            Some(ResolvedEntry {
                bundle: bundle.clone(),
                archive: dir.join(&entry.name).join(&hex).join(ARCHIVE_FILE_NAME),
                digest: entry.digest_sha256.clone(),
            })
        })
    }
}

/// Extract an aggregate bundle into `dest` and return its manifest path.
pub fn unpack_aggregate(bundle: &Path, dest: &Path) -> BundleResult<PathBuf> {
    let name = bundle
        .file_stem()
        .and_then(|s| s.to_str())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BundleError::config(format!("invalid bundle file {}", bundle.display())))?;

    let file = File::open(bundle).map_err(|e| BundleError::io(bundle, e))?;
    let mut archive = tar::Archive::new(BufReader::new(file));
    archive
        .unpack(dest)
        .map_err(|e| BundleError::io(bundle, e))?;

    let manifest = dest.join(name).join(format!("{name}.yaml"));
    if !manifest.is_file() {
        return Err(BundleError::InvalidManifest {
            path: Some(manifest),
            message: "manifest missing from bundle".into(),
        });
    }
    Ok(manifest)
}
