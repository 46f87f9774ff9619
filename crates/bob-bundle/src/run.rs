//! Bundle orchestration.
//!
//! A [`BundleRun`] collects per-package archives into a private staging
//! directory and, on [`finalize`](BundleRun::finalize), packs them together
//! with the manifest into `<name>.tar`:
//!
//! ```text
//! <name>/<name>.yaml
//! <name>/<recipe>/<variant-id-hex>/bundle.tgz
//! ```
//!
//! `bundle()` takes `&self`, so any number of packages can be encoded
//! concurrently from one task. `finalize()` takes `self`, so it can only run
//! once every outstanding `bundle()` future has completed, and the run cannot
//! be used again afterwards.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use globset::GlobSet;
use tar::{Builder, Header, HeaderMode};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::config::BundleConfig;
use crate::encoder::{canonicalize_header, encode_workspace};
use crate::error::{BundleError, BundleResult};
use crate::manifest::Manifest;
use crate::offload::Offloader;
use crate::report::{BundleReport, ReportKind, ReportSink};
use crate::step::BundleStep;

/// File name of every per-package archive.
pub const ARCHIVE_FILE_NAME: &str = "bundle.tgz";

/// Result of encoding one package workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundledArtifact {
    /// Recipe name of the package.
    pub recipe: String,
    /// Lowercase hex SHA-256 of `archive`.
    pub digest: String,
    /// Per-package archive inside the staging area.
    pub archive: PathBuf,
}

/// One bundling session.
pub struct BundleRun {
    name: String,
    bundle_path: PathBuf,
    excludes: GlobSet,
    staging: TempDir,
    staging_root: PathBuf,
    bundled: Mutex<BTreeMap<String, BundledArtifact>>,
    reporter: Option<ReportSink>,
}

impl std::fmt::Debug for BundleRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleRun")
            .field("name", &self.name)
            .field("bundle_path", &self.bundle_path)
            .field("staging_root", &self.staging_root)
            .finish_non_exhaustive()
    }
}

impl BundleRun {
    /// Start a run that writes `<name>.tar` into the current directory.
    pub fn new(config: &BundleConfig) -> BundleResult<Self> {
        let cwd = std::env::current_dir().map_err(|e| BundleError::io(".", e))?;
        Self::new_in(&cwd, config)
    }

    /// Start a run that writes `<name>.tar` into `dir`.
    ///
    /// Fails with [`BundleError::AlreadyExists`] before anything is created
    /// if the aggregate bundle is already there.
    pub fn new_in(dir: &Path, config: &BundleConfig) -> BundleResult<Self> {
        config.validate()?;

        let bundle_path = dir.join(format!("{}.tar", config.name));
        if fs::symlink_metadata(&bundle_path).is_ok() {
            return Err(BundleError::AlreadyExists { path: bundle_path });
        }
        let excludes = config.exclude_set()?;

        let staging = tempfile::Builder::new()
            .prefix("bob-bundle-")
            .tempdir()
            .map_err(|e| BundleError::io(std::env::temp_dir(), e))?;
        let staging_root = staging.path().join(&config.name);
        fs::create_dir(&staging_root).map_err(|e| BundleError::io(&staging_root, e))?;

        info!(
            name = %config.name,
            bundle = %bundle_path.display(),
            staging = %staging_root.display(),
            "bundle run started"
        );

        Ok(Self {
            name: config.name.clone(),
            bundle_path,
            excludes,
            staging,
            staging_root,
            bundled: Mutex::new(BTreeMap::new()),
            reporter: None,
        })
    }

    /// Report each package's outcome to `sink`.
    pub fn with_reporter(mut self, sink: ReportSink) -> Self {
        self.reporter = Some(sink);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Where `finalize` writes the aggregate bundle.
    pub fn bundle_path(&self) -> &Path {
        &self.bundle_path
    }

    /// `<staging>/<name>`, the root of all per-package directories.
    pub fn staging_dir(&self) -> &Path {
        &self.staging_root
    }

    /// Snapshot of the artifacts recorded so far, keyed by variant id hex.
    pub fn artifacts(&self) -> BTreeMap<String, BundledArtifact> {
        self.bundled().clone()
    }

    pub fn is_excluded(&self, package: &str) -> bool {
        self.excludes.is_match(package)
    }

    /// Bundle one package's workspace on the pool.
    ///
    /// Returns `Ok(None)` if the package matches an exclude pattern; nothing
    /// is created or recorded for it then.
    pub async fn bundle<S>(
        &self,
        step: &S,
        pool: &Offloader,
    ) -> BundleResult<Option<BundledArtifact>>
    where
        S: BundleStep + ?Sized,
    {
        self.bundle_with_cancel(step, pool, pool.cancel_token().child())
            .await
    }

    /// Like [`bundle`](Self::bundle), with a caller supplied cancel token.
    pub async fn bundle_with_cancel<S>(
        &self,
        step: &S,
        pool: &Offloader,
        cancel: CancelToken,
    ) -> BundleResult<Option<BundledArtifact>>
    where
        S: BundleStep + ?Sized,
    {
        if self.is_excluded(step.package_name()) {
            debug!(package = step.package_name(), "package excluded from bundle");
            return Ok(None);
        }

        let variant = step.variant_id().to_hex();
        let recipe = step.recipe_name().to_string();
        let workspace = step.workspace_path().to_path_buf();

        let dest = self.staging_root.join(&recipe).join(&variant);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| BundleError::io(parent, e))?;
        }
        // A second package with the same variant id fails here.
        fs::create_dir(&dest).map_err(|e| BundleError::io(&dest, e))?;
        let archive = dest.join(ARCHIVE_FILE_NAME);

        let result = {
            let workspace = workspace.clone();
            let archive = archive.clone();
            pool.submit(cancel, move |cancel| {
                encode_workspace(&workspace, &archive, cancel)
            })
            .await
        };

        match result {
            Ok(digest) => {
                info!(recipe = %recipe, variant = %variant, digest = %digest, "bundled workspace");
                self.report(&workspace, "ok".to_string(), ReportKind::Executed);
                let artifact = BundledArtifact {
                    recipe,
                    digest,
                    archive,
                };
                self.bundled().insert(variant, artifact.clone());
                Ok(Some(artifact))
            }
            Err(e) => {
                warn!(recipe = %recipe, variant = %variant, error = %e, "bundling failed");
                self.report(&workspace, e.to_string(), ReportKind::Failed);
                Err(e)
            }
        }
    }

    /// Write the manifest and pack everything into `<name>.tar`.
    ///
    /// The aggregate is assembled in a temporary file next to its final
    /// location and moved into place at the end, so a failure leaves no
    /// partial bundle behind. The staging directory is removed on return.
    pub fn finalize(self) -> BundleResult<PathBuf> {
        let bundled = self
            .bundled
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);

        let manifest = Manifest::from_triples(
            bundled
                .iter()
                .map(|(variant, a)| (variant.clone(), a.recipe.clone(), a.digest.clone())),
        );
        let manifest_path = self.staging_root.join(format!("{}.yaml", self.name));
        manifest.write_to(&manifest_path)?;

        let dir = self
            .bundle_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let part = tempfile::Builder::new()
            .prefix(".bob-bundle-")
            .suffix(".tar.part")
            .tempfile_in(&dir)
            .map_err(|e| BundleError::io(&dir, e))?;

        let members = bundled
            .values()
            .map(|a| a.archive.as_path())
            .chain(std::iter::once(manifest_path.as_path()));
        write_aggregate(part.as_file(), self.staging.path(), members)
            .map_err(|e| BundleError::io(part.path(), e))?;

        part.persist_noclobber(&self.bundle_path).map_err(|e| {
            if e.error.kind() == io::ErrorKind::AlreadyExists {
                BundleError::AlreadyExists {
                    path: self.bundle_path.clone(),
                }
            } else {
                BundleError::io(&self.bundle_path, e.error)
            }
        })?;

        info!(
            bundle = %self.bundle_path.display(),
            packages = manifest.len(),
            "bundle written"
        );
        Ok(self.bundle_path)
    }

    fn bundled(&self) -> MutexGuard<'_, BTreeMap<String, BundledArtifact>> {
        self.bundled.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn report(&self, workspace: &Path, message: String, kind: ReportKind) {
        if let Some(sink) = &self.reporter {
            sink(&BundleReport {
                workspace: workspace.to_path_buf(),
                message,
                kind,
            });
        }
    }
}

/// Append `members` as an uncompressed tar, named relative to `root`.
fn write_aggregate<'a>(
    out: &File,
    root: &Path,
    members: impl Iterator<Item = &'a Path>,
) -> io::Result<()> {
    let mut tar = Builder::new(BufWriter::new(out));
    tar.mode(HeaderMode::Deterministic);

    for path in members {
        let name = path.strip_prefix(root).map_err(io::Error::other)?;
        let meta = fs::metadata(path)?;
        let mut header = Header::new_gnu();
        header.set_metadata_in_mode(&meta, HeaderMode::Deterministic);
        canonicalize_header(&mut header)?;
        tar.append_data(&mut header, name, File::open(path)?)?;
    }

    let mut out = tar.into_inner()?;
    out.flush()
}
