//! Reproducible bundles of build workspaces.
//!
//! This crate packs the workspaces of built packages into content-addressed
//! archives that can be carried to another build environment and looked up
//! there by checkout variant:
//!
//! - [`encoder`]: deterministic tar.gz of one workspace plus its SHA-256
//! - [`offload`]: bounded worker pool for the blocking encodes
//! - [`run`]: a bundling session producing `<name>.tar`
//! - [`manifest`]: the `<name>.yaml` index inside the aggregate
//! - [`resolver`]: finds a variant's archive in unpacked bundles
//!
//! # Quick Start
//!
//! ```no_run
//! use bob_bundle::{BundleConfig, BundleRun, Offloader, PackageStep, VariantId};
//!
//! # async fn example() -> bob_bundle::BundleResult<()> {
//! let config = BundleConfig::new("rel1").with_excludes(["internal-*"]);
//! let run = BundleRun::new(&config)?;
//! let pool = Offloader::new(config.max_workers);
//!
//! let variant = VariantId::from_hex("aa11")?;
//! let step = PackageStep::new("work/core/1/workspace", "core", "core", variant);
//! run.bundle(&step, &pool).await?;
//!
//! let bundle = run.finalize()?;
//! println!("wrote {}", bundle.display());
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod config;
mod digest;
pub mod encoder;
pub mod error;
pub mod manifest;
pub mod offload;
pub mod report;
pub mod resolver;
pub mod run;
pub mod step;
pub mod variant;

pub use cancel::CancelToken;
pub use config::BundleConfig;
pub use digest::sha256_file;
pub use encoder::encode_workspace;
pub use error::{BundleError, BundleResult};
pub use manifest::{Manifest, ManifestEntry, ManifestRecord};
pub use offload::Offloader;
pub use report::{BundleReport, ReportKind, ReportSink};
pub use resolver::{unpack_aggregate, ResolvedEntry, Unbundler};
pub use run::{BundleRun, BundledArtifact, ARCHIVE_FILE_NAME};
pub use step::{BundleStep, PackageStep};
pub use variant::VariantId;
