//! The view of a build step that bundling needs.

use std::path::{Path, PathBuf};

use crate::variant::VariantId;

/// Accessors the build graph exposes for a step that is about to be bundled.
pub trait BundleStep {
    /// Directory whose contents are archived.
    fn workspace_path(&self) -> &Path;

    /// Name of the owning package; matched against exclude patterns.
    fn package_name(&self) -> &str;

    /// Recipe name of the owning package.
    fn recipe_name(&self) -> &str;

    /// Checkout variant of the owning package.
    fn variant_id(&self) -> &VariantId;
}

/// Owned [`BundleStep`] for callers without a step model of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageStep {
    pub workspace: PathBuf,
    pub package: String,
    pub recipe: String,
    pub variant: VariantId,
}

impl PackageStep {
    pub fn new(
        workspace: impl Into<PathBuf>,
        package: impl Into<String>,
        recipe: impl Into<String>,
        variant: VariantId,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            package: package.into(),
            recipe: recipe.into(),
            variant,
        }
    }
}

impl BundleStep for PackageStep {
    fn workspace_path(&self) -> &Path {
        &self.workspace
    }

    fn package_name(&self) -> &str {
        &self.package
    }

    fn recipe_name(&self) -> &str {
        &self.recipe
    }

    fn variant_id(&self) -> &VariantId {
        &self.variant
    }
}
