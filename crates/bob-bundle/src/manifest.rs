//! Bundle manifest (`<run-name>.yaml`).
//!
//! # Format
//!
//! ```yaml
//! - aa11:
//!     digestSHA256: 3b0c...
//!     name: recipe-one
//! - bb22:
//!     digestSHA256: 9f86...
//!     name: recipe-two
//! ```
//!
//! A sequence of single-key mappings, keyed by the lowercase hex variant id
//! and sorted by it. Each value has exactly the string fields `name` and
//! `digestSHA256`. Parsing is strict: any other shape is rejected as a whole.
//! Both the key and `name` become path components when the bundle is read,
//! so keys must be lowercase hex and names a single plain file name.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{BundleError, BundleResult};

const FIELD_NAME: &str = "name";
const FIELD_DIGEST: &str = "digestSHA256";

/// Value stored under each variant id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ManifestRecord {
    /// Lowercase hex SHA-256 of the per-package `bundle.tgz`.
    #[serde(rename = "digestSHA256")]
    pub digest_sha256: String,

    /// Recipe name.
    pub name: String,
}

/// One manifest entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Lowercase hex variant id.
    pub variant_id: String,
    pub name: String,
    pub digest_sha256: String,
}

/// Ordered manifest entries of one aggregate bundle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest from `(variant id hex, name, digest)` triples.
    ///
    /// Entries are sorted by variant id. Ids are expected to be unique; for a
    /// duplicate id the last triple wins.
    pub fn from_triples<I, V, N, D>(triples: I) -> Self
    where
        I: IntoIterator<Item = (V, N, D)>,
        V: Into<String>,
        N: Into<String>,
        D: Into<String>,
    {
        let sorted: BTreeMap<String, (String, String)> = triples
            .into_iter()
            .map(|(v, n, d)| (v.into(), (n.into(), d.into())))
            .collect();
        let entries = sorted
            .into_iter()
            .map(|(variant_id, (name, digest_sha256))| ManifestEntry {
                variant_id,
                name,
                digest_sha256,
            })
            .collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First entry recorded for `variant_hex`.
    pub fn get(&self, variant_hex: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.variant_id == variant_hex)
    }

    pub fn to_yaml_string(&self) -> BundleResult<String> {
        let doc: Vec<BTreeMap<&str, ManifestRecord>> = self
            .entries
            .iter()
            .map(|e| {
                let record = ManifestRecord {
                    digest_sha256: e.digest_sha256.clone(),
                    name: e.name.clone(),
                };
                BTreeMap::from([(e.variant_id.as_str(), record)])
            })
            .collect();
        serde_yaml::to_string(&doc)
            .map_err(|e| BundleError::manifest(format!("cannot serialize: {e}")))
    }

    /// Parse and validate a manifest document.
    pub fn from_yaml_str(content: &str) -> BundleResult<Self> {
        let doc: Value = serde_yaml::from_str(content)
            .map_err(|e| BundleError::manifest(format!("not valid YAML: {e}")))?;

        let items = doc
            .as_sequence()
            .ok_or_else(|| BundleError::manifest("top level must be a sequence"))?;

        let entries = items
            .iter()
            .enumerate()
            .map(|(i, item)| parse_item(i, item))
            .collect::<BundleResult<Vec<_>>>()?;
        Ok(Self { entries })
    }

    pub fn load(path: &Path) -> BundleResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| BundleError::io(path, e))?;
        let manifest = Self::from_yaml_str(&content).map_err(|e| e.at_path(path))?;
        tracing::debug!(path = %path.display(), entries = manifest.len(), "loaded bundle manifest");
        Ok(manifest)
    }

    pub fn write_to(&self, path: &Path) -> BundleResult<()> {
        let content = self.to_yaml_string()?;
        fs::write(path, content).map_err(|e| BundleError::io(path, e))
    }
}

fn parse_item(index: usize, item: &Value) -> BundleResult<ManifestEntry> {
    let mapping = item
        .as_mapping()
        .ok_or_else(|| BundleError::manifest(format!("entry {index} is not a mapping")))?;
    if mapping.len() != 1 {
        return Err(BundleError::manifest(format!(
            "entry {index} must have exactly one key, found {}",
            mapping.len()
        )));
    }
    let Some((key, value)) = mapping.iter().next() else {
        return Err(BundleError::manifest(format!("entry {index} is empty")));
    };
    let variant_id = key
        .as_str()
        .ok_or_else(|| BundleError::manifest(format!("entry {index} key is not a string")))?;

    if !is_lowercase_hex(variant_id) {
        return Err(BundleError::manifest(format!(
            "entry {index} key '{variant_id}' is not a lowercase hex variant id"
        )));
    }

    let fields = value.as_mapping().ok_or_else(|| {
        BundleError::manifest(format!("entry '{variant_id}' value is not a mapping"))
    })?;
    for field in fields.keys() {
        match field.as_str() {
            Some(FIELD_NAME) | Some(FIELD_DIGEST) => {}
            _ => {
                return Err(BundleError::manifest(format!(
                    "entry '{variant_id}' has unexpected field {field:?}"
                )))
            }
        }
    }

    let record: ManifestRecord = serde_yaml::from_value(value.clone())
        .map_err(|e| BundleError::manifest(format!("entry '{variant_id}': {e}")))?;

    if !is_plain_name(&record.name) {
        return Err(BundleError::manifest(format!(
            "entry '{variant_id}' name '{}' is not a plain directory name",
            record.name
        )));
    }

    Ok(ManifestEntry {
        variant_id: variant_id.to_string(),
        name: record.name,
        digest_sha256: record.digest_sha256,
    })
}

fn is_lowercase_hex(s: &str) -> bool {
    !s.is_empty()
        && s.len() % 2 == 0
        && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Exactly one normal component, so joining it cannot leave the bundle.
fn is_plain_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(c)), None) if c == name
    ) && !name.contains('\\')
}
