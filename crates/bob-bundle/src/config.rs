//! Bundle run configuration.
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `BOB_BUNDLE_EXCLUDES` | Comma separated package name globs to skip |
//! | `BOB_BUNDLE_WORKERS` | Concurrent encodes (default: 4) |

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{BundleError, BundleResult};
use crate::offload::DEFAULT_MAX_WORKERS;

/// Settings for one bundling session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BundleConfig {
    /// Logical run name; the aggregate is written as `<name>.tar`.
    pub name: String,

    /// Shell globs matched against package names.
    #[serde(default)]
    pub excludes: Vec<String>,

    /// Size of the encode worker pool.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

fn default_max_workers() -> usize {
    DEFAULT_MAX_WORKERS
}

impl BundleConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            excludes: Vec::new(),
            max_workers: default_max_workers(),
        }
    }

    /// Read excludes and pool size from the environment.
    pub fn from_env(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            excludes: std::env::var("BOB_BUNDLE_EXCLUDES")
                .map(|v| parse_excludes(&v))
                .unwrap_or_default(),
            max_workers: std::env::var("BOB_BUNDLE_WORKERS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_max_workers),
        }
    }

    pub fn from_yaml_str(content: &str) -> BundleResult<Self> {
        let config: Self = serde_yaml::from_str(content)
            .map_err(|e| BundleError::config(format!("invalid bundle config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> BundleResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| BundleError::io(path, e))?;
        Self::from_yaml_str(&content)
    }

    pub fn with_excludes<I, S>(mut self, excludes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excludes = excludes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    /// Reject names that would escape the working directory, an empty pool
    /// and patterns that do not compile.
    pub fn validate(&self) -> BundleResult<()> {
        let name = self.name.as_str();
        if name.is_empty() || name == "." || name == ".." {
            return Err(BundleError::config(format!("invalid bundle name '{name}'")));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(BundleError::config(format!(
                "bundle name '{name}' must not contain path separators"
            )));
        }
        if self.max_workers == 0 {
            return Err(BundleError::config("max_workers must be at least 1"));
        }
        self.exclude_set().map(|_| ())
    }

    /// Compile the exclude patterns.
    ///
    /// Patterns follow `fnmatch`: `*` also matches `/`, a backslash is an
    /// ordinary character, braces are literal (no `{a,b}` alternation) and a
    /// `[` without a closing `]` matches itself.
    pub fn exclude_set(&self) -> BundleResult<GlobSet> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.excludes {
            let glob = GlobBuilder::new(&fnmatch_glob(pattern))
                .backslash_escape(false)
                .build()
                .map_err(|source| BundleError::InvalidPattern {
                    pattern: pattern.clone(),
                    source,
                })?;
            builder.add(glob);
        }
        builder.build().map_err(|source| BundleError::InvalidPattern {
            pattern: self.excludes.join(","),
            source,
        })
    }
}

/// Rewrite the parts of an `fnmatch` pattern that globset reads differently.
fn fnmatch_glob(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() + 4);
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '[' => match class_end(&chars, i) {
                Some(end) => {
                    out.extend(&chars[i..=end]);
                    i = end + 1;
                    continue;
                }
                None => out.push_str("[[]"),
            },
            c @ ('{' | '}') => {
                out.push('[');
                out.push(c);
                out.push(']');
            }
            c => out.push(c),
        }
        i += 1;
    }
    out
}

/// Index of the `]` closing the class opened at `start`. A `]` right after
/// `[` or `[!` is a member, not the end.
fn class_end(chars: &[char], start: usize) -> Option<usize> {
    let mut i = start + 1;
    if chars.get(i) == Some(&'!') {
        i += 1;
    }
    if chars.get(i) == Some(&']') {
        i += 1;
    }
    chars
        .get(i..)?
        .iter()
        .position(|&c| c == ']')
        .map(|p| i + p)
}

fn parse_excludes(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
