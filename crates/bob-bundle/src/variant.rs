//! Checkout variant identifiers.

use std::fmt;

use crate::error::{BundleError, BundleResult};

/// Binary identifier of a package's checkout variant.
///
/// Always rendered, compared and stored as lowercase hex; the hex form is used
/// both as staging directory name and as manifest key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VariantId(Vec<u8>);

impl VariantId {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Parse the hex form. Upper case digits are accepted and canonicalized.
    pub fn from_hex(s: &str) -> BundleResult<Self> {
        hex::decode(s)
            .map(Self)
            .map_err(|e| BundleError::config(format!("invalid variant id '{s}': {e}")))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl fmt::Display for VariantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl From<&[u8]> for VariantId {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}
