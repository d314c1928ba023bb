//! Model identifier type: the `(owner, name, quantization)` triple of §3.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelId {
    pub owner: String,
    pub name: String,
    pub quantization: String,
}

impl ModelId {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, quantization: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
            quantization: quantization.into(),
        }
    }

    /// Canonical `owner/name:quantization` serialized form.
    pub fn canonical(&self) -> String {
        format!("{}/{}:{}", self.owner, self.name, self.quantization)
    }

    /// Lowercased canonical form used for case-insensitive matching.
    pub fn canonical_lower(&self) -> String {
        self.canonical().to_lowercase()
    }

    /// Parse a fully-qualified identifier of the shape `owner/name[:quant]`.
    /// This does not perform registry resolution — it only splits a
    /// well-formed string. Returns `None` when the `owner/name` shape is not
    /// present (no `/`).
    pub fn parse_qualified(s: &str) -> Option<Self> {
        let (path, quant) = match s.split_once(':') {
            Some((p, q)) => (p, q.to_string()),
            None => (s, String::new()),
        };
        let (owner, name) = path.split_once('/')?;
        if owner.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self::new(owner, name, quant))
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}
