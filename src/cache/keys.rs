//! Cache key derivation.
//!
//! Artifact keys combine the input dialect, a digest of the formula text and
//! the canonical JSON of the options the cached value depends on. Struct
//! fields serialize in declaration order, so equal options always yield equal
//! keys regardless of how the request spelled them.

use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::domain::formula::FormulaInput;
use crate::domain::options::FormulaRequest;

/// What an artifact cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    /// Rendered vector fragments.
    Fragments,
    /// Intermediate MathML used for speech.
    MathMl,
}

impl ArtifactKind {
    fn as_str(self) -> &'static str {
        match self {
            ArtifactKind::Fragments => "fragments",
            ArtifactKind::MathMl => "mathml",
        }
    }
}

/// Derived artifact cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new<O: Serialize>(kind: ArtifactKind, input: &FormulaInput, options: &O) -> Self {
        let options = serde_json::to_string(options).unwrap_or_else(|_| "{}".to_string());
        Self(format!(
            "{}:{}:{}:{}",
            kind.as_str(),
            input.input_type().as_str(),
            hash_text(input.text()),
            options
        ))
    }

    /// Key of the rendered fragments for `request`.
    pub fn fragments(request: &FormulaRequest) -> Self {
        Self::new(ArtifactKind::Fragments, &request.input, &request.engine)
    }

    /// Key of the MathML conversion of `input`.
    pub fn mathml(input: &FormulaInput) -> Self {
        Self::new(ArtifactKind::MathMl, input, &())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Response cache key: request path plus raw query string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResponseKey(String);

impl ResponseKey {
    pub fn new(path: &str, query: Option<&str>) -> Self {
        match query {
            Some(query) if !query.is_empty() => Self(format!("{path}?{query}")),
            _ => Self(path.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Hex-encoded SHA-256 of `text`.
pub fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}
