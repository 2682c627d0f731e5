//! Artifact names and fetch requests.
//!
//! The shared store is a flat directory keyed by artifact name, so a valid
//! name is a single path component: it can never address anything outside
//! the store or outside the destination root.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{PeerfetchError, Result};

/// A validated artifact identifier.
///
/// Construct with [`ArtifactName::parse`]. Surrounding whitespace is trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactName(String);

impl ArtifactName {
    /// Validate a raw name.
    ///
    /// # Errors
    /// Returns [`PeerfetchError::InvalidName`] for empty names, `.`/`..`,
    /// names containing a path separator, or names containing NUL.
    pub fn parse(raw: &str) -> Result<Self> {
        let name = raw.trim();

        if name.is_empty() {
            return Err(PeerfetchError::invalid_name(raw, "name is empty"));
        }
        if name == "." || name == ".." || name.contains("..") {
            return Err(PeerfetchError::invalid_name(
                raw,
                "name contains a parent directory reference",
            ));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(PeerfetchError::invalid_name(
                raw,
                "name contains a path separator",
            ));
        }
        if name.contains('\0') {
            return Err(PeerfetchError::invalid_name(raw, "name contains NUL"));
        }

        Ok(ArtifactName(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ArtifactName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<Path> for ArtifactName {
    fn as_ref(&self) -> &Path {
        Path::new(&self.0)
    }
}

impl TryFrom<String> for ArtifactName {
    type Error = PeerfetchError;

    fn try_from(value: String) -> Result<Self> {
        ArtifactName::parse(&value)
    }
}

impl From<ArtifactName> for String {
    fn from(name: ArtifactName) -> Self {
        name.0
    }
}

/// A single request to deliver one artifact to one destination path.
///
/// Immutable once built; the destination is always `destination_root / name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchRequest {
    /// The artifact to deliver.
    pub artifact: ArtifactName,
    /// Absolute path the artifact is written to.
    pub destination: PathBuf,
}

impl FetchRequest {
    /// Build the request for `artifact` under `destination_root`.
    pub fn new(destination_root: &Path, artifact: ArtifactName) -> Self {
        let destination = destination_root.join(artifact.as_str());
        Self {
            artifact,
            destination,
        }
    }
}
