//! Local shared store abstraction.
//!
//! This module defines the `ArtifactStore` trait used to answer "is this
//! artifact already here?", enabling testability with scripted
//! implementations.
//!
//! The store is a flat directory keyed by artifact name. Looking an artifact
//! up never mutates it.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::domain::artifact::ArtifactName;
use crate::error::Result;

/// Read-only view of the shared store.
pub trait ArtifactStore: Send + Sync {
    /// Whether the artifact currently exists in the store.
    ///
    /// Absence is a normal `false`, never an error.
    fn exists(&self, artifact: &ArtifactName) -> bool;

    /// Where the artifact lives (or would live) in the store.
    fn source_path(&self, artifact: &ArtifactName) -> PathBuf;

    /// Lookup by raw name.
    ///
    /// # Errors
    /// Returns [`PeerfetchError::InvalidName`](crate::PeerfetchError::InvalidName)
    /// for a malformed name; absence is `Ok(false)`.
    fn lookup(&self, raw: &str) -> Result<bool> {
        let artifact = ArtifactName::parse(raw)?;
        Ok(self.exists(&artifact))
    }
}

// ============================================================================
// Production Implementation on the filesystem
// ============================================================================

/// The shared store as a directory on disk.
#[derive(Debug, Clone)]
pub struct SharedStore {
    root: PathBuf,
}

impl SharedStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactStore for SharedStore {
    fn exists(&self, artifact: &ArtifactName) -> bool {
        let path = self.source_path(artifact);
        match std::fs::metadata(&path) {
            Ok(metadata) => metadata.is_file(),
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => {
                // Unreadable entries count as absent; the poller will ask again
                tracing::warn!(
                    artifact = %artifact,
                    path = %path.display(),
                    error = %e,
                    "Could not stat artifact in shared store"
                );
                false
            }
        }
    }

    fn source_path(&self, artifact: &ArtifactName) -> PathBuf {
        self.root.join(artifact.as_str())
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

/// Scripted store for testing.
///
/// Each artifact can be present from the start, appear on a given lookup, or
/// never appear. When an artifact "appears" its contents are written under
/// the mock's root so that a real copy can read it, which simulates the peer
/// finishing its work. Every lookup is counted.
///
/// # Example
/// ```ignore
/// let store = MockStore::new(dir.path());
/// store.add_present("report.pdf", b"pdf bytes");
/// store.add_after_lookups("movie.mp4", 5, b"movie bytes");
/// ```
#[derive(Clone)]
pub struct MockStore {
    root: PathBuf,
    scripts: Arc<Mutex<HashMap<ArtifactName, Availability>>>,
    lookups: Arc<Mutex<HashMap<ArtifactName, usize>>>,
}

#[derive(Debug, Clone)]
enum Availability {
    /// Becomes visible on the given lookup number (1-based); 0 means already present
    OnLookup { lookup: usize, contents: Vec<u8> },
    Never,
}

impl MockStore {
    /// Create a mock store that materialises files under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scripts: Arc::new(Mutex::new(HashMap::new())),
            lookups: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Artifact exists before the first lookup.
    pub fn add_present(&self, name: &str, contents: &[u8]) {
        self.script(
            name,
            Availability::OnLookup {
                lookup: 0,
                contents: contents.to_vec(),
            },
        );
    }

    /// Artifact becomes visible on lookup number `lookup` (1-based, counting
    /// every call to `exists`).
    pub fn add_after_lookups(&self, name: &str, lookup: usize, contents: &[u8]) {
        self.script(
            name,
            Availability::OnLookup {
                lookup,
                contents: contents.to_vec(),
            },
        );
    }

    /// Artifact never appears.
    pub fn add_missing(&self, name: &str) {
        self.script(name, Availability::Never);
    }

    /// Number of lookups made for one artifact.
    pub fn lookup_count(&self, name: &str) -> usize {
        self.lookups
            .lock()
            .iter()
            .find(|(artifact, _)| artifact.as_str() == name)
            .map(|(_, count)| *count)
            .unwrap_or(0)
    }

    /// Number of lookups made across all artifacts.
    pub fn total_lookups(&self) -> usize {
        self.lookups.lock().values().sum()
    }

    /// Remove an artifact's file from the mock root, simulating the peer
    /// deleting it after it was seen.
    pub fn remove(&self, name: &str) {
        let _ = std::fs::remove_file(self.root.join(name));
    }

    fn script(&self, name: &str, availability: Availability) {
        let Ok(artifact) = ArtifactName::parse(name) else {
            return;
        };
        self.scripts.lock().insert(artifact, availability);
    }

    fn materialise(&self, artifact: &ArtifactName, contents: &[u8]) {
        let path = self.source_path(artifact);
        if !path.exists()
            && let Err(e) = std::fs::write(&path, contents)
        {
            tracing::error!(path = %path.display(), error = %e, "Mock store could not write artifact");
        }
    }
}

impl ArtifactStore for MockStore {
    fn exists(&self, artifact: &ArtifactName) -> bool {
        let lookup = {
            let mut lookups = self.lookups.lock();
            let count = lookups.entry(artifact.clone()).or_default();
            *count += 1;
            *count
        };

        let script = self.scripts.lock().get(artifact).cloned();
        match script {
            Some(Availability::OnLookup {
                lookup: visible_from,
                contents,
            }) if lookup >= visible_from => {
                self.materialise(artifact, &contents);
                true
            }
            _ => false,
        }
    }

    fn source_path(&self, artifact: &ArtifactName) -> PathBuf {
        self.root.join(artifact.as_str())
    }
}
