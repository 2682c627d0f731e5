//! Batch types for grouping fetch requests.
//!
//! A batch is one set of requested names delivered into one destination root.
//! [`BatchPlan`] is the validated input, [`BatchResult`] the aggregate report.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::artifact::{ArtifactName, FetchRequest};
use super::session::CopyFailure;
use crate::error::{PeerfetchError, Result};

/// Unique identifier for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BatchId(pub Uuid);

impl From<Uuid> for BatchId {
    fn from(uuid: Uuid) -> Self {
        BatchId(uuid)
    }
}

impl std::ops::Deref for BatchId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

/// Validated input for one batch run.
///
/// Names that fail validation, and repeated names, are recorded in `rejected`
/// and never get a session. Every accepted request has a distinct name and a
/// destination directly under the root. Only the constructors below can build
/// a plan, so these hold for every plan the orchestrator is handed.
#[derive(Debug, Clone, Serialize)]
pub struct BatchPlan {
    destination_root: PathBuf,
    requests: Vec<FetchRequest>,
    /// Raw name -> reason it was not accepted
    rejected: BTreeMap<String, String>,
}

impl BatchPlan {
    /// Build a plan from raw names and an already-selected destination root.
    ///
    /// # Errors
    /// - [`PeerfetchError::EmptyBatch`] if `names` is empty
    /// - [`PeerfetchError::MissingDestinationRoot`] if the root is relative or
    ///   is not an existing directory
    pub fn from_names<I, S>(destination_root: impl Into<PathBuf>, names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let names: Vec<S> = names.into_iter().collect();
        if names.is_empty() {
            return Err(PeerfetchError::EmptyBatch);
        }

        let destination_root = checked_root(destination_root.into())?;

        let mut seen = HashSet::new();
        let mut requests = Vec::with_capacity(names.len());
        let mut rejected = BTreeMap::new();

        for raw in names {
            let raw = raw.as_ref();
            match ArtifactName::parse(raw) {
                Ok(name) => {
                    if seen.insert(name.clone()) {
                        requests.push(FetchRequest::new(&destination_root, name));
                    } else {
                        rejected.insert(raw.to_string(), "duplicate request".to_string());
                    }
                }
                Err(PeerfetchError::InvalidName { reason, .. }) => {
                    tracing::warn!(name = %raw.escape_debug(), reason = %reason, "Rejected artifact name");
                    rejected.insert(raw.to_string(), reason);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(Self {
            destination_root,
            requests,
            rejected,
        })
    }

    /// Build a plan from the result of a destination picker.
    ///
    /// `None` means the user made no selection: the batch is abandoned and
    /// `Ok(None)` is returned without looking at the names.
    pub fn from_selection<I, S>(selection: Option<PathBuf>, names: I) -> Result<Option<Self>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        match selection {
            Some(root) => Self::from_names(root, names).map(Some),
            None => {
                tracing::info!("No destination selected, abandoning batch");
                Ok(None)
            }
        }
    }

    /// Build a plan from requests that were constructed elsewhere.
    ///
    /// Requests whose destination is not `root / name`, and repeats of a name
    /// already accepted, are rejected.
    pub fn from_requests(
        destination_root: impl Into<PathBuf>,
        requests: Vec<FetchRequest>,
    ) -> Result<Self> {
        if requests.is_empty() {
            return Err(PeerfetchError::EmptyBatch);
        }
        let destination_root = checked_root(destination_root.into())?;

        let mut seen = HashSet::new();
        let mut accepted = Vec::with_capacity(requests.len());
        let mut rejected = BTreeMap::new();
        for request in requests {
            if request.destination != destination_root.join(request.artifact.as_str()) {
                rejected.insert(
                    request.artifact.to_string(),
                    "destination outside the destination root".to_string(),
                );
            } else if seen.insert(request.artifact.clone()) {
                accepted.push(request);
            } else {
                rejected.insert(
                    request.artifact.to_string(),
                    "duplicate destination path".to_string(),
                );
            }
        }

        Ok(Self {
            destination_root,
            requests: accepted,
            rejected,
        })
    }

    pub fn destination_root(&self) -> &Path {
        &self.destination_root
    }

    pub fn requests(&self) -> &[FetchRequest] {
        &self.requests
    }

    /// Raw name -> reason, for names that will not get a session.
    pub fn rejected(&self) -> &BTreeMap<String, String> {
        &self.rejected
    }

    pub(crate) fn into_parts(self) -> (PathBuf, Vec<FetchRequest>, BTreeMap<String, String>) {
        (self.destination_root, self.requests, self.rejected)
    }

    /// Number of names that will get a session.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

/// The root must be absolute and an existing directory.
pub(crate) fn checked_root(root: PathBuf) -> Result<PathBuf> {
    if root.is_absolute() && root.is_dir() {
        Ok(root)
    } else {
        Err(PeerfetchError::MissingDestinationRoot(root))
    }
}

/// Terminal outcome of one fetch session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "details", rename_all = "snake_case")]
pub enum FetchOutcome {
    /// The artifact was copied to its destination.
    Delivered {
        destination: PathBuf,
        bytes: u64,
        /// Poll lookups spent waiting (0 when served locally)
        attempts: u32,
    },
    /// The artifact never appeared within the attempt bound.
    TimedOut { attempts: u32 },
    /// The copy to the destination failed.
    CopyFailed(CopyFailure),
    /// The artifact never appeared and the peer could not be signaled.
    SignalFailed { attempts: u32, error: String },
}

impl FetchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, FetchOutcome::Delivered { .. })
    }

    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Delivered { .. } => "delivered",
            FetchOutcome::TimedOut { .. } => "timed_out",
            FetchOutcome::CopyFailed(_) => "copy_failed",
            FetchOutcome::SignalFailed { .. } => "signal_failed",
        }
    }
}

/// Aggregate report for one batch.
///
/// Produced once, after every session has finished or been cancelled.
/// Cancelled sessions are listed in `cancelled` and have no entry in
/// `outcomes`. A session whose task died without reporting back is listed in
/// `failed_to_run` instead.
#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub batch_id: BatchId,
    pub destination_root: PathBuf,
    /// Number of sessions started
    pub total_requests: usize,
    pub outcomes: BTreeMap<ArtifactName, FetchOutcome>,
    /// Raw name -> reason, for names that never got a session
    pub rejected: BTreeMap<String, String>,
    pub cancelled: Vec<ArtifactName>,
    /// Sessions whose task panicked before reaching an outcome
    pub failed_to_run: Vec<ArtifactName>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl BatchResult {
    pub fn outcome(&self, name: &str) -> Option<&FetchOutcome> {
        self.outcomes
            .iter()
            .find(|(artifact, _)| artifact.as_str() == name)
            .map(|(_, outcome)| outcome)
    }

    pub fn delivered_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_delivered()).count()
    }

    /// Names that finished without delivery; the subset worth retrying.
    pub fn failed(&self) -> Vec<&ArtifactName> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_delivered())
            .map(|(name, _)| name)
            .collect()
    }

    /// True when every started session delivered and nothing was rejected.
    pub fn is_fully_delivered(&self) -> bool {
        self.rejected.is_empty()
            && self.cancelled.is_empty()
            && self.failed_to_run.is_empty()
            && self.delivered_count() == self.total_requests
    }
}
