//! Availability poller.
//!
//! Checks the shared store again on a fixed cadence until the artifact shows
//! up, the attempt bound is reached, or the caller cancels. Each wait is a
//! cooperative sleep raced against the cancellation token, so a polling
//! session never holds a thread.

use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::domain::artifact::ArtifactName;
use crate::store::ArtifactStore;

/// Default delay before each lookup, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Default number of lookups before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 20;

/// Cadence and bound for one polling run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollConfig {
    pub interval_ms: u64,
    pub max_attempts: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl From<&crate::orchestrator::FetchConfig> for PollConfig {
    fn from(config: &crate::orchestrator::FetchConfig) -> Self {
        PollConfig {
            interval_ms: config.poll_interval_ms,
            max_attempts: config.max_attempts,
        }
    }
}

impl PollConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Longest a polling run can take without cancellation.
    pub fn max_wait(&self) -> Duration {
        self.interval() * self.max_attempts
    }
}

/// How a polling run ended. `attempts` is the number of lookups made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Available { attempts: u32 },
    Timeout { attempts: u32 },
    /// Cancelled between lookups; neither available nor timed out.
    Cancelled { attempts: u32 },
}

/// Lookup `artifact` every `interval_ms` until it exists, up to `max_attempts`
/// lookups.
///
/// The first lookup happens one interval after the call. The lookup count never
/// exceeds `max_attempts`: a run that times out made exactly that many.
pub async fn poll_until_available<S: ArtifactStore + ?Sized>(
    store: &S,
    artifact: &ArtifactName,
    config: &PollConfig,
    cancellation: &CancellationToken,
) -> PollOutcome {
    let interval = config.interval();
    let mut attempts = 0;

    while attempts < config.max_attempts {
        tokio::select! {
            biased;
            _ = cancellation.cancelled() => {
                tracing::debug!(artifact = %artifact, attempts, "Polling cancelled");
                return PollOutcome::Cancelled { attempts };
            }
            _ = tokio::time::sleep(interval) => {}
        }

        attempts += 1;
        counter!("peerfetch_poll_lookups_total").increment(1);

        if store.exists(artifact) {
            tracing::debug!(artifact = %artifact, attempts, "Artifact became available");
            return PollOutcome::Available { attempts };
        }

        tracing::trace!(
            artifact = %artifact,
            attempts,
            max_attempts = config.max_attempts,
            "Artifact not yet available"
        );
    }

    tracing::warn!(
        artifact = %artifact,
        attempts,
        "Artifact did not become available within the attempt bound"
    );
    PollOutcome::Timeout { attempts }
}
