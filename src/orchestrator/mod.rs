//! Batch orchestrator: fans a batch plan out into concurrent fetch sessions.
//!
//! Every accepted request becomes its own task in a `JoinSet`, driven by
//! `run_session` from the local check to a terminal state. Each batch gets a
//! child of the orchestrator's shutdown token and each session a child of the
//! batch token, so shutdown, [`BatchHandle::cancel`] and
//! [`BatchHandle::cancel_session`] all reach the same per-session check
//! points. When `max_concurrent_sessions` is set, a session holds a semaphore
//! permit for its whole run; waiting for the permit is itself cancellable. A
//! separate aggregation task joins the sessions and builds the
//! [`BatchResult`].
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::delivery::DeliveryExecutor;
use crate::domain::artifact::ArtifactName;
use crate::domain::batch::{BatchId, BatchPlan, BatchResult, checked_root};
use crate::domain::session::{
    AnySession, CheckingLocal, Copying, FetchSession, LocalCheck, PollResult, SessionState,
    SessionStateName, SignalResult,
};
use crate::error::{PeerfetchError, Result};
use crate::peer::PeerNotifier;
use crate::poller::{DEFAULT_MAX_ATTEMPTS, DEFAULT_POLL_INTERVAL_MS, PollConfig};
use crate::store::ArtifactStore;

pub mod handle;

pub use handle::{BatchHandle, SessionEvent, SessionEventKind};

use handle::EventSink;

/// Address the peer listens on unless configured otherwise.
pub const DEFAULT_PEER_URL: &str = "ws://localhost:8765";

/// Configuration for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Delay before each availability lookup, in milliseconds
    pub poll_interval_ms: u64,

    /// Availability lookups per session before giving up
    pub max_attempts: u32,

    /// WebSocket endpoint of the peer
    pub peer_url: String,

    /// Upper bound on sessions running at once across a batch.
    /// None runs every session of a batch concurrently.
    pub max_concurrent_sessions: Option<usize>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            peer_url: DEFAULT_PEER_URL.to_string(),
            max_concurrent_sessions: None,
        }
    }
}

impl FetchConfig {
    /// Load and validate a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: FetchConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(PeerfetchError::Config(
                "poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_attempts == 0 {
            return Err(PeerfetchError::Config(
                "max_attempts must be greater than zero".to_string(),
            ));
        }
        if !(self.peer_url.starts_with("ws://") || self.peer_url.starts_with("wss://")) {
            return Err(PeerfetchError::Config(format!(
                "peer_url must be a ws:// or wss:// address, got '{}'",
                self.peer_url
            )));
        }
        if self.max_concurrent_sessions == Some(0) {
            return Err(PeerfetchError::Config(
                "max_concurrent_sessions must be greater than zero when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Runs batches of fetch sessions.
///
/// Each session is its own task; sessions share nothing but the collaborators
/// and the destination root. Per-artifact failures end up in the
/// [`BatchResult`]; only batch preconditions are returned as errors.
pub struct Orchestrator<S, N, D>
where
    S: ArtifactStore,
    N: PeerNotifier,
    D: DeliveryExecutor,
{
    store: Arc<S>,
    notifier: Arc<N>,
    delivery: Arc<D>,
    config: FetchConfig,
    sessions_in_flight: Arc<AtomicUsize>,
    shutdown_token: CancellationToken,
}

impl<S, N, D> Orchestrator<S, N, D>
where
    S: ArtifactStore + 'static,
    N: PeerNotifier + 'static,
    D: DeliveryExecutor + 'static,
{
    /// Create a new orchestrator. Cancelling `shutdown_token` cancels every
    /// batch it runs.
    pub fn new(
        store: Arc<S>,
        notifier: Arc<N>,
        delivery: Arc<D>,
        config: FetchConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            store,
            notifier,
            delivery,
            config,
            sessions_in_flight: Arc::new(AtomicUsize::new(0)),
            shutdown_token,
        }
    }

    pub fn config(&self) -> &FetchConfig {
        &self.config
    }

    /// Sessions currently running across all batches.
    pub fn sessions_in_flight(&self) -> usize {
        self.sessions_in_flight.load(Ordering::Relaxed)
    }

    /// Run a batch to completion.
    pub async fn run_batch(&self, plan: BatchPlan) -> Result<BatchResult> {
        self.spawn_batch(plan)?.wait().await
    }

    /// Start a batch and return immediately.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    /// - [`PeerfetchError::EmptyBatch`] if the plan has neither requests nor
    ///   rejections
    /// - [`PeerfetchError::MissingDestinationRoot`] if the destination root
    ///   no longer exists
    /// - [`PeerfetchError::Shutdown`] if the orchestrator is shutting down
    pub fn spawn_batch(&self, plan: BatchPlan) -> Result<BatchHandle> {
        if plan.requests().is_empty() && plan.rejected().is_empty() {
            return Err(PeerfetchError::EmptyBatch);
        }
        if self.shutdown_token.is_cancelled() {
            return Err(PeerfetchError::Shutdown);
        }
        // The root may have gone away since the plan was built
        checked_root(plan.destination_root().to_path_buf())?;
        let (destination_root, requests, rejected) = plan.into_parts();
        let total_requests = requests.len();

        let batch_id = BatchId::from(uuid::Uuid::new_v4());
        let started_at = chrono::Utc::now();
        let batch_token = self.shutdown_token.child_token();
        let session_tokens: Arc<DashMap<ArtifactName, CancellationToken>> =
            Arc::new(DashMap::new());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let poll_config = PollConfig::from(&self.config);
        let semaphore = self
            .config
            .max_concurrent_sessions
            .map(|limit| Arc::new(Semaphore::new(limit)));

        tracing::info!(
            batch_id = %batch_id,
            destination_root = %destination_root.display(),
            requests = total_requests,
            rejected = rejected.len(),
            "Starting batch"
        );

        let mut join_set: JoinSet<AnySession> = JoinSet::new();
        let mut pending = BTreeSet::new();

        for request in requests {
            let session = FetchSession::<CheckingLocal>::new(batch_id, request);
            let artifact = session.data.request.artifact.clone();
            let session_token = batch_token.child_token();
            session_tokens.insert(artifact.clone(), session_token.clone());
            pending.insert(artifact.clone());

            let events = EventSink::new(
                batch_id,
                session.data.id,
                artifact.clone(),
                events_tx.clone(),
            );
            let store = self.store.clone();
            let notifier = self.notifier.clone();
            let delivery = self.delivery.clone();
            let poll_config = poll_config.clone();
            let semaphore = semaphore.clone();
            let session_tokens = session_tokens.clone();
            let sessions_in_flight = self.sessions_in_flight.clone();

            sessions_in_flight.fetch_add(1, Ordering::Relaxed);

            join_set.spawn(async move {
                let _guard = scopeguard::guard((), |_| {
                    sessions_in_flight.fetch_sub(1, Ordering::Relaxed);
                    session_tokens.remove(&artifact);
                });

                // Hold a permit for the whole session when a limit is configured
                let _permit = match semaphore {
                    Some(semaphore) => {
                        tokio::select! {
                            biased;
                            _ = session_token.cancelled() => {
                                return finish(session.cancel().into(), &events);
                            }
                            permit = semaphore.acquire_owned() => permit.ok(),
                        }
                    }
                    None => None,
                };

                run_session(
                    session,
                    store.as_ref(),
                    notifier.as_ref(),
                    delivery.as_ref(),
                    &poll_config,
                    &session_token,
                    &events,
                )
                .await
            });
        }
        drop(events_tx);

        let tokens = session_tokens.clone();

        let completion = tokio::spawn(async move {
            let mut outcomes = BTreeMap::new();
            let mut cancelled = Vec::new();
            let mut failed_to_run = Vec::new();

            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(session) => {
                        let artifact = session.data().request.artifact.clone();
                        pending.remove(&artifact);
                        match session.outcome() {
                            Some(outcome) => {
                                outcomes.insert(artifact, outcome);
                            }
                            None => cancelled.push(artifact),
                        }
                    }
                    Err(join_error) => {
                        tracing::error!(batch_id = %batch_id, error = %join_error, "Session task panicked");
                    }
                }
            }

            // Whatever never reported back died with its task
            for artifact in pending {
                tracing::error!(
                    batch_id = %batch_id,
                    artifact = %artifact,
                    "Session task ended without an outcome"
                );
                counter!("peerfetch_sessions_total", "outcome" => "failed_to_run").increment(1);
                failed_to_run.push(artifact);
            }
            cancelled.sort();
            tokens.clear();

            let result = BatchResult {
                batch_id,
                destination_root,
                total_requests,
                outcomes,
                rejected,
                cancelled,
                failed_to_run,
                started_at,
                finished_at: chrono::Utc::now(),
            };

            tracing::info!(
                batch_id = %batch_id,
                delivered = result.delivered_count(),
                failed = result.failed().len(),
                cancelled = result.cancelled.len(),
                failed_to_run = result.failed_to_run.len(),
                rejected = result.rejected.len(),
                "Batch finished"
            );

            result
        });

        Ok(BatchHandle {
            batch_id,
            cancellation: batch_token,
            session_tokens,
            events: Some(events_rx),
            completion,
        })
    }
}

/// Drive one session from its local check to a terminal state.
///
/// Cancellation is honoured at every state boundary and between poll lookups.
/// Once a copy has started it runs to completion.
#[tracing::instrument(
    skip_all,
    fields(
        batch_id = %session.data.batch_id,
        session_id = %session.data.id,
        artifact = %session.data.request.artifact,
    )
)]
pub(crate) async fn run_session<S, N, D>(
    session: FetchSession<CheckingLocal>,
    store: &S,
    notifier: &N,
    delivery: &D,
    poll_config: &PollConfig,
    cancellation: &CancellationToken,
    events: &EventSink,
) -> AnySession
where
    S: ArtifactStore + ?Sized,
    N: PeerNotifier + ?Sized,
    D: DeliveryExecutor + ?Sized,
{
    events.emit(SessionEventKind::Entered(CheckingLocal::NAME));
    if cancellation.is_cancelled() {
        return finish(session.cancel().into(), events);
    }

    let copying = match session.check_local(store) {
        LocalCheck::Found(copying) => copying,
        LocalCheck::Absent(signaling) => {
            events.emit(SessionEventKind::Entered(SessionStateName::Signaling));
            let polling = match signaling.signal(notifier, cancellation).await {
                SignalResult::Sent(polling) => polling,
                cancelled => return finish(cancelled.into(), events),
            };
            if let Some(error) = polling.state.signal.failure() {
                events.emit(SessionEventKind::SignalFailed(error.to_string()));
            }

            events.emit(SessionEventKind::Entered(SessionStateName::Polling));
            match polling.poll(store, poll_config, cancellation).await {
                PollResult::Available(copying) => copying,
                other => return finish(other.into(), events),
            }
        }
    };

    if cancellation.is_cancelled() {
        return finish(copying.cancel().into(), events);
    }

    events.emit(SessionEventKind::Entered(Copying::NAME));
    let result = copying.copy(delivery).await;
    finish(result.into(), events)
}

/// Report a terminal session and hand it back.
fn finish(session: AnySession, events: &EventSink) -> AnySession {
    let artifact = &session.data().request.artifact;
    match session.outcome() {
        Some(outcome) => {
            counter!("peerfetch_sessions_total", "outcome" => outcome.label()).increment(1);
            if outcome.is_delivered() {
                tracing::info!(artifact = %artifact, outcome = outcome.label(), "Session finished");
            } else {
                tracing::warn!(artifact = %artifact, outcome = outcome.label(), "Session finished without delivery");
            }
            events.emit(SessionEventKind::Finished(outcome));
        }
        None => {
            counter!("peerfetch_sessions_total", "outcome" => "cancelled").increment(1);
            tracing::info!(artifact = %artifact, "Session cancelled");
            events.emit(SessionEventKind::Cancelled);
        }
    }
    session
}
