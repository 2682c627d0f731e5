//! Handle to a running batch and the events it emits.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::artifact::ArtifactName;
use crate::domain::batch::{BatchId, BatchResult, FetchOutcome};
use crate::domain::session::{SessionId, SessionStateName};
use crate::error::{PeerfetchError, Result};

/// Something that happened to one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "details", rename_all = "snake_case")]
pub enum SessionEventKind {
    /// The session moved into a new state
    Entered(SessionStateName),
    /// The peer could not be notified; polling continues
    SignalFailed(String),
    /// The session reached a terminal outcome
    Finished(FetchOutcome),
    /// The session was cancelled before reaching an outcome
    Cancelled,
}

/// Incremental progress report for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionEvent {
    pub batch_id: BatchId,
    pub session_id: SessionId,
    pub artifact: ArtifactName,
    pub kind: SessionEventKind,
    pub at: DateTime<Utc>,
}

/// Sending half of a batch's event stream, bound to one session.
#[derive(Clone)]
pub(crate) struct EventSink {
    batch_id: BatchId,
    session_id: SessionId,
    artifact: ArtifactName,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl EventSink {
    pub(crate) fn new(
        batch_id: BatchId,
        session_id: SessionId,
        artifact: ArtifactName,
        tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            batch_id,
            session_id,
            artifact,
            tx,
        }
    }

    pub(crate) fn emit(&self, kind: SessionEventKind) {
        let event = SessionEvent {
            batch_id: self.batch_id,
            session_id: self.session_id,
            artifact: self.artifact.clone(),
            kind,
            at: Utc::now(),
        };
        // Nobody listening is fine
        let _ = self.tx.send(event);
    }
}

/// Handle to a batch started with
/// [`Orchestrator::spawn_batch`](super::Orchestrator::spawn_batch).
///
/// The batch keeps running if the handle is dropped.
pub struct BatchHandle {
    pub(crate) batch_id: BatchId,
    pub(crate) cancellation: CancellationToken,
    pub(crate) session_tokens: Arc<DashMap<ArtifactName, CancellationToken>>,
    pub(crate) events: Option<mpsc::UnboundedReceiver<SessionEvent>>,
    pub(crate) completion: JoinHandle<BatchResult>,
}

impl BatchHandle {
    pub fn id(&self) -> BatchId {
        self.batch_id
    }

    /// Take the event stream. Returns `None` after the first call.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.take()
    }

    /// Cancel every session that has not yet reached an outcome.
    ///
    /// Sessions that are already copying finish their copy.
    pub fn cancel(&self) {
        tracing::info!(batch_id = %self.batch_id, "Cancelling batch");
        self.cancellation.cancel();
    }

    /// Cancel a single session by artifact name.
    ///
    /// Returns false if no running session has that name.
    pub fn cancel_session(&self, name: &str) -> bool {
        let Ok(artifact) = ArtifactName::parse(name) else {
            return false;
        };
        match self.session_tokens.get(&artifact) {
            Some(token) => {
                tracing::info!(batch_id = %self.batch_id, artifact = %artifact, "Cancelling session");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Wait for every session to finish and return the aggregate result.
    pub async fn wait(self) -> Result<BatchResult> {
        let batch_id = self.batch_id;
        self.completion.await.map_err(|e| {
            PeerfetchError::Other(anyhow::anyhow!(
                "batch {batch_id} aggregation task failed: {e}"
            ))
        })
    }
}
