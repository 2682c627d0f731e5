//! State transitions for fetch sessions using the typestate pattern.
//!
//! Each transition consumes the session and returns it in its next state, so a
//! session cannot be copied twice or polled after it was delivered:
//!
//! ```text
//! FetchSession<CheckingLocal> ──check_local()──> FetchSession<Copying>   (found)
//!            │                         └────────> FetchSession<Signaling> (absent)
//!            └──cancel()──> FetchSession<Cancelled>
//!
//! FetchSession<Signaling> ──signal()──> FetchSession<Polling>  (sent or failed)
//!                                    └─> FetchSession<Cancelled>
//!
//! FetchSession<Polling> ──poll()──> FetchSession<Copying>    (available)
//!                                └─> FetchSession<TimedOut>   (attempt bound reached)
//!                                └─> FetchSession<Cancelled>
//!
//! FetchSession<Copying> ──copy()──> FetchSession<Delivered>
//!                                └─> FetchSession<CopyFailed>
//! ```
//!
//! # Attempts
//!
//! `attempt_count` counts poll lookups only. The initial local check is not an
//! attempt, so a session that found its artifact locally reports 0 attempts.
//!
//! # Signaling
//!
//! A failed notification never ends a session. It is recorded on the polling
//! state and only surfaces if the artifact then fails to appear.

use metrics::counter;
use tokio_util::sync::CancellationToken;

use crate::delivery::DeliveryExecutor;
use crate::domain::artifact::FetchRequest;
use crate::domain::batch::BatchId;
use crate::peer::PeerNotifier;
use crate::poller::{PollConfig, PollOutcome, poll_until_available};
use crate::store::ArtifactStore;

use super::state::{
    Cancelled, CheckingLocal, CopyFailed, CopyResult, Copying, Delivered, FetchSession,
    LocalCheck, PollResult, Polling, SessionData, SessionId, SessionState, SignalResult,
    SignalStatus, Signaling, TimedOut,
};

impl<T: SessionState> FetchSession<T> {
    /// Abandon the session from whatever state it is in.
    pub fn cancel(self) -> FetchSession<Cancelled> {
        tracing::debug!(
            session_id = %self.data.id,
            artifact = %self.data.request.artifact,
            during = %T::NAME,
            "Session cancelled"
        );
        FetchSession {
            data: self.data,
            state: Cancelled {
                during: T::NAME,
                cancelled_at: chrono::Utc::now(),
            },
        }
    }
}

impl FetchSession<CheckingLocal> {
    pub fn new(batch_id: BatchId, request: FetchRequest) -> Self {
        FetchSession {
            data: SessionData {
                id: SessionId(uuid::Uuid::new_v4()),
                batch_id,
                request,
            },
            state: CheckingLocal {
                created_at: chrono::Utc::now(),
            },
        }
    }

    /// Lookup the shared store once.
    pub fn check_local<S: ArtifactStore + ?Sized>(self, store: &S) -> LocalCheck {
        let artifact = &self.data.request.artifact;
        let now = chrono::Utc::now();

        if store.exists(artifact) {
            tracing::debug!(session_id = %self.data.id, artifact = %artifact, "Artifact found locally");
            let source = store.source_path(artifact);
            LocalCheck::Found(FetchSession {
                data: self.data,
                state: Copying {
                    source,
                    started_at: now,
                    attempt_count: 0,
                    signal: None,
                },
            })
        } else {
            tracing::debug!(session_id = %self.data.id, artifact = %artifact, "Artifact absent, signaling peer");
            LocalCheck::Absent(FetchSession {
                data: self.data,
                state: Signaling { started_at: now },
            })
        }
    }
}

impl FetchSession<Signaling> {
    /// Notify the peer and move on to polling whatever the result.
    ///
    /// The notification is raced against `cancellation`, so a peer that
    /// accepts the connection but never answers cannot hold the session.
    pub async fn signal<N: PeerNotifier + ?Sized>(
        self,
        notifier: &N,
        cancellation: &CancellationToken,
    ) -> SignalResult {
        let notified = tokio::select! {
            biased;
            _ = cancellation.cancelled() => None,
            result = notifier.notify(&self.data.request.artifact) => Some(result),
        };
        let Some(notified) = notified else {
            return SignalResult::Cancelled(self.cancel());
        };

        let signal = match notified {
            Ok(_) => SignalStatus::Sent,
            Err(e) => {
                tracing::warn!(
                    session_id = %self.data.id,
                    artifact = %self.data.request.artifact,
                    error = %e,
                    "Peer not notified, polling anyway"
                );
                counter!("peerfetch_signal_failures_total").increment(1);
                SignalStatus::Failed {
                    error: e.to_string(),
                }
            }
        };

        SignalResult::Sent(FetchSession {
            data: self.data,
            state: Polling {
                started_at: chrono::Utc::now(),
                signal,
                attempt_count: 0,
            },
        })
    }
}

impl FetchSession<Polling> {
    /// Wait for the artifact to appear in the shared store.
    pub async fn poll<S: ArtifactStore + ?Sized>(
        self,
        store: &S,
        config: &PollConfig,
        cancellation: &CancellationToken,
    ) -> PollResult {
        let artifact = &self.data.request.artifact;
        let outcome = poll_until_available(store, artifact, config, cancellation).await;
        let now = chrono::Utc::now();

        match outcome {
            PollOutcome::Available { attempts } => {
                let source = store.source_path(artifact);
                PollResult::Available(FetchSession {
                    data: self.data,
                    state: Copying {
                        source,
                        started_at: now,
                        attempt_count: self.state.attempt_count + attempts,
                        signal: Some(self.state.signal),
                    },
                })
            }
            PollOutcome::Timeout { attempts } => PollResult::TimedOut(FetchSession {
                data: self.data,
                state: TimedOut {
                    attempt_count: self.state.attempt_count + attempts,
                    signal: self.state.signal,
                    timed_out_at: now,
                },
            }),
            PollOutcome::Cancelled { .. } => PollResult::Cancelled(self.cancel()),
        }
    }
}

impl FetchSession<Copying> {
    /// Copy the artifact to its destination. Runs to completion once started.
    pub async fn copy<D: DeliveryExecutor + ?Sized>(self, executor: &D) -> CopyResult {
        let result = executor
            .copy(&self.state.source, &self.data.request.destination)
            .await;
        let now = chrono::Utc::now();

        match result {
            Ok(delivery) => CopyResult::Delivered(FetchSession {
                data: self.data,
                state: Delivered {
                    bytes: delivery.bytes,
                    attempt_count: self.state.attempt_count,
                    delivered_at: now,
                },
            }),
            Err(failure) => {
                tracing::warn!(
                    session_id = %self.data.id,
                    artifact = %self.data.request.artifact,
                    reason = %failure.reason,
                    detail = %failure.detail,
                    "Copy failed"
                );
                CopyResult::CopyFailed(FetchSession {
                    data: self.data,
                    state: CopyFailed {
                        failure,
                        attempt_count: self.state.attempt_count,
                        failed_at: now,
                    },
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::{CopyFailure, CopyFailureReason, MockDelivery};
    use crate::domain::artifact::ArtifactName;
    use crate::domain::batch::FetchOutcome;
    use crate::domain::session::{AnySession, SessionStateName};
    use crate::peer::{MockPeerNotifier, SignalFailure};
    use crate::store::MockStore;

    fn session(dest: &std::path::Path, raw: &str) -> FetchSession<CheckingLocal> {
        let artifact = ArtifactName::parse(raw).unwrap();
        FetchSession::new(
            BatchId(uuid::Uuid::new_v4()),
            FetchRequest::new(dest, artifact),
        )
    }

    fn fast_poll() -> PollConfig {
        PollConfig {
            interval_ms: 10,
            max_attempts: 4,
        }
    }

    #[tokio::test]
    async fn test_local_hit_skips_signaling() {
        let store_dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let store = MockStore::new(store_dir.path());
        store.add_present("report.pdf", b"pdf");

        let LocalCheck::Found(copying) = session(dest.path(), "report.pdf").check_local(&store)
        else {
            panic!("expected local hit");
        };
        assert_eq!(copying.state.attempt_count, 0);
        assert!(copying.state.signal.is_none());

        let CopyResult::Delivered(delivered) = copying.copy(&MockDelivery::new()).await else {
            panic!("expected delivery");
        };
        assert_eq!(delivered.state.bytes, 3);
        assert_eq!(std::fs::read(dest.path().join("report.pdf")).unwrap(), b"pdf");
    }

    #[tokio::test(start_paused = true)]
    async fn test_absent_artifact_signals_then_polls() {
        let store_dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let store = MockStore::new(store_dir.path());
        // One local lookup, then two poll lookups
        store.add_after_lookups("movie.mp4", 3, b"frames");
        let notifier = MockPeerNotifier::new();

        let LocalCheck::Absent(signaling) = session(dest.path(), "movie.mp4").check_local(&store)
        else {
            panic!("expected local miss");
        };
        let SignalResult::Sent(polling) = signaling.signal(&notifier, &CancellationToken::new()).await
        else {
            panic!("expected signal to complete");
        };
        assert_eq!(polling.state.signal, SignalStatus::Sent);
        assert_eq!(notifier.call_count(), 1);

        let PollResult::Available(copying) = polling
            .poll(&store, &fast_poll(), &CancellationToken::new())
            .await
        else {
            panic!("expected artifact to appear");
        };
        assert_eq!(copying.state.attempt_count, 2);
        assert_eq!(copying.state.signal, Some(SignalStatus::Sent));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_signal_surfaces_only_on_timeout() {
        let store_dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let store = MockStore::new(store_dir.path());
        let notifier = MockPeerNotifier::unreachable(SignalFailure::Connect {
            endpoint: "ws://localhost:8765".to_string(),
            error: "connection refused".to_string(),
        });

        let LocalCheck::Absent(signaling) = session(dest.path(), "ghost.bin").check_local(&store)
        else {
            panic!("expected local miss");
        };
        let SignalResult::Sent(polling) = signaling.signal(&notifier, &CancellationToken::new()).await
        else {
            panic!("expected signal to complete");
        };
        assert!(polling.state.signal.failure().is_some());

        let PollResult::TimedOut(timed_out) = polling
            .poll(&store, &fast_poll(), &CancellationToken::new())
            .await
        else {
            panic!("expected timeout");
        };
        assert_eq!(timed_out.state.attempt_count, 4);
        assert!(matches!(
            timed_out.outcome(),
            FetchOutcome::SignalFailed { attempts: 4, .. }
        ));
        assert_eq!(store.lookup_count("ghost.bin"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_poll_records_state() {
        let store_dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let store = MockStore::new(store_dir.path());
        let token = CancellationToken::new();
        token.cancel();

        let LocalCheck::Absent(signaling) = session(dest.path(), "ghost.bin").check_local(&store)
        else {
            panic!("expected local miss");
        };
        let SignalResult::Sent(polling) = signaling
            .signal(&MockPeerNotifier::new(), &CancellationToken::new())
            .await
        else {
            panic!("expected signal to complete");
        };
        let result = polling.poll(&store, &fast_poll(), &token).await;

        let PollResult::Cancelled(cancelled) = result else {
            panic!("expected cancellation");
        };
        assert_eq!(cancelled.state.during, SessionStateName::Polling);
        assert_eq!(store.lookup_count("ghost.bin"), 1);

        let any = AnySession::from(cancelled);
        assert!(any.is_terminal());
        assert!(any.outcome().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_signal_skips_notifier() {
        let store_dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let store = MockStore::new(store_dir.path());
        let notifier = MockPeerNotifier::new();
        let token = CancellationToken::new();
        token.cancel();

        let LocalCheck::Absent(signaling) = session(dest.path(), "ghost.bin").check_local(&store)
        else {
            panic!("expected local miss");
        };
        let SignalResult::Cancelled(cancelled) = signaling.signal(&notifier, &token).await else {
            panic!("expected cancellation");
        };

        assert_eq!(cancelled.state.during, SessionStateName::Signaling);
        assert_eq!(notifier.call_count(), 0);
    }

    #[tokio::test]
    async fn test_copy_failure_is_typed() {
        let store_dir = tempfile::tempdir().unwrap();
        let dest = tempfile::tempdir().unwrap();
        let store = MockStore::new(store_dir.path());
        store.add_present("a.txt", b"a");
        let delivery = MockDelivery::new();
        delivery.add_failure(CopyFailure::new(
            CopyFailureReason::DestinationUnwritable,
            "read-only",
        ));

        let LocalCheck::Found(copying) = session(dest.path(), "a.txt").check_local(&store) else {
            panic!("expected local hit");
        };
        let CopyResult::CopyFailed(failed) = copying.copy(&delivery).await else {
            panic!("expected copy failure");
        };
        assert_eq!(
            failed.state.failure.reason,
            CopyFailureReason::DestinationUnwritable
        );
        assert!(matches!(failed.outcome(), FetchOutcome::CopyFailed(_)));
    }
}
