//! Peer notifier abstraction.
//!
//! This module defines the `PeerNotifier` trait that tells the remote peer an
//! artifact is wanted, enabling testability with mock implementations.
//!
//! Signaling is fire-and-forget: one connection, one `receive_file:<name>`
//! message, then close. No reply is awaited, and a failure to send is reported
//! to the caller but never stops a fetch session.

use async_trait::async_trait;
use futures::SinkExt;
use serde::Serialize;
use thiserror::Error;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::domain::artifact::ArtifactName;

/// Command word of the fetch-request message.
pub const SIGNAL_COMMAND: &str = "receive_file";

/// Encode the notification for one artifact.
pub fn signal_message(artifact: &ArtifactName) -> String {
    format!("{SIGNAL_COMMAND}:{artifact}")
}

/// Decode a notification, returning the requested name.
///
/// The payload is trimmed; any other command yields `None`.
pub fn parse_signal_message(message: &str) -> Option<&str> {
    let (command, payload) = message.split_once(':')?;
    if command.trim() != SIGNAL_COMMAND {
        return None;
    }
    Some(payload.trim())
}

/// Confirmation that a notification was sent. Not a reply from the peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Ack {
    pub peer: String,
    pub message: String,
}

/// Why a notification could not be sent.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "type", content = "details", rename_all = "snake_case")]
pub enum SignalFailure {
    /// The configured endpoint is not a usable WebSocket address
    #[error("Invalid peer endpoint '{endpoint}': {error}")]
    InvalidEndpoint { endpoint: String, error: String },

    /// Connection refused, DNS failure, unreachable host, failed handshake
    #[error("Could not connect to peer at {endpoint}: {error}")]
    Connect { endpoint: String, error: String },

    /// Connected but the message could not be written
    #[error("Could not send fetch request to {endpoint}: {error}")]
    Send { endpoint: String, error: String },
}

/// Trait for notifying the peer that an artifact is wanted.
///
/// # Example
/// ```ignore
/// let notifier = WebSocketNotifier::new("ws://localhost:8765");
/// match notifier.notify(&name).await {
///     Ok(ack) => println!("Sent {}", ack.message),
///     Err(e) => println!("Peer not reached: {e}"),
/// }
/// ```
#[async_trait]
pub trait PeerNotifier: Send + Sync {
    /// Send a single fetch-request notification for `artifact`.
    ///
    /// # Errors
    /// Returns a [`SignalFailure`] if the connection could not be opened or
    /// the message could not be written.
    async fn notify(&self, artifact: &ArtifactName) -> Result<Ack, SignalFailure>;
}

// ============================================================================
// Production Implementation using a WebSocket
// ============================================================================

/// Notifier that opens a WebSocket to the peer for every notification.
#[derive(Debug, Clone)]
pub struct WebSocketNotifier {
    peer_url: String,
}

impl WebSocketNotifier {
    pub fn new(peer_url: impl Into<String>) -> Self {
        Self {
            peer_url: peer_url.into(),
        }
    }

    pub fn peer_url(&self) -> &str {
        &self.peer_url
    }

    fn connect_failure(&self, error: tungstenite::Error) -> SignalFailure {
        match error {
            tungstenite::Error::Url(_) | tungstenite::Error::HttpFormat(_) => {
                SignalFailure::InvalidEndpoint {
                    endpoint: self.peer_url.clone(),
                    error: error.to_string(),
                }
            }
            other => SignalFailure::Connect {
                endpoint: self.peer_url.clone(),
                error: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl PeerNotifier for WebSocketNotifier {
    #[tracing::instrument(skip(self), fields(peer = %self.peer_url))]
    async fn notify(&self, artifact: &ArtifactName) -> Result<Ack, SignalFailure> {
        let message = signal_message(artifact);

        let (mut socket, _response) = tokio_tungstenite::connect_async(self.peer_url.as_str())
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Could not connect to peer");
                self.connect_failure(e)
            })?;

        let sent = socket.send(Message::Text(message.clone().into())).await;

        // Close regardless of whether the send went through
        if let Err(e) = socket.close(None).await {
            tracing::trace!(error = %e, "Peer connection did not close cleanly");
        }

        sent.map_err(|e| {
            tracing::warn!(error = %e, "Could not send fetch request");
            SignalFailure::Send {
                endpoint: self.peer_url.clone(),
                error: e.to_string(),
            }
        })?;

        tracing::debug!(message = %message, "Fetch request sent");

        Ok(Ack {
            peer: self.peer_url.clone(),
            message,
        })
    }
}

// ============================================================================
// Test/Mock Implementation
// ============================================================================

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Mock notifier for testing.
///
/// Records every notification and answers with queued results, falling back
/// to a successful [`Ack`] once the queue is empty.
///
/// # Example
/// ```ignore
/// let mock = MockPeerNotifier::new();
/// mock.add_failure(SignalFailure::Connect {
///     endpoint: "ws://peer".to_string(),
///     error: "connection refused".to_string(),
/// });
/// ```
#[derive(Clone, Default)]
pub struct MockPeerNotifier {
    responses: Arc<Mutex<VecDeque<Result<Ack, SignalFailure>>>>,
    always_fail: Arc<Mutex<Option<SignalFailure>>>,
    calls: Arc<Mutex<Vec<ArtifactName>>>,
}

impl MockPeerNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// A notifier whose every call fails with `failure`.
    pub fn unreachable(failure: SignalFailure) -> Self {
        let mock = Self::new();
        *mock.always_fail.lock() = Some(failure);
        mock
    }

    /// Queue a failure for the next call.
    pub fn add_failure(&self, failure: SignalFailure) {
        self.responses.lock().push_back(Err(failure));
    }

    /// Queue an explicit result for the next call.
    pub fn add_response(&self, response: Result<Ack, SignalFailure>) {
        self.responses.lock().push_back(response);
    }

    /// Names notified so far, in call order.
    pub fn get_calls(&self) -> Vec<ArtifactName> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl PeerNotifier for MockPeerNotifier {
    async fn notify(&self, artifact: &ArtifactName) -> Result<Ack, SignalFailure> {
        self.calls.lock().push(artifact.clone());

        if let Some(failure) = self.always_fail.lock().clone() {
            return Err(failure);
        }

        let queued = self.responses.lock().pop_front();
        queued.unwrap_or_else(|| {
            Ok(Ack {
                peer: "mock".to_string(),
                message: signal_message(artifact),
            })
        })
    }
}
