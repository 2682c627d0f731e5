//! Session states for the fetch lifecycle.
//!
//! This module defines the type-safe session lifecycle using the typestate pattern.
//! Each session progresses through distinct states, enforced at compile time.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::artifact::FetchRequest;
use crate::domain::batch::{BatchId, FetchOutcome};

/// Name of a session state, used for events and filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStateName {
    CheckingLocal,
    Signaling,
    Polling,
    Copying,
    Delivered,
    TimedOut,
    CopyFailed,
    Cancelled,
}

impl std::fmt::Display for SessionStateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStateName::CheckingLocal => "checking_local",
            SessionStateName::Signaling => "signaling",
            SessionStateName::Polling => "polling",
            SessionStateName::Copying => "copying",
            SessionStateName::Delivered => "delivered",
            SessionStateName::TimedOut => "timed_out",
            SessionStateName::CopyFailed => "copy_failed",
            SessionStateName::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Marker trait for valid session states.
///
/// This trait enables the typestate pattern, ensuring that transitions
/// are only performed on sessions in valid states.
pub trait SessionState: Send + Sync {
    const NAME: SessionStateName;
}

/// One artifact's fetch session.
///
/// The generic parameter `T` is the current state; transitions consume the
/// session and return it in the next state.
#[derive(Debug, Clone, Serialize)]
pub struct FetchSession<T: SessionState> {
    /// The current state of the session.
    pub state: T,
    /// Immutable data shared by every state.
    pub data: SessionData,
}

/// Data carried unchanged through every state of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionData {
    pub id: SessionId,
    pub batch_id: BatchId,
    pub request: FetchRequest,
}

// ============================================================================
// Session States
// ============================================================================

/// Looking for the artifact in the shared store. Initial state.
#[derive(Debug, Clone, Serialize)]
pub struct CheckingLocal {
    pub created_at: DateTime<Utc>,
}

impl SessionState for CheckingLocal {
    const NAME: SessionStateName = SessionStateName::CheckingLocal;
}

/// Artifact was absent; the peer is being notified.
#[derive(Debug, Clone, Serialize)]
pub struct Signaling {
    pub started_at: DateTime<Utc>,
}

impl SessionState for Signaling {
    const NAME: SessionStateName = SessionStateName::Signaling;
}

/// Result of notifying the peer. Either way the session moves on to polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "details", rename_all = "snake_case")]
pub enum SignalStatus {
    Sent,
    Failed { error: String },
}

impl SignalStatus {
    pub fn failure(&self) -> Option<&str> {
        match self {
            SignalStatus::Sent => None,
            SignalStatus::Failed { error } => Some(error),
        }
    }
}

/// Waiting for the artifact to appear in the shared store.
#[derive(Debug, Clone, Serialize)]
pub struct Polling {
    pub started_at: DateTime<Utc>,
    pub signal: SignalStatus,
    /// Lookups made so far (0 on entry)
    pub attempt_count: u32,
}

impl SessionState for Polling {
    const NAME: SessionStateName = SessionStateName::Polling;
}

/// Copying the artifact from the shared store to the destination.
#[derive(Debug, Clone, Serialize)]
pub struct Copying {
    pub source: PathBuf,
    pub started_at: DateTime<Utc>,
    /// Poll lookups spent before the artifact appeared (0 when found locally)
    pub attempt_count: u32,
    /// Present only when the session went through signaling
    pub signal: Option<SignalStatus>,
}

impl SessionState for Copying {
    const NAME: SessionStateName = SessionStateName::Copying;
}

/// Artifact was delivered. Terminal.
#[derive(Debug, Clone, Serialize)]
pub struct Delivered {
    pub bytes: u64,
    pub attempt_count: u32,
    pub delivered_at: DateTime<Utc>,
}

impl SessionState for Delivered {
    const NAME: SessionStateName = SessionStateName::Delivered;
}

/// Artifact never appeared within the attempt bound. Terminal.
#[derive(Debug, Clone, Serialize)]
pub struct TimedOut {
    pub attempt_count: u32,
    pub signal: SignalStatus,
    pub timed_out_at: DateTime<Utc>,
}

impl SessionState for TimedOut {
    const NAME: SessionStateName = SessionStateName::TimedOut;
}

/// Why a copy failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyFailureReason {
    /// The destination could not be written (missing root, permissions, read-only)
    DestinationUnwritable,
    /// The source disappeared between the availability check and the copy
    SourceVanished,
    /// Any other I/O failure during the copy
    IoError,
}

impl std::fmt::Display for CopyFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            CopyFailureReason::DestinationUnwritable => "destination unwritable",
            CopyFailureReason::SourceVanished => "source vanished",
            CopyFailureReason::IoError => "I/O error",
        };
        f.write_str(reason)
    }
}

/// A typed copy failure.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{reason}: {detail}")]
pub struct CopyFailure {
    pub reason: CopyFailureReason,
    pub detail: String,
}

impl CopyFailure {
    pub fn new(reason: CopyFailureReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

/// The copy failed. Terminal.
#[derive(Debug, Clone, Serialize)]
pub struct CopyFailed {
    pub failure: CopyFailure,
    pub attempt_count: u32,
    pub failed_at: DateTime<Utc>,
}

impl SessionState for CopyFailed {
    const NAME: SessionStateName = SessionStateName::CopyFailed;
}

/// The session was cancelled before reaching an outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Cancelled {
    /// State the session was in when cancellation took effect
    pub during: SessionStateName,
    pub cancelled_at: DateTime<Utc>,
}

impl SessionState for Cancelled {
    const NAME: SessionStateName = SessionStateName::Cancelled;
}

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub Uuid);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for SessionId {
    fn from(uuid: Uuid) -> Self {
        SessionId(uuid)
    }
}

// ============================================================================
// Transition Results
// ============================================================================

/// Result of checking the shared store.
#[derive(Debug)]
pub enum LocalCheck {
    /// Artifact already present; go straight to copying.
    Found(FetchSession<Copying>),
    /// Artifact absent; the peer must be signaled.
    Absent(FetchSession<Signaling>),
}

/// Result of notifying the peer. A failed notification still moves on to
/// polling; only cancellation ends the session here.
#[derive(Debug)]
pub enum SignalResult {
    Sent(FetchSession<Polling>),
    Cancelled(FetchSession<Cancelled>),
}

/// Result of waiting for the artifact.
#[derive(Debug)]
pub enum PollResult {
    Available(FetchSession<Copying>),
    TimedOut(FetchSession<TimedOut>),
    Cancelled(FetchSession<Cancelled>),
}

/// Result of copying the artifact.
#[derive(Debug)]
pub enum CopyResult {
    Delivered(FetchSession<Delivered>),
    CopyFailed(FetchSession<CopyFailed>),
}

// ============================================================================
// Unified Session Representation
// ============================================================================

/// Enum that can hold a session in any state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "state", content = "session", rename_all = "snake_case")]
pub enum AnySession {
    CheckingLocal(FetchSession<CheckingLocal>),
    Signaling(FetchSession<Signaling>),
    Polling(FetchSession<Polling>),
    Copying(FetchSession<Copying>),
    Delivered(FetchSession<Delivered>),
    TimedOut(FetchSession<TimedOut>),
    CopyFailed(FetchSession<CopyFailed>),
    Cancelled(FetchSession<Cancelled>),
}

impl AnySession {
    /// Get the session data regardless of state.
    pub fn data(&self) -> &SessionData {
        match self {
            AnySession::CheckingLocal(s) => &s.data,
            AnySession::Signaling(s) => &s.data,
            AnySession::Polling(s) => &s.data,
            AnySession::Copying(s) => &s.data,
            AnySession::Delivered(s) => &s.data,
            AnySession::TimedOut(s) => &s.data,
            AnySession::CopyFailed(s) => &s.data,
            AnySession::Cancelled(s) => &s.data,
        }
    }

    pub fn id(&self) -> SessionId {
        self.data().id
    }

    /// Get the name of the current state.
    pub fn variant(&self) -> SessionStateName {
        match self {
            AnySession::CheckingLocal(_) => CheckingLocal::NAME,
            AnySession::Signaling(_) => Signaling::NAME,
            AnySession::Polling(_) => Polling::NAME,
            AnySession::Copying(_) => Copying::NAME,
            AnySession::Delivered(_) => Delivered::NAME,
            AnySession::TimedOut(_) => TimedOut::NAME,
            AnySession::CopyFailed(_) => CopyFailed::NAME,
            AnySession::Cancelled(_) => Cancelled::NAME,
        }
    }

    /// Check if this session is in a terminal state (including Cancelled).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AnySession::Delivered(_)
                | AnySession::TimedOut(_)
                | AnySession::CopyFailed(_)
                | AnySession::Cancelled(_)
        )
    }

    /// The outcome to report in a batch result.
    ///
    /// `None` for sessions that are still running and for cancelled sessions.
    pub fn outcome(&self) -> Option<FetchOutcome> {
        match self {
            AnySession::Delivered(s) => Some(s.outcome()),
            AnySession::TimedOut(s) => Some(s.outcome()),
            AnySession::CopyFailed(s) => Some(s.outcome()),
            _ => None,
        }
    }
}

impl FetchSession<Delivered> {
    pub fn outcome(&self) -> FetchOutcome {
        FetchOutcome::Delivered {
            destination: self.data.request.destination.clone(),
            bytes: self.state.bytes,
            attempts: self.state.attempt_count,
        }
    }
}

impl FetchSession<TimedOut> {
    /// `SignalFailed` when the peer was never reached, `TimedOut` otherwise.
    pub fn outcome(&self) -> FetchOutcome {
        match &self.state.signal {
            SignalStatus::Sent => FetchOutcome::TimedOut {
                attempts: self.state.attempt_count,
            },
            SignalStatus::Failed { error } => FetchOutcome::SignalFailed {
                attempts: self.state.attempt_count,
                error: error.clone(),
            },
        }
    }
}

impl FetchSession<CopyFailed> {
    pub fn outcome(&self) -> FetchOutcome {
        FetchOutcome::CopyFailed(self.state.failure.clone())
    }
}

// Conversion traits for going from typed FetchSession to AnySession

impl From<FetchSession<CheckingLocal>> for AnySession {
    fn from(s: FetchSession<CheckingLocal>) -> Self {
        AnySession::CheckingLocal(s)
    }
}

impl From<FetchSession<Signaling>> for AnySession {
    fn from(s: FetchSession<Signaling>) -> Self {
        AnySession::Signaling(s)
    }
}

impl From<FetchSession<Polling>> for AnySession {
    fn from(s: FetchSession<Polling>) -> Self {
        AnySession::Polling(s)
    }
}

impl From<FetchSession<Copying>> for AnySession {
    fn from(s: FetchSession<Copying>) -> Self {
        AnySession::Copying(s)
    }
}

impl From<FetchSession<Delivered>> for AnySession {
    fn from(s: FetchSession<Delivered>) -> Self {
        AnySession::Delivered(s)
    }
}

impl From<FetchSession<TimedOut>> for AnySession {
    fn from(s: FetchSession<TimedOut>) -> Self {
        AnySession::TimedOut(s)
    }
}

impl From<FetchSession<CopyFailed>> for AnySession {
    fn from(s: FetchSession<CopyFailed>) -> Self {
        AnySession::CopyFailed(s)
    }
}

impl From<FetchSession<Cancelled>> for AnySession {
    fn from(s: FetchSession<Cancelled>) -> Self {
        AnySession::Cancelled(s)
    }
}

impl From<SignalResult> for AnySession {
    fn from(result: SignalResult) -> Self {
        match result {
            SignalResult::Sent(s) => s.into(),
            SignalResult::Cancelled(s) => s.into(),
        }
    }
}

impl From<PollResult> for AnySession {
    fn from(result: PollResult) -> Self {
        match result {
            PollResult::Available(s) => s.into(),
            PollResult::TimedOut(s) => s.into(),
            PollResult::Cancelled(s) => s.into(),
        }
    }
}

impl From<CopyResult> for AnySession {
    fn from(result: CopyResult) -> Self {
        match result {
            CopyResult::Delivered(s) => s.into(),
            CopyResult::CopyFailed(s) => s.into(),
        }
    }
}
