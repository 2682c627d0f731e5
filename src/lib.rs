//! Fetch-and-deliver orchestration for artifacts produced by a remote peer.
//!
//! Each requested artifact is looked up in a local shared store. If it is
//! missing, the peer is told to produce it and the store is polled until it
//! appears or an attempt bound runs out. Found artifacts are copied to a
//! destination root chosen by the caller.
//!
//! An [`Orchestrator`] runs many such fetch sessions concurrently as a batch
//! and reports a per-artifact [`BatchResult`]. The store, peer and delivery
//! collaborators are traits, with filesystem/WebSocket implementations for
//! production use and mocks for tests.

pub mod batch;
pub mod delivery;
pub mod domain;
pub mod error;
pub mod intake;
pub mod orchestrator;
pub mod peer;
pub mod poller;
pub mod session;
pub mod store;

// Re-export commonly used types
pub use batch::*;
pub use delivery::{
    CopyFailure, CopyFailureReason, Delivery, DeliveryExecutor, FsDelivery, MockDelivery,
};
pub use error::{PeerfetchError, Result};
pub use orchestrator::{BatchHandle, FetchConfig, Orchestrator, SessionEvent, SessionEventKind};
pub use peer::{Ack, MockPeerNotifier, PeerNotifier, SignalFailure, WebSocketNotifier};
pub use poller::{PollConfig, PollOutcome, poll_until_available};
pub use store::{ArtifactStore, MockStore, SharedStore};
