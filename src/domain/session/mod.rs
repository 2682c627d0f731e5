//! Fetch session domain types and transitions.
//!
//! One session per requested artifact, driven from its initial local check
//! to a terminal state by the orchestrator.

pub mod state;
pub mod transitions;

pub use state::*;
