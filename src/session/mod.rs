//! Fetch session aggregate - domain model and state transitions.
//!
//! This module re-exports types from `domain::session`.
//! See that module for the actual implementations.

pub use crate::domain::session::state::*;
