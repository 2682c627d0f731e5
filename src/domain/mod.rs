//! Core domain types for fetching artifacts from a peer.
//!
//! This module contains pure domain types with no I/O of their own:
//! - Artifact names and fetch requests
//! - Batch plans and batch results
//! - The fetch session typestate machine

pub mod artifact;
pub mod batch;
pub mod session;
