//! Batch and request types.
//!
//! This module re-exports types from `domain::artifact` and `domain::batch`.
//! See those modules for the actual implementations.

pub use crate::domain::artifact::{ArtifactName, FetchRequest};

pub use crate::domain::batch::{BatchId, BatchPlan, BatchResult, FetchOutcome};
