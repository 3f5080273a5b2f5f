//! Core domain model for Faceoff.
//!
//! Faceoff runs one prompt against several locally hosted model backends at
//! once and aggregates the results. This crate holds the pure domain
//! entities: the backend descriptor, the per-backend response unit, the
//! comparison session aggregate with its derived statistics, and the shared
//! error type. Orchestration and transport live in `faceoff-interaction`;
//! export artifacts live in `faceoff-infrastructure`.

pub mod backend;
pub mod error;
pub mod session;

// Re-export common types
pub use backend::BackendConfig;
pub use error::{FaceoffError, Result};
pub use session::{ComparisonSession, ModelResponse, ResponseState};
