//! Backend descriptor model.
//!
//! A backend is one language-model serving endpoint participating in a
//! comparison. Backends are selected by the caller; this crate does not
//! read any configuration files.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Describes one selectable model backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Unique identifier for this backend selection.
    pub id: String,
    /// Human-readable display name, stable for the session's lifetime.
    pub name: String,
    /// Model identifier sent to the chat endpoint (e.g. "llama3.2:3b").
    pub model: String,
}

impl BackendConfig {
    /// Creates a new backend descriptor with a generated ID.
    ///
    /// # Arguments
    ///
    /// * `name` - Display name shown in session state and exports
    /// * `model` - Model identifier understood by the chat endpoint
    pub fn new(name: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            model: model.into(),
        }
    }

    /// Creates a backend descriptor with an explicit ID.
    pub fn with_id(
        id: impl Into<String>,
        name: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            model: model.into(),
        }
    }
}
