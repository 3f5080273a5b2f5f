//! Comparison session domain model.
//!
//! This module contains the core entities for one comparison run: the
//! per-backend [`ModelResponse`] unit and the [`ComparisonSession`]
//! aggregate. These are "pure" models the orchestration layer operates on.
//! They are independent of any transport or storage format.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::backend::BackendConfig;

/// Lifecycle state of a single backend's response within a session.
///
/// `Completed` and `Error` are terminal: once a unit reaches one of them it
/// never transitions again within the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "message", rename_all = "snake_case")]
pub enum ResponseState {
    /// The backend is still producing output.
    Streaming,
    /// The backend finished normally, or the user stopped generation.
    Completed,
    /// The backend failed; carries the error description.
    Error(String),
}

impl ResponseState {
    /// Returns true for `Completed` and `Error`.
    pub fn is_terminal(&self) -> bool {
        match self {
            ResponseState::Streaming => false,
            ResponseState::Completed | ResponseState::Error(_) => true,
        }
    }

    /// Returns the error description when this is an `Error` state.
    pub fn error_message(&self) -> Option<&str> {
        match self {
            ResponseState::Error(message) => Some(message),
            ResponseState::Streaming | ResponseState::Completed => None,
        }
    }
}

/// One backend's participation in a comparison session.
///
/// Units are created when the session starts, mutated only by the
/// orchestrator in response to backend events, and never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    /// Unique identifier for this unit.
    pub id: String,
    /// The backend this unit belongs to.
    pub backend_id: String,
    /// Display name of the backend, stable for the session's lifetime.
    pub backend_name: String,
    /// Accumulated response text; append-only while streaming.
    pub text: String,
    /// Current lifecycle state.
    pub state: ResponseState,
    /// Elapsed response time in seconds; set exactly once on completion.
    pub response_time: Option<f64>,
    /// Generated token count, when the backend reports one.
    pub token_count: Option<u32>,
    /// When streaming started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the unit reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,
}

impl ModelResponse {
    /// Creates a new unit in the `Streaming` state with `started_at = now`.
    pub fn new(backend: &BackendConfig) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            backend_id: backend.id.clone(),
            backend_name: backend.name.clone(),
            text: String::new(),
            state: ResponseState::Streaming,
            response_time: None,
            token_count: None,
            started_at: Some(Utc::now()),
            finished_at: None,
        }
    }

    /// Appends a text chunk in arrival order.
    ///
    /// Ignored once the unit is terminal, so a late flush from a cancelled
    /// task cannot mutate settled state.
    pub fn append_text(&mut self, chunk: &str) {
        if self.state.is_terminal() {
            return;
        }
        self.text.push_str(chunk);
    }

    /// Transitions `Streaming -> Completed`.
    ///
    /// Stamps `finished_at` and computes `response_time` from the start
    /// timestamp. Ignored if the unit is already terminal.
    pub fn complete(&mut self, token_count: Option<u32>) {
        if self.state.is_terminal() {
            return;
        }

        let finished = Utc::now();
        self.state = ResponseState::Completed;
        self.finished_at = Some(finished);
        if token_count.is_some() {
            self.token_count = token_count;
        }
        self.response_time = self
            .started_at
            .map(|started| duration_seconds(started, finished));
    }

    /// Transitions `Streaming -> Error(message)`.
    ///
    /// Stamps `finished_at`. Ignored if the unit is already terminal.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.state.is_terminal() {
            return;
        }

        self.state = ResponseState::Error(message.into());
        self.finished_at = Some(Utc::now());
    }

    /// Returns true while the unit is still streaming.
    pub fn is_streaming(&self) -> bool {
        self.state == ResponseState::Streaming
    }

    /// Returns true once the unit completed normally.
    pub fn is_completed(&self) -> bool {
        self.state == ResponseState::Completed
    }
}

/// One comparison run: a fixed set of backends answering one shared prompt.
///
/// The session is exclusively owned by the orchestrator while active. Once
/// every unit is terminal it becomes effectively immutable; the orchestrator
/// archives a read-only copy into its history list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonSession {
    pub id: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    /// One unit per backend, in selection order.
    pub responses: Vec<ModelResponse>,
    pub created_at: DateTime<Utc>,
    /// Set once, the first time every unit becomes terminal.
    pub completed_at: Option<DateTime<Utc>>,
}

impl ComparisonSession {
    /// Creates a new session with one streaming unit per backend.
    ///
    /// # Arguments
    ///
    /// * `prompt` - The shared user prompt
    /// * `system_prompt` - Optional system prompt sent before the user prompt
    /// * `backends` - Selected backends, in selection order
    pub fn new(
        prompt: impl Into<String>,
        system_prompt: Option<String>,
        backends: &[BackendConfig],
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            prompt: prompt.into(),
            system_prompt,
            responses: backends.iter().map(ModelResponse::new).collect(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Returns the unit for the given backend, if it participates.
    pub fn response(&self, backend_id: &str) -> Option<&ModelResponse> {
        self.responses.iter().find(|r| r.backend_id == backend_id)
    }

    /// Mutable access to the unit for the given backend.
    pub fn response_mut(&mut self, backend_id: &str) -> Option<&mut ModelResponse> {
        self.responses
            .iter_mut()
            .find(|r| r.backend_id == backend_id)
    }

    /// Returns true once every unit is terminal.
    pub fn is_completed(&self) -> bool {
        self.responses.iter().all(|r| r.state.is_terminal())
    }

    /// Returns true while any unit is still streaming.
    pub fn is_streaming(&self) -> bool {
        self.responses.iter().any(|r| r.is_streaming())
    }

    /// Stamps `completed_at` if all units are terminal and it is not yet set.
    ///
    /// Returns true only when this call performed the stamping, so the
    /// caller can run archive-on-completion logic exactly once. Never
    /// unsets or recomputes an existing timestamp.
    pub fn mark_completed(&mut self) -> bool {
        if self.completed_at.is_some() || !self.is_completed() {
            return false;
        }
        self.completed_at = Some(Utc::now());
        true
    }

    /// The completed unit with the minimum response time.
    ///
    /// Ties keep the earliest unit in selection order. `None` if no unit
    /// has completed.
    pub fn fastest_response(&self) -> Option<&ModelResponse> {
        let mut fastest: Option<&ModelResponse> = None;
        for response in &self.responses {
            let Some(time) = completed_time(response) else {
                continue;
            };
            match fastest.and_then(completed_time) {
                Some(best) if time >= best => {}
                _ => fastest = Some(response),
            }
        }
        fastest
    }

    /// Arithmetic mean of `response_time` over completed units.
    ///
    /// `None` if no unit has completed.
    pub fn average_response_time(&self) -> Option<f64> {
        let times: Vec<f64> = self.responses.iter().filter_map(completed_time).collect();
        if times.is_empty() {
            return None;
        }
        Some(times.iter().sum::<f64>() / times.len() as f64)
    }

    /// The completed unit with the most response characters.
    ///
    /// Ties keep the earliest unit in selection order. `None` if no unit
    /// has completed.
    pub fn longest_response(&self) -> Option<&ModelResponse> {
        let mut longest: Option<(usize, &ModelResponse)> = None;
        for response in &self.responses {
            if !response.is_completed() {
                continue;
            }
            let len = response.text.chars().count();
            match longest {
                Some((best, _)) if len <= best => {}
                _ => longest = Some((len, response)),
            }
        }
        longest.map(|(_, response)| response)
    }

    /// Number of units that completed normally.
    pub fn completed_count(&self) -> usize {
        self.responses.iter().filter(|r| r.is_completed()).count()
    }

    /// Number of units that failed.
    pub fn error_count(&self) -> usize {
        self.responses
            .iter()
            .filter(|r| matches!(r.state, ResponseState::Error(_)))
            .count()
    }
}

fn completed_time(response: &ModelResponse) -> Option<f64> {
    if response.is_completed() {
        response.response_time
    } else {
        None
    }
}

fn duration_seconds(start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
    (end - start).num_milliseconds() as f64 / 1000.0
}
