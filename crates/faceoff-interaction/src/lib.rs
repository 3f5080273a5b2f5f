//! Comparison orchestration for Faceoff.
//!
//! The [`ComparisonOrchestrator`] runs one comparison session to completion:
//! it fans a single prompt out to N backends over the shared chat endpoint,
//! streams each backend's output into the session with bounded UI-facing
//! update frequency, handles per-unit failure and user cancellation, and
//! produces export artifacts.

pub mod chat_client;
pub mod ollama;

// Re-export the seam types most callers need
pub use chat_client::ChatClient;
pub use ollama::OllamaChatClient;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::StreamExt;
use futures::future::Either;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use faceoff_core::{BackendConfig, ComparisonSession, FaceoffError, Result};

use crate::chat_client::{ChatEvent, ChatMessage, ChatRequest};

/// Error message fanned out to every unit when the endpoint probe fails.
pub const SERVER_UNREACHABLE: &str = "Server unreachable";

/// Default delay between flushes of a unit's buffered text into session
/// state.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(100);

/// Runs comparison sessions against a shared chat endpoint.
///
/// The orchestrator is an explicit context object: construct one at the
/// application's composition root and hand it to whatever needs it. It owns
/// at most one active session plus the history of finished ones.
///
/// # Thread Safety
///
/// All cross-task mutation of session state funnels through the active
/// session's `RwLock` write guard; per-unit text buffers live inside their
/// streaming task and are never shared.
pub struct ComparisonOrchestrator {
    /// Shared chat endpoint used by every backend.
    client: Arc<dyn ChatClient>,
    /// Currently active session, if any.
    current: Arc<RwLock<Option<ComparisonSession>>>,
    /// Finished sessions, oldest first.
    history: Arc<RwLock<Vec<ComparisonSession>>>,
    /// Cancellation handles for in-flight streaming tasks, by backend ID.
    cancellations: Arc<Mutex<HashMap<String, CancellationToken>>>,
    flush_interval: Duration,
    unit_timeout: Option<Duration>,
}

impl ComparisonOrchestrator {
    /// Creates an orchestrator over the given chat endpoint.
    pub fn new(client: Arc<dyn ChatClient>) -> Self {
        Self {
            client,
            current: Arc::new(RwLock::new(None)),
            history: Arc::new(RwLock::new(Vec::new())),
            cancellations: Arc::new(Mutex::new(HashMap::new())),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            unit_timeout: None,
        }
    }

    /// Overrides the flush throttle interval.
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Enables a per-unit timeout.
    ///
    /// Expiry is equivalent to a user stop for the expired unit only: the
    /// unit is force-completed, its siblings keep streaming.
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = Some(timeout);
        self
    }

    /// Starts a new comparison session.
    ///
    /// With an empty backend list the call is ignored entirely: no session
    /// is created and the previously active session (if any) is left
    /// untouched. Otherwise any in-flight generation of the previous
    /// session is stopped, a fresh session replaces it, and one streaming
    /// task per backend is spawned - unless the shared endpoint is
    /// unreachable, in which case every unit fails immediately with
    /// [`SERVER_UNREACHABLE`] and no backend call is made.
    ///
    /// Prompt emptiness is the caller's responsibility to check.
    ///
    /// # Arguments
    ///
    /// * `prompt` - The shared user prompt
    /// * `system_prompt` - Optional system prompt sent ahead of the prompt
    /// * `backends` - Selected backends, in selection order
    pub async fn start_comparison(
        &self,
        prompt: impl Into<String>,
        system_prompt: Option<String>,
        backends: &[BackendConfig],
    ) -> Result<()> {
        if backends.is_empty() {
            tracing::warn!("start_comparison called with no backends selected; ignoring");
            return Ok(());
        }

        // Settle whatever the previous session still has in flight.
        self.cancel_all().await;

        let session = ComparisonSession::new(prompt, system_prompt, backends);
        let session_id = session.id.clone();
        let prompt = session.prompt.clone();
        let system_prompt = session.system_prompt.clone();
        tracing::info!(
            session_id = %session_id,
            backends = backends.len(),
            "starting comparison"
        );
        *self.current.write().await = Some(session);

        // One probe gates the whole fan-out.
        if !self.client.is_reachable().await {
            tracing::warn!(session_id = %session_id, "chat endpoint unreachable");
            {
                let mut guard = self.current.write().await;
                if let Some(session) = guard.as_mut().filter(|s| s.id == session_id) {
                    for unit in &mut session.responses {
                        unit.fail(SERVER_UNREACHABLE);
                    }
                }
            }
            archive_if_completed(&self.current, &self.history, &session_id).await;
            return Ok(());
        }

        let mut cancellations = self.cancellations.lock().await;
        for backend in backends {
            let cancel = CancellationToken::new();
            cancellations.insert(backend.id.clone(), cancel.clone());

            let task = BackendStreamTask {
                client: Arc::clone(&self.client),
                current: Arc::clone(&self.current),
                history: Arc::clone(&self.history),
                session_id: session_id.clone(),
                backend: backend.clone(),
                prompt: prompt.clone(),
                system_prompt: system_prompt.clone(),
                cancel,
                flush_interval: self.flush_interval,
                unit_timeout: self.unit_timeout,
            };
            tokio::spawn(task.run());
        }

        Ok(())
    }

    /// Stops every in-flight generation of the active session.
    ///
    /// Still-streaming units are force-transitioned to completed - a
    /// user-initiated stop is not a failure. Buffered but unflushed text is
    /// discarded with the cancelled tasks; the orchestrator does not wait
    /// for tasks to acknowledge cancellation.
    ///
    /// # Errors
    ///
    /// Returns [`FaceoffError::NoActiveSession`] if no session is active.
    pub async fn stop_all_generations(&self) -> Result<()> {
        if self.current.read().await.is_none() {
            return Err(FaceoffError::NoActiveSession);
        }
        self.cancel_all().await;
        Ok(())
    }

    /// Stops all generations and drops the active session reference.
    ///
    /// History is not touched.
    ///
    /// # Errors
    ///
    /// Returns [`FaceoffError::NoActiveSession`] if no session is active.
    pub async fn clear_comparison(&self) -> Result<()> {
        self.stop_all_generations().await?;
        *self.current.write().await = None;
        Ok(())
    }

    /// Returns a snapshot of the active session, if any.
    pub async fn current_session(&self) -> Option<ComparisonSession> {
        self.current.read().await.clone()
    }

    /// Returns a snapshot of the finished-session history, oldest first.
    pub async fn history(&self) -> Vec<ComparisonSession> {
        self.history.read().await.clone()
    }

    /// Clears the finished-session history.
    pub async fn clear_history(&self) {
        self.history.write().await.clear();
    }

    /// Writes the structured JSON export of the active session to the
    /// system temporary directory and returns its path.
    ///
    /// Exporting a still-streaming session is legal.
    ///
    /// # Errors
    ///
    /// Returns [`FaceoffError::NoActiveSession`] if no session is active.
    pub async fn export_json(&self) -> Result<PathBuf> {
        let session = self
            .current_session()
            .await
            .ok_or(FaceoffError::NoActiveSession)?;
        let contents = faceoff_infrastructure::export::render_json(&session, Utc::now())?;
        faceoff_infrastructure::export::write_export(
            &std::env::temp_dir(),
            &session.id,
            "json",
            &contents,
        )
    }

    /// Writes the Markdown report of the active session to the system
    /// temporary directory and returns its path.
    ///
    /// # Errors
    ///
    /// Returns [`FaceoffError::NoActiveSession`] if no session is active.
    pub async fn export_markdown(&self) -> Result<PathBuf> {
        let session = self
            .current_session()
            .await
            .ok_or(FaceoffError::NoActiveSession)?;
        let contents = faceoff_infrastructure::export::render_markdown(&session, Utc::now());
        faceoff_infrastructure::export::write_export(
            &std::env::temp_dir(),
            &session.id,
            "md",
            &contents,
        )
    }

    /// Cancels all in-flight tasks and settles still-streaming units.
    async fn cancel_all(&self) {
        // Cancel first so tasks stop emitting before units are settled.
        {
            let mut cancellations = self.cancellations.lock().await;
            for (_, token) in cancellations.drain() {
                token.cancel();
            }
        }

        let session_id = {
            let mut guard = self.current.write().await;
            let Some(session) = guard.as_mut() else {
                return;
            };
            for unit in &mut session.responses {
                if unit.is_streaming() {
                    unit.complete(None);
                }
            }
            session.id.clone()
        };
        archive_if_completed(&self.current, &self.history, &session_id).await;
    }
}

/// Streams one backend's response into the session.
///
/// All per-unit buffering state lives in [`run`](Self::run)'s locals and is
/// torn down with the task.
struct BackendStreamTask {
    client: Arc<dyn ChatClient>,
    current: Arc<RwLock<Option<ComparisonSession>>>,
    history: Arc<RwLock<Vec<ComparisonSession>>>,
    session_id: String,
    backend: BackendConfig,
    prompt: String,
    system_prompt: Option<String>,
    cancel: CancellationToken,
    flush_interval: Duration,
    unit_timeout: Option<Duration>,
}

impl BackendStreamTask {
    async fn run(self) {
        let mut messages = Vec::new();
        if let Some(system_prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(system_prompt.clone()));
        }
        messages.push(ChatMessage::user(self.prompt.clone()));

        let request = ChatRequest {
            model: self.backend.model.clone(),
            messages,
            options: None,
        };

        let mut stream = match self.client.chat_stream(request).await {
            Ok(stream) => stream,
            Err(err) => {
                self.fail_unit(err.to_string()).await;
                return;
            }
        };

        let timeout = match self.unit_timeout {
            Some(timeout) => Either::Left(tokio::time::sleep(timeout)),
            None => Either::Right(futures::future::pending::<()>()),
        };
        tokio::pin!(timeout);

        let mut pending = String::new();
        let mut last_flush = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    // Stop-all already settled the unit; stop emitting.
                    return;
                }
                _ = &mut timeout => {
                    tracing::warn!(
                        backend = %self.backend.name,
                        "unit timeout expired; stopping this backend only"
                    );
                    self.flush(&mut pending).await;
                    self.complete_unit(None).await;
                    return;
                }
                event = stream.next() => match event {
                    Some(Ok(ChatEvent::Chunk(text))) => {
                        pending.push_str(&text);
                        if last_flush.elapsed() >= self.flush_interval {
                            self.flush(&mut pending).await;
                            last_flush = Instant::now();
                        }
                    }
                    Some(Ok(ChatEvent::Done { token_count })) => {
                        // The final flush always drains the complete buffer.
                        self.flush(&mut pending).await;
                        self.complete_unit(token_count).await;
                        return;
                    }
                    Some(Err(err)) => {
                        // Unflushed text is discarded with the failed unit.
                        self.fail_unit(err.to_string()).await;
                        return;
                    }
                    None => {
                        self.flush(&mut pending).await;
                        self.complete_unit(None).await;
                        return;
                    }
                }
            }
        }
    }

    async fn flush(&self, pending: &mut String) {
        if pending.is_empty() {
            return;
        }
        let chunk = std::mem::take(pending);
        self.with_unit(|unit| unit.append_text(&chunk)).await;
    }

    async fn complete_unit(&self, token_count: Option<u32>) {
        self.with_unit(|unit| unit.complete(token_count)).await;
        archive_if_completed(&self.current, &self.history, &self.session_id).await;
    }

    async fn fail_unit(&self, message: String) {
        tracing::warn!(
            backend = %self.backend.name,
            error = %message,
            "backend stream failed"
        );
        self.with_unit(|unit| unit.fail(message.clone())).await;
        archive_if_completed(&self.current, &self.history, &self.session_id).await;
    }

    /// Mutates this task's unit under the session write guard.
    ///
    /// A no-op when the session was replaced or the unit is gone, so a
    /// stale task can never touch a newer session.
    async fn with_unit<F>(&self, mutate: F)
    where
        F: FnOnce(&mut faceoff_core::ModelResponse),
    {
        let mut guard = self.current.write().await;
        if let Some(session) = guard.as_mut().filter(|s| s.id == self.session_id) {
            if let Some(unit) = session.response_mut(&self.backend.id) {
                mutate(unit);
            }
        }
    }
}

/// Stamps `completed_at` and archives a copy into history, exactly once
/// per session, when every unit has reached a terminal state.
async fn archive_if_completed(
    current: &RwLock<Option<ComparisonSession>>,
    history: &RwLock<Vec<ComparisonSession>>,
    session_id: &str,
) {
    let snapshot = {
        let mut guard = current.write().await;
        match guard.as_mut() {
            Some(session) if session.id == session_id => {
                if session.mark_completed() {
                    Some(session.clone())
                } else {
                    None
                }
            }
            _ => None,
        }
    };
    if let Some(session) = snapshot {
        tracing::info!(session_id = %session.id, "comparison completed");
        history.write().await.push(session);
    }
}
