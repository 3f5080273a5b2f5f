//! Export artifact rendering.
//!
//! Both renderers are pure, read-only transforms of a session snapshot:
//! identical input state and export timestamp yield byte-identical output.
//! Exporting a still-streaming session is legal; incomplete units are
//! reported as still loading.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use faceoff_core::{ComparisonSession, ModelResponse, ResponseState, Result};
use serde::Serialize;

/// Structured export of one comparison session.
#[derive(Debug, Clone, Serialize)]
pub struct ComparisonExport {
    pub session_id: String,
    pub prompt: String,
    pub system_prompt: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub exported_at: String,
    pub responses: Vec<ResponseExport>,
}

/// One backend's row in the structured export.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseExport {
    pub backend_name: String,
    pub response_text: String,
    pub response_time: Option<f64>,
    pub token_count: Option<u32>,
    pub succeeded: bool,
    pub error_message: Option<String>,
}

impl ComparisonExport {
    /// Builds the export DTO from a session snapshot.
    ///
    /// # Arguments
    ///
    /// * `session` - The session to export (completed or not)
    /// * `exported_at` - Timestamp embedded as the export time
    pub fn from_session(session: &ComparisonSession, exported_at: DateTime<Utc>) -> Self {
        Self {
            session_id: session.id.clone(),
            prompt: session.prompt.clone(),
            system_prompt: session.system_prompt.clone(),
            created_at: rfc3339(session.created_at),
            completed_at: session.completed_at.map(rfc3339),
            exported_at: rfc3339(exported_at),
            responses: session.responses.iter().map(ResponseExport::from_unit).collect(),
        }
    }
}

impl ResponseExport {
    fn from_unit(unit: &ModelResponse) -> Self {
        Self {
            backend_name: unit.backend_name.clone(),
            response_text: unit.text.clone(),
            response_time: unit.response_time,
            token_count: unit.token_count,
            succeeded: unit.is_completed(),
            error_message: unit.state.error_message().map(str::to_string),
        }
    }
}

/// Renders the structured JSON artifact: pretty-printed, sorted keys,
/// RFC 3339 timestamps.
pub fn render_json(session: &ComparisonSession, exported_at: DateTime<Utc>) -> Result<String> {
    let export = ComparisonExport::from_session(session, exported_at);
    // Serializing through Value sorts object keys.
    let value = serde_json::to_value(&export)?;
    Ok(format!("{}\n", serde_json::to_string_pretty(&value)?))
}

/// Renders the human-readable Markdown report.
pub fn render_markdown(session: &ComparisonSession, exported_at: DateTime<Utc>) -> String {
    let mut out = String::new();

    out.push_str("# Model Comparison Report\n\n");
    out.push_str(&format!("- **Session:** {}\n", session.id));
    out.push_str(&format!("- **Created:** {}\n", rfc3339(session.created_at)));
    match session.completed_at {
        Some(completed) => out.push_str(&format!("- **Completed:** {}\n", rfc3339(completed))),
        None => out.push_str("- **Completed:** in progress\n"),
    }
    out.push_str(&format!("- **Exported:** {}\n\n", rfc3339(exported_at)));

    out.push_str("## Prompt\n\n");
    push_quoted(&mut out, &session.prompt);

    if let Some(system_prompt) = &session.system_prompt {
        out.push_str("## System Prompt\n\n");
        push_quoted(&mut out, system_prompt);
    }

    out.push_str("## Summary\n\n");
    out.push_str(&format!("- Backends: {}\n", session.responses.len()));
    out.push_str(&format!("- Completed: {}\n", session.completed_count()));
    out.push_str(&format!("- Errors: {}\n", session.error_count()));
    if let Some(fastest) = session.fastest_response() {
        out.push_str(&format!(
            "- Fastest response: {} ({})\n",
            fastest.backend_name,
            format_seconds(fastest.response_time)
        ));
    }
    if let Some(average) = session.average_response_time() {
        out.push_str(&format!(
            "- Average response time: {}\n",
            format_seconds(Some(average))
        ));
    }
    if let Some(longest) = session.longest_response() {
        out.push_str(&format!(
            "- Longest response: {} ({} chars)\n",
            longest.backend_name,
            longest.text.chars().count()
        ));
    }
    out.push('\n');

    out.push_str("## Responses\n");
    for unit in &session.responses {
        out.push('\n');
        out.push_str(&format!("### {}\n\n", unit.backend_name));
        match &unit.state {
            ResponseState::Streaming => {
                out.push_str("_Still loading..._\n");
            }
            ResponseState::Completed => {
                match (unit.response_time, unit.token_count) {
                    (time @ Some(_), Some(tokens)) => out.push_str(&format!(
                        "**Status:** completed in {} ({} tokens)\n\n",
                        format_seconds(time),
                        tokens
                    )),
                    (time @ Some(_), None) => out.push_str(&format!(
                        "**Status:** completed in {}\n\n",
                        format_seconds(time)
                    )),
                    (None, _) => out.push_str("**Status:** completed\n\n"),
                }
                if unit.text.is_empty() {
                    out.push_str("_(empty response)_\n");
                } else {
                    out.push_str(&unit.text);
                    out.push('\n');
                }
            }
            ResponseState::Error(message) => {
                out.push_str(&format!("**Error:** {}\n", message));
            }
        }
    }

    out
}

/// Writes one export artifact as `comparison-<sessionId>.<extension>`.
///
/// Returns the path of the written file.
pub fn write_export(
    dir: &Path,
    session_id: &str,
    extension: &str,
    contents: &str,
) -> Result<PathBuf> {
    let path = dir.join(format!("comparison-{}.{}", session_id, extension));
    fs::write(&path, contents)?;
    tracing::debug!("wrote export artifact to {}", path.display());
    Ok(path)
}

fn rfc3339(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn format_seconds(seconds: Option<f64>) -> String {
    match seconds {
        Some(seconds) => format!("{:.2}s", seconds),
        None => "-".to_string(),
    }
}

fn push_quoted(out: &mut String, text: &str) {
    for line in text.lines() {
        out.push_str("> ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
}
