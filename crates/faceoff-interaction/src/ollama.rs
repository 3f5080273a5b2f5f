//! Ollama chat client for locally hosted LLM inference.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::chat_client::{
    ChatClient, ChatError, ChatEvent, ChatEventStream, ChatOptions, ChatRequest,
};

/// Default Ollama server URL.
pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

/// Timeout for the reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Chat client speaking the Ollama HTTP API.
///
/// One client instance is shared by every backend of a comparison; backends
/// differ only in the model identifier carried by the request.
pub struct OllamaChatClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaChatClient {
    /// Creates a client pointed at the default local server.
    pub fn new() -> Self {
        Self::with_url(DEFAULT_OLLAMA_URL)
    }

    /// Creates a client with a custom base URL.
    pub fn with_url(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Default for OllamaChatClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Wire request for the Ollama `/api/chat` endpoint.
#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Debug, Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

/// One NDJSON line of a streamed `/api/chat` response.
#[derive(Debug, Deserialize)]
struct OllamaChatChunk {
    #[serde(default)]
    message: Option<OllamaChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OllamaChunkMessage {
    #[serde(default)]
    content: String,
}

impl From<ChatRequest> for OllamaChatRequest {
    fn from(request: ChatRequest) -> Self {
        Self {
            model: request.model,
            messages: request
                .messages
                .into_iter()
                .map(|m| OllamaMessage {
                    role: m.role.as_str().to_string(),
                    content: m.content,
                })
                .collect(),
            stream: true,
            options: request.options,
        }
    }
}

#[async_trait::async_trait]
impl ChatClient for OllamaChatClient {
    async fn is_reachable(&self) -> bool {
        let tags_url = format!("{}/api/tags", self.base_url);
        match self
            .client
            .get(&tags_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                log::debug!("Ollama reachability probe failed: {}", err);
                false
            }
        }
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatEventStream, ChatError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = OllamaChatRequest::from(request);

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                if err.is_connect() {
                    ChatError::ServerUnreachable(self.base_url.clone())
                } else {
                    ChatError::Http(err)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ChatError::Api(format!("{}: {}", status, text)));
        }

        // Forward NDJSON lines as events through a channel. The reader task
        // exits as soon as the receiving stream is dropped, which ends the
        // HTTP subscription.
        let (tx, rx) = mpsc::channel::<Result<ChatEvent, ChatError>>(32);
        tokio::spawn(async move {
            let bytes = response.bytes_stream();
            futures::pin_mut!(bytes);

            let mut decoder = LineDecoder::default();
            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        let _ = tx.send(Err(ChatError::Http(err))).await;
                        return;
                    }
                };
                for line in decoder.push(&chunk) {
                    match forward_line(&line, &tx).await {
                        LineOutcome::Continue => {}
                        LineOutcome::Finished => return,
                    }
                }
            }

            // Connection closed: drain a trailing unterminated line, then
            // treat a missing done marker as a broken stream.
            if let Some(line) = decoder.finish() {
                if let LineOutcome::Finished = forward_line(&line, &tx).await {
                    return;
                }
            }
            let _ = tx
                .send(Err(ChatError::Stream(
                    "stream ended before completion".to_string(),
                )))
                .await;
        });

        Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        })))
    }
}

enum LineOutcome {
    Continue,
    Finished,
}

async fn forward_line(
    line: &str,
    tx: &mpsc::Sender<Result<ChatEvent, ChatError>>,
) -> LineOutcome {
    if line.trim().is_empty() {
        return LineOutcome::Continue;
    }

    let chunk: OllamaChatChunk = match serde_json::from_str(line) {
        Ok(chunk) => chunk,
        Err(err) => {
            let _ = tx.send(Err(ChatError::Json(err))).await;
            return LineOutcome::Finished;
        }
    };

    if let Some(error) = chunk.error {
        let _ = tx.send(Err(ChatError::Api(error))).await;
        return LineOutcome::Finished;
    }

    if let Some(message) = chunk.message {
        if !message.content.is_empty()
            && tx
                .send(Ok(ChatEvent::Chunk(message.content)))
                .await
                .is_err()
        {
            // Receiver dropped: the subscription was cancelled.
            return LineOutcome::Finished;
        }
    }

    if chunk.done {
        let _ = tx
            .send(Ok(ChatEvent::Done {
                token_count: chunk.eval_count,
            }))
            .await;
        return LineOutcome::Finished;
    }

    LineOutcome::Continue
}

/// Reassembles NDJSON lines from arbitrarily split network reads.
#[derive(Default)]
struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    /// Feeds one network read and returns the complete lines it closed.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&raw[..pos]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// Returns the trailing unterminated line, if any.
    fn finish(&mut self) -> Option<String> {
        if self.buffer.iter().all(|b| b.is_ascii_whitespace()) {
            self.buffer.clear();
            return None;
        }
        let raw = std::mem::take(&mut self.buffer);
        Some(String::from_utf8_lossy(&raw).trim_end().to_string())
    }
}
