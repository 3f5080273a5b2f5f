//! Orchestrator behavior against a scripted chat client.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use faceoff_core::{BackendConfig, ComparisonSession, FaceoffError, ResponseState};
use faceoff_interaction::chat_client::{
    ChatClient, ChatError, ChatEvent, ChatEventStream, ChatRequest, Role,
};
use faceoff_interaction::{ComparisonOrchestrator, SERVER_UNREACHABLE};

/// One scripted step of a backend's stream.
#[derive(Clone)]
enum Step {
    Chunk(&'static str),
    Delay(Duration),
    Fail(&'static str),
}

#[derive(Clone)]
struct Script {
    steps: Vec<Step>,
    token_count: Option<u32>,
}

impl Script {
    fn completing(steps: Vec<Step>, token_count: Option<u32>) -> Self {
        Self { steps, token_count }
    }

    fn failing(steps: Vec<Step>) -> Self {
        Self {
            steps,
            token_count: None,
        }
    }
}

/// Chat client that replays a script per model identifier.
struct MockChatClient {
    reachable: bool,
    scripts: Mutex<HashMap<String, Script>>,
    stream_calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockChatClient {
    fn new(reachable: bool) -> Self {
        Self {
            reachable,
            scripts: Mutex::new(HashMap::new()),
            stream_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    fn script(self, model: &str, script: Script) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(model.to_string(), script);
        self
    }

    fn stream_call_count(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatClient for MockChatClient {
    async fn is_reachable(&self) -> bool {
        self.reachable
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChatEventStream, ChatError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .remove(&request.model)
            .ok_or_else(|| ChatError::Api(format!("no script for model {}", request.model)))?;
        self.requests.lock().unwrap().push(request);

        let queue: VecDeque<Step> = script.steps.into();
        let state = (queue, Some(script.token_count));
        Ok(Box::pin(futures::stream::unfold(
            state,
            |(mut queue, mut terminal)| async move {
                loop {
                    match queue.pop_front() {
                        Some(Step::Delay(delay)) => tokio::time::sleep(delay).await,
                        Some(Step::Chunk(text)) => {
                            return Some((
                                Ok(ChatEvent::Chunk(text.to_string())),
                                (queue, terminal),
                            ));
                        }
                        Some(Step::Fail(message)) => {
                            queue.clear();
                            terminal = None;
                            return Some((
                                Err(ChatError::Api(message.to_string())),
                                (queue, terminal),
                            ));
                        }
                        None => {
                            return terminal.take().map(|token_count| {
                                (Ok(ChatEvent::Done { token_count }), (queue, None))
                            });
                        }
                    }
                }
            },
        )))
    }
}

fn two_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig::new("modelX", "modelx"),
        BackendConfig::new("modelY", "modely"),
    ]
}

async fn wait_for_completion(
    orchestrator: &ComparisonOrchestrator,
    timeout: Duration,
) -> ComparisonSession {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(session) = orchestrator.current_session().await {
            if session.is_completed() {
                return session;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "comparison did not complete within {:?}",
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_comparison_runs_to_completion() {
    let client = MockChatClient::new(true)
        .script(
            "modelx",
            Script::completing(
                vec![
                    Step::Chunk("The..."),
                    Step::Delay(Duration::from_millis(20)),
                    Step::Chunk("...done"),
                ],
                Some(42),
            ),
        )
        .script(
            "modely",
            Script::completing(vec![Step::Chunk("Short answer")], Some(7)),
        );
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client))
        .with_flush_interval(Duration::from_millis(5));

    orchestrator
        .start_comparison("Summarize the French Revolution", None, &two_backends())
        .await
        .unwrap();

    let session = wait_for_completion(&orchestrator, Duration::from_secs(2)).await;

    assert!(session.completed_at.is_some());
    assert_eq!(session.responses[0].text, "The......done");
    assert_eq!(session.responses[0].state, ResponseState::Completed);
    assert_eq!(session.responses[0].token_count, Some(42));
    assert!(session.responses[0].response_time.is_some());
    assert_eq!(session.responses[1].text, "Short answer");

    // The finished session is archived exactly once.
    let history = orchestrator.history().await;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, session.id);
}

#[tokio::test]
async fn test_system_prompt_is_sent_ahead_of_user_prompt() {
    let client = Arc::new(
        MockChatClient::new(true)
            .script("modelx", Script::completing(vec![Step::Chunk("ok")], None))
            .script("modely", Script::completing(vec![Step::Chunk("ok")], None)),
    );
    let orchestrator = ComparisonOrchestrator::new(client.clone());

    orchestrator
        .start_comparison(
            "Summarize",
            Some("Answer in one sentence.".to_string()),
            &two_backends(),
        )
        .await
        .unwrap();
    wait_for_completion(&orchestrator, Duration::from_secs(2)).await;

    let requests = client.requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    for request in requests.iter() {
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[0].content, "Answer in one sentence.");
        assert_eq!(request.messages[1].role, Role::User);
        assert_eq!(request.messages[1].content, "Summarize");
    }
}

#[tokio::test]
async fn test_partial_failure_keeps_siblings_streaming() {
    let client = MockChatClient::new(true)
        .script(
            "modelx",
            Script::completing(
                vec![
                    Step::Chunk("The..."),
                    Step::Delay(Duration::from_millis(60)),
                    Step::Chunk("...done"),
                ],
                None,
            ),
        )
        .script(
            "modely",
            Script::failing(vec![Step::Delay(Duration::from_millis(10)), Step::Fail("timeout")]),
        );
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client))
        .with_flush_interval(Duration::from_millis(5));

    orchestrator
        .start_comparison("Summarize the French Revolution", None, &two_backends())
        .await
        .unwrap();

    let session = wait_for_completion(&orchestrator, Duration::from_secs(2)).await;

    // modelY failed first, modelX still ran to completion.
    assert_eq!(session.responses[0].state, ResponseState::Completed);
    assert_eq!(session.responses[0].text, "The......done");
    assert_eq!(
        session.responses[1].state,
        ResponseState::Error("Chat API error: timeout".to_string())
    );

    // Statistics only consider completed units.
    let fastest = session.fastest_response().unwrap();
    assert_eq!(fastest.backend_name, "modelX");
    assert_eq!(
        session.average_response_time(),
        session.responses[0].response_time
    );

    // The error message survives verbatim in the Markdown report.
    let path = orchestrator.export_markdown().await.unwrap();
    let report = std::fs::read_to_string(&path).unwrap();
    assert!(report.contains("### modelY"));
    assert!(report.contains("**Error:** Chat API error: timeout"));
    std::fs::remove_file(path).ok();
}

#[tokio::test]
async fn test_unreachable_server_fails_fast() {
    let client = Arc::new(MockChatClient::new(false));
    let orchestrator = ComparisonOrchestrator::new(client.clone());

    orchestrator
        .start_comparison("prompt", None, &two_backends())
        .await
        .unwrap();

    // No polling needed: the fan-out fails before start returns.
    let session = orchestrator.current_session().await.unwrap();
    assert!(session.is_completed());
    for unit in &session.responses {
        assert_eq!(
            unit.state,
            ResponseState::Error(SERVER_UNREACHABLE.to_string())
        );
    }
    assert_eq!(client.stream_call_count(), 0);
    assert_eq!(orchestrator.history().await.len(), 1);
}

#[tokio::test]
async fn test_empty_backend_list_is_ignored() {
    // Documents current behavior: an empty selection leaves whatever
    // session was previously active untouched instead of clearing it.
    let client = MockChatClient::new(true)
        .script("modelx", Script::completing(vec![Step::Chunk("hi")], None))
        .script("modely", Script::completing(vec![Step::Chunk("hi")], None));
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client));

    orchestrator.start_comparison("prompt", None, &[]).await.unwrap();
    assert!(orchestrator.current_session().await.is_none());

    orchestrator
        .start_comparison("prompt", None, &two_backends())
        .await
        .unwrap();
    let session = wait_for_completion(&orchestrator, Duration::from_secs(2)).await;

    orchestrator.start_comparison("ignored", None, &[]).await.unwrap();
    let unchanged = orchestrator.current_session().await.unwrap();
    assert_eq!(unchanged.id, session.id);
    assert_eq!(unchanged.prompt, "prompt");
}

#[tokio::test]
async fn test_stop_all_leaves_no_streaming_units() {
    let client = MockChatClient::new(true)
        .script(
            "modelx",
            Script::completing(
                vec![
                    Step::Delay(Duration::from_millis(10)),
                    Step::Chunk("partial"),
                    Step::Delay(Duration::from_secs(30)),
                    Step::Chunk("never delivered"),
                ],
                None,
            ),
        )
        .script(
            "modely",
            Script::completing(
                vec![
                    Step::Delay(Duration::from_millis(10)),
                    Step::Chunk("also partial"),
                    Step::Delay(Duration::from_secs(30)),
                ],
                None,
            ),
        );
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client))
        .with_flush_interval(Duration::from_millis(5));

    orchestrator
        .start_comparison("prompt", None, &two_backends())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    orchestrator.stop_all_generations().await.unwrap();

    let session = orchestrator.current_session().await.unwrap();
    assert!(session.is_completed());
    for unit in &session.responses {
        // A user stop is completion, not failure.
        assert_eq!(unit.state, ResponseState::Completed);
        assert!(unit.response_time.is_some());
    }
    // Text flushed before the stop is preserved.
    assert_eq!(session.responses[0].text, "partial");
    assert_eq!(session.responses[1].text, "also partial");
    assert_eq!(orchestrator.history().await.len(), 1);

    // Give cancelled tasks a moment; they must not mutate settled state.
    let text_before = session.responses[0].text.clone();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let session = orchestrator.current_session().await.unwrap();
    assert_eq!(session.responses[0].text, text_before);
}

#[tokio::test]
async fn test_operations_without_session_return_typed_error() {
    let orchestrator = ComparisonOrchestrator::new(Arc::new(MockChatClient::new(true)));

    assert!(matches!(
        orchestrator.stop_all_generations().await,
        Err(FaceoffError::NoActiveSession)
    ));
    assert!(matches!(
        orchestrator.clear_comparison().await,
        Err(FaceoffError::NoActiveSession)
    ));
    assert!(matches!(
        orchestrator.export_json().await,
        Err(FaceoffError::NoActiveSession)
    ));
    assert!(matches!(
        orchestrator.export_markdown().await,
        Err(FaceoffError::NoActiveSession)
    ));
}

#[tokio::test]
async fn test_clear_comparison_keeps_history() {
    let client = MockChatClient::new(true)
        .script("modelx", Script::completing(vec![Step::Chunk("hi")], None))
        .script("modely", Script::completing(vec![Step::Chunk("hi")], None));
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client));

    orchestrator
        .start_comparison("prompt", None, &two_backends())
        .await
        .unwrap();
    wait_for_completion(&orchestrator, Duration::from_secs(2)).await;

    orchestrator.clear_comparison().await.unwrap();
    assert!(orchestrator.current_session().await.is_none());
    assert_eq!(orchestrator.history().await.len(), 1);

    orchestrator.clear_history().await;
    assert!(orchestrator.history().await.is_empty());
}

#[tokio::test]
async fn test_throttle_buffers_but_never_drops_text() {
    // With a very long flush interval the first chunk stays buffered while
    // streaming, yet the final flush still delivers the complete text.
    let client = MockChatClient::new(true).script(
        "modelx",
        Script::completing(
            vec![
                Step::Chunk("hello "),
                Step::Delay(Duration::from_millis(80)),
                Step::Chunk("world"),
            ],
            None,
        ),
    );
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client))
        .with_flush_interval(Duration::from_secs(10));

    let backends = vec![BackendConfig::new("modelX", "modelx")];
    orchestrator
        .start_comparison("prompt", None, &backends)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    let mid_stream = orchestrator.current_session().await.unwrap();
    assert_eq!(mid_stream.responses[0].text, "");
    assert!(mid_stream.responses[0].is_streaming());

    let session = wait_for_completion(&orchestrator, Duration::from_secs(2)).await;
    assert_eq!(session.responses[0].text, "hello world");
}

#[tokio::test]
async fn test_export_json_idempotent_modulo_timestamp() {
    let client = MockChatClient::new(true)
        .script("modelx", Script::completing(vec![Step::Chunk("alpha")], Some(3)))
        .script("modely", Script::failing(vec![Step::Fail("boom")]));
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client));

    orchestrator
        .start_comparison("prompt", Some("system".to_string()), &two_backends())
        .await
        .unwrap();
    let session = wait_for_completion(&orchestrator, Duration::from_secs(2)).await;

    let first_path = orchestrator.export_json().await.unwrap();
    let mut first: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&first_path).unwrap()).unwrap();
    let second_path = orchestrator.export_json().await.unwrap();
    let mut second: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&second_path).unwrap()).unwrap();

    assert_eq!(
        first_path.file_name().unwrap().to_str().unwrap(),
        format!("comparison-{}.json", session.id)
    );

    first["exported_at"] = serde_json::Value::Null;
    second["exported_at"] = serde_json::Value::Null;
    assert_eq!(first, second);

    std::fs::remove_file(first_path).ok();
}

#[tokio::test]
async fn test_unit_timeout_expires_one_unit_only() {
    let client = MockChatClient::new(true)
        .script(
            "modelx",
            Script::completing(
                vec![Step::Chunk("stalled "), Step::Delay(Duration::from_secs(30))],
                None,
            ),
        )
        .script("modely", Script::completing(vec![Step::Chunk("quick")], Some(2)));
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client))
        .with_flush_interval(Duration::from_millis(5))
        .with_unit_timeout(Duration::from_millis(150));

    orchestrator
        .start_comparison("prompt", None, &two_backends())
        .await
        .unwrap();

    let session = wait_for_completion(&orchestrator, Duration::from_secs(2)).await;

    // Expiry behaves like a user stop scoped to the expired unit.
    assert_eq!(session.responses[0].state, ResponseState::Completed);
    assert_eq!(session.responses[0].text, "stalled ");
    assert_eq!(session.responses[1].state, ResponseState::Completed);
    assert_eq!(session.responses[1].text, "quick");
    assert_eq!(session.responses[1].token_count, Some(2));
}

#[tokio::test]
async fn test_new_comparison_replaces_and_settles_previous() {
    let client = MockChatClient::new(true)
        .script(
            "modelx",
            Script::completing(
                vec![Step::Chunk("first run"), Step::Delay(Duration::from_secs(30))],
                None,
            ),
        )
        .script("modely", Script::completing(vec![Step::Chunk("second run")], None));
    let orchestrator = ComparisonOrchestrator::new(Arc::new(client))
        .with_flush_interval(Duration::from_millis(5));

    let first = vec![BackendConfig::new("modelX", "modelx")];
    orchestrator
        .start_comparison("first", None, &first)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = vec![BackendConfig::new("modelY", "modely")];
    orchestrator
        .start_comparison("second", None, &second)
        .await
        .unwrap();

    let session = wait_for_completion(&orchestrator, Duration::from_secs(2)).await;
    assert_eq!(session.prompt, "second");

    // The superseded session was settled and archived before replacement.
    let history = orchestrator.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].prompt, "first");
    assert!(history[0].is_completed());
    assert_eq!(history[0].responses[0].state, ResponseState::Completed);
}
