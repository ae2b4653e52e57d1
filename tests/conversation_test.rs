//! Conversation loop integration tests
//!
//! Every test runs `Chat::talk` against a wiremock server standing in for an
//! OpenAI-compatible chat completions endpoint, then inspects the answer and
//! the request bodies the loop sent.

use aichat::{
    Chat, Error, HistoryStore, MAX_ITERATIONS, MemoryHistory, Message, Role, Settings,
    ToolExecutor, ToolRegistry, tool,
};
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

const CHAT_PATH: &str = "/v1/chat/completions";

/// Serves the given responses in order, repeating the last one.
struct Sequence {
    responses: Vec<ResponseTemplate>,
    served: AtomicUsize,
}

impl Sequence {
    fn new(responses: Vec<ResponseTemplate>) -> Self {
        Self {
            responses,
            served: AtomicUsize::new(0),
        }
    }
}

impl Respond for Sequence {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.served.fetch_add(1, Ordering::SeqCst);
        self.responses[n.min(self.responses.len() - 1)].clone()
    }
}

fn sse(events: &[Value]) -> ResponseTemplate {
    let mut body = String::new();
    for event in events {
        body.push_str(&format!("data: {}\n\n", event));
    }
    body.push_str("data: [DONE]\n\n");
    ResponseTemplate::new(200).set_body_raw(body, "text/event-stream")
}

fn text_delta(text: &str) -> Value {
    json!({"choices": [{"delta": {"content": text}, "finish_reason": null}]})
}

fn tool_delta(fragments: Value) -> Value {
    json!({"choices": [{"delta": {"tool_calls": fragments}}]})
}

fn settings(server: &MockServer) -> Settings {
    Settings::builder()
        .endpoint(format!("{}{}", server.uri(), CHAT_PATH))
        .model("test-model")
        .api_key("test-key")
        .printable(false)
        .build()
        .unwrap()
}

async fn bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap()
        .iter()
        .map(|request| serde_json::from_slice(&request.body).unwrap())
        .collect()
}

fn file_tools() -> Arc<dyn ToolExecutor> {
    Arc::new(ToolRegistry::new().with_tool(
        tool("read_file", "Read the content of a file")
            .param("filename", "string")
            .build(|args| async move {
                let name = aichat::tools::required_str(&args, "filename")?;
                Ok(json!(format!("contents of {}", name)))
            }),
    ))
}

/// Test: Plain streamed answer
///
/// Scenario: Server streams two content deltas and a finish chunk
/// Expected: Deltas are concatenated, request carries auth, model and stream flag
#[tokio::test]
async fn test_streamed_text_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(sse(&[
            text_delta("Hel"),
            text_delta("lo"),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server)).unwrap();
    let answer = chat.talk(Some("hi"), None).await.unwrap();
    assert_eq!(answer, "Hello");

    let body = &bodies(&server).await[0];
    assert_eq!(body["model"], "test-model");
    assert_eq!(body["stream"], true);
    assert_eq!(body["max_tokens"], 8192);
    assert_eq!(body["reasoning_effort"], "high");
    assert_eq!(body["n"], 1);
    assert!(body.get("tools").is_none());
    assert!(body.get("tool_choice").is_none());
    assert_eq!(
        body["messages"],
        json!([{"role": "user", "content": [{"type": "text", "text": "hi"}]}])
    );
}

/// Test: Streamed tool call round trip
///
/// Scenario: First response streams a fragmented tool call, second answers in text
/// Expected: Tool is executed and its result is sent back keyed by call id and name
#[tokio::test]
async fn test_streamed_tool_call_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(Sequence::new(vec![
            sse(&[
                tool_delta(json!([{"index": 0, "id": "call_1", "function": {"name": "read_file", "arguments": ""}}])),
                tool_delta(json!([{"index": 0, "function": {"arguments": "{\"filename\":"}}])),
                tool_delta(json!([{"index": 0, "function": {"arguments": "\"notes.txt\"}"}}])),
            ]),
            sse(&[text_delta("It says hello.")]),
        ]))
        .expect(2)
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server))
        .unwrap()
        .with_executor(file_tools());
    let answer = chat.talk(Some("read notes.txt"), None).await.unwrap();
    assert_eq!(answer, "It says hello.");

    let bodies = bodies(&server).await;
    assert_eq!(bodies.len(), 2);

    let first = &bodies[0];
    assert_eq!(first["tool_choice"], "auto");
    assert_eq!(first["tools"][0]["function"]["name"], "read_file");

    let messages = bodies[1]["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "");
    assert_eq!(messages[1]["tool_calls"][0]["id"], "call_1");
    assert_eq!(messages[1]["tool_calls"][0]["type"], "function");
    assert_eq!(
        messages[1]["tool_calls"][0]["function"]["arguments"],
        "{\"filename\":\"notes.txt\"}"
    );
    assert_eq!(
        messages[2],
        json!({
            "role": "tool",
            "content": "contents of notes.txt",
            "tool_call_id": "call_1",
            "name": "read_file"
        })
    );
}

/// Test: Iteration ceiling
///
/// Scenario: Server asks for a tool call on every response
/// Expected: Exactly MAX_ITERATIONS requests, every response's call is run,
/// last text returned, no error
#[tokio::test]
async fn test_iteration_ceiling_ends_exchange_normally() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(sse(&[
            text_delta("still working"),
            tool_delta(json!([{"index": 0, "id": "call_loop", "function": {"name": "read_file", "arguments": "{\"filename\":\"a\"}"}}])),
        ]))
        .expect(MAX_ITERATIONS as u64)
        .mount(&server)
        .await;

    let executions = Arc::new(AtomicUsize::new(0));
    let counter = executions.clone();
    let executor: Arc<dyn ToolExecutor> = Arc::new(ToolRegistry::new().with_tool(
        tool("read_file", "Read the content of a file")
            .param("filename", "string")
            .build(move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(json!("ok"))
                }
            }),
    ));

    let chat = Chat::new(settings(&server)).unwrap().with_executor(executor);
    let answer = chat.talk(Some("loop forever"), None).await.unwrap();

    assert_eq!(answer, "still working");
    assert_eq!(bodies(&server).await.len(), MAX_ITERATIONS);
    assert_eq!(executions.load(Ordering::SeqCst), MAX_ITERATIONS);
}

/// Test: Failing tool aborts the exchange
///
/// Scenario: The requested tool returns an error
/// Expected: talk fails with a tool error after a single request
#[tokio::test]
async fn test_failing_tool_aborts_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(sse(&[tool_delta(json!([{"index": 0, "id": "call_x", "function": {"name": "explode", "arguments": "{}"}}]))]))
        .expect(1)
        .mount(&server)
        .await;

    let executor: Arc<dyn ToolExecutor> = Arc::new(ToolRegistry::new().with_tool(
        tool("explode", "Always fails")
            .build(|_| async { Err(Error::tool("boom")) }),
    ));
    let chat = Chat::new(settings(&server)).unwrap().with_executor(executor);

    let err = chat.talk(Some("go"), None).await.unwrap_err();
    match err {
        Error::Tool(msg) => {
            assert!(msg.starts_with("Error executing function explode with args {}"));
            assert!(msg.contains("boom"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Test: Unknown tool name
///
/// Scenario: Model requests a tool the registry does not have
/// Expected: ToolNotFound error
#[tokio::test]
async fn test_unknown_tool_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(sse(&[tool_delta(json!([{"index": 0, "id": "call_y", "function": {"name": "search_engine", "arguments": "{\"keyword\":\"rust\"}"}}]))]))
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server))
        .unwrap()
        .with_executor(file_tools());
    let err = chat.talk(Some("search"), None).await.unwrap_err();
    assert!(matches!(err, Error::ToolNotFound(name) if name == "search_engine"));
}

/// Test: Non-success status
///
/// Scenario: Server answers 500
/// Expected: Api error carrying status and body, no retry
#[tokio::test]
async fn test_api_error_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
        .expect(1)
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server)).unwrap();
    let err = chat.talk(Some("hi"), None).await.unwrap_err();
    match err {
        Error::Api { status, body } => {
            assert_eq!(status, 500);
            assert_eq!(body, "model crashed");
        }
        other => panic!("unexpected error: {other}"),
    }
}

/// Test: Request timeout
///
/// Scenario: Server takes longer to answer than the configured timeout
/// Expected: Timeout error after a single request
#[tokio::test]
async fn test_request_timeout_ends_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(sse(&[text_delta("too late")]).set_delay(std::time::Duration::from_secs(2)))
        .mount(&server)
        .await;

    let settings = Settings::builder()
        .endpoint(format!("{}{}", server.uri(), CHAT_PATH))
        .timeout(1)
        .printable(false)
        .build()
        .unwrap();
    let err = Chat::new(settings)
        .unwrap()
        .talk(Some("hi"), None)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout), "unexpected error: {err}");
    assert_eq!(bodies(&server).await.len(), 1);
}

/// Test: Malformed streamed tool call
///
/// Scenario: Tool call arguments never become valid JSON
/// Expected: The call is dropped, the text is the answer, no second request
#[tokio::test]
async fn test_malformed_tool_call_is_dropped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(sse(&[
            text_delta("partial"),
            tool_delta(json!([{"index": 0, "id": "call_bad", "function": {"name": "read_file", "arguments": "{\"filename\":"}}])),
        ]))
        .expect(1)
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server))
        .unwrap()
        .with_executor(file_tools());
    assert_eq!(chat.talk(Some("x"), None).await.unwrap(), "partial");
}

/// Test: Non-streamed tool calls
///
/// Scenario: Two non-streamed responses, the first with a tool call
/// Expected: stream=false in the body, tool executed, final content returned
#[tokio::test]
async fn test_non_streamed_tool_calls() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(Sequence::new(vec![
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {
                    "role": "assistant",
                    "content": null,
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": {"name": "read_file", "arguments": "{\"filename\":\"b.txt\"}"}
                    }]
                }}]
            })),
            ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "Done."}}]
            })),
        ]))
        .expect(2)
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server))
        .unwrap()
        .with_executor(file_tools());
    let answer = chat.talk(Some("read b"), Some(false)).await.unwrap();
    assert_eq!(answer, "Done.");

    let bodies = bodies(&server).await;
    assert_eq!(bodies[0]["stream"], false);
    assert_eq!(bodies[1]["messages"][2]["content"], "contents of b.txt");
}

/// Test: Non-streamed response without choices
///
/// Expected: Api error
#[tokio::test]
async fn test_non_streamed_missing_choices() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server)).unwrap();
    let err = chat.talk(Some("hi"), Some(false)).await.unwrap_err();
    assert!(matches!(err, Error::Api { status: 200, .. }));
}

/// Test: Filter bus sees every event
///
/// Scenario: Predicates registered for content and finish events
/// Expected: Matching raw events are queued in arrival order
#[tokio::test]
async fn test_filter_bus_receives_raw_events() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(sse(&[
            text_delta("a"),
            text_delta("b"),
            json!({"choices": [{"delta": {}, "finish_reason": "stop"}]}),
        ]))
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server)).unwrap();
    chat.filters()
        .register("content", |e| Ok(e["choices"][0]["delta"]["content"].is_string()))
        .register("finish", |e| Ok(e["choices"][0]["finish_reason"] == "stop"));

    chat.talk(Some("hi"), None).await.unwrap();

    assert_eq!(chat.filters().pending("content"), 2);
    assert_eq!(chat.filters().try_pop("content"), Some(text_delta("a")));
    assert_eq!(chat.filters().pending("finish"), 1);
}

/// Test: History is replayed and saved
///
/// Scenario: Two exchanges share a memory store, with a system prompt
/// Expected: Second request carries system, previous user and assistant, then the new user turn
#[tokio::test]
async fn test_history_is_replayed_between_exchanges() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(Sequence::new(vec![
            sse(&[text_delta("first answer")]),
            sse(&[text_delta("second answer")]),
        ]))
        .mount(&server)
        .await;

    let mut config = settings(&server);
    config.system_prompt = Some("be brief".into());
    let history = Arc::new(MemoryHistory::new());
    let chat = Chat::new(config)
        .unwrap()
        .with_history(history.clone());

    chat.talk(Some("one"), None).await.unwrap();
    chat.talk(Some("two"), None).await.unwrap();

    let stored = history.previous_messages().unwrap();
    assert_eq!(stored.len(), 4);
    assert_eq!(stored[1], Message::assistant("first answer"));
    assert_eq!(stored[3].role, Role::Assistant);

    let messages = bodies(&server).await[1]["messages"].clone();
    assert_eq!(messages[0], json!({"role": "system", "content": "be brief"}));
    assert_eq!(messages[1]["content"][0]["text"], "one");
    assert_eq!(messages[2], json!({"role": "assistant", "content": "first answer"}));
    assert_eq!(messages[3]["content"][0]["text"], "two");
    assert_eq!(messages.as_array().unwrap().len(), 4);
}

/// Test: Empty tool catalog
///
/// Scenario: Executor configured but it has no tools
/// Expected: No tools or tool_choice in the request
#[tokio::test]
async fn test_empty_catalog_sends_no_tools() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(sse(&[text_delta("ok")]))
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server))
        .unwrap()
        .with_executor(Arc::new(ToolRegistry::new()));
    chat.talk(Some("hi"), None).await.unwrap();

    let body = &bodies(&server).await[0];
    assert!(body.get("tools").is_none());
    assert!(body.get("tool_choice").is_none());
}

/// Test: Corrupt frame in the middle of a stream
///
/// Expected: The frame is skipped and the rest of the stream still counts
#[tokio::test]
async fn test_corrupt_frame_is_skipped() {
    let server = MockServer::start().await;
    let body = format!(
        "data: {}\n\ndata: {{not json\n\n: keep-alive\n\ndata: {}\n\ndata: [DONE]\n\n",
        text_delta("one "),
        text_delta("two")
    );
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server)).unwrap();
    assert_eq!(chat.talk(Some("hi"), None).await.unwrap(), "one two");
}

/// Test: Non-object JSON frames
///
/// Scenario: A `data: 42` frame sits between two content deltas
/// Expected: The filter bus still sees it, the answer ignores it
#[tokio::test]
async fn test_non_object_frame_reaches_filter_bus() {
    let server = MockServer::start().await;
    let body = format!(
        "data: {}\n\ndata: 42\n\ndata: {}\n\ndata: [DONE]\n\n",
        text_delta("one "),
        text_delta("two")
    );
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let chat = Chat::new(settings(&server)).unwrap();
    chat.filters().register("numbers", |e| Ok(e.is_number()));

    assert_eq!(chat.talk(Some("hi"), None).await.unwrap(), "one two");
    assert_eq!(chat.filters().try_pop("numbers"), Some(json!(42)));
}
