//! The conversation loop.
//!
//! [`Chat::talk`] runs one exchange with the server:
//!
//! ```text
//! build request ──▶ await response ──▶ tool calls? ──yes──▶ dispatch ──┐
//!       ▲                                   │                          │
//!       └───────────────────────────────────┼──────────────────────────┘
//!                                           no
//!                                           ▼
//!                                         done
//! ```
//!
//! At most [`MAX_ITERATIONS`] requests are made per exchange. Hitting the
//! ceiling is not an error: tool calls of the last response still run, and
//! the last text produced is the answer.
//!
//! Every decoded streaming event (or the whole body of a non-streamed
//! response) is offered to the [`FilterBus`] before anything else looks at it.

use crate::aggregator::{DeltaAccumulator, StreamOutcome};
use crate::attachment;
use crate::config::Settings;
use crate::filter::FilterBus;
use crate::frame::{self, Frame};
use crate::history::{self, HistoryStore};
use crate::tools::{Arguments, ToolExecutor};
use crate::types::{ChatCompletion, ChatRequest, ContentPart, Message, MessageContent, Role, StreamEvent, ToolCall};
use crate::{Error, Result};
use futures::StreamExt;
use serde_json::Value;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

/// Request round-trips allowed in a single exchange
pub const MAX_ITERATIONS: usize = 10;

/// Fixed completion token ceiling sent with every request
pub const MAX_TOKENS: u32 = 8192;

/// A chat session against one OpenAI-compatible endpoint.
///
/// ```rust,no_run
/// use aichat::{Chat, Settings};
///
/// # async fn example() -> aichat::Result<()> {
/// let settings = Settings::builder()
///     .endpoint("http://localhost:1234/v1/chat/completions")
///     .model("qwen2.5-7b-instruct")
///     .build()?;
///
/// let chat = Chat::new(settings)?;
/// let answer = chat.talk(Some("What is the capital of France?"), None).await?;
/// println!("{}", answer);
/// # Ok(())
/// # }
/// ```
pub struct Chat {
    settings: Settings,
    executor: Option<Arc<dyn ToolExecutor>>,
    history: Arc<dyn HistoryStore>,
    filters: FilterBus,
}

impl std::fmt::Debug for Chat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chat")
            .field("settings", &self.settings)
            .field("tools", &self.executor.is_some())
            .field("filters", &self.filters)
            .finish()
    }
}

impl Chat {
    /// Creates a session, opening the history store named by `settings.chat_db`.
    pub fn new(settings: Settings) -> Result<Self> {
        let history = history::open(settings.chat_db.as_deref())?;
        Ok(Self {
            settings,
            executor: None,
            history,
            filters: FilterBus::new(),
        })
    }

    /// Enables tool calling through `executor`.
    pub fn with_executor(mut self, executor: Arc<dyn ToolExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_history(mut self, history: Arc<dyn HistoryStore>) -> Self {
        self.history = history;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The bus raw response events are published on.
    pub fn filters(&self) -> &FilterBus {
        &self.filters
    }

    /// Runs one exchange and returns the final answer text.
    ///
    /// `prompt` falls back to the configured prompt words; `stream` falls back
    /// to the `no_stream` setting. Configured attachments are sent after the
    /// prompt text. The user content and the answer are saved to history once
    /// the exchange succeeds.
    ///
    /// # Errors
    ///
    /// - [`Error::Api`] when the server answers with a non-success status
    /// - [`Error::Attachment`] for a bad attachment argument
    /// - any error of the tool executor, which ends the exchange
    /// - transport errors ([`Error::Http`], [`Error::Timeout`])
    pub async fn talk(&self, prompt: Option<&str>, stream: Option<bool>) -> Result<String> {
        let stream = stream.unwrap_or(!self.settings.no_stream);
        let user_content = self.user_content(prompt)?;

        let mut messages = Vec::new();
        if let Some(system) = self.settings.system_prompt.as_deref().filter(|s| !s.is_empty()) {
            messages.push(Message::system(system));
        }
        messages.extend(self.history.previous_messages()?);
        messages.push(Message::new(Role::User, user_content.clone()));

        let catalog = self
            .executor
            .as_ref()
            .map(|executor| executor.definitions())
            .filter(|definitions| !definitions.is_empty());

        // The timeout covers each whole request, streamed body included.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(self.settings.timeout))
            .build()?;
        let api_key = self.settings.resolved_api_key();

        let mut answer = String::new();
        for iteration in 1..=MAX_ITERATIONS {
            let request = ChatRequest {
                model: &self.settings.model,
                messages: &messages,
                temperature: self.settings.sampling.temperature,
                top_p: self.settings.sampling.top_p,
                n: self.settings.sampling.n,
                reasoning_effort: self.settings.sampling.reasoning_effort,
                max_tokens: MAX_TOKENS,
                stream,
                tools: catalog.as_deref(),
                tool_choice: catalog.as_ref().map(|_| "auto"),
            };

            let mut builder = client
                .post(&self.settings.endpoint)
                .header("Content-Type", "application/json")
                .json(&request);
            if let Some(key) = api_key.as_deref() {
                builder = builder.header("Authorization", format!("Bearer {}", key));
            }
            tracing::debug!(iteration, messages = messages.len(), stream, "sending chat request");
            let response = builder.send().await.map_err(Error::from_transport)?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "failed to read error response body");
                    String::new()
                });
                tracing::error!(status = %status, "API request failed");
                tracing::error!(body = %body, "server error information");
                return Err(Error::api(status.as_u16(), body));
            }

            let outcome = if stream {
                self.read_stream(response).await?
            } else {
                self.read_completion(response).await?
            };
            answer = outcome.text;

            let (Some(calls), Some(executor)) = (outcome.tool_calls, &self.executor) else {
                break;
            };

            messages.push(Message::assistant_with_tools(answer.clone(), calls.clone()));
            for call in calls {
                let result = dispatch(executor.as_ref(), &call).await?;
                messages.push(Message::tool_result(call.id, call.function.name, result));
            }
            if iteration == MAX_ITERATIONS {
                tracing::warn!(limit = MAX_ITERATIONS, "tool iteration limit reached, ending exchange");
            }
        }

        self.history.save_message(Role::User, &user_content)?;
        self.history
            .save_message(Role::Assistant, &MessageContent::Text(answer.clone()))?;
        Ok(answer)
    }

    fn user_content(&self, prompt: Option<&str>) -> Result<MessageContent> {
        let text = match prompt {
            Some(prompt) => prompt.to_string(),
            None => self.settings.prompt.join(" "),
        };

        let mut parts = Vec::new();
        if !text.is_empty() {
            parts.push(ContentPart::text(text));
        }
        parts.extend(attachment::image_parts(&self.settings.files)?);

        if parts.is_empty() {
            return Err(Error::invalid_input("provide a prompt or a file"));
        }
        Ok(MessageContent::Parts(parts))
    }

    async fn read_stream(&self, response: reqwest::Response) -> Result<StreamOutcome> {
        let printable = self.settings.printable;
        let mut stdout = std::io::stdout();
        let mut lines = frame::lines(response);
        let mut accumulator = DeltaAccumulator::new();

        while let Some(line) = lines.next().await {
            let value = match frame::parse_frame(&line?) {
                Some(Frame::Event(value)) => value,
                Some(Frame::Done) => break,
                None => continue,
            };
            self.filters.publish(&value);

            let event: StreamEvent = match serde_json::from_value(value) {
                Ok(event) => event,
                Err(e) => {
                    tracing::error!(error = %e, "unexpected stream event shape, skipping");
                    continue;
                }
            };
            if let Some(fragment) = accumulator.apply(&event) {
                if printable {
                    write!(stdout, "{}", fragment)?;
                    stdout.flush()?;
                }
            }
        }

        if printable && !accumulator.text().is_empty() {
            writeln!(stdout)?;
        }
        Ok(accumulator.finish())
    }

    async fn read_completion(&self, response: reqwest::Response) -> Result<StreamOutcome> {
        let status = response.status().as_u16();
        let body = response.text().await.map_err(Error::from_transport)?;
        let value: Value = serde_json::from_str(&body)?;
        self.filters.publish(&value);

        let completion: ChatCompletion = serde_json::from_value(value)?;
        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| Error::api(status, body))?;

        let text = message.content.unwrap_or_default();
        if !text.is_empty() {
            tracing::info!("{}", text);
        }
        Ok(StreamOutcome {
            tool_calls: message.tool_calls.filter(|calls| !calls.is_empty()),
            text,
        })
    }
}

/// Runs one requested call and stringifies its result.
///
/// Arguments that are not a JSON object are replaced by an empty object.
async fn dispatch(executor: &dyn ToolExecutor, call: &ToolCall) -> Result<String> {
    let name = call.function.name.as_str();
    let args = match serde_json::from_str::<Value>(&call.function.arguments) {
        Ok(Value::Object(map)) => map,
        _ => {
            tracing::debug!(tool = name, "tool arguments are not a JSON object, using {{}}");
            Arguments::new()
        }
    };

    let shown = Value::Object(args.clone());
    tracing::info!(tool = name, args = %shown, "tool_calling");
    let result = executor.execute(name, args).await?;
    Ok(stringify_result(result))
}

fn stringify_result(result: Value) -> String {
    match result {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
