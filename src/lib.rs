//! # aichat
//!
//! A streaming chat client for OpenAI-compatible chat completion servers
//! (LM Studio, Ollama, llama.cpp, vLLM, hosted OpenAI-style APIs).
//!
//! ## Key Features
//!
//! - **Streaming Responses**: token-by-token output reassembled from SSE lines
//! - **Tool Calling**: fragmented tool calls are rebuilt, validated and
//!   dispatched to local functions, with results fed back to the model
//! - **History**: previous exchanges are replayed from an in-memory or JSON
//!   lines store
//! - **Attachments**: local images sent inline as data URLs
//! - **Filter Bus**: raw response events routed to named queues for side
//!   consumers
//!
//! ## Example
//!
//! ```rust,no_run
//! use aichat::{Approver, Chat, Settings, TerminalTools};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> aichat::Result<()> {
//!     let settings = Settings::builder()
//!         .endpoint("http://localhost:1234/v1/chat/completions")
//!         .model("qwen2.5-32b-instruct")
//!         .system_prompt("You are a helpful assistant")
//!         .build()?;
//!
//!     let tools = TerminalTools::new(Approver::new(false))?;
//!     let chat = Chat::new(settings)?.with_executor(Arc::new(tools));
//!
//!     // Streamed text is echoed to stdout as it arrives
//!     let answer = chat.talk(Some("Which files are in this directory?"), None).await?;
//!     assert!(!answer.is_empty());
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - **frame**: SSE line splitting and `data:` frame decoding
//! - **aggregator**: text and tool-call accumulation across stream events
//! - **chat**: the request / dispatch loop
//! - **filter**: named predicate queues over raw events
//! - **tools**: tool definitions, the executor trait and a static registry
//! - **terminal**: the built-in file, shell and web tool catalog
//! - **history**: conversation persistence
//! - **config**: settings, rc files and defaults
//! - **error**: the `Error` enum and `Result` alias
//!
//! The library logs through `tracing` and installs no subscriber; without one
//! all logging is a no-op.

pub mod aggregator;
pub mod attachment;
mod chat;
pub mod config;
mod error;
mod filter;
pub mod frame;
pub mod history;
pub mod terminal;
pub mod tools;
mod types;

// --- Conversation ---

pub use chat::{Chat, MAX_ITERATIONS, MAX_TOKENS};

// --- Configuration ---

pub use config::{ReasoningEffort, Sampling, Settings, SettingsBuilder};

// --- Error Handling ---

pub use error::{Error, Result};

// --- Streaming ---

pub use aggregator::{DeltaAccumulator, PendingToolCall, StreamOutcome, finalize_tool_calls};
pub use filter::{FilterBus, Predicate};
pub use frame::{Frame, parse_frame};

// --- Tools ---

pub use terminal::{Approver, TerminalInput, TerminalTools};
pub use tools::{Arguments, Tool, ToolBuilder, ToolExecutor, ToolRegistry, tool};

// --- History ---

pub use history::{HistoryStore, JsonlHistory, MemoryHistory};

// --- Core Types ---

pub use types::{
    AssistantMessage, ChatCompletion, ChatRequest, CompletionChoice, ContentPart, Delta,
    FunctionCall, FunctionDelta, ImageUrl, Message, MessageContent, Role, StreamChoice,
    StreamEvent, ToolCall, ToolCallDelta,
};

/// The most commonly used types.
///
/// ```rust
/// use aichat::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Approver, Chat, Error, FilterBus, HistoryStore, Message, Result, Settings, TerminalTools,
        Tool, ToolExecutor, ToolRegistry, tool,
    };
}
