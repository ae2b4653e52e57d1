//! Delta accumulation and tool-call finalization for streamed responses.
//!
//! Tool calls arrive as incremental fragments spread across many events, and
//! several calls may be in flight at once:
//!
//! ```text
//! Event 1: tool_calls: [{ index: 0, id: "call_a", function: { name: "read_file" } }]
//! Event 2: tool_calls: [{ index: 1, id: "call_b", function: { name: "git_diff" } }]
//! Event 3: tool_calls: [{ index: 0, function: { arguments: "{\"filename\":" } }]
//! Event 4: tool_calls: [{ index: 1, function: { arguments: "{\"filename\":\"b\"}" } }]
//! Event 5: tool_calls: [{ index: 0, function: { arguments: "\"a\"}" } }]
//! ```
//!
//! Fragments are keyed by the server-assigned id. A fragment without an id is
//! attached to the first pending call created with the same index; if there is
//! none the fragment cannot be placed and is dropped. An empty-string id names
//! no call and is dropped too.
//!
//! ```text
//! StreamEvent ──apply()──▶ DeltaAccumulator ──finish()──▶ StreamOutcome
//!                          (text + pending)                (text + Option<Vec<ToolCall>>)
//! ```

use crate::types::{StreamEvent, ToolCall, ToolCallDelta};

/// A tool call that is still being assembled from fragments.
///
/// `name` and `arguments` grow by concatenation. `arguments` is not valid JSON
/// until every fragment has arrived.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingToolCall {
    pub id: String,
    pub index: u32,
    pub name: String,
    pub arguments: String,
}

impl PendingToolCall {
    fn new(id: String, index: u32) -> Self {
        Self {
            id,
            index,
            name: String::new(),
            arguments: String::new(),
        }
    }

    /// Whether this call has a name and a JSON argument string.
    fn is_complete(&self) -> bool {
        if self.name.is_empty() || self.arguments.trim().is_empty() {
            return false;
        }
        serde_json::from_str::<serde_json::Value>(&self.arguments).is_ok()
    }
}

/// Everything a single streamed response produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamOutcome {
    /// Valid tool calls in index order, `None` when there are none
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Concatenated content deltas
    pub text: String,
}

/// Stateful accumulator for one streamed response.
///
/// Pending calls are kept in creation order so "first match by index" is
/// deterministic; ids are unique among them.
#[derive(Debug, Default)]
pub struct DeltaAccumulator {
    text: String,
    pending: Vec<PendingToolCall>,
}

impl DeltaAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Text accumulated so far
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Calls currently being assembled
    pub fn pending(&self) -> &[PendingToolCall] {
        &self.pending
    }

    /// Folds one event into the buffers.
    ///
    /// Only the first choice is considered. Returns the content fragment carried
    /// by this event, so callers can echo it as it arrives.
    pub fn apply<'e>(&mut self, event: &'e StreamEvent) -> Option<&'e str> {
        let choice = event.choices.first()?;
        let delta = &choice.delta;

        if let Some(tool_calls) = &delta.tool_calls {
            for fragment in tool_calls {
                self.apply_tool_fragment(fragment);
            }
        }

        match delta.content.as_deref() {
            Some(content) if !content.is_empty() => {
                self.text.push_str(content);
                Some(content)
            }
            _ => None,
        }
    }

    fn apply_tool_fragment(&mut self, fragment: &ToolCallDelta) {
        let index = fragment.index.unwrap_or(0);

        let position = match fragment.id.as_deref() {
            Some("") => {
                tracing::debug!(index, "dropping tool call fragment with an empty id");
                return;
            }
            Some(id) => match self.pending.iter().position(|call| call.id == id) {
                Some(position) => position,
                None => {
                    self.pending.push(PendingToolCall::new(id.to_string(), index));
                    self.pending.len() - 1
                }
            },
            None => match self.pending.iter().position(|call| call.index == index) {
                Some(position) => position,
                None => {
                    tracing::debug!(index, "dropping tool call fragment with no id and no known index");
                    return;
                }
            },
        };

        let Some(function) = &fragment.function else {
            return;
        };
        let call = &mut self.pending[position];
        if let Some(name) = &function.name {
            call.name.push_str(name);
        }
        if let Some(arguments) = &function.arguments {
            call.arguments.push_str(arguments);
        }
    }

    /// Consumes the accumulator, finalizing the pending tool calls.
    pub fn finish(self) -> StreamOutcome {
        StreamOutcome {
            tool_calls: finalize_tool_calls(self.pending),
            text: self.text,
        }
    }
}

/// Turns pending calls into complete ones, ordered by index.
///
/// Calls with an empty name, blank arguments, or arguments that are not valid
/// JSON are dropped. Returns `None` when nothing valid remains.
pub fn finalize_tool_calls(mut pending: Vec<PendingToolCall>) -> Option<Vec<ToolCall>> {
    if pending.is_empty() {
        return None;
    }

    // Stable: equal indexes keep creation order.
    pending.sort_by_key(|call| call.index);

    let requested = pending.len();
    let complete: Vec<ToolCall> = pending
        .into_iter()
        .filter(|call| {
            let ok = call.is_complete();
            if !ok {
                tracing::debug!(id = %call.id, name = %call.name, "dropping malformed tool call");
            }
            ok
        })
        .map(|call| ToolCall::new(call.id, call.name, call.arguments))
        .collect();

    if complete.is_empty() {
        tracing::debug!(requested, "all requested tool calls were malformed");
        return None;
    }
    Some(complete)
}
