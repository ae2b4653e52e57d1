//! # Tool system
//!
//! Tools are local functions the model may call. Each [`Tool`] carries the
//! metadata the server needs (name, description, JSON schema) and an async
//! handler. A [`ToolRegistry`] maps names to tools once at startup and is the
//! stock [`ToolExecutor`] used by the conversation loop.
//!
//! ```text
//! 1. Definition:   tool("read_file", "...").schema(...).build(handler)
//! 2. Registration: ToolRegistry::new().with_tool(tool)
//! 3. Catalog:      definitions() is sent as `tools` with every request
//! 4. Dispatch:     execute(name, args) looks the handler up by name
//! ```
//!
//! ## Schema formats
//!
//! - **Simple notation**: `{"filename": "string"}`
//! - **Typed schema**: `{"filename": {"type": "string", "description": "..."}}`,
//!   where `"optional": true` keeps a property out of `required`
//! - **Full JSON Schema**: passed through unchanged
//!
//! ```rust,no_run
//! use aichat::{tool, ToolRegistry, Result};
//! use serde_json::json;
//!
//! let registry = ToolRegistry::new().with_tool(
//!     tool("shout", "Upper-case a phrase")
//!         .param("text", "string")
//!         .build(|args| async move {
//!             let text = aichat::tools::required_str(&args, "text")?;
//!             Ok(json!(text.to_uppercase()))
//!         }),
//! );
//! ```

use crate::{Error, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Parsed tool arguments
pub type Arguments = Map<String, Value>;

/// Type-erased async tool handler.
///
/// Boxed so handlers of different concrete future types can live in one registry.
pub type ToolHandler =
    Arc<dyn Fn(Arguments) -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> + Send + Sync>;

/// Something that can run tools by name.
///
/// The conversation loop only sends a tool catalog when an executor is present
/// and its catalog is non-empty. Unknown names and failing tools must be
/// reported as errors; the loop ends the exchange on them.
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Tool definitions in OpenAI function format
    fn definitions(&self) -> Vec<Value>;

    /// Runs the named tool.
    async fn execute(&self, name: &str, args: Arguments) -> Result<Value>;
}

/// Tool definition for OpenAI-compatible function calling.
#[derive(Clone)]
pub struct Tool {
    name: String,
    description: String,
    input_schema: Value,
    handler: ToolHandler,
}

impl Tool {
    pub fn new<F, Fut>(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
        handler: F,
    ) -> Self
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema: convert_schema_to_openai(input_schema),
            handler: Arc::new(
                move |args| -> Pin<Box<dyn Future<Output = Result<Value>> + Send>> {
                    Box::pin(handler(args))
                },
            ),
        }
    }

    pub async fn execute(&self, arguments: Arguments) -> Result<Value> {
        (self.handler)(arguments).await
    }

    pub fn to_openai_format(&self) -> Value {
        serde_json::json!({
            "type": "function",
            "function": {
                "name": self.name,
                "description": self.description,
                "parameters": self.input_schema
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn input_schema(&self) -> &Value {
        &self.input_schema
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("input_schema", &self.input_schema)
            .finish()
    }
}

/// Normalises the accepted schema notations into an object JSON Schema.
fn convert_schema_to_openai(schema: Value) -> Value {
    let Value::Object(obj) = schema else {
        return serde_json::json!({"type": "object", "properties": {}, "required": []});
    };

    if obj.contains_key("type") && obj.contains_key("properties") {
        return Value::Object(obj);
    }

    let mut properties = Map::new();
    let mut required = Vec::new();

    for (param, spec) in obj {
        match spec {
            Value::String(type_str) => {
                properties.insert(param.clone(), type_to_json_schema(&type_str));
                required.push(param);
            }
            Value::Object(mut prop) => {
                let optional = prop
                    .remove("optional")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let explicit = prop.remove("required").and_then(|v| v.as_bool());
                let has_default = prop.contains_key("default");

                properties.insert(param.clone(), Value::Object(prop));

                let is_required = match explicit {
                    Some(flag) => flag,
                    None => !optional && !has_default,
                };
                if is_required {
                    required.push(param);
                }
            }
            _ => {}
        }
    }

    serde_json::json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

fn type_to_json_schema(type_str: &str) -> Value {
    let json_type = match type_str {
        "string" | "str" => "string",
        "integer" | "int" | "i32" | "i64" | "u32" | "u64" => "integer",
        "number" | "float" | "f32" | "f64" => "number",
        "boolean" | "bool" => "boolean",
        "array" | "list" | "vec" => "array",
        "object" | "dict" | "map" => "object",
        _ => "string",
    };
    serde_json::json!({ "type": json_type })
}

/// Builder for [`Tool`]
pub struct ToolBuilder {
    name: String,
    description: String,
    schema: Value,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            schema: serde_json::json!({}),
        }
    }

    /// Replaces the whole schema.
    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    /// Adds a required parameter in simple type notation.
    pub fn param(mut self, name: &str, type_str: &str) -> Self {
        if !self.schema.is_object() {
            self.schema = serde_json::json!({});
        }
        if let Value::Object(obj) = &mut self.schema {
            obj.insert(name.to_string(), Value::String(type_str.to_string()));
        }
        self
    }

    /// Adds a documented parameter.
    pub fn described_param(mut self, name: &str, type_str: &str, description: &str, optional: bool) -> Self {
        if !self.schema.is_object() {
            self.schema = serde_json::json!({});
        }
        if let Value::Object(obj) = &mut self.schema {
            obj.insert(
                name.to_string(),
                serde_json::json!({
                    "type": type_to_json_schema(type_str)["type"],
                    "description": description,
                    "optional": optional
                }),
            );
        }
        self
    }

    pub fn build<F, Fut>(self, handler: F) -> Tool
    where
        F: Fn(Arguments) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Tool::new(self.name, self.description, self.schema, handler)
    }
}

/// Starts building a tool.
pub fn tool(name: impl Into<String>, description: impl Into<String>) -> ToolBuilder {
    ToolBuilder::new(name, description)
}

/// Static name → tool dispatch table.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Tool>,
    by_name: HashMap<String, usize>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(Tool::name))
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tool, replacing one registered under the same name.
    pub fn register(&mut self, tool: Tool) {
        match self.by_name.get(tool.name()) {
            Some(&slot) => self.tools[slot] = tool,
            None => {
                self.by_name.insert(tool.name().to_string(), self.tools.len());
                self.tools.push(tool);
            }
        }
    }

    pub fn with_tool(mut self, tool: Tool) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.by_name.get(name).map(|&slot| &self.tools[slot])
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(Tool::name)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn definitions(&self) -> Vec<Value> {
        self.tools.iter().map(Tool::to_openai_format).collect()
    }

    async fn execute(&self, name: &str, args: Arguments) -> Result<Value> {
        let tool = self
            .get(name)
            .ok_or_else(|| Error::ToolNotFound(name.to_string()))?;

        let shown = Value::Object(args.clone());
        tool.execute(args).await.map_err(|e| {
            Error::tool(format!(
                "Error executing function {} with args {}, error: {}",
                name, shown, e
            ))
        })
    }
}

/// A required string argument.
pub fn required_str<'a>(args: &'a Arguments, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| Error::invalid_input(format!("missing required string argument '{}'", key)))
}

/// An optional string argument; non-strings count as absent.
pub fn optional_str<'a>(args: &'a Arguments, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}
