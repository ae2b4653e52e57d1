//! Settings for a chat session: defaults, `.airc` files and the builder.

use crate::{Error, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Default chat completions URL (LM Studio's local server)
pub const DEFAULT_ENDPOINT: &str = "http://localhost:1234/v1/chat/completions";

/// Default model name sent to the server
pub const DEFAULT_MODEL: &str = "openai";

/// Name of the per-user and per-directory config file
pub const RC_FILE_NAME: &str = ".airc";

/// Section of the rc file that holds our keys
const RC_SECTION: &str = "ai";

/// Keys read from the rc file. Anything else is ignored.
const RC_KEYS: &[&str] = &["endpoint", "model", "api_key", "system_prompt"];

/// `chat_db` value that selects the in-memory history store
pub const MEMORY_DB: &str = ":memory:";

/// Reasoning effort hint sent with every request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Low,
    Medium,
    #[default]
    High,
}

impl FromStr for ReasoningEffort {
    type Err = Error;

    /// Accepts the names and the positional indexes `0..=2`.
    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" | "0" => Ok(ReasoningEffort::Low),
            "medium" | "1" => Ok(ReasoningEffort::Medium),
            "high" | "2" => Ok(ReasoningEffort::High),
            other => Err(Error::config(format!(
                "unknown reasoning effort '{}', expected low, medium or high",
                other
            ))),
        }
    }
}

impl fmt::Display for ReasoningEffort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        };
        f.write_str(name)
    }
}

/// Sampling parameters carried in every request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sampling {
    pub temperature: f32,
    pub top_p: f32,
    pub n: u32,
    pub reasoning_effort: ReasoningEffort,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            top_p: 1.0,
            n: 1,
            reasoning_effort: ReasoningEffort::High,
        }
    }
}

/// Everything a [`Chat`](crate::Chat) needs to talk to the server
#[derive(Clone)]
pub struct Settings {
    /// Full chat completions URL
    pub endpoint: String,

    /// Model name (e.g., "gpt-4o-mini")
    pub model: String,

    /// Bearer credential. `None` falls back to `OPENAI_API_KEY`.
    pub api_key: Option<String>,

    /// System prompt placed before the history
    pub system_prompt: Option<String>,

    /// History location: a JSON lines file path or `:memory:`
    pub chat_db: Option<String>,

    /// Attachment arguments in `image=@path` form
    pub files: Vec<String>,

    /// Disable streaming responses
    pub no_stream: bool,

    /// Echo streamed text to stdout as it arrives
    pub printable: bool,

    /// Prompt words used when `talk` gets no explicit prompt
    pub prompt: Vec<String>,

    pub sampling: Sampling,

    /// Per-request timeout in seconds
    pub timeout: u64,
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("system_prompt", &self.system_prompt)
            .field("chat_db", &self.chat_db)
            .field("files", &self.files)
            .field("no_stream", &self.no_stream)
            .field("printable", &self.printable)
            .field("sampling", &self.sampling)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            system_prompt: None,
            chat_db: None,
            files: Vec::new(),
            no_stream: false,
            printable: true,
            prompt: Vec::new(),
            sampling: Sampling::default(),
            timeout: 60,
        }
    }
}

impl Settings {
    /// Create a new builder for Settings
    pub fn builder() -> SettingsBuilder {
        SettingsBuilder::default()
    }

    /// The credential to send, preferring the configured key over the environment.
    pub fn resolved_api_key(&self) -> Option<String> {
        resolve_api_key(self.api_key.as_deref(), env::var("OPENAI_API_KEY").ok())
    }

    /// Applies the `[ai]` section of an rc file's text over the current values.
    pub fn apply_rc(&mut self, text: &str) {
        let values = parse_rc(text);
        for key in RC_KEYS {
            let Some(value) = values.get(*key) else {
                continue;
            };
            match *key {
                "endpoint" => self.endpoint = value.clone(),
                "model" => self.model = value.clone(),
                "api_key" => self.api_key = Some(value.clone()),
                "system_prompt" => self.system_prompt = Some(value.clone()),
                _ => {}
            }
        }
    }

    /// Loads every existing file in `paths`, later files overriding earlier ones.
    pub fn load_rc_files(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths.iter().filter(|p| p.exists()) {
            let text = std::fs::read_to_string(path).map_err(|e| {
                Error::config(format!("failed to read {}: {}", path.display(), e))
            })?;
            tracing::debug!(path = %path.display(), "applying rc file");
            self.apply_rc(&text);
        }
        Ok(())
    }
}

/// `$HOME/.airc` then `./.airc`
pub fn rc_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Some(home) = env::var_os("HOME") {
        paths.push(Path::new(&home).join(RC_FILE_NAME));
    }
    if let Ok(cwd) = env::current_dir() {
        paths.push(cwd.join(RC_FILE_NAME));
    }
    paths
}

fn resolve_api_key(configured: Option<&str>, from_env: Option<String>) -> Option<String> {
    configured
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .or(from_env.filter(|k| !k.is_empty()))
}

/// Parses INI text and returns the keys of the `[ai]` section, lowercased.
///
/// Supports `key = value` and `key: value`, with `#` and `;` comment lines.
fn parse_rc(text: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    let mut in_section = false;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            in_section = name.trim() == RC_SECTION;
            continue;
        }
        if !in_section {
            continue;
        }
        let Some(split) = line.find(['=', ':']) else {
            continue;
        };
        let (key, value) = line.split_at(split);
        values.insert(key.trim().to_lowercase(), value[1..].trim().to_string());
    }

    values
}

/// Builder for Settings
#[derive(Debug, Default)]
pub struct SettingsBuilder {
    endpoint: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    system_prompt: Option<String>,
    chat_db: Option<String>,
    files: Vec<String>,
    no_stream: bool,
    printable: Option<bool>,
    prompt: Vec<String>,
    sampling: Sampling,
    timeout: Option<u64>,
}

impl SettingsBuilder {
    pub fn endpoint(mut self, url: impl Into<String>) -> Self {
        self.endpoint = Some(url.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn chat_db(mut self, location: impl Into<String>) -> Self {
        self.chat_db = Some(location.into());
        self
    }

    pub fn file(mut self, arg: impl Into<String>) -> Self {
        self.files.push(arg.into());
        self
    }

    pub fn no_stream(mut self, no_stream: bool) -> Self {
        self.no_stream = no_stream;
        self
    }

    pub fn printable(mut self, printable: bool) -> Self {
        self.printable = Some(printable);
        self
    }

    pub fn prompt(mut self, words: Vec<String>) -> Self {
        self.prompt = words;
        self
    }

    pub fn temperature(mut self, temp: f32) -> Self {
        self.sampling.temperature = temp;
        self
    }

    pub fn top_p(mut self, top_p: f32) -> Self {
        self.sampling.top_p = top_p;
        self
    }

    pub fn n(mut self, n: u32) -> Self {
        self.sampling.n = n;
        self
    }

    pub fn reasoning_effort(mut self, effort: ReasoningEffort) -> Self {
        self.sampling.reasoning_effort = effort;
        self
    }

    pub fn timeout(mut self, timeout: u64) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<Settings> {
        let endpoint = self.endpoint.unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(Error::config(format!(
                "endpoint must be an http(s) URL, got '{}'",
                endpoint
            )));
        }

        let model = self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string());
        if model.trim().is_empty() {
            return Err(Error::config("model must not be empty"));
        }

        if self.sampling.n == 0 {
            return Err(Error::config("n must be at least 1"));
        }

        Ok(Settings {
            endpoint,
            model,
            api_key: self.api_key,
            system_prompt: self.system_prompt,
            chat_db: self.chat_db,
            files: self.files,
            no_stream: self.no_stream,
            printable: self.printable.unwrap_or(true),
            prompt: self.prompt,
            sampling: self.sampling,
            timeout: self.timeout.unwrap_or(60),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::builder().build().unwrap();
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.model, "openai");
        assert!(settings.printable);
        assert!(!settings.no_stream);
        assert_eq!(settings.timeout, 60);
        assert_eq!(settings.sampling.temperature, 0.7);
        assert_eq!(settings.sampling.top_p, 1.0);
        assert_eq!(settings.sampling.n, 1);
        assert_eq!(settings.sampling.reasoning_effort, ReasoningEffort::High);
    }

    #[test]
    fn test_builder_rejects_bad_endpoint() {
        let result = Settings::builder().endpoint("localhost:1234").build();
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_builder_rejects_zero_n() {
        assert!(Settings::builder().n(0).build().is_err());
    }

    #[test]
    fn test_reasoning_effort_parsing() {
        assert_eq!("low".parse::<ReasoningEffort>().unwrap(), ReasoningEffort::Low);
        assert_eq!("MEDIUM".parse::<ReasoningEffort>().unwrap(), ReasoningEffort::Medium);
        assert_eq!("2".parse::<ReasoningEffort>().unwrap(), ReasoningEffort::High);
        assert!("extreme".parse::<ReasoningEffort>().is_err());
        assert_eq!(ReasoningEffort::Medium.to_string(), "medium");
    }

    #[test]
    fn test_parse_rc_reads_only_ai_section() {
        let text = "\
# global settings
[other]
model = ignored

[ai]
Endpoint = https://example.com/v1/chat/completions
model: gpt-4o-mini
; comment
system_prompt = You are terse. Answer = short.
";
        let values = parse_rc(text);
        assert_eq!(
            values.get("endpoint").map(String::as_str),
            Some("https://example.com/v1/chat/completions")
        );
        assert_eq!(values.get("model").map(String::as_str), Some("gpt-4o-mini"));
        assert_eq!(
            values.get("system_prompt").map(String::as_str),
            Some("You are terse. Answer = short.")
        );
    }

    #[test]
    fn test_later_rc_file_wins() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home.airc");
        let local = dir.path().join("local.airc");
        std::fs::write(&home, "[ai]\nmodel = from-home\napi_key = k1\n").unwrap();
        std::fs::write(&local, "[ai]\nmodel = from-cwd\n").unwrap();

        let mut settings = Settings::default();
        settings
            .load_rc_files(&[home, dir.path().join("missing"), local])
            .unwrap();

        assert_eq!(settings.model, "from-cwd");
        assert_eq!(settings.api_key.as_deref(), Some("k1"));
    }

    #[test]
    fn test_resolve_api_key_prefers_configured() {
        assert_eq!(
            resolve_api_key(Some("cfg"), Some("env".into())).as_deref(),
            Some("cfg")
        );
        assert_eq!(resolve_api_key(None, Some("env".into())).as_deref(), Some("env"));
        assert_eq!(resolve_api_key(Some(""), None), None);
    }

    #[test]
    fn test_debug_masks_api_key() {
        let settings = Settings::builder().api_key("secret").build().unwrap();
        let debug = format!("{:?}", settings);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("***"));
    }
}
