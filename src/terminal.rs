//! Built-in terminal tool catalog.
//!
//! [`TerminalTools`] lets the model inspect and change the working directory:
//! listing, reading, writing and searching files, looking at `git diff`,
//! running shell commands, applying patches, reading the clock, searching the
//! web and fetching URLs. Writing, executing and patching go through an [`Approver`] first.
//!
//! Failures of the underlying operation (a missing file, a failing command)
//! are returned to the model as `Error ...` result text so it can react.
//! Missing required arguments are errors of the call itself.

use crate::tools::{Arguments, ToolExecutor, ToolRegistry, optional_str, required_str, tool};
use crate::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::Command;
use tokio::sync::Mutex;
use walkdir::WalkDir;

/// Longest a shell command may run before it is killed
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// DuckDuckGo's script-free results page
pub const SEARCH_ENDPOINT: &str = "https://html.duckduckgo.com/html/";

const SEARCH_RESULTS: usize = 20;

const SEARCH_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Lines of context shown on each side of a search hit
const SEARCH_CONTEXT: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApprovalMode {
    Ask,
    Always,
    Never,
}

type LineSource = Lines<Box<dyn AsyncBufRead + Send + Unpin>>;

/// Line-oriented terminal input.
///
/// Clones share one buffer, so the interactive prompt loop and approval
/// questions can read from the same stdin without losing lines to each other.
#[derive(Clone)]
pub struct TerminalInput {
    lines: Arc<Mutex<LineSource>>,
}

impl TerminalInput {
    pub fn stdin() -> Self {
        Self::from_reader(BufReader::new(tokio::io::stdin()))
    }

    pub fn from_reader(reader: impl AsyncBufRead + Send + Unpin + 'static) -> Self {
        let reader: Box<dyn AsyncBufRead + Send + Unpin> = Box::new(reader);
        Self {
            lines: Arc::new(Mutex::new(reader.lines())),
        }
    }

    /// Next line without its terminator, `None` at end of input.
    pub async fn next_line(&self) -> Result<Option<String>> {
        Ok(self.lines.lock().await.next_line().await?)
    }
}

impl std::fmt::Debug for TerminalInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalInput").finish_non_exhaustive()
    }
}

/// Gatekeeper for actions that change the machine.
#[derive(Debug, Clone)]
pub struct Approver {
    mode: ApprovalMode,
    input: Option<TerminalInput>,
}

impl Approver {
    /// Asks on stdin unless `auto_approve` is set.
    pub fn new(auto_approve: bool) -> Self {
        if auto_approve {
            Self {
                mode: ApprovalMode::Always,
                input: None,
            }
        } else {
            Self::asking(TerminalInput::stdin())
        }
    }

    /// Asks every time, reading answers from `input`.
    pub fn asking(input: TerminalInput) -> Self {
        Self {
            mode: ApprovalMode::Ask,
            input: Some(input),
        }
    }

    /// Refuses everything without asking.
    pub fn deny_all() -> Self {
        Self {
            mode: ApprovalMode::Never,
            input: None,
        }
    }

    /// Shows `content` and returns whether the action may go ahead.
    ///
    /// Only `y` or `yes` (any case) approve; end of input denies.
    pub async fn approve(&self, content: &str) -> Result<bool> {
        let mut stdout = std::io::stdout();
        writeln!(stdout, "\n[APPROVAL NEEDED] {}", content)?;

        match (self.mode, &self.input) {
            (ApprovalMode::Always, _) => {
                tracing::info!(action = content, "auto-approved");
                Ok(true)
            }
            (ApprovalMode::Ask, Some(input)) => {
                write!(stdout, "Do you approve this action? [Yes/No]: ")?;
                stdout.flush()?;
                let answer = input.next_line().await?.unwrap_or_default();
                Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
            }
            _ => Ok(false),
        }
    }
}

/// Shared state behind every terminal tool
#[derive(Debug, Clone)]
struct Workspace {
    root: PathBuf,
    approver: Approver,
    http: reqwest::Client,
    search_endpoint: String,
}

/// The terminal tool catalog as a [`ToolExecutor`].
#[derive(Debug, Clone)]
pub struct TerminalTools {
    workspace: Arc<Workspace>,
    registry: ToolRegistry,
}

impl TerminalTools {
    /// Tools working in the current directory.
    pub fn new(approver: Approver) -> Result<Self> {
        Self::in_dir(std::env::current_dir()?, approver)
    }

    /// Tools working relative to `root`.
    pub fn in_dir(root: impl Into<PathBuf>, approver: Approver) -> Result<Self> {
        let workspace = Arc::new(Workspace {
            root: root.into(),
            approver,
            http: http_client()?,
            search_endpoint: SEARCH_ENDPOINT.to_string(),
        });
        Ok(Self {
            registry: catalog(workspace.clone()),
            workspace,
        })
    }

    /// Sends `search_engine` queries to `endpoint` instead of DuckDuckGo.
    pub fn search_endpoint(self, endpoint: impl Into<String>) -> Self {
        let mut workspace = (*self.workspace).clone();
        workspace.search_endpoint = endpoint.into();
        let workspace = Arc::new(workspace);
        Self {
            registry: catalog(workspace.clone()),
            workspace,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }
}

#[async_trait]
impl ToolExecutor for TerminalTools {
    fn definitions(&self) -> Vec<Value> {
        self.registry.definitions()
    }

    async fn execute(&self, name: &str, args: Arguments) -> Result<Value> {
        self.registry.execute(name, args).await
    }
}

/// Client for outbound tool requests. An `HTTPS_PROXY` setting is used for
/// every scheme, minus the hosts listed in `NO_PROXY`.
fn http_client() -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(FETCH_TIMEOUT)
        .user_agent(SEARCH_USER_AGENT);
    if let Some(proxy) = std::env::var("HTTPS_PROXY").ok().filter(|p| !p.is_empty()) {
        tracing::debug!(proxy = %proxy, "using proxy for tool requests");
        builder = builder.proxy(reqwest::Proxy::all(proxy)?.no_proxy(reqwest::NoProxy::from_env()));
    }
    Ok(builder.build()?)
}

macro_rules! handler {
    ($ws:ident, |$args:ident, $w:ident| $body:expr) => {{
        let $ws = $ws.clone();
        move |$args: Arguments| {
            let $w = $ws.clone();
            async move { $body }
        }
    }};
}

fn catalog(ws: Arc<Workspace>) -> ToolRegistry {
    ToolRegistry::new()
        .with_tool(
            tool("approve", "Ask for user confirmation before performing actions")
                .described_param("content", "string", "The action description to be approved", false)
                .build(handler!(ws, |args, w| {
                    let content = required_str(&args, "content")?;
                    Ok(Value::Bool(w.approver.approve(content).await?))
                })),
        )
        .with_tool(
            tool("list_files", "List files in the current directory including subdirectories")
                .described_param("pattern", "string", "Optional glob pattern to filter files", true)
                .build(handler!(ws, |args, w| {
                    let pattern = optional_str(&args, "pattern").map(str::to_string);
                    w.list_files(pattern).await
                })),
        )
        .with_tool(
            tool("read_file", "Read the content of a file")
                .described_param("filename", "string", "Name of the file to read", false)
                .build(handler!(ws, |args, w| {
                    w.read_file(required_str(&args, "filename")?).await
                })),
        )
        .with_tool(
            tool("write_file", "Write content to a file")
                .described_param("filename", "string", "Name of the file to write", false)
                .described_param("content", "string", "Content to write to the file", false)
                .build(handler!(ws, |args, w| {
                    let filename = required_str(&args, "filename")?;
                    let content = required_str(&args, "content")?;
                    w.write_file(filename, content).await
                })),
        )
        .with_tool(
            tool("git_diff", "Compare files using git diff")
                .described_param("filename", "string", "Name of the file to check diff", false)
                .build(handler!(ws, |args, w| {
                    w.git_diff(required_str(&args, "filename")?).await
                })),
        )
        .with_tool(
            tool("search_files", "Search files for code snippets including subdirectories")
                .described_param("pattern", "string", "File pattern to search in (e.g., '*.py')", false)
                .described_param("query", "string", "Text to search for", false)
                .build(handler!(ws, |args, w| {
                    let pattern = required_str(&args, "pattern")?.to_string();
                    let query = required_str(&args, "query")?.to_string();
                    w.search_files(pattern, query).await
                })),
        )
        .with_tool(
            tool("execute_command", "Execute a system command using bash -lc")
                .described_param("command", "string", "Command to execute", false)
                .build(handler!(ws, |args, w| {
                    w.execute_command(required_str(&args, "command")?).await
                })),
        )
        .with_tool(
            tool("patch_file", "Apply a patch to a file")
                .described_param("filename", "string", "Name of the file to patch", false)
                .described_param("patch_content", "string", "The patch content to apply", false)
                .build(handler!(ws, |args, w| {
                    let filename = required_str(&args, "filename")?;
                    let patch = required_str(&args, "patch_content")?;
                    w.patch_file(filename, patch).await
                })),
        )
        .with_tool(
            tool("get_current_time", "Get the current system time in ISO 8601 format")
                .build(|_| async { Ok(json!(chrono::Local::now().to_rfc3339())) }),
        )
        .with_tool(
            tool(
                "search_engine",
                "Search the Internet. Analyze the user's query and find the correct keywords for searching.",
            )
            .described_param("keyword", "string", "Keyword to search for", false)
            .build(handler!(ws, |args, w| {
                w.search_engine(required_str(&args, "keyword")?).await
            })),
        )
        .with_tool(
            tool("fetch_url", "Fetch the content of a URL using HTTP GET method")
                .described_param("url", "string", "URL to fetch", false)
                .build(handler!(ws, |args, w| {
                    w.fetch_url(required_str(&args, "url")?).await
                })),
        )
}

impl Workspace {
    fn resolve(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    async fn list_files(&self, pattern: Option<String>) -> Result<Value> {
        let root = self.root.clone();
        let matcher = match pattern.as_deref().filter(|p| !p.is_empty()) {
            Some(p) => Some(glob_to_regex(p)?),
            None => None,
        };

        let files = tokio::task::spawn_blocking(move || {
            walk_files(&root)
                .into_iter()
                .filter(|rel| matcher.as_ref().is_none_or(|re| re.is_match(rel)))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| Error::tool(format!("listing files failed: {}", e)))?;

        Ok(json!(files))
    }

    async fn read_file(&self, filename: &str) -> Result<Value> {
        Ok(match tokio::fs::read_to_string(self.resolve(filename)).await {
            Ok(content) => json!(content),
            Err(e) => json!(format!("Error reading file: {}", e)),
        })
    }

    async fn write_file(&self, filename: &str, content: &str) -> Result<Value> {
        if !self
            .approver
            .approve(&format!("Writing to file {}", filename))
            .await?
        {
            return Ok(json!("Write operation cancelled by user."));
        }

        let path = self.resolve(filename);
        let written = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await
        }
        .await;

        Ok(match written {
            Ok(()) => {
                tracing::info!(path = %path.display(), bytes = content.len(), "wrote file");
                json!(format!("Successfully wrote to {}", filename))
            }
            Err(e) => json!(format!("Error writing to file: {}", e)),
        })
    }

    async fn git_diff(&self, filename: &str) -> Result<Value> {
        let output = Command::new("git")
            .arg("diff")
            .arg(filename)
            .current_dir(&self.root)
            .output()
            .await;

        Ok(match output {
            Ok(output) if !output.stdout.is_empty() => {
                json!(String::from_utf8_lossy(&output.stdout))
            }
            Ok(_) => json!("No differences or not a git repository."),
            Err(e) => json!(format!("Error executing git diff: {}", e)),
        })
    }

    async fn search_files(&self, pattern: String, query: String) -> Result<Value> {
        let matcher = glob_to_regex(&pattern)?;
        let root = self.root.clone();

        tokio::task::spawn_blocking(move || {
            let mut results = Map::new();
            for rel in walk_files(&root) {
                let file_name = rel.rsplit('/').next().unwrap_or(rel.as_str());
                if !matcher.is_match(file_name) {
                    continue;
                }
                // Unreadable and non-UTF-8 files are not searchable.
                let Ok(content) = std::fs::read_to_string(root.join(&rel)) else {
                    continue;
                };
                let hits = search_text(&content, &query);
                if !hits.is_empty() {
                    results.insert(rel, Value::Array(hits));
                }
            }
            Value::Object(results)
        })
        .await
        .map_err(|e| Error::tool(format!("search failed: {}", e)))
    }

    async fn execute_command(&self, command: &str) -> Result<Value> {
        if !self
            .approver
            .approve(&format!("Executing command: {}", command))
            .await?
        {
            return Ok(json!("Command execution cancelled by user."));
        }

        let child = Command::new("bash")
            .arg("-lc")
            .arg(command)
            .current_dir(&self.root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        Ok(match tokio::time::timeout(COMMAND_TIMEOUT, child).await {
            Ok(Ok(output)) => json!(format!(
                "Exit code: {}\nOutput: {}\nErrors: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            )),
            Ok(Err(e)) => json!(format!("Error executing command: {}", e)),
            Err(_) => json!(format!(
                "Error executing command: timed out after {} seconds",
                COMMAND_TIMEOUT.as_secs()
            )),
        })
    }

    async fn patch_file(&self, filename: &str, patch: &str) -> Result<Value> {
        if !self
            .approver
            .approve(&format!("Applying patch to file {}", filename))
            .await?
        {
            return Ok(json!("Patch operation cancelled by user."));
        }

        let applied = async {
            let mut child = Command::new("patch")
                .arg(filename)
                .current_dir(&self.root)
                .stdin(Stdio::piped())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .spawn()?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(patch.as_bytes()).await?;
            }
            child.wait_with_output().await
        }
        .await;

        Ok(match applied {
            Ok(output) if output.status.success() => json!(format!(
                "Successfully patched {}\n{}",
                filename,
                String::from_utf8_lossy(&output.stdout)
            )),
            Ok(output) => json!(format!(
                "Error applying patch: {}",
                String::from_utf8_lossy(&output.stderr)
            )),
            Err(e) => json!(format!("Error patching file: {}", e)),
        })
    }

    async fn search_engine(&self, keyword: &str) -> Result<Value> {
        let response = self
            .http
            .get(&self.search_endpoint)
            .query(&[("q", keyword)])
            .send()
            .await;

        let html = match response {
            Ok(response) if response.status().is_success() => match response.text().await {
                Ok(html) => html,
                Err(e) => return Ok(json!(format!("Error searching: {}", e))),
            },
            Ok(response) => {
                return Ok(json!(format!("Error searching: {}", response.status().as_u16())));
            }
            Err(e) => return Ok(json!(format!("Error searching: {}", e))),
        };

        let results = search_results(&html)?;
        tracing::debug!(keyword, results = results.len(), "web search finished");
        Ok(Value::Array(results))
    }

    async fn fetch_url(&self, url: &str) -> Result<Value> {
        let response = self.http.get(url).send().await;
        Ok(match response {
            Ok(response) if response.status() == reqwest::StatusCode::OK => {
                match response.text().await {
                    Ok(body) => json!(body),
                    Err(e) => json!(format!("Error fetching URL: {}", e)),
                }
            }
            Ok(response) => json!(format!("Error fetching URL: {}", response.status().as_u16())),
            Err(e) => json!(format!("Error fetching URL: {}", e)),
        })
    }
}

/// Relative `/`-separated paths of every regular file under `root`, sorted.
/// Hidden files and directories are skipped.
fn walk_files(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| {
            let rel = entry.path().strip_prefix(root).ok()?;
            Some(
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/"),
            )
        })
        .collect();
    files.sort();
    files
}

/// Title and target of the first results on a DuckDuckGo HTML page.
fn search_results(html: &str) -> Result<Vec<Value>> {
    let anchor = Regex::new(r#"(?s)<a[^>]*class="result__a"[^>]*href="([^"]*)"[^>]*>(.*?)</a>"#)
        .map_err(|e| Error::tool(e.to_string()))?;
    let tag = Regex::new(r"<[^>]+>").map_err(|e| Error::tool(e.to_string()))?;

    Ok(anchor
        .captures_iter(html)
        .filter_map(|caps| {
            let title = unescape_html(&tag.replace_all(&caps[2], ""));
            let title = title.trim();
            if title.is_empty() {
                return None;
            }
            Some(json!({"title": title, "href": result_target(&caps[1])}))
        })
        .take(SEARCH_RESULTS)
        .collect())
}

/// Unwraps DuckDuckGo's `/l/?uddg=<target>` redirect links.
fn result_target(href: &str) -> String {
    let href = unescape_html(href);
    let absolute = match href.strip_prefix("//") {
        Some(rest) => format!("https://{}", rest),
        None => href.clone(),
    };
    reqwest::Url::parse(&absolute)
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, _)| key == "uddg")
                .map(|(_, target)| target.into_owned())
        })
        .unwrap_or(href)
}

fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#x27;", "'")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

/// Matching lines of `content` with surrounding context, 1-based line numbers.
fn search_text(content: &str, query: &str) -> Vec<Value> {
    let lines: Vec<&str> = content.split('\n').collect();
    lines
        .iter()
        .enumerate()
        .filter(|(_, line)| line.contains(query))
        .map(|(i, _)| {
            let start = i.saturating_sub(SEARCH_CONTEXT);
            let end = (i + SEARCH_CONTEXT + 1).min(lines.len());
            json!({
                "line_number": i + 1,
                "context": lines[start..end].join("\n"),
            })
        })
        .collect()
}

/// Translates a shell glob into an anchored regex over `/`-separated paths.
///
/// `*` and `?` stay within one path segment, `**` spans segments and `**/`
/// also matches zero directories.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    re.push_str("(?:.*/)?");
                } else {
                    re.push_str(".*");
                }
            }
            '*' => re.push_str("[^/]*"),
            '?' => re.push_str("[^/]"),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::invalid_input(format!("bad glob '{}': {}", pattern, e)))
}
