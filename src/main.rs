use aichat::config::{self, MEMORY_DB};
use aichat::{Approver, Chat, Error, ReasoningEffort, Result, Settings, TerminalInput, TerminalTools};
use clap::Parser;
use std::io::IsTerminal;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ai", version, about = "Chat with an OpenAI-compatible server from the terminal")]
struct Cli {
    /// Chat completions endpoint URL
    #[arg(short = 'e', long, env = "AI_ENDPOINT")]
    endpoint: Option<String>,

    /// History file, or :memory: for none
    #[arg(short = 'c', long = "chat-db", default_value = MEMORY_DB)]
    chat_db: String,

    /// Attach an image, as image=@<path> (repeatable)
    #[arg(short = 'F', long = "file")]
    files: Vec<String>,

    /// Model name
    #[arg(short = 'm', long, env = "AI_MODEL")]
    model: Option<String>,

    /// Read prompts in a loop until `exit` or `quit`
    #[arg(short = 'i', long)]
    interactive: bool,

    /// Wait for the whole answer instead of streaming it
    #[arg(long)]
    no_stream: bool,

    /// System prompt
    #[arg(long = "sp")]
    system_prompt: Option<String>,

    /// Tool catalog to offer the model (only `terminal`)
    #[arg(long = "func")]
    func: Option<String>,

    /// Approve every tool action without asking
    #[arg(long)]
    auto_approve: bool,

    /// Do not echo the answer
    #[arg(short = 'q', long)]
    quiet: bool,

    #[arg(long)]
    temperature: Option<f32>,

    #[arg(long)]
    top_p: Option<f32>,

    /// Number of completions to request
    #[arg(short = 'n', long)]
    n: Option<u32>,

    /// low, medium or high (or 0, 1, 2)
    #[arg(long)]
    reasoning_effort: Option<ReasoningEffort>,

    /// Prompt words
    prompt: Vec<String>,
}

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,reqwest=warn,hyper=warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let settings = settings(&cli)?;
    tracing::debug!(?settings, "settings resolved");

    // One reader for prompts and approval answers.
    let input = TerminalInput::stdin();

    let mut chat = Chat::new(settings)?;
    match cli.func.as_deref() {
        None => {}
        Some("terminal") => {
            let approver = if cli.auto_approve {
                Approver::new(true)
            } else {
                Approver::asking(input.clone())
            };
            let tools = TerminalTools::new(approver)?;
            chat = chat.with_executor(Arc::new(tools));
        }
        Some(other) => {
            return Err(Error::config(format!(
                "unknown function catalog '{}', expected 'terminal'",
                other
            )));
        }
    }

    if cli.interactive {
        return interactive(&chat, &input).await;
    }

    let mut prompt = cli.prompt.join(" ");
    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        let mut piped = String::new();
        tokio::io::stdin().read_to_string(&mut piped).await?;
        if !piped.is_empty() {
            prompt = format!("{}\n{}", piped, prompt);
        }
    }

    if prompt.is_empty() && chat.settings().files.is_empty() {
        return Err(Error::invalid_input("provide a prompt or a file"));
    }

    let answer = chat.talk(Some(&prompt).filter(|p| !p.is_empty()).map(String::as_str), None).await?;
    let settings = chat.settings();
    if settings.no_stream && settings.printable {
        println!("{}", answer);
    }
    Ok(())
}

/// rc files first, then command-line values.
fn settings(cli: &Cli) -> Result<Settings> {
    let mut rc = Settings::default();
    rc.load_rc_files(&config::rc_paths())?;

    let mut builder = Settings::builder()
        .endpoint(cli.endpoint.clone().unwrap_or(rc.endpoint))
        .model(cli.model.clone().unwrap_or(rc.model))
        .chat_db(cli.chat_db.clone())
        .no_stream(cli.no_stream)
        .printable(!cli.quiet)
        .prompt(cli.prompt.clone());

    if let Some(key) = rc.api_key {
        builder = builder.api_key(key);
    }
    if let Some(system) = cli.system_prompt.clone().or(rc.system_prompt) {
        builder = builder.system_prompt(system);
    }
    for file in &cli.files {
        builder = builder.file(file.clone());
    }
    if let Some(temperature) = cli.temperature {
        builder = builder.temperature(temperature);
    }
    if let Some(top_p) = cli.top_p {
        builder = builder.top_p(top_p);
    }
    if let Some(n) = cli.n {
        builder = builder.n(n);
    }
    if let Some(effort) = cli.reasoning_effort {
        builder = builder.reasoning_effort(effort);
    }
    builder.build()
}

async fn interactive(chat: &Chat, input: &TerminalInput) -> Result<()> {
    let mut stdout = tokio::io::stdout();

    loop {
        stdout.write_all(b" > ").await?;
        stdout.flush().await?;

        let Some(line) = input.next_line().await? else {
            break;
        };
        let prompt = line.trim();
        if prompt.eq_ignore_ascii_case("exit") || prompt.eq_ignore_ascii_case("quit") {
            break;
        }
        if prompt.is_empty() {
            continue;
        }

        println!();
        let answer = chat.talk(Some(prompt), None).await?;
        let settings = chat.settings();
        if settings.no_stream && settings.printable {
            println!("{}", answer);
        }
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags_and_prompt() {
        let cli = Cli::try_parse_from([
            "ai",
            "-m",
            "gpt-4o-mini",
            "-F",
            "image=@a.jpg",
            "-F",
            "image=@b.jpg",
            "--func",
            "terminal",
            "--reasoning-effort",
            "1",
            "hello",
            "world",
        ])
        .unwrap();

        assert_eq!(cli.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(cli.files.len(), 2);
        assert_eq!(cli.func.as_deref(), Some("terminal"));
        assert_eq!(cli.reasoning_effort, Some(ReasoningEffort::Medium));
        assert_eq!(cli.chat_db, MEMORY_DB);
        assert_eq!(cli.prompt, vec!["hello", "world"]);
    }

    #[test]
    fn test_cli_rejects_bad_reasoning_effort() {
        assert!(Cli::try_parse_from(["ai", "--reasoning-effort", "extreme"]).is_err());
    }
}
