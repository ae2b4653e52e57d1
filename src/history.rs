//! Conversation history stores.
//!
//! A store hands the conversation loop the recent messages to replay before
//! the new prompt, and records each exchange's user content and final answer.
//! Two stores are provided: [`MemoryHistory`] for a single process and
//! [`JsonlHistory`], an append-only JSON lines file that survives restarts.

use crate::config::MEMORY_DB;
use crate::types::{Message, MessageContent, Role};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// How many stored messages are replayed into a new exchange
pub const HISTORY_WINDOW: usize = 500;

/// Persistence for past messages.
pub trait HistoryStore: Send + Sync {
    /// At most [`HISTORY_WINDOW`] most recent messages, oldest first
    fn previous_messages(&self) -> Result<Vec<Message>>;

    fn save_message(&self, role: Role, content: &MessageContent) -> Result<()>;
}

/// Opens the store named by a `chat_db` setting.
///
/// `None` and `:memory:` give a fresh [`MemoryHistory`]; anything else is a
/// path to a [`JsonlHistory`] file.
pub fn open(location: Option<&str>) -> Result<Arc<dyn HistoryStore>> {
    match location {
        None | Some(MEMORY_DB) => Ok(Arc::new(MemoryHistory::new())),
        Some(path) => Ok(Arc::new(JsonlHistory::open(path)?)),
    }
}

/// One stored message
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    role: Role,
    content: MessageContent,
    timestamp: DateTime<Utc>,
}

impl Record {
    fn into_message(self) -> Message {
        Message::new(self.role, self.content)
    }
}

fn window<T>(mut items: Vec<T>) -> Vec<T> {
    if items.len() > HISTORY_WINDOW {
        items.drain(..items.len() - HISTORY_WINDOW);
    }
    items
}

/// In-process history, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryHistory {
    records: Mutex<Vec<Record>>,
}

impl MemoryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map_or(0, |records| records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl HistoryStore for MemoryHistory {
    fn previous_messages(&self) -> Result<Vec<Message>> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::history("history lock poisoned"))?;
        let start = records.len().saturating_sub(HISTORY_WINDOW);
        Ok(records[start..]
            .iter()
            .cloned()
            .map(Record::into_message)
            .collect())
    }

    fn save_message(&self, role: Role, content: &MessageContent) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| Error::history("history lock poisoned"))?
            .push(Record {
                role,
                content: content.clone(),
                timestamp: Utc::now(),
            });
        Ok(())
    }
}

/// History kept in a JSON lines file, one `{role, content, timestamp}` object per line.
#[derive(Debug)]
pub struct JsonlHistory {
    path: PathBuf,
    // Serialises appends from concurrent exchanges.
    write_lock: Mutex<()>,
}

impl JsonlHistory {
    /// Opens (or prepares to create) the file at `path`.
    ///
    /// Refuses a path that exists but is a directory.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.is_dir() {
            return Err(Error::history(format!(
                "{} is a directory",
                path.display()
            )));
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl HistoryStore for JsonlHistory {
    fn previous_messages(&self) -> Result<Vec<Message>> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (number, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Record>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(
                    path = %self.path.display(),
                    line = number + 1,
                    error = %e,
                    "skipping unreadable history record"
                ),
            }
        }

        Ok(window(records)
            .into_iter()
            .map(Record::into_message)
            .collect())
    }

    fn save_message(&self, role: Role, content: &MessageContent) -> Result<()> {
        let record = Record {
            role,
            content: content.clone(),
            timestamp: Utc::now(),
        };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::history("history lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}
