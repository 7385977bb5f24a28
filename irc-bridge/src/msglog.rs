//! Local audit log of every PRIVMSG crossing the gateway, in either
//! direction. Not used for protocol correctness.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;

pub trait MessageLog: Send + Sync {
    fn log(&self, at: DateTime<Utc>, from: &str, to: &str, body: &str);
}

/// Emits each message as a `tracing` event under the `messages` target.
pub struct TracingMessageLog;

impl MessageLog for TracingMessageLog {
    fn log(&self, at: DateTime<Utc>, from: &str, to: &str, body: &str) {
        tracing::info!(target: "messages", %at, %from, %to, "{body}");
    }
}

#[derive(Serialize)]
struct Entry<'a> {
    at: String,
    from: &'a str,
    to: &'a str,
    body: &'a str,
}

/// Appends one JSON object per message to a file.
pub struct FileMessageLog {
    file: Mutex<File>,
}

impl FileMessageLog {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open message log: {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MessageLog for FileMessageLog {
    fn log(&self, at: DateTime<Utc>, from: &str, to: &str, body: &str) {
        let entry = Entry {
            at: at.to_rfc3339_opts(SecondsFormat::Millis, true),
            from,
            to,
            body,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode message log entry: {e}");
                return;
            }
        };
        if let Err(e) = writeln!(self.file.lock(), "{line}") {
            tracing::warn!("Failed to write message log: {e}");
        }
    }
}
