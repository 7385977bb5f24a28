//! Per-connection session state and the outbound write path.
//!
//! Every line sent to the client, whether a command reply or a relayed
//! backend event, goes through [`Session::write`] or
//! [`Session::write_batch`]. Both enqueue onto one channel drained by a
//! single writer task, so the client sees lines in enqueue order and a batch
//! is never interleaved with anything else.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::ident::STATUS_NICK;
use crate::irc::Message;

/// Capabilities the gateway will ACK.
pub const SUPPORTED_CAPS: &[&str] = &["server-time"];

/// Batches queued for the writer before senders wait.
const OUTBOX_DEPTH: usize = 64;

/// The client connection is gone; nothing more can be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("connection closed")]
pub struct ConnectionClosed;

/// One outbound protocol line, without terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Line {
    pub text: String,
    /// Timestamp for the `server-time` tag; defaults to the time of writing.
    pub time: Option<DateTime<Utc>>,
}

impl Line {
    pub fn at(text: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            text: text.into(),
            time: Some(time),
        }
    }
}

impl From<String> for Line {
    fn from(text: String) -> Self {
        Self { text, time: None }
    }
}

impl From<Message> for Line {
    fn from(msg: Message) -> Self {
        msg.to_string().into()
    }
}

pub struct Session {
    pub id: String,
    server_name: Arc<str>,
    nick: Mutex<Option<String>>,
    server_time: Arc<AtomicBool>,
    created: DateTime<Utc>,
    outbox: mpsc::Sender<Vec<Line>>,
}

impl Session {
    /// Create a session writing to `writer`. Returns the session and the
    /// writer task, which ends once every handle to the session is dropped
    /// or the socket fails.
    pub fn open<W>(id: String, server_name: Arc<str>, writer: W) -> (Arc<Self>, JoinHandle<()>)
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOX_DEPTH);
        let server_time = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(run_writer(writer, rx, Arc::clone(&server_time), id.clone()));
        let session = Arc::new(Self {
            id,
            server_name,
            nick: Mutex::new(None),
            server_time,
            created: Utc::now(),
            outbox: tx,
        });
        (session, handle)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.created
    }

    /// Accept a capability if it is on the allowlist.
    pub fn negotiate_capability(&self, name: &str) -> bool {
        match name.to_ascii_lowercase().as_str() {
            "server-time" => {
                self.server_time.store(true, Ordering::Relaxed);
                true
            }
            _ => false,
        }
    }

    pub fn has_server_time(&self) -> bool {
        self.server_time.load(Ordering::Relaxed)
    }

    /// Current nick, or `*` before one is set.
    pub fn current_nick(&self) -> String {
        self.nick.lock().clone().unwrap_or_else(|| "*".to_string())
    }

    pub fn has_nick(&self) -> bool {
        self.nick.lock().is_some()
    }

    /// Replace the nick, returning the previous one.
    pub fn set_nick(&self, nick: &str) -> Option<String> {
        self.nick.lock().replace(nick.to_string())
    }

    /// `nick!nick@server` for lines originating from the client itself.
    pub fn hostmask(&self) -> String {
        let nick = self.current_nick();
        format!("{nick}!{nick}@{}", self.server_name)
    }

    /// A server reply addressed to the client: `:<server> <code> <nick> ...`.
    pub fn numeric(&self, code: &str, params: &[&str]) -> Line {
        let nick = self.current_nick();
        let mut all = Vec::with_capacity(params.len() + 1);
        all.push(nick.as_str());
        all.extend_from_slice(params);
        Message::from_server(&self.server_name, code, all).into()
    }

    /// Gateway feedback as a private message from the `status` pseudo-user.
    pub fn status_line(&self, text: &str) -> Line {
        format!(
            ":{STATUS_NICK}!{STATUS_NICK}@{} PRIVMSG {} :{text}",
            self.server_name,
            self.current_nick()
        )
        .into()
    }

    pub async fn write(&self, line: impl Into<Line>) -> Result<(), ConnectionClosed> {
        self.write_batch(vec![line.into()]).await
    }

    /// Write several lines with nothing else in between.
    pub async fn write_batch(&self, lines: Vec<Line>) -> Result<(), ConnectionClosed> {
        if lines.is_empty() {
            return Ok(());
        }
        self.outbox.send(lines).await.map_err(|_| ConnectionClosed)
    }

    pub async fn status(&self, text: &str) -> Result<(), ConnectionClosed> {
        self.write(self.status_line(text)).await
    }
}

async fn run_writer<W>(
    mut writer: W,
    mut rx: mpsc::Receiver<Vec<Line>>,
    server_time: Arc<AtomicBool>,
    session_id: String,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(batch) = rx.recv().await {
        let tagged = server_time.load(Ordering::Relaxed);
        let mut buf = String::new();
        for line in &batch {
            if tagged {
                let time = line.time.unwrap_or_else(Utc::now);
                buf.push_str("@time=");
                buf.push_str(&time.to_rfc3339_opts(SecondsFormat::Millis, true));
                buf.push(' ');
            }
            buf.push_str(&line.text);
            buf.push_str("\r\n");
        }
        let result = async {
            writer.write_all(buf.as_bytes()).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(%session_id, "Write error: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}
