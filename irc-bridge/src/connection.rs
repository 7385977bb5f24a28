//! Per-client connection handler.
//!
//! Each TCP connection gets its own session:
//! - IRC registration (NICK/USER) and CAP negotiation
//! - keepalive PING/PONG
//! - sequential dispatch of bridging commands
//! - the backend event relay, started once registered
//!
//! Commands from one client run strictly one at a time in arrival order.

use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant};

use crate::chat::ChatModel;
use crate::commands::{self, Context};
use crate::irc::{self, Message};
use crate::relay;
use crate::server::Gateway;
use crate::session::{ConnectionClosed, SUPPORTED_CAPS, Session};

/// Idle time before the server sends a PING.
const PING_INTERVAL: Duration = Duration::from_secs(90);
/// Silence after which the client is considered gone.
const PING_TIMEOUT: Duration = Duration::from_secs(180);

/// Registration progress of a connection.
#[derive(Default)]
struct Registration {
    user: Option<String>,
    cap_negotiating: bool,
    registered: bool,
    relay: Option<JoinHandle<()>>,
}

enum Flow {
    Continue,
    Quit,
}

/// What to do when the read side has been idle for [`PING_INTERVAL`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Idle {
    SendPing,
    Wait,
    TimedOut,
}

/// Liveness tracking for one client.
struct Keepalive {
    last_activity: Instant,
    awaiting_pong: bool,
}

impl Keepalive {
    fn new(now: Instant) -> Self {
        Self {
            last_activity: now,
            awaiting_pong: false,
        }
    }

    /// Any inbound line counts as an answer to an outstanding PING.
    fn on_traffic(&mut self, now: Instant) {
        self.last_activity = now;
        self.awaiting_pong = false;
    }

    fn on_idle(&mut self, now: Instant) -> Idle {
        if !self.awaiting_pong {
            self.awaiting_pong = true;
            Idle::SendPing
        } else if now.duration_since(self.last_activity) > PING_TIMEOUT {
            Idle::TimedOut
        } else {
            Idle::Wait
        }
    }
}

/// Handle a plain TCP connection.
pub async fn handle(stream: TcpStream, gateway: Arc<Gateway>) -> Result<()> {
    let peer = stream.peer_addr()?;
    let session_id = format!("{peer}");
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, gateway).await
}

/// Handle a generic async stream (TLS or in-memory transports).
pub async fn handle_generic<S>(stream: S, session_id: String, gateway: Arc<Gateway>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (reader, writer) = tokio::io::split(stream);
    handle_io(BufReader::new(reader), writer, session_id, gateway).await
}

async fn handle_io<R, W>(
    mut reader: BufReader<R>,
    writer: W,
    session_id: String,
    gateway: Arc<Gateway>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tracing::info!(%session_id, "New connection");
    let (session, writer_task) =
        Session::open(session_id.clone(), Arc::clone(&gateway.server_name), writer);
    let ctx = Arc::new(Context {
        session,
        chats: ChatModel::new(Arc::clone(&gateway.backend)),
        gateway,
    });

    let mut reg = Registration::default();
    command_loop(&mut reader, &ctx, &mut reg).await;

    // Teardown: stop the relay first so nothing else writes, then let the
    // writer flush whatever is queued and close the socket.
    if let Some(relay) = reg.relay.take() {
        relay.abort();
        let _ = relay.await;
    }
    drop(ctx);
    let _ = writer_task.await;
    tracing::info!(%session_id, "Connection closed");
    Ok(())
}

async fn command_loop<R>(reader: &mut BufReader<R>, ctx: &Arc<Context>, reg: &mut Registration)
where
    R: AsyncRead + Unpin,
{
    let session_id = ctx.session.id.as_str();
    let server_name = ctx.session.server_name().to_string();
    let mut raw = Vec::new();
    let mut keepalive = Keepalive::new(Instant::now());

    loop {
        // Partial lines survive a keepalive timeout; `raw` is cleared only
        // once a full line has been taken.
        match tokio::time::timeout(PING_INTERVAL, reader.read_until(b'\n', &mut raw)).await {
            Ok(Ok(0)) => break,
            Ok(Err(e)) => {
                tracing::debug!(%session_id, "Read error: {e}");
                break;
            }
            Err(_) => {
                match keepalive.on_idle(Instant::now()) {
                    Idle::SendPing => {
                        let ping = Message::from_server(&server_name, "PING", vec![server_name.as_str()]);
                        if ctx.session.write(ping).await.is_err() {
                            break;
                        }
                    }
                    Idle::Wait => {}
                    Idle::TimedOut => {
                        tracing::info!(%session_id, "Ping timeout");
                        break;
                    }
                }
                continue;
            }
            Ok(Ok(_)) => {}
        }

        keepalive.on_traffic(Instant::now());
        let line = String::from_utf8_lossy(&raw).into_owned();
        raw.clear();
        let Some(msg) = Message::parse(&line) else {
            continue;
        };
        tracing::debug!(%session_id, "<- {}", line.trim_end());

        if msg.command == "PONG" {
            continue;
        }

        match dispatch(ctx, reg, &msg).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Quit) => break,
            Err(ConnectionClosed) => {
                tracing::debug!(%session_id, "Client gone while replying");
                break;
            }
        }
    }
}

async fn dispatch(
    ctx: &Arc<Context>,
    reg: &mut Registration,
    msg: &Message,
) -> Result<Flow, ConnectionClosed> {
    let session = &ctx.session;
    match msg.command.as_str() {
        "CAP" => handle_cap(ctx, reg, msg).await?,
        "NICK" => handle_nick(ctx, reg, msg).await?,
        "USER" => {
            if msg.params.len() >= 4 && !reg.registered {
                reg.user = Some(msg.params[0].clone());
                try_complete_registration(ctx, reg).await?;
            }
        }
        "PING" => {
            let token = msg.param(0).unwrap_or_default();
            let pong = Message::from_server(session.server_name(), "PONG", vec![session.server_name(), token]);
            session.write(pong).await?;
        }
        "QUIT" => {
            session
                .write(format!("ERROR :Closing Link: {} (Quit)", session.current_nick()))
                .await?;
            return Ok(Flow::Quit);
        }
        "PRIVMSG" | "JOIN" | "PART" | "MODE" | "LIST" | "WHO" | "WHOIS" | "KICK" | "INVITE"
            if !reg.registered =>
        {
            let reply = session.numeric(irc::ERR_NOTREGISTERED, &["You have not registered"]);
            session.write(reply).await?;
        }
        "PRIVMSG" => commands::privmsg(ctx, msg).await?,
        "JOIN" => commands::join(ctx, msg).await?,
        "PART" => commands::part(ctx, msg).await?,
        "MODE" => commands::mode(ctx, msg).await?,
        "LIST" => commands::list(ctx).await?,
        "WHO" => commands::who(ctx, msg).await?,
        "WHOIS" => commands::whois(ctx, msg).await?,
        "KICK" => commands::kick(ctx, msg).await?,
        "INVITE" => commands::invite(ctx, msg).await?,
        other => {
            tracing::debug!(session_id = %session.id, command = other, "Ignoring command");
        }
    }
    Ok(Flow::Continue)
}

async fn handle_cap(
    ctx: &Arc<Context>,
    reg: &mut Registration,
    msg: &Message,
) -> Result<(), ConnectionClosed> {
    let session = &ctx.session;
    let nick = session.current_nick();
    let subcmd = msg.param(0).map(str::to_ascii_uppercase);
    match subcmd.as_deref() {
        Some("LS") => {
            if !reg.registered {
                reg.cap_negotiating = true;
            }
            let caps = SUPPORTED_CAPS.join(" ");
            let reply = Message::from_server(session.server_name(), "CAP", vec![nick.as_str(), "LS", caps.as_str()]);
            session.write(reply).await?;
        }
        Some("REQ") => {
            let Some(caps) = msg.param(1) else {
                return Ok(());
            };
            if !reg.registered {
                reg.cap_negotiating = true;
            }
            let requested: Vec<&str> = caps.split_whitespace().collect();
            let all_known = !requested.is_empty()
                && requested
                    .iter()
                    .all(|cap| SUPPORTED_CAPS.iter().any(|s| s.eq_ignore_ascii_case(cap)));
            let verdict = if all_known {
                for cap in &requested {
                    session.negotiate_capability(cap);
                }
                "ACK"
            } else {
                "NAK"
            };
            let reply = Message::from_server(session.server_name(), "CAP", vec![nick.as_str(), verdict, caps]);
            session.write(reply).await?;
        }
        Some("END") => {
            reg.cap_negotiating = false;
            try_complete_registration(ctx, reg).await?;
        }
        _ => {}
    }
    Ok(())
}

async fn handle_nick(
    ctx: &Arc<Context>,
    reg: &mut Registration,
    msg: &Message,
) -> Result<(), ConnectionClosed> {
    let Some(nick) = msg.param(0).filter(|n| !n.is_empty()) else {
        return Ok(());
    };
    let old_mask = ctx.session.hostmask();
    let previous = ctx.session.set_nick(nick);
    if reg.registered {
        if previous.as_deref() != Some(nick) {
            ctx.session.write(format!(":{old_mask} NICK {nick}")).await?;
        }
        return Ok(());
    }
    try_complete_registration(ctx, reg).await
}

async fn try_complete_registration(
    ctx: &Arc<Context>,
    reg: &mut Registration,
) -> Result<(), ConnectionClosed> {
    if reg.registered || reg.cap_negotiating {
        return Ok(());
    }
    if !ctx.session.has_nick() || reg.user.is_none() {
        return Ok(());
    }
    reg.registered = true;

    let session = &ctx.session;
    let nick = session.current_nick();
    let server_name = session.server_name();
    let created = session.created().to_rfc2822();
    let version = concat!("irc-bridge-", env!("CARGO_PKG_VERSION"));

    let welcome = format!("Welcome to {server_name}, {nick}");
    let yourhost = format!("Your host is {server_name}, running {version}");
    let created = format!("This server was created {created}");
    session
        .write_batch(vec![
            session.numeric(irc::RPL_WELCOME, &[&welcome]),
            session.numeric(irc::RPL_YOURHOST, &[&yourhost]),
            session.numeric(irc::RPL_CREATED, &[&created]),
            session.numeric(irc::RPL_MYINFO, &[server_name, version, "o", "o"]),
            session.status_line("connected; use LIST to see your chats"),
        ])
        .await?;
    tracing::info!(session_id = %session.id, %nick, "Registered");

    match ctx.gateway.backend.subscribe().await {
        Ok(events) => reg.relay = Some(relay::spawn(Arc::clone(ctx), events)),
        Err(e) => {
            tracing::warn!(session_id = %session.id, "Event subscription failed: {e}");
            session
                .status(&format!("could not subscribe to backend events: {e}"))
                .await?;
        }
    }
    Ok(())
}
