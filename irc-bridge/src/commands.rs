//! Bridging command handlers.
//!
//! Each handler translates one IRC command into model lookups and backend
//! calls and writes the replies. Lookup and backend failures end here as a
//! numeric or a status notice; the only error a handler returns is
//! [`ConnectionClosed`].

use std::sync::Arc;

use chrono::Utc;

use crate::backend::BackendError;
use crate::chat::{Chat, ChatModel, Participant, ResolveError};
use crate::ident::STATUS_NICK;
use crate::irc::{self, Message};
use crate::server::Gateway;
use crate::session::{ConnectionClosed, Line, Session};

/// Longest NAMES payload before starting a new 353 line.
const NAMES_LINE_BUDGET: usize = 400;

/// Everything a handler needs for one session.
pub struct Context {
    pub session: Arc<Session>,
    pub chats: ChatModel,
    pub gateway: Arc<Gateway>,
}

enum Resolution {
    Found(Chat),
    NotFound,
    /// Backend failure, already reported to the client.
    Failed,
}

async fn resolve(ctx: &Context, command: &str, ident: &str) -> Result<Resolution, ConnectionClosed> {
    match ctx.chats.resolve(ident).await {
        Ok(chat) => Ok(Resolution::Found(chat)),
        Err(ResolveError::NotFound(_)) => {
            tracing::debug!(session_id = %ctx.session.id, command, token = ident, "Unresolved target");
            Ok(Resolution::NotFound)
        }
        Err(ResolveError::Backend(e)) => {
            tracing::warn!(session_id = %ctx.session.id, command, token = ident, "Lookup failed: {e}");
            ctx.session
                .status(&format!("error while resolving {ident}: {e}"))
                .await?;
            Ok(Resolution::Failed)
        }
    }
}

/// Nick a participant appears under: the session's own nick for self.
pub fn nick_of(session: &Session, participant: &Participant) -> String {
    if participant.is_self {
        session.current_nick()
    } else {
        participant.safe_name.clone()
    }
}

/// `nick!nick@server` for a bridged user.
pub fn user_mask(session: &Session, nick: &str) -> String {
    format!("{nick}!{nick}@{}", session.server_name())
}

/// JOIN echo, topic and NAMES for a group chat, as one batch.
pub fn join_lines(session: &Session, chat: &Chat) -> Vec<Line> {
    let ident = chat.identifier.as_str();
    let mut lines = vec![Line::from(format!(":{} JOIN {ident}", session.hostmask()))];
    lines.push(session.numeric(irc::RPL_TOPIC, &[ident, &chat.name]));

    let mut names = String::new();
    for participant in &chat.participants {
        let mut entry = String::new();
        if participant.is_admin {
            entry.push('@');
        }
        entry.push_str(&nick_of(session, participant));
        if !names.is_empty() && names.len() + entry.len() + 1 > NAMES_LINE_BUDGET {
            lines.push(session.numeric(irc::RPL_NAMREPLY, &["=", ident, &names]));
            names.clear();
        }
        if !names.is_empty() {
            names.push(' ');
        }
        names.push_str(&entry);
    }
    if !names.is_empty() {
        lines.push(session.numeric(irc::RPL_NAMREPLY, &["=", ident, &names]));
    }
    lines.push(session.numeric(irc::RPL_ENDOFNAMES, &[ident, "End of /NAMES list."]));
    lines
}

pub async fn privmsg(ctx: &Context, msg: &Message) -> Result<(), ConnectionClosed> {
    let (Some(target), Some(text)) = (msg.param(0), msg.param(1)) else {
        return Ok(());
    };

    let body = match irc::ctcp_action(text) {
        Some(action) => format!("_{action}_"),
        None => text.to_string(),
    };

    ctx.gateway
        .message_log
        .log(Utc::now(), &ctx.session.current_nick(), target, &body);

    // Gateway chatter; never forwarded.
    if target.eq_ignore_ascii_case(STATUS_NICK) {
        return Ok(());
    }

    let chat = match resolve(ctx, "PRIVMSG", target).await? {
        Resolution::Found(chat) => chat,
        Resolution::NotFound => return ctx.session.status("unknown chat").await,
        Resolution::Failed => return Ok(()),
    };

    match ctx.gateway.backend.send_message(&chat.id, &body).await {
        Ok(()) => {
            tracing::debug!(session_id = %ctx.session.id, chat = %chat.identifier, "Message sent");
            Ok(())
        }
        Err(e) => {
            let text = format!("err while sending: {e}");
            tracing::warn!(session_id = %ctx.session.id, chat = %chat.identifier, "{text}");
            ctx.session.status(&text).await
        }
    }
}

pub async fn join(ctx: &Context, msg: &Message) -> Result<(), ConnectionClosed> {
    let Some(targets) = msg.param(0) else {
        return Ok(());
    };

    for ident in targets.split(',').filter(|t| !t.is_empty()) {
        let chat = match resolve(ctx, "JOIN", ident).await? {
            Resolution::Found(chat) => chat,
            Resolution::NotFound => {
                ctx.session.status(&format!("chat not found: {ident}")).await?;
                continue;
            }
            Resolution::Failed => continue,
        };
        join_chat(ctx, chat).await?;
    }
    Ok(())
}

async fn join_chat(ctx: &Context, chat: Chat) -> Result<(), ConnectionClosed> {
    if !chat.is_group {
        ctx.chats.mark_joined(&chat.id, true);
        return Ok(());
    }

    let mut chat = match ctx.chats.refresh_participants(&chat.id).await {
        Ok(chat) => chat,
        Err(e) => {
            tracing::warn!(session_id = %ctx.session.id, chat = %chat.identifier, "Join failed: {e}");
            return ctx.session.status(&format!("error while joining: {e}")).await;
        }
    };
    ctx.chats.mark_joined(&chat.id, true);
    chat.joined = true;
    tracing::info!(session_id = %ctx.session.id, chat = %chat.identifier, "Joined");
    ctx.session.write_batch(join_lines(&ctx.session, &chat)).await
}

pub async fn part(ctx: &Context, msg: &Message) -> Result<(), ConnectionClosed> {
    let Some(targets) = msg.param(0) else {
        return Ok(());
    };

    for ident in targets.split(',').filter(|t| !t.is_empty()) {
        let chat = match resolve(ctx, "PART", ident).await? {
            Resolution::Found(chat) => chat,
            Resolution::NotFound => {
                ctx.session.status("unknown chat").await?;
                continue;
            }
            Resolution::Failed => continue,
        };
        ctx.chats.mark_joined(&chat.id, false);
        if chat.is_group {
            let line = format!(":{} PART {}", ctx.session.hostmask(), chat.identifier);
            ctx.session.write(line).await?;
        }
    }
    Ok(())
}

pub async fn mode(ctx: &Context, msg: &Message) -> Result<(), ConnectionClosed> {
    let [ident, flag, nick] = msg.params.as_slice() else {
        return Ok(());
    };
    let admin = match flag.as_str() {
        "+o" => true,
        "-o" => false,
        _ => return Ok(()),
    };

    let chat = match resolve(ctx, "MODE", ident).await? {
        Resolution::Found(chat) => chat,
        Resolution::NotFound => return ctx.session.status("chat not found").await,
        Resolution::Failed => return Ok(()),
    };
    let Some(participant) = chat.find_participant(nick) else {
        return Ok(());
    };

    // Flip the flag first so the backend's own admin event is a no-op.
    let previous = participant.is_admin;
    ctx.chats.set_admin(&chat.id, &participant.id, admin);

    let verb = if admin { "opping" } else { "deopping" };
    if let Err(e) = ctx
        .gateway
        .backend
        .set_admin(&chat.id, &participant.id, admin)
        .await
    {
        ctx.chats.set_admin(&chat.id, &participant.id, previous);
        let text = format!("error while {verb} {nick}: {e}");
        tracing::warn!(session_id = %ctx.session.id, chat = %chat.identifier, "{text}");
        return ctx.session.status(&text).await;
    }

    tracing::info!(session_id = %ctx.session.id, chat = %chat.identifier, member = %participant.safe_name, "Admin {flag}");
    let line = format!(
        ":{} MODE {} {flag} {}",
        ctx.session.hostmask(),
        chat.identifier,
        participant.safe_name
    );
    ctx.session.write(line).await
}

pub async fn list(ctx: &Context) -> Result<(), ConnectionClosed> {
    if let Err(e) = ctx.chats.sync().await {
        tracing::warn!(session_id = %ctx.session.id, "LIST sync failed: {e}");
    }
    for chat in ctx.chats.chats() {
        if chat.members_loaded {
            continue;
        }
        let ident = chat.identifier.clone();
        if let Err(e) = ctx.chats.load_members(chat).await {
            tracing::warn!(session_id = %ctx.session.id, chat = %ident, "Member count unavailable: {e}");
        }
    }

    let mut lines: Vec<Line> = ctx
        .chats
        .chats()
        .iter()
        .map(|chat| {
            let count = chat.participant_count().to_string();
            ctx.session
                .numeric(irc::RPL_LIST, &[&chat.identifier, &count, &chat.name])
        })
        .collect();
    lines.push(ctx.session.numeric(irc::RPL_LISTEND, &["End of LIST"]));
    ctx.session.write_batch(lines).await
}

pub async fn who(ctx: &Context, msg: &Message) -> Result<(), ConnectionClosed> {
    let Some(ident) = msg.param(0) else {
        return Ok(());
    };

    let chat = match ctx.chats.resolve(ident).await {
        Ok(chat) => Some(chat),
        Err(ResolveError::NotFound(_)) => None,
        Err(e) => {
            tracing::warn!(session_id = %ctx.session.id, token = ident, "WHO lookup failed: {e}");
            None
        }
    };

    let server = ctx.session.server_name();
    let mut lines = Vec::new();
    for participant in chat.iter().filter(|c| c.is_group).flat_map(|c| &c.participants) {
        if participant.is_self {
            continue;
        }
        let mut flags = match ctx.gateway.backend.get_presence(&participant.id).await {
            Ok(Some(presence)) if !presence.online => "G".to_string(),
            _ => "H".to_string(),
        };
        if participant.is_admin {
            flags.push('@');
        }
        let realname = format!("0 {}", participant.full_name);
        lines.push(ctx.session.numeric(
            irc::RPL_WHOREPLY,
            &[
                ident,
                &participant.safe_name,
                server,
                server,
                &participant.safe_name,
                &flags,
                &realname,
            ],
        ));
    }
    lines.push(ctx.session.numeric(irc::RPL_ENDOFWHO, &[ident, "End of /WHO list."]));
    ctx.session.write_batch(lines).await
}

pub async fn whois(ctx: &Context, msg: &Message) -> Result<(), ConnectionClosed> {
    // WHOIS [server] nick
    let Some(target) = msg.params.last().map(String::as_str) else {
        return Ok(());
    };

    let chat = match ctx.chats.resolve(target).await {
        Ok(chat) if !chat.is_group => chat,
        other => {
            if let Err(ResolveError::Backend(e)) = other {
                tracing::warn!(session_id = %ctx.session.id, token = target, "WHOIS lookup failed: {e}");
            }
            let reply = ctx
                .session
                .numeric(irc::ERR_NOSUCHNICK, &[target, "No such nick/channel"]);
            return ctx.session.write(reply).await;
        }
    };

    let ident = chat.identifier.as_str();
    let user = format!("~{ident}");
    let mut lines = vec![ctx.session.numeric(
        irc::RPL_WHOISUSER,
        &[ident, &user, ctx.session.server_name(), "*", &chat.name],
    )];

    match ctx.gateway.backend.get_common_groups(&chat.id).await {
        Ok(groups) if !groups.is_empty() => {
            let names: Vec<String> = groups.iter().map(|g| ctx.chats.identify(g)).collect();
            lines.push(ctx.session.numeric(irc::RPL_WHOISCHANNELS, &[ident, &names.join(" ")]));
        }
        Ok(_) | Err(BackendError::Unsupported) => {}
        Err(e) => {
            tracing::warn!(session_id = %ctx.session.id, token = ident, "Common groups lookup failed: {e}");
        }
    }

    lines.push(ctx.session.numeric(irc::RPL_ENDOFWHOIS, &[ident, "End of /WHOIS list."]));
    ctx.session.write_batch(lines).await
}

pub async fn kick(ctx: &Context, msg: &Message) -> Result<(), ConnectionClosed> {
    let (Some(ident), Some(nick)) = (msg.param(0), msg.param(1)) else {
        return Ok(());
    };

    let chat = match resolve(ctx, "KICK", ident).await? {
        Resolution::Found(chat) if chat.is_group => chat,
        Resolution::Failed => return Ok(()),
        _ => {
            let reply = ctx.session.numeric(irc::ERR_NOSUCHCHANNEL, &[ident, "No such channel"]);
            return ctx.session.write(reply).await;
        }
    };
    let Some(participant) = chat.find_participant(nick) else {
        return Ok(());
    };

    match ctx
        .gateway
        .backend
        .remove_participant(&chat.id, &participant.id)
        .await
    {
        Ok(()) => {
            tracing::info!(session_id = %ctx.session.id, chat = %chat.identifier, member = %participant.safe_name, "Kicked");
            Ok(())
        }
        Err(e) => {
            let text = format!("error while kicking {nick}: {e}");
            tracing::warn!(session_id = %ctx.session.id, chat = %chat.identifier, "{text}");
            ctx.session.status(&text).await
        }
    }
}

pub async fn invite(ctx: &Context, msg: &Message) -> Result<(), ConnectionClosed> {
    let (Some(nick), Some(ident)) = (msg.param(0), msg.param(1)) else {
        return Ok(());
    };

    let chat = match resolve(ctx, "INVITE", ident).await? {
        Resolution::Found(chat) if chat.is_group => chat,
        Resolution::Failed => return Ok(()),
        _ => {
            let reply = ctx
                .session
                .numeric(irc::ERR_NOTONCHANNEL, &[ident, "You're not on that channel"]);
            return ctx.session.write(reply).await;
        }
    };
    let person = match resolve(ctx, "INVITE", nick).await? {
        Resolution::Found(person) if !person.is_group => person,
        Resolution::Failed => return Ok(()),
        _ => {
            let reply = ctx
                .session
                .numeric(irc::ERR_NOSUCHNICK, &[nick, "No such nick/channel"]);
            return ctx.session.write(reply).await;
        }
    };

    match ctx.gateway.backend.add_participant(&chat.id, &person.id).await {
        Ok(()) => {
            tracing::info!(session_id = %ctx.session.id, chat = %chat.identifier, member = %person.identifier, "Invited");
            let reply = ctx
                .session
                .numeric(irc::RPL_INVITING, &[&person.identifier, &chat.identifier]);
            ctx.session.write(reply).await
        }
        Err(e) => {
            let text = format!("error while adding {nick}: {e}");
            tracing::warn!(session_id = %ctx.session.id, chat = %chat.identifier, "{text}");
            ctx.session.status(&text).await
        }
    }
}
