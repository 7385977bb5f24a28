//! Backend event relay.
//!
//! One task per registered session drains the backend subscription and turns
//! events into IRC lines. The model is updated before the line is written,
//! so a client that reacts to a line sees matching state. Lines go through
//! the session's write path like any command reply.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::backend::{BackendEvent, IncomingMessage, MembershipChange};
use crate::chat::Chat;
use crate::commands::{self, Context};
use crate::ident;
use crate::session::{ConnectionClosed, Line};

/// Start relaying `events` to the session. The task ends when the
/// subscription closes or the client connection is gone; aborting it drops
/// the receiver, which unsubscribes.
pub fn spawn(ctx: Arc<Context>, events: mpsc::Receiver<BackendEvent>) -> JoinHandle<()> {
    tokio::spawn(run(ctx, events))
}

async fn run(ctx: Arc<Context>, mut events: mpsc::Receiver<BackendEvent>) {
    while let Some(event) = events.recv().await {
        if handle_event(&ctx, event).await.is_err() {
            break;
        }
    }
    tracing::debug!(session_id = %ctx.session.id, "Event relay stopped");
}

pub async fn handle_event(ctx: &Context, event: BackendEvent) -> Result<(), ConnectionClosed> {
    match event {
        BackendEvent::Message(msg) => relay_message(ctx, msg).await,
        BackendEvent::Membership { chat_id, change } => {
            let Some(chat) = ctx.chats.lookup_id(&chat_id) else {
                // Picked up on the next sync.
                tracing::debug!(session_id = %ctx.session.id, %chat_id, "Membership change for unseen chat");
                return Ok(());
            };
            relay_membership(ctx, &chat, change).await
        }
        BackendEvent::Presence { user, online } => {
            tracing::debug!(session_id = %ctx.session.id, %user, online, "Presence changed");
            Ok(())
        }
    }
}

async fn relay_message(ctx: &Context, msg: IncomingMessage) -> Result<(), ConnectionClosed> {
    if msg.from_me || msg.body.is_empty() {
        return Ok(());
    }

    let mut chat = match ctx.chats.resolve_by_id(&msg.chat_id).await {
        Ok(chat) => chat,
        Err(e) => {
            tracing::warn!(session_id = %ctx.session.id, chat_id = %msg.chat_id, "Dropping message: {e}");
            return Ok(());
        }
    };

    let mut lines: Vec<Line> = Vec::new();
    let (from, to) = if chat.is_group {
        if !chat.joined {
            chat = refresh_or_keep(ctx, chat).await;
            ctx.chats.mark_joined(&chat.id, true);
            chat.joined = true;
            lines.extend(commands::join_lines(&ctx.session, &chat));
        }
        if chat.participant_by_id(&msg.sender).is_none() {
            chat = refresh_or_keep(ctx, chat).await;
        }
        let from = chat
            .participant_by_id(&msg.sender)
            .map(|p| p.safe_name.clone())
            .unwrap_or_else(|| ident::safe_name("", &msg.sender));
        (from, chat.identifier.clone())
    } else {
        (chat.identifier.clone(), ctx.session.current_nick())
    };

    ctx.gateway
        .message_log
        .log(msg.timestamp, &from, &to, &msg.body);

    let mask = commands::user_mask(&ctx.session, &from);
    for text in msg.body.lines().filter(|l| !l.is_empty()) {
        lines.push(Line::at(format!(":{mask} PRIVMSG {to} :{text}"), msg.timestamp));
    }
    ctx.session.write_batch(lines).await
}

async fn refresh_or_keep(ctx: &Context, chat: Chat) -> Chat {
    match ctx.chats.refresh_participants(&chat.id).await {
        Ok(fresh) => fresh,
        Err(e) => {
            tracing::warn!(session_id = %ctx.session.id, chat = %chat.identifier, "Participant refresh failed: {e}");
            chat
        }
    }
}

async fn relay_membership(
    ctx: &Context,
    chat: &Chat,
    change: MembershipChange,
) -> Result<(), ConnectionClosed> {
    let channel = chat.identifier.as_str();
    let line = match change {
        MembershipChange::Added(member) => {
            let Some(added) = ctx.chats.add_participant(&chat.id, &member) else {
                return Ok(());
            };
            let nick = commands::nick_of(&ctx.session, &added);
            format!(":{} JOIN {channel}", commands::user_mask(&ctx.session, &nick))
        }
        MembershipChange::Removed { user, by } => {
            let Some(removed) = ctx.chats.remove_participant(&chat.id, &user) else {
                return Ok(());
            };
            if removed.is_self {
                ctx.chats.mark_joined(&chat.id, false);
            }
            let nick = commands::nick_of(&ctx.session, &removed);
            match by.filter(|actor| *actor != user) {
                Some(actor) => {
                    let actor_nick = if actor == ctx.gateway.backend.me() {
                        ctx.session.current_nick()
                    } else {
                        chat.participant_by_id(&actor)
                            .map(|p| p.safe_name.clone())
                            .unwrap_or_else(|| ident::safe_name("", &actor))
                    };
                    format!(
                        ":{} KICK {channel} {nick} :removed",
                        commands::user_mask(&ctx.session, &actor_nick)
                    )
                }
                None => format!(":{} PART {channel}", commands::user_mask(&ctx.session, &nick)),
            }
        }
        MembershipChange::AdminChanged { user, admin } => {
            let Some(changed) = ctx.chats.set_admin(&chat.id, &user, admin) else {
                return Ok(());
            };
            let flag = if admin { "+o" } else { "-o" };
            format!(
                ":{} MODE {channel} {flag} {}",
                ctx.session.server_name(),
                commands::nick_of(&ctx.session, &changed)
            )
        }
    };

    if !chat.joined {
        return Ok(());
    }
    ctx.session.write(line).await
}
