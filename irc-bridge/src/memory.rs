//! In-process [`ChatBackend`].
//!
//! Holds chats, members, admin flags and presence in memory and fans events
//! out to every subscriber. Membership-mutating calls emit the same events a
//! real service would push back. Used by the test suite, and by the binary
//! when started with `--fixture`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::backend::{
    BackendChat, BackendError, BackendEvent, BackendParticipant, ChatBackend, ChatId,
    IncomingMessage, MembershipChange, Presence, UserId,
};

/// Events buffered per subscriber before `emit` waits.
const SUBSCRIBER_BUFFER: usize = 256;

/// JSON fixture accepted by [`MemoryBackend::load_fixture`].
#[derive(Debug, Deserialize)]
struct Fixture {
    me: UserId,
    #[serde(default)]
    chats: Vec<BackendChat>,
    #[serde(default)]
    presence: HashMap<UserId, bool>,
}

#[derive(Default)]
struct State {
    chats: Vec<BackendChat>,
    presence: HashMap<UserId, bool>,
    /// Operation name -> error text returned by the next call.
    failures: HashMap<&'static str, String>,
    sent: Vec<(ChatId, String)>,
    calls: Vec<String>,
    subscribers: Vec<mpsc::Sender<BackendEvent>>,
    /// `list_chats` reports groups without their members.
    list_without_members: bool,
}

impl State {
    fn chat(&self, id: &str) -> Result<&BackendChat, BackendError> {
        self.chats
            .iter()
            .find(|c| c.id == id)
            .ok_or_else(|| BackendError::UnknownEntity(id.to_string()))
    }

    fn group_mut(&mut self, id: &str) -> Result<&mut BackendChat, BackendError> {
        self.chats
            .iter_mut()
            .find(|c| c.id == id && c.is_group)
            .ok_or_else(|| BackendError::UnknownEntity(id.to_string()))
    }
}

pub struct MemoryBackend {
    me: UserId,
    state: Mutex<State>,
}

impl MemoryBackend {
    pub fn new(me: &str) -> Self {
        Self {
            me: me.to_string(),
            state: Mutex::new(State::default()),
        }
    }

    /// Build a backend from a JSON fixture file.
    pub fn load_fixture(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture: {}", path.display()))?;
        let fixture: Fixture = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse fixture: {}", path.display()))?;
        let backend = Self::new(&fixture.me);
        {
            let mut state = backend.state.lock();
            state.chats = fixture.chats;
            state.presence = fixture.presence;
        }
        Ok(backend)
    }

    pub fn add_chat(&self, chat: BackendChat) {
        self.state.lock().chats.push(chat);
    }

    pub fn set_presence(&self, user: &str, online: bool) {
        self.state.lock().presence.insert(user.to_string(), online);
    }

    /// Behave like services whose chat listing leaves out group members,
    /// so they are only available through `get_participants`.
    pub fn list_without_members(&self, enabled: bool) {
        self.state.lock().list_without_members = enabled;
    }

    /// Make the next call to `op` fail with `BackendError::Unavailable`.
    pub fn fail_next(&self, op: &'static str, message: &str) {
        self.state.lock().failures.insert(op, message.to_string());
    }

    /// Messages passed to `send_message`, in call order.
    pub fn sent(&self) -> Vec<(ChatId, String)> {
        self.state.lock().sent.clone()
    }

    /// Log of mutating calls, e.g. `"remove_participant g@g.us bob@c.us"`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    /// Subscribers whose receiver is still alive.
    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Push an event to every live subscriber.
    pub async fn emit(&self, event: BackendEvent) {
        let subscribers = self.state.lock().subscribers.clone();
        for tx in subscribers {
            if tx.send(event.clone()).await.is_err() {
                tracing::debug!("Dropping closed subscriber");
            }
        }
    }

    /// Simulate an inbound message from `sender` in `chat_id`.
    pub async fn deliver(&self, chat_id: &str, sender: &str, body: &str) {
        self.emit(BackendEvent::Message(IncomingMessage {
            chat_id: chat_id.to_string(),
            sender: sender.to_string(),
            body: body.to_string(),
            timestamp: Utc::now(),
            from_me: sender == self.me,
        }))
        .await;
    }

    fn check(&self, op: &'static str) -> Result<(), BackendError> {
        match self.state.lock().failures.remove(op) {
            Some(message) => Err(BackendError::Unavailable(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ChatBackend for MemoryBackend {
    fn me(&self) -> UserId {
        self.me.clone()
    }

    async fn send_message(&self, chat: &str, body: &str) -> Result<(), BackendError> {
        self.check("send_message")?;
        let mut state = self.state.lock();
        state.chat(chat)?;
        state.sent.push((chat.to_string(), body.to_string()));
        Ok(())
    }

    async fn list_chats(&self) -> Result<Vec<BackendChat>, BackendError> {
        self.check("list_chats")?;
        let state = self.state.lock();
        let mut chats = state.chats.clone();
        if state.list_without_members {
            for chat in &mut chats {
                chat.participants.clear();
            }
        }
        Ok(chats)
    }

    async fn get_participants(&self, chat: &str) -> Result<Vec<BackendParticipant>, BackendError> {
        self.check("get_participants")?;
        Ok(self.state.lock().chat(chat)?.participants.clone())
    }

    async fn set_admin(&self, chat: &str, user: &str, admin: bool) -> Result<(), BackendError> {
        self.check("set_admin")?;
        {
            let mut state = self.state.lock();
            state.calls.push(format!("set_admin {chat} {user} {admin}"));
            let group = state.group_mut(chat)?;
            let member = group
                .participants
                .iter_mut()
                .find(|p| p.id == user)
                .ok_or_else(|| BackendError::UnknownEntity(user.to_string()))?;
            member.is_admin = admin;
        }
        self.emit(BackendEvent::Membership {
            chat_id: chat.to_string(),
            change: MembershipChange::AdminChanged {
                user: user.to_string(),
                admin,
            },
        })
        .await;
        Ok(())
    }

    async fn add_participant(&self, chat: &str, user: &str) -> Result<(), BackendError> {
        self.check("add_participant")?;
        let member = {
            let mut state = self.state.lock();
            state.calls.push(format!("add_participant {chat} {user}"));
            let name = state
                .chats
                .iter()
                .find(|c| c.id == user)
                .map(|c| c.name.clone())
                .unwrap_or_else(|| user.to_string());
            let group = state.group_mut(chat)?;
            if group.participants.iter().any(|p| p.id == user) {
                return Err(BackendError::Unavailable(format!("{user} is already a participant")));
            }
            let member = BackendParticipant {
                id: user.to_string(),
                name,
                is_admin: false,
            };
            group.participants.push(member.clone());
            member
        };
        self.emit(BackendEvent::Membership {
            chat_id: chat.to_string(),
            change: MembershipChange::Added(member),
        })
        .await;
        Ok(())
    }

    async fn remove_participant(&self, chat: &str, user: &str) -> Result<(), BackendError> {
        self.check("remove_participant")?;
        {
            let mut state = self.state.lock();
            state.calls.push(format!("remove_participant {chat} {user}"));
            let group = state.group_mut(chat)?;
            let before = group.participants.len();
            group.participants.retain(|p| p.id != user);
            if group.participants.len() == before {
                return Err(BackendError::UnknownEntity(user.to_string()));
            }
        }
        self.emit(BackendEvent::Membership {
            chat_id: chat.to_string(),
            change: MembershipChange::Removed {
                user: user.to_string(),
                by: Some(self.me.clone()),
            },
        })
        .await;
        Ok(())
    }

    async fn get_common_groups(&self, contact: &str) -> Result<Vec<BackendChat>, BackendError> {
        self.check("get_common_groups")?;
        let state = self.state.lock();
        Ok(state
            .chats
            .iter()
            .filter(|c| c.is_group && c.participants.iter().any(|p| p.id == contact))
            .cloned()
            .collect())
    }

    async fn get_presence(&self, user: &str) -> Result<Option<Presence>, BackendError> {
        self.check("get_presence")?;
        Ok(self
            .state
            .lock()
            .presence
            .get(user)
            .map(|&online| Presence { online }))
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<BackendEvent>, BackendError> {
        self.check("subscribe")?;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.state.lock().subscribers.push(tx);
        Ok(rx)
    }
}
