//! Chat backend abstraction.
//!
//! The gateway never talks to the messaging service directly; it consumes
//! this trait. One backend handle is shared read-only by every session.
//! Optional capabilities default to [`BackendError::Unsupported`] so a
//! backend only implements what its service offers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Backend chat identifier (e.g. `31612345678@c.us`, `1203-4567@g.us`).
pub type ChatId = String;
/// Backend user identifier.
pub type UserId = String;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    /// The backend could not complete the call (network, auth, rate limit).
    #[error("{0}")]
    Unavailable(String),
    /// The backend does not know the referenced chat or user.
    #[error("no such chat or user: {0}")]
    UnknownEntity(String),
    /// The operation is not offered by this backend.
    #[error("operation not supported by this backend")]
    Unsupported,
}

/// A conversation as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendChat {
    pub id: ChatId,
    pub name: String,
    #[serde(default)]
    pub is_group: bool,
    /// Group members, when the listing includes them.
    #[serde(default)]
    pub participants: Vec<BackendParticipant>,
}

/// One member of a backend group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendParticipant {
    pub id: UserId,
    /// Contact name, push name or phone number, whatever the backend has.
    pub name: String,
    #[serde(default)]
    pub is_admin: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub online: bool,
}

/// An inbound chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: ChatId,
    pub sender: UserId,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    /// Authored by the account the gateway is logged in as.
    pub from_me: bool,
}

/// Change to a group's membership.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    Added(BackendParticipant),
    /// `by` is set when an admin removed the user, unset when they left.
    Removed { user: UserId, by: Option<UserId> },
    AdminChanged { user: UserId, admin: bool },
}

/// Events pushed by the backend subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Message(IncomingMessage),
    Membership {
        chat_id: ChatId,
        change: MembershipChange,
    },
    Presence { user: UserId, online: bool },
}

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// The user ID of the logged-in account.
    fn me(&self) -> UserId;

    async fn send_message(&self, chat: &str, body: &str) -> Result<(), BackendError>;

    async fn list_chats(&self) -> Result<Vec<BackendChat>, BackendError>;

    async fn get_participants(&self, chat: &str) -> Result<Vec<BackendParticipant>, BackendError>;

    async fn set_admin(&self, chat: &str, user: &str, admin: bool) -> Result<(), BackendError>;

    async fn add_participant(&self, chat: &str, user: &str) -> Result<(), BackendError>;

    async fn remove_participant(&self, chat: &str, user: &str) -> Result<(), BackendError>;

    /// Groups shared between the logged-in account and `contact`.
    async fn get_common_groups(&self, contact: &str) -> Result<Vec<BackendChat>, BackendError> {
        let _ = contact;
        Err(BackendError::Unsupported)
    }

    /// Presence for a user; `Ok(None)` when the backend has no record.
    async fn get_presence(&self, user: &str) -> Result<Option<Presence>, BackendError>;

    /// Subscribe to backend events. Dropping the receiver unsubscribes.
    async fn subscribe(&self) -> Result<mpsc::Receiver<BackendEvent>, BackendError>;
}
