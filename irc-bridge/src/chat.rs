//! Per-session chat and participant model.
//!
//! The [`ChatModel`] is the session's single view of which chats exist and
//! who is in them. Entries are created lazily from the backend and are never
//! removed: PART only clears `joined`, so a parted chat stays addressable.
//!
//! The table lock is never held across a backend call. Callers get
//! snapshots (`Chat` clones) and mutate through the model's methods.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{BackendChat, BackendError, BackendParticipant, ChatBackend, ChatId, UserId};
use crate::ident;

/// One member of a group chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: UserId,
    /// IRC-nick-safe name used in NAMES, WHO, MODE and KICK.
    pub safe_name: String,
    pub full_name: String,
    pub is_self: bool,
    pub is_admin: bool,
}

impl Participant {
    fn from_backend(p: &BackendParticipant, me: &str) -> Self {
        Self {
            id: p.id.clone(),
            safe_name: ident::safe_name(&p.name, &p.id),
            full_name: p.name.clone(),
            is_self: p.id == me,
            is_admin: p.is_admin,
        }
    }
}

/// A backend conversation as seen by one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub id: ChatId,
    /// Channel name (`#...`) for groups, nick for direct chats.
    pub identifier: String,
    pub name: String,
    pub is_group: bool,
    pub joined: bool,
    pub participants: Vec<Participant>,
    /// The member list came from the backend, not just a listing that may
    /// leave members out. Direct chats have nothing to load.
    pub members_loaded: bool,
}

impl Chat {
    /// Member count as reported by LIST. Direct chats are always two people.
    pub fn participant_count(&self) -> usize {
        if self.is_group {
            self.participants.len()
        } else {
            2
        }
    }

    /// Find a participant by safe-name, ignoring case.
    ///
    /// Linear scan over the member list; the first match wins and `None`
    /// means the nick is not in this chat. Callers treat `None` as a silent
    /// no-op.
    pub fn find_participant(&self, nick: &str) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.safe_name.eq_ignore_ascii_case(nick))
    }

    pub fn participant_by_id(&self, user: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == user)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("chat not found: {0}")]
    NotFound(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

#[derive(Default)]
struct Table {
    chats: Vec<Chat>,
    by_identifier: HashMap<String, usize>,
    by_id: HashMap<ChatId, usize>,
}

impl Table {
    /// Insert a backend chat unless already known. Returns its index.
    fn insert(&mut self, chat: &BackendChat, me: &str) -> usize {
        if let Some(&idx) = self.by_id.get(&chat.id) {
            return idx;
        }
        let identifier = ident::to_identifier(&chat.id, &chat.name, chat.is_group, |token| {
            self.by_identifier.contains_key(token)
        });
        let idx = self.chats.len();
        self.by_identifier.insert(identifier.clone(), idx);
        self.by_id.insert(chat.id.clone(), idx);
        self.chats.push(Chat {
            id: chat.id.clone(),
            identifier,
            name: chat.name.clone(),
            is_group: chat.is_group,
            joined: false,
            participants: dedup_participants(&chat.participants, me),
            // A group always contains the account itself, so an empty
            // member list means the listing omitted members.
            members_loaded: !chat.is_group || !chat.participants.is_empty(),
        });
        idx
    }

    fn get_mut(&mut self, chat_id: &str) -> Option<&mut Chat> {
        let idx = *self.by_id.get(chat_id)?;
        self.chats.get_mut(idx)
    }
}

fn dedup_participants(members: &[BackendParticipant], me: &str) -> Vec<Participant> {
    let mut out: Vec<Participant> = Vec::with_capacity(members.len());
    for member in members {
        if out.iter().all(|p| p.id != member.id) {
            out.push(Participant::from_backend(member, me));
        }
    }
    out
}

pub struct ChatModel {
    backend: Arc<dyn ChatBackend>,
    me: UserId,
    table: Mutex<Table>,
}

impl ChatModel {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            me: backend.me(),
            backend,
            table: Mutex::new(Table::default()),
        }
    }

    /// Reverse lookup of an identifier among chats already known.
    pub fn lookup(&self, identifier: &str) -> Option<Chat> {
        let table = self.table.lock();
        let idx = *table.by_identifier.get(&identifier.to_lowercase())?;
        table.chats.get(idx).cloned()
    }

    pub fn lookup_id(&self, chat_id: &str) -> Option<Chat> {
        let table = self.table.lock();
        let idx = *table.by_id.get(chat_id)?;
        table.chats.get(idx).cloned()
    }

    /// Snapshot of every known chat, in the order they were first seen.
    pub fn chats(&self) -> Vec<Chat> {
        self.table.lock().chats.clone()
    }

    /// Merge the backend's chat list into the table. Known chats keep their
    /// identifiers and state.
    pub async fn sync(&self) -> Result<(), BackendError> {
        let listed = self.backend.list_chats().await?;
        let mut table = self.table.lock();
        for chat in &listed {
            table.insert(chat, &self.me);
        }
        Ok(())
    }

    /// Resolve an IRC identifier, consulting the backend if unseen.
    pub async fn resolve(&self, identifier: &str) -> Result<Chat, ResolveError> {
        let chat = match self.lookup(identifier) {
            Some(chat) => chat,
            None => {
                self.sync().await?;
                self.lookup(identifier)
                    .ok_or_else(|| ResolveError::NotFound(identifier.to_string()))?
            }
        };
        self.load_members(chat).await
    }

    /// Resolve a backend chat ID, consulting the backend if unseen.
    pub async fn resolve_by_id(&self, chat_id: &str) -> Result<Chat, ResolveError> {
        let chat = match self.lookup_id(chat_id) {
            Some(chat) => chat,
            None => {
                self.sync().await?;
                self.lookup_id(chat_id)
                    .ok_or_else(|| ResolveError::NotFound(chat_id.to_string()))?
            }
        };
        self.load_members(chat).await
    }

    /// Fetch a group's members the first time it is needed.
    pub async fn load_members(&self, chat: Chat) -> Result<Chat, ResolveError> {
        if chat.members_loaded {
            return Ok(chat);
        }
        self.refresh_participants(&chat.id).await
    }

    /// Register a chat by identifier only, without fetching its members.
    pub fn identify(&self, chat: &BackendChat) -> String {
        let mut table = self.table.lock();
        let idx = table.insert(chat, &self.me);
        table.chats[idx].identifier.clone()
    }

    /// Re-fetch group membership and rebuild the participant list.
    pub async fn refresh_participants(&self, chat_id: &str) -> Result<Chat, ResolveError> {
        let members = self.backend.get_participants(chat_id).await?;
        let mut table = self.table.lock();
        let chat = table
            .get_mut(chat_id)
            .ok_or_else(|| ResolveError::NotFound(chat_id.to_string()))?;
        chat.participants = dedup_participants(&members, &self.me);
        chat.members_loaded = true;
        Ok(chat.clone())
    }

    /// Set the `joined` flag. Returns the previous value.
    pub fn mark_joined(&self, chat_id: &str, joined: bool) -> bool {
        let mut table = self.table.lock();
        match table.get_mut(chat_id) {
            Some(chat) => std::mem::replace(&mut chat.joined, joined),
            None => false,
        }
    }

    /// Add a member. Returns the new participant, or `None` if the chat is
    /// unknown or the user was already present.
    pub fn add_participant(&self, chat_id: &str, member: &BackendParticipant) -> Option<Participant> {
        let mut table = self.table.lock();
        let chat = table.get_mut(chat_id)?;
        if chat.participant_by_id(&member.id).is_some() {
            return None;
        }
        let participant = Participant::from_backend(member, &self.me);
        chat.participants.push(participant.clone());
        Some(participant)
    }

    /// Remove a member. Returns it if it was present.
    pub fn remove_participant(&self, chat_id: &str, user: &str) -> Option<Participant> {
        let mut table = self.table.lock();
        let chat = table.get_mut(chat_id)?;
        let pos = chat.participants.iter().position(|p| p.id == user)?;
        Some(chat.participants.remove(pos))
    }

    /// Update a member's admin flag. Returns it if the flag changed.
    pub fn set_admin(&self, chat_id: &str, user: &str, admin: bool) -> Option<Participant> {
        let mut table = self.table.lock();
        let chat = table.get_mut(chat_id)?;
        let participant = chat.participants.iter_mut().find(|p| p.id == user)?;
        if participant.is_admin == admin {
            return None;
        }
        participant.is_admin = admin;
        Some(participant.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn member(id: &str, name: &str) -> BackendParticipant {
        BackendParticipant {
            id: id.to_string(),
            name: name.to_string(),
            is_admin: false,
        }
    }

    fn backend() -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::new("me@c.us"));
        backend.add_chat(BackendChat {
            id: "g1@g.us".to_string(),
            name: "Group 1".to_string(),
            is_group: true,
            participants: vec![member("me@c.us", "Me"), member("alice@c.us", "Alice")],
        });
        backend.add_chat(BackendChat {
            id: "g2@g.us".to_string(),
            name: "group 1".to_string(),
            is_group: true,
            participants: vec![],
        });
        backend.add_chat(BackendChat {
            id: "alice@c.us".to_string(),
            name: "Alice".to_string(),
            is_group: false,
            participants: vec![],
        });
        backend
    }

    #[tokio::test]
    async fn resolve_is_lazy_and_round_trips() {
        let model = ChatModel::new(backend());
        assert!(model.lookup("#group_1").is_none());

        let chat = model.resolve("#group_1").await.unwrap();
        assert_eq!(chat.id, "g1@g.us");

        for known in model.chats() {
            let again = model.resolve(&known.identifier).await.unwrap();
            assert_eq!(again.id, known.id);
        }
    }

    #[tokio::test]
    async fn colliding_names_get_distinct_identifiers() {
        let model = ChatModel::new(backend());
        model.sync().await.unwrap();
        let chats = model.chats();
        let g1 = chats.iter().find(|c| c.id == "g1@g.us").unwrap();
        let g2 = chats.iter().find(|c| c.id == "g2@g.us").unwrap();
        assert_ne!(g1.identifier, g2.identifier);

        // A second sync must not rename anything.
        model.sync().await.unwrap();
        assert_eq!(model.lookup_id("g2@g.us").unwrap().identifier, g2.identifier);
    }

    #[tokio::test]
    async fn lookup_ignores_case() {
        let model = ChatModel::new(backend());
        model.sync().await.unwrap();
        assert_eq!(model.lookup("#GROUP_1").unwrap().id, "g1@g.us");
        assert_eq!(model.lookup("Alice").unwrap().id, "alice@c.us");
    }

    #[tokio::test]
    async fn unknown_identifier_is_not_found() {
        let model = ChatModel::new(backend());
        let err = model.resolve("#nope").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(_)));
    }

    #[tokio::test]
    async fn backend_failure_is_distinct_from_not_found() {
        let backend = backend();
        backend.fail_next("list_chats", "rate limited");
        let model = ChatModel::new(backend);
        let err = model.resolve("#group_1").await.unwrap_err();
        assert!(matches!(err, ResolveError::Backend(BackendError::Unavailable(_))));
    }

    #[tokio::test]
    async fn refresh_is_idempotent() {
        let backend = backend();
        let model = ChatModel::new(backend.clone());
        let chat = model.resolve("#group_1").await.unwrap();
        for _ in 0..3 {
            model.refresh_participants(&chat.id).await.unwrap();
        }
        let chat = model.lookup_id(&chat.id).unwrap();
        assert_eq!(chat.participants.len(), 2);
        assert!(chat.participants.iter().any(|p| p.is_self));
    }

    #[tokio::test]
    async fn part_keeps_chat_known() {
        let model = ChatModel::new(backend());
        let chat = model.resolve("#group_1").await.unwrap();
        assert!(!model.mark_joined(&chat.id, true));
        assert!(model.mark_joined(&chat.id, false));
        assert!(model.lookup("#group_1").is_some());
    }

    #[tokio::test]
    async fn membership_mutators_report_changes() {
        let model = ChatModel::new(backend());
        let chat = model.resolve("#group_1").await.unwrap();

        assert!(model.add_participant(&chat.id, &member("bob@c.us", "Bob")).is_some());
        assert!(model.add_participant(&chat.id, &member("bob@c.us", "Bob")).is_none());
        assert!(model.set_admin(&chat.id, "bob@c.us", true).is_some());
        assert!(model.set_admin(&chat.id, "bob@c.us", true).is_none());
        assert!(model.remove_participant(&chat.id, "bob@c.us").is_some());
        assert!(model.remove_participant(&chat.id, "bob@c.us").is_none());
    }

    #[tokio::test]
    async fn resolve_loads_members_omitted_from_listing() {
        let backend = backend();
        backend.list_without_members(true);
        let model = ChatModel::new(backend.clone());
        model.sync().await.unwrap();
        let listed = model.lookup("#group_1").unwrap();
        assert!(!listed.members_loaded);
        assert!(listed.participants.is_empty());

        let chat = model.resolve("#group_1").await.unwrap();
        assert!(chat.members_loaded);
        assert_eq!(chat.participant_count(), 2);
        assert_eq!(chat.find_participant("alice").unwrap().id, "alice@c.us");

        let by_id = model.resolve_by_id("g2@g.us").await.unwrap();
        assert!(by_id.members_loaded);

        // Members are fetched once; later lookups do not call the backend.
        backend.fail_next("get_participants", "offline");
        assert_eq!(model.resolve("#group_1").await.unwrap().participant_count(), 2);
    }

    #[tokio::test]
    async fn contact_named_status_stays_addressable() {
        let backend = backend();
        backend.add_chat(BackendChat {
            id: "status@c.us".to_string(),
            name: "Status".to_string(),
            is_group: false,
            participants: vec![],
        });
        let model = ChatModel::new(backend);
        model.sync().await.unwrap();
        let chat = model.lookup_id("status@c.us").unwrap();
        assert_ne!(chat.identifier, ident::STATUS_NICK);
        assert!(model.lookup(ident::STATUS_NICK).is_none());
        assert_eq!(model.resolve(&chat.identifier).await.unwrap().id, "status@c.us");
    }

    #[tokio::test]
    async fn identify_does_not_fetch_members() {
        let model = ChatModel::new(backend());
        let ident = model.identify(&BackendChat {
            id: "g3@g.us".to_string(),
            name: "Other".to_string(),
            is_group: true,
            participants: vec![],
        });
        assert_eq!(ident, "#other");
        assert!(!model.lookup("#other").unwrap().members_loaded);
    }

    #[test]
    fn participant_match_is_case_insensitive_first_wins() {
        let chat = Chat {
            id: "g@g.us".to_string(),
            identifier: "#g".to_string(),
            name: "g".to_string(),
            is_group: true,
            joined: true,
            participants: vec![
                Participant::from_backend(&member("a1@c.us", "Alice"), "me"),
                Participant::from_backend(&member("a2@c.us", "alice"), "me"),
            ],
            members_loaded: true,
        };
        assert_eq!(chat.find_participant("ALICE").unwrap().id, "a1@c.us");
        assert!(chat.find_participant("bob").is_none());
    }

    #[test]
    fn direct_chats_always_count_two() {
        let chat = Chat {
            id: "alice@c.us".to_string(),
            identifier: "alice".to_string(),
            name: "Alice".to_string(),
            is_group: false,
            joined: false,
            participants: vec![],
            members_loaded: true,
        };
        assert_eq!(chat.participant_count(), 2);
    }
}
