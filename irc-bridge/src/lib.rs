//! IRC server front-end for a remote chat backend.
//!
//! Each connected IRC client gets its own session: chats appear as channels
//! (groups) or nicks (direct conversations), and backend events are relayed
//! back as IRC lines.

pub mod backend;
pub mod chat;
pub mod commands;
pub mod config;
pub mod connection;
pub mod ident;
pub mod irc;
pub mod memory;
pub mod msglog;
pub mod relay;
pub mod server;
pub mod session;
