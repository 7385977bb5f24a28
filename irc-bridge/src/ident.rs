//! Identifier codec: backend names to IRC-safe channel names and nicks.
//!
//! Group chats become `#name` channels, direct chats become bare nicks.
//! Names are lower-cased, whitespace folds to `_`, and anything IRC does not
//! allow in a name is dropped. When two chats sanitize to the same token,
//! the later one gets `_` plus a hex discriminator taken from a SHA-256 of
//! its backend ID.

use sha2::{Digest, Sha256};

/// Characters besides ASCII alphanumerics that IRC allows in nicknames.
const NICK_SPECIALS: &str = "-_[]\\`^{}|";

/// Nick of the gateway's own pseudo-user. No chat may take it.
pub const STATUS_NICK: &str = "status";

/// Shortest discriminator appended on collision, in hex digits.
const MIN_DISCRIMINATOR: usize = 4;

/// Lower-case `name` and strip everything that is not valid in an IRC name.
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if c.is_whitespace() {
            if !out.ends_with('_') {
                out.push('_');
            }
        } else if NICK_SPECIALS.contains(c) {
            out.push(c);
        }
    }
    out.trim_matches('_').to_string()
}

/// Nick-safe form of a contact or participant name.
///
/// Falls back to the user part of `fallback_id` when the name has nothing
/// usable, and prefixes `_` when the result would start with a digit or `-`.
pub fn safe_name(name: &str, fallback_id: &str) -> String {
    let mut nick = sanitize(name);
    if nick.is_empty() {
        nick = sanitize(fallback_id.split('@').next().unwrap_or_default());
    }
    if nick.is_empty() {
        nick = "user".to_string();
    }
    if nick.starts_with(|c: char| c.is_ascii_digit() || c == '-') {
        nick.insert(0, '_');
    }
    nick
}

/// The identifier a chat would get if nothing collided with it.
pub fn base_identifier(chat_id: &str, name: &str, is_group: bool) -> String {
    if is_group {
        let mut channel = sanitize(name);
        if channel.is_empty() {
            channel = sanitize(chat_id.split('@').next().unwrap_or_default());
        }
        if channel.is_empty() {
            channel = "chat".to_string();
        }
        format!("#{channel}")
    } else {
        safe_name(name, chat_id)
    }
}

/// Pick a unique identifier for a chat.
///
/// `taken` reports whether a token already belongs to a different chat in
/// the session. The result depends only on the chat and the taken set, so a
/// caller that caches it gets a stable identifier.
pub fn to_identifier(
    chat_id: &str,
    name: &str,
    is_group: bool,
    taken: impl Fn(&str) -> bool,
) -> String {
    let taken = |token: &str| token == STATUS_NICK || taken(token);
    let base = base_identifier(chat_id, name, is_group);
    if !taken(&base) {
        return base;
    }

    let digest = hex_digest(chat_id);
    for len in MIN_DISCRIMINATOR..=digest.len() {
        let candidate = format!("{base}_{}", &digest[..len]);
        if !taken(&candidate) {
            return candidate;
        }
    }

    // Only reachable if every prefix of the digest is somebody else's name.
    let mut n = 2u64;
    loop {
        let candidate = format!("{base}_{digest}_{n}");
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

fn hex_digest(chat_id: &str) -> String {
    Sha256::digest(chat_id.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn sanitize_strips_and_folds() {
        assert_eq!(sanitize("Family Chat 🎉"), "family_chat");
        assert_eq!(sanitize("  Work   Stuff  "), "work_stuff");
        assert_eq!(sanitize("Dev [ops]|ci"), "dev_[ops]|ci");
        assert_eq!(sanitize("Ünïcode"), "ncode");
        assert_eq!(sanitize("!!!"), "");
    }

    #[test]
    fn group_and_direct_forms() {
        assert_eq!(base_identifier("1203@g.us", "Family", true), "#family");
        assert_eq!(base_identifier("3161@c.us", "Alice Smith", false), "alice_smith");
    }

    #[test]
    fn empty_names_fall_back_to_id() {
        assert_eq!(base_identifier("1203-99@g.us", "🎉🎉", true), "#1203-99");
        assert_eq!(base_identifier("31612345678@c.us", "", false), "_31612345678");
    }

    #[test]
    fn phone_number_nick_gets_prefix() {
        assert_eq!(safe_name("+31 6 1234", "x@c.us"), "_31_6_1234");
        assert_eq!(safe_name("-dash", "x@c.us"), "_-dash");
        assert_eq!(safe_name("bob", "x@c.us"), "bob");
    }

    #[test]
    fn collisions_get_distinct_suffixes() {
        let mut taken: HashSet<String> = HashSet::new();
        let ids = ["a@g.us", "b@g.us", "c@g.us"];
        let mut out = Vec::new();
        for id in ids {
            let ident = to_identifier(id, "Team", true, |t| taken.contains(t));
            taken.insert(ident.clone());
            out.push(ident);
        }
        assert_eq!(out[0], "#team");
        assert!(out[1].starts_with("#team_"));
        assert!(out[2].starts_with("#team_"));
        let unique: HashSet<_> = out.iter().collect();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn status_nick_is_reserved() {
        let ident = to_identifier("x@c.us", "Status", false, |_| false);
        assert_ne!(ident, STATUS_NICK);
        assert!(ident.starts_with("status_"), "got {ident}");
        // Only the bare nick is reserved.
        assert_eq!(to_identifier("g@g.us", "Status", true, |_| false), "#status");
    }

    #[test]
    fn identifier_is_deterministic_for_same_taken_set() {
        let taken = |t: &str| t == "#team";
        let first = to_identifier("b@g.us", "Team", true, taken);
        let second = to_identifier("b@g.us", "Team", true, taken);
        assert_eq!(first, second);
        assert_eq!(first.len(), "#team_".len() + MIN_DISCRIMINATOR);
    }
}
