//! IRC message parsing and formatting.
//!
//! Covers the RFC 1459 line format the gateway needs: optional IRCv3 tags
//! on inbound lines (parsed and otherwise ignored), prefix, command and
//! parameters, plus CTCP ACTION decoding for PRIVMSG bodies.

use std::collections::HashMap;
use std::fmt;

/// A parsed IRC message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// IRCv3 message tags sent by the client.
    pub tags: HashMap<String, String>,
    /// Optional origin prefix.
    pub prefix: Option<String>,
    /// Upper-cased command or numeric.
    pub command: String,
    /// Parameters; a trailing parameter is stored without its leading colon.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw IRC line. Accepts both CRLF and bare LF terminators.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return None;
        }

        let mut rest = line;

        let tags = if let Some(tagged) = rest.strip_prefix('@') {
            let (tag_str, tail) = tagged.split_once(' ')?;
            rest = tail;
            parse_tags(tag_str)
        } else {
            HashMap::new()
        };

        let prefix = if let Some(prefixed) = rest.strip_prefix(':') {
            let (pfx, tail) = prefixed.split_once(' ')?;
            rest = tail;
            Some(pfx.to_string())
        } else {
            None
        };

        let rest = rest.trim_start_matches(' ');
        let (command, mut rest) = match rest.split_once(' ') {
            Some((command, tail)) => (command, tail),
            None => (rest, ""),
        };
        if command.is_empty() {
            return None;
        }

        let mut params = Vec::new();
        while !rest.is_empty() {
            if let Some(trailing) = rest.strip_prefix(':') {
                params.push(trailing.to_string());
                break;
            }
            match rest.split_once(' ') {
                Some((param, tail)) => {
                    if !param.is_empty() {
                        params.push(param.to_string());
                    }
                    rest = tail;
                }
                None => {
                    params.push(rest.to_string());
                    break;
                }
            }
        }

        Some(Message {
            tags,
            prefix,
            command: command.to_ascii_uppercase(),
            params,
        })
    }

    /// Create a message carrying the given prefix (server name or hostmask).
    pub fn from_server(server: &str, command: &str, params: Vec<&str>) -> Self {
        Message {
            tags: HashMap::new(),
            prefix: Some(server.to_string()),
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        }
    }

    /// Parameter at `index`, if present.
    pub fn param(&self, index: usize) -> Option<&str> {
        self.params.get(index).map(String::as_str)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            let last = i == self.params.len() - 1;
            if last && (param.contains(' ') || param.starts_with(':') || param.is_empty()) {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Parse IRCv3 tag string: `key=value;key2=value2`
fn parse_tags(tag_str: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for pair in tag_str.split(';') {
        if pair.is_empty() {
            continue;
        }
        match pair.split_once('=') {
            Some((key, value)) => tags.insert(key.to_string(), unescape_tag_value(value)),
            None => tags.insert(pair.to_string(), String::new()),
        };
    }
    tags
}

fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            result.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => result.push(';'),
            Some('s') => result.push(' '),
            Some('\\') => result.push('\\'),
            Some('r') => result.push('\r'),
            Some('n') => result.push('\n'),
            Some(other) => result.push(other),
            None => {}
        }
    }
    result
}

/// Extract the payload of a CTCP ACTION (`\x01ACTION text\x01`).
///
/// The closing delimiter is optional, as several clients omit it.
pub fn ctcp_action(text: &str) -> Option<&str> {
    let inner = text.strip_prefix('\x01')?;
    let inner = inner.strip_suffix('\x01').unwrap_or(inner);
    let (tag, payload) = inner.split_once(' ').unwrap_or((inner, ""));
    tag.eq_ignore_ascii_case("ACTION").then_some(payload)
}

// Registration
pub const RPL_WELCOME: &str = "001";
pub const RPL_YOURHOST: &str = "002";
pub const RPL_CREATED: &str = "003";
pub const RPL_MYINFO: &str = "004";

// WHOIS
pub const RPL_WHOISUSER: &str = "311";
pub const RPL_ENDOFWHOIS: &str = "318";
pub const RPL_WHOISCHANNELS: &str = "319";

// WHO / LIST
pub const RPL_ENDOFWHO: &str = "315";
pub const RPL_LIST: &str = "322";
pub const RPL_LISTEND: &str = "323";
pub const RPL_WHOREPLY: &str = "352";

// Channels
pub const RPL_TOPIC: &str = "332";
pub const RPL_INVITING: &str = "341";
pub const RPL_NAMREPLY: &str = "353";
pub const RPL_ENDOFNAMES: &str = "366";

// Errors
pub const ERR_NOSUCHNICK: &str = "401";
pub const ERR_NOSUCHCHANNEL: &str = "403";
pub const ERR_NOTONCHANNEL: &str = "442";
pub const ERR_NOTREGISTERED: &str = "451";
