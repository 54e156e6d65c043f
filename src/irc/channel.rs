//! Channel state.
//!
//! A channel's membership map records, per member, the anonymous
//! population count most recently announced to that member — the delta
//! memo the presence engine syncs against. Channels are created lazily on
//! first join and kept until process exit.
use std::collections::HashMap;

use super::client::Client;
use super::log::{ChannelLog, LogAction, LogEntry};
use super::modes::{ModeSet, ModeTarget};
use crate::util::{now_nanos, now_unix};

/// The lobby every client joins on registration.
pub const CHANNEL_LOBBY: &str = "#";
/// The server sentinel: server-wide permissions and bans, VIP-only.
pub const CHANNEL_SERVER: &str = "&";

/// Channel names begin with `#` (public) or `&` (privileged).
pub fn valid_channel_prefix(name: &str) -> bool {
    name.starts_with('#') || name.starts_with('&')
}

#[derive(Debug)]
pub struct Channel {
    pub identifier: String,
    pub created: i64,
    pub modes: ModeSet,

    pub topic: String,
    pub topictime: i64,

    /// Member identifier -> anonymous population last announced to them.
    pub clients: HashMap<String, usize>,
    pub log: ChannelLog,
}

impl Channel {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            created: now_unix(),
            modes: ModeSet::new(ModeTarget::Channel),
            topic: String::new(),
            topictime: 0,
            clients: HashMap::new(),
            log: ChannelLog::new(),
        }
    }

    pub fn has_client(&self, client: &str) -> bool {
        self.clients.contains_key(client)
    }

    pub fn real_count(&self) -> usize {
        self.clients.len()
    }

    /// Record an event under the speaker's identifying metadata.
    pub fn log_event(&mut self, client: &Client, action: LogAction, text: &str) {
        self.log.append(LogEntry {
            timestamp: now_nanos(),
            client: client.identifier.clone(),
            iphash: client.iphash.clone(),
            account: client.account,
            action,
            text: text.to_owned(),
        });
    }
}
