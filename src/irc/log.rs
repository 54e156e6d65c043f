//! Per-channel event log.
//!
//! Each channel keeps a bounded ring of recent events (joins, parts, topic
//! changes, chat lines) recorded under the speaker's IP hash and account.
//! Every entry carries a derived five-character tag — three digits of
//! 1-based ring position plus the last two decimal digits of the entry's
//! timestamp — which is the only handle moderators ever see. KICK/BAN/KILL
//! map a tag back to (IP hash, account) through [`ChannelLog::reveal_info`].
use std::collections::VecDeque;

use chrono::DateTime;

/// Entries shown per REVEAL page.
pub const CHANNEL_LOGS_PER_PAGE: usize = 25;
/// Ring capacity; keeps the positional part of the tag at three digits.
pub const CHANNEL_LOG_CAPACITY: usize = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Join,
    Part,
    Topic,
    Chat,
}

impl LogAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Join => "JOIN",
            Self::Part => "PART",
            Self::Topic => "TOPIC",
            Self::Chat => "CHAT",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Unix nanoseconds.
    pub timestamp: i64,
    /// Connection identifier of the speaker at the time of the event.
    pub client: String,
    pub iphash: String,
    pub account: i64,
    pub action: LogAction,
    pub text: String,
}

impl LogEntry {
    fn tag(&self, position: usize) -> String {
        format!("{:03}{:02}", position, self.timestamp.rem_euclid(100))
    }

    fn render(&self, position: usize) -> String {
        let secs = self.timestamp / 1_000_000_000;
        let nanos = (self.timestamp % 1_000_000_000) as u32;
        let when = DateTime::from_timestamp(secs, nanos)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();

        let mut line = format!("{} [{}] {}", self.tag(position), when, self.action.as_str());
        if !self.text.is_empty() {
            line.push_str(": ");
            line.push_str(&self.text);
        }
        line
    }
}

/// Append-only ring of recent channel events.
#[derive(Debug, Default)]
pub struct ChannelLog {
    entries: VecDeque<LogEntry>,
}

impl ChannelLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry, evicting the oldest when the ring is full.
    /// Eviction renumbers the remaining entries; tags are only stable
    /// while their entry stays in the ring.
    pub fn append(&mut self, entry: LogEntry) {
        if self.entries.len() >= CHANNEL_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Map a five-character tag back to (IP hash, account id).
    pub fn reveal_info(&self, tag: &str) -> Option<(String, i64)> {
        if tag.len() != 5 {
            return None;
        }

        self.entries
            .iter()
            .enumerate()
            .find(|(i, entry)| entry.tag(i + 1) == tag)
            .map(|(_, entry)| (entry.iphash.clone(), entry.account))
    }

    /// Render a page of log lines, most recent page numbers last.
    /// `page` is 1-based; -1 returns everything. Joins and parts are
    /// filtered unless `show_all` is set.
    pub fn reveal_log(&self, page: i64, show_all: bool) -> Vec<String> {
        let lines: Vec<String> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                show_all || !matches!(entry.action, LogAction::Join | LogAction::Part)
            })
            .map(|(i, entry)| entry.render(i + 1))
            .collect();

        if page == -1 {
            return lines;
        }

        let start = (page.max(1) as usize - 1) * CHANNEL_LOGS_PER_PAGE;
        lines
            .into_iter()
            .skip(start)
            .take(CHANNEL_LOGS_PER_PAGE)
            .collect()
    }
}
