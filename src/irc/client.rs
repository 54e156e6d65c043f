//! Per-connection client state.
//!
//! A client owns the sending half of its bounded outbound queue; a writer
//! task drains the other half onto the socket. Everything identity-bearing
//! (nick, user, host, account, IP hash) lives here so the moderation
//! commands can resolve log tags back to live connections.
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::commands::Permission;
use super::message::Message;
use super::modes::{ModeSet, ModeTarget};
use super::{numeric, SERVER_NAME};
use crate::util::now_unix;

/// Outbound queue depth. A full queue blocks the producer, applying
/// backpressure through to the channel event being processed.
pub const WRITE_QUEUE_DEPTH: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    Normal,
    Terminating,
}

#[derive(Debug)]
pub struct Client {
    pub identifier: String,
    pub created: i64,
    pub state: EntityState,
    pub modes: ModeSet,

    pub ssl: bool,
    /// Requested nickname; `*` until NICK is received.
    pub nick: String,
    pub user: String,
    pub host: String,
    /// Salted digest of the remote address; the raw address is not kept.
    pub iphash: String,
    /// Authenticated account id; 0 while unauthenticated.
    pub account: i64,

    pub cap_host_in_names: bool,

    tx: mpsc::Sender<Message>,
    /// Cancelled exactly once when the client is killed; the reader task
    /// selects on it so server-side kills take effect immediately.
    pub terminate: CancellationToken,
}

impl Client {
    pub fn new(identifier: String, ssl: bool, iphash: String, tx: mpsc::Sender<Message>) -> Self {
        Self {
            identifier,
            created: now_unix(),
            state: EntityState::Normal,
            modes: ModeSet::new(ModeTarget::Client),
            ssl,
            nick: "*".into(),
            user: String::new(),
            host: String::new(),
            iphash,
            account: 0,
            cap_host_in_names: false,
            tx,
            terminate: CancellationToken::new(),
        }
    }

    /// `nick!user@host` as supplied during registration.
    pub fn prefix(&self) -> String {
        format!("{}!{}@{}", self.nick, self.user, self.host)
    }

    /// Registration completes once USER has been received.
    pub fn is_registered(&self) -> bool {
        !self.user.is_empty()
    }

    /// A handle for enqueuing to this client outside the state lock.
    /// Returns None once the client is terminating.
    pub fn sender(&self) -> Option<mpsc::Sender<Message>> {
        if self.state == EntityState::Terminating {
            None
        } else {
            Some(self.tx.clone())
        }
    }

    /// Enqueue a message. Dropped silently once the client is terminating.
    pub async fn write(&self, msg: Message) {
        if self.state == EntityState::Terminating {
            return;
        }
        let _ = self.tx.send(msg).await;
    }

    /// Numeric reply: server prefix, the client's nick as first parameter.
    pub async fn write_numeric(&self, code: &str, params: &[&str]) {
        let mut full = vec![self.nick.clone()];
        full.extend(params.iter().map(|p| (*p).to_owned()));
        self.write(Message::with_prefix(SERVER_NAME, code, full)).await;
    }

    /// `*** notice` as a NOTICE from the server pseudo-nick.
    pub async fn send_notice(&self, notice: &str) {
        self.write(Message::with_prefix(
            SERVER_NAME,
            "NOTICE",
            vec![self.nick.clone(), format!("*** {notice}")],
        ))
        .await;
    }

    /// Plain reply line from the server pseudo-nick.
    pub async fn send_message(&self, text: &str) {
        self.write(Message::with_prefix(
            SERVER_NAME,
            "PRIVMSG",
            vec![self.nick.clone(), text.to_owned()],
        ))
        .await;
    }

    /// `Error! …` reply from the server pseudo-nick.
    pub async fn send_error(&self, text: &str) {
        self.write(Message::with_prefix(
            SERVER_NAME,
            "PRIVMSG",
            vec![self.nick.clone(), format!("Error! {text}")],
        ))
        .await;
    }

    /// Permission denial, with a hint matching the missing rung.
    pub async fn access_denied(&self, required: Permission) {
        self.send_notice("Access denied").await;
        if required == Permission::Registered && self.account == 0 {
            self.send_notice("Use REGISTER or IDENTIFY to authenticate").await;
        } else if required > Permission::Registered {
            self.send_notice(&format!("{} access is required", required.label()))
                .await;
        }
    }

    pub async fn send_password_incorrect(&self) {
        self.write_numeric(numeric::ERR_PASSWDMISMATCH, &["Password incorrect"])
            .await;
    }
}
