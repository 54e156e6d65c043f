//! Server core — shared state, the presence engine, command dispatch,
//! and the listener/connection lifecycle.
//!
//! Two owning indices hold all live state: the client index and the
//! channel index, both behind one RwLock. Channels reference members by
//! connection identifier only; everything is resolved through the
//! indices at use.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Notify, RwLock};
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::channel::{valid_channel_prefix, Channel, CHANNEL_LOBBY, CHANNEL_SERVER};
use super::client::{Client, EntityState, WRITE_QUEUE_DEPTH};
use super::codec::IrcCodec;
use super::commands::{
    commands_with_usage, required_permission, Permission, COMMAND_AUDIT, COMMAND_BAN,
    COMMAND_DROP, COMMAND_FOUND, COMMAND_GRANT, COMMAND_HELP, COMMAND_IDENTIFY, COMMAND_INFO,
    COMMAND_KICK, COMMAND_KILL, COMMAND_PASSWORD, COMMAND_REGISTER, COMMAND_REHASH,
    COMMAND_REVEAL, COMMAND_STATS, COMMAND_TOKEN, COMMAND_UPGRADE, COMMAND_USERNAME,
    SERVER_COMMANDS,
};
use super::log::LogAction;
use super::message::Message;
use super::modes::{ModeSet, CHANNEL_MODES, CHANNEL_MODES_ARG, CLIENT_MODES};
use super::{anonymous_nick, anonymous_prefix, numeric, ANONYMOUS_NICK, SERVER_NAME};
use crate::config::Config;
use crate::db::{Db, BAN_TYPE_ACCOUNT, BAN_TYPE_ADDRESS};
use crate::narrative::Narrative;
use crate::util::{
    format_action, hash_address, make_token, now_unix, parse_duration, parse_token,
    random_identifier, sort_by_count,
};

const PLAIN_PORT: u16 = 6667;
const SSL_PORT: u16 = 6697;

/// Per-read idle deadline; expiry is treated as disconnection.
const READ_DEADLINE: Duration = Duration::from_secs(300);
/// Interval between server-initiated PINGs.
const PING_INTERVAL: Duration = Duration::from_secs(90);
/// Back-off after a listener failure.
const LISTEN_RETRY: Duration = Duration::from_secs(60);

/// A store error that is not "no rows" means corruption; fail loudly.
fn must<T>(result: rusqlite::Result<T>) -> T {
    result.unwrap_or_else(|err| panic!("database failure: {err}"))
}

/// What the reader loop should do after a message has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Disconnect,
}

/// The two process-wide indices.
#[derive(Debug, Default)]
pub struct ServerState {
    pub clients: HashMap<String, Client>,
    pub channels: HashMap<String, Channel>,
}

impl ServerState {
    pub fn client(&self, id: &str) -> Option<&Client> {
        self.clients.get(id)
    }

    pub fn channel(&self, name: &str) -> Option<&Channel> {
        self.channels.get(name)
    }

    pub fn in_channel(&self, channel: &str, client: &str) -> bool {
        self.channels
            .get(channel)
            .is_some_and(|ch| ch.has_client(client))
    }

    /// The population count `observer` is allowed to see in `channel`:
    /// the real count, or 2 when a count-hiding mode applies.
    pub fn clients_in_channel(&self, channel: &str, observer: &str) -> usize {
        let Some(ch) = self.channels.get(channel) else {
            return 0;
        };

        let real = ch.real_count();
        let hide = ch.modes.has('c')
            || self
                .clients
                .get(observer)
                .is_some_and(|c| c.modes.has('c'));

        if hide && real >= 2 {
            2
        } else {
            real
        }
    }

    /// Names of every channel the client is a member of.
    pub fn channels_of(&self, client: &str) -> Vec<String> {
        self.channels
            .iter()
            .filter(|(_, ch)| ch.has_client(client))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

pub struct Server {
    pub state: RwLock<ServerState>,
    pub config: RwLock<Config>,
    config_path: PathBuf,
    pub db: Db,
    pub created: i64,
    narrative: RwLock<Narrative>,
    restart_plain: Notify,
    restart_ssl: Notify,
}

impl Server {
    pub fn new(config: Config, config_path: PathBuf, db: Db) -> Arc<Self> {
        Arc::new(Self {
            narrative: RwLock::new(Narrative::new(&config.narrative)),
            state: RwLock::new(ServerState::default()),
            config: RwLock::new(config),
            config_path,
            db,
            created: now_unix(),
            restart_plain: Notify::new(),
            restart_ssl: Notify::new(),
        })
    }

    // ── Permissions ──────────────────────────────────────────────

    /// Permission held server-wide: the account's permission on `&`.
    pub fn global_permission(&self, client: &Client) -> Permission {
        must(self.db.get_permission(client.account, CHANNEL_SERVER))
    }

    /// Effective permission on a channel: the larger of the global and
    /// the per-channel grant.
    pub fn permission_on(&self, client: &Client, channel: &str) -> Permission {
        self.global_permission(client)
            .max(must(self.db.get_permission(client.account, channel)))
    }

    /// Whether a client may use a command. Server-only commands check
    /// server-wide permission; others check the channel argument when
    /// one is present.
    pub fn can_use(&self, client: &Client, command: &str, channel_arg: &str) -> bool {
        let required = required_permission(command);
        if required == Permission::Client {
            return true;
        }

        let command = command.to_uppercase();
        let held = if SERVER_COMMANDS.contains(&command.as_str())
            || !valid_channel_prefix(channel_arg)
        {
            self.global_permission(client)
        } else {
            self.permission_on(client, channel_arg)
        };

        held >= required
    }

    // ── Presence engine ──────────────────────────────────────────

    /// Sync every member's observed anonymous population to its current
    /// effective count by synthesizing phantom JOIN/PART traffic.
    ///
    /// Phantom slots are numbered from the observer's point of view:
    /// the observer itself is slot 1, so phantoms are Anonymous2..N.
    /// With channel mode `D` and an explicit trigger, the triggering
    /// client is skipped (its own event already carried its real
    /// prefix). The part reason rides on the first phantom PART only.
    async fn update_client_count_in(
        &self,
        st: &mut ServerState,
        channel: &str,
        trigger: Option<&str>,
        reason: &str,
    ) {
        let Some(ch) = st.channels.get(channel) else {
            return;
        };
        let skip_trigger = ch.modes.has('D');
        let members: Vec<(String, usize)> =
            ch.clients.iter().map(|(k, v)| (k.clone(), *v)).collect();

        struct CountSync {
            member: String,
            observed: usize,
            target: usize,
            tx: mpsc::Sender<Message>,
        }

        let mut plans = Vec::new();
        for (member, observed) in members {
            if skip_trigger && trigger == Some(member.as_str()) {
                continue;
            }

            let target = st.clients_in_channel(channel, &member);
            if target == observed {
                continue;
            }

            let Some(tx) = st.clients.get(&member).and_then(Client::sender) else {
                continue;
            };
            plans.push(CountSync {
                member,
                observed,
                target,
                tx,
            });
        }

        for plan in &plans {
            if plan.target > plan.observed {
                for slot in plan.observed + 1..=plan.target {
                    let _ = plan
                        .tx
                        .send(Message::with_prefix(
                            anonymous_prefix(slot),
                            "JOIN",
                            vec![channel.to_owned()],
                        ))
                        .await;
                }
            } else {
                let mut first = true;
                for slot in (plan.target + 1..=plan.observed).rev() {
                    let part_reason = if first { reason } else { "" };
                    first = false;
                    let _ = plan
                        .tx
                        .send(Message::with_prefix(
                            anonymous_prefix(slot),
                            "PART",
                            vec![channel.to_owned(), part_reason.to_owned()],
                        ))
                        .await;
                }
            }
        }

        if let Some(ch) = st.channels.get_mut(channel) {
            for plan in plans {
                ch.clients.insert(plan.member, plan.target);
            }
        }
    }

    /// NAMES for one member: its own prefix, then Anonymous2..N.
    async fn send_names_in(&self, st: &ServerState, channel: &str, client: &str) {
        if !st.in_channel(channel, client) {
            return;
        }
        let Some(cl) = st.clients.get(client) else {
            return;
        };

        let mut names = vec![if cl.cap_host_in_names {
            cl.prefix()
        } else {
            cl.nick.clone()
        }];

        let count = st.clients_in_channel(channel, client);
        for slot in 2..=count {
            names.push(if cl.cap_host_in_names {
                anonymous_prefix(slot)
            } else {
                anonymous_nick(slot)
            });
        }

        cl.write_numeric(numeric::RPL_NAMREPLY, &["=", channel, &names.join(" ")])
            .await;
        cl.write_numeric(numeric::RPL_ENDOFNAMES, &[channel, "End of /NAMES list."])
            .await;
    }

    /// Replay the topic to one member. Topic changes are broadcast as
    /// TOPIC from the anonymous prefix; replays use 332/333.
    async fn send_topic_in(&self, st: &ServerState, channel: &str, client: &str, changed: bool) {
        if !st.in_channel(channel, client) {
            return;
        }
        let (Some(ch), Some(cl)) = (st.channels.get(channel), st.clients.get(client)) else {
            return;
        };
        if ch.topic.is_empty() {
            return;
        }

        if changed {
            cl.write(Message::with_prefix(
                anonymous_prefix(1),
                "TOPIC",
                vec![channel.to_owned(), ch.topic.clone()],
            ))
            .await;
        } else {
            cl.write_numeric(numeric::RPL_TOPIC, &[channel, &ch.topic]).await;
            cl.write_numeric(
                numeric::RPL_TOPICWHOTIME,
                &[channel, ANONYMOUS_NICK, &ch.topictime.to_string()],
            )
            .await;
        }
    }

    // ── Channel membership ───────────────────────────────────────

    async fn join_channel_in(
        &self,
        st: &mut ServerState,
        channel: &str,
        client: &str,
        key: Option<&str>,
    ) {
        if channel.is_empty() || st.in_channel(channel, client) {
            return;
        }
        if !st.clients.contains_key(client) {
            return;
        }

        // `&…` is privileged; anything else must be `#…`.
        if channel.starts_with('&') {
            let cl = st.clients.get(client).unwrap();
            if self.global_permission(cl) < Permission::Vip {
                cl.access_denied(Permission::Vip).await;
                return;
            }
        } else if !channel.starts_with('#') {
            return;
        }

        // Create lazily, seeding the topic for registered channels.
        if !st.channels.contains_key(channel) {
            let mut ch = Channel::new(channel);
            if let Some(row) = must(self.db.channel(channel)) {
                ch.topic = row.topic;
                ch.topictime = row.topictime;
            }
            st.channels.insert(channel.to_owned(), ch);
        }

        {
            let cl = st.clients.get(client).unwrap();
            let ch = st.channels.get(channel).unwrap();

            if let Some(reason) = must(self.db.find_ban(channel, &cl.iphash, cl.account)) {
                let ex = if reason.is_empty() {
                    String::new()
                } else {
                    format!(". Reason: {reason}")
                };
                cl.send_notice(&format!("Unable to join {channel}: You are banned{ex}"))
                    .await;
                return;
            }

            if ch.modes.has('z') && !cl.ssl {
                cl.send_notice(&format!(
                    "Unable to join {channel}: SSL connections only (channel mode +z)"
                ))
                .await;
                return;
            }

            let permission = self.permission_on(cl, channel);
            if permission < Permission::Vip {
                if let Some(required_key) = ch.modes.get('k') {
                    if !required_key.is_empty() && key != Some(required_key) {
                        cl.send_notice(&format!(
                            "Unable to join {channel}: Invalid channel key (+k)"
                        ))
                        .await;
                        return;
                    }
                }
                if let Some(limit) = ch.modes.get('l').and_then(|l| l.parse::<usize>().ok()) {
                    if ch.real_count() >= limit {
                        cl.send_notice(&format!(
                            "Unable to join {channel}: Channel is limited, try again later"
                        ))
                        .await;
                        return;
                    }
                }
            }
            if ch.modes.has('r') && permission < Permission::Registered {
                cl.access_denied(Permission::Registered).await;
                return;
            }
            if ch.modes.has('i') && permission < Permission::Vip {
                cl.access_denied(Permission::Vip).await;
                return;
            }
        }

        // Join, seeding the observed count to the joiner's own effective
        // count so the sync below emits nothing to it.
        st.channels
            .get_mut(channel)
            .unwrap()
            .clients
            .insert(client.to_owned(), 0);
        let seed = st.clients_in_channel(channel, client);

        {
            let ServerState { clients, channels } = &mut *st;
            let ch = channels.get_mut(channel).unwrap();
            let cl = clients.get(client).unwrap();
            ch.clients.insert(client.to_owned(), seed);
            cl.write(Message::with_prefix(
                cl.prefix(),
                "JOIN",
                vec![channel.to_owned()],
            ))
            .await;
            ch.log_event(cl, LogAction::Join, "");
        }

        self.send_names_in(st, channel, client).await;
        self.send_topic_in(st, channel, client, false).await;
        self.update_client_count_in(st, channel, Some(client), "").await;
    }

    async fn part_channel_in(
        &self,
        st: &mut ServerState,
        channel: &str,
        client: &str,
        reason: &str,
    ) {
        if !st.in_channel(channel, client) {
            return;
        }

        {
            let ServerState { clients, channels } = &mut *st;
            let (Some(ch), Some(cl)) = (channels.get_mut(channel), clients.get(client)) else {
                return;
            };
            cl.write(Message::with_prefix(
                cl.prefix(),
                "PART",
                vec![channel.to_owned(), reason.to_owned()],
            ))
            .await;
            ch.log_event(cl, LogAction::Part, reason);
            ch.clients.remove(client);
        }

        self.update_client_count_in(st, channel, Some(client), reason).await;
        // Empty channels persist until process exit.
    }

    async fn part_all_channels_in(&self, st: &mut ServerState, client: &str, reason: &str) {
        for channel in st.channels_of(client) {
            self.part_channel_in(st, &channel, client, reason).await;
        }
    }

    /// Terminate a client: cancel its reader, flush its queue, drop it
    /// from the index. Idempotent.
    async fn kill_client_in(&self, st: &mut ServerState, client: &str) {
        {
            let Some(cl) = st.clients.get_mut(client) else {
                return;
            };
            if cl.state == EntityState::Terminating {
                return;
            }
            cl.state = EntityState::Terminating;
            cl.terminate.cancel();
        }

        self.part_all_channels_in(st, client, "").await;
        st.clients.remove(client);
    }

    // ── Messages ─────────────────────────────────────────────────

    async fn handle_privmsg_in(&self, st: &mut ServerState, client: &str, target: &str, text: &str) {
        // The pseudo-nick is the administrative command channel; its
        // message text is tokenized exactly like a raw command line.
        if target.eq_ignore_ascii_case(SERVER_NAME) {
            let mut words = text.split_whitespace();
            if let Some(verb) = words.next() {
                let params: Vec<String> = words.map(str::to_owned).collect();
                self.handle_user_command_in(st, client, verb, &params).await;
            }
            return;
        }

        if target.is_empty() || !valid_channel_prefix(target) {
            return;
        }
        if !st.in_channel(target, client) {
            if let Some(cl) = st.clients.get(client) {
                cl.write_numeric(
                    numeric::ERR_CANNOTSENDTOCHAN,
                    &[target, "Cannot send to channel"],
                )
                .await;
            }
            return;
        }

        // Bring every observer's count up to date before delivery.
        self.update_client_count_in(st, target, None, "").await;

        let recipients: Vec<mpsc::Sender<Message>> = st
            .channels
            .get(target)
            .map(|ch| {
                ch.clients
                    .keys()
                    .filter(|member| member.as_str() != client)
                    .filter_map(|member| st.clients.get(member).and_then(Client::sender))
                    .collect()
            })
            .unwrap_or_default();

        // The sender gets no echo; everyone else hears plain Anonymous.
        for tx in recipients {
            let _ = tx
                .send(Message::with_prefix(
                    anonymous_prefix(1),
                    "PRIVMSG",
                    vec![target.to_owned(), text.to_owned()],
                ))
                .await;
        }

        let ServerState { clients, channels } = &mut *st;
        if let (Some(ch), Some(cl)) = (channels.get_mut(target), clients.get(client)) {
            ch.log_event(cl, LogAction::Chat, text);
        }
    }

    async fn handle_topic_in(&self, st: &mut ServerState, channel: &str, client: &str, topic: &str) {
        if !st.in_channel(channel, client) {
            if let Some(cl) = st.clients.get(client) {
                cl.send_notice("Invalid use of TOPIC").await;
            }
            return;
        }

        {
            let (Some(ch), Some(cl)) = (st.channels.get(channel), st.clients.get(client)) else {
                return;
            };
            if ch.modes.has('t') && self.permission_on(cl, channel) < Permission::Vip {
                cl.access_denied(Permission::Vip).await;
                return;
            }
        }

        let topictime = now_unix();
        {
            let ch = st.channels.get_mut(channel).unwrap();
            ch.topic = topic.to_owned();
            ch.topictime = topictime;
        }
        if must(self.db.channel(channel)).is_some() {
            must(self.db.set_topic(channel, topic, topictime));
        }

        let members: Vec<String> = st
            .channels
            .get(channel)
            .map(|ch| ch.clients.keys().cloned().collect())
            .unwrap_or_default();
        for member in members {
            self.send_topic_in(st, channel, &member, true).await;
        }

        let ServerState { clients, channels } = &mut *st;
        if let (Some(ch), Some(cl)) = (channels.get_mut(channel), clients.get(client)) {
            let text = ch.topic.clone();
            ch.log_event(cl, LogAction::Topic, &text);
        }
    }

    /// Part every member a newly set mode excludes (`z` -> non-TLS).
    async fn enforce_modes_in(&self, st: &mut ServerState, channel: &str) {
        let enforce_ssl = st
            .channels
            .get(channel)
            .is_some_and(|ch| ch.modes.has('z'));
        if !enforce_ssl {
            return;
        }

        let plain_members: Vec<String> = st
            .channels
            .get(channel)
            .map(|ch| {
                ch.clients
                    .keys()
                    .filter(|member| {
                        st.clients.get(*member).is_some_and(|cl| !cl.ssl)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        for member in plain_members {
            self.part_channel_in(
                st,
                channel,
                &member,
                &format!("You must connect via SSL to join {channel}"),
            )
            .await;
        }
    }

    async fn handle_mode_in(&self, st: &mut ServerState, client: &str, params: &[String]) {
        if params.is_empty() || params[0].is_empty() {
            if let Some(cl) = st.clients.get(client) {
                cl.send_notice("Invalid use of MODE").await;
            }
            return;
        }

        let target = params[0].clone();
        if valid_channel_prefix(&target) {
            if !st.channels.contains_key(&target) {
                return;
            }

            if params.len() == 1 || params[1].is_empty() {
                let (Some(ch), Some(cl)) = (st.channels.get(&target), st.clients.get(client))
                else {
                    return;
                };
                cl.write_numeric(
                    numeric::RPL_CHANNELMODEIS,
                    &[&target, &ch.modes.print_current()],
                )
                .await;
                cl.write_numeric(numeric::RPL_CREATIONTIME, &[&target, &ch.created.to_string()])
                    .await;
                return;
            }

            let modestr = params[1].clone();
            let Some(sign) = modestr.chars().next().filter(|c| *c == '+' || *c == '-') else {
                return;
            };

            {
                let cl = st.clients.get(client).unwrap();
                if !self.can_use(cl, "MODE", &target) {
                    cl.access_denied(required_permission("MODE")).await;
                    return;
                }
            }

            let before = st.channels.get(&target).unwrap().modes.snapshot();
            {
                let ch = st.channels.get_mut(&target).unwrap();
                if sign == '+' {
                    let mut args = vec![modestr[1..].to_owned()];
                    args.extend(params.iter().skip(2).cloned());
                    ch.modes.add_modes(&args);
                } else {
                    ch.modes.remove_modes(&modestr[1..]);
                }
            }

            self.enforce_modes_in(st, &target).await;

            let (added, removed) = st.channels.get(&target).unwrap().modes.diff(&before);
            if added.is_empty() && removed.is_empty() {
                return;
            }

            let resend_count = added.contains_key(&'c')
                || removed.contains_key(&'c')
                || removed.contains_key(&'D');
            let printed = ModeSet::print(&added, &removed);

            let recipients: Vec<mpsc::Sender<Message>> = st
                .channels
                .get(&target)
                .map(|ch| {
                    ch.clients
                        .keys()
                        .filter_map(|member| st.clients.get(member).and_then(Client::sender))
                        .collect()
                })
                .unwrap_or_default();
            for tx in recipients {
                let _ = tx
                    .send(Message::with_prefix(
                        anonymous_prefix(1),
                        "MODE",
                        vec![target.clone(), printed.clone()],
                    ))
                    .await;
            }

            if resend_count {
                self.update_client_count_in(st, &target, Some(client), "Enforcing MODEs")
                    .await;
            }
        } else {
            // User modes apply to the caller only.
            if params.len() == 1 || params[1].is_empty() {
                if let Some(cl) = st.clients.get(client) {
                    cl.write_numeric(numeric::RPL_UMODEIS, &[&cl.modes.print_current()])
                        .await;
                }
                return;
            }

            let modestr = params[1].clone();
            let Some(sign) = modestr.chars().next().filter(|c| *c == '+' || *c == '-') else {
                return;
            };

            let before = st.clients.get(client).unwrap().modes.snapshot();
            {
                let cl = st.clients.get_mut(client).unwrap();
                if sign == '+' {
                    cl.modes.add_modes(&[modestr[1..].to_owned()]);
                } else {
                    cl.modes.remove_modes(&modestr[1..]);
                }
            }

            let cl = st.clients.get(client).unwrap();
            let (added, removed) = cl.modes.diff(&before);
            if added.is_empty() && removed.is_empty() {
                return;
            }

            let resend_count = added.contains_key(&'c')
                || removed.contains_key(&'c')
                || removed.contains_key(&'D');
            let printed = ModeSet::print(&added, &removed);
            let nick = cl.nick.clone();
            cl.write(Message::with_prefix(
                SERVER_NAME,
                "MODE",
                vec![nick, printed],
            ))
            .await;

            if resend_count {
                for channel in st.channels_of(client) {
                    self.update_client_count_in(st, &channel, Some(client), "Enforcing MODEs")
                        .await;
                }
            }
        }
    }

    // ── Administrative commands ──────────────────────────────────

    /// Resolve a log tag to a live connection via (IP hash, account).
    fn reveal_client_in(&self, st: &ServerState, channel: &str, tag: &str) -> Option<String> {
        let (iphash, account) = st.channels.get(channel)?.log.reveal_info(tag)?;
        st.clients
            .values()
            .find(|cl| cl.iphash == iphash || (cl.account > 0 && cl.account == account))
            .map(|cl| cl.identifier.clone())
    }

    /// Insert ban rows for the revealed target and enforce them against
    /// live connections: part from the channel, or kill server-wide.
    async fn ban_in(
        &self,
        st: &mut ServerState,
        channel: &str,
        iphash: &str,
        account: i64,
        expires: i64,
        reason: &str,
    ) {
        if !iphash.is_empty() {
            must(self.db.add_ban(channel, BAN_TYPE_ADDRESS, iphash, expires, reason));
        }
        if account > 0 {
            must(self.db.add_ban(
                channel,
                BAN_TYPE_ACCOUNT,
                &account.to_string(),
                expires,
                reason,
            ));
        }

        let server_wide = channel == CHANNEL_SERVER;
        let matches = |cl: &Client| {
            (!iphash.is_empty() && cl.iphash == iphash)
                || (account > 0 && cl.account == account)
        };

        let targets: Vec<String> = if server_wide {
            st.clients
                .values()
                .filter(|cl| matches(cl))
                .map(|cl| cl.identifier.clone())
                .collect()
        } else {
            st.channels
                .get(channel)
                .map(|ch| {
                    ch.clients
                        .keys()
                        .filter(|member| st.clients.get(*member).is_some_and(|cl| matches(cl)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default()
        };

        for target in targets {
            if server_wide {
                self.part_all_channels_in(st, &target, &format_action("Killed", reason))
                    .await;
                self.kill_client_in(st, &target).await;
            } else {
                self.part_channel_in(st, channel, &target, &format_action("Banned", reason))
                    .await;
            }
        }
    }

    /// Usage lines for every command the caller may use.
    async fn send_usage_in(&self, st: &ServerState, client: &str, command: &str) {
        let Some(cl) = st.clients.get(client) else {
            return;
        };
        let command = command.to_uppercase();

        for (cmd, usage) in commands_with_usage() {
            if command != COMMAND_HELP && cmd != command {
                continue;
            }
            if !self.can_use(cl, cmd, "") {
                continue;
            }

            cl.send_message(&format!("{cmd} {}", usage[0])).await;
            for line in &usage[1..] {
                cl.send_message(&format!("  {line}")).await;
            }
        }
    }

    fn identify_in(&self, st: &mut ServerState, client: &str, username: &str, password: &str) -> bool {
        let account = must(self.db.auth(username, password));
        if account == 0 {
            return false;
        }
        if let Some(cl) = st.clients.get_mut(client) {
            cl.account = account;
        }
        true
    }

    async fn handle_user_command_in(
        &self,
        st: &mut ServerState,
        client: &str,
        command: &str,
        params: &[String],
    ) {
        let command = command.to_uppercase();
        let channel_arg = params.first().map(String::as_str).unwrap_or("");

        {
            let Some(cl) = st.clients.get(client) else {
                return;
            };
            if !self.can_use(cl, &command, channel_arg) {
                cl.access_denied(required_permission(&command)).await;
                return;
            }
        }

        match command.as_str() {
            COMMAND_HELP => {
                let topic = params.first().map(String::as_str).unwrap_or(COMMAND_HELP);
                self.send_usage_in(st, client, topic).await;
            }

            COMMAND_INFO => {
                let cl = st.clients.get(client).unwrap();
                if let Some(channel) = params.first() {
                    if must(self.db.channel(channel)).is_some() {
                        cl.send_message(&format!("{channel} is a registered channel")).await;
                    } else {
                        cl.send_message(&format!("{channel} is not registered")).await;
                    }
                } else {
                    cl.send_message("Server info: anonircd, an anonymous IRC daemon").await;
                }
            }

            COMMAND_REGISTER => {
                if params.len() < 2 {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let (username, password) = (params[0].clone(), params[1].clone());
                let cl = st.clients.get(client).unwrap();
                if username.is_empty() || !username.chars().all(|c| c.is_ascii_alphanumeric()) {
                    cl.send_error("Unable to register, username must be alphanumeric").await;
                    return;
                }
                if !must(self.db.add_account(&username, &password)) {
                    cl.send_error("Unable to register, username already exists").await;
                    return;
                }
                self.identify_in(st, client, &username, &password);
                let cl = st.clients.get(client).unwrap();
                cl.send_notice("Registered successfully").await;
            }

            COMMAND_IDENTIFY => {
                if params.is_empty() || params.len() > 2 {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }

                let nick = st.clients.get(client).unwrap().nick.clone();
                let (username, password) = if params.len() == 2 {
                    (params[0].clone(), params[1].clone())
                } else {
                    (nick, params[0].clone())
                };

                if !self.identify_in(st, client, &username, &password) {
                    let cl = st.clients.get(client).unwrap();
                    cl.send_notice("Failed to identify, incorrect username/password").await;
                    return;
                }

                {
                    let cl = st.clients.get(client).unwrap();
                    cl.send_notice("Identified successfully").await;
                }

                let vip = {
                    let cl = st.clients.get(client).unwrap();
                    self.global_permission(cl) >= Permission::Vip
                };
                if vip {
                    self.join_channel_in(st, CHANNEL_SERVER, client, None).await;
                }

                // Account bans may now apply where address bans did not.
                let (iphash, account) = {
                    let cl = st.clients.get(client).unwrap();
                    (cl.iphash.clone(), cl.account)
                };
                for channel in st.channels_of(client) {
                    if let Some(reason) = must(self.db.find_ban(&channel, &iphash, account)) {
                        self.part_channel_in(
                            st,
                            &channel,
                            client,
                            &format_action("Banned", &reason),
                        )
                        .await;
                    }
                }
            }

            COMMAND_TOKEN => {
                if params.is_empty() {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let channel = &params[0];
                let cl = st.clients.get(client).unwrap();
                if must(self.db.channel(channel)).is_none() {
                    cl.send_error("Unable to generate token, channel is not registered").await;
                    return;
                }
                let salt = self.config.read().await.salt.clone();
                let token = make_token(&salt, cl.account, channel);
                cl.send_message(&token).await;
            }

            COMMAND_USERNAME => {
                if params.len() < 4 {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let cl = st.clients.get(client).unwrap();
                if params[2] != params[3] {
                    cl.send_error("Unable to change username, new usernames don't match").await;
                    return;
                }
                if !params[2].chars().all(|c| c.is_ascii_alphanumeric()) {
                    cl.send_error("Unable to change username, new username must be alphanumeric")
                        .await;
                    return;
                }
                let account = must(self.db.auth(&params[0], &params[1]));
                if account == 0 {
                    cl.send_error("Unable to change username, incorrect username/password supplied")
                        .await;
                    return;
                }
                if !must(self.db.set_username(account, &params[2], &params[1])) {
                    cl.send_error("Unable to change username, new username already exists").await;
                    return;
                }
                cl.send_message("Username changed successfully").await;
            }

            COMMAND_PASSWORD => {
                if params.len() < 4 {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let cl = st.clients.get(client).unwrap();
                if params[2] != params[3] {
                    cl.send_error("Unable to change password, new passwords don't match").await;
                    return;
                }
                let account = must(self.db.auth(&params[0], &params[1]));
                if account == 0 {
                    cl.send_error("Unable to change password, incorrect username/password supplied")
                        .await;
                    return;
                }
                must(self.db.set_password(account, &params[0], &params[2]));
                cl.send_message("Password changed successfully").await;
            }

            COMMAND_FOUND => {
                if params.is_empty() {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let channel = &params[0];
                let cl = st.clients.get(client).unwrap();
                if !valid_channel_prefix(channel) {
                    cl.send_error("Unable to found, invalid channel specified").await;
                    return;
                }
                if !must(self.db.add_channel(cl.account, channel, "")) {
                    cl.send_error("Unable to found, channel is already registered").await;
                    return;
                }
                cl.send_message(&format!("Founded {channel}")).await;
            }

            COMMAND_DROP => {
                if params.len() < 2 {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let cl = st.clients.get(client).unwrap();
                if params[0] != params[1] {
                    cl.send_error("Unable to drop, channel names don't match").await;
                    return;
                }
                if must(self.db.channel(&params[0])).is_none() {
                    cl.send_error("Unable to drop, channel is not registered").await;
                    return;
                }
                must(self.db.drop_channel(&params[0]));
                cl.send_message(&format!("Dropped {}", params[0])).await;
            }

            COMMAND_GRANT => {
                if params.is_empty() {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let channel = &params[0];
                let cl = st.clients.get(client).unwrap();
                if must(self.db.channel(channel)).is_none() {
                    cl.send_error("Unable to grant, channel is not registered").await;
                    return;
                }

                if params.len() == 1 {
                    let grants = must(self.db.list_permissions(channel));
                    if grants.is_empty() {
                        cl.send_message("No permissions set").await;
                    }
                    for (account, permission) in grants {
                        cl.send_message(&format!("Account {account}: {}", permission.label()))
                            .await;
                    }
                    return;
                }

                let salt = self.config.read().await.salt.clone();
                let Some(account) = parse_token(&salt, channel, &params[1]) else {
                    cl.send_error("Unable to grant, invalid account token").await;
                    return;
                };

                if params.len() == 2 {
                    let permission = must(self.db.get_permission(account, channel));
                    cl.send_message(&format!("Account access: {}", permission.label())).await;
                    return;
                }

                let Some(permission) = Permission::parse(&params[2]) else {
                    cl.send_error("Unable to grant, invalid access level").await;
                    return;
                };
                must(self.db.set_permission(account, channel, permission));
                cl.send_message(&format!("Access updated to {}", permission.label())).await;
            }

            COMMAND_REVEAL => {
                if params.is_empty() {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let cl = st.clients.get(client).unwrap();
                let Some(ch) = st.channels.get(&params[0]) else {
                    cl.send_error("Unable to reveal, invalid channel specified").await;
                    return;
                };

                let page = match params.get(1).map(String::as_str) {
                    None => 1,
                    Some("all") => -1,
                    Some(raw) => match raw.parse::<i64>() {
                        Ok(page) if page == -1 || page > 0 => page,
                        _ => {
                            cl.send_error("Unable to reveal, invalid page specified").await;
                            return;
                        }
                    },
                };
                let full = params
                    .get(2)
                    .is_some_and(|p| p.eq_ignore_ascii_case("full") || p.eq_ignore_ascii_case("all"));

                for line in ch.log.reveal_log(page, full) {
                    cl.send_message(&line).await;
                }
            }

            COMMAND_AUDIT => {
                if params.is_empty() {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let cl = st.clients.get(client).unwrap();
                let Some(ch) = st.channels.get(&params[0]) else {
                    cl.send_error("Unable to audit, invalid channel specified").await;
                    return;
                };
                let page = match params.get(1).map(String::as_str) {
                    None => 1,
                    Some("all") => -1,
                    Some(raw) => match raw.parse::<i64>() {
                        Ok(page) if page == -1 || page > 0 => page,
                        _ => {
                            cl.send_error("Unable to audit, invalid page specified").await;
                            return;
                        }
                    },
                };
                for line in ch.log.reveal_log(page, true) {
                    cl.send_message(&line).await;
                }
            }

            COMMAND_KICK => {
                if params.len() < 2 {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                if !st.channels.contains_key(&params[0]) {
                    let cl = st.clients.get(client).unwrap();
                    cl.send_error("Unable to kick, invalid channel specified").await;
                    return;
                }
                let Some(target) = self.reveal_client_in(st, &params[0], &params[1]) else {
                    let cl = st.clients.get(client).unwrap();
                    cl.send_error("Unable to kick, client not found or no longer connected")
                        .await;
                    return;
                };

                let reason = format_action("Kicked", &params[2..].join(" "));
                self.part_channel_in(st, &params[0], &target, &reason).await;
                let cl = st.clients.get(client).unwrap();
                cl.send_message(&format!("Kicked {} {}", params[0], params[1])).await;
            }

            COMMAND_BAN => {
                if params.len() < 3 {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let duration = parse_duration(&params[2]);
                if duration < 0 {
                    let cl = st.clients.get(client).unwrap();
                    cl.send_error("Unable to ban, invalid duration supplied").await;
                    return;
                }
                let Some((iphash, account)) = st
                    .channels
                    .get(&params[0])
                    .and_then(|ch| ch.log.reveal_info(&params[1]))
                else {
                    let cl = st.clients.get(client).unwrap();
                    cl.send_error("Unable to ban, log entry not found").await;
                    return;
                };

                let expires = if duration == 0 { 0 } else { now_unix() + duration };
                let reason = params[3..].join(" ");
                self.ban_in(st, &params[0], &iphash, account, expires, &reason).await;
                if let Some(cl) = st.clients.get(client) {
                    cl.send_message(&format!("Banned {} {}", params[0], params[1])).await;
                }
            }

            COMMAND_KILL => {
                if params.len() < 3 {
                    self.send_usage_in(st, client, &command).await;
                    return;
                }
                let duration = parse_duration(&params[2]);
                if duration < 0 {
                    let cl = st.clients.get(client).unwrap();
                    cl.send_error("Unable to kill, invalid duration supplied").await;
                    return;
                }
                let Some((iphash, account)) = st
                    .channels
                    .get(&params[0])
                    .and_then(|ch| ch.log.reveal_info(&params[1]))
                else {
                    let cl = st.clients.get(client).unwrap();
                    cl.send_error("Unable to kill, log entry not found").await;
                    return;
                };

                let expires = if duration == 0 { 0 } else { now_unix() + duration };
                let reason = params[3..].join(" ");
                self.ban_in(st, CHANNEL_SERVER, &iphash, account, expires, &reason).await;
                if let Some(cl) = st.clients.get(client) {
                    cl.send_message(&format!("Killed {} {}", params[0], params[1])).await;
                }
            }

            COMMAND_STATS => {
                let cl = st.clients.get(client).unwrap();
                cl.send_message(&format!(
                    "{} clients in {} channels",
                    st.clients.len(),
                    st.channels.len()
                ))
                .await;
            }

            COMMAND_REHASH => {
                let result = self.reload().await;
                let cl = st.clients.get(client).unwrap();
                match result {
                    Ok(()) => cl.send_message("Reloaded configuration").await,
                    Err(err) => cl.send_error(&format!("{err:#}")).await,
                }
            }

            COMMAND_UPGRADE => {
                // Re-reads configuration and cycles the listeners without
                // touching established connections; swapping the binary is
                // the supervisor's job.
                let result = self.reload().await;
                let cl = st.clients.get(client).unwrap();
                match result {
                    Ok(()) => {
                        cl.send_message("Upgraded: configuration reloaded and listeners cycled")
                            .await;
                    }
                    Err(err) => cl.send_error(&format!("{err:#}")).await,
                }
            }

            _ => {} // Unknown verbs are accepted and dropped.
        }
    }

    // ── Dispatch ─────────────────────────────────────────────────

    /// Handle one decoded message from a client.
    pub async fn handle_message(&self, client: &str, msg: Message) -> Flow {
        let mut st = self.state.write().await;

        let (registered, nick_unset) = {
            let Some(cl) = st.clients.get(client) else {
                return Flow::Disconnect;
            };
            if cl.state == EntityState::Terminating {
                return Flow::Disconnect;
            }
            (cl.is_registered(), cl.nick == "*")
        };

        let command = msg.command.to_uppercase();
        match command.as_str() {
            "NICK" => {
                let valid = msg
                    .params
                    .first()
                    .map(|n| n.trim_matches('"'))
                    .filter(|n| !n.is_empty() && *n != "*");
                match valid {
                    Some(nick) if nick_unset => {
                        st.clients.get_mut(client).unwrap().nick = nick.to_owned();
                    }
                    _ if !registered => return Flow::Disconnect,
                    _ => {}
                }
            }

            "USER" if !registered => {
                if msg.params.len() < 3 || msg.params[0].is_empty() || msg.params[2].is_empty() {
                    return Flow::Disconnect;
                }
                {
                    let cl = st.clients.get_mut(client).unwrap();
                    cl.user = msg.params[0].trim_matches('"').to_owned();
                    cl.host = msg.params[2].trim_matches('"').to_owned();
                }

                let created = chrono::DateTime::from_timestamp(self.created, 0)
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                    .unwrap_or_default();
                let motd = self.config.read().await.motd.clone();

                {
                    let cl = st.clients.get(client).unwrap();
                    cl.write_numeric(
                        numeric::RPL_WELCOME,
                        &[&format!("Welcome to AnonIRC {}", cl.prefix())],
                    )
                    .await;
                    cl.write_numeric(
                        numeric::RPL_YOURHOST,
                        &["Your host is AnonIRC, running anonircd"],
                    )
                    .await;
                    cl.write_numeric(
                        numeric::RPL_CREATED,
                        &[&format!("This server was created {created}")],
                    )
                    .await;
                    cl.write_numeric(
                        numeric::RPL_MYINFO,
                        &[SERVER_NAME, "anonircd", CLIENT_MODES, CHANNEL_MODES, CHANNEL_MODES_ARG],
                    )
                    .await;

                    let lines: Vec<&str> = motd.split('\n').collect();
                    for (i, line) in lines.iter().enumerate() {
                        let code = if i == 0 {
                            numeric::RPL_MOTDSTART
                        } else if i < lines.len() - 1 {
                            numeric::RPL_MOTD
                        } else {
                            numeric::RPL_ENDOFMOTD
                        };
                        cl.write_numeric(code, &[&format!("  {line}")]).await;
                    }
                }

                self.join_channel_in(&mut st, CHANNEL_LOBBY, client, None).await;
                let vip = {
                    let cl = st.clients.get(client).unwrap();
                    self.global_permission(cl) >= Permission::Vip
                };
                if vip {
                    self.join_channel_in(&mut st, CHANNEL_SERVER, client, None).await;
                }
            }

            "PASS" if !registered => {
                let Some(credentials) = msg.params.first().filter(|p| !p.is_empty()) else {
                    return Flow::Disconnect;
                };
                let authed = credentials
                    .split_once(':')
                    .is_some_and(|(user, pass)| self.identify_in(&mut st, client, user, pass));
                if !authed {
                    if let Some(cl) = st.clients.get(client) {
                        cl.send_password_incorrect().await;
                    }
                    self.kill_client_in(&mut st, client).await;
                    return Flow::Disconnect;
                }
            }

            "CAP" => {
                let sub = msg.params.first().map(String::as_str).unwrap_or("");
                match sub {
                    "LS" => {
                        let cl = st.clients.get(client).unwrap();
                        cl.write_numeric("CAP", &["LS", "userhost-in-names"]).await;
                    }
                    "REQ" => {
                        let requested = msg.trailing().to_owned();
                        {
                            let cl = st.clients.get_mut(client).unwrap();
                            if requested.contains("userhost-in-names") {
                                cl.cap_host_in_names = true;
                            }
                        }
                        let cl = st.clients.get(client).unwrap();
                        cl.write_numeric("CAP", &["ACK", &requested]).await;
                    }
                    "LIST" => {
                        let cl = st.clients.get(client).unwrap();
                        let caps = if cl.cap_host_in_names {
                            "userhost-in-names"
                        } else {
                            ""
                        };
                        cl.write_numeric("CAP", &["LIST", caps]).await;
                    }
                    _ => {}
                }
            }

            "PING" => {
                let cl = st.clients.get(client).unwrap();
                cl.write(Message::with_prefix(
                    SERVER_NAME,
                    "PONG",
                    vec![SERVER_NAME.to_owned(), msg.trailing().to_owned()],
                ))
                .await;
            }

            // Everything below requires a completed registration.
            _ if !registered => return Flow::Disconnect,

            "WHOIS" => {
                let Some(target) = msg.params.first() else {
                    return Flow::Continue;
                };
                let lowered = target.to_lowercase();
                let Some(suffix) = lowered.strip_prefix(&ANONYMOUS_NICK.to_lowercase()) else {
                    return Flow::Continue;
                };
                let index = if suffix.is_empty() {
                    1
                } else {
                    match suffix.parse::<usize>() {
                        Ok(i) if i > 1 => i,
                        _ => return Flow::Continue,
                    }
                };

                let (tx, nick) = {
                    let cl = st.clients.get(client).unwrap();
                    let Some(tx) = cl.sender() else {
                        return Flow::Continue;
                    };
                    (tx, cl.nick.clone())
                };
                let narrative = self.narrative.read().await.clone();
                drop(st);

                // The reply must never identify anyone: a canned line
                // selected by the anonymous index, nothing else.
                let line = narrative.line(index).await;
                let whoisnick = anonymous_nick(index);
                let _ = tx
                    .send(Message::with_prefix(
                        SERVER_NAME,
                        numeric::RPL_AWAY,
                        vec![nick.clone(), whoisnick.clone(), line],
                    ))
                    .await;
                let _ = tx
                    .send(Message::with_prefix(
                        SERVER_NAME,
                        numeric::RPL_ENDOFWHOIS,
                        vec![nick, whoisnick, "End of /WHOIS list.".to_owned()],
                    ))
                    .await;
            }

            "ISON" => {
                let cl = st.clients.get(client).unwrap();
                cl.write_numeric(numeric::RPL_ISON, &[""]).await;
            }

            "AWAY" => {
                let cl = st.clients.get(client).unwrap();
                if msg.params.is_empty() {
                    cl.write_numeric(
                        numeric::RPL_UNAWAY,
                        &["You are no longer marked as being away"],
                    )
                    .await;
                } else {
                    cl.write_numeric(numeric::RPL_NOWAWAY, &["You have been marked as being away"])
                        .await;
                }
            }

            "LIST" => {
                let global = {
                    let cl = st.clients.get(client).unwrap();
                    self.global_permission(cl)
                };

                let mut counts = HashMap::new();
                for (name, ch) in &st.channels {
                    if name.starts_with('&') && global < Permission::Vip {
                        continue;
                    }
                    if ch.modes.has('p') || ch.modes.has('s') {
                        continue;
                    }
                    counts.insert(name.clone(), st.clients_in_channel(name, client));
                }

                let cl = st.clients.get(client).unwrap();
                cl.write_numeric(numeric::RPL_LISTSTART, &["Channel", "Users Name"]).await;
                for (name, count) in sort_by_count(counts) {
                    let ch = st.channels.get(&name).unwrap();
                    cl.write_numeric(
                        numeric::RPL_LIST,
                        &[
                            &name,
                            &count.to_string(),
                            &format!("[{}] {}", ch.modes.print_current(), ch.topic),
                        ],
                    )
                    .await;
                }
                cl.write_numeric(numeric::RPL_LISTEND, &["End of /LIST"]).await;
            }

            "JOIN" => {
                let Some(targets) = msg.params.first() else {
                    return Flow::Continue;
                };
                let keys: Vec<&str> = msg
                    .params
                    .get(1)
                    .map(|k| k.split(',').collect())
                    .unwrap_or_default();
                let channels: Vec<String> =
                    targets.split(',').map(str::to_owned).collect();
                for (i, channel) in channels.iter().enumerate() {
                    self.join_channel_in(&mut st, channel, client, keys.get(i).copied())
                        .await;
                }
            }

            "NAMES" => {
                let Some(targets) = msg.params.first() else {
                    return Flow::Continue;
                };
                for channel in targets.split(',') {
                    self.send_names_in(&st, channel, client).await;
                }
            }

            "WHO" => {
                let Some(targets) = msg.params.first() else {
                    return Flow::Continue;
                };
                let cl = st.clients.get(client).unwrap();
                for channel in targets.split(',') {
                    if !st.in_channel(channel, client) {
                        continue;
                    }
                    let count = st.clients_in_channel(channel, client);
                    for slot in 1..=count {
                        let (name, user, host) = if slot == 1 {
                            (cl.nick.clone(), cl.user.clone(), cl.host.clone())
                        } else {
                            (anonymous_nick(slot), "Anon".to_owned(), "IRC".to_owned())
                        };
                        cl.write_numeric(
                            numeric::RPL_WHOREPLY,
                            &[channel, &user, &host, SERVER_NAME, &name, "H", "0 Anonymous"],
                        )
                        .await;
                    }
                    cl.write_numeric(numeric::RPL_ENDOFWHO, &[channel, "End of /WHO list."])
                        .await;
                }
            }

            "MODE" => {
                if msg.params.len() == 2
                    && valid_channel_prefix(&msg.params[0])
                    && msg.params[1] == "b"
                {
                    let cl = st.clients.get(client).unwrap();
                    cl.write_numeric(
                        numeric::RPL_ENDOFBANLIST,
                        &[&msg.params[0], "End of Channel Ban List"],
                    )
                    .await;
                } else {
                    self.handle_mode_in(&mut st, client, &msg.params).await;
                }
            }

            "TOPIC" => {
                let Some(channel) = msg.params.first().filter(|c| !c.is_empty()) else {
                    return Flow::Continue;
                };
                let channel = channel.clone();
                if msg.params.len() == 1 {
                    self.send_topic_in(&st, &channel, client, false).await;
                } else {
                    let topic = msg.params[1..].join(" ");
                    self.handle_topic_in(&mut st, &channel, client, &topic).await;
                }
            }

            "PRIVMSG" => {
                let Some(target) = msg.params.first().filter(|t| !t.is_empty()) else {
                    return Flow::Continue;
                };
                let target = target.clone();
                let text = msg.params[1..].join(" ");
                self.handle_privmsg_in(&mut st, client, &target, &text).await;
            }

            "PART" => {
                let Some(targets) = msg.params.first() else {
                    return Flow::Continue;
                };
                // Client-supplied part reasons are dropped; a distinctive
                // reason would leak identity through the phantom PART.
                let channels: Vec<String> = targets.split(',').map(str::to_owned).collect();
                for channel in channels {
                    self.part_channel_in(&mut st, &channel, client, "").await;
                }
            }

            "QUIT" => {
                self.kill_client_in(&mut st, client).await;
                return Flow::Disconnect;
            }

            _ => {
                let verb = command.clone();
                self.handle_user_command_in(&mut st, client, &verb, &msg.params).await;
            }
        }

        Flow::Continue
    }

    // ── Public entry points (also used by the integration tests) ─

    pub async fn join_channel(&self, channel: &str, client: &str) {
        let mut st = self.state.write().await;
        self.join_channel_in(&mut st, channel, client, None).await;
    }

    pub async fn part_channel(&self, channel: &str, client: &str, reason: &str) {
        let mut st = self.state.write().await;
        self.part_channel_in(&mut st, channel, client, reason).await;
    }

    pub async fn privmsg(&self, client: &str, target: &str, text: &str) {
        let mut st = self.state.write().await;
        self.handle_privmsg_in(&mut st, client, target, text).await;
    }

    pub async fn handle_user_command(&self, client: &str, command: &str, params: &[String]) {
        let mut st = self.state.write().await;
        self.handle_user_command_in(&mut st, client, command, params).await;
    }

    pub async fn kill_client(&self, client: &str) {
        let mut st = self.state.write().await;
        self.kill_client_in(&mut st, client).await;
    }

    /// Reload the configuration and cycle both listeners. A snapshot
    /// that fails to parse leaves the previous one in place.
    pub async fn reload(&self) -> anyhow::Result<()> {
        info!("reloading configuration");
        let config = crate::config::load(&self.config_path)
            .context("failed to reload configuration")?;

        *self.narrative.write().await = Narrative::new(&config.narrative);
        *self.config.write().await = config;
        self.restart_plain.notify_one();
        self.restart_ssl.notify_one();
        info!("reloaded configuration");
        Ok(())
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Run one connection to completion: ban check, registration into
    /// the client index, writer task, then the read loop.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S, ssl: bool, addr: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let salt = self.config.read().await.salt.clone();
        let iphash = hash_address(&salt, &addr.ip().to_string());

        let mut framed = Framed::new(stream, IrcCodec);

        // Server-wide bans are enforced before the connection exists
        // anywhere; the notice is written straight to the socket.
        if let Some(reason) = must(self.db.find_ban(CHANNEL_SERVER, &iphash, 0)) {
            let text = format_action("You are banned", &reason);
            let _ = framed
                .send(Message::with_prefix(
                    SERVER_NAME,
                    "NOTICE",
                    vec!["*".to_owned(), format!("*** {text}")],
                ))
                .await;
            return;
        }

        let (id, rx, token) = {
            let mut st = self.state.write().await;
            let mut id = random_identifier();
            while st.clients.contains_key(&id) {
                id = random_identifier();
            }
            let (tx, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
            let cl = Client::new(id.clone(), ssl, iphash, tx);
            let token = cl.terminate.clone();
            st.clients.insert(id.clone(), cl);
            (id, rx, token)
        };
        info!(client = %id, %addr, ssl, "new connection");

        let (sink, stream) = framed.split();
        let writer = tokio::spawn(write_loop(sink, rx, id.clone()));

        self.read_loop(&id, stream, token).await;

        self.kill_client(&id).await;
        let _ = writer.await;
        info!(client = %id, "disconnected");
    }

    async fn read_loop<S>(
        &self,
        client: &str,
        mut stream: SplitStream<Framed<S, IrcCodec>>,
        terminate: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = terminate.cancelled() => return,
                frame = tokio::time::timeout(READ_DEADLINE, stream.next()) => frame,
            };

            let msg = match frame {
                Err(_) => {
                    debug!(client = %client, "read deadline expired");
                    return;
                }
                Ok(None) => return,
                Ok(Some(Err(err))) => {
                    debug!(client = %client, "decode error: {err}");
                    return;
                }
                Ok(Some(Ok(msg))) => msg,
            };

            if msg.command != "PING" && msg.command != "PONG" {
                debug!(client = %client, "-> {msg}");
            }

            if self.handle_message(client, msg).await == Flow::Disconnect {
                return;
            }
        }
    }

    // ── Listeners ────────────────────────────────────────────────

    pub async fn listen_plain(self: Arc<Self>) {
        loop {
            let listener = match TcpListener::bind(("0.0.0.0", PLAIN_PORT)).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!("failed to listen on {PLAIN_PORT}: {err}");
                    tokio::time::sleep(LISTEN_RETRY).await;
                    continue;
                }
            };
            info!("listening on {PLAIN_PORT}");

            loop {
                tokio::select! {
                    _ = self.restart_plain.notified() => {
                        info!("cycling plain listener");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((socket, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(server.handle_connection(socket, false, addr));
                        }
                        Err(err) => warn!("error accepting connection: {err}"),
                    }
                }
            }
        }
    }

    pub async fn listen_ssl(self: Arc<Self>) {
        loop {
            let (cert, key) = {
                let config = self.config.read().await;
                (config.ssl_cert.clone(), config.ssl_key.clone())
            };
            if cert.is_empty() {
                // TLS disabled until a reload supplies a certificate.
                self.restart_ssl.notified().await;
                continue;
            }

            let acceptor = match build_tls_acceptor(&cert, &key) {
                Ok(acceptor) => acceptor,
                Err(err) => {
                    warn!("failed to load SSL certificate: {err:#}");
                    tokio::time::sleep(LISTEN_RETRY).await;
                    continue;
                }
            };

            let listener = match TcpListener::bind(("0.0.0.0", SSL_PORT)).await {
                Ok(listener) => listener,
                Err(err) => {
                    warn!("failed to listen on {SSL_PORT}: {err}");
                    tokio::time::sleep(LISTEN_RETRY).await;
                    continue;
                }
            };
            info!("listening on +{SSL_PORT}");

            loop {
                tokio::select! {
                    _ = self.restart_ssl.notified() => {
                        info!("cycling SSL listener");
                        break;
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((socket, addr)) => {
                            let server = Arc::clone(&self);
                            let acceptor = acceptor.clone();
                            tokio::spawn(async move {
                                match acceptor.accept(socket).await {
                                    Ok(tls) => server.handle_connection(tls, true, addr).await,
                                    Err(err) => warn!(%addr, "TLS handshake failed: {err}"),
                                }
                            });
                        }
                        Err(err) => warn!("error accepting connection: {err}"),
                    }
                }
            }
        }
    }

    /// Periodic keepalive to every client.
    pub async fn ping_clients(self: Arc<Self>) {
        loop {
            let senders: Vec<mpsc::Sender<Message>> = {
                let st = self.state.read().await;
                st.clients.values().filter_map(Client::sender).collect()
            };

            let token = format!(
                "anonirc{}{}",
                now_unix(),
                rand::thread_rng().gen_range(0..1000)
            );
            for tx in senders {
                let _ = tx.send(Message::new("PING", vec![token.clone()])).await;
            }

            tokio::time::sleep(PING_INTERVAL).await;
        }
    }

    /// Run both listeners and the pinger. Never returns.
    pub async fn run(self: Arc<Self>) {
        tokio::spawn(Arc::clone(&self).listen_plain());
        tokio::spawn(Arc::clone(&self).listen_ssl());
        self.ping_clients().await;
    }
}

/// Drain a client's outbound queue onto its socket. A write failure
/// flips a sticky dead flag and keeps draining so producers never block
/// on a dead peer; the reader notices the dead socket on its side.
async fn write_loop<S>(
    mut sink: SplitSink<Framed<S, IrcCodec>, Message>,
    mut rx: mpsc::Receiver<Message>,
    client: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut dead = false;
    while let Some(msg) = rx.recv().await {
        if dead {
            continue;
        }
        if msg.command != "PING" && msg.command != "PONG" {
            debug!(client = %client, "<- {msg}");
        }
        if let Err(err) = sink.send(msg).await {
            debug!(client = %client, "write failed: {err}");
            dead = true;
        }
    }
    let _ = sink.close().await;
}

fn build_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
    let cert_pem = std::fs::read(cert_path)
        .with_context(|| format!("failed to read TLS cert {cert_path}"))?;
    let key_pem = std::fs::read(key_path)
        .with_context(|| format!("failed to read TLS key {key_path}"))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .context("failed to parse TLS certificates")?;
    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .context("failed to parse TLS private key")?
        .context("no private key found in PEM file")?;

    let config = tokio_rustls::rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS configuration")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
