//! End-to-end presence and moderation scenarios, driven against the
//! server state with in-memory client queues.
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;

use anonircd::config::Config;
use anonircd::db::Db;
use anonircd::irc::channel::Channel;
use anonircd::irc::client::Client;
use anonircd::irc::message::Message;
use anonircd::irc::server::Server;
use anonircd::util::hash_address;

const SALT: &str = "salt";

fn new_server() -> Arc<Server> {
    let mut config = Config::default();
    config.salt = SALT.into();
    config.db_driver = "sqlite3".into();
    config.db_source = ":memory:".into();
    let db = Db::open(":memory:", SALT).unwrap();
    Server::new(config, PathBuf::from("/nonexistent/anonircd.conf"), db)
}

/// Register a fake connection directly in the client index.
async fn add_client(
    server: &Server,
    id: &str,
    nick: &str,
    ssl: bool,
    ip: &str,
) -> mpsc::Receiver<Message> {
    let (tx, rx) = mpsc::channel(256);
    let mut client = Client::new(id.to_owned(), ssl, hash_address(SALT, ip), tx);
    client.nick = nick.to_owned();
    client.user = nick.to_owned();
    client.host = "localhost".to_owned();
    server
        .state
        .write()
        .await
        .clients
        .insert(id.to_owned(), client);
    rx
}

fn drain(rx: &mut mpsc::Receiver<Message>) -> Vec<Message> {
    let mut out = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        out.push(msg);
    }
    out
}

fn wires(msgs: &[Message]) -> Vec<String> {
    msgs.iter().map(Message::to_wire).collect()
}

// ── Two-party visibility ─────────────────────────────────────────

#[tokio::test]
async fn two_party_visibility() {
    let server = new_server();
    let mut rx_a = add_client(&server, "AAAAAAAAAA", "alice", true, "1.1.1.1").await;
    let mut rx_b = add_client(&server, "BBBBBBBBBB", "bob", false, "2.2.2.2").await;

    server.join_channel("#lobby", "AAAAAAAAAA").await;
    let join_a = drain(&mut rx_a);
    assert_eq!(join_a[0].prefix.as_deref(), Some("alice!alice@localhost"));
    assert_eq!(join_a[0].command, "JOIN");
    assert_eq!(join_a[0].params, vec!["#lobby"]);
    assert_eq!(join_a[1].command, "353");
    assert_eq!(join_a[1].params, vec!["alice", "=", "#lobby", "alice"]);
    assert_eq!(join_a[2].command, "366");
    assert_eq!(join_a.len(), 3);

    server.join_channel("#lobby", "BBBBBBBBBB").await;

    // B sees itself plus one anonymous slot, never alice.
    let join_b = drain(&mut rx_b);
    assert_eq!(join_b[0].prefix.as_deref(), Some("bob!bob@localhost"));
    assert_eq!(join_b[1].command, "353");
    assert_eq!(join_b[1].params, vec!["bob", "=", "#lobby", "bob Anonymous2"]);
    assert!(wires(&join_b).iter().all(|w| !w.contains("alice")));

    // A sees exactly one phantom join.
    let phantom = drain(&mut rx_a);
    assert_eq!(phantom.len(), 1);
    assert_eq!(phantom[0].prefix.as_deref(), Some("Anonymous2!Anon@IRC"));
    assert_eq!(phantom[0].command, "JOIN");
    assert_eq!(phantom[0].params, vec!["#lobby"]);
    assert!(wires(&phantom).iter().all(|w| !w.contains("bob")));
}

#[tokio::test]
async fn privmsg_is_anonymous_with_no_echo() {
    let server = new_server();
    let mut rx_a = add_client(&server, "AAAAAAAAAA", "alice", true, "1.1.1.1").await;
    let mut rx_b = add_client(&server, "BBBBBBBBBB", "bob", false, "2.2.2.2").await;

    server.join_channel("#lobby", "AAAAAAAAAA").await;
    server.join_channel("#lobby", "BBBBBBBBBB").await;
    drain(&mut rx_a);
    drain(&mut rx_b);

    server.privmsg("BBBBBBBBBB", "#lobby", "hello there").await;

    let to_a = drain(&mut rx_a);
    assert_eq!(to_a.len(), 1);
    assert_eq!(to_a[0].prefix.as_deref(), Some("Anonymous!Anon@IRC"));
    assert_eq!(to_a[0].command, "PRIVMSG");
    assert_eq!(to_a[0].params, vec!["#lobby", "hello there"]);

    // The sender receives no echo.
    assert!(drain(&mut rx_b).is_empty());
}

#[tokio::test]
async fn join_twice_is_a_noop() {
    let server = new_server();
    let mut rx = add_client(&server, "AAAAAAAAAA", "alice", true, "1.1.1.1").await;

    server.join_channel("#lobby", "AAAAAAAAAA").await;
    drain(&mut rx);
    server.join_channel("#lobby", "AAAAAAAAAA").await;
    assert!(drain(&mut rx).is_empty());

    let st = server.state.read().await;
    assert_eq!(st.channel("#lobby").unwrap().real_count(), 1);
}

#[tokio::test]
async fn part_when_not_a_member_is_a_noop() {
    let server = new_server();
    let mut rx = add_client(&server, "AAAAAAAAAA", "alice", true, "1.1.1.1").await;

    server.part_channel("#lobby", "AAAAAAAAAA", "bye").await;
    assert!(drain(&mut rx).is_empty());
}

// ── Count concealment (+c) ───────────────────────────────────────

#[tokio::test]
async fn count_concealment_caps_at_two() {
    let server = new_server();
    let ids: Vec<String> = (0..10).map(|i| format!("CLIENT{i:04}")).collect();
    let mut receivers = Vec::new();
    for (i, id) in ids.iter().enumerate() {
        receivers.push(add_client(&server, id, &format!("user{i}"), false, &format!("10.0.0.{i}")).await);
    }

    // Create the channel hidden from the start.
    {
        let mut st = server.state.write().await;
        let mut ch = Channel::new("#hide");
        ch.modes.add('c', "");
        st.channels.insert("#hide".into(), ch);
    }

    for id in &ids {
        server.join_channel("#hide", id).await;
    }

    // Joiners beyond the first see exactly {self, Anonymous2} in NAMES.
    for (i, rx) in receivers.iter_mut().enumerate().skip(1) {
        let msgs = drain(rx);
        let names = msgs.iter().find(|m| m.command == "353").unwrap();
        assert_eq!(
            names.params[3],
            format!("user{i} Anonymous2"),
            "joiner {i} saw {:?}",
            names.params
        );
        // No phantom traffic beyond the NAMES burst.
        assert!(msgs.iter().all(|m| m.command != "JOIN" || m.prefix.as_deref()
            == Some(&format!("user{i}!user{i}@localhost") as &str)));
    }

    // The first joiner got exactly one phantom JOIN (slot 2) in total.
    let first = drain(&mut receivers[0]);
    let phantoms: Vec<_> = first
        .iter()
        .filter(|m| m.command == "JOIN" && m.prefix.as_deref() != Some("user0!user0@localhost"))
        .collect();
    assert_eq!(phantoms.len(), 1);
    assert_eq!(phantoms[0].prefix.as_deref(), Some("Anonymous2!Anon@IRC"));

    {
        let st = server.state.read().await;
        for id in &ids {
            assert_eq!(st.clients_in_channel("#hide", id), 2);
        }
    }

    // Five clients leave; every remaining member still sees exactly one
    // phantom peer and no phantom PART fires.
    for id in ids.iter().take(5) {
        server.part_channel("#hide", id, "").await;
    }
    for rx in receivers.iter_mut().skip(5) {
        let msgs = drain(rx);
        assert!(
            msgs.iter().all(|m| m.command != "PART"),
            "unexpected phantom part: {:?}",
            wires(&msgs)
        );
    }

    let st = server.state.read().await;
    assert_eq!(st.channel("#hide").unwrap().real_count(), 5);
    for id in ids.iter().skip(5) {
        assert_eq!(st.clients_in_channel("#hide", id), 2);
    }
}

// ── Reveal then kick ─────────────────────────────────────────────

#[tokio::test]
async fn reveal_then_kick() {
    let server = new_server();
    let mut rx_mod = add_client(&server, "MMMMMMMMMM", "mod", true, "1.1.1.1").await;
    let mut rx_x = add_client(&server, "XXXXXXXXXX", "xavier", false, "9.9.9.9").await;
    let mut rx_b = add_client(&server, "BBBBBBBBBB", "bella", false, "8.8.8.8").await;

    server.db.add_account("mod", "pw").unwrap();
    let account = server.db.auth("mod", "pw").unwrap();
    server
        .db
        .set_permission(account, "#mod", anonircd::irc::commands::Permission::Moderator)
        .unwrap();

    server
        .handle_user_command("MMMMMMMMMM", "IDENTIFY", &["mod".into(), "pw".into()])
        .await;

    server.join_channel("#mod", "MMMMMMMMMM").await;
    server.join_channel("#mod", "XXXXXXXXXX").await;
    server.join_channel("#mod", "BBBBBBBBBB").await;
    server.privmsg("XXXXXXXXXX", "#mod", "hello").await;
    drain(&mut rx_mod);
    drain(&mut rx_x);
    drain(&mut rx_b);

    // REVEAL surfaces the chat line under a five-character tag.
    server
        .handle_user_command("MMMMMMMMMM", "REVEAL", &["#mod".into()])
        .await;
    let reveal = drain(&mut rx_mod);
    let line = reveal
        .iter()
        .find(|m| m.command == "PRIVMSG" && m.params[1].contains("CHAT: hello"))
        .expect("no reveal line for the chat entry");
    let tag: String = line.params[1].chars().take(5).collect();
    assert_eq!(tag.len(), 5);
    assert!(tag.chars().all(|c| c.is_ascii_digit()));
    // The reveal output itself must not leak the speaker.
    assert!(!line.params[1].contains("xavier"));

    server
        .handle_user_command("MMMMMMMMMM", "KICK", &["#mod".into(), tag.clone()])
        .await;

    // The target sees its own PART with the kick reason.
    let to_x = drain(&mut rx_x);
    assert!(to_x
        .iter()
        .any(|m| m.command == "PART" && m.params == vec!["#mod", "Kicked"]));

    // Bystanders see a phantom PART shrinking the population.
    let to_b = drain(&mut rx_b);
    assert!(to_b
        .iter()
        .any(|m| m.command == "PART" && m.prefix.as_deref().is_some_and(|p| p.starts_with("Anonymous"))));

    let st = server.state.read().await;
    assert!(!st.in_channel("#mod", "XXXXXXXXXX"));
}

// ── TLS-only enforcement (+z) ────────────────────────────────────

#[tokio::test]
async fn tls_only_channel_rejects_plain_clients() {
    let server = new_server();
    let mut rx_tls = add_client(&server, "TTTTTTTTTT", "tina", true, "1.1.1.1").await;
    let mut rx_plain = add_client(&server, "PPPPPPPPPP", "paul", false, "2.2.2.2").await;

    {
        let mut st = server.state.write().await;
        let mut ch = Channel::new("#secure");
        ch.modes.add('z', "");
        st.channels.insert("#secure".into(), ch);
    }

    server.join_channel("#secure", "TTTTTTTTTT").await;
    drain(&mut rx_tls);

    server.join_channel("#secure", "PPPPPPPPPP").await;

    let to_plain = drain(&mut rx_plain);
    assert_eq!(to_plain.len(), 1);
    assert_eq!(to_plain[0].command, "NOTICE");
    assert!(to_plain[0].params[1].contains("SSL connections only"));

    // No phantom traffic fires for anyone.
    assert!(drain(&mut rx_tls).is_empty());
    let st = server.state.read().await;
    assert!(!st.in_channel("#secure", "PPPPPPPPPP"));
}

// ── Server sentinel access ───────────────────────────────────────

#[tokio::test]
async fn server_sentinel_requires_vip_and_identify_auto_joins() {
    let server = new_server();
    let mut rx = add_client(&server, "VVVVVVVVVV", "visitor", true, "1.1.1.1").await;

    server.join_channel("&admins", "VVVVVVVVVV").await;
    let denied = drain(&mut rx);
    assert!(denied
        .iter()
        .any(|m| m.command == "NOTICE" && m.params[1].contains("Access denied")));
    {
        let st = server.state.read().await;
        assert!(!st.in_channel("&admins", "VVVVVVVVVV"));
    }

    // The seeded admin account holds SUPERADMIN on `&`; identifying
    // auto-joins the server channel, topic included.
    server
        .handle_user_command("VVVVVVVVVV", "IDENTIFY", &["admin".into(), "password".into()])
        .await;

    let msgs = drain(&mut rx);
    assert!(msgs
        .iter()
        .any(|m| m.command == "NOTICE" && m.params[1].contains("Identified successfully")));
    assert!(msgs.iter().any(|m| m.command == "JOIN" && m.params == vec!["&"]));
    assert!(msgs
        .iter()
        .any(|m| m.command == "332" && m.params[2] == "Secret Area of VIP Quality"));

    let st = server.state.read().await;
    assert!(st.in_channel("&", "VVVVVVVVVV"));
}

// ── Ban persistence ──────────────────────────────────────────────

#[tokio::test]
async fn ban_persists_and_blocks_rejoin_by_address() {
    let server = new_server();
    let mut rx_mod = add_client(&server, "MMMMMMMMMM", "mod", true, "1.1.1.1").await;
    let mut rx_x = add_client(&server, "XXXXXXXXXX", "xavier", false, "9.9.9.9").await;

    server.db.add_account("mod", "pw").unwrap();
    let account = server.db.auth("mod", "pw").unwrap();
    server
        .db
        .set_permission(account, "#chan", anonircd::irc::commands::Permission::Moderator)
        .unwrap();
    server
        .handle_user_command("MMMMMMMMMM", "IDENTIFY", &["mod".into(), "pw".into()])
        .await;

    server.join_channel("#chan", "MMMMMMMMMM").await;
    server.join_channel("#chan", "XXXXXXXXXX").await;
    server.privmsg("XXXXXXXXXX", "#chan", "spam").await;
    drain(&mut rx_mod);

    server
        .handle_user_command("MMMMMMMMMM", "REVEAL", &["#chan".into()])
        .await;
    let reveal = drain(&mut rx_mod);
    let line = reveal
        .iter()
        .find(|m| m.command == "PRIVMSG" && m.params[1].contains("CHAT: spam"))
        .unwrap();
    let tag: String = line.params[1].chars().take(5).collect();

    drain(&mut rx_x);
    server
        .handle_user_command(
            "MMMMMMMMMM",
            "BAN",
            &["#chan".into(), tag, "1h".into(), "harass".into()],
        )
        .await;

    // The live target is parted with the ban reason.
    let to_x = drain(&mut rx_x);
    assert!(to_x
        .iter()
        .any(|m| m.command == "PART" && m.params == vec!["#chan", "Banned: harass"]));
    {
        let st = server.state.read().await;
        assert!(!st.in_channel("#chan", "XXXXXXXXXX"));
    }

    // The ban row is keyed on the address hash.
    let iphash = hash_address(SALT, "9.9.9.9");
    assert_eq!(
        server.db.find_ban("#chan", &iphash, 0).unwrap(),
        Some("harass".into())
    );

    // A fresh connection from the same address cannot rejoin.
    let mut rx_y = add_client(&server, "YYYYYYYYYY", "yankee", false, "9.9.9.9").await;
    server.join_channel("#chan", "YYYYYYYYYY").await;
    let to_y = drain(&mut rx_y);
    assert_eq!(to_y.len(), 1);
    assert_eq!(to_y[0].command, "NOTICE");
    assert!(to_y[0].params[1].contains("You are banned. Reason: harass"));

    let st = server.state.read().await;
    assert!(!st.in_channel("#chan", "YYYYYYYYYY"));
}
