//! Administrative command tables: the permission ladder, the permission
//! required per command, and the usage text served by HELP.
//!
//! Both tables are static data; dispatch is a table lookup, not a
//! conditional cascade.
use std::collections::{BTreeMap, HashMap};
use std::sync::LazyLock;

use super::log::CHANNEL_LOGS_PER_PAGE;

pub const COMMAND_HELP: &str = "HELP";
pub const COMMAND_INFO: &str = "INFO";

// User commands
pub const COMMAND_REGISTER: &str = "REGISTER";
pub const COMMAND_IDENTIFY: &str = "IDENTIFY";
pub const COMMAND_TOKEN: &str = "TOKEN";
pub const COMMAND_USERNAME: &str = "USERNAME";
pub const COMMAND_PASSWORD: &str = "PASSWORD";

// Channel/server commands
pub const COMMAND_FOUND: &str = "FOUND";
pub const COMMAND_DROP: &str = "DROP";
pub const COMMAND_GRANT: &str = "GRANT";
pub const COMMAND_REVEAL: &str = "REVEAL";
pub const COMMAND_AUDIT: &str = "AUDIT";
pub const COMMAND_KICK: &str = "KICK";
pub const COMMAND_BAN: &str = "BAN";

// Server admins only
pub const COMMAND_KILL: &str = "KILL";
pub const COMMAND_STATS: &str = "STATS";
pub const COMMAND_REHASH: &str = "REHASH";
pub const COMMAND_UPGRADE: &str = "UPGRADE";

/// Commands whose permission is always evaluated server-wide.
pub const SERVER_COMMANDS: &[&str] = &[
    COMMAND_KILL,
    COMMAND_STATS,
    COMMAND_REHASH,
    COMMAND_UPGRADE,
];

/// The permission ladder. Ordering is significant: a command is permitted
/// iff the caller's effective permission is at least the requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    Client = 0,
    Registered = 1,
    Vip = 2,
    Moderator = 3,
    Admin = 4,
    SuperAdmin = 5,
}

impl Permission {
    pub fn label(self) -> &'static str {
        match self {
            Self::Client => "Client",
            Self::Registered => "Registered",
            Self::Vip => "VIP",
            Self::Moderator => "Moderator",
            Self::Admin => "Administrator",
            Self::SuperAdmin => "Super Administrator",
        }
    }

    pub fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Registered,
            2 => Self::Vip,
            3 => Self::Moderator,
            4 => Self::Admin,
            v if v >= 5 => Self::SuperAdmin,
            _ => Self::Client,
        }
    }

    /// Parse a ladder name as typed by an operator. "User" is accepted as
    /// an alias for Client (GRANT's removal case).
    pub fn parse(s: &str) -> Option<Self> {
        if let Ok(value) = s.parse::<i64>() {
            if (0..=5).contains(&value) {
                return Some(Self::from_i64(value));
            }
            return None;
        }

        match s.to_lowercase().as_str() {
            "client" | "user" => Some(Self::Client),
            "registered" => Some(Self::Registered),
            "vip" => Some(Self::Vip),
            "moderator" => Some(Self::Moderator),
            "admin" | "administrator" => Some(Self::Admin),
            "superadmin" | "super administrator" => Some(Self::SuperAdmin),
            _ => None,
        }
    }
}

static COMMAND_PERMISSIONS: LazyLock<HashMap<&'static str, Permission>> = LazyLock::new(|| {
    let mut m = HashMap::new();
    m.insert(COMMAND_TOKEN, Permission::Registered);
    m.insert(COMMAND_USERNAME, Permission::Registered);
    m.insert(COMMAND_PASSWORD, Permission::Registered);
    m.insert(COMMAND_FOUND, Permission::Registered);
    m.insert(COMMAND_REVEAL, Permission::Moderator);
    m.insert(COMMAND_KICK, Permission::Moderator);
    m.insert(COMMAND_BAN, Permission::Moderator);
    m.insert(COMMAND_GRANT, Permission::Admin);
    m.insert(COMMAND_AUDIT, Permission::Admin);
    m.insert(COMMAND_DROP, Permission::SuperAdmin);
    m.insert(COMMAND_KILL, Permission::SuperAdmin);
    m.insert(COMMAND_STATS, Permission::SuperAdmin);
    m.insert(COMMAND_REHASH, Permission::SuperAdmin);
    m.insert(COMMAND_UPGRADE, Permission::SuperAdmin);
    // Channel mode changes are a moderation action.
    m.insert("MODE", Permission::Moderator);
    m
});

/// The permission required to use a command; unlisted commands are open.
pub fn required_permission(command: &str) -> Permission {
    COMMAND_PERMISSIONS
        .get(command.to_uppercase().as_str())
        .copied()
        .unwrap_or(Permission::Client)
}

const HELP_DURATION: &str = "Duration can be 0 to never expire, or e.g. 30m, 1h, 2d, 3w";

static COMMAND_USAGE: LazyLock<BTreeMap<&'static str, Vec<String>>> = LazyLock::new(|| {
    let mut m: BTreeMap<&'static str, Vec<String>> = BTreeMap::new();
    m.insert(
        COMMAND_HELP,
        vec![
            "[command]".into(),
            "Print info regarding all commands or a specific command".into(),
        ],
    );
    m.insert(
        COMMAND_INFO,
        vec![
            "[channel]".into(),
            "When a channel is specified, prints info including whether it is registered".into(),
            "Without a channel, server info is printed".into(),
        ],
    );
    m.insert(
        COMMAND_REGISTER,
        vec![
            "<username> <password>".into(),
            "Create an account, allowing you to found channels and moderate existing channels"
                .into(),
            "See IDENTIFY, FOUND, GRANT".into(),
        ],
    );
    m.insert(
        COMMAND_IDENTIFY,
        vec![
            "[username] <password>".into(),
            "Identify to a previously registered account".into(),
            "If username is omitted, it will be replaced with your current nick".into(),
            "Note that you may automatically identify when connecting by specifying a server \
             password of your username and password separated by a colon - Example:  \
             admin:hunter2"
                .into(),
        ],
    );
    m.insert(
        COMMAND_TOKEN,
        vec![
            "<channel>".into(),
            "Returns a token which can be used by channel administrators to grant special \
             access to your account"
                .into(),
        ],
    );
    m.insert(
        COMMAND_USERNAME,
        vec![
            "<username> <password> <new username> <confirm new username>".into(),
            "Change your username".into(),
        ],
    );
    m.insert(
        COMMAND_PASSWORD,
        vec![
            "<username> <password> <new password> <confirm new password>".into(),
            "Change your password".into(),
        ],
    );
    m.insert(
        COMMAND_FOUND,
        vec!["<channel>".into(), "Register a channel".into()],
    );
    m.insert(
        COMMAND_GRANT,
        vec![
            "<channel> [account] [updated access]".into(),
            "When an account token isn't specified, all permissions are listed".into(),
            "View or update a user's access level by specifying their account token".into(),
            "To remove an account, set their access level to User".into(),
        ],
    );
    m.insert(
        COMMAND_REVEAL,
        vec![
            "<channel> [page] [full]".into(),
            "Print channel log, allowing KICK/BAN to be used".into(),
            format!("Results start at page 1, {CHANNEL_LOGS_PER_PAGE} per page"),
            "All log entries are returned when viewing page -1".into(),
            "By default joins and parts are hidden, use 'full' to show them".into(),
        ],
    );
    m.insert(
        COMMAND_AUDIT,
        vec![
            "<channel> [page]".into(),
            "Print the full channel log, including joins and parts".into(),
        ],
    );
    m.insert(
        COMMAND_KICK,
        vec![
            "<channel> <5 digit log number> [reason]".into(),
            "Kick a user from a channel".into(),
        ],
    );
    m.insert(
        COMMAND_BAN,
        vec![
            "<channel> <5 digit log number> <duration> [reason]".into(),
            "Kick and ban a user from a channel".into(),
            HELP_DURATION.into(),
        ],
    );
    m.insert(
        COMMAND_DROP,
        vec![
            "<channel> <confirm channel>".into(),
            "Delete all channel data, allowing it to be FOUNDed again".into(),
        ],
    );
    m.insert(
        COMMAND_KILL,
        vec![
            "<channel> <5 digit log number> <duration> [reason]".into(),
            "Disconnect and ban a user from the server".into(),
            HELP_DURATION.into(),
        ],
    );
    m.insert(
        COMMAND_STATS,
        vec![
            "".into(),
            "Print the current number of clients and channels".into(),
        ],
    );
    m.insert(
        COMMAND_REHASH,
        vec!["".into(), "Reload the server configuration".into()],
    );
    m.insert(
        COMMAND_UPGRADE,
        vec![
            "".into(),
            "Upgrade the server without disconnecting clients".into(),
        ],
    );
    m
});

/// Usage lines for a command, if it has any.
pub fn command_usage(command: &str) -> Option<&'static [String]> {
    COMMAND_USAGE
        .get(command.to_uppercase().as_str())
        .map(|v| v.as_slice())
}

/// All commands with usage text, in alphabetical order.
pub fn commands_with_usage() -> impl Iterator<Item = (&'static str, &'static [String])> {
    COMMAND_USAGE.iter().map(|(cmd, usage)| (*cmd, usage.as_slice()))
}
