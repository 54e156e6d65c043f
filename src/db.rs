//! The credential, permission, and ban store.
//!
//! SQLite behind a mutex; every identity-bearing column is stored hashed
//! (usernames and channel names with the unsalted identity hash,
//! passwords and addresses with the salted one), so the database alone
//! never reveals who spoke where. Store errors that are not "no rows"
//! indicate corruption and are propagated for the caller to fail loudly
//! on.
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension, Result};

use crate::irc::commands::Permission;
use crate::util::{generate_hash, hash_password, now_unix};

pub const DATABASE_VERSION: i64 = 1;

/// Ban row targets an address hash.
pub const BAN_TYPE_ADDRESS: i64 = 1;
/// Ban row targets an account id.
pub const BAN_TYPE_ACCOUNT: i64 = 2;

/// A registered channel row.
#[derive(Debug, Clone)]
pub struct DbChannel {
    pub topic: String,
    pub topictime: i64,
}

pub struct Db {
    conn: Mutex<Connection>,
    salt: String,
}

impl Db {
    /// Open (or create) the store, run migrations, and seed first-run
    /// data: the admin account and the `&` / `#` channels.
    pub fn open(source: &str, salt: &str) -> Result<Self> {
        let conn = Connection::open(source)?;
        let db = Self {
            conn: Mutex::new(conn),
            salt: salt.to_owned(),
        };
        db.create_tables()?;
        db.migrate()?;
        db.initialize()?;
        Ok(db)
    }

    fn create_tables(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS meta (
                 key TEXT PRIMARY KEY,
                 value TEXT
             );
             CREATE TABLE IF NOT EXISTS accounts (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 username TEXT,
                 password TEXT
             );
             CREATE TABLE IF NOT EXISTS channels (
                 channel TEXT PRIMARY KEY,
                 topic TEXT,
                 topictime INTEGER,
                 password TEXT
             );
             CREATE TABLE IF NOT EXISTS permissions (
                 channel TEXT,
                 account INTEGER,
                 permission INTEGER
             );
             CREATE TABLE IF NOT EXISTS bans (
                 channel TEXT,
                 type INTEGER,
                 target TEXT,
                 expires INTEGER,
                 reason TEXT
             );",
        )
    }

    fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match version.and_then(|v| v.parse::<i64>().ok()) {
            None => {
                conn.execute(
                    "INSERT OR REPLACE INTO meta (key, value) VALUES ('version', ?1)",
                    params![DATABASE_VERSION.to_string()],
                )?;
            }
            Some(v) if v < DATABASE_VERSION => {
                // Version 2 migration statements will go here.
                conn.execute(
                    "UPDATE meta SET value = ?1 WHERE key = 'version'",
                    params![DATABASE_VERSION.to_string()],
                )?;
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn initialize(&self) -> Result<()> {
        let empty = {
            let conn = self.conn.lock().unwrap();
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;
            count == 0
        };

        if empty {
            self.add_account("admin", "password")?;
            self.add_channel(1, "&", "Secret Area of VIP Quality")?;
            self.add_channel(1, "#", "Welcome to AnonIRC")?;
        }

        Ok(())
    }

    // ── Accounts ─────────────────────────────────────────────────

    /// Account id for a username, 0 when unknown.
    pub fn account_id(&self, username: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM accounts WHERE username = ?1",
                params![generate_hash(username)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or(0))
    }

    /// Verify credentials; returns the account id, 0 on mismatch.
    pub fn auth(&self, username: &str, password: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let id: Option<i64> = conn
            .query_row(
                "SELECT id FROM accounts WHERE username = ?1 AND password = ?2",
                params![
                    generate_hash(username),
                    hash_password(&self.salt, username, password)
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id.unwrap_or(0))
    }

    /// Create an account. Returns false when the username is taken.
    pub fn add_account(&self, username: &str, password: &str) -> Result<bool> {
        if self.account_id(username)? != 0 {
            return Ok(false);
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO accounts (username, password) VALUES (?1, ?2)",
            params![
                generate_hash(username),
                hash_password(&self.salt, username, password)
            ],
        )?;
        Ok(true)
    }

    /// Change a username (re-hashing the password under the new name).
    /// Returns false when the new username is taken.
    pub fn set_username(&self, account: i64, username: &str, password: &str) -> Result<bool> {
        if self.account_id(username)? != 0 {
            return Ok(false);
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET username = ?1, password = ?2 WHERE id = ?3",
            params![
                generate_hash(username),
                hash_password(&self.salt, username, password),
                account
            ],
        )?;
        Ok(true)
    }

    pub fn set_password(&self, account: i64, username: &str, password: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE accounts SET password = ?1 WHERE id = ?2",
            params![hash_password(&self.salt, username, password), account],
        )?;
        Ok(())
    }

    // ── Channels ─────────────────────────────────────────────────

    fn channel_key(channel: &str) -> String {
        generate_hash(&channel.to_lowercase())
    }

    /// A registered channel's row, if any.
    pub fn channel(&self, channel: &str) -> Result<Option<DbChannel>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT topic, topictime FROM channels WHERE channel = ?1",
            params![Self::channel_key(channel)],
            |row| {
                Ok(DbChannel {
                    topic: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                    topictime: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
                })
            },
        )
        .optional()
    }

    /// Register a channel, granting its founder SUPERADMIN. Returns
    /// false when the channel is already registered.
    pub fn add_channel(&self, founder: i64, channel: &str, topic: &str) -> Result<bool> {
        if self.channel(channel)?.is_some() {
            return Ok(false);
        }

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO channels (channel, topic, topictime, password) VALUES (?1, ?2, ?3, '')",
                params![Self::channel_key(channel), topic, now_unix()],
            )?;
        }

        self.set_permission(founder, channel, Permission::SuperAdmin)?;
        Ok(true)
    }

    /// Delete a channel's row, permissions, and bans.
    pub fn drop_channel(&self, channel: &str) -> Result<()> {
        let key = Self::channel_key(channel);
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM channels WHERE channel = ?1", params![key])?;
        conn.execute("DELETE FROM permissions WHERE channel = ?1", params![key])?;
        conn.execute("DELETE FROM bans WHERE channel = ?1", params![key])?;
        Ok(())
    }

    pub fn set_topic(&self, channel: &str, topic: &str, topictime: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channels SET topic = ?1, topictime = ?2 WHERE channel = ?3",
            params![topic, topictime, Self::channel_key(channel)],
        )?;
        Ok(())
    }

    // ── Permissions ──────────────────────────────────────────────

    pub fn get_permission(&self, account: i64, channel: &str) -> Result<Permission> {
        if account == 0 {
            return Ok(Permission::Client);
        }

        let conn = self.conn.lock().unwrap();
        let permission: Option<i64> = conn
            .query_row(
                "SELECT permission FROM permissions WHERE account = ?1 AND channel = ?2",
                params![account, Self::channel_key(channel)],
                |row| row.get(0),
            )
            .optional()?;
        Ok(Permission::from_i64(permission.unwrap_or(0)))
    }

    pub fn set_permission(
        &self,
        account: i64,
        channel: &str,
        permission: Permission,
    ) -> Result<()> {
        let key = Self::channel_key(channel);
        let conn = self.conn.lock().unwrap();

        let exists: Option<i64> = conn
            .query_row(
                "SELECT permission FROM permissions WHERE account = ?1 AND channel = ?2",
                params![account, key],
                |row| row.get(0),
            )
            .optional()?;

        if exists.is_some() {
            conn.execute(
                "UPDATE permissions SET permission = ?1 WHERE account = ?2 AND channel = ?3",
                params![permission as i64, account, key],
            )?;
        } else {
            conn.execute(
                "INSERT INTO permissions (channel, account, permission) VALUES (?1, ?2, ?3)",
                params![key, account, permission as i64],
            )?;
        }

        Ok(())
    }

    /// Every (account, permission) pair recorded for a channel.
    pub fn list_permissions(&self, channel: &str) -> Result<Vec<(i64, Permission)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT account, permission FROM permissions WHERE channel = ?1 ORDER BY account",
        )?;
        let rows = stmt.query_map(params![Self::channel_key(channel)], |row| {
            Ok((row.get::<_, i64>(0)?, Permission::from_i64(row.get(1)?)))
        })?;
        rows.collect()
    }

    // ── Bans ─────────────────────────────────────────────────────

    pub fn add_ban(
        &self,
        channel: &str,
        ban_type: i64,
        target: &str,
        expires: i64,
        reason: &str,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO bans (channel, type, target, expires, reason) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![Self::channel_key(channel), ban_type, target, expires, reason],
        )?;
        Ok(())
    }

    /// First unexpired ban matching the client on `channel` or on the
    /// server sentinel; returns the ban reason (possibly empty).
    pub fn find_ban(&self, channel: &str, iphash: &str, account: i64) -> Result<Option<String>> {
        let now = now_unix();
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT type, target, expires, reason FROM bans WHERE channel = ?1 OR channel = ?2",
        )?;
        let rows = stmt.query_map(
            params![Self::channel_key(channel), Self::channel_key("&")],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                ))
            },
        )?;

        for row in rows {
            let (ban_type, target, expires, reason) = row?;
            if expires != 0 && expires <= now {
                continue;
            }
            let hit = match ban_type {
                BAN_TYPE_ADDRESS => target == iphash,
                BAN_TYPE_ACCOUNT => account > 0 && target == account.to_string(),
                _ => false,
            };
            if hit {
                return Ok(Some(reason));
            }
        }

        Ok(None)
    }
}
