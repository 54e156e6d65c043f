//! Hashing, duration parsing, and other small helpers.
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use rand::Rng;
use sha3::{Digest, Sha3_512};

const IDENTIFIER_LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const IDENTIFIER_LENGTH: usize = 10;

/// Current unix time in seconds.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Current unix time in nanoseconds.
pub fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as i64
}

/// Random 10-character uppercase connection identifier.
pub fn random_identifier() -> String {
    let mut rng = rand::thread_rng();
    (0..IDENTIFIER_LENGTH)
        .map(|_| IDENTIFIER_LETTERS[rng.gen_range(0..IDENTIFIER_LETTERS.len())] as char)
        .collect()
}

/// Unsalted identity hash used for usernames and channel names in the store:
/// `base64url(sha3-512(s + "-" + md5hex(s) + "-" + s))`.
pub fn generate_hash(s: &str) -> String {
    let md5hex = format!("{:x}", md5::compute(s.as_bytes()));
    let mut hasher = Sha3_512::new();
    hasher.update(format!("{s}-{md5hex}-{s}"));
    URL_SAFE.encode(hasher.finalize())
}

/// Salted hash: `base64url(sha3-512(left + "-" + salt + "-" + right))`.
pub fn salted_hash(salt: &str, left: &str, right: &str) -> String {
    let mut hasher = Sha3_512::new();
    hasher.update(format!("{left}-{salt}-{right}"));
    URL_SAFE.encode(hasher.finalize())
}

/// Password hash stored in the accounts table.
pub fn hash_password(salt: &str, username: &str, password: &str) -> String {
    salted_hash(salt, username, password)
}

/// Salted digest of a client's address. Only this hash is ever logged
/// or persisted; the raw address is dropped once the client is built.
pub fn hash_address(salt: &str, address: &str) -> String {
    salted_hash(salt, address, address)
}

/// Mint an access token binding `account` to `channel`. The token is
/// stateless: `base64url(account ":" mac)` where the mac is a salted hash
/// over the pair, so it only verifies for the channel it was minted for.
pub fn make_token(salt: &str, account: i64, channel: &str) -> String {
    let mac = salted_hash(salt, &account.to_string(), &channel.to_lowercase());
    URL_SAFE.encode(format!("{account}:{mac}"))
}

/// Verify a token minted by [`make_token`], returning the account id.
pub fn parse_token(salt: &str, channel: &str, token: &str) -> Option<i64> {
    let raw = URL_SAFE.decode(token).ok()?;
    let raw = String::from_utf8(raw).ok()?;
    let (account, mac) = raw.split_once(':')?;
    let account: i64 = account.parse().ok()?;
    if mac == salted_hash(salt, &account.to_string(), &channel.to_lowercase()) {
        Some(account)
    } else {
        None
    }
}

/// Parse a ban duration into seconds. `0` means never expire. Any other
/// value must be `<value><unit>` with unit in s/m/h/d/w/y; everything
/// else is invalid and yields -1.
pub fn parse_duration(duration: &str) -> i64 {
    let duration = duration.trim();
    if let Ok(intval) = duration.parse::<i64>() {
        if intval == 0 {
            return 0; // Never expire
        }
    }

    if duration.len() < 2 {
        return -1; // Value and unit are required
    }

    let (sv, unit) = duration.split_at(duration.len() - 1);
    let value: i64 = match sv.parse() {
        Ok(v) if v >= 0 => v,
        _ => return -1,
    };

    match unit.to_lowercase().as_str() {
        "y" => value * 3600 * 24 * 365,
        "w" => value * 3600 * 24 * 7,
        "d" => value * 3600 * 24,
        "h" => value * 3600,
        "m" => value * 60,
        "s" => value,
        _ => -1,
    }
}

/// "Kicked" + optional reason -> "Kicked: reason".
pub fn format_action(action: &str, reason: &str) -> String {
    if reason.is_empty() {
        action.to_owned()
    } else {
        format!("{action}: {reason}")
    }
}

/// Sort a name -> count map by count, highest first. Ties break on name
/// so the output is deterministic.
pub fn sort_by_count(counts: HashMap<String, usize>) -> Vec<(String, usize)> {
    let mut pairs: Vec<(String, usize)> = counts.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_shape() {
        let id = random_identifier();
        assert_eq!(id.len(), 10);
        assert!(id.bytes().all(|b| b.is_ascii_uppercase()));
    }

    #[test]
    fn generate_hash_is_stable_and_urlsafe() {
        let h1 = generate_hash("admin");
        let h2 = generate_hash("admin");
        assert_eq!(h1, h2);
        assert_ne!(h1, generate_hash("Admin"));
        assert!(!h1.contains('+') && !h1.contains('/'));
    }

    #[test]
    fn password_hash_depends_on_all_parts() {
        let h = hash_password("salt", "admin", "password");
        assert_ne!(h, hash_password("salt", "admin", "password2"));
        assert_ne!(h, hash_password("salt2", "admin", "password"));
        assert_ne!(h, hash_password("salt", "admin2", "password"));
    }

    #[test]
    fn token_roundtrip() {
        let token = make_token("salt", 42, "#chan");
        assert_eq!(parse_token("salt", "#chan", &token), Some(42));
        assert_eq!(parse_token("salt", "#Chan", &token), Some(42));
        // A token is bound to its channel and salt.
        assert_eq!(parse_token("salt", "#other", &token), None);
        assert_eq!(parse_token("pepper", "#chan", &token), None);
        assert_eq!(parse_token("salt", "#chan", "garbage"), None);
    }

    #[test]
    fn duration_zero_never_expires() {
        assert_eq!(parse_duration("0"), 0);
    }

    #[test]
    fn duration_units() {
        assert_eq!(parse_duration("30s"), 30);
        assert_eq!(parse_duration("30m"), 30 * 60);
        assert_eq!(parse_duration("1h"), 3600);
        assert_eq!(parse_duration("2d"), 2 * 86400);
        assert_eq!(parse_duration("3w"), 3 * 7 * 86400);
        assert_eq!(parse_duration("1y"), 365 * 86400);
        assert_eq!(parse_duration(" 1h "), 3600);
    }

    #[test]
    fn duration_invalid() {
        assert_eq!(parse_duration(""), -1);
        assert_eq!(parse_duration("5"), -1);
        assert_eq!(parse_duration("h"), -1);
        assert_eq!(parse_duration("-1h"), -1);
        assert_eq!(parse_duration("1x"), -1);
        assert_eq!(parse_duration("soon"), -1);
    }

    #[test]
    fn sort_by_count_desc() {
        let mut counts = HashMap::new();
        counts.insert("#a".into(), 1);
        counts.insert("#b".into(), 3);
        counts.insert("#c".into(), 2);
        let sorted = sort_by_count(counts);
        assert_eq!(
            sorted,
            vec![("#b".into(), 3), ("#c".into(), 2), ("#a".into(), 1)]
        );
    }

    #[test]
    fn format_action_with_reason() {
        assert_eq!(format_action("Kicked", ""), "Kicked");
        assert_eq!(format_action("Banned", "spam"), "Banned: spam");
    }
}
