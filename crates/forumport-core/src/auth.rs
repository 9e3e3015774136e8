//! Imported password hashes.
//!
//! Source users keep their stored hash; the target verifies it on first login
//! with [`LegacyPassword::verify`] and may then rehash with its own scheme.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// Name under which imported hashes are stored on the target.
pub const LEGACY_AUTH_SCHEME: &str = "forumport:woltlab";

/// A source password hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum LegacyPassword {
    /// `wcf1:<hash>:<salt>`: `sha1(salt + sha1(salt + sha1(password)))`.
    Wcf1 { hash: String, salt: String },
    /// Any other stored form, usually a double `crypt()` hash.
    Crypt { hash: String },
}

impl LegacyPassword {
    /// Interpret the stored password column. `None` when empty.
    pub fn parse(stored: &str) -> Option<Self> {
        let stored = stored.trim();
        if stored.is_empty() {
            return None;
        }
        let wcf1 = stored
            .strip_prefix("wcf1:")
            .and_then(|rest| rest.split_once(':'))
            .filter(|(hash, salt)| is_sha1_hex(hash) && is_sha1_hex(salt));
        Some(match wcf1 {
            Some((hash, salt)) => LegacyPassword::Wcf1 {
                hash: hash.to_string(),
                salt: salt.to_string(),
            },
            None => LegacyPassword::Crypt {
                hash: stored.to_string(),
            },
        })
    }

    /// Check a login attempt against the stored hash.
    ///
    /// `crypt()` hashes cannot be verified here and always fail, so those
    /// users have to reset their password.
    pub fn verify(&self, password: &str) -> bool {
        if password.is_empty() {
            return false;
        }
        match self {
            LegacyPassword::Wcf1 { hash, salt } => {
                let inner = sha1_hex(password);
                let middle = sha1_hex(&format!("{salt}{inner}"));
                let outer = sha1_hex(&format!("{salt}{middle}"));
                outer == *hash
            }
            LegacyPassword::Crypt { .. } => false,
        }
    }
}

fn is_sha1_hex(value: &str) -> bool {
    value.len() == 40
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn sha1_hex(input: &str) -> String {
    hex::encode(Sha1::digest(input.as_bytes()))
}
