/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Fermoposta, a self-hosted mail platform.
 *
 * Fermoposta is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Fermoposta is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Fermoposta.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Credential verification. Passwords are stored as an encoded scheme
//! string; the default scheme is PBKDF2-HMAC-SHA256 with a per-user random
//! salt. A legacy `plain` scheme survives for accounts that need APOP (the
//! digest requires a password equivalent; a one-way hash cannot serve it).
//!
//! Verification runs the same KDF work whether or not the username exists,
//! so the outcome timing does not reveal account presence.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use md5::{Digest, Md5};
use rand::RngCore;
use sha2::Sha256;
use tracing::{debug, warn};

use crate::store::MailStore;

const PBKDF2_ITERATIONS: u32 = 100_000;
const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;

/// Authenticated identity: the login username mapped to its mailbox address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub email: String,
}

/// Why a verification did not produce a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    /// Unknown user or wrong password; deliberately indistinguishable.
    BadCredentials,
    /// The stored scheme cannot serve this mechanism (APOP over PBKDF2).
    MechanismUnsupported,
    /// Account exists but is disabled.
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Allow(Principal),
    Deny(DenyReason),
}

impl AuthOutcome {
    pub fn principal(self) -> Option<Principal> {
        match self {
            AuthOutcome::Allow(p) => Some(p),
            AuthOutcome::Deny(_) => None,
        }
    }
}

/// Parsed password storage scheme.
#[derive(Debug, Clone)]
pub enum PasswordScheme {
    /// `pbkdf2-sha256$<iterations>$<salt-hex>$<hash-hex>`
    Pbkdf2Sha256 {
        iterations: u32,
        salt: Vec<u8>,
        hash: Vec<u8>,
    },
    /// `plain$<secret>` — legacy accounts only; required for APOP.
    Plain { secret: String },
}

impl PasswordScheme {
    /// Hash a password with the default scheme and a fresh salt. Returns
    /// the encoded string and the salt hex (stored in its own column too).
    pub fn hash_password(password: &str) -> (String, String) {
        let mut salt = [0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        let mut hash = [0u8; HASH_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut hash);
        let salt_hex = to_hex(&salt);
        let encoded = format!(
            "pbkdf2-sha256${}${}${}",
            PBKDF2_ITERATIONS,
            salt_hex,
            to_hex(&hash)
        );
        (encoded, salt_hex)
    }

    pub fn parse(encoded: &str) -> Option<Self> {
        if let Some(secret) = encoded.strip_prefix("plain$") {
            return Some(PasswordScheme::Plain {
                secret: secret.to_string(),
            });
        }
        let rest = encoded.strip_prefix("pbkdf2-sha256$")?;
        let mut parts = rest.splitn(3, '$');
        let iterations: u32 = parts.next()?.parse().ok()?;
        let salt = from_hex(parts.next()?)?;
        let hash = from_hex(parts.next()?)?;
        if iterations == 0 || salt.is_empty() || hash.is_empty() {
            return None;
        }
        Some(PasswordScheme::Pbkdf2Sha256 {
            iterations,
            salt,
            hash,
        })
    }

    /// Constant-time password check.
    pub fn verify(&self, password: &str) -> bool {
        match self {
            PasswordScheme::Pbkdf2Sha256 {
                iterations,
                salt,
                hash,
            } => {
                let mut derived = vec![0u8; hash.len().max(1)];
                pbkdf2::pbkdf2_hmac::<Sha256>(
                    password.as_bytes(),
                    salt,
                    *iterations,
                    &mut derived,
                );
                ct_eq(&derived, hash)
            }
            PasswordScheme::Plain { secret } => ct_eq(password.as_bytes(), secret.as_bytes()),
        }
    }

    /// The md5-usable password equivalent, when the scheme retains one.
    pub fn apop_secret(&self) -> Option<&str> {
        match self {
            PasswordScheme::Plain { secret } => Some(secret),
            PasswordScheme::Pbkdf2Sha256 { .. } => None,
        }
    }
}

/// Verifies credentials against the user table.
pub struct Authenticator {
    store: Arc<MailStore>,
}

impl Authenticator {
    pub fn new(store: Arc<MailStore>) -> Self {
        Self { store }
    }

    /// USER/PASS and AUTH verification. Unknown users burn the same KDF
    /// work as known ones before the deny.
    pub fn verify(&self, username: &str, password: &str) -> AuthOutcome {
        let user = match self.store.get_user(username) {
            Ok(u) => u,
            Err(e) => {
                warn!(username, error = %e, "user lookup failed");
                None
            }
        };
        let Some(user) = user else {
            self.burn_verification(password);
            return AuthOutcome::Deny(DenyReason::BadCredentials);
        };
        let Some(scheme) = PasswordScheme::parse(&user.password_hash) else {
            warn!(username, "unparseable password scheme");
            self.burn_verification(password);
            return AuthOutcome::Deny(DenyReason::BadCredentials);
        };
        if !scheme.verify(password) {
            return AuthOutcome::Deny(DenyReason::BadCredentials);
        }
        if !user.is_active {
            return AuthOutcome::Deny(DenyReason::Inactive);
        }
        if let Err(e) = self.store.touch_last_login(username) {
            warn!(username, error = %e, "last_login update failed");
        }
        debug!(username, "credentials verified");
        AuthOutcome::Allow(Principal {
            username: user.username,
            email: user.email,
        })
    }

    /// APOP: md5(nonce || password) compared against the client digest.
    /// Only possible when the stored scheme retains a password equivalent.
    pub fn verify_apop(&self, username: &str, nonce: &str, digest_hex: &str) -> AuthOutcome {
        let user = match self.store.get_user(username) {
            Ok(Some(u)) => u,
            Ok(None) => {
                self.burn_verification(digest_hex);
                return AuthOutcome::Deny(DenyReason::BadCredentials);
            }
            Err(e) => {
                warn!(username, error = %e, "user lookup failed");
                return AuthOutcome::Deny(DenyReason::BadCredentials);
            }
        };
        let Some(scheme) = PasswordScheme::parse(&user.password_hash) else {
            return AuthOutcome::Deny(DenyReason::BadCredentials);
        };
        let Some(secret) = scheme.apop_secret() else {
            return AuthOutcome::Deny(DenyReason::MechanismUnsupported);
        };
        let mut md5 = Md5::new();
        md5.update(nonce.as_bytes());
        md5.update(secret.as_bytes());
        let expected = to_hex(&md5.finalize());
        if !ct_eq(expected.as_bytes(), digest_hex.trim().to_lowercase().as_bytes()) {
            return AuthOutcome::Deny(DenyReason::BadCredentials);
        }
        if !user.is_active {
            return AuthOutcome::Deny(DenyReason::Inactive);
        }
        if let Err(e) = self.store.touch_last_login(username) {
            warn!(username, error = %e, "last_login update failed");
        }
        AuthOutcome::Allow(Principal {
            username: user.username,
            email: user.email,
        })
    }

    /// Same KDF cost as a real verification, against a throwaway salt.
    fn burn_verification(&self, password: &str) {
        let mut sink = [0u8; HASH_LEN];
        pbkdf2::pbkdf2_hmac::<Sha256>(
            password.as_bytes(),
            b"fermoposta.dummy.salt",
            PBKDF2_ITERATIONS,
            &mut sink,
        );
    }
}

/// APOP challenge: `<pid.clock.random@hostname>`, unique and unpredictable
/// per connection.
pub fn issue_apop_nonce(hostname: &str) -> String {
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let mut rnd = [0u8; 12];
    getrandom::getrandom(&mut rnd).expect("system entropy");
    format!(
        "<{}.{}.{}@{}>",
        std::process::id(),
        clock,
        to_hex(&rnd),
        hostname
    )
}

/// Compare without short-circuiting on the first mismatch.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn to_hex(bytes: &[u8]) -> String {
    const HEX: &[u8] = b"0123456789abcdef";
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX[(b >> 4) as usize] as char);
        s.push(HEX[(b & 15) as usize] as char);
    }
    s
}

fn from_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push(((hi << 4) | lo) as u8);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::store::UserRecord;
    use chrono::Utc;

    fn store_with_users() -> (tempfile::TempDir, Arc<MailStore>) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("mail.db"), dir.path().join("emails"));
        let store = Arc::new(MailStore::open(&config).unwrap());
        let (hash, salt) = PasswordScheme::hash_password("hunter2");
        store
            .create_user(&UserRecord {
                username: "alice".to_string(),
                email: "alice@example.org".to_string(),
                password_hash: hash,
                salt,
                is_active: true,
                created_at: Utc::now(),
                last_login: None,
            })
            .unwrap();
        store
            .create_user(&UserRecord {
                username: "legacy".to_string(),
                email: "legacy@example.org".to_string(),
                password_hash: "plain$tanstaaf".to_string(),
                salt: String::new(),
                is_active: true,
                created_at: Utc::now(),
                last_login: None,
            })
            .unwrap();
        (dir, store)
    }

    #[test]
    fn scheme_round_trip() {
        let (encoded, _salt) = PasswordScheme::hash_password("pw");
        let scheme = PasswordScheme::parse(&encoded).unwrap();
        assert!(scheme.verify("pw"));
        assert!(!scheme.verify("not-pw"));
        assert!(scheme.apop_secret().is_none());
    }

    #[test]
    fn verify_known_and_unknown_users() {
        let (_dir, store) = store_with_users();
        let auth = Authenticator::new(store);
        let allowed = auth.verify("alice", "hunter2");
        assert_eq!(
            allowed.principal().unwrap().email,
            "alice@example.org"
        );
        assert_eq!(
            auth.verify("alice", "wrong"),
            AuthOutcome::Deny(DenyReason::BadCredentials)
        );
        assert_eq!(
            auth.verify("nobody", "hunter2"),
            AuthOutcome::Deny(DenyReason::BadCredentials)
        );
    }

    #[test]
    fn apop_only_for_plain_scheme() {
        let (_dir, store) = store_with_users();
        let auth = Authenticator::new(store);
        let nonce = issue_apop_nonce("dbc.mtview.ca.us");

        let mut md5 = Md5::new();
        md5.update(nonce.as_bytes());
        md5.update(b"tanstaaf");
        let digest = to_hex(&md5.finalize());
        assert!(matches!(
            auth.verify_apop("legacy", &nonce, &digest),
            AuthOutcome::Allow(_)
        ));
        assert_eq!(
            auth.verify_apop("legacy", &nonce, "0000deadbeef"),
            AuthOutcome::Deny(DenyReason::BadCredentials)
        );
        // PBKDF2 user cannot do APOP regardless of digest.
        assert_eq!(
            auth.verify_apop("alice", &nonce, &digest),
            AuthOutcome::Deny(DenyReason::MechanismUnsupported)
        );
    }

    #[test]
    fn apop_nonce_is_unique_and_bracketed() {
        let a = issue_apop_nonce("h");
        let b = issue_apop_nonce("h");
        assert_ne!(a, b);
        assert!(a.starts_with('<') && a.ends_with("@h>"));
    }

    #[test]
    fn rfc1939_apop_example_digest() {
        // RFC 1939 §7: md5("<1896.697170952@dbc.mtview.ca.us>tanstaaf")
        let mut md5 = Md5::new();
        md5.update(b"<1896.697170952@dbc.mtview.ca.us>");
        md5.update(b"tanstaaf");
        assert_eq!(to_hex(&md5.finalize()), "c4c9334bac560ecc979e58001b3e22fb");
    }
}
