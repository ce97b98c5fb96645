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

//! SASL PLAIN and LOGIN, both directions: the client engines build initial
//! responses and answer challenges; the SMTP server decodes them.

mod mechanism;
mod plain;

pub use mechanism::SaslMechanism;
pub use plain::{decode_plain, encode_plain};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// LOGIN challenge payloads, base64 of "Username:" and "Password:".
pub const LOGIN_USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
pub const LOGIN_PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

#[derive(Debug)]
pub struct SaslError {
    pub message: String,
}

impl SaslError {
    pub fn invalid(msg: &str) -> Self {
        Self {
            message: msg.to_string(),
        }
    }
}

impl std::fmt::Display for SaslError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SaslError {}

/// Base64 for the wire (RFC 4954 / RFC 5034 use standard alphabet with padding).
pub fn b64_encode(raw: &[u8]) -> String {
    BASE64.encode(raw)
}

pub fn b64_decode(encoded: &str) -> Result<Vec<u8>, SaslError> {
    BASE64
        .decode(encoded.trim())
        .map_err(|_| SaslError::invalid("invalid base64"))
}

/// Client side of LOGIN: answer the "Username:" / "Password:" prompts.
pub fn login_respond_to_challenge(
    challenge_b64: &str,
    authcid: &str,
    password: &str,
) -> Result<String, SaslError> {
    let decoded = b64_decode(challenge_b64)?;
    let prompt = String::from_utf8_lossy(&decoded).to_lowercase();
    if prompt.contains("username") {
        Ok(b64_encode(authcid.as_bytes()))
    } else if prompt.contains("password") {
        Ok(b64_encode(password.as_bytes()))
    } else {
        Err(SaslError::invalid("unexpected LOGIN challenge"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn login_challenges_are_the_prompts() {
        assert_eq!(b64_decode(LOGIN_USERNAME_CHALLENGE).unwrap(), b"Username:");
        assert_eq!(b64_decode(LOGIN_PASSWORD_CHALLENGE).unwrap(), b"Password:");
    }

    #[test]
    fn login_client_answers_prompts() {
        let u = login_respond_to_challenge(LOGIN_USERNAME_CHALLENGE, "alice", "pw").unwrap();
        assert_eq!(b64_decode(&u).unwrap(), b"alice");
        let p = login_respond_to_challenge(LOGIN_PASSWORD_CHALLENGE, "alice", "pw").unwrap();
        assert_eq!(b64_decode(&p).unwrap(), b"pw");
        assert!(login_respond_to_challenge(&b64_encode(b"what?"), "a", "b").is_err());
    }
}
