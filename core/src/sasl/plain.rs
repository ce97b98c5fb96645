/*
 * plain.rs
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

//! PLAIN SASL (RFC 4616): NUL authzid NUL authcid NUL password.

use super::SaslError;

/// Build the PLAIN initial response. Caller base64-encodes for the wire.
pub fn encode_plain(authzid: &str, authcid: &str, password: &str) -> Vec<u8> {
    format!("\0{}\0{}\0{}", authzid, authcid, password).into_bytes()
}

/// Server side: split a decoded PLAIN payload into (authzid, authcid, password).
pub fn decode_plain(raw: &[u8]) -> Result<(String, String, String), SaslError> {
    let mut parts = raw.splitn(3, |&b| b == 0);
    let authzid = parts.next();
    let authcid = parts.next();
    let password = parts.next();
    match (authzid, authcid, password) {
        (Some(z), Some(c), Some(p)) => {
            let z = String::from_utf8(z.to_vec())
                .map_err(|_| SaslError::invalid("PLAIN authzid not UTF-8"))?;
            let c = String::from_utf8(c.to_vec())
                .map_err(|_| SaslError::invalid("PLAIN authcid not UTF-8"))?;
            let p = String::from_utf8(p.to_vec())
                .map_err(|_| SaslError::invalid("PLAIN password not UTF-8"))?;
            if c.is_empty() {
                return Err(SaslError::invalid("PLAIN authcid empty"));
            }
            Ok((z, c, p))
        }
        _ => Err(SaslError::invalid("PLAIN payload needs two NUL separators")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let raw = encode_plain("", "user", "s3cret");
        let (z, c, p) = decode_plain(&raw).unwrap();
        assert_eq!(z, "");
        assert_eq!(c, "user");
        assert_eq!(p, "s3cret");
    }

    #[test]
    fn password_may_contain_separator_text() {
        let raw = encode_plain("admin", "user", "pa\u{1}ss");
        let (z, c, p) = decode_plain(&raw).unwrap();
        assert_eq!((z.as_str(), c.as_str(), p.as_str()), ("admin", "user", "pa\u{1}ss"));
    }

    #[test]
    fn rejects_missing_separators() {
        assert!(decode_plain(b"no separators").is_err());
        assert!(decode_plain(b"\0only-one").is_err());
        assert!(decode_plain(b"\0\0empty-authcid").is_err());
    }
}
