/*
 * message_id.rs
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

//! RFC 5322 message identifiers: generation, grammar validation, and the
//! UIDL-safe form used by POP3 (RFC 1939 restricts unique-ids to 1..70
//! printable ASCII characters, no space).

use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;

/// Generate a globally unique msg-id: `<timestamp.random.pid@domain>`.
pub fn generate(domain: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros())
        .unwrap_or(0);
    let mut rnd = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut rnd);
    let pid = std::process::id();
    format!("<{}.{:016x}.{}@{}>", ts, u64::from_be_bytes(rnd), pid, domain)
}

/// True if `c` is an atext character (RFC 5322, dot added since dot-atom
/// allows interior dots and we validate id-left/id-right as a whole).
fn is_dot_atom_char(c: u8) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'/'
                | b'='
                | b'?'
                | b'^'
                | b'_'
                | b'`'
                | b'{'
                | b'|'
                | b'}'
                | b'~'
                | b'.'
        )
}

fn is_dot_atom(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && !s.contains("..")
        && s.bytes().all(is_dot_atom_char)
}

/// Validate against the conservative msg-id grammar: angle brackets around
/// `id-left@id-right`, both sides dot-atoms.
pub fn is_valid(msg_id: &str) -> bool {
    let inner = match msg_id.strip_prefix('<').and_then(|s| s.strip_suffix('>')) {
        Some(i) => i,
        None => return false,
    };
    let (left, right) = match inner.split_once('@') {
        Some(p) => p,
        None => return false,
    };
    is_dot_atom(left) && is_dot_atom(right)
}

/// Extract the first msg-id token from a header value, normalized to the
/// bracketed form. Returns None when no valid id is present.
pub fn from_header_value(value: &str) -> Option<String> {
    let value = value.trim();
    let candidate = if let Some(start) = value.find('<') {
        let end = value[start..].find('>')? + start;
        value[start..=end].to_string()
    } else {
        format!("<{}>", value)
    };
    if is_valid(&candidate) {
        Some(candidate)
    } else {
        None
    }
}

/// UIDL-safe form of a message-id: angle brackets stripped, any octet
/// outside 0x21..=0x7E replaced with '-', truncated to 70 characters.
pub fn uidl_form(msg_id: &str) -> String {
    let inner = msg_id
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .unwrap_or(msg_id);
    let mut out: String = inner
        .chars()
        .map(|c| {
            if ('\u{21}'..='\u{7e}').contains(&c) {
                c
            } else {
                '-'
            }
        })
        .collect();
    out.truncate(70);
    if out.is_empty() {
        out.push('-');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_id_is_valid_and_unique() {
        let a = generate("mail.example.org");
        let b = generate("mail.example.org");
        assert!(is_valid(&a), "{}", a);
        assert!(is_valid(&b), "{}", b);
        assert_ne!(a, b);
        assert!(a.ends_with("@mail.example.org>"));
    }

    #[test]
    fn grammar_rejects_malformed() {
        assert!(!is_valid("no-brackets@example.org"));
        assert!(!is_valid("<no-at-sign>"));
        assert!(!is_valid("<a b@example.org>"));
        assert!(!is_valid("<..dots@example.org>"));
        assert!(!is_valid("<>"));
        assert!(is_valid("<1712.abc.42@host.example>"));
    }

    #[test]
    fn header_value_extraction() {
        assert_eq!(
            from_header_value(" <x.1@h> ").as_deref(),
            Some("<x.1@h>")
        );
        assert_eq!(from_header_value("x.1@h").as_deref(), Some("<x.1@h>"));
        assert_eq!(from_header_value("not an id"), None);
    }

    #[test]
    fn uidl_form_is_grammar_safe() {
        let u = uidl_form("<abc def\u{7f}@example>");
        assert!(!u.contains(' '));
        assert!(u.chars().all(|c| ('\u{21}'..='\u{7e}').contains(&c)));
        let long = uidl_form(&format!("<{}@x>", "a".repeat(100)));
        assert!(long.len() <= 70);
    }
}
