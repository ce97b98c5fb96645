/*
 * address.rs
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

//! RFC 5322 mailbox addresses: a conservative parser (display-name plus
//! angle-addr, or bare addr-spec) and the canonical formatter used in
//! headers and envelope paths.

use std::fmt;

/// Email address: optional display name, local part, domain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub display_name: Option<String>,
    pub local_part: String,
    pub domain: String,
}

/// Characters allowed in an unquoted local part (atext plus interior dots).
fn is_local_char(c: char) -> bool {
    c.is_ascii_alphanumeric()
        || matches!(
            c,
            '!' | '#' | '$' | '%' | '&' | '\'' | '*' | '+' | '-' | '/' | '=' | '?' | '^' | '_'
                | '`' | '{' | '|' | '}' | '~' | '.'
        )
}

fn is_valid_local_part(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && !s.contains("..")
        && s.chars().all(is_local_char)
}

fn is_valid_domain(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with('.')
        && !s.ends_with('.')
        && s.split('.').all(|label| {
            !label.is_empty()
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

impl Address {
    /// Build and validate. The grammar is deliberately conservative: dot-atom
    /// local parts only (no quoted-string locals on input we generate).
    pub fn new(
        display_name: Option<impl Into<String>>,
        local_part: impl Into<String>,
        domain: impl Into<String>,
    ) -> Option<Self> {
        let local_part = local_part.into();
        let domain = domain.into();
        if !is_valid_local_part(&local_part) || !is_valid_domain(&domain) {
            return None;
        }
        Some(Self {
            display_name: display_name.map(|s| s.into()).filter(|s: &String| !s.is_empty()),
            local_part,
            domain,
        })
    }

    /// `local@domain`, the envelope form.
    pub fn addr_spec(&self) -> String {
        format!("{}@{}", self.local_part, self.domain)
    }
}

/// Display-name tokens that survive without quoting.
fn name_needs_quoting(name: &str) -> bool {
    !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '.' | '-' | '_' | '\''))
}

impl fmt::Display for Address {
    /// Canonical header form: `"Name" <local@domain>` (name omitted when
    /// absent, quoted only when the grammar requires it).
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) if name_needs_quoting(name) => {
                let escaped = name.replace('\\', "\\\\").replace('"', "\\\"");
                write!(f, "\"{}\" <{}>", escaped, self.addr_spec())
            }
            Some(name) => write!(f, "{} <{}>", name, self.addr_spec()),
            None => write!(f, "<{}>", self.addr_spec()),
        }
    }
}

/// Parse a single mailbox: `Name <a@b>`, `"Name" <a@b>`, `<a@b>`, or `a@b`.
pub fn parse_address(input: &str) -> Option<Address> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Some(open) = input.rfind('<') {
        let close = input[open..].find('>')? + open;
        let spec = input[open + 1..close].trim();
        let name_raw = input[..open].trim();
        let name = strip_quotes(name_raw);
        let (local, domain) = split_spec(spec)?;
        return Address::new(
            if name.is_empty() { None } else { Some(name) },
            local,
            domain,
        );
    }
    let (local, domain) = split_spec(input)?;
    Address::new(None::<String>, local, domain)
}

fn strip_quotes(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
        s[1..s.len() - 1].replace("\\\"", "\"").replace("\\\\", "\\")
    } else {
        s.to_string()
    }
}

fn split_spec(spec: &str) -> Option<(&str, &str)> {
    let at = spec.rfind('@')?;
    Some((&spec[..at], &spec[at + 1..]))
}

/// Parse a comma-separated address list, skipping entries that do not parse.
/// Commas inside quoted display names are honored.
pub fn parse_address_list(input: &str) -> Vec<Address> {
    let mut out = Vec::new();
    let mut depth_quote = false;
    let mut start = 0;
    let bytes = input.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'"' => depth_quote = !depth_quote,
            b',' if !depth_quote => {
                if let Some(a) = parse_address(&input[start..i]) {
                    out.push(a);
                }
                start = i + 1;
            }
            _ => {}
        }
    }
    if start < input.len() {
        if let Some(a) = parse_address(&input[start..]) {
            out.push(a);
        }
    }
    out
}

/// Join addresses for a header value.
pub fn format_address_list(addrs: &[Address]) -> String {
    addrs
        .iter()
        .map(|a| a.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_bare_and_bracketed() {
        let a = parse_address("a@x.example").unwrap();
        assert_eq!(a.addr_spec(), "a@x.example");
        assert!(a.display_name.is_none());

        let b = parse_address("Bob Smith <bob@y.example>").unwrap();
        assert_eq!(b.display_name.as_deref(), Some("Bob Smith"));
        assert_eq!(b.addr_spec(), "bob@y.example");

        let c = parse_address("\"Smith, Bob\" <bob@y.example>").unwrap();
        assert_eq!(c.display_name.as_deref(), Some("Smith, Bob"));
    }

    #[test]
    fn rejects_invalid() {
        assert!(parse_address("no-at-sign").is_none());
        assert!(parse_address("a b@x.example").is_none());
        assert!(parse_address("a@").is_none());
        assert!(parse_address("..a@x.example").is_none());
    }

    #[test]
    fn display_quotes_when_needed() {
        let plain = Address::new(Some("Bob Smith"), "bob", "y.example").unwrap();
        assert_eq!(plain.to_string(), "Bob Smith <bob@y.example>");
        let comma = Address::new(Some("Smith, Bob"), "bob", "y.example").unwrap();
        assert_eq!(comma.to_string(), "\"Smith, Bob\" <bob@y.example>");
        let bare = Address::new(None::<&str>, "bob", "y.example").unwrap();
        assert_eq!(bare.to_string(), "<bob@y.example>");
    }

    #[test]
    fn list_splits_outside_quotes() {
        let list = parse_address_list("\"Doe, Jane\" <jane@x.example>, bob@y.example");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].display_name.as_deref(), Some("Doe, Jane"));
        assert_eq!(list[1].addr_spec(), "bob@y.example");
    }

    #[test]
    fn round_trip_through_formatter() {
        let list = parse_address_list("A <a@x.example>, <b@y.example>");
        let formatted = format_address_list(&list);
        assert_eq!(parse_address_list(&formatted), list);
    }
}
