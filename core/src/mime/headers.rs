/*
 * headers.rs
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

//! Header scan over raw message bytes: split the header section, unfold
//! continuations, and pull out the fields the metadata rows need. The body
//! is never interpreted here.

use chrono::{DateTime, Utc};

use crate::mime::address::{parse_address, parse_address_list, Address};
use crate::mime::datetime::parse_rfc2822;
use crate::mime::rfc2047::decode_encoded_words;

/// Result of scanning a message's header section. Field names are kept in
/// received order; lookups are case-insensitive.
#[derive(Debug, Clone, Default)]
pub struct HeaderScan {
    fields: Vec<(String, String)>,
    header_len: usize,
}

impl HeaderScan {
    /// Scan raw message bytes. Accepts CRLF or bare LF line endings; the
    /// header section ends at the first empty line (or the end of input for
    /// a header-only fragment).
    pub fn scan(raw: &[u8]) -> Self {
        let mut fields: Vec<(String, String)> = Vec::new();
        let mut pos = 0;
        let mut header_len = raw.len();
        while pos < raw.len() {
            let line_end = raw[pos..]
                .iter()
                .position(|&b| b == b'\n')
                .map(|i| pos + i)
                .unwrap_or(raw.len());
            let mut line = &raw[pos..line_end];
            if line.ends_with(b"\r") {
                line = &line[..line.len() - 1];
            }
            let next = line_end.min(raw.len() - 1) + 1;
            if line.is_empty() {
                header_len = next.min(raw.len());
                break;
            }
            if (line[0] == b' ' || line[0] == b'\t') && !fields.is_empty() {
                // Folded continuation: unfold with a single space.
                let text = String::from_utf8_lossy(line).trim().to_string();
                if let Some(last) = fields.last_mut() {
                    if !last.1.is_empty() {
                        last.1.push(' ');
                    }
                    last.1.push_str(&text);
                }
            } else if let Some(colon) = line.iter().position(|&b| b == b':') {
                let name = String::from_utf8_lossy(&line[..colon]).trim().to_string();
                let value = String::from_utf8_lossy(&line[colon + 1..])
                    .trim()
                    .to_string();
                fields.push((name, value));
            }
            pos = next;
        }
        Self { fields, header_len }
    }

    /// Byte length of the header section including the blank separator.
    pub fn header_len(&self) -> usize {
        self.header_len
    }

    /// First value for `name`, raw (not RFC 2047 decoded).
    pub fn get_raw(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// First value for `name` with encoded-words expanded.
    pub fn get(&self, name: &str) -> Option<String> {
        self.get_raw(name).map(decode_encoded_words)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn subject(&self) -> String {
        self.get("Subject").unwrap_or_default()
    }

    pub fn from_address(&self) -> Option<Address> {
        self.get("From").and_then(|v| parse_address(&v))
    }

    pub fn to_addresses(&self) -> Vec<Address> {
        self.get("To")
            .map(|v| parse_address_list(&v))
            .unwrap_or_default()
    }

    pub fn date(&self) -> Option<DateTime<Utc>> {
        self.get_raw("Date").and_then(parse_rfc2822)
    }

    pub fn message_id(&self) -> Option<String> {
        self.get_raw("Message-ID")
            .and_then(crate::message_id::from_header_value)
    }

    /// The raw header text, reassembled for the metadata row's header blob.
    pub fn to_blob(&self) -> String {
        let mut out = String::new();
        for (name, value) in &self.fields {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"From: Alice <a@x.example>\r\n\
To: b@y.example, Carol <c@z.example>\r\n\
Subject: =?utf-8?B?Y2lhbw==?= mondo\r\n\
Date: Fri, 21 Nov 1997 09:55:06 -0600\r\n\
Message-ID: <42.abc@x.example>\r\n\
X-Folded: first\r\n\tsecond\r\n\
\r\n\
body line\r\n";

    #[test]
    fn scans_envelope_fields() {
        let scan = HeaderScan::scan(SAMPLE);
        assert_eq!(scan.subject(), "ciao mondo");
        assert_eq!(scan.from_address().unwrap().addr_spec(), "a@x.example");
        let to = scan.to_addresses();
        assert_eq!(to.len(), 2);
        assert_eq!(to[1].display_name.as_deref(), Some("Carol"));
        assert_eq!(scan.message_id().as_deref(), Some("<42.abc@x.example>"));
        assert!(scan.date().is_some());
    }

    #[test]
    fn unfolds_continuations() {
        let scan = HeaderScan::scan(SAMPLE);
        assert_eq!(scan.get_raw("x-folded"), Some("first second"));
    }

    #[test]
    fn header_len_points_past_separator() {
        let scan = HeaderScan::scan(SAMPLE);
        assert_eq!(&SAMPLE[scan.header_len()..], b"body line\r\n");
    }

    #[test]
    fn header_only_fragment() {
        let scan = HeaderScan::scan(b"Subject: top\r\nX-A: 1\r\n");
        assert_eq!(scan.subject(), "top");
        assert_eq!(scan.header_len(), 22);
    }
}
