/*
 * rfc2047.rs
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

//! RFC 2047 encoded-words: decode for header scanning, B-encode for header
//! building. Charsets are decoded as UTF-8 with lossy fallback; no charset
//! table beyond that.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Expand every `=?charset?enc?payload?=` token in a header value. Literal
/// text between tokens passes through; whitespace between two adjacent
/// encoded words is swallowed per the RFC.
pub fn decode_encoded_words(value: &str) -> String {
    let mut out = String::new();
    let mut rest = value;
    let mut last_was_encoded = false;
    let mut pending_ws = String::new();
    while let Some(start) = rest.find("=?") {
        let literal = &rest[..start];
        if !literal.trim().is_empty() || !last_was_encoded {
            out.push_str(&pending_ws);
            out.push_str(literal);
        }
        pending_ws.clear();
        match decode_one(&rest[start..]) {
            Some((decoded, consumed)) => {
                out.push_str(&decoded);
                rest = &rest[start + consumed..];
                // Remember whitespace so a following literal keeps it.
                let ws_len = rest.len() - rest.trim_start().len();
                pending_ws = rest[..ws_len].to_string();
                rest = &rest[ws_len..];
                last_was_encoded = true;
            }
            None => {
                out.push_str("=?");
                rest = &rest[start + 2..];
                last_was_encoded = false;
            }
        }
    }
    if !rest.is_empty() {
        out.push_str(&pending_ws);
        out.push_str(rest);
    }
    out
}

/// Decode one encoded word at the start of `s`; returns (text, bytes consumed).
fn decode_one(s: &str) -> Option<(String, usize)> {
    let body = s.strip_prefix("=?")?;
    let q1 = body.find('?')?;
    let charset = &body[..q1];
    let rest = &body[q1 + 1..];
    let q2 = rest.find('?')?;
    let encoding = &rest[..q2];
    let payload_and_tail = &rest[q2 + 1..];
    let end = payload_and_tail.find("?=")?;
    let payload = &payload_and_tail[..end];
    if charset.is_empty() || payload.contains(' ') {
        return None;
    }
    let raw = match encoding {
        "B" | "b" => BASE64.decode(payload).ok()?,
        "Q" | "q" => decode_q(payload),
        _ => return None,
    };
    let consumed = 2 + q1 + 1 + q2 + 1 + end + 2;
    Some((String::from_utf8_lossy(&raw).into_owned(), consumed))
}

fn decode_q(payload: &str) -> Vec<u8> {
    let bytes = payload.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' if i + 2 < bytes.len() => {
                let hex = |b: u8| (b as char).to_digit(16);
                if let (Some(hi), Some(lo)) = (hex(bytes[i + 1]), hex(bytes[i + 2])) {
                    out.push(((hi << 4) | lo) as u8);
                    i += 3;
                    continue;
                }
                out.push(b'=');
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

/// B-encode a header value when it is not printable ASCII; pass it through
/// unchanged otherwise. Used when building messages.
pub fn encode_header_value(value: &str) -> String {
    if value
        .chars()
        .all(|c| (' '..='\u{7e}').contains(&c))
    {
        return value.to_string();
    }
    format!("=?utf-8?B?{}?=", BASE64.encode(value.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_passes_through() {
        assert_eq!(decode_encoded_words("hello world"), "hello world");
    }

    #[test]
    fn decodes_b_and_q() {
        assert_eq!(
            decode_encoded_words("=?utf-8?B?Y2lhbyBtb25kbw==?="),
            "ciao mondo"
        );
        assert_eq!(
            decode_encoded_words("=?iso-8859-1?Q?caff=C3=A8_doppio?="),
            "caffè doppio"
        );
    }

    #[test]
    fn whitespace_between_encoded_words_is_swallowed() {
        assert_eq!(
            decode_encoded_words("=?utf-8?B?YWI=?= =?utf-8?B?Y2Q=?="),
            "abcd"
        );
        assert_eq!(
            decode_encoded_words("=?utf-8?B?YWI=?= tail"),
            "ab tail"
        );
    }

    #[test]
    fn malformed_tokens_stay_literal() {
        assert_eq!(decode_encoded_words("=?broken"), "=?broken");
        assert_eq!(decode_encoded_words("x =? y"), "x =? y");
    }

    #[test]
    fn encode_round_trips_non_ascii() {
        let encoded = encode_header_value("Pésto & Co");
        assert!(encoded.starts_with("=?utf-8?B?"));
        assert_eq!(decode_encoded_words(&encoded), "Pésto & Co");
        assert_eq!(encode_header_value("plain"), "plain");
    }
}
