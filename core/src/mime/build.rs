/*
 * build.rs
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

//! Assemble RFC 5322 / MIME bytes from a structured Message: headers, then
//! text/plain, multipart/alternative, or multipart/mixed with base64
//! attachment parts. CRLF throughout.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;

use crate::message_id;
use crate::mime::address::format_address_list;
use crate::mime::datetime::format_rfc2822;
use crate::mime::rfc2047::encode_header_value;
use crate::mime::{Disposition, Message};

/// Build wire bytes for `message`. A missing message-id or date is filled
/// in (the id from `domain`); the generated id is also returned so the
/// caller can persist a matching record. Bcc recipients are deliberately
/// not written into the headers.
pub fn build_message(message: &Message, domain: &str) -> (Vec<u8>, String) {
    let msg_id = if message.message_id.is_empty() {
        message_id::generate(domain)
    } else {
        message.message_id.clone()
    };
    let date = message.date.unwrap_or_else(Utc::now);

    let mut out = Vec::new();
    if let Some(from) = &message.from {
        append_header(&mut out, "From", &from.to_string());
    }
    if !message.to.is_empty() {
        append_header(&mut out, "To", &format_address_list(&message.to));
    }
    if !message.cc.is_empty() {
        append_header(&mut out, "Cc", &format_address_list(&message.cc));
    }
    if !message.subject.is_empty() {
        append_header(&mut out, "Subject", &encode_header_value(&message.subject));
    }
    append_header(&mut out, "Date", &format_rfc2822(date));
    append_header(&mut out, "Message-ID", &msg_id);
    if let Some(parent) = &message.in_reply_to {
        append_header(&mut out, "In-Reply-To", parent);
    }
    if !message.references.is_empty() {
        append_header(&mut out, "References", &message.references.join(" "));
    }
    for (name, value) in &message.headers {
        append_header(&mut out, name, value);
    }
    append_header(&mut out, "MIME-Version", "1.0");

    if message.attachments.is_empty() {
        append_body(&mut out, message);
    } else {
        let boundary = fresh_boundary("mixed");
        append_header(
            &mut out,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{}\"", boundary),
        );
        out.extend_from_slice(b"\r\n");
        open_part(&mut out, &boundary);
        append_body(&mut out, message);
        for att in &message.attachments {
            open_part(&mut out, &boundary);
            append_header(&mut out, "Content-Type", &att.content_type);
            let disposition = match att.disposition {
                Disposition::Inline => "inline",
                Disposition::Attachment => "attachment",
            };
            append_header(
                &mut out,
                "Content-Disposition",
                &format!(
                    "{}; filename=\"{}\"",
                    disposition,
                    att.filename.replace('\\', "\\\\").replace('"', "\\\"")
                ),
            );
            if let Some(cid) = &att.content_id {
                append_header(&mut out, "Content-ID", cid);
            }
            append_header(&mut out, "Content-Transfer-Encoding", "base64");
            out.extend_from_slice(b"\r\n");
            let encoded = BASE64.encode(&att.bytes);
            for chunk in encoded.as_bytes().chunks(76) {
                out.extend_from_slice(chunk);
                out.extend_from_slice(b"\r\n");
            }
        }
        close_parts(&mut out, &boundary);
    }
    (out, msg_id)
}

fn append_header(out: &mut Vec<u8>, name: &str, value: &str) {
    out.extend_from_slice(name.as_bytes());
    out.extend_from_slice(b": ");
    out.extend_from_slice(value.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn open_part(out: &mut Vec<u8>, boundary: &str) {
    out.extend_from_slice(b"--");
    out.extend_from_slice(boundary.as_bytes());
    out.extend_from_slice(b"\r\n");
}

fn close_parts(out: &mut Vec<u8>, boundary: &str) {
    out.extend_from_slice(b"--");
    out.extend_from_slice(boundary.as_bytes());
    out.extend_from_slice(b"--\r\n");
}

fn fresh_boundary(tag: &str) -> String {
    let mut rnd = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut rnd);
    format!(
        "_{}_{}_{:016x}",
        tag,
        std::process::id(),
        u64::from_be_bytes(rnd)
    )
}

/// Body section: text/plain, text/html, or multipart/alternative with both.
fn append_body(out: &mut Vec<u8>, message: &Message) {
    let text = message.text_body.as_deref().filter(|s| !s.is_empty());
    let html = message.html_body.as_deref().filter(|s| !s.is_empty());
    match (text, html) {
        (Some(t), Some(h)) => {
            let boundary = fresh_boundary("alt");
            append_header(
                out,
                "Content-Type",
                &format!("multipart/alternative; boundary=\"{}\"", boundary),
            );
            out.extend_from_slice(b"\r\n");
            open_part(out, &boundary);
            append_text_part(out, "text/plain; charset=utf-8", t);
            open_part(out, &boundary);
            append_text_part(out, "text/html; charset=utf-8", h);
            close_parts(out, &boundary);
        }
        (None, Some(h)) => {
            append_text_part(out, "text/html; charset=utf-8", h);
        }
        (text, None) => {
            append_text_part(out, "text/plain; charset=utf-8", text.unwrap_or(""));
        }
    }
}

fn append_text_part(out: &mut Vec<u8>, content_type: &str, body: &str) {
    append_header(out, "Content-Type", content_type);
    out.extend_from_slice(b"\r\n");
    for line in body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        out.extend_from_slice(line.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mime::{Address, Attachment, HeaderScan};

    fn base_message() -> Message {
        Message {
            subject: "saluti".to_string(),
            from: Address::new(Some("Alice"), "alice", "x.example"),
            to: vec![Address::new(None::<&str>, "bob", "y.example").unwrap()],
            text_body: Some("hello\nthere".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn simple_message_scans_back() {
        let (bytes, id) = build_message(&base_message(), "x.example");
        assert!(crate::message_id::is_valid(&id));
        let scan = HeaderScan::scan(&bytes);
        assert_eq!(scan.subject(), "saluti");
        assert_eq!(scan.from_address().unwrap().addr_spec(), "alice@x.example");
        assert_eq!(scan.message_id().as_deref(), Some(id.as_str()));
        assert!(scan.get_raw("Bcc").is_none());
        let body = &bytes[scan.header_len()..];
        assert_eq!(body, b"hello\r\nthere\r\n");
    }

    #[test]
    fn explicit_id_is_preserved() {
        let mut m = base_message();
        m.message_id = "<keep.1@x.example>".to_string();
        let (_, id) = build_message(&m, "x.example");
        assert_eq!(id, "<keep.1@x.example>");
    }

    #[test]
    fn crlf_only_line_endings() {
        let (bytes, _) = build_message(&base_message(), "x.example");
        let mut i = 0;
        while let Some(j) = bytes[i..].iter().position(|&b| b == b'\n') {
            assert_eq!(bytes[i + j - 1], b'\r', "LF without CR at {}", i + j);
            i += j + 1;
        }
    }

    #[test]
    fn attachments_build_multipart_mixed() {
        let mut m = base_message();
        m.attachments.push(Attachment {
            filename: "ricevuta.pdf".to_string(),
            content_type: "application/pdf".to_string(),
            bytes: vec![1, 2, 3, 4],
            content_id: None,
            disposition: Disposition::Attachment,
        });
        let (bytes, _) = build_message(&m, "x.example");
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("multipart/mixed"));
        assert!(text.contains("filename=\"ricevuta.pdf\""));
        assert!(text.contains("Content-Transfer-Encoding: base64"));
        assert!(text.contains(&BASE64.encode([1u8, 2, 3, 4])));
    }
}
