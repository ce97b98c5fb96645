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

//! SMTP command grammar (RFC 5321 + 3207 + 4954), reply formatting, and the
//! response reader shared with the client engine.

mod client;
mod dot_stuffer;
mod server;

pub use client::{SmtpClient, SmtpClientError, SubmissionReport};
pub use dot_stuffer::DotStuffer;
pub(crate) use dot_stuffer::{CaptureOutcome, CaptureStatus, DataCapture};
pub use server::SmtpServer;

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::write_line;
use crate::sasl::SaslMechanism;

/// Command lines are capped at 512 octets excluding CRLF (RFC 5321
/// §4.5.3.1.4); DATA payload lines at 1000 including CRLF (§4.5.3.1.6).
pub(crate) const MAX_COMMAND_LINE: usize = 512;
pub(crate) const MAX_DATA_LINE: usize = 998;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SmtpCommand {
    Ehlo(String),
    Helo(String),
    StartTls,
    /// AUTH mechanism with optional initial response (base64).
    Auth {
        mechanism: Option<SaslMechanism>,
        initial: Option<String>,
    },
    /// MAIL FROM reverse-path (empty for the null sender) plus the declared
    /// SIZE parameter when present.
    MailFrom {
        path: String,
        declared_size: Option<u64>,
        bad_param: bool,
    },
    RcptTo {
        path: String,
    },
    Data,
    Rset,
    Noop,
    Quit,
    Vrfy,
    Expn,
    Help,
    Unknown(String),
}

/// Extract `<path>` from the remainder of MAIL FROM:/RCPT TO:. Empty
/// brackets are the null reverse-path. Returns (path, params_tail).
fn parse_path(rest: &str) -> Option<(String, &str)> {
    let rest = rest.trim_start();
    let open = rest.strip_prefix('<')?;
    let close = open.find('>')?;
    let path = open[..close].trim().to_string();
    Some((path, open[close + 1..].trim()))
}

impl SmtpCommand {
    pub(crate) fn parse(line: &str) -> SmtpCommand {
        let trimmed = line.trim();
        let (verb, rest) = match trimmed.split_once(|c: char| c.is_ascii_whitespace()) {
            Some((v, r)) => (v, r.trim()),
            None => (trimmed, ""),
        };
        match verb.to_ascii_uppercase().as_str() {
            "EHLO" => SmtpCommand::Ehlo(rest.to_string()),
            "HELO" => SmtpCommand::Helo(rest.to_string()),
            "STARTTLS" => SmtpCommand::StartTls,
            "AUTH" => {
                let mut words = rest.split_whitespace();
                let mechanism = words.next().and_then(SaslMechanism::from_name);
                let initial = words.next().map(|s| s.to_string());
                SmtpCommand::Auth { mechanism, initial }
            }
            "MAIL" => match strip_prefix_ci(rest, "FROM:") {
                Some(tail) => match parse_path(tail) {
                    Some((path, params)) => {
                        let (declared_size, bad_param) = parse_mail_params(params);
                        SmtpCommand::MailFrom {
                            path,
                            declared_size,
                            bad_param,
                        }
                    }
                    None => SmtpCommand::Unknown(trimmed.to_string()),
                },
                None => SmtpCommand::Unknown(trimmed.to_string()),
            },
            "RCPT" => match strip_prefix_ci(rest, "TO:") {
                Some(tail) => match parse_path(tail) {
                    Some((path, _)) => SmtpCommand::RcptTo { path },
                    None => SmtpCommand::Unknown(trimmed.to_string()),
                },
                None => SmtpCommand::Unknown(trimmed.to_string()),
            },
            "DATA" => SmtpCommand::Data,
            "RSET" => SmtpCommand::Rset,
            "NOOP" => SmtpCommand::Noop,
            "QUIT" => SmtpCommand::Quit,
            "VRFY" => SmtpCommand::Vrfy,
            "EXPN" => SmtpCommand::Expn,
            "HELP" => SmtpCommand::Help,
            _ => SmtpCommand::Unknown(trimmed.to_string()),
        }
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

/// Parse MAIL FROM esmtp parameters. SIZE is honored; BODY=7BIT/8BITMIME is
/// accepted and ignored; anything else flags a parameter error (501).
fn parse_mail_params(params: &str) -> (Option<u64>, bool) {
    let mut size = None;
    let mut bad = false;
    for word in params.split_whitespace() {
        let upper = word.to_ascii_uppercase();
        if let Some(v) = upper.strip_prefix("SIZE=") {
            match v.parse::<u64>() {
                Ok(n) => size = Some(n),
                Err(_) => bad = true,
            }
        } else if upper == "BODY=7BIT" || upper == "BODY=8BITMIME" {
            // accepted, no effect
        } else {
            bad = true;
        }
    }
    (size, bad)
}

/// Write a single-line reply: `CODE text` or `CODE X.Y.Z text`.
pub(crate) async fn reply<S>(stream: &mut S, code: u16, text: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_line(stream, &format!("{} {}", code, text)).await
}

/// Write a multiline reply: `CODE-line` for all but the last, `CODE line`.
pub(crate) async fn reply_multiline<S>(stream: &mut S, code: u16, lines: &[String]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    for (i, line) in lines.iter().enumerate() {
        let sep = if i + 1 == lines.len() { ' ' } else { '-' };
        write_line(stream, &format!("{}{}{}", code, sep, line)).await?;
    }
    Ok(())
}

/// Parsed server response (client side): code, optional enhanced status,
/// all text lines.
#[derive(Debug, Clone)]
pub(crate) struct SmtpResponse {
    pub code: u16,
    pub enhanced: Option<String>,
    pub lines: Vec<String>,
}

impl SmtpResponse {
    pub fn message(&self) -> &str {
        self.lines.last().map(|s| s.as_str()).unwrap_or("")
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    pub fn is_transient(&self) -> bool {
        (400..500).contains(&self.code)
    }
}

/// Looks like an RFC 3463 enhanced status code (X.Y.Z)?
fn split_enhanced(text: &str) -> (Option<String>, &str) {
    let mut it = text.splitn(2, ' ');
    let first = it.next().unwrap_or("");
    let rest = it.next().unwrap_or("");
    let mut parts = first.split('.');
    let is_esc = (0..3).all(|_| {
        parts
            .next()
            .map_or(false, |p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
    }) && parts.next().is_none();
    if is_esc {
        (Some(first.to_string()), rest)
    } else {
        (None, text)
    }
}

/// Read one (possibly multiline) SMTP response.
pub(crate) async fn read_response<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
) -> io::Result<SmtpResponse>
where
    S: AsyncRead + Unpin,
{
    let mut lines = Vec::new();
    let mut enhanced = None;
    loop {
        let line = match crate::protocol::read_line(stream, buf, MAX_COMMAND_LINE).await? {
            crate::protocol::Line::Ok(l) => l,
            crate::protocol::Line::TooLong => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "oversized reply line",
                ))
            }
            crate::protocol::Line::Closed => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed",
                ))
            }
        };
        if line.len() < 3 || !line[..3].bytes().all(|b| b.is_ascii_digit()) {
            continue; // tolerate garbage between reply lines
        }
        let code: u16 = line[..3].parse().unwrap_or(0);
        let continuation = line.as_bytes().get(3) == Some(&b'-');
        let text = line.get(4..).unwrap_or("").trim();
        let (esc, rest) = split_enhanced(text);
        if enhanced.is_none() {
            enhanced = esc;
        }
        lines.push(rest.to_string());
        if !continuation {
            return Ok(SmtpResponse {
                code,
                enhanced,
                lines,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_commands() {
        assert_eq!(
            SmtpCommand::parse("MAIL FROM:<a@x> SIZE=2048"),
            SmtpCommand::MailFrom {
                path: "a@x".to_string(),
                declared_size: Some(2048),
                bad_param: false,
            }
        );
        assert_eq!(
            SmtpCommand::parse("mail from:<>"),
            SmtpCommand::MailFrom {
                path: String::new(),
                declared_size: None,
                bad_param: false,
            }
        );
        assert_eq!(
            SmtpCommand::parse("RCPT TO:<b@y>"),
            SmtpCommand::RcptTo {
                path: "b@y".to_string()
            }
        );
        assert_eq!(SmtpCommand::parse("rcpt to:b@y"), SmtpCommand::Unknown("rcpt to:b@y".to_string()));
    }

    #[test]
    fn parses_auth_forms() {
        assert_eq!(
            SmtpCommand::parse("AUTH PLAIN AGEAYg=="),
            SmtpCommand::Auth {
                mechanism: Some(SaslMechanism::Plain),
                initial: Some("AGEAYg==".to_string()),
            }
        );
        assert_eq!(
            SmtpCommand::parse("AUTH LOGIN"),
            SmtpCommand::Auth {
                mechanism: Some(SaslMechanism::Login),
                initial: None,
            }
        );
        assert_eq!(
            SmtpCommand::parse("AUTH CRAM-MD5"),
            SmtpCommand::Auth {
                mechanism: None,
                initial: None,
            }
        );
    }

    #[test]
    fn unknown_mail_params_are_flagged() {
        match SmtpCommand::parse("MAIL FROM:<a@x> FOO=1") {
            SmtpCommand::MailFrom { bad_param, .. } => assert!(bad_param),
            other => panic!("unexpected {:?}", other),
        }
        match SmtpCommand::parse("MAIL FROM:<a@x> BODY=8BITMIME") {
            SmtpCommand::MailFrom { bad_param, .. } => assert!(!bad_param),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn multiline_reply_format() {
        let (mut a, mut b) = tokio::io::duplex(512);
        reply_multiline(
            &mut a,
            250,
            &["mail.example".to_string(), "SIZE 1000".to_string(), "OK".to_string()],
        )
        .await
        .unwrap();
        drop(a);
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut b, &mut buf).await.unwrap();
        assert_eq!(buf, b"250-mail.example\r\n250-SIZE 1000\r\n250 OK\r\n");
    }

    #[tokio::test]
    async fn response_reader_collects_enhanced_code() {
        let (mut a, mut b) = tokio::io::duplex(512);
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            a.write_all(b"250-first\r\n250 2.0.0 OK queued as <id@x>\r\n")
                .await
                .unwrap();
        });
        let mut buf = Vec::new();
        let r = read_response(&mut b, &mut buf).await.unwrap();
        assert_eq!(r.code, 250);
        assert_eq!(r.enhanced.as_deref(), Some("2.0.0"));
        assert_eq!(r.message(), "OK queued as <id@x>");
        assert!(r.is_success());
    }
}
