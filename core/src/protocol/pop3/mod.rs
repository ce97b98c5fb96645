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

//! POP3 command grammar (RFC 1939 + CAPA per RFC 2449 + STLS per RFC 2595)
//! and the status/multiline response helpers shared by both sides.

mod client;
mod server;

pub use client::{Pop3Client, Pop3ClientError, Pop3ClientSession, RetrieveFilter};
pub use server::Pop3Server;

use std::io;

use tokio::io::AsyncWrite;

use crate::protocol::write_line;

pub(crate) const MAX_POP3_LINE: usize = 512;

/// A parsed client command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Pop3Command {
    User(String),
    Pass(String),
    Apop { user: String, digest: String },
    Stls,
    Capa,
    Stat,
    List(Option<u32>),
    Uidl(Option<u32>),
    Retr(u32),
    Top(u32, u32),
    Dele(u32),
    Rset,
    Noop,
    Quit,
    /// Known verb, unusable arguments.
    Malformed(&'static str),
    Unknown(String),
}

fn msg_number(arg: Option<&str>) -> Option<u32> {
    arg.and_then(|s| s.parse::<u32>().ok()).filter(|&n| n > 0)
}

impl Pop3Command {
    pub(crate) fn parse(line: &str) -> Pop3Command {
        let trimmed = line.trim();
        let mut words = trimmed.split_whitespace();
        let verb = words.next().unwrap_or("").to_ascii_uppercase();
        let arg1 = words.next();
        let arg2 = words.next();
        match verb.as_str() {
            "USER" => match arg1 {
                Some(name) => Pop3Command::User(name.to_string()),
                None => Pop3Command::Malformed("USER"),
            },
            "PASS" => {
                // The password is everything after the verb, spaces included.
                match trimmed.split_once(|c: char| c.is_ascii_whitespace()) {
                    Some((_, pass)) => Pop3Command::Pass(pass.to_string()),
                    None => Pop3Command::Malformed("PASS"),
                }
            }
            "APOP" => match (arg1, arg2) {
                (Some(user), Some(digest)) => Pop3Command::Apop {
                    user: user.to_string(),
                    digest: digest.to_string(),
                },
                _ => Pop3Command::Malformed("APOP"),
            },
            "STLS" => Pop3Command::Stls,
            "CAPA" => Pop3Command::Capa,
            "STAT" => Pop3Command::Stat,
            "LIST" => match arg1 {
                None => Pop3Command::List(None),
                Some(_) => match msg_number(arg1) {
                    Some(n) => Pop3Command::List(Some(n)),
                    None => Pop3Command::Malformed("LIST"),
                },
            },
            "UIDL" => match arg1 {
                None => Pop3Command::Uidl(None),
                Some(_) => match msg_number(arg1) {
                    Some(n) => Pop3Command::Uidl(Some(n)),
                    None => Pop3Command::Malformed("UIDL"),
                },
            },
            "RETR" => match msg_number(arg1) {
                Some(n) => Pop3Command::Retr(n),
                None => Pop3Command::Malformed("RETR"),
            },
            "TOP" => match (msg_number(arg1), arg2.and_then(|s| s.parse::<u32>().ok())) {
                (Some(n), Some(k)) => Pop3Command::Top(n, k),
                _ => Pop3Command::Malformed("TOP"),
            },
            "DELE" => match msg_number(arg1) {
                Some(n) => Pop3Command::Dele(n),
                None => Pop3Command::Malformed("DELE"),
            },
            "RSET" => Pop3Command::Rset,
            "NOOP" => Pop3Command::Noop,
            "QUIT" => Pop3Command::Quit,
            _ => Pop3Command::Unknown(trimmed.to_string()),
        }
    }
}

/// `+OK text`
pub(crate) async fn ok<S>(stream: &mut S, text: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if text.is_empty() {
        write_line(stream, "+OK").await
    } else {
        write_line(stream, &format!("+OK {}", text)).await
    }
}

/// `-ERR text`
pub(crate) async fn err<S>(stream: &mut S, text: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_line(stream, &format!("-ERR {}", text)).await
}

/// Write message bytes as a dot-stuffed multiline body terminated by `.`.
/// `body_line_cap` limits the number of lines written after the header/body
/// blank line (TOP); None streams everything (RETR).
pub(crate) async fn write_body<S>(
    stream: &mut S,
    bytes: &[u8],
    body_line_cap: Option<usize>,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    use tokio::io::AsyncWriteExt;

    let mut out: Vec<u8> = Vec::with_capacity(bytes.len() + 64);
    let mut in_body = false;
    let mut body_lines = 0usize;
    for raw_line in bytes.split(|&b| b == b'\n') {
        let line = raw_line.strip_suffix(b"\r").unwrap_or(raw_line);
        if in_body {
            if let Some(cap) = body_line_cap {
                if body_lines >= cap {
                    break;
                }
            }
            body_lines += 1;
        } else if line.is_empty() {
            in_body = true;
            if body_line_cap == Some(0) {
                out.extend_from_slice(b"\r\n");
                break;
            }
        }
        if line.first() == Some(&b'.') {
            out.push(b'.');
        }
        out.extend_from_slice(line);
        out.extend_from_slice(b"\r\n");
    }
    // A trailing CRLF in the source yields one empty split tail; drop it.
    if bytes.ends_with(b"\n") && out.ends_with(b"\r\n\r\n") && body_line_cap.is_none() {
        out.truncate(out.len() - 2);
    }
    out.extend_from_slice(b".\r\n");
    stream.write_all(&out).await?;
    stream.flush().await?;
    Ok(())
}
