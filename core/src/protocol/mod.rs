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

//! Wire protocol engines (SMTP and POP3, both sides) plus the line I/O they
//! share. Both protocols are CRLF line oriented; reads go byte by byte so a
//! TLS upgrade never strands buffered plaintext.

pub mod pop3;
pub mod smtp;

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// One read line, or the reasons there is none.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Line {
    Ok(String),
    /// Line exceeded the limit; the rest of the line was consumed so the
    /// caller can answer before closing.
    TooLong,
    /// Peer closed the connection.
    Closed,
}

/// Read one CRLF-terminated line of at most `max_len` octets (excluding the
/// terminator). Bare LF is tolerated on input; the CR is stripped.
pub(crate) async fn read_line<S>(
    stream: &mut S,
    buf: &mut Vec<u8>,
    max_len: usize,
) -> io::Result<Line>
where
    S: AsyncRead + Unpin,
{
    buf.clear();
    let mut over = false;
    loop {
        let mut byte = [0u8; 1];
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Ok(Line::Closed);
        }
        if byte[0] == b'\n' {
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
            if over || buf.len() > max_len {
                return Ok(Line::TooLong);
            }
            return Ok(Line::Ok(String::from_utf8_lossy(buf).into_owned()));
        }
        // One octet of slack for the CR of the terminator.
        if buf.len() > max_len {
            over = true;
            continue;
        }
        buf.push(byte[0]);
    }
}

/// Write `line` followed by CRLF and flush.
pub(crate) async fn write_line<S>(stream: &mut S, line: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\r\n").await?;
    stream.flush().await?;
    Ok(())
}
