/*
 * client.rs
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

//! POP3 retrieval client: connect, optional STLS, USER/PASS or APOP, then
//! STAT/LIST/UIDL/RETR/TOP/DELE/QUIT. Dot-unstuffing on multiline bodies;
//! retrieve_all applies client-side header filters.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

use crate::config::Pop3ClientConfig;
use crate::mime::HeaderScan;
use crate::net::{connect_implicit_tls, connect_plain, PlainStream, TlsStreamWrapper};
use crate::protocol::{read_line, write_line, Line};

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(120);
/// Server reply lines and message lines; generous beyond the RFC floor.
const MAX_REPLY_LINE: usize = 4096;

/// POP3 client error, by failure site.
#[derive(Debug)]
pub enum Pop3ClientError {
    ConnectFailed(String),
    TlsFailed(String),
    AuthFailed(String),
    /// Server answered -ERR to a command.
    ServerErr(String),
    Timeout,
    ProtocolViolation(String),
    Transport(String),
}

impl Pop3ClientError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Pop3ClientError::ConnectFailed(_)
                | Pop3ClientError::TlsFailed(_)
                | Pop3ClientError::Timeout
                | Pop3ClientError::Transport(_)
        )
    }
}

impl std::fmt::Display for Pop3ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pop3ClientError::ConnectFailed(m) => write!(f, "connect failed: {}", m),
            Pop3ClientError::TlsFailed(m) => write!(f, "TLS failed: {}", m),
            Pop3ClientError::AuthFailed(m) => write!(f, "authentication failed: {}", m),
            Pop3ClientError::ServerErr(m) => write!(f, "server error: {}", m),
            Pop3ClientError::Timeout => write!(f, "timed out waiting for server"),
            Pop3ClientError::ProtocolViolation(m) => write!(f, "protocol violation: {}", m),
            Pop3ClientError::Transport(m) => write!(f, "transport error: {}", m),
        }
    }
}

impl std::error::Error for Pop3ClientError {}

impl From<io::Error> for Pop3ClientError {
    fn from(e: io::Error) -> Self {
        Pop3ClientError::Transport(e.to_string())
    }
}

/// Stream for the retrieval session: plain TCP or TLS.
enum Pop3Stream {
    Plain(PlainStream),
    Tls(TlsStreamWrapper),
}

impl AsyncRead for Pop3Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Pop3Stream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Pop3Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Pop3Stream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Pop3Stream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Pop3Stream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Client-side filter for `retrieve_all`. `only_unread` is meaningful only
/// with a read oracle: POP3 itself has no read flag, so the oracle maps a
/// message-id to "already read" from local state.
#[derive(Default)]
pub struct RetrieveFilter {
    pub since_date: Option<DateTime<Utc>>,
    pub from_contains: Option<String>,
    pub subject_contains: Option<String>,
    pub only_unread: bool,
    pub read_oracle: Option<Box<dyn Fn(&str) -> bool + Send + Sync>>,
}

impl RetrieveFilter {
    fn matches(&self, bytes: &[u8]) -> bool {
        let scan = HeaderScan::scan(bytes);
        if let Some(since) = self.since_date {
            match scan.date() {
                Some(date) if date >= since => {}
                _ => return false,
            }
        }
        if let Some(needle) = &self.from_contains {
            let from = scan.get("From").unwrap_or_default();
            if !from.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }
        if let Some(needle) = &self.subject_contains {
            if !scan
                .subject()
                .to_lowercase()
                .contains(&needle.to_lowercase())
            {
                return false;
            }
        }
        if self.only_unread {
            if let (Some(oracle), Some(id)) = (&self.read_oracle, scan.message_id()) {
                if oracle(&id) {
                    return false;
                }
            }
            // Without an oracle the flag is a pass-through.
        }
        true
    }
}

/// The retrieval engine: connects sessions per the configured policy.
pub struct Pop3Client {
    config: Pop3ClientConfig,
    credentials: Option<(String, String)>,
}

impl Pop3Client {
    pub fn new(config: Pop3ClientConfig) -> Self {
        Self {
            config,
            credentials: None,
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some((username.into(), password.into()));
        self
    }

    /// Connect, upgrade, and authenticate, retrying transient failures.
    pub async fn connect(&self) -> Result<Pop3ClientSession, Pop3ClientError> {
        let mut attempt = 0u32;
        loop {
            match self.connect_once().await {
                Ok(session) => return Ok(session),
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_retries => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(error = %e, attempt, ?delay, "pop3 connect failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn connect_once(&self) -> Result<Pop3ClientSession, Pop3ClientError> {
        let stream = if self.config.implicit_tls {
            let tls = connect_implicit_tls(
                &self.config.host,
                self.config.port,
                self.config.accept_invalid_certs,
            )
            .await
            .map_err(|e| Pop3ClientError::ConnectFailed(e.to_string()))?;
            Pop3Stream::Tls(tls)
        } else {
            let plain = connect_plain(&self.config.host, self.config.port)
                .await
                .map_err(|e| Pop3ClientError::ConnectFailed(e.to_string()))?;
            Pop3Stream::Plain(plain)
        };
        let mut session = Pop3ClientSession {
            stream,
            read_buf: Vec::with_capacity(1024),
            apop_challenge: None,
        };
        let greeting = session.read_status().await?;
        session.apop_challenge = extract_challenge(&greeting);

        if self.config.use_stls && !self.config.implicit_tls {
            session = self.try_stls(session).await?;
        }

        if let Some((username, password)) = &self.credentials {
            if self.config.use_apop && session.apop_challenge.is_some() {
                session.apop(username, password).await?;
            } else {
                session.login(username, password).await?;
            }
        }
        Ok(session)
    }

    /// STLS upgrade; a server that refuses it leaves the session plaintext.
    async fn try_stls(
        &self,
        mut session: Pop3ClientSession,
    ) -> Result<Pop3ClientSession, Pop3ClientError> {
        session.command("STLS").await?;
        match session.read_status().await {
            Ok(_) => {}
            Err(Pop3ClientError::ServerErr(m)) => {
                debug!(reason = %m, "server declined STLS, staying plaintext");
                return Ok(session);
            }
            Err(e) => return Err(e),
        }
        let Pop3ClientSession {
            stream,
            read_buf,
            apop_challenge: _,
        } = session;
        let upgraded = match stream {
            Pop3Stream::Plain(plain) => plain
                .upgrade_to_tls(&self.config.host, self.config.accept_invalid_certs)
                .await
                .map_err(|e| Pop3ClientError::TlsFailed(e.to_string()))?,
            Pop3Stream::Tls(_) => {
                return Err(Pop3ClientError::ProtocolViolation(
                    "STLS on an already-TLS stream".to_string(),
                ))
            }
        };
        Ok(Pop3ClientSession {
            stream: Pop3Stream::Tls(upgraded),
            read_buf,
            // The challenge was issued in plaintext; it is not reused
            // after the upgrade.
            apop_challenge: None,
        })
    }
}

/// Pull the `<...>` APOP timestamp out of the greeting, when present.
fn extract_challenge(greeting: &str) -> Option<String> {
    let start = greeting.find('<')?;
    let end = greeting[start..].find('>')? + start;
    Some(greeting[start..=end].to_string())
}

/// An authenticated (or authenticating) POP3 session.
pub struct Pop3ClientSession {
    stream: Pop3Stream,
    read_buf: Vec<u8>,
    apop_challenge: Option<String>,
}

impl Pop3ClientSession {
    async fn command(&mut self, line: &str) -> Result<(), Pop3ClientError> {
        match tokio::time::timeout(EXCHANGE_TIMEOUT, write_line(&mut self.stream, line)).await {
            Err(_) => Err(Pop3ClientError::Timeout),
            Ok(r) => Ok(r?),
        }
    }

    /// Read one status line; +OK yields the rest of the line, -ERR errors.
    async fn read_status(&mut self) -> Result<String, Pop3ClientError> {
        let line = match tokio::time::timeout(
            EXCHANGE_TIMEOUT,
            read_line(&mut self.stream, &mut self.read_buf, MAX_REPLY_LINE),
        )
        .await
        {
            Err(_) => return Err(Pop3ClientError::Timeout),
            Ok(Ok(Line::Ok(l))) => l,
            Ok(Ok(Line::TooLong)) => {
                return Err(Pop3ClientError::ProtocolViolation(
                    "oversized reply line".to_string(),
                ))
            }
            Ok(Ok(Line::Closed)) => {
                return Err(Pop3ClientError::Transport("connection closed".to_string()))
            }
            Ok(Err(e)) => return Err(e.into()),
        };
        if let Some(rest) = line.strip_prefix("+OK") {
            Ok(rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            Err(Pop3ClientError::ServerErr(rest.trim().to_string()))
        } else {
            Err(Pop3ClientError::ProtocolViolation(format!(
                "expected status indicator, got {:?}",
                line
            )))
        }
    }

    /// Read a multiline payload: lines to the lone `.`, one leading dot
    /// stripped from stuffed lines, CRLF preserved.
    async fn read_multiline(&mut self) -> Result<Vec<u8>, Pop3ClientError> {
        let mut out = Vec::new();
        loop {
            let line = match tokio::time::timeout(
                EXCHANGE_TIMEOUT,
                read_line(&mut self.stream, &mut self.read_buf, MAX_REPLY_LINE),
            )
            .await
            {
                Err(_) => return Err(Pop3ClientError::Timeout),
                Ok(Ok(Line::Ok(l))) => l,
                Ok(Ok(Line::TooLong)) => {
                    return Err(Pop3ClientError::ProtocolViolation(
                        "oversized body line".to_string(),
                    ))
                }
                Ok(Ok(Line::Closed)) => {
                    return Err(Pop3ClientError::Transport(
                        "connection closed mid-body".to_string(),
                    ))
                }
                Ok(Err(e)) => return Err(e.into()),
            };
            if line == "." {
                break;
            }
            let text = line.strip_prefix('.').unwrap_or(&line);
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Ok(out)
    }

    /// USER then PASS.
    pub async fn login(&mut self, username: &str, password: &str) -> Result<(), Pop3ClientError> {
        self.command(&format!("USER {}", username)).await?;
        self.read_status().await.map_err(auth_error)?;
        self.command(&format!("PASS {}", password)).await?;
        self.read_status().await.map_err(auth_error)?;
        Ok(())
    }

    /// APOP with the greeting challenge: md5(challenge || password), hex.
    pub async fn apop(&mut self, username: &str, password: &str) -> Result<(), Pop3ClientError> {
        let challenge = self
            .apop_challenge
            .clone()
            .ok_or_else(|| Pop3ClientError::AuthFailed("no APOP challenge offered".to_string()))?;
        let mut md5 = Md5::new();
        md5.update(challenge.as_bytes());
        md5.update(password.as_bytes());
        let digest: String = md5
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect();
        self.command(&format!("APOP {} {}", username, digest)).await?;
        self.read_status().await.map_err(auth_error)?;
        Ok(())
    }

    /// STAT → (message count, octet total).
    pub async fn get_mailbox_status(&mut self) -> Result<(u32, u64), Pop3ClientError> {
        self.command("STAT").await?;
        let rest = self.read_status().await?;
        let mut words = rest.split_whitespace();
        let count = words.next().and_then(|s| s.parse().ok());
        let size = words.next().and_then(|s| s.parse().ok());
        match (count, size) {
            (Some(c), Some(s)) => Ok((c, s)),
            _ => Err(Pop3ClientError::ProtocolViolation(format!(
                "malformed STAT reply: {:?}",
                rest
            ))),
        }
    }

    /// LIST → [(message number, size)].
    pub async fn list_messages(&mut self) -> Result<Vec<(u32, u64)>, Pop3ClientError> {
        self.command("LIST").await?;
        self.read_status().await?;
        let body = self.read_multiline().await?;
        let mut out = Vec::new();
        for line in String::from_utf8_lossy(&body).lines() {
            let mut words = line.split_whitespace();
            if let (Some(n), Some(size)) = (
                words.next().and_then(|s| s.parse().ok()),
                words.next().and_then(|s| s.parse().ok()),
            ) {
                out.push((n, size));
            }
        }
        Ok(out)
    }

    /// UIDL → [(message number, unique id)].
    pub async fn list_unique_ids(&mut self) -> Result<Vec<(u32, String)>, Pop3ClientError> {
        self.command("UIDL").await?;
        self.read_status().await?;
        let body = self.read_multiline().await?;
        let mut out = Vec::new();
        for line in String::from_utf8_lossy(&body).lines() {
            let mut words = line.split_whitespace();
            if let (Some(n), Some(uid)) = (words.next().and_then(|s| s.parse().ok()), words.next())
            {
                out.push((n, uid.to_string()));
            }
        }
        Ok(out)
    }

    /// RETR, optionally followed by DELE on success.
    pub async fn retrieve_message(
        &mut self,
        n: u32,
        delete: bool,
    ) -> Result<Vec<u8>, Pop3ClientError> {
        self.command(&format!("RETR {}", n)).await?;
        self.read_status().await?;
        let bytes = self.read_multiline().await?;
        if delete {
            self.delete_message(n).await?;
        }
        Ok(bytes)
    }

    /// TOP n k → headers plus the first k body lines.
    pub async fn top(&mut self, n: u32, k: u32) -> Result<Vec<u8>, Pop3ClientError> {
        self.command(&format!("TOP {} {}", n, k)).await?;
        self.read_status().await?;
        self.read_multiline().await
    }

    pub async fn delete_message(&mut self, n: u32) -> Result<(), Pop3ClientError> {
        self.command(&format!("DELE {}", n)).await?;
        self.read_status().await?;
        Ok(())
    }

    pub async fn reset(&mut self) -> Result<(), Pop3ClientError> {
        self.command("RSET").await?;
        self.read_status().await?;
        Ok(())
    }

    pub async fn noop(&mut self) -> Result<(), Pop3ClientError> {
        self.command("NOOP").await?;
        self.read_status().await?;
        Ok(())
    }

    /// Retrieve every message passing `filter`, as (number, bytes) pairs.
    pub async fn retrieve_all(
        &mut self,
        filter: &RetrieveFilter,
    ) -> Result<Vec<(u32, Vec<u8>)>, Pop3ClientError> {
        let listing = self.list_messages().await?;
        let mut out = Vec::new();
        for (n, _size) in listing {
            let bytes = self.retrieve_message(n, false).await?;
            if filter.matches(&bytes) {
                out.push((n, bytes));
            }
        }
        Ok(out)
    }

    /// QUIT and consume the UPDATE-state reply.
    pub async fn quit(mut self) -> Result<(), Pop3ClientError> {
        self.command("QUIT").await?;
        let _ = self.read_status().await;
        Ok(())
    }
}

fn auth_error(e: Pop3ClientError) -> Pop3ClientError {
    match e {
        Pop3ClientError::ServerErr(m) => Pop3ClientError::AuthFailed(m),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn challenge_extraction() {
        assert_eq!(
            extract_challenge("POP3 server ready <1896.697@dbc.mtview.ca.us>").as_deref(),
            Some("<1896.697@dbc.mtview.ca.us>")
        );
        assert_eq!(extract_challenge("POP3 server ready"), None);
    }

    #[test]
    fn filter_matches_headers() {
        let bytes: &[u8] = b"From: Alice <a@x.example>\r\n\
Subject: invoice 42\r\n\
Date: Fri, 21 Nov 2025 09:55:06 +0000\r\n\
Message-ID: <m1@x>\r\n\
\r\n\
body\r\n";
        let all = RetrieveFilter::default();
        assert!(all.matches(bytes));

        let by_subject = RetrieveFilter {
            subject_contains: Some("INVOICE".to_string()),
            ..Default::default()
        };
        assert!(by_subject.matches(bytes));

        let by_from = RetrieveFilter {
            from_contains: Some("bob".to_string()),
            ..Default::default()
        };
        assert!(!by_from.matches(bytes));

        let since = RetrieveFilter {
            since_date: Some(chrono::Utc::now()),
            ..Default::default()
        };
        assert!(!since.matches(bytes));
    }

    #[test]
    fn unread_filter_uses_oracle() {
        let bytes: &[u8] = b"Message-ID: <seen@x>\r\n\r\nhi\r\n";
        let f = RetrieveFilter {
            only_unread: true,
            read_oracle: Some(Box::new(|id| id == "<seen@x>")),
            ..Default::default()
        };
        assert!(!f.matches(bytes));
        let pass_through = RetrieveFilter {
            only_unread: true,
            ..Default::default()
        };
        assert!(pass_through.matches(bytes));
    }
}
