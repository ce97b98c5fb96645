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

//! SMTP submission client: connect, EHLO, STARTTLS, AUTH, MAIL FROM,
//! RCPT TO, DATA, QUIT. Transient failures retry with exponential backoff;
//! permanent (5xx) rejections do not.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tracing::{debug, info, warn};

use crate::config::{AuthPreference, SmtpClientConfig};
use crate::mime::{build_message, Message};
use crate::net::{connect_implicit_tls, connect_plain, PlainStream, TlsStreamWrapper};
use crate::protocol::smtp::{read_response, DotStuffer, SmtpResponse};
use crate::protocol::write_line;
use crate::sasl::{
    b64_encode, encode_plain, login_respond_to_challenge, SaslMechanism,
};
use crate::store::{ContentStore, MailStore, Mailbox, MessageRecord};

/// Ceiling on any single command/response exchange.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(120);

/// Submission error, by failure site.
#[derive(Debug)]
pub enum SmtpClientError {
    ConnectFailed(String),
    TlsFailed(String),
    /// Carries the reply code so transient (4xx) failures can retry.
    AuthFailed { code: u16, text: String },
    Rejected {
        code: u16,
        enhanced: Option<String>,
        text: String,
    },
    Timeout,
    ProtocolViolation(String),
    Transport(String),
}

impl SmtpClientError {
    fn rejected(r: &SmtpResponse) -> Self {
        SmtpClientError::Rejected {
            code: r.code,
            enhanced: r.enhanced.clone(),
            text: r.message().to_string(),
        }
    }

    /// Transient failures are worth another attempt; permanent rejections
    /// are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            SmtpClientError::ConnectFailed(_)
            | SmtpClientError::TlsFailed(_)
            | SmtpClientError::Timeout
            | SmtpClientError::Transport(_) => true,
            SmtpClientError::AuthFailed { code, .. } => (400..500).contains(code),
            SmtpClientError::Rejected { code, .. } => (400..500).contains(code),
            SmtpClientError::ProtocolViolation(_) => false,
        }
    }
}

impl std::fmt::Display for SmtpClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SmtpClientError::ConnectFailed(m) => write!(f, "connect failed: {}", m),
            SmtpClientError::TlsFailed(m) => write!(f, "TLS failed: {}", m),
            SmtpClientError::AuthFailed { code, text } => {
                write!(f, "authentication failed: {} {}", code, text)
            }
            SmtpClientError::Rejected {
                code,
                enhanced,
                text,
            } => match enhanced {
                Some(esc) => write!(f, "rejected by server: {} {} {}", code, esc, text),
                None => write!(f, "rejected by server: {} {}", code, text),
            },
            SmtpClientError::Timeout => write!(f, "timed out waiting for server"),
            SmtpClientError::ProtocolViolation(m) => write!(f, "protocol violation: {}", m),
            SmtpClientError::Transport(m) => write!(f, "transport error: {}", m),
        }
    }
}

impl std::error::Error for SmtpClientError {}

impl From<io::Error> for SmtpClientError {
    fn from(e: io::Error) -> Self {
        SmtpClientError::Transport(e.to_string())
    }
}

/// Outcome of a successful submission.
#[derive(Debug, Clone)]
pub struct SubmissionReport {
    /// Message-id written into the headers.
    pub message_id: String,
    /// Queue id echoed by the server's final 250, when present.
    pub queued_id: Option<String>,
    pub accepted_recipients: usize,
    /// Recipients the server rejected permanently (partial acceptance).
    pub rejected_recipients: Vec<String>,
}

/// Stream for the submission session: plain TCP or TLS.
enum ClientStream {
    Plain(PlainStream),
    Tls(TlsStreamWrapper),
}

impl AsyncRead for ClientStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ClientStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ClientStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ClientStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ClientStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Capabilities learned from EHLO.
#[derive(Debug, Default)]
struct EhloCaps {
    starttls: bool,
    auth_mechanisms: Vec<String>,
}

async fn timed<T>(
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> Result<T, SmtpClientError> {
    match tokio::time::timeout(EXCHANGE_TIMEOUT, fut).await {
        Err(_) => Err(SmtpClientError::Timeout),
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(e.into()),
    }
}

async fn ehlo(
    stream: &mut ClientStream,
    buf: &mut Vec<u8>,
    hostname: &str,
) -> Result<EhloCaps, SmtpClientError> {
    timed(write_line(stream, &format!("EHLO {}", hostname))).await?;
    let r = timed(read_response(stream, buf)).await?;
    if !r.is_success() {
        return Err(SmtpClientError::rejected(&r));
    }
    let mut caps = EhloCaps::default();
    for line in &r.lines {
        let upper = line.to_uppercase();
        if upper == "STARTTLS" {
            caps.starttls = true;
        } else if let Some(mechs) = upper.strip_prefix("AUTH ") {
            caps.auth_mechanisms = mechs.split_whitespace().map(|s| s.to_string()).collect();
        }
    }
    Ok(caps)
}

/// The SMTP submission engine.
pub struct SmtpClient {
    config: SmtpClientConfig,
    credentials: Option<(String, String)>,
    sent_store: Option<(Arc<MailStore>, Arc<ContentStore>)>,
}

impl SmtpClient {
    pub fn new(config: SmtpClientConfig) -> Self {
        Self {
            config,
            credentials: None,
            sent_store: None,
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

    /// Persist sent copies through this store pair (when the config enables
    /// `save_sent_copies`).
    pub fn with_sent_store(mut self, store: Arc<MailStore>, content: Arc<ContentStore>) -> Self {
        self.sent_store = Some((store, content));
        self
    }

    /// Build wire bytes for `message` and submit, retrying transient
    /// failures per the configured policy.
    pub async fn send_message(
        &self,
        message: &Message,
    ) -> Result<SubmissionReport, SmtpClientError> {
        let domain = message
            .from
            .as_ref()
            .map(|a| a.domain.clone())
            .unwrap_or_else(|| self.config.ehlo_hostname.clone());
        let (bytes, msg_id) = build_message(message, &domain);
        let sender = message
            .from
            .as_ref()
            .map(|a| a.addr_spec())
            .unwrap_or_default();
        let recipients: Vec<String> = message.recipients().iter().map(|a| a.addr_spec()).collect();
        let report = self
            .send_raw(&sender, &recipients, &bytes, &msg_id)
            .await?;
        if self.config.save_sent_copies {
            self.save_sent_copy(message, &bytes, &msg_id);
        }
        Ok(report)
    }

    /// Submit already-framed message bytes.
    pub async fn send_raw(
        &self,
        sender: &str,
        recipients: &[String],
        bytes: &[u8],
        message_id: &str,
    ) -> Result<SubmissionReport, SmtpClientError> {
        if recipients.is_empty() {
            return Err(SmtpClientError::ProtocolViolation(
                "no recipients".to_string(),
            ));
        }
        let mut attempt = 0u32;
        loop {
            match self.attempt(sender, recipients, bytes, message_id).await {
                Ok(report) => return Ok(report),
                Err(e) if e.is_retryable() && attempt < self.config.retry.max_retries => {
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(error = %e, attempt, ?delay, "submission attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn attempt(
        &self,
        sender: &str,
        recipients: &[String],
        bytes: &[u8],
        message_id: &str,
    ) -> Result<SubmissionReport, SmtpClientError> {
        let mut buf = Vec::with_capacity(4096);
        let mut stream = self.connect().await?;

        let banner = timed(read_response(&mut stream, &mut buf)).await?;
        if banner.code != 220 {
            return Err(SmtpClientError::ProtocolViolation(format!(
                "expected 220 greeting, got {} {}",
                banner.code,
                banner.message()
            )));
        }
        let mut caps = ehlo(&mut stream, &mut buf, &self.config.ehlo_hostname).await?;

        if caps.starttls && self.config.use_starttls && !matches!(stream, ClientStream::Tls(_)) {
            timed(write_line(&mut stream, "STARTTLS")).await?;
            let r = timed(read_response(&mut stream, &mut buf)).await?;
            if r.code != 220 {
                return Err(SmtpClientError::rejected(&r));
            }
            stream = match stream {
                ClientStream::Plain(plain) => {
                    let tls = plain
                        .upgrade_to_tls(&self.config.host, self.config.accept_invalid_certs)
                        .await
                        .map_err(|e| SmtpClientError::TlsFailed(e.to_string()))?;
                    ClientStream::Tls(tls)
                }
                tls @ ClientStream::Tls(_) => tls,
            };
            debug!("STARTTLS upgrade complete, re-issuing EHLO");
            caps = ehlo(&mut stream, &mut buf, &self.config.ehlo_hostname).await?;
        }

        if let Some((username, password)) = &self.credentials {
            self.authenticate(&mut stream, &mut buf, &caps, username, password)
                .await?;
        }

        let report = self
            .transaction(&mut stream, &mut buf, sender, recipients, bytes, message_id)
            .await?;

        // QUIT is courtesy; the commit already happened.
        let _ = write_line(&mut stream, "QUIT").await;
        let _ = tokio::time::timeout(Duration::from_secs(5), read_response(&mut stream, &mut buf))
            .await;
        let _ = stream.shutdown().await;
        Ok(report)
    }

    async fn connect(&self) -> Result<ClientStream, SmtpClientError> {
        if self.config.implicit_tls {
            let tls = connect_implicit_tls(
                &self.config.host,
                self.config.port,
                self.config.accept_invalid_certs,
            )
            .await
            .map_err(|e| SmtpClientError::ConnectFailed(e.to_string()))?;
            Ok(ClientStream::Tls(tls))
        } else {
            let plain = connect_plain(&self.config.host, self.config.port)
                .await
                .map_err(|e| SmtpClientError::ConnectFailed(e.to_string()))?;
            Ok(ClientStream::Plain(plain))
        }
    }

    /// Mechanism order: explicit preference wins; AUTO is PLAIN then LOGIN.
    fn mechanism_order(&self, caps: &EhloCaps) -> Vec<SaslMechanism> {
        let offered = |m: SaslMechanism| caps.auth_mechanisms.iter().any(|o| o == m.name());
        let wanted = match self.config.auth_preference {
            AuthPreference::Plain => vec![SaslMechanism::Plain],
            AuthPreference::Login => vec![SaslMechanism::Login],
            AuthPreference::Auto => vec![SaslMechanism::Plain, SaslMechanism::Login],
        };
        wanted.into_iter().filter(|m| offered(*m)).collect()
    }

    async fn authenticate(
        &self,
        stream: &mut ClientStream,
        buf: &mut Vec<u8>,
        caps: &EhloCaps,
        username: &str,
        password: &str,
    ) -> Result<(), SmtpClientError> {
        let order = self.mechanism_order(caps);
        if order.is_empty() {
            return Err(SmtpClientError::AuthFailed {
                code: 504,
                text: "server offers no usable AUTH mechanism".to_string(),
            });
        }
        let mut last = None;
        for mechanism in order {
            match auth_once(stream, buf, mechanism, username, password).await {
                Ok(()) => {
                    info!(mechanism = mechanism.name(), "authenticated");
                    return Ok(());
                }
                Err(e @ SmtpClientError::AuthFailed { .. }) => {
                    debug!(mechanism = mechanism.name(), error = %e, "mechanism failed");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.expect("at least one mechanism attempted"))
    }

    async fn transaction(
        &self,
        stream: &mut ClientStream,
        buf: &mut Vec<u8>,
        sender: &str,
        recipients: &[String],
        bytes: &[u8],
        message_id: &str,
    ) -> Result<SubmissionReport, SmtpClientError> {
        timed(write_line(stream, &format!("MAIL FROM:<{}>", sender))).await?;
        let r = timed(read_response(stream, buf)).await?;
        if !r.is_success() {
            return Err(SmtpClientError::rejected(&r));
        }

        let mut accepted = 0usize;
        let mut rejected = Vec::new();
        for rcpt in recipients {
            timed(write_line(stream, &format!("RCPT TO:<{}>", rcpt))).await?;
            let r = timed(read_response(stream, buf)).await?;
            if r.is_success() || r.code == 251 {
                accepted += 1;
            } else if r.is_transient() {
                // Transient recipient failure fails the attempt; the retry
                // policy owns what happens next.
                return Err(SmtpClientError::rejected(&r));
            } else {
                warn!(recipient = %rcpt, code = r.code, "recipient rejected");
                rejected.push(rcpt.clone());
            }
        }
        if accepted == 0 {
            return Err(SmtpClientError::Rejected {
                code: 550,
                enhanced: Some("5.1.1".to_string()),
                text: "all recipients rejected".to_string(),
            });
        }

        timed(write_line(stream, "DATA")).await?;
        let r = timed(read_response(stream, buf)).await?;
        if r.code != 354 {
            return Err(SmtpClientError::rejected(&r));
        }
        let mut wire = Vec::with_capacity(bytes.len() + 128);
        let mut stuffer = DotStuffer::new();
        stuffer.process_chunk(bytes, |s| wire.extend_from_slice(s));
        stuffer.end_message(|s| wire.extend_from_slice(s));
        timed(async {
            stream.write_all(&wire).await?;
            stream.flush().await
        })
        .await?;

        let r = timed(read_response(stream, buf)).await?;
        if !r.is_success() {
            return Err(SmtpClientError::rejected(&r));
        }
        Ok(SubmissionReport {
            message_id: message_id.to_string(),
            queued_id: extract_queued_id(r.message()),
            accepted_recipients: accepted,
            rejected_recipients: rejected,
        })
    }

    /// Bidirectional storage symmetry: a successful submission lands in the
    /// sent table with its content file, same shape as received mail.
    fn save_sent_copy(&self, message: &Message, bytes: &[u8], msg_id: &str) {
        let Some((store, content)) = &self.sent_store else {
            warn!("save_sent_copies set but no sent store attached");
            return;
        };
        let path = match content.put(msg_id, bytes) {
            Ok(p) => p,
            Err(e) => {
                warn!(%msg_id, error = %e, "sent copy content write failed");
                return;
            }
        };
        let mut rec = MessageRecord::new(msg_id);
        rec.from_addr = message
            .from
            .as_ref()
            .map(|a| a.addr_spec())
            .unwrap_or_default();
        rec.to_addrs = message.recipients().iter().map(|a| a.addr_spec()).collect();
        rec.subject = message.subject.clone();
        rec.date = Some(message.date.unwrap_or_else(Utc::now));
        rec.size_bytes = bytes.len() as u64;
        rec.is_read = true;
        rec.content_path = Some(path.to_string_lossy().into_owned());
        match store.insert_message(Mailbox::Sent, &rec) {
            Ok(()) => debug!(%msg_id, "sent copy recorded"),
            Err(e) => warn!(%msg_id, error = %e, "sent copy record failed"),
        }
    }
}

/// One AUTH exchange with a single mechanism.
async fn auth_once(
    stream: &mut ClientStream,
    buf: &mut Vec<u8>,
    mechanism: SaslMechanism,
    username: &str,
    password: &str,
) -> Result<(), SmtpClientError> {
    let first = match mechanism {
        SaslMechanism::Plain => format!(
            "AUTH PLAIN {}",
            b64_encode(&encode_plain("", username, password))
        ),
        SaslMechanism::Login => "AUTH LOGIN".to_string(),
    };
    timed(write_line(stream, &first)).await?;
    loop {
        let r = timed(read_response(stream, buf)).await?;
        match r.code {
            235 => return Ok(()),
            334 => {
                let answer = login_respond_to_challenge(r.message(), username, password)
                    .map_err(|e| SmtpClientError::ProtocolViolation(e.to_string()))?;
                timed(write_line(stream, &answer)).await?;
            }
            code => {
                return Err(SmtpClientError::AuthFailed {
                    code,
                    text: r.message().to_string(),
                })
            }
        }
    }
}

/// Pull the queue id out of "OK queued as <id>".
fn extract_queued_id(text: &str) -> Option<String> {
    let idx = text.to_ascii_lowercase().find("queued as ")?;
    let id = text[idx + "queued as ".len()..].trim();
    if id.is_empty() {
        None
    } else {
        Some(id.to_string())
    }
}
