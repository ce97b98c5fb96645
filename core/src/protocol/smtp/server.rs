/*
 * server.rs
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

//! SMTP receive engine (RFC 5321, STARTTLS per RFC 3207, AUTH per RFC
//! 4954). One session per connection; the commit point is the DATA
//! terminator: content file first, then the inbox row, and the 250 carries
//! the queued message-id only after both succeeded.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::{AuthOutcome, Authenticator, Principal};
use crate::config::{ListenMode, SmtpServerConfig};
use crate::message_id;
use crate::mime::HeaderScan;
use crate::net::{ServerStream, TlsServerContext};
use crate::protocol::smtp::{
    reply, reply_multiline, CaptureOutcome, CaptureStatus, DataCapture, SmtpCommand,
    MAX_COMMAND_LINE, MAX_DATA_LINE,
};
use crate::protocol::{read_line, Line};
use crate::runtime::{self, ServerHandle};
use crate::sasl::{
    b64_decode, decode_plain, SaslMechanism, LOGIN_PASSWORD_CHALLENGE, LOGIN_USERNAME_CHALLENGE,
};
use crate::store::{ContentStore, MailStore, Mailbox, MessageRecord, StoreErrorKind};

const BUSY_REPLY: &[u8] = b"421 Service not available\r\n";

/// The SMTP receive server. Composes the metadata store, content store, and
/// authenticator; owns nothing global.
pub struct SmtpServer {
    config: SmtpServerConfig,
    store: Arc<MailStore>,
    content: Arc<ContentStore>,
    auth: Arc<Authenticator>,
    tls: Option<TlsServerContext>,
}

struct Shared {
    config: SmtpServerConfig,
    store: Arc<MailStore>,
    content: Arc<ContentStore>,
    auth: Arc<Authenticator>,
    tls: Option<TlsServerContext>,
}

impl SmtpServer {
    pub fn new(
        config: SmtpServerConfig,
        store: Arc<MailStore>,
        content: Arc<ContentStore>,
        auth: Arc<Authenticator>,
        tls: Option<TlsServerContext>,
    ) -> Self {
        Self {
            config,
            store,
            content,
            auth,
            tls,
        }
    }

    /// Bind `config.bind` and start serving.
    pub async fn serve(self) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        self.serve_on(listener)
    }

    /// Serve on an already-bound listener (tests bind port 0).
    pub fn serve_on(self, listener: TcpListener) -> io::Result<ServerHandle> {
        if self.config.mode != ListenMode::Plain && self.tls.is_none() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TLS mode configured without certificate context",
            ));
        }
        let limits = self.config.limits.clone();
        let shared = Arc::new(Shared {
            config: self.config,
            store: self.store,
            content: self.content,
            auth: self.auth,
            tls: self.tls,
        });
        runtime::serve(listener, limits, BUSY_REPLY, move |tcp, peer, shutdown| {
            let shared = Arc::clone(&shared);
            async move {
                if let Err(e) = run_session(shared, tcp, peer, shutdown).await {
                    debug!(%peer, error = %e, "smtp session ended with transport error");
                }
            }
        })
    }
}

/// Where the session is in the command sequence. DATA capture runs inline
/// after the 354, so it needs no state of its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmtpState {
    /// Banner sent, waiting for EHLO/HELO.
    HeloPending,
    /// Greeted, envelope empty.
    MailPending,
    /// Reverse-path taken, collecting recipients.
    RcptPending,
}

struct Session {
    shared: Arc<Shared>,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
    state: SmtpState,
    tls_active: bool,
    ehlo_domain: Option<String>,
    principal: Option<Principal>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    read_buf: Vec<u8>,
}

async fn run_session(
    shared: Arc<Shared>,
    tcp: TcpStream,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    let stream = match shared.config.mode {
        ListenMode::ImplicitTls => {
            let ctx = shared.tls.as_ref().expect("checked at serve time");
            match ctx.accept(tcp).await {
                Ok(tls) => ServerStream::Tls(tls),
                Err(e) => {
                    // No banner was sent; nothing to say in plaintext.
                    debug!(%peer, error = %e, "implicit TLS handshake failed");
                    return Ok(());
                }
            }
        }
        _ => ServerStream::Plain(tcp),
    };
    let tls_active = stream.is_tls();
    let session = Session {
        shared,
        peer,
        shutdown,
        state: SmtpState::HeloPending,
        tls_active,
        ehlo_domain: None,
        principal: None,
        mail_from: None,
        rcpt_to: Vec::new(),
        read_buf: Vec::with_capacity(1024),
    };
    session.run(stream).await
}

impl Session {
    async fn run(mut self, mut stream: ServerStream) -> io::Result<()> {
        info!(peer = %self.peer, tls = self.tls_active, "smtp session open");
        reply(
            &mut stream,
            220,
            &format!("{} ESMTP Fermoposta ready", self.shared.config.hostname),
        )
        .await?;

        loop {
            if *self.shutdown.borrow() {
                reply(&mut stream, 421, "4.3.2 Service shutting down").await?;
                break;
            }
            let line = match self.next_command_line(&mut stream).await? {
                Some(line) => line,
                None => break,
            };
            let cmd = SmtpCommand::parse(&line);
            match cmd {
                SmtpCommand::Ehlo(domain) => {
                    self.greet(domain);
                    let caps = self.capabilities();
                    reply_multiline(&mut stream, 250, &caps).await?;
                }
                SmtpCommand::Helo(domain) => {
                    self.greet(domain);
                    reply(&mut stream, 250, &self.shared.config.hostname.clone()).await?;
                }
                SmtpCommand::StartTls => {
                    if !self.starttls_available() {
                        reply(&mut stream, 454, "4.7.0 TLS not available").await?;
                        continue;
                    }
                    reply(&mut stream, 220, "2.0.0 Ready to start TLS").await?;
                    let ctx = self.shared.tls.as_ref().expect("starttls_available");
                    stream = match stream.upgrade_to_tls(ctx).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(peer = %self.peer, error = %e, "STARTTLS handshake failed");
                            return Ok(());
                        }
                    };
                    // RFC 3207: the session restarts from scratch.
                    self.tls_active = true;
                    self.state = SmtpState::HeloPending;
                    self.ehlo_domain = None;
                    self.principal = None;
                    self.reset_envelope();
                }
                SmtpCommand::Auth { mechanism, initial } => {
                    self.handle_auth(&mut stream, mechanism, initial).await?;
                }
                SmtpCommand::MailFrom {
                    path,
                    declared_size,
                    bad_param,
                } => {
                    self.handle_mail_from(&mut stream, path, declared_size, bad_param)
                        .await?;
                }
                SmtpCommand::RcptTo { path } => {
                    self.handle_rcpt_to(&mut stream, path).await?;
                }
                SmtpCommand::Data => {
                    if self.state != SmtpState::RcptPending || self.rcpt_to.is_empty() {
                        reply(&mut stream, 503, "5.5.1 RCPT TO required before DATA").await?;
                        continue;
                    }
                    self.handle_data(&mut stream).await?;
                }
                SmtpCommand::Rset => {
                    self.reset_envelope();
                    if self.state != SmtpState::HeloPending {
                        self.state = SmtpState::MailPending;
                    }
                    reply(&mut stream, 250, "2.0.0 OK").await?;
                }
                SmtpCommand::Noop => {
                    reply(&mut stream, 250, "2.0.0 OK").await?;
                }
                SmtpCommand::Quit => {
                    reply(
                        &mut stream,
                        221,
                        &format!("2.0.0 {} closing connection", self.shared.config.hostname),
                    )
                    .await?;
                    break;
                }
                SmtpCommand::Vrfy => {
                    reply(&mut stream, 252, "2.5.2 Cannot VRFY user").await?;
                }
                SmtpCommand::Expn => {
                    reply(&mut stream, 502, "5.3.3 EXPN not supported").await?;
                }
                SmtpCommand::Help => {
                    reply(&mut stream, 214, "2.0.0 Commands: EHLO MAIL RCPT DATA RSET NOOP QUIT")
                        .await?;
                }
                SmtpCommand::Unknown(raw) => {
                    debug!(peer = %self.peer, command = %raw, "unrecognized command");
                    reply(&mut stream, 500, "5.5.2 Command not recognized").await?;
                }
            }
        }
        info!(peer = %self.peer, "smtp session closed");
        Ok(())
    }

    /// Read one command line under the idle timeout. None means the session
    /// is over (EOF, timeout, or an unrecoverable oversized line).
    async fn next_command_line(&mut self, stream: &mut ServerStream) -> io::Result<Option<String>> {
        let idle = self.shared.config.limits.idle_timeout();
        match tokio::time::timeout(idle, read_line(stream, &mut self.read_buf, MAX_COMMAND_LINE))
            .await
        {
            Err(_) => {
                reply(stream, 421, "4.4.2 Idle timeout, closing").await?;
                Ok(None)
            }
            Ok(Ok(Line::Ok(line))) => Ok(Some(line)),
            Ok(Ok(Line::TooLong)) => {
                reply(stream, 500, "5.5.2 Line too long").await?;
                Ok(None)
            }
            Ok(Ok(Line::Closed)) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    fn greet(&mut self, domain: String) {
        self.ehlo_domain = Some(domain);
        self.reset_envelope();
        self.state = SmtpState::MailPending;
    }

    fn reset_envelope(&mut self) {
        self.mail_from = None;
        self.rcpt_to.clear();
        if self.state == SmtpState::RcptPending {
            self.state = SmtpState::MailPending;
        }
    }

    fn starttls_available(&self) -> bool {
        self.shared.config.mode == ListenMode::StartTlsCapable
            && !self.tls_active
            && self.shared.tls.is_some()
            && self.ehlo_domain.is_some()
    }

    /// Capability list for the EHLO reply, reflecting current session state:
    /// STARTTLS disappears once TLS is up, AUTH once authenticated.
    fn capabilities(&self) -> Vec<String> {
        let mut caps = vec![
            format!("{} greets {}", self.shared.config.hostname, self.ehlo_domain.as_deref().unwrap_or("client")),
            format!("SIZE {}", self.shared.config.max_message_size),
            "8BITMIME".to_string(),
            "PIPELINING".to_string(),
            "ENHANCEDSTATUSCODES".to_string(),
        ];
        if self.starttls_available() {
            caps.push("STARTTLS".to_string());
        }
        if self.principal.is_none() {
            caps.push("AUTH PLAIN LOGIN".to_string());
        }
        caps
    }

    async fn handle_auth(
        &mut self,
        stream: &mut ServerStream,
        mechanism: Option<SaslMechanism>,
        initial: Option<String>,
    ) -> io::Result<()> {
        if self.state == SmtpState::HeloPending {
            reply(stream, 503, "5.5.1 Send EHLO first").await?;
            return Ok(());
        }
        if self.principal.is_some() {
            reply(stream, 503, "5.5.1 Already authenticated").await?;
            return Ok(());
        }
        if self.mail_from.is_some() {
            reply(stream, 503, "5.5.1 AUTH not permitted during a transaction").await?;
            return Ok(());
        }
        let Some(mechanism) = mechanism else {
            reply(stream, 504, "5.5.4 Mechanism not supported").await?;
            return Ok(());
        };
        if !self.tls_active && !self.shared.config.allow_plaintext_auth {
            reply(stream, 538, "5.7.11 Encryption required for requested mechanism").await?;
            return Ok(());
        }

        let credentials = match mechanism {
            SaslMechanism::Plain => self.auth_plain(stream, initial).await?,
            SaslMechanism::Login => self.auth_login(stream, initial).await?,
        };
        let Some((username, password)) = credentials else {
            return Ok(()); // reply already sent
        };

        let auth = Arc::clone(&self.shared.auth);
        let user = username.clone();
        let outcome = tokio::task::spawn_blocking(move || auth.verify(&user, &password))
            .await
            .unwrap_or(AuthOutcome::Deny(crate::auth::DenyReason::BadCredentials));
        match outcome {
            AuthOutcome::Allow(principal) => {
                info!(peer = %self.peer, username = %principal.username, "authenticated");
                self.principal = Some(principal);
                reply(stream, 235, "2.7.0 Authentication successful").await?;
            }
            AuthOutcome::Deny(_) => {
                warn!(peer = %self.peer, username = %username, "authentication failed");
                reply(stream, 535, "5.7.8 Authentication credentials invalid").await?;
            }
        }
        Ok(())
    }

    /// PLAIN: initial response on the AUTH line, or one 334 continuation.
    async fn auth_plain(
        &mut self,
        stream: &mut ServerStream,
        initial: Option<String>,
    ) -> io::Result<Option<(String, String)>> {
        let payload_b64 = match initial {
            Some(p) => p,
            None => {
                reply(stream, 334, "").await?;
                match self.next_command_line(stream).await? {
                    Some(line) if line.trim() == "*" => {
                        reply(stream, 501, "5.7.0 Authentication cancelled").await?;
                        return Ok(None);
                    }
                    Some(line) => line,
                    None => return Ok(None),
                }
            }
        };
        let parsed = b64_decode(&payload_b64)
            .ok()
            .and_then(|raw| decode_plain(&raw).ok());
        match parsed {
            Some((_authzid, authcid, password)) => Ok(Some((authcid, password))),
            None => {
                reply(stream, 501, "5.5.2 Cannot decode credentials").await?;
                Ok(None)
            }
        }
    }

    /// LOGIN: two-step Username:/Password: prompt exchange.
    async fn auth_login(
        &mut self,
        stream: &mut ServerStream,
        initial: Option<String>,
    ) -> io::Result<Option<(String, String)>> {
        let username_b64 = match initial {
            Some(u) => u,
            None => {
                reply(stream, 334, LOGIN_USERNAME_CHALLENGE).await?;
                match self.next_command_line(stream).await? {
                    Some(line) => line,
                    None => return Ok(None),
                }
            }
        };
        if username_b64.trim() == "*" {
            reply(stream, 501, "5.7.0 Authentication cancelled").await?;
            return Ok(None);
        }
        reply(stream, 334, LOGIN_PASSWORD_CHALLENGE).await?;
        let password_b64 = match self.next_command_line(stream).await? {
            Some(line) => line,
            None => return Ok(None),
        };
        if password_b64.trim() == "*" {
            reply(stream, 501, "5.7.0 Authentication cancelled").await?;
            return Ok(None);
        }
        let decoded = b64_decode(&username_b64).ok().zip(b64_decode(&password_b64).ok());
        match decoded {
            Some((u, p)) => {
                let username = String::from_utf8_lossy(&u).into_owned();
                let password = String::from_utf8_lossy(&p).into_owned();
                Ok(Some((username, password)))
            }
            None => {
                reply(stream, 501, "5.5.2 Cannot decode credentials").await?;
                Ok(None)
            }
        }
    }

    async fn handle_mail_from(
        &mut self,
        stream: &mut ServerStream,
        path: String,
        declared_size: Option<u64>,
        bad_param: bool,
    ) -> io::Result<()> {
        if self.state == SmtpState::HeloPending {
            reply(stream, 503, "5.5.1 Send EHLO first").await?;
            return Ok(());
        }
        if self.shared.config.auth_required && self.principal.is_none() {
            reply(stream, 530, "5.7.0 Authentication required").await?;
            return Ok(());
        }
        if self.mail_from.is_some() {
            reply(stream, 503, "5.5.1 Nested MAIL command").await?;
            return Ok(());
        }
        if bad_param {
            reply(stream, 501, "5.5.4 Invalid MAIL parameters").await?;
            return Ok(());
        }
        // Empty reverse-path (<>) is the null sender and always legal.
        if !path.is_empty() && crate::mime::parse_address(&path).is_none() {
            reply(stream, 501, "5.1.7 Bad sender address syntax").await?;
            return Ok(());
        }
        if let Some(size) = declared_size {
            if size > self.shared.config.max_message_size {
                reply(stream, 552, "5.3.4 Message size exceeds limit").await?;
                return Ok(());
            }
        }
        self.mail_from = Some(path);
        self.state = SmtpState::RcptPending;
        reply(stream, 250, "2.1.0 OK").await?;
        Ok(())
    }

    async fn handle_rcpt_to(&mut self, stream: &mut ServerStream, path: String) -> io::Result<()> {
        if self.mail_from.is_none() {
            reply(stream, 503, "5.5.1 MAIL FROM required first").await?;
            return Ok(());
        }
        if crate::mime::parse_address(&path).is_none() {
            reply(stream, 501, "5.1.3 Bad recipient address syntax").await?;
            return Ok(());
        }
        if self.rcpt_to.len() >= self.shared.config.max_recipients {
            reply(stream, 452, "4.5.3 Too many recipients").await?;
            return Ok(());
        }
        // Local-delivery policy: every syntactically valid recipient is ours.
        self.rcpt_to.push(path);
        reply(stream, 250, "2.1.5 OK").await?;
        Ok(())
    }

    /// DATA: dot-stuffed capture, size accounting, then the commit.
    async fn handle_data(&mut self, stream: &mut ServerStream) -> io::Result<()> {
        reply(stream, 354, "Start mail input; end with <CRLF>.<CRLF>").await?;

        let idle = self.shared.config.limits.idle_timeout();
        let mut capture = DataCapture::new(self.shared.config.max_message_size);
        loop {
            let line = match tokio::time::timeout(
                idle,
                read_line(stream, &mut self.read_buf, MAX_DATA_LINE),
            )
            .await
            {
                Err(_) => {
                    reply(stream, 421, "4.4.2 Idle timeout, closing").await?;
                    return Ok(());
                }
                Ok(Ok(l)) => l,
                Ok(Err(e)) => return Err(e),
            };
            match line {
                Line::Closed => {
                    // Connection lost mid-DATA: nothing was committed.
                    debug!(peer = %self.peer, "connection lost during DATA");
                    return Ok(());
                }
                Line::TooLong => capture.note_long_line(),
                Line::Ok(l) => {
                    if capture.line(&l) == CaptureStatus::Terminated {
                        break;
                    }
                }
            }
        }

        match capture.finish() {
            CaptureOutcome::LineTooLong => {
                reply(stream, 500, "5.6.0 Data line too long").await?;
            }
            CaptureOutcome::TooLarge => {
                reply(stream, 552, "5.3.4 Message too large").await?;
            }
            CaptureOutcome::Message(body) => {
                self.commit(stream, body).await?;
            }
        }
        // Implicit RSET either way: back to a clean envelope.
        self.reset_envelope();
        Ok(())
    }

    /// The transition point between wire and durable state.
    async fn commit(&mut self, stream: &mut ServerStream, mut body: Vec<u8>) -> io::Result<()> {
        let scan = HeaderScan::scan(&body);
        let msg_id = scan
            .message_id()
            .unwrap_or_else(|| message_id::generate(&self.shared.config.hostname));

        if self.shared.config.stamp_received {
            let stamp = format!(
                "Received: from {} ({})\r\n\tby {} with ESMTP;\r\n\t{}\r\n",
                self.ehlo_domain.as_deref().unwrap_or("unknown"),
                self.peer.ip(),
                self.shared.config.hostname,
                crate::mime::format_rfc2822(Utc::now()),
            );
            let mut stamped = stamp.into_bytes();
            stamped.append(&mut body);
            body = stamped;
        }

        // Duplicate ids resolve before anything is written, so an earlier
        // message's content is never clobbered.
        match self.shared.store.get_message(Mailbox::Inbox, &msg_id) {
            Ok(Some(existing)) => {
                let identical = self.shared.config.duplicate_idempotent
                    && self
                        .shared
                        .content
                        .get(&msg_id, existing.content_path.as_deref().map(std::path::Path::new))
                        .map(|stored| stored == body)
                        .unwrap_or(false);
                if identical {
                    debug!(peer = %self.peer, %msg_id, "duplicate submission, idempotent accept");
                    reply(stream, 250, &format!("2.0.0 OK queued as {}", msg_id)).await?;
                } else {
                    reply(stream, 451, "4.3.0 Duplicate message-id").await?;
                }
                return Ok(());
            }
            Ok(None) => {}
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "metadata lookup failed");
                reply(stream, 451, "4.3.0 Local error in processing").await?;
                return Ok(());
            }
        }

        let path = match self.shared.content.put(&msg_id, &body) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "content write failed");
                reply(stream, 451, "4.3.0 Local error in processing").await?;
                return Ok(());
            }
        };

        let mut rec = MessageRecord::new(msg_id.clone());
        rec.from_addr = self.mail_from.clone().unwrap_or_default();
        rec.to_addrs = self.rcpt_to.clone();
        rec.subject = scan.subject();
        rec.date = scan.date().or_else(|| Some(Utc::now()));
        rec.size_bytes = body.len() as u64;
        rec.content_path = Some(path.to_string_lossy().into_owned());
        rec.headers = scan.to_blob();

        match self.shared.store.insert_message(Mailbox::Inbox, &rec) {
            Ok(()) => {
                info!(peer = %self.peer, %msg_id, size = rec.size_bytes, "message queued");
                reply(stream, 250, &format!("2.0.0 OK queued as {}", msg_id)).await?;
            }
            Err(e) if e.kind == StoreErrorKind::AlreadyExists => {
                // Lost a race with an identical id; our content write may
                // have replaced the file, so only byte-identical survives.
                let identical = self.shared.config.duplicate_idempotent
                    && self
                        .shared
                        .content
                        .get(&msg_id, None)
                        .map(|stored| stored == body)
                        .unwrap_or(false);
                if identical {
                    reply(stream, 250, &format!("2.0.0 OK queued as {}", msg_id)).await?;
                } else {
                    reply(stream, 451, "4.3.0 Duplicate message-id").await?;
                }
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "metadata insert failed, removing content");
                let _ = self.shared.content.delete(&msg_id);
                reply(stream, 451, "4.3.0 Local error in processing").await?;
            }
        }
        Ok(())
    }
}
