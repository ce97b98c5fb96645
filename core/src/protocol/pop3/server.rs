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

//! POP3 mailbox engine (RFC 1939, CAPA per RFC 2449, STLS per RFC 2595).
//! Authentication freezes a snapshot of the mailbox; message numbers are
//! stable 1..N indexes into it for the whole TRANSACTION state, and the
//! deletion set is applied only on a clean QUIT.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::auth::{issue_apop_nonce, AuthOutcome, Authenticator, DenyReason, Principal};
use crate::config::{ListenMode, Pop3ServerConfig};
use crate::message_id::uidl_form;
use crate::net::{ServerStream, TlsServerContext};
use crate::protocol::pop3::{err, ok, write_body, Pop3Command, MAX_POP3_LINE};
use crate::protocol::{read_line, Line};
use crate::runtime::{self, ServerHandle};
use crate::store::{ContentStore, ListFilter, MailStore, Mailbox};

const BUSY_REPLY: &[u8] = b"-ERR server busy\r\n";

/// The POP3 mailbox server.
pub struct Pop3Server {
    config: Pop3ServerConfig,
    store: Arc<MailStore>,
    content: Arc<ContentStore>,
    auth: Arc<Authenticator>,
    tls: Option<TlsServerContext>,
}

struct Shared {
    config: Pop3ServerConfig,
    store: Arc<MailStore>,
    content: Arc<ContentStore>,
    auth: Arc<Authenticator>,
    tls: Option<TlsServerContext>,
}

impl Pop3Server {
    pub fn new(
        config: Pop3ServerConfig,
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

    pub async fn serve(self) -> io::Result<ServerHandle> {
        let listener = TcpListener::bind(&self.config.bind).await?;
        self.serve_on(listener)
    }

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
                    debug!(%peer, error = %e, "pop3 session ended with transport error");
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pop3State {
    Authorization,
    Transaction,
}

/// One frozen mailbox entry. Message numbers are the 1-based position in
/// the snapshot vector.
struct SnapshotEntry {
    message_id: String,
    size: u64,
    uidl: String,
    content_path: Option<String>,
}

struct Session {
    shared: Arc<Shared>,
    peer: SocketAddr,
    shutdown: watch::Receiver<bool>,
    state: Pop3State,
    tls_active: bool,
    username: Option<String>,
    principal: Option<Principal>,
    /// Greeting challenge; cleared by STLS (it was shown in plaintext).
    apop_nonce: Option<String>,
    snapshot: Vec<SnapshotEntry>,
    /// 1-based message numbers marked for deletion.
    deleted: HashSet<u32>,
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
                    debug!(%peer, error = %e, "implicit TLS handshake failed");
                    return Ok(());
                }
            }
        }
        _ => ServerStream::Plain(tcp),
    };
    let tls_active = stream.is_tls();
    let nonce = issue_apop_nonce(&shared.config.hostname);
    let session = Session {
        shared,
        peer,
        shutdown,
        state: Pop3State::Authorization,
        tls_active,
        username: None,
        principal: None,
        apop_nonce: Some(nonce),
        snapshot: Vec::new(),
        deleted: HashSet::new(),
        read_buf: Vec::with_capacity(512),
    };
    session.run(stream).await
}

impl Session {
    async fn run(mut self, mut stream: ServerStream) -> io::Result<()> {
        info!(peer = %self.peer, tls = self.tls_active, "pop3 session open");
        let greeting = format!(
            "POP3 server ready {}",
            self.apop_nonce.as_deref().unwrap_or("")
        );
        ok(&mut stream, greeting.trim_end()).await?;

        loop {
            if *self.shutdown.borrow() {
                // Graceful shutdown counts as reaching UPDATE for an
                // authenticated session.
                if self.state == Pop3State::Transaction {
                    let _ = self.apply_deletions();
                }
                err(&mut stream, "server shutting down").await?;
                break;
            }
            let line = match self.next_command_line(&mut stream).await? {
                Some(line) => line,
                None => break,
            };
            match Pop3Command::parse(&line) {
                Pop3Command::Capa => {
                    self.send_capa(&mut stream).await?;
                }
                Pop3Command::Stls => {
                    if self.tls_active || self.state != Pop3State::Authorization {
                        err(&mut stream, "STLS not available here").await?;
                        continue;
                    }
                    if self.shared.config.mode != ListenMode::StartTlsCapable
                        || self.shared.tls.is_none()
                    {
                        err(&mut stream, "TLS not available").await?;
                        continue;
                    }
                    ok(&mut stream, "Begin TLS negotiation").await?;
                    let ctx = self.shared.tls.as_ref().expect("checked above");
                    stream = match stream.upgrade_to_tls(ctx).await {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(peer = %self.peer, error = %e, "STLS handshake failed");
                            return Ok(());
                        }
                    };
                    // RFC 2595: prior authorization state is void; the
                    // plaintext APOP challenge dies with it.
                    self.tls_active = true;
                    self.username = None;
                    self.apop_nonce = None;
                }
                Pop3Command::User(name) => {
                    if self.state != Pop3State::Authorization {
                        err(&mut stream, "already authenticated").await?;
                        continue;
                    }
                    self.username = Some(name);
                    // Never confirms or denies that the account exists.
                    ok(&mut stream, "send PASS").await?;
                }
                Pop3Command::Pass(password) => {
                    self.handle_pass(&mut stream, password).await?;
                }
                Pop3Command::Apop { user, digest } => {
                    self.handle_apop(&mut stream, user, digest).await?;
                }
                Pop3Command::Stat => {
                    if !self.require_transaction(&mut stream).await? {
                        continue;
                    }
                    let (count, size) = self.live_totals();
                    ok(&mut stream, &format!("{} {}", count, size)).await?;
                }
                Pop3Command::List(which) => {
                    self.handle_list(&mut stream, which).await?;
                }
                Pop3Command::Uidl(which) => {
                    self.handle_uidl(&mut stream, which).await?;
                }
                Pop3Command::Retr(n) => {
                    self.handle_retr(&mut stream, n).await?;
                }
                Pop3Command::Top(n, k) => {
                    self.handle_top(&mut stream, n, k).await?;
                }
                Pop3Command::Dele(n) => {
                    if !self.require_transaction(&mut stream).await? {
                        continue;
                    }
                    if self.entry(n).is_none() {
                        err(&mut stream, "no such message").await?;
                    } else {
                        self.deleted.insert(n);
                        ok(&mut stream, &format!("message {} deleted", n)).await?;
                    }
                }
                Pop3Command::Rset => {
                    if !self.require_transaction(&mut stream).await? {
                        continue;
                    }
                    self.deleted.clear();
                    let (count, size) = self.live_totals();
                    ok(&mut stream, &format!("maildrop has {} messages ({} octets)", count, size))
                        .await?;
                }
                Pop3Command::Noop => {
                    ok(&mut stream, "").await?;
                }
                Pop3Command::Quit => {
                    self.handle_quit(&mut stream).await?;
                    break;
                }
                Pop3Command::Malformed(verb) => {
                    err(&mut stream, &format!("syntax error in {} arguments", verb)).await?;
                }
                Pop3Command::Unknown(raw) => {
                    debug!(peer = %self.peer, command = %raw, "unrecognized command");
                    err(&mut stream, "unknown command").await?;
                }
            }
        }
        info!(peer = %self.peer, "pop3 session closed");
        Ok(())
    }

    async fn next_command_line(&mut self, stream: &mut ServerStream) -> io::Result<Option<String>> {
        let idle = self.shared.config.limits.idle_timeout();
        match tokio::time::timeout(idle, read_line(stream, &mut self.read_buf, MAX_POP3_LINE)).await
        {
            Err(_) => {
                err(stream, "idle timeout, closing").await?;
                Ok(None)
            }
            Ok(Ok(Line::Ok(line))) => Ok(Some(line)),
            Ok(Ok(Line::TooLong)) => {
                err(stream, "line too long").await?;
                Ok(None)
            }
            Ok(Ok(Line::Closed)) => Ok(None),
            Ok(Err(e)) => Err(e),
        }
    }

    async fn require_transaction(&mut self, stream: &mut ServerStream) -> io::Result<bool> {
        if self.state == Pop3State::Transaction {
            Ok(true)
        } else {
            err(stream, "not authenticated").await?;
            Ok(false)
        }
    }

    async fn send_capa(&mut self, stream: &mut ServerStream) -> io::Result<()> {
        ok(stream, "capability list follows").await?;
        let mut caps: Vec<String> = vec![
            "USER".to_string(),
            "UIDL".to_string(),
            "TOP".to_string(),
            "PIPELINING".to_string(),
            "IMPLEMENTATION Fermoposta".to_string(),
        ];
        if self.shared.config.mode == ListenMode::StartTlsCapable
            && !self.tls_active
            && self.shared.tls.is_some()
        {
            caps.push("STLS".to_string());
        }
        use tokio::io::AsyncWriteExt;
        let mut out = String::new();
        for cap in caps {
            out.push_str(&cap);
            out.push_str("\r\n");
        }
        out.push_str(".\r\n");
        stream.write_all(out.as_bytes()).await?;
        stream.flush().await?;
        Ok(())
    }

    async fn handle_pass(&mut self, stream: &mut ServerStream, password: String) -> io::Result<()> {
        if self.state != Pop3State::Authorization {
            err(stream, "already authenticated").await?;
            return Ok(());
        }
        let Some(username) = self.username.clone() else {
            err(stream, "USER first").await?;
            return Ok(());
        };
        let auth = Arc::clone(&self.shared.auth);
        let user = username.clone();
        let outcome = tokio::task::spawn_blocking(move || auth.verify(&user, &password))
            .await
            .unwrap_or(AuthOutcome::Deny(DenyReason::BadCredentials));
        self.finish_auth(stream, username, outcome).await
    }

    async fn handle_apop(
        &mut self,
        stream: &mut ServerStream,
        user: String,
        digest: String,
    ) -> io::Result<()> {
        if self.state != Pop3State::Authorization {
            err(stream, "already authenticated").await?;
            return Ok(());
        }
        let Some(nonce) = self.apop_nonce.clone() else {
            err(stream, "APOP not available").await?;
            return Ok(());
        };
        let auth = Arc::clone(&self.shared.auth);
        let username = user.clone();
        let outcome =
            tokio::task::spawn_blocking(move || auth.verify_apop(&username, &nonce, &digest))
                .await
                .unwrap_or(AuthOutcome::Deny(DenyReason::BadCredentials));
        self.finish_auth(stream, user, outcome).await
    }

    /// Shared tail of PASS and APOP: on success take the mailbox snapshot
    /// and enter TRANSACTION.
    async fn finish_auth(
        &mut self,
        stream: &mut ServerStream,
        username: String,
        outcome: AuthOutcome,
    ) -> io::Result<()> {
        match outcome {
            AuthOutcome::Allow(principal) => {
                match self.load_snapshot(&principal) {
                    Ok(()) => {
                        info!(
                            peer = %self.peer,
                            username = %principal.username,
                            messages = self.snapshot.len(),
                            "pop3 authenticated"
                        );
                        self.principal = Some(principal);
                        self.state = Pop3State::Transaction;
                        let (count, size) = self.live_totals();
                        ok(
                            stream,
                            &format!("maildrop has {} messages ({} octets)", count, size),
                        )
                        .await?;
                    }
                    Err(e) => {
                        warn!(peer = %self.peer, error = %e, "snapshot load failed");
                        err(stream, "[SYS/TEMP] mailbox temporarily unavailable").await?;
                    }
                }
            }
            AuthOutcome::Deny(DenyReason::MechanismUnsupported) => {
                debug!(peer = %self.peer, %username, "APOP unsupported for account");
                err(stream, "APOP not available for this account").await?;
            }
            AuthOutcome::Deny(_) => {
                warn!(peer = %self.peer, %username, "pop3 authentication failed");
                err(stream, "[AUTH] invalid credentials").await?;
            }
        }
        Ok(())
    }

    /// Freeze the user's non-deleted inbox, oldest first. Concurrent
    /// deliveries become visible only to later sessions.
    fn load_snapshot(&mut self, principal: &Principal) -> Result<(), crate::store::StoreError> {
        let filter = ListFilter {
            recipient: if principal.email.is_empty() {
                None
            } else {
                Some(principal.email.clone())
            },
            ..Default::default()
        };
        let records = self.shared.store.list_messages(Mailbox::Inbox, &filter)?;
        self.snapshot = records
            .into_iter()
            .map(|r| SnapshotEntry {
                uidl: uidl_form(&r.message_id),
                size: r.size_bytes,
                content_path: r.content_path.clone(),
                message_id: r.message_id,
            })
            .collect();
        self.deleted.clear();
        Ok(())
    }

    fn entry(&self, n: u32) -> Option<&SnapshotEntry> {
        if self.deleted.contains(&n) {
            return None;
        }
        self.snapshot.get((n as usize).checked_sub(1)?)
    }

    /// Count and octet total of entries not marked deleted.
    fn live_totals(&self) -> (usize, u64) {
        let mut count = 0usize;
        let mut size = 0u64;
        for (i, entry) in self.snapshot.iter().enumerate() {
            if !self.deleted.contains(&(i as u32 + 1)) {
                count += 1;
                size += entry.size;
            }
        }
        (count, size)
    }

    async fn handle_list(
        &mut self,
        stream: &mut ServerStream,
        which: Option<u32>,
    ) -> io::Result<()> {
        if !self.require_transaction(stream).await? {
            return Ok(());
        }
        match which {
            Some(n) => match self.entry(n) {
                Some(e) => ok(stream, &format!("{} {}", n, e.size)).await,
                None => err(stream, "no such message").await,
            },
            None => {
                let (count, size) = self.live_totals();
                ok(stream, &format!("{} messages ({} octets)", count, size)).await?;
                use tokio::io::AsyncWriteExt;
                let mut out = String::new();
                for (i, entry) in self.snapshot.iter().enumerate() {
                    let n = i as u32 + 1;
                    if !self.deleted.contains(&n) {
                        out.push_str(&format!("{} {}\r\n", n, entry.size));
                    }
                }
                out.push_str(".\r\n");
                stream.write_all(out.as_bytes()).await?;
                stream.flush().await?;
                Ok(())
            }
        }
    }

    async fn handle_uidl(
        &mut self,
        stream: &mut ServerStream,
        which: Option<u32>,
    ) -> io::Result<()> {
        if !self.require_transaction(stream).await? {
            return Ok(());
        }
        match which {
            Some(n) => match self.entry(n) {
                Some(e) => ok(stream, &format!("{} {}", n, e.uidl)).await,
                None => err(stream, "no such message").await,
            },
            None => {
                ok(stream, "").await?;
                use tokio::io::AsyncWriteExt;
                let mut out = String::new();
                for (i, entry) in self.snapshot.iter().enumerate() {
                    let n = i as u32 + 1;
                    if !self.deleted.contains(&n) {
                        out.push_str(&format!("{} {}\r\n", n, entry.uidl));
                    }
                }
                out.push_str(".\r\n");
                stream.write_all(out.as_bytes()).await?;
                stream.flush().await?;
                Ok(())
            }
        }
    }

    async fn handle_retr(&mut self, stream: &mut ServerStream, n: u32) -> io::Result<()> {
        if !self.require_transaction(stream).await? {
            return Ok(());
        }
        let Some(entry) = self.entry(n) else {
            err(stream, "no such message").await?;
            return Ok(());
        };
        let hint = entry.content_path.clone();
        let message_id = entry.message_id.clone();
        let size = entry.size;
        match self
            .shared
            .content
            .get(&message_id, hint.as_deref().map(std::path::Path::new))
        {
            Ok(bytes) => {
                ok(stream, &format!("{} octets", size)).await?;
                write_body(stream, &bytes, None).await?;
                // POP3 has no read flag on the wire; the metadata row keeps
                // one for the platform's own list views.
                if let Err(e) = self.shared.store.mark_read(Mailbox::Inbox, &message_id, true) {
                    debug!(%message_id, error = %e, "mark_read failed");
                }
            }
            Err(e) => {
                warn!(peer = %self.peer, %message_id, error = %e, "content read failed");
                err(stream, "message content unavailable").await?;
            }
        }
        Ok(())
    }

    async fn handle_top(&mut self, stream: &mut ServerStream, n: u32, k: u32) -> io::Result<()> {
        if !self.require_transaction(stream).await? {
            return Ok(());
        }
        let Some(entry) = self.entry(n) else {
            err(stream, "no such message").await?;
            return Ok(());
        };
        let hint = entry.content_path.clone();
        let message_id = entry.message_id.clone();
        match self
            .shared
            .content
            .get(&message_id, hint.as_deref().map(std::path::Path::new))
        {
            Ok(bytes) => {
                ok(stream, "top of message follows").await?;
                write_body(stream, &bytes, Some(k as usize)).await?;
            }
            Err(e) => {
                warn!(peer = %self.peer, %message_id, error = %e, "content read failed");
                err(stream, "message content unavailable").await?;
            }
        }
        Ok(())
    }

    /// QUIT: the only path into UPDATE. Deletions marked this session are
    /// applied atomically; anything else was discarded by disconnecting.
    async fn handle_quit(&mut self, stream: &mut ServerStream) -> io::Result<()> {
        if self.state != Pop3State::Transaction {
            ok(stream, &format!("{} signing off", self.shared.config.hostname)).await?;
            return Ok(());
        }
        let deleted = self.deleted.len();
        match self.apply_deletions() {
            Ok(()) => {
                let user = self
                    .principal
                    .as_ref()
                    .map(|p| p.username.as_str())
                    .unwrap_or("?");
                info!(peer = %self.peer, user, deleted, "pop3 update complete");
                ok(
                    stream,
                    &format!(
                        "{} signing off ({} messages deleted)",
                        self.shared.config.hostname, deleted
                    ),
                )
                .await?;
            }
            Err(e) => {
                warn!(peer = %self.peer, error = %e, "deletion commit failed");
                err(stream, "some deleted messages not removed").await?;
            }
        }
        Ok(())
    }

    fn apply_deletions(&mut self) -> Result<(), crate::store::StoreError> {
        let ids: Vec<String> = self
            .deleted
            .iter()
            .filter_map(|&n| self.snapshot.get(n as usize - 1))
            .map(|e| e.message_id.clone())
            .collect();
        self.deleted.clear();
        self.shared.store.apply_deletions(Mailbox::Inbox, &ids)
    }
}
