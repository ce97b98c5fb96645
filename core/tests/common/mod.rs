/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * Shared fixtures for the integration tests: a temp-dir store stack, user
 * seeding, servers bound to port 0, and a raw line-protocol client for
 * driving the wire directly.
 */

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use fermoposta_core::auth::{Authenticator, PasswordScheme};
use fermoposta_core::config::{Pop3ServerConfig, SessionLimits, SmtpServerConfig, StoreConfig};
use fermoposta_core::protocol::pop3::Pop3Server;
use fermoposta_core::protocol::smtp::SmtpServer;
use fermoposta_core::runtime::ServerHandle;
use fermoposta_core::store::{ContentStore, MailStore, UserRecord};

pub struct TestEnv {
    #[allow(dead_code)]
    pub dir: tempfile::TempDir,
    pub store: Arc<MailStore>,
    pub content: Arc<ContentStore>,
    pub auth: Arc<Authenticator>,
}

pub fn env() -> TestEnv {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new(dir.path().join("mail.db"), dir.path().join("emails"));
    let store = Arc::new(MailStore::open(&config).unwrap());
    let content = Arc::new(ContentStore::new(dir.path().join("emails")).unwrap());
    let auth = Arc::new(Authenticator::new(Arc::clone(&store)));
    TestEnv {
        dir,
        store,
        content,
        auth,
    }
}

/// Seed a user with the default (PBKDF2) password scheme.
pub fn add_user(env: &TestEnv, username: &str, email: &str, password: &str) {
    let (hash, salt) = PasswordScheme::hash_password(password);
    env.store
        .create_user(&UserRecord {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: hash,
            salt,
            is_active: true,
            created_at: Utc::now(),
            last_login: None,
        })
        .unwrap();
}

/// Seed a legacy plain-scheme user (the only kind APOP can serve).
#[allow(dead_code)]
pub fn add_plain_user(env: &TestEnv, username: &str, email: &str, secret: &str) {
    env.store
        .create_user(&UserRecord {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: format!("plain${}", secret),
            salt: String::new(),
            is_active: true,
            created_at: Utc::now(),
            last_login: None,
        })
        .unwrap();
}

pub fn quick_limits() -> SessionLimits {
    SessionLimits {
        max_connections: 16,
        idle_timeout_secs: 10,
        total_timeout_secs: 30,
        grace_period_secs: 2,
    }
}

pub async fn start_smtp(env: &TestEnv, mut config: SmtpServerConfig) -> ServerHandle {
    config.bind = "127.0.0.1:0".to_string();
    let listener = TcpListener::bind(&config.bind).await.unwrap();
    SmtpServer::new(
        config,
        Arc::clone(&env.store),
        Arc::clone(&env.content),
        Arc::clone(&env.auth),
        None,
    )
    .serve_on(listener)
    .unwrap()
}

#[allow(dead_code)]
pub async fn start_pop3(env: &TestEnv, mut config: Pop3ServerConfig) -> ServerHandle {
    config.bind = "127.0.0.1:0".to_string();
    let listener = TcpListener::bind(&config.bind).await.unwrap();
    Pop3Server::new(
        config,
        Arc::clone(&env.store),
        Arc::clone(&env.content),
        Arc::clone(&env.auth),
        None,
    )
    .serve_on(listener)
    .unwrap()
}

/// Raw line-level client for driving either protocol by hand.
pub struct WireClient {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl WireClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub async fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
        self.stream.flush().await.unwrap();
    }

    #[allow(dead_code)]
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// One CRLF line, terminator stripped.
    pub async fn line(&mut self) -> String {
        loop {
            if let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8_lossy(&line).into_owned();
            }
            let mut chunk = [0u8; 1024];
            let n = self.stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed while expecting a line");
            self.pending.extend_from_slice(&chunk[..n]);
        }
    }

    /// Full SMTP reply: lines until the non-continuation one. Returns
    /// (code, all lines).
    pub async fn smtp_reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = Vec::new();
        loop {
            let line = self.line().await;
            let code: u16 = line[..3].parse().expect("reply starts with a code");
            let done = line.as_bytes().get(3) != Some(&b'-');
            lines.push(line);
            if done {
                return (code, lines);
            }
        }
    }

    /// POP3 status line; panics if the indicator is missing.
    #[allow(dead_code)]
    pub async fn pop3_status(&mut self) -> (bool, String) {
        let line = self.line().await;
        if let Some(rest) = line.strip_prefix("+OK") {
            (true, rest.trim().to_string())
        } else if let Some(rest) = line.strip_prefix("-ERR") {
            (false, rest.trim().to_string())
        } else {
            panic!("not a POP3 status line: {:?}", line);
        }
    }

    /// POP3 multiline payload after a +OK, dot-unstuffed, CRLF preserved.
    #[allow(dead_code)]
    pub async fn pop3_multiline(&mut self) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let line = self.line().await;
            if line == "." {
                return out;
            }
            let text = line.strip_prefix('.').unwrap_or(&line);
            out.extend_from_slice(text.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
    }

    /// Read until the peer closes; returns whatever arrived.
    #[allow(dead_code)]
    pub async fn read_to_end(mut self) -> Vec<u8> {
        let mut out = self.pending.split_off(0);
        let mut chunk = [0u8; 1024];
        while let Ok(n) = self.stream.read(&mut chunk).await {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    }
}
