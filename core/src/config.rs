/*
 * config.rs
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

//! Configuration structs for servers, clients, and the store. All explicit:
//! built by the embedding application and passed by value into the engine
//! constructors. No process-wide state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How a listener handles TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenMode {
    /// Plaintext only; STARTTLS/STLS not advertised.
    Plain,
    /// TLS handshake before any protocol bytes (465/995 convention).
    ImplicitTls,
    /// Plaintext greeting, upgrade advertised (STARTTLS/STLS).
    StartTlsCapable,
}

impl Default for ListenMode {
    fn default() -> Self {
        ListenMode::Plain
    }
}

/// Certificate and key for a TLS-capable listener (PEM files).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsServerConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Connection admission and timeout limits, shared by both servers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    /// Connections over this count are refused with the protocol busy reply.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// No full command line within this window closes the session.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Absolute cap on session lifetime.
    #[serde(default = "default_total_timeout")]
    pub total_timeout_secs: u64,
    /// How long active sessions get to finish after stop() is requested.
    #[serde(default = "default_grace_period")]
    pub grace_period_secs: u64,
}

fn default_max_connections() -> usize {
    50
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_total_timeout() -> u64 {
    1800
}

fn default_grace_period() -> u64 {
    10
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            idle_timeout_secs: default_idle_timeout(),
            total_timeout_secs: default_total_timeout(),
            grace_period_secs: default_grace_period(),
        }
    }
}

impl SessionLimits {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_secs(self.total_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// SMTP receive server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpServerConfig {
    /// Listen address, e.g. "0.0.0.0:25".
    #[serde(default = "default_smtp_bind")]
    pub bind: String,
    /// Hostname used in the banner, EHLO reply, and Received stamping.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub mode: ListenMode,
    /// Reject MAIL FROM with 530 until the session has authenticated.
    #[serde(default)]
    pub auth_required: bool,
    /// Permit AUTH on a plaintext connection. When false, AUTH before TLS
    /// gets 538 (RFC 4954 policy reply).
    #[serde(default)]
    pub allow_plaintext_auth: bool,
    /// Cap on the DATA payload in octets; also advertised via SIZE.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
    #[serde(default = "default_max_recipients")]
    pub max_recipients: usize,
    /// Duplicate message-id with byte-identical content is accepted with 250
    /// (and 451 otherwise). When false, any duplicate gets 451.
    #[serde(default = "default_true")]
    pub duplicate_idempotent: bool,
    /// Prepend a Received trace header before committing content.
    #[serde(default = "default_true")]
    pub stamp_received: bool,
    #[serde(default)]
    pub limits: SessionLimits,
}

fn default_smtp_bind() -> String {
    "0.0.0.0:25".to_string()
}

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_max_message_size() -> u64 {
    25 * 1024 * 1024
}

fn default_max_recipients() -> usize {
    100
}

fn default_true() -> bool {
    true
}

impl Default for SmtpServerConfig {
    fn default() -> Self {
        Self {
            bind: default_smtp_bind(),
            hostname: default_hostname(),
            mode: ListenMode::default(),
            auth_required: false,
            allow_plaintext_auth: false,
            max_message_size: default_max_message_size(),
            max_recipients: default_max_recipients(),
            duplicate_idempotent: true,
            stamp_received: true,
            limits: SessionLimits::default(),
        }
    }
}

/// POP3 mailbox server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pop3ServerConfig {
    /// Listen address, e.g. "0.0.0.0:110".
    #[serde(default = "default_pop3_bind")]
    pub bind: String,
    /// Hostname used in the greeting banner and the APOP challenge.
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default)]
    pub mode: ListenMode,
    #[serde(default)]
    pub limits: SessionLimits,
}

fn default_pop3_bind() -> String {
    "0.0.0.0:110".to_string()
}

impl Default for Pop3ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_pop3_bind(),
            hostname: default_hostname(),
            mode: ListenMode::default(),
            limits: SessionLimits::default(),
        }
    }
}

/// AUTH mechanism preference for the SMTP client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPreference {
    Plain,
    Login,
    /// Try PLAIN first, fall back to LOGIN.
    Auto,
}

impl Default for AuthPreference {
    fn default() -> Self {
        AuthPreference::Auto
    }
}

/// Retry discipline for client engines: up to `max_retries` attempts with
/// exponential backoff starting at `base_delay_secs`. Permanent (5xx)
/// failures are never retried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_secs: u64,
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay(),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after attempt `n` (0-based): base * 2^n.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.base_delay_secs.saturating_mul(1u64 << attempt.min(16)))
    }
}

/// SMTP submission client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpClientConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    /// Handshake before protocol bytes (465 convention).
    #[serde(default)]
    pub implicit_tls: bool,
    /// Upgrade via STARTTLS when the server advertises it.
    #[serde(default = "default_true")]
    pub use_starttls: bool,
    #[serde(default)]
    pub auth_preference: AuthPreference,
    #[serde(default = "default_hostname")]
    pub ehlo_hostname: String,
    /// Accept self-signed/untrusted server certificates. Test deployments only.
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Persist a SentRecord plus content file after a successful submission.
    #[serde(default)]
    pub save_sent_copies: bool,
}

fn default_smtp_port() -> u16 {
    587
}

impl Default for SmtpClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_smtp_port(),
            implicit_tls: false,
            use_starttls: true,
            auth_preference: AuthPreference::default(),
            ehlo_hostname: default_hostname(),
            accept_invalid_certs: false,
            retry: RetryPolicy::default(),
            save_sent_copies: false,
        }
    }
}

/// POP3 retrieval client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pop3ClientConfig {
    pub host: String,
    #[serde(default = "default_pop3_port")]
    pub port: u16,
    #[serde(default)]
    pub implicit_tls: bool,
    /// Upgrade via STLS when the server advertises it.
    #[serde(default = "default_true")]
    pub use_stls: bool,
    /// Authenticate with APOP when the greeting carries a challenge.
    #[serde(default)]
    pub use_apop: bool,
    #[serde(default)]
    pub accept_invalid_certs: bool,
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_pop3_port() -> u16 {
    110
}

impl Default for Pop3ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: default_pop3_port(),
            implicit_tls: false,
            use_stls: true,
            use_apop: false,
            accept_invalid_certs: false,
            retry: RetryPolicy::default(),
        }
    }
}

/// Persistence layer configuration: SQLite database plus the content
/// directory holding one `.eml` file per message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub db_path: PathBuf,
    pub emails_dir: PathBuf,
    /// Attempts for a write hitting SQLITE_BUSY before giving up.
    #[serde(default = "default_busy_retries")]
    pub busy_retries: u32,
    /// Base backoff between busy retries, doubled per attempt.
    #[serde(default = "default_busy_backoff")]
    pub busy_backoff_ms: u64,
}

fn default_busy_retries() -> u32 {
    5
}

fn default_busy_backoff() -> u64 {
    20
}

impl StoreConfig {
    pub fn new(db_path: impl Into<PathBuf>, emails_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            emails_dir: emails_dir.into(),
            busy_retries: default_busy_retries(),
            busy_backoff_ms: default_busy_backoff(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smtp_defaults() {
        let c = SmtpServerConfig::default();
        assert_eq!(c.bind, "0.0.0.0:25");
        assert!(c.duplicate_idempotent);
        assert!(!c.auth_required);
        assert_eq!(c.limits.max_connections, 50);
    }

    #[test]
    fn retry_backoff_doubles() {
        let r = RetryPolicy {
            max_retries: 3,
            base_delay_secs: 2,
        };
        assert_eq!(r.delay_for(0).as_secs(), 2);
        assert_eq!(r.delay_for(1).as_secs(), 4);
        assert_eq!(r.delay_for(2).as_secs(), 8);
    }
}
