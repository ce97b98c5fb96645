/*
 * record.rs
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

//! Persisted row types. Inbox and sent share one shape so user actions
//! (read/spam/delete marks) and filters apply uniformly to both tables.

use chrono::{DateTime, Utc};

/// Which metadata table a message row lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mailbox {
    Inbox,
    Sent,
}

impl Mailbox {
    pub(crate) fn table(self) -> &'static str {
        match self {
            Mailbox::Inbox => "inbox",
            Mailbox::Sent => "sent",
        }
    }
}

/// One message's metadata row. `content_path` points at the file the
/// content store wrote; the raw bytes never live in the database.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub message_id: String,
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    pub subject: String,
    pub date: Option<DateTime<Utc>>,
    pub size_bytes: u64,
    pub is_read: bool,
    pub is_deleted: bool,
    pub is_spam: bool,
    pub spam_score: f64,
    pub content_path: Option<String>,
    /// Raw header section, kept for list views that must not touch the
    /// content file.
    pub headers: String,
}

impl MessageRecord {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            from_addr: String::new(),
            to_addrs: Vec::new(),
            subject: String::new(),
            date: None,
            size_bytes: 0,
            is_read: false,
            is_deleted: false,
            is_spam: false,
            spam_score: 0.0,
            content_path: None,
            headers: String::new(),
        }
    }

    /// True when `email` appears among the recipients (case-insensitive).
    pub fn addressed_to(&self, email: &str) -> bool {
        self.to_addrs
            .iter()
            .any(|a| a.eq_ignore_ascii_case(email))
    }
}

/// One account row. The password is stored as an encoded scheme string
/// (see `auth::PasswordScheme`); cleartext is never persisted for the
/// default scheme.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub salt: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}
