/*
 * db.rs
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

//! SQLite metadata store. One logical writer: the connection sits behind a
//! mutex, journal_mode is WAL so readers do not block the writer, and every
//! write runs inside a bounded busy-retry loop.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::store::error::{StoreError, StoreErrorKind};
use crate::store::record::{Mailbox, MessageRecord, UserRecord};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS inbox (
    message_id   TEXT PRIMARY KEY,
    from_addr    TEXT NOT NULL,
    to_addrs     TEXT NOT NULL,
    subject      TEXT NOT NULL,
    date         TEXT,
    size_bytes   INTEGER NOT NULL,
    is_read      INTEGER NOT NULL DEFAULT 0,
    is_deleted   INTEGER NOT NULL DEFAULT 0,
    is_spam      INTEGER NOT NULL DEFAULT 0,
    spam_score   REAL NOT NULL DEFAULT 0,
    content_path TEXT,
    headers      TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS sent (
    message_id   TEXT PRIMARY KEY,
    from_addr    TEXT NOT NULL,
    to_addrs     TEXT NOT NULL,
    subject      TEXT NOT NULL,
    date         TEXT,
    size_bytes   INTEGER NOT NULL,
    is_read      INTEGER NOT NULL DEFAULT 0,
    is_deleted   INTEGER NOT NULL DEFAULT 0,
    is_spam      INTEGER NOT NULL DEFAULT 0,
    spam_score   REAL NOT NULL DEFAULT 0,
    content_path TEXT,
    headers      TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS users (
    username      TEXT PRIMARY KEY,
    email         TEXT NOT NULL,
    password_hash TEXT NOT NULL,
    salt          TEXT NOT NULL,
    is_active     INTEGER NOT NULL DEFAULT 1,
    created_at    TEXT NOT NULL,
    last_login    TEXT
);
";

/// Row filter for message listings.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// Only rows addressed to this email (exact membership in to_addrs).
    pub recipient: Option<String>,
    pub include_deleted: bool,
    pub only_unread: bool,
    /// Some(true): spam only; Some(false): ham only; None: both.
    pub spam: Option<bool>,
}

/// Handle to the metadata database. Cheap to share behind an `Arc`; closed
/// explicitly with `close()`.
pub struct MailStore {
    conn: Mutex<Connection>,
    busy_retries: u32,
    busy_backoff: Duration,
}

impl MailStore {
    /// Open (creating if needed) the database at `config.db_path` and apply
    /// the schema. WAL journaling plus a driver-level busy timeout.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(parent) = config.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(&config.db_path)?;
        conn.busy_timeout(Duration::from_millis(config.busy_backoff_ms.max(1)))?;
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            busy_retries: config.busy_retries,
            busy_backoff: Duration::from_millis(config.busy_backoff_ms),
        })
    }

    /// Run `f` against the connection, retrying on transient lock errors
    /// with doubling backoff. Non-busy errors pass straight through.
    fn with_retry<T>(
        &self,
        op: &str,
        f: impl Fn(&Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let conn = self.conn.lock().expect("store mutex poisoned");
        let mut attempt = 0u32;
        loop {
            match f(&conn) {
                Err(e) if e.is_busy() && attempt < self.busy_retries => {
                    let delay = self.busy_backoff * (1 << attempt.min(8));
                    warn!(op, attempt, ?delay, "database busy, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Insert a message row. `StoreErrorKind::AlreadyExists` when the
    /// message-id is already present in the table.
    pub fn insert_message(
        &self,
        mailbox: Mailbox,
        rec: &MessageRecord,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "INSERT INTO {} (message_id, from_addr, to_addrs, subject, date, size_bytes, \
             is_read, is_deleted, is_spam, spam_score, content_path, headers) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            mailbox.table()
        );
        self.with_retry("insert_message", |conn| {
            conn.execute(
                &sql,
                params![
                    rec.message_id,
                    rec.from_addr,
                    rec.to_addrs.join(","),
                    rec.subject,
                    rec.date.map(|d| d.to_rfc3339()),
                    rec.size_bytes as i64,
                    rec.is_read,
                    rec.is_deleted,
                    rec.is_spam,
                    rec.spam_score,
                    rec.content_path,
                    rec.headers,
                ],
            )?;
            Ok(())
        })?;
        debug!(message_id = %rec.message_id, table = mailbox.table(), "message row inserted");
        Ok(())
    }

    pub fn get_message(
        &self,
        mailbox: Mailbox,
        message_id: &str,
    ) -> Result<Option<MessageRecord>, StoreError> {
        let sql = format!(
            "SELECT message_id, from_addr, to_addrs, subject, date, size_bytes, is_read, \
             is_deleted, is_spam, spam_score, content_path, headers FROM {} WHERE message_id = ?1",
            mailbox.table()
        );
        self.with_retry("get_message", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params![message_id])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_record(row)?)),
                None => Ok(None),
            }
        })
    }

    /// List rows in stable insertion order (oldest first). A POP3 snapshot
    /// is exactly one such listing.
    pub fn list_messages(
        &self,
        mailbox: Mailbox,
        filter: &ListFilter,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let sql = format!(
            "SELECT message_id, from_addr, to_addrs, subject, date, size_bytes, is_read, \
             is_deleted, is_spam, spam_score, content_path, headers FROM {} ORDER BY rowid ASC",
            mailbox.table()
        );
        let rows = self.with_retry("list_messages", |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                out.push(row_to_record(row)?);
            }
            Ok(out)
        })?;
        Ok(rows
            .into_iter()
            .filter(|r| filter.include_deleted || !r.is_deleted)
            .filter(|r| !filter.only_unread || !r.is_read)
            .filter(|r| filter.spam.map_or(true, |s| r.is_spam == s))
            .filter(|r| {
                filter
                    .recipient
                    .as_deref()
                    .map_or(true, |email| r.addressed_to(email))
            })
            .collect())
    }

    pub fn mark_read(
        &self,
        mailbox: Mailbox,
        message_id: &str,
        is_read: bool,
    ) -> Result<(), StoreError> {
        self.update_flag(mailbox, message_id, "is_read", is_read)
    }

    pub fn set_deleted(
        &self,
        mailbox: Mailbox,
        message_id: &str,
        is_deleted: bool,
    ) -> Result<(), StoreError> {
        self.update_flag(mailbox, message_id, "is_deleted", is_deleted)
    }

    pub fn mark_spam(
        &self,
        mailbox: Mailbox,
        message_id: &str,
        is_spam: bool,
        spam_score: f64,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET is_spam = ?2, spam_score = ?3 WHERE message_id = ?1",
            mailbox.table()
        );
        self.with_retry("mark_spam", |conn| {
            let n = conn.execute(&sql, params![message_id, is_spam, spam_score])?;
            if n == 0 {
                return Err(StoreError::not_found(message_id));
            }
            Ok(())
        })
    }

    fn update_flag(
        &self,
        mailbox: Mailbox,
        message_id: &str,
        column: &str,
        value: bool,
    ) -> Result<(), StoreError> {
        let sql = format!(
            "UPDATE {} SET {} = ?2 WHERE message_id = ?1",
            mailbox.table(),
            column
        );
        self.with_retry(column, |conn| {
            let n = conn.execute(&sql, params![message_id, value])?;
            if n == 0 {
                return Err(StoreError::not_found(message_id));
            }
            Ok(())
        })
    }

    /// Apply a POP3 deletion set in one transaction: every id marked
    /// deleted, or none of them.
    pub fn apply_deletions(
        &self,
        mailbox: Mailbox,
        message_ids: &[String],
    ) -> Result<(), StoreError> {
        if message_ids.is_empty() {
            return Ok(());
        }
        let sql = format!(
            "UPDATE {} SET is_deleted = 1 WHERE message_id = ?1",
            mailbox.table()
        );
        self.with_retry("apply_deletions", |conn| {
            let tx = conn.unchecked_transaction()?;
            for id in message_ids {
                tx.execute(&sql, params![id])?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn create_user(&self, user: &UserRecord) -> Result<(), StoreError> {
        self.with_retry("create_user", |conn| {
            conn.execute(
                "INSERT INTO users (username, email, password_hash, salt, is_active, created_at, last_login) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user.username,
                    user.email,
                    user.password_hash,
                    user.salt,
                    user.is_active,
                    user.created_at.to_rfc3339(),
                    user.last_login.map(|d| d.to_rfc3339()),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, username: &str) -> Result<Option<UserRecord>, StoreError> {
        self.with_retry("get_user", |conn| {
            let mut stmt = conn.prepare(
                "SELECT username, email, password_hash, salt, is_active, created_at, last_login \
                 FROM users WHERE username = ?1",
            )?;
            let mut rows = stmt.query(params![username])?;
            match rows.next()? {
                Some(row) => Ok(Some(row_to_user(row)?)),
                None => Ok(None),
            }
        })
    }

    pub fn touch_last_login(&self, username: &str) -> Result<(), StoreError> {
        self.with_retry("touch_last_login", |conn| {
            conn.execute(
                "UPDATE users SET last_login = ?2 WHERE username = ?1",
                params![username, Utc::now().to_rfc3339()],
            )?;
            Ok(())
        })
    }

    /// Close the underlying connection. Errors on close are reported, not
    /// swallowed.
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().expect("store mutex poisoned");
        conn.close()
            .map_err(|(_, e)| StoreError::new(StoreErrorKind::Sql, e.to_string()))
    }
}

fn parse_date(text: Option<String>) -> Option<DateTime<Utc>> {
    text.and_then(|t| DateTime::parse_from_rfc3339(&t).ok())
        .map(|d| d.with_timezone(&Utc))
}

fn row_to_record(row: &Row<'_>) -> Result<MessageRecord, StoreError> {
    let to_addrs: String = row.get(2)?;
    Ok(MessageRecord {
        message_id: row.get(0)?,
        from_addr: row.get(1)?,
        to_addrs: if to_addrs.is_empty() {
            Vec::new()
        } else {
            to_addrs.split(',').map(|s| s.trim().to_string()).collect()
        },
        subject: row.get(3)?,
        date: parse_date(row.get(4)?),
        size_bytes: row.get::<_, i64>(5)? as u64,
        is_read: row.get(6)?,
        is_deleted: row.get(7)?,
        is_spam: row.get(8)?,
        spam_score: row.get(9)?,
        content_path: row.get(10)?,
        headers: row.get(11)?,
    })
}

fn row_to_user(row: &Row<'_>) -> Result<UserRecord, StoreError> {
    Ok(UserRecord {
        username: row.get(0)?,
        email: row.get(1)?,
        password_hash: row.get(2)?,
        salt: row.get(3)?,
        is_active: row.get(4)?,
        created_at: parse_date(row.get(5)?).unwrap_or_else(Utc::now),
        last_login: parse_date(row.get(6)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, MailStore) {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::new(dir.path().join("mail.db"), dir.path().join("emails"));
        let store = MailStore::open(&config).unwrap();
        (dir, store)
    }

    fn record(id: &str, to: &str) -> MessageRecord {
        let mut rec = MessageRecord::new(id);
        rec.from_addr = "a@x".to_string();
        rec.to_addrs = vec![to.to_string()];
        rec.subject = "t".to_string();
        rec.size_bytes = 10;
        rec
    }

    #[test]
    fn insert_and_get() {
        let (_dir, store) = open_store();
        store
            .insert_message(Mailbox::Inbox, &record("<1@x>", "b@y"))
            .unwrap();
        let got = store.get_message(Mailbox::Inbox, "<1@x>").unwrap().unwrap();
        assert_eq!(got.from_addr, "a@x");
        assert_eq!(got.to_addrs, vec!["b@y"]);
        assert!(store.get_message(Mailbox::Sent, "<1@x>").unwrap().is_none());
    }

    #[test]
    fn duplicate_insert_is_already_exists() {
        let (_dir, store) = open_store();
        store
            .insert_message(Mailbox::Inbox, &record("<1@x>", "b@y"))
            .unwrap();
        let err = store
            .insert_message(Mailbox::Inbox, &record("<1@x>", "b@y"))
            .unwrap_err();
        assert_eq!(err.kind, StoreErrorKind::AlreadyExists);
    }

    #[test]
    fn listing_is_insertion_ordered_and_filtered() {
        let (_dir, store) = open_store();
        for (id, to) in [("<1@x>", "b@y"), ("<2@x>", "b@y"), ("<3@x>", "c@y")] {
            store.insert_message(Mailbox::Inbox, &record(id, to)).unwrap();
        }
        store.set_deleted(Mailbox::Inbox, "<2@x>", true).unwrap();

        let all = store
            .list_messages(Mailbox::Inbox, &ListFilter::default())
            .unwrap();
        assert_eq!(
            all.iter().map(|r| r.message_id.as_str()).collect::<Vec<_>>(),
            vec!["<1@x>", "<3@x>"]
        );

        let filter = ListFilter {
            recipient: Some("b@y".to_string()),
            ..Default::default()
        };
        let for_b = store.list_messages(Mailbox::Inbox, &filter).unwrap();
        assert_eq!(for_b.len(), 1);
        assert_eq!(for_b[0].message_id, "<1@x>");
    }

    #[test]
    fn deletions_apply_atomically() {
        let (_dir, store) = open_store();
        for id in ["<1@x>", "<2@x>", "<3@x>"] {
            store.insert_message(Mailbox::Inbox, &record(id, "b@y")).unwrap();
        }
        store
            .apply_deletions(
                Mailbox::Inbox,
                &["<1@x>".to_string(), "<3@x>".to_string()],
            )
            .unwrap();
        let left = store
            .list_messages(Mailbox::Inbox, &ListFilter::default())
            .unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].message_id, "<2@x>");
    }

    #[test]
    fn user_round_trip() {
        let (_dir, store) = open_store();
        store
            .create_user(&UserRecord {
                username: "alice".to_string(),
                email: "alice@example.org".to_string(),
                password_hash: "pbkdf2-sha256$1$00$00".to_string(),
                salt: "00".to_string(),
                is_active: true,
                created_at: Utc::now(),
                last_login: None,
            })
            .unwrap();
        let u = store.get_user("alice").unwrap().unwrap();
        assert!(u.is_active);
        assert!(u.last_login.is_none());
        store.touch_last_login("alice").unwrap();
        assert!(store.get_user("alice").unwrap().unwrap().last_login.is_some());
        assert!(store.get_user("bob").unwrap().is_none());
    }
}
