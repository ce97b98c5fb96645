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

//! Persistence: SQLite metadata store (inbox/sent/users) and the content
//! store holding one RFC 5322 file per message. The two are composed by the
//! protocol engines; the metadata store does not know about content files
//! beyond the recorded path.

mod content;
mod db;
mod error;
mod record;

pub use content::ContentStore;
pub use db::{ListFilter, MailStore};
pub use error::{StoreError, StoreErrorKind};
pub use record::{Mailbox, MessageRecord, UserRecord};
