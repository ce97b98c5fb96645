/*
 * lib.rs
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

//! Fermoposta core: SMTP receive server, POP3 mailbox server, SMTP/POP3
//! client engines, and the persistence layer (SQLite metadata + one file
//! per message). Wire protocols per RFC 5321/3207/4954 and RFC 1939/2449/2595.

pub mod auth;
pub mod config;
pub mod message_id;
pub mod mime;
pub mod net;
pub mod protocol;
pub mod runtime;
pub mod sasl;
pub mod store;
