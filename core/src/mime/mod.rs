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

//! Message-format boundary: the protocol engines deal in octets on the wire
//! and cross into structured form only here. Header scanning and minimal
//! MIME assembly; full-fidelity body parsing is a collaborator's concern.

mod address;
mod build;
mod datetime;
mod headers;
mod rfc2047;

pub use address::{format_address_list, parse_address, parse_address_list, Address};
pub use build::build_message;
pub use datetime::{format_rfc2822, parse_rfc2822};
pub use headers::HeaderScan;
pub use rfc2047::{decode_encoded_words, encode_header_value};

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Attachment disposition on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Inline,
    Attachment,
}

/// One attachment. The filename is carried verbatim on the wire; disk-name
/// sanitization happens where files are written, not here.
#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
    pub content_id: Option<String>,
    pub disposition: Disposition,
}

/// In-memory message, the unit the SMTP client submits and the commit
/// boundary assembles records from.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// RFC 5322 msg-id including angle brackets; generated when empty.
    pub message_id: String,
    pub subject: String,
    pub from: Option<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    pub text_body: Option<String>,
    pub html_body: Option<String>,
    pub attachments: Vec<Attachment>,
    pub date: Option<DateTime<Utc>>,
    /// Extra headers beyond the structured fields.
    pub headers: HashMap<String, String>,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
}

impl Message {
    /// All envelope recipients: to + cc + bcc.
    pub fn recipients(&self) -> Vec<&Address> {
        self.to
            .iter()
            .chain(self.cc.iter())
            .chain(self.bcc.iter())
            .collect()
    }
}
