/*
 * datetime.rs
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

//! RFC 5322 §3.3 date-time, via chrono's RFC 2822 support with a fallback
//! for the no-seconds obsolete form.

use chrono::{DateTime, FixedOffset, Utc};

/// Parse a Date header value. Returns None on failure rather than guessing.
pub fn parse_rfc2822(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc2822(value)
        .ok()
        .or_else(|| parse_without_seconds(value))
        .map(|d| d.with_timezone(&Utc))
}

fn parse_without_seconds(value: &str) -> Option<DateTime<FixedOffset>> {
    // "Fri, 21 Nov 1997 09:55 -0600" and the day-less variant.
    let stripped = value
        .split_once(',')
        .map(|(_, rest)| rest.trim())
        .unwrap_or(value);
    DateTime::parse_from_str(stripped, "%d %b %Y %H:%M %z").ok()
}

/// Format for a Date header.
pub fn format_rfc2822(date: DateTime<Utc>) -> String {
    date.to_rfc2822()
}
