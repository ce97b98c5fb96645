/*
 * dot_stuffer.rs
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

//! Both directions of SMTP DATA transparency (RFC 5321 §4.5.2): the
//! submission client streams outgoing bytes through `DotStuffer`, and the
//! receive engine accumulates the incoming payload with `DataCapture`,
//! which detects the lone-dot terminator, strips the transport dot, and
//! enforces the message size cap.

/// Streams a message out with dot stuffing: any line whose first octet is
/// `.` gets a second `.` prepended. The start of the message counts as the
/// start of a line; a line begins only after CRLF.
pub struct DotStuffer {
    at_line_start: bool,
    pending_cr: bool,
    emitted: bool,
}

impl Default for DotStuffer {
    fn default() -> Self {
        Self {
            at_line_start: true,
            pending_cr: false,
            emitted: false,
        }
    }
}

impl DotStuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process a chunk; call `out` for each slice to send. Bytes pass
    /// through untouched except for the inserted dots, so chunk boundaries
    /// may fall anywhere, including between CR and LF.
    pub fn process_chunk<F>(&mut self, chunk: &[u8], mut out: F)
    where
        F: FnMut(&[u8]),
    {
        let mut start = 0;
        for (i, &b) in chunk.iter().enumerate() {
            if self.at_line_start && b == b'.' {
                out(&chunk[start..i]);
                out(b".");
                start = i;
            }
            self.at_line_start = self.pending_cr && b == b'\n';
            self.pending_cr = b == b'\r';
        }
        if start < chunk.len() {
            self.emitted = true;
            out(&chunk[start..]);
        }
    }

    /// Emit the terminator, completing any dangling line first so the wire
    /// always ends with CRLF `.` CRLF.
    pub fn end_message<F>(&mut self, mut out: F)
    where
        F: FnMut(&[u8]),
    {
        if self.pending_cr {
            out(b"\n.\r\n");
        } else if self.at_line_start && self.emitted {
            out(b".\r\n");
        } else {
            out(b"\r\n.\r\n");
        }
        self.reset();
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// What one captured line meant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CaptureStatus {
    /// Payload line consumed; keep reading.
    More,
    /// The lone-dot terminator; the payload is complete.
    Terminated,
}

/// How a completed capture ended.
#[derive(Debug)]
pub(crate) enum CaptureOutcome {
    /// The unstuffed payload, CRLF line endings restored.
    Message(Vec<u8>),
    /// Accumulated size passed the cap; the buffer was discarded while the
    /// rest of the payload drained to the terminator.
    TooLarge,
    /// At least one line broke the per-line octet limit.
    LineTooLong,
}

/// Receive-side accumulator for a DATA payload, fed one line at a time
/// (terminators already stripped by the line reader).
pub(crate) struct DataCapture {
    body: Vec<u8>,
    size: u64,
    max_size: u64,
    oversized: bool,
    line_too_long: bool,
}

impl DataCapture {
    pub fn new(max_size: u64) -> Self {
        Self {
            body: Vec::with_capacity(4096),
            size: 0,
            max_size,
            oversized: false,
            line_too_long: false,
        }
    }

    /// Feed one received line. A lone `.` terminates; otherwise one leading
    /// dot is transport framing and comes off. Size accounting includes the
    /// CRLF the wire carried.
    pub fn line(&mut self, line: &str) -> CaptureStatus {
        if line == "." {
            return CaptureStatus::Terminated;
        }
        let text = line.strip_prefix('.').unwrap_or(line);
        self.size += text.len() as u64 + 2;
        if self.size > self.max_size {
            self.oversized = true;
            self.body.clear();
        } else if !self.line_too_long && !self.oversized {
            self.body.extend_from_slice(text.as_bytes());
            self.body.extend_from_slice(b"\r\n");
        }
        CaptureStatus::More
    }

    /// Record a line the reader refused for length. Capture continues so
    /// the session can drain to the terminator and answer.
    pub fn note_long_line(&mut self) {
        self.line_too_long = true;
    }

    pub fn finish(self) -> CaptureOutcome {
        if self.line_too_long {
            CaptureOutcome::LineTooLong
        } else if self.oversized {
            CaptureOutcome::TooLarge
        } else {
            CaptureOutcome::Message(self.body)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stuff(inputs: &[&[u8]]) -> Vec<u8> {
        let mut s = DotStuffer::new();
        let mut out = Vec::new();
        for chunk in inputs {
            s.process_chunk(chunk, |x| out.extend_from_slice(x));
        }
        s.end_message(|x| out.extend_from_slice(x));
        out
    }

    #[test]
    fn stuffing_doubles_dots_only_at_line_start() {
        assert_eq!(stuff(&[b"Hi\r\n.\r\nBye\r\n"]), b"Hi\r\n..\r\nBye\r\n.\r\n".to_vec());
        assert_eq!(stuff(&[b"a.b\r\nc.d\r\n"]), b"a.b\r\nc.d\r\n.\r\n".to_vec());
        assert_eq!(stuff(&[b"...\r\n"]), b"....\r\n.\r\n".to_vec());
    }

    #[test]
    fn terminator_completes_dangling_lines() {
        // Empty message, message mid-line, and message ending in a bare CR.
        assert_eq!(stuff(&[]), b"\r\n.\r\n".to_vec());
        assert_eq!(stuff(&[b"Hi"]), b"Hi\r\n.\r\n".to_vec());
        assert_eq!(stuff(&[b"Hi\r"]), b"Hi\r\n.\r\n".to_vec());
    }

    #[test]
    fn chunk_boundary_inside_crlf_is_transparent() {
        let mut s = DotStuffer::new();
        let mut out = Vec::new();
        s.process_chunk(b"Hi\r", |x| out.extend_from_slice(x));
        s.process_chunk(b"\n.bye\r\n", |x| out.extend_from_slice(x));
        assert_eq!(out, b"Hi\r\n..bye\r\n");
    }

    fn capture(lines: &[&str], max: u64) -> CaptureOutcome {
        let mut c = DataCapture::new(max);
        for line in lines {
            if c.line(line) == CaptureStatus::Terminated {
                break;
            }
        }
        c.finish()
    }

    #[test]
    fn capture_unstuffs_and_terminates() {
        match capture(&["Subject: t", "", "..dotted", "plain", "."], 1024) {
            CaptureOutcome::Message(body) => {
                assert_eq!(body, b"Subject: t\r\n\r\n.dotted\r\nplain\r\n");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn capture_enforces_size_cap() {
        let payload = ["0123456789abcdef"; 8];
        let mut lines: Vec<&str> = payload.to_vec();
        lines.push(".");
        match capture(&lines, 64) {
            CaptureOutcome::TooLarge => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn capture_flags_long_lines() {
        let mut c = DataCapture::new(1024);
        c.line("fine");
        c.note_long_line();
        c.line("also fine");
        assert_eq!(c.line("."), CaptureStatus::Terminated);
        match c.finish() {
            CaptureOutcome::LineTooLong => {}
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn stuff_then_capture_round_trips() {
        let original: &[u8] = b"From: a@x\r\n\r\n.leading\r\nmiddle.dot\r\n..two\r\n";
        let wire = stuff(&[original]);
        let mut c = DataCapture::new(4096);
        for line in wire.split(|&b| b == b'\n') {
            if line.is_empty() {
                continue; // split tail after the final LF
            }
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            let text = String::from_utf8(line.to_vec()).unwrap();
            if c.line(&text) == CaptureStatus::Terminated {
                break;
            }
        }
        match c.finish() {
            CaptureOutcome::Message(body) => assert_eq!(body, original),
            other => panic!("unexpected {:?}", other),
        }
    }
}
