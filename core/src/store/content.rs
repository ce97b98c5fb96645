/*
 * content.rs
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

//! Content store: one `.eml` file per message under the emails directory.
//! Message-ids are bound to safe filenames; writes go through a temp file
//! and rename so a crash-consistent reader sees the whole file or nothing.

use std::fs;
use std::path::{Path, PathBuf};

use rand::RngCore;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::store::error::{StoreError, StoreErrorKind};

/// Longest filename stem derived from a message-id. Older deployments used
/// other schemes; `get` falls back to a directory scan for those.
const MAX_STEM_LEN: usize = 100;

/// Sanitize a message-id into a filename stem: path separators, reserved
/// punctuation, and control characters become '_'; stems over the cap are
/// truncated with a short content hash so distinct ids stay distinct.
pub fn safe_filename(message_id: &str) -> String {
    let mut stem: String = message_id
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if (c as u32) < 0x20 || c == '\u{7f}' => '_',
            c => c,
        })
        .collect();
    if stem.len() > MAX_STEM_LEN {
        let digest = Sha256::digest(message_id.as_bytes());
        let tag: String = digest[..4].iter().map(|b| format!("{:02x}", b)).collect();
        // The cut point may land inside a multi-byte char; back off to a boundary.
        let mut cut = MAX_STEM_LEN - tag.len() - 1;
        while !stem.is_char_boundary(cut) {
            cut -= 1;
        }
        stem.truncate(cut);
        stem.push('-');
        stem.push_str(&tag);
    }
    stem
}

/// File-tree half of the persistence layer.
pub struct ContentStore {
    emails_dir: PathBuf,
}

impl ContentStore {
    pub fn new(emails_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let emails_dir = emails_dir.into();
        fs::create_dir_all(&emails_dir)?;
        Ok(Self { emails_dir })
    }

    /// Canonical path for a message-id.
    pub fn path_for(&self, message_id: &str) -> PathBuf {
        self.emails_dir
            .join(format!("{}.eml", safe_filename(message_id)))
    }

    /// Write content atomically (temp file in the same directory, then
    /// rename) and return the final path.
    pub fn put(&self, message_id: &str, bytes: &[u8]) -> Result<PathBuf, StoreError> {
        let final_path = self.path_for(message_id);
        let mut rnd = [0u8; 4];
        rand::thread_rng().fill_bytes(&mut rnd);
        let tmp_path = self.emails_dir.join(format!(
            ".{}.{:08x}.tmp",
            safe_filename(message_id),
            u32::from_be_bytes(rnd)
        ));
        fs::write(&tmp_path, bytes)?;
        if let Err(e) = fs::rename(&tmp_path, &final_path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        debug!(message_id, path = %final_path.display(), "content written");
        Ok(final_path)
    }

    /// Read content back. Tries the metadata-recorded path first, then the
    /// canonical name, then a scan of the directory for historical naming
    /// schemes that embedded the id differently.
    pub fn get(&self, message_id: &str, hint: Option<&Path>) -> Result<Vec<u8>, StoreError> {
        if let Some(path) = hint {
            if let Ok(bytes) = fs::read(path) {
                return Ok(bytes);
            }
        }
        let canonical = self.path_for(message_id);
        match fs::read(&canonical) {
            Ok(bytes) => return Ok(bytes),
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e.into()),
            Err(_) => {}
        }
        self.scan_for(message_id)
    }

    fn scan_for(&self, message_id: &str) -> Result<Vec<u8>, StoreError> {
        let needle = safe_filename(message_id);
        for entry in fs::read_dir(&self.emails_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".tmp") {
                continue;
            }
            if name.contains(needle.as_str()) {
                return Ok(fs::read(entry.path())?);
            }
        }
        Err(StoreError::new(
            StoreErrorKind::NotFound,
            format!("no content file for {}", message_id),
        ))
    }

    /// Remove the content file. Idempotent: a missing file is success.
    pub fn delete(&self, message_id: &str) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(message_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ContentStore) {
        let dir = tempfile::tempdir().unwrap();
        let cs = ContentStore::new(dir.path().join("emails")).unwrap();
        (dir, cs)
    }

    #[test]
    fn put_then_get_round_trips() {
        let (_dir, cs) = store();
        let body = b"Subject: t\r\n\r\nhi\r\n";
        let path = cs.put("<1.abc@x>", body).unwrap();
        assert!(path.exists());
        assert_eq!(cs.get("<1.abc@x>", None).unwrap(), body);
        assert_eq!(cs.get("<1.abc@x>", Some(&path)).unwrap(), body);
    }

    #[test]
    fn safe_filename_strips_reserved_chars() {
        let s = safe_filename("<a/b\\c:d*e?f>");
        assert!(!s.contains('<') && !s.contains('/') && !s.contains('\\'));
        assert!(!s.contains(':') && !s.contains('*') && !s.contains('?'));
    }

    #[test]
    fn long_ids_truncate_but_stay_distinct() {
        let a = safe_filename(&format!("<{}.one@x>", "a".repeat(200)));
        let b = safe_filename(&format!("<{}.two@x>", "a".repeat(200)));
        assert!(a.len() <= 100);
        assert!(b.len() <= 100);
        assert_ne!(a, b);
    }

    #[test]
    fn get_falls_back_to_scan() {
        let (_dir, cs) = store();
        // Simulate a historical naming scheme: extra prefix around the id.
        let stem = safe_filename("<old.7@x>");
        let legacy = cs.emails_dir.join(format!("msg-{}-v1.eml", stem));
        fs::write(&legacy, b"legacy bytes").unwrap();
        assert_eq!(cs.get("<old.7@x>", None).unwrap(), b"legacy bytes");
    }

    #[test]
    fn delete_is_idempotent() {
        let (_dir, cs) = store();
        cs.put("<d.1@x>", b"x").unwrap();
        cs.delete("<d.1@x>").unwrap();
        cs.delete("<d.1@x>").unwrap();
        assert!(matches!(
            cs.get("<d.1@x>", None),
            Err(e) if e.kind == StoreErrorKind::NotFound
        ));
    }
}
