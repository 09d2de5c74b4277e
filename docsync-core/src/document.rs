//! Document snapshot and text operation types.
//!
//! Field names serialize in camelCase so the JSON shape matches what
//! browser clients and the sequencing topic exchange:
//!
//! ```text
//! DocumentSnapshot { id, content, version, updatedAt }
//! TextOperation    { docId, position, deleteCount, insertText, clientId, baseVersion }
//! ```

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

/// Full current state of one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    pub id: String,
    pub content: String,
    /// Starts at 0, +1 per applied operation
    pub version: u64,
    /// Milliseconds since the Unix epoch
    pub updated_at: u64,
}

impl DocumentSnapshot {
    /// The snapshot a document has before anyone edits it.
    pub fn empty(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: String::new(),
            version: 0,
            updated_at: now_millis(),
        }
    }

    /// Content length in UTF-16 code units (the unit positions are given in).
    pub fn len_utf16(&self) -> usize {
        utf16_len(&self.content)
    }
}

/// A positional edit submitted by a client.
///
/// `client_id` is attribution only. It never takes part in deciding
/// where or whether the edit lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextOperation {
    pub doc_id: String,
    pub position: u64,
    pub delete_count: u64,
    pub insert_text: String,
    pub client_id: String,
    /// Version the sender believed was current
    pub base_version: u64,
}

impl TextOperation {
    /// Operation replacing the whole content of `base`.
    pub fn replace_all(
        base: &DocumentSnapshot,
        client_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            doc_id: base.id.clone(),
            position: 0,
            delete_count: base.len_utf16() as u64,
            insert_text: content.into(),
            client_id: client_id.into(),
            base_version: base.version,
        }
    }
}

/// Number of UTF-16 code units in `s`.
pub fn utf16_len(s: &str) -> usize {
    s.chars().map(char::len_utf16).sum()
}

/// Byte offset of the UTF-16 offset `units` in `s`.
///
/// An offset that splits a surrogate pair rounds down to the start of
/// that character. Offsets past the end map to `s.len()`.
pub fn byte_offset_utf16(s: &str, units: usize) -> usize {
    let mut seen = 0;
    for (idx, ch) in s.char_indices() {
        let width = ch.len_utf16();
        if seen + width > units {
            return idx;
        }
        seen += width;
    }
    s.len()
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
