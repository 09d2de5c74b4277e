//! Operation applier: snapshot + operation → next snapshot.
//!
//! Steps:
//! ```text
//! conflict    = op.base_version != snapshot.version     (detect only)
//! safe_pos    = clamp(op.position, 0, len)
//! safe_delete = clamp(op.delete_count, 0, len - safe_pos)
//! content     = content[..safe_pos] + insert_text + content[safe_pos + safe_delete..]
//! version     = version + 1
//! ```
//!
//! The edit lands even when `conflict` is set: last write wins over the
//! stored content, not over whatever base the client composed against.
//! Clamping means a stale position can land in the wrong place but can
//! never index out of bounds.

use crate::document::{byte_offset_utf16, now_millis, DocumentSnapshot, TextOperation};

/// Result of applying one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub snapshot: DocumentSnapshot,
    /// `base_version` did not match the version the op was applied to
    pub conflict: bool,
}

/// Apply `op` to `snapshot`, stamping the result with the current time.
pub fn apply(snapshot: &DocumentSnapshot, op: &TextOperation) -> Applied {
    apply_at(snapshot, op, now_millis())
}

/// Apply `op` to `snapshot` with an explicit `updated_at`.
pub fn apply_at(snapshot: &DocumentSnapshot, op: &TextOperation, updated_at: u64) -> Applied {
    let conflict = op.base_version != snapshot.version;

    let content = &snapshot.content;
    let len = snapshot.len_utf16();
    let safe_pos = op.position.min(len as u64) as usize;
    let safe_delete = op.delete_count.min((len - safe_pos) as u64) as usize;

    let start = byte_offset_utf16(content, safe_pos);
    let end = byte_offset_utf16(content, safe_pos + safe_delete).max(start);

    let mut next = String::with_capacity(content.len() - (end - start) + op.insert_text.len());
    next.push_str(&content[..start]);
    next.push_str(&op.insert_text);
    next.push_str(&content[end..]);

    Applied {
        snapshot: DocumentSnapshot {
            id: snapshot.id.clone(),
            content: next,
            version: snapshot.version + 1,
            updated_at,
        },
        conflict,
    }
}
