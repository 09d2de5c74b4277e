//! # docsync-core - document model and operation applier
//!
//! Holds the types every layer of the sync engine agrees on and the one
//! pure transformation at its centre:
//!
//! ```text
//! DocumentSnapshot ──┐
//!                    ├── apply() ──► (next DocumentSnapshot, conflict)
//! TextOperation ─────┘
//! ```
//!
//! No I/O happens here. Storage, sequencing and fan-out live in
//! `docsync-collab`.
//!
//! ## Modules
//!
//! - [`document`]: `DocumentSnapshot`, `TextOperation`, UTF-16 helpers
//! - [`applier`]: clamped splice with conflict detection

pub mod applier;
pub mod document;

pub use applier::{apply, apply_at, Applied};
pub use document::{now_millis, utf16_len, DocumentSnapshot, TextOperation};
