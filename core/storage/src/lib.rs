//! Durable document storage for edgesync.
//!
//! The sync engine keeps two small documents on durable storage: the
//! operation queue snapshot and the version map. This crate provides a
//! trait-based interface for where those documents live, with a local
//! filesystem backend and an in-memory backend.
//!
//! # Design Principles
//! - Whole-document writes: every save replaces the document atomically
//! - Absent documents are not errors: `load` returns `None`
//! - Human-inspectable: documents are plain text chosen by the caller

pub mod local;
pub mod memory;
pub mod provider;

pub use local::LocalSnapshotStore;
pub use memory::MemorySnapshotStore;
pub use provider::{validate_document_name, SnapshotStore};
