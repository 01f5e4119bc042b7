//! Durable snapshot persistence for collaborative notes.
//!
//! ```text
//! ┌─────────────┐   flush (checkpoint,    ┌───────────────┐
//! │ DocumentRoom│    last disconnect)     │ SnapshotStore │
//! │ (in-memory) │ ──────────────────────► │ (RocksDB)     │
//! └──────┬──────┘                         └──────┬────────┘
//!        │ hydrate (cold start)                  │
//!        ▼                                       ▼
//! ┌─────────────┐             ┌──────────────────────────────────┐
//! │ Yrs Doc     │             │ CF "snapshots" — LZ4 state blobs  │
//! │ (restored)  │             │ CF "metadata"  — who/when         │
//! └─────────────┘             └──────────────────────────────────┘
//! ```
//!
//! The in-memory room state is authoritative: a failed flush is logged and
//! retried at the next checkpoint, never by discarding the live document.

pub mod rocks;

pub use rocks::{SnapshotMetadata, SnapshotStore, StoreConfig, StoreError};
