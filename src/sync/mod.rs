//! Sync Engine
//!
//! Event normalization, the shared message write path and on-demand full
//! synchronization.

pub mod apply;
mod engine;
pub mod event;

pub use apply::{ApplyStats, apply_records, apply_remote_message};
pub use engine::{SyncEngine, SyncReport};
pub use event::{EnvelopeError, SkipReason, SyncEvent, normalize_message};
