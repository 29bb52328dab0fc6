//! wa-gateway-sync - WhatsApp Gateway Synchronization Engine
//!
//! Keeps a local SQLite view of one or more WhatsApp connections that are
//! proxied through an external messaging gateway (Evolution-API style).
//!
//! ## Features
//!
//! - **Instance lifecycle:** connect/reconnect, pairing QR, explicit state machine
//! - **Webhook ingest:** authenticated push events applied idempotently
//! - **Full sync:** paged history pull, safe alongside live ingest
//! - **Read API:** cursor-paginated conversations and messages
//!
//! ## Quick Start
//!
//! ```bash
//! # Write a config, then run the server
//! wa-gateway-sync init
//! WA_WEBHOOK_SECRET=s3cret wa-gateway-sync serve
//!
//! # Pair and backfill an instance
//! wa-gateway-sync instance add shop-1
//! wa-gateway-sync reconnect shop-1
//! wa-gateway-sync sync shop-1
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;
pub mod lifecycle;
pub mod logging;
pub mod server;
pub mod services;
pub mod store;
pub mod sync;
pub mod utils;
pub mod webhook;

// Re-export commonly used types
pub use error::{ErrorCode, SyncError};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
