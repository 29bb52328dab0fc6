//! Gateway Client
//!
//! Typed wrapper over the external WhatsApp gateway's REST surface. The
//! [`Gateway`] trait is the seam the lifecycle controller and sync engine
//! depend on; [`EvolutionClient`] is the HTTP implementation.
//!
//! Non-2xx answers are ordinary values (`GatewayError::Rejected`), not panics,
//! and every call is bounded by the client timeout. Nothing here retries.

mod client;
mod types;

pub use client::EvolutionClient;
pub use types::{
    MessagePage, PairingSession, ProbeReport, RemoteChat, RemoteConnectionState,
    WebhookRegistration,
};

use async_trait::async_trait;

/// Longest instance name accepted locally or sent upstream.
pub const MAX_INSTANCE_NAME_LEN: usize = 64;

/// Failure of a single gateway call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// Transport failure or timeout. No HTTP response was received.
    #[error("gateway unavailable: {message}")]
    Unavailable { message: String },

    /// The gateway answered with a 4xx/5xx status.
    #[error("gateway returned {status}: {body}")]
    Rejected { status: u16, body: String },

    /// The gateway answered 2xx but the body did not match the contract.
    #[error("unexpected gateway response: {message}")]
    Decode { message: String },

    #[error("invalid instance name: {0:?}")]
    InvalidInstanceName(String),
}

impl GatewayError {
    /// True when the gateway definitively says the instance does not exist.
    pub fn is_instance_missing(&self) -> bool {
        matches!(self, Self::Rejected { status: 404, .. })
    }
}

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// One operation per gateway capability. Every call is instance scoped
/// except [`Gateway::probe`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Request a (new) pairing session. Safe to repeat.
    async fn connect_instance(&self, instance: &str) -> GatewayResult<PairingSession>;

    /// Current connection state as the gateway sees it.
    async fn connection_state(&self, instance: &str) -> GatewayResult<RemoteConnectionState>;

    /// Register the webhook URL and the event set the instance should push.
    async fn set_webhook(
        &self,
        instance: &str,
        registration: &WebhookRegistration,
    ) -> GatewayResult<()>;

    async fn find_chats(&self, instance: &str) -> GatewayResult<Vec<RemoteChat>>;

    /// One page (1-based) of the instance's message history.
    async fn find_messages(
        &self,
        instance: &str,
        page: u32,
        page_size: u32,
    ) -> GatewayResult<MessagePage>;

    /// Read-only reachability check against a reserved, non-existent
    /// instance id. Never fails; the report says what happened.
    async fn probe(&self) -> ProbeReport;
}

/// Validate an instance name before it is stored or put into a URL path.
///
/// Names are non-empty, at most [`MAX_INSTANCE_NAME_LEN`] bytes, and made of
/// ASCII letters, digits, `-`, `_` and `.`.
pub fn validate_instance_name(name: &str) -> GatewayResult<&str> {
    let valid = !name.is_empty()
        && name.len() <= MAX_INSTANCE_NAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && name != "."
        && name != "..";
    if valid {
        Ok(name)
    } else {
        Err(GatewayError::InvalidInstanceName(name.to_string()))
    }
}
