//! Webhook Ingest
//!
//! Authenticates gateway push deliveries and applies the normalized
//! [`SyncEvent`]s. Lifecycle events go through the lifecycle controller,
//! message batches through the shared apply path. The HTTP handler lives in
//! `server`; this module has no axum types beyond the header map.

use axum::http::HeaderMap;
use serde::Serialize;
use std::sync::Arc;

use crate::error::{Result, SyncError};
use crate::lifecycle::{LifecycleController, LifecycleEvent, event_for_remote_state};
use crate::store::Store;
use crate::sync::{ApplyStats, SyncEvent, apply_records};
use crate::utils::constant_time_eq;

/// Header the gateway uses for its own API key; accepted as an alternative
/// carrier for the shared secret.
pub const GATEWAY_KEY_HEADER: &str = "apikey";

/// Shared-secret check for webhook deliveries.
///
/// Fails closed: without a configured secret every delivery is rejected.
#[derive(Clone)]
pub struct WebhookAuth {
    secret: Option<String>,
    header: String,
}

impl WebhookAuth {
    pub fn new(secret: Option<String>, header: impl Into<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            header: header.into().to_ascii_lowercase(),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(&self, headers: &HeaderMap) -> Result<()> {
        let Some(secret) = &self.secret else {
            return Err(SyncError::AuthenticationFailed);
        };
        let presented = headers
            .get(self.header.as_str())
            .or_else(|| headers.get(GATEWAY_KEY_HEADER))
            .and_then(|v| v.to_str().ok())
            .map(str::trim);
        match presented {
            Some(value) if constant_time_eq(value.as_bytes(), secret.as_bytes()) => Ok(()),
            _ => Err(SyncError::AuthenticationFailed),
        }
    }
}

/// What one delivery did.
#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub instance_name: String,
    pub event: String,
    /// Present for message batches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<ApplyStats>,
    /// Why the event was accepted without being applied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored: Option<&'static str>,
}

impl IngestOutcome {
    /// True when every normalized message was durably applied.
    pub fn is_complete(&self) -> bool {
        self.messages.is_none_or(|stats| stats.failed == 0)
    }
}

/// Applies authenticated, normalized webhook events.
#[derive(Clone)]
pub struct WebhookIngest {
    store: Store,
    lifecycle: Arc<LifecycleController>,
}

impl WebhookIngest {
    pub fn new(store: Store, lifecycle: Arc<LifecycleController>) -> Self {
        Self { store, lifecycle }
    }

    pub async fn ingest(&self, event: SyncEvent) -> Result<IngestOutcome> {
        let instance_name = event.instance_name().to_string();
        let mut outcome = IngestOutcome {
            instance_name: instance_name.clone(),
            event: event.kind().to_string(),
            messages: None,
            ignored: None,
        };

        // Acknowledged so the gateway stops redelivering; nothing to apply to.
        if self.store.get_instance(&instance_name).await?.is_none() {
            tracing::warn!(
                "Webhook: {} for unknown instance {}, ignoring",
                outcome.event,
                instance_name
            );
            outcome.ignored = Some("unknown instance");
            return Ok(outcome);
        }

        match event {
            SyncEvent::QrUpdated { qr_code, .. } => {
                self.lifecycle
                    .apply_event(&instance_name, LifecycleEvent::QrUpdated { qr_code })
                    .await?;
            }
            SyncEvent::ConnectionUpdate { state, .. } => match event_for_remote_state(&state) {
                Some(lifecycle_event) => {
                    self.lifecycle
                        .apply_event(&instance_name, lifecycle_event)
                        .await?;
                }
                None => {
                    tracing::debug!(
                        "Webhook: ignoring connection state {:?} for {}",
                        state,
                        instance_name
                    );
                }
            },
            SyncEvent::ConnectionFailed { reason, .. } => {
                self.lifecycle
                    .apply_event(&instance_name, LifecycleEvent::Failed { reason })
                    .await?;
            }
            SyncEvent::MessagesUpsert { records, .. } => {
                let stats = apply_records(&self.store, &instance_name, &records).await;
                if stats.failed > 0 {
                    tracing::warn!(
                        "Webhook: {} of {} messages for {} failed to persist",
                        stats.failed,
                        records.len(),
                        instance_name
                    );
                }
                outcome.messages = Some(stats);
            }
            SyncEvent::Unknown { event, .. } => {
                tracing::debug!("Webhook: ignoring event {} for {}", event, instance_name);
            }
        }

        Ok(outcome)
    }
}
