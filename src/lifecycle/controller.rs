use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::state::{InstanceStatus, LifecycleEvent, QrEffect, transition};
use crate::error::{Result, SyncError};
use crate::gateway::{Gateway, RemoteConnectionState, WebhookRegistration};
use crate::store::{Instance, Store};

/// Map a gateway connection state onto the state machine input, if any.
pub fn event_for_remote_state(state: &RemoteConnectionState) -> Option<LifecycleEvent> {
    match state {
        RemoteConnectionState::Open => Some(LifecycleEvent::ConnectionOpened),
        RemoteConnectionState::Connecting => Some(LifecycleEvent::ConnectionConnecting),
        RemoteConnectionState::Close => Some(LifecycleEvent::ConnectionClosed),
        RemoteConnectionState::Other(_) => None,
    }
}

/// Result of a reconnect call.
#[derive(Debug, Clone, Serialize)]
pub struct ReconnectOutcome {
    pub instance: Instance,
    /// True when this call waited on a concurrent reconnect and reused its
    /// result instead of asking the gateway again.
    pub coalesced: bool,
}

/// Per-instance serialization point.
#[derive(Default)]
struct InstanceGate {
    lock: tokio::sync::Mutex<()>,
    /// Set while the lock holder is a reconnect.
    reconnecting: AtomicBool,
}

/// Clears [`InstanceGate::reconnecting`] when the reconnect ends.
struct ReconnectMark<'a>(&'a AtomicBool);

impl<'a> ReconnectMark<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ReconnectMark<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Owns instance status and QR. All transitions for one instance are
/// serialized through a per-instance async mutex.
pub struct LifecycleController {
    store: Store,
    gateway: Arc<dyn Gateway>,
    webhook: Option<WebhookRegistration>,
    gates: Mutex<HashMap<String, Arc<InstanceGate>>>,
}

impl LifecycleController {
    pub fn new(
        store: Store,
        gateway: Arc<dyn Gateway>,
        webhook: Option<WebhookRegistration>,
    ) -> Self {
        Self {
            store,
            gateway,
            webhook,
            gates: Mutex::new(HashMap::new()),
        }
    }

    fn gate_for(&self, instance_name: &str) -> Arc<InstanceGate> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        gates
            .entry(instance_name.to_string())
            .or_default()
            .clone()
    }

    /// Request a pairing session from the gateway and move to `connecting`.
    ///
    /// Allowed from every state. A call that arrives while another reconnect
    /// for the same instance is in flight waits for it and returns its
    /// result without a second gateway call. Waiting behind any other
    /// lifecycle operation (a webhook event) still issues its own request.
    pub async fn reconnect(&self, instance_name: &str) -> Result<ReconnectOutcome> {
        self.store.require_instance(instance_name).await?;

        let gate = self.gate_for(instance_name);
        let joins_reconnect = gate.reconnecting.load(Ordering::SeqCst);
        let _guard = gate.lock.lock().await;
        if joins_reconnect {
            let current = self.store.require_instance(instance_name).await?;
            if matches!(
                current.status,
                InstanceStatus::Connecting | InstanceStatus::Connected
            ) {
                tracing::debug!(
                    "Lifecycle: coalesced reconnect for {} ({})",
                    instance_name,
                    current.status
                );
                return Ok(ReconnectOutcome {
                    instance: current,
                    coalesced: true,
                });
            }
        }
        let _mark = ReconnectMark::set(&gate.reconnecting);

        tracing::info!("Lifecycle: reconnect requested for {}", instance_name);
        let session = match self.gateway.connect_instance(instance_name).await {
            Ok(session) => session,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!("Lifecycle: reconnect of {} failed: {}", instance_name, reason);
                let event = LifecycleEvent::Failed { reason };
                if let Err(save_err) = self.apply_locked(instance_name, &event).await {
                    tracing::error!(
                        "Lifecycle: could not record failure for {}: {}",
                        instance_name,
                        save_err
                    );
                }
                return Err(e.into());
            }
        };

        // No QR and an open session means the gateway is already paired.
        let event = if session.qr_code.is_none()
            && session.state == Some(RemoteConnectionState::Open)
        {
            LifecycleEvent::ConnectionOpened
        } else {
            LifecycleEvent::ReconnectRequested {
                qr_code: session.qr_code,
            }
        };
        let instance = self.apply_locked(instance_name, &event).await?;

        self.register_webhook(instance_name).await;

        Ok(ReconnectOutcome {
            instance,
            coalesced: false,
        })
    }

    async fn register_webhook(&self, instance_name: &str) {
        let Some(registration) = &self.webhook else {
            return;
        };
        match self.gateway.set_webhook(instance_name, registration).await {
            Ok(()) => {
                tracing::debug!(
                    "Lifecycle: webhook registered for {} -> {}",
                    instance_name,
                    registration.url
                );
            }
            Err(e) => {
                tracing::warn!(
                    "Lifecycle: webhook registration failed for {}: {}",
                    instance_name,
                    e
                );
                let detail = e.to_string();
                if let Err(log_err) = self
                    .store
                    .append_log(instance_name, "WEBHOOK_CONFIG_FAILED", Some(&detail))
                    .await
                {
                    tracing::warn!("Lifecycle: could not append log: {}", log_err);
                }
            }
        }
    }

    /// Feed one event into the state machine for `instance_name`.
    ///
    /// Events the machine rejects in the current state are ignored and the
    /// unchanged record is returned.
    pub async fn apply_event(&self, instance_name: &str, event: LifecycleEvent) -> Result<Instance> {
        let gate = self.gate_for(instance_name);
        let _guard = gate.lock.lock().await;
        self.apply_locked(instance_name, &event).await
    }

    /// Caller holds the instance lock.
    async fn apply_locked(&self, instance_name: &str, event: &LifecycleEvent) -> Result<Instance> {
        let current = self.store.require_instance(instance_name).await?;

        let next = match transition(current.status, event) {
            Ok(next) => next,
            Err(rejected) => {
                tracing::debug!("Lifecycle: ignored for {}: {}", instance_name, rejected);
                return Ok(current);
            }
        };

        let qr_code = match &next.qr {
            QrEffect::Keep => current.qr_code.clone(),
            QrEffect::Replace(qr) => Some(qr.clone()),
            QrEffect::Clear => None,
        };
        let last_error = match event {
            LifecycleEvent::Failed { reason } => Some(reason.clone()),
            LifecycleEvent::ConnectionOpened => None,
            _ => current.last_error.clone(),
        };

        let saved = self
            .store
            .save_instance_state(
                instance_name,
                next.to,
                qr_code.as_deref(),
                last_error.as_deref(),
            )
            .await?;

        let notable = next.to != current.status
            || matches!(
                event,
                LifecycleEvent::ReconnectRequested { .. } | LifecycleEvent::QrUpdated { .. }
            );
        if notable {
            if next.to != current.status {
                tracing::info!(
                    "Lifecycle: {} {} -> {}",
                    instance_name,
                    current.status,
                    next.to
                );
            }
            let detail = match event {
                LifecycleEvent::Failed { reason } => Some(reason.as_str()),
                _ => None,
            };
            // Best effort: the state change is already durable.
            if let Err(e) = self
                .store
                .append_log(instance_name, event.log_event(), detail)
                .await
            {
                tracing::warn!("Lifecycle: could not append log for {}: {}", instance_name, e);
            }
        }

        Ok(saved)
    }

    /// Ask the gateway for the live connection state and apply it.
    ///
    /// A 404 from the gateway means the instance no longer exists upstream
    /// and marks it failed. Other gateway errors are returned without a
    /// transition.
    pub async fn refresh_status(&self, instance_name: &str) -> Result<Instance> {
        let current = self.store.require_instance(instance_name).await?;

        let event = match self.gateway.connection_state(instance_name).await {
            Ok(state) => match event_for_remote_state(&state) {
                Some(event) => event,
                None => {
                    tracing::debug!(
                        "Lifecycle: unrecognised gateway state for {}: {:?}",
                        instance_name,
                        state
                    );
                    return Ok(current);
                }
            },
            Err(e) if e.is_instance_missing() => LifecycleEvent::Failed {
                reason: e.to_string(),
            },
            Err(e) => return Err(SyncError::from(e)),
        };

        self.apply_event(instance_name, event).await
    }

    pub async fn mark_failed(&self, instance_name: &str, reason: &str) -> Result<Instance> {
        self.apply_event(
            instance_name,
            LifecycleEvent::Failed {
                reason: reason.to_string(),
            },
        )
        .await
    }
}
