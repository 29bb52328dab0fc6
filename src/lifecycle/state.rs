//! Connection state machine.
//!
//! [`transition`] is a pure function of (current status, event). The
//! controller persists whatever it returns and ignores rejected events, so a
//! stale webhook can never move an instance backward.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Connection status of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown instance status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for InstanceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disconnected" => Ok(Self::Disconnected),
            "connecting" => Ok(Self::Connecting),
            "connected" => Ok(Self::Connected),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Inputs to the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// The gateway accepted a connect/reconnect request.
    ReconnectRequested { qr_code: Option<String> },
    /// A rotated pairing QR arrived by webhook.
    QrUpdated { qr_code: String },
    /// `connection.update` reporting "open".
    ConnectionOpened,
    /// `connection.update` reporting "connecting".
    ConnectionConnecting,
    /// `connection.update` reporting closure.
    ConnectionClosed,
    /// Unrecoverable gateway error.
    Failed { reason: String },
}

impl LifecycleEvent {
    /// Name recorded in the instance log when the event is applied.
    pub fn log_event(&self) -> &'static str {
        match self {
            Self::ReconnectRequested { .. } => "RECONNECT_REQUESTED",
            Self::QrUpdated { .. } => "QR_UPDATED",
            Self::ConnectionOpened => "CONNECTED",
            Self::ConnectionConnecting => "CONNECTING",
            Self::ConnectionClosed => "DISCONNECTED",
            Self::Failed { .. } => "CONNECTION_FAILED",
        }
    }
}

/// What happens to the stored QR payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QrEffect {
    Keep,
    Replace(String),
    Clear,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub to: InstanceStatus,
    pub qr: QrEffect,
}

impl Transition {
    fn new(to: InstanceStatus, qr: QrEffect) -> Self {
        Self { to, qr }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{event} is not valid while {from}")]
pub struct InvalidTransition {
    pub from: InstanceStatus,
    pub event: &'static str,
}

/// Compute the next state for `event` applied in state `from`.
pub fn transition(
    from: InstanceStatus,
    event: &LifecycleEvent,
) -> Result<Transition, InvalidTransition> {
    use InstanceStatus::*;
    use LifecycleEvent as E;

    let invalid = || InvalidTransition {
        from,
        event: event.log_event(),
    };

    match (from, event) {
        // Reconnect is allowed from every state. Repeating it while already
        // connecting just refreshes the pairing request.
        (_, E::ReconnectRequested { qr_code }) => Ok(Transition::new(
            Connecting,
            match qr_code {
                Some(qr) => QrEffect::Replace(qr.clone()),
                None if from == Connecting => QrEffect::Keep,
                None => QrEffect::Clear,
            },
        )),

        (Connecting, E::QrUpdated { qr_code }) => {
            Ok(Transition::new(Connecting, QrEffect::Replace(qr_code.clone())))
        }
        (_, E::QrUpdated { .. }) => Err(invalid()),

        // The gateway is the source of truth for an open session, whatever
        // we believed before.
        (Connected, E::ConnectionOpened) => Ok(Transition::new(Connected, QrEffect::Keep)),
        (_, E::ConnectionOpened) => Ok(Transition::new(Connected, QrEffect::Clear)),

        (Connecting, E::ConnectionConnecting) => Ok(Transition::new(Connecting, QrEffect::Keep)),
        (_, E::ConnectionConnecting) => Err(invalid()),

        (Connected | Connecting, E::ConnectionClosed) => {
            Ok(Transition::new(Disconnected, QrEffect::Clear))
        }
        (Disconnected, E::ConnectionClosed) => Ok(Transition::new(Disconnected, QrEffect::Keep)),
        (Failed, E::ConnectionClosed) => Err(invalid()),

        (_, E::Failed { .. }) => Ok(Transition::new(Failed, QrEffect::Clear)),
    }
}
