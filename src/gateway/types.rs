//! Gateway wire types and the lenient parsers that build them.
//!
//! The gateway's JSON differs between versions (bare arrays vs. paged
//! envelopes, `id` vs. `remoteJid`), so responses are read as
//! `serde_json::Value` and picked apart here.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

/// Connection state reported by the gateway, either in a
/// `connectionState` response or a `connection.update` webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteConnectionState {
    Open,
    Connecting,
    Close,
    Other(String),
}

impl RemoteConnectionState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" | "connected" => Self::Open,
            "connecting" => Self::Connecting,
            "close" | "closed" | "disconnected" => Self::Close,
            other => Self::Other(other.to_string()),
        }
    }

    /// Read `instance.state` or a top-level `state`.
    pub(crate) fn from_json(body: &Value) -> Option<Self> {
        body["instance"]["state"]
            .as_str()
            .or_else(|| body["state"].as_str())
            .map(Self::parse)
    }
}

/// Result of asking the gateway for a pairing session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairingSession {
    /// QR payload (usually a `data:image/png;base64,...` URI).
    pub qr_code: Option<String>,
    pub pairing_code: Option<String>,
    /// Present when the gateway answered with a state instead of a QR,
    /// e.g. the session is already open.
    pub state: Option<RemoteConnectionState>,
}

impl PairingSession {
    pub(crate) fn from_json(body: &Value) -> Self {
        let qr_code = body["base64"]
            .as_str()
            .or_else(|| body["qrcode"]["base64"].as_str())
            .or_else(|| body["qrcode"].as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        let pairing_code = body["pairingCode"]
            .as_str()
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Self {
            qr_code,
            pairing_code,
            state: RemoteConnectionState::from_json(body),
        }
    }
}

/// One chat known to the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChat {
    pub remote_jid: String,
    pub name: Option<String>,
}

impl RemoteChat {
    /// Parse a `findChats` response (a bare array of chat objects).
    pub(crate) fn list_from_json(body: &Value) -> Option<Vec<Self>> {
        let items = body.as_array().or_else(|| body["chats"].as_array())?;
        Some(
            items
                .iter()
                .filter_map(|chat| {
                    // Newer gateways use `id` for an internal key and carry the
                    // jid in `remoteJid`; older ones only have `id`.
                    let jid = chat["remoteJid"]
                        .as_str()
                        .or_else(|| chat["id"].as_str().filter(|id| id.contains('@')))?;
                    let name = chat["pushName"]
                        .as_str()
                        .or_else(|| chat["name"].as_str())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string);
                    Some(Self {
                        remote_jid: jid.to_string(),
                        name,
                    })
                })
                .collect(),
        )
    }
}

/// One page of raw message records. Records are normalized by the sync
/// layer, through the same function webhook ingest uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePage {
    pub records: Vec<Value>,
    pub page: u32,
    pub pages: u32,
}

impl MessagePage {
    /// Accepts `{"messages": {"records": [...], "pages": P, "currentPage": C}}`
    /// or a bare array (single page).
    pub(crate) fn from_json(body: &Value, requested_page: u32) -> Option<Self> {
        if let Some(records) = body.as_array() {
            return Some(Self {
                records: records.clone(),
                page: requested_page,
                pages: requested_page,
            });
        }
        let envelope = if body["messages"].is_object() {
            &body["messages"]
        } else {
            body
        };
        let records = envelope["records"].as_array()?.clone();
        let page = envelope["currentPage"]
            .as_u64()
            .map(|p| p as u32)
            .unwrap_or(requested_page);
        let pages = envelope["pages"].as_u64().map(|p| p as u32).unwrap_or(page);
        Some(Self {
            records,
            page,
            pages,
        })
    }

    pub fn is_last(&self) -> bool {
        self.records.is_empty() || self.page >= self.pages
    }
}

/// What the gateway should push and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookRegistration {
    pub url: String,
    pub events: Vec<String>,
    /// Headers the gateway attaches to every delivery (carries the secret).
    pub headers: BTreeMap<String, String>,
}

impl WebhookRegistration {
    /// Events the ingest endpoint understands.
    pub const DEFAULT_EVENTS: [&'static str; 5] = [
        "QRCODE_UPDATED",
        "CONNECTION_UPDATE",
        "MESSAGES_UPSERT",
        "MESSAGES_UPDATE",
        "LOGOUT_INSTANCE",
    ];

    pub fn new(url: impl Into<String>, secret_header: &str, secret: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(secret_header.to_string(), secret.to_string());
        Self {
            url: url.into(),
            events: Self::DEFAULT_EVENTS.iter().map(|e| e.to_string()).collect(),
            headers,
        }
    }

    pub(crate) fn to_json(&self) -> Value {
        serde_json::json!({
            "webhook": {
                "enabled": true,
                "url": self.url,
                "headers": self.headers,
                "byEvents": false,
                "base64": false,
                "events": self.events,
            }
        })
    }
}

/// Outcome of [`super::Gateway::probe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeReport {
    /// An HTTP response came back at all.
    pub reachable: bool,
    /// The API key was accepted (status other than 401/403).
    pub authenticated: bool,
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub detail: String,
}

impl ProbeReport {
    pub fn is_healthy(&self) -> bool {
        self.reachable && self.authenticated
    }
}
