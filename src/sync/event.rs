//! Gateway event normalization.
//!
//! Turns the gateway's webhook envelope into a [`SyncEvent`], and a raw
//! message record (webhook or history page) into a [`RemoteMessage`]. Both
//! ingest and full sync read messages through [`normalize_message`].

use serde_json::Value;

use crate::gateway::RemoteConnectionState;
use crate::store::{Direction, RemoteMessage};

/// Internal, transient event produced by webhook ingest.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    QrUpdated {
        instance_name: String,
        qr_code: String,
    },
    ConnectionUpdate {
        instance_name: String,
        state: RemoteConnectionState,
    },
    MessagesUpsert {
        instance_name: String,
        records: Vec<Value>,
    },
    ConnectionFailed {
        instance_name: String,
        reason: String,
    },
    /// Event type this version does not handle. Accepted and ignored.
    Unknown {
        instance_name: String,
        event: String,
    },
}

impl SyncEvent {
    pub fn instance_name(&self) -> &str {
        match self {
            Self::QrUpdated { instance_name, .. }
            | Self::ConnectionUpdate { instance_name, .. }
            | Self::MessagesUpsert { instance_name, .. }
            | Self::ConnectionFailed { instance_name, .. }
            | Self::Unknown { instance_name, .. } => instance_name,
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &str {
        match self {
            Self::QrUpdated { .. } => "qr_updated",
            Self::ConnectionUpdate { .. } => "connection_update",
            Self::MessagesUpsert { .. } => "messages_upsert",
            Self::ConnectionFailed { .. } => "connection_failed",
            Self::Unknown { event, .. } => event,
        }
    }

    /// Parse a webhook envelope `{ "event", "instance", "data" }`.
    ///
    /// `event_hint` is the path segment some gateways append to the webhook
    /// URL; it is used when the body carries no `event`.
    pub fn from_envelope(body: &Value, event_hint: Option<&str>) -> Result<Self, EnvelopeError> {
        let raw_event = body["event"]
            .as_str()
            .or(event_hint)
            .filter(|e| !e.trim().is_empty())
            .ok_or(EnvelopeError::MissingEvent)?;
        let instance_name = body["instance"]
            .as_str()
            .or_else(|| body["instance"]["instanceName"].as_str())
            .or_else(|| body["instanceName"].as_str())
            .filter(|i| !i.trim().is_empty())
            .ok_or(EnvelopeError::MissingInstance)?
            .to_string();
        let data = &body["data"];

        let event = match canonical_event_name(raw_event).as_str() {
            "qrcode.updated" => {
                let qr_code = data["qrcode"]["base64"]
                    .as_str()
                    .or_else(|| data["qrcode"].as_str())
                    .or_else(|| data["base64"].as_str())
                    .filter(|q| !q.is_empty())
                    .ok_or(EnvelopeError::MissingField("data.qrcode"))?;
                Self::QrUpdated {
                    instance_name,
                    qr_code: qr_code.to_string(),
                }
            }
            "connection.update" => {
                let state = data["state"]
                    .as_str()
                    .ok_or(EnvelopeError::MissingField("data.state"))?;
                Self::ConnectionUpdate {
                    instance_name,
                    state: RemoteConnectionState::parse(state),
                }
            }
            "messages.upsert" | "messages.set" | "messages.update" => {
                let records = if let Some(items) = data.as_array() {
                    items.clone()
                } else if let Some(items) = data["messages"].as_array() {
                    items.clone()
                } else if data.is_object() {
                    vec![data.clone()]
                } else {
                    return Err(EnvelopeError::MissingField("data"));
                };
                Self::MessagesUpsert {
                    instance_name,
                    records,
                }
            }
            "connection.failed" | "logout.instance" => {
                let reason = data["reason"]
                    .as_str()
                    .or_else(|| data["message"].as_str())
                    .unwrap_or(raw_event)
                    .to_string();
                Self::ConnectionFailed {
                    instance_name,
                    reason,
                }
            }
            other => Self::Unknown {
                instance_name,
                event: other.to_string(),
            },
        };
        Ok(event)
    }
}

/// `MESSAGES_UPSERT`, `messages-upsert` and `messages.upsert` are the same event.
fn canonical_event_name(raw: &str) -> String {
    raw.trim().to_ascii_lowercase().replace(['_', '-'], ".")
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    #[error("webhook body has no event type")]
    MissingEvent,
    #[error("webhook body has no instance name")]
    MissingInstance,
    #[error("webhook body is missing {0}")]
    MissingField(&'static str),
}

/// Why a message record was skipped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SkipReason {
    #[error("record has no key.id")]
    MissingId,
    #[error("record has no key.remoteJid")]
    MissingRemoteJid,
    #[error("record has no usable messageTimestamp")]
    MissingTimestamp,
}

/// Message fields that carry a caption worth showing as content.
const CAPTION_FIELDS: [&str; 3] = ["imageMessage", "videoMessage", "documentMessage"];

/// Normalize one gateway message record.
pub fn normalize_message(record: &Value) -> Result<RemoteMessage, SkipReason> {
    let key = &record["key"];
    let external_id = key["id"]
        .as_str()
        .or_else(|| record["keyId"].as_str())
        .filter(|s| !s.is_empty())
        .ok_or(SkipReason::MissingId)?;
    let remote_jid = key["remoteJid"]
        .as_str()
        .or_else(|| record["remoteJid"].as_str())
        .filter(|s| !s.is_empty())
        .ok_or(SkipReason::MissingRemoteJid)?;
    let from_me = key["fromMe"]
        .as_bool()
        .or_else(|| record["fromMe"].as_bool())
        .unwrap_or(false);
    let timestamp = parse_timestamp(&record["messageTimestamp"])
        .or_else(|| parse_timestamp(&record["timestamp"]))
        .ok_or(SkipReason::MissingTimestamp)?;

    let delivery_status = record["status"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let push_name = record["pushName"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    Ok(RemoteMessage {
        external_id: external_id.to_string(),
        remote_jid: remote_jid.to_string(),
        timestamp,
        direction: if from_me {
            Direction::Outbound
        } else {
            Direction::Inbound
        },
        content: extract_content(&record["message"]),
        delivery_status,
        push_name,
    })
}

/// Timestamps arrive as numbers, numeric strings, or protobuf Long objects
/// (`{"low": .., "high": ..}`).
fn parse_timestamp(value: &Value) -> Option<i64> {
    let ts = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(obj) => {
            let low = obj.get("low")?.as_i64()?;
            let high = obj.get("high").and_then(Value::as_i64).unwrap_or(0);
            Some((high << 32) | (low & 0xFFFF_FFFF))
        }
        _ => None,
    }?;
    // Some gateways report milliseconds.
    Some(if ts > 100_000_000_000 { ts / 1000 } else { ts })
}

fn extract_content(message: &Value) -> Option<String> {
    if !message.is_object() {
        return None;
    }
    if let Some(text) = message["conversation"].as_str()
        && !text.is_empty()
    {
        return Some(text.to_string());
    }
    if let Some(text) = message["extendedTextMessage"]["text"].as_str()
        && !text.is_empty()
    {
        return Some(text.to_string());
    }
    for field in CAPTION_FIELDS {
        if let Some(caption) = message[field]["caption"].as_str()
            && !caption.is_empty()
        {
            return Some(caption.to_string());
        }
    }
    // No text: label by message type so the row is still meaningful.
    message
        .as_object()
        .and_then(|obj| {
            obj.keys()
                .find(|k| k.ends_with("Message") && *k != "messageContextInfo")
        })
        .map(|kind| format!("[{}]", kind))
}
