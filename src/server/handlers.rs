use axum::{
    Json,
    body::Bytes,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::Instrument;
use uuid::Uuid;

use super::AppState;
use crate::error::{ErrorCode, Result, SyncError};
use crate::lifecycle::InstanceStatus;
use crate::store::{Instance, InstanceLogEntry, PageRequest};
use crate::sync::SyncEvent;

/// Default number of log entries shown with an instance.
const DEFAULT_LOG_LIMIT: u32 = 50;

fn parse_param<T: FromStr>(name: &str, raw: Option<&str>) -> Result<Option<T>> {
    match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|_| SyncError::InvalidInput(format!("{} must be an integer, got {:?}", name, s))),
    }
}

/// `?limit=&before=` as raw strings, so bad values get the JSON error body.
#[derive(Debug, Default, Deserialize)]
pub(super) struct PageQuery {
    limit: Option<String>,
    before: Option<String>,
    before_id: Option<String>,
}

impl PageQuery {
    fn to_request(&self) -> Result<PageRequest> {
        PageRequest::new(
            parse_param("limit", self.limit.as_deref())?,
            parse_param("before", self.before.as_deref())?,
        )?
        .with_before_id(self.before_id.clone())
    }
}

pub(super) async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub(super) async fn probe(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.probe().await)
}

// ── Webhook ──

pub(super) async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receive(state, None, headers, body).await
}

pub(super) async fn webhook_by_event(
    State(state): State<AppState>,
    Path(event): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    receive(state, Some(event), headers, body).await
}

async fn receive(state: AppState, event_hint: Option<String>, headers: HeaderMap, body: Bytes) -> Response {
    let delivery = Uuid::new_v4();
    let span = tracing::info_span!("webhook", %delivery);
    async move {
        // Nothing is parsed or stored before the secret checks out.
        if let Err(e) = state.auth.verify(&headers) {
            tracing::warn!("Webhook: rejected delivery, invalid or missing secret");
            return e.into_response();
        }
        match process(&state, event_hint.as_deref(), &body).await {
            Ok(response) => response,
            Err(e) => {
                if matches!(e, SyncError::InvalidInput(_) | SyncError::NotFound { .. }) {
                    tracing::warn!("Webhook: {}", e);
                }
                e.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

async fn process(state: &AppState, event_hint: Option<&str>, body: &[u8]) -> Result<Response> {
    let envelope: Value = serde_json::from_slice(body)
        .map_err(|e| SyncError::InvalidInput(format!("webhook body is not valid JSON: {}", e)))?;
    let event = SyncEvent::from_envelope(&envelope, event_hint)
        .map_err(|e| SyncError::InvalidInput(e.to_string()))?;
    tracing::debug!(
        "Webhook: {} for {}",
        event.kind(),
        event.instance_name()
    );

    let outcome = state.ingest.ingest(event).await?;
    if !outcome.is_complete() {
        let failed = outcome.messages.map(|s| s.failed).unwrap_or_default();
        // Non-2xx makes the gateway redeliver; applied messages are idempotent.
        let body = serde_json::json!({
            "error": format!("{} message(s) failed to persist", failed),
            "code": ErrorCode::StorageFailure,
            "failed": failed,
        });
        return Ok((StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response());
    }
    Ok(Json(outcome).into_response())
}

// ── Instances ──

#[derive(Debug, Deserialize)]
pub(super) struct CreateInstance {
    instance_name: String,
}

pub(super) async fn create_instance(
    State(state): State<AppState>,
    body: std::result::Result<Json<CreateInstance>, JsonRejection>,
) -> Result<Response> {
    let Json(request) = body.map_err(|e| SyncError::InvalidInput(e.body_text()))?;
    let (instance, created) = state.store.create_instance(request.instance_name.trim()).await?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(instance)).into_response())
}

pub(super) async fn list_instances(State(state): State<AppState>) -> Result<Json<Vec<Instance>>> {
    Ok(Json(state.store.list_instances().await?))
}

#[derive(Debug, Default, Deserialize)]
pub(super) struct ShowQuery {
    logs: Option<String>,
}

#[derive(Debug, Serialize)]
struct InstanceView {
    #[serde(flatten)]
    instance: Instance,
    syncing: bool,
    logs: Vec<InstanceLogEntry>,
}

pub(super) async fn show_instance(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ShowQuery>,
) -> Result<impl IntoResponse> {
    let limit = parse_param("logs", query.logs.as_deref())?.unwrap_or(DEFAULT_LOG_LIMIT);
    let instance = state.store.require_instance(&name).await?;
    let logs = state.store.recent_logs(&name, limit).await?;
    Ok(Json(InstanceView {
        instance,
        syncing: state.sync.is_syncing(&name),
        logs,
    }))
}

#[derive(Debug, Serialize)]
struct ConnectionView {
    instance_name: String,
    status: InstanceStatus,
    qr_code: Option<String>,
    last_error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    coalesced: bool,
}

impl ConnectionView {
    fn new(instance: Instance, coalesced: bool) -> Self {
        Self {
            instance_name: instance.instance_name,
            status: instance.status,
            qr_code: instance.qr_code,
            last_error: instance.last_error,
            coalesced,
        }
    }
}

pub(super) async fn reconnect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let outcome = state.lifecycle.reconnect(&name).await?;
    Ok(Json(ConnectionView::new(outcome.instance, outcome.coalesced)))
}

pub(super) async fn refresh(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    let instance = state.lifecycle.refresh_status(&name).await?;
    Ok(Json(ConnectionView::new(instance, false)))
}

pub(super) async fn full_sync(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.sync.full_sync(&name).await?))
}

// ── Reads ──

pub(super) async fn list_conversations(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let page = query.to_request()?;
    state.store.require_instance(&name).await?;
    Ok(Json(state.store.list_conversations(&name, page).await?))
}

pub(super) async fn messages_by_jid(
    State(state): State<AppState>,
    Path((name, jid)): Path<(String, String)>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let page = query.to_request()?;
    state.store.require_instance(&name).await?;
    let conversation = state.store.find_conversation(&name, &jid).await?;
    Ok(Json(state.store.list_messages(conversation.id, page).await?))
}

pub(super) async fn messages_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<PageQuery>,
) -> Result<impl IntoResponse> {
    let page = query.to_request()?;
    let id: i64 = parse_param("conversation id", Some(&id))?
        .ok_or_else(|| SyncError::InvalidInput("conversation id is empty".into()))?;
    Ok(Json(state.store.list_messages(id, page).await?))
}
