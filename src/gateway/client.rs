//! Evolution-style HTTP gateway client.

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::time::{Duration, Instant};

use super::types::{
    MessagePage, PairingSession, ProbeReport, RemoteChat, RemoteConnectionState,
    WebhookRegistration,
};
use super::{Gateway, GatewayError, GatewayResult, validate_instance_name};
use crate::config::GatewayConfig;
use crate::utils::truncate_str;

/// Upper bound on error bodies kept in `GatewayError::Rejected`.
const MAX_ERROR_BODY: usize = 2048;

/// HTTP client for the gateway. Cheap to clone; the inner
/// `reqwest::Client` shares its connection pool.
#[derive(Clone)]
pub struct EvolutionClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
    probe_instance: String,
}

impl EvolutionClient {
    pub fn new(config: &GatewayConfig) -> GatewayResult<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().unwrap_or_default(),
            timeout,
            probe_instance: config.probe_instance.clone(),
        })
    }

    fn url(&self, path: &str, instance: &str) -> String {
        format!("{}/{}/{}", self.base_url, path, urlencoding::encode(instance))
    }

    /// Send a request and return the raw response, mapping transport
    /// failures to `Unavailable`.
    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
    ) -> GatewayResult<reqwest::Response> {
        let mut request = self
            .http
            .request(method, url)
            .header("apikey", &self.api_key)
            .header("Accept", "application/json");
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(|e| {
            let message = if e.is_timeout() {
                format!("request timed out after {}s", self.timeout.as_secs())
            } else {
                format!("request failed: {}", e)
            };
            tracing::warn!("Gateway: {} {}", url, message);
            GatewayError::Unavailable { message }
        })
    }

    /// Send a request, require a 2xx, and parse the body as JSON.
    async fn call(&self, method: Method, url: &str, body: Option<&Value>) -> GatewayResult<Value> {
        let response = self.send(method, url, body).await?;
        let status = response.status();
        let text = response.text().await.map_err(|e| GatewayError::Unavailable {
            message: format!("failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            tracing::debug!("Gateway: {} answered {}", url, status);
            return Err(GatewayError::Rejected {
                status: status.as_u16(),
                body: truncate_str(&text, MAX_ERROR_BODY).to_string(),
            });
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| GatewayError::Decode {
            message: format!("invalid JSON from {}: {}", url, e),
        })
    }
}

fn decode_error(what: &str) -> GatewayError {
    GatewayError::Decode {
        message: format!("unexpected {} response shape", what),
    }
}

#[async_trait]
impl Gateway for EvolutionClient {
    async fn connect_instance(&self, instance: &str) -> GatewayResult<PairingSession> {
        let instance = validate_instance_name(instance)?;
        let body = self
            .call(Method::GET, &self.url("instance/connect", instance), None)
            .await?;
        Ok(PairingSession::from_json(&body))
    }

    async fn connection_state(&self, instance: &str) -> GatewayResult<RemoteConnectionState> {
        let instance = validate_instance_name(instance)?;
        let body = self
            .call(
                Method::GET,
                &self.url("instance/connectionState", instance),
                None,
            )
            .await?;
        RemoteConnectionState::from_json(&body).ok_or_else(|| decode_error("connectionState"))
    }

    async fn set_webhook(
        &self,
        instance: &str,
        registration: &WebhookRegistration,
    ) -> GatewayResult<()> {
        let instance = validate_instance_name(instance)?;
        self.call(
            Method::POST,
            &self.url("webhook/set", instance),
            Some(&registration.to_json()),
        )
        .await?;
        Ok(())
    }

    async fn find_chats(&self, instance: &str) -> GatewayResult<Vec<RemoteChat>> {
        let instance = validate_instance_name(instance)?;
        let body = self
            .call(
                Method::POST,
                &self.url("chat/findChats", instance),
                Some(&serde_json::json!({})),
            )
            .await?;
        RemoteChat::list_from_json(&body).ok_or_else(|| decode_error("findChats"))
    }

    async fn find_messages(
        &self,
        instance: &str,
        page: u32,
        page_size: u32,
    ) -> GatewayResult<MessagePage> {
        let instance = validate_instance_name(instance)?;
        let request = serde_json::json!({
            "where": {},
            "page": page,
            "offset": page_size,
        });
        let body = self
            .call(
                Method::POST,
                &self.url("chat/findMessages", instance),
                Some(&request),
            )
            .await?;
        MessagePage::from_json(&body, page).ok_or_else(|| decode_error("findMessages"))
    }

    async fn probe(&self) -> ProbeReport {
        let url = self.url("instance/connectionState", &self.probe_instance);
        let started = Instant::now();
        let result = self.send(Method::GET, &url, None).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(response) => {
                let status = response.status();
                let authenticated =
                    status != StatusCode::UNAUTHORIZED && status != StatusCode::FORBIDDEN;
                let detail = if !authenticated {
                    "gateway rejected the API key".to_string()
                } else if status == StatusCode::NOT_FOUND || status.is_success() {
                    "gateway reachable".to_string()
                } else {
                    format!("gateway answered {}", status)
                };
                ProbeReport {
                    reachable: true,
                    authenticated,
                    status: Some(status.as_u16()),
                    latency_ms,
                    detail,
                }
            }
            Err(e) => ProbeReport {
                reachable: false,
                authenticated: false,
                status: None,
                latency_ms,
                detail: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    fn client_for(server: &mockito::Server) -> EvolutionClient {
        let config = GatewayConfig {
            base_url: server.url(),
            api_key: Some("test-api-key".to_string()),
            timeout_secs: 2,
            probe_instance: "__probe__".to_string(),
        };
        EvolutionClient::new(&config).unwrap()
    }

    #[tokio::test]
    async fn test_connect_instance_returns_qr() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/instance/connect/shop-1")
            .match_header("apikey", "test-api-key")
            .with_status(200)
            .with_body(r#"{"pairingCode":null,"code":"2@xyz","base64":"data:image/png;base64,QR1","count":1}"#)
            .create_async()
            .await;

        let session = client_for(&server).connect_instance("shop-1").await.unwrap();

        mock.assert_async().await;
        assert_eq!(session.qr_code.as_deref(), Some("data:image/png;base64,QR1"));
    }

    #[tokio::test]
    async fn test_rejected_status_carries_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/instance/connect/ghost")
            .with_status(404)
            .with_body(r#"{"status":404,"error":"Not Found","response":{"message":["The \"ghost\" instance does not exist"]}}"#)
            .create_async()
            .await;

        let err = client_for(&server).connect_instance("ghost").await.unwrap_err();

        mock.assert_async().await;
        assert!(
            matches!(&err, GatewayError::Rejected { status: 404, body } if body.contains("does not exist")),
            "unexpected error: {:?}",
            err
        );
        assert!(err.is_instance_missing());
    }

    #[tokio::test]
    async fn test_server_error_is_rejected_not_panic() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/instance/connectionState/shop-1")
            .with_status(500)
            .with_body("Internal Server Error")
            .create_async()
            .await;

        let err = client_for(&server).connection_state("shop-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected { status: 500, .. }));
    }

    #[tokio::test]
    async fn test_invalid_json_is_decode_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/instance/connectionState/shop-1")
            .with_status(200)
            .with_body("<html>proxy page</html>")
            .create_async()
            .await;

        let err = client_for(&server).connection_state("shop-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Decode { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_gateway_is_unavailable() {
        let config = GatewayConfig {
            // Port 9 (discard) on localhost is expected to refuse connections.
            base_url: "http://127.0.0.1:9".to_string(),
            api_key: None,
            timeout_secs: 2,
            probe_instance: "__probe__".to_string(),
        };
        let client = EvolutionClient::new(&config).unwrap();
        let err = client.connection_state("shop-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable { .. }));
    }

    #[tokio::test]
    async fn test_invalid_name_never_hits_network() {
        let server = mockito::Server::new_async().await;
        let err = client_for(&server)
            .connect_instance("../admin")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInstanceName(_)));
    }

    #[tokio::test]
    async fn test_set_webhook_sends_registration() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/webhook/set/shop-1")
            .match_header("apikey", "test-api-key")
            .match_body(Matcher::PartialJsonString(
                r#"{"webhook":{"enabled":true,"url":"http://me/webhook"}}"#.to_string(),
            ))
            .with_status(201)
            .with_body(r#"{"id":"wh1"}"#)
            .create_async()
            .await;

        let reg = WebhookRegistration::new("http://me/webhook", "x-webhook-secret", "s");
        client_for(&server).set_webhook("shop-1", &reg).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_find_messages_sends_page() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/findMessages/shop-1")
            .match_body(Matcher::PartialJsonString(
                r#"{"page":2,"offset":50}"#.to_string(),
            ))
            .with_status(200)
            .with_body(r#"{"messages":{"total":60,"pages":2,"currentPage":2,"records":[{"key":{"id":"m1"}}]}}"#)
            .create_async()
            .await;

        let page = client_for(&server).find_messages("shop-1", 2, 50).await.unwrap();
        mock.assert_async().await;
        assert_eq!(page.records.len(), 1);
        assert!(page.is_last());
    }

    #[tokio::test]
    async fn test_probe_treats_404_as_healthy() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/instance/connectionState/__probe__")
            .with_status(404)
            .with_body(r#"{"error":"Not Found"}"#)
            .create_async()
            .await;

        let report = client_for(&server).probe().await;
        mock.assert_async().await;
        assert!(report.is_healthy());
        assert_eq!(report.status, Some(404));
    }

    #[tokio::test]
    async fn test_probe_reports_bad_api_key() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/instance/connectionState/__probe__")
            .with_status(401)
            .create_async()
            .await;

        let report = client_for(&server).probe().await;
        assert!(report.reachable);
        assert!(!report.authenticated);
        assert!(!report.is_healthy());
    }
}
