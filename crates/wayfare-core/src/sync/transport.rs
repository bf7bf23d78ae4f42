//! Push/resolve/migrate wire calls.
//!
//! The controller is generic over `SyncTransport` so tests can script server
//! responses without a network.

use std::future::Future;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::{SyncError, SyncResult};
use crate::config::SyncSettings;
use crate::protocol::{
    Acknowledgement, MigrateRequest, MigrateResponse, PushRequest, PushResponse, ResolveRequest,
};
use crate::util::{compact_text, is_http_url};

pub trait SyncTransport: Send + Sync {
    fn push(
        &self,
        token: &str,
        request: &PushRequest,
    ) -> impl Future<Output = SyncResult<PushResponse>> + Send;

    fn resolve(
        &self,
        token: &str,
        request: &ResolveRequest,
    ) -> impl Future<Output = SyncResult<Acknowledgement>> + Send;

    fn migrate(
        &self,
        token: &str,
        request: &MigrateRequest,
    ) -> impl Future<Output = SyncResult<MigrateResponse>> + Send;
}

/// JSON-over-HTTP transport backed by reqwest
#[derive(Debug, Clone)]
pub struct HttpSyncTransport {
    base_url: String,
    client: reqwest::Client,
}

impl HttpSyncTransport {
    pub fn new(settings: &SyncSettings) -> SyncResult<Self> {
        let base_url = settings.api_base_url.trim().trim_end_matches('/').to_string();
        if !is_http_url(&base_url) {
            return Err(SyncError::InvalidConfiguration(
                "API base URL must include http:// or https://".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|error| SyncError::InvalidConfiguration(error.to_string()))?;

        Ok(Self { base_url, client })
    }

    fn endpoint(&self, operation: &str) -> String {
        format!("{}/v1/sync/{operation}", self.base_url)
    }

    async fn post<Req, Resp>(&self, operation: &str, token: &str, body: &Req) -> SyncResult<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let response = self
            .client
            .post(self.endpoint(operation))
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|error| SyncError::Transport(error.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| SyncError::Transport(error.to_string()))?;

        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            tracing::warn!("Sync {} rejected the access token ({})", operation, status);
            return Err(SyncError::AuthExpired);
        }
        if !status.is_success() {
            return Err(SyncError::Server {
                status: status.as_u16(),
                message: parse_api_error(status, &body),
            });
        }

        serde_json::from_str(&body).map_err(|error| SyncError::Server {
            status: status.as_u16(),
            message: compact_text(&format!("invalid {operation} response: {error}")),
        })
    }
}

impl SyncTransport for HttpSyncTransport {
    async fn push(&self, token: &str, request: &PushRequest) -> SyncResult<PushResponse> {
        self.post("push", token, request).await
    }

    async fn resolve(&self, token: &str, request: &ResolveRequest) -> SyncResult<Acknowledgement> {
        self.post("resolve", token, request).await
    }

    async fn migrate(&self, token: &str, request: &MigrateRequest) -> SyncResult<MigrateResponse> {
        self.post("migrate", token, request).await
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return compact_text(&message);
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        compact_text(trimmed)
    }
}
