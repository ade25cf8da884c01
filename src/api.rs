//! Authenticated JSON client for the language_server loopback API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, ClientBuilder, StatusCode};
use serde_json::json;

use crate::error::FetchError;
use crate::model::{QuotaSnapshot, UserStatusResponse};

const SERVICE_PATH: &str = "exa.language_server_pb.LanguageServerService";
const CSRF_HEADER: &str = "X-Codeium-Csrf-Token";
const CONNECT_PROTOCOL_HEADER: &str = "Connect-Protocol-Version";

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Network operations against a candidate or resolved endpoint. Production
/// uses [`ApiClient`]; tests substitute fakes.
#[async_trait]
pub trait QuotaTransport: Send + Sync {
    /// Cheap reachability check; `true` only on HTTP 200.
    async fn probe(&self, port: u16, csrf_token: &str) -> bool;

    /// Fetch the account and per-model quota snapshot.
    async fn fetch_quota(&self, port: u16, csrf_token: &str) -> Result<QuotaSnapshot, FetchError>;
}

/// HTTPS client for the loopback API. The server presents a self-signed
/// per-session certificate, so verification is disabled for this client
/// only; it never talks to anything but 127.0.0.1.
pub struct ApiClient {
    client: Client,
    base: String,
}

impl ApiClient {
    pub fn new() -> crate::error::Result<Self> {
        let client = ClientBuilder::new()
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self {
            client,
            base: "https://127.0.0.1".to_owned(),
        })
    }

    /// Point the client at a different scheme/host, for tests against a
    /// plain-HTTP mock server.
    #[cfg(test)]
    fn with_base(base: &str) -> Self {
        Self {
            client: Client::new(),
            base: base.to_owned(),
        }
    }

    fn url(&self, port: u16, rpc: &str) -> String {
        format!("{}:{}/{}/{}", self.base, port, SERVICE_PATH, rpc)
    }
}

fn probe_body() -> serde_json::Value {
    json!({
        "context": {
            "properties": {
                "devMode": "false",
                "ide": "antigravity",
                "language": "UNSPECIFIED",
            }
        }
    })
}

fn status_body() -> serde_json::Value {
    json!({
        "metadata": {
            "ideName": "antigravity",
            "extensionName": "antigravity",
            "locale": "en",
        }
    })
}

#[async_trait]
impl QuotaTransport for ApiClient {
    async fn probe(&self, port: u16, csrf_token: &str) -> bool {
        let response = self
            .client
            .post(self.url(port, "GetUnleashData"))
            .timeout(PROBE_TIMEOUT)
            .header(CONTENT_TYPE, "application/json")
            .header(CONNECT_PROTOCOL_HEADER, "1")
            .header(CSRF_HEADER, csrf_token)
            .json(&probe_body())
            .send()
            .await;

        match response {
            Ok(response) => {
                let ok = response.status() == StatusCode::OK;
                tracing::debug!("port {port} probe answered HTTP {}", response.status());
                ok
            }
            Err(error) => {
                tracing::debug!("port {port} probe failed: {error}");
                false
            }
        }
    }

    async fn fetch_quota(&self, port: u16, csrf_token: &str) -> Result<QuotaSnapshot, FetchError> {
        let response = self
            .client
            .post(self.url(port, "GetUserStatus"))
            .timeout(FETCH_TIMEOUT)
            .header(CONTENT_TYPE, "application/json")
            .header(CONNECT_PROTOCOL_HEADER, "1")
            .header(CSRF_HEADER, csrf_token)
            .json(&status_body())
            .send()
            .await
            .map_err(FetchError::Transport)?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::BadStatus(status.as_u16()));
        }

        let raw = response.text().await.map_err(FetchError::Transport)?;
        tracing::debug!("GetUserStatus response length: {} bytes", raw.len());
        let parsed: UserStatusResponse =
            serde_json::from_str(&raw).map_err(FetchError::Parse)?;
        Ok(parsed.into_snapshot())
    }
}
