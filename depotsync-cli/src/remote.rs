//! HTTP content-server client for depotsync.
//!
//! Implements the delivery-network capability against a manifest relay
//! speaking plain HTTP:
//! - `GET /depots/{app}/{depot}/{gid}/code` — one-time access code (JSON)
//! - `GET /depots/{app}/{depot}/{gid}/manifest?code=N` — manifest body
//!   (binary, possibly zstd-compressed)
//! - `GET /depots/{app}/{depot}/key` — depot decryption key (JSON, hex)
//!
//! 401/403 responses map to access denial (terminal for the task);
//! connection errors, other failure statuses and malformed bodies are
//! reported as transient so the fetch loop retries them.

use async_trait::async_trait;
use depotsync_core::{CdnError, ContentServer, DepotKey, Manifest};
use serde::Deserialize;

/// HTTP client for a manifest relay endpoint.
pub struct HttpContentServer {
    base_url: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct CodeResponse {
    code: u64,
}

#[derive(Debug, Deserialize)]
struct KeyResponse {
    key: String,
}

impl HttpContentServer {
    /// Create a new client targeting `base_url` (e.g. `http://relay:8080`).
    pub fn new(base_url: &str) -> Self {
        let url = base_url.trim_end_matches('/').to_string();
        Self {
            base_url: url,
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .expect("Failed to create HTTP client"),
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, CdnError> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CdnError::Transient(format!("Failed to connect to {}: {}", url, e)))?;

        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(CdnError::AccessDenied);
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CdnError::Transient(format!(
                "GET {} failed ({}): {}",
                url, status, body
            )));
        }
        Ok(resp)
    }
}

#[async_trait]
impl ContentServer for HttpContentServer {
    async fn manifest_request_code(
        &self,
        app_id: u32,
        depot_id: u32,
        manifest_gid: u64,
    ) -> Result<u64, CdnError> {
        let url = format!(
            "{}/depots/{}/{}/{}/code",
            self.base_url, app_id, depot_id, manifest_gid
        );
        let resp = self.get(&url).await?;
        let body: CodeResponse = resp
            .json()
            .await
            .map_err(|e| CdnError::Transient(format!("Malformed code response: {}", e)))?;
        Ok(body.code)
    }

    async fn fetch_manifest(
        &self,
        app_id: u32,
        depot_id: u32,
        manifest_gid: u64,
        code: u64,
    ) -> Result<Manifest, CdnError> {
        let url = format!(
            "{}/depots/{}/{}/{}/manifest?code={}",
            self.base_url, app_id, depot_id, manifest_gid, code
        );
        let resp = self.get(&url).await?;
        let data: bytes::Bytes = resp
            .bytes()
            .await
            .map_err(|e| CdnError::Transient(format!("Failed to read manifest body: {}", e)))?;
        Manifest::deserialize(&data)
            .map_err(|e| CdnError::Transient(format!("Malformed manifest body: {}", e)))
    }

    async fn depot_key(&self, app_id: u32, depot_id: u32) -> Result<DepotKey, CdnError> {
        let url = format!("{}/depots/{}/{}/key", self.base_url, app_id, depot_id);
        let resp = self.get(&url).await?;
        let body: KeyResponse = resp
            .json()
            .await
            .map_err(|e| CdnError::Transient(format!("Malformed key response: {}", e)))?;
        DepotKey::from_hex(&body.key)
            .map_err(|e| CdnError::Transient(format!("Malformed depot key: {}", e)))
    }
}
