//! Cloudflare API Client
//!
//! Shared v4 REST plumbing: bearer auth, response envelope decoding,
//! pagination, token verification and the per-client zone cache.

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::error::{ApiError, ApiErrorDetail};

pub const CLOUDFLARE_API: &str = "https://api.cloudflare.com/client/v4";

const PAGE_SIZE: u32 = 50;

// ============================================================
// API Response Types
// ============================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiErrorDetail>,
    result: Option<T>,
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

// ============================================================
// Client Implementation
// ============================================================

/// Cloudflare API client for one credential
pub struct CloudflareClient {
    http: Client,
    api_token: String,
    base_url: String,
    cancel: CancellationToken,
    /// Zone name -> zone ID, loaded on first use
    zones: RwLock<Option<HashMap<String, String>>>,
}

impl CloudflareClient {
    pub fn new(api_token: &str) -> Result<Self, ApiError> {
        if api_token.is_empty() {
            return Err(ApiError::Config("missing API token".to_string()));
        }

        let http = Client::builder()
            .user_agent(concat!("labelgate/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            api_token: api_token.to_string(),
            base_url: CLOUDFLARE_API.to_string(),
            cancel: CancellationToken::new(),
            zones: RwLock::new(None),
        })
    }

    /// Point the client at another API root (mock servers)
    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    /// Abort in-flight requests when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub(crate) fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(format!("{}{}", self.base_url, path))
    }

    pub(crate) fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(format!("{}{}", self.base_url, path))
    }

    pub(crate) fn put(&self, path: &str) -> RequestBuilder {
        self.http.put(format!("{}{}", self.base_url, path))
    }

    pub(crate) fn delete(&self, path: &str) -> RequestBuilder {
        self.http.delete(format!("{}{}", self.base_url, path))
    }

    /// Send a request and unwrap the `result` of the response envelope
    pub(crate) async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<T, ApiError> {
        let (result, _) = self.execute_envelope(request).await?;
        result.ok_or(ApiError::MissingResult)
    }

    /// Send a request whose response body does not matter beyond success
    pub(crate) async fn execute_unit(&self, request: RequestBuilder) -> Result<(), ApiError> {
        self.execute_envelope::<serde_json::Value>(request)
            .await
            .map(|_| ())
    }

    async fn execute_envelope<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<(Option<T>, Option<ResultInfo>), ApiError> {
        let request = request.bearer_auth(&self.api_token);

        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ApiError::Cancelled),
            response = request.send() => response?,
        };

        let status = response.status();
        let body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(ApiError::Cancelled),
            body = response.text() => body?,
        };

        let envelope: ApiResponse<T> = match serde_json::from_str(&body) {
            Ok(envelope) => envelope,
            Err(_) => {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        };

        if !envelope.success || !status.is_success() {
            return Err(ApiError::Api {
                status: status.as_u16(),
                errors: envelope.errors,
            });
        }

        Ok((envelope.result, envelope.result_info))
    }

    /// Fetch every page of a list endpoint
    pub(crate) async fn execute_paged<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<T>, ApiError> {
        let mut items = Vec::new();
        let mut page = 1;

        loop {
            let request = self.get(path).query(query).query(&[
                ("page", page.to_string()),
                ("per_page", PAGE_SIZE.to_string()),
            ]);
            let (result, info) = self.execute_envelope::<Vec<T>>(request).await?;
            items.extend(result.unwrap_or_default());

            match info {
                Some(info) if info.total_pages > info.page.max(page) => page += 1,
                _ => break,
            }
        }

        Ok(items)
    }

    /// Check that the token is usable, falling back to listing zones for
    /// tokens without the verify permission
    pub async fn verify_token(&self) -> Result<(), ApiError> {
        match self.execute_unit(self.get("/user/tokens/verify")).await {
            Ok(()) => Ok(()),
            Err(ApiError::Cancelled) => Err(ApiError::Cancelled),
            Err(verify_err) => {
                debug!(error = %verify_err, "Token verify failed, trying zone list");
                self.execute_unit(self.get("/zones").query(&[("per_page", "1")]))
                    .await
            }
        }
    }

    // ============================================================
    // Zone Cache
    // ============================================================

    /// Zone ID for `hostname` by longest suffix match. The zone list is
    /// fetched once; a miss reloads it a single time in case the zone was
    /// added after startup.
    pub async fn zone_id(&self, hostname: &str) -> Result<String, ApiError> {
        if let Some(id) = self.cached_zone_id(hostname).await? {
            return Ok(id);
        }

        debug!(hostname, "No cached zone matched, reloading zones");
        self.invalidate_zone_cache().await;
        self.cached_zone_id(hostname)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("zone for hostname {}", hostname)))
    }

    async fn cached_zone_id(&self, hostname: &str) -> Result<Option<String>, ApiError> {
        {
            let zones = self.zones.read().await;
            if let Some(zones) = zones.as_ref() {
                return Ok(match_zone(zones, hostname).map(str::to_string));
            }
        }

        let mut zones = self.zones.write().await;
        if zones.is_none() {
            let listed: Vec<Zone> = self.execute_paged("/zones", &[]).await?;
            debug!(count = listed.len(), "Loaded zones");
            *zones = Some(
                listed
                    .into_iter()
                    .map(|z| (z.name.to_ascii_lowercase(), z.id))
                    .collect(),
            );
        }

        Ok(zones
            .as_ref()
            .and_then(|zones| match_zone(zones, hostname))
            .map(str::to_string))
    }

    /// Drop the cached zone list
    pub async fn invalidate_zone_cache(&self) {
        *self.zones.write().await = None;
    }
}

/// Longest-suffix zone match: walks `hostname` label by label from the
/// left and returns the ID of the first (longest) zone name found.
pub fn match_zone<'a>(zones: &'a HashMap<String, String>, hostname: &str) -> Option<&'a str> {
    let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
    let mut candidate = hostname.as_str();

    loop {
        if let Some(id) = zones.get(candidate) {
            return Some(id.as_str());
        }
        match candidate.split_once('.') {
            Some((_, rest)) if !rest.is_empty() => candidate = rest,
            _ => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn zones(names: &[(&str, &str)]) -> HashMap<String, String> {
        names
            .iter()
            .map(|(name, id)| (name.to_string(), id.to_string()))
            .collect()
    }

    #[test]
    fn test_match_zone_longest_suffix() {
        let zones = zones(&[("example.com", "z1"), ("b.example.com", "z2")]);
        assert_eq!(match_zone(&zones, "a.b.example.com"), Some("z2"));
        assert_eq!(match_zone(&zones, "b.example.com"), Some("z2"));
        assert_eq!(match_zone(&zones, "c.example.com"), Some("z1"));
        assert_eq!(match_zone(&zones, "Example.COM."), Some("z1"));
        assert_eq!(match_zone(&zones, "example.org"), None);
        assert_eq!(match_zone(&zones, "com"), None);
    }

    #[tokio::test]
    async fn test_zone_cache_loads_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zones"))
            .and(header("authorization", "Bearer token-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errors": [],
                "result": [
                    {"id": "z1", "name": "example.com"},
                    {"id": "z2", "name": "b.example.com"}
                ],
                "result_info": {"page": 1, "total_pages": 1}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = CloudflareClient::new("token-1")
            .unwrap()
            .with_base_url(&server.uri());

        assert_eq!(client.zone_id("a.b.example.com").await.unwrap(), "z2");
        assert_eq!(client.zone_id("www.example.com").await.unwrap(), "z1");
    }

    #[tokio::test]
    async fn test_zone_miss_reloads_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zones"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errors": [],
                "result": [{"id": "z1", "name": "example.com"}]
            })))
            .expect(2)
            .mount(&server)
            .await;

        let client = CloudflareClient::new("token-1")
            .unwrap()
            .with_base_url(&server.uri());

        let err = client.zone_id("app.example.org").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_paged_listing_follows_total_pages() {
        let server = MockServer::start().await;
        for (page, id) in [("1", "z1"), ("2", "z2")] {
            Mock::given(method("GET"))
                .and(path("/zones"))
                .and(query_param("page", page))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "success": true,
                    "errors": [],
                    "result": [{"id": id, "name": format!("{}.example", id)}],
                    "result_info": {"page": page.parse::<u32>().unwrap(), "total_pages": 2}
                })))
                .mount(&server)
                .await;
        }

        let client = CloudflareClient::new("token-1")
            .unwrap()
            .with_base_url(&server.uri());

        assert_eq!(client.zone_id("a.z2.example").await.unwrap(), "z2");
        assert_eq!(client.zone_id("z1.example").await.unwrap(), "z1");
    }

    #[tokio::test]
    async fn test_api_errors_are_decoded() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/tokens/verify"))
            .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
                "success": false,
                "errors": [{"code": 1000, "message": "Invalid API Token"}],
                "result": null
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/zones"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "success": false,
                "errors": [{"code": 9109, "message": "token expired"}],
                "result": null
            })))
            .mount(&server)
            .await;

        let client = CloudflareClient::new("token-1")
            .unwrap()
            .with_base_url(&server.uri());

        let err = client.verify_token().await.unwrap_err();
        assert!(err.to_string().contains("token expired"));
    }

    #[tokio::test]
    async fn test_cancelled_client_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = CloudflareClient::new("token-1")
            .unwrap()
            .with_base_url("http://127.0.0.1:9")
            .with_cancellation(cancel);

        assert!(client.verify_token().await.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(matches!(
            CloudflareClient::new(""),
            Err(ApiError::Config(_))
        ));
    }
}
