//! Tunnel configuration API
//!
//! Remotely-managed tunnels keep their ingress rules in one configuration
//! document; reads and writes always cover the whole rule list.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::client::CloudflareClient;
use super::error::ApiError;
use super::{IngressRule, TunnelApi};
use crate::types::OriginRequest;

/// Tunnel client scoped to one account
#[derive(Clone)]
pub struct TunnelClient {
    client: Arc<CloudflareClient>,
    account_id: String,
}

impl TunnelClient {
    pub fn new(client: Arc<CloudflareClient>, account_id: &str) -> Self {
        Self {
            client,
            account_id: account_id.to_string(),
        }
    }

    fn path(&self, tunnel_id: &str) -> String {
        format!(
            "/accounts/{}/cfd_tunnel/{}/configurations",
            self.account_id, tunnel_id
        )
    }
}

// ============================================================
// Wire Types
// ============================================================

#[derive(Debug, Deserialize)]
struct ConfigurationResponse {
    #[serde(default)]
    config: Option<TunnelConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TunnelConfig {
    #[serde(default)]
    ingress: Vec<WireIngress>,
}

#[derive(Debug, Serialize)]
struct ConfigurationRequest<'a> {
    config: &'a TunnelConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireIngress {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    path: String,
    service: String,
    #[serde(rename = "originRequest", default, skip_serializing_if = "Option::is_none")]
    origin_request: Option<WireOriginRequest>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOriginRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    connect_timeout: Option<u64>,
    #[serde(rename = "tlsTimeout", skip_serializing_if = "Option::is_none")]
    tls_timeout: Option<u64>,
    #[serde(rename = "tcpKeepAlive", skip_serializing_if = "Option::is_none")]
    tcp_keep_alive: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive_connections: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    keep_alive_timeout: Option<u64>,
    #[serde(rename = "noTLSVerify", skip_serializing_if = "Option::is_none")]
    no_tls_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    origin_server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    http_host_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    no_happy_eyeballs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    disable_chunked_encoding: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy_type: Option<String>,
}

impl From<&OriginRequest> for WireOriginRequest {
    fn from(o: &OriginRequest) -> Self {
        Self {
            connect_timeout: o.connect_timeout,
            tls_timeout: o.tls_timeout,
            tcp_keep_alive: o.tcp_keep_alive,
            keep_alive_connections: o.keep_alive_connections,
            keep_alive_timeout: o.keep_alive_timeout,
            no_tls_verify: o.no_tls_verify,
            origin_server_name: o.origin_server_name.clone(),
            ca_pool: o.ca_pool.clone(),
            http_host_header: o.http_host_header.clone(),
            no_happy_eyeballs: o.no_happy_eyeballs,
            disable_chunked_encoding: o.disable_chunked_encoding,
            proxy_type: o.proxy_type.clone(),
        }
    }
}

impl From<WireOriginRequest> for OriginRequest {
    fn from(o: WireOriginRequest) -> Self {
        Self {
            connect_timeout: o.connect_timeout,
            tls_timeout: o.tls_timeout,
            tcp_keep_alive: o.tcp_keep_alive,
            keep_alive_connections: o.keep_alive_connections,
            keep_alive_timeout: o.keep_alive_timeout,
            no_tls_verify: o.no_tls_verify,
            origin_server_name: o.origin_server_name,
            ca_pool: o.ca_pool,
            http_host_header: o.http_host_header,
            no_happy_eyeballs: o.no_happy_eyeballs,
            disable_chunked_encoding: o.disable_chunked_encoding,
            proxy_type: o.proxy_type,
        }
    }
}

impl From<WireIngress> for IngressRule {
    fn from(rule: WireIngress) -> Self {
        Self {
            hostname: rule.hostname,
            path: rule.path,
            service: rule.service,
            origin_request: OriginRequest::normalized(
                rule.origin_request.map(OriginRequest::from).as_ref(),
            ),
        }
    }
}

impl From<&IngressRule> for WireIngress {
    fn from(rule: &IngressRule) -> Self {
        Self {
            hostname: rule.hostname.clone(),
            path: rule.path.clone(),
            service: rule.service.clone(),
            origin_request: OriginRequest::normalized(rule.origin_request.as_ref())
                .as_ref()
                .map(WireOriginRequest::from),
        }
    }
}

// ============================================================
// Client Implementation
// ============================================================

#[async_trait]
impl TunnelApi for TunnelClient {
    async fn get_rule_set(&self, tunnel_id: &str) -> Result<Vec<IngressRule>, ApiError> {
        let response: ConfigurationResponse = self
            .client
            .execute(self.client.get(&self.path(tunnel_id)))
            .await?;

        let rules: Vec<IngressRule> = response
            .config
            .unwrap_or_default()
            .ingress
            .into_iter()
            .map(IngressRule::from)
            .collect();
        debug!(tunnel_id, rules = rules.len(), "Fetched tunnel configuration");
        Ok(rules)
    }

    async fn replace_rule_set(
        &self,
        tunnel_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), ApiError> {
        let config = TunnelConfig {
            ingress: rules.iter().map(WireIngress::from).collect(),
        };
        debug!(tunnel_id, rules = rules.len(), "Replacing tunnel configuration");
        self.client
            .execute_unit(
                self.client
                    .put(&self.path(tunnel_id))
                    .json(&ConfigurationRequest { config: &config }),
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> TunnelClient {
        let client = CloudflareClient::new("token-1")
            .unwrap()
            .with_base_url(&server.uri());
        TunnelClient::new(Arc::new(client), "acc-1")
    }

    #[tokio::test]
    async fn test_get_rule_set_decodes_origin_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/acc-1/cfd_tunnel/t-1/configurations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "errors": [],
                "result": {
                    "tunnel_id": "t-1",
                    "config": {
                        "ingress": [
                            {
                                "hostname": "app.example.com",
                                "service": "http://app:80",
                                "originRequest": {"noTLSVerify": true, "connectTimeout": 10}
                            },
                            {
                                "hostname": "plain.example.com",
                                "service": "http://plain:80",
                                "originRequest": {}
                            },
                            {"service": "http_status:404"}
                        ]
                    }
                }
            })))
            .mount(&server)
            .await;

        let rules = client(&server).get_rule_set("t-1").await.unwrap();
        assert_eq!(rules.len(), 3);
        let origin = rules[0].origin_request.as_ref().unwrap();
        assert_eq!(origin.no_tls_verify, Some(true));
        assert_eq!(origin.connect_timeout, Some(10));
        assert!(rules[1].origin_request.is_none());
        assert!(rules[2].is_catch_all());
    }

    #[tokio::test]
    async fn test_get_rule_set_without_config() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/accounts/acc-1/cfd_tunnel/t-1/configurations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "errors": [],
                "result": {"tunnel_id": "t-1", "config": null}
            })))
            .mount(&server)
            .await;

        assert!(client(&server).get_rule_set("t-1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replace_rule_set_sends_whole_list() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/accounts/acc-1/cfd_tunnel/t-1/configurations"))
            .and(body_json(json!({
                "config": {
                    "ingress": [
                        {"hostname": "app.example.com", "path": "/api", "service": "http://app:80"},
                        {"service": "http_status:404"}
                    ]
                }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": true,
                "errors": [],
                "result": {"tunnel_id": "t-1"}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let rules = vec![
            IngressRule {
                hostname: "app.example.com".to_string(),
                path: "/api".to_string(),
                service: "http://app:80".to_string(),
                origin_request: Some(OriginRequest::default()),
            },
            IngressRule::catch_all(),
        ];
        client(&server).replace_rule_set("t-1", &rules).await.unwrap();
    }
}
