//! Credential Router
//!
//! Maps hostnames and tunnels to the credential (and account) that manages
//! them and hands out cached API clients.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::access::AccessClient;
use super::client::CloudflareClient;
use super::dns::DnsClient;
use super::error::ApiError;
use super::tunnel::TunnelClient;
use super::{AccessApi, ApiRouter, DnsApi, TunnelScope};
use crate::config::CloudflareConfig;
use crate::types::DEFAULT_TUNNEL;

const DEFAULT_CREDENTIAL: &str = "default";

/// How long a reachability probe result is reused
const HEALTH_CACHE_SECS: i64 = 30;

/// Named API identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub name: String,
    pub api_token: String,
    pub zones: Vec<String>,
    pub default: bool,
}

impl Credential {
    /// Whether `hostname` falls under one of this credential's zones
    pub fn matches(&self, hostname: &str) -> bool {
        let hostname = hostname.trim_end_matches('.').to_ascii_lowercase();
        self.zones.iter().any(|zone| {
            let zone = zone.trim_end_matches('.').to_ascii_lowercase();
            let base = zone.strip_prefix("*.").unwrap_or(&zone);
            hostname == base || hostname.ends_with(&format!(".{}", base))
        })
    }
}

/// Tunnel with its account scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCredential {
    pub tunnel_id: String,
    pub tunnel_name: String,
    pub account_id: String,
    /// Credential used for this tunnel, the default when unset
    pub credential: Option<String>,
}

/// Cached result of the reachability probe
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HealthResult {
    pub reachable: bool,
    pub last_check: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct CredentialRouter {
    /// Default credential first, then named credentials by name
    credentials: Vec<Credential>,
    tunnels: Vec<TunnelCredential>,
    base_url: String,
    cancel: CancellationToken,
    clients: RwLock<HashMap<String, Arc<CloudflareClient>>>,
    health: tokio::sync::RwLock<Option<HealthResult>>,
}

impl CredentialRouter {
    pub fn from_config(config: &CloudflareConfig, cancel: CancellationToken) -> Result<Self> {
        let mut credentials = Vec::new();

        if let Some(token) = config.api_token.as_deref().filter(|t| !t.is_empty()) {
            credentials.push(Credential {
                name: DEFAULT_CREDENTIAL.to_string(),
                api_token: token.to_string(),
                zones: Vec::new(),
                default: true,
            });
        }

        for (name, cred) in &config.credentials {
            credentials.push(Credential {
                name: name.clone(),
                api_token: cred.api_token.clone(),
                zones: cred.zones.clone(),
                default: false,
            });
        }

        match credentials.first_mut() {
            Some(first) => first.default = true,
            None => anyhow::bail!("No Cloudflare credentials configured"),
        }

        let mut tunnels = Vec::new();
        if let (Some(account_id), Some(tunnel_id)) = (&config.account_id, &config.tunnel_id) {
            tunnels.push(TunnelCredential {
                tunnel_id: tunnel_id.clone(),
                tunnel_name: DEFAULT_TUNNEL.to_string(),
                account_id: account_id.clone(),
                credential: None,
            });
        }
        for (name, tunnel) in &config.tunnels {
            tunnels.push(TunnelCredential {
                tunnel_id: tunnel.tunnel_id.clone(),
                tunnel_name: name.clone(),
                account_id: tunnel.account_id.clone(),
                credential: tunnel.credential.clone(),
            });
        }

        Ok(Self {
            credentials,
            tunnels,
            base_url: config.api_base_url.clone(),
            cancel,
            clients: RwLock::new(HashMap::new()),
            health: tokio::sync::RwLock::new(None),
        })
    }

    pub fn default_credential(&self) -> &Credential {
        // from_config guarantees at least one credential
        &self.credentials[0]
    }

    pub fn tunnel_names(&self) -> Vec<&str> {
        self.tunnels.iter().map(|t| t.tunnel_name.as_str()).collect()
    }

    /// Explicit name wins, then the first zone match, then the default
    pub fn resolve_credential(
        &self,
        hostname: &str,
        explicit: Option<&str>,
    ) -> Result<&Credential, ApiError> {
        if let Some(name) = explicit.filter(|n| !n.is_empty()) {
            if name == DEFAULT_CREDENTIAL {
                return Ok(self.default_credential());
            }
            return self
                .credentials
                .iter()
                .find(|c| c.name == name)
                .ok_or_else(|| ApiError::Config(format!("credential not found: {}", name)));
        }

        Ok(self
            .credentials
            .iter()
            .find(|c| c.matches(hostname))
            .unwrap_or_else(|| self.default_credential()))
    }

    /// Tunnel by name or ID
    pub fn tunnel_credential(&self, tunnel: &str) -> Result<&TunnelCredential, ApiError> {
        self.tunnels
            .iter()
            .find(|t| t.tunnel_name == tunnel || t.tunnel_id == tunnel)
            .ok_or_else(|| ApiError::Config(format!("tunnel not configured: {}", tunnel)))
    }

    /// Tunnel whose account scopes Access: `default`, else the first one
    fn access_tunnel(&self) -> Result<&TunnelCredential, ApiError> {
        self.tunnel_credential(DEFAULT_TUNNEL).or_else(|_| {
            self.tunnels.first().ok_or_else(|| {
                ApiError::Config(
                    "an account ID is required for Access applications".to_string(),
                )
            })
        })
    }

    /// Cached client for a credential, built on first use
    pub fn client(&self, credential: &Credential) -> Result<Arc<CloudflareClient>, ApiError> {
        {
            let clients = self.clients.read().unwrap_or_else(|e| e.into_inner());
            if let Some(client) = clients.get(&credential.name) {
                return Ok(client.clone());
            }
        }

        let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
        if let Some(client) = clients.get(&credential.name) {
            return Ok(client.clone());
        }

        let client = CloudflareClient::new(&credential.api_token)
            .map_err(|e| ApiError::Config(format!("credential {}: {}", credential.name, e)))?
            .with_base_url(&self.base_url)
            .with_cancellation(self.cancel.clone());
        let client = Arc::new(client);
        clients.insert(credential.name.clone(), client.clone());
        debug!(credential = %credential.name, "Created Cloudflare client");
        Ok(client)
    }

    fn tunnel_api_credential(&self, tunnel: &TunnelCredential) -> Result<&Credential, ApiError> {
        match &tunnel.credential {
            Some(name) => self.resolve_credential("", Some(name)),
            None => Ok(self.default_credential()),
        }
    }

    /// Verify every credential's token
    pub async fn validate(&self) -> Result<()> {
        let checks = self.credentials.iter().map(|cred| async move {
            let client = self.client(cred)?;
            client.verify_token().await?;
            Ok::<_, ApiError>(())
        });
        let results = futures::future::join_all(checks).await;

        for (cred, result) in self.credentials.iter().zip(results) {
            result.with_context(|| format!("Validation failed for credential {}", cred.name))?;
            info!(credential = %cred.name, default = cred.default, "Credential validated");
        }
        Ok(())
    }

    /// Reachability of the API, probed at most once per 30 seconds
    pub async fn health_check(&self) -> HealthResult {
        {
            let cached = self.health.read().await;
            if let Some(result) = cached.as_ref() {
                if Utc::now() - result.last_check < chrono::Duration::seconds(HEALTH_CACHE_SECS) {
                    return result.clone();
                }
            }
        }

        let mut cached = self.health.write().await;
        if let Some(result) = cached.as_ref() {
            if Utc::now() - result.last_check < chrono::Duration::seconds(HEALTH_CACHE_SECS) {
                return result.clone();
            }
        }

        let result = match self.validate().await {
            Ok(()) => HealthResult {
                reachable: true,
                last_check: Utc::now(),
                error: None,
            },
            Err(e) => HealthResult {
                reachable: false,
                last_check: Utc::now(),
                error: Some(format!("{:#}", e)),
            },
        };
        *cached = Some(result.clone());
        result
    }
}

impl ApiRouter for CredentialRouter {
    fn dns(&self, hostname: &str, credential: Option<&str>) -> Result<Arc<dyn DnsApi>, ApiError> {
        let credential = self.resolve_credential(hostname, credential)?;
        Ok(Arc::new(DnsClient::new(self.client(credential)?)))
    }

    fn tunnel(&self, tunnel: &str) -> Result<TunnelScope, ApiError> {
        let tunnel = self.tunnel_credential(tunnel)?;
        let client = self.client(self.tunnel_api_credential(tunnel)?)?;
        Ok(TunnelScope {
            api: Arc::new(TunnelClient::new(client, &tunnel.account_id)),
            tunnel_id: tunnel.tunnel_id.clone(),
            tunnel_name: tunnel.tunnel_name.clone(),
            account_id: tunnel.account_id.clone(),
        })
    }

    fn access(&self) -> Result<Arc<dyn AccessApi>, ApiError> {
        let tunnel = self.access_tunnel()?;
        let client = self.client(self.tunnel_api_credential(tunnel)?)?;
        Ok(Arc::new(AccessClient::new(client, &tunnel.account_id)))
    }
}
