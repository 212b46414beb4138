//! Cloudflare API
//!
//! Per-kind client contracts used by the operators, the reqwest-based v4
//! REST implementation, and the credential router that picks the client
//! and account for a hostname or tunnel.

mod access;
mod client;
mod credentials;
mod dns;
mod error;
mod tunnel;

pub use access::AccessClient;
pub use client::{match_zone, CloudflareClient, CLOUDFLARE_API};
pub use credentials::{Credential, CredentialRouter, HealthResult, TunnelCredential};
pub use dns::DnsClient;
pub use error::{ApiError, ApiErrorDetail};
pub use tunnel::TunnelClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::types::{AccessPolicyDef, OriginRequest, RecordType};

/// Service of the catch-all rule terminating every pushed rule set
pub const CATCH_ALL_SERVICE: &str = "http_status:404";

// ============================================================
// Remote resource types
// ============================================================

/// DNS record as sent to and returned by the API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub zone_id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: RecordType,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub proxied: bool,
    /// 1 = automatic
    #[serde(default)]
    pub ttl: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

/// One rule of a tunnel's ingress configuration. An empty hostname is a
/// catch-all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressRule {
    pub hostname: String,
    pub path: String,
    pub service: String,
    pub origin_request: Option<OriginRequest>,
}

impl IngressRule {
    pub fn catch_all() -> Self {
        Self {
            service: CATCH_ALL_SERVICE.to_string(),
            ..Default::default()
        }
    }

    pub fn is_catch_all(&self) -> bool {
        self.hostname.is_empty()
    }
}

/// Access application summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessApplication {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
}

// ============================================================
// Client contracts
// ============================================================

#[async_trait]
pub trait DnsApi: Send + Sync {
    /// Zone ID owning `hostname` (longest suffix match)
    async fn zone_id(&self, hostname: &str) -> Result<String, ApiError>;

    /// Create `record` in `record.zone_id`
    async fn create_record(&self, record: &DnsRecord) -> Result<DnsRecord, ApiError>;

    /// Overwrite the record identified by `record.zone_id` and `record.id`
    async fn update_record(&self, record: &DnsRecord) -> Result<DnsRecord, ApiError>;

    async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), ApiError>;

    async fn get_record_by_name(
        &self,
        hostname: &str,
        record_type: RecordType,
    ) -> Result<Option<DnsRecord>, ApiError>;
}

/// Tunnel ingress configuration. The API only replaces the whole rule list.
#[async_trait]
pub trait TunnelApi: Send + Sync {
    async fn get_rule_set(&self, tunnel_id: &str) -> Result<Vec<IngressRule>, ApiError>;

    async fn replace_rule_set(&self, tunnel_id: &str, rules: &[IngressRule])
        -> Result<(), ApiError>;
}

#[async_trait]
pub trait AccessApi: Send + Sync {
    /// Account the applications live in
    fn account_id(&self) -> &str;

    /// Application whose domain is `hostname`, if any
    async fn find_existing_application(
        &self,
        hostname: &str,
    ) -> Result<Option<AccessApplication>, ApiError>;

    /// Create or update the application for `hostname` and replace its
    /// reusable policies. Returns the application ID.
    async fn ensure_application_for_hostname(
        &self,
        hostname: &str,
        policy: &AccessPolicyDef,
        existing_app_id: Option<&str>,
    ) -> Result<String, ApiError>;

    /// Delete an application and the reusable policies bound to it
    async fn delete_application(&self, app_id: &str) -> Result<(), ApiError>;

    async fn check_permissions(&self) -> Result<(), ApiError>;
}

/// Tunnel client bound to one tunnel
#[derive(Clone)]
pub struct TunnelScope {
    pub api: Arc<dyn TunnelApi>,
    pub tunnel_id: String,
    pub tunnel_name: String,
    pub account_id: String,
}

/// Picks the client (and account) for a hostname, tunnel or Access
pub trait ApiRouter: Send + Sync {
    fn dns(&self, hostname: &str, credential: Option<&str>) -> Result<Arc<dyn DnsApi>, ApiError>;

    /// Resolve a tunnel by name or ID
    fn tunnel(&self, tunnel: &str) -> Result<TunnelScope, ApiError>;

    fn access(&self) -> Result<Arc<dyn AccessApi>, ApiError>;
}

/// CNAME target of a tunnel's public hostnames
pub fn tunnel_alias_target(tunnel_id: &str) -> String {
    format!("{}.cfargotunnel.com", tunnel_id)
}
