//! Desired-State Types
//!
//! Service descriptors declared by containers, the access policy templates
//! they reference, and the container/agent envelopes that carry them into
//! the reconciler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tunnel name used when a descriptor does not pick one
pub const DEFAULT_TUNNEL: &str = "default";

fn default_true() -> bool {
    true
}

fn default_target() -> String {
    DnsTarget::AUTO.to_string()
}

fn default_tunnel() -> String {
    DEFAULT_TUNNEL.to_string()
}

// ============================================================
// Naming (DNS) descriptors
// ============================================================

/// DNS record type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RecordType {
    #[default]
    A,
    Aaaa,
    Cname,
    Txt,
    Mx,
    Caa,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::A => "A",
            RecordType::Aaaa => "AAAA",
            RecordType::Cname => "CNAME",
            RecordType::Txt => "TXT",
            RecordType::Mx => "MX",
            RecordType::Caa => "CAA",
        }
    }
}

impl std::fmt::Display for RecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RecordType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "AAAA" => Ok(RecordType::Aaaa),
            "CNAME" => Ok(RecordType::Cname),
            "TXT" => Ok(RecordType::Txt),
            "MX" => Ok(RecordType::Mx),
            "CAA" => Ok(RecordType::Caa),
            other => Err(format!("unsupported record type: {}", other)),
        }
    }
}

/// How a naming descriptor's target is turned into record content
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DnsTarget<'a> {
    /// Public IP of this host, discovered remotely
    Auto,
    /// First network address of the owning container
    Container,
    Literal(&'a str),
}

impl<'a> DnsTarget<'a> {
    pub const AUTO: &'static str = "auto";
    pub const CONTAINER: &'static str = "container";

    pub fn parse(target: &'a str) -> Self {
        match target {
            "" | Self::AUTO => DnsTarget::Auto,
            Self::CONTAINER => DnsTarget::Container,
            literal => DnsTarget::Literal(literal),
        }
    }
}

/// A DNS record declared by a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsService {
    #[serde(default)]
    pub service_name: String,
    pub hostname: String,
    #[serde(default, rename = "type")]
    pub record_type: RecordType,
    /// `auto`, `container`, or a literal record content
    #[serde(default = "default_target")]
    pub target: String,
    #[serde(default = "default_true")]
    pub proxied: bool,
    /// Seconds, 0 = automatic
    #[serde(default)]
    pub ttl: u32,
    /// Explicit credential name; zone matching picks one when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default = "default_true")]
    pub cleanup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Name of an access policy template to bind to this hostname
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    /// MX priority
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u16>,
}

impl DnsService {
    pub fn new(service_name: &str, hostname: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            hostname: hostname.to_string(),
            record_type: RecordType::A,
            target: default_target(),
            proxied: true,
            ttl: 0,
            credential: None,
            cleanup: true,
            comment: None,
            access: None,
            priority: None,
        }
    }
}

// ============================================================
// Ingress (Tunnel) descriptors
// ============================================================

/// Origin request options for a tunnel ingress rule. Durations are seconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_keep_alive: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_connections: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keep_alive_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_tls_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin_server_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_pool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_host_header: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_happy_eyeballs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disable_chunked_encoding: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_type: Option<String>,
}

impl OriginRequest {
    /// Canonical form used for comparison: false flags, zero values and
    /// empty strings mean "unset", and an all-unset block is no block.
    pub fn normalized(origin: Option<&OriginRequest>) -> Option<OriginRequest> {
        let origin = origin?;
        let non_zero = |v: Option<u64>| v.filter(|v| *v != 0);
        let flag = |v: Option<bool>| v.filter(|v| *v);
        let text = |v: &Option<String>| v.clone().filter(|v| !v.is_empty());

        let normalized = OriginRequest {
            connect_timeout: non_zero(origin.connect_timeout),
            tls_timeout: non_zero(origin.tls_timeout),
            tcp_keep_alive: non_zero(origin.tcp_keep_alive),
            keep_alive_connections: origin.keep_alive_connections.filter(|v| *v != 0),
            keep_alive_timeout: non_zero(origin.keep_alive_timeout),
            no_tls_verify: flag(origin.no_tls_verify),
            origin_server_name: text(&origin.origin_server_name),
            ca_pool: text(&origin.ca_pool),
            http_host_header: text(&origin.http_host_header),
            no_happy_eyeballs: flag(origin.no_happy_eyeballs),
            disable_chunked_encoding: flag(origin.disable_chunked_encoding),
            proxy_type: text(&origin.proxy_type),
        };

        if normalized == OriginRequest::default() {
            None
        } else {
            Some(normalized)
        }
    }
}

/// A tunnel ingress rule declared by a container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelService {
    #[serde(default)]
    pub service_name: String,
    pub hostname: String,
    /// Backend URL, e.g. `http://web:8080`
    pub service: String,
    #[serde(default = "default_tunnel")]
    pub tunnel: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    #[serde(default = "default_true")]
    pub cleanup: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_request: Option<OriginRequest>,
}

impl TunnelService {
    pub fn new(service_name: &str, hostname: &str, service: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            hostname: hostname.to_string(),
            service: service.to_string(),
            tunnel: default_tunnel(),
            path: String::new(),
            credential: None,
            cleanup: true,
            access: None,
            origin_request: None,
        }
    }
}

// ============================================================
// Access policy templates
// ============================================================

/// Access decision as written in container declarations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    #[default]
    Allow,
    Block,
    Bypass,
    ServiceAuth,
}

impl Decision {
    /// Decision value understood by the Access API
    pub fn api_value(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Block => "deny",
            Decision::Bypass => "bypass",
            Decision::ServiceAuth => "non_identity",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Decision::Allow => write!(f, "allow"),
            Decision::Block => write!(f, "block"),
            Decision::Bypass => write!(f, "bypass"),
            Decision::ServiceAuth => write!(f, "service_auth"),
        }
    }
}

/// Rule selector, named after the Access dashboard selectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Selector {
    Emails,
    EmailsEndingIn,
    IpRanges,
    Country,
    Everyone,
    ServiceToken,
    AccessGroups,
    Certificate,
    LoginMethods,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub selector: Selector,
    #[serde(default)]
    pub values: Vec<String>,
}

/// One policy of an Access application
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// OR
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<AccessRule>,
    /// AND
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub require: Vec<AccessRule>,
    /// NOT
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<AccessRule>,
}

fn default_session_duration() -> String {
    "24h".to_string()
}

fn default_policies() -> Vec<AccessPolicy> {
    vec![AccessPolicy::default()]
}

/// Named, hostname-agnostic access policy template
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPolicyDef {
    #[serde(default)]
    pub name: String,
    /// Application name, `labelgate-<name>` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default = "default_session_duration")]
    pub session_duration: String,
    #[serde(default = "default_policies")]
    pub policies: Vec<AccessPolicy>,
}

impl AccessPolicyDef {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            app_name: None,
            session_duration: default_session_duration(),
            policies: default_policies(),
        }
    }

    pub fn application_name(&self) -> String {
        self.app_name
            .clone()
            .unwrap_or_else(|| format!("labelgate-{}", self.name))
    }
}

/// A policy template joined to a hostname that references it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccessBinding {
    pub hostname: String,
    pub policy: AccessPolicyDef,
    pub container_id: String,
    pub container_name: String,
    pub service_name: String,
    pub agent_id: Option<String>,
    pub cleanup: bool,
}

// ============================================================
// Sources
// ============================================================

/// One container's declarations, from the local host or a remote agent
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedContainer {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Network name to IP address
    #[serde(default)]
    pub networks: BTreeMap<String, String>,
    #[serde(default)]
    pub dns: Vec<DnsService>,
    #[serde(default)]
    pub tunnels: Vec<TunnelService>,
    #[serde(default)]
    pub access: BTreeMap<String, AccessPolicyDef>,
    /// Set for containers reported by a remote agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

impl ParsedContainer {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Whether the container declares anything this system manages
    pub fn has_declarations(&self) -> bool {
        !self.dns.is_empty() || !self.tunnels.is_empty() || !self.access.is_empty()
    }

    /// First network address, ordered by network name
    pub fn first_address(&self) -> Option<&str> {
        self.networks
            .values()
            .map(String::as_str)
            .find(|ip| !ip.is_empty())
    }
}

/// Container lifecycle event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Start,
    Update,
    Stop,
    Die,
    Destroy,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventKind::Start => write!(f, "start"),
            EventKind::Update => write!(f, "update"),
            EventKind::Stop => write!(f, "stop"),
            EventKind::Die => write!(f, "die"),
            EventKind::Destroy => write!(f, "destroy"),
        }
    }
}

/// Lifecycle event pushed by a container source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerEvent {
    pub kind: EventKind,
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    pub timestamp: DateTime<Utc>,
}

impl ContainerEvent {
    pub fn new(kind: EventKind, container_id: &str, container_name: &str) -> Self {
        Self {
            kind,
            container_id: container_id.to_string(),
            container_name: container_name.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// Full container snapshot pushed by a remote agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentReport {
    pub agent_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub containers: Vec<ParsedContainer>,
}
