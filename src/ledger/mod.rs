//! Resource Ledger
//!
//! Durable record of every remote resource labelgate believes it manages.
//! Rows are unique per `(kind, hostname, subkind)`; the subkind is the DNS
//! record type for records and the path for ingress rules.

mod memory;

pub use memory::MemoryLedger;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::{OriginRequest, RecordType};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("resource not found: {0}")]
    NotFound(String),

    #[error("ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ledger serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Remote resource kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Dns,
    TunnelIngress,
    AccessApp,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 3] = [
        ResourceKind::Dns,
        ResourceKind::TunnelIngress,
        ResourceKind::AccessApp,
    ];
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Dns => write!(f, "dns"),
            ResourceKind::TunnelIngress => write!(f, "tunnel_ingress"),
            ResourceKind::AccessApp => write!(f, "access_app"),
        }
    }
}

/// Lifecycle status of a ledger row.
///
/// Rows are hard-deleted once their cleanup timer fires, so there is no
/// `deleted` or `pending_cleanup` state. Snapshots containing those values
/// fail to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceStatus {
    Active,
    Orphaned,
    Error,
}

impl ResourceStatus {
    /// Statuses an operator reconciles against
    pub const LIVE: [ResourceStatus; 3] = [
        ResourceStatus::Active,
        ResourceStatus::Error,
        ResourceStatus::Orphaned,
    ];
}

impl std::fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceStatus::Active => write!(f, "active"),
            ResourceStatus::Orphaned => write!(f, "orphaned"),
            ResourceStatus::Error => write!(f, "error"),
        }
    }
}

/// Kind-specific state of a managed resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceDetails {
    Dns {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        zone_id: Option<String>,
        record_type: RecordType,
        content: String,
        proxied: bool,
        ttl: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        priority: Option<u16>,
        /// Explicit credential the record was declared with
        #[serde(default, skip_serializing_if = "Option::is_none")]
        credential: Option<String>,
    },
    TunnelIngress {
        tunnel_id: String,
        service: String,
        #[serde(default)]
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        origin_request: Option<OriginRequest>,
    },
    AccessApp {
        #[serde(default)]
        account_id: String,
        policy_name: String,
        /// Serialized policy template the application was last pushed with
        policy_fingerprint: String,
    },
}

impl ResourceDetails {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceDetails::Dns { .. } => ResourceKind::Dns,
            ResourceDetails::TunnelIngress { .. } => ResourceKind::TunnelIngress,
            ResourceDetails::AccessApp { .. } => ResourceKind::AccessApp,
        }
    }

    pub fn subkind(&self) -> String {
        match self {
            ResourceDetails::Dns { record_type, .. } => record_type.to_string(),
            ResourceDetails::TunnelIngress { path, .. } => path.clone(),
            ResourceDetails::AccessApp { .. } => String::new(),
        }
    }
}

/// Container, service and agent that declared a resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    #[serde(default)]
    pub container_id: String,
    #[serde(default)]
    pub container_name: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// Unique key of a ledger row
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub hostname: String,
    pub subkind: String,
}

/// A ledger row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedResource {
    pub id: String,
    /// Cloudflare-side identifier (DNS record ID, Access app ID)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub hostname: String,
    #[serde(flatten)]
    pub details: ResourceDetails,
    #[serde(flatten)]
    pub owner: Owner,
    pub status: ResourceStatus,
    pub cleanup_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ManagedResource {
    /// New row; the ledger assigns the ID and timestamps on upsert
    pub fn new(
        hostname: &str,
        details: ResourceDetails,
        owner: Owner,
        cleanup_enabled: bool,
    ) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            id: String::new(),
            remote_id: None,
            hostname: hostname.to_string(),
            details,
            owner,
            status: ResourceStatus::Active,
            cleanup_enabled,
            last_error: None,
            created_at: epoch,
            updated_at: epoch,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.details.kind()
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            kind: self.kind(),
            hostname: self.hostname.clone(),
            subkind: self.details.subkind(),
        }
    }

    pub fn with_status(mut self, status: ResourceStatus, last_error: Option<String>) -> Self {
        self.status = status;
        self.last_error = last_error;
        self
    }
}

/// Per-status row counts for one kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub active: usize,
    pub orphaned: usize,
    pub error: usize,
}

/// Persistence contract used by the operators and the orphan scheduler
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Rows of a kind whose status is in `statuses`, ordered by key
    async fn list_by_kind_and_status(
        &self,
        kind: ResourceKind,
        statuses: &[ResourceStatus],
    ) -> Result<Vec<ManagedResource>, LedgerError>;

    /// Insert or replace the row with the same unique key. An existing row
    /// keeps its ID and creation time.
    async fn upsert_by_unique_key(
        &self,
        resource: ManagedResource,
    ) -> Result<ManagedResource, LedgerError>;

    async fn set_status(&self, id: &str, status: ResourceStatus) -> Result<(), LedgerError>;

    async fn set_error(
        &self,
        id: &str,
        status: ResourceStatus,
        message: &str,
    ) -> Result<(), LedgerError>;

    async fn delete(&self, id: &str) -> Result<(), LedgerError>;

    /// Orphaned, cleanup-enabled rows last updated at or before `cutoff`
    async fn list_orphaned_past_remove_delay(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ManagedResource>, LedgerError>;

    /// Orphaned rows with cleanup disabled, last updated at or before `cutoff`
    async fn list_orphaned_past_orphan_ttl(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<ManagedResource>, LedgerError>;

    async fn count_by_status(&self, kind: ResourceKind) -> Result<StatusCounts, LedgerError> {
        let rows = self
            .list_by_kind_and_status(kind, &ResourceStatus::LIVE)
            .await?;
        let mut counts = StatusCounts {
            total: rows.len(),
            ..Default::default()
        };
        for row in &rows {
            match row.status {
                ResourceStatus::Active => counts.active += 1,
                ResourceStatus::Orphaned => counts.orphaned += 1,
                ResourceStatus::Error => counts.error += 1,
            }
        }
        Ok(counts)
    }
}
