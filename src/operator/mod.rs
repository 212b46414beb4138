//! Resource Kind Operators
//!
//! One operator per remote resource kind. Each diffs its desired entries
//! against the ledger, calls the Cloudflare API for what changed, records
//! the outcome, and marks rows nobody declares anymore as orphaned.

mod access;
mod dns;
mod public_ip;
mod tunnel;

pub use access::AccessOperator;
pub use dns::DnsOperator;
pub use public_ip::{HttpIpResolver, PublicIpResolver};
pub use tunnel::TunnelOperator;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tracing::{error, info};

use crate::cloudflare::ApiError;
use crate::ledger::{Ledger, ManagedResource, Owner, ResourceKind, ResourceStatus};
use crate::types::ParsedContainer;

/// Common surface of the kind operators
#[async_trait]
pub trait Operator: Send + Sync {
    /// What one pass consumes: containers for DNS and tunnels, resolved
    /// bindings for Access
    type Desired: Send + Sync;

    fn kind(&self) -> ResourceKind;

    /// Converge remote state and the ledger on `desired`
    async fn reconcile(&self, desired: &[Self::Desired]) -> Result<()>;

    /// Remove the remote resource, then the ledger row. A resource that is
    /// already gone remotely counts as removed.
    async fn delete(&self, resource: &ManagedResource) -> Result<()>;
}

pub(crate) fn owner_of(container: &ParsedContainer, service_name: &str) -> Owner {
    Owner {
        container_id: container.id.clone(),
        container_name: container.name.clone(),
        service_name: service_name.to_string(),
        agent_id: container.agent_id.clone(),
    }
}

/// A cancelled call ends the pass instead of being recorded as a resource error
pub(crate) fn is_cancelled(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ApiError>()
        .is_some_and(ApiError::is_cancelled)
}

/// Per-resource failures of one operator pass
#[derive(Debug, Default)]
pub(crate) struct Failures(Vec<String>);

impl Failures {
    pub fn push(&mut self, hostname: &str, err: impl std::fmt::Display) {
        self.0.push(format!("{}: {}", hostname, err));
    }

    pub fn into_result(self, kind: ResourceKind) -> Result<()> {
        if self.0.is_empty() {
            return Ok(());
        }
        bail!("{}: {} resource(s) failed: {}", kind, self.0.len(), self.0.join("; "))
    }
}

/// Move rows no longer declared to `orphaned`. Rows already orphaned keep
/// their timestamp so the cleanup timers keep running.
pub(crate) async fn mark_orphaned<'a, I>(ledger: &dyn Ledger, leftovers: I) -> Result<()>
where
    I: IntoIterator<Item = &'a ManagedResource>,
{
    for resource in leftovers {
        if resource.status == ResourceStatus::Orphaned {
            continue;
        }
        match ledger.set_status(&resource.id, ResourceStatus::Orphaned).await {
            Ok(()) => info!(
                kind = %resource.kind(),
                hostname = %resource.hostname,
                container = %resource.owner.container_name,
                cleanup_enabled = resource.cleanup_enabled,
                "Resource orphaned, no longer declared by any container"
            ),
            Err(e) => error!(
                hostname = %resource.hostname,
                error = %e,
                "Failed to mark resource as orphaned"
            ),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failures_join_into_one_error() {
        assert!(Failures::default().into_result(ResourceKind::Dns).is_ok());

        let mut failures = Failures::default();
        failures.push("a.example.com", "token expired");
        failures.push("b.example.com", "zone missing");
        let err = failures.into_result(ResourceKind::Dns).unwrap_err().to_string();
        assert!(err.starts_with("dns: 2 resource(s) failed"));
        assert!(err.contains("a.example.com: token expired"));
    }

    #[test]
    fn test_cancelled_error_survives_context() {
        use anyhow::Context;

        let err = Err::<(), _>(ApiError::Cancelled)
            .context("Failed to create DNS record")
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(!is_cancelled(&anyhow::anyhow!("token expired")));
    }
}
