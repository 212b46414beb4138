//! Orphan Cleanup
//!
//! Orphaned rows follow exactly one of two timers, picked by their
//! cleanup flag:
//!
//! - cleanup enabled: after the remove delay, delete the remote resource
//!   and then the row
//! - cleanup disabled: the remote resource is kept; after the orphan TTL
//!   (when one is configured) only the row is dropped

use anyhow::{bail, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::Operators;
use crate::clock::Clock;
use crate::ledger::{Ledger, ManagedResource, ResourceKind};
use crate::operator::{is_cancelled, Operator};

fn to_chrono(duration: std::time::Duration) -> Duration {
    Duration::from_std(duration).unwrap_or(Duration::MAX)
}

pub struct OrphanScheduler {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    remove_delay: Duration,
    orphan_ttl: Option<Duration>,
}

impl OrphanScheduler {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        remove_delay: std::time::Duration,
        orphan_ttl: Option<std::time::Duration>,
    ) -> Self {
        Self {
            ledger,
            clock,
            remove_delay: to_chrono(remove_delay),
            orphan_ttl: orphan_ttl.map(to_chrono),
        }
    }

    async fn delete_remote(operators: &Operators, resource: &ManagedResource) -> Result<bool> {
        match resource.kind() {
            ResourceKind::Dns => match &operators.dns {
                Some(op) => op.delete(resource).await.map(|_| true),
                None => Ok(false),
            },
            ResourceKind::TunnelIngress => match &operators.tunnel {
                Some(op) => op.delete(resource).await.map(|_| true),
                None => Ok(false),
            },
            ResourceKind::AccessApp => match &operators.access {
                Some(op) => op.delete(resource).await.map(|_| true),
                None => Ok(false),
            },
        }
    }

    /// Apply both timers once
    pub async fn process(&self, operators: &Operators) -> Result<()> {
        let now = self.clock.now();
        let mut failures = Vec::new();

        let due = match now.checked_sub_signed(self.remove_delay) {
            Some(cutoff) => self.ledger.list_orphaned_past_remove_delay(cutoff).await?,
            None => Vec::new(),
        };
        for resource in &due {
            match Self::delete_remote(operators, resource).await {
                Ok(true) => info!(
                    kind = %resource.kind(),
                    hostname = %resource.hostname,
                    container = %resource.owner.container_name,
                    "Orphaned resource removed"
                ),
                Ok(false) => debug!(
                    kind = %resource.kind(),
                    hostname = %resource.hostname,
                    "Operator disabled, keeping orphaned resource"
                ),
                Err(e) if is_cancelled(&e) => return Err(e),
                Err(e) => {
                    error!(
                        kind = %resource.kind(),
                        hostname = %resource.hostname,
                        error = %format!("{:#}", e),
                        "Failed to remove orphaned resource"
                    );
                    failures.push(format!("{}: {:#}", resource.hostname, e));
                }
            }
        }

        if let Some(cutoff) = self.orphan_ttl.and_then(|ttl| now.checked_sub_signed(ttl)) {
            let expired = self.ledger.list_orphaned_past_orphan_ttl(cutoff).await?;
            for resource in &expired {
                match self.ledger.delete(&resource.id).await {
                    Ok(()) => info!(
                        kind = %resource.kind(),
                        hostname = %resource.hostname,
                        "Orphan TTL expired, forgetting resource (remote resource kept)"
                    ),
                    Err(e) => failures.push(format!("{}: {}", resource.hostname, e)),
                }
            }
        }

        if !failures.is_empty() {
            bail!(
                "cleanup: {} resource(s) failed: {}",
                failures.len(),
                failures.join("; ")
            );
        }
        Ok(())
    }
}
