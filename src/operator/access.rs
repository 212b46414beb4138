//! Access Application Operator
//!
//! Reconciles one Access application per bound hostname. Unlike DNS
//! records, an application that already exists for a hostname but is not
//! in the ledger is never taken over: the binding fails with a conflict
//! until someone removes or imports the application by hand.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{is_cancelled, mark_orphaned, Failures, Operator};
use crate::cloudflare::{ApiError, ApiRouter};
use crate::ledger::{Ledger, ManagedResource, Owner, ResourceDetails, ResourceKind, ResourceStatus};
use crate::types::{AccessPolicyDef, ResolvedAccessBinding};

pub struct AccessOperator {
    router: Arc<dyn ApiRouter>,
    ledger: Arc<dyn Ledger>,
}

/// Serialized template, compared across passes to detect policy changes
fn policy_fingerprint(policy: &AccessPolicyDef) -> Result<String> {
    serde_json::to_string(policy).context("Failed to serialize access policy")
}

fn owner(binding: &ResolvedAccessBinding) -> Owner {
    Owner {
        container_id: binding.container_id.clone(),
        container_name: binding.container_name.clone(),
        service_name: binding.service_name.clone(),
        agent_id: binding.agent_id.clone(),
    }
}

impl AccessOperator {
    pub fn new(router: Arc<dyn ApiRouter>, ledger: Arc<dyn Ledger>) -> Self {
        Self { router, ledger }
    }

    /// Verify the configured token may manage Access applications
    pub async fn check_permissions(&self) -> Result<()> {
        self.router
            .access()?
            .check_permissions()
            .await
            .context("Access permission check failed")
    }

    fn row(
        binding: &ResolvedAccessBinding,
        account_id: &str,
        fingerprint: String,
    ) -> ManagedResource {
        ManagedResource::new(
            &binding.hostname,
            ResourceDetails::AccessApp {
                account_id: account_id.to_string(),
                policy_name: binding.policy.name.clone(),
                policy_fingerprint: fingerprint,
            },
            owner(binding),
            binding.cleanup,
        )
    }

    /// Create the application for a hostname no ledger row points at yet
    async fn create(&self, binding: &ResolvedAccessBinding) -> Result<ManagedResource> {
        let api = self.router.access()?;

        match api.find_existing_application(&binding.hostname).await {
            Ok(Some(app)) => {
                return Err(ApiError::Conflict(format!(
                    "access application {:?} (ID: {}) already exists for hostname {}, \
                     not managed by labelgate; refusing to overwrite",
                    app.name, app.id, binding.hostname
                ))
                .into())
            }
            Ok(None) => {}
            Err(e) if e.is_cancelled() => return Err(e.into()),
            Err(e) => warn!(
                hostname = %binding.hostname,
                error = %e,
                "Failed to check for an existing Access application"
            ),
        }

        let app_id = api
            .ensure_application_for_hostname(&binding.hostname, &binding.policy, None)
            .await?;
        info!(
            hostname = %binding.hostname,
            policy = %binding.policy.name,
            app_id = %app_id,
            "Access application created"
        );

        let mut row = Self::row(binding, api.account_id(), policy_fingerprint(&binding.policy)?);
        row.remote_id = Some(app_id);
        Ok(self.ledger.upsert_by_unique_key(row).await?)
    }

    /// Push the template to the managed application, replacing its policies
    async fn update(
        &self,
        existing: &ManagedResource,
        app_id: &str,
        binding: &ResolvedAccessBinding,
    ) -> Result<ManagedResource> {
        let api = self.router.access()?;
        let new_id = api
            .ensure_application_for_hostname(&binding.hostname, &binding.policy, Some(app_id))
            .await?;
        if new_id != app_id {
            warn!(
                hostname = %binding.hostname,
                old = %app_id,
                new = %new_id,
                "Access application was recreated"
            );
        }
        info!(
            hostname = %binding.hostname,
            policy = %binding.policy.name,
            "Access application updated"
        );

        let mut row = Self::row(binding, api.account_id(), policy_fingerprint(&binding.policy)?);
        row.id = existing.id.clone();
        row.remote_id = Some(new_id);
        Ok(self.ledger.upsert_by_unique_key(row).await?)
    }

    async fn sync_managed(
        &self,
        existing: ManagedResource,
        app_id: String,
        binding: &ResolvedAccessBinding,
    ) -> Result<()> {
        let fingerprint = policy_fingerprint(&binding.policy)?;
        let drifted = match &existing.details {
            ResourceDetails::AccessApp {
                policy_fingerprint, ..
            } => *policy_fingerprint != fingerprint,
            _ => true,
        };

        if existing.status != ResourceStatus::Active || drifted {
            if let Err(e) = self.update(&existing, &app_id, binding).await {
                if !is_cancelled(&e) {
                    let message = format!("{:#}", e);
                    error!(
                        hostname = %binding.hostname,
                        error = %message,
                        "Failed to update Access application"
                    );
                    self.ledger
                        .set_error(&existing.id, ResourceStatus::Error, &message)
                        .await?;
                }
                return Err(e);
            }
            return Ok(());
        }

        let owner = owner(binding);
        if existing.owner != owner || existing.cleanup_enabled != binding.cleanup {
            let mut row = existing;
            row.owner = owner;
            row.cleanup_enabled = binding.cleanup;
            self.ledger.upsert_by_unique_key(row).await?;
        }
        Ok(())
    }

    async fn create_or_record_error(&self, binding: &ResolvedAccessBinding) -> Result<()> {
        match self.create(binding).await {
            Ok(_) => Ok(()),
            Err(e) if is_cancelled(&e) => Err(e),
            Err(e) => {
                let message = format!("{:#}", e);
                error!(
                    hostname = %binding.hostname,
                    error = %message,
                    "Failed to create Access application"
                );
                let row = Self::row(binding, "", String::new())
                    .with_status(ResourceStatus::Error, Some(message));
                self.ledger.upsert_by_unique_key(row).await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Operator for AccessOperator {
    type Desired = ResolvedAccessBinding;

    fn kind(&self) -> ResourceKind {
        ResourceKind::AccessApp
    }

    async fn reconcile(&self, bindings: &[ResolvedAccessBinding]) -> Result<()> {
        let mut desired: BTreeMap<&str, &ResolvedAccessBinding> = BTreeMap::new();
        for binding in bindings {
            match desired.entry(binding.hostname.as_str()) {
                Entry::Occupied(kept) => warn!(
                    hostname = %binding.hostname,
                    kept = %kept.get().policy.name,
                    dropped = %binding.policy.name,
                    "Hostname bound to several access policies, first binding wins"
                ),
                Entry::Vacant(slot) => {
                    slot.insert(binding);
                }
            }
        }

        let mut current: BTreeMap<String, ManagedResource> = self
            .ledger
            .list_by_kind_and_status(ResourceKind::AccessApp, &ResourceStatus::LIVE)
            .await
            .context("Failed to list Access resources")?
            .into_iter()
            .map(|row| (row.hostname.clone(), row))
            .collect();

        let mut failures = Failures::default();
        for (hostname, binding) in desired {
            let existing = current.remove(hostname);
            let outcome = match existing {
                Some(row) => match row.remote_id.clone().filter(|id| !id.is_empty()) {
                    Some(app_id) => self.sync_managed(row, app_id, binding).await,
                    None => self.create_or_record_error(binding).await,
                },
                None => self.create_or_record_error(binding).await,
            };
            if let Err(e) = outcome {
                if is_cancelled(&e) {
                    return Err(e);
                }
                failures.push(hostname, format!("{:#}", e));
            }
        }

        mark_orphaned(self.ledger.as_ref(), current.values()).await?;
        failures.into_result(ResourceKind::AccessApp)
    }

    async fn delete(&self, resource: &ManagedResource) -> Result<()> {
        match &resource.remote_id {
            Some(app_id) if !app_id.is_empty() => {
                match self.router.access()?.delete_application(app_id).await {
                    Ok(()) => info!(
                        hostname = %resource.hostname,
                        app_id = %app_id,
                        "Access application deleted"
                    ),
                    Err(e) if e.is_not_found() => {
                        debug!(hostname = %resource.hostname, "Access application already gone")
                    }
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("Failed to delete Access application for {}", resource.hostname)
                        })
                    }
                }
            }
            _ => warn!(
                hostname = %resource.hostname,
                "No Access application ID recorded, dropping ledger row only"
            ),
        }

        self.ledger.delete(&resource.id).await?;
        Ok(())
    }
}
