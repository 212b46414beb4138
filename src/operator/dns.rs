//! DNS Operator
//!
//! Keeps one Cloudflare DNS record per declared `(hostname, type)`.
//! Records that already exist remotely are adopted rather than failing,
//! which also recovers from a lost ledger.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{is_cancelled, mark_orphaned, owner_of, Failures, Operator, PublicIpResolver};
use crate::cloudflare::{ApiError, ApiRouter, DnsApi, DnsRecord};
use crate::ledger::{Ledger, ManagedResource, ResourceDetails, ResourceKind, ResourceStatus};
use crate::types::{DnsService, DnsTarget, ParsedContainer, RecordType};

type RecordKey = (String, RecordType);

struct Wanted<'a> {
    container: &'a ParsedContainer,
    service: &'a DnsService,
}

pub struct DnsOperator {
    router: Arc<dyn ApiRouter>,
    ledger: Arc<dyn Ledger>,
    public_ip: Arc<dyn PublicIpResolver>,
}

impl DnsOperator {
    pub fn new(
        router: Arc<dyn ApiRouter>,
        ledger: Arc<dyn Ledger>,
        public_ip: Arc<dyn PublicIpResolver>,
    ) -> Self {
        Self {
            router,
            ledger,
            public_ip,
        }
    }

    fn desired(containers: &[ParsedContainer]) -> BTreeMap<RecordKey, Wanted<'_>> {
        let mut desired = BTreeMap::new();
        for container in containers {
            for service in &container.dns {
                match desired.entry((service.hostname.clone(), service.record_type)) {
                    Entry::Occupied(kept) => {
                        let kept: &Wanted = kept.get();
                        warn!(
                            hostname = %service.hostname,
                            record_type = %service.record_type,
                            kept = %kept.container.name,
                            dropped = %container.name,
                            "Duplicate DNS record, first declaration wins"
                        );
                    }
                    Entry::Vacant(slot) => {
                        slot.insert(Wanted { container, service });
                    }
                }
            }
        }
        desired
    }

    async fn resolve_target(
        &self,
        container: &ParsedContainer,
        service: &DnsService,
    ) -> Result<String> {
        match DnsTarget::parse(&service.target) {
            DnsTarget::Auto => Ok(self.public_ip.public_ip().await?.to_string()),
            DnsTarget::Container => container
                .first_address()
                .map(str::to_string)
                .with_context(|| format!("container {} has no network address", container.name)),
            DnsTarget::Literal(content) => Ok(content.to_string()),
        }
    }

    fn record_for(
        container: &ParsedContainer,
        service: &DnsService,
        zone_id: &str,
        content: &str,
    ) -> DnsRecord {
        let comment = service.comment.clone().unwrap_or_else(|| {
            format!(
                "Managed by labelgate [container:{} service:{}]",
                container.name, service.service_name
            )
        });

        DnsRecord {
            id: String::new(),
            zone_id: zone_id.to_string(),
            name: service.hostname.clone(),
            record_type: service.record_type,
            content: content.to_string(),
            proxied: service.proxied,
            ttl: service.ttl,
            priority: service.priority,
            comment: Some(comment),
        }
    }

    fn row(
        container: &ParsedContainer,
        service: &DnsService,
        zone_id: Option<String>,
        content: &str,
    ) -> ManagedResource {
        ManagedResource::new(
            &service.hostname,
            ResourceDetails::Dns {
                zone_id,
                record_type: service.record_type,
                content: content.to_string(),
                proxied: service.proxied,
                ttl: service.ttl,
                priority: service.priority,
                credential: service.credential.clone(),
            },
            owner_of(container, &service.service_name),
            service.cleanup,
        )
    }

    async fn save_active(
        &self,
        container: &ParsedContainer,
        service: &DnsService,
        record: &DnsRecord,
        content: &str,
    ) -> Result<ManagedResource> {
        let mut row = Self::row(container, service, Some(record.zone_id.clone()), content);
        row.remote_id = Some(record.id.clone());
        Ok(self.ledger.upsert_by_unique_key(row).await?)
    }

    /// Take over a record that already exists remotely, bringing it to the
    /// declared content if it differs
    async fn adopt(&self, dns: &dyn DnsApi, wanted: &DnsRecord) -> Result<DnsRecord, ApiError> {
        let existing = dns
            .get_record_by_name(&wanted.name, wanted.record_type)
            .await?
            .ok_or_else(|| {
                ApiError::Conflict(format!(
                    "{} record for {} conflicts with an existing record of another type",
                    wanted.record_type, wanted.name
                ))
            })?;

        info!(
            hostname = %wanted.name,
            remote_id = %existing.id,
            "DNS record already exists, adopting it"
        );

        if existing.content == wanted.content
            && existing.proxied == wanted.proxied
            && existing.priority == wanted.priority
        {
            return Ok(existing);
        }

        let mut update = wanted.clone();
        update.id = existing.id.clone();
        if !existing.zone_id.is_empty() {
            update.zone_id = existing.zone_id.clone();
        }
        dns.update_record(&update).await
    }

    /// Create the declared record and record it as active
    pub async fn create_record(
        &self,
        container: &ParsedContainer,
        service: &DnsService,
    ) -> Result<ManagedResource> {
        let dns = self
            .router
            .dns(&service.hostname, service.credential.as_deref())?;
        let content = self.resolve_target(container, service).await?;
        let zone_id = dns.zone_id(&service.hostname).await?;
        let record = Self::record_for(container, service, &zone_id, &content);

        let created = match dns.create_record(&record).await {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => self.adopt(dns.as_ref(), &record).await?,
            Err(e) => return Err(e.into()),
        };

        info!(
            hostname = %service.hostname,
            record_type = %service.record_type,
            content = %content,
            remote_id = %created.id,
            "DNS record created"
        );
        let mut created = created;
        if created.zone_id.is_empty() {
            created.zone_id = zone_id;
        }
        self.save_active(container, service, &created, &content).await
    }

    /// Bring an existing record to the declared state. A missing record ID
    /// is recovered by name; a record gone remotely is created again.
    pub async fn update_record(
        &self,
        existing: &ManagedResource,
        container: &ParsedContainer,
        service: &DnsService,
    ) -> Result<ManagedResource> {
        let dns = self
            .router
            .dns(&service.hostname, service.credential.as_deref())?;

        let known_zone = match &existing.details {
            ResourceDetails::Dns { zone_id, .. } => zone_id.clone().filter(|z| !z.is_empty()),
            _ => None,
        };
        let known_id = existing.remote_id.clone().filter(|id| !id.is_empty());

        let (remote_id, zone_id) = match (known_id, known_zone) {
            (Some(id), Some(zone)) => (id, zone),
            _ => match dns
                .get_record_by_name(&service.hostname, service.record_type)
                .await?
            {
                Some(found) => {
                    info!(
                        hostname = %service.hostname,
                        remote_id = %found.id,
                        "Recovered missing DNS record ID"
                    );
                    let zone = if found.zone_id.is_empty() {
                        dns.zone_id(&service.hostname).await?
                    } else {
                        found.zone_id
                    };
                    (found.id, zone)
                }
                None => {
                    debug!(hostname = %service.hostname, "No remote record to update, creating");
                    return self.create_record(container, service).await;
                }
            },
        };

        let content = self.resolve_target(container, service).await?;
        let mut record = Self::record_for(container, service, &zone_id, &content);
        record.id = remote_id;

        match dns.update_record(&record).await {
            Ok(mut updated) => {
                if updated.zone_id.is_empty() {
                    updated.zone_id = zone_id;
                }
                info!(hostname = %service.hostname, content = %content, "DNS record updated");
                self.save_active(container, service, &updated, &content).await
            }
            Err(e) if e.is_not_found() => {
                warn!(
                    hostname = %service.hostname,
                    "DNS record deleted outside labelgate, recreating"
                );
                self.create_record(container, service).await
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether the recorded state differs from the declaration in a way
    /// only a remote update can fix
    fn needs_update(
        existing: &ManagedResource,
        container: &ParsedContainer,
        service: &DnsService,
    ) -> bool {
        let ResourceDetails::Dns {
            content,
            proxied,
            ttl,
            priority,
            ..
        } = &existing.details
        else {
            return true;
        };

        let target_changed = match DnsTarget::parse(&service.target) {
            DnsTarget::Auto => false,
            DnsTarget::Container => container.first_address() != Some(content.as_str()),
            DnsTarget::Literal(target) => target != content.as_str(),
        };

        target_changed
            || *proxied != service.proxied
            || *ttl != service.ttl
            || *priority != service.priority
    }

    async fn sync_existing(&self, existing: ManagedResource, wanted: &Wanted<'_>) -> Result<()> {
        let Wanted { container, service } = *wanted;

        if existing.status != ResourceStatus::Active
            || Self::needs_update(&existing, container, service)
        {
            if let Err(e) = self.update_record(&existing, container, service).await {
                if !is_cancelled(&e) {
                    error!(
                        hostname = %service.hostname,
                        error = %format!("{:#}", e),
                        "Failed to update DNS record"
                    );
                    self.ledger
                        .set_error(&existing.id, ResourceStatus::Error, &format!("{:#}", e))
                        .await?;
                }
                return Err(e);
            }
            return Ok(());
        }

        let owner = owner_of(container, &service.service_name);
        let credential_changed = matches!(
            &existing.details,
            ResourceDetails::Dns { credential, .. } if *credential != service.credential
        );
        if existing.owner != owner
            || existing.cleanup_enabled != service.cleanup
            || credential_changed
        {
            let mut row = existing;
            row.owner = owner;
            row.cleanup_enabled = service.cleanup;
            if let ResourceDetails::Dns { credential, .. } = &mut row.details {
                *credential = service.credential.clone();
            }
            self.ledger.upsert_by_unique_key(row).await?;
        }
        Ok(())
    }

    async fn create_or_record_error(&self, wanted: &Wanted<'_>) -> Result<()> {
        let Wanted { container, service } = *wanted;
        match self.create_record(container, service).await {
            Ok(_) => Ok(()),
            Err(e) if is_cancelled(&e) => Err(e),
            Err(e) => {
                let message = format!("{:#}", e);
                error!(
                    hostname = %service.hostname,
                    error = %message,
                    "Failed to create DNS record"
                );
                let row = Self::row(container, service, None, &service.target)
                    .with_status(ResourceStatus::Error, Some(message));
                self.ledger.upsert_by_unique_key(row).await?;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Operator for DnsOperator {
    type Desired = ParsedContainer;

    fn kind(&self) -> ResourceKind {
        ResourceKind::Dns
    }

    async fn reconcile(&self, containers: &[ParsedContainer]) -> Result<()> {
        let desired = Self::desired(containers);

        let mut current: BTreeMap<RecordKey, ManagedResource> = self
            .ledger
            .list_by_kind_and_status(ResourceKind::Dns, &ResourceStatus::LIVE)
            .await
            .context("Failed to list DNS resources")?
            .into_iter()
            .filter_map(|row| match &row.details {
                ResourceDetails::Dns { record_type, .. } => {
                    Some(((row.hostname.clone(), *record_type), row))
                }
                _ => None,
            })
            .collect();

        let mut failures = Failures::default();
        for (key, wanted) in &desired {
            let outcome = match current.remove(key) {
                None => self.create_or_record_error(wanted).await,
                Some(existing) => self.sync_existing(existing, wanted).await,
            };
            if let Err(e) = outcome {
                if is_cancelled(&e) {
                    return Err(e);
                }
                failures.push(&key.0, format!("{:#}", e));
            }
        }

        mark_orphaned(self.ledger.as_ref(), current.values()).await?;
        failures.into_result(ResourceKind::Dns)
    }

    async fn delete(&self, resource: &ManagedResource) -> Result<()> {
        let ResourceDetails::Dns {
            zone_id, credential, ..
        } = &resource.details
        else {
            anyhow::bail!("{} is not a DNS resource", resource.id);
        };

        match (&resource.remote_id, zone_id) {
            (Some(record_id), Some(zone_id)) => {
                let dns = self.router.dns(&resource.hostname, credential.as_deref())?;
                match dns.delete_record(zone_id, record_id).await {
                    Ok(()) => info!(hostname = %resource.hostname, "DNS record deleted"),
                    Err(e) if e.is_not_found() => {
                        debug!(hostname = %resource.hostname, "DNS record already gone")
                    }
                    Err(e) => {
                        return Err(e).with_context(|| {
                            format!("Failed to delete DNS record {}", resource.hostname)
                        })
                    }
                }
            }
            _ => debug!(
                hostname = %resource.hostname,
                "No remote record ID, dropping ledger row only"
            ),
        }

        self.ledger.delete(&resource.id).await?;
        Ok(())
    }
}
