//! Tunnel Ingress Operator
//!
//! The tunnel configuration API only replaces a tunnel's whole rule list,
//! so desired routes are grouped per tunnel, compared against the remote
//! list as a set, and pushed in full when anything differs.
//!
//! A push never drops a remote rule nobody declares anymore. Orphaned
//! routes keep serving until the cleanup scheduler deletes them, and
//! routes kept with `cleanup: false` are never removed at all.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use super::{is_cancelled, mark_orphaned, owner_of, Failures, Operator};
use crate::cloudflare::{tunnel_alias_target, ApiRouter, DnsRecord, IngressRule, TunnelScope};
use crate::ledger::{Ledger, ManagedResource, ResourceDetails, ResourceKind, ResourceStatus};
use crate::types::{OriginRequest, ParsedContainer, RecordType, TunnelService};

type RouteKey = (String, String);

fn rule_key(rule: &IngressRule) -> RouteKey {
    (rule.hostname.clone(), rule.path.clone())
}

#[derive(Clone, Copy)]
struct Route<'a> {
    container: &'a ParsedContainer,
    service: &'a TunnelService,
}

impl Route<'_> {
    fn key(&self) -> RouteKey {
        (self.service.hostname.clone(), self.service.path.clone())
    }

    fn rule(&self) -> IngressRule {
        IngressRule {
            hostname: self.service.hostname.clone(),
            path: self.service.path.clone(),
            service: self.service.service.clone(),
            origin_request: OriginRequest::normalized(self.service.origin_request.as_ref()),
        }
    }

    fn row(&self, tunnel_id: &str) -> ManagedResource {
        ManagedResource::new(
            &self.service.hostname,
            ResourceDetails::TunnelIngress {
                tunnel_id: tunnel_id.to_string(),
                service: self.service.service.clone(),
                path: self.service.path.clone(),
                origin_request: OriginRequest::normalized(self.service.origin_request.as_ref()),
            },
            owner_of(self.container, &self.service.service_name),
            self.service.cleanup,
        )
    }
}

pub struct TunnelOperator {
    router: Arc<dyn ApiRouter>,
    ledger: Arc<dyn Ledger>,
}

impl TunnelOperator {
    pub fn new(router: Arc<dyn ApiRouter>, ledger: Arc<dyn Ledger>) -> Self {
        Self { router, ledger }
    }

    /// Routes grouped by tunnel name, one per `(hostname, path)`, each
    /// group in push order
    fn desired(containers: &[ParsedContainer]) -> BTreeMap<String, Vec<Route<'_>>> {
        let mut seen: BTreeMap<RouteKey, &ParsedContainer> = BTreeMap::new();
        let mut groups: BTreeMap<String, Vec<Route>> = BTreeMap::new();

        for container in containers {
            for service in &container.tunnels {
                let route = Route { container, service };
                match seen.entry(route.key()) {
                    Entry::Occupied(kept) => warn!(
                        hostname = %service.hostname,
                        path = %service.path,
                        kept = %kept.get().name,
                        dropped = %container.name,
                        "Duplicate tunnel route, first declaration wins"
                    ),
                    Entry::Vacant(slot) => {
                        slot.insert(container);
                        groups.entry(service.tunnel.clone()).or_default().push(route);
                    }
                }
            }
        }

        for routes in groups.values_mut() {
            routes.sort_by(|a, b| {
                push_order(
                    (a.service.hostname.as_str(), a.service.path.as_str()),
                    (b.service.hostname.as_str(), b.service.path.as_str()),
                )
            });
        }
        groups
    }

    /// The list to push: the declared rules plus every remote rule that
    /// is no longer declared, in push order
    fn merge_retained(remote: &[IngressRule], declared: &[IngressRule]) -> Vec<IngressRule> {
        let keys: BTreeSet<RouteKey> = declared.iter().map(rule_key).collect();
        let mut rules = declared.to_vec();
        rules.extend(
            remote
                .iter()
                .filter(|r| !r.is_catch_all() && !keys.contains(&rule_key(r)))
                .cloned(),
        );
        rules.sort_by(|a, b| {
            push_order(
                (a.hostname.as_str(), a.path.as_str()),
                (b.hostname.as_str(), b.path.as_str()),
            )
        });
        rules
    }

    /// Whether the remote rules already serve exactly the desired routes
    fn rules_match(remote: &[IngressRule], desired: &[IngressRule]) -> bool {
        let remote: BTreeMap<RouteKey, &IngressRule> = remote
            .iter()
            .filter(|r| !r.is_catch_all())
            .map(|r| (rule_key(r), r))
            .collect();

        remote.len() == desired.len()
            && desired.iter().all(|want| {
                remote.get(&rule_key(want)).is_some_and(|have| {
                    have.service == want.service
                        && OriginRequest::normalized(have.origin_request.as_ref())
                            == OriginRequest::normalized(want.origin_request.as_ref())
                })
            })
    }

    fn with_catch_all(mut rules: Vec<IngressRule>) -> Vec<IngressRule> {
        if rules.last().map_or(true, |r| !r.is_catch_all()) {
            rules.push(IngressRule::catch_all());
        }
        rules
    }

    async fn record_errors(
        &self,
        routes: &[Route<'_>],
        existing: &BTreeMap<RouteKey, ManagedResource>,
        tunnel_id: &str,
        message: &str,
    ) -> Result<()> {
        for route in routes {
            match existing.get(&route.key()) {
                Some(row) => {
                    self.ledger
                        .set_error(&row.id, ResourceStatus::Error, message)
                        .await?
                }
                None => {
                    let row = route
                        .row(tunnel_id)
                        .with_status(ResourceStatus::Error, Some(message.to_string()));
                    self.ledger.upsert_by_unique_key(row).await?;
                }
            }
        }
        Ok(())
    }

    async fn push_rules(&self, scope: &TunnelScope, declared: &[IngressRule]) -> Result<bool> {
        let remote = scope
            .api
            .get_rule_set(&scope.tunnel_id)
            .await
            .with_context(|| {
                format!("Failed to fetch ingress rules of tunnel {}", scope.tunnel_name)
            })?;

        let rules = Self::merge_retained(&remote, declared);
        if Self::rules_match(&remote, &rules) {
            debug!(
                tunnel = %scope.tunnel_name,
                rules = rules.len(),
                "Tunnel configuration unchanged"
            );
            return Ok(false);
        }

        let retained = rules.len() - declared.len();
        scope
            .api
            .replace_rule_set(&scope.tunnel_id, &Self::with_catch_all(rules))
            .await
            .with_context(|| {
                format!("Failed to update ingress rules of tunnel {}", scope.tunnel_name)
            })?;
        info!(
            tunnel = %scope.tunnel_name,
            tunnel_id = %scope.tunnel_id,
            rules = declared.len(),
            retained,
            "Tunnel configuration updated"
        );
        Ok(true)
    }

    /// Drop the rule for `hostname` and `path` from one tunnel. A rule
    /// that is already gone counts as removed.
    async fn remove_rule(&self, tunnel_id: &str, hostname: &str, path: &str) -> Result<()> {
        let scope = self.router.tunnel(tunnel_id)?;
        let rules = scope
            .api
            .get_rule_set(&scope.tunnel_id)
            .await
            .with_context(|| {
                format!("Failed to fetch ingress rules of tunnel {}", scope.tunnel_name)
            })?;

        let before = rules.len();
        let kept: Vec<IngressRule> = rules
            .into_iter()
            .filter(|r| !(r.hostname == hostname && r.path == path))
            .collect();

        if kept.len() == before {
            debug!(
                hostname = %hostname,
                tunnel = %scope.tunnel_name,
                "Ingress rule already gone"
            );
            return Ok(());
        }

        scope
            .api
            .replace_rule_set(&scope.tunnel_id, &Self::with_catch_all(kept))
            .await
            .with_context(|| format!("Failed to remove ingress rule {}", hostname))?;
        info!(
            hostname = %hostname,
            path = %path,
            tunnel = %scope.tunnel_name,
            "Ingress rule removed"
        );
        Ok(())
    }

    /// Point `hostname` at the tunnel with a proxied CNAME
    async fn ensure_alias(&self, scope: &TunnelScope, service: &TunnelService) -> Result<()> {
        let target = tunnel_alias_target(&scope.tunnel_id);
        let dns = self
            .router
            .dns(&service.hostname, service.credential.as_deref())?;

        if let Some(mut existing) = dns
            .get_record_by_name(&service.hostname, RecordType::Cname)
            .await?
        {
            if existing.content == target {
                return Ok(());
            }
            warn!(
                hostname = %service.hostname,
                existing = %existing.content,
                expected = %target,
                "DNS record does not point at the tunnel, updating"
            );
            if existing.zone_id.is_empty() {
                existing.zone_id = dns.zone_id(&service.hostname).await?;
            }
            existing.content = target.clone();
            existing.proxied = true;
            dns.update_record(&existing).await?;
            info!(hostname = %service.hostname, target = %target, "Tunnel CNAME updated");
            return Ok(());
        }

        let record = DnsRecord {
            id: String::new(),
            zone_id: dns.zone_id(&service.hostname).await?,
            name: service.hostname.clone(),
            record_type: RecordType::Cname,
            content: target.clone(),
            proxied: true,
            ttl: 1,
            priority: None,
            comment: None,
        };
        match dns.create_record(&record).await {
            Ok(created) => {
                info!(
                    hostname = %service.hostname,
                    target = %target,
                    remote_id = %created.id,
                    "Tunnel CNAME created"
                );
                Ok(())
            }
            Err(e) if e.is_already_exists() => {
                debug!(hostname = %service.hostname, "DNS record already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn row_changed(existing: &ManagedResource, wanted: &ManagedResource) -> bool {
        existing.status != ResourceStatus::Active
            || existing.details != wanted.details
            || existing.owner != wanted.owner
            || existing.cleanup_enabled != wanted.cleanup_enabled
    }

    /// Tunnel a route was last pushed to, when that is not `tunnel_id`
    fn previous_tunnel<'a>(row: &'a ManagedResource, tunnel_id: &str) -> Option<&'a str> {
        match &row.details {
            ResourceDetails::TunnelIngress { tunnel_id: old, .. }
                if !old.is_empty() && old != tunnel_id =>
            {
                Some(old.as_str())
            }
            _ => None,
        }
    }

    async fn sync_tunnel(
        &self,
        tunnel: &str,
        routes: &[Route<'_>],
        existing: &BTreeMap<RouteKey, ManagedResource>,
        failures: &mut Failures,
    ) -> Result<()> {
        let scope = match self.router.tunnel(tunnel) {
            Ok(scope) => scope,
            Err(e) => {
                let message = format!("{}", e);
                error!(tunnel = %tunnel, error = %message, "Failed to resolve tunnel");
                self.record_errors(routes, existing, "", &message).await?;
                failures.push(tunnel, message);
                return Ok(());
            }
        };

        let rules: Vec<IngressRule> = routes.iter().map(Route::rule).collect();
        if let Err(e) = self.push_rules(&scope, &rules).await {
            if is_cancelled(&e) {
                return Err(e);
            }
            let message = format!("{:#}", e);
            error!(tunnel = %tunnel, error = %message, "Failed to reconcile tunnel");
            self.record_errors(routes, existing, &scope.tunnel_id, &message)
                .await?;
            failures.push(tunnel, message);
            return Ok(());
        }

        for route in routes {
            let hostname = &route.service.hostname;
            if let Err(e) = self.ensure_alias(&scope, route.service).await {
                if is_cancelled(&e) {
                    return Err(e);
                }
                let message = format!("{:#}", e);
                error!(hostname = %hostname, error = %message, "Failed to ensure tunnel CNAME");
                failures.push(hostname, message);
            }

            // A route moved to another tunnel leaves its old rule behind
            // unless it is removed here
            let row = existing.get(&route.key());
            let moved_from = row.and_then(|r| Self::previous_tunnel(r, &scope.tunnel_id));
            if let (Some(row), Some(old)) = (row, moved_from) {
                info!(
                    hostname = %hostname,
                    from = %old,
                    to = %scope.tunnel_id,
                    "Tunnel route moved"
                );
                if let Err(e) = self.remove_rule(old, hostname, &route.service.path).await {
                    if is_cancelled(&e) {
                        return Err(e);
                    }
                    let message = format!("{:#}", e);
                    error!(
                        hostname = %hostname,
                        error = %message,
                        "Failed to remove route from previous tunnel"
                    );
                    self.ledger
                        .set_error(&row.id, ResourceStatus::Error, &message)
                        .await?;
                    failures.push(hostname, message);
                    continue;
                }
            }

            let wanted = route.row(&scope.tunnel_id);
            match row {
                Some(row) if !Self::row_changed(row, &wanted) => {}
                Some(_) => {
                    self.ledger.upsert_by_unique_key(wanted).await?;
                    debug!(
                        hostname = %hostname,
                        path = %route.service.path,
                        "Tunnel route updated"
                    );
                }
                None => {
                    self.ledger.upsert_by_unique_key(wanted).await?;
                    info!(
                        hostname = %hostname,
                        service = %route.service.service,
                        tunnel = %tunnel,
                        container = %route.container.name,
                        "Tunnel route created"
                    );
                }
            }
        }
        Ok(())
    }
}

/// Hostname, then longer paths first so specific routes match before
/// their prefixes, then path text
fn push_order(a: (&str, &str), b: (&str, &str)) -> std::cmp::Ordering {
    a.0.cmp(b.0)
        .then_with(|| b.1.len().cmp(&a.1.len()))
        .then_with(|| a.1.cmp(b.1))
}

#[async_trait]
impl Operator for TunnelOperator {
    type Desired = ParsedContainer;

    fn kind(&self) -> ResourceKind {
        ResourceKind::TunnelIngress
    }

    async fn reconcile(&self, containers: &[ParsedContainer]) -> Result<()> {
        let groups = Self::desired(containers);

        let mut current: BTreeMap<RouteKey, ManagedResource> = self
            .ledger
            .list_by_kind_and_status(ResourceKind::TunnelIngress, &ResourceStatus::LIVE)
            .await
            .context("Failed to list tunnel resources")?
            .into_iter()
            .filter_map(|row| match &row.details {
                ResourceDetails::TunnelIngress { path, .. } => {
                    Some(((row.hostname.clone(), path.clone()), row))
                }
                _ => None,
            })
            .collect();

        let mut failures = Failures::default();
        for (tunnel, routes) in &groups {
            let keys: BTreeSet<RouteKey> = routes.iter().map(Route::key).collect();
            let existing: BTreeMap<RouteKey, ManagedResource> = keys
                .iter()
                .filter_map(|k| current.remove(k).map(|row| (k.clone(), row)))
                .collect();

            self.sync_tunnel(tunnel, routes, &existing, &mut failures)
                .await?;
        }

        mark_orphaned(self.ledger.as_ref(), current.values()).await?;
        failures.into_result(ResourceKind::TunnelIngress)
    }

    async fn delete(&self, resource: &ManagedResource) -> Result<()> {
        let ResourceDetails::TunnelIngress {
            tunnel_id, path, ..
        } = &resource.details
        else {
            anyhow::bail!("{} is not a tunnel ingress resource", resource.id);
        };

        if tunnel_id.is_empty() {
            debug!(
                hostname = %resource.hostname,
                "Route never reached a tunnel, dropping ledger row only"
            );
        } else {
            self.remove_rule(tunnel_id, &resource.hostname, path).await?;
        }

        self.ledger.delete(&resource.id).await?;
        Ok(())
    }
}
