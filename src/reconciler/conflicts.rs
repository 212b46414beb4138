//! Conflict Resolution
//!
//! Runs over the merged desired state before any operator. Sources are
//! visited in `(container_id, agent_id)` order and declarations in the
//! order a source lists them, so the same input always yields the same
//! owners.

use std::collections::BTreeMap;
use tracing::warn;

use crate::types::ParsedContainer;

/// Stable source order: container ID, then agent ID (local sources first)
pub fn sort_sources(containers: &mut [ParsedContainer]) {
    containers.sort_by(|a, b| {
        let agent = |c: &ParsedContainer| c.agent_id.clone().unwrap_or_default();
        a.id.cmp(&b.id).then_with(|| agent(a).cmp(&agent(b)))
    });
}

fn source_label(container: &ParsedContainer) -> String {
    match &container.agent_id {
        Some(agent) => format!("{}@{}", container.name, agent),
        None => container.name.clone(),
    }
}

/// Drop declarations that collide with an earlier source.
///
/// Within a kind, the first source declaring a hostname owns it; the same
/// source may still declare several record types or paths for it. Across
/// kinds, a hostname with a DNS record loses its tunnel routes, since the
/// tunnel would otherwise need a CNAME at the same name.
pub fn resolve_conflicts(containers: &[ParsedContainer]) -> Vec<ParsedContainer> {
    let mut resolved = containers.to_vec();
    sort_sources(&mut resolved);

    let mut dns_owners: BTreeMap<String, usize> = BTreeMap::new();
    let mut tunnel_owners: BTreeMap<String, usize> = BTreeMap::new();

    for (index, container) in resolved.iter_mut().enumerate() {
        container.dns.retain(|svc| {
            let owner = *dns_owners.entry(svc.hostname.clone()).or_insert(index);
            if owner != index {
                warn!(
                    hostname = %svc.hostname,
                    container = %container.name,
                    "DNS hostname already declared by another container, dropping"
                );
            }
            owner == index
        });

        container.tunnels.retain(|svc| {
            let owner = *tunnel_owners.entry(svc.hostname.clone()).or_insert(index);
            if owner != index {
                warn!(
                    hostname = %svc.hostname,
                    container = %container.name,
                    "Tunnel hostname already declared by another container, dropping"
                );
            }
            owner == index
        });
    }

    for container in resolved.iter_mut() {
        let label = source_label(container);
        container.tunnels.retain(|svc| {
            let clash = dns_owners.contains_key(&svc.hostname);
            if clash {
                warn!(
                    hostname = %svc.hostname,
                    container = %label,
                    "Hostname declared as both DNS record and tunnel route, dropping the route"
                );
            }
            !clash
        });
    }

    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DnsService, RecordType, TunnelService};

    fn container(id: &str, agent: Option<&str>) -> ParsedContainer {
        let mut c = ParsedContainer::new(id, id);
        c.agent_id = agent.map(str::to_string);
        c
    }

    #[test]
    fn test_first_source_by_id_wins() {
        let mut b = container("b", None);
        b.dns.push(DnsService::new("web", "web.example.com"));
        let mut a = container("a", None);
        a.dns.push(DnsService::new("web", "web.example.com"));

        let resolved = resolve_conflicts(&[b, a]);
        assert_eq!(resolved[0].id, "a");
        assert_eq!(resolved[0].dns.len(), 1);
        assert!(resolved[1].dns.is_empty());
    }

    #[test]
    fn test_owner_keeps_several_record_types() {
        let mut a = container("a", None);
        a.dns.push(DnsService::new("web", "web.example.com"));
        let mut mx = DnsService::new("mail", "web.example.com");
        mx.record_type = RecordType::Mx;
        a.dns.push(mx);

        let resolved = resolve_conflicts(&[a]);
        assert_eq!(resolved[0].dns.len(), 2);
    }

    #[test]
    fn test_local_source_sorts_before_agent() {
        let mut remote = container("x", Some("edge"));
        remote.dns.push(DnsService::new("web", "web.example.com"));
        let mut local = container("x", None);
        local.dns.push(DnsService::new("web", "web.example.com"));

        let resolved = resolve_conflicts(&[remote, local]);
        assert!(resolved[0].agent_id.is_none());
        assert_eq!(resolved[0].dns.len(), 1);
        assert!(resolved[1].dns.is_empty());
    }

    #[test]
    fn test_dns_beats_tunnel_across_sources() {
        let mut a = container("a", None);
        a.tunnels.push(TunnelService::new("app", "app.example.com", "http://app:80"));
        a.tunnels.push(TunnelService::new("api", "api.example.com", "http://api:80"));
        let mut b = container("b", None);
        b.dns.push(DnsService::new("app", "app.example.com"));

        let resolved = resolve_conflicts(&[a, b]);
        assert_eq!(resolved[0].tunnels.len(), 1);
        assert_eq!(resolved[0].tunnels[0].hostname, "api.example.com");
        assert_eq!(resolved[1].dns.len(), 1);
    }

    #[test]
    fn test_resolution_is_order_independent() {
        let mut a = container("a", None);
        a.dns.push(DnsService::new("web", "web.example.com"));
        let mut b = container("b", None);
        b.dns.push(DnsService::new("web", "web.example.com"));

        let forward = resolve_conflicts(&[a.clone(), b.clone()]);
        let backward = resolve_conflicts(&[b, a]);
        assert_eq!(forward, backward);
    }
}
