//! Access Binding Resolution
//!
//! Joins the `access` references on tunnel routes and DNS records to the
//! named policy templates declared anywhere in the desired state.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use tracing::{debug, warn};

use crate::types::{AccessPolicyDef, ParsedContainer, ResolvedAccessBinding};

/// Templates by name; the first source to define a name wins
fn collect_templates(containers: &[ParsedContainer]) -> BTreeMap<String, AccessPolicyDef> {
    let mut templates: BTreeMap<String, AccessPolicyDef> = BTreeMap::new();
    for container in containers {
        for (name, def) in &container.access {
            let mut def = def.clone();
            if def.name.is_empty() {
                def.name = name.clone();
            }
            match templates.entry(name.clone()) {
                Entry::Occupied(kept) if *kept.get() != def => warn!(
                    policy = %name,
                    container = %container.name,
                    "Access policy defined differently by several containers, first definition wins"
                ),
                Entry::Occupied(_) => {}
                Entry::Vacant(slot) => {
                    slot.insert(def);
                }
            }
        }
    }
    templates
}

/// Resolve bindings from conflict-resolved containers, visited in the
/// order given. Within a container, tunnel routes come before DNS records.
pub fn resolve_bindings(containers: &[ParsedContainer]) -> Vec<ResolvedAccessBinding> {
    let templates = collect_templates(containers);
    let mut bound: BTreeMap<String, String> = BTreeMap::new();
    let mut bindings = Vec::new();

    for container in containers {
        let tunnel_refs = container.tunnels.iter().filter_map(|svc| {
            let policy = svc.access.as_ref()?;
            Some((&svc.hostname, &svc.service_name, policy, svc.cleanup))
        });
        let dns_refs = container.dns.iter().filter_map(|svc| {
            let policy = svc.access.as_ref()?;
            Some((&svc.hostname, &svc.service_name, policy, svc.cleanup))
        });
        let references = tunnel_refs.chain(dns_refs);

        for (hostname, service_name, policy_name, cleanup) in references {
            let Some(policy) = templates.get(policy_name) else {
                warn!(
                    hostname = %hostname,
                    policy = %policy_name,
                    container = %container.name,
                    "Access policy not defined by any container, skipping"
                );
                continue;
            };

            match bound.entry(hostname.clone()) {
                Entry::Occupied(kept) => {
                    if kept.get() != policy_name {
                        warn!(
                            hostname = %hostname,
                            kept = %kept.get(),
                            dropped = %policy_name,
                            "Hostname references several access policies, first reference wins"
                        );
                    }
                    continue;
                }
                Entry::Vacant(slot) => {
                    slot.insert(policy_name.clone());
                }
            }

            debug!(hostname = %hostname, policy = %policy_name, "Resolved access binding");
            bindings.push(ResolvedAccessBinding {
                hostname: hostname.clone(),
                policy: policy.clone(),
                container_id: container.id.clone(),
                container_name: container.name.clone(),
                service_name: service_name.clone(),
                agent_id: container.agent_id.clone(),
                cleanup,
            });
        }
    }

    bindings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DnsService, TunnelService};

    #[test]
    fn test_template_from_another_container() {
        let mut policies = ParsedContainer::new("a", "policies");
        policies
            .access
            .insert("admins".to_string(), AccessPolicyDef::new(""));

        let mut app = ParsedContainer::new("b", "app");
        let mut route = TunnelService::new("panel", "admin.example.com", "http://panel:80");
        route.access = Some("admins".to_string());
        route.cleanup = false;
        app.tunnels.push(route);

        let bindings = resolve_bindings(&[policies, app]);
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].hostname, "admin.example.com");
        assert_eq!(bindings[0].policy.name, "admins");
        assert_eq!(bindings[0].container_name, "app");
        assert!(!bindings[0].cleanup);
    }

    #[test]
    fn test_missing_template_is_skipped() {
        let mut app = ParsedContainer::new("a", "app");
        let mut record = DnsService::new("web", "web.example.com");
        record.access = Some("nobody".to_string());
        app.dns.push(record);

        assert!(resolve_bindings(&[app]).is_empty());
    }

    #[test]
    fn test_first_template_definition_wins() {
        let mut first = ParsedContainer::new("a", "first");
        let mut short = AccessPolicyDef::new("team");
        short.session_duration = "1h".to_string();
        first.access.insert("team".to_string(), short);
        let mut web = DnsService::new("web", "web.example.com");
        web.access = Some("team".to_string());
        first.dns.push(web);

        let mut second = ParsedContainer::new("b", "second");
        second
            .access
            .insert("team".to_string(), AccessPolicyDef::new("team"));

        let bindings = resolve_bindings(&[first, second]);
        assert_eq!(bindings[0].policy.session_duration, "1h");
    }

    #[test]
    fn test_hostname_bound_once() {
        let mut app = ParsedContainer::new("a", "app");
        app.access
            .insert("team".to_string(), AccessPolicyDef::new("team"));
        let mut route = TunnelService::new("web", "web.example.com", "http://web:80");
        route.access = Some("team".to_string());
        app.tunnels.push(route);
        let mut record = DnsService::new("web", "web.example.com");
        record.access = Some("team".to_string());
        app.dns.push(record);

        let bindings = resolve_bindings(&[app]);
        assert_eq!(bindings.len(), 1);
    }
}
