//! In-process Cloudflare and container source for reconciler tests.
#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use labelgate::clock::ManualClock;
use labelgate::cloudflare::{
    AccessApi, AccessApplication, ApiError, ApiRouter, DnsApi, DnsRecord, IngressRule, TunnelApi,
    TunnelScope,
};
use labelgate::config::SyncConfig;
use labelgate::ledger::MemoryLedger;
use labelgate::operator::{AccessOperator, DnsOperator, PublicIpResolver, TunnelOperator};
use labelgate::reconciler::{Operators, Reconciler};
use labelgate::source::ContainerSource;
use labelgate::types::{AccessPolicyDef, ContainerEvent, ParsedContainer, RecordType};

pub const ZONE_ID: &str = "zone-1";
pub const TUNNEL_ID: &str = "tun-1";
pub const EDGE_TUNNEL_ID: &str = "tun-2";
pub const ACCOUNT_ID: &str = "acc-1";
pub const PUBLIC_IP: &str = "203.0.113.10";

#[derive(Debug, Clone)]
pub struct StoredApp {
    pub app: AccessApplication,
    pub policy: Option<AccessPolicyDef>,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub records: BTreeMap<String, DnsRecord>,
    /// Ingress rules by tunnel ID
    pub rules: BTreeMap<String, Vec<IngressRule>>,
    pub apps: BTreeMap<String, StoredApp>,
    /// Every mutating call, in order
    pub calls: Vec<String>,
    /// Make every record creation fail with this message
    pub fail_dns_create: Option<String>,
    next_id: u64,
}

impl FakeState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }

    pub fn record(&self, name: &str, record_type: RecordType) -> Option<&DnsRecord> {
        self.records
            .values()
            .find(|r| r.name == name && r.record_type == record_type)
    }

    pub fn rules_on(&self, tunnel_id: &str) -> Vec<IngressRule> {
        self.rules.get(tunnel_id).cloned().unwrap_or_default()
    }

    pub fn routed_on(&self, tunnel_id: &str) -> Vec<String> {
        self.rules_on(tunnel_id)
            .iter()
            .filter(|r| !r.is_catch_all())
            .map(|r| r.hostname.clone())
            .collect()
    }

    /// Hostnames routed by the `default` tunnel
    pub fn routed_hostnames(&self) -> Vec<String> {
        self.routed_on(TUNNEL_ID)
    }
}

/// Cloudflare account with one zone, the tunnels `default` and `edge`, and Access
#[derive(Clone, Default)]
pub struct FakeCloudflare {
    state: Arc<Mutex<FakeState>>,
}

impl FakeCloudflare {
    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    pub fn calls(&self) -> usize {
        self.state().calls.len()
    }

    /// Record created outside labelgate
    pub fn seed_record(&self, name: &str, record_type: RecordType, content: &str) -> String {
        let mut state = self.state();
        let id = state.next_id("rec");
        state.records.insert(
            id.clone(),
            DnsRecord {
                id: id.clone(),
                zone_id: ZONE_ID.to_string(),
                name: name.to_string(),
                record_type,
                content: content.to_string(),
                proxied: false,
                ttl: 1,
                priority: None,
                comment: None,
            },
        );
        id
    }

    /// Access application created outside labelgate
    pub fn seed_app(&self, id: &str, name: &str, domain: &str) {
        self.state().apps.insert(
            id.to_string(),
            StoredApp {
                app: AccessApplication {
                    id: id.to_string(),
                    name: name.to_string(),
                    domain: domain.to_string(),
                },
                policy: None,
            },
        );
    }
}

#[async_trait]
impl DnsApi for FakeCloudflare {
    async fn zone_id(&self, hostname: &str) -> Result<String, ApiError> {
        if hostname.ends_with("example.com") {
            Ok(ZONE_ID.to_string())
        } else {
            Err(ApiError::NotFound(format!("zone for {}", hostname)))
        }
    }

    async fn create_record(&self, record: &DnsRecord) -> Result<DnsRecord, ApiError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("create_record {} {}", record.record_type, record.name));
        if let Some(message) = &state.fail_dns_create {
            return Err(ApiError::api(403, 9109, message));
        }
        if state.record(&record.name, record.record_type).is_some() {
            return Err(ApiError::api(400, 81057, "An identical record already exists."));
        }
        let mut created = record.clone();
        created.id = state.next_id("rec");
        state.records.insert(created.id.clone(), created.clone());
        Ok(created)
    }

    async fn update_record(&self, record: &DnsRecord) -> Result<DnsRecord, ApiError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("update_record {} {}", record.record_type, record.name));
        match state.records.get_mut(&record.id) {
            Some(stored) => {
                *stored = record.clone();
                Ok(record.clone())
            }
            None => Err(ApiError::api(404, 81044, "Record does not exist.")),
        }
    }

    async fn delete_record(&self, _zone_id: &str, record_id: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        state.calls.push(format!("delete_record {}", record_id));
        match state.records.remove(record_id) {
            Some(_) => Ok(()),
            None => Err(ApiError::api(404, 81044, "Record does not exist.")),
        }
    }

    async fn get_record_by_name(
        &self,
        hostname: &str,
        record_type: RecordType,
    ) -> Result<Option<DnsRecord>, ApiError> {
        Ok(self.state().record(hostname, record_type).cloned())
    }
}

#[async_trait]
impl TunnelApi for FakeCloudflare {
    async fn get_rule_set(&self, tunnel_id: &str) -> Result<Vec<IngressRule>, ApiError> {
        Ok(self.state().rules_on(tunnel_id))
    }

    async fn replace_rule_set(
        &self,
        tunnel_id: &str,
        rules: &[IngressRule],
    ) -> Result<(), ApiError> {
        let mut state = self.state();
        state
            .calls
            .push(format!("replace_rule_set {} ({} rules)", tunnel_id, rules.len()));
        state.rules.insert(tunnel_id.to_string(), rules.to_vec());
        Ok(())
    }
}

#[async_trait]
impl AccessApi for FakeCloudflare {
    fn account_id(&self) -> &str {
        ACCOUNT_ID
    }

    async fn find_existing_application(
        &self,
        hostname: &str,
    ) -> Result<Option<AccessApplication>, ApiError> {
        Ok(self
            .state()
            .apps
            .values()
            .find(|a| a.app.domain == hostname)
            .map(|a| a.app.clone()))
    }

    async fn ensure_application_for_hostname(
        &self,
        hostname: &str,
        policy: &AccessPolicyDef,
        existing_app_id: Option<&str>,
    ) -> Result<String, ApiError> {
        let mut state = self.state();
        state.calls.push(format!("ensure_application {}", hostname));
        let id = match existing_app_id {
            Some(id) if state.apps.contains_key(id) => id.to_string(),
            _ => state.next_id("app"),
        };
        state.apps.insert(
            id.clone(),
            StoredApp {
                app: AccessApplication {
                    id: id.clone(),
                    name: policy.application_name(),
                    domain: hostname.to_string(),
                },
                policy: Some(policy.clone()),
            },
        );
        Ok(id)
    }

    async fn delete_application(&self, app_id: &str) -> Result<(), ApiError> {
        let mut state = self.state();
        state.calls.push(format!("delete_application {}", app_id));
        match state.apps.remove(app_id) {
            Some(_) => Ok(()),
            None => Err(ApiError::NotFound(app_id.to_string())),
        }
    }

    async fn check_permissions(&self) -> Result<(), ApiError> {
        Ok(())
    }
}

impl ApiRouter for FakeCloudflare {
    fn dns(
        &self,
        _hostname: &str,
        _credential: Option<&str>,
    ) -> Result<Arc<dyn DnsApi>, ApiError> {
        Ok(Arc::new(self.clone()))
    }

    fn tunnel(&self, tunnel: &str) -> Result<TunnelScope, ApiError> {
        let (tunnel_id, tunnel_name) = match tunnel {
            "default" | TUNNEL_ID => (TUNNEL_ID, "default"),
            "edge" | EDGE_TUNNEL_ID => (EDGE_TUNNEL_ID, "edge"),
            _ => return Err(ApiError::Config(format!("tunnel not configured: {}", tunnel))),
        };
        Ok(TunnelScope {
            api: Arc::new(self.clone()),
            tunnel_id: tunnel_id.to_string(),
            tunnel_name: tunnel_name.to_string(),
            account_id: ACCOUNT_ID.to_string(),
        })
    }

    fn access(&self) -> Result<Arc<dyn AccessApi>, ApiError> {
        Ok(Arc::new(self.clone()))
    }
}

pub struct StaticIp;

#[async_trait]
impl PublicIpResolver for StaticIp {
    async fn public_ip(&self) -> Result<IpAddr> {
        Ok(PUBLIC_IP.parse()?)
    }
}

/// Container source whose contents tests set directly
#[derive(Default)]
pub struct StaticSource {
    containers: Mutex<Vec<ParsedContainer>>,
}

impl StaticSource {
    pub fn set(&self, containers: Vec<ParsedContainer>) {
        *self.containers.lock().unwrap() = containers;
    }
}

#[async_trait]
impl ContainerSource for StaticSource {
    fn name(&self) -> &str {
        "static"
    }

    async fn list_containers(&self) -> Result<Vec<ParsedContainer>> {
        Ok(self.containers.lock().unwrap().clone())
    }

    async fn get_container(&self, id: &str) -> Result<Option<ParsedContainer>> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == id)
            .cloned())
    }

    async fn watch(&self, _events: mpsc::Sender<ContainerEvent>) -> Result<()> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

pub struct Harness {
    pub cloudflare: FakeCloudflare,
    pub ledger: Arc<MemoryLedger>,
    pub clock: Arc<ManualClock>,
    pub source: Arc<StaticSource>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new(sync: SyncConfig) -> Self {
        let cloudflare = FakeCloudflare::default();
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let ledger = Arc::new(MemoryLedger::with_clock(clock.clone()));
        let source = Arc::new(StaticSource::default());
        let router: Arc<dyn ApiRouter> = Arc::new(cloudflare.clone());

        let operators = Operators {
            dns: Some(DnsOperator::new(router.clone(), ledger.clone(), Arc::new(StaticIp))),
            tunnel: Some(TunnelOperator::new(router.clone(), ledger.clone())),
            access: Some(AccessOperator::new(router, ledger.clone())),
        };
        let reconciler = Reconciler::new(
            source.clone(),
            ledger.clone(),
            operators,
            clock.clone(),
            &sync,
        );

        Self {
            cloudflare,
            ledger,
            clock,
            source,
            reconciler,
        }
    }

    /// Default timers: 30 minute remove delay, no orphan TTL
    pub fn with_defaults() -> Self {
        Self::new(SyncConfig::default())
    }

    /// Replace the local containers and run one pass
    pub async fn pass_with(&self, containers: Vec<ParsedContainer>) -> Result<(), String> {
        self.source.set(containers);
        self.pass().await
    }

    pub async fn pass(&self) -> Result<(), String> {
        self.reconciler.full_sync().await.map_err(|e| e.to_string())?;
        self.reconciler.reconcile().await.map_err(|e| e.to_string())
    }
}
