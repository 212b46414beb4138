//! Reconciler
//!
//! Owns the event loop. Every pass merges the local and agent desired
//! state, resolves conflicts, runs the DNS and tunnel operators, resolves
//! access bindings, runs the Access operator and finally the orphan
//! cleanup. Passes never overlap: the loop is the only writer of the
//! desired-state snapshot, and agent reports land in an inbox the loop
//! drains before each pass.

mod bindings;
mod conflicts;
mod orphans;

pub use bindings::resolve_bindings;
pub use conflicts::{resolve_conflicts, sort_sources};
pub use orphans::OrphanScheduler;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::ledger::{Ledger, LedgerError, ResourceKind, StatusCounts};
use crate::operator::{is_cancelled, AccessOperator, DnsOperator, Operator, TunnelOperator};
use crate::source::ContainerSource;
use crate::types::{AgentReport, ContainerEvent, EventKind, ParsedContainer};

/// Capacity of the container event channel
const EVENT_BUFFER: usize = 64;

/// Joined failures of one pass
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{}", .0.join("; "))]
pub struct PassError(pub Vec<String>);

/// The operators a pass drives. A `None` operator is disabled.
#[derive(Default)]
pub struct Operators {
    pub dns: Option<DnsOperator>,
    pub tunnel: Option<TunnelOperator>,
    pub access: Option<AccessOperator>,
}

/// Outcome of the latest pass, for the health surface
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub started_at: DateTime<Utc>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

#[derive(Debug, Default)]
struct DesiredSnapshot {
    local: BTreeMap<String, ParsedContainer>,
    agents: BTreeMap<String, Vec<ParsedContainer>>,
}

impl DesiredSnapshot {
    fn merged(&self) -> Vec<ParsedContainer> {
        self.local
            .values()
            .chain(self.agents.values().flatten())
            .cloned()
            .collect()
    }
}

/// Pending agent snapshots; `None` means the agent disconnected
type AgentInbox = Mutex<BTreeMap<String, Option<Vec<ParsedContainer>>>>;

/// Entry point for remote agent data. Cheap to clone.
#[derive(Clone)]
pub struct AgentHandle {
    inbox: Arc<AgentInbox>,
    trigger: mpsc::Sender<()>,
}

impl AgentHandle {
    /// Replace everything previously reported by this agent
    pub fn update(&self, report: AgentReport) {
        let containers = report
            .containers
            .into_iter()
            .map(|mut c| {
                c.agent_id = Some(report.agent_id.clone());
                c
            })
            .collect::<Vec<_>>();
        debug!(agent = %report.agent_id, containers = containers.len(), "Agent report received");
        self.inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(report.agent_id, Some(containers));
        self.notify();
    }

    /// Forget an agent's containers
    pub fn remove(&self, agent_id: &str) {
        self.inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(agent_id.to_string(), None);
        self.notify();
    }

    fn notify(&self) {
        // A full channel already has a pass pending
        let _ = self.trigger.try_send(());
    }
}

pub struct Reconciler {
    source: Arc<dyn ContainerSource>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    operators: Operators,
    orphans: OrphanScheduler,
    interval: Duration,
    state: RwLock<DesiredSnapshot>,
    inbox: Arc<AgentInbox>,
    trigger: mpsc::Sender<()>,
    trigger_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
    status: RwLock<SyncStatus>,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn ContainerSource>,
        ledger: Arc<dyn Ledger>,
        operators: Operators,
        clock: Arc<dyn Clock>,
        sync: &SyncConfig,
    ) -> Self {
        let (trigger, trigger_rx) = mpsc::channel(1);
        let orphans = OrphanScheduler::new(
            ledger.clone(),
            clock.clone(),
            sync.remove_delay(),
            sync.orphan_ttl(),
        );

        Self {
            source,
            status: RwLock::new(SyncStatus {
                started_at: clock.now(),
                last_sync: None,
                last_error: None,
            }),
            ledger,
            clock,
            operators,
            orphans,
            interval: sync.interval(),
            state: RwLock::new(DesiredSnapshot::default()),
            inbox: Arc::new(Mutex::new(BTreeMap::new())),
            trigger,
            trigger_rx: tokio::sync::Mutex::new(Some(trigger_rx)),
        }
    }

    pub fn agent_handle(&self) -> AgentHandle {
        AgentHandle {
            inbox: self.inbox.clone(),
            trigger: self.trigger.clone(),
        }
    }

    pub async fn status(&self) -> SyncStatus {
        self.status.read().await.clone()
    }

    /// Copy of the merged desired state, in conflict-resolution order
    pub async fn containers(&self) -> Vec<ParsedContainer> {
        let mut containers = self.state.read().await.merged();
        sort_sources(&mut containers);
        containers
    }

    pub async fn resource_counts(
        &self,
    ) -> Result<BTreeMap<ResourceKind, StatusCounts>, LedgerError> {
        let mut counts = BTreeMap::new();
        for kind in ResourceKind::ALL {
            counts.insert(kind, self.ledger.count_by_status(kind).await?);
        }
        Ok(counts)
    }

    /// Re-list every local container, replacing the local snapshot
    pub async fn full_sync(&self) -> Result<()> {
        let containers = self
            .source
            .list_containers()
            .await
            .with_context(|| format!("Failed to list containers from {}", self.source.name()))?;

        let local: BTreeMap<String, ParsedContainer> = containers
            .into_iter()
            .filter(ParsedContainer::has_declarations)
            .map(|c| (c.id.clone(), c))
            .collect();
        debug!(containers = local.len(), "Local containers synced");
        self.state.write().await.local = local;
        Ok(())
    }

    /// Apply a container event; returns whether a pass should follow
    pub async fn handle_event(&self, event: ContainerEvent) -> bool {
        debug!(kind = %event.kind, container = %event.container_name, "Handling container event");
        match event.kind {
            EventKind::Start | EventKind::Update => {
                match self.source.get_container(&event.container_id).await {
                    Ok(Some(container)) if container.has_declarations() => {
                        self.state
                            .write()
                            .await
                            .local
                            .insert(container.id.clone(), container);
                    }
                    Ok(_) => {
                        self.state.write().await.local.remove(&event.container_id);
                    }
                    Err(e) => {
                        warn!(
                            container = %event.container_name,
                            error = %format!("{:#}", e),
                            "Failed to inspect container"
                        );
                        return false;
                    }
                }
                true
            }
            EventKind::Stop | EventKind::Die => {
                self.state.write().await.local.remove(&event.container_id);
                true
            }
            EventKind::Destroy => {
                self.state.write().await.local.remove(&event.container_id);
                false
            }
        }
    }

    async fn drain_agents(&self) {
        let pending = std::mem::take(&mut *self.inbox.lock().unwrap_or_else(|e| e.into_inner()));
        if pending.is_empty() {
            return;
        }

        let mut state = self.state.write().await;
        for (agent_id, containers) in pending {
            match containers {
                Some(containers) => {
                    state.agents.insert(agent_id, containers);
                }
                None => {
                    info!(agent = %agent_id, "Agent removed, dropping its containers");
                    state.agents.remove(&agent_id);
                }
            }
        }
    }

    /// Run one full pass. Kind failures are collected; one kind failing
    /// does not stop the others.
    pub async fn reconcile(&self) -> Result<(), PassError> {
        self.drain_agents().await;
        let containers = self.state.read().await.merged();
        let resolved = resolve_conflicts(&containers);
        info!(containers = resolved.len(), "Reconciliation pass started");

        let mut errors = Vec::new();

        if let Some(op) = &self.operators.dns {
            record_outcome(op.kind(), op.reconcile(&resolved).await, &mut errors)?;
        }
        if let Some(op) = &self.operators.tunnel {
            record_outcome(op.kind(), op.reconcile(&resolved).await, &mut errors)?;
        }
        if let Some(op) = &self.operators.access {
            let bindings = resolve_bindings(&resolved);
            record_outcome(op.kind(), op.reconcile(&bindings).await, &mut errors)?;
        }

        if let Err(e) = self.orphans.process(&self.operators).await {
            if is_cancelled(&e) {
                return Err(PassError(vec!["pass cancelled".to_string()]));
            }
            error!(error = %format!("{:#}", e), "Orphan cleanup failed");
            errors.push(format!("{:#}", e));
        }

        let mut status = self.status.write().await;
        status.last_sync = Some(self.clock.now());
        status.last_error = (!errors.is_empty()).then(|| errors.join("; "));

        if errors.is_empty() {
            info!("Reconciliation pass finished");
            Ok(())
        } else {
            Err(PassError(errors))
        }
    }

    async fn run_pass(&self, shutdown: &CancellationToken) {
        tokio::select! {
            result = self.reconcile() => {
                if let Err(e) = result {
                    error!(error = %e, "Sync cycle failed");
                }
            }
            _ = shutdown.cancelled() => {
                info!("Reconciliation pass interrupted by shutdown");
            }
        }
    }

    /// Drive passes until `shutdown` fires
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let mut trigger_rx = self
            .trigger_rx
            .lock()
            .await
            .take()
            .context("Reconciler is already running")?;

        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let source = self.source.clone();
        let watch_cancel = shutdown.clone();
        let watcher = tokio::spawn(async move {
            tokio::select! {
                result = source.watch(event_tx) => {
                    if let Err(e) = result {
                        error!(error = %format!("{:#}", e), "Container watch stopped");
                    }
                }
                _ = watch_cancel.cancelled() => {}
            }
        });

        info!(
            interval_secs = self.interval.as_secs(),
            source = %self.source.name(),
            "Reconciler started"
        );

        if let Err(e) = self.full_sync().await {
            warn!(error = %format!("{:#}", e), "Initial container sync failed");
        }
        self.run_pass(&shutdown).await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                Some(event) = event_rx.recv() => {
                    if self.handle_event(event).await {
                        self.run_pass(&shutdown).await;
                    }
                }

                Some(()) = trigger_rx.recv() => {
                    debug!("Agent data changed");
                    self.run_pass(&shutdown).await;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.full_sync().await {
                        warn!(error = %format!("{:#}", e), "Periodic container sync failed");
                    }
                    self.run_pass(&shutdown).await;
                }
            }
        }

        watcher.abort();
        info!("Reconciler stopped");
        Ok(())
    }
}

/// Record a kind's failure; a cancellation ends the pass
fn record_outcome(
    kind: ResourceKind,
    result: Result<()>,
    errors: &mut Vec<String>,
) -> Result<(), PassError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if is_cancelled(&e) => Err(PassError(vec![format!("{}: pass cancelled", kind)])),
        Err(e) => {
            error!(kind = %kind, error = %format!("{:#}", e), "Reconcile failed");
            errors.push(format!("{:#}", e));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pass_error_joins_failures() {
        let err = PassError(vec!["dns: boom".to_string(), "cleanup: bang".to_string()]);
        assert_eq!(err.to_string(), "dns: boom; cleanup: bang");
    }

    #[test]
    fn test_snapshot_merges_local_and_agents() {
        let mut snapshot = DesiredSnapshot::default();
        snapshot
            .local
            .insert("a".to_string(), ParsedContainer::new("a", "local"));
        let mut remote = ParsedContainer::new("b", "remote");
        remote.agent_id = Some("edge".to_string());
        snapshot.agents.insert("edge".to_string(), vec![remote]);

        let merged = snapshot.merged();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[1].agent_id.as_deref(), Some("edge"));
    }

    #[test]
    fn test_agent_triggers_coalesce() {
        let (trigger, mut rx) = mpsc::channel(1);
        let handle = AgentHandle {
            inbox: Arc::new(Mutex::new(BTreeMap::new())),
            trigger,
        };

        for n in 0..5 {
            handle.update(AgentReport {
                agent_id: "edge".to_string(),
                timestamp: Utc::now(),
                containers: vec![ParsedContainer::new(&format!("c{}", n), "web")],
            });
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        let inbox = handle.inbox.lock().unwrap();
        let latest = inbox["edge"].as_ref().unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, "c4");
        assert_eq!(latest[0].agent_id.as_deref(), Some("edge"));
    }
}
