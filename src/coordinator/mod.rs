// Coordinator module - Owns the active unit set and drives unit lifecycles

mod poller;

use crate::config::SidecarConfig;
use crate::error::{Result, SidecarError};
use crate::unit::{
    ErrorSink, FatalErrors, Registry, SharedResources, Unit, UnitError, UnitName, UnitState,
    UnitStatus,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default interval between status polls of a unit
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Stand-in deadline for timeouts too large to add to the clock
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Coordinator settings
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How often each unit's status is refreshed, capped at one day
    pub poll_interval: Duration,
    /// Resources handed to every unit at initialization
    pub shared: SharedResources,
    /// Sidecar configuration consulted for enablement (not owned)
    pub sidecar: Option<Arc<SidecarConfig>>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            shared: SharedResources::default(),
            sidecar: None,
        }
    }
}

impl CoordinatorConfig {
    /// Derive coordinator settings from a loaded sidecar configuration
    pub fn from_sidecar(sidecar: Arc<SidecarConfig>) -> Self {
        Self {
            poll_interval: sidecar.poll_interval(),
            shared: SharedResources::new(sidecar.version.clone()),
            sidecar: Some(sidecar),
        }
    }
}

/// Point-in-time view of one active unit
#[derive(Debug, Clone, Serialize)]
pub struct UnitReport {
    pub name: UnitName,
    pub state: UnitState,
    /// Cached snapshot, if one has been taken
    pub status: Option<UnitStatus>,
}

/// A unit in the active set
struct UnitEntry {
    unit: Arc<dyn Unit>,
    state: Arc<watch::Sender<UnitState>>,
    /// Start context of the current run, cancelled on stop
    run: Mutex<Option<CancellationToken>>,
    /// Serializes start and stop; holds the run's sink while started
    lifecycle: Mutex<Option<ErrorSink>>,
    /// Cancels this unit's status poller
    poller: CancellationToken,
}

impl UnitEntry {
    fn new(unit: Arc<dyn Unit>, poller: CancellationToken) -> Self {
        Self {
            unit,
            state: Arc::new(watch::channel(UnitState::Added).0),
            run: Mutex::new(None),
            lifecycle: Mutex::new(None),
            poller,
        }
    }

    fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    /// Atomically move Added/Stopped to Starting
    fn claim_start(&self) -> bool {
        self.state.send_if_modified(|state| {
            if state.can_start() {
                *state = UnitState::Starting;
                true
            } else {
                false
            }
        })
    }

    /// Settle the Starting state once the unit's start has returned
    fn settle_start(&self, running: bool) {
        self.state.send_if_modified(|state| {
            if *state != UnitState::Starting {
                return false;
            }
            *state = if running {
                UnitState::Running
            } else {
                UnitState::Failed
            };
            true
        });
    }

    /// Apply a refreshed snapshot to the state machine
    fn observe(&self, status: &UnitStatus) -> bool {
        self.state.send_if_modified(|state| {
            if *state == UnitState::Running && !status.running {
                *state = UnitState::Failed;
                true
            } else {
                false
            }
        })
    }

    /// Mark the unit Removed, returning the state it left
    ///
    /// `None` if another removal already holds it.
    fn begin_removal(&self) -> Option<UnitState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if *state == UnitState::Removed {
                return false;
            }
            previous = Some(std::mem::replace(state, UnitState::Removed));
            true
        });
        previous
    }

    /// Undo `begin_removal` after a failed stop
    fn abort_removal(&self, previous: UnitState) {
        // Its start has already returned, so it can no longer settle
        let restored = match previous {
            UnitState::Starting => UnitState::Failed,
            state => state,
        };
        self.state.send_if_modified(|state| {
            if *state != UnitState::Removed {
                return false;
            }
            *state = restored;
            true
        });
    }

    async fn cancel_run(&self) {
        if let Some(run) = self.run.lock().await.take() {
            run.cancel();
        }
    }

    /// Stop the unit after any in-flight start has returned
    async fn stop(&self, ctx: CancellationToken) -> std::result::Result<(), UnitError> {
        self.cancel_run().await;

        let mut lifecycle = self.lifecycle.lock().await;
        self.unit.stop(ctx).await?;
        // Dropping the sink lets the run's fatal channel close
        lifecycle.take();
        self.state.send_if_modified(|state| {
            if *state == UnitState::Removed {
                return false;
            }
            *state = UnitState::Stopped;
            true
        });
        Ok(())
    }
}

pub(crate) struct Inner {
    units: RwLock<HashMap<UnitName, Arc<UnitEntry>>>,
    statuses: RwLock<HashMap<UnitName, UnitStatus>>,
    registry: Arc<Registry>,
    config: CoordinatorConfig,
    root: CancellationToken,
}

impl Inner {
    async fn entry(&self, name: &str) -> Result<Arc<UnitEntry>> {
        self.units
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SidecarError::NotFound(name.to_string()))
    }

    /// Query a unit and replace its cached snapshot
    ///
    /// On failure the previous snapshot is left in place.
    pub(crate) async fn refresh_status(&self, name: &str) -> Result<UnitStatus> {
        let entry = self.entry(name).await?;

        let status = entry
            .unit
            .status()
            .await
            .map_err(|e| SidecarError::StatusQueryFailed {
                unit: name.to_string(),
                reason: e.to_string(),
            })?;

        // Lock order is always units, then statuses
        let units = self.units.read().await;
        match units.get(name) {
            Some(current) if Arc::ptr_eq(current, &entry) => {
                let mut statuses = self.statuses.write().await;
                // Overlapping refreshes must not roll the cache back
                if let Some(cached) = statuses.get(name) {
                    if cached.checked_at > status.checked_at {
                        debug!(unit = %name, "Discarding snapshot older than the cached one");
                        return Ok(cached.clone());
                    }
                }
                statuses.insert(UnitName::new(name), status.clone());
            }
            _ => return Err(SidecarError::NotFound(name.to_string())),
        }
        drop(units);

        if entry.observe(&status) {
            warn!(unit = %name, "Unit reported not running, marking as failed");
        }

        Ok(status)
    }
}

/// Lifecycle coordinator for the active set of units
///
/// Cloning is cheap; all clones share the same active set.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    /// Create an empty coordinator
    pub fn new(registry: Arc<Registry>, config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                units: RwLock::new(HashMap::new()),
                statuses: RwLock::new(HashMap::new()),
                registry,
                config,
                root: CancellationToken::new(),
            }),
        }
    }

    /// Create a coordinator with default settings
    pub fn with_defaults(registry: Arc<Registry>) -> Self {
        Self::new(registry, CoordinatorConfig::default())
    }

    /// Version reported to units and the health endpoint
    pub fn version(&self) -> &str {
        &self.inner.config.shared.version
    }

    /// Resolve, configure and initialize a unit, then add it to the active set
    ///
    /// # Errors
    /// * `NotFound` - `name` is not registered
    /// * `InvalidConfig` - `raw` does not match the unit's config shape
    /// * `InitFailed` - the unit rejected its configuration
    /// * `AlreadyExists` - a unit with that identity is already active
    pub async fn add_unit(&self, name: &str, raw: &Value) -> Result<()> {
        if self.inner.units.read().await.contains_key(name) {
            return Err(SidecarError::AlreadyExists(name.to_string()));
        }

        let unit = self
            .inner
            .registry
            .construct(name, raw, &self.inner.config.shared)?;
        let key = unit.name();

        let entry = Arc::new(UnitEntry::new(unit, self.inner.root.child_token()));
        {
            let mut units = self.inner.units.write().await;
            if units.contains_key(&key) {
                return Err(SidecarError::AlreadyExists(key.to_string()));
            }
            units.insert(key.clone(), Arc::clone(&entry));
        }

        poller::spawn(
            Arc::downgrade(&self.inner),
            key.clone(),
            entry.poller.clone(),
            self.inner.config.poll_interval,
        );

        info!(unit = %key, "Added unit");
        Ok(())
    }

    /// Stop a unit and evict it from the active set and status cache
    ///
    /// The unit cannot be started again once removal begins. If its stop
    /// fails it stays active in its previous state so the removal can be
    /// retried.
    pub async fn remove_unit(&self, name: &str) -> Result<()> {
        let entry = self.inner.entry(name).await?;
        let Some(previous) = entry.begin_removal() else {
            return Err(SidecarError::NotFound(name.to_string()));
        };

        if let Err(e) = entry.stop(CancellationToken::new()).await {
            entry.abort_removal(previous);
            return Err(SidecarError::StopFailed {
                unit: name.to_string(),
                reason: e.to_string(),
            });
        }

        {
            let mut units = self.inner.units.write().await;
            match units.get(name) {
                Some(current) if Arc::ptr_eq(current, &entry) => {
                    units.remove(name);
                }
                _ => return Err(SidecarError::NotFound(name.to_string())),
            }
            self.inner.statuses.write().await.remove(name);
        }
        entry.poller.cancel();

        info!(unit = %name, "Removed unit");
        Ok(())
    }

    /// Launch every eligible unit that is not already started
    ///
    /// Each launched unit runs its start as an independent task with a child
    /// of `ctx`. Does not wait for any unit; fatal errors from units launched
    /// by this call arrive on the returned channel.
    pub async fn start_all(&self, ctx: &CancellationToken) -> FatalErrors {
        let (tx, rx) = mpsc::unbounded_channel();

        for (name, entry) in self.snapshot_entries().await {
            if !self.is_enabled(name.as_str()) {
                debug!(unit = %name, "Unit disabled by boot order, not starting");
                continue;
            }

            let reported_running = self
                .inner
                .statuses
                .read()
                .await
                .get(&name)
                .map(|s| s.running)
                .unwrap_or(false);
            if reported_running || !entry.claim_start() {
                debug!(unit = %name, state = %entry.state(), "Unit already started, skipping");
                continue;
            }

            info!(unit = %name, "Starting unit");
            let run = ctx.child_token();
            *entry.run.lock().await = Some(run.clone());
            let sink = ErrorSink::new(name.clone(), tx.clone(), Some(Arc::clone(&entry.state)));
            self.launch(name, entry, run, sink);
        }

        FatalErrors::new(rx)
    }

    fn launch(&self, name: UnitName, entry: Arc<UnitEntry>, run: CancellationToken, sink: ErrorSink) {
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            {
                let mut lifecycle = entry.lifecycle.lock().await;
                // A stop that ran first leaves the unit Stopped
                if run.is_cancelled() || entry.state() != UnitState::Starting {
                    debug!(unit = %name, "Start abandoned before it began");
                    entry.settle_start(false);
                    return;
                }
                *lifecycle = Some(sink.clone());
                entry.unit.start(run, sink).await;
            }

            let running = match Weak::upgrade(&inner) {
                Some(inner) => match inner.refresh_status(name.as_str()).await {
                    Ok(status) => status.running,
                    Err(SidecarError::NotFound(_)) => return,
                    Err(e) => {
                        warn!(unit = %name, "Status check after start failed: {}", e);
                        false
                    }
                },
                None => return,
            };

            entry.settle_start(running);
            match entry.state() {
                UnitState::Running => info!(unit = %name, "Unit started successfully"),
                state => warn!(unit = %name, %state, "Unit is not running after start"),
            }
        });
    }

    /// Stop every active unit concurrently, bounded by `timeout`
    ///
    /// Cancelling `ctx` ends the wait early, as if the deadline had passed.
    /// Units that confirm stop stay stopped even when others time out. Units
    /// are not evicted; their cached snapshots are dropped.
    ///
    /// # Errors
    /// * `StopTimeout` - listed units did not confirm before the deadline
    /// * `StopFailed` - listed units returned an error from stop
    pub async fn stop_all(&self, ctx: &CancellationToken, timeout: Duration) -> Result<()> {
        let entries = self.snapshot_entries().await;
        if entries.is_empty() {
            return Ok(());
        }

        info!("Stopping {} units (deadline: {:?})", entries.len(), timeout);
        let deadline = deadline_after(timeout);

        let mut tasks = JoinSet::new();
        let mut names = HashMap::new();
        for (name, entry) in entries {
            let task_name = name.clone();
            let abort = ctx.clone();
            let handle = tasks.spawn(async move {
                let unit_ctx = abort.child_token();
                let outcome = tokio::select! {
                    result = entry.stop(unit_ctx.clone()) => Some(result),
                    _ = tokio::time::sleep_until(deadline) => {
                        unit_ctx.cancel();
                        None
                    }
                    _ = abort.cancelled() => None,
                };
                (task_name, outcome)
            });
            names.insert(handle.id(), name);
        }

        let mut stopped = Vec::new();
        let mut timed_out = Vec::new();
        let mut failed = Vec::new();

        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, (name, Some(Ok(()))))) => stopped.push(name),
                Ok((_, (name, Some(Err(e))))) => {
                    error!(unit = %name, "Failed to stop unit: {}", e);
                    failed.push((name, e.to_string()));
                }
                Ok((_, (name, None))) => {
                    warn!(unit = %name, "Unit did not confirm stop before deadline");
                    timed_out.push(name);
                }
                Err(e) => {
                    let name = names
                        .remove(&e.id())
                        .unwrap_or_else(|| UnitName::new("<unknown>"));
                    error!(unit = %name, "Stop task aborted: {}", e);
                    failed.push((name, e.to_string()));
                }
            }
        }

        {
            let mut statuses = self.inner.statuses.write().await;
            for name in &stopped {
                statuses.remove(name);
            }
        }

        if !timed_out.is_empty() {
            let mut units: Vec<String> = timed_out.iter().map(ToString::to_string).collect();
            units.sort();
            return Err(SidecarError::StopTimeout { units });
        }

        if !failed.is_empty() {
            failed.sort();
            let (units, reasons): (Vec<String>, Vec<String>) = failed
                .into_iter()
                .map(|(name, reason)| (name.to_string(), reason))
                .unzip();
            return Err(SidecarError::StopFailed {
                unit: units.join(", "),
                reason: reasons.join("; "),
            });
        }

        info!("Stopped {} units", stopped.len());
        Ok(())
    }

    /// Cached snapshot for `name`, querying the unit if none is cached
    ///
    /// # Errors
    /// * `NotFound` - `name` is not active
    /// * `StatusQueryFailed` - the unit's status query errored
    pub async fn get_status(&self, name: &str) -> Result<UnitStatus> {
        if let Some(status) = self.inner.statuses.read().await.get(name) {
            return Ok(status.clone());
        }
        self.inner.refresh_status(name).await
    }

    /// Query the unit now, bypassing the cache
    pub async fn refresh_status(&self, name: &str) -> Result<UnitStatus> {
        self.inner.refresh_status(name).await
    }

    /// Cached snapshot without querying the unit
    pub async fn cached_status(&self, name: &str) -> Option<UnitStatus> {
        self.inner.statuses.read().await.get(name).cloned()
    }

    /// Lifecycle state of an active unit
    pub async fn state(&self, name: &str) -> Option<UnitState> {
        self.inner.units.read().await.get(name).map(|e| e.state())
    }

    /// Subscribe to lifecycle state changes of an active unit
    pub async fn watch_state(&self, name: &str) -> Result<watch::Receiver<UnitState>> {
        Ok(self.inner.entry(name).await?.state.subscribe())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.inner.units.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.inner.units.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every active unit with its state and cached snapshot, sorted by name
    pub async fn list(&self) -> Vec<UnitReport> {
        let units = self.inner.units.read().await;
        let statuses = self.inner.statuses.read().await;

        let mut reports: Vec<UnitReport> = units
            .iter()
            .map(|(name, entry)| UnitReport {
                name: name.clone(),
                state: entry.state(),
                status: statuses.get(name).cloned(),
            })
            .collect();
        reports.sort_by(|a, b| a.name.cmp(&b.name));
        reports
    }

    /// Whether `name` is eligible to start
    ///
    /// Units absent from the sidecar configuration are always eligible.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.inner
            .config
            .sidecar
            .as_ref()
            .map(|sidecar| sidecar.is_enabled(name))
            .unwrap_or(true)
    }

    /// Tear down: cancel every poller and every running start context
    pub async fn close(&self) {
        self.inner.root.cancel();
        for (_, entry) in self.snapshot_entries().await {
            entry.cancel_run().await;
        }
        debug!("Coordinator closed");
    }

    async fn snapshot_entries(&self) -> Vec<(UnitName, Arc<UnitEntry>)> {
        self.inner
            .units
            .read()
            .await
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(entry)))
            .collect()
    }
}

/// `timeout` from now, saturating far in the future
fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}
