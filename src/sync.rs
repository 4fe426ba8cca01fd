//! The sync orchestrator.
//!
//! Every mutation goes through [`SyncOrchestrator::write`], which decides per
//! call whether to hit the backend or append to the durable queue. Queue and
//! cache are only touched while holding the orchestrator's lock, so enqueue
//! order is call order and a drain never interleaves with new writes.
//!
//! Replay is strictly oldest-first and halts at the first failure; nothing
//! is ever skipped. Once a queued create succeeds, later actions that still
//! point at its local placeholder id are retargeted in the same transaction
//! that removes it.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{ApiError, ImageUpload, RemoteApi};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::SyncError;
use crate::model::{Mutation, Trip, TripId};
use crate::offline_store::CacheStore;
use crate::outbox::{
    ActionId, ActionKind, ActionQueue, NewAction, OutboxError, QuarantinedAction, QueuedAction,
};

/// Read-only projection for the UI.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_online: bool,
    pub is_syncing: bool,
    pub pending_count: usize,
    /// Most recent failure absorbed during replay; cleared when a drain empties the queue.
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteResult {
    Saved(Trip),
    Deleted(TripId),
}

impl WriteResult {
    pub fn trip(&self) -> Option<&Trip> {
        match self {
            WriteResult::Saved(trip) => Some(trip),
            WriteResult::Deleted(_) => None,
        }
    }

    pub fn id(&self) -> &TripId {
        match self {
            WriteResult::Saved(trip) => &trip.id,
            WriteResult::Deleted(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The backend confirmed the mutation.
    Synced(WriteResult),
    /// The mutation waits in the queue; `optimistic` is a local rendition of it.
    Queued {
        action_id: ActionId,
        optimistic: WriteResult,
    },
}

impl WriteOutcome {
    pub fn result(&self) -> &WriteResult {
        match self {
            WriteOutcome::Synced(result) => result,
            WriteOutcome::Queued { optimistic, .. } => optimistic,
        }
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, WriteOutcome::Queued { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// Connectivity was lost; nothing was attempted past this point.
    Offline,
    /// The head of the queue failed and stays queued.
    Failed {
        action_id: ActionId,
        attempts: u32,
        error: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub replayed: usize,
    pub remaining: usize,
    pub halted: Option<HaltReason>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

struct SyncCore {
    queue: ActionQueue,
    cache: CacheStore,
}

/// A failing entry is poison once it has used up its attempts, or at once
/// when replaying the same request can never succeed.
fn is_poisoned(attempts: u32, threshold: u32, error: &ApiError) -> bool {
    attempts >= threshold || !error.is_retryable()
}

/// Returns the published state to idle when a drain future is dropped
/// before it finishes.
struct DrainGuard<'a> {
    state: &'a watch::Sender<SyncState>,
    core: &'a mut SyncCore,
    finished: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let pending = self.core.queue.len().ok();
        warn!(?pending, "Drain cancelled before completion");
        self.state.send_modify(|s| {
            s.is_syncing = false;
            if let Some(pending) = pending {
                s.pending_count = pending;
            }
        });
    }
}

pub struct SyncOrchestrator {
    core: Mutex<SyncCore>,
    api: Arc<dyn RemoteApi>,
    monitor: Arc<ConnectivityMonitor>,
    state: watch::Sender<SyncState>,
    poison_threshold: u32,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("state", &*self.state.borrow())
            .field("poison_threshold", &self.poison_threshold)
            .finish()
    }
}

impl SyncOrchestrator {
    /// Open the queue and cache under `config.data_dir`.
    pub fn open(
        config: &SyncConfig,
        api: Arc<dyn RemoteApi>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let queue = ActionQueue::open(config.queue_path(), config.max_queue_entries).map_err(
            |e| {
                if e.is_corrupt_file() {
                    SyncError::StorageCorrupt(e.to_string())
                } else {
                    SyncError::Queue(e)
                }
            },
        )?;
        let cache = CacheStore::new(config.cache_path());
        Self::from_parts(queue, cache, api, monitor)
            .map(|orchestrator| orchestrator.with_poison_threshold(config.poison_threshold))
    }

    pub fn from_parts(
        queue: ActionQueue,
        cache: CacheStore,
        api: Arc<dyn RemoteApi>,
        monitor: Arc<ConnectivityMonitor>,
    ) -> Result<Self, SyncError> {
        let initial = SyncState {
            is_online: monitor.current(),
            pending_count: queue.len()?,
            ..Default::default()
        };
        let (state, _) = watch::channel(initial);
        Ok(Self {
            core: Mutex::new(SyncCore { queue, cache }),
            api,
            monitor,
            state,
            poison_threshold: SyncConfig::default().poison_threshold,
        })
    }

    pub fn with_poison_threshold(mut self, threshold: u32) -> Self {
        self.poison_threshold = threshold.max(1);
        self
    }

    pub fn state(&self) -> SyncState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.state.subscribe()
    }

    pub fn monitor(&self) -> &Arc<ConnectivityMonitor> {
        &self.monitor
    }

    /// Apply a mutation: directly when the backend is reachable, otherwise
    /// through the queue with an optimistic result.
    #[instrument(skip(self, mutation), fields(kind = mutation.kind_name()))]
    pub async fn write(&self, mut mutation: Mutation) -> Result<WriteOutcome, SyncError> {
        mutation.validate()?;

        let mut core = self.core.lock().await;
        let online = self.monitor.is_online().await;
        self.update_state(|s| s.is_online = online);

        // A backlog goes first so this write cannot overtake it.
        let mut direct = online;
        if online && !core.queue.is_empty()? {
            let report = self.drain_locked(&mut core).await?;
            direct = report.is_complete();
        }

        if let Some(target) = mutation.target().filter(|id| id.is_local()).cloned() {
            match core.queue.resolved_id(&target)? {
                Some(server_id) => {
                    debug!(local = %target, server = %server_id, "Translated local trip id");
                    mutation.retarget(server_id);
                }
                None if core.queue.has_pending_create(&target)? => {
                    direct = false;
                }
                None => return Err(SyncError::UnknownTrip(target.to_string())),
            }
        }

        if direct {
            match self.apply_remote(&mutation).await {
                Ok(result) => {
                    self.refresh_cache(&mut core).await;
                    return Ok(WriteOutcome::Synced(result));
                }
                Err(e) if e.is_network() => {
                    warn!(error = %e, "Backend unreachable mid-call, queueing");
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.enqueue_locked(&mut core, mutation)
    }

    /// Trips from the backend when reachable, else the last snapshot. Never
    /// mixes in queued actions.
    #[instrument(skip(self))]
    pub async fn read(&self) -> Result<Vec<Trip>, SyncError> {
        let mut core = self.core.lock().await;
        let online = self.monitor.is_online().await;
        self.update_state(|s| s.is_online = online);

        if online {
            match self.fetch_and_cache(&mut core).await {
                Ok(trips) => return Ok(trips),
                Err(ApiError::AuthRequired) => return Err(SyncError::AuthRequired),
                Err(e) => {
                    info!(error = %e, "Fetch failed, serving cached trips");
                }
            }
        } else {
            debug!("Offline, serving cached trips");
        }

        Ok(core.cache.load().unwrap_or_default())
    }

    /// One trip out of [`SyncOrchestrator::read`]. Local ids whose create has
    /// already replayed are looked up under their server id.
    pub async fn get_trip(&self, id: &TripId) -> Result<Option<Trip>, SyncError> {
        let id = if id.is_local() {
            let core = self.core.lock().await;
            core.queue.resolved_id(id)?.unwrap_or_else(|| id.clone())
        } else {
            id.clone()
        };
        let trips = self.read().await?;
        Ok(trips.into_iter().find(|trip| trip.id == id))
    }

    /// Manual drain. A no-op on an empty queue.
    #[instrument(skip(self))]
    pub async fn sync_now(&self) -> Result<DrainReport, SyncError> {
        let mut core = self.core.lock().await;
        let pending = core.queue.len()?;
        if pending == 0 {
            return Ok(DrainReport::default());
        }

        let online = self.monitor.is_online().await;
        self.update_state(|s| s.is_online = online);
        if !online {
            info!(pending, "Sync requested while offline");
            return Ok(DrainReport {
                replayed: 0,
                remaining: pending,
                halted: Some(HaltReason::Offline),
            });
        }

        self.drain_locked(&mut core).await
    }

    /// Upload an image. Not queued: binary payloads are only sent online.
    #[instrument(skip(self, data))]
    pub async fn upload_image(&self, uri: &str, data: bytes::Bytes) -> Result<String, SyncError> {
        if !self.monitor.is_online().await {
            return Err(SyncError::NetworkUnreachable(
                "image upload requires connectivity".to_string(),
            ));
        }
        let image = ImageUpload::from_uri(uri, data);
        Ok(self.api.upload_image(image).await?)
    }

    /// Queued actions in replay order.
    pub async fn pending_actions(&self) -> Result<Vec<QueuedAction>, SyncError> {
        let mut core = self.core.lock().await;
        Ok(core.queue.list()?)
    }

    pub async fn quarantined_actions(&self) -> Result<Vec<QuarantinedAction>, SyncError> {
        let core = self.core.lock().await;
        Ok(core.queue.quarantined()?)
    }

    /// Drain on every offline to online transition of the monitor.
    pub fn spawn_auto_sync(self: &Arc<Self>) -> AutoSync {
        let orchestrator = Arc::clone(self);
        let mut connectivity = self.monitor.subscribe();
        let mut was_online = *connectivity.borrow_and_update();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            orchestrator.update_state(|s| s.is_online = was_online);
            if was_online {
                if let Err(e) = orchestrator.drain_pending().await {
                    error!(error = %e, "Startup drain failed");
                }
            }

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    changed = connectivity.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online = *connectivity.borrow_and_update();
                        orchestrator.update_state(|s| s.is_online = online);
                        if online && !was_online {
                            match orchestrator.drain_pending().await {
                                Ok(report) => debug!(?report, "Reconnect drain finished"),
                                Err(e) => error!(error = %e, "Reconnect drain failed"),
                            }
                        }
                        was_online = online;
                    }
                }
            }
            debug!("Auto sync stopped");
        });

        AutoSync {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn drain_pending(&self) -> Result<DrainReport, SyncError> {
        let mut core = self.core.lock().await;
        if core.queue.is_empty()? {
            return Ok(DrainReport::default());
        }
        self.drain_locked(&mut core).await
    }

    async fn drain_locked(&self, core: &mut SyncCore) -> Result<DrainReport, SyncError> {
        let pending = core.queue.len()?;
        info!(pending, "Drain started");
        self.update_state(|s| s.is_syncing = true);

        let mut guard = DrainGuard {
            state: &self.state,
            core,
            finished: false,
        };
        let core = &mut *guard.core;

        let result = self.replay(core).await;

        let remaining = core.queue.len().unwrap_or(pending);
        if remaining == 0 {
            self.refresh_cache(core).await;
        }

        let report = result.map(|(replayed, halted)| DrainReport {
            replayed,
            remaining,
            halted,
        });
        self.update_state(|s| {
            s.is_syncing = false;
            s.pending_count = remaining;
            match &report {
                Ok(DrainReport {
                    halted: Some(HaltReason::Failed { error, .. }),
                    ..
                }) => s.last_error = Some(error.clone()),
                Ok(_) if remaining == 0 => s.last_error = None,
                Err(e) => s.last_error = Some(e.to_string()),
                Ok(_) => {}
            }
        });

        match &report {
            Ok(r) if r.halted.is_some() => {
                info!(replayed = r.replayed, remaining, "Drain halted")
            }
            Ok(r) => info!(replayed = r.replayed, "Drain finished"),
            Err(e) => error!(error = %e, remaining, "Drain aborted by local storage error"),
        }
        guard.finished = true;
        report
    }

    async fn replay(
        &self,
        core: &mut SyncCore,
    ) -> Result<(usize, Option<HaltReason>), SyncError> {
        let mut connectivity = self.monitor.subscribe();
        connectivity.borrow_and_update();
        let mut replayed = 0;

        loop {
            if connectivity.has_changed().unwrap_or(false) && !*connectivity.borrow_and_update() {
                info!(replayed, "Went offline, stopping drain");
                return Ok((replayed, Some(HaltReason::Offline)));
            }

            let Some(action) = core.queue.peek_oldest()? else {
                return Ok((replayed, None));
            };
            let mutation = action.to_mutation()?;

            match self.apply_remote(&mutation).await {
                Ok(result) => {
                    self.confirm(core, &action, &result)?;
                    replayed += 1;
                }
                Err(ApiError::ServerRejected { status: 404, .. })
                    if action.kind == ActionKind::Delete =>
                {
                    debug!(action_id = %action.id, "Trip already gone, delete confirmed");
                    core.queue.remove_by_id(action.id)?;
                    replayed += 1;
                }
                Err(e) => {
                    let message = e.to_string();
                    let attempts = core.queue.record_failure(action.id, &message)?;
                    if is_poisoned(attempts, self.poison_threshold, &e) {
                        warn!(
                            action_id = %action.id,
                            attempts,
                            retryable = e.is_retryable(),
                            error = %message,
                            "Queued action keeps failing and is blocking the queue"
                        );
                    } else {
                        warn!(action_id = %action.id, attempts, error = %message, "Replay failed");
                    }
                    return Ok((
                        replayed,
                        Some(HaltReason::Failed {
                            action_id: action.id,
                            attempts,
                            error: message,
                        }),
                    ));
                }
            }

            let pending = core.queue.len()?;
            self.update_state(|s| s.pending_count = pending);
        }
    }

    fn confirm(
        &self,
        core: &mut SyncCore,
        action: &QueuedAction,
        result: &WriteResult,
    ) -> Result<(), OutboxError> {
        match (action.kind, &action.local_id, result) {
            (ActionKind::Create, Some(local_id), WriteResult::Saved(trip)) => {
                core.queue.complete_create(action.id, local_id, &trip.id)?;
            }
            _ => {
                core.queue.remove_by_id(action.id)?;
            }
        }
        debug!(action_id = %action.id, "Replayed");
        Ok(())
    }

    fn enqueue_locked(
        &self,
        core: &mut SyncCore,
        mutation: Mutation,
    ) -> Result<WriteOutcome, SyncError> {
        let (action, optimistic) = match mutation {
            Mutation::Create(draft) => {
                let local_id = TripId::generate_local();
                let action = NewAction::from_mutation(
                    &Mutation::Create(draft.clone()),
                    Some(local_id.clone()),
                )?;
                (action, WriteResult::Saved(Trip::from_draft(local_id, draft)))
            }
            Mutation::Update { id, patch } => {
                let cached = core
                    .cache
                    .load()
                    .and_then(|trips| trips.into_iter().find(|trip| trip.id == id));
                let optimistic = match cached {
                    Some(mut trip) => {
                        patch.apply_to(&mut trip);
                        trip
                    }
                    None => Trip::from_patch(id.clone(), &patch),
                };
                let action = NewAction::from_mutation(&Mutation::Update { id, patch }, None)?;
                (action, WriteResult::Saved(optimistic))
            }
            Mutation::Delete { id } => {
                let action = NewAction::from_mutation(&Mutation::Delete { id: id.clone() }, None)?;
                (action, WriteResult::Deleted(id))
            }
        };

        let queued = core.queue.enqueue(action)?;
        let pending = core.queue.len()?;
        self.update_state(|s| s.pending_count = pending);

        Ok(WriteOutcome::Queued {
            action_id: queued.id,
            optimistic,
        })
    }

    async fn apply_remote(&self, mutation: &Mutation) -> Result<WriteResult, ApiError> {
        match mutation {
            Mutation::Create(draft) => self.api.create_trip(draft).await.map(WriteResult::Saved),
            Mutation::Update { id, patch } => self
                .api
                .update_trip(id, patch)
                .await
                .map(WriteResult::Saved),
            Mutation::Delete { id } => self
                .api
                .delete_trip(id)
                .await
                .map(|()| WriteResult::Deleted(id.clone())),
        }
    }

    async fn fetch_and_cache(&self, core: &mut SyncCore) -> Result<Vec<Trip>, ApiError> {
        let trips = self.api.list_trips().await?;
        if let Err(e) = core.cache.save(&trips) {
            error!(error = %e, "Failed to persist trips snapshot");
        }
        Ok(trips)
    }

    /// Replace the snapshot with a fresh `GET /trips`; keep the old one on failure.
    async fn refresh_cache(&self, core: &mut SyncCore) {
        if let Err(e) = self.fetch_and_cache(core).await {
            debug!(error = %e, "Cache refresh skipped");
        }
    }

    fn update_state(&self, apply: impl FnOnce(&mut SyncState)) {
        self.state.send_if_modified(|state| {
            let before = state.clone();
            apply(state);
            *state != before
        });
    }
}

/// Owns the reconnect-drain task; dropping it stops the task.
#[derive(Debug)]
pub struct AutoSync {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl AutoSync {
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for AutoSync {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
