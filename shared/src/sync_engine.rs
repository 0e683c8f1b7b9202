//! Sync Engine: delivers locally persisted journeys and tablet registrations
//! to the remote store, at least once, across arbitrary offline periods.
//!
//! Lifecycle of a journey:
//! * `pending`: saved locally, not yet confirmed remotely.
//! * `synced`: the remote upsert succeeded.
//! * `failed`: the retry budget ran out; only [`SyncEngine::retry_failed`]
//!   brings it back.
//!
//! At most one drain runs at a time per engine. Timer, network-recovery and
//! manual triggers that arrive while one is running return a skipped summary.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::capabilities::{Clock, KvStore, NetworkStateSource};
use crate::config::{ConfigError, SyncConfig};
use crate::event::{DrainTrigger, SkipReason, SyncEvent, SyncSummary};
use crate::journey::JourneyBuilder;
use crate::model::{
    JourneyRecord, LocalId, RemoteId, SyncFieldsUpdate, SyncPayload, SyncQueueEntry, SyncStatus,
    TabletId, TabletInfo,
};
use crate::offline_store::{LocalStore, StoreError, StoreLimits};
use crate::remote::{BatchItem, JourneyFields, RemoteError, RemoteStore};

// --- Metrics ---

#[derive(Debug, Default)]
pub struct SyncMetrics {
    pub journeys_saved: AtomicU64,
    pub immediate_syncs: AtomicU64,
    pub immediate_failures: AtomicU64,
    pub entries_enqueued: AtomicU64,
    pub entries_synced: AtomicU64,
    pub entries_retried: AtomicU64,
    pub entries_exhausted: AtomicU64,
    pub drains_run: AtomicU64,
    pub drains_skipped: AtomicU64,
    pub remote_timeouts: AtomicU64,
    pub store_errors: AtomicU64,
}

impl SyncMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            journeys_saved: self.journeys_saved.load(Ordering::Relaxed),
            immediate_syncs: self.immediate_syncs.load(Ordering::Relaxed),
            immediate_failures: self.immediate_failures.load(Ordering::Relaxed),
            entries_enqueued: self.entries_enqueued.load(Ordering::Relaxed),
            entries_synced: self.entries_synced.load(Ordering::Relaxed),
            entries_retried: self.entries_retried.load(Ordering::Relaxed),
            entries_exhausted: self.entries_exhausted.load(Ordering::Relaxed),
            drains_run: self.drains_run.load(Ordering::Relaxed),
            drains_skipped: self.drains_skipped.load(Ordering::Relaxed),
            remote_timeouts: self.remote_timeouts.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub journeys_saved: u64,
    pub immediate_syncs: u64,
    pub immediate_failures: u64,
    pub entries_enqueued: u64,
    pub entries_synced: u64,
    pub entries_retried: u64,
    pub entries_exhausted: u64,
    pub drains_run: u64,
    pub drains_skipped: u64,
    pub remote_timeouts: u64,
    pub store_errors: u64,
}

// --- Outcomes ---

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaveStatus {
    Synced(RemoteId),
    /// Persisted and waiting in the queue.
    Queued,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveOutcome {
    pub local_id: LocalId,
    pub status: SaveStatus,
}

enum EntryOutcome {
    Delivered,
    Failed { exhausted: bool },
    Missing,
}

/// Held for the lifetime of one drain; releases the flag on drop, including
/// when the drain bails out with a store error.
struct DrainGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> DrainGuard<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

// --- Engine ---

struct Inner {
    store: Arc<LocalStore>,
    remote: Arc<dyn RemoteStore>,
    network: Arc<dyn NetworkStateSource>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
    draining: AtomicBool,
    events: broadcast::Sender<SyncEvent>,
    metrics: SyncMetrics,
}

/// Owned by the composition root and passed by handle to whatever needs to
/// save journeys or trigger a sync. Clones share all state.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<LocalStore>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<dyn NetworkStateSource>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let (events, _) = broadcast::channel(config.event_capacity);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                remote,
                network,
                clock,
                config,
                draining: AtomicBool::new(false),
                events,
                metrics: SyncMetrics::default(),
            }),
        })
    }

    /// Builds the Local Store over `kv` and provisions the tablet identity.
    #[instrument(skip_all)]
    pub async fn open(
        kv: Arc<dyn KvStore>,
        remote: Arc<dyn RemoteStore>,
        network: Arc<dyn NetworkStateSource>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Result<Self, crate::Error> {
        config.validate()?;
        let store = LocalStore::new(kv, clock.clone(), StoreLimits::from(&config))?;
        let identity = store.get_or_create_tablet_identity().await?;
        info!(tablet_id = %identity.tablet_id, "Sync engine opened");
        Ok(Self::new(Arc::new(store), remote, network, clock, config)?)
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn is_online(&self) -> bool {
        self.inner.network.is_online()
    }

    pub fn is_syncing(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    pub fn journey_builder(&self) -> JourneyBuilder {
        JourneyBuilder::new(self.inner.clock.clone())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub async fn tablet_id(&self) -> Result<TabletId, StoreError> {
        Ok(self
            .inner
            .store
            .get_or_create_tablet_identity()
            .await?
            .tablet_id)
    }

    // --- Write path ---

    /// Persists `record` as pending, then tries an immediate upsert when
    /// online. Only local persistence failures are returned as errors.
    #[instrument(skip(self, record), fields(local_id = %record.local_id))]
    pub async fn save_journey(&self, record: &JourneyRecord) -> Result<SaveOutcome, StoreError> {
        let mut record = record.clone();
        record.sync_status = SyncStatus::Pending;

        let store = &self.inner.store;
        let stored = store
            .save_journey(&record)
            .await
            .map_err(|e| self.store_failure(e))?;
        SyncMetrics::incr(&self.inner.metrics.journeys_saved);
        self.emit(SyncEvent::JourneySaved {
            local_id: record.local_id.clone(),
        });

        let local_id = record.local_id.clone();
        if !self.is_online() {
            self.queue_journey(&local_id, "offline").await?;
            return Ok(SaveOutcome {
                local_id,
                status: SaveStatus::Queued,
            });
        }

        let tablet_id = self.tablet_id().await?;
        let attempts = stored.sync_attempts.saturating_add(1);
        match self.upsert_remote(&tablet_id, &stored).await {
            Ok(remote_id) => {
                SyncMetrics::incr(&self.inner.metrics.immediate_syncs);
                let current = self.mark_synced(&stored, remote_id.clone(), attempts).await?;
                store.dequeue(&journey_key(&local_id)).await?;
                if !current {
                    self.queue_journey(&local_id, SUPERSEDED).await?;
                }
                Ok(SaveOutcome {
                    local_id,
                    status: SaveStatus::Synced(remote_id),
                })
            }
            Err(e) => {
                warn!(error = %e, "Immediate sync failed, queueing");
                SyncMetrics::incr(&self.inner.metrics.immediate_failures);
                self.mark_attempt_failed(&stored, SyncStatus::Pending, attempts, e.to_string())
                    .await?;
                self.queue_journey(&local_id, &e.message).await?;
                Ok(SaveOutcome {
                    local_id,
                    status: SaveStatus::Queued,
                })
            }
        }
    }

    /// Stores the tablet info and registers it remotely, immediately when
    /// online and through the queue otherwise.
    #[instrument(skip(self, name))]
    pub async fn register_tablet(&self, name: Option<&str>) -> Result<TabletInfo, StoreError> {
        let store = &self.inner.store;
        let tablet_id = self.tablet_id().await?;
        let mut info = store
            .tablet_info()
            .await?
            .unwrap_or_else(|| TabletInfo::unregistered(tablet_id.clone(), None));
        if let Some(name) = name {
            info.name = Some(name.to_string());
        }
        store
            .set_tablet_info(&info)
            .await
            .map_err(|e| self.store_failure(e))?;

        let payload = SyncPayload::TabletRegistration {
            tablet_id: tablet_id.clone(),
            name: info.name.clone(),
        };

        if self.is_online() {
            let name = info.name.clone();
            let call = self
                .inner
                .remote
                .register_or_touch_tablet(&tablet_id, name.as_deref());
            match self.with_timeout(call).await {
                Ok(remote_id) => {
                    let info = self.apply_registration(info, remote_id).await?;
                    store.dequeue(&payload.key()).await?;
                    return Ok(info);
                }
                Err(e) => warn!(error = %e, "Tablet registration failed, queueing"),
            }
        }

        if store.enqueue(payload).await? {
            SyncMetrics::incr(&self.inner.metrics.entries_enqueued);
        }
        Ok(info)
    }

    // --- Drains ---

    /// Manual redrive from the operator.
    pub async fn sync_now(&self) -> Result<SyncSummary, StoreError> {
        self.process_queue(DrainTrigger::Manual).await
    }

    /// One pass over the queue in enqueue order. Each entry's outcome is
    /// independent of the others.
    #[instrument(skip(self))]
    pub async fn process_queue(&self, trigger: DrainTrigger) -> Result<SyncSummary, StoreError> {
        if !self.is_online() {
            SyncMetrics::incr(&self.inner.metrics.drains_skipped);
            debug!("Offline, drain skipped");
            return Ok(SyncSummary::skipped(SkipReason::Offline));
        }
        let Some(_guard) = DrainGuard::try_acquire(&self.inner.draining) else {
            SyncMetrics::incr(&self.inner.metrics.drains_skipped);
            debug!("Drain already running");
            return Ok(SyncSummary::skipped(SkipReason::AlreadyRunning));
        };

        let store = &self.inner.store;
        let tablet_id = self.tablet_id().await?;
        let queue = store.list_queue().await?;
        let now = self.inner.clock.now();
        let mut summary = SyncSummary::default();

        for entry in queue {
            if trigger == DrainTrigger::Background && !entry.is_due(now) {
                summary.deferred += 1;
                continue;
            }
            match self.drain_entry(&tablet_id, &entry).await? {
                EntryOutcome::Delivered => {
                    summary.total += 1;
                    summary.succeeded += 1;
                }
                EntryOutcome::Failed { exhausted } => {
                    summary.total += 1;
                    summary.failed += 1;
                    if exhausted {
                        summary.exhausted += 1;
                    }
                }
                EntryOutcome::Missing => {}
            }
        }

        store.set_last_sync_timestamp(self.inner.clock.now()).await?;
        SyncMetrics::incr(&self.inner.metrics.drains_run);
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            deferred = summary.deferred,
            "Drain completed"
        );
        self.emit(SyncEvent::DrainCompleted {
            trigger,
            summary: summary.clone(),
        });
        Ok(summary)
    }

    /// Puts every failed journey back in the queue with a fresh budget.
    #[instrument(skip(self))]
    pub async fn retry_failed(&self) -> Result<usize, StoreError> {
        let store = &self.inner.store;
        let failed = store.get_journeys_by_sync_status(SyncStatus::Failed).await?;
        let reset = SyncFieldsUpdate {
            sync_status: Some(SyncStatus::Pending),
            ..Default::default()
        };

        let mut requeued = 0;
        for journey in failed {
            store
                .update_journey_sync_fields(&journey.local_id, &reset)
                .await?;
            self.queue_journey(&journey.local_id, "manual retry").await?;
            requeued += 1;
        }
        info!(requeued, "Failed journeys requeued");
        Ok(requeued)
    }

    /// Sends the newest revision of every unsynced journey through the
    /// batch endpoint. Shares the drain guard with [`Self::process_queue`].
    #[instrument(skip(self))]
    pub async fn bulk_resync(&self) -> Result<SyncSummary, StoreError> {
        if !self.is_online() {
            return Ok(SyncSummary::skipped(SkipReason::Offline));
        }
        let Some(_guard) = DrainGuard::try_acquire(&self.inner.draining) else {
            return Ok(SyncSummary::skipped(SkipReason::AlreadyRunning));
        };

        let store = &self.inner.store;
        let tablet_id = self.tablet_id().await?;
        let mut unsynced = store.latest_journeys().await?;
        unsynced.retain(|j| j.sync_status != SyncStatus::Synced);

        let mut summary = SyncSummary::default();
        for chunk in unsynced.chunks(self.inner.config.batch_size) {
            summary.total += chunk.len() as u32;
            let by_id: HashMap<&LocalId, &JourneyRecord> =
                chunk.iter().map(|j| (&j.local_id, j)).collect();
            let items: Vec<BatchItem> = chunk
                .iter()
                .map(|j| BatchItem {
                    local_id: j.local_id.clone(),
                    fields: JourneyFields::from(j),
                })
                .collect();

            let call = self.inner.remote.batch_upsert_journeys(&tablet_id, &items);
            let outcome = match self.with_timeout(call).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(error = %e, items = chunk.len(), "Batch upsert failed");
                    for journey in chunk {
                        let attempts = self.next_attempt(journey).await?;
                        self.mark_attempt_failed(
                            journey,
                            journey.sync_status,
                            attempts,
                            e.to_string(),
                        )
                        .await?;
                    }
                    summary.failed += chunk.len() as u32;
                    continue;
                }
            };

            for (local_id, remote_id) in outcome.upserted {
                let Some(journey) = by_id.get(&local_id) else {
                    warn!(%local_id, "Batch reported an item that was not sent");
                    continue;
                };
                let attempts = self.next_attempt(journey).await?;
                let current = self.mark_synced(journey, remote_id, attempts).await?;
                store.dequeue(&journey_key(&local_id)).await?;
                if !current {
                    self.queue_journey(&local_id, SUPERSEDED).await?;
                }
                summary.succeeded += 1;
            }
            for (local_id, reason) in outcome.failed_ids.iter().zip(outcome.errors.iter()) {
                if let Some(journey) = by_id.get(local_id) {
                    let attempts = self.next_attempt(journey).await?;
                    self.mark_attempt_failed(journey, journey.sync_status, attempts, reason.clone())
                        .await?;
                }
                summary.failed += 1;
            }
        }

        store.set_last_sync_timestamp(self.inner.clock.now()).await?;
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Bulk resync completed"
        );
        self.emit(SyncEvent::DrainCompleted {
            trigger: DrainTrigger::Manual,
            summary: summary.clone(),
        });
        Ok(summary)
    }

    // --- Background ---

    /// Starts the periodic timer and the offline-to-online redrive on the
    /// current tokio runtime.
    pub fn spawn_background(&self) -> BackgroundSync {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let engine = self.clone();
        let handle = tokio::spawn(async move { engine.run_background(shutdown_rx).await });
        BackgroundSync {
            shutdown: shutdown_tx,
            handle,
        }
    }

    async fn run_background(self, mut shutdown: watch::Receiver<bool>) {
        let period = self.inner.config.sync_interval();
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut network = self.inner.network.subscribe();
        let mut was_online = *network.borrow_and_update();
        let mut network_open = true;
        info!(interval_ms = self.inner.config.sync_interval_ms, "Background sync started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.inner.store.list_queue().await {
                        Ok(queue) if queue.is_empty() => continue,
                        Ok(_) => self.run_drain(DrainTrigger::Background).await,
                        Err(e) => error!(error = %e, "Could not inspect sync queue"),
                    }
                }
                changed = network.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        continue;
                    }
                    let online = *network.borrow_and_update();
                    let recovered = online && !was_online;
                    was_online = online;
                    if recovered {
                        info!("Network recovered, draining queue");
                        self.run_drain(DrainTrigger::NetworkRecovered).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        info!("Background sync stopped");
    }

    async fn run_drain(&self, trigger: DrainTrigger) {
        if let Err(e) = self.process_queue(trigger).await {
            error!(error = %e, ?trigger, "Drain aborted");
        }
    }

    // --- Internals ---

    async fn drain_entry(
        &self,
        tablet_id: &TabletId,
        entry: &SyncQueueEntry,
    ) -> Result<EntryOutcome, StoreError> {
        match &entry.payload {
            SyncPayload::Journey { local_id } => self.drain_journey(tablet_id, entry, local_id).await,
            SyncPayload::TabletRegistration { tablet_id, name } => {
                self.drain_tablet(entry, tablet_id, name.as_deref()).await
            }
        }
    }

    async fn drain_journey(
        &self,
        tablet_id: &TabletId,
        entry: &SyncQueueEntry,
        local_id: &LocalId,
    ) -> Result<EntryOutcome, StoreError> {
        let store = &self.inner.store;
        let Some(record) = store.latest_journey(local_id).await? else {
            warn!(%local_id, "Queued journey has no local record, dropping entry");
            store.dequeue(&entry.key()).await?;
            return Ok(EntryOutcome::Missing);
        };

        let attempts = record.sync_attempts.saturating_add(1);
        match self.upsert_remote(tablet_id, &record).await {
            Ok(remote_id) => {
                let current = self.mark_synced(&record, remote_id, attempts).await?;
                store.dequeue(&entry.key()).await?;
                if !current {
                    self.queue_journey(local_id, SUPERSEDED).await?;
                }
                SyncMetrics::incr(&self.inner.metrics.entries_synced);
                Ok(EntryOutcome::Delivered)
            }
            Err(e) => {
                let exhausted = self.requeue_or_exhaust(entry, &e).await?;
                let status = if exhausted {
                    SyncStatus::Failed
                } else {
                    SyncStatus::Pending
                };
                let current = self
                    .mark_attempt_failed(&record, status, attempts, e.to_string())
                    .await?;
                if !current {
                    // The newer revision has not been tried yet.
                    self.queue_journey(local_id, SUPERSEDED).await?;
                } else if exhausted {
                    self.emit(SyncEvent::JourneyFailed {
                        local_id: local_id.clone(),
                        error: e.to_string(),
                    });
                }
                Ok(EntryOutcome::Failed { exhausted })
            }
        }
    }

    async fn drain_tablet(
        &self,
        entry: &SyncQueueEntry,
        tablet_id: &TabletId,
        queued_name: Option<&str>,
    ) -> Result<EntryOutcome, StoreError> {
        let store = &self.inner.store;
        let info = store
            .tablet_info()
            .await?
            .unwrap_or_else(|| TabletInfo::unregistered(tablet_id.clone(), None));
        // The stored name wins over the one captured at enqueue time.
        let name = info.name.as_deref().or(queued_name).map(str::to_string);

        let call = self
            .inner
            .remote
            .register_or_touch_tablet(tablet_id, name.as_deref());
        match self.with_timeout(call).await {
            Ok(remote_id) => {
                self.apply_registration(info, remote_id).await?;
                store.dequeue(&entry.key()).await?;
                SyncMetrics::incr(&self.inner.metrics.entries_synced);
                Ok(EntryOutcome::Delivered)
            }
            Err(e) => {
                let exhausted = self.requeue_or_exhaust(entry, &e).await?;
                Ok(EntryOutcome::Failed { exhausted })
            }
        }
    }

    /// Charges one attempt to `entry`. Returns `true` when the budget is
    /// spent and the entry was dropped from the queue.
    async fn requeue_or_exhaust(
        &self,
        entry: &SyncQueueEntry,
        error: &RemoteError,
    ) -> Result<bool, StoreError> {
        let config = &self.inner.config;
        let mut entry = entry.clone();
        entry.retry_count = entry.retry_count.saturating_add(1);
        entry.last_error = Some(error.to_string());

        let exhausted = entry.retry_count >= config.max_retries
            || (config.fail_fast_on_rejection && !error.is_retryable());

        if exhausted {
            warn!(
                key = %entry.key(),
                retry_count = entry.retry_count,
                error = %error,
                "Retry budget exhausted"
            );
            self.inner.store.dequeue(&entry.key()).await?;
            SyncMetrics::incr(&self.inner.metrics.entries_exhausted);
        } else {
            let delay = config.backoff_ms(entry.retry_count);
            entry.next_attempt_at = self.inner.clock.now().add_millis(delay);
            warn!(
                key = %entry.key(),
                retry_count = entry.retry_count,
                backoff_ms = delay,
                error = %error,
                "Delivery failed, will retry"
            );
            self.inner.store.update_queue_entry(&entry).await?;
            SyncMetrics::incr(&self.inner.metrics.entries_retried);
        }
        Ok(exhausted)
    }

    async fn upsert_remote(
        &self,
        tablet_id: &TabletId,
        record: &JourneyRecord,
    ) -> Result<RemoteId, RemoteError> {
        let fields = JourneyFields::from(record);
        let call = self
            .inner
            .remote
            .upsert_journey(tablet_id, &record.local_id, &fields);
        self.with_timeout(call).await
    }

    async fn with_timeout<T, F>(&self, call: F) -> Result<T, RemoteError>
    where
        F: Future<Output = Result<T, RemoteError>>,
    {
        let limit = self.inner.config.remote_timeout();
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => {
                SyncMetrics::incr(&self.inner.metrics.remote_timeouts);
                Err(RemoteError::timeout(limit))
            }
        }
    }

    /// Records the delivery of `sent`. Returns `false` when a newer revision
    /// was saved while the call was in flight.
    async fn mark_synced(
        &self,
        sent: &JourneyRecord,
        remote_id: RemoteId,
        attempts: u32,
    ) -> Result<bool, StoreError> {
        let local_id = &sent.local_id;
        let update = SyncFieldsUpdate::synced(self.inner.clock.now(), remote_id.clone(), attempts);
        let newest = self
            .inner
            .store
            .update_sync_fields_through(local_id, sent.revision, &update)
            .await?;
        info!(%local_id, %remote_id, revision = sent.revision, "Journey synced");
        self.emit(SyncEvent::JourneySynced {
            local_id: local_id.clone(),
            remote_id,
        });
        Ok(is_current(sent, newest))
    }

    /// Records a failed delivery of `sent`, with the same return as
    /// [`Self::mark_synced`].
    async fn mark_attempt_failed(
        &self,
        sent: &JourneyRecord,
        status: SyncStatus,
        attempts: u32,
        error: String,
    ) -> Result<bool, StoreError> {
        let update = SyncFieldsUpdate::attempt_failed(status, attempts, error);
        let newest = self
            .inner
            .store
            .update_sync_fields_through(&sent.local_id, sent.revision, &update)
            .await?;
        Ok(is_current(sent, newest))
    }

    /// Attempt number for another try at `journey`, counted from what is
    /// stored now rather than from an earlier snapshot.
    async fn next_attempt(&self, journey: &JourneyRecord) -> Result<u32, StoreError> {
        let stored = self.inner.store.latest_journey(&journey.local_id).await?;
        let attempts = stored.map_or(journey.sync_attempts, |j| {
            j.sync_attempts.max(journey.sync_attempts)
        });
        Ok(attempts.saturating_add(1))
    }

    async fn apply_registration(
        &self,
        mut info: TabletInfo,
        remote_id: RemoteId,
    ) -> Result<TabletInfo, StoreError> {
        let now = self.inner.clock.now();
        info.remote_id = Some(remote_id.clone());
        info.registered_at.get_or_insert(now);
        info.last_seen_at = Some(now);
        self.inner.store.set_tablet_info(&info).await?;
        info!(tablet_id = %info.tablet_id, %remote_id, "Tablet registered");
        self.emit(SyncEvent::TabletRegistered {
            tablet_id: info.tablet_id.clone(),
            remote_id,
        });
        Ok(info)
    }

    async fn queue_journey(&self, local_id: &LocalId, reason: &str) -> Result<(), StoreError> {
        let added = self
            .inner
            .store
            .enqueue_journey(local_id)
            .await
            .map_err(|e| self.store_failure(e))?;
        if added {
            SyncMetrics::incr(&self.inner.metrics.entries_enqueued);
            self.emit(SyncEvent::JourneyQueued {
                local_id: local_id.clone(),
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    fn store_failure(&self, e: StoreError) -> StoreError {
        error!(error = %e, "Local persistence failed");
        SyncMetrics::incr(&self.inner.metrics.store_errors);
        e
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.inner.events.send(event);
    }
}

const SUPERSEDED: &str = "newer revision saved during sync";

fn is_current(sent: &JourneyRecord, newest: Option<u32>) -> bool {
    !newest.is_some_and(|n| n > sent.revision)
}

fn journey_key(local_id: &LocalId) -> String {
    SyncPayload::Journey {
        local_id: local_id.clone(),
    }
    .key()
}

/// Handle to the background task started by [`SyncEngine::spawn_background`].
pub struct BackgroundSync {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundSync {
    /// Stops the task. A drain already in flight finishes first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.handle.await {
            error!(error = %e, "Background sync task panicked");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}
