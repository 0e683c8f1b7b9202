//! Local Store: durable device persistence for the tablet identity, the
//! journey list, the sync queue and the last-sync timestamp.
//!
//! Each logical value lives under its own [`KvKey`] as a CBOR envelope
//! (`magic | schema_version | blake3 checksum | payload`), optionally sealed
//! by a [`CryptoProvider`] with AAD bound to the key and the tablet.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument};

use crate::capabilities::{Clock, KeyNamespace, KvError, KvKey, KvStore};
use crate::config::SyncConfig;
use crate::crypto::{build_aad, CryptoError, CryptoProvider};
use crate::model::{
    JourneyRecord, LocalId, SyncFieldsUpdate, SyncPayload, SyncQueueEntry, SyncStatus,
    TabletIdentity, TabletInfo, UnixTimeMs,
};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const STORE_MAGIC: &[u8; 4] = b"JSST";
const APP_NAMESPACE: &str = "journey-sync";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("device storage error: {0}")]
    Kv(#[from] KvError),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("corrupted value at {key}: {reason}")]
    Corrupted { key: String, reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("too many journeys: {count}, max {max}")]
    TooManyJourneys { count: usize, max: usize },

    #[error("too many queue entries: {count}, max {max}")]
    TooManyQueueEntries { count: usize, max: usize },
}

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    #[serde(with = "serde_bytes")]
    payload: Vec<u8>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StoreLimits {
    pub max_journeys: usize,
    pub max_queue_entries: usize,
}

impl From<&SyncConfig> for StoreLimits {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_journeys: config.max_journeys,
            max_queue_entries: config.max_queue_entries,
        }
    }
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

/// Distinct journeys per sync status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JourneyCounts {
    pub pending: usize,
    pub synced: usize,
    pub failed: usize,
}

struct Keys {
    identity: KvKey,
    info: KvKey,
    journeys: KvKey,
    queue: KvKey,
    last_sync: KvKey,
}

impl Keys {
    fn new() -> Result<Self, KvError> {
        Ok(Self {
            identity: KvKey::new(KeyNamespace::Tablet, "identity")?,
            info: KvKey::new(KeyNamespace::Tablet, "info")?,
            journeys: KvKey::new(KeyNamespace::Journeys, "all")?,
            queue: KvKey::new(KeyNamespace::Sync, "queue")?,
            last_sync: KvKey::new(KeyNamespace::Sync, "last_sync")?,
        })
    }
}

pub struct LocalStore {
    kv: Arc<dyn KvStore>,
    sealer: Option<Arc<dyn CryptoProvider>>,
    clock: Arc<dyn Clock>,
    limits: StoreLimits,
    keys: Keys,
    // Serializes read-modify-write cycles on the journey list and queue.
    write_lock: Mutex<()>,
    identity: Mutex<Option<TabletIdentity>>,
}

impl LocalStore {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        limits: StoreLimits,
    ) -> Result<Self, StoreError> {
        Ok(Self {
            kv,
            sealer: None,
            clock,
            limits,
            keys: Keys::new()?,
            write_lock: Mutex::new(()),
            identity: Mutex::new(None),
        })
    }

    /// Seals every value written from now on.
    pub fn with_sealer(mut self, sealer: Arc<dyn CryptoProvider>) -> Self {
        self.sealer = Some(sealer);
        self
    }

    pub fn limits(&self) -> StoreLimits {
        self.limits
    }

    // --- Tablet ---

    #[instrument(skip(self))]
    pub async fn get_or_create_tablet_identity(&self) -> Result<TabletIdentity, StoreError> {
        let mut cached = self.identity.lock().await;
        if let Some(identity) = cached.as_ref() {
            return Ok(identity.clone());
        }

        let identity = match self.read::<TabletIdentity>(&self.keys.identity, None).await? {
            Some(identity) => identity,
            None => {
                let identity = TabletIdentity {
                    tablet_id: crate::model::TabletId::generate(),
                    created_at: self.clock.now(),
                };
                self.write(&self.keys.identity, &identity, None).await?;
                info!(tablet_id = %identity.tablet_id, "Created tablet identity");
                identity
            }
        };

        *cached = Some(identity.clone());
        Ok(identity)
    }

    pub async fn tablet_info(&self) -> Result<Option<TabletInfo>, StoreError> {
        let scope = self.scope().await?;
        self.read(&self.keys.info, Some(&scope)).await
    }

    pub async fn set_tablet_info(&self, info: &TabletInfo) -> Result<(), StoreError> {
        let scope = self.scope().await?;
        let _guard = self.write_lock.lock().await;
        self.write(&self.keys.info, info, Some(&scope)).await
    }

    // --- Journeys ---

    /// Appends a revision and returns it as stored. Earlier revisions with
    /// the same id are kept.
    ///
    /// The stored copy gets the next revision number, and carries the
    /// attempt count and remote id of the revision before it, whatever the
    /// caller passed.
    #[instrument(skip(self, record), fields(local_id = %record.local_id))]
    pub async fn save_journey(&self, record: &JourneyRecord) -> Result<JourneyRecord, StoreError> {
        let scope = self.scope().await?;
        let _guard = self.write_lock.lock().await;

        let mut journeys = self.load_journeys(&scope).await?;
        if journeys.len() >= self.limits.max_journeys {
            return Err(StoreError::TooManyJourneys {
                count: journeys.len() + 1,
                max: self.limits.max_journeys,
            });
        }

        let mut stored = record.clone();
        match journeys.iter().rev().find(|j| j.local_id == record.local_id) {
            Some(previous) => {
                stored.revision = previous.revision.saturating_add(1);
                stored.sync_attempts = previous.sync_attempts;
                stored.remote_id = previous.remote_id.clone();
            }
            None => stored.revision = 1,
        }
        journeys.push(stored.clone());
        self.write(&self.keys.journeys, &journeys, Some(&scope)).await?;
        debug!(revision = stored.revision, "Journey revision appended");
        Ok(stored)
    }

    /// Every stored revision in append order.
    pub async fn get_all_journeys(&self) -> Result<Vec<JourneyRecord>, StoreError> {
        let scope = self.scope().await?;
        self.load_journeys(&scope).await
    }

    /// Newest revision of each journey, in first-saved order.
    pub async fn latest_journeys(&self) -> Result<Vec<JourneyRecord>, StoreError> {
        Ok(collapse_revisions(self.get_all_journeys().await?))
    }

    pub async fn get_journeys_by_sync_status(
        &self,
        status: SyncStatus,
    ) -> Result<Vec<JourneyRecord>, StoreError> {
        let mut journeys = self.latest_journeys().await?;
        journeys.retain(|j| j.sync_status == status);
        Ok(journeys)
    }

    pub async fn latest_journey(
        &self,
        local_id: &LocalId,
    ) -> Result<Option<JourneyRecord>, StoreError> {
        let journeys = self.get_all_journeys().await?;
        Ok(journeys.into_iter().rev().find(|j| &j.local_id == local_id))
    }

    /// Merges sync bookkeeping into every revision of `local_id`. Returns
    /// `false` when no revision matched.
    pub async fn update_journey_sync_fields(
        &self,
        local_id: &LocalId,
        update: &SyncFieldsUpdate,
    ) -> Result<bool, StoreError> {
        Ok(self
            .update_sync_fields_through(local_id, u32::MAX, update)
            .await?
            .is_some())
    }

    /// Merges `update` into the revisions of `local_id` numbered up to
    /// `revision`. Newer revisions only take the attempt count, since the
    /// outcome being recorded is not theirs.
    ///
    /// Returns the newest stored revision number, or `None` when no
    /// revision matched.
    #[instrument(skip(self, update), fields(local_id = %local_id))]
    pub async fn update_sync_fields_through(
        &self,
        local_id: &LocalId,
        revision: u32,
        update: &SyncFieldsUpdate,
    ) -> Result<Option<u32>, StoreError> {
        let scope = self.scope().await?;
        let _guard = self.write_lock.lock().await;

        let attempts_only = SyncFieldsUpdate {
            sync_attempts: update.sync_attempts,
            ..Default::default()
        };
        let mut journeys = self.load_journeys(&scope).await?;
        let mut newest = None;
        for journey in journeys.iter_mut().filter(|j| &j.local_id == local_id) {
            if journey.revision <= revision {
                journey.apply_sync_fields(update);
            } else {
                journey.apply_sync_fields(&attempts_only);
            }
            newest = newest.max(Some(journey.revision));
        }
        if newest.is_some() {
            self.write(&self.keys.journeys, &journeys, Some(&scope)).await?;
        }
        Ok(newest)
    }

    pub async fn journey_counts(&self) -> Result<JourneyCounts, StoreError> {
        let mut counts = JourneyCounts::default();
        for journey in self.latest_journeys().await? {
            match journey.sync_status {
                SyncStatus::Pending => counts.pending += 1,
                SyncStatus::Synced => counts.synced += 1,
                SyncStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    // --- Queue ---

    /// Adds a queue entry unless one with the same payload key exists.
    #[instrument(skip(self), fields(key = %payload.key()))]
    pub async fn enqueue(&self, payload: SyncPayload) -> Result<bool, StoreError> {
        let scope = self.scope().await?;
        let _guard = self.write_lock.lock().await;

        let mut queue = self.load_queue(&scope).await?;
        let key = payload.key();
        if queue.iter().any(|e| e.key() == key) {
            return Ok(false);
        }
        if queue.len() >= self.limits.max_queue_entries {
            return Err(StoreError::TooManyQueueEntries {
                count: queue.len() + 1,
                max: self.limits.max_queue_entries,
            });
        }
        queue.push(SyncQueueEntry::new(payload, self.clock.now()));
        self.write(&self.keys.queue, &queue, Some(&scope)).await?;
        Ok(true)
    }

    pub async fn enqueue_journey(&self, local_id: &LocalId) -> Result<bool, StoreError> {
        self.enqueue(SyncPayload::Journey {
            local_id: local_id.clone(),
        })
        .await
    }

    pub async fn dequeue(&self, key: &str) -> Result<Option<SyncQueueEntry>, StoreError> {
        let scope = self.scope().await?;
        let _guard = self.write_lock.lock().await;

        let mut queue = self.load_queue(&scope).await?;
        let Some(pos) = queue.iter().position(|e| e.key() == key) else {
            return Ok(None);
        };
        let removed = queue.remove(pos);
        self.write(&self.keys.queue, &queue, Some(&scope)).await?;
        Ok(Some(removed))
    }

    /// Replaces the stored entry with the same key, keeping its position.
    pub async fn update_queue_entry(&self, entry: &SyncQueueEntry) -> Result<bool, StoreError> {
        let scope = self.scope().await?;
        let _guard = self.write_lock.lock().await;

        let mut queue = self.load_queue(&scope).await?;
        let key = entry.key();
        let Some(slot) = queue.iter_mut().find(|e| e.key() == key) else {
            return Ok(false);
        };
        *slot = entry.clone();
        self.write(&self.keys.queue, &queue, Some(&scope)).await?;
        Ok(true)
    }

    pub async fn list_queue(&self) -> Result<Vec<SyncQueueEntry>, StoreError> {
        let scope = self.scope().await?;
        self.load_queue(&scope).await
    }

    // --- Last sync ---

    pub async fn set_last_sync_timestamp(&self, at: UnixTimeMs) -> Result<(), StoreError> {
        let scope = self.scope().await?;
        self.write(&self.keys.last_sync, &at, Some(&scope)).await
    }

    pub async fn get_last_sync_timestamp(&self) -> Result<Option<UnixTimeMs>, StoreError> {
        let scope = self.scope().await?;
        self.read(&self.keys.last_sync, Some(&scope)).await
    }

    /// Wipes everything, identity included. The next access provisions a
    /// new tablet id.
    #[instrument(skip(self))]
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut cached = self.identity.lock().await;
        self.kv.clear().await?;
        *cached = None;
        info!("Local store cleared");
        Ok(())
    }

    // --- Internals ---

    async fn scope(&self) -> Result<String, StoreError> {
        Ok(self
            .get_or_create_tablet_identity()
            .await?
            .tablet_id
            .to_string())
    }

    async fn load_journeys(&self, scope: &str) -> Result<Vec<JourneyRecord>, StoreError> {
        Ok(self
            .read(&self.keys.journeys, Some(scope))
            .await?
            .unwrap_or_default())
    }

    async fn load_queue(&self, scope: &str) -> Result<Vec<SyncQueueEntry>, StoreError> {
        Ok(self
            .read(&self.keys.queue, Some(scope))
            .await?
            .unwrap_or_default())
    }

    async fn read<T: DeserializeOwned>(
        &self,
        key: &KvKey,
        scope: Option<&str>,
    ) -> Result<Option<T>, StoreError> {
        let Some(stored) = self.kv.get(key).await? else {
            return Ok(None);
        };
        let envelope_bytes = match &self.sealer {
            Some(sealer) => sealer.decrypt(&stored, &self.aad(key, scope)?)?,
            None => stored,
        };
        let payload = open_envelope(&key.raw(), &envelope_bytes)?;
        Ok(Some(ciborium::from_reader(&payload[..])?))
    }

    async fn write<T: Serialize + ?Sized>(
        &self,
        key: &KvKey,
        value: &T,
        scope: Option<&str>,
    ) -> Result<(), StoreError> {
        let envelope_bytes = seal_envelope(value)?;
        let stored = match &self.sealer {
            Some(sealer) => sealer.encrypt(&envelope_bytes, &self.aad(key, scope)?)?,
            None => envelope_bytes,
        };
        self.kv.set(key, stored).await.map_err(|e| {
            error!(key = %key.raw(), error = %e, "Local store write failed");
            StoreError::Kv(e)
        })
    }

    fn aad(&self, key: &KvKey, scope: Option<&str>) -> Result<Vec<u8>, StoreError> {
        Ok(build_aad(
            APP_NAMESPACE,
            &key.raw(),
            CURRENT_SCHEMA_VERSION,
            scope,
        )?)
    }
}

fn seal_envelope<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *blake3::hash(&payload).as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;
    Ok(bytes)
}

fn open_envelope(key: &str, bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    if bytes.is_empty() {
        return Err(StoreError::Corrupted {
            key: key.to_string(),
            reason: "empty value",
        });
    }

    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            key: key.to_string(),
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    Ok(envelope.payload)
}

fn collapse_revisions(journeys: Vec<JourneyRecord>) -> Vec<JourneyRecord> {
    let mut order: Vec<LocalId> = Vec::new();
    let mut latest: HashMap<LocalId, JourneyRecord> = HashMap::new();
    for journey in journeys {
        if !latest.contains_key(&journey.local_id) {
            order.push(journey.local_id.clone());
        }
        latest.insert(journey.local_id.clone(), journey);
    }
    order
        .into_iter()
        .filter_map(|id| latest.remove(&id))
        .collect()
}
