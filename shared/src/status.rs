use serde::Serialize;

use crate::model::UnixTimeMs;
use crate::offline_store::StoreError;
use crate::sync_engine::SyncEngine;

/// Point-in-time sync state for the kiosk's status badge.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub pending_count: usize,
    pub failed_count: usize,
    pub synced_count: usize,
    pub queue_length: usize,
    pub last_sync_time: Option<UnixTimeMs>,
    pub tablet_registered: bool,
}

/// Read-only view over an engine. Polling it has no side effects.
#[derive(Clone)]
pub struct StatusReporter {
    engine: SyncEngine,
}

impl StatusReporter {
    pub fn new(engine: SyncEngine) -> Self {
        Self { engine }
    }

    pub async fn snapshot(&self) -> Result<StatusSnapshot, StoreError> {
        let store = self.engine.store();
        let counts = store.journey_counts().await?;
        let queue_length = store.list_queue().await?.len();
        let last_sync_time = store.get_last_sync_timestamp().await?;
        let tablet_registered = store
            .tablet_info()
            .await?
            .is_some_and(|info| info.is_registered());

        Ok(StatusSnapshot {
            is_online: self.engine.is_online(),
            sync_in_progress: self.engine.is_syncing(),
            pending_count: counts.pending,
            failed_count: counts.failed,
            synced_count: counts.synced,
            queue_length,
            last_sync_time,
            tablet_registered,
        })
    }
}
