use serde::{Deserialize, Serialize};

use crate::model::{LocalId, RemoteId, TabletId};

/// What started a drain pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrainTrigger {
    /// Periodic timer. Entries still inside their backoff window are deferred.
    Background,
    NetworkRecovered,
    Manual,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Offline,
    AlreadyRunning,
}

/// Result of one drain or resync pass, shown to the operator after a
/// manual sync.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    pub succeeded: u32,
    pub failed: u32,
    /// Entries attempted in this pass.
    pub total: u32,
    /// Failures that used up the retry budget and were marked failed.
    pub exhausted: u32,
    /// Entries left alone because their backoff had not elapsed.
    pub deferred: u32,
    pub skipped: Option<SkipReason>,
}

impl SyncSummary {
    pub fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Default::default()
        }
    }

    pub fn ran(&self) -> bool {
        self.skipped.is_none()
    }
}

/// Progress notifications for UI indicators. Delivery is best effort.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    JourneySaved {
        local_id: LocalId,
    },
    JourneySynced {
        local_id: LocalId,
        remote_id: RemoteId,
    },
    JourneyQueued {
        local_id: LocalId,
        reason: String,
    },
    JourneyFailed {
        local_id: LocalId,
        error: String,
    },
    TabletRegistered {
        tablet_id: TabletId,
        remote_id: RemoteId,
    },
    DrainCompleted {
        trigger: DrainTrigger,
        summary: SyncSummary,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_summary_did_not_run() {
        let summary = SyncSummary::skipped(SkipReason::Offline);
        assert!(!summary.ran());
        assert_eq!(summary.total, 0);
        assert!(SyncSummary::default().ran());
    }

    #[test]
    fn events_are_tagged() {
        let event = SyncEvent::JourneyQueued {
            local_id: LocalId::new("j-1"),
            reason: "offline".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "journey_queued");
        assert_eq!(json["local_id"], "j-1");
    }
}
