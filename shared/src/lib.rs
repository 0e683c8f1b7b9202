//! Offline-first journey capture and sync core for the tablet funnel.
//!
//! The host shell builds one [`SyncEngine`] at startup, hands it the device
//! key-value store, a remote client and a network-state source, and keeps
//! the handle for the life of the process.

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod capabilities;
pub mod config;
pub mod crypto;
pub mod event;
pub mod journey;
pub mod model;
pub mod offline_store;
pub mod remote;
pub mod status;
pub mod sync_engine;

use thiserror::Error;

pub use capabilities::{
    Clock, KvStore, ManualClock, ManualNetwork, MemoryKv, NetworkStateSource, SystemClock,
};
#[cfg(all(feature = "sqlite", not(target_arch = "wasm32")))]
pub use capabilities::SqliteKv;
pub use config::{ConfigError, SyncConfig};
pub use event::{DrainTrigger, SkipReason, SyncEvent, SyncSummary};
pub use journey::{JourneyBuilder, JourneyUpdate};
pub use model::{
    Challenge, Channel, Contact, JourneyRecord, LocalId, Profile, RemoteId, Solution, SyncStatus,
    TabletId, TabletInfo, UnixTimeMs,
};
pub use offline_store::{LocalStore, StoreError, StoreLimits};
pub use remote::{InMemoryRemote, JourneyFields, RemoteError, RemoteStore};
pub use status::{StatusReporter, StatusSnapshot};
pub use sync_engine::{BackgroundSync, SaveOutcome, SaveStatus, SyncEngine};

/// Top-level error for composition-root calls such as [`SyncEngine::open`].
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Store(StoreError::Kv(_)) => "STORAGE_ERROR",
            Self::Store(StoreError::TooManyJourneys { .. } | StoreError::TooManyQueueEntries { .. }) => {
                "QUOTA_EXCEEDED"
            }
            Self::Store(_) => "STORE_CORRUPTED",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(StoreError::Kv(e)) => e.is_retryable(),
            _ => false,
        }
    }

    /// Text the kiosk can show when a save did not go through.
    #[must_use]
    pub fn user_facing_message(&self) -> String {
        match self {
            Self::Store(StoreError::Kv(_)) => {
                "Your details could not be saved on this tablet. Please ask a staff member for help."
                    .into()
            }
            Self::Store(StoreError::TooManyJourneys { .. } | StoreError::TooManyQueueEntries { .. }) => {
                "This tablet is full. Please ask a staff member to sync it.".into()
            }
            Self::Store(_) => "Saved data on this tablet is unreadable.".into(),
            Self::Config(_) => "The tablet is misconfigured.".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::{KvError, StorageErrorCode};

    #[test]
    fn error_codes() {
        let busy: Error = StoreError::Kv(KvError::storage(StorageErrorCode::Busy, "busy")).into();
        assert_eq!(busy.code(), "STORAGE_ERROR");
        assert!(busy.is_retryable());

        let full: Error = StoreError::TooManyJourneys { count: 2, max: 1 }.into();
        assert_eq!(full.code(), "QUOTA_EXCEEDED");
        assert!(!full.is_retryable());

        let config: Error = ConfigError::Invalid("x".into()).into();
        assert_eq!(config.code(), "CONFIG_ERROR");
        assert!(!config.is_retryable());
    }

    #[tokio::test]
    async fn open_rejects_bad_config() {
        let clock = std::sync::Arc::new(ManualClock::new(UnixTimeMs(0)));
        let result = SyncEngine::open(
            std::sync::Arc::new(MemoryKv::new()),
            std::sync::Arc::new(InMemoryRemote::new(clock.clone())),
            std::sync::Arc::new(ManualNetwork::online()),
            clock,
            SyncConfig {
                batch_size: 0,
                ..Default::default()
            },
        )
        .await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
