use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

// --- Typed IDs ---

macro_rules! typed_id {
    ($name:ident) => {
        #[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

typed_id!(LocalId);
typed_id!(TabletId);
typed_id!(RemoteId);

impl LocalId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl TabletId {
    pub fn generate() -> Self {
        Self(format!("tablet-{}", Uuid::new_v4()))
    }
}

/// Explicit timestamp unit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTimeMs(pub u64);

impl UnixTimeMs {
    pub fn now() -> Self {
        Self(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        )
    }

    pub fn elapsed_since(self, earlier: Self) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn add_millis(self, ms: u64) -> Self {
        Self(self.0.saturating_add(ms))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("unknown {field} tag: {value}")]
    UnknownTag { field: &'static str, value: String },
}

// --- Funnel enumerations ---

macro_rules! tag_enum {
    ($name:ident, $field:literal, { $($variant:ident => $tag:literal),+ $(,)? }) => {
        #[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum $name {
            $(
                #[serde(rename = $tag)]
                $variant,
            )+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $tag,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = ValidationError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($tag => Ok($name::$variant),)+
                    other => Err(ValidationError::UnknownTag {
                        field: $field,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

tag_enum!(Profile, "profile", {
    SmallMedium => "small-medium",
    LargeEnterprise => "large-enterprise",
});

tag_enum!(Channel, "channel", {
    Website => "website",
    SocialMedia => "social-media",
    Marketplace => "marketplace",
    PhysicalStore => "physical-store",
    Phone => "phone",
    FieldSales => "field-sales",
});

tag_enum!(Challenge, "challenge", {
    HighFees => "high-fees",
    SlowSettlement => "slow-settlement",
    Fraud => "fraud",
    Reconciliation => "reconciliation",
    Chargebacks => "chargebacks",
    Integration => "integration",
});

tag_enum!(Solution, "solution", {
    OnlineCheckout => "online-checkout",
    InStoreTerminal => "in-store-terminal",
});

/// Contact form fields; every field is individually optional.
#[derive(Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

impl Contact {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none() && self.company.is_none()
    }
}

// Redact debug output because this is customer PII.
impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("name_present", &self.name.is_some())
            .field("email_present", &self.email.is_some())
            .field("phone_present", &self.phone.is_some())
            .field("company", &self.company)
            .finish()
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct JourneyRecord {
    pub local_id: LocalId,
    pub profile: Option<Profile>,
    pub channels: BTreeSet<Channel>,
    pub challenges: BTreeSet<Challenge>,
    pub solution: Option<Solution>,
    pub contact: Option<Contact>,
    pub started_at: UnixTimeMs,
    pub completed_at: Option<UnixTimeMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    // Sync bookkeeping. Only the sync engine changes it; the store carries
    // it forward to new revisions.
    pub sync_status: SyncStatus,
    pub synced_at: Option<UnixTimeMs>,
    pub sync_attempts: u32,
    pub last_sync_error: Option<String>,
    pub remote_id: Option<RemoteId>,
    /// Assigned by the Local Store on append, starting at 1. Zero means the
    /// record was never saved.
    #[serde(default)]
    pub revision: u32,
}

impl JourneyRecord {
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    pub fn apply_sync_fields(&mut self, update: &SyncFieldsUpdate) {
        if let Some(status) = update.sync_status {
            self.sync_status = status;
        }
        if let Some(at) = update.synced_at {
            self.synced_at = Some(at);
        }
        // Attempts only ever grow.
        if let Some(attempts) = update.sync_attempts {
            self.sync_attempts = self.sync_attempts.max(attempts);
        }
        if let Some(ref err) = update.last_sync_error {
            self.last_sync_error = err.clone();
        }
        if let Some(ref remote_id) = update.remote_id {
            self.remote_id = Some(remote_id.clone());
        }
    }
}

/// Partial merge of sync bookkeeping. `None` leaves a field untouched;
/// `last_sync_error: Some(None)` clears the stored error.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncFieldsUpdate {
    pub sync_status: Option<SyncStatus>,
    pub synced_at: Option<UnixTimeMs>,
    pub sync_attempts: Option<u32>,
    pub last_sync_error: Option<Option<String>>,
    pub remote_id: Option<RemoteId>,
}

impl SyncFieldsUpdate {
    pub fn synced(at: UnixTimeMs, remote_id: RemoteId, attempts: u32) -> Self {
        Self {
            sync_status: Some(SyncStatus::Synced),
            synced_at: Some(at),
            sync_attempts: Some(attempts),
            last_sync_error: Some(None),
            remote_id: Some(remote_id),
        }
    }

    pub fn attempt_failed(status: SyncStatus, attempts: u32, error: impl Into<String>) -> Self {
        Self {
            sync_status: Some(status),
            sync_attempts: Some(attempts),
            last_sync_error: Some(Some(error.into())),
            ..Default::default()
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TabletIdentity {
    pub tablet_id: TabletId,
    pub created_at: UnixTimeMs,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TabletInfo {
    pub tablet_id: TabletId,
    pub name: Option<String>,
    pub remote_id: Option<RemoteId>,
    pub registered_at: Option<UnixTimeMs>,
    pub last_seen_at: Option<UnixTimeMs>,
}

impl TabletInfo {
    pub fn unregistered(tablet_id: TabletId, name: Option<String>) -> Self {
        Self {
            tablet_id,
            name,
            remote_id: None,
            registered_at: None,
            last_seen_at: None,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.remote_id.is_some()
    }
}

/// What a queue entry delivers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SyncPayload {
    Journey { local_id: LocalId },
    TabletRegistration { tablet_id: TabletId, name: Option<String> },
}

impl SyncPayload {
    /// Dedup identity inside the queue.
    pub fn key(&self) -> String {
        match self {
            SyncPayload::Journey { local_id } => format!("journey:{}", local_id),
            SyncPayload::TabletRegistration { tablet_id, .. } => format!("tablet:{}", tablet_id),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SyncPayload::Journey { .. } => "journey",
            SyncPayload::TabletRegistration { .. } => "tablet_registration",
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct SyncQueueEntry {
    pub payload: SyncPayload,
    pub retry_count: u32,
    pub enqueued_at: UnixTimeMs,
    pub next_attempt_at: UnixTimeMs,
    pub last_error: Option<String>,
}

impl SyncQueueEntry {
    pub fn new(payload: SyncPayload, now: UnixTimeMs) -> Self {
        Self {
            payload,
            retry_count: 0,
            enqueued_at: now,
            next_attempt_at: now,
            last_error: None,
        }
    }

    pub fn key(&self) -> String {
        self.payload.key()
    }

    pub fn is_due(&self, now: UnixTimeMs) -> bool {
        now >= self.next_attempt_at
    }
}
