//! Remote upsert contract consumed by the sync engine, plus an in-memory
//! implementation used by tests and offline demos.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use crate::capabilities::Clock;
use crate::model::{
    Challenge, Channel, Contact, JourneyRecord, LocalId, Profile, RemoteId, Solution, TabletId,
    UnixTimeMs,
};

pub const MAX_TEXT_FIELD_LENGTH: usize = 256;
const MAX_MESSAGE_LENGTH: usize = 512;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCategory {
    Transient,
    RateLimited,
    Rejected,
    ServerError,
    NetworkError,
    Timeout,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transient
                | ErrorCategory::RateLimited
                | ErrorCategory::ServerError
                | ErrorCategory::NetworkError
                | ErrorCategory::Timeout
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{category:?}: {message}")]
pub struct RemoteError {
    pub category: ErrorCategory,
    pub message: String,
}

impl RemoteError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        let mut message = message.into();
        truncate_utf8_safe(&mut message, MAX_MESSAGE_LENGTH);
        Self { category, message }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NetworkError, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorCategory::Timeout,
            format!("no response after {}ms", after.as_millis()),
        )
    }

    pub fn server(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::ServerError, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Rejected, message)
    }

    pub fn is_retryable(&self) -> bool {
        self.category.is_retryable()
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize) {
    if s.len() <= max_bytes {
        return;
    }

    let mut truncate_at = max_bytes;
    while truncate_at > 0 && !s.is_char_boundary(truncate_at) {
        truncate_at -= 1;
    }
    s.truncate(truncate_at);
}

/// Why a payload is considered malformed by the remote.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum FieldsError {
    #[error("completedAt {completed} is before startedAt {started}")]
    CompletedBeforeStarted { started: u64, completed: u64 },

    #[error("duration {actual:?} does not match timestamps (expected {expected:?})")]
    DurationMismatch {
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("contact email is not an address")]
    InvalidEmail,

    #[error("{field} exceeds {max} bytes")]
    FieldTooLong { field: &'static str, max: usize },
}

/// Wire form of a journey as the remote stores it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JourneyFields {
    pub profile: Option<Profile>,
    pub channels: Vec<Channel>,
    pub challenges: Vec<Challenge>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution: Option<Solution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<Contact>,
    pub started_at: UnixTimeMs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<UnixTimeMs>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl From<&JourneyRecord> for JourneyFields {
    fn from(record: &JourneyRecord) -> Self {
        Self {
            profile: record.profile,
            channels: record.channels.iter().copied().collect(),
            challenges: record.challenges.iter().copied().collect(),
            solution: record.solution,
            contact: record.contact.clone(),
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_ms: record.duration_ms,
        }
    }
}

impl JourneyFields {
    pub fn validate(&self) -> Result<(), FieldsError> {
        let expected = match self.completed_at {
            Some(completed) if completed < self.started_at => {
                return Err(FieldsError::CompletedBeforeStarted {
                    started: self.started_at.0,
                    completed: completed.0,
                });
            }
            Some(completed) => Some(completed.elapsed_since(self.started_at)),
            None => None,
        };
        if self.duration_ms != expected {
            return Err(FieldsError::DurationMismatch {
                expected,
                actual: self.duration_ms,
            });
        }

        if let Some(contact) = &self.contact {
            let fields = [
                ("contact.name", &contact.name),
                ("contact.email", &contact.email),
                ("contact.phone", &contact.phone),
                ("contact.company", &contact.company),
            ];
            for (field, value) in fields {
                if value.as_ref().is_some_and(|v| v.len() > MAX_TEXT_FIELD_LENGTH) {
                    return Err(FieldsError::FieldTooLong {
                        field,
                        max: MAX_TEXT_FIELD_LENGTH,
                    });
                }
            }
            if let Some(email) = &contact.email {
                if !email.contains('@') {
                    return Err(FieldsError::InvalidEmail);
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchItem {
    pub local_id: LocalId,
    pub fields: JourneyFields,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpsertOutcome {
    pub succeeded: u32,
    pub failed: u32,
    /// One `"<localId>: <reason>"` line per failed item.
    pub errors: Vec<String>,
    pub failed_ids: Vec<LocalId>,
    pub upserted: Vec<(LocalId, RemoteId)>,
}

/// Operational record written for every batch call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncLogEntry {
    pub tablet_id: TabletId,
    pub processed: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub errors: String,
    pub logged_at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteJourney {
    pub remote_id: RemoteId,
    pub tablet_id: TabletId,
    pub local_id: LocalId,
    pub fields: JourneyFields,
    pub created_at: UnixTimeMs,
    pub updated_at: UnixTimeMs,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteTablet {
    pub remote_id: RemoteId,
    pub tablet_id: TabletId,
    pub name: Option<String>,
    pub registered_at: UnixTimeMs,
    pub last_seen_at: UnixTimeMs,
}

/// Inclusive range over `startedAt`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: UnixTimeMs,
    pub to: UnixTimeMs,
}

impl DateRange {
    pub fn contains(&self, at: UnixTimeMs) -> bool {
        self.from <= at && at <= self.to
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSummary {
    pub total_journeys: u64,
    pub completed_journeys: u64,
    pub with_contact: u64,
    pub completion_rate: f64,
    pub average_duration_ms: Option<u64>,
    pub by_profile: BTreeMap<Profile, u64>,
    pub by_channel: BTreeMap<Channel, u64>,
    pub by_challenge: BTreeMap<Challenge, u64>,
    pub by_solution: BTreeMap<Solution, u64>,
}

impl StatsSummary {
    fn from_journeys<'a>(journeys: impl Iterator<Item = &'a RemoteJourney>) -> Self {
        let mut stats = StatsSummary::default();
        let mut duration_total: u64 = 0;
        let mut duration_count: u64 = 0;

        for journey in journeys {
            let fields = &journey.fields;
            stats.total_journeys += 1;
            if fields.completed_at.is_some() {
                stats.completed_journeys += 1;
            }
            if fields.contact.as_ref().is_some_and(|c| !c.is_empty()) {
                stats.with_contact += 1;
            }
            if let Some(duration) = fields.duration_ms {
                duration_total = duration_total.saturating_add(duration);
                duration_count += 1;
            }
            if let Some(profile) = fields.profile {
                *stats.by_profile.entry(profile).or_default() += 1;
            }
            for channel in &fields.channels {
                *stats.by_channel.entry(*channel).or_default() += 1;
            }
            for challenge in &fields.challenges {
                *stats.by_challenge.entry(*challenge).or_default() += 1;
            }
            if let Some(solution) = fields.solution {
                *stats.by_solution.entry(solution).or_default() += 1;
            }
        }

        if stats.total_journeys > 0 {
            stats.completion_rate = stats.completed_journeys as f64 / stats.total_journeys as f64;
        }
        if duration_count > 0 {
            stats.average_duration_ms = Some(duration_total / duration_count);
        }
        stats
    }
}

/// Server-side store the sync engine delivers to. Every write is an upsert
/// keyed by the client-assigned id, so redelivery never duplicates.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upsert_journey(
        &self,
        tablet_id: &TabletId,
        local_id: &LocalId,
        fields: &JourneyFields,
    ) -> Result<RemoteId, RemoteError>;

    /// Per-item best effort. An `Err` means the batch never reached the
    /// remote; item failures are reported inside the outcome.
    async fn batch_upsert_journeys(
        &self,
        tablet_id: &TabletId,
        items: &[BatchItem],
    ) -> Result<BatchUpsertOutcome, RemoteError>;

    async fn register_or_touch_tablet(
        &self,
        tablet_id: &TabletId,
        name: Option<&str>,
    ) -> Result<RemoteId, RemoteError>;

    async fn list_journeys_by_tablet(
        &self,
        tablet_id: &TabletId,
    ) -> Result<Vec<RemoteJourney>, RemoteError>;

    async fn list_pending_by_tablet(
        &self,
        tablet_id: &TabletId,
    ) -> Result<Vec<RemoteJourney>, RemoteError>;

    async fn compute_stats(
        &self,
        tablet_id: Option<&TabletId>,
        range: Option<DateRange>,
    ) -> Result<StatsSummary, RemoteError>;
}

#[derive(Default)]
struct RemoteState {
    journeys: HashMap<LocalId, RemoteJourney>,
    tablets: HashMap<TabletId, RemoteTablet>,
    sync_logs: Vec<SyncLogEntry>,
}

/// Reference remote held in process memory.
pub struct InMemoryRemote {
    clock: Arc<dyn Clock>,
    state: RwLock<RemoteState>,
    available: AtomicBool,
    fail_next: AtomicU32,
    latency_ms: AtomicU64,
    upsert_calls: AtomicU64,
    batch_calls: AtomicU64,
    next_id: AtomicU64,
}

impl InMemoryRemote {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            state: RwLock::new(RemoteState::default()),
            available: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
            latency_ms: AtomicU64::new(0),
            upsert_calls: AtomicU64::new(0),
            batch_calls: AtomicU64::new(0),
            next_id: AtomicU64::new(1),
        }
    }

    /// While unavailable every call fails with a network error.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Fails the next `n` calls with a server error.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Single-journey upsert attempts, including failed ones.
    pub fn upsert_calls(&self) -> u64 {
        self.upsert_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> u64 {
        self.batch_calls.load(Ordering::SeqCst)
    }

    pub async fn journey_count(&self) -> usize {
        self.state.read().await.journeys.len()
    }

    pub async fn journey(&self, local_id: &LocalId) -> Option<RemoteJourney> {
        self.state.read().await.journeys.get(local_id).cloned()
    }

    pub async fn tablet(&self, tablet_id: &TabletId) -> Option<RemoteTablet> {
        self.state.read().await.tablets.get(tablet_id).cloned()
    }

    pub async fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.state.read().await.sync_logs.clone()
    }

    async fn gate(&self) -> Result<(), RemoteError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(RemoteError::network("remote unreachable"));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(RemoteError::server("injected failure"));
        }
        Ok(())
    }

    fn allocate_id(&self, prefix: &str) -> RemoteId {
        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        RemoteId::new(format!("{}-{}", prefix, n))
    }

    fn upsert_locked(
        &self,
        state: &mut RemoteState,
        tablet_id: &TabletId,
        local_id: &LocalId,
        fields: &JourneyFields,
        now: UnixTimeMs,
    ) -> RemoteId {
        if let Some(existing) = state.journeys.get_mut(local_id) {
            existing.fields = fields.clone();
            existing.tablet_id = tablet_id.clone();
            existing.updated_at = now;
            return existing.remote_id.clone();
        }

        let remote_id = self.allocate_id("rj");
        state.journeys.insert(
            local_id.clone(),
            RemoteJourney {
                remote_id: remote_id.clone(),
                tablet_id: tablet_id.clone(),
                local_id: local_id.clone(),
                fields: fields.clone(),
                created_at: now,
                updated_at: now,
            },
        );
        remote_id
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    #[instrument(skip(self, fields), fields(tablet_id = %tablet_id, local_id = %local_id))]
    async fn upsert_journey(
        &self,
        tablet_id: &TabletId,
        local_id: &LocalId,
        fields: &JourneyFields,
    ) -> Result<RemoteId, RemoteError> {
        self.upsert_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;
        fields
            .validate()
            .map_err(|e| RemoteError::rejected(e.to_string()))?;

        let now = self.clock.now();
        let mut state = self.state.write().await;
        let remote_id = self.upsert_locked(&mut state, tablet_id, local_id, fields, now);
        debug!(remote_id = %remote_id, "Journey upserted");
        Ok(remote_id)
    }

    #[instrument(skip(self, items), fields(tablet_id = %tablet_id, items = items.len()))]
    async fn batch_upsert_journeys(
        &self,
        tablet_id: &TabletId,
        items: &[BatchItem],
    ) -> Result<BatchUpsertOutcome, RemoteError> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.gate().await?;

        let now = self.clock.now();
        let mut outcome = BatchUpsertOutcome::default();
        let mut state = self.state.write().await;

        for item in items {
            match item.fields.validate() {
                Ok(()) => {
                    let remote_id =
                        self.upsert_locked(&mut state, tablet_id, &item.local_id, &item.fields, now);
                    outcome.succeeded += 1;
                    outcome.upserted.push((item.local_id.clone(), remote_id));
                }
                Err(e) => {
                    warn!(local_id = %item.local_id, error = %e, "Batch item rejected");
                    outcome.failed += 1;
                    outcome.errors.push(format!("{}: {}", item.local_id, e));
                    outcome.failed_ids.push(item.local_id.clone());
                }
            }
        }

        state.sync_logs.push(SyncLogEntry {
            tablet_id: tablet_id.clone(),
            processed: items.len() as u32,
            succeeded: outcome.succeeded,
            failed: outcome.failed,
            errors: outcome.errors.join("; "),
            logged_at: now,
        });

        Ok(outcome)
    }

    #[instrument(skip(self, name), fields(tablet_id = %tablet_id))]
    async fn register_or_touch_tablet(
        &self,
        tablet_id: &TabletId,
        name: Option<&str>,
    ) -> Result<RemoteId, RemoteError> {
        self.gate().await?;
        if name.is_some_and(|n| n.len() > MAX_TEXT_FIELD_LENGTH) {
            return Err(RemoteError::rejected(format!(
                "tablet name exceeds {} bytes",
                MAX_TEXT_FIELD_LENGTH
            )));
        }

        let now = self.clock.now();
        let mut state = self.state.write().await;
        if let Some(tablet) = state.tablets.get_mut(tablet_id) {
            tablet.last_seen_at = now;
            if let Some(name) = name {
                tablet.name = Some(name.to_string());
            }
            return Ok(tablet.remote_id.clone());
        }

        let remote_id = self.allocate_id("rt");
        state.tablets.insert(
            tablet_id.clone(),
            RemoteTablet {
                remote_id: remote_id.clone(),
                tablet_id: tablet_id.clone(),
                name: name.map(str::to_string),
                registered_at: now,
                last_seen_at: now,
            },
        );
        Ok(remote_id)
    }

    async fn list_journeys_by_tablet(
        &self,
        tablet_id: &TabletId,
    ) -> Result<Vec<RemoteJourney>, RemoteError> {
        self.gate().await?;
        let state = self.state.read().await;
        let mut journeys: Vec<_> = state
            .journeys
            .values()
            .filter(|j| &j.tablet_id == tablet_id)
            .cloned()
            .collect();
        journeys.sort_by_key(|j| j.fields.started_at);
        Ok(journeys)
    }

    async fn list_pending_by_tablet(
        &self,
        tablet_id: &TabletId,
    ) -> Result<Vec<RemoteJourney>, RemoteError> {
        let mut journeys = self.list_journeys_by_tablet(tablet_id).await?;
        journeys.retain(|j| j.fields.completed_at.is_none());
        Ok(journeys)
    }

    async fn compute_stats(
        &self,
        tablet_id: Option<&TabletId>,
        range: Option<DateRange>,
    ) -> Result<StatsSummary, RemoteError> {
        self.gate().await?;
        let state = self.state.read().await;
        let selected = state.journeys.values().filter(|j| {
            tablet_id.map_or(true, |t| &j.tablet_id == t)
                && range.map_or(true, |r| r.contains(j.fields.started_at))
        });
        Ok(StatsSummary::from_journeys(selected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ManualClock;

    fn remote() -> (InMemoryRemote, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(UnixTimeMs(1_000)));
        (InMemoryRemote::new(clock.clone()), clock)
    }

    fn fields(started: u64) -> JourneyFields {
        JourneyFields {
            profile: Some(Profile::SmallMedium),
            channels: vec![Channel::Website],
            challenges: vec![],
            solution: None,
            contact: None,
            started_at: UnixTimeMs(started),
            completed_at: None,
            duration_ms: None,
        }
    }

    fn completed(started: u64, completed: u64) -> JourneyFields {
        JourneyFields {
            completed_at: Some(UnixTimeMs(completed)),
            duration_ms: Some(completed - started),
            ..fields(started)
        }
    }

    #[test]
    fn wire_names_are_camel_case() {
        let json = serde_json::to_value(completed(10, 40)).unwrap();
        assert_eq!(json["startedAt"], 10);
        assert_eq!(json["completedAt"], 40);
        assert_eq!(json["durationMs"], 30);
        assert_eq!(json["profile"], "small-medium");
        assert!(json.get("contact").is_none());
    }

    #[test]
    fn validation_rules() {
        assert!(fields(10).validate().is_ok());
        assert!(completed(10, 40).validate().is_ok());

        let backwards = JourneyFields {
            completed_at: Some(UnixTimeMs(5)),
            duration_ms: Some(0),
            ..fields(10)
        };
        assert!(matches!(
            backwards.validate(),
            Err(FieldsError::CompletedBeforeStarted { .. })
        ));

        let wrong_duration = JourneyFields {
            duration_ms: Some(1),
            ..completed(10, 40)
        };
        assert!(matches!(
            wrong_duration.validate(),
            Err(FieldsError::DurationMismatch { .. })
        ));

        let bad_email = JourneyFields {
            contact: Some(Contact {
                email: Some("not-an-address".into()),
                ..Default::default()
            }),
            ..fields(10)
        };
        assert_eq!(bad_email.validate(), Err(FieldsError::InvalidEmail));

        let long_name = JourneyFields {
            contact: Some(Contact {
                name: Some("x".repeat(MAX_TEXT_FIELD_LENGTH + 1)),
                ..Default::default()
            }),
            ..fields(10)
        };
        assert!(matches!(
            long_name.validate(),
            Err(FieldsError::FieldTooLong { field: "contact.name", .. })
        ));
    }

    #[test]
    fn error_categories() {
        assert!(RemoteError::network("down").is_retryable());
        assert!(RemoteError::timeout(Duration::from_secs(1)).is_retryable());
        assert!(!RemoteError::rejected("bad").is_retryable());

        let long = RemoteError::server("é".repeat(600));
        assert!(long.message.len() <= MAX_MESSAGE_LENGTH);
    }

    #[tokio::test]
    async fn upsert_is_idempotent_on_local_id() {
        let (remote, clock) = remote();
        let tablet = TabletId::new("tablet-1");
        let local = LocalId::new("j-1");

        let first = remote.upsert_journey(&tablet, &local, &fields(10)).await.unwrap();
        clock.advance(500);
        let second = remote
            .upsert_journey(&tablet, &local, &completed(10, 90))
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(remote.journey_count().await, 1);
        let stored = remote.journey(&local).await.unwrap();
        assert_eq!(stored.fields.completed_at, Some(UnixTimeMs(90)));
        assert_eq!(stored.created_at, UnixTimeMs(1_000));
        assert_eq!(stored.updated_at, UnixTimeMs(1_500));
    }

    #[tokio::test]
    async fn batch_isolates_bad_items_and_logs() {
        let (remote, _) = remote();
        let tablet = TabletId::new("tablet-1");
        let items = vec![
            BatchItem {
                local_id: LocalId::new("a"),
                fields: fields(10),
            },
            BatchItem {
                local_id: LocalId::new("b"),
                fields: JourneyFields {
                    duration_ms: Some(7),
                    ..fields(10)
                },
            },
            BatchItem {
                local_id: LocalId::new("c"),
                fields: completed(10, 20),
            },
        ];

        let outcome = remote.batch_upsert_journeys(&tablet, &items).await.unwrap();

        assert_eq!(outcome.succeeded, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.errors.len(), 1);
        assert!(outcome.errors[0].starts_with("b: "));
        assert_eq!(outcome.failed_ids, vec![LocalId::new("b")]);
        assert_eq!(remote.journey_count().await, 2);

        let logs = remote.sync_logs().await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].processed, 3);
        assert_eq!(logs[0].failed, 1);
    }

    #[tokio::test]
    async fn tablet_register_then_touch() {
        let (remote, clock) = remote();
        let tablet = TabletId::new("tablet-1");

        let id = remote
            .register_or_touch_tablet(&tablet, Some("Lobby"))
            .await
            .unwrap();
        clock.advance(60_000);
        let again = remote.register_or_touch_tablet(&tablet, None).await.unwrap();

        assert_eq!(id, again);
        let stored = remote.tablet(&tablet).await.unwrap();
        assert_eq!(stored.name.as_deref(), Some("Lobby"));
        assert_eq!(stored.registered_at, UnixTimeMs(1_000));
        assert_eq!(stored.last_seen_at, UnixTimeMs(61_000));
    }

    #[tokio::test]
    async fn fault_injection() {
        let (remote, _) = remote();
        let tablet = TabletId::new("tablet-1");
        let local = LocalId::new("j-1");

        remote.set_available(false);
        let err = remote.upsert_journey(&tablet, &local, &fields(1)).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::NetworkError);

        remote.set_available(true);
        remote.fail_next(1);
        let err = remote.upsert_journey(&tablet, &local, &fields(1)).await.unwrap_err();
        assert_eq!(err.category, ErrorCategory::ServerError);

        assert!(remote.upsert_journey(&tablet, &local, &fields(1)).await.is_ok());
        assert_eq!(remote.upsert_calls(), 3);
    }

    #[tokio::test]
    async fn reporting_reads() {
        let (remote, _) = remote();
        let tablet = TabletId::new("tablet-1");
        let other = TabletId::new("tablet-2");

        remote
            .upsert_journey(&tablet, &LocalId::new("a"), &fields(100))
            .await
            .unwrap();
        remote
            .upsert_journey(&tablet, &LocalId::new("b"), &completed(200, 260))
            .await
            .unwrap();
        remote
            .upsert_journey(&other, &LocalId::new("c"), &completed(300, 400))
            .await
            .unwrap();

        assert_eq!(remote.list_journeys_by_tablet(&tablet).await.unwrap().len(), 2);
        let pending = remote.list_pending_by_tablet(&tablet).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].local_id, LocalId::new("a"));

        let all = remote.compute_stats(None, None).await.unwrap();
        assert_eq!(all.total_journeys, 3);
        assert_eq!(all.completed_journeys, 2);
        assert_eq!(all.average_duration_ms, Some(80));
        assert_eq!(all.by_channel.get(&Channel::Website), Some(&3));

        let scoped = remote
            .compute_stats(
                Some(&tablet),
                Some(DateRange {
                    from: UnixTimeMs(150),
                    to: UnixTimeMs(250),
                }),
            )
            .await
            .unwrap();
        assert_eq!(scoped.total_journeys, 1);
        assert_eq!(scoped.completion_rate, 1.0);
    }
}
