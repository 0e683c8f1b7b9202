use std::collections::BTreeSet;
use std::sync::Arc;

use crate::capabilities::Clock;
use crate::model::{
    Challenge, Channel, Contact, JourneyRecord, LocalId, Profile, Solution, SyncStatus,
};

/// Fields the funnel screens can change. `None` leaves a field as is.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct JourneyUpdate {
    pub profile: Option<Profile>,
    pub channels: Option<BTreeSet<Channel>>,
    pub challenges: Option<BTreeSet<Challenge>>,
    pub solution: Option<Solution>,
    pub contact: Option<Contact>,
}

impl JourneyUpdate {
    pub fn profile(profile: Profile) -> Self {
        Self {
            profile: Some(profile),
            ..Default::default()
        }
    }

    pub fn channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: Some(channels.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn challenges(challenges: impl IntoIterator<Item = Challenge>) -> Self {
        Self {
            challenges: Some(challenges.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn solution(solution: Solution) -> Self {
        Self {
            solution: Some(solution),
            ..Default::default()
        }
    }
}

/// Turns incremental funnel state into journey records.
///
/// Every operation takes the current record by reference and returns a
/// new one, so a save that is still in flight keeps its own snapshot.
#[derive(Clone)]
pub struct JourneyBuilder {
    clock: Arc<dyn Clock>,
}

impl JourneyBuilder {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn start_journey(&self) -> JourneyRecord {
        JourneyRecord {
            local_id: LocalId::generate(),
            profile: None,
            channels: BTreeSet::new(),
            challenges: BTreeSet::new(),
            solution: None,
            contact: None,
            started_at: self.clock.now(),
            completed_at: None,
            duration_ms: None,
            sync_status: SyncStatus::Pending,
            synced_at: None,
            sync_attempts: 0,
            last_sync_error: None,
            remote_id: None,
            revision: 0,
        }
    }

    pub fn apply_update(&self, record: &JourneyRecord, update: JourneyUpdate) -> JourneyRecord {
        let mut next = record.clone();
        if let Some(profile) = update.profile {
            next.profile = Some(profile);
        }
        if let Some(channels) = update.channels {
            next.channels = channels;
        }
        if let Some(challenges) = update.challenges {
            next.challenges = challenges;
        }
        if let Some(solution) = update.solution {
            next.solution = Some(solution);
        }
        if let Some(contact) = update.contact {
            next.contact = Some(contact);
        }
        next
    }

    pub fn toggle_channel(&self, record: &JourneyRecord, channel: Channel) -> JourneyRecord {
        let mut next = record.clone();
        if !next.channels.remove(&channel) {
            next.channels.insert(channel);
        }
        next
    }

    pub fn toggle_challenge(&self, record: &JourneyRecord, challenge: Challenge) -> JourneyRecord {
        let mut next = record.clone();
        if !next.challenges.remove(&challenge) {
            next.challenges.insert(challenge);
        }
        next
    }

    /// Attaches the submitted contact form. `completed_at` is stamped only
    /// the first time; later calls keep it and recompute the same duration.
    pub fn finalize(&self, record: &JourneyRecord, contact: Contact) -> JourneyRecord {
        let mut next = record.clone();
        next.contact = Some(contact);
        let completed_at = *next.completed_at.get_or_insert_with(|| self.clock.now());
        next.duration_ms = Some(completed_at.elapsed_since(next.started_at));
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ManualClock;
    use crate::model::UnixTimeMs;
    use proptest::prelude::*;

    fn builder_at(start: u64) -> (JourneyBuilder, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(UnixTimeMs(start)));
        (JourneyBuilder::new(clock.clone()), clock)
    }

    #[test]
    fn start_journey_is_empty_and_pending() {
        let (builder, _) = builder_at(1_000);
        let record = builder.start_journey();

        assert_eq!(record.started_at, UnixTimeMs(1_000));
        assert!(record.profile.is_none());
        assert!(record.channels.is_empty());
        assert!(record.challenges.is_empty());
        assert!(record.completed_at.is_none());
        assert!(record.duration_ms.is_none());
        assert_eq!(record.sync_status, SyncStatus::Pending);
    }

    #[test]
    fn apply_update_never_mutates_input() {
        let (builder, _) = builder_at(1_000);
        let original = builder.start_journey();
        let updated = builder.apply_update(&original, JourneyUpdate::profile(Profile::SmallMedium));

        assert!(original.profile.is_none());
        assert_eq!(updated.profile, Some(Profile::SmallMedium));
        assert_eq!(updated.local_id, original.local_id);
        assert_eq!(updated.started_at, original.started_at);
    }

    #[test]
    fn toggles_add_then_remove() {
        let (builder, _) = builder_at(0);
        let record = builder.start_journey();
        let on = builder.toggle_channel(&record, Channel::Website);
        let off = builder.toggle_channel(&on, Channel::Website);
        assert!(on.channels.contains(&Channel::Website));
        assert!(off.channels.is_empty());

        let with_fraud = builder.toggle_challenge(&record, Challenge::Fraud);
        assert_eq!(with_fraud.challenges.len(), 1);
    }

    #[test]
    fn finalize_sets_completion_once() {
        let (builder, clock) = builder_at(10_000);
        let record = builder.start_journey();

        clock.set(UnixTimeMs(70_000));
        let done = builder.finalize(&record, Contact::default());
        assert_eq!(done.completed_at, Some(UnixTimeMs(70_000)));
        assert_eq!(done.duration_ms, Some(60_000));

        clock.set(UnixTimeMs(99_000));
        let again = builder.finalize(
            &done,
            Contact {
                email: Some("late@example.com".into()),
                ..Default::default()
            },
        );
        assert_eq!(again.completed_at, Some(UnixTimeMs(70_000)));
        assert_eq!(again.duration_ms, Some(60_000));
        assert_eq!(
            again.contact.and_then(|c| c.email),
            Some("late@example.com".to_string())
        );
    }

    proptest! {
        #[test]
        fn channel_order_and_repeats_do_not_matter(picks in proptest::collection::vec(0usize..Channel::ALL.len(), 0..20)) {
            let (builder, _) = builder_at(0);
            let record = builder.start_journey();
            let forward: Vec<Channel> = picks.iter().map(|i| Channel::ALL[*i]).collect();
            let mut backward = forward.clone();
            backward.reverse();

            let a = builder.apply_update(&record, JourneyUpdate::channels(forward.clone()));
            let b = builder.apply_update(&record, JourneyUpdate::channels(backward));
            prop_assert_eq!(&a.channels, &b.channels);

            let distinct: BTreeSet<Channel> = forward.into_iter().collect();
            prop_assert_eq!(a.channels.len(), distinct.len());
        }

        #[test]
        fn finalize_is_idempotent(start in 0u64..1_000_000, first in 0u64..1_000_000, later in 0u64..1_000_000) {
            let (builder, clock) = builder_at(start);
            let record = builder.start_journey();

            clock.set(UnixTimeMs(start + first));
            let once = builder.finalize(&record, Contact::default());
            clock.set(UnixTimeMs(start + first + later));
            let twice = builder.finalize(&once, Contact::default());

            prop_assert_eq!(once.completed_at, twice.completed_at);
            prop_assert_eq!(twice.duration_ms, Some(first));
        }
    }
}
