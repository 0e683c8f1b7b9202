use std::sync::Arc;

use journey_sync::{
    Challenge, Channel, Contact, InMemoryRemote, JourneyBuilder, JourneyUpdate, ManualClock,
    ManualNetwork, MemoryKv, Profile, SaveStatus, Solution, SyncConfig, SyncEngine, SyncStatus,
    UnixTimeMs,
};

#[test]
fn contact_submission_completes_once() {
    let clock = Arc::new(ManualClock::new(UnixTimeMs(100_000)));
    let builder = JourneyBuilder::new(clock.clone());

    // 1. Customer walks through the funnel
    let journey = builder.start_journey();
    let journey = builder.apply_update(&journey, JourneyUpdate::profile(Profile::LargeEnterprise));
    let journey = builder.toggle_channel(&journey, Channel::PhysicalStore);
    let journey = builder.toggle_channel(&journey, Channel::FieldSales);
    let journey = builder.toggle_challenge(&journey, Challenge::Reconciliation);
    let journey = builder.apply_update(&journey, JourneyUpdate::solution(Solution::InStoreTerminal));
    assert!(journey.completed_at.is_none());

    // 2. Contact form submitted 90 seconds later
    clock.advance(90_000);
    let contact = Contact {
        name: Some("Sam Rivera".into()),
        email: Some("sam@example.com".into()),
        phone: None,
        company: Some("Rivera Retail".into()),
    };
    let finished = builder.finalize(&journey, contact.clone());
    assert_eq!(finished.completed_at, Some(UnixTimeMs(190_000)));
    assert_eq!(finished.duration_ms, Some(90_000));
    assert_eq!(finished.contact, Some(contact.clone()));

    // 3. A double tap on submit keeps the first completion time
    clock.advance(3_000);
    let again = builder.finalize(&finished, contact);
    assert_eq!(again.completed_at, finished.completed_at);
    assert_eq!(again.duration_ms, Some(90_000));
}

#[tokio::test]
async fn finished_journey_reaches_the_remote_intact() {
    let clock = Arc::new(ManualClock::new(UnixTimeMs(5_000)));
    let remote = Arc::new(InMemoryRemote::new(clock.clone()));
    let engine = SyncEngine::open(
        Arc::new(MemoryKv::new()),
        remote.clone(),
        Arc::new(ManualNetwork::online()),
        clock.clone(),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    let builder = engine.journey_builder();

    let journey = builder.apply_update(
        &builder.start_journey(),
        JourneyUpdate {
            profile: Some(Profile::SmallMedium),
            challenges: Some([Challenge::HighFees, Challenge::Fraud].into_iter().collect()),
            solution: Some(Solution::OnlineCheckout),
            ..Default::default()
        },
    );
    clock.advance(42_000);
    let journey = builder.finalize(
        &journey,
        Contact {
            email: Some("owner@shop.test".into()),
            ..Default::default()
        },
    );

    let outcome = engine.save_journey(&journey).await.unwrap();
    let SaveStatus::Synced(remote_id) = outcome.status else {
        panic!("expected immediate sync, got {:?}", outcome.status);
    };

    let stored = remote.journey(&journey.local_id).await.unwrap();
    assert_eq!(stored.remote_id, remote_id);
    assert_eq!(stored.fields.duration_ms, Some(42_000));
    assert_eq!(stored.fields.challenges, vec![Challenge::HighFees, Challenge::Fraud]);

    let local = engine
        .store()
        .latest_journey(&journey.local_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert_eq!(local.remote_id, Some(remote_id));
}

#[tokio::test]
async fn invalid_email_is_rejected_but_kept_locally() {
    let clock = Arc::new(ManualClock::new(UnixTimeMs(5_000)));
    let engine = SyncEngine::open(
        Arc::new(MemoryKv::new()),
        Arc::new(InMemoryRemote::new(clock.clone())),
        Arc::new(ManualNetwork::online()),
        clock.clone(),
        SyncConfig::default(),
    )
    .await
    .unwrap();
    let builder = engine.journey_builder();

    let journey = builder.finalize(
        &builder.start_journey(),
        Contact {
            email: Some("no-at-sign".into()),
            ..Default::default()
        },
    );
    let outcome = engine.save_journey(&journey).await.unwrap();

    assert_eq!(outcome.status, SaveStatus::Queued);
    let local = engine
        .store()
        .latest_journey(&journey.local_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(local.sync_status, SyncStatus::Pending);
    assert!(local.last_sync_error.is_some());
}
