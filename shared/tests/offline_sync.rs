use std::sync::Arc;
use std::time::Duration;

use journey_sync::remote::{BatchItem, JourneyFields, RemoteStore};
use journey_sync::{
    Channel, Clock, InMemoryRemote, JourneyUpdate, ManualClock, ManualNetwork, MemoryKv, Profile,
    SaveStatus, SkipReason, StatusReporter, SyncConfig, SyncEngine, SyncStatus, UnixTimeMs,
};

struct Tablet {
    engine: SyncEngine,
    remote: Arc<InMemoryRemote>,
    network: Arc<ManualNetwork>,
    clock: Arc<ManualClock>,
}

async fn tablet(online: bool) -> Tablet {
    let clock = Arc::new(ManualClock::new(UnixTimeMs(1_700_000_000_000)));
    let remote = Arc::new(InMemoryRemote::new(clock.clone()));
    let network = Arc::new(ManualNetwork::new(online));
    let config = SyncConfig {
        jitter_ms: 0,
        ..Default::default()
    };
    let engine = SyncEngine::open(
        Arc::new(MemoryKv::new()),
        remote.clone(),
        network.clone(),
        clock.clone(),
        config,
    )
    .await
    .unwrap();
    Tablet {
        engine,
        remote,
        network,
        clock,
    }
}

#[tokio::test]
async fn offline_journey_syncs_after_reconnect() {
    let t = tablet(false).await;
    let builder = t.engine.journey_builder();

    // 1. Offline: journey A with a profile and one channel, no contact
    let journey = builder.apply_update(
        &builder.start_journey(),
        JourneyUpdate {
            profile: Some(Profile::SmallMedium),
            channels: Some([Channel::Website].into_iter().collect()),
            ..Default::default()
        },
    );
    let outcome = t.engine.save_journey(&journey).await.unwrap();
    assert_eq!(outcome.status, SaveStatus::Queued);

    let store = t.engine.store();
    let stored = store.latest_journey(&journey.local_id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Pending);
    let queue = store.list_queue().await.unwrap();
    assert_eq!(queue.len(), 1);
    assert_eq!(queue[0].key(), format!("journey:{}", journey.local_id));

    // 2. Back online, one drain cycle
    t.network.set_online(true);
    t.clock.advance(5_000);
    let summary = t.engine.sync_now().await.unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.total, 1);

    let stored = store.latest_journey(&journey.local_id).await.unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Synced);
    assert!(store.list_queue().await.unwrap().is_empty());
    assert_eq!(
        store.get_last_sync_timestamp().await.unwrap(),
        Some(t.clock.now())
    );
}

#[tokio::test]
async fn every_offline_save_is_delivered() {
    let t = tablet(false).await;
    let builder = t.engine.journey_builder();

    let mut ids = Vec::new();
    for _ in 0..10 {
        let journey = builder.start_journey();
        t.engine.save_journey(&journey).await.unwrap();
        ids.push(journey.local_id);
    }
    assert_eq!(t.engine.store().get_all_journeys().await.unwrap().len(), 10);
    assert_eq!(t.remote.upsert_calls(), 0);

    t.network.set_online(true);
    let summary = t.engine.sync_now().await.unwrap();
    assert_eq!(summary.succeeded, 10);

    for id in &ids {
        let stored = t.engine.store().latest_journey(id).await.unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(t.remote.journey(id).await.is_some());
    }
}

#[tokio::test]
async fn unreachable_remote_exhausts_the_budget() {
    let t = tablet(false).await;
    let journey = t.engine.journey_builder().start_journey();
    t.engine.save_journey(&journey).await.unwrap();

    t.network.set_online(true);
    t.remote.set_available(false);

    let max_retries = t.engine.config().max_retries;
    for _ in 0..max_retries {
        t.engine.sync_now().await.unwrap();
    }

    assert_eq!(t.remote.upsert_calls(), u64::from(max_retries));
    assert!(t.engine.store().list_queue().await.unwrap().is_empty());
    let stored = t
        .engine
        .store()
        .latest_journey(&journey.local_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Failed);
    assert_eq!(stored.sync_attempts, max_retries);

    let status = StatusReporter::new(t.engine.clone()).snapshot().await.unwrap();
    assert_eq!(status.failed_count, 1);
    assert_eq!(status.pending_count, 0);
}

#[tokio::test]
async fn queueing_is_deduplicated() {
    let t = tablet(false).await;
    let builder = t.engine.journey_builder();
    let journey = builder.start_journey();

    t.engine.save_journey(&journey).await.unwrap();
    let updated = builder.apply_update(&journey, JourneyUpdate::profile(Profile::LargeEnterprise));
    t.engine.save_journey(&updated).await.unwrap();

    assert_eq!(t.engine.store().get_all_journeys().await.unwrap().len(), 2);
    assert_eq!(t.engine.store().list_queue().await.unwrap().len(), 1);

    t.network.set_online(true);
    t.engine.sync_now().await.unwrap();

    let remote = t.remote.journey(&journey.local_id).await.unwrap();
    assert_eq!(remote.fields.profile, Some(Profile::LargeEnterprise));
    assert_eq!(t.remote.journey_count().await, 1);
}

#[tokio::test]
async fn manual_sync_during_drain_is_a_no_op() {
    let t = tablet(false).await;
    for _ in 0..4 {
        let journey = t.engine.journey_builder().start_journey();
        t.engine.save_journey(&journey).await.unwrap();
    }
    t.network.set_online(true);
    t.remote.set_latency(Duration::from_millis(20));

    let engine = t.engine.clone();
    let background = tokio::spawn(async move { engine.sync_now().await });
    while !t.engine.is_syncing() {
        tokio::task::yield_now().await;
    }

    let manual = t.engine.sync_now().await.unwrap();
    assert_eq!(manual.skipped, Some(SkipReason::AlreadyRunning));

    let drained = background.await.unwrap().unwrap();
    assert_eq!(drained.succeeded, 4);
    assert_eq!(t.remote.upsert_calls(), 4);
}

#[tokio::test]
async fn batch_reports_the_malformed_item() {
    let t = tablet(true).await;
    let tablet_id = t.engine.tablet_id().await.unwrap();
    let builder = t.engine.journey_builder();

    let items: Vec<BatchItem> = (0..3)
        .map(|i| {
            let journey = builder.start_journey();
            let mut fields = JourneyFields::from(&journey);
            if i == 1 {
                fields.completed_at = Some(UnixTimeMs(fields.started_at.0 - 1));
                fields.duration_ms = Some(0);
            }
            BatchItem {
                local_id: journey.local_id,
                fields,
            }
        })
        .collect();

    let outcome = t
        .remote
        .batch_upsert_journeys(&tablet_id, &items)
        .await
        .unwrap();

    assert_eq!(outcome.succeeded, 2);
    assert_eq!(outcome.failed, 1);
    assert_eq!(outcome.errors.len(), 1);
    let prefix = format!("{}: ", items[1].local_id);
    assert!(outcome.errors[0].starts_with(&prefix), "{}", outcome.errors[0]);
    assert!(outcome.errors[0].len() > prefix.len());

    let logs = t.remote.sync_logs().await;
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].processed, 3);
    assert_eq!(logs[0].errors, outcome.errors[0]);
}

#[tokio::test(start_paused = true)]
async fn background_worker_redrives_on_reconnect() {
    let t = tablet(false).await;
    let journey = t.engine.journey_builder().start_journey();
    t.engine.save_journey(&journey).await.unwrap();

    let worker = t.engine.spawn_background();
    tokio::task::yield_now().await;

    t.network.set_online(true);
    let mut synced = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let stored = t
            .engine
            .store()
            .latest_journey(&journey.local_id)
            .await
            .unwrap()
            .unwrap();
        if stored.sync_status == SyncStatus::Synced {
            synced = true;
            break;
        }
    }
    assert!(synced, "reconnect did not trigger a drain");

    worker.shutdown().await;
}
