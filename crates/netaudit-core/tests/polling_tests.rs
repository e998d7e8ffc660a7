use netaudit_core::notify::{NoticeLevel, NotificationBus};
use netaudit_core::polling::{PollRequest, PollingRegistry};
use netaudit_core::{
    AnalysisKind, BackendError, FlagStore, JobState, MemoryFlagStore, PollKey, PollingError,
    ResourceId,
};
use netaudit_test_utils::{advance_polls, fast_config, RecordingCallbacks, ScriptedFetcher};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn registry() -> PollingRegistry {
    PollingRegistry::new(
        Arc::new(MemoryFlagStore::new()),
        NotificationBus::default(),
        &fast_config(),
    )
}

fn poll(key: &PollKey, fetcher: &Arc<ScriptedFetcher>, rec: &RecordingCallbacks) -> PollRequest {
    PollRequest::new(
        key.clone(),
        ResourceId::project("P1"),
        fetcher.clone(),
        rec.callbacks(),
    )
}

#[tokio::test(start_paused = true)]
async fn duplicate_start_keeps_a_single_loop() {
    let registry = registry();
    let key = PollKey::from_raw("overview_P1");
    let first = Arc::new(ScriptedFetcher::pending_forever());
    let second = Arc::new(ScriptedFetcher::pending_forever());
    let rec = RecordingCallbacks::new();

    registry.start_polling(poll(&key, &first, &rec)).unwrap();
    assert_eq!(
        registry.start_polling(poll(&key, &second, &rec)),
        Err(PollingError::AlreadyPolling(key.clone()))
    );

    advance_polls(3).await;
    assert_eq!(first.calls(), 3);
    assert_eq!(second.calls(), 0);
    assert_eq!(registry.active_keys(), vec![key]);
}

#[tokio::test(start_paused = true)]
async fn resume_swaps_listeners_without_resetting_timing() {
    let registry = registry();
    let key = PollKey::from_raw("recommendations_P1");
    let fetcher = Arc::new(ScriptedFetcher::ready_after(5, json!({ "items": 4 })));
    let (old, new) = (RecordingCallbacks::new(), RecordingCallbacks::new());

    registry.start_polling(poll(&key, &fetcher, &old)).unwrap();
    advance_polls(3).await;
    let before = registry.session_info(&key).unwrap();
    assert_eq!(before.attempts, 3);

    registry.resume_polling(&key, new.callbacks()).unwrap();
    let after = registry.session_info(&key).unwrap();
    assert_eq!(after.attempts, before.attempts);
    assert_eq!(after.started_at, before.started_at);

    advance_polls(1).await;
    assert_eq!(fetcher.calls(), 4);
    assert_eq!(registry.session_info(&key).unwrap().attempts, 4);

    advance_polls(2).await;
    assert_eq!(old.count(), 0);
    assert_eq!(new.successes(), 1);
}

#[tokio::test(start_paused = true)]
async fn failing_key_leaves_other_keys_running() {
    let registry = registry();
    let overview = PollKey::from_raw("overview_P1");
    let recs = PollKey::from_raw("recommendations_P1");
    let overview_fetcher = Arc::new(ScriptedFetcher::ready_after(5, json!("overview")));
    let recs_fetcher = Arc::new(ScriptedFetcher::fail_after(
        1,
        BackendError::Transport("status endpoint down".into()),
    ));
    let (overview_rec, recs_rec) = (RecordingCallbacks::new(), RecordingCallbacks::new());

    registry
        .start_polling(poll(&overview, &overview_fetcher, &overview_rec))
        .unwrap();
    registry
        .start_polling(poll(&recs, &recs_fetcher, &recs_rec))
        .unwrap();

    advance_polls(3).await;
    assert_eq!(recs_rec.errors(), 1);
    assert!(!registry.is_polling(&recs));
    assert_eq!(registry.state(&recs), JobState::Failed);
    assert!(registry.is_polling(&overview));
    assert_eq!(overview_rec.count(), 0);

    advance_polls(3).await;
    assert_eq!(overview_rec.successes(), 1);
    assert_eq!(recs_rec.count(), 1);
    assert_eq!(overview_fetcher.calls(), 6);
}

#[tokio::test(start_paused = true)]
async fn ready_after_three_empties_fires_once_and_removes_session() {
    let flags = Arc::new(MemoryFlagStore::new());
    let bus = NotificationBus::default();
    let registry = PollingRegistry::new(flags.clone(), bus.clone(), &fast_config());
    let mut sink = bus.mount_sink();

    let key = PollKey::for_target(
        AnalysisKind::DeviceRecommendations,
        &ResourceId::device("P1", "SW1"),
    );
    assert_eq!(key.as_str(), "device_recs_P1_SW1");
    flags.set(&key.flag_key("llm_generating_")).unwrap();

    let fetcher = Arc::new(ScriptedFetcher::ready_after(3, json!({ "recs": ["enable bpduguard"] })));
    let rec = RecordingCallbacks::new();
    registry
        .start_polling(
            PollRequest::new(
                key.clone(),
                ResourceId::device("P1", "SW1"),
                fetcher.clone(),
                rec.callbacks(),
            )
            .with_subject("Device recommendations"),
        )
        .unwrap();

    advance_polls(4).await;
    assert_eq!(rec.successes(), 1);
    assert_eq!(rec.errors(), 0);
    assert!(!registry.is_polling(&key));
    assert!(!flags.get("llm_generating_device_recs_P1_SW1"));
    assert_eq!(registry.state(&key), JobState::Done);

    let notice = sink.try_recv().unwrap();
    assert_eq!(notice.level, NoticeLevel::Success);
    assert_eq!(notice.title, "Device recommendations ready");

    advance_polls(5).await;
    assert_eq!(fetcher.calls(), 4);
    assert_eq!(rec.count(), 1);
}

#[tokio::test(start_paused = true)]
async fn key_can_be_polled_again_after_terminal_outcome() {
    let registry = registry();
    let key = PollKey::from_raw("topology_P1");
    let rec = RecordingCallbacks::new();

    let first = Arc::new(ScriptedFetcher::ready_after(0, json!(1)));
    registry.start_polling(poll(&key, &first, &rec)).unwrap();
    advance_polls(1).await;
    assert!(!registry.is_polling(&key));

    let second = Arc::new(ScriptedFetcher::ready_after(0, json!(2)));
    registry.start_polling(poll(&key, &second, &rec)).unwrap();
    assert_eq!(registry.state(&key), JobState::Starting);
    advance_polls(1).await;
    assert_eq!(rec.successes(), 2);
}
