use futures::StreamExt;
use peerfetch::peer::parse_signal_message;
use peerfetch::session::SessionStateName;
use peerfetch::{
    BatchPlan, CopyFailureReason, FetchConfig, FetchOutcome, FsDelivery, MockDelivery,
    MockPeerNotifier, MockStore, Orchestrator, PeerfetchError, SessionEventKind, SharedStore,
    SignalFailure, WebSocketNotifier,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _store_dir: tempfile::TempDir,
    dest_dir: tempfile::TempDir,
    store: Arc<MockStore>,
    notifier: Arc<MockPeerNotifier>,
    delivery: Arc<MockDelivery>,
}

impl Fixture {
    fn new() -> Self {
        let store_dir = tempfile::tempdir().expect("Failed to create store dir");
        let dest_dir = tempfile::tempdir().expect("Failed to create destination dir");
        let store = Arc::new(MockStore::new(store_dir.path()));
        Self {
            _store_dir: store_dir,
            dest_dir,
            store,
            notifier: Arc::new(MockPeerNotifier::new()),
            delivery: Arc::new(MockDelivery::new()),
        }
    }

    fn orchestrator(&self) -> Orchestrator<MockStore, MockPeerNotifier, MockDelivery> {
        Orchestrator::new(
            self.store.clone(),
            self.notifier.clone(),
            self.delivery.clone(),
            FetchConfig::default(),
            CancellationToken::new(),
        )
    }

    fn plan(&self, names: &[&str]) -> BatchPlan {
        BatchPlan::from_names(self.dest_dir.path(), names.iter().copied())
            .expect("Failed to build plan")
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_present_artifact_is_delivered_without_signaling() {
    let fx = Fixture::new();
    fx.store.add_present("report.pdf", b"%PDF-1.7");

    let result = fx
        .orchestrator()
        .run_batch(fx.plan(&["report.pdf"]))
        .await
        .expect("Batch failed");

    assert_eq!(
        result.outcome("report.pdf"),
        Some(&FetchOutcome::Delivered {
            destination: fx.dest_dir.path().join("report.pdf"),
            bytes: 8,
            attempts: 0,
        })
    );
    assert_eq!(fx.notifier.call_count(), 0);
    // Only the initial local check
    assert_eq!(fx.store.lookup_count("report.pdf"), 1);
    assert_eq!(
        std::fs::read(fx.dest_dir.path().join("report.pdf")).unwrap(),
        b"%PDF-1.7"
    );
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_artifact_appearing_on_fifth_poll_is_delivered() {
    let fx = Fixture::new();
    // Local check, then visible on the fifth poll lookup
    fx.store.add_after_lookups("movie.mp4", 6, b"frames");

    let result = fx
        .orchestrator()
        .run_batch(fx.plan(&["movie.mp4"]))
        .await
        .expect("Batch failed");

    assert!(matches!(
        result.outcome("movie.mp4"),
        Some(FetchOutcome::Delivered { attempts: 5, .. })
    ));
    assert_eq!(fx.store.lookup_count("movie.mp4"), 6);
    assert_eq!(fx.notifier.get_calls().len(), 1);
    assert_eq!(fx.notifier.get_calls()[0].as_str(), "movie.mp4");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_missing_artifact_times_out_after_twenty_lookups() {
    let fx = Fixture::new();
    fx.store.add_missing("ghost.bin");

    let start = tokio::time::Instant::now();
    let result = fx
        .orchestrator()
        .run_batch(fx.plan(&["ghost.bin"]))
        .await
        .expect("Batch failed");
    let elapsed = start.elapsed();

    assert_eq!(
        result.outcome("ghost.bin"),
        Some(&FetchOutcome::TimedOut { attempts: 20 })
    );
    assert_eq!(fx.store.lookup_count("ghost.bin"), 21);
    assert_eq!(fx.delivery.call_count(), 0);
    assert!(elapsed >= Duration::from_secs(10), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(11), "elapsed {elapsed:?}");
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_partial_batch_keeps_successes() {
    let fx = Fixture::new();
    fx.store.add_present("a.txt", b"alpha");
    fx.store.add_missing("b.txt");

    let result = fx
        .orchestrator()
        .run_batch(fx.plan(&["a.txt", "b.txt"]))
        .await
        .expect("Batch failed");

    assert_eq!(result.total_requests, 2);
    assert!(result.outcome("a.txt").unwrap().is_delivered());
    assert_eq!(
        result.outcome("b.txt"),
        Some(&FetchOutcome::TimedOut { attempts: 20 })
    );
    let failed: Vec<&str> = result.failed().iter().map(|n| n.as_str()).collect();
    assert_eq!(failed, vec!["b.txt"]);
    assert!(!result.is_fully_delivered());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_unwritable_destination_fails_every_copy() {
    let fx = Fixture::new();
    // Both appear on the first poll lookup, after the root is gone
    fx.store.add_after_lookups("a.txt", 2, b"a");
    fx.store.add_after_lookups("b.txt", 2, b"b");

    let root = fx.dest_dir.path().join("picked");
    std::fs::create_dir(&root).unwrap();
    let plan = BatchPlan::from_names(&root, ["a.txt", "b.txt"]).unwrap();

    let handle = fx
        .orchestrator()
        .spawn_batch(plan)
        .expect("Failed to start batch");
    std::fs::remove_dir(&root).unwrap();
    let result = handle.wait().await.expect("Batch failed");

    for name in ["a.txt", "b.txt"] {
        match result.outcome(name) {
            Some(FetchOutcome::CopyFailed(failure)) => {
                assert_eq!(failure.reason, CopyFailureReason::DestinationUnwritable)
            }
            other => panic!("expected copy failure for {name}, got {other:?}"),
        }
    }
    assert!(!root.exists());
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_source_removed_mid_copy_is_source_vanished() {
    let fx = Fixture::new();
    fx.store.add_present("a.txt", b"alpha");
    let trigger = fx.delivery.add_trigger();

    let mut handle = fx
        .orchestrator()
        .spawn_batch(fx.plan(&["a.txt"]))
        .expect("Failed to start batch");
    let mut events = handle.take_events().expect("Events already taken");

    while let Some(event) = events.recv().await {
        if event.kind == SessionEventKind::Entered(SessionStateName::Copying) {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fx.delivery.in_flight_count(), 1);

    fx.store.remove("a.txt");
    trigger.send(()).unwrap();
    let result = handle.wait().await.expect("Batch failed");

    match result.outcome("a.txt") {
        Some(FetchOutcome::CopyFailed(failure)) => {
            assert_eq!(failure.reason, CopyFailureReason::SourceVanished)
        }
        other => panic!("expected source vanished, got {other:?}"),
    }
    assert!(!fx.dest_dir.path().join("a.txt").exists());
}

#[test_log::test(tokio::test)]
async fn test_empty_batch_has_no_side_effects() {
    let fx = Fixture::new();

    let plan = BatchPlan::from_names(fx.dest_dir.path(), Vec::<String>::new());
    assert!(matches!(plan, Err(PeerfetchError::EmptyBatch)));

    let plan = BatchPlan::from_requests(fx.dest_dir.path(), Vec::new());
    assert!(matches!(plan, Err(PeerfetchError::EmptyBatch)));

    assert_eq!(fx.store.total_lookups(), 0);
    assert_eq!(fx.notifier.call_count(), 0);
    assert_eq!(fx.delivery.call_count(), 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_outcomes_do_not_depend_on_request_order() {
    let mut results = Vec::new();
    for order in [
        ["a.txt", "b.txt", "c.txt"],
        ["c.txt", "a.txt", "b.txt"],
        ["b.txt", "c.txt", "a.txt"],
    ] {
        let fx = Fixture::new();
        fx.store.add_present("a.txt", b"a");
        fx.store.add_after_lookups("b.txt", 3, b"b");
        fx.store.add_missing("c.txt");

        let result = fx
            .orchestrator()
            .run_batch(fx.plan(&order))
            .await
            .expect("Batch failed");
        let labels: Vec<(String, &'static str)> = result
            .outcomes
            .iter()
            .map(|(name, outcome)| (name.to_string(), outcome.label()))
            .collect();
        results.push(labels);
    }

    assert_eq!(
        results[0],
        vec![
            ("a.txt".to_string(), "delivered"),
            ("b.txt".to_string(), "delivered"),
            ("c.txt".to_string(), "timed_out"),
        ]
    );
    assert!(results.iter().all(|r| r == &results[0]));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_unreachable_peer_still_polls() {
    let fx = Fixture::new();
    let notifier = Arc::new(MockPeerNotifier::unreachable(SignalFailure::Connect {
        endpoint: "ws://localhost:8765".to_string(),
        error: "connection refused".to_string(),
    }));
    fx.store.add_after_lookups("late.bin", 4, b"late");
    fx.store.add_missing("never.bin");

    let orchestrator = Orchestrator::new(
        fx.store.clone(),
        notifier.clone(),
        fx.delivery.clone(),
        FetchConfig::default(),
        CancellationToken::new(),
    );
    let result = orchestrator
        .run_batch(fx.plan(&["late.bin", "never.bin"]))
        .await
        .expect("Batch failed");

    assert!(matches!(
        result.outcome("late.bin"),
        Some(FetchOutcome::Delivered { attempts: 3, .. })
    ));
    assert!(matches!(
        result.outcome("never.bin"),
        Some(FetchOutcome::SignalFailed { attempts: 20, .. })
    ));
    assert_eq!(notifier.call_count(), 2);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_rejected_names_are_reported_alongside_outcomes() {
    let fx = Fixture::new();
    fx.store.add_present("a.txt", b"a");

    let result = fx
        .orchestrator()
        .run_batch(fx.plan(&["a.txt", "../escape", "a.txt"]))
        .await
        .expect("Batch failed");

    assert_eq!(result.total_requests, 1);
    assert!(result.outcome("a.txt").unwrap().is_delivered());
    assert!(result.rejected.contains_key("../escape"));
    assert_eq!(fx.store.lookup_count("a.txt"), 1);
}

#[test_log::test(tokio::test)]
async fn test_end_to_end_with_websocket_peer() {
    let store_dir = tempfile::tempdir().unwrap();
    let dest_dir = tempfile::tempdir().unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    // A peer that produces whatever it is asked for
    let peer_root = store_dir.path().to_path_buf();
    let peer = tokio::spawn(async move {
        let mut produced = Vec::new();
        while let Ok(Ok((stream, _))) =
            tokio::time::timeout(Duration::from_secs(2), listener.accept()).await
        {
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(message)) = socket.next().await {
                if let Message::Text(text) = message
                    && let Some(name) = parse_signal_message(text.as_str())
                {
                    let staging = peer_root.join(format!(".{name}.tmp"));
                    std::fs::write(&staging, format!("made {name}")).unwrap();
                    std::fs::rename(&staging, peer_root.join(name)).unwrap();
                    produced.push(name.to_string());
                }
            }
        }
        produced
    });

    std::fs::write(store_dir.path().join("cached.txt"), b"cached").unwrap();

    let config = FetchConfig {
        poll_interval_ms: 20,
        max_attempts: 50,
        peer_url: format!("ws://{addr}"),
        ..Default::default()
    };
    let orchestrator = Orchestrator::new(
        Arc::new(SharedStore::new(store_dir.path())),
        Arc::new(WebSocketNotifier::new(config.peer_url.clone())),
        Arc::new(FsDelivery::new()),
        config,
        CancellationToken::new(),
    );

    let plan = BatchPlan::from_names(dest_dir.path(), ["cached.txt", "fresh.txt"]).unwrap();
    let result = orchestrator.run_batch(plan).await.expect("Batch failed");

    assert!(result.is_fully_delivered(), "result: {result:?}");
    assert_eq!(
        std::fs::read_to_string(dest_dir.path().join("fresh.txt")).unwrap(),
        "made fresh.txt"
    );
    assert_eq!(
        std::fs::read(dest_dir.path().join("cached.txt")).unwrap(),
        b"cached"
    );

    let produced = peer.await.unwrap();
    assert_eq!(produced, vec!["fresh.txt".to_string()]);
}
