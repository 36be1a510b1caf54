//! Scan tracking through the public observer API.

use std::sync::Arc;
use std::time::Duration;

use provider_guard::config::ObserverConfig;
use provider_guard::observer::{
    ClientScanPointer, ConnectionStatus, FilePointerStore, MemorySignals, PointerStore,
    ProviderStage, PushFeed, PushMessage, ScanProgressSnapshot, ScanStatus, ScanTracker,
};

fn tracker(signals: &Arc<MemorySignals>, pointers: Arc<FilePointerStore>) -> ScanTracker {
    let feed: Arc<dyn PushFeed> = signals.clone();
    ScanTracker::new(signals.clone(), Some(feed), pointers, ObserverConfig::default())
}

#[tokio::test(start_paused = true)]
async fn test_push_completion_reaches_subscribers_before_next_poll() {
    let dir = tempfile::tempdir().unwrap();
    let pointers = Arc::new(FilePointerStore::new(dir.path().join("active_scan.json")));
    let signals = Arc::new(MemorySignals::new());
    signals.set_status("scan-1", "running");
    signals.push_stage("scan-1", "hibp", ProviderStage::Complete);
    signals.push_stage("scan-1", "shodan", ProviderStage::Start);
    signals.push_stage("scan-1", "dehashed", ProviderStage::Complete);
    signals.set_findings("scan-1", 4);
    signals.set_snapshot(ScanProgressSnapshot {
        scan_id: "scan-1".into(),
        status: Some(ScanStatus::Running),
        completed_providers: 1,
        total_providers: 3,
        current_providers: vec!["shodan".into()],
        findings_count: 4,
        message: Some("Querying shodan".into()),
    });

    let tracker = tracker(&signals, pointers.clone());
    let mut views = tracker.subscribe();
    tracker.start_tracking(ClientScanPointer::new("scan-1", "email", "someone@example.com"));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let progress = tracker.view().progress.unwrap();
    assert_eq!(progress.status, ScanStatus::Running);
    assert_eq!(progress.completed_providers, 2);
    assert_eq!(progress.total_providers, 3);
    assert_eq!(progress.findings_count, 4);
    assert!(!progress.is_terminal);

    signals.publish("scan-1", PushMessage::ProviderUpdate);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(tracker.view().connection_status, ConnectionStatus::Connected);

    signals.push_stage("scan-1", "shodan", ProviderStage::Complete);
    signals.set_findings("scan-1", 9);
    signals.set_status("scan-1", "completed");
    signals.publish("scan-1", PushMessage::ScanComplete);
    tokio::time::sleep(Duration::from_millis(10)).await;

    let _ = views.borrow_and_update();
    let progress = tracker.view().progress.unwrap();
    assert_eq!(progress.status, ScanStatus::Completed);
    assert!(progress.is_terminal);
    assert_eq!(progress.completed_providers, 3);
    assert_eq!(progress.findings_count, 9);
    assert!(pointers.load().unwrap().is_some());

    tokio::time::sleep(Duration::from_millis(3_100)).await;
    assert!(views.has_changed().unwrap());
    assert!(views.borrow_and_update().active_scan.is_none());
    assert!(pointers.load().unwrap().is_none());
    assert_eq!(signals.subscriber_count("scan-1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_pointer_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("active_scan.json");
    let signals = Arc::new(MemorySignals::new());
    signals.set_status("scan-2", "running");

    let first = tracker(&signals, Arc::new(FilePointerStore::new(&path)));
    first.start_tracking(ClientScanPointer::new("scan-2", "username", "octocat"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    drop(first);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(signals.subscriber_count("scan-2"), 0);

    let second = tracker(&signals, Arc::new(FilePointerStore::new(&path)));
    let resumed = second.resume().unwrap().unwrap();
    assert_eq!(resumed.scan_id, "scan-2");
    assert_eq!(resumed.target, "octocat");
    tokio::time::sleep(Duration::from_millis(10)).await;

    let view = second.view();
    assert_eq!(view.active_scan.unwrap().scan_id, "scan-2");
    assert_eq!(view.progress.unwrap().status, ScanStatus::Running);

    second.clear_active_scan();
    assert!(FilePointerStore::new(&path).load().unwrap().is_none());
}
