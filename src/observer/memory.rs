//! In-process signal backend.
//!
//! Holds the four signals in memory and fans push messages out to
//! subscribers. Used when the tracker is embedded next to the orchestrator,
//! and by tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::observer::signals::{
    ProviderStage, ProviderStageEvent, PushMessage, ScanProgressSnapshot, ScanStatus, SignalError,
};
use crate::observer::source::{ProgressSource, PushFeed, PushStream};

const SUBSCRIPTION_BUFFER: usize = 64;

type Subscribers = DashMap<String, Vec<mpsc::Sender<Result<PushMessage, SignalError>>>>;

#[derive(Default)]
pub struct MemorySignals {
    statuses: DashMap<String, ScanStatus>,
    stages: DashMap<String, Vec<ProviderStageEvent>>,
    findings: DashMap<String, u64>,
    snapshots: DashMap<String, ScanProgressSnapshot>,
    snapshot_subscribers: Subscribers,
    broadcast_subscribers: Subscribers,
    reads_unavailable: AtomicBool,
    subscriptions_unavailable: AtomicBool,
}

impl MemorySignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, scan_id: &str, status: impl Into<ScanStatus>) {
        self.statuses.insert(scan_id.to_string(), status.into());
    }

    /// Append a stage event stamped now.
    pub fn push_stage(&self, scan_id: &str, provider: &str, stage: ProviderStage) {
        self.stages
            .entry(scan_id.to_string())
            .or_default()
            .push(ProviderStageEvent {
                scan_id: scan_id.to_string(),
                provider: provider.to_string(),
                stage,
                created_at: Some(Utc::now()),
            });
    }

    pub fn set_findings(&self, scan_id: &str, count: u64) {
        self.findings.insert(scan_id.to_string(), count);
    }

    pub fn set_snapshot(&self, snapshot: ScanProgressSnapshot) {
        self.snapshots.insert(snapshot.scan_id.clone(), snapshot);
    }

    /// Make every read fail until switched back.
    pub fn set_reads_unavailable(&self, unavailable: bool) {
        self.reads_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make new subscriptions fail until switched back.
    pub fn set_subscriptions_unavailable(&self, unavailable: bool) {
        self.subscriptions_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Deliver a push message to the matching channel's subscribers.
    /// Returns how many subscribers received it.
    pub fn publish(&self, scan_id: &str, message: PushMessage) -> usize {
        let subscribers = if message.is_broadcast() {
            &self.broadcast_subscribers
        } else {
            &self.snapshot_subscribers
        };
        Self::deliver(subscribers, scan_id, || Ok(message.clone()))
    }

    /// Fail every open subscription of a scan.
    pub fn fail_subscriptions(&self, scan_id: &str, reason: &str) -> usize {
        let make = || Err(SignalError::Subscription(reason.to_string()));
        Self::deliver(&self.snapshot_subscribers, scan_id, make)
            + Self::deliver(&self.broadcast_subscribers, scan_id, make)
    }

    /// Open subscriptions of a scan across both channels.
    pub fn subscriber_count(&self, scan_id: &str) -> usize {
        let count = |subs: &Subscribers| {
            subs.get(scan_id)
                .map(|s| s.iter().filter(|tx| !tx.is_closed()).count())
                .unwrap_or(0)
        };
        count(&self.snapshot_subscribers) + count(&self.broadcast_subscribers)
    }

    fn deliver(
        subscribers: &Subscribers,
        scan_id: &str,
        make: impl Fn() -> Result<PushMessage, SignalError>,
    ) -> usize {
        let Some(mut senders) = subscribers.get_mut(scan_id) else {
            return 0;
        };
        senders.retain(|tx| !tx.is_closed());
        senders.iter().filter(|tx| tx.try_send(make()).is_ok()).count()
    }

    fn subscribe(&self, subscribers: &Subscribers, scan_id: &str) -> Result<PushStream, SignalError> {
        if self.subscriptions_unavailable.load(Ordering::SeqCst) {
            return Err(SignalError::Subscription("push channel unavailable".into()));
        }
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        subscribers.entry(scan_id.to_string()).or_default().push(tx);
        Ok(rx)
    }

    fn check_available(&self) -> Result<(), SignalError> {
        if self.reads_unavailable.load(Ordering::SeqCst) {
            return Err(SignalError::Unavailable("memory signals switched off".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl ProgressSource for MemorySignals {
    async fn scan_status(&self, scan_id: &str) -> Result<Option<ScanStatus>, SignalError> {
        self.check_available()?;
        Ok(self.statuses.get(scan_id).map(|s| s.value().clone()))
    }

    async fn stage_events(&self, scan_id: &str) -> Result<Vec<ProviderStageEvent>, SignalError> {
        self.check_available()?;
        Ok(self.stages.get(scan_id).map(|s| s.value().clone()).unwrap_or_default())
    }

    async fn findings_count(&self, scan_id: &str) -> Result<u64, SignalError> {
        self.check_available()?;
        Ok(self.findings.get(scan_id).map(|c| *c.value()).unwrap_or(0))
    }

    async fn snapshot(&self, scan_id: &str) -> Result<Option<ScanProgressSnapshot>, SignalError> {
        self.check_available()?;
        Ok(self.snapshots.get(scan_id).map(|s| s.value().clone()))
    }
}

#[async_trait]
impl PushFeed for MemorySignals {
    async fn subscribe_snapshot(&self, scan_id: &str) -> Result<PushStream, SignalError> {
        self.subscribe(&self.snapshot_subscribers, scan_id)
    }

    async fn subscribe_broadcast(&self, scan_id: &str) -> Result<PushStream, SignalError> {
        self.subscribe(&self.broadcast_subscribers, scan_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_routes_by_channel() {
        let signals = MemorySignals::new();
        let mut snapshot_rx = signals.subscribe_snapshot("s1").await.unwrap();
        let mut broadcast_rx = signals.subscribe_broadcast("s1").await.unwrap();

        assert_eq!(signals.publish("s1", PushMessage::ScanComplete), 1);
        assert_eq!(signals.publish("s1", PushMessage::SnapshotChanged), 1);
        assert_eq!(signals.publish("other", PushMessage::SnapshotChanged), 0);

        assert_eq!(broadcast_rx.recv().await.unwrap().unwrap(), PushMessage::ScanComplete);
        assert_eq!(snapshot_rx.recv().await.unwrap().unwrap(), PushMessage::SnapshotChanged);
    }

    #[tokio::test]
    async fn test_dropped_subscribers_are_pruned() {
        let signals = MemorySignals::new();
        let rx = signals.subscribe_broadcast("s1").await.unwrap();
        assert_eq!(signals.subscriber_count("s1"), 1);
        drop(rx);
        assert_eq!(signals.subscriber_count("s1"), 0);
        assert_eq!(signals.publish("s1", PushMessage::ProviderUpdate), 0);
    }

    #[tokio::test]
    async fn test_unavailable_reads_fail() {
        let signals = MemorySignals::new();
        signals.set_status("s1", "running");
        signals.set_reads_unavailable(true);
        assert!(signals.scan_status("s1").await.is_err());
        signals.set_reads_unavailable(false);
        assert_eq!(signals.scan_status("s1").await.unwrap(), Some(ScanStatus::Running));
    }
}
