//! Seams between the tracker and whatever backs the scan signals.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::observer::signals::{
    ProviderStageEvent, PushMessage, ScanProgressSnapshot, ScanStatus, SignalError,
};

/// Receiving half of a push subscription. A closed channel means the
/// subscription ended.
pub type PushStream = mpsc::Receiver<Result<PushMessage, SignalError>>;

/// Pull access to the four progress signals of a scan.
#[async_trait]
pub trait ProgressSource: Send + Sync {
    /// Session status, `None` when the session row is missing.
    async fn scan_status(&self, scan_id: &str) -> Result<Option<ScanStatus>, SignalError>;

    /// Every stage event of the scan, in write order.
    async fn stage_events(&self, scan_id: &str) -> Result<Vec<ProviderStageEvent>, SignalError>;

    async fn findings_count(&self, scan_id: &str) -> Result<u64, SignalError>;

    async fn snapshot(&self, scan_id: &str) -> Result<Option<ScanProgressSnapshot>, SignalError>;
}

/// Push notifications for a scan.
#[async_trait]
pub trait PushFeed: Send + Sync {
    /// Change feed on the snapshot row.
    async fn subscribe_snapshot(&self, scan_id: &str) -> Result<PushStream, SignalError>;

    /// Broadcast topic `scan_progress:{scan_id}`.
    async fn subscribe_broadcast(&self, scan_id: &str) -> Result<PushStream, SignalError>;
}
