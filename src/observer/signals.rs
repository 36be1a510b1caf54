//! Scan progress signal types.
//!
//! These mirror the rows the orchestrator writes. Nothing here decides
//! anything; the merge rule lives in `reconcile.rs`.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Lifecycle status of a scan session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    CompletedEmpty,
    CompletedPartial,
    Failed,
    Timeout,
    /// Any status this build does not know. Never terminal.
    Other(String),
}

impl ScanStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::CompletedEmpty => "completed_empty",
            ScanStatus::CompletedPartial => "completed_partial",
            ScanStatus::Failed => "failed",
            ScanStatus::Timeout => "timeout",
            ScanStatus::Other(s) => s,
        }
    }

    /// Whether no further transitions can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed
                | ScanStatus::CompletedEmpty
                | ScanStatus::CompletedPartial
                | ScanStatus::Failed
                | ScanStatus::Timeout
        )
    }
}

impl From<String> for ScanStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => ScanStatus::Pending,
            "running" => ScanStatus::Running,
            "completed" => ScanStatus::Completed,
            "completed_empty" => ScanStatus::CompletedEmpty,
            "completed_partial" => ScanStatus::CompletedPartial,
            "failed" => ScanStatus::Failed,
            "timeout" => ScanStatus::Timeout,
            _ => ScanStatus::Other(s),
        }
    }
}

impl From<&str> for ScanStatus {
    fn from(s: &str) -> Self {
        ScanStatus::from(s.to_string())
    }
}

impl From<ScanStatus> for String {
    fn from(status: ScanStatus) -> Self {
        match status {
            ScanStatus::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stage a provider reported for one scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProviderStage {
    Start,
    Progress,
    /// Written as either `complete` or `completed`.
    Complete,
    Failed,
    Timeout,
    Other(String),
}

impl ProviderStage {
    /// The provider is done, whatever the outcome.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ProviderStage::Complete | ProviderStage::Failed | ProviderStage::Timeout
        )
    }
}

impl From<String> for ProviderStage {
    fn from(s: String) -> Self {
        match s.as_str() {
            "start" => ProviderStage::Start,
            "progress" => ProviderStage::Progress,
            "complete" | "completed" => ProviderStage::Complete,
            "failed" => ProviderStage::Failed,
            "timeout" => ProviderStage::Timeout,
            _ => ProviderStage::Other(s),
        }
    }
}

impl From<ProviderStage> for String {
    fn from(stage: ProviderStage) -> Self {
        match stage {
            ProviderStage::Start => "start".into(),
            ProviderStage::Progress => "progress".into(),
            ProviderStage::Complete => "complete".into(),
            ProviderStage::Failed => "failed".into(),
            ProviderStage::Timeout => "timeout".into(),
            ProviderStage::Other(s) => s,
        }
    }
}

/// One row of the per-provider stage stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStageEvent {
    pub scan_id: String,
    pub provider: String,
    pub stage: ProviderStage,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Denormalized progress row. Descriptive only, never completion authority.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanProgressSnapshot {
    pub scan_id: String,
    #[serde(default)]
    pub status: Option<ScanStatus>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub completed_providers: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub total_providers: u32,
    #[serde(default, deserialize_with = "null_as_default")]
    pub current_providers: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub findings_count: u64,
    #[serde(default)]
    pub message: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Reconciled view of one scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanProgress {
    pub scan_id: String,
    pub status: ScanStatus,
    pub completed_providers: u32,
    pub total_providers: u32,
    pub current_providers: Vec<String>,
    pub findings_count: u64,
    pub message: Option<String>,
    pub is_terminal: bool,
    pub updated_at: DateTime<Utc>,
}

/// Health of the push channel as seen by the tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

/// The locally persisted "scan in flight" slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientScanPointer {
    pub scan_id: String,
    #[serde(rename = "type")]
    pub scan_type: String,
    pub target: String,
    pub started_at: DateTime<Utc>,
}

impl ClientScanPointer {
    pub fn new(scan_id: impl Into<String>, scan_type: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            scan_id: scan_id.into(),
            scan_type: scan_type.into(),
            target: target.into(),
            started_at: Utc::now(),
        }
    }
}

/// A push notification. Only ever used as a wake signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushMessage {
    /// The snapshot row changed.
    SnapshotChanged,
    /// `provider_update` on the broadcast topic.
    ProviderUpdate,
    /// `scan_complete` on the broadcast topic.
    ScanComplete,
}

impl PushMessage {
    /// Map a broadcast event name, ignoring unknown events.
    pub fn from_broadcast_event(event: &str) -> Option<Self> {
        match event {
            "provider_update" => Some(PushMessage::ProviderUpdate),
            "scan_complete" => Some(PushMessage::ScanComplete),
            _ => None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        !matches!(self, PushMessage::SnapshotChanged)
    }
}

/// Errors from reading or subscribing to scan signals.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("failed to decode signal: {0}")]
    Decode(String),

    #[error("subscription error: {0}")]
    Subscription(String),

    #[error("signal source unavailable: {0}")]
    Unavailable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_set() {
        for s in ["completed", "completed_empty", "completed_partial", "failed", "timeout"] {
            assert!(ScanStatus::from(s).is_terminal(), "{s}");
        }
        for s in ["pending", "running", "cancelled", ""] {
            assert!(!ScanStatus::from(s).is_terminal(), "{s}");
        }
    }

    #[test]
    fn test_unknown_status_passes_through() {
        let status: ScanStatus = serde_json::from_str("\"enriching\"").unwrap();
        assert_eq!(status, ScanStatus::Other("enriching".into()));
        assert_eq!(serde_json::to_string(&status).unwrap(), "\"enriching\"");
    }

    #[test]
    fn test_both_complete_spellings_finish_a_provider() {
        assert!(ProviderStage::from("complete".to_string()).is_finished());
        assert!(ProviderStage::from("completed".to_string()).is_finished());
        assert!(!ProviderStage::from("progress".to_string()).is_finished());
    }

    #[test]
    fn test_snapshot_tolerates_nulls() {
        let json = r#"{"scan_id":"s1","status":"running","completed_providers":null,
            "total_providers":4,"current_providers":null,"findings_count":null,"message":"Querying"}"#;
        let snapshot: ScanProgressSnapshot = serde_json::from_str(json).unwrap();
        assert_eq!(snapshot.completed_providers, 0);
        assert_eq!(snapshot.total_providers, 4);
        assert!(snapshot.current_providers.is_empty());
        assert_eq!(snapshot.status, Some(ScanStatus::Running));
    }

    #[test]
    fn test_pointer_is_camel_case_on_disk() {
        let pointer = ClientScanPointer::new("s1", "email", "a@b.c");
        let json = serde_json::to_value(&pointer).unwrap();
        assert_eq!(json["scanId"], "s1");
        assert_eq!(json["type"], "email");
        assert!(json.get("startedAt").is_some());
    }
}
