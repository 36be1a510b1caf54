//! Merge rule for the four progress signals.
//!
//! # Rule
//! - Status: terminal session status, else a non-terminal snapshot status,
//!   else `running`. Only the session can make the view terminal
//! - Counts: max of the stage-event tally and the snapshot counters
//! - Findings: findings counter, else the snapshot's own count
//! - Message and active providers: snapshot only
//!
//! Each read may fail on its own; a failed read counts as absent.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::observability::metrics;
use crate::observer::signals::{
    ProviderStageEvent, ScanProgress, ScanProgressSnapshot, ScanStatus, SignalError,
};
use crate::observer::source::ProgressSource;

/// Providers seen in the stage stream, and how many of them are done.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageTally {
    pub completed: u32,
    pub total: u32,
}

/// Tally providers by their latest stage.
///
/// Latest means newest `created_at`; events without a timestamp, or with
/// equal ones, are ordered by position.
pub fn tally_stages(events: &[ProviderStageEvent]) -> StageTally {
    let mut latest: HashMap<&str, (Option<DateTime<Utc>>, usize, bool)> = HashMap::new();

    for (position, event) in events.iter().enumerate() {
        let candidate = (event.created_at, position, event.stage.is_finished());
        latest
            .entry(event.provider.as_str())
            .and_modify(|current| {
                if (candidate.0, candidate.1) >= (current.0, current.1) {
                    *current = candidate;
                }
            })
            .or_insert(candidate);
    }

    StageTally {
        completed: latest.values().filter(|(_, _, done)| *done).count() as u32,
        total: latest.len() as u32,
    }
}

/// Whatever the last fetch managed to read.
#[derive(Debug, Clone, Default)]
pub struct SignalReadings {
    pub session_status: Option<ScanStatus>,
    pub stage_events: Option<Vec<ProviderStageEvent>>,
    pub findings_count: Option<u64>,
    pub snapshot: Option<ScanProgressSnapshot>,
}

/// Apply the merge rule.
pub fn merge(scan_id: &str, readings: &SignalReadings, now: DateTime<Utc>) -> ScanProgress {
    let snapshot = readings.snapshot.as_ref();

    // Only the session may end a scan; a terminal snapshot reads as running.
    let status = match (&readings.session_status, snapshot.and_then(|s| s.status.clone())) {
        (Some(session), _) if session.is_terminal() => session.clone(),
        (_, Some(from_snapshot)) if !from_snapshot.is_terminal() => from_snapshot,
        _ => ScanStatus::Running,
    };

    let tally = readings
        .stage_events
        .as_deref()
        .map(tally_stages)
        .unwrap_or_default();

    let completed_providers = tally
        .completed
        .max(snapshot.map(|s| s.completed_providers).unwrap_or(0));
    let total_providers = tally
        .total
        .max(snapshot.map(|s| s.total_providers).unwrap_or(0));

    let findings_count = readings
        .findings_count
        .or_else(|| snapshot.map(|s| s.findings_count))
        .unwrap_or(0);

    ScanProgress {
        scan_id: scan_id.to_string(),
        is_terminal: status.is_terminal(),
        status,
        completed_providers,
        total_providers,
        current_providers: snapshot.map(|s| s.current_providers.clone()).unwrap_or_default(),
        findings_count,
        message: snapshot.and_then(|s| s.message.clone()),
        updated_at: now,
    }
}

/// Fold a fresh reading into what is already displayed.
///
/// Returns `None` when the displayed progress is already terminal, which
/// freezes it. Counts keep their high-water mark within one scan.
pub fn settle(previous: Option<&ScanProgress>, next: ScanProgress) -> Option<ScanProgress> {
    match previous {
        Some(prev) if prev.scan_id == next.scan_id && prev.is_terminal => None,
        Some(prev) if prev.scan_id == next.scan_id => Some(ScanProgress {
            completed_providers: next.completed_providers.max(prev.completed_providers),
            total_providers: next.total_providers.max(prev.total_providers),
            ..next
        }),
        _ => Some(next),
    }
}

/// Read all four signals concurrently and merge them.
///
/// Fails only when every read failed.
pub async fn fetch_progress(
    source: &dyn ProgressSource,
    scan_id: &str,
) -> Result<ScanProgress, SignalError> {
    let (status, events, findings, snapshot) = tokio::join!(
        source.scan_status(scan_id),
        source.stage_events(scan_id),
        source.findings_count(scan_id),
        source.snapshot(scan_id),
    );

    let mut failures = 0;
    let mut last_error = None;
    let mut keep = |signal: &'static str, err: SignalError| {
        tracing::warn!(scan_id = %scan_id, signal, error = %err, "Signal read failed");
        failures += 1;
        last_error = Some(err);
    };

    let readings = SignalReadings {
        session_status: status.unwrap_or_else(|e| {
            keep("scan_status", e);
            None
        }),
        stage_events: events.map(Some).unwrap_or_else(|e| {
            keep("stage_events", e);
            None
        }),
        findings_count: findings.map(Some).unwrap_or_else(|e| {
            keep("findings_count", e);
            None
        }),
        snapshot: snapshot.unwrap_or_else(|e| {
            keep("snapshot", e);
            None
        }),
    };

    if failures == 4 {
        metrics::record_observer_fetch("error");
        return Err(last_error
            .unwrap_or_else(|| SignalError::Unavailable("every signal read failed".into())));
    }
    metrics::record_observer_fetch(if failures == 0 { "ok" } else { "partial" });

    Ok(merge(scan_id, &readings, Utc::now()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::signals::ProviderStage;
    use chrono::Duration;

    fn stage(provider: &str, stage: &str, at: Option<DateTime<Utc>>) -> ProviderStageEvent {
        ProviderStageEvent {
            scan_id: "s1".into(),
            provider: provider.into(),
            stage: ProviderStage::from(stage.to_string()),
            created_at: at,
        }
    }

    fn snapshot(status: &str, completed: u32, total: u32) -> ScanProgressSnapshot {
        ScanProgressSnapshot {
            scan_id: "s1".into(),
            status: Some(ScanStatus::from(status)),
            completed_providers: completed,
            total_providers: total,
            current_providers: vec!["shodan".into()],
            findings_count: 7,
            message: Some("Querying shodan".into()),
        }
    }

    #[test]
    fn test_tally_uses_latest_stage_per_provider() {
        let t0 = Utc::now();
        let events = vec![
            stage("hibp", "start", Some(t0)),
            stage("hibp", "completed", Some(t0 + Duration::seconds(2))),
            stage("shodan", "start", Some(t0)),
            stage("shodan", "progress", Some(t0 + Duration::seconds(1))),
            stage("dehashed", "failed", Some(t0 + Duration::seconds(1))),
            // Late-arriving older row must not win.
            stage("dehashed", "start", Some(t0)),
        ];
        assert_eq!(tally_stages(&events), StageTally { completed: 2, total: 3 });
    }

    #[test]
    fn test_tally_without_timestamps_uses_write_order() {
        let events = vec![
            stage("hibp", "complete", None),
            stage("hibp", "start", None),
            stage("shodan", "timeout", None),
        ];
        assert_eq!(tally_stages(&events), StageTally { completed: 1, total: 2 });
    }

    #[test]
    fn test_terminal_session_overrides_snapshot() {
        let readings = SignalReadings {
            session_status: Some(ScanStatus::CompletedPartial),
            snapshot: Some(snapshot("running", 1, 4)),
            ..Default::default()
        };
        let progress = merge("s1", &readings, Utc::now());
        assert_eq!(progress.status, ScanStatus::CompletedPartial);
        assert!(progress.is_terminal);
        assert_eq!(progress.message.as_deref(), Some("Querying shodan"));
    }

    #[test]
    fn test_non_terminal_session_defers_to_snapshot_then_running() {
        let readings = SignalReadings {
            session_status: Some(ScanStatus::Pending),
            snapshot: Some(snapshot("running", 0, 0)),
            ..Default::default()
        };
        assert_eq!(merge("s1", &readings, Utc::now()).status, ScanStatus::Running);

        let readings = SignalReadings {
            session_status: Some(ScanStatus::Pending),
            ..Default::default()
        };
        let progress = merge("s1", &readings, Utc::now());
        assert_eq!(progress.status, ScanStatus::Running);
        assert!(!progress.is_terminal);
    }

    #[test]
    fn test_terminal_snapshot_does_not_end_the_scan() {
        let mut readings = SignalReadings {
            session_status: Some(ScanStatus::Running),
            snapshot: Some(snapshot("completed", 4, 4)),
            ..Default::default()
        };
        let progress = merge("s1", &readings, Utc::now());
        assert_eq!(progress.status, ScanStatus::Running);
        assert!(!progress.is_terminal);
        assert_eq!(progress.completed_providers, 4);

        readings.session_status = None;
        assert!(!merge("s1", &readings, Utc::now()).is_terminal);

        readings.session_status = Some(ScanStatus::Failed);
        let shown = settle(Some(&progress), merge("s1", &readings, Utc::now())).unwrap();
        assert_eq!(shown.status, ScanStatus::Failed);
        assert!(shown.is_terminal);
    }

    #[test]
    fn test_counts_take_the_larger_source() {
        let readings = SignalReadings {
            stage_events: Some(vec![
                stage("a", "completed", None),
                stage("b", "completed", None),
                stage("c", "start", None),
            ]),
            snapshot: Some(snapshot("running", 1, 5)),
            ..Default::default()
        };
        let progress = merge("s1", &readings, Utc::now());
        assert_eq!(progress.completed_providers, 2);
        assert_eq!(progress.total_providers, 5);
    }

    #[test]
    fn test_findings_prefer_counter_over_snapshot() {
        let mut readings = SignalReadings {
            findings_count: Some(12),
            snapshot: Some(snapshot("running", 0, 1)),
            ..Default::default()
        };
        assert_eq!(merge("s1", &readings, Utc::now()).findings_count, 12);
        readings.findings_count = None;
        assert_eq!(merge("s1", &readings, Utc::now()).findings_count, 7);
    }

    #[test]
    fn test_settle_freezes_terminal_and_keeps_high_water_mark() {
        let running = |completed, total| {
            merge(
                "s1",
                &SignalReadings {
                    snapshot: Some(snapshot("running", completed, total)),
                    ..Default::default()
                },
                Utc::now(),
            )
        };

        let shown = settle(None, running(3, 5)).unwrap();
        // Orchestrator reset its counters.
        let shown = settle(Some(&shown), running(0, 0)).unwrap();
        assert_eq!((shown.completed_providers, shown.total_providers), (3, 5));

        let done = merge(
            "s1",
            &SignalReadings {
                session_status: Some(ScanStatus::Completed),
                ..Default::default()
            },
            Utc::now(),
        );
        let shown = settle(Some(&shown), done).unwrap();
        assert_eq!(shown.status, ScanStatus::Completed);
        assert!(settle(Some(&shown), running(5, 5)).is_none());

        // A different scan starts fresh.
        let mut other = running(0, 2);
        other.scan_id = "s2".into();
        assert_eq!(settle(Some(&shown), other).unwrap().total_providers, 2);
    }
}
