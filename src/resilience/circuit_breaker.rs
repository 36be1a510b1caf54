//! Circuit breaker for provider protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: provider assumed down, calls are blocked until the cooldown ends
//! - Half-Open: probing whether the provider recovered
//!
//! # Design Decisions
//! - Per-provider circuit, stored as one row
//! - The breaker itself holds no per-provider state; every operation is a
//!   read-modify-write of the stored row committed with compare-and-swap
//! - Circuit row, health row and journal events are committed together, so a
//!   store failure records nothing
//! - An open circuit is a normal answer (`allowed: false`), not an error

use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{BreakerConfig, HealthConfig};
use crate::health::{CallOutcome, HealthScorer, ProviderHealth};
use crate::observability::metrics;
use crate::resilience::clock::{Clock, SystemClock};
use crate::resilience::state::{CircuitState, ProviderCircuitState};
use crate::store::{
    CircuitEvent, CircuitEventType, CommitOutcome, ProviderRecord, ProviderStore, StoreError,
};

/// Reason returned while an open circuit cools down.
pub const REASON_OPEN: &str = "Circuit breaker is open";
/// Reason returned when the half-open probe cap is exhausted.
pub const REASON_PROBE_LIMIT: &str = "Half-open probe limit reached";

/// Errors returned by breaker operations.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// Caller supplied an unusable request.
    #[error("{0}")]
    Validation(String),

    /// The store failed; nothing was recorded.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Concurrent writers kept winning the compare-and-swap.
    #[error("gave up on provider {provider_id} after {attempts} conflicting writes")]
    Conflict { provider_id: String, attempts: u32 },
}

/// Answer to `check`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResponse {
    pub allowed: bool,
    pub state: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CheckResponse {
    fn allowed(state: CircuitState) -> Self {
        Self {
            allowed: true,
            state,
            reason: None,
            next_attempt_at: None,
        }
    }
}

/// Answer to `get_health`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub health: Option<ProviderHealth>,
    pub circuit_breaker: ProviderCircuitState,
}

/// Live breaker settings; swapped on config reload.
#[derive(Debug, Clone, Default)]
pub struct BreakerSettings {
    pub breaker: BreakerConfig,
    pub scorer: HealthScorer,
}

impl BreakerSettings {
    pub fn new(breaker: BreakerConfig, health: HealthConfig) -> Self {
        Self {
            breaker,
            scorer: HealthScorer::new(health),
        }
    }
}

/// What a decision wants written, and what to hand back.
struct Decision<R> {
    record: Option<ProviderRecord>,
    events: Vec<CircuitEvent>,
    output: R,
}

impl<R> Decision<R> {
    fn read_only(output: R) -> Self {
        Self {
            record: None,
            events: Vec::new(),
            output,
        }
    }
}

/// Decision engine shared by every request handler.
#[derive(Clone)]
pub struct CircuitBreaker {
    store: Arc<dyn ProviderStore>,
    settings: Arc<ArcSwap<BreakerSettings>>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(store: Arc<dyn ProviderStore>, settings: BreakerSettings) -> Self {
        Self::with_clock(store, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn ProviderStore>,
        settings: BreakerSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            clock,
        }
    }

    /// Replace thresholds for rows created from now on and the scoring rule.
    pub fn update_settings(&self, settings: BreakerSettings) {
        tracing::info!(
            failure_threshold = settings.breaker.failure_threshold,
            success_threshold = settings.breaker.success_threshold,
            cooldown_period_ms = settings.breaker.cooldown_period_ms,
            "Breaker settings updated"
        );
        self.settings.store(Arc::new(settings));
    }

    pub fn store(&self) -> &Arc<dyn ProviderStore> {
        &self.store
    }

    /// Decide whether a call to `provider_id` may proceed.
    pub async fn check(&self, provider_id: &str) -> Result<CheckResponse, BreakerError> {
        let response = self
            .transact(provider_id, |existing, settings, now| {
                let (mut circuit, health) = current_or_new(provider_id, existing, settings, now);
                let created = existing.is_none();
                let state = circuit.state;

                match state {
                    CircuitState::Open if circuit.is_cooling_down(now) => {
                        let next_attempt_at = circuit.next_attempt_at;
                        Decision {
                            events: vec![block(&mut circuit, now)],
                            record: Some(ProviderRecord { circuit, health }),
                            output: CheckResponse {
                                allowed: false,
                                state: CircuitState::Open,
                                reason: Some(REASON_OPEN.to_string()),
                                next_attempt_at,
                            },
                        }
                    }
                    CircuitState::Open => {
                        let event = transition(&mut circuit, CircuitState::HalfOpen, now);
                        circuit.half_opened_at = Some(now);
                        circuit.half_open_probes = 1;
                        Decision {
                            record: Some(ProviderRecord { circuit, health }),
                            events: vec![event],
                            output: CheckResponse::allowed(CircuitState::HalfOpen),
                        }
                    }
                    CircuitState::HalfOpen => match settings.breaker.half_open_max_probes {
                        Some(cap) if circuit.half_open_probes >= cap => Decision {
                            events: vec![block(&mut circuit, now)],
                            record: Some(ProviderRecord { circuit, health }),
                            output: CheckResponse {
                                allowed: false,
                                state: CircuitState::HalfOpen,
                                reason: Some(REASON_PROBE_LIMIT.to_string()),
                                next_attempt_at: None,
                            },
                        },
                        Some(_) => {
                            circuit.half_open_probes += 1;
                            circuit.updated_at = now;
                            Decision {
                                record: Some(ProviderRecord { circuit, health }),
                                events: Vec::new(),
                                output: CheckResponse::allowed(CircuitState::HalfOpen),
                            }
                        }
                        None => Decision::read_only(CheckResponse::allowed(CircuitState::HalfOpen)),
                    },
                    CircuitState::Closed if created => Decision {
                        record: Some(ProviderRecord { circuit, health }),
                        events: Vec::new(),
                        output: CheckResponse::allowed(CircuitState::Closed),
                    },
                    CircuitState::Closed => Decision::read_only(CheckResponse::allowed(CircuitState::Closed)),
                }
            })
            .await?;

        metrics::record_check(provider_id, response.allowed);
        if !response.allowed {
            tracing::debug!(provider_id, state = %response.state, "Call blocked");
        }
        Ok(response)
    }

    /// Record a successful provider call.
    pub async fn record_success(
        &self,
        provider_id: &str,
        latency_ms: Option<u64>,
    ) -> Result<(), BreakerError> {
        let (state, score) = self
            .transact(provider_id, |existing, settings, now| {
                let (mut circuit, health) = current_or_new(provider_id, existing, settings, now);
                let previous = circuit.state;

                circuit.success_count = circuit.success_count.saturating_add(1);
                circuit.failure_count = 0;
                circuit.last_success_at = Some(now);
                circuit.updated_at = now;

                let mut events = vec![CircuitEvent::new(
                    provider_id,
                    CircuitEventType::CallSuccess,
                    previous,
                    previous,
                    now,
                )
                .with_success_count(circuit.success_count)];

                if previous == CircuitState::HalfOpen
                    && circuit.success_count >= circuit.success_threshold
                {
                    events.push(close(&mut circuit, now, false));
                }

                let health = settings.scorer.observe(
                    provider_id,
                    health.as_ref(),
                    CallOutcome::Success { latency_ms },
                    now,
                );
                let output = (circuit.state, health.health_score);
                Decision {
                    record: Some(ProviderRecord { circuit, health: Some(health) }),
                    events,
                    output,
                }
            })
            .await?;

        metrics::record_outcome(provider_id, "success");
        metrics::record_health_score(provider_id, score);
        tracing::debug!(provider_id, state = %state, health_score = score, latency_ms, "Success recorded");
        Ok(())
    }

    /// Record a failed provider call.
    pub async fn record_failure(
        &self,
        provider_id: &str,
        error_message: Option<&str>,
    ) -> Result<(), BreakerError> {
        let (state, score) = self
            .transact(provider_id, |existing, settings, now| {
                let (mut circuit, health) = current_or_new(provider_id, existing, settings, now);
                let previous = circuit.state;

                circuit.failure_count = circuit.failure_count.saturating_add(1);
                circuit.success_count = 0;
                circuit.last_failure_at = Some(now);
                circuit.updated_at = now;
                let failures = circuit.failure_count;

                let mut events = vec![CircuitEvent::new(
                    provider_id,
                    CircuitEventType::CallFailure,
                    previous,
                    previous,
                    now,
                )
                .with_failure_count(failures)
                .with_error(error_message.map(str::to_string))];

                let trips = previous == CircuitState::HalfOpen
                    || (previous == CircuitState::Closed && failures >= circuit.failure_threshold);
                if trips {
                    events.push(trip(&mut circuit, now).with_failure_count(failures));
                }

                let health = settings.scorer.observe(
                    provider_id,
                    health.as_ref(),
                    CallOutcome::Failure,
                    now,
                );
                let output = (circuit.state, health.health_score);
                Decision {
                    record: Some(ProviderRecord { circuit, health: Some(health) }),
                    events,
                    output,
                }
            })
            .await?;

        metrics::record_outcome(provider_id, "failure");
        metrics::record_health_score(provider_id, score);
        tracing::debug!(provider_id, state = %state, health_score = score, error = ?error_message, "Failure recorded");
        Ok(())
    }

    /// Force the circuit closed and clear counters and timestamps.
    pub async fn manual_reset(&self, provider_id: &str) -> Result<(), BreakerError> {
        let previous = self
            .transact(provider_id, |existing, settings, now| {
                let (mut circuit, health) = current_or_new(provider_id, existing, settings, now);
                let previous = circuit.state;
                let event = close(&mut circuit, now, true);
                Decision {
                    record: Some(ProviderRecord { circuit, health }),
                    events: vec![event],
                    output: previous,
                }
            })
            .await?;

        tracing::info!(provider_id, previous_state = %previous, "Circuit manually reset");
        Ok(())
    }

    /// Health and circuit rows of a provider. Never writes.
    pub async fn get_health(&self, provider_id: &str) -> Result<HealthReport, BreakerError> {
        validate_provider_id(provider_id)?;
        let loaded = self.store.load(provider_id).await?;
        Ok(match loaded {
            Some(row) => HealthReport {
                health: row.value.health,
                circuit_breaker: row.value.circuit,
            },
            None => HealthReport {
                health: None,
                circuit_breaker: ProviderCircuitState::new(
                    provider_id,
                    &self.settings.load().breaker,
                    self.clock.now(),
                ),
            },
        })
    }

    /// All known providers.
    pub async fn list_providers(&self) -> Result<Vec<ProviderRecord>, BreakerError> {
        Ok(self.store.list().await?)
    }

    /// Journal timeline of a provider, oldest first.
    pub async fn events(&self, provider_id: &str, limit: usize) -> Result<Vec<CircuitEvent>, BreakerError> {
        validate_provider_id(provider_id)?;
        Ok(self.store.events(provider_id, limit).await?)
    }

    /// Load, decide, compare-and-swap; retry on conflict.
    async fn transact<R, F>(&self, provider_id: &str, mut decide: F) -> Result<R, BreakerError>
    where
        F: FnMut(Option<&ProviderRecord>, &BreakerSettings, DateTime<Utc>) -> Decision<R>,
    {
        validate_provider_id(provider_id)?;
        let settings = self.settings.load_full();
        let attempts = settings.breaker.max_commit_attempts.max(1);

        for attempt in 1..=attempts {
            let loaded = self.store.load(provider_id).await?;
            let expected = loaded.as_ref().map(|row| row.version);
            let now = self.clock.now();
            let decision = decide(loaded.as_ref().map(|row| &row.value), &settings, now);

            let Some(record) = decision.record else {
                return Ok(decision.output);
            };

            let transitions: Vec<CircuitState> = decision
                .events
                .iter()
                .filter(|e| e.previous_state != e.new_state || e.manual)
                .map(|e| e.new_state)
                .collect();

            match self.store.commit(expected, record, decision.events).await? {
                CommitOutcome::Committed { .. } => {
                    for to in transitions {
                        metrics::record_transition(provider_id, to.as_str());
                    }
                    return Ok(decision.output);
                }
                CommitOutcome::Conflict => {
                    tracing::debug!(provider_id, attempt, "Concurrent write, retrying");
                }
            }
        }

        tracing::warn!(provider_id, attempts, "Giving up after repeated write conflicts");
        Err(BreakerError::Conflict {
            provider_id: provider_id.to_string(),
            attempts,
        })
    }
}

fn validate_provider_id(provider_id: &str) -> Result<(), BreakerError> {
    if provider_id.trim().is_empty() {
        return Err(BreakerError::Validation("provider_id is required".to_string()));
    }
    Ok(())
}

fn current_or_new(
    provider_id: &str,
    existing: Option<&ProviderRecord>,
    settings: &BreakerSettings,
    now: DateTime<Utc>,
) -> (ProviderCircuitState, Option<ProviderHealth>) {
    match existing {
        Some(record) => (record.circuit.clone(), record.health.clone()),
        None => (ProviderCircuitState::new(provider_id, &settings.breaker, now), None),
    }
}

/// Move along a state machine edge, zeroing the consecutive counters.
fn transition(circuit: &mut ProviderCircuitState, to: CircuitState, now: DateTime<Utc>) -> CircuitEvent {
    let from = circuit.state;
    debug_assert!(from.can_transition_to(to, false), "illegal edge {from} -> {to}");

    circuit.state = to;
    circuit.failure_count = 0;
    circuit.success_count = 0;
    circuit.half_open_probes = 0;
    circuit.updated_at = now;

    let kind = match to {
        CircuitState::Open => CircuitEventType::Trip,
        CircuitState::HalfOpen => CircuitEventType::HalfOpen,
        CircuitState::Closed => CircuitEventType::Reset,
    };
    match to {
        CircuitState::Open => tracing::warn!(provider_id = %circuit.provider_id, from = %from, "Circuit tripped"),
        _ => tracing::info!(provider_id = %circuit.provider_id, from = %from, to = %to, "Circuit transition"),
    }
    CircuitEvent::new(&circuit.provider_id, kind, from, to, now)
}

fn trip(circuit: &mut ProviderCircuitState, now: DateTime<Utc>) -> CircuitEvent {
    let event = transition(circuit, CircuitState::Open, now);
    let cooldown = Duration::milliseconds(circuit.cooldown_period_ms.min(i64::MAX as u64) as i64);
    circuit.opened_at = Some(now);
    circuit.next_attempt_at = Some(now.checked_add_signed(cooldown).unwrap_or(DateTime::<Utc>::MAX_UTC));
    circuit.total_trips = circuit.total_trips.saturating_add(1);
    event
}

fn close(circuit: &mut ProviderCircuitState, now: DateTime<Utc>, manual: bool) -> CircuitEvent {
    let from = circuit.state;
    let event = if manual {
        circuit.state = CircuitState::Closed;
        circuit.failure_count = 0;
        circuit.success_count = 0;
        circuit.half_open_probes = 0;
        circuit.updated_at = now;
        CircuitEvent::new(&circuit.provider_id, CircuitEventType::Reset, from, CircuitState::Closed, now).manual()
    } else {
        transition(circuit, CircuitState::Closed, now)
    };
    circuit.opened_at = None;
    circuit.half_opened_at = None;
    circuit.next_attempt_at = None;
    event
}

fn block(circuit: &mut ProviderCircuitState, now: DateTime<Utc>) -> CircuitEvent {
    circuit.total_calls_blocked = circuit.total_calls_blocked.saturating_add(1);
    circuit.updated_at = now;
    CircuitEvent::new(
        &circuit.provider_id,
        CircuitEventType::CallBlocked,
        circuit.state,
        circuit.state,
        now,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::clock::ManualClock;
    use crate::store::{MemoryStore, StoreResult, Versioned};
    use async_trait::async_trait;

    struct Harness {
        breaker: CircuitBreaker,
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
    }

    fn harness(breaker: BreakerConfig) -> Harness {
        let store = Arc::new(MemoryStore::new(1_000));
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let breaker = CircuitBreaker::with_clock(
            store.clone(),
            BreakerSettings::new(breaker, HealthConfig::default()),
            clock.clone(),
        );
        Harness { breaker, clock, store }
    }

    async fn circuit(h: &Harness, provider: &str) -> ProviderCircuitState {
        h.breaker.get_health(provider).await.unwrap().circuit_breaker
    }

    #[tokio::test]
    async fn test_threshold_failures_trip() {
        let h = harness(BreakerConfig::default());
        for _ in 0..4 {
            h.breaker.record_failure("p", Some("boom")).await.unwrap();
        }
        assert_eq!(circuit(&h, "p").await.state, CircuitState::Closed);

        let trip_time = h.clock.now();
        h.breaker.record_failure("p", None).await.unwrap();
        let row = circuit(&h, "p").await;
        assert_eq!(row.state, CircuitState::Open);
        assert_eq!(row.total_trips, 1);
        assert_eq!(row.failure_count, 0);
        assert_eq!(row.opened_at, Some(trip_time));
        assert_eq!(row.next_attempt_at, Some(trip_time + Duration::milliseconds(60_000)));
    }

    #[tokio::test]
    async fn test_success_in_closed_resets_failure_streak() {
        let h = harness(BreakerConfig::default());
        for _ in 0..4 {
            h.breaker.record_failure("p", None).await.unwrap();
        }
        h.breaker.record_success("p", None).await.unwrap();
        for _ in 0..4 {
            h.breaker.record_failure("p", None).await.unwrap();
        }
        let row = circuit(&h, "p").await;
        assert_eq!(row.state, CircuitState::Closed);
        assert_eq!(row.failure_count, 4);
    }

    #[tokio::test]
    async fn test_open_blocks_and_counts_each_check() {
        let h = harness(BreakerConfig { failure_threshold: 1, ..Default::default() });
        h.breaker.record_failure("p", None).await.unwrap();

        for expected in 1..=3u64 {
            let res = h.breaker.check("p").await.unwrap();
            assert!(!res.allowed);
            assert_eq!(res.state, CircuitState::Open);
            assert_eq!(res.reason.as_deref(), Some(REASON_OPEN));
            assert!(res.next_attempt_at.is_some());
            assert_eq!(circuit(&h, "p").await.total_calls_blocked, expected);
        }
    }

    #[tokio::test]
    async fn test_failure_while_open_does_not_trip_again() {
        let h = harness(BreakerConfig { failure_threshold: 1, ..Default::default() });
        h.breaker.record_failure("p", None).await.unwrap();
        let tripped = circuit(&h, "p").await;

        h.clock.advance(Duration::seconds(10));
        h.breaker.record_failure("p", Some("late failure")).await.unwrap();

        let report = h.breaker.get_health("p").await.unwrap();
        let row = report.circuit_breaker;
        assert_eq!(row.state, CircuitState::Open);
        assert_eq!(row.total_trips, 1);
        assert_eq!(row.opened_at, tripped.opened_at);
        assert_eq!(row.next_attempt_at, tripped.next_attempt_at);
        assert_eq!(row.failure_count, 1);
        assert_eq!(row.last_failure_at, Some(h.clock.now()));
        assert_eq!(report.health.unwrap().health_score, 70);

        let kinds: Vec<_> = h
            .breaker
            .events("p", 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(
            kinds,
            [CircuitEventType::CallFailure, CircuitEventType::Trip, CircuitEventType::CallFailure]
        );
    }

    #[tokio::test]
    async fn test_half_open_transition_happens_once() {
        let h = harness(BreakerConfig { failure_threshold: 1, ..Default::default() });
        h.breaker.record_failure("p", None).await.unwrap();
        h.clock.advance(Duration::milliseconds(60_000));

        let first = h.breaker.check("p").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.state, CircuitState::HalfOpen);
        let second = h.breaker.check("p").await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.state, CircuitState::HalfOpen);

        let half_opens = h
            .breaker
            .events("p", 100)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == CircuitEventType::HalfOpen)
            .count();
        assert_eq!(half_opens, 1);
        assert_eq!(circuit(&h, "p").await.half_opened_at, Some(h.clock.now()));
    }

    #[tokio::test]
    async fn test_half_open_single_failure_reopens() {
        let h = harness(BreakerConfig { failure_threshold: 1, ..Default::default() });
        h.breaker.record_failure("p", None).await.unwrap();
        h.clock.advance(Duration::seconds(61));
        h.breaker.check("p").await.unwrap();

        h.breaker.record_failure("p", Some("still down")).await.unwrap();
        let row = circuit(&h, "p").await;
        assert_eq!(row.state, CircuitState::Open);
        assert_eq!(row.total_trips, 2);
        assert_eq!(row.next_attempt_at, Some(h.clock.now() + Duration::seconds(60)));
    }

    #[tokio::test]
    async fn test_manual_reset_from_every_state() {
        let h = harness(BreakerConfig { failure_threshold: 1, ..Default::default() });

        // closed with counters
        h.breaker.record_success("a", None).await.unwrap();
        // open
        h.breaker.record_failure("b", None).await.unwrap();
        // half-open
        h.breaker.record_failure("c", None).await.unwrap();
        h.clock.advance(Duration::seconds(61));
        h.breaker.check("c").await.unwrap();

        for provider in ["a", "b", "c", "never-seen"] {
            h.breaker.manual_reset(provider).await.unwrap();
            let row = circuit(&h, provider).await;
            assert_eq!(row.state, CircuitState::Closed, "{provider}");
            assert_eq!((row.failure_count, row.success_count), (0, 0));
            assert!(row.opened_at.is_none() && row.half_opened_at.is_none() && row.next_attempt_at.is_none());
            let last = h.breaker.events(provider, 1).await.unwrap().pop().unwrap();
            assert_eq!(last.event_type, CircuitEventType::Reset);
            assert!(last.manual);
        }
    }

    #[tokio::test]
    async fn test_scenario_hibp_full_cycle() {
        let h = harness(BreakerConfig {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown_period_ms: 60_000,
            ..Default::default()
        });

        for _ in 0..5 {
            assert!(h.breaker.check("hibp").await.unwrap().allowed);
            h.breaker.record_failure("hibp", Some("HTTP 503")).await.unwrap();
        }
        assert_eq!(circuit(&h, "hibp").await.state, CircuitState::Open);

        h.clock.advance(Duration::seconds(59));
        assert!(!h.breaker.check("hibp").await.unwrap().allowed);

        h.clock.advance(Duration::seconds(1));
        let probe = h.breaker.check("hibp").await.unwrap();
        assert!(probe.allowed);
        assert_eq!(probe.state, CircuitState::HalfOpen);

        h.breaker.record_success("hibp", Some(210)).await.unwrap();
        assert_eq!(circuit(&h, "hibp").await.state, CircuitState::HalfOpen);
        h.breaker.record_success("hibp", Some(190)).await.unwrap();

        let report = h.breaker.get_health("hibp").await.unwrap();
        assert_eq!(report.circuit_breaker.state, CircuitState::Closed);
        assert_eq!(report.circuit_breaker.success_count, 0);
        assert_eq!(report.circuit_breaker.failure_count, 0);
        assert_eq!(report.circuit_breaker.total_calls_blocked, 1);
        let health = report.health.unwrap();
        // 80 (first failure) - 4 * 10 + 2 * 2
        assert_eq!(health.health_score, 44);
        assert!(health.is_degraded);
        assert_eq!(health.recent_avg_latency_ms, Some(190));

        let kinds: Vec<_> = h
            .breaker
            .events("hibp", 100)
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds.iter().filter(|k| **k == CircuitEventType::Trip).count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == CircuitEventType::CallBlocked).count(), 1);
        assert_eq!(kinds.last(), Some(&CircuitEventType::Reset));
    }

    #[tokio::test]
    async fn test_probe_cap_blocks_extra_probes() {
        let h = harness(BreakerConfig {
            failure_threshold: 1,
            half_open_max_probes: Some(2),
            ..Default::default()
        });
        h.breaker.record_failure("p", None).await.unwrap();
        h.clock.advance(Duration::seconds(60));

        assert!(h.breaker.check("p").await.unwrap().allowed);
        assert!(h.breaker.check("p").await.unwrap().allowed);
        let third = h.breaker.check("p").await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.state, CircuitState::HalfOpen);
        assert_eq!(third.reason.as_deref(), Some(REASON_PROBE_LIMIT));
        assert_eq!(circuit(&h, "p").await.total_calls_blocked, 1);
    }

    #[tokio::test]
    async fn test_get_health_does_not_create_rows() {
        let h = harness(BreakerConfig::default());
        let report = h.breaker.get_health("unknown").await.unwrap();
        assert!(report.health.is_none());
        assert_eq!(report.circuit_breaker.state, CircuitState::Closed);
        assert!(h.store.is_empty());

        h.breaker.check("unknown").await.unwrap();
        assert_eq!(h.store.len(), 1);
    }

    #[tokio::test]
    async fn test_blank_provider_rejected_without_mutation() {
        let h = harness(BreakerConfig::default());
        assert!(matches!(h.breaker.check("  ").await, Err(BreakerError::Validation(_))));
        assert!(matches!(h.breaker.record_failure("", None).await, Err(BreakerError::Validation(_))));
        assert!(h.store.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_not_undercounted() {
        let h = harness(BreakerConfig {
            failure_threshold: 1_000,
            max_commit_attempts: 10_000,
            ..Default::default()
        });
        let mut tasks = Vec::new();
        for _ in 0..50 {
            let breaker = h.breaker.clone();
            tasks.push(tokio::spawn(async move {
                breaker.record_failure("p", None).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        let report = h.breaker.get_health("p").await.unwrap();
        assert_eq!(report.circuit_breaker.failure_count, 50);
        assert_eq!(report.health.unwrap().recent_error_count, 50);
    }

    #[tokio::test]
    async fn test_settings_reload_applies_to_new_rows_only() {
        let h = harness(BreakerConfig::default());
        h.breaker.check("old").await.unwrap();
        h.breaker.update_settings(BreakerSettings::new(
            BreakerConfig { failure_threshold: 2, ..Default::default() },
            HealthConfig::default(),
        ));
        h.breaker.check("new").await.unwrap();

        assert_eq!(circuit(&h, "old").await.failure_threshold, 5);
        assert_eq!(circuit(&h, "new").await.failure_threshold, 2);
    }

    struct BrokenStore;

    #[async_trait]
    impl ProviderStore for BrokenStore {
        async fn load(&self, _: &str) -> StoreResult<Option<Versioned<ProviderRecord>>> {
            Ok(None)
        }
        async fn commit(&self, _: Option<u64>, _: ProviderRecord, _: Vec<CircuitEvent>) -> StoreResult<CommitOutcome> {
            Err(StoreError::Unavailable("disk full".into()))
        }
        async fn list(&self) -> StoreResult<Vec<ProviderRecord>> {
            Ok(Vec::new())
        }
        async fn events(&self, _: &str, _: usize) -> StoreResult<Vec<CircuitEvent>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_store_failure_surfaces() {
        let breaker = CircuitBreaker::new(Arc::new(BrokenStore), BreakerSettings::default());
        let err = breaker.record_failure("p", None).await.unwrap_err();
        assert!(matches!(err, BreakerError::Store(StoreError::Unavailable(_))));
    }
}
