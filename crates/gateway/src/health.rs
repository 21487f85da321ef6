//! Per-provider health tracking and circuit breaking.
//!
//! Updates flow one way: provider-client attempts feed success/failure in,
//! and the router reads immutable snapshots out. The tracker never calls
//! into the router or the pool.

use std::time::{Duration, Instant};

use config::HealthCheckConfig;
use dashmap::DashMap;
use serde::Serialize;

/// Smoothing factor for the exponential moving averages.
const EMA_ALPHA: f64 = 0.2;

/// How many latency samples the p95 reservoir keeps.
const LATENCY_SAMPLES: usize = 64;

/// Assumed in-flight saturation point for the capacity score.
const CAPACITY_FULL: f64 = 50.0;

/// Latency at which the latency score reaches zero.
const LATENCY_FLOOR_MS: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Outcome of the circuit gate at dispatch time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitDecision {
    Allow,
    Reject { retry_in: Duration },
}

#[derive(Debug)]
struct ProviderHealth {
    availability: f64,
    error_rate: f64,
    avg_latency_ms: f64,
    latency_samples: Vec<f64>,
    consecutive_failures: u32,
    last_success: Option<Instant>,
    circuit: CircuitState,
    next_retry: Option<Instant>,
    failure_count: u32,
    half_open_successes: u32,
    half_open_probes: u32,
    in_flight: u32,
    total_attempts: u64,
}

impl ProviderHealth {
    fn new() -> Self {
        Self {
            availability: 1.0,
            error_rate: 0.0,
            avg_latency_ms: 0.0,
            latency_samples: Vec::with_capacity(LATENCY_SAMPLES),
            consecutive_failures: 0,
            last_success: None,
            circuit: CircuitState::Closed,
            next_retry: None,
            failure_count: 0,
            half_open_successes: 0,
            half_open_probes: 0,
            in_flight: 0,
            total_attempts: 0,
        }
    }

    fn push_latency(&mut self, latency_ms: f64) {
        if self.latency_samples.len() == LATENCY_SAMPLES {
            self.latency_samples.remove(0);
        }
        self.latency_samples.push(latency_ms);
    }

    fn p95_latency_ms(&self) -> f64 {
        if self.latency_samples.is_empty() {
            return 0.0;
        }

        let mut sorted = self.latency_samples.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((sorted.len() as f64) * 0.95).ceil() as usize;
        sorted[index.saturating_sub(1).min(sorted.len() - 1)]
    }

    /// Composite quality score in [0,100].
    ///
    /// Weights: latency 0.3, reliability 0.4, cost 0.1, capacity 0.2.
    /// Reliability is `(1 − errorRate) × availability × 100`. Cost is flat
    /// until billing data exists.
    fn quality_score(&self) -> f64 {
        let latency = (1.0 - self.avg_latency_ms / LATENCY_FLOOR_MS).clamp(0.0, 1.0) * 100.0;
        let reliability = (1.0 - self.error_rate) * self.availability * 100.0;
        let cost = 100.0;
        let capacity = (1.0 - f64::from(self.in_flight) / CAPACITY_FULL).clamp(0.0, 1.0) * 100.0;

        0.3 * latency + 0.4 * reliability + 0.1 * cost + 0.2 * capacity
    }
}

/// Read-only view of a provider's health, consumed by the router and the
/// status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub healthy: bool,
    #[serde(rename = "qualityScore")]
    pub quality_score: f64,
    pub circuit: CircuitState,
    #[serde(rename = "errorRate")]
    pub error_rate: f64,
    #[serde(rename = "avgLatencyMs")]
    pub avg_latency_ms: f64,
    #[serde(rename = "p95LatencyMs")]
    pub p95_latency_ms: f64,
    #[serde(rename = "inFlight")]
    pub in_flight: u32,
    #[serde(rename = "consecutiveFailures")]
    pub consecutive_failures: u32,
    /// Milliseconds since the last successful attempt, if any.
    #[serde(rename = "lastSuccessMsAgo")]
    pub last_success_ms_ago: Option<u64>,
}

pub struct HealthTracker {
    records: DashMap<String, ProviderHealth>,
    config: HealthCheckConfig,
}

impl HealthTracker {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            records: DashMap::new(),
            config,
        }
    }

    /// Create the record for a provider so it shows up in snapshots before
    /// its first attempt.
    pub fn register(&self, provider: &str) {
        self.records
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);
    }

    /// Record a successful attempt with its observed latency.
    pub fn record_success(&self, provider: &str, latency: Duration) {
        let mut record = self
            .records
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);

        let latency_ms = latency.as_secs_f64() * 1_000.0;

        record.availability = EMA_ALPHA + (1.0 - EMA_ALPHA) * record.availability;
        record.error_rate *= 1.0 - EMA_ALPHA;
        record.avg_latency_ms = if record.total_attempts == 0 {
            latency_ms
        } else {
            EMA_ALPHA * latency_ms + (1.0 - EMA_ALPHA) * record.avg_latency_ms
        };
        record.push_latency(latency_ms);
        record.consecutive_failures = 0;
        record.failure_count = 0;
        record.last_success = Some(Instant::now());
        record.total_attempts += 1;

        if record.circuit == CircuitState::HalfOpen {
            record.half_open_probes = record.half_open_probes.saturating_sub(1);
            record.half_open_successes += 1;

            if record.half_open_successes >= self.config.half_open_retries {
                log::info!("circuit for provider '{provider}' closed after successful probes");
                record.circuit = CircuitState::Closed;
                record.next_retry = None;
                record.half_open_successes = 0;
                record.half_open_probes = 0;
            }
        }
    }

    /// Record a failed attempt.
    pub fn record_failure(&self, provider: &str) {
        let mut record = self
            .records
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);

        record.availability *= 1.0 - EMA_ALPHA;
        record.error_rate = EMA_ALPHA + (1.0 - EMA_ALPHA) * record.error_rate;
        record.consecutive_failures += 1;
        record.total_attempts += 1;

        match record.circuit {
            CircuitState::Closed => {
                record.failure_count += 1;

                if record.failure_count >= self.config.failure_threshold {
                    log::warn!(
                        "circuit for provider '{provider}' opened after {} consecutive failures",
                        record.failure_count
                    );
                    record.circuit = CircuitState::Open;
                    record.next_retry = Some(Instant::now() + Duration::from_millis(self.config.recovery_time));
                }
            }
            CircuitState::HalfOpen => {
                log::warn!("half-open probe for provider '{provider}' failed, reopening circuit");
                record.circuit = CircuitState::Open;
                record.next_retry = Some(Instant::now() + Duration::from_millis(self.config.recovery_time));
                record.half_open_successes = 0;
                record.half_open_probes = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Gate a dispatch attempt on the provider's circuit.
    ///
    /// An open circuit transitions to half-open once `recoveryTime` has
    /// elapsed; half-open admits at most `halfOpenRetries` probes at once.
    pub fn check_circuit(&self, provider: &str) -> CircuitDecision {
        let mut record = self
            .records
            .entry(provider.to_string())
            .or_insert_with(ProviderHealth::new);

        match record.circuit {
            CircuitState::Closed => CircuitDecision::Allow,
            CircuitState::Open => {
                let now = Instant::now();
                match record.next_retry {
                    Some(retry_at) if now >= retry_at => {
                        log::info!("circuit for provider '{provider}' entering half-open");
                        record.circuit = CircuitState::HalfOpen;
                        record.half_open_successes = 0;
                        record.half_open_probes = 1;
                        CircuitDecision::Allow
                    }
                    Some(retry_at) => CircuitDecision::Reject {
                        retry_in: retry_at.duration_since(now),
                    },
                    None => {
                        record.circuit = CircuitState::HalfOpen;
                        record.half_open_probes = 1;
                        CircuitDecision::Allow
                    }
                }
            }
            CircuitState::HalfOpen => {
                if record.half_open_probes < self.config.half_open_retries {
                    record.half_open_probes += 1;
                    CircuitDecision::Allow
                } else {
                    CircuitDecision::Reject {
                        retry_in: Duration::from_millis(self.config.recovery_time),
                    }
                }
            }
        }
    }

    /// Track an in-flight dispatch; the guard decrements on drop.
    pub fn begin_dispatch(self: &std::sync::Arc<Self>, provider: &str) -> InFlightGuard {
        if let Some(mut record) = self.records.get_mut(provider) {
            record.in_flight += 1;
        }

        InFlightGuard {
            tracker: std::sync::Arc::clone(self),
            provider: provider.to_string(),
        }
    }

    pub fn snapshot(&self, provider: &str) -> Option<HealthSnapshot> {
        self.records.get(provider).map(|record| self.build_snapshot(&record))
    }

    pub fn snapshots(&self) -> Vec<(String, HealthSnapshot)> {
        self.records
            .iter()
            .map(|entry| (entry.key().clone(), self.build_snapshot(entry.value())))
            .collect()
    }

    /// Operator reset: forget everything about a provider.
    pub fn reset(&self, provider: &str) {
        self.records.insert(provider.to_string(), ProviderHealth::new());
    }

    fn build_snapshot(&self, record: &ProviderHealth) -> HealthSnapshot {
        let quality_score = record.quality_score();

        // An open circuit whose retry window has elapsed reads as half-open
        // so the router keeps it eligible as a probe candidate; the actual
        // transition happens in check_circuit at dispatch.
        let circuit = match record.circuit {
            CircuitState::Open
                if record
                    .next_retry
                    .is_none_or(|retry_at| Instant::now() >= retry_at) =>
            {
                CircuitState::HalfOpen
            }
            other => other,
        };

        HealthSnapshot {
            healthy: circuit == CircuitState::Closed && quality_score >= self.config.min_quality,
            quality_score,
            circuit,
            error_rate: record.error_rate,
            avg_latency_ms: record.avg_latency_ms,
            p95_latency_ms: record.p95_latency_ms(),
            in_flight: record.in_flight,
            consecutive_failures: record.consecutive_failures,
            last_success_ms_ago: record
                .last_success
                .map(|instant| instant.elapsed().as_millis() as u64),
        }
    }
}

/// Decrements the provider's in-flight count when dropped.
pub struct InFlightGuard {
    tracker: std::sync::Arc<HealthTracker>,
    provider: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(mut record) = self.tracker.records.get_mut(&self.provider) {
            record.in_flight = record.in_flight.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn tracker(failure_threshold: u32, half_open_retries: u32, recovery_ms: u64) -> HealthTracker {
        HealthTracker::new(HealthCheckConfig {
            failure_threshold,
            half_open_retries,
            recovery_time: recovery_ms,
            ..HealthCheckConfig::default()
        })
    }

    #[test]
    fn fresh_provider_is_healthy() {
        let tracker = tracker(3, 2, 100);
        tracker.register("a");

        let snapshot = tracker.snapshot("a").unwrap();
        assert!(snapshot.healthy);
        assert_eq!(snapshot.circuit, CircuitState::Closed);
        assert!(snapshot.quality_score >= 70.0);
    }

    #[test]
    fn circuit_opens_after_failure_threshold() {
        let tracker = tracker(3, 2, 100);
        tracker.register("a");

        for _ in 0..2 {
            tracker.record_failure("a");
            assert_eq!(tracker.check_circuit("a"), CircuitDecision::Allow);
        }

        tracker.record_failure("a");

        let decision = tracker.check_circuit("a");
        assert!(matches!(decision, CircuitDecision::Reject { .. }));
        assert_eq!(tracker.snapshot("a").unwrap().circuit, CircuitState::Open);
    }

    #[tokio::test]
    async fn circuit_recovers_through_half_open_probes() {
        let tracker = tracker(3, 2, 50);
        tracker.register("a");

        for _ in 0..3 {
            tracker.record_failure("a");
        }
        assert!(matches!(tracker.check_circuit("a"), CircuitDecision::Reject { .. }));

        tokio::time::sleep(Duration::from_millis(70)).await;

        // First probe allowed: open → half-open.
        assert_eq!(tracker.check_circuit("a"), CircuitDecision::Allow);
        tracker.record_success("a", Duration::from_millis(20));
        assert_eq!(tracker.snapshot("a").unwrap().circuit, CircuitState::HalfOpen);

        // Second successful probe closes the circuit.
        assert_eq!(tracker.check_circuit("a"), CircuitDecision::Allow);
        tracker.record_success("a", Duration::from_millis(20));
        assert_eq!(tracker.snapshot("a").unwrap().circuit, CircuitState::Closed);

        // Closed circuit behaves normally again.
        assert_eq!(tracker.check_circuit("a"), CircuitDecision::Allow);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_the_circuit() {
        let tracker = tracker(2, 2, 30);
        tracker.register("a");

        tracker.record_failure("a");
        tracker.record_failure("a");
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(tracker.check_circuit("a"), CircuitDecision::Allow);
        tracker.record_failure("a");

        assert_eq!(tracker.snapshot("a").unwrap().circuit, CircuitState::Open);
        assert!(matches!(tracker.check_circuit("a"), CircuitDecision::Reject { .. }));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let tracker = tracker(5, 2, 100);
        tracker.register("a");

        tracker.record_failure("a");
        tracker.record_failure("a");
        assert_eq!(tracker.snapshot("a").unwrap().consecutive_failures, 2);

        tracker.record_success("a", Duration::from_millis(10));
        assert_eq!(tracker.snapshot("a").unwrap().consecutive_failures, 0);
    }

    #[test]
    fn repeated_failures_degrade_health_below_minimum_quality() {
        let tracker = tracker(100, 2, 100);
        tracker.register("a");

        for _ in 0..20 {
            tracker.record_failure("a");
        }

        let snapshot = tracker.snapshot("a").unwrap();
        assert!(!snapshot.healthy);
        assert!(snapshot.quality_score < 70.0);
        assert!(snapshot.error_rate > 0.9);
    }

    #[test]
    fn in_flight_guard_tracks_concurrency() {
        let tracker = Arc::new(tracker(3, 2, 100));
        tracker.register("a");

        let guard_one = tracker.begin_dispatch("a");
        let guard_two = tracker.begin_dispatch("a");
        assert_eq!(tracker.snapshot("a").unwrap().in_flight, 2);

        drop(guard_one);
        assert_eq!(tracker.snapshot("a").unwrap().in_flight, 1);
        drop(guard_two);
        assert_eq!(tracker.snapshot("a").unwrap().in_flight, 0);
    }

    #[test]
    fn reset_clears_history() {
        let tracker = tracker(2, 2, 100);
        tracker.register("a");

        tracker.record_failure("a");
        tracker.record_failure("a");
        assert_eq!(tracker.snapshot("a").unwrap().circuit, CircuitState::Open);

        tracker.reset("a");

        let snapshot = tracker.snapshot("a").unwrap();
        assert_eq!(snapshot.circuit, CircuitState::Closed);
        assert!(snapshot.healthy);
    }
}
