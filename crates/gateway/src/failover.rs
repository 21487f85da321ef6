//! Cross-provider failover supervision.
//!
//! Gates the pipeline's retry loop: tracks which providers a request has
//! already tried, asks the router for the next candidate with those
//! excluded, and spaces attempts with jittered exponential backoff.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::{
    error::{GatewayError, GatewayResult},
    routing::{Router, Selection},
};

/// Jitter applied to backoff delays, as a fraction of the delay.
const BACKOFF_JITTER: f64 = 0.25;

/// One dispatch to one provider for one request.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub provider: String,
    pub model: String,
    pub started_at: Instant,
    pub ended_at: Option<Instant>,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    InFlight,
    Success,
    Failure {
        /// Stable error type string, for the diagnostic trail.
        error_type: &'static str,
    },
}

impl Attempt {
    pub fn begin(selection: &Selection) -> Self {
        Self {
            provider: selection.provider.clone(),
            model: selection.model.clone(),
            started_at: Instant::now(),
            ended_at: None,
            outcome: AttemptOutcome::InFlight,
        }
    }

    pub fn succeed(&mut self) {
        self.ended_at = Some(Instant::now());
        self.outcome = AttemptOutcome::Success;
    }

    pub fn fail(&mut self, error: &GatewayError) {
        self.ended_at = Some(Instant::now());
        self.outcome = AttemptOutcome::Failure {
            error_type: error.error_type(),
        };
    }

    pub fn latency(&self) -> Duration {
        self.ended_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.started_at)
    }
}

pub struct FailoverSupervisor {
    router: Arc<Router>,
    max_retries: u32,
    retry_delay: Duration,
}

impl FailoverSupervisor {
    pub fn new(router: Arc<Router>, max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            router,
            max_retries,
            retry_delay,
        }
    }

    /// Hard cap on attempts for a category:
    /// `min(maxRetries + 1, candidate count)`.
    pub fn max_attempts(&self, category: &str) -> usize {
        let candidates = self.router.candidate_count(category);
        candidates.min(self.max_retries as usize + 1)
    }

    /// Ask the router for the next candidate, excluding every provider the
    /// request already tried. A provider id never appears twice in the
    /// attempt list.
    pub fn next_candidate(&self, category: &str, attempts: &[Attempt]) -> GatewayResult<Selection> {
        if attempts.len() >= self.max_attempts(category) {
            return Err(GatewayError::NoHealthyProvider {
                category: category.to_string(),
            });
        }

        let excluded: Vec<String> = attempts.iter().map(|attempt| attempt.provider.clone()).collect();
        self.router.select(category, &excluded)
    }

    /// Whether a failed attempt warrants another candidate.
    ///
    /// Streams that already emitted bytes to the client are never retried;
    /// everything else follows the error's own classification.
    pub fn should_retry(&self, error: &GatewayError, streamed_first_byte: bool) -> bool {
        !streamed_first_byte && error.is_retryable()
    }

    /// Delay before attempt `attempt_number` (1-based for the first retry):
    /// `retryDelay × 2^(n−1)` with ±25% jitter.
    pub fn backoff(&self, attempt_number: u32) -> Duration {
        let base = self.retry_delay.as_millis() as f64 * 2f64.powi(attempt_number.saturating_sub(1) as i32);
        let jitter = rand::rng().random_range(-BACKOFF_JITTER..=BACKOFF_JITTER);
        Duration::from_millis((base * (1.0 + jitter)).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthTracker;
    use config::{Config, HealthCheckConfig};
    use indoc::indoc;

    fn supervisor(max_retries: u32) -> FailoverSupervisor {
        let config: Config = serde_json::from_str(indoc! {r#"
            {
              "providers": {
                "a": { "kind": "openai", "models": [{ "name": "m", "maxTokens": 4096 }] },
                "b": { "kind": "qwen", "models": [{ "name": "m", "maxTokens": 4096 }] }
              },
              "routing": {
                "default": {
                  "primary": [
                    { "provider": "a", "model": "m" },
                    { "provider": "b", "model": "m" }
                  ]
                }
              }
            }
        "#})
        .unwrap();

        let config = Arc::new(config);
        let health = Arc::new(HealthTracker::new(HealthCheckConfig::default()));
        let router = Arc::new(Router::new(config, health));

        FailoverSupervisor::new(router, max_retries, Duration::from_millis(100))
    }

    fn failed_attempt(provider: &str) -> Attempt {
        let mut attempt = Attempt {
            provider: provider.to_string(),
            model: "m".to_string(),
            started_at: Instant::now(),
            ended_at: None,
            outcome: AttemptOutcome::InFlight,
        };
        attempt.fail(&GatewayError::Transport {
            provider: provider.to_string(),
            message: "reset".to_string(),
        });
        attempt
    }

    #[test]
    fn max_attempts_is_bounded_by_candidates_and_retries() {
        assert_eq!(supervisor(5).max_attempts("default"), 2);
        assert_eq!(supervisor(0).max_attempts("default"), 1);
        assert_eq!(supervisor(1).max_attempts("default"), 2);
    }

    #[test]
    fn next_candidate_excludes_tried_providers() {
        let supervisor = supervisor(5);

        let first = supervisor.next_candidate("default", &[]).unwrap();
        let attempts = vec![failed_attempt(&first.provider)];

        let second = supervisor.next_candidate("default", &attempts).unwrap();
        assert_ne!(second.provider, first.provider);
    }

    #[test]
    fn attempts_stop_at_the_cap() {
        let supervisor = supervisor(0);
        let attempts = vec![failed_attempt("a")];

        let error = supervisor.next_candidate("default", &attempts).unwrap_err();
        assert!(matches!(error, GatewayError::NoHealthyProvider { .. }));
    }

    #[test]
    fn streamed_requests_never_retry() {
        let supervisor = supervisor(3);
        let error = GatewayError::Transport {
            provider: "a".to_string(),
            message: "mid-stream reset".to_string(),
        };

        assert!(supervisor.should_retry(&error, false));
        assert!(!supervisor.should_retry(&error, true));
    }

    #[test]
    fn backoff_doubles_with_bounded_jitter() {
        let supervisor = supervisor(3);

        for (attempt, base) in [(1u32, 100f64), (2, 200.0), (3, 400.0)] {
            for _ in 0..10 {
                let delay = supervisor.backoff(attempt).as_millis() as f64;
                assert!(delay >= base * 0.75 - 1.0, "delay {delay} below jitter floor for {base}");
                assert!(delay <= base * 1.25 + 1.0, "delay {delay} above jitter ceiling for {base}");
            }
        }
    }
}
