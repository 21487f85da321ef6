//! Candidate selection over a category's chains.
//!
//! The router is a pure reader: it consults health snapshots and its own
//! round-robin counters, and never mutates health state.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use config::{BalancePolicy, ChainEntry, Config};
use dashmap::DashMap;
use itertools::Itertools;
use rand::Rng;

use crate::{
    error::{GatewayError, GatewayResult},
    health::{CircuitState, HealthTracker},
};

/// Weight multiplier for providers whose circuit is half-open: they stay
/// eligible as probes but draw far less traffic.
const HALF_OPEN_WEIGHT_FACTOR: f64 = 0.1;

/// The router's pick for one attempt.
#[derive(Debug, Clone)]
pub struct Selection {
    pub provider: String,
    pub model: String,
    /// Latency budget from the chain entry, in milliseconds.
    pub max_latency_ms: u64,
    pub rationale: String,
}

struct Candidate<'a> {
    entry: &'a ChainEntry,
    weight: u32,
    error_rate: f64,
    in_flight: u32,
    half_open: bool,
}

pub struct Router {
    config: Arc<Config>,
    health: Arc<HealthTracker>,
    counters: DashMap<String, AtomicUsize>,
}

impl Router {
    pub fn new(config: Arc<Config>, health: Arc<HealthTracker>) -> Self {
        Self {
            config,
            health,
            counters: DashMap::new(),
        }
    }

    /// Pick one `(provider, model)` for the category, skipping excluded and
    /// unhealthy providers. The primary chain is tried first, then the
    /// emergency chain.
    pub fn select(&self, category: &str, excluded: &[String]) -> GatewayResult<Selection> {
        let Some(category_config) = self.config.routing.category(category) else {
            return Err(GatewayError::NoHealthyProvider {
                category: category.to_string(),
            });
        };

        let primary = self.eligible(&category_config.primary, excluded);
        let (candidates, chain) = if primary.is_empty() {
            let emergency = self.eligible(&category_config.emergency, excluded);
            if emergency.is_empty() {
                // When every candidate was filtered by an open circuit, say
                // so: the caller surfaces a fast CircuitOpen rather than a
                // generic routing failure.
                if let Some(provider) = self.open_circuit_candidate(category_config, excluded) {
                    return Err(GatewayError::CircuitOpen { provider });
                }

                return Err(GatewayError::NoHealthyProvider {
                    category: category.to_string(),
                });
            }
            log::warn!("category '{category}' fell back to its emergency chain");
            (emergency, "emergency")
        } else {
            (primary, "primary")
        };

        let (candidate, rationale) = self.apply_policy(category, &candidates);

        Ok(Selection {
            provider: candidate.entry.provider.clone(),
            model: candidate.entry.model.clone(),
            max_latency_ms: candidate.entry.max_latency,
            rationale: format!("{chain}/{rationale}"),
        })
    }

    fn open_circuit_candidate(&self, category: &config::CategoryConfig, excluded: &[String]) -> Option<String> {
        category
            .primary
            .iter()
            .chain(&category.emergency)
            .filter(|entry| !excluded.contains(&entry.provider))
            .find(|entry| {
                self.health
                    .snapshot(&entry.provider)
                    .is_some_and(|snapshot| snapshot.circuit == CircuitState::Open)
            })
            .map(|entry| entry.provider.clone())
    }

    /// Number of distinct providers reachable for the category, used to
    /// bound failover attempts.
    pub fn candidate_count(&self, category: &str) -> usize {
        let Some(category_config) = self.config.routing.category(category) else {
            return 0;
        };

        category_config
            .primary
            .iter()
            .chain(&category_config.emergency)
            .map(|entry| entry.provider.as_str())
            .unique()
            .count()
    }

    fn eligible<'a>(&self, chain: &'a [ChainEntry], excluded: &[String]) -> Vec<Candidate<'a>> {
        chain
            .iter()
            .filter(|entry| !excluded.contains(&entry.provider))
            .filter_map(|entry| {
                let provider = self.config.providers.get(&entry.provider)?;
                let snapshot = self.health.snapshot(&entry.provider);

                let (eligible, error_rate, in_flight, half_open) = match snapshot {
                    Some(snapshot) => {
                        let half_open = snapshot.circuit == CircuitState::HalfOpen;
                        (
                            snapshot.healthy || half_open,
                            snapshot.error_rate,
                            snapshot.in_flight,
                            half_open,
                        )
                    }
                    // Not yet registered: give it the benefit of the doubt.
                    None => (true, 0.0, 0, false),
                };

                eligible.then_some(Candidate {
                    entry,
                    weight: provider.weight,
                    error_rate,
                    in_flight,
                    half_open,
                })
            })
            .collect()
    }

    fn apply_policy<'a, 'c>(&self, category: &str, candidates: &'c [Candidate<'a>]) -> (&'c Candidate<'a>, String) {
        debug_assert!(!candidates.is_empty());

        match self.config.routing.policy {
            BalancePolicy::RoundRobin => {
                let index = self.next_counter(category) % candidates.len();
                (&candidates[index], format!("round-robin[{index}]"))
            }
            BalancePolicy::LeastLoaded => {
                let candidate = candidates
                    .iter()
                    .min_by(|a, b| {
                        a.in_flight
                            .cmp(&b.in_flight)
                            .then(b.weight.cmp(&a.weight))
                            .then(a.entry.priority.cmp(&b.entry.priority))
                    })
                    .unwrap_or(&candidates[0]);
                (candidate, format!("least-loaded[{}]", candidate.in_flight))
            }
            BalancePolicy::Priority => {
                let top_weight = candidates.iter().map(|c| c.weight).max().unwrap_or(0);
                let top: Vec<&Candidate<'a>> = candidates.iter().filter(|c| c.weight == top_weight).collect();
                let index = self.next_counter(category) % top.len();
                (top[index], format!("priority[w={top_weight}]"))
            }
            BalancePolicy::WeightedRandom => {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|c| {
                        let degraded = if c.half_open { HALF_OPEN_WEIGHT_FACTOR } else { 1.0 };
                        (f64::from(c.weight) * (1.0 - c.error_rate) * degraded).max(f64::MIN_POSITIVE)
                    })
                    .collect();

                let total: f64 = weights.iter().sum();
                let mut draw = rand::rng().random_range(0.0..total);

                let mut index = 0;
                for (i, weight) in weights.iter().enumerate() {
                    if draw < *weight {
                        index = i;
                        break;
                    }
                    draw -= weight;
                    index = i;
                }

                (&candidates[index], "weighted-random".to_string())
            }
            BalancePolicy::Random => {
                let index = rand::rng().random_range(0..candidates.len());
                (&candidates[index], "random".to_string())
            }
        }
    }

    fn next_counter(&self, category: &str) -> usize {
        self.counters
            .entry(category.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::HealthCheckConfig;
    use indoc::indoc;
    use std::time::Duration;

    fn build_config(policy: &str) -> Arc<Config> {
        let json = indoc! {r#"
            {
              "providers": {
                "a": { "kind": "openai", "weight": 3, "priority": 1,
                       "models": [{ "name": "model-a", "maxTokens": 8192 }] },
                "b": { "kind": "qwen", "weight": 1, "priority": 2,
                       "models": [{ "name": "model-b", "maxTokens": 8192 }] },
                "c": { "kind": "lmstudio", "weight": 1, "priority": 9,
                       "models": [{ "name": "model-c", "maxTokens": 8192 }] }
              },
              "routing": {
                "policy": "POLICY",
                "default": {
                  "primary": [
                    { "provider": "a", "model": "model-a", "priority": 1 },
                    { "provider": "b", "model": "model-b", "priority": 2 }
                  ],
                  "emergency": [
                    { "provider": "c", "model": "model-c", "priority": 9 }
                  ]
                }
              }
            }
        "#}
        .replace("POLICY", policy);

        Arc::new(serde_json::from_str(&json).expect("valid config"))
    }

    fn build_router(policy: &str) -> (Router, Arc<HealthTracker>) {
        let config = build_config(policy);
        let health = Arc::new(HealthTracker::new(HealthCheckConfig {
            failure_threshold: 2,
            ..HealthCheckConfig::default()
        }));

        for id in config.providers.keys() {
            health.register(id);
        }

        (Router::new(config, Arc::clone(&health)), health)
    }

    #[test]
    fn round_robin_cycles_candidates() {
        let (router, _) = build_router("round-robin");

        let picks: Vec<String> = (0..4)
            .map(|_| router.select("default", &[]).unwrap().provider)
            .collect();

        assert_eq!(picks, vec!["a", "b", "a", "b"]);
    }

    #[test]
    fn excluded_providers_are_skipped() {
        let (router, _) = build_router("round-robin");

        let selection = router.select("default", &["a".to_string()]).unwrap();
        assert_eq!(selection.provider, "b");
    }

    #[test]
    fn falls_back_to_emergency_chain_when_primary_unhealthy() {
        let (router, health) = build_router("round-robin");

        // Open both primary circuits.
        for provider in ["a", "b"] {
            health.record_failure(provider);
            health.record_failure(provider);
        }

        let selection = router.select("default", &[]).unwrap();
        assert_eq!(selection.provider, "c");
        assert!(selection.rationale.starts_with("emergency/"));
    }

    #[test]
    fn no_healthy_provider_when_everything_is_excluded() {
        let (router, _) = build_router("round-robin");

        let error = router
            .select("default", &["a".to_string(), "b".to_string(), "c".to_string()])
            .unwrap_err();

        assert!(matches!(error, GatewayError::NoHealthyProvider { category } if category == "default"));
    }

    #[test]
    fn unknown_category_has_no_providers() {
        let (router, _) = build_router("round-robin");

        let error = router.select("nope", &[]).unwrap_err();
        assert!(matches!(error, GatewayError::NoHealthyProvider { .. }));
        assert_eq!(router.candidate_count("nope"), 0);
    }

    #[test]
    fn candidate_count_spans_both_chains() {
        let (router, _) = build_router("round-robin");
        assert_eq!(router.candidate_count("default"), 3);
    }

    #[test]
    fn least_loaded_prefers_fewest_in_flight() {
        let (router, health) = build_router("least-loaded");

        let _busy = health.begin_dispatch("a");
        let selection = router.select("default", &[]).unwrap();
        assert_eq!(selection.provider, "b");
    }

    #[test]
    fn least_loaded_ties_break_by_weight() {
        let (router, _) = build_router("least-loaded");

        // Nothing in flight anywhere: provider a wins on weight 3 vs 1.
        let selection = router.select("default", &[]).unwrap();
        assert_eq!(selection.provider, "a");
    }

    #[test]
    fn priority_policy_picks_heaviest_provider() {
        let (router, _) = build_router("priority");

        for _ in 0..3 {
            let selection = router.select("default", &[]).unwrap();
            assert_eq!(selection.provider, "a");
        }
    }

    #[test]
    fn weighted_random_stays_within_candidate_set() {
        let (router, _) = build_router("weighted-random");

        for _ in 0..20 {
            let selection = router.select("default", &[]).unwrap();
            assert!(["a", "b"].contains(&selection.provider.as_str()));
        }
    }

    #[test]
    fn random_policy_stays_within_candidate_set() {
        let (router, _) = build_router("random");

        for _ in 0..20 {
            let selection = router.select("default", &[]).unwrap();
            assert!(["a", "b"].contains(&selection.provider.as_str()));
        }
    }
}
