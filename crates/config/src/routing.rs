//! Routing configuration: categories, candidate chains, balancing policy.

use indexmap::IndexMap;
use serde::Deserialize;

/// Load balancing policy applied over a category's healthy candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancePolicy {
    /// Cycle a counter over the candidates.
    #[default]
    RoundRobin,
    /// Pick the candidate with the fewest in-flight requests.
    LeastLoaded,
    /// Highest weight first, ties broken round-robin.
    Priority,
    /// Draw proportionally to `weight × (1 − errorRate)`.
    WeightedRandom,
    /// Uniform draw.
    Random,
}

/// One entry in a category's candidate chain.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub struct ChainEntry {
    /// Provider id, must reference a configured provider.
    pub provider: String,
    /// Model to request from that provider.
    pub model: String,
    /// Maximum acceptable latency in milliseconds for this entry.
    #[serde(default = "default_max_latency")]
    pub max_latency: u64,
    /// Priority rank within the chain; lower is preferred.
    #[serde(default = "default_chain_priority")]
    pub priority: u32,
}

fn default_max_latency() -> u64 {
    30_000
}

fn default_chain_priority() -> u32 {
    5
}

/// Thresholds that shift a category from its primary chain to the
/// emergency chain, and back.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct TriggerConditions {
    /// Average latency in milliseconds above which the entry is degraded.
    pub trigger_on_latency: u64,
    /// Error rate in [0,1] above which the entry is degraded.
    pub trigger_on_error_rate: f64,
    /// Consecutive failures before the entry is degraded.
    pub trigger_on_consecutive_failures: u32,
    /// Successes required to recover a degraded entry.
    pub recovery_success_threshold: u32,
    /// Time in milliseconds before a degraded entry may be probed again.
    pub recovery_timeout_ms: u64,
}

impl Default for TriggerConditions {
    fn default() -> Self {
        Self {
            trigger_on_latency: 30_000,
            trigger_on_error_rate: 0.5,
            trigger_on_consecutive_failures: 3,
            recovery_success_threshold: 2,
            recovery_timeout_ms: 60_000,
        }
    }
}

/// A routing category with primary and emergency candidate chains.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct CategoryConfig {
    /// Ordered candidates tried under normal conditions.
    pub primary: Vec<ChainEntry>,
    /// Ordered candidates used when the primary chain has no healthy entry.
    ///
    /// The emergency chain may name providers that do not appear in the
    /// primary chain.
    pub emergency: Vec<ChainEntry>,
    /// Degradation and recovery thresholds for this category.
    pub conditions: TriggerConditions,
    /// Set to refuse requests classified into this category.
    pub blocked: bool,
}

/// Knobs for the request classifier that buckets requests into categories.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct ClassifierConfig {
    /// Estimated input tokens above which a request is `longcontext`.
    pub long_context_threshold: u32,
    /// Model-name substrings that classify a request as `background`.
    pub background_markers: Vec<String>,
    /// Tool-name prefixes that classify a request as `search`.
    pub search_tool_prefixes: Vec<String>,
    /// Explicit model-name → category overrides, checked first.
    pub model_overrides: IndexMap<String, String>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            long_context_threshold: 60_000,
            background_markers: vec!["haiku".to_string()],
            search_tool_prefixes: vec!["web_search".to_string()],
            model_overrides: IndexMap::new(),
        }
    }
}

/// How a safety-filtered upstream completion is reported downstream.
///
/// OpenAI `content_filter` and Gemini `SAFETY`/`RECITATION` finishes have no
/// exact Anthropic counterpart; the mapping is a policy choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyStopBehavior {
    /// Report `stop_sequence` (the default).
    #[default]
    StopSequence,
    /// Report `end_turn`.
    EndTurn,
}

/// Routing section of the configuration.
///
/// Category names (`default`, `longcontext`, `coding`, `background`,
/// `search`) sit directly under `routing`, next to the few reserved keys.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RoutingConfig {
    /// Balancing policy applied over healthy candidates.
    pub policy: BalancePolicy,
    /// Classifier thresholds and markers.
    pub classifier: ClassifierConfig,
    /// Safety-filter stop reason policy.
    pub safety_stop: SafetyStopBehavior,
    /// Categories keyed by name.
    #[serde(flatten)]
    pub categories: IndexMap<String, CategoryConfig>,
}

impl RoutingConfig {
    /// Look up a category by name.
    pub fn category(&self, name: &str) -> Option<&CategoryConfig> {
        self.categories.get(name)
    }
}
