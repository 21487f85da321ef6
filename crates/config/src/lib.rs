//! rcc configuration structures mapping the rcc.json configuration.

#![deny(missing_docs)]

mod loader;
mod pool;
mod providers;
mod routing;
mod server;

use std::path::Path;

use serde::Deserialize;

pub use pool::PoolConfig;
pub use providers::{ModelEntry, ModelCapability, ProviderConfig, ProviderKind};
pub use routing::{
    BalancePolicy, CategoryConfig, ChainEntry, ClassifierConfig, RoutingConfig, SafetyStopBehavior, TriggerConditions,
};
pub use server::{HealthCheckConfig, ServerConfig};

/// Main configuration structure for the rcc gateway.
///
/// A loaded `Config` is an immutable snapshot: reconfiguration replaces the
/// whole value, it never mutates one in place.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct Config {
    /// HTTP server settings for the front door.
    pub server: ServerConfig,
    /// Upstream provider declarations, keyed by provider id.
    pub providers: indexmap::IndexMap<String, ProviderConfig>,
    /// Request routing: categories, candidate chains, balancing policy.
    pub routing: RoutingConfig,
    /// Upstream connection pool caps and timeouts.
    pub pool: PoolConfig,
    /// Health probing and circuit breaker thresholds.
    pub health: HealthCheckConfig,
}

impl Config {
    /// Load configuration from a JSON file, applying `RCC_*` environment
    /// variable overrides on top of the file contents.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        loader::load(path)
    }

    /// Validates cross-references: every chain entry must name a configured
    /// provider, and at least one provider must exist.
    pub fn validate(&self) -> anyhow::Result<()> {
        loader::validate(self)
    }
}
