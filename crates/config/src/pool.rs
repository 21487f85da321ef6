//! Connection pool caps and timeouts.

use serde::Deserialize;

/// Upstream connection pool configuration.
///
/// All timeouts are in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct PoolConfig {
    /// Global cap on live connections across all hosts.
    pub max_connections: usize,
    /// Cap on live connections to a single `(scheme, host, port)`.
    pub max_connections_per_host: usize,
    /// Cap on idle connections retained for reuse.
    pub max_idle: usize,
    /// How long an acquire may wait for a connection before failing.
    pub connection_timeout: u64,
    /// Idle connections older than this are reaped by the sweep.
    pub idle_timeout: u64,
    /// Keep-alive window advertised to upstreams.
    pub keep_alive_timeout: u64,
    /// Cross-provider retry attempts allowed after the first attempt.
    pub retry_attempts: u32,
    /// Base delay in milliseconds for exponential retry backoff.
    pub retry_delay: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            max_connections_per_host: 10,
            max_idle: 20,
            connection_timeout: 5_000,
            idle_timeout: 30_000,
            keep_alive_timeout: 60_000,
            retry_attempts: 2,
            retry_delay: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_override_keeps_remaining_defaults() {
        let pool: PoolConfig = serde_json::from_str(r#"{ "maxConnections": 7 }"#).unwrap();

        assert_eq!(pool.max_connections, 7);
        assert_eq!(pool.max_connections_per_host, 10);
        assert_eq!(pool.retry_delay, 500);
    }
}
