//! Gateway runtime: owns the pipeline, pool, health tracker and provider
//! registry, and runs the periodic background tasks.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use config::Config;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{GatewayResult, PipelineError},
    health::{CircuitState, HealthTracker},
    messages::anthropic,
    pipeline::{Pipeline, PipelineReply},
    pool::ConnectionPool,
    provider::ProviderRegistry,
    request::RequestContext,
    routing::Router,
};

/// Interval of the pool's idle sweep.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Explicit lifetime-owning runtime, constructed once at startup and shared
/// with every handler. The configuration snapshot inside is immutable;
/// reconfiguration builds a new `GatewayServer`.
pub struct GatewayServer {
    config: Arc<Config>,
    pipeline: Pipeline,
    health: Arc<HealthTracker>,
    registry: Arc<ProviderRegistry>,
    pool: ConnectionPool,
    active_requests: AtomicUsize,
    shutdown: CancellationToken,
}

#[derive(Debug, Serialize)]
pub struct StatusSnapshot {
    pub providers: Vec<ProviderStatus>,
    #[serde(rename = "activeRequests")]
    pub active_requests: usize,
}

#[derive(Debug, Serialize)]
pub struct ProviderStatus {
    pub id: String,
    pub healthy: bool,
    #[serde(rename = "qualityScore")]
    pub quality_score: f64,
    #[serde(rename = "inFlight")]
    pub in_flight: u32,
    pub circuit: CircuitState,
}

impl GatewayServer {
    pub fn new(config: Config, shutdown: CancellationToken) -> GatewayResult<Arc<Self>> {
        let config = Arc::new(config);

        let pool = ConnectionPool::new(config.pool.clone());
        let health = Arc::new(HealthTracker::new(config.health.clone()));

        for id in config.providers.keys() {
            health.register(id);
        }

        let registry = Arc::new(ProviderRegistry::from_config(&config, pool.clone())?);
        let router = Arc::new(Router::new(Arc::clone(&config), Arc::clone(&health)));
        let pipeline = Pipeline::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            router,
            Arc::clone(&health),
        );

        let server = Arc::new(Self {
            config,
            pipeline,
            health,
            registry,
            pool,
            active_requests: AtomicUsize::new(0),
            shutdown,
        });

        server.spawn_background_tasks();

        Ok(server)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn health_tracker(&self) -> &HealthTracker {
        &self.health
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Begin a graceful stop: in-flight requests drain, new work is turned
    /// away by the serve loop.
    pub fn begin_shutdown(&self) {
        log::info!("shutdown requested, draining in-flight requests");
        self.shutdown.cancel();
    }

    /// Run one request through the pipeline, tracking the active count.
    pub async fn handle(
        &self,
        request: anthropic::ChatRequest,
        context: &RequestContext,
        cancel: CancellationToken,
    ) -> Result<PipelineReply, PipelineError> {
        let _active = ActiveGuard::enter(&self.active_requests);
        self.pipeline.run(request, context, cancel).await
    }

    /// Overall gateway health: healthy when every provider is, degraded
    /// when at least one is, unhealthy otherwise.
    pub fn health_status(&self) -> &'static str {
        let snapshots = self.health.snapshots();

        let healthy = snapshots.iter().filter(|(_, snapshot)| snapshot.healthy).count();

        if healthy == snapshots.len() && !snapshots.is_empty() {
            "healthy"
        } else if healthy > 0 {
            "degraded"
        } else {
            "unhealthy"
        }
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let mut providers: Vec<ProviderStatus> = self
            .health
            .snapshots()
            .into_iter()
            .map(|(id, snapshot)| ProviderStatus {
                id,
                healthy: snapshot.healthy,
                quality_score: snapshot.quality_score,
                in_flight: snapshot.in_flight,
                circuit: snapshot.circuit,
            })
            .collect();
        providers.sort_by(|a, b| a.id.cmp(&b.id));

        StatusSnapshot {
            providers,
            active_requests: self.active_requests.load(Ordering::Relaxed),
        }
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        let sweep_pool = self.pool.clone();
        let sweep_shutdown = self.shutdown.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = sweep_shutdown.cancelled() => break,
                    _ = tick.tick() => sweep_pool.sweep(),
                }
            }
        });

        let probe_server = Arc::clone(self);
        let probe_shutdown = self.shutdown.clone();
        let probe_interval = Duration::from_millis(self.config.health.check_interval);

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(probe_interval);
            // The immediate first tick would probe before startup settles.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = probe_shutdown.cancelled() => break,
                    _ = tick.tick() => probe_server.run_probes().await,
                }
            }
        });
    }

    /// Probe every provider's lightweight endpoint; results feed the same
    /// success/failure path as real attempts.
    async fn run_probes(&self) {
        for (id, client) in self.registry.iter() {
            let started = Instant::now();

            if client.probe().await {
                self.health.record_success(id, started.elapsed());
            } else {
                log::warn!("health probe failed for provider '{id}'");
                self.health.record_failure(id);
            }
        }
    }
}

struct ActiveGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}
