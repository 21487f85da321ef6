//! The request pipeline: classify → route → transform-request → dispatch →
//! transform-response → emit.
//!
//! Stages within one request run sequentially; requests run in parallel.
//! Route and dispatch failures feed the failover supervisor; failures in
//! any other stage surface immediately. Once a streaming dispatch has
//! handed its event stream back, no further retry happens.

use std::sync::Arc;
use std::time::Duration;

use config::{Config, ProviderKind};
use tokio_util::sync::CancellationToken;

use crate::{
    error::{GatewayError, PipelineError, Stage},
    failover::{Attempt, FailoverSupervisor},
    health::{CircuitDecision, HealthTracker},
    messages::anthropic,
    pool::AcquirePriority,
    provider::{DispatchOptions, EventStream, ProviderRegistry, ProviderRequest, ProviderResponse},
    request::RequestContext,
    routing::{Router, Selection},
    translate,
};

/// Result of a pipeline run: a buffered Anthropic response or a stream of
/// translated events.
pub enum PipelineReply {
    Message(Box<anthropic::ChatResponse>),
    Stream(EventStream),
}

impl std::fmt::Debug for PipelineReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineReply::Message(msg) => f.debug_tuple("Message").field(msg).finish(),
            PipelineReply::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Per-request state threaded through the stages.
pub struct PipelineRequest {
    pub correlation_id: String,
    pub request: anthropic::ChatRequest,
    pub category: String,
    pub attempts: Vec<Attempt>,
    pub cancel: CancellationToken,
    pub streaming: bool,
    /// Human-readable diagnostic trail, one line per stage decision.
    pub trail: Vec<String>,
}

pub struct Pipeline {
    config: Arc<Config>,
    registry: Arc<ProviderRegistry>,
    health: Arc<HealthTracker>,
    failover: FailoverSupervisor,
}

impl Pipeline {
    pub fn new(
        config: Arc<Config>,
        registry: Arc<ProviderRegistry>,
        router: Arc<Router>,
        health: Arc<HealthTracker>,
    ) -> Self {
        let failover = FailoverSupervisor::new(
            router,
            config.pool.retry_attempts,
            Duration::from_millis(config.pool.retry_delay),
        );

        Self {
            config,
            registry,
            health,
            failover,
        }
    }

    /// Drive one request through the stages.
    pub async fn run(
        &self,
        request: anthropic::ChatRequest,
        context: &RequestContext,
        cancel: CancellationToken,
    ) -> Result<PipelineReply, PipelineError> {
        let streaming = request.stream.unwrap_or(false);

        let category = self
            .classify(&request)
            .map_err(|error| PipelineError::new(error, Stage::Classify))?;

        log::debug!(
            "request {} classified as '{category}' (model: {})",
            context.correlation_id,
            request.model
        );

        let mut pipeline_request = PipelineRequest {
            correlation_id: context.correlation_id.clone(),
            request,
            category,
            attempts: Vec::new(),
            cancel,
            streaming,
            trail: Vec::new(),
        };

        let overall = Duration::from_millis(self.config.server.overall_timeout);

        match tokio::time::timeout(overall, self.attempt_loop(&mut pipeline_request)).await {
            Ok(result) => result,
            Err(_) => {
                pipeline_request.cancel.cancel();
                Err(PipelineError::new(GatewayError::Timeout { stage: Stage::Dispatch }, Stage::Dispatch)
                    .with_retries(pipeline_request.attempts.len() as u32))
            }
        }
    }

    /// Classify the request into a routing category.
    ///
    /// Order: explicit model overrides, search-tool detection, long-context
    /// size estimate, background model markers, then `default`.
    fn classify(&self, request: &anthropic::ChatRequest) -> Result<String, GatewayError> {
        let classifier = &self.config.routing.classifier;

        let mut category = if let Some(category) = classifier.model_overrides.get(&request.model) {
            category.clone()
        } else if self.requests_search_tool(request) {
            "search".to_string()
        } else if estimate_input_tokens(request) > classifier.long_context_threshold {
            "longcontext".to_string()
        } else if classifier
            .background_markers
            .iter()
            .any(|marker| request.model.contains(marker.as_str()))
        {
            "background".to_string()
        } else {
            "default".to_string()
        };

        // A category nobody configured falls back to default.
        if self.config.routing.category(&category).is_none() && category != "default" {
            log::debug!("category '{category}' not configured, falling back to default");
            category = "default".to_string();
        }

        let Some(category_config) = self.config.routing.category(&category) else {
            return Err(GatewayError::ClientBad(format!(
                "no routing category configured for model '{}'",
                request.model
            )));
        };

        if category_config.blocked {
            return Err(GatewayError::ClientBad(format!("category '{category}' is blocked")));
        }

        Ok(category)
    }

    fn requests_search_tool(&self, request: &anthropic::ChatRequest) -> bool {
        let prefixes = &self.config.routing.classifier.search_tool_prefixes;

        request.tools.iter().flatten().any(|tool| {
            tool.name
                .as_deref()
                .is_some_and(|name| prefixes.iter().any(|prefix| name.starts_with(prefix.as_str())))
        })
    }

    async fn attempt_loop(&self, pipeline_request: &mut PipelineRequest) -> Result<PipelineReply, PipelineError> {
        let mut last_error: Option<PipelineError> = None;

        loop {
            // Route
            let selection = match self
                .failover
                .next_candidate(&pipeline_request.category, &pipeline_request.attempts)
            {
                Ok(selection) => selection,
                Err(route_error) => {
                    // Candidates exhausted: surface the last dispatch error
                    // when there is one, the routing failure otherwise.
                    return Err(last_error.unwrap_or_else(|| {
                        PipelineError::new(route_error, Stage::Route)
                            .with_retries(pipeline_request.attempts.len() as u32)
                    }));
                }
            };

            pipeline_request.trail.push(format!(
                "route -> {}/{} ({})",
                selection.provider, selection.model, selection.rationale
            ));

            // Circuit gate at dispatch time.
            if let CircuitDecision::Reject { retry_in } = self.health.check_circuit(&selection.provider) {
                let error = GatewayError::CircuitOpen {
                    provider: selection.provider.clone(),
                };

                log::debug!(
                    "circuit open for '{}', retry possible in {}ms",
                    selection.provider,
                    retry_in.as_millis()
                );

                let mut attempt = Attempt::begin(&selection);
                attempt.fail(&error);
                pipeline_request.attempts.push(attempt);

                last_error = Some(
                    PipelineError::new(error, Stage::Dispatch)
                        .with_target(selection.provider.clone(), selection.model.clone())
                        .with_retries(pipeline_request.attempts.len().saturating_sub(1) as u32),
                );
                continue;
            }

            // TransformRequest
            let provider_request = match self.transform_request(pipeline_request, &selection) {
                Ok(provider_request) => provider_request,
                Err(error) => {
                    return Err(PipelineError::new(error, Stage::TransformRequest)
                        .with_target(selection.provider.clone(), selection.model.clone())
                        .with_retries(pipeline_request.attempts.len() as u32));
                }
            };

            // Dispatch
            match self.dispatch(pipeline_request, &selection, provider_request).await {
                Ok(PipelineReply::Stream(stream)) => return Ok(PipelineReply::Stream(stream)),
                Ok(PipelineReply::Message(response)) => return Ok(PipelineReply::Message(response)),
                Err(error) => {
                    if matches!(error.error, GatewayError::ClientCancelled) {
                        return Err(error);
                    }

                    if !self.failover.should_retry(&error.error, false) {
                        return Err(error);
                    }

                    last_error = Some(error);

                    let retry_number = pipeline_request.attempts.len() as u32;
                    let delay = self.failover.backoff(retry_number);

                    log::debug!(
                        "attempt {} against '{}' failed, backing off {}ms",
                        retry_number,
                        selection.provider,
                        delay.as_millis()
                    );

                    tokio::select! {
                        _ = pipeline_request.cancel.cancelled() => {
                            return Err(PipelineError::new(GatewayError::ClientCancelled, Stage::Dispatch)
                                .with_retries(retry_number));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// Translate the request into the selected provider's wire shape.
    fn transform_request(
        &self,
        pipeline_request: &PipelineRequest,
        selection: &Selection,
    ) -> Result<ProviderRequest, GatewayError> {
        let provider_config = self
            .config
            .providers
            .get(&selection.provider)
            .ok_or_else(|| GatewayError::NoHealthyProvider {
                category: pipeline_request.category.clone(),
            })?;

        let ceiling = provider_config.model(&selection.model).map(|model| model.max_tokens);

        let mut upstream_request = pipeline_request.request.clone();
        upstream_request.model = selection.model.clone();

        match provider_config.kind {
            ProviderKind::Gemini => Ok(ProviderRequest::Gemini(translate::gemini::request_from_anthropic(
                upstream_request,
                None,
                ceiling,
            )?)),
            _ => Ok(ProviderRequest::OpenAi(translate::openai::request_from_anthropic(
                upstream_request,
                ceiling,
            )?)),
        }
    }

    /// Execute one attempt; success and failure are recorded to the health
    /// tracker before control returns.
    async fn dispatch(
        &self,
        pipeline_request: &mut PipelineRequest,
        selection: &Selection,
        provider_request: ProviderRequest,
    ) -> Result<PipelineReply, PipelineError> {
        let Some(client) = self.registry.get(&selection.provider) else {
            let error = GatewayError::Transport {
                provider: selection.provider.clone(),
                message: "provider client not initialized".to_string(),
            };
            return Err(PipelineError::new(error, Stage::Dispatch)
                .with_target(selection.provider.clone(), selection.model.clone()));
        };

        let options = DispatchOptions {
            deadline: self.attempt_deadline(selection),
            priority: self.acquire_priority(pipeline_request),
            cancel: pipeline_request.cancel.clone(),
            safety: self.config.routing.safety_stop,
            client_model: pipeline_request.request.model.clone(),
        };

        let mut attempt = Attempt::begin(selection);
        let in_flight = self.health.begin_dispatch(&selection.provider);

        let outcome = if pipeline_request.streaming {
            client
                .complete_stream(provider_request, &options)
                .await
                .map(DispatchOutcome::Stream)
        } else {
            client.complete(provider_request, &options).await.map(DispatchOutcome::Buffered)
        };

        drop(in_flight);

        match outcome {
            Ok(DispatchOutcome::Stream(stream)) => {
                attempt.succeed();
                self.health.record_success(&selection.provider, attempt.latency());
                pipeline_request.attempts.push(attempt);

                Ok(PipelineReply::Stream(stream))
            }
            Ok(DispatchOutcome::Buffered(response)) => {
                attempt.succeed();
                self.health.record_success(&selection.provider, attempt.latency());
                pipeline_request.attempts.push(attempt);

                // TransformResponse
                let translated = self
                    .transform_response(pipeline_request, selection, response)
                    .map_err(|error| {
                        PipelineError::new(error, Stage::TransformResponse)
                            .with_target(selection.provider.clone(), selection.model.clone())
                            .with_retries(pipeline_request.attempts.len().saturating_sub(1) as u32)
                    })?;

                Ok(PipelineReply::Message(Box::new(translated)))
            }
            Err(error) => {
                attempt.fail(&error);

                if !matches!(error, GatewayError::ClientCancelled) {
                    self.health.record_failure(&selection.provider);
                }

                pipeline_request.attempts.push(attempt);

                Err(PipelineError::new(error, Stage::Dispatch)
                    .with_target(selection.provider.clone(), selection.model.clone())
                    .with_retries(pipeline_request.attempts.len().saturating_sub(1) as u32))
            }
        }
    }

    fn transform_response(
        &self,
        pipeline_request: &PipelineRequest,
        selection: &Selection,
        response: ProviderResponse,
    ) -> Result<anthropic::ChatResponse, GatewayError> {
        let client_model = &pipeline_request.request.model;
        let safety = self.config.routing.safety_stop;

        match response {
            ProviderResponse::OpenAi(response) => {
                translate::openai::response_to_anthropic(response, client_model, &selection.provider, safety)
            }
            ProviderResponse::Gemini(response) => {
                translate::gemini::response_to_anthropic(response, client_model, &selection.provider, safety)
            }
        }
    }

    fn attempt_deadline(&self, selection: &Selection) -> Duration {
        Duration::from_millis(self.config.server.read_timeout.min(selection.max_latency_ms))
    }

    /// Pool priority derived from the request: streams are latency
    /// sensitive, background traffic yields to everything else.
    fn acquire_priority(&self, pipeline_request: &PipelineRequest) -> AcquirePriority {
        if pipeline_request.streaming {
            AcquirePriority::High
        } else if pipeline_request.category == "background" {
            AcquirePriority::Low
        } else {
            AcquirePriority::Normal
        }
    }
}

enum DispatchOutcome {
    Buffered(ProviderResponse),
    Stream(EventStream),
}

/// Rough input token estimate (four characters per token) used for
/// long-context classification.
fn estimate_input_tokens(request: &anthropic::ChatRequest) -> u32 {
    let mut chars = request.system.as_ref().map(|s| s.flatten().len()).unwrap_or(0);

    for message in &request.messages {
        match &message.content {
            anthropic::MessageContent::Text(text) => chars += text.len(),
            anthropic::MessageContent::Blocks(blocks) => {
                for block in blocks {
                    if let anthropic::ContentBlock::Known(anthropic::KnownBlock::Text { text }) = block {
                        chars += text.len();
                    }
                }
            }
        }
    }

    (chars / 4) as u32
}
