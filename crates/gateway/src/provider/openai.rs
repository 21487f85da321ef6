use std::collections::VecDeque;

use async_trait::async_trait;
use config::{ProviderConfig, ProviderKind};
use eventsource_stream::Eventsource;
use futures::StreamExt;
use reqwest::header::AUTHORIZATION;
use secrecy::{ExposeSecret, SecretString};

use crate::{
    error::{GatewayError, GatewayResult, Stage},
    messages::openai as wire,
    pool::{ConnectionLease, ConnectionPool, HostKey},
    provider::{
        DispatchOptions, EventStream, ProviderClient, ProviderRequest, ProviderResponse, classify_status,
        classify_transport,
        discovery::{DiscoveredModel, fallback_max_tokens},
        http_client,
    },
    translate::streaming::OpenAiStreamTranslator,
};

/// Client for every OpenAI-compatible kind: openai, qwen, modelscope and
/// lmstudio all speak `POST {base}/v1/chat/completions`.
pub struct OpenAiCompatibleClient {
    id: String,
    kind: ProviderKind,
    base_url: String,
    host_key: HostKey,
    credential: Option<SecretString>,
    configured_models: Vec<DiscoveredModel>,
    client: reqwest::Client,
    pool: ConnectionPool,
}

impl OpenAiCompatibleClient {
    pub fn new(
        id: String,
        config: &ProviderConfig,
        credential: Option<SecretString>,
        pool: ConnectionPool,
    ) -> GatewayResult<Self> {
        let base_url = config.base_url();

        let url: url::Url = base_url.parse().map_err(|_| GatewayError::ClientBad(format!(
            "provider '{id}' has an invalid base URL"
        )))?;
        let host_key = HostKey::from_url(&url).ok_or_else(|| {
            GatewayError::ClientBad(format!("provider '{id}' base URL has no host"))
        })?;

        let configured_models = config
            .models
            .iter()
            .map(|model| DiscoveredModel {
                name: model.name.clone(),
                max_tokens: model.max_tokens,
            })
            .collect();

        Ok(Self {
            id,
            kind: config.kind,
            base_url,
            host_key,
            credential,
            configured_models,
            client: http_client(),
            pool,
        })
    }

    fn request_builder(&self, url: String) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        if let Some(credential) = &self.credential {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", credential.expose_secret()));
        }

        builder
    }

    async fn acquire_lease(&self, options: &DispatchOptions) -> GatewayResult<ConnectionLease> {
        self.pool
            .acquire(self.host_key.clone(), options.priority)
            .await
            .map_err(|error| match error {
                crate::pool::PoolError::AcquireTimeout { .. } => GatewayError::Timeout { stage: Stage::Dispatch },
                crate::pool::PoolError::Closed => GatewayError::Transport {
                    provider: self.id.clone(),
                    message: "connection pool shut down".to_string(),
                },
            })
    }
}

#[async_trait]
impl ProviderClient for OpenAiCompatibleClient {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn complete(&self, request: ProviderRequest, options: &DispatchOptions) -> GatewayResult<ProviderResponse> {
        let ProviderRequest::OpenAi(mut request) = request else {
            return Err(GatewayError::InvalidRequestShape {
                path: "provider request shape".to_string(),
            });
        };
        request.stream = Some(false);

        let body = sonic_rs::to_vec(&request).map_err(|e| GatewayError::ClientBad(format!(
            "failed to serialize upstream request: {e}"
        )))?;

        let mut lease = self.acquire_lease(options).await?;
        let url = format!("{}/v1/chat/completions", self.base_url);

        let send = self.request_builder(url).timeout(options.deadline).body(body).send();

        let response = tokio::select! {
            _ = options.cancel.cancelled() => {
                lease.poison();
                return Err(GatewayError::ClientCancelled);
            }
            result = send => result.map_err(|e| {
                lease.poison();
                classify_transport(&self.id, &e)
            })?,
        };

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.id, status.as_u16(), &body));
        }

        let text = response.text().await.map_err(|e| {
            lease.poison();
            classify_transport(&self.id, &e)
        })?;

        let parsed: wire::ChatCompletionResponse =
            sonic_rs::from_str(&text).map_err(|e| GatewayError::ResponseMalformed {
                provider: self.id.clone(),
                message: format!("chat completion did not parse: {e}"),
            })?;

        Ok(ProviderResponse::OpenAi(parsed))
    }

    async fn complete_stream(
        &self,
        request: ProviderRequest,
        options: &DispatchOptions,
    ) -> GatewayResult<EventStream> {
        let ProviderRequest::OpenAi(mut request) = request else {
            return Err(GatewayError::InvalidRequestShape {
                path: "provider request shape".to_string(),
            });
        };
        request.stream = Some(true);

        let body = sonic_rs::to_vec(&request).map_err(|e| GatewayError::ClientBad(format!(
            "failed to serialize upstream request: {e}"
        )))?;

        let mut lease = self.acquire_lease(options).await?;
        let url = format!("{}/v1/chat/completions", self.base_url);

        // The deadline bounds connection + response headers; body chunks
        // flow for as long as the upstream keeps generating.
        let send = self
            .request_builder(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .body(body)
            .send();

        let response = tokio::select! {
            _ = options.cancel.cancelled() => {
                lease.poison();
                return Err(GatewayError::ClientCancelled);
            }
            result = tokio::time::timeout(options.deadline, send) => match result {
                Ok(send_result) => send_result.map_err(|e| {
                    lease.poison();
                    classify_transport(&self.id, &e)
                })?,
                Err(_) => {
                    lease.poison();
                    return Err(GatewayError::Timeout { stage: Stage::Dispatch });
                }
            },
        };

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(&self.id, status.as_u16(), &body));
        }

        let translator = OpenAiStreamTranslator::new(options.client_model.clone(), options.safety);

        Ok(translate_sse_stream(
            self.id.clone(),
            response,
            translator,
            lease,
            options.cancel.clone(),
        ))
    }

    async fn list_models(&self) -> anyhow::Result<Vec<DiscoveredModel>> {
        let mut builder = self.client.get(format!("{}/v1/models", self.base_url));

        if let Some(credential) = &self.credential {
            builder = builder.bearer_auth(credential.expose_secret());
        }

        let response = builder
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("models request to '{}' failed: {e}", self.id))?;

        if !response.status().is_success() {
            anyhow::bail!("models request to '{}' returned {}", self.id, response.status());
        }

        let listing: wire::ModelsResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("models response from '{}' did not parse: {e}", self.id))?;

        let mut models: Vec<DiscoveredModel> = listing
            .data
            .into_iter()
            .map(|model| {
                let max_tokens = model
                    .context_length
                    .or(model.max_model_len)
                    .unwrap_or_else(|| fallback_max_tokens(&model.id));

                DiscoveredModel {
                    name: model.id,
                    max_tokens,
                }
            })
            .collect();

        // Declared models always appear, with their configured ceilings
        // taking precedence over discovered hints.
        for configured in &self.configured_models {
            match models.iter_mut().find(|m| m.name == configured.name) {
                Some(existing) => existing.max_tokens = configured.max_tokens,
                None => models.push(configured.clone()),
            }
        }

        Ok(models)
    }
}

struct SseState {
    provider: String,
    events: std::pin::Pin<
        Box<
            dyn futures::Stream<
                    Item = Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>,
                > + Send,
        >,
    >,
    translator: OpenAiStreamTranslator,
    lease: Option<ConnectionLease>,
    pending: VecDeque<crate::messages::anthropic::StreamEvent>,
    cancel: tokio_util::sync::CancellationToken,
    done: bool,
}

/// Wrap a streaming HTTP response into a translated Anthropic event
/// stream. The connection lease lives inside the stream and is released
/// (or poisoned) when the stream ends.
fn translate_sse_stream(
    provider: String,
    response: reqwest::Response,
    translator: OpenAiStreamTranslator,
    lease: ConnectionLease,
    cancel: tokio_util::sync::CancellationToken,
) -> EventStream {
    let state = SseState {
        provider,
        events: Box::pin(response.bytes_stream().eventsource()),
        translator,
        lease: Some(lease),
        pending: VecDeque::new(),
        cancel,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }

            if state.done {
                return None;
            }

            let next = tokio::select! {
                _ = state.cancel.cancelled() => {
                    state.done = true;
                    if let Some(mut lease) = state.lease.take() {
                        // Cancelled mid-body: the connection cannot be reused.
                        lease.poison();
                    }
                    return Some((Err(GatewayError::ClientCancelled), state));
                }
                next = state.events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    if event.data == "[DONE]" {
                        let finish = state.translator.finish();
                        state.pending.extend(finish);
                        state.done = true;
                        state.lease.take();
                        continue;
                    }

                    match sonic_rs::from_str::<wire::StreamChunk>(&event.data) {
                        Ok(chunk) => state.pending.extend(state.translator.on_chunk(chunk)),
                        Err(_) => log::warn!("skipping unparseable stream chunk from '{}'", state.provider),
                    }
                }
                Some(Err(error)) => {
                    state.done = true;
                    if let Some(mut lease) = state.lease.take() {
                        lease.poison();
                    }

                    return Some((
                        Err(GatewayError::Transport {
                            provider: state.provider.clone(),
                            message: format!("stream read failed: {error}"),
                        }),
                        state,
                    ));
                }
                None => {
                    let finish = state.translator.finish();
                    state.pending.extend(finish);
                    state.done = true;
                    state.lease.take();
                    continue;
                }
            }
        }
    }))
}
