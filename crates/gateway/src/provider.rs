//! Upstream provider clients.
//!
//! One client per wire dialect: [`OpenAiCompatibleClient`] covers the
//! openai, qwen, modelscope and lmstudio kinds (same wire shape, different
//! base URLs and credentials), [`GeminiClient`] speaks the wrapper
//! envelope. Both borrow a connection slot from the pool before
//! dispatching and feed SSE fragments through the streaming translators.

pub mod discovery;
mod gemini;
mod openai;

pub use gemini::GeminiClient;
pub use openai::OpenAiCompatibleClient;

use std::{collections::HashMap, pin::Pin, sync::Arc, sync::OnceLock, time::Duration};

use async_trait::async_trait;
use config::{Config, ProviderKind, SafetyStopBehavior};
use futures::Stream;
use secrecy::SecretString;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{GatewayError, GatewayResult},
    messages::{anthropic, gemini as gemini_wire, openai as openai_wire},
    pool::{AcquirePriority, ConnectionPool},
};

/// Translated Anthropic events flowing back from a streaming dispatch.
pub type EventStream = Pin<Box<dyn Stream<Item = GatewayResult<anthropic::StreamEvent>> + Send>>;

/// A request already translated into the provider's wire shape.
#[derive(Debug, Clone)]
pub enum ProviderRequest {
    OpenAi(openai_wire::ChatCompletionRequest),
    Gemini(gemini_wire::GenerateRequest),
}

/// A buffered provider reply, still in the provider's wire shape.
#[derive(Debug, Clone)]
pub enum ProviderResponse {
    OpenAi(openai_wire::ChatCompletionResponse),
    Gemini(gemini_wire::GenerateContentResponse),
}

/// Per-dispatch options handed down by the pipeline.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Attempt deadline.
    pub deadline: Duration,
    /// Connection pool priority, derived from the request.
    pub priority: AcquirePriority,
    /// Cancelled when the client disconnects or the overall deadline fires.
    pub cancel: CancellationToken,
    /// Safety-filter stop reason policy for response translation.
    pub safety: SafetyStopBehavior,
    /// Client-facing model name, echoed in stream metadata.
    pub client_model: String,
}

#[async_trait]
pub trait ProviderClient: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Execute a buffered upstream call.
    async fn complete(&self, request: ProviderRequest, options: &DispatchOptions) -> GatewayResult<ProviderResponse>;

    /// Execute a streaming upstream call. The returned stream yields
    /// already-translated Anthropic events.
    async fn complete_stream(&self, request: ProviderRequest, options: &DispatchOptions)
    -> GatewayResult<EventStream>;

    /// Out-of-band model discovery.
    async fn list_models(&self) -> anyhow::Result<Vec<discovery::DiscoveredModel>>;

    /// Lightweight health probe; feeds the tracker's periodic check.
    async fn probe(&self) -> bool {
        self.list_models().await.is_ok()
    }
}

/// All configured provider clients, keyed by provider id.
pub struct ProviderRegistry {
    clients: HashMap<String, Arc<dyn ProviderClient>>,
}

impl ProviderRegistry {
    pub fn from_config(config: &Config, pool: ConnectionPool) -> GatewayResult<Self> {
        let mut clients: HashMap<String, Arc<dyn ProviderClient>> = HashMap::new();

        for (id, provider_config) in &config.providers {
            let credential = resolve_credential(id, provider_config);

            let client: Arc<dyn ProviderClient> = if provider_config.kind.is_openai_compatible() {
                Arc::new(OpenAiCompatibleClient::new(
                    id.clone(),
                    provider_config,
                    credential,
                    pool.clone(),
                )?)
            } else {
                Arc::new(GeminiClient::new(id.clone(), provider_config, credential, pool.clone())?)
            };

            clients.insert(id.clone(), client);
        }

        Ok(Self { clients })
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn ProviderClient>> {
        self.clients.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.clients.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ProviderClient>)> {
        self.clients.iter().map(|(id, client)| (id.as_str(), client))
    }

    /// Registry with explicit clients, used by tests with stub providers.
    pub fn from_clients(clients: HashMap<String, Arc<dyn ProviderClient>>) -> Self {
        Self { clients }
    }
}

fn resolve_credential(id: &str, provider_config: &config::ProviderConfig) -> Option<SecretString> {
    if let Some(variable) = &provider_config.credential_ref {
        match std::env::var(variable) {
            Ok(value) if !value.is_empty() => return Some(SecretString::from(value)),
            _ => {
                log::warn!("provider '{id}' references credential variable '{variable}' which is not set");
            }
        }
    }

    provider_config.api_key.clone()
}

/// Common HTTP client, shared so upstream connections are reused across
/// provider clients.
pub(crate) fn http_client() -> reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();

    CLIENT
        .get_or_init(|| {
            let mut headers = http::HeaderMap::new();
            headers.insert(http::header::CONNECTION, http::HeaderValue::from_static("keep-alive"));

            reqwest::Client::builder()
                // Hyper's own pool stays short-lived so DNS changes are
                // picked up; the gateway's pool handles admission.
                .pool_idle_timeout(Some(Duration::from_secs(5)))
                .tcp_nodelay(true)
                .tcp_keepalive(Some(Duration::from_secs(60)))
                .default_headers(headers)
                .build()
                .unwrap_or_default()
        })
        .clone()
}

/// Classify an upstream HTTP status into a gateway error.
pub(crate) fn classify_status(provider: &str, status: u16, body: &str) -> GatewayError {
    log::debug!("provider '{provider}' returned HTTP {status}: {body}");

    GatewayError::ProviderHttp {
        provider: provider.to_string(),
        status,
        message: summarize_error_body(body),
    }
}

/// Keep a short, secret-free summary of an upstream error body.
fn summarize_error_body(body: &str) -> String {
    #[derive(serde::Deserialize)]
    struct Envelope {
        error: Option<ErrorDetail>,
    }

    #[derive(serde::Deserialize)]
    struct ErrorDetail {
        message: Option<String>,
    }

    let message = sonic_rs::from_str::<Envelope>(body)
        .ok()
        .and_then(|envelope| envelope.error)
        .and_then(|detail| detail.message)
        .unwrap_or_default();

    let mut summary = message;
    summary.truncate(200);
    summary
}

/// Classify a reqwest transport error.
pub(crate) fn classify_transport(provider: &str, error: &reqwest::Error) -> GatewayError {
    if error.is_timeout() {
        GatewayError::Timeout {
            stage: crate::error::Stage::Dispatch,
        }
    } else {
        GatewayError::Transport {
            provider: provider.to_string(),
            message: error.to_string(),
        }
    }
}
