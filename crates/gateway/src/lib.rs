//! rcc gateway: a local HTTP gateway that accepts Anthropic-style
//! Messages requests, routes each to a configured upstream provider, and
//! translates request and response between wire formats.

use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response, Sse, sse::Event},
    routing::{get, post},
};
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

pub mod error;
mod failover;
pub mod health;
pub mod messages;
mod pipeline;
pub mod pool;
pub mod provider;
mod request;
mod routing;
pub mod server;
pub mod translate;

pub use error::{GatewayError, GatewayResult, PipelineError, Stage};
pub use pipeline::{Pipeline, PipelineReply};
pub use server::GatewayServer;

use crate::messages::anthropic;
use crate::request::CORRELATION_HEADER;

/// Build the axum router for the gateway endpoints.
///
/// `shutdown` is cancelled by `POST /shutdown`; the caller's serve loop
/// watches it for graceful drain.
pub fn router(config: config::Config, shutdown: CancellationToken) -> anyhow::Result<Router> {
    let max_body = config.server.max_body_bytes;

    let server = GatewayServer::new(config, shutdown)
        .map_err(|e| anyhow::anyhow!("failed to initialize gateway: {e}"))?;

    let router = Router::new()
        .route("/v1/messages", post(messages_handler))
        .route("/v1/models", get(models_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/status/reset", post(reset_handler))
        .route("/shutdown", post(shutdown_handler))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(server);

    Ok(router)
}

/// Handle Anthropic Messages requests, buffered or streaming.
async fn messages_handler(
    State(server): State<Arc<GatewayServer>>,
    headers: HeaderMap,
    body: Result<axum::body::Bytes, axum::extract::rejection::BytesRejection>,
) -> Response {
    let context = request::extract_context(&headers);
    let correlation_id = context.correlation_id.clone();

    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            let error = PipelineError::new(
                GatewayError::ClientBad(format!("unreadable request body: {rejection}")),
                Stage::Classify,
            );
            return with_correlation(error.into_response(), &correlation_id);
        }
    };

    let chat_request: anthropic::ChatRequest = match sonic_rs::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let error = PipelineError::new(GatewayError::ClientBad(format!("invalid request body: {e}")), Stage::Classify);
            return with_correlation(error.into_response(), &correlation_id);
        }
    };

    log::debug!(
        "request {correlation_id}: model={}, messages={}, stream={}",
        chat_request.model,
        chat_request.messages.len(),
        chat_request.stream.unwrap_or(false)
    );

    let cancel = CancellationToken::new();

    let response = match server.handle(chat_request, &context, cancel).await {
        Ok(PipelineReply::Message(response)) => Json(response).into_response(),
        Ok(PipelineReply::Stream(stream)) => stream_response(stream),
        Err(error) => {
            if matches!(error.error, GatewayError::ClientCancelled) {
                log::debug!("request {correlation_id} cancelled by client");
            } else {
                log::warn!("request {correlation_id} failed: {error}");
            }
            error.into_response()
        }
    };

    with_correlation(response, &correlation_id)
}

/// Forward translated events as SSE. A mid-stream failure terminates the
/// stream with a final `error` event; there is no retry at this point.
fn stream_response(stream: provider::EventStream) -> Response {
    let event_stream = stream
        .scan(false, |errored, result| {
            let item = if *errored {
                None
            } else {
                match result {
                    Ok(event) => Some(event),
                    Err(error) => {
                        log::error!("stream aborted: {error}");
                        *errored = true;

                        if matches!(error, GatewayError::ClientCancelled) {
                            None
                        } else {
                            Some(anthropic::StreamEvent::Error {
                                error: anthropic::StreamError {
                                    error_type: error.error_type().to_string(),
                                    message: error.to_string(),
                                },
                            })
                        }
                    }
                }
            };

            std::future::ready(Some(item))
        })
        .filter_map(std::future::ready)
        .map(|event| {
            let json = sonic_rs::to_string(&event).unwrap_or_else(|e| {
                log::error!("failed to serialize stream event: {e}");
                r#"{"type":"error","error":{"type":"internal_error","message":"serialization failed"}}"#.to_string()
            });

            Ok::<_, Infallible>(Event::default().event(event.event_name()).data(json))
        });

    Sse::new(event_stream).into_response()
}

async fn models_handler(State(server): State<Arc<GatewayServer>>) -> Json<anthropic::ModelsResponse> {
    let mut data = Vec::new();

    for (provider_id, client) in server.registry().iter() {
        match client.list_models().await {
            Ok(models) => {
                data.extend(models.into_iter().map(|model| anthropic::ModelInfo {
                    display_name: model.name.clone(),
                    id: model.name,
                    model_type: "model".to_string(),
                }));
            }
            Err(e) => log::warn!("model discovery failed for '{provider_id}': {e}"),
        }
    }

    data.sort_by(|a, b| a.id.cmp(&b.id));
    data.dedup_by(|a, b| a.id == b.id);

    Json(anthropic::ModelsResponse { data, has_more: false })
}

async fn health_handler(State(server): State<Arc<GatewayServer>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": server.health_status() }))
}

async fn status_handler(State(server): State<Arc<GatewayServer>>) -> Json<server::StatusSnapshot> {
    Json(server.status_snapshot())
}

#[derive(Deserialize)]
struct ResetRequest {
    provider: String,
}

async fn reset_handler(State(server): State<Arc<GatewayServer>>, Json(body): Json<ResetRequest>) -> Response {
    if !server.config().providers.contains_key(&body.provider) {
        let error = PipelineError::new(
            GatewayError::ClientBad(format!("unknown provider '{}'", body.provider)),
            Stage::Route,
        );
        return error.into_response();
    }

    log::info!("operator reset of health state for provider '{}'", body.provider);
    server.health_tracker().reset(&body.provider);

    Json(serde_json::json!({ "status": "reset", "provider": body.provider })).into_response()
}

async fn shutdown_handler(State(server): State<Arc<GatewayServer>>) -> Json<serde_json::Value> {
    server.begin_shutdown();
    Json(serde_json::json!({ "status": "shutting_down" }))
}

fn with_correlation(mut response: Response, correlation_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(correlation_id) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
