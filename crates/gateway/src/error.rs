use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Pipeline stage a request was in when an error surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classify,
    Route,
    TransformRequest,
    Dispatch,
    TransformResponse,
    Emit,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Classify => "classify",
            Stage::Route => "route",
            Stage::TransformRequest => "transform_request",
            Stage::Dispatch => "dispatch",
            Stage::TransformResponse => "transform_response",
            Stage::Emit => "emit",
        };
        f.write_str(name)
    }
}

/// Gateway errors with appropriate HTTP status codes.
///
/// Messages are safe to expose: upstream bodies and credentials never land
/// in the message text, only classified summaries of what went wrong.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Malformed or too-large incoming request.
    #[error("Invalid request: {0}")]
    ClientBad(String),

    /// Request failed translation into a provider shape.
    #[error("Request cannot be translated: {path}")]
    InvalidRequestShape {
        /// Path of the offending field, e.g. `messages[2].content[0].type`.
        path: String,
    },

    /// The router could not pick any healthy candidate.
    #[error("No healthy provider available for category '{category}'")]
    NoHealthyProvider { category: String },

    /// The selected provider's circuit is open. Internal only; triggers
    /// failover and is never surfaced directly.
    #[error("Circuit open for provider '{provider}'")]
    CircuitOpen { provider: String },

    /// Connect/read/write failure against the upstream.
    #[error("Transport error talking to '{provider}': {message}")]
    Transport { provider: String, message: String },

    /// Upstream returned a non-2xx status.
    #[error("Provider '{provider}' returned HTTP {status}")]
    ProviderHttp {
        provider: String,
        status: u16,
        message: String,
    },

    /// Upstream body could not be parsed or translated.
    #[error("Provider '{provider}' returned an unreadable response: {message}")]
    ResponseMalformed { provider: String, message: String },

    /// A per-stage or overall deadline expired.
    #[error("Timed out during {stage}")]
    Timeout { stage: Stage },

    /// The client closed the connection; abort silently.
    #[error("Client cancelled the request")]
    ClientCancelled,

    /// Writing the response to the client failed; abort after logging.
    #[error("Failed to write response to client: {0}")]
    ClientWriteError(String),
}

impl GatewayError {
    /// HTTP status the error surfaces with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::ClientBad(_) | Self::InvalidRequestShape { .. } => StatusCode::BAD_REQUEST,
            Self::NoHealthyProvider { .. } | Self::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transport { .. } | Self::ResponseMalformed { .. } => StatusCode::BAD_GATEWAY,
            Self::ProviderHttp { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ClientCancelled | Self::ClientWriteError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable type string used in the error body.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::ClientBad(_) => "ClientBad",
            Self::InvalidRequestShape { .. } => "InvalidRequestShape",
            Self::NoHealthyProvider { .. } => "NoHealthyProvider",
            Self::CircuitOpen { .. } => "CircuitOpen",
            Self::Transport { .. } => "TransportError",
            Self::ProviderHttp { status, .. } if *status >= 500 => "ProviderHTTP5xx",
            Self::ProviderHttp { .. } => "ProviderHTTP4xx",
            Self::ResponseMalformed { .. } => "ResponseMalformed",
            Self::Timeout { .. } => "Timeout",
            Self::ClientCancelled => "ClientCancelled",
            Self::ClientWriteError(_) => "ClientWriteError",
        }
    }

    /// Whether failing over to another candidate makes sense.
    ///
    /// Retryable: transport, provider 5xx, provider 429/408, circuit open,
    /// pre-first-byte timeout. Terminal: other client 4xx, cancellation.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::CircuitOpen { .. } | Self::Timeout { .. } => true,
            Self::ProviderHttp { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            _ => false,
        }
    }
}

/// Error surfaced by the pipeline, carrying attempt context.
#[derive(Debug)]
pub struct PipelineError {
    pub error: GatewayError,
    pub stage: Stage,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub retry_count: u32,
}

impl PipelineError {
    pub fn new(error: GatewayError, stage: Stage) -> Self {
        Self {
            error,
            stage,
            provider: None,
            model: None,
            retry_count: 0,
        }
    }

    pub fn with_target(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (stage: {})", self.error, self.stage)
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorEnvelope,
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    r#type: String,
    message: String,
    details: ErrorDetails,
}

#[derive(Debug, Serialize)]
struct ErrorDetails {
    provider: Option<String>,
    model: Option<String>,
    #[serde(rename = "originalError")]
    original_error: String,
    stage: Stage,
    #[serde(rename = "retryCount")]
    retry_count: u32,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.error.status_code();

        let body = ErrorBody {
            error: ErrorEnvelope {
                r#type: self.error.error_type().to_string(),
                message: self.error.to_string(),
                details: ErrorDetails {
                    provider: self.provider,
                    model: self.model,
                    original_error: self.error.to_string(),
                    stage: self.stage,
                    retry_count: self.retry_count,
                },
            },
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(
            GatewayError::Transport {
                provider: "a".into(),
                message: "reset".into()
            }
            .is_retryable()
        );
        assert!(
            GatewayError::ProviderHttp {
                provider: "a".into(),
                status: 503,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            GatewayError::ProviderHttp {
                provider: "a".into(),
                status: 429,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(
            !GatewayError::ProviderHttp {
                provider: "a".into(),
                status: 401,
                message: String::new()
            }
            .is_retryable()
        );
        assert!(!GatewayError::ClientCancelled.is_retryable());
    }

    #[test]
    fn error_type_distinguishes_4xx_and_5xx() {
        let e4 = GatewayError::ProviderHttp {
            provider: "a".into(),
            status: 404,
            message: String::new(),
        };
        let e5 = GatewayError::ProviderHttp {
            provider: "a".into(),
            status: 500,
            message: String::new(),
        };

        assert_eq!(e4.error_type(), "ProviderHTTP4xx");
        assert_eq!(e5.error_type(), "ProviderHTTP5xx");
    }

    #[test]
    fn error_body_shape() {
        let error = PipelineError::new(
            GatewayError::NoHealthyProvider {
                category: "default".into(),
            },
            Stage::Route,
        )
        .with_retries(2);

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
