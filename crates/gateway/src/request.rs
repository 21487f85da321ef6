use std::time::Instant;

use axum::http::HeaderMap;

pub const CORRELATION_HEADER: &str = "x-request-id";

/// Per-request context extracted by the front door.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlation id, taken from the `x-request-id` header or generated.
    pub correlation_id: String,
    /// When the front door accepted the request.
    pub received_at: Instant,
}

impl RequestContext {
    pub fn new(correlation_id: String) -> Self {
        Self {
            correlation_id,
            received_at: Instant::now(),
        }
    }
}

/// Extract the request context from incoming headers.
pub fn extract_context(headers: &HeaderMap) -> RequestContext {
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    RequestContext::new(correlation_id)
}
