//! Format translation between the client-facing Anthropic shape and the
//! provider wire shapes.
//!
//! The OpenAI form is the canonical hub: all OpenAI-compatible providers
//! consume [`crate::messages::openai::ChatCompletionRequest`] directly, and
//! the Gemini translation is a sibling of the OpenAI one rather than a
//! second hop.
//!
//! Translation is total on well-formed input. The single escape hatch is
//! [`unknown_block_marker`]: content blocks the gateway does not recognize
//! are serialized back to text with an `[Object: …]` marker instead of
//! being dropped, so content never silently disappears.

pub mod gemini;
pub mod openai;
pub mod streaming;

use crate::messages::anthropic::ContentBlock;

/// Hard default for `max_tokens` when the client omits it.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Degrade an unrecognized content block to text.
pub(crate) fn unknown_block_marker(block: &ContentBlock) -> String {
    match block {
        ContentBlock::Unknown(value) => {
            let kind = value
                .get("type")
                .and_then(|t| t.as_str())
                .map(ToString::to_string)
                .unwrap_or_else(|| serde_json::to_string(value).unwrap_or_else(|_| "unknown".to_string()));

            format!("[Object: {kind}]")
        }
        ContentBlock::Known(_) => String::new(),
    }
}

/// Parse a tool-call argument string into a JSON value.
///
/// Empty strings become an empty object; non-empty invalid JSON is kept as
/// a string so the payload survives for debugging.
pub(crate) fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }

    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => serde_json::Value::String(raw.to_string()),
    }
}
