use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outer envelope for Gemini generate requests.
///
/// Gemini upstreams take the generation payload wrapped together with the
/// project and model identifiers rather than in the URL path alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub model: String,
    pub request: GenerateContentRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    /// Conversation turns. Gemini has no system role; system content is
    /// merged into the first user turn.
    pub contents: Vec<Content>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDeclarations>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: GeminiRole,
    pub parts: Vec<Part>,
}

/// Gemini conversation roles; `model` is what Anthropic calls `assistant`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GeminiRole {
    User,
    Model,
}

/// A part of a content turn. Exactly one of the fields is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_call: Option<GeminiFunctionCall>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub function_response: Option<GeminiFunctionResponse>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn function_call(name: impl Into<String>, args: Value) -> Self {
        Self {
            function_call: Some(GeminiFunctionCall {
                name: name.into(),
                args,
            }),
            ..Default::default()
        }
    }

    pub fn function_response(name: impl Into<String>, response: Value) -> Self {
        Self {
            function_response: Some(GeminiFunctionResponse {
                name: name.into(),
                response,
            }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionCall {
    pub name: String,
    pub args: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiFunctionResponse {
    pub name: String,
    pub response: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDeclarations {
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,
}

/// Buffered or streamed generate response.
///
/// Streaming chunks use the same shape with partial candidate content.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub model_version: Option<String>,
}

/// Some Gemini deployments wrap the generate response in a `response` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ReplyEnvelope {
    Wrapped { response: GenerateContentResponse },
    Plain(GenerateContentResponse),
}

impl ReplyEnvelope {
    pub fn into_inner(self) -> GenerateContentResponse {
        match self {
            ReplyEnvelope::Wrapped { response } => response,
            ReplyEnvelope::Plain(response) => response,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<GeminiFinishReason>,
    #[serde(default)]
    pub index: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum GeminiFinishReason {
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "MAX_TOKENS")]
    MaxTokens,
    #[serde(rename = "SAFETY")]
    Safety,
    #[serde(rename = "RECITATION")]
    Recitation,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u32,
    #[serde(default)]
    pub candidates_token_count: u32,
    #[serde(default)]
    pub total_token_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_serializes_camel_case() {
        let request = GenerateRequest {
            project: Some("p-1".to_string()),
            model: "gemini-2.5-flash".to_string(),
            request: GenerateContentRequest {
                contents: vec![Content {
                    role: GeminiRole::User,
                    parts: vec![Part::text("hi")],
                }],
                tools: None,
                generation_config: Some(GenerationConfig {
                    max_output_tokens: Some(100),
                    temperature: None,
                    top_p: None,
                    top_k: None,
                    stop_sequences: None,
                }),
            },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["request"]["generationConfig"]["maxOutputTokens"], 100);
        assert_eq!(json["request"]["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn response_parses_wrapped_or_plain() {
        let plain = json!({
            "candidates": [{ "content": { "role": "model", "parts": [{ "text": "hi" }] }, "finishReason": "STOP" }]
        });
        let wrapped = json!({ "response": plain.clone() });

        let from_plain: ReplyEnvelope = serde_json::from_value(plain).unwrap();
        let from_wrapped: ReplyEnvelope = serde_json::from_value(wrapped).unwrap();

        assert_eq!(
            from_plain.into_inner().candidates[0].finish_reason,
            Some(GeminiFinishReason::Stop)
        );
        assert_eq!(
            from_wrapped.into_inner().candidates[0].finish_reason,
            Some(GeminiFinishReason::Stop)
        );
    }

    #[test]
    fn unknown_finish_reason_is_captured() {
        let candidate: Candidate = serde_json::from_value(json!({ "finishReason": "BLOCKLIST" })).unwrap();
        assert_eq!(
            candidate.finish_reason,
            Some(GeminiFinishReason::Other("BLOCKLIST".to_string()))
        );
    }
}
