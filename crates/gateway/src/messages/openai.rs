use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the OpenAI chat completions API.
///
/// This is the canonical interior shape: every OpenAI-compatible upstream
/// (openai, qwen, modelscope, lmstudio) consumes it directly, and the
/// Gemini translation starts from the Anthropic form instead.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,

    pub messages: Vec<ChatMessage>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences; OpenAI calls the field `stop`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: ChatRole,

    /// Plain string content. Null when the message only carries tool calls.
    pub content: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,

    /// Links a `tool` role message back to the call it answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolCall {
    pub id: String,
    #[serde(rename = "type")]
    pub call_type: ToolCallType,
    pub function: FunctionCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolCallType {
    Function,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionCall {
    pub name: String,
    /// Arguments as a JSON-encoded string, per the OpenAI wire format.
    pub arguments: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    #[serde(rename = "type")]
    pub tool_type: ToolCallType,
    pub function: FunctionDefinition,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FunctionDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub parameters: Value,
}

/// Tool choice: a bare mode string or a specific function selector.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolChoice {
    Mode(ToolChoiceMode),
    Specific {
        #[serde(rename = "type")]
        choice_type: ToolCallType,
        function: ToolChoiceFunction,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolChoiceMode {
    None,
    Auto,
    Required,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ToolChoiceFunction {
    pub name: String,
}

/// Response body from the chat completions API.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    #[serde(default)]
    pub model: Option<String>,
    pub choices: Vec<ChatChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<FinishReason>,
}

/// Why the upstream stopped generating.
///
/// Unknown values are captured for forward compatibility rather than
/// failing the whole response.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum FinishReason {
    #[serde(rename = "stop")]
    Stop,
    #[serde(rename = "length")]
    Length,
    #[serde(rename = "tool_calls")]
    ToolCalls,
    #[serde(rename = "function_call")]
    FunctionCall,
    #[serde(rename = "content_filter")]
    ContentFilter,
    #[serde(untagged)]
    Other(String),
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// One SSE chunk of a streaming chat completion.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<StreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamChoice {
    #[serde(default)]
    pub index: u32,
    pub delta: StreamDelta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

/// Incremental message content inside a stream chunk.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamDelta {
    #[serde(default)]
    pub role: Option<ChatRole>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Option<Vec<StreamToolCall>>,
}

/// Streaming tool-call fragment.
///
/// The first fragment for an index carries the id and function name;
/// subsequent fragments carry only argument pieces. Fragments for the same
/// index are collapsed by the streaming translator.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamToolCall {
    pub index: usize,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub function: Option<StreamFunction>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StreamFunction {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Model listing entry from `GET /v1/models`.
///
/// Providers disagree on where they put the context window hint, so both
/// common field names are accepted.
#[derive(Debug, Clone, Deserialize)]
pub struct Model {
    pub id: String,
    #[serde(default)]
    pub context_length: Option<u32>,
    #[serde(default)]
    pub max_model_len: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<Model>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serialize_request_with_null_content_for_tool_calls() {
        let message = ChatMessage {
            role: ChatRole::Assistant,
            content: None,
            tool_calls: Some(vec![ToolCall {
                id: "call_1".to_string(),
                call_type: ToolCallType::Function,
                function: FunctionCall {
                    name: "get_weather".to_string(),
                    arguments: r#"{"city":"Tokyo"}"#.to_string(),
                },
            }]),
            tool_call_id: None,
        };

        let json = serde_json::to_value(&message).unwrap();
        assert_eq!(json["content"], Value::Null);
        assert_eq!(json["tool_calls"][0]["function"]["name"], "get_weather");
    }

    #[test]
    fn deserialize_response_with_unknown_finish_reason() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": "hi" },
                "finish_reason": "weird_new_reason"
            }]
        }))
        .unwrap();

        assert_eq!(
            response.choices[0].finish_reason,
            Some(FinishReason::Other("weird_new_reason".to_string()))
        );
    }

    #[test]
    fn deserialize_stream_tool_call_fragments() {
        let first: StreamChunk = serde_json::from_value(json!({
            "choices": [{
                "index": 0,
                "delta": { "tool_calls": [{ "index": 0, "id": "call_1", "function": { "name": "f", "arguments": "" } }] }
            }]
        }))
        .unwrap();

        let rest: StreamChunk = serde_json::from_value(json!({
            "choices": [{
                "index": 0,
                "delta": { "tool_calls": [{ "index": 0, "function": { "arguments": "{\"a\":1}" } }] }
            }]
        }))
        .unwrap();

        let call = &first.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert_eq!(call.id.as_deref(), Some("call_1"));

        let call = &rest.choices[0].delta.tool_calls.as_ref().unwrap()[0];
        assert!(call.id.is_none());
        assert_eq!(
            call.function.as_ref().unwrap().arguments.as_deref(),
            Some("{\"a\":1}")
        );
    }

    #[test]
    fn tool_choice_forms() {
        let auto: ToolChoice = serde_json::from_value(json!("auto")).unwrap();
        assert!(matches!(auto, ToolChoice::Mode(ToolChoiceMode::Auto)));

        let specific: ToolChoice =
            serde_json::from_value(json!({ "type": "function", "function": { "name": "f" } })).unwrap();
        assert!(matches!(specific, ToolChoice::Specific { .. }));
    }

    #[test]
    fn model_listing_accepts_either_context_hint() {
        let models: ModelsResponse = serde_json::from_value(json!({
            "data": [
                { "id": "a", "context_length": 131072 },
                { "id": "b", "max_model_len": 32768 },
                { "id": "c" }
            ]
        }))
        .unwrap();

        assert_eq!(models.data[0].context_length, Some(131072));
        assert_eq!(models.data[1].max_model_len, Some(32768));
        assert!(models.data[2].context_length.is_none());
    }
}
