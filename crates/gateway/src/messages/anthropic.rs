use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body for the Anthropic-style Messages surface the gateway
/// exposes on `POST /v1/messages`.
///
/// The format differs from OpenAI's in several ways that matter for
/// translation: content is an array of typed blocks, the system prompt is
/// separate from the messages array, and tool interactions use
/// tool_use/tool_result blocks instead of function call messages.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    /// The client-facing model name. Routing decides what actually runs.
    pub model: String,

    /// Conversation messages, order-significant.
    pub messages: Vec<Message>,

    /// Maximum number of tokens to generate. Defaulted during translation
    /// when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// System prompt: either a plain string or a list of text blocks.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequences: Option<Vec<String>>,

    /// When true, the response is an SSE stream of [`StreamEvent`]s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
}

/// System prompt in either accepted form.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    /// Plain string.
    Text(String),
    /// List of text blocks; their text fields are joined with single spaces.
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Flatten to a single string.
    pub fn flatten(&self) -> String {
        match self {
            SystemPrompt::Text(text) => text.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|block| block.text.as_str())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

/// A text block inside a block-form system prompt.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: MessageContent,
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Accepted inbound; folded into the system prompt during translation.
    System,
}

/// Message content: a plain string or an ordered list of typed blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

/// Content block in a message.
///
/// Unknown block types are captured as raw values rather than rejected so
/// that content never silently disappears; translation degrades them to
/// text with an `[Object: …]` marker.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ContentBlock {
    Known(KnownBlock),
    Unknown(Value),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum KnownBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },

    #[serde(rename = "tool_result")]
    ToolResult {
        /// Must reference the id of a prior tool_use in the conversation.
        tool_use_id: String,
        #[serde(default)]
        content: Option<ToolResultContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

/// Content of a tool_result block: a string or a list of text blocks.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ToolResultContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl ToolResultContent {
    /// Flatten to a plain string for protocols that take tool output as text.
    pub fn flatten(&self) -> String {
        match self {
            ToolResultContent::Text(text) => text.clone(),
            ToolResultContent::Blocks(blocks) => blocks
                .iter()
                .map(|block| match block {
                    ContentBlock::Known(KnownBlock::Text { text }) => text.clone(),
                    other => crate::translate::unknown_block_marker(other),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Tool definition.
///
/// A tool with no name cannot be called and is dropped during translation.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Tool {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

/// Tool choice configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

/// Response body in the Anthropic Messages shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    pub r#type: String,
    pub role: ResponseRole,
    pub content: Vec<ResponseBlock>,
    /// Echoes the client-facing model name, not the routed upstream model.
    pub model: String,
    /// Never absent on a successful response.
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: Usage,
}

/// Role in a response; always assistant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseRole {
    Assistant,
}

/// Content block in a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseBlock {
    #[serde(rename = "text")]
    Text { text: String },

    #[serde(rename = "tool_use")]
    ToolUse { id: String, name: String, input: Value },
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::EndTurn => write!(f, "end_turn"),
            StopReason::MaxTokens => write!(f, "max_tokens"),
            StopReason::StopSequence => write!(f, "stop_sequence"),
            StopReason::ToolUse => write!(f, "tool_use"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Streaming event types for the Anthropic SSE surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: StreamMessageStart },

    #[serde(rename = "content_block_start")]
    ContentBlockStart { index: u32, content_block: ResponseBlock },

    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { index: u32, delta: ContentDelta },

    #[serde(rename = "content_block_stop")]
    ContentBlockStop { index: u32 },

    #[serde(rename = "message_delta")]
    MessageDelta { delta: MessageDelta, usage: Usage },

    #[serde(rename = "message_stop")]
    MessageStop,

    #[serde(rename = "ping")]
    Ping,

    #[serde(rename = "error")]
    Error { error: StreamError },
}

impl StreamEvent {
    /// SSE event name, matching the `type` field.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
        }
    }
}

/// Initial message metadata for streaming.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMessageStart {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: ResponseRole,
    pub content: Vec<ResponseBlock>,
    pub model: String,
    pub usage: Usage,
}

/// Delta update for content blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentDelta {
    #[serde(rename = "text_delta")]
    TextDelta { text: String },

    #[serde(rename = "input_json_delta")]
    InputJsonDelta { partial_json: String },
}

/// Message-level delta carrying the final stop reason.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_sequence: Option<String>,
}

/// Error payload inside an `error` stream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamError {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}

/// Model listing entry, Anthropic shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: String,
    pub display_name: String,
}

/// Model listing response, Anthropic shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub data: Vec<ModelInfo>,
    pub has_more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deserialize_string_and_block_content() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "claude-3-5-sonnet",
            "max_tokens": 100,
            "messages": [
                { "role": "user", "content": "Hello" },
                { "role": "assistant", "content": [{ "type": "text", "text": "Hi" }] }
            ]
        }))
        .unwrap();

        assert!(matches!(request.messages[0].content, MessageContent::Text(_)));
        let MessageContent::Blocks(blocks) = &request.messages[1].content else {
            unreachable!("expected block content");
        };
        assert!(matches!(blocks[0], ContentBlock::Known(KnownBlock::Text { .. })));
    }

    #[test]
    fn system_prompt_accepts_both_forms() {
        let text: SystemPrompt = serde_json::from_value(json!("be brief")).unwrap();
        assert_eq!(text.flatten(), "be brief");

        let blocks: SystemPrompt = serde_json::from_value(json!([
            { "type": "text", "text": "be" },
            { "type": "text", "text": "brief" }
        ]))
        .unwrap();
        assert_eq!(blocks.flatten(), "be brief");
    }

    #[test]
    fn unknown_block_is_captured_not_rejected() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [
                { "role": "user", "content": [{ "type": "system-reminder", "payload": { "k": 1 } }] }
            ]
        }))
        .unwrap();

        let MessageContent::Blocks(blocks) = &request.messages[0].content else {
            unreachable!("expected block content");
        };
        assert!(matches!(blocks[0], ContentBlock::Unknown(_)));
    }

    #[test]
    fn tool_result_references_tool_use() {
        let request: ChatRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [
                { "role": "user", "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_1", "content": "42" }
                ]}
            ]
        }))
        .unwrap();

        let MessageContent::Blocks(blocks) = &request.messages[0].content else {
            unreachable!("expected block content");
        };
        let ContentBlock::Known(KnownBlock::ToolResult { tool_use_id, content, .. }) = &blocks[0] else {
            unreachable!("expected tool_result");
        };
        assert_eq!(tool_use_id, "toolu_1");
        assert_eq!(content.as_ref().unwrap().flatten(), "42");
    }

    #[test]
    fn stream_events_serialize_with_matching_type_tags() {
        let event = StreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentDelta::TextDelta { text: "He".to_string() },
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "content_block_delta");
        assert_eq!(json["delta"]["type"], "text_delta");
        assert_eq!(event.event_name(), "content_block_delta");
    }

    #[test]
    fn response_round_trips() {
        let response = ChatResponse {
            id: "msg_1".to_string(),
            r#type: "message".to_string(),
            role: ResponseRole::Assistant,
            content: vec![ResponseBlock::Text { text: "Hi".to_string() }],
            model: "claude-3-5-sonnet".to_string(),
            stop_reason: Some(StopReason::EndTurn),
            stop_sequence: None,
            usage: Usage {
                input_tokens: 1,
                output_tokens: 1,
            },
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["stop_reason"], "end_turn");
        assert_eq!(json["content"][0]["type"], "text");

        let back: ChatResponse = serde_json::from_value(json).unwrap();
        assert_eq!(back.stop_reason, Some(StopReason::EndTurn));
    }
}
