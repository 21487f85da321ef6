//! Anthropic ⇄ Gemini translation.

use config::SafetyStopBehavior;
use serde_json::Value;
use std::collections::HashMap;

use crate::{
    error::{GatewayError, GatewayResult},
    messages::{anthropic, gemini},
    translate::{DEFAULT_MAX_TOKENS, unknown_block_marker},
};

/// Translate an Anthropic request into the Gemini wrapper envelope.
///
/// Gemini has no system role: the system prompt is merged into the first
/// user turn. Anthropic's `assistant` role maps to Gemini's `model`.
pub fn request_from_anthropic(
    request: anthropic::ChatRequest,
    project: Option<String>,
    max_tokens_ceiling: Option<u32>,
) -> GatewayResult<gemini::GenerateRequest> {
    if request.model.is_empty() {
        return Err(GatewayError::InvalidRequestShape { path: "model".into() });
    }

    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequestShape {
            path: "messages".into(),
        });
    }

    let mut max_tokens = request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS);
    if let Some(ceiling) = max_tokens_ceiling {
        max_tokens = max_tokens.min(ceiling);
    }

    // Maps tool_use ids to function names so tool_result blocks can be
    // rendered as functionResponse parts, which Gemini keys by name.
    let mut call_names: HashMap<String, String> = HashMap::new();

    let mut system_text = request.system.as_ref().map(|s| s.flatten()).unwrap_or_default();
    let mut contents: Vec<gemini::Content> = Vec::new();

    for message in request.messages {
        let role = match message.role {
            anthropic::Role::User => gemini::GeminiRole::User,
            anthropic::Role::Assistant => gemini::GeminiRole::Model,
            anthropic::Role::System => {
                // System turns inside the conversation merge into the
                // system prompt like the dedicated field does.
                let text = match message.content {
                    anthropic::MessageContent::Text(text) => text,
                    anthropic::MessageContent::Blocks(blocks) => blocks
                        .iter()
                        .map(block_as_text)
                        .collect::<Vec<_>>()
                        .join(" "),
                };
                if !system_text.is_empty() {
                    system_text.push(' ');
                }
                system_text.push_str(&text);
                continue;
            }
        };

        let parts = match message.content {
            anthropic::MessageContent::Text(text) => vec![gemini::Part::text(text)],
            anthropic::MessageContent::Blocks(blocks) => {
                let mut parts = Vec::with_capacity(blocks.len());

                for block in blocks {
                    match block {
                        anthropic::ContentBlock::Known(anthropic::KnownBlock::Text { text }) => {
                            parts.push(gemini::Part::text(text));
                        }
                        anthropic::ContentBlock::Known(anthropic::KnownBlock::ToolUse { id, name, input }) => {
                            call_names.insert(id, name.clone());
                            parts.push(gemini::Part::function_call(name, input));
                        }
                        anthropic::ContentBlock::Known(anthropic::KnownBlock::ToolResult {
                            tool_use_id,
                            content,
                            is_error: _,
                        }) => {
                            let name = call_names.get(&tool_use_id).cloned().unwrap_or_default();
                            let output = content.map(|c| c.flatten()).unwrap_or_default();
                            parts.push(gemini::Part::function_response(
                                name,
                                serde_json::json!({ "result": output }),
                            ));
                        }
                        unknown @ anthropic::ContentBlock::Unknown(_) => {
                            parts.push(gemini::Part::text(unknown_block_marker(&unknown)));
                        }
                    }
                }

                parts
            }
        };

        contents.push(gemini::Content { role, parts });
    }

    // Inline the system prompt as (or into) the first user turn.
    if !system_text.is_empty() {
        match contents.first_mut() {
            Some(first) if first.role == gemini::GeminiRole::User => {
                first.parts.insert(0, gemini::Part::text(system_text));
            }
            _ => {
                contents.insert(
                    0,
                    gemini::Content {
                        role: gemini::GeminiRole::User,
                        parts: vec![gemini::Part::text(system_text)],
                    },
                );
            }
        }
    }

    let tools = request.tools.map(|tools| {
        let declarations = tools
            .into_iter()
            .filter_map(|tool| {
                let name = tool.name?;
                Some(gemini::FunctionDeclaration {
                    name,
                    description: tool.description,
                    parameters: tool.input_schema.map(strip_unsupported_schema_fields),
                })
            })
            .collect();

        vec![gemini::ToolDeclarations {
            function_declarations: declarations,
        }]
    });

    Ok(gemini::GenerateRequest {
        project,
        model: request.model,
        request: gemini::GenerateContentRequest {
            contents,
            tools,
            generation_config: Some(gemini::GenerationConfig {
                max_output_tokens: Some(max_tokens),
                temperature: request.temperature,
                top_p: request.top_p,
                top_k: request.top_k,
                stop_sequences: request.stop_sequences,
            }),
        },
    })
}

fn block_as_text(block: &anthropic::ContentBlock) -> String {
    match block {
        anthropic::ContentBlock::Known(anthropic::KnownBlock::Text { text }) => text.clone(),
        other => unknown_block_marker(other),
    }
}

/// Remove JSON Schema fields Gemini's function declarations reject.
fn strip_unsupported_schema_fields(mut value: Value) -> Value {
    if let Some(obj) = value.as_object_mut() {
        obj.remove("additionalProperties");
        obj.remove("$schema");
        obj.remove("default");

        if let Some(properties) = obj.get_mut("properties")
            && let Some(props) = properties.as_object_mut()
        {
            for (_, prop) in props.iter_mut() {
                *prop = strip_unsupported_schema_fields(prop.take());
            }
        }

        if let Some(items) = obj.get_mut("items") {
            *items = strip_unsupported_schema_fields(items.take());
        }
    }

    value
}

/// Translate a Gemini response back to the Anthropic shape.
pub fn response_to_anthropic(
    response: gemini::GenerateContentResponse,
    client_model: &str,
    provider: &str,
    safety: SafetyStopBehavior,
) -> GatewayResult<anthropic::ChatResponse> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(GatewayError::ResponseMalformed {
            provider: provider.to_string(),
            message: "response contained no candidates".to_string(),
        });
    };

    let mut content = Vec::new();
    let mut has_tool_use = false;

    for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
        if let Some(text) = part.text
            && !text.is_empty()
        {
            content.push(anthropic::ResponseBlock::Text { text });
        } else if let Some(call) = part.function_call {
            has_tool_use = true;
            content.push(anthropic::ResponseBlock::ToolUse {
                id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                name: call.name,
                input: call.args,
            });
        }
    }

    let stop_reason = if has_tool_use {
        anthropic::StopReason::ToolUse
    } else {
        map_finish_reason(candidate.finish_reason.as_ref(), safety)
    };

    let usage = response.usage_metadata.unwrap_or_default();

    Ok(anthropic::ChatResponse {
        id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
        r#type: "message".to_string(),
        role: anthropic::ResponseRole::Assistant,
        content,
        model: client_model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: anthropic::Usage {
            input_tokens: usage.prompt_token_count,
            output_tokens: usage.candidates_token_count,
        },
    })
}

/// Map a Gemini finish reason to an Anthropic stop reason.
pub(crate) fn map_finish_reason(
    reason: Option<&gemini::GeminiFinishReason>,
    safety: SafetyStopBehavior,
) -> anthropic::StopReason {
    match reason {
        Some(gemini::GeminiFinishReason::Stop) => anthropic::StopReason::EndTurn,
        Some(gemini::GeminiFinishReason::MaxTokens) => anthropic::StopReason::MaxTokens,
        Some(gemini::GeminiFinishReason::Safety) | Some(gemini::GeminiFinishReason::Recitation) => match safety {
            SafetyStopBehavior::StopSequence => anthropic::StopReason::StopSequence,
            SafetyStopBehavior::EndTurn => anthropic::StopReason::EndTurn,
        },
        Some(gemini::GeminiFinishReason::Other(other)) => {
            log::warn!("unknown finishReason from Gemini: {other}");
            anthropic::StopReason::EndTurn
        }
        None => anthropic::StopReason::EndTurn,
    }
}
