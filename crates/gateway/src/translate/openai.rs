//! Anthropic ⇄ OpenAI translation.

use config::SafetyStopBehavior;
use serde_json::{Value, json};

use crate::{
    error::{GatewayError, GatewayResult},
    messages::{anthropic, openai},
    translate::{DEFAULT_MAX_TOKENS, parse_arguments, unknown_block_marker},
};

/// Translate an Anthropic request into the canonical OpenAI shape.
///
/// `max_tokens_ceiling` caps the defaulted or requested token budget, and
/// comes from the routed model's declared `maxTokens`.
pub fn request_from_anthropic(
    request: anthropic::ChatRequest,
    max_tokens_ceiling: Option<u32>,
) -> GatewayResult<openai::ChatCompletionRequest> {
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

    let mut messages = Vec::with_capacity(request.messages.len() + 1);

    if let Some(system) = &request.system {
        messages.push(openai::ChatMessage {
            role: openai::ChatRole::System,
            content: Some(system.flatten()),
            tool_calls: None,
            tool_call_id: None,
        });
    }

    for (message_index, message) in request.messages.into_iter().enumerate() {
        translate_message(message, message_index, &mut messages)?;
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .filter_map(|tool| {
                let Some(name) = tool.name else {
                    log::warn!("dropping tool definition without a name");
                    return None;
                };

                Some(openai::Tool {
                    tool_type: openai::ToolCallType::Function,
                    function: openai::FunctionDefinition {
                        name,
                        description: tool.description,
                        parameters: tool.input_schema.unwrap_or_else(default_tool_schema),
                    },
                })
            })
            .collect::<Vec<_>>()
    });

    let tool_choice = request.tool_choice.map(|choice| match choice {
        anthropic::ToolChoice::Auto => openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto),
        anthropic::ToolChoice::Any => openai::ToolChoice::Mode(openai::ToolChoiceMode::Required),
        anthropic::ToolChoice::Tool { name } => openai::ToolChoice::Specific {
            choice_type: openai::ToolCallType::Function,
            function: openai::ToolChoiceFunction { name },
        },
    });

    Ok(openai::ChatCompletionRequest {
        model: request.model,
        messages,
        max_tokens: Some(max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop: request.stop_sequences,
        stream: request.stream,
        tools,
        tool_choice,
    })
}

/// Translate one Anthropic message, appending the resulting OpenAI
/// messages in conversation order.
///
/// Tool results become separate `tool` role messages ahead of any text the
/// same Anthropic message carries, so they directly follow the assistant
/// turn whose calls they answer.
fn translate_message(
    message: anthropic::Message,
    message_index: usize,
    out: &mut Vec<openai::ChatMessage>,
) -> GatewayResult<()> {
    let role = match message.role {
        anthropic::Role::User => openai::ChatRole::User,
        anthropic::Role::Assistant => openai::ChatRole::Assistant,
        anthropic::Role::System => openai::ChatRole::System,
    };

    match message.content {
        anthropic::MessageContent::Text(text) => {
            out.push(openai::ChatMessage {
                role,
                content: Some(text),
                tool_calls: None,
                tool_call_id: None,
            });
        }
        anthropic::MessageContent::Blocks(blocks) => {
            let mut text = String::new();
            let mut tool_calls = Vec::new();

            for (block_index, block) in blocks.into_iter().enumerate() {
                match block {
                    anthropic::ContentBlock::Known(anthropic::KnownBlock::Text { text: fragment }) => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&fragment);
                    }
                    anthropic::ContentBlock::Known(anthropic::KnownBlock::ToolUse { id, name, input }) => {
                        let arguments = serde_json::to_string(&input).map_err(|_| {
                            GatewayError::InvalidRequestShape {
                                path: format!("messages[{message_index}].content[{block_index}].input"),
                            }
                        })?;

                        tool_calls.push(openai::ToolCall {
                            id,
                            call_type: openai::ToolCallType::Function,
                            function: openai::FunctionCall { name, arguments },
                        });
                    }
                    anthropic::ContentBlock::Known(anthropic::KnownBlock::ToolResult {
                        tool_use_id,
                        content,
                        is_error: _,
                    }) => {
                        out.push(openai::ChatMessage {
                            role: openai::ChatRole::Tool,
                            content: Some(content.map(|c| c.flatten()).unwrap_or_default()),
                            tool_calls: None,
                            tool_call_id: Some(tool_use_id),
                        });
                    }
                    unknown @ anthropic::ContentBlock::Unknown(_) => {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(&unknown_block_marker(&unknown));
                    }
                }
            }

            // A message holding only tool_use blocks keeps null content.
            if !text.is_empty() || !tool_calls.is_empty() {
                out.push(openai::ChatMessage {
                    role,
                    content: if text.is_empty() { None } else { Some(text) },
                    tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
                    tool_call_id: None,
                });
            }
        }
    }

    Ok(())
}

fn default_tool_schema() -> Value {
    json!({ "type": "object", "properties": {}, "required": [] })
}

/// Translate an OpenAI response back to the Anthropic shape.
///
/// `client_model` echoes the model name the client asked for, which is not
/// necessarily the routed upstream model.
pub fn response_to_anthropic(
    response: openai::ChatCompletionResponse,
    client_model: &str,
    provider: &str,
    safety: SafetyStopBehavior,
) -> GatewayResult<anthropic::ChatResponse> {
    let Some(choice) = response.choices.into_iter().next() else {
        return Err(GatewayError::ResponseMalformed {
            provider: provider.to_string(),
            message: "response contained no choices".to_string(),
        });
    };

    let mut content = Vec::new();

    if let Some(text) = choice.message.content
        && !text.is_empty()
    {
        content.push(anthropic::ResponseBlock::Text { text });
    }

    let mut has_tool_use = false;
    for call in choice.message.tool_calls.into_iter().flatten() {
        has_tool_use = true;
        content.push(anthropic::ResponseBlock::ToolUse {
            id: call.id,
            name: call.function.name,
            input: parse_arguments(&call.function.arguments),
        });
    }

    let stop_reason = if has_tool_use {
        anthropic::StopReason::ToolUse
    } else {
        map_finish_reason(choice.finish_reason.as_ref(), safety)
    };

    let usage = response.usage.unwrap_or_default();

    let id = if response.id.is_empty() {
        format!("msg_{}", uuid::Uuid::new_v4().simple())
    } else {
        response.id
    };

    Ok(anthropic::ChatResponse {
        id,
        r#type: "message".to_string(),
        role: anthropic::ResponseRole::Assistant,
        content,
        model: client_model.to_string(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage: anthropic::Usage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
        },
    })
}

/// Map an OpenAI finish reason to an Anthropic stop reason.
///
/// Unknown reasons map to `end_turn`; a successful response never reports
/// an empty stop reason.
pub(crate) fn map_finish_reason(
    reason: Option<&openai::FinishReason>,
    safety: SafetyStopBehavior,
) -> anthropic::StopReason {
    match reason {
        Some(openai::FinishReason::Stop) => anthropic::StopReason::EndTurn,
        Some(openai::FinishReason::Length) => anthropic::StopReason::MaxTokens,
        Some(openai::FinishReason::ToolCalls) | Some(openai::FinishReason::FunctionCall) => {
            anthropic::StopReason::ToolUse
        }
        Some(openai::FinishReason::ContentFilter) => match safety {
            SafetyStopBehavior::StopSequence => anthropic::StopReason::StopSequence,
            SafetyStopBehavior::EndTurn => anthropic::StopReason::EndTurn,
        },
        Some(openai::FinishReason::Other(other)) => {
            log::warn!("unknown finish_reason from upstream: {other}");
            anthropic::StopReason::EndTurn
        }
        None => anthropic::StopReason::EndTurn,
    }
}

/// Translate an OpenAI-shape request back to the Anthropic shape.
///
/// Used for inbound acceptance and round-trip checks: system messages fold
/// into the system prompt, `tool` messages become user tool_result blocks,
/// assistant tool_calls become tool_use blocks.
pub fn request_to_anthropic(request: openai::ChatCompletionRequest) -> anthropic::ChatRequest {
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages = Vec::new();

    for message in request.messages {
        match message.role {
            openai::ChatRole::System => {
                if let Some(content) = message.content {
                    system_parts.push(content);
                }
            }
            openai::ChatRole::Tool => {
                messages.push(anthropic::Message {
                    role: anthropic::Role::User,
                    content: anthropic::MessageContent::Blocks(vec![anthropic::ContentBlock::Known(
                        anthropic::KnownBlock::ToolResult {
                            tool_use_id: message.tool_call_id.unwrap_or_default(),
                            content: Some(anthropic::ToolResultContent::Text(
                                message.content.unwrap_or_default(),
                            )),
                            is_error: None,
                        },
                    )]),
                });
            }
            openai::ChatRole::User | openai::ChatRole::Assistant => {
                let role = if message.role == openai::ChatRole::User {
                    anthropic::Role::User
                } else {
                    anthropic::Role::Assistant
                };

                match message.tool_calls {
                    Some(calls) => {
                        let mut blocks = Vec::new();

                        if let Some(text) = message.content
                            && !text.is_empty()
                        {
                            blocks.push(anthropic::ContentBlock::Known(anthropic::KnownBlock::Text { text }));
                        }

                        for call in calls {
                            blocks.push(anthropic::ContentBlock::Known(anthropic::KnownBlock::ToolUse {
                                id: call.id,
                                name: call.function.name,
                                input: parse_arguments(&call.function.arguments),
                            }));
                        }

                        messages.push(anthropic::Message {
                            role,
                            content: anthropic::MessageContent::Blocks(blocks),
                        });
                    }
                    None => {
                        messages.push(anthropic::Message {
                            role,
                            content: anthropic::MessageContent::Text(message.content.unwrap_or_default()),
                        });
                    }
                }
            }
        }
    }

    let tools = request.tools.map(|tools| {
        tools
            .into_iter()
            .map(|tool| anthropic::Tool {
                name: Some(tool.function.name),
                description: tool.function.description,
                input_schema: Some(tool.function.parameters),
            })
            .collect()
    });

    let tool_choice = request.tool_choice.and_then(|choice| match choice {
        openai::ToolChoice::Mode(openai::ToolChoiceMode::Auto) => Some(anthropic::ToolChoice::Auto),
        openai::ToolChoice::Mode(openai::ToolChoiceMode::Required) => Some(anthropic::ToolChoice::Any),
        openai::ToolChoice::Mode(openai::ToolChoiceMode::None) => None,
        openai::ToolChoice::Specific { function, .. } => Some(anthropic::ToolChoice::Tool { name: function.name }),
    });

    anthropic::ChatRequest {
        model: request.model,
        messages,
        max_tokens: request.max_tokens,
        system: if system_parts.is_empty() {
            None
        } else {
            Some(anthropic::SystemPrompt::Text(system_parts.join(" ")))
        },
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences: request.stop,
        stream: request.stream,
        tools,
        tool_choice,
    }
}
