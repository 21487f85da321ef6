//! Streaming translation: provider SSE chunks to Anthropic stream events.
//!
//! The translators are push-based state machines: the provider client
//! feeds each parsed chunk in and forwards the produced events, then calls
//! `finish` when the upstream stream terminates.

use std::collections::BTreeMap;

use config::SafetyStopBehavior;

use crate::{
    messages::{anthropic, gemini, openai},
    translate::parse_arguments,
};

/// Accumulated state for one streaming tool call.
struct ToolBlock {
    block_index: u32,
    arguments: String,
}

/// Translates OpenAI stream chunks into the Anthropic event sequence.
///
/// Blocks open lazily: the text block on the first non-empty text delta,
/// a tool_use block on the first fragment for each tool-call index.
/// All open blocks close on termination, followed by `message_delta`
/// carrying the final stop reason and `message_stop`.
pub struct OpenAiStreamTranslator {
    client_model: String,
    safety: SafetyStopBehavior,
    message_started: bool,
    next_block_index: u32,
    text_block: Option<u32>,
    tool_blocks: BTreeMap<usize, ToolBlock>,
    finish_reason: Option<openai::FinishReason>,
    usage: anthropic::Usage,
    finished: bool,
}

impl OpenAiStreamTranslator {
    pub fn new(client_model: impl Into<String>, safety: SafetyStopBehavior) -> Self {
        Self {
            client_model: client_model.into(),
            safety,
            message_started: false,
            next_block_index: 0,
            text_block: None,
            tool_blocks: BTreeMap::new(),
            finish_reason: None,
            usage: anthropic::Usage::default(),
            finished: false,
        }
    }

    /// Feed one parsed chunk; returns the events to forward downstream.
    pub fn on_chunk(&mut self, chunk: openai::StreamChunk) -> Vec<anthropic::StreamEvent> {
        let mut events = Vec::new();

        if !self.message_started {
            self.message_started = true;
            events.push(message_start_event(
                chunk.id.clone().filter(|id| !id.is_empty()),
                &self.client_model,
            ));
        }

        if let Some(usage) = chunk.usage {
            self.usage = anthropic::Usage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            };
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        if let Some(text) = choice.delta.content
            && !text.is_empty()
        {
            let index = match self.text_block {
                Some(index) => index,
                None => {
                    let index = self.next_block_index;
                    self.next_block_index += 1;
                    self.text_block = Some(index);

                    events.push(anthropic::StreamEvent::ContentBlockStart {
                        index,
                        content_block: anthropic::ResponseBlock::Text { text: String::new() },
                    });

                    index
                }
            };

            events.push(anthropic::StreamEvent::ContentBlockDelta {
                index,
                delta: anthropic::ContentDelta::TextDelta { text },
            });
        }

        for fragment in choice.delta.tool_calls.into_iter().flatten() {
            if !self.tool_blocks.contains_key(&fragment.index) {
                let block_index = self.next_block_index;
                self.next_block_index += 1;

                let id = fragment
                    .id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
                let name = fragment
                    .function
                    .as_ref()
                    .and_then(|f| f.name.clone())
                    .unwrap_or_default();

                events.push(anthropic::StreamEvent::ContentBlockStart {
                    index: block_index,
                    content_block: anthropic::ResponseBlock::ToolUse {
                        id,
                        name,
                        input: serde_json::Value::Object(serde_json::Map::new()),
                    },
                });

                self.tool_blocks.insert(
                    fragment.index,
                    ToolBlock {
                        block_index,
                        arguments: String::new(),
                    },
                );
            }

            if let Some(arguments) = fragment.function.and_then(|f| f.arguments)
                && !arguments.is_empty()
                && let Some(block) = self.tool_blocks.get_mut(&fragment.index)
            {
                block.arguments.push_str(&arguments);

                events.push(anthropic::StreamEvent::ContentBlockDelta {
                    index: block.block_index,
                    delta: anthropic::ContentDelta::InputJsonDelta {
                        partial_json: arguments,
                    },
                });
            }
        }

        if let Some(reason) = choice.finish_reason {
            self.finish_reason = Some(reason);
        }

        events
    }

    /// Close open blocks and emit the terminating events.
    pub fn finish(&mut self) -> Vec<anthropic::StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();

        if !self.message_started {
            // Upstream terminated without producing a single chunk; still
            // emit a complete, empty event sequence.
            self.message_started = true;
            events.push(message_start_event(None, &self.client_model));
        }

        let mut open_blocks: Vec<u32> = self.text_block.into_iter().collect();
        for block in self.tool_blocks.values() {
            open_blocks.push(block.block_index);

            // Concatenated argument fragments are parsed exactly once, here.
            if !block.arguments.is_empty() && parse_arguments(&block.arguments).is_string() {
                log::warn!("streaming tool call produced non-JSON arguments");
            }
        }
        open_blocks.sort_unstable();

        for index in open_blocks {
            events.push(anthropic::StreamEvent::ContentBlockStop { index });
        }

        let stop_reason = if self.tool_blocks.is_empty() {
            super::openai::map_finish_reason(self.finish_reason.as_ref(), self.safety)
        } else {
            anthropic::StopReason::ToolUse
        };

        events.push(anthropic::StreamEvent::MessageDelta {
            delta: anthropic::MessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self.usage,
        });
        events.push(anthropic::StreamEvent::MessageStop);

        events
    }
}

/// Translates Gemini stream chunks into the Anthropic event sequence.
///
/// Gemini delivers function calls whole in a single chunk, so tool_use
/// blocks open with their full input and close immediately.
pub struct GeminiStreamTranslator {
    client_model: String,
    safety: SafetyStopBehavior,
    message_started: bool,
    next_block_index: u32,
    text_block: Option<u32>,
    has_tool_use: bool,
    finish_reason: Option<gemini::GeminiFinishReason>,
    usage: anthropic::Usage,
    finished: bool,
}

impl GeminiStreamTranslator {
    pub fn new(client_model: impl Into<String>, safety: SafetyStopBehavior) -> Self {
        Self {
            client_model: client_model.into(),
            safety,
            message_started: false,
            next_block_index: 0,
            text_block: None,
            has_tool_use: false,
            finish_reason: None,
            usage: anthropic::Usage::default(),
            finished: false,
        }
    }

    /// Feed one parsed chunk; returns the events to forward downstream.
    pub fn on_chunk(&mut self, chunk: gemini::GenerateContentResponse) -> Vec<anthropic::StreamEvent> {
        let mut events = Vec::new();

        if !self.message_started {
            self.message_started = true;
            events.push(message_start_event(None, &self.client_model));
        }

        if let Some(usage) = chunk.usage_metadata {
            self.usage = anthropic::Usage {
                input_tokens: usage.prompt_token_count,
                output_tokens: usage.candidates_token_count,
            };
        }

        let Some(candidate) = chunk.candidates.into_iter().next() else {
            return events;
        };

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            if let Some(text) = part.text
                && !text.is_empty()
            {
                let index = match self.text_block {
                    Some(index) => index,
                    None => {
                        let index = self.next_block_index;
                        self.next_block_index += 1;
                        self.text_block = Some(index);

                        events.push(anthropic::StreamEvent::ContentBlockStart {
                            index,
                            content_block: anthropic::ResponseBlock::Text { text: String::new() },
                        });

                        index
                    }
                };

                events.push(anthropic::StreamEvent::ContentBlockDelta {
                    index,
                    delta: anthropic::ContentDelta::TextDelta { text },
                });
            } else if let Some(call) = part.function_call {
                self.has_tool_use = true;

                let index = self.next_block_index;
                self.next_block_index += 1;

                events.push(anthropic::StreamEvent::ContentBlockStart {
                    index,
                    content_block: anthropic::ResponseBlock::ToolUse {
                        id: format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                        name: call.name,
                        input: call.args,
                    },
                });
                events.push(anthropic::StreamEvent::ContentBlockStop { index });
            }
        }

        if let Some(reason) = candidate.finish_reason {
            self.finish_reason = Some(reason);
        }

        events
    }

    /// Close the text block and emit the terminating events.
    pub fn finish(&mut self) -> Vec<anthropic::StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();

        if !self.message_started {
            self.message_started = true;
            events.push(message_start_event(None, &self.client_model));
        }

        if let Some(index) = self.text_block {
            events.push(anthropic::StreamEvent::ContentBlockStop { index });
        }

        let stop_reason = if self.has_tool_use {
            anthropic::StopReason::ToolUse
        } else {
            super::gemini::map_finish_reason(self.finish_reason.as_ref(), self.safety)
        };

        events.push(anthropic::StreamEvent::MessageDelta {
            delta: anthropic::MessageDelta {
                stop_reason: Some(stop_reason),
                stop_sequence: None,
            },
            usage: self.usage,
        });
        events.push(anthropic::StreamEvent::MessageStop);

        events
    }
}

fn message_start_event(id: Option<String>, model: &str) -> anthropic::StreamEvent {
    anthropic::StreamEvent::MessageStart {
        message: anthropic::StreamMessageStart {
            id: id.unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            message_type: "message".to_string(),
            role: anthropic::ResponseRole::Assistant,
            content: vec![],
            model: model.to_string(),
            usage: anthropic::Usage::default(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_chunk(text: &str) -> openai::StreamChunk {
        serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "delta": { "content": text } }]
        }))
        .unwrap()
    }

    fn finish_chunk(reason: &str) -> openai::StreamChunk {
        serde_json::from_value(json!({
            "choices": [{ "index": 0, "delta": {}, "finish_reason": reason }]
        }))
        .unwrap()
    }

    fn event_names(events: &[anthropic::StreamEvent]) -> Vec<&'static str> {
        events.iter().map(anthropic::StreamEvent::event_name).collect()
    }

    #[test]
    fn streaming_text_produces_the_full_event_sequence() {
        let mut translator = OpenAiStreamTranslator::new("claude-3-5-sonnet", SafetyStopBehavior::default());

        let mut events = Vec::new();
        for text in ["He", "llo", "!"] {
            events.extend(translator.on_chunk(text_chunk(text)));
        }
        events.extend(translator.on_chunk(finish_chunk("stop")));
        events.extend(translator.finish());

        assert_eq!(
            event_names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let deltas: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                anthropic::StreamEvent::ContentBlockDelta {
                    delta: anthropic::ContentDelta::TextDelta { text },
                    ..
                } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(deltas, vec!["He", "llo", "!"]);

        let anthropic::StreamEvent::MessageDelta { delta, .. } = &events[events.len() - 2] else {
            unreachable!("expected message_delta before message_stop");
        };
        assert_eq!(delta.stop_reason, Some(anthropic::StopReason::EndTurn));
    }

    #[test]
    fn tool_call_fragments_collapse_by_index() {
        let mut translator = OpenAiStreamTranslator::new("m", SafetyStopBehavior::default());

        let start: openai::StreamChunk = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "delta": { "tool_calls": [
                { "index": 0, "id": "call_1", "function": { "name": "get_weather", "arguments": "" } }
            ]}}]
        }))
        .unwrap();

        let frag_a: openai::StreamChunk = serde_json::from_value(json!({
            "choices": [{ "index": 0, "delta": { "tool_calls": [
                { "index": 0, "function": { "arguments": "{\"city\":" } }
            ]}}]
        }))
        .unwrap();

        let frag_b: openai::StreamChunk = serde_json::from_value(json!({
            "choices": [{ "index": 0, "delta": { "tool_calls": [
                { "index": 0, "function": { "arguments": "\"Tokyo\"}" } }
            ]}}]
        }))
        .unwrap();

        let mut events = Vec::new();
        events.extend(translator.on_chunk(start));
        events.extend(translator.on_chunk(frag_a));
        events.extend(translator.on_chunk(frag_b));
        events.extend(translator.on_chunk(finish_chunk("tool_calls")));
        events.extend(translator.finish());

        assert_eq!(
            event_names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let anthropic::StreamEvent::ContentBlockStart { content_block, .. } = &events[1] else {
            unreachable!("expected content_block_start");
        };
        let anthropic::ResponseBlock::ToolUse { id, name, .. } = content_block else {
            unreachable!("expected tool_use block");
        };
        assert_eq!(id, "call_1");
        assert_eq!(name, "get_weather");

        let fragments: Vec<&str> = events
            .iter()
            .filter_map(|event| match event {
                anthropic::StreamEvent::ContentBlockDelta {
                    delta: anthropic::ContentDelta::InputJsonDelta { partial_json },
                    ..
                } => Some(partial_json.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(fragments.concat(), r#"{"city":"Tokyo"}"#);

        let anthropic::StreamEvent::MessageDelta { delta, .. } = &events[events.len() - 2] else {
            unreachable!("expected message_delta");
        };
        assert_eq!(delta.stop_reason, Some(anthropic::StopReason::ToolUse));
    }

    #[test]
    fn text_and_tool_blocks_get_distinct_indices() {
        let mut translator = OpenAiStreamTranslator::new("m", SafetyStopBehavior::default());

        let mixed: openai::StreamChunk = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "delta": {
                "content": "Checking",
                "tool_calls": [{ "index": 0, "id": "call_1", "function": { "name": "f", "arguments": "{}" } }]
            }}]
        }))
        .unwrap();

        let events = translator.on_chunk(mixed);

        let indices: Vec<u32> = events
            .iter()
            .filter_map(|event| match event {
                anthropic::StreamEvent::ContentBlockStart { index, .. } => Some(*index),
                _ => None,
            })
            .collect();
        assert_eq!(indices, vec![0, 1]);
    }

    #[test]
    fn empty_upstream_still_emits_complete_sequence() {
        let mut translator = OpenAiStreamTranslator::new("m", SafetyStopBehavior::default());
        let events = translator.finish();

        assert_eq!(event_names(&events), vec!["message_start", "message_delta", "message_stop"]);

        // finish is idempotent
        assert!(translator.finish().is_empty());
    }

    #[test]
    fn gemini_text_stream_translates() {
        let mut translator = GeminiStreamTranslator::new("m", SafetyStopBehavior::default());

        let chunk = |text: &str| -> gemini::GenerateContentResponse {
            serde_json::from_value(json!({
                "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }]
            }))
            .unwrap()
        };

        let last: gemini::GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "!" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 2, "candidatesTokenCount": 3 }
        }))
        .unwrap();

        let mut events = Vec::new();
        events.extend(translator.on_chunk(chunk("Hel")));
        events.extend(translator.on_chunk(chunk("lo")));
        events.extend(translator.on_chunk(last));
        events.extend(translator.finish());

        assert_eq!(
            event_names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let anthropic::StreamEvent::MessageDelta { delta, usage } = &events[events.len() - 2] else {
            unreachable!("expected message_delta");
        };
        assert_eq!(delta.stop_reason, Some(anthropic::StopReason::EndTurn));
        assert_eq!(usage.output_tokens, 3);
    }

    #[test]
    fn gemini_function_call_closes_its_block_immediately() {
        let mut translator = GeminiStreamTranslator::new("m", SafetyStopBehavior::default());

        let chunk: gemini::GenerateContentResponse = serde_json::from_value(json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{ "functionCall": { "name": "get_weather", "args": { "city": "Tokyo" } } }]
                },
                "finishReason": "STOP"
            }]
        }))
        .unwrap();

        let mut events = Vec::new();
        events.extend(translator.on_chunk(chunk));
        events.extend(translator.finish());

        assert_eq!(
            event_names(&events),
            vec![
                "message_start",
                "content_block_start",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );

        let anthropic::StreamEvent::MessageDelta { delta, .. } = &events[events.len() - 2] else {
            unreachable!("expected message_delta");
        };
        assert_eq!(delta.stop_reason, Some(anthropic::StopReason::ToolUse));
    }
}
