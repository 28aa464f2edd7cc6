//! Claude Messages as an upstream format, for providers of type `anthropic`.

use std::collections::HashMap;

use serde_json::{Value, json};

use crate::{
    error::{TransformError, TransformResult},
    messages::{
        claude::{
            ClaudeContentBlock, ClaudeImageSource, ClaudeMessage, ClaudeMessageContent, ClaudeRequest, ClaudeSystem,
            ClaudeSystemBlock, ClaudeTool, ClaudeToolResultContent, ClaudeUpstreamBlock, ClaudeUpstreamDelta,
            ClaudeUpstreamEvent, ClaudeUpstreamMessage, ClaudeUpstreamUsage,
        },
        unified::{
            FinishReason, ThinkingFragment, ToolCallFragment, UnifiedChatRequest, UnifiedChatResponse, UnifiedChoice,
            UnifiedChoiceDelta, UnifiedChunk, UnifiedContent, UnifiedContentPart, UnifiedDelta, UnifiedMessage,
            UnifiedRole, UnifiedToolCall, Usage,
        },
    },
    transformer::{StreamDecoder, to_body, unix_now},
};

/// The Messages API requires an output bound, unified requests may leave it out.
const DEFAULT_MAX_TOKENS: u32 = 4096;

pub(super) fn encode_request(request: &UnifiedChatRequest) -> TransformResult<Vec<u8>> {
    let system: Vec<ClaudeSystemBlock> = request
        .system_prompts()
        .filter(|text| !text.is_empty())
        .map(|text| ClaudeSystemBlock {
            block_type: Some("text".to_string()),
            text: text.to_string(),
        })
        .collect();

    let mut messages: Vec<ClaudeMessage> = Vec::with_capacity(request.messages.len());

    for message in &request.messages {
        let (role, blocks) = match message.role {
            UnifiedRole::System => continue,
            UnifiedRole::Tool => ("user", vec![tool_result(message)]),
            UnifiedRole::User => ("user", content_blocks(&message.content)),
            UnifiedRole::Assistant => {
                let mut blocks = content_blocks(&message.content);

                blocks.extend(message.tool_calls.iter().map(|call| ClaudeContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input(),
                }));

                ("assistant", blocks)
            }
        };

        if !blocks.is_empty() {
            push_merged(&mut messages, role, blocks);
        }
    }

    let tools: Vec<ClaudeTool> = request
        .tools
        .iter()
        .map(|tool| ClaudeTool {
            name: tool.name.clone(),
            description: tool.description.clone(),
            input_schema: match &tool.parameters {
                Value::Null => json!({ "type": "object" }),
                schema => schema.clone(),
            },
        })
        .collect();

    let tools = (!tools.is_empty()).then_some(tools);

    // a tool choice without tools is rejected by the API
    let tool_choice = tools
        .as_ref()
        .and(request.tool_choice.as_ref())
        .and_then(tool_choice);

    let body = ClaudeRequest {
        model: request.model.clone(),
        messages,
        system: (!system.is_empty()).then_some(ClaudeSystem::Blocks(system)),
        max_tokens: Some(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        temperature: request.temperature,
        stream: Some(request.stream),
        tools,
        tool_choice,
    };

    to_body(&body)
}

/// Claude requires alternating roles, so consecutive messages of one role are
/// folded into a single message. Tool results thereby end up in the user turn
/// that follows the calls.
fn push_merged(messages: &mut Vec<ClaudeMessage>, role: &str, blocks: Vec<ClaudeContentBlock>) {
    if let Some(last) = messages.last_mut()
        && last.role == role
        && let ClaudeMessageContent::Blocks(existing) = &mut last.content
    {
        existing.extend(blocks);
        return;
    }

    messages.push(ClaudeMessage {
        role: role.to_string(),
        content: ClaudeMessageContent::Blocks(blocks),
    });
}

fn content_blocks(content: &UnifiedContent) -> Vec<ClaudeContentBlock> {
    match content {
        UnifiedContent::Text(text) if text.is_empty() => Vec::new(),
        UnifiedContent::Text(text) => vec![ClaudeContentBlock::Text { text: text.clone() }],
        UnifiedContent::Parts(parts) => parts
            .iter()
            .filter_map(|part| match part {
                UnifiedContentPart::Text { text } if text.is_empty() => None,
                UnifiedContentPart::Text { text } => Some(ClaudeContentBlock::Text { text: text.clone() }),
                UnifiedContentPart::Image { url } => Some(ClaudeContentBlock::Image {
                    source: image_source(url),
                }),
            })
            .collect(),
    }
}

fn image_source(url: &str) -> ClaudeImageSource {
    let inline = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"));

    match inline {
        Some((media_type, data)) => ClaudeImageSource::Base64 {
            media_type: media_type.to_string(),
            data: data.to_string(),
        },
        None => ClaudeImageSource::Url { url: url.to_string() },
    }
}

fn tool_result(message: &UnifiedMessage) -> ClaudeContentBlock {
    ClaudeContentBlock::ToolResult {
        tool_use_id: message.tool_call_id.clone().unwrap_or_default(),
        content: Some(ClaudeToolResultContent::Text(message.content.joined_text())),
        is_error: None,
    }
}

/// Translates an OpenAI-style tool choice. Claude-shaped objects pass through.
fn tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(json!({ "type": "auto" })),
            "required" | "any" => Some(json!({ "type": "any" })),
            "none" => Some(json!({ "type": "none" })),
            _ => None,
        },
        Value::Object(object) => match object.get("function").and_then(|function| function.get("name")) {
            Some(Value::String(name)) => Some(json!({ "type": "tool", "name": name })),
            _ => Some(choice.clone()),
        },
        _ => None,
    }
}

pub(super) fn decode_response(body: &[u8]) -> TransformResult<UnifiedChatResponse> {
    let response: ClaudeUpstreamMessage =
        sonic_rs::from_slice(body).map_err(|e| TransformError::MalformedUpstreamChunk(e.to_string()))?;

    if response.object_type != "message" {
        return Err(TransformError::MalformedUpstreamChunk(format!(
            "expected a message body, got type '{}'",
            response.object_type
        )));
    }

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for block in response.content {
        match block {
            ClaudeUpstreamBlock::Text { text: piece } => text.push_str(&piece),
            ClaudeUpstreamBlock::ToolUse { id, name, input } => tool_calls.push(UnifiedToolCall {
                id,
                name,
                arguments: arguments(&input),
            }),
            ClaudeUpstreamBlock::Thinking { thinking } => reasoning.push_str(&thinking),
            ClaudeUpstreamBlock::Other => (),
        }
    }

    let finish_reason = response.stop_reason.as_deref().map(finish_reason);

    Ok(UnifiedChatResponse {
        // client encoders add their own prefix
        id: response.id.trim_start_matches("msg_").to_string(),
        created: unix_now(),
        model: response.model,
        choices: vec![UnifiedChoice {
            index: 0,
            message: UnifiedMessage {
                role: UnifiedRole::Assistant,
                content: UnifiedContent::Text(text),
                tool_calls,
                tool_call_id: None,
            },
            reasoning: (!reasoning.is_empty()).then_some(reasoning),
            finish_reason,
        }],
        usage: Some(decode_usage(response.usage, 0)),
    })
}

fn arguments(input: &Value) -> String {
    match input {
        Value::Null => "{}".to_string(),
        input => input.to_string(),
    }
}

fn finish_reason(stop_reason: &str) -> FinishReason {
    match stop_reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

/// `fallback_prompt` covers `message_delta` usage, which may leave the input out.
fn decode_usage(usage: ClaudeUpstreamUsage, fallback_prompt: u32) -> Usage {
    let prompt_tokens = match usage.prompt_tokens() {
        0 => fallback_prompt,
        tokens => tokens,
    };

    let completion_tokens = usage.output_tokens.unwrap_or_default();

    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens.saturating_add(completion_tokens),
        reasoning_tokens: 0,
    }
}

/// Decodes one Anthropic event stream.
///
/// Claude numbers content blocks, not tool calls, so every `tool_use` block is
/// given the next positional tool index and its `input_json_delta` events are
/// routed to it.
#[derive(Default)]
pub(crate) struct ClaudeStreamDecoder {
    id: Option<String>,
    model: Option<String>,
    input_tokens: u32,
    tool_indices: HashMap<u32, u32>,
}

impl ClaudeStreamDecoder {
    fn chunk(&self, delta: UnifiedDelta, finish_reason: Option<FinishReason>, usage: Option<Usage>) -> UnifiedChunk {
        UnifiedChunk {
            id: self.id.clone(),
            model: self.model.clone(),
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
        }
    }

    fn block_start(&mut self, index: u32, block: ClaudeUpstreamBlock) -> Option<UnifiedDelta> {
        let delta = match block {
            ClaudeUpstreamBlock::ToolUse { id, name, input } => {
                let tool_index = u32::try_from(self.tool_indices.len()).unwrap_or(u32::MAX);
                self.tool_indices.insert(index, tool_index);

                // input normally streams as deltas, anything already present is kept
                let arguments = match &input {
                    Value::Object(object) if !object.is_empty() => Some(input.to_string()),
                    _ => None,
                };

                UnifiedDelta {
                    tool_calls: vec![ToolCallFragment {
                        index: tool_index,
                        id: Some(id),
                        name: Some(name),
                        arguments,
                    }],
                    ..Default::default()
                }
            }
            ClaudeUpstreamBlock::Text { text } if !text.is_empty() => UnifiedDelta {
                content: Some(text),
                ..Default::default()
            },
            ClaudeUpstreamBlock::Thinking { thinking } if !thinking.is_empty() => UnifiedDelta {
                thinking: Some(ThinkingFragment::Text(thinking)),
                ..Default::default()
            },
            _ => return None,
        };

        Some(delta)
    }

    fn block_delta(&self, index: u32, delta: ClaudeUpstreamDelta) -> TransformResult<Option<UnifiedDelta>> {
        let delta = match delta {
            ClaudeUpstreamDelta::TextDelta { text } => UnifiedDelta {
                content: Some(text),
                ..Default::default()
            },
            ClaudeUpstreamDelta::InputJsonDelta { partial_json } => {
                let Some(&tool_index) = self.tool_indices.get(&index) else {
                    return Err(TransformError::MalformedUpstreamChunk(format!(
                        "input_json_delta for content block {index}, which is not a tool_use block"
                    )));
                };

                UnifiedDelta {
                    tool_calls: vec![ToolCallFragment {
                        index: tool_index,
                        arguments: Some(partial_json),
                        ..Default::default()
                    }],
                    ..Default::default()
                }
            }
            ClaudeUpstreamDelta::ThinkingDelta { thinking } => UnifiedDelta {
                thinking: Some(ThinkingFragment::Text(thinking)),
                ..Default::default()
            },
            ClaudeUpstreamDelta::SignatureDelta { signature } => UnifiedDelta {
                thinking: Some(ThinkingFragment::Signature(signature)),
                ..Default::default()
            },
            ClaudeUpstreamDelta::Other => return Ok(None),
        };

        Ok(Some(delta))
    }
}

impl StreamDecoder for ClaudeStreamDecoder {
    fn decode(&mut self, data: &str) -> TransformResult<Option<UnifiedChunk>> {
        let event: ClaudeUpstreamEvent =
            sonic_rs::from_str(data).map_err(|e| TransformError::MalformedUpstreamChunk(e.to_string()))?;

        let chunk = match event {
            ClaudeUpstreamEvent::MessageStart { message } => {
                self.input_tokens = message.usage.prompt_tokens();
                self.id = Some(message.id);
                self.model = Some(message.model);

                let delta = UnifiedDelta {
                    role: Some(UnifiedRole::Assistant),
                    ..Default::default()
                };

                self.chunk(delta, None, None)
            }
            ClaudeUpstreamEvent::ContentBlockStart { index, content_block } => {
                match self.block_start(index, content_block) {
                    Some(delta) => self.chunk(delta, None, None),
                    None => return Ok(None),
                }
            }
            ClaudeUpstreamEvent::ContentBlockDelta { index, delta } => match self.block_delta(index, delta)? {
                Some(delta) => self.chunk(delta, None, None),
                None => return Ok(None),
            },
            ClaudeUpstreamEvent::MessageDelta { delta, usage } => {
                let finish_reason = delta.stop_reason.as_deref().map(finish_reason);
                let usage = usage.map(|usage| decode_usage(usage, self.input_tokens));

                if finish_reason.is_none() && usage.is_none() {
                    return Ok(None);
                }

                self.chunk(UnifiedDelta::default(), finish_reason, usage)
            }
            ClaudeUpstreamEvent::Error { error } => {
                log::error!("Anthropic upstream reported {}: {}", error.error_type, error.message);
                return Ok(None);
            }
            ClaudeUpstreamEvent::Other => return Ok(None),
        };

        Ok(Some(chunk))
    }
}
