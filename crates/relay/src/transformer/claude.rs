//! Claude Messages: the format of the `/messages` client endpoint and of
//! providers of type `anthropic`.

mod vendor;

use crate::{
    error::{TransformError, TransformResult},
    messages::{
        claude::{
            ClaudeContentBlock, ClaudeImageSource, ClaudeMessage, ClaudeMessageContent, ClaudeRequest,
            ClaudeResponse, ClaudeResponseBlock, ClaudeSystem, ClaudeUsage, StopReason,
        },
        unified::{
            FinishReason, SystemInstruction, UnifiedChatRequest, UnifiedChatResponse, UnifiedContent, UnifiedContentPart,
            UnifiedMessage, UnifiedRole, UnifiedTool, UnifiedToolCall,
        },
    },
    stream::ClaudeStreamEncoder,
    transformer::{EncodedResponse, ResponseContext, StreamDecoder, StreamEncoder, Transformer, to_body},
    usage::{self, EmittedContent},
};

const TRUNCATED_NOTICE: &str = "[Response truncated due to token limit]";

/// Claude Messages, spoken by clients of the `/messages` endpoint and by
/// Anthropic upstreams.
pub(crate) struct ClaudeTransformer;

impl Transformer for ClaudeTransformer {
    fn name(&self) -> &'static str {
        "claude"
    }

    fn request_out(&self, body: &[u8]) -> TransformResult<UnifiedChatRequest> {
        let request: ClaudeRequest =
            sonic_rs::from_slice(body).map_err(|e| TransformError::UnsupportedSourceFormat(e.to_string()))?;

        log::debug!(
            "Decoding Claude request for model {} with {} messages",
            request.model,
            request.messages.len()
        );

        let system = request.system.map(|system| match system {
            ClaudeSystem::Text(text) => SystemInstruction::Text(text),
            ClaudeSystem::Blocks(blocks) => SystemInstruction::Blocks(
                blocks
                    .into_iter()
                    .filter(|block| block.block_type.as_deref().is_none_or(|kind| kind == "text"))
                    .map(|block| block.text)
                    .collect(),
            ),
        });

        let mut messages = Vec::with_capacity(request.messages.len());

        for message in request.messages {
            decode_message(message, &mut messages)?;
        }

        let tools = request
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| UnifiedTool {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            })
            .collect();

        UnifiedChatRequest {
            model: request.model,
            messages,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            stream: request.stream.unwrap_or(false),
            tools,
            tool_choice: request.tool_choice,
            system,
            include_usage: false,
        }
        .validated()
    }

    fn response_in(&self, response: UnifiedChatResponse, context: &ResponseContext) -> TransformResult<EncodedResponse> {
        let mut content = Vec::new();
        let mut emitted = EmittedContent::default();
        let mut finish_reason = FinishReason::Stop;

        if let Some(choice) = response.choices.into_iter().next() {
            if let Some(thinking) = choice.reasoning.filter(|thinking| !thinking.is_empty()) {
                content.push(ClaudeResponseBlock::Thinking {
                    thinking,
                    signature: None,
                });
            }

            let text = choice.message.content.joined_text();

            if !text.is_empty() {
                emitted.push_text(&text);
                content.push(ClaudeResponseBlock::Text { text });
            }

            for call in &choice.message.tool_calls {
                emitted.push_tool_call(&call.name, &call.arguments);

                content.push(ClaudeResponseBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.name.clone(),
                    input: call.input(),
                });
            }

            finish_reason = choice.finish_reason.unwrap_or(FinishReason::Stop);
        }

        if finish_reason == FinishReason::Length && emitted.is_empty() {
            content.push(ClaudeResponseBlock::Text {
                text: TRUNCATED_NOTICE.to_string(),
            });
        }

        let usage = usage::reconcile(
            response.usage,
            context.prompt_tokens,
            &emitted,
            context.estimator.as_ref(),
            &context.model,
        );

        let body = ClaudeResponse {
            id: format!("msg_{}", response.id),
            object_type: "message",
            role: "assistant",
            content,
            model: context.model.clone(),
            stop_reason: Some(stop_reason(&finish_reason)),
            stop_sequence: None,
            usage: ClaudeUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
            },
        };

        Ok(EncodedResponse {
            body: to_body(&body)?,
            usage,
        })
    }

    fn stream_response_in(&self, context: ResponseContext) -> TransformResult<Box<dyn StreamEncoder>> {
        Ok(Box::new(ClaudeStreamEncoder::new(context)))
    }

    fn request_in(&self, request: &UnifiedChatRequest) -> TransformResult<Vec<u8>> {
        vendor::encode_request(request)
    }

    fn response_out(&self, body: &[u8]) -> TransformResult<UnifiedChatResponse> {
        vendor::decode_response(body)
    }

    fn stream_response_out(&self) -> TransformResult<Box<dyn StreamDecoder>> {
        Ok(Box::<vendor::ClaudeStreamDecoder>::default())
    }
}

/// Maps a unified finish reason to a Claude stop reason. Unknown reasons end the turn.
pub(crate) fn stop_reason(reason: &FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::StopSequence,
        FinishReason::Other(_) => StopReason::EndTurn,
    }
}

/// Decodes one Claude message. Tool results split off into role=tool messages,
/// placed before whatever else the message carries.
fn decode_message(message: ClaudeMessage, messages: &mut Vec<UnifiedMessage>) -> TransformResult<()> {
    let role = UnifiedRole::parse(&message.role);

    let blocks = match message.content {
        ClaudeMessageContent::Text(text) => {
            messages.push(UnifiedMessage::text(role, text));
            return Ok(());
        }
        ClaudeMessageContent::Blocks(blocks) => blocks,
    };

    let mut parts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in blocks {
        match block {
            ClaudeContentBlock::Text { text } => parts.push(UnifiedContentPart::Text { text }),
            ClaudeContentBlock::Image { source } => {
                let url = match source {
                    ClaudeImageSource::Base64 { media_type, data } => format!("data:{media_type};base64,{data}"),
                    ClaudeImageSource::Url { url } => url,
                };

                parts.push(UnifiedContentPart::Image { url });
            }
            ClaudeContentBlock::ToolUse { id, name, input } => {
                let arguments = if input.is_null() {
                    "{}".to_string()
                } else {
                    input.to_string()
                };

                tool_calls.push(UnifiedToolCall::new(id, name, arguments)?);
            }
            ClaudeContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut text = content.map(|content| content.into_text()).unwrap_or_default();

                if is_error.unwrap_or(false) && !text.starts_with("Error") {
                    text = format!("Error: {text}");
                }

                messages.push(UnifiedMessage::tool_result(tool_use_id, text));
            }
            ClaudeContentBlock::Unsupported => (),
        }
    }

    let content = match parts.as_slice() {
        [] => UnifiedContent::Text(String::new()),
        [UnifiedContentPart::Text { text }] => UnifiedContent::Text(text.clone()),
        _ => UnifiedContent::Parts(parts),
    };

    if !content.is_empty() || !tool_calls.is_empty() {
        messages.push(UnifiedMessage {
            role,
            content,
            tool_calls,
            tool_call_id: None,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indoc::indoc;
    use serde_json::Value;

    use super::*;
    use crate::{
        messages::unified::{UnifiedChoice, Usage},
        usage::tests::WordEstimator,
    };

    fn context() -> ResponseContext {
        ResponseContext {
            model: "claude-3.5".to_string(),
            prompt_tokens: 11,
            include_usage: false,
            estimator: Arc::new(WordEstimator),
        }
    }

    fn response(message: UnifiedMessage, finish_reason: Option<FinishReason>, usage: Option<Usage>) -> UnifiedChatResponse {
        UnifiedChatResponse {
            id: "chatcmpl-1".to_string(),
            created: 0,
            model: "gpt-4o".to_string(),
            choices: vec![UnifiedChoice {
                index: 0,
                message,
                reasoning: None,
                finish_reason,
            }],
            usage,
        }
    }

    fn encode(response: UnifiedChatResponse) -> Value {
        let encoded = ClaudeTransformer.response_in(response, &context()).unwrap();
        serde_json::from_slice(&encoded.body).unwrap()
    }

    #[test]
    fn decodes_system_blocks_tool_use_and_results() {
        let body = indoc! {r#"
            {
              "model": "claude-3-5-sonnet",
              "max_tokens": 1024,
              "stream": true,
              "system": [
                { "type": "text", "text": "You are terse." },
                { "type": "text", "text": "Answer in English." }
              ],
              "messages": [
                { "role": "user", "content": "weather in NYC?" },
                {
                  "role": "assistant",
                  "content": [
                    { "type": "text", "text": "Checking." },
                    { "type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": { "city": "NYC" } }
                  ]
                },
                {
                  "role": "user",
                  "content": [
                    { "type": "tool_result", "tool_use_id": "toolu_1", "content": [{ "type": "text", "text": "sunny" }] },
                    { "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": "AAAA" } },
                    { "type": "text", "text": "and this?" }
                  ]
                }
              ],
              "tools": [
                { "name": "get_weather", "description": "Weather lookup", "input_schema": { "type": "object" } }
              ]
            }
        "#};

        let request = ClaudeTransformer.request_out(body.as_bytes()).unwrap();

        insta::assert_debug_snapshot!(request, @r#"
        UnifiedChatRequest {
            model: "claude-3-5-sonnet",
            messages: [
                UnifiedMessage {
                    role: User,
                    content: Text(
                        "weather in NYC?",
                    ),
                    tool_calls: [],
                    tool_call_id: None,
                },
                UnifiedMessage {
                    role: Assistant,
                    content: Text(
                        "Checking.",
                    ),
                    tool_calls: [
                        UnifiedToolCall {
                            id: "toolu_1",
                            name: "get_weather",
                            arguments: "{\"city\":\"NYC\"}",
                        },
                    ],
                    tool_call_id: None,
                },
                UnifiedMessage {
                    role: Tool,
                    content: Text(
                        "sunny",
                    ),
                    tool_calls: [],
                    tool_call_id: Some(
                        "toolu_1",
                    ),
                },
                UnifiedMessage {
                    role: User,
                    content: Parts(
                        [
                            Image {
                                url: "data:image/png;base64,AAAA",
                            },
                            Text {
                                text: "and this?",
                            },
                        ],
                    ),
                    tool_calls: [],
                    tool_call_id: None,
                },
            ],
            max_tokens: Some(
                1024,
            ),
            temperature: None,
            stream: true,
            tools: [
                UnifiedTool {
                    name: "get_weather",
                    description: Some(
                        "Weather lookup",
                    ),
                    parameters: Object {
                        "type": String("object"),
                    },
                },
            ],
            tool_choice: None,
            system: Some(
                Blocks(
                    [
                        "You are terse.",
                        "Answer in English.",
                    ],
                ),
            ),
            include_usage: false,
        }
        "#);
    }

    #[test]
    fn rejects_empty_conversation() {
        let error = ClaudeTransformer
            .request_out(br#"{"model":"claude-3-5-sonnet","messages":[]}"#)
            .unwrap_err();

        insta::assert_snapshot!(error, @"invalid request: messages must not be empty");
    }

    #[test]
    fn rejects_unnamed_tool_use() {
        let body = indoc! {r#"
            {
              "model": "claude-3-5-sonnet",
              "messages": [
                { "role": "assistant", "content": [{ "type": "tool_use", "id": "toolu_1", "name": "", "input": {} }] }
              ]
            }
        "#};

        let error = ClaudeTransformer.request_out(body.as_bytes()).unwrap_err();

        insta::assert_snapshot!(error, @"invalid request: tool calls must have a name");
    }

    #[test]
    fn encodes_text_answer() {
        let body = encode(response(
            UnifiedMessage::text(UnifiedRole::Assistant, "4"),
            Some(FinishReason::Stop),
            Some(Usage {
                prompt_tokens: 5,
                completion_tokens: 1,
                total_tokens: 6,
                reasoning_tokens: 0,
            }),
        ));

        insta::with_settings!({ sort_maps => true }, {
            insta::assert_json_snapshot!(body, @r#"
            {
              "content": [
                {
                  "text": "4",
                  "type": "text"
                }
              ],
              "id": "msg_chatcmpl-1",
              "model": "claude-3.5",
              "role": "assistant",
              "stop_reason": "end_turn",
              "stop_sequence": null,
              "type": "message",
              "usage": {
                "input_tokens": 5,
                "output_tokens": 1
              }
            }
            "#);
        });
    }

    #[test]
    fn encodes_tool_calls_and_estimates_missing_usage() {
        let mut message = UnifiedMessage::text(UnifiedRole::Assistant, "");
        message.tool_calls = vec![
            UnifiedToolCall::new("call_1", "search", "{\"q\": \"rust\"}").unwrap(),
            UnifiedToolCall::new("call_2", "broken", "{\"q\":").unwrap(),
        ];

        let body = encode(response(message, Some(FinishReason::ToolCalls), None));

        insta::with_settings!({ sort_maps => true }, {
            insta::assert_json_snapshot!(body, @r#"
            {
              "content": [
                {
                  "id": "call_1",
                  "input": {
                    "q": "rust"
                  },
                  "name": "search",
                  "type": "tool_use"
                },
                {
                  "id": "call_2",
                  "input": {
                    "arguments": "{\"q\":"
                  },
                  "name": "broken",
                  "type": "tool_use"
                }
              ],
              "id": "msg_chatcmpl-1",
              "model": "claude-3.5",
              "role": "assistant",
              "stop_reason": "tool_use",
              "stop_sequence": null,
              "type": "message",
              "usage": {
                "input_tokens": 11,
                "output_tokens": 3
              }
            }
            "#);
        });
    }

    #[test]
    fn truncated_empty_answer_gets_a_notice() {
        let body = encode(response(
            UnifiedMessage::text(UnifiedRole::Assistant, ""),
            Some(FinishReason::Length),
            None,
        ));

        assert_eq!(body["content"][0]["text"], TRUNCATED_NOTICE);
        assert_eq!(body["stop_reason"], "max_tokens");
    }

    #[test]
    fn finish_reason_mapping_is_total() {
        let reasons = ["stop", "length", "tool_calls", "content_filter", "function_call", "recitation", ""]
            .map(|reason| stop_reason(&FinishReason::parse(reason)));

        assert_eq!(
            reasons,
            [
                StopReason::EndTurn,
                StopReason::MaxTokens,
                StopReason::ToolUse,
                StopReason::StopSequence,
                StopReason::ToolUse,
                StopReason::EndTurn,
                StopReason::EndTurn,
            ]
        );
    }

    #[test]
    fn system_prompt_is_carried_out_of_band() {
        let body = br#"{"model":"claude-3-5-sonnet","system":"be brief","messages":[{"role":"user","content":"hi"}]}"#;

        let request = ClaudeTransformer.request_out(body).unwrap();

        assert_eq!(request.system, Some(SystemInstruction::Text("be brief".to_string())));
        assert!(request.messages.iter().all(|message| message.role != UnifiedRole::System));
        assert_eq!(request.system_prompts().collect::<Vec<_>>(), ["be brief"]);
    }
}
