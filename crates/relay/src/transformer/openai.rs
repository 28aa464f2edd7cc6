//! OpenAI chat completions, both as the client format of `/chat/completions`
//! and as the vendor format of every OpenAI-compatible upstream.

use crate::{
    error::{TransformError, TransformResult},
    messages::{
        openai::{
            ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatContent,
            ChatContentPart, ChatMessage, ChatResponseMessage, ChatTool, ChatToolCall, ChatUsage, ChunkChoice,
            ChunkDelta, ChunkFunction, ChunkToolCall, CompletionTokensDetails, FunctionCall, FunctionDefinition,
            ImageUrl, StreamOptions,
        },
        unified::{
            FinishReason, ThinkingFragment, ToolCallFragment, UnifiedChatRequest, UnifiedChatResponse,
            UnifiedChoice, UnifiedChoiceDelta, UnifiedChunk, UnifiedContent, UnifiedContentPart, UnifiedDelta,
            UnifiedMessage, UnifiedRole, UnifiedTool, UnifiedToolCall, Usage,
        },
    },
    stream::ToolCallTable,
    transformer::{
        EncodedResponse, ResponseContext, SseFrame, StreamDecoder, StreamEncoder, Transformer, to_body, unix_now,
    },
    usage::{self, EmittedContent},
};

pub(crate) struct OpenAiTransformer;

impl Transformer for OpenAiTransformer {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn request_out(&self, body: &[u8]) -> TransformResult<UnifiedChatRequest> {
        let request: ChatCompletionRequest =
            sonic_rs::from_slice(body).map_err(|e| TransformError::UnsupportedSourceFormat(e.to_string()))?;

        log::debug!(
            "Decoding OpenAI request for model {} with {} messages",
            request.model,
            request.messages.len()
        );

        let messages = request
            .messages
            .into_iter()
            .map(decode_message)
            .collect::<TransformResult<Vec<_>>>()?;

        let tools = request
            .tools
            .unwrap_or_default()
            .into_iter()
            .map(|tool| UnifiedTool {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool.function.parameters.unwrap_or_default(),
            })
            .collect();

        UnifiedChatRequest {
            model: request.model,
            messages,
            max_tokens: request.max_completion_tokens.or(request.max_tokens),
            temperature: request.temperature,
            stream: request.stream.unwrap_or(false),
            tools,
            tool_choice: request.tool_choice,
            system: None,
            include_usage: request.stream_options.is_some_and(|options| options.include_usage),
        }
        .validated()
    }

    fn request_in(&self, request: &UnifiedChatRequest) -> TransformResult<Vec<u8>> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);

        if let Some(system) = &request.system {
            for text in system.texts() {
                messages.push(ChatMessage {
                    role: UnifiedRole::System.to_string(),
                    content: Some(ChatContent::Text(text.to_string())),
                    ..Default::default()
                });
            }
        }

        messages.extend(request.messages.iter().map(encode_message));

        let tools = (!request.tools.is_empty()).then(|| {
            request
                .tools
                .iter()
                .map(|tool| ChatTool {
                    tool_type: "function".to_string(),
                    function: FunctionDefinition {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: Some(tool.parameters.clone()).filter(|parameters| !parameters.is_null()),
                    },
                })
                .collect()
        });

        let body = ChatCompletionRequest {
            model: request.model.clone(),
            messages,
            max_tokens: request.max_tokens,
            max_completion_tokens: None,
            temperature: request.temperature,
            stream: Some(request.stream),
            // usage is always requested, the client decides whether it sees it
            stream_options: request.stream.then_some(StreamOptions { include_usage: true }),
            tools,
            tool_choice: request.tool_choice.clone(),
        };

        to_body(&body)
    }

    fn response_out(&self, body: &[u8]) -> TransformResult<UnifiedChatResponse> {
        let response: ChatCompletionResponse = sonic_rs::from_slice(body).map_err(|e| {
            log::error!("Failed to parse OpenAI chat completion response: {e}");
            TransformError::MalformedUpstreamChunk(e.to_string())
        })?;

        Ok(decode_response(response))
    }

    fn stream_response_out(&self) -> TransformResult<Box<dyn StreamDecoder>> {
        Ok(Box::new(OpenAiStreamDecoder))
    }

    fn response_in(&self, response: UnifiedChatResponse, context: &ResponseContext) -> TransformResult<EncodedResponse> {
        let mut emitted = EmittedContent::default();

        let choices = response
            .choices
            .into_iter()
            .map(|choice| {
                let text = choice.message.content.joined_text();
                emitted.push_text(&text);

                let tool_calls = (!choice.message.tool_calls.is_empty()).then(|| {
                    choice
                        .message
                        .tool_calls
                        .iter()
                        .map(|call| {
                            emitted.push_tool_call(&call.name, &call.arguments);
                            encode_tool_call(call)
                        })
                        .collect()
                });

                ChatChoice {
                    index: choice.index,
                    message: ChatResponseMessage {
                        role: UnifiedRole::Assistant.to_string(),
                        content: Some(ChatContent::Text(text)),
                        reasoning_content: choice.reasoning,
                        tool_calls,
                    },
                    finish_reason: Some(choice.finish_reason.unwrap_or(FinishReason::Stop).to_string()),
                }
            })
            .collect();

        let usage = usage::reconcile(
            response.usage,
            context.prompt_tokens,
            &emitted,
            context.estimator.as_ref(),
            &context.model,
        );

        let id = if response.id.is_empty() {
            completion_id()
        } else {
            response.id
        };

        let body = ChatCompletionResponse {
            id,
            object: "chat.completion".to_string(),
            created: if response.created == 0 { unix_now() } else { response.created },
            model: context.model.clone(),
            choices,
            usage: Some(encode_usage(usage)),
        };

        Ok(EncodedResponse {
            body: to_body(&body)?,
            usage,
        })
    }

    fn stream_response_in(&self, context: ResponseContext) -> TransformResult<Box<dyn StreamEncoder>> {
        Ok(Box::new(OpenAiStreamEncoder::new(context)))
    }
}

fn decode_message(message: ChatMessage) -> TransformResult<UnifiedMessage> {
    let content = match message.content {
        None => UnifiedContent::Text(String::new()),
        Some(ChatContent::Text(text)) => UnifiedContent::Text(text),
        Some(ChatContent::Parts(parts)) => UnifiedContent::Parts(
            parts
                .into_iter()
                .filter_map(|part| match part {
                    ChatContentPart::Text { text } => Some(UnifiedContentPart::Text { text }),
                    ChatContentPart::ImageUrl { image_url } => Some(UnifiedContentPart::Image { url: image_url.url }),
                    ChatContentPart::Unsupported => None,
                })
                .collect(),
        ),
    };

    let tool_calls = message
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .map(|call| UnifiedToolCall::new(call.id, call.function.name, call.function.arguments))
        .collect::<TransformResult<Vec<_>>>()?;

    Ok(UnifiedMessage {
        role: UnifiedRole::parse(&message.role),
        content,
        tool_calls,
        tool_call_id: message.tool_call_id,
    })
}

fn encode_message(message: &UnifiedMessage) -> ChatMessage {
    let tool_calls: Vec<ChatToolCall> = message.tool_calls.iter().map(encode_tool_call).collect();

    let content = match &message.content {
        UnifiedContent::Text(text) if text.is_empty() && !tool_calls.is_empty() => None,
        UnifiedContent::Text(text) => Some(ChatContent::Text(text.clone())),
        UnifiedContent::Parts(parts) => {
            let mut encoded = Vec::with_capacity(parts.len());

            for part in parts {
                match part {
                    UnifiedContentPart::Text { text } => encoded.push(ChatContentPart::Text { text: text.clone() }),
                    UnifiedContentPart::Image { url } => encoded.push(ChatContentPart::ImageUrl {
                        image_url: ImageUrl { url: url.clone() },
                    }),
                }
            }

            Some(ChatContent::Parts(encoded))
        }
    };

    ChatMessage {
        role: message.role.to_string(),
        content,
        tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
        tool_call_id: message.tool_call_id.clone(),
    }
}

fn encode_tool_call(call: &UnifiedToolCall) -> ChatToolCall {
    ChatToolCall {
        id: call.id.clone(),
        tool_type: "function".to_string(),
        function: FunctionCall {
            name: call.name.clone(),
            arguments: call.arguments.clone(),
        },
    }
}

/// Converts an OpenAI-shaped response body into unified form.
pub(crate) fn decode_response(response: ChatCompletionResponse) -> UnifiedChatResponse {
    let choices = response
        .choices
        .into_iter()
        .map(|choice| {
            let content = match choice.message.content {
                None => String::new(),
                Some(ChatContent::Text(text)) => text,
                Some(ChatContent::Parts(parts)) => parts
                    .into_iter()
                    .filter_map(|part| match part {
                        ChatContentPart::Text { text } => Some(text),
                        _ => None,
                    })
                    .collect(),
            };

            let tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| UnifiedToolCall {
                    id: call.id,
                    name: call.function.name,
                    arguments: call.function.arguments,
                })
                .collect();

            UnifiedChoice {
                index: choice.index,
                message: UnifiedMessage {
                    role: UnifiedRole::Assistant,
                    content: UnifiedContent::Text(content),
                    tool_calls,
                    tool_call_id: None,
                },
                reasoning: choice.message.reasoning_content,
                finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
            }
        })
        .collect();

    UnifiedChatResponse {
        id: response.id,
        created: response.created,
        model: response.model,
        choices,
        usage: response.usage.map(decode_usage),
    }
}

/// Converts one OpenAI-shaped stream chunk into unified form.
pub(crate) fn decode_chunk(chunk: ChatCompletionChunk) -> UnifiedChunk {
    let choices = chunk
        .choices
        .into_iter()
        .map(|choice| {
            let ChunkDelta {
                role,
                content,
                reasoning_content,
                thinking,
                tool_calls,
            } = choice.delta;

            let thinking = match thinking {
                Some(thinking) => match (thinking.content, thinking.signature) {
                    (Some(text), _) if !text.is_empty() => Some(ThinkingFragment::Text(text)),
                    (_, Some(signature)) => Some(ThinkingFragment::Signature(signature)),
                    _ => None,
                },
                None => reasoning_content
                    .filter(|text| !text.is_empty())
                    .map(ThinkingFragment::Text),
            };

            let tool_calls = tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| {
                    let function = call.function.unwrap_or_default();

                    ToolCallFragment {
                        index: call.index,
                        id: call.id,
                        name: function.name,
                        arguments: function.arguments,
                    }
                })
                .collect();

            UnifiedChoiceDelta {
                index: choice.index,
                delta: UnifiedDelta {
                    role: role.as_deref().map(UnifiedRole::parse),
                    content,
                    tool_calls,
                    thinking,
                },
                finish_reason: choice.finish_reason.as_deref().map(FinishReason::parse),
            }
        })
        .collect();

    UnifiedChunk {
        id: Some(chunk.id).filter(|id| !id.is_empty()),
        model: Some(chunk.model).filter(|model| !model.is_empty()),
        choices,
        usage: chunk.usage.map(decode_usage),
    }
}

fn decode_usage(usage: ChatUsage) -> Usage {
    Usage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        reasoning_tokens: usage
            .completion_tokens_details
            .map(|details| details.reasoning_tokens)
            .unwrap_or_default(),
    }
}

fn encode_usage(usage: Usage) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        total_tokens: usage.total_tokens,
        completion_tokens_details: (usage.reasoning_tokens > 0).then_some(CompletionTokensDetails {
            reasoning_tokens: usage.reasoning_tokens,
        }),
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

struct OpenAiStreamDecoder;

impl StreamDecoder for OpenAiStreamDecoder {
    fn decode(&mut self, data: &str) -> TransformResult<Option<UnifiedChunk>> {
        let chunk: ChatCompletionChunk =
            sonic_rs::from_str(data).map_err(|e| TransformError::MalformedUpstreamChunk(e.to_string()))?;

        Ok(Some(decode_chunk(chunk)))
    }
}

/// Relays unified chunks as OpenAI chunks.
///
/// Chunks pass through one by one under a stable id. Anything after the finish
/// reason only contributes usage, which is reported in a final chunk before
/// `[DONE]` when the client asked for it.
struct OpenAiStreamEncoder {
    context: ResponseContext,
    id: String,
    created: u64,
    text: String,
    tool_calls: ToolCallTable,
    vendor_usage: Option<Usage>,
    usage: Usage,
    finished: bool,
    closed: bool,
}

impl OpenAiStreamEncoder {
    fn new(context: ResponseContext) -> Self {
        let usage = Usage {
            prompt_tokens: context.prompt_tokens,
            total_tokens: context.prompt_tokens,
            ..Default::default()
        };

        Self {
            context,
            id: completion_id(),
            created: unix_now(),
            text: String::new(),
            tool_calls: ToolCallTable::default(),
            vendor_usage: None,
            usage,
            finished: false,
            closed: false,
        }
    }

    fn chunk(&self, choices: Vec<ChunkChoice>, usage: Option<ChatUsage>) -> SseFrame {
        let chunk = ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.context.model.clone(),
            choices,
            usage,
        };

        SseFrame::json(None, &chunk)
    }
}

impl StreamEncoder for OpenAiStreamEncoder {
    fn encode(&mut self, chunk: UnifiedChunk) -> Vec<SseFrame> {
        if self.closed {
            return Vec::new();
        }

        if let Some(usage) = chunk.usage {
            self.vendor_usage = Some(usage);
        }

        if self.finished || chunk.choices.is_empty() {
            return Vec::new();
        }

        let mut choices = Vec::with_capacity(chunk.choices.len());

        for choice in chunk.choices {
            let UnifiedDelta {
                role,
                content,
                tool_calls,
                thinking,
            } = choice.delta;

            if let Some(text) = &content {
                self.text.push_str(text);
            }

            let tool_calls: Vec<ChunkToolCall> = tool_calls
                .into_iter()
                .map(|fragment| {
                    self.tool_calls.apply(fragment.clone());

                    ChunkToolCall {
                        index: fragment.index,
                        tool_type: fragment.id.as_ref().map(|_| "function".to_string()),
                        id: fragment.id,
                        function: Some(ChunkFunction {
                            name: fragment.name,
                            arguments: fragment.arguments,
                        }),
                    }
                })
                .collect();

            let reasoning_content = match thinking {
                Some(ThinkingFragment::Text(text)) => Some(text),
                _ => None,
            };

            self.finished |= choice.finish_reason.is_some();

            choices.push(ChunkChoice {
                index: choice.index,
                delta: ChunkDelta {
                    role: role.map(|role| role.to_string()),
                    content,
                    reasoning_content,
                    thinking: None,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                },
                finish_reason: choice.finish_reason.map(|reason| reason.to_string()),
            });
        }

        vec![self.chunk(choices, None)]
    }

    fn finish(&mut self) -> Vec<SseFrame> {
        if self.closed {
            return Vec::new();
        }

        let mut emitted = EmittedContent::default();
        emitted.push_text(&self.text);

        for call in self.tool_calls.iter() {
            emitted.push_tool_call(&call.name, &call.arguments);
        }

        self.usage = usage::reconcile(
            self.vendor_usage,
            self.context.prompt_tokens,
            &emitted,
            self.context.estimator.as_ref(),
            &self.context.model,
        );

        self.closed = true;

        let mut frames = Vec::with_capacity(2);

        if self.context.include_usage {
            frames.push(self.chunk(Vec::new(), Some(encode_usage(self.usage))));
        }

        frames.push(SseFrame::data("[DONE]"));
        frames
    }

    fn abort(&mut self) {
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn usage(&self) -> Usage {
        self.usage
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use indoc::indoc;
    use serde_json::{Value, json};

    use super::*;
    use crate::{messages::unified::SystemInstruction, usage::tests::WordEstimator};

    fn context(include_usage: bool) -> ResponseContext {
        ResponseContext {
            model: "gpt-4o".to_string(),
            prompt_tokens: 4,
            include_usage,
            estimator: Arc::new(WordEstimator),
        }
    }

    #[test]
    fn decodes_client_request() {
        let body = indoc! {r#"
            {
              "model": "gpt-4o",
              "max_completion_tokens": 256,
              "stream": true,
              "stream_options": { "include_usage": true },
              "messages": [
                { "role": "developer", "content": "be brief" },
                {
                  "role": "user",
                  "content": [
                    { "type": "text", "text": "what is this?" },
                    { "type": "image_url", "image_url": { "url": "https://example.com/cat.png" } },
                    { "type": "input_audio", "input_audio": { "data": "", "format": "wav" } }
                  ]
                },
                {
                  "role": "assistant",
                  "content": null,
                  "tool_calls": [
                    { "id": "call_1", "type": "function", "function": { "name": "lookup", "arguments": "{}" } }
                  ]
                },
                { "role": "tool", "tool_call_id": "call_1", "content": "a cat" }
              ]
            }
        "#};

        let request = OpenAiTransformer.request_out(body.as_bytes()).unwrap();

        assert_eq!(request.max_tokens, Some(256));
        assert!(request.stream);
        assert!(request.include_usage);

        let roles: Vec<_> = request.messages.iter().map(|message| message.role).collect();
        assert_eq!(
            roles,
            [UnifiedRole::System, UnifiedRole::User, UnifiedRole::Assistant, UnifiedRole::Tool]
        );

        assert_eq!(request.messages[1].content.parts().len(), 2);
        assert_eq!(request.messages[2].tool_calls[0].name, "lookup");
        assert_eq!(request.messages[3].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn encodes_vendor_request() {
        let mut assistant = UnifiedMessage::text(UnifiedRole::Assistant, "");
        assistant.tool_calls.push(UnifiedToolCall::new("call_1", "lookup", "{\"id\":1}").unwrap());

        let request = UnifiedChatRequest {
            model: "gpt-4o".to_string(),
            messages: vec![
                UnifiedMessage::text(UnifiedRole::User, "hi"),
                assistant,
                UnifiedMessage::tool_result("call_1", "found"),
            ],
            max_tokens: Some(100),
            stream: true,
            system: Some(SystemInstruction::Text("be brief".to_string())),
            tools: vec![UnifiedTool {
                name: "lookup".to_string(),
                description: None,
                parameters: json!({ "type": "object" }),
            }],
            ..Default::default()
        };

        let body = OpenAiTransformer.request_in(&request).unwrap();
        let body: Value = serde_json::from_slice(&body).unwrap();

        insta::with_settings!({ sort_maps => true }, {
            insta::assert_json_snapshot!(body, @r#"
            {
              "max_tokens": 100,
              "messages": [
                {
                  "content": "be brief",
                  "role": "system"
                },
                {
                  "content": "hi",
                  "role": "user"
                },
                {
                  "role": "assistant",
                  "tool_calls": [
                    {
                      "function": {
                        "arguments": "{\"id\":1}",
                        "name": "lookup"
                      },
                      "id": "call_1",
                      "type": "function"
                    }
                  ]
                },
                {
                  "content": "found",
                  "role": "tool",
                  "tool_call_id": "call_1"
                }
              ],
              "model": "gpt-4o",
              "stream": true,
              "stream_options": {
                "include_usage": true
              },
              "tools": [
                {
                  "function": {
                    "name": "lookup",
                    "parameters": {
                      "type": "object"
                    }
                  },
                  "type": "function"
                }
              ]
            }
            "#);
        });
    }

    #[test]
    fn decodes_vendor_chunk_with_thinking_and_tools() {
        let data = indoc! {r#"
            {"id":"chatcmpl-9","model":"deepseek-r1","choices":[{"index":0,"delta":{"reasoning_content":"hmm","tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"lookup","arguments":"{\"a\""}}]},"finish_reason":null}]}
        "#};

        let chunk = OpenAiStreamDecoder.decode(data.trim()).unwrap().unwrap();

        insta::assert_debug_snapshot!(chunk, @r#"
        UnifiedChunk {
            id: Some(
                "chatcmpl-9",
            ),
            model: Some(
                "deepseek-r1",
            ),
            choices: [
                UnifiedChoiceDelta {
                    index: 0,
                    delta: UnifiedDelta {
                        role: None,
                        content: None,
                        tool_calls: [
                            ToolCallFragment {
                                index: 0,
                                id: Some(
                                    "call_1",
                                ),
                                name: Some(
                                    "lookup",
                                ),
                                arguments: Some(
                                    "{\"a\"",
                                ),
                            },
                        ],
                        thinking: Some(
                            Text(
                                "hmm",
                            ),
                        ),
                    },
                    finish_reason: None,
                },
            ],
            usage: None,
        }
        "#);
    }

    #[test]
    fn malformed_chunk_is_reported() {
        let error = OpenAiStreamDecoder.decode("{not json").unwrap_err();

        assert!(matches!(error, TransformError::MalformedUpstreamChunk(_)));
    }

    #[test]
    fn claude_thinking_deltas_are_recognized() {
        let data = r#"{"choices":[{"index":0,"delta":{"thinking":{"signature":"sig"}}}]}"#;
        let chunk = OpenAiStreamDecoder.decode(data).unwrap().unwrap();

        assert_eq!(
            chunk.choices[0].delta.thinking,
            Some(ThinkingFragment::Signature("sig".to_string()))
        );
    }

    #[test]
    fn stream_encoder_reports_usage_once_before_done() {
        let mut encoder = OpenAiTransformer.stream_response_in(context(true)).unwrap();

        let text = |text: &str, finish_reason| UnifiedChunk {
            choices: vec![UnifiedChoiceDelta {
                index: 0,
                delta: UnifiedDelta {
                    content: Some(text.to_string()),
                    ..Default::default()
                },
                finish_reason,
            }],
            ..Default::default()
        };

        let mut frames = Vec::new();
        frames.extend(encoder.encode(text("two words", None)));
        frames.extend(encoder.encode(text("", Some(FinishReason::Stop))));
        frames.extend(encoder.encode(text("after the end", None)));
        frames.extend(encoder.finish());
        frames.extend(encoder.finish());

        assert_eq!(frames.len(), 4);
        assert_eq!(frames[3].data, "[DONE]");

        let usage: Value = serde_json::from_str(&frames[2].data).unwrap();
        assert_eq!(usage["choices"], json!([]));
        assert_eq!(usage["usage"]["completion_tokens"], 2);
        assert_eq!(usage["usage"]["total_tokens"], 6);

        let first: Value = serde_json::from_str(&frames[0].data).unwrap();
        assert_eq!(first["id"], usage["id"]);
        assert_eq!(first["object"], "chat.completion.chunk");
    }

    #[test]
    fn stream_encoder_without_usage_only_sends_done() {
        let mut encoder = OpenAiTransformer.stream_response_in(context(false)).unwrap();

        let frames = encoder.finish();

        assert_eq!(frames, [SseFrame::data("[DONE]")]);
        assert!(encoder.is_closed());
    }

    #[test]
    fn response_keeps_vendor_usage() {
        let body = indoc! {r#"
            {
              "id": "chatcmpl-1",
              "object": "chat.completion",
              "created": 1700000000,
              "model": "gpt-4o-2024-08-06",
              "choices": [{ "index": 0, "message": { "role": "assistant", "content": "4" }, "finish_reason": "stop" }],
              "usage": { "prompt_tokens": 5, "completion_tokens": 1, "total_tokens": 6 }
            }
        "#};

        let response = OpenAiTransformer.response_out(body.as_bytes()).unwrap();
        let encoded = OpenAiTransformer.response_in(response, &context(false)).unwrap();
        let body: Value = serde_json::from_slice(&encoded.body).unwrap();

        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["choices"][0]["message"]["content"], "4");
        assert_eq!(body["usage"]["total_tokens"], 6);
        assert_eq!(encoded.usage.completion_tokens, 1);
    }
}
