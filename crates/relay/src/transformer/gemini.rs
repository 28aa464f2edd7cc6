//! Gemini and Vertex AI `generateContent`, as an upstream format.
//!
//! Responses reach this transformer either in the vendor's native
//! `candidates` shape or already translated into the OpenAI `choices` shape by
//! an intermediate provider. The shape is probed once per body and decoded
//! into the matching typed structure.

use std::collections::HashMap;

use serde::{Deserialize, de::DeserializeOwned, de::IgnoredAny};
use serde_json::{Value, json};

use super::{
    openai::{decode_chunk, decode_response},
    schema::clean_for_gemini,
};
use crate::{
    error::{TransformError, TransformResult},
    messages::{
        gemini::{
            FileData, FunctionDeclaration, GeminiContent, GeminiFunctionCall, GeminiFunctionResponse, GeminiPart,
            GeminiTool, GenerateContentRequest, GenerateContentResponse, GenerationConfig, InlineData, SafetySetting,
            UsageMetadata,
        },
        openai::{ChatCompletionChunk, ChatCompletionResponse},
        unified::{
            FinishReason, ThinkingFragment, ToolCallFragment, UnifiedChatRequest, UnifiedChatResponse,
            UnifiedChoice, UnifiedChoiceDelta, UnifiedChunk, UnifiedContent, UnifiedContentPart, UnifiedDelta,
            UnifiedMessage, UnifiedRole, UnifiedToolCall, Usage,
        },
    },
    transformer::{StreamDecoder, Transformer, to_body, unix_now},
};

pub(crate) struct GeminiTransformer;

impl Transformer for GeminiTransformer {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn request_in(&self, request: &UnifiedChatRequest) -> TransformResult<Vec<u8>> {
        let system_parts: Vec<GeminiPart> = request
            .system_prompts()
            .filter(|text| !text.is_empty())
            .map(text_part)
            .collect();

        let system_instruction = (!system_parts.is_empty()).then(|| GeminiContent {
            role: None,
            parts: system_parts,
        });

        // functionResponse parts are matched to their call by name
        let call_names: HashMap<&str, &str> = request
            .messages
            .iter()
            .flat_map(|message| &message.tool_calls)
            .map(|call| (call.id.as_str(), call.name.as_str()))
            .collect();

        let contents = request
            .messages
            .iter()
            .filter(|message| message.role != UnifiedRole::System)
            .filter_map(|message| encode_message(message, &call_names))
            .collect();

        let declarations: Vec<FunctionDeclaration> = request
            .tools
            .iter()
            .map(|tool| FunctionDeclaration {
                name: tool.name.clone(),
                description: tool.description.clone().unwrap_or_default(),
                parameters: (!tool.parameters.is_null()).then(|| clean_for_gemini(&tool.parameters)),
            })
            .collect();

        let tools = (!declarations.is_empty()).then(|| {
            vec![GeminiTool {
                function_declarations: declarations,
            }]
        });

        let body = GenerateContentRequest {
            contents,
            system_instruction,
            tools,
            generation_config: GenerationConfig {
                max_output_tokens: request.max_tokens.filter(|max_tokens| *max_tokens > 0),
                temperature: request.temperature,
            },
            safety_settings: SafetySetting::permissive(),
        };

        to_body(&body)
    }

    fn response_out(&self, body: &[u8]) -> TransformResult<UnifiedChatResponse> {
        match ResponseShape::<ChatCompletionResponse>::probe(body, false)? {
            ResponseShape::OpenAi(response) => Ok(decode_response(response)),
            ResponseShape::Native(response) => Ok(decode_native_response(response)),
        }
    }

    fn stream_response_out(&self) -> TransformResult<Box<dyn StreamDecoder>> {
        Ok(Box::new(GeminiStreamDecoder::default()))
    }
}

/// The two shapes a Gemini response body can take.
enum ResponseShape<T> {
    /// Already translated into the OpenAI shape.
    OpenAi(T),
    /// The vendor's own `candidates` shape.
    Native(GenerateContentResponse),
}

/// Which discriminating keys a body carries.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShapeProbe {
    #[serde(default)]
    choices: Option<IgnoredAny>,
    #[serde(default)]
    candidates: Option<IgnoredAny>,
    #[serde(default)]
    usage_metadata: Option<IgnoredAny>,
}

impl<T: DeserializeOwned> ResponseShape<T> {
    /// Decides the shape of `body`. Only a stream chunk may carry usage
    /// without candidates; a complete body without either key is ambiguous.
    fn probe(body: &[u8], stream_chunk: bool) -> TransformResult<Self> {
        let probe: ShapeProbe =
            sonic_rs::from_slice(body).map_err(|e| TransformError::MalformedUpstreamChunk(e.to_string()))?;

        if probe.choices.is_some() {
            let response = sonic_rs::from_slice(body).map_err(|e| TransformError::MalformedUpstreamChunk(e.to_string()))?;
            return Ok(ResponseShape::OpenAi(response));
        }

        // the last chunk of a native stream may carry usage only
        if probe.candidates.is_some() || (stream_chunk && probe.usage_metadata.is_some()) {
            let response = sonic_rs::from_slice(body).map_err(|e| TransformError::MalformedUpstreamChunk(e.to_string()))?;
            return Ok(ResponseShape::Native(response));
        }

        Err(TransformError::AmbiguousResponseShape)
    }
}

fn text_part(text: &str) -> GeminiPart {
    GeminiPart {
        text: Some(text.to_string()),
        ..Default::default()
    }
}

fn function_call_part(name: &str, args: Value) -> GeminiPart {
    GeminiPart {
        function_call: Some(GeminiFunctionCall {
            name: name.to_string(),
            args,
        }),
        ..Default::default()
    }
}

fn function_response_part(name: &str, content: &str) -> GeminiPart {
    GeminiPart {
        function_response: Some(GeminiFunctionResponse {
            name: name.to_string(),
            response: json!({ "content": content }),
        }),
        ..Default::default()
    }
}

/// Gemini wants function call arguments as an object, never `null`.
fn function_args(arguments: &str) -> Value {
    match serde_json::from_str::<Value>(arguments) {
        Ok(args @ Value::Object(_)) => args,
        _ => Value::Object(Default::default()),
    }
}

fn image_part(url: &str) -> GeminiPart {
    let inline = url
        .strip_prefix("data:")
        .and_then(|rest| rest.split_once(";base64,"))
        .map(|(mime_type, data)| InlineData {
            mime_type: mime_type.to_string(),
            data: data.to_string(),
        });

    match inline {
        Some(inline_data) => GeminiPart {
            inline_data: Some(inline_data),
            ..Default::default()
        },
        None => GeminiPart {
            file_data: Some(FileData {
                mime_type: None,
                file_uri: url.to_string(),
            }),
            ..Default::default()
        },
    }
}

fn encode_message(message: &UnifiedMessage, call_names: &HashMap<&str, &str>) -> Option<GeminiContent> {
    let role = match message.role {
        UnifiedRole::Assistant => "model",
        _ => "user",
    };

    let mut parts = Vec::new();

    if message.role == UnifiedRole::Tool {
        let id = message.tool_call_id.as_deref().unwrap_or_default();
        let name = call_names.get(id).copied().unwrap_or(id);

        parts.push(function_response_part(name, &message.content.joined_text()));
    } else {
        match &message.content {
            UnifiedContent::Text(text) if text.is_empty() => (),
            UnifiedContent::Text(text) => parts.push(text_part(text)),
            UnifiedContent::Parts(content) => {
                for part in content {
                    match part {
                        UnifiedContentPart::Text { text } if text.is_empty() => (),
                        UnifiedContentPart::Text { text } => parts.push(text_part(text)),
                        UnifiedContentPart::Image { url } => parts.push(image_part(url)),
                    }
                }
            }
        }

        for call in &message.tool_calls {
            parts.push(function_call_part(&call.name, function_args(&call.arguments)));
        }
    }

    (!parts.is_empty()).then(|| GeminiContent {
        role: Some(role.to_string()),
        parts,
    })
}

/// Maps a native finish reason. Reasons other than the three known ones
/// depend on whether the model called a function.
fn finish_reason(reason: Option<&str>, saw_function_call: bool) -> FinishReason {
    match reason {
        Some("STOP") => FinishReason::Stop,
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") => FinishReason::ContentFilter,
        _ if saw_function_call => FinishReason::ToolCalls,
        _ => FinishReason::Stop,
    }
}

fn decode_usage(metadata: UsageMetadata) -> Usage {
    let completion_tokens = metadata.candidates_token_count + metadata.thoughts_token_count;
    let total_tokens = match metadata.total_token_count {
        0 => metadata.prompt_token_count + completion_tokens,
        total => total,
    };

    Usage {
        prompt_tokens: metadata.prompt_token_count,
        completion_tokens,
        total_tokens,
        reasoning_tokens: metadata.thoughts_token_count,
    }
}

fn call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn decode_native_response(response: GenerateContentResponse) -> UnifiedChatResponse {
    let GenerateContentResponse {
        candidates,
        usage_metadata,
        model_version,
        response_id,
    } = response;

    let choices = candidates
        .into_iter()
        .take(1)
        .map(|candidate| {
            let mut text = String::new();
            let mut reasoning = String::new();
            let mut tool_calls = Vec::new();

            for part in candidate.content.unwrap_or_default().parts {
                if let Some(call) = part.function_call {
                    let arguments = match call.args {
                        Value::Null => "{}".to_string(),
                        args => args.to_string(),
                    };

                    tool_calls.push(UnifiedToolCall {
                        id: call_id(),
                        name: call.name,
                        arguments,
                    });
                } else if let Some(part_text) = part.text {
                    if part.thought.unwrap_or(false) {
                        reasoning.push_str(&part_text);
                    } else {
                        text.push_str(&part_text);
                    }
                }
            }

            let finish_reason = finish_reason(candidate.finish_reason.as_deref(), !tool_calls.is_empty());

            UnifiedChoice {
                index: candidate.index.unwrap_or_default(),
                message: UnifiedMessage {
                    role: UnifiedRole::Assistant,
                    content: UnifiedContent::Text(text),
                    tool_calls,
                    tool_call_id: None,
                },
                reasoning: (!reasoning.is_empty()).then_some(reasoning),
                finish_reason: Some(finish_reason),
            }
        })
        .collect();

    UnifiedChatResponse {
        id: response_id.unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string()),
        created: unix_now(),
        model: model_version.unwrap_or_default(),
        choices,
        usage: usage_metadata.map(decode_usage),
    }
}

/// Decodes one Gemini stream.
///
/// Native chunks deliver every function call complete, so each gets the next
/// positional index. Whether a function call was seen decides the finish
/// reason when Gemini does not give a known one.
#[derive(Default)]
struct GeminiStreamDecoder {
    next_tool_index: u32,
    saw_function_call: bool,
}

impl GeminiStreamDecoder {
    fn decode_native(&mut self, response: GenerateContentResponse) -> Option<UnifiedChunk> {
        let usage = response.usage_metadata.map(decode_usage);
        let mut choices = Vec::new();

        if let Some(candidate) = response.candidates.into_iter().next() {
            let mut text = String::new();
            let mut thinking = String::new();
            let mut tool_calls = Vec::new();

            for part in candidate.content.unwrap_or_default().parts {
                if let Some(call) = part.function_call {
                    let arguments = match call.args {
                        Value::Null => "{}".to_string(),
                        args => args.to_string(),
                    };

                    tool_calls.push(ToolCallFragment {
                        index: self.next_tool_index,
                        id: Some(call_id()),
                        name: Some(call.name),
                        arguments: Some(arguments),
                    });

                    self.next_tool_index += 1;
                    self.saw_function_call = true;
                } else if let Some(part_text) = part.text {
                    if part.thought.unwrap_or(false) {
                        thinking.push_str(&part_text);
                    } else {
                        text.push_str(&part_text);
                    }
                }
            }

            let finish_reason = candidate
                .finish_reason
                .as_deref()
                .map(|reason| finish_reason(Some(reason), self.saw_function_call));

            let delta = UnifiedDelta {
                role: Some(UnifiedRole::Assistant),
                content: (!text.is_empty()).then_some(text),
                tool_calls,
                thinking: (!thinking.is_empty()).then_some(ThinkingFragment::Text(thinking)),
            };

            choices.push(UnifiedChoiceDelta {
                index: candidate.index.unwrap_or_default(),
                delta,
                finish_reason,
            });
        }

        if choices.is_empty() && usage.is_none() {
            return None;
        }

        Some(UnifiedChunk {
            id: response.response_id,
            model: response.model_version,
            choices,
            usage,
        })
    }
}

impl StreamDecoder for GeminiStreamDecoder {
    fn decode(&mut self, data: &str) -> TransformResult<Option<UnifiedChunk>> {
        match ResponseShape::<ChatCompletionChunk>::probe(data.as_bytes(), true)? {
            ResponseShape::OpenAi(chunk) => Ok(Some(decode_chunk(chunk))),
            ResponseShape::Native(response) => Ok(self.decode_native(response)),
        }
    }
}
