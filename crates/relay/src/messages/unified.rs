//! Vendor-neutral chat types.
//!
//! Every wire format converts through these types: a client request is decoded
//! into a [`UnifiedChatRequest`], encoded for the vendor, and the vendor response
//! is decoded into a [`UnifiedChatResponse`] (or a sequence of [`UnifiedChunk`]s
//! when streaming) before being encoded back into the client's format.

use std::fmt;

use serde_json::Value;

use crate::error::{TransformError, TransformResult};

/// Largest `max_tokens` value accepted from clients.
pub const MAX_OUTPUT_TOKENS: u32 = (i32::MAX / 2) as u32;

/// A chat request in unified form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedChatRequest {
    /// Model identifier as requested by the client.
    pub model: String,

    /// Conversation so far, in order.
    pub messages: Vec<UnifiedMessage>,

    /// Upper bound for generated tokens.
    pub max_tokens: Option<u32>,

    pub temperature: Option<f32>,

    /// Whether the client expects a streamed response.
    pub stream: bool,

    /// Tools offered to the model.
    pub tools: Vec<UnifiedTool>,

    /// Tool choice directive, forwarded untouched.
    pub tool_choice: Option<Value>,

    /// System instruction supplied out of band, as Claude does. Formats that
    /// carry the system prompt inside the message list decode it into
    /// system-role messages instead.
    pub system: Option<SystemInstruction>,

    /// Whether an OpenAI-shaped streaming client asked for a trailing usage chunk.
    pub include_usage: bool,
}

impl UnifiedChatRequest {
    /// Checks the structural invariants of a request: at least one message, every
    /// tool call named, and a sane output token bound.
    pub fn validated(self) -> TransformResult<Self> {
        if self.messages.is_empty() {
            return Err(TransformError::InvalidRequest("messages must not be empty".to_string()));
        }

        if let Some(max_tokens) = self.max_tokens
            && max_tokens > MAX_OUTPUT_TOKENS
        {
            return Err(TransformError::InvalidRequest(format!(
                "max_tokens must be between 0 and {MAX_OUTPUT_TOKENS}, got {max_tokens}"
            )));
        }

        let unnamed = self
            .messages
            .iter()
            .flat_map(|message| &message.tool_calls)
            .any(|call| call.name.trim().is_empty());

        if unnamed {
            return Err(TransformError::InvalidRequest("tool calls must have a name".to_string()));
        }

        Ok(self)
    }

    /// All system prompt texts, whether supplied out of band or as system-role messages.
    pub fn system_prompts(&self) -> impl Iterator<Item = &str> {
        let out_of_band = self.system.iter().flat_map(|system| system.texts());

        let in_band = self
            .messages
            .iter()
            .filter(|message| message.role == UnifiedRole::System)
            .flat_map(|message| message.content.texts());

        out_of_band.chain(in_band)
    }

    /// Drops messages that carry nothing: no text, no parts and no tool calls.
    /// Tool results are kept even when empty, the vendor expects an answer for
    /// every call it made.
    pub fn drop_empty_messages(&mut self) {
        self.messages.retain(|message| {
            message.role == UnifiedRole::Tool || !message.content.is_empty() || !message.tool_calls.is_empty()
        });
    }
}

/// System instruction as either a single string or a list of text blocks.
#[derive(Debug, Clone, PartialEq)]
pub enum SystemInstruction {
    Text(String),
    Blocks(Vec<String>),
}

impl SystemInstruction {
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            SystemInstruction::Text(text) => std::slice::from_ref(text),
            SystemInstruction::Blocks(blocks) => blocks,
        };

        slice.iter().map(String::as_str)
    }
}

/// Role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnifiedRole {
    System,
    User,
    Assistant,
    Tool,
}

impl UnifiedRole {
    pub fn as_str(self) -> &'static str {
        match self {
            UnifiedRole::System => "system",
            UnifiedRole::User => "user",
            UnifiedRole::Assistant => "assistant",
            UnifiedRole::Tool => "tool",
        }
    }

    /// Parses a wire role. Unknown roles are treated as user input.
    pub fn parse(role: &str) -> Self {
        match role {
            "system" | "developer" => UnifiedRole::System,
            "assistant" | "model" => UnifiedRole::Assistant,
            "tool" | "function" => UnifiedRole::Tool,
            _ => UnifiedRole::User,
        }
    }
}

impl fmt::Display for UnifiedRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One message of the conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedMessage {
    pub role: UnifiedRole,

    /// Either plain text or a list of typed parts, never both.
    pub content: UnifiedContent,

    /// Tool invocations made by the assistant in this message.
    pub tool_calls: Vec<UnifiedToolCall>,

    /// For role=tool messages, the id of the call being answered.
    pub tool_call_id: Option<String>,
}

impl UnifiedMessage {
    pub fn text(role: UnifiedRole, text: impl Into<String>) -> Self {
        Self {
            role,
            content: UnifiedContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A tool result answering the call with the given id.
    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: UnifiedRole::Tool,
            content: UnifiedContent::Text(text.into()),
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

/// Message content.
#[derive(Debug, Clone, PartialEq)]
pub enum UnifiedContent {
    Text(String),
    Parts(Vec<UnifiedContentPart>),
}

impl Default for UnifiedContent {
    fn default() -> Self {
        UnifiedContent::Text(String::new())
    }
}

impl UnifiedContent {
    pub fn is_empty(&self) -> bool {
        match self {
            UnifiedContent::Text(text) => text.is_empty(),
            UnifiedContent::Parts(parts) => parts.is_empty(),
        }
    }

    /// The text pieces of this content, in order.
    pub fn texts(&self) -> impl Iterator<Item = &str> {
        let (text, parts): (Option<&str>, &[UnifiedContentPart]) = match self {
            UnifiedContent::Text(text) => (Some(text.as_str()), &[]),
            UnifiedContent::Parts(parts) => (None, parts),
        };

        let part_texts = parts.iter().filter_map(|part| match part {
            UnifiedContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        });

        text.into_iter().chain(part_texts)
    }

    /// All text pieces joined together.
    pub fn joined_text(&self) -> String {
        self.texts().collect()
    }

    pub fn parts(&self) -> &[UnifiedContentPart] {
        match self {
            UnifiedContent::Text(_) => &[],
            UnifiedContent::Parts(parts) => parts,
        }
    }
}

/// A typed content part.
#[derive(Debug, Clone, PartialEq)]
pub enum UnifiedContentPart {
    Text {
        text: String,
    },
    /// An image, either a remote URL or a `data:` URL with base64 payload.
    Image {
        url: String,
    },
}

/// A tool the model may call.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedTool {
    pub name: String,
    pub description: Option<String>,
    /// JSON schema of the tool arguments.
    pub parameters: Value,
}

/// A complete tool call.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedToolCall {
    pub id: String,
    pub name: String,
    /// Arguments as a raw JSON string, exactly as produced by the model.
    pub arguments: String,
}

impl UnifiedToolCall {
    /// Creates a tool call, rejecting a missing name.
    pub fn new(id: impl Into<String>, name: impl Into<String>, arguments: impl Into<String>) -> TransformResult<Self> {
        let name = name.into();

        if name.trim().is_empty() {
            return Err(TransformError::InvalidRequest("tool calls must have a name".to_string()));
        }

        Ok(Self {
            id: id.into(),
            name,
            arguments: arguments.into(),
        })
    }

    /// Arguments parsed as a JSON object. Blank arguments become `{}`; arguments
    /// that fail to parse are kept under an `arguments` key.
    pub fn input(&self) -> Value {
        if self.arguments.trim().is_empty() {
            return Value::Object(Default::default());
        }

        serde_json::from_str(&self.arguments).unwrap_or_else(|_| {
            let mut object = serde_json::Map::new();
            object.insert("arguments".to_string(), Value::String(self.arguments.clone()));
            Value::Object(object)
        })
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Any reason this gateway does not know about.
    Other(String),
}

impl FinishReason {
    pub fn parse(reason: &str) -> Self {
        match reason {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "tool_calls" | "function_call" => FinishReason::ToolCalls,
            "content_filter" => FinishReason::ContentFilter,
            other => FinishReason::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::ToolCalls => "tool_calls",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::Other(other) => other,
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token accounting for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Tokens spent on hidden reasoning, included in `completion_tokens`.
    pub reasoning_tokens: u32,
}

/// A complete chat response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedChatResponse {
    pub id: String,
    /// Unix timestamp in seconds.
    pub created: u64,
    pub model: String,
    pub choices: Vec<UnifiedChoice>,
    pub usage: Option<Usage>,
}

/// One completion of a non-streamed response.
#[derive(Debug, Clone, PartialEq)]
pub struct UnifiedChoice {
    pub index: u32,
    pub message: UnifiedMessage,
    /// Hidden reasoning text, when the vendor exposes it.
    pub reasoning: Option<String>,
    pub finish_reason: Option<FinishReason>,
}

/// One chunk of a streamed response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedChunk {
    pub id: Option<String>,
    pub model: Option<String>,
    pub choices: Vec<UnifiedChoiceDelta>,
    pub usage: Option<Usage>,
}

/// Incremental update to one completion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedChoiceDelta {
    pub index: u32,
    pub delta: UnifiedDelta,
    pub finish_reason: Option<FinishReason>,
}

/// The content carried by a streamed chunk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifiedDelta {
    pub role: Option<UnifiedRole>,
    /// Appended text.
    pub content: Option<String>,
    /// Partial tool calls.
    pub tool_calls: Vec<ToolCallFragment>,
    /// Partial reasoning.
    pub thinking: Option<ThinkingFragment>,
}

/// A piece of a tool call delivered during streaming.
///
/// `index` is the vendor's positional index for the call. The id and name are
/// usually only present on the first fragment; the arguments are a partial JSON
/// string to be appended to what came before.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCallFragment {
    pub index: u32,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// A piece of reasoning delivered during streaming.
#[derive(Debug, Clone, PartialEq)]
pub enum ThinkingFragment {
    /// Reasoning text to append.
    Text(String),
    /// Terminal signature of the reasoning block.
    Signature(String),
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request(messages: Vec<UnifiedMessage>) -> UnifiedChatRequest {
        UnifiedChatRequest {
            model: "gpt-4o".to_string(),
            messages,
            ..Default::default()
        }
    }

    #[test]
    fn rejects_empty_conversation() {
        let error = request(Vec::new()).validated().unwrap_err();

        insta::assert_snapshot!(error, @"invalid request: messages must not be empty");
    }

    #[test]
    fn rejects_unnamed_tool_call() {
        let mut message = UnifiedMessage::text(UnifiedRole::Assistant, "");
        message.tool_calls.push(UnifiedToolCall {
            id: "call_1".to_string(),
            name: " ".to_string(),
            arguments: "{}".to_string(),
        });

        let error = request(vec![message]).validated().unwrap_err();

        insta::assert_snapshot!(error, @"invalid request: tool calls must have a name");
    }

    #[test]
    fn tool_call_constructor_rejects_missing_name() {
        assert!(UnifiedToolCall::new("call_1", "", "{}").is_err());
        assert!(UnifiedToolCall::new("call_1", "search", "{}").is_ok());
    }

    #[test]
    fn rejects_oversized_max_tokens() {
        let mut request = request(vec![UnifiedMessage::text(UnifiedRole::User, "hi")]);
        request.max_tokens = Some(MAX_OUTPUT_TOKENS + 1);

        assert!(request.clone().validated().is_err());

        request.max_tokens = Some(MAX_OUTPUT_TOKENS);
        assert!(request.validated().is_ok());
    }

    #[test]
    fn tool_call_input_falls_back_for_invalid_json() {
        let call = UnifiedToolCall::new("call_1", "search", "{\"query\":").unwrap();
        assert_eq!(call.input(), json!({ "arguments": "{\"query\":" }));

        let call = UnifiedToolCall::new("call_1", "search", "  ").unwrap();
        assert_eq!(call.input(), json!({}));

        let call = UnifiedToolCall::new("call_1", "search", "{\"query\":\"rust\"}").unwrap();
        assert_eq!(call.input(), json!({ "query": "rust" }));
    }

    #[test]
    fn empty_messages_are_dropped_except_tool_results() {
        let mut assistant_call = UnifiedMessage::text(UnifiedRole::Assistant, "");
        assistant_call.tool_calls.push(UnifiedToolCall::new("call_1", "search", "{}").unwrap());

        let mut request = request(vec![
            UnifiedMessage::text(UnifiedRole::User, "hello"),
            UnifiedMessage::text(UnifiedRole::Assistant, ""),
            assistant_call,
            UnifiedMessage::tool_result("call_1", ""),
            UnifiedMessage {
                role: UnifiedRole::User,
                content: UnifiedContent::Parts(Vec::new()),
                tool_calls: Vec::new(),
                tool_call_id: None,
            },
        ]);

        request.drop_empty_messages();

        let roles: Vec<_> = request.messages.iter().map(|message| message.role).collect();
        assert_eq!(roles, [UnifiedRole::User, UnifiedRole::Assistant, UnifiedRole::Tool]);
    }

    #[test]
    fn system_prompts_cover_both_representations() {
        let mut request = request(vec![
            UnifiedMessage::text(UnifiedRole::System, "in band"),
            UnifiedMessage::text(UnifiedRole::User, "hi"),
        ]);
        request.system = Some(SystemInstruction::Blocks(vec!["first".to_string(), "second".to_string()]));

        let prompts: Vec<_> = request.system_prompts().collect();

        assert_eq!(prompts, ["first", "second", "in band"]);
    }

    #[test]
    fn unknown_finish_reason_is_preserved() {
        assert_eq!(FinishReason::parse("stop"), FinishReason::Stop);
        assert_eq!(FinishReason::parse("function_call"), FinishReason::ToolCalls);
        assert_eq!(FinishReason::parse("recitation").as_str(), "recitation");
    }
}
