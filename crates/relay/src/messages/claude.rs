//! Claude Messages API wire types.
//!
//! Requests are accepted leniently: `system` and message `content` may be a
//! plain string or a list of blocks, and unknown block types are ignored rather
//! than rejected. The request types are also what an Anthropic upstream is
//! sent; its answers are read into the `ClaudeUpstream*` types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request body of `POST /v1/messages`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeRequest {
    pub model: String,

    pub messages: Vec<ClaudeMessage>,

    /// System prompt, either a string or a list of text blocks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<ClaudeSystem>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ClaudeTool>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
}

/// The `system` field of a request.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClaudeSystem {
    Text(String),
    Blocks(Vec<ClaudeSystemBlock>),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeSystemBlock {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<String>,
    #[serde(default)]
    pub text: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeMessage {
    pub role: String,
    pub content: ClaudeMessageContent,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClaudeMessageContent {
    Text(String),
    Blocks(Vec<ClaudeContentBlock>),
}

/// Content block of a request message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ClaudeImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ClaudeToolResultContent>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
    /// Block types without a unified counterpart (thinking, documents, ...).
    #[serde(other)]
    Unsupported,
}

/// Image source of an image block.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeImageSource {
    Base64 { media_type: String, data: String },
    Url { url: String },
}

/// Content of a tool result: a string, or a list of blocks of which the text
/// blocks are kept.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ClaudeToolResultContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl ClaudeToolResultContent {
    pub fn into_text(self) -> String {
        match self {
            ClaudeToolResultContent::Text(text) => text,
            ClaudeToolResultContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClaudeTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Value,
}

/// Non-streamed response body.
#[derive(Debug, Clone, Serialize)]
pub struct ClaudeResponse {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: &'static str,
    pub role: &'static str,
    pub content: Vec<ClaudeResponseBlock>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

/// Content block of a response, also used as the `content_block` of a
/// `content_block_start` event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    Thinking {
        thinking: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
}

/// Why Claude stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClaudeUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Server-sent events of a streamed response.
///
/// A stream starts with `message_start`, runs zero or more content block
/// lifecycles (`content_block_start`, `content_block_delta`*, `content_block_stop`),
/// reports the stop reason and usage in `message_delta` and ends with `message_stop`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeStreamEvent {
    MessageStart {
        message: ClaudeStreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: ClaudeResponseBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: ClaudeContentDelta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        delta: ClaudeMessageDelta,
        usage: ClaudeUsage,
    },
    MessageStop,
}

impl ClaudeStreamEvent {
    /// The SSE `event:` name for this event.
    pub fn name(&self) -> &'static str {
        match self {
            ClaudeStreamEvent::MessageStart { .. } => "message_start",
            ClaudeStreamEvent::ContentBlockStart { .. } => "content_block_start",
            ClaudeStreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            ClaudeStreamEvent::ContentBlockStop { .. } => "content_block_stop",
            ClaudeStreamEvent::MessageDelta { .. } => "message_delta",
            ClaudeStreamEvent::MessageStop => "message_stop",
        }
    }
}

/// The message announced by `message_start`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaudeStreamMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub object_type: &'static str,
    pub role: &'static str,
    pub content: Vec<ClaudeResponseBlock>,
    pub model: String,
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
    pub usage: ClaudeUsage,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeContentDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClaudeMessageDelta {
    pub stop_reason: Option<StopReason>,
    pub stop_sequence: Option<String>,
}

/// A message as answered by an Anthropic upstream, either as the complete
/// response body or as the `message` of a `message_start` event.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeUpstreamMessage {
    #[serde(rename = "type", default)]
    pub object_type: String,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub content: Vec<ClaudeUpstreamBlock>,
    #[serde(default)]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub usage: ClaudeUpstreamUsage,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeUpstreamBlock {
    Text {
        #[serde(default)]
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    /// Redacted thinking, server tool results and whatever comes next.
    #[serde(other)]
    Other,
}

/// Upstream token counts. Cache reads and writes are billed as input.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ClaudeUpstreamUsage {
    #[serde(default)]
    pub input_tokens: Option<u32>,
    #[serde(default)]
    pub output_tokens: Option<u32>,
    #[serde(default)]
    pub cache_creation_input_tokens: Option<u32>,
    #[serde(default)]
    pub cache_read_input_tokens: Option<u32>,
}

impl ClaudeUpstreamUsage {
    pub fn prompt_tokens(&self) -> u32 {
        [
            self.input_tokens,
            self.cache_creation_input_tokens,
            self.cache_read_input_tokens,
        ]
        .into_iter()
        .flatten()
        .fold(0, u32::saturating_add)
    }
}

/// A server-sent event of an Anthropic upstream stream.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeUpstreamEvent {
    MessageStart {
        message: ClaudeUpstreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: ClaudeUpstreamBlock,
    },
    ContentBlockDelta {
        index: u32,
        delta: ClaudeUpstreamDelta,
    },
    MessageDelta {
        #[serde(default)]
        delta: ClaudeUpstreamStop,
        #[serde(default)]
        usage: Option<ClaudeUpstreamUsage>,
    },
    Error {
        error: ClaudeUpstreamError,
    },
    /// `content_block_stop`, `message_stop` and `ping`.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClaudeUpstreamDelta {
    TextDelta {
        text: String,
    },
    InputJsonDelta {
        partial_json: String,
    },
    ThinkingDelta {
        thinking: String,
    },
    SignatureDelta {
        signature: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaudeUpstreamStop {
    #[serde(default)]
    pub stop_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeUpstreamError {
    #[serde(rename = "type", default)]
    pub error_type: String,
    #[serde(default)]
    pub message: String,
}

/// Error envelope of the Messages API.
#[derive(Debug, Clone, Serialize)]
pub struct ClaudeError {
    #[serde(rename = "type")]
    pub object_type: &'static str,
    pub error: ClaudeErrorDetails,
}

impl ClaudeError {
    pub fn new(error_type: &str, message: String) -> Self {
        Self {
            object_type: "error",
            error: ClaudeErrorDetails {
                error_type: error_type.to_string(),
                message,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ClaudeErrorDetails {
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
}
