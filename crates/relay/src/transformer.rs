//! The transformer contract.
//!
//! A transformer converts between one wire format and the unified model. It is
//! used in one of two roles: as the *source* it decodes client requests and
//! encodes client responses, as the *target* it encodes vendor requests and
//! decodes vendor responses. Calling the half a transformer does not implement
//! fails with [`TransformError::UnsupportedDirection`].

pub(crate) mod claude;
pub(crate) mod gemini;
pub(crate) mod openai;
mod schema;

use std::sync::Arc;

use axum::response::sse::Event;
use serde::Serialize;

use crate::{
    error::{TransformError, TransformResult},
    messages::unified::{UnifiedChatRequest, UnifiedChatResponse, UnifiedChunk, Usage},
    usage::TokenEstimator,
};

pub(crate) use self::{claude::ClaudeTransformer, gemini::GeminiTransformer, openai::OpenAiTransformer};

/// Converts between a wire format and the unified model.
pub(crate) trait Transformer: Send + Sync {
    /// Short name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Decodes a client request body.
    fn request_out(&self, body: &[u8]) -> TransformResult<UnifiedChatRequest> {
        let _ = body;
        Err(TransformError::unsupported(self.name(), "request_out"))
    }

    /// Encodes a request body for the vendor.
    fn request_in(&self, request: &UnifiedChatRequest) -> TransformResult<Vec<u8>> {
        let _ = request;
        Err(TransformError::unsupported(self.name(), "request_in"))
    }

    /// Decodes a complete vendor response body.
    fn response_out(&self, body: &[u8]) -> TransformResult<UnifiedChatResponse> {
        let _ = body;
        Err(TransformError::unsupported(self.name(), "response_out"))
    }

    /// Creates a decoder for the chunks of one vendor stream.
    fn stream_response_out(&self) -> TransformResult<Box<dyn StreamDecoder>> {
        Err(TransformError::unsupported(self.name(), "stream_response_out"))
    }

    /// Encodes a complete response for the client.
    fn response_in(&self, response: UnifiedChatResponse, context: &ResponseContext) -> TransformResult<EncodedResponse> {
        let _ = (response, context);
        Err(TransformError::unsupported(self.name(), "response_in"))
    }

    /// Creates an encoder for one client stream.
    fn stream_response_in(&self, context: ResponseContext) -> TransformResult<Box<dyn StreamEncoder>> {
        let _ = context;
        Err(TransformError::unsupported(self.name(), "stream_response_in"))
    }
}

/// Decodes the data payloads of one vendor stream.
///
/// A decoder is created per stream and may keep state across chunks.
pub(crate) trait StreamDecoder: Send {
    /// Decodes one payload. `Ok(None)` means the payload carried nothing to relay.
    fn decode(&mut self, data: &str) -> TransformResult<Option<UnifiedChunk>>;
}

/// Encodes unified chunks into client events for one stream.
///
/// Once closed, by a terminal sequence or an abort, an encoder never produces
/// another frame.
pub(crate) trait StreamEncoder: Send {
    /// Encodes one chunk into zero or more frames.
    fn encode(&mut self, chunk: UnifiedChunk) -> Vec<SseFrame>;

    /// Emits the terminal sequence, if it was not emitted yet.
    fn finish(&mut self) -> Vec<SseFrame>;

    /// Closes the encoder without emitting anything.
    fn abort(&mut self);

    fn is_closed(&self) -> bool;

    /// Usage of the stream so far, reconciled once the stream is finished.
    fn usage(&self) -> Usage;
}

/// Per-request data the response encoders need.
#[derive(Clone)]
pub(crate) struct ResponseContext {
    /// Model as requested by the client.
    pub model: String,
    /// Prompt tokens estimated before dispatch.
    pub prompt_tokens: u32,
    /// Whether an OpenAI-shaped client asked for a trailing usage chunk.
    pub include_usage: bool,
    pub estimator: Arc<dyn TokenEstimator>,
}

/// A client response body with the usage it accounts for.
#[derive(Debug)]
pub(crate) struct EncodedResponse {
    pub body: Vec<u8>,
    pub usage: Usage,
}

/// One server-sent event for the client.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SseFrame {
    pub event: Option<&'static str>,
    pub data: String,
}

impl SseFrame {
    /// A frame with a data line only.
    pub fn data(data: impl Into<String>) -> Self {
        Self {
            event: None,
            data: data.into(),
        }
    }

    /// A frame carrying `value` as JSON.
    pub fn json(event: Option<&'static str>, value: &impl Serialize) -> Self {
        let data = sonic_rs::to_string(value).unwrap_or_else(|e| {
            log::error!("Failed to serialize stream event: {e}");
            r#"{"error":"serialization failed"}"#.to_string()
        });

        Self { event, data }
    }

    pub fn into_event(self) -> Event {
        let event = Event::default().data(self.data);

        match self.event {
            Some(name) => event.event(name),
            None => event,
        }
    }
}

pub(crate) fn to_body(value: &impl Serialize) -> TransformResult<Vec<u8>> {
    sonic_rs::to_vec(value).map_err(|e| {
        log::error!("Failed to serialize body: {e}");
        TransformError::InvalidRequest(format!("failed to serialize body: {e}"))
    })
}

pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
