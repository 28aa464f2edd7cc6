//! Pairs a client-facing transformer with a vendor transformer.

use crate::{
    error::{TransformError, TransformResult},
    messages::unified::{UnifiedChatRequest, Usage},
    transformer::{EncodedResponse, ResponseContext, SseFrame, StreamDecoder, StreamEncoder, Transformer},
};

/// Drives one request through the unified model: the *source* speaks the
/// client's format, the *target* the vendor's.
///
/// The manager holds nothing but the two transformers. Stream state lives in
/// the [`StreamPipeline`] created for each streamed response.
#[derive(Clone, Copy)]
pub(crate) struct TransformManager {
    source: &'static dyn Transformer,
    target: &'static dyn Transformer,
}

/// A decoded client request and its vendor encoding.
#[derive(Debug)]
pub(crate) struct ProcessedRequest {
    pub request: UnifiedChatRequest,
    pub body: Vec<u8>,
}

impl TransformManager {
    pub fn new(source: &'static dyn Transformer, target: &'static dyn Transformer) -> Self {
        Self { source, target }
    }

    pub fn process_request(&self, body: &[u8]) -> TransformResult<ProcessedRequest> {
        let mut request = self.source.request_out(body)?;
        request.drop_empty_messages();

        log::debug!(
            "Converting {} request for model {} with {} messages into {} format",
            self.source.name(),
            request.model,
            request.messages.len(),
            self.target.name()
        );

        let body = self.target.request_in(&request)?;

        Ok(ProcessedRequest { request, body })
    }

    pub fn process_response(&self, body: &[u8], context: &ResponseContext) -> TransformResult<EncodedResponse> {
        let response = self.target.response_out(body)?;
        self.source.response_in(response, context)
    }

    pub fn process_stream_response(&self, context: ResponseContext) -> TransformResult<StreamPipeline> {
        Ok(StreamPipeline {
            decoder: self.target.stream_response_out()?,
            encoder: self.source.stream_response_in(context)?,
        })
    }
}

/// The decoder of one vendor stream feeding the encoder of one client stream.
pub(crate) struct StreamPipeline {
    decoder: Box<dyn StreamDecoder>,
    encoder: Box<dyn StreamEncoder>,
}

impl StreamPipeline {
    /// Converts one upstream payload into client frames. Payloads that fail to
    /// decode are skipped.
    pub fn push(&mut self, data: &str) -> Vec<SseFrame> {
        if self.encoder.is_closed() {
            return Vec::new();
        }

        match self.decoder.decode(data) {
            Ok(Some(chunk)) => self.encoder.encode(chunk),
            Ok(None) => Vec::new(),
            Err(error @ TransformError::MalformedUpstreamChunk(_)) => {
                log::warn!("Skipping upstream chunk: {error}");
                Vec::new()
            }
            Err(error) => {
                log::warn!("Skipping upstream chunk that cannot be relayed: {error}");
                Vec::new()
            }
        }
    }

    pub fn finish(&mut self) -> Vec<SseFrame> {
        self.encoder.finish()
    }

    pub fn abort(&mut self) {
        self.encoder.abort();
    }

    pub fn is_closed(&self) -> bool {
        self.encoder.is_closed()
    }

    pub fn usage(&self) -> Usage {
        self.encoder.usage()
    }
}
