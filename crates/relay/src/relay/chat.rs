use std::convert::Infallible;

use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response, Sse},
};
use tokio::sync::mpsc;

use super::{Relay, probe_model};
use crate::{
    error::{RelayError, RelayResult},
    manager::{ProcessedRequest, TransformManager},
    moderation,
    request::RequestContext,
    stream::{
        relay_stream,
        upstream::{GuardedStream, UpstreamReader},
    },
    transformer::{ResponseContext, SseFrame, Transformer},
    usage::{self, UsageRecord},
};

impl Relay {
    /// Relays a chat request spoken in `source`'s format to whichever upstream
    /// serves the requested model, answering in the same format.
    pub(crate) async fn chat(
        &self,
        source: &'static dyn Transformer,
        endpoint: &'static str,
        body: &[u8],
        context: RequestContext,
    ) -> RelayResult<Response> {
        let model = probe_model(body)?;
        let upstream = self.registry.resolve(&model).await?;
        let manager = TransformManager::new(source, upstream.transformer());

        let ProcessedRequest { request, body } = manager.process_request(body)?;

        moderation::moderate(self.moderator.as_ref(), &request).await?;

        let response_context = ResponseContext {
            model: request.model.clone(),
            prompt_tokens: usage::estimate_prompt_tokens(&request, self.estimator.as_ref()),
            include_usage: request.include_usage,
            estimator: self.estimator.clone(),
        };

        log::debug!(
            "Request {} for model {} dispatched to provider '{}', streaming: {}",
            context.request_id,
            request.model,
            upstream.name(),
            request.stream
        );

        let url = upstream.chat_url(&request.model, request.stream);
        let response = upstream.post(&url, body).await?;

        let mut record = UsageRecord {
            request_id: context.request_id.clone(),
            endpoint,
            model: request.model.clone(),
            provider: upstream.name().to_string(),
            usage: Default::default(),
        };

        if !request.stream {
            let bytes = response.bytes().await.map_err(|e| {
                log::error!("Failed to read response body from provider '{}': {e}", upstream.name());
                RelayError::ConnectionError(format!("Failed to read response from {}: {e}", upstream.name()))
            })?;

            let encoded = manager.process_response(&bytes, &response_context)?;

            record.usage = encoded.usage;
            self.record_usage(record);

            return Ok(([(CONTENT_TYPE, "application/json")], encoded.body).into_response());
        }

        let pipeline = manager.process_stream_response(response_context)?;
        let token = context.cancellation.clone();
        let reader = UpstreamReader::spawn(response, upstream.framing(), token.clone(), self.stream_buffer);
        let (events_tx, events) = mpsc::channel(self.stream_buffer.max(1));
        let usage_sink = self.usage_sink.clone();

        tokio::spawn(async move {
            record.usage = relay_stream(pipeline, reader, events_tx, token).await;
            usage_sink.record(record);
        });

        Ok(sse_response(events, context))
    }
}

/// Streams frames from `events` to the client as they arrive.
pub(super) fn sse_response(events: mpsc::Receiver<SseFrame>, context: RequestContext) -> Response {
    let stream = futures::stream::unfold(events, |mut events| async move {
        let frame = events.recv().await?;
        Some((Ok::<_, Infallible>(frame.into_event()), events))
    });

    Sse::new(GuardedStream::new(stream, context.cancellation)).into_response()
}
