use std::sync::Arc;

use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::sync::mpsc;

use super::{Relay, chat::sse_response};
use crate::{
    error::{RelayResult, TransformError},
    messages::{
        claude::ClaudeSystem,
        unified::{FinishReason, UnifiedChatResponse, UnifiedChoice, UnifiedMessage, UnifiedRole, Usage},
    },
    request::RequestContext,
    transformer::{ClaudeTransformer, ResponseContext, Transformer, unix_now},
};

/// System prompt fragments of the housekeeping requests coding assistants send
/// alongside the real conversation.
const BACKGROUND_TASK_MARKERS: [&str; 3] = [
    "Summarize this coding conversation",
    "write a 5-10 word title",
    "Analyze if this message indicates a new conversation topic",
];

#[derive(Deserialize)]
struct BackgroundProbe {
    #[serde(default)]
    model: String,
    #[serde(default)]
    system: Option<ClaudeSystem>,
    #[serde(default)]
    stream: Option<bool>,
}

impl BackgroundProbe {
    fn is_background_task(&self) -> bool {
        let texts: Vec<&str> = match &self.system {
            Some(ClaudeSystem::Text(text)) => vec![text.as_str()],
            Some(ClaudeSystem::Blocks(blocks)) => blocks.iter().map(|block| block.text.as_str()).collect(),
            None => Vec::new(),
        };

        texts
            .iter()
            .any(|text| BACKGROUND_TASK_MARKERS.iter().any(|marker| text.contains(marker)))
    }
}

impl Relay {
    /// Relays a Claude Messages request.
    pub(crate) async fn messages(&self, body: &[u8], context: RequestContext) -> RelayResult<Response> {
        if self.background_tasks {
            let probe: BackgroundProbe =
                sonic_rs::from_slice(body).map_err(|e| TransformError::UnsupportedSourceFormat(e.to_string()))?;

            if probe.is_background_task() {
                log::debug!("Answering background task request {} locally", context.request_id);
                return self.background_response(probe, context);
            }
        }

        self.chat(&ClaudeTransformer, "messages", body, context).await
    }

    /// An empty `end_turn` message with zero usage.
    fn background_response(&self, probe: BackgroundProbe, context: RequestContext) -> RelayResult<Response> {
        let response_context = ResponseContext {
            model: probe.model,
            prompt_tokens: 0,
            include_usage: false,
            estimator: Arc::clone(&self.estimator),
        };

        if probe.stream.unwrap_or(false) {
            let mut encoder = ClaudeTransformer.stream_response_in(response_context)?;
            let frames = encoder.finish();

            let (events_tx, events) = mpsc::channel(frames.len().max(1));

            for frame in frames {
                // the channel holds every frame
                let _ = events_tx.try_send(frame);
            }

            return Ok(sse_response(events, context));
        }

        let response = UnifiedChatResponse {
            id: uuid::Uuid::new_v4().simple().to_string(),
            created: unix_now(),
            model: response_context.model.clone(),
            choices: vec![UnifiedChoice {
                index: 0,
                message: UnifiedMessage::text(UnifiedRole::Assistant, ""),
                reasoning: None,
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Some(Usage::default()),
        };

        let encoded = ClaudeTransformer.response_in(response, &response_context)?;

        Ok(([(CONTENT_TYPE, "application/json")], encoded.body).into_response())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(body: &str) -> BackgroundProbe {
        sonic_rs::from_str(body).unwrap()
    }

    #[test]
    fn recognizes_housekeeping_prompts() {
        let title = probe(
            r#"{"model":"claude-3-5-haiku","system":[{"type":"text","text":"Please write a 5-10 word title for the following conversation"}],"messages":[]}"#,
        );
        assert!(title.is_background_task());

        let summary = probe(r#"{"model":"m","system":"Summarize this coding conversation in under 50 characters."}"#);
        assert!(summary.is_background_task());

        let regular = probe(r#"{"model":"m","system":"You are a helpful assistant.","messages":[]}"#);
        assert!(!regular.is_background_task());

        let no_system = probe(r#"{"model":"m","messages":[]}"#);
        assert!(!no_system.is_background_task());
    }
}
