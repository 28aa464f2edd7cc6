//! Protocol relay between chat clients and upstream model vendors.
//!
//! Clients speak the OpenAI Chat Completions or the Claude Messages format, the
//! upstreams speak OpenAI, Gemini or Anthropic Messages. Every request is decoded into a unified
//! model, dispatched to the upstream serving the requested model, and answered
//! in the client's format, streamed or not.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::Response,
    routing::post,
};

mod error;
mod manager;
mod messages;
mod moderation;
mod provider;
mod relay;
mod request;
mod stream;
mod transformer;
mod usage;

pub use error::{ClaudeErrorResponse, ClaudeResult, RelayError, RelayResult, TransformError};
pub use messages::unified::Usage;
pub use moderation::{AllowAll, KeywordModerator, Moderator, Verdict};
pub use provider::{ConfigProviderRegistry, ProviderRegistry, Upstream};
pub use relay::RelayBuilder;
pub use usage::{LogUsageSink, TiktokenEstimator, TokenEstimator, UsageRecord, UsageSink};

use relay::Relay;
use transformer::OpenAiTransformer;

const PREDICT_SUFFIX: &str = ":predict";

/// Creates an axum router for the relay endpoints.
pub fn router(config: &config::Config) -> anyhow::Result<Router> {
    let builder = RelayBuilder::new(&config.relay).map_err(|e| anyhow::anyhow!("Failed to initialize relay: {e}"))?;

    Ok(routes(builder))
}

/// Mounts the endpoints of an assembled relay under its configured path.
pub fn routes(builder: RelayBuilder) -> Router {
    let (path, relay) = builder.build();

    let routes = Router::new()
        .route("/chat/completions", post(chat_completions))
        .route("/messages", post(messages))
        .route("/images/generations", post(image_generations))
        .route("/models/{action}", post(model_action))
        .with_state(Arc::new(relay));

    Router::new().nest(&path, routes)
}

/// Handle OpenAI chat completion requests, streamed when the body asks for it.
async fn chat_completions(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let context = request::extract_context(&headers);
    log::debug!("Chat completions request {} received", context.request_id);

    relay.chat(&OpenAiTransformer, "chat", &body, context).await
}

/// Handle Claude messages requests. Errors are reported in Claude's error shape.
async fn messages(State(relay): State<Arc<Relay>>, headers: HeaderMap, body: Bytes) -> ClaudeResult<Response> {
    let context = request::extract_context(&headers);
    log::debug!("Messages request {} received", context.request_id);

    Ok(relay.messages(&body, context).await?)
}

async fn image_generations(
    State(relay): State<Arc<Relay>>,
    headers: HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let context = request::extract_context(&headers);
    log::debug!("Image generation request {} received", context.request_id);

    relay.image_generations(&body, context).await
}

/// Handle `/models/{model}:predict`, the Gemini image generation call.
async fn model_action(
    State(relay): State<Arc<Relay>>,
    Path(action): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> RelayResult<Response> {
    let Some(model) = action.strip_suffix(PREDICT_SUFFIX).filter(|model| !model.is_empty()) else {
        return Err(RelayError::InvalidRequest(format!("unsupported model action '{action}'")));
    };

    let context = request::extract_context(&headers);
    log::debug!("Predict request {} received for model {model}", context.request_id);

    relay.predict(model, &body, context).await
}
