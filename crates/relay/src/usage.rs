//! Token estimation and usage reconciliation.
//!
//! Some vendors omit usage or report zero completion tokens. The caller still
//! has to be billed for what was delivered, so the completion count is rebuilt
//! from the emitted text and tool calls.

mod sink;

use std::sync::Arc;

use tiktoken_rs::CoreBPE;

pub use self::sink::{LogUsageSink, UsageRecord, UsageSink};
use crate::messages::unified::{UnifiedChatRequest, UnifiedContentPart, Usage};

/// Tokens charged per message for role and framing.
const TOKENS_PER_MESSAGE: u32 = 4;

/// Flat estimate for an image, tool use or tool result part.
const TOKENS_PER_NON_TEXT_PART: u32 = 50;

/// Estimates how many tokens a text costs for a model.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, model: &str, text: &str) -> u32;
}

/// tiktoken based estimator.
///
/// Models of the gpt-3.5 and gpt-4 families use `cl100k_base`, everything else
/// (gpt-4o, o-series and non-OpenAI models) uses `o200k_base`.
pub struct TiktokenEstimator {
    cl100k: Arc<CoreBPE>,
    o200k: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    pub fn new() -> crate::RelayResult<Self> {
        let cl100k = tiktoken_rs::cl100k_base().map_err(|e| {
            log::error!("Failed to load cl100k_base encoding: {e}");
            crate::RelayError::InternalError(None)
        })?;

        let o200k = tiktoken_rs::o200k_base().map_err(|e| {
            log::error!("Failed to load o200k_base encoding: {e}");
            crate::RelayError::InternalError(None)
        })?;

        Ok(Self {
            cl100k: Arc::new(cl100k),
            o200k: Arc::new(o200k),
        })
    }

    fn encoding_for(&self, model: &str) -> &CoreBPE {
        let legacy = (model.starts_with("gpt-4") && !model.starts_with("gpt-4o") && !model.starts_with("gpt-4.1"))
            || model.starts_with("gpt-3.5");

        if legacy { &self.cl100k } else { &self.o200k }
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, model: &str, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let tokens = self.encoding_for(model).encode_with_special_tokens(text).len();

        u32::try_from(tokens).unwrap_or(u32::MAX)
    }
}

/// Estimates a text, counting any non-empty text as at least one token.
fn estimate_non_empty(estimator: &dyn TokenEstimator, model: &str, text: &str) -> u32 {
    if text.is_empty() {
        0
    } else {
        estimator.estimate(model, text).max(1)
    }
}

/// Everything a response emitted, as far as billing is concerned.
#[derive(Debug, Default)]
pub struct EmittedContent {
    text: String,
    tool_calls: Vec<(String, String)>,
}

impl EmittedContent {
    pub fn push_text(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub fn push_tool_call(&mut self, name: &str, arguments: &str) {
        self.tool_calls.push((name.to_string(), arguments.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.tool_calls.is_empty()
    }

    /// Completion tokens for the emitted content: the concatenated text plus
    /// one `tool_use:<name>:<arguments>` string per tool call.
    ///
    /// Zero exactly when nothing was emitted.
    pub fn completion_tokens(&self, estimator: &dyn TokenEstimator, model: &str) -> u32 {
        let text_tokens = estimate_non_empty(estimator, model, &self.text);

        self.tool_calls.iter().fold(text_tokens, |total, (name, arguments)| {
            let serialized = format!("tool_use:{name}:{arguments}");
            total.saturating_add(estimate_non_empty(estimator, model, &serialized))
        })
    }
}

/// Fills in usage the vendor left out.
///
/// Vendor usage is kept when it reports completion tokens. Otherwise the
/// completion count is rebuilt from `emitted`; the prompt count falls back to
/// `prompt_estimate` when the vendor reported none either.
pub fn reconcile(
    vendor: Option<Usage>,
    prompt_estimate: u32,
    emitted: &EmittedContent,
    estimator: &dyn TokenEstimator,
    model: &str,
) -> Usage {
    let mut usage = vendor.unwrap_or_default();

    if usage.prompt_tokens == 0 {
        usage.prompt_tokens = prompt_estimate;
    }

    if usage.completion_tokens == 0 {
        usage.completion_tokens = emitted.completion_tokens(estimator, model);
        log::debug!(
            "Vendor omitted completion usage, estimated {} tokens for model {model}",
            usage.completion_tokens
        );
    }

    usage.total_tokens = usage.prompt_tokens.saturating_add(usage.completion_tokens);

    usage
}

/// Estimates the prompt size of a request.
///
/// Every message costs a fixed framing overhead plus its text, and images are
/// charged a flat amount. System instructions and tool
/// definitions are counted as text.
pub fn estimate_prompt_tokens(request: &UnifiedChatRequest, estimator: &dyn TokenEstimator) -> u32 {
    let model = request.model.as_str();
    let mut total = 0u32;

    if let Some(system) = &request.system {
        for text in system.texts() {
            total = total.saturating_add(estimator.estimate(model, text));
        }
    }

    for message in &request.messages {
        total = total.saturating_add(TOKENS_PER_MESSAGE);

        for text in message.content.texts() {
            total = total.saturating_add(estimator.estimate(model, text));
        }

        let non_text = message
            .content
            .parts()
            .iter()
            .filter(|part| !matches!(part, UnifiedContentPart::Text { .. }))
            .count();

        total = total.saturating_add(TOKENS_PER_NON_TEXT_PART.saturating_mul(non_text as u32));

        for call in &message.tool_calls {
            total = total.saturating_add(estimator.estimate(model, &call.name));
            total = total.saturating_add(estimator.estimate(model, &call.arguments));
        }
    }

    for tool in &request.tools {
        total = total.saturating_add(estimator.estimate(model, &tool.name));

        if let Some(description) = &tool.description {
            total = total.saturating_add(estimator.estimate(model, description));
        }

        total = total.saturating_add(estimator.estimate(model, &tool.parameters.to_string()));
    }

    total
}
