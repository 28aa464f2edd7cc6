use crate::messages::unified::Usage;

/// The usage of one relayed request, as handed to billing.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageRecord {
    pub request_id: String,
    /// Endpoint the request came in on: `chat`, `messages` or `images`.
    pub endpoint: &'static str,
    /// Model as requested by the client.
    pub model: String,
    pub provider: String,
    pub usage: Usage,
}

/// Receives the final usage of every relayed request.
pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Writes usage records to the log.
pub struct LogUsageSink;

impl UsageSink for LogUsageSink {
    fn record(&self, record: UsageRecord) {
        log::info!(
            "Usage for request {} on {} ({} via {}): prompt={} completion={} total={} reasoning={}",
            record.request_id,
            record.endpoint,
            record.model,
            record.provider,
            record.usage.prompt_tokens,
            record.usage.completion_tokens,
            record.usage.total_tokens,
            record.usage.reasoning_tokens,
        );
    }
}
