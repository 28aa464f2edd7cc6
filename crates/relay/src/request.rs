use axum::http::HeaderMap;
use tokio_util::sync::CancellationToken;

/// Header carrying a caller-supplied request id.
const REQUEST_ID_HEADER: &str = "x-request-id";

/// Runtime context of one relayed request.
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    /// Identifies the request in logs.
    pub request_id: String,

    /// Cancelled when the client goes away. Streaming stops reading upstream
    /// as soon as this fires.
    pub cancellation: CancellationToken,
}

/// Extract request context from request headers.
pub(crate) fn extract_context(headers: &HeaderMap) -> RequestContext {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

    RequestContext {
        request_id,
        cancellation: CancellationToken::new(),
    }
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn request_id_comes_from_the_header() {
        let mut headers = HeaderMap::new();
        headers.insert(REQUEST_ID_HEADER, HeaderValue::from_static("req-42"));

        assert_eq!(extract_context(&headers).request_id, "req-42");
        assert_eq!(extract_context(&HeaderMap::new()).request_id.len(), 32);
    }
}
