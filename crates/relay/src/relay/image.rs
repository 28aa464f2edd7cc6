//! Image generation, requested in the OpenAI or the Gemini `:predict` format
//! and always answered in the OpenAI format.

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use config::ProviderType;
use serde_json::{Map, Value};

use super::Relay;
use crate::{
    error::{RelayError, RelayResult, TransformError},
    messages::{
        gemini::{PredictInstance, PredictRequest, PredictResponse},
        openai::{ImageData, ImageGenerationRequest, ImageGenerationResponse},
        unified::Usage,
    },
    moderation::Verdict,
    request::RequestContext,
    transformer::unix_now,
    usage::UsageRecord,
};

const DEFAULT_IMAGE_MODEL: &str = "dall-e-2";

/// Completion tokens billed per generated image.
const TOKENS_PER_IMAGE: u32 = 258;

/// An image request in either format.
#[derive(Debug, Clone, PartialEq)]
struct ImageRequest {
    model: String,
    prompt: String,
    n: u32,
    size: Option<String>,
    quality: Option<String>,
    response_format: Option<String>,
    style: Option<String>,
    user: Option<String>,
    aspect_ratio: Option<String>,
    /// Gemini parameters without an OpenAI counterpart, passed through.
    extra: Map<String, Value>,
}

impl ImageRequest {
    fn from_openai(request: ImageGenerationRequest) -> Self {
        let model = match request.model.trim() {
            "" => DEFAULT_IMAGE_MODEL.to_string(),
            model => model.to_string(),
        };

        let mut size = request.size.filter(|size| !size.is_empty());
        let mut quality = request.quality.filter(|quality| !quality.is_empty());

        if model.starts_with("dall-e") {
            size.get_or_insert_with(|| "1024x1024".to_string());
            quality.get_or_insert_with(|| "standard".to_string());
        }

        Self {
            model,
            prompt: request.prompt,
            n: request.n.max(1),
            size,
            quality,
            response_format: request.response_format,
            style: request.style,
            user: request.user,
            aspect_ratio: None,
            extra: Map::new(),
        }
    }

    fn from_predict(model: &str, request: PredictRequest) -> RelayResult<Self> {
        let Some(instance) = request.instances.into_iter().next() else {
            return Err(RelayError::InvalidRequest("no instances provided".to_string()));
        };

        let mut n = 1;
        let mut aspect_ratio = None;
        let mut extra = Map::new();

        for (key, value) in request.parameters {
            match (key.as_str(), &value) {
                ("sampleCount", Value::Number(count)) => {
                    n = count.as_u64().and_then(|count| u32::try_from(count).ok()).unwrap_or(1).max(1);
                }
                ("aspectRatio", Value::String(ratio)) if !ratio.is_empty() => aspect_ratio = Some(ratio.clone()),
                _ => {
                    extra.insert(key, value);
                }
            }
        }

        Ok(Self {
            model: model.to_string(),
            prompt: instance.prompt,
            n,
            size: None,
            quality: None,
            response_format: None,
            style: None,
            user: None,
            aspect_ratio,
            extra,
        })
    }

    fn into_openai(self) -> ImageGenerationRequest {
        ImageGenerationRequest {
            model: self.model,
            prompt: self.prompt,
            n: self.n,
            size: self.size,
            quality: self.quality,
            response_format: self.response_format,
            style: self.style,
            user: self.user,
        }
    }

    fn into_predict(self) -> PredictRequest {
        let aspect_ratio = self.aspect_ratio.unwrap_or_else(|| {
            match self.size.as_deref() {
                Some("1024x1792") => "9:16",
                Some("1792x1024") => "16:9",
                _ => "1:1",
            }
            .to_string()
        });

        let mut parameters = Map::new();
        parameters.insert("sampleCount".to_string(), Value::from(self.n));
        parameters.insert("personGeneration".to_string(), Value::from("allow_adult"));
        parameters.extend(self.extra);
        parameters.insert("aspectRatio".to_string(), Value::from(aspect_ratio));

        PredictRequest {
            instances: vec![PredictInstance { prompt: self.prompt }],
            parameters,
        }
    }
}

fn predictions_to_openai(response: PredictResponse) -> RelayResult<ImageGenerationResponse> {
    if response.predictions.is_empty() {
        return Err(RelayError::InternalError(Some("no image generated".to_string())));
    }

    let data = response
        .predictions
        .into_iter()
        .filter_map(|prediction| prediction.bytes_base64_encoded.filter(|bytes| !bytes.is_empty()))
        .map(|b64_json| ImageData {
            b64_json: Some(b64_json),
            ..Default::default()
        })
        .collect();

    Ok(ImageGenerationResponse {
        created: unix_now(),
        data,
    })
}

impl Relay {
    pub(crate) async fn image_generations(&self, body: &[u8], context: RequestContext) -> RelayResult<Response> {
        let request: ImageGenerationRequest =
            sonic_rs::from_slice(body).map_err(|e| TransformError::UnsupportedSourceFormat(e.to_string()))?;

        self.generate_image(ImageRequest::from_openai(request), context).await
    }

    pub(crate) async fn predict(&self, model: &str, body: &[u8], context: RequestContext) -> RelayResult<Response> {
        let request: PredictRequest =
            sonic_rs::from_slice(body).map_err(|e| TransformError::UnsupportedSourceFormat(e.to_string()))?;

        self.generate_image(ImageRequest::from_predict(model, request)?, context).await
    }

    async fn generate_image(&self, request: ImageRequest, context: RequestContext) -> RelayResult<Response> {
        if request.prompt.trim().is_empty() {
            return Err(RelayError::InvalidRequest("prompt is required".to_string()));
        }

        let upstream = self.registry.resolve(&request.model).await?;

        if let Verdict::Rejected { reason, code } = self.moderator.check(&request.prompt).await? {
            return Err(RelayError::ContentPolicy { reason, code });
        }

        let model = request.model.clone();
        let prompt_tokens = self.estimator.estimate(&model, &request.prompt);
        let url = upstream.image_url(&model)?;

        let (response, completion_tokens) = if upstream.kind() == ProviderType::Gemini {
            let body = to_vec(&request.into_predict())?;
            let bytes = read_body(upstream.post(&url, body).await?, upstream.name()).await?;

            let predictions: PredictResponse = sonic_rs::from_slice(&bytes)
                .map_err(|e| TransformError::MalformedUpstreamChunk(e.to_string()))?;

            let images = u32::try_from(predictions.predictions.len()).unwrap_or(u32::MAX);

            (predictions_to_openai(predictions)?, images.saturating_mul(TOKENS_PER_IMAGE))
        } else {
            let body = to_vec(&request.into_openai())?;
            let bytes = read_body(upstream.post(&url, body).await?, upstream.name()).await?;

            let response: ImageGenerationResponse = sonic_rs::from_slice(&bytes)
                .map_err(|e| TransformError::MalformedUpstreamChunk(e.to_string()))?;

            (response, 0)
        };

        self.record_usage(UsageRecord {
            request_id: context.request_id,
            endpoint: "images",
            model,
            provider: upstream.name().to_string(),
            usage: Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens.saturating_add(completion_tokens),
                reasoning_tokens: 0,
            },
        });

        Ok(Json(response).into_response())
    }
}

fn to_vec(value: &impl serde::Serialize) -> RelayResult<Vec<u8>> {
    sonic_rs::to_vec(value).map_err(|e| RelayError::InvalidRequest(format!("Failed to serialize request: {e}")))
}

async fn read_body(response: reqwest::Response, provider: &str) -> RelayResult<axum::body::Bytes> {
    response.bytes().await.map_err(|e| {
        log::error!("Failed to read response body from provider '{provider}': {e}");
        RelayError::ConnectionError(format!("Failed to read response from {provider}: {e}"))
    })
}
