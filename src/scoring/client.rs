use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};

use super::error::ScoringError;
use super::types::{
    ChatMessage, ChatRequest, ChatResponse, Completion, ContentPart, ImagePayload, ImageUrl,
};

/// Fixed instruction sent with every image.
pub const SCORING_PROMPT: &str = "\
You are an expert in image quality assessment.
Judge whether the image is AI-generated, whether it carries a visible watermark (and where),
and rate its overall quality from 0 to 10 weighting clarity 40%, composition 30%, color 20%
and content plausibility 10%. Subtract 2.0 points (minimum 0) if the image is AI-generated.
You may reason in prose first, but you must end with exactly this XML block, without code fences:
<result>
<is_ai_generated>true or false</is_ai_generated>
<watermark_present>true or false</watermark_present>
<watermark_location>where the watermark is, or none</watermark_location>
<score>number</score>
<feedback>short justification</feedback>
</result>";

/// Anything that can score one image. The pool only talks to this trait, so
/// tests substitute scripted services for the HTTP client.
#[async_trait]
pub trait ScoreService: Send + Sync {
    async fn score(&self, payload: &ImagePayload) -> Result<Completion, ScoringError>;
}

/// Connection settings for [`ScoringClient`].
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub endpoint: String,
    pub api_token: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub request_timeout: Duration,
}

/// Chat-completions client for a vision-language model.
pub struct ScoringClient {
    client: Client,
    settings: ClientSettings,
}

impl ScoringClient {
    pub fn new(settings: ClientSettings) -> Result<Self, ScoringError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(settings.request_timeout)
            .pool_idle_timeout(Duration::from_secs(3600))
            .build()?;
        Ok(Self { client, settings })
    }

    fn build_request(&self, payload: &ImagePayload) -> ChatRequest {
        ChatRequest {
            model: self.settings.model.clone(),
            messages: vec![ChatMessage {
                role: "user".into(),
                content: vec![
                    ContentPart::Text {
                        text: SCORING_PROMPT.to_string(),
                    },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: payload.data_url(),
                            detail: "low".into(),
                        },
                    },
                ],
            }],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        }
    }
}

#[async_trait]
impl ScoreService for ScoringClient {
    async fn score(&self, payload: &ImagePayload) -> Result<Completion, ScoringError> {
        let req = self.build_request(payload);
        let response = self
            .client
            .post(&self.settings.endpoint)
            .bearer_auth(&self.settings.api_token)
            .json(&req)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(1000);
            return Err(ScoringError::RateLimited {
                retry_after_ms: retry_after,
            });
        }

        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(ScoringError::ApiError {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let body = response.bytes().await.map_err(transport_error)?;
        let parsed: ChatResponse = serde_json::from_slice(&body)
            .map_err(|e| ScoringError::Malformed(format!("undecodable body: {e}")))?;
        completion_from(parsed)
    }
}

/// Pull the assistant text out of a decoded response.
pub fn completion_from(response: ChatResponse) -> Result<Completion, ScoringError> {
    let usage = response.usage;
    let content = response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ScoringError::Malformed("response has no choices".into()))?;
    Ok(Completion { content, usage })
}

fn transport_error(err: reqwest::Error) -> ScoringError {
    if err.is_timeout() {
        ScoringError::Timeout
    } else if err.is_decode() {
        ScoringError::Malformed(err.to_string())
    } else {
        ScoringError::Network(err)
    }
}

/// Prefer a JSON `message` (top level or under `error`), else a truncated body.
fn error_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        let message = value
            .get("message")
            .or_else(|| value.get("error").and_then(|e| e.get("message")))
            .and_then(|m| m.as_str());
        if let Some(message) = message {
            return message.to_string();
        }
    }
    body.chars().take(200).collect()
}
