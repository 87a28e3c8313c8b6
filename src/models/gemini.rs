use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::http::{self, check_response, parse_json, send_error};
use crate::models::provider::{
    CallContext, Capability, MediaOutput, MediaPrompt, Message, MessageRole, ProviderAdapter, StreamChunk,
    TextOutput, TextPrompt, TextStream, TokenUsage,
};
use crate::storage::AssetCategory;

const PROVIDER: &str = "gemini";

pub struct GeminiProvider {
    client: Client,
    base_url: String,
}

impl GeminiProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url(
            "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout,
        )
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn convert_messages(&self, messages: &[Message]) -> (Option<GeminiContent>, Vec<GeminiContent>) {
        let mut gemini_contents = Vec::new();
        let mut system_parts = Vec::new();

        for message in messages {
            match message.role {
                MessageRole::System => system_parts.push(GeminiPart::text(&message.content)),
                MessageRole::User => gemini_contents.push(GeminiContent {
                    role: Some("user".to_string()),
                    parts: vec![GeminiPart::text(&message.content)],
                }),
                // Gemini uses "model" instead of "assistant"
                MessageRole::Assistant => gemini_contents.push(GeminiContent {
                    role: Some("model".to_string()),
                    parts: vec![GeminiPart::text(&message.content)],
                }),
            }
        }

        if gemini_contents.is_empty() && !system_parts.is_empty() {
            gemini_contents.push(GeminiContent {
                role: Some("user".to_string()),
                parts: system_parts,
            });
            return (None, gemini_contents);
        }

        let system = (!system_parts.is_empty()).then(|| GeminiContent {
            role: None,
            parts: system_parts,
        });
        (system, gemini_contents)
    }

    fn build_request(&self, prompt: &TextPrompt) -> GeminiRequest {
        let (system_instruction, contents) = self.convert_messages(&prompt.messages);
        let generation_config = (prompt.temperature.is_some() || prompt.max_tokens.is_some()).then(|| {
            GeminiGenerationConfig {
                temperature: prompt.temperature,
                max_output_tokens: prompt.max_tokens,
            }
        });
        GeminiRequest {
            contents,
            system_instruction,
            generation_config,
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, ctx: &CallContext<'_>, url: &str, body: &T) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", ctx.credential.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        check_response(PROVIDER, response).await
    }

    fn model_url(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, model, method)
    }
}

fn candidate_text(candidate: &GeminiCandidate) -> String {
    candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<String>()
        })
        .unwrap_or_default()
}

fn usage_of(usage: Option<GeminiUsage>) -> Option<TokenUsage> {
    usage.map(|u| TokenUsage::new(u.prompt_token_count, u.candidates_token_count))
}

#[async_trait]
impl ProviderAdapter for GeminiProvider {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Text, Capability::TextStream, Capability::Image]
    }

    async fn generate_text(&self, ctx: &CallContext<'_>, prompt: &TextPrompt) -> Result<TextOutput> {
        debug!("Sending request to Gemini: model={}", ctx.model);
        let start_time = Instant::now();

        let request = self.build_request(prompt);
        let response = self
            .post(ctx, &self.model_url(ctx.model, "generateContent"), &request)
            .await?;
        let response: GeminiResponse = parse_json(PROVIDER, response).await?;

        debug!("Gemini request completed in {:?}", start_time.elapsed());

        let candidate = response
            .candidates
            .first()
            .ok_or_else(|| Error::upstream_format(PROVIDER, "No candidates in response"))?;
        if candidate.content.is_none() {
            return Err(Error::upstream_format(
                PROVIDER,
                format!(
                    "Candidate has no content (finish reason: {})",
                    candidate.finish_reason.as_deref().unwrap_or("unknown")
                ),
            ));
        }

        Ok(TextOutput {
            text: candidate_text(candidate),
            usage: usage_of(response.usage_metadata),
        })
    }

    async fn generate_text_stream(&self, ctx: &CallContext<'_>, prompt: &TextPrompt) -> Result<TextStream> {
        debug!("Starting streaming request to Gemini: model={}", ctx.model);

        let request = self.build_request(prompt);
        let url = format!("{}?alt=sse", self.model_url(ctx.model, "streamGenerateContent"));
        let response = self.post(ctx, &url, &request).await?;
        let events = http::sse_data(PROVIDER, response);

        let stream = async_stream::stream! {
            let mut events = Box::pin(events);
            let mut finished = false;

            while let Some(event) = futures_util::StreamExt::next(&mut events).await {
                let data = match event {
                    Ok(data) => data,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                let chunk: GeminiResponse = match serde_json::from_str(&data) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(Error::upstream_format(PROVIDER, format!("Bad stream chunk: {}", e)));
                        return;
                    }
                };

                let Some(candidate) = chunk.candidates.first() else {
                    continue;
                };
                let delta = candidate_text(candidate);
                let finish_reason = candidate.finish_reason.clone();
                if finish_reason.is_some() {
                    finished = true;
                }

                if !delta.is_empty() || finish_reason.is_some() {
                    yield Ok(StreamChunk {
                        delta,
                        finish_reason,
                        usage: usage_of(chunk.usage_metadata),
                    });
                }
                if finished {
                    break;
                }
            }

            if !finished {
                yield Err(Error::transient(PROVIDER, "Stream ended without a finish reason"));
            }
        };

        Ok(Box::pin(stream))
    }

    async fn generate_image(&self, ctx: &CallContext<'_>, prompt: &MediaPrompt) -> Result<MediaOutput> {
        debug!("Requesting Imagen image: model={}", ctx.model);

        let request = ImagenRequest {
            instances: vec![ImagenInstance {
                prompt: prompt.prompt.clone(),
            }],
            parameters: ImagenParameters {
                sample_count: 1,
                aspect_ratio: prompt.params.aspect_ratio.clone(),
                negative_prompt: prompt.params.negative_prompt.clone(),
            },
        };
        let response = self.post(ctx, &self.model_url(ctx.model, "predict"), &request).await?;
        let response: ImagenResponse = parse_json(PROVIDER, response).await?;

        let prediction = response
            .predictions
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream_format(PROVIDER, "No predictions in response"))?;
        let bytes = http::decode_base64(PROVIDER, &prediction.bytes_base64_encoded)?;
        let content_type = prediction.mime_type.unwrap_or_else(|| "image/png".to_string());

        http::persist_media(ctx.storage, bytes, AssetCategory::Image, &content_type).await
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct GeminiPart {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl GeminiPart {
    fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: Option<GeminiContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
}

#[derive(Debug, Serialize)]
struct ImagenRequest {
    instances: Vec<ImagenInstance>,
    parameters: ImagenParameters,
}

#[derive(Debug, Serialize)]
struct ImagenInstance {
    prompt: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImagenParameters {
    sample_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    negative_prompt: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagenResponse {
    #[serde(default)]
    predictions: Vec<ImagenPrediction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImagenPrediction {
    bytes_base64_encoded: String,
    mime_type: Option<String>,
}
