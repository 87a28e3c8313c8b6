use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::http::{self, check_response, parse_json, send_error};
use crate::models::provider::{
    CallContext, Capability, EditPrompt, MediaOutput, MediaPrompt, Message, MessageRole,
    ProviderAdapter, SpeechPrompt, StreamChunk, TextOutput, TextPrompt, TextStream, TokenUsage,
};
use crate::storage::AssetCategory;

const PROVIDER: &str = "openai";
const DEFAULT_VOICE: &str = "alloy";

pub struct OpenAIProvider {
    client: Client,
    base_url: String,
}

impl OpenAIProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://api.openai.com".to_string(), timeout)
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn auth_header(&self, credential: &SecretString) -> Result<HeaderValue> {
        HeaderValue::from_str(&format!("Bearer {}", credential.expose_secret()))
            .map_err(|e| Error::validation(format!("Invalid API key format: {}", e)))
    }

    fn create_headers(&self, credential: &SecretString) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, self.auth_header(credential)?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn convert_messages(&self, messages: &[Message]) -> Vec<OpenAIMessage> {
        messages
            .iter()
            .map(|msg| OpenAIMessage {
                role: match msg.role {
                    MessageRole::User => "user".to_string(),
                    MessageRole::Assistant => "assistant".to_string(),
                    MessageRole::System => "system".to_string(),
                },
                content: msg.content.clone(),
            })
            .collect()
    }

    fn chat_request(&self, model: &str, prompt: &TextPrompt, stream: bool) -> OpenAIRequest {
        OpenAIRequest {
            model: model.to_string(),
            messages: self.convert_messages(&prompt.messages),
            temperature: prompt.temperature,
            max_tokens: prompt.max_tokens,
            stream: Some(stream),
            stream_options: stream.then_some(OpenAIStreamOptions { include_usage: true }),
        }
    }

    async fn post_json<T: Serialize + ?Sized>(
        &self,
        ctx: &CallContext<'_>,
        path: &str,
        body: &T,
    ) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .headers(self.create_headers(ctx.credential)?)
            .json(body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        check_response(PROVIDER, response).await
    }

    /// Image endpoints answer with either inline base64 or a hosted URL.
    async fn store_image(&self, ctx: &CallContext<'_>, response: OpenAIImageResponse) -> Result<MediaOutput> {
        let image = response
            .data
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream_format(PROVIDER, "No images in response"))?;

        let (bytes, content_type) = match (image.b64_json, image.url) {
            (Some(b64), _) => (http::decode_base64(PROVIDER, &b64)?, "image/png".to_string()),
            (None, Some(url)) => {
                let (bytes, content_type) = http::download(&self.client, PROVIDER, &url).await?;
                (bytes, content_type.unwrap_or_else(|| "image/png".to_string()))
            }
            (None, None) => return Err(Error::upstream_format(PROVIDER, "Image without data or url")),
        };

        http::persist_media(ctx.storage, bytes, AssetCategory::Image, &content_type).await
    }
}

#[async_trait]
impl ProviderAdapter for OpenAIProvider {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> &[Capability] {
        &[
            Capability::Text,
            Capability::TextStream,
            Capability::Image,
            Capability::ImageEdit,
            Capability::Speech,
        ]
    }

    async fn generate_text(&self, ctx: &CallContext<'_>, prompt: &TextPrompt) -> Result<TextOutput> {
        debug!(
            "Sending request to OpenAI: model={}, messages={}",
            ctx.model,
            prompt.messages.len()
        );
        let start_time = Instant::now();

        let request = self.chat_request(ctx.model, prompt, false);
        let response = self.post_json(ctx, "/v1/chat/completions", &request).await?;
        let response: OpenAIResponse = parse_json(PROVIDER, response).await?;

        debug!("OpenAI request completed in {:?}", start_time.elapsed());

        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| Error::upstream_format(PROVIDER, "No choices in response"))?;

        Ok(TextOutput {
            text: choice.message.content.unwrap_or_default(),
            usage: response
                .usage
                .map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens)),
        })
    }

    async fn generate_text_stream(&self, ctx: &CallContext<'_>, prompt: &TextPrompt) -> Result<TextStream> {
        debug!(
            "Starting streaming request to OpenAI: model={}, messages={}",
            ctx.model,
            prompt.messages.len()
        );

        let request = self.chat_request(ctx.model, prompt, true);
        let response = self.post_json(ctx, "/v1/chat/completions", &request).await?;
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
                if data == "[DONE]" {
                    finished = true;
                    break;
                }

                let parsed: OpenAIStreamResponse = match serde_json::from_str(&data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        yield Err(Error::upstream_format(PROVIDER, format!("Bad stream chunk: {}", e)));
                        return;
                    }
                };

                let usage = parsed.usage.map(|u| TokenUsage::new(u.prompt_tokens, u.completion_tokens));
                match parsed.choices.into_iter().next() {
                    Some(choice) => {
                        let delta = choice.delta.content.unwrap_or_default();
                        if choice.finish_reason.is_some() {
                            finished = true;
                        }
                        if !delta.is_empty() || choice.finish_reason.is_some() || usage.is_some() {
                            yield Ok(StreamChunk {
                                delta,
                                finish_reason: choice.finish_reason,
                                usage,
                            });
                        }
                    }
                    // Trailing usage report sent after the finish chunk
                    None if usage.is_some() => {
                        yield Ok(StreamChunk {
                            delta: String::new(),
                            finish_reason: None,
                            usage,
                        });
                    }
                    None => {}
                }
            }

            if !finished {
                yield Err(Error::transient(PROVIDER, "Stream ended before completion"));
            }
        };

        Ok(Box::pin(stream))
    }

    async fn generate_image(&self, ctx: &CallContext<'_>, prompt: &MediaPrompt) -> Result<MediaOutput> {
        debug!("Requesting OpenAI image: model={}", ctx.model);

        let request = OpenAIImageRequest {
            model: ctx.model.to_string(),
            prompt: prompt.prompt.clone(),
            n: 1,
            size: prompt.params.size.clone(),
            response_format: Some("b64_json".to_string()),
        };
        let response = self.post_json(ctx, "/v1/images/generations", &request).await?;
        let response: OpenAIImageResponse = parse_json(PROVIDER, response).await?;
        self.store_image(ctx, response).await
    }

    async fn edit_image(&self, ctx: &CallContext<'_>, prompt: &EditPrompt) -> Result<MediaOutput> {
        debug!(
            "Requesting OpenAI image edit: model={}, image={} bytes",
            ctx.model,
            prompt.image.len()
        );

        let image = Part::bytes(prompt.image.clone())
            .file_name("image.png")
            .mime_str("image/png")
            .map_err(|e| Error::validation(format!("Invalid image part: {}", e)))?;
        let mut form = Form::new()
            .text("model", ctx.model.to_string())
            .text("prompt", prompt.instruction.clone())
            .part("image", image);
        if let Some(size) = &prompt.params.size {
            form = form.text("size", size.clone());
        }

        let response = self
            .client
            .post(format!("{}/v1/images/edits", self.base_url))
            .header(AUTHORIZATION, self.auth_header(ctx.credential)?)
            .multipart(form)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        let response = check_response(PROVIDER, response).await?;
        let response: OpenAIImageResponse = parse_json(PROVIDER, response).await?;
        self.store_image(ctx, response).await
    }

    async fn synthesize_speech(&self, ctx: &CallContext<'_>, prompt: &SpeechPrompt) -> Result<MediaOutput> {
        debug!("Requesting OpenAI speech: model={}, chars={}", ctx.model, prompt.text.len());

        let request = OpenAISpeechRequest {
            model: ctx.model.to_string(),
            input: prompt.text.clone(),
            voice: prompt.voice.clone().unwrap_or_else(|| DEFAULT_VOICE.to_string()),
            response_format: "mp3".to_string(),
        };
        let response = self.post_json(ctx, "/v1/audio/speech", &request).await?;
        let audio = response
            .bytes()
            .await
            .map_err(|e| Error::transient(PROVIDER, format!("Failed to read audio: {}", e)))?;
        if audio.is_empty() {
            return Err(Error::upstream_format(PROVIDER, "Empty audio response"));
        }

        http::persist_media(ctx.storage, audio.to_vec(), AssetCategory::Audio, "audio/mpeg").await
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<OpenAIStreamOptions>,
}

#[derive(Debug, Serialize)]
struct OpenAIStreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

// Streaming response structures
#[derive(Debug, Deserialize)]
struct OpenAIStreamResponse {
    #[serde(default)]
    choices: Vec<OpenAIStreamChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamChoice {
    delta: OpenAIStreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIStreamDelta {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAIImageRequest {
    model: String,
    prompt: String,
    n: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIImageResponse {
    data: Vec<OpenAIImageData>,
}

#[derive(Debug, Deserialize)]
struct OpenAIImageData {
    b64_json: Option<String>,
    url: Option<String>,
}

#[derive(Debug, Serialize)]
struct OpenAISpeechRequest {
    model: String,
    input: String,
    voice: String,
    response_format: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::TestContext;
    use futures_util::StreamExt;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> OpenAIProvider {
        OpenAIProvider::with_base_url(server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn prompt() -> TextPrompt {
        TextPrompt {
            messages: vec![Message::system("be brief"), Message::user("Say hello")],
            ..Default::default()
        }
    }

    const STREAM_BODY: &str = concat!(
        "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"role\":\"assistant\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\"Hello\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{\"content\":\", world\"},\"finish_reason\":null}]}\n\n",
        "data: {\"id\":\"c1\",\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
        "data: [DONE]\n\n",
    );

    async fn mount_chat(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(body_partial_json(json!({"stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "chatcmpl-1",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "Hello, world"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
            })))
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": true})))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(STREAM_BODY),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_message_conversion() {
        let provider = OpenAIProvider::new(Duration::from_secs(5)).unwrap();
        let converted = provider.convert_messages(&prompt().messages);
        assert_eq!(converted.len(), 2);
        assert_eq!(converted[0].role, "system");
        assert_eq!(converted[1].role, "user");
    }

    #[tokio::test]
    async fn test_generate_text() {
        let server = MockServer::start().await;
        mount_chat(&server).await;
        let test = TestContext::new("sk-test");

        let output = provider(&server)
            .generate_text(&test.ctx("gpt-4o"), &prompt())
            .await
            .unwrap();

        assert_eq!(output.text, "Hello, world");
        assert_eq!(output.usage, Some(TokenUsage::new(9, 3)));
    }

    #[tokio::test]
    async fn test_stream_concatenation_matches_generate() {
        let server = MockServer::start().await;
        mount_chat(&server).await;
        let test = TestContext::new("sk-test");
        let provider = provider(&server);

        let full = provider.generate_text(&test.ctx("gpt-4o"), &prompt()).await.unwrap();
        let chunks: Vec<StreamChunk> = provider
            .generate_text_stream(&test.ctx("gpt-4o"), &prompt())
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        let streamed: String = chunks.iter().map(|c| c.delta.as_str()).collect();
        assert_eq!(streamed, full.text);
        assert_eq!(chunks.last().unwrap().finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_stream_reports_trailing_usage() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}],\"usage\":null}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}],\"usage\":null}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":7,\"completion_tokens\":1,\"total_tokens\":8}}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(body_partial_json(json!({"stream": true, "stream_options": {"include_usage": true}})))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        let test = TestContext::new("sk-test");

        let chunks: Vec<StreamChunk> = provider(&server)
            .generate_text_stream(&test.ctx("gpt-4o"), &prompt())
            .await
            .unwrap()
            .map(|chunk| chunk.unwrap())
            .collect()
            .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].finish_reason.as_deref(), Some("stop"));
        let last = chunks.last().unwrap();
        assert_eq!(last.delta, "");
        assert_eq!(last.usage, Some(TokenUsage::new(7, 1)));
    }

    #[tokio::test]
    async fn test_truncated_stream_ends_with_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"},\"finish_reason\":null}]}\n\n",
            ))
            .mount(&server)
            .await;
        let test = TestContext::new("sk-test");

        let items: Vec<Result<StreamChunk>> = provider(&server)
            .generate_text_stream(&test.ctx("gpt-4o"), &prompt())
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().delta, "Hel");
        assert!(matches!(items[1], Err(Error::Transient { .. })));
    }

    #[tokio::test]
    async fn test_insufficient_quota_is_quota_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_json(json!({
                "error": {"message": "You exceeded your current quota", "type": "insufficient_quota", "code": "insufficient_quota"}
            })))
            .mount(&server)
            .await;
        let test = TestContext::new("sk-test");

        let err = provider(&server)
            .generate_text(&test.ctx("gpt-4o"), &prompt())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QuotaExceeded { .. }));
    }

    #[tokio::test]
    async fn test_generate_image_uploads_b64() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .and(body_partial_json(json!({"model": "dall-e-3", "prompt": "a red fox", "n": 1})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "created": 1,
                "data": [{"b64_json": "aGVsbG8="}]
            })))
            .mount(&server)
            .await;
        let test = TestContext::new("sk-test");

        let media = provider(&server)
            .generate_image(
                &test.ctx("dall-e-3"),
                &MediaPrompt {
                    prompt: "a red fox".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(media.size_bytes, 5);
        let objects = test.storage.objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].payload, b"hello");
        assert_eq!(objects[0].category, AssetCategory::Image);
    }

    #[tokio::test]
    async fn test_upload_failure_fails_generation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/generations"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"b64_json": "aGVsbG8="}]
            })))
            .mount(&server)
            .await;
        let test = TestContext::new("sk-test");
        test.storage.set_fail_uploads(true);

        let err = provider(&server)
            .generate_image(&test.ctx("dall-e-3"), &MediaPrompt::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Storage(_)));
    }

    #[tokio::test]
    async fn test_edit_image_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/images/edits"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "data": [{"b64_json": "aGVsbG8="}]
            })))
            .expect(1)
            .mount(&server)
            .await;
        let test = TestContext::new("sk-test");

        let media = provider(&server)
            .edit_image(
                &test.ctx("gpt-image-1"),
                &EditPrompt {
                    image: vec![1, 2, 3],
                    instruction: "make it blue".to_string(),
                    params: Default::default(),
                },
            )
            .await
            .unwrap();
        assert!(media.url.starts_with("memory://image/"));
    }

    #[tokio::test]
    async fn test_synthesize_speech() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/audio/speech"))
            .and(body_partial_json(json!({"model": "tts-1", "voice": "alloy", "input": "hi there"})))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![7u8; 64]))
            .mount(&server)
            .await;
        let test = TestContext::new("sk-test");

        let media = provider(&server)
            .synthesize_speech(
                &test.ctx("tts-1"),
                &SpeechPrompt {
                    text: "hi there".to_string(),
                    voice: None,
                },
            )
            .await
            .unwrap();

        assert_eq!(media.content_type, "audio/mpeg");
        assert_eq!(media.size_bytes, 64);
    }

    #[tokio::test]
    async fn test_video_unsupported() {
        let provider = OpenAIProvider::new(Duration::from_secs(5)).unwrap();
        let test = TestContext::new("sk-test");
        let err = provider
            .generate_video(&test.ctx("sora"), &MediaPrompt::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unsupported { .. }));
        assert!(!provider.supports(Capability::Video));
    }
}
