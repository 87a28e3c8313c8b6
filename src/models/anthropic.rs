use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::http::{self, check_response, parse_json, send_error};
use crate::models::provider::{
    CallContext, Capability, Message, MessageRole, ProviderAdapter, StreamChunk, TextOutput, TextPrompt,
    TextStream, TokenUsage,
};

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 1024;

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://api.anthropic.com".to_string(), timeout)
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Splits system turns out of the conversation; the Messages API takes
    /// them as a separate field.
    fn convert_messages(&self, messages: &[Message]) -> (Option<String>, Vec<AnthropicMessage>) {
        let mut anthropic_messages = Vec::new();
        let mut system_message = String::new();

        for message in messages {
            match message.role {
                MessageRole::System => {
                    if !system_message.is_empty() {
                        system_message.push('\n');
                    }
                    system_message.push_str(&message.content);
                }
                MessageRole::User => anthropic_messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: message.content.clone(),
                }),
                MessageRole::Assistant => anthropic_messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: message.content.clone(),
                }),
            }
        }

        // A system-only conversation is sent as a single user turn
        if anthropic_messages.is_empty() && !system_message.is_empty() {
            anthropic_messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: system_message,
            });
            return (None, anthropic_messages);
        }

        let system = (!system_message.is_empty()).then_some(system_message);
        (system, anthropic_messages)
    }

    fn build_request(&self, model: &str, prompt: &TextPrompt, stream: bool) -> AnthropicRequest {
        let (system, messages) = self.convert_messages(&prompt.messages);
        AnthropicRequest {
            model: model.to_string(),
            max_tokens: prompt.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages,
            system,
            temperature: prompt.temperature,
            stream,
        }
    }

    async fn make_request(&self, ctx: &CallContext<'_>, request: &AnthropicRequest) -> Result<reqwest::Response> {
        debug!("Making Anthropic API request to model: {}", request.model);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("Content-Type", "application/json")
            .header("x-api-key", ctx.credential.expose_secret())
            .header("anthropic-version", API_VERSION)
            .json(request)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;

        check_response(PROVIDER, response).await
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicProvider {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Text, Capability::TextStream]
    }

    async fn generate_text(&self, ctx: &CallContext<'_>, prompt: &TextPrompt) -> Result<TextOutput> {
        let start_time = Instant::now();

        let request = self.build_request(ctx.model, prompt, false);
        let response = self.make_request(ctx, &request).await?;
        let response: AnthropicResponse = parse_json(PROVIDER, response).await?;

        debug!("Anthropic request completed in {:?}", start_time.elapsed());

        let text: String = response
            .content
            .iter()
            .filter(|block| block.r#type == "text")
            .filter_map(|block| block.text.as_deref())
            .collect();

        if text.is_empty() && response.content.is_empty() {
            return Err(Error::upstream_format(PROVIDER, "Response has no content blocks"));
        }

        Ok(TextOutput {
            text,
            usage: Some(TokenUsage::new(response.usage.input_tokens, response.usage.output_tokens)),
        })
    }

    async fn generate_text_stream(&self, ctx: &CallContext<'_>, prompt: &TextPrompt) -> Result<TextStream> {
        let request = self.build_request(ctx.model, prompt, true);
        let response = self.make_request(ctx, &request).await?;
        let events = http::sse_data(PROVIDER, response);

        let stream = async_stream::stream! {
            let mut events = Box::pin(events);
            let mut input_tokens = 0u32;
            let mut finished = false;

            while let Some(event) = futures_util::StreamExt::next(&mut events).await {
                let data = match event {
                    Ok(data) => data,
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                };

                let event: AnthropicStreamEvent = match serde_json::from_str(&data) {
                    Ok(event) => event,
                    Err(e) => {
                        yield Err(Error::upstream_format(PROVIDER, format!("Bad stream event: {}", e)));
                        return;
                    }
                };

                match event {
                    AnthropicStreamEvent::MessageStart { message } => {
                        input_tokens = message.usage.map(|u| u.input_tokens).unwrap_or(0);
                    }
                    AnthropicStreamEvent::ContentBlockDelta { delta } => {
                        if let Some(text) = delta.text.filter(|t| !t.is_empty()) {
                            yield Ok(StreamChunk::delta(text));
                        }
                    }
                    AnthropicStreamEvent::MessageDelta { delta, usage } => {
                        if let Some(stop_reason) = delta.stop_reason {
                            yield Ok(StreamChunk {
                                delta: String::new(),
                                finish_reason: Some(stop_reason),
                                usage: usage.map(|u| TokenUsage::new(input_tokens, u.output_tokens)),
                            });
                        }
                    }
                    AnthropicStreamEvent::MessageStop => {
                        finished = true;
                        break;
                    }
                    AnthropicStreamEvent::Error { error } => {
                        warn!("Anthropic stream error: {} - {}", error.r#type, error.message);
                        let message = format!("{}: {}", error.r#type, error.message);
                        if error.r#type == "rate_limit_error" {
                            yield Err(Error::quota(PROVIDER, message));
                        } else {
                            yield Err(Error::transient(PROVIDER, message));
                        }
                        return;
                    }
                    AnthropicStreamEvent::Other => {}
                }
            }

            if !finished {
                yield Err(Error::transient(PROVIDER, "Stream ended before message_stop"));
            }
        };

        Ok(Box::pin(stream))
    }
}

#[derive(Debug, Clone, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    r#type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicStreamEvent {
    MessageStart {
        message: AnthropicStreamMessage,
    },
    ContentBlockDelta {
        delta: AnthropicTextDelta,
    },
    MessageDelta {
        delta: AnthropicMessageDelta,
        usage: Option<AnthropicOutputUsage>,
    },
    MessageStop,
    Error {
        error: AnthropicErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicStreamMessage {
    usage: Option<AnthropicInputUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicInputUsage {
    input_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicOutputUsage {
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct AnthropicTextDelta {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicMessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    r#type: String,
    message: String,
}
