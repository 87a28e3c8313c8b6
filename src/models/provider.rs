use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::Stream;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::polling::PollingConfig;
use crate::storage::ObjectStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Text,
    TextStream,
    Image,
    ImageEdit,
    Video,
    Speech,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Text,
        Capability::TextStream,
        Capability::Image,
        Capability::ImageEdit,
        Capability::Video,
        Capability::Speech,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Text => "text",
            Capability::TextStream => "text_stream",
            Capability::Image => "image",
            Capability::ImageEdit => "image_edit",
            Capability::Video => "video",
            Capability::Speech => "speech",
        }
    }

    /// Capabilities served by submit-and-poll backends. Their wall-clock
    /// bound comes from the polling ceiling, not the per-attempt timeout.
    pub fn is_long_running(&self) -> bool {
        matches!(self, Capability::Video)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Error::validation(format!("Unknown capability: {}", s)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(MessageRole::System, content)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum MessageRole {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Assistant,
    #[serde(rename = "system")]
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

impl TokenUsage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextPrompt {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaParams {
    pub size: Option<String>,
    pub aspect_ratio: Option<String>,
    pub duration_secs: Option<u32>,
    pub negative_prompt: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediaPrompt {
    pub prompt: String,
    /// Source image for image-to-video generation.
    pub image_url: Option<String>,
    pub params: MediaParams,
}

#[derive(Debug, Clone)]
pub struct EditPrompt {
    pub image: Vec<u8>,
    pub instruction: String,
    pub params: MediaParams,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpeechPrompt {
    pub text: String,
    pub voice: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CapabilityPayload {
    Text(TextPrompt),
    Image(MediaPrompt),
    ImageEdit(EditPrompt),
    Video(MediaPrompt),
    Speech(SpeechPrompt),
}

impl CapabilityPayload {
    pub fn accepts(&self, capability: Capability) -> bool {
        matches!(
            (self, capability),
            (CapabilityPayload::Text(_), Capability::Text)
                | (CapabilityPayload::Text(_), Capability::TextStream)
                | (CapabilityPayload::Image(_), Capability::Image)
                | (CapabilityPayload::ImageEdit(_), Capability::ImageEdit)
                | (CapabilityPayload::Video(_), Capability::Video)
                | (CapabilityPayload::Speech(_), Capability::Speech)
        )
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityRequest {
    pub id: String,
    pub payload: CapabilityPayload,
    pub stream: bool,
}

impl CapabilityRequest {
    pub fn new(payload: CapabilityPayload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
            stream: false,
        }
    }

    pub fn text(messages: Vec<Message>) -> Self {
        Self::new(CapabilityPayload::Text(TextPrompt {
            messages,
            ..Default::default()
        }))
    }

    pub fn image(prompt: impl Into<String>) -> Self {
        Self::new(CapabilityPayload::Image(MediaPrompt {
            prompt: prompt.into(),
            ..Default::default()
        }))
    }

    pub fn edit(image: Vec<u8>, instruction: impl Into<String>) -> Self {
        Self::new(CapabilityPayload::ImageEdit(EditPrompt {
            image,
            instruction: instruction.into(),
            params: MediaParams::default(),
        }))
    }

    pub fn video(prompt: impl Into<String>, image_url: Option<String>) -> Self {
        Self::new(CapabilityPayload::Video(MediaPrompt {
            prompt: prompt.into(),
            image_url,
            params: MediaParams::default(),
        }))
    }

    pub fn speech(text: impl Into<String>) -> Self {
        Self::new(CapabilityPayload::Speech(SpeechPrompt {
            text: text.into(),
            voice: None,
        }))
    }

    pub fn with_streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        if let CapabilityPayload::Text(prompt) = &mut self.payload {
            prompt.temperature = Some(temperature);
        }
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        if let CapabilityPayload::Text(prompt) = &mut self.payload {
            prompt.max_tokens = Some(max_tokens);
        }
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    /// Pin a single provider. Failures are surfaced without fallback.
    pub provider: Option<String>,
    pub cancel: Option<CancellationToken>,
}

impl ExecuteOptions {
    pub fn pinned(provider: impl Into<String>) -> Self {
        Self {
            provider: Some(provider.into()),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub finish_reason: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl StreamChunk {
    pub fn delta(text: impl Into<String>) -> Self {
        Self {
            delta: text.into(),
            finish_reason: None,
            usage: None,
        }
    }
}

/// Ordered partial text. An `Err` item is terminal.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextOutput {
    pub text: String,
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaOutput {
    pub url: String,
    pub size_bytes: u64,
    pub content_type: String,
}

pub enum Output {
    Text(String),
    Media(MediaOutput),
    Stream(TextStream),
}

impl fmt::Debug for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Text(text) => f.debug_tuple("Text").field(text).finish(),
            Output::Media(media) => f.debug_tuple("Media").field(media).finish(),
            Output::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Canonical envelope returned regardless of which provider served the call.
#[derive(Debug)]
pub struct CapabilityResult {
    pub provider_used: String,
    pub model_used: String,
    pub output: Output,
    pub usage: Option<TokenUsage>,
    pub completed_at: DateTime<Utc>,
}

impl CapabilityResult {
    pub fn text(&self) -> Option<&str> {
        match &self.output {
            Output::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn media_url(&self) -> Option<&str> {
        match &self.output {
            Output::Media(media) => Some(&media.url),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<TextStream> {
        match self.output {
            Output::Stream(stream) => Some(stream),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub name: String,
    pub capability: Capability,
    pub model: String,
    pub priority: u32,
}

/// Everything an adapter needs for one call.
pub struct CallContext<'a> {
    pub model: &'a str,
    pub credential: &'a SecretString,
    pub storage: &'a dyn ObjectStorage,
    pub cancel: &'a CancellationToken,
    pub polling: &'a PollingConfig,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn provider_name(&self) -> &str;

    fn capabilities(&self) -> &[Capability];

    fn supports(&self, capability: Capability) -> bool {
        self.capabilities().contains(&capability)
    }

    /// True when this adapter serves `capability` by submitting a job and
    /// polling it. Such calls are bounded by the polling ceiling and handle
    /// cancellation themselves.
    fn is_async(&self, capability: Capability) -> bool {
        capability.is_long_running()
    }

    fn unsupported(&self, capability: Capability) -> Error {
        Error::Unsupported {
            provider: self.provider_name().to_string(),
            capability,
        }
    }

    async fn generate_text(&self, _ctx: &CallContext<'_>, _prompt: &TextPrompt) -> Result<TextOutput> {
        Err(self.unsupported(Capability::Text))
    }

    async fn generate_text_stream(&self, _ctx: &CallContext<'_>, _prompt: &TextPrompt) -> Result<TextStream> {
        Err(self.unsupported(Capability::TextStream))
    }

    async fn generate_image(&self, _ctx: &CallContext<'_>, _prompt: &MediaPrompt) -> Result<MediaOutput> {
        Err(self.unsupported(Capability::Image))
    }

    async fn edit_image(&self, _ctx: &CallContext<'_>, _prompt: &EditPrompt) -> Result<MediaOutput> {
        Err(self.unsupported(Capability::ImageEdit))
    }

    async fn generate_video(&self, _ctx: &CallContext<'_>, _prompt: &MediaPrompt) -> Result<MediaOutput> {
        Err(self.unsupported(Capability::Video))
    }

    async fn synthesize_speech(&self, _ctx: &CallContext<'_>, _prompt: &SpeechPrompt) -> Result<MediaOutput> {
        Err(self.unsupported(Capability::Speech))
    }
}
