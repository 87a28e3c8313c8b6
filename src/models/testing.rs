//! Fixtures shared by the adapter and manager tests.

use async_trait::async_trait;
use futures_util::stream;
use parking_lot::Mutex;
use secrecy::SecretString;
use std::collections::VecDeque;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::models::polling::PollingConfig;
use crate::models::provider::{
    CallContext, Capability, EditPrompt, MediaOutput, MediaPrompt, ProviderAdapter, SpeechPrompt, StreamChunk,
    TextOutput, TextPrompt, TextStream,
};
use crate::storage::MemoryObjectStorage;

pub struct TestContext {
    pub credential: SecretString,
    pub storage: MemoryObjectStorage,
    pub cancel: CancellationToken,
    pub polling: PollingConfig,
}

impl TestContext {
    pub fn new(key: &str) -> Self {
        Self {
            credential: SecretString::from(key.to_string()),
            storage: MemoryObjectStorage::new(),
            cancel: CancellationToken::new(),
            polling: fast_polling(),
        }
    }

    pub fn ctx<'a>(&'a self, model: &'a str) -> CallContext<'a> {
        CallContext {
            model,
            credential: &self.credential,
            storage: &self.storage,
            cancel: &self.cancel,
            polling: &self.polling,
        }
    }
}

pub fn fast_polling() -> PollingConfig {
    PollingConfig {
        interval_ms: 1,
        max_attempts: 10,
        poll_retries: 2,
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    Ok,
    Quota,
    Transient,
    Timeout,
    Format,
    Hang,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub capability: Capability,
    pub model: String,
    pub input: String,
}

/// Adapter that plays back a script of outcomes, then repeats `fallback`.
pub struct ScriptedAdapter {
    name: String,
    capabilities: Vec<Capability>,
    script: Mutex<VecDeque<Step>>,
    fallback: Step,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedAdapter {
    pub fn new(name: &str, capabilities: &[Capability]) -> Self {
        Self {
            name: name.to_string(),
            capabilities: capabilities.to_vec(),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Ok,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn always(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    pub fn then(self, step: Step) -> Self {
        self.script.lock().push_back(step);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    async fn play(&self, capability: Capability, model: &str, input: &str) -> Result<String> {
        self.calls.lock().push(Call {
            capability,
            model: model.to_string(),
            input: input.to_string(),
        });
        let step = self.script.lock().pop_front().unwrap_or(self.fallback);

        match step {
            Step::Ok => Ok(format!("{} says hello from {}", self.name, model)),
            Step::Quota => Err(Error::quota(&self.name, "API error 429: rate limited")),
            Step::Transient => Err(Error::transient(&self.name, "API error 503: unavailable")),
            Step::Timeout => Err(Error::Timeout {
                provider: self.name.clone(),
                attempts: 3,
            }),
            Step::Format => Err(Error::upstream_format(&self.name, "missing field `choices`")),
            Step::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(Error::transient(&self.name, "woke up"))
            }
        }
    }

    async fn media(&self, capability: Capability, model: &str, input: &str) -> Result<MediaOutput> {
        self.play(capability, model, input).await?;
        Ok(MediaOutput {
            url: format!("memory://{}/{}/{}", capability, self.name, model),
            size_bytes: 1,
            content_type: "application/octet-stream".to_string(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for ScriptedAdapter {
    fn provider_name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[Capability] {
        &self.capabilities
    }

    async fn generate_text(&self, ctx: &CallContext<'_>, prompt: &TextPrompt) -> Result<TextOutput> {
        let input = prompt.messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let text = self.play(Capability::Text, ctx.model, input).await?;
        Ok(TextOutput { text, usage: None })
    }

    async fn generate_text_stream(&self, ctx: &CallContext<'_>, prompt: &TextPrompt) -> Result<TextStream> {
        let input = prompt.messages.last().map(|m| m.content.as_str()).unwrap_or_default();
        let text = self.play(Capability::TextStream, ctx.model, input).await?;
        let chunks: Vec<Result<StreamChunk>> = text
            .split_inclusive(' ')
            .map(|word| Ok(StreamChunk::delta(word)))
            .collect();
        Ok(Box::pin(stream::iter(chunks)))
    }

    async fn generate_image(&self, ctx: &CallContext<'_>, prompt: &MediaPrompt) -> Result<MediaOutput> {
        self.media(Capability::Image, ctx.model, &prompt.prompt).await
    }

    async fn edit_image(&self, ctx: &CallContext<'_>, prompt: &EditPrompt) -> Result<MediaOutput> {
        self.media(Capability::ImageEdit, ctx.model, &prompt.instruction).await
    }

    async fn generate_video(&self, ctx: &CallContext<'_>, prompt: &MediaPrompt) -> Result<MediaOutput> {
        let input = prompt.image_url.as_deref().unwrap_or(&prompt.prompt);
        self.media(Capability::Video, ctx.model, input).await
    }

    async fn synthesize_speech(&self, ctx: &CallContext<'_>, prompt: &SpeechPrompt) -> Result<MediaOutput> {
        self.media(Capability::Speech, ctx.model, &prompt.text).await
    }
}
