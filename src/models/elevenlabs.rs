use async_trait::async_trait;
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::http::{self, check_response, send_error};
use crate::models::provider::{CallContext, Capability, MediaOutput, ProviderAdapter, SpeechPrompt};
use crate::storage::AssetCategory;

const PROVIDER: &str = "elevenlabs";
// "Rachel", available on every account
const DEFAULT_VOICE_ID: &str = "21m00Tcm4TlvDq8ikWAM";

pub struct ElevenLabsProvider {
    client: Client,
    base_url: String,
}

impl ElevenLabsProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://api.elevenlabs.io".to_string(), timeout)
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ProviderAdapter for ElevenLabsProvider {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Speech]
    }

    async fn synthesize_speech(&self, ctx: &CallContext<'_>, prompt: &SpeechPrompt) -> Result<MediaOutput> {
        let voice_id = prompt.voice.as_deref().unwrap_or(DEFAULT_VOICE_ID);
        debug!(
            "Requesting ElevenLabs speech: model={}, voice={}, chars={}",
            ctx.model,
            voice_id,
            prompt.text.len()
        );

        let request = ElevenLabsRequest {
            text: &prompt.text,
            model_id: ctx.model,
        };
        let response = self
            .client
            .post(format!("{}/v1/text-to-speech/{}", self.base_url, voice_id))
            .header("xi-api-key", ctx.credential.expose_secret())
            .header("Accept", "audio/mpeg")
            .json(&request)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        let response = check_response(PROVIDER, response).await?;

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

#[derive(Debug, Serialize)]
struct ElevenLabsRequest<'a> {
    text: &'a str,
    model_id: &'a str,
}
