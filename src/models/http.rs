use base64::Engine;
use futures_util::{Stream, StreamExt};
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::models::provider::MediaOutput;
use crate::storage::{AssetCategory, ObjectStorage};

/// `timeout` bounds connecting and each gap between reads, not the whole
/// exchange, so a long stream stays open while tokens keep arriving. The
/// overall bound for a non-polling call is the manager's attempt timeout.
pub fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .connect_timeout(timeout)
        .read_timeout(timeout)
        .build()
        .map_err(|e| Error::platform(format!("Failed to create HTTP client: {}", e)))
}

pub fn send_error(provider: &str, error: reqwest::Error) -> Error {
    Error::transient(provider, format!("HTTP request failed: {}", error))
}

/// Passes successful responses through and turns everything else into a
/// classified provider error.
pub async fn check_response(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!("{} API error: {} - {}", provider, status, body);
    Err(Error::from_status(provider, status.as_u16(), &body))
}

pub async fn parse_json<T: DeserializeOwned>(provider: &str, response: Response) -> Result<T> {
    let body = response
        .text()
        .await
        .map_err(|e| Error::transient(provider, format!("Failed to read response: {}", e)))?;
    serde_json::from_str(&body)
        .map_err(|e| Error::upstream_format(provider, format!("Failed to parse response: {}", e)))
}

pub fn decode_base64(provider: &str, data: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|e| Error::upstream_format(provider, format!("Invalid base64 payload: {}", e)))
}

/// Downloads a provider-hosted artifact. Returns the bytes and the served
/// content type.
pub async fn download(client: &Client, provider: &str, url: &str) -> Result<(Vec<u8>, Option<String>)> {
    debug!("Downloading {} artifact from {}", provider, url);
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|e| send_error(provider, e))?;
    let response = check_response(provider, response).await?;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());
    let bytes = response
        .bytes()
        .await
        .map_err(|e| Error::transient(provider, format!("Failed to read artifact: {}", e)))?;
    Ok((bytes.to_vec(), content_type))
}

pub async fn persist_media(
    storage: &dyn ObjectStorage,
    payload: Vec<u8>,
    category: AssetCategory,
    content_type: &str,
) -> Result<MediaOutput> {
    let stored = storage.upload(payload, category, content_type).await?;
    Ok(MediaOutput {
        url: stored.public_url,
        size_bytes: stored.size_bytes,
        content_type: content_type.to_string(),
    })
}

/// Server-sent event `data:` payloads in arrival order. A transport error
/// ends the stream with an `Err` item.
pub fn sse_data(provider: &str, response: Response) -> impl Stream<Item = Result<String>> + Send + 'static {
    let provider = provider.to_string();
    async_stream::stream! {
        let mut body = Box::pin(response.bytes_stream());
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(chunk) => buffer.extend_from_slice(&chunk),
                Err(e) => {
                    yield Err(Error::transient(&provider, format!("Stream read error: {}", e)));
                    return;
                }
            }

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(data) = data_line(&line) {
                    yield Ok(data);
                }
            }
        }

        if let Some(data) = data_line(&buffer) {
            yield Ok(data);
        }
    }
}

fn data_line(raw: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(raw);
    let line = line.trim();
    // Blank separators, comments and `event:` names carry nothing we need.
    line.strip_prefix("data:").map(|data| data.trim_start().to_string())
}
