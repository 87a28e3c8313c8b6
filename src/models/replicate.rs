use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::models::http::{self, check_response, parse_json, send_error};
use crate::models::polling::{AsyncJob, JobSnapshot, JobStatus};
use crate::models::provider::{CallContext, Capability, MediaOutput, MediaPrompt, ProviderAdapter};
use crate::storage::AssetCategory;

const PROVIDER: &str = "replicate";

/// Runs community models through Replicate's prediction API. Every call is
/// submit-then-poll, for stills as well as video.
pub struct ReplicateProvider {
    client: Client,
    base_url: String,
}

impl ReplicateProvider {
    pub fn new(timeout: Duration) -> Result<Self> {
        Self::with_base_url("https://api.replicate.com".to_string(), timeout)
    }

    pub fn with_base_url(base_url: String, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: http::build_client(timeout)?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn create_headers(&self, credential: &SecretString) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", credential.expose_secret()))
            .map_err(|e| Error::validation(format!("Invalid API key format: {}", e)))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// `owner/name` runs the latest version; `owner/name:version` pins one.
    async fn submit(&self, ctx: &CallContext<'_>, input: Value) -> Result<ReplicatePrediction> {
        let (url, body) = match ctx.model.split_once(':') {
            Some((_, version)) => (
                format!("{}/v1/predictions", self.base_url),
                json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/v1/models/{}/predictions", self.base_url, ctx.model),
                json!({ "input": input }),
            ),
        };

        debug!("Submitting Replicate prediction: model={}", ctx.model);
        let response = self
            .client
            .post(&url)
            .headers(self.create_headers(ctx.credential)?)
            .json(&body)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        let response = check_response(PROVIDER, response).await?;
        parse_json(PROVIDER, response).await
    }

    async fn fetch(&self, ctx: &CallContext<'_>, id: &str) -> Result<ReplicatePrediction> {
        let response = self
            .client
            .get(format!("{}/v1/predictions/{}", self.base_url, id))
            .headers(self.create_headers(ctx.credential)?)
            .send()
            .await
            .map_err(|e| send_error(PROVIDER, e))?;
        let response = check_response(PROVIDER, response).await?;
        parse_json(PROVIDER, response).await
    }

    /// One status observation. A flaky status request is retried a few
    /// times before it fails the whole job.
    async fn poll(&self, ctx: &CallContext<'_>, id: String) -> Result<JobSnapshot> {
        let id = id.as_str();
        let strategy = FixedInterval::new(ctx.polling.interval()).take(ctx.polling.poll_retries);
        let prediction = RetryIf::spawn(
            strategy,
            move || self.fetch(ctx, id),
            |e: &Error| matches!(e, Error::Transient { .. }),
        )
        .await?;
        Ok(prediction.snapshot())
    }

    async fn cancel_remote(&self, ctx: &CallContext<'_>, id: &str) {
        let result: Result<()> = async {
            let headers = self.create_headers(ctx.credential)?;
            let response = self
                .client
                .post(format!("{}/v1/predictions/{}/cancel", self.base_url, id))
                .headers(headers)
                .send()
                .await
                .map_err(|e| send_error(PROVIDER, e))?;
            check_response(PROVIDER, response).await.map(|_| ())
        }
        .await;

        match result {
            Ok(()) => info!("Cancelled Replicate prediction {}", id),
            Err(e) => warn!("Failed to cancel Replicate prediction {}: {}", id, e),
        }
    }

    async fn run(&self, ctx: &CallContext<'_>, input: Value, category: AssetCategory) -> Result<MediaOutput> {
        let prediction = self.submit(ctx, input).await?;
        let initial = prediction.snapshot();
        let id = prediction.id;

        let output_url = match initial.status {
            JobStatus::Succeeded => initial
                .output_url
                .ok_or_else(|| Error::upstream_format(PROVIDER, format!("prediction {} has no output", id)))?,
            JobStatus::Failed => {
                return Err(Error::transient(
                    PROVIDER,
                    format!(
                        "prediction {} failed: {}",
                        id,
                        initial.error.unwrap_or_else(|| "unknown error".to_string())
                    ),
                ));
            }
            JobStatus::Queued | JobStatus::Running => {
                let mut job = AsyncJob::new(PROVIDER, id.clone(), ctx.polling);
                match job.wait(ctx.cancel, |job_id| self.poll(ctx, job_id)).await {
                    Ok(url) => url,
                    Err(Error::Cancelled) => {
                        self.cancel_remote(ctx, &id).await;
                        return Err(Error::Cancelled);
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let (bytes, served_type) = http::download(&self.client, PROVIDER, &output_url).await?;
        if bytes.is_empty() {
            return Err(Error::upstream_format(PROVIDER, format!("prediction {} produced an empty file", id)));
        }
        let content_type = served_type
            .filter(|t| t.starts_with(category.as_str()))
            .unwrap_or_else(|| default_content_type(category).to_string());

        http::persist_media(ctx.storage, bytes, category, &content_type).await
    }
}

fn default_content_type(category: AssetCategory) -> &'static str {
    match category {
        AssetCategory::Image => "image/png",
        AssetCategory::Video => "video/mp4",
        AssetCategory::Audio => "audio/mpeg",
    }
}

fn image_input(prompt: &MediaPrompt) -> Value {
    let mut input = Map::new();
    input.insert("prompt".to_string(), json!(prompt.prompt));
    if let Some(aspect_ratio) = &prompt.params.aspect_ratio {
        input.insert("aspect_ratio".to_string(), json!(aspect_ratio));
    }
    if let Some(negative) = &prompt.params.negative_prompt {
        input.insert("negative_prompt".to_string(), json!(negative));
    }
    Value::Object(input)
}

fn video_input(prompt: &MediaPrompt) -> Value {
    let mut input = image_input(prompt);
    if let Value::Object(map) = &mut input {
        if let Some(image_url) = &prompt.image_url {
            map.insert("first_frame_image".to_string(), json!(image_url));
        }
        if let Some(duration) = prompt.params.duration_secs {
            map.insert("duration".to_string(), json!(duration));
        }
    }
    input
}

#[async_trait]
impl ProviderAdapter for ReplicateProvider {
    fn provider_name(&self) -> &str {
        PROVIDER
    }

    fn capabilities(&self) -> &[Capability] {
        &[Capability::Image, Capability::Video]
    }

    fn is_async(&self, capability: Capability) -> bool {
        self.supports(capability)
    }

    async fn generate_image(&self, ctx: &CallContext<'_>, prompt: &MediaPrompt) -> Result<MediaOutput> {
        self.run(ctx, image_input(prompt), AssetCategory::Image).await
    }

    async fn generate_video(&self, ctx: &CallContext<'_>, prompt: &MediaPrompt) -> Result<MediaOutput> {
        self.run(ctx, video_input(prompt), AssetCategory::Video).await
    }
}

#[derive(Debug, Deserialize)]
struct ReplicatePrediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<ReplicateOutput>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum ReplicateOutput {
    One(String),
    Many(Vec<String>),
}

impl ReplicateOutput {
    fn first(&self) -> Option<&str> {
        match self {
            ReplicateOutput::One(url) => Some(url),
            ReplicateOutput::Many(urls) => urls.first().map(String::as_str),
        }
    }
}

impl ReplicatePrediction {
    fn snapshot(&self) -> JobSnapshot {
        match self.status.as_str() {
            "succeeded" => JobSnapshot {
                status: JobStatus::Succeeded,
                output_url: self.output.as_ref().and_then(|o| o.first()).map(str::to_string),
                error: None,
            },
            "failed" | "canceled" => JobSnapshot::failed(match &self.error {
                Some(Value::String(message)) => message.clone(),
                Some(other) if !other.is_null() => other.to_string(),
                _ => self.status.clone(),
            }),
            "starting" => JobSnapshot {
                status: JobStatus::Queued,
                output_url: None,
                error: None,
            },
            _ => JobSnapshot::running(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::testing::TestContext;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> ReplicateProvider {
        ReplicateProvider::with_base_url(server.uri(), Duration::from_secs(5)).unwrap()
    }

    fn prediction(status: &str, output: Value) -> Value {
        json!({"id": "p1", "status": status, "output": output, "error": null})
    }

    async fn mount_output(server: &MockServer, file: &str, content_type: &str) -> String {
        Mock::given(method("GET"))
            .and(path(format!("/files/{}", file)))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![1u8; 16])
                    .insert_header("content-type", content_type),
            )
            .mount(server)
            .await;
        format!("{}/files/{}", server.uri(), file)
    }

    #[test]
    fn test_status_mapping() {
        let p = |status: &str| ReplicatePrediction {
            id: "p".to_string(),
            status: status.to_string(),
            output: Some(ReplicateOutput::Many(vec!["https://x/1.png".to_string()])),
            error: Some(json!("boom")),
        };
        assert_eq!(p("starting").snapshot().status, JobStatus::Queued);
        assert_eq!(p("processing").snapshot().status, JobStatus::Running);
        assert_eq!(p("succeeded").snapshot().output_url.as_deref(), Some("https://x/1.png"));
        assert_eq!(p("failed").snapshot().error.as_deref(), Some("boom"));
        assert_eq!(p("canceled").snapshot().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_image_polls_until_succeeded() {
        let server = MockServer::start().await;
        let output = mount_output(&server, "out.webp", "image/webp").await;

        Mock::given(method("POST"))
            .and(path("/v1/models/black-forest-labs/flux-schnell/predictions"))
            .and(header("authorization", "Bearer r8-test"))
            .and(body_partial_json(json!({"input": {"prompt": "a lighthouse"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(prediction("starting", Value::Null)))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(prediction("processing", Value::Null)))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(prediction("succeeded", json!([output]))))
            .expect(1)
            .mount(&server)
            .await;

        let test = TestContext::new("r8-test");
        let media = provider(&server)
            .generate_image(
                &test.ctx("black-forest-labs/flux-schnell"),
                &MediaPrompt {
                    prompt: "a lighthouse".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(media.content_type, "image/webp");
        assert_eq!(media.size_bytes, 16);
        assert_eq!(test.storage.objects()[0].category, AssetCategory::Image);
    }

    #[tokio::test]
    async fn test_pinned_version_video() {
        let server = MockServer::start().await;
        let output = mount_output(&server, "clip", "application/octet-stream").await;

        Mock::given(method("POST"))
            .and(path("/v1/predictions"))
            .and(body_partial_json(json!({
                "version": "abc123",
                "input": {"prompt": "waves", "first_frame_image": "https://img/1.png"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(prediction("processing", Value::Null)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(prediction("succeeded", json!(output))))
            .mount(&server)
            .await;

        let test = TestContext::new("r8-test");
        let media = provider(&server)
            .generate_video(
                &test.ctx("minimax/video-01:abc123"),
                &MediaPrompt {
                    prompt: "waves".to_string(),
                    image_url: Some("https://img/1.png".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(media.content_type, "video/mp4");
        assert!(media.url.ends_with(".mp4"));
    }

    #[tokio::test]
    async fn test_failed_prediction_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/models/minimax/video-01/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(prediction("starting", Value::Null)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "p1", "status": "failed", "output": null, "error": "NSFW content detected"
            })))
            .mount(&server)
            .await;

        let test = TestContext::new("r8-test");
        let err = provider(&server)
            .generate_video(&test.ctx("minimax/video-01"), &MediaPrompt::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Transient { .. }));
        assert!(test.storage.is_empty());
    }

    #[tokio::test]
    async fn test_flaky_status_request_is_retried() {
        let server = MockServer::start().await;
        let output = mount_output(&server, "out.png", "image/png").await;

        Mock::given(method("POST"))
            .and(path("/v1/models/owner/model/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(prediction("starting", Value::Null)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(prediction("succeeded", json!([output]))))
            .mount(&server)
            .await;

        let test = TestContext::new("r8-test");
        let media = provider(&server)
            .generate_image(&test.ctx("owner/model"), &MediaPrompt::default())
            .await
            .unwrap();
        assert!(media.url.ends_with(".png"));
    }

    #[tokio::test]
    async fn test_never_finishing_prediction_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/models/minimax/video-01/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(prediction("starting", Value::Null)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/predictions/p1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(prediction("processing", Value::Null)))
            .expect(3)
            .mount(&server)
            .await;

        let mut test = TestContext::new("r8-test");
        test.polling.max_attempts = 3;
        let err = provider(&server)
            .generate_video(&test.ctx("minimax/video-01"), &MediaPrompt::default())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Timeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_cancel_requests_remote_cancel() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/models/minimax/video-01/predictions"))
            .respond_with(ResponseTemplate::new(201).set_body_json(prediction("starting", Value::Null)))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/predictions/p1/cancel"))
            .respond_with(ResponseTemplate::new(200).set_body_json(prediction("canceled", Value::Null)))
            .expect(1)
            .mount(&server)
            .await;

        let test = TestContext::new("r8-test");
        test.cancel.cancel();
        let err = provider(&server)
            .generate_video(&test.ctx("minimax/video-01"), &MediaPrompt::default())
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
