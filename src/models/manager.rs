use arc_swap::ArcSwap;
use chrono::Utc;
use futures_util::StreamExt;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::{RouterConfig, RouterSettings};
use crate::error::{AttemptFailure, Error, ErrorKind, Result};
use crate::models::anthropic::AnthropicProvider;
use crate::models::circuit_breaker::CircuitBreaker;
use crate::models::credentials::{CredentialSnapshot, CredentialSource};
use crate::models::elevenlabs::ElevenLabsProvider;
use crate::models::gemini::GeminiProvider;
use crate::models::jobs::{BackgroundJob, BackgroundJobs};
use crate::models::openai::OpenAIProvider;
use crate::models::polling::{run_cancellable, CANCEL_GRACE};
use crate::models::provider::{
    CallContext, Capability, CapabilityPayload, CapabilityRequest, CapabilityResult, ExecuteOptions, Output,
    ProviderAdapter, ProviderInfo, TextStream, TokenUsage,
};
use crate::models::registry::{CapabilityRegistry, ProviderDefinition};
use crate::models::replicate::ReplicateProvider;
use crate::platform::{Clock, CredentialStore, SystemClock};
use crate::storage::ObjectStorage;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub healthy: bool,
    pub failure_count: u32,
    pub circuit_open: bool,
    pub half_open: bool,
    pub last_error_kind: Option<ErrorKind>,
    pub seconds_since_last_failure: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct PersonaRequest {
    pub image_prompt: String,
    /// Motion prompt for the follow-up video. Defaults to the image prompt.
    pub video_prompt: Option<String>,
}

#[derive(Debug)]
pub struct PersonaResult {
    pub image: CapabilityResult,
    /// Tracks the detached video generation.
    pub video_job: Uuid,
}

struct Candidate {
    definition: ProviderDefinition,
    adapter: Arc<dyn ProviderAdapter>,
    credential: SecretString,
}

struct Resolution {
    candidates: Vec<Candidate>,
    circuit_open: Vec<String>,
}

/// Picks providers for a capability and drives them in priority order until
/// one succeeds. Owns the breaker state; share it behind an `Arc`.
pub struct ProviderManager {
    registry: CapabilityRegistry,
    credentials: CredentialSource,
    breaker: CircuitBreaker,
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
    storage: Arc<dyn ObjectStorage>,
    settings: ArcSwap<RouterSettings>,
    jobs: BackgroundJobs,
}

impl ProviderManager {
    pub fn new(
        registry: CapabilityRegistry,
        credentials: CredentialSource,
        storage: Arc<dyn ObjectStorage>,
        settings: RouterSettings,
    ) -> Self {
        Self::with_clock(registry, credentials, storage, settings, Arc::new(SystemClock))
    }

    pub fn with_clock(
        registry: CapabilityRegistry,
        credentials: CredentialSource,
        storage: Arc<dyn ObjectStorage>,
        settings: RouterSettings,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            credentials,
            breaker: CircuitBreaker::with_clock(settings.breaker.clone(), clock),
            adapters: HashMap::new(),
            storage,
            settings: ArcSwap::from_pointee(settings),
            jobs: BackgroundJobs::new(),
        }
    }

    /// Builds a manager with every built-in adapter registered.
    pub fn from_config(
        config: &RouterConfig,
        store: Option<Arc<dyn CredentialStore>>,
        storage: Arc<dyn ObjectStorage>,
    ) -> Result<Self> {
        let registry = CapabilityRegistry::from_config(config)?;
        let credentials = CredentialSource::from_config(config, store);
        let mut manager = Self::new(registry, credentials, storage, config.settings());

        for adapter in default_adapters(config)? {
            manager.register_adapter(adapter);
        }
        Ok(manager)
    }

    pub fn register_adapter(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let name = adapter.provider_name().to_string();
        debug!("Registering adapter for provider: {}", name);
        self.adapters.insert(name, adapter);
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn settings(&self) -> Arc<RouterSettings> {
        self.settings.load_full()
    }

    pub fn reload_settings(&self, settings: RouterSettings) {
        info!("Reloading router settings");
        self.breaker.update_config(settings.breaker.clone());
        self.settings.store(Arc::new(settings));
    }

    fn candidate_names(&self, capability: Capability, pinned: Option<&str>) -> Vec<String> {
        self.registry
            .get_candidates(capability)
            .into_iter()
            .filter(|d| pinned.map_or(true, |p| d.name == p))
            .map(|d| d.name)
            .collect()
    }

    fn resolve_with(
        &self,
        capability: Capability,
        pinned: Option<&str>,
        credentials: &CredentialSnapshot,
    ) -> Result<Resolution> {
        let definitions: Vec<ProviderDefinition> = self
            .registry
            .get_candidates(capability)
            .into_iter()
            .filter(|d| pinned.map_or(true, |p| d.name == p))
            .collect();

        if let (Some(provider), true) = (pinned, definitions.is_empty()) {
            return Err(Error::validation(format!(
                "Provider {} does not offer {}",
                provider, capability
            )));
        }

        let mut candidates = Vec::new();
        let mut missing_credentials = Vec::new();
        let mut circuit_open = Vec::new();

        for definition in definitions {
            if !definition.implemented {
                debug!("Skipping {} for {}: not implemented", definition.name, capability);
                continue;
            }
            let Some(adapter) = self
                .adapters
                .get(&definition.name)
                .filter(|adapter| adapter.supports(capability))
            else {
                warn!(
                    "Provider {} is declared for {} but has no adapter, skipping",
                    definition.name, capability
                );
                continue;
            };
            let Some(credential) = credentials.get(&definition.name) else {
                debug!("Skipping {} for {}: no credential", definition.name, capability);
                missing_credentials.push(definition.name);
                continue;
            };
            if !self.breaker.should_attempt(&definition.name) {
                debug!("Skipping {} for {}: circuit open", definition.name, capability);
                circuit_open.push(definition.name);
                continue;
            }

            candidates.push(Candidate {
                adapter: adapter.clone(),
                credential: credential.clone(),
                definition,
            });
        }

        if candidates.is_empty() {
            if circuit_open.is_empty() {
                warn!(
                    "No credentialed provider for {} (missing: {})",
                    capability,
                    missing_credentials.join(", ")
                );
                return Err(Error::Configuration {
                    capability,
                    missing_credentials,
                });
            }
            warn!("Every provider for {} has an open circuit", capability);
            return Err(Error::NoProviderAvailable {
                capability,
                failures: Vec::new(),
                circuit_open,
            });
        }

        Ok(Resolution {
            candidates,
            circuit_open,
        })
    }

    /// Providers that would be tried for `capability` right now, in order.
    pub async fn resolve(&self, capability: Capability, options: &ExecuteOptions) -> Result<Vec<ProviderInfo>> {
        let pinned = options.provider.as_deref();
        let credentials = self
            .credentials
            .snapshot(&self.candidate_names(capability, pinned))
            .await;
        let resolution = self.resolve_with(capability, pinned, &credentials)?;

        Ok(resolution
            .candidates
            .into_iter()
            .map(|c| ProviderInfo {
                name: c.definition.name,
                capability,
                model: c.definition.model_id,
                priority: c.definition.priority,
            })
            .collect())
    }

    pub async fn resolve_provider(&self, capability: Capability) -> Result<ProviderInfo> {
        let mut candidates = self.resolve(capability, &ExecuteOptions::default()).await?;
        // resolve never returns an empty list
        Ok(candidates.remove(0))
    }

    pub async fn execute(
        &self,
        capability: Capability,
        request: CapabilityRequest,
        options: ExecuteOptions,
    ) -> Result<CapabilityResult> {
        let capability = match capability {
            Capability::Text if request.stream => Capability::TextStream,
            other => other,
        };
        if !request.payload.accepts(capability) {
            return Err(Error::validation(format!(
                "Request payload does not match capability {}",
                capability
            )));
        }

        let cancel = options.cancel.clone().unwrap_or_default();
        let settings = self.settings.load_full();
        let pinned = options.provider.as_deref();

        // One credential read per request, shared by every fallback attempt
        let credentials = self
            .credentials
            .snapshot(&self.candidate_names(capability, pinned))
            .await;
        let resolution = self.resolve_with(capability, pinned, &credentials)?;

        info!(
            "Executing {} request {} with {} candidate(s)",
            capability,
            request.id,
            resolution.candidates.len()
        );

        let mut failures = Vec::new();

        for candidate in &resolution.candidates {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let provider = &candidate.definition.name;
            let ticket = self.breaker.begin_attempt(provider);
            let start_time = Instant::now();

            match self.attempt(candidate, capability, &request, &cancel, &settings).await {
                Ok(result) => {
                    self.breaker.record_attempt_success(&ticket);
                    info!(
                        "{} request {} served by {} ({}) in {}ms",
                        capability,
                        request.id,
                        provider,
                        result.model_used,
                        start_time.elapsed().as_millis()
                    );
                    return Ok(result);
                }
                Err(e) if e.is_cancelled() => {
                    info!("{} request {} cancelled during {}", capability, request.id, provider);
                    return Err(e);
                }
                Err(e) => {
                    // Anything an adapter raises counts against it, e.g. a
                    // credential that cannot be encoded as a header.
                    let kind = e.classify().unwrap_or(ErrorKind::Transient);
                    self.breaker.record_failure(provider, kind);
                    warn!(
                        "{} failed for {} request {} [{}]: {}",
                        provider, capability, request.id, kind, e
                    );

                    if pinned.is_some() {
                        return Err(e);
                    }
                    failures.push(AttemptFailure {
                        provider: provider.clone(),
                        kind,
                        message: e.to_string(),
                    });
                }
            }
        }

        error!(
            "All {} candidate(s) failed for {} request {}",
            failures.len(),
            capability,
            request.id
        );
        Err(Error::NoProviderAvailable {
            capability,
            failures,
            circuit_open: resolution.circuit_open,
        })
    }

    /// Tries the candidate's primary model, then its fallback model once
    /// unless the provider reported a quota problem.
    async fn attempt(
        &self,
        candidate: &Candidate,
        capability: Capability,
        request: &CapabilityRequest,
        cancel: &CancellationToken,
        settings: &RouterSettings,
    ) -> Result<CapabilityResult> {
        let definition = &candidate.definition;
        let primary = self
            .invoke(candidate, &definition.model_id, capability, request, cancel, settings)
            .await;

        let error = match primary {
            Ok(result) => return Ok(result),
            Err(e) => e,
        };
        let Some(fallback_model) = definition.fallback_model_id.as_deref() else {
            return Err(error);
        };
        match error.classify() {
            Some(kind) if kind != ErrorKind::Quota => {
                debug!(
                    "{} model {} failed [{}], retrying with {}",
                    definition.name, definition.model_id, kind, fallback_model
                );
                self.invoke(candidate, fallback_model, capability, request, cancel, settings)
                    .await
            }
            _ => Err(error),
        }
    }

    async fn invoke(
        &self,
        candidate: &Candidate,
        model: &str,
        capability: Capability,
        request: &CapabilityRequest,
        cancel: &CancellationToken,
        settings: &RouterSettings,
    ) -> Result<CapabilityResult> {
        let provider = candidate.definition.name.as_str();
        debug!("Calling {} model {} for {}", provider, model, capability);

        let ctx = CallContext {
            model,
            credential: &candidate.credential,
            storage: self.storage.as_ref(),
            cancel,
            polling: &settings.polling,
        };
        let call = dispatch(candidate.adapter.as_ref(), capability, &request.payload, &ctx);

        // Polling adapters watch the token and cancel their remote job.
        let outcome = if candidate.adapter.is_async(capability) {
            run_cancellable(cancel, CANCEL_GRACE, call).await
        } else {
            let limit = settings.http.attempt_timeout();
            tokio::select! {
                _ = cancel.cancelled() => Err(Error::Cancelled),
                outcome = tokio::time::timeout(limit, call) => outcome.unwrap_or_else(|_| {
                    Err(Error::transient(provider, format!("attempt timed out after {:?}", limit)))
                }),
            }
        };

        let (output, usage) = outcome?;
        let output = match output {
            Output::Stream(stream) => Output::Stream(guard_stream(stream, cancel.clone())),
            other => other,
        };

        Ok(CapabilityResult {
            provider_used: provider.to_string(),
            model_used: model.to_string(),
            output,
            usage,
            completed_at: Utc::now(),
        })
    }

    pub fn provider_status(&self) -> Vec<ProviderStatus> {
        self.registry
            .providers()
            .into_iter()
            .map(|name| {
                let snapshot = self.breaker.snapshot(&name);
                ProviderStatus {
                    healthy: !snapshot.circuit_open && !snapshot.half_open,
                    failure_count: snapshot.failure_count,
                    circuit_open: snapshot.circuit_open,
                    half_open: snapshot.half_open,
                    last_error_kind: snapshot.last_error_kind,
                    seconds_since_last_failure: snapshot.seconds_since_last_failure,
                    name,
                }
            })
            .collect()
    }

    /// Generates the persona still and returns it right away. The video
    /// built from that still runs as a background job.
    pub async fn generate_persona(
        self: &Arc<Self>,
        request: PersonaRequest,
        options: ExecuteOptions,
    ) -> Result<PersonaResult> {
        let image = self
            .execute(
                Capability::Image,
                CapabilityRequest::image(request.image_prompt.clone()),
                options,
            )
            .await?;
        let image_url = image
            .media_url()
            .ok_or_else(|| Error::upstream_format(&image.provider_used, "persona image has no URL"))?
            .to_string();

        let video_prompt = request.video_prompt.unwrap_or(request.image_prompt);
        let manager = Arc::clone(self);
        let video_job = self.jobs.spawn("persona_video", move |cancel| async move {
            manager
                .execute(
                    Capability::Video,
                    CapabilityRequest::video(video_prompt, Some(image_url)),
                    ExecuteOptions::default().with_cancel(cancel),
                )
                .await
        });

        info!("Persona image ready via {}, video job {}", image.provider_used, video_job);
        Ok(PersonaResult { image, video_job })
    }

    pub fn background_job(&self, id: Uuid) -> Option<BackgroundJob> {
        self.jobs.get(id)
    }

    pub fn background_jobs(&self) -> Vec<BackgroundJob> {
        self.jobs.list()
    }

    pub fn cancel_background_job(&self, id: Uuid) -> bool {
        self.jobs.cancel(id)
    }
}

async fn dispatch(
    adapter: &dyn ProviderAdapter,
    capability: Capability,
    payload: &CapabilityPayload,
    ctx: &CallContext<'_>,
) -> Result<(Output, Option<TokenUsage>)> {
    match (capability, payload) {
        (Capability::Text, CapabilityPayload::Text(prompt)) => {
            let output = adapter.generate_text(ctx, prompt).await?;
            Ok((Output::Text(output.text), output.usage))
        }
        (Capability::TextStream, CapabilityPayload::Text(prompt)) => {
            let stream = adapter.generate_text_stream(ctx, prompt).await?;
            Ok((Output::Stream(stream), None))
        }
        (Capability::Image, CapabilityPayload::Image(prompt)) => {
            Ok((Output::Media(adapter.generate_image(ctx, prompt).await?), None))
        }
        (Capability::ImageEdit, CapabilityPayload::ImageEdit(prompt)) => {
            Ok((Output::Media(adapter.edit_image(ctx, prompt).await?), None))
        }
        (Capability::Video, CapabilityPayload::Video(prompt)) => {
            Ok((Output::Media(adapter.generate_video(ctx, prompt).await?), None))
        }
        (Capability::Speech, CapabilityPayload::Speech(prompt)) => {
            Ok((Output::Media(adapter.synthesize_speech(ctx, prompt).await?), None))
        }
        (capability, _) => Err(Error::validation(format!(
            "Request payload does not match capability {}",
            capability
        ))),
    }
}

/// Ends the stream with `Cancelled` as soon as the token fires.
fn guard_stream(stream: TextStream, cancel: CancellationToken) -> TextStream {
    Box::pin(async_stream::stream! {
        let mut stream = stream;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    yield Err(Error::Cancelled);
                    break;
                }
                item = stream.next() => match item {
                    Some(Ok(chunk)) => yield Ok(chunk),
                    Some(Err(e)) => {
                        yield Err(e);
                        break;
                    }
                    None => break,
                },
            }
        }
    })
}

fn default_adapters(config: &RouterConfig) -> Result<Vec<Arc<dyn ProviderAdapter>>> {
    let timeout = config.http.timeout();
    let base_url = |provider: &str| config.base_url(provider).map(str::to_string);

    let openai = match base_url("openai") {
        Some(url) => OpenAIProvider::with_base_url(url, timeout)?,
        None => OpenAIProvider::new(timeout)?,
    };
    let anthropic = match base_url("anthropic") {
        Some(url) => AnthropicProvider::with_base_url(url, timeout)?,
        None => AnthropicProvider::new(timeout)?,
    };
    let gemini = match base_url("gemini") {
        Some(url) => GeminiProvider::with_base_url(url, timeout)?,
        None => GeminiProvider::new(timeout)?,
    };
    let replicate = match base_url("replicate") {
        Some(url) => ReplicateProvider::with_base_url(url, timeout)?,
        None => ReplicateProvider::new(timeout)?,
    };
    let elevenlabs = match base_url("elevenlabs") {
        Some(url) => ElevenLabsProvider::with_base_url(url, timeout)?,
        None => ElevenLabsProvider::new(timeout)?,
    };

    Ok(vec![
        Arc::new(openai),
        Arc::new(anthropic),
        Arc::new(gemini),
        Arc::new(replicate),
        Arc::new(elevenlabs),
    ])
}
