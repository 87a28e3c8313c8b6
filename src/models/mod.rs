pub mod provider;
pub mod registry;
pub mod credentials;
pub mod circuit_breaker;
pub mod polling;
pub mod http;
pub mod jobs;
pub mod manager;
pub mod openai;
pub mod anthropic;
pub mod gemini;
pub mod replicate;
pub mod elevenlabs;

#[cfg(test)]
pub(crate) mod testing;

pub use provider::{
    CallContext, Capability, CapabilityPayload, CapabilityRequest, CapabilityResult, EditPrompt,
    ExecuteOptions, MediaOutput, MediaParams, MediaPrompt, Message, MessageRole, Output, ProviderAdapter,
    ProviderInfo, SpeechPrompt, StreamChunk, TextOutput, TextPrompt, TextStream, TokenUsage,
};
pub use registry::{CapabilityRegistry, ProviderDefinition};
pub use credentials::{CredentialSnapshot, CredentialSource, EnvSource};
pub use circuit_breaker::{AttemptTicket, BreakerConfig, CircuitBreaker, CircuitSnapshot, CircuitState};
pub use polling::{AsyncJob, JobSnapshot, JobStatus, PollingConfig};
pub use jobs::{BackgroundJob, BackgroundJobStatus, BackgroundJobs};
pub use manager::{PersonaRequest, PersonaResult, ProviderManager, ProviderStatus};
pub use openai::OpenAIProvider;
pub use anthropic::AnthropicProvider;
pub use gemini::GeminiProvider;
pub use replicate::ReplicateProvider;
pub use elevenlabs::ElevenLabsProvider;
