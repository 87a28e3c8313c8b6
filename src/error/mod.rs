use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::provider::Capability;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Secure storage error: {0}")]
    SecureStorage(#[from] keyring::Error),

    #[error("No credentialed provider for {capability} (missing credentials: {})", missing_credentials.join(", "))]
    Configuration {
        capability: Capability,
        missing_credentials: Vec<String>,
    },

    #[error("No provider available for {capability}: {}", summarize(failures, circuit_open))]
    NoProviderAvailable {
        capability: Capability,
        failures: Vec<AttemptFailure>,
        circuit_open: Vec<String>,
    },

    #[error("{provider} quota exceeded: {message}")]
    QuotaExceeded { provider: String, message: String },

    #[error("{provider} transient failure: {message}")]
    Transient { provider: String, message: String },

    #[error("{provider} job timed out after {attempts} polls")]
    Timeout { provider: String, attempts: u32 },

    #[error("{provider} returned an unexpected payload: {message}")]
    UpstreamFormat { provider: String, message: String },

    #[error("Request cancelled")]
    Cancelled,

    #[error("{provider} does not support {capability}")]
    Unsupported {
        provider: String,
        capability: Capability,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Platform error: {0}")]
    Platform(String),
}

/// Failure classes the breaker and the fallback loop act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Quota,
    Transient,
    Timeout,
    UpstreamFormat,
}

impl ErrorKind {
    /// Quota and rate-limit signals open the circuit on first sight.
    pub fn trips_immediately(&self) -> bool {
        matches!(self, ErrorKind::Quota)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Quota => "quota",
            ErrorKind::Transient => "transient",
            ErrorKind::Timeout => "timeout",
            ErrorKind::UpstreamFormat => "upstream_format",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptFailure {
    pub provider: String,
    pub kind: ErrorKind,
    pub message: String,
}

fn summarize(failures: &[AttemptFailure], circuit_open: &[String]) -> String {
    let mut parts: Vec<String> = failures
        .iter()
        .map(|f| format!("{} [{}]: {}", f.provider, f.kind, f.message))
        .collect();
    if !circuit_open.is_empty() {
        parts.push(format!("circuit open: {}", circuit_open.join(", ")));
    }
    if parts.is_empty() {
        "no candidates".to_string()
    } else {
        parts.join("; ")
    }
}

fn quota_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(insufficient[_ ]quota|quota|rate[_ ]?limit|too many requests|resource[_ ]exhausted|credit balance)")
            .expect("quota pattern is valid")
    })
}

impl Error {
    pub fn quota(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::QuotaExceeded {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn transient(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::Transient {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn upstream_format(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Error::UpstreamFormat {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn platform(msg: impl Into<String>) -> Self {
        Error::Platform(msg.into())
    }

    /// Maps a non-success HTTP status and body to a provider error.
    pub fn from_status(provider: &str, status: u16, body: &str) -> Self {
        let message = format!("API error {}: {}", status, truncate(body, 512));
        let client_error = (400..500).contains(&status);
        if status == 429 || status == 402 || (client_error && quota_pattern().is_match(body)) {
            Error::quota(provider, message)
        } else {
            Error::transient(provider, message)
        }
    }

    /// Classification used by the manager. `None` means the error is not a
    /// provider failure (cancellation, caller mistakes) and must not be
    /// recorded against the breaker.
    pub fn classify(&self) -> Option<ErrorKind> {
        match self {
            Error::QuotaExceeded { .. } => Some(ErrorKind::Quota),
            Error::Timeout { .. } => Some(ErrorKind::Timeout),
            Error::UpstreamFormat { .. } | Error::Json(_) => Some(ErrorKind::UpstreamFormat),
            Error::Http(e) if e.is_decode() => Some(ErrorKind::UpstreamFormat),
            Error::Transient { .. }
            | Error::Http(_)
            | Error::Io(_)
            | Error::Storage(_)
            | Error::Unsupported { .. } => Some(ErrorKind::Transient),
            Error::Cancelled
            | Error::Validation(_)
            | Error::Configuration { .. }
            | Error::NoProviderAvailable { .. }
            | Error::Config(_)
            | Error::SecureStorage(_)
            | Error::Platform(_) => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Message safe to show to end users.
    pub fn user_message(&self) -> String {
        match self {
            Error::Configuration { .. }
            | Error::NoProviderAvailable { .. }
            | Error::QuotaExceeded { .. }
            | Error::Transient { .. }
            | Error::Timeout { .. }
            | Error::UpstreamFormat { .. }
            | Error::Unsupported { .. }
            | Error::Http(_)
            | Error::Storage(_) => {
                "AI service unavailable - contact your administrator".to_string()
            }
            Error::Cancelled => "Request cancelled".to_string(),
            Error::Validation(msg) => format!("Invalid request: {}", msg),
            _ => "Internal error".to_string(),
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
