//! Language-model provider boundary types.
//!
//! The provider adapters themselves live outside this workspace. These types
//! describe what crosses the boundary: a request, a response with usage, and a
//! closed set of failure kinds each carrying a retryable flag.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A generation request handed to a provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Model to use, provider default when unset.
    pub model: Option<String>,

    /// System prompt built by the prompt subsystem.
    pub system: Option<String>,

    /// User prompt.
    pub prompt: String,

    /// Ask the provider to stream chunks.
    pub stream: bool,
}

impl ProviderRequest {
    /// Create a new non-streaming request.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    /// Builder method to enable streaming.
    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Token and cost accounting for one provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub token_in: u64,
    pub token_out: u64,
    pub cost_usd: f64,
}

impl Usage {
    /// Create a usage record.
    pub fn new(token_in: u64, token_out: u64, cost_usd: f64) -> Self {
        Self {
            token_in,
            token_out,
            cost_usd,
        }
    }
}

/// A completed provider response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default)]
    pub usage: Usage,
}

/// Provider-side failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorKind {
    NotFound,
    Unavailable,
    ProtocolError,
    RateLimited,
    AuthenticationFailed,
    InvalidRequest,
    ContextLimitExceeded,
    Cancelled,
    ExecutionFailed,
}

impl ProviderErrorKind {
    /// Wire name of the kind, also used as the run `error_code`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Unavailable => "unavailable",
            Self::ProtocolError => "protocol_error",
            Self::RateLimited => "rate_limited",
            Self::AuthenticationFailed => "authentication_failed",
            Self::InvalidRequest => "invalid_request",
            Self::ContextLimitExceeded => "context_limit_exceeded",
            Self::Cancelled => "cancelled",
            Self::ExecutionFailed => "execution_failed",
        }
    }

    /// Retryable flag adapters use unless they know better.
    pub fn default_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable | Self::ProtocolError | Self::RateLimited | Self::ExecutionFailed
        )
    }
}

impl fmt::Display for ProviderErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified provider failure. The runtime trusts `retryable` verbatim.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Provider error ({kind}): {message}")]
pub struct ProviderError {
    pub kind: ProviderErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    /// Create an error with the kind's default retryable flag.
    pub fn new(kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: kind.default_retryable(),
        }
    }

    /// Override the retryable flag.
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::Unavailable, message)
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::RateLimited, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ProviderErrorKind::InvalidRequest, message)
    }
}
