//! LLM provider seam.
//!
//! A provider turns one prompt into one text completion. Failures are classified so that the
//! decision loop can tell transient conditions (rate limits, timeouts, outages) from permanent
//! ones (rejected credentials).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// One completion request.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: Option<f32>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("rate limited by provider")]
    RateLimited { retry_after: Option<Duration> },

    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Rejected credentials will not get better by waiting.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ProviderError::Auth(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Something that can answer a prompt. Shared by every match the agent plays in.
pub trait LlmProvider: Send + Sync {
    fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError>;
}

/// Exponential backoff applied to provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffPolicy {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_ms: 500,
            max_ms: 30_000,
            max_retries: 4,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (0-based). A provider hint wins when it is larger, but
    /// never exceeds the ceiling.
    pub fn delay(&self, retry: u32, hint: Option<Duration>) -> Duration {
        let exponential = self
            .initial_ms
            .saturating_mul(1u64.checked_shl(retry).unwrap_or(u64::MAX));
        let ceiling = Duration::from_millis(self.max_ms);
        let delay = Duration::from_millis(exponential).min(ceiling);
        match hint {
            Some(hint) => delay.max(hint).min(ceiling),
            None => delay,
        }
    }
}
