//! OpenAI-compatible chat-completions provider (OpenRouter by default).

use std::time::Duration;

use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::provider::{CompletionRequest, LlmProvider, ProviderError};

pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1";

#[derive(Debug)]
pub struct OpenRouterProvider {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<serde_json::Value>,
}

impl OpenRouterProvider {
    /// Reads the bearer token from the environment variable `api_key_env`.
    pub fn new(endpoint: &str, api_key_env: &str) -> Result<Self, ProviderError> {
        let api_key = std::env::var(api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                ProviderError::Auth(format!("environment variable {api_key_env} is not set"))
            })?;
        let client = Client::builder()
            .user_agent(concat!("mtg-llm-bench/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

impl LlmProvider for OpenRouterProvider {
    fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        let body = ChatRequest {
            model: &request.model,
            messages: [ChatMessage {
                role: "user",
                content: &request.prompt,
            }],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .timeout(request.timeout)
            .json(&body)
            .send()
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(request.timeout)
                } else {
                    ProviderError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        debug!(%status, model = request.model, "provider responded");
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(ProviderError::Auth(response.text().unwrap_or_default()));
        }
        if status.is_server_error() {
            return Err(ProviderError::Unavailable(format!("HTTP {status}")));
        }
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(ProviderError::Transport(format!("HTTP {status}: {text}")));
        }

        let parsed: ChatResponse = response.json().map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout(request.timeout)
            } else {
                ProviderError::InvalidResponse(e.to_string())
            }
        })?;
        if let Some(error) = parsed.error {
            let code = error.code.as_ref().and_then(serde_json::Value::as_u64);
            return Err(match code {
                Some(429) => ProviderError::RateLimited { retry_after: None },
                Some(401) | Some(403) => ProviderError::Auth(error.message),
                _ => ProviderError::Unavailable(error.message),
            });
        }
        Ok(parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_an_auth_error() {
        let err = OpenRouterProvider::new(DEFAULT_ENDPOINT, "MTG_BENCH_TEST_KEY_THAT_IS_NOT_SET")
            .unwrap_err();

        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn error_body_parses() {
        let body: ChatResponse =
            serde_json::from_str(r#"{"error":{"message":"slow down","code":429}}"#).unwrap();
        assert!(body.choices.is_empty());
        assert_eq!(body.error.unwrap().code.and_then(|c| c.as_u64()), Some(429));
    }
}
