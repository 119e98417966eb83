//! Language models behind a uniform decision contract.
//!
//! A [`DecisionAgent`] receives a [`DecisionRequest`] (serialized situation, legal options,
//! optional pass option, time budget) and always answers with a [`DecisionResponse`]: either one
//! of the legal option ids or [`Choice::Forfeit`]. It never fails. Malformed answers are retried
//! with a clarification, provider failures are retried with exponential backoff, and every
//! attempt is returned as an [`Exchange`] for the audit trail.
//!
//! Agents are described in the benchmark file:
//!
//! ```yaml
//! agents:
//!   - id: claude
//!     model: anthropic/claude-sonnet-4
//!     prompt_style: reasoned
//!     retry_budget: 2
//!     pool: pools/claude.txt
//!   - id: baseline
//!     backend: first-option
//!     pool: pools/baseline.txt
//! ```

pub mod matcher;
pub mod openrouter;
pub mod prompt;
pub mod provider;

use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, info, instrument, warn};

use crate::run_context::CancelToken;
use matcher::match_choice;
use openrouter::OpenRouterProvider;
use prompt::{build_prompt, clarification, PromptStyle};
use provider::{BackoffPolicy, CompletionRequest, LlmProvider, ProviderError};

/// Where an agent's answers come from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// OpenRouter or any OpenAI-compatible chat-completions endpoint.
    #[default]
    Openrouter,
    /// Always picks the first legal option.
    FirstOption,
    /// Always forfeits.
    Forfeit,
}

/// Immutable description of one benchmarked agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Name of the environment variable holding the API key, never the key itself.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_decision_timeout_ms")]
    pub decision_timeout_ms: u64,
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub prompt_style: PromptStyle,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub temperature: Option<f32>,
}

fn default_endpoint() -> String {
    openrouter::DEFAULT_ENDPOINT.to_string()
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".to_string()
}

fn default_decision_timeout_ms() -> u64 {
    60_000
}

fn default_retry_budget() -> u32 {
    2
}

fn default_max_tokens() -> u32 {
    512
}

impl AgentConfig {
    pub fn new(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            backend: BackendKind::default(),
            endpoint: default_endpoint(),
            api_key_env: default_api_key_env(),
            decision_timeout_ms: default_decision_timeout_ms(),
            retry_budget: default_retry_budget(),
            backoff: BackoffPolicy::default(),
            prompt_style: PromptStyle::default(),
            max_tokens: default_max_tokens(),
            temperature: None,
        }
    }

    /// A deterministic agent that needs no provider.
    pub fn baseline(id: impl Into<String>, backend: BackendKind) -> Self {
        let mut config = Self::new(id, backend_label(backend));
        config.backend = backend;
        config
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }
}

fn backend_label(backend: BackendKind) -> &'static str {
    match backend {
        BackendKind::Openrouter => "openrouter",
        BackendKind::FirstOption => "first-option",
        BackendKind::Forfeit => "forfeit",
    }
}

impl Eq for AgentConfig {}

impl Hash for AgentConfig {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.model.hash(state);
    }
}

/// One legal option of a decision point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionOption {
    pub id: String,
    #[serde(default)]
    pub label: String,
}

impl DecisionOption {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRequest {
    pub context: String,
    pub options: Vec<DecisionOption>,
    /// Option to submit on forfeit, when the decision point has one.
    pub pass_option: Option<String>,
    /// Budget of the whole decision, retries and backoff included.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind", content = "id")]
pub enum Choice {
    Selected(String),
    Forfeit,
}

/// One prompt/response round trip with the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub timestamp: String,
    pub agent: String,
    pub model: String,
    pub attempt: u32,
    pub prompt: String,
    pub raw_response: Option<String>,
    pub parsed_choice: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionResponse {
    pub choice: Choice,
    pub exchanges: Vec<Exchange>,
}

impl DecisionResponse {
    pub fn is_forfeit(&self) -> bool {
        self.choice == Choice::Forfeit
    }
}

enum Backend {
    Llm(Arc<dyn LlmProvider>),
    FirstOption,
    Forfeit,
}

/// A configured agent ready to answer decisions. Shared between all matches it plays in.
pub struct DecisionAgent {
    config: Arc<AgentConfig>,
    backend: Backend,
    cancel: Option<CancelToken>,
}

impl std::fmt::Debug for DecisionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionAgent")
            .field("id", &self.config.id)
            .field("backend", &self.config.backend)
            .finish()
    }
}

impl DecisionAgent {
    /// Build the backend named by the configuration. Fails when provider credentials are missing.
    pub fn from_config(config: Arc<AgentConfig>) -> Result<Self, ProviderError> {
        let backend = match config.backend {
            BackendKind::Openrouter => Backend::Llm(Arc::new(OpenRouterProvider::new(
                &config.endpoint,
                &config.api_key_env,
            )?)),
            BackendKind::FirstOption => Backend::FirstOption,
            BackendKind::Forfeit => Backend::Forfeit,
        };
        Ok(Self {
            config,
            backend,
            cancel: None,
        })
    }

    /// Use `provider` regardless of the configured backend kind.
    pub fn with_provider(config: Arc<AgentConfig>, provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            config,
            backend: Backend::Llm(provider),
            cancel: None,
        }
    }

    /// Abort backoff waits when `cancel` fires.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &Arc<AgentConfig> {
        &self.config
    }

    /// Answer one decision point. Never fails: exhaustion yields [`Choice::Forfeit`].
    #[instrument(skip_all, fields(agent = %self.config.id))]
    pub fn decide(&self, request: &DecisionRequest) -> DecisionResponse {
        if request.options.is_empty() {
            warn!("decision without options");
            return DecisionResponse {
                choice: Choice::Forfeit,
                exchanges: vec![],
            };
        }
        match &self.backend {
            Backend::Llm(provider) => self.decide_with(provider.as_ref(), request),
            Backend::FirstOption => {
                let first = request.options[0].id.clone();
                self.baseline(request, Choice::Selected(first))
            }
            Backend::Forfeit => self.baseline(request, Choice::Forfeit),
        }
    }

    fn baseline(&self, request: &DecisionRequest, choice: Choice) -> DecisionResponse {
        let parsed = match &choice {
            Choice::Selected(id) => Some(id.clone()),
            Choice::Forfeit => None,
        };
        let prompt = build_prompt(self.config.prompt_style, request, None);
        let exchange = self.exchange(1, prompt, None, parsed, None);
        DecisionResponse {
            choice,
            exchanges: vec![exchange],
        }
    }

    /// Retry loop bounded by `request.timeout` as a whole: every attempt and backoff wait only
    /// gets what is left of it.
    fn decide_with(
        &self,
        provider: &dyn LlmProvider,
        request: &DecisionRequest,
    ) -> DecisionResponse {
        let config = &self.config;
        let deadline = Instant::now() + request.timeout;
        let mut exchanges = vec![];
        let mut clarify: Option<String> = None;
        let mut malformed = 0;
        let mut provider_failures = 0;

        for attempt in 1.. {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(attempts = attempt - 1, "decision timeout reached, forfeiting decision");
                break;
            }
            let prompt = build_prompt(config.prompt_style, request, clarify.as_deref());
            let completion = CompletionRequest {
                model: config.model.clone(),
                prompt: prompt.clone(),
                max_tokens: config.max_tokens,
                temperature: config.temperature,
                timeout: remaining,
            };

            let (raw, problem) = match provider.complete(&completion) {
                Ok(raw) => match match_choice(config.prompt_style, &raw, &request.options) {
                    Ok(id) => {
                        let parsed = Some(id.clone());
                        exchanges.push(self.exchange(attempt, prompt, Some(raw), parsed, None));
                        return DecisionResponse {
                            choice: Choice::Selected(id),
                            exchanges,
                        };
                    }
                    Err(failure) => (Some(raw), failure.to_string()),
                },
                Err(ProviderError::InvalidResponse(reason)) => {
                    (None, format!("unreadable response: {reason}"))
                }
                Err(err) => {
                    let error = Some(err.to_string());
                    exchanges.push(self.exchange(attempt, prompt, None, None, error));
                    if !err.is_retryable() {
                        error!(%err, "provider rejected the request, forfeiting decision");
                        break;
                    }
                    if provider_failures >= config.backoff.max_retries {
                        warn!(
                            %err,
                            retries = provider_failures,
                            "provider still failing, forfeiting decision"
                        );
                        break;
                    }
                    let delay = config
                        .backoff
                        .delay(provider_failures, err.retry_after())
                        .min(deadline.saturating_duration_since(Instant::now()));
                    provider_failures += 1;
                    warn!(%err, ?delay, "provider failure, backing off");
                    if !self.wait(delay) {
                        break;
                    }
                    continue;
                }
            };

            exchanges.push(self.exchange(attempt, prompt, raw, None, Some(problem.clone())));
            malformed += 1;
            if malformed > config.retry_budget {
                warn!(attempts = attempt, "retry budget exhausted, forfeiting decision");
                break;
            }
            clarify = Some(clarification(&problem, &request.options));
        }

        DecisionResponse {
            choice: Choice::Forfeit,
            exchanges,
        }
    }

    /// Sleep for `delay`, returning `false` if the run was cancelled meanwhile.
    fn wait(&self, delay: Duration) -> bool {
        match &self.cancel {
            Some(cancel) => cancel.sleep(delay),
            None => {
                std::thread::sleep(delay);
                true
            }
        }
    }

    fn exchange(
        &self,
        attempt: u32,
        prompt: String,
        raw_response: Option<String>,
        parsed_choice: Option<String>,
        error: Option<String>,
    ) -> Exchange {
        info!(
            target: "exchange",
            agent = %self.config.id,
            model = %self.config.model,
            attempt,
            prompt = %prompt,
            raw_response = ?raw_response,
            parsed_choice = ?parsed_choice,
            error = ?error,
            "agent exchange"
        );
        Exchange {
            timestamp: now_rfc3339(),
            agent: self.config.id.clone(),
            model: self.config.model.clone(),
            attempt,
            prompt,
            raw_response,
            parsed_choice,
            error,
        }
    }
}

pub(crate) fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    struct Scripted(Mutex<VecDeque<Result<String, ProviderError>>>);

    impl Scripted {
        fn new(script: Vec<Result<String, ProviderError>>) -> Arc<Self> {
            Arc::new(Self(Mutex::new(script.into())))
        }
    }

    impl LlmProvider for Scripted {
        fn complete(&self, _: &CompletionRequest) -> Result<String, ProviderError> {
            self.0
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("nonsense".to_string()))
        }
    }

    fn config(retry_budget: u32) -> Arc<AgentConfig> {
        let mut config = AgentConfig::new("tester", "mock/model");
        config.retry_budget = retry_budget;
        config.backoff = BackoffPolicy {
            initial_ms: 1,
            max_ms: 4,
            max_retries: 2,
        };
        Arc::new(config)
    }

    fn request() -> DecisionRequest {
        DecisionRequest {
            context: "Your turn.".into(),
            options: vec![
                DecisionOption::new("attack", "Attack with all creatures"),
                DecisionOption::new("pass", "Pass priority"),
            ],
            pass_option: Some("pass".into()),
            timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn clarification_added_on_retry() {
        let provider = Scripted::new(vec![Ok("hmm".into()), Ok("attack".into())]);
        let agent = DecisionAgent::with_provider(config(1), provider);
        let response = agent.decide(&request());
        assert_eq!(response.choice, Choice::Selected("attack".into()));
        assert_eq!(response.exchanges.len(), 2);
        assert!(!response.exchanges[0].prompt.contains("could not be used"));
        assert!(response.exchanges[1].prompt.contains("could not be used"));
    }

    #[test]
    fn transient_failures_back_off_then_forfeit() {
        let provider = Scripted::new(vec![
            Err(ProviderError::Timeout(Duration::from_secs(1))),
            Err(ProviderError::Unavailable("down".into())),
            Err(ProviderError::RateLimited { retry_after: None }),
        ]);
        let agent = DecisionAgent::with_provider(config(3), provider);
        let response = agent.decide(&request());
        assert!(response.is_forfeit());
        // one initial attempt plus max_retries
        assert_eq!(response.exchanges.len(), 3);
    }

    #[test]
    fn transient_failure_then_success() {
        let provider = Scripted::new(vec![
            Err(ProviderError::Transport("reset".into())),
            Ok("pass".into()),
        ]);
        let agent = DecisionAgent::with_provider(config(0), provider);
        assert_eq!(agent.decide(&request()).choice, Choice::Selected("pass".into()));
    }

    #[test]
    fn unreadable_body_uses_the_clarification_budget() {
        let provider = Scripted::new(vec![
            Err(ProviderError::InvalidResponse("expected value at line 1".into())),
            Err(ProviderError::InvalidResponse("expected value at line 1".into())),
            Ok("pass".into()),
        ]);
        let agent = DecisionAgent::with_provider(config(2), provider);
        let response = agent.decide(&request());
        assert_eq!(response.choice, Choice::Selected("pass".into()));
        assert_eq!(response.exchanges.len(), 3);
        assert!(response.exchanges[1].prompt.contains("unreadable response"));

        // max_retries would allow two more attempts, the retry budget does not
        let provider = Scripted::new(vec![
            Err(ProviderError::InvalidResponse("truncated".into())),
            Ok("pass".into()),
        ]);
        let response = DecisionAgent::with_provider(config(0), provider).decide(&request());
        assert!(response.is_forfeit());
        assert_eq!(response.exchanges.len(), 1);
    }

    #[test]
    fn zero_timeout_forfeits_without_asking() {
        let provider = Scripted::new(vec![Ok("attack".into())]);
        let agent = DecisionAgent::with_provider(config(2), provider);
        let mut request = request();
        request.timeout = Duration::ZERO;
        let response = agent.decide(&request);
        assert!(response.is_forfeit());
        assert!(response.exchanges.is_empty());
    }

    #[test]
    fn auth_error_forfeits_immediately() {
        let provider = Scripted::new(vec![Err(ProviderError::Auth("bad key".into()))]);
        let agent = DecisionAgent::with_provider(config(5), provider);
        let response = agent.decide(&request());
        assert!(response.is_forfeit());
        assert_eq!(response.exchanges.len(), 1);
    }

    #[test]
    fn baselines() {
        let first = AgentConfig::baseline("first", BackendKind::FirstOption);
        let first = DecisionAgent::from_config(Arc::new(first)).unwrap();
        assert_eq!(first.decide(&request()).choice, Choice::Selected("attack".into()));

        let quitter = AgentConfig::baseline("quitter", BackendKind::Forfeit);
        let quitter = DecisionAgent::from_config(Arc::new(quitter)).unwrap();
        assert!(quitter.decide(&request()).is_forfeit());
    }

    #[test]
    fn config_defaults_from_yaml() {
        let config: AgentConfig =
            serde_yaml::from_str("id: a\nmodel: m\nprompt_style: json\n").unwrap();
        assert_eq!(config.prompt_style, PromptStyle::Json);
        assert_eq!(config.backend, BackendKind::Openrouter);
        assert_eq!(config.retry_budget, 2);
        assert_eq!(config.api_key_env, "OPENROUTER_API_KEY");
    }
}
