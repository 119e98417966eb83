use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mtg_llm_bench::agent::provider::{CompletionRequest, LlmProvider, ProviderError};
use mtg_llm_bench::agent::{AgentConfig, Choice, DecisionAgent, DecisionOption, DecisionRequest};

mod common;

/// Replays canned answers, repeating the last one forever.
struct Canned {
    answers: Mutex<VecDeque<String>>,
    calls: Mutex<u32>,
}

impl Canned {
    fn new(answers: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.iter().map(|a| a.to_string()).collect()),
            calls: Mutex::new(0),
        })
    }

    fn calls(&self) -> u32 {
        *self.calls.lock().unwrap()
    }
}

impl LlmProvider for Canned {
    fn complete(&self, _: &CompletionRequest) -> Result<String, ProviderError> {
        *self.calls.lock().unwrap() += 1;
        let mut answers = self.answers.lock().unwrap();
        let answer = if answers.len() > 1 {
            answers.pop_front()
        } else {
            answers.front().cloned()
        };
        answer.ok_or_else(|| ProviderError::Unavailable("no answer scripted".into()))
    }
}

fn agent(provider: Arc<Canned>, retry_budget: u32) -> DecisionAgent {
    let mut config = AgentConfig::new("llm", "test/model");
    config.retry_budget = retry_budget;
    DecisionAgent::with_provider(Arc::new(config), provider)
}

fn combat() -> DecisionRequest {
    DecisionRequest {
        context: "Your combat step. Opponent at 3 life.".to_string(),
        options: vec![
            DecisionOption::new("attack", "Attack with all creatures"),
            DecisionOption::new("pass", "Pass priority"),
        ],
        pass_option: Some("pass".to_string()),
        timeout: Duration::from_secs(5),
    }
}

#[test]
fn malformed_answers_are_retried_within_budget() {
    let provider = Canned::new(&["banana", "I am not sure", "attack"]);
    let response = agent(provider.clone(), 2).decide(&combat());

    assert_eq!(response.choice, Choice::Selected("attack".to_string()));
    assert_eq!(response.exchanges.len(), 3);
    assert_eq!(provider.calls(), 3);
    assert!(response.exchanges[0].error.is_some());
    assert!(response.exchanges[1].prompt.contains("could not be used"));
    assert_eq!(response.exchanges[2].parsed_choice.as_deref(), Some("attack"));
    let attempts: Vec<u32> = response.exchanges.iter().map(|e| e.attempt).collect();
    assert_eq!(attempts, [1, 2, 3]);
}

#[test]
fn exhausted_budget_forfeits() {
    let provider = Canned::new(&["banana"]);
    let response = agent(provider.clone(), 3).decide(&combat());

    assert!(response.is_forfeit());
    assert_eq!(response.exchanges.len(), 4);
    assert_eq!(provider.calls(), 4);
    assert!(response.exchanges.iter().all(|e| e.parsed_choice.is_none()));
}

/// Uses up the whole timeout it is given, then answers nonsense.
struct Stalling {
    timeouts: Mutex<Vec<Duration>>,
}

impl LlmProvider for Stalling {
    fn complete(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        self.timeouts.lock().unwrap().push(request.timeout);
        std::thread::sleep(request.timeout);
        Ok("gibberish".to_string())
    }
}

#[test]
fn decision_timeout_covers_every_retry() {
    let provider = Arc::new(Stalling {
        timeouts: Mutex::new(vec![]),
    });
    let mut config = AgentConfig::new("slow", "test/model");
    config.retry_budget = 3;
    let agent = DecisionAgent::with_provider(Arc::new(config), provider.clone());
    let mut request = combat();
    request.timeout = Duration::from_millis(300);

    let started = std::time::Instant::now();
    let response = agent.decide(&request);
    let elapsed = started.elapsed();

    assert!(response.is_forfeit());
    assert!(elapsed < Duration::from_millis(600), "decide took {elapsed:?}");
    let timeouts = provider.timeouts.lock().unwrap();
    assert_eq!(response.exchanges.len(), timeouts.len());
    assert!(timeouts.iter().all(|t| *t <= Duration::from_millis(300)));
}

#[test]
fn label_answers_are_matched() {
    let response = agent(Canned::new(&["Pass priority"]), 0).decide(&combat());
    assert_eq!(response.choice, Choice::Selected("pass".to_string()));
    assert_eq!(response.exchanges.len(), 1);
}

#[cfg(unix)]
mod through_the_engine {
    use super::*;
    use mtg_llm_bench::configuration::Configuration;
    use mtg_llm_bench::constraints::ConstraintsBuilder;
    use mtg_llm_bench::engine::adapter::{EngineAdapter, GameSetup};
    use mtg_llm_bench::engine::EngineConfig;
    use mtg_llm_bench::prelude::*;
    use mtg_llm_bench::results::GameEndReason;

    #[test]
    fn forfeiting_model_still_finishes_the_game() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("games")).unwrap();
        let decks = [dir.path().join("a.dck"), dir.path().join("b.dck")];
        for deck in &decks {
            std::fs::write(deck, "[Main]\n40 Plains\n").unwrap();
        }
        let engine = EngineConfig::new(
            "sh",
            vec![
                common::fixture("mock_engine.sh").display().to_string(),
                "{deck0}".into(),
                "{deck1}".into(),
                "{format}".into(),
            ],
        );
        let grant = ConstraintsBuilder::new()
            .with_total_cpu_count(1)
            .with_max_total_ram(1_000)
            .with_game_time_limit(Duration::from_secs(20))
            .build()
            .unwrap();
        let cancel = CancelToken::new();
        let adapter = EngineAdapter::new(
            &engine,
            Configuration::new().with_contain_engines(false),
            &grant,
            &cancel,
            Some(dir.path()),
        );

        let confused = agent(Canned::new(&["banana"]), 1);
        let baseline = DecisionAgent::from_config(Arc::new(AgentConfig::baseline(
            "baseline",
            BackendKind::FirstOption,
        )))
        .unwrap();
        let setup = GameSetup {
            match_id: "llm-vs-baseline-m1",
            game: 1,
            seats: [&confused, &baseline],
            deck_files: [decks[0].as_path(), decks[1].as_path()],
            format: "sealed",
        };

        let result = adapter.play_game(&setup).unwrap();
        assert_eq!(result.winner.as_deref(), Some("baseline"));
        assert_eq!(result.reason, GameEndReason::RulesLoss);
        assert_eq!(result.forfeits["llm"], 1);
        assert_eq!(result.decisions["baseline"], 1);

        let audit_path = dir.path().join("games/llm-vs-baseline-m1-g1.jsonl");
        let audit = std::fs::read_to_string(audit_path).unwrap();

        let submitted: Vec<serde_json::Value> = audit
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        // two exchanges for the confused seat, one for the baseline
        assert_eq!(submitted.len(), 3);
        assert!(submitted.iter().any(|entry| entry["submitted"] == "pass"));
    }
}
