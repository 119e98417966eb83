//! # MTG LLM Bench
//!
//! Benchmark language models against each other at Magic: The Gathering sealed play.
//!
//! It provides:
//! - Draft pool loading and validation against a card database ([`card_pool`])
//! - A uniform decision interface over LLM providers and deterministic baselines ([`agent`])
//! - A deck building dialogue producing format-legal decks ([`deck`])
//! - Games played by a headless rules engine subprocess speaking JSON lines ([`engine`])
//! - Matches scheduled with bounded parallelism, engines contained in Linux cgroups
//!   ([`orchestrator`], [`constraints`])
//! - An append-only result log and the report recomputed from it ([`results`])
//!
//! Each game runs in its own engine process. Every decision point of the engine is answered by
//! the agent owning the seat; an agent that cannot produce a usable answer forfeits the decision
//! and the engine gets the designated pass option instead, so games always terminate.
//!
//! # Documentation Overview
//!
//! - For the run lifecycle, see [`orchestrator::run_benchmark`] and
//!   [`RunContext`](crate::run_context::RunContext).
//! - For the benchmark file, see [`bench_config`].
//! - For behavior flags and resource limits, see
//!   [`Configuration`](crate::configuration::Configuration) and [`constraints`].
//! - For the engine wire format, see [`engine::protocol`].
//!
//! # Usage Example
//!
//! ```no_run
//! use std::path::Path;
//! use mtg_llm_bench::prelude::*;
//!
//! fn main() -> anyhow::Result<()> {
//!     let bench = BenchConfig::load(Path::new("bench.yaml"))?;
//!
//!     // engines without cgroup when it cannot be created
//!     let config = Configuration::from_env().with_allow_uncontained(true);
//!
//!     let report = run_benchmark(&bench, config, None, CancelToken::new())?;
//!     for (agent, stats) in &report.agents {
//!         println!("{agent}: {:.1}% over {} games", stats.win_rate * 100.0, stats.games);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The run directory `<output_dir>/<run id>` holds `results.jsonl` (the source of truth),
//! `report.json`, `pool_summary.json`, the decks under `decks/` and one decision log per game
//! under `games/`. Running again with the same run id resumes where the log stops.

pub use anyhow;

pub mod agent;
pub mod bench_config;
pub mod card_pool;
pub mod configuration;
pub mod constraints;
pub mod deck;
pub mod engine;
mod logger;
pub mod match_runner;
pub mod orchestrator;
pub mod pairing;
pub mod results;
pub mod run_context;
mod scheduler;

/// Commonly used types for quick access.
///
/// ```rust
/// use mtg_llm_bench::prelude::*;
/// ```
pub mod prelude {
    pub use crate::agent::{AgentConfig, BackendKind, DecisionAgent};
    pub use crate::bench_config::BenchConfig;
    pub use crate::configuration::Configuration;
    pub use crate::constraints::ConstraintsBuilder;
    pub use crate::orchestrator::{check_pools, run_benchmark};
    pub use crate::results::report::{recompute_report, BenchmarkReport};
    pub use crate::run_context::CancelToken;
}
