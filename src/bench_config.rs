//! The benchmark file.
//!
//! ```yaml
//! run:
//!   run_id_prefix: sealed-eval
//!   output_dir: runs
//!   games_per_match: 3
//!   max_parallel_engines: 4
//!   format: sealed
//!   pairing:
//!     kind: round-robin
//!     matches_per_pair: 2
//! engine:
//!   command: java
//!   args: ["-jar", "forge-headless.jar", "{deck0}", "{deck1}", "{format}", "{seed}"]
//! formats:
//!   sealed:
//!     pool_size: { min: 84, max: 90 }
//!     set: FDN
//! card_database: cards/oracle.json
//! agents:
//!   - id: claude
//!     model: anthropic/claude-sonnet-4
//!     pool: pools/claude.txt
//!   - id: baseline
//!     backend: first-option
//!     pool: pools/baseline.txt
//!     deck: decks/baseline.txt
//! ```
//!
//! Relative paths are resolved against the directory of the benchmark file. Everything is
//! immutable once loaded.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::instrument;

use crate::agent::AgentConfig;
use crate::constraints::ConstraintsBuilder;
use crate::deck::FormatRules;
use crate::engine::EngineConfig;
use crate::pairing::Pairing;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read benchmark file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid benchmark file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid benchmark file: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchConfig {
    #[serde(default)]
    pub run: RunConfig,
    pub engine: EngineConfig,
    #[serde(default)]
    pub formats: BTreeMap<String, FormatRules>,
    pub card_database: PathBuf,
    pub agents: Vec<AgentEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub run_id_prefix: String,
    pub output_dir: PathBuf,
    /// Every game of a match is played ("best-of-N" names the length, not an early stop).
    pub games_per_match: u32,
    pub max_parallel_engines: Option<usize>,
    /// Key into `formats`.
    pub format: String,
    pub pairing: Pairing,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            run_id_prefix: "bench".to_string(),
            output_dir: PathBuf::from("runs"),
            games_per_match: 3,
            max_parallel_engines: None,
            format: "sealed".to_string(),
            pairing: Pairing::default(),
        }
    }
}

/// One seat: the agent plus where its cards come from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentEntry {
    #[serde(flatten)]
    pub config: AgentConfig,
    /// Draft export of the agent's pool.
    pub pool: PathBuf,
    /// Fixed decklist to use instead of building one.
    #[serde(default)]
    pub deck: Option<PathBuf>,
}

impl BenchConfig {
    #[instrument]
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::from_yaml(&text)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    /// Parse and validate without touching relative paths.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let mut config: BenchConfig = serde_yaml::from_str(text)?;
        if !config.formats.contains_key(&config.run.format) {
            if config.run.format != "sealed" {
                return Err(ConfigError::Invalid(format!(
                    "format {} is not defined under formats",
                    config.run.format
                )));
            }
            config
                .formats
                .insert("sealed".to_string(), FormatRules::default());
        }
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.agents.len() < 2 {
            return invalid("at least two agents are required".into());
        }
        let mut seen = HashSet::new();
        for agent in &self.agents {
            let id = &agent.config.id;
            if id.is_empty()
                || !id
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return invalid(format!(
                    "agent id {id:?} must be non-empty and only use letters, digits, '_', '-' or '.'"
                ));
            }
            if !seen.insert(id.as_str()) {
                return invalid(format!("duplicate agent id {id}"));
            }
        }
        if self.run.games_per_match == 0 {
            return invalid("games_per_match must be at least 1".into());
        }
        if self.run.pairing.matches_per_pair() == 0 {
            return invalid("matches_per_pair must be at least 1".into());
        }
        if let Pairing::Gauntlet { challenger, .. } = &self.run.pairing {
            if !seen.contains(challenger.as_str()) {
                return invalid(format!("gauntlet challenger {challenger} is not an agent"));
            }
        }
        if self.engine.command.trim().is_empty() {
            return invalid("engine command is empty".into());
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        resolve(&mut self.card_database);
        resolve(&mut self.run.output_dir);
        if let Some(dir) = &mut self.engine.working_dir {
            resolve(dir);
        }
        for agent in &mut self.agents {
            resolve(&mut agent.pool);
            if let Some(deck) = &mut agent.deck {
                resolve(deck);
            }
        }
    }

    /// Rules of the format of this run.
    pub fn format_rules(&self) -> Result<&FormatRules, ConfigError> {
        self.formats
            .get(&self.run.format)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown format {}", self.run.format)))
    }

    /// Resource settings of the file, to be completed or overridden by the environment.
    pub fn constraints(&self) -> ConstraintsBuilder {
        let mut builder = ConstraintsBuilder::new();
        if let Some(ram) = self.engine.ram_per_engine_mb {
            builder = builder.with_ram_per_engine(ram);
        }
        if let Some(cpus) = self.engine.cpus_per_engine {
            builder = builder.with_cpus_per_engine(cpus);
        }
        if let Some(parallel) = self.run.max_parallel_engines {
            builder = builder.with_max_parallel_engines(parallel);
        }
        if let Some(secs) = self.engine.game_time_limit_secs {
            builder = builder.with_game_time_limit(Duration::from_secs(secs));
        }
        builder
    }
}
