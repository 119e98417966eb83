//! Headless rules engine integration.
//!
//! One engine subprocess plays one game. It is launched with arguments expanded from a template,
//! writes JSON events on stdout one per line, and blocks on decision points until the chosen
//! option id is written back on its stdin. See [`protocol`] for the event shapes and
//! [`adapter`] for the game loop.

pub mod adapter;
pub mod process;
pub mod protocol;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How to launch the engine and what to expect from it.
///
/// ```yaml
/// engine:
///   command: java
///   args: ["-jar", "forge-headless.jar", "{deck0}", "{deck1}", "--format", "{format}", "--seed", "{seed}"]
///   protocol_version: "1"
///   game_time_limit_secs: 1800
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub command: String,
    /// Launch arguments. `{deck0}`, `{deck1}`, `{format}`, `{game}`, `{seed}` and `{match}` are
    /// substituted.
    #[serde(default = "default_args")]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Output lines starting with this prefix are logged and skipped.
    #[serde(default = "default_comment_prefix")]
    pub comment_prefix: String,
    #[serde(default)]
    pub game_time_limit_secs: Option<u64>,
    #[serde(default = "default_spawn_retries")]
    pub spawn_retries: u32,
    #[serde(default = "default_spawn_backoff_ms")]
    pub spawn_backoff_ms: u64,
    #[serde(default)]
    pub ram_per_engine_mb: Option<usize>,
    #[serde(default)]
    pub cpus_per_engine: Option<usize>,
    /// How often a worker waiting on engine output checks for cancellation.
    #[serde(default = "default_cancel_poll_ms")]
    pub cancel_poll_ms: u64,
}

fn default_args() -> Vec<String> {
    ["{deck0}", "{deck1}", "{format}"].map(String::from).to_vec()
}

fn default_protocol_version() -> String {
    "1".to_string()
}

fn default_comment_prefix() -> String {
    "#".to_string()
}

fn default_spawn_retries() -> u32 {
    2
}

fn default_spawn_backoff_ms() -> u64 {
    500
}

fn default_cancel_poll_ms() -> u64 {
    100
}

impl EngineConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: None,
            protocol_version: default_protocol_version(),
            comment_prefix: default_comment_prefix(),
            game_time_limit_secs: None,
            spawn_retries: default_spawn_retries(),
            spawn_backoff_ms: default_spawn_backoff_ms(),
            ram_per_engine_mb: None,
            cpus_per_engine: None,
            cancel_poll_ms: default_cancel_poll_ms(),
        }
    }

    /// Launch arguments of one game.
    pub fn expand_args(&self, launch: &LaunchParams) -> Vec<String> {
        let seed = launch.seed.to_string();
        let game = launch.game.to_string();
        let deck0 = launch.deck_files[0].to_string_lossy();
        let deck1 = launch.deck_files[1].to_string_lossy();
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{deck0}", &deck0)
                    .replace("{deck1}", &deck1)
                    .replace("{format}", launch.format)
                    .replace("{game}", &game)
                    .replace("{seed}", &seed)
                    .replace("{match}", launch.match_id)
            })
            .collect()
    }
}

/// Values substituted in the launch template.
#[derive(Debug, Clone, Copy)]
pub struct LaunchParams<'a> {
    pub match_id: &'a str,
    pub game: u32,
    /// Deck files by engine seat.
    pub deck_files: [&'a Path; 2],
    pub format: &'a str,
    pub seed: u64,
}

/// Deterministic per-game seed, FNV-1a of `"<match>:<game>"`.
pub fn game_seed(match_id: &str, game: u32) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;
    format!("{match_id}:{game}")
        .bytes()
        .fold(OFFSET, |hash, byte| (hash ^ u64::from(byte)).wrapping_mul(PRIME))
}

/// Failures around running a match, as opposed to outcomes of its games.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("could not spawn engine after {attempts} attempts: {message}")]
    Spawn { attempts: u32, message: String },
    #[error("run cancelled")]
    Cancelled,
    #[error("match {match_id} needs two distinct agents, got {agent} twice")]
    SameAgent { match_id: String, agent: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expansion() {
        let mut engine = EngineConfig::new("forge", vec![]);
        engine.args = ["--decks", "{deck0},{deck1}", "-f", "{format}", "{match}#{game}", "{seed}"]
            .map(String::from)
            .to_vec();
        let args = engine.expand_args(&LaunchParams {
            match_id: "a-vs-b-m1",
            game: 2,
            deck_files: [Path::new("/d/a.dck"), Path::new("/d/b.dck")],
            format: "sealed",
            seed: 42,
        });
        assert_eq!(
            args,
            vec!["--decks", "/d/a.dck,/d/b.dck", "-f", "sealed", "a-vs-b-m1#2", "42"]
        );
    }

    #[test]
    fn seeds_are_stable_and_distinct() {
        assert_eq!(game_seed("m", 1), game_seed("m", 1));
        assert_ne!(game_seed("m", 1), game_seed("m", 2));
        assert_eq!(game_seed("", 0), {
            let mut h: u64 = 0xcbf2_9ce4_8422_2325;
            for b in b":0" {
                h = (h ^ u64::from(*b)).wrapping_mul(0x100_0000_01b3);
            }
            h
        });
    }

    #[test]
    fn yaml_defaults() {
        let engine: EngineConfig = serde_yaml::from_str("command: forge\n").unwrap();
        assert_eq!(engine.args, vec!["{deck0}", "{deck1}", "{format}"]);
        assert_eq!(engine.protocol_version, "1");
        assert_eq!(engine.comment_prefix, "#");
        assert_eq!(engine.spawn_retries, 2);
    }
}
