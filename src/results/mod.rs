//! Game and match outcomes, the append-only result log and the derived report.

pub mod log;
pub mod report;

use std::collections::BTreeMap;
use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Why a game ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GameEndReason {
    Concede,
    Forfeit,
    RulesLoss,
    Draw,
    Timeout,
    EngineCrash,
    ProtocolError,
    Aborted,
}

impl GameEndReason {
    /// Map the reason reported by the engine. Unknown reasons are rules losses (life, decking,
    /// poison...).
    pub fn from_engine(reason: &str) -> Self {
        match reason.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "concede" | "conceded" => GameEndReason::Concede,
            "forfeit" | "forfeited" => GameEndReason::Forfeit,
            "draw" => GameEndReason::Draw,
            _ => GameEndReason::RulesLoss,
        }
    }

    /// The match cannot go on after a game ending this way.
    pub fn aborts_match(self) -> bool {
        matches!(
            self,
            GameEndReason::EngineCrash | GameEndReason::ProtocolError | GameEndReason::Aborted
        )
    }
}

impl Display for GameEndReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            GameEndReason::Concede => "concede",
            GameEndReason::Forfeit => "forfeit",
            GameEndReason::RulesLoss => "rules-loss",
            GameEndReason::Draw => "draw",
            GameEndReason::Timeout => "timeout",
            GameEndReason::EngineCrash => "engine-crash",
            GameEndReason::ProtocolError => "protocol-error",
            GameEndReason::Aborted => "aborted",
        };
        f.write_str(text)
    }
}

/// Outcome of one game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameResult {
    pub match_id: String,
    /// 1-based game index within the match.
    pub game: u32,
    /// Agent ids by engine seat for this game.
    pub seats: [String; 2],
    pub winner: Option<String>,
    pub reason: GameEndReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub turns: u32,
    pub decisions: BTreeMap<String, u32>,
    pub forfeits: BTreeMap<String, u32>,
    pub duration_ms: u64,
    /// Per-game exchange log, relative to the run directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision_log: Option<String>,
}

impl GameResult {
    pub fn loser(&self) -> Option<&str> {
        let winner = self.winner.as_deref()?;
        self.seats.iter().map(String::as_str).find(|s| *s != winner)
    }
}

/// Why a match stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AbortReason {
    EngineCrash,
    ProtocolError,
    SpawnFailure,
    Cancelled,
    WorkerFailure,
}

impl AbortReason {
    pub fn from_game(reason: GameEndReason) -> Option<Self> {
        match reason {
            GameEndReason::EngineCrash => Some(AbortReason::EngineCrash),
            GameEndReason::ProtocolError => Some(AbortReason::ProtocolError),
            GameEndReason::Aborted => Some(AbortReason::Cancelled),
            _ => None,
        }
    }
}

impl Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AbortReason::EngineCrash => "engine-crash",
            AbortReason::ProtocolError => "protocol-error",
            AbortReason::SpawnFailure => "spawn-failure",
            AbortReason::Cancelled => "cancelled",
            AbortReason::WorkerFailure => "worker-failure",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "status")]
pub enum MatchStatus {
    Completed,
    Aborted { reason: AbortReason, detail: String },
}

impl MatchStatus {
    pub fn is_completed(&self) -> bool {
        matches!(self, MatchStatus::Completed)
    }
}

/// Games of one match played by a worker, with the derived tally.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub match_id: String,
    pub agents: [String; 2],
    pub games_planned: u32,
    pub games: Vec<GameResult>,
    pub status: MatchStatus,
    pub partial: bool,
    pub wins: BTreeMap<String, u32>,
    pub draws: u32,
    pub unresolved: u32,
}

impl MatchResult {
    /// `prior_games` counts games logged by an earlier run of the same match.
    pub fn new(
        match_id: String,
        agents: [String; 2],
        games_planned: u32,
        prior_games: u32,
        games: Vec<GameResult>,
        status: MatchStatus,
    ) -> Self {
        let mut wins: BTreeMap<String, u32> = agents.iter().map(|a| (a.clone(), 0)).collect();
        let mut draws = 0;
        let mut unresolved = 0;
        for game in &games {
            match &game.winner {
                Some(winner) => *wins.entry(winner.clone()).or_default() += 1,
                None if game.reason == GameEndReason::Draw => draws += 1,
                None => unresolved += 1,
            }
        }
        let partial = prior_games + (games.len() as u32) < games_planned;
        Self {
            match_id,
            agents,
            games_planned,
            games,
            status,
            partial,
            wins,
            draws,
            unresolved,
        }
    }

    /// `a-b` score line in agent order.
    pub fn score_line(&self) -> String {
        let a = self.wins.get(&self.agents[0]).copied().unwrap_or(0);
        let b = self.wins.get(&self.agents[1]).copied().unwrap_or(0);
        if self.draws > 0 {
            format!("{a}-{b}-{}", self.draws)
        } else {
            format!("{a}-{b}")
        }
    }
}
