//! Aggregate statistics recomputed from the result log.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::log::{read_log, LogRecord, MatchClosed, SeatExclusion};
use super::{GameEndReason, GameResult, MatchResult, MatchStatus};

pub const RESULT_LOG_FILE: &str = "results.jsonl";
pub const REPORT_FILE: &str = "report.json";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub games: u32,
    pub wins: u32,
    pub losses: u32,
    pub draws: u32,
    /// Games with no winner that were not draws (timeouts, crashes).
    pub unresolved: u32,
    /// Wins over resolved games.
    pub win_rate: f64,
    /// Average turn count of resolved games.
    pub avg_game_turns: f64,
    pub decisions: u32,
    pub forfeits: u32,
    /// Forfeits over decisions.
    pub forfeit_rate: f64,
    pub match_wins: u32,
    pub match_losses: u32,
    pub match_draws: u32,
    pub matches_aborted: u32,
    #[serde(skip)]
    resolved_turns: u64,
}

impl AgentStats {
    fn add_game(&mut self, agent: &str, game: &GameResult) {
        self.games += 1;
        match game.winner.as_deref() {
            Some(winner) if winner == agent => self.wins += 1,
            Some(_) => self.losses += 1,
            None if game.reason == GameEndReason::Draw => self.draws += 1,
            None => self.unresolved += 1,
        }
        if game.winner.is_some() || game.reason == GameEndReason::Draw {
            self.resolved_turns += u64::from(game.turns);
        }
        self.decisions += game.decisions.get(agent).copied().unwrap_or(0);
        self.forfeits += game.forfeits.get(agent).copied().unwrap_or(0);
    }

    fn finish(&mut self) {
        let resolved = self.games - self.unresolved;
        self.win_rate = ratio(u64::from(self.wins), u64::from(resolved));
        self.avg_game_turns = ratio(self.resolved_turns, u64::from(resolved));
        self.forfeit_rate = ratio(u64::from(self.forfeits), u64::from(self.decisions));
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSummary {
    pub match_id: String,
    pub agents: [String; 2],
    pub games_planned: u32,
    pub games_played: u32,
    pub score: String,
    /// Match winner, for completed matches only.
    pub winner: Option<String>,
    #[serde(flatten)]
    pub status: MatchStatus,
    pub partial: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Totals {
    pub matches: u32,
    pub matches_completed: u32,
    pub matches_aborted: u32,
    pub games: u32,
    pub decisions: u32,
    pub forfeits: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkReport {
    pub run_id: String,
    pub matches: Vec<MatchSummary>,
    pub agents: BTreeMap<String, AgentStats>,
    pub excluded_seats: Vec<SeatExclusion>,
    pub totals: Totals,
}

/// Fold every closed match of `records` into a report.
///
/// The last record of a given match and game wins; games of matches never closed are ignored.
pub fn build_report(run_id: &str, records: &[LogRecord]) -> BenchmarkReport {
    let mut games: BTreeMap<&str, BTreeMap<u32, &GameResult>> = BTreeMap::new();
    let mut closed: BTreeMap<&str, &MatchClosed> = BTreeMap::new();
    let mut excluded = BTreeSet::new();
    for record in records {
        match record {
            LogRecord::Game(game) if game.reason != GameEndReason::Aborted => {
                games
                    .entry(game.match_id.as_str())
                    .or_default()
                    .insert(game.game, game);
            }
            LogRecord::Game(_) => {}
            LogRecord::Match(close) => {
                closed.insert(close.match_id.as_str(), close);
            }
            LogRecord::SeatExcluded(seat) => {
                excluded.insert(seat.clone());
            }
        }
    }

    let mut agents: BTreeMap<String, AgentStats> = BTreeMap::new();
    let mut totals = Totals::default();
    let mut matches = vec![];
    for (match_id, close) in closed {
        let played: Vec<GameResult> = games
            .get(match_id)
            .map(|games| games.values().map(|g| (*g).clone()).collect())
            .unwrap_or_default();
        let result = MatchResult::new(
            match_id.to_string(),
            close.agents.clone(),
            close.games_planned,
            0,
            played,
            close.status.clone(),
        );

        for game in &result.games {
            totals.games += 1;
            for agent in &result.agents {
                agents.entry(agent.clone()).or_default().add_game(agent, game);
            }
            totals.decisions += game.decisions.values().sum::<u32>();
            totals.forfeits += game.forfeits.values().sum::<u32>();
        }

        let winner = match_winner(&result);
        totals.matches += 1;
        if result.status.is_completed() {
            totals.matches_completed += 1;
            for agent in &result.agents {
                let stats = agents.entry(agent.clone()).or_default();
                match winner.as_deref() {
                    Some(w) if w == agent => stats.match_wins += 1,
                    Some(_) => stats.match_losses += 1,
                    None => stats.match_draws += 1,
                }
            }
        } else {
            totals.matches_aborted += 1;
            for agent in &result.agents {
                agents.entry(agent.clone()).or_default().matches_aborted += 1;
            }
        }

        matches.push(MatchSummary {
            score: result.score_line(),
            games_played: result.games.len() as u32,
            winner,
            match_id: result.match_id,
            agents: result.agents,
            games_planned: result.games_planned,
            status: result.status,
            partial: result.partial,
        });
    }
    agents.values_mut().for_each(AgentStats::finish);

    BenchmarkReport {
        run_id: run_id.to_string(),
        matches,
        agents,
        excluded_seats: excluded.into_iter().collect(),
        totals,
    }
}

fn match_winner(result: &MatchResult) -> Option<String> {
    if !result.status.is_completed() {
        return None;
    }
    let [a, b] = &result.agents;
    let wins_a = result.wins.get(a).copied().unwrap_or(0);
    let wins_b = result.wins.get(b).copied().unwrap_or(0);
    match wins_a.cmp(&wins_b) {
        std::cmp::Ordering::Greater => Some(a.clone()),
        std::cmp::Ordering::Less => Some(b.clone()),
        std::cmp::Ordering::Equal => None,
    }
}

/// Rebuild the report of the run stored in `run_dir` from its result log.
pub fn recompute_report(run_dir: &Path) -> anyhow::Result<BenchmarkReport> {
    let records = read_log(&run_dir.join(RESULT_LOG_FILE))?;
    let run_id = run_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(build_report(&run_id, &records))
}

pub fn write_report(run_dir: &Path, report: &BenchmarkReport) -> anyhow::Result<()> {
    let text = serde_json::to_string_pretty(report).context("could not serialize report")?;
    let tmp = run_dir.join(format!("{REPORT_FILE}.tmp"));
    std::fs::write(&tmp, text).with_context(|| format!("could not write {}", tmp.display()))?;
    std::fs::rename(&tmp, run_dir.join(REPORT_FILE)).context("could not move report in place")?;
    Ok(())
}

impl BenchmarkReport {
    /// Plain-text leaderboard, best win rate first.
    pub fn summary_table(&self) -> String {
        let mut rows: Vec<(&String, &AgentStats)> = self.agents.iter().collect();
        rows.sort_by(|(a, x), (b, y)| y.win_rate.total_cmp(&x.win_rate).then_with(|| a.cmp(b)));

        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<24} {:>6} {:>5} {:>5} {:>5} {:>6} {:>8} {:>9} {:>8}",
            "agent", "games", "won", "lost", "drawn", "unres", "win rate", "forfeits", "matches"
        );
        for (agent, stats) in rows {
            let _ = writeln!(
                out,
                "{:<24} {:>6} {:>5} {:>5} {:>5} {:>6} {:>7.1}% {:>8.1}% {:>2}-{}-{}",
                agent,
                stats.games,
                stats.wins,
                stats.losses,
                stats.draws,
                stats.unresolved,
                stats.win_rate * 100.0,
                stats.forfeit_rate * 100.0,
                stats.match_wins,
                stats.match_losses,
                stats.match_draws,
            );
        }
        let _ = writeln!(
            out,
            "{} matches ({} aborted), {} games",
            self.totals.matches, self.totals.matches_aborted, self.totals.games
        );
        for seat in &self.excluded_seats {
            let _ = writeln!(out, "excluded {} at {}: {}", seat.agent, seat.stage, seat.reason);
        }
        out
    }
}
