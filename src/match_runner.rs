use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, instrument, warn};

use crate::agent::DecisionAgent;
use crate::deck::Deck;
use crate::engine::adapter::{EngineAdapter, GameSetup};
use crate::engine::OrchestrationError;
use crate::results::log::{LogRecord, MatchClosed, ResultSink};
use crate::results::{AbortReason, MatchResult, MatchStatus};

/// One side of a match.
#[derive(Debug, Clone)]
pub struct Seat {
    pub agent: Arc<DecisionAgent>,
    pub deck: Arc<Deck>,
    /// Deck file handed to the engine.
    pub deck_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct MatchSpec {
    id: String,
    seats: [Seat; 2],
    format: String,
    games: u32,
    first_game: u32,
}

impl MatchSpec {
    /// Fails unless the seats hold two distinct agents, each with its own deck.
    pub fn new(
        id: impl Into<String>,
        seats: [Seat; 2],
        format: impl Into<String>,
        games: u32,
    ) -> Result<Self, OrchestrationError> {
        let id = id.into();
        if seats[0].agent.id() == seats[1].agent.id() {
            return Err(OrchestrationError::SameAgent {
                match_id: id,
                agent: seats[0].agent.id().to_string(),
            });
        }
        for seat in &seats {
            if seat.deck.owner() != seat.agent.id() {
                warn!(
                    match_id = %id,
                    agent = seat.agent.id(),
                    owner = seat.deck.owner(),
                    "deck built from another seat's pool"
                );
            }
        }
        Ok(Self {
            id,
            seats,
            format: format.into(),
            games,
            first_game: 1,
        })
    }

    /// Start at `first_game`, earlier games being already logged.
    pub fn resume_at(mut self, first_game: u32) -> Self {
        self.first_game = first_game.max(1);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agents(&self) -> [String; 2] {
        [
            self.seats[0].agent.id().to_string(),
            self.seats[1].agent.id().to_string(),
        ]
    }

    pub fn games(&self) -> u32 {
        self.games
    }

    pub fn first_game(&self) -> u32 {
        self.first_game
    }

    /// Seats by engine seat for `game`: the first seat moves first in odd games.
    fn seat_order(game: u32) -> [usize; 2] {
        if game % 2 == 1 {
            [0, 1]
        } else {
            [1, 0]
        }
    }

    fn closing_record(&self, status: MatchStatus) -> LogRecord {
        LogRecord::Match(MatchClosed {
            match_id: self.id.clone(),
            agents: self.agents(),
            games_planned: self.games,
            status,
        })
    }
}

impl std::fmt::Display for MatchSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)?;
        if self.first_game > 1 {
            write!(f, " (from game {})", self.first_game)?;
        }
        Ok(())
    }
}

/// Play the remaining games of `spec`, appending every game and the closing record to `sink`.
///
/// Every scheduled game is played; the match stops early only on engine crash, protocol error,
/// spawn failure or cancellation. A cancelled match is left unclosed so a later run resumes it.
#[instrument(skip_all, fields(match_id = %spec.id))]
pub fn run_match(spec: &MatchSpec, adapter: &EngineAdapter, sink: &ResultSink) -> MatchResult {
    let mut games = vec![];
    let mut status = MatchStatus::Completed;
    for game in spec.first_game..=spec.games {
        if adapter.is_cancelled() {
            status = cancelled();
            break;
        }
        let order = MatchSpec::seat_order(game);
        let setup = GameSetup {
            match_id: &spec.id,
            game,
            seats: order.map(|i| spec.seats[i].agent.as_ref()),
            deck_files: order.map(|i| spec.seats[i].deck_file.as_path()),
            format: &spec.format,
        };
        match adapter.play_game(&setup) {
            Ok(result) => {
                sink.append(LogRecord::Game(result.clone()));
                let abort = AbortReason::from_game(result.reason).map(|reason| {
                    let detail = result.detail.clone();
                    MatchStatus::Aborted {
                        reason,
                        detail: detail.unwrap_or_else(|| result.reason.to_string()),
                    }
                });
                games.push(result);
                if let Some(aborted) = abort {
                    status = aborted;
                    break;
                }
            }
            Err(OrchestrationError::Cancelled) => {
                status = cancelled();
                break;
            }
            Err(e) => {
                warn!(target: "run", match_id = %spec.id, "match aborted: {e}");
                status = MatchStatus::Aborted {
                    reason: AbortReason::SpawnFailure,
                    detail: e.to_string(),
                };
                break;
            }
        }
    }

    let was_cancelled = matches!(
        status,
        MatchStatus::Aborted {
            reason: AbortReason::Cancelled,
            ..
        }
    );
    if !was_cancelled {
        sink.append(spec.closing_record(status.clone()));
    }
    let result = MatchResult::new(
        spec.id.clone(),
        spec.agents(),
        spec.games,
        spec.first_game - 1,
        games,
        status,
    );
    info!(score = result.score_line(), status = ?result.status, "match over");
    result
}

fn cancelled() -> MatchStatus {
    MatchStatus::Aborted {
        reason: AbortReason::Cancelled,
        detail: "run cancelled".to_string(),
    }
}

/// Close a match whose worker died without a result.
pub fn worker_failure(spec: &MatchSpec, detail: String, sink: &ResultSink) -> MatchResult {
    let status = MatchStatus::Aborted {
        reason: AbortReason::WorkerFailure,
        detail,
    };
    sink.append(spec.closing_record(status.clone()));
    MatchResult::new(
        spec.id.clone(),
        spec.agents(),
        spec.games,
        spec.first_game - 1,
        vec![],
        status,
    )
}
