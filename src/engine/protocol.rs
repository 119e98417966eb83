//! Engine stdout events.
//!
//! Every line is one JSON object tagged by `type`:
//!
//! ```text
//! {"type":"hello","protocol":"1","engine":"forge 1.6"}
//! {"type":"turn_started","turn":3,"active_seat":1}
//! {"type":"phase_changed","phase":"combat"}
//! {"type":"decision","seat":0,"context":{..},"options":[{"id":"a1","label":"Cast Shock"}],"pass":"pass"}
//! {"type":"game_ended","winner_seat":0,"reason":"life_total"}
//! {"type":"error","message":"..."}
//! ```
//!
//! The answer to a decision is the chosen option id on one line of stdin.

use serde::Deserialize;
use thiserror::Error;

use crate::agent::DecisionOption;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    Hello {
        protocol: String,
        #[serde(default)]
        engine: Option<String>,
    },
    TurnStarted {
        turn: u32,
        active_seat: usize,
    },
    PhaseChanged {
        phase: String,
    },
    #[serde(rename = "decision")]
    DecisionRequested {
        seat: usize,
        #[serde(default)]
        context: serde_json::Value,
        options: Vec<DecisionOption>,
        #[serde(default)]
        pass: Option<String>,
    },
    GameEnded {
        #[serde(default)]
        winner_seat: Option<usize>,
        #[serde(default)]
        reason: String,
    },
    #[serde(rename = "error")]
    EngineError {
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineProtocolError {
    #[error("unexpected engine output {line:?}: {reason}")]
    Unparseable { line: String, reason: String },
    #[error("engine speaks protocol {found}, expected {expected}")]
    VersionMismatch { expected: String, found: String },
    #[error("engine sent events before its hello")]
    MissingHello,
    #[error("decision for seat {seat} without options")]
    NoOptions { seat: usize },
    #[error("unknown seat {0}")]
    UnknownSeat(usize),
    #[error("unknown winner seat {0}")]
    UnknownWinner(usize),
}

/// Parse one line. Blank lines and comments give `Ok(None)`.
pub fn parse_line(
    line: &str,
    comment_prefix: &str,
) -> Result<Option<EngineEvent>, EngineProtocolError> {

    let trimmed = line.trim();
    if trimmed.is_empty() || (!comment_prefix.is_empty() && trimmed.starts_with(comment_prefix)) {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|e| EngineProtocolError::Unparseable {
            line: trimmed.chars().take(200).collect(),
            reason: e.to_string(),
        })
}

/// Text shown to the agent for a decision context.
pub fn context_text(context: &serde_json::Value) -> String {
    match context {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(text) => text.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
