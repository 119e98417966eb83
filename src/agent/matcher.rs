//! Mapping a raw model answer onto one of the legal options.
//!
//! Matching is strict first (exact id), then fuzzy (case-insensitive id, then a unique label
//! containing the answer or contained in it). Anything ambiguous or absent is malformed.

use super::prompt::PromptStyle;
use super::DecisionOption;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MatchFailure {
    #[error("empty answer")]
    Empty,

    #[error("no option matches '{0}'")]
    NoMatch(String),

    #[error("'{answer}' matches several options: {candidates:?}")]
    Ambiguous {
        answer: String,
        candidates: Vec<String>,
    },
}

/// Resolve `raw` to an option id.
pub fn match_choice(
    style: PromptStyle,
    raw: &str,
    options: &[DecisionOption],
) -> Result<String, MatchFailure> {
    let answer = extract_answer(style, raw).ok_or(MatchFailure::Empty)?;

    if let Some(option) = options.iter().find(|o| o.id == answer) {
        return Ok(option.id.clone());
    }

    let lower = answer.to_lowercase();
    let by_id: Vec<&DecisionOption> = options
        .iter()
        .filter(|o| o.id.to_lowercase() == lower)
        .collect();
    if let [only] = by_id.as_slice() {
        return Ok(only.id.clone());
    }

    let by_label: Vec<&DecisionOption> = options
        .iter()
        .filter(|o| {
            let label = o.label.to_lowercase();
            !label.is_empty() && (label.contains(&lower) || lower.contains(&label))
        })
        .collect();
    match by_label.as_slice() {
        [only] => Ok(only.id.clone()),
        [] => Err(MatchFailure::NoMatch(answer)),
        many => Err(MatchFailure::Ambiguous {
            answer,
            candidates: many.iter().map(|o| o.id.clone()).collect(),
        }),
    }
}

/// The part of the response that is supposed to hold the answer.
pub fn extract_answer(style: PromptStyle, raw: &str) -> Option<String> {
    if style == PromptStyle::Json {
        if let Some(choice) = json_choice(raw) {
            return clean(&choice);
        }
    }

    if let Some(choice) = raw.lines().rev().find_map(choice_line) {
        return clean(choice);
    }

    raw.lines()
        .rev()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("```"))
        .find_map(clean)
}

fn choice_line(line: &str) -> Option<&str> {
    let line = line.trim().trim_start_matches(['*', '#', ' ']);
    let head = line.get(..7)?;
    if head.eq_ignore_ascii_case("choice:") {
        Some(&line[7..])
    } else {
        None
    }
}

fn json_choice(raw: &str) -> Option<String> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end < start {
        return None;
    }
    let value: serde_json::Value = serde_json::from_str(&raw[start..=end]).ok()?;
    match value.get("choice")? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn clean(answer: &str) -> Option<String> {
    let wrapper = |c: char| matches!(c, '`' | '"' | '\'' | '*') || c.is_whitespace();
    let cleaned = answer
        .trim_matches(wrapper)
        .trim_end_matches(['.', '!', ',', ';'])
        .trim_matches(wrapper);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> Vec<DecisionOption> {
        vec![
            DecisionOption::new("play-1", "Cast Dockworker Drone"),
            DecisionOption::new("play-2", "Cast Banishing Light"),
            DecisionOption::new("pass", "Pass priority"),
        ]
    }

    #[test]
    fn exact_and_case_insensitive_ids() {
        let opts = options();
        assert_eq!(match_choice(PromptStyle::Concise, "play-2\n", &opts).unwrap(), "play-2");
        assert_eq!(match_choice(PromptStyle::Concise, "`PASS`.", &opts).unwrap(), "pass");
    }

    #[test]
    fn reasoned_uses_choice_line() {
        let raw = "Drone is a fine two drop.\nBut pass keeps mana open.\n**CHOICE: play-1**";
        assert_eq!(match_choice(PromptStyle::Reasoned, raw, &options()).unwrap(), "play-1");
    }

    #[test]
    fn json_uses_choice_field() {
        let raw = "Sure!\n{\"choice\": \"pass\", \"why\": \"nothing to do\"}";
        assert_eq!(match_choice(PromptStyle::Json, raw, &options()).unwrap(), "pass");
    }

    #[test]
    fn label_substring_either_direction() {
        let opts = options();
        assert_eq!(match_choice(PromptStyle::Concise, "banishing light", &opts).unwrap(), "play-2");
        assert_eq!(
            match_choice(PromptStyle::Concise, "I will cast Dockworker Drone", &opts).unwrap(),
            "play-1"
        );
    }

    #[test]
    fn ambiguous_and_absent_are_malformed() {
        let opts = options();
        assert!(matches!(
            match_choice(PromptStyle::Concise, "cast", &opts),
            Err(MatchFailure::Ambiguous { .. })
        ));
        assert!(matches!(
            match_choice(PromptStyle::Concise, "attack with everything", &opts),
            Err(MatchFailure::NoMatch(_))
        ));
        assert_eq!(
            match_choice(PromptStyle::Concise, "  \n```\n", &opts),
            Err(MatchFailure::Empty)
        );
    }
}
