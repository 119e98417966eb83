//! Prompt construction.
//!
//! Prompts are a pure function of the style, the request and the optional clarification, so
//! that two runs with the same configuration send the same text.

use serde::{Deserialize, Serialize};

use super::{DecisionOption, DecisionRequest};

/// Closed set of prompt variations, selected per agent in the benchmark file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PromptStyle {
    /// Answer with the option id only.
    #[default]
    Concise,
    /// Short reasoning, then a final `CHOICE: <id>` line.
    Reasoned,
    /// A JSON object `{"choice": "<id>"}`.
    Json,
}

impl PromptStyle {
    fn answer_instruction(self) -> &'static str {
        match self {
            PromptStyle::Concise => "Respond with the ID of your chosen option only, on a single line.",
            PromptStyle::Reasoned => {
                "Think briefly about the options, then end your answer with a final line of the form `CHOICE: <id>`."
            }
            PromptStyle::Json => {
                "Respond with a JSON object of the form {\"choice\": \"<id>\"} and nothing else."
            }
        }
    }
}

/// Build the prompt for one attempt.
pub fn build_prompt(
    style: PromptStyle,
    request: &DecisionRequest,
    clarification: Option<&str>,
) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are playing Magic: The Gathering.\n\n");
    prompt.push_str("=== SITUATION ===\n");
    prompt.push_str(request.context.trim_end());
    prompt.push_str("\n\n=== OPTIONS ===\n");
    for option in &request.options {
        prompt.push_str(&format!("{}: {}\n", option.id, option.label));
    }
    if let Some(pass) = &request.pass_option {
        prompt.push_str(&format!("(`{pass}` passes or concedes.)\n"));
    }
    prompt.push('\n');
    prompt.push_str(style.answer_instruction());
    if let Some(clarification) = clarification {
        prompt.push_str("\n\n");
        prompt.push_str(clarification);
    }
    prompt
}

/// Instruction appended after an answer could not be matched.
pub fn clarification(problem: &str, options: &[DecisionOption]) -> String {
    let ids = options
        .iter()
        .map(|o| o.id.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Your previous answer could not be used ({problem}). \
         Answer with exactly one of these IDs: {ids}."
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn request() -> DecisionRequest {
        DecisionRequest {
            context: "Turn 3, your main phase.".into(),
            options: vec![
                DecisionOption::new("play-1", "Cast Dockworker Drone"),
                DecisionOption::new("pass", "Pass priority"),
            ],
            pass_option: Some("pass".into()),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn prompt_is_deterministic_and_lists_options() {
        let a = build_prompt(PromptStyle::Reasoned, &request(), None);
        let b = build_prompt(PromptStyle::Reasoned, &request(), None);
        assert_eq!(a, b);
        assert!(a.contains("play-1: Cast Dockworker Drone"));
        assert!(a.contains("CHOICE: <id>"));
    }

    #[test]
    fn clarification_is_appended() {
        let text = clarification("no option matched 'attack'", &request().options);
        let prompt = build_prompt(PromptStyle::Concise, &request(), Some(&text));
        assert!(prompt.ends_with("Answer with exactly one of these IDs: play-1, pass."));
    }
}
