//! Deck building dialogue.
//!
//! The agent is walked through a fixed sequence of decisions:
//!
//! ```text
//! AwaitPoolReview -> AwaitCardSelections -> AwaitFinalConfirmation -> Built
//!                          ^                        |
//!                          +------ revise ----------+
//! ```
//!
//! The result is always legal: an illegal selection is re-prompted once with the violation
//! explained, then auto-completed deterministically from the pool.

use std::sync::Arc;

use tracing::{info, instrument, warn};

use super::decklist::colors_of;
use super::{fill_basics, Deck, DeckLegalityError, FormatRules};
use crate::agent::{Choice, DecisionAgent, DecisionOption, DecisionRequest, Exchange};
use crate::card_pool::{Card, CardPool, COLORS};

/// The ten two-color pairs, in WUBRG order.
pub const COLOR_PAIRS: [[char; 2]; 10] = [
    ['W', 'U'],
    ['W', 'B'],
    ['W', 'R'],
    ['W', 'G'],
    ['U', 'B'],
    ['U', 'R'],
    ['U', 'G'],
    ['B', 'R'],
    ['B', 'G'],
    ['R', 'G'],
];

const DONE: &str = "done";
const CONFIRM: &str = "confirm";
const REVISE: &str = "revise";

#[derive(Debug, thiserror::Error)]
pub enum DeckBuildError {
    #[error("no legal deck can be built for seat '{seat}': {reason}")]
    Unsatisfiable { seat: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    AwaitPoolReview,
    AwaitCardSelections,
    AwaitFinalConfirmation,
    Built,
}

/// Outcome of a build: the deck and the transcript that produced it.
#[derive(Debug, Clone)]
pub struct BuiltDeck {
    pub deck: Deck,
    pub exchanges: Vec<Exchange>,
}

/// Run the whole dialogue for `pool`.
#[instrument(skip_all, fields(seat = %pool.seat(), agent = %agent.id()))]
pub fn build_deck(
    agent: &DecisionAgent,
    pool: Arc<CardPool>,
    rules: &FormatRules,
) -> Result<BuiltDeck, DeckBuildError> {
    rules
        .is_satisfiable(&pool)
        .map_err(|reason| DeckBuildError::Unsatisfiable {
            seat: pool.seat().to_string(),
            reason,
        })?;
    let mut builder = DeckBuilder::new(agent, pool, rules);
    while builder.state != BuildState::Built {
        builder.step()?;
    }
    let deck = builder.deck.take().ok_or_else(|| builder.unsatisfiable("no deck after build"))?;
    info!(
        cards = deck.total_cards(),
        colors = %deck.colors().iter().collect::<String>(),
        auto_completed = deck.auto_completed(),
        "deck built"
    );
    Ok(BuiltDeck {
        deck,
        exchanges: builder.exchanges,
    })
}

struct DeckBuilder<'a> {
    agent: &'a DecisionAgent,
    pool: Arc<CardPool>,
    rules: &'a FormatRules,
    state: BuildState,
    colors: Vec<char>,
    picks: Vec<usize>,
    second_chance_used: bool,
    notice: Option<String>,
    deck: Option<Deck>,
    exchanges: Vec<Exchange>,
}

impl<'a> DeckBuilder<'a> {
    fn new(agent: &'a DecisionAgent, pool: Arc<CardPool>, rules: &'a FormatRules) -> Self {
        Self {
            agent,
            pool,
            rules,
            state: BuildState::AwaitPoolReview,
            colors: vec![],
            picks: vec![],
            second_chance_used: false,
            notice: None,
            deck: None,
            exchanges: vec![],
        }
    }

    fn step(&mut self) -> Result<(), DeckBuildError> {
        match self.state {
            BuildState::AwaitPoolReview => self.review_pool(),
            BuildState::AwaitCardSelections => self.select_cards()?,
            BuildState::AwaitFinalConfirmation => self.confirm(),
            BuildState::Built => {}
        }
        Ok(())
    }

    fn ask(
        &mut self,
        context: String,
        options: Vec<DecisionOption>,
        pass: Option<&str>,
    ) -> Option<String> {
        let request = DecisionRequest {
            context,
            options,
            pass_option: pass.map(str::to_string),
            timeout: self.agent.config().decision_timeout(),
        };
        let response = self.agent.decide(&request);
        self.exchanges.extend(response.exchanges);
        match response.choice {
            Choice::Selected(id) => Some(id),
            Choice::Forfeit => None,
        }
    }

    fn review_pool(&mut self) {
        let options = COLOR_PAIRS
            .iter()
            .map(|pair| {
                DecisionOption::new(
                    pair.iter().collect::<String>(),
                    format!("{} ({} playable cards)", pair_name(pair), self.playable_count(pair)),
                )
            })
            .collect();
        let context = format!(
            "Deck building, step 1 of 3: review your sealed pool and choose the two colors of your deck.\n\nYour pool:\n{}",
            describe_pool(&self.pool)
        );

        let pair = match self.ask(context, options, None) {
            Some(id) => COLOR_PAIRS
                .iter()
                .find(|pair| pair.iter().collect::<String>() == id)
                .copied(),
            None => None,
        };
        let pair = pair.unwrap_or_else(|| {
            let best = self.best_pair();
            info!(colors = %best.iter().collect::<String>(), "no color choice, using best pair");
            best
        });
        self.colors = pair.to_vec();
        self.state = BuildState::AwaitCardSelections;
    }

    fn select_cards(&mut self) -> Result<(), DeckBuildError> {
        while self.picks.len() < self.rules.max_selections {
            let remaining: Vec<usize> = (0..self.pool.len())
                .filter(|i| !self.picks.contains(i))
                .collect();
            if remaining.is_empty() {
                break;
            }
            let mut options: Vec<DecisionOption> = remaining
                .iter()
                .filter_map(|&i| {
                    self.pool
                        .get(i)
                        .map(|card| DecisionOption::new(format!("card-{i}"), card.describe()))
                })
                .collect();
            options.push(DecisionOption::new(DONE, "Finish selecting cards"));

            let context = self.selection_context();
            match self.ask(context, options, Some(DONE)) {
                Some(id) if id == DONE => break,
                Some(id) => match id.strip_prefix("card-").and_then(|i| i.parse::<usize>().ok()) {
                    Some(index) if index < self.pool.len() && !self.picks.contains(&index) => {
                        self.picks.push(index)
                    }
                    _ => break,
                },
                None => break,
            }
        }
        self.validate()
    }

    fn selection_context(&self) -> String {
        let picked = self.picks.iter().filter_map(|i| self.pool.get(*i));
        let nonland = picked.clone().filter(|c| !c.is_land()).count();
        let mut context = format!(
            "Deck building, step 2 of 3: select the cards of your {} deck one at a time.\n\
             Rules: at least {} nonland cards and {} cards in total. {}\n\
             Selected so far ({} cards, {} nonland):\n",
            pair_name(&self.colors),
            self.rules.min_nonland,
            self.rules.min_deck_size,
            if self.rules.basic_lands_unlimited {
                "Basic lands are added automatically."
            } else {
                "Lands must come from your pool."
            },
            self.picks.len(),
            nonland,
        );
        for card in picked {
            context += &format!("  {}\n", card.name);
        }
        if let Some(notice) = &self.notice {
            context += &format!("\nYour previous deck was not legal: {notice}\n");
        }
        context
    }

    fn validate(&mut self) -> Result<(), DeckBuildError> {
        let deck = self.assemble(self.picks.clone());
        match deck.check(self.rules) {
            Ok(()) => {
                self.deck = Some(deck);
                self.state = BuildState::AwaitFinalConfirmation;
            }
            Err(err) if !self.second_chance_used => {
                info!(%err, "selection illegal, asking again");
                self.second_chance_used = true;
                self.notice = Some(err.to_string());
                self.state = BuildState::AwaitCardSelections;
            }
            Err(err) => {
                warn!(%err, "selection still illegal, auto-completing");
                let deck = self.auto_complete().map_err(|e| self.unsatisfiable(&e.to_string()))?;
                self.picks = deck.picks().to_vec();
                self.deck = Some(deck);
                self.state = BuildState::AwaitFinalConfirmation;
            }
        }
        Ok(())
    }

    fn confirm(&mut self) {
        let Some(deck) = &self.deck else {
            self.state = BuildState::AwaitCardSelections;
            return;
        };
        let mut context =
            String::from("Deck building, step 3 of 3: confirm your deck or revise it.\n\n");
        for (quantity, name) in deck.main_entries() {
            context += &format!("{quantity} {name}\n");
        }
        let options = vec![
            DecisionOption::new(CONFIRM, "Submit this deck"),
            DecisionOption::new(REVISE, "Go back and change the selection"),
        ];

        match self.ask(context, options, Some(CONFIRM)) {
            Some(id) if id == REVISE && !self.second_chance_used => {
                self.second_chance_used = true;
                self.notice = None;
                self.deck = None;
                self.state = BuildState::AwaitCardSelections;
            }
            Some(id) if id == REVISE => {
                info!("revision already used, keeping deck");
                self.state = BuildState::Built;
            }
            _ => self.state = BuildState::Built,
        }
    }

    fn assemble(&self, picks: Vec<usize>) -> Deck {
        let colors = if self.colors.is_empty() {
            colors_of(&self.pool, &picks)
        } else {
            self.colors.clone()
        };
        let basics = fill_basics(&self.pool, &picks, &colors, self.rules);
        Deck::new(self.pool.clone(), self.rules.engine_format.clone(), colors, picks, basics)
    }

    /// Deterministic completion: keep legal picks, then add nonland cards (chosen colors and
    /// colorless first, pool order) up to the nonland minimum, then any card up to the deck size
    /// when basics cannot be added.
    fn auto_complete(&self) -> Result<Deck, DeckLegalityError> {
        let pool = &self.pool;
        let limit = |name: &str| match self.rules.max_copies {
            Some(limit) if !self.rules.exempt_from_limit(name) => limit,
            _ => usize::MAX,
        };
        let copies = |picks: &[usize], name: &str| {
            picks.iter().filter(|i| pool.get(**i).is_some_and(|c| c.name == name)).count()
        };

        let mut picks: Vec<usize> = vec![];
        for &i in &self.picks {
            let Some(card) = pool.get(i) else { continue };
            if !picks.contains(&i) && copies(&picks, &card.name) < limit(&card.name) {
                picks.push(i);
            }
        }

        let on_color = |card: &Card| card.color_letters().iter().all(|c| self.colors.contains(c));
        let mut candidates: Vec<usize> = (0..pool.len()).filter(|i| !picks.contains(i)).collect();
        candidates.sort_by_key(|&i| {
            let card = &pool.cards()[i];
            (!on_color(card), card.is_land(), i)
        });

        let nonland = |picks: &[usize]| {
            picks
                .iter()
                .filter(|i| pool.get(**i).is_some_and(|c| !c.is_land()))
                .count()
        };
        for &i in &candidates {
            if nonland(&picks) >= self.rules.min_nonland {
                break;
            }
            let card = &pool.cards()[i];
            if !card.is_land() && copies(&picks, &card.name) < limit(&card.name) {
                picks.push(i);
            }
        }
        if !self.rules.basic_lands_unlimited {
            for &i in &candidates {
                if picks.len() >= self.rules.min_deck_size {
                    break;
                }
                let card = &pool.cards()[i];
                if !picks.contains(&i) && copies(&picks, &card.name) < limit(&card.name) {
                    picks.push(i);
                }
            }
        }

        let deck = self.assemble(picks).mark_auto_completed();
        deck.check(self.rules)?;
        Ok(deck)
    }

    fn playable_count(&self, pair: &[char]) -> usize {
        self.pool
            .cards()
            .iter()
            .filter(|c| !c.is_land() && c.color_letters().iter().all(|l| pair.contains(l)))
            .count()
    }

    fn best_pair(&self) -> [char; 2] {
        let mut best = COLOR_PAIRS[0];
        let mut best_count = self.playable_count(&best);
        for pair in &COLOR_PAIRS[1..] {
            let count = self.playable_count(pair);
            if count > best_count {
                best = *pair;
                best_count = count;
            }
        }
        best
    }

    fn unsatisfiable(&self, reason: &str) -> DeckBuildError {
        DeckBuildError::Unsatisfiable {
            seat: self.pool.seat().to_string(),
            reason: reason.to_string(),
        }
    }
}

fn pair_name(pair: &[char]) -> String {
    pair.iter()
        .map(|c| match c {
            'W' => "White",
            'U' => "Blue",
            'B' => "Black",
            'R' => "Red",
            'G' => "Green",
            _ => "Colorless",
        })
        .collect::<Vec<_>>()
        .join("-")
}

fn describe_pool(pool: &CardPool) -> String {
    let mut text = String::new();
    for color in COLORS.iter().map(Some).chain([None]) {
        let cards: Vec<&Card> = pool
            .cards()
            .iter()
            .filter(|c| match color {
                Some(color) => c.color_letters().first() == Some(color),
                None => c.color_letters().is_empty(),
            })
            .collect();
        if cards.is_empty() {
            continue;
        }
        let heading = match color {
            Some(c) => pair_name(&[*c]),
            None => "Colorless and lands".to_string(),
        };
        text += &format!("{heading}:\n");
        for card in cards {
            text += &format!("  {}\n", card.describe());
        }
    }
    text
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::agent::provider::{CompletionRequest, LlmProvider, ProviderError};
    use crate::agent::{AgentConfig, BackendKind};
    use crate::deck::tests::sample_pool;

    struct Script(Mutex<VecDeque<String>>, &'static str);

    impl LlmProvider for Script {
        fn complete(&self, _: &CompletionRequest) -> Result<String, ProviderError> {
            let next = self.0.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| self.1.to_string()))
        }
    }

    fn scripted(answers: Vec<String>, fallback: &'static str) -> DecisionAgent {
        let mut config = AgentConfig::new("scripted", "mock");
        config.retry_budget = 0;
        let script = Script(Mutex::new(answers.into()), fallback);
        DecisionAgent::with_provider(Arc::new(config), Arc::new(script))
    }

    #[test]
    fn forfeiting_agent_gets_legal_deck() {
        let config = AgentConfig::baseline("quitter", BackendKind::Forfeit);
        let agent = DecisionAgent::from_config(Arc::new(config)).unwrap();
        let rules = FormatRules::default();
        let built = build_deck(&agent, sample_pool(), &rules).unwrap();
        built.deck.check(&rules).unwrap();
        assert!(built.deck.auto_completed());
        // white bears first (best pair W-R has 30 playable), then red shocks
        assert_eq!(built.deck.colors(), &['W', 'R']);
        assert_eq!(built.deck.picks(), &(0..23usize).collect::<Vec<_>>()[..]);
    }

    #[test]
    fn first_option_agent_gets_legal_deck() {
        let config = AgentConfig::baseline("first", BackendKind::FirstOption);
        let agent = DecisionAgent::from_config(Arc::new(config)).unwrap();

        let rules = FormatRules {
            max_copies: Some(1),
            ..FormatRules::default()
        };
        let built = build_deck(&agent, sample_pool(), &rules).unwrap();
        built.deck.check(&rules).unwrap();
        // color pair picked: WU, the first option
        assert_eq!(built.deck.colors(), &['W', 'U']);
    }

    #[test]
    fn nonsense_answers_still_yield_legal_deck() {
        let agent = scripted(vec![], "I like turtles");
        let rules = FormatRules::default();
        let built = build_deck(&agent, sample_pool(), &rules).unwrap();
        built.deck.check(&rules).unwrap();
    }

    #[test]
    fn short_selection_is_reprompted_once() {
        let mut answers: Vec<String> = vec!["WR".into(), "card-0".into(), "done".into()];
        answers.extend((1..23).map(|i| format!("card-{i}")));
        answers.extend(["done".into(), "confirm".into()]);
        let agent = scripted(answers, "done");
        let rules = FormatRules::default();
        let built = build_deck(&agent, sample_pool(), &rules).unwrap();
        assert!(!built.deck.auto_completed());
        assert_eq!(built.deck.picks().len(), 23);
        let notice = built
            .exchanges
            .iter()
            .any(|e| e.prompt.contains("Your previous deck was not legal"));
        assert!(notice);
    }

    #[test]
    fn unsatisfiable_pool_is_reported() {
        let agent = scripted(vec![], "done");
        let rules = FormatRules {
            min_nonland: 50,
            ..FormatRules::default()
        };
        let err = build_deck(&agent, sample_pool(), &rules).unwrap_err();
        assert!(matches!(err, DeckBuildError::Unsatisfiable { .. }));
    }
}
