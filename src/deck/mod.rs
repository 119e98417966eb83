//! Decks, format legality and basic-land apportionment.
//!
//! A [`Deck`] references cards of exactly one [`CardPool`] by index (each index at most once)
//! and adds basic lands on top when the format allows it. [`Deck::check`] is the legality
//! predicate: an illegal deck is never handed to the engine.

pub mod builder;
pub mod decklist;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::Display;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::card_pool::{Card, CardPool, CompositionStats, PoolSize, BASIC_LANDS, COLORS};

/// Legality thresholds of one format, read from the benchmark file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FormatRules {
    pub pool_size: PoolSize,
    /// Preferred printing when resolving pool names.
    pub set: Option<String>,
    pub min_deck_size: usize,
    pub min_nonland: usize,
    /// Copies allowed per card name. Basic lands are exempt when `basic_lands_unlimited`.
    pub max_copies: Option<usize>,
    pub basic_lands_unlimited: bool,
    /// Maximum number of card picks during deck building.
    pub max_selections: usize,
    /// Format name passed to the engine.
    pub engine_format: String,
}

impl Default for FormatRules {
    fn default() -> Self {
        Self {
            pool_size: PoolSize::Range { min: 42, max: 120 },
            set: None,
            min_deck_size: 40,
            min_nonland: 23,
            max_copies: None,
            basic_lands_unlimited: true,
            max_selections: 45,
            engine_format: "sealed".to_string(),
        }
    }
}

impl FormatRules {
    /// Whether any deck built from `pool` can satisfy these rules.
    pub fn is_satisfiable(&self, pool: &CardPool) -> Result<(), String> {
        let mut per_name: HashMap<&str, (usize, bool)> = HashMap::new();
        for card in pool.cards() {
            let entry = per_name.entry(&card.name).or_insert((0, card.is_land()));
            entry.0 += 1;
        }
        let capped = |name: &str, n: usize| match self.max_copies {
            Some(limit) if !self.exempt_from_limit(name) => n.min(limit),
            _ => n,
        };
        let nonland: usize = per_name
            .iter()
            .filter(|(_, (_, land))| !land)
            .map(|(name, (n, _))| capped(*name, *n))
            .sum();
        if nonland < self.min_nonland {
            return Err(format!(
                "pool offers {nonland} usable nonland cards, {} required",
                self.min_nonland
            ));
        }
        if !self.basic_lands_unlimited {
            let total: usize = per_name.iter().map(|(name, (n, _))| capped(*name, *n)).sum();
            if total < self.min_deck_size {
                return Err(format!(
                    "pool offers {total} usable cards, {} required",
                    self.min_deck_size
                ));
            }
        }
        Ok(())
    }

    fn exempt_from_limit(&self, name: &str) -> bool {
        self.basic_lands_unlimited && BASIC_LANDS.contains(&name)
    }
}

/// One reason a deck is illegal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Violation {
    #[error("deck has {have} cards, at least {need} required")]
    TooFewCards { have: usize, need: usize },

    #[error("deck has {have} nonland cards, at least {need} required")]
    TooFewNonland { have: usize, need: usize },

    #[error("{have} copies of '{name}', at most {limit} allowed")]
    TooManyCopies { name: String, have: usize, limit: usize },

    #[error("'{name}' is not available in the pool")]
    NotInPool { name: String },

    #[error("pool index {index} does not exist")]
    InvalidPoolIndex { index: usize },

    #[error("pool index {index} is used twice")]
    DuplicatePoolIndex { index: usize },

    #[error("basic lands outside the pool are not allowed in this format")]
    BasicLandsNotAllowed,
}

/// Illegal deck, with every violation found.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub struct DeckLegalityError {
    pub violations: Vec<Violation>,
}

impl Display for DeckLegalityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reasons = self
            .violations
            .iter()
            .map(Violation::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        write!(f, "illegal deck: {reasons}")
    }
}

/// Serializable form of a [`Deck`], stored in the run directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeckRecord {
    pub owner: String,
    pub format: String,
    pub colors: String,
    pub picks: Vec<usize>,
    /// Basic lands added outside the pool, in WUBRG order.
    pub basics: [u32; 5],
    #[serde(default)]
    pub auto_completed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Deck {
    pool: Arc<CardPool>,
    format: String,
    colors: Vec<char>,
    picks: Vec<usize>,
    basics: [u32; 5],
    auto_completed: bool,
}

impl Deck {
    pub fn new(
        pool: Arc<CardPool>,
        format: impl Into<String>,
        colors: Vec<char>,
        picks: Vec<usize>,
        basics: [u32; 5],
    ) -> Self {
        Self {
            pool,
            format: format.into(),
            colors,
            picks,
            basics,
            auto_completed: false,
        }
    }

    pub(crate) fn mark_auto_completed(mut self) -> Self {
        self.auto_completed = true;
        self
    }

    pub fn owner(&self) -> &str {
        self.pool.seat()
    }

    pub fn pool(&self) -> &Arc<CardPool> {
        &self.pool
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn colors(&self) -> &[char] {
        &self.colors
    }

    pub fn picks(&self) -> &[usize] {
        &self.picks
    }

    pub fn basics(&self) -> [u32; 5] {
        self.basics
    }

    pub fn auto_completed(&self) -> bool {
        self.auto_completed
    }

    pub fn total_cards(&self) -> usize {
        self.picks.len() + self.basics.iter().sum::<u32>() as usize
    }

    pub fn nonland_count(&self) -> usize {
        self.picked_cards().filter(|c| !c.is_land()).count()
    }

    fn picked_cards(&self) -> impl Iterator<Item = &Card> {
        self.picks.iter().filter_map(|i| self.pool.get(*i))
    }

    /// Main deck as `(quantity, name)`, pool cards by first pick then basics in WUBRG order.
    pub fn main_entries(&self) -> Vec<(u32, String)> {
        let mut entries: Vec<(u32, String)> = vec![];
        for card in self.picked_cards() {
            match entries.iter_mut().find(|(_, name)| *name == card.name) {
                Some((n, _)) => *n += 1,
                None => entries.push((1, card.name.clone())),
            }
        }
        for (basic, n) in BASIC_LANDS.iter().zip(self.basics) {
            if n == 0 {
                continue;
            }
            match entries.iter_mut().find(|(_, name)| *name == *basic) {
                Some((count, _)) => *count += n,
                None => entries.push((n, basic.to_string())),
            }
        }
        entries
    }

    /// Pool indices left out of the deck.
    pub fn sideboard(&self) -> Vec<usize> {
        let picked: HashSet<usize> = self.picks.iter().copied().collect();
        (0..self.pool.len()).filter(|i| !picked.contains(i)).collect()
    }

    pub fn stats(&self) -> CompositionStats {
        let basics: Vec<Card> = BASIC_LANDS.iter().map(|b| Card::basic_land(b)).collect();
        CompositionStats::from_cards(
            self.picked_cards()
                .map(|c| (c, 1))
                .chain(basics.iter().zip(self.basics).filter(|(_, n)| *n > 0)),
        )
    }

    /// Legality predicate against `rules`.
    pub fn check(&self, rules: &FormatRules) -> Result<(), DeckLegalityError> {
        let mut violations = vec![];

        let mut seen = HashSet::new();
        for &index in &self.picks {
            if index >= self.pool.len() {
                violations.push(Violation::InvalidPoolIndex { index });
            } else if !seen.insert(index) {
                violations.push(Violation::DuplicatePoolIndex { index });
            }
        }

        if !rules.basic_lands_unlimited && self.basics.iter().any(|n| *n > 0) {
            violations.push(Violation::BasicLandsNotAllowed);
        }

        if self.total_cards() < rules.min_deck_size {
            violations.push(Violation::TooFewCards {
                have: self.total_cards(),
                need: rules.min_deck_size,
            });
        }
        if self.nonland_count() < rules.min_nonland {
            violations.push(Violation::TooFewNonland {
                have: self.nonland_count(),
                need: rules.min_nonland,
            });
        }

        if let Some(limit) = rules.max_copies {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            for card in self.picked_cards() {
                *counts.entry(&card.name).or_default() += 1;
            }
            for (name, have) in counts {
                if have > limit && !rules.exempt_from_limit(name) {
                    violations.push(Violation::TooManyCopies {
                        name: name.to_string(),
                        have,
                        limit,
                    });
                }
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(DeckLegalityError { violations })
        }
    }

    pub fn to_record(&self) -> DeckRecord {
        DeckRecord {
            owner: self.owner().to_string(),
            format: self.format.clone(),
            colors: self.colors.iter().collect(),
            picks: self.picks.clone(),
            basics: self.basics,
            auto_completed: self.auto_completed,
        }
    }

    /// Rebuild a stored deck against its pool and check it again.
    pub fn from_record(
        record: &DeckRecord,
        pool: Arc<CardPool>,
        rules: &FormatRules,
    ) -> Result<Self, DeckLegalityError> {
        let deck = Deck {
            pool,
            format: record.format.clone(),
            colors: record.colors.chars().collect(),
            picks: record.picks.clone(),
            basics: record.basics,
            auto_completed: record.auto_completed,
        };
        deck.check(rules)?;
        Ok(deck)
    }
}

/// Basic lands needed to bring `picks` up to the minimum deck size, in WUBRG order.
///
/// Lands are split in proportion to the colored mana symbols of the picked cards (the chosen
/// `colors` when there are none) using largest remainders, ties going to the earlier color.
pub fn fill_basics(
    pool: &CardPool,
    picks: &[usize],
    colors: &[char],
    rules: &FormatRules,
) -> [u32; 5] {

    let mut basics = [0u32; 5];
    if !rules.basic_lands_unlimited {
        return basics;
    }
    let needed = rules.min_deck_size.saturating_sub(picks.len()) as u64;
    if needed == 0 {
        return basics;
    }

    let mut weights = [0u64; 5];
    for card in picks.iter().filter_map(|i| pool.get(*i)) {
        if card.is_land() {
            continue;
        }
        for (w, pips) in weights.iter_mut().zip(card.color_pips()) {
            *w += u64::from(pips);
        }
    }
    if weights.iter().all(|w| *w == 0) {
        for (w, color) in weights.iter_mut().zip(COLORS) {
            if colors.contains(&color) {
                *w = 1;
            }
        }
    }
    if weights.iter().all(|w| *w == 0) {
        weights = [1; 5];
    }

    let total: u64 = weights.iter().sum();
    let mut remainders = vec![];
    let mut assigned = 0;
    for (i, w) in weights.iter().enumerate() {
        let share = needed * w;
        basics[i] = (share / total) as u32;
        assigned += share / total;
        if *w > 0 {
            remainders.push((share % total, i));
        }
    }
    remainders.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    for (_, i) in remainders.into_iter().take((needed - assigned) as usize) {
        basics[i] += 1;
    }
    basics
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::card_pool::Card;

    pub(crate) fn card(name: &str, cost: &str, type_line: &str) -> Card {
        Card {
            mana_cost: Some(cost.to_string()),
            type_line: type_line.to_string(),
            ..Card::basic_land(name)
        }
    }

    /// 20 white bears, 10 red shocks, 6 green elves, 2 nonbasic lands.
    pub(crate) fn sample_pool() -> Arc<CardPool> {
        let mut cards = vec![];
        for i in 0..20 {
            cards.push(card(&format!("White Bear {i}"), "{1}{W}", "Creature — Bear"));
        }
        for i in 0..10 {
            cards.push(card(&format!("Red Shock {i}"), "{R}", "Instant"));
        }
        for i in 0..6 {
            cards.push(card(&format!("Green Elf {i}"), "{G}", "Creature — Elf"));
        }
        cards.push(card("Sunlit Marsh", "", "Land"));
        cards.push(card("Sunlit Marsh", "", "Land"));
        Arc::new(CardPool::new("alice", cards))
    }

    #[test]
    fn basics_follow_pips() {
        let pool = sample_pool();
        let rules = FormatRules::default();
        // 15 white bears + 8 red shocks: 15 W pips, 8 R pips, 17 lands needed.
        let picks: Vec<usize> = (0..15).chain(20..28).collect();
        let basics = fill_basics(&pool, &picks, &['W', 'R'], &rules);
        assert_eq!(basics.iter().sum::<u32>(), 17);
        // 17 * 15 / 23 = 11.08, 17 * 8 / 23 = 5.91
        assert_eq!(basics, [11, 0, 0, 6, 0]);
    }

    #[test]
    fn basics_fall_back_to_colors() {
        let pool = sample_pool();
        let rules = FormatRules::default();
        let basics = fill_basics(&pool, &[36, 37], &['U', 'G'], &rules);
        assert_eq!(basics, [0, 19, 0, 0, 19]);
    }

    #[test]
    fn legality_reports_every_violation() {
        let pool = sample_pool();
        let rules = FormatRules {
            max_copies: Some(1),
            ..FormatRules::default()
        };
        let deck = Deck::new(pool, "sealed", vec!['W'], vec![0, 1, 1, 99], [0; 5]);
        let err = deck.check(&rules).unwrap_err();
        assert!(err.violations.contains(&Violation::DuplicatePoolIndex { index: 1 }));
        assert!(err.violations.contains(&Violation::InvalidPoolIndex { index: 99 }));
        assert!(err.violations.contains(&Violation::TooFewCards { have: 4, need: 40 }));
        assert!(err
            .violations
            .iter()
            .any(|v| matches!(v, Violation::TooManyCopies { name, .. } if name == "White Bear 1")));
    }

    #[test]
    fn legal_deck_and_record_round_trip() {
        let pool = sample_pool();
        let rules = FormatRules::default();
        let picks: Vec<usize> = (0..15).chain(20..28).collect();
        let basics = fill_basics(&pool, &picks, &['W', 'R'], &rules);
        let deck = Deck::new(pool.clone(), "sealed", vec!['W', 'R'], picks, basics);
        deck.check(&rules).unwrap();
        assert_eq!(deck.total_cards(), 40);
        assert_eq!(deck.sideboard().len(), pool.len() - 23);

        let again = Deck::from_record(&deck.to_record(), pool, &rules).unwrap();
        assert_eq!(again, deck);
    }

    #[test]
    fn satisfiability() {
        let pool = sample_pool();
        assert!(FormatRules::default().is_satisfiable(&pool).is_ok());
        let strict = FormatRules {
            basic_lands_unlimited: false,
            min_deck_size: 40,
            ..FormatRules::default()
        };
        assert!(strict.is_satisfiable(&pool).is_err());
    }
}
