//! Card pool loading and card database lookup.
//!
//! A pool file is the text export of the draft simulator: one entry per line, either
//! `N Card Name` or a bare `Card Name` (one copy). Blank lines, `#`/`//` comments and
//! `Deck`/`Sideboard` headers are skipped.
//!
//! ```text
//! 2 Dockworker Drone
//! Banishing Light
//! Forest_1
//! ```
//!
//! Every name is resolved against a [`CardDatabase`] (an oracle-card JSON array). A pool is
//! accepted only when its size lies in the format's [`PoolSize`] range.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

/// Names of the basic lands, in WUBRG order.
pub const BASIC_LANDS: [&str; 5] = ["Plains", "Island", "Swamp", "Mountain", "Forest"];

/// The five colors, in WUBRG order.
pub const COLORS: [char; 5] = ['W', 'U', 'B', 'R', 'G'];

/// Errors raised while loading a pool. Fatal to the seat that owns the pool only.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("malformed pool for seat '{seat}': {reason}")]
    Malformed { seat: String, reason: String },

    #[error("unknown card '{name}' in pool for seat '{seat}'")]
    UnknownCard { seat: String, name: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("card database parse error: {0}")]
    Database(#[from] serde_json::Error),
}

/// One card record, as found in the card database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Card {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mana_cost: Option<String>,
    #[serde(default)]
    pub type_line: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_text: Option<String>,
    #[serde(default)]
    pub colors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub toughness: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loyalty: Option<String>,
    #[serde(default)]
    pub rarity: String,
}

impl Card {
    pub fn is_land(&self) -> bool {
        self.type_line.contains("Land")
    }

    pub fn is_basic_land(&self) -> bool {
        self.is_land() && (self.type_line.contains("Basic") || BASIC_LANDS.contains(&&*self.name))
    }

    /// Mana value computed from the printed cost. `{X}` counts as zero, hybrid symbols as one.
    pub fn mana_value(&self) -> u32 {
        mana_symbols(self.mana_cost.as_deref().unwrap_or_default())
            .map(|symbol| match symbol.parse::<u32>() {
                Ok(generic) => generic,
                Err(_) if symbol.eq_ignore_ascii_case("x") => 0,
                Err(_) => 1,
            })
            .sum()
    }

    /// Number of colored mana symbols per color (`W`, `U`, `B`, `R`, `G`).
    pub fn color_pips(&self) -> [u32; 5] {
        let mut pips = [0; 5];
        for symbol in mana_symbols(self.mana_cost.as_deref().unwrap_or_default()) {
            for (i, color) in COLORS.iter().enumerate() {
                if symbol.contains(*color) {
                    pips[i] += 1;
                }
            }
        }
        pips
    }

    /// Colors of the card as single letters. Falls back to the mana cost when the record has no
    /// `colors` field.
    pub fn color_letters(&self) -> Vec<char> {
        if !self.colors.is_empty() {
            return COLORS
                .iter()
                .copied()
                .filter(|c| self.colors.iter().any(|s| s.starts_with(*c)))
                .collect();
        }
        let pips = self.color_pips();
        COLORS
            .iter()
            .zip(pips)
            .filter(|(_, n)| *n > 0)
            .map(|(c, _)| *c)
            .collect()
    }

    pub fn primary_type(&self) -> &'static str {
        if self.is_land() {
            "Land"
        } else if self.type_line.contains("Creature") {
            "Creature"
        } else if self.type_line.contains("Instant") {
            "Instant"
        } else if self.type_line.contains("Sorcery") {
            "Sorcery"
        } else {
            "Other"
        }
    }

    /// One-line human readable description, used in prompts.
    pub fn describe(&self) -> String {
        let mut text = self.name.clone();
        if let Some(cost) = self.mana_cost.as_deref().filter(|c| !c.is_empty()) {
            text += &format!(" ({cost})");
        }
        if !self.type_line.is_empty() {
            text += &format!(" - {}", self.type_line);
        }
        if let (Some(p), Some(t)) = (&self.power, &self.toughness) {
            text += &format!(" [{p}/{t}]");
        }
        if let Some(loyalty) = &self.loyalty {
            text += &format!(" [loyalty {loyalty}]");
        }
        if !self.rarity.is_empty() {
            text += &format!(" ({})", self.rarity);
        }
        text
    }

    /// Minimal record for a basic land, used when the database has no entry for it.
    pub fn basic_land(name: &str) -> Card {
        Card {
            name: name.to_string(),
            set: None,
            oracle_id: None,
            mana_cost: None,
            type_line: format!("Basic Land — {name}"),
            oracle_text: None,
            colors: vec![],
            power: None,
            toughness: None,
            loyalty: None,
            rarity: "common".to_string(),
        }
    }
}

fn mana_symbols(cost: &str) -> impl Iterator<Item = &str> {
    cost.split('{')
        .filter_map(|part| part.split_once('}').map(|(symbol, _)| symbol))
        .filter(|symbol| !symbol.is_empty())
}

/// Oracle lookup keyed by lowercase `name|set` first and lowercase `name` second.
#[derive(Debug, Default)]
pub struct CardDatabase {
    by_name: HashMap<String, Vec<Card>>,
    by_name_set: HashMap<String, Card>,
}

impl CardDatabase {
    pub fn from_cards(cards: Vec<Card>) -> Self {
        let mut db = CardDatabase::default();
        for card in cards {
            let name = card.name.to_lowercase();
            if name.is_empty() {
                continue;
            }
            if let Some(set) = &card.set {
                db.by_name_set
                    .insert(format!("{name}|{}", set.to_lowercase()), card.clone());
            }
            db.by_name.entry(name).or_default().push(card);
        }
        db
    }

    #[instrument]
    pub fn from_json_file(path: &Path) -> Result<Self, PoolError> {
        let text = std::fs::read_to_string(path)?;
        let cards: Vec<Card> = serde_json::from_str(&text)?;
        debug!(cards = cards.len(), "card database loaded");
        Ok(Self::from_cards(cards))
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Find a card, preferring the printing from `set` when given.
    pub fn find(&self, name: &str, set: Option<&str>) -> Option<&Card> {
        let name = name.to_lowercase();
        if let Some(set) = set {
            if let Some(card) = self.by_name_set.get(&format!("{name}|{}", set.to_lowercase())) {
                return Some(card);
            }
        }
        self.by_name.get(&name).and_then(|cards| cards.first())
    }

    /// Like [`find`](Self::find), but basic lands always resolve.
    pub fn resolve(&self, name: &str, set: Option<&str>) -> Option<Card> {
        self.find(name, set).cloned().or_else(|| {
            BASIC_LANDS
                .iter()
                .find(|basic| basic.eq_ignore_ascii_case(name))
                .map(|basic| Card::basic_land(basic))
        })
    }
}

/// Accepted pool size for a draft format. Either an exact count or an inclusive range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PoolSize {
    Exact(usize),
    Range { min: usize, max: usize },
}

impl PoolSize {
    pub fn bounds(&self) -> (usize, usize) {
        match *self {
            PoolSize::Exact(n) => (n, n),
            PoolSize::Range { min, max } => (min, max),
        }
    }

    pub fn contains(&self, n: usize) -> bool {
        let (min, max) = self.bounds();
        (min..=max).contains(&n)
    }
}

impl std::fmt::Display for PoolSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.bounds() {
            (min, max) if min == max => write!(f, "{min}"),
            (min, max) => write!(f, "{min}-{max}"),
        }
    }
}

/// The cards drafted by one seat. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardPool {
    seat: String,
    cards: Vec<Card>,
}

impl CardPool {
    pub fn new(seat: impl Into<String>, cards: Vec<Card>) -> Self {
        Self {
            seat: seat.into(),
            cards,
        }
    }

    pub fn seat(&self) -> &str {
        &self.seat
    }

    pub fn cards(&self) -> &[Card] {
        &self.cards
    }

    pub fn get(&self, index: usize) -> Option<&Card> {
        self.cards.get(index)
    }

    pub fn len(&self) -> usize {
        self.cards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }

    /// Number of copies of `name` in the pool.
    pub fn count_of(&self, name: &str) -> usize {
        self.cards.iter().filter(|c| c.name == name).count()
    }

    /// Export in the `N Card Name` format, grouped by first appearance. Loadable again.
    pub fn export_text(&self) -> String {
        let mut order: Vec<&str> = vec![];
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for card in &self.cards {
            let count = counts.entry(&card.name).or_insert(0);
            if *count == 0 {
                order.push(&card.name);
            }
            *count += 1;
        }
        order
            .into_iter()
            .map(|name| format!("{} {name}\n", counts[name]))
            .collect()
    }

    pub fn stats(&self) -> CompositionStats {
        CompositionStats::from_cards(self.cards.iter().map(|c| (c, 1)))
    }
}

/// Load the pool of `seat` from a draft export file.
pub fn load_pool_file(
    seat: &str,
    path: &Path,
    db: &CardDatabase,
    set_hint: Option<&str>,
    size: PoolSize,
) -> Result<CardPool, PoolError> {
    let text = std::fs::read_to_string(path)?;
    load_pool(seat, &text, db, set_hint, size)
}

/// Parse and validate the pool of `seat` from draft export text.
#[instrument(skip(text, db))]
pub fn load_pool(
    seat: &str,
    text: &str,
    db: &CardDatabase,
    set_hint: Option<&str>,
    size: PoolSize,
) -> Result<CardPool, PoolError> {
    let (_, max) = size.bounds();
    let malformed = |reason: String| PoolError::Malformed {
        seat: seat.to_string(),
        reason,
    };

    let mut cards = vec![];
    for (line_number, line) in text.lines().enumerate() {
        let Some(entry) = parse_pool_line(line) else {
            continue;
        };
        let (quantity, name) =
            entry.map_err(|e| malformed(format!("line {}: {e}", line_number + 1)))?;
        if cards.len() + quantity > max {
            return Err(malformed(format!(
                "more than {max} cards (line {})",
                line_number + 1
            )));
        }
        let card = db.resolve(&name, set_hint).ok_or_else(|| PoolError::UnknownCard {
            seat: seat.to_string(),
            name: name.clone(),
        })?;
        cards.extend(std::iter::repeat(card).take(quantity));
    }

    if !size.contains(cards.len()) {
        return Err(malformed(format!(
            "{} cards, expected {size}",
            cards.len()
        )));
    }
    debug!(cards = cards.len(), "pool loaded");
    Ok(CardPool::new(seat, cards))
}

/// `None` for lines carrying no card, otherwise the quantity and normalized name.
pub(crate) fn parse_pool_line(line: &str) -> Option<Result<(usize, String), String>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return None;
    }
    let lower = line.to_lowercase();
    if matches!(
        lower.trim_end_matches(':'),
        "deck" | "deck list" | "decklist" | "sideboard" | "main"
    ) {
        return None;
    }

    let (quantity, name) = match line.split_once(' ') {
        Some((first, rest)) => match first.trim_end_matches(['x', 'X']).parse::<usize>() {
            Ok(n) => (n, rest.trim()),
            Err(_) => (1, line),
        },
        None => (1, line),
    };
    if quantity == 0 {
        return Some(Err(format!("zero quantity for '{name}'")));
    }
    let name = normalize_card_name(name);
    if name.is_empty() {
        return Some(Err("empty card name".to_string()));
    }
    Some(Ok((quantity, name)))
}

/// Strip `_<digit>` art suffixes (`Forest_2`) and turn the remaining underscores into spaces.
pub fn normalize_card_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '_' {
            if chars.peek().is_some_and(|n| n.is_ascii_digit()) {
                chars.next();
            } else {
                out.push(' ');
            }
        } else {
            out.push(c);
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Composition summary of a pool or a deck.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompositionStats {
    pub total_cards: u32,
    pub unique_cards: u32,
    pub by_rarity: BTreeMap<String, u32>,
    pub by_color: BTreeMap<String, u32>,
    pub by_type: BTreeMap<String, u32>,
    /// Nonland mana curve: mana value -> count.
    pub mana_curve: BTreeMap<u32, u32>,
    pub average_mana_value: f64,
}

impl CompositionStats {
    pub fn from_cards<'a>(cards: impl IntoIterator<Item = (&'a Card, u32)>) -> Self {
        let mut stats = CompositionStats::default();
        let mut names = std::collections::HashSet::new();
        let mut total_mana_value = 0;
        let mut nonland = 0;

        for (card, quantity) in cards {
            stats.total_cards += quantity;
            names.insert(card.name.as_str());

            let rarity = if card.rarity.is_empty() {
                "unknown"
            } else {
                &card.rarity
            };
            *stats.by_rarity.entry(rarity.to_string()).or_default() += quantity;

            let colors = card.color_letters();
            if colors.is_empty() {
                *stats.by_color.entry("colorless".to_string()).or_default() += quantity;
            }
            for color in colors {
                *stats.by_color.entry(color.to_string()).or_default() += quantity;
            }

            *stats
                .by_type
                .entry(card.primary_type().to_string())
                .or_default() += quantity;

            if !card.is_land() {
                let mv = card.mana_value();
                *stats.mana_curve.entry(mv).or_default() += quantity;
                total_mana_value += mv * quantity;
                nonland += quantity;
            }
        }

        stats.unique_cards = names.len() as u32;
        if nonland > 0 {
            stats.average_mana_value =
                (f64::from(total_mana_value) / f64::from(nonland) * 100.0).round() / 100.0;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn card(name: &str, cost: &str, type_line: &str) -> Card {
        Card {
            mana_cost: Some(cost.to_string()),
            type_line: type_line.to_string(),
            rarity: "common".to_string(),
            ..Card::basic_land(name)
        }
    }

    fn db() -> CardDatabase {
        CardDatabase::from_cards(vec![
            card("Dockworker Drone", "{1}{W}", "Artifact Creature — Robot"),
            card("Banishing Light", "{2}{W}", "Enchantment"),
            card("Dual Sun Technique", "{1}{R}{W}", "Instant"),
        ])
    }

    #[test]
    fn loads_quantities_and_basics() {
        let text = "# seat export\n2 Dockworker Drone\nBanishing Light\nForest_1\n\n3x Dual_Sun_Technique\n";
        let pool = load_pool("alice", text, &db(), None, PoolSize::Exact(7)).unwrap();
        assert_eq!(pool.len(), 7);
        assert_eq!(pool.count_of("Dockworker Drone"), 2);
        assert_eq!(pool.count_of("Forest"), 1);
        assert_eq!(pool.count_of("Dual Sun Technique"), 3);
        assert_eq!(pool.seat(), "alice");
    }

    #[test]
    fn size_out_of_range_is_malformed() {
        let err =
            load_pool("bob", "2 Banishing Light", &db(), None, PoolSize::Exact(3)).unwrap_err();
        assert!(matches!(err, PoolError::Malformed { .. }), "{err}");

        let err = load_pool(
            "bob",
            "9 Banishing Light",
            &db(),
            None,
            PoolSize::Range { min: 1, max: 4 },
        )
        .unwrap_err();
        assert!(matches!(err, PoolError::Malformed { .. }), "{err}");
    }

    #[test]
    fn unknown_card_is_reported() {
        let err = load_pool("bob", "1 Black Lotus", &db(), None, PoolSize::Exact(1)).unwrap_err();
        match err {
            PoolError::UnknownCard { name, seat } => {
                assert_eq!(name, "Black Lotus");
                assert_eq!(seat, "bob");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn export_reloads_to_same_pool() {
        let text = "2 Dockworker Drone\n1 Banishing Light\n2 Plains\n";
        let pool = load_pool("alice", text, &db(), None, PoolSize::Exact(5)).unwrap();
        let exported = pool.export_text();
        let again = load_pool("alice", &exported, &db(), None, PoolSize::Exact(5)).unwrap();

        assert_eq!(pool, again);
    }

    #[test]
    fn set_specific_printing_is_preferred() {
        let mut eoe = card("Banishing Light", "{2}{W}", "Enchantment");
        eoe.set = Some("EOE".into());
        eoe.rarity = "uncommon".into();
        let mut old = card("Banishing Light", "{2}{W}", "Enchantment");
        old.set = Some("THS".into());
        let db = CardDatabase::from_cards(vec![old, eoe]);
        assert_eq!(db.find("banishing light", Some("eoe")).unwrap().rarity, "uncommon");
        assert_eq!(db.find("Banishing Light", None).unwrap().rarity, "common");
    }

    #[test]
    fn mana_value_and_pips() {
        let c = card("Dual Sun Technique", "{X}{2}{R}{W/U}", "Instant");
        assert_eq!(c.mana_value(), 4);
        assert_eq!(c.color_pips(), [1, 1, 0, 1, 0]);
        assert_eq!(normalize_card_name("Forest_12"), "Forest2");
        assert_eq!(normalize_card_name("Healer's_Hawk"), "Healer's Hawk");
    }

    #[test]
    fn composition_stats() {
        let pool = load_pool(
            "alice",
            "2 Dockworker Drone\n1 Dual Sun Technique\n1 Plains",
            &db(),
            None,
            PoolSize::Exact(4),
        )
        .unwrap();
        let stats = pool.stats();
        assert_eq!(stats.total_cards, 4);
        assert_eq!(stats.unique_cards, 3);
        assert_eq!(stats.by_type["Creature"], 2);
        assert_eq!(stats.by_type["Land"], 1);
        assert_eq!(stats.by_color["W"], 3);
        assert_eq!(stats.by_color["colorless"], 1);
        assert_eq!(stats.mana_curve[&2], 2);
        assert_eq!(stats.mana_curve[&3], 1);
        assert!((stats.average_mana_value - 2.33).abs() < 1e-9);
    }
}
