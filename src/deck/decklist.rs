//! Textual deck lists: parsing free-form model output and Forge `.dck` export.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;

use super::{Deck, DeckLegalityError, FormatRules, Violation};
use crate::card_pool::{parse_pool_line, CardPool, BASIC_LANDS};

/// Parse a deck list out of free text.
///
/// Only the first fenced code block is read when there is one. Entries after a `Sideboard`
/// header are ignored, as are headers, comments and list bullets.
pub fn parse_decklist(text: &str) -> Vec<(usize, String)> {
    let body = first_code_block(text).unwrap_or(text);
    let mut entries = vec![];
    for line in body.lines() {
        let line = line.trim().trim_start_matches(['-', '*', '•']).trim();
        if line.trim_end_matches(':').eq_ignore_ascii_case("sideboard") {
            break;
        }
        if line.ends_with(':') {
            continue;
        }
        if let Some(Ok(entry)) = parse_pool_line(line) {
            entries.push(entry);
        }
    }
    entries
}

fn first_code_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_fence = &text[start + 3..];
    // skip the info string (```text)
    let body_start = after_fence.find('\n')? + 1;
    let body = &after_fence[body_start..];
    let end = body.find("```").unwrap_or(body.len());
    Some(&body[..end])
}

impl Deck {
    /// Resolve a parsed deck list against `pool`. Basic lands not taken from the pool are added
    /// freely when the format allows it.
    pub fn from_decklist(
        pool: Arc<CardPool>,
        entries: &[(usize, String)],
        rules: &FormatRules,
    ) -> Result<Deck, DeckLegalityError> {
        let mut used = vec![false; pool.len()];
        let mut picks = vec![];
        let mut basics = [0u32; 5];
        let mut violations = vec![];

        for (quantity, name) in entries {
            let basic = BASIC_LANDS.iter().position(|b| b.eq_ignore_ascii_case(name));
            for _ in 0..*quantity {
                let found = pool
                    .cards()
                    .iter()
                    .enumerate()
                    .position(|(i, card)| !used[i] && card.name.eq_ignore_ascii_case(name));
                match (found, basic) {
                    (Some(i), _) => {
                        used[i] = true;
                        picks.push(i);
                    }
                    (None, Some(b)) if rules.basic_lands_unlimited => basics[b] += 1,
                    (None, _) => {
                        violations.push(Violation::NotInPool { name: name.clone() });
                        break;
                    }
                }
            }
        }
        if !violations.is_empty() {
            return Err(DeckLegalityError { violations });
        }

        let colors = colors_of(&pool, &picks);
        let deck = Deck::new(pool, rules.engine_format.clone(), colors, picks, basics);
        deck.check(rules)?;
        Ok(deck)
    }

    /// Forge deck file contents.
    pub fn to_dck_text(&self, display_name: &str) -> String {
        let mut text = format!("[metadata]\nName={display_name}\n[Main]\n");
        for (quantity, name) in self.main_entries() {
            text += &format!("{quantity} {name}\n");
        }
        text
    }

    /// Write `<dir>/<sanitized name>.dck` and return its path.
    pub fn write_dck(&self, dir: &Path, name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("could not create deck directory {}", dir.display()))?;
        let path = dir.join(dck_file_name(name));
        std::fs::write(&path, self.to_dck_text(&name.replace('_', " ")))
            .with_context(|| format!("could not write deck file {}", path.display()))?;
        Ok(path)
    }
}

/// Colors of the nonland picks, in WUBRG order.
pub(crate) fn colors_of(pool: &CardPool, picks: &[usize]) -> Vec<char> {
    let mut colors = vec![];
    for card in picks.iter().filter_map(|i| pool.get(*i)) {
        if card.is_land() {
            continue;
        }
        for c in card.color_letters() {
            if !colors.contains(&c) {
                colors.push(c);
            }
        }
    }
    colors.sort_by_key(|c| crate::card_pool::COLORS.iter().position(|x| x == c));
    colors
}

/// Safe file name with a `.dck` extension.
pub fn dck_file_name(name: &str) -> String {
    let mut file: String = name
        .trim()
        .replace(' ', "_")
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
        .collect();
    if !file.to_lowercase().ends_with(".dck") {
        file += ".dck";
    }
    file
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::tests::sample_pool;

    #[test]
    fn reads_first_code_block_only() {
        let text = "Here is my deck:\n```text\nDeck\n2 White Bear 1\n- 1 Red Shock 0\n9 Plains\nSideboard\n1 Green Elf 0\n```\nAlso:\n```\n4 Island\n```";
        let entries = parse_decklist(text);
        assert_eq!(
            entries,
            vec![
                (2, "White Bear 1".to_string()),
                (1, "Red Shock 0".to_string()),
                (9, "Plains".to_string()),
            ]
        );
    }

    #[test]
    fn plain_text_without_fence() {
        let entries = parse_decklist("Creatures:\n3x Green Elf 2\nForest_3");
        assert_eq!(entries, vec![(3, "Green Elf 2".into()), (1, "Forest".into())]);
    }

    #[test]
    fn decklist_resolves_against_pool() {
        let pool = sample_pool();
        let rules = FormatRules::default();
        let mut text = String::new();
        for i in 0..20 {
            text += &format!("1 White Bear {i}\n");
        }
        text += "1 Red Shock 0\n1 Red Shock 1\n1 Red Shock 2\n17 Plains\n";
        let deck = Deck::from_decklist(pool, &parse_decklist(&text), &rules).unwrap();
        assert_eq!(deck.total_cards(), 40);
        assert_eq!(deck.basics(), [17, 0, 0, 0, 0]);
        assert_eq!(deck.colors(), &['W', 'R']);
    }

    #[test]
    fn cards_missing_from_pool_are_rejected() {
        let err = Deck::from_decklist(
            sample_pool(),
            &[(2, "Sunlit Marsh".into()), (1, "Sunlit Marsh".into()), (1, "Black Lotus".into())],
            &FormatRules::default(),
        )
        .unwrap_err();
        assert_eq!(
            err.violations,
            vec![
                Violation::NotInPool { name: "Sunlit Marsh".into() },
                Violation::NotInPool { name: "Black Lotus".into() },
            ]
        );
    }

    #[test]
    fn dck_export() {
        let pool = sample_pool();
        let deck = Deck::new(pool, "sealed", vec!['W'], vec![0, 36], [2, 0, 0, 0, 0]);
        assert_eq!(
            deck.to_dck_text("alice sealed"),
            "[metadata]\nName=alice sealed\n[Main]\n1 White Bear 0\n1 Sunlit Marsh\n2 Plains\n"
        );
        assert_eq!(dck_file_name("alice vs: bob!"), "alice_vs_bob.dck");

        let dir = tempfile::tempdir().unwrap();
        let path = deck.write_dck(dir.path(), "alice_sealed").unwrap();
        assert!(path.ends_with("alice_sealed.dck"));
        assert!(std::fs::read_to_string(path).unwrap().contains("Name=alice sealed"));
    }
}
