use std::sync::Arc;

use mtg_llm_bench::card_pool::{load_pool, load_pool_file, CardDatabase, PoolError, PoolSize};
use mtg_llm_bench::deck::decklist::parse_decklist;
use mtg_llm_bench::deck::{Deck, FormatRules};

mod common;

use common::fixture;

fn database() -> CardDatabase {
    CardDatabase::from_json_file(&fixture("cards.json")).unwrap()
}

#[test]
fn fixture_pool_loads_and_reloads_from_export() {
    let db = database();
    let rules = FormatRules::default();
    let pool = load_pool_file("first", &fixture("pool.txt"), &db, None, rules.pool_size).unwrap();
    assert_eq!(pool.len(), 42);
    assert_eq!(pool.count_of("Savannah Lions"), 6);
    assert!(rules.is_satisfiable(&pool).is_ok());

    let reloaded = load_pool("first", &pool.export_text(), &db, None, rules.pool_size).unwrap();
    assert_eq!(reloaded, pool);
    assert_eq!(reloaded.stats(), pool.stats());
}

#[test]
fn pool_outside_size_bounds_is_rejected() {
    let size = PoolSize::Exact(84);
    let err = load_pool_file("first", &fixture("pool.txt"), &database(), None, size).unwrap_err();
    assert!(matches!(err, PoolError::Malformed { .. }));
}

#[test]
fn fixed_decklist_imports_as_legal_deck() {
    let db = database();
    let rules = FormatRules::default();
    let pool = load_pool_file("quitter", &fixture("pool.txt"), &db, None, rules.pool_size);
    let pool = Arc::new(pool.unwrap());
    let text = std::fs::read_to_string(fixture("deck.txt")).unwrap();

    let entries = parse_decklist(&text);
    assert!(!entries.iter().any(|(_, name)| name == "Craw Wurm"));

    let deck = Deck::from_decklist(pool, &entries, &rules).unwrap();
    assert_eq!(deck.total_cards(), 40);
    assert_eq!(deck.nonland_count(), 23);
    assert_eq!(deck.colors(), ['W', 'G']);
    assert_eq!(deck.owner(), "quitter");

    let dir = tempfile::tempdir().unwrap();
    let path = deck.write_dck(dir.path(), "quitter").unwrap();
    assert_eq!(path.file_name().unwrap(), "quitter.dck");
    let dck = std::fs::read_to_string(path).unwrap();
    assert!(dck.starts_with("[metadata]\nName=quitter\n[Main]\n"));
    assert!(dck.contains("6 Savannah Lions\n"));
    assert!(dck.contains("9 Plains\n"));
    assert!(dck.contains("8 Forest\n"));
}

#[test]
fn decklist_outside_the_pool_is_illegal() {
    let db = database();
    let rules = FormatRules::default();
    let pool = load_pool_file("first", &fixture("pool.txt"), &db, None, rules.pool_size);
    let pool = Arc::new(pool.unwrap());

    let entries = parse_decklist("```\n7 Savannah Lions\n16 Glory Seeker\n17 Plains\n```");
    let err = Deck::from_decklist(pool, &entries, &rules).unwrap_err();
    assert!(!err.violations.is_empty());
}
