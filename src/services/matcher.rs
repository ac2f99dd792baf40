//! Material matching between BOM lines and inventory receipts.
//!
//! Extraction produces the BOM and the receipt table from different source
//! documents, so the same physical material can be spelled differently on
//! each side. Matching runs an ordered list of pure strategies per
//! (entry, receipt) pair; the first strategy that succeeds wins.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::entities::{BomEntry, InventoryLot};

static PAREN_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\([^)]*\)").unwrap());

/// Curated aliases: short code a BOM author writes → fragment expected in the
/// receipt's material name. Checked in both directions.
const SYNONYMS: &[(&str, &str)] = &[
    ("MDF", "MEDIUM DENSITY FIBREBOARD"),
    ("PB", "PARTICLE BOARD"),
    ("MFC", "MELAMINE FACED CHIPBOARD"),
    ("OSB", "ORIENTED STRAND BOARD"),
    ("PU", "POLYURETHANE"),
    ("PVC", "POLYVINYL CHLORIDE"),
    ("EVA", "ETHYLENE VINYL ACETATE"),
    ("HDF", "HIGH DENSITY FIBREBOARD"),
];

/// Canonical form used for code and name comparison: trimmed, uppercased,
/// internal whitespace collapsed.
pub fn normalize(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// Tokens usable for fuzzy name comparison: parentheticals removed,
/// non-ASCII (non-Latin scripts, punctuation) stripped, tokens shorter than
/// three characters dropped.
pub fn keywords(raw: &str) -> Vec<String> {
    let without_parens = PAREN_RE.replace_all(raw, " ");
    let latin_only: String = without_parens
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                ' '
            }
        })
        .collect();
    latin_only
        .split_whitespace()
        .filter(|token| token.len() > 2)
        .map(|token| token.to_string())
        .collect()
}

fn code_match(entry: &BomEntry, lot: &InventoryLot) -> bool {
    let code = normalize(&entry.material_code);
    !code.is_empty() && code == normalize(&lot.material_code)
}

fn name_match(entry: &BomEntry, lot: &InventoryLot) -> bool {
    let name = normalize(&entry.material_name);
    !name.is_empty() && name == normalize(&lot.material_name)
}

fn keyword_match(entry: &BomEntry, lot: &InventoryLot) -> bool {
    let lot_name = normalize(&lot.material_name);
    if lot_name.is_empty() {
        return false;
    }
    keywords(&entry.material_name)
        .iter()
        .any(|token| lot_name.contains(token.as_str()))
}

fn synonym_match(entry: &BomEntry, lot: &InventoryLot) -> bool {
    let entry_name = normalize(&entry.material_name);
    let lot_name = normalize(&lot.material_name);
    let entry_tokens: Vec<&str> = entry_name.split(' ').collect();
    let lot_tokens: Vec<&str> = lot_name.split(' ').collect();
    SYNONYMS.iter().any(|(alias, fragment)| {
        (entry_tokens.contains(alias) && lot_name.contains(fragment))
            || (lot_tokens.contains(alias) && entry_name.contains(fragment))
    })
}

/// One pure matching strategy.
pub struct MatchStrategy {
    pub name: &'static str,
    pub matches: fn(&BomEntry, &InventoryLot) -> bool,
}

/// Strategies in evaluation order.
pub const STRATEGIES: &[MatchStrategy] = &[
    MatchStrategy {
        name: "code",
        matches: code_match,
    },
    MatchStrategy {
        name: "name",
        matches: name_match,
    },
    MatchStrategy {
        name: "keyword",
        matches: keyword_match,
    },
    MatchStrategy {
        name: "synonym",
        matches: synonym_match,
    },
];

/// Returns the name of the first strategy that matches the pair, if any.
pub fn match_strategy(entry: &BomEntry, lot: &InventoryLot) -> Option<&'static str> {
    STRATEGIES
        .iter()
        .find(|strategy| (strategy.matches)(entry, lot))
        .map(|strategy| strategy.name)
}

/// True when any strategy matches the pair.
pub fn matches(entry: &BomEntry, lot: &InventoryLot) -> bool {
    match_strategy(entry, lot).is_some()
}
