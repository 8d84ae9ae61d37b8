//! Aggregate merging: fold a chunk's `AnalysisResult` into the running total.
//!
//! Merge is a key-wise sum over normalized keys. Label columns are passed through;
//! when both sides carry different labels the lexicographically smaller one wins, so
//! `merge` stays associative and commutative. Chunk order never changes the totals.

use crate::result::{AnalysisResult, EntityTree, FlatRow, FlatTable};
use crate::schema::SchemaMismatchError;
use regex::Regex;
use std::sync::OnceLock;

/// `"John Doe, 5"` / `"John Doe (5)"` -> `"John Doe"`.
fn count_fragment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(.*?)\s*(?:,\s*\d+|\(\s*\d+\s*\))\s*$").expect("count fragment pattern"))
}

/// Canonical form of a category or entity key: trimmed, unquoted, lowercased,
/// whitespace collapsed, trailing count fragment removed.
pub fn normalize_key(raw: &str) -> String {
    let lowered = raw.trim().trim_matches('"').to_lowercase();
    let collapsed = lowered.split_whitespace().collect::<Vec<_>>().join(" ");
    match count_fragment_re().captures(&collapsed) {
        Some(caps) if !caps[1].trim().is_empty() => caps[1].trim().to_string(),
        _ => collapsed,
    }
}

/// Column names are compared case-insensitively.
pub fn normalize_column(raw: &str) -> String {
    raw.trim().trim_matches('"').to_lowercase()
}

/// Fold `row` into `table[normalize_key(key)]`.
pub fn merge_row_into(table: &mut FlatTable, key: &str, row: FlatRow) {
    let entry = table.entry(normalize_key(key)).or_default();
    for (col, n) in row.counts {
        let slot = entry.counts.entry(normalize_column(&col)).or_insert(0);
        *slot = slot.saturating_add(n);
    }
    for (col, label) in row.labels {
        let col = normalize_column(&col);
        match entry.labels.get_mut(&col) {
            Some(existing) if *existing <= label => {}
            Some(existing) => *existing = label,
            None => {
                entry.labels.insert(col, label);
            }
        }
    }
}

/// Add `n` to `tree[entity][category][metric]`, normalizing every level.
pub fn add_nested(tree: &mut EntityTree, entity: &str, category: &str, metric: &str, n: i64) {
    let slot = tree
        .entry(normalize_key(entity))
        .or_default()
        .entry(normalize_key(category))
        .or_default()
        .entry(normalize_key(metric))
        .or_insert(0);
    *slot = slot.saturating_add(n);
}

pub(crate) fn normalize_flat(table: FlatTable) -> FlatTable {
    let mut out = FlatTable::new();
    for (key, row) in table {
        merge_row_into(&mut out, &key, row);
    }
    out
}

pub(crate) fn normalize_tree(tree: EntityTree) -> EntityTree {
    let mut out = EntityTree::new();
    for (entity, cats) in tree {
        for (cat, metrics) in cats {
            for (metric, n) in metrics {
                add_nested(&mut out, &entity, &cat, &metric, n);
            }
        }
    }
    out
}

/// Merge `new` into `existing`.
///
/// An empty side is neutral regardless of shape; two non-empty results of different
/// shapes cannot be merged.
pub fn merge(existing: AnalysisResult, new: AnalysisResult) -> Result<AnalysisResult, SchemaMismatchError> {
    match (existing, new) {
        (a, b) if b.is_empty() => Ok(a.normalized()),
        (a, b) if a.is_empty() => Ok(b.normalized()),
        (AnalysisResult::Flat(a), AnalysisResult::Flat(b)) => {
            let mut table = normalize_flat(a);
            for (key, row) in b {
                merge_row_into(&mut table, &key, row);
            }
            Ok(AnalysisResult::Flat(table))
        }
        (AnalysisResult::Nested(a), AnalysisResult::Nested(b)) => {
            let mut tree = normalize_tree(a);
            for (entity, cats) in b {
                for (cat, metrics) in cats {
                    for (metric, n) in metrics {
                        add_nested(&mut tree, &entity, &cat, &metric, n);
                    }
                }
            }
            Ok(AnalysisResult::Nested(tree))
        }
        (a, b) => Err(SchemaMismatchError::new(
            a.shape(),
            format!("cannot merge a {} result into a {} aggregate", b.shape(), a.shape()),
        )),
    }
}

/// Left fold of `merge` over `results`, starting from `init`.
pub fn merge_all<I>(init: AnalysisResult, results: I) -> Result<AnalysisResult, SchemaMismatchError>
where
    I: IntoIterator<Item = AnalysisResult>,
{
    results.into_iter().try_fold(init, merge)
}
