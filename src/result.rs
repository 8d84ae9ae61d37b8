//! Structured analysis output and the running aggregate (same shape, same type).
//!
//! Two shapes exist:
//!  - `Flat`: category -> row of count columns (summed) and label columns (passed through).
//!    Which columns are counts is fixed by name (`schema::is_count_column`).
//!  - `Nested`: entity -> category -> metric -> count.
//!
//! Keys are stored normalized (see `merge::normalize_key`).

use crate::merge::{add_nested, merge_row_into, normalize_column, normalize_flat, normalize_key, normalize_tree};
use crate::schema::{
    is_count_column, parse_entity_csv, parse_entity_json, parse_flat_csv, OutputSchema, ParseMode, SchemaMismatchError,
};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Column used when a response carries a single unnamed count.
pub const DEFAULT_COUNT_COLUMN: &str = "mentions";

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatRow {
    pub counts: BTreeMap<String, i64>,
    pub labels: BTreeMap<String, String>,
}

impl FlatRow {
    pub fn mentions(n: i64) -> Self {
        let mut row = Self::default();
        row.counts.insert(DEFAULT_COUNT_COLUMN.to_string(), n);
        row
    }

    pub fn with_count(mut self, column: &str, n: i64) -> Self {
        self.counts.insert(normalize_column(column), n);
        self
    }

    pub fn with_label(mut self, column: &str, value: impl Into<String>) -> Self {
        self.labels.insert(normalize_column(column), value.into());
        self
    }
}

pub type FlatTable = BTreeMap<String, FlatRow>;
pub type EntityTree = BTreeMap<String, BTreeMap<String, BTreeMap<String, i64>>>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalysisResult {
    Flat(FlatTable),
    Nested(EntityTree),
}

/// The durable running total is just an accumulated `AnalysisResult`.
pub type Aggregate = AnalysisResult;

impl AnalysisResult {
    pub fn empty(schema: OutputSchema) -> Self {
        if schema.is_nested() {
            AnalysisResult::Nested(EntityTree::new())
        } else {
            AnalysisResult::Flat(FlatTable::new())
        }
    }

    /// Flat result from `(category, mentions)` pairs; keys are normalized and repeats summed.
    pub fn from_mentions<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, i64)>,
        K: AsRef<str>,
    {
        let mut table = FlatTable::new();
        for (k, n) in pairs {
            merge_row_into(&mut table, k.as_ref(), FlatRow::mentions(n));
        }
        AnalysisResult::Flat(table)
    }

    /// Nested result from `(entity, category, metric, count)` tuples.
    pub fn from_entity_counts<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = (S, S, S, i64)>,
        S: AsRef<str>,
    {
        let mut tree = EntityTree::new();
        for (e, c, m, n) in items {
            add_nested(&mut tree, e.as_ref(), c.as_ref(), m.as_ref(), n);
        }
        AnalysisResult::Nested(tree)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            AnalysisResult::Flat(t) => t.is_empty(),
            AnalysisResult::Nested(t) => t.is_empty(),
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            AnalysisResult::Flat(_) => "flat",
            AnalysisResult::Nested(_) => "nested",
        }
    }

    /// Number of category rows (flat) or entities (nested).
    pub fn len(&self) -> usize {
        match self {
            AnalysisResult::Flat(t) => t.len(),
            AnalysisResult::Nested(t) => t.len(),
        }
    }

    /// Mentions for a flat category; the lookup key is normalized first.
    pub fn mentions(&self, category: &str) -> Option<i64> {
        self.count(category, DEFAULT_COUNT_COLUMN)
    }

    pub fn count(&self, category: &str, column: &str) -> Option<i64> {
        match self {
            AnalysisResult::Flat(t) => t
                .get(&normalize_key(category))
                .and_then(|row| row.counts.get(&normalize_column(column)).copied()),
            AnalysisResult::Nested(_) => None,
        }
    }

    pub fn label(&self, category: &str, column: &str) -> Option<&str> {
        match self {
            AnalysisResult::Flat(t) => t
                .get(&normalize_key(category))
                .and_then(|row| row.labels.get(&normalize_column(column)))
                .map(String::as_str),
            AnalysisResult::Nested(_) => None,
        }
    }

    pub fn nested_count(&self, entity: &str, category: &str, metric: &str) -> Option<i64> {
        match self {
            AnalysisResult::Nested(t) => t
                .get(&normalize_key(entity))
                .and_then(|cats| cats.get(&normalize_key(category)))
                .and_then(|ms| ms.get(&normalize_key(metric)))
                .copied(),
            AnalysisResult::Flat(_) => None,
        }
    }

    /// Every count flattened to `(label, value)`, sorted by label.
    /// Flat: `category` for the mentions column, `category [column]` otherwise.
    /// Nested: `entity / category / metric`.
    pub fn totals(&self) -> Vec<(String, i64)> {
        let mut out = Vec::new();
        match self {
            AnalysisResult::Flat(t) => {
                for (key, row) in t {
                    for (col, n) in &row.counts {
                        if col == DEFAULT_COUNT_COLUMN {
                            out.push((key.clone(), *n));
                        } else {
                            out.push((format!("{key} [{col}]"), *n));
                        }
                    }
                }
            }
            AnalysisResult::Nested(t) => {
                for (entity, cats) in t {
                    for (cat, metrics) in cats {
                        for (metric, n) in metrics {
                            out.push((format!("{entity} / {cat} / {metric}"), *n));
                        }
                    }
                }
            }
        }
        out.sort();
        out
    }

    /// Copy without zero-valued counts (and without parents left empty by that).
    /// Presentation only: totals are unaffected because zeros add nothing.
    pub fn pruned(&self) -> Self {
        match self {
            AnalysisResult::Flat(t) => {
                let mut table = FlatTable::new();
                for (key, row) in t {
                    let mut row = row.clone();
                    let had_counts = !row.counts.is_empty();
                    row.counts.retain(|_, n| *n != 0);
                    if had_counts && row.counts.is_empty() {
                        continue;
                    }
                    table.insert(key.clone(), row);
                }
                AnalysisResult::Flat(table)
            }
            AnalysisResult::Nested(t) => {
                let mut tree = EntityTree::new();
                for (entity, cats) in t {
                    let mut kept_cats = BTreeMap::new();
                    for (cat, metrics) in cats {
                        let kept: BTreeMap<String, i64> =
                            metrics.iter().filter(|(_, n)| **n != 0).map(|(m, n)| (m.clone(), *n)).collect();
                        if !kept.is_empty() {
                            kept_cats.insert(cat.clone(), kept);
                        }
                    }
                    if !kept_cats.is_empty() {
                        tree.insert(entity.clone(), kept_cats);
                    }
                }
                AnalysisResult::Nested(tree)
            }
        }
    }

    /// Re-key everything through the normalizer, folding keys that collide.
    pub fn normalized(self) -> Self {
        match self {
            AnalysisResult::Flat(t) => AnalysisResult::Flat(normalize_flat(t)),
            AnalysisResult::Nested(t) => AnalysisResult::Nested(normalize_tree(t)),
        }
    }

    /// Serialize in the storage format of `schema`: flat CSV, entity CSV or pretty JSON.
    pub fn encode(&self, schema: OutputSchema) -> Result<Vec<u8>> {
        match (schema, self) {
            (OutputSchema::FlatCsvV1, AnalysisResult::Flat(t)) => encode_flat_csv(t),
            (OutputSchema::EntityCsvV1, AnalysisResult::Nested(t)) => encode_entity_csv(t),
            (OutputSchema::EntityJsonV1, AnalysisResult::Nested(t)) => {
                Ok(serde_json::to_vec_pretty(t).context("serialize entity tree")?)
            }
            (schema, other) => Err(SchemaMismatchError::new(
                schema.name(),
                format!("cannot encode a {} result", other.shape()),
            )
            .into()),
        }
    }

    /// Parse a previously encoded blob. Stricter than response parsing: any malformed
    /// row is an error, because silently dropping persisted totals would lose data.
    pub fn decode(schema: OutputSchema, bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes).context("stored analysis is not UTF-8")?;
        let result = match schema {
            OutputSchema::FlatCsvV1 => AnalysisResult::Flat(parse_flat_csv(text, ParseMode::Strict)?),
            OutputSchema::EntityCsvV1 => AnalysisResult::Nested(parse_entity_csv(text, ParseMode::Strict)?),
            OutputSchema::EntityJsonV1 => AnalysisResult::Nested(parse_entity_json(text, ParseMode::Strict)?),
        };
        Ok(result)
    }
}

fn title_case(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Column kinds are carried by the header names, so a column whose name does not
/// match its kind would change kind on decode. Such tables are refused.
fn encode_flat_csv(table: &FlatTable) -> Result<Vec<u8>> {
    let numeric: BTreeSet<&String> = table.values().flat_map(|r| r.counts.keys()).collect();
    let labels: BTreeSet<&String> = table.values().flat_map(|r| r.labels.keys()).collect();
    if let Some(col) = numeric.iter().find(|c| !is_count_column(c)) {
        return Err(SchemaMismatchError::new("flat-csv", format!("{col:?} holds counts but is not a count column name")).into());
    }
    if let Some(col) = labels.iter().find(|c| is_count_column(c)) {
        return Err(SchemaMismatchError::new("flat-csv", format!("{col:?} holds labels but is a count column name")).into());
    }

    let mut w = csv::Writer::from_writer(Vec::new());
    let mut header = vec!["Category".to_string()];
    header.extend(numeric.iter().map(|c| title_case(c)));
    header.extend(labels.iter().map(|c| title_case(c)));
    w.write_record(&header)?;

    for (key, row) in table {
        let mut rec = Vec::with_capacity(header.len());
        rec.push(key.clone());
        for col in &numeric {
            rec.push(row.counts.get(*col).map(|n| n.to_string()).unwrap_or_default());
        }
        for col in &labels {
            rec.push(row.labels.get(*col).cloned().unwrap_or_default());
        }
        w.write_record(&rec)?;
    }
    w.into_inner().map_err(|e| anyhow::anyhow!("flush csv: {}", e.error()))
}

fn encode_entity_csv(tree: &EntityTree) -> Result<Vec<u8>> {
    let mut w = csv::Writer::from_writer(Vec::new());
    w.write_record(["Entity", "Category", "Metric", "Count"])?;
    for (entity, cats) in tree {
        for (cat, metrics) in cats {
            for (metric, n) in metrics {
                let n = n.to_string();
                w.write_record([entity.as_str(), cat.as_str(), metric.as_str(), n.as_str()])?;
            }
        }
    }
    w.into_inner().map_err(|e| anyhow::anyhow!("flush csv: {}", e.error()))
}
