//! Versioned output schemas: the instruction sent with every chunk and the parser
//! that turns the analyzer's raw reply back into an `AnalysisResult`.
//!
//! Parsing is tolerant of the usual model noise (code fences, prose before the table,
//! stray whitespace, the odd malformed row) but fails fast with `SchemaMismatchError`
//! when the reply is not the requested shape at all.

use crate::merge::{add_nested, merge_row_into, normalize_column, normalize_key};
use crate::result::{AnalysisResult, EntityTree, FlatRow, FlatTable, DEFAULT_COUNT_COLUMN};
use csv::{ReaderBuilder, StringRecord, Trim};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("response does not match the {expected} schema: {reason}")]
pub struct SchemaMismatchError {
    pub expected: &'static str,
    pub reason: String,
}

impl SchemaMismatchError {
    pub fn new(expected: &'static str, reason: impl Into<String>) -> Self {
        Self { expected, reason: reason.into() }
    }
}

/// Shape requested from the analyzer. A configuration choice, fixed for a whole run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OutputSchema {
    /// `Category,Mentions[,...]` CSV, one row per sentiment/emotion category.
    #[default]
    FlatCsvV1,
    /// `{"entity": {"category": {"metric": n}}}` JSON.
    EntityJsonV1,
    /// `Entity,Category,Metric,Count` CSV.
    EntityCsvV1,
}

const FLAT_CSV_INSTRUCTION: &str = "You are a research assistant analysing public sentiment in social-media posts. \
The user message contains posts, one per line. Count how many posts express each sentiment and emotion. \
Answer ONLY with CSV using the header `Category,Mentions`. Use categories such as \
`Sentiments: Positive`, `Sentiments: Negative`, `Sentiments: Neutral` and `Emotions: <emotion>`. \
Mentions must be whole numbers. Do not add commentary.";

const ENTITY_JSON_INSTRUCTION: &str = "You are a research assistant analysing public sentiment in social-media posts. \
The user message contains posts, one per line. For every person or organisation mentioned, count the posts \
expressing each sentiment and emotion towards it. Answer ONLY with a JSON object of the form \
{\"<entity>\": {\"Sentiments\": {\"Positive\": 0, \"Negative\": 0, \"Neutral\": 0}, \"Emotions\": {\"<emotion>\": 0}}}. \
Counts must be whole numbers. Do not add commentary.";

const ENTITY_CSV_INSTRUCTION: &str = "You are a research assistant analysing public sentiment in social-media posts. \
The user message contains posts, one per line. For every person or organisation mentioned, count the posts \
expressing each sentiment and emotion towards it. Answer ONLY with CSV using the header \
`Entity,Category,Metric,Count`, for example `Jane Doe,Sentiments,Positive,3` or `Jane Doe,Emotions,Anger,1`. \
Counts must be whole numbers. Do not add commentary.";

impl OutputSchema {
    pub fn name(&self) -> &'static str {
        match self {
            OutputSchema::FlatCsvV1 => "flat-csv",
            OutputSchema::EntityJsonV1 => "entity-json",
            OutputSchema::EntityCsvV1 => "entity-csv",
        }
    }

    pub fn version(&self) -> u32 {
        1
    }

    pub fn is_nested(&self) -> bool {
        !matches!(self, OutputSchema::FlatCsvV1)
    }

    /// File extension of the stored aggregate and per-chunk outputs.
    pub fn extension(&self) -> &'static str {
        match self {
            OutputSchema::FlatCsvV1 | OutputSchema::EntityCsvV1 => "csv",
            OutputSchema::EntityJsonV1 => "json",
        }
    }

    pub fn instruction(&self) -> &'static str {
        match self {
            OutputSchema::FlatCsvV1 => FLAT_CSV_INSTRUCTION,
            OutputSchema::EntityJsonV1 => ENTITY_JSON_INSTRUCTION,
            OutputSchema::EntityCsvV1 => ENTITY_CSV_INSTRUCTION,
        }
    }

    /// Parse an analyzer reply. Malformed rows are logged and skipped.
    pub fn parse_response(&self, raw: &str) -> Result<AnalysisResult, SchemaMismatchError> {
        match self {
            OutputSchema::FlatCsvV1 => parse_flat_csv(raw, ParseMode::Lenient).map(AnalysisResult::Flat),
            OutputSchema::EntityJsonV1 => parse_entity_json(raw, ParseMode::Lenient).map(AnalysisResult::Nested),
            OutputSchema::EntityCsvV1 => parse_entity_csv(raw, ParseMode::Lenient).map(AnalysisResult::Nested),
        }
    }
}

impl fmt::Display for OutputSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/v{}", self.name(), self.version())
    }
}

impl FromStr for OutputSchema {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        let s = s.strip_suffix("/v1").unwrap_or(&s);
        match s {
            "flat-csv" | "flat" | "csv" => Ok(OutputSchema::FlatCsvV1),
            "entity-json" | "json" => Ok(OutputSchema::EntityJsonV1),
            "entity-csv" => Ok(OutputSchema::EntityCsvV1),
            other => Err(format!("unknown output schema {other:?} (expected flat-csv, entity-json or entity-csv)")),
        }
    }
}

// ----------------------------- Parsing ------------------------------------

/// Replies are parsed leniently; stored blobs strictly (a bad row is an error).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ParseMode {
    Lenient,
    Strict,
}

/// Parse an integer count: `3`, ` 3 `, `"1,204"`, `3.0`. Fractions are rejected.
pub fn parse_count(cell: &str) -> Option<i64> {
    let s: String = cell.trim().trim_matches('"').chars().filter(|c| *c != ',' && *c != '_').collect();
    if s.is_empty() {
        return None;
    }
    if let Ok(n) = s.parse::<i64>() {
        return Some(n);
    }
    let f = s.parse::<f64>().ok()?;
    (f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15).then_some(f as i64)
}

fn json_count(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0 && f.abs() < 9.0e15).map(|f| f as i64)),
        Value::String(s) => parse_count(s),
        _ => None,
    }
}

/// Drop a surrounding markdown code fence (```csv ... ```), if any.
fn strip_code_fences(raw: &str) -> &str {
    let t = raw.trim();
    let Some(rest) = t.strip_prefix("```") else { return t };
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    rest.trim_end().strip_suffix("```").unwrap_or(rest).trim()
}

fn split_header_cells(line: &str) -> Vec<String> {
    line.split(',').map(normalize_column).collect()
}

/// Skip any prose the model put before the table: return the text starting at the
/// first line whose cells include every `required` column name.
fn locate_header<'a>(raw: &'a str, required: &[&str]) -> Option<&'a str> {
    let body = strip_code_fences(raw);
    let mut offset = 0;
    for line in body.split_inclusive('\n') {
        let cells = split_header_cells(line);
        if required.iter().all(|r| cells.iter().any(|c| c == r)) {
            return Some(&body[offset..]);
        }
        offset += line.len();
    }
    None
}

fn read_rows(body: &str, mode: ParseMode, expected: &'static str) -> Result<(Vec<String>, Vec<StringRecord>), SchemaMismatchError> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(body.as_bytes());
    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| SchemaMismatchError::new(expected, format!("unreadable header: {e}")))?
        .iter()
        .map(normalize_column)
        .collect();
    let mut rows = Vec::new();
    for (i, rec) in rdr.records().enumerate() {
        match rec {
            Ok(r) => rows.push(r),
            Err(e) if mode == ParseMode::Lenient => tracing::warn!(row = i + 1, error = %e, "skipping unreadable row"),
            Err(e) => return Err(SchemaMismatchError::new(expected, format!("row {}: {e}", i + 1))),
        }
    }
    Ok((headers, rows))
}

/// Column names `FlatCsvV1` always reads as counts.
pub const FLAT_COUNT_COLUMNS: [&str; 4] = ["mentions", "count", "counts", "number of mentions"];

/// Whether a `FlatCsvV1` column holds counts. Decided by name alone, so a column has
/// the same kind in every reply and in every stored blob: one of `FLAT_COUNT_COLUMNS`,
/// or a name ending in ` count` / ` mentions` (`Retweet Count`, `Joy Mentions`).
/// Every other column is a label.
pub fn is_count_column(name: &str) -> bool {
    let name = normalize_column(name);
    FLAT_COUNT_COLUMNS.contains(&name.as_str()) || name.ends_with(" count") || name.ends_with(" mentions")
}

/// A count column with values but not one whole number holds labels, not counts.
fn column_has_no_counts(rows: &[StringRecord], col: usize) -> bool {
    let mut cells = rows.iter().map(|r| r.get(col).unwrap_or("").trim()).filter(|c| !c.is_empty()).peekable();
    cells.peek().is_some() && cells.all(|c| parse_count(c).is_none())
}

/// Handle one bad row: skip with a warning (lenient) or fail (strict).
fn reject_row(mode: ParseMode, expected: &'static str, row: usize, reason: String) -> Result<(), SchemaMismatchError> {
    match mode {
        ParseMode::Lenient => {
            tracing::warn!(row, reason = %reason, "skipping malformed row");
            Ok(())
        }
        ParseMode::Strict => Err(SchemaMismatchError::new(expected, format!("row {row}: {reason}"))),
    }
}

pub(crate) fn parse_flat_csv(raw: &str, mode: ParseMode) -> Result<FlatTable, SchemaMismatchError> {
    const EXPECTED: &str = "flat-csv";
    let body = locate_header(raw, &["category"])
        .ok_or_else(|| SchemaMismatchError::new(EXPECTED, "no header row with a Category column"))?;
    let (headers, rows) = read_rows(body, mode, EXPECTED)?;
    let cat_idx = headers
        .iter()
        .position(|h| h == "category")
        .ok_or_else(|| SchemaMismatchError::new(EXPECTED, "missing Category column"))?;

    let numeric: Vec<bool> = headers
        .iter()
        .enumerate()
        .map(|(c, h)| c != cat_idx && !h.is_empty() && is_count_column(h))
        .collect();
    if !rows.is_empty() && !numeric.iter().any(|n| *n) {
        return Err(SchemaMismatchError::new(EXPECTED, "no count column"));
    }
    if let Some(c) = (0..headers.len()).find(|&c| numeric[c] && column_has_no_counts(&rows, c)) {
        return Err(SchemaMismatchError::new(
            EXPECTED,
            format!("count column {:?} holds no whole numbers", headers[c]),
        ));
    }

    let mut table = FlatTable::new();
    'rows: for (i, rec) in rows.iter().enumerate() {
        let rowno = i + 1;
        let key = normalize_key(rec.get(cat_idx).unwrap_or(""));
        if key.is_empty() {
            reject_row(mode, EXPECTED, rowno, "empty category".into())?;
            continue;
        }
        let mut row = FlatRow::default();
        for (c, h) in headers.iter().enumerate() {
            if c == cat_idx || h.is_empty() {
                continue;
            }
            let cell = rec.get(c).unwrap_or("").trim();
            if cell.is_empty() {
                continue;
            }
            if numeric[c] {
                match parse_count(cell) {
                    Some(n) => {
                        row.counts.insert(h.clone(), n);
                    }
                    None => {
                        reject_row(mode, EXPECTED, rowno, format!("{h} is not a whole number: {cell:?}"))?;
                        continue 'rows;
                    }
                }
            } else {
                row.labels.insert(h.clone(), cell.to_string());
            }
        }
        if mode == ParseMode::Lenient && row.counts.is_empty() {
            reject_row(mode, EXPECTED, rowno, format!("no counts for {key:?}"))?;
            continue;
        }
        merge_row_into(&mut table, &key, row);
    }
    Ok(table)
}

pub(crate) fn parse_entity_csv(raw: &str, mode: ParseMode) -> Result<EntityTree, SchemaMismatchError> {
    const EXPECTED: &str = "entity-csv";
    const REQUIRED: [&str; 4] = ["entity", "category", "metric", "count"];
    let body = locate_header(raw, &REQUIRED)
        .ok_or_else(|| SchemaMismatchError::new(EXPECTED, "no Entity,Category,Metric,Count header row"))?;
    let (headers, rows) = read_rows(body, mode, EXPECTED)?;
    let mut idx = [0usize; 4];
    for (slot, name) in idx.iter_mut().zip(REQUIRED) {
        *slot = headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| SchemaMismatchError::new(EXPECTED, format!("missing {name} column")))?;
    }
    let [e_idx, c_idx, m_idx, n_idx] = idx;

    let mut tree = EntityTree::new();
    for (i, rec) in rows.iter().enumerate() {
        let rowno = i + 1;
        let field = move |j: usize| rec.get(j).unwrap_or("").trim();
        let (entity, category, metric) = (field(e_idx), field(c_idx), field(m_idx));
        if entity.is_empty() || category.is_empty() || metric.is_empty() {
            reject_row(mode, EXPECTED, rowno, "missing entity, category or metric".into())?;
            continue;
        }
        match parse_count(field(n_idx)) {
            Some(n) => add_nested(&mut tree, entity, category, metric, n),
            None => reject_row(mode, EXPECTED, rowno, format!("count is not a whole number: {:?}", field(n_idx)))?,
        }
    }
    Ok(tree)
}

pub(crate) fn parse_entity_json(raw: &str, mode: ParseMode) -> Result<EntityTree, SchemaMismatchError> {
    const EXPECTED: &str = "entity-json";
    let body = strip_code_fences(raw);
    let (Some(start), Some(end)) = (body.find('{'), body.rfind('}')) else {
        return Err(SchemaMismatchError::new(EXPECTED, "no JSON object in response"));
    };
    if end < start {
        return Err(SchemaMismatchError::new(EXPECTED, "no JSON object in response"));
    }
    let value: Value = serde_json::from_str(&body[start..=end])
        .map_err(|e| SchemaMismatchError::new(EXPECTED, format!("invalid JSON: {e}")))?;
    let Value::Object(entities) = value else {
        return Err(SchemaMismatchError::new(EXPECTED, "top level is not an object"));
    };

    let mut tree = EntityTree::new();
    for (row, (entity, cats)) in entities.iter().enumerate() {
        let rowno = row + 1;
        let Value::Object(cats) = cats else {
            reject_row(mode, EXPECTED, rowno, format!("entity {entity:?} is not an object"))?;
            continue;
        };
        for (category, metrics) in cats {
            match metrics {
                Value::Object(ms) => {
                    for (metric, v) in ms {
                        match json_count(v) {
                            Some(n) => add_nested(&mut tree, entity, category, metric, n),
                            None => reject_row(
                                mode,
                                EXPECTED,
                                rowno,
                                format!("{entity}/{category}/{metric} is not a whole number"),
                            )?,
                        }
                    }
                }
                // `{"entity": {"Positive": 3}}`: a count directly under the category
                other => match json_count(other) {
                    Some(n) => add_nested(&mut tree, entity, category, DEFAULT_COUNT_COLUMN, n),
                    None => reject_row(mode, EXPECTED, rowno, format!("{entity}/{category} is not a count"))?,
                },
            }
        }
    }
    Ok(tree)
}
