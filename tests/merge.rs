use sentiment_etl::{merge, merge_all, normalize_key, AnalysisResult, FlatRow, FlatTable, OutputSchema};

fn flat(rows: &[(&str, FlatRow)]) -> AnalysisResult {
    let table: FlatTable = rows.iter().map(|(k, r)| (k.to_string(), r.clone())).collect();
    AnalysisResult::Flat(table).normalized()
}

/// Aggregate {Positive: 3} merged with {Positive: 2, Negative: 1} gives {Positive: 5, Negative: 1}.
#[test]
fn merge_sums_overlapping_and_copies_disjoint_keys() {
    let existing = AnalysisResult::from_mentions([("Positive", 3)]);
    let new = AnalysisResult::from_mentions([("Positive", 2), ("Negative", 1)]);
    let merged = merge(existing, new).unwrap();
    assert_eq!(merged, AnalysisResult::from_mentions([("Positive", 5), ("Negative", 1)]));
}

/// Every ordering and grouping of the same results folds to the same aggregate,
/// with overlapping keys, disjoint keys, keys that only match after normalization,
/// extra numeric columns and conflicting labels.
#[test]
fn merge_is_associative_and_commutative() {
    let a = flat(&[
        ("John Doe", FlatRow::mentions(2).with_label("Sentiment", "positive")),
        ("Sentiments: Positive", FlatRow::mentions(4)),
    ]);
    let b = flat(&[
        ("john doe, 3", FlatRow::mentions(1).with_count("Retweet Count", 10)),
        ("Emotions: Fear", FlatRow::mentions(1)),
    ]);
    let c = flat(&[
        ("JOHN   DOE (2)", FlatRow::mentions(5).with_label("sentiment", "negative")),
        ("Sentiments: Positive", FlatRow::mentions(1)),
        ("Emotions: Fear", FlatRow::mentions(0)),
    ]);

    let abc = merge(merge(a.clone(), b.clone()).unwrap(), c.clone()).unwrap();
    let bca = merge(merge(b.clone(), c.clone()).unwrap(), a.clone()).unwrap();
    let a_bc = merge(a.clone(), merge(b.clone(), c.clone()).unwrap()).unwrap();
    let cba = merge_all(c.clone(), [b.clone(), a.clone()]).unwrap();
    let bac = merge_all(b.clone(), [a.clone(), c.clone()]).unwrap();
    for other in [&bca, &a_bc, &cba, &bac] {
        assert_eq!(&abc, other);
    }

    assert_eq!(abc.mentions("John Doe"), Some(8));
    assert_eq!(abc.count("john doe", "retweet count"), Some(10));
    assert_eq!(abc.label("john doe", "sentiment"), Some("negative"));
    assert_eq!(abc.mentions("sentiments: positive"), Some(5));
    assert_eq!(abc.mentions("emotions: fear"), Some(1));
}

/// Nested results recurse entity -> category -> metric, summing shared leaves and
/// copying the rest, in any order.
#[test]
fn nested_merge_recurses_and_commutes() {
    let a = AnalysisResult::from_entity_counts([
        ("Jane Doe", "Sentiments", "Positive", 2),
        ("Jane Doe", "Emotions", "Joy", 1),
    ]);
    let b = AnalysisResult::from_entity_counts([
        ("jane doe, 4", "sentiments", "positive", 3),
        ("ACME Corp", "Sentiments", "Negative", 1),
    ]);
    let ab = merge(a.clone(), b.clone()).unwrap();
    let ba = merge(b, a).unwrap();
    assert_eq!(ab, ba);
    assert_eq!(ab.nested_count("Jane Doe", "Sentiments", "Positive"), Some(5));
    assert_eq!(ab.nested_count("jane doe", "emotions", "joy"), Some(1));
    assert_eq!(ab.nested_count("acme corp", "sentiments", "negative"), Some(1));
    assert_eq!(ab.len(), 2);
}

/// "John Doe", "john doe, 3" and "John Doe (5)" are the same key.
#[test]
fn keys_normalize_case_whitespace_and_count_fragments() {
    assert_eq!(normalize_key("John Doe"), "john doe");
    assert_eq!(normalize_key("  john   doe, 3 "), "john doe");
    assert_eq!(normalize_key("John Doe (5)"), "john doe");
    assert_eq!(normalize_key("\"Sentiments: Positive\""), "sentiments: positive");
    // a bare number is a key in its own right, not a count fragment
    assert_eq!(normalize_key("2024"), "2024");
}

/// An empty result is neutral on either side, whatever its shape.
#[test]
fn empty_result_is_neutral() {
    let nested = AnalysisResult::from_entity_counts([("a", "b", "c", 1)]);
    let empty_flat = AnalysisResult::empty(OutputSchema::FlatCsvV1);
    assert_eq!(merge(empty_flat.clone(), nested.clone()).unwrap(), nested);
    assert_eq!(merge(nested.clone(), empty_flat).unwrap(), nested);
}

/// Two non-empty results of different shapes cannot be merged.
#[test]
fn shape_mismatch_is_an_error() {
    let flat = AnalysisResult::from_mentions([("x", 1)]);
    let nested = AnalysisResult::from_entity_counts([("a", "b", "c", 1)]);
    let err = merge(flat, nested).unwrap_err();
    assert_eq!(err.expected, "flat");
}

/// Pruning drops zero counts (and parents emptied by that) without changing totals.
#[test]
fn pruning_only_removes_zeros() {
    let agg = AnalysisResult::from_mentions([("Positive", 3), ("Negative", 0)]);
    let pruned = agg.pruned();
    assert_eq!(pruned.mentions("Negative"), None);
    assert_eq!(pruned.mentions("Positive"), Some(3));
    let total = |r: &AnalysisResult| r.totals().iter().map(|(_, n)| n).sum::<i64>();
    assert_eq!(total(&agg), total(&pruned));

    let nested = AnalysisResult::from_entity_counts([("a", "s", "pos", 0), ("b", "s", "pos", 2)]).pruned();
    assert_eq!(nested.len(), 1);
    assert_eq!(nested.nested_count("b", "s", "pos"), Some(2));
}
