use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const SUPPORTING_SOURCES: &str = "supporting_sources";

/// One association row, e.g. compound → target or disease → gene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Association {
    pub identifier: String,
    pub entity: String,
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

impl Association {
    pub fn new(identifier: impl Into<String>, entity: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            entity: entity.into(),
            source: String::new(),
            score: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_score(mut self, score: f64) -> Self {
        self.score = Some(score);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Rows describing the same pair collapse onto this key during a merge.
    /// Identifiers keep their case (SMILES are case-sensitive), entities are
    /// gene/target symbols and compare case-insensitively.
    fn dedup_key(&self) -> (String, String) {
        (
            self.identifier.trim().to_string(),
            self.entity.trim().to_uppercase(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    rows: Vec<Association>,
}

impl ResultTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<Association>) -> Self {
        Self { rows }
    }

    pub fn push(&mut self, row: Association) {
        self.rows.push(row);
    }

    pub fn extend(&mut self, other: ResultTable) {
        self.rows.extend(other.rows);
    }

    pub fn rows(&self) -> &[Association] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<Association> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Stamp every row with the strategy that produced it.
    pub fn tag_source(&mut self, source: &str) {
        for row in &mut self.rows {
            row.source = source.to_string();
        }
    }

    /// Unique entities in sorted order; these become the identifiers of a
    /// downstream step.
    pub fn entities(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|row| row.entity.trim().to_string())
            .filter(|entity| !entity.is_empty())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Tab separated export. Attribute columns are the union over all rows.
    pub fn to_tsv(&self) -> String {
        let attribute_keys = self
            .rows
            .iter()
            .flat_map(|row| row.attributes.keys().cloned())
            .collect::<BTreeSet<_>>();
        let mut out = String::from("identifier\tentity\tsource\tscore");
        for key in &attribute_keys {
            out.push('\t');
            out.push_str(key);
        }
        out.push('\n');
        for row in &self.rows {
            let score = row.score.map(|s| s.to_string()).unwrap_or_default();
            out.push_str(&format!(
                "{}\t{}\t{}\t{}",
                sanitize(&row.identifier),
                sanitize(&row.entity),
                sanitize(&row.source),
                score
            ));
            for key in &attribute_keys {
                out.push('\t');
                if let Some(value) = row.attributes.get(key) {
                    out.push_str(&sanitize(value));
                }
            }
            out.push('\n');
        }
        out
    }
}

fn sanitize(value: &str) -> String {
    value.replace(['\t', '\n', '\r'], " ")
}

/// Combine per-strategy tables into one deduplicated table.
///
/// `parts` pairs each table with the rank of its strategy in the step's
/// preference order (0 = most preferred). For every (identifier, entity) pair
/// the surviving row is chosen by: highest score, then any score over none,
/// then lowest rank, then attribute order. The choice depends only on the set
/// of rows, never on the order in which tables arrive, and the output is
/// sorted by pair.
pub fn merge_ranked<I>(parts: I) -> ResultTable
where
    I: IntoIterator<Item = (usize, ResultTable)>,
{
    let mut winners: BTreeMap<(String, String), (usize, Association)> = BTreeMap::new();
    let mut supporters: BTreeMap<(String, String), BTreeSet<String>> = BTreeMap::new();

    for (rank, table) in parts {
        for row in table.rows {
            let key = row.dedup_key();
            if !row.source.is_empty() {
                supporters
                    .entry(key.clone())
                    .or_default()
                    .insert(row.source.clone());
            }
            match winners.get(&key) {
                Some((held_rank, held)) if !beats(rank, &row, *held_rank, held) => {}
                _ => {
                    winners.insert(key, (rank, row));
                }
            }
        }
    }

    let rows = winners
        .into_iter()
        .map(|(key, (_, mut row))| {
            if let Some(sources) = supporters.remove(&key) {
                let joined = sources.into_iter().collect::<Vec<_>>().join(",");
                row.attributes.insert(SUPPORTING_SOURCES.to_string(), joined);
            }
            row
        })
        .collect();
    ResultTable { rows }
}

fn beats(rank: usize, row: &Association, held_rank: usize, held: &Association) -> bool {
    compare_rows(rank, row, held_rank, held) == Ordering::Greater
}

fn compare_rows(
    rank: usize,
    row: &Association,
    other_rank: usize,
    other: &Association,
) -> Ordering {
    compare_scores(row.score, other.score)
        .then_with(|| other_rank.cmp(&rank))
        .then_with(|| other.attributes.cmp(&row.attributes))
        .then_with(|| other.identifier.cmp(&row.identifier))
        .then_with(|| other.entity.cmp(&row.entity))
}

fn compare_scores(left: Option<f64>, right: Option<f64>) -> Ordering {
    match (left, right) {
        (Some(l), Some(r)) => l.total_cmp(&r),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => Ordering::Equal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(source: &str, rows: Vec<Association>) -> ResultTable {
        let mut table = ResultTable::from_rows(rows);
        table.tag_source(source);
        table
    }

    #[test]
    fn merge_keeps_highest_score_in_any_order() {
        let high = table("a", vec![Association::new("id1", "TGT1").with_score(0.9)]);
        let low = table("b", vec![Association::new("id1", "TGT1").with_score(0.5)]);

        let forward = merge_ranked(vec![(0, high.clone()), (1, low.clone())]);
        let backward = merge_ranked(vec![(1, low), (0, high)]);

        assert_eq!(forward, backward);
        assert_eq!(forward.len(), 1);
        assert_eq!(forward.rows()[0].score, Some(0.9));
        assert_eq!(forward.rows()[0].source, "a");
        assert_eq!(
            forward.rows()[0].attributes.get(SUPPORTING_SOURCES).map(String::as_str),
            Some("a,b")
        );
    }

    #[test]
    fn merge_tie_prefers_earlier_strategy() {
        let first = table("first", vec![Association::new("id1", "tp53")]);
        let second = table("second", vec![Association::new("id1", "TP53")]);

        let merged = merge_ranked(vec![(1, second.clone()), (0, first.clone())]);
        assert_eq!(merged.rows()[0].source, "first");
        let merged = merge_ranked(vec![(0, first), (1, second)]);
        assert_eq!(merged.rows()[0].source, "first");
    }

    #[test]
    fn scored_row_beats_unscored_row() {
        let unscored = table("a", vec![Association::new("id1", "EGFR")]);
        let scored = table("b", vec![Association::new("id1", "EGFR").with_score(0.1)]);
        let merged = merge_ranked(vec![(0, unscored), (1, scored)]);
        assert_eq!(merged.rows()[0].source, "b");
    }

    #[test]
    fn entities_are_unique_and_sorted() {
        let table = ResultTable::from_rows(vec![
            Association::new("herb", "CCO"),
            Association::new("herb", "C1=CC=CC=C1"),
            Association::new("herb2", "CCO"),
            Association::new("herb2", " "),
        ]);
        assert_eq!(table.entities(), vec!["C1=CC=CC=C1", "CCO"]);
    }

    #[test]
    fn tsv_has_union_of_attribute_columns() {
        let table = ResultTable::from_rows(vec![
            Association::new("a", "X").with_attribute("ob", "35.2"),
            Association::new("b", "Y")
                .with_score(0.4)
                .with_attribute("dl", "0.2"),
        ]);
        let tsv = table.to_tsv();
        let lines = tsv.lines().collect::<Vec<_>>();
        assert_eq!(lines[0], "identifier\tentity\tsource\tscore\tdl\tob");
        assert_eq!(lines[1], "a\tX\t\t\t\t35.2");
        assert_eq!(lines[2], "b\tY\t\t0.4\t0.2\t");
    }
}
