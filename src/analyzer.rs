//! Result Analyzer
//!
//! Best-effort arithmetic over returned rows for ratio, breakdown and average
//! questions, for when the generated SQL did not aggregate by itself. The
//! heuristics run in order and the first one that produces a result wins.

use crate::error::{NlqError, Result};
use crate::store::{value_as_text, Row};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};

/// Columns whose values partition rows into named groups.
pub const CATEGORICAL_COLUMNS: &[&str] =
    &["stream", "category", "type", "status", "class_name", "subject_name"];

/// Numeric fields considered for averages, in priority order.
pub const AVERAGE_FIELDS: &[&str] =
    &["marks_obtained", "max_marks", "amount", "percentage", "avg_percentage"];

/// Identifier columns used to count each record once per group.
const ID_COLUMNS: &[&str] = &["student_id", "id", "admission_no", "record_id"];

/// Exact names of pre-aggregated count columns.
const COUNT_COLUMNS: &[&str] = &["count", "total", "cnt", "num_students", "student_count"];

lazy_static! {
    static ref RATIO_RE: Regex =
        Regex::new(r"(?i)\bratio\b|\bvs\.?\b|\bversus\b|\bcompared?\s+(to|with)\b").unwrap();
    static ref PERCENT_RE: Regex = Regex::new(
        r"(?i)%|\bpercent(age)?s?\b|\bbreak\s*down\b|\bdistribution\b|\bproportions?\b|\bshare\b|\bsplit\b"
    )
    .unwrap();
    static ref AVERAGE_RE: Regex = Regex::new(r"(?i)\baverage\b|\bavg\b|\bmean\b").unwrap();
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct AnalysisResult {
    pub narrative: Option<String>,
    pub structured_insight: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct ResultAnalyzer;

/// Per-group counts, largest first, ties by name.
type GroupCounts = Vec<(String, u64)>;

impl ResultAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// `Ok(None)` when no heuristic applies. Errors are for malformed rows and
    /// are meant to be logged and dropped by the caller.
    pub fn analyze(&self, question: &str, rows: &[Row]) -> Result<Option<AnalysisResult>> {
        if rows.is_empty() {
            return Ok(None);
        }
        if RATIO_RE.is_match(question) {
            if let Some(result) = ratio(rows)? {
                return Ok(Some(result));
            }
        }
        if PERCENT_RE.is_match(question) {
            if let Some(result) = breakdown(rows)? {
                return Ok(Some(result));
            }
        }
        if AVERAGE_RE.is_match(question) {
            if let Some(result) = average(rows) {
                return Ok(Some(result));
            }
        }
        Ok(None)
    }
}

/// Summary used when there is no analysis narrative to speak.
pub fn fallback_summary(row_count: usize, analysis: Option<&AnalysisResult>) -> String {
    let base = match row_count {
        0 => "No records found.".to_string(),
        1 => "1 record found.".to_string(),
        n => format!("{} records found.", n),
    };
    match analysis.and_then(|a| a.narrative.as_deref()) {
        Some(narrative) => format!("{} {}", base, narrative),
        None => base,
    }
}

fn ratio(rows: &[Row]) -> Result<Option<AnalysisResult>> {
    let Some(column) = categorical_column(rows) else {
        return Ok(None);
    };
    let groups = group_counts(rows, column)?;
    if groups.len() < 2 {
        return Ok(None);
    }
    let (first, c1) = &groups[0];
    let (second, c2) = &groups[1];
    if *c2 == 0 {
        return Ok(None);
    }

    let ratio = format!("{:.2}:1", *c1 as f64 / *c2 as f64);
    let pair_total = (c1 + c2) as f64;
    let p1 = round1(*c1 as f64 * 100.0 / pair_total);
    let p2 = round1(*c2 as f64 * 100.0 / pair_total);

    let counts: serde_json::Map<String, Value> =
        groups.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
    let mut percentages = serde_json::Map::new();
    percentages.insert(first.clone(), json!(p1));
    percentages.insert(second.clone(), json!(p2));

    let narrative = format!(
        "The ratio of {} to {} is {} ({}: {}, {:.1}%; {}: {}, {:.1}%).",
        first, second, ratio, first, c1, p1, second, c2, p2
    );

    Ok(Some(AnalysisResult {
        narrative: Some(narrative),
        structured_insight: Some(json!({
            "type": "ratio",
            "column": column,
            "groups": counts,
            "ratio": ratio,
            "percentages": percentages,
        })),
    }))
}

fn breakdown(rows: &[Row]) -> Result<Option<AnalysisResult>> {
    let Some(column) = categorical_column(rows) else {
        return Ok(None);
    };
    let groups = group_counts(rows, column)?;
    let total: u64 = groups.iter().map(|(_, c)| c).sum();
    if total == 0 {
        return Ok(None);
    }

    let mut counts = serde_json::Map::new();
    let mut percentages = serde_json::Map::new();
    let mut parts = Vec::new();
    for (name, count) in &groups {
        let pct = round1(*count as f64 * 100.0 / total as f64);
        counts.insert(name.clone(), json!(count));
        percentages.insert(name.clone(), json!(pct));
        parts.push(format!("{} {:.1}% ({})", name, pct, count));
    }

    Ok(Some(AnalysisResult {
        narrative: Some(format!("Breakdown by {}: {}.", column, parts.join(", "))),
        structured_insight: Some(json!({
            "type": "percentage",
            "column": column,
            "total": total,
            "groups": counts,
            "percentages": percentages,
        })),
    }))
}

fn average(rows: &[Row]) -> Option<AnalysisResult> {
    AVERAGE_FIELDS.iter().find_map(|field| {
        let values: Vec<f64> = rows
            .iter()
            .filter_map(|row| row.get(*field).and_then(as_number))
            .filter(|v| *v > 0.0)
            .collect();
        if values.is_empty() {
            return None;
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let formatted = format!("{:.2}", mean);
        Some(AnalysisResult {
            narrative: Some(format!(
                "The average {} is {} across {} records.",
                field.replace('_', " "),
                formatted,
                values.len()
            )),
            structured_insight: Some(json!({
                "type": "average",
                "field": field,
                "average": formatted,
                "samples": values.len(),
            })),
        })
    })
}

/// First candidate column holding text values in any row.
fn categorical_column(rows: &[Row]) -> Option<&'static str> {
    CATEGORICAL_COLUMNS.iter().copied().find(|column| {
        rows.iter()
            .any(|row| matches!(row.get(*column), Some(Value::String(_))))
    })
}

fn count_column(row: &Row) -> Option<&str> {
    row.keys()
        .map(String::as_str)
        .find(|key| {
            let key_lower = key.to_lowercase();
            COUNT_COLUMNS.contains(&key_lower.as_str())
                || key_lower.ends_with("_count")
                || key_lower.starts_with("count_")
        })
}

fn id_column(row: &Row) -> Option<&'static str> {
    ID_COLUMNS.iter().copied().find(|c| row.contains_key(*c))
}

#[derive(PartialEq, Eq, Hash)]
enum RecordKey {
    Id(String),
    Row(usize),
}

fn group_counts(rows: &[Row], column: &str) -> Result<GroupCounts> {
    let mut counts: HashMap<String, u64> = HashMap::new();

    if let Some(count_key) = rows.first().and_then(count_column) {
        // Already aggregated: one row per group.
        for row in rows {
            let Some(group) = row.get(column).and_then(value_as_text) else {
                continue;
            };
            let raw = row.get(count_key).unwrap_or(&Value::Null);
            let count = as_number(raw)
                .filter(|n| *n >= 0.0 && n.fract() == 0.0)
                .ok_or_else(|| {
                    NlqError::Analysis(format!("column {} has a non-count value {}", count_key, raw))
                })?;
            *counts.entry(group).or_default() += count as u64;
        }
    } else if let Some(id_key) = rows.iter().find_map(id_column) {
        // Rows without an id are distinct records; only ids dedup.
        let mut seen: HashMap<String, HashSet<RecordKey>> = HashMap::new();
        for (index, row) in rows.iter().enumerate() {
            let Some(group) = row.get(column).and_then(value_as_text) else {
                continue;
            };
            let key = match row.get(id_key).and_then(value_as_text) {
                Some(id) => RecordKey::Id(id),
                None => RecordKey::Row(index),
            };
            seen.entry(group).or_default().insert(key);
        }
        counts = seen
            .into_iter()
            .map(|(group, ids)| (group, ids.len() as u64))
            .collect();
    } else {
        for row in rows {
            if let Some(group) = row.get(column).and_then(value_as_text) {
                *counts.entry(group).or_default() += 1;
            }
        }
    }

    Ok(counts
        .into_iter()
        .sorted_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)))
        .collect())
}

fn as_number(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|n| n.is_finite())
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(values: Value) -> Vec<Row> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    #[test]
    fn rows_without_an_id_are_counted_individually() {
        let data = rows(json!([
            {"stream": "Science"},
            {"student_id": "s1", "stream": "Science"},
            {"stream": "Science"},
            {"stream": "Science"},
            {"student_id": "a1", "stream": "Arts"},
            {"student_id": "a2", "stream": "Arts"},
            {"student_id": "a2", "stream": "Arts"},
        ]));
        let result = ResultAnalyzer::new()
            .analyze("What is the ratio of science to arts students?", &data)
            .unwrap()
            .unwrap();
        let insight = result.structured_insight.unwrap();
        assert_eq!(insight["groups"]["Science"], 4);
        assert_eq!(insight["groups"]["Arts"], 2);
        assert_eq!(insight["ratio"], "2.00:1");
    }

    #[test]
    fn ratio_from_raw_rows() {
        let data = rows(json!([{"stream": "Science"}, {"stream": "Science"}, {"stream": "Arts"}]));
        let result = ResultAnalyzer::new()
            .analyze("What is the ratio of science to arts students?", &data)
            .unwrap()
            .unwrap();
        let insight = result.structured_insight.unwrap();
        assert_eq!(insight["type"], "ratio");
        assert_eq!(insight["groups"]["Science"], 2);
        assert_eq!(insight["groups"]["Arts"], 1);
        assert_eq!(insight["ratio"], "2.00:1");
        assert_eq!(insight["percentages"]["Science"], 66.7);
        assert_eq!(insight["percentages"]["Arts"], 33.3);
        assert!(result.narrative.unwrap().contains("2.00:1"));
    }

    #[test]
    fn ratio_dedups_by_student_id() {
        let data = rows(json!([
            {"student_id": 1, "stream": "Science", "subject_name": "Physics"},
            {"student_id": 1, "stream": "Science", "subject_name": "Chemistry"},
            {"student_id": 2, "stream": "Science", "subject_name": "Physics"},
            {"student_id": 3, "stream": "Commerce", "subject_name": "Accounts"},
        ]));
        let insight = ResultAnalyzer::new()
            .analyze("science vs commerce", &data)
            .unwrap()
            .unwrap()
            .structured_insight
            .unwrap();
        assert_eq!(insight["groups"]["Science"], 2);
        assert_eq!(insight["groups"]["Commerce"], 1);
        assert_eq!(insight["ratio"], "2.00:1");
    }

    #[test]
    fn ratio_uses_existing_counts() {
        let data = rows(json!([
            {"stream": "Arts", "count": 40},
            {"stream": "Science", "count": "120"},
        ]));
        let insight = ResultAnalyzer::new()
            .analyze("ratio of science to arts", &data)
            .unwrap()
            .unwrap()
            .structured_insight
            .unwrap();
        assert_eq!(insight["ratio"], "3.00:1");
        assert_eq!(insight["percentages"]["Science"], 75.0);
        assert_eq!(insight["percentages"]["Arts"], 25.0);
    }

    #[test]
    fn malformed_counts_are_an_analysis_error() {
        let data = rows(json!([{"stream": "Arts", "count": "lots"}, {"stream": "Science", "count": 3}]));
        let err = ResultAnalyzer::new().analyze("ratio", &data).unwrap_err();
        assert!(matches!(err, NlqError::Analysis(_)));
    }

    #[test]
    fn percentage_breakdown_over_all_values() {
        let data = rows(json!([
            {"status": "paid"}, {"status": "paid"}, {"status": "pending"}, {"status": "partial"}
        ]));
        let result = ResultAnalyzer::new()
            .analyze("percentage of fees by status", &data)
            .unwrap()
            .unwrap();
        let insight = result.structured_insight.unwrap();
        assert_eq!(insight["type"], "percentage");
        assert_eq!(insight["total"], 4);
        assert_eq!(insight["percentages"]["paid"], 50.0);
        assert_eq!(insight["percentages"]["pending"], 25.0);
        assert!(result.narrative.unwrap().starts_with("Breakdown by status: paid 50.0% (2)"));
    }

    #[test]
    fn average_skips_non_positive_values() {
        let data = rows(json!([
            {"marks_obtained": 40}, {"marks_obtained": 0}, {"marks_obtained": 80}
        ]));
        let result = ResultAnalyzer::new()
            .analyze("average marks in maths", &data)
            .unwrap()
            .unwrap();
        let insight = result.structured_insight.unwrap();
        assert_eq!(insight["field"], "marks_obtained");
        assert_eq!(insight["average"], "60.00");
        assert_eq!(insight["samples"], 2);
    }

    #[test]
    fn average_takes_first_candidate_field_with_values() {
        let data = rows(json!([
            {"amount": "1500.50", "percentage": 10},
            {"amount": "499.50", "percentage": 20}
        ]));
        let insight = ResultAnalyzer::new()
            .analyze("mean fee amount", &data)
            .unwrap()
            .unwrap()
            .structured_insight
            .unwrap();
        assert_eq!(insight["field"], "amount");
        assert_eq!(insight["average"], "1000.00");
    }

    #[test]
    fn unmatched_questions_yield_nothing() {
        let data = rows(json!([{"first_name": "Asha", "stream": "Arts"}]));
        assert_eq!(ResultAnalyzer::new().analyze("list students", &data).unwrap(), None);
        assert_eq!(ResultAnalyzer::new().analyze("ratio of boys", &[]).unwrap(), None);
        // one group only: a ratio is not defined
        assert_eq!(ResultAnalyzer::new().analyze("ratio of arts", &data).unwrap(), None);
    }

    #[test]
    fn fallback_summary_counts_records() {
        assert_eq!(fallback_summary(0, None), "No records found.");
        assert_eq!(fallback_summary(1, None), "1 record found.");
        let analysis = AnalysisResult {
            narrative: Some("The average amount is 10.00 across 3 records.".to_string()),
            structured_insight: None,
        };
        assert_eq!(
            fallback_summary(3, Some(&analysis)),
            "3 records found. The average amount is 10.00 across 3 records."
        );
    }
}
