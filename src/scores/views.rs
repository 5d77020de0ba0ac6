//! The four aggregation views as pure functions over score records.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{AggregateRow, ScoreKey, ScoreStats, FOLDED_REPEAT, OBJECTIVE, OVERALL, SUBJECTIVE};
use crate::storage::evaluations::ScoreRecord;

/// Rows accumulated during one recompute. A later row with the same key
/// replaces the earlier one.
#[derive(Debug, Default)]
pub(crate) struct ViewRows {
    rows: BTreeMap<ScoreKey, AggregateRow>,
}

impl ViewRows {
    pub fn extend(&mut self, rows: impl IntoIterator<Item = AggregateRow>) {
        for row in rows {
            self.rows.insert(row.key.clone(), row);
        }
    }

    pub fn into_rows(self) -> Vec<AggregateRow> {
        self.rows.into_values().collect()
    }
}

/// Score types that get their own per-dimension rows.
pub(crate) fn is_dimension(score_type: &str) -> bool {
    !matches!(score_type, OVERALL | OBJECTIVE | SUBJECTIVE)
}

/// One row per repeat index present plus one folded row pooling every record.
pub(crate) fn repeat_rows<'a>(
    evaluator_id: Option<i64>,
    score_type: &str,
    records: impl IntoIterator<Item = &'a ScoreRecord>,
) -> Vec<AggregateRow> {
    let mut per_repeat: BTreeMap<i32, ScoreStats> = BTreeMap::new();
    let mut folded = ScoreStats::default();
    for record in records {
        per_repeat.entry(record.repeat_index).or_default().push(record.normalized_score);
        folded.push(record.normalized_score);
    }

    let mut rows: Vec<AggregateRow> = per_repeat
        .iter()
        .filter_map(|(repeat, stats)| {
            AggregateRow::from_stats(ScoreKey::new(evaluator_id, score_type, *repeat), stats)
        })
        .collect();
    rows.extend(AggregateRow::from_stats(
        ScoreKey::new(evaluator_id, score_type, FOLDED_REPEAT),
        &folded,
    ));
    rows
}

/// Every record of the model: per score type, then pooled as OVERALL.
/// Records without a score type count as OVERALL.
pub(crate) fn overall_view(records: &[ScoreRecord]) -> Vec<AggregateRow> {
    let mut by_type: BTreeMap<&str, Vec<&ScoreRecord>> = BTreeMap::new();
    for record in records {
        let score_type = record.score_type.as_deref().unwrap_or(OVERALL);
        by_type.entry(score_type).or_default().push(record);
    }

    let mut rows = Vec::new();
    for (score_type, group) in by_type {
        rows.extend(repeat_rows(None, score_type, group));
    }
    rows.extend(repeat_rows(None, OVERALL, records));
    rows
}

/// Records of single and multiple choice answers, pooled as OBJECTIVE.
pub(crate) fn objective_view(records: &[ScoreRecord]) -> Vec<AggregateRow> {
    repeat_rows(None, OBJECTIVE, records)
}

/// Records of subjective answers. Only evaluators that scored every one of
/// the `answer_count` answers contribute; the cross-evaluator row is the
/// mean of their folded averages.
pub(crate) fn subjective_view(answer_count: usize, records: &[ScoreRecord]) -> Vec<AggregateRow> {
    if answer_count == 0 {
        return Vec::new();
    }

    let mut by_evaluator: BTreeMap<i64, Vec<&ScoreRecord>> = BTreeMap::new();
    for record in records {
        if let Some(evaluator_id) = record.evaluator_id {
            by_evaluator.entry(evaluator_id).or_default().push(record);
        }
    }

    let mut rows = Vec::new();
    let mut evaluator_means = ScoreStats::default();
    for (evaluator_id, group) in by_evaluator {
        let scored: BTreeSet<i64> = group.iter().map(|r| r.answer_id).collect();
        if scored.len() != answer_count {
            debug!(
                evaluator_id,
                scored = scored.len(),
                answer_count,
                "evaluator incomplete, skipped"
            );
            continue;
        }

        let evaluator_rows = repeat_rows(Some(evaluator_id), SUBJECTIVE, group);
        if let Some(folded) = evaluator_rows.iter().find(|r| r.key.is_folded()) {
            evaluator_means.push(folded.average_score);
        }
        rows.extend(evaluator_rows);
    }

    if let Some(average_score) = evaluator_means.mean() {
        rows.push(AggregateRow {
            key: ScoreKey::new(None, SUBJECTIVE, FOLDED_REPEAT),
            average_score,
            total_answers: answer_count as i64,
            scored_answers: answer_count as i64,
            max_score: None,
            min_score: None,
        });
    }
    rows
}

/// Records of one dimension score type.
pub(crate) fn dimension_view(score_type: &str, records: &[ScoreRecord]) -> Vec<AggregateRow> {
    repeat_rows(None, score_type, records)
}
