//! Result aggregation: determinations in, consistent document result out.

use crate::condition::Condition;
use crate::determination::{Determination, clamp_confidence};
use crate::error::ConditionError;
use crate::result::{AnalysisMetrics, AnalysisResult, AnalyzedCondition};

/// Build the document-level result from per-condition determinations.
///
/// Pure: no I/O, no incremental patching. Metrics are computed from `pairs`
/// every time, so a redelivered document produces the same numbers from the
/// same determinations. Pairs are ordered by [`Condition::ordering`].
pub fn finalize(
    document_id: impl Into<String>,
    pairs: Vec<(Condition, Determination)>,
    errors: Vec<ConditionError>,
    high_confidence_cutoff: f64,
) -> AnalysisResult {
    let mut conditions: Vec<AnalyzedCondition> = pairs
        .into_iter()
        .map(|(condition, determination)| AnalyzedCondition {
            condition,
            determination,
        })
        .collect();
    conditions.sort_by_key(|a| a.condition.ordering);

    let metrics = compute_metrics(&conditions, errors.len(), high_confidence_cutoff);

    AnalysisResult {
        document_id: document_id.into(),
        conditions,
        metrics,
        errors,
    }
}

fn compute_metrics(
    conditions: &[AnalyzedCondition],
    error_count: usize,
    cutoff: f64,
) -> AnalysisMetrics {
    let total = conditions.len();
    let relevant = conditions.iter().filter(|a| a.determination.relevant).count();
    let high_confidence = conditions
        .iter()
        .filter(|a| a.determination.confidence >= cutoff)
        .count();

    let confidence_avg = if total == 0 {
        0.0
    } else {
        let sum: f64 = conditions.iter().map(|a| a.determination.confidence).sum();
        clamp_confidence(sum / total as f64)
    };

    AnalysisMetrics {
        total_conditions: total,
        hcc_relevant_count: relevant,
        high_confidence_count: high_confidence,
        confidence_avg,
        error_count,
    }
}
