//! Terminal rendering for analysis results, reference summaries and batch
//! reports.

use hccflow_ai::{ReferenceEntry, ReferenceSummary};
use hccflow_core::ResultArtifact;
use hccflow_core::result::ArtifactCondition;
use hccflow_runner::{BatchReport, FileStatus};

const MAX_SAMPLE_ROWS: usize = 10;
const REASONING_WIDTH: usize = 72;

// ── Public API ──

/// Print an analysis result as a vertical card: metrics, then one block per
/// condition, then document errors.
pub fn print_result_card(result: &ResultArtifact) {
    let m = &result.metadata.metrics;
    println!("=== {} ===", result.document_id);
    println!();

    println!("Metrics");
    field("total_conditions", m.total_conditions);
    field("hcc_relevant_count", m.hcc_relevant_count);
    field("high_confidence_count", m.high_confidence_count);
    field("confidence_avg", format!("{:.3}", m.confidence_avg));
    field("error_count", m.error_count);
    println!();

    if !result.conditions.is_empty() {
        println!("Conditions ({}):", result.conditions.len());
        for c in &result.conditions {
            print_condition(c);
        }
        println!();
    }

    if !result.errors.is_empty() {
        println!("Errors");
        for e in &result.errors {
            println!("  - {e}");
        }
        println!();
    }
}

pub fn print_reference_summary(summary: &ReferenceSummary, sample: &[ReferenceEntry]) {
    println!("Reference");
    field("entries", summary.entries);
    field("distinct_categories", summary.distinct_categories);
    field("skipped_rows", summary.skipped_rows);
    field("duplicate_rows", summary.duplicate_rows);
    println!();

    if sample.is_empty() {
        return;
    }
    let show = sample.len().min(MAX_SAMPLE_ROWS);
    println!("Sample ({show} of {}):", summary.entries);
    for e in &sample[..show] {
        println!(
            "    {:<10} {:<48} {}",
            e.display_code,
            truncate(&e.description, 48),
            e.category_label().unwrap_or_else(|| "-".into())
        );
    }
    println!();
}

pub fn print_batch_report(report: &BatchReport) {
    for f in &report.files {
        println!(
            "  {:<8} {:<32} {}",
            f.status.as_str(),
            f.file,
            f.output_file.as_deref().unwrap_or("-")
        );
        println!("           {}", f.message);
    }
    println!();
    println!(
        "{} files: {} success, {} warning, {} error",
        report.files.len(),
        report.count(FileStatus::Success),
        report.count(FileStatus::Warning),
        report.count(FileStatus::Error)
    );
}

// ── Rendering ──

fn field(name: &str, value: impl std::fmt::Display) {
    println!("  {name:<26} {value}");
}

fn print_condition(c: &ArtifactCondition) {
    println!("  {}", condition_line(c));
    if let Some(category) = &c.hcc_category {
        println!("      category: {category}");
    }
    if let Some(source) = c.metadata.get("analysis_source").and_then(|v| v.as_str()) {
        println!("      source: {source}");
    }
    if !c.reasoning.is_empty() {
        println!("      {}", truncate(&c.reasoning, REASONING_WIDTH));
    }
    if let Some(err) = c.metadata.get("analysis_error").and_then(|v| v.as_str()) {
        println!("      error: {err}");
    }
}

fn condition_line(c: &ArtifactCondition) -> String {
    let mark = if c.hcc_relevant { "HCC" } else { "---" };
    format!(
        "{mark} {:<8} {:<10} {:.2}  {}",
        c.id,
        c.icd_code.as_deref().unwrap_or("-"),
        c.confidence,
        c.name
    )
}

/// Shorten to `max` characters, ending in `...` when cut.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let kept: String = s.chars().take(max.saturating_sub(3)).collect();
    format!("{kept}...")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn condition(relevant: bool) -> ArtifactCondition {
        ArtifactCondition {
            id: "c1".into(),
            name: "Type 2 diabetes".into(),
            icd_code: Some("E11.65".into()),
            icd_description: None,
            details: None,
            hcc_relevant: relevant,
            hcc_code: Some("E1165".into()),
            hcc_category: Some("Diabetes".into()),
            confidence: 1.0,
            reasoning: "direct code match".into(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn condition_lines() {
        assert_eq!(
            condition_line(&condition(true)),
            "HCC c1       E11.65     1.00  Type 2 diabetes"
        );
        assert!(condition_line(&condition(false)).starts_with("---"));
    }

    #[test]
    fn truncates_on_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("abcdefghij", 8), "abcde...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
