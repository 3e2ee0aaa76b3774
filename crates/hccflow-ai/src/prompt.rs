//! Prompt templates for the HCC relevance inference call.

use std::fmt::Write;

use crate::inference::EscalatedCondition;
use crate::reference::ReferenceEntry;

// ── Prompt templates ──

pub const SYSTEM_PROMPT: &str = "\
You are a medical coding expert specialising in HCC (Hierarchical Condition Category) risk adjustment.

You will receive medical conditions extracted from a clinical note, each with its ICD-10 code, \
clinical detail, and the finding of a reference-table lookup, plus a sample of HCC-relevant \
ICD-10 codes.

For every condition decide whether it is HCC-relevant. For relevant conditions give the matching \
HCC code and category. Give a confidence between 0.0 and 1.0 for every determination.

The reference sample is not exhaustive. Use your knowledge for codes not in it, considering \
severity, chronicity, and impact on risk adjustment. If you are uncertain, say so in the reasoning.

Respond ONLY with a JSON object. No markdown fences, no explanation, just raw JSON:
{
  \"conditions\": [
    {
      \"id\": \"the condition id, copied exactly\",
      \"hcc_relevant\": true or false,
      \"hcc_code\": \"HCC code\" or null,
      \"hcc_category\": \"HCC category\" or null,
      \"confidence\": 0.0 to 1.0,
      \"reasoning\": \"brief explanation\"
    }
  ]
}

Return exactly one entry per condition id you were given.";

/// User prompt for one batch of escalated conditions.
pub fn build_user_prompt(batch: &[EscalatedCondition], reference: &[ReferenceEntry]) -> String {
    let mut out = String::from("Conditions:\n");

    for item in batch {
        let c = &item.condition;
        let d = &item.deterministic;
        let _ = writeln!(out, "- id: {}", c.id);
        let _ = writeln!(out, "  name: {}", c.name);
        let _ = writeln!(out, "  icd_code: {}", c.icd_code.as_deref().unwrap_or("(none)"));
        if let Some(desc) = &c.icd_description {
            let _ = writeln!(out, "  icd_description: {desc}");
        }
        if let Some(details) = &c.details {
            let _ = writeln!(out, "  details: {details}");
        }
        let _ = writeln!(
            out,
            "  reference lookup: {} (relevant={}, confidence={:.2})",
            d.reasoning, d.relevant, d.confidence
        );
    }

    out.push_str("\nSample of HCC-relevant ICD-10 codes (code | description | category):\n");
    for entry in reference {
        let _ = writeln!(
            out,
            "{} | {} | {}",
            entry.display_code,
            entry.description,
            entry.category_label().as_deref().unwrap_or("-")
        );
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use hccflow_core::{Condition, Determination, Method};
    use serde_json::Map;

    fn escalated(id: &str, code: Option<&str>, details: Option<&str>) -> EscalatedCondition {
        EscalatedCondition {
            condition: Condition {
                id: id.into(),
                name: "Essential hypertension".into(),
                icd_code: code.map(String::from),
                icd_description: None,
                details: details.map(String::from),
                ordering: 0,
                metadata: Map::new(),
            },
            deterministic: Determination::new(
                false,
                None,
                None,
                0.8,
                "no match in reference index",
                Method::Deterministic,
            ),
        }
    }

    #[test]
    fn user_prompt_lists_conditions_and_reference() {
        let reference = vec![ReferenceEntry {
            code: "E1165".into(),
            display_code: "E11.65".into(),
            description: "Type 2 diabetes mellitus with hyperglycemia".into(),
            categories: vec!["Diabetes".into()],
        }];
        let prompt = build_user_prompt(
            &[
                escalated("cond-1", Some("I10"), Some("BP 150/95")),
                escalated("cond-2", None, None),
            ],
            &reference,
        );

        assert!(prompt.contains("- id: cond-1"));
        assert!(prompt.contains("icd_code: I10"));
        assert!(prompt.contains("details: BP 150/95"));
        assert!(prompt.contains("icd_code: (none)"));
        assert!(prompt.contains("relevant=false, confidence=0.80"));
        assert!(prompt.contains("E11.65 | Type 2 diabetes mellitus with hyperglycemia | Diabetes"));
    }

    #[test]
    fn system_prompt_names_output_schema() {
        for key in ["hcc_relevant", "hcc_code", "hcc_category", "confidence", "reasoning"] {
            assert!(SYSTEM_PROMPT.contains(key));
        }
    }
}
