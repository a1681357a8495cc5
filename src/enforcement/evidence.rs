//! Evidence schemas for documented step types.
//!
//! Evidence proves engagement with a workflow step. Each schema is a typed
//! payload; validation is two-layered: structural (serde deserialization)
//! and depth (the content must be substantive, not a token gesture).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Minimum characters for an approach decision to count as reasoning.
const MIN_APPROACH_CHARS: usize = 20;
/// Minimum characters for a coverage approach statement.
const MIN_COVERAGE_CHARS: usize = 10;

/// Evidence that existing code was reviewed before changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeAnalysisEvidence {
    pub files_reviewed: Vec<String>,
    pub patterns_identified: Vec<String>,
    #[serde(default)]
    pub concerns_raised: Vec<String>,
    pub approach_decision: String,
}

/// Evidence that edge cases were considered during implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeCaseEvidence {
    pub cases_considered: Vec<String>,
    pub how_handled: BTreeMap<String, String>,
    #[serde(default)]
    pub cases_deferred: Vec<String>,
}

/// Evidence that specifications were read and understood.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpecReviewEvidence {
    pub requirements_extracted: Vec<String>,
    #[serde(default)]
    pub ambiguities_found: Vec<String>,
    #[serde(default)]
    pub assumptions_made: Vec<String>,
}

/// Evidence that testing was planned before implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestPlanEvidence {
    pub test_cases_planned: Vec<String>,
    pub coverage_approach: String,
    #[serde(default)]
    pub edge_cases_covered: Vec<String>,
}

pub const EVIDENCE_SCHEMA_NAMES: &[&str] = &[
    "CodeAnalysisEvidence",
    "EdgeCaseEvidence",
    "SpecReviewEvidence",
    "TestPlanEvidence",
];

/// Validate that evidence is structurally valid for `schema_name` and
/// substantive. Returns `(is_valid, error_message)`.
pub fn validate_evidence_depth(schema_name: &str, evidence: &Value) -> (bool, Option<String>) {
    match schema_name {
        "CodeAnalysisEvidence" => {
            let parsed: CodeAnalysisEvidence = match from_value(evidence) {
                Ok(p) => p,
                Err(e) => return (false, Some(e)),
            };
            if parsed.files_reviewed.is_empty() {
                return (false, Some("Must list at least one file reviewed".to_string()));
            }
            if parsed.approach_decision.trim().chars().count() < MIN_APPROACH_CHARS {
                return (
                    false,
                    Some("Approach decision is too short - explain your thinking".to_string()),
                );
            }
            (true, None)
        }
        "EdgeCaseEvidence" => {
            let parsed: EdgeCaseEvidence = match from_value(evidence) {
                Ok(p) => p,
                Err(e) => return (false, Some(e)),
            };
            if parsed.cases_considered.is_empty() {
                return (false, Some("Must consider at least one edge case".to_string()));
            }
            (true, None)
        }
        "SpecReviewEvidence" => {
            let parsed: SpecReviewEvidence = match from_value(evidence) {
                Ok(p) => p,
                Err(e) => return (false, Some(e)),
            };
            if parsed.requirements_extracted.is_empty() {
                return (
                    false,
                    Some("Must extract at least one requirement from spec".to_string()),
                );
            }
            (true, None)
        }
        "TestPlanEvidence" => {
            let parsed: TestPlanEvidence = match from_value(evidence) {
                Ok(p) => p,
                Err(e) => return (false, Some(e)),
            };
            if parsed.test_cases_planned.is_empty() {
                return (false, Some("Must plan at least one test case".to_string()));
            }
            if parsed.coverage_approach.trim().chars().count() < MIN_COVERAGE_CHARS {
                return (
                    false,
                    Some("Coverage approach is too short to be meaningful".to_string()),
                );
            }
            (true, None)
        }
        other => (false, Some(format!("Unknown evidence schema: {other}"))),
    }
}

fn from_value<T: serde::de::DeserializeOwned>(value: &Value) -> Result<T, String> {
    serde_json::from_value(value.clone()).map_err(|e| e.to_string())
}
