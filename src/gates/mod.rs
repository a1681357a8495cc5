//! Gate evaluation over submitted artifacts.
//!
//! A gate is a named, ordered list of blocker checks guarding a phase
//! transition. The checker set is finite and closed; unknown checker names
//! are skipped so older orchestrators tolerate newer workflow documents. A
//! failing check with severity `blocking` contributes a message to the
//! returned blocker list, and the gate passes iff that list is empty.

use serde_json::{Map, Value};

use crate::workflow::{GateDef, WorkflowDef};

type CheckOutcome = (bool, Option<String>);

/// Evaluates gates against the workflow definition's gate table.
pub struct GateEvaluator<'a> {
    def: &'a WorkflowDef,
}

impl<'a> GateEvaluator<'a> {
    pub fn new(def: &'a WorkflowDef) -> Self {
        Self { def }
    }

    /// Run every blocker of `gate_id` over the submitted artifacts.
    /// Returns `(passes, blockers)`.
    pub fn evaluate(&self, gate_id: &str, artifacts: &Map<String, Value>) -> (bool, Vec<String>) {
        let Some(gate) = self.def.get_gate(gate_id) else {
            return (false, vec![format!("Gate not found: {gate_id}")]);
        };
        evaluate_gate(gate, artifacts)
    }
}

/// Evaluate a gate definition directly (used by the evaluator and tests).
pub fn evaluate_gate(gate: &GateDef, artifacts: &Map<String, Value>) -> (bool, Vec<String>) {
    let mut blockers = Vec::new();

    for blocker in &gate.blockers {
        let Some(checker) = resolve_checker(&blocker.check) else {
            // Unknown check: forward-compatible skip.
            tracing::debug!(check = %blocker.check, gate = %gate.id, "skipping unknown gate check");
            continue;
        };

        let (passes, detail) = checker(artifacts);
        if !passes && blocker.severity == "blocking" {
            let message = blocker
                .message
                .clone()
                .unwrap_or_else(|| format!("Gate check failed: {}", blocker.check));
            blockers.push(match detail {
                Some(detail) => format!("{message} - {detail}"),
                None => message,
            });
        }
    }

    (blockers.is_empty(), blockers)
}

fn resolve_checker(name: &str) -> Option<fn(&Map<String, Value>) -> CheckOutcome> {
    match name {
        "plan_has_acceptance_criteria" => Some(check_plan_has_acceptance_criteria),
        "tests_are_failing" => Some(check_tests_are_failing),
        "all_tests_pass" => Some(check_all_tests_pass),
        "no_blocking_issues" => Some(check_no_blocking_issues),
        _ => None,
    }
}

fn check_plan_has_acceptance_criteria(artifacts: &Map<String, Value>) -> CheckOutcome {
    let Some(plan) = artifacts.get("plan_document") else {
        return (false, Some("Missing plan_document artifact".to_string()));
    };

    let criteria = plan
        .get("acceptance_criteria")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if criteria.is_empty() {
        return (
            false,
            Some("Plan must include at least one acceptance criterion".to_string()),
        );
    }

    for (i, criterion) in criteria.iter().enumerate() {
        if non_empty_str(criterion.get("criterion")).is_none() {
            return (
                false,
                Some(format!("Acceptance criterion {i} missing 'criterion' field")),
            );
        }
        if non_empty_str(criterion.get("how_to_verify")).is_none() {
            return (
                false,
                Some(format!("Acceptance criterion {i} missing 'how_to_verify' field")),
            );
        }
    }

    (true, None)
}

fn check_tests_are_failing(artifacts: &Map<String, Value>) -> CheckOutcome {
    let Some(result) = artifacts.get("test_run_result") else {
        return (false, Some("Missing test_run_result artifact".to_string()));
    };

    if result.get("exit_code").and_then(Value::as_i64) == Some(0) {
        return (
            false,
            Some(
                "Tests must be failing for TDD RED phase (exit_code should be non-zero)"
                    .to_string(),
            ),
        );
    }

    let failed = result.get("failed").and_then(Value::as_i64).unwrap_or(0);
    if failed == 0 {
        return (
            false,
            Some("No failing tests detected - TDD requires failing tests initially".to_string()),
        );
    }

    (true, None)
}

fn check_all_tests_pass(artifacts: &Map<String, Value>) -> CheckOutcome {
    let Some(result) = artifacts.get("test_run_result") else {
        return (false, Some("Missing test_run_result artifact".to_string()));
    };

    let failed = result.get("failed").and_then(Value::as_i64).unwrap_or(0);
    if failed > 0 {
        return (
            false,
            Some(format!("{failed} test(s) failed - all tests must pass")),
        );
    }

    let exit_code = result.get("exit_code").and_then(Value::as_i64);
    if exit_code != Some(0) {
        return (
            false,
            Some(format!(
                "Tests failed with exit code {}",
                exit_code.map_or("unknown".to_string(), |c| c.to_string())
            )),
        );
    }

    let passed = result.get("passed").and_then(Value::as_i64).unwrap_or(0);
    if passed == 0 {
        return (
            false,
            Some("No tests passed - must have at least one passing test".to_string()),
        );
    }

    (true, None)
}

fn check_no_blocking_issues(artifacts: &Map<String, Value>) -> CheckOutcome {
    let Some(review) = artifacts.get("review_results") else {
        return (false, Some("Missing review_results artifact".to_string()));
    };

    let blocking = review
        .get("blocking_issues")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if !blocking.is_empty() {
        let descriptions: Vec<String> = blocking
            .iter()
            .map(|issue| {
                issue
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or("Unknown issue")
                    .to_string()
            })
            .collect();
        return (
            false,
            Some(format!(
                "Found {} blocking issue(s): {}",
                blocking.len(),
                descriptions.join("; ")
            )),
        );
    }

    (true, None)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}
