//! The bundled default agent workflow.
//!
//! Used by `warden serve` when the host does not supply its own document.
//! Seven phases: PLAN → TDD → IMPL → REVIEW → VERIFY → DOCUMENT → LEARN.

use super::WorkflowDef;

pub const DEFAULT_WORKFLOW_YAML: &str = r#"
name: agent_workflow
version: "1.0"

phases:
  - id: PLAN
    name: Planning & Approval
    phase_type: guided
    allowed_tools: [read_files, search_codebase, grep, glob, ask_user_question, web_fetch]
    forbidden_tools: [write_files, edit_files, git_commit, bash]
    intended_tools: [read_files, grep]
    required_artifacts:
      - type: plan_document
        schema: schemas/plan.json
    gates:
      - id: plan_approval
        type: approval
        blockers:
          - check: plan_has_acceptance_criteria
            severity: blocking
            message: Plan must have acceptance criteria
    items:
      - id: review_existing_code
        name: Review existing code before planning
        step_type: documented
        evidence_schema: CodeAnalysisEvidence
        required: false
      - id: define_test_plan
        name: Plan the tests that will prove the work
        step_type: documented
        evidence_schema: TestPlanEvidence
        required: false

  - id: TDD
    name: Write Tests (RED)
    allowed_tools: [read_files, write_files, edit_files, bash, grep, glob]
    forbidden_tools: [git_commit]
    required_artifacts:
      - type: test_run_result
        schema: schemas/test_result.json
    gates:
      - id: tdd_red
        type: validation
        blockers:
          - check: tests_are_failing
            severity: blocking
            message: Tests must be failing (TDD RED phase)
    items:
      - id: consider_edge_cases
        name: Consider edge cases before implementing
        step_type: documented
        evidence_schema: EdgeCaseEvidence
        required: false

  - id: IMPL
    name: Implementation (GREEN)
    allowed_tools: [read_files, write_files, edit_files, bash, grep, glob]
    forbidden_tools: [git_commit]
    required_artifacts:
      - type: test_run_result
        schema: schemas/test_result.json
    gates:
      - id: tests_passing
        type: validation
        blockers:
          - check: all_tests_pass
            severity: blocking
            message: All tests must pass

  - id: REVIEW
    name: Code Review & Quality
    allowed_tools: [read_files, grep, glob, bash]
    forbidden_tools: [write_files, edit_files, git_commit]
    required_artifacts:
      - type: review_results
        schema: schemas/review.json
    gates:
      - id: review_approved
        type: approval
        blockers:
          - check: no_blocking_issues
            severity: blocking
            message: Review found blocking issues

  - id: VERIFY
    name: Final Verification
    allowed_tools: [read_files, bash, grep, glob]
    forbidden_tools: [write_files, edit_files]
    required_artifacts:
      - type: test_run_result
        schema: schemas/test_result.json
    gates:
      - id: final_green
        type: validation
        blockers:
          - check: all_tests_pass
            severity: blocking
            message: All tests must pass before completion

  - id: DOCUMENT
    name: Documentation
    allowed_tools: [read_files, write_files, edit_files, grep, glob]
    forbidden_tools: [bash]

  - id: LEARN
    name: Capture Learnings
    allowed_tools: [read_files]
    forbidden_tools: [write_files, edit_files, bash, git_commit]

transitions:
  - {from: PLAN, to: TDD, gate: plan_approval, requires_token: true}
  - {from: TDD, to: IMPL, gate: tdd_red, requires_token: true}
  - {from: IMPL, to: REVIEW, gate: tests_passing, requires_token: true}
  - {from: REVIEW, to: VERIFY, gate: review_approved, requires_token: true}
  - {from: VERIFY, to: DOCUMENT, gate: final_green, requires_token: true}
  - {from: DOCUMENT, to: LEARN, requires_token: true}

enforcement:
  mode: strict
  phase_tokens:
    enabled: true
    algorithm: HS256
    secret_env_var: ORCHESTRATOR_JWT_SECRET
    expiry_seconds: 7200

settings:
  supervision_mode: supervised
  test_command: cargo test
  phase_critique: true
"#;

/// Parse the bundled default workflow. Covered by tests, so a broken
/// default cannot ship.
pub fn default_workflow() -> WorkflowDef {
    WorkflowDef::from_yaml_str(DEFAULT_WORKFLOW_YAML)
        .expect("bundled default workflow must be valid")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::EnforcementMode;

    #[test]
    fn default_workflow_parses_and_validates() {
        let def = default_workflow();
        assert_eq!(def.name, "agent_workflow");
        assert_eq!(def.phases.len(), 7);
        assert_eq!(def.phases[0].id, "PLAN");
        assert_eq!(def.enforcement.mode, EnforcementMode::Strict);
    }

    #[test]
    fn default_workflow_transitions_cover_all_phase_boundaries() {
        let def = default_workflow();
        for pair in def.phases.windows(2) {
            assert!(
                def.find_transition(&pair[0].id, &pair[1].id).is_some(),
                "missing transition {} -> {}",
                pair[0].id,
                pair[1].id
            );
        }
    }

    #[test]
    fn plan_phase_forbids_mutation_tools() {
        let def = default_workflow();
        let plan = def.get_phase("PLAN").unwrap();
        assert!(!plan.tool_allowed("write_files"));
        assert!(!plan.tool_allowed("bash"));
        assert!(plan.tool_allowed("read_files"));
    }

    #[test]
    fn default_items_are_advisory() {
        let def = default_workflow();
        for phase in &def.phases {
            for item in &phase.items {
                assert!(
                    !item.required,
                    "default workflow item {} must not block transitions",
                    item.id
                );
            }
        }
    }
}
