//! Schemas bundled with the orchestrator.
//!
//! These cover the artifact types the default agent workflow requires at
//! its phase boundaries. Hosts can override or extend them by pointing the
//! registry at a schema directory.

pub const PLAN_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "Plan Document",
  "type": "object",
  "required": ["title", "acceptance_criteria", "implementation_steps", "scope"],
  "properties": {
    "title": {"type": "string", "minLength": 10},
    "acceptance_criteria": {
      "type": "array",
      "minItems": 1,
      "items": {
        "type": "object",
        "required": ["criterion", "how_to_verify"],
        "properties": {
          "criterion": {"type": "string", "minLength": 1},
          "how_to_verify": {"type": "string", "minLength": 1}
        }
      }
    },
    "implementation_steps": {
      "type": "array",
      "minItems": 1,
      "items": {"type": "string", "minLength": 1}
    },
    "scope": {
      "type": "object",
      "required": ["in_scope", "out_of_scope"],
      "properties": {
        "in_scope": {"type": "array", "items": {"type": "string"}},
        "out_of_scope": {"type": "array", "items": {"type": "string"}}
      }
    },
    "risks": {"type": "array", "items": {"type": "string"}}
  }
}"#;

pub const SCOPE_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "Scope Definition",
  "type": "object",
  "required": ["in_scope", "out_of_scope"],
  "properties": {
    "in_scope": {"type": "array", "minItems": 1, "items": {"type": "string"}},
    "out_of_scope": {"type": "array", "items": {"type": "string"}}
  }
}"#;

pub const TEST_RESULT_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "Test Run Result",
  "type": "object",
  "required": ["exit_code", "passed", "failed"],
  "properties": {
    "exit_code": {"type": "integer"},
    "passed": {"type": "integer", "minimum": 0},
    "failed": {"type": "integer", "minimum": 0},
    "skipped": {"type": "integer", "minimum": 0},
    "duration_seconds": {"type": "number", "minimum": 0},
    "command": {"type": "string"}
  }
}"#;

pub const REVIEW_SCHEMA: &str = r#"{
  "$schema": "http://json-schema.org/draft-07/schema#",
  "title": "Review Results",
  "type": "object",
  "required": ["blocking_issues"],
  "properties": {
    "blocking_issues": {
      "type": "array",
      "items": {
        "type": "object",
        "required": ["description"],
        "properties": {
          "description": {"type": "string", "minLength": 1},
          "severity": {"type": "string"},
          "file": {"type": "string"}
        }
      }
    },
    "non_blocking_issues": {"type": "array"},
    "reviewer": {"type": "string"}
  }
}"#;

/// Look up a bundled schema by file name.
pub(crate) fn bundled_schema(file_name: &str) -> Option<&'static str> {
    match file_name {
        "plan.json" => Some(PLAN_SCHEMA),
        "scope.json" => Some(SCOPE_SCHEMA),
        "test_result.json" => Some(TEST_RESULT_SCHEMA),
        "review.json" => Some(REVIEW_SCHEMA),
        _ => None,
    }
}
