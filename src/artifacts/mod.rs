//! Artifact schema registry.
//!
//! Resolves a schema reference (a short path such as `schemas/plan.json`)
//! to a compiled JSON-schema validator, and validates artifact payloads
//! submitted at phase boundaries. Errors carry a dotted field path so an
//! agent can locate the offending field without parsing the schema itself.
//!
//! Four schemas ship with the orchestrator (plan, scope, test result,
//! review); additional schemas are loaded from a directory supplied by the
//! host. An unknown schema reference is a hard error, never a silent skip.

mod builtin;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use jsonschema::JSONSchema;
use serde_json::Value;

use crate::workflow::ArtifactRequirement;

pub use builtin::{PLAN_SCHEMA, REVIEW_SCHEMA, SCOPE_SCHEMA, TEST_RESULT_SCHEMA};

/// Resolves schema references to compiled validators, caching compilations.
#[derive(Debug)]
pub struct SchemaRegistry {
    /// Optional directory searched for schema files not bundled in.
    schema_dir: Option<PathBuf>,
    compiled: Mutex<HashMap<String, Arc<JSONSchema>>>,
}

impl SchemaRegistry {
    pub fn new(schema_dir: Option<PathBuf>) -> Self {
        Self {
            schema_dir,
            compiled: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a schema reference to a compiled validator.
    ///
    /// Lookup order: cache, bundled schemas (by file name), then
    /// `schema_dir`. Unknown references are an error.
    pub fn resolve(&self, reference: &str) -> Result<Arc<JSONSchema>, String> {
        if let Some(found) = self
            .compiled
            .lock()
            .expect("schema cache lock poisoned")
            .get(reference)
        {
            return Ok(Arc::clone(found));
        }

        let raw = self.load_raw(reference)?;
        let schema = JSONSchema::compile(&raw)
            .map_err(|e| format!("Failed to compile schema {reference}: {e}"))?;
        let schema = Arc::new(schema);
        self.compiled
            .lock()
            .expect("schema cache lock poisoned")
            .insert(reference.to_string(), Arc::clone(&schema));
        Ok(schema)
    }

    fn load_raw(&self, reference: &str) -> Result<Value, String> {
        let file_name = reference.rsplit('/').next().unwrap_or(reference);
        if let Some(bundled) = builtin::bundled_schema(file_name) {
            return serde_json::from_str(bundled)
                .map_err(|e| format!("Bundled schema {reference} is invalid: {e}"));
        }

        if let Some(dir) = &self.schema_dir {
            let candidate = dir.join(file_name);
            if candidate.exists() {
                let raw = std::fs::read_to_string(&candidate)
                    .map_err(|e| format!("Failed to read schema {reference}: {e}"))?;
                return serde_json::from_str(&raw)
                    .map_err(|e| format!("Failed to parse schema {reference}: {e}"));
            }
        }

        Err(format!("Schema not found: {reference}"))
    }

    /// Validate a set of submitted artifacts against a phase's requirements.
    ///
    /// Missing required artifact types are reported as a single distinct
    /// error before any schema-level validation runs. Returns
    /// `(valid, errors)`.
    pub fn validate_artifacts(
        &self,
        artifacts: &serde_json::Map<String, Value>,
        required: &[ArtifactRequirement],
    ) -> (bool, Vec<String>) {
        let mut errors = Vec::new();

        let mut missing: Vec<&str> = required
            .iter()
            .map(|r| r.type_name.as_str())
            .filter(|t| !artifacts.contains_key(*t))
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            errors.push(format!("Missing required artifacts: {missing:?}"));
            return (false, errors);
        }

        for requirement in required {
            let Some(reference) = &requirement.schema else {
                continue;
            };
            let payload = &artifacts[&requirement.type_name];

            let schema = match self.resolve(reference) {
                Ok(schema) => schema,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };

            match schema.validate(payload) {
                Ok(()) => {}
                Err(violations) => {
                    for violation in violations {
                        errors.push(format!(
                            "Artifact '{}' validation failed at {}: {}",
                            requirement.type_name,
                            dotted_path(&violation.instance_path.to_string()),
                            violation
                        ));
                    }
                }
            };
        }

        (errors.is_empty(), errors)
    }
}

/// Convert a JSON pointer (`/a/0/b`) to the dotted form (`a.0.b`) used in
/// error messages; the document root becomes `root`.
fn dotted_path(pointer: &str) -> String {
    let trimmed = pointer.trim_start_matches('/');
    if trimmed.is_empty() {
        "root".to_string()
    } else {
        trimmed.replace('/', ".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(None)
    }

    fn plan_requirement() -> Vec<ArtifactRequirement> {
        vec![ArtifactRequirement {
            type_name: "plan_document".to_string(),
            schema: Some("schemas/plan.json".to_string()),
        }]
    }

    fn valid_plan() -> Value {
        json!({
            "title": "Add user authentication feature",
            "acceptance_criteria": [
                {"criterion": "Feature works", "how_to_verify": "Test it"}
            ],
            "implementation_steps": ["Write the middleware"],
            "scope": {"in_scope": ["auth"], "out_of_scope": ["billing"]}
        })
    }

    fn as_map(key: &str, value: Value) -> serde_json::Map<String, Value> {
        let mut map = serde_json::Map::new();
        map.insert(key.to_string(), value);
        map
    }

    #[test]
    fn valid_plan_passes() {
        let (valid, errors) =
            registry().validate_artifacts(&as_map("plan_document", valid_plan()), &plan_requirement());
        assert!(valid, "unexpected errors: {errors:?}");
    }

    #[test]
    fn missing_artifact_is_reported_distinctly() {
        let (valid, errors) =
            registry().validate_artifacts(&serde_json::Map::new(), &plan_requirement());
        assert!(!valid);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("Missing required artifacts"));
        assert!(errors[0].contains("plan_document"));
    }

    #[test]
    fn short_title_fails_with_field_path() {
        let mut plan = valid_plan();
        plan["title"] = json!("Short");
        let (valid, errors) =
            registry().validate_artifacts(&as_map("plan_document", plan), &plan_requirement());
        assert!(!valid);
        assert!(errors.iter().any(|e| e.contains("title")), "{errors:?}");
    }

    #[test]
    fn criterion_missing_how_to_verify_fails() {
        let mut plan = valid_plan();
        plan["acceptance_criteria"] = json!([{"criterion": "works"}]);
        let (valid, errors) =
            registry().validate_artifacts(&as_map("plan_document", plan), &plan_requirement());
        assert!(!valid);
        assert!(
            errors.iter().any(|e| e.contains("acceptance_criteria.0")),
            "{errors:?}"
        );
    }

    #[test]
    fn unknown_schema_reference_is_a_hard_error() {
        let required = vec![ArtifactRequirement {
            type_name: "mystery".to_string(),
            schema: Some("schemas/mystery.json".to_string()),
        }];
        let (valid, errors) =
            registry().validate_artifacts(&as_map("mystery", json!({})), &required);
        assert!(!valid);
        assert!(errors[0].contains("Schema not found"));
    }

    #[test]
    fn artifact_without_schema_is_presence_checked_only() {
        let required = vec![ArtifactRequirement {
            type_name: "free_form".to_string(),
            schema: None,
        }];
        let (valid, errors) =
            registry().validate_artifacts(&as_map("free_form", json!({"anything": 1})), &required);
        assert!(valid, "{errors:?}");
    }

    #[test]
    fn schemas_load_from_directory() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("custom.json"),
            r#"{"type": "object", "required": ["x"]}"#,
        )
        .unwrap();
        let registry = SchemaRegistry::new(Some(dir.path().to_path_buf()));
        let required = vec![ArtifactRequirement {
            type_name: "custom".to_string(),
            schema: Some("schemas/custom.json".to_string()),
        }];

        let (valid, _) = registry.validate_artifacts(&as_map("custom", json!({"x": 1})), &required);
        assert!(valid);
        let (valid, errors) =
            registry.validate_artifacts(&as_map("custom", json!({})), &required);
        assert!(!valid);
        assert!(errors[0].contains("root"), "{errors:?}");
    }

    #[test]
    fn test_result_schema_accepts_counts() {
        let required = vec![ArtifactRequirement {
            type_name: "test_run_result".to_string(),
            schema: Some("schemas/test_result.json".to_string()),
        }];
        let (valid, errors) = registry().validate_artifacts(
            &as_map(
                "test_run_result",
                json!({"exit_code": 1, "passed": 0, "failed": 5}),
            ),
            &required,
        );
        assert!(valid, "{errors:?}");
    }

    #[test]
    fn dotted_path_formats() {
        assert_eq!(dotted_path(""), "root");
        assert_eq!(dotted_path("/title"), "title");
        assert_eq!(dotted_path("/acceptance_criteria/0/criterion"), "acceptance_criteria.0.criterion");
    }
}
