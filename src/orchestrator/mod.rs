//! The orchestrator facade.
//!
//! Composes the subsystems - definition, token service, schema registry,
//! gate evaluator, phase state machine, task registry, event bus, audit
//! log, tool broker - behind the four externally visible operations:
//! claim, transition, execute, snapshot. The HTTP layer in `server` is a
//! thin translation over this type.
//!
//! There is exactly one phase state machine. Each claimed task gets its
//! own workflow instance in its own session; the transition path validates
//! token, transition, artifacts and gate, then drives that same engine.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::artifacts::SchemaRegistry;
use crate::audit::{AuditLog, AuditQuery, AuditStats};
use crate::broker::{ToolBackend, ToolBroker};
use crate::coordination::{TaskRegistry, TaskSnapshot};
use crate::engine::{StartOptions, WorkflowEngine};
use crate::errors::{BrokerError, EngineError, TokenError};
use crate::events::{topics, EventBus};
use crate::gates::GateEvaluator;
use crate::paths::OrchestratorPaths;
use crate::token::TokenService;
use crate::workflow::WorkflowDef;

/// Environment variable holding the token-signing secret.
pub const SECRET_ENV_VAR: &str = "ORCHESTRATOR_JWT_SECRET";

#[derive(Debug, Error)]
pub enum ClaimError {
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Failed to register task: {0}")]
    Registry(#[source] std::io::Error),
}

#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Invalid or expired phase token")]
    TokenInvalid,
    #[error("No transition defined from {from} to {to}")]
    UnknownTransition { from: String, to: String },
    #[error("Unknown phase: {0}")]
    UnknownPhase(String),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error(transparent)]
    Engine(#[from] EngineError),
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Invalid or expired phase token")]
    TokenInvalid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimedTask {
    pub id: String,
    pub agent_id: String,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub task: ClaimedTask,
    pub phase: String,
    pub phase_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransitionRequest {
    pub task_id: String,
    pub current_phase: String,
    pub target_phase: String,
    pub phase_token: String,
    #[serde(default)]
    pub artifacts: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionResponse {
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_token: Option<String>,
    pub blockers: Vec<String>,
}

#[derive(Debug)]
pub struct Orchestrator {
    working_dir: PathBuf,
    def: Arc<WorkflowDef>,
    tokens: TokenService,
    schemas: SchemaRegistry,
    registry: TaskRegistry,
    bus: EventBus,
    audit: AuditLog,
    broker: ToolBroker,
    /// One engine (workflow instance, own session) per claimed task.
    sessions: Mutex<HashMap<String, WorkflowEngine>>,
}

impl Orchestrator {
    pub fn new(working_dir: &Path, def: WorkflowDef, secret: &str) -> anyhow::Result<Self> {
        def.validate()?;
        let def = Arc::new(def);
        let tokens = TokenService::new(secret, def.enforcement.phase_tokens.expiry_seconds)?;
        let paths = OrchestratorPaths::new(working_dir, None);
        let schemas = SchemaRegistry::new(Some(working_dir.join(".orchestrator/schemas")));

        // Fail fast on dangling schema references instead of at the first
        // transition that needs them.
        for phase in &def.phases {
            for requirement in &phase.required_artifacts {
                if let Some(reference) = &requirement.schema {
                    schemas
                        .resolve(reference)
                        .map_err(|e| anyhow::anyhow!("Phase {}: {e}", phase.id))?;
                }
            }
        }

        let registry = TaskRegistry::new(paths.coordination_file());
        let bus = EventBus::default();
        let audit = AuditLog::new(paths.audit_file());
        let broker = ToolBroker::new(tokens.clone(), Arc::clone(&def), audit.clone(), bus.clone());

        Ok(Self {
            working_dir: working_dir.to_path_buf(),
            def,
            tokens,
            schemas,
            registry,
            bus,
            audit,
            broker,
            sessions: Mutex::new(HashMap::new()),
        })
    }

    pub fn definition(&self) -> &WorkflowDef {
        &self.def
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn register_backend(&self, tool_name: &str, backend: Arc<dyn ToolBackend>) {
        self.broker.register(tool_name, backend);
    }

    // ------------------------------------------------------------------
    // Claim
    // ------------------------------------------------------------------

    /// Register a new task for `agent_id`, start its workflow instance,
    /// and issue the initial phase token.
    pub fn claim_task(
        &self,
        agent_id: &str,
        capabilities: Vec<String>,
        dependencies: Vec<String>,
    ) -> Result<ClaimResponse, ClaimError> {
        let task_id = format!("task_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let first_phase = &self.def.phases[0];

        self.registry
            .register_task(&task_id, agent_id, &first_phase.id, dependencies)
            .map_err(ClaimError::Registry)?;

        let mut engine = WorkflowEngine::new(&self.working_dir, None);
        engine.start_workflow(
            (*self.def).clone(),
            &format!("Task {task_id} claimed by {agent_id}"),
            StartOptions {
                no_archive: true,
                ..Default::default()
            },
        )?;
        self.sessions
            .lock()
            .expect("sessions lock poisoned")
            .insert(task_id.clone(), engine);

        let phase_token = self
            .tokens
            .issue(&task_id, &first_phase.id, &first_phase.allowed_tools)?;

        self.bus.publish(
            topics::TASK_CLAIMED,
            json!({
                "task_id": task_id,
                "agent_id": agent_id,
                "phase": first_phase.id,
            }),
        );

        Ok(ClaimResponse {
            task: ClaimedTask {
                id: task_id,
                agent_id: agent_id.to_string(),
                capabilities,
            },
            phase: first_phase.id.clone(),
            phase_token,
        })
    }

    // ------------------------------------------------------------------
    // Transition
    // ------------------------------------------------------------------

    /// Validate and, when allowed, perform a phase transition.
    ///
    /// Check order: token (denied), transition defined (bad request),
    /// required artifacts, gate blockers, item blockers. Blocked
    /// validation is a normal outcome - `allowed: false` with blockers -
    /// not an error.
    pub fn transition(&self, req: &TransitionRequest) -> Result<TransitionResponse, TransitionError> {
        if !self
            .tokens
            .verify(&req.phase_token, &req.task_id, &req.current_phase)
        {
            return Err(TransitionError::TokenInvalid);
        }

        let transition = self
            .def
            .find_transition(&req.current_phase, &req.target_phase)
            .ok_or_else(|| TransitionError::UnknownTransition {
                from: req.current_phase.clone(),
                to: req.target_phase.clone(),
            })?;

        let current_phase =
            self.def
                .get_phase(&req.current_phase)
                .ok_or_else(|| TransitionError::UnknownPhase(req.current_phase.clone()))?;
        let target_phase =
            self.def
                .get_phase(&req.target_phase)
                .ok_or_else(|| TransitionError::UnknownPhase(req.target_phase.clone()))?;

        let mut blockers = Vec::new();

        let (artifacts_valid, artifact_errors) = self
            .schemas
            .validate_artifacts(&req.artifacts, &current_phase.required_artifacts);
        if !artifacts_valid {
            blockers.extend(artifact_errors);
        }

        if blockers.is_empty() {
            if let Some(gate_id) = &transition.gate {
                let evaluator = GateEvaluator::new(&self.def);
                let (_, gate_blockers) = evaluator.evaluate(gate_id, &req.artifacts);
                blockers.extend(gate_blockers);
            }
        }

        if blockers.is_empty() {
            // Item-level blockers from the state machine.
            let sessions = self.sessions.lock().expect("sessions lock poisoned");
            if let Some(engine) = sessions.get(&req.task_id) {
                let (_, item_blockers, _) = engine.can_advance_phase();
                blockers.extend(item_blockers);
            }
        }

        if !blockers.is_empty() {
            self.bus.publish(
                topics::GATE_BLOCKED,
                json!({
                    "task_id": req.task_id,
                    "from": req.current_phase,
                    "to": req.target_phase,
                    "blockers": blockers,
                }),
            );
            return Ok(TransitionResponse {
                allowed: false,
                new_token: None,
                blockers,
            });
        }

        // All checks passed: advance the state machine and re-key the
        // capability. The old token dies with its phase binding.
        {
            let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
            if let Some(engine) = sessions.get_mut(&req.task_id) {
                engine.advance_to(&req.target_phase)?;
            }
        }
        if let Err(e) = self.registry.update_phase(&req.task_id, &req.target_phase) {
            tracing::error!(error = %e, "failed to persist phase update");
        }

        let new_token =
            self.tokens
                .issue(&req.task_id, &target_phase.id, &target_phase.allowed_tools)?;

        if transition.gate.is_some() {
            self.bus.publish(
                topics::GATE_PASSED,
                json!({
                    "task_id": req.task_id,
                    "gate": transition.gate,
                    "from": req.current_phase,
                    "to": req.target_phase,
                }),
            );
        }
        self.bus.publish(
            topics::TASK_TRANSITIONED,
            json!({
                "task_id": req.task_id,
                "from": req.current_phase,
                "to": req.target_phase,
            }),
        );

        Ok(TransitionResponse {
            allowed: true,
            new_token: Some(new_token),
            blockers: Vec::new(),
        })
    }

    // ------------------------------------------------------------------
    // Execute / snapshot / diagnostics
    // ------------------------------------------------------------------

    pub async fn execute_tool(
        &self,
        task_id: &str,
        token: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<Value, BrokerError> {
        self.broker.execute(task_id, token, tool_name, args).await
    }

    /// Read-only snapshot for the task a valid token is bound to.
    pub fn snapshot(&self, token: &str) -> Result<TaskSnapshot, SnapshotError> {
        let claims = self
            .tokens
            .decode(token)
            .ok_or(SnapshotError::TokenInvalid)?;
        Ok(self.registry.snapshot(&claims.task_id))
    }

    /// Mark a task completed in the registry and publish task.completed.
    pub fn complete_task(&self, task_id: &str) -> std::io::Result<()> {
        self.registry.mark_completed(task_id)?;
        self.bus
            .publish(topics::TASK_COMPLETED, json!({"task_id": task_id}));
        Ok(())
    }

    pub fn audit_query(&self, query: &AuditQuery) -> std::io::Result<Vec<crate::audit::AuditEntry>> {
        self.audit.query(query)
    }

    pub fn audit_stats(&self) -> std::io::Result<AuditStats> {
        self.audit.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::defaults::default_workflow;
    use tempfile::TempDir;

    const SECRET: &str = "orchestrator_test_secret_0123456789abcdef";

    fn orchestrator(dir: &TempDir) -> Orchestrator {
        Orchestrator::new(dir.path(), default_workflow(), SECRET).unwrap()
    }

    fn valid_plan() -> Value {
        json!({
            "title": "A valid 10+ char title",
            "acceptance_criteria": [
                {"criterion": "Feature works", "how_to_verify": "Test it"}
            ],
            "implementation_steps": ["S1"],
            "scope": {"in_scope": ["X"], "out_of_scope": ["Y"]}
        })
    }

    fn artifacts(key: &str, value: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(key.to_string(), value);
        map
    }

    #[test]
    fn claim_issues_token_for_first_phase() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let claim = orch.claim_task("a1", vec!["python".to_string()], vec![]).unwrap();

        assert_eq!(claim.phase, "PLAN");
        assert_eq!(claim.task.agent_id, "a1");
        assert!(claim.task.id.starts_with("task_"));

        let snapshot = orch.snapshot(&claim.phase_token).unwrap();
        assert_eq!(snapshot.current_phase, "PLAN");

        let claimed = orch.events().history(Some(topics::TASK_CLAIMED), 10);
        assert_eq!(claimed.len(), 1);
    }

    #[test]
    fn happy_path_transition_rotates_token() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let claim = orch.claim_task("a1", vec![], vec![]).unwrap();

        let response = orch
            .transition(&TransitionRequest {
                task_id: claim.task.id.clone(),
                current_phase: "PLAN".to_string(),
                target_phase: "TDD".to_string(),
                phase_token: claim.phase_token.clone(),
                artifacts: artifacts("plan_document", valid_plan()),
            })
            .unwrap();

        assert!(response.allowed, "{:?}", response.blockers);
        let new_token = response.new_token.unwrap();

        // New token is bound to TDD; the old one no longer verifies there.
        let snapshot = orch.snapshot(&new_token).unwrap();
        assert_eq!(snapshot.current_phase, "TDD");
        let err = orch
            .transition(&TransitionRequest {
                task_id: claim.task.id.clone(),
                current_phase: "TDD".to_string(),
                target_phase: "IMPL".to_string(),
                phase_token: claim.phase_token.clone(),
                artifacts: Map::new(),
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::TokenInvalid));
    }

    #[test]
    fn gate_blocks_on_empty_criteria() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let claim = orch.claim_task("a1", vec![], vec![]).unwrap();

        let mut plan = valid_plan();
        plan["acceptance_criteria"] = json!([]);
        let response = orch
            .transition(&TransitionRequest {
                task_id: claim.task.id.clone(),
                current_phase: "PLAN".to_string(),
                target_phase: "TDD".to_string(),
                phase_token: claim.phase_token.clone(),
                artifacts: artifacts("plan_document", plan),
            })
            .unwrap();

        assert!(!response.allowed);
        assert!(response.new_token.is_none());
        assert!(
            response
                .blockers
                .iter()
                .any(|b| b.to_lowercase().contains("acceptance")),
            "{:?}",
            response.blockers
        );
        assert_eq!(orch.events().history(Some(topics::GATE_BLOCKED), 10).len(), 1);
    }

    #[test]
    fn unknown_transition_is_a_request_error() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let claim = orch.claim_task("a1", vec![], vec![]).unwrap();

        let err = orch
            .transition(&TransitionRequest {
                task_id: claim.task.id.clone(),
                current_phase: "PLAN".to_string(),
                target_phase: "REVIEW".to_string(),
                phase_token: claim.phase_token.clone(),
                artifacts: Map::new(),
            })
            .unwrap_err();
        assert!(matches!(err, TransitionError::UnknownTransition { .. }));
        assert!(err.to_string().contains("No transition defined"));
    }

    #[test]
    fn missing_artifact_blocks_with_distinct_message() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let claim = orch.claim_task("a1", vec![], vec![]).unwrap();

        let response = orch
            .transition(&TransitionRequest {
                task_id: claim.task.id.clone(),
                current_phase: "PLAN".to_string(),
                target_phase: "TDD".to_string(),
                phase_token: claim.phase_token.clone(),
                artifacts: Map::new(),
            })
            .unwrap();
        assert!(!response.allowed);
        assert!(response.blockers[0].contains("Missing required artifacts"));
    }

    #[test]
    fn failed_transition_leaves_state_unchanged() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let claim = orch.claim_task("a1", vec![], vec![]).unwrap();

        let mut plan = valid_plan();
        plan["acceptance_criteria"] = json!([]);
        orch.transition(&TransitionRequest {
            task_id: claim.task.id.clone(),
            current_phase: "PLAN".to_string(),
            target_phase: "TDD".to_string(),
            phase_token: claim.phase_token.clone(),
            artifacts: artifacts("plan_document", plan),
        })
        .unwrap();

        // Still in PLAN; the original token still verifies.
        let snapshot = orch.snapshot(&claim.phase_token).unwrap();
        assert_eq!(snapshot.current_phase, "PLAN");
        let retry = orch
            .transition(&TransitionRequest {
                task_id: claim.task.id.clone(),
                current_phase: "PLAN".to_string(),
                target_phase: "TDD".to_string(),
                phase_token: claim.phase_token.clone(),
                artifacts: artifacts("plan_document", valid_plan()),
            })
            .unwrap();
        assert!(retry.allowed);
    }

    #[test]
    fn tdd_red_green_cycle() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let claim = orch.claim_task("a1", vec![], vec![]).unwrap();
        let task_id = claim.task.id.clone();

        let tdd_token = orch
            .transition(&TransitionRequest {
                task_id: task_id.clone(),
                current_phase: "PLAN".to_string(),
                target_phase: "TDD".to_string(),
                phase_token: claim.phase_token,
                artifacts: artifacts("plan_document", valid_plan()),
            })
            .unwrap()
            .new_token
            .unwrap();

        // RED: failing tests allow TDD -> IMPL.
        let impl_token = orch
            .transition(&TransitionRequest {
                task_id: task_id.clone(),
                current_phase: "TDD".to_string(),
                target_phase: "IMPL".to_string(),
                phase_token: tdd_token,
                artifacts: artifacts(
                    "test_run_result",
                    json!({"exit_code": 1, "passed": 0, "failed": 5}),
                ),
            })
            .unwrap();
        assert!(impl_token.allowed, "{:?}", impl_token.blockers);
        let impl_token = impl_token.new_token.unwrap();

        // Partially green: blocked with the failure count.
        let blocked = orch
            .transition(&TransitionRequest {
                task_id: task_id.clone(),
                current_phase: "IMPL".to_string(),
                target_phase: "REVIEW".to_string(),
                phase_token: impl_token.clone(),
                artifacts: artifacts(
                    "test_run_result",
                    json!({"exit_code": 1, "passed": 8, "failed": 2}),
                ),
            })
            .unwrap();
        assert!(!blocked.allowed);
        assert!(blocked.blockers.iter().any(|b| b.contains("2 test(s) failed")));

        // Fully green: allowed.
        let green = orch
            .transition(&TransitionRequest {
                task_id: task_id.clone(),
                current_phase: "IMPL".to_string(),
                target_phase: "REVIEW".to_string(),
                phase_token: impl_token,
                artifacts: artifacts(
                    "test_run_result",
                    json!({"exit_code": 0, "passed": 10, "failed": 0}),
                ),
            })
            .unwrap();
        assert!(green.allowed, "{:?}", green.blockers);
    }

    #[test]
    fn dependent_tasks_unblock_on_completion() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        let a = orch.claim_task("agent-a", vec![], vec![]).unwrap();
        let b = orch
            .claim_task("agent-b", vec![], vec![a.task.id.clone()])
            .unwrap();

        assert!(!orch.registry().is_unblocked(&b.task.id));
        orch.complete_task(&a.task.id).unwrap();
        assert!(orch.registry().is_unblocked(&b.task.id));

        let snapshot = orch.snapshot(&b.phase_token).unwrap();
        assert_eq!(snapshot.task_dependencies, vec![a.task.id.clone()]);
        assert_eq!(snapshot.completed_tasks, vec![a.task.id.clone()]);
        assert_eq!(
            orch.events().history(Some(topics::TASK_COMPLETED), 10).len(),
            1
        );
    }

    #[test]
    fn dangling_schema_reference_fails_startup() {
        let yaml = r#"
name: broken
phases:
  - id: PLAN
    name: Planning
    allowed_tools: [read_files]
    required_artifacts:
      - type: mystery_artifact
        schema: schemas/mystery.json
"#;
        let def = crate::workflow::WorkflowDef::from_yaml_str(yaml).unwrap();
        let dir = TempDir::new().unwrap();
        let err = Orchestrator::new(dir.path(), def, SECRET).unwrap_err();
        assert!(err.to_string().contains("Schema not found"));
    }

    #[test]
    fn snapshot_requires_valid_token() {
        let dir = TempDir::new().unwrap();
        let orch = orchestrator(&dir);
        assert!(matches!(
            orch.snapshot("bogus").unwrap_err(),
            SnapshotError::TokenInvalid
        ));
    }
}
