//! The capability-scoped tool broker.
//!
//! Entry point for every agent tool call. The broker verifies the phase
//! token, enforces the per-phase allow/deny lists (forbidden always wins),
//! dispatches to a registered backend, audits the execution, and publishes
//! a `tool.executed` event. It owns the tool registry but implements no
//! tool logic itself - backends are registered by the host process at
//! startup.
//!
//! Authorization needs no state round-trip: the token carries the phase
//! and its allow-list, so the token *is* the claim. The definition is
//! consulted only for the forbidden list, which tokens do not carry.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::audit::AuditLog;
use crate::errors::BrokerError;
use crate::events::{topics, EventBus};
use crate::token::TokenService;
use crate::workflow::WorkflowDef;

/// Default outer bound on a backend invocation.
pub const DEFAULT_BACKEND_TIMEOUT_SECS: u64 = 120;

/// The backend contract: `(args) → result | error`.
///
/// Backends declare their own internal timeouts; the broker enforces an
/// outer wall-clock bound on top.
#[async_trait]
pub trait ToolBackend: Send + Sync {
    async fn invoke(&self, args: Value) -> Result<Value, String>;
}

pub struct ToolBroker {
    tokens: TokenService,
    def: Arc<WorkflowDef>,
    audit: AuditLog,
    bus: EventBus,
    backends: Mutex<HashMap<String, Arc<dyn ToolBackend>>>,
    timeout_secs: u64,
}

impl std::fmt::Debug for ToolBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolBroker")
            .field("tokens", &self.tokens)
            .field("def", &self.def)
            .field("audit", &self.audit)
            .field("bus", &self.bus)
            .field("timeout_secs", &self.timeout_secs)
            .finish_non_exhaustive()
    }
}

impl ToolBroker {
    pub fn new(tokens: TokenService, def: Arc<WorkflowDef>, audit: AuditLog, bus: EventBus) -> Self {
        Self {
            tokens,
            def,
            audit,
            bus,
            backends: Mutex::new(HashMap::new()),
            timeout_secs: DEFAULT_BACKEND_TIMEOUT_SECS,
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Register a backend for `tool_name`. Later registrations replace
    /// earlier ones.
    pub fn register(&self, tool_name: &str, backend: Arc<dyn ToolBackend>) {
        self.backends
            .lock()
            .expect("backend registry lock poisoned")
            .insert(tool_name.to_string(), backend);
    }

    pub fn registered_tools(&self) -> Vec<String> {
        let mut tools: Vec<String> = self
            .backends
            .lock()
            .expect("backend registry lock poisoned")
            .keys()
            .cloned()
            .collect();
        tools.sort();
        tools
    }

    /// Broker one tool call.
    ///
    /// Denials (bad token, forbidden tool, unregistered tool) return
    /// before any backend runs and leave the audit log untouched; actual
    /// invocations are always audited, success or not.
    pub async fn execute(
        &self,
        task_id: &str,
        token: &str,
        tool_name: &str,
        args: Value,
    ) -> Result<Value, BrokerError> {
        // The token is the claim: its phase binding determines scope.
        let claims = self.tokens.decode(token).ok_or(BrokerError::InvalidToken)?;
        if claims.task_id != task_id {
            return Err(BrokerError::InvalidToken);
        }
        let phase = claims.phase.clone();

        // Forbidden always wins; then the token's allow-list; default deny.
        let forbidden = self
            .def
            .get_phase(&phase)
            .map(|p| p.forbidden_tools.iter().any(|t| t == tool_name))
            .unwrap_or(true);
        let allowed = claims.allowed_tools.iter().any(|t| t == tool_name);
        if forbidden || !allowed {
            return Err(BrokerError::ToolForbidden {
                tool: tool_name.to_string(),
                phase,
            });
        }

        let backend = {
            let backends = self.backends.lock().expect("backend registry lock poisoned");
            backends.get(tool_name).cloned()
        }
        .ok_or_else(|| BrokerError::ToolNotRegistered {
            tool: tool_name.to_string(),
        })?;

        let start = Instant::now();
        let outcome = tokio::time::timeout(
            Duration::from_secs(self.timeout_secs),
            backend.invoke(args.clone()),
        )
        .await;
        let duration_ms = start.elapsed().as_secs_f64() * 1000.0;

        let (result, error): (Option<Value>, Option<String>) = match outcome {
            Ok(Ok(result)) => (Some(result), None),
            Ok(Err(message)) => (None, Some(message)),
            Err(_) => (
                None,
                Some(format!("timeout after {}s", self.timeout_secs)),
            ),
        };
        let success = error.is_none();

        if let Err(e) = self.audit.log_tool_execution(
            task_id,
            &phase,
            tool_name,
            args,
            result.clone(),
            Some(duration_ms),
            success,
            error.clone(),
        ) {
            tracing::error!(error = %e, "failed to write audit entry");
        }

        self.bus.publish(
            topics::TOOL_EXECUTED,
            json!({
                "task_id": task_id,
                "phase": phase,
                "tool_name": tool_name,
                "success": success,
                "duration_ms": duration_ms,
            }),
        );

        match (result, error) {
            (Some(result), None) => Ok(result),
            (_, Some(message)) if message.starts_with("timeout after") => {
                Err(BrokerError::BackendTimeout {
                    tool: tool_name.to_string(),
                    timeout_secs: self.timeout_secs,
                })
            }
            (_, Some(message)) => Err(BrokerError::Backend {
                tool: tool_name.to_string(),
                message,
            }),
            (None, None) => unreachable!("result and error cannot both be absent"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::workflow::defaults::default_workflow;
    use tempfile::TempDir;

    struct EchoBackend;

    #[async_trait]
    impl ToolBackend for EchoBackend {
        async fn invoke(&self, args: Value) -> Result<Value, String> {
            Ok(json!({"echoed": args}))
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl ToolBackend for FailingBackend {
        async fn invoke(&self, _args: Value) -> Result<Value, String> {
            Err("disk on fire".to_string())
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl ToolBackend for SlowBackend {
        async fn invoke(&self, _args: Value) -> Result<Value, String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        }
    }

    const SECRET: &str = "broker_test_secret_0123456789abcdef";

    fn setup(dir: &TempDir) -> (ToolBroker, TokenService, EventBus) {
        let tokens = TokenService::new(SECRET, 7200).unwrap();
        let def = Arc::new(default_workflow());
        let audit = AuditLog::new(dir.path().join(".orchestrator/audit.jsonl"));
        let bus = EventBus::default();
        let broker = ToolBroker::new(tokens.clone(), def, audit, bus.clone());
        broker.register("read_files", Arc::new(EchoBackend));
        broker.register("bash", Arc::new(EchoBackend));
        (broker, tokens, bus)
    }

    fn plan_token(tokens: &TokenService) -> String {
        let def = default_workflow();
        let plan = def.get_phase("PLAN").unwrap();
        tokens.issue("task-1", "PLAN", &plan.allowed_tools).unwrap()
    }

    #[tokio::test]
    async fn allowed_tool_executes_and_audits() {
        let dir = TempDir::new().unwrap();
        let (broker, tokens, bus) = setup(&dir);
        let token = plan_token(&tokens);

        let result = broker
            .execute("task-1", &token, "read_files", json!({"path": "src/lib.rs"}))
            .await
            .unwrap();
        assert_eq!(result["echoed"]["path"], "src/lib.rs");

        let audit = AuditLog::new(dir.path().join(".orchestrator/audit.jsonl"));
        let entries = audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].tool_name, "read_files");
        assert_eq!(entries[0].phase, "PLAN");
        assert!(entries[0].success);
        assert!(entries[0].duration_ms.is_some());

        let events = bus.history(Some(topics::TOOL_EXECUTED), 10);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["tool_name"], "read_files");
    }

    #[tokio::test]
    async fn invalid_token_is_denied_without_audit() {
        let dir = TempDir::new().unwrap();
        let (broker, _, _) = setup(&dir);

        let err = broker
            .execute("task-1", "garbage-token", "read_files", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidToken));

        let audit = AuditLog::new(dir.path().join(".orchestrator/audit.jsonl"));
        assert!(audit.query(&AuditQuery::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_for_other_task_is_denied() {
        let dir = TempDir::new().unwrap();
        let (broker, tokens, _) = setup(&dir);
        let token = plan_token(&tokens);

        let err = broker
            .execute("task-2", &token, "read_files", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidToken));
    }

    #[tokio::test]
    async fn tool_off_the_allow_list_is_forbidden() {
        let dir = TempDir::new().unwrap();
        let (broker, tokens, _) = setup(&dir);
        let token = plan_token(&tokens);

        // write_files is forbidden in PLAN and not on the allow list.
        let err = broker
            .execute("task-1", &token, "write_files", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ToolForbidden { .. }));
    }

    #[tokio::test]
    async fn forbidden_wins_even_when_token_claims_allow() {
        let dir = TempDir::new().unwrap();
        let (broker, tokens, _) = setup(&dir);
        // Forge a token whose allow-list claims bash in PLAN; PLAN forbids
        // bash, and forbidden must win.
        let token = tokens
            .issue("task-1", "PLAN", &["bash".to_string()])
            .unwrap();

        let err = broker
            .execute("task-1", &token, "bash", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ToolForbidden { .. }));
    }

    #[tokio::test]
    async fn unknown_phase_in_token_is_default_deny() {
        let dir = TempDir::new().unwrap();
        let (broker, tokens, _) = setup(&dir);
        let token = tokens
            .issue("task-1", "NO_SUCH_PHASE", &["read_files".to_string()])
            .unwrap();

        let err = broker
            .execute("task-1", &token, "read_files", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ToolForbidden { .. }));
    }

    #[tokio::test]
    async fn unregistered_tool_is_reported() {
        let dir = TempDir::new().unwrap();
        let (broker, tokens, _) = setup(&dir);
        let token = plan_token(&tokens);

        // grep is allowed in PLAN but no backend was registered for it.
        let err = broker
            .execute("task-1", &token, "grep", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ToolNotRegistered { .. }));
    }

    #[tokio::test]
    async fn backend_error_is_audited_as_failure() {
        let dir = TempDir::new().unwrap();
        let (broker, tokens, _) = setup(&dir);
        broker.register("grep", Arc::new(FailingBackend));
        let token = plan_token(&tokens);

        let err = broker
            .execute("task-1", &token, "grep", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::Backend { .. }));
        assert!(err.to_string().contains("disk on fire"));

        let audit = AuditLog::new(dir.path().join(".orchestrator/audit.jsonl"));
        let failures = audit
            .query(&AuditQuery {
                success: Some(false),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].error.as_deref(), Some("disk on fire"));
    }

    #[tokio::test]
    async fn slow_backend_hits_broker_timeout() {
        let dir = TempDir::new().unwrap();
        let tokens = TokenService::new(SECRET, 7200).unwrap();
        let def = Arc::new(default_workflow());
        let audit = AuditLog::new(dir.path().join(".orchestrator/audit.jsonl"));
        let broker =
            ToolBroker::new(tokens.clone(), def, audit.clone(), EventBus::default()).with_timeout(1);
        broker.register("grep", Arc::new(SlowBackend));

        let token = plan_token(&tokens);
        let err = broker
            .execute("task-1", &token, "grep", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::BackendTimeout { .. }));

        let entries = audit.query(&AuditQuery::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert!(entries[0].error.as_ref().unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn registered_tools_lists_sorted() {
        let dir = TempDir::new().unwrap();
        let (broker, _, _) = setup(&dir);
        assert_eq!(broker.registered_tools(), vec!["bash", "read_files"]);
    }
}
