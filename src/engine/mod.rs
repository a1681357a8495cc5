//! The phase state machine.
//!
//! One `WorkflowEngine` owns one workflow instance: its frozen definition,
//! its durable state, and every legal mutation of that state. The engine
//! never promotes an item silently, never recovers from a partial write
//! (atomic rename under lock makes those impossible), and never mutates a
//! terminal workflow.

pub mod state;

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::enforcement::{
    gate_exec::GateRunner, skip, validate_evidence_depth, validate_flexible_reason,
    validate_skip_reasoning,
};
use crate::errors::EngineError;
use crate::paths::OrchestratorPaths;
use crate::persist;
use crate::workflow::{
    ChecklistItemDef, PhaseType, StepType, SupervisionMode, VerificationType, WorkflowDef,
    WorkflowSettings,
};

pub use state::{
    EventType, ItemState, ItemStatus, PhaseState, PhaseStatus, WorkflowEvent, WorkflowState,
    WorkflowStatus,
};

/// Max chars of stdout/stderr stored in item results.
const OUTPUT_TRUNCATE_LENGTH: usize = 1000;
const MAX_CONSTRAINT_LENGTH: usize = 1000;
const MAX_NOTE_LENGTH: usize = 2000;

/// Per-phase item counts reported by `workflow_summary`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PhaseSummary {
    pub completed: usize,
    pub skipped: usize,
    pub total: usize,
}

/// Options for [`WorkflowEngine::start_workflow`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Task-specific constraints recorded in the instance state.
    pub constraints: Vec<String>,
    /// Settings merged over the definition's settings map (CLI flags,
    /// auto-detection) before the definition is frozen.
    pub settings_overrides: Option<BTreeMap<String, serde_yaml::Value>>,
    /// Skip archiving leftover workflow documents from a previous run.
    pub no_archive: bool,
    /// Path of the source document, recorded with a checksum for drift
    /// detection.
    pub source_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct WorkflowEngine {
    working_dir: PathBuf,
    paths: OrchestratorPaths,
    pub workflow_def: Option<WorkflowDef>,
    pub state: Option<WorkflowState>,
    gate_runner: GateRunner,
    settings_override: Option<WorkflowSettings>,
}

impl WorkflowEngine {
    pub fn new(working_dir: &Path, session_id: Option<String>) -> Self {
        let paths = OrchestratorPaths::new(working_dir, session_id);
        Self {
            working_dir: working_dir.to_path_buf(),
            paths,
            workflow_def: None,
            state: None,
            gate_runner: GateRunner::default(),
            settings_override: None,
        }
    }

    pub fn with_gate_runner(mut self, runner: GateRunner) -> Self {
        self.gate_runner = runner;
        self
    }

    pub fn with_settings(mut self, settings: WorkflowSettings) -> Self {
        self.settings_override = Some(settings);
        self
    }

    pub fn paths(&self) -> &OrchestratorPaths {
        &self.paths
    }

    pub fn session_id(&self) -> &str {
        self.paths.session_id()
    }

    /// Effective settings: explicit override, then the definition's
    /// settings map, then defaults.
    pub fn settings(&self) -> WorkflowSettings {
        if let Some(settings) = &self.settings_override {
            return settings.clone();
        }
        self.workflow_def
            .as_ref()
            .map(|def| def.typed_settings())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Loading and saving
    // ------------------------------------------------------------------

    /// Load instance state from the session's state file, if present.
    /// The version-locked definition embedded in the state wins over
    /// whatever document is on disk.
    pub fn load_state(&mut self) -> Result<Option<&WorkflowState>, EngineError> {
        let state_file = self.paths.state_file();
        let Some(bytes) = persist::read_locked(&state_file).map_err(|source| {
            EngineError::Persist {
                path: state_file.clone(),
                source,
            }
        })?
        else {
            return Ok(None);
        };

        let state: WorkflowState = serde_json::from_slice(&bytes)
            .map_err(|e| EngineError::Other(anyhow::anyhow!("corrupt state file: {e}")))?;
        if let Some(frozen) = &state.workflow_definition {
            self.workflow_def = Some(frozen.clone());
        }
        self.state = Some(state);
        Ok(self.state.as_ref())
    }

    pub fn save_state(&mut self) -> Result<(), EngineError> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };
        state.touch();
        let state_file = self.paths.state_file();
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| EngineError::Other(anyhow::anyhow!("serialize state: {e}")))?;
        persist::write_atomic(&state_file, &bytes).map_err(|source| EngineError::Persist {
            path: state_file,
            source,
        })
    }

    pub fn log_event(&self, event: &WorkflowEvent) {
        let log_file = self.paths.log_file();
        match serde_json::to_string(event) {
            Ok(line) => {
                if let Err(e) = persist::append_line_locked(&log_file, &line) {
                    tracing::error!(error = %e, "failed to append workflow event");
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to serialize workflow event"),
        }
    }

    /// Recent workflow events from the session log, oldest first.
    pub fn events(&self, limit: usize) -> Vec<WorkflowEvent> {
        let Ok(Some(bytes)) = persist::read_locked(&self.paths.log_file()) else {
            return Vec::new();
        };
        let content = String::from_utf8_lossy(&bytes);
        let events: Vec<WorkflowEvent> = content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect();
        let skip = events.len().saturating_sub(limit);
        events.into_iter().skip(skip).collect()
    }

    // ------------------------------------------------------------------
    // Workflow lifecycle
    // ------------------------------------------------------------------

    /// Create and activate a new workflow instance.
    ///
    /// Applies settings overrides, freezes the definition (and a checksum
    /// of its source, when given) into the state, initializes every phase
    /// and item to pending, and activates the first phase. Rejects if this
    /// session already has an active workflow. Stale workflow documents
    /// from a previous run are archived unless `no_archive` is set.
    pub fn start_workflow(
        &mut self,
        mut def: WorkflowDef,
        task_description: &str,
        options: StartOptions,
    ) -> Result<&WorkflowState, EngineError> {
        if let Some(overrides) = &options.settings_overrides {
            for (key, value) in overrides {
                def.settings.insert(key.clone(), value.clone());
            }
        }
        def.validate()?;

        let constraints = options.constraints;
        for constraint in &constraints {
            let len = constraint.chars().count();
            if len > MAX_CONSTRAINT_LENGTH {
                return Err(EngineError::InputTooLong(
                    "Constraint",
                    MAX_CONSTRAINT_LENGTH,
                    len,
                ));
            }
        }

        if let Some(existing) = self.load_state()? {
            if existing.status == WorkflowStatus::Active {
                return Err(EngineError::ActiveWorkflowExists {
                    workflow_id: existing.workflow_id.clone(),
                });
            }
        }

        if !options.no_archive {
            let archived = self.archive_existing_docs(&slugify(task_description, 30));
            if !archived.is_empty() {
                tracing::info!(count = archived.len(), "archived workflow document(s)");
            }
        }

        let workflow_id = format!("wf_{}", &uuid::Uuid::new_v4().simple().to_string()[..8]);
        let first_phase_id = def.phases[0].id.clone();
        let first_phase_name = def.phases[0].name.clone();

        let mut phases = BTreeMap::new();
        for phase_def in &def.phases {
            let items = phase_def
                .items
                .iter()
                .map(|item| (item.id.clone(), ItemState::new(&item.id)))
                .collect();
            phases.insert(
                phase_def.id.clone(),
                PhaseState {
                    id: phase_def.id.clone(),
                    status: PhaseStatus::Pending,
                    started_at: None,
                    completed_at: None,
                    items,
                },
            );
        }
        if let Some(first) = phases.get_mut(&first_phase_id) {
            first.status = PhaseStatus::Active;
            first.started_at = Some(Utc::now());
        }

        let mut metadata = BTreeMap::new();
        if let Some(path) = options.source_path.as_deref() {
            metadata.insert(
                "workflow_yaml_path".to_string(),
                json!(path.display().to_string()),
            );
            if let Ok(raw) = std::fs::read(path) {
                let digest = Sha256::digest(&raw);
                let checksum: String = format!("{digest:x}").chars().take(16).collect();
                metadata.insert("workflow_yaml_checksum".to_string(), json!(checksum));
            }
        }

        let now = Utc::now();
        let state = WorkflowState {
            workflow_id: workflow_id.clone(),
            workflow_type: def.name.clone(),
            workflow_version: def.version.clone(),
            task_description: task_description.to_string(),
            constraints,
            current_phase_id: first_phase_id.clone(),
            phases,
            status: WorkflowStatus::Active,
            workflow_definition: Some(def.clone()),
            metadata,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.workflow_def = Some(def);
        self.state = Some(state);
        self.save_state()?;
        self.paths
            .write_current()
            .map_err(|source| EngineError::Persist {
                path: self.paths.current_file(),
                source,
            })?;

        self.log_event(&WorkflowEvent::new(
            EventType::WorkflowStarted,
            &workflow_id,
            format!("Started workflow: {task_description}"),
        ));
        self.log_event(
            &WorkflowEvent::new(
                EventType::PhaseStarted,
                &workflow_id,
                format!("Started phase: {first_phase_name}"),
            )
            .phase(&first_phase_id),
        );

        Ok(self.state.as_ref().expect("state just set"))
    }

    /// Move leftover workflow documents from a previous run into
    /// `docs/archive/` with dated names. Returns the archived paths.
    pub fn archive_existing_docs(&self, task_slug: &str) -> Vec<PathBuf> {
        const DOCS: &[(&str, &str)] = &[
            ("docs/plan.md", "plan"),
            ("docs/risk_analysis.md", "risk"),
            ("tests/test_cases.md", "test_cases"),
        ];
        let archive_dir = self.working_dir.join("docs/archive");
        let date = Utc::now().format("%Y-%m-%d");

        let mut archived = Vec::new();
        for (doc_path, suffix) in DOCS {
            let src = self.working_dir.join(doc_path);
            if !src.exists() {
                continue;
            }
            if let Err(e) = std::fs::create_dir_all(&archive_dir) {
                tracing::warn!(error = %e, "cannot create archive directory");
                return archived;
            }
            let mut dst = archive_dir.join(format!("{date}_{task_slug}_{suffix}.md"));
            let mut counter = 1;
            while dst.exists() {
                dst = archive_dir.join(format!("{date}_{task_slug}_{suffix}_{counter}.md"));
                counter += 1;
            }
            match std::fs::rename(&src, &dst) {
                Ok(()) => archived.push(dst),
                Err(e) => tracing::warn!(error = %e, doc = %doc_path, "failed to archive document"),
            }
        }
        archived
    }

    pub fn complete_workflow(&mut self, notes: Option<String>) -> Result<(), EngineError> {
        self.ensure_active()?;
        let state = self.state.as_mut().expect("checked by ensure_active");
        state.status = WorkflowStatus::Completed;
        state.completed_at = Some(Utc::now());
        if let Some(notes) = notes {
            state
                .metadata
                .insert("completion_notes".to_string(), json!(notes));
        }
        let workflow_id = state.workflow_id.clone();
        self.save_state()?;
        self.log_event(&WorkflowEvent::new(
            EventType::WorkflowCompleted,
            &workflow_id,
            "Workflow completed",
        ));
        Ok(())
    }

    pub fn abandon_workflow(&mut self, reason: &str) -> Result<(), EngineError> {
        self.ensure_active()?;
        let state = self.state.as_mut().expect("checked by ensure_active");
        state.status = WorkflowStatus::Abandoned;
        state
            .metadata
            .insert("abandon_reason".to_string(), json!(reason));
        let workflow_id = state.workflow_id.clone();
        self.save_state()?;
        self.log_event(&WorkflowEvent::new(
            EventType::WorkflowAbandoned,
            &workflow_id,
            format!("Workflow abandoned: {reason}"),
        ));
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), EngineError> {
        let state = self.state.as_ref().ok_or(EngineError::NoActiveWorkflow)?;
        if state.is_terminal() {
            return Err(EngineError::TerminalWorkflow {
                status: state.status.to_string(),
            });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Item operations
    // ------------------------------------------------------------------

    /// Item definition and a validity check that the item belongs to the
    /// current phase. Returns a cloned definition so callers can mutate
    /// state freely afterwards.
    fn validate_item_in_current_phase(
        &self,
        item_id: &str,
    ) -> Result<ChecklistItemDef, EngineError> {
        self.ensure_active()?;
        let state = self.state.as_ref().expect("checked by ensure_active");
        let def = self
            .workflow_def
            .as_ref()
            .ok_or(EngineError::NoActiveWorkflow)?;

        let current = state
            .current_phase()
            .ok_or_else(|| EngineError::UnknownPhase {
                phase_id: state.current_phase_id.clone(),
            })?;

        if !current.items.contains_key(item_id) {
            let exists_elsewhere = state.phases.values().any(|p| p.items.contains_key(item_id));
            return Err(if exists_elsewhere {
                EngineError::ItemNotInCurrentPhase {
                    item_id: item_id.to_string(),
                    phase_id: state.current_phase_id.clone(),
                }
            } else {
                EngineError::ItemNotFound {
                    item_id: item_id.to_string(),
                }
            });
        }

        def.get_phase(&state.current_phase_id)
            .and_then(|p| p.item(item_id))
            .cloned()
            .ok_or_else(|| EngineError::ItemNotFound {
                item_id: item_id.to_string(),
            })
    }

    fn item_state_mut(&mut self, item_id: &str) -> &mut ItemState {
        self.state
            .as_mut()
            .expect("validated")
            .current_phase_mut()
            .expect("validated")
            .items
            .get_mut(item_id)
            .expect("validated")
    }

    /// Mark an item in progress.
    pub fn start_item(&mut self, item_id: &str) -> Result<(), EngineError> {
        self.validate_item_in_current_phase(item_id)?;

        let item = self.item_state_mut(item_id);
        if !matches!(item.status, ItemStatus::Pending | ItemStatus::Failed) {
            return Err(EngineError::ItemNotStartable {
                item_id: item_id.to_string(),
                status: item.status.to_string(),
            });
        }
        item.status = ItemStatus::InProgress;
        item.started_at = Some(Utc::now());

        let (workflow_id, phase_id) = self.ids();
        self.save_state()?;
        self.log_event(
            &WorkflowEvent::new(
                EventType::ItemStarted,
                &workflow_id,
                format!("Started item: {item_id}"),
            )
            .phase(&phase_id)
            .item(item_id),
        );
        Ok(())
    }

    /// Attempt to complete an item, dispatching on its step type.
    ///
    /// Gate steps execute their verification command; documented steps
    /// validate evidence for schema and depth before storing it; required
    /// and flexible steps complete without evidence. Returns
    /// `(success, message)` - refusals are outcomes, not errors.
    pub async fn complete_item(
        &mut self,
        item_id: &str,
        notes: Option<String>,
        evidence: Option<Value>,
        skip_verification: bool,
    ) -> Result<(bool, String), EngineError> {
        let item_def = self.validate_item_in_current_phase(item_id)?;

        if let Some(notes) = &notes {
            let len = notes.chars().count();
            if len > MAX_NOTE_LENGTH {
                return Err(EngineError::InputTooLong("Note", MAX_NOTE_LENGTH, len));
            }
        }

        let (workflow_id, phase_id) = self.ids();

        match self.item_state_mut(item_id).status {
            ItemStatus::Completed => return Ok((true, "Item already completed".to_string())),
            ItemStatus::Skipped => {
                return Ok((false, "Item was skipped, cannot complete".to_string()))
            }
            _ => {}
        }

        // Gate steps: run the hard gate command.
        if item_def.step_type == StepType::Gate {
            if item_def.verification.kind == VerificationType::Command {
                let (gate_ok, gate_message) = self.execute_gate(&item_def).await?;
                if !gate_ok {
                    return Ok((false, gate_message));
                }
            }
        }

        // Documented steps: validate evidence before storing it.
        if item_def.step_type == StepType::Documented {
            match (&evidence, &item_def.evidence_schema) {
                (Some(evidence_value), Some(schema_name)) => {
                    let (valid, error) = validate_evidence_depth(schema_name, evidence_value);
                    if !valid {
                        let error = error.unwrap_or_else(|| "invalid evidence".to_string());
                        self.log_event(
                            &WorkflowEvent::new(
                                EventType::EvidenceRejected,
                                &workflow_id,
                                format!("Evidence validation failed: {error}"),
                            )
                            .phase(&phase_id)
                            .item(item_id)
                            .details(json!({"error": error})),
                        );
                        return Ok((false, format!("Evidence validation failed: {error}")));
                    }
                    self.item_state_mut(item_id).evidence = Some(evidence_value.clone());
                    self.log_event(
                        &WorkflowEvent::new(
                            EventType::EvidenceValidated,
                            &workflow_id,
                            "Evidence validated and stored",
                        )
                        .phase(&phase_id)
                        .item(item_id)
                        .details(json!({"evidence_schema": schema_name})),
                    );
                }
                (Some(evidence_value), None) => {
                    // No schema declared; store as-is.
                    self.item_state_mut(item_id).evidence = Some(evidence_value.clone());
                }
                (None, _) => {
                    return Ok((
                        false,
                        format!("Item '{item_id}' is a documented step and requires evidence"),
                    ));
                }
            }
        }

        // Standard verification (gates already ran theirs above).
        if item_def.step_type != StepType::Gate
            && !skip_verification
            && item_def.verification.kind != VerificationType::None
        {
            if item_def.verification.kind == VerificationType::ManualGate {
                if self.should_skip_gate(&item_def) {
                    let item = self.item_state_mut(item_id);
                    item.status = ItemStatus::Skipped;
                    item.skipped_at = Some(Utc::now());
                    item.skip_reason = Some("Auto-skipped (zero_human mode)".to_string());
                    self.save_state()?;
                    self.log_event(
                        &WorkflowEvent::new(
                            EventType::ItemSkipped,
                            &workflow_id,
                            format!("Manual gate auto-skipped (zero_human mode): {item_id}"),
                        )
                        .phase(&phase_id)
                        .item(item_id)
                        .details(json!({
                            "supervision_mode": "zero_human",
                            "gate_name": item_def.name,
                        })),
                    );
                    return Ok((true, "Item auto-skipped (zero_human mode)".to_string()));
                }
                return Ok((
                    false,
                    format!(
                        "Item '{item_id}' requires manual approval. Use 'warden approve-item {item_id}' to approve."
                    ),
                ));
            }

            let (ok, message, result) = self.run_verification(&item_def).await;
            self.item_state_mut(item_id).verification_result = Some(result.clone());

            if !ok {
                let item = self.item_state_mut(item_id);
                item.status = ItemStatus::Failed;
                item.retry_count += 1;
                self.save_state()?;
                self.log_event(
                    &WorkflowEvent::new(
                        EventType::VerificationFailed,
                        &workflow_id,
                        format!("Verification failed: {message}"),
                    )
                    .phase(&phase_id)
                    .item(item_id)
                    .details(result),
                );
                return Ok((false, format!("Verification failed: {message}")));
            }

            self.log_event(
                &WorkflowEvent::new(EventType::VerificationPassed, &workflow_id, "Verification passed")
                    .phase(&phase_id)
                    .item(item_id)
                    .details(result),
            );
        }

        let step_type = item_def.step_type;
        let has_evidence = evidence.is_some();
        {
            let item = self.item_state_mut(item_id);
            item.status = ItemStatus::Completed;
            item.completed_at = Some(Utc::now());
            if let Some(notes) = notes.clone() {
                item.notes = Some(notes);
            }
        }
        self.save_state()?;
        self.log_event(
            &WorkflowEvent::new(
                EventType::ItemCompleted,
                &workflow_id,
                format!("Completed item: {item_id}"),
            )
            .phase(&phase_id)
            .item(item_id)
            .details(json!({
                "notes": notes,
                "step_type": step_type.to_string(),
                "has_evidence": has_evidence,
            })),
        );

        Ok((true, "Item completed successfully".to_string()))
    }

    /// Skip an item with a documented reason.
    ///
    /// Gate steps refuse unless forced with a detailed (≥50 char) reason;
    /// required steps always refuse. Documented steps run the strict
    /// reasoning validator; flexible steps get the light length check.
    pub fn skip_item(
        &mut self,
        item_id: &str,
        reason: &str,
        context_considered: Option<Vec<String>>,
        force: bool,
    ) -> Result<(bool, String), EngineError> {
        let item_def = self.validate_item_in_current_phase(item_id)?;
        let (workflow_id, phase_id) = self.ids();

        let step_type = item_def.step_type;

        if step_type == StepType::Gate {
            if !force {
                return Ok((
                    false,
                    format!("Item {item_id} is a gate step and cannot be skipped. Use force to override."),
                ));
            }
            let len = reason.trim().chars().count();
            if len < skip::MIN_SKIP_REASON_LENGTH {
                return Ok((
                    false,
                    format!(
                        "Force-skipping a gate requires a detailed reason (at least {} characters). Got {len}.",
                        skip::MIN_SKIP_REASON_LENGTH
                    ),
                ));
            }
        }

        if step_type == StepType::Required {
            return Ok((
                false,
                format!("Item {item_id} is a required step and cannot be skipped"),
            ));
        }

        // Strict phases refuse non-forced skips regardless of step type.
        if !force {
            let phase_type = self
                .workflow_def
                .as_ref()
                .and_then(|d| d.get_phase(&phase_id))
                .and_then(|p| p.phase_type);
            if phase_type == Some(PhaseType::Strict) {
                return Ok((
                    false,
                    format!("Phase {phase_id} is strict; items cannot be skipped without force"),
                ));
            }
        }

        if !item_def.skippable && !(force && step_type == StepType::Gate) {
            return Ok((false, format!("Item {item_id} is not skippable")));
        }

        {
            let item = self.item_state_mut(item_id);
            if item.is_terminal() {
                let status = item.status.to_string();
                return Ok((false, format!("Item {item_id} is already {status}")));
            }
        }

        if step_type == StepType::Documented {
            let (valid, error) = validate_skip_reasoning(reason);
            if !valid {
                let error = error.unwrap_or_else(|| "invalid reasoning".to_string());
                self.log_event(
                    &WorkflowEvent::new(
                        EventType::SkipRejected,
                        &workflow_id,
                        format!("Skip reasoning rejected: {error}"),
                    )
                    .phase(&phase_id)
                    .item(item_id)
                    .details(json!({"reason": reason, "error": error})),
                );
                return Ok((false, format!("Skip reasoning rejected: {error}")));
            }
            self.log_event(
                &WorkflowEvent::new(EventType::SkipValidated, &workflow_id, "Skip reasoning validated")
                    .phase(&phase_id)
                    .item(item_id)
                    .details(json!({"reason_length": reason.chars().count()})),
            );
        } else {
            let (valid, error) = validate_flexible_reason(reason);
            if !valid {
                return Ok((false, error.unwrap_or_else(|| "invalid reason".to_string())));
            }
        }

        let is_force_skipped = force && step_type == StepType::Gate;
        {
            let item = self.item_state_mut(item_id);
            item.status = ItemStatus::Skipped;
            item.skipped_at = Some(Utc::now());
            item.skip_reason = Some(reason.to_string());
            if let Some(context) = context_considered.clone() {
                item.skip_context_considered = context;
            }
        }
        self.save_state()?;
        self.log_event(
            &WorkflowEvent::new(
                EventType::ItemSkipped,
                &workflow_id,
                format!(
                    "{} item: {item_id}",
                    if is_force_skipped { "Force-skipped" } else { "Skipped" }
                ),
            )
            .phase(&phase_id)
            .item(item_id)
            .details(json!({
                "reason": reason,
                "step_type": step_type.to_string(),
                "context_considered": context_considered,
                "force_skipped": is_force_skipped,
            })),
        );

        if is_force_skipped {
            Ok((
                true,
                format!("Item {item_id} force-skipped (gate verification bypassed)"),
            ))
        } else {
            Ok((true, format!("Item {item_id} skipped")))
        }
    }

    /// Approve a manual-gate item on behalf of a human operator.
    pub fn approve_item(
        &mut self,
        item_id: &str,
        notes: Option<String>,
    ) -> Result<(bool, String), EngineError> {
        let item_def = self.validate_item_in_current_phase(item_id)?;

        if item_def.verification.kind != VerificationType::ManualGate {
            return Ok((false, format!("Item '{item_id}' is not a manual gate item")));
        }

        let (workflow_id, phase_id) = self.ids();
        {
            let item = self.item_state_mut(item_id);
            if item.status == ItemStatus::Completed {
                return Ok((true, "Item already approved".to_string()));
            }
            item.status = ItemStatus::Completed;
            item.completed_at = Some(Utc::now());
            item.verification_result = Some(json!({
                "approved": true,
                "approved_at": Utc::now().to_rfc3339(),
                "type": "manual_gate",
            }));
            if let Some(notes) = notes.clone() {
                item.notes = Some(notes);
            }
        }
        self.save_state()?;
        self.log_event(
            &WorkflowEvent::new(
                EventType::ItemCompleted,
                &workflow_id,
                format!("Approved manual gate: {item_id}"),
            )
            .phase(&phase_id)
            .item(item_id)
            .details(json!({"notes": notes, "approved": true}))
            .by_human(),
        );

        Ok((true, format!("Item '{item_id}' approved")))
    }

    // ------------------------------------------------------------------
    // Phase operations
    // ------------------------------------------------------------------

    /// Whether the current phase can be advanced.
    /// Returns `(can_advance, blockers, skipped_items)`.
    pub fn can_advance_phase(&self) -> (bool, Vec<String>, Vec<String>) {
        let (Some(state), Some(def)) = (self.state.as_ref(), self.workflow_def.as_ref()) else {
            return (false, vec!["No active workflow".to_string()], Vec::new());
        };
        let (Some(phase_def), Some(phase_state)) = (
            def.get_phase(&state.current_phase_id),
            state.current_phase(),
        ) else {
            return (false, vec!["Invalid phase".to_string()], Vec::new());
        };

        let mut blockers = Vec::new();
        let mut skipped = Vec::new();

        for item_def in &phase_def.items {
            let Some(item_state) = phase_state.items.get(&item_def.id) else {
                continue;
            };
            if item_state.status == ItemStatus::Skipped {
                skipped.push(format!(
                    "{}: {}",
                    item_def.id,
                    item_state.skip_reason.as_deref().unwrap_or("No reason provided")
                ));
            } else if item_def.required && item_state.status != ItemStatus::Completed {
                blockers.push(format!("{} ({})", item_def.id, item_state.status));
            }
        }

        if phase_def.exit_gate.as_deref() == Some("human_approval") {
            let approved = state
                .metadata
                .get(&format!("phase_{}_approved", phase_def.id))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !approved {
                blockers.push("Awaiting human approval".to_string());
            }
        }

        (blockers.is_empty(), blockers, skipped)
    }

    /// Advance to the next phase in declaration order.
    /// Returns `(success, message)`; hitting the end of the phase list is
    /// a successful terminal signal, not an error.
    pub fn advance_phase(&mut self, force: bool) -> Result<(bool, String), EngineError> {
        self.ensure_active()?;

        let (can_advance, blockers, skipped) = self.can_advance_phase();
        if !can_advance && !force {
            return Ok((false, format!("Cannot advance. Blockers: {}", blockers.join(", "))));
        }

        let (workflow_id, current_phase_id) = self.ids();
        self.complete_current_phase(&workflow_id, &current_phase_id, &skipped, force)?;

        let next = self
            .workflow_def
            .as_ref()
            .and_then(|d| d.get_next_phase(&current_phase_id))
            .map(|p| (p.id.clone(), p.name.clone()));

        let Some((next_id, next_name)) = next else {
            self.save_state()?;
            return Ok((
                true,
                "All phases completed. Use 'finish' to complete the workflow.".to_string(),
            ));
        };

        self.activate_phase(&workflow_id, &next_id, &next_name)?;
        Ok((true, format!("Advanced to phase: {next_name}")))
    }

    /// Advance directly to `target_phase_id` along a transition the caller
    /// has already validated (token, artifacts, gate). Marks the current
    /// phase completed and activates the target.
    pub fn advance_to(&mut self, target_phase_id: &str) -> Result<(), EngineError> {
        self.ensure_active()?;

        let target = self
            .workflow_def
            .as_ref()
            .and_then(|d| d.get_phase(target_phase_id))
            .map(|p| (p.id.clone(), p.name.clone()))
            .ok_or_else(|| EngineError::UnknownPhase {
                phase_id: target_phase_id.to_string(),
            })?;

        let (workflow_id, current_phase_id) = self.ids();
        let (_, _, skipped) = self.can_advance_phase();
        self.complete_current_phase(&workflow_id, &current_phase_id, &skipped, false)?;
        self.activate_phase(&workflow_id, &target.0, &target.1)?;
        Ok(())
    }

    fn complete_current_phase(
        &mut self,
        workflow_id: &str,
        phase_id: &str,
        skipped: &[String],
        forced: bool,
    ) -> Result<(), EngineError> {
        if let Some(phase) = self.state.as_mut().and_then(|s| s.current_phase_mut()) {
            phase.status = PhaseStatus::Completed;
            phase.completed_at = Some(Utc::now());
        }
        self.log_event(
            &WorkflowEvent::new(
                EventType::PhaseCompleted,
                workflow_id,
                format!("Completed phase: {phase_id}"),
            )
            .phase(phase_id)
            .details(json!({"skipped_items": skipped, "forced": forced})),
        );
        Ok(())
    }

    fn activate_phase(
        &mut self,
        workflow_id: &str,
        phase_id: &str,
        phase_name: &str,
    ) -> Result<(), EngineError> {
        {
            let state = self.state.as_mut().expect("checked by caller");
            state.current_phase_id = phase_id.to_string();
            if let Some(phase) = state.phases.get_mut(phase_id) {
                phase.status = PhaseStatus::Active;
                phase.started_at = Some(Utc::now());
            }
        }
        self.save_state()?;
        self.log_event(
            &WorkflowEvent::new(
                EventType::PhaseStarted,
                workflow_id,
                format!("Started phase: {phase_name}"),
            )
            .phase(phase_id),
        );
        Ok(())
    }

    /// Record human approval for a phase's exit gate.
    pub fn approve_phase(&mut self, phase_id: Option<&str>) -> Result<(bool, String), EngineError> {
        self.ensure_active()?;
        let state = self.state.as_mut().expect("checked by ensure_active");
        let phase_id = phase_id
            .map(str::to_string)
            .unwrap_or_else(|| state.current_phase_id.clone());

        state
            .metadata
            .insert(format!("phase_{phase_id}_approved"), json!(true));
        state.metadata.insert(
            format!("phase_{phase_id}_approved_at"),
            json!(Utc::now().to_rfc3339()),
        );
        let workflow_id = state.workflow_id.clone();
        self.save_state()?;
        self.log_event(
            &WorkflowEvent::new(
                EventType::HumanOverride,
                &workflow_id,
                format!("Human approved phase: {phase_id}"),
            )
            .phase(&phase_id)
            .by_human(),
        );
        Ok((true, format!("Phase {phase_id} approved")))
    }

    // ------------------------------------------------------------------
    // Supervision
    // ------------------------------------------------------------------

    /// Whether a manual gate should be auto-skipped under the current
    /// supervision mode.
    pub fn should_skip_gate(&self, item: &ChecklistItemDef) -> bool {
        if item.verification.kind != VerificationType::ManualGate {
            return false;
        }
        match self.settings().supervision_mode {
            SupervisionMode::ZeroHuman => {
                tracing::warn!(
                    item = %item.id,
                    name = %item.name,
                    "[zero-human mode] skipping manual gate; no human approval required"
                );
                true
            }
            SupervisionMode::Hybrid => {
                tracing::info!(
                    item = %item.id,
                    "[hybrid mode] gate requires approval (hybrid logic reserved)"
                );
                false
            }
            SupervisionMode::Supervised => false,
        }
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    async fn execute_gate(
        &mut self,
        item_def: &ChecklistItemDef,
    ) -> Result<(bool, String), EngineError> {
        let (workflow_id, phase_id) = self.ids();
        let raw_command = item_def
            .verification
            .command
            .clone()
            .unwrap_or_default();

        let command = match self.substitute_template(&raw_command, true) {
            Ok(command) => command,
            Err(e) => return Ok((false, format!("Command blocked: {e}"))),
        };

        self.log_event(
            &WorkflowEvent::new(
                EventType::GateExecuted,
                &workflow_id,
                format!("Executing gate: {command}"),
            )
            .phase(&phase_id)
            .item(&item_def.id)
            .details(json!({"command": command})),
        );

        let result = self.gate_runner.execute(&command, &self.working_dir).await;

        let gate_result = json!({
            "success": result.success,
            "exit_code": result.exit_code,
            "stdout": truncate(&result.stdout),
            "stderr": truncate(&result.stderr),
            "command": command,
            "duration_seconds": result.duration_seconds,
            "error": result.error,
        });
        self.item_state_mut(&item_def.id).gate_result = Some(gate_result.clone());

        if result.success {
            self.log_event(
                &WorkflowEvent::new(
                    EventType::GatePassed,
                    &workflow_id,
                    format!("Gate passed: {}", item_def.id),
                )
                .phase(&phase_id)
                .item(&item_def.id)
                .details(gate_result),
            );
            Ok((true, "Gate passed".to_string()))
        } else {
            {
                let item = self.item_state_mut(&item_def.id);
                item.retry_count += 1;
            }
            self.save_state()?;
            self.log_event(
                &WorkflowEvent::new(
                    EventType::GateFailed,
                    &workflow_id,
                    format!("Gate failed: {}", item_def.id),
                )
                .phase(&phase_id)
                .item(&item_def.id)
                .details(gate_result),
            );
            let detail = if !result.stderr.is_empty() {
                truncate(&result.stderr)
            } else {
                result.error.unwrap_or_else(|| "Unknown error".to_string())
            };
            Ok((
                false,
                format!("Gate failed (exit code {}): {detail}", result.exit_code),
            ))
        }
    }

    async fn run_verification(&self, item_def: &ChecklistItemDef) -> (bool, String, Value) {
        let verification = &item_def.verification;
        let mut result = json!({
            "type": serde_json::to_value(verification.kind).unwrap_or(Value::Null),
            "timestamp": Utc::now().to_rfc3339(),
        });

        match verification.kind {
            VerificationType::FileExists => {
                let raw_path = verification.path.clone().unwrap_or_default();
                let file_path = match self.substitute_template(&raw_path, false) {
                    Ok(p) => p,
                    Err(e) => {
                        result["error"] = json!(e.to_string());
                        return (false, format!("Path blocked: {e}"), result);
                    }
                };
                let Some(resolved) = normalize_under(&self.working_dir, &file_path) else {
                    result["blocked"] = json!(true);
                    result["reason"] = json!("path_traversal");
                    return (false, format!("Path traversal blocked: {file_path}"), result);
                };
                let exists = resolved.exists();
                result["path"] = json!(resolved.display().to_string());
                result["exists"] = json!(exists);
                if exists {
                    (true, format!("File exists: {file_path}"), result)
                } else {
                    (false, format!("File not found: {file_path}"), result)
                }
            }
            VerificationType::Command => {
                let raw_command = verification.command.clone().unwrap_or_default();
                let command = match self.substitute_template(&raw_command, true) {
                    Ok(c) => c,
                    Err(e) => {
                        result["error"] = json!(e.to_string());
                        result["blocked"] = json!(true);
                        return (false, format!("Command blocked: {e}"), result);
                    }
                };

                let run = self.gate_runner.execute(&command, &self.working_dir).await;
                result["command"] = json!(command);
                result["exit_code"] = json!(run.exit_code);
                result["stdout"] = json!(truncate(&run.stdout));
                result["stderr"] = json!(truncate(&run.stderr));
                if let Some(error) = &run.error {
                    result["error"] = json!(error);
                    return (false, error.clone(), result);
                }

                if run.exit_code == verification.expect_exit_code {
                    (
                        true,
                        format!("Command passed (exit code {})", run.exit_code),
                        result,
                    )
                } else {
                    (
                        false,
                        format!(
                            "Command failed (exit code {}, expected {})",
                            run.exit_code, verification.expect_exit_code
                        ),
                        result,
                    )
                }
            }
            VerificationType::ManualGate => {
                result["awaiting_approval"] = json!(true);
                (
                    false,
                    "Awaiting manual approval. Use 'warden approve-item <item_id>' to approve."
                        .to_string(),
                    result,
                )
            }
            VerificationType::None => (true, "No verification configured".to_string(), result),
        }
    }

    // ------------------------------------------------------------------
    // Template substitution
    // ------------------------------------------------------------------

    /// Substitute `{{var}}` with values from workflow settings. With
    /// `sanitize_for_shell`, values containing shell metacharacters are
    /// rejected outright.
    pub fn substitute_template(
        &self,
        text: &str,
        sanitize_for_shell: bool,
    ) -> anyhow::Result<String> {
        let Some(def) = self.workflow_def.as_ref() else {
            return Ok(text.to_string());
        };
        if text.is_empty() || def.settings.is_empty() {
            return Ok(text.to_string());
        }

        let mut output = String::with_capacity(text.len());
        let mut last_end = 0;
        for caps in template_pattern().captures_iter(text) {
            let full = caps.get(0).expect("capture 0 always present");
            let key = &caps[1];
            output.push_str(&text[last_end..full.start()]);

            match def.setting_str(key) {
                Some(value) => {
                    if sanitize_for_shell && dangerous_pattern().is_match(&value) {
                        anyhow::bail!("Unsafe characters in setting '{key}': {value}");
                    }
                    output.push_str(&value);
                }
                // Unknown variables are left as-is.
                None => output.push_str(full.as_str()),
            }
            last_end = full.end();
        }
        output.push_str(&text[last_end..]);
        Ok(output)
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Skipped items for a phase, as `(item_id, reason)` pairs.
    pub fn skipped_items(&self, phase_id: &str) -> Vec<(String, String)> {
        let Some(state) = self.state.as_ref() else {
            return Vec::new();
        };
        let Some(phase) = state.phases.get(phase_id) else {
            return Vec::new();
        };
        phase
            .items
            .iter()
            .filter(|(_, item)| item.status == ItemStatus::Skipped)
            .map(|(id, item)| {
                (
                    id.clone(),
                    item.skip_reason
                        .clone()
                        .unwrap_or_else(|| "No reason provided".to_string()),
                )
            })
            .collect()
    }

    /// Per-phase completed/skipped/total counts.
    pub fn workflow_summary(&self) -> BTreeMap<String, PhaseSummary> {
        let Some(state) = self.state.as_ref() else {
            return BTreeMap::new();
        };
        state
            .phases
            .iter()
            .map(|(phase_id, phase)| {
                let completed = phase
                    .items
                    .values()
                    .filter(|i| i.status == ItemStatus::Completed)
                    .count();
                let skipped = phase
                    .items
                    .values()
                    .filter(|i| i.status == ItemStatus::Skipped)
                    .count();
                (
                    phase_id.clone(),
                    PhaseSummary {
                        completed,
                        skipped,
                        total: phase.items.len(),
                    },
                )
            })
            .collect()
    }

    fn ids(&self) -> (String, String) {
        let state = self.state.as_ref().expect("caller validated state");
        (state.workflow_id.clone(), state.current_phase_id.clone())
    }
}

fn truncate(s: &str) -> String {
    s.chars().take(OUTPUT_TRUNCATE_LENGTH).collect()
}

/// Filename-safe slug of a task description.
fn slugify(text: &str, max_length: usize) -> String {
    let mut slug = String::new();
    let mut last_dash = true;
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
        if slug.len() >= max_length {
            break;
        }
    }
    slug.trim_matches('-').to_string()
}

fn template_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{(\w+)\}\}").expect("template pattern must compile"))
}

fn dangerous_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"[;&|`$(){}\[\]<>\\!\n\r]").expect("dangerous pattern must compile")
    })
}

/// Lexically resolve `relative` under `base`; `None` if the result would
/// escape `base`.
fn normalize_under(base: &Path, relative: &str) -> Option<PathBuf> {
    let joined = base.join(relative);
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }
    if normalized.starts_with(base) {
        Some(normalized)
    } else {
        None
    }
}
