//! Runtime state for a workflow instance, plus the typed event log.
//!
//! State is owned by the engine and mutated only through it; everything
//! here is plain serializable data. The workflow definition is frozen into
//! the state at start (version lock) so an instance always runs under the
//! rules it started with, even if the document on disk changes.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::workflow::WorkflowDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
    Skipped,
    Blocked,
    Failed,
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ItemStatus::Pending => "pending",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Completed => "completed",
            ItemStatus::Skipped => "skipped",
            ItemStatus::Blocked => "blocked",
            ItemStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Active,
    Completed,
    Blocked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
    Paused,
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkflowStatus::Active => "active",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Abandoned => "abandoned",
            WorkflowStatus::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemState {
    pub id: String,
    #[serde(default)]
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub skip_context_considered: Vec<String>,
    /// Result of the last verification run (file/command/manual).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_result: Option<Value>,
    /// Result of the last hard-gate execution, for gate steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_result: Option<Value>,
    /// Validated evidence, for documented steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<Value>,
    #[serde(default)]
    pub retry_count: u32,
    /// Advisory: files the agent reports touching for this item.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_modified: Vec<String>,
}

impl ItemState {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            status: ItemStatus::Pending,
            started_at: None,
            completed_at: None,
            skipped_at: None,
            notes: None,
            skip_reason: None,
            skip_context_considered: Vec::new(),
            verification_result: None,
            gate_result: None,
            evidence: None,
            retry_count: 0,
            files_modified: Vec::new(),
        }
    }

    /// Completed and skipped are terminal for an item.
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ItemStatus::Completed | ItemStatus::Skipped)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseState {
    pub id: String,
    #[serde(default)]
    pub status: PhaseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub items: BTreeMap<String, ItemState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub workflow_type: String,
    pub workflow_version: String,
    pub task_description: String,
    #[serde(default)]
    pub constraints: Vec<String>,
    pub current_phase_id: String,
    pub phases: BTreeMap<String, PhaseState>,
    #[serde(default)]
    pub status: WorkflowStatus,
    /// Version-locked copy of the definition this instance runs under.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_definition: Option<WorkflowDef>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl WorkflowState {
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            WorkflowStatus::Completed | WorkflowStatus::Abandoned
        )
    }

    pub fn current_phase(&self) -> Option<&PhaseState> {
        self.phases.get(&self.current_phase_id)
    }

    pub fn current_phase_mut(&mut self) -> Option<&mut PhaseState> {
        let id = self.current_phase_id.clone();
        self.phases.get_mut(&id)
    }
}

/// Typed events appended to the per-session workflow log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowCompleted,
    WorkflowAbandoned,
    PhaseStarted,
    PhaseCompleted,
    ItemStarted,
    ItemCompleted,
    ItemSkipped,
    SkipValidated,
    SkipRejected,
    EvidenceValidated,
    EvidenceRejected,
    GateExecuted,
    GatePassed,
    GateFailed,
    VerificationPassed,
    VerificationFailed,
    HumanOverride,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowEvent {
    pub event_type: EventType,
    pub workflow_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default = "default_actor")]
    pub actor: String,
    pub timestamp: DateTime<Utc>,
}

impl WorkflowEvent {
    pub fn new(event_type: EventType, workflow_id: &str, message: impl Into<String>) -> Self {
        Self {
            event_type,
            workflow_id: workflow_id.to_string(),
            phase_id: None,
            item_id: None,
            message: message.into(),
            details: None,
            actor: default_actor(),
            timestamp: Utc::now(),
        }
    }

    pub fn phase(mut self, phase_id: &str) -> Self {
        self.phase_id = Some(phase_id.to_string());
        self
    }

    pub fn item(mut self, item_id: &str) -> Self {
        self.item_id = Some(item_id.to_string());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn by_human(mut self) -> Self {
        self.actor = "human".to_string();
        self
    }
}

fn default_actor() -> String {
    "agent".to_string()
}
