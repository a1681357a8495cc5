//! Workflow definition: document types, YAML loader, structural validation.
//!
//! A workflow document declares phases (with tool allow/deny lists, required
//! artifacts, gates, and checklist items), transitions between phases, an
//! enforcement policy, and free-form settings. The definition is immutable
//! after load and shared read-only across the process.

pub mod defaults;
pub mod settings;

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::DefinitionError;

pub use settings::{EnforcementMode, SupervisionMode, WorkflowSettings};

/// How a checklist item is completed and skipped.
///
/// | Step type   | Complete                                  | Skip |
/// |-------------|-------------------------------------------|------|
/// | `gate`      | runs the verification command, must pass  | refused (force needs a ≥50 char reason) |
/// | `required`  | completes without evidence                | refused |
/// | `documented`| evidence validated for schema and depth   | strict reason validation |
/// | `flexible`  | completes without evidence                | light length check |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Gate,
    Required,
    Documented,
    #[default]
    Flexible,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepType::Gate => write!(f, "gate"),
            StepType::Required => write!(f, "required"),
            StepType::Documented => write!(f, "documented"),
            StepType::Flexible => write!(f, "flexible"),
        }
    }
}

/// Verification strategies for checklist items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationType {
    FileExists,
    Command,
    ManualGate,
    #[default]
    None,
}

/// Advisory phase classification. Only `strict` carries behavior today:
/// non-forced skips are refused in strict phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseType {
    Strict,
    #[default]
    Guided,
    Autonomous,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VerificationDef {
    #[serde(rename = "type", default)]
    pub kind: VerificationType,
    /// Command to run for `command` verification. May contain `{{setting}}`
    /// template variables.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Path to check for `file_exists` verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default)]
    pub expect_exit_code: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItemDef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub step_type: StepType,
    #[serde(default)]
    pub verification: VerificationDef,
    /// Named evidence schema for `documented` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_schema: Option<String>,
    #[serde(default = "default_true")]
    pub required: bool,
    #[serde(default = "default_true")]
    pub skippable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRequirement {
    /// Artifact type name, e.g. `plan_document`.
    #[serde(rename = "type")]
    pub type_name: String,
    /// Schema reference (short path) resolved by the artifact registry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockerDef {
    /// Checker name, resolved against the gate evaluator's closed set.
    pub check: String,
    #[serde(default = "default_severity")]
    pub severity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDef {
    pub id: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub gate_type: Option<String>,
    #[serde(default)]
    pub blockers: Vec<BlockerDef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseDef {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_type: Option<PhaseType>,
    pub allowed_tools: Vec<String>,
    #[serde(default)]
    pub forbidden_tools: Vec<String>,
    /// Advisory: tools the phase is expected to lean on.
    #[serde(default)]
    pub intended_tools: Vec<String>,
    #[serde(default)]
    pub required_artifacts: Vec<ArtifactRequirement>,
    #[serde(default)]
    pub gates: Vec<GateDef>,
    #[serde(default)]
    pub items: Vec<ChecklistItemDef>,
    /// Operator notes surfaced in status output.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Set to `human_approval` to require an approve_phase call before
    /// advancing out of this phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_gate: Option<String>,
}

impl PhaseDef {
    pub fn item(&self, item_id: &str) -> Option<&ChecklistItemDef> {
        self.items.iter().find(|i| i.id == item_id)
    }

    /// Tool admission: forbidden always wins, then allow-list, default deny.
    pub fn tool_allowed(&self, tool: &str) -> bool {
        if self.forbidden_tools.iter().any(|t| t == tool) {
            return false;
        }
        self.allowed_tools.iter().any(|t| t == tool)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDef {
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,
    #[serde(default = "default_true")]
    pub requires_token: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTokenConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
    #[serde(default = "default_secret_env_var")]
    pub secret_env_var: String,
    #[serde(default = "default_expiry_seconds")]
    pub expiry_seconds: i64,
}

impl Default for PhaseTokenConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: default_algorithm(),
            secret_env_var: default_secret_env_var(),
            expiry_seconds: default_expiry_seconds(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnforcementConfig {
    #[serde(default)]
    pub mode: EnforcementMode,
    #[serde(default)]
    pub phase_tokens: PhaseTokenConfig,
}

/// The immutable workflow definition, loaded once per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDef {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    pub phases: Vec<PhaseDef>,
    #[serde(default)]
    pub transitions: Vec<TransitionDef>,
    #[serde(default)]
    pub enforcement: EnforcementConfig,
    /// Free-form settings; template substitution and typed settings both
    /// read from this map.
    #[serde(default)]
    pub settings: BTreeMap<String, serde_yaml::Value>,
}

impl WorkflowDef {
    /// Load a workflow definition from a YAML file and validate its
    /// structure. Never returns a partially valid definition.
    pub fn load(path: &Path) -> Result<Self, DefinitionError> {
        let raw = std::fs::read_to_string(path).map_err(|_| DefinitionError::NotFound {
            path: path.to_path_buf(),
        })?;
        if raw.trim().is_empty() {
            return Err(DefinitionError::Empty {
                path: path.to_path_buf(),
            });
        }
        let def: WorkflowDef = serde_yaml::from_str(&raw).map_err(|source| DefinitionError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        def.validate()?;
        Ok(def)
    }

    /// Parse a definition from a YAML string (used for the bundled default
    /// document and by tests).
    pub fn from_yaml_str(raw: &str) -> Result<Self, DefinitionError> {
        let def: WorkflowDef = serde_yaml::from_str(raw).map_err(|source| DefinitionError::Yaml {
            path: "<inline>".into(),
            source,
        })?;
        def.validate()?;
        Ok(def)
    }

    /// Structural validation. Collects every problem rather than stopping at
    /// the first one.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        let mut problems = Vec::new();

        if self.phases.is_empty() {
            problems.push("Workflow must define at least one phase".to_string());
        }

        let mut seen = HashSet::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if phase.id.trim().is_empty() {
                problems.push(format!("Phase {i} has an empty id"));
            }
            if phase.name.trim().is_empty() {
                problems.push(format!("Phase {}: name must not be empty", phase.id));
            }
            if !seen.insert(phase.id.clone()) {
                problems.push(format!("Duplicate phase ID: {}", phase.id));
            }

            let overlap: Vec<&String> = phase
                .allowed_tools
                .iter()
                .filter(|t| phase.forbidden_tools.contains(t))
                .collect();
            if !overlap.is_empty() {
                // Tolerated at runtime (forbidden wins) but worth surfacing.
                tracing::warn!(
                    phase = %phase.id,
                    tools = ?overlap,
                    "tools listed as both allowed and forbidden; forbidden wins"
                );
            }

            for item in &phase.items {
                if item.step_type == StepType::Gate
                    && item.verification.kind != VerificationType::Command
                {
                    problems.push(format!(
                        "Phase {}: gate item '{}' must have a command verification",
                        phase.id, item.id
                    ));
                }
                if item.verification.kind == VerificationType::Command
                    && item.verification.command.is_none()
                {
                    problems.push(format!(
                        "Phase {}: item '{}' has command verification but no command",
                        phase.id, item.id
                    ));
                }
                if item.verification.kind == VerificationType::FileExists
                    && item.verification.path.is_none()
                {
                    problems.push(format!(
                        "Phase {}: item '{}' has file_exists verification but no path",
                        phase.id, item.id
                    ));
                }
            }
        }

        let phase_ids: HashSet<&str> = self.phases.iter().map(|p| p.id.as_str()).collect();
        for (i, transition) in self.transitions.iter().enumerate() {
            if !phase_ids.contains(transition.from.as_str()) {
                problems.push(format!(
                    "Transition {i}: 'from' phase '{}' not defined",
                    transition.from
                ));
            }
            if !phase_ids.contains(transition.to.as_str()) {
                problems.push(format!(
                    "Transition {i}: 'to' phase '{}' not defined",
                    transition.to
                ));
            }
            if let Some(gate_id) = &transition.gate {
                if self.get_gate(gate_id).is_none() {
                    problems.push(format!("Transition {i}: gate '{gate_id}' not defined"));
                }
            }
        }

        let tokens = &self.enforcement.phase_tokens;
        if tokens.enabled && tokens.expiry_seconds <= 0 {
            problems.push("phase_tokens.expiry_seconds must be positive".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(DefinitionError::Structural { problems })
        }
    }

    pub fn get_phase(&self, phase_id: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// The phase after `phase_id` in declaration order, if any.
    pub fn get_next_phase(&self, phase_id: &str) -> Option<&PhaseDef> {
        let idx = self.phases.iter().position(|p| p.id == phase_id)?;
        self.phases.get(idx + 1)
    }

    /// Gates live inside phases; look one up by id across all phases.
    pub fn get_gate(&self, gate_id: &str) -> Option<&GateDef> {
        self.phases
            .iter()
            .flat_map(|p| p.gates.iter())
            .find(|g| g.id == gate_id)
    }

    pub fn find_transition(&self, from: &str, to: &str) -> Option<&TransitionDef> {
        self.transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
    }

    /// Typed view of the settings map.
    pub fn typed_settings(&self) -> WorkflowSettings {
        WorkflowSettings::from_map(&self.settings)
    }

    /// A settings value rendered as a plain string, if present and scalar.
    pub fn setting_str(&self, key: &str) -> Option<String> {
        match self.settings.get(key)? {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_severity() -> String {
    "blocking".to_string()
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

fn default_secret_env_var() -> String {
    "ORCHESTRATOR_JWT_SECRET".to_string()
}

fn default_expiry_seconds() -> i64 {
    7200
}
